use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Ticket taxonomy ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Refactor,
    Docs,
    Test,
    Perf,
    Security,
    Fix,
    Cleanup,
    Types,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refactor => "refactor",
            Self::Docs => "docs",
            Self::Test => "test",
            Self::Perf => "perf",
            Self::Security => "security",
            Self::Fix => "fix",
            Self::Cleanup => "cleanup",
            Self::Types => "types",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "refactor" => Some(Self::Refactor),
            "docs" => Some(Self::Docs),
            "test" => Some(Self::Test),
            "perf" => Some(Self::Perf),
            "security" => Some(Self::Security),
            "fix" => Some(Self::Fix),
            "cleanup" => Some(Self::Cleanup),
            "types" => Some(Self::Types),
            _ => None,
        }
    }

    pub fn all() -> [Self; 8] {
        [
            Self::Refactor,
            Self::Docs,
            Self::Test,
            Self::Perf,
            Self::Security,
            Self::Fix,
            Self::Cleanup,
            Self::Types,
        ]
    }

    /// Categories that skip the PLAN phase entirely.
    pub fn plan_exempt(&self) -> bool {
        matches!(self, Self::Docs | Self::Cleanup | Self::Types)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Ready,
    InProgress,
    Leased,
    Blocked,
    Done,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Leased => "leased",
            Self::Blocked => "blocked",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ready" => Some(Self::Ready),
            "in_progress" => Some(Self::InProgress),
            "leased" => Some(Self::Leased),
            "blocked" => Some(Self::Blocked),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Medium,
    High,
}

impl Default for Risk {
    fn default() -> Self {
        Self::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Trivial,
    Simple,
    Moderate,
    Complex,
}

impl Default for Complexity {
    fn default() -> Self {
        Self::Moderate
    }
}

impl Complexity {
    /// Trivial and simple tickets drive adaptive wave parallelism upward.
    pub fn is_light(&self) -> bool {
        matches!(self, Self::Trivial | Self::Simple)
    }
}

// ── Delivery ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Commits accumulate on a single working branch; nothing is pushed.
    Direct,
    /// Tickets merge into a long-lived milestone branch; one PR per milestone.
    Milestone,
    /// One PR per ticket.
    Pr,
    /// One PR per ticket, with `gh pr merge --auto` attempted.
    AutoMerge,
}

impl DeliveryMode {
    pub fn uses_prs(&self) -> bool {
        matches!(self, Self::Milestone | Self::Pr | Self::AutoMerge)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Milestone => "milestone",
            Self::Pr => "pr",
            Self::AutoMerge => "auto_merge",
        }
    }
}

impl Default for DeliveryMode {
    fn default() -> Self {
        Self::Pr
    }
}

// ── Persistent records (Store) ───────────────────────────────────────────

/// The repository this engine owns. One per process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub root_path: String,
    pub created_at: DateTime<Utc>,
}

/// Optional metadata carried from the scout proposal into the ticket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scout_confidence: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_complexity: Option<Complexity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
}

/// A unit of work as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub description: String,
    pub category: Category,
    pub status: TicketStatus,
    /// Globs the agent may modify. Non-empty for any ticket that can touch code.
    pub allowed_paths: Vec<String>,
    /// Globs the agent must never modify.
    pub forbidden_paths: Vec<String>,
    /// Shell commands that must pass for the ticket to be accepted.
    pub verification_commands: Vec<String>,
    pub metadata: TicketMetadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    Worker,
    Session,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Session => "session",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// One execution attempt of a ticket (worker) or a whole session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub project_id: i64,
    pub run_type: RunType,
    pub ticket_id: Option<i64>,
    pub status: RunStatus,
    pub branch: Option<String>,
    pub pr_url: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Git,
    Command,
    Internal,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::Command => "command",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Queued,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Ordered sub-step of a run (worktree, agent, scope, commit, push, qa, pr, cleanup).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    pub id: i64,
    pub run_id: i64,
    pub ordinal: i64,
    pub name: String,
    pub kind: StepKind,
    pub status: StepStatus,
    pub duration_ms: i64,
    pub error: Option<String>,
}

// ── Scout output ─────────────────────────────────────────────────────────

/// A candidate ticket produced by the scout phase, pre-filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub category: Category,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub verification_commands: Vec<String>,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    /// 0–100.
    pub confidence: u8,
    /// 1–10.
    pub impact_score: u8,
    #[serde(default)]
    pub risk: Risk,
    #[serde(default)]
    pub estimated_complexity: Complexity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_note: Option<String>,
}

// ── Agent execution result ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    NoChangesNeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    QaFailed,
    ScopeViolation,
    SpindleAbort,
    AgentError,
    Timeout,
}

impl FailureReason {
    /// Tag value used when synthesizing a learning from this failure.
    pub fn failure_type(&self) -> &'static str {
        match self {
            Self::QaFailed => "qa",
            Self::ScopeViolation => "scope",
            Self::SpindleAbort => "spindle",
            Self::AgentError => "agent",
            Self::Timeout => "timeout",
        }
    }
}

/// Spindle detail attached to a loop-detected failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpindleIncident {
    pub signal: String,
    pub confidence: f64,
    #[serde(default)]
    pub detail: String,
}

/// Structured result returned by the external agent for one ticket attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_outcome: Option<CompletionOutcome>,
    #[serde(default)]
    pub scope_expanded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spindle: Option<SpindleIncident>,
    #[serde(default)]
    pub changed_files: Vec<String>,
}

impl TicketOutcome {
    pub fn failed(reason: FailureReason, error: impl Into<String>) -> Self {
        Self {
            success: false,
            failure_reason: Some(reason),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn no_changes() -> Self {
        Self {
            success: true,
            completion_outcome: Some(CompletionOutcome::NoChangesNeeded),
            ..Self::default()
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_roundtrip() {
        for c in Category::all() {
            assert_eq!(Category::parse(c.as_str()), Some(c));
        }
        assert_eq!(Category::parse("bogus"), None);
    }

    #[test]
    fn plan_exempt_categories() {
        assert!(Category::Docs.plan_exempt());
        assert!(Category::Cleanup.plan_exempt());
        assert!(!Category::Security.plan_exempt());
        assert!(!Category::Refactor.plan_exempt());
    }

    #[test]
    fn outcome_serde_tolerates_missing_fields() {
        let json = r#"{"success": true}"#;
        let out: TicketOutcome = serde_json::from_str(json).expect("parse");
        assert!(out.success);
        assert!(out.branch.is_none());
        assert!(!out.scope_expanded);
        assert!(out.changed_files.is_empty());
    }

    #[test]
    fn proposal_serde_defaults() {
        let json = r#"{"category":"refactor","title":"Tidy config loader","confidence":70,"impact_score":5}"#;
        let p: Proposal = serde_json::from_str(json).expect("parse");
        assert_eq!(p.category, Category::Refactor);
        assert_eq!(p.risk, Risk::Medium);
        assert_eq!(p.estimated_complexity, Complexity::Moderate);
        assert!(p.files.is_empty());
    }
}
