use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::scope::ScopeConstraints;
use crate::types::{Category, Proposal, Ticket, TicketOutcome};

/// Scope and context handed to a scout pass. Prompt assembly is backend
/// plumbing; the engine only provides the structured inputs.
#[derive(Debug, Clone, Default)]
pub struct ScoutRequest {
    pub repo_root: String,
    /// Glob the scout must stay inside, e.g. `src/router/**`.
    pub scope: String,
    pub sector_path: String,
    /// Empty = every category allowed.
    pub categories: Vec<Category>,
    pub min_confidence: u8,
    pub max_proposals: usize,
    /// Rendered `<project-learnings>` block.
    pub learnings_block: String,
    /// Normalized titles of recent work, for duplicate avoidance.
    pub recent_titles: Vec<String>,
    /// Baseline-failing QA commands, surfaced as healing targets.
    pub baseline_failures: Vec<String>,
    /// Set on retry after an empty scout.
    pub escalation: Option<String>,
    /// Operator nudges and formula emphasis.
    pub hints: Vec<String>,
}

/// Scout feedback that re-labels a sector (e.g. "this is all generated code").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectorReclassification {
    pub path: String,
    pub production: bool,
    pub purpose: String,
}

/// Everything a scout pass produces.
#[derive(Debug, Clone, Default)]
pub struct ScoutReport {
    pub proposals: Vec<Proposal>,
    /// Files the scout actually examined; zero permanently retires the sector.
    pub scanned_files: u32,
    pub reclassification: Option<SectorReclassification>,
}

/// One ticket execution attempt, run inside an isolated worktree.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub ticket: Ticket,
    pub repo_root: String,
    pub worktree_path: String,
    pub branch: String,
    pub base_branch: String,
    pub learnings_block: String,
    pub constraints: ScopeConstraints,
    /// 0 on the first attempt; bumped on scope-expansion retries.
    pub attempt: u32,
}

/// Capability interface over the external LLM coding agent. The engine never
/// talks to a model itself; it drives one of these.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Chat-only backends can scout but cannot edit files.
    fn supports_execution(&self) -> bool {
        true
    }

    async fn scout(&self, req: &ScoutRequest) -> Result<ScoutReport>;

    async fn execute(&self, req: &ExecuteRequest) -> Result<TicketOutcome>;
}
