use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::learnings::{Learning, LearningCategory};
use crate::types::{Category, Risk, Ticket};

/// Patterns no ticket may ever touch, regardless of allowed paths.
const DENIED_PATTERNS: &[&str] = &[
    "**/*.lock",
    "**/node_modules/**",
    "**/.git/**",
    "**/dist/**",
    "**/target/**",
    "**/.state/**",
];

/// Per-phase execution constraints handed to the agent and enforced against
/// its diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConstraints {
    pub allowed_paths: Vec<String>,
    pub denied_paths: Vec<String>,
    pub denied_patterns: Vec<String>,
    pub max_files: u32,
    pub max_lines: u32,
    pub required_commands: Vec<String>,
    pub plan_required: bool,
    pub auto_approve_patterns: Vec<String>,
}

/// Category baseline: (max_files, max_lines, plan_required).
fn category_baseline(category: Category) -> (u32, u32, bool) {
    match category {
        Category::Refactor => (8, 400, true),
        Category::Docs => (10, 500, false),
        Category::Test => (10, 600, false),
        Category::Perf => (6, 300, true),
        Category::Security => (5, 200, true),
        Category::Fix => (6, 300, false),
        Category::Cleanup => (12, 400, false),
        Category::Types => (10, 300, false),
    }
}

/// Derive constraints for a ticket from its category baseline, its declared
/// scope, relevant learnings, and adaptive risk.
pub fn derive_constraints(
    ticket: &Ticket,
    relevant_learnings: &[Learning],
    adaptive_risk: Risk,
) -> ScopeConstraints {
    let (mut max_files, mut max_lines, mut plan_required) = category_baseline(ticket.category);

    // A warning learned against one of this ticket's paths tightens the
    // budget and forces a plan.
    let warned = relevant_learnings.iter().any(|l| {
        l.category == LearningCategory::Warning
            && l.tags.iter().any(|t| {
                t.strip_prefix("path:")
                    .map(|p| ticket.allowed_paths.iter().any(|a| a.starts_with(p) || p.starts_with(a.trim_end_matches("/**"))))
                    .unwrap_or(false)
            })
    });
    if warned || adaptive_risk == Risk::High {
        max_files = (max_files * 3 / 4).max(1);
        max_lines = (max_lines * 3 / 4).max(50);
        plan_required = true;
    }

    if ticket.category.plan_exempt() && !warned && adaptive_risk != Risk::High {
        plan_required = false;
    }

    ScopeConstraints {
        allowed_paths: ticket.allowed_paths.clone(),
        denied_paths: ticket.forbidden_paths.clone(),
        denied_patterns: DENIED_PATTERNS.iter().map(|s| s.to_string()).collect(),
        max_files,
        max_lines,
        required_commands: ticket.verification_commands.clone(),
        plan_required,
        auto_approve_patterns: match ticket.category {
            Category::Docs => vec!["**/*.md".into()],
            Category::Test => vec!["**/tests/**".into(), "**/*_test.*".into()],
            _ => Vec::new(),
        },
    }
}

/// One enforced violation from a changed-file set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeViolationEntry {
    pub file: String,
    pub violation: String,
}

fn build_globset(patterns: &[String]) -> Option<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    let mut any = false;
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(g) => {
                builder.add(g);
                any = true;
            }
            Err(e) => warn!("invalid scope glob {pattern:?}: {e}"),
        }
    }
    if !any {
        return None;
    }
    builder.build().ok()
}

/// Check an agent's changed files against the constraints. Returns every
/// violation; the run fails if any are present. Forbidden paths are checked
/// before the allowed set so the artifact names the sharper cause.
pub fn check_changed_files(
    changed: &[String],
    constraints: &ScopeConstraints,
) -> Vec<ScopeViolationEntry> {
    let mut violations = Vec::new();

    let forbidden = build_globset(&constraints.denied_paths);
    let denied = build_globset(&constraints.denied_patterns);
    let allowed = build_globset(&constraints.allowed_paths);

    for file in changed {
        if let Some(f) = &forbidden {
            if f.is_match(file) {
                violations.push(ScopeViolationEntry {
                    file: file.clone(),
                    violation: "in_forbidden".into(),
                });
                continue;
            }
        }
        if let Some(d) = &denied {
            if d.is_match(file) {
                violations.push(ScopeViolationEntry {
                    file: file.clone(),
                    violation: "denied_pattern".into(),
                });
                continue;
            }
        }
        match &allowed {
            Some(a) if a.is_match(file) => {}
            // An empty/invalid allowed set means nothing may change.
            _ => violations.push(ScopeViolationEntry {
                file: file.clone(),
                violation: "outside_allowed".into(),
            }),
        }
    }

    if changed.len() as u32 > constraints.max_files {
        violations.push(ScopeViolationEntry {
            file: String::new(),
            violation: format!(
                "too_many_files: {} changed, max {}",
                changed.len(),
                constraints.max_files
            ),
        });
    }

    violations
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::types::{TicketMetadata, TicketStatus};

    fn ticket(category: Category, allowed: &[&str], forbidden: &[&str]) -> Ticket {
        Ticket {
            id: 1,
            project_id: 1,
            title: "t".into(),
            description: String::new(),
            category,
            status: TicketStatus::Ready,
            allowed_paths: allowed.iter().map(|s| s.to_string()).collect(),
            forbidden_paths: forbidden.iter().map(|s| s.to_string()).collect(),
            verification_commands: vec!["cargo test".into()],
            metadata: TicketMetadata::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn forbidden_path_reported_before_allowed_check() {
        let t = ticket(Category::Refactor, &["src/**"], &["config/**"]);
        let constraints = derive_constraints(&t, &[], Risk::Low);
        let violations = check_changed_files(
            &["src/index.ts".into(), "config/database.json".into()],
            &constraints,
        );
        assert_eq!(
            violations,
            vec![ScopeViolationEntry {
                file: "config/database.json".into(),
                violation: "in_forbidden".into(),
            }]
        );
    }

    #[test]
    fn outside_allowed_is_flagged() {
        let t = ticket(Category::Fix, &["src/**"], &[]);
        let constraints = derive_constraints(&t, &[], Risk::Low);
        let violations = check_changed_files(&["scripts/deploy.sh".into()], &constraints);
        assert_eq!(violations[0].violation, "outside_allowed");
    }

    #[test]
    fn denied_patterns_always_apply() {
        let t = ticket(Category::Cleanup, &["**"], &[]);
        let constraints = derive_constraints(&t, &[], Risk::Low);
        let violations = check_changed_files(&["target/debug/out".into()], &constraints);
        assert_eq!(violations[0].violation, "denied_pattern");
    }

    #[test]
    fn too_many_files_is_a_violation() {
        let t = ticket(Category::Security, &["src/**"], &[]);
        let constraints = derive_constraints(&t, &[], Risk::Low);
        assert_eq!(constraints.max_files, 5);
        let changed: Vec<String> = (0..6).map(|i| format!("src/f{i}.rs")).collect();
        let violations = check_changed_files(&changed, &constraints);
        assert!(violations.iter().any(|v| v.violation.starts_with("too_many_files")));
    }

    #[test]
    fn high_risk_tightens_budget_and_requires_plan() {
        let t = ticket(Category::Docs, &["docs/**"], &[]);
        let relaxed = derive_constraints(&t, &[], Risk::Low);
        assert!(!relaxed.plan_required);
        assert_eq!(relaxed.max_files, 10);

        let tight = derive_constraints(&t, &[], Risk::High);
        assert!(tight.plan_required);
        assert_eq!(tight.max_files, 7);
    }
}
