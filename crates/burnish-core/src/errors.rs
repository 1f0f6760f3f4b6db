use thiserror::Error;

/// Errors the engine must distinguish, grouped by propagation policy.
///
/// Configuration errors and budget exhaustion are fatal to the session and
/// carry a process exit code. Per-ticket errors (agent, QA, delivery, scope)
/// block the ticket and let the cycle continue. Persistence errors are
/// recovered locally.
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration
    #[error("not a git repository: {0}")]
    NotAGitRepo(String),
    #[error("repository has no origin remote")]
    NoRemote,
    #[error("remote mismatch: expected {expected}, found {found}")]
    RemoteMismatch { expected: String, found: String },
    #[error("agent backend unavailable: {0}")]
    MissingAgent(String),
    #[error("missing credentials for backend {0}")]
    AuthMissing(String),
    #[error("working tree has uncommitted changes")]
    WorkingTreeDirty,
    #[error("another session owns this repository (pid {pid})")]
    SessionBusy { pid: u32 },

    // Budget
    #[error("step budget exhausted")]
    StepBudget,
    #[error("time budget exhausted")]
    TimeBudget,
    #[error("PR budget exhausted")]
    PrBudget,
    #[error("cycle budget exhausted")]
    CycleBudget,
    #[error("{0}")]
    LowYield(String),

    // Delivery
    #[error("merge conflict: {0}")]
    MergeConflict(String),
    #[error("push failed: {0}")]
    PushFailed(String),
    #[error("PR creation failed: {0}")]
    PrCreateFailed(String),
    #[error("auto-merge failed: {0}")]
    AutoMergeFailed(String),

    // Scope
    #[error("scope violation on {file}: {violation}")]
    ScopeViolation { file: String, violation: String },
    #[error("plan rejected")]
    PlanRejected,

    // Persistence (recovered locally; surfaced only for reporting)
    #[error("corrupt sidecar file {0}, recovered with defaults")]
    CorruptSidecar(String),
    #[error("stale session lock replaced (previous pid {0})")]
    LockStale(u32),

    // Terminal session states
    #[error("session blocked: needs human attention")]
    BlockedNeedsHuman,
    #[error("session failed: validation error")]
    FailedValidation,
    #[error("session failed: repeated spindle recoveries")]
    FailedSpindle,
}

impl EngineError {
    /// Process exit code for the CLI. 0 is success and never appears here.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::WorkingTreeDirty => 2,
            Self::NoRemote | Self::RemoteMismatch { .. } => 3,
            Self::MissingAgent(_) | Self::AuthMissing(_) => 4,
            Self::SessionBusy { .. } => 5,
            Self::NotAGitRepo(_) => 6,
            Self::StepBudget | Self::TimeBudget | Self::PrBudget | Self::CycleBudget => 10,
            Self::FailedValidation => 11,
            Self::FailedSpindle => 12,
            Self::BlockedNeedsHuman => 13,
            Self::LowYield(_) => 0,
            _ => 1,
        }
    }

    /// Errors that end the session (as opposed to blocking one ticket).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotAGitRepo(_)
                | Self::NoRemote
                | Self::RemoteMismatch { .. }
                | Self::MissingAgent(_)
                | Self::AuthMissing(_)
                | Self::WorkingTreeDirty
                | Self::SessionBusy { .. }
                | Self::StepBudget
                | Self::TimeBudget
                | Self::PrBudget
                | Self::CycleBudget
                | Self::LowYield(_)
                | Self::FailedValidation
                | Self::FailedSpindle
                | Self::BlockedNeedsHuman
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_for_config_errors() {
        assert_eq!(EngineError::WorkingTreeDirty.exit_code(), 2);
        assert_eq!(EngineError::NoRemote.exit_code(), 3);
        assert_eq!(EngineError::AuthMissing("codex".into()).exit_code(), 4);
        assert_eq!(EngineError::SessionBusy { pid: 1 }.exit_code(), 5);
        assert_eq!(EngineError::NotAGitRepo("/tmp".into()).exit_code(), 6);
    }

    #[test]
    fn low_yield_is_a_clean_stop() {
        let e = EngineError::LowYield("done".into());
        assert_eq!(e.exit_code(), 0);
        assert!(e.is_fatal());
    }

    #[test]
    fn scope_violation_is_not_fatal() {
        let e = EngineError::ScopeViolation {
            file: "config/database.json".into(),
            violation: "in_forbidden".into(),
        };
        assert!(!e.is_fatal());
    }
}
