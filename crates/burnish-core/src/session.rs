use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::agent::AgentBackend;
use crate::config::{SessionConfig, StatePaths};
use crate::cycle::{CycleEngine, CycleVerdict, SessionMode, SessionState, BRANCH_PREFIX};
use crate::db::Store;
use crate::dedup::{DedupMemory, FileCooldown};
use crate::errors::EngineError;
use crate::git::Git;
use crate::learnings::{LearningStore, DEFAULT_DECAY_RATE};
use crate::metrics::MetricsSink;
use crate::qa::QaStatsStore;
use crate::sectors::SectorRouter;
use crate::sidecar::RunStateStore;
use crate::types::RunStatus;

const CYCLE_PAUSE: Duration = Duration::from_millis(1500);

// ── Session lock ─────────────────────────────────────────────────────────

fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes liveness without delivering anything. EPERM means the
    // process exists but belongs to another user.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Exclusive write capability for the repo's `.state/` directory: a file
/// holding the owning PID, with stale-PID replacement. Released on drop.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    /// Set when a dead session's lock was replaced, for reporting.
    pub stale_pid: Option<u32>,
}

impl SessionLock {
    pub fn acquire(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let pid = std::process::id();
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(_) => {
                std::fs::write(path, pid.to_string()).ok();
                return Ok(Self {
                    path: path.to_path_buf(),
                    stale_pid: None,
                });
            }
            Err(e) if e.kind() != std::io::ErrorKind::AlreadyExists => {
                warn!("session lock create failed: {e}; retrying as stale");
            }
            Err(_) => {}
        }

        let holder: Option<u32> = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok());
        if let Some(holder) = holder {
            if holder != pid && pid_alive(holder) {
                return Err(EngineError::SessionBusy { pid: holder });
            }
        }
        // Stale (or unreadable) lock: replace it.
        warn!("replacing stale session lock (previous pid {holder:?})");
        std::fs::write(path, pid.to_string()).map_err(|_| EngineError::SessionBusy {
            pid: holder.unwrap_or(0),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            stale_pid: holder,
        })
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        std::fs::remove_file(&self.path).ok();
    }
}

// ── Preflight ────────────────────────────────────────────────────────────

/// Configuration checks shared by `doctor` and session start.
pub fn preflight_repo(repo_root: &Path, config: &SessionConfig) -> Result<(), EngineError> {
    let git = Git::new(repo_root.to_string_lossy().into_owned());
    if !git.is_repo() {
        return Err(EngineError::NotAGitRepo(
            repo_root.to_string_lossy().into_owned(),
        ));
    }
    let origin = git.origin_url().unwrap_or(None);
    let Some(origin) = origin else {
        return Err(EngineError::NoRemote);
    };
    if !config.allowed_remote.is_empty() && !origin.contains(&config.allowed_remote) {
        return Err(EngineError::RemoteMismatch {
            expected: config.allowed_remote.clone(),
            found: origin,
        });
    }
    let clean = git
        .status_clean(&repo_root.to_string_lossy())
        .unwrap_or(false);
    if !clean {
        return Err(EngineError::WorkingTreeDirty);
    }
    Ok(())
}

// ── Supervisor ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub cycles: u32,
    pub prs_created: u32,
    pub reason: String,
}

/// Top-level session driver: owns the lock, runs pre-session maintenance,
/// then the cycle loop until a stop condition.
pub struct SessionSupervisor {
    pub engine: CycleEngine,
    _lock: SessionLock,
    started: Instant,
}

impl SessionSupervisor {
    /// Assemble a full session: lock, stores, sidecar state, and engine.
    pub async fn bootstrap(
        repo_root: &Path,
        config: SessionConfig,
        backend: Arc<dyn AgentBackend>,
        mode: SessionMode,
    ) -> Result<Self> {
        let paths = StatePaths::new(repo_root);
        let lock = SessionLock::acquire(&paths.session_lock())?;
        if let Some(stale) = lock.stale_pid {
            info!("replaced stale session lock from pid {stale}");
        }
        std::fs::create_dir_all(&paths.state_dir).context("create .state dir")?;

        let store = Arc::new(Store::open(
            &paths.db().to_string_lossy(),
        )?);
        store.migrate()?;
        let project_name = repo_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repo".into());
        let project = store.upsert_project(&project_name, &repo_root.to_string_lossy())?;

        let reset = store.reset_stale_tickets()?;
        if reset > 0 {
            info!("reset {reset} stranded tickets to ready");
        }

        let learnings = Arc::new(LearningStore::open_with_decay(
            paths.learnings(),
            DEFAULT_DECAY_RATE,
        )?);
        let qa_stats = Arc::new(QaStatsStore::open(paths.qa_stats()));
        let dedup = Arc::new(DedupMemory::open(paths.dedup_memory()));
        let cooldown = Arc::new(FileCooldown::open(paths.file_cooldown()));
        let sectors = Arc::new(SectorRouter::open(paths.sectors(), repo_root)?);
        let run_state = Arc::new(RunStateStore::open(paths.run_state()));
        let metrics = Arc::new(MetricsSink::new(paths.metrics()));

        let shutdown = Arc::new(AtomicBool::new(false));
        let state = SessionState::new(mode, config.auto.min_confidence, shutdown);

        let engine = CycleEngine::new(
            paths,
            config,
            store,
            project,
            backend,
            learnings,
            qa_stats,
            dedup,
            cooldown,
            sectors,
            run_state,
            metrics,
            state,
        );

        Ok(Self {
            engine,
            _lock: lock,
            started: Instant::now(),
        })
    }

    fn git(&self) -> Git {
        Git::new(self.engine.paths.repo_root.to_string_lossy().into_owned())
    }

    /// Prune stale worktrees and old merged engine branches.
    pub fn cleanup(&self) {
        let git = self.git();
        git.prune_worktrees();

        let registered = git.list_worktrees().unwrap_or_default();
        if let Ok(entries) = std::fs::read_dir(self.engine.paths.worktrees_dir()) {
            for entry in entries.flatten() {
                let path = entry.path().to_string_lossy().into_owned();
                if !registered.iter().any(|w| *w == path) {
                    info!("removing orphaned worktree dir {path}");
                    std::fs::remove_dir_all(entry.path()).ok();
                }
            }
        }

        let cutoff = chrono::Utc::now()
            - chrono::Duration::days(self.engine.config.retention.branch_days);
        let base = self.engine.config.base_branch.clone();
        for (branch, committed) in git.branches_with_prefix(BRANCH_PREFIX).unwrap_or_default() {
            if committed >= cutoff {
                continue;
            }
            if let Ok(true) = git.branch_is_merged(&branch, &base) {
                info!("pruning merged branch {branch}");
                let _ = git.delete_branch(&branch);
            }
        }
    }

    async fn run_setup_command(&self) -> Result<()> {
        let setup = self.engine.config.setup.clone();
        if setup.is_empty() {
            return Ok(());
        }
        info!("running setup command: {setup}");
        let out = crate::cycle::sh(&self.engine.paths.repo_root, &setup).await?;
        if out.exit_code != 0 {
            warn!("setup command failed ({}): {}", out.exit_code, out.stderr.trim());
        }
        Ok(())
    }

    fn banner(&self) {
        let c = &self.engine.config;
        info!(
            "burnish session: repo {} | mode {:?} | delivery {} | backend {} | budget {}m / {} cycles / {} PRs",
            self.engine.paths.repo_root.display(),
            self.engine.state.mode,
            c.auto.delivery.as_str(),
            c.backend,
            c.auto.time_budget_mins,
            c.auto.max_cycles,
            c.auto.max_prs,
        );
    }

    /// Install the cooperative shutdown handler: first signal sets the flag,
    /// a second force-exits.
    fn install_signal_handler(&self) {
        let shutdown = Arc::clone(&self.engine.state.shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("shutdown signal received; finishing current work");
                shutdown.store(true, Ordering::Release);
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("second signal: forcing exit");
                std::process::exit(130);
            }
        });
    }

    fn stop_reason(&self) -> Option<String> {
        let state = &self.engine.state;
        let auto = &self.engine.config.auto;
        if state.shutdown_requested() {
            return Some(
                state
                    .shutdown_reason
                    .clone()
                    .unwrap_or_else(|| "shutdown requested".into()),
            );
        }
        if self.started.elapsed() > Duration::from_secs(auto.time_budget_mins * 60) {
            return Some("time budget elapsed".into());
        }
        if state.mode == SessionMode::Planning && state.cycle_count >= auto.max_cycles {
            return Some("cycle budget reached".into());
        }
        if auto.delivery.uses_prs() && state.total_prs >= auto.max_prs {
            return Some("PR budget reached".into());
        }
        if state.spindle_recoveries >= self.engine.config.spindle.max_recoveries {
            return Some(format!(
                "{} spindle recoveries; stopping for human attention",
                state.spindle_recoveries
            ));
        }
        None
    }

    pub async fn run(&mut self) -> Result<SessionSummary> {
        self.cleanup();
        self.run_setup_command().await?;
        self.banner();
        self.install_signal_handler();

        let reason = loop {
            if let Some(reason) = self.stop_reason() {
                break reason;
            }
            match self.engine.run_cycle().await {
                Ok(report) => match report.verdict {
                    CycleVerdict::NoSectors => break "all sectors scanned with no changes".into(),
                    CycleVerdict::Skipped => tokio::time::sleep(CYCLE_PAUSE).await,
                    CycleVerdict::Completed => {
                        if report.proposals == 0 {
                            // Brief pause after an empty scout.
                            tokio::time::sleep(CYCLE_PAUSE).await;
                        }
                    }
                },
                Err(e) => {
                    self.engine.metrics.emit(
                        "session",
                        "cycle_error",
                        Some(serde_json::json!({ "error": e.to_string() })),
                    );
                    break format!("cycle error: {e}");
                }
            }
        };

        // Finalize the milestone (if any) before exit.
        let git = self.git();
        if let Err(e) = self.engine.finalize_milestone(&git).await {
            warn!("finalize milestone on exit: {e}");
        }

        // Close the session run record and flush metrics.
        if let Ok(run_id) = self
            .engine
            .store
            .insert_run(self.engine.project.id, crate::types::RunType::Session, None)
        {
            let _ = self
                .engine
                .store
                .finish_run(run_id, RunStatus::Success, Some(&reason));
        }
        self.engine.metrics.emit(
            "session",
            "finished",
            Some(serde_json::json!({
                "cycles": self.engine.state.cycle_count,
                "prs": self.engine.state.total_prs,
                "reason": reason,
            })),
        );
        self.engine.metrics.flush();

        info!("session finished: {reason}");
        Ok(SessionSummary {
            cycles: self.engine.state.cycle_count,
            prs_created: self.engine.state.total_prs,
            reason,
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_acquire_release_and_stale_replacement() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.lock");

        {
            let lock = SessionLock::acquire(&path).expect("acquire");
            assert!(lock.stale_pid.is_none());
            assert!(path.exists());
            let pid: u32 = std::fs::read_to_string(&path)
                .expect("read")
                .trim()
                .parse()
                .expect("pid");
            assert_eq!(pid, std::process::id());
        }
        // Released on drop.
        assert!(!path.exists());

        // A dead PID is treated as stale and replaced.
        std::fs::write(&path, "999999999").expect("write");
        let lock = SessionLock::acquire(&path).expect("acquire stale");
        assert_eq!(lock.stale_pid, Some(999_999_999));
    }

    #[test]
    fn live_pid_blocks_acquisition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.lock");
        // Our own PID is definitely alive; a lock held by it (simulating
        // another live process would behave identically) must not be treated
        // as stale when the PID differs. Use PID 1, which is always alive.
        std::fs::write(&path, "1").expect("write");
        match SessionLock::acquire(&path) {
            Err(EngineError::SessionBusy { pid }) => assert_eq!(pid, 1),
            other => panic!("expected SessionBusy, got {other:?}"),
        }
    }

    #[test]
    fn preflight_rejects_non_repo() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = SessionConfig::default();
        match preflight_repo(dir.path(), &config) {
            Err(EngineError::NotAGitRepo(_)) => {}
            other => panic!("expected NotAGitRepo, got {other:?}"),
        }
    }
}
