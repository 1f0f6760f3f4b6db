//! End-to-end engine tests against a throwaway git repository and a mock
//! agent backend. Delivery runs in direct mode so no network or `gh` is
//! needed.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use burnish_core::agent::{AgentBackend, ExecuteRequest, ScoutReport, ScoutRequest};
use burnish_core::config::SessionConfig;
use burnish_core::cycle::{CycleVerdict, SessionMode};
use burnish_core::learnings::{Learning, LearningSource};
use burnish_core::scope::ScopeViolationEntry;
use burnish_core::session::SessionSupervisor;
use burnish_core::sidecar::load_json;
use burnish_core::types::{
    Category, Complexity, DeliveryMode, Proposal, Risk, RunStatus, StepStatus, Ticket,
    TicketMetadata, TicketOutcome, TicketStatus,
};

// ── Repo scaffolding ─────────────────────────────────────────────────────

fn git_ok(repo: &Path, args: &[&str]) {
    let out = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

fn init_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    let repo = dir.path();
    git_ok(repo, &["init", "-b", "main"]);
    git_ok(repo, &["config", "user.email", "engine@test"]);
    git_ok(repo, &["config", "user.name", "engine"]);
    std::fs::create_dir_all(repo.join("src")).expect("mkdir");
    for i in 0..4 {
        std::fs::write(repo.join(format!("src/mod{i}.rs")), format!("pub fn f{i}() {{}}\n"))
            .expect("write");
    }
    git_ok(repo, &["add", "-A"]);
    git_ok(repo, &["commit", "-m", "init"]);
    dir
}

fn commit_change(repo: &Path, tag: &str) {
    std::fs::write(repo.join("src").join(format!("churn_{tag}.rs")), "pub fn churn() {}\n")
        .expect("write");
    git_ok(repo, &["add", "-A"]);
    git_ok(repo, &["commit", "-m", &format!("churn {tag}")]);
}

fn test_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.auto.delivery = DeliveryMode::Direct;
    config.auto.pull_interval_cycles = 0;
    config
}

// ── Mock backend ─────────────────────────────────────────────────────────

struct MockBackend {
    proposals: Vec<Proposal>,
    scout_calls: AtomicUsize,
    /// Files (relative) the executor writes into the worktree.
    write_files: Vec<(String, String)>,
    succeed: bool,
}

impl MockBackend {
    fn new(proposals: Vec<Proposal>) -> Self {
        Self {
            proposals,
            scout_calls: AtomicUsize::new(0),
            write_files: vec![("src/greet.rs".into(), "pub fn greet() {}\n".into())],
            succeed: true,
        }
    }

    fn with_writes(mut self, files: Vec<(String, String)>) -> Self {
        self.write_files = files;
        self
    }
}

#[async_trait]
impl AgentBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn scout(&self, _req: &ScoutRequest) -> Result<ScoutReport> {
        self.scout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ScoutReport {
            proposals: self.proposals.clone(),
            scanned_files: 50,
            reclassification: None,
        })
    }

    async fn execute(&self, req: &ExecuteRequest) -> Result<TicketOutcome> {
        for (rel, contents) in &self.write_files {
            let path = PathBuf::from(&req.worktree_path).join(rel);
            std::fs::create_dir_all(path.parent().expect("parent"))?;
            std::fs::write(path, contents)?;
        }
        Ok(TicketOutcome {
            success: self.succeed,
            ..TicketOutcome::default()
        })
    }
}

fn proposal(title: &str, category: Category, confidence: u8) -> Proposal {
    Proposal {
        category,
        title: title.into(),
        description: "test proposal".into(),
        acceptance_criteria: vec![],
        verification_commands: vec!["true".into()],
        allowed_paths: vec!["src/**".into()],
        files: vec!["src/greet.rs".into()],
        confidence,
        impact_score: 5,
        risk: Risk::Low,
        estimated_complexity: Complexity::Simple,
        rollback_note: None,
    }
}

// ── Scenario: trivial success ────────────────────────────────────────────

#[tokio::test]
async fn trivial_proposal_executes_to_done() {
    let dir = init_repo();
    let backend = Arc::new(MockBackend::new(vec![proposal(
        "Tidy the greeting module",
        Category::Refactor,
        80,
    )]));
    let mut supervisor = SessionSupervisor::bootstrap(
        dir.path(),
        test_config(),
        backend,
        SessionMode::Spin,
    )
    .await
    .expect("bootstrap");

    let report = supervisor.engine.run_cycle().await.expect("cycle");
    assert_eq!(report.verdict, CycleVerdict::Completed);
    assert_eq!(report.approved, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);

    let store = &supervisor.engine.store;
    let done = store
        .list_tickets_by_status(TicketStatus::Done)
        .expect("list");
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].title, "Tidy the greeting module");

    let runs = store.runs_for_ticket(done[0].id).expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Success);

    let steps = store.list_steps(runs[0].id).expect("steps");
    let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["worktree", "agent", "scope", "commit", "push", "qa"]);
    // Direct delivery skips the push.
    assert_eq!(steps[4].status, StepStatus::Skipped);
    assert!(steps
        .iter()
        .filter(|s| s.name != "push")
        .all(|s| s.status == StepStatus::Success));
}

// ── Scenario: scope violation ────────────────────────────────────────────

#[tokio::test]
async fn scope_violation_blocks_ticket_and_writes_artifact() {
    let dir = init_repo();
    let backend = Arc::new(
        MockBackend::new(vec![]).with_writes(vec![
            ("src/index.ts".into(), "export {};\n".into()),
            ("config/database.json".into(), "{}\n".into()),
        ]),
    );
    let mut supervisor = SessionSupervisor::bootstrap(
        dir.path(),
        test_config(),
        backend,
        SessionMode::Spin,
    )
    .await
    .expect("bootstrap");

    let ticket = Ticket {
        id: 0,
        project_id: supervisor.engine.project.id,
        title: "Touch only src".into(),
        description: String::new(),
        category: Category::Fix,
        status: TicketStatus::Ready,
        allowed_paths: vec!["src/**".into()],
        forbidden_paths: vec!["config/**".into()],
        verification_commands: vec!["true".into()],
        metadata: TicketMetadata::default(),
        created_at: chrono::Utc::now(),
    };
    let ticket_id = supervisor.engine.store.insert_ticket(&ticket).expect("insert");

    let ok = supervisor
        .engine
        .execute_single_ticket(ticket_id)
        .await
        .expect("execute");
    assert!(!ok);

    let store = &supervisor.engine.store;
    let refreshed = store.get_ticket(ticket_id).expect("get").expect("ticket");
    assert_eq!(refreshed.status, TicketStatus::Blocked);

    let runs = store.runs_for_ticket(ticket_id).expect("runs");
    assert_eq!(runs[0].status, RunStatus::Failure);

    let artifact = supervisor
        .engine
        .paths
        .artifacts_dir()
        .join(format!("run_{}", runs[0].id))
        .join("violations.json");
    let violations: Vec<ScopeViolationEntry> = load_json(&artifact);
    assert_eq!(
        violations,
        vec![ScopeViolationEntry {
            file: "config/database.json".into(),
            violation: "in_forbidden".into(),
        }]
    );

    let learnings: Vec<Learning> = load_json(&supervisor.engine.paths.learnings());
    assert!(learnings
        .iter()
        .any(|l| l.source == LearningSource::ScopeViolation));
}

// ── Scenario: diminishing returns ────────────────────────────────────────

#[tokio::test]
async fn diminishing_returns_stops_after_three_low_yield_cycles() {
    let dir = init_repo();
    // Category-filtered proposals: docs-audit only accepts docs, the scout
    // keeps offering refactors.
    let mut config = test_config();
    config.auto.formula = Some("docs-audit".into());
    let backend = Arc::new(MockBackend::new(vec![proposal(
        "Restructure the module tree",
        Category::Refactor,
        80,
    )]));
    let backend_probe = Arc::clone(&backend);
    let mut supervisor =
        SessionSupervisor::bootstrap(dir.path(), config, backend, SessionMode::Spin)
            .await
            .expect("bootstrap");

    for i in 0..5 {
        commit_change(dir.path(), &format!("c{i}"));
        let report = supervisor.engine.run_cycle().await.expect("cycle");
        assert_eq!(report.verdict, CycleVerdict::Completed);
        assert_eq!(report.approved, 0);
    }

    // One scout per cycle: the proposals were dropped by category, not by
    // the empty-scout retry loop.
    assert_eq!(backend_probe.scout_calls.load(Ordering::SeqCst), 5);

    let state = &supervisor.engine.state;
    assert!(state.shutdown_requested());
    let reason = state.shutdown_reason.clone().expect("reason");
    assert!(
        reason.starts_with("Diminishing returns: 3 consecutive low-yield cycles. Stopping."),
        "got: {reason}"
    );
    assert!(
        reason.contains("rejected by category — consider broadening categories"),
        "got: {reason}"
    );
}

// ── Backpressure ─────────────────────────────────────────────────────────

#[tokio::test]
async fn backpressure_skips_cycle_without_counting_it() {
    let dir = init_repo();
    let mut config = test_config();
    config.auto.delivery = DeliveryMode::Pr;
    config.auto.max_prs = 10;
    let backend = Arc::new(MockBackend::new(vec![]));
    let mut supervisor =
        SessionSupervisor::bootstrap(dir.path(), config, backend, SessionMode::Spin)
            .await
            .expect("bootstrap");

    supervisor.engine.state.pending_pr_urls = (0..8)
        .map(|i| format!("https://github.com/o/r/pull/{i}"))
        .collect();
    let report = supervisor.engine.run_cycle().await.expect("cycle");
    assert_eq!(report.verdict, CycleVerdict::Skipped);
    assert_eq!(supervisor.engine.state.cycle_count, 0);
}

// ── No-changes outcome ───────────────────────────────────────────────────

struct NoChangesBackend;

#[async_trait]
impl AgentBackend for NoChangesBackend {
    fn name(&self) -> &str {
        "noop"
    }

    async fn scout(&self, _req: &ScoutRequest) -> Result<ScoutReport> {
        Ok(ScoutReport::default())
    }

    async fn execute(&self, _req: &ExecuteRequest) -> Result<TicketOutcome> {
        Ok(TicketOutcome::no_changes())
    }
}

#[tokio::test]
async fn no_changes_needed_marks_ticket_done() {
    let dir = init_repo();
    let mut supervisor = SessionSupervisor::bootstrap(
        dir.path(),
        test_config(),
        Arc::new(NoChangesBackend),
        SessionMode::Spin,
    )
    .await
    .expect("bootstrap");

    let ticket = Ticket {
        id: 0,
        project_id: supervisor.engine.project.id,
        title: "Already correct".into(),
        description: String::new(),
        category: Category::Docs,
        status: TicketStatus::Ready,
        allowed_paths: vec!["src/**".into()],
        forbidden_paths: vec![],
        verification_commands: vec![],
        metadata: TicketMetadata::default(),
        created_at: chrono::Utc::now(),
    };
    let ticket_id = supervisor.engine.store.insert_ticket(&ticket).expect("insert");

    let ok = supervisor
        .engine
        .execute_single_ticket(ticket_id)
        .await
        .expect("execute");
    assert!(ok);
    let refreshed = supervisor
        .engine
        .store
        .get_ticket(ticket_id)
        .expect("get")
        .expect("ticket");
    assert_eq!(refreshed.status, TicketStatus::Done);
}
