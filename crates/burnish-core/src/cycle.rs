use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};

use crate::agent::{AgentBackend, ExecuteRequest, ScoutReport, ScoutRequest};
use crate::config::{PullPolicy, SessionConfig, StatePaths};
use crate::db::Store;
use crate::dedup::{compute_cooldown_overlap, is_duplicate_proposal, DedupMemory, FileCooldown,
    DEDUP_SIMILARITY_THRESHOLD};
use crate::formula::{resolve_formula, Formula};
use crate::git::{worktree_path, Git};
use crate::learnings::{format_for_prompt, LearningCategory, LearningSource, LearningStore};
use crate::meta::{extract_insights, OutcomeRecord};
use crate::metrics::MetricsSink;
use crate::qa::{capture_baseline, run_qa_round, QaBaseline, QaStatsStore};
use crate::scope::{check_changed_files, derive_constraints, ScopeViolationEntry};
use crate::sectors::SectorRouter;
use crate::sidecar::{drain_nudges, save_json, CycleSummary, RunStateStore};
use crate::text::slugify;
use crate::types::{
    Category, CompletionOutcome, DeliveryMode, FailureReason, Project, Proposal, Risk, RunStatus,
    RunType, StepKind, StepStatus, Ticket, TicketMetadata, TicketOutcome, TicketStatus,
};
use crate::waves::{adaptive_parallelism, partition_into_waves};

pub const BRANCH_PREFIX: &str = "burnish/";
const MAX_SCOUT_RETRIES: u32 = 1;
const LOW_YIELD_RATE: f64 = 0.2;
const LOW_YIELD_LIMIT: u32 = 3;
const BACKPRESSURE_RATIO: f64 = 0.7;
const COOLDOWN_OVERLAP_LIMIT: f64 = 0.5;
const MAX_SCOPE_EXPANSION_RETRIES: u32 = 2;

// ── Session state ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Scout and promote only; bounded by the cycle budget.
    Planning,
    /// Full execute loop; bounded by time and PR budgets.
    Spin,
}

/// All mutable session-level state, in one explicit record.
pub struct SessionState {
    pub mode: SessionMode,
    pub cycle_count: u32,
    pub total_prs: u32,
    pub consecutive_low_yield: u32,
    pub category_rejected_total: u32,
    pub effective_min_confidence: u8,
    pub original_min_confidence: u8,
    pub active_formula: Option<Formula>,
    pub pending_pr_urls: Vec<String>,
    pub current_sector: Option<String>,
    pub milestone: Option<Milestone>,
    pub milestone_seq: u32,
    pub spindle_recoveries: u32,
    pub shutdown: Arc<AtomicBool>,
    pub shutdown_reason: Option<String>,
}

impl SessionState {
    pub fn new(mode: SessionMode, min_confidence: u8, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            mode,
            cycle_count: 0,
            total_prs: 0,
            consecutive_low_yield: 0,
            category_rejected_total: 0,
            effective_min_confidence: min_confidence,
            original_min_confidence: min_confidence,
            active_formula: None,
            pending_pr_urls: Vec::new(),
            current_sector: None,
            milestone: None,
            milestone_seq: 0,
            spindle_recoveries: 0,
            shutdown,
            shutdown_reason: None,
        }
    }

    pub fn request_shutdown(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        info!("shutdown requested: {reason}");
        self.shutdown_reason = Some(reason);
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// The long-lived integration branch for milestone delivery.
#[derive(Debug, Clone)]
pub struct Milestone {
    pub branch: String,
    pub worktree: String,
    pub ticket_count: u32,
}

// ── Cycle results ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleVerdict {
    Completed,
    /// Backpressure skip; the cycle did not count.
    Skipped,
    /// No sector has changes to offer; the session should stop.
    NoSectors,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub verdict: CycleVerdict,
    pub scanned_files: u32,
    pub proposals: u32,
    pub approved: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub prs_created: u32,
}

impl CycleReport {
    fn empty(verdict: CycleVerdict) -> Self {
        Self {
            verdict,
            scanned_files: 0,
            proposals: 0,
            approved: 0,
            succeeded: 0,
            failed: 0,
            prs_created: 0,
        }
    }
}

struct FilterOutcome {
    approved: Vec<Proposal>,
    dropped_duplicate: u32,
    dropped_low: u32,
    dropped_cooldown: u32,
    dropped_category: u32,
}

/// Result of one worker's ticket attempt, before delivery.
struct WorkerResult {
    ticket: Ticket,
    run_id: i64,
    branch: String,
    worktree: String,
    outcome: TicketOutcome,
    changed_files: Vec<String>,
    first_attempt: bool,
    /// Learnings selected into the attempt's prompt, for outcome feedback.
    learning_ids: Vec<String>,
    /// `git diff --stat` summary captured before cleanup.
    diff_stat: String,
}

// ── Engine ───────────────────────────────────────────────────────────────

/// Runs one cycle: pre-maintenance, scout, filter, wave execution, and
/// post-maintenance. Owns the session counters and PR bookkeeping.
pub struct CycleEngine {
    pub paths: StatePaths,
    pub config: SessionConfig,
    pub store: Arc<Store>,
    pub project: Project,
    pub backend: Arc<dyn AgentBackend>,
    pub learnings: Arc<LearningStore>,
    pub qa_stats: Arc<QaStatsStore>,
    pub dedup: Arc<DedupMemory>,
    pub cooldown: Arc<FileCooldown>,
    pub sectors: Arc<SectorRouter>,
    pub run_state: Arc<RunStateStore>,
    pub metrics: Arc<MetricsSink>,
    pub state: SessionState,
    /// Session-accumulated outcomes feeding the meta-learning pass.
    outcomes: Vec<OutcomeRecord>,
    /// Serializes `git worktree add` against .git/config lock contention.
    worktree_create_lock: Arc<Mutex<()>>,
}

impl CycleEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        paths: StatePaths,
        config: SessionConfig,
        store: Arc<Store>,
        project: Project,
        backend: Arc<dyn AgentBackend>,
        learnings: Arc<LearningStore>,
        qa_stats: Arc<QaStatsStore>,
        dedup: Arc<DedupMemory>,
        cooldown: Arc<FileCooldown>,
        sectors: Arc<SectorRouter>,
        run_state: Arc<RunStateStore>,
        metrics: Arc<MetricsSink>,
        state: SessionState,
    ) -> Self {
        Self {
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
            outcomes: Vec::new(),
            worktree_create_lock: Arc::new(Mutex::new(())),
        }
    }

    fn git(&self) -> Git {
        Git::new(self.paths.repo_root.to_string_lossy().into_owned())
    }

    // ── Main entry ───────────────────────────────────────────────────────

    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let started = std::time::Instant::now();
        self.state.cycle_count += 1;
        let cycle = self.state.cycle_count;
        self.metrics
            .emit("cycle", "started", Some(json!({ "cycle": cycle })));

        self.adjust_confidence().await?;

        if self.backpressure_skip() {
            self.state.cycle_count -= 1;
            self.metrics.emit("cycle", "skipped_backpressure", None);
            return Ok(CycleReport::empty(CycleVerdict::Skipped));
        }

        self.maybe_pull(cycle)?;

        // Baseline once per cycle; failing commands become healing targets.
        let baseline = capture_baseline(
            &self.paths.repo_root,
            &self.config.qa,
            &self.qa_stats,
            &self.paths.qa_baseline(),
        )
        .await?;

        // Scout against the next sector.
        let Some(pick) = self.sectors.pick_next(&self.git()).await else {
            info!("no sector with changes to offer");
            return Ok(CycleReport::empty(CycleVerdict::NoSectors));
        };
        self.state.current_sector = Some(pick.path.clone());

        let formula = resolve_formula(
            self.config.auto.formula.as_deref(),
            &self.run_state.snapshot().await.formula_stats,
            pick.allows_deep,
        );
        info!("cycle {cycle}: scouting {} with formula {}", pick.path, formula.name);
        self.state.active_formula = Some(formula.clone());

        let report = self.scout_with_retries(&pick.path, &pick.scope, &formula, &baseline).await?;
        self.sectors
            .record_scan(&pick.path, cycle, report.scanned_files, report.proposals.len() as u32)
            .await?;
        if let Some(re) = &report.reclassification {
            self.sectors.reclassify(&re.path, re.production, &re.purpose).await?;
        }
        if report.proposals.is_empty() {
            self.sectors.mark_session_scanned(&pick.path).await?;
        }

        // Filter and promote.
        let filter = self.filter_proposals(report.proposals.clone(), &formula, &baseline).await?;
        self.state.category_rejected_total += filter.dropped_category;
        info!(
            "cycle {cycle}: {} proposals, {} approved ({} dup, {} low, {} cooled, {} category)",
            report.proposals.len(),
            filter.approved.len(),
            filter.dropped_duplicate,
            filter.dropped_low,
            filter.dropped_cooldown,
            filter.dropped_category
        );

        let mut succeeded = 0u32;
        let mut failed = 0u32;
        let mut prs_created = 0u32;

        if self.state.mode == SessionMode::Spin && !filter.approved.is_empty() {
            let (s, f, p) = self.execute_waves(filter.approved.clone(), &baseline, &formula).await?;
            succeeded = s;
            failed = f;
            prs_created = p;
        } else {
            // Planning mode: promote only.
            for proposal in &filter.approved {
                let scope_fallback = pick.scope.clone();
                self.promote_proposal(proposal, &scope_fallback, &formula)?;
            }
        }

        let report = CycleReport {
            verdict: CycleVerdict::Completed,
            scanned_files: report.scanned_files,
            proposals: report.proposals.len() as u32,
            approved: filter.approved.len() as u32,
            succeeded,
            failed,
            prs_created,
        };

        self.post_maintenance(&report, started.elapsed().as_millis() as u64).await?;
        Ok(report)
    }

    // ── Pre-maintenance ──────────────────────────────────────────────────

    /// Phase adjustment, quality-rate floor, then calibration, clamped to
    /// [0, 80].
    async fn adjust_confidence(&mut self) -> Result<()> {
        let mut eff = i32::from(self.state.effective_min_confidence);

        let deep = self.state.active_formula.as_ref().map(|f| f.deep).unwrap_or(false);
        if deep {
            eff = (eff - 10).max(10);
        }

        let signals = self.run_state.snapshot().await.quality_signals;
        if self.state.cycle_count > 2 && signals.total_tickets > 0 {
            let rate = f64::from(signals.first_pass_success) / f64::from(signals.total_tickets);
            if rate < 0.5 {
                eff += 10;
            }
        }

        if self.state.cycle_count > 5 {
            let delta = self
                .qa_stats
                .calibrate_confidence(
                    &signals,
                    self.state.effective_min_confidence,
                    self.state.original_min_confidence,
                )
                .await?;
            eff += delta;
        }

        self.state.effective_min_confidence = eff.clamp(0, 80) as u8;
        Ok(())
    }

    /// Spin mode with PR-based delivery skips the cycle when pending PRs
    /// crowd the budget.
    fn backpressure_skip(&self) -> bool {
        if self.state.mode != SessionMode::Spin || !self.config.auto.delivery.uses_prs() {
            return false;
        }
        let max = self.config.auto.max_prs;
        if max == 0 {
            return false;
        }
        let ratio = self.state.pending_pr_urls.len() as f64 / f64::from(max);
        if ratio > BACKPRESSURE_RATIO {
            warn!(
                "backpressure: {} pending PRs against budget {max}, skipping cycle",
                self.state.pending_pr_urls.len()
            );
            return true;
        }
        false
    }

    fn maybe_pull(&self, cycle: u32) -> Result<()> {
        let interval = self.config.auto.pull_interval_cycles;
        if interval == 0 || cycle % interval != 0 {
            return Ok(());
        }
        let git = self.git();
        if let Err(e) = git.fetch_origin() {
            warn!("fetch origin: {e}");
            return Ok(());
        }
        if let Err(e) = git.pull_ff_only(&self.config.base_branch) {
            match self.config.auto.pull_policy {
                PullPolicy::Halt => bail!("base branch diverged from origin: {e}"),
                PullPolicy::Warn => warn!("base branch diverged from origin: {e}"),
            }
        }
        Ok(())
    }

    // ── Scout ────────────────────────────────────────────────────────────

    async fn scout_with_retries(
        &mut self,
        sector_path: &str,
        scope: &str,
        formula: &Formula,
        baseline: &QaBaseline,
    ) -> Result<ScoutReport> {
        let mut hints = drain_nudges(&self.paths.nudges());
        if !formula.hint.is_empty() {
            hints.push(formula.hint.clone());
        }

        let relevant = self
            .learnings
            .select_relevant(&[scope.to_string()], &self.qa_command_names(), None)
            .await;
        let ids: Vec<String> = relevant.iter().map(|l| l.id.clone()).collect();
        self.learnings.record_access(&ids).await?;
        let learnings_block = format_for_prompt(&relevant, None);

        let mut request = ScoutRequest {
            repo_root: self.paths.repo_root.to_string_lossy().into_owned(),
            scope: scope.to_string(),
            sector_path: sector_path.to_string(),
            categories: formula.categories.clone(),
            min_confidence: self.state.effective_min_confidence.max(formula.min_confidence),
            max_proposals: 8,
            learnings_block,
            recent_titles: self.dedup.recent_titles(20).await,
            baseline_failures: baseline.failures.clone(),
            escalation: None,
            hints,
        };

        let attempts = 1 + MAX_SCOUT_RETRIES + 2;
        let mut last = ScoutReport::default();
        for attempt in 0..attempts {
            if attempt > 0 {
                request.escalation = Some(format!(
                    "Previous scan of this scope found nothing actionable (attempt {attempt}). \
                     Look harder: smaller cleanups, missing tests, and unclear naming all count."
                ));
            }
            last = self.backend.scout(&request).await?;
            if !last.proposals.is_empty() {
                return Ok(last);
            }
            info!("scout attempt {} of {attempts} returned no proposals", attempt + 1);
        }
        Ok(last)
    }

    fn qa_command_names(&self) -> Vec<String> {
        self.config.qa.commands.iter().map(|c| c.cmd.clone()).collect()
    }

    // ── Filtering ────────────────────────────────────────────────────────

    async fn filter_proposals(
        &self,
        proposals: Vec<Proposal>,
        formula: &Formula,
        baseline: &QaBaseline,
    ) -> Result<FilterOutcome> {
        let existing_titles = self.store.open_ticket_titles()?;
        let open_branches: Vec<String> = self
            .git()
            .branches_with_prefix(BRANCH_PREFIX)
            .unwrap_or_default()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        let cooled = self.cooldown.cooled_map().await;

        let mut out = FilterOutcome {
            approved: Vec::new(),
            dropped_duplicate: 0,
            dropped_low: 0,
            dropped_cooldown: 0,
            dropped_category: 0,
        };

        for proposal in proposals {
            if is_duplicate_proposal(
                &proposal.title,
                &existing_titles,
                &open_branches,
                DEDUP_SIMILARITY_THRESHOLD,
                BRANCH_PREFIX,
            ) {
                out.dropped_duplicate += 1;
                continue;
            }
            if proposal.confidence < self.state.effective_min_confidence
                || proposal.impact_score < self.config.auto.min_impact_score
            {
                out.dropped_low += 1;
                continue;
            }
            if compute_cooldown_overlap(&proposal.files, &cooled) > COOLDOWN_OVERLAP_LIMIT {
                out.dropped_cooldown += 1;
                continue;
            }
            let fix_auto_allowed =
                proposal.category == Category::Fix && !baseline.failures.is_empty();
            if !formula.allows_category(proposal.category) && !fix_auto_allowed {
                out.dropped_category += 1;
                continue;
            }
            out.approved.push(proposal);
        }

        Ok(out)
    }

    fn promote_proposal(
        &self,
        proposal: &Proposal,
        scope_fallback: &str,
        formula: &Formula,
    ) -> Result<Ticket> {
        let allowed_paths = if proposal.allowed_paths.is_empty() {
            vec![scope_fallback.to_string()]
        } else {
            proposal.allowed_paths.clone()
        };
        let ticket = Ticket {
            id: 0,
            project_id: self.project.id,
            title: proposal.title.clone(),
            description: proposal.description.clone(),
            category: proposal.category,
            status: TicketStatus::Ready,
            allowed_paths,
            forbidden_paths: Vec::new(),
            verification_commands: proposal.verification_commands.clone(),
            metadata: TicketMetadata {
                scout_confidence: Some(proposal.confidence),
                estimated_complexity: Some(proposal.estimated_complexity),
                formula: Some(formula.name.clone()),
            },
            created_at: chrono::Utc::now(),
        };
        let id = self.store.insert_ticket(&ticket)?;
        let mut ticket = ticket;
        ticket.id = id;
        Ok(ticket)
    }

    // ── Wave execution ───────────────────────────────────────────────────

    async fn execute_waves(
        &mut self,
        approved: Vec<Proposal>,
        baseline: &QaBaseline,
        formula: &Formula,
    ) -> Result<(u32, u32, u32)> {
        let mut parallelism = self
            .config
            .auto
            .parallel
            .unwrap_or_else(|| adaptive_parallelism(&approved));
        if let Some(milestone) = &self.state.milestone {
            if milestone.ticket_count + 3 >= self.config.auto.milestone_size {
                parallelism = parallelism.min(2);
            }
        }

        let waves = partition_into_waves(approved, self.config.auto.sensitivity);
        info!("{} waves, parallelism {parallelism}", waves.len());

        let mut succeeded = 0u32;
        let mut failed = 0u32;
        let mut prs_created = 0u32;

        for (i, wave) in waves.into_iter().enumerate() {
            if self.state.shutdown_requested() {
                break;
            }
            info!("wave {} with {} tickets", i + 1, wave.len());

            // Promote and spawn the wave behind a permit semaphore.
            let semaphore = Arc::new(Semaphore::new(parallelism));
            let mut handles = Vec::new();
            for proposal in wave {
                let scope_fallback = self
                    .state
                    .current_sector
                    .as_ref()
                    .map(|s| format!("{s}/**"))
                    .unwrap_or_else(|| "**".to_string());
                let ticket = match self.promote_proposal(&proposal, &scope_fallback, formula) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("promote proposal {:?}: {e}", proposal.title);
                        continue;
                    }
                };
                let worker = Worker {
                    store: Arc::clone(&self.store),
                    backend: Arc::clone(&self.backend),
                    learnings: Arc::clone(&self.learnings),
                    qa_stats: Arc::clone(&self.qa_stats),
                    metrics: Arc::clone(&self.metrics),
                    paths: self.paths.clone(),
                    config: self.config.clone(),
                    baseline: baseline.clone(),
                    worktree_create_lock: Arc::clone(&self.worktree_create_lock),
                    project_id: self.project.id,
                };
                let semaphore = Arc::clone(&semaphore);
                handles.push(tokio::spawn(async move {
                    // Acquire fails only when the semaphore is closed, which
                    // never happens here.
                    let Ok(_permit) = semaphore.acquire().await else {
                        return None;
                    };
                    Some(worker.run_ticket(ticket).await)
                }));
            }

            let mut conflicted: Vec<WorkerResult> = Vec::new();
            for handle in handles {
                let result = match handle.await {
                    Ok(Some(r)) => r,
                    Ok(None) => continue,
                    Err(e) => {
                        error!("worker task panicked: {e}");
                        continue;
                    }
                };
                match self.deliver(result, formula).await {
                    Ok(Delivery::Succeeded { pr }) => {
                        succeeded += 1;
                        if pr {
                            prs_created += 1;
                        }
                    }
                    Ok(Delivery::Failed) => failed += 1,
                    Ok(Delivery::MergeConflicted(result)) => conflicted.push(result),
                    Err(e) => {
                        error!("delivery error: {e}");
                        failed += 1;
                    }
                }
            }

            // Sequential retry of merge-conflicted tickets against the
            // milestone branch.
            for result in conflicted {
                match self.retry_milestone_merge(result).await {
                    Ok(true) => succeeded += 1,
                    Ok(false) => failed += 1,
                    Err(e) => {
                        error!("milestone retry error: {e}");
                        failed += 1;
                    }
                }
            }
        }

        Ok((succeeded, failed, prs_created))
    }

    // ── Delivery ─────────────────────────────────────────────────────────

    async fn deliver(&mut self, result: WorkerResult, formula: &Formula) -> Result<Delivery> {
        let ticket = result.ticket.clone();
        let first_pass = result.outcome.success && result.first_attempt;
        self.run_state.record_ticket_outcome(first_pass).await?;
        self.record_formula_ticket(formula, result.outcome.success).await?;
        self.outcomes.push(OutcomeRecord {
            category: ticket.category,
            success: result.outcome.success,
            formula: Some(formula.name.clone()),
        });

        // Feed the ticket's outcome back into the learnings it was given.
        for id in &result.learning_ids {
            self.learnings.record_application(id).await?;
            self.learnings.record_outcome(id, result.outcome.success).await?;
        }
        if !result.diff_stat.is_empty() {
            let diff = result.diff_stat.clone();
            self.run_state.update(move |s| s.recent_diffs.push(diff)).await?;
        }

        if result.outcome.completion_outcome == Some(CompletionOutcome::NoChangesNeeded) {
            self.dedup.record(&ticket.title, true, Vec::new()).await?;
            return Ok(Delivery::Succeeded { pr: false });
        }

        if !result.outcome.success {
            self.dedup.record(&ticket.title, false, Vec::new()).await?;
            self.synthesize_failure_learning(&ticket, &result.outcome).await?;
            if result.outcome.spindle.is_some() {
                self.state.spindle_recoveries += 1;
            }
            return Ok(Delivery::Failed);
        }

        let git = self.git();
        let delivered = match self.config.auto.delivery {
            DeliveryMode::Direct => {
                // The commit stays on the ticket branch; nothing is pushed.
                self.store.update_ticket_status(ticket.id, TicketStatus::Done)?;
                Delivery::Succeeded { pr: false }
            }
            DeliveryMode::Milestone => {
                self.ensure_milestone(&git)?;
                let milestone = self.state.milestone.clone().context("milestone missing")?;
                match git.merge_branch(&milestone.worktree, &result.branch) {
                    Ok(()) => {
                        self.store.update_ticket_status(ticket.id, TicketStatus::Done)?;
                        self.bump_milestone(&git).await?;
                        Delivery::Succeeded { pr: false }
                    }
                    Err(e) => {
                        warn!("milestone merge conflict for {}: {e}", result.branch);
                        self.store.update_ticket_status(ticket.id, TicketStatus::Blocked)?;
                        return Ok(Delivery::MergeConflicted(result));
                    }
                }
            }
            DeliveryMode::Pr | DeliveryMode::AutoMerge => {
                let pr_url = match self.create_pr(&result.branch, &ticket.title).await {
                    Ok(url) => {
                        self.record_step(result.run_id, 7, "pr", StepKind::Command, StepStatus::Success, None);
                        url
                    }
                    Err(e) => {
                        self.record_step(
                            result.run_id,
                            7,
                            "pr",
                            StepKind::Command,
                            StepStatus::Failed,
                            Some(&e.to_string()),
                        );
                        return Err(e.context("gh pr create"));
                    }
                };
                self.store.set_run_pr_url(result.run_id, &pr_url)?;
                self.store.update_ticket_status(ticket.id, TicketStatus::Done)?;
                self.state.pending_pr_urls.push(pr_url.clone());
                self.state.total_prs += 1;
                self.cooldown.note_pr(&result.changed_files, &pr_url).await?;
                self.record_formula_pr(formula).await?;
                if self.config.auto.delivery == DeliveryMode::AutoMerge {
                    if let Err(e) = self.auto_merge(&result.branch).await {
                        warn!("auto-merge for {}: {e}", result.branch);
                    }
                }
                Delivery::Succeeded { pr: true }
            }
        };

        if let Some(sector) = self.state.current_sector.clone() {
            self.sectors
                .record_category_success(&sector, ticket.category.as_str())
                .await?;
        }
        self.dedup.record(&ticket.title, true, Vec::new()).await?;
        if !matches!(self.config.auto.delivery, DeliveryMode::Direct) {
            let status = match git.remove_worktree(&result.worktree) {
                Ok(()) => StepStatus::Success,
                Err(_) => StepStatus::Skipped,
            };
            self.record_step(result.run_id, 8, "cleanup", StepKind::Git, status, None);
        }
        Ok(delivered)
    }

    fn record_step(
        &self,
        run_id: i64,
        ordinal: i64,
        name: &str,
        kind: StepKind,
        status: StepStatus,
        error: Option<&str>,
    ) {
        if run_id == 0 {
            return;
        }
        match self.store.add_step(run_id, ordinal, name, kind) {
            Ok(step_id) => {
                if let Err(e) = self.store.finish_step(step_id, status, 0, error) {
                    warn!("finish_step {name}: {e}");
                }
            }
            Err(e) => warn!("add_step {name}: {e}"),
        }
    }

    fn ensure_milestone(&mut self, git: &Git) -> Result<()> {
        if self.state.milestone.is_some() {
            return Ok(());
        }
        self.state.milestone_seq += 1;
        let branch = format!("{BRANCH_PREFIX}milestone_{}", self.state.milestone_seq);
        let wt = self
            .paths
            .worktrees_dir()
            .join(format!("milestone_{}", self.state.milestone_seq))
            .to_string_lossy()
            .into_owned();
        std::fs::create_dir_all(self.paths.worktrees_dir()).ok();
        git.create_worktree(&wt, &branch, &self.config.base_branch)?;
        info!("opened milestone {branch}");
        self.state.milestone = Some(Milestone {
            branch,
            worktree: wt,
            ticket_count: 0,
        });
        Ok(())
    }

    async fn bump_milestone(&mut self, git: &Git) -> Result<()> {
        let full = {
            let Some(milestone) = self.state.milestone.as_mut() else {
                return Ok(());
            };
            milestone.ticket_count += 1;
            milestone.ticket_count >= self.config.auto.milestone_size
        };
        if full {
            self.finalize_milestone(git).await?;
        }
        Ok(())
    }

    /// Push the milestone branch and open its single PR.
    pub async fn finalize_milestone(&mut self, git: &Git) -> Result<()> {
        let Some(milestone) = self.state.milestone.take() else {
            return Ok(());
        };
        if milestone.ticket_count == 0 {
            let _ = git.remove_worktree(&milestone.worktree);
            return Ok(());
        }
        git.push_branch(&milestone.worktree, &milestone.branch)?;
        let title = format!("burnish milestone: {} tickets", milestone.ticket_count);
        let pr_url = self.create_pr(&milestone.branch, &title).await?;
        info!("milestone finalized: {pr_url}");
        self.state.pending_pr_urls.push(pr_url);
        self.state.total_prs += 1;
        let _ = git.remove_worktree(&milestone.worktree);
        Ok(())
    }

    async fn retry_milestone_merge(&mut self, result: WorkerResult) -> Result<bool> {
        let git = self.git();
        self.ensure_milestone(&git)?;
        let milestone = self.state.milestone.clone().context("milestone missing")?;
        match git.merge_branch(&milestone.worktree, &result.branch) {
            Ok(()) => {
                self.store
                    .update_ticket_status(result.ticket.id, TicketStatus::Done)?;
                self.bump_milestone(&git).await?;
                let _ = git.remove_worktree(&result.worktree);
                Ok(true)
            }
            Err(e) => {
                warn!("sequential milestone retry still conflicts for {}: {e}", result.branch);
                Ok(false)
            }
        }
    }

    async fn create_pr(&self, branch: &str, title: &str) -> Result<String> {
        let sanitized: String = title
            .chars()
            .take(100)
            .map(|c| if "\"\\$`".contains(c) { ' ' } else { c })
            .collect();
        let out = sh(
            &self.paths.repo_root,
            &format!(
                r#"gh pr create --base {} --head {branch} --title "{sanitized}" --body "Automated improvement.""#,
                self.config.base_branch
            ),
        )
        .await?;
        if out.exit_code != 0 {
            if out.stderr.contains("No commits between") {
                bail!("no commits between {branch} and base");
            }
            bail!("gh pr create failed: {}", out.stderr.trim());
        }
        // gh prints the PR URL on stdout.
        let url = out
            .stdout
            .lines()
            .rev()
            .find(|l| l.starts_with("http"))
            .context("gh pr create printed no URL")?
            .trim()
            .to_string();
        Ok(url)
    }

    async fn auto_merge(&self, branch: &str) -> Result<()> {
        let out = sh(
            &self.paths.repo_root,
            &format!("gh pr merge {branch} --auto --squash"),
        )
        .await?;
        if out.exit_code != 0 {
            bail!("gh pr merge --auto failed: {}", out.stderr.trim());
        }
        Ok(())
    }

    async fn record_formula_ticket(&self, formula: &Formula, success: bool) -> Result<()> {
        let name = formula.name.clone();
        self.run_state
            .update(move |s| {
                let stats = s.formula_stats.entry(name).or_default();
                stats.tickets += 1;
                if success {
                    stats.successes += 1;
                }
            })
            .await
    }

    async fn record_formula_pr(&self, formula: &Formula) -> Result<()> {
        let name = formula.name.clone();
        self.run_state
            .update(move |s| {
                s.formula_stats.entry(name).or_default();
            })
            .await
    }

    async fn synthesize_failure_learning(
        &self,
        ticket: &Ticket,
        outcome: &TicketOutcome,
    ) -> Result<()> {
        let reason = outcome.failure_reason.unwrap_or(FailureReason::AgentError);
        let (source, detail) = match reason {
            FailureReason::QaFailed => (LearningSource::QaFailure, None),
            FailureReason::ScopeViolation => (LearningSource::ScopeViolation, None),
            FailureReason::SpindleAbort => (
                LearningSource::TicketFailure,
                outcome.spindle.as_ref().map(|s| format!("{} ({:.2})", s.signal, s.confidence)),
            ),
            _ => (LearningSource::TicketFailure, None),
        };
        let error = outcome.error.as_deref().unwrap_or("unknown error");
        let text = format!(
            "Ticket \"{}\" ({}) failed: {}",
            ticket.title,
            ticket.category.as_str(),
            error
        );
        let mut tags = vec![
            format!("failureType:{}", reason.failure_type()),
            format!("category:{}", ticket.category.as_str()),
        ];
        for path in ticket.allowed_paths.iter().take(3) {
            tags.push(format!("path:{}", path.trim_end_matches("/**")));
        }
        self.learnings
            .add(&text, LearningCategory::Gotcha, source, detail, tags)
            .await?;
        Ok(())
    }

    // ── Post-maintenance ─────────────────────────────────────────────────

    async fn post_maintenance(&mut self, report: &CycleReport, duration_ms: u64) -> Result<()> {
        let cycle = self.state.cycle_count;
        let docs_audit_ran = self
            .state
            .active_formula
            .as_ref()
            .map(|f| f.name == "docs-audit")
            .unwrap_or(false);
        if docs_audit_ran {
            self.run_state
                .update(move |s| s.last_docs_audit_cycle = cycle)
                .await?;
        }
        self.run_state
            .record_cycle(CycleSummary {
                cycle,
                sector: self.state.current_sector.clone().unwrap_or_default(),
                scanned_files: report.scanned_files,
                proposals: report.proposals,
                approved: report.approved,
                tickets_succeeded: report.succeeded,
                tickets_failed: report.failed,
                prs_created: report.prs_created,
                duration_ms,
                at: Some(chrono::Utc::now()),
            })
            .await?;

        if cycle >= 3 && self.config.auto.learnings_enabled {
            let existing = self.learnings.all().await;
            let qa = self.qa_stats.snapshot().await;
            let formula_stats = self.run_state.snapshot().await.formula_stats;
            let insights = extract_insights(&self.outcomes, &qa, &formula_stats, &existing);
            for insight in insights {
                self.learnings
                    .add(
                        &insight.text,
                        insight.category,
                        LearningSource::ProcessInsight,
                        None,
                        insight.tags,
                    )
                    .await?;
            }
        }

        if cycle % 5 == 0 {
            self.learnings.consolidate().await?;
        }

        let tuned = self.qa_stats.auto_tune(&mut self.config.qa).await?;
        if !tuned.is_empty() {
            self.config.save(&self.paths)?;
        }

        if let Err(e) = self.reconcile_pending_prs().await {
            warn!("reconcile pending PRs: {e}");
        }

        if cycle >= 2 {
            info!(
                "cycle {cycle} digest: {} proposals, {} approved, {} ok / {} failed, {} PRs, min-confidence {}",
                report.proposals,
                report.approved,
                report.succeeded,
                report.failed,
                report.prs_created,
                self.state.effective_min_confidence
            );
        }

        self.check_diminishing_returns(report);
        self.metrics.emit(
            "cycle",
            "finished",
            Some(json!({
                "cycle": cycle,
                "approved": report.approved,
                "succeeded": report.succeeded,
                "failed": report.failed,
            })),
        );
        Ok(())
    }

    /// Poll pending PR states via `gh`; merged or closed PRs leave the
    /// backpressure set, release their file cooldowns, and feed the formula
    /// merge-rate stats.
    async fn reconcile_pending_prs(&mut self) -> Result<()> {
        if !self.config.auto.delivery.uses_prs() || self.state.pending_pr_urls.is_empty() {
            return Ok(());
        }
        let mut resolved: Vec<(String, bool)> = Vec::new();
        for url in self.state.pending_pr_urls.clone() {
            let out = sh(
                &self.paths.repo_root,
                &format!("gh pr view {url} --json state --jq .state 2>/dev/null"),
            )
            .await?;
            if out.exit_code != 0 {
                continue;
            }
            match out.stdout.trim() {
                "MERGED" => resolved.push((url, true)),
                "CLOSED" => resolved.push((url, false)),
                _ => {}
            }
        }
        if resolved.is_empty() {
            return Ok(());
        }

        let urls: Vec<String> = resolved.iter().map(|(u, _)| u.clone()).collect();
        self.state.pending_pr_urls.retain(|u| !urls.contains(u));
        self.cooldown.remove_pr_entries(&urls).await?;

        let formula_name = self
            .state
            .active_formula
            .as_ref()
            .map(|f| f.name.clone())
            .unwrap_or_else(|| "balanced".into());
        let merged = resolved.iter().filter(|(_, m)| *m).count() as u32;
        let closed = resolved.len() as u32 - merged;
        self.run_state
            .update(move |s| {
                let stats = s.formula_stats.entry(formula_name).or_default();
                stats.prs_merged += merged;
                stats.prs_closed += closed;
            })
            .await?;
        info!("reconciled {} resolved PRs ({merged} merged)", resolved.len());
        Ok(())
    }

    // ── Manual stepping (scout / run verbs) ──────────────────────────────

    /// One scout pass against an explicit scope. Survivor proposals are
    /// parked in run-state as deferred, for a later `approve`.
    pub async fn scout_once(&mut self, scope: &str) -> Result<Vec<Proposal>> {
        let baseline = capture_baseline(
            &self.paths.repo_root,
            &self.config.qa,
            &self.qa_stats,
            &self.paths.qa_baseline(),
        )
        .await?;
        let formula = resolve_formula(self.config.auto.formula.as_deref(), &Default::default(), true);
        let sector = scope.trim_end_matches("/**").to_string();
        self.state.current_sector = Some(sector.clone());
        let report = self
            .scout_with_retries(&sector, scope, &formula, &baseline)
            .await?;
        let filtered = self.filter_proposals(report.proposals, &formula, &baseline).await?;
        let approved = filtered.approved.clone();
        self.run_state
            .update(move |s| {
                s.deferred_proposals.extend(filtered.approved);
            })
            .await?;
        Ok(approved)
    }

    /// Promote deferred proposals by index (empty selection = all). Returns
    /// the created tickets.
    pub async fn approve_deferred(&mut self, selection: &[usize]) -> Result<Vec<Ticket>> {
        let formula = resolve_formula(self.config.auto.formula.as_deref(), &Default::default(), true);
        let deferred = self
            .run_state
            .update(|s| std::mem::take(&mut s.deferred_proposals))
            .await?;
        let mut promoted = Vec::new();
        let mut returned = Vec::new();
        for (i, proposal) in deferred.into_iter().enumerate() {
            if selection.is_empty() || selection.contains(&i) {
                promoted.push(self.promote_proposal(&proposal, "**", &formula)?);
            } else {
                returned.push(proposal);
            }
        }
        if !returned.is_empty() {
            self.run_state
                .update(move |s| s.deferred_proposals.extend(returned))
                .await?;
        }
        Ok(promoted)
    }

    /// Execute one existing ticket end to end, including delivery. Returns
    /// true on success.
    pub async fn execute_single_ticket(&mut self, ticket_id: i64) -> Result<bool> {
        let ticket = self
            .store
            .get_ticket(ticket_id)?
            .with_context(|| format!("no ticket #{ticket_id}"))?;
        let baseline = capture_baseline(
            &self.paths.repo_root,
            &self.config.qa,
            &self.qa_stats,
            &self.paths.qa_baseline(),
        )
        .await?;
        let formula = resolve_formula(self.config.auto.formula.as_deref(), &Default::default(), true);
        let worker = Worker {
            store: Arc::clone(&self.store),
            backend: Arc::clone(&self.backend),
            learnings: Arc::clone(&self.learnings),
            qa_stats: Arc::clone(&self.qa_stats),
            metrics: Arc::clone(&self.metrics),
            paths: self.paths.clone(),
            config: self.config.clone(),
            baseline,
            worktree_create_lock: Arc::clone(&self.worktree_create_lock),
            project_id: self.project.id,
        };
        let result = worker.run_ticket(ticket).await;
        let success = result.outcome.success;
        match self.deliver(result, &formula).await? {
            Delivery::Succeeded { .. } => Ok(success),
            Delivery::Failed => Ok(false),
            Delivery::MergeConflicted(result) => self.retry_milestone_merge(result).await,
        }
    }

    fn check_diminishing_returns(&mut self, report: &CycleReport) {
        if self.state.cycle_count <= 2 {
            return;
        }
        let yield_rate = f64::from(report.approved) / f64::from(report.scanned_files.max(1));
        if yield_rate < LOW_YIELD_RATE {
            self.state.consecutive_low_yield += 1;
        } else {
            self.state.consecutive_low_yield = 0;
        }
        if self.state.consecutive_low_yield >= LOW_YIELD_LIMIT {
            let mut reason =
                format!("Diminishing returns: {LOW_YIELD_LIMIT} consecutive low-yield cycles. Stopping.");
            if self.state.category_rejected_total > 0 {
                reason.push_str(&format!(
                    " ({} proposals rejected by category — consider broadening categories)",
                    self.state.category_rejected_total
                ));
            }
            self.state.request_shutdown(reason);
        }
    }
}

enum Delivery {
    Succeeded { pr: bool },
    Failed,
    MergeConflicted(WorkerResult),
}

// ── Ticket worker ────────────────────────────────────────────────────────

/// Everything a ticket worker needs, cloneable into a spawned task.
struct Worker {
    store: Arc<Store>,
    backend: Arc<dyn AgentBackend>,
    learnings: Arc<LearningStore>,
    qa_stats: Arc<QaStatsStore>,
    metrics: Arc<MetricsSink>,
    paths: StatePaths,
    config: SessionConfig,
    baseline: QaBaseline,
    worktree_create_lock: Arc<Mutex<()>>,
    project_id: i64,
}

struct StepTimer {
    step_id: i64,
    started: std::time::Instant,
}

impl Worker {
    fn git(&self) -> Git {
        Git::new(self.paths.repo_root.to_string_lossy().into_owned())
    }

    fn start_step(&self, run_id: i64, ordinal: i64, name: &str, kind: StepKind) -> Option<StepTimer> {
        match self.store.add_step(run_id, ordinal, name, kind) {
            Ok(step_id) => Some(StepTimer {
                step_id,
                started: std::time::Instant::now(),
            }),
            Err(e) => {
                warn!("add_step {name}: {e}");
                None
            }
        }
    }

    fn end_step(&self, timer: Option<StepTimer>, status: StepStatus, error: Option<&str>) {
        if let Some(t) = timer {
            let elapsed = t.started.elapsed().as_millis() as i64;
            if let Err(e) = self.store.finish_step(t.step_id, status, elapsed, error) {
                warn!("finish_step: {e}");
            }
        }
    }

    /// Drive one ticket to completion, retrying on scope expansion.
    async fn run_ticket(&self, ticket: Ticket) -> WorkerResult {
        let mut current = ticket;
        for attempt in 0..=MAX_SCOPE_EXPANSION_RETRIES {
            let result = self.run_attempt(current.clone(), attempt).await;
            if result.outcome.scope_expanded {
                if attempt < MAX_SCOPE_EXPANSION_RETRIES {
                    info!(
                        "ticket #{} expanded its scope, retrying (attempt {})",
                        current.id,
                        attempt + 1
                    );
                    // Re-fetch: the agent widened the ticket's paths.
                    if let Ok(Some(refreshed)) = self.store.get_ticket(current.id) {
                        current = refreshed;
                    }
                    continue;
                }
                return self.fail(
                    result,
                    FailureReason::AgentError,
                    "scope expansion retries exhausted",
                );
            }
            return result;
        }
        // Unreachable: the final attempt always returns above.
        let _ = self
            .store
            .update_ticket_status(current.id, TicketStatus::Blocked);
        WorkerResult {
            run_id: 0,
            branch: String::new(),
            worktree: String::new(),
            outcome: TicketOutcome::failed(FailureReason::AgentError, "scope expansion retries exhausted"),
            changed_files: Vec::new(),
            first_attempt: false,
            learning_ids: Vec::new(),
            diff_stat: String::new(),
            ticket: current,
        }
    }

    async fn run_attempt(&self, ticket: Ticket, attempt: u32) -> WorkerResult {
        let mut result = WorkerResult {
            ticket: ticket.clone(),
            run_id: 0,
            branch: String::new(),
            worktree: String::new(),
            outcome: TicketOutcome::default(),
            changed_files: Vec::new(),
            first_attempt: attempt == 0,
            learning_ids: Vec::new(),
            diff_stat: String::new(),
        };

        if let Err(e) = self
            .store
            .update_ticket_status(ticket.id, TicketStatus::InProgress)
        {
            result.outcome = TicketOutcome::failed(FailureReason::AgentError, e.to_string());
            return result;
        }
        let run_id = match self
            .store
            .insert_run(self.project_id, RunType::Worker, Some(ticket.id))
        {
            Ok(id) => id,
            Err(e) => {
                result.outcome = TicketOutcome::failed(FailureReason::AgentError, e.to_string());
                return result;
            }
        };
        result.run_id = run_id;
        self.metrics
            .emit("ticket", "started", Some(json!({ "ticket": ticket.id, "run": run_id })));

        let relevant = self
            .learnings
            .select_relevant(
                &ticket.allowed_paths,
                &ticket.verification_commands,
                Some(&ticket.title),
            )
            .await;
        let ids: Vec<String> = relevant.iter().map(|l| l.id.clone()).collect();
        if let Err(e) = self.learnings.record_access(&ids).await {
            warn!("record_access: {e}");
        }
        result.learning_ids = ids;
        let learnings_block = format_for_prompt(&relevant, None);

        let adaptive_risk = if relevant
            .iter()
            .any(|l| l.category == LearningCategory::Warning)
        {
            Risk::High
        } else {
            Risk::Medium
        };
        let constraints = derive_constraints(&ticket, &relevant, adaptive_risk);

        let git = self.git();
        let branch = format!("{BRANCH_PREFIX}tkt_{}/{}", ticket.id, slugify(&ticket.title));
        let wt = worktree_path(&self.paths.worktrees_dir(), ticket.id);
        result.branch = branch.clone();
        result.worktree = wt.clone();

        // worktree
        let timer = self.start_step(run_id, 1, "worktree", StepKind::Git);
        std::fs::create_dir_all(self.paths.worktrees_dir()).ok();
        let created = {
            let _lock = self.worktree_create_lock.lock().await;
            let _ = git.remove_worktree(&wt);
            git.prune_worktrees();
            let _ = git.delete_branch(&branch);
            git.create_worktree(&wt, &branch, &self.config.base_branch)
        };
        if let Err(e) = created {
            self.end_step(timer, StepStatus::Failed, Some(&e.to_string()));
            return self.fail(result, FailureReason::AgentError, &e.to_string());
        }
        self.end_step(timer, StepStatus::Success, None);
        if let Err(e) = self.store.set_run_branch(run_id, &branch) {
            warn!("set_run_branch: {e}");
        }

        // agent
        let timer = self.start_step(run_id, 2, "agent", StepKind::Internal);
        let request = ExecuteRequest {
            ticket: ticket.clone(),
            repo_root: self.paths.repo_root.to_string_lossy().into_owned(),
            worktree_path: wt.clone(),
            branch: branch.clone(),
            base_branch: self.config.base_branch.clone(),
            learnings_block,
            constraints: constraints.clone(),
            attempt,
        };
        let outcome = match self.backend.execute(&request).await {
            Ok(o) => o,
            Err(e) => {
                error!("backend.execute for ticket #{}: {e}", ticket.id);
                TicketOutcome::failed(FailureReason::AgentError, e.to_string())
            }
        };
        self.end_step(
            timer,
            if outcome.success { StepStatus::Success } else { StepStatus::Failed },
            outcome.error.as_deref(),
        );

        if outcome.scope_expanded {
            let _ = self.store.finish_run(run_id, RunStatus::Failure, Some("scope expanded"));
            result.outcome = outcome;
            return result;
        }

        if outcome.completion_outcome == Some(CompletionOutcome::NoChangesNeeded) {
            let _ = self.store.finish_run(run_id, RunStatus::Success, None);
            let _ = self.store.update_ticket_status(ticket.id, TicketStatus::Done);
            let _ = git.remove_worktree(&wt);
            result.outcome = outcome;
            return result;
        }

        if !outcome.success {
            let reason = outcome.failure_reason.unwrap_or(FailureReason::AgentError);
            let error = outcome.error.clone().unwrap_or_else(|| "agent failure".into());
            result.outcome = outcome;
            return self.fail(result, reason, &error);
        }

        // scope
        let timer = self.start_step(run_id, 3, "scope", StepKind::Internal);
        let changed = match git.changed_files(&wt, &self.config.base_branch) {
            Ok(files) => files,
            Err(e) => {
                self.end_step(timer, StepStatus::Failed, Some(&e.to_string()));
                return self.fail(result, FailureReason::AgentError, &e.to_string());
            }
        };
        if changed.is_empty() {
            self.end_step(timer, StepStatus::Success, None);
            let _ = self.store.finish_run(run_id, RunStatus::Success, None);
            let _ = self.store.update_ticket_status(ticket.id, TicketStatus::Done);
            let _ = git.remove_worktree(&wt);
            result.outcome = TicketOutcome::no_changes();
            return result;
        }
        let violations = check_changed_files(&changed, &constraints);
        if !violations.is_empty() {
            let summary = violations
                .iter()
                .map(|v| format!("{}: {}", v.file, v.violation))
                .collect::<Vec<_>>()
                .join("; ");
            self.end_step(timer, StepStatus::Failed, Some(&summary));
            self.write_violations_artifact(run_id, &violations);
            return self.fail(result, FailureReason::ScopeViolation, &summary);
        }
        self.end_step(timer, StepStatus::Success, None);
        result.changed_files = changed;

        // commit
        let timer = self.start_step(run_id, 4, "commit", StepKind::Git);
        let message = format!("{}: {}", ticket.category.as_str(), ticket.title);
        match git.commit_all(&wt, &message) {
            Ok(_) => self.end_step(timer, StepStatus::Success, None),
            Err(e) => {
                self.end_step(timer, StepStatus::Failed, Some(&e.to_string()));
                return self.fail(result, FailureReason::AgentError, &e.to_string());
            }
        }

        // push (PR-based delivery only)
        if self.config.auto.delivery.uses_prs() && self.config.auto.delivery != DeliveryMode::Milestone
        {
            let timer = self.start_step(run_id, 5, "push", StepKind::Git);
            if let Err(e) = git.push_branch(&wt, &branch) {
                self.end_step(timer, StepStatus::Failed, Some(&e.to_string()));
                return self.fail(result, FailureReason::AgentError, &e.to_string());
            }
            self.end_step(timer, StepStatus::Success, None);
        } else {
            let timer = self.start_step(run_id, 5, "push", StepKind::Git);
            self.end_step(timer, StepStatus::Skipped, None);
        }

        // qa
        let timer = self.start_step(run_id, 6, "qa", StepKind::Command);
        let qa_report = match run_qa_round(
            Path::new(&wt),
            &self.config.qa,
            &self.baseline,
            &ticket.verification_commands,
            &self.qa_stats,
        )
        .await
        {
            Ok(r) => r,
            Err(e) => {
                self.end_step(timer, StepStatus::Failed, Some(&e.to_string()));
                return self.fail(result, FailureReason::QaFailed, &e.to_string());
            }
        };
        if !qa_report.passed {
            let summary = qa_report
                .failures
                .iter()
                .map(|f| format!("{}: {}", f.name, f.output.chars().take(200).collect::<String>()))
                .collect::<Vec<_>>()
                .join("\n");
            self.end_step(timer, StepStatus::Failed, Some(&summary));
            return self.fail(result, FailureReason::QaFailed, &summary);
        }
        self.end_step(timer, StepStatus::Success, None);
        result.diff_stat = git
            .diff_stat(&wt, &self.config.base_branch)
            .unwrap_or_default()
            .trim()
            .to_string();

        let _ = self.store.finish_run(run_id, RunStatus::Success, None);
        result.outcome = TicketOutcome {
            success: true,
            branch: Some(branch),
            ..TicketOutcome::default()
        };
        result
    }

    fn fail(&self, mut result: WorkerResult, reason: FailureReason, error: &str) -> WorkerResult {
        if result.run_id != 0 {
            let _ = self
                .store
                .finish_run(result.run_id, RunStatus::Failure, Some(error));
        }
        let _ = self
            .store
            .update_ticket_status(result.ticket.id, TicketStatus::Blocked);
        if !result.worktree.is_empty() {
            let _ = self.git().remove_worktree(&result.worktree);
        }
        self.metrics.emit(
            "ticket",
            "failed",
            Some(json!({
                "ticket": result.ticket.id,
                "reason": reason.failure_type(),
            })),
        );
        // Keep a richer outcome the agent already reported.
        if result.outcome.success || result.outcome.failure_reason.is_none() {
            result.outcome = TicketOutcome::failed(reason, error);
        }
        result
    }

    fn write_violations_artifact(&self, run_id: i64, violations: &[ScopeViolationEntry]) {
        let dir = self.paths.artifacts_dir().join(format!("run_{run_id}"));
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("create artifacts dir: {e}");
            return;
        }
        if let Err(e) = save_json(&dir.join("violations.json"), &violations.to_vec()) {
            warn!("write violations artifact: {e}");
        }
    }
}

// ── Shell helper ─────────────────────────────────────────────────────────

pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Run a shell command (used for `gh`) and capture its output.
pub async fn sh(dir: &Path, cmd: &str) -> Result<ShellOutput> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("failed to spawn: {cmd}"))?;
    Ok(ShellOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(1),
    })
}
