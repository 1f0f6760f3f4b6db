use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::SpindleConfig;
use crate::scope::{derive_constraints, ScopeConstraints};
use crate::spindle::{Spindle, SpindleDecision};
use crate::types::{CompletionOutcome, Proposal, Risk, Ticket, TicketOutcome};

const MAX_PLAN_REJECTIONS: u32 = 3;
const MAX_QA_RETRIES: u32 = 3;
const WORKER_STALL_STEPS: u32 = 50;
const BUDGET_WARN_RATIO: f64 = 0.8;

// ── Phases ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Scout,
    NextTicket,
    Plan,
    Execute,
    Qa,
    Pr,
    ParallelExecute,
    Done,
    BlockedNeedsHuman,
    FailedBudget,
    FailedValidation,
    FailedSpindle,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done
                | Self::BlockedNeedsHuman
                | Self::FailedBudget
                | Self::FailedValidation
                | Self::FailedSpindle
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NextAction {
    Prompt,
    Stop,
}

/// What the loop client reports back into each `advance()` call.
#[derive(Debug, Clone)]
pub enum StepInput {
    Tick,
    ScoutResult { proposals: Vec<Proposal> },
    PlanDecision { approved: bool, feedback: Option<String> },
    ExecuteResult { outcome: TicketOutcome },
    QaResult { passed: bool, failing_commands: Vec<String>, context: String },
    PrResult { ok: bool, validation_error: Option<String> },
    WorkerReport { worker: usize, done: bool, progressed: bool },
}

/// One `advance()` result: either the next prompt with its constraints, or a
/// terminal stop.
#[derive(Debug, Clone)]
pub struct AdvanceOutcome {
    pub next_action: NextAction,
    pub phase: Phase,
    pub prompt: Option<String>,
    pub reason: String,
    pub constraints: Option<ScopeConstraints>,
    pub digest: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AdvanceBudgets {
    pub step_budget: u32,
    pub time_budget: Duration,
    pub cycle_budget: u32,
    pub pr_budget: u32,
    pub ticket_step_budget: u32,
    pub parallel: usize,
}

impl Default for AdvanceBudgets {
    fn default() -> Self {
        Self {
            step_budget: 200,
            time_budget: Duration::from_secs(2 * 60 * 60),
            cycle_budget: 10,
            pr_budget: 10,
            ticket_step_budget: 30,
            parallel: 1,
        }
    }
}

#[derive(Debug, Clone)]
struct WorkerSlot {
    ticket: Ticket,
    last_progress_step: u32,
    done: bool,
    failed: bool,
}

// ── Machine ──────────────────────────────────────────────────────────────

/// Deterministic `advance()` state machine for the plugin-driven loop. The
/// plugin reports each step's result; the machine returns the next prompt
/// and constraints, enforcing budgets, spindle recovery, and phase
/// transitions.
pub struct AdvanceMachine {
    phase: Phase,
    budgets: AdvanceBudgets,
    step_count: u32,
    started_at: Instant,
    cycle_count: u32,
    pr_count: u32,
    ready: VecDeque<Ticket>,
    current: Option<Ticket>,
    plan_rejections: u32,
    qa_retries: u32,
    ticket_steps: u32,
    last_qa_context: String,
    workers: Vec<WorkerSlot>,
    spindle: Spindle,
    spindle_recoveries: u32,
    max_recoveries: u32,
    warned_steps: bool,
    warned_time: bool,
}

impl AdvanceMachine {
    pub fn new(budgets: AdvanceBudgets, spindle_config: SpindleConfig) -> Self {
        let max_recoveries = spindle_config.max_recoveries;
        Self {
            phase: Phase::Scout,
            budgets,
            step_count: 0,
            started_at: Instant::now(),
            cycle_count: 0,
            pr_count: 0,
            ready: VecDeque::new(),
            current: None,
            plan_rejections: 0,
            qa_retries: 0,
            ticket_steps: 0,
            last_qa_context: String::new(),
            workers: Vec::new(),
            spindle: Spindle::new(spindle_config),
            spindle_recoveries: 0,
            max_recoveries,
            warned_steps: false,
            warned_time: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn spindle_recoveries(&self) -> u32 {
        self.spindle_recoveries
    }

    /// Feed an edit event into the spindle window without advancing.
    pub fn record_edit(&mut self, file: &str, content_hash: u64) {
        self.spindle.record_edit(file, content_hash);
    }

    /// Tickets promoted outside the machine (e.g. by the approve verb).
    pub fn push_tickets(&mut self, tickets: impl IntoIterator<Item = Ticket>) {
        self.ready.extend(tickets);
    }

    pub fn advance(&mut self, input: StepInput) -> AdvanceOutcome {
        self.step_count += 1;
        let mut warnings = Vec::new();

        // Budget checks come before everything else.
        if self.step_count > self.budgets.step_budget {
            return self.stop(Phase::FailedBudget, "step budget exhausted");
        }
        if self.started_at.elapsed() > self.budgets.time_budget {
            return self.stop(Phase::FailedBudget, "time budget exhausted");
        }
        self.budget_warnings(&mut warnings);

        // Spindle is consulted in the active execution phases.
        if matches!(self.phase, Phase::Execute | Phase::Qa) {
            match self.spindle.check() {
                SpindleDecision::Abort(incident) => {
                    warn!("spindle abort: {} ({:.2})", incident.signal, incident.confidence);
                    self.spindle_recoveries += 1;
                    self.spindle.reset();
                    if self.spindle_recoveries >= self.max_recoveries {
                        return self.stop(Phase::FailedSpindle, incident.detail);
                    }
                    self.current = None;
                    return self.enter_next_ticket(
                        format!("spindle abort: {}", incident.detail),
                        warnings,
                    );
                }
                SpindleDecision::Block(incident) => {
                    warn!("spindle block: {} ({:.2})", incident.signal, incident.confidence);
                    self.spindle_recoveries += 1;
                    self.spindle.reset();
                    if self.spindle_recoveries >= self.max_recoveries {
                        return self.stop(Phase::BlockedNeedsHuman, incident.detail);
                    }
                    self.current = None;
                    return self.enter_next_ticket(
                        format!("spindle block: {}", incident.detail),
                        warnings,
                    );
                }
                SpindleDecision::Warn(diags) => warnings.extend(diags),
                SpindleDecision::Continue => {}
            }
        }

        if self.phase.is_terminal() {
            return self.stop(self.phase, "terminal state");
        }

        match self.phase {
            Phase::Scout => self.handle_scout(input, warnings),
            Phase::NextTicket => self.handle_next_ticket(warnings),
            Phase::Plan => self.handle_plan(input, warnings),
            Phase::Execute => self.handle_execute(input, warnings),
            Phase::Qa => self.handle_qa(input, warnings),
            Phase::Pr => self.handle_pr(input, warnings),
            Phase::ParallelExecute => self.handle_parallel(input, warnings),
            _ => self.stop(self.phase, "terminal state"),
        }
    }

    fn budget_warnings(&mut self, warnings: &mut Vec<String>) {
        let step_ratio = f64::from(self.step_count) / f64::from(self.budgets.step_budget.max(1));
        if !self.warned_steps && step_ratio >= BUDGET_WARN_RATIO {
            self.warned_steps = true;
            warnings.push(format!(
                "step budget at {}%: {} of {}",
                (step_ratio * 100.0).round(),
                self.step_count,
                self.budgets.step_budget
            ));
        }
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let time_ratio = elapsed / self.budgets.time_budget.as_secs_f64().max(1.0);
        if !self.warned_time && time_ratio >= BUDGET_WARN_RATIO {
            self.warned_time = true;
            warnings.push(format!("time budget at {}%", (time_ratio * 100.0).round()));
        }
    }

    // ── Phase handlers ───────────────────────────────────────────────────

    fn handle_scout(&mut self, input: StepInput, warnings: Vec<String>) -> AdvanceOutcome {
        if self.cycle_count >= self.budgets.cycle_budget {
            return self.stop(Phase::Done, "cycle budget reached");
        }
        if self.pr_count >= self.budgets.pr_budget {
            return self.stop(Phase::Done, "PR budget reached");
        }

        match input {
            StepInput::ScoutResult { proposals } => {
                self.cycle_count += 1;
                if proposals.is_empty() {
                    return self.prompt(
                        Phase::Scout,
                        "scout returned nothing; escalate and rescan",
                        warnings,
                    );
                }
                info!("scout produced {} proposals", proposals.len());
                self.enter_next_ticket(
                    format!("{} proposals validated", proposals.len()),
                    warnings,
                )
            }
            _ => self.prompt(Phase::Scout, "scan the current scope for proposals", warnings),
        }
    }

    fn handle_next_ticket(&mut self, warnings: Vec<String>) -> AdvanceOutcome {
        if self.budgets.parallel > 1 && self.ready.len() > 1 {
            let batch = self.ready.len().min(self.budgets.parallel);
            self.workers = self
                .ready
                .drain(..batch)
                .map(|ticket| WorkerSlot {
                    ticket,
                    last_progress_step: self.step_count,
                    done: false,
                    failed: false,
                })
                .collect();
            return self.prompt(
                Phase::ParallelExecute,
                &format!("dispatch {} parallel workers", self.workers.len()),
                warnings,
            );
        }

        match self.ready.pop_front() {
            Some(ticket) => {
                self.plan_rejections = 0;
                self.qa_retries = 0;
                self.ticket_steps = 0;
                self.spindle.reset();
                let plan_required = !ticket.category.plan_exempt();
                self.current = Some(ticket);
                if plan_required {
                    self.prompt(Phase::Plan, "draft an implementation plan", warnings)
                } else {
                    self.prompt(Phase::Execute, "execute the ticket", warnings)
                }
            }
            None => {
                if self.cycle_count < self.budgets.cycle_budget {
                    self.prompt(Phase::Scout, "no ready tickets; scout again", warnings)
                } else {
                    self.stop(Phase::Done, "no ready tickets and no cycles remain")
                }
            }
        }
    }

    fn handle_plan(&mut self, input: StepInput, warnings: Vec<String>) -> AdvanceOutcome {
        match input {
            StepInput::PlanDecision { approved: true, .. } => {
                self.prompt(Phase::Execute, "plan approved; execute", warnings)
            }
            StepInput::PlanDecision { approved: false, feedback } => {
                self.plan_rejections += 1;
                self.spindle.record_plan_rejection();
                if self.plan_rejections >= MAX_PLAN_REJECTIONS {
                    return self.stop(
                        Phase::BlockedNeedsHuman,
                        format!("{MAX_PLAN_REJECTIONS} plan rejections"),
                    );
                }
                let reason = feedback.unwrap_or_else(|| "plan rejected".into());
                self.prompt(Phase::Plan, &format!("revise the plan: {reason}"), warnings)
            }
            _ => self.prompt(Phase::Plan, "awaiting plan decision", warnings),
        }
    }

    fn handle_execute(&mut self, input: StepInput, warnings: Vec<String>) -> AdvanceOutcome {
        self.ticket_steps += 1;
        if self.ticket_steps > self.budgets.ticket_step_budget {
            return self.stop(Phase::BlockedNeedsHuman, "ticket step budget exhausted");
        }
        match input {
            StepInput::ExecuteResult { outcome } => {
                if outcome.completion_outcome == Some(CompletionOutcome::NoChangesNeeded) {
                    self.current = None;
                    return self.enter_next_ticket("no changes needed".into(), warnings);
                }
                if !outcome.success {
                    self.current = None;
                    let error = outcome.error.unwrap_or_else(|| "agent failure".into());
                    return self.enter_next_ticket(format!("execution failed: {error}"), warnings);
                }
                self.prompt(Phase::Qa, "run the verification commands", warnings)
            }
            _ => self.prompt(Phase::Execute, "continue executing the ticket", warnings),
        }
    }

    fn handle_qa(&mut self, input: StepInput, warnings: Vec<String>) -> AdvanceOutcome {
        match input {
            StepInput::QaResult { passed, failing_commands, context } => {
                self.spindle.record_qa_result(&failing_commands);
                if passed {
                    self.qa_retries = 0;
                    return self.prompt(Phase::Pr, "open the pull request", warnings);
                }
                self.qa_retries += 1;
                self.last_qa_context = context;
                if self.qa_retries >= MAX_QA_RETRIES {
                    self.current = None;
                    return self.enter_next_ticket(
                        format!("QA failed {MAX_QA_RETRIES} times"),
                        warnings,
                    );
                }
                let preamble = self.critic_preamble(&failing_commands);
                self.prompt(Phase::Execute, &preamble, warnings)
            }
            _ => self.prompt(Phase::Qa, "awaiting QA result", warnings),
        }
    }

    /// Critic preamble for a QA-failed retry, built from the failure context
    /// and simple strategy scores: the narrower fix first, a revert second.
    fn critic_preamble(&self, failing_commands: &[String]) -> String {
        let strategies = [
            ("fix the specific failure", 3 - self.qa_retries.min(2)),
            ("narrow the change and retry", 2),
            ("revert the riskiest hunk", 1 + self.qa_retries),
        ];
        let mut ranked: Vec<_> = strategies.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));
        format!(
            "QA retry {} of {MAX_QA_RETRIES}. Failing: [{}]. Context: {}. \
             Preferred strategies in order: {}.",
            self.qa_retries,
            failing_commands.join(", "),
            self.last_qa_context.chars().take(500).collect::<String>(),
            ranked
                .iter()
                .map(|(s, _)| *s)
                .collect::<Vec<_>>()
                .join("; ")
        )
    }

    fn handle_pr(&mut self, input: StepInput, warnings: Vec<String>) -> AdvanceOutcome {
        match input {
            StepInput::PrResult { ok: true, .. } => {
                self.pr_count += 1;
                self.current = None;
                self.enter_next_ticket("PR created".into(), warnings)
            }
            StepInput::PrResult { ok: false, validation_error } => self.stop(
                Phase::FailedValidation,
                validation_error.unwrap_or_else(|| "PR validation failed".into()),
            ),
            _ => self.prompt(Phase::Pr, "awaiting PR result", warnings),
        }
    }

    fn handle_parallel(&mut self, input: StepInput, warnings: Vec<String>) -> AdvanceOutcome {
        if let StepInput::WorkerReport { worker, done, progressed } = input {
            if let Some(slot) = self.workers.get_mut(worker) {
                if done {
                    slot.done = true;
                }
                if progressed {
                    slot.last_progress_step = self.step_count;
                }
            }
        }

        // Force-fail stalled workers.
        for slot in &mut self.workers {
            if !slot.done && self.step_count - slot.last_progress_step >= WORKER_STALL_STEPS {
                warn!("worker for ticket #{} timed out: WORKER_TIMEOUT", slot.ticket.id);
                slot.done = true;
                slot.failed = true;
            }
        }

        if self.workers.iter().all(|w| w.done) {
            let failed = self.workers.iter().filter(|w| w.failed).count();
            self.workers.clear();
            return self.enter_next_ticket(
                format!("all workers done ({failed} forced failures)"),
                warnings,
            );
        }
        self.prompt(Phase::ParallelExecute, "workers still running", warnings)
    }

    // ── Outcome builders ─────────────────────────────────────────────────

    fn enter_next_ticket(&mut self, reason: String, warnings: Vec<String>) -> AdvanceOutcome {
        self.prompt(Phase::NextTicket, &reason, warnings)
    }

    fn prompt(&mut self, phase: Phase, reason: &str, warnings: Vec<String>) -> AdvanceOutcome {
        self.phase = phase;
        let constraints = self.current.as_ref().map(|ticket| {
            derive_constraints(ticket, &[], Risk::Medium)
        });
        let prompt = self.build_prompt(phase);
        AdvanceOutcome {
            next_action: NextAction::Prompt,
            phase,
            prompt: Some(prompt),
            reason: reason.to_string(),
            constraints,
            digest: self.digest(),
            warnings,
        }
    }

    fn stop(&mut self, phase: Phase, reason: impl Into<String>) -> AdvanceOutcome {
        self.phase = phase;
        AdvanceOutcome {
            next_action: NextAction::Stop,
            phase,
            prompt: None,
            reason: reason.into(),
            constraints: None,
            digest: self.digest(),
            warnings: Vec::new(),
        }
    }

    fn build_prompt(&self, phase: Phase) -> String {
        let ticket = self.current.as_ref();
        match phase {
            Phase::Scout => "Scan the assigned scope and emit proposals.".to_string(),
            Phase::NextTicket => "Pick up the next ready ticket.".to_string(),
            Phase::Plan => ticket
                .map(|t| format!("Write a short implementation plan for: {}", t.title))
                .unwrap_or_else(|| "Write a plan.".into()),
            Phase::Execute => ticket
                .map(|t| format!("Implement: {}\n\n{}", t.title, t.description))
                .unwrap_or_else(|| "Execute the ticket.".into()),
            Phase::Qa => "Run every required verification command and report results.".to_string(),
            Phase::Pr => ticket
                .map(|t| format!("Open a pull request for: {}", t.title))
                .unwrap_or_else(|| "Open the pull request.".into()),
            Phase::ParallelExecute => "Drive the parallel workers to completion.".to_string(),
            _ => String::new(),
        }
    }

    fn digest(&self) -> String {
        format!(
            "step {} | cycle {}/{} | prs {}/{} | recoveries {}",
            self.step_count,
            self.cycle_count,
            self.budgets.cycle_budget,
            self.pr_count,
            self.budgets.pr_budget,
            self.spindle_recoveries
        )
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
