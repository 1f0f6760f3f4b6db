use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{QaCommand, QaConfig};
use crate::sidecar::{load_json, save_json, QualitySignals};

const BASELINE_RING: usize = 10;
const HYSTERESIS_BAND: f64 = 0.15;

// ── Per-command stats ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QaCommandStats {
    pub total_runs: u32,
    pub successes: u32,
    pub failures: u32,
    pub timeouts: u32,
    pub pre_existing_skips: u32,
    pub total_duration_ms: u64,
    pub avg_duration_ms: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub consecutive_timeouts: u32,
    /// Ring of the most recent baseline results, newest last.
    pub recent_baseline_results: Vec<bool>,
}

impl QaCommandStats {
    /// True when the last 5 baseline captures all failed.
    pub fn chronically_failing(&self) -> bool {
        let n = self.recent_baseline_results.len();
        n >= 5 && self.recent_baseline_results[n - 5..].iter().all(|r| !r)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisabledCommand {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QaStats {
    pub commands: HashMap<String, QaCommandStats>,
    pub last_updated: Option<DateTime<Utc>>,
    pub disabled_commands: Vec<DisabledCommand>,
    pub last_calibrated_quality_rate: Option<f64>,
}

// ── Run outcomes ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QaOutcome {
    Pass,
    Fail,
    Timeout,
    PreExistingSkip,
}

#[derive(Debug, Clone)]
pub struct QaRunResult {
    pub name: String,
    pub outcome: QaOutcome,
    pub output: String,
    pub duration_ms: u64,
}

/// Verdict of one ticket's QA round.
#[derive(Debug, Clone, Default)]
pub struct QaReport {
    pub passed: bool,
    pub failures: Vec<QaRunResult>,
    pub skipped: Vec<String>,
}

// ── Auto-tune ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum TuneAction {
    /// Remove a command from config; it is a configuration bug, not a
    /// baseline healer.
    Demote { name: String, reason: String },
    RaiseTimeout { name: String, timeout_ms: u64 },
}

// ── Store ────────────────────────────────────────────────────────────────

pub struct QaStatsStore {
    path: PathBuf,
    inner: Mutex<QaStats>,
}

impl QaStatsStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stats = load_json(&path);
        Self {
            path,
            inner: Mutex::new(stats),
        }
    }

    pub async fn snapshot(&self) -> QaStats {
        self.inner.lock().await.clone()
    }

    pub async fn record(&self, name: &str, outcome: QaOutcome, duration_ms: u64) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let stats = guard.commands.entry(name.to_string()).or_default();
        stats.total_runs += 1;
        stats.total_duration_ms += duration_ms;
        stats.avg_duration_ms =
            (stats.total_duration_ms as f64 / f64::from(stats.total_runs)).round() as u64;
        stats.last_run_at = Some(Utc::now());
        match outcome {
            QaOutcome::Pass => {
                stats.successes += 1;
                stats.consecutive_failures = 0;
                stats.consecutive_timeouts = 0;
            }
            QaOutcome::Fail => {
                stats.failures += 1;
                stats.consecutive_failures += 1;
            }
            QaOutcome::Timeout => {
                stats.timeouts += 1;
                stats.consecutive_failures += 1;
                stats.consecutive_timeouts += 1;
            }
            QaOutcome::PreExistingSkip => {
                stats.pre_existing_skips += 1;
            }
        }
        guard.last_updated = Some(Utc::now());
        save_json(&self.path, &*guard)
    }

    pub async fn record_baseline(&self, name: &str, ok: bool) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let stats = guard.commands.entry(name.to_string()).or_default();
        stats.recent_baseline_results.push(ok);
        let len = stats.recent_baseline_results.len();
        if len > BASELINE_RING {
            stats.recent_baseline_results.drain(..len - BASELINE_RING);
        }
        save_json(&self.path, &*guard)
    }

    /// Timeout-only auto-tune, applied to the live QA config after each
    /// cycle. The instantaneous rule (consecutive timeouts) is evaluated
    /// before the rolling duration rule.
    pub async fn auto_tune(&self, qa: &mut QaConfig) -> Result<Vec<TuneAction>> {
        let mut guard = self.inner.lock().await;
        let mut actions = Vec::new();

        qa.commands.retain(|cmd| {
            let Some(stats) = guard.commands.get(&cmd.name) else {
                return true;
            };
            if stats.consecutive_timeouts >= 3 && stats.total_runs >= 5 {
                let reason = format!(
                    "{} consecutive timeouts over {} runs; likely a configuration bug",
                    stats.consecutive_timeouts, stats.total_runs
                );
                actions.push(TuneAction::Demote {
                    name: cmd.name.clone(),
                    reason,
                });
                return false;
            }
            true
        });
        for action in &actions {
            if let TuneAction::Demote { name, reason } = action {
                warn!("QA command {name} demoted: {reason}");
                guard.disabled_commands.push(DisabledCommand {
                    name: name.clone(),
                    reason: reason.clone(),
                });
            }
        }

        for cmd in &mut qa.commands {
            let Some(stats) = guard.commands.get(&cmd.name) else {
                continue;
            };
            if stats.total_runs >= 5
                && (stats.avg_duration_ms as f64) > 0.8 * cmd.timeout_ms as f64
            {
                let raised = (1.5 * cmd.timeout_ms as f64).round() as u64;
                info!(
                    "QA command {} timeout raised {} -> {raised} ms",
                    cmd.name, cmd.timeout_ms
                );
                cmd.timeout_ms = raised;
                actions.push(TuneAction::RaiseTimeout {
                    name: cmd.name.clone(),
                    timeout_ms: raised,
                });
            }
        }

        save_json(&self.path, &*guard)?;
        Ok(actions)
    }

    /// Confidence calibration with a hysteresis band around the last
    /// calibrated quality rate. Returns the delta to apply to the effective
    /// minimum confidence; the anchor is persisted only when the delta is
    /// non-zero.
    pub async fn calibrate_confidence(
        &self,
        signals: &QualitySignals,
        current_min: u8,
        original_min: u8,
    ) -> Result<i32> {
        if signals.total_tickets < 5 {
            return Ok(0);
        }
        let rate = f64::from(signals.first_pass_success) / f64::from(signals.total_tickets);

        let mut guard = self.inner.lock().await;
        if let Some(anchor) = guard.last_calibrated_quality_rate {
            if (rate - anchor).abs() < HYSTERESIS_BAND {
                return Ok(0);
            }
        }

        let delta: i32 = if rate < 0.6 {
            5
        } else if rate > 0.9 && signals.total_tickets >= 10 {
            // Never drive the live threshold below the configured original.
            -i32::from(current_min.saturating_sub(original_min).min(5))
        } else {
            0
        };

        if delta != 0 {
            guard.last_calibrated_quality_rate = Some(rate);
            save_json(&self.path, &*guard)?;
        }
        Ok(delta)
    }
}

// ── Baseline ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineDetail {
    pub cmd: String,
    pub output: String,
}

/// The set of QA commands failing before any change, captured once per
/// cycle. Baseline-failing commands are skipped for tickets and surfaced to
/// the scout as healing targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QaBaseline {
    pub failures: Vec<String>,
    pub details: HashMap<String, BaselineDetail>,
}

impl QaBaseline {
    pub fn is_failing(&self, name: &str) -> bool {
        self.failures.iter().any(|f| f == name)
    }
}

// ── Runner ───────────────────────────────────────────────────────────────

/// Run one QA command in `dir` with a timeout. Timeouts produce a
/// `QaOutcome::Timeout` result, never an error.
pub async fn run_qa_command(dir: &Path, cmd: &QaCommand) -> QaRunResult {
    let started = Instant::now();
    let fut = async {
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&cmd.cmd)
            .current_dir(dir)
            .kill_on_drop(true)
            .output()
            .await
    };
    match tokio::time::timeout(Duration::from_millis(cmd.timeout_ms), fut).await {
        Ok(Ok(output)) => {
            let combined = format!(
                "{}\n{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            QaRunResult {
                name: cmd.name.clone(),
                outcome: if output.status.success() {
                    QaOutcome::Pass
                } else {
                    QaOutcome::Fail
                },
                output: combined.trim().to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
            }
        }
        Ok(Err(e)) => QaRunResult {
            name: cmd.name.clone(),
            outcome: QaOutcome::Fail,
            output: format!("failed to spawn {}: {e}", cmd.cmd),
            duration_ms: started.elapsed().as_millis() as u64,
        },
        Err(_) => QaRunResult {
            name: cmd.name.clone(),
            outcome: QaOutcome::Timeout,
            output: format!("timed out after {} ms", cmd.timeout_ms),
            duration_ms: cmd.timeout_ms,
        },
    }
}

/// Capture the QA baseline in `dir` and persist it.
pub async fn capture_baseline(
    dir: &Path,
    qa: &QaConfig,
    stats: &QaStatsStore,
    baseline_path: &Path,
) -> Result<QaBaseline> {
    let mut baseline = QaBaseline::default();
    for cmd in &qa.commands {
        let result = run_qa_command(dir, cmd).await;
        let ok = result.outcome == QaOutcome::Pass;
        stats.record_baseline(&cmd.name, ok).await?;
        if !ok {
            warn!("baseline failure for {}: recorded as healing target", cmd.name);
            baseline.failures.push(cmd.name.clone());
            baseline.details.insert(
                cmd.name.clone(),
                BaselineDetail {
                    cmd: cmd.cmd.clone(),
                    output: result.output.chars().take(2_000).collect(),
                },
            );
        }
    }
    save_json(baseline_path, &baseline)?;
    Ok(baseline)
}

/// Run a ticket's QA round: the session commands (skipping baseline
/// failures) followed by the ticket's own verification commands.
pub async fn run_qa_round(
    dir: &Path,
    qa: &QaConfig,
    baseline: &QaBaseline,
    extra_commands: &[String],
    stats: &QaStatsStore,
) -> Result<QaReport> {
    let mut report = QaReport {
        passed: true,
        ..QaReport::default()
    };

    for cmd in &qa.commands {
        if baseline.is_failing(&cmd.name) {
            stats.record(&cmd.name, QaOutcome::PreExistingSkip, 0).await?;
            report.skipped.push(cmd.name.clone());
            continue;
        }
        let result = run_qa_command(dir, cmd).await;
        stats.record(&cmd.name, result.outcome, result.duration_ms).await?;
        if result.outcome != QaOutcome::Pass {
            report.passed = false;
            report.failures.push(result);
        }
    }

    for (i, raw) in extra_commands.iter().enumerate() {
        let cmd = QaCommand {
            name: format!("verify_{i}"),
            cmd: raw.clone(),
            timeout_ms: 120_000,
        };
        let result = run_qa_command(dir, &cmd).await;
        if result.outcome != QaOutcome::Pass {
            report.passed = false;
            report.failures.push(result);
        }
    }

    Ok(report)
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> QaStatsStore {
        QaStatsStore::open(dir.path().join("qa-stats.json"))
    }

    #[tokio::test]
    async fn counters_stay_consistent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(&dir);
        s.record("tests", QaOutcome::Pass, 100).await.expect("record");
        s.record("tests", QaOutcome::Fail, 200).await.expect("record");
        s.record("tests", QaOutcome::Timeout, 300).await.expect("record");
        s.record("tests", QaOutcome::PreExistingSkip, 0).await.expect("record");
        let snap = s.snapshot().await;
        let stats = &snap.commands["tests"];
        assert_eq!(
            stats.total_runs,
            stats.successes + stats.failures + stats.timeouts + stats.pre_existing_skips
        );
        assert_eq!(stats.avg_duration_ms, 150);
        assert_eq!(stats.consecutive_failures, 2);
        assert_eq!(stats.consecutive_timeouts, 1);
    }

    #[tokio::test]
    async fn pass_clears_streaks_failure_spares_timeout_streak() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(&dir);
        s.record("lint", QaOutcome::Timeout, 100).await.expect("record");
        s.record("lint", QaOutcome::Fail, 100).await.expect("record");
        let snap = s.snapshot().await;
        assert_eq!(snap.commands["lint"].consecutive_timeouts, 1);
        assert_eq!(snap.commands["lint"].consecutive_failures, 2);
        s.record("lint", QaOutcome::Pass, 100).await.expect("record");
        let snap = s.snapshot().await;
        assert_eq!(snap.commands["lint"].consecutive_timeouts, 0);
        assert_eq!(snap.commands["lint"].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn chronically_failing_requires_five_false_baselines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(&dir);
        for _ in 0..4 {
            s.record_baseline("tests", false).await.expect("baseline");
        }
        assert!(!s.snapshot().await.commands["tests"].chronically_failing());
        s.record_baseline("tests", false).await.expect("baseline");
        assert!(s.snapshot().await.commands["tests"].chronically_failing());
        s.record_baseline("tests", true).await.expect("baseline");
        assert!(!s.snapshot().await.commands["tests"].chronically_failing());
    }

    #[tokio::test]
    async fn baseline_ring_is_capped_at_ten() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(&dir);
        for i in 0..15 {
            s.record_baseline("tests", i % 2 == 0).await.expect("baseline");
        }
        let snap = s.snapshot().await;
        assert_eq!(snap.commands["tests"].recent_baseline_results.len(), 10);
    }

    #[tokio::test]
    async fn auto_tune_demotes_after_consecutive_timeouts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(&dir);
        for _ in 0..2 {
            s.record("slow", QaOutcome::Pass, 100).await.expect("record");
        }
        for _ in 0..3 {
            s.record("slow", QaOutcome::Timeout, 1_000).await.expect("record");
        }
        let mut qa = QaConfig {
            commands: vec![QaCommand {
                name: "slow".into(),
                cmd: "sleep 99".into(),
                timeout_ms: 1_000,
            }],
        };
        let actions = s.auto_tune(&mut qa).await.expect("tune");
        assert!(matches!(actions[0], TuneAction::Demote { .. }));
        assert!(qa.commands.is_empty());
        assert_eq!(s.snapshot().await.disabled_commands.len(), 1);
    }

    #[tokio::test]
    async fn auto_tune_raises_timeout_only_above_threshold() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(&dir);
        // avg exactly 0.8 × timeout: must not adjust.
        for _ in 0..5 {
            s.record("edge", QaOutcome::Pass, 800).await.expect("record");
        }
        let mut qa = QaConfig {
            commands: vec![QaCommand {
                name: "edge".into(),
                cmd: "true".into(),
                timeout_ms: 1_000,
            }],
        };
        let actions = s.auto_tune(&mut qa).await.expect("tune");
        assert!(actions.is_empty());
        assert_eq!(qa.commands[0].timeout_ms, 1_000);

        // Nudge the average above 0.8 × timeout.
        s.record("edge", QaOutcome::Pass, 1_000).await.expect("record");
        let actions = s.auto_tune(&mut qa).await.expect("tune");
        assert_eq!(
            actions,
            vec![TuneAction::RaiseTimeout {
                name: "edge".into(),
                timeout_ms: 1_500,
            }]
        );
        assert_eq!(qa.commands[0].timeout_ms, 1_500);
    }

    #[tokio::test]
    async fn calibration_hysteresis_band() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(&dir);

        let signals = QualitySignals {
            total_tickets: 10,
            first_pass_success: 4,
        };
        assert_eq!(s.calibrate_confidence(&signals, 50, 30).await.expect("cal"), 5);

        // Drift 0.1 stays inside the band.
        let signals = QualitySignals {
            total_tickets: 10,
            first_pass_success: 5,
        };
        assert_eq!(s.calibrate_confidence(&signals, 55, 30).await.expect("cal"), 0);

        // Drift 0.2 leaves the band, but rate 0.6 is no longer < 0.6.
        let signals = QualitySignals {
            total_tickets: 10,
            first_pass_success: 6,
        };
        assert_eq!(s.calibrate_confidence(&signals, 55, 30).await.expect("cal"), 0);
        // The zero delta must not move the anchor.
        assert_eq!(s.snapshot().await.last_calibrated_quality_rate, Some(0.4));

        let signals = QualitySignals {
            total_tickets: 10,
            first_pass_success: 2,
        };
        assert_eq!(s.calibrate_confidence(&signals, 55, 30).await.expect("cal"), 5);
        assert_eq!(s.snapshot().await.last_calibrated_quality_rate, Some(0.2));
    }

    #[tokio::test]
    async fn calibration_needs_five_tickets_and_respects_floor() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(&dir);
        let few = QualitySignals {
            total_tickets: 4,
            first_pass_success: 0,
        };
        assert_eq!(s.calibrate_confidence(&few, 50, 30).await.expect("cal"), 0);

        // High quality rate lowers confidence, but never below the original.
        let high = QualitySignals {
            total_tickets: 12,
            first_pass_success: 12,
        };
        assert_eq!(s.calibrate_confidence(&high, 32, 30).await.expect("cal"), -2);
        let snap = s.snapshot().await;
        assert_eq!(snap.last_calibrated_quality_rate, Some(1.0));
    }

    #[tokio::test]
    async fn qa_round_skips_baseline_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(&dir);
        let qa = QaConfig {
            commands: vec![
                QaCommand {
                    name: "broken".into(),
                    cmd: "false".into(),
                    timeout_ms: 5_000,
                },
                QaCommand {
                    name: "ok".into(),
                    cmd: "true".into(),
                    timeout_ms: 5_000,
                },
            ],
        };
        let baseline_path = dir.path().join("qa-baseline.json");
        let baseline = capture_baseline(dir.path(), &qa, &s, &baseline_path)
            .await
            .expect("baseline");
        assert_eq!(baseline.failures, vec!["broken".to_string()]);
        assert!(baseline.details["broken"].cmd.contains("false"));

        let report = run_qa_round(dir.path(), &qa, &baseline, &[], &s)
            .await
            .expect("round");
        assert!(report.passed);
        assert_eq!(report.skipped, vec!["broken".to_string()]);
        let snap = s.snapshot().await;
        assert_eq!(snap.commands["broken"].pre_existing_skips, 1);
    }

    #[tokio::test]
    async fn qa_command_timeout_is_a_result_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cmd = QaCommand {
            name: "hang".into(),
            cmd: "sleep 5".into(),
            timeout_ms: 50,
        };
        let result = run_qa_command(dir.path(), &cmd).await;
        assert_eq!(result.outcome, QaOutcome::Timeout);
    }
}
