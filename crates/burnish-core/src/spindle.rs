use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::SpindleConfig;
use crate::types::SpindleIncident;

// Signal confidences. ≥ 0.9 aborts, ≥ 0.6 blocks, ≥ 0.3 warns.
const CONF_OSCILLATION: f64 = 0.95;
const CONF_HOT_FILE: f64 = 0.9;
const CONF_QA_THRASH: f64 = 0.7;
const CONF_STUCK_PLAN: f64 = 0.65;
const CONF_HOT_FILE_WARN: f64 = 0.4;
const WARN_THRESHOLD: f64 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub enum SpindleDecision {
    Continue,
    Warn(Vec<String>),
    Block(SpindleIncident),
    Abort(SpindleIncident),
}

#[derive(Debug, Clone)]
struct EditEvent {
    file: String,
    content_hash: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Signal {
    name: String,
    confidence: f64,
    detail: String,
}

/// Per-run loop detector. Tracks a sliding window of edit events, revert
/// operations, QA failure streaks, and plan rejections; `check` turns the
/// observed signals into a continue/warn/block/abort decision.
pub struct Spindle {
    config: SpindleConfig,
    window: VecDeque<EditEvent>,
    /// Edit count per file, over the current window only.
    file_counts: HashMap<String, u32>,
    /// Hash history per file, over the current window only. A new edit whose
    /// hash matches an earlier (non-latest) entry undoes a prior diff.
    file_hashes: HashMap<String, Vec<u64>>,
    revert_count: u32,
    qa_fail_streak: u32,
    last_failing_commands: Vec<String>,
    plan_rejections: u32,
}

impl Spindle {
    pub fn new(config: SpindleConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
            file_counts: HashMap::new(),
            file_hashes: HashMap::new(),
            revert_count: 0,
            qa_fail_streak: 0,
            last_failing_commands: Vec::new(),
            plan_rejections: 0,
        }
    }

    /// Record one edit event. `content_hash` is a hash of the file content
    /// after the edit; returning to a previously seen hash counts as a revert.
    pub fn record_edit(&mut self, file: &str, content_hash: u64) {
        let hashes = self.file_hashes.entry(file.to_string()).or_default();
        let is_revert = hashes.len() >= 2
            && hashes.last() != Some(&content_hash)
            && hashes[..hashes.len() - 1].contains(&content_hash);
        if is_revert {
            self.revert_count += 1;
        }
        hashes.push(content_hash);
        *self.file_counts.entry(file.to_string()).or_insert(0) += 1;
        self.window.push_back(EditEvent {
            file: file.to_string(),
            content_hash,
        });
        while self.window.len() > self.config.window {
            if let Some(evicted) = self.window.pop_front() {
                if let Some(count) = self.file_counts.get_mut(&evicted.file) {
                    *count = count.saturating_sub(1);
                }
                if let Some(hashes) = self.file_hashes.get_mut(&evicted.file) {
                    if let Some(pos) = hashes.iter().position(|h| *h == evicted.content_hash) {
                        hashes.remove(pos);
                    }
                }
            }
        }
    }

    /// Record a QA round's failing command set. Three consecutive failures
    /// with an unchanged failing set is the thrashing signal.
    pub fn record_qa_result(&mut self, failing_commands: &[String]) {
        if failing_commands.is_empty() {
            self.qa_fail_streak = 0;
            self.last_failing_commands.clear();
            return;
        }
        let mut sorted: Vec<String> = failing_commands.to_vec();
        sorted.sort();
        if sorted == self.last_failing_commands {
            self.qa_fail_streak += 1;
        } else {
            self.qa_fail_streak = 1;
            self.last_failing_commands = sorted;
        }
    }

    pub fn record_plan_rejection(&mut self) {
        self.plan_rejections += 1;
    }

    /// Reset per-ticket counters after a recovery.
    pub fn reset(&mut self) {
        self.window.clear();
        self.file_counts.clear();
        self.file_hashes.clear();
        self.revert_count = 0;
        self.qa_fail_streak = 0;
        self.last_failing_commands.clear();
        self.plan_rejections = 0;
    }

    fn signals(&self) -> Vec<Signal> {
        let mut signals = Vec::new();

        if self.revert_count >= 2 {
            signals.push(Signal {
                name: "edit_revert_oscillation".into(),
                confidence: CONF_OSCILLATION,
                detail: format!("{} revert operations in window", self.revert_count),
            });
        }

        if let Some((file, count)) = self
            .file_counts
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(f, c)| (f.clone(), *c))
        {
            if count >= self.config.hot_file_abort {
                signals.push(Signal {
                    name: "hot_file".into(),
                    confidence: CONF_HOT_FILE,
                    detail: format!("{file} edited {count} times in window"),
                });
            } else if count >= self.config.hot_file_warn {
                signals.push(Signal {
                    name: "hot_file_warning".into(),
                    confidence: CONF_HOT_FILE_WARN,
                    detail: format!("{file} edited {count} times in window"),
                });
            }
        }

        if self.qa_fail_streak >= 3 {
            signals.push(Signal {
                name: "qa_thrashing".into(),
                confidence: CONF_QA_THRASH,
                detail: format!(
                    "{} consecutive QA failures with unchanged failing set [{}]",
                    self.qa_fail_streak,
                    self.last_failing_commands.join(", ")
                ),
            });
        }

        if self.plan_rejections >= 3 {
            signals.push(Signal {
                name: "stuck_plan".into(),
                confidence: CONF_STUCK_PLAN,
                detail: format!("{} plan rejections for the same ticket", self.plan_rejections),
            });
        }

        signals
    }

    /// Evaluate the decision policy against the currently firing signals.
    pub fn check(&self) -> SpindleDecision {
        let signals = self.signals();
        let Some(top) = signals
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
        else {
            return SpindleDecision::Continue;
        };

        let incident = SpindleIncident {
            signal: top.name.clone(),
            confidence: top.confidence,
            detail: top.detail.clone(),
        };

        if top.confidence >= 0.9 {
            SpindleDecision::Abort(incident)
        } else if top.confidence >= 0.6 {
            SpindleDecision::Block(incident)
        } else if top.confidence >= WARN_THRESHOLD {
            SpindleDecision::Warn(
                signals
                    .iter()
                    .map(|s| format!("{}: {}", s.name, s.detail))
                    .collect(),
            )
        } else {
            SpindleDecision::Continue
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn spindle() -> Spindle {
        Spindle::new(SpindleConfig::default())
    }

    #[test]
    fn clean_run_continues() {
        let mut s = spindle();
        s.record_edit("src/a.rs", 1);
        s.record_edit("src/b.rs", 2);
        assert_eq!(s.check(), SpindleDecision::Continue);
    }

    #[test]
    fn edit_revert_oscillation_aborts() {
        let mut s = spindle();
        // v1, v2, v1 repeated: each return to a prior content hash is a revert.
        for _ in 0..3 {
            s.record_edit("src/a.ts", 1);
            s.record_edit("src/a.ts", 2);
            s.record_edit("src/a.ts", 1);
        }
        match s.check() {
            SpindleDecision::Abort(incident) => {
                assert!(incident.confidence >= 0.9);
            }
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[test]
    fn hot_file_warns_then_aborts() {
        let mut s = spindle();
        for i in 0..5 {
            s.record_edit("src/hot.rs", i);
        }
        match s.check() {
            SpindleDecision::Warn(diags) => {
                assert!(diags.iter().any(|d| d.contains("hot")));
            }
            other => panic!("expected warn at 5 edits, got {other:?}"),
        }
        for i in 5..8 {
            s.record_edit("src/hot.rs", i);
        }
        assert!(matches!(s.check(), SpindleDecision::Abort(_)));
    }

    #[test]
    fn qa_thrashing_blocks_only_when_set_is_stable() {
        let mut s = spindle();
        let failing = vec!["tests".to_string()];
        s.record_qa_result(&failing);
        s.record_qa_result(&failing);
        assert_eq!(s.check(), SpindleDecision::Continue);
        s.record_qa_result(&failing);
        assert!(matches!(s.check(), SpindleDecision::Block(_)));

        // A change in the failing set resets the streak.
        let mut s = spindle();
        s.record_qa_result(&failing);
        s.record_qa_result(&["lint".to_string()]);
        s.record_qa_result(&failing);
        assert_eq!(s.check(), SpindleDecision::Continue);
    }

    #[test]
    fn qa_pass_clears_streak() {
        let mut s = spindle();
        let failing = vec!["tests".to_string()];
        s.record_qa_result(&failing);
        s.record_qa_result(&failing);
        s.record_qa_result(&[]);
        s.record_qa_result(&failing);
        assert_eq!(s.check(), SpindleDecision::Continue);
    }

    #[test]
    fn stuck_plan_blocks() {
        let mut s = spindle();
        s.record_plan_rejection();
        s.record_plan_rejection();
        assert_eq!(s.check(), SpindleDecision::Continue);
        s.record_plan_rejection();
        assert!(matches!(s.check(), SpindleDecision::Block(_)));
    }

    #[test]
    fn window_eviction_forgets_old_edits() {
        let mut s = Spindle::new(SpindleConfig {
            window: 4,
            ..SpindleConfig::default()
        });
        s.record_edit("src/a.rs", 1);
        s.record_edit("src/a.rs", 2);
        for i in 0..4 {
            s.record_edit("src/b.rs", 10 + i);
        }
        // a.rs edits fell out of the window.
        assert_eq!(s.file_counts.get("src/a.rs"), Some(&0));
    }

    #[test]
    fn reset_clears_everything() {
        let mut s = spindle();
        for _ in 0..3 {
            s.record_edit("src/a.ts", 1);
            s.record_edit("src/a.ts", 2);
            s.record_edit("src/a.ts", 1);
        }
        s.reset();
        assert_eq!(s.check(), SpindleDecision::Continue);
    }
}
