//! File-backed session state under `.state/`.
//!
//! Every sidecar file is plain JSON written atomically (temp file + rename).
//! A missing or corrupt file loads as the type's default with a warning; the
//! next write replaces it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

use crate::types::Proposal;

// ── Atomic JSON IO ───────────────────────────────────────────────────────

/// Read a sidecar file, recovering with `T::default()` when missing or corrupt.
pub fn load_json<T: DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(v) => v,
            Err(e) => {
                warn!("corrupt sidecar {}: {e}; using empty default", path.display());
                T::default()
            }
        },
        Err(_) => T::default(),
    }
}

/// Write a sidecar file via temp + rename.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(value).context("serialize sidecar")?;
    std::fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

// ── Run state ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QualitySignals {
    pub total_tickets: u32,
    pub first_pass_success: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FormulaStats {
    pub tickets: u32,
    pub successes: u32,
    pub prs_merged: u32,
    pub prs_closed: u32,
}

/// One line of per-cycle history kept in run-state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleSummary {
    pub cycle: u32,
    pub sector: String,
    pub scanned_files: u32,
    pub proposals: u32,
    pub approved: u32,
    pub tickets_succeeded: u32,
    pub tickets_failed: u32,
    pub prs_created: u32,
    pub duration_ms: u64,
    pub at: Option<DateTime<Utc>>,
}

/// Aggregate cross-cycle state persisted at `run-state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunState {
    pub total_cycles: u32,
    pub last_docs_audit_cycle: u32,
    pub last_run_at: Option<DateTime<Utc>>,
    pub deferred_proposals: Vec<Proposal>,
    pub formula_stats: HashMap<String, FormulaStats>,
    pub recent_cycles: Vec<CycleSummary>,
    pub recent_diffs: Vec<String>,
    pub quality_signals: QualitySignals,
}

const RECENT_CYCLES_CAP: usize = 20;
const RECENT_DIFFS_CAP: usize = 20;

/// Mutex-guarded handle on run-state; every mutation persists before the
/// lock is released.
pub struct RunStateStore {
    path: PathBuf,
    inner: Mutex<RunState>,
}

impl RunStateStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = load_json(&path);
        Self {
            path,
            inner: Mutex::new(state),
        }
    }

    pub async fn snapshot(&self) -> RunState {
        self.inner.lock().await.clone()
    }

    pub async fn update<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut RunState) -> R,
    {
        let mut guard = self.inner.lock().await;
        let out = f(&mut guard);
        guard.recent_cycles = trim_tail(std::mem::take(&mut guard.recent_cycles), RECENT_CYCLES_CAP);
        guard.recent_diffs = trim_tail(std::mem::take(&mut guard.recent_diffs), RECENT_DIFFS_CAP);
        save_json(&self.path, &*guard)?;
        Ok(out)
    }

    pub async fn record_cycle(&self, summary: CycleSummary) -> Result<()> {
        self.update(|s| {
            s.total_cycles = s.total_cycles.max(summary.cycle);
            s.last_run_at = Some(Utc::now());
            s.recent_cycles.push(summary);
        })
        .await
    }

    pub async fn record_ticket_outcome(&self, first_pass: bool) -> Result<()> {
        self.update(|s| {
            s.quality_signals.total_tickets += 1;
            if first_pass {
                s.quality_signals.first_pass_success += 1;
            }
        })
        .await
    }
}

fn trim_tail<T>(mut v: Vec<T>, cap: usize) -> Vec<T> {
    if v.len() > cap {
        v.drain(..v.len() - cap);
    }
    v
}

// ── Nudges ───────────────────────────────────────────────────────────────

/// Drain the nudge sidecar: read all pending operator hints and truncate the
/// file. Nudges are injected into the next scout request.
pub fn drain_nudges(path: &Path) -> Vec<String> {
    let nudges: Vec<String> = load_json(path);
    if !nudges.is_empty() {
        if let Err(e) = save_json(path, &Vec::<String>::new()) {
            warn!("truncate nudges {}: {e}", path.display());
        }
    }
    nudges
}

/// Append a nudge (used by the `nudge` CLI verb from a second process; the
/// owning session only drains).
pub fn push_nudge(path: &Path, text: &str) -> Result<()> {
    let mut nudges: Vec<String> = load_json(path);
    nudges.push(text.to_string());
    save_json(path, &nudges)
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_file_loads_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run-state.json");
        std::fs::write(&path, "{not json").expect("write");
        let state: RunState = load_json(&path);
        assert_eq!(state.total_cycles, 0);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run-state.json");
        let mut state = RunState::default();
        state.total_cycles = 7;
        state.quality_signals = QualitySignals {
            total_tickets: 10,
            first_pass_success: 6,
        };
        save_json(&path, &state).expect("save");
        let loaded: RunState = load_json(&path);
        assert_eq!(loaded.total_cycles, 7);
        assert_eq!(loaded.quality_signals.first_pass_success, 6);
        // No stray temp file left behind.
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn recent_cycles_are_capped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RunStateStore::open(dir.path().join("run-state.json"));
        for i in 0..30 {
            store
                .record_cycle(CycleSummary {
                    cycle: i + 1,
                    ..CycleSummary::default()
                })
                .await
                .expect("record");
        }
        let snap = store.snapshot().await;
        assert_eq!(snap.recent_cycles.len(), RECENT_CYCLES_CAP);
        assert_eq!(snap.recent_cycles.last().map(|c| c.cycle), Some(30));
        assert_eq!(snap.total_cycles, 30);
    }

    #[test]
    fn nudges_drain_and_truncate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nudges.json");
        push_nudge(&path, "look at the parser").expect("push");
        push_nudge(&path, "skip vendored code").expect("push");
        let drained = drain_nudges(&path);
        assert_eq!(drained.len(), 2);
        assert!(drain_nudges(&path).is_empty());
    }
}
