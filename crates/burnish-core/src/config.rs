use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::DeliveryMode;
use crate::waves::Sensitivity;

// ── State paths ──────────────────────────────────────────────────────────

/// Every engine-owned path under `<repo>/.state/`, derived from the repo root.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub repo_root: PathBuf,
    pub state_dir: PathBuf,
}

impl StatePaths {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        let state_dir = repo_root.join(".state");
        Self {
            repo_root,
            state_dir,
        }
    }

    pub fn config(&self) -> PathBuf {
        self.state_dir.join("config.json")
    }
    pub fn db(&self) -> PathBuf {
        self.state_dir.join("state.sqlite")
    }
    pub fn run_state(&self) -> PathBuf {
        self.state_dir.join("run-state.json")
    }
    pub fn learnings(&self) -> PathBuf {
        self.state_dir.join("learnings.json")
    }
    pub fn qa_stats(&self) -> PathBuf {
        self.state_dir.join("qa-stats.json")
    }
    pub fn qa_baseline(&self) -> PathBuf {
        self.state_dir.join("qa-baseline.json")
    }
    pub fn sectors(&self) -> PathBuf {
        self.state_dir.join("sectors.json")
    }
    pub fn dedup_memory(&self) -> PathBuf {
        self.state_dir.join("dedup-memory.json")
    }
    pub fn file_cooldown(&self) -> PathBuf {
        self.state_dir.join("file-cooldown.json")
    }
    pub fn metrics(&self) -> PathBuf {
        self.state_dir.join("metrics.ndjson")
    }
    pub fn session_lock(&self) -> PathBuf {
        self.state_dir.join("session.lock")
    }
    pub fn nudges(&self) -> PathBuf {
        self.state_dir.join("nudges.json")
    }
    pub fn worktrees_dir(&self) -> PathBuf {
        self.state_dir.join("worktrees")
    }
    pub fn artifacts_dir(&self) -> PathBuf {
        self.state_dir.join("artifacts")
    }
}

// ── Config sections ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaCommand {
    pub name: String,
    pub cmd: String,
    #[serde(default = "default_qa_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_qa_timeout_ms() -> u64 {
    120_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QaConfig {
    #[serde(default)]
    pub commands: Vec<QaCommand>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpindleConfig {
    /// Sliding window of edit events examined for oscillation.
    pub window: usize,
    pub hot_file_warn: u32,
    pub hot_file_abort: u32,
    /// Session-level recoveries before the terminal spindle state.
    pub max_recoveries: u32,
}

impl Default for SpindleConfig {
    fn default() -> Self {
        Self {
            window: 20,
            hot_file_warn: 5,
            hot_file_abort: 8,
            max_recoveries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    Halt,
    Warn,
}

impl Default for PullPolicy {
    fn default() -> Self {
        Self::Warn
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoConfig {
    pub time_budget_mins: u64,
    pub max_cycles: u32,
    pub max_prs: u32,
    /// Confidence floor for proposal approval; calibration adjusts a copy.
    pub min_confidence: u8,
    pub min_impact_score: u8,
    pub delivery: DeliveryMode,
    /// Wave parallelism override; None = adaptive.
    pub parallel: Option<usize>,
    /// Formula override; None = UCB1 pick per cycle.
    pub formula: Option<String>,
    pub pull_interval_cycles: u32,
    pub pull_policy: PullPolicy,
    /// Tickets merged into a milestone before it is finalized.
    pub milestone_size: u32,
    pub sensitivity: Sensitivity,
    pub learnings_enabled: bool,
    pub docs_audit: bool,
}

impl Default for AutoConfig {
    fn default() -> Self {
        Self {
            time_budget_mins: 120,
            max_cycles: 12,
            max_prs: 10,
            min_confidence: 30,
            min_impact_score: 3,
            delivery: DeliveryMode::Pr,
            parallel: None,
            formula: None,
            pull_interval_cycles: 5,
            pull_policy: PullPolicy::Warn,
            milestone_size: 6,
            sensitivity: Sensitivity::Normal,
            learnings_enabled: true,
            docs_audit: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Merged `burnish/tkt_*` branches older than this are pruned.
    pub branch_days: i64,
    /// File-cooldown entry TTL.
    pub cooldown_hours: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            branch_days: 7,
            cooldown_hours: 48,
        }
    }
}

/// Session configuration persisted at `.state/config.json`.
///
/// Every field is defaulted so a partial (or older) config still loads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub db_path: String,
    pub qa: QaConfig,
    /// When non-empty, the origin URL must contain this string.
    pub allowed_remote: String,
    pub spindle: SpindleConfig,
    pub auto: AutoConfig,
    pub retention: RetentionConfig,
    /// Shell command run once at session start (dependency install etc.).
    pub setup: String,
    pub model: String,
    pub codex_model: String,
    pub daemon: bool,
    pub base_branch: String,
    pub backend: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            version: 1,
            created_at: Utc::now(),
            db_path: ".state/state.sqlite".into(),
            qa: QaConfig::default(),
            allowed_remote: String::new(),
            spindle: SpindleConfig::default(),
            auto: AutoConfig::default(),
            retention: RetentionConfig::default(),
            setup: String::new(),
            model: "claude-sonnet-4-5".into(),
            codex_model: "gpt-5-codex".into(),
            daemon: false,
            base_branch: "main".into(),
            backend: "claude".into(),
        }
    }
}

impl SessionConfig {
    /// Load from `.state/config.json`, recovering with defaults when the file
    /// is missing or corrupt.
    pub fn load(paths: &StatePaths) -> Self {
        let path = paths.config();
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!("corrupt config at {}: {e}; using defaults", path.display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, paths: &StatePaths) -> Result<()> {
        crate::sidecar::save_json(&paths.config(), self)
            .with_context(|| format!("write config {}", paths.config().display()))
    }
}

// ── Environment helpers ──────────────────────────────────────────────────

pub fn parse_dotenv(dir: &Path) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(dir.join(".env")) else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

pub fn env_get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

pub fn env_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    env_get(key, dotenv).unwrap_or_else(|| default.to_string())
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_loads_with_defaults() {
        let json = r#"{"version": 2, "qa": {"commands": [{"name": "tests", "cmd": "cargo test"}]}}"#;
        let cfg: SessionConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(cfg.version, 2);
        assert_eq!(cfg.qa.commands.len(), 1);
        assert_eq!(cfg.qa.commands[0].timeout_ms, 120_000);
        assert_eq!(cfg.auto.max_prs, 10);
        assert_eq!(cfg.retention.branch_days, 7);
    }

    #[test]
    fn state_paths_derive_from_root() {
        let p = StatePaths::new("/repo");
        assert_eq!(p.db(), PathBuf::from("/repo/.state/state.sqlite"));
        assert_eq!(p.metrics(), PathBuf::from("/repo/.state/metrics.ndjson"));
        assert_eq!(p.session_lock(), PathBuf::from("/repo/.state/session.lock"));
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = StatePaths::new(dir.path());
        let cfg = SessionConfig::load(&paths);
        assert_eq!(cfg.base_branch, "main");
        assert_eq!(cfg.backend, "claude");
    }
}
