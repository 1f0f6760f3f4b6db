use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::sidecar::{load_json, save_json};
use crate::text::{normalize_title, title_similarity};

pub const DEDUP_SIMILARITY_THRESHOLD: f64 = 0.6;
const DEDUP_TTL_DAYS: i64 = 7;
const COOLDOWN_TTL_HOURS: i64 = 48;

// ── Dedup memory ─────────────────────────────────────────────────────────

/// Summary of recently attempted work, used to stop the scout from
/// re-proposing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupEntry {
    pub title_normalized: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub co_titles: Vec<String>,
}

pub struct DedupMemory {
    path: PathBuf,
    inner: Mutex<Vec<DedupEntry>>,
}

impl DedupMemory {
    /// Open and age out entries older than the TTL.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut entries: Vec<DedupEntry> = load_json(&path);
        let cutoff = Utc::now() - Duration::days(DEDUP_TTL_DAYS);
        let before = entries.len();
        entries.retain(|e| e.timestamp > cutoff);
        if entries.len() != before {
            let _ = save_json(&path, &entries);
        }
        Self {
            path,
            inner: Mutex::new(entries),
        }
    }

    pub async fn record(&self, title: &str, success: bool, co_titles: Vec<String>) -> Result<()> {
        let mut guard = self.inner.lock().await;
        guard.push(DedupEntry {
            title_normalized: normalize_title(title),
            timestamp: Utc::now(),
            success,
            co_titles,
        });
        save_json(&self.path, &*guard)
    }

    /// Normalized titles of recent work, newest first, for prompt context.
    pub async fn recent_titles(&self, limit: usize) -> Vec<String> {
        let guard = self.inner.lock().await;
        guard
            .iter()
            .rev()
            .take(limit)
            .map(|e| e.title_normalized.clone())
            .collect()
    }
}

/// True when a candidate title duplicates existing work: exact normalized
/// match or bigram similarity ≥ threshold against existing ticket titles,
/// then the same two checks against open branch names (tool prefix stripped,
/// dashes read as spaces).
pub fn is_duplicate_proposal(
    candidate: &str,
    existing_titles: &[String],
    open_branches: &[String],
    threshold: f64,
    tool_prefix: &str,
) -> bool {
    let normalized = normalize_title(candidate);

    for title in existing_titles {
        if normalize_title(title) == normalized {
            return true;
        }
        if title_similarity(candidate, title) >= threshold {
            return true;
        }
    }

    for branch in open_branches {
        let stripped = branch
            .strip_prefix(tool_prefix)
            .unwrap_or(branch)
            .trim_start_matches('/');
        // Drop the ticket-id segment of `tkt_<id>/<slug>` branches.
        let slug = stripped.rsplit_once('/').map_or(stripped, |(_, s)| s);
        let as_title = slug.replace('-', " ");
        if normalize_title(&as_title) == normalized {
            return true;
        }
        if title_similarity(candidate, &as_title) >= threshold {
            return true;
        }
    }

    false
}

// ── File cooldown ────────────────────────────────────────────────────────

/// A file recently touched by an open PR; proposals overlapping heavily with
/// cooled files are suppressed for 48 h.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCooldownEntry {
    pub file_path: String,
    pub pr_url: String,
    pub created_at: DateTime<Utc>,
}

pub struct FileCooldown {
    path: PathBuf,
    inner: Mutex<Vec<FileCooldownEntry>>,
}

impl FileCooldown {
    /// Open and prune entries past the TTL, rewriting atomically when
    /// anything was dropped.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut entries: Vec<FileCooldownEntry> = load_json(&path);
        let cutoff = Utc::now() - Duration::hours(COOLDOWN_TTL_HOURS);
        let before = entries.len();
        entries.retain(|e| e.created_at > cutoff);
        if entries.len() != before {
            let _ = save_json(&path, &entries);
        }
        Self {
            path,
            inner: Mutex::new(entries),
        }
    }

    /// Record every file of a freshly created PR.
    pub async fn note_pr(&self, files: &[String], pr_url: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let now = Utc::now();
        for file in files {
            guard.push(FileCooldownEntry {
                file_path: file.clone(),
                pr_url: pr_url.to_string(),
                created_at: now,
            });
        }
        save_json(&self.path, &*guard)
    }

    pub async fn cooled_map(&self) -> HashMap<String, String> {
        let guard = self.inner.lock().await;
        let cutoff = Utc::now() - Duration::hours(COOLDOWN_TTL_HOURS);
        guard
            .iter()
            .filter(|e| e.created_at > cutoff)
            .map(|e| (e.file_path.clone(), e.pr_url.clone()))
            .collect()
    }

    /// Drop entries whose PR is known merged or closed. Idempotent.
    pub async fn remove_pr_entries(&self, pr_urls: &[String]) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let before = guard.len();
        guard.retain(|e| !pr_urls.iter().any(|u| *u == e.pr_url));
        if guard.len() != before {
            save_json(&self.path, &*guard)?;
        }
        Ok(())
    }
}

/// Fraction of a proposal's files currently in cooldown.
pub fn compute_cooldown_overlap(files: &[String], cooled: &HashMap<String, String>) -> f64 {
    if files.is_empty() {
        return 0.0;
    }
    let hits = files.iter().filter(|f| cooled.contains_key(*f)).count();
    hits as f64 / files.len() as f64
}

// ── Tests ──────────────────────────────────────────────────────────────────
