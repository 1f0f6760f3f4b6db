use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::sidecar::{load_json, save_json};
use crate::text::{bigrams, jaccard, normalize_title};

pub const DEFAULT_DECAY_RATE: u32 = 3;
const MAX_TEXT_LEN: usize = 200;
const DEFAULT_WEIGHT: u32 = 50;
const CONSOLIDATE_THRESHOLD: usize = 50;
const CONSOLIDATE_SIMILARITY: f64 = 0.7;
const SELECT_LIMIT: usize = 15;
const PROMPT_CHAR_BUDGET: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearningCategory {
    Gotcha,
    Pattern,
    Warning,
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningSource {
    QaFailure,
    TicketFailure,
    TicketSuccess,
    ReviewDowngrade,
    PlanRejection,
    ScopeViolation,
    ReviewerFeedback,
    CrossSectorPattern,
    ProcessInsight,
    Manual,
}

/// A persisted cross-run lesson. Weight lives in [0, 100]; a learning whose
/// weight decays to 0 is pruned at session start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    pub id: String,
    pub text: String,
    pub category: LearningCategory,
    pub source: LearningSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_detail: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub weight: u32,
    pub created_at: DateTime<Utc>,
    pub last_confirmed_at: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u32,
    #[serde(default)]
    pub applied_count: u32,
    #[serde(default)]
    pub success_count: u32,
}

impl Learning {
    fn failure_type_tag(&self) -> Option<&str> {
        self.tags
            .iter()
            .find_map(|t| t.strip_prefix("failureType:"))
    }
}

fn random_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn truncate_text(text: &str) -> String {
    text.chars().take(MAX_TEXT_LEN).collect()
}

/// Mutex-guarded learning store backed by `learnings.json`.
pub struct LearningStore {
    path: PathBuf,
    inner: Mutex<Vec<Learning>>,
}

impl LearningStore {
    /// Open without decay (manual inspection paths).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let learnings = load_json(&path);
        Self {
            path,
            inner: Mutex::new(learnings),
        }
    }

    /// Session-start load: decay every learning and prune the dead.
    ///
    /// Decay halves once for any learning that has been accessed at least
    /// once, and halves again when it was confirmed within the last 7 days.
    pub fn open_with_decay(path: impl Into<PathBuf>, decay_rate: u32) -> Result<Self> {
        let path = path.into();
        let mut learnings: Vec<Learning> = load_json(&path);
        let before = learnings.len();
        let now = Utc::now();
        for l in &mut learnings {
            let mut decay = decay_rate;
            if l.access_count >= 1 {
                decay /= 2;
            }
            if now - l.last_confirmed_at < Duration::days(7) {
                decay /= 2;
            }
            l.weight = l.weight.saturating_sub(decay);
        }
        learnings.retain(|l| l.weight > 0);
        if learnings.len() != before {
            info!(
                "learnings decay pruned {} of {} entries",
                before - learnings.len(),
                before
            );
        }
        save_json(&path, &learnings)?;
        Ok(Self {
            path,
            inner: Mutex::new(learnings),
        })
    }

    pub async fn all(&self) -> Vec<Learning> {
        self.inner.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn add(
        &self,
        text: &str,
        category: LearningCategory,
        source: LearningSource,
        source_detail: Option<String>,
        tags: Vec<String>,
    ) -> Result<String> {
        let learning = Learning {
            id: random_id(),
            text: truncate_text(text),
            category,
            source,
            source_detail,
            tags,
            weight: DEFAULT_WEIGHT,
            created_at: Utc::now(),
            last_confirmed_at: Utc::now(),
            access_count: 0,
            applied_count: 0,
            success_count: 0,
        };
        let id = learning.id.clone();
        let mut guard = self.inner.lock().await;
        guard.push(learning);
        save_json(&self.path, &*guard)?;
        Ok(id)
    }

    pub async fn confirm(&self, id: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(l) = guard.iter_mut().find(|l| l.id == id) {
            l.weight = (l.weight + 10).min(100);
            l.last_confirmed_at = Utc::now();
        }
        save_json(&self.path, &*guard)
    }

    pub async fn record_access(&self, ids: &[String]) -> Result<()> {
        let mut guard = self.inner.lock().await;
        for l in guard.iter_mut() {
            if ids.iter().any(|id| *id == l.id) {
                l.access_count += 1;
            }
        }
        save_json(&self.path, &*guard)
    }

    pub async fn record_application(&self, id: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(l) = guard.iter_mut().find(|l| l.id == id) {
            l.applied_count += 1;
        }
        save_json(&self.path, &*guard)
    }

    pub async fn record_outcome(&self, id: &str, success: bool) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(l) = guard.iter_mut().find(|l| l.id == id) {
            if success {
                l.success_count += 1;
                l.weight = (l.weight + 2).min(100);
            } else {
                l.weight = l.weight.saturating_sub(1).max(1);
            }
        }
        save_json(&self.path, &*guard)
    }

    /// Merge near-duplicate learnings once the set outgrows the threshold.
    ///
    /// Candidates must agree on category, source kind, and failureType tag,
    /// sit at title similarity ≥ 0.7, and both still be cold
    /// (access_count < 3). The higher-weight entry keeps its text; access
    /// counts sum, tags union, the newest confirmation survives. If the merge
    /// would shrink the set below 40% of the threshold the write is aborted.
    pub async fn consolidate(&self) -> Result<usize> {
        let mut guard = self.inner.lock().await;
        if guard.len() <= CONSOLIDATE_THRESHOLD {
            return Ok(0);
        }

        let sets: Vec<_> = guard
            .iter()
            .map(|l| bigrams(&normalize_title(&l.text)))
            .collect();

        let mut merged_into: Vec<Option<usize>> = vec![None; guard.len()];
        let mut merges = 0usize;
        for i in 0..guard.len() {
            if merged_into[i].is_some() {
                continue;
            }
            for j in (i + 1)..guard.len() {
                if merged_into[j].is_some() {
                    continue;
                }
                let (a, b) = (&guard[i], &guard[j]);
                if a.category != b.category
                    || a.source != b.source
                    || a.failure_type_tag() != b.failure_type_tag()
                    || a.access_count >= 3
                    || b.access_count >= 3
                {
                    continue;
                }
                if jaccard(&sets[i], &sets[j]) < CONSOLIDATE_SIMILARITY {
                    continue;
                }
                merged_into[j] = Some(i);
                merges += 1;
            }
        }

        if merges == 0 {
            return Ok(0);
        }
        let survivors = guard.len() - merges;
        if survivors < CONSOLIDATE_THRESHOLD * 2 / 5 {
            info!(
                "consolidation aborted: would reduce {} learnings to {}",
                guard.len(),
                survivors
            );
            return Ok(0);
        }

        for j in (0..guard.len()).rev() {
            let Some(i) = merged_into[j] else { continue };
            let victim = guard.remove(j);
            let keeper = &mut guard[i];
            if victim.weight > keeper.weight {
                keeper.text = victim.text.clone();
                keeper.weight = victim.weight;
            }
            keeper.access_count += victim.access_count;
            keeper.applied_count += victim.applied_count;
            keeper.success_count += victim.success_count;
            keeper.last_confirmed_at = keeper.last_confirmed_at.max(victim.last_confirmed_at);
            for tag in victim.tags {
                if !keeper.tags.contains(&tag) {
                    keeper.tags.push(tag);
                }
            }
        }

        info!("consolidated {merges} near-duplicate learnings");
        save_json(&self.path, &*guard)?;
        Ok(merges)
    }

    /// Score learnings against a ticket's paths, commands, and title, and
    /// return the most relevant ones.
    pub async fn select_relevant(
        &self,
        paths: &[String],
        commands: &[String],
        title_hint: Option<&str>,
    ) -> Vec<Learning> {
        let guard = self.inner.lock().await;
        let now = Utc::now();
        let mut scored: Vec<(i64, Learning)> = guard
            .iter()
            .map(|l| {
                let mut score: i64 = 0;
                for tag in &l.tags {
                    if let Some(tag_path) = tag.strip_prefix("path:") {
                        let tag_path = tag_path.trim_end_matches("/**");
                        for p in paths {
                            let p = p.trim_end_matches("/**");
                            if p == tag_path {
                                score += 30;
                            } else if p.starts_with(tag_path) || tag_path.starts_with(p) {
                                score += 15;
                            }
                        }
                    } else if let Some(tag_cmd) = tag.strip_prefix("cmd:") {
                        if commands.iter().any(|c| c.contains(tag_cmd)) {
                            score += 10;
                        }
                    } else if tag.starts_with("failureType:") && !commands.is_empty() {
                        score += 5;
                    }
                }
                if let Some(hint) = title_hint {
                    let text_lower = l.text.to_lowercase();
                    if hint
                        .to_lowercase()
                        .split_whitespace()
                        .filter(|w| w.len() > 3)
                        .any(|w| text_lower.contains(w))
                    {
                        score += 3;
                    }
                }
                if l.category == LearningCategory::Gotcha && !commands.is_empty() {
                    score += 10;
                }
                if now - l.last_confirmed_at < Duration::days(3) {
                    score += 5;
                }
                score += i64::from(l.weight);
                (score, l.clone())
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(SELECT_LIMIT)
            .map(|(_, l)| l)
            .collect()
    }
}

/// Render a `<project-learnings>` prompt block, highest weight first, within
/// the character budget.
pub fn format_for_prompt(learnings: &[Learning], char_budget: Option<usize>) -> String {
    let budget = char_budget.unwrap_or(PROMPT_CHAR_BUDGET);
    let mut sorted: Vec<&Learning> = learnings.iter().collect();
    sorted.sort_by(|a, b| b.weight.cmp(&a.weight));

    let mut out = String::from("<project-learnings>\n");
    for l in sorted {
        let line = format!("- [{}] {}\n", l.weight, l.text);
        if out.len() + line.len() + "</project-learnings>".len() > budget {
            break;
        }
        out.push_str(&line);
    }
    out.push_str("</project-learnings>");
    out
}

/// Dedup key check used before synthesizing a new learning: a similar
/// learning already exists when either text contains the other
/// (case-insensitive).
pub fn similar_exists(learnings: &[Learning], text: &str) -> bool {
    let needle = text.to_lowercase();
    learnings.iter().any(|l| {
        let existing = l.text.to_lowercase();
        existing.contains(&needle) || needle.contains(&existing)
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> LearningStore {
        LearningStore::open(dir.path().join("learnings.json"))
    }

    fn seeded(dir: &tempfile::TempDir, learnings: Vec<Learning>) -> LearningStore {
        let path = dir.path().join("learnings.json");
        save_json(&path, &learnings).expect("seed");
        LearningStore::open(path)
    }

    fn learning(text: &str, weight: u32) -> Learning {
        Learning {
            id: random_id(),
            text: text.into(),
            category: LearningCategory::Gotcha,
            source: LearningSource::QaFailure,
            source_detail: None,
            tags: vec!["failureType:qa".into()],
            weight,
            created_at: Utc::now(),
            last_confirmed_at: Utc::now() - Duration::days(30),
            access_count: 0,
            applied_count: 0,
            success_count: 0,
        }
    }

    #[tokio::test]
    async fn add_truncates_and_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(&dir);
        let long = "x".repeat(500);
        let id = s
            .add(&long, LearningCategory::Gotcha, LearningSource::Manual, None, vec![])
            .await
            .expect("add");
        assert_eq!(id.len(), 8);
        let all = s.all().await;
        assert_eq!(all[0].text.chars().count(), 200);
        assert_eq!(all[0].weight, 50);
    }

    #[test]
    fn decay_halves_for_accessed_and_recent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut stale = learning("stale", 3);
        stale.id = "aaaaaaaa".into();
        let mut accessed = learning("accessed", 10);
        accessed.id = "bbbbbbbb".into();
        accessed.access_count = 2;
        let mut fresh = learning("fresh", 10);
        fresh.id = "cccccccc".into();
        fresh.last_confirmed_at = Utc::now();
        fresh.access_count = 1;

        let path = dir.path().join("learnings.json");
        save_json(&path, &vec![stale, accessed, fresh]).expect("seed");
        let s = LearningStore::open_with_decay(&path, DEFAULT_DECAY_RATE).expect("open");
        let all = futures_block(s.all());
        // stale lost 3 of 3 and is pruned; accessed lost 1; fresh lost 0.
        assert_eq!(all.len(), 2);
        assert_eq!(all.iter().find(|l| l.id == "bbbbbbbb").map(|l| l.weight), Some(9));
        assert_eq!(all.iter().find(|l| l.id == "cccccccc").map(|l| l.weight), Some(10));
    }

    #[tokio::test]
    async fn confirm_clamps_at_100() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut l = learning("clamp", 95);
        l.id = "dddddddd".into();
        let s = seeded(&dir, vec![l]);
        s.confirm("dddddddd").await.expect("confirm");
        assert_eq!(s.all().await[0].weight, 100);
    }

    #[tokio::test]
    async fn outcome_floor_is_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut l = learning("floor", 1);
        l.id = "eeeeeeee".into();
        let s = seeded(&dir, vec![l]);
        s.record_outcome("eeeeeeee", false).await.expect("outcome");
        assert_eq!(s.all().await[0].weight, 1);
        s.record_outcome("eeeeeeee", true).await.expect("outcome");
        let after = &s.all().await[0];
        assert_eq!(after.weight, 3);
        assert_eq!(after.success_count, 1);
    }

    #[tokio::test]
    async fn consolidate_merges_duplicates_above_threshold() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut learnings: Vec<Learning> = (0..50)
            .map(|i| {
                // Hot learnings (access_count ≥ 3) are never consolidation
                // candidates; this keeps the filler set stable.
                let mut l = learning(&format!("distinct learning number {i} about topic {i}"), 40);
                l.access_count = 3;
                l
            })
            .collect();
        let mut dup_a = learning("cargo test flaky on integration suite", 60);
        dup_a.id = "dupdup01".into();
        let mut dup_b = learning("cargo test flaky on integration suites", 30);
        dup_b.id = "dupdup02".into();
        dup_b.access_count = 1;
        learnings.push(dup_a);
        learnings.push(dup_b);

        let s = seeded(&dir, learnings);
        let merges = s.consolidate().await.expect("consolidate");
        assert!(merges >= 1);
        let all = s.all().await;
        let survivor = all.iter().find(|l| l.id == "dupdup01").expect("survivor");
        assert!(!all.iter().any(|l| l.id == "dupdup02"));
        // Higher weight won the text; access counts summed.
        assert_eq!(survivor.text, "cargo test flaky on integration suite");
        assert_eq!(survivor.access_count, 1);

        // Fixed point: a second application merges nothing further.
        assert_eq!(s.consolidate().await.expect("consolidate"), 0);
    }

    #[tokio::test]
    async fn consolidate_noop_below_threshold() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = seeded(&dir, vec![learning("a", 10), learning("a!", 10)]);
        assert_eq!(s.consolidate().await.expect("consolidate"), 0);
    }

    #[tokio::test]
    async fn select_relevant_prefers_path_matches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut path_hit = learning("watch the auth module's session cache", 10);
        path_hit.id = "f0f0f0f0".into();
        path_hit.tags = vec!["path:src/auth".into()];
        let mut unrelated = learning("docs build is slow", 10);
        unrelated.id = "f1f1f1f1".into();
        unrelated.tags = vec!["path:docs".into()];
        unrelated.category = LearningCategory::Context;
        let s = seeded(&dir, vec![unrelated, path_hit]);

        let selected = s
            .select_relevant(&["src/auth/**".into()], &[], None)
            .await;
        assert_eq!(selected[0].id, "f0f0f0f0");
    }

    #[test]
    fn prompt_block_respects_budget() {
        let learnings: Vec<Learning> = (0..100)
            .map(|i| learning(&format!("learning number {i} with some padding text"), 50))
            .collect();
        let block = format_for_prompt(&learnings, Some(400));
        assert!(block.len() <= 400);
        assert!(block.starts_with("<project-learnings>"));
        assert!(block.ends_with("</project-learnings>"));
    }

    #[test]
    fn similar_exists_is_substring_both_directions() {
        let existing = vec![learning("QA command tests times out frequently", 50)];
        assert!(similar_exists(&existing, "qa command tests times out"));
        assert!(similar_exists(
            &existing,
            "QA command tests times out frequently on large repos"
        ));
        assert!(!similar_exists(&existing, "lint is broken"));
    }

    fn futures_block<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime")
            .block_on(f)
    }
}
