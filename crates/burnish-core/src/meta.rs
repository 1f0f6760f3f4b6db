use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::learnings::{similar_exists, Learning, LearningCategory};
use crate::qa::QaStats;
use crate::sidecar::FormulaStats;
use crate::types::Category;

/// One finished ticket, as seen by the meta-learning pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub category: Category,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
}

/// A candidate learning synthesized from aggregate signal. All candidates
/// carry the `process_insight` source; the caller adds them only when no
/// similar learning exists.
#[derive(Debug, Clone, PartialEq)]
pub struct InsightCandidate {
    pub text: String,
    pub category: LearningCategory,
    pub tags: Vec<String>,
}

fn pct(n: f64) -> u32 {
    (n * 100.0).round() as u32
}

/// Inspect aggregate outcomes, QA stats, and formula stats after a cycle and
/// synthesize process insights. Runs once per cycle after cycle ≥ 3.
pub fn extract_insights(
    outcomes: &[OutcomeRecord],
    qa: &QaStats,
    formula_stats: &HashMap<String, FormulaStats>,
    existing: &[Learning],
) -> Vec<InsightCandidate> {
    let mut candidates = Vec::new();

    // Confidence miscalibration over the last 20 outcomes.
    let recent: Vec<&OutcomeRecord> = outcomes.iter().rev().take(20).collect();
    if recent.len() >= 3 {
        let failures = recent.iter().filter(|o| !o.success).count();
        let rate = failures as f64 / recent.len() as f64;
        if rate > 0.4 {
            candidates.push(InsightCandidate {
                text: format!(
                    "High failure rate across recent cycles ({failures}/{} = {}%) — scout may be overestimating feasibility",
                    recent.len(),
                    pct(rate)
                ),
                category: LearningCategory::Warning,
                tags: vec![],
            });
        }
    }

    // Per-category failure pattern.
    let mut by_category: HashMap<Category, (u32, u32)> = HashMap::new();
    for o in outcomes {
        let entry = by_category.entry(o.category).or_insert((0, 0));
        entry.0 += 1;
        if !o.success {
            entry.1 += 1;
        }
    }
    let mut categories: Vec<_> = by_category.into_iter().collect();
    categories.sort_by_key(|(c, _)| c.as_str());
    for (category, (total, failures)) in categories {
        if total < 5 {
            continue;
        }
        let rate = f64::from(failures) / f64::from(total);
        if rate > 0.5 {
            candidates.push(InsightCandidate {
                text: format!(
                    "Category {} has high failure rate ({}% over {total} tickets) — consider smaller scope",
                    category.as_str(),
                    pct(rate)
                ),
                category: LearningCategory::Warning,
                tags: vec![format!("category:{}", category.as_str())],
            });
        }
    }

    // Per-command timeout pattern.
    let mut commands: Vec<_> = qa.commands.iter().collect();
    commands.sort_by_key(|(name, _)| name.as_str());
    for (name, stats) in &commands {
        if stats.total_runs < 5 {
            continue;
        }
        let rate = f64::from(stats.timeouts) / f64::from(stats.total_runs);
        if rate > 0.2 {
            candidates.push(InsightCandidate {
                text: format!(
                    "QA command {name} times out frequently ({}% of {} runs) — consider increasing timeout",
                    pct(rate),
                    stats.total_runs
                ),
                category: LearningCategory::Gotcha,
                tags: vec![format!("cmd:{name}")],
            });
        }
    }

    // Reliability: one command owning most failures.
    let total_failures: u32 = commands.iter().map(|(_, s)| s.failures).sum();
    if commands.len() >= 2 && total_failures >= 3 {
        for (name, stats) in &commands {
            let share = f64::from(stats.failures) / f64::from(total_failures);
            if share > 0.6 {
                candidates.push(InsightCandidate {
                    text: format!(
                        "{name} is the primary QA failure source ({}% of all failures) — focus on compatibility",
                        pct(share)
                    ),
                    category: LearningCategory::Gotcha,
                    tags: vec![format!("cmd:{name}")],
                });
            }
        }
    }

    // Formula effectiveness and merge rate.
    let mut formulas: Vec<_> = formula_stats.iter().collect();
    formulas.sort_by_key(|(name, _)| name.as_str());
    for (name, stats) in formulas {
        if stats.tickets >= 5 {
            let rate = f64::from(stats.successes) / f64::from(stats.tickets);
            if rate < 0.4 {
                candidates.push(InsightCandidate {
                    text: format!(
                        "Formula {name} has low success rate ({}%) — consider adjusting scope or switching formulas",
                        pct(rate)
                    ),
                    category: LearningCategory::Warning,
                    tags: vec![format!("formula:{name}")],
                });
            }
        }
        let resolved = stats.prs_merged + stats.prs_closed;
        if resolved >= 3 {
            let merge_rate = f64::from(stats.prs_merged) / f64::from(resolved);
            if merge_rate < 0.5 {
                candidates.push(InsightCandidate {
                    text: format!(
                        "Formula {name} PRs are frequently closed ({}% merge rate) — output may not match project standards",
                        pct(merge_rate)
                    ),
                    category: LearningCategory::Warning,
                    tags: vec![format!("formula:{name}")],
                });
            }
        }
    }

    // Substring dedup against existing learnings; ambiguous cases do not add.
    candidates.retain(|c| !similar_exists(existing, &c.text));
    candidates
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learnings::LearningSource;
    use crate::qa::QaCommandStats;
    use chrono::Utc;

    fn outcome(category: Category, success: bool) -> OutcomeRecord {
        OutcomeRecord {
            category,
            success,
            formula: None,
        }
    }

    fn existing_learning(text: &str) -> Learning {
        Learning {
            id: "abcdabcd".into(),
            text: text.into(),
            category: LearningCategory::Warning,
            source: LearningSource::ProcessInsight,
            source_detail: None,
            tags: vec![],
            weight: 50,
            created_at: Utc::now(),
            last_confirmed_at: Utc::now(),
            access_count: 0,
            applied_count: 0,
            success_count: 0,
        }
    }

    #[test]
    fn miscalibration_fires_above_40_percent_failures() {
        let outcomes: Vec<OutcomeRecord> = (0..10)
            .map(|i| outcome(Category::Refactor, i % 2 == 0))
            .collect();
        let insights = extract_insights(&outcomes, &QaStats::default(), &HashMap::new(), &[]);
        assert!(insights
            .iter()
            .any(|c| c.text.contains("overestimating feasibility")));
    }

    #[test]
    fn category_pattern_needs_five_outcomes() {
        let mut outcomes: Vec<OutcomeRecord> =
            (0..4).map(|_| outcome(Category::Perf, false)).collect();
        // Pad with successes so the global failure rate stays below 0.4.
        outcomes.extend((0..16).map(|_| outcome(Category::Docs, true)));
        let insights = extract_insights(&outcomes, &QaStats::default(), &HashMap::new(), &[]);
        assert!(!insights.iter().any(|c| c.text.starts_with("Category perf")));

        outcomes.push(outcome(Category::Perf, false));
        let insights = extract_insights(&outcomes, &QaStats::default(), &HashMap::new(), &[]);
        let hit = insights
            .iter()
            .find(|c| c.text.starts_with("Category perf"))
            .expect("category insight");
        assert_eq!(hit.tags, vec!["category:perf".to_string()]);
    }

    #[test]
    fn timeout_and_reliability_checks() {
        let mut qa = QaStats::default();
        qa.commands.insert(
            "tests".into(),
            QaCommandStats {
                total_runs: 10,
                timeouts: 3,
                failures: 4,
                ..QaCommandStats::default()
            },
        );
        qa.commands.insert(
            "lint".into(),
            QaCommandStats {
                total_runs: 10,
                failures: 1,
                ..QaCommandStats::default()
            },
        );
        let insights = extract_insights(&[], &qa, &HashMap::new(), &[]);
        assert!(insights
            .iter()
            .any(|c| c.text.contains("times out frequently") && c.tags == vec!["cmd:tests".to_string()]));
        assert!(insights
            .iter()
            .any(|c| c.text.contains("primary QA failure source")));
    }

    #[test]
    fn formula_checks_fire_on_weak_and_unmerged() {
        let mut stats = HashMap::new();
        stats.insert(
            "deep".to_string(),
            FormulaStats {
                tickets: 6,
                successes: 2,
                prs_merged: 1,
                prs_closed: 3,
            },
        );
        let insights = extract_insights(&[], &QaStats::default(), &stats, &[]);
        assert!(insights.iter().any(|c| c.text.contains("low success rate")));
        assert!(insights
            .iter()
            .any(|c| c.text.contains("frequently closed")));
    }

    #[test]
    fn existing_similar_learning_suppresses_candidate() {
        let outcomes: Vec<OutcomeRecord> =
            (0..10).map(|_| outcome(Category::Refactor, false)).collect();
        let existing = vec![existing_learning(
            "High failure rate across recent cycles (10/10 = 100%) — scout may be overestimating feasibility",
        )];
        let insights = extract_insights(&outcomes, &QaStats::default(), &HashMap::new(), &existing);
        assert!(!insights
            .iter()
            .any(|c| c.text.contains("overestimating feasibility")));
    }
}
