use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::sidecar::FormulaStats;
use crate::types::Category;

/// A named preset of categories, confidence floor, and scout emphasis for a
/// cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Formula {
    pub name: String,
    /// Empty = every category allowed.
    pub categories: Vec<Category>,
    pub min_confidence: u8,
    /// Deep formulas only run against sectors above the production-file gate.
    pub deep: bool,
    pub hint: String,
}

impl Formula {
    pub fn allows_category(&self, category: Category) -> bool {
        self.categories.is_empty() || self.categories.contains(&category)
    }
}

pub fn all_formulas() -> Vec<Formula> {
    vec![
        Formula {
            name: "balanced".into(),
            categories: vec![],
            min_confidence: 30,
            deep: false,
            hint: "Propose a balanced mix of improvements across categories.".into(),
        },
        Formula {
            name: "quick-wins".into(),
            categories: vec![Category::Cleanup, Category::Docs, Category::Types, Category::Fix],
            min_confidence: 50,
            deep: false,
            hint: "Prefer small, high-confidence changes that land in one pass.".into(),
        },
        Formula {
            name: "deep".into(),
            categories: vec![Category::Refactor, Category::Perf, Category::Security],
            min_confidence: 20,
            deep: true,
            hint: "Look for structural problems worth a larger, planned change.".into(),
        },
        Formula {
            name: "docs-audit".into(),
            categories: vec![Category::Docs],
            min_confidence: 40,
            deep: false,
            hint: "Audit documentation for drift against the current code.".into(),
        },
        Formula {
            name: "security-sweep".into(),
            categories: vec![Category::Security, Category::Fix],
            min_confidence: 40,
            deep: false,
            hint: "Hunt for unsafe patterns, injection surfaces, and missing validation.".into(),
        },
    ]
}

pub fn get_formula(name: &str) -> Option<Formula> {
    all_formulas().into_iter().find(|f| f.name == name)
}

/// UCB1 pick over formula success stats. Deep formulas are excluded when the
/// target sector is below the production-file gate; when that leaves no
/// explored arm the pick yields None and the caller falls back to balanced.
pub fn pick_formula(stats: &HashMap<String, FormulaStats>, allows_deep: bool) -> Option<Formula> {
    let candidates: Vec<Formula> = all_formulas()
        .into_iter()
        .filter(|f| allows_deep || !f.deep)
        .collect();
    if candidates.is_empty() {
        return None;
    }

    // Try unexplored arms first, in declaration order.
    if let Some(unexplored) = candidates
        .iter()
        .find(|f| stats.get(&f.name).map(|s| s.tickets).unwrap_or(0) == 0)
    {
        return Some(unexplored.clone());
    }

    let total: u32 = candidates
        .iter()
        .filter_map(|f| stats.get(&f.name))
        .map(|s| s.tickets)
        .sum();
    if total == 0 {
        return None;
    }
    let ln_total = f64::from(total).ln();

    candidates
        .into_iter()
        .map(|f| {
            let s = stats.get(&f.name).cloned().unwrap_or_default();
            let n = f64::from(s.tickets.max(1));
            let mean = f64::from(s.successes) / n;
            let bonus = (2.0 * ln_total / n).sqrt();
            (mean + bonus, f)
        })
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, f)| f)
}

/// Resolve the cycle's formula: explicit override, then UCB1, then balanced.
pub fn resolve_formula(
    override_name: Option<&str>,
    stats: &HashMap<String, FormulaStats>,
    allows_deep: bool,
) -> Formula {
    if let Some(name) = override_name {
        if let Some(f) = get_formula(name) {
            if !f.deep || allows_deep {
                return f;
            }
        }
    }
    pick_formula(stats, allows_deep)
        .unwrap_or_else(|| get_formula("balanced").unwrap_or_else(|| all_formulas().remove(0)))
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_allows_everything() {
        let balanced = get_formula("balanced").expect("balanced");
        for c in Category::all() {
            assert!(balanced.allows_category(c));
        }
        let quick = get_formula("quick-wins").expect("quick-wins");
        assert!(quick.allows_category(Category::Docs));
        assert!(!quick.allows_category(Category::Refactor));
    }

    #[test]
    fn deep_is_gated_by_sector() {
        let deep_override = resolve_formula(Some("deep"), &HashMap::new(), false);
        assert_ne!(deep_override.name, "deep");
        let deep_override = resolve_formula(Some("deep"), &HashMap::new(), true);
        assert_eq!(deep_override.name, "deep");
    }

    #[test]
    fn ucb1_explores_then_exploits() {
        let mut stats = HashMap::new();
        // Only balanced explored: the picker should try an unexplored arm.
        stats.insert(
            "balanced".to_string(),
            FormulaStats {
                tickets: 5,
                successes: 5,
                ..FormulaStats::default()
            },
        );
        let pick = pick_formula(&stats, true).expect("pick");
        assert_ne!(pick.name, "balanced");

        // All explored: a strong arm with few pulls wins over a weak one.
        for f in all_formulas() {
            stats.entry(f.name.clone()).or_insert(FormulaStats {
                tickets: 10,
                successes: 1,
                ..FormulaStats::default()
            });
        }
        stats.insert(
            "quick-wins".to_string(),
            FormulaStats {
                tickets: 10,
                successes: 9,
                ..FormulaStats::default()
            },
        );
        let pick = pick_formula(&stats, true).expect("pick");
        assert_eq!(pick.name, "quick-wins");
    }
}
