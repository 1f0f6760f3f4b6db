use std::collections::HashSet;
use std::path::Path;

use globset::Glob;
use serde::{Deserialize, Serialize};

use crate::types::Proposal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Strict,
    Normal,
    Relaxed,
}

impl Default for Sensitivity {
    fn default() -> Self {
        Self::Normal
    }
}

/// File names that make sibling edits collide in practice (barrel files,
/// manifests, lint/build configuration).
const CONFLICT_PRONE: &[&str] = &[
    "package.json",
    "Cargo.toml",
    "__init__.py",
    "go.mod",
    "tsconfig.json",
    "pyproject.toml",
    "Makefile",
    ".eslintrc",
    ".eslintrc.js",
    ".eslintrc.json",
];

/// Parent directory names that act as shared surface under strict sensitivity.
const SHARED_PARENTS: &[&str] = &[
    "shared",
    "common",
    "utils",
    "helpers",
    "lib",
    "types",
    "interfaces",
    "constants",
    "config",
];

const MONOREPO_ROOTS: &[&str] = &["packages", "apps", "libs", "modules"];

fn is_conflict_prone(file: &str) -> bool {
    let name = Path::new(file)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.starts_with("index.") || CONFLICT_PRONE.iter().any(|c| name == *c)
}

fn parent_dir(file: &str) -> String {
    Path::new(file)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn dirs_of(p: &Proposal) -> HashSet<String> {
    p.files.iter().map(|f| parent_dir(f)).collect()
}

/// First monorepo package prefix of a path (`packages/x`, `apps/x`, …).
fn monorepo_package(file: &str) -> Option<String> {
    let mut parts = Path::new(file).components();
    let first = parts.next()?.as_os_str().to_string_lossy().into_owned();
    if !MONOREPO_ROOTS.contains(&first.as_str()) {
        return None;
    }
    let second = parts.next()?.as_os_str().to_string_lossy().into_owned();
    Some(format!("{first}/{second}"))
}

/// Exact path match, or one side is a glob that contains the other.
fn paths_overlap(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    glob_contains(a, b) || glob_contains(b, a)
}

fn glob_contains(pattern: &str, path: &str) -> bool {
    if !pattern.contains('*') {
        return false;
    }
    Glob::new(pattern)
        .map(|g| g.compile_matcher().is_match(path))
        .unwrap_or(false)
}

fn dir_jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    let union = a.len() + b.len() - inter;
    inter as f64 / union as f64
}

/// Conflict predicate between two proposals at the given sensitivity.
pub fn conflicts(a: &Proposal, b: &Proposal, sensitivity: Sensitivity) -> bool {
    // Direct file overlap always conflicts.
    for fa in &a.files {
        for fb in &b.files {
            if paths_overlap(fa, fb) {
                return true;
            }
        }
    }

    if sensitivity == Sensitivity::Relaxed {
        return false;
    }

    let dirs_a = dirs_of(a);
    let dirs_b = dirs_of(b);
    let shares_dir = dirs_a.intersection(&dirs_b).next().is_some();

    if shares_dir {
        let touches_prone = a.files.iter().chain(&b.files).any(|f| is_conflict_prone(f));
        if touches_prone || a.category == b.category {
            return true;
        }
    }

    let jaccard = dir_jaccard(&dirs_a, &dirs_b);
    let jaccard_threshold = match sensitivity {
        Sensitivity::Strict => 0.2,
        _ => 0.3,
    };
    if jaccard >= jaccard_threshold {
        return true;
    }

    if sensitivity == Sensitivity::Strict {
        let shared_parent = |dirs: &HashSet<String>| -> HashSet<String> {
            dirs.iter()
                .filter(|d| {
                    Path::new(d)
                        .components()
                        .any(|c| SHARED_PARENTS.contains(&c.as_os_str().to_string_lossy().as_ref()))
                })
                .cloned()
                .collect()
        };
        if !shared_parent(&dirs_a).is_empty() && !shared_parent(&dirs_b).is_empty() {
            return true;
        }

        let pkgs_a: HashSet<String> = a.files.iter().filter_map(|f| monorepo_package(f)).collect();
        let pkgs_b: HashSet<String> = b.files.iter().filter_map(|f| monorepo_package(f)).collect();
        if pkgs_a.intersection(&pkgs_b).next().is_some() {
            return true;
        }
    }

    false
}

/// Partition proposals into ordered waves: first-fit into the earliest wave
/// with no conflicting member. Stable and deterministic in input order.
pub fn partition_into_waves(proposals: Vec<Proposal>, sensitivity: Sensitivity) -> Vec<Vec<Proposal>> {
    let mut waves: Vec<Vec<Proposal>> = Vec::new();
    for proposal in proposals {
        let slot = waves
            .iter()
            .position(|wave| wave.iter().all(|member| !conflicts(member, &proposal, sensitivity)));
        match slot {
            Some(i) => waves[i].push(proposal),
            None => waves.push(vec![proposal]),
        }
    }
    waves
}

/// Adaptive wave parallelism: more light (trivial/simple) proposals allow a
/// wider wave, capped at 5 workers.
pub fn adaptive_parallelism(proposals: &[Proposal]) -> usize {
    if proposals.is_empty() {
        return 2;
    }
    let light = proposals
        .iter()
        .filter(|p| p.estimated_complexity.is_light())
        .count();
    let light_ratio = light as f64 / proposals.len() as f64;
    let raw = (2.0 + light_ratio * 3.0).round() as usize;
    raw.clamp(2, 5)
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, Complexity};

    fn proposal(title: &str, category: Category, files: &[&str]) -> Proposal {
        Proposal {
            category,
            title: title.into(),
            description: String::new(),
            acceptance_criteria: vec![],
            verification_commands: vec![],
            allowed_paths: vec![],
            files: files.iter().map(|f| f.to_string()).collect(),
            confidence: 70,
            impact_score: 5,
            risk: Default::default(),
            estimated_complexity: Complexity::Moderate,
            rollback_note: None,
        }
    }

    #[test]
    fn direct_file_overlap_always_conflicts() {
        let a = proposal("a", Category::Refactor, &["src/main.rs"]);
        let b = proposal("b", Category::Docs, &["src/main.rs"]);
        assert!(conflicts(&a, &b, Sensitivity::Relaxed));
    }

    #[test]
    fn glob_containment_conflicts() {
        let a = proposal("a", Category::Refactor, &["src/auth/*.ts"]);
        let b = proposal("b", Category::Docs, &["src/auth/login.ts"]);
        assert!(conflicts(&a, &b, Sensitivity::Relaxed));
    }

    #[test]
    fn siblings_same_category_conflict_under_normal_not_relaxed() {
        let p1 = proposal("p1", Category::Refactor, &["src/auth/login.ts"]);
        let p2 = proposal("p2", Category::Refactor, &["src/auth/session.ts"]);

        let waves = partition_into_waves(vec![p1.clone(), p2.clone()], Sensitivity::Normal);
        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0].len(), 1);
        assert_eq!(waves[1].len(), 1);

        let waves = partition_into_waves(vec![p1, p2], Sensitivity::Relaxed);
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].len(), 2);
    }

    #[test]
    fn siblings_different_category_need_conflict_prone_file() {
        let a = proposal("a", Category::Refactor, &["src/x/one.rs", "other/place.rs"]);
        let b = proposal("b", Category::Docs, &["src/x/index.ts", "another/spot.rs"]);
        assert!(conflicts(&a, &b, Sensitivity::Normal));

        let c = proposal("c", Category::Docs, &["src/x/plain.rs", "another/spot.rs"]);
        // Shared dir but neither conflict-prone nor same category; jaccard
        // 1/3 ≥ 0.3 still conflicts under normal.
        assert!(conflicts(&a, &c, Sensitivity::Normal));
    }

    #[test]
    fn strict_shared_parent_and_monorepo_rules() {
        let a = proposal("a", Category::Refactor, &["packages/core/src/a.ts"]);
        let b = proposal("b", Category::Docs, &["packages/core/docs/b.md"]);
        assert!(!conflicts(&a, &b, Sensitivity::Normal));
        assert!(conflicts(&a, &b, Sensitivity::Strict));

        let c = proposal("c", Category::Fix, &["src/utils/x.ts"]);
        let d = proposal("d", Category::Perf, &["app/utils/y.ts"]);
        assert!(conflicts(&c, &d, Sensitivity::Strict));
        assert!(!conflicts(&c, &d, Sensitivity::Normal));
    }

    #[test]
    fn partition_preserves_input_multiset() {
        let input = vec![
            proposal("a", Category::Refactor, &["src/a.rs"]),
            proposal("b", Category::Refactor, &["src/b.rs"]),
            proposal("c", Category::Docs, &["docs/c.md"]),
            proposal("d", Category::Refactor, &["src/a.rs"]),
        ];
        let n = input.len();
        let waves = partition_into_waves(input, Sensitivity::Normal);
        let total: usize = waves.iter().map(|w| w.len()).sum();
        assert_eq!(total, n);
        // No two members of the same wave conflict.
        for wave in &waves {
            for i in 0..wave.len() {
                for j in (i + 1)..wave.len() {
                    assert!(!conflicts(&wave[i], &wave[j], Sensitivity::Normal));
                }
            }
        }
    }

    #[test]
    fn adaptive_parallelism_scales_with_light_ratio() {
        let heavy = vec![
            proposal("a", Category::Refactor, &["a.rs"]),
            proposal("b", Category::Refactor, &["b.rs"]),
        ];
        assert_eq!(adaptive_parallelism(&heavy), 2);

        let mut light = heavy.clone();
        for p in &mut light {
            p.estimated_complexity = Complexity::Trivial;
        }
        assert_eq!(adaptive_parallelism(&light), 5);

        assert_eq!(adaptive_parallelism(&[]), 2);
    }
}
