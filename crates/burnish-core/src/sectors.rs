use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::git::Git;
use crate::sidecar::{load_json, save_json};

const MIN_PRODUCTION_FILES: usize = 3;
/// Directories above this size are split into second-level sectors.
const SPLIT_FILE_COUNT: usize = 200;
const YIELD_EMA_FACTOR: f64 = 0.3;
/// Production-file floor for the deep formula.
const DEEP_FORMULA_MIN_PRODUCTION: u32 = 25;

const SOURCE_EXTS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "mjs", "py", "go", "java", "kt", "c", "h", "cpp", "cc", "hpp",
    "rb", "cs", "swift", "scala", "php", "zig", "ex", "exs",
];

const NON_PRODUCTION_MARKERS: &[&str] = &[
    "test",
    "tests",
    "__tests__",
    "spec",
    "specs",
    "fixtures",
    "vendor",
    "third_party",
    "node_modules",
    "dist",
    "build",
    "target",
    "generated",
    "docs",
    "doc",
    "examples",
    "migrations",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationConfidence {
    Low,
    Medium,
    High,
}

/// A classified subtree of the repo used as the unit of scouting rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sector {
    pub path: String,
    pub file_count: u32,
    pub production_file_count: Option<u32>,
    pub production: bool,
    pub purpose: String,
    pub confidence: ClassificationConfidence,
    #[serde(default)]
    pub last_scanned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_scanned_cycle: u32,
    #[serde(default)]
    pub scan_count: u32,
    /// EMA of proposals per scan.
    #[serde(default)]
    pub proposal_yield: f64,
    #[serde(default)]
    pub category_successes: BTreeMap<String, u32>,
}

impl Sector {
    /// Deep-formula gate: an unknown production count is treated as
    /// unbounded and allows deep.
    pub fn allows_deep_formula(&self) -> bool {
        self.production_file_count
            .map(|n| n >= DEEP_FORMULA_MIN_PRODUCTION)
            .unwrap_or(true)
    }

    fn depth(&self) -> usize {
        Path::new(&self.path).components().count()
    }

    fn production_files(&self) -> u32 {
        self.production_file_count.unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SectorState {
    pub version: u32,
    pub sectors: Vec<Sector>,
    /// Sectors fully scanned this session (zero-yield after escalation).
    pub session_scanned_sectors: Vec<String>,
}

impl Default for SectorState {
    fn default() -> Self {
        Self {
            version: 2,
            sectors: Vec::new(),
            session_scanned_sectors: Vec::new(),
        }
    }
}

// ── Classification ───────────────────────────────────────────────────────

fn has_source_ext(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SOURCE_EXTS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn is_test_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    name.contains(".test.") || name.contains("_test.") || name.starts_with("test_")
}

fn path_has_marker(rel: &Path) -> bool {
    rel.components().any(|c| {
        let c = c.as_os_str().to_string_lossy().to_lowercase();
        NON_PRODUCTION_MARKERS.contains(&c.as_str())
    })
}

/// A file counts as production source when it has a source extension and
/// neither its path nor its name marks it as test/vendor/generated/doc.
fn is_production_file(rel: &Path) -> bool {
    has_source_ext(rel) && !path_has_marker(rel) && !is_test_file(rel)
}

fn classify(path: &str, file_count: u32, production_count: u32) -> (bool, String, ClassificationConfidence) {
    let purity = if file_count == 0 {
        0.0
    } else {
        f64::from(production_count) / f64::from(file_count)
    };
    let production = purity > 0.5;
    let purpose = if path_has_marker(Path::new(path)) {
        let lowered = path.to_lowercase();
        if lowered.contains("test") || lowered.contains("spec") {
            "tests".to_string()
        } else if lowered.contains("doc") {
            "documentation".to_string()
        } else if lowered.contains("vendor") || lowered.contains("third_party") {
            "vendored".to_string()
        } else {
            "support".to_string()
        }
    } else if production {
        "source".to_string()
    } else {
        "support".to_string()
    };
    let polarity = purity.max(1.0 - purity);
    let confidence = if file_count >= 20 && polarity >= 0.8 {
        ClassificationConfidence::High
    } else if file_count >= 5 {
        ClassificationConfidence::Medium
    } else {
        ClassificationConfidence::Low
    };
    (production, purpose, confidence)
}

/// Scan the repo once and build the sector partition: every top-level
/// directory with enough production files becomes a sector; oversized
/// directories split by their second level.
pub fn build_sectors(repo_root: &Path) -> Vec<Sector> {
    // (total, production) counts per first- and second-level directory.
    let mut top: BTreeMap<String, (u32, u32)> = BTreeMap::new();
    let mut second: BTreeMap<String, (u32, u32)> = BTreeMap::new();

    let walker = WalkBuilder::new(repo_root)
        .hidden(true)
        .git_ignore(true)
        .build();
    for entry in walker.flatten() {
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(repo_root) else {
            continue;
        };
        let mut components = rel.components();
        let Some(first) = components.next() else {
            continue;
        };
        let first = first.as_os_str().to_string_lossy().into_owned();
        if first.starts_with('.') {
            continue;
        }
        // Files directly at the root belong to no sector.
        if rel.components().count() < 2 {
            continue;
        }
        let production = is_production_file(rel);

        let t = top.entry(first.clone()).or_insert((0, 0));
        t.0 += 1;
        if production {
            t.1 += 1;
        }

        if let Some(second_comp) = components.next() {
            if rel.components().count() >= 3 {
                let key = format!("{first}/{}", second_comp.as_os_str().to_string_lossy());
                let s = second.entry(key).or_insert((0, 0));
                s.0 += 1;
                if production {
                    s.1 += 1;
                }
            }
        }
    }

    let mut sectors = Vec::new();
    for (path, (files, production_files)) in &top {
        if (*production_files as usize) < MIN_PRODUCTION_FILES {
            continue;
        }
        if (*files as usize) > SPLIT_FILE_COUNT {
            let mut split_any = false;
            for (sub_path, (sub_files, sub_production)) in
                second.range(format!("{path}/")..format!("{path}0"))
            {
                if (*sub_production as usize) < MIN_PRODUCTION_FILES {
                    continue;
                }
                sectors.push(make_sector(sub_path, *sub_files, *sub_production));
                split_any = true;
            }
            if split_any {
                continue;
            }
        }
        sectors.push(make_sector(path, *files, *production_files));
    }

    info!("sector scan built {} sectors", sectors.len());
    sectors
}

fn make_sector(path: &str, file_count: u32, production_count: u32) -> Sector {
    let (production, purpose, confidence) = classify(path, file_count, production_count);
    Sector {
        path: path.to_string(),
        file_count,
        production_file_count: Some(production_count),
        production,
        purpose,
        confidence,
        last_scanned_at: None,
        last_scanned_cycle: 0,
        scan_count: 0,
        proposal_yield: 0.0,
        category_successes: BTreeMap::new(),
    }
}

// ── Router ───────────────────────────────────────────────────────────────

pub struct SectorRouter {
    path: PathBuf,
    inner: Mutex<SectorState>,
}

#[derive(Debug, Clone)]
pub struct SectorPick {
    pub path: String,
    /// Scope glob handed to the scout.
    pub scope: String,
    pub allows_deep: bool,
}

impl SectorRouter {
    /// Load `sectors.json`, building the partition on first use. The
    /// session-scanned set always starts empty.
    pub fn open(path: impl Into<PathBuf>, repo_root: &Path) -> Result<Self> {
        let path = path.into();
        let mut state: SectorState = load_json(&path);
        state.session_scanned_sectors.clear();
        if state.sectors.is_empty() {
            state.sectors = build_sectors(repo_root);
        }
        save_json(&path, &state)?;
        Ok(Self {
            path,
            inner: Mutex::new(state),
        })
    }

    pub async fn snapshot(&self) -> SectorState {
        self.inner.lock().await.clone()
    }

    /// Pick the next sector to scout, or None when every eligible sector has
    /// been scanned and is unchanged.
    pub async fn pick_next(&self, git: &Git) -> Option<SectorPick> {
        let guard = self.inner.lock().await;
        let mut candidates: Vec<&Sector> = guard
            .sectors
            .iter()
            .filter(|s| s.file_count > 0 && s.production_files() > 0)
            .filter(|s| !guard.session_scanned_sectors.contains(&s.path))
            .filter(|s| match s.last_scanned_at {
                None => true,
                Some(ts) => git.has_changes_since(&s.path, ts).unwrap_or_else(|e| {
                    warn!("change detection for sector {}: {e}", s.path);
                    false
                }),
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.scan_count
                .cmp(&b.scan_count)
                .then(a.last_scanned_cycle.cmp(&b.last_scanned_cycle))
                .then(b.production_files().cmp(&a.production_files()))
                .then(b.proposal_yield.total_cmp(&a.proposal_yield))
                .then(b.confidence.cmp(&a.confidence))
                .then(b.production.cmp(&a.production))
                .then(a.depth().cmp(&b.depth()))
                .then(a.path.cmp(&b.path))
        });

        candidates.first().map(|s| SectorPick {
            path: s.path.clone(),
            scope: format!("{}/**", s.path),
            allows_deep: s.allows_deep_formula(),
        })
    }

    /// Record a scout scan against a sector. A scan that saw zero files
    /// zeroes the sector's counts so it is never re-selected.
    pub async fn record_scan(
        &self,
        sector_path: &str,
        cycle: u32,
        scanned_files: u32,
        proposals: u32,
    ) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(sector) = guard.sectors.iter_mut().find(|s| s.path == sector_path) {
            sector.scan_count += 1;
            sector.last_scanned_at = Some(Utc::now());
            sector.last_scanned_cycle = cycle;
            let observed = f64::from(proposals);
            sector.proposal_yield = if sector.scan_count == 1 {
                observed
            } else {
                YIELD_EMA_FACTOR * observed + (1.0 - YIELD_EMA_FACTOR) * sector.proposal_yield
            };
            if scanned_files == 0 {
                sector.file_count = 0;
                sector.production_file_count = Some(0);
            }
        }
        save_json(&self.path, &*guard)
    }

    /// Mark a sector exhausted for the rest of this session.
    pub async fn mark_session_scanned(&self, sector_path: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if !guard.session_scanned_sectors.iter().any(|s| s == sector_path) {
            guard
                .session_scanned_sectors
                .push(sector_path.to_string());
        }
        save_json(&self.path, &*guard)
    }

    /// Apply a `sector_reclassification` reported by the scout.
    pub async fn reclassify(&self, sector_path: &str, production: bool, purpose: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(sector) = guard.sectors.iter_mut().find(|s| s.path == sector_path) {
            sector.production = production;
            sector.purpose = purpose.to_string();
        }
        save_json(&self.path, &*guard)
    }

    pub async fn record_category_success(&self, sector_path: &str, category: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if let Some(sector) = guard.sectors.iter_mut().find(|s| s.path == sector_path) {
            *sector.category_successes.entry(category.to_string()).or_insert(0) += 1;
        }
        save_json(&self.path, &*guard)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
