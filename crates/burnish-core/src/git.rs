use std::{path::Path, process::Command};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Synchronous git wrapper. Pure command dispatch; all policy lives in the
/// cycle engine and session supervisor.
pub struct Git {
    pub repo_path: String,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    pub fn exec(&self, dir: &str, args: &[&str]) -> Result<ExecResult> {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .with_context(|| format!("failed to spawn git -C {dir} {}", args.join(" ")))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    fn run(&self, args: &[&str]) -> Result<ExecResult> {
        self.exec(&self.repo_path, args)
    }

    // ── Repository checks ────────────────────────────────────────────────

    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--git-dir"])
            .map(|r| r.success())
            .unwrap_or(false)
    }

    pub fn origin_url(&self) -> Result<Option<String>> {
        let result = self.run(&["remote", "get-url", "origin"])?;
        if !result.success() {
            return Ok(None);
        }
        Ok(Some(result.stdout.trim().to_string()))
    }

    pub fn status_clean(&self, dir: &str) -> Result<bool> {
        let result = self.exec(dir, &["status", "--porcelain"])?;
        Ok(result.stdout.trim().is_empty() && result.exit_code == 0)
    }

    pub fn rev_parse(&self, refname: &str) -> Result<String> {
        let result = self.run(&["rev-parse", refname])?;
        if !result.success() {
            return Err(anyhow!(
                "git rev-parse {refname} failed: {}",
                result.combined_output()
            ));
        }
        Ok(result.stdout.trim().to_string())
    }

    pub fn current_branch(&self, dir: &str) -> Result<String> {
        let result = self.exec(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        if !result.success() {
            return Err(anyhow!(
                "git rev-parse --abbrev-ref HEAD failed in {dir}: {}",
                result.combined_output()
            ));
        }
        Ok(result.stdout.trim().to_string())
    }

    // ── Remote sync ──────────────────────────────────────────────────────

    pub fn fetch_origin(&self) -> Result<()> {
        let result = self.run(&["fetch", "origin"])?;
        if !result.success() {
            return Err(anyhow!(
                "git fetch origin failed: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    /// Fast-forward the base branch from origin. Returns Err on divergence;
    /// the caller decides whether to halt or warn per pull policy.
    pub fn pull_ff_only(&self, base: &str) -> Result<()> {
        let result = self.run(&["pull", "--ff-only", "origin", base])?;
        if !result.success() {
            return Err(anyhow!(
                "git pull --ff-only origin {base} diverged: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    pub fn push_branch(&self, dir: &str, branch: &str) -> Result<()> {
        let result = self.exec(dir, &["push", "-u", "origin", branch])?;
        if !result.success() {
            return Err(anyhow!(
                "git push origin {branch} failed: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    // ── Worktrees ────────────────────────────────────────────────────────

    pub fn create_worktree(&self, wt_path: &str, branch: &str, base: &str) -> Result<()> {
        let result = self.run(&["worktree", "add", wt_path, "-b", branch, base])?;
        if !result.success() {
            return Err(anyhow!(
                "git worktree add failed for branch={branch} base={base}: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    pub fn remove_worktree(&self, wt_path: &str) -> Result<()> {
        let result = self.run(&["worktree", "remove", "--force", wt_path])?;
        if !result.success() {
            return Err(anyhow!(
                "git worktree remove failed for {wt_path}: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    pub fn prune_worktrees(&self) {
        let _ = self.run(&["worktree", "prune"]);
    }

    pub fn list_worktrees(&self) -> Result<Vec<String>> {
        let result = self.run(&["worktree", "list", "--porcelain"])?;
        if !result.success() {
            return Ok(Vec::new());
        }
        Ok(result
            .stdout
            .lines()
            .filter_map(|l| l.strip_prefix("worktree "))
            .map(str::to_string)
            .collect())
    }

    // ── Branches ─────────────────────────────────────────────────────────

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let result = self.run(&["branch", "-D", branch])?;
        if !result.success() {
            return Err(anyhow!(
                "git branch -D {branch} failed: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    pub fn branch_is_merged(&self, branch: &str, base: &str) -> Result<bool> {
        let result = self.run(&["merge-base", "--is-ancestor", branch, base])?;
        Ok(result.success())
    }

    /// Engine branches with their committer dates, for retention pruning.
    pub fn branches_with_prefix(&self, prefix: &str) -> Result<Vec<(String, DateTime<Utc>)>> {
        let result = self.run(&[
            "for-each-ref",
            "--format=%(refname:short) %(committerdate:unix)",
            &format!("refs/heads/{prefix}"),
        ])?;
        if !result.success() {
            return Ok(Vec::new());
        }
        let mut branches = Vec::new();
        for line in result.stdout.lines() {
            let Some((name, epoch)) = line.rsplit_once(' ') else {
                continue;
            };
            let Ok(secs) = epoch.trim().parse::<i64>() else {
                continue;
            };
            if let Some(ts) = DateTime::<Utc>::from_timestamp(secs, 0) {
                branches.push((name.to_string(), ts));
            }
        }
        Ok(branches)
    }

    // ── Diffs and history ────────────────────────────────────────────────

    /// Files changed in a worktree relative to a base ref (committed or not).
    pub fn changed_files(&self, dir: &str, base: &str) -> Result<Vec<String>> {
        let mut files: Vec<String> = Vec::new();
        let diff = self.exec(dir, &["diff", "--name-only", base])?;
        if !diff.success() {
            return Err(anyhow!(
                "git diff --name-only {base} failed in {dir}: {}",
                diff.combined_output()
            ));
        }
        files.extend(diff.stdout.lines().map(str::to_string));
        let untracked = self.exec(dir, &["ls-files", "--others", "--exclude-standard"])?;
        files.extend(untracked.stdout.lines().map(str::to_string));
        files.retain(|f| !f.is_empty());
        files.sort();
        files.dedup();
        Ok(files)
    }

    /// True when any commit touched `path` since the given time. Used by the
    /// sector router to skip unchanged sectors. `git log --since` is
    /// second-granular; pad by one second so a commit in the same second as
    /// the timestamp is not missed.
    pub fn has_changes_since(&self, path: &str, since: DateTime<Utc>) -> Result<bool> {
        let since = since - chrono::Duration::seconds(1);
        let since_arg = since.format("%Y-%m-%dT%H:%M:%S").to_string();
        let result = self.run(&[
            "log",
            "--oneline",
            "-1",
            &format!("--since={since_arg}"),
            "--",
            path,
        ])?;
        Ok(result.success() && !result.stdout.trim().is_empty())
    }

    pub fn diff_stat(&self, dir: &str, base: &str) -> Result<String> {
        let result = self.exec(dir, &["diff", "--stat", base])?;
        Ok(result.stdout)
    }

    // ── Commits and merges ───────────────────────────────────────────────

    /// Stage everything and commit. Returns false when there was nothing to
    /// commit.
    pub fn commit_all(&self, dir: &str, message: &str) -> Result<bool> {
        let add = self.exec(dir, &["add", "-A"])?;
        if !add.success() {
            return Err(anyhow!(
                "git add -A failed in {dir}: {}",
                add.combined_output()
            ));
        }
        let status = self.exec(dir, &["status", "--porcelain"])?;
        if status.stdout.trim().is_empty() {
            return Ok(false);
        }
        let result = self.exec(dir, &["commit", "-m", message])?;
        if !result.success() {
            return Err(anyhow!(
                "git commit failed in {dir}: {}",
                result.combined_output()
            ));
        }
        Ok(true)
    }

    /// Merge a ticket branch into the milestone worktree. On conflict the
    /// merge is aborted and Err is returned so the ticket can be retried
    /// sequentially.
    pub fn merge_branch(&self, dir: &str, branch: &str) -> Result<()> {
        let result = self.exec(dir, &["merge", "--no-ff", branch])?;
        if !result.success() {
            let _ = self.exec(dir, &["merge", "--abort"]);
            return Err(anyhow!(
                "git merge {branch} failed in {dir}: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let result = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        Ok(result.success())
    }
}

/// Compute the worktree path for a ticket branch under the state directory.
pub fn worktree_path(worktrees_dir: &Path, ticket_id: i64) -> String {
    worktrees_dir
        .join(format!("tkt_{ticket_id}"))
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().to_str().expect("utf8");
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "t@example.com"],
            vec!["config", "user.name", "t"],
        ] {
            let ok = Command::new("git")
                .arg("-C")
                .arg(path)
                .args(&args)
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false);
            assert!(ok, "git {args:?} failed");
        }
        std::fs::write(dir.path().join("a.txt"), "hello").expect("write");
        let git = Git::new(path);
        git.commit_all(path, "init").expect("commit");
        dir
    }

    #[test]
    fn is_repo_detects_git_dirs() {
        let dir = init_repo();
        let git = Git::new(dir.path().to_string_lossy());
        assert!(git.is_repo());

        let plain = tempfile::tempdir().expect("tempdir");
        let not_git = Git::new(plain.path().to_string_lossy());
        assert!(!not_git.is_repo());
    }

    #[test]
    fn commit_all_reports_no_changes() {
        let dir = init_repo();
        let path = dir.path().to_string_lossy().into_owned();
        let git = Git::new(path.clone());
        assert!(!git.commit_all(&path, "empty").expect("commit"));
        std::fs::write(dir.path().join("b.txt"), "more").expect("write");
        assert!(git.commit_all(&path, "add b").expect("commit"));
    }

    #[test]
    fn changed_files_lists_untracked_and_modified() {
        let dir = init_repo();
        let path = dir.path().to_string_lossy().into_owned();
        let git = Git::new(path.clone());
        std::fs::write(dir.path().join("a.txt"), "changed").expect("write");
        std::fs::write(dir.path().join("new.txt"), "new").expect("write");
        let files = git.changed_files(&path, "HEAD").expect("diff");
        assert_eq!(files, vec!["a.txt".to_string(), "new.txt".to_string()]);
    }

    #[test]
    fn branch_prefix_listing_parses_dates() {
        let dir = init_repo();
        let path = dir.path().to_string_lossy().into_owned();
        let git = Git::new(path.clone());
        let r = git.exec(&path, &["branch", "burnish/tkt_1/demo"]).expect("branch");
        assert!(r.success());
        let branches = git.branches_with_prefix("burnish/").expect("list");
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].0, "burnish/tkt_1/demo");
    }
}
