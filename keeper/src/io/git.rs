//! Git adapter for keeper runs.
//!
//! Every call goes through a timeout. The wrapper deliberately has no
//! force-push, hard reset or forced branch deletion: run branches are only
//! ever created, committed to, pushed, or safe-deleted while empty.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};

const GIT_OUTPUT_LIMIT_BYTES: usize = 4 * 1024 * 1024;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Full SHA of HEAD.
    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    /// Ensure the worktree is clean, allowing entries with any of the given prefixes.
    #[instrument(skip_all)]
    pub fn ensure_clean_except_prefixes(&self, allowed_prefixes: &[&str]) -> Result<()> {
        let disallowed: Vec<StatusEntry> = self
            .status_porcelain()?
            .into_iter()
            .filter(|entry| {
                !allowed_prefixes
                    .iter()
                    .any(|prefix| entry.path.starts_with(prefix))
            })
            .collect();
        if disallowed.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(disallowed_count = disallowed.len(), "worktree not clean");
        let mut msg = String::from("working tree not clean (disallowed changes):\n");
        for entry in disallowed {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// True if `branch` exists locally or as a remote-tracking ref of `remote`.
    pub fn branch_exists(&self, remote: &str, branch: &str) -> Result<bool> {
        for reference in [
            format!("refs/heads/{branch}"),
            format!("refs/remotes/{remote}/{branch}"),
        ] {
            let out = self.run(&["show-ref", "--verify", "--quiet", &reference])?;
            if out.success() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Fast-forward the current branch from `remote`.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn pull_ff_only(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["pull", "--ff-only", remote, branch])?;
        Ok(())
    }

    /// Stage exactly `paths`, including deletions.
    pub fn add_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "-A", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// Reset the changed entries among `paths`, in both index and working tree,
    /// to `HEAD`. Paths absent from `HEAD` are removed; unchanged paths are skipped.
    #[instrument(skip_all, fields(paths = paths.len()))]
    pub fn restore_paths(&self, paths: &[String]) -> Result<()> {
        let dirty: Vec<String> = self
            .status_porcelain()?
            .into_iter()
            .map(|entry| entry.path)
            .filter(|path| paths.contains(path))
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }
        debug!(dirty = dirty.len(), "restoring paths to HEAD");
        // Staging first makes new files known, so the restore pathspec always matches.
        self.add_paths(&dirty)?;
        let mut args = vec!["restore", "--source=HEAD", "--staged", "--worktree", "--"];
        args.extend(dirty.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_capture(&["diff", "--cached", "--name-only"])?;
        Ok(!out.trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Number of commits on `branch` that are not on `base`.
    pub fn commits_ahead(&self, base: &str, branch: &str) -> Result<usize> {
        let range = format!("{base}..{branch}");
        let out = self.run_capture(&["rev-list", "--count", &range])?;
        out.trim()
            .parse()
            .map_err(|e| anyhow!("parse rev-list count '{}': {e}", out.trim()))
    }

    /// Delete a local branch only if git considers it merged (`branch -d`).
    #[instrument(skip_all, fields(branch))]
    pub fn delete_branch_safe(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-d", branch])?;
        Ok(())
    }

    /// Push `branch` to `remote` and set upstream. Never forced.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn push_branch(&self, remote: &str, branch: &str) -> Result<()> {
        self.run_checked(&["push", "-u", remote, branch])?;
        Ok(())
    }

    /// Tracked files matching a pathspec, in git's order.
    pub fn ls_files(&self, pathspec: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&["ls-files", "--", pathspec])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Run a git command and return stdout, failing on non-zero exit.
    pub fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout_lossy())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {}s",
                args.join(" "),
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0");
        run_command_with_timeout(cmd, None, self.timeout, GIT_OUTPUT_LIMIT_BYTES)
            .map_err(|e| e.context(format!("spawn git {}", args.join(" "))))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_untracked_and_modified_lines() {
        let untracked = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(untracked.code, "??");
        assert_eq!(untracked.path, "foo.txt");

        let modified = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(modified.code, " M");
        assert_eq!(modified.path, "src/main.rs");
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn branch_lifecycle_without_commits_allows_safe_delete() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        assert_eq!(git.current_branch().expect("branch"), "main");
        assert!(!git.branch_exists("origin", "keeper/x").expect("exists"));

        git.checkout_new_branch("keeper/x").expect("create");
        assert!(git.branch_exists("origin", "keeper/x").expect("exists"));
        assert_eq!(git.commits_ahead("main", "keeper/x").expect("ahead"), 0);

        git.checkout_branch("main").expect("back");
        git.delete_branch_safe("keeper/x").expect("delete");
        assert!(!git.branch_exists("origin", "keeper/x").expect("exists"));
    }

    #[test]
    fn restore_paths_reverts_edits_creations_and_deletions() {
        let repo = TestRepo::new().expect("repo");
        repo.write_file("src/keep.rs", "keep\n").expect("write");
        repo.write_file("src/gone.rs", "gone\n").expect("write");
        repo.commit_all("seed").expect("commit");
        let git = repo.git();

        repo.write_file("README.md", "edited\n").expect("write");
        repo.write_file("src/new/created.rs", "new\n").expect("write");
        std::fs::remove_file(repo.path().join("src/gone.rs")).expect("remove");
        let touched: Vec<String> = ["README.md", "src/new/created.rs", "src/gone.rs", "src/never.rs"]
            .iter()
            .map(|p| p.to_string())
            .collect();
        git.add_paths(&touched[..2]).expect("stage some");

        git.restore_paths(&touched).expect("restore");

        assert!(git.status_porcelain().expect("status").is_empty());
        assert_eq!(repo.read_file("README.md").expect("read"), "# scratch\n");
        assert_eq!(repo.read_file("src/gone.rs").expect("read"), "gone\n");
        assert!(!repo.path().join("src/new/created.rs").exists());
        git.restore_paths(&touched).expect("clean tree is a no-op");
    }

    #[test]
    fn safe_delete_refuses_branch_with_commits() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        git.checkout_new_branch("keeper/y").expect("create");
        repo.write_file("new.txt", "content\n").expect("write");
        git.add_paths(&["new.txt".to_string()]).expect("add");
        assert!(git.commit_staged("add file").expect("commit"));
        git.checkout_branch("main").expect("back");

        assert_eq!(git.commits_ahead("main", "keeper/y").expect("ahead"), 1);
        assert!(git.delete_branch_safe("keeper/y").is_err());
        assert!(git.branch_exists("origin", "keeper/y").expect("exists"));
    }

    #[test]
    fn ls_files_matches_pathspec() {
        let repo = TestRepo::new().expect("repo");
        repo.write_file("src/a.rs", "a\n").expect("write");
        repo.write_file("src/b.txt", "b\n").expect("write");
        repo.commit_all("files").expect("commit");
        let files = repo.git().ls_files("src/*.rs").expect("ls-files");
        assert_eq!(files, vec!["src/a.rs".to_string()]);
    }
}
