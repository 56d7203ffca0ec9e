//! Git subprocess wrapper.
//!
//! The version-control tool is an external collaborator: everything here
//! shells out to `git` and classifies failures into
//! [`FleetError::GitOperation`] with the invoked command, exit code, and
//! captured stderr. Nothing in this module reimplements git behavior.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;
use normalize_path::NormalizePath;

use crate::config::SyncStrategy;
use crate::errors::FleetError;

/// Repository context for git operations.
///
/// Encapsulates the working directory all commands run in — the host
/// repository for provisioning, or an individual worktree for sync and
/// status queries.
#[derive(Debug, Clone)]
pub struct Repository {
    path: PathBuf,
}

impl Repository {
    /// Create a repository context at the specified path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The directory commands run in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn spawn(&self, args: &[&str]) -> anyhow::Result<std::process::Output> {
        log::debug!("git {} (in {})", args.join(" "), self.path.display());
        Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .with_context(|| format!("Failed to execute: git {}", args.join(" ")))
    }

    /// Run a git command and return its stdout.
    ///
    /// A non-zero exit becomes a [`FleetError::GitOperation`] carrying the
    /// command line, exit code, and trimmed stderr.
    pub fn run(&self, args: &[&str]) -> anyhow::Result<String> {
        let output = self.spawn(args)?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            for line in stderr.lines() {
                log::debug!("  ! {line}");
            }
            let command = format!("git {}", args.join(" "));
            return Err(FleetError::GitOperation {
                message: format!("Command failed: {command}"),
                command,
                exit_code: output.status.code(),
                stderr,
                conflict: false,
                source: None,
            }
            .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        for line in stdout.trim().lines() {
            log::debug!("  {line}");
        }
        Ok(stdout)
    }

    /// Run a git command and return whether it exited zero.
    ///
    /// For commands that answer a question through their exit code, like
    /// `git merge-base --is-ancestor`.
    pub fn run_check(&self, args: &[&str]) -> anyhow::Result<bool> {
        Ok(self.spawn(args)?.status.success())
    }

    /// Whether this directory is inside a git repository.
    pub fn is_git_repository(&self) -> bool {
        self.run_check(&["rev-parse", "--git-dir"]).unwrap_or(false)
    }

    /// The `.git` directory for this worktree, as an absolute path.
    pub fn git_dir(&self) -> anyhow::Result<PathBuf> {
        let raw = self.run(&["rev-parse", "--git-dir"])?;
        Ok(self.path.join(raw.trim()).normalize())
    }

    /// The common `.git` directory shared by all worktrees of this repository.
    pub fn git_common_dir(&self) -> anyhow::Result<PathBuf> {
        let raw = self.run(&["rev-parse", "--git-common-dir"])?;
        Ok(self.path.join(raw.trim()).normalize())
    }

    /// URL of a remote, or `None` if the remote is missing or has no URL.
    pub fn remote_url(&self, remote: &str) -> Option<String> {
        self.run(&["remote", "get-url", remote])
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
    }

    /// Whether a remote with this name is configured.
    pub fn has_remote(&self, remote: &str) -> bool {
        self.run(&["remote"])
            .map(|out| out.lines().any(|line| line.trim() == remote))
            .unwrap_or(false)
    }

    /// Provision a new worktree on a fresh branch cut from `base`.
    pub fn add_worktree(&self, branch: &str, path: &Path, base: &str) -> anyhow::Result<()> {
        let path_str = path.to_string_lossy();
        self.run(&["worktree", "add", "-b", branch, path_str.as_ref(), base])?;
        Ok(())
    }

    /// Remove a worktree. With `force`, uncommitted changes are discarded.
    pub fn remove_worktree(&self, path: &Path, force: bool) -> anyhow::Result<()> {
        let path_str = path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path_str.as_ref());
        self.run(&args)?;
        Ok(())
    }

    /// Commits ahead of and behind `base`, as `(ahead, behind)`.
    pub fn commit_counts(&self, base: &str) -> anyhow::Result<(u64, u64)> {
        let range = format!("{base}...HEAD");
        let out = self.run(&["rev-list", "--left-right", "--count", &range])?;
        parse_left_right(&out).ok_or_else(|| {
            FleetError::GitOperation {
                message: format!("Unexpected rev-list output: {:?}", out.trim()),
                command: format!("git rev-list --left-right --count {range}"),
                exit_code: None,
                stderr: String::new(),
                conflict: false,
                source: None,
            }
            .into()
        })
    }

    /// Number of uncommitted changes in the working tree.
    ///
    /// A failing `git status` counts as clean rather than erroring, so a
    /// status display never fails on an odd repository state.
    pub fn uncommitted_count(&self) -> usize {
        match self.run(&["status", "--porcelain"]) {
            Ok(out) => count_status_lines(&out),
            Err(err) => {
                log::debug!("git status failed, treating as clean: {err}");
                0
            }
        }
    }

    /// Whether `branch` has been integrated into `base` (ancestry check).
    pub fn is_merged_into(&self, branch: &str, base: &str) -> anyhow::Result<bool> {
        self.run_check(&["merge-base", "--is-ancestor", branch, base])
    }

    /// Whether `commit` was brought into `base` by a merge: it appears as a
    /// non-first parent of a merge commit reachable from `base`.
    ///
    /// Ancestry alone cannot tell a merged branch from one that simply fell
    /// behind; this is the positive evidence that something was integrated.
    pub fn is_merge_parent(&self, commit: &str, base: &str) -> anyhow::Result<bool> {
        let out = self.run(&["rev-list", "--merges", "--parents", base])?;
        Ok(merge_parents_contain(&out, commit))
    }

    /// Reconcile the checked-out branch with `base` using `strategy`.
    ///
    /// Fetches first when an `origin` remote exists and reconciles against
    /// `origin/<base>`; otherwise reconciles against the local base branch.
    /// On a conflict the half-finished merge/rebase is aborted best-effort
    /// and the error comes back labeled as a conflict.
    pub fn sync_with_base(&self, base: &str, strategy: SyncStrategy) -> anyhow::Result<()> {
        let upstream = if self.has_remote("origin") {
            self.run(&["fetch", "origin", base])?;
            format!("origin/{base}")
        } else {
            base.to_string()
        };

        let verb = match strategy {
            SyncStrategy::Merge => "merge",
            SyncStrategy::Rebase => "rebase",
        };

        match self.run(&[verb, &upstream]) {
            Ok(_) => Ok(()),
            Err(err) => Err(self.classify_sync_failure(err, base, strategy)),
        }
    }

    /// Relabel a failed merge/rebase as a conflict when the evidence says so.
    ///
    /// Substring matching on stderr is fragile (git's phrasing is locale and
    /// version dependent), so the git directory is also probed for in-progress
    /// merge/rebase state before deciding.
    fn classify_sync_failure(
        &self,
        err: anyhow::Error,
        base: &str,
        strategy: SyncStrategy,
    ) -> anyhow::Error {
        let conflict_state = self.in_conflict_state();
        match err.downcast::<FleetError>() {
            Ok(FleetError::GitOperation {
                command,
                exit_code,
                stderr,
                source,
                ..
            }) => {
                let conflict = stderr_indicates_conflict(&stderr) || conflict_state;
                if conflict {
                    self.abort_sync(strategy);
                }
                let message = if conflict {
                    format!(
                        "Conflict while syncing with {base} using {strategy}; resolve manually and re-run"
                    )
                } else {
                    format!("Failed to sync with {base} using {strategy}")
                };
                FleetError::GitOperation {
                    message,
                    command,
                    exit_code,
                    stderr,
                    conflict,
                    source,
                }
                .into()
            }
            Ok(other) => other.into(),
            Err(err) => err,
        }
    }

    /// Whether the git directory shows an in-progress merge or rebase.
    fn in_conflict_state(&self) -> bool {
        let Ok(git_dir) = self.git_dir() else {
            return false;
        };
        git_dir.join("MERGE_HEAD").exists()
            || git_dir.join("rebase-merge").exists()
            || git_dir.join("rebase-apply").exists()
    }

    /// Abort a half-finished merge/rebase. Failure here is ignored; the
    /// original sync error is what the caller needs to see.
    fn abort_sync(&self, strategy: SyncStrategy) {
        let args = match strategy {
            SyncStrategy::Merge => ["merge", "--abort"],
            SyncStrategy::Rebase => ["rebase", "--abort"],
        };
        if let Err(err) = self.run(&args) {
            log::debug!("abort after conflict failed: {err}");
        }
    }
}

/// Parse `git rev-list --left-right --count base...HEAD` output into
/// `(ahead, behind)`. The left count is commits only on base (behind),
/// the right count commits only on HEAD (ahead).
fn parse_left_right(output: &str) -> Option<(u64, u64)> {
    let mut fields = output.split_whitespace();
    let behind = fields.next()?.parse().ok()?;
    let ahead = fields.next()?.parse().ok()?;
    Some((ahead, behind))
}

/// Scan `git rev-list --merges --parents` output for `commit` among the
/// non-first parents. Each line is `<merge> <parent1> <parent2> ...`; the
/// first parent is the line the merge landed on, so only later parents
/// represent merged-in tips.
fn merge_parents_contain(output: &str, commit: &str) -> bool {
    output.lines().any(|line| {
        line.split_whitespace()
            .skip(2)
            .any(|parent| parent == commit)
    })
}

/// Whether captured stderr carries git's conflict indicator.
pub(crate) fn stderr_indicates_conflict(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("conflict")
}

/// Count entries in `git status --porcelain` output.
fn count_status_lines(output: &str) -> usize {
    output.lines().filter(|line| !line.trim().is_empty()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_left_right_counts() {
        // left (behind) 2, right (ahead) 5
        assert_eq!(parse_left_right("2\t5\n"), Some((5, 2)));
        assert_eq!(parse_left_right("0\t0"), Some((0, 0)));
        assert_eq!(parse_left_right(""), None);
        assert_eq!(parse_left_right("x\ty"), None);
    }

    #[test]
    fn merge_parents_exclude_first_parent_and_mainline() {
        // merge-sha first-parent second-parent
        let history = "\
f00f a111 b222
dead c333 d444 e555
";
        assert!(merge_parents_contain(history, "b222"));
        assert!(merge_parents_contain(history, "d444"));
        assert!(merge_parents_contain(history, "e555"));
        // First parents are the mainline, not merged-in tips.
        assert!(!merge_parents_contain(history, "a111"));
        assert!(!merge_parents_contain(history, "c333"));
        // The merge commits themselves don't count either.
        assert!(!merge_parents_contain(history, "f00f"));
        assert!(!merge_parents_contain("", "b222"));
    }

    #[test]
    fn conflict_indicator_is_case_insensitive() {
        assert!(stderr_indicates_conflict(
            "CONFLICT (content): Merge conflict in src/lib.rs"
        ));
        assert!(stderr_indicates_conflict(
            "error: could not apply 1a2b3c... fix\nhint: resolve all conflicts manually"
        ));
        assert!(!stderr_indicates_conflict(
            "fatal: couldn't find remote ref main"
        ));
        assert!(!stderr_indicates_conflict(""));
    }

    #[test]
    fn counts_porcelain_status_lines() {
        assert_eq!(count_status_lines(""), 0);
        assert_eq!(count_status_lines("\n\n"), 0);
        assert_eq!(count_status_lines(" M src/lib.rs\n?? notes.txt\n"), 2);
    }

    #[test]
    fn failed_command_is_a_git_operation_error() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::at(dir.path());
        // Not a repository, so rev-parse fails (or git itself is absent;
        // either way the result is an error, classified when git ran).
        let err = match repo.run(&["rev-parse", "--git-dir"]) {
            Err(err) => err,
            Ok(_) => return, // running inside a repo-containing tmpdir; nothing to assert
        };
        if let Some(FleetError::GitOperation {
            command, conflict, ..
        }) = err.downcast_ref::<FleetError>()
        {
            assert_eq!(command, "git rev-parse --git-dir");
            assert!(!conflict);
        }
    }
}
