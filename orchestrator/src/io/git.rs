//! Git adapter for orchestrator operations.
//!
//! Every version-control effect (worktrees, branches, tags, merges, resets)
//! goes through this small, explicit wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::error::OrchestratorError;
use crate::io::process::own_process_group;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// One record of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    pub head: Option<String>,
    /// Short branch name (without `refs/heads/`); `None` when detached.
    pub branch: Option<String>,
}

/// Per-file line counts from `git diff --numstat`. Binary files count as 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumstatEntry {
    pub path: String,
    pub added: u64,
    pub removed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    Soft,
    Hard,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Wrap `workdir`, failing with `NotAGitRepo` unless it is inside a work tree.
    pub fn open(workdir: impl Into<PathBuf>) -> Result<Self> {
        let git = Self::new(workdir);
        if !git.is_repo() {
            return Err(OrchestratorError::NotAGitRepo {
                path: git.workdir.clone(),
            }
            .into());
        }
        Ok(git)
    }

    pub fn is_repo(&self) -> bool {
        if !self.workdir.is_dir() {
            return false;
        }
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true")
            .unwrap_or(false)
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    pub fn head_sha(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Resolve `rev` to a commit sha, `None` if it does not exist.
    pub fn rev_parse(&self, rev: &str) -> Result<Option<String>> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run(&["rev-parse", "--verify", "--quiet", &spec])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure the worktree is clean, allowing entries with any of the given prefixes.
    #[instrument(skip_all)]
    pub fn ensure_clean_except_prefixes(&self, allowed_prefixes: &[&str]) -> Result<()> {
        let entries = self.status_porcelain()?;
        let mut disallowed = Vec::new();
        for entry in entries {
            if allowed_prefixes
                .iter()
                .any(|prefix| entry.path.starts_with(prefix))
            {
                continue;
            }
            disallowed.push(entry);
        }
        if disallowed.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(disallowed_count = disallowed.len(), "worktree not clean");
        let mut msg = String::new();
        msg.push_str("working tree not clean (disallowed changes):\n");
        for entry in disallowed {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Whether `path` is excluded by the repository's ignore rules.
    pub fn is_ignored(&self, path: &str) -> Result<bool> {
        let output = self.run(&["check-ignore", "-q", path])?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(anyhow!(
                "git check-ignore failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Delete a local branch (`-D` when forced).
    pub fn delete_branch(&self, branch: &str, force: bool) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        self.run_checked(&["branch", flag, branch])?;
        Ok(())
    }

    /// `git worktree add -b <branch> <path> <base>`.
    #[instrument(skip_all, fields(branch, base))]
    pub fn worktree_add_new_branch(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        let path = path_arg(path)?;
        debug!(branch, base, path, "adding worktree on new branch");
        self.run_checked(&["worktree", "add", "-b", branch, path, base])?;
        Ok(())
    }

    /// `git worktree add <path> <branch>` for a branch that already exists.
    #[instrument(skip_all, fields(branch))]
    pub fn worktree_add_existing(&self, path: &Path, branch: &str) -> Result<()> {
        let path = path_arg(path)?;
        debug!(branch, path, "adding worktree on existing branch");
        self.run_checked(&["worktree", "add", path, branch])?;
        Ok(())
    }

    pub fn worktree_remove(&self, path: &Path, force: bool) -> Result<()> {
        let path = path_arg(path)?;
        if force {
            self.run_checked(&["worktree", "remove", "--force", path])?;
        } else {
            self.run_checked(&["worktree", "remove", path])?;
        }
        Ok(())
    }

    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    pub fn worktree_list(&self) -> Result<Vec<WorktreeEntry>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out))
    }

    /// Create a lightweight tag at HEAD.
    ///
    /// An existing tag already pointing at HEAD is accepted; one pointing
    /// elsewhere is an error.
    #[instrument(skip_all, fields(tag))]
    pub fn tag_create(&self, tag: &str) -> Result<()> {
        let head = self.head_sha()?;
        if let Some(existing) = self.rev_parse(&format!("refs/tags/{tag}"))? {
            if existing == head {
                debug!(tag, "tag already points at HEAD");
                return Ok(());
            }
            return Err(anyhow!("tag {tag} already exists at {existing}"));
        }
        self.run_checked(&["tag", tag])?;
        Ok(())
    }

    pub fn tag_delete(&self, tag: &str) -> Result<()> {
        self.run_checked(&["tag", "-d", tag])?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
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
        self.run_checked(&["commit", "--no-verify", "-m", message])?;
        Ok(true)
    }

    /// Stage and commit only `paths`. Returns false when they had no changes.
    pub fn commit_paths(&self, paths: &[&str], message: &str) -> Result<bool> {
        let mut args = vec!["add", "--"];
        args.extend_from_slice(paths);
        self.run_checked(&args)?;
        if !self.has_staged_changes()? {
            return Ok(false);
        }
        let mut args = vec!["commit", "--no-verify", "-m", message, "--"];
        args.extend_from_slice(paths);
        self.run_checked(&args)?;
        Ok(true)
    }

    /// Whether `path` is tracked in the index.
    pub fn is_tracked(&self, path: &str) -> Result<bool> {
        let output = self.run(&["ls-files", "--error-unmatch", "--", path])?;
        Ok(output.status.success())
    }

    /// Stage everything and commit if anything changed.
    pub fn commit_all(&self, message: &str) -> Result<bool> {
        self.add_all()?;
        self.commit_staged(message)
    }

    /// Unified diff of the working tree against `rev`.
    pub fn diff(&self, rev: &str) -> Result<String> {
        self.run_capture(&["diff", rev])
    }

    /// `git diff --stat` summary of the working tree against `rev`.
    pub fn diff_stat(&self, rev: &str) -> Result<String> {
        self.run_capture(&["diff", "--stat", rev])
    }

    pub fn diff_name_only(&self, rev: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--name-only", rev])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Per-file counts between two revisions.
    pub fn numstat(&self, from: &str, to: &str) -> Result<Vec<NumstatEntry>> {
        let range = format!("{from}..{to}");
        let out = self.run_capture(&["diff", "--numstat", &range])?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_numstat_line)
            .collect()
    }

    /// Squash-merge `branch` into the current checkout (leaves changes staged).
    #[instrument(skip_all, fields(branch))]
    pub fn merge_squash(&self, branch: &str) -> Result<()> {
        self.run_checked(&["merge", "--squash", branch])?;
        Ok(())
    }

    #[instrument(skip_all, fields(branch))]
    pub fn merge_no_ff(&self, branch: &str, message: &str) -> Result<()> {
        self.run_checked(&["merge", "--no-ff", "--no-verify", "-m", message, branch])?;
        Ok(())
    }

    #[instrument(skip_all, fields(rev, mode = ?mode))]
    pub fn reset(&self, mode: ResetMode, rev: &str) -> Result<()> {
        let flag = match mode {
            ResetMode::Soft => "--soft",
            ResetMode::Hard => "--hard",
        };
        self.run_checked(&["reset", flag, rev])?;
        Ok(())
    }

    /// Remove untracked files and directories (ignored files are kept).
    pub fn clean_untracked(&self) -> Result<()> {
        self.run_checked(&["clean", "-fd"])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            return Err(anyhow!("git {} failed: {}", args.join(" "), detail));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        own_process_group(&mut Command::new("git"))
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("non-utf8 path: {}", path.display()))
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

fn parse_worktree_list(out: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in out.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            entries.extend(current.take());
            current = Some(WorktreeEntry {
                path: PathBuf::from(path.trim()),
                head: None,
                branch: None,
            });
            continue;
        }
        let Some(entry) = current.as_mut() else {
            continue;
        };
        if let Some(head) = line.strip_prefix("HEAD ") {
            entry.head = Some(head.trim().to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            let branch = branch.trim();
            let short = branch.strip_prefix("refs/heads/").unwrap_or(branch);
            entry.branch = Some(short.to_string());
        }
    }
    entries.extend(current);
    entries
}

fn parse_numstat_line(line: &str) -> Result<NumstatEntry> {
    let mut parts = line.splitn(3, '\t');
    let (Some(added), Some(removed), Some(path)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(anyhow!("unexpected numstat line: '{line}'"));
    };
    Ok(NumstatEntry {
        path: path.to_string(),
        added: added.parse().unwrap_or(0),
        removed: removed.parse().unwrap_or(0),
    })
}
