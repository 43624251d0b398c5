//! Version-control collaborator.
//!
//! The scheduler only needs a handful of operations, so it depends on the
//! [`VcsManager`] trait and the binary plugs in [`Git`], a small explicit
//! wrapper around `git` subprocess calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Branch and commit operations the scheduler relies on.
pub trait VcsManager {
    fn is_repository(&self) -> bool;
    fn current_branch(&self) -> Result<String>;
    fn branch_exists(&self, name: &str) -> bool;
    /// Create `name` at HEAD and check it out.
    fn create_branch(&self, name: &str) -> Result<()>;
    fn checkout_branch(&self, name: &str) -> Result<()>;
    fn has_changes(&self) -> bool;
    /// Stage everything and commit it for a task. Returns `Ok(false)` without
    /// committing when there is nothing to commit.
    fn commit_task(&self, id: &str, title: &str, description: &str) -> Result<bool>;
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

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Paths with uncommitted changes, untracked files included.
    pub fn changed_paths(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        Ok(out
            .lines()
            .filter_map(|line| line.get(3..))
            .map(|path| match path.split_once(" -> ") {
                Some((_, renamed)) => renamed.to_string(),
                None => path.to_string(),
            })
            .collect())
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
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl VcsManager for Git {
    fn is_repository(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    fn branch_exists(&self, name: &str) -> bool {
        self.run(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{name}"),
        ])
        .map(|out| out.status.success())
        .unwrap_or(false)
    }

    #[instrument(skip_all, fields(branch = name))]
    fn create_branch(&self, name: &str) -> Result<()> {
        debug!("creating and checking out new branch");
        self.run_checked(&["checkout", "-b", name])?;
        Ok(())
    }

    #[instrument(skip_all, fields(branch = name))]
    fn checkout_branch(&self, name: &str) -> Result<()> {
        debug!("checking out branch");
        self.run_checked(&["checkout", name])?;
        Ok(())
    }

    fn has_changes(&self) -> bool {
        match self.changed_paths() {
            Ok(paths) => !paths.is_empty(),
            Err(err) => {
                warn!(err = %err, "git status failed");
                false
            }
        }
    }

    #[instrument(skip_all, fields(task_id = id))]
    fn commit_task(&self, id: &str, title: &str, description: &str) -> Result<bool> {
        if !self.has_changes() {
            debug!("nothing changed, skipping commit");
            return Ok(false);
        }
        self.add_all()?;
        self.commit_staged(&commit_message(id, title, description))
    }
}

/// `feat(<id>): <title>` followed by the description as the body.
pub fn commit_message(id: &str, title: &str, description: &str) -> String {
    let mut msg = format!("feat({id}): {}", title.trim());
    let body = description.trim();
    if !body.is_empty() {
        msg.push_str("\n\n");
        msg.push_str(body);
    }
    msg
}
