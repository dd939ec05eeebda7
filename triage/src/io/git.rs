//! Git adapter for triage commands.
//!
//! Attempt history is read back from commit metadata every run, and fixes are
//! committed under the agent identity, so we keep a small, explicit wrapper
//! around `git` subprocess calls. Every call is bounded by a timeout.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};

const OUTPUT_LIMIT_BYTES: usize = 4 * 1024 * 1024;

// Unit and record separators keep multi-line commit bodies unambiguous.
const FIELD_SEP: char = '\u{1f}';
const RECORD_SEP: char = '\u{1e}';
const LOG_FORMAT: &str = "--format=%H%x1f%an%x1f%B%x1e";

/// One commit as seen by the attempt ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub author_name: String,
    pub message: String,
}

/// Identity used for agent commits.
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub email: String,
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

    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// True if `reference` resolves to a commit.
    pub fn ref_exists(&self, reference: &str) -> Result<bool> {
        let spec = format!("{reference}^{{commit}}");
        let out = self.run(&["rev-parse", "--verify", "--quiet", &spec])?;
        Ok(out.succeeded())
    }

    /// First of `origin/<base>` or `<base>` that exists.
    pub fn resolve_base(&self, base: &str) -> Result<String> {
        for candidate in [format!("origin/{base}"), base.to_string()] {
            if self.ref_exists(&candidate)? {
                return Ok(candidate);
            }
        }
        Err(anyhow!("base branch '{base}' not found locally or on origin"))
    }

    /// Commits reachable from `head` but not from `base_ref`, newest first.
    #[instrument(skip_all, fields(base_ref, head))]
    pub fn commits_since(&self, base_ref: &str, head: &str) -> Result<Vec<CommitInfo>> {
        let range = format!("{base_ref}..{head}");
        let out = self.run_capture(&["log", LOG_FORMAT, &range])?;
        let commits = parse_log_records(&out);
        debug!(count = commits.len(), "read branch commits");
        Ok(commits)
    }

    /// `git log --oneline -<max>`, optionally restricted to one path.
    pub fn log_oneline(&self, max: usize, path: Option<&str>) -> Result<String> {
        let limit = format!("-{max}");
        let mut args = vec!["log", "--oneline", limit.as_str()];
        if let Some(path) = path {
            args.push("--");
            args.push(path);
        }
        self.run_capture(&args)
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let out = self.run(&[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ])?;
        Ok(out.succeeded())
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

    pub fn add_path(&self, path: &str) -> Result<()> {
        self.run_checked(&["add", "--", path])?;
        Ok(())
    }

    pub fn remove_path(&self, path: &str) -> Result<()> {
        self.run_checked(&["rm", "--quiet", "--ignore-unmatch", "--", path])?;
        Ok(())
    }

    /// Commit staged changes as `identity`, returning the new HEAD sha.
    ///
    /// Empty commits are allowed so every attempt leaves a marker in history.
    #[instrument(skip_all, fields(author = %identity.name))]
    pub fn commit_as(&self, identity: &Identity, message: &str) -> Result<String> {
        let name = format!("user.name={}", identity.name);
        let email = format!("user.email={}", identity.email);
        self.run_checked(&[
            "-c",
            &name,
            "-c",
            &email,
            "commit",
            "--allow-empty",
            "-m",
            message,
        ])?;
        self.head_sha()
    }

    #[instrument(skip_all, fields(branch))]
    pub fn push_branch(&self, branch: &str) -> Result<()> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        self.run_checked(&["push", "origin", &refspec])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(output.stdout_text())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if output.timed_out {
            warn!(args = %args.join(" "), "git timed out");
            return Err(anyhow!(
                "git {} timed out after {:?}",
                args.join(" "),
                self.timeout
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr_text()
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_command_with_timeout(cmd, None, self.timeout, OUTPUT_LIMIT_BYTES)
            .map_err(|e| e.context(format!("spawn git {}", args.join(" "))))
    }
}

fn parse_log_records(raw: &str) -> Vec<CommitInfo> {
    raw.split(RECORD_SEP)
        .filter_map(|record| {
            let record = record.trim_start_matches('\n');
            let mut fields = record.splitn(3, FIELD_SEP);
            let sha = fields.next()?.trim();
            let author_name = fields.next()?.trim();
            let message = fields.next().unwrap_or("").trim_end();
            if sha.is_empty() {
                return None;
            }
            Some(CommitInfo {
                sha: sha.to_string(),
                author_name: author_name.to_string(),
                message: message.to_string(),
            })
        })
        .collect()
}
