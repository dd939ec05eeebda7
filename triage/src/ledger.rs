//! Attempt history of a fix session, reconstructed from commit metadata.
//!
//! Nothing is persisted between runs: every invocation re-reads the commits
//! on the fix branch since the base branch and derives the attempt count,
//! previous-attempt summaries, and whether a human has touched the branch.

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::core::attempt_marker::{extract_section, parse_attempt_number};
use crate::core::types::{AttemptRecord, FixSession};
use crate::io::git::{CommitInfo, Git};

/// Source of branch commits, newest first.
pub trait CommitSource {
    fn commits_since_base(&self, base_branch: &str) -> Result<Vec<CommitInfo>>;
}

/// The checked-out branch.
impl CommitSource for Git {
    fn commits_since_base(&self, base_branch: &str) -> Result<Vec<CommitInfo>> {
        let base = self.resolve_base(base_branch)?;
        self.commits_since(&base, "HEAD")
    }
}

/// A named branch, checked out or not.
pub struct BranchHistory<'a> {
    pub git: &'a Git,
    pub branch: &'a str,
}

impl CommitSource for BranchHistory<'_> {
    fn commits_since_base(&self, base_branch: &str) -> Result<Vec<CommitInfo>> {
        let base = self.git.resolve_base(base_branch)?;
        let head = if self.git.branch_exists(self.branch)? {
            self.branch.to_string()
        } else {
            format!("origin/{}", self.branch)
        };
        self.git.commits_since(&base, &head)
    }
}

/// What the branch history says about the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    /// Highest attempt marker on the branch; 0 when none.
    pub current_attempt: u32,
    /// Attempt commits in ascending attempt order.
    pub attempts: Vec<AttemptRecord>,
    /// Any commit authored by someone other than the agent.
    pub human_touched: bool,
    /// Root cause recorded by the first attempt, if any.
    pub original_error: Option<String>,
}

impl LedgerSnapshot {
    pub fn session(&self, fix_id: &str, branch_name: &str) -> FixSession {
        FixSession {
            fix_id: fix_id.to_string(),
            current_attempt: self.current_attempt,
            branch_name: branch_name.to_string(),
        }
    }
}

pub struct AttemptLedger<'a, S: CommitSource> {
    source: &'a S,
    agent_name: &'a str,
    base_branch: &'a str,
}

impl<'a, S: CommitSource> AttemptLedger<'a, S> {
    pub fn new(source: &'a S, agent_name: &'a str, base_branch: &'a str) -> Self {
        Self {
            source,
            agent_name,
            base_branch,
        }
    }

    #[instrument(skip_all, fields(base = self.base_branch))]
    pub fn read(&self) -> Result<LedgerSnapshot> {
        let commits = self.source.commits_since_base(self.base_branch)?;
        let snapshot = snapshot_from_commits(&commits, self.agent_name);
        debug!(
            commits = commits.len(),
            current_attempt = snapshot.current_attempt,
            human_touched = snapshot.human_touched,
            "read attempt ledger"
        );
        Ok(snapshot)
    }
}

/// Derive the snapshot from commits listed newest first.
pub fn snapshot_from_commits(commits: &[CommitInfo], agent_name: &str) -> LedgerSnapshot {
    let human_touched = commits
        .iter()
        .any(|c| c.author_name.trim() != agent_name.trim());

    // Oldest first, so the stable sort keeps chronological order on ties.
    let mut marked: Vec<(&CommitInfo, u32)> = commits
        .iter()
        .rev()
        .filter_map(|c| parse_attempt_number(&c.message).map(|n| (c, n)))
        .collect();
    marked.sort_by_key(|(_, n)| *n);

    let original_error = marked.first().map(|(commit, _)| {
        extract_section(&commit.message, "Root Cause Analysis")
            .unwrap_or_else(|| first_line(&commit.message).to_string())
    });

    let attempts: Vec<AttemptRecord> = marked
        .iter()
        .map(|(commit, n)| AttemptRecord {
            attempt_number: *n,
            commit_ref: commit.sha.clone(),
            author_identity: commit.author_name.clone(),
            summary_text: first_line(&commit.message).to_string(),
            fix_applied: extract_section(&commit.message, "Fix Applied"),
            reasoning: extract_section(&commit.message, "Reasoning"),
        })
        .collect();

    LedgerSnapshot {
        current_attempt: attempts.last().map_or(0, |a| a.attempt_number),
        attempts,
        human_touched,
        original_error,
    }
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or("").trim()
}
