//! Persistence of fixes: branches, commits, pushes, pull requests, escalations.
//!
//! The [`FixPublisher`] trait keeps the orchestrator free of `git`/`gh`
//! details. Tests use a recording publisher that captures every call.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use minijinja::{Environment, context};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::attempt_marker::render_attempt_message;
use crate::core::types::{AttemptRecord, FileAction, FileChange, FixProposal};
use crate::io::gh::Gh;
use crate::io::git::{Git, Identity};

const PULL_REQUEST_TEMPLATE: &str = include_str!("templates/pull_request.md");
const ESCALATION_TEMPLATE: &str = include_str!("templates/escalation.md");

/// Labels every escalation issue carries besides `escalation-<fix id>`.
pub const ESCALATION_EXTRA_LABELS: &[&str] = &["needs-human", "autonomous-agent"];

pub fn escalation_label(fix_id: &str) -> String {
    format!("escalation-{fix_id}")
}

pub fn attempts_label(fix_id: &str, attempts: u32) -> String {
    format!("fix-{fix_id}-attempts-{attempts}")
}

/// A proposal ready to be committed as one attempt.
#[derive(Debug, Clone)]
pub struct ApplyRequest<'a> {
    pub fix_id: &'a str,
    pub attempt: u32,
    pub branch: &'a str,
    /// Create the branch from the current HEAD (first failure) instead of
    /// committing onto the existing fix branch.
    pub create_branch: bool,
    pub engine_variant: &'a str,
    pub proposal: &'a FixProposal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedFix {
    pub branch: String,
    pub commit_sha: String,
}

#[derive(Debug, Clone)]
pub struct PullRequestRequest {
    pub branch: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EscalationRequest {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

pub trait FixPublisher {
    fn apply_fix(&self, request: &ApplyRequest<'_>) -> Result<AppliedFix>;

    /// Open a pull request; returns its URL.
    fn open_pull_request(&self, request: &PullRequestRequest) -> Result<String>;

    /// URL of an open escalation carrying `label`, if any.
    fn find_escalation(&self, label: &str) -> Result<Option<String>>;

    /// Open an escalation issue; returns its URL.
    fn open_escalation(&self, request: &EscalationRequest) -> Result<String>;
}

/// Publisher backed by the local checkout, `git push`, and `gh api`.
#[derive(Debug, Clone)]
pub struct GitHubPublisher {
    git: Git,
    gh: Gh,
    identity: Identity,
    base_branch: String,
}

#[derive(Deserialize)]
struct CreatedJson {
    number: u64,
    html_url: String,
}

impl GitHubPublisher {
    pub fn new(git: Git, gh: Gh, identity: Identity, base_branch: impl Into<String>) -> Self {
        Self {
            git,
            gh,
            identity,
            base_branch: base_branch.into(),
        }
    }

    fn apply_change(&self, change: &FileChange) -> Result<()> {
        let relative = contained_path(&change.path)?;
        let full = self.git.workdir().join(&relative);
        let rel = relative.to_string_lossy();
        match change.action {
            FileAction::Create | FileAction::Edit => {
                if let Some(parent) = full.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create directory {}", parent.display()))?;
                }
                fs::write(&full, &change.content)
                    .with_context(|| format!("write {}", full.display()))?;
                self.git.add_path(&rel)
            }
            FileAction::Delete => {
                if full.exists() {
                    fs::remove_file(&full)
                        .with_context(|| format!("delete {}", full.display()))?;
                }
                self.git.remove_path(&rel)
            }
        }
    }
}

impl FixPublisher for GitHubPublisher {
    #[instrument(skip_all, fields(branch = request.branch, attempt = request.attempt))]
    fn apply_fix(&self, request: &ApplyRequest<'_>) -> Result<AppliedFix> {
        if request.create_branch {
            if self.git.branch_exists(request.branch)? {
                self.git.checkout_branch(request.branch)?;
            } else {
                self.git.checkout_new_branch(request.branch)?;
            }
        } else {
            self.git.checkout_branch(request.branch)?;
        }

        for change in &request.proposal.file_changes {
            self.apply_change(change)
                .with_context(|| format!("apply change to {}", change.path))?;
        }

        let message = render_attempt_message(
            request.attempt,
            request.fix_id,
            request.engine_variant,
            request.proposal,
        );
        let commit_sha = self.git.commit_as(&self.identity, &message)?;
        self.git.push_branch(request.branch)?;
        info!(commit = %commit_sha, "pushed fix attempt");
        Ok(AppliedFix {
            branch: request.branch.to_string(),
            commit_sha,
        })
    }

    #[instrument(skip_all, fields(branch = %request.branch))]
    fn open_pull_request(&self, request: &PullRequestRequest) -> Result<String> {
        let endpoint = format!("repos/{}/pulls", self.gh.repo_path());
        let title = format!("title={}", request.title);
        let head = format!("head={}", request.branch);
        let base = format!("base={}", self.base_branch);
        let body = format!("body={}", request.body);
        let raw = self.gh.run(&[
            "api", "-X", "POST", &endpoint, "-f", &title, "-f", &head, "-f", &base, "-f", &body,
        ])?;
        let created: CreatedJson = serde_json::from_str(&raw).context("parse pull request")?;

        if !request.labels.is_empty() {
            let labels_endpoint = format!(
                "repos/{}/issues/{}/labels",
                self.gh.repo_path(),
                created.number
            );
            let fields: Vec<String> = request
                .labels
                .iter()
                .map(|l| format!("labels[]={l}"))
                .collect();
            let mut args = vec!["api", "-X", "POST", labels_endpoint.as_str()];
            for field in &fields {
                args.extend(["-f", field.as_str()]);
            }
            if let Err(err) = self.gh.run(&args) {
                warn!(err = %err, "failed to label pull request");
            }
        }
        debug!(url = %created.html_url, "opened pull request");
        Ok(created.html_url)
    }

    fn find_escalation(&self, label: &str) -> Result<Option<String>> {
        #[derive(Deserialize)]
        struct IssueUrl {
            html_url: String,
        }
        let endpoint = format!(
            "repos/{}/issues?state=open&labels={label}&per_page=1",
            self.gh.repo_path()
        );
        let issues: Vec<IssueUrl> = self.gh.run_json(&["api", &endpoint])?;
        Ok(issues.into_iter().next().map(|i| i.html_url))
    }

    #[instrument(skip_all)]
    fn open_escalation(&self, request: &EscalationRequest) -> Result<String> {
        let endpoint = format!("repos/{}/issues", self.gh.repo_path());
        let title = format!("title={}", request.title);
        let body = format!("body={}", request.body);
        let fields: Vec<String> = request
            .labels
            .iter()
            .map(|l| format!("labels[]={l}"))
            .collect();
        let mut args = vec![
            "api",
            "-X",
            "POST",
            endpoint.as_str(),
            "-f",
            title.as_str(),
            "-f",
            body.as_str(),
        ];
        for field in &fields {
            args.extend(["-f", field.as_str()]);
        }
        let raw = self.gh.run(&args)?;
        let created: CreatedJson = serde_json::from_str(&raw).context("parse escalation issue")?;
        Ok(created.html_url)
    }
}

/// Normalize a proposal path and refuse anything escaping the repository.
pub fn contained_path(path: &str) -> Result<PathBuf> {
    let candidate = Path::new(path.trim());
    let mut out = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("refusing path outside repository: {path}")
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(anyhow!("empty file change path"));
    }
    Ok(out)
}

/// Context shared by the pull-request and escalation bodies.
#[derive(Debug, Clone)]
pub struct SessionSummary<'a> {
    pub fix_id: &'a str,
    pub branch: &'a str,
    pub attempts: u32,
    pub original_error: &'a str,
    /// Attempts in ascending order.
    pub history: &'a [AttemptRecord],
    pub coordination_record: Option<u64>,
}

fn body_env() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template("pull_request", PULL_REQUEST_TEMPLATE)
        .context("load pull request template")?;
    env.add_template("escalation", ESCALATION_TEMPLATE)
        .context("load escalation template")?;
    Ok(env)
}

fn render_body(name: &str, summary: &SessionSummary<'_>) -> Result<String> {
    let env = body_env()?;
    let body = env.get_template(name)?.render(context! {
        fix_id => summary.fix_id,
        branch => summary.branch,
        attempts => summary.attempts,
        original_error => summary.original_error.trim(),
        history => summary.history,
        coordination_record => summary.coordination_record,
    })?;
    Ok(body)
}

pub fn render_pull_request_body(summary: &SessionSummary<'_>) -> Result<String> {
    render_body("pull_request", summary)
}

pub fn render_escalation_body(summary: &SessionSummary<'_>) -> Result<String> {
    render_body("escalation", summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> Vec<AttemptRecord> {
        vec![
            AttemptRecord {
                attempt_number: 1,
                commit_ref: "1111aaaa".to_string(),
                author_identity: "Autonomous Agent".to_string(),
                summary_text: "Autonomous Fix Attempt 1: pin cmake".to_string(),
                fix_applied: Some("pin cmake".to_string()),
                reasoning: None,
            },
            AttemptRecord {
                attempt_number: 2,
                commit_ref: "2222bbbb".to_string(),
                author_identity: "Autonomous Agent".to_string(),
                summary_text: "Autonomous Fix Attempt 2: add include".to_string(),
                fix_applied: None,
                reasoning: Some("uint8_t undeclared".to_string()),
            },
        ]
    }

    #[test]
    fn contained_path_rejects_escapes() {
        assert_eq!(
            contained_path("./base/include/frame.h").expect("path"),
            PathBuf::from("base/include/frame.h")
        );
        assert!(contained_path("../etc/passwd").is_err());
        assert!(contained_path("/etc/passwd").is_err());
        assert!(contained_path("  ").is_err());
    }

    #[test]
    fn pull_request_body_lists_attempts() {
        let history = history();
        let body = render_pull_request_body(&SessionSummary {
            fix_id: "42",
            branch: "autonomous-fix-42",
            attempts: 2,
            original_error: "missing <cstdint>",
            history: &history,
            coordination_record: Some(17),
        })
        .expect("render");
        assert!(body.contains("**Fix ID:** 42"));
        assert!(body.contains("- Attempt 1 (`1111aaaa`): pin cmake"));
        assert!(body.contains("- Attempt 2 (`2222bbbb`): Autonomous Fix Attempt 2: add include"));
        assert!(body.contains("Coordinated via #17."));
    }

    #[test]
    fn escalation_body_includes_reasoning() {
        let history = history();
        let body = render_escalation_body(&SessionSummary {
            fix_id: "42",
            branch: "autonomous-fix-42",
            attempts: 6,
            original_error: "missing <cstdint>",
            history: &history,
            coordination_record: None,
        })
        .expect("render");
        assert!(body.contains("**6 times**"));
        assert!(body.contains("Reasoning: uint8_t undeclared"));
        assert!(body.contains("#### Attempt 2 (`2222bbbb`)"));
    }

    #[test]
    fn labels_follow_naming_scheme() {
        assert_eq!(escalation_label("42"), "escalation-42");
        assert_eq!(attempts_label("42", 3), "fix-42-attempts-3");
    }
}
