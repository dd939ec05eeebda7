//! External tracker hosting coordination records.
//!
//! The tracker offers no compare-and-swap: two workers may both create a
//! record for the same commit. Callers reconcile duplicates by id.

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::io::gh::{Gh, GhError};

/// A record as read back from the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerRecord {
    /// Tracker-assigned id; assumed to increase with creation order.
    pub id: u64,
    pub title: String,
    pub body: String,
    /// Appended notes, oldest first.
    pub notes: Vec<String>,
    pub url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error(transparent)]
    Gh(#[from] GhError),
    #[error("unexpected tracker response: {0}")]
    Protocol(String),
    #[error("tracker unavailable: {0}")]
    Unavailable(String),
}

pub trait Tracker {
    /// Create a record carrying every label in `labels`.
    fn create_record(
        &self,
        labels: &[String],
        title: &str,
        body: &str,
    ) -> Result<TrackerRecord, TrackerError>;

    /// Open records carrying `label`, with their notes.
    fn find_open(&self, label: &str) -> Result<Vec<TrackerRecord>, TrackerError>;

    fn append_note(&self, id: u64, body: &str) -> Result<(), TrackerError>;

    fn close(&self, id: u64) -> Result<(), TrackerError>;
}

/// Tracker backed by repository issues through `gh api`.
#[derive(Debug, Clone)]
pub struct GhTracker {
    gh: Gh,
}

#[derive(Debug, Deserialize)]
struct IssueJson {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
    /// Present when the issue is actually a pull request.
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct CommentJson {
    #[serde(default)]
    body: Option<String>,
}

impl GhTracker {
    pub fn new(gh: Gh) -> Self {
        Self { gh }
    }

    fn issues_path(&self) -> String {
        format!("repos/{}/issues", self.gh.repo_path())
    }

    fn comments(&self, id: u64) -> Result<Vec<String>, TrackerError> {
        let endpoint = format!("{}/{id}/comments?per_page=100", self.issues_path());
        let raw = self.gh.run(&["api", &endpoint])?;
        let comments: Vec<CommentJson> = decode(&raw)?;
        Ok(comments.into_iter().filter_map(|c| c.body).collect())
    }
}

impl Tracker for GhTracker {
    #[instrument(skip_all, fields(title))]
    fn create_record(
        &self,
        labels: &[String],
        title: &str,
        body: &str,
    ) -> Result<TrackerRecord, TrackerError> {
        let endpoint = self.issues_path();
        let title_field = format!("title={title}");
        let body_field = format!("body={body}");
        let label_fields: Vec<String> = labels.iter().map(|l| format!("labels[]={l}")).collect();

        let mut args = vec!["api", "-X", "POST", endpoint.as_str()];
        args.extend(["-f", title_field.as_str(), "-f", body_field.as_str()]);
        for field in &label_fields {
            args.extend(["-f", field.as_str()]);
        }
        let raw = self.gh.run(&args)?;
        let issue: IssueJson = decode(&raw)?;
        debug!(id = issue.number, "created tracker record");
        Ok(TrackerRecord {
            id: issue.number,
            title: issue.title,
            body: issue.body.unwrap_or_default(),
            notes: Vec::new(),
            url: issue.html_url,
        })
    }

    #[instrument(skip_all, fields(label))]
    fn find_open(&self, label: &str) -> Result<Vec<TrackerRecord>, TrackerError> {
        let endpoint = format!(
            "{}?state=open&labels={label}&per_page=100",
            self.issues_path()
        );
        let raw = self.gh.run(&["api", &endpoint])?;
        let issues: Vec<IssueJson> = decode(&raw)?;
        let mut records = Vec::new();
        for issue in issues.into_iter().filter(|i| i.pull_request.is_none()) {
            let notes = self.comments(issue.number)?;
            records.push(TrackerRecord {
                id: issue.number,
                title: issue.title,
                body: issue.body.unwrap_or_default(),
                notes,
                url: issue.html_url,
            });
        }
        debug!(count = records.len(), "found open tracker records");
        Ok(records)
    }

    fn append_note(&self, id: u64, body: &str) -> Result<(), TrackerError> {
        let endpoint = format!("{}/{id}/comments", self.issues_path());
        let body_field = format!("body={body}");
        self.gh
            .run(&["api", "-X", "POST", &endpoint, "-f", &body_field])?;
        Ok(())
    }

    fn close(&self, id: u64) -> Result<(), TrackerError> {
        let endpoint = format!("{}/{id}", self.issues_path());
        self.gh
            .run(&["api", "-X", "PATCH", &endpoint, "-f", "state=closed"])?;
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, TrackerError> {
    serde_json::from_str(raw).map_err(|e| TrackerError::Protocol(e.to_string()))
}
