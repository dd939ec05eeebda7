//! Deterministic doubles for the external collaborators.
//!
//! Every double records what it was asked so tests can assert on calls
//! without spawning `git`, `gh`, or a reasoning command.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow, bail};

use crate::core::coordination::{commit_identity, record_label, record_title, render_record_body};
use crate::core::types::{
    EvidenceKind, EvidenceMetadata, EvidenceRequest, EvidenceResult, EvidenceStatus,
    FailureExcerpt,
};
use crate::io::evidence::EvidenceBroker;
use crate::io::git::CommitInfo;
use crate::io::publisher::{
    AppliedFix, ApplyRequest, EscalationRequest, FixPublisher, PullRequestRequest,
};
use crate::io::reasoning::{EngineReply, ReasoningEngine, ReasoningError, TurnRequest};
use crate::io::tracker::{Tracker, TrackerError, TrackerRecord};
use crate::ledger::CommitSource;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A compile error excerpt as the log extractor would produce it.
pub fn failure_excerpt() -> FailureExcerpt {
    FailureExcerpt {
        excerpt: "base/include/frame.h:12:5: error: 'uint8_t' does not name a type".to_string(),
        error_type: "compilation_error".to_string(),
        context_type: "error_context".to_string(),
        location: "lines 0-1 of 1".to_string(),
        total_lines: 1,
    }
}

/// Reasoning engine that replays a fixed script, one entry per call.
///
/// Calls past the end of the script fail with [`ReasoningError::EmptyReply`].
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    script: Mutex<VecDeque<Result<EngineReply, ReasoningError>>>,
    requests: Mutex<Vec<TurnRequest>>,
}

impl ScriptedEngine {
    pub fn new(script: Vec<Result<EngineReply, ReasoningError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Script of successful replies costing 100 tokens each.
    pub fn replies<'a, I>(replies: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        Self::new(
            replies
                .into_iter()
                .map(|text| {
                    Ok(EngineReply {
                        text: text.to_string(),
                        tokens: 100,
                    })
                })
                .collect(),
        )
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.requests)
            .iter()
            .map(|r| r.prompt.clone())
            .collect()
    }

    pub fn variants(&self) -> Vec<String> {
        lock(&self.requests)
            .iter()
            .map(|r| r.variant.clone())
            .collect()
    }
}

impl ReasoningEngine for ScriptedEngine {
    fn propose(&self, request: &TurnRequest) -> Result<EngineReply, ReasoningError> {
        lock(&self.requests).push(request.clone());
        lock(&self.script)
            .pop_front()
            .unwrap_or(Err(ReasoningError::EmptyReply))
    }
}

/// Evidence broker serving files from a map; everything else is `not_found`.
#[derive(Debug, Default)]
pub struct StaticEvidence {
    files: HashMap<String, String>,
    requests: Mutex<Vec<EvidenceRequest>>,
}

impl StaticEvidence {
    pub fn with_file(path: &str, content: &str) -> Self {
        let mut files = HashMap::new();
        files.insert(path.to_string(), content.to_string());
        Self {
            files,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn and_file(mut self, path: &str, content: &str) -> Self {
        self.files.insert(path.to_string(), content.to_string());
        self
    }

    pub fn requests(&self) -> Vec<EvidenceRequest> {
        lock(&self.requests).clone()
    }
}

impl EvidenceBroker for StaticEvidence {
    fn fetch(&self, requests: &[EvidenceRequest]) -> Vec<EvidenceResult> {
        lock(&self.requests).extend(requests.iter().cloned());
        requests
            .iter()
            .map(|request| match self.files.get(&request.target) {
                Some(content) if request.kind != EvidenceKind::CommitHistory => {
                    EvidenceResult::for_request(request, EvidenceStatus::Success, content.clone())
                        .with_metadata(EvidenceMetadata {
                            size_bytes: content.len() as u64,
                            lines: content.lines().count(),
                        })
                }
                _ => EvidenceResult::for_request(
                    request,
                    EvidenceStatus::NotFound,
                    format!("Not found: {}", request.target),
                ),
            })
            .collect()
    }
}

/// A record as stored by [`InMemoryTracker`].
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub record: TrackerRecord,
    pub labels: Vec<String>,
    pub open: bool,
    /// Lookup count after which the record shows up in `find_open`.
    visible_at: u64,
    /// Hidden until some other record is created.
    hidden_until_create: bool,
}

#[derive(Debug, Default)]
struct TrackerState {
    records: Vec<StoredRecord>,
    next_id: u64,
    lookups: u64,
}

/// Shared in-memory tracker. Clones share state, so several workers (or
/// threads) can race against the same records.
///
/// `visibility_lag` models eventual consistency: a new record only shows up
/// in lookups once that many further lookups have happened.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTracker {
    state: Arc<Mutex<TrackerState>>,
    visibility_lag: u64,
    offline: bool,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_visibility_lag(lag: u64) -> Self {
        Self {
            visibility_lag: lag,
            ..Self::default()
        }
    }

    /// Tracker whose every call fails.
    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }

    /// Insert a record for `commit_sha` that lookups miss until another
    /// record is created, as if a concurrent worker created it just now.
    pub fn insert_hidden_until_created(&self, commit_sha: &str, owner_flavor: &str) -> u64 {
        let key = commit_identity(commit_sha);
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        state.records.push(StoredRecord {
            record: TrackerRecord {
                id,
                title: record_title(&key),
                body: render_record_body(commit_sha, owner_flavor, None, "2026-01-01T00:00:00Z"),
                notes: Vec::new(),
                url: None,
            },
            labels: vec!["autonomous-coordination".to_string(), record_label(&key)],
            open: true,
            visible_at: 0,
            hidden_until_create: true,
        });
        id
    }

    pub fn records(&self) -> Vec<StoredRecord> {
        lock(&self.state).records.clone()
    }

    fn check_online(&self) -> Result<(), TrackerError> {
        if self.offline {
            return Err(TrackerError::Unavailable("tracker offline".to_string()));
        }
        Ok(())
    }
}

impl Tracker for InMemoryTracker {
    fn create_record(
        &self,
        labels: &[String],
        title: &str,
        body: &str,
    ) -> Result<TrackerRecord, TrackerError> {
        self.check_online()?;
        let mut state = lock(&self.state);
        for stored in &mut state.records {
            stored.hidden_until_create = false;
        }
        state.next_id += 1;
        let record = TrackerRecord {
            id: state.next_id,
            title: title.to_string(),
            body: body.to_string(),
            notes: Vec::new(),
            url: Some(format!("https://tracker.test/issues/{}", state.next_id)),
        };
        let visible_at = state.lookups + self.visibility_lag;
        state.records.push(StoredRecord {
            record: record.clone(),
            labels: labels.to_vec(),
            open: true,
            visible_at,
            hidden_until_create: false,
        });
        Ok(record)
    }

    fn find_open(&self, label: &str) -> Result<Vec<TrackerRecord>, TrackerError> {
        self.check_online()?;
        let mut state = lock(&self.state);
        state.lookups += 1;
        let lookups = state.lookups;
        Ok(state
            .records
            .iter()
            .filter(|s| s.open && !s.hidden_until_create && lookups > s.visible_at)
            .filter(|s| s.labels.iter().any(|l| l == label))
            .map(|s| s.record.clone())
            .collect())
    }

    fn append_note(&self, id: u64, body: &str) -> Result<(), TrackerError> {
        self.check_online()?;
        let mut state = lock(&self.state);
        let stored = state
            .records
            .iter_mut()
            .find(|s| s.record.id == id)
            .ok_or_else(|| TrackerError::Protocol(format!("no record {id}")))?;
        stored.record.notes.push(body.to_string());
        Ok(())
    }

    fn close(&self, id: u64) -> Result<(), TrackerError> {
        self.check_online()?;
        let mut state = lock(&self.state);
        let stored = state
            .records
            .iter_mut()
            .find(|s| s.record.id == id)
            .ok_or_else(|| TrackerError::Protocol(format!("no record {id}")))?;
        stored.open = false;
        Ok(())
    }
}

/// Commit history held in memory, newest first.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    commits: Mutex<Vec<CommitInfo>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a commit on top of the branch.
    pub fn commit(&self, author: &str, message: &str) {
        let mut commits = lock(&self.commits);
        let sha = format!("{:040x}", commits.len() + 1);
        commits.insert(
            0,
            CommitInfo {
                sha,
                author_name: author.to_string(),
                message: message.to_string(),
            },
        );
    }

    /// Branch carrying `attempts` agent attempt commits.
    pub fn with_attempts(author: &str, attempts: u32) -> Self {
        let history = Self::new();
        for n in 1..=attempts {
            history.commit(
                author,
                &format!(
                    "Autonomous Fix Attempt {n}: fix {n}\n\n**Root Cause Analysis:**\nroot cause {n}\n\n**Fix Applied:**\nfix {n}"
                ),
            );
        }
        history
    }
}

impl CommitSource for InMemoryHistory {
    fn commits_since_base(&self, _base_branch: &str) -> Result<Vec<CommitInfo>> {
        Ok(lock(&self.commits).clone())
    }
}

/// Publisher that records every call and can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    applied: Mutex<Vec<AppliedCall>>,
    pull_requests: Mutex<Vec<PullRequestRequest>>,
    escalations: Mutex<Vec<EscalationRequest>>,
    /// Labels with an open escalation.
    existing_escalations: Mutex<HashMap<String, String>>,
    fail_apply: bool,
}

/// What [`RecordingPublisher::apply_fix`] was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedCall {
    pub fix_id: String,
    pub attempt: u32,
    pub branch: String,
    pub create_branch: bool,
    pub engine_variant: String,
    pub description: String,
    pub file_changes: usize,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_apply() -> Self {
        Self {
            fail_apply: true,
            ..Self::default()
        }
    }

    pub fn with_escalation(label: &str, url: &str) -> Self {
        let publisher = Self::default();
        lock(&publisher.existing_escalations).insert(label.to_string(), url.to_string());
        publisher
    }

    pub fn applied(&self) -> Vec<AppliedCall> {
        lock(&self.applied).clone()
    }

    pub fn pull_requests(&self) -> Vec<PullRequestRequest> {
        lock(&self.pull_requests).clone()
    }

    pub fn escalations(&self) -> Vec<EscalationRequest> {
        lock(&self.escalations).clone()
    }
}

impl FixPublisher for RecordingPublisher {
    fn apply_fix(&self, request: &ApplyRequest<'_>) -> Result<AppliedFix> {
        if self.fail_apply {
            bail!("push rejected: remote branch moved");
        }
        let mut applied = lock(&self.applied);
        applied.push(AppliedCall {
            fix_id: request.fix_id.to_string(),
            attempt: request.attempt,
            branch: request.branch.to_string(),
            create_branch: request.create_branch,
            engine_variant: request.engine_variant.to_string(),
            description: request.proposal.description.clone(),
            file_changes: request.proposal.file_changes.len(),
        });
        Ok(AppliedFix {
            branch: request.branch.to_string(),
            commit_sha: format!("{:040x}", applied.len()),
        })
    }

    fn open_pull_request(&self, request: &PullRequestRequest) -> Result<String> {
        let mut prs = lock(&self.pull_requests);
        prs.push(request.clone());
        Ok(format!("https://forge.test/pull/{}", prs.len()))
    }

    fn find_escalation(&self, label: &str) -> Result<Option<String>> {
        Ok(lock(&self.existing_escalations).get(label).cloned())
    }

    fn open_escalation(&self, request: &EscalationRequest) -> Result<String> {
        let mut escalations = lock(&self.escalations);
        escalations.push(request.clone());
        let url = format!("https://forge.test/issues/{}", escalations.len());
        let label = request
            .labels
            .first()
            .ok_or_else(|| anyhow!("escalation without labels"))?;
        lock(&self.existing_escalations).insert(label.clone(), url.clone());
        Ok(url)
    }
}
