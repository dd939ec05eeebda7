//! Shared deterministic types for triage core logic.
//!
//! These types define stable contracts between the orchestrator, the
//! investigation loop, and the coordination gate. They carry no I/O and
//! serialize with stable `snake_case` names so CI glue can consume them.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Outcome of the CI build that triggered this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Success,
    Failure,
}

/// Immutable input to a single triage run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEvent {
    pub branch_name: String,
    pub build_status: BuildStatus,
    /// Path to the captured build log, when the build failed.
    pub failure_log: Option<PathBuf>,
    /// Build variant name (e.g. `linux-x64`), used by the coordination gate.
    pub flavor: Option<String>,
    /// Commit under test, used for coordination identity and remote evidence.
    pub commit_sha: Option<String>,
}

/// One automated fix lifecycle, rebuilt from commit history every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixSession {
    pub fix_id: String,
    pub current_attempt: u32,
    pub branch_name: String,
}

/// A past attempt reconstructed from a commit on the fix branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub commit_ref: String,
    pub author_identity: String,
    pub summary_text: String,
    /// `Fix Applied` section of the attempt commit, if present.
    pub fix_applied: Option<String>,
    /// `Reasoning` section of the attempt commit, if present.
    pub reasoning: Option<String>,
}

/// Kind of context the reasoning engine may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    /// File under the repository root.
    File,
    /// Raw file content fetched from the remote at the build commit.
    RemoteFile,
    /// `git log` for the whole repository (`all`) or a single path.
    CommitHistory,
}

impl EvidenceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceKind::File => "file",
            EvidenceKind::RemoteFile => "remote_file",
            EvidenceKind::CommitHistory => "commit_history",
        }
    }
}

/// Typed ask for more context issued mid-investigation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRequest {
    pub kind: EvidenceKind,
    pub target: String,
    #[serde(default)]
    pub reason: String,
}

impl EvidenceRequest {
    /// Conservative request used when the engine gave nothing usable.
    pub fn generic(reason: &str) -> Self {
        Self {
            kind: EvidenceKind::CommitHistory,
            target: "all".to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStatus {
    Success,
    NotFound,
    TooLarge,
    Error,
}

impl EvidenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceStatus::Success => "success",
            EvidenceStatus::NotFound => "not_found",
            EvidenceStatus::TooLarge => "too_large",
            EvidenceStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceMetadata {
    pub size_bytes: u64,
    pub lines: usize,
}

/// Fulfilled evidence request. Failures are carried in `status`/`content`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceResult {
    pub kind: EvidenceKind,
    pub target: String,
    pub reason: String,
    pub status: EvidenceStatus,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EvidenceMetadata>,
}

impl EvidenceResult {
    pub fn for_request(
        request: &EvidenceRequest,
        status: EvidenceStatus,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind: request.kind,
            target: request.target.clone(),
            reason: request.reason.clone(),
            status,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: EvidenceMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Create,
    Edit,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub action: FileAction,
    #[serde(default)]
    pub content: String,
}

/// Final product of an investigation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixProposal {
    pub confidence: f64,
    pub root_cause: String,
    pub reasoning: String,
    /// One-line summary used for commit titles and PR text.
    pub description: String,
    pub file_changes: Vec<FileChange>,
}

/// Interpreted reply of one reasoning-engine turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnResult {
    RequestMore { requests: Vec<EvidenceRequest> },
    ProposeFix(FixProposal),
}

/// One completed turn of an investigation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvestigationTurn {
    pub turn_index: u32,
    pub reasoning_output: String,
    pub evidence_gathered: Vec<EvidenceResult>,
}

/// Classified excerpt of a failed build log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureExcerpt {
    pub excerpt: String,
    pub error_type: String,
    /// `error_context`, `end_of_log`, or `error` when the log was unreadable.
    pub context_type: String,
    /// Human-readable location, e.g. `lines 120-620 of 900`.
    pub location: String,
    pub total_lines: usize,
}

/// Terminal result reported by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTaken {
    DoNothing,
    FirstFailure,
    CoordinationSkip,
    Retry,
    PrCreated,
    Escalated,
    AlreadyEscalated,
    StoppedHumanIntervention,
    Error,
}

impl ActionTaken {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionTaken::DoNothing => "do_nothing",
            ActionTaken::FirstFailure => "first_failure",
            ActionTaken::CoordinationSkip => "coordination_skip",
            ActionTaken::Retry => "retry",
            ActionTaken::PrCreated => "pr_created",
            ActionTaken::Escalated => "escalated",
            ActionTaken::AlreadyEscalated => "already_escalated",
            ActionTaken::StoppedHumanIntervention => "stopped_human_intervention",
            ActionTaken::Error => "error",
        }
    }
}

/// Structured outcome of one run. Exactly one is produced per build event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub success: bool,
    pub action_taken: ActionTaken,
    pub attempt: u32,
    pub engine_variant: String,
    pub confidence: f64,
    pub turns_used: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordination_record: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Engine variant label for outcomes that never called the engine.
pub const NO_ENGINE: &str = "none";

impl RunOutcome {
    /// Outcome with no engine involvement and zero confidence.
    pub fn bare(success: bool, action_taken: ActionTaken, attempt: u32) -> Self {
        Self {
            success,
            action_taken,
            attempt,
            engine_variant: NO_ENGINE.to_string(),
            confidence: 0.0,
            turns_used: 0,
            fix_description: None,
            pr_url: None,
            branch_name: None,
            coordination_record: None,
            error_message: None,
        }
    }

    pub fn error(attempt: u32, message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::bare(false, ActionTaken::Error, attempt)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationState {
    Analyzing,
    Fixed,
    /// The owner gave up without producing a fix branch.
    Released,
}

/// Shared record keyed by commit identity, hosted by the external tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationRecord {
    pub commit_identity: String,
    pub owner_flavor: String,
    pub state: CoordinationState,
    pub observed_flavors: Vec<String>,
    pub error_signature: Option<String>,
    pub fix_branch: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_action_in_snake_case() {
        let outcome = RunOutcome::bare(true, ActionTaken::StoppedHumanIntervention, 3);
        let json = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(json["action_taken"], "stopped_human_intervention");
        assert_eq!(json["engine_variant"], "none");
        assert!(json.get("error_message").is_none());
    }

    #[test]
    fn evidence_request_reason_defaults_to_empty() {
        let req: EvidenceRequest =
            serde_json::from_str(r#"{"kind":"remote_file","target":"CMakeLists.txt"}"#)
                .expect("parse");
        assert_eq!(req.kind, EvidenceKind::RemoteFile);
        assert!(req.reason.is_empty());
    }

    #[test]
    fn action_as_str_matches_serde_name() {
        for action in [
            ActionTaken::DoNothing,
            ActionTaken::CoordinationSkip,
            ActionTaken::AlreadyEscalated,
            ActionTaken::Error,
        ] {
            let json = serde_json::to_value(action).expect("serialize");
            assert_eq!(json, action.as_str());
        }
    }
}
