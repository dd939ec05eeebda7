//! Deterministic classification of build events into triage cases.

/// Workflow selected for a build event before any history is consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Case {
    /// Build passed on a branch the agent does not own.
    DoNothing,
    /// Build failed on a branch the agent does not own; a new session starts.
    FirstFailure,
    /// Build failed on an agent fix branch.
    FixFailure { fix_id: String },
    /// Build passed on an agent fix branch.
    FixSuccess { fix_id: String },
}

/// Decision for a failed build on a fix branch, after history is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixFailureRoute {
    /// Attempt budget exhausted; hand over to a human.
    Escalate { attempts_made: u32 },
    /// Someone other than the agent committed to the branch.
    StopHumanIntervention { next_attempt: u32 },
    /// Investigate again with the previous attempts as context.
    Retry { next_attempt: u32 },
}

/// Return the fix id if `branch` is `<prefix><id>` with a non-empty id.
pub fn fix_id_from_branch<'a>(branch: &'a str, prefix: &str) -> Option<&'a str> {
    branch
        .strip_prefix(prefix)
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

pub fn fix_branch_name(prefix: &str, fix_id: &str) -> String {
    format!("{prefix}{fix_id}")
}

/// Classify a build event.
///
/// - Non-fix branch: success is a no-op, failure starts a session.
/// - Fix branch: the fix id is the branch suffix.
pub fn classify_event(branch: &str, succeeded: bool, fix_prefix: &str) -> Case {
    match (fix_id_from_branch(branch, fix_prefix), succeeded) {
        (None, true) => Case::DoNothing,
        (None, false) => Case::FirstFailure,
        (Some(id), true) => Case::FixSuccess {
            fix_id: id.to_string(),
        },
        (Some(id), false) => Case::FixFailure {
            fix_id: id.to_string(),
        },
    }
}

/// Route a failed fix-branch build.
///
/// Escalation is checked before human intervention, so an exhausted session
/// escalates even when a human has also touched the branch.
pub fn route_fix_failure(
    current_attempt: u32,
    escalation_threshold: u32,
    human_commit_detected: bool,
) -> FixFailureRoute {
    let next_attempt = current_attempt.saturating_add(1);
    if next_attempt >= escalation_threshold {
        return FixFailureRoute::Escalate {
            attempts_made: current_attempt,
        };
    }
    if human_commit_detected {
        return FixFailureRoute::StopHumanIntervention { next_attempt };
    }
    FixFailureRoute::Retry { next_attempt }
}
