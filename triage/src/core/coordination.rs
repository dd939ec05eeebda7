//! Pure pieces of the cross-flavor coordination protocol.
//!
//! Records live in an external tracker as a title, a label set, a body, and
//! appended notes. State is written as `key: value` lines so any worker can
//! reconstruct a [`CoordinationRecord`] from what it reads back:
//!
//! ```text
//! commit: 3f9c2a71d0e4...
//! owner-flavor: linux-x64
//! state: analyzing
//! error-signature: 9a0c4e1f2b3d4c5e
//! ```
//!
//! Notes append `flavor: <name>`, `fix-branch: <branch>`, and `state: fixed`.

use crate::core::types::{CoordinationRecord, CoordinationState};

/// Characters of the commit SHA used as the coordination key.
pub const COMMIT_KEY_LEN: usize = 8;

/// Short, lowercase commit identity used in titles and labels.
pub fn commit_identity(commit_sha: &str) -> String {
    commit_sha
        .trim()
        .chars()
        .take(COMMIT_KEY_LEN)
        .collect::<String>()
        .to_ascii_lowercase()
}

pub fn record_label(commit_key: &str) -> String {
    format!("commit-{commit_key}")
}

pub fn record_title(commit_key: &str) -> String {
    format!("Build Coordination: {commit_key}")
}

/// Render the body written by the first mover.
pub fn render_record_body(
    commit_sha: &str,
    owner_flavor: &str,
    error_signature: Option<&str>,
    created_at: &str,
) -> String {
    let mut body = String::new();
    body.push_str("## Multi-Flavor Build Coordination\n\n");
    body.push_str(&format!("commit: {}\n", commit_sha.trim()));
    body.push_str(&format!("owner-flavor: {owner_flavor}\n"));
    body.push_str("state: analyzing\n");
    if let Some(signature) = error_signature {
        body.push_str(&format!("error-signature: {signature}\n"));
    }
    body.push_str(&format!("created: {created_at}\n\n"));
    body.push_str(&format!(
        "Other flavors of this commit defer to the fix from `{owner_flavor}`.\n"
    ));
    body
}

pub fn follower_note(flavor: &str, observed_at: &str) -> String {
    format!("flavor: {flavor}\nobserved: {observed_at}\n\nAlso failed on this commit; waiting for the owner's fix.\n")
}

pub fn fix_branch_note(branch: &str) -> String {
    format!("fix-branch: {branch}\n")
}

pub fn fixed_note(branch: &str, pr_url: Option<&str>) -> String {
    let mut note = format!("state: fixed\nfix-branch: {branch}\n");
    if let Some(url) = pr_url {
        note.push_str(&format!("pr: {url}\n"));
    }
    note
}

pub fn released_note(reason: &str) -> String {
    let reason = reason.lines().next().unwrap_or_default();
    format!("state: released\nreason: {reason}\n")
}

pub fn duplicate_note(canonical_id: u64) -> String {
    format!("Duplicate of #{canonical_id}\n")
}

/// Rebuild a record from a tracker body and its notes, in append order.
///
/// Returns `None` when the body carries no owner, which means it was not
/// written by this protocol.
pub fn parse_record<S: AsRef<str>>(body: &str, notes: &[S]) -> Option<CoordinationRecord> {
    let mut commit = None;
    let mut owner = None;
    let mut state = CoordinationState::Analyzing;
    let mut signature = None;
    let mut fix_branch = None;
    let mut observed = Vec::new();

    let texts = std::iter::once(body).chain(notes.iter().map(AsRef::as_ref));
    for line in texts.flat_map(str::lines) {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "commit" => commit = Some(value.to_string()),
            "owner-flavor" => owner = Some(value.to_string()),
            "error-signature" => signature = Some(value.to_string()),
            "fix-branch" => fix_branch = Some(value.to_string()),
            "flavor" => {
                if !observed.iter().any(|f| f == value) {
                    observed.push(value.to_string());
                }
            }
            "state" if value == "fixed" => state = CoordinationState::Fixed,
            "state" if value == "released" => state = CoordinationState::Released,
            _ => {}
        }
    }

    let owner_flavor = owner?;
    Some(CoordinationRecord {
        commit_identity: commit_identity(commit.as_deref().unwrap_or_default()),
        owner_flavor,
        state,
        observed_flavors: observed,
        error_signature: signature,
        fix_branch,
    })
}

/// Outcome of comparing our freshly created record against what is visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Ours is the lowest visible id (or nothing else is visible).
    Canonical,
    /// A lower id exists; ours is a duplicate of it.
    Duplicate { canonical_id: u64 },
}

/// Lowest id wins. Relies on the tracker assigning increasing ids.
pub fn reconcile(own_id: u64, visible_ids: &[u64]) -> Reconciliation {
    match visible_ids.iter().copied().filter(|id| *id < own_id).min() {
        Some(canonical_id) => Reconciliation::Duplicate { canonical_id },
        None => Reconciliation::Canonical,
    }
}
