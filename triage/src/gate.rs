//! Cross-flavor coordination: one analyzer per failing commit.
//!
//! Several build flavors of the same commit usually fail together. The first
//! worker to find no coordination record creates one and analyzes; the rest
//! see the record and skip. The tracker has no compare-and-swap, so two
//! workers may both create a record. After a short delay each creator
//! re-reads, and the lowest id wins; the loser closes its record as a
//! duplicate. Tracker failures never block a build: the gate fails open.

use std::thread;

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::coordination::{
    Reconciliation, commit_identity, duplicate_note, fix_branch_note, fixed_note, follower_note,
    parse_record, reconcile, record_label, record_title, released_note, render_record_body,
};
use crate::io::config::CoordinationConfig;
use crate::io::tracker::{Tracker, TrackerError, TrackerRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    FirstMover,
    AnotherWorkerAnalyzing,
    LostRace,
    TrackerUnavailable,
    Disabled,
}

impl GateReason {
    pub fn as_str(self) -> &'static str {
        match self {
            GateReason::FirstMover => "first_mover",
            GateReason::AnotherWorkerAnalyzing => "another_worker_analyzing",
            GateReason::LostRace => "lost_race",
            GateReason::TrackerUnavailable => "tracker_unavailable",
            GateReason::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub should_analyze: bool,
    pub reason: GateReason,
    /// Canonical record for this commit, when one is known.
    pub record_id: Option<u64>,
    pub owner_flavor: Option<String>,
    /// Fix branch announced by the owner, if it has pushed one.
    pub wait_for_branch: Option<String>,
}

impl GateDecision {
    fn proceed(reason: GateReason, record_id: Option<u64>) -> Self {
        Self {
            should_analyze: true,
            reason,
            record_id,
            owner_flavor: None,
            wait_for_branch: None,
        }
    }

    fn defer(reason: GateReason, canonical: &TrackerRecord) -> Self {
        let parsed = parse_record(&canonical.body, &canonical.notes);
        Self {
            should_analyze: false,
            reason,
            record_id: Some(canonical.id),
            owner_flavor: parsed.as_ref().map(|r| r.owner_flavor.clone()),
            wait_for_branch: parsed.and_then(|r| r.fix_branch),
        }
    }
}

pub struct CoordinationGate<'a, T: Tracker> {
    tracker: &'a T,
    config: &'a CoordinationConfig,
}

impl<'a, T: Tracker> CoordinationGate<'a, T> {
    pub fn new(tracker: &'a T, config: &'a CoordinationConfig) -> Self {
        Self { tracker, config }
    }

    /// Decide whether this worker should pay for the analysis.
    #[instrument(skip_all, fields(commit = commit_sha, flavor = flavor))]
    pub fn should_analyze(
        &self,
        commit_sha: Option<&str>,
        flavor: Option<&str>,
        error_signature: Option<&str>,
    ) -> GateDecision {
        let (Some(sha), Some(flavor)) = (non_empty(commit_sha), non_empty(flavor)) else {
            debug!("coordination skipped: no commit or flavor");
            return GateDecision::proceed(GateReason::Disabled, None);
        };
        if !self.config.enabled {
            return GateDecision::proceed(GateReason::Disabled, None);
        }

        match self.elect(sha, flavor, error_signature) {
            Ok(decision) => {
                info!(
                    reason = decision.reason.as_str(),
                    record = ?decision.record_id,
                    "coordination decision"
                );
                decision
            }
            Err(err) => {
                warn!(err = %err, "coordination tracker unavailable; analyzing anyway");
                GateDecision::proceed(GateReason::TrackerUnavailable, None)
            }
        }
    }

    fn elect(
        &self,
        sha: &str,
        flavor: &str,
        error_signature: Option<&str>,
    ) -> Result<GateDecision, TrackerError> {
        let key = commit_identity(sha);

        let existing = self.find_with_retry(&key)?;
        if let Some(canonical) = existing.iter().min_by_key(|r| r.id) {
            info!(record = canonical.id, url = ?canonical.url, "following coordination record");
            let note = follower_note(flavor, &now());
            if let Err(err) = self.tracker.append_note(canonical.id, &note) {
                warn!(record = canonical.id, err = %err, "failed to record follower flavor");
            }
            return Ok(GateDecision::defer(
                GateReason::AnotherWorkerAnalyzing,
                canonical,
            ));
        }

        let labels = vec![self.config.label.clone(), record_label(&key)];
        let body = render_record_body(sha, flavor, error_signature, &now());
        let own = self
            .tracker
            .create_record(&labels, &record_title(&key), &body)?;
        debug!(record = own.id, url = ?own.url, "created coordination record");

        thread::sleep(self.config.race_check_delay());
        let visible = match self.find_matching(&key) {
            Ok(records) => records,
            Err(err) => {
                warn!(err = %err, "race re-check failed; keeping our record");
                return Ok(GateDecision::proceed(GateReason::FirstMover, Some(own.id)));
            }
        };
        let ids: Vec<u64> = visible.iter().map(|r| r.id).collect();
        match reconcile(own.id, &ids) {
            Reconciliation::Canonical => {
                Ok(GateDecision::proceed(GateReason::FirstMover, Some(own.id)))
            }
            Reconciliation::Duplicate { canonical_id } => {
                info!(own = own.id, canonical = canonical_id, "lost coordination race");
                self.close_duplicate(own.id, canonical_id);
                let canonical = visible
                    .iter()
                    .find(|r| r.id == canonical_id)
                    .cloned()
                    .unwrap_or(TrackerRecord {
                        id: canonical_id,
                        title: String::new(),
                        body: String::new(),
                        notes: Vec::new(),
                        url: None,
                    });
                Ok(GateDecision::defer(GateReason::LostRace, &canonical))
            }
        }
    }

    /// Look up records for `key`, retrying to ride out eventual consistency.
    fn find_with_retry(&self, key: &str) -> Result<Vec<TrackerRecord>, TrackerError> {
        let attempts = self.config.lookup_attempts.max(1);
        for attempt in 0..attempts {
            let records = self.find_matching(key)?;
            if !records.is_empty() {
                debug!(attempt = attempt + 1, count = records.len(), "found coordination record");
                return Ok(records);
            }
            if attempt + 1 < attempts {
                thread::sleep(self.config.lookup_backoff() * (attempt + 1));
            }
        }
        Ok(Vec::new())
    }

    fn find_matching(&self, key: &str) -> Result<Vec<TrackerRecord>, TrackerError> {
        let records = self.tracker.find_open(&record_label(key))?;
        Ok(records
            .into_iter()
            .filter(|r| r.title.contains(key))
            .collect())
    }

    fn close_duplicate(&self, own_id: u64, canonical_id: u64) {
        if let Err(err) = self.tracker.append_note(own_id, &duplicate_note(canonical_id)) {
            warn!(record = own_id, err = %err, "failed to annotate duplicate record");
        }
        if let Err(err) = self.tracker.close(own_id) {
            warn!(record = own_id, err = %err, "failed to close duplicate record");
        }
    }

    /// Tell followers which branch carries the fix. Best-effort.
    pub fn announce_fix_branch(&self, record_id: u64, branch: &str) {
        if let Err(err) = self.tracker.append_note(record_id, &fix_branch_note(branch)) {
            warn!(record = record_id, err = %err, "failed to announce fix branch");
        }
    }

    /// Open record whose owner announced `branch`, if any. Best-effort.
    pub fn record_for_branch(&self, branch: &str) -> Option<u64> {
        if !self.config.enabled {
            return None;
        }
        match self.tracker.find_open(&self.config.label) {
            Ok(records) => records
                .iter()
                .filter(|r| {
                    parse_record(&r.body, &r.notes)
                        .and_then(|p| p.fix_branch)
                        .is_some_and(|b| b == branch)
                })
                .map(|r| r.id)
                .min(),
            Err(err) => {
                warn!(err = %err, "failed to look up coordination record for branch");
                None
            }
        }
    }

    /// Give up ownership so a rerun of any flavor can analyze again.
    /// Best-effort.
    pub fn release(&self, record_id: u64, reason: &str) {
        if let Err(err) = self.tracker.append_note(record_id, &released_note(reason)) {
            warn!(record = record_id, err = %err, "failed to annotate released record");
        }
        if let Err(err) = self.tracker.close(record_id) {
            warn!(record = record_id, err = %err, "failed to close released record");
        }
        info!(record = record_id, "released coordination record");
    }

    /// Record completion and close the record. Best-effort.
    pub fn mark_fixed(&self, record_id: u64, branch: &str, pr_url: Option<&str>) {
        if let Err(err) = self.tracker.append_note(record_id, &fixed_note(branch, pr_url)) {
            warn!(record = record_id, err = %err, "failed to mark coordination record fixed");
            return;
        }
        if let Err(err) = self.tracker.close(record_id) {
            warn!(record = record_id, err = %err, "failed to close coordination record");
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::InMemoryTracker;

    const SHA: &str = "3f9c2a71d0e4b5a6";

    fn config() -> CoordinationConfig {
        CoordinationConfig {
            lookup_backoff_ms: 0,
            race_check_delay_ms: 0,
            ..CoordinationConfig::default()
        }
    }

    #[test]
    fn first_worker_creates_record_and_analyzes() {
        let tracker = InMemoryTracker::new();
        let cfg = config();
        let gate = CoordinationGate::new(&tracker, &cfg);
        let decision = gate.should_analyze(Some(SHA), Some("linux-x64"), Some("abcd"));
        assert!(decision.should_analyze);
        assert_eq!(decision.reason, GateReason::FirstMover);

        let records = tracker.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].labels.contains(&"commit-3f9c2a71".to_string()));
        assert!(records[0].labels.contains(&"autonomous-coordination".to_string()));
        assert_eq!(records[0].record.title, "Build Coordination: 3f9c2a71");
        assert!(records[0].record.body.contains("error-signature: abcd"));
    }

    #[test]
    fn second_worker_follows_and_leaves_a_note() {
        let tracker = InMemoryTracker::new();
        let cfg = config();
        let gate = CoordinationGate::new(&tracker, &cfg);
        let first = gate.should_analyze(Some(SHA), Some("linux-x64"), None);
        let record = first.record_id.expect("record");
        gate.announce_fix_branch(record, "autonomous-fix-9");

        let second = gate.should_analyze(Some(SHA), Some("windows"), None);
        assert!(!second.should_analyze);
        assert_eq!(second.reason, GateReason::AnotherWorkerAnalyzing);
        assert_eq!(second.record_id, Some(record));
        assert_eq!(second.owner_flavor.as_deref(), Some("linux-x64"));
        assert_eq!(second.wait_for_branch.as_deref(), Some("autonomous-fix-9"));
        let notes = &tracker.records()[0].record.notes;
        assert!(notes.iter().any(|n| n.contains("flavor: windows")));
    }

    #[test]
    fn lookup_retries_until_the_record_becomes_visible() {
        let tracker = InMemoryTracker::with_visibility_lag(3);
        let cfg = config();
        let gate = CoordinationGate::new(&tracker, &cfg);
        let first = gate.should_analyze(Some(SHA), Some("linux-x64"), None);
        assert_eq!(first.reason, GateReason::FirstMover);
        let second = gate.should_analyze(Some(SHA), Some("windows"), None);
        assert_eq!(second.reason, GateReason::AnotherWorkerAnalyzing);
        assert_eq!(tracker.records().len(), 1);
    }

    #[test]
    fn racing_creators_reconcile_to_lowest_id() {
        let tracker = InMemoryTracker::new();
        let cfg = config();
        let gate = CoordinationGate::new(&tracker, &cfg);
        // A record created by a concurrent worker that our lookup missed.
        tracker.insert_hidden_until_created(SHA, "macos");

        let decision = gate.should_analyze(Some(SHA), Some("linux-x64"), None);
        assert!(!decision.should_analyze);
        assert_eq!(decision.reason, GateReason::LostRace);
        assert_eq!(decision.owner_flavor.as_deref(), Some("macos"));

        let records = tracker.records();
        let own = records.iter().find(|r| r.record.id == 2).expect("own record");
        assert!(!own.open);
        assert!(own.record.notes.iter().any(|n| n.contains("Duplicate of #1")));
    }

    #[test]
    fn unavailable_tracker_fails_open() {
        let tracker = InMemoryTracker::offline();
        let cfg = config();
        let decision = CoordinationGate::new(&tracker, &cfg).should_analyze(
            Some(SHA),
            Some("linux-x64"),
            None,
        );
        assert!(decision.should_analyze);
        assert_eq!(decision.reason, GateReason::TrackerUnavailable);
    }

    #[test]
    fn missing_flavor_or_disabled_gate_skips_coordination() {
        let tracker = InMemoryTracker::new();
        let cfg = config();
        let gate = CoordinationGate::new(&tracker, &cfg);
        assert_eq!(gate.should_analyze(Some(SHA), None, None).reason, GateReason::Disabled);
        assert_eq!(gate.should_analyze(None, Some("x"), None).reason, GateReason::Disabled);

        let disabled = CoordinationConfig {
            enabled: false,
            ..config()
        };
        let decision =
            CoordinationGate::new(&tracker, &disabled).should_analyze(Some(SHA), Some("x"), None);
        assert_eq!(decision.reason, GateReason::Disabled);
        assert!(tracker.records().is_empty());
    }

    #[test]
    fn mark_fixed_closes_the_record_found_by_branch() {
        let tracker = InMemoryTracker::new();
        let cfg = config();
        let gate = CoordinationGate::new(&tracker, &cfg);
        let record = gate
            .should_analyze(Some(SHA), Some("linux-x64"), None)
            .record_id
            .expect("record");
        gate.announce_fix_branch(record, "autonomous-fix-9");

        assert_eq!(gate.record_for_branch("autonomous-fix-9"), Some(record));
        assert_eq!(gate.record_for_branch("autonomous-fix-10"), None);
        gate.mark_fixed(record, "autonomous-fix-9", Some("https://x/pull/3"));
        assert!(!tracker.records()[0].open);
        assert_eq!(gate.record_for_branch("autonomous-fix-9"), None);
    }

    #[test]
    fn released_record_lets_the_next_worker_analyze() {
        let tracker = InMemoryTracker::new();
        let cfg = config();
        let gate = CoordinationGate::new(&tracker, &cfg);
        let record = gate
            .should_analyze(Some(SHA), Some("linux-x64"), None)
            .record_id
            .expect("record");
        gate.release(record, "apply failed");

        let released = &tracker.records()[0];
        assert!(!released.open);
        assert!(released.record.notes.iter().any(|n| n.contains("state: released")));

        let next = gate.should_analyze(Some(SHA), Some("windows"), None);
        assert!(next.should_analyze);
        assert_eq!(next.reason, GateReason::FirstMover);
        assert_ne!(next.record_id, Some(record));
    }
}
