//! Run-level tests driving `Orchestrator::handle` through whole fix sessions.
//!
//! Every collaborator is an in-memory double, so a sequence of builds
//! (main fails, fix branch fails, fix branch passes) can be replayed against
//! shared tracker and branch state.

use std::fs;
use std::path::PathBuf;

use triage::core::types::{ActionTaken, BuildEvent, BuildStatus, RunOutcome};
use triage::io::config::TriageConfig;
use triage::orchestrator::{Collaborators, Orchestrator};
use triage::test_support::{
    InMemoryHistory, InMemoryTracker, RecordingPublisher, ScriptedEngine, StaticEvidence,
};

const AGENT: &str = "Autonomous Agent";
const SHA: &str = "3f9c2a71d0e4b5a6c7d8e9f0a1b2c3d4e5f60718";
const FIX_BRANCH: &str = "autonomous-fix-42";

const PROPOSE: &str = r##"{"action":"propose_fix","confidence":0.92,"root_cause":"frame.h uses uint8_t without <cstdint>","reasoning":"the compiler reports uint8_t undeclared","description":"add <cstdint> to frame.h","file_changes":[{"path":"base/include/frame.h","action":"edit","content":"#include <cstdint>\n"}]}"##;
const REQUEST_HEADER: &str = r#"{"action":"request_more","requests":[{"kind":"file","target":"base/include/frame.h","reason":"check includes"}]}"#;

const COMPILE_LOG: &str = "\
-- Configuring done
[ 42%] Building CXX object base/CMakeFiles/base.dir/frame.cc.o
base/include/frame.h:12:5: error: 'uint8_t' does not name a type
   12 |     uint8_t* data;
      |     ^~~~~~~
make[2]: *** [base/CMakeFiles/base.dir/build.make:76: base/frame.cc.o] Error 1
";

fn config() -> TriageConfig {
    let mut cfg = TriageConfig::default();
    cfg.engine.cheap_variant = "cheap".to_string();
    cfg.engine.upgraded_variant = "upgraded".to_string();
    cfg.coordination.lookup_backoff_ms = 0;
    cfg.coordination.race_check_delay_ms = 0;
    cfg
}

#[derive(Default)]
struct World {
    engine: ScriptedEngine,
    evidence: StaticEvidence,
    tracker: InMemoryTracker,
    publisher: RecordingPublisher,
    history: InMemoryHistory,
}

impl World {
    fn handle(&self, cfg: &TriageConfig, event: &BuildEvent) -> RunOutcome {
        let deps = Collaborators {
            engine: &self.engine,
            evidence: &self.evidence,
            tracker: &self.tracker,
            publisher: &self.publisher,
            history: &self.history,
        };
        Orchestrator::new(cfg, deps, Some("42".to_string())).handle(event)
    }
}

fn event(branch: &str, status: BuildStatus, failure_log: Option<PathBuf>) -> BuildEvent {
    BuildEvent {
        branch_name: branch.to_string(),
        build_status: status,
        failure_log,
        flavor: Some("linux-x64".to_string()),
        commit_sha: Some(SHA.to_string()),
    }
}

fn failed(branch: &str) -> BuildEvent {
    event(branch, BuildStatus::Failure, None)
}

#[test]
fn passing_builds_off_fix_branches_do_nothing() {
    let cfg = config();
    let world = World::default();
    for branch in ["main", "release/2.1", "feature/autonomous-fix-1", "autonomous-fix-"] {
        let outcome = world.handle(&cfg, &event(branch, BuildStatus::Success, None));
        assert!(outcome.success, "{branch}");
        assert_eq!(outcome.action_taken, ActionTaken::DoNothing, "{branch}");
        assert_eq!(outcome.attempt, 0);
    }
    assert_eq!(world.engine.calls(), 0);
    assert!(world.publisher.applied().is_empty());
    assert!(world.tracker.records().is_empty());
}

#[test]
fn first_failure_opens_session_and_announces_branch() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = temp.path().join("build.log");
    fs::write(&log, COMPILE_LOG).expect("write log");

    let cfg = config();
    let world = World {
        engine: ScriptedEngine::replies([REQUEST_HEADER, PROPOSE]),
        evidence: StaticEvidence::with_file("base/include/frame.h", "#pragma once\n"),
        ..World::default()
    };
    let outcome = world.handle(&cfg, &event("main", BuildStatus::Failure, Some(log)));

    assert!(outcome.success);
    assert_eq!(outcome.action_taken, ActionTaken::FirstFailure);
    assert_eq!(outcome.attempt, 1);
    assert_eq!(outcome.engine_variant, "cheap");
    assert_eq!(outcome.turns_used, 2);
    assert!((outcome.confidence - 0.92).abs() < f64::EPSILON);
    assert_eq!(outcome.branch_name.as_deref(), Some(FIX_BRANCH));
    assert_eq!(outcome.fix_description.as_deref(), Some("add <cstdint> to frame.h"));

    let applied = world.publisher.applied();
    assert_eq!(applied.len(), 1);
    assert!(applied[0].create_branch);
    assert_eq!(applied[0].attempt, 1);
    assert_eq!(applied[0].branch, FIX_BRANCH);
    assert_eq!(applied[0].file_changes, 1);

    let prompts = world.engine.prompts();
    assert!(prompts[0].contains("'uint8_t' does not name a type"));
    assert!(prompts[1].contains("#pragma once"));

    let records = world.tracker.records();
    assert_eq!(records.len(), 1);
    assert_eq!(outcome.coordination_record, Some(records[0].record.id));
    assert!(
        records[0]
            .record
            .notes
            .iter()
            .any(|n| n.contains(&format!("fix-branch: {FIX_BRANCH}")))
    );
}

#[test]
fn unconfident_investigation_still_pushes_the_fallback() {
    let cfg = config();
    let world = World {
        engine: ScriptedEngine::replies([r#"{"action":"request_more","requests":[]}"#]),
        ..World::default()
    };
    let outcome = world.handle(&cfg, &failed("main"));

    assert!(outcome.success);
    assert_eq!(outcome.action_taken, ActionTaken::FirstFailure);
    assert_eq!(outcome.turns_used, 1);
    assert!((outcome.confidence - 0.5).abs() < f64::EPSILON);
    let applied = world.publisher.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].file_changes, 0);
}

#[test]
fn retry_continues_the_count_and_shows_previous_attempts() {
    let cfg = config();
    let world = World {
        engine: ScriptedEngine::replies([PROPOSE]),
        history: InMemoryHistory::with_attempts(AGENT, 2),
        ..World::default()
    };
    let outcome = world.handle(&cfg, &failed(FIX_BRANCH));

    assert!(outcome.success);
    assert_eq!(outcome.action_taken, ActionTaken::Retry);
    assert_eq!(outcome.attempt, 3);
    assert_eq!(outcome.engine_variant, "cheap");

    let applied = world.publisher.applied();
    assert_eq!(applied.len(), 1);
    assert!(!applied[0].create_branch);
    assert_eq!(applied[0].fix_id, "42");
    assert_eq!(applied[0].attempt, 3);

    let prompt = &world.engine.prompts()[0];
    assert!(prompt.contains("### Previous Attempts"));
    assert!(prompt.contains("fix 1"));
    assert!(prompt.contains("fix 2"));
    assert!(!prompt.contains("cheaper engine variant failed"));
}

#[test]
fn fifth_and_sixth_attempts_use_the_upgraded_variant() {
    let cfg = config();
    for (previous, expected) in [(3, "cheap"), (4, "upgraded"), (5, "upgraded")] {
        let world = World {
            engine: ScriptedEngine::replies([PROPOSE]),
            history: InMemoryHistory::with_attempts(AGENT, previous),
            ..World::default()
        };
        let outcome = world.handle(&cfg, &failed(FIX_BRANCH));
        assert_eq!(outcome.action_taken, ActionTaken::Retry);
        assert_eq!(outcome.attempt, previous + 1);
        assert_eq!(outcome.engine_variant, expected, "attempt {}", previous + 1);
        assert_eq!(world.engine.variants(), vec![expected.to_string()]);
    }
}

#[test]
fn seventh_failure_escalates_without_calling_the_engine() {
    let cfg = config();
    let world = World {
        history: InMemoryHistory::with_attempts(AGENT, 6),
        ..World::default()
    };
    let outcome = world.handle(&cfg, &failed(FIX_BRANCH));

    assert!(outcome.success);
    assert_eq!(outcome.action_taken, ActionTaken::Escalated);
    assert_eq!(outcome.attempt, 7);
    assert_eq!(outcome.fix_description.as_deref(), Some("Escalated after 6 attempts"));
    assert_eq!(world.engine.calls(), 0);
    assert!(world.publisher.applied().is_empty());

    let escalations = world.publisher.escalations();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].title, "Build Failure Escalation: 42");
    assert_eq!(
        escalations[0].labels,
        vec!["escalation-42", "needs-human", "autonomous-agent"]
    );
    assert!(escalations[0].body.contains("root cause 1"));
    assert_eq!(outcome.pr_url.as_deref(), Some("https://forge.test/issues/1"));
}

#[test]
fn existing_escalation_is_not_duplicated() {
    let cfg = config();
    let world = World {
        history: InMemoryHistory::with_attempts(AGENT, 6),
        publisher: RecordingPublisher::with_escalation(
            "escalation-42",
            "https://forge.test/issues/7",
        ),
        ..World::default()
    };
    let outcome = world.handle(&cfg, &failed(FIX_BRANCH));

    assert_eq!(outcome.action_taken, ActionTaken::AlreadyEscalated);
    assert_eq!(outcome.attempt, 7);
    assert_eq!(outcome.pr_url.as_deref(), Some("https://forge.test/issues/7"));
    assert!(world.publisher.escalations().is_empty());
}

#[test]
fn exhausted_session_escalates_even_after_a_human_commit() {
    let cfg = config();
    let history = InMemoryHistory::with_attempts(AGENT, 6);
    history.commit("Jane Doe", "bump toolchain");
    let world = World {
        history,
        ..World::default()
    };
    let outcome = world.handle(&cfg, &failed(FIX_BRANCH));
    assert_eq!(outcome.action_taken, ActionTaken::Escalated);
}

#[test]
fn human_commit_stops_the_agent() {
    let cfg = config();
    let history = InMemoryHistory::with_attempts(AGENT, 2);
    history.commit("Jane Doe", "try a different compiler flag");
    let world = World {
        engine: ScriptedEngine::replies([PROPOSE]),
        history,
        ..World::default()
    };
    let outcome = world.handle(&cfg, &failed(FIX_BRANCH));

    assert!(outcome.success);
    assert_eq!(outcome.action_taken, ActionTaken::StoppedHumanIntervention);
    assert_eq!(outcome.attempt, 3);
    assert_eq!(
        outcome.fix_description.as_deref(),
        Some("Human intervention detected, agent stopped")
    );
    assert_eq!(world.engine.calls(), 0);
    assert!(world.publisher.applied().is_empty());
}

#[test]
fn green_fix_branch_opens_pull_request() {
    let cfg = config();
    let world = World {
        history: InMemoryHistory::with_attempts(AGENT, 3),
        ..World::default()
    };
    let outcome = world.handle(&cfg, &event(FIX_BRANCH, BuildStatus::Success, None));

    assert!(outcome.success);
    assert_eq!(outcome.action_taken, ActionTaken::PrCreated);
    assert_eq!(outcome.attempt, 3);
    assert!((outcome.confidence - 1.0).abs() < f64::EPSILON);
    assert_eq!(outcome.pr_url.as_deref(), Some("https://forge.test/pull/1"));
    assert_eq!(outcome.fix_description.as_deref(), Some("Autonomous fix: fix 3"));

    let pulls = world.publisher.pull_requests();
    assert_eq!(pulls.len(), 1);
    assert_eq!(pulls[0].branch, FIX_BRANCH);
    assert_eq!(pulls[0].labels, vec!["fix-42-attempts-3"]);
    assert!(pulls[0].body.contains("root cause 1"));
    assert_eq!(world.engine.calls(), 0);
}

#[test]
fn failed_push_is_an_error_outcome() {
    let cfg = config();
    let world = World {
        engine: ScriptedEngine::replies([PROPOSE]),
        publisher: RecordingPublisher::failing_apply(),
        history: InMemoryHistory::with_attempts(AGENT, 1),
        ..World::default()
    };
    let outcome = world.handle(&cfg, &failed(FIX_BRANCH));

    assert!(!outcome.success);
    assert_eq!(outcome.action_taken, ActionTaken::Error);
    assert_eq!(outcome.attempt, 2);
    assert_eq!(outcome.engine_variant, "cheap");
    assert_eq!(outcome.turns_used, 1);
    let message = outcome.error_message.expect("error message");
    assert!(message.contains("push rejected"), "{message}");
}

#[test]
fn whole_session_from_main_failure_to_pull_request() {
    let cfg = config();
    let world = World {
        engine: ScriptedEngine::replies([PROPOSE, PROPOSE]),
        ..World::default()
    };

    let first = world.handle(&cfg, &failed("main"));
    assert_eq!(first.action_taken, ActionTaken::FirstFailure);
    let record = first.coordination_record.expect("coordination record");
    world.history.commit(
        AGENT,
        "Autonomous Fix Attempt 1: add <cstdint> to frame.h\n\n\
         **Root Cause Analysis:**\nframe.h uses uint8_t without <cstdint>\n\n\
         **Fix Applied:**\nadd <cstdint> to frame.h",
    );

    let retry = world.handle(&cfg, &failed(FIX_BRANCH));
    assert_eq!(retry.action_taken, ActionTaken::Retry);
    assert_eq!(retry.attempt, 2);
    world.history.commit(
        AGENT,
        "Autonomous Fix Attempt 2: include <cstdint> in frame.cc too\n\n\
         **Fix Applied:**\ninclude <cstdint> in frame.cc too",
    );

    let done = world.handle(&cfg, &event(FIX_BRANCH, BuildStatus::Success, None));
    assert_eq!(done.action_taken, ActionTaken::PrCreated);
    assert_eq!(done.attempt, 2);
    assert_eq!(done.coordination_record, Some(record));
    assert_eq!(
        done.fix_description.as_deref(),
        Some("Autonomous fix: include <cstdint> in frame.cc too")
    );

    let stored = world.tracker.records();
    let coordination = stored
        .iter()
        .find(|s| s.record.id == record)
        .expect("stored record");
    assert!(!coordination.open);
    assert!(coordination.record.notes.iter().any(|n| n.contains("state: fixed")));
}
