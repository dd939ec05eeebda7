//! Case routing for a single build event.
//!
//! A run classifies the event, rebuilds the fix session from branch history
//! when needed, and drives exactly one case to a [`RunOutcome`]. Nothing is
//! remembered between runs; the fix branch itself is the session state.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::core::case::{
    Case, FixFailureRoute, classify_event, fix_branch_name, route_fix_failure,
};
use crate::core::signature::error_signature;
use crate::core::types::{
    ActionTaken, AttemptRecord, BuildEvent, BuildStatus, FailureExcerpt, RunOutcome,
};
use crate::gate::CoordinationGate;
use crate::investigation::{InvestigationContext, InvestigationEngine, InvestigationReport};
use crate::io::config::TriageConfig;
use crate::io::evidence::EvidenceBroker;
use crate::io::failure_log::read_failure_excerpt;
use crate::io::publisher::{
    ApplyRequest, ESCALATION_EXTRA_LABELS, EscalationRequest, FixPublisher, PullRequestRequest,
    SessionSummary, attempts_label, escalation_label, render_escalation_body,
    render_pull_request_body,
};
use crate::io::reasoning::ReasoningEngine;
use crate::io::tracker::Tracker;
use crate::ledger::{AttemptLedger, CommitSource, LedgerSnapshot};

/// External collaborators of a run.
pub struct Collaborators<'a, R, B, T, P, H> {
    pub engine: &'a R,
    pub evidence: &'a B,
    pub tracker: &'a T,
    pub publisher: &'a P,
    pub history: &'a H,
}

pub struct Orchestrator<'a, R, B, T, P, H> {
    config: &'a TriageConfig,
    deps: Collaborators<'a, R, B, T, P, H>,
    /// CI run identifier used as the fix id of a new session.
    run_id: Option<String>,
}

impl<'a, R, B, T, P, H> Orchestrator<'a, R, B, T, P, H>
where
    R: ReasoningEngine,
    B: EvidenceBroker,
    T: Tracker,
    P: FixPublisher,
    H: CommitSource,
{
    pub fn new(
        config: &'a TriageConfig,
        deps: Collaborators<'a, R, B, T, P, H>,
        run_id: Option<String>,
    ) -> Self {
        Self {
            config,
            deps,
            run_id,
        }
    }

    /// Handle one build event. Always produces an outcome; unexpected
    /// failures become an `error` outcome carrying the full error chain.
    #[instrument(skip_all, fields(branch = %event.branch_name))]
    pub fn handle(&self, event: &BuildEvent) -> RunOutcome {
        match self.route(event) {
            Ok(outcome) => {
                info!(
                    action = outcome.action_taken.as_str(),
                    attempt = outcome.attempt,
                    "run complete"
                );
                outcome
            }
            Err(err) => {
                error!(err = %format!("{err:#}"), "run failed");
                RunOutcome::error(0, format!("{err:#}"))
            }
        }
    }

    fn route(&self, event: &BuildEvent) -> Result<RunOutcome> {
        let succeeded = event.build_status == BuildStatus::Success;
        match classify_event(&event.branch_name, succeeded, &self.config.fix_branch_prefix) {
            Case::DoNothing => {
                info!("build passed on a non-fix branch");
                Ok(RunOutcome::bare(true, ActionTaken::DoNothing, 0))
            }
            Case::FirstFailure => self.first_failure(event),
            Case::FixFailure { fix_id } => self.fix_failure(&fix_id, event),
            Case::FixSuccess { fix_id } => self.fix_success(&fix_id, &event.branch_name),
        }
    }

    fn gate(&self) -> CoordinationGate<'_, T> {
        CoordinationGate::new(self.deps.tracker, &self.config.coordination)
    }

    fn ledger(&self) -> Result<LedgerSnapshot> {
        AttemptLedger::new(
            self.deps.history,
            &self.config.agent_name,
            &self.config.base_branch,
        )
        .read()
        .context("read attempt history")
    }

    fn new_fix_id(&self) -> String {
        match self.run_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("local-{}", Utc::now().timestamp_millis()),
        }
    }

    fn first_failure(&self, event: &BuildEvent) -> Result<RunOutcome> {
        let failure =
            read_failure_excerpt(event.failure_log.as_deref(), self.config.excerpt_limits());
        let signature = error_signature(&failure.excerpt);
        let gate = self.gate();
        let decision = gate.should_analyze(
            event.commit_sha.as_deref(),
            event.flavor.as_deref(),
            Some(&signature),
        );
        if !decision.should_analyze {
            info!(reason = decision.reason.as_str(), "skipping analysis");
            return Ok(RunOutcome {
                fix_description: Some(format!("Skipped: {}", decision.reason.as_str())),
                branch_name: decision.wait_for_branch,
                coordination_record: decision.record_id,
                ..RunOutcome::bare(true, ActionTaken::CoordinationSkip, 0)
            });
        }

        let fix_id = self.new_fix_id();
        let branch = fix_branch_name(&self.config.fix_branch_prefix, &fix_id);
        info!(fix_id = %fix_id, "starting fix session");

        let ctx = AttemptContext {
            fix_id: &fix_id,
            branch: &branch,
            attempt: 1,
            create_branch: true,
            flavor: event.flavor.as_deref(),
        };
        let result = self.investigate_and_apply(&ctx, &failure, &[], ActionTaken::FirstFailure);
        let Some(record) = decision.record_id else {
            return result;
        };
        match result {
            Ok(mut outcome) => {
                outcome.coordination_record = Some(record);
                if outcome.success {
                    gate.announce_fix_branch(record, &branch);
                } else {
                    let reason = outcome.error_message.as_deref().unwrap_or("analysis failed");
                    gate.release(record, reason);
                }
                Ok(outcome)
            }
            Err(err) => {
                gate.release(record, &format!("{err:#}"));
                Err(err)
            }
        }
    }

    fn fix_failure(&self, fix_id: &str, event: &BuildEvent) -> Result<RunOutcome> {
        let branch = event.branch_name.as_str();
        let snapshot = self.ledger()?;
        let session = snapshot.session(fix_id, branch);
        info!(
            fix_id = %session.fix_id,
            current_attempt = session.current_attempt,
            branch = %session.branch_name,
            "resuming fix session"
        );
        match route_fix_failure(
            snapshot.current_attempt,
            self.config.escalation.threshold,
            snapshot.human_touched,
        ) {
            FixFailureRoute::Escalate { attempts_made } => {
                self.escalate(fix_id, branch, &snapshot, attempts_made)
            }
            FixFailureRoute::StopHumanIntervention { next_attempt } => {
                warn!("human commits on the fix branch; stopping");
                Ok(RunOutcome {
                    fix_description: Some(
                        "Human intervention detected, agent stopped".to_string(),
                    ),
                    branch_name: Some(branch.to_string()),
                    ..RunOutcome::bare(true, ActionTaken::StoppedHumanIntervention, next_attempt)
                })
            }
            FixFailureRoute::Retry { next_attempt } => {
                let failure = read_failure_excerpt(
                    event.failure_log.as_deref(),
                    self.config.excerpt_limits(),
                );
                let ctx = AttemptContext {
                    fix_id,
                    branch,
                    attempt: next_attempt,
                    create_branch: false,
                    flavor: event.flavor.as_deref(),
                };
                self.investigate_and_apply(&ctx, &failure, &snapshot.attempts, ActionTaken::Retry)
            }
        }
    }

    /// Investigate, then commit and push whatever proposal comes out.
    fn investigate_and_apply(
        &self,
        ctx: &AttemptContext<'_>,
        failure: &FailureExcerpt,
        previous: &[AttemptRecord],
        action: ActionTaken,
    ) -> Result<RunOutcome> {
        let policy = self.config.variant_policy();
        let variant = policy.variant_for_attempt(ctx.attempt)?;
        let investigation = InvestigationEngine::new(
            self.deps.engine,
            self.deps.evidence,
            &self.config.investigation,
        )?;
        let report = investigation.run(&InvestigationContext {
            attempt: ctx.attempt,
            variant,
            upgraded: policy.is_upgraded(ctx.attempt),
            flavor: ctx.flavor,
            failure,
            previous,
        })?;

        let applied = self.deps.publisher.apply_fix(&ApplyRequest {
            fix_id: ctx.fix_id,
            attempt: ctx.attempt,
            branch: ctx.branch,
            create_branch: ctx.create_branch,
            engine_variant: variant,
            proposal: &report.proposal,
        });
        let base = outcome_from_report(&report, variant, ctx);
        match applied {
            Ok(applied) => {
                info!(commit = %applied.commit_sha, attempt = ctx.attempt, "fix attempt pushed");
                Ok(RunOutcome {
                    success: true,
                    action_taken: action,
                    ..base
                })
            }
            Err(err) => {
                error!(err = %format!("{err:#}"), "failed to apply fix");
                Ok(RunOutcome {
                    success: false,
                    action_taken: ActionTaken::Error,
                    error_message: Some(format!("failed to apply fix: {err:#}")),
                    ..base
                })
            }
        }
    }

    fn escalate(
        &self,
        fix_id: &str,
        branch: &str,
        snapshot: &LedgerSnapshot,
        attempts_made: u32,
    ) -> Result<RunOutcome> {
        let label = escalation_label(fix_id);
        if let Some(url) = self.deps.publisher.find_escalation(&label)? {
            info!(url = %url, "already escalated");
            return Ok(RunOutcome {
                pr_url: Some(url),
                branch_name: Some(branch.to_string()),
                ..RunOutcome::bare(true, ActionTaken::AlreadyEscalated, attempts_made + 1)
            });
        }

        let body = render_escalation_body(&SessionSummary {
            fix_id,
            branch,
            attempts: attempts_made,
            original_error: snapshot.original_error.as_deref().unwrap_or("Unknown error"),
            history: &snapshot.attempts,
            coordination_record: None,
        })?;
        let mut labels = vec![label];
        labels.extend(ESCALATION_EXTRA_LABELS.iter().map(|l| l.to_string()));
        let url = self.deps.publisher.open_escalation(&EscalationRequest {
            title: format!("Build Failure Escalation: {fix_id}"),
            body,
            labels,
        })?;
        warn!(url = %url, attempts_made, "escalated to a human");
        Ok(RunOutcome {
            fix_description: Some(format!("Escalated after {attempts_made} attempts")),
            pr_url: Some(url),
            branch_name: Some(branch.to_string()),
            ..RunOutcome::bare(true, ActionTaken::Escalated, attempts_made + 1)
        })
    }

    fn fix_success(&self, fix_id: &str, branch: &str) -> Result<RunOutcome> {
        let snapshot = self.ledger()?;
        let attempts = snapshot.current_attempt;
        let gate = self.gate();
        let record = gate.record_for_branch(branch);

        let body = render_pull_request_body(&SessionSummary {
            fix_id,
            branch,
            attempts,
            original_error: snapshot.original_error.as_deref().unwrap_or("Unknown error"),
            history: &snapshot.attempts,
            coordination_record: record,
        })?;
        let title = pull_request_title(&snapshot, fix_id);
        let url = self.deps.publisher.open_pull_request(&PullRequestRequest {
            branch: branch.to_string(),
            title: title.clone(),
            body,
            labels: vec![attempts_label(fix_id, attempts)],
        })?;
        info!(url = %url, attempts, "opened pull request");
        if let Some(id) = record {
            gate.mark_fixed(id, branch, Some(&url));
        }

        Ok(RunOutcome {
            confidence: 1.0,
            fix_description: Some(title),
            pr_url: Some(url),
            branch_name: Some(branch.to_string()),
            coordination_record: record,
            ..RunOutcome::bare(true, ActionTaken::PrCreated, attempts)
        })
    }
}

struct AttemptContext<'a> {
    fix_id: &'a str,
    branch: &'a str,
    attempt: u32,
    create_branch: bool,
    flavor: Option<&'a str>,
}

fn outcome_from_report(
    report: &InvestigationReport,
    variant: &str,
    ctx: &AttemptContext<'_>,
) -> RunOutcome {
    RunOutcome {
        engine_variant: variant.to_string(),
        confidence: report.proposal.confidence,
        turns_used: report.turns_used(),
        fix_description: Some(report.proposal.description.clone()),
        branch_name: Some(ctx.branch.to_string()),
        ..RunOutcome::bare(true, ActionTaken::Error, ctx.attempt)
    }
}

/// Title from the last applied fix, falling back to the fix id.
fn pull_request_title(snapshot: &LedgerSnapshot, fix_id: &str) -> String {
    let summary = snapshot
        .attempts
        .last()
        .and_then(|a| a.fix_applied.clone())
        .map(|s| s.lines().next().unwrap_or("").trim().to_string())
        .filter(|s| !s.is_empty());
    match summary {
        Some(summary) => format!("Autonomous fix: {summary}"),
        None => format!("Autonomous fix {fix_id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u32, fix_applied: Option<&str>) -> AttemptRecord {
        AttemptRecord {
            attempt_number: n,
            commit_ref: format!("{n:08}"),
            author_identity: "Autonomous Agent".to_string(),
            summary_text: format!("Autonomous Fix Attempt {n}: x"),
            fix_applied: fix_applied.map(str::to_string),
            reasoning: None,
        }
    }

    #[test]
    fn pull_request_title_uses_last_fix() {
        let snapshot = LedgerSnapshot {
            current_attempt: 2,
            attempts: vec![record(1, Some("pin cmake")), record(2, Some("add include\nmore"))],
            human_touched: false,
            original_error: None,
        };
        assert_eq!(pull_request_title(&snapshot, "42"), "Autonomous fix: add include");
    }

    #[test]
    fn pull_request_title_falls_back_to_fix_id() {
        let snapshot = LedgerSnapshot {
            current_attempt: 0,
            attempts: Vec::new(),
            human_touched: false,
            original_error: None,
        };
        assert_eq!(pull_request_title(&snapshot, "42"), "Autonomous fix 42");
    }
}
