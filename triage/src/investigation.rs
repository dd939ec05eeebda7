//! Bounded multi-turn investigation of a failed build.
//!
//! Each turn renders a prompt, calls the reasoning engine once, and either
//! accepts a confident proposal or gathers the requested evidence for the
//! next turn. Protocol failures never abort the loop: they become a generic
//! evidence request so the engine gets another chance with more context.

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::InvestigationBudget;
use crate::core::turn_parser::parse_turn_reply;
use crate::core::types::{
    AttemptRecord, EvidenceRequest, EvidenceResult, FailureExcerpt, FixProposal,
    InvestigationTurn, TurnResult,
};
use crate::io::config::InvestigationConfig;
use crate::io::evidence::EvidenceBroker;
use crate::io::prompt::{PromptBuilder, PromptInputs};
use crate::io::reasoning::{ReasoningEngine, TurnRequest};

const GENERIC_REASON: &str = "need more context";

/// Per-attempt inputs of one investigation.
#[derive(Debug, Clone)]
pub struct InvestigationContext<'a> {
    pub attempt: u32,
    pub variant: &'a str,
    pub upgraded: bool,
    pub flavor: Option<&'a str>,
    pub failure: &'a FailureExcerpt,
    pub previous: &'a [AttemptRecord],
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Accepted,
    NoMoreRequests,
    MaxTurns,
    TokenBudget,
}

impl StopReason {
    fn describe(self) -> &'static str {
        match self {
            StopReason::Accepted => "accepted a confident proposal",
            StopReason::NoMoreRequests => "the engine requested no further evidence",
            StopReason::MaxTurns => "the turn limit was reached",
            StopReason::TokenBudget => "the token budget was exhausted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvestigationReport {
    pub proposal: FixProposal,
    /// False when `proposal` is the fallback.
    pub accepted: bool,
    pub stop: StopReason,
    pub turns: Vec<InvestigationTurn>,
    pub tokens_used: u64,
}

impl InvestigationReport {
    pub fn turns_used(&self) -> u32 {
        self.turns.len() as u32
    }
}

pub struct InvestigationEngine<'a, R: ReasoningEngine, B: EvidenceBroker> {
    engine: &'a R,
    evidence: &'a B,
    config: &'a InvestigationConfig,
    prompts: PromptBuilder,
}

impl<'a, R: ReasoningEngine, B: EvidenceBroker> InvestigationEngine<'a, R, B> {
    pub fn new(engine: &'a R, evidence: &'a B, config: &'a InvestigationConfig) -> Result<Self> {
        Ok(Self {
            engine,
            evidence,
            config,
            prompts: PromptBuilder::new(config.prompt_budget_bytes)?,
        })
    }

    #[instrument(skip_all, fields(attempt = ctx.attempt, variant = ctx.variant))]
    pub fn run(&self, ctx: &InvestigationContext<'_>) -> Result<InvestigationReport> {
        let mut budget =
            InvestigationBudget::new(self.config.max_turns, self.config.max_total_tokens);
        let mut history: Vec<EvidenceResult> = Vec::new();
        let mut turns: Vec<InvestigationTurn> = Vec::new();
        let mut accepted = None;

        let stop = loop {
            if budget.turns_exhausted() {
                break StopReason::MaxTurns;
            }
            let turn_index = budget.turns_used() + 1;
            let prompt = self.prompts.build(&PromptInputs {
                attempt: ctx.attempt,
                turn: turn_index,
                max_turns: self.config.max_turns,
                upgraded: ctx.upgraded,
                flavor: ctx.flavor,
                confidence_floor: self.config.confidence_floor,
                failure: ctx.failure,
                previous: ctx.previous,
                evidence: &history,
            })?;

            let (reasoning_output, result) =
                self.call_engine(turn_index, ctx.variant, prompt, &mut budget);

            let requests = match result {
                TurnResult::ProposeFix(proposal)
                    if proposal.confidence >= self.config.confidence_floor =>
                {
                    info!(turn = turn_index, confidence = proposal.confidence, "accepted proposal");
                    turns.push(InvestigationTurn {
                        turn_index,
                        reasoning_output,
                        evidence_gathered: Vec::new(),
                    });
                    accepted = Some(proposal);
                    break StopReason::Accepted;
                }
                TurnResult::ProposeFix(proposal) => {
                    debug!(
                        turn = turn_index,
                        confidence = proposal.confidence,
                        floor = self.config.confidence_floor,
                        "discarded proposal below confidence floor"
                    );
                    vec![EvidenceRequest::generic(GENERIC_REASON)]
                }
                TurnResult::RequestMore { requests } if requests.is_empty() => {
                    debug!(turn = turn_index, "engine asked for nothing more");
                    turns.push(InvestigationTurn {
                        turn_index,
                        reasoning_output,
                        evidence_gathered: Vec::new(),
                    });
                    break StopReason::NoMoreRequests;
                }
                TurnResult::RequestMore { requests } => requests,
            };

            let gathered = self.evidence.fetch(&requests);
            history.extend(gathered.iter().cloned());
            turns.push(InvestigationTurn {
                turn_index,
                reasoning_output,
                evidence_gathered: gathered,
            });

            if budget.tokens_exhausted() {
                break StopReason::TokenBudget;
            }
        };

        let tokens_used = budget.tokens_used();
        let report = match accepted {
            Some(proposal) => InvestigationReport {
                proposal,
                accepted: true,
                stop,
                turns,
                tokens_used,
            },
            None => {
                warn!(stop = stop.describe(), turns = turns.len(), "no confident proposal");
                InvestigationReport {
                    proposal: self.fallback_proposal(stop, turns.len()),
                    accepted: false,
                    stop,
                    turns,
                    tokens_used,
                }
            }
        };
        Ok(report)
    }

    /// One engine call, recovered into a turn result on any failure.
    fn call_engine(
        &self,
        turn_index: u32,
        variant: &str,
        prompt: String,
        budget: &mut InvestigationBudget,
    ) -> (String, TurnResult) {
        let request = TurnRequest {
            turn_index,
            variant: variant.to_string(),
            prompt,
        };
        match self.engine.propose(&request) {
            Ok(reply) => {
                budget.record_turn(reply.tokens);
                match parse_turn_reply(&reply.text) {
                    Ok(result) => (reply.text, result),
                    Err(err) => {
                        warn!(turn = turn_index, err = %format!("{err:#}"), "malformed engine reply");
                        (reply.text, generic_request())
                    }
                }
            }
            Err(err) => {
                budget.record_turn(0);
                warn!(turn = turn_index, err = %err, "reasoning engine call failed");
                (err.to_string(), generic_request())
            }
        }
    }

    fn fallback_proposal(&self, stop: StopReason, turns: usize) -> FixProposal {
        FixProposal {
            confidence: self.config.fallback_confidence,
            root_cause: format!(
                "Investigation ended without a confident fix after {turns} turn(s): {}.",
                stop.describe()
            ),
            reasoning: format!(
                "No proposal reached the confidence floor of {:.2}.",
                self.config.confidence_floor
            ),
            description: "No confident fix found".to_string(),
            file_changes: Vec::new(),
        }
    }
}

fn generic_request() -> TurnResult {
    TurnResult::RequestMore {
        requests: vec![EvidenceRequest::generic(GENERIC_REASON)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::EvidenceKind;
    use crate::io::reasoning::{EngineReply, ReasoningError};
    use crate::test_support::{ScriptedEngine, StaticEvidence, failure_excerpt};

    const PROPOSE_HIGH: &str = r#"{"action":"propose_fix","confidence":0.9,"root_cause":"missing include","reasoning":"uint8_t undeclared","description":"add <cstdint>","file_changes":[{"path":"base/frame.h","action":"edit","content":"x"}]}"#;
    const PROPOSE_LOW: &str = r#"{"action":"propose_fix","confidence":0.3,"root_cause":"guess","reasoning":"unsure","file_changes":[]}"#;
    const REQUEST_FILE: &str = r#"{"action":"request_more","requests":[{"kind":"file","target":"base/frame.h","reason":"see includes"}]}"#;
    const REQUEST_BIG: &str = r#"{"action":"request_more","requests":[{"kind":"file","target":"base/big.cc","reason":"see callers"}]}"#;
    const REQUEST_SECOND: &str = r#"{"action":"request_more","requests":[{"kind":"file","target":"base/second.h","reason":"see alignment"}]}"#;
    const REQUEST_NOTHING: &str = r#"{"action":"request_more","requests":[]}"#;

    fn config() -> InvestigationConfig {
        InvestigationConfig {
            max_turns: 3,
            ..InvestigationConfig::default()
        }
    }

    fn run(
        engine: &ScriptedEngine,
        evidence: &StaticEvidence,
        cfg: &InvestigationConfig,
    ) -> InvestigationReport {
        let failure = failure_excerpt();
        InvestigationEngine::new(engine, evidence, cfg)
            .expect("engine")
            .run(&InvestigationContext {
                attempt: 1,
                variant: "cheap",
                upgraded: false,
                flavor: None,
                failure: &failure,
                previous: &[],
            })
            .expect("run")
    }

    #[test]
    fn accepts_confident_proposal_on_first_turn() {
        let engine = ScriptedEngine::replies([PROPOSE_HIGH]);
        let evidence = StaticEvidence::default();
        let report = run(&engine, &evidence, &config());
        assert!(report.accepted);
        assert_eq!(report.stop, StopReason::Accepted);
        assert_eq!(report.turns_used(), 1);
        assert_eq!(report.proposal.description, "add <cstdint>");
        assert!(evidence.requests().is_empty());
    }

    #[test]
    fn latest_evidence_reaches_the_prompt_after_a_large_file() {
        let engine = ScriptedEngine::replies([REQUEST_BIG, REQUEST_SECOND, PROPOSE_HIGH]);
        let evidence = StaticEvidence::with_file("base/big.cc", &"z".repeat(77_000))
            .and_file("base/second.h", "#define FRAME_ALIGN 16\n");
        let cfg = InvestigationConfig {
            prompt_budget_bytes: 60_000,
            ..config()
        };
        let report = run(&engine, &evidence, &cfg);
        assert!(report.accepted);

        let prompts = engine.prompts();
        assert_eq!(prompts.len(), 3);
        let third = &prompts[2];
        assert!(third.len() <= 60_000 + 2 * 4);
        assert!(third.contains("### Request 2: file - `base/second.h`"));
        assert!(third.contains("#define FRAME_ALIGN 16"));
        assert!(third.contains("### Request 1: file - `base/big.cc`"));
    }

    #[test]
    fn gathers_evidence_then_accepts() {
        let engine = ScriptedEngine::replies([REQUEST_FILE, PROPOSE_HIGH]);
        let evidence = StaticEvidence::with_file("base/frame.h", "#pragma once\n");
        let report = run(&engine, &evidence, &config());
        assert!(report.accepted);
        assert_eq!(report.turns_used(), 2);
        assert_eq!(report.turns[0].evidence_gathered.len(), 1);
        let prompts = engine.prompts();
        assert!(prompts[1].contains("#pragma once"));
        assert!(!prompts[0].contains("### Evidence"));
    }

    #[test]
    fn never_exceeds_max_turns_or_accepts_below_floor() {
        let engine = ScriptedEngine::replies([PROPOSE_LOW, PROPOSE_LOW, PROPOSE_LOW, PROPOSE_HIGH]);
        let evidence = StaticEvidence::default();
        let report = run(&engine, &evidence, &config());
        assert!(!report.accepted);
        assert_eq!(report.stop, StopReason::MaxTurns);
        assert_eq!(engine.calls(), 3);
        assert_eq!(report.proposal.confidence, 0.5);
        assert!(report.proposal.file_changes.is_empty());
        let requests = evidence.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.kind == EvidenceKind::CommitHistory && r.target == "all"));
    }

    #[test]
    fn empty_request_list_ends_the_investigation_in_that_turn() {
        let engine = ScriptedEngine::replies([REQUEST_NOTHING, PROPOSE_HIGH]);
        let evidence = StaticEvidence::default();
        let report = run(&engine, &evidence, &config());
        assert_eq!(report.stop, StopReason::NoMoreRequests);
        assert_eq!(engine.calls(), 1);
        assert!(!report.accepted);
        assert!(report.proposal.root_cause.contains("no further evidence"));
    }

    #[test]
    fn malformed_reply_forces_generic_request() {
        let engine = ScriptedEngine::replies(["I think it is the compiler.", PROPOSE_HIGH]);
        let evidence = StaticEvidence::default();
        let report = run(&engine, &evidence, &config());
        assert!(report.accepted);
        assert_eq!(report.turns_used(), 2);
        assert_eq!(evidence.requests()[0].target, "all");
    }

    #[test]
    fn transport_error_forces_generic_request() {
        let engine = ScriptedEngine::new(vec![
            Err(ReasoningError::TimedOut(std::time::Duration::from_secs(1))),
            Ok(EngineReply {
                text: PROPOSE_HIGH.to_string(),
                tokens: 10,
            }),
        ]);
        let evidence = StaticEvidence::default();
        let report = run(&engine, &evidence, &config());
        assert!(report.accepted);
        assert!(report.turns[0].reasoning_output.contains("timed out"));
    }

    #[test]
    fn token_budget_stops_after_the_turn() {
        let engine = ScriptedEngine::new(vec![
            Ok(EngineReply {
                text: REQUEST_FILE.to_string(),
                tokens: 1_001,
            }),
            Ok(EngineReply {
                text: PROPOSE_HIGH.to_string(),
                tokens: 1,
            }),
        ]);
        let evidence = StaticEvidence::default();
        let cfg = InvestigationConfig {
            max_total_tokens: 1_000,
            ..config()
        };
        let report = run(&engine, &evidence, &cfg);
        assert_eq!(report.stop, StopReason::TokenBudget);
        assert_eq!(engine.calls(), 1);
        assert_eq!(report.tokens_used, 1_001);
    }
}
