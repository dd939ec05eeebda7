//! Interpretation of raw reasoning-engine replies as turn results.
//!
//! The engine is asked for one JSON object per turn. Replies may wrap it in a
//! fenced ```` ```json ```` block or surround it with prose; the first fenced
//! block wins, otherwise the outermost `{...}` span is used. The object must
//! conform to `schemas/turn_result.schema.json` before it is deserialized.

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Draft, Validator};
use serde::Deserialize;
use serde_json::Value;

use crate::core::types::{EvidenceRequest, FileChange, FixProposal, TurnResult};

pub const TURN_RESULT_SCHEMA: &str = include_str!("../../schemas/turn_result.schema.json");

static TURN_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(TURN_RESULT_SCHEMA).expect("turn result schema should be json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("turn result schema should compile")
});

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum WireTurn {
    RequestMore {
        requests: Vec<EvidenceRequest>,
    },
    ProposeFix {
        confidence: f64,
        root_cause: String,
        reasoning: String,
        #[serde(default)]
        description: Option<String>,
        file_changes: Vec<FileChange>,
    },
}

/// Parse a raw engine reply into a [`TurnResult`].
///
/// Errors describe why the reply is a protocol violation; callers recover by
/// forcing another turn.
pub fn parse_turn_reply(reply: &str) -> Result<TurnResult> {
    let json = extract_json_object(reply).ok_or_else(|| anyhow!("no json object in reply"))?;
    let value: Value = serde_json::from_str(json).context("parse turn json")?;

    let messages: Vec<String> = TURN_VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("turn result failed schema:\n- {}", messages.join("\n- "));
    }

    let wire: WireTurn = serde_json::from_value(value).context("decode turn result")?;
    Ok(match wire {
        WireTurn::RequestMore { requests } => TurnResult::RequestMore { requests },
        WireTurn::ProposeFix {
            confidence,
            root_cause,
            reasoning,
            description,
            file_changes,
        } => {
            let description = description
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| first_line(&root_cause));
            TurnResult::ProposeFix(FixProposal {
                confidence,
                root_cause,
                reasoning,
                description,
                file_changes,
            })
        }
    })
}

fn extract_json_object(reply: &str) -> Option<&str> {
    if let Some(start) = reply.find("```json") {
        let body = &reply[start + "```json".len()..];
        let end = body.find("```")?;
        return Some(body[..end].trim());
    }
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or("").trim().to_string()
}
