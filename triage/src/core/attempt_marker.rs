//! Attempt markers embedded in fix-branch commit messages.
//!
//! Every attempt commit carries `Attempt N:` in its title, e.g.
//! `Autonomous Fix Attempt 3: pin cmake to 3.28`. The trailer line
//! `Attempt: 3` is deliberately not a marker (no number before the colon).
//! Body sections use the `**Name:**` heading convention:
//!
//! ```text
//! **Fix Applied:**
//! pin cmake to 3.28
//!
//! **Reasoning:**
//! the runner image ships 3.31 which drops the old policy
//! ```
//!
//! Parsing here is pure and total: malformed or oversized numbers are ignored.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::FixProposal;

static ATTEMPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Attempt (\d+):").expect("attempt marker regex"));

/// Parse the first `Attempt N:` marker in a commit message.
pub fn parse_attempt_number(message: &str) -> Option<u32> {
    ATTEMPT_RE
        .captures_iter(message)
        .find_map(|caps| caps.get(1)?.as_str().parse::<u32>().ok())
}

/// Highest attempt marker across messages; 0 when none carry a marker.
pub fn max_attempt<'a, I>(messages: I) -> u32
where
    I: IntoIterator<Item = &'a str>,
{
    messages
        .into_iter()
        .filter_map(parse_attempt_number)
        .max()
        .unwrap_or(0)
}

/// Commit title for an attempt. Always contains the `Attempt N:` marker.
pub fn attempt_title(attempt: u32, description: &str) -> String {
    let first_line = description.lines().next().unwrap_or("").trim();
    format!("Autonomous Fix Attempt {attempt}: {first_line}")
}

/// Extract a `**Name:**` section body, up to the next heading or `---` rule.
pub fn extract_section(message: &str, name: &str) -> Option<String> {
    let heading = format!("**{name}:**");
    let mut lines = message.lines();
    lines.by_ref().find(|line| line.trim() == heading)?;

    let mut body = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.starts_with("**") || trimmed == "---" {
            break;
        }
        body.push(line);
    }
    let text = body.join("\n").trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Extract an inline `**Name:** value` field.
pub fn extract_field(message: &str, name: &str) -> Option<String> {
    let prefix = format!("**{name}:** ");
    message.lines().find_map(|line| {
        line.trim()
            .strip_prefix(&prefix)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Full commit message for an applied attempt.
///
/// The layout is what [`extract_section`] and [`extract_field`] read back.
pub fn render_attempt_message(
    attempt: u32,
    fix_id: &str,
    engine_variant: &str,
    proposal: &FixProposal,
) -> String {
    let mut msg = attempt_title(attempt, &proposal.description);
    msg.push_str("\n\n**Root Cause Analysis:**\n");
    msg.push_str(proposal.root_cause.trim());
    msg.push_str("\n\n**Fix Applied:**\n");
    msg.push_str(proposal.description.trim());
    msg.push_str("\n\n**Reasoning:**\n");
    msg.push_str(proposal.reasoning.trim());
    msg.push_str(&format!(
        "\n\n**Confidence:** {:.2}\n**Engine Variant:** {engine_variant}\n",
        proposal.confidence
    ));
    msg.push_str(&format!("\n---\nFix ID: {fix_id}\nAttempt: {attempt}\n"));
    msg
}
