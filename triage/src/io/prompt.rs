//! Turn prompt builder for the reasoning engine.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::types::{AttemptRecord, EvidenceResult, FailureExcerpt};
use crate::io::evidence::{format_evidence_entry, format_evidence_history, format_omitted_entry};

const INVESTIGATION_TEMPLATE: &str = include_str!("prompts/investigation.md");

/// Droppable sections, least critical first.
const DROP_ORDER: &[&str] = &["previous"];

const TRUNCATION_MARK: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section marker regex")
});

/// Everything one turn prompt is rendered from.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub attempt: u32,
    pub turn: u32,
    pub max_turns: u32,
    /// True when the upgraded engine variant serves this attempt.
    pub upgraded: bool,
    pub flavor: Option<&'a str>,
    pub confidence_floor: f64,
    pub failure: &'a FailureExcerpt,
    pub previous: &'a [AttemptRecord],
    /// Evidence gathered so far in this investigation, oldest first.
    pub evidence: &'a [EvidenceResult],
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Parse sections using `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();

    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let required = kind.as_str() == "required";
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());

        let content = rendered[whole.end()..end].trim().to_string();
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }

    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

/// Drop droppable sections in [`DROP_ORDER`] until the prompt fits.
fn drop_sections_for_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == *key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }
}

/// Truncate the last section so the prompt fits.
fn truncate_last_for_budget(sections: &mut [ParsedSection], budget: usize) {
    if total_len(sections) <= budget {
        return;
    }
    let Some((last, rest)) = sections.split_last_mut() else {
        return;
    };
    let allowed = budget.saturating_sub(total_len(rest));
    let before_len = last.content.len();
    if before_len > allowed {
        if allowed > TRUNCATION_MARK.len() {
            truncate_on_char_boundary(&mut last.content, allowed - TRUNCATION_MARK.len());
            last.content.push_str(TRUNCATION_MARK);
        } else {
            truncate_on_char_boundary(&mut last.content, allowed);
        }
        debug!(
            section = %last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

/// Render evidence within `max_bytes`, newest entries first: whole entries
/// while they fit, the newest capped when it alone is too large, and older
/// entries reduced to a header.
fn fit_evidence(results: &[EvidenceResult], max_bytes: usize) -> String {
    let mut kept: Vec<String> = Vec::new();
    let mut used = 0;
    for (i, result) in results.iter().enumerate().rev() {
        let number = i + 1;
        let full = format_evidence_entry(number, result);
        let entry = if used + full.len() < max_bytes {
            Some(full)
        } else if kept.is_empty() {
            Some(capped_entry(number, result, max_bytes))
        } else {
            let stub = format_omitted_entry(number, result);
            (used + stub.len() < max_bytes).then_some(stub)
        };
        if let Some(entry) = entry {
            used += entry.len() + 1;
            kept.push(entry);
        }
    }
    kept.reverse();
    kept.join("\n").trim().to_string()
}

fn capped_entry(number: usize, result: &EvidenceResult, max_bytes: usize) -> String {
    let empty = EvidenceResult {
        content: String::new(),
        ..result.clone()
    };
    let overhead = format_evidence_entry(number, &empty).len() + TRUNCATION_MARK.len();
    let mut content = result.content.clone();
    truncate_on_char_boundary(&mut content, max_bytes.saturating_sub(overhead));
    content.push_str(TRUNCATION_MARK);
    format_evidence_entry(number, &EvidenceResult { content, ..empty })
}

fn truncate_on_char_boundary(text: &mut String, max: usize) {
    let mut cut = max.min(text.len());
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds turn prompts within a byte budget, dropping less critical sections first.
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("investigation", INVESTIGATION_TEMPLATE)
            .context("load investigation template")?;
        Ok(Self { env, budget_bytes })
    }

    pub fn build(&self, input: &PromptInputs<'_>) -> Result<String> {
        let evidence = (!input.evidence.is_empty())
            .then(|| format_evidence_history(input.evidence).trim().to_string());
        let mut sections = self.render(input, evidence.as_deref())?;
        drop_sections_for_budget(&mut sections, self.budget_bytes);

        if let Some(full) = &evidence
            && total_len(&sections) > self.budget_bytes
            && let Some(idx) = sections.iter().position(|s| s.key == "evidence")
        {
            let others = total_len(&sections) - sections[idx].content.len();
            let wrapper = sections[idx].content.len().saturating_sub(full.len());
            let allowed = self.budget_bytes.saturating_sub(others + wrapper);
            let fitted = fit_evidence(input.evidence, allowed);
            sections[idx].content = sections[idx].content.replacen(full.as_str(), &fitted, 1);
            debug!(
                entries = input.evidence.len(),
                before_len = full.len(),
                after_len = fitted.len(),
                "fitted evidence to budget"
            );
        }

        truncate_last_for_budget(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }

    fn render(
        &self,
        input: &PromptInputs<'_>,
        evidence: Option<&str>,
    ) -> Result<Vec<ParsedSection>> {
        let template = self.env.get_template("investigation")?;
        let rendered = template
            .render(context! {
                attempt => input.attempt,
                turn => input.turn,
                max_turns => input.max_turns,
                upgraded => input.upgraded,
                flavor => input.flavor,
                confidence_floor => input.confidence_floor,
                failure => input.failure,
                previous => input.previous,
                evidence => evidence,
            })
            .context("render investigation prompt")?;
        Ok(parse_sections(&rendered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{EvidenceKind, EvidenceMetadata, EvidenceRequest, EvidenceStatus};

    fn failure() -> FailureExcerpt {
        FailureExcerpt {
            excerpt: "base/frame.h:12: error: 'uint8_t' does not name a type".to_string(),
            error_type: "compilation_error".to_string(),
            context_type: "error_context".to_string(),
            location: "lines 0-1 of 1".to_string(),
            total_lines: 1,
        }
    }

    fn previous() -> Vec<AttemptRecord> {
        vec![AttemptRecord {
            attempt_number: 1,
            commit_ref: "a1b2c3d4".to_string(),
            author_identity: "Autonomous Agent".to_string(),
            summary_text: "Autonomous Fix Attempt 1: pin compiler".to_string(),
            fix_applied: Some("pin compiler".to_string()),
            reasoning: Some("newer gcc is stricter".to_string()),
        }]
    }

    fn file_result(target: &str, content: &str) -> EvidenceResult {
        let request = EvidenceRequest {
            kind: EvidenceKind::File,
            target: target.to_string(),
            reason: "check includes".to_string(),
        };
        EvidenceResult::for_request(&request, EvidenceStatus::Success, content).with_metadata(
            EvidenceMetadata {
                size_bytes: content.len() as u64,
                lines: content.lines().count(),
            },
        )
    }

    fn inputs<'a>(
        failure: &'a FailureExcerpt,
        previous: &'a [AttemptRecord],
        evidence: &'a [EvidenceResult],
    ) -> PromptInputs<'a> {
        PromptInputs {
            attempt: 2,
            turn: 1,
            max_turns: 5,
            upgraded: false,
            flavor: Some("linux-x64"),
            confidence_floor: 0.85,
            failure,
            previous,
            evidence,
        }
    }

    /// Order matters for prompt consistency: contract -> turn -> failure ->
    /// previous -> evidence.
    #[test]
    fn prompt_ordering_is_stable() {
        let failure = failure();
        let previous = previous();
        let evidence = [file_result("a.h", "int x;")];
        let prompt = PromptBuilder::new(50_000)
            .expect("builder")
            .build(&inputs(&failure, &previous, &evidence))
            .expect("build");

        let contract = prompt.find("### Investigation Contract").expect("contract");
        let turn = prompt.find("### Turn").expect("turn");
        let failure_pos = prompt.find("### Failure").expect("failure");
        let previous_pos = prompt.find("### Previous Attempts").expect("previous");
        let evidence = prompt.find("### Evidence").expect("evidence");
        assert!(contract < turn);
        assert!(turn < failure_pos);
        assert!(failure_pos < previous_pos);
        assert!(previous_pos < evidence);
        assert!(prompt.contains("Attempt 2, turn 1 of 5."));
        assert!(prompt.contains("pin compiler"));
        assert!(prompt.contains("below confidence 0.85"));
        assert!(!prompt.contains("<!-- section"));
    }

    #[test]
    fn empty_optional_sections_are_omitted() {
        let failure = failure();
        let prompt = PromptBuilder::new(50_000)
            .expect("builder")
            .build(&inputs(&failure, &[], &[]))
            .expect("build");
        assert!(!prompt.contains("### Previous Attempts"));
        assert!(!prompt.contains("### Evidence"));
    }

    #[test]
    fn budget_drops_previous_attempts_then_caps_the_only_evidence() {
        let failure = failure();
        let previous = previous();
        let evidence = [file_result("big.cc", &"x".repeat(20_000))];
        let prompt = PromptBuilder::new(4_000)
            .expect("builder")
            .build(&inputs(&failure, &previous, &evidence))
            .expect("build");
        assert!(!prompt.contains("### Previous Attempts"));
        assert!(prompt.contains("### Investigation Contract"));
        assert!(prompt.contains("### Failure"));
        assert!(prompt.contains("### Request 1: file - `big.cc`"));
        assert!(prompt.contains("**Metadata:** 20000 bytes"));
        assert!(prompt.contains("[truncated]"));
        assert!(prompt.ends_with("</evidence>"));
        assert!(prompt.len() <= 4_000 + 2 * 4);
    }

    #[test]
    fn newest_evidence_survives_a_large_earlier_file() {
        let failure = failure();
        let evidence = [
            file_result("big.cc", &"y".repeat(77_000)),
            file_result("second.h", "#define FRAME_ALIGN 16"),
        ];
        let prompt = PromptBuilder::new(60_000)
            .expect("builder")
            .build(&inputs(&failure, &[], &evidence))
            .expect("build");
        assert!(prompt.len() <= 60_000 + 2 * 4, "{}", prompt.len());
        assert!(prompt.contains("### Request 2: file - `second.h`"));
        assert!(prompt.contains("#define FRAME_ALIGN 16"));
        assert!(prompt.contains("### Request 1: file - `big.cc`"));
        assert!(prompt.contains("content omitted from this prompt"));
        assert!(!prompt.contains("yyyy"));
    }

    #[test]
    fn fit_evidence_keeps_everything_that_fits() {
        let evidence = [file_result("a.h", "int a;"), file_result("b.h", "int b;")];
        let fitted = fit_evidence(&evidence, 10_000);
        assert_eq!(fitted, format_evidence_history(&evidence).trim());
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        let mut text = "ééééé".to_string();
        truncate_on_char_boundary(&mut text, 3);
        assert_eq!(text, "é");
    }
}
