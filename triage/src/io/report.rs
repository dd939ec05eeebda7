//! Run outcome artifact consumed by the CI workflow.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::core::types::RunOutcome;

pub const DEFAULT_OUTCOME_PATH: &str = "agent-result.json";

/// Write the outcome as pretty JSON with a trailing newline (temp file + rename).
pub fn write_outcome(path: &Path, outcome: &RunOutcome) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(outcome).context("serialize outcome")?;
    payload.push('\n');
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload)
        .with_context(|| format!("write temp outcome {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace outcome {}", path.display()))?;
    Ok(())
}

/// One-line human summary printed after a run.
pub fn summary_line(outcome: &RunOutcome) -> String {
    let mut line = format!(
        "{} (attempt {}, engine {}, confidence {:.2}, turns {})",
        outcome.action_taken.as_str(),
        outcome.attempt,
        outcome.engine_variant,
        outcome.confidence,
        outcome.turns_used
    );
    if let Some(branch) = &outcome.branch_name {
        line.push_str(&format!(" branch={branch}"));
    }
    if let Some(url) = &outcome.pr_url {
        line.push_str(&format!(" url={url}"));
    }
    if let Some(err) = &outcome.error_message {
        line.push_str(&format!(" error={err}"));
    }
    line
}
