//! Thin wrapper around the `gh` CLI.
//!
//! Remote evidence, the coordination tracker, and pull-request/issue creation
//! all go through `gh`, which already carries the CI credentials.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};

const OUTPUT_LIMIT_BYTES: usize = 8 * 1024 * 1024;

/// Failure of a single `gh` invocation.
#[derive(Debug, thiserror::Error)]
pub enum GhError {
    #[error("gh {command} timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },
    #[error("gh {command} failed: {stderr}")]
    Failed { command: String, stderr: String },
    #[error("gh {command} could not run: {cause:#}")]
    Spawn {
        command: String,
        cause: anyhow::Error,
    },
}

impl GhError {
    /// True when the API answered 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GhError::Failed { stderr, .. }
            if stderr.contains("404") || stderr.contains("Not Found"))
    }
}

#[derive(Debug, Clone)]
pub struct Gh {
    /// `owner/name`; when `None`, `gh api` infers it from the workdir remote.
    repo: Option<String>,
    workdir: PathBuf,
    timeout: Duration,
}

impl Gh {
    pub fn new(repo: Option<String>, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            repo,
            workdir: workdir.into(),
            timeout,
        }
    }

    /// `owner/name` for REST paths; `gh api` expands the placeholders itself.
    pub fn repo_path(&self) -> &str {
        self.repo.as_deref().unwrap_or("{owner}/{repo}")
    }

    /// Run `gh <args>` in the workdir and return stdout.
    pub fn run(&self, args: &[&str]) -> Result<String, GhError> {
        let command = command_label(args);
        let mut cmd = Command::new("gh");
        cmd.args(args).current_dir(&self.workdir);
        debug!(command = %command, "running gh");
        let output = run_command_with_timeout(cmd, None, self.timeout, OUTPUT_LIMIT_BYTES)
            .map_err(|cause| GhError::Spawn {
                command: command.clone(),
                cause,
            })?;
        check(command, output, self.timeout)
    }

    /// Run and decode stdout as JSON.
    pub fn run_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let stdout = self.run(args)?;
        serde_json::from_str(&stdout)
            .with_context(|| format!("parse gh {} output", command_label(args)))
    }

    /// Raw file content at `git_ref` via the contents API.
    pub fn raw_file(&self, path: &str, git_ref: &str) -> Result<String, GhError> {
        let endpoint = format!(
            "repos/{}/contents/{}?ref={git_ref}",
            self.repo_path(),
            path.trim_start_matches('/')
        );
        self.run(&["api", "-H", "Accept: application/vnd.github.raw", &endpoint])
    }
}

fn check(command: String, output: CommandOutput, timeout: Duration) -> Result<String, GhError> {
    if output.timed_out {
        warn!(command = %command, "gh timed out");
        return Err(GhError::TimedOut { command, timeout });
    }
    if !output.status.success() {
        let stderr = output.stderr_text();
        return Err(GhError::Failed { command, stderr });
    }
    Ok(output.stdout_text())
}

/// Short form of the argv for logs and errors; field values are omitted.
fn command_label(args: &[&str]) -> String {
    args.iter()
        .take_while(|arg| !matches!(**arg, "-f" | "-F" | "--input"))
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_label_omits_field_values() {
        let label = command_label(&["api", "-X", "POST", "repos/o/r/issues", "-f", "body=long"]);
        assert_eq!(label, "api -X POST repos/o/r/issues");
    }

    #[test]
    fn not_found_is_detected_from_stderr() {
        let err = GhError::Failed {
            command: "api x".to_string(),
            stderr: "gh: Not Found (HTTP 404)".to_string(),
        };
        assert!(err.is_not_found());
        let err = GhError::Failed {
            command: "api x".to_string(),
            stderr: "HTTP 500".to_string(),
        };
        assert!(!err.is_not_found());
    }
}
