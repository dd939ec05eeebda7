//! Reasoning-engine abstraction for investigation turns.
//!
//! The [`ReasoningEngine`] trait decouples the investigation loop from the
//! actual backend (a configurable command). Tests use scripted engines that
//! return predetermined replies without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::io::config::VARIANT_PLACEHOLDER;
use crate::io::process::run_command_with_timeout;

/// Rough bytes-per-token ratio used when the backend reports no usage.
const BYTES_PER_TOKEN: u64 = 4;

/// One engine call.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub turn_index: u32,
    /// Engine variant selected for the current attempt.
    pub variant: String,
    pub prompt: String,
}

/// Raw reply plus its token cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineReply {
    pub text: String,
    pub tokens: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ReasoningError {
    #[error("reasoning command could not start: {0}")]
    Spawn(String),
    #[error("reasoning command timed out after {0:?}")]
    TimedOut(Duration),
    #[error("reasoning command failed with status {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("reasoning command returned an empty reply")]
    EmptyReply,
}

/// Abstraction over reasoning backends.
pub trait ReasoningEngine {
    fn propose(&self, request: &TurnRequest) -> Result<EngineReply, ReasoningError>;
}

/// Engine that runs a command with the prompt on stdin and reads stdout.
///
/// `{variant}` in any argument is replaced by the selected variant. Stdout is
/// either the reply text itself or a JSON envelope
/// `{"result": "...", "usage": {"input_tokens": N, "output_tokens": M}}`.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    command: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandEngine {
    pub fn new(
        command: Vec<String>,
        workdir: impl Into<PathBuf>,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            command,
            workdir: workdir.into(),
            timeout,
            output_limit_bytes,
        }
    }

    fn build_command(&self, variant: &str) -> Result<Command, ReasoningError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| ReasoningError::Spawn("empty engine command".to_string()))?;
        let mut cmd = Command::new(program);
        for arg in args {
            cmd.arg(arg.replace(VARIANT_PLACEHOLDER, variant));
        }
        cmd.current_dir(&self.workdir);
        Ok(cmd)
    }
}

impl ReasoningEngine for CommandEngine {
    #[instrument(skip_all, fields(turn = request.turn_index, variant = %request.variant))]
    fn propose(&self, request: &TurnRequest) -> Result<EngineReply, ReasoningError> {
        info!(prompt_bytes = request.prompt.len(), "invoking reasoning engine");
        let cmd = self.build_command(&request.variant)?;
        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .map_err(|e| ReasoningError::Spawn(format!("{e:#}")))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "reasoning engine timed out");
            return Err(ReasoningError::TimedOut(self.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "reasoning engine failed");
            return Err(ReasoningError::Failed {
                code: output.status.code(),
                stderr: output.stderr_text(),
            });
        }

        let reply = decode_reply(&output.stdout_text(), request.prompt.len());
        if reply.text.trim().is_empty() {
            return Err(ReasoningError::EmptyReply);
        }
        debug!(tokens = reply.tokens, reply_bytes = reply.text.len(), "engine replied");
        Ok(reply)
    }
}

#[derive(Deserialize)]
struct Envelope {
    result: String,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

fn decode_reply(stdout: &str, prompt_bytes: usize) -> EngineReply {
    let estimate = |text: &str| (prompt_bytes + text.len()) as u64 / BYTES_PER_TOKEN;
    match serde_json::from_str::<Envelope>(stdout.trim()) {
        Ok(envelope) => {
            let tokens = match envelope.usage {
                Some(usage) => usage.input_tokens + usage.output_tokens,
                None => estimate(&envelope.result),
            };
            EngineReply {
                text: envelope.result,
                tokens,
            }
        }
        Err(_) => EngineReply {
            tokens: estimate(stdout),
            text: stdout.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(command: &[&str]) -> CommandEngine {
        CommandEngine::new(
            command.iter().map(|s| s.to_string()).collect(),
            std::env::temp_dir(),
            Duration::from_secs(5),
            10_000,
        )
    }

    fn request(prompt: &str) -> TurnRequest {
        TurnRequest {
            turn_index: 1,
            variant: "cheap".to_string(),
            prompt: prompt.to_string(),
        }
    }

    #[test]
    fn plain_stdout_is_the_reply() {
        let reply = engine(&["cat"]).propose(&request("hello engine")).expect("reply");
        assert_eq!(reply.text, "hello engine");
        assert_eq!(reply.tokens, 6);
    }

    #[test]
    fn variant_placeholder_is_substituted() {
        let reply = engine(&["echo", "model={variant}"])
            .propose(&request("ignored"))
            .expect("reply");
        assert_eq!(reply.text.trim(), "model=cheap");
    }

    #[test]
    fn envelope_usage_is_reported() {
        let reply = decode_reply(
            r#"{"result":"{\"action\":\"request_more\",\"requests\":[]}","usage":{"input_tokens":120,"output_tokens":30}}"#,
            999,
        );
        assert_eq!(reply.tokens, 150);
        assert!(reply.text.contains("request_more"));
    }

    #[test]
    fn non_zero_exit_is_a_failure() {
        let err = engine(&["sh", "-c", "echo boom >&2; exit 3"])
            .propose(&request("x"))
            .unwrap_err();
        assert!(matches!(err, ReasoningError::Failed { code: Some(3), .. }));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn empty_reply_is_an_error() {
        let err = engine(&["true"]).propose(&request("x")).unwrap_err();
        assert!(matches!(err, ReasoningError::EmptyReply));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let err = engine(&["definitely-not-a-real-engine-xyz"])
            .propose(&request("x"))
            .unwrap_err();
        assert!(matches!(err, ReasoningError::Spawn(_)));
    }
}
