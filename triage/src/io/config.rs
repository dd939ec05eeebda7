//! Triage configuration stored under `.triage/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::excerpt::ExcerptLimits;
use crate::core::variant::VariantPolicy;

pub const DEFAULT_CONFIG_PATH: &str = ".triage/config.toml";

/// Placeholder in `engine.command` replaced by the selected variant.
pub const VARIANT_PLACEHOLDER: &str = "{variant}";

/// Triage configuration (TOML).
///
/// Edited by humans, read once per run, and passed by value into each
/// component. Missing fields default to the values the CI workflow expects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TriageConfig {
    /// Branches named `<prefix><fix id>` belong to the agent.
    pub fix_branch_prefix: String,
    /// Author name on agent commits. Any other author counts as a human.
    pub agent_name: String,
    pub agent_email: String,
    /// Target branch for fix pull requests.
    pub base_branch: String,

    pub escalation: EscalationConfig,
    pub engine: EngineConfig,
    pub investigation: InvestigationConfig,
    pub evidence: EvidenceConfig,
    pub coordination: CoordinationConfig,
    pub log: LogConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EscalationConfig {
    /// The next attempt reaching this number escalates instead of retrying.
    pub threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub cheap_variant: String,
    pub upgraded_variant: String,
    pub cheap_max_attempts: u32,
    pub upgraded_max_attempts: u32,
    /// Reasoning command argv. Prompt goes to stdin, the reply comes back on stdout.
    pub command: Vec<String>,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InvestigationConfig {
    pub max_turns: u32,
    pub max_total_tokens: u64,
    pub confidence_floor: f64,
    pub fallback_confidence: f64,
    pub prompt_budget_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EvidenceConfig {
    pub max_file_bytes: u64,
    /// `owner/name` for remote evidence. Falls back to `GITHUB_REPOSITORY`.
    pub remote_repo: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoordinationConfig {
    pub enabled: bool,
    /// Shared label carried by every coordination record.
    pub label: String,
    pub lookup_attempts: u32,
    pub lookup_backoff_ms: u64,
    pub race_check_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub max_excerpt_lines: usize,
    pub context_before: usize,
    pub context_after: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub engine_secs: u64,
    pub evidence_secs: u64,
    pub tracker_secs: u64,
    pub git_secs: u64,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            fix_branch_prefix: "autonomous-fix-".to_string(),
            agent_name: "Autonomous Agent".to_string(),
            agent_email: "agent@autonomous-fix.local".to_string(),
            base_branch: "main".to_string(),
            escalation: EscalationConfig::default(),
            engine: EngineConfig::default(),
            investigation: InvestigationConfig::default(),
            evidence: EvidenceConfig::default(),
            coordination: CoordinationConfig::default(),
            log: LogConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self { threshold: 7 }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cheap_variant: "claude-sonnet-4-5".to_string(),
            upgraded_variant: "claude-opus-4-1".to_string(),
            cheap_max_attempts: 4,
            upgraded_max_attempts: 6,
            command: vec![
                "claude".to_string(),
                "--print".to_string(),
                "--model".to_string(),
                VARIANT_PLACEHOLDER.to_string(),
            ],
            output_limit_bytes: 200_000,
        }
    }
}

impl Default for InvestigationConfig {
    fn default() -> Self {
        Self {
            max_turns: 5,
            max_total_tokens: 200_000,
            confidence_floor: 0.85,
            fallback_confidence: 0.5,
            prompt_budget_bytes: 60_000,
        }
    }
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 100_000,
            remote_repo: None,
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            label: "autonomous-coordination".to_string(),
            lookup_attempts: 3,
            lookup_backoff_ms: 500,
            race_check_delay_ms: 1_000,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_excerpt_lines: 500,
            context_before: 100,
            context_after: 400,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            engine_secs: 10 * 60,
            evidence_secs: 30,
            tracker_secs: 30,
            git_secs: 10,
        }
    }
}

impl TriageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fix_branch_prefix.trim().is_empty() {
            return Err(anyhow!("fix_branch_prefix must be non-empty"));
        }
        if self.agent_name.trim().is_empty() {
            return Err(anyhow!("agent_name must be non-empty"));
        }
        if self.escalation.threshold == 0 {
            return Err(anyhow!("escalation.threshold must be > 0"));
        }
        self.engine.validate()?;
        let threshold_cap = self.engine.upgraded_max_attempts.saturating_add(1);
        if self.escalation.threshold > threshold_cap {
            return Err(anyhow!(
                "escalation.threshold ({}) must be <= engine.upgraded_max_attempts + 1 ({})",
                self.escalation.threshold,
                threshold_cap
            ));
        }
        self.investigation.validate()?;
        if self.evidence.max_file_bytes == 0 {
            return Err(anyhow!("evidence.max_file_bytes must be > 0"));
        }
        if self.coordination.enabled && self.coordination.label.trim().is_empty() {
            return Err(anyhow!("coordination.label must be non-empty"));
        }
        if self.coordination.lookup_attempts == 0 {
            return Err(anyhow!("coordination.lookup_attempts must be > 0"));
        }
        if self.log.max_excerpt_lines == 0 {
            return Err(anyhow!("log.max_excerpt_lines must be > 0"));
        }
        self.timeouts.validate()
    }

    pub fn variant_policy(&self) -> VariantPolicy {
        VariantPolicy {
            cheap: self.engine.cheap_variant.clone(),
            upgraded: self.engine.upgraded_variant.clone(),
            cheap_max_attempts: self.engine.cheap_max_attempts,
            upgraded_max_attempts: self.engine.upgraded_max_attempts,
        }
    }

    pub fn excerpt_limits(&self) -> ExcerptLimits {
        ExcerptLimits {
            max_excerpt_lines: self.log.max_excerpt_lines,
            context_before: self.log.context_before,
            context_after: self.log.context_after,
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<()> {
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(anyhow!("engine.command must be a non-empty array"));
        }
        if self.cheap_max_attempts == 0 {
            return Err(anyhow!("engine.cheap_max_attempts must be > 0"));
        }
        if self.upgraded_max_attempts < self.cheap_max_attempts {
            return Err(anyhow!(
                "engine.upgraded_max_attempts must be >= engine.cheap_max_attempts"
            ));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("engine.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

impl InvestigationConfig {
    fn validate(&self) -> Result<()> {
        if self.max_turns == 0 {
            return Err(anyhow!("investigation.max_turns must be > 0"));
        }
        if self.max_total_tokens == 0 {
            return Err(anyhow!("investigation.max_total_tokens must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.confidence_floor) {
            return Err(anyhow!("investigation.confidence_floor must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.fallback_confidence) {
            return Err(anyhow!(
                "investigation.fallback_confidence must be within [0, 1]"
            ));
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("investigation.prompt_budget_bytes must be > 0"));
        }
        Ok(())
    }
}

impl TimeoutConfig {
    fn validate(&self) -> Result<()> {
        for (name, secs) in [
            ("engine_secs", self.engine_secs),
            ("evidence_secs", self.evidence_secs),
            ("tracker_secs", self.tracker_secs),
            ("git_secs", self.git_secs),
        ] {
            if secs == 0 {
                return Err(anyhow!("timeouts.{name} must be > 0"));
            }
        }
        Ok(())
    }

    pub fn engine(&self) -> Duration {
        Duration::from_secs(self.engine_secs)
    }

    pub fn evidence(&self) -> Duration {
        Duration::from_secs(self.evidence_secs)
    }

    pub fn tracker(&self) -> Duration {
        Duration::from_secs(self.tracker_secs)
    }

    pub fn git(&self) -> Duration {
        Duration::from_secs(self.git_secs)
    }
}

impl CoordinationConfig {
    pub fn lookup_backoff(&self) -> Duration {
        Duration::from_millis(self.lookup_backoff_ms)
    }

    pub fn race_check_delay(&self) -> Duration {
        Duration::from_millis(self.race_check_delay_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `TriageConfig::default()`.
pub fn load_config(path: &Path) -> Result<TriageConfig> {
    if !path.exists() {
        let cfg = TriageConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: TriageConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &TriageConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
