//! Reasoning-engine variant selection by attempt number.

use anyhow::{Result, bail};

/// Monotone step function from attempt number to engine variant.
///
/// Attempts `1..=cheap_max_attempts` use the cheap variant, attempts up to
/// `upgraded_max_attempts` use the upgraded one, and anything past that is an
/// error: escalation must have fired first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantPolicy {
    pub cheap: String,
    pub upgraded: String,
    pub cheap_max_attempts: u32,
    pub upgraded_max_attempts: u32,
}

impl VariantPolicy {
    pub fn variant_for_attempt(&self, attempt: u32) -> Result<&str> {
        if attempt == 0 {
            bail!("attempt numbers start at 1");
        }
        if attempt <= self.cheap_max_attempts {
            return Ok(&self.cheap);
        }
        if attempt <= self.upgraded_max_attempts {
            return Ok(&self.upgraded);
        }
        bail!(
            "attempt {attempt} exceeds max attempts ({}); escalate instead",
            self.upgraded_max_attempts
        )
    }

    /// True when `attempt` is served by the upgraded variant.
    pub fn is_upgraded(&self, attempt: u32) -> bool {
        attempt > self.cheap_max_attempts && attempt <= self.upgraded_max_attempts
    }
}
