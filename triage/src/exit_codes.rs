//! Stable exit codes for triage CLI commands.

/// Command succeeded, or the run produced a successful outcome.
pub const OK: i32 = 0;
/// Invalid config or arguments, or the run produced an `error` outcome.
pub const ERROR: i32 = 1;
