//! Failed-build triage for CI.
//!
//! A run takes one build event, decides which case it belongs to, and drives
//! that case to a single [`core::types::RunOutcome`]. The crate keeps a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (case routing, attempt markers,
//!   budgets, coordination records). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (`git`, `gh`, the reasoning command,
//!   the filesystem), each behind a trait so tests can substitute doubles.
//!
//! The top-level modules ([`orchestrator`], [`investigation`], [`gate`],
//! [`ledger`]) coordinate core logic with I/O.

pub mod core;
pub mod exit_codes;
pub mod gate;
pub mod investigation;
pub mod io;
pub mod ledger;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
