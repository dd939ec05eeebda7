//! Deterministic, pure logic shared by the triage pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod attempt_marker;
pub mod budget;
pub mod case;
pub mod coordination;
pub mod excerpt;
pub mod signature;
pub mod turn_parser;
pub mod types;
pub mod variant;
