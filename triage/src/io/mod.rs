//! I/O adapters: subprocesses, the filesystem, and the forge.

pub mod config;
pub mod evidence;
pub mod failure_log;
pub mod gh;
pub mod git;
pub mod process;
pub mod prompt;
pub mod publisher;
pub mod reasoning;
pub mod report;
pub mod tracker;
