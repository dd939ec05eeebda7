//! Reading captured build logs into classified excerpts.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::core::excerpt::{ExcerptLimits, excerpt_log, unreadable_log};
use crate::core::types::FailureExcerpt;

/// Excerpt the log at `path`. An unreadable or missing log still yields an
/// excerpt, classified `log_read_error`.
pub fn read_failure_excerpt(path: Option<&Path>, limits: ExcerptLimits) -> FailureExcerpt {
    let Some(path) = path else {
        return unreadable_log("no failure log provided");
    };
    match fs::read(path) {
        Ok(bytes) => {
            let excerpt = excerpt_log(&String::from_utf8_lossy(&bytes), limits);
            debug!(
                path = %path.display(),
                error_type = %excerpt.error_type,
                location = %excerpt.location,
                "extracted failure excerpt"
            );
            excerpt
        }
        Err(err) => {
            warn!(path = %path.display(), err = %err, "failed to read build log");
            unreadable_log(&format!("{}: {err}", path.display()))
        }
    }
}
