//! Failure excerpting and coarse error classification for build logs.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::FailureExcerpt;

/// Case-insensitive markers that identify an error line.
const ERROR_MARKERS: &[&str] = &[
    "error:",
    "failed:",
    "cmake error",
    "undefined reference",
    "cannot find",
    "fatal error",
    "compilation terminated",
    "error ",
    "fail ",
    "assertion failed",
    "traceback",
];

static SOURCE_LOCATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.(cpp|cc|cxx|c|h|hpp):").expect("source location regex"));

/// Window sizes for excerpting.
#[derive(Debug, Clone, Copy)]
pub struct ExcerptLimits {
    pub max_excerpt_lines: usize,
    pub context_before: usize,
    pub context_after: usize,
}

/// Excerpt the most relevant region of a build log.
///
/// Uses the window around the last error marker, or the tail of the log when
/// there is none.
pub fn excerpt_log(log: &str, limits: ExcerptLimits) -> FailureExcerpt {
    let lines: Vec<&str> = log.lines().collect();
    let total = lines.len();

    let (start, end, context_type) = match find_last_error(&lines) {
        // The marker line itself is always part of the window.
        Some(idx) => (
            idx.saturating_sub(limits.context_before),
            idx.saturating_add(limits.context_after).max(idx + 1).min(total),
            "error_context",
        ),
        None => (
            total.saturating_sub(limits.max_excerpt_lines),
            total,
            "end_of_log",
        ),
    };

    let excerpt = lines[start..end].join("\n");
    FailureExcerpt {
        error_type: classify_error(&excerpt).to_string(),
        excerpt,
        context_type: context_type.to_string(),
        location: format!("lines {start}-{end} of {total}"),
        total_lines: total,
    }
}

/// Excerpt used when the log could not be read at all.
pub fn unreadable_log(reason: &str) -> FailureExcerpt {
    FailureExcerpt {
        excerpt: format!("ERROR: could not read build log: {reason}"),
        error_type: "log_read_error".to_string(),
        context_type: "error".to_string(),
        location: "unavailable".to_string(),
        total_lines: 0,
    }
}

fn find_last_error(lines: &[&str]) -> Option<usize> {
    lines.iter().rposition(|line| {
        let lower = line.to_lowercase();
        ERROR_MARKERS.iter().any(|marker| lower.contains(marker))
    })
}

/// Classify an excerpt. Most specific categories are checked first.
pub fn classify_error(excerpt: &str) -> &'static str {
    let lower = excerpt.to_lowercase();
    if lower.contains("vcpkg") || lower.contains("triplet") {
        "vcpkg_dependency"
    } else if lower.contains("cmake error") {
        "cmake_configuration"
    } else if lower.contains("undefined reference") || lower.contains("unresolved external") {
        "linker_error"
    } else if SOURCE_LOCATION_RE.is_match(excerpt) {
        "compilation_error"
    } else if (lower.contains("test") || lower.contains("pytest"))
        && (lower.contains("failed") || lower.contains("assertion") || lower.contains("traceback"))
    {
        "test_failure"
    } else if lower.contains("no module named") || lower.contains("importerror") {
        "python_import_error"
    } else if lower.contains("nameerror") || lower.contains("attributeerror") {
        "python_runtime_error"
    } else {
        "unknown"
    }
}
