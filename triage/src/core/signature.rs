//! Stable error signatures for deduplicating failures across build flavors.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Hex characters kept from the SHA-256 digest.
pub const SIGNATURE_LEN: usize = 16;

static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}(?:[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?)?")
        .expect("timestamp regex")
});
static CLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,2}:\d{2}:\d{2}(?:\.\d+)?\b").expect("clock regex"));
static IPV4_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}(?::\d{1,5})?\b").expect("ipv4 regex")
});
static PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:[A-Za-z]:)?[/\\](?:[\w.\-]+[/\\])+([\w.\-]+)").expect("path regex")
});
static HEX_ADDR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0x[0-9a-fA-F]+\b").expect("hex address regex"));

/// Mask volatile tokens so the same failure on different hosts normalizes equal.
///
/// Timestamps, clock times, IPv4 addresses, and hex addresses become
/// placeholders; absolute paths collapse to `<PATH>/<file name>`.
pub fn normalize_error_text(text: &str) -> String {
    let text = TIMESTAMP_RE.replace_all(text, "<DATE>");
    let text = CLOCK_RE.replace_all(&text, "<TIME>");
    let text = IPV4_RE.replace_all(&text, "<IP>");
    let text = PATH_RE.replace_all(&text, "<PATH>/$1");
    let text = HEX_ADDR_RE.replace_all(&text, "<ADDR>");
    text.lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// SHA-256 of the normalized text, truncated to [`SIGNATURE_LEN`] hex chars.
pub fn error_signature(excerpt: &str) -> String {
    let normalized = normalize_error_text(excerpt);
    let digest = Sha256::digest(normalized.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(SIGNATURE_LEN);
    hex
}
