//! Evidence retrieval for investigation turns.
//!
//! The [`EvidenceBroker`] trait decouples the investigation loop from where
//! context comes from. Every request yields exactly one [`EvidenceResult`];
//! failures are reported through its status and content, never as `Err`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::types::{
    EvidenceKind, EvidenceMetadata, EvidenceRequest, EvidenceResult, EvidenceStatus,
};
use crate::io::gh::Gh;
use crate::io::git::Git;

/// Commits shown for `commit_history` of the whole repository.
pub const HISTORY_ALL_LIMIT: usize = 10;
/// Commits shown for `commit_history` of a single path.
pub const HISTORY_PATH_LIMIT: usize = 5;

/// Abstraction over evidence sources.
pub trait EvidenceBroker {
    /// Fulfill every request, in order.
    fn fetch(&self, requests: &[EvidenceRequest]) -> Vec<EvidenceResult>;
}

/// Where remote raw content is fetched from.
#[derive(Debug, Clone)]
pub struct RemoteSource {
    pub gh: Gh,
    /// Commit the failing build ran on.
    pub commit_sha: String,
}

/// Broker backed by the local checkout, `git`, and optionally `gh`.
#[derive(Debug, Clone)]
pub struct LocalEvidenceBroker {
    root: PathBuf,
    git: Git,
    max_file_bytes: u64,
    remote: Option<RemoteSource>,
}

impl LocalEvidenceBroker {
    pub fn new(
        root: &Path,
        git: Git,
        max_file_bytes: u64,
        remote: Option<RemoteSource>,
    ) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("resolve repository root {}", root.display()))?;
        Ok(Self {
            root,
            git,
            max_file_bytes,
            remote,
        })
    }

    fn fetch_one(&self, request: &EvidenceRequest) -> EvidenceResult {
        match request.kind {
            EvidenceKind::File => self.fetch_file(request),
            EvidenceKind::RemoteFile => self.fetch_remote(request),
            EvidenceKind::CommitHistory => self.fetch_history(request),
        }
    }

    fn fetch_file(&self, request: &EvidenceRequest) -> EvidenceResult {
        let target = request.target.trim();
        let resolved = match self.root.join(target).canonicalize() {
            Ok(path) => path,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return EvidenceResult::for_request(
                    request,
                    EvidenceStatus::NotFound,
                    format!("File not found: {target}"),
                );
            }
            Err(err) => {
                return EvidenceResult::for_request(
                    request,
                    EvidenceStatus::Error,
                    format!("Path resolution error: {err}"),
                );
            }
        };
        if !resolved.starts_with(&self.root) {
            warn!(target, "refused path outside repository");
            return EvidenceResult::for_request(
                request,
                EvidenceStatus::Error,
                format!("Path outside repository: {target}"),
            );
        }
        if resolved.is_dir() {
            return EvidenceResult::for_request(
                request,
                EvidenceStatus::Error,
                format!("{target} is a directory; request a file inside it"),
            );
        }

        let size = match fs::metadata(&resolved) {
            Ok(meta) => meta.len(),
            Err(err) => {
                return EvidenceResult::for_request(
                    request,
                    EvidenceStatus::Error,
                    format!("Error reading file metadata: {err}"),
                );
            }
        };
        if size > self.max_file_bytes {
            return too_large(request, size, self.max_file_bytes);
        }

        match fs::read(&resolved) {
            Ok(bytes) => success(request, String::from_utf8_lossy(&bytes).into_owned()),
            Err(err) => EvidenceResult::for_request(
                request,
                EvidenceStatus::Error,
                format!("Error reading file: {err}"),
            ),
        }
    }

    fn fetch_remote(&self, request: &EvidenceRequest) -> EvidenceResult {
        let Some(remote) = &self.remote else {
            return EvidenceResult::for_request(
                request,
                EvidenceStatus::Error,
                "Remote evidence unavailable: no repository or commit configured",
            );
        };
        let target = request.target.trim();
        if Path::new(target)
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return EvidenceResult::for_request(
                request,
                EvidenceStatus::Error,
                format!("Path outside repository: {target}"),
            );
        }

        match remote.gh.raw_file(target, &remote.commit_sha) {
            Ok(content) => {
                let size = content.len() as u64;
                if size > self.max_file_bytes {
                    return too_large(request, size, self.max_file_bytes);
                }
                success(request, content)
            }
            Err(err) if err.is_not_found() => EvidenceResult::for_request(
                request,
                EvidenceStatus::NotFound,
                format!("File not found at {}: {target}", remote.commit_sha),
            ),
            Err(err) => EvidenceResult::for_request(
                request,
                EvidenceStatus::Error,
                format!("Remote fetch failed: {err}"),
            ),
        }
    }

    fn fetch_history(&self, request: &EvidenceRequest) -> EvidenceResult {
        let target = request.target.trim();
        let result = if target.is_empty() || target == "all" {
            self.git.log_oneline(HISTORY_ALL_LIMIT, None)
        } else {
            self.git.log_oneline(HISTORY_PATH_LIMIT, Some(target))
        };
        match result {
            Ok(log) if log.trim().is_empty() => EvidenceResult::for_request(
                request,
                EvidenceStatus::NotFound,
                format!("No commits found for {target}"),
            ),
            Ok(log) => success(request, log),
            Err(err) => EvidenceResult::for_request(
                request,
                EvidenceStatus::Error,
                format!("Git command failed: {err:#}"),
            ),
        }
    }
}

impl EvidenceBroker for LocalEvidenceBroker {
    #[instrument(skip_all, fields(count = requests.len()))]
    fn fetch(&self, requests: &[EvidenceRequest]) -> Vec<EvidenceResult> {
        requests
            .iter()
            .map(|request| {
                let result = self.fetch_one(request);
                debug!(
                    kind = request.kind.as_str(),
                    target = %request.target,
                    status = result.status.as_str(),
                    "fetched evidence"
                );
                result
            })
            .collect()
    }
}

fn success(request: &EvidenceRequest, content: String) -> EvidenceResult {
    let metadata = EvidenceMetadata {
        size_bytes: content.len() as u64,
        lines: content.lines().count(),
    };
    EvidenceResult::for_request(request, EvidenceStatus::Success, content).with_metadata(metadata)
}

fn too_large(request: &EvidenceRequest, size: u64, limit: u64) -> EvidenceResult {
    EvidenceResult::for_request(
        request,
        EvidenceStatus::TooLarge,
        format!(
            "File too large: {size} bytes (max: {limit})\n\
             Request a narrower target, such as a smaller file or a specific subdirectory file."
        ),
    )
}

/// Render the evidence history of one investigation for the prompt.
pub fn format_evidence_history(results: &[EvidenceResult]) -> String {
    if results.is_empty() {
        return "*(No previous requests)*".to_string();
    }
    results
        .iter()
        .enumerate()
        .map(|(i, result)| format_evidence_entry(i + 1, result))
        .collect::<Vec<_>>()
        .join("\n")
}

fn entry_header(number: usize, result: &EvidenceResult) -> String {
    format!(
        "### Request {number}: {} - `{}`\n\n",
        result.kind.as_str(),
        result.target
    )
}

/// One numbered request and its result.
pub fn format_evidence_entry(number: usize, result: &EvidenceResult) -> String {
    let mut out = entry_header(number, result);
    let reason = if result.reason.is_empty() {
        "N/A"
    } else {
        &result.reason
    };
    out.push_str(&format!("**Reason:** {reason}\n"));
    out.push_str(&format!("**Status:** {}\n\n", result.status.as_str()));
    match result.status {
        EvidenceStatus::Success => {
            if let Some(meta) = &result.metadata {
                out.push_str(&format!(
                    "**Metadata:** {} bytes, {} lines\n\n",
                    meta.size_bytes, meta.lines
                ));
            }
            out.push_str(&format!("**Content:**\n```\n{}\n```\n", result.content));
        }
        _ => out.push_str(&format!("**Error:** {}\n", result.content)),
    }
    out
}

/// Placeholder for an entry whose content no longer fits the prompt.
pub fn format_omitted_entry(number: usize, result: &EvidenceResult) -> String {
    let mut out = entry_header(number, result);
    out.push_str(&format!(
        "**Status:** {} (content omitted from this prompt)\n",
        result.status.as_str()
    ));
    out
}
