//! Core types for media-relay

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::error::{Error, ErrorKind, Result};

/// Number of hex characters kept from the derived id digest
const DERIVED_ID_LEN: usize = 16;

/// Maximum length of an explicit id taken from the manifest
const MAX_EXPLICIT_ID_LEN: usize = 64;

/// Stable identifier of a work item
///
/// Either derived from the manifest entry (so the same entry always maps to the
/// same scratch files and remote key) or taken verbatim from an explicit `id`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(String);

impl WorkItemId {
    /// Derive an id from the fields that define a unit of work
    pub fn derive(source_url: &str, destination: &str, profile: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source_url.as_bytes());
        hasher.update([0u8]);
        hasher.update(destination.as_bytes());
        hasher.update([0u8]);
        hasher.update(profile.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self(digest[..DERIVED_ID_LEN].to_string())
    }

    /// Accept an explicit id from the manifest
    ///
    /// Ids end up in file names and object keys, so only `[A-Za-z0-9_-]` is allowed.
    pub fn explicit(id: &str) -> Result<Self> {
        let valid = !id.is_empty()
            && id.len() <= MAX_EXPLICIT_ID_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::Manifest(format!(
                "invalid item id {id:?}: use 1-{MAX_EXPLICIT_ID_LEN} characters from [A-Za-z0-9_-]"
            )));
        }
        Ok(Self(id.to_string()))
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Work item status
///
/// Statuses only move forward along Pending → Fetched → Processed → Uploaded,
/// or sideways into Failed. Uploaded and Failed are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Not started yet
    Pending,
    /// Source downloaded into scratch
    Fetched,
    /// Processed artifact ready
    Processed,
    /// Artifact confirmed at the destination
    Uploaded,
    /// Terminal failure
    Failed,
}

impl Status {
    /// Whether no further transitions are allowed
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Uploaded | Status::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Status::Pending => 0,
            Status::Fetched => 1,
            Status::Processed => 2,
            Status::Uploaded => 3,
            Status::Failed => 4,
        }
    }

    /// Whether moving from `self` to `next` keeps the status monotonic
    pub fn can_transition_to(self, next: Status) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Status::Failed => true,
            Status::Pending => false,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Fetched => "fetched",
            Status::Processed => "processed",
            Status::Uploaded => "uploaded",
            Status::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Pipeline stage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Download into scratch
    Fetch,
    /// External tool processing
    Process,
    /// Push to destination
    Upload,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Fetch => "fetch",
            Stage::Process => "process",
            Stage::Upload => "upload",
        };
        f.write_str(s)
    }
}

/// How the source should be retrieved
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// Pick yt-dlp for known video-site hosts, plain HTTP otherwise
    #[default]
    Auto,
    /// Plain HTTP(S) GET
    Http,
    /// Delegate to the yt-dlp binary
    YtDlp,
}

/// One unit of work carried through fetch, process and upload
#[derive(Clone, Debug)]
pub struct WorkItem {
    /// Stable identifier
    pub id: WorkItemId,
    /// Source URL as given in the manifest
    pub source_url: String,
    /// Destination target (key prefix ending in `/`, or exact key)
    pub destination: String,
    /// Processing profile name
    pub profile: String,
    /// How to fetch the source
    pub source_kind: SourceKind,
    /// Expected SHA-256 of the source, lowercase hex
    pub expected_sha256: Option<String>,
    /// Expected source size in bytes
    pub expected_size: Option<u64>,
    /// Current local artifact, if any
    pub scratch_path: Option<PathBuf>,
    status: Status,
}

impl WorkItem {
    /// Create a pending work item
    pub fn new(
        id: WorkItemId,
        source_url: impl Into<String>,
        destination: impl Into<String>,
        profile: impl Into<String>,
    ) -> Self {
        Self {
            id,
            source_url: source_url.into(),
            destination: destination.into(),
            profile: profile.into(),
            source_kind: SourceKind::Auto,
            expected_sha256: None,
            expected_size: None,
            scratch_path: None,
            status: Status::Pending,
        }
    }

    /// Current status
    pub fn status(&self) -> Status {
        self.status
    }

    /// Move to `next`, rejecting backward or post-terminal transitions
    pub fn transition(&mut self, next: Status) -> Result<Status> {
        let from = self.status;
        if !from.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                id: self.id.clone(),
                from,
                to: next,
            });
        }
        self.status = next;
        Ok(from)
    }
}

/// Outcome of a successful fetch
#[derive(Clone, Debug, Serialize)]
pub struct FetchResult {
    /// Scratch file holding the source bytes
    pub local_path: PathBuf,
    /// Number of bytes written
    pub size_bytes: u64,
    /// SHA-256 of the bytes, lowercase hex
    pub sha256: String,
    /// MD5 of the bytes, lowercase hex
    pub md5: String,
    /// Content type reported by the source, if any
    pub content_type: Option<String>,
    /// Attempts it took, filled in by the retry loop
    pub attempts: u32,
}

/// Format details of a processed artifact
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FormatMetadata {
    /// Profile that produced the artifact
    pub profile: String,
    /// File extension without the dot
    pub extension: String,
    /// MIME type sent to the destination
    pub content_type: String,
    /// Artifact size in bytes
    pub size_bytes: u64,
}

/// Outcome of a successful processing step
#[derive(Clone, Debug, Serialize)]
pub struct ProcessResult {
    /// Scratch file holding the artifact
    pub output_path: PathBuf,
    /// Format details
    pub format: FormatMetadata,
}

/// Proof that the destination holds the artifact
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    /// Remote identifier (object key)
    pub remote_id: String,
    /// ETag reported by the destination, if any
    pub etag: Option<String>,
    /// SHA-256 of the uploaded bytes, lowercase hex
    pub sha256: String,
    /// Uploaded size in bytes
    pub size_bytes: u64,
}

/// Event emitted during a run
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Item accepted from the manifest
    Queued {
        /// Item id
        id: WorkItemId,
        /// Source URL
        url: String,
    },

    /// Stage started for an item
    StageStarted {
        /// Item id
        id: WorkItemId,
        /// Stage
        stage: Stage,
    },

    /// Item status changed
    StatusChanged {
        /// Item id
        id: WorkItemId,
        /// Previous status
        from: Status,
        /// New status
        to: Status,
    },

    /// A stage attempt failed and will be retried
    RetryScheduled {
        /// Item id
        id: WorkItemId,
        /// Stage
        stage: Stage,
        /// Attempt that just failed (1-based)
        attempt: u32,
        /// Error message
        error: String,
    },

    /// Item failed terminally
    Failed {
        /// Item id
        id: WorkItemId,
        /// Stage that failed, if any
        stage: Option<Stage>,
        /// Error classification
        kind: ErrorKind,
        /// Error message
        error: String,
    },

    /// All dispatched items finished
    RunComplete {
        /// Items uploaded
        uploaded: usize,
        /// Items failed
        failed: usize,
        /// Items never started
        not_started: usize,
    },

    /// Shutdown requested
    Shutdown,
}
