//! Error types for media-relay
//!
//! This module provides the error taxonomy for the pipeline:
//! - Stage-specific error types ([`FetchError`], [`ProcessError`], [`UploadError`])
//! - A top-level [`Error`] for configuration, manifest and orchestration failures
//! - A serializable [`ErrorKind`] tag used in the run report
//! - The [`Stage`] each error originates from

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::types::{Stage, Status, WorkItemId};

/// Result type alias for media-relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for media-relay
///
/// Stage errors convert into this type via `?`, so orchestration code can
/// propagate any failure while the report still knows which stage produced it.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "concurrency.workers")
        key: Option<String>,
    },

    /// Manifest could not be read or parsed
    #[error("invalid manifest: {0}")]
    Manifest(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A work item was asked to move backward or out of a terminal state
    #[error("work item {id}: invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// The item whose transition was rejected
        id: WorkItemId,
        /// Current status
        from: Status,
        /// Requested status
        to: Status,
    },

    /// Shutdown in progress - no further stages or attempts are started
    #[error("shutdown in progress: work item interrupted")]
    ShuttingDown,

    /// Fetch stage error
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Process stage error
    #[error("process error: {0}")]
    Process(#[from] ProcessError),

    /// Upload stage error
    #[error("upload error: {0}")]
    Upload(#[from] UploadError),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Errors produced by the source fetcher
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transient network failure (timeout, connection reset, 5xx, 408, 429)
    #[error("network error fetching {url}: {reason}")]
    Network {
        /// Source URL
        url: String,
        /// What went wrong
        reason: String,
    },

    /// Source does not exist (404/410) or the URL is malformed
    #[error("source not found: {url} ({reason})")]
    NotFound {
        /// Source URL as given in the manifest
        url: String,
        /// Why it is considered missing
        reason: String,
    },

    /// Downloaded bytes do not match the declared checksum or length
    #[error("integrity mismatch for {url}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        /// Source URL
        url: String,
        /// Expected checksum or length
        expected: String,
        /// Observed checksum or length
        actual: String,
    },

    /// Non-retryable HTTP status other than 404/410
    #[error("source {url} returned HTTP {status}")]
    HttpStatus {
        /// Source URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// Not enough free space in the scratch directory
    #[error("insufficient scratch space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Number of bytes required
        required: u64,
        /// Number of bytes currently available
        available: u64,
    },

    /// External downloader (yt-dlp) failed or is missing
    #[error("external downloader failed for {url}: {reason}")]
    Tool {
        /// Source URL
        url: String,
        /// Diagnostic message
        reason: String,
    },

    /// Local filesystem error while writing the scratch file
    #[error("scratch write failed for {path}: {source}")]
    Io {
        /// Scratch path being written
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Errors produced by the media processor
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The external tool is not installed or not executable
    #[error("processing tool not found: {tool}")]
    ToolNotFound {
        /// Tool name or path
        tool: String,
    },

    /// The tool exited unsuccessfully, or produced no usable output
    #[error("{tool} failed (exit code {code:?}): {stderr}")]
    NonZeroExit {
        /// Tool name
        tool: String,
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// Tail of the tool's diagnostic output
        stderr: String,
    },

    /// Input is not something the selected profile can process
    #[error("unsupported format for profile {profile}: {reason}")]
    UnsupportedFormat {
        /// Profile name
        profile: String,
        /// Why the input was rejected
        reason: String,
    },

    /// The tool exceeded its wall-clock budget and was killed
    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout {
        /// Tool name
        tool: String,
        /// Configured timeout in seconds
        timeout_secs: u64,
    },

    /// Local filesystem error around the tool invocation
    #[error("processing I/O error on {path}: {source}")]
    Io {
        /// Path involved
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Errors produced by the destination uploader
#[derive(Debug, Error)]
pub enum UploadError {
    /// Transient network or server failure
    #[error("network error uploading {key}: {reason}")]
    Network {
        /// Remote key
        key: String,
        /// What went wrong
        reason: String,
    },

    /// Credentials missing, invalid or insufficient
    #[error("destination rejected credentials for {key}: {reason}")]
    Auth {
        /// Remote key
        key: String,
        /// Reason reported by the destination
        reason: String,
    },

    /// Destination is out of space or over quota
    #[error("destination quota exceeded for {key}: {reason}")]
    QuotaExceeded {
        /// Remote key
        key: String,
        /// Reason reported by the destination
        reason: String,
    },

    /// Destination refused the object for another non-transient reason
    #[error("destination rejected {key} with status {status}: {reason}")]
    Rejected {
        /// Remote key
        key: String,
        /// Status code reported by the destination
        status: u16,
        /// Reason reported by the destination
        reason: String,
    },

    /// The post-upload check did not find the object we wrote
    #[error("upload of {key} could not be confirmed: {reason}")]
    Unconfirmed {
        /// Remote key
        key: String,
        /// What did not match
        reason: String,
    },

    /// Local file could not be read for upload
    #[error("cannot read {path} for upload: {source}")]
    Io {
        /// Local artifact path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

/// Machine-readable error classification used in the run report
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient network failure that outlived its retries
    NetworkError,
    /// Source missing or URL malformed
    NotFound,
    /// Checksum or length mismatch
    IntegrityMismatch,
    /// Non-retryable HTTP status from the source
    HttpStatus,
    /// Scratch filesystem too full
    InsufficientSpace,
    /// External downloader failure
    FetchToolFailed,
    /// Processing tool missing
    ToolNotFound,
    /// Processing tool failed or produced nothing
    NonZeroExit,
    /// Input format not supported by the profile
    UnsupportedFormat,
    /// Processing tool exceeded its timeout
    Timeout,
    /// Destination refused credentials
    AuthError,
    /// Destination out of quota
    QuotaExceeded,
    /// Destination refused the object
    Rejected,
    /// Post-upload confirmation failed
    Unconfirmed,
    /// Local I/O failure
    IoError,
    /// Shutdown interrupted the item
    Interrupted,
    /// Configuration problem
    ConfigError,
    /// Anything else
    Internal,
}

impl FetchError {
    /// Classification for the run report
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Network { .. } => ErrorKind::NetworkError,
            FetchError::NotFound { .. } => ErrorKind::NotFound,
            FetchError::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            FetchError::HttpStatus { .. } => ErrorKind::HttpStatus,
            FetchError::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
            FetchError::Tool { .. } => ErrorKind::FetchToolFailed,
            FetchError::Io { .. } => ErrorKind::IoError,
        }
    }
}

impl ProcessError {
    /// Classification for the run report
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessError::ToolNotFound { .. } => ErrorKind::ToolNotFound,
            ProcessError::NonZeroExit { .. } => ErrorKind::NonZeroExit,
            ProcessError::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            ProcessError::Timeout { .. } => ErrorKind::Timeout,
            ProcessError::Io { .. } => ErrorKind::IoError,
        }
    }
}

impl UploadError {
    /// Classification for the run report
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::Network { .. } => ErrorKind::NetworkError,
            UploadError::Auth { .. } => ErrorKind::AuthError,
            UploadError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            UploadError::Rejected { .. } => ErrorKind::Rejected,
            UploadError::Unconfirmed { .. } => ErrorKind::Unconfirmed,
            UploadError::Io { .. } => ErrorKind::IoError,
        }
    }
}

impl Error {
    /// Classification for the run report
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config { .. } => ErrorKind::ConfigError,
            Error::Io(_) => ErrorKind::IoError,
            Error::ShuttingDown => ErrorKind::Interrupted,
            Error::Fetch(e) => e.kind(),
            Error::Process(e) => e.kind(),
            Error::Upload(e) => e.kind(),
            Error::Manifest(_)
            | Error::Serialization(_)
            | Error::InvalidTransition { .. }
            | Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// The pipeline stage this error belongs to, if any
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Fetch(_) => Some(Stage::Fetch),
            Error::Process(_) => Some(Stage::Process),
            Error::Upload(_) => Some(Stage::Upload),
            _ => None,
        }
    }

    /// Shorthand for a configuration error tied to a key
    pub fn config(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }
}
