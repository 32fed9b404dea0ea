//! Destination upload
//!
//! [`Uploader`] pushes a processed artifact to a [`Destination`] under a key
//! derived only from the work item, then reads the object back to confirm
//! the store holds what we sent. Two backends exist:
//!
//! - [`S3Destination`]: S3-compatible object storage
//! - [`HttpDestination`]: a plain HTTP(S) endpoint accepting `PUT` and `HEAD`
//!
//! One call to [`Uploader::upload`] is one attempt; retrying is the caller's
//! business (see [`crate::retry::with_retry`]).

mod http;
mod s3;

pub use http::HttpDestination;
pub use s3::S3Destination;

use crate::config::{Config, DestinationConfig, UploadConfig};
use crate::error::{Error, Result, UploadError};
use crate::fetch::hash_file;
use crate::types::{ProcessResult, UploadReceipt, WorkItem};
use crate::utils::url_stem;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// What the destination reports about a stored object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteObject {
    /// Stored size in bytes
    pub size: Option<u64>,
    /// SHA-256 recorded with the object, if the store keeps it
    pub sha256: Option<String>,
    /// ETag, unquoted
    pub etag: Option<String>,
}

/// Local artifact handed to a destination
#[derive(Clone, Copy, Debug)]
pub struct Artifact<'a> {
    /// File to send
    pub path: &'a Path,
    /// MIME type
    pub content_type: &'a str,
    /// SHA-256, lowercase hex
    pub sha256: &'a str,
    /// Size in bytes
    pub size: u64,
}

/// Trait for destination stores
#[async_trait]
pub trait Destination: Send + Sync {
    /// Store the artifact under `key`; returns the ETag if one was reported
    async fn put(&self, key: &str, artifact: Artifact<'_>)
    -> std::result::Result<Option<String>, UploadError>;

    /// Look up an object; `Ok(None)` when it does not exist
    async fn head(&self, key: &str) -> std::result::Result<Option<RemoteObject>, UploadError>;

    /// Verify the destination is reachable with the configured credentials
    async fn check_access(&self) -> std::result::Result<(), UploadError>;

    /// Human-readable location of a key (for logs and the report)
    fn describe(&self, key: &str) -> String;

    /// Backend name
    fn name(&self) -> &'static str;
}

/// Build the configured destination
pub async fn destination_from_config(config: &Config) -> Result<Arc<dyn Destination>> {
    match &config.destination {
        DestinationConfig::S3 {
            bucket,
            region,
            endpoint,
            path_style,
        } => Ok(Arc::new(
            S3Destination::connect(
                bucket.clone(),
                region.clone(),
                endpoint.clone(),
                *path_style,
                config.upload.timeout,
                config.upload.multipart.clone(),
            )
            .await,
        )),
        DestinationConfig::Http {
            base_url,
            token_env,
        } => {
            let token = match token_env {
                Some(var) => Some(std::env::var(var).map_err(|_| {
                    Error::config(
                        format!("environment variable {var} is not set"),
                        "destination.token_env",
                    )
                })?),
                None => None,
            };
            Ok(Arc::new(HttpDestination::new(
                base_url,
                token,
                config.upload.timeout,
            )?))
        }
    }
}

/// Pushes artifacts and confirms receipt
pub struct Uploader {
    destination: Arc<dyn Destination>,
    key_prefix: String,
    skip_existing: bool,
}

impl Uploader {
    /// Create an uploader over a destination
    pub fn new(destination: Arc<dyn Destination>, config: &UploadConfig) -> Self {
        Self {
            destination,
            key_prefix: config.key_prefix.clone(),
            skip_existing: config.skip_existing,
        }
    }

    /// The destination in use
    pub fn destination(&self) -> &Arc<dyn Destination> {
        &self.destination
    }

    /// Remote key for an item
    ///
    /// A destination ending in `/` is a prefix and gets
    /// `{key_prefix}{destination}{id}-{stem}.{ext}`; anything else is the
    /// exact key.
    pub fn object_key(&self, item: &WorkItem, extension: &str) -> String {
        let destination = item.destination.trim_start_matches('/');
        if destination.ends_with('/') || destination.is_empty() {
            format!(
                "{}{}{}-{}.{}",
                self.key_prefix,
                destination,
                item.id,
                url_stem(&item.source_url),
                extension
            )
        } else {
            destination.to_string()
        }
    }

    /// Upload one artifact and confirm it landed
    pub async fn upload(
        &self,
        item: &WorkItem,
        processed: &ProcessResult,
    ) -> std::result::Result<UploadReceipt, UploadError> {
        let key = self.object_key(item, &processed.format.extension);
        let (sha256, md5, size) =
            hash_file(&processed.output_path)
                .await
                .map_err(|source| UploadError::Io {
                    path: processed.output_path.clone(),
                    source,
                })?;

        if self.skip_existing
            && let Some(existing) = self.destination.head(&key).await?
            && confirm(&key, &existing, &sha256, &md5, size).is_ok()
        {
            info!(item_id = %item.id, location = %self.destination.describe(&key), "identical object already present, skipping upload");
            return Ok(UploadReceipt {
                remote_id: key,
                etag: existing.etag,
                sha256,
                size_bytes: size,
            });
        }

        debug!(item_id = %item.id, location = %self.destination.describe(&key), bytes = size, "uploading");

        let artifact = Artifact {
            path: &processed.output_path,
            content_type: &processed.format.content_type,
            sha256: &sha256,
            size,
        };
        let put_etag = self.destination.put(&key, artifact).await?;

        let remote = self
            .destination
            .head(&key)
            .await?
            .ok_or_else(|| UploadError::Unconfirmed {
                key: key.clone(),
                reason: "object not found after upload".to_string(),
            })?;
        confirm(&key, &remote, &sha256, &md5, size)?;

        info!(item_id = %item.id, location = %self.destination.describe(&key), bytes = size, "upload confirmed");

        Ok(UploadReceipt {
            remote_id: key,
            etag: remote.etag.or(put_etag),
            sha256,
            size_bytes: size,
        })
    }
}

/// Check a remote object against the local artifact
///
/// Size must match. A recorded SHA-256 must match; without one, an ETag that
/// looks like a plain MD5 (single-part upload) must match the local MD5.
fn confirm(
    key: &str,
    remote: &RemoteObject,
    sha256: &str,
    md5: &str,
    size: u64,
) -> std::result::Result<(), UploadError> {
    let unconfirmed = |reason: String| UploadError::Unconfirmed {
        key: key.to_string(),
        reason,
    };

    match remote.size {
        Some(remote_size) if remote_size != size => {
            return Err(unconfirmed(format!(
                "size mismatch: local {size}, remote {remote_size}"
            )));
        }
        None => return Err(unconfirmed("destination did not report a size".to_string())),
        _ => {}
    }

    if let Some(remote_sha) = &remote.sha256 {
        if !remote_sha.eq_ignore_ascii_case(sha256) {
            return Err(unconfirmed(format!(
                "sha256 mismatch: local {sha256}, remote {remote_sha}"
            )));
        }
    } else if let Some(etag) = &remote.etag
        && is_md5_etag(etag)
        && !etag.eq_ignore_ascii_case(md5)
    {
        return Err(unconfirmed(format!(
            "ETag mismatch: local md5 {md5}, remote {etag}"
        )));
    }

    Ok(())
}

fn is_md5_etag(etag: &str) -> bool {
    etag.len() == 32 && etag.chars().all(|c| c.is_ascii_hexdigit())
}

/// Strip the quotes stores put around ETags
pub(crate) fn unquote_etag(raw: &str) -> String {
    raw.trim().trim_start_matches("W/").trim_matches('"').to_string()
}

/// Map a destination status code and error code to an upload error
pub(crate) fn classify_failure(
    key: &str,
    status: Option<u16>,
    code: Option<&str>,
    message: String,
) -> UploadError {
    const AUTH_CODES: &[&str] = &[
        "AccessDenied",
        "InvalidAccessKeyId",
        "SignatureDoesNotMatch",
        "ExpiredToken",
        "InvalidToken",
        "TokenRefreshRequired",
    ];
    const QUOTA_CODES: &[&str] = &["QuotaExceeded", "XMinioStorageFull"];
    // Object over the store's single-request size limit, not a full store
    const TOO_LARGE_CODES: &[&str] = &["EntityTooLarge"];
    const TRANSIENT_CODES: &[&str] = &[
        "SlowDown",
        "RequestTimeout",
        "InternalError",
        "ServiceUnavailable",
    ];

    let key = key.to_string();
    let reason = match code {
        Some(code) => format!("{code}: {message}"),
        None => message,
    };

    if code.is_some_and(|c| AUTH_CODES.contains(&c)) || matches!(status, Some(401 | 403)) {
        return UploadError::Auth { key, reason };
    }
    if code.is_some_and(|c| TOO_LARGE_CODES.contains(&c)) {
        return UploadError::Rejected {
            key,
            status: status.unwrap_or(400),
            reason,
        };
    }
    if code.is_some_and(|c| QUOTA_CODES.contains(&c)) || matches!(status, Some(413 | 507)) {
        return UploadError::QuotaExceeded { key, reason };
    }
    if code.is_some_and(|c| TRANSIENT_CODES.contains(&c)) {
        return UploadError::Network { key, reason };
    }
    match status {
        None => UploadError::Network { key, reason },
        Some(s) if s >= 500 || s == 408 || s == 429 => UploadError::Network { key, reason },
        Some(status) => UploadError::Rejected {
            key,
            status,
            reason,
        },
    }
}
