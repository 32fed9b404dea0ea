//! yt-dlp fetch strategy for video-site URLs

use super::{SourceFetcher, check_expected, hash_file};
use crate::config::{FetchConfig, ToolsConfig};
use crate::error::FetchError;
use crate::scratch::ScratchDir;
use crate::types::{FetchResult, WorkItem};
use crate::utils::{content_type_for_extension, file_extension, tail_lossy};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// How much of yt-dlp's stderr is kept for error messages
const STDERR_TAIL_BYTES: usize = 4 * 1024;

/// Runs the external `yt-dlp` binary
pub struct YtDlpFetcher {
    binary_path: Option<PathBuf>,
    format: String,
    timeout: Duration,
}

impl YtDlpFetcher {
    /// Create a fetcher with an explicit binary path
    pub fn new(binary_path: PathBuf, format: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary_path: Some(binary_path),
            format: format.into(),
            timeout,
        }
    }

    /// Resolve the binary from configuration, searching PATH if allowed
    ///
    /// A missing binary is not an error here; items that need it fail when
    /// they are fetched.
    pub fn from_config(fetch: &FetchConfig, tools: &ToolsConfig) -> Self {
        let binary_path = tools.ytdlp_path.clone().or_else(|| {
            if tools.search_path {
                which::which("yt-dlp").ok()
            } else {
                None
            }
        });
        Self {
            binary_path,
            format: fetch.ytdlp_format.clone(),
            timeout: fetch.timeout,
        }
    }

    fn args(&self, item: &WorkItem, scratch: &ScratchDir) -> Vec<String> {
        vec![
            "-f".to_string(),
            self.format.clone(),
            "--no-playlist".to_string(),
            "--no-part".to_string(),
            "-o".to_string(),
            scratch.ytdlp_template(&item.id).to_string_lossy().into_owned(),
            item.source_url.clone(),
        ]
    }
}

#[async_trait]
impl SourceFetcher for YtDlpFetcher {
    async fn fetch(
        &self,
        item: &WorkItem,
        scratch: &ScratchDir,
    ) -> Result<FetchResult, FetchError> {
        let url = item.source_url.clone();
        let binary = self.binary_path.as_ref().ok_or_else(|| FetchError::Tool {
            url: url.clone(),
            reason: "yt-dlp not found (set tools.ytdlp_path or install it on PATH)".to_string(),
        })?;

        let args = self.args(item, scratch);
        debug!(item_id = %item.id, binary = ?binary, ?args, "running yt-dlp");

        let child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FetchError::Tool {
                url: url.clone(),
                reason: format!("failed to start yt-dlp: {e}"),
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| FetchError::Tool {
                url: url.clone(),
                reason: format!("failed to wait for yt-dlp: {e}"),
            })?,
            Err(_) => {
                // dropping the future kills the child
                scratch.remove_item_files(&item.id).await;
                return Err(FetchError::Tool {
                    url,
                    reason: format!("timed out after {}s", self.timeout.as_secs()),
                });
            }
        };

        if !output.status.success() {
            scratch.remove_item_files(&item.id).await;
            return Err(FetchError::Tool {
                url,
                reason: format!(
                    "exit code {:?}: {}",
                    output.status.code(),
                    tail_lossy(&output.stderr, STDERR_TAIL_BYTES)
                ),
            });
        }

        let local_path = scratch
            .find_source(&item.id)
            .await
            .map_err(|source| FetchError::Io {
                path: scratch.path().to_path_buf(),
                source,
            })?
            .ok_or_else(|| FetchError::Tool {
                url: url.clone(),
                reason: "yt-dlp exited successfully but wrote no file".to_string(),
            })?;

        let (sha256, md5, size) =
            hash_file(&local_path)
                .await
                .map_err(|source| FetchError::Io {
                    path: local_path.clone(),
                    source,
                })?;

        if let Err(e) = check_expected(item, &sha256, size) {
            scratch.remove_item_files(&item.id).await;
            return Err(e);
        }

        let extension = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(file_extension);

        info!(item_id = %item.id, bytes = size, path = ?local_path, "fetched source with yt-dlp");

        Ok(FetchResult {
            content_type: Some(content_type_for_extension(extension.as_deref()).to_string()),
            local_path,
            size_bytes: size,
            sha256,
            md5,
            attempts: 1,
        })
    }

    fn name(&self) -> &'static str {
        "yt-dlp"
    }
}
