//! ffmpeg-backed processing

use crate::config::{Profile, ToolsConfig};
use crate::error::ProcessError;
use crate::scratch::{ScratchDir, artifact_extension};
use crate::types::{FetchResult, FormatMetadata, ProcessResult, WorkItem};
use crate::utils::content_type_for_extension;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// How much of ffmpeg's stderr is kept
pub const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// ffmpeg's message for input it cannot demux
const INVALID_INPUT_MARKER: &str = "Invalid data found when processing input";

const TOOL_NAME: &str = "ffmpeg";

/// Runs the external `ffmpeg` binary
///
/// # Examples
///
/// ```no_run
/// use media_relay::process::FfmpegProcessor;
/// use std::path::PathBuf;
/// use std::time::Duration;
///
/// // Explicit binary
/// let processor = FfmpegProcessor::new(PathBuf::from("/usr/bin/ffmpeg"), Duration::from_secs(600));
///
/// // Or auto-discover from PATH
/// let processor = FfmpegProcessor::from_path(Duration::from_secs(600));
/// ```
pub struct FfmpegProcessor {
    binary_path: Option<PathBuf>,
    timeout: Duration,
}

impl FfmpegProcessor {
    /// Create a processor with an explicit binary path
    pub fn new(binary_path: PathBuf, timeout: Duration) -> Self {
        Self {
            binary_path: Some(binary_path),
            timeout,
        }
    }

    /// Look for `ffmpeg` on PATH
    pub fn from_path(timeout: Duration) -> Self {
        Self {
            binary_path: which::which(TOOL_NAME).ok(),
            timeout,
        }
    }

    /// Resolve the binary from tool configuration
    pub fn from_config(tools: &ToolsConfig, timeout: Duration) -> Self {
        match &tools.ffmpeg_path {
            Some(path) => Self::new(path.clone(), timeout),
            None if tools.search_path => Self::from_path(timeout),
            None => Self {
                binary_path: None,
                timeout,
            },
        }
    }

    /// Whether a binary was found
    pub fn is_available(&self) -> bool {
        self.binary_path.is_some()
    }

    /// Argument list for one run
    ///
    /// Always `-hide_banner -nostdin -y -i <input> <profile args...> <output>`.
    pub fn build_args(input: &Path, profile_args: &[String], output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-hide_banner", "-nostdin", "-y", "-i"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push(input.as_os_str().to_os_string());
        args.extend(profile_args.iter().map(OsString::from));
        args.push(output.as_os_str().to_os_string());
        args
    }

    /// Run a profile over a fetched file
    pub async fn run(
        &self,
        item: &WorkItem,
        profile: &Profile,
        fetched: &FetchResult,
        scratch: &ScratchDir,
    ) -> Result<ProcessResult, ProcessError> {
        let binary = self
            .binary_path
            .as_ref()
            .ok_or_else(|| ProcessError::ToolNotFound {
                tool: TOOL_NAME.to_string(),
            })?;

        let input_ext = artifact_extension(&fetched.local_path);
        if !profile.accepts_extension(input_ext.as_deref()) {
            return Err(ProcessError::UnsupportedFormat {
                profile: item.profile.clone(),
                reason: format!(
                    "input extension {} not accepted",
                    input_ext.as_deref().unwrap_or("(none)")
                ),
            });
        }

        let out_ext = profile.output_extension.as_deref().or(input_ext.as_deref());
        let output = scratch.output_path(&item.id, out_ext);
        remove_if_exists(&output).await;

        let args = Self::build_args(&fetched.local_path, &profile.args, &output);
        debug!(item_id = %item.id, binary = ?binary, ?args, "running ffmpeg");

        let mut child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ProcessError::ToolNotFound {
                        tool: binary.display().to_string(),
                    }
                } else {
                    ProcessError::Io {
                        path: binary.clone(),
                        source: e,
                    }
                }
            })?;

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_tail(stderr, STDERR_TAIL_BYTES)));

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                remove_if_exists(&output).await;
                return Err(ProcessError::Io {
                    path: binary.clone(),
                    source: e,
                });
            }
            Err(_) => {
                warn!(item_id = %item.id, timeout_secs = self.timeout.as_secs(), "ffmpeg timed out, killing");
                // kill() also waits, so the child is reaped before we return
                if let Err(e) = child.kill().await {
                    warn!(item_id = %item.id, error = %e, "failed to kill ffmpeg");
                }
                if let Some(task) = stderr_task {
                    task.abort();
                }
                remove_if_exists(&output).await;
                return Err(ProcessError::Timeout {
                    tool: TOOL_NAME.to_string(),
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            remove_if_exists(&output).await;
            if stderr.contains(INVALID_INPUT_MARKER) {
                return Err(ProcessError::UnsupportedFormat {
                    profile: item.profile.clone(),
                    reason: INVALID_INPUT_MARKER.to_string(),
                });
            }
            return Err(ProcessError::NonZeroExit {
                tool: TOOL_NAME.to_string(),
                code: status.code(),
                stderr,
            });
        }

        let size = match tokio::fs::metadata(&output).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => meta.len(),
            _ => {
                remove_if_exists(&output).await;
                let detail = if stderr.is_empty() {
                    "no output produced".to_string()
                } else {
                    format!("no output produced: {stderr}")
                };
                return Err(ProcessError::NonZeroExit {
                    tool: TOOL_NAME.to_string(),
                    code: status.code(),
                    stderr: detail,
                });
            }
        };

        let extension = out_ext.unwrap_or("bin").to_string();
        let content_type = profile
            .content_type
            .clone()
            .unwrap_or_else(|| content_type_for_extension(Some(&extension)).to_string());

        info!(item_id = %item.id, profile = %item.profile, bytes = size, "processed with ffmpeg");

        Ok(ProcessResult {
            output_path: output,
            format: FormatMetadata {
                profile: item.profile.clone(),
                extension,
                content_type,
                size_bytes: size,
            },
        })
    }
}

/// Read a stream to its end, keeping only the last `max_bytes`
async fn read_tail<R>(mut reader: R, max_bytes: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut kept: Vec<u8> = Vec::with_capacity(max_bytes);
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                kept.extend_from_slice(&buf[..n]);
                if kept.len() > max_bytes * 2 {
                    let excess = kept.len() - max_bytes;
                    kept.drain(..excess);
                }
            }
        }
    }
    crate::utils::tail_lossy(&kept, max_bytes)
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = ?path, "removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?path, error = %e, "failed to remove partial output"),
    }
}
