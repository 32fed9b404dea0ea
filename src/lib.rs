//! # media-relay
//!
//! Batch pipeline that moves remote media into object storage.
//!
//! Each entry of a manifest becomes a [`WorkItem`] that is carried through
//! three stages:
//!
//! 1. **Fetch** - download the source into scratch storage over HTTP(S), or
//!    through `yt-dlp` for video-site URLs, verifying size and checksum
//! 2. **Process** - run the item's profile: an `ffmpeg` transcode under a
//!    timeout, or a passthrough for assets that need no transformation
//! 3. **Upload** - push the artifact to S3 or an HTTP endpoint under a key
//!    derived from the item, then read it back to confirm
//!
//! Items run concurrently with independent per-stage limits. A failure in one
//! item never stops the others; the run ends with a [`RunReport`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use media_relay::{Config, Manifest, Pipeline};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(Some(Path::new("media-relay.toml")))?;
//!     config.validate()?;
//!
//!     let items = Manifest::load(Path::new("manifest.csv"))?
//!         .into_work_items(&config.processing)?;
//!
//!     let pipeline = Pipeline::from_config(&config).await?;
//!
//!     // Subscribe to events
//!     let mut events = pipeline.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             tracing::debug!(?event, "pipeline event");
//!         }
//!     });
//!
//!     let report = pipeline.run(items).await;
//!     std::process::exit(report.exit_code());
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Source fetching
pub mod fetch;
/// Logging setup
pub mod logging;
/// Manifest parsing
pub mod manifest;
/// Pipeline orchestration
pub mod pipeline;
/// Media processing
pub mod process;
/// Retry logic with exponential backoff
pub mod retry;
/// Scratch storage
pub mod scratch;
/// Core types and events
pub mod types;
/// Destination upload
pub mod upload;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::{Config, DestinationConfig, Profile, ProfileKind};
pub use error::{Error, ErrorKind, FetchError, ProcessError, Result, UploadError};
pub use fetch::{Fetcher, SourceFetcher};
pub use manifest::{Manifest, ManifestEntry};
pub use pipeline::{ItemOutcome, Pipeline, RunReport};
pub use process::{MediaProcessor, Processor};
pub use scratch::ScratchDir;
pub use types::{
    Event, FetchResult, FormatMetadata, ProcessResult, SourceKind, Stage, Status, UploadReceipt,
    WorkItem, WorkItemId,
};
pub use upload::{Destination, Uploader};

/// Cancel `token` when a termination signal arrives.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// Returns immediately if the token is cancelled by someone else first.
///
/// # Example
///
/// ```no_run
/// use media_relay::{Config, Pipeline, cancel_on_signal};
///
/// # async fn example(config: Config) -> media_relay::Result<()> {
/// let pipeline = Pipeline::from_config(&config).await?;
/// tokio::spawn(cancel_on_signal(pipeline.cancellation_token()));
/// let report = pipeline.run(Vec::new()).await;
/// # Ok(())
/// # }
/// ```
pub async fn cancel_on_signal(token: tokio_util::sync::CancellationToken) {
    tokio::select! {
        _ = wait_for_signal() => {
            tracing::warn!("Shutdown requested, finishing in-flight stages");
            token.cancel();
        }
        _ = token.cancelled() => {}
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
