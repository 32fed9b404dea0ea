//! Media processing
//!
//! Turns a fetched source into the artifact that gets uploaded, according to
//! the item's profile:
//!
//! - `ffmpeg` profiles run [`FfmpegProcessor`] with a fixed argument list
//!   under a wall-clock timeout
//! - `passthrough` profiles hand the fetched file on untouched
//!
//! [`Processor`] resolves the profile and dispatches; the pipeline only sees
//! the [`MediaProcessor`] trait.

mod ffmpeg;
mod passthrough;

pub use ffmpeg::FfmpegProcessor;
pub use passthrough::passthrough;

use crate::config::{Config, ProcessingConfig, ProfileKind};
use crate::error::ProcessError;
use crate::scratch::ScratchDir;
use crate::types::{FetchResult, ProcessResult, WorkItem};
use async_trait::async_trait;
use tracing::debug;

/// Trait for processing fetched sources
///
/// Implementations must not leave partial output behind on error.
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    /// Produce the upload artifact for an item
    async fn process(
        &self,
        item: &WorkItem,
        fetched: &FetchResult,
        scratch: &ScratchDir,
    ) -> Result<ProcessResult, ProcessError>;

    /// Processor name for logs
    fn name(&self) -> &'static str;
}

/// Profile-aware processor used by the pipeline
pub struct Processor {
    processing: ProcessingConfig,
    ffmpeg: FfmpegProcessor,
}

impl Processor {
    /// Build from configuration; ffmpeg is located now but only required
    /// when an ffmpeg profile actually runs
    pub fn from_config(config: &Config) -> Self {
        Self {
            processing: config.processing.clone(),
            ffmpeg: FfmpegProcessor::from_config(&config.tools, config.processing.timeout),
        }
    }
}

#[async_trait]
impl MediaProcessor for Processor {
    async fn process(
        &self,
        item: &WorkItem,
        fetched: &FetchResult,
        scratch: &ScratchDir,
    ) -> Result<ProcessResult, ProcessError> {
        let profile = self
            .processing
            .resolve_profile(&item.profile)
            .ok_or_else(|| ProcessError::UnsupportedFormat {
                profile: item.profile.clone(),
                reason: "unknown profile".to_string(),
            })?;

        debug!(item_id = %item.id, profile = %item.profile, kind = ?profile.kind, "processing");

        match profile.kind {
            ProfileKind::Passthrough => passthrough(item, &profile, fetched).await,
            ProfileKind::Ffmpeg => self.ffmpeg.run(item, &profile, fetched, scratch).await,
        }
    }

    fn name(&self) -> &'static str {
        "profile"
    }
}
