//! Source fetching
//!
//! Downloads one asset per work item into scratch storage. Two strategies
//! exist behind the [`SourceFetcher`] trait:
//!
//! - [`HttpFetcher`]: streams an HTTP(S) response to disk while hashing it
//! - [`YtDlpFetcher`]: delegates video-site URLs to the `yt-dlp` binary
//!
//! [`Fetcher`] picks the strategy per item and checks scratch free space first.
//! Retrying is the caller's business (see [`crate::retry::with_retry`]).

mod digest;
mod http;
mod ytdlp;

pub use digest::{StreamDigest, hash_file};
pub use http::HttpFetcher;
pub use ytdlp::YtDlpFetcher;

use crate::config::Config;
use crate::error::{FetchError, Result};
use crate::scratch::ScratchDir;
use crate::types::{FetchResult, SourceKind, WorkItem};
use async_trait::async_trait;
use tracing::{debug, warn};

/// Trait for fetch strategies
///
/// Implementations write exactly one file per item, named from the item id,
/// and never leave a partial file behind when they return an error.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch the item's source into scratch storage
    async fn fetch(&self, item: &WorkItem, scratch: &ScratchDir)
    -> std::result::Result<FetchResult, FetchError>;

    /// Strategy name for logs
    fn name(&self) -> &'static str;
}

/// Compare what was downloaded against what the manifest promised
pub(crate) fn check_expected(
    item: &WorkItem,
    sha256: &str,
    size: u64,
) -> std::result::Result<(), FetchError> {
    if let Some(expected) = item.expected_size
        && expected != size
    {
        return Err(FetchError::IntegrityMismatch {
            url: item.source_url.clone(),
            expected: format!("{expected} bytes"),
            actual: format!("{size} bytes"),
        });
    }
    if let Some(expected) = &item.expected_sha256
        && !expected.eq_ignore_ascii_case(sha256)
    {
        return Err(FetchError::IntegrityMismatch {
            url: item.source_url.clone(),
            expected: format!("sha256 {expected}"),
            actual: format!("sha256 {sha256}"),
        });
    }
    Ok(())
}

/// Dispatching fetcher used by the pipeline
pub struct Fetcher {
    http: HttpFetcher,
    ytdlp: YtDlpFetcher,
    ytdlp_hosts: Vec<String>,
    min_free_space: u64,
}

impl Fetcher {
    /// Build both strategies from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(&config.fetch)?,
            ytdlp: YtDlpFetcher::from_config(&config.fetch, &config.tools),
            ytdlp_hosts: config
                .fetch
                .ytdlp_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            min_free_space: config.scratch.min_free_space,
        })
    }

    /// Which strategy serves this item
    pub fn strategy_for(&self, item: &WorkItem) -> &dyn SourceFetcher {
        match item.source_kind {
            SourceKind::Http => &self.http,
            SourceKind::YtDlp => &self.ytdlp,
            SourceKind::Auto if self.is_ytdlp_host(&item.source_url) => &self.ytdlp,
            SourceKind::Auto => &self.http,
        }
    }

    fn is_ytdlp_host(&self, url: &str) -> bool {
        url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            .is_some_and(|host| self.ytdlp_hosts.iter().any(|h| *h == host))
    }

    fn check_space(
        &self,
        item: &WorkItem,
        scratch: &ScratchDir,
    ) -> std::result::Result<(), FetchError> {
        let required = self
            .min_free_space
            .saturating_add(item.expected_size.unwrap_or(0));
        match scratch.available_space() {
            Ok(available) if available < required => {
                Err(FetchError::InsufficientSpace { required, available })
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(item_id = %item.id, error = %e, "could not check scratch free space, continuing");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl SourceFetcher for Fetcher {
    async fn fetch(
        &self,
        item: &WorkItem,
        scratch: &ScratchDir,
    ) -> std::result::Result<FetchResult, FetchError> {
        self.check_space(item, scratch)?;
        let strategy = self.strategy_for(item);
        debug!(item_id = %item.id, strategy = strategy.name(), url = %item.source_url, "fetching source");
        strategy.fetch(item, scratch).await
    }

    fn name(&self) -> &'static str {
        "dispatch"
    }
}
