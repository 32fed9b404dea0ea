//! Test configuration helpers for building pipelines against local fakes

use media_relay::config::RetryConfig;
use media_relay::upload::{Destination, Uploader};
use media_relay::{
    Config, DestinationConfig, Fetcher, Pipeline, Processor, ScratchDir, SourceFetcher,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Retry policy with millisecond backoff so retry paths run quickly
pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

/// Configuration for a test run rooted at `scratch`
///
/// No free-space floor, fast retries, and an HTTP destination placeholder
/// (tests hand the pipeline their own destination).
pub fn test_config(scratch: &Path) -> Config {
    let mut config = Config::default();
    config.scratch.dir = scratch.to_path_buf();
    config.scratch.min_free_space = 0;
    config.fetch.retry = fast_retry(3);
    config.fetch.timeout = Duration::from_secs(10);
    config.upload.retry = fast_retry(3);
    config.tools.search_path = false;
    config.destination = DestinationConfig::Http {
        base_url: "http://127.0.0.1:9".to_string(),
        token_env: None,
    };
    config
}

/// Build a pipeline with the real fetcher and processor and the given destination
pub async fn build_pipeline(config: &Config, destination: Arc<dyn Destination>) -> Pipeline {
    let scratch = ScratchDir::open(&config.scratch.dir)
        .await
        .expect("scratch directory");
    let fetcher = Arc::new(Fetcher::from_config(config).expect("fetcher"));
    let processor = Arc::new(Processor::from_config(config));
    let uploader = Arc::new(Uploader::new(destination, &config.upload));
    Pipeline::new(config, scratch, fetcher, processor, uploader)
}

/// Build a pipeline around a custom fetcher
pub async fn build_pipeline_with_fetcher(
    config: &Config,
    fetcher: Arc<dyn SourceFetcher>,
    destination: Arc<dyn Destination>,
) -> Pipeline {
    let scratch = ScratchDir::open(&config.scratch.dir)
        .await
        .expect("scratch directory");
    let processor = Arc::new(Processor::from_config(config));
    let uploader = Arc::new(Uploader::new(destination, &config.upload));
    Pipeline::new(config, scratch, fetcher, processor, uploader)
}
