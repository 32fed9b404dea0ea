//! Configuration types for media-relay

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

/// Name of the profile that uploads the fetched file untouched
pub const PASSTHROUGH_PROFILE: &str = "passthrough";

/// Smallest part S3 accepts, except for the last one
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Largest part S3 accepts
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Most parts one multipart upload may have
pub const MAX_MULTIPART_PARTS: u64 = 10_000;

/// Largest accepted `backoff_multiplier`
pub const MAX_BACKOFF_MULTIPLIER: f64 = 100.0;

/// Scratch storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScratchConfig {
    /// Scratch directory for intermediate artifacts (default: "./scratch")
    #[serde(default = "default_scratch_dir")]
    pub dir: PathBuf,

    /// Minimum free space required before each fetch (default: 512 MB)
    #[serde(default = "default_min_free_space")]
    pub min_free_space: u64,

    /// Remove orphaned scratch files before a run (default: true)
    #[serde(default = "default_true")]
    pub sweep_on_start: bool,
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            dir: default_scratch_dir(),
            min_free_space: default_min_free_space(),
            sweep_on_start: true,
        }
    }
}

/// Parallelism limits
///
/// `workers` bounds how many items are in flight; the per-stage limits bound
/// how many of those may be inside a given stage at once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Items processed concurrently (default: 4)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Concurrent fetches (default: 4)
    #[serde(default = "default_workers")]
    pub fetch: usize,

    /// Concurrent processing jobs (default: 1)
    #[serde(default = "default_process_concurrency")]
    pub process: usize,

    /// Concurrent uploads (default: 4)
    #[serde(default = "default_workers")]
    pub upload: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            fetch: default_workers(),
            process: default_process_concurrency(),
            upload: default_workers(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts per stage, including the first (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Source fetch configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Whole-request timeout for one fetch attempt (default: 300 seconds)
    #[serde(default = "default_fetch_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// TCP connect timeout (default: 30 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Retry policy for transient fetch failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// User-Agent header sent with source requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// yt-dlp format selector (default: "best[ext=mp4]")
    #[serde(default = "default_ytdlp_format")]
    pub ytdlp_format: String,

    /// Hosts routed to yt-dlp when an entry's source is `auto`
    #[serde(default = "default_ytdlp_hosts")]
    pub ytdlp_hosts: Vec<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: default_fetch_timeout(),
            connect_timeout: default_connect_timeout(),
            retry: RetryConfig::default(),
            user_agent: default_user_agent(),
            ytdlp_format: default_ytdlp_format(),
            ytdlp_hosts: default_ytdlp_hosts(),
        }
    }
}

/// What a profile runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    /// Run ffmpeg with the profile arguments
    #[default]
    Ffmpeg,
    /// Hand the fetched file on untouched
    Passthrough,
}

/// Named processing recipe
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Tool to run
    #[serde(default)]
    pub kind: ProfileKind,

    /// Output file extension without the dot (passthrough keeps the input's)
    #[serde(default)]
    pub output_extension: Option<String>,

    /// MIME type of the output (guessed from the extension when unset)
    #[serde(default)]
    pub content_type: Option<String>,

    /// Arguments placed between the input and the output path
    #[serde(default)]
    pub args: Vec<String>,

    /// Input extensions this profile accepts (empty = any)
    #[serde(default)]
    pub accepts: Vec<String>,
}

impl Profile {
    /// Whether `extension` (without the dot) is acceptable input
    pub fn accepts_extension(&self, extension: Option<&str>) -> bool {
        if self.accepts.is_empty() {
            return true;
        }
        extension.is_some_and(|ext| self.accepts.iter().any(|a| a.eq_ignore_ascii_case(ext)))
    }
}

/// Processing configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Profile used when a manifest entry names none (default: "passthrough")
    #[serde(default = "default_profile_name")]
    pub default_profile: String,

    /// Wall-clock budget for one tool run (default: 3600 seconds)
    #[serde(default = "default_process_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// User-defined profiles; these shadow built-ins with the same name
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            default_profile: default_profile_name(),
            timeout: default_process_timeout(),
            profiles: HashMap::new(),
        }
    }
}

impl ProcessingConfig {
    /// Look up a profile by name, falling back to the built-in set
    pub fn resolve_profile(&self, name: &str) -> Option<Profile> {
        self.profiles
            .get(name)
            .cloned()
            .or_else(|| builtin_profile(name))
    }
}

/// Built-in profiles available without configuration
pub fn builtin_profile(name: &str) -> Option<Profile> {
    const VIDEO_INPUTS: &[&str] = &["mp4", "m4v", "mkv", "mov", "webm", "avi", "flv", "ts"];
    const AUDIO_INPUTS: &[&str] = &["m4a", "mp3", "aac", "wav", "flac", "ogg", "opus"];

    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    match name {
        PASSTHROUGH_PROFILE => Some(Profile {
            kind: ProfileKind::Passthrough,
            output_extension: None,
            content_type: None,
            args: Vec::new(),
            accepts: Vec::new(),
        }),
        "mp4-h264" => Some(Profile {
            kind: ProfileKind::Ffmpeg,
            output_extension: Some("mp4".to_string()),
            content_type: Some("video/mp4".to_string()),
            args: strings(&[
                "-c:v",
                "libx264",
                "-preset",
                "medium",
                "-crf",
                "23",
                "-c:a",
                "aac",
                "-b:a",
                "128k",
                "-movflags",
                "+faststart",
            ]),
            accepts: strings(VIDEO_INPUTS),
        }),
        "audio-m4a" => Some(Profile {
            kind: ProfileKind::Ffmpeg,
            output_extension: Some("m4a".to_string()),
            content_type: Some("audio/mp4".to_string()),
            args: strings(&["-vn", "-c:a", "aac", "-b:a", "192k"]),
            accepts: [VIDEO_INPUTS, AUDIO_INPUTS]
                .concat()
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }),
        _ => None,
    }
}

/// External tool paths
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to ffmpeg executable (auto-detected if None)
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    /// Path to yt-dlp executable (auto-detected if None)
    #[serde(default)]
    pub ytdlp_path: Option<PathBuf>,

    /// Whether to search PATH for external binaries if explicit paths not set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ytdlp_path: None,
            search_path: true,
        }
    }
}

/// Upload behaviour
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Retry policy for transient upload failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Prefix prepended to every derived key (default: "")
    #[serde(default)]
    pub key_prefix: String,

    /// Skip the PUT when an identical object already exists (default: false)
    #[serde(default)]
    pub skip_existing: bool,

    /// Timeout for one upload request (default: 300 seconds)
    #[serde(default = "default_upload_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Multipart settings for large artifacts (S3 only)
    #[serde(default)]
    pub multipart: MultipartConfig,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            key_prefix: String::new(),
            skip_existing: false,
            timeout: default_upload_timeout(),
            multipart: MultipartConfig::default(),
        }
    }
}

/// Multipart upload settings
///
/// Artifacts of at least `threshold` bytes are sent in parts of `part_size`
/// bytes, `concurrency` parts at a time. The part size grows when an
/// artifact would otherwise need more than [`MAX_MULTIPART_PARTS`] parts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultipartConfig {
    /// Smallest artifact uploaded in parts, in bytes (default: 16 MiB)
    #[serde(default = "default_multipart_threshold")]
    pub threshold: u64,

    /// Bytes per part (default: 16 MiB, at least 5 MiB)
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Parts in flight per artifact (default: 2)
    #[serde(default = "default_part_concurrency")]
    pub concurrency: usize,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            threshold: default_multipart_threshold(),
            part_size: default_part_size(),
            concurrency: default_part_concurrency(),
        }
    }
}

/// Where artifacts go
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DestinationConfig {
    /// S3-compatible object storage
    S3 {
        /// Bucket name (env: S3_BUCKET)
        #[serde(default)]
        bucket: String,
        /// Region (env: AWS_DEFAULT_REGION / AWS_REGION)
        #[serde(default)]
        region: Option<String>,
        /// Custom endpoint for S3-compatible stores (env: S3_ENDPOINT)
        #[serde(default)]
        endpoint: Option<String>,
        /// Use path-style addressing (needed by most self-hosted stores)
        #[serde(default)]
        path_style: bool,
    },
    /// Plain HTTP(S) endpoint accepting PUT and HEAD
    Http {
        /// Base URL; keys are appended as path segments
        base_url: String,
        /// Name of the environment variable holding a bearer token
        #[serde(default)]
        token_env: Option<String>,
    },
}

impl Default for DestinationConfig {
    fn default() -> Self {
        DestinationConfig::S3 {
            bucket: String::new(),
            region: None,
            endpoint: None,
            path_style: false,
        }
    }
}

/// Main configuration for media-relay
///
/// Every section is optional; a missing section takes its defaults. Files are
/// JSON or TOML (by extension), and a few settings can be overridden from the
/// environment (see [`Config::apply_env`]).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Scratch storage
    #[serde(default)]
    pub scratch: ScratchConfig,

    /// Parallelism limits
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Source fetching
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Processing profiles and timeout
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// External tool paths
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Upload behaviour
    #[serde(default)]
    pub upload: UploadConfig,

    /// Destination store
    #[serde(default)]
    pub destination: DestinationConfig,
}

impl Config {
    /// Read a configuration file, picking the format from its extension
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("cannot read {}: {e}", path.display()),
            key: None,
        })?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match extension.as_deref() {
            Some("json") => serde_json::from_str(&contents).map_err(|e| Error::Config {
                message: format!("{}: {e}", path.display()),
                key: None,
            }),
            Some("toml") => toml::from_str(&contents).map_err(|e| Error::Config {
                message: format!("{}: {e}", path.display()),
                key: None,
            }),
            _ => Err(Error::Config {
                message: format!(
                    "{}: unsupported config format (expected .json or .toml)",
                    path.display()
                ),
                key: None,
            }),
        }
    }

    /// Load from an optional file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply overrides from the process environment
    ///
    /// Recognised: `S3_BUCKET`, `S3_ENDPOINT`, `AWS_DEFAULT_REGION` (or
    /// `AWS_REGION`) and `MEDIA_RELAY_SCRATCH_DIR`.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = non_empty("MEDIA_RELAY_SCRATCH_DIR") {
            self.scratch.dir = PathBuf::from(dir);
        }

        if let DestinationConfig::S3 {
            bucket,
            region,
            endpoint,
            ..
        } = &mut self.destination
        {
            if let Some(value) = non_empty("S3_BUCKET") {
                *bucket = value;
            }
            if let Some(value) = non_empty("S3_ENDPOINT") {
                *endpoint = Some(value);
            }
            if let Some(value) = non_empty("AWS_DEFAULT_REGION").or_else(|| non_empty("AWS_REGION"))
            {
                *region = Some(value);
            }
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let limits = [
            ("concurrency.workers", self.concurrency.workers),
            ("concurrency.fetch", self.concurrency.fetch),
            ("concurrency.process", self.concurrency.process),
            ("concurrency.upload", self.concurrency.upload),
        ];
        for (key, value) in limits {
            if value == 0 {
                return Err(Error::config("must be greater than 0", key));
            }
        }

        if self.fetch.timeout.is_zero() {
            return Err(Error::config("must be greater than 0", "fetch.timeout"));
        }
        if self.processing.timeout.is_zero() {
            return Err(Error::config("must be greater than 0", "processing.timeout"));
        }
        if self.upload.timeout.is_zero() {
            return Err(Error::config("must be greater than 0", "upload.timeout"));
        }

        let multipart = &self.upload.multipart;
        if !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&multipart.part_size) {
            return Err(Error::config(
                format!("must be between {MIN_PART_SIZE} and {MAX_PART_SIZE} bytes"),
                "upload.multipart.part_size",
            ));
        }
        if multipart.threshold == 0 {
            return Err(Error::config(
                "must be greater than 0",
                "upload.multipart.threshold",
            ));
        }
        if multipart.concurrency == 0 {
            return Err(Error::config(
                "must be greater than 0",
                "upload.multipart.concurrency",
            ));
        }

        for (key, retry) in [
            ("fetch.retry", &self.fetch.retry),
            ("upload.retry", &self.upload.retry),
        ] {
            if retry.max_attempts == 0 {
                return Err(Error::config(
                    "must be at least 1",
                    format!("{key}.max_attempts"),
                ));
            }
            if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&retry.backoff_multiplier) {
                return Err(Error::config(
                    format!("must be between 1.0 and {MAX_BACKOFF_MULTIPLIER}"),
                    format!("{key}.backoff_multiplier"),
                ));
            }
        }

        if self
            .processing
            .resolve_profile(&self.processing.default_profile)
            .is_none()
        {
            return Err(Error::config(
                format!("unknown profile '{}'", self.processing.default_profile),
                "processing.default_profile",
            ));
        }

        for (name, profile) in &self.processing.profiles {
            if profile.kind == ProfileKind::Ffmpeg && profile.output_extension.is_none() {
                return Err(Error::config(
                    "ffmpeg profiles need an output_extension",
                    format!("processing.profiles.{name}.output_extension"),
                ));
            }
        }

        match &self.destination {
            DestinationConfig::S3 { bucket, .. } => {
                if bucket.trim().is_empty() {
                    return Err(Error::config(
                        "bucket is required (set it in the config file or S3_BUCKET)",
                        "destination.bucket",
                    ));
                }
            }
            DestinationConfig::Http { base_url, .. } => {
                let parsed = url::Url::parse(base_url).map_err(|e| {
                    Error::config(format!("invalid URL: {e}"), "destination.base_url")
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(Error::config(
                        "must be an http or https URL",
                        "destination.base_url",
                    ));
                }
            }
        }

        Ok(())
    }
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("./scratch")
}

fn default_min_free_space() -> u64 {
    512 * 1024 * 1024
}

fn default_workers() -> usize {
    4
}

fn default_process_concurrency() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    format!("media-relay/{}", env!("CARGO_PKG_VERSION"))
}

fn default_ytdlp_format() -> String {
    "best[ext=mp4]".to_string()
}

fn default_ytdlp_hosts() -> Vec<String> {
    ["youtube.com", "www.youtube.com", "m.youtube.com", "music.youtube.com", "youtu.be"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_profile_name() -> String {
    PASSTHROUGH_PROFILE.to_string()
}

fn default_process_timeout() -> Duration {
    Duration::from_secs(3600)
}

fn default_upload_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_multipart_threshold() -> u64 {
    16 * 1024 * 1024
}

fn default_part_size() -> u64 {
    16 * 1024 * 1024
}

fn default_part_concurrency() -> usize {
    2
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
