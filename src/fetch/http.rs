//! Plain HTTP(S) fetch strategy

use super::{SourceFetcher, StreamDigest, check_expected};
use crate::config::FetchConfig;
use crate::error::{Error, FetchError, Result};
use crate::scratch::ScratchDir;
use crate::types::{FetchResult, WorkItem};
use crate::utils::{extract_filename_from_response, file_extension};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Streams an HTTP response body into scratch storage
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Build the HTTP client with the configured timeouts
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Other(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    async fn stream_to_file(
        &self,
        item: &WorkItem,
        response: reqwest::Response,
        part_path: &Path,
    ) -> std::result::Result<(String, String, u64), FetchError> {
        let url = &item.source_url;
        let declared_len = response.content_length();

        let io_err = |source: std::io::Error| FetchError::Io {
            path: part_path.to_path_buf(),
            source,
        };

        let mut file = tokio::fs::File::create(part_path).await.map_err(io_err)?;
        let mut digest = StreamDigest::new();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| FetchError::Network {
                url: url.clone(),
                reason: format!("body read failed after {} bytes: {e}", digest.len()),
            })?;
            digest.update(&chunk);
            file.write_all(&chunk).await.map_err(io_err)?;
        }

        file.flush().await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        let (sha256, md5, size) = digest.finish();

        if let Some(declared) = declared_len
            && declared != size
        {
            return Err(FetchError::IntegrityMismatch {
                url: url.clone(),
                expected: format!("{declared} bytes (Content-Length)"),
                actual: format!("{size} bytes"),
            });
        }
        check_expected(item, &sha256, size)?;

        Ok((sha256, md5, size))
    }
}

/// Classify a transport-level failure
fn classify_send_error(url: &str, error: reqwest::Error) -> FetchError {
    if error.is_builder() {
        return FetchError::NotFound {
            url: url.to_string(),
            reason: format!("malformed URL: {error}"),
        };
    }
    let reason = if error.is_timeout() {
        format!("timed out: {error}")
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        error.to_string()
    };
    FetchError::Network {
        url: url.to_string(),
        reason,
    }
}

/// Classify a non-success HTTP status
fn classify_status(url: &str, status: StatusCode) -> FetchError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => FetchError::NotFound {
            url: url.to_string(),
            reason: format!("HTTP {}", status.as_u16()),
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => FetchError::Network {
            url: url.to_string(),
            reason: format!("HTTP {}", status.as_u16()),
        },
        s if s.is_server_error() => FetchError::Network {
            url: url.to_string(),
            reason: format!("HTTP {}", s.as_u16()),
        },
        s => FetchError::HttpStatus {
            url: url.to_string(),
            status: s.as_u16(),
        },
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(
        &self,
        item: &WorkItem,
        scratch: &ScratchDir,
    ) -> std::result::Result<FetchResult, FetchError> {
        let url = item.source_url.as_str();

        let parsed = url::Url::parse(url).map_err(|e| FetchError::NotFound {
            url: url.to_string(),
            reason: format!("malformed URL: {e}"),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::NotFound {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| classify_send_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(url, status));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let extension = extract_filename_from_response(&response, url)
            .as_deref()
            .and_then(file_extension);

        let part_path = scratch.source_part_path(&item.id, extension.as_deref());
        let final_path: PathBuf = scratch.source_path(&item.id, extension.as_deref());

        debug!(item_id = %item.id, path = ?part_path, "streaming source to scratch");

        let (sha256, md5, size) = match self.stream_to_file(item, response, &part_path).await {
            Ok(done) => done,
            Err(e) => {
                remove_partial(&part_path).await;
                return Err(e);
            }
        };

        if let Err(source) = tokio::fs::rename(&part_path, &final_path).await {
            remove_partial(&part_path).await;
            return Err(FetchError::Io {
                path: final_path,
                source,
            });
        }

        info!(item_id = %item.id, bytes = size, sha256 = %sha256, "fetched source");

        Ok(FetchResult {
            local_path: final_path,
            size_bytes: size,
            sha256,
            md5,
            content_type,
            attempts: 1,
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = ?path, "removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?path, error = %e, "failed to remove partial download"),
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkItemId;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TEST_SHA: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    fn item(url: &str) -> WorkItem {
        WorkItem::new(
            WorkItemId::derive(url, "pdfs/", "passthrough"),
            url,
            "pdfs/",
            "passthrough",
        )
    }

    async fn setup() -> (MockServer, TempDir, ScratchDir, HttpFetcher) {
        let server = MockServer::start().await;
        let temp = TempDir::new().unwrap();
        let scratch = ScratchDir::open(temp.path()).await.unwrap();
        let fetcher = HttpFetcher::new(&FetchConfig::default()).unwrap();
        (server, temp, scratch, fetcher)
    }

    fn scratch_is_empty(temp: &TempDir) -> bool {
        std::fs::read_dir(temp.path()).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn remove_partial_deletes_file_and_tolerates_missing() {
        let temp = TempDir::new().unwrap();
        let part = temp.path().join("0123456789abcdef.src.pdf.part");
        std::fs::write(&part, b"partial").unwrap();

        remove_partial(&part).await;
        assert!(!part.exists());

        // Already gone: nothing to do
        remove_partial(&part).await;
        assert!(scratch_is_empty(&temp));
    }

    #[tokio::test]
    async fn streams_body_and_hashes_it() {
        let (server, _temp, scratch, fetcher) = setup().await;
        Mock::given(method("GET"))
            .and(path("/docs/a.pdf"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"test".to_vec())
                    .insert_header("content-type", "application/pdf"),
            )
            .mount(&server)
            .await;

        let it = item(&format!("{}/docs/a.pdf", server.uri()));
        let result = fetcher.fetch(&it, &scratch).await.unwrap();

        assert_eq!(result.size_bytes, 4);
        assert_eq!(result.sha256, TEST_SHA);
        assert_eq!(result.md5, "098f6bcd4621d373cade4e832627b4f6");
        assert_eq!(result.content_type.as_deref(), Some("application/pdf"));
        assert_eq!(result.local_path, scratch.source_path(&it.id, Some("pdf")));
        assert_eq!(std::fs::read(&result.local_path).unwrap(), b"test");
    }

    #[tokio::test]
    async fn extension_falls_back_to_content_disposition() {
        let (server, _temp, scratch, fetcher) = setup().await;
        Mock::given(method("GET"))
            .and(path("/export"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"slides".to_vec())
                    .insert_header("content-disposition", r#"attachment; filename="deck.pptx""#),
            )
            .mount(&server)
            .await;

        let it = item(&format!("{}/export", server.uri()));
        let result = fetcher.fetch(&it, &scratch).await.unwrap();

        assert_eq!(result.local_path, scratch.source_path(&it.id, Some("pptx")));
    }

    #[tokio::test]
    async fn not_found_and_gone_are_not_found() {
        let (server, temp, scratch, fetcher) = setup().await;
        Mock::given(method("GET"))
            .and(path("/missing.pdf"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone.pdf"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        for p in ["/missing.pdf", "/gone.pdf"] {
            let err = fetcher
                .fetch(&item(&format!("{}{p}", server.uri())), &scratch)
                .await
                .unwrap_err();
            assert!(matches!(err, FetchError::NotFound { .. }), "{p}: {err}");
        }
        assert!(scratch_is_empty(&temp));
    }

    #[tokio::test]
    async fn server_errors_and_throttling_are_network_errors() {
        let (server, _temp, scratch, fetcher) = setup().await;
        for (p, code) in [("/busy", 503), ("/slow", 429), ("/timeout", 408)] {
            Mock::given(method("GET"))
                .and(path(p))
                .respond_with(ResponseTemplate::new(code))
                .mount(&server)
                .await;
            let err = fetcher
                .fetch(&item(&format!("{}{p}", server.uri())), &scratch)
                .await
                .unwrap_err();
            assert!(matches!(err, FetchError::Network { .. }), "{code}: {err}");
        }
    }

    #[tokio::test]
    async fn other_client_errors_are_http_status() {
        let (server, _temp, scratch, fetcher) = setup().await;
        Mock::given(method("GET"))
            .and(path("/private.pdf"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = fetcher
            .fetch(&item(&format!("{}/private.pdf", server.uri())), &scratch)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 403, .. }));
    }

    #[tokio::test]
    async fn malformed_urls_are_not_found() {
        let (_server, _temp, scratch, fetcher) = setup().await;
        for url in ["not a url", "ftp://example.com/a.pdf", "http://"] {
            let err = fetcher.fetch(&item(url), &scratch).await.unwrap_err();
            assert!(matches!(err, FetchError::NotFound { .. }), "{url}: {err}");
        }
    }

    #[tokio::test]
    async fn checksum_mismatch_leaves_no_scratch_file() {
        let (server, temp, scratch, fetcher) = setup().await;
        Mock::given(method("GET"))
            .and(path("/a.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
            .mount(&server)
            .await;

        let mut it = item(&format!("{}/a.pdf", server.uri()));
        it.expected_sha256 = Some(TEST_SHA.to_string());

        let err = fetcher.fetch(&it, &scratch).await.unwrap_err();

        assert!(matches!(err, FetchError::IntegrityMismatch { .. }));
        assert!(scratch_is_empty(&temp), "partial file must be removed");
    }

    #[tokio::test]
    async fn size_mismatch_is_integrity_error() {
        let (server, temp, scratch, fetcher) = setup().await;
        Mock::given(method("GET"))
            .and(path("/a.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"test".to_vec()))
            .mount(&server)
            .await;

        let mut it = item(&format!("{}/a.pdf", server.uri()));
        it.expected_size = Some(10);

        let err = fetcher.fetch(&it, &scratch).await.unwrap_err();
        assert!(matches!(err, FetchError::IntegrityMismatch { .. }));
        assert!(scratch_is_empty(&temp));
    }
}
