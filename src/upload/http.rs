//! Plain HTTP(S) destination
//!
//! Objects are written with `PUT {base_url}/{key}` and read back with `HEAD`.
//! The artifact checksum travels in the `x-checksum-sha256` header; servers
//! that echo it back on `HEAD` get a full checksum confirmation, others are
//! confirmed by size and ETag.

use super::{Artifact, Destination, RemoteObject, classify_failure, unquote_etag};
use crate::error::{Error, Result, UploadError};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderMap};
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument};

/// Header carrying the artifact SHA-256
pub const CHECKSUM_HEADER: &str = "x-checksum-sha256";

/// HTTP destination
pub struct HttpDestination {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpDestination {
    /// Create a destination rooted at `base_url`, optionally authenticating
    /// with a bearer token
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(base_url).map_err(|e| {
            Error::config(
                format!("invalid destination URL {base_url}: {e}"),
                "destination.base_url",
            )
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::config(
                format!("destination URL must be http or https, got {}", parsed.scheme()),
                "destination.base_url",
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Other(format!("failed to create HTTP client: {e}")))?;

        let base_url = base_url.trim_end_matches('/').to_string();
        info!(base_url = %base_url, authenticated = token.is_some(), "HTTP destination initialized");

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn url_for(&self, key: &str) -> String {
        let encoded: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/{}", self.base_url, encoded.join("/"))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn failure(key: &str, response: reqwest::Response) -> UploadError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = if body.trim().is_empty() {
            format!("HTTP {status}")
        } else {
            body.trim().chars().take(512).collect()
        };
        classify_failure(key, Some(status), None, message)
    }
}

fn send_error(key: &str, err: &reqwest::Error) -> UploadError {
    classify_failure(key, None, None, err.to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl reqwest::header::AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[async_trait]
impl Destination for HttpDestination {
    #[instrument(skip(self, artifact), fields(base_url = %self.base_url))]
    async fn put(
        &self,
        key: &str,
        artifact: Artifact<'_>,
    ) -> std::result::Result<Option<String>, UploadError> {
        let file = tokio::fs::File::open(artifact.path)
            .await
            .map_err(|source| UploadError::Io {
                path: artifact.path.to_path_buf(),
                source,
            })?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        debug!(bytes = artifact.size, "PUT");

        let request = self
            .client
            .put(self.url_for(key))
            .header(CONTENT_TYPE, artifact.content_type)
            .header(CONTENT_LENGTH, artifact.size)
            .header(CHECKSUM_HEADER, artifact.sha256)
            .body(body);

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| send_error(key, &e))?;

        if !response.status().is_success() {
            return Err(Self::failure(key, response).await);
        }

        Ok(header_str(response.headers(), ETAG).map(unquote_etag))
    }

    async fn head(&self, key: &str) -> std::result::Result<Option<RemoteObject>, UploadError> {
        let response = self
            .authorize(self.client.head(self.url_for(key)))
            .send()
            .await
            .map_err(|e| send_error(key, &e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::failure(key, response).await);
        }

        // HEAD responses have no body, so the length comes from the header
        let headers = response.headers();
        Ok(Some(RemoteObject {
            size: header_str(headers, CONTENT_LENGTH).and_then(|v| v.trim().parse().ok()),
            sha256: header_str(headers, CHECKSUM_HEADER).map(str::to_string),
            etag: header_str(headers, ETAG).map(unquote_etag),
        }))
    }

    async fn check_access(&self) -> std::result::Result<(), UploadError> {
        let response = self
            .authorize(self.client.head(&self.base_url))
            .send()
            .await
            .map_err(|e| send_error(&self.base_url, &e))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(Self::failure(&self.base_url, response).await)
            }
            // a bare prefix often answers 404 or 405 even when writable
            _ => Ok(()),
        }
    }

    fn describe(&self, key: &str) -> String {
        self.url_for(key)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
