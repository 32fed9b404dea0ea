//! S3-compatible object storage destination

use super::{Artifact, Destination, RemoteObject, classify_failure, unquote_etag};
use crate::config::{MAX_MULTIPART_PARTS, MultipartConfig};
use crate::error::UploadError;
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Region, RequestChecksumCalculation};
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use futures::{StreamExt, TryStreamExt, stream};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, instrument, warn};

/// Metadata key under which the artifact checksum is stored (`x-amz-meta-sha256`)
pub const SHA256_METADATA_KEY: &str = "sha256";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// S3 destination
///
/// Credentials come from the standard AWS environment (`AWS_ACCESS_KEY_ID`,
/// `AWS_SECRET_ACCESS_KEY`, profiles, instance roles). SDK-level retries are
/// disabled; the pipeline owns the retry policy. Artifacts at or above the
/// multipart threshold are uploaded in parts; a failed multipart upload is
/// aborted so no parts are left behind.
#[derive(Clone)]
pub struct S3Destination {
    client: Client,
    bucket: String,
    multipart: MultipartConfig,
}

impl S3Destination {
    /// Build a client for `bucket`
    pub async fn connect(
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
        path_style: bool,
        timeout: Duration,
        multipart: MultipartConfig,
    ) -> Self {
        let timeouts = aws_config::timeout::TimeoutConfig::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .operation_attempt_timeout(timeout)
            .build();

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .timeout_config(timeouts)
            .retry_config(aws_config::retry::RetryConfig::disabled());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(path_style)
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired);
        if let Some(endpoint) = &endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        let client = Client::from_conf(builder.build());

        info!(
            bucket = %bucket,
            endpoint = ?endpoint,
            path_style,
            multipart_threshold = multipart.threshold,
            "S3 destination initialized"
        );

        Self {
            client,
            bucket,
            multipart,
        }
    }

    /// Wrap an existing client, with default multipart settings
    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            multipart: MultipartConfig::default(),
        }
    }

    /// Replace the multipart settings
    pub fn with_multipart(mut self, multipart: MultipartConfig) -> Self {
        self.multipart = multipart;
        self
    }

    async fn put_single(
        &self,
        key: &str,
        artifact: &Artifact<'_>,
    ) -> Result<Option<String>, UploadError> {
        let body = ByteStream::from_path(artifact.path)
            .await
            .map_err(|e| UploadError::Io {
                path: artifact.path.to_path_buf(),
                source: std::io::Error::other(e),
            })?;

        debug!(bytes = artifact.size, "put_object");

        let output = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(artifact.content_type)
            .content_length(artifact.size as i64)
            .metadata(SHA256_METADATA_KEY, artifact.sha256)
            .send()
            .await
            .map_err(|e| classify_sdk_error(key, &e))?;

        Ok(output.e_tag().map(unquote_etag))
    }

    async fn put_multipart(
        &self,
        key: &str,
        artifact: &Artifact<'_>,
    ) -> Result<Option<String>, UploadError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(artifact.content_type)
            .metadata(SHA256_METADATA_KEY, artifact.sha256)
            .send()
            .await
            .map_err(|e| classify_sdk_error(key, &e))?;
        let Some(upload_id) = created.upload_id().map(str::to_string) else {
            return Err(UploadError::Network {
                key: key.to_string(),
                reason: "create_multipart_upload returned no upload id".to_string(),
            });
        };

        let part_size = part_size_for(self.multipart.part_size, artifact.size);
        let parts = plan_parts(artifact.size, part_size);
        debug!(
            bytes = artifact.size,
            parts = parts.len(),
            part_size,
            upload_id = %upload_id,
            "multipart upload started"
        );

        let completed = match self.upload_parts(key, &upload_id, artifact.path, parts).await {
            Ok(completed) => completed,
            Err(e) => {
                self.abort(key, &upload_id).await;
                return Err(e);
            }
        };

        let result = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await;

        match result {
            Ok(output) => Ok(output.e_tag().map(unquote_etag)),
            Err(e) => {
                let err = classify_sdk_error(key, &e);
                self.abort(key, &upload_id).await;
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        path: &Path,
        parts: Vec<PartRange>,
    ) -> Result<Vec<CompletedPart>, UploadError> {
        let mut completed: Vec<CompletedPart> = stream::iter(parts)
            .map(|part| self.upload_part(key, upload_id, path, part))
            .buffer_unordered(self.multipart.concurrency.max(1))
            .try_collect()
            .await?;
        completed.sort_by_key(|part| part.part_number());
        Ok(completed)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        path: &Path,
        part: PartRange,
    ) -> Result<CompletedPart, UploadError> {
        let io_error = |source: std::io::Error| UploadError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut file = tokio::fs::File::open(path).await.map_err(io_error)?;
        file.seek(std::io::SeekFrom::Start(part.offset))
            .await
            .map_err(io_error)?;
        let mut buf = vec![0u8; part.len as usize];
        file.read_exact(&mut buf).await.map_err(io_error)?;

        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part.number)
            .content_length(part.len as i64)
            .body(ByteStream::from(buf))
            .send()
            .await
            .map_err(|e| classify_sdk_error(key, &e))?;

        debug!(part = part.number, bytes = part.len, "part uploaded");

        Ok(CompletedPart::builder()
            .set_e_tag(output.e_tag().map(str::to_string))
            .part_number(part.number)
            .build())
    }

    async fn abort(&self, key: &str, upload_id: &str) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        match result {
            Ok(_) => debug!(key, upload_id, "multipart upload aborted"),
            Err(e) => warn!(
                key,
                upload_id,
                error = %DisplayErrorContext(&e),
                "failed to abort multipart upload"
            ),
        }
    }
}

/// One part of a multipart upload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PartRange {
    number: i32,
    offset: u64,
    len: u64,
}

/// Configured part size, grown so `size` fits in the part limit
fn part_size_for(configured: u64, size: u64) -> u64 {
    configured.max(size.div_ceil(MAX_MULTIPART_PARTS)).max(1)
}

fn plan_parts(size: u64, part_size: u64) -> Vec<PartRange> {
    let mut parts = Vec::new();
    let mut offset = 0;
    let mut number = 1;
    while offset < size {
        let len = part_size.min(size - offset);
        parts.push(PartRange {
            number,
            offset,
            len,
        });
        offset += len;
        number += 1;
    }
    parts
}

fn classify_sdk_error<E>(key: &str, err: &SdkError<E, HttpResponse>) -> UploadError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match err {
        SdkError::ServiceError(ctx) => classify_failure(
            key,
            Some(ctx.raw().status().as_u16()),
            ctx.err().code(),
            ctx.err()
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| DisplayErrorContext(err).to_string()),
        ),
        // timeouts, dispatch and response-parsing failures
        _ => classify_failure(key, None, None, DisplayErrorContext(err).to_string()),
    }
}

#[async_trait]
impl Destination for S3Destination {
    #[instrument(skip(self, artifact), fields(bucket = %self.bucket))]
    async fn put(
        &self,
        key: &str,
        artifact: Artifact<'_>,
    ) -> Result<Option<String>, UploadError> {
        if artifact.size >= self.multipart.threshold {
            self.put_multipart(key, &artifact).await
        } else {
            self.put_single(key, &artifact).await
        }
    }

    async fn head(&self, key: &str) -> Result<Option<RemoteObject>, UploadError> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(SdkError::ServiceError(ctx))
                if ctx.err().is_not_found() || ctx.raw().status().as_u16() == 404 =>
            {
                return Ok(None);
            }
            Err(e) => return Err(classify_sdk_error(key, &e)),
        };

        Ok(Some(RemoteObject {
            size: output
                .content_length()
                .and_then(|len| u64::try_from(len).ok()),
            sha256: output
                .metadata()
                .and_then(|m| m.get(SHA256_METADATA_KEY))
                .cloned(),
            etag: output.e_tag().map(unquote_etag),
        }))
    }

    async fn check_access(&self) -> Result<(), UploadError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&self.bucket, &e))?;
        Ok(())
    }

    fn describe(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    fn name(&self) -> &'static str {
        "s3"
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // Static credentials so the SDK never consults the host environment
    async fn destination(server: &MockServer) -> S3Destination {
        let credentials =
            aws_sdk_s3::config::Credentials::new("test-key", "test-secret", None, None, "tests");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new("us-east-1"))
            .endpoint_url(server.uri())
            .force_path_style(true)
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .retry_config(aws_sdk_s3::config::retry::RetryConfig::disabled())
            .build();
        S3Destination::from_client(Client::from_conf(config), "media")
    }

    #[test]
    fn describe_uses_s3_scheme() {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .build();
        let dest = S3Destination::from_client(Client::from_conf(config), "media");
        assert_eq!(dest.describe("pdfs/a.pdf"), "s3://media/pdfs/a.pdf");
    }

    #[tokio::test]
    async fn put_sends_checksum_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/media/pdfs/a.pdf"))
            .and(header("x-amz-meta-sha256", "abc123"))
            .respond_with(ResponseTemplate::new(200).insert_header("etag", "\"etag-1\""))
            .expect(1)
            .mount(&server)
            .await;

        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), b"test").unwrap();
        let dest = destination(&server).await;

        let etag = dest
            .put(
                "pdfs/a.pdf",
                Artifact {
                    path: temp.path(),
                    content_type: "application/pdf",
                    sha256: "abc123",
                    size: 4,
                },
            )
            .await
            .unwrap();

        assert_eq!(etag.as_deref(), Some("etag-1"));
    }

    #[tokio::test]
    async fn head_of_missing_object_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/media/pdfs/missing.pdf"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dest = destination(&server).await;
        assert!(dest.head("pdfs/missing.pdf").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn access_denied_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/media/pdfs/a.pdf"))
            .respond_with(ResponseTemplate::new(403).set_body_string(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>",
            ))
            .mount(&server)
            .await;

        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), b"test").unwrap();
        let dest = destination(&server).await;

        let err = dest
            .put(
                "pdfs/a.pdf",
                Artifact {
                    path: temp.path(),
                    content_type: "application/pdf",
                    sha256: "abc123",
                    size: 4,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Auth { .. }), "{err}");
    }

    const UPLOAD_ID: &str = "upload-1";

    fn small_parts() -> MultipartConfig {
        MultipartConfig {
            threshold: 8,
            part_size: 4,
            concurrency: 2,
        }
    }

    fn ten_byte_file() -> tempfile::NamedTempFile {
        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), b"0123456789").unwrap();
        temp
    }

    fn artifact(path: &Path) -> Artifact<'_> {
        Artifact {
            path,
            content_type: "video/mp4",
            sha256: "abc123",
            size: 10,
        }
    }

    async fn mount_create(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/media/videos/big.mp4"))
            .and(query_param("uploads", ""))
            .and(header("x-amz-meta-sha256", "abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <InitiateMultipartUploadResult>\
                 <Bucket>media</Bucket><Key>videos/big.mp4</Key><UploadId>{UPLOAD_ID}</UploadId>\
                 </InitiateMultipartUploadResult>"
            )))
            .expect(1)
            .mount(server)
            .await;
    }

    #[test]
    fn parts_cover_the_file_in_order() {
        let parts = plan_parts(10, 4);
        assert_eq!(
            parts,
            vec![
                PartRange { number: 1, offset: 0, len: 4 },
                PartRange { number: 2, offset: 4, len: 4 },
                PartRange { number: 3, offset: 8, len: 2 },
            ]
        );
        assert!(plan_parts(0, 4).is_empty());
    }

    #[test]
    fn part_size_grows_to_respect_the_part_limit() {
        let part = 16 * 1024 * 1024;
        assert_eq!(part_size_for(part, 100 * 1024 * 1024), part);

        let huge = 500 * 1024 * 1024 * 1024;
        let grown = part_size_for(part, huge);
        assert!(grown > part);
        assert!(plan_parts(huge, grown).len() as u64 <= MAX_MULTIPART_PARTS);
    }

    #[tokio::test]
    async fn large_artifact_is_uploaded_in_parts() {
        let server = MockServer::start().await;
        mount_create(&server).await;
        for part in 1..=3 {
            Mock::given(method("PUT"))
                .and(path("/media/videos/big.mp4"))
                .and(query_param("uploadId", UPLOAD_ID))
                .and(query_param("partNumber", part.to_string()))
                .respond_with(
                    ResponseTemplate::new(200).insert_header("etag", format!("\"part-{part}\"")),
                )
                .expect(1)
                .mount(&server)
                .await;
        }
        Mock::given(method("POST"))
            .and(path("/media/videos/big.mp4"))
            .and(query_param("uploadId", UPLOAD_ID))
            .and(body_string_contains("<PartNumber>3</PartNumber>"))
            .and(body_string_contains("part-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <CompleteMultipartUploadResult>\
                 <Bucket>media</Bucket><Key>videos/big.mp4</Key><ETag>\"final-3\"</ETag>\
                 </CompleteMultipartUploadResult>",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let file = ten_byte_file();
        let dest = destination(&server).await.with_multipart(small_parts());

        let etag = dest
            .put("videos/big.mp4", artifact(file.path()))
            .await
            .unwrap();

        assert_eq!(etag.as_deref(), Some("final-3"));
    }

    #[tokio::test]
    async fn failed_part_aborts_the_upload() {
        let server = MockServer::start().await;
        mount_create(&server).await;
        Mock::given(method("PUT"))
            .and(path("/media/videos/big.mp4"))
            .and(query_param("uploadId", UPLOAD_ID))
            .respond_with(ResponseTemplate::new(403).set_body_string(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>",
            ))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/media/videos/big.mp4"))
            .and(query_param("uploadId", UPLOAD_ID))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/media/videos/big.mp4"))
            .and(query_param("uploadId", UPLOAD_ID))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let file = ten_byte_file();
        let dest = destination(&server).await.with_multipart(small_parts());

        let err = dest
            .put("videos/big.mp4", artifact(file.path()))
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Auth { .. }), "{err}");
    }
}
