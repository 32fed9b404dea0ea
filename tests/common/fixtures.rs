//! Test fixtures: an in-memory destination, source servers and work items

use async_trait::async_trait;
use media_relay::upload::{Artifact, Destination, RemoteObject};
use media_relay::{
    FetchError, FetchResult, ScratchDir, SourceFetcher, UploadError, WorkItem, WorkItemId,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// How the in-memory destination answers `put`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PutBehavior {
    /// Store the object
    #[default]
    Accept,
    /// Refuse credentials on every put
    RejectAuth,
    /// Fail transiently this many times, then accept
    FailTransiently(u32),
}

/// Destination that keeps objects in memory and counts calls
#[derive(Default)]
pub struct MemoryDestination {
    objects: Mutex<HashMap<String, (RemoteObject, Vec<u8>)>>,
    puts: AtomicU32,
    behavior: PutBehavior,
}

impl MemoryDestination {
    /// Destination with a specific put behavior
    pub fn with_behavior(behavior: PutBehavior) -> Self {
        Self {
            behavior,
            ..Self::default()
        }
    }

    /// Number of put calls made
    pub fn put_count(&self) -> u32 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Bytes stored under `key`
    pub fn bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(_, bytes)| bytes.clone())
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    async fn put(&self, key: &str, artifact: Artifact<'_>) -> Result<Option<String>, UploadError> {
        let call = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.behavior {
            PutBehavior::RejectAuth => {
                return Err(UploadError::Auth {
                    key: key.to_string(),
                    reason: "InvalidAccessKeyId".to_string(),
                });
            }
            PutBehavior::FailTransiently(n) if call <= n => {
                return Err(UploadError::Network {
                    key: key.to_string(),
                    reason: "connection reset".to_string(),
                });
            }
            _ => {}
        }

        let bytes = std::fs::read(artifact.path).map_err(|source| UploadError::Io {
            path: artifact.path.to_path_buf(),
            source,
        })?;
        let etag = format!("etag-{call}");
        self.objects.lock().unwrap().insert(
            key.to_string(),
            (
                RemoteObject {
                    size: Some(bytes.len() as u64),
                    sha256: Some(artifact.sha256.to_string()),
                    etag: Some(etag.clone()),
                },
                bytes,
            ),
        );
        Ok(Some(etag))
    }

    async fn head(&self, key: &str) -> Result<Option<RemoteObject>, UploadError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(remote, _)| remote.clone()))
    }

    async fn check_access(&self) -> Result<(), UploadError> {
        Ok(())
    }

    fn describe(&self, key: &str) -> String {
        format!("memory://{key}")
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Fetcher that leaves a source file in scratch and then panics
pub struct CrashingFetcher;

#[async_trait]
impl SourceFetcher for CrashingFetcher {
    async fn fetch(&self, item: &WorkItem, scratch: &ScratchDir) -> Result<FetchResult, FetchError> {
        let path = scratch.source_path(&item.id, Some("pdf"));
        std::fs::write(&path, b"half a file").unwrap();
        panic!("fetcher crashed after writing {}", path.display());
    }

    fn name(&self) -> &'static str {
        "crashing"
    }
}

/// Serve `body` at `route` on the mock server
pub async fn mount_source(server: &MockServer, route: &str, body: &[u8], content_type: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", content_type)
                .set_body_bytes(body.to_vec()),
        )
        .mount(server)
        .await;
}

/// Pending passthrough item for `url`, with an id derived the way the manifest does
pub fn passthrough_item(url: &str, destination: &str) -> WorkItem {
    WorkItem::new(
        WorkItemId::derive(url, destination, "passthrough"),
        url,
        destination,
        "passthrough",
    )
}
