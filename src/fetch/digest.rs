//! Incremental hashing of fetched bytes

use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 64 * 1024;

/// SHA-256 and MD5 computed over a byte stream, plus its length
///
/// SHA-256 is the integrity checksum; MD5 is kept because single-part S3
/// ETags are the MD5 of the object.
pub struct StreamDigest {
    sha256: Sha256,
    md5: md5::Context,
    len: u64,
}

impl Default for StreamDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDigest {
    /// Start an empty digest
    pub fn new() -> Self {
        Self {
            sha256: Sha256::new(),
            md5: md5::Context::new(),
            len: 0,
        }
    }

    /// Feed the next chunk
    pub fn update(&mut self, chunk: &[u8]) {
        self.sha256.update(chunk);
        self.md5.consume(chunk);
        self.len += chunk.len() as u64;
    }

    /// Bytes seen so far
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether no bytes have been seen
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finish into (sha256 hex, md5 hex, length)
    pub fn finish(self) -> (String, String, u64) {
        (
            format!("{:x}", self.sha256.finalize()),
            format!("{:x}", self.md5.compute()),
            self.len,
        )
    }
}

/// Hash a file already on disk
pub async fn hash_file(path: &Path) -> std::io::Result<(String, String, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut digest = StreamDigest::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(digest.finish())
}
