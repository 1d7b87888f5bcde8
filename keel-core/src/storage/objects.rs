use crate::error::{KeelError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Length of a hex encoded SHA-512 digest.
pub const SHA512_HEX_LEN: usize = 128;

pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Inclusive byte range of an object, as in `Range: bytes=start-end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Checks the range against an object of `size_bytes`. Ranges reaching
    /// past the end are clamped; ranges starting past it are rejected.
    pub fn resolve(self, size_bytes: u64) -> Result<ByteRange> {
        if self.start > self.end || self.start >= size_bytes {
            return Err(KeelError::InvalidRange(format!(
                "range not satisfiable: start={} end={} size={}",
                self.start, self.end, size_bytes
            )));
        }
        Ok(ByteRange {
            start: self.start,
            end: self.end.min(size_bytes - 1),
        })
    }

    pub fn content_range(&self, size_bytes: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size_bytes)
    }
}

/// Handed back to writers; identifies an immutable object by its content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub sha512: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Object operations shared by the local store, remote peers and the
/// cluster itself.
#[async_trait]
pub trait BlobObjects: Send + Sync {
    /// Streams `body` into storage. When `expected_sha512` is set and the
    /// content hashes differently nothing is stored.
    async fn write_blob(
        &self,
        body: BlobReader,
        expected_sha512: Option<&str>,
    ) -> Result<Envelope>;

    /// Opens the object, or only `range` of it.
    async fn open_blob(&self, sha512: &str, range: Option<ByteRange>) -> Result<BlobReader>;

    async fn blob_envelope(&self, sha512: &str) -> Result<Envelope>;

    async fn delete_blob(&self, sha512: &str) -> Result<()>;

    async fn list_blobs(&self) -> Result<Vec<Envelope>>;
}

pub fn reader_from_bytes(data: impl Into<Bytes>) -> BlobReader {
    Box::new(std::io::Cursor::new(data.into()))
}

pub async fn read_all(mut reader: BlobReader) -> Result<Bytes> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn is_valid_hash(value: &str) -> bool {
    value.len() == SHA512_HEX_LEN
        && value
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
}

pub fn validate_hash(value: &str) -> Result<()> {
    if !is_valid_hash(value) {
        return Err(KeelError::InvalidRequest(format!(
            "invalid sha512 content hash: {}",
            value
        )));
    }
    Ok(())
}
