use crate::storage::{BlobObjects, BlobReader, ByteRange, Envelope, validate_hash};
use crate::{KeelError, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::{Body, Client, Response, StatusCode, Url, header};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::io::{ReaderStream, StreamReader};

pub const SHA512_HEADER: &str = "x-keel-sha512";
pub const SIZE_HEADER: &str = "x-keel-size";
pub const CREATED_AT_HEADER: &str = "x-keel-created-at";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: String,
}

/// Client for the internal object protocol of one peer.
///
/// `delete_blob` asks the peer to tombstone the object; peers never delete
/// bytes on a remote request.
#[derive(Clone)]
pub struct PeerClient {
    client: Client,
    base_url: Url,
    token: String,
}

impl PeerClient {
    pub fn new(advertise_addr: &str, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|error| KeelError::Http(error.to_string()))?;
        Self::with_client(client, advertise_addr, token)
    }

    pub fn with_client(
        client: Client,
        advertise_addr: &str,
        token: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            client,
            base_url: base_url(advertise_addr)?,
            token: token.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn objects_url(&self) -> Result<Url> {
        self.base_url
            .join("internal/v1/objects")
            .map_err(|error| KeelError::Http(error.to_string()))
    }

    fn object_url(&self, sha512: &str) -> Result<Url> {
        validate_hash(sha512)?;
        self.base_url
            .join(&format!("internal/v1/objects/{}", sha512))
            .map_err(|error| KeelError::Http(error.to_string()))
    }

    async fn send_get(&self, sha512: &str, range: Option<ByteRange>) -> Result<Response> {
        let mut request = self
            .client
            .get(self.object_url(sha512)?)
            .bearer_auth(&self.token);
        if let Some(range) = range {
            request = request.header(header::RANGE, range_header(range));
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(status_error(response, sha512, None).await);
        }
        Ok(response)
    }
}

fn range_header(range: ByteRange) -> String {
    format!("bytes={}-{}", range.start, range.end)
}

/// Accepts `host:port` as well as full URLs.
fn base_url(advertise_addr: &str) -> Result<Url> {
    let trimmed = advertise_addr.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(KeelError::Config(
            "peer advertise address cannot be empty".to_string(),
        ));
    }

    let with_scheme = if trimmed.contains("://") {
        format!("{}/", trimmed)
    } else {
        format!("http://{}/", trimmed)
    };

    Url::parse(&with_scheme).map_err(|error| {
        KeelError::Config(format!(
            "invalid peer address '{}': {}",
            advertise_addr, error
        ))
    })
}

async fn status_error(response: Response, subject: &str, expected: Option<&str>) -> KeelError {
    let status = response.status();
    let message = match response.json::<ErrorPayload>().await {
        Ok(payload) => payload.error,
        Err(_) => status.to_string(),
    };

    match status {
        StatusCode::NOT_FOUND => KeelError::NotFound(format!("object {}", subject)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => KeelError::Unauthorized(message),
        StatusCode::UNPROCESSABLE_ENTITY => KeelError::HashMismatch {
            expected: expected.unwrap_or_default().to_string(),
            actual: message,
        },
        StatusCode::RANGE_NOT_SATISFIABLE => KeelError::InvalidRange(message),
        StatusCode::SERVICE_UNAVAILABLE => KeelError::Unavailable(message),
        _ => KeelError::Http(format!(
            "status={} subject={} error={}",
            status, subject, message
        )),
    }
}

fn envelope_from_headers(sha512: &str, headers: &header::HeaderMap) -> Result<Envelope> {
    let size_bytes = headers
        .get(SIZE_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .ok_or_else(|| KeelError::Http(format!("missing {} header", SIZE_HEADER)))?;

    let created_at = headers
        .get(CREATED_AT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| chrono::DateTime::parse_from_rfc3339(value).ok())
        .map(|value| value.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(Envelope {
        sha512: sha512.to_string(),
        size_bytes,
        created_at,
    })
}

#[async_trait]
impl BlobObjects for PeerClient {
    async fn write_blob(
        &self,
        body: BlobReader,
        expected_sha512: Option<&str>,
    ) -> Result<Envelope> {
        let mut request = self
            .client
            .put(self.objects_url()?)
            .bearer_auth(&self.token)
            .header(header::CONTENT_TYPE, "application/octet-stream");
        if let Some(expected) = expected_sha512 {
            request = request.header(SHA512_HEADER, expected);
        }

        let response = request
            .body(Body::wrap_stream(ReaderStream::new(body)))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response, "upload", expected_sha512).await);
        }

        let envelope = response.json::<Envelope>().await?;
        Ok(envelope)
    }

    async fn open_blob(&self, sha512: &str, range: Option<ByteRange>) -> Result<BlobReader> {
        let response = self.send_get(sha512, range).await?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    async fn blob_envelope(&self, sha512: &str) -> Result<Envelope> {
        let response = self
            .client
            .head(self.object_url(sha512)?)
            .bearer_auth(&self.token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response, sha512, None).await);
        }
        envelope_from_headers(sha512, response.headers())
    }

    async fn delete_blob(&self, sha512: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.object_url(sha512)?)
            .bearer_auth(&self.token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response, sha512, None).await);
        }
        Ok(())
    }

    async fn list_blobs(&self) -> Result<Vec<Envelope>> {
        let response = self
            .client
            .get(self.objects_url()?)
            .bearer_auth(&self.token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response, "list", None).await);
        }

        let envelopes = response.json::<Vec<Envelope>>().await?;
        Ok(envelopes)
    }
}
