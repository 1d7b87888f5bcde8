use crate::config::Config;
use axum::{
    Json, Router,
    body::Body,
    extract::DefaultBodyLimit,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::StreamExt;
use keel_core::{
    BlobCluster, BlobObjects, BlobReader, ByteRange, CREATED_AT_HEADER, Envelope, FsBlobStore,
    HttpPeerConnector, KeelError, Result, SHA512_HEADER, SIZE_HEADER, SystemClock, validate_hash,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::io::{ReaderStream, StreamReader};

mod external;
mod internal;
mod types;

use external::{
    health, v1_delete_object, v1_get_manifest, v1_get_object, v1_list_objects, v1_peers,
    v1_put_object,
};
use internal::{
    internal_delete_object, internal_get_object, internal_head_object, internal_list_objects,
    internal_put_object,
};
pub(crate) use types::*;

pub struct ServerState {
    pub(crate) cluster: Arc<BlobCluster>,
    pub(crate) peer_token: String,
}

pub async fn run_server(config: Config) -> Result<()> {
    let cluster_config = config.to_cluster_config()?;
    let peer_id = cluster_config.peer_id.clone();

    let local: Arc<dyn BlobObjects> = Arc::new(FsBlobStore::new(config.blob_dir())?);
    let backend = config.backend_builder().build()?;
    let connector = Arc::new(HttpPeerConnector::new(
        peer_id.clone(),
        local.clone(),
        config.peer_auth.token.clone(),
    ));
    let cluster = Arc::new(BlobCluster::new(
        cluster_config,
        local,
        backend,
        connector,
        Arc::new(SystemClock),
    )?);

    cluster.heartbeat().await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let duties = cluster.start(shutdown_rx);

    let state = Arc::new(ServerState {
        cluster,
        peer_token: config.peer_auth.token.clone(),
    });
    let app = build_router(state);

    let listener = TcpListener::bind(&config.node.bind_addr).await?;
    tracing::info!(
        "Keel node {} listening on {} (advertised as {})",
        peer_id,
        config.node.bind_addr,
        config.advertise_addr()
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    tracing::info!("Stopping background duties");
    let _ = shutdown_tx.send(true);
    for duty in duties {
        if let Err(error) = duty.await {
            tracing::warn!("Background duty ended abnormally: {}", error);
        }
    }

    served.map_err(|error| KeelError::Http(error.to_string()))
}

pub(crate) fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/peers", get(v1_peers))
        .route("/api/v1/objects", get(v1_list_objects).put(v1_put_object))
        .route(
            "/api/v1/objects/:hash",
            get(v1_get_object).delete(v1_delete_object),
        )
        .route("/api/v1/objects/:hash/manifest", get(v1_get_manifest))
        .route(
            "/internal/v1/objects",
            get(internal_list_objects).put(internal_put_object),
        )
        .route(
            "/internal/v1/objects/:hash",
            get(internal_get_object)
                .head(internal_head_object)
                .delete(internal_delete_object),
        )
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C, running until killed: {}", error);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

pub(crate) fn response_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

pub(crate) fn error_response(error: KeelError) -> Response {
    let status = match &error {
        KeelError::NotFound(_) => StatusCode::NOT_FOUND,
        KeelError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        KeelError::HashMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        KeelError::InsufficientReplicas { .. } | KeelError::Unavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        KeelError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        KeelError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        KeelError::InvalidRange(_) => StatusCode::RANGE_NOT_SATISFIABLE,
        KeelError::Conflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::warn!("Request failed: {}", error);
    }
    response_error(status, error.to_string())
}

/// Checks `Authorization: Bearer <token>` against the shared peer token.
pub(crate) fn check_peer_token(
    expected: &str,
    headers: &HeaderMap,
) -> std::result::Result<(), Response> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        Some(token) if !expected.is_empty() && token == expected => Ok(()),
        Some(_) => Err(response_error(StatusCode::FORBIDDEN, "invalid peer token")),
        None => Err(response_error(
            StatusCode::UNAUTHORIZED,
            "missing peer bearer token",
        )),
    }
}

/// Reads the optional expected digest sent with an upload.
pub(crate) fn expected_sha512(
    headers: &HeaderMap,
) -> std::result::Result<Option<String>, Response> {
    let Some(value) = headers.get(SHA512_HEADER) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map(|value| value.trim().to_ascii_lowercase())
        .map_err(|_| response_error(StatusCode::BAD_REQUEST, "invalid x-keel-sha512 header"))?;
    validate_hash(&value).map_err(error_response)?;
    Ok(Some(value))
}

/// Parses an explicit `Range: bytes=start-end` header. Suffix and open-ended
/// forms are rejected.
pub(crate) fn parse_range_header(
    headers: &HeaderMap,
) -> std::result::Result<Option<ByteRange>, String> {
    let Some(value) = headers.get(header::RANGE) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| "invalid Range header".to_string())?
        .trim();
    let Some(bounds) = value.strip_prefix("bytes=") else {
        return Err("only bytes= range is supported".to_string());
    };
    if bounds.contains(',') {
        return Err("multiple ranges are not supported".to_string());
    }
    let Some((start, end)) = bounds.split_once('-') else {
        return Err("invalid Range header".to_string());
    };
    if start.is_empty() || end.is_empty() {
        return Err("only explicit bytes=start-end is supported".to_string());
    }

    let start = start
        .trim()
        .parse::<u64>()
        .map_err(|_| "invalid range start".to_string())?;
    let end = end
        .trim()
        .parse::<u64>()
        .map_err(|_| "invalid range end".to_string())?;
    if start > end {
        return Err("range start must be <= range end".to_string());
    }
    Ok(Some(ByteRange::new(start, end)))
}

/// Marks `response` as partial content for `range` of an object of
/// `size_bytes`.
pub(crate) fn insert_range_headers(response: &mut Response, range: ByteRange, size_bytes: u64) {
    *response.status_mut() = StatusCode::PARTIAL_CONTENT;
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&range.content_range(size_bytes)) {
        headers.insert(header::CONTENT_RANGE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(range.length()));
}

pub(crate) fn body_reader(body: Body) -> BlobReader {
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    Box::new(StreamReader::new(Box::pin(stream)))
}

pub(crate) fn stream_response(reader: BlobReader) -> Response {
    let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response
}

pub(crate) fn insert_envelope_headers(headers: &mut HeaderMap, envelope: &Envelope) {
    if let Ok(value) = HeaderValue::from_str(&envelope.sha512) {
        headers.insert(SHA512_HEADER, value);
    }
    headers.insert(SIZE_HEADER, HeaderValue::from(envelope.size_bytes));
    if let Ok(value) = HeaderValue::from_str(&envelope.created_at.to_rfc3339()) {
        headers.insert(CREATED_AT_HEADER, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(envelope.size_bytes));
}
