use super::{
    DeleteResponse, HealthResponse, ListResponse, PeerItem, PeersResponse, PutObjectResponse,
    ServerState, body_reader, error_response, expected_sha512, insert_range_headers,
    parse_range_header, response_error, stream_response,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use keel_core::{BlobObjects, BlobSource, SHA512_HEADER};
use std::sync::Arc;

const SOURCE_HEADER: &str = "x-keel-source";

pub(crate) async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        node_id: state.cluster.config().peer_id.clone(),
        active_peers: state.cluster.peers().active_peers().await.len(),
    })
}

pub(crate) async fn v1_peers(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let peers = state
        .cluster
        .peers()
        .peers()
        .await
        .into_iter()
        .map(|peer| PeerItem {
            id: peer.id,
            advertise_addr: peer.advertise_addr,
            state: peer.state,
            missed_heartbeats: peer.missed_heartbeats,
            last_seen: peer.last_seen,
        })
        .collect();

    Json(PeersResponse {
        node_id: state.cluster.config().peer_id.clone(),
        peers,
    })
}

pub(crate) async fn v1_put_object(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let expected = match expected_sha512(&headers) {
        Ok(expected) => expected,
        Err(response) => return response,
    };

    match state.cluster.write(body_reader(body), expected).await {
        Ok(result) => (
            StatusCode::CREATED,
            Json(PutObjectResponse {
                sha512: result.envelope.sha512,
                size_bytes: result.envelope.size_bytes,
                created_at: result.envelope.created_at,
                holders: result.holders.into_iter().collect(),
                required_replicas: result.required_replicas,
                committed_replicas: result.committed_replicas,
                degraded: result.degraded,
            }),
        )
            .into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn v1_list_objects(State(state): State<Arc<ServerState>>) -> Response {
    match state.cluster.list_blobs().await {
        Ok(items) => (StatusCode::OK, Json(ListResponse { items })).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn v1_get_object(
    State(state): State<Arc<ServerState>>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Response {
    let range = match parse_range_header(&headers) {
        Ok(range) => range,
        Err(message) => return response_error(StatusCode::RANGE_NOT_SATISFIABLE, message),
    };

    let opened = match state.cluster.open(&hash, range).await {
        Ok(opened) => opened,
        Err(error) => return error_response(error),
    };

    let source = match &opened.source {
        BlobSource::Local => "local".to_string(),
        BlobSource::Peer(peer_id) => peer_id.clone(),
    };

    let mut response = stream_response(opened.reader);
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&hash) {
        headers.insert(SHA512_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&source) {
        headers.insert(SOURCE_HEADER, value);
    }
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(opened.size_bytes));
    if let Some(range) = opened.range {
        insert_range_headers(&mut response, range, opened.size_bytes);
    }
    response
}

pub(crate) async fn v1_delete_object(
    State(state): State<Arc<ServerState>>,
    Path(hash): Path<String>,
) -> Response {
    match state.cluster.delete(&hash).await {
        Ok(result) => (
            StatusCode::OK,
            Json(DeleteResponse {
                sha512: result.sha512,
                tombstoned_at: result.tombstoned_at,
            }),
        )
            .into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn v1_get_manifest(
    State(state): State<Arc<ServerState>>,
    Path(hash): Path<String>,
) -> Response {
    match state.cluster.manifest(&hash).await {
        Ok(manifest) => (StatusCode::OK, Json(manifest)).into_response(),
        Err(error) => error_response(error),
    }
}
