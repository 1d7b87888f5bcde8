use super::{
    DeleteResponse, ServerState, body_reader, check_peer_token, error_response, expected_sha512,
    insert_envelope_headers, insert_range_headers, parse_range_header, response_error,
    stream_response,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use keel_core::BlobObjects;
use std::sync::Arc;

// Peer protocol, served through the cluster's peer endpoint. Reads work on
// this node's local store, pushes take the object lock and DELETE tombstones
// through the cluster.

pub(crate) async fn internal_put_object(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    if let Err(denied) = check_peer_token(&state.peer_token, &headers) {
        return denied;
    }
    let expected = match expected_sha512(&headers) {
        Ok(expected) => expected,
        Err(response) => return response,
    };

    let result = state
        .cluster
        .endpoint()
        .write_blob(body_reader(body), expected.as_deref())
        .await;

    match result {
        Ok(envelope) => (StatusCode::OK, Json(envelope)).into_response(),
        Err(error) => {
            tracing::debug!("Rejected replica push: error={}", error);
            error_response(error)
        }
    }
}

pub(crate) async fn internal_get_object(
    State(state): State<Arc<ServerState>>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = check_peer_token(&state.peer_token, &headers) {
        return denied;
    }

    let range = match parse_range_header(&headers) {
        Ok(range) => range,
        Err(message) => return response_error(StatusCode::RANGE_NOT_SATISFIABLE, message),
    };

    let endpoint = state.cluster.endpoint();
    let envelope = match endpoint.blob_envelope(&hash).await {
        Ok(envelope) => envelope,
        Err(error) => return error_response(error),
    };
    let range = match range.map(|range| range.resolve(envelope.size_bytes)).transpose() {
        Ok(range) => range,
        Err(error) => return error_response(error),
    };
    let reader = match endpoint.open_blob(&hash, range).await {
        Ok(reader) => reader,
        Err(error) => return error_response(error),
    };

    let mut response = stream_response(reader);
    insert_envelope_headers(response.headers_mut(), &envelope);
    if let Some(range) = range {
        insert_range_headers(&mut response, range, envelope.size_bytes);
    }
    response
}

pub(crate) async fn internal_head_object(
    State(state): State<Arc<ServerState>>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = check_peer_token(&state.peer_token, &headers) {
        return denied;
    }

    match state.cluster.endpoint().blob_envelope(&hash).await {
        Ok(envelope) => {
            let mut response = StatusCode::OK.into_response();
            insert_envelope_headers(response.headers_mut(), &envelope);
            response
        }
        Err(error) => error_response(error),
    }
}

pub(crate) async fn internal_delete_object(
    State(state): State<Arc<ServerState>>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = check_peer_token(&state.peer_token, &headers) {
        return denied;
    }

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

pub(crate) async fn internal_list_objects(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = check_peer_token(&state.peer_token, &headers) {
        return denied;
    }

    match state.cluster.endpoint().list_blobs().await {
        Ok(items) => (StatusCode::OK, Json(items)).into_response(),
        Err(error) => error_response(error),
    }
}
