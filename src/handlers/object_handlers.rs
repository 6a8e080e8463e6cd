//! HTTP handlers for the pipeline's object store.
//! Bodies are streamed in both directions; every key lives in the single
//! pipeline bucket held in [`AppState`].

use crate::{
    errors::AppError,
    models::object::StoredObject,
    services::storage_service::{ListObjectsParams, ListObjectsResult},
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::io::ReaderStream;

const VERSION_HEADER: HeaderName = HeaderName::from_static("x-object-version");
const DEFAULT_MAX_KEYS: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct VersionQuery {
    pub version: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ListObjectsQuery {
    pub prefix: Option<String>,
    #[serde(rename = "max-keys")]
    pub max_keys: Option<usize>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListObjectsResponse {
    pub bucket: String,
    pub prefix: Option<String>,
    pub max_keys: usize,
    pub key_count: usize,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
    pub objects: Vec<StoredObject>,
}

/// `PUT /objects/{*key}`: store the body as a new version of `key`.
pub async fn put_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let object = state
        .storage
        .upload_object_stream(&state.bucket, &key, content_type, stream)
        .await?;

    let mut response = (StatusCode::CREATED, Json(&object)).into_response();
    set_version_headers(response.headers_mut(), &object);
    Ok(response)
}

/// `GET /objects/{*key}[?version=N]`: stream the latest or a given version.
pub async fn get_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(q): Query<VersionQuery>,
) -> Result<Response, AppError> {
    let (object, file) = state
        .storage
        .get_object_reader(&state.bucket, &key, q.version)
        .await?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    set_object_headers(response.headers_mut(), &object);
    Ok(response)
}

/// `HEAD /objects/{*key}`: latest version headers, no body.
pub async fn head_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let object = state.storage.head_object(&state.bucket, &key).await?;
    let mut response = Response::new(Body::empty());
    set_object_headers(response.headers_mut(), &object);
    Ok(response)
}

/// `GET /objects?prefix=&max-keys=&continuation-token=`
pub async fn list_objects(
    State(state): State<AppState>,
    Query(q): Query<ListObjectsQuery>,
) -> Result<Json<ListObjectsResponse>, AppError> {
    let continuation_token = q
        .continuation_token
        .as_deref()
        .map(decode_continuation_token)
        .transpose()?;
    let max_keys = q.max_keys.unwrap_or(DEFAULT_MAX_KEYS).clamp(1, DEFAULT_MAX_KEYS);

    let ListObjectsResult {
        objects,
        is_truncated,
        next_continuation_token,
    } = state
        .storage
        .list_objects(
            &state.bucket,
            ListObjectsParams {
                prefix: q.prefix.clone(),
                continuation_token,
                max_keys,
            },
        )
        .await?;

    Ok(Json(ListObjectsResponse {
        bucket: state.bucket.clone(),
        prefix: q.prefix,
        max_keys,
        key_count: objects.len(),
        is_truncated,
        next_continuation_token: next_continuation_token.as_deref().map(encode_continuation_token),
        objects,
    }))
}

fn set_version_headers(headers: &mut HeaderMap, object: &StoredObject) {
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", object.etag)) {
        headers.insert(header::ETAG, value);
    }
    headers.insert(VERSION_HEADER, HeaderValue::from(object.version));
}

fn set_object_headers(headers: &mut HeaderMap, object: &StoredObject) {
    let content_type = object
        .content_type
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(object.size_bytes.max(0)));
    if let Ok(value) = HeaderValue::from_str(&object.created_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    set_version_headers(headers, object);
}

fn encode_continuation_token(token: &str) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(token)
}

fn decode_continuation_token(token: &str) -> Result<String, AppError> {
    general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| AppError::bad_request("invalid continuation-token"))
}
