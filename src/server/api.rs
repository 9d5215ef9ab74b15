//! HTTP API over the SimpleFS store.
//!
//! - GET /health
//! - GET /metrics
//! - GET /keys[?prefix=]
//! - GET|PUT|DELETE /cache/{*key}
//! - DELETE /cache?pattern=
//! - POST /reset
//! - GET|PUT /variants/{*key}
//!
//! The store does blocking file I/O, so every call runs on the blocking pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{CONTENT_TYPE, ETAG};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinError;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::cache::mapping::Revalidator;
use crate::cache::store::SimpleFs;
use crate::config::Config;
use crate::storer::{StoreError, Storer};

/// Response header telling whether a variant was served fresh or stale.
pub const X_CACHE: &str = "x-cache";

/// Application state shared across handlers.
pub struct AppState {
    pub store: Arc<SimpleFs>,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/keys", get(list_keys))
        .route("/cache", delete(delete_many))
        .route(
            "/cache/{*key}",
            get(get_entry).put(put_entry).delete(delete_entry),
        )
        .route("/reset", post(reset))
        .route("/variants/{*key}", get(get_variant).put(put_variant))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Blocking task failed: {0}")]
    Join(#[from] JoinError),

    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Store(StoreError::NotInitialized) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(StoreError::ReservedKey(_)) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Store(_) | ApiError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f).await?)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub storage: StorageStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StorageStatus {
    pub name: String,
    pub uuid: String,
    pub entries: usize,
    pub bytes_on_disk: u64,
    /// `None` when the directory is unbounded.
    pub directory_budget: Option<u64>,
    pub compression: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KeysQuery {
    pub prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TtlQuery {
    pub ttl: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PatternQuery {
    pub pattern: String,
}

/// Query of a variant write. `vary` is a comma-separated list of request
/// header names; `variant` defaults to the base key plus those header values.
#[derive(Debug, Deserialize)]
pub struct VariantQuery {
    pub variant: Option<String>,
    pub ttl: Option<u64>,
    #[serde(default)]
    pub vary: String,
    #[serde(default)]
    pub etag: String,
    pub real_key: Option<String>,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let store = &state.store;
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        storage: StorageStatus {
            name: store.name().to_string(),
            uuid: store.uuid(),
            entries: store.entry_count(),
            bytes_on_disk: store.disk_usage(),
            directory_budget: store.budget().limit(),
            compression: store.compression().map(|c| c.to_string()),
        },
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let text = state.store.render_metrics()?;
    Ok(([(CONTENT_TYPE, "text/plain; version=0.0.4")], text))
}

async fn list_keys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KeysQuery>,
) -> Result<Response, ApiError> {
    let store = state.store.clone();
    match query.prefix {
        Some(prefix) => {
            let keys: HashMap<String, String> = blocking(move || store.map_keys(&prefix)).await?;
            Ok(Json(keys).into_response())
        }
        None => {
            let keys = blocking(move || store.list_keys()).await?;
            Ok(Json(keys).into_response())
        }
    }
}

async fn get_entry(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let store = state.store.clone();
    let lookup = key.clone();
    match blocking(move || store.get(&lookup)).await? {
        Some(value) => Ok((
            [(CONTENT_TYPE, "application/octet-stream")],
            Bytes::from(value),
        )
            .into_response()),
        None => {
            debug!(key, "Cache miss");
            Ok(StatusCode::NOT_FOUND.into_response())
        }
    }
}

async fn put_entry(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<TtlQuery>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let ttl = Duration::from_secs(query.ttl.unwrap_or(state.config.server.default_ttl_secs));
    let store = state.store.clone();
    blocking(move || store.set(&key, &body, ttl)).await??;
    Ok(StatusCode::CREATED)
}

async fn delete_entry(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    let store = state.store.clone();
    blocking(move || store.delete(&key)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_many(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PatternQuery>,
) -> Result<StatusCode, ApiError> {
    let store = state.store.clone();
    blocking(move || store.delete_many(&query.pattern)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn reset(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    let store = state.store.clone();
    blocking(move || store.reset()).await??;
    info!("Storage reset over HTTP");
    Ok(StatusCode::NO_CONTENT)
}

async fn get_variant(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let (parts, _) = request.into_parts();
    let mut validator = Revalidator::from_request(&parts);

    let store = state.store.clone();
    let (election, validator) = blocking(move || {
        let election = store.get_multi_level(&key, &parts, &mut validator);
        (election, validator)
    })
    .await?;

    if validator.matched {
        let mut response = StatusCode::NOT_MODIFIED.into_response();
        if let Some(etag) = validator.matched_etag.and_then(|tag| HeaderValue::from_str(&tag).ok()) {
            response.headers_mut().insert(ETAG, etag);
        }
        return Ok(response);
    }

    let (elected, freshness) = match (election.fresh, election.stale) {
        (Some(fresh), _) => (fresh, "fresh"),
        (None, Some(stale)) => (stale, "stale"),
        (None, None) => return Ok(StatusCode::NOT_FOUND.into_response()),
    };

    let (mut head, body) = elected.into_parts();
    head.headers
        .insert(HeaderName::from_static(X_CACHE), HeaderValue::from_static(freshness));
    Ok(Response::from_parts(head, Body::from(body)))
}

async fn put_variant(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<VariantQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let varied_headers = varied_headers(&query.vary, &headers)?;
    let varied_key = query
        .variant
        .unwrap_or_else(|| default_variant_key(&key, &varied_headers));
    let real_key = query.real_key.unwrap_or_else(|| key.clone());
    let ttl = Duration::from_secs(query.ttl.unwrap_or(state.config.server.default_ttl_secs));

    let store = state.store.clone();
    blocking(move || {
        store.set_multi_level(
            &key,
            &varied_key,
            &body,
            &varied_headers,
            &query.etag,
            ttl,
            &real_key,
        )
    })
    .await??;
    Ok(StatusCode::CREATED)
}

/// Pick the request headers named in `vary`.
fn varied_headers(vary: &str, headers: &HeaderMap) -> Result<HeaderMap, ApiError> {
    let mut varied = HeaderMap::new();
    for name in vary.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
            .map_err(|_| ApiError::BadRequest(format!("Invalid header name in vary: {name}")))?;
        for value in headers.get_all(&name) {
            varied.append(name.clone(), value.clone());
        }
    }
    Ok(varied)
}

fn default_variant_key(key: &str, varied: &HeaderMap) -> String {
    let values: Vec<String> = varied
        .iter()
        .map(|(_, value)| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .collect();
    if values.is_empty() {
        key.to_string()
    } else {
        format!("{key}-{}", values.join("-"))
    }
}
