//! HTTP API tests driven through the router with `tower::ServiceExt::oneshot`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{to_bytes, Body};
use axum::http::header::{ACCEPT_ENCODING, ETAG, IF_NONE_MATCH};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use simplefs_cache::config::{Config, StorageConfig};
use simplefs_cache::server::api::{build_router, AppState, HealthResponse, X_CACHE};
use simplefs_cache::SimpleFs;
use simplefs_cache::Storer;
use tempfile::TempDir;
use tower::ServiceExt;

fn app(dir: &TempDir) -> (Router, Arc<SimpleFs>) {
    let config = Config {
        storage: StorageConfig {
            path: Some(dir.path().to_path_buf()),
            compression: "lz4".to_string(),
            sweep_interval_ms: 60_000,
            ..Default::default()
        },
        ..Default::default()
    };
    let store = Arc::new(SimpleFs::provision(&config.storage).unwrap());
    store.init().unwrap();

    let state = Arc::new(AppState {
        store: store.clone(),
        config: Arc::new(config),
        start_time: Instant::now(),
    });
    (build_router(state), store)
}

fn request(method: Method, uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(body.into())
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

#[tokio::test]
async fn test_put_get_delete_entry() {
    let tmp = TempDir::new().unwrap();
    let (app, store) = app(&tmp);

    let response = app
        .clone()
        .oneshot(request(Method::PUT, "/cache/GET-example.com/index?ttl=60", "hello"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(store.get("GET-example.com/index").unwrap(), b"hello");

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/cache/GET-example.com/index", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"hello");

    let response = app
        .clone()
        .oneshot(request(Method::DELETE, "/cache/GET-example.com/index", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(request(Method::GET, "/cache/GET-example.com/index", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_reserved_key_is_bad_request() {
    let tmp = TempDir::new().unwrap();
    let (app, _store) = app(&tmp);

    let response = app
        .oneshot(request(Method::PUT, "/cache/IDX_page", "x"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_keys_listing_and_prefix_map() {
    let tmp = TempDir::new().unwrap();
    let (app, store) = app(&tmp);
    let minute = std::time::Duration::from_secs(60);
    store.set("user-1", b"a", minute).unwrap();
    store.set("user-2", b"b", minute).unwrap();
    store.set("other", b"c", minute).unwrap();

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/keys", Body::empty()))
        .await
        .unwrap();
    let mut keys: Vec<String> = serde_json::from_slice(&body_bytes(response).await).unwrap();
    keys.sort();
    assert_eq!(keys, vec!["other", "user-1", "user-2"]);

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/keys?prefix=user-", Body::empty()))
        .await
        .unwrap();
    let map: HashMap<String, String> = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(map.len(), 2);
    assert!(map.contains_key("1"));

    let response = app
        .oneshot(request(Method::DELETE, "/cache?pattern=%5Euser-", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(store.list_keys(), vec!["other".to_string()]);
}

#[tokio::test]
async fn test_variants_roundtrip_with_revalidation() {
    let tmp = TempDir::new().unwrap();
    let (app, _store) = app(&tmp);

    for encoding in ["gzip", "br"] {
        let uri = format!("/variants/page?vary=accept-encoding&etag=%22{encoding}-1%22&ttl=60");
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::PUT)
                    .uri(uri)
                    .header(ACCEPT_ENCODING, encoding)
                    .body(Body::from(format!("{encoding} body")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/variants/page")
                .header(ACCEPT_ENCODING, "br")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(X_CACHE).unwrap(), "fresh");
    assert_eq!(response.headers().get(ETAG).unwrap(), "\"br-1\"");
    assert_eq!(body_bytes(response).await, b"br body");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/variants/page")
                .header(ACCEPT_ENCODING, "gzip")
                .header(IF_NONE_MATCH, "\"gzip-1\"")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(response.headers().get(ETAG).unwrap(), "\"gzip-1\"");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/variants/page")
                .header(ACCEPT_ENCODING, "deflate")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health_metrics_and_reset() {
    let tmp = TempDir::new().unwrap();
    let (app, store) = app(&tmp);
    store.set("k", b"value", std::time::Duration::from_secs(60)).unwrap();

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/health", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let health: HealthResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(health.status, "ok");
    assert_eq!(health.storage.name, "SIMPLEFS");
    assert_eq!(health.storage.entries, 1);
    assert_eq!(health.storage.compression.as_deref(), Some("lz4"));
    assert!(health.storage.directory_budget.is_none());

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/metrics", Body::empty()))
        .await
        .unwrap();
    let text = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(text.contains("simplefs_cache_entries 1"));

    let response = app
        .oneshot(request(Method::POST, "/reset", Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(store.list_keys().is_empty());
}
