//! Integration Tests for the Relay
//!
//! Drives the full request/response cycle through the router, plus the
//! reuse-and-sweep scenario across the service layer.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use flashdrop::api::create_router;
use flashdrop::cache::{CacheKind, CacheStore, TenantScope};
use flashdrop::records::MemoryRecordStore;
use flashdrop::tasks::run_sweep;
use flashdrop::{AppState, Config};

// == Helper Functions ==

fn create_test_state() -> AppState {
    AppState::new(
        CacheStore::new("test"),
        Arc::new(MemoryRecordStore::new()),
        Config::default(),
    )
}

async fn body_to_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    (status, body_to_json(response.into_body()).await)
}

async fn register_code(app: &Router, body: Value) -> String {
    let (status, json) = post_json(app, "/codes", body).await;
    assert_eq!(status, StatusCode::CREATED);
    json["code"].as_str().unwrap().to_string()
}

async fn upload_chunk(app: &Router, code: &str, index: u32, payload: &[u8]) -> StatusCode {
    app.clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/codes/{code}/chunks/{index}"))
                .header("content-type", "application/octet-stream")
                .body(Body::from(payload.to_vec()))
                .unwrap(),
        )
        .await
        .unwrap()
        .status()
}

async fn complete_upload(app: &Router, code: &str, total_chunks: u32) -> (StatusCode, Value) {
    post_json(
        app,
        &format!("/codes/{code}/complete"),
        json!({
            "fileName": "notes.txt",
            "fileSize": 24,
            "mimeType": "text/plain",
            "totalChunks": total_chunks,
        }),
    )
    .await
}

// == End-to-End Transfer ==

#[tokio::test]
async fn test_full_transfer_roundtrip() {
    let state = create_test_state();
    let app = create_router(state);

    let code = register_code(&app, json!({})).await;

    for index in 0..3u32 {
        let status = upload_chunk(&app, &code, index, format!("chunk-{index}").as_bytes()).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = complete_upload(&app, &code, 3).await;
    assert_eq!(status, StatusCode::OK);

    // Metadata is served once the upload completed
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/codes/{code}/metadata"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let metadata = body_to_json(response.into_body()).await;
    assert_eq!(metadata["fileName"], "notes.txt");
    assert_eq!(metadata["totalChunks"], 3);

    // The wrapped secret round-trips
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/codes/{code}/secret"))
                .header("content-type", "application/json")
                .body(Body::from(json!({"wrappedSecret": "d2lyZWQ="}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/codes/{code}/secret"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let secret = body_to_json(response.into_body()).await;
    assert_eq!(secret["wrappedSecret"], "d2lyZWQ=");

    // Chunks come back byte-exact, with integrity headers
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/codes/{code}/chunks/1"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-chunk-hash"));
    assert!(response.headers().contains_key("x-session-id"));
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"chunk-1");
}

#[tokio::test]
async fn test_batch_download_partitions_indices() {
    let state = create_test_state();
    let app = create_router(state);

    let code = register_code(&app, json!({})).await;
    for index in 0..3u32 {
        upload_chunk(&app, &code, index, b"payload").await;
    }
    complete_upload(&app, &code, 3).await;

    let (status, json) = post_json(
        &app,
        &format!("/codes/{code}/chunks"),
        json!({"chunkIndices": [0, 2, 7]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["chunks"]["0"].is_object());
    assert!(json["chunks"]["2"].is_object());
    assert_eq!(json["missing"], json!([7]));
    assert!(json["sessionId"].is_string());
}

#[tokio::test]
async fn test_incomplete_upload_reports_exact_missing_set() {
    let state = create_test_state();
    let app = create_router(state);

    let code = register_code(&app, json!({})).await;
    upload_chunk(&app, &code, 0, b"only-one").await;

    let (status, json) = complete_upload(&app, &code, 4).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "INCOMPLETE_UPLOAD");
    assert_eq!(json["missingChunks"], json!([1, 2, 3]));
    assert_eq!(json["extraChunks"], json!([]));
}

#[tokio::test]
async fn test_expired_code_is_refused() {
    let state = create_test_state();
    let app = create_router(state.clone());

    let code = register_code(&app, json!({})).await;

    // Force the record past its expiry behind the router's back.
    let mut record = state
        .records
        .find_by_lookup_key(&code)
        .await
        .unwrap()
        .unwrap();
    record.expires_at = Utc::now() - Duration::seconds(10);
    state.records.insert(record).await.unwrap();

    let status = upload_chunk(&app, &code, 0, b"late").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/codes/{code}/chunks/0"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_to_json(response.into_body()).await;
    assert_eq!(json["code"], "EXPIRED");
}

#[tokio::test]
async fn test_unknown_chunk_is_not_found() {
    let state = create_test_state();
    let app = create_router(state);

    let code = register_code(&app, json!({})).await;
    upload_chunk(&app, &code, 0, b"data").await;
    complete_upload(&app, &code, 1).await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/codes/{code}/chunks/5"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// == Reuse and Sweep Scenario ==

#[tokio::test]
async fn test_reissued_code_shares_cache_and_extends_expiry() {
    let state = create_test_state();
    let app = create_router(state.clone());

    // Register K1, upload the artifact under it.
    let first = register_code(&app, json!({"ttlSecs": 1800})).await;
    for index in 0..3u32 {
        upload_chunk(&app, &first, index, format!("chunk-{index}").as_bytes()).await;
    }
    let (status, _) = complete_upload(&app, &first, 3).await;
    assert_eq!(status, StatusCode::OK);

    // Re-issue K2 for the same artifact with a later expiry.
    let (status, reissue) = post_json(
        &app,
        "/codes",
        json!({"reuseCode": first, "ttlSecs": 7200}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let second = reissue["code"].as_str().unwrap().to_string();
    assert_eq!(reissue["identifierKey"], first.as_str());
    assert_eq!(reissue["reused"], true);

    // The shared chunk cache now carries K2's later expiry.
    let chunks = state
        .cache
        .get(CacheKind::ChunkMap, TenantScope::Anonymous, &first)
        .await
        .unwrap()
        .and_then(|value| value.into_chunks())
        .unwrap();
    let expiry = chunks[&0].expires_at;
    assert!(expiry > Utc::now() + Duration::seconds(7000));

    // K2 downloads K1's chunks without any re-upload.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/codes/{second}/chunks/2"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"chunk-2");

    // K1's record is deleted outright; K1 still resolves because it is the
    // identifier itself, superseded only for expiry purposes.
    state.records.delete_record(&first).await.unwrap();
    assert_eq!(
        state.mapping.resolve(&first).await.unwrap().as_deref(),
        Some(first.as_str())
    );

    // Once K2 expires too, a sweep removes every trace of the artifact.
    state.records.mark_expired(&second).await.unwrap();
    run_sweep(&state).await;
    assert!(!state
        .cache
        .exists(CacheKind::ChunkMap, TenantScope::Anonymous, &first)
        .await
        .unwrap());
    assert!(state.mapping.resolve(&second).await.unwrap().is_none());
}

#[tokio::test]
async fn test_tenant_cache_is_isolated_per_owner() {
    let state = create_test_state();
    let app = create_router(state.clone());

    let code = register_code(&app, json!({"tenant": 42})).await;
    upload_chunk(&app, &code, 0, b"tenant-data").await;
    complete_upload(&app, &code, 1).await;

    // The artifact lives under the owning tenant's scope only.
    assert!(state
        .cache
        .exists(CacheKind::ChunkMap, TenantScope::Tenant(42), &code)
        .await
        .unwrap());
    assert!(!state
        .cache
        .exists(CacheKind::ChunkMap, TenantScope::Anonymous, &code)
        .await
        .unwrap());

    // The code still downloads fine: its record carries the owner scope.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/codes/{code}/chunks/0"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_download_complete_consumes_usage() {
    let state = create_test_state();
    let app = create_router(state);

    let code = register_code(&app, json!({"limitCount": 2})).await;
    upload_chunk(&app, &code, 0, b"data").await;
    complete_upload(&app, &code, 1).await;

    let (status, json) = post_json(&app, &format!("/codes/{code}/downloaded"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["usedCount"], 1);
    assert_eq!(json["remaining"], 1);

    let (status, json) = post_json(&app, &format!("/codes/{code}/downloaded"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["usedCount"], 2);
    assert_eq!(json["status"], "completed");
}
