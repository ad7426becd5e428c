//! API Handlers
//!
//! HTTP request handlers for each relay endpoint. Handlers stay thin: they
//! validate the code, load its record, and delegate to the cache, mapping and
//! pool services held in [`AppState`].

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{Duration, Utc};
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{
    ArtifactMetadata, CacheKind, CacheStore, CacheValue, ChunkIndex, RedisBackend, StoredChunk,
    TenantScope,
};
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::mapping::MappingService;
use crate::models::{
    BatchChunk, BatchChunksRequest, BatchChunksResponse, CodeStatusResponse,
    DownloadCompleteRequest, DownloadCompleteResponse, HealthResponse, MetadataResponse,
    RegisterCodeRequest, RegisterCodeResponse, SecretResponse, StatsResponse, StoreSecretRequest,
    UploadChunkResponse, UploadCompleteRequest, UploadCompleteResponse,
};
use crate::models::responses::remaining_uses;
use crate::pools::{DownloadPool, MergeOutcome, UploadPool};
use crate::records::{
    is_valid_lookup_code, MemoryRecordStore, RecordStatus, RecordStore, TransferRecord,
    CODE_LENGTH,
};

// == Application State ==
/// Shared state injected into every handler and into the cleanup task: the
/// cache store, the durable record store, and the three services built on
/// top of them. Everything is behind an `Arc`, so cloning the state is cheap.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<CacheStore>,
    pub records: Arc<dyn RecordStore>,
    pub mapping: Arc<MappingService>,
    pub uploads: Arc<UploadPool>,
    pub downloads: Arc<DownloadPool>,
    pub config: Config,
}

impl AppState {
    /// Creates the state from an already-built cache store and record store.
    pub fn new(cache: CacheStore, records: Arc<dyn RecordStore>, config: Config) -> Self {
        let cache = Arc::new(cache);
        let mapping = Arc::new(MappingService::new(
            cache.clone(),
            records.clone(),
            config.negative_mapping_ttl,
        ));
        let uploads = Arc::new(UploadPool::new(cache.clone()));
        let downloads = Arc::new(DownloadPool::new(cache.clone()));
        Self {
            cache,
            records,
            mapping,
            uploads,
            downloads,
            config,
        }
    }

    /// Builds the full state from configuration. A configured but unreachable
    /// durable backend is not an error: the relay starts on the in-process
    /// cache instead.
    pub async fn from_config(config: &Config) -> Self {
        let cache = match &config.redis_url {
            Some(url) => match RedisBackend::connect(url).await {
                Ok(backend) => {
                    info!("durable cache backend connected");
                    CacheStore::with_backend(&config.cache_prefix, Arc::new(backend))
                }
                Err(err) => {
                    warn!(error = %err, "durable cache backend unreachable, using in-process cache");
                    CacheStore::new(&config.cache_prefix)
                }
            },
            None => CacheStore::new(&config.cache_prefix),
        };
        Self::new(cache, Arc::new(MemoryRecordStore::new()), config.clone())
    }
}

// == Helpers ==
const CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Generates a lookup code not currently present in the record store.
async fn generate_lookup_code(records: &Arc<dyn RecordStore>) -> Result<String> {
    for _ in 0..100 {
        let code: String = {
            let mut rng = rand::thread_rng();
            (0..CODE_LENGTH)
                .map(|_| CODE_CHARSET[rng.gen_range(0..CODE_CHARSET.len())] as char)
                .collect()
        };
        if records.find_by_lookup_key(&code).await?.is_none() {
            return Ok(code);
        }
    }
    Err(RelayError::Internal(
        "could not generate a unique lookup code".to_string(),
    ))
}

/// Loads a record, persisting the expired-state transition on the way.
async fn load_active_record(state: &AppState, code: &str) -> Result<TransferRecord> {
    if !is_valid_lookup_code(code) {
        return Err(RelayError::InvalidRequest(
            "code must be 6 uppercase letters or digits".to_string(),
        ));
    }
    let Some(record) = state.records.find_by_lookup_key(code).await? else {
        return Err(RelayError::NotFound(code.to_string()));
    };
    if record.is_expired_at(Utc::now()) {
        if record.status != RecordStatus::Expired {
            state.records.mark_expired(code).await?;
        }
        return Err(RelayError::Expired(code.to_string()));
    }
    Ok(record)
}

/// Resolves the identifier key a code's cached artifact lives under.
async fn resolve_identifier(state: &AppState, code: &str) -> Result<String> {
    state
        .mapping
        .resolve(code)
        .await?
        .ok_or_else(|| RelayError::NotFound(code.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    #[serde(default)]
    pub session: Option<String>,
}

// == Register Code ==
/// Handler for POST /codes
///
/// Issues a fresh lookup code. A plain registration creates a new artifact
/// with the code self-mapped as its identifier; a registration carrying
/// `reuseCode` attaches the new code to that code's artifact instead and
/// extends the shared cache expiry.
pub async fn register_code_handler(
    State(state): State<AppState>,
    Json(req): Json<RegisterCodeRequest>,
) -> Result<(StatusCode, Json<RegisterCodeResponse>)> {
    if let Some(msg) = req.validate() {
        return Err(RelayError::InvalidRequest(msg));
    }

    let now = Utc::now();
    let ttl = req.ttl_secs.unwrap_or(state.config.default_code_ttl);
    let limit_count = req.limit_count.unwrap_or(state.config.default_limit_count);
    let expires_at = now + Duration::seconds(ttl as i64);
    let code = generate_lookup_code(&state.records).await?;

    let (artifact_id, identifier, scope, reused) = match &req.reuse_code {
        Some(reuse_code) => {
            let existing = state
                .records
                .find_by_lookup_key(reuse_code)
                .await?
                .ok_or_else(|| RelayError::NotFound(reuse_code.clone()))?;
            let identifier = state
                .mapping
                .resolve(reuse_code)
                .await?
                .unwrap_or_else(|| existing.code.clone());
            // The cache lives under the original owner's scope; a re-issued
            // code keeps addressing it there.
            (existing.artifact_id, identifier, existing.owner, true)
        }
        None => {
            let scope = req.tenant.map(TenantScope::Tenant).unwrap_or_default();
            (rand::random::<u64>(), code.clone(), scope, false)
        }
    };

    let record = TransferRecord {
        code: code.clone(),
        artifact_id,
        owner: scope,
        status: RecordStatus::Waiting,
        used_count: 0,
        limit_count,
        created_at: now,
        expires_at,
    };
    state.records.insert(record).await?;
    state.mapping.save(&code, &identifier, Some(expires_at)).await?;
    if reused {
        state
            .mapping
            .extend_shared_expiry(&identifier, scope, expires_at)
            .await?;
    }

    info!(code, identifier_key = %identifier, reused, "pickup code registered");
    Ok((
        StatusCode::CREATED,
        Json(RegisterCodeResponse {
            code,
            identifier_key: identifier,
            expires_at,
            limit_count,
            reused,
        }),
    ))
}

// == Code Status ==
/// Handler for GET /codes/:code
pub async fn code_status_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<CodeStatusResponse>> {
    if !is_valid_lookup_code(&code) {
        return Err(RelayError::InvalidRequest(
            "code must be 6 uppercase letters or digits".to_string(),
        ));
    }
    let Some(mut record) = state.records.find_by_lookup_key(&code).await? else {
        return Err(RelayError::NotFound(code));
    };
    if record.is_expired_at(Utc::now()) && record.status != RecordStatus::Expired {
        state.records.mark_expired(&code).await?;
        record.status = RecordStatus::Expired;
    }

    let metadata = match state.mapping.resolve(&code).await? {
        Some(identifier) => state
            .cache
            .get(CacheKind::Metadata, record.owner, &identifier)
            .await?
            .and_then(|value| value.into_metadata()),
        None => None,
    };
    Ok(Json(CodeStatusResponse::new(&record, metadata.as_ref())))
}

// == Upload Chunk ==
/// Handler for PUT /codes/:code/chunks/:index
///
/// Buffers one encrypted chunk in the upload pool. When the resolved
/// identifier already holds this chunk unexpired (a reused artifact), the
/// upload is skipped and the shared expiry extended instead.
pub async fn upload_chunk_handler(
    State(state): State<AppState>,
    Path((code, index)): Path<(String, ChunkIndex)>,
    body: Bytes,
) -> Result<Json<UploadChunkResponse>> {
    let record = load_active_record(&state, &code).await?;
    if record.status == RecordStatus::Completed {
        return Err(RelayError::Completed(code));
    }
    if record.is_exhausted() {
        return Err(RelayError::LimitReached {
            code,
            used: record.used_count,
            limit: record.limit_count,
        });
    }
    if body.is_empty() {
        return Err(RelayError::InvalidRequest("chunk payload is empty".to_string()));
    }

    let scope = record.owner;
    let identifier = resolve_identifier(&state, &code).await?;
    let now = Utc::now();

    let cached = state
        .cache
        .get(CacheKind::ChunkMap, scope, &identifier)
        .await?
        .and_then(|value| value.into_chunks());
    let mut chunk_expires = record.expires_at;
    if let Some(chunks) = &cached {
        if let Some(existing) = chunks.get(&index) {
            if now < existing.expires_at {
                let applied = state
                    .mapping
                    .extend_shared_expiry(&identifier, scope, record.expires_at)
                    .await?;
                info!(code, identifier_key = %identifier, index, "chunk already cached, reusing");
                return Ok(Json(UploadChunkResponse {
                    chunk_index: index,
                    content_hash: existing.content_hash.clone(),
                    reused: true,
                    expires_at: applied,
                }));
            }
        }
        // A reused artifact keeps the expiry its cached chunks already carry.
        if let Some(first) = chunks.values().next() {
            chunk_expires = first.expires_at;
        }
    }

    let content_hash = hex::encode(Sha256::digest(&body));
    state
        .uploads
        .add_chunk(
            &identifier,
            index,
            StoredChunk {
                payload: body.to_vec(),
                content_hash: content_hash.clone(),
                expires_at: chunk_expires,
            },
        )
        .await;

    Ok(Json(UploadChunkResponse {
        chunk_index: index,
        content_hash,
        reused: false,
        expires_at: chunk_expires,
    }))
}

// == Upload Complete ==
/// Handler for POST /codes/:code/complete
///
/// Runs the completeness check over the upload buffer, merges it into the
/// cache store, and writes (or expiry-extends) the artifact metadata. With no
/// buffer present the already-cached chunk set must cover the declared total
/// (the pure-reuse case).
pub async fn upload_complete_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<UploadCompleteRequest>,
) -> Result<Json<UploadCompleteResponse>> {
    if let Some(msg) = req.validate() {
        return Err(RelayError::InvalidRequest(msg));
    }
    let record = load_active_record(&state, &code).await?;
    let scope = record.owner;
    let identifier = resolve_identifier(&state, &code).await?;

    match state
        .uploads
        .try_merge_complete(&identifier, scope, req.total_chunks)
        .await?
    {
        MergeOutcome::Merged { total_chunks } => {
            info!(code, identifier_key = %identifier, total_chunks, "upload complete");
        }
        MergeOutcome::Incomplete { missing, extra } => {
            return Err(RelayError::IncompleteUpload { missing, extra });
        }
        MergeOutcome::Empty => {
            let cached = state
                .cache
                .get(CacheKind::ChunkMap, scope, &identifier)
                .await?
                .and_then(|value| value.into_chunks())
                .unwrap_or_default();
            if cached.is_empty() {
                return Err(RelayError::NotFound(format!(
                    "no chunks buffered or cached for {code}"
                )));
            }
            let expected: BTreeSet<ChunkIndex> = (0..req.total_chunks).collect();
            let have: BTreeSet<ChunkIndex> = cached.keys().copied().collect();
            let missing: Vec<ChunkIndex> = expected.difference(&have).copied().collect();
            let extra: Vec<ChunkIndex> = have.difference(&expected).copied().collect();
            if !missing.is_empty() || !extra.is_empty() {
                return Err(RelayError::IncompleteUpload { missing, extra });
            }
            info!(code, identifier_key = %identifier, "upload complete against cached chunks");
        }
    }

    if state.cache.exists(CacheKind::Metadata, scope, &identifier).await? {
        state
            .mapping
            .extend_shared_expiry(&identifier, scope, record.expires_at)
            .await?;
    } else {
        state
            .cache
            .set(
                CacheKind::Metadata,
                scope,
                &identifier,
                CacheValue::Metadata(ArtifactMetadata {
                    file_name: req.file_name.clone(),
                    file_size: req.file_size,
                    mime_type: req.mime_type.clone(),
                    total_chunks: req.total_chunks,
                    expires_at: record.expires_at,
                    identifier_key: identifier.clone(),
                }),
                Some(record.expires_at),
            )
            .await?;
    }

    Ok(Json(UploadCompleteResponse {
        code,
        total_chunks: req.total_chunks,
        file_name: req.file_name,
        file_size: req.file_size,
    }))
}

// == Download Chunk ==
/// Handler for GET /codes/:code/chunks/:index
///
/// Serves one encrypted chunk: session window first, cache store on a miss.
/// A read served from the store kicks off a detached prefetch for the
/// following chunks; the response never waits on it.
pub async fn download_chunk_handler(
    State(state): State<AppState>,
    Path((code, index)): Path<(String, ChunkIndex)>,
    Query(query): Query<SessionQuery>,
) -> Result<Response> {
    let record = load_active_record(&state, &code).await?;
    let scope = record.owner;
    let identifier = resolve_identifier(&state, &code).await?;

    let session_id = match query.session {
        Some(session) => session,
        None => {
            // A fresh session counts against the usage limit; continuing
            // sessions are allowed to finish what they started.
            if record.is_exhausted() {
                return Err(RelayError::LimitReached {
                    code,
                    used: record.used_count,
                    limit: record.limit_count,
                });
            }
            Uuid::new_v4().to_string()
        }
    };

    let fetch = state
        .downloads
        .get(&identifier, &session_id, scope, index)
        .await?
        .ok_or_else(|| RelayError::NotFound(format!("chunk {index} missing or expired")))?;

    if fetch.served_from_store && fetch.total_chunks > 0 {
        let downloads = state.downloads.clone();
        let identifier = identifier.clone();
        let session = session_id.clone();
        let total = fetch.total_chunks;
        let preload = state.config.preload_count;
        tokio::spawn(async move {
            downloads
                .prefetch(&identifier, &session, scope, index, total, preload)
                .await;
        });
    }

    let mut response = (StatusCode::OK, fetch.chunk.payload).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) = HeaderValue::from_str(&index.to_string()) {
        headers.insert("x-chunk-index", value);
    }
    if let Ok(value) = HeaderValue::from_str(&fetch.chunk.content_hash) {
        headers.insert("x-chunk-hash", value);
    }
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        headers.insert("x-session-id", value);
    }
    Ok(response)
}

// == Batch Download ==
/// Handler for POST /codes/:code/chunks
///
/// Batch chunk download: one read of the backing map, base64 payloads in the
/// JSON body, and the exact missing/expired index partitions for the client
/// to react to.
pub async fn batch_chunks_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<BatchChunksRequest>,
) -> Result<Json<BatchChunksResponse>> {
    if let Some(msg) = req.validate() {
        return Err(RelayError::InvalidRequest(msg));
    }
    let record = load_active_record(&state, &code).await?;
    let scope = record.owner;
    let identifier = resolve_identifier(&state, &code).await?;

    let session_id = match req.session_id {
        Some(session) => session,
        None => {
            if record.is_exhausted() {
                return Err(RelayError::LimitReached {
                    code,
                    used: record.used_count,
                    limit: record.limit_count,
                });
            }
            Uuid::new_v4().to_string()
        }
    };

    let batch = state
        .downloads
        .get_many(&identifier, &session_id, scope, &req.chunk_indices)
        .await?;

    if !batch.found.is_empty() && batch.total_chunks > 0 {
        let from = req.chunk_indices.iter().copied().max().unwrap_or(0);
        let downloads = state.downloads.clone();
        let identifier = identifier.clone();
        let session = session_id.clone();
        let total = batch.total_chunks;
        let preload = state.config.batch_preload_count;
        tokio::spawn(async move {
            downloads
                .prefetch(&identifier, &session, scope, from, total, preload)
                .await;
        });
    }

    let chunks = batch
        .found
        .iter()
        .map(|(&index, chunk)| {
            (
                index,
                BatchChunk {
                    data: BASE64.encode(&chunk.payload),
                    hash: chunk.content_hash.clone(),
                    index,
                },
            )
        })
        .collect();

    Ok(Json(BatchChunksResponse {
        chunks,
        session_id,
        missing: batch.missing,
        expired: batch.expired,
    }))
}

// == Download Complete ==
/// Handler for POST /codes/:code/downloaded
///
/// The receiver's completion signal: tears down its session window, bumps the
/// usage counter, and flips the record to completed at the limit. Chunks are
/// never deleted here; other receivers may still be downloading.
pub async fn download_complete_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<DownloadCompleteRequest>,
) -> Result<Json<DownloadCompleteResponse>> {
    let record = load_active_record(&state, &code).await?;

    if let Some(session_id) = &req.session_id {
        if let Some(identifier) = state.mapping.resolve(&code).await? {
            state.downloads.complete_session(&identifier, session_id).await;
        }
    }

    if record.is_exhausted() {
        state
            .records
            .set_status(&code, RecordStatus::Completed)
            .await?;
        return Err(RelayError::LimitReached {
            code,
            used: record.used_count,
            limit: record.limit_count,
        });
    }

    let updated = state
        .records
        .increment_usage(&code)
        .await?
        .ok_or_else(|| RelayError::NotFound(code.clone()))?;

    Ok(Json(DownloadCompleteResponse {
        used_count: updated.used_count,
        limit_count: updated.limit_count,
        remaining: remaining_uses(&updated),
        status: updated.status.to_string(),
    }))
}

// == Wrapped Secret ==
/// Handler for PUT /codes/:code/secret
///
/// Stores the client-wrapped file key under the *lookup* code with the
/// record's own expiry. Secrets are never shared across re-issued codes and
/// never expiry-extended.
pub async fn store_secret_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Json(req): Json<StoreSecretRequest>,
) -> Result<StatusCode> {
    if let Some(msg) = req.validate() {
        return Err(RelayError::InvalidRequest(msg));
    }
    let record = load_active_record(&state, &code).await?;
    let stored = state
        .cache
        .set(
            CacheKind::Secret,
            record.owner,
            &code,
            CacheValue::Text(req.wrapped_secret),
            Some(record.expires_at),
        )
        .await?;
    if !stored {
        return Err(RelayError::Expired(code));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for GET /codes/:code/secret
pub async fn get_secret_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<SecretResponse>> {
    let record = load_active_record(&state, &code).await?;
    if record.status == RecordStatus::Completed {
        return Err(RelayError::Completed(code));
    }
    let secret = state
        .cache
        .get(CacheKind::Secret, record.owner, &code)
        .await?
        .and_then(|value| value.as_text().map(|s| s.to_string()))
        .ok_or_else(|| RelayError::NotFound(format!("no secret stored for {code}")))?;
    Ok(Json(SecretResponse {
        wrapped_secret: secret,
    }))
}

// == Metadata ==
/// Handler for GET /codes/:code/metadata
pub async fn metadata_handler(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<MetadataResponse>> {
    let record = load_active_record(&state, &code).await?;
    let identifier = resolve_identifier(&state, &code).await?;
    let metadata = state
        .cache
        .get(CacheKind::Metadata, record.owner, &identifier)
        .await?
        .and_then(|value| value.into_metadata())
        .ok_or_else(|| RelayError::NotFound(format!("no metadata cached for {code}")))?;
    Ok(Json(metadata.into()))
}

// == Stats ==
/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    let cache = state.cache.stats().await;
    let hit_rate = cache.hit_rate();
    Json(StatsResponse {
        cache,
        hit_rate,
        upload_buffers: state.uploads.len().await,
        download_sessions: state.downloads.session_count().await,
        active_mappings: state.mapping.active_len().await,
    })
}

// == Health ==
/// Handler for GET /health
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> AppState {
        AppState::new(
            CacheStore::new("test"),
            Arc::new(MemoryRecordStore::new()),
            Config::default(),
        )
    }

    async fn register(state: &AppState, req: RegisterCodeRequest) -> RegisterCodeResponse {
        let (status, Json(resp)) = register_code_handler(State(state.clone()), Json(req)).await.unwrap();
        assert_eq!(status, StatusCode::CREATED);
        resp
    }

    fn plain_register() -> RegisterCodeRequest {
        RegisterCodeRequest {
            ttl_secs: None,
            limit_count: None,
            tenant: None,
            reuse_code: None,
        }
    }

    #[tokio::test]
    async fn test_register_self_maps_the_code() {
        let state = test_state();
        let resp = register(&state, plain_register()).await;
        assert_eq!(resp.code, resp.identifier_key);
        assert!(!resp.reused);

        let resolved = state.mapping.resolve(&resp.code).await.unwrap();
        assert_eq!(resolved, Some(resp.identifier_key));
    }

    #[tokio::test]
    async fn test_upload_then_complete_then_download() {
        let state = test_state();
        let resp = register(&state, plain_register()).await;
        let code = resp.code;

        for index in 0..3u32 {
            let body = Bytes::from(vec![index as u8; 8]);
            upload_chunk_handler(
                State(state.clone()),
                Path((code.clone(), index)),
                body,
            )
            .await
            .unwrap();
        }

        upload_complete_handler(
            State(state.clone()),
            Path(code.clone()),
            Json(UploadCompleteRequest {
                file_name: "file.bin".to_string(),
                file_size: 24,
                mime_type: "application/octet-stream".to_string(),
                total_chunks: 3,
            }),
        )
        .await
        .unwrap();

        let response = download_chunk_handler(
            State(state.clone()),
            Path((code.clone(), 1)),
            Query(SessionQuery { session: None }),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-chunk-hash"));
    }

    #[tokio::test]
    async fn test_incomplete_upload_reports_missing_indices() {
        let state = test_state();
        let resp = register(&state, plain_register()).await;
        let code = resp.code;

        upload_chunk_handler(
            State(state.clone()),
            Path((code.clone(), 0)),
            Bytes::from_static(b"chunk"),
        )
        .await
        .unwrap();

        let err = upload_complete_handler(
            State(state.clone()),
            Path(code.clone()),
            Json(UploadCompleteRequest {
                file_name: "file.bin".to_string(),
                file_size: 24,
                mime_type: "application/octet-stream".to_string(),
                total_chunks: 3,
            }),
        )
        .await
        .unwrap_err();
        match err {
            RelayError::IncompleteUpload { missing, extra } => {
                assert_eq!(missing, vec![1, 2]);
                assert!(extra.is_empty());
            }
            other => panic!("expected IncompleteUpload, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_code_is_not_found() {
        let state = test_state();
        let err = code_status_handler(State(state), Path("ZZZZZ9".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_secret_roundtrip() {
        let state = test_state();
        let resp = register(&state, plain_register()).await;
        let code = resp.code;

        store_secret_handler(
            State(state.clone()),
            Path(code.clone()),
            Json(StoreSecretRequest {
                wrapped_secret: "d2lyZWQ=".to_string(),
            }),
        )
        .await
        .unwrap();

        let Json(secret) = get_secret_handler(State(state.clone()), Path(code.clone()))
            .await
            .unwrap();
        assert_eq!(secret.wrapped_secret, "d2lyZWQ=");
    }

    #[tokio::test]
    async fn test_reissue_shares_the_artifact() {
        let state = test_state();
        let first = register(&state, plain_register()).await;

        upload_chunk_handler(
            State(state.clone()),
            Path((first.code.clone(), 0)),
            Bytes::from_static(b"payload"),
        )
        .await
        .unwrap();
        upload_complete_handler(
            State(state.clone()),
            Path(first.code.clone()),
            Json(UploadCompleteRequest {
                file_name: "file.bin".to_string(),
                file_size: 7,
                mime_type: "text/plain".to_string(),
                total_chunks: 1,
            }),
        )
        .await
        .unwrap();

        let second = register(
            &state,
            RegisterCodeRequest {
                ttl_secs: Some(7200),
                limit_count: None,
                tenant: None,
                reuse_code: Some(first.code.clone()),
            },
        )
        .await;
        assert!(second.reused);
        assert_eq!(second.identifier_key, first.code);

        // The second code serves the first code's cached chunk.
        let response = download_chunk_handler(
            State(state.clone()),
            Path((second.code.clone(), 0)),
            Query(SessionQuery { session: None }),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
