//! Response DTOs for the relay API
//!
//! Defines the structure of outgoing HTTP response bodies (camelCase on the
//! wire, matching the transfer clients).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::{ArtifactMetadata, CacheStats, ChunkIndex};
use crate::records::{TransferRecord, UNLIMITED_USES};

/// Response body for code registration (POST /codes)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterCodeResponse {
    pub code: String,
    pub identifier_key: String,
    pub expires_at: DateTime<Utc>,
    pub limit_count: u32,
    /// True when the code was attached to an already-cached artifact
    pub reused: bool,
}

/// Response body for a buffered chunk upload (PUT /codes/:code/chunks/:index)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkResponse {
    pub chunk_index: ChunkIndex,
    pub content_hash: String,
    /// True when the chunk already existed in the shared cache
    pub reused: bool,
    pub expires_at: DateTime<Utc>,
}

/// Response body for the upload-completion notification (POST /codes/:code/complete)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCompleteResponse {
    pub code: String,
    pub total_chunks: u32,
    pub file_name: String,
    pub file_size: u64,
}

/// Response body for code status (GET /codes/:code)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeStatusResponse {
    pub code: String,
    pub status: String,
    pub used_count: u32,
    pub limit_count: u32,
    pub remaining: u32,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
}

impl CodeStatusResponse {
    /// Builds the response from a record plus the cached metadata, if any.
    pub fn new(record: &TransferRecord, metadata: Option<&ArtifactMetadata>) -> Self {
        Self {
            code: record.code.clone(),
            status: record.status.to_string(),
            used_count: record.used_count,
            limit_count: record.limit_count,
            remaining: remaining_uses(record),
            expires_at: record.expires_at,
            created_at: record.created_at,
            file_name: metadata.map(|m| m.file_name.clone()),
            file_size: metadata.map(|m| m.file_size),
            total_chunks: metadata.map(|m| m.total_chunks),
        }
    }
}

/// Response body for artifact metadata (GET /codes/:code/metadata)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataResponse {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub total_chunks: u32,
    pub expires_at: DateTime<Utc>,
}

impl From<ArtifactMetadata> for MetadataResponse {
    fn from(metadata: ArtifactMetadata) -> Self {
        Self {
            file_name: metadata.file_name,
            file_size: metadata.file_size,
            mime_type: metadata.mime_type,
            total_chunks: metadata.total_chunks,
            expires_at: metadata.expires_at,
        }
    }
}

/// Response body for a wrapped secret fetch (GET /codes/:code/secret)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretResponse {
    pub wrapped_secret: String,
}

/// One chunk inside a batch download response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchChunk {
    /// Base64-encoded encrypted payload
    pub data: String,
    pub hash: String,
    pub index: ChunkIndex,
}

/// Response body for a batch chunk download (POST /codes/:code/chunks)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchChunksResponse {
    pub chunks: BTreeMap<ChunkIndex, BatchChunk>,
    pub session_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<ChunkIndex>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expired: Vec<ChunkIndex>,
}

/// Response body for the download-completion notification (POST /codes/:code/downloaded)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadCompleteResponse {
    pub used_count: u32,
    pub limit_count: u32,
    pub remaining: u32,
    pub status: String,
}

/// Response body for the stats endpoint (GET /stats)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub cache: CacheStats,
    pub hit_rate: f64,
    pub upload_buffers: usize,
    pub download_sessions: usize,
    pub active_mappings: usize,
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Downloads left on a record (999-limit codes never run out).
pub fn remaining_uses(record: &TransferRecord) -> u32 {
    if record.limit_count == UNLIMITED_USES {
        UNLIMITED_USES
    } else {
        record.limit_count.saturating_sub(record.used_count)
    }
}
