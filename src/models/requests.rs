//! Request DTOs for the relay API
//!
//! Defines the structure of incoming HTTP request bodies. Field names follow
//! the wire convention of the transfer clients (camelCase).

use serde::Deserialize;

use crate::records::is_valid_lookup_code;

/// Request body for registering a pickup code (POST /codes)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterCodeRequest {
    /// Lifetime of the code in seconds (server default when omitted)
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// Maximum completed downloads (server default when omitted, 999 = unlimited)
    #[serde(default)]
    pub limit_count: Option<u32>,
    /// Authenticated tenant id; anonymous when omitted
    #[serde(default)]
    pub tenant: Option<u64>,
    /// Existing code whose artifact the new code should reuse
    #[serde(default)]
    pub reuse_code: Option<String>,
}

impl RegisterCodeRequest {
    /// Validates the request data
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if let Some(reuse_code) = &self.reuse_code {
            if !is_valid_lookup_code(reuse_code) {
                return Some("reuseCode must be 6 uppercase letters or digits".to_string());
            }
        }
        if self.ttl_secs == Some(0) {
            return Some("ttlSecs must be positive".to_string());
        }
        if self.limit_count == Some(0) {
            return Some("limitCount must be positive".to_string());
        }
        None
    }
}

/// Request body for the upload-completion notification (POST /codes/:code/complete)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCompleteRequest {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub total_chunks: u32,
}

impl UploadCompleteRequest {
    /// Validates the request data
    pub fn validate(&self) -> Option<String> {
        if self.file_name.is_empty() {
            return Some("fileName cannot be empty".to_string());
        }
        if self.total_chunks == 0 {
            return Some("totalChunks must be positive".to_string());
        }
        None
    }
}

/// Request body for a batch chunk download (POST /codes/:code/chunks)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchChunksRequest {
    pub chunk_indices: Vec<u32>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl BatchChunksRequest {
    /// Validates the request data
    pub fn validate(&self) -> Option<String> {
        if self.chunk_indices.is_empty() {
            return Some("chunkIndices cannot be empty".to_string());
        }
        None
    }
}

/// Request body for the download-completion notification (POST /codes/:code/downloaded)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadCompleteRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Request body for storing a wrapped secret (PUT /codes/:code/secret)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSecretRequest {
    /// The file key, already wrapped client-side; opaque to the relay
    pub wrapped_secret: String,
}

impl StoreSecretRequest {
    /// Validates the request data
    pub fn validate(&self) -> Option<String> {
        if self.wrapped_secret.is_empty() {
            return Some("wrappedSecret cannot be empty".to_string());
        }
        None
    }
}
