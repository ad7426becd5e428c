//! Cache Value Envelope
//!
//! Defines the tagged envelope stored under every cache key. The encoding a
//! value was written with is recorded in the envelope itself, so reads never
//! have to guess whether a payload is binary, text, or a structured record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Index of a chunk within an artifact, zero-based.
pub type ChunkIndex = u32;

// == Stored Chunk ==
/// One encrypted chunk as held by the chunk-map cache kind.
///
/// The relay never sees plaintext; `payload` is ciphertext produced by the
/// sender and `content_hash` is the SHA-256 of that ciphertext, used by
/// receivers to verify transfer integrity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredChunk {
    /// Encrypted chunk bytes
    pub payload: Vec<u8>,
    /// Hex-encoded SHA-256 of the payload
    pub content_hash: String,
    /// Absolute expiry of this chunk
    pub expires_at: DateTime<Utc>,
}

/// All chunks of one artifact, keyed by index.
pub type ChunkMap = BTreeMap<ChunkIndex, StoredChunk>;

// == Artifact Metadata ==
/// File-level metadata stored alongside the chunk map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    /// Original file name as declared by the sender
    pub file_name: String,
    /// Declared file size in bytes
    pub file_size: u64,
    /// Declared MIME type
    pub mime_type: String,
    /// Number of chunks the artifact was split into
    pub total_chunks: u32,
    /// Absolute expiry of the metadata entry
    pub expires_at: DateTime<Utc>,
    /// The identifier key this metadata (and its chunk map) is stored under
    pub identifier_key: String,
}

// == Cache Value ==
/// Tagged union of everything the cache can hold.
///
/// The tag travels with the serialized bytes, so a round trip through the
/// durable backend restores exactly the variant that was written, including
/// binary payloads that are not valid text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "payload", rename_all = "snake_case")]
pub enum CacheValue {
    /// Raw binary blob
    Binary(Vec<u8>),
    /// Plain text (wrapped secrets, mapping targets)
    Text(String),
    /// Chunk map of an artifact
    Chunks(ChunkMap),
    /// Artifact metadata record
    Metadata(ArtifactMetadata),
}

impl CacheValue {
    /// Returns the chunk map if this value holds one.
    pub fn as_chunks(&self) -> Option<&ChunkMap> {
        match self {
            CacheValue::Chunks(chunks) => Some(chunks),
            _ => None,
        }
    }

    /// Consumes the value, returning the chunk map if present.
    pub fn into_chunks(self) -> Option<ChunkMap> {
        match self {
            CacheValue::Chunks(chunks) => Some(chunks),
            _ => None,
        }
    }

    /// Returns the text payload if this value holds one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CacheValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Consumes the value, returning the metadata record if present.
    pub fn into_metadata(self) -> Option<ArtifactMetadata> {
        match self {
            CacheValue::Metadata(meta) => Some(meta),
            _ => None,
        }
    }

    /// Short label of the encoding, for logging.
    pub fn encoding(&self) -> &'static str {
        match self {
            CacheValue::Binary(_) => "binary",
            CacheValue::Text(_) => "text",
            CacheValue::Chunks(_) => "chunks",
            CacheValue::Metadata(_) => "metadata",
        }
    }
}
