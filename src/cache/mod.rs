//! Cache Module
//!
//! The expiring key/value store shared by the whole relay: tagged value
//! envelope, durable backend abstraction with in-process fallback, and
//! store-level statistics.

use std::fmt;

use serde::{Deserialize, Serialize};

mod backend;
mod stats;
mod store;
mod value;


// Re-export public types
pub use backend::{BackendError, BackendResult, DurableBackend, RedisBackend};
pub use stats::CacheStats;
pub use store::CacheStore;
pub use value::{ArtifactMetadata, CacheValue, ChunkIndex, ChunkMap, StoredChunk};

// == Public Constants ==
/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 64;

// == Cache Kind ==
/// The families of entries the store holds. Each kind lives in its own key
/// namespace, so identical keys of different kinds never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKind {
    /// Encrypted chunk maps, keyed by identifier key
    ChunkMap,
    /// Artifact metadata, keyed by identifier key
    Metadata,
    /// Wrapped secrets, keyed by lookup key (never shared across codes)
    Secret,
    /// Durable tier of the identifier mapping, keyed by lookup key
    Mapping,
}

impl CacheKind {
    /// Stable namespace token used inside durable keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::ChunkMap => "chunks",
            CacheKind::Metadata => "metadata",
            CacheKind::Secret => "secret",
            CacheKind::Mapping => "mapping",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// == Tenant Scope ==
/// Isolation dimension partitioning otherwise-identical keys. Anonymous
/// transfers share one sentinel scope; authenticated senders each get their
/// own. Two scopes never observe each other's entries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TenantScope {
    #[default]
    Anonymous,
    Tenant(u64),
}

impl fmt::Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantScope::Anonymous => f.write_str("anonymous"),
            TenantScope::Tenant(id) => write!(f, "{id}"),
        }
    }
}
