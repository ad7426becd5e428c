//! Upload Pool
//!
//! Write-side accumulation buffer. Chunks of an in-progress upload land here
//! first (cheap in-process writes) and are merged into the cache store in one
//! batch once the sender declares completion, never before, so a half-done
//! upload cannot corrupt an artifact another code is already serving.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::{CacheKind, CacheStore, CacheValue, ChunkIndex, ChunkMap, StoredChunk, TenantScope};
use crate::error::Result;

// == Upload Buffer ==
#[derive(Debug, Clone)]
struct UploadBuffer {
    chunks: ChunkMap,
    last_activity: DateTime<Utc>,
}

// == Merge Outcome ==
/// Result of a completeness check against the buffered chunk set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Buffer covered the expected range and was merged into the cache store.
    Merged { total_chunks: usize },
    /// Indices were missing; the buffer was discarded, the cache untouched.
    /// Carries the exact sets so the sender can resume rather than restart.
    Incomplete {
        missing: Vec<ChunkIndex>,
        extra: Vec<ChunkIndex>,
    },
    /// Nothing was buffered for this identifier (a reused artifact may
    /// already be fully cached; the caller decides what that means).
    Empty,
}

// == Upload Pool ==
/// Per-identifier write buffers, owned exclusively by in-progress uploads.
pub struct UploadPool {
    cache: Arc<CacheStore>,
    buffers: RwLock<HashMap<String, UploadBuffer>>,
}

impl UploadPool {
    // == Constructor ==
    pub fn new(cache: Arc<CacheStore>) -> Self {
        Self {
            cache,
            buffers: RwLock::new(HashMap::new()),
        }
    }

    // == Add Chunk ==
    /// Buffers one chunk. Last writer wins per index; concurrent writes to
    /// different indices of the same identifier are the expected case.
    pub async fn add_chunk(&self, identifier_key: &str, index: ChunkIndex, chunk: StoredChunk) {
        let mut buffers = self.buffers.write().await;
        let buffer = buffers
            .entry(identifier_key.to_string())
            .or_insert_with(|| UploadBuffer {
                chunks: ChunkMap::new(),
                last_activity: Utc::now(),
            });
        buffer.chunks.insert(index, chunk);
        buffer.last_activity = Utc::now();
        debug!(
            identifier_key,
            index,
            buffered = buffer.chunks.len(),
            "chunk buffered"
        );
    }

    // == Try Merge Complete ==
    /// Validates the buffered index set against `{0..expected_total}` and, on
    /// success, merges the buffer into the cache store's chunk map for the
    /// identifier (union with any already-cached chunks of a reused
    /// artifact). The buffer is consumed in every outcome: merged, aborted on
    /// incompleteness, or reported [`MergeOutcome::Empty`] when it never
    /// existed.
    pub async fn try_merge_complete(
        &self,
        identifier_key: &str,
        scope: TenantScope,
        expected_total: u32,
    ) -> Result<MergeOutcome> {
        // Taking the buffer out under the lock makes the completeness check
        // and the merge atomic with respect to concurrent add_chunk calls.
        let buffer = self.buffers.write().await.remove(identifier_key);
        let Some(buffer) = buffer else {
            return Ok(MergeOutcome::Empty);
        };

        let expected: BTreeSet<ChunkIndex> = (0..expected_total).collect();
        let buffered: BTreeSet<ChunkIndex> = buffer.chunks.keys().copied().collect();
        let missing: Vec<ChunkIndex> = expected.difference(&buffered).copied().collect();
        let extra: Vec<ChunkIndex> = buffered.difference(&expected).copied().collect();

        if !missing.is_empty() {
            warn!(
                identifier_key,
                expected_total,
                missing = missing.len(),
                "upload incomplete, discarding buffer"
            );
            return Ok(MergeOutcome::Incomplete { missing, extra });
        }
        if !extra.is_empty() {
            warn!(identifier_key, ?extra, "buffer holds indices beyond the declared total");
        }

        // Union with whatever is already cached; freshly uploaded chunks win.
        let mut merged = self
            .cache
            .get(CacheKind::ChunkMap, scope, identifier_key)
            .await?
            .and_then(|value| value.into_chunks())
            .unwrap_or_default();
        let prior = merged.len();
        let expires_at = buffer.chunks.values().next().map(|chunk| chunk.expires_at);
        merged.extend(buffer.chunks);

        let total_chunks = merged.len();
        self.cache
            .set(
                CacheKind::ChunkMap,
                scope,
                identifier_key,
                CacheValue::Chunks(merged),
                expires_at,
            )
            .await?;
        info!(
            identifier_key,
            total_chunks,
            prior_cached = prior,
            "upload buffer merged into cache"
        );
        Ok(MergeOutcome::Merged { total_chunks })
    }

    // == Maintenance ==
    /// Whether a buffer currently exists for the identifier.
    pub async fn contains(&self, identifier_key: &str) -> bool {
        self.buffers.read().await.contains_key(identifier_key)
    }

    /// Drops the buffer for an identifier; returns whether one existed.
    pub async fn remove(&self, identifier_key: &str) -> bool {
        self.buffers.write().await.remove(identifier_key).is_some()
    }

    /// Drops buffers with no activity inside the window, and empty buffers.
    /// Returns the number dropped.
    pub async fn cleanup_stale(&self, max_idle: Duration) -> usize {
        let cutoff = Utc::now() - max_idle;
        let mut buffers = self.buffers.write().await;
        let stale: Vec<String> = buffers
            .iter()
            .filter(|(_, buffer)| buffer.chunks.is_empty() || buffer.last_activity < cutoff)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            buffers.remove(key);
            info!(identifier_key = %key, "dropped stale upload buffer");
        }
        stale.len()
    }

    /// Number of buffers currently held.
    pub async fn len(&self) -> usize {
        self.buffers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buffers.read().await.is_empty()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(payload: &[u8]) -> StoredChunk {
        StoredChunk {
            payload: payload.to_vec(),
            content_hash: "hash".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    fn pool() -> (UploadPool, Arc<CacheStore>) {
        let cache = Arc::new(CacheStore::new("test"));
        (UploadPool::new(cache.clone()), cache)
    }

    #[tokio::test]
    async fn test_merge_complete_buffer() {
        let (pool, cache) = pool();
        for index in 0..3 {
            pool.add_chunk("ART001", index, chunk(&[index as u8])).await;
        }

        let outcome = pool
            .try_merge_complete("ART001", TenantScope::Anonymous, 3)
            .await
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Merged { total_chunks: 3 });
        assert!(!pool.contains("ART001").await);

        let chunks = cache
            .get(CacheKind::ChunkMap, TenantScope::Anonymous, "ART001")
            .await
            .unwrap()
            .and_then(|value| value.into_chunks())
            .unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[&1].payload, vec![1]);
    }

    #[tokio::test]
    async fn test_merge_reports_exact_missing_set() {
        let (pool, cache) = pool();
        pool.add_chunk("ART002", 0, chunk(b"a")).await;
        pool.add_chunk("ART002", 2, chunk(b"c")).await;
        pool.add_chunk("ART002", 5, chunk(b"f")).await;

        let outcome = pool
            .try_merge_complete("ART002", TenantScope::Anonymous, 4)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Incomplete {
                missing: vec![1, 3],
                extra: vec![5],
            }
        );
        // Failed completeness aborts the buffer and never touches the cache.
        assert!(!pool.contains("ART002").await);
        assert!(cache
            .get(CacheKind::ChunkMap, TenantScope::Anonymous, "ART002")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_merge_unions_with_cached_chunks() {
        let (pool, cache) = pool();
        let expires = Some(Utc::now() + Duration::hours(1));
        let mut cached = ChunkMap::new();
        cached.insert(7, chunk(b"old"));
        cache
            .set(
                CacheKind::ChunkMap,
                TenantScope::Anonymous,
                "ART003",
                CacheValue::Chunks(cached),
                expires,
            )
            .await
            .unwrap();

        pool.add_chunk("ART003", 0, chunk(b"x")).await;
        pool.add_chunk("ART003", 1, chunk(b"y")).await;
        let outcome = pool
            .try_merge_complete("ART003", TenantScope::Anonymous, 2)
            .await
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Merged { total_chunks: 3 });

        let merged = cache
            .get(CacheKind::ChunkMap, TenantScope::Anonymous, "ART003")
            .await
            .unwrap()
            .and_then(|value| value.into_chunks())
            .unwrap();
        assert_eq!(
            merged.keys().copied().collect::<Vec<_>>(),
            vec![0, 1, 7]
        );
    }

    #[tokio::test]
    async fn test_merge_with_no_buffer_is_empty() {
        let (pool, _) = pool();
        let outcome = pool
            .try_merge_complete("NOBODY", TenantScope::Anonymous, 3)
            .await
            .unwrap();
        assert_eq!(outcome, MergeOutcome::Empty);
    }

    #[tokio::test]
    async fn test_last_writer_wins_per_index() {
        let (pool, cache) = pool();
        pool.add_chunk("ART004", 0, chunk(b"first")).await;
        pool.add_chunk("ART004", 0, chunk(b"second")).await;

        pool.try_merge_complete("ART004", TenantScope::Anonymous, 1)
            .await
            .unwrap();
        let chunks = cache
            .get(CacheKind::ChunkMap, TenantScope::Anonymous, "ART004")
            .await
            .unwrap()
            .and_then(|value| value.into_chunks())
            .unwrap();
        assert_eq!(chunks[&0].payload, b"second".to_vec());
    }

    #[tokio::test]
    async fn test_cleanup_drops_idle_buffers() {
        let (pool, _) = pool();
        pool.add_chunk("IDLE01", 0, chunk(b"x")).await;
        pool.add_chunk("BUSY01", 0, chunk(b"y")).await;

        // A zero-width idle window makes everything stale immediately.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let dropped = pool.cleanup_stale(Duration::zero()).await;
        assert_eq!(dropped, 2);
        assert!(pool.is_empty().await);
    }
}
