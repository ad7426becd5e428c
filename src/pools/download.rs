//! Download Pool
//!
//! Read-side prefetch windows, one per (identifier, session) pair. A window
//! serves repeat reads without re-deserializing the whole chunk map, and a
//! detached prefetch task keeps it ahead of the receiver's position. Sessions
//! never share windows, so concurrent receivers cannot disturb each other.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::{CacheKind, CacheStore, CacheValue, ChunkIndex, ChunkMap, StoredChunk, TenantScope};
use crate::error::Result;

// == Session Window ==
#[derive(Debug, Clone)]
struct SessionWindow {
    chunks: ChunkMap,
    loaded: BTreeSet<ChunkIndex>,
    total_chunks: u32,
    last_access: DateTime<Utc>,
    access_count: u64,
}

impl SessionWindow {
    fn new(total_chunks: u32) -> Self {
        Self {
            chunks: ChunkMap::new(),
            loaded: BTreeSet::new(),
            total_chunks,
            last_access: Utc::now(),
            access_count: 0,
        }
    }

    fn touch(&mut self) {
        self.last_access = Utc::now();
        self.access_count += 1;
    }
}

// == Pool Fetch ==
/// A successful chunk read, with enough context for the caller to decide
/// whether to kick off a prefetch.
#[derive(Debug, Clone)]
pub struct PoolFetch {
    pub chunk: StoredChunk,
    /// True when the chunk came from the cache store rather than the window
    pub served_from_store: bool,
    /// Total chunk count of the artifact; 0 when no metadata was available
    pub total_chunks: u32,
}

/// Result of a batch read: the partition of the requested indices.
#[derive(Debug, Clone, Default)]
pub struct BatchFetch {
    pub found: ChunkMap,
    pub missing: Vec<ChunkIndex>,
    pub expired: Vec<ChunkIndex>,
    pub total_chunks: u32,
}

// == Download Pool ==
/// Per-session read buffers over the shared chunk cache.
pub struct DownloadPool {
    cache: Arc<CacheStore>,
    /// identifier key -> session id -> window
    sessions: RwLock<HashMap<String, HashMap<String, SessionWindow>>>,
}

impl DownloadPool {
    // == Constructor ==
    pub fn new(cache: Arc<CacheStore>) -> Self {
        Self {
            cache,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    async fn total_chunks_from_metadata(&self, identifier_key: &str, scope: TenantScope) -> u32 {
        self.cache
            .get(CacheKind::Metadata, scope, identifier_key)
            .await
            .ok()
            .flatten()
            .and_then(|value| value.into_metadata())
            .map(|metadata| metadata.total_chunks)
            .unwrap_or(0)
    }

    /// Removes one index from the backing store entry (lazy expiry purge).
    async fn purge_store_chunk(
        &self,
        identifier_key: &str,
        scope: TenantScope,
        index: ChunkIndex,
    ) -> Result<()> {
        let Some(mut chunks) = self
            .cache
            .get(CacheKind::ChunkMap, scope, identifier_key)
            .await?
            .and_then(|value| value.into_chunks())
        else {
            return Ok(());
        };
        if chunks.remove(&index).is_none() {
            return Ok(());
        }
        if chunks.is_empty() {
            self.cache
                .delete(CacheKind::ChunkMap, scope, identifier_key)
                .await?;
        } else {
            let expires_at = chunks.values().map(|chunk| chunk.expires_at).max();
            self.cache
                .set(
                    CacheKind::ChunkMap,
                    scope,
                    identifier_key,
                    CacheValue::Chunks(chunks),
                    expires_at,
                )
                .await?;
        }
        Ok(())
    }

    // == Get ==
    /// Fetches one chunk for a session: the session's own window first, then
    /// the cache store (seeding the window for that index on the way out).
    /// Expired chunks behave as absent and are purged wherever they are
    /// found. Other sessions' windows are never touched.
    pub async fn get(
        &self,
        identifier_key: &str,
        session_id: &str,
        scope: TenantScope,
        index: ChunkIndex,
    ) -> Result<Option<PoolFetch>> {
        let now = Utc::now();

        // Fast path: the session's own window.
        {
            let mut sessions = self.sessions.write().await;
            if let Some(window) = sessions
                .get_mut(identifier_key)
                .and_then(|windows| windows.get_mut(session_id))
            {
                if let Some(chunk) = window.chunks.get(&index).cloned() {
                    if now > chunk.expires_at {
                        window.chunks.remove(&index);
                        window.loaded.remove(&index);
                        drop(sessions);
                        warn!(identifier_key, index, "expired chunk purged from session window");
                        self.purge_store_chunk(identifier_key, scope, index).await?;
                        return Ok(None);
                    }
                    window.touch();
                    let total_chunks = window.total_chunks;
                    debug!(identifier_key, session_id, index, "chunk served from session window");
                    return Ok(Some(PoolFetch {
                        chunk,
                        served_from_store: false,
                        total_chunks,
                    }));
                }
            }
        }

        // Cold path: read through to the cache store.
        let Some(chunks) = self
            .cache
            .get(CacheKind::ChunkMap, scope, identifier_key)
            .await?
            .and_then(|value| value.into_chunks())
        else {
            return Ok(None);
        };
        let Some(chunk) = chunks.get(&index).cloned() else {
            return Ok(None);
        };
        if now > chunk.expires_at {
            warn!(identifier_key, index, "expired chunk purged from cache store");
            self.purge_store_chunk(identifier_key, scope, index).await?;
            return Ok(None);
        }

        // Seed the session's window for this index. Window creation needs the
        // declared total, which lives in the metadata entry; without it the
        // chunk is still served, just not pooled.
        let total_chunks = self.total_chunks_from_metadata(identifier_key, scope).await;
        if total_chunks > 0 {
            let mut sessions = self.sessions.write().await;
            let window = sessions
                .entry(identifier_key.to_string())
                .or_default()
                .entry(session_id.to_string())
                .or_insert_with(|| SessionWindow::new(total_chunks));
            window.chunks.insert(index, chunk.clone());
            window.loaded.insert(index);
            window.touch();
        }

        Ok(Some(PoolFetch {
            chunk,
            served_from_store: true,
            total_chunks,
        }))
    }

    // == Get Many ==
    /// Batch variant of [`get`]: reads the backing chunk map at most once and
    /// partitions the requested indices into found / missing / expired.
    ///
    /// [`get`]: DownloadPool::get
    pub async fn get_many(
        &self,
        identifier_key: &str,
        session_id: &str,
        scope: TenantScope,
        indices: &[ChunkIndex],
    ) -> Result<BatchFetch> {
        let now = Utc::now();
        let mut result = BatchFetch::default();

        // Pull what the session window already holds.
        let mut remaining: Vec<ChunkIndex> = Vec::new();
        {
            let mut sessions = self.sessions.write().await;
            let window = sessions
                .get_mut(identifier_key)
                .and_then(|windows| windows.get_mut(session_id));
            if let Some(window) = window {
                window.touch();
                for &index in indices {
                    match window.chunks.get(&index) {
                        Some(chunk) if now > chunk.expires_at => {
                            window.chunks.remove(&index);
                            window.loaded.remove(&index);
                            result.expired.push(index);
                        }
                        Some(chunk) => {
                            result.found.insert(index, chunk.clone());
                        }
                        None => remaining.push(index),
                    }
                }
            } else {
                remaining.extend_from_slice(indices);
            }
        }

        if remaining.is_empty() {
            result.total_chunks = self.total_chunks_from_metadata(identifier_key, scope).await;
            return Ok(result);
        }

        // One read of the backing map covers every remaining index.
        let store_chunks = self
            .cache
            .get(CacheKind::ChunkMap, scope, identifier_key)
            .await?
            .and_then(|value| value.into_chunks());
        let mut purged = false;
        let mut store_chunks = match store_chunks {
            Some(chunks) => chunks,
            None => {
                result.missing.extend(remaining);
                result.total_chunks = self.total_chunks_from_metadata(identifier_key, scope).await;
                return Ok(result);
            }
        };

        let mut fetched = ChunkMap::new();
        for index in remaining {
            match store_chunks.get(&index) {
                Some(chunk) if now > chunk.expires_at => {
                    store_chunks.remove(&index);
                    purged = true;
                    result.expired.push(index);
                }
                Some(chunk) => {
                    fetched.insert(index, chunk.clone());
                }
                None => result.missing.push(index),
            }
        }

        if purged {
            let expires_at = store_chunks.values().map(|chunk| chunk.expires_at).max();
            if store_chunks.is_empty() {
                self.cache
                    .delete(CacheKind::ChunkMap, scope, identifier_key)
                    .await?;
            } else {
                self.cache
                    .set(
                        CacheKind::ChunkMap,
                        scope,
                        identifier_key,
                        CacheValue::Chunks(store_chunks),
                        expires_at,
                    )
                    .await?;
            }
        }

        let total_chunks = self.total_chunks_from_metadata(identifier_key, scope).await;
        result.total_chunks = total_chunks;

        // Seed the session window with everything freshly fetched.
        if !fetched.is_empty() && total_chunks > 0 {
            let mut sessions = self.sessions.write().await;
            let window = sessions
                .entry(identifier_key.to_string())
                .or_default()
                .entry(session_id.to_string())
                .or_insert_with(|| SessionWindow::new(total_chunks));
            for (&index, chunk) in &fetched {
                window.chunks.insert(index, chunk.clone());
                window.loaded.insert(index);
            }
            window.touch();
        }

        result.found.extend(fetched);
        Ok(result)
    }

    // == Prefetch ==
    /// Copies the chunks in `(from_index, from_index + preload_count]`
    /// (clamped to the total) from the cache store into the session's window,
    /// skipping indices already present. Reads the backing map exactly once.
    /// Intended to run as a detached task; a window torn down mid-flight
    /// simply absorbs writes until the sweep removes it.
    pub async fn prefetch(
        &self,
        identifier_key: &str,
        session_id: &str,
        scope: TenantScope,
        from_index: ChunkIndex,
        total_count: u32,
        preload_count: u32,
    ) {
        let start = from_index.saturating_add(1);
        let end = start.saturating_add(preload_count).min(total_count);
        if start >= end {
            return;
        }

        let chunks = match self.cache.get(CacheKind::ChunkMap, scope, identifier_key).await {
            Ok(Some(value)) => match value.into_chunks() {
                Some(chunks) => chunks,
                None => return,
            },
            Ok(None) => return,
            Err(err) => {
                warn!(identifier_key, error = %err, "prefetch read failed");
                return;
            }
        };

        let mut sessions = self.sessions.write().await;
        let Some(window) = sessions
            .get_mut(identifier_key)
            .and_then(|windows| windows.get_mut(session_id))
        else {
            return;
        };
        let mut copied = 0usize;
        for index in start..end {
            if window.chunks.contains_key(&index) {
                continue;
            }
            if let Some(chunk) = chunks.get(&index) {
                window.chunks.insert(index, chunk.clone());
                window.loaded.insert(index);
                copied += 1;
            }
        }
        if copied > 0 {
            debug!(identifier_key, session_id, copied, start, end, "prefetched chunks into window");
        }
    }

    // == Touch ==
    /// Refreshes a session window's last-access time.
    pub async fn touch(&self, identifier_key: &str, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(window) = sessions
            .get_mut(identifier_key)
            .and_then(|windows| windows.get_mut(session_id))
        {
            window.last_access = Utc::now();
        }
    }

    // == Complete Session ==
    /// Tears down one session's window on the explicit completion signal.
    pub async fn complete_session(&self, identifier_key: &str, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(windows) = sessions.get_mut(identifier_key) else {
            return false;
        };
        let removed = windows.remove(session_id).is_some();
        if windows.is_empty() {
            sessions.remove(identifier_key);
        }
        removed
    }

    // == Maintenance ==
    /// Evicts windows with no access inside the idle window. Returns the
    /// number of windows dropped.
    pub async fn cleanup_idle(&self, max_idle: Duration) -> usize {
        let cutoff = Utc::now() - max_idle;
        let mut sessions = self.sessions.write().await;
        let mut dropped = 0usize;
        sessions.retain(|identifier_key, windows| {
            windows.retain(|session_id, window| {
                let keep = window.last_access >= cutoff;
                if !keep {
                    info!(identifier_key = %identifier_key, session_id = %session_id, "evicted idle download window");
                    dropped += 1;
                }
                keep
            });
            !windows.is_empty()
        });
        dropped
    }

    /// Drops every window of one identifier (sweep cascade). Returns how many
    /// windows were removed.
    pub async fn remove_identifier(&self, identifier_key: &str) -> usize {
        self.sessions
            .write()
            .await
            .remove(identifier_key)
            .map(|windows| windows.len())
            .unwrap_or(0)
    }

    /// Total number of live session windows.
    pub async fn session_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .map(|windows| windows.len())
            .sum()
    }

    #[cfg(test)]
    async fn window_indices(&self, identifier_key: &str, session_id: &str) -> Vec<ChunkIndex> {
        self.sessions
            .read()
            .await
            .get(identifier_key)
            .and_then(|windows| windows.get(session_id))
            .map(|window| window.chunks.keys().copied().collect())
            .unwrap_or_default()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ArtifactMetadata;

    fn chunk(payload: &[u8], expires_at: DateTime<Utc>) -> StoredChunk {
        StoredChunk {
            payload: payload.to_vec(),
            content_hash: "hash".to_string(),
            expires_at,
        }
    }

    async fn seeded_pool(total: u32) -> (DownloadPool, Arc<CacheStore>) {
        let cache = Arc::new(CacheStore::new("test"));
        let expires = Utc::now() + Duration::hours(1);
        let mut chunks = ChunkMap::new();
        for index in 0..total {
            chunks.insert(index, chunk(&[index as u8], expires));
        }
        cache
            .set(
                CacheKind::ChunkMap,
                TenantScope::Anonymous,
                "ART001",
                CacheValue::Chunks(chunks),
                Some(expires),
            )
            .await
            .unwrap();
        cache
            .set(
                CacheKind::Metadata,
                TenantScope::Anonymous,
                "ART001",
                CacheValue::Metadata(ArtifactMetadata {
                    file_name: "file.bin".to_string(),
                    file_size: 1024,
                    mime_type: "application/octet-stream".to_string(),
                    total_chunks: total,
                    expires_at: expires,
                    identifier_key: "ART001".to_string(),
                }),
                Some(expires),
            )
            .await
            .unwrap();
        (DownloadPool::new(cache.clone()), cache)
    }

    #[tokio::test]
    async fn test_cold_get_reads_through_and_seeds_window() {
        let (pool, _) = seeded_pool(10).await;

        let fetch = pool
            .get("ART001", "session-1", TenantScope::Anonymous, 2)
            .await
            .unwrap()
            .unwrap();
        assert!(fetch.served_from_store);
        assert_eq!(fetch.chunk.payload, vec![2]);
        assert_eq!(fetch.total_chunks, 10);

        // Second read of the same index comes from the window.
        let fetch = pool
            .get("ART001", "session-1", TenantScope::Anonymous, 2)
            .await
            .unwrap()
            .unwrap();
        assert!(!fetch.served_from_store);
    }

    #[tokio::test]
    async fn test_get_missing_index_is_none() {
        let (pool, _) = seeded_pool(3).await;
        let fetch = pool
            .get("ART001", "session-1", TenantScope::Anonymous, 99)
            .await
            .unwrap();
        assert!(fetch.is_none());
    }

    #[tokio::test]
    async fn test_prefetch_window_is_exact() {
        let (pool, _) = seeded_pool(10).await;
        // Window creation via a first read at index 5.
        pool.get("ART001", "s1", TenantScope::Anonymous, 5)
            .await
            .unwrap();

        pool.prefetch("ART001", "s1", TenantScope::Anonymous, 5, 10, 3)
            .await;

        let indices = pool.window_indices("ART001", "s1").await;
        assert_eq!(indices, vec![5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_prefetch_clamps_to_total() {
        let (pool, _) = seeded_pool(10).await;
        pool.get("ART001", "s1", TenantScope::Anonymous, 8)
            .await
            .unwrap();

        pool.prefetch("ART001", "s1", TenantScope::Anonymous, 8, 10, 5)
            .await;
        let indices = pool.window_indices("ART001", "s1").await;
        assert_eq!(indices, vec![8, 9]);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let (pool, _) = seeded_pool(10).await;
        pool.get("ART001", "s1", TenantScope::Anonymous, 5)
            .await
            .unwrap();
        pool.prefetch("ART001", "s1", TenantScope::Anonymous, 5, 10, 3)
            .await;

        // S1 holds {5,6,7,8}; S2 holds nothing.
        assert_eq!(pool.window_indices("ART001", "s1").await, vec![5, 6, 7, 8]);
        assert!(pool.window_indices("ART001", "s2").await.is_empty());

        // A read for S2 seeds only S2's window.
        pool.get("ART001", "s2", TenantScope::Anonymous, 0)
            .await
            .unwrap();
        assert_eq!(pool.window_indices("ART001", "s2").await, vec![0]);
        assert_eq!(pool.window_indices("ART001", "s1").await, vec![5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_get_many_partitions_indices() {
        let (pool, cache) = seeded_pool(5).await;
        // Make index 4 expired inside the stored map.
        let mut chunks = cache
            .get(CacheKind::ChunkMap, TenantScope::Anonymous, "ART001")
            .await
            .unwrap()
            .and_then(|value| value.into_chunks())
            .unwrap();
        chunks.get_mut(&4).unwrap().expires_at = Utc::now() - Duration::seconds(1);
        cache
            .set(
                CacheKind::ChunkMap,
                TenantScope::Anonymous,
                "ART001",
                CacheValue::Chunks(chunks),
                Some(Utc::now() + Duration::hours(1)),
            )
            .await
            .unwrap();

        let batch = pool
            .get_many("ART001", "s1", TenantScope::Anonymous, &[0, 2, 4, 9])
            .await
            .unwrap();
        assert_eq!(batch.found.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(batch.missing, vec![9]);
        assert_eq!(batch.expired, vec![4]);
        assert_eq!(batch.total_chunks, 5);

        // The expired chunk was purged from the store as well.
        let stored = cache
            .get(CacheKind::ChunkMap, TenantScope::Anonymous, "ART001")
            .await
            .unwrap()
            .and_then(|value| value.into_chunks())
            .unwrap();
        assert!(!stored.contains_key(&4));
    }

    #[tokio::test]
    async fn test_complete_session_removes_window() {
        let (pool, _) = seeded_pool(3).await;
        pool.get("ART001", "s1", TenantScope::Anonymous, 0)
            .await
            .unwrap();
        assert_eq!(pool.session_count().await, 1);

        assert!(pool.complete_session("ART001", "s1").await);
        assert_eq!(pool.session_count().await, 0);
        assert!(!pool.complete_session("ART001", "s1").await);
    }

    #[tokio::test]
    async fn test_cleanup_idle_evicts_windows() {
        let (pool, _) = seeded_pool(3).await;
        pool.get("ART001", "s1", TenantScope::Anonymous, 0)
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let dropped = pool.cleanup_idle(Duration::zero()).await;
        assert_eq!(dropped, 1);
        assert_eq!(pool.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_identifier_drops_all_sessions() {
        let (pool, _) = seeded_pool(3).await;
        pool.get("ART001", "s1", TenantScope::Anonymous, 0)
            .await
            .unwrap();
        pool.get("ART001", "s2", TenantScope::Anonymous, 1)
            .await
            .unwrap();

        assert_eq!(pool.remove_identifier("ART001").await, 2);
        assert_eq!(pool.session_count().await, 0);
    }
}
