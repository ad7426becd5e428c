//! Cache Store Module
//!
//! The single shared storage engine. Entries are addressed by
//! `(kind, tenant scope, key)` and carry an absolute expiry. Storage goes to
//! the durable backend (native TTL) when one is configured and healthy, and
//! falls back to an in-process map that enforces the same expiry semantics
//! lazily. Callers never observe which tier served them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::cache::{
    BackendError, CacheKind, CacheStats, CacheValue, DurableBackend, TenantScope, MAX_KEY_LENGTH,
};
use crate::error::{RelayError, Result};

// == Fallback Entry ==
/// Entry in the in-process fallback map. The durable backend expires keys
/// natively; here the expiry is checked on every touch.
#[derive(Debug, Clone)]
struct FallbackEntry {
    value: CacheValue,
    expires_at: Option<DateTime<Utc>>,
}

impl FallbackEntry {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires) if now > expires)
    }
}

// == Cache Store ==
/// Expiring key/value store shared by every component of the relay.
pub struct CacheStore {
    /// Namespace prefix for durable keys
    prefix: String,
    /// Durable tier, if configured
    backend: Option<Arc<dyn DurableBackend>>,
    /// Cleared on the first backend error; never set again afterwards
    backend_live: AtomicBool,
    /// In-process fallback tier
    fallback: RwLock<HashMap<String, FallbackEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    expired_purges: AtomicU64,
}

impl CacheStore {
    // == Constructors ==
    /// Creates a store with no durable backend (in-process only).
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            backend: None,
            backend_live: AtomicBool::new(false),
            fallback: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired_purges: AtomicU64::new(0),
        }
    }

    /// Creates a store backed by a durable tier.
    pub fn with_backend(prefix: impl Into<String>, backend: Arc<dyn DurableBackend>) -> Self {
        let mut store = Self::new(prefix);
        store.backend = Some(backend);
        store.backend_live = AtomicBool::new(true);
        store
    }

    // == Key Handling ==
    fn full_key(&self, kind: CacheKind, scope: TenantScope, key: &str) -> String {
        format!("{}:{}:{}:{}", self.prefix, kind, scope, key)
    }

    /// Rejects malformed keys. This is the one hard failure the store raises;
    /// misses and expiries are ordinary `None`/`false` results.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(RelayError::InvalidKey("empty key".to_string()));
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(RelayError::InvalidKey(format!(
                "key exceeds maximum length of {} bytes",
                MAX_KEY_LENGTH
            )));
        }
        if key.contains(':') {
            return Err(RelayError::InvalidKey(
                "key must not contain the namespace separator ':'".to_string(),
            ));
        }
        Ok(())
    }

    // == Backend Failover ==
    fn backend(&self) -> Option<&Arc<dyn DurableBackend>> {
        if self.backend_live.load(Ordering::Relaxed) {
            self.backend.as_ref()
        } else {
            None
        }
    }

    /// Demotes the durable tier for the remainder of the process lifetime.
    /// Availability wins over durability: the caller's operation proceeds
    /// against the in-process map instead of failing.
    fn demote_backend(&self, operation: &str, err: &BackendError) {
        if self.backend_live.swap(false, Ordering::Relaxed) {
            warn!(%operation, error = %err, "durable backend failed, falling back to in-process cache");
        }
    }

    fn ttl_from(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Duration> {
        expires_at.map(|expires| (expires - now).to_std().unwrap_or(Duration::from_secs(1)))
    }

    // == Set ==
    /// Stores a value under `(kind, scope, key)` with an optional absolute
    /// expiry.
    ///
    /// Returns `Ok(false)` without storing anything when the expiry already
    /// lies in the past; a dead entry must never be written.
    pub async fn set(
        &self,
        kind: CacheKind,
        scope: TenantScope,
        key: &str,
        value: CacheValue,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        Self::validate_key(key)?;
        let now = Utc::now();
        if let Some(expires) = expires_at {
            if expires <= now {
                warn!(%kind, %scope, key, %expires, "refusing to store already-expired entry");
                return Ok(false);
            }
        }

        let full = self.full_key(kind, scope, key);
        if let Some(backend) = self.backend() {
            let bytes = serde_json::to_vec(&value)
                .map_err(|err| RelayError::Internal(format!("cache serialization failed: {err}")))?;
            match backend.put(&full, bytes, Self::ttl_from(expires_at, now)).await {
                Ok(()) => return Ok(true),
                Err(err) => self.demote_backend("set", &err),
            }
        }

        self.fallback
            .write()
            .await
            .insert(full, FallbackEntry { value, expires_at });
        Ok(true)
    }

    // == Get ==
    /// Retrieves a value. Entries past their absolute expiry behave as absent
    /// and are purged on this very call.
    pub async fn get(
        &self,
        kind: CacheKind,
        scope: TenantScope,
        key: &str,
    ) -> Result<Option<CacheValue>> {
        Self::validate_key(key)?;
        let full = self.full_key(kind, scope, key);

        if let Some(backend) = self.backend() {
            match backend.fetch(&full).await {
                Ok(Some(bytes)) => match serde_json::from_slice::<CacheValue>(&bytes) {
                    Ok(value) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(Some(value));
                    }
                    Err(err) => {
                        warn!(key = %full, error = %err, "undecodable cache entry, treating as absent");
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        return Ok(None);
                    }
                },
                Ok(None) => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
                Err(err) => self.demote_backend("get", &err),
            }
        }

        let mut map = self.fallback.write().await;
        match map.get(&full) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Some(entry) if entry.is_expired_at(Utc::now()) => {
                map.remove(&full);
                self.expired_purges.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %full, "purged expired entry on read");
                Ok(None)
            }
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.value.clone()))
            }
        }
    }

    // == Exists ==
    /// Checks presence with the same lazy-expiry semantics as [`get`].
    ///
    /// [`get`]: CacheStore::get
    pub async fn exists(&self, kind: CacheKind, scope: TenantScope, key: &str) -> Result<bool> {
        Self::validate_key(key)?;
        let full = self.full_key(kind, scope, key);

        if let Some(backend) = self.backend() {
            match backend.contains(&full).await {
                Ok(present) => return Ok(present),
                Err(err) => self.demote_backend("exists", &err),
            }
        }

        let mut map = self.fallback.write().await;
        match map.get(&full) {
            None => Ok(false),
            Some(entry) if entry.is_expired_at(Utc::now()) => {
                map.remove(&full);
                self.expired_purges.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
            Some(_) => Ok(true),
        }
    }

    // == Delete ==
    /// Removes an entry; returns whether anything was removed.
    pub async fn delete(&self, kind: CacheKind, scope: TenantScope, key: &str) -> Result<bool> {
        Self::validate_key(key)?;
        let full = self.full_key(kind, scope, key);

        let mut removed = false;
        if let Some(backend) = self.backend() {
            match backend.remove(&full).await {
                Ok(existed) => removed = existed,
                Err(err) => self.demote_backend("delete", &err),
            }
        }
        removed |= self.fallback.write().await.remove(&full).is_some();
        Ok(removed)
    }

    // == List Keys ==
    /// Lists the bare keys of a kind, optionally restricted to one scope.
    /// Expired fallback entries encountered on the way are purged eagerly.
    pub async fn list_keys(
        &self,
        kind: CacheKind,
        scope: Option<TenantScope>,
    ) -> Result<Vec<String>> {
        let namespace = match scope {
            Some(scope) => format!("{}:{}:{}:", self.prefix, kind, scope),
            None => format!("{}:{}:", self.prefix, kind),
        };

        if let Some(backend) = self.backend() {
            match backend.scan_keys(&format!("{namespace}*")).await {
                Ok(keys) => {
                    return Ok(keys
                        .iter()
                        .filter_map(|k| k.rsplit(':').next())
                        .map(|k| k.to_string())
                        .collect());
                }
                Err(err) => self.demote_backend("list_keys", &err),
            }
        }

        let now = Utc::now();
        let mut map = self.fallback.write().await;
        let dead: Vec<String> = map
            .iter()
            .filter(|(key, entry)| key.starts_with(&namespace) && entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &dead {
            map.remove(key);
            self.expired_purges.fetch_add(1, Ordering::Relaxed);
        }

        Ok(map
            .keys()
            .filter(|key| key.starts_with(&namespace))
            .filter_map(|key| key.rsplit(':').next())
            .map(|key| key.to_string())
            .collect())
    }

    // == Extend Expiry ==
    /// Unconditionally overwrites the expiry of an existing entry. Whether the
    /// new expiry is actually later than the old one is the caller's business
    /// (the mapping service applies its max-expiry rule before calling in).
    ///
    /// Returns false when the key does not currently exist, or when the new
    /// expiry already lies in the past (the entry is removed in that case).
    pub async fn extend_expiry(
        &self,
        kind: CacheKind,
        scope: TenantScope,
        key: &str,
        new_expiry: DateTime<Utc>,
    ) -> Result<bool> {
        Self::validate_key(key)?;
        let full = self.full_key(kind, scope, key);
        let now = Utc::now();

        if let Some(backend) = self.backend() {
            let outcome = async {
                if !backend.contains(&full).await? {
                    return Ok(false);
                }
                if new_expiry <= now {
                    backend.remove(&full).await?;
                    return Ok(false);
                }
                backend
                    .set_ttl(&full, (new_expiry - now).to_std().unwrap_or(Duration::from_secs(1)))
                    .await
            }
            .await;
            match outcome {
                Ok(updated) => return Ok(updated),
                Err(err) => self.demote_backend("extend_expiry", &err),
            }
        }

        let mut map = self.fallback.write().await;
        match map.get_mut(&full) {
            Some(entry) => {
                entry.expires_at = Some(new_expiry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // == Stats ==
    /// Returns a snapshot of the store counters.
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired_purges: self.expired_purges.load(Ordering::Relaxed),
            fallback_entries: self.fallback.read().await.len(),
            backend_active: self.backend().is_some(),
        }
    }
}
