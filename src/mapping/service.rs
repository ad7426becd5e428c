//! Mapping Service
//!
//! Three-tier resolution of lookup keys to identifier keys:
//!
//! 1. an in-process map (fast, re-validated against the record store),
//! 2. the durable `mapping` cache kind (survives restarts),
//! 3. a rebuild from the durable record store.
//!
//! The whole structure is a write-through cache over a derivation from the
//! record store. The one invariant that must hold everywhere: once no valid
//! record references an artifact, its lookup keys stay unresolvable forever.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::{CacheKind, CacheStore, CacheValue, TenantScope};
use crate::error::Result;
use crate::records::{is_valid_lookup_code, RecordStore};

// == Mapping Service ==
/// Lookup-key to identifier-key resolution with reuse semantics.
pub struct MappingService {
    cache: Arc<CacheStore>,
    records: Arc<dyn RecordStore>,
    /// In-process tier: lookup key -> identifier key
    active: RwLock<HashMap<String, String>>,
    /// Negative cache: lookup keys known to be dead, each with its own expiry
    /// so a later re-registration of the same code is not shadowed forever
    dead: RwLock<HashMap<String, DateTime<Utc>>>,
    negative_ttl: Duration,
}

impl MappingService {
    // == Constructor ==
    pub fn new(
        cache: Arc<CacheStore>,
        records: Arc<dyn RecordStore>,
        negative_ttl_secs: i64,
    ) -> Self {
        Self {
            cache,
            records,
            active: RwLock::new(HashMap::new()),
            dead: RwLock::new(HashMap::new()),
            negative_ttl: Duration::seconds(negative_ttl_secs),
        }
    }

    // == Save ==
    /// Persists a mapping to both tiers. Called at registration time
    /// (self-mapping: the lookup key serves as its own identifier) and at
    /// reuse time (mapping a re-issued code to the established identifier).
    pub async fn save(
        &self,
        lookup_key: &str,
        identifier_key: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.cache
            .set(
                CacheKind::Mapping,
                TenantScope::Anonymous,
                lookup_key,
                CacheValue::Text(identifier_key.to_string()),
                expires_at,
            )
            .await?;
        self.active
            .write()
            .await
            .insert(lookup_key.to_string(), identifier_key.to_string());
        self.dead.write().await.remove(lookup_key);
        debug!(lookup_key, identifier_key, "saved mapping");
        Ok(())
    }

    // == Resolve ==
    /// Resolves a lookup key to its identifier key, or `None` when the key is
    /// unknown or its artifact has no valid record left.
    pub async fn resolve(&self, lookup_key: &str) -> Result<Option<String>> {
        if !is_valid_lookup_code(lookup_key) {
            debug!(lookup_key, "refusing to resolve malformed lookup key");
            return Ok(None);
        }
        let now = Utc::now();

        // 1. In-process tier, re-validated against the owning record. An
        //    expired record evicts the entry and falls through as a miss; a
        //    *missing* record keeps it, because an identifier key legitimately
        //    outlives its own record while sibling codes keep the artifact
        //    alive.
        let cached = self.active.read().await.get(lookup_key).cloned();
        if let Some(identifier) = cached {
            match self.records.find_by_lookup_key(lookup_key).await {
                Ok(Some(record)) if record.is_expired_at(now) => {
                    self.active.write().await.remove(lookup_key);
                    debug!(lookup_key, "evicted mapping for expired record");
                }
                Ok(_) => return Ok(Some(identifier)),
                Err(err) => {
                    warn!(lookup_key, error = %err, "record store unreachable, trusting in-process mapping");
                    return Ok(Some(identifier));
                }
            }
        }

        // Negative cache: skip rebuild attempts for keys recently proven dead.
        {
            let mut dead = self.dead.write().await;
            if let Some(until) = dead.get(lookup_key) {
                if *until > now {
                    debug!(lookup_key, "lookup key is known dead, skipping rebuild");
                    return Ok(None);
                }
                dead.remove(lookup_key);
            }
        }

        // 2. Durable tier; backfill the in-process map on a hit.
        if let Some(value) = self
            .cache
            .get(CacheKind::Mapping, TenantScope::Anonymous, lookup_key)
            .await?
        {
            if let Some(identifier) = value.as_text() {
                let identifier = identifier.to_string();
                self.active
                    .write()
                    .await
                    .insert(lookup_key.to_string(), identifier.clone());
                debug!(lookup_key, identifier_key = %identifier, "loaded mapping from durable tier");
                return Ok(Some(identifier));
            }
        }

        // 3. Rebuild from the record store: the earliest still-valid sibling
        //    record becomes the identifier. If none is valid the artifact is
        //    dead, and it stays dead; no self-mapping fallback here.
        let record = match self.records.find_by_lookup_key(lookup_key).await {
            Ok(record) => record,
            Err(err) => {
                warn!(lookup_key, error = %err, "record store unreachable during rebuild");
                None
            }
        };
        if let Some(record) = record {
            let siblings = self
                .records
                .find_by_artifact(record.artifact_id)
                .await
                .unwrap_or_default();
            let candidate = siblings.iter().find(|sibling| sibling.is_active_at(now));
            match candidate {
                Some(candidate) => {
                    let identifier = candidate.code.clone();
                    self.save(lookup_key, &identifier, Some(record.expires_at))
                        .await?;
                    info!(lookup_key, identifier_key = %identifier, "rebuilt mapping from record store");
                    return Ok(Some(identifier));
                }
                None => {
                    self.mark_dead(lookup_key, now).await;
                    warn!(
                        lookup_key,
                        artifact_id = record.artifact_id,
                        "every record for the artifact has expired, identifier not rebuilt"
                    );
                    return Ok(None);
                }
            }
        }

        debug!(lookup_key, "no mapping found");
        Ok(None)
    }

    async fn mark_dead(&self, lookup_key: &str, now: DateTime<Utc>) {
        self.dead
            .write()
            .await
            .insert(lookup_key.to_string(), now + self.negative_ttl);
    }

    // == Peek ==
    /// Memory-then-durable lookup that never rebuilds. The sweep uses this to
    /// find the identifiers of dead artifacts without resurrecting anything.
    pub async fn peek(&self, lookup_key: &str) -> Option<String> {
        if let Some(identifier) = self.active.read().await.get(lookup_key) {
            return Some(identifier.clone());
        }
        self.cache
            .get(CacheKind::Mapping, TenantScope::Anonymous, lookup_key)
            .await
            .ok()
            .flatten()
            .and_then(|value| value.as_text().map(|s| s.to_string()))
    }

    // == Forget ==
    /// Drops a mapping from both tiers.
    pub async fn forget(&self, lookup_key: &str) -> Result<bool> {
        let in_memory = self.active.write().await.remove(lookup_key).is_some();
        let durable = self
            .cache
            .delete(CacheKind::Mapping, TenantScope::Anonymous, lookup_key)
            .await?;
        Ok(in_memory || durable)
    }

    /// Drops only the in-process entry (sweep reconciliation; the durable
    /// entry expires on its own TTL).
    pub async fn drop_active(&self, lookup_key: &str) -> bool {
        self.active.write().await.remove(lookup_key).is_some()
    }

    /// Snapshot of the in-process tier, for the sweep's reconciliation pass.
    pub async fn snapshot(&self) -> Vec<(String, String)> {
        self.active
            .read()
            .await
            .iter()
            .map(|(lookup, identifier)| (lookup.clone(), identifier.clone()))
            .collect()
    }

    /// Clears the negative cache. Mainly useful in tests that re-register a
    /// code which was previously proven dead.
    pub async fn clear_negative_cache(&self) {
        self.dead.write().await.clear();
    }

    /// Number of in-process mappings currently held.
    pub async fn active_len(&self) -> usize {
        self.active.read().await.len()
    }

    // == Related Lookup Keys ==
    /// All lookup keys currently mapping to an identifier: the in-process
    /// reverse scan plus every sibling record of the identifier's artifact.
    pub async fn related_lookup_keys(&self, identifier_key: &str) -> Result<Vec<String>> {
        let mut related: Vec<String> = self
            .active
            .read()
            .await
            .iter()
            .filter(|(_, identifier)| identifier.as_str() == identifier_key)
            .map(|(lookup, _)| lookup.clone())
            .collect();

        if let Ok(Some(record)) = self.records.find_by_lookup_key(identifier_key).await {
            let siblings = self
                .records
                .find_by_artifact(record.artifact_id)
                .await
                .unwrap_or_default();
            for sibling in siblings {
                if !related.contains(&sibling.code) {
                    related.push(sibling.code);
                }
            }
        }

        Ok(related)
    }

    // == Extend Shared Expiry ==
    /// Applies the max-expiry rule to the shared cache entries of an
    /// identifier: the later of `candidate` and the maximum expiry across all
    /// records still validly referencing the identifier wins, and is written
    /// through to the chunk map and the metadata entry. Wrapped secrets are
    /// left alone; they stay bound to their own issuing record.
    ///
    /// Returns the expiry that was applied.
    pub async fn extend_shared_expiry(
        &self,
        identifier_key: &str,
        scope: TenantScope,
        candidate: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        let mut effective = candidate;
        for lookup in self.related_lookup_keys(identifier_key).await? {
            if let Ok(Some(record)) = self.records.find_by_lookup_key(&lookup).await {
                if record.is_active_at(now) && record.expires_at > effective {
                    effective = record.expires_at;
                }
            }
        }

        if let Some(value) = self
            .cache
            .get(CacheKind::ChunkMap, scope, identifier_key)
            .await?
        {
            if let Some(mut chunks) = value.into_chunks() {
                for chunk in chunks.values_mut() {
                    chunk.expires_at = effective;
                }
                self.cache
                    .set(
                        CacheKind::ChunkMap,
                        scope,
                        identifier_key,
                        CacheValue::Chunks(chunks),
                        Some(effective),
                    )
                    .await?;
            }
        }

        if let Some(value) = self
            .cache
            .get(CacheKind::Metadata, scope, identifier_key)
            .await?
        {
            if let Some(mut metadata) = value.into_metadata() {
                metadata.expires_at = effective;
                metadata.identifier_key = identifier_key.to_string();
                self.cache
                    .set(
                        CacheKind::Metadata,
                        scope,
                        identifier_key,
                        CacheValue::Metadata(metadata),
                        Some(effective),
                    )
                    .await?;
            }
        }

        info!(identifier_key, %scope, expires_at = %effective, "extended shared cache expiry");
        Ok(effective)
    }
}
