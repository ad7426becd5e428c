//! Cleanup Sweep
//!
//! The periodic reconciliation pass. Each run re-derives everything from the
//! durable record store: records past their expiry are transitioned and
//! deleted, artifacts with no surviving record have their caches, buffers,
//! windows, secrets and mappings cascaded away, and both pools are swept for
//! idle entries. Cache-layer deletions are best-effort and idempotent; a
//! partially failed sweep is simply retried in full on the next tick.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::cache::{CacheKind, TenantScope};
use crate::records::{RecordStatus, TransferRecord};

// == Sweep Stats ==
/// What one sweep removed. Logged after every run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub records_expired: usize,
    pub records_deleted: usize,
    pub chunk_entries: usize,
    pub metadata_entries: usize,
    pub secret_entries: usize,
    pub mappings: usize,
    pub upload_buffers: usize,
    pub download_windows: usize,
    pub stale_upload_buffers: usize,
    pub idle_download_windows: usize,
}

impl SweepStats {
    fn is_noop(&self) -> bool {
        *self == SweepStats::default()
    }
}

// == Sweep ==
/// Runs one full reconciliation pass.
pub async fn run_sweep(state: &AppState) -> SweepStats {
    let mut stats = SweepStats::default();
    let now = Utc::now();

    let records = match state.records.all_records().await {
        Ok(records) => records,
        Err(err) => {
            warn!(error = %err, "record store unreachable, running pool eviction only");
            evict_idle_pools(state, &mut stats).await;
            return stats;
        }
    };

    // Step 1: evaluate and persist the expiry status of every record.
    let mut refreshed = Vec::with_capacity(records.len());
    for mut record in records {
        if record.status != RecordStatus::Expired && now > record.expires_at {
            match state.records.mark_expired(&record.code).await {
                Ok(()) => {
                    record.status = RecordStatus::Expired;
                    stats.records_expired += 1;
                }
                Err(err) => {
                    warn!(code = %record.code, error = %err, "failed to persist expiry transition");
                    continue;
                }
            }
        }
        refreshed.push(record);
    }

    // Step 2: partition. An artifact is doomed only when *every* record
    // referencing it is expired; one valid code keeps the whole cache alive.
    let record_by_code: HashMap<String, TransferRecord> = refreshed
        .iter()
        .map(|record| (record.code.clone(), record.clone()))
        .collect();
    let probe_scopes: BTreeSet<TenantScope> = refreshed
        .iter()
        .map(|record| record.owner)
        .chain(std::iter::once(TenantScope::Anonymous))
        .collect();
    let surviving_artifacts: HashSet<u64> = refreshed
        .iter()
        .filter(|record| record.status != RecordStatus::Expired)
        .map(|record| record.artifact_id)
        .collect();
    let expired: Vec<&TransferRecord> = refreshed
        .iter()
        .filter(|record| record.status == RecordStatus::Expired)
        .collect();

    let mut doomed: HashMap<u64, Vec<&TransferRecord>> = HashMap::new();
    for record in &expired {
        if !surviving_artifacts.contains(&record.artifact_id) {
            doomed.entry(record.artifact_id).or_default().push(*record);
        }
    }

    // Step 3: cascade-delete each dead artifact. Failures are logged and
    // skipped so one poisoned identifier cannot halt the sweep for the rest.
    for (artifact_id, artifact_records) in &doomed {
        let mut identifiers: BTreeSet<String> = BTreeSet::new();
        for record in artifact_records {
            // peek, never resolve: a rebuild here would resurrect the dead
            if let Some(identifier) = state.mapping.peek(&record.code).await {
                identifiers.insert(identifier);
            }
        }
        if let Some(first) = artifact_records.iter().min_by_key(|record| record.created_at) {
            identifiers.insert(first.code.clone());
        }
        let scopes: BTreeSet<TenantScope> = artifact_records
            .iter()
            .map(|record| record.owner)
            .chain(std::iter::once(TenantScope::Anonymous))
            .collect();

        for identifier in &identifiers {
            for scope in &scopes {
                match state.cache.delete(CacheKind::ChunkMap, *scope, identifier).await {
                    Ok(true) => stats.chunk_entries += 1,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(identifier_key = %identifier, error = %err, "chunk cache delete failed")
                    }
                }
                match state.cache.delete(CacheKind::Metadata, *scope, identifier).await {
                    Ok(true) => stats.metadata_entries += 1,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(identifier_key = %identifier, error = %err, "metadata cache delete failed")
                    }
                }
            }
            if state.uploads.remove(identifier).await {
                stats.upload_buffers += 1;
            }
            stats.download_windows += state.downloads.remove_identifier(identifier).await;
        }

        // Secrets and mappings are keyed by lookup code, one per record.
        for record in artifact_records {
            for scope in &scopes {
                match state.cache.delete(CacheKind::Secret, *scope, &record.code).await {
                    Ok(true) => stats.secret_entries += 1,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(code = %record.code, error = %err, "secret cache delete failed")
                    }
                }
            }
            match state.mapping.forget(&record.code).await {
                Ok(true) => stats.mappings += 1,
                Ok(false) => {}
                Err(err) => warn!(code = %record.code, error = %err, "mapping removal failed"),
            }
        }
        info!(artifact_id = *artifact_id, "cascaded deletion for dead artifact");
    }

    reconcile_mappings(state, &record_by_code, &surviving_artifacts, &probe_scopes, &mut stats)
        .await;

    // Step 4: expired records leave the durable store only after the cache
    // cascade, so a failed cascade is retried against intact records.
    for record in &expired {
        match state.records.delete_record(&record.code).await {
            Ok(true) => stats.records_deleted += 1,
            Ok(false) => {}
            Err(err) => warn!(code = %record.code, error = %err, "record deletion failed"),
        }
    }

    // Step 5: idle pool eviction, independent of record status.
    evict_idle_pools(state, &mut stats).await;

    if stats.is_noop() {
        debug!("sweep finished, nothing to clean");
    } else {
        info!(?stats, "sweep finished");
    }
    stats
}

/// Whether any shared cache entry for the identifier is still live.
async fn cache_alive(
    state: &AppState,
    identifier: &str,
    scopes: &BTreeSet<TenantScope>,
) -> bool {
    for scope in scopes {
        let chunks = state
            .cache
            .exists(CacheKind::ChunkMap, *scope, identifier)
            .await
            .unwrap_or(false);
        let metadata = state
            .cache
            .exists(CacheKind::Metadata, *scope, identifier)
            .await
            .unwrap_or(false);
        if chunks || metadata {
            return true;
        }
    }
    false
}

/// Reconciles both mapping tiers against the record store, bounding the
/// in-process map without destroying identifiers that legitimately outlive
/// their own record.
async fn reconcile_mappings(
    state: &AppState,
    record_by_code: &HashMap<String, TransferRecord>,
    surviving_artifacts: &HashSet<u64>,
    probe_scopes: &BTreeSet<TenantScope>,
    stats: &mut SweepStats,
) {
    // In-process tier: an entry survives while its own record is alive, or,
    // for a self-mapping, while the artifact it names is still alive.
    for (lookup, identifier) in state.mapping.snapshot().await {
        let record_alive = record_by_code
            .get(&lookup)
            .map(|record| record.status != RecordStatus::Expired)
            .unwrap_or(false);
        if record_alive {
            continue;
        }
        if lookup == identifier {
            let artifact_alive = match record_by_code.get(&lookup) {
                Some(record) => surviving_artifacts.contains(&record.artifact_id),
                None => cache_alive(state, &identifier, probe_scopes).await,
            };
            if artifact_alive {
                continue;
            }
        }
        if state.mapping.drop_active(&lookup).await {
            stats.mappings += 1;
            debug!(lookup_key = %lookup, "dropped stale in-process mapping");
        }
    }

    // Durable tier scan, the second line of defence for entries whose TTL was
    // never applied. Live self-mappings are the only survivors without a
    // record.
    match state.cache.list_keys(CacheKind::Mapping, None).await {
        Ok(keys) => {
            for lookup in keys {
                let record_alive = record_by_code
                    .get(&lookup)
                    .map(|record| record.status != RecordStatus::Expired)
                    .unwrap_or(false);
                if record_alive {
                    continue;
                }
                let identifier = state
                    .cache
                    .get(CacheKind::Mapping, TenantScope::Anonymous, &lookup)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|value| value.as_text().map(String::from));
                if let Some(identifier) = &identifier {
                    if *identifier == lookup && cache_alive(state, identifier, probe_scopes).await {
                        continue;
                    }
                }
                if let Ok(true) = state
                    .cache
                    .delete(CacheKind::Mapping, TenantScope::Anonymous, &lookup)
                    .await
                {
                    stats.mappings += 1;
                    debug!(lookup_key = %lookup, "dropped stale durable mapping");
                }
            }
        }
        Err(err) => warn!(error = %err, "durable mapping scan failed"),
    }
}

async fn evict_idle_pools(state: &AppState, stats: &mut SweepStats) {
    stats.stale_upload_buffers = state
        .uploads
        .cleanup_stale(Duration::seconds(state.config.upload_idle_secs))
        .await;
    stats.idle_download_windows = state
        .downloads
        .cleanup_idle(Duration::seconds(state.config.download_idle_secs))
        .await;
}

// == Background Task ==
/// Spawns the background task that runs the sweep at a fixed interval.
///
/// # Arguments
/// * `state` - Shared application state (the sweep mutates all of it)
/// * `cleanup_interval_secs` - Interval in seconds between sweeps
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during graceful shutdown.
pub fn spawn_cleanup_task(state: AppState, cleanup_interval_secs: u64) -> JoinHandle<()> {
    let interval = StdDuration::from_secs(cleanup_interval_secs);

    tokio::spawn(async move {
        info!(
            "starting cleanup sweep with interval of {} seconds",
            cleanup_interval_secs
        );

        loop {
            tokio::time::sleep(interval).await;
            run_sweep(&state).await;
        }
    })
}
