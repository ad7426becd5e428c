//! Record Store
//!
//! Trait and in-process implementation for durable pickup-code records. Every
//! cache decision in the relay is ultimately justified against these records:
//! a cache entry may only outlive a code while at least one record referencing
//! the same artifact is still valid.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::cache::TenantScope;

/// Usage limit value meaning "unlimited downloads".
pub const UNLIMITED_USES: u32 = 999;

/// Length of a lookup code (the typed pickup code's server-visible half).
pub const CODE_LENGTH: usize = 6;

/// Checks the shape of a lookup code: exactly six uppercase alphanumerics.
pub fn is_valid_lookup_code(code: &str) -> bool {
    code.len() == CODE_LENGTH
        && code.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

// == Record Status ==
/// Lifecycle state of a pickup-code record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Waiting,
    Transferring,
    Completed,
    Expired,
}

impl RecordStatus {
    /// Whether a code in this state may still participate in transfers.
    pub fn is_active(&self) -> bool {
        matches!(self, RecordStatus::Waiting | RecordStatus::Transferring)
    }

    /// Wire token for the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Waiting => "waiting",
            RecordStatus::Transferring => "transferring",
            RecordStatus::Completed => "completed",
            RecordStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// == Transfer Record ==
/// One durable pickup-code record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    /// The lookup key the receiver types (6 uppercase alphanumerics)
    pub code: String,
    /// The artifact this code grants access to
    pub artifact_id: u64,
    /// Tenant scope the artifact's cache entries live under
    pub owner: TenantScope,
    pub status: RecordStatus,
    pub used_count: u32,
    /// Maximum completed downloads (999 = unlimited)
    pub limit_count: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TransferRecord {
    /// Expired either by explicit status or by its absolute expiry.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == RecordStatus::Expired || now > self.expires_at
    }

    /// Active status and not yet past its absolute expiry.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_active() && self.expires_at > now
    }

    /// Whether the usage limit has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.limit_count != UNLIMITED_USES && self.used_count >= self.limit_count
    }
}

// == Record Error ==
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

pub type RecordResult<T> = std::result::Result<T, RecordError>;

// == Record Store Trait ==
/// Operations the relay consumes from the durable record store. Mutations are
/// expected to be transactional on the implementor's side; the cache layer
/// treats them as the source of truth.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Finds the record a lookup key addresses.
    async fn find_by_lookup_key(&self, code: &str) -> RecordResult<Option<TransferRecord>>;

    /// All records referencing one artifact, oldest first.
    async fn find_by_artifact(&self, artifact_id: u64) -> RecordResult<Vec<TransferRecord>>;

    /// Every record, for the cleanup sweep's reconciliation pass.
    async fn all_records(&self) -> RecordResult<Vec<TransferRecord>>;

    /// Inserts a freshly issued record.
    async fn insert(&self, record: TransferRecord) -> RecordResult<()>;

    /// Transitions a record to the expired state.
    async fn mark_expired(&self, code: &str) -> RecordResult<()>;

    /// Overwrites a record's status.
    async fn set_status(&self, code: &str, status: RecordStatus) -> RecordResult<()>;

    /// Bumps the usage counter, flipping the record to completed when the
    /// limit is reached. Returns the updated record.
    async fn increment_usage(&self, code: &str) -> RecordResult<Option<TransferRecord>>;

    /// Deletes a record outright; returns whether it existed.
    async fn delete_record(&self, code: &str) -> RecordResult<bool>;
}

// == In-Process Record Store ==
/// HashMap-backed record store. Stands in for the external durable store at
/// runtime and in tests; mutations take the write lock for their full
/// read-modify-write, so they are atomic within the process.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, TransferRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find_by_lookup_key(&self, code: &str) -> RecordResult<Option<TransferRecord>> {
        Ok(self.records.read().await.get(code).cloned())
    }

    async fn find_by_artifact(&self, artifact_id: u64) -> RecordResult<Vec<TransferRecord>> {
        let mut matches: Vec<TransferRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|record| record.artifact_id == artifact_id)
            .cloned()
            .collect();
        matches.sort_by_key(|record| record.created_at);
        Ok(matches)
    }

    async fn all_records(&self) -> RecordResult<Vec<TransferRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn insert(&self, record: TransferRecord) -> RecordResult<()> {
        self.records.write().await.insert(record.code.clone(), record);
        Ok(())
    }

    async fn mark_expired(&self, code: &str) -> RecordResult<()> {
        if let Some(record) = self.records.write().await.get_mut(code) {
            record.status = RecordStatus::Expired;
        }
        Ok(())
    }

    async fn set_status(&self, code: &str, status: RecordStatus) -> RecordResult<()> {
        if let Some(record) = self.records.write().await.get_mut(code) {
            record.status = status;
        }
        Ok(())
    }

    async fn increment_usage(&self, code: &str) -> RecordResult<Option<TransferRecord>> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(code) else {
            return Ok(None);
        };
        record.used_count += 1;
        if record.limit_count != UNLIMITED_USES && record.used_count >= record.limit_count {
            record.status = RecordStatus::Completed;
        }
        Ok(Some(record.clone()))
    }

    async fn delete_record(&self, code: &str) -> RecordResult<bool> {
        Ok(self.records.write().await.remove(code).is_some())
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(code: &str, artifact_id: u64, expires_in: Duration) -> TransferRecord {
        TransferRecord {
            code: code.to_string(),
            artifact_id,
            owner: TenantScope::Anonymous,
            status: RecordStatus::Waiting,
            used_count: 0,
            limit_count: 3,
            created_at: Utc::now(),
            expires_at: Utc::now() + expires_in,
        }
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let store = MemoryRecordStore::new();
        store.insert(record("AAA111", 1, Duration::hours(1))).await.unwrap();

        let found = store.find_by_lookup_key("AAA111").await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().artifact_id, 1);
        assert!(store.find_by_lookup_key("ZZZ999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_artifact_is_oldest_first() {
        let store = MemoryRecordStore::new();
        let mut older = record("OLD111", 7, Duration::hours(1));
        older.created_at = Utc::now() - Duration::minutes(10);
        store.insert(record("NEW222", 7, Duration::hours(1))).await.unwrap();
        store.insert(older).await.unwrap();
        store.insert(record("OTHER1", 8, Duration::hours(1))).await.unwrap();

        let siblings = store.find_by_artifact(7).await.unwrap();
        assert_eq!(siblings.len(), 2);
        assert_eq!(siblings[0].code, "OLD111");
        assert_eq!(siblings[1].code, "NEW222");
    }

    #[tokio::test]
    async fn test_increment_usage_flips_to_completed_at_limit() {
        let store = MemoryRecordStore::new();
        let mut rec = record("USE111", 1, Duration::hours(1));
        rec.limit_count = 2;
        store.insert(rec).await.unwrap();

        let first = store.increment_usage("USE111").await.unwrap().unwrap();
        assert_eq!(first.used_count, 1);
        assert_eq!(first.status, RecordStatus::Waiting);

        let second = store.increment_usage("USE111").await.unwrap().unwrap();
        assert_eq!(second.used_count, 2);
        assert_eq!(second.status, RecordStatus::Completed);
    }

    #[tokio::test]
    async fn test_unlimited_codes_never_complete() {
        let store = MemoryRecordStore::new();
        let mut rec = record("UNL111", 1, Duration::hours(1));
        rec.limit_count = UNLIMITED_USES;
        store.insert(rec).await.unwrap();

        for _ in 0..5 {
            let updated = store.increment_usage("UNL111").await.unwrap().unwrap();
            assert_eq!(updated.status, RecordStatus::Waiting);
            assert!(!updated.is_exhausted());
        }
    }

    #[test]
    fn test_lookup_code_shape() {
        assert!(is_valid_lookup_code("ABC123"));
        assert!(is_valid_lookup_code("ZZZZZZ"));
        assert!(!is_valid_lookup_code("abc123"));
        assert!(!is_valid_lookup_code("ABC12"));
        assert!(!is_valid_lookup_code("ABC1234"));
        assert!(!is_valid_lookup_code("ABC#12"));
    }

    #[test]
    fn test_expiry_predicates() {
        let now = Utc::now();
        let mut rec = record("EXP111", 1, Duration::seconds(-5));
        assert!(rec.is_expired_at(now));
        assert!(!rec.is_active_at(now));

        rec.expires_at = now + Duration::hours(1);
        assert!(!rec.is_expired_at(now));
        assert!(rec.is_active_at(now));

        rec.status = RecordStatus::Expired;
        assert!(rec.is_expired_at(now));
    }

    #[tokio::test]
    async fn test_mark_expired_and_delete() {
        let store = MemoryRecordStore::new();
        store.insert(record("DEL111", 1, Duration::hours(1))).await.unwrap();

        store.mark_expired("DEL111").await.unwrap();
        let rec = store.find_by_lookup_key("DEL111").await.unwrap().unwrap();
        assert_eq!(rec.status, RecordStatus::Expired);

        assert!(store.delete_record("DEL111").await.unwrap());
        assert!(!store.delete_record("DEL111").await.unwrap());
    }
}
