//! Durable Backend
//!
//! Abstraction over the durable cache tier with native TTL support. The only
//! shipped implementation is Redis; the trait keeps the store testable and
//! lets the in-process fallback take over transparently when the backend is
//! unreachable.

use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use thiserror::Error;

// == Backend Error ==
/// Error raised by the durable tier. Any occurrence demotes the store to its
/// in-process fallback for the remainder of the process lifetime.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

// == Durable Backend Trait ==
/// Key/value operations the durable tier must support.
///
/// Keys are fully namespaced by the caller; values are opaque serialized
/// envelopes. TTLs are relative durations because that is what the backend
/// natively speaks; the store converts from absolute expiries.
#[async_trait]
pub trait DurableBackend: Send + Sync {
    /// Stores a value, optionally with a TTL.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> BackendResult<()>;

    /// Fetches a value, `None` when absent or already expired server-side.
    async fn fetch(&self, key: &str) -> BackendResult<Option<Vec<u8>>>;

    /// Removes a key; returns whether it existed.
    async fn remove(&self, key: &str) -> BackendResult<bool>;

    /// Checks key presence without fetching the value.
    async fn contains(&self, key: &str) -> BackendResult<bool>;

    /// Lists all keys matching a glob pattern.
    async fn scan_keys(&self, pattern: &str) -> BackendResult<Vec<String>>;

    /// Overwrites the TTL of an existing key; returns false when absent.
    async fn set_ttl(&self, key: &str, ttl: Duration) -> BackendResult<bool>;
}

// == Redis Backend ==
/// Redis-backed durable tier using a multiplexed connection manager.
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    /// Connects to Redis and verifies the connection with a PING.
    pub async fn connect(url: &str) -> BackendResult<Self> {
        let client = Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl DurableBackend for RedisBackend {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> BackendResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                // Round up so sub-second TTLs do not become an immediate expiry
                let secs = ttl.as_secs().max(1);
                conn.set_ex::<_, _, ()>(key, value, secs).await?;
            }
            None => {
                conn.set::<_, _, ()>(key, value).await?;
            }
        }
        Ok(())
    }

    async fn fetch(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value)
    }

    async fn remove(&self, key: &str) -> BackendResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn contains(&self, key: &str) -> BackendResult<bool> {
        let mut conn = self.conn.clone();
        let present: bool = conn.exists(key).await?;
        Ok(present)
    }

    async fn scan_keys(&self, pattern: &str) -> BackendResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn set_ttl(&self, key: &str, ttl: Duration) -> BackendResult<bool> {
        let mut conn = self.conn.clone();
        let updated: bool = conn.expire(key, ttl.as_secs().max(1) as i64).await?;
        Ok(updated)
    }
}
