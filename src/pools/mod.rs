//! Pool Module
//!
//! Transient per-transfer buffers on both sides of the cache: the upload pool
//! accumulates chunks until a transfer is complete, the download pool holds
//! per-session read-ahead windows. Both are disposable and swept on
//! inactivity.

mod download;
mod upload;

pub use download::{BatchFetch, DownloadPool, PoolFetch};
pub use upload::{MergeOutcome, UploadPool};
