//! flashdrop - an in-memory relay for end-to-end encrypted file handoff
//!
//! A sender registers a file artifact under a short pickup code, streams it
//! in encrypted chunks to the relay, and receivers fetch the chunks before
//! the code expires. Re-issued codes share one cached artifact; a periodic
//! sweep keeps caches, pools and mappings consistent with the durable
//! pickup-code records.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod mapping;
pub mod models;
pub mod pools;
pub mod records;
pub mod tasks;

pub use api::AppState;
pub use config::Config;
pub use tasks::spawn_cleanup_task;
