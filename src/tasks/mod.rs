//! Background Tasks Module
//!
//! Contains background tasks that run periodically during server operation.
//!
//! # Tasks
//! - Cleanup sweep: reconciles records, caches, pools and mappings at
//!   configured intervals

mod cleanup;

pub use cleanup::{run_sweep, spawn_cleanup_task, SweepStats};
