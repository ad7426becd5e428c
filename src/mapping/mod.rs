//! Identifier Mapping Module
//!
//! Resolves the lookup key a caller presents to the identifier key that
//! actually owns the cached artifact, so re-issued codes can share one cached
//! copy without ever resurrecting a dead one.

mod service;

pub use service::MappingService;
