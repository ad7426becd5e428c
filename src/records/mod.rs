//! Durable Record Module
//!
//! The relay's view of the durable pickup-code record store. The store itself
//! is an external collaborator; this module holds the trait it must satisfy,
//! the record shape, and an in-process implementation used at runtime and in
//! tests.

mod store;

pub use store::{
    is_valid_lookup_code, MemoryRecordStore, RecordError, RecordResult, RecordStatus, RecordStore,
    TransferRecord, CODE_LENGTH, UNLIMITED_USES,
};
