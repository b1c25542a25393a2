//! # labelaudio stores
//!
//! Result store and audit log implementations.
//!
//! This crate provides:
//! - InMemory ResultStore
//! - File-backed ResultStore (`{root}/{run_id}/{hash}.json`)
//! - InMemory and JSON-lines audit logs

mod audit_log;
mod file_store;
mod memory_store;

pub use audit_log::{InMemoryAuditLog, JsonlAuditLog};
pub use file_store::FileResultStore;
pub use memory_store::InMemoryResultStore;

// Re-export core traits for convenience
pub use labelaudio_core::executor::{AuditEvent, AuditSink};
pub use labelaudio_core::store::{ResultRef, ResultStore, StoreError};
