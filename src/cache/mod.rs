//! Local-first cache with queued remote synchronization.
//!
//! This module provides:
//! - Namespaced entries per table and optional user
//! - Per-entry metadata (content hash, expiry, version, sync status)
//! - A durable sync queue with bounded retries
//! - Remote fallback on stale or missing entries, last writer wins

mod handle;
mod keys;
mod manager;
mod metadata;
mod queue;
mod traits;

pub use handle::{SyncHandle, SyncOutcome};
pub use keys::{data_key, in_namespace, TableName, UnknownTable, SYNC_QUEUE_KEY};
pub use manager::{CacheConfig, CacheManager, ConfigPatch, ProcessResult, QueueStatus, StorageUsage};
pub use metadata::{data_hash, CacheMetadata, SyncStatus};
pub use queue::{SyncOperation, SyncPayload, SyncQueueItem};
pub use traits::ListRecord;
