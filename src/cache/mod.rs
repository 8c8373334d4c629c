//! Three-tier resource cache for remote collections.
//!
//! Reads resolve Memory → Durable Store → Remote:
//! - Records carry a key, a watermark and an optional updated_at
//! - Full and delta syncs keep the durable store in step with the remote
//! - Concurrent reads of one key share a single remote fetch
//! - Offline mode serves whatever the durable store had when the remote is down

mod error;
mod freshness;
mod layer;
mod source;
mod storage;
mod sync;
mod traits;

#[cfg(test)]
pub(crate) mod mock;

pub use error::CacheError;
pub use freshness::{now, CacheOptions, Freshness};
pub use layer::{CacheCounts, CacheStatsSnapshot, CacheStatus, ResourceCache};
pub use source::{ListFilter, RemoteError, RemoteSource};
pub use storage::{
  DurableStore, MetadataPatch, NoopStore, SqliteStore, StoreError, StoredRecord, SyncErrorRecord, SyncMetadata,
};
pub use sync::{SyncOptions, SyncReport, SyncType};
pub use traits::{CacheResult, CacheSource, Cacheable};
