//! Resource cache that orchestrates the memory, disk and network tiers.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::CacheError;
use super::freshness::{now, CacheOptions, Freshness};
use super::source::RemoteSource;
use super::storage::{DurableStore, StoredRecord, SyncErrorRecord};
use super::sync::SyncOptions;
use super::traits::{CacheResult, Cacheable};

type PendingLoad<T> = Shared<BoxFuture<'static, Result<CacheResult<T>, CacheError>>>;

/// Resource cache for one remote collection.
///
/// Reads resolve Memory → Durable Store → Remote. Cloning is cheap and every
/// clone shares the same tiers, in-flight map and sync flag.
pub struct ResourceCache<S: RemoteSource> {
  pub(super) inner: Arc<CacheInner<S>>,
}

pub(super) struct CacheInner<S: RemoteSource> {
  pub(super) source: S,
  pub(super) store: Arc<dyn DurableStore>,
  pub(super) options: CacheOptions,
  pub(super) memory: Mutex<HashMap<String, MemoryEntry<S::Record>>>,
  inflight: Mutex<HashMap<String, PendingLoad<S::Record>>>,
  pub(super) syncing: AtomicBool,
  pub(super) stats: CacheStats,
}

#[derive(Debug, Clone)]
pub(super) struct MemoryEntry<T> {
  pub(super) record: T,
  pub(super) cached_at: DateTime<Utc>,
  pub(super) last_accessed: DateTime<Utc>,
}

impl<T> MemoryEntry<T> {
  pub(super) fn new(record: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      record,
      cached_at,
      last_accessed: cached_at,
    }
  }
}

#[derive(Debug, Default)]
pub(super) struct CacheStats {
  memory_hits: AtomicU64,
  disk_hits: AtomicU64,
  remote_fetches: AtomicU64,
  stale_served: AtomicU64,
}

/// Counters describing how reads were served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
  pub memory_hits: u64,
  pub disk_hits: u64,
  pub remote_fetches: u64,
  pub stale_served: u64,
}

impl CacheStats {
  fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  fn snapshot(&self) -> CacheStatsSnapshot {
    CacheStatsSnapshot {
      memory_hits: self.memory_hits.load(Ordering::Relaxed),
      disk_hits: self.disk_hits.load(Ordering::Relaxed),
      remote_fetches: self.remote_fetches.load(Ordering::Relaxed),
      stale_served: self.stale_served.load(Ordering::Relaxed),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheCounts {
  pub memory_entries: usize,
  pub durable_records: u64,
  pub total_records: u64,
  pub sync_count: u64,
}

/// Read-only snapshot of a collection's cache state.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
  pub collection: &'static str,
  /// Last sync (or, before any sync, the oldest durable record) is fresh
  pub fresh: bool,
  /// Data exists but is past the freshness window
  pub stale: bool,
  /// Data exists and is past the stale window
  pub expired: bool,
  pub last_sync: Option<DateTime<Utc>>,
  pub last_full_sync: Option<DateTime<Utc>>,
  pub last_delta_sync: Option<DateTime<Utc>>,
  pub high_watermark: u64,
  pub counts: CacheCounts,
  pub stats: CacheStatsSnapshot,
  pub last_error: Option<SyncErrorRecord>,
  pub sync_in_progress: bool,
}

impl<S: RemoteSource> ResourceCache<S> {
  /// Create a new cache over `source`, persisting into `store`.
  pub fn new(source: S, store: Arc<dyn DurableStore>, options: CacheOptions) -> Self {
    Self {
      inner: Arc::new(CacheInner {
        source,
        store,
        options,
        memory: Mutex::new(HashMap::new()),
        inflight: Mutex::new(HashMap::new()),
        syncing: AtomicBool::new(false),
        stats: CacheStats::default(),
      }),
    }
  }

  pub fn options(&self) -> &CacheOptions {
    &self.inner.options
  }

  pub fn source(&self) -> &S {
    &self.inner.source
  }

  /// Durable store namespace of this collection.
  pub fn collection(&self) -> &'static str {
    S::Record::entity_type()
  }

  /// Fetch a single record.
  ///
  /// 1. Memory hit that is not expired - return immediately
  /// 2. Durable hit that is fresh or stale-but-usable - promote to memory
  /// 3. Otherwise fetch from the remote; on failure serve whatever the durable
  ///    store had, however old
  ///
  /// Concurrent calls for the same key share one load.
  pub async fn get(&self, key: &str) -> Result<CacheResult<S::Record>, CacheError> {
    if let Some(hit) = self.inner.memory_lookup(key) {
      if hit.freshness == Freshness::Stale {
        self.refresh_in_background();
      }
      return Ok(hit);
    }

    let pending = self.inner.pending_load(key);
    let result = pending.await;

    if matches!(&result, Ok(hit) if hit.freshness == Freshness::Stale) {
      self.refresh_in_background();
    }
    result
  }

  /// Fetch several records, fanning out at most `batch_size` loads at a time.
  ///
  /// Keys that fail are logged and left out of the result.
  pub async fn get_many<I, K>(&self, keys: I) -> HashMap<String, S::Record>
  where
    I: IntoIterator<Item = K>,
    K: AsRef<str>,
  {
    let mut results = HashMap::new();
    let mut missing = Vec::new();
    let mut saw_stale = false;

    for key in keys {
      let key = key.as_ref();
      match self.inner.memory_lookup(key) {
        Some(hit) => {
          saw_stale |= hit.freshness == Freshness::Stale;
          results.insert(key.to_string(), hit.data);
        }
        None => missing.push(key.to_string()),
      }
    }

    if saw_stale {
      self.refresh_in_background();
    }

    let fetched: Vec<(String, Result<CacheResult<S::Record>, CacheError>)> = stream::iter(missing)
      .map(|key| async move {
        let result = self.get(&key).await;
        (key, result)
      })
      .buffer_unordered(self.inner.options.batch_size.max(1))
      .collect()
      .await;

    for (key, result) in fetched {
      match result {
        Ok(hit) => {
          results.insert(key, hit.data);
        }
        Err(err) => warn!(collection = self.collection(), key = %key, error = %err, "batch read failed, excluding key"),
      }
    }

    results
  }

  /// Every mirrored record of the collection.
  ///
  /// Served from the durable store while the last sync is fresh or
  /// stale-but-usable. Otherwise a sync is attempted first, and if that fails
  /// the durable snapshot is served anyway.
  pub async fn all(&self) -> Result<CacheResult<Vec<S::Record>>, CacheError> {
    let metadata = self.inner.store.read_metadata(self.collection())?;
    let freshness = metadata
      .last_sync_at()
      .map(|at| (at, Freshness::classify(at, now(), &self.inner.options)));

    match freshness {
      Some((at, Freshness::Fresh)) => Ok(CacheResult::from_disk(
        self.inner.records()?,
        at,
        Freshness::Fresh,
      )),
      Some((at, Freshness::Stale)) => {
        self.refresh_in_background();
        Ok(CacheResult::from_disk(
          self.inner.records()?,
          at,
          Freshness::Stale,
        ))
      }
      _ => match self.sync(SyncOptions::default()).await {
        Ok(report) => {
          debug!(collection = self.collection(), sync_type = %report.sync_type, "synced before serving collection");
          Ok(CacheResult::from_network(
            self.inner.records()?,
            report.finished_at,
          ))
        }
        Err(err) => {
          let records = self.inner.records()?;
          if records.is_empty() {
            return Err(err);
          }
          warn!(collection = self.collection(), error = %err, "sync failed, serving durable snapshot");
          self.inner.stats.stale_served.fetch_add(1, Ordering::Relaxed);
          let cached_at = self
            .inner
            .store
            .oldest_cached_at(self.collection())?
            .unwrap_or_else(now);
          let freshness = Freshness::classify(cached_at, now(), &self.inner.options);
          Ok(CacheResult::offline(records, cached_at, freshness))
        }
      },
    }
  }

  /// Mirrored records as they are, never touching the remote.
  pub fn snapshot(&self) -> Result<Vec<S::Record>, CacheError> {
    self.inner.records()
  }

  /// Drop `key` from memory now and from the durable store in the background.
  ///
  /// Durable removal failures are logged and otherwise ignored; the returned
  /// handle is only useful to callers that want to wait for the removal.
  pub fn invalidate(&self, key: &str) -> Option<JoinHandle<()>> {
    self.inner.memory().remove(key);

    let store = Arc::clone(&self.inner.store);
    let collection = self.collection();
    let key = key.to_string();
    let remove = move || {
      if let Err(err) = store.delete(collection, &key) {
        warn!(collection, key = %key, error = %err, "failed to remove durable entry");
      }
    };

    match Handle::try_current() {
      Ok(handle) => Some(handle.spawn_blocking(remove)),
      Err(_) => {
        remove();
        None
      }
    }
  }

  /// Wipe memory, durable records and sync metadata for this collection.
  pub fn clear(&self) -> Result<(), CacheError> {
    self.inner.memory().clear();
    self.inner.store.clear(self.collection())?;
    Ok(())
  }

  /// Read-only introspection; never touches the remote.
  pub fn status(&self) -> Result<CacheStatus, CacheError> {
    let collection = self.collection();
    let metadata = self.inner.store.read_metadata(collection)?;
    let durable_records = self.inner.store.count(collection)?;

    let reference = match metadata.last_sync_at() {
      Some(at) => Some(at),
      None => self.inner.store.oldest_cached_at(collection)?,
    };
    let freshness = reference.map(|at| Freshness::classify(at, now(), &self.inner.options));

    Ok(CacheStatus {
      collection,
      fresh: freshness == Some(Freshness::Fresh),
      stale: matches!(freshness, Some(Freshness::Stale | Freshness::Expired)),
      expired: freshness == Some(Freshness::Expired),
      last_sync: metadata.last_sync_at(),
      last_full_sync: metadata.last_full_sync_at,
      last_delta_sync: metadata.last_delta_sync_at,
      high_watermark: metadata.high_watermark,
      counts: CacheCounts {
        memory_entries: self.inner.memory().len(),
        durable_records,
        total_records: metadata.total_records,
        sync_count: metadata.sync_count,
      },
      stats: self.inner.stats.snapshot(),
      last_error: metadata.last_error,
      sync_in_progress: self.inner.syncing.load(Ordering::Acquire),
    })
  }

  /// Evict memory entries past the stale window that were not read since.
  pub fn evict_expired(&self) -> usize {
    self.inner.evict_expired()
  }

  /// Periodically run `evict_expired` until the cache is dropped.
  pub fn spawn_sweeper(&self, interval: std::time::Duration) -> JoinHandle<()> {
    let weak: Weak<CacheInner<S>> = Arc::downgrade(&self.inner);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval.max(std::time::Duration::from_millis(1)));
      // First tick completes immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        let evicted = inner.evict_expired();
        if evicted > 0 {
          debug!(collection = S::Record::entity_type(), evicted, "swept expired memory entries");
        }
      }
    })
  }

  /// Kick off a sync without waiting for it, if one is not already running.
  fn refresh_in_background(&self) {
    if !self.inner.options.background_refresh || self.inner.syncing.load(Ordering::Acquire) {
      return;
    }
    let Ok(handle) = Handle::try_current() else {
      return;
    };

    let cache = self.clone();
    handle.spawn(async move {
      if let Err(err) = cache.sync(SyncOptions::default()).await {
        warn!(collection = cache.collection(), error = %err, "background resync failed");
      }
    });
  }
}

impl<S: RemoteSource> CacheInner<S> {
  fn namespace(&self) -> &'static str {
    S::Record::entity_type()
  }

  pub(super) fn memory(&self) -> MutexGuard<'_, HashMap<String, MemoryEntry<S::Record>>> {
    self.memory.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn inflight(&self) -> MutexGuard<'_, HashMap<String, PendingLoad<S::Record>>> {
    self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Serve from memory unless the entry is missing or expired.
  fn memory_lookup(&self, key: &str) -> Option<CacheResult<S::Record>> {
    let now = now();
    let mut memory = self.memory();
    let entry = memory.get_mut(key)?;

    // Reads of expired entries still count as access for the sweeper
    entry.last_accessed = now;
    let freshness = Freshness::classify(entry.cached_at, now, &self.options);
    if !freshness.is_servable() {
      return None;
    }

    CacheStats::bump(&self.stats.memory_hits);
    Some(CacheResult::from_memory(
      entry.record.clone(),
      entry.cached_at,
      freshness,
    ))
  }

  /// Join the in-flight load for `key`, or start one.
  fn pending_load(self: &Arc<Self>, key: &str) -> PendingLoad<S::Record> {
    let mut inflight = self.inflight();
    if let Some(pending) = inflight.get(key) {
      return pending.clone();
    }

    let inner = Arc::clone(self);
    let owned_key = key.to_string();
    let pending = async move {
      let result = inner.load(&owned_key).await;
      inner.inflight().remove(&owned_key);
      result
    }
    .boxed()
    .shared();

    inflight.insert(key.to_string(), pending.clone());
    pending
  }

  async fn load(&self, key: &str) -> Result<CacheResult<S::Record>, CacheError> {
    let durable = match self.read_durable(key) {
      Ok(durable) => durable,
      Err(err) => {
        warn!(collection = self.namespace(), key, error = %err, "durable read failed, treating as absent");
        None
      }
    };

    if let Some((record, cached_at)) = &durable {
      let freshness = Freshness::classify(*cached_at, now(), &self.options);
      if freshness.is_servable() {
        self.promote(key, record.clone(), *cached_at);
        CacheStats::bump(&self.stats.disk_hits);
        return Ok(CacheResult::from_disk(record.clone(), *cached_at, freshness));
      }
    }

    CacheStats::bump(&self.stats.remote_fetches);
    match self.source.get(key).await {
      Ok(record) => {
        let cached_at = now();
        if let Err(err) = self.write_durable(&record, cached_at) {
          warn!(collection = self.namespace(), key, error = %err, "failed to persist fetched record");
        }
        self.promote(key, record.clone(), cached_at);
        Ok(CacheResult::from_network(record, cached_at))
      }
      Err(err) => match durable {
        Some((record, cached_at)) => {
          warn!(collection = self.namespace(), key, error = %err, "remote fetch failed, serving expired entry");
          CacheStats::bump(&self.stats.stale_served);
          Ok(CacheResult::offline(record, cached_at, Freshness::Expired))
        }
        None if err.is_not_found() => Err(CacheError::CacheMiss {
          key: key.to_string(),
        }),
        None => Err(CacheError::RemoteUnavailable {
          key: key.to_string(),
          reason: err.to_string(),
        }),
      },
    }
  }

  fn promote(&self, key: &str, record: S::Record, cached_at: DateTime<Utc>) {
    self
      .memory()
      .insert(key.to_string(), MemoryEntry::new(record, cached_at));
  }

  fn read_durable(&self, key: &str) -> Result<Option<(S::Record, DateTime<Utc>)>, CacheError> {
    let Some(stored) = self.store.read(self.namespace(), key)? else {
      return Ok(None);
    };

    match serde_json::from_value(stored.payload) {
      Ok(record) => Ok(Some((record, stored.cached_at))),
      Err(err) => {
        warn!(collection = self.namespace(), key, error = %err, "undecodable durable entry, ignoring");
        Ok(None)
      }
    }
  }

  fn write_durable(&self, record: &S::Record, cached_at: DateTime<Utc>) -> Result<(), CacheError> {
    let stored = encode(record, cached_at)?;
    self.store.write(self.namespace(), &stored)?;
    Ok(())
  }

  /// Durable records, or the memory tier when nothing is persisted.
  pub(super) fn records(&self) -> Result<Vec<S::Record>, CacheError> {
    let records: Vec<S::Record> = self
      .store
      .read_all(self.namespace())?
      .into_iter()
      .filter_map(|stored| match serde_json::from_value(stored.payload) {
        Ok(record) => Some(record),
        Err(err) => {
          warn!(collection = self.namespace(), key = %stored.key, error = %err, "undecodable durable entry, skipping");
          None
        }
      })
      .collect();
    if !records.is_empty() {
      return Ok(records);
    }
    Ok(self.memory().values().map(|entry| entry.record.clone()).collect())
  }

  fn evict_expired(&self) -> usize {
    let now = now();
    let stale_window = self.options.stale_window;
    let mut memory = self.memory();
    let before = memory.len();

    memory.retain(|_, entry| {
      let expired = now - entry.cached_at >= stale_window;
      let read_since_expiry = entry.last_accessed >= entry.cached_at + stale_window;
      !expired || read_since_expiry
    });

    before - memory.len()
  }
}

pub(super) fn encode<T: Cacheable>(record: &T, cached_at: DateTime<Utc>) -> Result<StoredRecord, CacheError> {
  let payload = serde_json::to_value(record)
    .map_err(|e| CacheError::Store(format!("failed to serialize {}: {}", record.cache_key(), e)))?;
  Ok(StoredRecord {
    key: record.cache_key(),
    payload,
    cached_at,
  })
}

impl<S: RemoteSource> Clone for ResourceCache<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::mock::{sample_issue, MockSource};
  use crate::cache::storage::{NoopStore, SqliteStore};
  use crate::cache::traits::CacheSource;
  use chrono::Duration;

  fn options() -> CacheOptions {
    CacheOptions::default().with_background_refresh(false)
  }

  fn setup(source: MockSource) -> (Arc<MockSource>, Arc<SqliteStore>, ResourceCache<Arc<MockSource>>) {
    let source = Arc::new(source);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cache = ResourceCache::new(source.clone(), store.clone() as Arc<dyn DurableStore>, options());
    (source, store, cache)
  }

  fn seed(store: &SqliteStore, number: u64, age: Duration) {
    let stored = encode(&sample_issue(number), now() - age).unwrap();
    store.write("issue", &stored).unwrap();
  }

  #[tokio::test]
  async fn test_get_after_forced_sync_is_fresh_from_memory() {
    let (source, _store, cache) = setup(MockSource::with_issues(1..=3));
    let started = now();
    cache.sync(SyncOptions::forced()).await.unwrap();

    let hit = cache.get("2").await.unwrap();
    assert!(hit.cached_at >= started);
    assert_eq!(hit.data.number, 2);
    assert_eq!(hit.source, CacheSource::Memory);
    assert_eq!(hit.freshness, Freshness::Fresh);
    assert_eq!(source.get_calls(), 0);
  }

  #[tokio::test]
  async fn test_concurrent_gets_share_one_fetch() {
    let source = MockSource::with_issues([7]).with_delay(std::time::Duration::from_millis(50));
    let (source, _store, cache) = setup(source);

    let reads = (0..10).map(|_| cache.get("7"));
    let results = futures::future::join_all(reads).await;

    assert!(results.iter().all(|r| matches!(r, Ok(hit) if hit.data.number == 7)));
    assert_eq!(source.get_calls(), 1);
    assert!(cache.inner.inflight().is_empty());
  }

  #[tokio::test]
  async fn test_stale_durable_entry_is_promoted() {
    let (source, store, cache) = setup(MockSource::with_issues([1]));
    seed(&store, 1, Duration::hours(2));

    let hit = cache.get("1").await.unwrap();
    assert_eq!(hit.source, CacheSource::Disk);
    assert_eq!(hit.freshness, Freshness::Stale);
    assert_eq!(source.get_calls(), 0);

    let again = cache.get("1").await.unwrap();
    assert_eq!(again.source, CacheSource::Memory);
  }

  #[tokio::test]
  async fn test_remote_down_serves_expired_durable_entry() {
    let (source, store, cache) = setup(MockSource::with_issues([1]));
    seed(&store, 1, Duration::hours(48));
    source.set_failing(true);

    let hit = cache.get("1").await.unwrap();
    assert_eq!(hit.source, CacheSource::Offline);
    assert_eq!(hit.freshness, Freshness::Expired);
    assert_eq!(cache.status().unwrap().stats.stale_served, 1);
    // Expired entries are not promoted
    assert_eq!(cache.inner.memory().len(), 0);
  }

  #[tokio::test]
  async fn test_remote_down_with_nothing_cached() {
    let (source, _store, cache) = setup(MockSource::with_issues([1]));
    source.set_failing(true);

    let err = cache.get("1").await.unwrap_err();
    assert!(matches!(err, CacheError::RemoteUnavailable { ref key, .. } if key == "1"));
  }

  #[tokio::test]
  async fn test_missing_remote_record_is_cache_miss() {
    let (_source, _store, cache) = setup(MockSource::with_issues([1]));
    let err = cache.get("404").await.unwrap_err();
    assert_eq!(err, CacheError::CacheMiss { key: "404".to_string() });
  }

  #[tokio::test]
  async fn test_network_fetch_persists_to_durable_store() {
    let (source, store, cache) = setup(MockSource::with_issues([5]));
    let hit = cache.get("5").await.unwrap();
    assert_eq!(hit.source, CacheSource::Network);
    assert_eq!(source.get_calls(), 1);
    assert!(store.read("issue", "5").unwrap().is_some());
  }

  #[tokio::test]
  async fn test_seeded_expired_store_reports_stale() {
    let (_source, store, cache) = setup(MockSource::default());
    seed(&store, 1, Duration::hours(48));

    let status = cache.status().unwrap();
    assert!(status.stale);
    assert!(status.expired);
    assert!(!status.fresh);
    assert_eq!(status.counts.durable_records, 1);
    assert!(status.last_sync.is_none());
  }

  #[tokio::test]
  async fn test_expired_seed_with_remote_down_serves_stale_records() {
    let (source, store, cache) = setup(MockSource::default());
    let age = options().stale_window * 2;
    for number in 1..=3 {
      seed(&store, number, age);
    }
    source.set_failing(true);

    for number in 1..=3 {
      let hit = cache.get(&number.to_string()).await.unwrap();
      assert_eq!(hit.data.number, number);
      assert_eq!(hit.source, CacheSource::Offline);
      assert_eq!(hit.freshness, Freshness::Expired);
    }

    let status = cache.status().unwrap();
    assert!(status.stale);
    assert_eq!(status.counts.durable_records, 3);
    assert_eq!(status.stats.stale_served, 3);
  }

  #[tokio::test]
  async fn test_status_after_sync() {
    let (_source, _store, cache) = setup(MockSource::with_issues(1..=4));
    cache.sync(SyncOptions::forced()).await.unwrap();

    let status = cache.status().unwrap();
    assert!(status.fresh);
    assert!(!status.stale);
    assert_eq!(status.high_watermark, 4);
    assert_eq!(status.counts.total_records, 4);
    assert_eq!(status.counts.memory_entries, 4);
    assert_eq!(status.counts.sync_count, 1);
    assert!(!status.sync_in_progress);
  }

  #[tokio::test]
  async fn test_get_many_excludes_failed_keys() {
    let (_source, _store, cache) = setup(MockSource::with_issues(1..=3));
    let found = cache.get_many(["1", "3", "99"]).await;

    assert_eq!(found.len(), 2);
    assert!(found.contains_key("1"));
    assert!(found.contains_key("3"));
    assert!(!found.contains_key("99"));
  }

  #[tokio::test]
  async fn test_invalidate_removes_both_tiers() {
    let (_source, store, cache) = setup(MockSource::with_issues(1..=2));
    cache.sync(SyncOptions::forced()).await.unwrap();

    let removal = cache.invalidate("1").expect("runtime is available");
    removal.await.unwrap();

    assert!(!cache.inner.memory().contains_key("1"));
    assert!(store.read("issue", "1").unwrap().is_none());
    assert!(store.read("issue", "2").unwrap().is_some());
  }

  #[tokio::test]
  async fn test_evict_expired_keeps_recent_and_recently_read() {
    let (source, store, cache) = setup(MockSource::default());
    let old = now() - Duration::hours(48);
    {
      let mut memory = cache.inner.memory();
      memory.insert("1".to_string(), MemoryEntry::new(sample_issue(1), old));
      memory.insert("2".to_string(), MemoryEntry::new(sample_issue(2), now()));
      memory.insert("3".to_string(), MemoryEntry::new(sample_issue(3), old));
    }

    // Reading 3 after it expired marks it as accessed
    seed(&store, 3, Duration::hours(48));
    source.set_failing(true);
    let hit = cache.get("3").await.unwrap();
    assert_eq!(hit.source, CacheSource::Offline);

    assert_eq!(cache.evict_expired(), 1);
    let memory = cache.inner.memory();
    assert!(!memory.contains_key("1"));
    assert!(memory.contains_key("2"));
    assert!(memory.contains_key("3"));
  }

  #[tokio::test]
  async fn test_all_serves_durable_store_while_fresh() {
    let (source, _store, cache) = setup(MockSource::with_issues(1..=3));
    cache.sync(SyncOptions::forced()).await.unwrap();

    let all = cache.all().await.unwrap();
    assert_eq!(all.data.len(), 3);
    assert_eq!(all.source, CacheSource::Disk);
    assert_eq!(source.list_calls(), 1);
  }

  #[tokio::test]
  async fn test_all_syncs_when_never_synced() {
    let (source, _store, cache) = setup(MockSource::with_issues(1..=2));
    let all = cache.all().await.unwrap();
    assert_eq!(all.data.len(), 2);
    assert_eq!(all.source, CacheSource::Network);
    assert_eq!(source.list_calls(), 1);
  }

  #[tokio::test]
  async fn test_all_falls_back_to_snapshot_when_remote_down() {
    let (source, store, cache) = setup(MockSource::with_issues(1..=2));
    seed(&store, 1, Duration::hours(48));
    source.set_failing(true);

    let all = cache.all().await.unwrap();
    assert_eq!(all.data.len(), 1);
    assert_eq!(all.source, CacheSource::Offline);
    assert_eq!(all.freshness, Freshness::Expired);
  }

  #[tokio::test]
  async fn test_memory_only_cache_serves_synced_records() {
    let source = Arc::new(MockSource::with_issues(1..=3));
    let cache = ResourceCache::new(source.clone(), Arc::new(NoopStore) as Arc<dyn DurableStore>, options());

    let all = cache.all().await.unwrap();
    assert_eq!(all.data.len(), 3);
    assert_eq!(cache.snapshot().unwrap().len(), 3);

    let hit = cache.get("1").await.unwrap();
    assert_eq!(hit.source, CacheSource::Memory);
    assert_eq!(source.get_calls(), 0);
  }

  #[tokio::test]
  async fn test_clear_empties_every_tier() {
    let (_source, store, cache) = setup(MockSource::with_issues(1..=2));
    cache.sync(SyncOptions::forced()).await.unwrap();

    cache.clear().unwrap();
    assert_eq!(cache.inner.memory().len(), 0);
    assert_eq!(store.count("issue").unwrap(), 0);
    assert!(store.read_metadata("issue").unwrap().last_sync_at().is_none());
  }
}
