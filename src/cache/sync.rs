//! Full and delta synchronization of a collection into the durable store.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use super::error::CacheError;
use super::freshness::now;
use super::layer::{encode, MemoryEntry, ResourceCache};
use super::source::{ListFilter, RemoteError, RemoteSource};
use super::storage::{MetadataPatch, SyncErrorRecord, SyncMetadata};
use super::traits::Cacheable;

/// What a sync call actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncType {
  Full,
  Delta,
  /// Last sync was still fresh, nothing was fetched
  Skip,
  /// Another sync held the flag
  SkippedInProgress,
}

impl fmt::Display for SyncType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      SyncType::Full => "full",
      SyncType::Delta => "delta",
      SyncType::Skip => "skip",
      SyncType::SkippedInProgress => "skipped-in-progress",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
  /// Run a full sync regardless of freshness
  pub force: bool,
}

impl SyncOptions {
  pub fn forced() -> Self {
    Self { force: true }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
  pub sync_type: SyncType,
  /// Records returned by the list or delta query
  pub fetched: usize,
  /// Records recovered through the watermark gap-fill
  pub gap_filled: usize,
  pub total_records: u64,
  pub high_watermark: u64,
  /// A failed delta was retried as a full sync
  pub fell_back_to_full: bool,
  pub started_at: DateTime<Utc>,
  pub finished_at: DateTime<Utc>,
}

impl SyncReport {
  fn skipped(sync_type: SyncType, metadata: &SyncMetadata, started_at: DateTime<Utc>) -> Self {
    Self {
      sync_type,
      fetched: 0,
      gap_filled: 0,
      total_records: metadata.total_records,
      high_watermark: metadata.high_watermark,
      fell_back_to_full: false,
      started_at,
      finished_at: now(),
    }
  }
}

/// Holds the in-progress flag; released on drop so a panicking or cancelled
/// sync never wedges the collection.
struct SyncGuard<'a> {
  flag: &'a AtomicBool,
}

impl<'a> SyncGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| Self { flag })
  }
}

impl Drop for SyncGuard<'_> {
  fn drop(&mut self) {
    self.flag.store(false, Ordering::Release);
  }
}

enum Plan {
  Full,
  Delta(DateTime<Utc>),
  Skip,
}

impl<S: RemoteSource> ResourceCache<S> {
  /// Bring the durable store up to date with the remote.
  ///
  /// Chooses between full, delta and skip from the sync metadata. A failed
  /// delta falls back to one full sync. Concurrent calls return
  /// `SkippedInProgress` instead of starting a second sync.
  pub async fn sync(&self, opts: SyncOptions) -> Result<SyncReport, CacheError> {
    let started_at = now();
    let collection = self.collection();

    let Some(_guard) = SyncGuard::acquire(&self.inner.syncing) else {
      debug!(collection, "sync already running, skipping");
      let metadata = self.inner.store.read_metadata(collection)?;
      return Ok(SyncReport::skipped(SyncType::SkippedInProgress, &metadata, started_at));
    };

    let metadata = self.inner.store.read_metadata(collection)?;

    match self.plan(opts, &metadata, started_at) {
      Plan::Skip => {
        debug!(collection, "last sync still fresh, skipping");
        Ok(SyncReport::skipped(SyncType::Skip, &metadata, started_at))
      }
      Plan::Full => match self.full_sync(&metadata, started_at).await {
        Ok(report) => Ok(report),
        Err(err) => {
          self.record_error(&err, SyncType::Full);
          Err(CacheError::RemoteUnavailable {
            key: collection.to_string(),
            reason: err.to_string(),
          })
        }
      },
      Plan::Delta(since) => match self.delta_sync(&metadata, since, started_at).await {
        Ok(report) => Ok(report),
        Err(delta_err) => {
          warn!(collection, error = %delta_err, "delta sync failed, falling back to full sync");
          self.record_error(&delta_err, SyncType::Delta);
          match self.full_sync(&metadata, started_at).await {
            Ok(mut report) => {
              report.fell_back_to_full = true;
              Ok(report)
            }
            Err(full_err) => {
              self.record_error(&full_err, SyncType::Full);
              Err(CacheError::SyncConflict {
                delta: delta_err.to_string(),
                full: full_err.to_string(),
              })
            }
          }
        }
      },
    }
  }

  fn plan(&self, opts: SyncOptions, metadata: &SyncMetadata, now: DateTime<Utc>) -> Plan {
    let options = &self.inner.options;
    if opts.force || options.force_full_sync {
      return Plan::Full;
    }

    let Some(last_sync) = metadata.last_sync_at() else {
      return Plan::Full;
    };

    if now - last_sync < options.freshness_window {
      return Plan::Skip;
    }

    if let Some(max_age) = options.full_resync_after {
      let full_overdue = metadata
        .last_full_sync_at
        .map_or(true, |at| now - at >= max_age);
      if full_overdue {
        return Plan::Full;
      }
    }

    Plan::Delta(last_sync)
  }

  async fn full_sync(&self, previous: &SyncMetadata, started_at: DateTime<Utc>) -> Result<SyncReport, SyncFailure> {
    let collection = self.collection();
    let records = self.inner.source.list(&ListFilter::all()).await?;
    let cached_at = now();

    let stored = records
      .iter()
      .map(|record| encode(record, cached_at))
      .collect::<Result<Vec<_>, _>>()?;
    self.inner.store.replace_all(collection, &stored)?;

    let high_watermark = records.iter().map(Cacheable::watermark).max().unwrap_or(0);
    let fetched = records.len();

    {
      let mut memory = self.inner.memory();
      memory.clear();
      for record in records {
        memory.insert(record.cache_key(), MemoryEntry::new(record, cached_at));
      }
    }

    let total_records = self.inner.store.count(collection)?;
    let metadata = self.inner.store.write_metadata(
      collection,
      &MetadataPatch {
        last_full_sync_at: Some(cached_at),
        high_watermark: Some(high_watermark),
        total_records: Some(total_records),
        sync_count: Some(previous.sync_count + 1),
        last_error: Some(None),
        ..MetadataPatch::default()
      },
    )?;

    info!(collection, fetched, high_watermark, "full sync complete");
    Ok(SyncReport {
      sync_type: SyncType::Full,
      fetched,
      gap_filled: 0,
      total_records: metadata.total_records,
      high_watermark: metadata.high_watermark,
      fell_back_to_full: false,
      started_at,
      finished_at: now(),
    })
  }

  async fn delta_sync(
    &self,
    previous: &SyncMetadata,
    since: DateTime<Utc>,
    started_at: DateTime<Utc>,
  ) -> Result<SyncReport, SyncFailure> {
    let collection = self.collection();
    let changed = self.inner.source.list_since(since).await?;
    let fetched = changed.len();

    let mut merged: HashMap<String, S::Record> = changed
      .into_iter()
      .map(|record| (record.cache_key(), record))
      .collect();

    // Time-based deltas miss records created right at the boundary, so
    // anything numbered above the watermark is fetched explicitly.
    let mut gap_filled = 0;
    let mut gap_ceiling = None;
    let mut gap_failure: Option<(u64, RemoteError)> = None;
    if let Some(remote_max) = self.inner.source.max_id().await? {
      gap_ceiling = Some(remote_max);
      let gap: Vec<u64> = (previous.high_watermark + 1..=remote_max)
        .filter(|id| !merged.contains_key(&id.to_string()))
        .collect();

      if !gap.is_empty() {
        debug!(collection, from = previous.high_watermark + 1, to = remote_max, missing = gap.len(), "filling watermark gap");
        let results: Vec<(u64, Result<S::Record, RemoteError>)> = stream::iter(gap)
          .map(|id| async move { (id, self.inner.source.get(&id.to_string()).await) })
          .buffer_unordered(self.inner.options.batch_size.max(1))
          .collect()
          .await;

        for (id, result) in results {
          match result {
            Ok(record) => {
              gap_filled += 1;
              merged.insert(record.cache_key(), record);
            }
            Err(err) if err.is_not_found() => debug!(collection, id, "gap id does not exist"),
            Err(err) => {
              warn!(collection, id, error = %err, "failed to fetch gap record, retrying next delta");
              if gap_failure.as_ref().map_or(true, |(lowest, _)| id < *lowest) {
                gap_failure = Some((id, err));
              }
            }
          }
        }
      }
    }

    let cached_at = now();
    let stored = merged
      .values()
      .map(|record| encode(record, cached_at))
      .collect::<Result<Vec<_>, _>>()?;
    self.inner.store.write_many(collection, &stored)?;

    // Ids that do not resolve (pull requests share the numbering) still count
    // as seen, but the watermark stops below the first id that failed.
    let mut high_watermark = merged
      .values()
      .map(Cacheable::watermark)
      .max()
      .unwrap_or(0)
      .max(gap_ceiling.unwrap_or(0))
      .max(previous.high_watermark);
    if let Some((lowest, _)) = &gap_failure {
      high_watermark = high_watermark.min(lowest - 1).max(previous.high_watermark);
    }
    let last_error = gap_failure.map(|(id, err)| SyncErrorRecord {
      message: format!("gap record {} not fetched: {}", id, err),
      at: now(),
      sync_type: SyncType::Delta,
    });

    {
      let mut memory = self.inner.memory();
      for (key, record) in merged {
        memory.insert(key, MemoryEntry::new(record, cached_at));
      }
    }

    let total_records = self.inner.store.count(collection)?;
    let metadata = self.inner.store.write_metadata(
      collection,
      &MetadataPatch {
        last_delta_sync_at: Some(cached_at),
        high_watermark: Some(high_watermark),
        total_records: Some(total_records),
        sync_count: Some(previous.sync_count + 1),
        last_error: Some(last_error),
        ..MetadataPatch::default()
      },
    )?;

    info!(collection, fetched, gap_filled, high_watermark, "delta sync complete");
    Ok(SyncReport {
      sync_type: SyncType::Delta,
      fetched,
      gap_filled,
      total_records: metadata.total_records,
      high_watermark: metadata.high_watermark,
      fell_back_to_full: false,
      started_at,
      finished_at: now(),
    })
  }

  fn record_error(&self, err: &SyncFailure, sync_type: SyncType) {
    let patch = MetadataPatch {
      last_error: Some(Some(SyncErrorRecord {
        message: err.to_string(),
        at: now(),
        sync_type,
      })),
      ..MetadataPatch::default()
    };
    if let Err(store_err) = self.inner.store.write_metadata(self.collection(), &patch) {
      warn!(collection = self.collection(), error = %store_err, "failed to record sync error");
    }
  }
}

/// Why a single sync attempt failed.
#[derive(Debug, thiserror::Error)]
enum SyncFailure {
  #[error(transparent)]
  Remote(#[from] RemoteError),
  #[error(transparent)]
  Cache(#[from] CacheError),
}

impl From<super::storage::StoreError> for SyncFailure {
  fn from(err: super::storage::StoreError) -> Self {
    SyncFailure::Cache(err.into())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::freshness::CacheOptions;
  use crate::cache::mock::{sample_issue, MockSource};
  use crate::cache::storage::{DurableStore, SqliteStore};
  use chrono::Duration;
  use std::sync::Arc;

  fn cache_over(source: Arc<MockSource>, store: Arc<SqliteStore>) -> ResourceCache<Arc<MockSource>> {
    let options = CacheOptions::default().with_background_refresh(false);
    ResourceCache::new(source, store, options)
  }

  /// Push every recorded sync two hours into the past.
  fn age_last_sync(store: &SqliteStore) {
    let at = now() - Duration::hours(2);
    store
      .write_metadata(
        "issue",
        &MetadataPatch {
          last_full_sync_at: Some(at),
          last_delta_sync_at: Some(at),
          ..MetadataPatch::default()
        },
      )
      .unwrap();
  }

  #[tokio::test]
  async fn test_first_sync_is_full() {
    let source = Arc::new(MockSource::with_issues(1..=3));
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cache = cache_over(source.clone(), store.clone());

    let report = cache.sync(SyncOptions::default()).await.unwrap();
    assert_eq!(report.sync_type, SyncType::Full);
    assert_eq!(report.fetched, 3);
    assert_eq!(report.high_watermark, 3);
    assert_eq!(store.count("issue").unwrap(), 3);
    assert_eq!(source.list_calls(), 1);

    let metadata = store.read_metadata("issue").unwrap();
    assert_eq!(metadata.sync_count, 1);
    assert!(metadata.last_full_sync_at.is_some());
    assert!(metadata.last_error.is_none());
  }

  #[tokio::test]
  async fn test_second_sync_within_window_is_skip() {
    let source = Arc::new(MockSource::with_issues(1..=3));
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cache = cache_over(source.clone(), store);

    cache.sync(SyncOptions::default()).await.unwrap();
    let calls_before = source.total_calls();

    let report = cache.sync(SyncOptions::default()).await.unwrap();
    assert_eq!(report.sync_type, SyncType::Skip);
    assert_eq!(source.total_calls(), calls_before);
  }

  #[tokio::test]
  async fn test_delta_sync_fills_watermark_gap() {
    let source = Arc::new(MockSource::with_issues(1..=3));
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cache = cache_over(source.clone(), store.clone());

    // Pretend the last sync happened two hours ago
    store
      .write_metadata(
        "issue",
        &MetadataPatch {
          last_full_sync_at: Some(now() - Duration::hours(2)),
          high_watermark: Some(3),
          ..MetadataPatch::default()
        },
      )
      .unwrap();

    // Issue 4 is invisible to the delta query, issue 5 is visible
    source.insert(sample_issue(4));
    source.insert(sample_issue(5));
    source.hide_from_delta(4);

    let report = cache.sync(SyncOptions::default()).await.unwrap();
    assert_eq!(report.sync_type, SyncType::Delta);
    assert_eq!(report.gap_filled, 1);
    assert_eq!(report.high_watermark, 5);
    assert!(store.read("issue", "4").unwrap().is_some());
    assert!(store.read("issue", "5").unwrap().is_some());
  }

  #[tokio::test]
  async fn test_unresolvable_ids_advance_watermark_once() {
    // 4..=6 are pull requests: counted by max_id, unknown to get
    let source = Arc::new(MockSource::with_issues(1..=3));
    source.set_latest_number(6);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cache = cache_over(source.clone(), store.clone());

    assert_eq!(cache.sync(SyncOptions::forced()).await.unwrap().high_watermark, 3);

    age_last_sync(&store);
    let report = cache.sync(SyncOptions::default()).await.unwrap();
    assert_eq!(report.sync_type, SyncType::Delta);
    assert_eq!(report.gap_filled, 0);
    assert_eq!(report.high_watermark, 6);
    assert_eq!(source.get_calls(), 3);

    age_last_sync(&store);
    let report = cache.sync(SyncOptions::default()).await.unwrap();
    assert_eq!(report.sync_type, SyncType::Delta);
    assert_eq!(report.high_watermark, 6);
    assert_eq!(source.get_calls(), 3);
    assert!(store.read_metadata("issue").unwrap().last_error.is_none());
  }

  #[tokio::test]
  async fn test_failed_gap_record_is_retried_next_delta() {
    let source = Arc::new(MockSource::with_issues([1]));
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cache = cache_over(source.clone(), store.clone());
    cache.sync(SyncOptions::forced()).await.unwrap();

    for number in [2, 3] {
      source.insert(sample_issue(number));
      source.hide_from_delta(number);
    }
    source.fail_get_once(2);

    age_last_sync(&store);
    let report = cache.sync(SyncOptions::default()).await.unwrap();
    assert_eq!(report.sync_type, SyncType::Delta);
    assert_eq!(report.gap_filled, 1);
    assert_eq!(report.high_watermark, 1);
    assert!(store.read("issue", "2").unwrap().is_none());
    assert!(store.read("issue", "3").unwrap().is_some());
    let last_error = store.read_metadata("issue").unwrap().last_error.unwrap();
    assert_eq!(last_error.sync_type, SyncType::Delta);
    assert!(last_error.message.contains("gap record 2"));

    age_last_sync(&store);
    let report = cache.sync(SyncOptions::default()).await.unwrap();
    assert_eq!(report.gap_filled, 2);
    assert_eq!(report.high_watermark, 3);
    assert!(store.read("issue", "2").unwrap().is_some());
    assert!(store.read_metadata("issue").unwrap().last_error.is_none());
  }

  #[tokio::test]
  async fn test_forced_sync_ignores_freshness() {
    let source = Arc::new(MockSource::with_issues(1..=2));
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cache = cache_over(source.clone(), store);

    cache.sync(SyncOptions::default()).await.unwrap();
    let report = cache.sync(SyncOptions::forced()).await.unwrap();
    assert_eq!(report.sync_type, SyncType::Full);
    assert_eq!(source.list_calls(), 2);
  }

  #[tokio::test]
  async fn test_concurrent_sync_is_skipped() {
    let source = Arc::new(MockSource::with_issues(1..=2).with_delay(std::time::Duration::from_millis(50)));
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cache = cache_over(source.clone(), store);

    let (first, second) = tokio::join!(
      cache.sync(SyncOptions::forced()),
      cache.sync(SyncOptions::forced())
    );
    let mut types = vec![first.unwrap().sync_type, second.unwrap().sync_type];
    types.sort_by_key(|t| t.to_string());
    assert_eq!(types, vec![SyncType::Full, SyncType::SkippedInProgress]);
    assert_eq!(source.list_calls(), 1);
    assert!(!cache.inner.syncing.load(Ordering::Acquire));
  }

  #[tokio::test]
  async fn test_failed_delta_falls_back_to_full() {
    let source = Arc::new(MockSource::with_issues(1..=3));
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cache = cache_over(source.clone(), store.clone());

    store
      .write_metadata(
        "issue",
        &MetadataPatch {
          last_full_sync_at: Some(now() - Duration::hours(2)),
          high_watermark: Some(3),
          ..MetadataPatch::default()
        },
      )
      .unwrap();
    source.fail_delta(true);

    let report = cache.sync(SyncOptions::default()).await.unwrap();
    assert_eq!(report.sync_type, SyncType::Full);
    assert!(report.fell_back_to_full);
    assert!(store.read_metadata("issue").unwrap().last_error.is_none());
  }

  #[tokio::test]
  async fn test_delta_and_full_failure_is_sync_conflict() {
    let source = Arc::new(MockSource::with_issues(1..=3));
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cache = cache_over(source.clone(), store.clone());

    store
      .write_metadata(
        "issue",
        &MetadataPatch {
          last_full_sync_at: Some(now() - Duration::hours(2)),
          ..MetadataPatch::default()
        },
      )
      .unwrap();
    source.set_failing(true);

    let err = cache.sync(SyncOptions::default()).await.unwrap_err();
    assert!(matches!(err, CacheError::SyncConflict { .. }));

    let last_error = store.read_metadata("issue").unwrap().last_error.unwrap();
    assert_eq!(last_error.sync_type, SyncType::Full);
  }

  #[tokio::test]
  async fn test_full_resync_after_promotes_delta() {
    let source = Arc::new(MockSource::with_issues(1..=3));
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let mut options = CacheOptions::default().with_background_refresh(false);
    options.full_resync_after = Some(Duration::days(7));
    let cache = ResourceCache::new(source.clone(), store.clone() as Arc<dyn DurableStore>, options);

    store
      .write_metadata(
        "issue",
        &MetadataPatch {
          last_full_sync_at: Some(now() - Duration::days(8)),
          last_delta_sync_at: Some(now() - Duration::hours(2)),
          ..MetadataPatch::default()
        },
      )
      .unwrap();

    let report = cache.sync(SyncOptions::default()).await.unwrap();
    assert_eq!(report.sync_type, SyncType::Full);
    assert_eq!(source.since_calls(), 0);
  }

  #[test]
  fn test_sync_type_display_matches_serde() {
    assert_eq!(SyncType::SkippedInProgress.to_string(), "skipped-in-progress");
    assert_eq!(
      serde_json::to_string(&SyncType::SkippedInProgress).unwrap(),
      "\"skipped-in-progress\""
    );
  }
}
