//! Durable store trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use super::sync::SyncType;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("failed to (de)serialize record: {0}")]
  Serde(#[from] serde_json::Error),

  #[error("failed to create cache directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    source: std::io::Error,
  },

  #[error("invalid timestamp '{value}': {reason}")]
  Timestamp { value: String, reason: String },

  #[error("could not determine data directory")]
  NoDataDir,

  #[error("storage lock poisoned")]
  LockPoisoned,
}

/// A record as persisted: JSON payload plus its fetch timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
  pub key: String,
  pub payload: Value,
  pub cached_at: DateTime<Utc>,
}

/// Last failed sync, kept in the metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncErrorRecord {
  pub message: String,
  pub at: DateTime<Utc>,
  pub sync_type: SyncType,
}

/// Per-collection sync bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncMetadata {
  pub last_full_sync_at: Option<DateTime<Utc>>,
  pub last_delta_sync_at: Option<DateTime<Utc>>,
  /// Largest remote identifier seen so far
  pub high_watermark: u64,
  pub total_records: u64,
  pub sync_count: u64,
  pub last_error: Option<SyncErrorRecord>,
}

impl SyncMetadata {
  /// Most recent successful sync of either kind.
  pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
    self.last_full_sync_at.max(self.last_delta_sync_at)
  }

  pub fn apply(&mut self, patch: &MetadataPatch) {
    if let Some(at) = patch.last_full_sync_at {
      self.last_full_sync_at = Some(at);
    }
    if let Some(at) = patch.last_delta_sync_at {
      self.last_delta_sync_at = Some(at);
    }
    if let Some(watermark) = patch.high_watermark {
      self.high_watermark = watermark;
    }
    if let Some(total) = patch.total_records {
      self.total_records = total;
    }
    if let Some(count) = patch.sync_count {
      self.sync_count = count;
    }
    if let Some(last_error) = &patch.last_error {
      self.last_error = last_error.clone();
    }
  }
}

/// Partial metadata update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
  pub last_full_sync_at: Option<DateTime<Utc>>,
  pub last_delta_sync_at: Option<DateTime<Utc>>,
  pub high_watermark: Option<u64>,
  pub total_records: Option<u64>,
  pub sync_count: Option<u64>,
  /// `Some(None)` clears the recorded error
  pub last_error: Option<Option<SyncErrorRecord>>,
}

/// Trait for durable store backends.
///
/// Every call is scoped to a namespace so several collections share one store.
pub trait DurableStore: Send + Sync {
  fn read(&self, namespace: &str, key: &str) -> Result<Option<StoredRecord>, StoreError>;

  fn read_all(&self, namespace: &str) -> Result<Vec<StoredRecord>, StoreError>;

  fn write(&self, namespace: &str, record: &StoredRecord) -> Result<(), StoreError>;

  /// Upsert a batch in one transaction.
  fn write_many(&self, namespace: &str, records: &[StoredRecord]) -> Result<(), StoreError>;

  /// Replace the namespace's records wholesale.
  fn replace_all(&self, namespace: &str, records: &[StoredRecord]) -> Result<(), StoreError>;

  fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError>;

  fn count(&self, namespace: &str) -> Result<u64, StoreError>;

  fn oldest_cached_at(&self, namespace: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

  fn read_metadata(&self, namespace: &str) -> Result<SyncMetadata, StoreError>;

  /// Merge `patch` into the stored metadata and return the result.
  fn write_metadata(&self, namespace: &str, patch: &MetadataPatch)
    -> Result<SyncMetadata, StoreError>;

  /// Drop records and metadata for the namespace.
  fn clear(&self, namespace: &str) -> Result<(), StoreError>;
}

/// Storage implementation that doesn't persist anything.
/// Used when persistence is disabled - the cache runs memory-only.
pub struct NoopStore;

impl DurableStore for NoopStore {
  fn read(&self, _namespace: &str, _key: &str) -> Result<Option<StoredRecord>, StoreError> {
    Ok(None) // Always miss
  }

  fn read_all(&self, _namespace: &str) -> Result<Vec<StoredRecord>, StoreError> {
    Ok(Vec::new())
  }

  fn write(&self, _namespace: &str, _record: &StoredRecord) -> Result<(), StoreError> {
    Ok(()) // Discard
  }

  fn write_many(&self, _namespace: &str, _records: &[StoredRecord]) -> Result<(), StoreError> {
    Ok(())
  }

  fn replace_all(&self, _namespace: &str, _records: &[StoredRecord]) -> Result<(), StoreError> {
    Ok(())
  }

  fn delete(&self, _namespace: &str, _key: &str) -> Result<(), StoreError> {
    Ok(())
  }

  fn count(&self, _namespace: &str) -> Result<u64, StoreError> {
    Ok(0)
  }

  fn oldest_cached_at(&self, _namespace: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    Ok(None)
  }

  fn read_metadata(&self, _namespace: &str) -> Result<SyncMetadata, StoreError> {
    Ok(SyncMetadata::default())
  }

  fn write_metadata(
    &self,
    _namespace: &str,
    patch: &MetadataPatch,
  ) -> Result<SyncMetadata, StoreError> {
    let mut metadata = SyncMetadata::default();
    metadata.apply(patch);
    Ok(metadata)
  }

  fn clear(&self, _namespace: &str) -> Result<(), StoreError> {
    Ok(())
  }
}

/// SQLite-based durable store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open_default() -> Result<Self, StoreError> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
        path: parent.to_path_buf(),
        source,
      })?;
    }

    Self::from_connection(Connection::open(path)?)
  }

  /// Open a throwaway in-memory store.
  pub fn open_in_memory() -> Result<Self, StoreError> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self, StoreError> {
    conn.execute_batch(STORE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf, StoreError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or(StoreError::NoDataDir)?;

    Ok(data_dir.join("gh-mirror").join("cache.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::LockPoisoned)
  }
}

/// Schema for the durable store.
const STORE_SCHEMA: &str = r#"
-- Mirrored records (serialized JSON)
CREATE TABLE IF NOT EXISTS records (
    namespace TEXT NOT NULL,
    record_key TEXT NOT NULL,
    payload TEXT NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (namespace, record_key)
);

CREATE INDEX IF NOT EXISTS idx_records_cached_at
    ON records(namespace, cached_at);

-- One metadata document per namespace
CREATE TABLE IF NOT EXISTS sync_metadata (
    namespace TEXT PRIMARY KEY,
    data TEXT NOT NULL
);
"#;

const UPSERT_RECORD: &str = "INSERT OR REPLACE INTO records (namespace, record_key, payload, cached_at)
   VALUES (?1, ?2, ?3, ?4)";

impl DurableStore for SqliteStore {
  fn read(&self, namespace: &str, key: &str) -> Result<Option<StoredRecord>, StoreError> {
    let conn = self.conn()?;

    let row: Option<(String, String)> = conn
      .query_row(
        "SELECT payload, cached_at FROM records WHERE namespace = ?1 AND record_key = ?2",
        params![namespace, key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    match row {
      Some((payload, cached_at)) => Ok(Some(StoredRecord {
        key: key.to_string(),
        payload: serde_json::from_str(&payload)?,
        cached_at: parse_timestamp(&cached_at)?,
      })),
      None => Ok(None),
    }
  }

  fn read_all(&self, namespace: &str) -> Result<Vec<StoredRecord>, StoreError> {
    let conn = self.conn()?;

    let mut stmt = conn.prepare(
      "SELECT record_key, payload, cached_at FROM records
       WHERE namespace = ?1
       ORDER BY record_key",
    )?;

    let rows: Vec<(String, String, String)> = stmt
      .query_map(params![namespace], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
      })?
      .collect::<Result<_, _>>()?;

    rows
      .into_iter()
      .map(|(key, payload, cached_at)| {
        Ok(StoredRecord {
          key,
          payload: serde_json::from_str(&payload)?,
          cached_at: parse_timestamp(&cached_at)?,
        })
      })
      .collect()
  }

  fn write(&self, namespace: &str, record: &StoredRecord) -> Result<(), StoreError> {
    let conn = self.conn()?;
    conn.execute(
      UPSERT_RECORD,
      params![
        namespace,
        record.key,
        serde_json::to_string(&record.payload)?,
        format_timestamp(record.cached_at)
      ],
    )?;
    Ok(())
  }

  fn write_many(&self, namespace: &str, records: &[StoredRecord]) -> Result<(), StoreError> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    {
      let mut stmt = tx.prepare(UPSERT_RECORD)?;
      for record in records {
        stmt.execute(params![
          namespace,
          record.key,
          serde_json::to_string(&record.payload)?,
          format_timestamp(record.cached_at)
        ])?;
      }
    }
    tx.commit()?;
    Ok(())
  }

  fn replace_all(&self, namespace: &str, records: &[StoredRecord]) -> Result<(), StoreError> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM records WHERE namespace = ?1", params![namespace])?;
    {
      let mut stmt = tx.prepare(UPSERT_RECORD)?;
      for record in records {
        stmt.execute(params![
          namespace,
          record.key,
          serde_json::to_string(&record.payload)?,
          format_timestamp(record.cached_at)
        ])?;
      }
    }
    tx.commit()?;
    Ok(())
  }

  fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
    let conn = self.conn()?;
    conn.execute(
      "DELETE FROM records WHERE namespace = ?1 AND record_key = ?2",
      params![namespace, key],
    )?;
    Ok(())
  }

  fn count(&self, namespace: &str) -> Result<u64, StoreError> {
    let conn = self.conn()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM records WHERE namespace = ?1",
      params![namespace],
      |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or_default())
  }

  fn oldest_cached_at(&self, namespace: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
    let conn = self.conn()?;
    // Timestamps share one fixed-width format, so text ordering is time ordering
    let oldest: Option<String> = conn.query_row(
      "SELECT MIN(cached_at) FROM records WHERE namespace = ?1",
      params![namespace],
      |row| row.get(0),
    )?;
    oldest.as_deref().map(parse_timestamp).transpose()
  }

  fn read_metadata(&self, namespace: &str) -> Result<SyncMetadata, StoreError> {
    let conn = self.conn()?;
    read_metadata_locked(&conn, namespace)
  }

  fn write_metadata(
    &self,
    namespace: &str,
    patch: &MetadataPatch,
  ) -> Result<SyncMetadata, StoreError> {
    let conn = self.conn()?;
    let mut metadata = read_metadata_locked(&conn, namespace)?;
    metadata.apply(patch);

    conn.execute(
      "INSERT OR REPLACE INTO sync_metadata (namespace, data) VALUES (?1, ?2)",
      params![namespace, serde_json::to_string(&metadata)?],
    )?;

    Ok(metadata)
  }

  fn clear(&self, namespace: &str) -> Result<(), StoreError> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM records WHERE namespace = ?1", params![namespace])?;
    tx.execute(
      "DELETE FROM sync_metadata WHERE namespace = ?1",
      params![namespace],
    )?;
    tx.commit()?;
    Ok(())
  }
}

fn read_metadata_locked(conn: &Connection, namespace: &str) -> Result<SyncMetadata, StoreError> {
  let data: Option<String> = conn
    .query_row(
      "SELECT data FROM sync_metadata WHERE namespace = ?1",
      params![namespace],
      |row| row.get(0),
    )
    .optional()?;

  match data {
    Some(data) => Ok(serde_json::from_str(&data)?),
    None => Ok(SyncMetadata::default()),
  }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp written by `format_timestamp`.
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StoreError::Timestamp {
      value: s.to_string(),
      reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::freshness::now;
  use chrono::Duration;
  use serde_json::json;

  fn record(key: &str, cached_at: DateTime<Utc>) -> StoredRecord {
    StoredRecord {
      key: key.to_string(),
      payload: json!({ "number": key, "title": format!("Issue {}", key) }),
      cached_at,
    }
  }

  #[test]
  fn test_write_then_read_keeps_timestamp_precision() {
    let store = SqliteStore::open_in_memory().unwrap();
    let at = now();
    store.write("issue", &record("7", at)).unwrap();

    let read = store.read("issue", "7").unwrap().unwrap();
    assert_eq!(read.cached_at, at);
    assert_eq!(read.payload["title"], "Issue 7");
  }

  #[test]
  fn test_namespaces_are_isolated() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.write("issue", &record("1", now())).unwrap();

    assert!(store.read("milestone", "1").unwrap().is_none());
    assert_eq!(store.count("issue").unwrap(), 1);
    assert_eq!(store.count("milestone").unwrap(), 0);
  }

  #[test]
  fn test_replace_all_drops_previous_records() {
    let store = SqliteStore::open_in_memory().unwrap();
    let at = now();
    store
      .write_many("issue", &[record("1", at), record("2", at)])
      .unwrap();

    store.replace_all("issue", &[record("3", at)]).unwrap();

    let keys: Vec<String> = store
      .read_all("issue")
      .unwrap()
      .into_iter()
      .map(|r| r.key)
      .collect();
    assert_eq!(keys, vec!["3".to_string()]);
  }

  #[test]
  fn test_oldest_cached_at() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert!(store.oldest_cached_at("issue").unwrap().is_none());

    let at = now();
    let older = at - Duration::hours(5);
    store
      .write_many("issue", &[record("1", at), record("2", older)])
      .unwrap();

    assert_eq!(store.oldest_cached_at("issue").unwrap(), Some(older));
  }

  #[test]
  fn test_metadata_patch_merges() {
    let store = SqliteStore::open_in_memory().unwrap();
    let at = now();

    store
      .write_metadata(
        "issue",
        &MetadataPatch {
          last_full_sync_at: Some(at),
          high_watermark: Some(42),
          sync_count: Some(1),
          ..Default::default()
        },
      )
      .unwrap();

    let merged = store
      .write_metadata(
        "issue",
        &MetadataPatch {
          total_records: Some(10),
          ..Default::default()
        },
      )
      .unwrap();

    assert_eq!(merged.last_full_sync_at, Some(at));
    assert_eq!(merged.high_watermark, 42);
    assert_eq!(merged.total_records, 10);
    assert_eq!(store.read_metadata("issue").unwrap(), merged);
  }

  #[test]
  fn test_metadata_patch_can_clear_error() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
      .write_metadata(
        "issue",
        &MetadataPatch {
          last_error: Some(Some(SyncErrorRecord {
            message: "boom".to_string(),
            at: now(),
            sync_type: SyncType::Delta,
          })),
          ..Default::default()
        },
      )
      .unwrap();

    let cleared = store
      .write_metadata(
        "issue",
        &MetadataPatch {
          last_error: Some(None),
          ..Default::default()
        },
      )
      .unwrap();
    assert!(cleared.last_error.is_none());
  }

  #[test]
  fn test_last_sync_at_takes_most_recent() {
    let at = now();
    let metadata = SyncMetadata {
      last_full_sync_at: Some(at - Duration::hours(2)),
      last_delta_sync_at: Some(at),
      ..Default::default()
    };
    assert_eq!(metadata.last_sync_at(), Some(at));
    assert_eq!(SyncMetadata::default().last_sync_at(), None);
  }

  #[test]
  fn test_reopen_file_store_survives_restart() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("cache.db");
    let at = now();

    {
      let store = SqliteStore::open(&path).unwrap();
      store.write("issue", &record("9", at)).unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.read("issue", "9").unwrap().unwrap().cached_at, at);
  }

  #[test]
  fn test_clear_removes_records_and_metadata() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.write("issue", &record("1", now())).unwrap();
    store
      .write_metadata(
        "issue",
        &MetadataPatch {
          sync_count: Some(3),
          ..Default::default()
        },
      )
      .unwrap();

    store.clear("issue").unwrap();

    assert_eq!(store.count("issue").unwrap(), 0);
    assert_eq!(store.read_metadata("issue").unwrap(), SyncMetadata::default());
  }
}
