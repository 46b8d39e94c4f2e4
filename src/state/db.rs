//! Item store trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use super::error::StateError;
use super::schema;
use super::types::{ItemStatus, SyncRunRecord, SyncRunStats, TrackedItem};

/// Trait for item store operations.
///
/// Object-safe so the orchestrator, the progress reporter and the HTTP
/// trigger can share one store as `Arc<dyn ItemStore>`.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Insert items whose external id is not yet tracked.
    ///
    /// Runs in a single transaction. Existing rows are left untouched
    /// (first writer wins); returns the number of rows actually inserted.
    async fn insert_if_absent(&self, items: &[TrackedItem]) -> Result<u64, StateError>;

    /// Total number of tracked items.
    async fn count_all(&self) -> Result<u64, StateError>;

    /// Number of items in the given status.
    async fn count_by_status(&self, status: ItemStatus) -> Result<u64, StateError>;

    /// All items whose status differs from `status`, in insertion order.
    async fn find_by_status_not(&self, status: ItemStatus)
        -> Result<Vec<TrackedItem>, StateError>;

    /// Set the status and last-update time of one item.
    async fn update_status(
        &self,
        external_id: &str,
        status: ItemStatus,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StateError>;

    /// Look up a single item.
    async fn get(&self, external_id: &str) -> Result<Option<TrackedItem>, StateError>;

    /// Start a new sync run and return its ID.
    async fn start_sync_run(&self) -> Result<i64, StateError>;

    /// Complete a sync run with statistics.
    async fn complete_sync_run(&self, run_id: i64, stats: &SyncRunStats) -> Result<(), StateError>;

    /// The most recently started sync run, if any.
    async fn last_sync_run(&self) -> Result<Option<SyncRunRecord>, StateError>;
}

/// SQLite implementation of the item store.
pub struct SqliteItemStore {
    /// rusqlite::Connection is not Sync; the mutex also serializes writers.
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteItemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteItemStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteItemStore {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Migration)?;
            // Another process may hold the write lock briefly (e.g. a `status`
            // invocation while `serve` is running).
            conn.busy_timeout(Duration::from_secs(5))
                .map_err(StateError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StateError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StateError> {
        self.conn.lock().map_err(|_| StateError::Poisoned)
    }
}

#[async_trait]
impl ItemStore for SqliteItemStore {
    async fn insert_if_absent(&self, items: &[TrackedItem]) -> Result<u64, StateError> {
        if items.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock()?;
        // Dropping the transaction without a successful commit rolls it back,
        // including when COMMIT itself fails.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StateError::query)?;

        let mut inserted = 0u64;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO items (external_id, status, last_update) VALUES (?1, ?2, ?3)",
                )
                .map_err(StateError::query)?;

            for item in items {
                inserted += stmt
                    .execute(rusqlite::params![
                        item.external_id,
                        item.status.as_i64(),
                        item.last_update.timestamp_millis(),
                    ])
                    .map_err(StateError::query)? as u64;
            }
        }

        tx.commit().map_err(StateError::query)?;
        Ok(inserted)
    }

    async fn count_all(&self) -> Result<u64, StateError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
            .map_err(StateError::query)?;
        Ok(count as u64)
    }

    async fn count_by_status(&self, status: ItemStatus) -> Result<u64, StateError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM items WHERE status = ?1",
                [status.as_i64()],
                |row| row.get(0),
            )
            .map_err(StateError::query)?;
        Ok(count as u64)
    }

    async fn find_by_status_not(
        &self,
        status: ItemStatus,
    ) -> Result<Vec<TrackedItem>, StateError> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare_cached(
                "SELECT external_id, status, last_update FROM items WHERE status != ?1 ORDER BY rowid",
            )
            .map_err(StateError::query)?;

        let items = stmt
            .query_map([status.as_i64()], row_to_item)
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;

        Ok(items)
    }

    async fn update_status(
        &self,
        external_id: &str,
        status: ItemStatus,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StateError> {
        let conn = self.lock()?;

        let rows = conn
            .execute(
                "UPDATE items SET status = ?1, last_update = ?2 WHERE external_id = ?3",
                rusqlite::params![status.as_i64(), timestamp.timestamp_millis(), external_id],
            )
            .map_err(StateError::query)?;

        if rows == 0 {
            return Err(StateError::UnknownItem(external_id.to_string()));
        }
        Ok(())
    }

    async fn get(&self, external_id: &str) -> Result<Option<TrackedItem>, StateError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT external_id, status, last_update FROM items WHERE external_id = ?1",
            [external_id],
            row_to_item,
        )
        .optional()
        .map_err(StateError::query)
    }

    async fn start_sync_run(&self) -> Result<i64, StateError> {
        let started_at = Utc::now().timestamp();
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO sync_runs (started_at) VALUES (?1)",
            [started_at],
        )
        .map_err(StateError::query)?;

        Ok(conn.last_insert_rowid())
    }

    async fn complete_sync_run(&self, run_id: i64, stats: &SyncRunStats) -> Result<(), StateError> {
        let completed_at = Utc::now().timestamp();
        let conn = self.lock()?;

        conn.execute(
            "UPDATE sync_runs SET completed_at = ?1, discovered = ?2, updated = ?3, failed = ?4, interrupted = ?5 WHERE id = ?6",
            rusqlite::params![
                completed_at,
                stats.discovered as i64,
                stats.updated as i64,
                stats.failed as i64,
                stats.interrupted,
                run_id
            ],
        )
        .map_err(StateError::query)?;

        Ok(())
    }

    async fn last_sync_run(&self) -> Result<Option<SyncRunRecord>, StateError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, started_at, completed_at, discovered, updated, failed, interrupted FROM sync_runs ORDER BY id DESC LIMIT 1",
            [],
            |row| {
                let started_at: i64 = row.get(1)?;
                let completed_at: Option<i64> = row.get(2)?;
                Ok(SyncRunRecord {
                    id: row.get(0)?,
                    started_at: Utc
                        .timestamp_opt(started_at, 0)
                        .single()
                        .unwrap_or(DateTime::UNIX_EPOCH),
                    completed_at: completed_at.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
                    stats: SyncRunStats {
                        discovered: row.get::<_, i64>(3)? as u64,
                        updated: row.get::<_, i64>(4)? as u64,
                        failed: row.get::<_, i64>(5)? as u64,
                        interrupted: row.get(6)?,
                    },
                })
            },
        )
        .optional()
        .map_err(StateError::query)
    }
}

/// Convert a database row to a TrackedItem.
fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrackedItem> {
    let status_value: i64 = row.get(1)?;
    let status = ItemStatus::from_i64(status_value)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(1, status_value))?;
    let last_update_ms: i64 = row.get(2)?;

    Ok(TrackedItem {
        external_id: row.get(0)?,
        last_update: Utc
            .timestamp_millis_opt(last_update_ms)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH),
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("metadata-updater")
            .join("state_db_tests")
            .join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn pending(ids: &[&str]) -> Vec<TrackedItem> {
        ids.iter().map(|id| TrackedItem::new_pending(*id)).collect()
    }

    #[tokio::test]
    async fn test_open_creates_db() {
        let dir = test_dir("open_creates");
        let path = dir.join("test.db");
        let db = SqliteItemStore::open(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(db.path(), path);
    }

    #[tokio::test]
    async fn test_reopen_keeps_items() {
        let dir = test_dir("reopen");
        let path = dir.join("test.db");
        {
            let db = SqliteItemStore::open(&path).await.unwrap();
            db.insert_if_absent(&pending(&["a", "b"])).await.unwrap();
        }
        let db = SqliteItemStore::open(&path).await.unwrap();
        assert_eq!(db.count_all().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_insert_if_absent_counts_inserted() {
        let db = SqliteItemStore::open_in_memory().unwrap();
        let inserted = db
            .insert_if_absent(&pending(&["a", "b", "c"]))
            .await
            .unwrap();
        assert_eq!(inserted, 3);
        assert_eq!(db.count_all().await.unwrap(), 3);
        assert_eq!(db.count_by_status(ItemStatus::Pending).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_insert_if_absent_skips_duplicates() {
        let db = SqliteItemStore::open_in_memory().unwrap();
        db.insert_if_absent(&pending(&["a", "b"])).await.unwrap();

        let inserted = db
            .insert_if_absent(&pending(&["b", "c", "c"]))
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(db.count_all().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_insert_if_absent_leaves_existing_row_untouched() {
        let db = SqliteItemStore::open_in_memory().unwrap();
        db.insert_if_absent(&pending(&["a"])).await.unwrap();
        let stamp = Utc.timestamp_millis_opt(1_600_000_000_000).unwrap();
        db.update_status("a", ItemStatus::UpdateFailed, stamp)
            .await
            .unwrap();

        db.insert_if_absent(&pending(&["a"])).await.unwrap();

        let item = db.get("a").await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::UpdateFailed);
        assert_eq!(item.last_update, stamp);
    }

    #[tokio::test]
    async fn test_insert_if_absent_empty() {
        let db = SqliteItemStore::open_in_memory().unwrap();
        assert_eq!(db.insert_if_absent(&[]).await.unwrap(), 0);
        assert_eq!(db.count_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insert_rolls_back_whole_batch_on_failure() {
        let db = SqliteItemStore::open_in_memory().unwrap();
        db.lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_poison BEFORE INSERT ON items
                 WHEN NEW.external_id = 'poison'
                 BEGIN SELECT RAISE(ABORT, 'poisoned'); END;",
            )
            .unwrap();

        let result = db.insert_if_absent(&pending(&["a", "poison", "b"])).await;
        assert!(matches!(result, Err(StateError::Query(_))));
        assert_eq!(db.count_all().await.unwrap(), 0);

        // The connection is usable again after the rollback.
        assert_eq!(db.insert_if_absent(&pending(&["c"])).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_no_open_transaction() {
        let db = SqliteItemStore::open_in_memory().unwrap();
        // A deferred foreign key violation only surfaces at COMMIT.
        db.lock()
            .unwrap()
            .execute_batch(
                "PRAGMA foreign_keys = ON;
                 CREATE TABLE owners (id INTEGER PRIMARY KEY);
                 CREATE TABLE claims (
                     owner INTEGER REFERENCES owners(id) DEFERRABLE INITIALLY DEFERRED
                 );
                 CREATE TRIGGER orphan_claim AFTER INSERT ON items
                 WHEN NEW.external_id = 'orphan'
                 BEGIN INSERT INTO claims (owner) VALUES (42); END;",
            )
            .unwrap();

        let result = db.insert_if_absent(&pending(&["a", "orphan"])).await;
        assert!(matches!(result, Err(StateError::Query(_))));
        assert!(db.lock().unwrap().is_autocommit());
        assert_eq!(db.count_all().await.unwrap(), 0);

        assert_eq!(db.insert_if_absent(&pending(&["b"])).await.unwrap(), 1);
        db.update_status("b", ItemStatus::UpdateSucceeded, Utc::now())
            .await
            .unwrap();
        assert!(db.lock().unwrap().is_autocommit());
    }

    #[tokio::test]
    async fn test_update_status_and_find_by_status_not() {
        let db = SqliteItemStore::open_in_memory().unwrap();
        db.insert_if_absent(&pending(&["a", "b", "c"])).await.unwrap();

        let now = Utc::now();
        db.update_status("a", ItemStatus::UpdateSucceeded, now)
            .await
            .unwrap();
        db.update_status("b", ItemStatus::UpdateFailed, now)
            .await
            .unwrap();

        let open: Vec<String> = db
            .find_by_status_not(ItemStatus::UpdateSucceeded)
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.external_id)
            .collect();
        assert_eq!(open, vec!["b".to_string(), "c".to_string()]);

        let a = db.get("a").await.unwrap().unwrap();
        assert_eq!(a.status, ItemStatus::UpdateSucceeded);
        assert_eq!(a.last_update.timestamp_millis(), now.timestamp_millis());
    }

    #[tokio::test]
    async fn test_update_status_unknown_id() {
        let db = SqliteItemStore::open_in_memory().unwrap();
        let result = db
            .update_status("missing", ItemStatus::UpdateSucceeded, Utc::now())
            .await;
        assert!(matches!(result, Err(StateError::UnknownItem(id)) if id == "missing"));
    }

    #[tokio::test]
    async fn test_count_by_status() {
        let db = SqliteItemStore::open_in_memory().unwrap();
        db.insert_if_absent(&pending(&["a", "b", "c", "d"]))
            .await
            .unwrap();
        db.update_status("a", ItemStatus::UpdateSucceeded, Utc::now())
            .await
            .unwrap();
        db.update_status("b", ItemStatus::UpdateFailed, Utc::now())
            .await
            .unwrap();
        db.update_status("c", ItemStatus::UpdateFailed, Utc::now())
            .await
            .unwrap();

        assert_eq!(db.count_by_status(ItemStatus::Pending).await.unwrap(), 1);
        assert_eq!(
            db.count_by_status(ItemStatus::UpdateSucceeded).await.unwrap(),
            1
        );
        assert_eq!(db.count_by_status(ItemStatus::UpdateFailed).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let db = SqliteItemStore::open_in_memory().unwrap();
        assert!(db.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sync_run_lifecycle() {
        let db = SqliteItemStore::open_in_memory().unwrap();
        assert!(db.last_sync_run().await.unwrap().is_none());

        let run_id = db.start_sync_run().await.unwrap();
        assert!(run_id > 0);

        let running = db.last_sync_run().await.unwrap().unwrap();
        assert_eq!(running.id, run_id);
        assert!(running.completed_at.is_none());

        let stats = SyncRunStats {
            discovered: 10,
            updated: 8,
            failed: 2,
            interrupted: false,
        };
        db.complete_sync_run(run_id, &stats).await.unwrap();

        let done = db.last_sync_run().await.unwrap().unwrap();
        assert!(done.completed_at.is_some());
        assert_eq!(done.stats, stats);
    }
}
