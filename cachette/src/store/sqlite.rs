//! SQLite-backed persistent blob store.
//!
//! One database file per [`open`](SqliteStore::open) path, WAL journaling,
//! and the same contract as the in-memory store. Rows live in a single
//! `cache` table keyed by `key`, with a secondary index on `type_tag`;
//! timestamps are stored as Unix milliseconds.
//!
//! Opening the same path twice within one process shares a single underlying
//! connection pool. Disposal is shared the same way:
//! [`dispose`](BlobStore::dispose) on any handle closes the pool,
//! unregisters the path, and fails every sibling handle on that path with
//! [`Error::Disposed`](crate::Error::Disposed).
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cachette::{BlobStore, Expiration, SqliteStore, SystemClock};
//!
//! # #[tokio::main]
//! # async fn main() -> cachette::Result<()> {
//! let store = SqliteStore::open("./cache.db", Arc::new(SystemClock)).await?;
//! store
//!     .insert("greeting", b"hello".to_vec(), None, Expiration::Never)
//!     .await?;
//! store.flush().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::config::Expiration;
use crate::error::{Error, Result};
use crate::store::{BlobStore, CacheEntry, ensure_valid_key};

const CREATE_TABLE: &str = "\
CREATE TABLE IF NOT EXISTS cache (
    key        TEXT PRIMARY KEY NOT NULL,
    value      BLOB NOT NULL,
    type_tag   TEXT,
    created_at INTEGER NOT NULL,
    expires_at INTEGER
)";

const CREATE_TYPE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_cache_type_tag ON cache (type_tag)";

const UPSERT: &str = "\
INSERT INTO cache (key, value, type_tag, created_at, expires_at)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT (key) DO UPDATE SET
    value = excluded.value,
    type_tag = excluded.type_tag,
    created_at = excluded.created_at,
    expires_at = excluded.expires_at";

const DELETE_EXPIRED_BY_KEY: &str =
    "DELETE FROM cache WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2";

const DELETE_EXPIRED: &str =
    "DELETE FROM cache WHERE expires_at IS NOT NULL AND expires_at <= ?1";

/// The pool and disposal flag shared by every handle opened on one path.
/// Disposing any handle flips the flag for all of them, so siblings fail
/// with `Disposed` instead of tripping over a closed pool.
#[derive(Debug)]
struct SharedPool {
    pool: SqlitePool,
    disposed: AtomicBool,
}

/// One shared pool per open path, so concurrent opens of the same database
/// within a process do not fight over the file.
static OPEN_POOLS: OnceLock<Mutex<HashMap<PathBuf, Arc<SharedPool>>>> = OnceLock::new();

fn open_pools() -> &'static Mutex<HashMap<PathBuf, Arc<SharedPool>>> {
    OPEN_POOLS.get_or_init(Mutex::default)
}

/// A durable [`BlobStore`] storing entries in a single SQLite database file.
#[derive(Debug)]
pub struct SqliteStore {
    shared: Arc<SharedPool>,
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Opens (creating if missing) the database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when the file cannot be opened or the
    /// schema cannot be prepared.
    pub async fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = std::path::absolute(path.as_ref())
            .map_err(|err| Error::invalid_argument(format!("invalid store path: {err}")))?;

        let mut pools = open_pools().lock().await;
        let shared = match pools.get(&path) {
            Some(shared) if !shared.disposed.load(Ordering::SeqCst) => Arc::clone(shared),
            _ => {
                let options = SqliteConnectOptions::new()
                    .filename(&path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(Duration::from_secs(5));
                let pool = SqlitePoolOptions::new()
                    .max_connections(4)
                    .connect_with(options)
                    .await?;
                sqlx::query(CREATE_TABLE).execute(&pool).await?;
                sqlx::query(CREATE_TYPE_INDEX).execute(&pool).await?;
                let shared = Arc::new(SharedPool {
                    pool,
                    disposed: AtomicBool::new(false),
                });
                pools.insert(path.clone(), Arc::clone(&shared));
                tracing::debug!(path = %path.display(), "opened sqlite blob store");
                shared
            }
        };
        drop(pools);

        Ok(Self {
            shared,
            path,
            clock,
        })
    }

    /// The database file this store writes to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.shared.pool
    }

    fn guard(&self) -> Result<()> {
        if self.shared.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn expires_millis(&self, expiration: Expiration) -> Option<i64> {
        expiration
            .resolve(self.clock.now())
            .map(|deadline| deadline.timestamp_millis())
    }

    /// Deletes the row for `key` if its deadline has passed, so the read
    /// that discovered it does not see it again.
    async fn prune_expired_key(&self, key: &str) -> Result<()> {
        sqlx::query(DELETE_EXPIRED_BY_KEY)
            .bind(key)
            .bind(self.now_millis())
            .execute(&self.shared.pool)
            .await?;
        Ok(())
    }
}

fn decode_timestamp(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Error::Storage(sqlx::Error::Decode("timestamp out of range".into())))
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<CacheEntry> {
    let expires_at = row
        .try_get::<Option<i64>, _>("expires_at")?
        .map(decode_timestamp)
        .transpose()?;
    Ok(CacheEntry {
        key: row.try_get("key")?,
        value: row.try_get("value")?,
        type_tag: row.try_get("type_tag")?,
        created_at: decode_timestamp(row.try_get("created_at")?)?,
        expires_at,
    })
}

#[async_trait::async_trait]
impl BlobStore for SqliteStore {
    async fn insert(
        &self,
        key: &str,
        value: Vec<u8>,
        type_tag: Option<&str>,
        expiration: Expiration,
    ) -> Result<()> {
        ensure_valid_key(key)?;
        self.guard()?;
        sqlx::query(UPSERT)
            .bind(key)
            .bind(value)
            .bind(type_tag)
            .bind(self.now_millis())
            .bind(self.expires_millis(expiration))
            .execute(&self.shared.pool)
            .await?;
        Ok(())
    }

    async fn insert_many(
        &self,
        pairs: Vec<(String, Vec<u8>)>,
        type_tag: Option<&str>,
        expiration: Expiration,
    ) -> Result<()> {
        for (key, _) in &pairs {
            ensure_valid_key(key)?;
        }
        self.guard()?;
        let created_at = self.now_millis();
        let expires_at = self.expires_millis(expiration);

        let mut tx = self.shared.pool.begin().await?;
        for (key, value) in pairs {
            sqlx::query(UPSERT)
                .bind(key)
                .bind(value)
                .bind(type_tag)
                .bind(created_at)
                .bind(expires_at)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        ensure_valid_key(key)?;
        self.guard()?;
        self.prune_expired_key(key).await?;
        let row = sqlx::query("SELECT value FROM cache WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.shared.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get("value")?),
            None => Err(Error::key_not_found(key)),
        }
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<(String, Vec<u8>)>> {
        self.guard()?;
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            self.prune_expired_key(key).await?;
            let row = sqlx::query("SELECT value FROM cache WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.shared.pool)
                .await?;
            if let Some(row) = row {
                found.push((key.clone(), row.try_get("value")?));
            }
        }
        Ok(found)
    }

    async fn get_all(&self, type_tag: &str) -> Result<Vec<CacheEntry>> {
        self.guard()?;
        sqlx::query(
            "DELETE FROM cache \
             WHERE type_tag = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
        )
        .bind(type_tag)
        .bind(self.now_millis())
        .execute(&self.shared.pool)
        .await?;

        let rows = sqlx::query(
            "SELECT key, value, type_tag, created_at, expires_at FROM cache \
             WHERE type_tag = ?1",
        )
        .bind(type_tag)
        .fetch_all(&self.shared.pool)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }

    async fn get_all_keys(&self, type_tag: Option<&str>) -> Result<Vec<String>> {
        self.guard()?;
        let now = self.now_millis();
        let rows = match type_tag {
            Some(tag) => {
                sqlx::query(
                    "DELETE FROM cache \
                     WHERE type_tag = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
                )
                .bind(tag)
                .bind(now)
                .execute(&self.shared.pool)
                .await?;
                sqlx::query("SELECT key FROM cache WHERE type_tag = ?1")
                    .bind(tag)
                    .fetch_all(&self.shared.pool)
                    .await?
            }
            None => {
                sqlx::query(DELETE_EXPIRED).bind(now).execute(&self.shared.pool).await?;
                sqlx::query("SELECT key FROM cache").fetch_all(&self.shared.pool).await?
            }
        };

        rows.iter()
            .map(|row| row.try_get("key").map_err(Error::from))
            .collect()
    }

    async fn get_created_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        ensure_valid_key(key)?;
        self.guard()?;
        self.prune_expired_key(key).await?;
        let row = sqlx::query("SELECT created_at FROM cache WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.shared.pool)
            .await?;
        row.map(|row| decode_timestamp(row.try_get("created_at")?))
            .transpose()
    }

    async fn update_expiration(&self, key: &str, expiration: Expiration) -> Result<()> {
        ensure_valid_key(key)?;
        self.guard()?;
        self.prune_expired_key(key).await?;
        let updated = sqlx::query("UPDATE cache SET expires_at = ?1 WHERE key = ?2")
            .bind(self.expires_millis(expiration))
            .bind(key)
            .execute(&self.shared.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::key_not_found(key));
        }
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        ensure_valid_key(key)?;
        self.guard()?;
        sqlx::query("DELETE FROM cache WHERE key = ?1")
            .bind(key)
            .execute(&self.shared.pool)
            .await?;
        Ok(())
    }

    async fn invalidate_many(&self, keys: &[String]) -> Result<()> {
        self.guard()?;
        for key in keys {
            sqlx::query("DELETE FROM cache WHERE key = ?1")
                .bind(key)
                .execute(&self.shared.pool)
                .await?;
        }
        Ok(())
    }

    async fn invalidate_all(&self, type_tag: Option<&str>) -> Result<()> {
        self.guard()?;
        match type_tag {
            Some(tag) => {
                sqlx::query("DELETE FROM cache WHERE type_tag = ?1")
                    .bind(tag)
                    .execute(&self.shared.pool)
                    .await?;
            }
            None => {
                sqlx::query("DELETE FROM cache").execute(&self.shared.pool).await?;
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.guard()?;
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.shared.pool)
            .await?;
        Ok(())
    }

    async fn vacuum(&self) -> Result<()> {
        self.guard()?;
        let removed = sqlx::query(DELETE_EXPIRED)
            .bind(self.now_millis())
            .execute(&self.shared.pool)
            .await?;
        sqlx::query("VACUUM").execute(&self.shared.pool).await?;
        tracing::debug!(
            path = %self.path.display(),
            removed = removed.rows_affected(),
            "vacuumed sqlite blob store"
        );
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut pools = open_pools().lock().await;
        if pools
            .get(&self.path)
            .is_some_and(|entry| Arc::ptr_eq(entry, &self.shared))
        {
            pools.remove(&self.path);
        }
        drop(pools);
        self.shared.pool.close().await;
        tracing::debug!(path = %self.path.display(), "disposed sqlite blob store");
        Ok(())
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::clock::ManualClock;

    struct TestStore {
        store: SqliteStore,
        clock: Arc<ManualClock>,
        // dropped last; keeps the database file alive for the test
        _dir: TempDir,
    }

    async fn make_store() -> TestStore {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = SqliteStore::open(dir.path().join("blobs.db"), clock.clone())
            .await
            .expect("failed to open store");
        TestStore {
            store,
            clock,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let t = make_store().await;
        t.store
            .insert("k", vec![1, 2, 3], None, Expiration::Never)
            .await
            .unwrap();
        assert_eq!(t.store.get("k").await.unwrap(), vec![1, 2, 3]);
        t.store.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.db");
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let store = SqliteStore::open(&path, clock.clone()).await.unwrap();
        store
            .insert("durable", b"payload".to_vec(), Some("T"), Expiration::Never)
            .await
            .unwrap();
        store.flush().await.unwrap();
        store.dispose().await.unwrap();

        let reopened = SqliteStore::open(&path, clock).await.unwrap();
        assert_eq!(reopened.get("durable").await.unwrap(), b"payload");
        let entries = reopened.get_all("T").await.unwrap();
        assert_eq!(entries.len(), 1);
        reopened.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_opens_share_one_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.db");
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let first = SqliteStore::open(&path, clock.clone()).await.unwrap();
        let second = SqliteStore::open(&path, clock).await.unwrap();

        first
            .insert("k", vec![7], None, Expiration::Never)
            .await
            .unwrap();
        assert_eq!(second.get("k").await.unwrap(), vec![7]);

        first.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn disposal_reaches_every_handle_on_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.db");
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let first = SqliteStore::open(&path, clock.clone()).await.unwrap();
        let second = SqliteStore::open(&path, clock.clone()).await.unwrap();
        second
            .insert("k", vec![7], None, Expiration::Never)
            .await
            .unwrap();

        first.dispose().await.unwrap();

        // the sibling sees the disposal, not a closed-pool storage error
        assert!(matches!(second.get("k").await, Err(Error::Disposed)));
        assert!(matches!(
            second.insert("k", vec![8], None, Expiration::Never).await,
            Err(Error::Disposed)
        ));
        second.dispose().await.unwrap();

        // a fresh open on the same path starts clean and sees durable data
        let reopened = SqliteStore::open(&path, clock).await.unwrap();
        assert_eq!(reopened.get("k").await.unwrap(), vec![7]);
        reopened.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn expired_entry_reads_as_missing_and_is_deleted() {
        let t = make_store().await;
        t.store
            .insert(
                "k",
                vec![1],
                Some("T"),
                Expiration::After(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        t.clock.advance(Duration::from_secs(61));
        assert!(t.store.get("k").await.unwrap_err().is_key_not_found());
        assert!(t.store.get_all_keys(None).await.unwrap().is_empty());
        t.store.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn get_many_skips_absent_and_expired() {
        let t = make_store().await;
        t.store
            .insert("live", vec![1], None, Expiration::Never)
            .await
            .unwrap();
        t.store
            .insert(
                "stale",
                vec![2],
                None,
                Expiration::After(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        t.clock.advance(Duration::from_secs(2));

        let keys = vec!["live".to_owned(), "stale".to_owned(), "gone".to_owned()];
        let found = t.store.get_many(&keys).await.unwrap();
        assert_eq!(found, vec![("live".to_owned(), vec![1])]);
        t.store.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn insert_many_writes_the_whole_batch() {
        let t = make_store().await;
        t.store
            .insert_many(
                vec![("a".to_owned(), vec![1]), ("b".to_owned(), vec![2])],
                Some("T"),
                Expiration::Never,
            )
            .await
            .unwrap();

        let mut keys = t.store.get_all_keys(Some("T")).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
        t.store.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn type_scoped_invalidate_all_leaves_other_rows() {
        let t = make_store().await;
        t.store
            .insert("a", vec![1], Some("A"), Expiration::Never)
            .await
            .unwrap();
        t.store
            .insert("b", vec![2], Some("B"), Expiration::Never)
            .await
            .unwrap();
        t.store
            .insert("raw", vec![3], None, Expiration::Never)
            .await
            .unwrap();

        t.store.invalidate_all(Some("A")).await.unwrap();

        assert!(t.store.get("a").await.unwrap_err().is_key_not_found());
        assert_eq!(t.store.get("b").await.unwrap(), vec![2]);
        assert_eq!(t.store.get("raw").await.unwrap(), vec![3]);
        t.store.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn update_expiration_extends_lifetime() {
        let t = make_store().await;
        t.store
            .insert(
                "extend",
                vec![1, 2],
                None,
                Expiration::After(Duration::from_millis(600)),
            )
            .await
            .unwrap();

        t.clock.advance(Duration::from_millis(200));
        t.store
            .update_expiration("extend", Expiration::After(Duration::from_millis(700)))
            .await
            .unwrap();

        t.clock.advance(Duration::from_millis(700));
        assert_eq!(t.store.get("extend").await.unwrap(), vec![1, 2]);

        t.clock.advance(Duration::from_millis(300));
        assert!(t.store.get("extend").await.unwrap_err().is_key_not_found());
        t.store.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn vacuum_removes_expired_rows_and_keeps_live_ones() {
        let t = make_store().await;
        t.store
            .insert(
                "stale",
                vec![0; 4096],
                None,
                Expiration::After(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        t.store
            .insert("keep", vec![2], None, Expiration::Never)
            .await
            .unwrap();

        t.clock.advance(Duration::from_secs(5));
        t.store.vacuum().await.unwrap();

        assert_eq!(t.store.get_all_keys(None).await.unwrap(), vec!["keep"]);
        assert_eq!(t.store.get("keep").await.unwrap(), vec![2]);
        t.store.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn disposed_store_fails_every_operation() {
        let t = make_store().await;
        t.store.dispose().await.unwrap();
        t.store.dispose().await.unwrap();

        assert!(matches!(
            t.store.insert("k", vec![1], None, Expiration::Never).await,
            Err(Error::Disposed)
        ));
        assert!(matches!(t.store.get("k").await, Err(Error::Disposed)));
        assert!(matches!(t.store.flush().await, Err(Error::Disposed)));
        assert!(matches!(t.store.vacuum().await, Err(Error::Disposed)));
    }

    #[tokio::test]
    async fn empty_key_is_rejected_and_whitespace_accepted() {
        let t = make_store().await;
        assert!(matches!(
            t.store.insert("", vec![1], None, Expiration::Never).await,
            Err(Error::ArgumentInvalid(_))
        ));
        t.store
            .insert("  ", vec![9], None, Expiration::Never)
            .await
            .unwrap();
        assert_eq!(t.store.get("  ").await.unwrap(), vec![9]);
        t.store.dispose().await.unwrap();
    }
}
