//! In-memory blob store.
//!
//! A thread-safe, process-local [`BlobStore`] backed by a mutex-guarded map
//! and a secondary type index. Expired entries are deleted lazily by the read
//! that discovers them and in bulk by [`vacuum`](BlobStore::vacuum).
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use cachette::{BlobStore, Expiration, MemoryStore, SystemClock};
//!
//! # #[tokio::main]
//! # async fn main() -> cachette::Result<()> {
//! let store = MemoryStore::new(Arc::new(SystemClock));
//! store
//!     .insert("greeting", b"hello".to_vec(), None, Expiration::Never)
//!     .await?;
//! assert_eq!(store.get("greeting").await?, b"hello");
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::config::{self, Expiration};
use crate::error::{Error, Result};
use crate::store::{BlobStore, CacheEntry, ensure_valid_key};

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    type_tag: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, StoredValue>,
    type_index: HashMap<String, HashSet<String>>,
    disposed: bool,
}

impl State {
    fn guard(&self) -> Result<()> {
        if self.disposed {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    fn attach_index(&mut self, key: &str, type_tag: &str) {
        self.type_index
            .entry(type_tag.to_owned())
            .or_default()
            .insert(key.to_owned());
    }

    fn detach_index(&mut self, key: &str, type_tag: &str) {
        if let Some(bucket) = self.type_index.get_mut(type_tag) {
            bucket.remove(key);
            if bucket.is_empty() {
                self.type_index.remove(type_tag);
            }
        }
    }

    fn upsert(&mut self, key: String, stored: StoredValue) {
        let old_tag = self.entries.get(&key).and_then(|old| old.type_tag.clone());
        if let Some(old_tag) = old_tag {
            self.detach_index(&key, &old_tag);
        }
        if let Some(tag) = stored.type_tag.clone() {
            self.attach_index(&key, &tag);
        }
        self.entries.insert(key, stored);
    }

    fn remove(&mut self, key: &str) {
        if let Some(stored) = self.entries.remove(key)
            && let Some(tag) = stored.type_tag
        {
            self.detach_index(key, &tag);
        }
    }

    /// Drops the entry when its deadline has passed, and reports whether it
    /// is live.
    fn prune_if_expired(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        match self.entries.get(key) {
            Some(stored) if config::is_expired(stored.expires_at, now) => {
                self.remove(key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}

/// A process-local [`BlobStore`] backed by a mutex-guarded `HashMap`.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Creates an empty store stamping entries with `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(crate::clock::SystemClock))
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryStore {
    async fn insert(
        &self,
        key: &str,
        value: Vec<u8>,
        type_tag: Option<&str>,
        expiration: Expiration,
    ) -> Result<()> {
        ensure_valid_key(key)?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.guard()?;
        state.upsert(
            key.to_owned(),
            StoredValue {
                value,
                type_tag: type_tag.map(str::to_owned),
                created_at: now,
                expires_at: expiration.resolve(now),
            },
        );
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
        let now = self.clock.now();
        let expires_at = expiration.resolve(now);
        let mut state = self.state.lock().await;
        state.guard()?;
        for (key, value) in pairs {
            state.upsert(
                key,
                StoredValue {
                    value,
                    type_tag: type_tag.map(str::to_owned),
                    created_at: now,
                    expires_at,
                },
            );
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        ensure_valid_key(key)?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.guard()?;
        if !state.prune_if_expired(key, now) {
            return Err(Error::key_not_found(key));
        }
        Ok(state.entries[key].value.clone())
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<(String, Vec<u8>)>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.guard()?;
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            if state.prune_if_expired(key, now) {
                found.push((key.clone(), state.entries[key].value.clone()));
            }
        }
        Ok(found)
    }

    async fn get_all(&self, type_tag: &str) -> Result<Vec<CacheEntry>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.guard()?;
        let keys: Vec<String> = state
            .type_index
            .get(type_tag)
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default();

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if state.prune_if_expired(&key, now) {
                let stored = &state.entries[&key];
                entries.push(CacheEntry {
                    key,
                    value: stored.value.clone(),
                    type_tag: stored.type_tag.clone(),
                    created_at: stored.created_at,
                    expires_at: stored.expires_at,
                });
            }
        }
        Ok(entries)
    }

    async fn get_all_keys(&self, type_tag: Option<&str>) -> Result<Vec<String>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.guard()?;
        let candidates: Vec<String> = match type_tag {
            Some(tag) => state
                .type_index
                .get(tag)
                .map(|bucket| bucket.iter().cloned().collect())
                .unwrap_or_default(),
            None => state.entries.keys().cloned().collect(),
        };

        let mut keys = Vec::with_capacity(candidates.len());
        for key in candidates {
            if state.prune_if_expired(&key, now) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn get_created_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        ensure_valid_key(key)?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.guard()?;
        if !state.prune_if_expired(key, now) {
            return Ok(None);
        }
        Ok(Some(state.entries[key].created_at))
    }

    async fn update_expiration(&self, key: &str, expiration: Expiration) -> Result<()> {
        ensure_valid_key(key)?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.guard()?;
        if !state.prune_if_expired(key, now) {
            return Err(Error::key_not_found(key));
        }
        let expires_at = expiration.resolve(now);
        if let Some(stored) = state.entries.get_mut(key) {
            stored.expires_at = expires_at;
        }
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        ensure_valid_key(key)?;
        let mut state = self.state.lock().await;
        state.guard()?;
        state.remove(key);
        Ok(())
    }

    async fn invalidate_many(&self, keys: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.guard()?;
        for key in keys {
            state.remove(key);
        }
        Ok(())
    }

    async fn invalidate_all(&self, type_tag: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.guard()?;
        match type_tag {
            Some(tag) => {
                let keys: Vec<String> = state
                    .type_index
                    .remove(tag)
                    .map(|bucket| bucket.into_iter().collect())
                    .unwrap_or_default();
                for key in keys {
                    state.entries.remove(&key);
                }
            }
            None => {
                state.entries.clear();
                state.type_index.clear();
            }
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.state.lock().await.guard()
    }

    async fn vacuum(&self) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.guard()?;
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, stored)| config::is_expired(stored.expires_at, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            state.remove(&key);
        }
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.disposed {
            return Ok(());
        }
        state.disposed = true;
        state.entries.clear();
        state.type_index.clear();
        Ok(())
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;

    fn make_store() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (MemoryStore::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let (store, _) = make_store();
        store
            .insert("k", vec![1, 2, 3], None, Expiration::Never)
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn get_missing_key_fails() {
        let (store, _) = make_store();
        let err = store.get("missing").await.unwrap_err();
        assert!(err.is_key_not_found());
    }

    #[tokio::test]
    async fn empty_key_is_rejected_before_touching_state() {
        let (store, _) = make_store();
        let err = store
            .insert("", vec![1], None, Expiration::Never)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArgumentInvalid(_)));
        assert!(store.get_all_keys(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn whitespace_key_is_accepted() {
        let (store, _) = make_store();
        store
            .insert("  ", vec![9], None, Expiration::Never)
            .await
            .unwrap();
        assert_eq!(store.get("  ").await.unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn expired_entry_reads_as_missing_and_is_pruned() {
        let (store, clock) = make_store();
        store
            .insert(
                "k",
                vec![1],
                None,
                Expiration::After(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        clock.advance(Duration::from_secs(61));
        assert!(store.get("k").await.unwrap_err().is_key_not_found());
        // pruned by the failed read, not only hidden
        assert!(store.get_all_keys(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overwrite_moves_type_index_bucket() {
        let (store, _) = make_store();
        store
            .insert("k", vec![1], Some("A"), Expiration::Never)
            .await
            .unwrap();
        store
            .insert("k", vec![2], Some("B"), Expiration::Never)
            .await
            .unwrap();

        assert!(store.get_all("A").await.unwrap().is_empty());
        let entries = store.get_all("B").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, vec![2]);
    }

    #[tokio::test]
    async fn get_many_skips_absent_and_expired() {
        let (store, clock) = make_store();
        store
            .insert("live", vec![1], None, Expiration::Never)
            .await
            .unwrap();
        store
            .insert(
                "stale",
                vec![2],
                None,
                Expiration::After(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));

        let keys = vec!["live".to_owned(), "stale".to_owned(), "gone".to_owned()];
        let found = store.get_many(&keys).await.unwrap();
        assert_eq!(found, vec![("live".to_owned(), vec![1])]);
    }

    #[tokio::test]
    async fn insert_many_inserts_every_pair() {
        let (store, _) = make_store();
        store
            .insert_many(
                vec![("a".to_owned(), vec![1]), ("b".to_owned(), vec![2])],
                Some("T"),
                Expiration::Never,
            )
            .await
            .unwrap();

        let mut keys = store.get_all_keys(Some("T")).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn insert_many_rejects_bad_keys_without_partial_insert() {
        let (store, _) = make_store();
        let err = store
            .insert_many(
                vec![("a".to_owned(), vec![1]), (String::new(), vec![2])],
                None,
                Expiration::Never,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArgumentInvalid(_)));
        assert!(store.get_all_keys(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalidate_many_ignores_absent_keys() {
        let (store, _) = make_store();
        store
            .insert("a", vec![1], None, Expiration::Never)
            .await
            .unwrap();
        store
            .insert("b", vec![2], None, Expiration::Never)
            .await
            .unwrap();

        let keys = vec!["a".to_owned(), "never-existed".to_owned()];
        store.invalidate_many(&keys).await.unwrap();

        assert!(store.get("a").await.unwrap_err().is_key_not_found());
        assert_eq!(store.get("b").await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn invalidate_all_with_tag_leaves_other_types_alone() {
        let (store, _) = make_store();
        store
            .insert("a", vec![1], Some("A"), Expiration::Never)
            .await
            .unwrap();
        store
            .insert("b", vec![2], Some("B"), Expiration::Never)
            .await
            .unwrap();
        store
            .insert("raw", vec![3], None, Expiration::Never)
            .await
            .unwrap();

        store.invalidate_all(Some("A")).await.unwrap();

        assert!(store.get("a").await.unwrap_err().is_key_not_found());
        assert_eq!(store.get("b").await.unwrap(), vec![2]);
        assert_eq!(store.get("raw").await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn update_expiration_extends_lifetime() {
        let (store, clock) = make_store();
        store
            .insert(
                "extend",
                vec![1, 2],
                None,
                Expiration::After(Duration::from_millis(600)),
            )
            .await
            .unwrap();

        clock.advance(Duration::from_millis(200));
        store
            .update_expiration("extend", Expiration::After(Duration::from_millis(700)))
            .await
            .unwrap();

        // past the original deadline, still present
        clock.advance(Duration::from_millis(700));
        assert_eq!(store.get("extend").await.unwrap(), vec![1, 2]);

        // past the new deadline, gone
        clock.advance(Duration::from_millis(300));
        assert!(store.get("extend").await.unwrap_err().is_key_not_found());
    }

    #[tokio::test]
    async fn update_expiration_on_missing_key_fails() {
        let (store, _) = make_store();
        let err = store
            .update_expiration("nope", Expiration::Never)
            .await
            .unwrap_err();
        assert!(err.is_key_not_found());
    }

    #[tokio::test]
    async fn vacuum_removes_only_expired_entries() {
        let (store, clock) = make_store();
        store
            .insert(
                "stale",
                vec![1],
                Some("T"),
                Expiration::After(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        store
            .insert("keep", vec![2], Some("T"), Expiration::Never)
            .await
            .unwrap();

        clock.advance(Duration::from_secs(5));
        store.vacuum().await.unwrap();

        assert_eq!(store.get_all_keys(None).await.unwrap(), vec!["keep"]);
        let entries = store.get_all("T").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "keep");
    }

    #[tokio::test]
    async fn disposed_store_fails_every_operation() {
        let (store, _) = make_store();
        store
            .insert("k", vec![1], None, Expiration::Never)
            .await
            .unwrap();
        store.dispose().await.unwrap();
        store.dispose().await.unwrap();

        assert!(matches!(
            store.insert("k", vec![1], None, Expiration::Never).await,
            Err(Error::Disposed)
        ));
        assert!(matches!(store.get("k").await, Err(Error::Disposed)));
        assert!(matches!(store.get_all_keys(None).await, Err(Error::Disposed)));
        assert!(matches!(store.invalidate("k").await, Err(Error::Disposed)));
        assert!(matches!(store.flush().await, Err(Error::Disposed)));
        assert!(matches!(store.vacuum().await, Err(Error::Disposed)));
    }

    #[tokio::test]
    async fn created_at_comes_from_the_injected_clock() {
        let (store, clock) = make_store();
        let stamped = clock.now();
        store
            .insert("k", vec![1], None, Expiration::Never)
            .await
            .unwrap();
        assert_eq!(store.get_created_at("k").await.unwrap(), Some(stamped));
        assert_eq!(store.get_created_at("missing").await.unwrap(), None);
    }
}
