//! The typed object layer.
//!
//! [`ObjectCache`] wraps any [`BlobStore`] with serde-based encoding, key
//! namespacing by type, and an explicit-null convention. Values are tagged
//! with the fully-qualified name of their Rust type, which scopes
//! [`get_all_objects`](ObjectCache::get_all_objects) and
//! [`invalidate_all_objects`](ObjectCache::invalidate_all_objects) to one
//! type without affecting any other.
//!
//! # The null-value marker
//!
//! `insert_object(key, None, ..)` stores an empty byte sequence, and
//! [`get_object`](ObjectCache::get_object) maps an empty stored value back to
//! `Ok(None)`. A missing key is a different outcome: it fails with
//! [`Error::KeyNotFound`](crate::Error::KeyNotFound). This convention lives
//! entirely in this layer; byte-level stores treat empty values as ordinary
//! data.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use cachette::{Expiration, MemoryStore, ObjectCache, Serializer, SystemClock};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct User {
//!     id: u32,
//!     name: String,
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> cachette::Result<()> {
//! let store = Arc::new(MemoryStore::new(Arc::new(SystemClock)));
//! let cache = ObjectCache::new(store, Serializer::json());
//!
//! let user = User { id: 7, name: "Ada".to_owned() };
//! cache.insert_object("user:7", Some(&user), Expiration::Never).await?;
//!
//! let cached: Option<User> = cache.get_object("user:7").await?;
//! assert_eq!(cached, Some(user));
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::coalesce::RequestCoalescer;
use crate::config::Expiration;
use crate::error::{Error, Result};
use crate::serialize::compat::{self, SniffedFormat};
use crate::serialize::{Format, Serializer};
use crate::store::{BlobStore, ensure_valid_key, type_prefixed_key};

/// A typed cache over a byte-level [`BlobStore`].
///
/// Cloning is cheap and clones share the underlying store and in-flight
/// request map.
#[derive(Clone)]
pub struct ObjectCache {
    store: Arc<dyn BlobStore>,
    serializer: Serializer,
    coalescer: Arc<RequestCoalescer>,
}

impl ObjectCache {
    /// Creates a typed cache over `store`, encoding values with
    /// `serializer`.
    #[must_use]
    pub fn new(store: Arc<dyn BlobStore>, serializer: Serializer) -> Self {
        Self {
            store,
            serializer,
            coalescer: Arc::new(RequestCoalescer::new()),
        }
    }

    /// The underlying byte-level store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// The serializer encoding this cache's values.
    #[must_use]
    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// The in-flight request map shared by this cache's fetch operations.
    #[must_use]
    pub fn coalescer(&self) -> &Arc<RequestCoalescer> {
        &self.coalescer
    }

    /// The type tag values of type `T` are stored under.
    #[must_use]
    pub fn type_tag_of<T>() -> &'static str {
        std::any::type_name::<T>()
    }

    /// Serializes `value` and stores it under `key`, tagged with `T`'s type.
    /// `None` stores the explicit-null marker.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ArgumentInvalid`] on an empty key before any I/O,
    /// and with [`Error::Serialization`] when the value cannot be encoded.
    pub async fn insert_object<T: Serialize>(
        &self,
        key: &str,
        value: Option<&T>,
        expiration: Expiration,
    ) -> Result<()> {
        ensure_valid_key(key)?;
        let bytes = match value {
            None => Vec::new(),
            Some(value) => self
                .serializer
                .to_bytes(value)
                .map_err(|err| err.with_key(key))?,
        };
        self.store
            .insert(key, bytes, Some(Self::type_tag_of::<T>()), expiration)
            .await
    }

    /// Serializes and stores a batch of values in one atomic insert, all
    /// tagged with `T`'s type.
    ///
    /// The whole batch is encoded before anything is written, so an encoding
    /// failure leaves the store untouched.
    pub async fn insert_objects<T: Serialize>(
        &self,
        pairs: &[(String, T)],
        expiration: Expiration,
    ) -> Result<()> {
        let mut encoded = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            ensure_valid_key(key)?;
            let bytes = self
                .serializer
                .to_bytes(value)
                .map_err(|err| err.with_key(key))?;
            encoded.push((key.clone(), bytes));
        }
        self.store
            .insert_many(encoded, Some(Self::type_tag_of::<T>()), expiration)
            .await
    }

    /// Reads and deserializes the value stored under `key`.
    ///
    /// The lookup probes the raw key first and the type-prefixed key
    /// (`<type>___<key>`) second. Stored bytes that fail to decode under this
    /// cache's serializer are re-tried with the sniffed alternate format, so
    /// values written under the other wire format remain readable.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::KeyNotFound`] when neither key form holds a live
    /// entry, and with [`Error::Serialization`] when the bytes decode under
    /// no known format.
    pub async fn get_object<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        ensure_valid_key(key)?;
        let bytes = self.read_probing::<T>(key).await?;
        self.decode(&bytes, key)
    }

    /// Reads and deserializes every live value tagged with `T`'s type,
    /// dropping explicit nulls.
    pub async fn get_all_objects<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        let entries = self.store.get_all(Self::type_tag_of::<T>()).await?;
        let mut objects = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(object) = self.decode::<T>(&entry.value, &entry.key)? {
                objects.push(object);
            }
        }
        Ok(objects)
    }

    /// Whether a live object (or explicit null) is stored under `key`,
    /// probing both key forms.
    pub async fn contains_key<T>(&self, key: &str) -> Result<bool> {
        Ok(self.get_object_created_at::<T>(key).await?.is_some())
    }

    /// Returns the insertion time of the object under `key`, probing both
    /// key forms, or `None` when it is absent.
    pub async fn get_object_created_at<T>(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        ensure_valid_key(key)?;
        if let Some(created_at) = self.store.get_created_at(key).await? {
            return Ok(Some(created_at));
        }
        let prefixed = type_prefixed_key(Self::type_tag_of::<T>(), key);
        self.store.get_created_at(&prefixed).await
    }

    /// Removes the object under `key` (both key forms) and drops any
    /// in-flight fetch for it, so a later get-or-fetch re-enters its factory
    /// instead of joining a stale producer.
    pub async fn invalidate_object<T>(&self, key: &str) -> Result<()> {
        ensure_valid_key(key)?;
        self.coalescer.remove(key);
        self.store.invalidate(key).await?;
        let prefixed = type_prefixed_key(Self::type_tag_of::<T>(), key);
        self.store.invalidate(&prefixed).await
    }

    /// Removes every object tagged with `T`'s type, leaving other types and
    /// untyped entries untouched, and drops their in-flight fetches.
    pub async fn invalidate_all_objects<T>(&self) -> Result<()> {
        let tag = Self::type_tag_of::<T>();
        for key in self.store.get_all_keys(Some(tag)).await? {
            self.coalescer.remove(&key);
        }
        self.store.invalidate_all(Some(tag)).await
    }

    async fn read_probing<T>(&self, key: &str) -> Result<Vec<u8>> {
        match self.store.get(key).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.is_key_not_found() => {
                let prefixed = type_prefixed_key(Self::type_tag_of::<T>(), key);
                match self.store.get(&prefixed).await {
                    Ok(bytes) => Ok(bytes),
                    // report the user's key, not the internal form
                    Err(err) if err.is_key_not_found() => Err(Error::key_not_found(key)),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn decode<T: DeserializeOwned>(&self, bytes: &[u8], key: &str) -> Result<Option<T>> {
        if bytes.is_empty() {
            return Ok(None);
        }
        match self.serializer.from_bytes(bytes) {
            Ok(value) => Ok(Some(value)),
            Err(primary) => {
                let alternate = match compat::sniff(bytes) {
                    SniffedFormat::Json if self.serializer.format() != Format::Json => {
                        Some(Format::Json)
                    }
                    SniffedFormat::Bson if self.serializer.format() != Format::Bson => {
                        Some(Format::Bson)
                    }
                    _ => None,
                };
                let Some(format) = alternate else {
                    return Err(primary.with_key(key));
                };
                match self.serializer.with_format(format).from_bytes(bytes) {
                    Ok(value) => Ok(Some(value)),
                    Err(_) => Err(primary.with_key(key)),
                }
            }
        }
    }
}

impl fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCache")
            .field("store", &"<BlobStore>")
            .field("serializer", &self.serializer)
            .field("coalescer", &self.coalescer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::memory::MemoryStore;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct UserObject {
        name: String,
        bio: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Session {
        token: String,
    }

    fn user(name: &str) -> UserObject {
        UserObject {
            name: name.to_owned(),
            bio: format!("{name}'s bio"),
        }
    }

    fn make_cache() -> (ObjectCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        (ObjectCache::new(store, Serializer::json()), clock)
    }

    #[tokio::test]
    async fn object_roundtrip() {
        let (cache, _) = make_cache();
        cache
            .insert_object("u1", Some(&user("ada")), Expiration::Never)
            .await
            .unwrap();
        let cached: Option<UserObject> = cache.get_object("u1").await.unwrap();
        assert_eq!(cached, Some(user("ada")));
    }

    #[tokio::test]
    async fn missing_key_is_an_error_but_null_marker_is_not() {
        let (cache, _) = make_cache();

        let err = cache.get_object::<UserObject>("absent").await.unwrap_err();
        assert!(err.is_key_not_found());

        cache
            .insert_object::<UserObject>("explicit-null", None, Expiration::Never)
            .await
            .unwrap();
        let cached: Option<UserObject> = cache.get_object("explicit-null").await.unwrap();
        assert_eq!(cached, None);

        // the key still exists until it expires
        let keys = cache.store().get_all_keys(None).await.unwrap();
        assert_eq!(keys, vec!["explicit-null"]);
    }

    #[tokio::test]
    async fn empty_key_fails_before_io() {
        let (cache, _) = make_cache();
        let err = cache
            .insert_object("", Some(&user("x")), Expiration::Never)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArgumentInvalid(_)));
        assert!(matches!(
            cache.get_object::<UserObject>("").await.unwrap_err(),
            Error::ArgumentInvalid(_)
        ));
    }

    #[tokio::test]
    async fn type_isolation_on_invalidate_all() {
        let (cache, _) = make_cache();
        cache
            .insert_object("shared-key", Some(&user("ada")), Expiration::Never)
            .await
            .unwrap();
        cache
            .insert_object(
                "session",
                Some(&Session {
                    token: "t".to_owned(),
                }),
                Expiration::Never,
            )
            .await
            .unwrap();

        cache.invalidate_all_objects::<Session>().await.unwrap();

        let survivor: Option<UserObject> = cache.get_object("shared-key").await.unwrap();
        assert_eq!(survivor, Some(user("ada")));
        assert!(
            cache
                .get_object::<Session>("session")
                .await
                .unwrap_err()
                .is_key_not_found()
        );
    }

    #[tokio::test]
    async fn typed_read_accepts_untyped_entries() {
        let (cache, _) = make_cache();
        let bytes = Serializer::json().to_bytes(&user("ada")).unwrap();
        cache
            .store()
            .insert("raw", bytes, None, Expiration::Never)
            .await
            .unwrap();

        let cached: Option<UserObject> = cache.get_object("raw").await.unwrap();
        assert_eq!(cached, Some(user("ada")));
    }

    #[tokio::test]
    async fn read_probes_the_type_prefixed_key() {
        let (cache, _) = make_cache();
        let tag = ObjectCache::type_tag_of::<UserObject>();
        let prefixed = format!("{tag}___legacy");
        let bytes = Serializer::json().to_bytes(&user("ada")).unwrap();
        cache
            .store()
            .insert(&prefixed, bytes, Some(tag), Expiration::Never)
            .await
            .unwrap();

        let cached: Option<UserObject> = cache.get_object("legacy").await.unwrap();
        assert_eq!(cached, Some(user("ada")));

        // the reported miss uses the user's key, not the internal form
        let err = cache.get_object::<UserObject>("other").await.unwrap_err();
        assert_eq!(err.to_string(), "key not found: \"other\"");
    }

    #[tokio::test]
    async fn cross_format_read_through_sniffing() {
        let (cache, _) = make_cache();
        let bson_bytes = Serializer::bson().to_bytes(&user("ada")).unwrap();
        cache
            .store()
            .insert("binary", bson_bytes, None, Expiration::Never)
            .await
            .unwrap();

        // this cache decodes JSON; sniffing routes the read to BSON
        let cached: Option<UserObject> = cache.get_object("binary").await.unwrap();
        assert_eq!(cached, Some(user("ada")));
    }

    #[tokio::test]
    async fn undecodable_bytes_report_type_and_key() {
        let (cache, _) = make_cache();
        cache
            .store()
            .insert("garbled", vec![0xff, 0xfe, 0xfd], None, Expiration::Never)
            .await
            .unwrap();

        let err = cache.get_object::<UserObject>("garbled").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("UserObject"), "{message}");
        assert!(message.contains("garbled"), "{message}");
    }

    #[tokio::test]
    async fn expiration_applies_to_objects() {
        let (cache, clock) = make_cache();
        cache
            .insert_object(
                "u1",
                Some(&user("ada")),
                Expiration::After(Duration::from_secs(30)),
            )
            .await
            .unwrap();

        clock.advance(Duration::from_secs(31));
        assert!(
            cache
                .get_object::<UserObject>("u1")
                .await
                .unwrap_err()
                .is_key_not_found()
        );
    }

    #[tokio::test]
    async fn batch_insert_and_get_all() {
        let (cache, _) = make_cache();
        cache
            .insert_objects(
                &[
                    ("user1".to_owned(), user("ada")),
                    ("user2".to_owned(), user("grace")),
                ],
                Expiration::Never,
            )
            .await
            .unwrap();

        let mut all: Vec<UserObject> = cache.get_all_objects().await.unwrap();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(all, vec![user("ada"), user("grace")]);
    }

    #[tokio::test]
    async fn get_all_objects_drops_explicit_nulls() {
        let (cache, _) = make_cache();
        cache
            .insert_object("u1", Some(&user("ada")), Expiration::Never)
            .await
            .unwrap();
        cache
            .insert_object::<UserObject>("u2", None, Expiration::Never)
            .await
            .unwrap();

        let all: Vec<UserObject> = cache.get_all_objects().await.unwrap();
        assert_eq!(all, vec![user("ada")]);
    }

    #[tokio::test]
    async fn created_at_probes_both_key_forms() {
        let (cache, clock) = make_cache();
        let stamped = clock.now();
        cache
            .insert_object("u1", Some(&user("ada")), Expiration::Never)
            .await
            .unwrap();
        assert_eq!(
            cache.get_object_created_at::<UserObject>("u1").await.unwrap(),
            Some(stamped)
        );
        assert_eq!(
            cache
                .get_object_created_at::<UserObject>("missing")
                .await
                .unwrap(),
            None
        );
        assert!(cache.contains_key::<UserObject>("u1").await.unwrap());
        assert!(!cache.contains_key::<UserObject>("missing").await.unwrap());
    }
}
