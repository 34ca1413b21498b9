//! Byte-level cache store abstractions and implementations.
//!
//! This module defines the [`BlobStore`] trait implemented by the in-memory
//! and persistent backends, and the [`CacheEntry`] record they exchange. The
//! store layer is type-erased: values are byte sequences and the optional
//! type tag is an opaque string maintained as a secondary index. The generic
//! typed API lives one level up, in [`ObjectCache`](crate::ObjectCache).
//!
//! # Contract
//!
//! Every implementation upholds the same rules:
//!
//! - a read never returns an entry whose deadline has been reached; expired
//!   entries are lazily deleted on touch and removed in bulk by
//!   [`vacuum`](BlobStore::vacuum);
//! - inserting an existing key atomically overwrites the entry and moves it
//!   between type-index buckets as needed;
//! - [`insert_many`](BlobStore::insert_many) is all-or-nothing, while
//!   [`get_many`](BlobStore::get_many) skips absent or expired keys and
//!   [`invalidate_many`](BlobStore::invalidate_many) is best-effort;
//! - after [`dispose`](BlobStore::dispose), every operation fails with
//!   [`Error::Disposed`](crate::Error::Disposed);
//! - the empty key is rejected with
//!   [`Error::ArgumentInvalid`](crate::Error::ArgumentInvalid) before any
//!   state is touched; whitespace-only keys are accepted verbatim.

pub mod memory;
#[cfg(feature = "encrypted")]
pub mod encrypted;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::config::Expiration;
use crate::error::{Error, Result};

/// Separator between a type tag and the user key in the alternate,
/// type-prefixed key form.
pub(crate) const TYPE_KEY_SEPARATOR: &str = "___";

/// Builds the type-prefixed form of `key` for the alternate read path.
pub(crate) fn type_prefixed_key(type_tag: &str, key: &str) -> String {
    format!("{type_tag}{TYPE_KEY_SEPARATOR}{key}")
}

/// Rejects structurally invalid keys before any I/O happens.
pub(crate) fn ensure_valid_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_argument("cache key must not be empty"));
    }
    Ok(())
}

/// A single cached record as stored by a [`BlobStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// The key the entry is stored under.
    pub key: String,
    /// The raw value bytes. May be empty; the typed layer uses the empty
    /// sequence as its explicit-null marker, the store does not interpret it.
    pub value: Vec<u8>,
    /// Optional type tag maintained in the store's secondary index.
    pub type_tag: Option<String>,
    /// Insertion time, taken from the store's clock.
    pub created_at: DateTime<Utc>,
    /// Absolute deadline after which the entry is treated as absent.
    pub expires_at: Option<DateTime<Utc>>,
}

/// A generic asynchronous byte cache with per-entry expiration and a type
/// index.
///
/// All operations are asynchronous and report failures on the returned
/// future. Implementations are safe to share across tasks behind an
/// [`Arc`].
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Upserts a value, optionally tagging it for type-scoped operations.
    async fn insert(
        &self,
        key: &str,
        value: Vec<u8>,
        type_tag: Option<&str>,
        expiration: Expiration,
    ) -> Result<()>;

    /// Upserts a batch of values atomically: observers see all pairs or none.
    async fn insert_many(
        &self,
        pairs: Vec<(String, Vec<u8>)>,
        type_tag: Option<&str>,
        expiration: Expiration,
    ) -> Result<()>;

    /// Returns the live value for `key`, or
    /// [`Error::KeyNotFound`](crate::Error::KeyNotFound) when the key is
    /// absent or expired. An expired entry is deleted by this same call.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Returns the live `(key, value)` pairs for `keys`, skipping keys that
    /// are absent or expired.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<(String, Vec<u8>)>>;

    /// Returns every live entry tagged with `type_tag`.
    async fn get_all(&self, type_tag: &str) -> Result<Vec<CacheEntry>>;

    /// Returns every live key, or only the keys tagged with `type_tag` when
    /// one is given.
    async fn get_all_keys(&self, type_tag: Option<&str>) -> Result<Vec<String>>;

    /// Returns the insertion time of `key`, or `None` when the key is absent
    /// or expired.
    async fn get_created_at(&self, key: &str) -> Result<Option<DateTime<Utc>>>;

    /// Replaces the expiration deadline of an existing live entry.
    async fn update_expiration(&self, key: &str, expiration: Expiration) -> Result<()>;

    /// Removes `key`. Removing an absent key succeeds.
    async fn invalidate(&self, key: &str) -> Result<()>;

    /// Removes each of `keys`, ignoring keys that are already absent.
    async fn invalidate_many(&self, keys: &[String]) -> Result<()>;

    /// Removes every entry, or only the entries tagged with `type_tag` when
    /// one is given.
    async fn invalidate_all(&self, type_tag: Option<&str>) -> Result<()>;

    /// Forces outstanding buffered work to durable storage. A no-op for
    /// purely in-memory stores.
    async fn flush(&self) -> Result<()>;

    /// Removes every expired entry and reclaims backing-store space.
    async fn vacuum(&self) -> Result<()>;

    /// Disposes the store. Idempotent; subsequent operations fail with
    /// [`Error::Disposed`](crate::Error::Disposed).
    async fn dispose(&self) -> Result<()>;

    /// The clock stamping `created_at` and driving expiration decisions.
    fn clock(&self) -> Arc<dyn Clock>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_prefixed_key_joins_with_separator() {
        assert_eq!(type_prefixed_key("crate::User", "u1"), "crate::User___u1");
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(ensure_valid_key("").is_err());
        assert!(ensure_valid_key("  ").is_ok());
        assert!(ensure_valid_key("k").is_ok());
    }
}
