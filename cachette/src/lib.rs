//! Cachette is an asynchronous, typed, expiring blob cache. It stores byte
//! sequences under string keys with per-entry expiration, layers a serde
//! based typed API on top, and ships the coordination patterns applications
//! build around a cache: request coalescing, get-or-fetch, stale-then-fresh
//! refresh, and HTTP download-through-cache.
//!
//! ## Features
//!
//! * **Pluggable storage** — an in-memory store for tests and
//!   low-ceremony use, a durable SQLite-backed store, and an encrypted
//!   variant that seals values at rest behind a password.
//! * **Typed layer** — [`ObjectCache`] serializes values to JSON or BSON,
//!   tags entries with their Rust type for type-scoped enumeration and
//!   invalidation, and distinguishes a cached explicit null from a missing
//!   key.
//! * **Time under test control** — every store takes a [`Clock`];
//!   [`ManualClock`] drives expiration in tests without wall-clock sleeps.
//! * **Coordination built in** — concurrent fetches of one key share a
//!   single producer, and
//!   [`get_and_fetch_latest`](ObjectCache::get_and_fetch_latest) streams the
//!   cached value followed by the freshly fetched one.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use cachette::{Expiration, MemoryStore, ObjectCache, Serializer, SystemClock};
//!
//! # #[tokio::main]
//! # async fn main() -> cachette::Result<()> {
//! let store = Arc::new(MemoryStore::new(Arc::new(SystemClock)));
//! let cache = ObjectCache::new(store, Serializer::json());
//!
//! // fetched once, then served from the cache
//! let release = cache
//!     .get_or_fetch_object(
//!         "release:latest",
//!         || async { Ok("1.4.2".to_owned()) },
//!         Expiration::After(Duration::from_secs(600)),
//!     )
//!     .await?;
//! assert_eq!(release, Some("1.4.2".to_owned()));
//! # Ok(())
//! # }
//! ```
//!
//! For durable storage, open a [`SqliteStore`] (or an [`EncryptedStore`])
//! instead of the memory store; the rest of the API is identical.

#![warn(missing_docs, rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod clock;
pub mod coalesce;
mod config;
mod error;
mod fetch;
#[cfg(feature = "http")]
pub mod http;
pub mod image;
pub mod secure;
mod serialize;
pub mod store;
mod typed;

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::coalesce::RequestCoalescer;
pub use crate::config::{DateTimeKind, Expiration};
pub use crate::error::{Error, Result};
pub use crate::fetch::FetchLatestOptions;
#[cfg(feature = "http")]
pub use crate::http::{DownloadRequest, HttpService};
pub use crate::image::BitmapLoader;
pub use crate::secure::Login;
pub use crate::serialize::{Format, Serializer};
#[cfg(feature = "encrypted")]
pub use crate::store::encrypted::EncryptedStore;
pub use crate::store::memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use crate::store::sqlite::SqliteStore;
pub use crate::store::{BlobStore, CacheEntry};
pub use crate::typed::ObjectCache;
