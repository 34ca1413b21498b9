//! Coordination patterns over the typed layer: get-or-fetch with request
//! coalescing, and the stale-then-fresh `get_and_fetch_latest` stream.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::Expiration;
use crate::error::{Error, Result};
use crate::store::{BlobStore, ensure_valid_key, type_prefixed_key};
use crate::typed::ObjectCache;

/// Options for [`ObjectCache::get_and_fetch_latest`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use cachette::{Expiration, FetchLatestOptions};
///
/// let options: FetchLatestOptions<String> = FetchLatestOptions::new()
///     .expiration(Expiration::After(Duration::from_secs(600)))
///     .invalidate_on_error(true)
///     .cache_validation(|value: &String| !value.is_empty());
/// ```
pub struct FetchLatestOptions<T> {
    expiration: Expiration,
    invalidate_on_error: bool,
    fetch_predicate: Option<Arc<dyn Fn(DateTime<Utc>) -> bool + Send + Sync>>,
    cache_validation: Option<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
}

impl<T> FetchLatestOptions<T> {
    /// Default options: no expiration, no predicates, keep the cached value
    /// on a fetch error.
    #[must_use]
    pub fn new() -> Self {
        Self {
            expiration: Expiration::Never,
            invalidate_on_error: false,
            fetch_predicate: None,
            cache_validation: None,
        }
    }

    /// Expiration applied to the freshly fetched value.
    #[must_use]
    pub fn expiration(mut self, expiration: Expiration) -> Self {
        self.expiration = expiration;
        self
    }

    /// When `true`, a fetch failure invalidates the cached value before the
    /// error is propagated downstream.
    #[must_use]
    pub fn invalidate_on_error(mut self, invalidate: bool) -> Self {
        self.invalidate_on_error = invalidate;
        self
    }

    /// Decides, from the cached value's insertion time, whether a fetch
    /// should happen at all. Without a predicate a fetch always happens;
    /// with no cached value the predicate is not consulted.
    #[must_use]
    pub fn fetch_predicate(
        mut self,
        predicate: impl Fn(DateTime<Utc>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fetch_predicate = Some(Arc::new(predicate));
        self
    }

    /// Vets the freshly fetched value before it is cached. A rejected value
    /// is never cached and never replaces the old one; the stream emits
    /// `None` in its place.
    #[must_use]
    pub fn cache_validation(
        mut self,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.cache_validation = Some(Arc::new(predicate));
        self
    }
}

impl<T> Default for FetchLatestOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for FetchLatestOptions<T> {
    fn clone(&self) -> Self {
        Self {
            expiration: self.expiration,
            invalidate_on_error: self.invalidate_on_error,
            fetch_predicate: self.fetch_predicate.clone(),
            cache_validation: self.cache_validation.clone(),
        }
    }
}

impl<T> fmt::Debug for FetchLatestOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchLatestOptions")
            .field("expiration", &self.expiration)
            .field("invalidate_on_error", &self.invalidate_on_error)
            .field("fetch_predicate", &self.fetch_predicate.is_some())
            .field("cache_validation", &self.cache_validation.is_some())
            .finish()
    }
}

impl ObjectCache {
    /// Returns the cached object under `key`, or fetches, caches, and
    /// returns it.
    ///
    /// A cache hit (including a cached explicit null) bypasses the request
    /// coalescer entirely. On a miss the fetch runs through the coalescer,
    /// so concurrent callers for the same key share a single fetch; the
    /// in-flight entry is cleared before a fetch error propagates, and the
    /// next call re-enters the factory.
    pub async fn get_or_fetch_object<T, F, Fut>(
        &self,
        key: &str,
        fetch: F,
        expiration: Expiration,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        ensure_valid_key(key)?;
        if let Some(cached) = self.get_object_if_present::<T>(key).await? {
            return Ok(cached);
        }

        let production = {
            let store = Arc::clone(self.store());
            let serializer = self.serializer();
            let owned_key = key.to_owned();
            self.coalescer().get_or_create(key, move || async move {
                let value = fetch().await?;
                let bytes = serializer
                    .to_bytes(&value)
                    .map_err(|err| err.with_key(&owned_key))?;
                store
                    .insert(
                        &owned_key,
                        bytes.clone(),
                        Some(ObjectCache::type_tag_of::<T>()),
                        expiration,
                    )
                    .await?;
                Ok(bytes)
            })
        };

        let bytes = production.await.map_err(Error::Shared)?;
        self.decode(&bytes, key)
    }

    /// Returns the cached object under `key`, or builds one synchronously,
    /// caches, and returns it. Unlike
    /// [`get_or_fetch_object`](Self::get_or_fetch_object), the factory is
    /// not deduplicated.
    pub async fn get_or_create_object<T, F>(
        &self,
        key: &str,
        create: F,
        expiration: Expiration,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        ensure_valid_key(key)?;
        if let Some(cached) = self.get_object_if_present::<T>(key).await? {
            return Ok(cached);
        }
        let value = create();
        self.insert_object(key, Some(&value), expiration).await?;
        Ok(Some(value))
    }

    /// Emits the cached object under `key` (when one exists), then the
    /// freshly fetched one.
    ///
    /// The fetch is skipped when the options'
    /// [`fetch_predicate`](FetchLatestOptions::fetch_predicate) rejects the
    /// cached value's insertion time; it runs through the request coalescer,
    /// so concurrent streams for the same key share one fetch. On success
    /// the old value is invalidated and the new one cached under the
    /// options' expiration; a value rejected by
    /// [`cache_validation`](FetchLatestOptions::cache_validation) is never
    /// cached, and the stream emits `None` in its place. A fetch error first
    /// invalidates the key when
    /// [`invalidate_on_error`](FetchLatestOptions::invalidate_on_error) is
    /// set, then surfaces as the stream's final item.
    pub fn get_and_fetch_latest<T, F, Fut>(
        &self,
        key: &str,
        fetch: F,
        options: FetchLatestOptions<T>,
    ) -> impl Stream<Item = Result<Option<T>>> + Send + use<T, F, Fut>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let cache = self.clone();
        let key = key.to_owned();

        async_stream::try_stream! {
            ensure_valid_key(&key)?;

            let cached = cache.get_object_if_present::<T>(&key).await?;
            let created_at = match &cached {
                Some(_) => cache.get_object_created_at::<T>(&key).await?,
                None => None,
            };

            let should_fetch = match (&cached, &options.fetch_predicate, created_at) {
                (Some(_), Some(predicate), Some(created_at)) => predicate.as_ref()(created_at),
                // no cached value, no predicate, or the entry raced away
                // between the two reads
                _ => true,
            };

            if let Some(value) = cached {
                yield value;
            }
            if !should_fetch {
                return;
            }

            let production = {
                let store = Arc::clone(cache.store());
                let serializer = cache.serializer();
                let owned_key = key.clone();
                let expiration = options.expiration;
                let invalidate_on_error = options.invalidate_on_error;
                let validation = options.cache_validation.clone();
                cache.coalescer().get_or_create(&key, move || async move {
                    let tag = ObjectCache::type_tag_of::<T>();
                    let fetched = match fetch().await {
                        Ok(fetched) => fetched,
                        Err(err) => {
                            if invalidate_on_error {
                                if let Err(inv_err) =
                                    invalidate_both(&store, &owned_key, tag).await
                                {
                                    tracing::debug!(
                                        key = %owned_key,
                                        error = %inv_err,
                                        "invalidation after fetch failure failed"
                                    );
                                }
                            }
                            return Err(err);
                        }
                    };

                    if let Some(validation) = &validation {
                        if !validation.as_ref()(&fetched) {
                            tracing::debug!(key = %owned_key, "fetched value rejected by validation");
                            return Ok(Vec::new());
                        }
                    }

                    invalidate_both(&store, &owned_key, tag).await?;
                    let bytes = serializer
                        .to_bytes(&fetched)
                        .map_err(|err| err.with_key(&owned_key))?;
                    store.insert(&owned_key, bytes.clone(), Some(tag), expiration).await?;
                    Ok(bytes)
                })
            };

            let bytes = production.await.map_err(Error::Shared)?;
            let fresh = cache.decode::<T>(&bytes, &key)?;
            yield fresh;
        }
    }

    /// Reads the object under `key`, mapping a miss to `Ok(None)` instead of
    /// an error. The outer `Option` is presence, the inner one the
    /// explicit-null marker.
    async fn get_object_if_present<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<Option<T>>> {
        match self.get_object::<T>(key).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_key_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

async fn invalidate_both(store: &Arc<dyn BlobStore>, key: &str, tag: &str) -> Result<()> {
    store.invalidate(key).await?;
    store.invalidate(&type_prefixed_key(tag, key)).await
}
