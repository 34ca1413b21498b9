//! In-flight request deduplication.
//!
//! A [`RequestCoalescer`] maps keys to shared, multicast productions so that
//! concurrent fetches of the same key run the underlying work exactly once.
//! Entries are removed when their production completes (successfully or not),
//! and eagerly by [`remove`](RequestCoalescer::remove) when the typed layer
//! invalidates a key, so a fetch that follows an invalidation never joins a
//! stale producer.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};

use crate::error::{Error, Result};

/// The output of a coalesced production. Errors are shared between all
/// concurrent callers, hence the [`Arc`].
pub type SharedResult = std::result::Result<Vec<u8>, Arc<Error>>;

/// A cloneable handle to an in-flight (or just-completed) production.
///
/// Awaiting the handle multicasts a single production run to all subscribers
/// and replays the completed value to late ones.
pub type SharedProduction = Shared<BoxFuture<'static, SharedResult>>;

#[derive(Clone)]
struct InFlight {
    generation: u64,
    production: SharedProduction,
}

/// A map of `key → in-flight shared production` used to deduplicate
/// concurrent fetches.
#[derive(Default)]
pub struct RequestCoalescer {
    inflight: Mutex<HashMap<String, InFlight>>,
    next_generation: AtomicU64,
}

impl RequestCoalescer {
    /// Creates an empty coalescer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the production currently in flight for `key`, or installs a
    /// new one built by `factory`.
    ///
    /// The factory is only invoked when no production is in flight, so
    /// concurrent callers share exactly one run of the underlying work. The
    /// entry removes itself once the production completes; an entry replaced
    /// via [`remove`](Self::remove) while still running is left untouched by
    /// the old production's cleanup.
    pub fn get_or_create<F, Fut>(self: &Arc<Self>, key: &str, factory: F) -> SharedProduction
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>> + Send + 'static,
    {
        let mut inflight = self.lock();
        if let Some(existing) = inflight.get(key) {
            tracing::trace!(key, "joining in-flight request");
            return existing.production.clone();
        }

        tracing::trace!(key, "starting shared request");
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let future = factory();
        let coalescer = Arc::downgrade(self);
        let owned_key = key.to_owned();
        let production: SharedProduction = async move {
            let result = future.await.map_err(Arc::new);
            if let Some(coalescer) = coalescer.upgrade() {
                coalescer.remove_generation(&owned_key, generation);
            }
            result
        }
        .boxed()
        .shared();

        inflight.insert(
            key.to_owned(),
            InFlight {
                generation,
                production: production.clone(),
            },
        );
        production
    }

    /// Drops the in-flight entry for `key`, if any. The next
    /// [`get_or_create`](Self::get_or_create) re-enters its factory.
    pub fn remove(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Empties the map.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// The number of productions currently in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no production is currently in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn remove_generation(&self, key: &str, generation: u64) {
        let mut inflight = self.lock();
        if inflight
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
        {
            inflight.remove(key);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for RequestCoalescer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("in_flight", &self.len())
            .finish()
    }
}
