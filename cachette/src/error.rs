//! Error types shared by every cache operation.
//!
//! All fallible APIs in this crate return [`Result`], whose error type is the
//! single [`Error`] enum defined here. Validation failures surface before the
//! first suspension point of an operation; everything else is reported on the
//! returned future or stream.

use std::sync::Arc;

use thiserror::Error;

/// Convenience alias for results returned by cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur when interacting with a cache.
///
/// # Examples
///
/// ```
/// use cachette::{Error, MemoryStore, SystemClock};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() {
/// use cachette::BlobStore;
///
/// let store = MemoryStore::new(Arc::new(SystemClock));
/// let err = store.get("missing").await.unwrap_err();
/// assert!(matches!(err, Error::KeyNotFound { .. }));
/// # }
/// ```
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A required input failed a structural check, such as an empty key.
    #[error("invalid argument: {0}")]
    ArgumentInvalid(String),

    /// The key is not present in the cache, or its entry has expired.
    #[error("key not found: {key:?}")]
    KeyNotFound {
        /// The key that was looked up.
        key: String,
    },

    /// The store has been disposed; no further operations are possible.
    #[error("cache store has been disposed")]
    Disposed,

    /// Encoding or decoding a value failed.
    #[error("serialization error for type `{type_name}`{}: {source}", key_suffix(.key.as_deref()))]
    Serialization {
        /// Fully-qualified name of the value type involved.
        type_name: &'static str,
        /// The cache key, when the failure happened during a keyed operation.
        key: Option<String>,
        /// The underlying encoder or decoder error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The persistent backend reported an I/O or integrity error.
    #[cfg(feature = "sqlite")]
    #[error("storage backend error: {0}")]
    Storage(#[from] sqlx::Error),

    /// An encrypted store was opened with a password that does not match the
    /// one it was created with.
    #[cfg(feature = "encrypted")]
    #[error("wrong password for encrypted store")]
    WrongPassword,

    /// Encrypting or decrypting a value failed.
    #[cfg(feature = "encrypted")]
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The HTTP transport failed before a response was received.
    #[cfg(feature = "http")]
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// The HTTP server answered with a non-success status; the response body
    /// is not cached in that case.
    #[cfg(feature = "http")]
    #[error("HTTP request failed with status {0}")]
    HttpStatus(reqwest::StatusCode),

    /// The operation was abandoned because it exceeded a caller-imposed
    /// deadline.
    #[error("operation timed out")]
    Timeout,

    /// An error produced by a coalesced request and shared between all of its
    /// concurrent callers.
    #[error(transparent)]
    Shared(Arc<Error>),
}

impl Error {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Error::ArgumentInvalid(message.into())
    }

    pub(crate) fn key_not_found(key: impl Into<String>) -> Self {
        Error::KeyNotFound { key: key.into() }
    }

    pub(crate) fn serialization<E>(type_name: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Serialization {
            type_name,
            key: None,
            source: Box::new(source),
        }
    }

    /// Attaches the cache key to a [`Error::Serialization`] that does not
    /// carry one yet. Other variants are returned unchanged.
    pub(crate) fn with_key(self, cache_key: &str) -> Self {
        match self {
            Error::Serialization {
                type_name,
                key: None,
                source,
            } => Error::Serialization {
                type_name,
                key: Some(cache_key.to_owned()),
                source,
            },
            other => other,
        }
    }

    /// Returns `true` if the error is a key miss, including a miss caused by
    /// expiration.
    #[must_use]
    pub fn is_key_not_found(&self) -> bool {
        match self {
            Error::KeyNotFound { .. } => true,
            Error::Shared(inner) => inner.is_key_not_found(),
            _ => false,
        }
    }
}

fn key_suffix(key: Option<&str>) -> String {
    match key {
        Some(key) => format!(" (key {key:?})"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_message_includes_type_and_key() {
        let source = serde_json::from_slice::<String>(b"not json").unwrap_err();
        let err = Error::serialization("alloc::string::String", source).with_key("user:1");

        let message = err.to_string();
        assert!(message.contains("alloc::string::String"), "{message}");
        assert!(message.contains("user:1"), "{message}");
    }

    #[test]
    fn with_key_does_not_overwrite_existing_key() {
        let source = serde_json::from_slice::<String>(b"not json").unwrap_err();
        let err = Error::serialization("alloc::string::String", source)
            .with_key("first")
            .with_key("second");

        assert!(err.to_string().contains("first"));
    }

    #[test]
    fn shared_errors_keep_the_miss_category() {
        let err = Error::Shared(Arc::new(Error::key_not_found("k")));
        assert!(err.is_key_not_found());
        assert_eq!(err.to_string(), "key not found: \"k\"");
    }
}
