//! Bulk image helpers over a byte cache and an external bitmap loader.
//!
//! Decoding is delegated to a [`BitmapLoader`] implemented by the embedding
//! application (a GPU texture uploader, a CPU rasterizer, a test stub). The
//! helpers here only move bytes between the cache, the network, and the
//! loader, with the error policy the bulk operations need: per-item failures
//! are skipped, fallbacks decode on any error, and sizes come from the
//! loader.

use crate::error::{Error, Result};
use crate::store::{BlobStore, ensure_valid_key};

#[cfg(feature = "http")]
use crate::config::Expiration;
#[cfg(feature = "http")]
use crate::http::{DownloadRequest, HttpService};

/// Decodes cached bytes into the application's bitmap type.
#[async_trait::async_trait]
pub trait BitmapLoader: Send + Sync {
    /// The decoded bitmap handle.
    type Bitmap: Send;

    /// Decodes `bytes`, optionally scaling to the desired dimensions.
    async fn load(
        &self,
        bytes: &[u8],
        width: Option<u32>,
        height: Option<u32>,
    ) -> Result<Self::Bitmap>;

    /// Reports the intrinsic pixel size of the encoded image.
    async fn size(&self, bytes: &[u8]) -> Result<(u32, u32)>;
}

/// Loads the images cached under `keys`, skipping keys that are missing or
/// fail to decode.
pub async fn load_images<L: BitmapLoader>(
    store: &dyn BlobStore,
    loader: &L,
    keys: &[String],
    width: Option<u32>,
    height: Option<u32>,
) -> Vec<L::Bitmap> {
    let mut bitmaps = Vec::with_capacity(keys.len());
    for key in keys {
        let bytes = match store.get(key).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::debug!(%key, error = %err, "skipping unreadable image");
                continue;
            }
        };
        match loader.load(&bytes, width, height).await {
            Ok(bitmap) => bitmaps.push(bitmap),
            Err(err) => tracing::debug!(%key, error = %err, "skipping undecodable image"),
        }
    }
    bitmaps
}

/// Downloads each URL into the cache so later loads are hits. Per-URL
/// failures are logged and swallowed; the call completes once every URL has
/// been attempted.
#[cfg(feature = "http")]
pub async fn preload_images_from_urls(
    http: &HttpService,
    store: &dyn BlobStore,
    urls: &[String],
    expiration: Expiration,
) {
    for url in urls {
        let request = DownloadRequest::get(url).expiration(expiration);
        if let Err(err) = http.download_url(store, request).await {
            tracing::debug!(%url, error = %err, "image preload failed");
        }
    }
}

/// Loads the image under `key`, decoding `fallback` instead when the key is
/// missing, expired, or undecodable.
///
/// # Errors
///
/// Fails with [`Error::ArgumentInvalid`] when `fallback` is empty, and with
/// the loader's error when even the fallback does not decode.
pub async fn load_image_with_fallback<L: BitmapLoader>(
    store: &dyn BlobStore,
    loader: &L,
    key: &str,
    fallback: &[u8],
    width: Option<u32>,
    height: Option<u32>,
) -> Result<L::Bitmap> {
    if fallback.is_empty() {
        return Err(Error::invalid_argument("fallback image bytes must not be empty"));
    }
    ensure_valid_key(key)?;

    if let Ok(bytes) = store.get(key).await {
        if let Ok(bitmap) = loader.load(&bytes, width, height).await {
            return Ok(bitmap);
        }
        tracing::debug!(%key, "cached image failed to decode; using fallback");
    }
    loader.load(fallback, width, height).await
}

/// Downloads `url` through the cache and decodes it, decoding `fallback`
/// instead when the download or the decode fails.
#[cfg(feature = "http")]
pub async fn load_image_from_url_with_fallback<L: BitmapLoader>(
    http: &HttpService,
    store: &dyn BlobStore,
    loader: &L,
    url: &str,
    fallback: &[u8],
    width: Option<u32>,
    height: Option<u32>,
) -> Result<L::Bitmap> {
    if fallback.is_empty() {
        return Err(Error::invalid_argument("fallback image bytes must not be empty"));
    }

    match http.download_url(store, DownloadRequest::get(url)).await {
        Ok(bytes) => {
            if let Ok(bitmap) = loader.load(&bytes, width, height).await {
                return Ok(bitmap);
            }
            tracing::debug!(%url, "downloaded image failed to decode; using fallback");
        }
        Err(err) => tracing::debug!(%url, error = %err, "image download failed; using fallback"),
    }
    loader.load(fallback, width, height).await
}

/// Returns the intrinsic size of the image cached under `key`.
///
/// # Errors
///
/// Fails with [`Error::KeyNotFound`](crate::Error::KeyNotFound) when the key
/// is absent or expired.
pub async fn get_image_size<L: BitmapLoader>(
    store: &dyn BlobStore,
    loader: &L,
    key: &str,
) -> Result<(u32, u32)> {
    let bytes = store.get(key).await?;
    loader.size(&bytes).await
}

/// Invalidates every cached key the predicate matches.
pub async fn clear_image_cache<P>(store: &dyn BlobStore, predicate: P) -> Result<()>
where
    P: Fn(&str) -> bool,
{
    let keys = store.get_all_keys(None).await?;
    for key in keys {
        if predicate(&key) {
            store.invalidate(&key).await?;
        }
    }
    Ok(())
}
