//! Encrypted persistent blob store.
//!
//! Wraps the SQLite store with at-rest encryption of values: AES-256-GCM
//! per row, keyed by PBKDF2-HMAC-SHA256 over the password and a per-store
//! random salt. A `cache_meta` table carries the salt, the KDF iteration
//! count, and a key-check token sealed with the derived key, so opening with
//! a wrong password fails deterministically with
//! [`Error::WrongPassword`](crate::Error::WrongPassword) before any data is
//! read.
//!
//! Keys, type tags, and timestamps stay plaintext; only values are sealed.
//! The sealed layout per row is `nonce (12 bytes) || ciphertext+tag`.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use sqlx::Row;

use crate::clock::Clock;
use crate::config::Expiration;
use crate::error::{Error, Result};
use crate::store::sqlite::SqliteStore;
use crate::store::{BlobStore, CacheEntry};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const KEY_CHECK_PLAINTEXT: &[u8] = b"cachette/key-check/v1";

/// PBKDF2-HMAC-SHA256 iteration count used by [`EncryptedStore::open`],
/// per current OWASP guidance.
pub const DEFAULT_KDF_ITERATIONS: u32 = 600_000;

const CREATE_META: &str = "\
CREATE TABLE IF NOT EXISTS cache_meta (
    name  TEXT PRIMARY KEY NOT NULL,
    value BLOB NOT NULL
)";

/// A durable [`BlobStore`] that seals every value at rest.
pub struct EncryptedStore {
    inner: SqliteStore,
    cipher: Aes256Gcm,
}

impl EncryptedStore {
    /// Opens (creating if missing) an encrypted store at `path`, deriving
    /// the sealing key from `password` with
    /// [`DEFAULT_KDF_ITERATIONS`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongPassword`] when the store exists and `password`
    /// does not match the one it was created with, and
    /// [`Error::ArgumentInvalid`] for an empty password.
    pub async fn open(
        path: impl AsRef<Path>,
        password: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::open_with_iterations(path, password, DEFAULT_KDF_ITERATIONS, clock).await
    }

    /// Like [`open`](Self::open) with an explicit KDF iteration count.
    ///
    /// The count is fixed at creation and stored alongside the salt; reopens
    /// use the stored count, so passing a different one later has no effect.
    pub async fn open_with_iterations(
        path: impl AsRef<Path>,
        password: &str,
        iterations: u32,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if password.is_empty() {
            return Err(Error::invalid_argument("password must not be empty"));
        }
        if iterations == 0 {
            return Err(Error::invalid_argument("KDF iteration count must be positive"));
        }

        let inner = SqliteStore::open(path, clock).await?;
        sqlx::query(CREATE_META).execute(inner.pool()).await?;

        let salt = read_meta(&inner, "salt").await?;
        let cipher = match salt {
            Some(salt) => {
                let stored_iterations = read_meta(&inner, "kdf_iterations")
                    .await?
                    .ok_or_else(|| Error::Crypto("missing KDF iteration metadata".to_owned()))?;
                let stored_iterations = u32::from_le_bytes(
                    stored_iterations
                        .as_slice()
                        .try_into()
                        .map_err(|_| Error::Crypto("malformed KDF iteration metadata".to_owned()))?,
                );
                let key = derive_key(password, &salt, stored_iterations);
                let cipher = make_cipher(&key)?;

                let key_check = read_meta(&inner, "key_check")
                    .await?
                    .ok_or_else(|| Error::Crypto("missing key-check metadata".to_owned()))?;
                match open_sealed(&cipher, &key_check) {
                    Ok(plaintext) if plaintext == KEY_CHECK_PLAINTEXT => cipher,
                    _ => return Err(Error::WrongPassword),
                }
            }
            None => {
                let mut salt = [0_u8; SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                let key = derive_key(password, &salt, iterations);
                let cipher = make_cipher(&key)?;
                let key_check = seal(&cipher, KEY_CHECK_PLAINTEXT)?;

                let mut tx = inner.pool().begin().await?;
                for (name, value) in [
                    ("salt", salt.to_vec()),
                    ("kdf_iterations", iterations.to_le_bytes().to_vec()),
                    ("key_check", key_check),
                ] {
                    sqlx::query(
                        "INSERT INTO cache_meta (name, value) VALUES (?1, ?2) \
                         ON CONFLICT (name) DO NOTHING",
                    )
                    .bind(name)
                    .bind(value)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
                cipher
            }
        };

        Ok(Self { inner, cipher })
    }

    /// The database file this store writes to.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }
}

async fn read_meta(store: &SqliteStore, name: &str) -> Result<Option<Vec<u8>>> {
    let row = sqlx::query("SELECT value FROM cache_meta WHERE name = ?1")
        .bind(name)
        .fetch_optional(store.pool())
        .await?;
    row.map(|row| row.try_get("value").map_err(Error::from))
        .transpose()
}

fn derive_key(password: &str, salt: &[u8], iterations: u32) -> [u8; KEY_LEN] {
    let mut key = [0_u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);
    key
}

fn make_cipher(key: &[u8; KEY_LEN]) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key)
        .map_err(|_| Error::Crypto("invalid key length for AES-256-GCM".to_owned()))
}

fn seal(cipher: &Aes256Gcm, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0_u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| Error::Crypto("value encryption failed".to_owned()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn open_sealed(cipher: &Aes256Gcm, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(Error::Crypto("sealed value is too short".to_owned()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Crypto("value failed authentication; corrupted or wrong key".to_owned()))
}

#[async_trait::async_trait]
impl BlobStore for EncryptedStore {
    async fn insert(
        &self,
        key: &str,
        value: Vec<u8>,
        type_tag: Option<&str>,
        expiration: Expiration,
    ) -> Result<()> {
        let sealed = seal(&self.cipher, &value)?;
        self.inner.insert(key, sealed, type_tag, expiration).await
    }

    async fn insert_many(
        &self,
        pairs: Vec<(String, Vec<u8>)>,
        type_tag: Option<&str>,
        expiration: Expiration,
    ) -> Result<()> {
        let mut sealed_pairs = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let sealed = seal(&self.cipher, &value)?;
            sealed_pairs.push((key, sealed));
        }
        self.inner
            .insert_many(sealed_pairs, type_tag, expiration)
            .await
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let sealed = self.inner.get(key).await?;
        open_sealed(&self.cipher, &sealed)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<(String, Vec<u8>)>> {
        let sealed_pairs = self.inner.get_many(keys).await?;
        let mut pairs = Vec::with_capacity(sealed_pairs.len());
        for (key, sealed) in sealed_pairs {
            let value = open_sealed(&self.cipher, &sealed)?;
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    async fn get_all(&self, type_tag: &str) -> Result<Vec<CacheEntry>> {
        let mut entries = self.inner.get_all(type_tag).await?;
        for entry in &mut entries {
            entry.value = open_sealed(&self.cipher, &entry.value)?;
        }
        Ok(entries)
    }

    async fn get_all_keys(&self, type_tag: Option<&str>) -> Result<Vec<String>> {
        self.inner.get_all_keys(type_tag).await
    }

    async fn get_created_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        self.inner.get_created_at(key).await
    }

    async fn update_expiration(&self, key: &str, expiration: Expiration) -> Result<()> {
        self.inner.update_expiration(key, expiration).await
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.inner.invalidate(key).await
    }

    async fn invalidate_many(&self, keys: &[String]) -> Result<()> {
        self.inner.invalidate_many(keys).await
    }

    async fn invalidate_all(&self, type_tag: Option<&str>) -> Result<()> {
        self.inner.invalidate_all(type_tag).await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    async fn vacuum(&self) -> Result<()> {
        self.inner.vacuum().await
    }

    async fn dispose(&self) -> Result<()> {
        self.inner.dispose().await
    }

    fn clock(&self) -> Arc<dyn Clock> {
        self.inner.clock()
    }
}

impl fmt::Debug for EncryptedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedStore")
            .field("inner", &self.inner)
            .field("cipher", &"<Aes256Gcm>")
            .finish()
    }
}
