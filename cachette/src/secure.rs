//! Key-schema conventions for credentials stored in a secure cache.
//!
//! These helpers are thin: one [`Login`] record per host under the key
//! `login:<host>`, stored through the typed layer. Point the
//! [`ObjectCache`] at an
//! [`EncryptedStore`](crate::EncryptedStore) so the credentials are sealed
//! at rest; the helpers themselves work over any store.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::Expiration;
use crate::error::{Error, Result};
use crate::store::ensure_valid_key;
use crate::typed::ObjectCache;

/// A stored credential for one host.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Login {
    /// The host the credential belongs to.
    pub host: String,
    /// The account name.
    pub username: String,
    /// The secret. Redacted from `Debug` output.
    pub password: String,
}

impl fmt::Debug for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Login")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

fn login_key(host: &str) -> String {
    format!("login:{host}")
}

/// Stores `login` under its host's key.
pub async fn save_login(cache: &ObjectCache, login: &Login, expiration: Expiration) -> Result<()> {
    ensure_valid_key(&login.host)?;
    cache
        .insert_object(&login_key(&login.host), Some(login), expiration)
        .await
}

/// Returns the credential stored for `host`.
///
/// # Errors
///
/// Fails with [`Error::KeyNotFound`](crate::Error::KeyNotFound) when no
/// credential is stored (or an explicit null was stored) for the host.
pub async fn get_login(cache: &ObjectCache, host: &str) -> Result<Login> {
    ensure_valid_key(host)?;
    match cache.get_object::<Login>(&login_key(host)).await? {
        Some(login) => Ok(login),
        None => Err(Error::key_not_found(host)),
    }
}

/// Removes the credential stored for `host`. Succeeds when none exists.
pub async fn erase_login(cache: &ObjectCache, host: &str) -> Result<()> {
    ensure_valid_key(host)?;
    cache.invalidate_object::<Login>(&login_key(host)).await
}
