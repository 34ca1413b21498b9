//! Cache-wide policy types: expiration and instant-kind coercion.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Expiration policy for cached entries.
///
/// An entry whose resolved deadline has been reached is treated as absent by
/// every read, and is physically removed lazily on touch or in bulk by
/// `vacuum`.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use cachette::Expiration;
///
/// let soon = Expiration::After(Duration::from_secs(300));
/// let never = Expiration::Never;
/// assert!(never.resolve(chrono::Utc::now()).is_none());
/// assert!(soon.resolve(chrono::Utc::now()).is_some());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Expiration {
    /// Never expire the entry.
    #[default]
    Never,
    /// Expire after the specified duration from the insertion time.
    After(Duration),
    /// Expire at the specific UTC instant.
    At(DateTime<Utc>),
}

impl Expiration {
    /// Resolves the policy into an absolute deadline, given the current time
    /// of the owning store's clock. [`Expiration::Never`] resolves to `None`.
    #[must_use]
    pub fn resolve(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Expiration::Never => None,
            Expiration::After(duration) => {
                let delta = TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX);
                Some(now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC))
            }
            Expiration::At(deadline) => Some(deadline),
        }
    }
}

/// Returns `true` when a resolved deadline has been reached.
pub(crate) fn is_expired(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.is_some_and(|deadline| deadline <= now)
}

/// The instant kind every serialized or deserialized date-time is coerced to.
///
/// The coercion preserves the wall-clock reading and rewrites the offset, so
/// `2024-05-01T10:00:00+02:00` forced to [`DateTimeKind::Utc`] becomes
/// `2024-05-01T10:00:00Z`. It applies to values written and read by a
/// [`Serializer`](crate::Serializer) configured with a forced kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateTimeKind {
    /// Interpret wall-clock readings as UTC.
    Utc,
    /// Interpret wall-clock readings in the system's local offset.
    Local,
}
