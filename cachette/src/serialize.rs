//! Value serialization for the typed cache layer.
//!
//! Two interchange formats are supported: UTF-8 JSON and BSON. A
//! [`Serializer`] pairs a [`Format`] with an optional forced
//! [`DateTimeKind`](crate::DateTimeKind); when the kind is set, every
//! date-time inside a value is coerced to that kind on the way in and on the
//! way out (wall-clock preserved, offset rewritten).
//!
//! Values written under one format can be read back under the other through
//! the typed layer, which sniffs the stored bytes and retries with the
//! matching codec on a decode failure.

pub(crate) mod compat;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::DateTimeKind;
use crate::error::{Error, Result};

/// BSON cannot encode a bare primitive at the top level, so every value is
/// wrapped in a single-field document under this name.
const BSON_VALUE_FIELD: &str = "v";

/// The wire format a [`Serializer`] encodes values with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// UTF-8 JSON text.
    Json,
    /// BSON binary documents.
    Bson,
}

/// Converts values of any serde-compatible type to and from bytes.
///
/// # Examples
///
/// ```
/// use cachette::{DateTimeKind, Serializer};
///
/// let serializer = Serializer::json().with_forced_datetime_kind(DateTimeKind::Utc);
/// let bytes = serializer.to_bytes(&vec![1u32, 2, 3])?;
/// let back: Vec<u32> = serializer.from_bytes(&bytes)?;
/// assert_eq!(back, vec![1, 2, 3]);
/// # Ok::<(), cachette::Error>(())
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Serializer {
    format: Format,
    forced_datetime_kind: Option<DateTimeKind>,
}

impl Serializer {
    /// Creates a serializer for the given format with no forced kind.
    #[must_use]
    pub fn new(format: Format) -> Self {
        Self {
            format,
            forced_datetime_kind: None,
        }
    }

    /// A JSON serializer with no forced kind.
    #[must_use]
    pub fn json() -> Self {
        Self::new(Format::Json)
    }

    /// A BSON serializer with no forced kind.
    #[must_use]
    pub fn bson() -> Self {
        Self::new(Format::Bson)
    }

    /// Coerces every date-time read or written to `kind`.
    #[must_use]
    pub fn with_forced_datetime_kind(mut self, kind: DateTimeKind) -> Self {
        self.forced_datetime_kind = Some(kind);
        self
    }

    /// The wire format of this serializer.
    #[must_use]
    pub fn format(&self) -> Format {
        self.format
    }

    /// The forced date-time kind, when one is set.
    #[must_use]
    pub fn forced_datetime_kind(&self) -> Option<DateTimeKind> {
        self.forced_datetime_kind
    }

    /// The same serializer reading an alternate wire format. Used by the
    /// typed layer when format sniffing detects bytes written by the other
    /// codec.
    pub(crate) fn with_format(self, format: Format) -> Self {
        Self { format, ..self }
    }

    /// Encodes `value` into bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] when the value cannot be represented
    /// in the configured format.
    pub fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let type_name = std::any::type_name::<T>();
        match self.format {
            Format::Json => {
                let Some(kind) = self.forced_datetime_kind else {
                    return serde_json::to_vec(value)
                        .map_err(|err| Error::serialization(type_name, err));
                };
                let tree = serde_json::to_value(value)
                    .map_err(|err| Error::serialization(type_name, err))?;
                let tree = compat::coerce_json(tree, kind);
                serde_json::to_vec(&tree).map_err(|err| Error::serialization(type_name, err))
            }
            Format::Bson => {
                let tree =
                    bson::to_bson(value).map_err(|err| Error::serialization(type_name, err))?;
                let tree = match self.forced_datetime_kind {
                    Some(kind) => compat::coerce_bson(tree, kind),
                    None => tree,
                };
                let mut doc = bson::Document::new();
                doc.insert(BSON_VALUE_FIELD, tree);
                let mut bytes = Vec::new();
                doc.to_writer(&mut bytes)
                    .map_err(|err| Error::serialization(type_name, err))?;
                Ok(bytes)
            }
        }
    }

    /// Decodes a value of type `T` from bytes.
    ///
    /// The input must be non-empty; the typed layer maps the empty sequence
    /// to its null sentinel before calling this.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] on corrupt input or when the bytes do
    /// not decode into a `T`.
    pub fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        let type_name = std::any::type_name::<T>();
        match self.format {
            Format::Json => {
                let Some(kind) = self.forced_datetime_kind else {
                    return serde_json::from_slice(bytes)
                        .map_err(|err| Error::serialization(type_name, err));
                };
                let tree: serde_json::Value = serde_json::from_slice(bytes)
                    .map_err(|err| Error::serialization(type_name, err))?;
                let tree = compat::coerce_json(tree, kind);
                serde_json::from_value(tree).map_err(|err| Error::serialization(type_name, err))
            }
            Format::Bson => {
                let mut doc = bson::Document::from_reader(bytes)
                    .map_err(|err| Error::serialization(type_name, err))?;
                let tree = doc.remove(BSON_VALUE_FIELD).ok_or_else(|| {
                    Error::serialization(
                        type_name,
                        std::io::Error::other("binary document is missing its value field"),
                    )
                })?;
                let tree = match self.forced_datetime_kind {
                    Some(kind) => compat::coerce_bson(tree, kind),
                    None => tree,
                };
                bson::from_bson(tree).map_err(|err| Error::serialization(type_name, err))
            }
        }
    }
}
