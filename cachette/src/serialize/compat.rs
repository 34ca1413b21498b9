//! Cross-format compatibility helpers: date-time coercion of decoded value
//! trees, and wire-format sniffing for bytes written by another codec.

use chrono::{DateTime, Local, SecondsFormat, TimeZone};

use crate::config::DateTimeKind;

/// Best-effort guess at the wire format of stored bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SniffedFormat {
    Json,
    Bson,
    Unknown,
}

/// Guesses the wire format from the leading bytes.
///
/// JSON payloads start with `{`, `[`, or insignificant whitespace. BSON
/// documents start with their own total length as a 4-byte little-endian
/// integer, which is checked against the payload length.
pub(crate) fn sniff(bytes: &[u8]) -> SniffedFormat {
    match bytes.first() {
        Some(b'{' | b'[') => return SniffedFormat::Json,
        Some(first) if first.is_ascii_whitespace() => return SniffedFormat::Json,
        _ => {}
    }

    if bytes.len() >= 5 {
        let declared = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if declared >= 5 && declared as usize == bytes.len() {
            return SniffedFormat::Bson;
        }
    }

    SniffedFormat::Unknown
}

/// Rewrites every RFC 3339 string in a JSON tree to the forced kind.
pub(crate) fn coerce_json(value: serde_json::Value, kind: DateTimeKind) -> serde_json::Value {
    match value {
        serde_json::Value::String(text) => {
            let coerced = coerce_rfc3339(&text, kind).unwrap_or(text);
            serde_json::Value::String(coerced)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items.into_iter().map(|item| coerce_json(item, kind)).collect(),
        ),
        serde_json::Value::Object(fields) => serde_json::Value::Object(
            fields
                .into_iter()
                .map(|(name, field)| (name, coerce_json(field, kind)))
                .collect(),
        ),
        other => other,
    }
}

/// Rewrites every RFC 3339 string in a BSON tree to the forced kind.
pub(crate) fn coerce_bson(value: bson::Bson, kind: DateTimeKind) -> bson::Bson {
    match value {
        bson::Bson::String(text) => {
            let coerced = coerce_rfc3339(&text, kind).unwrap_or(text);
            bson::Bson::String(coerced)
        }
        bson::Bson::Array(items) => bson::Bson::Array(
            items.into_iter().map(|item| coerce_bson(item, kind)).collect(),
        ),
        bson::Bson::Document(doc) => bson::Bson::Document(
            doc.into_iter()
                .map(|(name, field)| (name, coerce_bson(field, kind)))
                .collect(),
        ),
        other => other,
    }
}

/// Coerces one RFC 3339 reading to the forced kind, preserving the wall
/// clock and rewriting the offset. Returns `None` when the text is not a
/// date-time, or when the wall-clock reading does not exist in the local
/// zone (DST gap); callers keep the original text in both cases.
fn coerce_rfc3339(text: &str, kind: DateTimeKind) -> Option<String> {
    let parsed = DateTime::parse_from_rfc3339(text).ok()?;
    let wall_clock = parsed.naive_local();
    match kind {
        DateTimeKind::Utc => {
            Some(wall_clock.and_utc().to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }
        DateTimeKind::Local => {
            let local = Local.from_local_datetime(&wall_clock).single()?;
            Some(local.to_rfc3339_opts(SecondsFormat::AutoSi, false))
        }
    }
}
