//! # Cursor Tracker
//!
//! A reindex job pages through its source collection ordered by a single sort
//! key. The position reached so far is carried in an opaque [`Cursor`] token:
//! URL-safe base64 over a small JSON envelope holding the format version, a
//! fingerprint of the key space (collection and sort field) and the sort-key
//! value of the last acknowledged document.
//!
//! Tokens minted for one key space are rejected by a tracker bound to another,
//! so a cursor copied between jobs can never silently skip or repeat documents.

use std::cmp::Ordering;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

use crate::error::ReindexError;
use crate::models::job_spec::ReindexJobSpec;

const ENVELOPE_VERSION: u8 = 1;
const START_SENTINEL: &str = "*";
/// Longest single term Lucene will index, in bytes.
pub const MAX_SORT_KEY_BYTES: usize = 32_766;
/// A key of `MAX_SORT_KEY_BYTES` control characters escapes to six bytes each.
const MAX_DECODED_LEN: usize = MAX_SORT_KEY_BYTES * 6 + 256;
const MAX_TOKEN_LEN: usize = MAX_DECODED_LEN.div_ceil(3) * 4;
const FINGERPRINT_LEN: usize = 16;

/// A sort-key value as returned by Solr for the paging field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum SortValue {
    /// Numeric keys such as `_version_` or a long-typed id.
    Long(i64),
    /// String keys such as the unique key.
    Text(String),
}

impl SortValue {
    /// Extract a sort value from a document field. Returns `None` for values
    /// Solr cannot sort on as a single key (floats, arrays, objects, null).
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_i64().map(SortValue::Long),
            Value::String(text) => Some(SortValue::Text(text.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            SortValue::Long(value) => Value::from(*value),
            SortValue::Text(value) => Value::from(value.as_str()),
        }
    }

    /// Render the value as a Solr query term. Text is quoted and escaped.
    pub fn to_query_term(&self) -> String {
        match self {
            SortValue::Long(value) => value.to_string(),
            SortValue::Text(value) => {
                let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{}\"", escaped)
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            SortValue::Long(_) => "long",
            SortValue::Text(_) => "text",
        }
    }
}

impl fmt::Display for SortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortValue::Long(value) => write!(f, "{}", value),
            SortValue::Text(value) => f.write_str(value),
        }
    }
}

/// Opaque, persisted position within a source collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// The sentinel position before the first document.
    pub fn start() -> Self {
        Cursor(START_SENTINEL.to_string())
    }

    /// Wrap a persisted token. Validation happens in [`CursorTracker::decode`].
    pub fn from_token<S: Into<String>>(token: S) -> Self {
        Cursor(token.into())
    }

    pub fn is_start(&self) -> bool {
        self.0 == START_SENTINEL
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Cursor::start()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decoded cursor position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorPosition {
    Start,
    After(SortValue),
}

impl CursorPosition {
    pub fn after(&self) -> Option<&SortValue> {
        match self {
            CursorPosition::Start => None,
            CursorPosition::After(value) => Some(value),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CursorEnvelope {
    v: u8,
    ks: String,
    key: SortValue,
}

/// Encodes, decodes and orders cursors for one key space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorTracker {
    key_space: String,
}

impl CursorTracker {
    pub fn new(collection: &str, sort_field: &str) -> Self {
        let digest = Sha256::digest(format!("{}|{}", collection, sort_field).as_bytes());
        let mut key_space = hex::encode(digest);
        key_space.truncate(FINGERPRINT_LEN);
        Self { key_space }
    }

    /// Tracker for the source collection and sort field of a job.
    pub fn for_job(spec: &ReindexJobSpec) -> Self {
        Self::new(&spec.source.collection, &spec.sort_field)
    }

    pub fn key_space(&self) -> &str {
        &self.key_space
    }

    /// Mint the cursor positioned after `value`. Keys longer than any term
    /// Solr can index are rejected, so every cursor minted here decodes.
    pub fn encode(&self, value: &SortValue) -> Result<Cursor, ReindexError> {
        if let SortValue::Text(text) = value
            && text.len() > MAX_SORT_KEY_BYTES
        {
            return Err(invalid(&format!(
                "sort key of {} bytes exceeds the {} byte term limit",
                text.len(),
                MAX_SORT_KEY_BYTES
            )));
        }

        let envelope = json!({
            "v": ENVELOPE_VERSION,
            "ks": self.key_space,
            "key": value.to_json(),
        })
        .to_string();
        if envelope.len() > MAX_DECODED_LEN {
            return Err(invalid("encoded cursor is too large"));
        }
        Ok(Cursor(URL_SAFE_NO_PAD.encode(envelope.as_bytes())))
    }

    pub fn decode(&self, cursor: &Cursor) -> Result<CursorPosition, ReindexError> {
        let token = cursor.as_str();

        if token.is_empty() {
            return Err(invalid("cursor cannot be empty"));
        }

        if token == START_SENTINEL {
            return Ok(CursorPosition::Start);
        }

        if token.len() > MAX_TOKEN_LEN {
            return Err(invalid("cursor is too long"));
        }

        if !token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid("cursor contains invalid characters"));
        }

        let decoded = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| invalid("cursor is not valid base64"))?;

        if decoded.is_empty() {
            return Err(invalid("cursor is empty after decoding"));
        }

        if decoded.len() > MAX_DECODED_LEN {
            return Err(invalid("decoded cursor is too large"));
        }

        let json = String::from_utf8(decoded)
            .map_err(|_| invalid("cursor contains invalid UTF-8 data"))?;

        let envelope: CursorEnvelope = serde_json::from_str(&json)
            .map_err(|_| invalid("cursor contains invalid JSON structure"))?;

        if envelope.v != ENVELOPE_VERSION {
            return Err(invalid(&format!(
                "unsupported cursor version {}",
                envelope.v
            )));
        }

        if envelope.ks != self.key_space {
            return Err(invalid(&format!(
                "cursor belongs to key space {} but this job pages key space {}",
                envelope.ks, self.key_space
            )));
        }

        Ok(CursorPosition::After(envelope.key))
    }

    /// Total order over cursors of this key space, matching an ascending Solr sort.
    pub fn compare(&self, a: &Cursor, b: &Cursor) -> Result<Ordering, ReindexError> {
        let left = self.decode(a)?;
        let right = self.decode(b)?;

        match (left, right) {
            (CursorPosition::Start, CursorPosition::Start) => Ok(Ordering::Equal),
            (CursorPosition::Start, CursorPosition::After(_)) => Ok(Ordering::Less),
            (CursorPosition::After(_), CursorPosition::Start) => Ok(Ordering::Greater),
            (CursorPosition::After(x), CursorPosition::After(y)) => compare_values(&x, &y),
        }
    }
}

/// Order two sort values. Values of different kinds never come from the same
/// sort field, so mixing them is treated as a foreign cursor.
pub fn compare_values(a: &SortValue, b: &SortValue) -> Result<Ordering, ReindexError> {
    match (a, b) {
        (SortValue::Long(x), SortValue::Long(y)) => Ok(x.cmp(y)),
        (SortValue::Text(x), SortValue::Text(y)) => Ok(x.as_bytes().cmp(y.as_bytes())),
        _ => Err(invalid(&format!(
            "cannot compare {} key with {} key",
            a.kind(),
            b.kind()
        ))),
    }
}

fn invalid(message: &str) -> ReindexError {
    ReindexError::InvalidCursor(message.to_string())
}
