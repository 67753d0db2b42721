//! Document schema for the session container.
//!
//! Two record kinds share the container: content records under the session
//! id, lock records under `{id}_lock`. The distinct lock id keeps the two
//! records in different logical partitions so they never contend on the same
//! physical key. Field names are part of the persisted format and must not
//! change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Suffix appended to a session id to form its lock record id.
pub const LOCK_ID_SUFFIX: &str = "_lock";

/// Marker value of the `IsNew` field on a created-but-unpopulated session.
pub const IS_NEW_MARKER: &str = "yes";

/// Lock record id for a session.
pub fn lock_id(session_id: &str) -> String {
    format!("{session_id}{LOCK_ID_SUFFIX}")
}

/// The persisted session blob plus its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentDocument {
    pub id: String,

    /// Seconds until the server deletes the document, counted from the last
    /// write.
    pub ttl: i64,

    /// UTC timestamp of the last write; consulted by the dampening rule.
    #[serde(rename = "CreatedDate")]
    pub created_date: DateTime<Utc>,

    /// Encoded session value; null for an uninitialized session.
    #[serde(rename = "Payload", with = "payload_base64", default)]
    pub payload: Option<Vec<u8>>,

    /// Whether `Payload` is gzipped. Per record, so toggling compression
    /// between deployments leaves old records readable.
    #[serde(rename = "Compressed")]
    pub compressed: bool,

    /// `"yes"` for a session created but not yet populated; otherwise absent.
    #[serde(rename = "IsNew", skip_serializing_if = "Option::is_none", default)]
    pub is_new: Option<String>,

    /// Server-assigned version token; never sent on writes.
    #[serde(rename = "_etag", skip_serializing, default)]
    pub etag: Option<String>,
}

impl ContentDocument {
    pub fn new(
        id: impl Into<String>,
        ttl: i64,
        payload: Option<Vec<u8>>,
        compressed: bool,
        is_new: bool,
    ) -> Self {
        Self {
            id: id.into(),
            ttl,
            created_date: Utc::now(),
            payload,
            compressed,
            is_new: is_new.then(|| IS_NEW_MARKER.to_string()),
            etag: None,
        }
    }

    pub fn is_new_session(&self) -> bool {
        self.is_new.as_deref() == Some(IS_NEW_MARKER)
    }
}

/// A presence-only document whose existence encodes "session held exclusive".
///
/// Lock records are created and deleted, never mutated; `ttl` bounds how long
/// a dead process can keep a session orphaned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockDocument {
    pub id: String,

    pub ttl: i64,

    #[serde(rename = "CreatedDate")]
    pub created_date: DateTime<Utc>,

    #[serde(rename = "_etag", skip_serializing, default)]
    pub etag: Option<String>,
}

impl LockDocument {
    /// Lock record for a session, stamped now.
    pub fn for_session(session_id: &str, ttl_secs: i64) -> Self {
        Self {
            id: lock_id(session_id),
            ttl: ttl_secs,
            created_date: Utc::now(),
            etag: None,
        }
    }
}

/// Byte payloads travel as base64 strings inside the JSON document.
mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
