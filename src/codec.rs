//! Session record codec.
//!
//! A session value is a timeout plus two dictionaries: the per-user item
//! collection and the static-objects collection. On the wire the record is a
//! little-endian buffer with a fixed header, followed by the dictionaries in
//! whatever form the payload codec emits. Empty dictionaries are never
//! serialized, so an empty record is exactly six bytes. The whole buffer may
//! be gzip-wrapped; the `Compressed` flag on the stored document is
//! per-record, so compression can be toggled between deployments without
//! invalidating existing records.

use std::io::{Read, Write};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors from encoding or decoding a session record
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload truncated while reading {0}")]
    Truncated(&'static str),

    #[error("dictionary of {0} bytes exceeds the wire format limit")]
    DictionaryTooLarge(usize),

    #[error("invalid presence flag byte {0:#04x}")]
    InvalidFlag(u8),

    #[error("trailing bytes after session record")]
    TrailingBytes,

    #[error("compression error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dictionary serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// An insertion-ordered string-to-value dictionary.
///
/// Session items keep the order the application inserted them in, and two
/// dictionaries compare equal only when keys, values and order all match.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionItems {
    entries: Vec<(String, Value)>,
}

impl SessionItems {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// Insert or replace in place; replacing keeps the key's position.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.entries.iter_mut().find(|(name, _)| *name == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let index = self.entries.iter().position(|(name, _)| name == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl FromIterator<(String, Value)> for SessionItems {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut items = Self::new();
        for (key, value) in iter {
            items.set(key, value);
        }
        items
    }
}

/// One session value: the nominal timeout plus the two dictionaries.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    /// Session timeout in minutes; the content record's `ttl` is this × 60.
    pub timeout_minutes: i32,
    pub items: SessionItems,
    pub static_objects: SessionItems,
}

impl SessionState {
    /// A state with no items, as written for an uninitialized session.
    pub fn empty(timeout_minutes: i32) -> Self {
        Self {
            timeout_minutes,
            items: SessionItems::new(),
            static_objects: SessionItems::new(),
        }
    }

    pub fn ttl_secs(&self) -> i64 {
        i64::from(self.timeout_minutes) * 60
    }
}

/// Serialization of the dictionaries inside a record.
///
/// The record codec treats dictionary bytes as opaque; whatever a codec
/// writes it must be able to read back, including its own framing.
pub trait PayloadCodec: Send + Sync {
    fn write_dictionary(&self, items: &SessionItems, buf: &mut Vec<u8>) -> Result<(), CodecError>;
    fn read_dictionary(&self, input: &mut &[u8]) -> Result<SessionItems, CodecError>;
}

/// Default payload codec: length-prefixed JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPayloadCodec;

impl PayloadCodec for JsonPayloadCodec {
    fn write_dictionary(&self, items: &SessionItems, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        let body = serde_json::to_vec(items)?;
        let len = u32::try_from(body.len())
            .map_err(|_| CodecError::DictionaryTooLarge(body.len()))?;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&body);
        Ok(())
    }

    fn read_dictionary(&self, input: &mut &[u8]) -> Result<SessionItems, CodecError> {
        let len_bytes = take(input, 4, "dictionary length")?;
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        let body = take(input, len as usize, "dictionary body")?;
        Ok(serde_json::from_slice(body)?)
    }
}

/// Encoder/decoder for whole session records.
#[derive(Clone)]
pub struct RecordCodec {
    payload: Arc<dyn PayloadCodec>,
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordCodec {
    pub fn new() -> Self {
        Self::with_payload_codec(Arc::new(JsonPayloadCodec))
    }

    /// Use a caller-supplied dictionary codec instead of the JSON default.
    pub fn with_payload_codec(payload: Arc<dyn PayloadCodec>) -> Self {
        Self { payload }
    }

    pub fn encode(&self, state: &SessionState, compress: bool) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&state.timeout_minutes.to_le_bytes());
        buf.push(u8::from(!state.items.is_empty()));
        buf.push(u8::from(!state.static_objects.is_empty()));

        if !state.items.is_empty() {
            self.payload.write_dictionary(&state.items, &mut buf)?;
        }
        if !state.static_objects.is_empty() {
            self.payload.write_dictionary(&state.static_objects, &mut buf)?;
        }

        if compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&buf)?;
            Ok(encoder.finish()?)
        } else {
            Ok(buf)
        }
    }

    pub fn decode(&self, bytes: &[u8], compressed: bool) -> Result<SessionState, CodecError> {
        let plain;
        let mut input: &[u8] = if compressed {
            let mut decoder = GzDecoder::new(bytes);
            let mut decoded = Vec::new();
            decoder.read_to_end(&mut decoded)?;
            plain = decoded;
            &plain
        } else {
            bytes
        };

        let timeout_bytes = take(&mut input, 4, "timeout")?;
        let timeout_minutes = i32::from_le_bytes([
            timeout_bytes[0],
            timeout_bytes[1],
            timeout_bytes[2],
            timeout_bytes[3],
        ]);
        let has_items = read_flag(&mut input, "items flag")?;
        let has_static_objects = read_flag(&mut input, "static objects flag")?;

        let items = if has_items {
            self.payload.read_dictionary(&mut input)?
        } else {
            SessionItems::new()
        };
        let static_objects = if has_static_objects {
            self.payload.read_dictionary(&mut input)?
        } else {
            SessionItems::new()
        };

        if !input.is_empty() {
            return Err(CodecError::TrailingBytes);
        }

        Ok(SessionState {
            timeout_minutes,
            items,
            static_objects,
        })
    }
}

fn take<'a>(input: &mut &'a [u8], n: usize, what: &'static str) -> Result<&'a [u8], CodecError> {
    if input.len() < n {
        return Err(CodecError::Truncated(what));
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}

fn read_flag(input: &mut &[u8], what: &'static str) -> Result<bool, CodecError> {
    match take(input, 1, what)?[0] {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::InvalidFlag(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_state() -> SessionState {
        let mut items = SessionItems::new();
        items.set("cart", json!({"lines": [1, 2, 3], "total": 42.5}));
        items.set("user", json!("u-1209"));
        let mut statics = SessionItems::new();
        statics.set("tenant", json!("contoso"));
        SessionState {
            timeout_minutes: 20,
            items,
            static_objects: statics,
        }
    }

    #[test]
    fn empty_record_is_six_bytes() {
        let codec = RecordCodec::new();
        let bytes = codec.encode(&SessionState::empty(20), false).unwrap();
        assert_eq!(bytes.len(), 6);
        assert_eq!(&bytes[..4], &20i32.to_le_bytes());
        assert_eq!(&bytes[4..], &[0, 0]);
    }

    #[test]
    fn round_trip_uncompressed() {
        let codec = RecordCodec::new();
        let state = sample_state();
        let bytes = codec.encode(&state, false).unwrap();
        assert_eq!(codec.decode(&bytes, false).unwrap(), state);
    }

    #[test]
    fn round_trip_compressed() {
        let codec = RecordCodec::new();
        let state = sample_state();
        let bytes = codec.encode(&state, true).unwrap();
        assert_eq!(codec.decode(&bytes, true).unwrap(), state);
    }

    #[test]
    fn compression_is_value_neutral() {
        let codec = RecordCodec::new();
        let state = sample_state();
        let plain = codec.decode(&codec.encode(&state, false).unwrap(), false).unwrap();
        let gzipped = codec.decode(&codec.encode(&state, true).unwrap(), true).unwrap();
        assert_eq!(plain, gzipped);
    }

    #[test]
    fn item_order_survives_round_trip() {
        let codec = RecordCodec::new();
        let mut items = SessionItems::new();
        items.set("zulu", json!(1));
        items.set("alpha", json!(2));
        items.set("mike", json!(3));
        let state = SessionState {
            timeout_minutes: 5,
            items,
            static_objects: SessionItems::new(),
        };
        let decoded = codec
            .decode(&codec.encode(&state, false).unwrap(), false)
            .unwrap();
        let keys: Vec<&str> = decoded.items.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["zulu", "alpha", "mike"]);
    }

    #[test]
    fn set_replaces_in_place() {
        let mut items = SessionItems::new();
        items.set("a", json!(1));
        items.set("b", json!(2));
        items.set("a", json!(3));
        assert_eq!(items.len(), 2);
        assert_eq!(items.get("a"), Some(&json!(3)));
        let keys: Vec<&str> = items.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let codec = RecordCodec::new();
        assert!(matches!(
            codec.decode(&[0, 0, 0], false),
            Err(CodecError::Truncated("timeout"))
        ));
        assert!(matches!(
            codec.decode(&20i32.to_le_bytes(), false),
            Err(CodecError::Truncated(_))
        ));
    }

    #[test]
    fn invalid_flag_byte_is_rejected() {
        let codec = RecordCodec::new();
        let mut bytes = 20i32.to_le_bytes().to_vec();
        bytes.push(7);
        bytes.push(0);
        assert!(matches!(
            codec.decode(&bytes, false),
            Err(CodecError::InvalidFlag(7))
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let codec = RecordCodec::new();
        let mut bytes = codec.encode(&SessionState::empty(1), false).unwrap();
        bytes.push(0xff);
        assert!(matches!(
            codec.decode(&bytes, false),
            Err(CodecError::TrailingBytes)
        ));
    }
}
