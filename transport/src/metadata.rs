//! Call metadata (headers and trailers).
//!
//! An ordered multimap of header entries. Keys are lowercase ASCII; keys
//! ending in `-bin` carry binary values, which travel base64-coded on
//! the wire unless the peer negotiated true-binary passthrough (then
//! they are sent raw behind a 0x00 marker byte). Insertion order is
//! preserved so pseudo-headers stay in front of regular headers.

use bytes::Bytes;
use http2::HeaderField;

use crate::error::StreamNetworkState;
use crate::status::Code;

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Ascii(String),
    Binary(Bytes),
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Ascii(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Ascii(value.to_string())
    }
}

impl From<Bytes> for MetadataValue {
    fn from(value: Bytes) -> Self {
        MetadataValue::Binary(value)
    }
}

/// Metadata attached to a call in either direction.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    entries: Vec<(String, MetadataValue)>,
    /// Annotation carried alongside trailers, never serialized.
    network_state: Option<StreamNetworkState>,
    /// Recommended keepalive interval after the peer demanded calm;
    /// never serialized.
    keepalive_throttle: Option<std::time::Duration>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a key-value pair. Keys are normalized to lowercase;
    /// duplicate keys are allowed.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        let key = key.into().to_ascii_lowercase();
        self.entries.push((key, value.into()));
    }

    /// First ASCII value for a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find_map(|(k, v)| match v {
            MetadataValue::Ascii(s) if k == key => Some(s.as_str()),
            _ => None,
        })
    }

    /// First binary value for a key.
    pub fn get_bin(&self, key: &str) -> Option<&Bytes> {
        self.entries.iter().find_map(|(k, v)| match v {
            MetadataValue::Binary(b) if k == key => Some(b),
            _ => None,
        })
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Remove all values for a key, returning whether any were present.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        before != self.entries.len()
    }

    /// Replace any existing values for a key with one value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        let key = key.into().to_ascii_lowercase();
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push((key, value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge another metadata map into this one (appending entries).
    pub fn merge(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
        if other.network_state.is_some() {
            self.network_state = other.network_state;
        }
        if other.keepalive_throttle.is_some() {
            self.keepalive_throttle = other.keepalive_throttle;
        }
    }

    pub fn grpc_status(&self) -> Option<Code> {
        self.get("grpc-status")
            .and_then(|s| s.parse::<u32>().ok())
            .map(Code::from_u32)
    }

    pub fn set_grpc_status(&mut self, code: Code) {
        self.set("grpc-status", code.as_u32().to_string());
    }

    pub fn grpc_message(&self) -> Option<&str> {
        self.get("grpc-message")
    }

    pub fn set_grpc_message(&mut self, message: impl Into<String>) {
        self.set("grpc-message", message.into());
    }

    /// `grpc-timeout` parsed to a duration, if present and well-formed.
    pub fn grpc_timeout(&self) -> Option<std::time::Duration> {
        let raw = self.get("grpc-timeout")?;
        if raw.len() < 2 {
            return None;
        }
        let (digits, unit) = raw.split_at(raw.len() - 1);
        let value: u64 = digits.parse().ok()?;
        let nanos = match unit {
            "n" => value,
            "u" => value.checked_mul(1_000)?,
            "m" => value.checked_mul(1_000_000)?,
            "S" => value.checked_mul(1_000_000_000)?,
            "M" => value.checked_mul(60_000_000_000)?,
            "H" => value.checked_mul(3_600_000_000_000)?,
            _ => return None,
        };
        Some(std::time::Duration::from_nanos(nanos))
    }

    pub fn network_state(&self) -> Option<StreamNetworkState> {
        self.network_state
    }

    pub fn set_network_state(&mut self, state: StreamNetworkState) {
        self.network_state = Some(state);
    }

    pub fn keepalive_throttle(&self) -> Option<std::time::Duration> {
        self.keepalive_throttle
    }

    pub fn set_keepalive_throttle(&mut self, throttle: std::time::Duration) {
        self.keepalive_throttle = Some(throttle);
    }

    /// Serialize to header fields for HPACK encoding. Binary values are
    /// base64-coded, or passed through behind a 0x00 marker when the
    /// peer negotiated true-binary metadata.
    pub fn to_header_fields(&self, true_binary: bool) -> Vec<HeaderField> {
        self.entries
            .iter()
            .map(|(key, value)| {
                let name = Bytes::copy_from_slice(key.as_bytes());
                let value = match value {
                    MetadataValue::Ascii(s) => Bytes::copy_from_slice(s.as_bytes()),
                    MetadataValue::Binary(b) => {
                        if true_binary {
                            let mut raw = Vec::with_capacity(b.len() + 1);
                            raw.push(0x00);
                            raw.extend_from_slice(b);
                            Bytes::from(raw)
                        } else {
                            Bytes::from(base64_encode(b))
                        }
                    }
                };
                HeaderField { name, value }
            })
            .collect()
    }

    /// Rebuild metadata from decoded header fields. Values under `-bin`
    /// keys are base64-decoded unless they carry the true-binary marker.
    pub fn from_header_fields(fields: Vec<HeaderField>) -> Result<Metadata, MetadataError> {
        let mut metadata = Metadata::new();
        for field in fields {
            let key = String::from_utf8(field.name.to_vec())
                .map_err(|_| MetadataError::InvalidKey)?;
            if key.ends_with("-bin") {
                let value = if field.value.first() == Some(&0x00) {
                    field.value.slice(1..)
                } else {
                    Bytes::from(base64_decode(&field.value).ok_or_else(|| {
                        MetadataError::InvalidBinaryValue { key: key.clone() }
                    })?)
                };
                metadata.entries.push((key, MetadataValue::Binary(value)));
            } else {
                let value = String::from_utf8(field.value.to_vec())
                    .map_err(|_| MetadataError::InvalidAsciiValue { key: key.clone() })?;
                metadata.entries.push((key, MetadataValue::Ascii(value)));
            }
        }
        Ok(metadata)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata key is not valid UTF-8")]
    InvalidKey,
    #[error("metadata value for {key} is not valid UTF-8")]
    InvalidAsciiValue { key: String },
    #[error("binary metadata value for {key} is not valid base64")]
    InvalidBinaryValue { key: String },
}

const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Unpadded base64, the wire form of `-bin` metadata values.
pub(crate) fn base64_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
        let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
        let triple = (b0 << 16) | (b1 << 8) | b2;
        out.push(BASE64_ALPHABET[(triple >> 18) as usize & 0x3f] as char);
        out.push(BASE64_ALPHABET[(triple >> 12) as usize & 0x3f] as char);
        if chunk.len() > 1 {
            out.push(BASE64_ALPHABET[(triple >> 6) as usize & 0x3f] as char);
        }
        if chunk.len() > 2 {
            out.push(BASE64_ALPHABET[triple as usize & 0x3f] as char);
        }
    }
    out
}

/// Decode base64, tolerating both padded and unpadded input.
pub(crate) fn base64_decode(data: &[u8]) -> Option<Vec<u8>> {
    fn value(byte: u8) -> Option<u32> {
        match byte {
            b'A'..=b'Z' => Some((byte - b'A') as u32),
            b'a'..=b'z' => Some((byte - b'a' + 26) as u32),
            b'0'..=b'9' => Some((byte - b'0' + 52) as u32),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }

    let data = match data.iter().position(|&b| b == b'=') {
        Some(at) => &data[..at],
        None => data,
    };
    if data.len() % 4 == 1 {
        return None;
    }
    let mut out = Vec::with_capacity(data.len() * 3 / 4);
    for chunk in data.chunks(4) {
        let mut acc = 0u32;
        for &byte in chunk {
            acc = (acc << 6) | value(byte)?;
        }
        match chunk.len() {
            4 => {
                out.push((acc >> 16) as u8);
                out.push((acc >> 8) as u8);
                out.push(acc as u8);
            }
            3 => {
                acc <<= 6;
                out.push((acc >> 16) as u8);
                out.push((acc >> 8) as u8);
            }
            2 => {
                acc <<= 12;
                out.push((acc >> 16) as u8);
            }
            _ => unreachable!("length % 4 == 1 rejected above"),
        }
    }
    Some(out)
}
