//! Frame payload parsers.
//!
//! The transport accumulates exactly one frame header plus payload at a
//! time and hands the payload here for interpretation. DATA and HEADERS
//! payloads are returned as fragments (padding and priority fields
//! stripped); the fixed-layout frames are parsed into values.

use bytes::{Buf, Bytes};
use smallvec::SmallVec;
use thiserror::Error;

use crate::frame::{FrameHeader, flags};
use crate::settings::{Setting, SettingId};

/// Frame-level protocol errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: u32, max: u32 },
    #[error("{kind} frame has invalid length {length}")]
    InvalidLength { kind: &'static str, length: u32 },
    #[error("{kind} frame must {expectation} stream id, got {stream_id}")]
    InvalidStreamId {
        kind: &'static str,
        expectation: &'static str,
        stream_id: u32,
    },
    #[error("padding length {pad} exceeds payload of {length} bytes")]
    InvalidPadding { pad: u32, length: u32 },
    #[error("WINDOW_UPDATE increment must be non-zero")]
    ZeroWindowIncrement,
    #[error("SETTINGS parameter {id:#06x} has invalid value {value}")]
    InvalidSetting { id: u16, value: u32 },
}

/// Strip the padding-length octet and trailing padding from a padded
/// payload (DATA and HEADERS share the layout).
fn strip_padding(kind: &'static str, mut payload: Bytes) -> Result<Bytes, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::InvalidLength { kind, length: 0 });
    }
    let pad = payload[0] as usize;
    payload.advance(1);
    if pad >= payload.len() + 1 {
        return Err(FrameError::InvalidPadding {
            pad: pad as u32,
            length: payload.len() as u32,
        });
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}

/// Extract the data from a DATA frame payload.
pub fn data_payload(header: &FrameHeader, payload: Bytes) -> Result<Bytes, FrameError> {
    if header.stream_id == 0 {
        return Err(FrameError::InvalidStreamId {
            kind: "DATA",
            expectation: "carry a non-zero",
            stream_id: 0,
        });
    }
    if header.has_flag(flags::PADDED) {
        strip_padding("DATA", payload)
    } else {
        Ok(payload)
    }
}

/// Extract the header block fragment from a HEADERS frame payload,
/// discarding padding and the optional priority fields.
pub fn headers_fragment(header: &FrameHeader, payload: Bytes) -> Result<Bytes, FrameError> {
    if header.stream_id == 0 {
        return Err(FrameError::InvalidStreamId {
            kind: "HEADERS",
            expectation: "carry a non-zero",
            stream_id: 0,
        });
    }
    let mut fragment = if header.has_flag(flags::PADDED) {
        strip_padding("HEADERS", payload)?
    } else {
        payload
    };
    if header.has_flag(flags::PRIORITY) {
        // Stream dependency (4) + weight (1); dependency ordering is not
        // implemented, the fields are consumed and dropped.
        if fragment.len() < 5 {
            return Err(FrameError::InvalidLength {
                kind: "HEADERS",
                length: fragment.len() as u32,
            });
        }
        fragment.advance(5);
    }
    Ok(fragment)
}

/// Parse an RST_STREAM payload into its error code.
pub fn parse_rst_stream(header: &FrameHeader, payload: &[u8]) -> Result<u32, FrameError> {
    if header.stream_id == 0 {
        return Err(FrameError::InvalidStreamId {
            kind: "RST_STREAM",
            expectation: "carry a non-zero",
            stream_id: 0,
        });
    }
    if payload.len() != 4 {
        return Err(FrameError::InvalidLength {
            kind: "RST_STREAM",
            length: payload.len() as u32,
        });
    }
    Ok(u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]))
}

/// Parse a SETTINGS payload into its parameter list.
pub fn parse_settings(
    header: &FrameHeader,
    payload: &[u8],
) -> Result<SmallVec<[Setting; 8]>, FrameError> {
    if header.stream_id != 0 {
        return Err(FrameError::InvalidStreamId {
            kind: "SETTINGS",
            expectation: "use the connection",
            stream_id: header.stream_id,
        });
    }
    if header.has_flag(flags::ACK) && !payload.is_empty() {
        return Err(FrameError::InvalidLength {
            kind: "SETTINGS",
            length: payload.len() as u32,
        });
    }
    if payload.len() % 6 != 0 {
        return Err(FrameError::InvalidLength {
            kind: "SETTINGS",
            length: payload.len() as u32,
        });
    }
    let mut settings = SmallVec::new();
    for chunk in payload.chunks_exact(6) {
        let id = u16::from_be_bytes([chunk[0], chunk[1]]);
        let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
        settings.push(Setting {
            id: SettingId::from_u16(id),
            value,
        });
    }
    Ok(settings)
}

/// Parse a PING payload into its opaque id.
pub fn parse_ping(header: &FrameHeader, payload: &[u8]) -> Result<u64, FrameError> {
    if header.stream_id != 0 {
        return Err(FrameError::InvalidStreamId {
            kind: "PING",
            expectation: "use the connection",
            stream_id: header.stream_id,
        });
    }
    if payload.len() != 8 {
        return Err(FrameError::InvalidLength {
            kind: "PING",
            length: payload.len() as u32,
        });
    }
    Ok(u64::from_be_bytes([
        payload[0], payload[1], payload[2], payload[3], payload[4], payload[5], payload[6],
        payload[7],
    ]))
}

/// A parsed GOAWAY frame.
#[derive(Debug, Clone)]
pub struct GoAwayPayload {
    pub last_stream_id: u32,
    pub error_code: u32,
    pub debug_data: Bytes,
}

/// Parse a GOAWAY payload.
pub fn parse_goaway(header: &FrameHeader, mut payload: Bytes) -> Result<GoAwayPayload, FrameError> {
    if header.stream_id != 0 {
        return Err(FrameError::InvalidStreamId {
            kind: "GOAWAY",
            expectation: "use the connection",
            stream_id: header.stream_id,
        });
    }
    if payload.len() < 8 {
        return Err(FrameError::InvalidLength {
            kind: "GOAWAY",
            length: payload.len() as u32,
        });
    }
    let last_stream_id = payload.get_u32() & 0x7fff_ffff;
    let error_code = payload.get_u32();
    Ok(GoAwayPayload {
        last_stream_id,
        error_code,
        debug_data: payload,
    })
}

/// Parse a WINDOW_UPDATE payload into its increment.
pub fn parse_window_update(_header: &FrameHeader, payload: &[u8]) -> Result<u32, FrameError> {
    if payload.len() != 4 {
        return Err(FrameError::InvalidLength {
            kind: "WINDOW_UPDATE",
            length: payload.len() as u32,
        });
    }
    let increment =
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff;
    if increment == 0 {
        return Err(FrameError::ZeroWindowIncrement);
    }
    Ok(increment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameType;

    fn header(kind: FrameType, fl: u8, stream_id: u32, length: u32) -> FrameHeader {
        FrameHeader {
            length,
            kind: kind as u8,
            flags: fl,
            stream_id,
        }
    }

    #[test]
    fn test_data_plain() {
        let h = header(FrameType::Data, 0, 1, 5);
        let data = data_payload(&h, Bytes::from_static(b"hello")).unwrap();
        assert_eq!(&data[..], b"hello");
    }

    #[test]
    fn test_data_padded() {
        // pad length 2, payload "ab", 2 bytes padding
        let h = header(FrameType::Data, flags::PADDED, 1, 5);
        let data = data_payload(&h, Bytes::from_static(&[2, b'a', b'b', 0, 0])).unwrap();
        assert_eq!(&data[..], b"ab");
    }

    #[test]
    fn test_data_padding_overrun() {
        let h = header(FrameType::Data, flags::PADDED, 1, 3);
        let err = data_payload(&h, Bytes::from_static(&[5, b'a', b'b'])).unwrap_err();
        assert!(matches!(err, FrameError::InvalidPadding { .. }));
    }

    #[test]
    fn test_data_on_connection_stream() {
        let h = header(FrameType::Data, 0, 0, 1);
        assert!(data_payload(&h, Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_headers_with_priority() {
        let h = header(FrameType::Headers, flags::PRIORITY, 1, 7);
        let payload = Bytes::from_static(&[0x80, 0x00, 0x00, 0x00, 16, 0x82, 0x86]);
        let fragment = headers_fragment(&h, payload).unwrap();
        assert_eq!(&fragment[..], &[0x82, 0x86]);
    }

    #[test]
    fn test_rst_stream() {
        let h = header(FrameType::RstStream, 0, 3, 4);
        assert_eq!(parse_rst_stream(&h, &[0, 0, 0, 8]).unwrap(), 8);
        assert!(parse_rst_stream(&h, &[0, 0, 8]).is_err());
    }

    #[test]
    fn test_settings_parse() {
        let h = header(FrameType::Settings, 0, 0, 6);
        let settings = parse_settings(&h, &[0x00, 0x04, 0x00, 0x00, 0x40, 0x00]).unwrap();
        assert_eq!(settings.len(), 1);
        assert_eq!(settings[0].id, SettingId::InitialWindowSize);
        assert_eq!(settings[0].value, 16_384);
    }

    #[test]
    fn test_settings_bad_length() {
        let h = header(FrameType::Settings, 0, 0, 5);
        assert!(parse_settings(&h, &[0u8; 5]).is_err());
    }

    #[test]
    fn test_settings_ack_with_payload() {
        let h = header(FrameType::Settings, flags::ACK, 0, 6);
        assert!(parse_settings(&h, &[0u8; 6]).is_err());
    }

    #[test]
    fn test_ping_parse() {
        let h = header(FrameType::Ping, 0, 0, 8);
        assert_eq!(parse_ping(&h, &[0, 0, 0, 0, 0, 0, 0, 42]).unwrap(), 42);
    }

    #[test]
    fn test_ping_on_stream_is_error() {
        let h = header(FrameType::Ping, 0, 1, 8);
        assert!(matches!(
            parse_ping(&h, &[0u8; 8]),
            Err(FrameError::InvalidStreamId { .. })
        ));
    }

    #[test]
    fn test_goaway_parse() {
        let h = header(FrameType::GoAway, 0, 0, 22);
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x7fff_ffffu32.to_be_bytes());
        payload.extend_from_slice(&0xbu32.to_be_bytes());
        payload.extend_from_slice(b"too_many_pings");
        let goaway = parse_goaway(&h, Bytes::from(payload)).unwrap();
        assert_eq!(goaway.last_stream_id, 0x7fff_ffff);
        assert_eq!(goaway.error_code, 0xb);
        assert_eq!(&goaway.debug_data[..], b"too_many_pings");
    }

    #[test]
    fn test_window_update_parse() {
        let h = header(FrameType::WindowUpdate, 0, 0, 4);
        assert_eq!(parse_window_update(&h, &[0, 0, 0, 84]).unwrap(), 84);
        assert!(matches!(
            parse_window_update(&h, &[0, 0, 0, 0]),
            Err(FrameError::ZeroWindowIncrement)
        ));
    }
}
