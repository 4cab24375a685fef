//! RPC message framing inside DATA frames.
//!
//! Messages are length-prefixed: 1 byte compressed flag, 4 bytes
//! big-endian length, then the payload. The send side prepends the
//! header into the stream's outbound buffer; the receive side drains an
//! accumulation buffer one message at a time, reporting how many more
//! bytes it needs when a message is incomplete.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the message header (flag + length).
pub const MESSAGE_HEADER_SIZE: usize = 5;

/// Default cap on a single message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// A message lifted out of the stream's receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub payload: Bytes,
    pub compressed: bool,
}

/// Outcome of one deframe attempt.
#[derive(Debug)]
pub enum Deframed {
    /// A complete message was removed from the buffer.
    Message(ReceivedMessage),
    /// The buffer holds a partial message; `min_progress` more bytes are
    /// needed before another attempt can succeed.
    Pending { min_progress: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("message of {size} bytes exceeds maximum of {max}")]
    TooLarge { size: usize, max: usize },
    #[error("message compressed flag has invalid value {0}")]
    InvalidFlags(u8),
}

/// Append a message header to an outbound buffer.
pub fn put_message_header(buf: &mut BytesMut, compressed: bool, length: u32) {
    buf.put_u8(compressed as u8);
    buf.put_u32(length);
}

/// Try to remove one message from the front of `buf`.
pub fn deframe(buf: &mut BytesMut, max_size: usize) -> Result<Deframed, MessageError> {
    if buf.len() < MESSAGE_HEADER_SIZE {
        return Ok(Deframed::Pending {
            min_progress: MESSAGE_HEADER_SIZE - buf.len(),
        });
    }
    let flag = buf[0];
    if flag > 1 {
        return Err(MessageError::InvalidFlags(flag));
    }
    let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if length > max_size {
        return Err(MessageError::TooLarge {
            size: length,
            max: max_size,
        });
    }
    let total = MESSAGE_HEADER_SIZE + length;
    if buf.len() < total {
        return Ok(Deframed::Pending {
            min_progress: total - buf.len(),
        });
    }
    buf.advance(MESSAGE_HEADER_SIZE);
    let payload = buf.split_to(length).freeze();
    Ok(Deframed::Message(ReceivedMessage {
        payload,
        compressed: flag == 1,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(payload: &[u8], compressed: bool) -> BytesMut {
        let mut buf = BytesMut::new();
        put_message_header(&mut buf, compressed, payload.len() as u32);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_header_bytes() {
        let mut buf = BytesMut::new();
        put_message_header(&mut buf, false, 5);
        assert_eq!(&buf[..], &[0x00, 0x00, 0x00, 0x00, 0x05]);
    }

    #[test]
    fn test_deframe_complete() {
        let mut buf = framed(b"hello", false);
        match deframe(&mut buf, DEFAULT_MAX_MESSAGE_SIZE).unwrap() {
            Deframed::Message(msg) => {
                assert_eq!(&msg.payload[..], b"hello");
                assert!(!msg.compressed);
            }
            other => panic!("expected message, got {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_deframe_compressed_flag() {
        let mut buf = framed(b"x", true);
        match deframe(&mut buf, DEFAULT_MAX_MESSAGE_SIZE).unwrap() {
            Deframed::Message(msg) => assert!(msg.compressed),
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_deframe_incomplete_header() {
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);
        match deframe(&mut buf, DEFAULT_MAX_MESSAGE_SIZE).unwrap() {
            Deframed::Pending { min_progress } => assert_eq!(min_progress, 2),
            other => panic!("expected pending, got {:?}", other),
        }
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_deframe_incomplete_body() {
        let full = framed(b"hello world", false);
        let mut buf = BytesMut::from(&full[..8]);
        match deframe(&mut buf, DEFAULT_MAX_MESSAGE_SIZE).unwrap() {
            Deframed::Pending { min_progress } => assert_eq!(min_progress, 8),
            other => panic!("expected pending, got {:?}", other),
        }
    }

    #[test]
    fn test_deframe_multiple() {
        let mut buf = framed(b"first", false);
        buf.extend_from_slice(&framed(b"second", false));
        let first = match deframe(&mut buf, DEFAULT_MAX_MESSAGE_SIZE).unwrap() {
            Deframed::Message(msg) => msg,
            other => panic!("{:?}", other),
        };
        assert_eq!(&first.payload[..], b"first");
        let second = match deframe(&mut buf, DEFAULT_MAX_MESSAGE_SIZE).unwrap() {
            Deframed::Message(msg) => msg,
            other => panic!("{:?}", other),
        };
        assert_eq!(&second.payload[..], b"second");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_too_large_rejected() {
        let mut buf = BytesMut::new();
        put_message_header(&mut buf, false, 100);
        assert!(matches!(
            deframe(&mut buf, 64),
            Err(MessageError::TooLarge { size: 100, max: 64 })
        ));
    }

    #[test]
    fn test_bad_flags_rejected() {
        let mut buf = BytesMut::from(&[7u8, 0, 0, 0, 0][..]);
        assert!(matches!(
            deframe(&mut buf, DEFAULT_MAX_MESSAGE_SIZE),
            Err(MessageError::InvalidFlags(7))
        ));
    }

    #[test]
    fn test_empty_message() {
        let mut buf = framed(b"", false);
        match deframe(&mut buf, DEFAULT_MAX_MESSAGE_SIZE).unwrap() {
            Deframed::Message(msg) => assert!(msg.payload.is_empty()),
            other => panic!("{:?}", other),
        }
    }
}
