//! http2 - HTTP/2 wire codec.
//!
//! This crate owns the byte-level pieces of HTTP/2 (RFC 7540): frame
//! headers, frame payload encoding and parsing, SETTINGS bookkeeping, and
//! HPACK header compression (RFC 7541). It performs no I/O and keeps no
//! connection state; the transport layer drives it and owns stream
//! lifecycle, flow control, and scheduling.
//!
//! # Modules
//!
//! - `frame`: frame types, flags, error codes, and the 9-byte frame header
//! - `encode`: frame writers that append directly to an output buffer
//! - `decode`: frame header and payload parsers
//! - `settings`: typed SETTINGS values with validation and diffing
//! - `hpack`: HPACK header compression

pub mod decode;
pub mod encode;
pub mod frame;
pub mod hpack;
pub mod settings;

pub use decode::FrameError;
pub use frame::{
    CONNECTION_PREFACE, DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE,
    DEFAULT_MAX_FRAME_SIZE, ErrorCode, FRAME_HEADER_SIZE, FrameHeader, FrameType, MAX_WINDOW,
};
pub use hpack::{HeaderField, HpackDecoder, HpackEncoder};
pub use settings::{Setting, SettingId, Settings};
