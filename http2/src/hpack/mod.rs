//! HPACK header compression (RFC 7541).
//!
//! The encoder indexes into the static and dynamic tables and emits
//! string literals uncompressed; the decoder additionally understands
//! Huffman-coded literals from peers that use them.

mod decode;
mod encode;
mod huffman;
mod table;

pub use decode::{HpackDecoder, HpackError};
pub use encode::HpackEncoder;
pub use table::HeaderField;

/// Default dynamic table size (RFC 7541 Section 6.5.2).
pub const DEFAULT_TABLE_SIZE: usize = 4096;
