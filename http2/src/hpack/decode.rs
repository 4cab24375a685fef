//! HPACK header block decoding.

use bytes::Bytes;
use thiserror::Error;

use super::huffman::{self, HuffmanError};
use super::table::{DynamicTable, HeaderField, STATIC_TABLE, STATIC_TABLE_LEN};

/// HPACK decoding errors. All of them are fatal to the connection
/// (compression state can no longer be trusted).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HpackError {
    #[error("truncated header block")]
    Truncated,
    #[error("integer representation overflows")]
    IntegerOverflow,
    #[error("table index {0} out of range")]
    InvalidIndex(u64),
    #[error("table size update to {requested} exceeds limit {max}")]
    TableSizeUpdateTooLarge { requested: usize, max: usize },
    #[error("header list of {size} bytes exceeds limit {max}")]
    HeaderListTooLarge { size: usize, max: usize },
    #[error(transparent)]
    Huffman(#[from] HuffmanError),
}

/// HPACK decoder.
pub struct HpackDecoder {
    table: DynamicTable,
    /// Limit on dynamic table growth (what we advertised in SETTINGS).
    max_table_size: usize,
    /// Limit on the decoded size of one header list.
    max_header_list_size: usize,
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackDecoder {
    pub fn new() -> Self {
        Self::with_table_size(super::DEFAULT_TABLE_SIZE)
    }

    pub fn with_table_size(size: usize) -> Self {
        Self {
            table: DynamicTable::new(size),
            max_table_size: size,
            max_header_list_size: usize::MAX,
        }
    }

    /// Cap the decoded size of a single header list (name + value + 32
    /// per field, matching SETTINGS_MAX_HEADER_LIST_SIZE accounting).
    pub fn set_max_header_list_size(&mut self, max: usize) {
        self.max_header_list_size = max;
    }

    /// Decode a complete header block.
    pub fn decode(&mut self, mut block: &[u8]) -> Result<Vec<HeaderField>, HpackError> {
        let mut fields = Vec::new();
        let mut list_size = 0usize;
        while !block.is_empty() {
            let first = block[0];
            if first & 0x80 != 0 {
                // Indexed field.
                let (index, rest) = read_integer(block, 7)?;
                block = rest;
                let field = self.lookup(index)?;
                list_size += field.size();
                fields.push(field);
            } else if first & 0xc0 == 0x40 {
                // Literal with incremental indexing.
                let (field, rest) = self.read_literal(block, 6)?;
                block = rest;
                list_size += field.size();
                self.table.insert(field.clone());
                fields.push(field);
            } else if first & 0xe0 == 0x20 {
                // Dynamic table size update.
                let (size, rest) = read_integer(block, 5)?;
                block = rest;
                let size = size as usize;
                if size > self.max_table_size {
                    return Err(HpackError::TableSizeUpdateTooLarge {
                        requested: size,
                        max: self.max_table_size,
                    });
                }
                self.table.set_max_size(size);
            } else {
                // Literal without indexing (0000) or never indexed (0001).
                let (field, rest) = self.read_literal(block, 4)?;
                block = rest;
                list_size += field.size();
                fields.push(field);
            }
            if list_size > self.max_header_list_size {
                return Err(HpackError::HeaderListTooLarge {
                    size: list_size,
                    max: self.max_header_list_size,
                });
            }
        }
        Ok(fields)
    }

    fn lookup(&self, index: u64) -> Result<HeaderField, HpackError> {
        if index == 0 {
            return Err(HpackError::InvalidIndex(0));
        }
        if index <= STATIC_TABLE_LEN as u64 {
            let (name, value) = STATIC_TABLE[index as usize];
            return Ok(HeaderField::new(
                Bytes::from_static(name),
                Bytes::from_static(value),
            ));
        }
        self.table
            .get(index as usize - STATIC_TABLE_LEN - 1)
            .cloned()
            .ok_or(HpackError::InvalidIndex(index))
    }

    fn read_literal<'a>(
        &self,
        block: &'a [u8],
        prefix_bits: u8,
    ) -> Result<(HeaderField, &'a [u8]), HpackError> {
        let (name_index, rest) = read_integer(block, prefix_bits)?;
        let (name, rest) = if name_index == 0 {
            read_string(rest)?
        } else {
            (self.lookup(name_index)?.name, rest)
        };
        let (value, rest) = read_string(rest)?;
        Ok((HeaderField { name, value }, rest))
    }
}

/// Prefix-coded integer (RFC 7541 Section 5.1).
fn read_integer(block: &[u8], prefix_bits: u8) -> Result<(u64, &[u8]), HpackError> {
    if block.is_empty() {
        return Err(HpackError::Truncated);
    }
    let max_prefix = (1u64 << prefix_bits) - 1;
    let mut value = (block[0] as u64) & max_prefix;
    let mut rest = &block[1..];
    if value < max_prefix {
        return Ok((value, rest));
    }
    let mut shift = 0u32;
    loop {
        let &byte = rest.first().ok_or(HpackError::Truncated)?;
        rest = &rest[1..];
        let chunk = (byte & 0x7f) as u64;
        value = chunk
            .checked_shl(shift)
            .and_then(|shifted| value.checked_add(shifted))
            .ok_or(HpackError::IntegerOverflow)?;
        if byte & 0x80 == 0 {
            return Ok((value, rest));
        }
        shift += 7;
        if shift > 63 {
            return Err(HpackError::IntegerOverflow);
        }
    }
}

/// String literal, Huffman-decoded when flagged.
fn read_string(block: &[u8]) -> Result<(Bytes, &[u8]), HpackError> {
    if block.is_empty() {
        return Err(HpackError::Truncated);
    }
    let huffman_coded = block[0] & 0x80 != 0;
    let (length, rest) = read_integer(block, 7)?;
    let length = length as usize;
    if rest.len() < length {
        return Err(HpackError::Truncated);
    }
    let (raw, rest) = rest.split_at(length);
    let data = if huffman_coded {
        Bytes::from(huffman::decode(raw)?)
    } else {
        Bytes::copy_from_slice(raw)
    };
    Ok((data, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexed_static_fields() {
        let mut decoder = HpackDecoder::new();
        // :method GET, :path /, :scheme http
        let fields = decoder.decode(&[0x82, 0x84, 0x86]).unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].name, &b":method"[..]);
        assert_eq!(fields[0].value, &b"GET"[..]);
        assert_eq!(fields[1].name, &b":path"[..]);
        assert_eq!(fields[2].value, &b"http"[..]);
    }

    #[test]
    fn test_rfc_first_request() {
        // RFC 7541 C.3.1.
        let block: &[u8] = &[
            0x82, 0x86, 0x84, 0x41, 0x0f, 0x77, 0x77, 0x77, 0x2e, 0x65, 0x78, 0x61, 0x6d, 0x70,
            0x6c, 0x65, 0x2e, 0x63, 0x6f, 0x6d,
        ];
        let mut decoder = HpackDecoder::new();
        let fields = decoder.decode(block).unwrap();
        assert_eq!(fields[3].name, &b":authority"[..]);
        assert_eq!(fields[3].value, &b"www.example.com"[..]);
        // :authority was inserted into the dynamic table; index 62 now
        // resolves to it.
        let again = decoder.decode(&[0xbe]).unwrap();
        assert_eq!(again[0].value, &b"www.example.com"[..]);
    }

    #[test]
    fn test_rfc_first_request_huffman() {
        // RFC 7541 C.4.1: same headers with Huffman-coded authority.
        let block: &[u8] = &[
            0x82, 0x86, 0x84, 0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab,
            0x90, 0xf4, 0xff,
        ];
        let mut decoder = HpackDecoder::new();
        let fields = decoder.decode(block).unwrap();
        assert_eq!(fields[3].value, &b"www.example.com"[..]);
    }

    #[test]
    fn test_invalid_index() {
        let mut decoder = HpackDecoder::new();
        assert!(matches!(
            decoder.decode(&[0x80 | 70]),
            Err(HpackError::InvalidIndex(70))
        ));
        assert!(matches!(
            decoder.decode(&[0x80]),
            Err(HpackError::InvalidIndex(0))
        ));
    }

    #[test]
    fn test_truncated_literal() {
        let mut decoder = HpackDecoder::new();
        // Literal with new name, name length 5, only 2 bytes follow.
        assert!(matches!(
            decoder.decode(&[0x40, 0x05, b'a', b'b']),
            Err(HpackError::Truncated)
        ));
    }

    #[test]
    fn test_table_size_update_respects_limit() {
        let mut decoder = HpackDecoder::with_table_size(4096);
        // Update to 256 is fine.
        decoder.decode(&[0x3f, 0xe1, 0x01]).unwrap();
        // Update beyond the advertised limit is a compression error.
        let err = decoder.decode(&[0x3f, 0xe2, 0x7f]).unwrap_err();
        assert!(matches!(err, HpackError::TableSizeUpdateTooLarge { .. }));
    }

    #[test]
    fn test_header_list_size_enforced() {
        let mut decoder = HpackDecoder::new();
        decoder.set_max_header_list_size(40);
        // "x: y" costs 1 + 1 + 32 = 34; two of them exceed 40.
        let block = &[0x40, 0x01, b'x', 0x01, b'y', 0x40, 0x01, b'x', 0x01, b'y'];
        assert!(matches!(
            decoder.decode(block),
            Err(HpackError::HeaderListTooLarge { .. })
        ));
    }

    #[test]
    fn test_integer_overflow_rejected() {
        let mut decoder = HpackDecoder::new();
        let mut block = vec![0x7f];
        block.extend_from_slice(&[0xff; 12]);
        assert!(matches!(
            decoder.decode(&block),
            Err(HpackError::IntegerOverflow)
        ));
    }
}
