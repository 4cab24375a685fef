//! HPACK header block encoding.

use bytes::{BufMut, BytesMut};

use super::table::{DynamicTable, HeaderField, STATIC_TABLE_LEN, static_find};

/// Values under names that must never enter a compression table
/// (RFC 7541 Section 7.1.3).
fn is_sensitive(name: &[u8]) -> bool {
    name == b"authorization" || name == b"cookie" || name == b"set-cookie"
}

/// HPACK encoder.
///
/// Emits indexed representations where the static or dynamic table
/// matches, literals with incremental indexing otherwise, and
/// never-indexed literals for sensitive names. String literals are
/// written uncompressed.
pub struct HpackEncoder {
    table: DynamicTable,
    /// Upper bound on the dynamic table imposed by local configuration.
    max_usable_size: usize,
    /// A table size update that must precede the next header block.
    pending_size_update: Option<usize>,
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackEncoder {
    pub fn new() -> Self {
        Self::with_table_size(super::DEFAULT_TABLE_SIZE)
    }

    pub fn with_table_size(size: usize) -> Self {
        Self {
            table: DynamicTable::new(size),
            max_usable_size: size,
            pending_size_update: None,
        }
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE. The effective size is
    /// capped by local configuration; a change is advertised in the next
    /// header block.
    pub fn set_peer_table_size(&mut self, peer_max: usize) {
        let target = peer_max.min(self.max_usable_size);
        if target != self.table.max_size() {
            self.table.set_max_size(target);
            self.pending_size_update = Some(target);
        }
    }

    /// Encode a header block from `fields` into `buf`.
    pub fn encode<'a>(
        &mut self,
        fields: impl IntoIterator<Item = &'a HeaderField>,
        buf: &mut BytesMut,
    ) {
        if let Some(size) = self.pending_size_update.take() {
            put_integer(size as u64, 5, 0x20, buf);
        }
        for field in fields {
            self.encode_field(field, buf);
        }
    }

    fn encode_field(&mut self, field: &HeaderField, buf: &mut BytesMut) {
        if is_sensitive(&field.name) {
            // Never-indexed literal, with a name index when available.
            let name_index = match static_find(&field.name, &field.value) {
                Some((index, _)) => index as u64,
                None => 0,
            };
            put_integer(name_index, 4, 0x10, buf);
            if name_index == 0 {
                put_string(&field.name, buf);
            }
            put_string(&field.value, buf);
            return;
        }

        let static_hit = static_find(&field.name, &field.value);
        if let Some((index, true)) = static_hit {
            put_integer(index as u64, 7, 0x80, buf);
            return;
        }
        if let Some((index, true)) = self.table.find(&field.name, &field.value) {
            put_integer((STATIC_TABLE_LEN + 1 + index) as u64, 7, 0x80, buf);
            return;
        }

        // Literal with incremental indexing, reusing a table name where
        // one exists.
        let name_index = match static_hit {
            Some((index, false)) => Some(index),
            _ => self
                .table
                .find(&field.name, &field.value)
                .map(|(index, _)| STATIC_TABLE_LEN + 1 + index),
        };
        match name_index {
            Some(index) => put_integer(index as u64, 6, 0x40, buf),
            None => {
                put_integer(0, 6, 0x40, buf);
                put_string(&field.name, buf);
            }
        }
        put_string(&field.value, buf);
        self.table.insert(field.clone());
    }
}

/// Prefix-coded integer (RFC 7541 Section 5.1).
fn put_integer(mut value: u64, prefix_bits: u8, pattern: u8, buf: &mut BytesMut) {
    let max_prefix = (1u64 << prefix_bits) - 1;
    if value < max_prefix {
        buf.put_u8(pattern | value as u8);
        return;
    }
    buf.put_u8(pattern | max_prefix as u8);
    value -= max_prefix;
    while value >= 128 {
        buf.put_u8((value % 128) as u8 | 0x80);
        value /= 128;
    }
    buf.put_u8(value as u8);
}

/// Plain (non-Huffman) string literal.
fn put_string(data: &[u8], buf: &mut BytesMut) {
    put_integer(data.len() as u64, 7, 0x00, buf);
    buf.put_slice(data);
}
