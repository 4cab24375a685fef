//! Frame writers.
//!
//! Each writer appends one complete frame (header plus payload) to the
//! output buffer. Callers are responsible for respecting the peer's
//! SETTINGS_MAX_FRAME_SIZE when sizing DATA payloads; header blocks are
//! split across CONTINUATION frames here because the split points are a
//! codec concern.

use bytes::{BufMut, BytesMut};

use crate::frame::{FRAME_HEADER_SIZE, FrameType, flags};
use crate::settings::Setting;

/// Append a frame header.
pub fn put_frame_header(buf: &mut BytesMut, length: u32, kind: FrameType, fl: u8, stream_id: u32) {
    debug_assert!(length <= 0x00ff_ffff);
    buf.reserve(FRAME_HEADER_SIZE + length as usize);
    buf.put_u8((length >> 16) as u8);
    buf.put_u8((length >> 8) as u8);
    buf.put_u8(length as u8);
    buf.put_u8(kind as u8);
    buf.put_u8(fl);
    buf.put_u32(stream_id & 0x7fff_ffff);
}

/// Append a DATA frame.
pub fn write_data(buf: &mut BytesMut, stream_id: u32, payload: &[u8], end_stream: bool) {
    let fl = if end_stream { flags::END_STREAM } else { 0 };
    put_frame_header(buf, payload.len() as u32, FrameType::Data, fl, stream_id);
    buf.put_slice(payload);
}

/// Append a header block as one HEADERS frame, splitting the tail across
/// CONTINUATION frames when it exceeds `max_frame_size`.
pub fn write_headers(
    buf: &mut BytesMut,
    stream_id: u32,
    block: &[u8],
    end_stream: bool,
    max_frame_size: u32,
) {
    let max = max_frame_size as usize;
    let mut fl = if end_stream { flags::END_STREAM } else { 0 };
    let first_len = block.len().min(max);
    let mut rest = &block[first_len..];
    if rest.is_empty() {
        fl |= flags::END_HEADERS;
    }
    put_frame_header(buf, first_len as u32, FrameType::Headers, fl, stream_id);
    buf.put_slice(&block[..first_len]);

    while !rest.is_empty() {
        let chunk_len = rest.len().min(max);
        let (chunk, tail) = rest.split_at(chunk_len);
        let cont_flags = if tail.is_empty() { flags::END_HEADERS } else { 0 };
        put_frame_header(
            buf,
            chunk_len as u32,
            FrameType::Continuation,
            cont_flags,
            stream_id,
        );
        buf.put_slice(chunk);
        rest = tail;
    }
}

/// Append an RST_STREAM frame.
pub fn write_rst_stream(buf: &mut BytesMut, stream_id: u32, error_code: u32) {
    put_frame_header(buf, 4, FrameType::RstStream, 0, stream_id);
    buf.put_u32(error_code);
}

/// Append a SETTINGS frame carrying the given parameters.
pub fn write_settings(buf: &mut BytesMut, settings: &[Setting]) {
    put_frame_header(buf, (settings.len() * 6) as u32, FrameType::Settings, 0, 0);
    for setting in settings {
        buf.put_u16(setting.id.as_u16());
        buf.put_u32(setting.value);
    }
}

/// Append a SETTINGS acknowledgment.
pub fn write_settings_ack(buf: &mut BytesMut) {
    put_frame_header(buf, 0, FrameType::Settings, flags::ACK, 0);
}

/// Append a PING frame. The opaque payload carries the ping id.
pub fn write_ping(buf: &mut BytesMut, ack: bool, opaque: u64) {
    let fl = if ack { flags::ACK } else { 0 };
    put_frame_header(buf, 8, FrameType::Ping, fl, 0);
    buf.put_u64(opaque);
}

/// Append a GOAWAY frame.
pub fn write_goaway(buf: &mut BytesMut, last_stream_id: u32, error_code: u32, debug_data: &[u8]) {
    put_frame_header(
        buf,
        (8 + debug_data.len()) as u32,
        FrameType::GoAway,
        0,
        0,
    );
    buf.put_u32(last_stream_id & 0x7fff_ffff);
    buf.put_u32(error_code);
    buf.put_slice(debug_data);
}

/// Append a WINDOW_UPDATE frame. `stream_id` 0 targets the connection.
pub fn write_window_update(buf: &mut BytesMut, stream_id: u32, increment: u32) {
    debug_assert!(increment > 0 && increment <= 0x7fff_ffff);
    put_frame_header(buf, 4, FrameType::WindowUpdate, 0, stream_id);
    buf.put_u32(increment & 0x7fff_ffff);
}
