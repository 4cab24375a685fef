//! Server-side immediate cancellation: the status rides a single
//! hand-built HEADERS frame followed by RST_STREAM, optionally behind a
//! tarpit delay.

mod common;

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use bytes::BytesMut;

use common::{TestEndpoint, frames, frames_of, settings_frame};
use http2::frame::{FrameType, flags};
use http2::hpack::{HeaderField, HpackEncoder};
use transport::{
    Code, Config, EventEngine, MemoryOwner, StreamOpBatch, ThreadedEngine, Transport,
    TransportError, TransportOp, UnconstrainedMemory,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn engine() -> Arc<dyn EventEngine> {
    Arc::new(ThreadedEngine::new())
}

fn memory() -> Arc<dyn MemoryOwner> {
    Arc::new(UnconstrainedMemory)
}

fn request_bytes(stream_id: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(http2::CONNECTION_PREFACE);
    bytes.extend(settings_frame(&[]));
    let mut encoder = HpackEncoder::new();
    let fields = vec![
        HeaderField::new(&b":method"[..], &b"POST"[..]),
        HeaderField::new(&b":scheme"[..], &b"http"[..]),
        HeaderField::new(&b":path"[..], &b"/svc/M"[..]),
        HeaderField::new(&b"content-type"[..], &b"application/grpc"[..]),
    ];
    let mut block = BytesMut::new();
    encoder.encode(fields.iter(), &mut block);
    let mut headers = BytesMut::new();
    http2::encode::write_headers(&mut headers, stream_id, &block, false, 16_384);
    bytes.extend_from_slice(&headers);
    bytes
}

/// The exact uncompressed header block the cancellation path hand-rolls.
fn expected_status_block(status: &str, message: &str) -> Vec<u8> {
    let mut block = Vec::new();
    for (name, value) in [
        (&b":status"[..], &b"200"[..]),
        (&b"content-type"[..], &b"application/grpc"[..]),
        (b"grpc-status", status.as_bytes()),
        (b"grpc-message", message.as_bytes()),
    ] {
        block.push(0x00);
        block.push(name.len() as u8);
        block.extend_from_slice(name);
        block.push(value.len() as u8);
        block.extend_from_slice(value);
    }
    block
}

#[test]
fn test_cancel_before_initial_metadata_synthesizes_response() {
    let ep = TestEndpoint::new("cancel");
    let server = Transport::server(
        ep.clone(),
        engine(),
        memory(),
        Config::new().allow_tarpit(false).rng_seed(3),
    );
    let (accept_tx, accept_rx) = mpsc::channel();
    server.perform_op(TransportOp::new().set_accept_stream(Box::new(move |handle| {
        accept_tx.send(handle).unwrap();
    })));
    server.start_reading(None, None, None);

    ep.push_bytes(request_bytes(1));
    let handle = accept_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    server.perform_stream_op(
        handle,
        StreamOpBatch::new().cancel_stream(
            TransportError::new("boom").with_status(Code::Unavailable),
        ),
    );

    let wire = ep.wait_written(
        |bytes| !frames_of(bytes, FrameType::RstStream).is_empty(),
        RECV_TIMEOUT,
    );

    let all = frames(&wire);
    let headers_at = all
        .iter()
        .position(|frame| frame.kind == Some(FrameType::Headers) && frame.stream_id == 1)
        .expect("synthesized HEADERS for stream 1");
    let headers = &all[headers_at];
    assert_eq!(headers.flags, flags::END_STREAM | flags::END_HEADERS);
    assert_eq!(headers.payload, expected_status_block("14", "boom"));

    let rst_at = all
        .iter()
        .position(|frame| frame.kind == Some(FrameType::RstStream) && frame.stream_id == 1)
        .expect("RST_STREAM for stream 1");
    assert!(rst_at > headers_at, "RST_STREAM must follow the response");
    assert_eq!(all[rst_at].payload, 0u32.to_be_bytes());
}

#[test]
fn test_cancel_after_initial_metadata_omits_response_preamble() {
    let ep = TestEndpoint::new("cancel-late");
    let server = Transport::server(
        ep.clone(),
        engine(),
        memory(),
        Config::new().allow_tarpit(false).rng_seed(4),
    );
    let (accept_tx, accept_rx) = mpsc::channel();
    server.perform_op(TransportOp::new().set_accept_stream(Box::new(move |handle| {
        accept_tx.send(handle).unwrap();
    })));
    server.start_reading(None, None, None);

    ep.push_bytes(request_bytes(1));
    let handle = accept_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    // Send initial metadata first, then cancel.
    let mut initial = transport::Metadata::new();
    initial.insert(":status", "200");
    initial.insert("content-type", "application/grpc");
    server.perform_stream_op(handle, StreamOpBatch::new().send_initial_metadata(initial));
    ep.wait_written(
        |bytes| !frames_of(bytes, FrameType::Headers).is_empty(),
        RECV_TIMEOUT,
    );

    server.perform_stream_op(
        handle,
        StreamOpBatch::new()
            .cancel_stream(TransportError::new("late").with_status(Code::Cancelled)),
    );
    let wire = ep.wait_written(
        |bytes| !frames_of(bytes, FrameType::RstStream).is_empty(),
        RECV_TIMEOUT,
    );
    let headers = frames_of(&wire, FrameType::Headers);
    assert_eq!(headers.len(), 2);
    let text = String::from_utf8_lossy(&headers[1].payload).into_owned();
    assert!(!text.contains(":status"));
    assert!(text.contains("grpc-status"));
    assert!(text.contains("late"));
}

#[test]
fn test_tarpit_delays_the_reset() {
    let ep = TestEndpoint::new("tarpit");
    let server = Transport::server(
        ep.clone(),
        engine(),
        memory(),
        Config::new()
            .allow_tarpit(true)
            .tarpit_range(Duration::from_millis(100), Duration::from_millis(300))
            .rng_seed(5),
    );
    let (accept_tx, accept_rx) = mpsc::channel();
    server.perform_op(TransportOp::new().set_accept_stream(Box::new(move |handle| {
        accept_tx.send(handle).unwrap();
    })));
    server.start_reading(None, None, None);

    ep.push_bytes(request_bytes(1));
    let handle = accept_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    server.perform_stream_op(
        handle,
        StreamOpBatch::new().cancel_stream_tarpit(
            TransportError::new("slow down").with_status(Code::ResourceExhausted),
        ),
    );

    // Inside the minimum tarpit window nothing stream-related is on the
    // wire yet.
    std::thread::sleep(Duration::from_millis(40));
    assert!(frames_of(&ep.written(), FrameType::RstStream).is_empty());

    // It arrives once the delay elapses.
    ep.wait_written(
        |bytes| !frames_of(bytes, FrameType::RstStream).is_empty(),
        Duration::from_secs(2),
    );
}
