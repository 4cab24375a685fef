//! Stream admission: the concurrency queue and stream-id exhaustion.

mod common;

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use common::{TestEndpoint, frames_of, settings_frame};
use http2::frame::{FrameType, flags};
use http2::settings::SettingId;
use transport::{
    Code, Config, EventEngine, MemoryOwner, Metadata, StreamNetworkState, StreamOpBatch,
    ThreadedEngine, Transport, UnconstrainedMemory,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn engine() -> Arc<dyn EventEngine> {
    Arc::new(ThreadedEngine::new())
}

fn memory() -> Arc<dyn MemoryOwner> {
    Arc::new(UnconstrainedMemory)
}

fn call_metadata() -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(":method", "POST");
    metadata.insert(":path", "/svc/M");
    metadata
}

/// A trailers-only response closing the given stream.
fn trailers_only_response(stream_id: u32) -> Vec<u8> {
    let mut encoder = http2::hpack::HpackEncoder::new();
    let fields = vec![
        http2::HeaderField::new(&b":status"[..], &b"200"[..]),
        http2::HeaderField::new(&b"grpc-status"[..], &b"0"[..]),
    ];
    let mut block = bytes::BytesMut::new();
    encoder.encode(fields.iter(), &mut block);
    let mut buf = bytes::BytesMut::new();
    http2::encode::write_headers(&mut buf, stream_id, &block, true, 16_384);
    buf.to_vec()
}

#[test]
fn test_streams_queue_behind_concurrency_limit() {
    let ep = TestEndpoint::new("concurrency");
    let client = Transport::client(
        ep.clone(),
        engine(),
        memory(),
        Config::new().bdp_probe(false).rng_seed(17),
    );
    client.start_reading(None, None, None);

    // The peer allows one concurrent stream.
    ep.push_bytes(settings_frame(&[(SettingId::MaxConcurrentStreams, 1)]));
    ep.wait_written(
        |bytes| {
            frames_of(bytes, FrameType::Settings)
                .iter()
                .any(|frame| frame.flags & flags::ACK != 0)
        },
        RECV_TIMEOUT,
    );

    // Two empty-bodied calls; only the first may go to the wire.
    let first = client.init_stream();
    client.perform_stream_op(
        first,
        StreamOpBatch::new()
            .send_initial_metadata(call_metadata())
            .send_trailing_metadata(Metadata::new()),
    );
    let second = client.init_stream();
    client.perform_stream_op(
        second,
        StreamOpBatch::new()
            .send_initial_metadata(call_metadata())
            .send_trailing_metadata(Metadata::new()),
    );

    ep.wait_written(
        |bytes| !frames_of(bytes, FrameType::Headers).is_empty(),
        RECV_TIMEOUT,
    );
    std::thread::sleep(Duration::from_millis(100));
    let headers = frames_of(&ep.written(), FrameType::Headers);
    assert_eq!(headers.len(), 1, "second stream must wait its turn");
    assert_eq!(headers[0].stream_id, 1);

    // Closing the first stream admits the second.
    ep.push_bytes(trailers_only_response(1));
    let wire = ep.wait_written(
        |bytes| frames_of(bytes, FrameType::Headers).len() >= 2,
        RECV_TIMEOUT,
    );
    let headers = frames_of(&wire, FrameType::Headers);
    assert_eq!(headers[1].stream_id, 3);
}

#[test]
fn test_stream_id_exhaustion_fails_queued_streams() {
    let ep = TestEndpoint::new("exhaustion");
    let client = Transport::client(
        ep.clone(),
        engine(),
        memory(),
        Config::new()
            .initial_stream_id(0x7fff_ffff)
            .bdp_probe(false)
            .rng_seed(18),
    );
    client.start_reading(None, None, None);

    // First stream takes the last usable id.
    let first = client.init_stream();
    client.perform_stream_op(
        first,
        StreamOpBatch::new().send_initial_metadata(call_metadata()),
    );
    let wire = ep.wait_written(
        |bytes| !frames_of(bytes, FrameType::Headers).is_empty(),
        RECV_TIMEOUT,
    );
    assert_eq!(
        frames_of(&wire, FrameType::Headers)[0].stream_id,
        0x7fff_ffff
    );

    // The next stream can never start.
    let second = client.init_stream();
    let (trail_tx, trail_rx) = mpsc::channel();
    client.perform_stream_op(
        second,
        StreamOpBatch::new()
            .send_initial_metadata(call_metadata())
            .recv_trailing_metadata(Box::new(move |md, stats| {
                trail_tx.send((md, stats)).unwrap()
            })),
    );
    let (trailers, _stats) = trail_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(trailers.grpc_status(), Some(Code::Unavailable));
    assert!(
        trailers
            .grpc_message()
            .is_some_and(|message| message.contains("Stream IDs exhausted"))
    );
    assert_eq!(
        trailers.network_state(),
        Some(StreamNetworkState::NotSentOnWire)
    );
}

#[test]
fn test_server_refuses_streams_over_limit() {
    let ep = TestEndpoint::new("refuse");
    let server = Transport::server(
        ep.clone(),
        engine(),
        memory(),
        Config::new().max_concurrent_streams(1).rng_seed(19),
    );
    let (accept_tx, accept_rx) = mpsc::channel();
    server.perform_op(transport::TransportOp::new().set_accept_stream(Box::new(
        move |handle| {
            accept_tx.send(handle).unwrap();
        },
    )));
    server.start_reading(None, None, None);

    // Ack our settings so the unacked-budget protection is not what
    // trips; then open two streams.
    let mut bytes = Vec::new();
    bytes.extend_from_slice(http2::CONNECTION_PREFACE);
    bytes.extend(settings_frame(&[]));
    bytes.extend(common::settings_ack_frame());
    let mut encoder = http2::hpack::HpackEncoder::new();
    for stream_id in [1u32, 3] {
        let fields = vec![
            http2::HeaderField::new(&b":method"[..], &b"POST"[..]),
            http2::HeaderField::new(&b":path"[..], &b"/svc/M"[..]),
        ];
        let mut block = bytes::BytesMut::new();
        encoder.encode(fields.iter(), &mut block);
        let mut headers = bytes::BytesMut::new();
        http2::encode::write_headers(&mut headers, stream_id, &block, false, 16_384);
        bytes.extend_from_slice(&headers);
    }
    ep.push_bytes(bytes);

    // The first stream lands; the second is refused.
    let first = accept_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    let wire = ep.wait_written(
        |bytes| !frames_of(bytes, FrameType::RstStream).is_empty(),
        RECV_TIMEOUT,
    );
    let rst = &frames_of(&wire, FrameType::RstStream)[0];
    assert_eq!(rst.stream_id, 3);
    assert_eq!(
        u32::from_be_bytes(rst.payload[..4].try_into().unwrap()),
        0x7, // REFUSED_STREAM
    );
    assert!(accept_rx.try_recv().is_err(), "second stream not accepted");
    let _ = first;
}
