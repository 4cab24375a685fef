//! Induced-frame back-pressure: a flood of inbound pings queues acks,
//! and once too many are pending behind a stuck write, reading pauses
//! until the pipe drains.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestEndpoint, settings_frame, wait_for};
use transport::{
    Config, EventEngine, MemoryOwner, ThreadedEngine, Transport, UnconstrainedMemory,
};

fn engine() -> Arc<dyn EventEngine> {
    Arc::new(ThreadedEngine::new())
}

fn memory() -> Arc<dyn MemoryOwner> {
    Arc::new(UnconstrainedMemory)
}

#[test]
fn test_ping_flood_pauses_reading_until_writes_drain() {
    let ep = TestEndpoint::new("flood");
    // Writes never complete until released: acks pile up in the induced
    // queue.
    ep.hold_writes(true);
    let server = Transport::server(
        ep.clone(),
        engine(),
        memory(),
        Config::new().max_ping_strikes(0).rng_seed(16),
    );
    server.start_reading(None, None, None);
    wait_for("initial read armed", || ep.has_pending_read());

    let mut bytes = Vec::new();
    bytes.extend_from_slice(http2::CONNECTION_PREFACE);
    bytes.extend(settings_frame(&[]));
    // 10_000 pings: each queues a PING ack (the SETTINGS ack makes one
    // more, but the cap check happens at end-of-read).
    let mut ping = bytes::BytesMut::new();
    for id in 0..10_000u64 {
        http2::encode::write_ping(&mut ping, false, id);
    }
    bytes.extend_from_slice(&ping);
    ep.push_bytes(bytes);

    // The parse drains the input and then refuses to re-arm the read.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        std::thread::sleep(Duration::from_millis(25));
        if !ep.has_pending_read() {
            // Confirm it stays paused rather than being between reads.
            std::thread::sleep(Duration::from_millis(50));
            if !ep.has_pending_read() {
                break;
            }
        }
        if std::time::Instant::now() > deadline {
            panic!("reading never paused behind induced frames");
        }
    }

    // Draining the write pipeline flushes the acks and resumes reading.
    ep.hold_writes(false);
    ep.release_writes();
    wait_for("read resumed after induced frames flushed", || {
        ep.has_pending_read()
    });
}
