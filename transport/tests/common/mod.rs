//! Shared harness for transport integration tests: in-memory endpoints,
//! wire-frame inspection, and a little patience.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use http2::frame::{FRAME_HEADER_SIZE, FrameHeader, FrameType};
use http2::hpack::HpackDecoder;
use transport::{Endpoint, ReadArgs, ReadDone, TransportError, WriteDone};

/// Endpoint driven directly by the test: inbound bytes are pushed by
/// hand, outbound bytes accumulate for inspection. Writes can be held
/// to simulate a congested pipe.
pub struct TestEndpoint {
    inner: Mutex<TestEndpointInner>,
    name: &'static str,
}

struct TestEndpointInner {
    inbound: VecDeque<Bytes>,
    pending_read: Option<ReadDone>,
    outbound: Vec<u8>,
    hold_writes: bool,
    held_writes: Vec<WriteDone>,
    read_error: Option<TransportError>,
    reads_armed: usize,
}

impl TestEndpoint {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TestEndpointInner {
                inbound: VecDeque::new(),
                pending_read: None,
                outbound: Vec::new(),
                hold_writes: false,
                held_writes: Vec::new(),
                read_error: None,
                reads_armed: 0,
            }),
            name,
        })
    }

    /// Feed bytes as if the peer had sent them.
    pub fn push_bytes(&self, bytes: impl Into<Bytes>) {
        let bytes = bytes.into();
        let pending = {
            let mut inner = self.inner.lock();
            inner.inbound.push_back(bytes);
            inner.pending_read.take()
        };
        if let Some(callback) = pending {
            let slices = self.drain_inbound();
            callback(Ok(slices));
        }
    }

    /// Fail the current (and any future) read with an error.
    pub fn fail_reads(&self, error: TransportError) {
        let pending = {
            let mut inner = self.inner.lock();
            inner.read_error = Some(error.clone());
            inner.pending_read.take()
        };
        if let Some(callback) = pending {
            callback(Err(error));
        }
    }

    fn drain_inbound(&self) -> Vec<Bytes> {
        let mut inner = self.inner.lock();
        inner.inbound.drain(..).collect()
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.inner.lock().outbound.clone()
    }

    pub fn hold_writes(&self, hold: bool) {
        self.inner.lock().hold_writes = hold;
    }

    /// Complete writes held back by `hold_writes`.
    pub fn release_writes(&self) {
        let held = std::mem::take(&mut self.inner.lock().held_writes);
        for callback in held {
            callback(Ok(()));
        }
    }

    pub fn has_pending_read(&self) -> bool {
        self.inner.lock().pending_read.is_some()
    }

    pub fn reads_armed(&self) -> usize {
        self.inner.lock().reads_armed
    }

    /// Wait until the written bytes satisfy `predicate`.
    pub fn wait_written<F>(&self, predicate: F, timeout: Duration) -> Vec<u8>
    where
        F: Fn(&[u8]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let written = self.written();
            if predicate(&written) {
                return written;
            }
            if Instant::now() > deadline {
                panic!(
                    "{}: timed out waiting for output; {} bytes written: {:?}",
                    self.name,
                    written.len(),
                    frames(&written)
                );
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Endpoint for TestEndpoint {
    fn read(&self, _args: ReadArgs, on_complete: ReadDone) {
        let ready = {
            let mut inner = self.inner.lock();
            inner.reads_armed += 1;
            if let Some(error) = inner.read_error.clone() {
                drop(inner);
                on_complete(Err(error));
                return;
            }
            if inner.inbound.is_empty() {
                inner.pending_read = Some(on_complete);
                None
            } else {
                Some(on_complete)
            }
        };
        if let Some(callback) = ready {
            let slices = self.drain_inbound();
            callback(Ok(slices));
        }
    }

    fn write(&self, data: Vec<Bytes>, _max_frame_size: usize, on_complete: WriteDone) {
        let complete_now = {
            let mut inner = self.inner.lock();
            for slice in &data {
                inner.outbound.extend_from_slice(slice);
            }
            if inner.hold_writes {
                inner.held_writes.push(on_complete);
                None
            } else {
                Some(on_complete)
            }
        };
        if let Some(callback) = complete_now {
            callback(Ok(()));
        }
    }

    fn peer_addr(&self) -> String {
        format!("test:{}", self.name)
    }

    fn local_addr(&self) -> String {
        "test:local".to_string()
    }
}

/// One half of an in-memory duplex pipe connecting two transports.
///
/// Read completions crossing the pipe are dispatched on a pump thread:
/// a write from one transport must never run the peer transport's
/// machinery inline, or the two control planes could interlock.
pub struct PipeEndpoint {
    rx: Arc<Mutex<PipeSide>>,
    tx: Arc<Mutex<PipeSide>>,
    pump: std::sync::mpsc::Sender<Box<dyn FnOnce() + Send>>,
    tap: Mutex<Vec<u8>>,
    name: &'static str,
}

struct PipeSide {
    buffer: VecDeque<Bytes>,
    pending_read: Option<ReadDone>,
    closed: bool,
}

impl PipeSide {
    fn new() -> Self {
        Self {
            buffer: VecDeque::new(),
            pending_read: None,
            closed: false,
        }
    }
}

impl PipeEndpoint {
    /// A connected pair: whatever one side writes, the other reads.
    pub fn pair() -> (Arc<PipeEndpoint>, Arc<PipeEndpoint>) {
        let (pump_tx, pump_rx) = std::sync::mpsc::channel::<Box<dyn FnOnce() + Send>>();
        std::thread::Builder::new()
            .name("pipe-pump".to_string())
            .spawn(move || {
                while let Ok(task) = pump_rx.recv() {
                    task();
                }
            })
            .expect("spawn pipe pump");
        let a_to_b = Arc::new(Mutex::new(PipeSide::new()));
        let b_to_a = Arc::new(Mutex::new(PipeSide::new()));
        let a = Arc::new(PipeEndpoint {
            rx: Arc::clone(&b_to_a),
            tx: Arc::clone(&a_to_b),
            pump: pump_tx.clone(),
            tap: Mutex::new(Vec::new()),
            name: "pipe-a",
        });
        let b = Arc::new(PipeEndpoint {
            rx: a_to_b,
            tx: b_to_a,
            pump: pump_tx,
            tap: Mutex::new(Vec::new()),
            name: "pipe-b",
        });
        (a, b)
    }

    /// Bytes this endpoint has written, for wire-level assertions.
    pub fn written(&self) -> Vec<u8> {
        self.tap.lock().clone()
    }
}

impl Endpoint for PipeEndpoint {
    fn read(&self, _args: ReadArgs, on_complete: ReadDone) {
        let mut side = self.rx.lock();
        if side.closed {
            drop(side);
            on_complete(Err(TransportError::new("pipe closed")));
            return;
        }
        if side.buffer.is_empty() {
            side.pending_read = Some(on_complete);
            return;
        }
        let slices: Vec<Bytes> = side.buffer.drain(..).collect();
        drop(side);
        on_complete(Ok(slices));
    }

    fn write(&self, data: Vec<Bytes>, _max_frame_size: usize, on_complete: WriteDone) {
        {
            let mut tap = self.tap.lock();
            for slice in &data {
                tap.extend_from_slice(slice);
            }
        }
        let pending = {
            let mut side = self.tx.lock();
            for slice in data {
                side.buffer.push_back(slice);
            }
            side.pending_read.take()
        };
        if let Some(callback) = pending {
            let peer = Arc::clone(&self.tx);
            let _ = self.pump.send(Box::new(move || {
                let slices: Vec<Bytes> = peer.lock().buffer.drain(..).collect();
                callback(Ok(slices));
            }));
        }
        on_complete(Ok(()));
    }

    fn peer_addr(&self) -> String {
        format!("pipe:{}", self.name)
    }

    fn local_addr(&self) -> String {
        format!("pipe:{}", self.name)
    }
}

/// A parsed frame from a raw byte capture.
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub kind: Option<FrameType>,
    pub raw_kind: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

/// Split a byte capture into frames, skipping the client preface if
/// present.
pub fn frames(mut bytes: &[u8]) -> Vec<WireFrame> {
    if bytes.starts_with(http2::CONNECTION_PREFACE) {
        bytes = &bytes[http2::CONNECTION_PREFACE.len()..];
    }
    let mut out = Vec::new();
    while bytes.len() >= FRAME_HEADER_SIZE {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&bytes[..FRAME_HEADER_SIZE]);
        let header = FrameHeader::parse(&header);
        let total = FRAME_HEADER_SIZE + header.length as usize;
        if bytes.len() < total {
            break;
        }
        out.push(WireFrame {
            kind: header.frame_type(),
            raw_kind: header.kind,
            flags: header.flags,
            stream_id: header.stream_id,
            payload: bytes[FRAME_HEADER_SIZE..total].to_vec(),
        });
        bytes = &bytes[total..];
    }
    out
}

/// Find all frames of one type.
pub fn frames_of(bytes: &[u8], kind: FrameType) -> Vec<WireFrame> {
    frames(bytes)
        .into_iter()
        .filter(|frame| frame.kind == Some(kind))
        .collect()
}

/// Decode every HEADERS block in a capture in order with one decoder
/// (the dynamic table is connection-scoped).
pub fn decode_header_blocks(bytes: &[u8]) -> Vec<Vec<(String, String)>> {
    let mut decoder = HpackDecoder::new();
    let mut out = Vec::new();
    for frame in frames(bytes) {
        if frame.kind == Some(FrameType::Headers) {
            let fields = decoder.decode(&frame.payload).expect("valid header block");
            out.push(
                fields
                    .into_iter()
                    .map(|field| {
                        (
                            String::from_utf8_lossy(&field.name).into_owned(),
                            String::from_utf8_lossy(&field.value).into_owned(),
                        )
                    })
                    .collect(),
            );
        }
    }
    out
}

/// Encode a SETTINGS frame a scripted peer would send.
pub fn settings_frame(settings: &[(http2::SettingId, u32)]) -> Vec<u8> {
    let mut buf = bytes::BytesMut::new();
    let list: Vec<http2::Setting> = settings
        .iter()
        .map(|&(id, value)| http2::Setting { id, value })
        .collect();
    http2::encode::write_settings(&mut buf, &list);
    buf.to_vec()
}

pub fn settings_ack_frame() -> Vec<u8> {
    let mut buf = bytes::BytesMut::new();
    http2::encode::write_settings_ack(&mut buf);
    buf.to_vec()
}

pub fn ping_ack_frame(id: u64) -> Vec<u8> {
    let mut buf = bytes::BytesMut::new();
    http2::encode::write_ping(&mut buf, true, id);
    buf.to_vec()
}

pub fn window_update_frame(stream_id: u32, increment: u32) -> Vec<u8> {
    let mut buf = bytes::BytesMut::new();
    http2::encode::write_window_update(&mut buf, stream_id, increment);
    buf.to_vec()
}

pub fn goaway_frame(last_stream_id: u32, error_code: u32, debug_data: &[u8]) -> Vec<u8> {
    let mut buf = bytes::BytesMut::new();
    http2::encode::write_goaway(&mut buf, last_stream_id, error_code, debug_data);
    buf.to_vec()
}

/// Wait for a condition with a deadline.
pub fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
