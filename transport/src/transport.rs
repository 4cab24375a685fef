//! The transport object: one per connected peer.
//!
//! `Transport` is a cheap cloneable handle. All mutable state lives in
//! `TransportState`, guarded by the combiner; the handle's methods only
//! enqueue work. Timers, endpoint completions, and memory reclamation
//! all re-enter the combiner the same way.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use tracing::{debug, info, trace, warn};

use http2::hpack::{HpackDecoder, HpackEncoder};
use http2::{ErrorCode, Settings};

use crate::combiner::{Combiner, CombinerState};
use crate::config::Config;
use crate::connectivity::{ConnectivityState, StateTracker};
use crate::endpoint::Endpoint;
use crate::engine::{EventEngine, TaskHandle};
use crate::error::TransportError;
use crate::flow_control::{FlowControlAction, TransportFlowControl, Urgency};
use crate::memory::{MemoryOwner, ReclamationPass, ReclamationSweep};
use crate::op::{AcceptStreamFn, OpDone, StreamOpBatch, TransportOp};
use crate::parsing::Deframer;
use crate::ping::{
    KeepaliveState, PingAbusePolicy, PingCallbacks, PingRatePolicy, ping_cancelled,
};
use crate::status::Code;
use crate::stream::{
    STREAM_LIST_COUNT, Stream, StreamHandle, StreamKey, StreamList,
};
use crate::write::{WriteReason, WriteState};

/// Largest stream id either side may allocate.
pub(crate) const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// Cap applied to the keepalive and ping timeouts once a graceful
/// shutdown begins. The shortened values persist for the rest of the
/// transport's life.
const GRACEFUL_GOAWAY_TIMEOUT_CAP: Duration = Duration::from_secs(20);

/// Default keepalive interval for servers (clients default to disabled).
const DEFAULT_SERVER_KEEPALIVE_TIME: Duration = Duration::from_secs(7200);

/// Progress of our own GOAWAY towards the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GoawaySendState {
    NotSent,
    /// First GOAWAY (max stream id) sent; waiting on a ping ack.
    Graceful,
    /// Final GOAWAY queued for the next write.
    FinalScheduled,
    /// Final GOAWAY on the wire.
    FinalSent,
}

pub(crate) struct TransportShared {
    pub(crate) combiner: Arc<Combiner<TransportState>>,
    pub(crate) engine: Arc<dyn EventEngine>,
    /// The endpoint slot; close drops the endpoint under this mutex
    /// because address queries from the upper layer may race with close.
    pub(crate) endpoint: Mutex<Option<Arc<dyn Endpoint>>>,
    pub(crate) memory: Arc<dyn MemoryOwner>,
    pub(crate) is_client: bool,
    pub(crate) peer: String,
    next_stream_key: AtomicU64,
}

impl TransportShared {
    /// Enqueue work on the control plane.
    pub(crate) fn run<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce(&mut TransportState, &Arc<TransportShared>) + Send + 'static,
    {
        let ctx = Arc::clone(self);
        self.combiner.run(Box::new(move |state| f(state, &ctx)));
    }

    /// Enqueue work that runs after all currently queued work.
    pub(crate) fn run_finally<F>(self: &Arc<Self>, f: F)
    where
        F: FnOnce(&mut TransportState, &Arc<TransportShared>) + Send + 'static,
    {
        let ctx = Arc::clone(self);
        self.combiner.run_finally(Box::new(move |state| f(state, &ctx)));
    }

    /// Arm a timer whose expiry re-enters the combiner.
    pub(crate) fn arm_timer<F>(self: &Arc<Self>, delay: Duration, f: F) -> TaskHandle
    where
        F: FnOnce(&mut TransportState, &Arc<TransportShared>) + Send + 'static,
    {
        let ctx = Arc::clone(self);
        self.engine.run_after(
            delay,
            Box::new(move || {
                let inner = Arc::clone(&ctx);
                inner.run(f);
            }),
        )
    }

    pub(crate) fn cancel_timer(&self, handle: Option<TaskHandle>) {
        if let Some(handle) = handle {
            self.engine.cancel(handle);
        }
    }

    pub(crate) fn endpoint(&self) -> Option<Arc<dyn Endpoint>> {
        self.endpoint.lock().clone()
    }

    pub(crate) fn next_stream_key(&self) -> u64 {
        self.next_stream_key.fetch_add(1, Ordering::Relaxed)
    }
}

pub(crate) struct TransportState {
    pub(crate) is_client: bool,
    pub(crate) peer: String,
    pub(crate) config: Config,
    pub(crate) settings_timeout: Duration,

    // Streams.
    pub(crate) streams: AHashMap<StreamKey, Stream>,
    pub(crate) stream_map: AHashMap<u32, StreamKey>,
    pub(crate) lists: [VecDeque<StreamKey>; STREAM_LIST_COUNT],
    pub(crate) next_stream_id: u32,
    pub(crate) last_new_stream_id: u32,
    pub(crate) incoming_streams_before_settings_ack: u32,

    // Write plane.
    pub(crate) write_state: WriteState,
    pub(crate) outbuf: BytesMut,
    pub(crate) qbuf: BytesMut,
    pub(crate) num_pending_induced_frames: u32,
    pub(crate) reading_paused_on_pending_induced_frames: bool,
    pub(crate) run_after_write: Vec<Box<dyn FnOnce() + Send + 'static>>,
    pub(crate) streams_written_this_turn: Vec<StreamKey>,
    pub(crate) wrote_preface: bool,

    // Settings.
    pub(crate) local_settings: Settings,
    pub(crate) sent_settings: Settings,
    pub(crate) acked_settings: Settings,
    pub(crate) settings_sent_once: bool,
    pub(crate) settings_ack_watchdog: Option<TaskHandle>,
    pub(crate) peer_settings: Settings,
    pub(crate) peer_settings_seen: bool,
    pub(crate) initial_window_update: i64,

    // Codecs and read plane.
    pub(crate) hpack_encoder: HpackEncoder,
    pub(crate) hpack_decoder: HpackDecoder,
    pub(crate) deframe: Deframer,
    pub(crate) pending_read: VecDeque<Bytes>,
    pub(crate) sniff_buffer: Vec<u8>,
    pub(crate) first_frame_parsed: bool,

    // Flow control.
    pub(crate) flow_control: TransportFlowControl,

    // Pings and keepalive.
    pub(crate) ping_callbacks: PingCallbacks,
    pub(crate) ping_abuse: PingAbusePolicy,
    pub(crate) ping_rate: PingRatePolicy,
    pub(crate) keepalive_state: KeepaliveState,
    pub(crate) keepalive_time: Option<Duration>,
    pub(crate) keepalive_timeout: Duration,
    pub(crate) ping_timeout: Duration,
    pub(crate) keepalive_permit_without_calls: bool,
    pub(crate) keepalive_ping_timer: Option<TaskHandle>,
    pub(crate) keepalive_watchdog_timer: Option<TaskHandle>,
    pub(crate) ping_timeout_timer: Option<TaskHandle>,
    pub(crate) delayed_ping_timer: Option<TaskHandle>,
    pub(crate) next_bdp_ping_timer: Option<TaskHandle>,
    pub(crate) bdp_ping_blocked: bool,
    pub(crate) bdp_ping_started: bool,

    // Goaway and close.
    pub(crate) goaway_send_state: GoawaySendState,
    pub(crate) graceful_goaway_timer: Option<TaskHandle>,
    pub(crate) goaway_error: Option<TransportError>,
    pub(crate) closed_with_error: Option<TransportError>,
    pub(crate) close_on_writes_finished: Option<TransportError>,
    pub(crate) destroying: bool,

    // Upper-layer callbacks.
    pub(crate) connectivity: StateTracker,
    pub(crate) accept_stream: Option<AcceptStreamFn>,
    pub(crate) notify_on_receive_settings: Option<OpDone>,
    pub(crate) notify_on_close: Option<OpDone>,

    // Reclamation.
    pub(crate) benign_reclaimer_registered: bool,
    pub(crate) destructive_reclaimer_registered: bool,

    pub(crate) rng: Xoshiro256PlusPlus,
    pub(crate) after_turn: Vec<Box<dyn FnOnce() + Send + 'static>>,
    pub(crate) offload_requested: bool,
}

impl CombinerState for TransportState {
    fn take_after_turn(&mut self) -> Vec<Box<dyn FnOnce() + Send + 'static>> {
        std::mem::take(&mut self.after_turn)
    }

    fn take_yield_request(&mut self) -> bool {
        std::mem::take(&mut self.offload_requested)
    }
}

fn build_state(is_client: bool, peer: String, config: Config) -> TransportState {
    let config = config.validated(is_client);

    let mut local_settings = Settings::default();
    local_settings.enable_push = false;
    local_settings.header_table_size = config.hpack_decoder_table_size;
    local_settings.initial_window_size = config.initial_window_size;
    local_settings.max_frame_size = config.max_frame_size;
    local_settings.max_header_list_size = config.max_header_list_size;
    local_settings.allow_true_binary_metadata = config.enable_true_binary_metadata;
    if is_client {
        // No push means no server-initiated streams towards us.
        local_settings.max_concurrent_streams = 0;
    } else if let Some(max) = config.max_concurrent_streams {
        local_settings.max_concurrent_streams = max;
    }
    if config.enable_preferred_rx_crypto_frame_size {
        local_settings.preferred_receive_crypto_frame_size = u32::MAX;
    }

    let keepalive_time = config.keepalive_time.or(if is_client {
        None
    } else {
        Some(DEFAULT_SERVER_KEEPALIVE_TIME)
    });

    let mut hpack_decoder = HpackDecoder::with_table_size(config.hpack_decoder_table_size as usize);
    hpack_decoder.set_max_header_list_size(config.max_header_list_size as usize);

    let rng = {
        use rand::RngCore;
        let seed = config.rng_seed.unwrap_or_else(|| rand::rng().next_u64());
        Xoshiro256PlusPlus::seed_from_u64(seed)
    };

    TransportState {
        settings_timeout: config.resolved_settings_timeout(),
        streams: AHashMap::new(),
        stream_map: AHashMap::new(),
        lists: std::array::from_fn(|_| VecDeque::new()),
        next_stream_id: config
            .initial_stream_id
            .unwrap_or(if is_client { 1 } else { 2 }),
        last_new_stream_id: 0,
        incoming_streams_before_settings_ack: local_settings.max_concurrent_streams,
        write_state: WriteState::Idle,
        outbuf: BytesMut::new(),
        qbuf: BytesMut::new(),
        num_pending_induced_frames: 0,
        reading_paused_on_pending_induced_frames: false,
        run_after_write: Vec::new(),
        streams_written_this_turn: Vec::new(),
        wrote_preface: !is_client,
        local_settings,
        sent_settings: Settings::default(),
        acked_settings: Settings::default(),
        settings_sent_once: false,
        settings_ack_watchdog: None,
        peer_settings: Settings::default(),
        peer_settings_seen: false,
        initial_window_update: 0,
        hpack_encoder: HpackEncoder::with_table_size(config.hpack_encoder_table_size as usize),
        hpack_decoder,
        deframe: Deframer::new(!is_client),
        pending_read: VecDeque::new(),
        sniff_buffer: Vec::new(),
        first_frame_parsed: false,
        flow_control: TransportFlowControl::new(
            config.initial_window_size,
            config.bdp_probe,
            config.enable_preferred_rx_crypto_frame_size,
        ),
        ping_callbacks: PingCallbacks::new(),
        ping_abuse: PingAbusePolicy::new(
            config.max_ping_strikes,
            config.min_recv_ping_interval_without_data,
        ),
        ping_rate: PingRatePolicy::new(is_client),
        keepalive_state: KeepaliveState::Disabled,
        keepalive_time,
        keepalive_timeout: config.keepalive_timeout,
        ping_timeout: config.ping_timeout,
        keepalive_permit_without_calls: config.keepalive_permit_without_calls,
        keepalive_ping_timer: None,
        keepalive_watchdog_timer: None,
        ping_timeout_timer: None,
        delayed_ping_timer: None,
        next_bdp_ping_timer: None,
        bdp_ping_blocked: false,
        bdp_ping_started: false,
        goaway_send_state: GoawaySendState::NotSent,
        graceful_goaway_timer: None,
        goaway_error: None,
        closed_with_error: None,
        close_on_writes_finished: None,
        destroying: false,
        connectivity: StateTracker::new(
            if is_client {
                "client_transport"
            } else {
                "server_transport"
            },
            ConnectivityState::Ready,
        ),
        accept_stream: None,
        notify_on_receive_settings: None,
        notify_on_close: None,
        benign_reclaimer_registered: false,
        destructive_reclaimer_registered: false,
        rng,
        after_turn: Vec::new(),
        offload_requested: false,
        is_client,
        peer,
        config,
    }
}

/// Handle to a running transport.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<TransportShared>,
}

impl Transport {
    pub fn client(
        endpoint: Arc<dyn Endpoint>,
        engine: Arc<dyn EventEngine>,
        memory: Arc<dyn MemoryOwner>,
        config: Config,
    ) -> Transport {
        Self::new(endpoint, engine, memory, config, true)
    }

    pub fn server(
        endpoint: Arc<dyn Endpoint>,
        engine: Arc<dyn EventEngine>,
        memory: Arc<dyn MemoryOwner>,
        config: Config,
    ) -> Transport {
        Self::new(endpoint, engine, memory, config, false)
    }

    fn new(
        endpoint: Arc<dyn Endpoint>,
        engine: Arc<dyn EventEngine>,
        memory: Arc<dyn MemoryOwner>,
        config: Config,
        is_client: bool,
    ) -> Transport {
        let peer = endpoint.peer_addr();
        memory.reserve(std::mem::size_of::<TransportState>());
        let state = build_state(is_client, peer.clone(), config);
        let combiner = Combiner::new(Arc::clone(&engine), state);
        let shared = Arc::new(TransportShared {
            combiner,
            engine,
            endpoint: Mutex::new(Some(endpoint)),
            memory,
            is_client,
            peer,
            next_stream_key: AtomicU64::new(1),
        });
        shared.run(|state, cx| {
            state.init_keepalive_pings_if_enabled(cx);
            if state.flow_control.bdp().is_some() {
                state.bdp_ping_blocked = true;
                let action = state.flow_control.periodic_update(cx.memory.memory_pressure());
                state.act_on_flowctl_action(cx, action, None);
            }
            state.initiate_write(cx, WriteReason::InitialWrite);
            state.post_benign_reclaimer(cx);
        });
        Transport { shared }
    }

    pub fn is_client(&self) -> bool {
        self.shared.is_client
    }

    pub fn peer(&self) -> String {
        self.shared.peer.clone()
    }

    /// Create a stream (client path). The stream holds no id until
    /// `send_initial_metadata` admits it under the concurrency limit.
    pub fn init_stream(&self) -> StreamHandle {
        let key = self.shared.next_stream_key();
        self.shared.run(move |state, _cx| {
            state.streams.insert(key, Stream::new(key));
        });
        StreamHandle(key)
    }

    /// Submit a batch of stream operations.
    pub fn perform_stream_op(&self, handle: StreamHandle, batch: StreamOpBatch) {
        self.shared.run(move |state, cx| {
            state.perform_stream_op_locked(cx, handle.0, batch);
        });
    }

    /// Submit a transport operation.
    pub fn perform_op(&self, op: TransportOp) {
        self.shared.run(move |state, cx| {
            state.perform_transport_op(cx, op);
        });
    }

    /// Release a stream. The call layer must have seen all its
    /// completion callbacks fire.
    pub fn destroy_stream(&self, handle: StreamHandle, on_destroyed: Option<OpDone>) {
        self.shared.run(move |state, _cx| {
            state.destroy_stream_locked(handle.0);
            if let Some(callback) = on_destroyed {
                state.defer_done(callback, Ok(()));
            }
        });
    }

    /// Begin the read loop. `initial` carries bytes the handshake layer
    /// already pulled off the wire.
    pub fn start_reading(
        &self,
        initial: Option<Bytes>,
        notify_on_receive_settings: Option<OpDone>,
        notify_on_close: Option<OpDone>,
    ) {
        self.shared.run(move |state, cx| {
            if let Some(error) = state.closed_with_error.clone() {
                if let Some(callback) = notify_on_receive_settings {
                    state.defer_done(callback, Err(error.clone()));
                }
                if let Some(callback) = notify_on_close {
                    state.defer_done(callback, Err(error));
                }
                return;
            }
            state.notify_on_receive_settings = notify_on_receive_settings;
            state.notify_on_close = notify_on_close;
            match initial {
                Some(bytes) if !bytes.is_empty() => {
                    state.read_action(cx, Ok(vec![bytes]));
                }
                _ => state.continue_read(cx),
            }
        });
    }

    /// Tear the transport down.
    pub fn close(&self, error: TransportError) {
        self.shared.run(move |state, cx| {
            state.destroying = true;
            state.close_transport(cx, error);
        });
    }
}

impl TransportState {
    pub(crate) fn defer(&mut self, callback: Box<dyn FnOnce() + Send + 'static>) {
        self.after_turn.push(callback);
    }

    pub(crate) fn defer_done(&mut self, callback: OpDone, result: Result<(), TransportError>) {
        self.after_turn.push(Box::new(move || callback(result)));
    }

    pub(crate) fn mark_stream_writable(&mut self, key: StreamKey) {
        if self.closed_with_error.is_none() {
            self.list_add(key, StreamList::Writable);
        }
    }

    pub(crate) fn destroy_stream_locked(&mut self, key: StreamKey) {
        for list in [
            StreamList::Writable,
            StreamList::WaitingForConcurrency,
            StreamList::StalledByTransport,
            StreamList::StalledByStream,
        ] {
            self.list_remove(key, list);
        }
        if let Some(stream) = self.streams.remove(&key) {
            debug_assert_eq!(stream.key, key);
            debug_assert!(
                stream.fully_closed() || stream.id == 0,
                "stream destroyed while half-open"
            );
            debug_assert!(
                stream.recv_initial_metadata_ready.is_none()
                    && stream.recv_message_ready.is_none()
                    && stream.recv_trailing_metadata_ready.is_none(),
                "stream destroyed with latched completions"
            );
            if stream.id != 0 {
                self.stream_map.remove(&stream.id);
            }
        }
    }

    //
    // Transport ops.
    //

    pub(crate) fn perform_transport_op(&mut self, cx: &Arc<TransportShared>, op: TransportOp) {
        if let Some(error) = op.goaway {
            self.send_goaway(cx, error, false);
        }
        if let Some(accept) = op.set_accept_stream {
            self.accept_stream = Some(accept);
        }
        if op.ping_on_initiate.is_some() || op.ping_on_ack.is_some() {
            self.send_ping(cx, op.ping_on_initiate, op.ping_on_ack);
            self.initiate_write(cx, WriteReason::ApplicationPing);
        }
        if let Some((id, watcher)) = op.start_connectivity_watch {
            self.connectivity.add_watcher(id, watcher);
        }
        if let Some(id) = op.stop_connectivity_watch {
            self.connectivity.remove_watcher(id);
        }
        if let Some(error) = op.disconnect {
            self.send_goaway(cx, error.clone(), true);
            self.close_transport(cx, error);
        }
        if let Some(callback) = op.on_consumed {
            self.defer_done(callback, Ok(()));
        }
    }

    pub(crate) fn send_ping(
        &mut self,
        _cx: &Arc<TransportShared>,
        on_initiate: Option<OpDone>,
        on_ack: Option<OpDone>,
    ) {
        if let Some(error) = self.closed_with_error.clone() {
            if let Some(callback) = on_initiate {
                self.defer_done(callback, Err(error.clone()));
            }
            if let Some(callback) = on_ack {
                self.defer_done(callback, Err(error));
            }
            return;
        }
        self.ping_callbacks.on_ping(on_initiate, on_ack);
    }

    //
    // Stream admission (client path).
    //

    pub(crate) fn maybe_start_some_streams(&mut self, cx: &Arc<TransportShared>) {
        if let Some(goaway_error) = self.goaway_error.clone() {
            self.cancel_unstarted_streams(cx, goaway_error);
            return;
        }
        if self.closed_with_error.is_some() {
            return;
        }
        while self.next_stream_id <= MAX_STREAM_ID
            && (self.stream_map.len() as u64) < self.peer_settings.max_concurrent_streams as u64
        {
            let Some(key) = self.list_pop(StreamList::WaitingForConcurrency) else {
                break;
            };
            let id = self.next_stream_id;
            self.next_stream_id += 2;
            if let Some(stream) = self.streams.get_mut(&key) {
                debug_assert_eq!(stream.id, 0, "stream started twice");
                stream.id = id;
            }
            trace!(peer = %self.peer, id, "starting stream");
            if self.next_stream_id >= MAX_STREAM_ID {
                let exhausted = TransportError::new("Transport Stream IDs exhausted")
                    .with_status(Code::Unavailable);
                self.connectivity.set_state(
                    ConnectivityState::TransientFailure,
                    Some(&exhausted),
                    "no_more_stream_ids",
                );
            }
            self.stream_map.insert(id, key);
            self.post_destructive_reclaimer(cx);
            self.mark_stream_writable(key);
            self.initiate_write(cx, WriteReason::StartNewStream);
        }
        if self.next_stream_id >= MAX_STREAM_ID {
            let error = TransportError::new("Stream IDs exhausted").with_status(Code::Unavailable);
            while let Some(key) = self.list_pop(StreamList::WaitingForConcurrency) {
                if let Some(stream) = self.streams.get_mut(&key) {
                    stream
                        .trailing_metadata_buffer
                        .set_network_state(crate::error::StreamNetworkState::NotSentOnWire);
                }
                self.cancel_stream(cx, key, error.clone(), false);
            }
        }
    }

    pub(crate) fn cancel_unstarted_streams(
        &mut self,
        cx: &Arc<TransportShared>,
        error: TransportError,
    ) {
        while let Some(key) = self.list_pop(StreamList::WaitingForConcurrency) {
            if let Some(stream) = self.streams.get_mut(&key) {
                stream
                    .trailing_metadata_buffer
                    .set_network_state(crate::error::StreamNetworkState::NotSentOnWire);
            }
            self.cancel_stream(cx, key, error.clone(), false);
        }
    }

    //
    // Goaway, both directions.
    //

    pub(crate) fn send_goaway(
        &mut self,
        cx: &Arc<TransportShared>,
        error: TransportError,
        immediate: bool,
    ) {
        let http_error = error.http2_code();
        if !self.is_client && http_error == ErrorCode::NoError && !immediate {
            if self.goaway_send_state == GoawaySendState::NotSent {
                self.start_graceful_goaway(cx);
            }
            // A graceful shutdown is already in flight otherwise.
        } else if matches!(
            self.goaway_send_state,
            GoawaySendState::NotSent | GoawaySendState::Graceful
        ) {
            debug!(
                peer = %self.peer,
                is_client = self.is_client,
                last_new_stream_id = self.last_new_stream_id,
                error = %error,
                "sending goaway"
            );
            cx.cancel_timer(self.graceful_goaway_timer.take());
            self.goaway_send_state = GoawaySendState::FinalScheduled;
            let message = error.message().to_string();
            self.queue_goaway(self.last_new_stream_id, http_error.as_u32(), message.as_bytes());
        }
        // Duplicate final goaways are swallowed.
        self.initiate_write(cx, WriteReason::GoawaySent);
    }

    fn start_graceful_goaway(&mut self, cx: &Arc<TransportShared>) {
        self.goaway_send_state = GoawaySendState::Graceful;
        self.queue_goaway(MAX_STREAM_ID, ErrorCode::NoError.as_u32(), b"");
        // The shortened timeouts persist for the rest of the transport's
        // life.
        self.keepalive_timeout = self.keepalive_timeout.min(GRACEFUL_GOAWAY_TIMEOUT_CAP);
        self.ping_timeout = self.ping_timeout.min(GRACEFUL_GOAWAY_TIMEOUT_CAP);
        let on_ack = Arc::clone(cx);
        self.ping_callbacks.on_ping(
            None,
            Some(Box::new(move |_result| {
                on_ack.run(|state, cx| state.maybe_send_final_goaway(cx));
            })),
        );
        self.graceful_goaway_timer = Some(cx.arm_timer(
            GRACEFUL_GOAWAY_TIMEOUT_CAP,
            |state, cx| {
                state.graceful_goaway_timer = None;
                state.maybe_send_final_goaway(cx);
            },
        ));
    }

    pub(crate) fn maybe_send_final_goaway(&mut self, cx: &Arc<TransportShared>) {
        if self.goaway_send_state != GoawaySendState::Graceful {
            return;
        }
        if self.destroying || self.closed_with_error.is_some() {
            trace!(peer = %self.peer, "transport shutting down; graceful goaway abandoned");
            return;
        }
        debug!(
            peer = %self.peer,
            last_new_stream_id = self.last_new_stream_id,
            "graceful shutdown: sending final goaway"
        );
        cx.cancel_timer(self.graceful_goaway_timer.take());
        self.goaway_send_state = GoawaySendState::FinalScheduled;
        self.queue_goaway(self.last_new_stream_id, ErrorCode::NoError.as_u32(), b"");
        self.initiate_write(cx, WriteReason::GoawaySent);
    }

    pub(crate) fn add_incoming_goaway(
        &mut self,
        cx: &Arc<TransportShared>,
        error_code: u32,
        last_stream_id: u32,
        debug_data: &[u8],
    ) {
        let text = String::from_utf8_lossy(debug_data).into_owned();
        let mut goaway_error = TransportError::new(format!(
            "GOAWAY received; Error code: {}; Debug Text: {}",
            error_code, text
        ))
        .with_status(Code::Unavailable)
        .with_http2_code(ErrorCode::from_u32(error_code))
        .with_peer(self.peer.clone());

        if error_code != ErrorCode::NoError.as_u32() {
            info!(peer = %self.peer, error_code, text = %text, "received goaway with error");
        } else {
            trace!(peer = %self.peer, last_stream_id, "received goaway");
        }

        // A client flooded into ENHANCE_YOUR_CALM must slow its
        // keepalive pings; the doubled interval rides the error so the
        // channel can apply it to new connections.
        if self.is_client
            && error_code == ErrorCode::EnhanceYourCalm.as_u32()
            && debug_data == b"too_many_pings"
        {
            let current = self.keepalive_time.unwrap_or(Duration::MAX);
            let throttled = current.checked_mul(2).unwrap_or(Duration::MAX);
            warn!(
                peer = %self.peer,
                current_keepalive = ?self.keepalive_time,
                "peer demanded calm over pings; doubling keepalive interval for new connections"
            );
            goaway_error = goaway_error.with_keepalive_throttle(throttled);
        }

        self.goaway_error = Some(goaway_error.clone());

        if self.is_client {
            self.cancel_unstarted_streams(cx, goaway_error.clone());
            let abandoned: Vec<StreamKey> = self
                .stream_map
                .iter()
                .filter(|(id, _)| **id > last_stream_id)
                .map(|(_, key)| *key)
                .collect();
            for key in abandoned {
                if let Some(stream) = self.streams.get_mut(&key) {
                    stream
                        .trailing_metadata_buffer
                        .set_network_state(crate::error::StreamNetworkState::NotSeenByServer);
                }
                self.cancel_stream(cx, key, goaway_error.clone(), false);
            }
        }

        self.connectivity.set_state(
            ConnectivityState::TransientFailure,
            Some(&goaway_error),
            "got_goaway",
        );
    }

    /// Server-side ping flood response: calm the peer down and close.
    pub(crate) fn exceeded_ping_strikes(&mut self, cx: &Arc<TransportShared>) {
        self.send_goaway(
            cx,
            TransportError::new("too_many_pings").with_http2_code(ErrorCode::EnhanceYourCalm),
            true,
        );
        self.close_transport(
            cx,
            TransportError::new("Too many pings").with_status(Code::Unavailable),
        );
    }

    //
    // Close.
    //

    pub(crate) fn close_transport(&mut self, cx: &Arc<TransportShared>, error: TransportError) {
        let error = if error.has_clear_status() {
            error
        } else {
            error.with_status(Code::Unavailable)
        };
        self.end_all_the_calls(cx, error.clone());
        self.cancel_pings(error.clone());
        if self.closed_with_error.is_none() {
            if self.write_state != WriteState::Idle {
                // Never abort an in-flight endpoint write mid-frame; the
                // write completion path finishes the close.
                if self.close_on_writes_finished.is_none() {
                    self.close_on_writes_finished = Some(TransportError::referencing(
                        "Delayed close due to in-progress write",
                        &error,
                    ));
                }
                return;
            }
            debug!(peer = %self.peer, error = %error, "closing transport");
            self.closed_with_error = Some(error.clone());
            self.connectivity
                .set_state(ConnectivityState::Shutdown, Some(&error), "close_transport");
            cx.cancel_timer(self.keepalive_ping_timer.take());
            cx.cancel_timer(self.keepalive_watchdog_timer.take());
            cx.cancel_timer(self.ping_timeout_timer.take());
            cx.cancel_timer(self.settings_ack_watchdog.take());
            cx.cancel_timer(self.delayed_ping_timer.take());
            cx.cancel_timer(self.next_bdp_ping_timer.take());
            cx.cancel_timer(self.graceful_goaway_timer.take());
            while self.list_pop(StreamList::Writable).is_some() {}
            debug_assert_eq!(self.write_state, WriteState::Idle);
            *cx.endpoint.lock() = None;
        }
        if let Some(callback) = self.notify_on_receive_settings.take() {
            self.defer_done(callback, Err(error.clone()));
        }
        if let Some(callback) = self.notify_on_close.take() {
            self.defer_done(callback, Err(error));
        }
    }

    fn end_all_the_calls(&mut self, cx: &Arc<TransportShared>, error: TransportError) {
        let error = if !self.is_client && !error.has_clear_status() {
            error.with_status(Code::Unavailable)
        } else {
            error
        };
        self.cancel_unstarted_streams(cx, error.clone());
        let keys: Vec<StreamKey> = self.stream_map.values().copied().collect();
        for key in keys {
            self.cancel_stream(cx, key, error.clone(), false);
        }
    }

    fn cancel_pings(&mut self, error: TransportError) {
        let failure = ping_cancelled(&error);
        for callback in self.ping_callbacks.cancel_all() {
            let failure = failure.clone();
            self.after_turn.push(Box::new(move || callback(Err(failure))));
        }
    }

    //
    // Keepalive.
    //

    pub(crate) fn init_keepalive_pings_if_enabled(&mut self, cx: &Arc<TransportShared>) {
        match self.keepalive_time {
            Some(interval) => {
                self.keepalive_state = KeepaliveState::Waiting;
                self.keepalive_ping_timer =
                    Some(cx.arm_timer(interval, |state, cx| state.init_keepalive_ping(cx)));
            }
            None => self.keepalive_state = KeepaliveState::Disabled,
        }
    }

    fn init_keepalive_ping(&mut self, cx: &Arc<TransportShared>) {
        debug_assert_eq!(self.keepalive_state, KeepaliveState::Waiting);
        self.keepalive_ping_timer = None;
        let Some(interval) = self.keepalive_time else {
            return;
        };
        if self.destroying || self.closed_with_error.is_some() {
            self.keepalive_state = KeepaliveState::Dying;
            return;
        }
        if self.keepalive_permit_without_calls || !self.stream_map.is_empty() {
            self.keepalive_state = KeepaliveState::Pinging;
            self.send_keepalive_ping(cx);
            self.initiate_write(cx, WriteReason::KeepalivePing);
        } else {
            self.keepalive_ping_timer =
                Some(cx.arm_timer(interval, |state, cx| state.init_keepalive_ping(cx)));
        }
    }

    fn send_keepalive_ping(&mut self, cx: &Arc<TransportShared>) {
        if let Some(error) = self.closed_with_error.clone() {
            self.finish_keepalive_ping(cx, Err(error));
            return;
        }
        let ctx = Arc::clone(cx);
        // Piggybacks on an already in-flight ping rather than paying for
        // a second one.
        self.ping_callbacks.on_ping_ack(Box::new(move |result| {
            ctx.run(move |state, cx| state.finish_keepalive_ping(cx, result));
        }));
        if self.keepalive_watchdog_timer.is_none() {
            self.keepalive_watchdog_timer = Some(cx.arm_timer(
                self.keepalive_timeout,
                |state, cx| state.keepalive_watchdog_fired(cx),
            ));
        }
    }

    fn keepalive_watchdog_fired(&mut self, cx: &Arc<TransportShared>) {
        self.keepalive_watchdog_timer = None;
        if self.keepalive_state != KeepaliveState::Pinging {
            return;
        }
        info!(peer = %self.peer, "keepalive timeout, closing transport");
        self.send_goaway(
            cx,
            TransportError::new("keepalive_timeout").with_http2_code(ErrorCode::EnhanceYourCalm),
            true,
        );
        self.close_transport(
            cx,
            TransportError::new("keepalive timeout").with_status(Code::Unavailable),
        );
    }

    fn finish_keepalive_ping(
        &mut self,
        cx: &Arc<TransportShared>,
        result: Result<(), TransportError>,
    ) {
        if self.keepalive_state != KeepaliveState::Pinging || result.is_err() {
            return;
        }
        let Some(interval) = self.keepalive_time else {
            return;
        };
        trace!(peer = %self.peer, "keepalive ping acked");
        self.keepalive_state = KeepaliveState::Waiting;
        cx.cancel_timer(self.keepalive_watchdog_timer.take());
        debug_assert!(self.keepalive_ping_timer.is_none());
        self.keepalive_ping_timer =
            Some(cx.arm_timer(interval, |state, cx| state.init_keepalive_ping(cx)));
    }

    /// Inbound bytes while waiting restart the keepalive clock.
    pub(crate) fn maybe_reset_keepalive_ping_timer(&mut self, cx: &Arc<TransportShared>) {
        let Some(interval) = self.keepalive_time else {
            return;
        };
        if let Some(handle) = self.keepalive_ping_timer {
            if cx.engine.cancel(handle) {
                self.keepalive_ping_timer =
                    Some(cx.arm_timer(interval, |state, cx| state.init_keepalive_ping(cx)));
            }
        }
    }

    //
    // BDP probing.
    //

    pub(crate) fn schedule_bdp_ping(&mut self, cx: &Arc<TransportShared>) {
        if self.flow_control.bdp().is_none() {
            return;
        }
        let on_start = Arc::clone(cx);
        let on_ack = Arc::clone(cx);
        self.ping_callbacks.on_ping(
            Some(Box::new(move |result| {
                on_start.run(move |state, cx| state.start_bdp_ping(cx, result));
            })),
            Some(Box::new(move |result| {
                on_ack.run(move |state, cx| state.finish_bdp_ping(cx, result));
            })),
        );
        self.initiate_write(cx, WriteReason::BdpPing);
    }

    fn start_bdp_ping(&mut self, cx: &Arc<TransportShared>, result: Result<(), TransportError>) {
        if result.is_err() || self.closed_with_error.is_some() {
            return;
        }
        trace!(peer = %self.peer, "start bdp ping");
        if self.keepalive_state == KeepaliveState::Waiting {
            self.maybe_reset_keepalive_ping_timer(cx);
        }
        if let Some(bdp) = self.flow_control.bdp() {
            bdp.start_ping(Instant::now());
        }
        self.bdp_ping_started = true;
    }

    fn finish_bdp_ping(&mut self, cx: &Arc<TransportShared>, result: Result<(), TransportError>) {
        if result.is_err() || self.closed_with_error.is_some() {
            return;
        }
        if !self.bdp_ping_started {
            // The ack raced ahead of the start callback; retry after the
            // queue drains.
            let ctx = Arc::clone(cx);
            self.defer(Box::new(move || {
                ctx.run(|state, cx| state.finish_bdp_ping(cx, Ok(())));
            }));
            return;
        }
        trace!(peer = %self.peer, "complete bdp ping");
        self.bdp_ping_started = false;
        let next_delay = match self.flow_control.bdp() {
            Some(bdp) => bdp.complete_ping(Instant::now()),
            None => return,
        };
        let action = self.flow_control.periodic_update(cx.memory.memory_pressure());
        self.act_on_flowctl_action(cx, action, None);
        debug_assert!(self.next_bdp_ping_timer.is_none());
        self.next_bdp_ping_timer = Some(cx.arm_timer(next_delay, |state, cx| {
            state.next_bdp_ping_timer_expired(cx);
        }));
    }

    fn next_bdp_ping_timer_expired(&mut self, cx: &Arc<TransportShared>) {
        self.next_bdp_ping_timer = None;
        let accumulated = self.flow_control.bdp().map(|bdp| bdp.accumulator()).unwrap_or(0);
        if accumulated == 0 {
            // Nothing flowed since the last probe; pinging an idle
            // connection tells us nothing.
            self.bdp_ping_blocked = true;
        } else {
            self.schedule_bdp_ping(cx);
        }
    }

    //
    // Flow control action dispatch.
    //

    pub(crate) fn act_on_flowctl_action(
        &mut self,
        cx: &Arc<TransportShared>,
        action: FlowControlAction,
        key: Option<StreamKey>,
    ) {
        if action.send_stream_update != Urgency::NoAction {
            if let Some(key) = key {
                let eligible = self
                    .streams
                    .get(&key)
                    .map(|stream| stream.id != 0 && !stream.read_closed)
                    .unwrap_or(false);
                if eligible {
                    if action.send_stream_update == Urgency::UpdateImmediately {
                        self.initiate_write(cx, WriteReason::StreamFlowControl);
                    }
                    self.mark_stream_writable(key);
                }
            }
        }
        if action.send_transport_update == Urgency::UpdateImmediately {
            self.initiate_write(cx, WriteReason::TransportFlowControl);
        }
        if action.send_initial_window_update != Urgency::NoAction {
            if action.send_initial_window_update == Urgency::UpdateImmediately {
                self.initiate_write(cx, WriteReason::SendSettings);
            }
            self.local_settings.initial_window_size = action.initial_window_size;
        }
        if action.send_max_frame_size_update != Urgency::NoAction {
            if action.send_max_frame_size_update == Urgency::UpdateImmediately {
                self.initiate_write(cx, WriteReason::SendSettings);
            }
            self.local_settings.max_frame_size = action.max_frame_size;
        }
        if self.config.enable_preferred_rx_crypto_frame_size
            && action.preferred_rx_crypto_frame_size_update != Urgency::NoAction
        {
            if action.preferred_rx_crypto_frame_size_update == Urgency::UpdateImmediately {
                self.initiate_write(cx, WriteReason::SendSettings);
            }
            self.local_settings.preferred_receive_crypto_frame_size =
                action.preferred_rx_crypto_frame_size;
        }
    }

    /// Data is flowing; pings are paying their way again.
    pub(crate) fn reset_ping_clock(&mut self) {
        if !self.is_client {
            self.ping_abuse.reset_ping_strikes();
        }
        self.ping_rate.reset_pings_before_data_required();
    }

    //
    // Memory pressure.
    //

    pub(crate) fn post_benign_reclaimer(&mut self, cx: &Arc<TransportShared>) {
        if self.benign_reclaimer_registered {
            return;
        }
        self.benign_reclaimer_registered = true;
        let ctx = Arc::clone(cx);
        cx.memory.post_reclaimer(
            ReclamationPass::Benign,
            Box::new(move |sweep| {
                if let Some(sweep) = sweep {
                    ctx.run(move |state, cx| state.benign_reclaimer(cx, sweep));
                }
            }),
        );
    }

    pub(crate) fn post_destructive_reclaimer(&mut self, cx: &Arc<TransportShared>) {
        if self.destructive_reclaimer_registered {
            return;
        }
        self.destructive_reclaimer_registered = true;
        let ctx = Arc::clone(cx);
        cx.memory.post_reclaimer(
            ReclamationPass::Destructive,
            Box::new(move |sweep| {
                if let Some(sweep) = sweep {
                    ctx.run(move |state, cx| state.destructive_reclaimer(cx, sweep));
                }
            }),
        );
    }

    fn benign_reclaimer(&mut self, cx: &Arc<TransportShared>, sweep: ReclamationSweep) {
        self.benign_reclaimer_registered = false;
        if self.stream_map.is_empty() && self.closed_with_error.is_none() {
            debug!(peer = %self.peer, "sending goaway to free memory");
            self.send_goaway(
                cx,
                TransportError::new("Buffers full")
                    .with_http2_code(ErrorCode::EnhanceYourCalm)
                    .with_status(Code::ResourceExhausted),
                true,
            );
        } else if !self.stream_map.is_empty() {
            trace!(
                peer = %self.peer,
                streams = self.stream_map.len(),
                "skipping benign reclamation, streams are active"
            );
        }
        drop(sweep);
    }

    fn destructive_reclaimer(&mut self, cx: &Arc<TransportShared>, sweep: ReclamationSweep) {
        self.destructive_reclaimer_registered = false;
        if self.closed_with_error.is_none() {
            if let Some((&id, &key)) = self.stream_map.iter().next() {
                debug!(peer = %self.peer, id, "abandoning stream to free memory");
                self.cancel_stream(
                    cx,
                    key,
                    TransportError::new("Buffers full")
                        .with_http2_code(ErrorCode::EnhanceYourCalm)
                        .with_status(Code::ResourceExhausted),
                    false,
                );
                if !self.stream_map.is_empty() {
                    // One stream per sweep; re-post so the quota can ask
                    // again if it is still starved.
                    self.post_destructive_reclaimer(cx);
                }
            }
        }
        drop(sweep);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn bare_state(is_client: bool) -> TransportState {
        build_state(is_client, "test-peer:0".to_string(), Config::new().rng_seed(7))
    }

    impl TransportState {
        pub(crate) fn insert_stream_for_test(&mut self) -> StreamKey {
            let key = self.streams.keys().max().copied().unwrap_or(0) + 1;
            self.streams.insert(key, Stream::new(key));
            key
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::bare_state;
    use super::*;

    #[test]
    fn test_client_state_defaults() {
        let state = bare_state(true);
        assert_eq!(state.next_stream_id, 1);
        assert!(state.is_client);
        assert_eq!(state.write_state, WriteState::Idle);
        assert_eq!(state.goaway_send_state, GoawaySendState::NotSent);
        assert!(!state.wrote_preface);
        // A client advertises no inbound streams (push is disabled).
        assert_eq!(state.local_settings.max_concurrent_streams, 0);
        assert!(!state.local_settings.enable_push);
    }

    #[test]
    fn test_server_state_defaults() {
        let state = bare_state(false);
        assert_eq!(state.next_stream_id, 2);
        assert!(state.wrote_preface);
        assert_eq!(state.keepalive_time, Some(DEFAULT_SERVER_KEEPALIVE_TIME));
    }

    #[test]
    fn test_stream_id_parity_from_config() {
        let state = build_state(
            true,
            "p".into(),
            Config::new().initial_stream_id(11).rng_seed(1),
        );
        assert_eq!(state.next_stream_id, 11);
        // Wrong parity is ignored.
        let state = build_state(
            true,
            "p".into(),
            Config::new().initial_stream_id(10).rng_seed(1),
        );
        assert_eq!(state.next_stream_id, 1);
    }
}
