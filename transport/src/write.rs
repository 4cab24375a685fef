//! The write scheduler.
//!
//! All outbound bytes leave through one pipeline: `initiate_write` moves
//! the write-state machine, `write_action_begin` runs on the combiner's
//! "finally" queue so every intent registered this turn is batched into
//! one gather pass, and `write_action_end` is the endpoint completion.
//! At most one endpoint write is in flight; `outbuf` is empty whenever
//! the state is idle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use tracing::{info, trace};

use http2::frame::{CONNECTION_PREFACE, FrameType, flags};
use http2::{ErrorCode, encode};

use crate::error::TransportError;
use crate::op::CallbackBarrier;
use crate::ping::PingRateDecision;
use crate::status::Code;
use crate::stream::{StreamKey, StreamList};
use crate::transport::{GoawaySendState, TransportShared, TransportState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteState {
    Idle,
    Writing,
    WritingWithMore,
}

/// Why a write was initiated; traced on every state transition.
#[derive(Debug, Clone, Copy)]
pub(crate) enum WriteReason {
    InitialWrite,
    StartNewStream,
    SendMessage,
    SendInitialMetadata,
    SendTrailingMetadata,
    RetrySendPing,
    ContinuePings,
    GoawaySent,
    RstStream,
    CloseFromApi,
    StreamFlowControl,
    TransportFlowControl,
    SendSettings,
    SettingsAck,
    FlowControlUnstalledBySetting,
    FlowControlUnstalledByUpdate,
    ApplicationPing,
    BdpPing,
    KeepalivePing,
    TransportFlowControlUnstalled,
    PingResponse,
}

impl WriteReason {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            WriteReason::InitialWrite => "INITIAL_WRITE",
            WriteReason::StartNewStream => "START_NEW_STREAM",
            WriteReason::SendMessage => "SEND_MESSAGE",
            WriteReason::SendInitialMetadata => "SEND_INITIAL_METADATA",
            WriteReason::SendTrailingMetadata => "SEND_TRAILING_METADATA",
            WriteReason::RetrySendPing => "RETRY_SEND_PING",
            WriteReason::ContinuePings => "CONTINUE_PINGS",
            WriteReason::GoawaySent => "GOAWAY_SENT",
            WriteReason::RstStream => "RST_STREAM",
            WriteReason::CloseFromApi => "CLOSE_FROM_API",
            WriteReason::StreamFlowControl => "STREAM_FLOW_CONTROL",
            WriteReason::TransportFlowControl => "TRANSPORT_FLOW_CONTROL",
            WriteReason::SendSettings => "SEND_SETTINGS",
            WriteReason::SettingsAck => "SETTINGS_ACK",
            WriteReason::FlowControlUnstalledBySetting => "FLOW_CONTROL_UNSTALLED_BY_SETTING",
            WriteReason::FlowControlUnstalledByUpdate => "FLOW_CONTROL_UNSTALLED_BY_UPDATE",
            WriteReason::ApplicationPing => "APPLICATION_PING",
            WriteReason::BdpPing => "BDP_PING",
            WriteReason::KeepalivePing => "KEEPALIVE_PING",
            WriteReason::TransportFlowControlUnstalled => "TRANSPORT_FLOW_CONTROL_UNSTALLED",
            WriteReason::PingResponse => "PING_RESPONSE",
        }
    }
}

pub(crate) struct BeginWriteResult {
    pub writing: bool,
    pub partial: bool,
}

enum StreamDisposition {
    Done,
    StalledByStream,
    StalledByTransport,
    Requeue,
    CloseWrites { also_reads: bool },
}

impl TransportState {
    pub(crate) fn set_write_state(
        &mut self,
        cx: &Arc<TransportShared>,
        state: WriteState,
        reason: &'static str,
    ) {
        if self.write_state == state {
            return;
        }
        trace!(
            peer = %self.peer,
            is_client = self.is_client,
            from = ?self.write_state,
            to = ?state,
            reason,
            "write state"
        );
        self.write_state = state;
        // Reaching idle means a write just finished: completions held to
        // cover that write may fire, and a deferred close may proceed.
        if state == WriteState::Idle {
            let callbacks = std::mem::take(&mut self.run_after_write);
            self.after_turn.extend(callbacks);
            if let Some(error) = self.close_on_writes_finished.take() {
                self.close_transport(cx, error);
            }
        }
    }

    pub(crate) fn initiate_write(&mut self, cx: &Arc<TransportShared>, reason: WriteReason) {
        match self.write_state {
            WriteState::Idle => {
                self.set_write_state(cx, WriteState::Writing, reason.as_str());
                // Scheduled on the finally queue so the gather runs only
                // after all other work queued this turn, batching as
                // many intents as possible into one endpoint write.
                cx.run_finally(|state, cx| state.write_action_begin(cx));
            }
            WriteState::Writing => {
                self.set_write_state(cx, WriteState::WritingWithMore, reason.as_str());
            }
            WriteState::WritingWithMore => {}
        }
    }

    pub(crate) fn write_action_begin(&mut self, cx: &Arc<TransportShared>) {
        debug_assert_ne!(self.write_state, WriteState::Idle);
        let result = if self.closed_with_error.is_some() {
            BeginWriteResult {
                writing: false,
                partial: false,
            }
        } else {
            self.begin_write(cx)
        };
        if result.writing {
            // Streams can join the writable list while the gather runs
            // (stream removal admits queued streams); anything left
            // writable needs a follow-up pass.
            let partial = result.partial
                || !self.lists[crate::stream::StreamList::Writable as usize].is_empty();
            let (state, reason) = if partial {
                (WriteState::WritingWithMore, "begin partial write")
            } else {
                (WriteState::Writing, "begin write")
            };
            self.set_write_state(cx, state, reason);
            self.write_action(cx);
            if self.reading_paused_on_pending_induced_frames {
                debug_assert_eq!(self.num_pending_induced_frames, 0);
                trace!(peer = %self.peer, "induced frames flushed, resuming reads");
                self.reading_paused_on_pending_induced_frames = false;
                self.continue_read(cx);
            }
        } else {
            self.set_write_state(cx, WriteState::Idle, "begin writing nothing");
        }
    }

    /// Gather every pending intent into `outbuf`, bounded by the peer's
    /// max frame size and the per-turn flow-controlled byte cap.
    fn begin_write(&mut self, cx: &Arc<TransportShared>) -> BeginWriteResult {
        if !self.wrote_preface {
            self.outbuf.extend_from_slice(CONNECTION_PREFACE);
            self.wrote_preface = true;
        }

        if !self.settings_sent_once || self.local_settings != self.sent_settings {
            let diff = self.local_settings.diff(&self.sent_settings);
            encode::write_settings(&mut self.outbuf, &diff);
            self.sent_settings = self.local_settings;
            self.settings_sent_once = true;
            if self.settings_ack_watchdog.is_none() {
                self.settings_ack_watchdog = Some(cx.arm_timer(
                    self.settings_timeout,
                    |state, cx| state.settings_timeout_fired(cx),
                ));
            }
        }

        // Induced frames (acks, resets, goaways) ride ahead of stream
        // frames.
        if !self.qbuf.is_empty() {
            let induced = self.qbuf.split();
            self.outbuf.extend_from_slice(&induced);
            self.num_pending_induced_frames = 0;
        }

        if self.ping_callbacks.ping_requested() {
            self.maybe_emit_ping(cx);
        }

        let target_write_size = self.config.write_buffer_size.max(1) as usize;
        let max_frame = self.peer_settings.max_frame_size;
        let peer_initial_window = self.peer_settings.initial_window_size;
        let acked_initial_window = self.flow_control.acked_initial_window();
        let true_binary = self.peer_settings.allow_true_binary_metadata;

        let mut flow_bytes_this_turn = 0usize;
        let mut partial = false;
        let mut wrote_stream_frames = false;
        let mut finished_steps: Vec<CallbackBarrier> = Vec::new();
        let mut dispositions: Vec<(StreamKey, StreamDisposition)> = Vec::new();

        loop {
            if flow_bytes_this_turn >= target_write_size {
                partial = !self.lists[StreamList::Writable as usize].is_empty();
                break;
            }
            let Some(key) = self.list_pop(StreamList::Writable) else {
                break;
            };
            let mut disposition = StreamDisposition::Done;
            {
                let Some(stream) = self.streams.get_mut(&key) else {
                    continue;
                };
                debug_assert_ne!(stream.id, 0, "unstarted stream on the writable list");
                let mut wrote_any = false;

                if let Some(metadata) = stream.initial_metadata_to_send.take() {
                    let fields = metadata.to_header_fields(true_binary);
                    let mut block = BytesMut::new();
                    self.hpack_encoder.encode(fields.iter(), &mut block);
                    encode::write_headers(&mut self.outbuf, stream.id, &block, false, max_frame);
                    stream.sent_initial_metadata = true;
                    wrote_any = true;
                    if let Some(barrier) = stream.send_initial_metadata_finished.take() {
                        finished_steps.push(barrier);
                    }
                }

                if stream.sent_initial_metadata {
                    // Flow-controlled data.
                    let mut stalled_by_stream = false;
                    let mut stalled_by_transport = false;
                    while !stream.flow_controlled_buffer.is_empty()
                        && flow_bytes_this_turn < target_write_size
                    {
                        let stream_window = stream.flow_control.send_window(peer_initial_window);
                        if stream_window <= 0 {
                            stalled_by_stream = true;
                            break;
                        }
                        let transport_window = self.flow_control.remote_window();
                        if transport_window <= 0 {
                            stalled_by_transport = true;
                            break;
                        }
                        let allowance = stream_window
                            .min(transport_window)
                            .min(max_frame as i64)
                            .min((target_write_size - flow_bytes_this_turn) as i64)
                            as usize;
                        let chunk_len = allowance.min(stream.flow_controlled_buffer.len());
                        let chunk = stream.flow_controlled_buffer.split_to(chunk_len);
                        // A client with empty trailers queued half-closes
                        // on its final DATA frame.
                        let end_stream = self.is_client
                            && stream.flow_controlled_buffer.is_empty()
                            && matches!(&stream.trailing_metadata_to_send, Some(md) if md.is_empty());
                        encode::write_data(&mut self.outbuf, stream.id, &chunk, end_stream);
                        stream.flow_control.sent_data(chunk_len as u32);
                        self.flow_control.sent_data(chunk_len as u32);
                        stream.flow_controlled_bytes_written += chunk_len as i64;
                        flow_bytes_this_turn += chunk_len;
                        wrote_any = true;
                        if end_stream {
                            stream.eos_sent = true;
                        }
                    }

                    if stream.flow_controlled_buffer.is_empty() {
                        if let Some(metadata) = stream.trailing_metadata_to_send.take() {
                            if self.is_client && metadata.is_empty() {
                                if !stream.eos_sent {
                                    encode::write_data(&mut self.outbuf, stream.id, &[], true);
                                }
                            } else {
                                let fields = metadata.to_header_fields(true_binary);
                                let mut block = BytesMut::new();
                                self.hpack_encoder.encode(fields.iter(), &mut block);
                                encode::write_headers(
                                    &mut self.outbuf,
                                    stream.id,
                                    &block,
                                    true,
                                    max_frame,
                                );
                            }
                            stream.eos_sent = true;
                            stream.sent_trailing_metadata = true;
                            wrote_any = true;
                            if let Some(barrier) = stream.send_trailing_metadata_finished.take() {
                                finished_steps.push(barrier);
                            }
                            disposition = StreamDisposition::CloseWrites {
                                also_reads: !self.is_client,
                            };
                        }
                    } else if stalled_by_stream {
                        disposition = StreamDisposition::StalledByStream;
                    } else if stalled_by_transport {
                        disposition = StreamDisposition::StalledByTransport;
                    } else {
                        // Ran into the per-turn cap with data left.
                        disposition = StreamDisposition::Requeue;
                        partial = true;
                    }
                }

                // Byte-offset callbacks whose admission signal is due.
                let written = stream.flow_controlled_bytes_written;
                let mut index = 0;
                while index < stream.on_flow_controlled_cbs.len() {
                    if stream.on_flow_controlled_cbs[index].call_at_byte <= written {
                        finished_steps.push(stream.on_flow_controlled_cbs.remove(index).barrier);
                    } else {
                        index += 1;
                    }
                }

                if !stream.read_closed {
                    if let Some(increment) =
                        stream.flow_control.maybe_send_update(acked_initial_window)
                    {
                        encode::write_window_update(&mut self.outbuf, stream.id, increment);
                    }
                }

                if wrote_any {
                    wrote_stream_frames = true;
                    self.streams_written_this_turn.push(key);
                }
            }
            match disposition {
                StreamDisposition::Done => {}
                other => dispositions.push((key, other)),
            }
        }

        for (key, disposition) in dispositions {
            match disposition {
                StreamDisposition::Done => {}
                StreamDisposition::StalledByStream => {
                    self.list_add(key, StreamList::StalledByStream);
                }
                StreamDisposition::StalledByTransport => {
                    self.list_add(key, StreamList::StalledByTransport);
                }
                StreamDisposition::Requeue => {
                    self.list_add(key, StreamList::Writable);
                }
                StreamDisposition::CloseWrites { also_reads } => {
                    self.mark_stream_closed(cx, key, also_reads, true, None);
                }
            }
        }
        for barrier in finished_steps {
            self.finish_closure_step(barrier, None);
        }
        if wrote_stream_frames {
            self.reset_ping_clock();
        }

        if let Some(increment) = self
            .flow_control
            .maybe_send_update(cx.memory.memory_pressure())
        {
            encode::write_window_update(&mut self.outbuf, 0, increment);
        }

        BeginWriteResult {
            writing: !self.outbuf.is_empty(),
            partial,
        }
    }

    fn maybe_emit_ping(&mut self, cx: &Arc<TransportShared>) {
        let now = Instant::now();
        let interval = self.next_allowed_ping_interval();
        match self.ping_rate.request_send_ping(now, interval) {
            PingRateDecision::Granted => {
                let (id, on_start) = self.ping_callbacks.start_ping(&mut self.rng);
                encode::write_ping(&mut self.outbuf, false, id);
                self.ping_rate.sent_ping(now);
                trace!(peer = %self.peer, id, "ping on the wire");
                for callback in on_start {
                    self.after_turn.push(Box::new(move || callback(Ok(()))));
                }
                if self.ping_timeout_timer.is_none() {
                    self.ping_timeout_timer = Some(
                        cx.arm_timer(self.ping_timeout, |state, cx| state.ping_timeout_fired(cx)),
                    );
                }
            }
            PingRateDecision::TooManyRecentPings => {
                trace!(peer = %self.peer, "ping deferred until data is sent");
            }
            PingRateDecision::TooSoon(wait) => {
                if self.delayed_ping_timer.is_none() {
                    self.delayed_ping_timer =
                        Some(cx.arm_timer(wait, |state, cx| state.retry_initiate_ping(cx)));
                }
            }
        }
    }

    fn next_allowed_ping_interval(&self) -> Duration {
        if !self.is_client {
            return Duration::ZERO;
        }
        if self.keepalive_permit_without_calls || !self.stream_map.is_empty() {
            return Duration::ZERO;
        }
        // An idle client has little business pinging fast.
        match self.keepalive_time {
            Some(interval) => interval * 2,
            None => Duration::from_secs(60),
        }
    }

    fn retry_initiate_ping(&mut self, cx: &Arc<TransportShared>) {
        self.delayed_ping_timer = None;
        self.initiate_write(cx, WriteReason::RetrySendPing);
    }

    fn ping_timeout_fired(&mut self, cx: &Arc<TransportShared>) {
        self.ping_timeout_timer = None;
        if self.ping_callbacks.inflight_count() == 0 {
            return;
        }
        info!(peer = %self.peer, "ping timeout, closing transport");
        self.send_goaway(
            cx,
            TransportError::new("ping_timeout").with_http2_code(ErrorCode::EnhanceYourCalm),
            true,
        );
        self.close_transport(
            cx,
            TransportError::new("ping timeout").with_status(Code::Unavailable),
        );
    }

    fn settings_timeout_fired(&mut self, cx: &Arc<TransportShared>) {
        self.settings_ack_watchdog = None;
        info!(peer = %self.peer, "settings not acked in time, closing transport");
        self.send_goaway(
            cx,
            TransportError::new("settings_timeout").with_http2_code(ErrorCode::SettingsTimeout),
            true,
        );
        self.close_transport(
            cx,
            TransportError::new("settings timeout").with_status(Code::Unavailable),
        );
    }

    /// Hand `outbuf` to the endpoint.
    fn write_action(&mut self, cx: &Arc<TransportShared>) {
        let data = self.outbuf.split().freeze();
        let max_frame_size = self.peer_settings.preferred_receive_crypto_frame_size as usize;
        trace!(
            peer = %self.peer,
            is_client = self.is_client,
            bytes = data.len(),
            "endpoint write"
        );
        let Some(endpoint) = cx.endpoint() else {
            let ctx = Arc::clone(cx);
            self.defer(Box::new(move || {
                ctx.run(|state, cx| {
                    state.write_action_end(cx, Err(TransportError::new("endpoint destroyed")));
                });
            }));
            return;
        };
        let ctx = Arc::clone(cx);
        endpoint.write(
            vec![data],
            max_frame_size,
            Box::new(move |result| {
                ctx.run(move |state, cx| state.write_action_end(cx, result));
            }),
        );
    }

    pub(crate) fn write_action_end(
        &mut self,
        cx: &Arc<TransportShared>,
        result: Result<(), TransportError>,
    ) {
        let mut closed = false;
        if let Err(error) = result {
            self.close_transport(
                cx,
                TransportError::referencing("endpoint write failed", &error),
            );
            closed = true;
        }

        if self.goaway_send_state == GoawaySendState::FinalScheduled && self.qbuf.is_empty() {
            self.goaway_send_state = GoawaySendState::FinalSent;
            closed = true;
            if self.stream_map.is_empty() {
                self.close_transport(cx, TransportError::new("goaway sent"));
            }
        }

        // Wire-confirmation callbacks for streams written this turn.
        let keys = std::mem::take(&mut self.streams_written_this_turn);
        let mut due = Vec::new();
        for key in keys {
            if let Some(stream) = self.streams.get_mut(&key) {
                let written = stream.flow_controlled_bytes_written;
                let mut index = 0;
                while index < stream.on_write_finished_cbs.len() {
                    if stream.on_write_finished_cbs[index].call_at_byte <= written {
                        due.push(stream.on_write_finished_cbs.remove(index).barrier);
                    } else {
                        index += 1;
                    }
                }
            }
        }
        for barrier in due {
            self.finish_closure_step(barrier, None);
        }

        match self.write_state {
            WriteState::Idle => {
                debug_assert!(false, "write completed while idle");
            }
            WriteState::Writing => {
                self.set_write_state(cx, WriteState::Idle, "finish writing");
            }
            WriteState::WritingWithMore => {
                self.set_write_state(cx, WriteState::Writing, "continue writing");
                // If the transport closed, the retry may resend part of
                // the serialized frames; hold the callbacks until a
                // write actually finishes.
                if !closed {
                    let callbacks = std::mem::take(&mut self.run_after_write);
                    self.after_turn.extend(callbacks);
                }
                cx.run_finally(|state, cx| state.write_action_begin(cx));
            }
        }
    }

    //
    // Induced frames.
    //

    pub(crate) fn queue_settings_ack(&mut self) {
        encode::write_settings_ack(&mut self.qbuf);
        self.num_pending_induced_frames += 1;
    }

    pub(crate) fn queue_ping_ack(&mut self, id: u64) {
        encode::write_ping(&mut self.qbuf, true, id);
        self.num_pending_induced_frames += 1;
    }

    pub(crate) fn queue_rst_stream(&mut self, id: u32, error_code: u32) {
        encode::write_rst_stream(&mut self.qbuf, id, error_code);
        self.num_pending_induced_frames += 1;
    }

    pub(crate) fn queue_goaway(&mut self, last_stream_id: u32, error_code: u32, debug_data: &[u8]) {
        encode::write_goaway(&mut self.qbuf, last_stream_id, error_code, debug_data);
    }

    /// Hand-rolled error response: one HEADERS frame carrying the RPC
    /// status as uncompressed literals. Built without the HPACK encoder
    /// so it works even when the send machinery is partly torn down.
    pub(crate) fn queue_status_response(
        &mut self,
        id: u32,
        sent_initial_metadata: bool,
        status: Code,
        message: &str,
    ) {
        debug_assert!(status.as_u32() < 100);
        let mut block = BytesMut::new();
        if !sent_initial_metadata {
            put_literal_header(&mut block, b":status", b"200");
            put_literal_header(&mut block, b"content-type", b"application/grpc");
        }
        let digits = status.as_u32().to_string();
        put_literal_header(&mut block, b"grpc-status", digits.as_bytes());
        if !message.is_empty() {
            put_literal_header(&mut block, b"grpc-message", message.as_bytes());
        }
        encode::put_frame_header(
            &mut self.qbuf,
            block.len() as u32,
            FrameType::Headers,
            flags::END_STREAM | flags::END_HEADERS,
            id,
        );
        self.qbuf.extend_from_slice(&block);
    }
}

/// Literal header field, never indexed into a compression table, with
/// plain string lengths (7-bit prefix integers).
fn put_literal_header(block: &mut BytesMut, name: &[u8], value: &[u8]) {
    block.put_u8(0x00);
    put_plain_string(block, name);
    put_plain_string(block, value);
}

fn put_plain_string(block: &mut BytesMut, data: &[u8]) {
    let mut length = data.len();
    if length < 0x7f {
        block.put_u8(length as u8);
    } else {
        block.put_u8(0x7f);
        length -= 0x7f;
        while length >= 0x80 {
            block.put_u8((length % 0x80) as u8 | 0x80);
            length /= 0x80;
        }
        block.put_u8(length as u8);
    }
    block.put_slice(data);
}
