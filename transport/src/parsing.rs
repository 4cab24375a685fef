//! The read loop: endpoint reads feed an incremental deframer whose
//! frames dispatch into stream and transport state.
//!
//! The loop is allowed to stop mid-read: admitting too many new streams
//! in one read defers the rest to the next combiner turn (yielding the
//! thread in between), and a glut of pending induced frames pauses
//! reading entirely until a write drains them.

use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

use http2::frame::{CONNECTION_PREFACE, FRAME_HEADER_SIZE, FrameHeader, FrameType, flags};
use http2::{ErrorCode, decode};

use crate::config::DEFAULT_MAX_PENDING_INDUCED_FRAMES;
use crate::endpoint::ReadArgs;
use crate::error::TransportError;
use crate::metadata::Metadata;
use crate::ping::KeepaliveState;
use crate::status::{self, Code};
use crate::stream::{PublishedMetadata, Stream, StreamHandle, StreamList};
use crate::transport::{GoawaySendState, TransportShared, TransportState};
use crate::write::WriteReason;

/// A HEADERS block mid-assembly across CONTINUATION frames.
struct HeaderAssembly {
    stream_id: u32,
    end_stream: bool,
    block: BytesMut,
}

/// Incremental frame accumulator: preface (server role), then 9-byte
/// header, then payload, one frame at a time.
pub(crate) struct Deframer {
    preface_remaining: usize,
    header_buf: [u8; FRAME_HEADER_SIZE],
    header_have: usize,
    header: Option<FrameHeader>,
    payload: BytesMut,
    assembly: Option<HeaderAssembly>,
}

impl Deframer {
    pub fn new(expect_preface: bool) -> Self {
        Self {
            preface_remaining: if expect_preface {
                CONNECTION_PREFACE.len()
            } else {
                0
            },
            header_buf: [0; FRAME_HEADER_SIZE],
            header_have: 0,
            header: None,
            payload: BytesMut::new(),
            assembly: None,
        }
    }

    /// Bytes required before the next frame can complete; drives the
    /// endpoint's minimum-progress hint.
    pub fn bytes_needed(&self) -> usize {
        if self.preface_remaining > 0 {
            return self.preface_remaining;
        }
        match &self.header {
            Some(header) => header.length as usize - self.payload.len(),
            None => FRAME_HEADER_SIZE - self.header_have,
        }
    }

    fn frame_ready(&self) -> bool {
        match &self.header {
            Some(header) => self.payload.len() == header.length as usize,
            None => false,
        }
    }

    fn take_frame(&mut self) -> (FrameHeader, Bytes) {
        debug_assert!(self.frame_ready());
        let header = self.header.take().expect("frame ready");
        self.header_have = 0;
        (header, self.payload.split().freeze())
    }

    /// Consume bytes from the front of `slice` until it empties or a
    /// frame is complete.
    fn consume(&mut self, slice: &mut Bytes, max_frame_size: u32) -> Result<(), TransportError> {
        while !slice.is_empty() && !self.frame_ready() {
            if self.preface_remaining > 0 {
                let offset = CONNECTION_PREFACE.len() - self.preface_remaining;
                let take = self.preface_remaining.min(slice.len());
                if slice[..take] != CONNECTION_PREFACE[offset..offset + take] {
                    return Err(TransportError::new("connection preface mismatch")
                        .with_http2_code(ErrorCode::ProtocolError));
                }
                slice.advance(take);
                self.preface_remaining -= take;
                continue;
            }
            if self.header.is_none() {
                let take = (FRAME_HEADER_SIZE - self.header_have).min(slice.len());
                self.header_buf[self.header_have..self.header_have + take]
                    .copy_from_slice(&slice[..take]);
                slice.advance(take);
                self.header_have += take;
                if self.header_have == FRAME_HEADER_SIZE {
                    let header = FrameHeader::parse(&self.header_buf);
                    if header.length > max_frame_size {
                        return Err(TransportError::new(format!(
                            "frame of {} bytes exceeds maximum of {}",
                            header.length, max_frame_size
                        ))
                        .with_http2_code(ErrorCode::FrameSizeError));
                    }
                    self.payload.reserve(header.length as usize);
                    self.header = Some(header);
                }
                continue;
            }
            let header = self.header.as_ref().expect("checked above");
            let need = header.length as usize - self.payload.len();
            let take = need.min(slice.len());
            self.payload.extend_from_slice(&slice[..take]);
            slice.advance(take);
        }
        Ok(())
    }
}

pub(crate) enum ReadOutcome {
    Done,
    /// Stopped at the per-read request cap; resume on a later turn.
    Deferred,
}

enum FrameDispatch {
    Dispatched,
    Deferred,
}

impl TransportState {
    pub(crate) fn continue_read(&mut self, cx: &Arc<TransportShared>) {
        let Some(endpoint) = cx.endpoint() else {
            return;
        };
        let args = ReadArgs {
            urgent: self.goaway_error.is_some(),
            min_progress: self.deframe.bytes_needed().max(1),
        };
        let ctx = Arc::clone(cx);
        endpoint.read(
            args,
            Box::new(move |result| {
                ctx.run(move |state, cx| state.read_action(cx, result));
            }),
        );
    }

    pub(crate) fn read_action(
        &mut self,
        cx: &Arc<TransportShared>,
        result: Result<Vec<Bytes>, TransportError>,
    ) {
        // Inbound bytes are proof of life: the keepalive ack watchdog
        // stands down.
        if let Some(handle) = self.keepalive_watchdog_timer.take() {
            cx.engine.cancel(handle);
        }
        let error = match result {
            Ok(slices) => {
                for slice in slices {
                    if !self.first_frame_parsed && self.sniff_buffer.len() < 1024 {
                        let take = (1024 - self.sniff_buffer.len()).min(slice.len());
                        self.sniff_buffer.extend_from_slice(&slice[..take]);
                    }
                    self.pending_read.push_back(slice);
                }
                None
            }
            Err(error) => Some(TransportError::referencing("Endpoint read failed", &error)),
        };
        self.read_action_parse_loop(cx, error);
    }

    pub(crate) fn read_action_parse_loop(
        &mut self,
        cx: &Arc<TransportShared>,
        mut error: Option<TransportError>,
    ) {
        if self.closed_with_error.is_none() && error.is_none() {
            match self.perform_read(cx) {
                Ok(ReadOutcome::Done) => {}
                Ok(ReadOutcome::Deferred) => {
                    // Bound contiguous parse work: yield the thread and
                    // resume from the same byte offset.
                    self.offload_requested = true;
                    let ctx = Arc::clone(cx);
                    ctx.run(|state, cx| state.read_action_parse_loop(cx, None));
                    return;
                }
                Err(parse_error) => {
                    error = Some(match self.try_http1_sniff() {
                        Some(http1_error) => http1_error,
                        None => {
                            TransportError::referencing("Failed parsing HTTP/2", &parse_error)
                        }
                    });
                }
            }
            if self.initial_window_update != 0 {
                if self.initial_window_update > 0 {
                    while let Some(key) = self.list_pop(StreamList::StalledByStream) {
                        self.mark_stream_writable(key);
                        self.initiate_write(cx, WriteReason::FlowControlUnstalledBySetting);
                    }
                }
                self.initial_window_update = 0;
            }
            if self.bdp_ping_blocked {
                let accumulated = self
                    .flow_control
                    .bdp()
                    .map(|bdp| bdp.accumulator())
                    .unwrap_or(0);
                if accumulated > 0 {
                    self.bdp_ping_blocked = false;
                    self.schedule_bdp_ping(cx);
                }
            }
        }
        if error.is_none() {
            if let Some(closed) = &self.closed_with_error {
                error = Some(TransportError::referencing("Transport closed", closed));
            }
        }
        match error {
            Some(error) => {
                // A received goaway is often the real story behind a
                // read failure.
                let error = match (&self.goaway_error, error) {
                    (Some(goaway), error) if !error.has_clear_status() => {
                        error.with_source(goaway.clone())
                    }
                    (_, error) => error,
                };
                self.pending_read.clear();
                self.close_transport(cx, error);
            }
            None => {
                if self.keepalive_state == KeepaliveState::Waiting {
                    self.maybe_reset_keepalive_ping_timer(cx);
                }
                if self.num_pending_induced_frames >= DEFAULT_MAX_PENDING_INDUCED_FRAMES {
                    trace!(
                        peer = %self.peer,
                        "pausing reads behind unwritten induced frames"
                    );
                    self.reading_paused_on_pending_induced_frames = true;
                } else {
                    self.continue_read(cx);
                }
            }
        }
    }

    fn perform_read(&mut self, cx: &Arc<TransportShared>) -> Result<ReadOutcome, TransportError> {
        let mut requests_started = 0u32;
        loop {
            if self.deframe.frame_ready() {
                match self.dispatch_frame(cx, &mut requests_started)? {
                    FrameDispatch::Dispatched => continue,
                    FrameDispatch::Deferred => return Ok(ReadOutcome::Deferred),
                }
            }
            let Some(mut front) = self.pending_read.pop_front() else {
                return Ok(ReadOutcome::Done);
            };
            if front.is_empty() {
                continue;
            }
            let max_frame_size = self
                .local_settings
                .max_frame_size
                .max(self.acked_settings.max_frame_size);
            self.deframe.consume(&mut front, max_frame_size)?;
            if !front.is_empty() {
                self.pending_read.push_front(front);
            }
        }
    }

    fn dispatch_frame(
        &mut self,
        cx: &Arc<TransportShared>,
        requests_started: &mut u32,
    ) -> Result<FrameDispatch, TransportError> {
        let header = *self.deframe.header.as_ref().expect("frame ready");

        // Before consuming a HEADERS frame that would admit a new
        // stream, check the per-read budget; the frame stays buffered
        // for the next turn.
        if !self.is_client
            && header.frame_type() == Some(FrameType::Headers)
            && header.stream_id % 2 == 1
            && header.stream_id > self.last_new_stream_id
            && !self.stream_map.contains_key(&header.stream_id)
            && *requests_started >= self.config.max_requests_per_read
        {
            trace!(
                peer = %self.peer,
                requests = *requests_started,
                "request admission budget spent for this read"
            );
            return Ok(FrameDispatch::Deferred);
        }

        let (header, payload) = self.deframe.take_frame();
        self.first_frame_parsed = true;

        // A header block may only be interrupted by its own
        // CONTINUATION frames.
        if self.deframe.assembly.is_some()
            && header.frame_type() != Some(FrameType::Continuation)
        {
            return Err(TransportError::new("expected CONTINUATION frame")
                .with_http2_code(ErrorCode::ProtocolError));
        }

        match header.frame_type() {
            Some(FrameType::Data) => self.handle_data(cx, &header, payload)?,
            Some(FrameType::Headers) => {
                self.handle_headers(cx, &header, payload, requests_started)?
            }
            Some(FrameType::Continuation) => {
                self.handle_continuation(cx, &header, payload, requests_started)?
            }
            Some(FrameType::Settings) => self.handle_settings(cx, &header, &payload)?,
            Some(FrameType::Ping) => self.handle_ping(cx, &header, &payload)?,
            Some(FrameType::GoAway) => self.handle_goaway(cx, &header, payload)?,
            Some(FrameType::WindowUpdate) => self.handle_window_update(cx, &header, &payload)?,
            Some(FrameType::RstStream) => self.handle_rst_stream(cx, &header, &payload)?,
            Some(FrameType::Priority) => {
                if payload.len() != 5 {
                    return Err(TransportError::new("malformed PRIORITY frame")
                        .with_http2_code(ErrorCode::FrameSizeError));
                }
                // Priorities are not implemented.
            }
            Some(FrameType::PushPromise) => {
                return Err(TransportError::new("push is disabled on this connection")
                    .with_http2_code(ErrorCode::ProtocolError));
            }
            None => {
                // Unknown frame types must be ignored.
            }
        }
        Ok(FrameDispatch::Dispatched)
    }

    fn handle_data(
        &mut self,
        cx: &Arc<TransportShared>,
        header: &FrameHeader,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        let data = decode::data_payload(header, payload).map_err(frame_error)?;
        // Flow control covers the whole payload, padding included.
        self.flow_control.recv_data(header.length).map_err(|violation| {
            TransportError::new(violation.to_string())
                .with_http2_code(ErrorCode::FlowControlError)
        })?;

        let Some(&key) = self.stream_map.get(&header.stream_id) else {
            // Closed or never-created stream: the bytes still counted
            // against the connection window, nothing else to do.
            return Ok(());
        };
        let acked_initial_window = self.flow_control.acked_initial_window();
        {
            let stream = self.streams.get_mut(&key).expect("mapped stream exists");
            if !stream.read_closed {
                stream
                    .flow_control
                    .recv_data(acked_initial_window, header.length)
                    .map_err(|violation| {
                        TransportError::new(violation.to_string())
                            .with_http2_code(ErrorCode::FlowControlError)
                    })?;
                stream.frame_storage.extend_from_slice(&data);
            }
        }
        if header.has_flag(flags::END_STREAM) {
            if let Some(stream) = self.streams.get_mut(&key) {
                stream.eos_received = true;
            }
            self.mark_stream_closed(cx, key, true, false, None);
        } else {
            self.maybe_complete_recv_message(cx, key);
        }
        Ok(())
    }

    fn handle_headers(
        &mut self,
        cx: &Arc<TransportShared>,
        header: &FrameHeader,
        payload: Bytes,
        requests_started: &mut u32,
    ) -> Result<(), TransportError> {
        let fragment = decode::headers_fragment(header, payload).map_err(frame_error)?;
        let end_stream = header.has_flag(flags::END_STREAM);
        if header.has_flag(flags::END_HEADERS) {
            let block = fragment;
            return self.process_header_block(cx, header.stream_id, end_stream, &block, requests_started);
        }
        self.deframe.assembly = Some(HeaderAssembly {
            stream_id: header.stream_id,
            end_stream,
            block: BytesMut::from(&fragment[..]),
        });
        Ok(())
    }

    fn handle_continuation(
        &mut self,
        cx: &Arc<TransportShared>,
        header: &FrameHeader,
        payload: Bytes,
        requests_started: &mut u32,
    ) -> Result<(), TransportError> {
        let Some(assembly) = self.deframe.assembly.as_mut() else {
            return Err(TransportError::new("unexpected CONTINUATION frame")
                .with_http2_code(ErrorCode::ProtocolError));
        };
        if assembly.stream_id != header.stream_id {
            return Err(TransportError::new("CONTINUATION on the wrong stream")
                .with_http2_code(ErrorCode::ProtocolError));
        }
        assembly.block.extend_from_slice(&payload);
        if !header.has_flag(flags::END_HEADERS) {
            return Ok(());
        }
        let assembly = self.deframe.assembly.take().expect("checked above");
        let block = assembly.block.freeze();
        self.process_header_block(
            cx,
            assembly.stream_id,
            assembly.end_stream,
            &block,
            requests_started,
        )
    }

    fn process_header_block(
        &mut self,
        cx: &Arc<TransportShared>,
        stream_id: u32,
        end_stream: bool,
        block: &[u8],
        requests_started: &mut u32,
    ) -> Result<(), TransportError> {
        // Always decode: HPACK state is shared across the connection and
        // must advance even for blocks we end up dropping.
        let fields = self.hpack_decoder.decode(block).map_err(|error| {
            TransportError::new(error.to_string()).with_http2_code(ErrorCode::CompressionError)
        })?;
        let metadata = Metadata::from_header_fields(fields).map_err(|error| {
            TransportError::new(error.to_string()).with_http2_code(ErrorCode::ProtocolError)
        })?;

        let key = match self.stream_map.get(&stream_id).copied() {
            Some(key) => key,
            None if self.is_client => {
                // A closed stream we no longer track.
                return Ok(());
            }
            None => match self.accept_incoming_stream(cx, stream_id, requests_started)? {
                Some(key) => key,
                None => return Ok(()),
            },
        };

        {
            let stream = self.streams.get_mut(&key).expect("mapped stream exists");
            if stream.header_frames_received == 0 {
                if self.is_client && end_stream && metadata.grpc_status().is_some() {
                    // Trailers-only response: no messages are coming;
                    // both slots publish at once.
                    stream.parsed_trailers_only = true;
                    stream.trailing_metadata_buffer.merge(metadata);
                    stream.published[0] = PublishedMetadata::FromWire;
                    stream.published[1] = PublishedMetadata::FromWire;
                } else {
                    if !self.is_client {
                        if let Some(timeout) = metadata.grpc_timeout() {
                            stream.deadline = Some(Instant::now() + timeout);
                        }
                    }
                    stream.initial_metadata_buffer.merge(metadata);
                    stream.published[0] = PublishedMetadata::FromWire;
                }
            } else {
                stream.trailing_metadata_buffer.merge(metadata);
                stream.published[1] = PublishedMetadata::FromWire;
            }
            stream.header_frames_received += 1;
        }

        self.maybe_complete_recv_initial_metadata(cx, key);
        if end_stream {
            if let Some(stream) = self.streams.get_mut(&key) {
                stream.eos_received = true;
            }
            self.mark_stream_closed(cx, key, true, false, None);
        } else {
            self.maybe_complete_recv_message(cx, key);
        }
        Ok(())
    }

    /// Server path: validate and admit a peer-initiated stream.
    fn accept_incoming_stream(
        &mut self,
        cx: &Arc<TransportShared>,
        stream_id: u32,
        requests_started: &mut u32,
    ) -> Result<Option<crate::stream::StreamKey>, TransportError> {
        if stream_id % 2 == 0 {
            return Err(TransportError::new("client used an even stream id")
                .with_http2_code(ErrorCode::ProtocolError));
        }
        if stream_id <= self.last_new_stream_id {
            // A closed stream; the block already updated HPACK state.
            return Ok(None);
        }
        self.last_new_stream_id = stream_id;

        if self.closed_with_error.is_some()
            || matches!(
                self.goaway_send_state,
                GoawaySendState::FinalScheduled | GoawaySendState::FinalSent
            )
        {
            return Ok(None);
        }
        let over_concurrency = (self.stream_map.len() as u64)
            >= self.local_settings.max_concurrent_streams as u64;
        let over_unacked_budget = self.config.max_concurrent_streams_overload_protection
            && self.incoming_streams_before_settings_ack == 0;
        if over_concurrency || over_unacked_budget || self.accept_stream.is_none() {
            debug!(
                peer = %self.peer,
                stream_id,
                over_concurrency,
                "refusing incoming stream"
            );
            self.queue_rst_stream(stream_id, ErrorCode::RefusedStream.as_u32());
            self.initiate_write(cx, WriteReason::RstStream);
            return Ok(None);
        }
        if self.incoming_streams_before_settings_ack != u32::MAX {
            self.incoming_streams_before_settings_ack =
                self.incoming_streams_before_settings_ack.saturating_sub(1);
        }
        *requests_started += 1;

        let key = cx.next_stream_key();
        let mut stream = Stream::new(key);
        stream.id = stream_id;
        self.streams.insert(key, stream);
        self.stream_map.insert(stream_id, key);
        self.post_destructive_reclaimer(cx);
        trace!(peer = %self.peer, stream_id, "accepted incoming stream");
        if let Some(mut accept) = self.accept_stream.take() {
            accept(StreamHandle(key));
            if self.accept_stream.is_none() {
                self.accept_stream = Some(accept);
            }
        }
        Ok(Some(key))
    }

    fn handle_settings(
        &mut self,
        cx: &Arc<TransportShared>,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let updates = decode::parse_settings(header, payload).map_err(frame_error)?;
        if header.has_flag(flags::ACK) {
            self.acked_settings = self.sent_settings;
            self.flow_control
                .set_acked_initial_window(self.acked_settings.initial_window_size);
            cx.cancel_timer(self.settings_ack_watchdog.take());
            self.incoming_streams_before_settings_ack =
                self.local_settings.max_concurrent_streams;
            return Ok(());
        }
        let old_initial_window = self.peer_settings.initial_window_size;
        let old_table_size = self.peer_settings.header_table_size;
        for setting in updates {
            self.peer_settings.apply(setting).map_err(frame_error)?;
        }
        if self.peer_settings.header_table_size != old_table_size {
            self.hpack_encoder
                .set_peer_table_size(self.peer_settings.header_table_size as usize);
        }
        let delta =
            self.peer_settings.initial_window_size as i64 - old_initial_window as i64;
        if delta != 0 {
            self.initial_window_update += delta;
        }
        if !self.peer_settings_seen {
            self.peer_settings_seen = true;
            if let Some(callback) = self.notify_on_receive_settings.take() {
                self.defer_done(callback, Ok(()));
            }
        }
        self.queue_settings_ack();
        self.initiate_write(cx, WriteReason::SettingsAck);
        if self.is_client {
            // The concurrency budget may have opened up.
            self.maybe_start_some_streams(cx);
        }
        Ok(())
    }

    fn handle_ping(
        &mut self,
        cx: &Arc<TransportShared>,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let id = decode::parse_ping(header, payload).map_err(frame_error)?;
        if header.has_flag(flags::ACK) {
            match self.ping_callbacks.ack_ping(id) {
                Some(callbacks) => {
                    trace!(peer = %self.peer, id, "ping acked");
                    for callback in callbacks {
                        self.after_turn.push(Box::new(move || callback(Ok(()))));
                    }
                    if self.ping_callbacks.inflight_count() == 0 {
                        cx.cancel_timer(self.ping_timeout_timer.take());
                    }
                    if self.ping_callbacks.ping_requested() {
                        self.initiate_write(cx, WriteReason::ContinuePings);
                    }
                }
                None => {
                    debug!(peer = %self.peer, id, "unknown ping response");
                }
            }
            return Ok(());
        }
        if !self.is_client {
            let idle = self.stream_map.is_empty() && !self.keepalive_permit_without_calls;
            if self.ping_abuse.received_one_ping(Instant::now(), idle) {
                debug!(peer = %self.peer, "peer exceeded ping strikes");
                self.exceeded_ping_strikes(cx);
                return Ok(());
            }
        }
        if self.config.ack_pings {
            self.queue_ping_ack(id);
            self.initiate_write(cx, WriteReason::PingResponse);
        }
        Ok(())
    }

    fn handle_goaway(
        &mut self,
        cx: &Arc<TransportShared>,
        header: &FrameHeader,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        let goaway = decode::parse_goaway(header, payload).map_err(frame_error)?;
        self.add_incoming_goaway(
            cx,
            goaway.error_code,
            goaway.last_stream_id,
            &goaway.debug_data,
        );
        Ok(())
    }

    fn handle_window_update(
        &mut self,
        cx: &Arc<TransportShared>,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let increment = decode::parse_window_update(header, payload).map_err(frame_error)?;
        if header.stream_id == 0 {
            let was_stalled = self.flow_control.remote_window() <= 0;
            self.flow_control.recv_window_update(increment).map_err(|violation| {
                TransportError::new(violation.to_string())
                    .with_http2_code(ErrorCode::FlowControlError)
            })?;
            if was_stalled && self.flow_control.remote_window() > 0 {
                let mut unstalled = false;
                while let Some(key) = self.list_pop(StreamList::StalledByTransport) {
                    self.mark_stream_writable(key);
                    unstalled = true;
                }
                if unstalled {
                    self.initiate_write(cx, WriteReason::TransportFlowControlUnstalled);
                }
            }
            return Ok(());
        }
        let Some(&key) = self.stream_map.get(&header.stream_id) else {
            return Ok(());
        };
        let peer_initial_window = self.peer_settings.initial_window_size;
        let overflow = {
            let stream = self.streams.get_mut(&key).expect("mapped stream exists");
            stream
                .flow_control
                .recv_window_update(peer_initial_window, increment)
                .is_err()
        };
        if overflow {
            let error = TransportError::new("stream flow control window overflow")
                .with_http2_code(ErrorCode::FlowControlError)
                .with_status(Code::Internal);
            self.cancel_stream(cx, key, error, false);
            return Ok(());
        }
        if self.list_remove(key, StreamList::StalledByStream) {
            self.mark_stream_writable(key);
            self.initiate_write(cx, WriteReason::FlowControlUnstalledByUpdate);
        }
        Ok(())
    }

    fn handle_rst_stream(
        &mut self,
        cx: &Arc<TransportShared>,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let code = decode::parse_rst_stream(header, payload).map_err(frame_error)?;
        if let Some(&key) = self.stream_map.get(&header.stream_id) {
            let http2_code = ErrorCode::from_u32(code);
            let error = TransportError::new(format!("RST_STREAM received: {}", http2_code))
                .with_http2_code(http2_code)
                .with_status(status::http2_error_to_code(http2_code))
                .with_peer(self.peer.clone());
            self.mark_stream_closed(cx, key, true, true, Some(error));
        }
        // Resetting streams is cheap for the peer and expensive for us;
        // occasionally make the peer answer a ping for the privilege.
        if !self.is_client && self.config.ping_on_rst_stream_percent > 0 {
            use rand::Rng;
            let roll: u32 = self.rng.random_range(0..100);
            if roll < self.config.ping_on_rst_stream_percent {
                self.ping_callbacks.request_ping();
                self.initiate_write(cx, WriteReason::ApplicationPing);
            }
        }
        Ok(())
    }

    fn try_http1_sniff(&self) -> Option<TransportError> {
        let buffer = &self.sniff_buffer;
        if buffer.len() < 12 || !buffer.starts_with(b"HTTP/1.") {
            return None;
        }
        let http_status: u16 = std::str::from_utf8(&buffer[9..12]).ok()?.parse().ok()?;
        Some(
            TransportError::new(format!(
                "Trying to connect an http1.x server (HTTP status {})",
                http_status
            ))
            .with_status(status::http_status_to_code(http_status))
            .with_peer(self.peer.clone()),
        )
    }
}

fn frame_error(error: http2::FrameError) -> TransportError {
    use http2::FrameError::*;
    let code = match &error {
        FrameTooLarge { .. } | InvalidLength { .. } => ErrorCode::FrameSizeError,
        ZeroWindowIncrement => ErrorCode::ProtocolError,
        InvalidStreamId { .. } | InvalidPadding { .. } | InvalidSetting { .. } => {
            ErrorCode::ProtocolError
        }
    };
    TransportError::new(error.to_string()).with_http2_code(code)
}
