//! Stream op dispatch and stream lifecycle transitions.
//!
//! Everything here runs under the combiner. Op batches latch state onto
//! the stream and poke the write scheduler; the `maybe_complete_*` gates
//! decide when latched receive callbacks may fire; `mark_stream_closed`
//! drives the half-close/full-close transitions, including synthesizing
//! trailers when a stream ends without real ones.

use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use tracing::{trace, warn};

use http2::ErrorCode;

use crate::error::{StreamNetworkState, TransportError};
use crate::message::{self, Deframed, MessageError, ReceivedMessage, MESSAGE_HEADER_SIZE};
use crate::metadata::Metadata;
use crate::op::{CallbackBarrier, SendFlags, SendMessage, StreamOpBatch};
use crate::status::Code;
use crate::stream::{PublishedMetadata, Stream, StreamKey, StreamList, WriteCallback};
use crate::transport::{TransportShared, TransportState};
use crate::write::{WriteReason, WriteState};

impl TransportState {
    /// Release one barrier ref. When that arms the callback, run it now
    /// unless it may cover a write that is still in flight.
    pub(crate) fn finish_closure_step(
        &mut self,
        barrier: CallbackBarrier,
        error: Option<TransportError>,
    ) {
        let may_cover_write = barrier.may_cover_write();
        if let Some(callback) = barrier.release(error) {
            if may_cover_write && self.write_state != WriteState::Idle {
                self.run_after_write.push(callback);
            } else {
                self.after_turn.push(callback);
            }
        }
    }

    pub(crate) fn perform_stream_op_locked(
        &mut self,
        cx: &Arc<TransportShared>,
        key: StreamKey,
        batch: StreamOpBatch,
    ) {
        if !self.streams.contains_key(&key) {
            warn!(peer = %self.peer, "op batch for unknown stream");
            if let Some(callback) = batch.on_complete {
                self.defer_done(
                    callback,
                    Err(TransportError::new("stream already destroyed")
                        .with_status(Code::Internal)),
                );
            }
            return;
        }

        trace!(
            peer = %self.peer,
            key,
            cancel = batch.cancel.is_some(),
            send_initial = batch.send_initial_metadata.is_some(),
            send_message = batch.send_message.is_some(),
            send_trailing = batch.send_trailing_metadata.is_some(),
            "perform stream op"
        );

        let has_send_ops = batch.has_send_ops();
        let barrier = CallbackBarrier::new(batch.on_complete);
        if has_send_ops {
            barrier.set_may_cover_write();
        }
        let buffer_hint = batch
            .send_message
            .as_ref()
            .map(|message| message.flags.contains(SendFlags::BUFFER_HINT))
            .unwrap_or(false);

        if let Some(error) = batch.cancel {
            self.cancel_stream(cx, key, error, batch.cancel_tarpit);
        }
        if let Some(metadata) = batch.send_initial_metadata {
            self.op_send_initial_metadata(cx, key, metadata, &barrier, buffer_hint);
        }
        if let Some(message) = batch.send_message {
            self.op_send_message(cx, key, message, &barrier);
        }
        if let Some(metadata) = batch.send_trailing_metadata {
            self.op_send_trailing_metadata(cx, key, metadata, &barrier);
        }
        if let Some(on_ready) = batch.recv_initial_metadata {
            if let Some(stream) = self.streams.get_mut(&key) {
                debug_assert!(stream.recv_initial_metadata_ready.is_none());
                stream.recv_initial_metadata_ready = Some(on_ready);
            }
            self.maybe_complete_recv_initial_metadata(cx, key);
        }
        if let Some(on_ready) = batch.recv_message {
            if let Some(stream) = self.streams.get_mut(&key) {
                debug_assert!(stream.recv_message_ready.is_none());
                stream.recv_message_ready = Some(on_ready);
            }
            self.maybe_complete_recv_trailing_metadata(cx, key);
        }
        if let Some(on_ready) = batch.recv_trailing_metadata {
            if let Some(stream) = self.streams.get_mut(&key) {
                debug_assert!(stream.recv_trailing_metadata_ready.is_none());
                stream.recv_trailing_metadata_ready = Some(on_ready);
                stream.final_metadata_requested = true;
            }
            self.maybe_complete_recv_trailing_metadata(cx, key);
        }

        self.finish_closure_step(barrier, None);
    }

    fn op_send_initial_metadata(
        &mut self,
        cx: &Arc<TransportShared>,
        key: StreamKey,
        metadata: Metadata,
        barrier: &CallbackBarrier,
        buffer_hint: bool,
    ) {
        enum Path {
            StartClient,
            CancelClosedTransport(TransportError),
            StartServer,
            WriteClosed(Option<TransportError>),
        }
        let step = barrier.add_ref();
        let path = {
            let Some(stream) = self.streams.get_mut(&key) else {
                return self.finish_closure_step(
                    step,
                    Some(TransportError::new("stream already destroyed")),
                );
            };
            debug_assert!(stream.send_initial_metadata_finished.is_none());
            if self.is_client {
                if let Some(timeout) = metadata.grpc_timeout() {
                    let deadline = Instant::now() + timeout;
                    stream.deadline = Some(match stream.deadline {
                        Some(existing) => existing.min(deadline),
                        None => deadline,
                    });
                }
            }
            if metadata.grpc_status().is_some_and(|code| !code.is_ok()) {
                stream.seen_error = true;
            }
            if !stream.write_closed {
                stream.initial_metadata_to_send = Some(metadata);
                stream.send_initial_metadata_finished = Some(step.clone());
                if self.is_client {
                    if self.closed_with_error.is_none() {
                        debug_assert_eq!(stream.id, 0);
                        Path::StartClient
                    } else {
                        stream
                            .trailing_metadata_buffer
                            .set_network_state(StreamNetworkState::NotSentOnWire);
                        let closed = self.closed_with_error.clone().expect("checked above");
                        Path::CancelClosedTransport(
                            TransportError::referencing("Transport closed", &closed)
                                .with_status(Code::Unavailable),
                        )
                    }
                } else {
                    debug_assert_ne!(stream.id, 0);
                    Path::StartServer
                }
            } else {
                Path::WriteClosed(stream.write_closed_error.clone())
            }
        };
        match path {
            Path::StartClient => {
                self.list_add(key, StreamList::WaitingForConcurrency);
                self.maybe_start_some_streams(cx);
            }
            Path::CancelClosedTransport(error) => {
                self.cancel_stream(cx, key, error, false);
            }
            Path::StartServer => {
                self.mark_stream_writable(key);
                if !buffer_hint {
                    self.initiate_write(cx, WriteReason::SendInitialMetadata);
                }
            }
            Path::WriteClosed(cause) => {
                let error = match cause {
                    Some(cause) => TransportError::referencing(
                        "Attempt to send initial metadata after stream was closed",
                        &cause,
                    ),
                    None => TransportError::new(
                        "Attempt to send initial metadata after stream was closed",
                    ),
                };
                self.finish_closure_step(step, Some(error));
            }
        }
    }

    fn op_send_message(
        &mut self,
        cx: &Arc<TransportShared>,
        key: StreamKey,
        message: SendMessage,
        barrier: &CallbackBarrier,
    ) {
        let mut step = Some(barrier.add_ref());
        let mut make_writable = false;
        let mut complete_now = false;
        {
            let Some(stream) = self.streams.get_mut(&key) else {
                let step = step.take().expect("unreleased");
                return self.finish_closure_step(
                    step,
                    Some(TransportError::new("stream already destroyed")),
                );
            };
            if stream.write_closed {
                // Completes without error so the surface layer notices
                // the closed stream itself rather than starting a
                // cancellation.
                complete_now = true;
            } else {
                let length = message.len() as u32;
                message::put_message_header(
                    &mut stream.flow_controlled_buffer,
                    message.flags.contains(SendFlags::COMPRESSED),
                    length,
                );
                for slice in &message.slices {
                    stream.flow_controlled_buffer.extend_from_slice(slice);
                }
                stream.stats.messages_sent += 1;
                stream.stats.framing_bytes_sent += MESSAGE_HEADER_SIZE as u64;
                stream.stats.data_bytes_sent += length as u64;

                let mut notify_offset = stream.flow_controlled_bytes_written
                    + stream.flow_controlled_buffer.len() as i64;
                if message.flags.contains(SendFlags::BUFFER_HINT) {
                    // Completing early trades latency for batching: the
                    // application moves on while the tail stays buffered.
                    notify_offset -= self.config.write_buffer_size as i64;
                    stream.write_buffering = true;
                } else {
                    stream.write_buffering = false;
                }

                if notify_offset <= stream.flow_controlled_bytes_written {
                    complete_now = true;
                } else {
                    let callback = WriteCallback {
                        call_at_byte: notify_offset,
                        barrier: step.take().expect("unreleased"),
                    };
                    if message.flags.contains(SendFlags::WRITE_THROUGH) {
                        stream.on_write_finished_cbs.push(callback);
                    } else {
                        stream.on_flow_controlled_cbs.push(callback);
                    }
                }
                make_writable = stream.id != 0
                    && (!stream.write_buffering
                        || stream.flow_controlled_buffer.len()
                            > self.config.write_buffer_size as usize);
            }
        }
        if complete_now {
            let step = step.take().expect("unreleased");
            self.finish_closure_step(step, None);
        }
        if make_writable {
            self.mark_stream_writable(key);
            self.initiate_write(cx, WriteReason::SendMessage);
        }
    }

    fn op_send_trailing_metadata(
        &mut self,
        cx: &Arc<TransportShared>,
        key: StreamKey,
        metadata: Metadata,
        barrier: &CallbackBarrier,
    ) {
        enum Path {
            Queued { started: bool },
            WriteClosed { empty: bool, cause: Option<TransportError> },
        }
        let mut step = Some(barrier.add_ref());
        let path = {
            let Some(stream) = self.streams.get_mut(&key) else {
                let step = step.take().expect("unreleased");
                return self.finish_closure_step(
                    step,
                    Some(TransportError::new("stream already destroyed")),
                );
            };
            debug_assert!(stream.send_trailing_metadata_finished.is_none());
            stream.write_buffering = false;
            if metadata.grpc_status().is_some_and(|code| !code.is_ok()) {
                stream.seen_error = true;
            }
            if stream.write_closed {
                Path::WriteClosed {
                    empty: metadata.is_empty(),
                    cause: stream.write_closed_error.clone(),
                }
            } else {
                stream.trailing_metadata_to_send = Some(metadata);
                stream.send_trailing_metadata_finished = step.take();
                Path::Queued {
                    started: stream.id != 0,
                }
            }
        };
        match path {
            Path::Queued { started } => {
                if started {
                    self.mark_stream_writable(key);
                    self.initiate_write(cx, WriteReason::SendTrailingMetadata);
                }
            }
            Path::WriteClosed { empty, cause } => {
                let step = step.take().expect("unreleased");
                let error = if empty {
                    None
                } else {
                    Some(match cause {
                        Some(cause) => TransportError::referencing(
                            "Attempt to send trailing metadata after stream was closed",
                            &cause,
                        ),
                        None => TransportError::new(
                            "Attempt to send trailing metadata after stream was closed",
                        ),
                    })
                };
                self.finish_closure_step(step, error);
            }
        }
    }

    //
    // Receive completion gates.
    //

    pub(crate) fn maybe_complete_recv_initial_metadata(
        &mut self,
        _cx: &Arc<TransportShared>,
        key: StreamKey,
    ) {
        let deliver = {
            let Some(stream) = self.streams.get_mut(&key) else {
                return;
            };
            if stream.recv_initial_metadata_ready.is_none()
                || stream.published[0] == PublishedMetadata::NotPublished
            {
                None
            } else {
                if stream.seen_error {
                    stream.frame_storage.clear();
                }
                let metadata = std::mem::take(&mut stream.initial_metadata_buffer);
                let on_ready = stream
                    .recv_initial_metadata_ready
                    .take()
                    .expect("checked above");
                Some((on_ready, metadata))
            }
        };
        if let Some((on_ready, metadata)) = deliver {
            self.after_turn.push(Box::new(move || on_ready(metadata)));
        }
    }

    /// Two stages with one exit: drain the buffered bytes through the
    /// deframer, then decide delivery from the latched error state and
    /// the published trailing metadata.
    pub(crate) fn maybe_complete_recv_message(
        &mut self,
        cx: &Arc<TransportShared>,
        key: StreamKey,
    ) {
        let max_message_size = message::DEFAULT_MAX_MESSAGE_SIZE;
        let mut deframe_error: Option<MessageError> = None;
        let outcome = {
            let acked_initial_window = self.flow_control.acked_initial_window();
            let Some(stream) = self.streams.get_mut(&key) else {
                return;
            };
            if stream.recv_message_ready.is_none() {
                return;
            }

            let mut waiting = false;
            let mut min_progress = 0usize;
            let mut deframed: Option<ReceivedMessage> = None;

            if stream.final_metadata_requested && stream.seen_error {
                // An error is about to replace any buffered data.
                stream.frame_storage.clear();
            } else if !stream.frame_storage.is_empty() {
                match message::deframe(&mut stream.frame_storage, max_message_size) {
                    Ok(Deframed::Message(received)) => {
                        stream.stats.messages_received += 1;
                        stream.stats.framing_bytes_received += MESSAGE_HEADER_SIZE as u64;
                        stream.stats.data_bytes_received += received.payload.len() as u64;
                        deframed = Some(received);
                    }
                    Ok(Deframed::Pending { min_progress: need }) => {
                        if stream.read_closed {
                            // A truncated message at end of stream;
                            // trailers carry the story.
                            stream.frame_storage.clear();
                        } else {
                            waiting = true;
                            min_progress = need;
                        }
                    }
                    Err(error) => {
                        stream.seen_error = true;
                        stream.frame_storage.clear();
                        deframe_error = Some(error);
                    }
                }
            } else if !stream.read_closed {
                waiting = true;
                min_progress = MESSAGE_HEADER_SIZE;
            }

            let deliver = if waiting {
                None
            } else if let Some(received) = deframed {
                Some(Some(received))
            } else if stream.published[1] != PublishedMetadata::NotPublished {
                Some(None)
            } else {
                None
            };
            let on_ready = if deliver.is_some() {
                stream.recv_message_ready.take()
            } else {
                None
            };

            let pending = stream.frame_storage.len();
            let mut update = stream.flow_control.incoming_update();
            update.set_min_progress_size(min_progress);
            update.set_pending_size(pending);
            let action = update.finish(acked_initial_window, &self.flow_control);
            (deliver, on_ready, action)
        };
        let (deliver, on_ready, action) = outcome;
        if let (Some(payload), Some(on_ready)) = (deliver, on_ready) {
            self.after_turn.push(Box::new(move || on_ready(payload)));
        }
        self.act_on_flowctl_action(cx, action, Some(key));
        if let Some(error) = deframe_error {
            let status = match &error {
                MessageError::TooLarge { .. } => Code::ResourceExhausted,
                MessageError::InvalidFlags(_) => Code::Internal,
            };
            let error = TransportError::new(error.to_string()).with_status(status);
            self.cancel_stream(cx, key, error, false);
        }
    }

    pub(crate) fn maybe_complete_recv_trailing_metadata(
        &mut self,
        cx: &Arc<TransportShared>,
        key: StreamKey,
    ) {
        self.maybe_complete_recv_message(cx, key);
        let deliver = {
            let Some(stream) = self.streams.get_mut(&key) else {
                return;
            };
            if stream.recv_trailing_metadata_ready.is_none()
                || !stream.read_closed
                || !stream.write_closed
            {
                None
            } else {
                if stream.seen_error || !self.is_client {
                    stream.frame_storage.clear();
                }
                if stream.frame_storage.is_empty() {
                    let metadata = std::mem::take(&mut stream.trailing_metadata_buffer);
                    let stats = stream.stats;
                    let on_ready = stream
                        .recv_trailing_metadata_ready
                        .take()
                        .expect("checked above");
                    Some((on_ready, metadata, stats))
                } else {
                    None
                }
            }
        };
        if let Some((on_ready, metadata, stats)) = deliver {
            self.after_turn
                .push(Box::new(move || on_ready(metadata, stats)));
        }
    }

    //
    // Stream close.
    //

    fn removal_error(
        extra: Option<&TransportError>,
        stream: &Stream,
        message: &str,
    ) -> Option<TransportError> {
        let source = extra
            .or(stream.read_closed_error.as_ref())
            .or(stream.write_closed_error.as_ref())?;
        Some(TransportError::referencing(message.to_string(), source))
    }

    /// Synthesize trailing metadata from an error when the wire never
    /// delivered (or will never deliver) real trailers.
    pub(crate) fn fake_status(
        &mut self,
        cx: &Arc<TransportShared>,
        key: StreamKey,
        error: TransportError,
    ) {
        let publish = {
            let Some(stream) = self.streams.get_mut(&key) else {
                return;
            };
            let code = match (error.code(), stream.deadline) {
                // A cancellation racing the deadline is the deadline's
                // fault.
                (Code::Cancelled, Some(deadline)) if deadline <= Instant::now() => {
                    Code::DeadlineExceeded
                }
                (code, _) => code,
            };
            if !code.is_ok() {
                stream.seen_error = true;
            }
            // The trailing slot may be overwritten until the upper layer
            // has observed it: something more important than what the
            // wire said has happened.
            if stream.published[1] == PublishedMetadata::NotPublished
                || stream.recv_trailing_metadata_ready.is_some()
                || !stream.final_metadata_requested
            {
                stream.trailing_metadata_buffer.set_grpc_status(code);
                if !error.message().is_empty() {
                    stream
                        .trailing_metadata_buffer
                        .set_grpc_message(error.message().to_string());
                }
                if let Some(state) = error.network_state() {
                    stream.trailing_metadata_buffer.set_network_state(state);
                }
                if let Some(throttle) = error.keepalive_throttle() {
                    stream
                        .trailing_metadata_buffer
                        .set_keepalive_throttle(throttle);
                }
                stream.published[1] = PublishedMetadata::Synthesized;
                true
            } else {
                false
            }
        };
        if publish {
            self.maybe_complete_recv_trailing_metadata(cx, key);
        }
    }

    /// Resolve every send-side completion still pending on the stream:
    /// with the closure error when there is one, cleanly otherwise (a
    /// clean write-close after trailers owes its callbacks success).
    fn fail_pending_writes(
        &mut self,
        _cx: &Arc<TransportShared>,
        key: StreamKey,
        error: Option<TransportError>,
    ) {
        let (barriers, error) = {
            let Some(stream) = self.streams.get_mut(&key) else {
                return;
            };
            let error = Self::removal_error(
                error.as_ref(),
                stream,
                "Pending writes failed due to stream closure",
            );
            stream.initial_metadata_to_send = None;
            stream.trailing_metadata_to_send = None;
            let mut barriers = Vec::new();
            barriers.extend(stream.send_initial_metadata_finished.take());
            barriers.extend(stream.send_trailing_metadata_finished.take());
            barriers.extend(
                std::mem::take(&mut stream.on_write_finished_cbs)
                    .into_iter()
                    .map(|callback| callback.barrier),
            );
            barriers.extend(
                std::mem::take(&mut stream.on_flow_controlled_cbs)
                    .into_iter()
                    .map(|callback| callback.barrier),
            );
            (barriers, error)
        };
        for barrier in barriers {
            self.finish_closure_step(barrier, error.clone());
        }
    }

    /// Drive read/write half-closes. When both halves close, the stream
    /// leaves the map and trailers are synthesized if needed.
    pub(crate) fn mark_stream_closed(
        &mut self,
        cx: &Arc<TransportShared>,
        key: StreamKey,
        close_reads: bool,
        close_writes: bool,
        error: Option<TransportError>,
    ) {
        let (already_closed, pre_overall) = {
            let Some(stream) = self.streams.get_mut(&key) else {
                return;
            };
            let already = stream.fully_closed();
            let overall = Self::removal_error(error.as_ref(), stream, "Stream removed");
            (already, overall)
        };
        if already_closed {
            // Already closed, but the status may still need faking.
            if let Some(overall) = pre_overall {
                self.fake_status(cx, key, overall);
            }
            self.maybe_complete_recv_trailing_metadata(cx, key);
            return;
        }

        let mut closed_read = false;
        let mut closed_write = false;
        let mut became_closed = false;
        let mut overall = None;
        let mut id = 0;
        let mut eos_sent = false;
        let mut eos_received = false;
        let mut trailers_only = false;
        {
            let stream = self.streams.get_mut(&key).expect("checked above");
            if close_reads && !stream.read_closed {
                stream.read_closed_error = error.clone();
                stream.read_closed = true;
                closed_read = true;
            }
            if close_writes && !stream.write_closed {
                stream.write_closed_error = error.clone();
                stream.write_closed = true;
                closed_write = true;
            }
            if stream.fully_closed() {
                became_closed = true;
                overall = Self::removal_error(error.as_ref(), stream, "Stream removed");
                id = stream.id;
            }
            if closed_read {
                for slot in 0..2 {
                    if stream.published[slot] == PublishedMetadata::NotPublished {
                        stream.published[slot] = PublishedMetadata::AtClose;
                    }
                }
            }
            eos_sent = stream.eos_sent;
            eos_received = stream.eos_received;
            trailers_only = stream.parsed_trailers_only;
        }
        trace!(
            peer = %self.peer,
            key,
            closed_read,
            closed_write,
            became_closed,
            eos_sent,
            eos_received,
            trailers_only,
            "stream close transition"
        );
        if closed_write {
            self.fail_pending_writes(cx, key, error.clone());
        }
        if became_closed {
            if id != 0 {
                self.remove_stream(cx, key, id, overall.clone());
            } else {
                self.list_remove(key, StreamList::WaitingForConcurrency);
            }
            if let Some(overall) = overall {
                self.fake_status(cx, key, overall);
            }
        }
        if closed_read {
            self.maybe_complete_recv_initial_metadata(cx, key);
            self.maybe_complete_recv_message(cx, key);
        }
        if became_closed {
            self.maybe_complete_recv_trailing_metadata(cx, key);
        }
    }

    fn remove_stream(
        &mut self,
        cx: &Arc<TransportShared>,
        key: StreamKey,
        id: u32,
        error: Option<TransportError>,
    ) {
        self.stream_map.remove(&id);
        if self.stream_map.is_empty() {
            self.post_benign_reclaimer(cx);
            if self.goaway_send_state == crate::transport::GoawaySendState::FinalSent {
                let close_error = match &error {
                    Some(error) => TransportError::referencing(
                        "Last stream closed after sending GOAWAY",
                        error,
                    ),
                    None => TransportError::new("Last stream closed after sending GOAWAY"),
                };
                self.close_transport(cx, close_error);
            }
        }
        self.list_remove(key, StreamList::Writable);
        self.list_remove(key, StreamList::StalledByTransport);
        self.list_remove(key, StreamList::StalledByStream);
        self.maybe_start_some_streams(cx);
    }

    //
    // Cancellation.
    //

    pub(crate) fn cancel_stream(
        &mut self,
        cx: &Arc<TransportShared>,
        key: StreamKey,
        error: TransportError,
        tarpit: bool,
    ) {
        let (fast_path, id, already_closed) = {
            let Some(stream) = self.streams.get_mut(&key) else {
                return;
            };
            let fast_path = !self.is_client
                && !stream.sent_trailing_metadata
                && error.has_clear_status()
                && !stream.fully_closed();
            stream.seen_error = true;
            (fast_path, stream.id, stream.fully_closed())
        };
        if fast_path {
            self.close_from_api(cx, key, error, tarpit);
            return;
        }
        if !already_closed && id != 0 {
            let http_error = error.http2_code();
            self.mark_stream_closed(cx, key, true, true, Some(error));
            self.maybe_tarpit(cx, tarpit, move |state, cx| {
                state.queue_rst_stream(id, http_error.as_u32());
                state.initiate_write(cx, WriteReason::RstStream);
            });
            return;
        }
        self.mark_stream_closed(cx, key, true, true, Some(error));
    }

    /// Server fast path: report the RPC status in a hand-built HEADERS
    /// frame, then reset the stream. The frame is assembled without the
    /// HPACK encoder so it can be emitted even when the send machinery
    /// is partly torn down.
    fn close_from_api(
        &mut self,
        cx: &Arc<TransportShared>,
        key: StreamKey,
        error: TransportError,
        tarpit: bool,
    ) {
        let (id, sent_initial_metadata) = {
            let Some(stream) = self.streams.get(&key) else {
                return;
            };
            (stream.id, stream.sent_initial_metadata)
        };
        let status = error.code();
        let message = error.message().to_string();
        self.mark_stream_closed(cx, key, true, true, Some(error));
        if id == 0 {
            return;
        }
        self.maybe_tarpit(cx, tarpit, move |state, cx| {
            state.queue_status_response(id, sent_initial_metadata, status, &message);
            state.reset_ping_clock();
            state.queue_rst_stream(id, ErrorCode::NoError.as_u32());
            state.initiate_write(cx, WriteReason::CloseFromApi);
        });
    }

    /// Run `action` now, or after a uniformly random tarpit delay when
    /// the server is slowing an abusive peer. Work deferred into the
    /// tarpit is dropped if the transport closes first.
    pub(crate) fn maybe_tarpit<F>(&mut self, cx: &Arc<TransportShared>, tarpit: bool, action: F)
    where
        F: FnOnce(&mut TransportState, &Arc<TransportShared>) + Send + 'static,
    {
        if !tarpit || !self.config.allow_tarpit || self.is_client {
            action(self, cx);
            return;
        }
        let min = self.config.min_tarpit_duration.as_millis() as u64;
        let max = self.config.max_tarpit_duration.as_millis() as u64;
        let delay_millis = if max > min {
            self.rng.random_range(min..=max)
        } else {
            min
        };
        trace!(peer = %self.peer, delay_millis, "tarpitting response");
        let _ = cx.arm_timer(
            std::time::Duration::from_millis(delay_millis),
            move |state, cx| {
                if state.closed_with_error.is_some() {
                    return;
                }
                action(state, cx);
            },
        );
    }
}
