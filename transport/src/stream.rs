//! Per-stream state: send queues, receive slots, closure bookkeeping,
//! and the transport's intrusive stream lists.

use std::time::Instant;

use bytes::BytesMut;

use crate::error::TransportError;
use crate::flow_control::StreamFlowControl;
use crate::metadata::Metadata;
use crate::op::{CallbackBarrier, InitialMetadataReady, MessageReady, TrailersReady};
use crate::transport::TransportState;

/// Opaque identifier the call layer holds for a stream. Stable from
/// `init_stream`/accept until `destroy_stream`, independent of the wire
/// stream id (which is 0 until the stream is admitted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub(crate) u64);

pub(crate) type StreamKey = u64;

/// Counters delivered alongside trailing metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub data_bytes_sent: u64,
    pub data_bytes_received: u64,
    pub framing_bytes_sent: u64,
    pub framing_bytes_received: u64,
}

/// How a metadata slot (0 = initial, 1 = trailing) got its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PublishedMetadata {
    NotPublished,
    FromWire,
    /// Faked locally (cancellation, transport failure).
    Synthesized,
    /// Defaulted when the read half closed with nothing on the wire.
    AtClose,
}

/// The transport's intrusive lists. A stream is on each list at most
/// once, tracked by a membership flag checked at every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamList {
    /// Streams with pending frames for the next write.
    Writable = 0,
    /// Client streams waiting for an id under MAX_CONCURRENT_STREAMS.
    WaitingForConcurrency = 1,
    /// Streams with data blocked on the connection window.
    StalledByTransport = 2,
    /// Streams with data blocked on their own window.
    StalledByStream = 3,
}

pub(crate) const STREAM_LIST_COUNT: usize = 4;

/// A callback armed to fire when the stream's outbound byte counter
/// passes `call_at_byte`.
pub(crate) struct WriteCallback {
    pub call_at_byte: i64,
    pub barrier: CallbackBarrier,
}

pub(crate) struct Stream {
    pub(crate) key: StreamKey,
    /// Wire stream id; 0 until admitted.
    pub(crate) id: u32,
    /// Call deadline, from `grpc-timeout`; cancellations past it report
    /// DEADLINE_EXCEEDED rather than CANCELLED.
    pub(crate) deadline: Option<Instant>,

    // Send side.
    pub(crate) initial_metadata_to_send: Option<Metadata>,
    pub(crate) sent_initial_metadata: bool,
    pub(crate) trailing_metadata_to_send: Option<Metadata>,
    pub(crate) sent_trailing_metadata: bool,
    /// Outbound DATA bytes (message framing already applied).
    pub(crate) flow_controlled_buffer: BytesMut,
    /// Stream-lifetime count of flow-controlled bytes written.
    pub(crate) flow_controlled_bytes_written: i64,
    pub(crate) write_buffering: bool,
    pub(crate) send_initial_metadata_finished: Option<CallbackBarrier>,
    pub(crate) send_trailing_metadata_finished: Option<CallbackBarrier>,
    /// Fire when bytes are confirmed written to the wire.
    pub(crate) on_write_finished_cbs: Vec<WriteCallback>,
    /// Fire when bytes are admitted into transport flow control.
    pub(crate) on_flow_controlled_cbs: Vec<WriteCallback>,

    // Receive side.
    pub(crate) frame_storage: BytesMut,
    pub(crate) initial_metadata_buffer: Metadata,
    pub(crate) trailing_metadata_buffer: Metadata,
    pub(crate) published: [PublishedMetadata; 2],
    pub(crate) header_frames_received: u32,
    pub(crate) parsed_trailers_only: bool,
    pub(crate) recv_initial_metadata_ready: Option<InitialMetadataReady>,
    pub(crate) recv_message_ready: Option<MessageReady>,
    pub(crate) recv_trailing_metadata_ready: Option<TrailersReady>,
    pub(crate) final_metadata_requested: bool,

    // Lifecycle.
    pub(crate) read_closed: bool,
    pub(crate) read_closed_error: Option<TransportError>,
    pub(crate) write_closed: bool,
    pub(crate) write_closed_error: Option<TransportError>,
    pub(crate) seen_error: bool,
    pub(crate) eos_sent: bool,
    pub(crate) eos_received: bool,

    pub(crate) flow_control: StreamFlowControl,
    pub(crate) included: [bool; STREAM_LIST_COUNT],
    pub(crate) stats: StreamStats,
}

impl Stream {
    pub fn new(key: StreamKey) -> Self {
        Self {
            key,
            id: 0,
            deadline: None,
            initial_metadata_to_send: None,
            sent_initial_metadata: false,
            trailing_metadata_to_send: None,
            sent_trailing_metadata: false,
            flow_controlled_buffer: BytesMut::new(),
            flow_controlled_bytes_written: 0,
            write_buffering: false,
            send_initial_metadata_finished: None,
            send_trailing_metadata_finished: None,
            on_write_finished_cbs: Vec::new(),
            on_flow_controlled_cbs: Vec::new(),
            frame_storage: BytesMut::new(),
            initial_metadata_buffer: Metadata::new(),
            trailing_metadata_buffer: Metadata::new(),
            published: [PublishedMetadata::NotPublished; 2],
            header_frames_received: 0,
            parsed_trailers_only: false,
            recv_initial_metadata_ready: None,
            recv_message_ready: None,
            recv_trailing_metadata_ready: None,
            final_metadata_requested: false,
            read_closed: false,
            read_closed_error: None,
            write_closed: false,
            write_closed_error: None,
            seen_error: false,
            eos_sent: false,
            eos_received: false,
            flow_control: StreamFlowControl::new(),
            included: [false; STREAM_LIST_COUNT],
            stats: StreamStats::default(),
        }
    }

    pub fn fully_closed(&self) -> bool {
        self.read_closed && self.write_closed
    }
}

impl TransportState {
    /// Add a stream to a list; no-op (false) when already a member.
    pub(crate) fn list_add(&mut self, key: StreamKey, list: StreamList) -> bool {
        let Some(stream) = self.streams.get_mut(&key) else {
            return false;
        };
        let slot = list as usize;
        if stream.included[slot] {
            return false;
        }
        stream.included[slot] = true;
        self.lists[slot].push_back(key);
        true
    }

    /// Pop the oldest member of a list.
    pub(crate) fn list_pop(&mut self, list: StreamList) -> Option<StreamKey> {
        let slot = list as usize;
        while let Some(key) = self.lists[slot].pop_front() {
            if let Some(stream) = self.streams.get_mut(&key) {
                debug_assert!(stream.included[slot], "list membership out of sync");
                stream.included[slot] = false;
                return Some(key);
            }
        }
        None
    }

    /// Remove a stream from a list; false when it was not a member.
    pub(crate) fn list_remove(&mut self, key: StreamKey, list: StreamList) -> bool {
        let slot = list as usize;
        let Some(stream) = self.streams.get_mut(&key) else {
            return false;
        };
        if !stream.included[slot] {
            return false;
        }
        stream.included[slot] = false;
        self.lists[slot].retain(|&entry| entry != key);
        true
    }

    pub(crate) fn list_contains(&self, key: StreamKey, list: StreamList) -> bool {
        self.streams
            .get(&key)
            .is_some_and(|stream| stream.included[list as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::bare_state;

    #[test]
    fn test_list_membership_is_unique() {
        let mut state = bare_state(true);
        let key = state.insert_stream_for_test();
        assert!(state.list_add(key, StreamList::Writable));
        assert!(!state.list_add(key, StreamList::Writable));
        assert!(state.list_contains(key, StreamList::Writable));
        assert_eq!(state.list_pop(StreamList::Writable), Some(key));
        assert!(!state.list_contains(key, StreamList::Writable));
        assert_eq!(state.list_pop(StreamList::Writable), None);
    }

    #[test]
    fn test_list_fifo_order() {
        let mut state = bare_state(true);
        let a = state.insert_stream_for_test();
        let b = state.insert_stream_for_test();
        let c = state.insert_stream_for_test();
        state.list_add(b, StreamList::Writable);
        state.list_add(a, StreamList::Writable);
        state.list_add(c, StreamList::Writable);
        assert_eq!(state.list_pop(StreamList::Writable), Some(b));
        assert_eq!(state.list_pop(StreamList::Writable), Some(a));
        assert_eq!(state.list_pop(StreamList::Writable), Some(c));
    }

    #[test]
    fn test_list_remove() {
        let mut state = bare_state(true);
        let a = state.insert_stream_for_test();
        let b = state.insert_stream_for_test();
        state.list_add(a, StreamList::StalledByTransport);
        state.list_add(b, StreamList::StalledByTransport);
        assert!(state.list_remove(a, StreamList::StalledByTransport));
        assert!(!state.list_remove(a, StreamList::StalledByTransport));
        assert_eq!(state.list_pop(StreamList::StalledByTransport), Some(b));
    }

    #[test]
    fn test_lists_are_independent() {
        let mut state = bare_state(true);
        let key = state.insert_stream_for_test();
        state.list_add(key, StreamList::Writable);
        state.list_add(key, StreamList::StalledByStream);
        assert!(state.list_contains(key, StreamList::Writable));
        assert!(state.list_contains(key, StreamList::StalledByStream));
        state.list_remove(key, StreamList::Writable);
        assert!(state.list_contains(key, StreamList::StalledByStream));
    }

    #[test]
    fn test_new_stream_defaults() {
        let stream = Stream::new(7);
        assert_eq!(stream.id, 0);
        assert!(!stream.fully_closed());
        assert_eq!(stream.published[0], PublishedMetadata::NotPublished);
        assert_eq!(stream.published[1], PublishedMetadata::NotPublished);
        assert!(!stream.seen_error);
    }
}
