//! The operation surface between the call layer and the transport:
//! stream op batches, transport ops, and the completion barrier that
//! collapses a batch's send ops into one `on_complete`.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::connectivity::ConnectivityWatcher;
use crate::error::TransportError;
use crate::message::ReceivedMessage;
use crate::metadata::Metadata;
use crate::stream::StreamStats;

/// Flags on a send_message op.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags(u32);

impl SendFlags {
    /// The payload is compressed; sets the message framing flag byte.
    pub const COMPRESSED: SendFlags = SendFlags(0x1);
    /// Completion may be delayed to coalesce small writes; the
    /// completion signal fires early, while bytes may still be buffered.
    pub const BUFFER_HINT: SendFlags = SendFlags(0x2);
    /// Completion means "on the wire", not "admitted to flow control".
    pub const WRITE_THROUGH: SendFlags = SendFlags(0x4);

    pub fn contains(self, flag: SendFlags) -> bool {
        self.0 & flag.0 == flag.0
    }
}

impl std::ops::BitOr for SendFlags {
    type Output = SendFlags;
    fn bitor(self, rhs: SendFlags) -> SendFlags {
        SendFlags(self.0 | rhs.0)
    }
}

/// A message to send: payload slices plus flags.
#[derive(Debug, Clone)]
pub struct SendMessage {
    pub slices: Vec<Bytes>,
    pub flags: SendFlags,
}

impl SendMessage {
    pub fn new(payload: Bytes) -> Self {
        Self {
            slices: vec![payload],
            flags: SendFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: SendFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn len(&self) -> usize {
        self.slices.iter().map(|slice| slice.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type OpDone = Box<dyn FnOnce(Result<(), TransportError>) + Send + 'static>;
pub type InitialMetadataReady = Box<dyn FnOnce(Metadata) + Send + 'static>;
pub type MessageReady = Box<dyn FnOnce(Option<ReceivedMessage>) + Send + 'static>;
pub type TrailersReady = Box<dyn FnOnce(Metadata, StreamStats) + Send + 'static>;

/// A batch of stream operations, processed atomically under the control
/// plane in a fixed order: cancel, sends, then receives.
#[derive(Default)]
pub struct StreamOpBatch {
    pub(crate) cancel: Option<TransportError>,
    pub(crate) cancel_tarpit: bool,
    pub(crate) send_initial_metadata: Option<Metadata>,
    pub(crate) send_message: Option<SendMessage>,
    pub(crate) send_trailing_metadata: Option<Metadata>,
    pub(crate) recv_initial_metadata: Option<InitialMetadataReady>,
    pub(crate) recv_message: Option<MessageReady>,
    pub(crate) recv_trailing_metadata: Option<TrailersReady>,
    pub(crate) on_complete: Option<OpDone>,
}

impl StreamOpBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort the stream with the given error.
    pub fn cancel_stream(mut self, error: TransportError) -> Self {
        self.cancel = Some(error);
        self
    }

    /// Abort the stream, delaying the wire-visible reset to slow an
    /// abusive peer (server only; requires tarpit enabled).
    pub fn cancel_stream_tarpit(mut self, error: TransportError) -> Self {
        self.cancel = Some(error);
        self.cancel_tarpit = true;
        self
    }

    pub fn send_initial_metadata(mut self, metadata: Metadata) -> Self {
        self.send_initial_metadata = Some(metadata);
        self
    }

    pub fn send_message(mut self, message: SendMessage) -> Self {
        self.send_message = Some(message);
        self
    }

    pub fn send_trailing_metadata(mut self, metadata: Metadata) -> Self {
        self.send_trailing_metadata = Some(metadata);
        self
    }

    pub fn recv_initial_metadata(mut self, on_ready: InitialMetadataReady) -> Self {
        self.recv_initial_metadata = Some(on_ready);
        self
    }

    pub fn recv_message(mut self, on_ready: MessageReady) -> Self {
        self.recv_message = Some(on_ready);
        self
    }

    pub fn recv_trailing_metadata(mut self, on_ready: TrailersReady) -> Self {
        self.recv_trailing_metadata = Some(on_ready);
        self
    }

    pub fn on_complete(mut self, on_complete: OpDone) -> Self {
        self.on_complete = Some(on_complete);
        self
    }

    pub(crate) fn has_send_ops(&self) -> bool {
        self.send_initial_metadata.is_some()
            || self.send_message.is_some()
            || self.send_trailing_metadata.is_some()
    }
}

/// Transport-level operations.
pub type AcceptStreamFn = Box<dyn FnMut(crate::stream::StreamHandle) + Send + 'static>;

#[derive(Default)]
pub struct TransportOp {
    pub(crate) goaway: Option<TransportError>,
    pub(crate) disconnect: Option<TransportError>,
    pub(crate) set_accept_stream: Option<AcceptStreamFn>,
    pub(crate) ping_on_initiate: Option<OpDone>,
    pub(crate) ping_on_ack: Option<OpDone>,
    pub(crate) start_connectivity_watch: Option<(u64, ConnectivityWatcher)>,
    pub(crate) stop_connectivity_watch: Option<u64>,
    pub(crate) on_consumed: Option<OpDone>,
}

impl TransportOp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the transport to announce graceful shutdown to its peer.
    pub fn goaway(mut self, error: TransportError) -> Self {
        self.goaway = Some(error);
        self
    }

    /// Tear the transport down now.
    pub fn disconnect(mut self, error: TransportError) -> Self {
        self.disconnect = Some(error);
        self
    }

    /// Install the callback invoked for each peer-initiated stream.
    pub fn set_accept_stream(mut self, accept: AcceptStreamFn) -> Self {
        self.set_accept_stream = Some(accept);
        self
    }

    /// Request an application-level ping.
    pub fn send_ping(mut self, on_initiate: Option<OpDone>, on_ack: Option<OpDone>) -> Self {
        self.ping_on_initiate = on_initiate;
        self.ping_on_ack = on_ack;
        self
    }

    pub fn start_connectivity_watch(mut self, id: u64, watcher: ConnectivityWatcher) -> Self {
        self.start_connectivity_watch = Some((id, watcher));
        self
    }

    pub fn stop_connectivity_watch(mut self, id: u64) -> Self {
        self.stop_connectivity_watch = Some(id);
        self
    }

    pub fn on_consumed(mut self, on_consumed: OpDone) -> Self {
        self.on_consumed = Some(on_consumed);
        self
    }
}

/// Refcounted completion for a batch: starts with one ref for the
/// dispatch pass itself; each send op takes another and releases it when
/// its part finishes. Errors accumulate; the callback fires once, with
/// the first error if any step failed.
///
/// Whether the fire may be deferred behind an in-progress write is
/// decided at completion time by the transport (`may_cover_write`).
#[derive(Clone)]
pub(crate) struct CallbackBarrier {
    inner: Arc<Mutex<BarrierInner>>,
}

struct BarrierInner {
    refs: usize,
    error: Option<TransportError>,
    may_cover_write: bool,
    callback: Option<OpDone>,
}

impl CallbackBarrier {
    pub fn new(callback: Option<OpDone>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BarrierInner {
                refs: 1,
                error: None,
                may_cover_write: false,
                callback,
            })),
        }
    }

    /// Take a ref for one send op's completion.
    pub fn add_ref(&self) -> CallbackBarrier {
        self.inner.lock().refs += 1;
        self.clone()
    }

    pub fn set_may_cover_write(&self) {
        self.inner.lock().may_cover_write = true;
    }

    pub fn may_cover_write(&self) -> bool {
        self.inner.lock().may_cover_write
    }

    /// Release one ref, folding in `error`. Returns the armed callback
    /// when this was the last ref.
    pub fn release(&self, error: Option<TransportError>) -> Option<Box<dyn FnOnce() + Send>> {
        let mut inner = self.inner.lock();
        if let Some(error) = error {
            if inner.error.is_none() {
                inner.error = Some(error);
            }
        }
        debug_assert!(inner.refs > 0, "barrier over-released");
        inner.refs -= 1;
        if inner.refs > 0 {
            return None;
        }
        let callback = inner.callback.take()?;
        let result = match inner.error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        };
        Some(Box::new(move || callback(result)))
    }
}
