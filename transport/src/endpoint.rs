//! The byte endpoint the transport reads from and writes to.
//!
//! The endpoint is completion-based: `read` and `write` return
//! immediately and invoke their callbacks when bytes are available or
//! flushed. TLS, connection establishment, and socket ownership all live
//! below this trait.

use bytes::Bytes;

use crate::error::TransportError;

/// Hints attached to a read request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadArgs {
    /// The caller wants the bytes as soon as possible (e.g. a GOAWAY has
    /// been seen and draining quickly matters).
    pub urgent: bool,
    /// Number of bytes the caller needs before it can make progress; the
    /// endpoint may hold off completing the read until it has that many.
    pub min_progress: usize,
}

pub type ReadDone = Box<dyn FnOnce(Result<Vec<Bytes>, TransportError>) + Send + 'static>;
pub type WriteDone = Box<dyn FnOnce(Result<(), TransportError>) + Send + 'static>;

/// An ordered, reliable byte pipe to the peer.
pub trait Endpoint: Send + Sync {
    /// Request bytes. The callback receives one or more slices in order,
    /// or the error that ended the connection.
    fn read(&self, args: ReadArgs, on_complete: ReadDone);

    /// Write the given slices. `max_frame_size` is a hint for endpoints
    /// that segment writes (0 means no preference). The callback fires
    /// once the bytes are handed to the kernel or the write fails; a
    /// failed write reports the whole buffer as unsent.
    fn write(&self, data: Vec<Bytes>, max_frame_size: usize, on_complete: WriteDone);

    /// Peer address in display form.
    fn peer_addr(&self) -> String;

    /// Local address in display form.
    fn local_addr(&self) -> String;
}
