//! transport - HTTP/2 transport core for an RPC framework.
//!
//! Multiplexes many concurrent call streams over one ordered byte pipe,
//! enforcing HTTP/2 framing, flow control, ping/keepalive liveness,
//! graceful shutdown, and stream lifecycle. Client and server roles run
//! the same machinery and differ only in a handful of policy switches.
//!
//! The design is completion-based: no async runtime, no blocking. The
//! byte endpoint, the timer source, and the memory quota are injected
//! as trait objects; every state mutation runs as a task on a serial
//! executor (the combiner), so handlers may run on any thread while the
//! transport behaves as if it had one logical control thread.
//!
//! # Architecture
//!
//! - `combiner`: the serial control-plane executor
//! - `parsing`: endpoint reads, frame deframing, and dispatch
//! - `write`: the write-state machine and the frame gather pipeline
//! - `dispatch`: stream op batches and receive-completion gates
//! - `flow_control`: window accounting and BDP-based autotuning
//! - `ping`: ping callbacks, abuse/rate policy, keepalive
//! - `transport`: construction, goaway, close, reclamation

mod combiner;
mod config;
mod connectivity;
mod dispatch;
mod endpoint;
mod engine;
mod error;
mod flow_control;
mod memory;
mod message;
mod metadata;
mod op;
mod parsing;
mod ping;
mod status;
mod stream;
mod transport;
mod write;

pub use config::Config;
pub use connectivity::{ConnectivityState, ConnectivityWatcher};
pub use endpoint::{Endpoint, ReadArgs, ReadDone, WriteDone};
pub use engine::{EventEngine, Task, TaskHandle, ThreadedEngine};
pub use error::{StreamNetworkState, TransportError};
pub use flow_control::{FlowControlAction, Urgency};
pub use memory::{MemoryOwner, ReclamationPass, ReclamationSweep, Reclaimer, UnconstrainedMemory};
pub use message::{DEFAULT_MAX_MESSAGE_SIZE, MESSAGE_HEADER_SIZE, ReceivedMessage};
pub use metadata::{Metadata, MetadataError, MetadataValue};
pub use op::{
    AcceptStreamFn, InitialMetadataReady, MessageReady, OpDone, SendFlags, SendMessage,
    StreamOpBatch, TrailersReady, TransportOp,
};
pub use status::{Code, http_status_to_code, http2_error_to_code};
pub use stream::{StreamHandle, StreamStats};
pub use transport::Transport;
