//! The error value that moves through the transport.
//!
//! One error type covers the whole taxonomy: endpoint failures, protocol
//! violations, stream aborts, and policy closures. An error carries an
//! optional RPC status (set explicitly, which matters for the cancel
//! fast path), an optional HTTP/2 error code, a human-readable message,
//! and optional annotations: the peer address, the stream's network
//! state, and a recommended keepalive interval after throttling.

use std::sync::Arc;
use std::time::Duration;

use http2::ErrorCode;

use crate::status::{Code, code_to_http2_error};

/// Where a failed stream got to on the wire, reported so retry logic can
/// tell "safe to retry" from "maybe already processed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamNetworkState {
    /// The stream was never written to the wire.
    NotSentOnWire,
    /// The stream was written, but the peer told us it never saw it.
    NotSeenByServer,
    /// The stream reached the wire and may have been processed.
    SentToWire,
}

/// Transport error with RPC and HTTP/2 facets.
#[derive(Debug, Clone)]
pub struct TransportError {
    message: String,
    status: Option<Code>,
    http2_code: Option<ErrorCode>,
    peer: Option<String>,
    network_state: Option<StreamNetworkState>,
    keepalive_throttle: Option<Duration>,
    source: Option<Arc<TransportError>>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            http2_code: None,
            peer: None,
            network_state: None,
            keepalive_throttle: None,
            source: None,
        }
    }

    /// Create an error that wraps another as its cause.
    pub fn referencing(message: impl Into<String>, source: &TransportError) -> Self {
        Self::new(message).with_source(source.clone())
    }

    pub fn with_status(mut self, status: Code) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_http2_code(mut self, code: ErrorCode) -> Self {
        self.http2_code = Some(code);
        self
    }

    pub fn with_peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = Some(peer.into());
        self
    }

    pub fn with_network_state(mut self, state: StreamNetworkState) -> Self {
        self.network_state = Some(state);
        self
    }

    pub fn with_keepalive_throttle(mut self, throttle: Duration) -> Self {
        self.keepalive_throttle = Some(throttle);
        self
    }

    pub fn with_source(mut self, source: TransportError) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// The RPC status, searching the cause chain; `Unknown` when nothing
    /// in the chain set one.
    pub fn code(&self) -> Code {
        let mut at = Some(self);
        while let Some(err) = at {
            if let Some(status) = err.status {
                return status;
            }
            at = err.source.as_deref();
        }
        Code::Unknown
    }

    /// Whether an RPC status was set explicitly anywhere in the chain.
    pub fn has_clear_status(&self) -> bool {
        let mut at = Some(self);
        while let Some(err) = at {
            if err.status.is_some() {
                return true;
            }
            at = err.source.as_deref();
        }
        false
    }

    /// The HTTP/2 error code, searching the cause chain and deriving one
    /// from the RPC status when none was set.
    pub fn http2_code(&self) -> ErrorCode {
        let mut at = Some(self);
        while let Some(err) = at {
            if let Some(code) = err.http2_code {
                return code;
            }
            at = err.source.as_deref();
        }
        code_to_http2_error(self.code())
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn network_state(&self) -> Option<StreamNetworkState> {
        let mut at = Some(self);
        while let Some(err) = at {
            if let Some(state) = err.network_state {
                return Some(state);
            }
            at = err.source.as_deref();
        }
        None
    }

    pub fn keepalive_throttle(&self) -> Option<Duration> {
        let mut at = Some(self);
        while let Some(err) = at {
            if let Some(throttle) = err.keepalive_throttle {
                return Some(throttle);
            }
            at = err.source.as_deref();
        }
        None
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(status) = self.status {
            write!(f, " [{}]", status)?;
        }
        if let Some(code) = self.http2_code {
            write!(f, " [{}]", code)?;
        }
        if let Some(peer) = &self.peer {
            write!(f, " [peer={}]", peer)?;
        }
        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|err| err.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_code_is_unknown() {
        let err = TransportError::new("boom");
        assert_eq!(err.code(), Code::Unknown);
        assert!(!err.has_clear_status());
    }

    #[test]
    fn test_explicit_status() {
        let err = TransportError::new("boom").with_status(Code::Unavailable);
        assert_eq!(err.code(), Code::Unavailable);
        assert!(err.has_clear_status());
    }

    #[test]
    fn test_status_found_through_chain() {
        let inner = TransportError::new("inner").with_status(Code::Cancelled);
        let outer = TransportError::referencing("outer", &inner);
        assert_eq!(outer.code(), Code::Cancelled);
        assert!(outer.has_clear_status());
    }

    #[test]
    fn test_http2_code_derived_from_status() {
        let err = TransportError::new("cancelled").with_status(Code::Cancelled);
        assert_eq!(err.http2_code(), ErrorCode::Cancel);
        let err = TransportError::new("calm")
            .with_status(Code::ResourceExhausted)
            .with_http2_code(ErrorCode::EnhanceYourCalm);
        assert_eq!(err.http2_code(), ErrorCode::EnhanceYourCalm);
    }

    #[test]
    fn test_annotations_searched_in_chain() {
        let inner = TransportError::new("goaway")
            .with_keepalive_throttle(Duration::from_secs(2))
            .with_network_state(StreamNetworkState::NotSeenByServer);
        let outer = TransportError::referencing("read failed", &inner);
        assert_eq!(outer.keepalive_throttle(), Some(Duration::from_secs(2)));
        assert_eq!(outer.network_state(), Some(StreamNetworkState::NotSeenByServer));
    }

    #[test]
    fn test_display_includes_chain() {
        let inner = TransportError::new("endpoint closed");
        let outer = TransportError::referencing("write failed", &inner)
            .with_status(Code::Unavailable)
            .with_peer("127.0.0.1:50051");
        let text = outer.to_string();
        assert!(text.contains("write failed"));
        assert!(text.contains("endpoint closed"));
        assert!(text.contains("UNAVAILABLE"));
        assert!(text.contains("127.0.0.1:50051"));
    }
}
