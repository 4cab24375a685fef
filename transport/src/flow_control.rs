//! Transport and per-stream flow control, and the BDP estimator that
//! sizes receive windows from measured bandwidth-delay product.
//!
//! Accounting model: the transport tracks one pair of windows (what we
//! may send, what we have granted the peer); each stream tracks deltas
//! relative to the negotiated initial window, so a SETTINGS change
//! shifts every stream without touching them individually. Receive-side
//! bookkeeping funnels through `IncomingUpdateContext`, which turns
//! pending-buffer size and reader demand into a `FlowControlAction`.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::trace;

use http2::MAX_WINDOW;

/// Connection-level window the transport tries to keep granted.
pub(crate) const CONNECTION_WINDOW_TARGET: i64 = 1 << 20;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowControlError {
    #[error("peer sent {sent} bytes into a window of {window}")]
    RecvWindowExceeded { sent: u32, window: i64 },
    #[error("window update overflows the flow control window")]
    WindowOverflow,
}

/// How urgently one channel of a `FlowControlAction` must act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Urgency {
    #[default]
    NoAction,
    /// Apply the change; it rides the next write that happens anyway.
    QueueUpdate,
    /// Apply the change and initiate a write for it.
    UpdateImmediately,
}

/// What flow control wants the transport to do next.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowControlAction {
    pub send_stream_update: Urgency,
    pub send_transport_update: Urgency,
    pub send_initial_window_update: Urgency,
    pub initial_window_size: u32,
    pub send_max_frame_size_update: Urgency,
    pub max_frame_size: u32,
    pub preferred_rx_crypto_frame_size_update: Urgency,
    pub preferred_rx_crypto_frame_size: u32,
}

/// Connection-level accounting plus the BDP pipeline.
pub(crate) struct TransportFlowControl {
    /// Credit we hold for sending to the peer.
    remote_window: i64,
    /// Credit we have granted the peer for sending to us.
    announced_window: i64,
    /// Per-stream initial window we want advertised.
    target_initial_window_size: u32,
    /// Per-stream initial window the peer has acked; baseline for every
    /// stream's receive window.
    acked_initial_window: u32,
    enable_crypto_frame_size: bool,
    bdp: Option<BdpEstimator>,
}

impl TransportFlowControl {
    pub fn new(initial_window_size: u32, bdp_probe: bool, enable_crypto_frame_size: bool) -> Self {
        Self {
            remote_window: 65_535,
            announced_window: 65_535,
            target_initial_window_size: initial_window_size,
            acked_initial_window: 65_535,
            enable_crypto_frame_size,
            bdp: bdp_probe.then(BdpEstimator::new),
        }
    }

    pub fn remote_window(&self) -> i64 {
        self.remote_window
    }

    pub fn announced_window(&self) -> i64 {
        self.announced_window
    }

    pub fn acked_initial_window(&self) -> u32 {
        self.acked_initial_window
    }

    /// Record that the peer acked a SETTINGS carrying this initial
    /// window size.
    pub fn set_acked_initial_window(&mut self, window: u32) {
        self.acked_initial_window = window;
    }

    pub fn target_initial_window_size(&self) -> u32 {
        self.target_initial_window_size
    }

    pub fn bdp(&mut self) -> Option<&mut BdpEstimator> {
        self.bdp.as_mut()
    }

    pub fn sent_data(&mut self, bytes: u32) {
        self.remote_window -= bytes as i64;
        debug_assert!(self.remote_window >= 0, "sent past the remote window");
    }

    pub fn recv_data(&mut self, bytes: u32) -> Result<(), FlowControlError> {
        if (bytes as i64) > self.announced_window {
            return Err(FlowControlError::RecvWindowExceeded {
                sent: bytes,
                window: self.announced_window,
            });
        }
        self.announced_window -= bytes as i64;
        if let Some(bdp) = self.bdp.as_mut() {
            bdp.add_incoming_bytes(bytes as u64);
        }
        Ok(())
    }

    pub fn recv_window_update(&mut self, increment: u32) -> Result<(), FlowControlError> {
        self.remote_window += increment as i64;
        if self.remote_window > MAX_WINDOW as i64 {
            return Err(FlowControlError::WindowOverflow);
        }
        Ok(())
    }

    /// Desired connection window under memory pressure.
    fn target_announced_window(&self, pressure: f64) -> i64 {
        let base = CONNECTION_WINDOW_TARGET.max(self.target_initial_window_size as i64);
        let scaled = (base as f64 * (1.0 - pressure.clamp(0.0, 1.0))) as i64;
        scaled.clamp(16_384, MAX_WINDOW as i64)
    }

    /// Produce a connection WINDOW_UPDATE increment if the granted
    /// window has fallen below half the target.
    pub fn maybe_send_update(&mut self, pressure: f64) -> Option<u32> {
        let target = self.target_announced_window(pressure);
        if self.announced_window >= target / 2 {
            return None;
        }
        let increment = (target - self.announced_window) as u32;
        self.announced_window = target;
        trace!(increment, "connection window update");
        Some(increment)
    }

    /// Re-derive window targets from the current BDP estimate.
    pub fn periodic_update(&mut self, pressure: f64) -> FlowControlAction {
        let mut action = FlowControlAction::default();
        let Some(bdp) = self.bdp.as_ref() else {
            return action;
        };
        let target = (bdp.estimate() * 2)
            .clamp(128, MAX_WINDOW as i64)
            .min(((MAX_WINDOW as f64) * (1.0 - pressure.clamp(0.0, 1.0))) as i64)
            .max(128) as u32;
        let current = self.target_initial_window_size as i64;
        let delta = target as i64 - current;
        // Ignore jitter under 5% of the current target.
        if delta.abs() * 20 > current.max(1) {
            self.target_initial_window_size = target;
            action.send_initial_window_update = Urgency::QueueUpdate;
            action.initial_window_size = target;

            let frame_size = target.clamp(16_384, 16_777_215);
            action.send_max_frame_size_update = Urgency::QueueUpdate;
            action.max_frame_size = frame_size;

            if self.enable_crypto_frame_size {
                action.preferred_rx_crypto_frame_size_update = Urgency::QueueUpdate;
                action.preferred_rx_crypto_frame_size =
                    (target as u64 * 2).clamp(16_384, u32::MAX as u64) as u32;
            }
        }
        action
    }
}

/// Per-stream deltas against the negotiated initial windows.
#[derive(Debug, Default)]
pub(crate) struct StreamFlowControl {
    /// Send credit relative to the peer's initial window size.
    remote_window_delta: i64,
    /// Receive credit granted relative to our acked initial window.
    announced_window_delta: i64,
    /// Bytes the reader needs before it can make progress.
    min_progress_size: i64,
    /// Bytes buffered and not yet consumed by the reader.
    pending_size: i64,
}

impl StreamFlowControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_window(&self, peer_initial_window: u32) -> i64 {
        peer_initial_window as i64 + self.remote_window_delta
    }

    pub fn announced_window(&self, acked_initial_window: u32) -> i64 {
        acked_initial_window as i64 + self.announced_window_delta
    }

    pub fn sent_data(&mut self, bytes: u32) {
        self.remote_window_delta -= bytes as i64;
    }

    pub fn recv_window_update(
        &mut self,
        peer_initial_window: u32,
        increment: u32,
    ) -> Result<(), FlowControlError> {
        self.remote_window_delta += increment as i64;
        if self.send_window(peer_initial_window) > MAX_WINDOW as i64 {
            return Err(FlowControlError::WindowOverflow);
        }
        Ok(())
    }

    pub fn recv_data(
        &mut self,
        acked_initial_window: u32,
        bytes: u32,
    ) -> Result<(), FlowControlError> {
        let window = self.announced_window(acked_initial_window);
        if (bytes as i64) > window {
            return Err(FlowControlError::RecvWindowExceeded {
                sent: bytes,
                window,
            });
        }
        self.announced_window_delta -= bytes as i64;
        Ok(())
    }

    fn desired_announced_window(&self, acked_initial_window: u32) -> i64 {
        let demand = (acked_initial_window as i64).max(self.min_progress_size);
        (demand - self.pending_size).clamp(0, MAX_WINDOW as i64)
    }

    /// Produce a stream WINDOW_UPDATE increment if the reader's demand
    /// warrants one.
    pub fn maybe_send_update(&mut self, acked_initial_window: u32) -> Option<u32> {
        let current = self.announced_window(acked_initial_window);
        let target = self.desired_announced_window(acked_initial_window);
        if current >= target / 2 && current >= self.min_progress_size {
            return None;
        }
        let increment = target - current;
        if increment <= 0 {
            return None;
        }
        self.announced_window_delta += increment;
        Some(increment as u32)
    }

    pub fn incoming_update(&mut self) -> IncomingUpdateContext<'_> {
        IncomingUpdateContext { fc: self }
    }
}

/// Bookkeeping scope for one pass over a stream's receive path.
pub(crate) struct IncomingUpdateContext<'a> {
    fc: &'a mut StreamFlowControl,
}

impl IncomingUpdateContext<'_> {
    pub fn set_min_progress_size(&mut self, bytes: usize) {
        self.fc.min_progress_size = bytes as i64;
    }

    pub fn set_pending_size(&mut self, bytes: usize) {
        self.fc.pending_size = bytes as i64;
    }

    /// Resolve into an action: immediate when the reader is blocked on
    /// more bytes than the peer may send, queued when the window merely
    /// runs low.
    pub fn finish(self, acked_initial_window: u32, tfc: &TransportFlowControl) -> FlowControlAction {
        let mut action = FlowControlAction::default();
        let announced = self.fc.announced_window(acked_initial_window);
        if self.fc.min_progress_size > 0 && announced < self.fc.min_progress_size {
            action.send_stream_update = Urgency::UpdateImmediately;
        } else if announced < self.fc.desired_announced_window(acked_initial_window) / 2 {
            action.send_stream_update = Urgency::QueueUpdate;
        }
        let transport_target = tfc.target_announced_window(0.0);
        if tfc.announced_window < transport_target / 4 {
            action.send_transport_update = Urgency::UpdateImmediately;
        } else if tfc.announced_window < transport_target / 2 {
            action.send_transport_update = Urgency::QueueUpdate;
        }
        action
    }
}

/// Bandwidth-delay product estimator clocked by timed pings.
///
/// Bytes received between a ping's send and its ack approximate the
/// pipe's capacity; the estimate doubles whenever an interval carries
/// more than two-thirds of the current estimate at a higher bandwidth.
pub(crate) struct BdpEstimator {
    accumulator: u64,
    estimate: i64,
    bw_est: f64,
    ping_start: Option<Instant>,
    inter_ping_delay: Duration,
    stable_estimate_count: u32,
}

impl BdpEstimator {
    pub fn new() -> Self {
        Self {
            accumulator: 0,
            estimate: 65_536,
            bw_est: 0.0,
            ping_start: None,
            inter_ping_delay: Duration::from_millis(100),
            stable_estimate_count: 0,
        }
    }

    pub fn estimate(&self) -> i64 {
        self.estimate
    }

    pub fn accumulator(&self) -> u64 {
        self.accumulator
    }

    pub fn add_incoming_bytes(&mut self, bytes: u64) {
        self.accumulator += bytes;
    }

    /// Mark the ping as on the wire; bytes from here to the ack count.
    pub fn start_ping(&mut self, now: Instant) {
        self.ping_start = Some(now);
        self.accumulator = 0;
    }

    /// Record the ack. Returns the delay until the next probe.
    pub fn complete_ping(&mut self, now: Instant) -> Duration {
        let Some(started) = self.ping_start.take() else {
            return self.inter_ping_delay;
        };
        let elapsed = now.saturating_duration_since(started).as_secs_f64();
        let bandwidth = if elapsed > 0.0 {
            self.accumulator as f64 / elapsed
        } else {
            0.0
        };
        let mut changed = false;
        if self.accumulator as i64 * 3 > self.estimate * 2 && bandwidth > self.bw_est {
            self.bw_est = bandwidth;
            self.estimate = (self.accumulator as i64).max(self.estimate) * 2;
            changed = true;
        }
        self.accumulator = 0;
        if changed {
            self.inter_ping_delay = Duration::from_millis(100);
            self.stable_estimate_count = 0;
        } else {
            self.stable_estimate_count = self.stable_estimate_count.saturating_add(1);
            if self.stable_estimate_count >= 2 {
                self.inter_ping_delay = (self.inter_ping_delay * 2).min(Duration::from_secs(10));
            }
        }
        self.inter_ping_delay
    }
}
