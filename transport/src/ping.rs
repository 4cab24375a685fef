//! Ping bookkeeping and policy: the in-flight callback table, inbound
//! abuse protection, outbound rate limiting, and the keepalive state
//! machine's states.

use std::time::{Duration, Instant};

use ahash::AHashMap;
use rand::RngCore;

use crate::error::TransportError;
use crate::status::Code;

pub(crate) type PingDone = Box<dyn FnOnce(Result<(), TransportError>) + Send + 'static>;

/// Keepalive machinery states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepaliveState {
    /// No keepalive interval configured.
    Disabled,
    /// Timer armed, waiting to ping.
    Waiting,
    /// Keepalive ping in flight, watchdog armed.
    Pinging,
    /// Transport is shutting down.
    Dying,
}

/// Callbacks for pings requested but not yet written, plus the table of
/// pings on the wire awaiting acks. Ids are random so ack matching is a
/// real lookup rather than a counter comparison.
#[derive(Default)]
pub(crate) struct PingCallbacks {
    ping_requested: bool,
    next_on_start: Vec<PingDone>,
    next_on_ack: Vec<PingDone>,
    inflight: AHashMap<u64, Vec<PingDone>>,
    most_recent_inflight: Option<u64>,
}

impl PingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a ping with optional callbacks for the moments it hits
    /// the wire and its ack arrives.
    pub fn on_ping(&mut self, on_start: Option<PingDone>, on_ack: Option<PingDone>) {
        self.ping_requested = true;
        self.next_on_start.extend(on_start);
        self.next_on_ack.extend(on_ack);
    }

    /// Wait for an ack: piggybacks on the most recent in-flight ping if
    /// one exists, otherwise requests a fresh ping.
    pub fn on_ping_ack(&mut self, on_ack: PingDone) {
        if let Some(id) = self.most_recent_inflight {
            self.inflight
                .get_mut(&id)
                .expect("most recent inflight tracked")
                .push(on_ack);
            return;
        }
        self.on_ping(None, on_ack.into());
    }

    /// Ask for a ping frame with no completion interest.
    pub fn request_ping(&mut self) {
        self.ping_requested = true;
    }

    pub fn ping_requested(&self) -> bool {
        self.ping_requested
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Move the staged request into the in-flight table; returns the new
    /// ping's id and the callbacks to fire now that it is on the wire.
    pub fn start_ping(&mut self, rng: &mut impl RngCore) -> (u64, Vec<PingDone>) {
        self.ping_requested = false;
        let mut id = rng.next_u64();
        while self.inflight.contains_key(&id) {
            id = rng.next_u64();
        }
        let on_ack = std::mem::take(&mut self.next_on_ack);
        self.inflight.insert(id, on_ack);
        self.most_recent_inflight = Some(id);
        (id, std::mem::take(&mut self.next_on_start))
    }

    /// Resolve an ack. `None` means the id was unknown.
    pub fn ack_ping(&mut self, id: u64) -> Option<Vec<PingDone>> {
        let callbacks = self.inflight.remove(&id)?;
        if self.most_recent_inflight == Some(id) {
            self.most_recent_inflight = None;
        }
        Some(callbacks)
    }

    /// Cancel everything; returns the callbacks to fail.
    pub fn cancel_all(&mut self) -> Vec<PingDone> {
        self.ping_requested = false;
        self.most_recent_inflight = None;
        let mut callbacks = std::mem::take(&mut self.next_on_start);
        callbacks.extend(std::mem::take(&mut self.next_on_ack));
        for (_, acks) in self.inflight.drain() {
            callbacks.extend(acks);
        }
        callbacks
    }
}

/// The error pings fail with on cancellation.
pub(crate) fn ping_cancelled(source: &TransportError) -> TransportError {
    TransportError::referencing("ping cancelled", source).with_status(Code::Cancelled)
}

/// Server-side protection against ping floods.
pub(crate) struct PingAbusePolicy {
    max_ping_strikes: u32,
    min_recv_ping_interval_without_data: Duration,
    ping_strikes: u32,
    last_ping_recv_time: Option<Instant>,
}

impl PingAbusePolicy {
    /// `max_ping_strikes` of zero disables the budget entirely.
    pub fn new(max_ping_strikes: u32, min_recv_ping_interval_without_data: Duration) -> Self {
        Self {
            max_ping_strikes,
            min_recv_ping_interval_without_data,
            ping_strikes: 0,
            last_ping_recv_time: None,
        }
    }

    /// Record an inbound ping. Returns true when the strike budget is
    /// exhausted and the peer must be disconnected.
    pub fn received_one_ping(&mut self, now: Instant, transport_idle: bool) -> bool {
        let mut min_interval = self.min_recv_ping_interval_without_data;
        if transport_idle {
            // No streams: the peer has even less reason to ping fast.
            min_interval *= 2;
        }
        let too_soon = match self.last_ping_recv_time {
            Some(last) => now.saturating_duration_since(last) < min_interval,
            None => false,
        };
        self.last_ping_recv_time = Some(now);
        if !too_soon {
            return false;
        }
        self.ping_strikes += 1;
        self.max_ping_strikes != 0 && self.ping_strikes > self.max_ping_strikes
    }

    /// Data flowed; the peer's pings are paying their way again.
    pub fn reset_ping_strikes(&mut self) {
        self.ping_strikes = 0;
        self.last_ping_recv_time = None;
    }
}

/// Outcome of asking the rate policy for permission to send a ping.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PingRateDecision {
    Granted,
    /// The pings-before-data budget is spent; sending data re-arms it.
    TooManyRecentPings,
    /// Sending now would be too soon after the last ping; retry after
    /// the given delay.
    TooSoon(Duration),
}

/// Outbound ping rate limiting.
pub(crate) struct PingRatePolicy {
    max_pings_without_data: u32,
    pings_before_data_required: u32,
    last_ping_sent_time: Option<Instant>,
}

impl PingRatePolicy {
    pub fn new(is_client: bool) -> Self {
        // Servers answer pings; they have no reason to be throttled
        // sending their own.
        let max = if is_client { 2 } else { 0 };
        Self {
            max_pings_without_data: max,
            pings_before_data_required: max,
            last_ping_sent_time: None,
        }
    }

    pub fn request_send_ping(
        &mut self,
        now: Instant,
        next_allowed_ping_interval: Duration,
    ) -> PingRateDecision {
        if self.max_pings_without_data != 0 && self.pings_before_data_required == 0 {
            return PingRateDecision::TooManyRecentPings;
        }
        if let Some(last) = self.last_ping_sent_time {
            let since = now.saturating_duration_since(last);
            if since < next_allowed_ping_interval {
                return PingRateDecision::TooSoon(next_allowed_ping_interval - since);
            }
        }
        PingRateDecision::Granted
    }

    pub fn sent_ping(&mut self, now: Instant) {
        self.last_ping_sent_time = Some(now);
        if self.pings_before_data_required > 0 {
            self.pings_before_data_required -= 1;
        }
    }

    /// Data went out; pings are allowed again.
    pub fn reset_pings_before_data_required(&mut self) {
        self.pings_before_data_required = self.max_pings_without_data;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rng() -> Xoshiro256PlusPlus {
        Xoshiro256PlusPlus::seed_from_u64(42)
    }

    fn counter_cb(counter: &Arc<AtomicUsize>) -> PingDone {
        let counter = Arc::clone(counter);
        Box::new(move |result| {
            if result.is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[test]
    fn test_ping_lifecycle() {
        let mut pings = PingCallbacks::new();
        let started = Arc::new(AtomicUsize::new(0));
        let acked = Arc::new(AtomicUsize::new(0));
        assert!(!pings.ping_requested());

        pings.on_ping(Some(counter_cb(&started)), Some(counter_cb(&acked)));
        assert!(pings.ping_requested());

        let (id, on_start) = pings.start_ping(&mut rng());
        for cb in on_start {
            cb(Ok(()));
        }
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(pings.inflight_count(), 1);
        assert!(!pings.ping_requested());

        for cb in pings.ack_ping(id).expect("known id") {
            cb(Ok(()));
        }
        assert_eq!(acked.load(Ordering::SeqCst), 1);
        assert_eq!(pings.inflight_count(), 0);
    }

    #[test]
    fn test_unknown_ack_rejected() {
        let mut pings = PingCallbacks::new();
        assert!(pings.ack_ping(0xdead_beef).is_none());
    }

    #[test]
    fn test_ping_ids_unique_despite_rng_collisions() {
        // An RNG that keeps repeating a value must not produce two
        // outstanding pings with the same id.
        struct StutterRng {
            repeats: u32,
            next: u64,
        }
        impl RngCore for StutterRng {
            fn next_u32(&mut self) -> u32 {
                self.next_u64() as u32
            }
            fn next_u64(&mut self) -> u64 {
                if self.repeats > 0 {
                    self.repeats -= 1;
                    7
                } else {
                    self.next += 1;
                    self.next
                }
            }
            fn fill_bytes(&mut self, dest: &mut [u8]) {
                for byte in dest {
                    *byte = self.next_u64() as u8;
                }
            }
        }

        let mut rng = StutterRng {
            repeats: 5,
            next: 100,
        };
        let mut pings = PingCallbacks::new();
        pings.request_ping();
        let (first, _) = pings.start_ping(&mut rng);
        pings.request_ping();
        let (second, _) = pings.start_ping(&mut rng);
        assert_ne!(first, second);
        assert_eq!(pings.inflight_count(), 2);
    }

    #[test]
    fn test_on_ping_ack_piggybacks_on_inflight() {
        let mut pings = PingCallbacks::new();
        let acked = Arc::new(AtomicUsize::new(0));
        pings.request_ping();
        let (id, _) = pings.start_ping(&mut rng());
        // Attaches to the in-flight ping instead of requesting another.
        pings.on_ping_ack(counter_cb(&acked));
        assert!(!pings.ping_requested());
        for cb in pings.ack_ping(id).unwrap() {
            cb(Ok(()));
        }
        assert_eq!(acked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_ping_ack_without_inflight_requests_ping() {
        let mut pings = PingCallbacks::new();
        let acked = Arc::new(AtomicUsize::new(0));
        pings.on_ping_ack(counter_cb(&acked));
        assert!(pings.ping_requested());
    }

    #[test]
    fn test_cancel_all_fails_callbacks() {
        let mut pings = PingCallbacks::new();
        let failed = Arc::new(AtomicUsize::new(0));
        let failed2 = Arc::clone(&failed);
        pings.on_ping(
            None,
            Some(Box::new(move |result| {
                assert_eq!(result.unwrap_err().code(), Code::Cancelled);
                failed2.fetch_add(1, Ordering::SeqCst);
            })),
        );
        pings.request_ping();
        let (_, _) = pings.start_ping(&mut rng());
        let source = TransportError::new("closing").with_status(Code::Unavailable);
        for cb in pings.cancel_all() {
            cb(Err(ping_cancelled(&source)));
        }
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert!(!pings.ping_requested());
        assert_eq!(pings.inflight_count(), 0);
    }

    #[test]
    fn test_abuse_policy_strikes() {
        let mut policy = PingAbusePolicy::new(2, Duration::from_secs(300));
        let t0 = Instant::now();
        // First ping is free.
        assert!(!policy.received_one_ping(t0, false));
        // Rapid pings accumulate strikes; the third rapid one exceeds
        // the budget of 2.
        assert!(!policy.received_one_ping(t0 + Duration::from_millis(1), false));
        assert!(!policy.received_one_ping(t0 + Duration::from_millis(2), false));
        assert!(policy.received_one_ping(t0 + Duration::from_millis(3), false));
    }

    #[test]
    fn test_abuse_policy_reset_on_data() {
        let mut policy = PingAbusePolicy::new(2, Duration::from_secs(300));
        let t0 = Instant::now();
        assert!(!policy.received_one_ping(t0, false));
        assert!(!policy.received_one_ping(t0 + Duration::from_millis(1), false));
        policy.reset_ping_strikes();
        assert!(!policy.received_one_ping(t0 + Duration::from_millis(2), false));
        assert!(!policy.received_one_ping(t0 + Duration::from_millis(3), false));
    }

    #[test]
    fn test_abuse_policy_spaced_pings_ok() {
        let mut policy = PingAbusePolicy::new(2, Duration::from_secs(300));
        let mut now = Instant::now();
        for _ in 0..10 {
            assert!(!policy.received_one_ping(now, false));
            now += Duration::from_secs(301);
        }
    }

    #[test]
    fn test_rate_policy_client_budget() {
        let mut policy = PingRatePolicy::new(true);
        let now = Instant::now();
        assert_eq!(
            policy.request_send_ping(now, Duration::ZERO),
            PingRateDecision::Granted
        );
        policy.sent_ping(now);
        policy.sent_ping(now);
        assert_eq!(
            policy.request_send_ping(now, Duration::ZERO),
            PingRateDecision::TooManyRecentPings
        );
        policy.reset_pings_before_data_required();
        assert_eq!(
            policy.request_send_ping(now, Duration::ZERO),
            PingRateDecision::Granted
        );
    }

    #[test]
    fn test_rate_policy_too_soon() {
        let mut policy = PingRatePolicy::new(true);
        let now = Instant::now();
        policy.sent_ping(now);
        match policy.request_send_ping(now + Duration::from_secs(1), Duration::from_secs(10)) {
            PingRateDecision::TooSoon(wait) => assert_eq!(wait, Duration::from_secs(9)),
            other => panic!("expected TooSoon, got {:?}", other),
        }
    }

    #[test]
    fn test_rate_policy_server_unthrottled() {
        let mut policy = PingRatePolicy::new(false);
        let now = Instant::now();
        for _ in 0..50 {
            assert_eq!(
                policy.request_send_ping(now, Duration::ZERO),
                PingRateDecision::Granted
            );
            policy.sent_ping(now);
        }
    }
}
