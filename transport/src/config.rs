//! Transport configuration.
//!
//! Builder-style knobs covering stream ids, HPACK table sizes, buffering,
//! keepalive, flow control, tarpit, and abuse protection. `validated`
//! applies defaults and clamps; out-of-range values are brought into
//! range rather than rejected, and an id-parity mismatch is logged and
//! ignored.

use std::time::Duration;

use tracing::warn;

/// Default per-stream buffering threshold (matches the default initial
/// window).
pub const DEFAULT_WRITE_BUFFER_SIZE: u32 = 65_535;

/// Default cap on new incoming streams admitted per endpoint read.
pub const DEFAULT_MAX_REQUESTS_PER_READ: u32 = 32;

/// Pending induced frames (SETTINGS ACK, PING ACK, RST_STREAM) above
/// which reading pauses until a write drains them.
pub const DEFAULT_MAX_PENDING_INDUCED_FRAMES: u32 = 10_000;

#[derive(Debug, Clone)]
pub struct Config {
    /// First stream id to allocate; parity must match the role.
    pub initial_stream_id: Option<u32>,
    /// Cap on the HPACK table used when encoding.
    pub hpack_encoder_table_size: u32,
    /// HPACK table size advertised for the peer's encoder.
    pub hpack_decoder_table_size: u32,
    /// Per-stream buffering threshold, and per-write cap on
    /// flow-controlled bytes.
    pub write_buffer_size: u32,
    /// Keepalive ping interval; `None` disables keepalive.
    pub keepalive_time: Option<Duration>,
    /// How long to wait for a keepalive ping ack before declaring the
    /// connection dead.
    pub keepalive_timeout: Duration,
    /// Send keepalive pings even with no live calls.
    pub keepalive_permit_without_calls: bool,
    /// How long to wait for any ping ack before closing.
    pub ping_timeout: Duration,
    /// How long to wait for the peer to ack our SETTINGS.
    pub settings_timeout: Option<Duration>,
    /// Server: cap on concurrently open streams, advertised to the peer.
    pub max_concurrent_streams: Option<u32>,
    /// Local SETTINGS_MAX_FRAME_SIZE.
    pub max_frame_size: u32,
    /// Local per-stream initial window (stream lookahead).
    pub initial_window_size: u32,
    /// Hard cap on a received header list.
    pub max_header_list_size: u32,
    /// Probe bandwidth-delay product and autosize windows.
    pub bdp_probe: bool,
    /// Negotiate raw binary metadata (no base64).
    pub enable_true_binary_metadata: bool,
    /// Advertise a preferred receive frame size for encrypted paths.
    pub enable_preferred_rx_crypto_frame_size: bool,
    /// Server: delay RST/error responses to abusive peers.
    pub allow_tarpit: bool,
    pub min_tarpit_duration: Duration,
    pub max_tarpit_duration: Duration,
    /// Chance (percent) of sending a PING after each RST_STREAM received
    /// from a client.
    pub ping_on_rst_stream_percent: u32,
    /// Server: inbound pings tolerated inside the minimum interval
    /// before disconnecting the peer; zero disables the budget.
    pub max_ping_strikes: u32,
    /// Server: floor on how often an idle peer may ping.
    pub min_recv_ping_interval_without_data: Duration,
    /// Cap on new incoming streams admitted per endpoint read.
    pub max_requests_per_read: u32,
    /// Count unacked settings against the concurrent-stream budget.
    pub max_concurrent_streams_overload_protection: bool,
    /// Test hook: answer inbound pings (disable to simulate a peer that
    /// never acks).
    pub ack_pings: bool,
    /// Test hook: deterministic randomness for ping ids, tarpit delays,
    /// and RST-ping sampling.
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_stream_id: None,
            hpack_encoder_table_size: 4096,
            hpack_decoder_table_size: 4096,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            keepalive_time: None,
            keepalive_timeout: Duration::from_secs(20),
            keepalive_permit_without_calls: false,
            ping_timeout: Duration::from_secs(60),
            settings_timeout: None,
            max_concurrent_streams: None,
            max_frame_size: 16_384,
            initial_window_size: 65_535,
            max_header_list_size: 16_384,
            bdp_probe: true,
            enable_true_binary_metadata: true,
            enable_preferred_rx_crypto_frame_size: false,
            allow_tarpit: true,
            min_tarpit_duration: Duration::from_millis(100),
            max_tarpit_duration: Duration::from_secs(1),
            ping_on_rst_stream_percent: 1,
            max_ping_strikes: 2,
            min_recv_ping_interval_without_data: Duration::from_secs(300),
            max_requests_per_read: DEFAULT_MAX_REQUESTS_PER_READ,
            max_concurrent_streams_overload_protection: true,
            ack_pings: true,
            rng_seed: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initial_stream_id(mut self, id: u32) -> Self {
        self.initial_stream_id = Some(id);
        self
    }

    pub fn write_buffer_size(mut self, bytes: u32) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    pub fn keepalive_time(mut self, interval: Duration) -> Self {
        self.keepalive_time = Some(interval);
        self
    }

    pub fn keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = timeout;
        self
    }

    pub fn keepalive_permit_without_calls(mut self, permit: bool) -> Self {
        self.keepalive_permit_without_calls = permit;
        self
    }

    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn settings_timeout(mut self, timeout: Duration) -> Self {
        self.settings_timeout = Some(timeout);
        self
    }

    pub fn max_concurrent_streams(mut self, streams: u32) -> Self {
        self.max_concurrent_streams = Some(streams);
        self
    }

    pub fn max_frame_size(mut self, bytes: u32) -> Self {
        self.max_frame_size = bytes;
        self
    }

    pub fn initial_window_size(mut self, bytes: u32) -> Self {
        self.initial_window_size = bytes;
        self
    }

    pub fn bdp_probe(mut self, enabled: bool) -> Self {
        self.bdp_probe = enabled;
        self
    }

    pub fn allow_tarpit(mut self, allowed: bool) -> Self {
        self.allow_tarpit = allowed;
        self
    }

    pub fn tarpit_range(mut self, min: Duration, max: Duration) -> Self {
        self.min_tarpit_duration = min;
        self.max_tarpit_duration = max;
        self
    }

    pub fn ping_on_rst_stream_percent(mut self, percent: u32) -> Self {
        self.ping_on_rst_stream_percent = percent;
        self
    }

    pub fn max_ping_strikes(mut self, strikes: u32) -> Self {
        self.max_ping_strikes = strikes;
        self
    }

    pub fn min_recv_ping_interval_without_data(mut self, interval: Duration) -> Self {
        self.min_recv_ping_interval_without_data = interval;
        self
    }

    pub fn max_requests_per_read(mut self, requests: u32) -> Self {
        self.max_requests_per_read = requests;
        self
    }

    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Resolved settings timeout: explicit value, or derived from the
    /// keepalive timeout.
    pub fn resolved_settings_timeout(&self) -> Duration {
        self.settings_timeout
            .unwrap_or_else(|| (self.keepalive_timeout * 2).max(Duration::from_secs(60)))
    }

    /// Apply clamps and role-sensitive defaults.
    pub(crate) fn validated(mut self, is_client: bool) -> Self {
        if let Some(id) = self.initial_stream_id {
            let expected_parity = if is_client { 1 } else { 0 };
            if id == 0 || id % 2 != expected_parity {
                warn!(
                    id,
                    is_client, "initial stream id has wrong parity for role; ignoring"
                );
                self.initial_stream_id = None;
            }
        }
        self.max_frame_size = self.max_frame_size.clamp(16_384, 16_777_215);
        self.initial_window_size = self.initial_window_size.min(0x7fff_ffff);
        self.ping_on_rst_stream_percent = self.ping_on_rst_stream_percent.min(100);
        self.max_requests_per_read = self.max_requests_per_read.clamp(1, 10_000);
        if let Some(keepalive) = self.keepalive_time {
            self.keepalive_time = Some(keepalive.max(Duration::from_millis(1)));
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_frame_size, 16_384);
        assert_eq!(config.ping_on_rst_stream_percent, 1);
        assert_eq!(config.max_requests_per_read, 32);
        assert!(config.allow_tarpit);
        assert!(config.keepalive_time.is_none());
    }

    #[test]
    fn test_clamps() {
        let config = Config::new()
            .max_frame_size(1)
            .ping_on_rst_stream_percent(250)
            .max_requests_per_read(0)
            .validated(true);
        assert_eq!(config.max_frame_size, 16_384);
        assert_eq!(config.ping_on_rst_stream_percent, 100);
        assert_eq!(config.max_requests_per_read, 1);

        let config = Config::new()
            .max_requests_per_read(1_000_000)
            .validated(true);
        assert_eq!(config.max_requests_per_read, 10_000);
    }

    #[test]
    fn test_stream_id_parity_enforced() {
        let config = Config::new().initial_stream_id(2).validated(true);
        assert_eq!(config.initial_stream_id, None);
        let config = Config::new().initial_stream_id(11).validated(true);
        assert_eq!(config.initial_stream_id, Some(11));
        let config = Config::new().initial_stream_id(11).validated(false);
        assert_eq!(config.initial_stream_id, None);
        let config = Config::new().initial_stream_id(8).validated(false);
        assert_eq!(config.initial_stream_id, Some(8));
    }

    #[test]
    fn test_settings_timeout_derivation() {
        let config = Config::default();
        assert_eq!(config.resolved_settings_timeout(), Duration::from_secs(60));
        let config = Config::new().keepalive_timeout(Duration::from_secs(90));
        assert_eq!(config.resolved_settings_timeout(), Duration::from_secs(180));
        let config = Config::new().settings_timeout(Duration::from_secs(7));
        assert_eq!(config.resolved_settings_timeout(), Duration::from_secs(7));
    }
}
