//! Timing and capacity knobs shared by every component.

use std::time::Duration;

/// Default liveness timeout: silence before a peer is marked lost.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(6);

/// Default grace period a lost peer stays in the roster before removal.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Default join round-trip timeout.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default silence from a lost host before the ride ends locally.
pub const DEFAULT_HOST_SILENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Core configuration. Construct with `Config::default()` and override fields as needed.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub liveness_timeout: Duration,
    pub grace_period: Duration,
    pub join_timeout: Duration,
    pub host_silence_timeout: Duration,
    /// Max commands held waiting for their issuer or for a sequence gap to fill.
    pub command_buffer_capacity: usize,
    /// How long a buffered command may wait before it is dropped (unknown issuer) or applied past the gap.
    pub command_buffer_timeout: Duration,
    /// Recent commands kept by the host for resync requests.
    pub command_log_capacity: usize,
    pub speaking_window: Duration,
    /// Audio level (0.0..=1.0) at or above which a sample counts as speech.
    pub speaking_threshold: f32,
    /// Minimum spacing between outbound audio-level signals.
    pub level_signal_interval: Duration,
    /// Republish interval for a locally playing track.
    pub now_playing_refresh: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            host_silence_timeout: DEFAULT_HOST_SILENCE_TIMEOUT,
            command_buffer_capacity: 64,
            command_buffer_timeout: Duration::from_secs(3),
            command_log_capacity: 32,
            speaking_window: Duration::from_millis(300),
            speaking_threshold: 0.1,
            level_signal_interval: Duration::from_millis(100),
            now_playing_refresh: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}
