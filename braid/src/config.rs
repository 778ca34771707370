//! Session configuration and tunable parameters.

use std::time::Duration;

use crate::error::Error;

/// Smallest accepted stream window. Below this the half-window update
/// threshold degenerates and flow control turns into per-byte chatter.
const MIN_STREAM_WINDOW: u32 = 4 * 1024;

/// Configuration for a session.
///
/// Defaults favor long-lived sessions over real networks. Every knob can
/// be tightened for tests or loosened for bulk transfer.
#[derive(Debug, Clone)]
pub struct Config {
    /// How many incoming streams may sit unaccepted before further stream
    /// opens are rejected with a reset (default: 256).
    pub accept_backlog: usize,

    /// Whether the session pings the peer in the background and dies when
    /// a probe goes unanswered (default: true).
    pub enable_keep_alive: bool,

    /// Interval between background keep-alive probes (default: 30s).
    pub keep_alive_interval: Duration,

    /// Upper bound on any single transport write. A transport that cannot
    /// take a frame within this time is considered dead (default: 10s).
    pub connection_write_timeout: Duration,

    /// Initial and maximum per-stream receive window in bytes, which is
    /// also the largest payload a single `DATA` frame may carry
    /// (default: 256 KiB).
    pub max_stream_window_size: u32,

    /// How long a locally opened stream may wait for the peer's ACK.
    /// Expiry is treated as a dead peer and kills the session
    /// (default: 75s).
    pub stream_open_timeout: Duration,

    /// Upper bound on a single ping round trip (default: 30s).
    pub ping_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accept_backlog: 256,
            enable_keep_alive: true,
            keep_alive_interval: Duration::from_secs(30),
            connection_write_timeout: Duration::from_secs(10),
            max_stream_window_size: 256 * 1024,
            stream_open_timeout: Duration::from_secs(75),
            ping_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.accept_backlog == 0 {
            return Err(Error::Config("accept_backlog must be at least 1"));
        }
        if self.enable_keep_alive && self.keep_alive_interval.is_zero() {
            return Err(Error::Config("keep_alive_interval must be positive"));
        }
        if self.connection_write_timeout.is_zero() {
            return Err(Error::Config("connection_write_timeout must be positive"));
        }
        if self.max_stream_window_size < MIN_STREAM_WINDOW {
            return Err(Error::Config("max_stream_window_size is below the 4 KiB floor"));
        }
        if self.stream_open_timeout.is_zero() {
            return Err(Error::Config("stream_open_timeout must be positive"));
        }
        if self.ping_timeout.is_zero() {
            return Err(Error::Config("ping_timeout must be positive"));
        }
        Ok(())
    }
}
