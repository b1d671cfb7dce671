//! Socket configuration recognised at construction time.

use std::time::Duration;

use crate::connection::ConnError;

/// Largest usable window: half of the 16-bit sequence space, so a sequence
/// number can always be classified as "new" or "old" after wrap-around.
pub const MAX_WINDOW: u16 = 1 << 15;

/// Number of SYNs sent before `connect` gives up.
pub const MAX_CONNECT_ATTEMPTS: u32 = 10;

/// Number of FINs sent before `disconnect` closes locally anyway.
pub const MAX_DISCONNECT_ATTEMPTS: u32 = 10;

/// Per-socket parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Sliding-window capacity in segments.
    pub window: u16,
    /// Retransmission / handshake retry timeout.
    pub timeout: Duration,
    /// Granularity at which the event loop re-checks timers.
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window: 100,
            timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
        }
    }
}

impl Config {
    /// Config with the given window (segments) and timeout (milliseconds).
    pub fn new(window: u16, timeout_ms: u64) -> Self {
        Self {
            window,
            timeout: Duration::from_millis(timeout_ms),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConnError> {
        if self.window == 0 || self.window > MAX_WINDOW {
            return Err(ConnError::InvalidConfig(format!(
                "window must be in 1..={MAX_WINDOW}, got {}",
                self.window
            )));
        }
        if self.timeout.is_zero() {
            return Err(ConnError::InvalidConfig("timeout must be non-zero".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConnError::InvalidConfig(
                "poll_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
