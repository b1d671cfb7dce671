//! Bounded retry timer for the handshake and teardown exchanges.
//!
//! `connect` and `disconnect` resend their control segment every `timeout`
//! until the peer answers or the attempt budget is spent.  A
//! [`RetryTimer`] tracks that budget; the owning event loop calls
//! [`RetryTimer::poll`] on every tick and acts on the returned [`Retry`].
//!
//! Data-segment retransmission is unbounded and lives in
//! [`crate::sr_sender`] instead.

use std::time::{Duration, Instant};

/// What the caller should do after polling a [`RetryTimer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// The current attempt has not timed out yet.
    Wait,
    /// Timed out with budget left: send again.  Carries the new attempt number.
    Resend(u32),
    /// Timed out on the last attempt.
    Exhausted,
}

/// Attempt counter plus the instant of the most recent transmission.
#[derive(Debug, Clone)]
pub struct RetryTimer {
    interval: Duration,
    max_attempts: u32,
    attempts: u32,
    last_sent: Instant,
}

impl RetryTimer {
    /// Start a timer whose first attempt was sent at `now`.
    pub fn start(interval: Duration, max_attempts: u32, now: Instant) -> Self {
        Self {
            interval,
            max_attempts,
            attempts: 1,
            last_sent: now,
        }
    }

    /// Number of attempts made so far (the first send counts as one).
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn poll(&mut self, now: Instant) -> Retry {
        if now.duration_since(self.last_sent) < self.interval {
            return Retry::Wait;
        }
        if self.attempts >= self.max_attempts {
            return Retry::Exhausted;
        }
        self.attempts += 1;
        self.last_sent = now;
        Retry::Resend(self.attempts)
    }
}
