//! Relay stream policy: retransmission window and reconnect limits.
//!
//! Reconnects are bounded twice: by consecutive failed attempts with
//! exponential backoff, and by a rolling window that caps how many
//! reconnects a stream may perform regardless of how many succeeded.

use crate::protocol::MAX_DATA_FRAME_SIZE;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;

/// Tunable limits for a relay stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Maximum sent-but-unacknowledged bytes retained for replay.
    /// Writers wait once the window is full.
    pub max_unacked_bytes: usize,
    /// Consecutive reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Delay before the second attempt; doubles on every further attempt.
    pub reconnect_backoff: Duration,
    /// Upper bound for the backoff delay.
    pub max_reconnect_backoff: Duration,
    /// Rolling window for the reconnect storm guard.
    pub reconnect_window: Duration,
    /// Reconnects allowed within `reconnect_window`.
    pub max_reconnects_per_window: u32,
    /// Deadline for each reconnect handshake.
    pub handshake_timeout: Duration,
    /// Capacity of the read and write queues, in chunks.
    pub queue_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_unacked_bytes: 8 * 1024 * 1024,
            max_reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(200),
            max_reconnect_backoff: Duration::from_secs(5),
            reconnect_window: Duration::from_secs(60),
            max_reconnects_per_window: 20,
            handshake_timeout: Duration::from_secs(30),
            queue_capacity: 64,
        }
    }
}

impl StreamConfig {
    /// Largest chunk a write hands to the driver. Never above the window, so
    /// sending one more chunk cannot overshoot `max_unacked_bytes`.
    pub fn write_chunk_size(&self) -> usize {
        self.max_unacked_bytes.clamp(1, MAX_DATA_FRAME_SIZE)
    }

    /// Delay before the given (1-based) reconnect attempt.
    ///
    /// The first attempt is immediate.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.reconnect_backoff
            .saturating_mul(factor)
            .min(self.max_reconnect_backoff)
    }
}

/// Caps reconnects per rolling time window.
#[derive(Debug)]
pub struct ReconnectGuard {
    window: Duration,
    max_in_window: u32,
    attempts: VecDeque<Instant>,
}

impl ReconnectGuard {
    pub fn new(window: Duration, max_in_window: u32) -> Self {
        Self {
            window,
            max_in_window,
            attempts: VecDeque::new(),
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(config.reconnect_window, config.max_reconnects_per_window)
    }

    /// Record a reconnect attempt if the window allows one.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.attempts.front() {
            if now.duration_since(*oldest) >= self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }

        if self.attempts.len() >= self.max_in_window as usize {
            warn!(
                "Reconnect limit reached: {} attempts within {:?}",
                self.attempts.len(),
                self.window
            );
            return false;
        }

        self.attempts.push_back(now);
        true
    }

    /// Attempts currently counted against the window.
    pub fn recent_attempts(&self) -> usize {
        self.attempts.len()
    }
}
