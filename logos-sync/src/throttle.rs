//! Trailing-edge coalescing for chatty updates.
//!
//! ```text
//!   offer(a)      offer(b)    offer(c)          poll(deadline)
//!      │             │           │                   │
//!  Idle ──► Pending(a, t0+I) ─► Pending(b) ─► Pending(c) ──► Idle, emits c
//! ```
//!
//! The window opens on the first offer and lasts `interval`. Later offers
//! inside the window replace the pending value; nothing is queued. A
//! cancelled window discards its value.

use tokio::time::{Duration, Instant};

/// Throttle state.
#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleState<T> {
    Idle,
    Pending { value: T, deadline: Instant },
}

/// Coalesces values offered within one window into the most recent one.
#[derive(Debug, Clone)]
pub struct Throttle<T> {
    interval: Duration,
    state: ThrottleState<T>,
}

impl<T> Throttle<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: ThrottleState::Idle,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> &ThrottleState<T> {
        &self.state
    }

    /// Offer a value. Returns `true` if this opened a new window.
    pub fn offer(&mut self, value: T, now: Instant) -> bool {
        if let ThrottleState::Pending { value: pending, .. } = &mut self.state {
            *pending = value;
            return false;
        }
        self.state = ThrottleState::Pending {
            value,
            deadline: now + self.interval,
        };
        true
    }

    /// When the pending value becomes due, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            ThrottleState::Idle => None,
            ThrottleState::Pending { deadline, .. } => Some(*deadline),
        }
    }

    /// Take the pending value if its window has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.take(),
            _ => None,
        }
    }

    /// Discard the pending value, returning it.
    pub fn cancel(&mut self) -> Option<T> {
        self.take()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, ThrottleState::Pending { .. })
    }

    fn take(&mut self) -> Option<T> {
        match std::mem::replace(&mut self.state, ThrottleState::Idle) {
            ThrottleState::Idle => None,
            ThrottleState::Pending { value, .. } => Some(value),
        }
    }
}
