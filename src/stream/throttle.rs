//! Flush throttling.
//!
//! At most one flush per `min_interval`. A flush that is due too early is
//! deferred to `last_flush + min_interval`; only one deferred flush is ever
//! outstanding.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// Enough time has passed; flush now.
    Now,
    /// Too early; a flush is now scheduled for the given instant.
    Scheduled(Instant),
    /// Too early, and a flush is already scheduled.
    AlreadyScheduled,
}

#[derive(Debug)]
pub struct FlushGate {
    min_interval: Duration,
    last_flush: Option<Instant>,
    scheduled: Option<Instant>,
}

impl FlushGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_flush: None,
            scheduled: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Whether a flush at `now` respects the minimum spacing.
    pub fn ready(&self, now: Instant) -> bool {
        match self.last_flush {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
        }
    }

    /// Called whenever a new activity lands in the pending buffer.
    pub fn on_pending(&mut self, now: Instant) -> FlushDecision {
        if self.ready(now) {
            return FlushDecision::Now;
        }
        if self.scheduled.is_some() {
            return FlushDecision::AlreadyScheduled;
        }
        // ready() was false, so last_flush is set
        let at = self.last_flush.map_or(now, |last| last + self.min_interval);
        self.scheduled = Some(at);
        FlushDecision::Scheduled(at)
    }

    /// Deadline of the deferred flush, if any.
    pub fn scheduled(&self) -> Option<Instant> {
        self.scheduled
    }

    pub fn record_flush(&mut self, now: Instant) {
        self.last_flush = Some(now);
        self.scheduled = None;
    }

    pub fn cancel_scheduled(&mut self) {
        self.scheduled = None;
    }
}
