//! Sliding-window error counters.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Counts events inside a trailing time window and trips at a threshold.
#[derive(Debug, Clone)]
pub struct ErrorWindow {
    span: Duration,
    threshold: usize,
    hits: VecDeque<Instant>,
}

impl ErrorWindow {
    /// Window of length `span` tripping at `threshold` events.
    #[must_use]
    pub fn new(span: Duration, threshold: usize) -> Self {
        Self {
            span,
            threshold: threshold.max(1),
            hits: VecDeque::new(),
        }
    }

    /// Record one event at `now`. Returns `true` when the threshold is
    /// reached, after which the window starts over.
    pub fn record(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.hits.push_back(now);
        if self.hits.len() >= self.threshold {
            self.hits.clear();
            true
        } else {
            false
        }
    }

    /// Events currently inside the window.
    #[must_use]
    pub fn count(&self, now: Instant) -> usize {
        self.hits
            .iter()
            .filter(|t| now.duration_since(**t) <= self.span)
            .count()
    }

    /// Forget every recorded event.
    pub fn clear(&mut self) {
        self.hits.clear();
    }

    fn prune(&mut self, now: Instant) {
        while self
            .hits
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.span)
        {
            self.hits.pop_front();
        }
    }
}
