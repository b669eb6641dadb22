//! Channel from session instances to the fleet manager.
//!
//! Instances never touch fleet state directly. Every cross-instance effect
//! (status aggregation, error budgets, replacement) is a [`FleetEvent`]
//! delivered to the fleet actor's mailbox.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::models::status::BotStatus;

/// Liveness token for one instance generation.
///
/// The fleet owns one cell per identity and bumps it whenever the slot is
/// invalidated; an instance whose generation no longer matches the cell is
/// inert and all its timers become no-ops.
#[derive(Debug, Clone)]
pub struct Generation {
    cell: Arc<AtomicU64>,
    id: u64,
}

impl Generation {
    /// Token for generation `id` of the identity owning `cell`.
    #[must_use]
    pub fn new(cell: Arc<AtomicU64>, id: u64) -> Self {
        Self { cell, id }
    }

    /// Generation number.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this generation still owns the identity's slot.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.cell.load(Ordering::SeqCst) == self.id
    }
}

/// State handed from an instance to its replacement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Carry {
    /// Consecutive rate-limit kicks without a successful join.
    pub wait_kick_count: u32,
}

/// Messages from instances to the fleet manager.
#[derive(Debug)]
pub enum FleetEvent {
    /// Status transition, optionally with one mined block.
    Status {
        /// Identity.
        username: String,
        /// Reporting generation.
        generation: u64,
        /// New status.
        status: BotStatus,
        /// Whether a block was mined.
        block_mined: bool,
    },
    /// Counts against the global error budget.
    GlobalError {
        /// Identity.
        username: String,
        /// Short reason for the log line.
        reason: String,
    },
    /// Connectivity-class failure.
    NoInternet {
        /// Identity.
        username: String,
        /// Short reason for the log line.
        reason: String,
    },
    /// Tear the instance down now and install a replacement after `delay`.
    ScheduleReconnect {
        /// Identity.
        username: String,
        /// Requesting generation.
        generation: u64,
        /// Delay before the replacement connects.
        delay: Duration,
        /// State for the replacement.
        carry: Carry,
    },
    /// The instance has quit; install a replacement immediately.
    Replace {
        /// Identity.
        username: String,
        /// Requesting generation.
        generation: u64,
        /// State for the replacement.
        carry: Carry,
    },
}

/// Per-instance sender bound to an identity and generation.
#[derive(Debug, Clone)]
pub struct FleetHooks {
    tx: mpsc::UnboundedSender<FleetEvent>,
    username: String,
    generation: Generation,
}

impl FleetHooks {
    /// Bind a sender to one instance generation.
    #[must_use]
    pub fn new(
        tx: mpsc::UnboundedSender<FleetEvent>,
        username: impl Into<String>,
        generation: Generation,
    ) -> Self {
        Self {
            tx,
            username: username.into(),
            generation,
        }
    }

    /// Liveness token of the bound generation.
    #[must_use]
    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    fn send(&self, event: FleetEvent) {
        // The fleet outlives its instances except during shutdown.
        let _ = self.tx.send(event);
    }

    /// Report a status transition.
    pub fn status(&self, status: BotStatus, block_mined: bool) {
        self.send(FleetEvent::Status {
            username: self.username.clone(),
            generation: self.generation.id(),
            status,
            block_mined,
        });
    }

    /// Count an error against the global budget.
    pub fn global_error(&self, reason: impl Into<String>) {
        self.send(FleetEvent::GlobalError {
            username: self.username.clone(),
            reason: reason.into(),
        });
    }

    /// Report a connectivity-class failure.
    pub fn no_internet(&self, reason: impl Into<String>) {
        self.send(FleetEvent::NoInternet {
            username: self.username.clone(),
            reason: reason.into(),
        });
    }

    /// Ask the fleet to tear this instance down and rebuild it after `delay`.
    pub fn schedule_reconnect(&self, delay: Duration, carry: Carry) {
        self.send(FleetEvent::ScheduleReconnect {
            username: self.username.clone(),
            generation: self.generation.id(),
            delay,
            carry,
        });
    }

    /// Ask the fleet to install a replacement now.
    pub fn replace(&self, carry: Carry) {
        self.send(FleetEvent::Replace {
            username: self.username.clone(),
            generation: self.generation.id(),
            carry,
        });
    }
}
