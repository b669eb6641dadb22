//! Server selector menu clicks.

use std::time::Duration;

use tokio::time::Instant;

use crate::client::{ActionError, GameSession, OutboundPacket};
use crate::config::MenuConfig;

/// Result of one click.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickResult {
    /// Packet written.
    Sent,
    /// Too soon after the previous click.
    Throttled,
    /// No window is open.
    NoWindow,
    /// Packet write failed.
    Failed(ActionError),
}

/// Attempt bookkeeping and click throttling for the selector window.
#[derive(Debug, Clone)]
pub struct MenuNavigator {
    slot1: u16,
    slot2: u16,
    max_attempts: u32,
    min_gap: Duration,
    attempts: u32,
    last_click: Option<Instant>,
}

impl MenuNavigator {
    /// Navigator clicking `slots` under the configured limits.
    #[must_use]
    pub fn new(slots: (u16, u16), config: &MenuConfig) -> Self {
        Self {
            slot1: slots.0,
            slot2: slots.1,
            max_attempts: config.max_attempts,
            min_gap: Duration::from_millis(config.min_click_gap_ms),
            attempts: 0,
            last_click: None,
        }
    }

    /// Two-click sequences started so far.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether no further sequence may start.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Start a sequence by clicking the first slot.
    pub fn first_click(&mut self, session: &dyn GameSession) -> ClickResult {
        self.attempts += 1;
        self.click(session, self.slot1)
    }

    /// Finish a sequence by clicking the second slot.
    pub fn second_click(&mut self, session: &dyn GameSession) -> ClickResult {
        self.click(session, self.slot2)
    }

    fn click(&mut self, session: &dyn GameSession, slot: u16) -> ClickResult {
        let Some(window) = session.current_window() else {
            return ClickResult::NoWindow;
        };
        let now = Instant::now();
        if self
            .last_click
            .is_some_and(|last| now.duration_since(last) < self.min_gap)
        {
            return ClickResult::Throttled;
        }
        self.last_click = Some(now);
        match session.write_packet(OutboundPacket::WindowClick {
            window_id: window.id,
            slot,
            mouse_button: 0,
            mode: 0,
            item: None,
        }) {
            Ok(()) => ClickResult::Sent,
            Err(err) => ClickResult::Failed(err),
        }
    }
}
