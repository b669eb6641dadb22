//! Display status reported by session instances.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Per-identity status shown in snapshots and the control surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    /// Connected, going through login, probe and menu.
    Connecting,
    /// Joined and running the dig loop.
    Mining,
    /// Joined, dig loop suspended by the fleet-wide pause flag.
    Paused,
    /// Walking back to the stand position.
    Returning,
    /// Waiting for a scheduled reconnect.
    Waiting,
    /// Disconnected with no reconnect scheduled yet.
    Offline,
}

impl BotStatus {
    /// Lowercase label used in logs and JSON.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Mining => "mining",
            Self::Paused => "paused",
            Self::Returning => "returning",
            Self::Waiting => "waiting",
            Self::Offline => "offline",
        }
    }
}

impl Display for BotStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
