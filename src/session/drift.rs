//! Stand-position supervision.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{ActionError, Control, GameSession};
use crate::config::PositionConfig;
use crate::models::geometry::Vec3;

const STEP: Duration = Duration::from_millis(200);
const JUMP_HOLD: Duration = Duration::from_millis(100);
const STALL_DISTANCE: f64 = 0.1;
const STALLED_STEPS_BEFORE_JUMP: u32 = 5;
const HORIZONTAL_STOP: f64 = 0.3;

/// What a drift check should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftVerdict {
    /// Within the allowed drift.
    Hold,
    /// Walk back to the stand position.
    Return,
    /// Moved to spawn by the server; reconnect.
    Teleport,
}

impl DriftVerdict {
    /// Classify a distance from the stand position.
    #[must_use]
    pub fn classify(distance: f64, max_distance: f64, teleport_distance: f64) -> Self {
        if distance > teleport_distance {
            Self::Teleport
        } else if distance > max_distance {
            Self::Return
        } else {
            Self::Hold
        }
    }
}

/// How a walk back ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnOutcome {
    /// Within the arrival distance.
    Arrived,
    /// Gave up after the return timeout.
    TimedOut,
    /// The entity disappeared.
    Lost,
    /// The instance was torn down.
    Cancelled,
}

/// Walk back to `stand` in short forward steps, jumping when stuck.
///
/// # Errors
///
/// Returns the first action error from the session (typically a closed
/// connection).
pub async fn return_to_stand(
    session: &dyn GameSession,
    stand: Vec3,
    config: &PositionConfig,
    cancel: &CancellationToken,
) -> Result<ReturnOutcome, ActionError> {
    session.clear_control_states();
    let deadline = Instant::now() + Duration::from_millis(config.return_timeout_ms);
    let mut stalled = 0_u32;

    let outcome = loop {
        let Some(entity) = session.entity() else {
            break ReturnOutcome::Lost;
        };
        if entity.position.distance_to(stand) <= config.arrive_distance {
            break ReturnOutcome::Arrived;
        }
        if Instant::now() > deadline {
            break ReturnOutcome::TimedOut;
        }
        if entity.position.horizontal_distance_to(stand) <= HORIZONTAL_STOP {
            break ReturnOutcome::Arrived;
        }

        let yaw = entity.position.yaw_towards(stand);
        if let Err(err) = session.look(yaw, 0.0).await {
            session.clear_control_states();
            return Err(err);
        }
        session.set_control_state(Control::Forward, true);

        tokio::select! {
            () = cancel.cancelled() => break ReturnOutcome::Cancelled,
            () = tokio::time::sleep(STEP) => {}
        }

        let moved = session
            .entity()
            .map_or(0.0, |now| now.position.distance_to(entity.position));
        if moved < STALL_DISTANCE {
            stalled += 1;
            if stalled > STALLED_STEPS_BEFORE_JUMP {
                session.set_control_state(Control::Jump, true);
                tokio::time::sleep(JUMP_HOLD).await;
                session.set_control_state(Control::Jump, false);
                stalled = 0;
            }
        } else {
            stalled = 0;
        }
    };

    session.clear_control_states();
    Ok(outcome)
}
