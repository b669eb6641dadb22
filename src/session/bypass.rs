//! Anti-automation probe handling.
//!
//! The probe asks the client to stand still while the server watches it
//! fall. Passive mode observes the altitude with a few humanized look
//! adjustments; active mode writes a synthetic free-fall trajectory. Both
//! always resolve: the ceiling turns a stuck run into a pass.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::backoff::jitter;
use crate::client::{ActionErrorKind, GameSession, OutboundPacket};

const TICK: Duration = Duration::from_millis(50);
const GRAVITY: f64 = 0.08;
const DRAG: f64 = 0.98;
const TERMINAL_VELOCITY: f64 = -3.92;
const FALL_TICKS: u32 = 128;
const MAX_TICKS: u32 = 300;
const LOOK_TICKS: [u32; 3] = [20, 60, 100];

/// How the probe is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassMode {
    /// Observe altitude and ground contact.
    Passive,
    /// Write a synthetic fall.
    Active,
}

/// Result of one bypass run. Every variant counts as resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BypassOutcome {
    /// Drop or ground contact observed.
    Passed {
        /// Altitude lost.
        drop: f64,
    },
    /// Finished without evidence either way.
    Inconclusive {
        /// Altitude lost.
        drop: f64,
    },
    /// Not needed (quick login, or superseded by a join).
    Skipped,
    /// Active fall never reached the ground.
    TimedOut,
}

/// Bypass parameters.
#[derive(Debug, Clone, Copy)]
pub struct BypassSettings {
    /// Passive or active.
    pub mode: BypassMode,
    /// Minimum drop counted as a pass.
    pub fall_threshold: f64,
    /// Hard ceiling for the whole run.
    pub ceiling: Duration,
}

/// Run the bypass to completion.
///
/// Cancelling `cancel` ends the run with [`BypassOutcome::Skipped`].
pub async fn run_bypass(
    session: Arc<dyn GameSession>,
    settings: BypassSettings,
    cancel: CancellationToken,
    mut rng: StdRng,
) -> BypassOutcome {
    let run = async {
        match settings.mode {
            BypassMode::Passive => passive(session.as_ref(), settings.fall_threshold, &mut rng).await,
            BypassMode::Active => active(session.as_ref(), &mut rng).await,
        }
    };
    tokio::select! {
        () = cancel.cancelled() => BypassOutcome::Skipped,
        result = tokio::time::timeout(settings.ceiling, run) => {
            result.unwrap_or(BypassOutcome::Passed { drop: 0.0 })
        }
    }
}

async fn small_look(session: &dyn GameSession, rng: &mut StdRng, yaw: f32, pitch: f32) {
    let yaw = rng.gen_range(-yaw..yaw);
    let pitch = rng.gen_range(-pitch..pitch);
    if let Err(err) = session.look(yaw, pitch).await {
        debug!(%err, "probe look failed");
    }
}

async fn passive(session: &dyn GameSession, threshold: f64, rng: &mut StdRng) -> BypassOutcome {
    tokio::time::sleep(jitter(rng, 800, 2000)).await;
    let Some(start) = session.entity() else {
        return BypassOutcome::Passed { drop: 0.0 };
    };
    let base = Instant::now();
    let first_look = jitter(rng, 300, 700);
    let second_look = jitter(rng, 1200, 2000);
    let check = jitter(rng, 4000, 5000);

    tokio::time::sleep_until(base + first_look).await;
    small_look(session, rng, 0.3, 0.15).await;
    tokio::time::sleep_until(base + second_look).await;
    small_look(session, rng, 0.4, 0.2).await;
    tokio::time::sleep_until(base + check).await;

    let Some(now) = session.entity() else {
        return BypassOutcome::Inconclusive { drop: 0.0 };
    };
    let drop = start.position.y - now.position.y;
    if drop > threshold || now.on_ground {
        BypassOutcome::Passed { drop }
    } else {
        BypassOutcome::Inconclusive { drop }
    }
}

async fn active(session: &dyn GameSession, rng: &mut StdRng) -> BypassOutcome {
    session.clear_control_states();
    let Some(start) = session.entity() else {
        return BypassOutcome::Passed { drop: 0.0 };
    };
    let (x, z) = (start.position.x, start.position.z);
    let mut y = start.position.y;
    let mut velocity = 0.0_f64;
    let mut lowest = y;
    let mut ticker = tokio::time::interval_at(Instant::now() + TICK, TICK);

    for tick in 1..=MAX_TICKS {
        ticker.tick().await;

        if tick <= FALL_TICKS {
            velocity = ((velocity - GRAVITY) * DRAG).max(TERMINAL_VELOCITY);
            y += velocity;
            lowest = lowest.min(y);
            let on_ground = tick == FALL_TICKS;
            let packet = if on_ground {
                OutboundPacket::Position {
                    x,
                    y: start.position.y,
                    z,
                    on_ground: true,
                }
            } else {
                OutboundPacket::Position {
                    x,
                    y,
                    z,
                    on_ground: false,
                }
            };
            if let Err(err) = session.write_packet(packet) {
                if err.kind == ActionErrorKind::NotConnected {
                    return BypassOutcome::TimedOut;
                }
                debug!(%err, tick, "fall packet rejected");
            }
            if LOOK_TICKS.contains(&tick) {
                small_look(session, rng, 0.3, 0.15).await;
            }
        }

        if tick >= FALL_TICKS && session.entity().is_some_and(|e| e.on_ground) {
            return BypassOutcome::Passed {
                drop: start.position.y - lowest,
            };
        }
    }
    BypassOutcome::TimedOut
}
