//! Cooperative dig loop over a fixed target list.
//!
//! The loop owns no state beyond its counters. It polls [`TaskHooks`] each
//! iteration for stop/pause/return, reports every mined block, and asks for
//! recovery (a reconnect) at most once when targets or world data stay
//! unavailable.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{ActionError, GameSession, Item};
use crate::config::FleetConfig;
use crate::models::geometry::BlockPos;

/// Pause used where the loop would otherwise spin without awaiting I/O.
const MIN_STEP: Duration = Duration::from_millis(1);

/// Why the loop asked for a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    /// Target regions stayed unloaded.
    ChunksMissing,
    /// Every target stayed empty.
    TargetsEmpty,
    /// No successful dig since the grace window closed.
    Stuck,
    /// No successful dig for too long.
    Idle,
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The stop predicate became true.
    Stopped,
    /// Recovery was requested.
    Recovery(RecoveryReason),
    /// The target list was empty.
    NoTargets,
}

/// Summary returned when the loop exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopReport {
    /// Blocks mined by this run.
    pub mined: u64,
    /// Target index at exit.
    pub index: usize,
    /// Exit reason.
    pub exit: LoopExit,
}

/// Callbacks from the loop into its owner.
pub trait TaskHooks: Send + Sync {
    /// Polled every iteration; `true` ends the loop.
    fn should_stop(&self) -> bool;
    /// Fleet-wide pause.
    fn is_paused(&self) -> bool;
    /// Walking back to the stand position.
    fn is_returning(&self) -> bool;
    /// One block mined at `pos`.
    fn on_block_mined(&self, pos: BlockPos);
    /// Ask the owner to reconnect.
    fn request_recovery(&self, reason: RecoveryReason);
}

/// Loop tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskSettings {
    /// Maximum dig distance.
    pub reach: f64,
    /// Misses are not counted during this window after start.
    pub grace: Duration,
    /// Missed cycles before recovery.
    pub miss_threshold: u32,
    /// Warn every this many missed cycles.
    pub warn_every: u32,
    /// Idle step while paused or returning.
    pub paused_idle: Duration,
    /// Idle step while regions are missing.
    pub chunk_retry: Duration,
    /// Pause between iterations.
    pub dig_delay: Duration,
    /// Recovery after this long without a mined block once the grace is over.
    pub stuck_threshold: Duration,
    /// Recovery after this long without a mined block.
    pub restart_if_idle: Duration,
}

impl TaskSettings {
    /// Settings from the `[task]` and `[timing]` sections.
    #[must_use]
    pub fn from_config(config: &FleetConfig) -> Self {
        Self {
            reach: config.task.reach,
            grace: Duration::from_millis(config.task.grace_ms),
            miss_threshold: config.task.miss_threshold,
            warn_every: config.task.warn_every.max(1),
            paused_idle: Duration::from_millis(config.task.paused_idle_ms),
            chunk_retry: Duration::from_millis(config.task.chunk_retry_ms),
            dig_delay: Duration::from_millis(config.timing.dig_delay_ms),
            stuck_threshold: Duration::from_millis(config.timing.stuck_threshold_ms),
            restart_if_idle: Duration::from_millis(config.timing.restart_if_idle_ms),
        }
    }
}

fn pickaxe_tier(name: &str) -> Option<u8> {
    let material = name.strip_suffix("_pickaxe")?;
    Some(match material {
        "netherite" => 6,
        "diamond" => 5,
        "iron" => 4,
        "stone" => 3,
        "golden" => 2,
        "wooden" => 1,
        _ => 0,
    })
}

/// Highest-tier pickaxe in `inventory`.
#[must_use]
pub fn best_tool(inventory: &[Item]) -> Option<&Item> {
    inventory
        .iter()
        .filter_map(|item| pickaxe_tier(&item.name).map(|tier| (tier, item)))
        .max_by_key(|(tier, _)| *tier)
        .map(|(_, item)| item)
}

/// The dig loop for one session.
pub struct TaskLoop<H> {
    session: Arc<dyn GameSession>,
    targets: Vec<BlockPos>,
    settings: TaskSettings,
    hooks: H,
}

impl<H: TaskHooks> TaskLoop<H> {
    /// Build a loop over `targets`.
    #[must_use]
    pub fn new(
        session: Arc<dyn GameSession>,
        targets: Vec<BlockPos>,
        settings: TaskSettings,
        hooks: H,
    ) -> Self {
        Self {
            session,
            targets,
            settings,
            hooks,
        }
    }

    /// Run until stopped or recovery is requested.
    pub async fn run(self) -> LoopReport {
        let mut report = LoopReport {
            mined: 0,
            index: 0,
            exit: LoopExit::Stopped,
        };
        if self.targets.is_empty() {
            report.exit = LoopExit::NoTargets;
            return report;
        }

        let s = self.settings;
        let len = self.targets.len();
        let grace_until = Instant::now() + s.grace;
        let mut empty_misses = 0_usize;
        let mut empty_cycles = 0_u32;
        let mut missing_chunks = 0_u32;
        let mut last_target: Option<BlockPos> = None;
        let mut last_success = Instant::now();

        info!(targets = len, "dig loop started");

        while !self.hooks.should_stop() {
            if self.hooks.is_paused() || self.hooks.is_returning() {
                tokio::time::sleep(s.paused_idle).await;
                last_success = Instant::now();
                continue;
            }

            let now = Instant::now();
            if now > grace_until && now.duration_since(last_success) >= s.stuck_threshold {
                warn!(
                    idle_secs = now.duration_since(last_success).as_secs(),
                    "stuck without a mined block, requesting reconnect"
                );
                self.hooks.request_recovery(RecoveryReason::Stuck);
                report.exit = LoopExit::Recovery(RecoveryReason::Stuck);
                return report;
            }
            if now.duration_since(last_success) >= s.restart_if_idle {
                warn!(
                    idle_secs = now.duration_since(last_success).as_secs(),
                    "no block mined for too long, requesting reconnect"
                );
                self.hooks.request_recovery(RecoveryReason::Idle);
                report.exit = LoopExit::Recovery(RecoveryReason::Idle);
                return report;
            }

            let target = self.targets[report.index];
            let block = if self.session.is_chunk_loaded(target) {
                self.session.block_at(target)
            } else {
                None
            };

            let Some(block) = block else {
                if now > grace_until {
                    missing_chunks += 1;
                    if missing_chunks % s.warn_every == 0 {
                        warn!(cycles = missing_chunks, "target region not loaded");
                    }
                    if missing_chunks >= s.miss_threshold {
                        warn!("target region never loaded, requesting reconnect");
                        self.hooks.request_recovery(RecoveryReason::ChunksMissing);
                        report.exit = LoopExit::Recovery(RecoveryReason::ChunksMissing);
                        return report;
                    }
                }
                tokio::time::sleep(s.chunk_retry).await;
                continue;
            };

            if block.is_air() {
                report.index = (report.index + 1) % len;
                if now > grace_until {
                    empty_misses += 1;
                    if empty_misses >= len {
                        empty_cycles += 1;
                        if empty_cycles % s.warn_every == 0 {
                            warn!(cycles = empty_cycles, "no blocks left in the target list");
                        }
                        if empty_cycles >= s.miss_threshold {
                            warn!("targets empty for too long, requesting reconnect");
                            self.hooks.request_recovery(RecoveryReason::TargetsEmpty);
                            report.exit = LoopExit::Recovery(RecoveryReason::TargetsEmpty);
                            return report;
                        }
                        empty_misses = 0;
                    }
                }
                tokio::time::sleep(MIN_STEP).await;
                continue;
            }

            empty_misses = 0;
            empty_cycles = 0;
            missing_chunks = 0;

            match self.dig_once(target, &mut last_target).await {
                Ok(true) => {
                    last_success = Instant::now();
                    report.mined += 1;
                    self.hooks.on_block_mined(target);
                }
                Ok(false) => {
                    debug!(%target, "target out of reach");
                    report.index = (report.index + 1) % len;
                    tokio::time::sleep(MIN_STEP).await;
                    continue;
                }
                Err(err) if err.is_recoverable() => debug!(%target, %err, "dig skipped"),
                Err(err) => warn!(%target, %err, "dig failed"),
            }
            report.index = (report.index + 1) % len;

            if s.dig_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(s.dig_delay).await;
            }
        }

        debug!(mined = report.mined, "dig loop stopped");
        report
    }

    /// Face, check reach, equip and dig. `Ok(false)` when out of reach.
    async fn dig_once(
        &self,
        target: BlockPos,
        last_target: &mut Option<BlockPos>,
    ) -> Result<bool, ActionError> {
        if *last_target != Some(target) {
            self.session.look_at(target.center()).await?;
            *last_target = Some(target);
        }

        let Some(entity) = self.session.entity() else {
            return Ok(false);
        };
        if entity.position.distance_to(target.as_vec3()) > self.settings.reach {
            return Ok(false);
        }

        let inventory = self.session.inventory();
        if let Some(tool) = best_tool(&inventory) {
            if self.session.held_item().as_ref() != Some(tool) {
                self.session.equip(tool.clone()).await?;
            }
        }

        self.session.dig(target).await?;
        Ok(true)
    }
}
