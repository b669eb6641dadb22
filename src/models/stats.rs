//! Aggregated mining statistics owned by the fleet manager.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use super::status::BotStatus;

/// Window used for the blocks-per-minute rate.
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Running counters for one identity.
#[derive(Debug, Clone)]
pub struct BotStats {
    /// Last reported status.
    pub status: BotStatus,
    /// Blocks mined since start or the last stats reset.
    pub blocks_total: u64,
    /// Time of the most recent mined block (or of first registration).
    pub last_block_at: Instant,
    block_times: VecDeque<Instant>,
}

impl BotStats {
    fn new(status: BotStatus, now: Instant) -> Self {
        Self {
            status,
            blocks_total: 0,
            last_block_at: now,
            block_times: VecDeque::new(),
        }
    }

    fn record_block(&mut self, now: Instant) {
        self.blocks_total += 1;
        self.last_block_at = now;
        self.block_times.push_back(now);
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while self
            .block_times
            .front()
            .is_some_and(|t| now.duration_since(*t) >= RATE_WINDOW)
        {
            self.block_times.pop_front();
        }
    }

    /// Blocks mined within the last minute.
    #[must_use]
    pub fn blocks_last_minute(&self, now: Instant) -> usize {
        self.block_times
            .iter()
            .filter(|t| now.duration_since(**t) < RATE_WINDOW)
            .count()
    }
}

/// Fleet-wide aggregation of per-identity status and counters.
#[derive(Debug)]
pub struct FleetStats {
    bots: BTreeMap<String, BotStats>,
    total_blocks: u64,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    run_id: Uuid,
}

impl FleetStats {
    /// Start an empty aggregation at `now`.
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            bots: BTreeMap::new(),
            total_blocks: 0,
            started_at: now,
            started_wall: Utc::now(),
            run_id: Uuid::new_v4(),
        }
    }

    /// Record a status transition, optionally counting a mined block.
    pub fn update(&mut self, username: &str, status: BotStatus, block_mined: bool, now: Instant) {
        let bot = self
            .bots
            .entry(username.to_owned())
            .or_insert_with(|| BotStats::new(status, now));
        bot.status = status;
        if block_mined {
            bot.record_block(now);
            self.total_blocks += 1;
        }
    }

    /// Flip mining identities between `Mining` and `Paused` display states.
    pub fn apply_pause(&mut self, paused: bool) {
        for bot in self.bots.values_mut() {
            if matches!(bot.status, BotStatus::Mining | BotStatus::Paused) {
                bot.status = if paused {
                    BotStatus::Paused
                } else {
                    BotStatus::Mining
                };
            }
        }
    }

    /// Zero cumulative block counters (rate windows are kept).
    pub fn reset_counts(&mut self) {
        self.total_blocks = 0;
        for bot in self.bots.values_mut() {
            bot.blocks_total = 0;
        }
    }

    /// Counters for a single identity.
    #[must_use]
    pub fn get(&self, username: &str) -> Option<&BotStats> {
        self.bots.get(username)
    }

    /// Total blocks across the fleet.
    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Build a serializable snapshot.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self, now: Instant, paused: bool) -> FleetSnapshot {
        let uptime = now.duration_since(self.started_at);
        let hours = uptime.as_secs_f64() / 3600.0;
        let blocks_per_hour = if hours > 0.0 {
            self.total_blocks as f64 / hours
        } else {
            0.0
        };

        let bots: Vec<BotSnapshot> = self
            .bots
            .iter()
            .map(|(username, bot)| BotSnapshot {
                username: username.clone(),
                status: bot.status,
                blocks_total: bot.blocks_total,
                blocks_last_minute: bot.blocks_last_minute(now),
                seconds_since_last_block: now.duration_since(bot.last_block_at).as_secs(),
            })
            .collect();

        FleetSnapshot {
            timestamp: Utc::now(),
            run_id: self.run_id,
            started_at: self.started_wall,
            uptime_seconds: uptime.as_secs(),
            paused,
            active_bots: bots.iter().filter(|b| b.status == BotStatus::Mining).count(),
            total_bots: bots.len(),
            total_blocks: self.total_blocks,
            blocks_per_hour,
            bots,
        }
    }
}

/// Point-in-time view of one identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotSnapshot {
    /// Identity name.
    pub username: String,
    /// Last reported status.
    pub status: BotStatus,
    /// Cumulative mined blocks.
    pub blocks_total: u64,
    /// Blocks mined in the last minute.
    pub blocks_last_minute: usize,
    /// Seconds since the last mined block.
    pub seconds_since_last_block: u64,
}

/// Point-in-time view of the whole fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetSnapshot {
    /// Wall-clock time of the snapshot.
    pub timestamp: DateTime<Utc>,
    /// Identifier of this process run.
    pub run_id: Uuid,
    /// Wall-clock start of the run.
    pub started_at: DateTime<Utc>,
    /// Seconds since start.
    pub uptime_seconds: u64,
    /// Whether the fleet-wide pause flag is set.
    pub paused: bool,
    /// Identities currently mining.
    pub active_bots: usize,
    /// Identities that have reported at least once.
    pub total_bots: usize,
    /// Blocks mined since start or last reset.
    pub total_blocks: u64,
    /// Average mining rate since start.
    pub blocks_per_hour: f64,
    /// Per-identity details.
    pub bots: Vec<BotSnapshot>,
}
