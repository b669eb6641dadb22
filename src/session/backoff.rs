//! Reconnect delay policy.
//!
//! Pure functions of the disconnect cause, the rate-limit streak and a
//! caller-supplied RNG, so the escalation can be tested deterministically.

use std::time::Duration;

use rand::Rng;

use super::signals::{ErrorClass, KickClass};
use crate::config::{BackoffConfig, DelayRange};

/// Uniform random duration in `[min_ms, max_ms)`; `min_ms` when the range is empty.
pub fn jitter<R: Rng + ?Sized>(rng: &mut R, min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(rng.gen_range(min_ms..max_ms))
}

/// Sample a configured range.
pub fn sample<R: Rng + ?Sized>(rng: &mut R, range: DelayRange) -> Duration {
    jitter(rng, range.min_ms, range.max_ms)
}

/// Maps disconnect causes to reconnect delays.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    /// Policy over the configured ranges.
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Rate-limit delay before jitter for the `streak`-th consecutive kick.
    #[must_use]
    pub fn rate_limit_base(&self, streak: u32) -> Duration {
        let c = &self.config;
        let steps = u64::from(streak.saturating_sub(1));
        let ms = c
            .rate_limit_base_ms
            .saturating_add(steps.saturating_mul(c.rate_limit_step_ms))
            .min(c.rate_limit_cap_ms);
        Duration::from_millis(ms)
    }

    /// Full rate-limit delay including jitter.
    pub fn rate_limit<R: Rng + ?Sized>(&self, streak: u32, rng: &mut R) -> Duration {
        self.rate_limit_base(streak) + jitter(rng, 0, self.config.rate_limit_jitter_ms)
    }

    /// Delay after a kick. `streak` must already include this kick when the
    /// class is [`KickClass::RateLimited`].
    pub fn after_kick<R: Rng + ?Sized>(&self, class: KickClass, streak: u32, rng: &mut R) -> Duration {
        let c = &self.config;
        match class {
            KickClass::RateLimited => self.rate_limit(streak, rng),
            KickClass::TooFast => sample(rng, c.too_fast),
            KickClass::AntibotFailed => sample(rng, c.antibot_failed),
            KickClass::AntibotRejected => sample(rng, c.antibot_other),
            KickClass::AlreadyConnected => sample(rng, c.already_connected),
            KickClass::Other => sample(rng, c.kick),
        }
    }

    /// Delay after a client error; `None` for ignored noise.
    pub fn after_error<R: Rng + ?Sized>(&self, class: ErrorClass, rng: &mut R) -> Option<Duration> {
        let c = &self.config;
        let range = match class {
            ErrorClass::Noise => return None,
            ErrorClass::NoNetwork => c.no_network,
            ErrorClass::Network => c.network,
            ErrorClass::ConnectFailed => c.connect_failed,
            ErrorClass::ClientTimeout => c.client_timeout,
            ErrorClass::Other => c.error,
        };
        Some(sample(rng, range))
    }

    /// Delay after a clean connection end.
    pub fn after_end<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        sample(rng, self.config.end)
    }

    /// Delay after the menu attempts ran out.
    pub fn after_menu_exhausted<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        sample(rng, self.config.menu_exhausted)
    }

    /// Delay for the preventive restart.
    pub fn preventive<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        sample(rng, self.config.preventive)
    }

    /// Delay for the reconnect after a teleport to spawn.
    #[must_use]
    pub fn after_teleport(&self) -> Duration {
        Duration::from_millis(self.config.teleport_ms)
    }
}
