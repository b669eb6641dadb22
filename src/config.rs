//! Fleet configuration parsing and validation.
//!
//! Every section except `[server]` and `[[bots]]` is optional; missing keys
//! fall back to the defaults below. Validation collects every violation
//! before failing so the operator can fix the file in one pass.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::geometry::{BlockPos, Vec3};
use crate::{AppError, Result};

/// Remote server address and credentials.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct ServerConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Protocol version string passed to the client.
    pub version: String,
    /// Password sent in reply to the login prompt.
    pub password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 25565,
            version: String::new(),
            password: String::new(),
        }
    }
}

/// Delays and intervals for instance and fleet supervision (milliseconds).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct TimingConfig {
    /// Pause between dig loop iterations; 0 yields only.
    pub dig_delay_ms: u64,
    /// Dig loop requests recovery after this long without a mined block.
    pub restart_if_idle_ms: u64,
    /// After the dig grace, a stretch this long without a mined block counts
    /// as stuck.
    pub stuck_threshold_ms: u64,
    /// Base reconnect delay, restored after a clean join.
    pub reconnect_regular_ms: u64,
    /// Window after spawn during which non-forced reconnects are deferred.
    pub grace_after_spawn_ms: u64,
    /// Per-index startup stagger.
    pub start_stagger_ms: u64,
    /// Random extra startup delay.
    pub start_stagger_jitter_ms: u64,
    /// Period of planned fleet rotation.
    pub periodic_rejoin_ms: u64,
    /// Pause between two rotated identities.
    pub rotation_delay_between_bots_ms: u64,
    /// Pause between tearing an identity down and rebuilding it during rotation.
    pub rotation_settle_ms: u64,
    /// Proactive restart interval for a joined session.
    pub preventive_restart_ms: u64,
    /// Keep-alive watchdog poll period.
    pub keep_alive_check_ms: u64,
    /// Silence after which the watchdog warns.
    pub keep_alive_warn_ms: u64,
    /// Silence after which the watchdog forces a reconnect.
    pub keep_alive_timeout_ms: u64,
    /// Delay used for watchdog-driven reconnects.
    pub keep_alive_reconnect_ms: u64,
    /// Connect timeout passed to the client.
    pub connect_timeout_ms: u64,
    /// Client keep-alive interval.
    pub keep_alive_interval_ms: u64,
    /// Client-side timeout check interval.
    pub check_timeout_interval_ms: u64,
    /// Offline identities with no block for this long are force-restarted.
    pub stuck_offline_ms: u64,
    /// Period of the stuck-offline sweep.
    pub stuck_sweep_interval_ms: u64,
    /// Period of the statistics snapshot.
    pub snapshot_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            dig_delay_ms: 0,
            restart_if_idle_ms: 120_000,
            stuck_threshold_ms: 30_000,
            reconnect_regular_ms: 15_000,
            grace_after_spawn_ms: 20_000,
            start_stagger_ms: 20_000,
            start_stagger_jitter_ms: 10_000,
            periodic_rejoin_ms: 3_600_000,
            rotation_delay_between_bots_ms: 120_000,
            rotation_settle_ms: 5_000,
            preventive_restart_ms: 3_600_000,
            keep_alive_check_ms: 5_000,
            keep_alive_warn_ms: 25_000,
            keep_alive_timeout_ms: 28_000,
            keep_alive_reconnect_ms: 5_000,
            connect_timeout_ms: 120_000,
            keep_alive_interval_ms: 15_000,
            check_timeout_interval_ms: 90_000,
            stuck_offline_ms: 300_000,
            stuck_sweep_interval_ms: 120_000,
            snapshot_interval_ms: 300_000,
        }
    }
}

/// Anti-automation probe handling.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct AntibotConfig {
    /// Without a probe message, the bypass is considered satisfied after this.
    pub probe_wait_ms: u64,
    /// Hard ceiling after which a running bypass resolves as passed.
    pub ceiling_ms: u64,
    /// After a probe resolves, join without the server message after this.
    pub auto_join_ms: u64,
    /// Minimum altitude drop counted as a pass.
    pub fall_threshold: f64,
}

impl Default for AntibotConfig {
    fn default() -> Self {
        Self {
            probe_wait_ms: 8_000,
            ceiling_ms: 16_000,
            auto_join_ms: 5_000,
            fall_threshold: 0.3,
        }
    }
}

/// Server selector menu interaction.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct MenuConfig {
    /// First window slot clicked.
    pub slot1: u16,
    /// Second window slot clicked.
    pub slot2: u16,
    /// Hotbar slot holding the menu item.
    pub hotbar_slot: u8,
    /// Click attempts before giving up and reconnecting.
    pub max_attempts: u32,
    /// Lower bound of the retry period.
    pub retry_min_ms: u64,
    /// Upper bound of the retry period.
    pub retry_max_ms: u64,
    /// Minimum spacing between two window clicks.
    pub min_click_gap_ms: u64,
}

impl Default for MenuConfig {
    fn default() -> Self {
        Self {
            slot1: 10,
            slot2: 13,
            hotbar_slot: 0,
            max_attempts: 6,
            retry_min_ms: 3_000,
            retry_max_ms: 5_000,
            min_click_gap_ms: 900,
        }
    }
}

/// Fleet-level error budget.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct GlobalRestartConfig {
    /// Errors within the window that trigger a full restart.
    pub error_threshold: usize,
    /// Width of the global error window.
    pub time_window_ms: u64,
    /// Stop the process when connectivity loss persists.
    pub stop_on_no_internet: bool,
    /// Connectivity errors within the window that stop the process.
    pub no_internet_threshold: usize,
    /// Width of the connectivity error window.
    pub no_internet_window_ms: u64,
    /// Ignore connectivity errors entirely (flaky links).
    pub unstable_internet_mode: bool,
    /// Lower bound of the pause before a full restart starts the fleet again.
    pub restart_delay_min_ms: u64,
    /// Upper bound of that pause.
    pub restart_delay_max_ms: u64,
}

impl Default for GlobalRestartConfig {
    fn default() -> Self {
        Self {
            error_threshold: 15,
            time_window_ms: 600_000,
            stop_on_no_internet: false,
            no_internet_threshold: 8,
            no_internet_window_ms: 120_000,
            unstable_internet_mode: true,
            restart_delay_min_ms: 2_000,
            restart_delay_max_ms: 6_000,
        }
    }
}

/// Stand-position supervision.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct PositionConfig {
    /// Period of the drift check.
    pub check_interval_ms: u64,
    /// Give up walking back after this long.
    pub return_timeout_ms: u64,
    /// Delay after join before drift checks start.
    pub settle_delay_ms: u64,
    /// Distances above this mean the server moved the entity to spawn.
    pub teleport_distance: f64,
    /// Walking back stops within this distance.
    pub arrive_distance: f64,
    /// Allowed drift when the identity does not set one.
    pub default_max_distance: f64,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 10_000,
            return_timeout_ms: 8_000,
            settle_delay_ms: 30_000,
            teleport_distance: 500.0,
            arrive_distance: 0.8,
            default_max_distance: 0.6,
        }
    }
}

/// Dig loop tuning.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct TaskConfig {
    /// Maximum distance to a target that can be dug.
    pub reach: f64,
    /// Empty and missing-chunk cycles are not counted during this window.
    pub grace_ms: u64,
    /// Consecutive missed cycles before recovery is requested.
    pub miss_threshold: u32,
    /// Log a warning every this many missed cycles.
    pub warn_every: u32,
    /// Idle step while paused or returning.
    pub paused_idle_ms: u64,
    /// Idle step while the target region is not loaded.
    pub chunk_retry_ms: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            reach: 4.8,
            grace_ms: 15_000,
            miss_threshold: 30,
            warn_every: 10,
            paused_idle_ms: 50,
            chunk_retry_ms: 200,
        }
    }
}

/// Inclusive-exclusive random delay range.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DelayRange {
    /// Lower bound.
    pub min_ms: u64,
    /// Upper bound.
    pub max_ms: u64,
}

impl DelayRange {
    /// Construct a range.
    #[must_use]
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }
}

/// Reconnect delays per disconnect cause.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct BackoffConfig {
    /// First rate-limit delay.
    pub rate_limit_base_ms: u64,
    /// Added per repeated rate-limit kick.
    pub rate_limit_step_ms: u64,
    /// Upper bound before jitter.
    pub rate_limit_cap_ms: u64,
    /// Random extra on top of the rate-limit delay.
    pub rate_limit_jitter_ms: u64,
    /// "Logging in too fast" kicks.
    pub too_fast: DelayRange,
    /// Anti-bot kicks reporting an exceeded limit.
    pub antibot_failed: DelayRange,
    /// Other anti-bot kicks.
    pub antibot_other: DelayRange,
    /// "Already connected" kicks.
    pub already_connected: DelayRange,
    /// Unclassified kicks.
    pub kick: DelayRange,
    /// Clean connection end.
    pub end: DelayRange,
    /// Unclassified client errors.
    pub error: DelayRange,
    /// Failures while connecting.
    pub connect_failed: DelayRange,
    /// Client keep-alive timeouts.
    pub client_timeout: DelayRange,
    /// DNS failures and unreachable hosts.
    pub no_network: DelayRange,
    /// Other transient network faults.
    pub network: DelayRange,
    /// Menu attempts exhausted.
    pub menu_exhausted: DelayRange,
    /// Preventive restart.
    pub preventive: DelayRange,
    /// Reconnect after a teleport to spawn.
    pub teleport_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            rate_limit_base_ms: 600_000,
            rate_limit_step_ms: 300_000,
            rate_limit_cap_ms: 1_800_000,
            rate_limit_jitter_ms: 60_000,
            too_fast: DelayRange::new(300_000, 600_000),
            antibot_failed: DelayRange::new(15_000, 30_000),
            antibot_other: DelayRange::new(8_000, 20_000),
            already_connected: DelayRange::new(45_000, 90_000),
            kick: DelayRange::new(10_000, 20_000),
            end: DelayRange::new(8_000, 20_000),
            error: DelayRange::new(15_000, 30_000),
            connect_failed: DelayRange::new(15_000, 30_000),
            client_timeout: DelayRange::new(20_000, 40_000),
            no_network: DelayRange::new(20_000, 40_000),
            network: DelayRange::new(8_000, 20_000),
            menu_exhausted: DelayRange::new(60_000, 180_000),
            preventive: DelayRange::new(5_000, 10_000),
            teleport_ms: 3_000,
        }
    }
}

fn phrases(list: &[&str]) -> Vec<String> {
    list.iter().map(|p| (*p).to_owned()).collect()
}

/// Phrase tables for server text classification (matched lowercase).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct PhraseConfig {
    /// Login prompt.
    pub login_prompt: Vec<String>,
    /// Session resumed without a password or probe.
    pub quick_login: Vec<String>,
    /// Probe announcement subject (one must match).
    pub probe_subject: Vec<String>,
    /// Probe instruction (one must match together with a subject).
    pub probe_action: Vec<String>,
    /// Entered the target instance.
    pub joined: Vec<String>,
    /// Rate-limit kicks.
    pub rate_limited: Vec<String>,
    /// Logging in too fast.
    pub too_fast: Vec<String>,
    /// Anti-bot kicks.
    pub antibot: Vec<String>,
    /// Anti-bot kicks reporting an exceeded limit.
    pub antibot_exceeded: Vec<String>,
    /// Duplicate login.
    pub already_connected: Vec<String>,
    /// Client error messages that are library noise.
    pub noise: Vec<String>,
}

impl Default for PhraseConfig {
    fn default() -> Self {
        Self {
            login_prompt: phrases(&["/login", "авторизация"]),
            quick_login: phrases(&[
                "вы недавно входили",
                "ввод пароля не требуется",
                "you recently logged in",
            ]),
            probe_subject: phrases(&["сканер", "scanner"]),
            probe_action: phrases(&["дождитесь", "не двигайтесь", "please wait", "don't move"]),
            joined: phrases(&["отслеживается", "entered instance"]),
            rate_limited: phrases(&["подождите", "wait", "перед повторным"]),
            too_fast: phrases(&["you are logging in too fast", "logging too"]),
            antibot: phrases(&["antibot", "антибот"]),
            antibot_exceeded: phrases(&["превысили", "превышение", "exceeded"]),
            already_connected: phrases(&["already connected"]),
            noise: phrases(&[
                "ignoring block entities",
                "chunk failed to load",
                "deprecated",
            ]),
        }
    }
}

/// Feature toggles.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct FeatureConfig {
    /// Answer the probe with a simulated fall instead of passive observation.
    pub active_fall_check: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            active_fall_check: true,
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set.
    pub level: String,
    /// Directory for the rolling log file and JSONL snapshots; disabled when absent.
    pub directory: Option<PathBuf>,
    /// File name prefix of the rolling log file.
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            directory: None,
            file_prefix: "digfleet.log".into(),
        }
    }
}

/// Local control socket.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct IpcConfig {
    /// Whether the control socket is started.
    pub enabled: bool,
    /// Named pipe / Unix socket identifier.
    pub name: String,
    /// Shared secret required from `digfleet-ctl` when set.
    pub auth_token: Option<String>,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "digfleet".into(),
            auth_token: None,
        }
    }
}

/// Behaviour of the built-in simulated server.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct SimulationConfig {
    /// Time between connect and spawn.
    pub spawn_delay_ms: u64,
    /// Send a login prompt after spawn.
    pub login_prompt: bool,
    /// Send a probe announcement after spawn.
    pub probe: bool,
    /// Open the selector window when the menu item is used.
    pub menu_window: bool,
    /// Send the join message after the second menu slot is clicked.
    pub join_on_menu: bool,
    /// Keep-alive period.
    pub keep_alive_ms: u64,
    /// Time a dig takes.
    pub dig_ms: u64,
    /// Time until a mined block reappears.
    pub block_regen_ms: u64,
    /// Kick every session after this long, if set.
    pub kick_after_ms: Option<u64>,
    /// Reason used for those kicks.
    pub kick_reason: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            spawn_delay_ms: 500,
            login_prompt: true,
            probe: false,
            menu_window: true,
            join_on_menu: true,
            keep_alive_ms: 10_000,
            dig_ms: 250,
            block_regen_ms: 0,
            kick_after_ms: None,
            kick_reason: "Server restarting".into(),
        }
    }
}

/// One bot identity.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct IdentityConfig {
    /// Account name.
    #[serde(default)]
    pub username: String,
    /// Ordered dig targets.
    #[serde(default)]
    pub blocks: Vec<BlockPos>,
    /// Position the identity should hold while mining.
    #[serde(default)]
    pub stand_position: Option<Vec3>,
    /// Allowed drift from the stand position.
    #[serde(default)]
    pub max_distance_from_stand: Option<f64>,
    /// Per-identity override of `menu.slot1`.
    #[serde(default)]
    pub menu_slot1: Option<u16>,
    /// Per-identity override of `menu.slot2`.
    #[serde(default)]
    pub menu_slot2: Option<u16>,
}

impl IdentityConfig {
    /// Construct an identity with targets and no stand position.
    #[must_use]
    pub fn new(username: impl Into<String>, blocks: Vec<BlockPos>) -> Self {
        Self {
            username: username.into(),
            blocks,
            stand_position: None,
            max_distance_from_stand: None,
            menu_slot1: None,
            menu_slot2: None,
        }
    }

    /// Allowed drift, falling back to the fleet default.
    #[must_use]
    pub fn max_distance(&self, position: &PositionConfig) -> f64 {
        self.max_distance_from_stand
            .unwrap_or(position.default_max_distance)
    }

    /// Menu slots after applying per-identity overrides.
    #[must_use]
    pub fn menu_slots(&self, menu: &MenuConfig) -> (u16, u16) {
        (
            self.menu_slot1.unwrap_or(menu.slot1),
            self.menu_slot2.unwrap_or(menu.slot2),
        )
    }
}

/// Root configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct FleetConfig {
    /// Server connectivity.
    #[serde(default)]
    pub server: ServerConfig,
    /// Delays and intervals.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Probe handling.
    #[serde(default)]
    pub antibot: AntibotConfig,
    /// Menu interaction.
    #[serde(default)]
    pub menu: MenuConfig,
    /// Fleet error budget.
    #[serde(default)]
    pub global_restart: GlobalRestartConfig,
    /// Drift supervision.
    #[serde(default)]
    pub position: PositionConfig,
    /// Dig loop tuning.
    #[serde(default)]
    pub task: TaskConfig,
    /// Reconnect delays.
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Text classification tables.
    #[serde(default)]
    pub phrases: PhraseConfig,
    /// Feature toggles.
    #[serde(default)]
    pub features: FeatureConfig,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Control socket.
    #[serde(default)]
    pub ipc: IpcConfig,
    /// Simulated server behaviour.
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Bot identities, started in this order.
    #[serde(default)]
    pub bots: Vec<IdentityConfig>,
}

impl FleetConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            AppError::Config(format!("failed to read config {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing fails or any field is invalid;
    /// the message lists every violation.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Fail with every violation listed if the configuration is unusable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming each invalid field.
    pub fn validate(&self) -> Result<()> {
        let violations = self.violations();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(AppError::Config(format!(
                "invalid configuration: {}",
                violations.join("; ")
            )))
        }
    }

    /// Every validation failure in the configuration, in file order.
    #[must_use]
    pub fn violations(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.server.host.trim().is_empty() {
            errors.push("server.host is required".to_owned());
        }
        if self.server.version.trim().is_empty() {
            errors.push("server.version is required".to_owned());
        }
        if self.server.password.is_empty() {
            errors.push("server.password is required".to_owned());
        }
        if self.menu.max_attempts == 0 {
            errors.push("menu.max_attempts must be greater than zero".to_owned());
        }
        if self.menu.retry_min_ms > self.menu.retry_max_ms {
            errors.push("menu.retry_min_ms must not exceed menu.retry_max_ms".to_owned());
        }
        if self.global_restart.error_threshold == 0 {
            errors.push("global_restart.error_threshold must be greater than zero".to_owned());
        }
        if self.global_restart.no_internet_threshold == 0 {
            errors.push(
                "global_restart.no_internet_threshold must be greater than zero".to_owned(),
            );
        }
        if self.task.miss_threshold == 0 {
            errors.push("task.miss_threshold must be greater than zero".to_owned());
        }
        let t = &self.timing;
        if [
            t.keep_alive_check_ms,
            t.stuck_threshold_ms,
            t.periodic_rejoin_ms,
            t.stuck_sweep_interval_ms,
            t.snapshot_interval_ms,
            self.position.check_interval_ms,
        ]
        .contains(&0)
        {
            errors.push("watchdog intervals must be greater than zero".to_owned());
        }

        if self.bots.is_empty() {
            errors.push("bots must be a non-empty list".to_owned());
        }
        let mut seen = HashSet::new();
        for (index, bot) in self.bots.iter().enumerate() {
            if bot.username.trim().is_empty() {
                errors.push(format!("bots[{index}].username is required"));
            } else if !seen.insert(bot.username.as_str()) {
                errors.push(format!(
                    "bots[{index}].username '{}' is duplicated",
                    bot.username
                ));
            }
            if bot.blocks.is_empty() {
                errors.push(format!("bots[{index}].blocks must be a non-empty list"));
            }
            if bot.max_distance_from_stand.is_some_and(|d| d <= 0.0) {
                errors.push(format!(
                    "bots[{index}].max_distance_from_stand must be positive"
                ));
            }
        }

        errors
    }

    /// Identity by username.
    #[must_use]
    pub fn identity(&self, username: &str) -> Option<&IdentityConfig> {
        self.bots.iter().find(|b| b.username == username)
    }
}

/// Milliseconds to [`Duration`].
#[must_use]
pub const fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// [`Duration`] to whole milliseconds, saturating.
#[must_use]
pub fn millis(value: Duration) -> u64 {
    u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
}
