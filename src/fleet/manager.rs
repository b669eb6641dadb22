//! Fleet manager actor.
//!
//! The manager exclusively owns fleet-wide state: one slot per identity,
//! aggregated statistics, the error windows and the pause, rotation and
//! restart flags. Instances report through [`FleetEvent`]s; operators drive
//! it through a cloneable [`FleetControl`]. Delayed work (staggered start,
//! scheduled installs, rotation steps) is posted back to the actor as
//! internal messages so every slot write happens on the actor task.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::snapshot::SnapshotWriter;
use super::window::ErrorWindow;
use crate::client::Connector;
use crate::config::{millis, ms, FleetConfig, IdentityConfig};
use crate::models::stats::{FleetSnapshot, FleetStats};
use crate::models::status::BotStatus;
use crate::session::backoff::jitter;
use crate::session::{
    Carry, FleetEvent, FleetHooks, Generation, InstanceContext, InstanceHandle, SessionInstance,
};
use crate::{AppError, Result};

/// Capacity of the control command channel.
const COMMAND_BUFFER: usize = 32;

/// Requests accepted by the fleet actor.
#[derive(Debug)]
pub enum FleetCommand {
    /// Current statistics.
    Status(oneshot::Sender<FleetSnapshot>),
    /// Flip the pause flag; replies with the new value.
    TogglePause(oneshot::Sender<bool>),
    /// Set the pause flag; replies with the new value.
    SetPause(bool, oneshot::Sender<bool>),
    /// Manual full restart; replies `false` if one is already running.
    Restart(oneshot::Sender<bool>),
    /// Rotate all online identities; replies `false` if already rotating.
    Rotate(oneshot::Sender<bool>),
    /// Zero cumulative counters.
    ResetStats(oneshot::Sender<()>),
    /// Stop every instance and exit the actor.
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable client for the fleet actor.
#[derive(Debug, Clone)]
pub struct FleetControl {
    tx: mpsc::Sender<FleetCommand>,
}

impl FleetControl {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> FleetCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| AppError::Shutdown("fleet manager stopped".into()))?;
        rx.await
            .map_err(|_| AppError::Shutdown("fleet manager dropped the request".into()))
    }

    /// Current statistics.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Shutdown`] once the actor has exited.
    pub async fn status(&self) -> Result<FleetSnapshot> {
        self.request(FleetCommand::Status).await
    }

    /// Flip the pause flag and return the new value.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Shutdown`] once the actor has exited.
    pub async fn toggle_pause(&self) -> Result<bool> {
        self.request(FleetCommand::TogglePause).await
    }

    /// Set the pause flag.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Shutdown`] once the actor has exited.
    pub async fn set_paused(&self, paused: bool) -> Result<bool> {
        self.request(|reply| FleetCommand::SetPause(paused, reply)).await
    }

    /// Restart every instance; `false` if a restart is already running.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Shutdown`] once the actor has exited.
    pub async fn restart(&self) -> Result<bool> {
        self.request(FleetCommand::Restart).await
    }

    /// Start a rotation; `false` if one is already running.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Shutdown`] once the actor has exited.
    pub async fn rotate(&self) -> Result<bool> {
        self.request(FleetCommand::Rotate).await
    }

    /// Zero cumulative counters.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Shutdown`] once the actor has exited.
    pub async fn reset_stats(&self) -> Result<()> {
        self.request(FleetCommand::ResetStats).await
    }

    /// Stop the fleet and wait for the actor to acknowledge.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Shutdown`] once the actor has exited.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(FleetCommand::Shutdown).await
    }
}

/// Deferred work posted back to the actor.
#[derive(Debug)]
enum Internal {
    Install {
        username: String,
        generation: u64,
        carry: Carry,
    },
    RestartReady,
    RotateNext,
}

/// One identity's registry entry.
struct Slot {
    identity: Arc<IdentityConfig>,
    cell: Arc<AtomicU64>,
    handle: Option<InstanceHandle>,
}

impl Slot {
    fn current(&self) -> u64 {
        self.cell.load(Ordering::SeqCst)
    }

    /// Invalidate whatever generation owns the slot and return a fresh one.
    fn reserve(&self) -> u64 {
        self.cell.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Owner of every session instance.
pub struct FleetManager {
    config: Arc<FleetConfig>,
    connector: Arc<dyn Connector>,
    slots: BTreeMap<String, Slot>,
    order: Vec<String>,
    stats: FleetStats,
    global_errors: ErrorWindow,
    no_internet_errors: ErrorWindow,
    paused: Arc<AtomicBool>,
    restarting: bool,
    rotation: Option<VecDeque<String>>,
    stopping: bool,
    exit: Option<Result<()>>,
    snapshots: Option<SnapshotWriter>,
    rng: StdRng,
    cancel: CancellationToken,
    events_tx: mpsc::UnboundedSender<FleetEvent>,
    events_rx: mpsc::UnboundedReceiver<FleetEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    commands: mpsc::Receiver<FleetCommand>,
}

impl FleetManager {
    /// Build the actor and its control handle. Nothing runs until [`run`](Self::run).
    #[must_use]
    pub fn new(
        config: Arc<FleetConfig>,
        connector: Arc<dyn Connector>,
        cancel: CancellationToken,
    ) -> (Self, FleetControl) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);

        let mut slots = BTreeMap::new();
        let mut order = Vec::with_capacity(config.bots.len());
        for identity in &config.bots {
            order.push(identity.username.clone());
            slots.insert(
                identity.username.clone(),
                Slot {
                    identity: Arc::new(identity.clone()),
                    cell: Arc::new(AtomicU64::new(0)),
                    handle: None,
                },
            );
        }

        let restart = &config.global_restart;
        let manager = Self {
            global_errors: ErrorWindow::new(ms(restart.time_window_ms), restart.error_threshold),
            no_internet_errors: ErrorWindow::new(
                ms(restart.no_internet_window_ms),
                restart.no_internet_threshold,
            ),
            stats: FleetStats::new(Instant::now()),
            connector,
            slots,
            order,
            paused: Arc::new(AtomicBool::new(false)),
            restarting: false,
            rotation: None,
            stopping: false,
            exit: None,
            snapshots: None,
            rng: StdRng::from_entropy(),
            cancel,
            events_tx,
            events_rx,
            internal_tx,
            internal_rx,
            commands,
            config,
        };
        (manager, FleetControl { tx: command_tx })
    }

    /// Append periodic snapshots through `writer`.
    #[must_use]
    pub fn with_snapshots(mut self, writer: SnapshotWriter) -> Self {
        self.snapshots = Some(writer);
        self
    }

    /// Seed the manager's jitter source.
    #[must_use]
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    /// Run the actor until cancelled, shut down, or stopped by connectivity loss.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ConnectivityLost`] when `stop_on_no_internet` is
    /// set and the no-network threshold is reached.
    pub async fn run(mut self) -> Result<()> {
        info!(bots = self.order.len(), "fleet starting");
        self.start_all();

        let timing = &self.config.timing;
        let mut rejoin = periodic(ms(timing.periodic_rejoin_ms));
        let mut sweep = periodic(ms(timing.stuck_sweep_interval_ms));
        let mut snapshot = periodic(ms(timing.snapshot_interval_ms));

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.shutdown().await;
                    break;
                }
                Some(command) = self.commands.recv() => self.on_command(command).await,
                Some(event) = self.events_rx.recv() => self.on_event(event).await,
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal).await,
                _ = rejoin.tick() => {
                    self.rotate_all();
                }
                _ = sweep.tick() => self.sweep_stuck().await,
                _ = snapshot.tick() => self.write_snapshot(),
            }
            if let Some(exit) = self.exit.take() {
                return exit;
            }
        }
        Ok(())
    }

    // ── Control ─────────────────────────────────────────

    async fn on_command(&mut self, command: FleetCommand) {
        match command {
            FleetCommand::Status(reply) => {
                let _ = reply.send(self.snapshot());
            }
            FleetCommand::TogglePause(reply) => {
                let paused = !self.paused.load(Ordering::SeqCst);
                self.set_paused(paused);
                let _ = reply.send(paused);
            }
            FleetCommand::SetPause(paused, reply) => {
                self.set_paused(paused);
                let _ = reply.send(paused);
            }
            FleetCommand::Restart(reply) => {
                let started = self.full_restart("manual restart").await;
                let _ = reply.send(started);
            }
            FleetCommand::Rotate(reply) => {
                let _ = reply.send(self.rotate_all());
            }
            FleetCommand::ResetStats(reply) => {
                self.stats.reset_counts();
                info!("statistics reset");
                let _ = reply.send(());
            }
            FleetCommand::Shutdown(reply) => {
                self.shutdown().await;
                self.exit = Some(Ok(()));
                let _ = reply.send(());
            }
        }
    }

    fn set_paused(&mut self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        self.stats.apply_pause(paused);
        if paused {
            info!("fleet paused");
        } else {
            info!("fleet resumed");
        }
    }

    fn snapshot(&self) -> FleetSnapshot {
        self.stats
            .snapshot(Instant::now(), self.paused.load(Ordering::SeqCst))
    }

    fn write_snapshot(&mut self) {
        let snapshot = self.snapshot();
        info!(
            uptime_secs = snapshot.uptime_seconds,
            active = snapshot.active_bots,
            total = snapshot.total_bots,
            blocks = snapshot.total_blocks,
            blocks_per_hour = snapshot.blocks_per_hour,
            "fleet snapshot"
        );
        for bot in &snapshot.bots {
            debug!(
                bot = %bot.username,
                status = %bot.status,
                blocks = bot.blocks_total,
                last_minute = bot.blocks_last_minute,
                "bot snapshot"
            );
        }
        if let Some(writer) = self.snapshots.as_mut() {
            if let Err(err) = writer.write(&snapshot) {
                warn!(%err, "snapshot not persisted");
            }
        }
    }

    // ── Instance events ─────────────────────────────────

    async fn on_event(&mut self, event: FleetEvent) {
        match event {
            FleetEvent::Status {
                username,
                generation,
                status,
                block_mined,
            } => {
                if !self.is_current(&username, generation) {
                    debug!(bot = %username, generation, "status from stale generation ignored");
                    return;
                }
                self.stats
                    .update(&username, status, block_mined, Instant::now());
            }
            FleetEvent::GlobalError { username, reason } => {
                self.note_global_error(&username, &reason).await;
            }
            FleetEvent::NoInternet { username, reason } => {
                self.note_no_internet(&username, &reason).await;
            }
            FleetEvent::ScheduleReconnect {
                username,
                generation,
                delay,
                carry,
            } => {
                if self.is_current(&username, generation) {
                    self.schedule_reconnect(&username, delay, carry).await;
                }
            }
            FleetEvent::Replace {
                username,
                generation,
                carry,
            } => {
                if !self.is_current(&username, generation) {
                    return;
                }
                let next = self.teardown(&username).await;
                if let Some(next) = next {
                    self.install(&username, next, carry);
                }
            }
        }
    }

    fn is_current(&self, username: &str, generation: u64) -> bool {
        self.slots
            .get(username)
            .is_some_and(|slot| slot.current() == generation)
    }

    async fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Install {
                username,
                generation,
                carry,
            } => self.install(&username, generation, carry),
            Internal::RestartReady => {
                self.restarting = false;
                if !self.stopping {
                    info!("restarting fleet");
                    self.start_all();
                }
            }
            Internal::RotateNext => self.rotate_next().await,
        }
    }

    /// Post `message` back to the actor after `delay`.
    fn after(&self, delay: Duration, message: Internal) {
        let tx = self.internal_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = tx.send(message);
                }
            }
        });
    }

    // ── Slot operations ─────────────────────────────────

    /// Construct and register an instance if `generation` still owns the slot.
    fn install(&mut self, username: &str, generation: u64, carry: Carry) {
        if self.stopping {
            return;
        }
        let Some(slot) = self.slots.get_mut(username) else {
            return;
        };
        if slot.current() != generation || slot.handle.is_some() {
            debug!(bot = %username, generation, "install superseded");
            return;
        }
        let hooks = FleetHooks::new(
            self.events_tx.clone(),
            username,
            Generation::new(Arc::clone(&slot.cell), generation),
        );
        let handle = SessionInstance::spawn(InstanceContext {
            identity: Arc::clone(&slot.identity),
            config: Arc::clone(&self.config),
            connector: Arc::clone(&self.connector),
            hooks,
            paused: Arc::clone(&self.paused),
            carry,
            cancel: self.cancel.clone(),
        });
        slot.handle = Some(handle);
        debug!(bot = %username, generation, "instance installed");
        self.stats
            .update(username, BotStatus::Connecting, false, Instant::now());
    }

    /// Invalidate the slot, wait for its instance to quit, and return the
    /// generation reserved for the successor.
    async fn teardown(&mut self, username: &str) -> Option<u64> {
        let slot = self.slots.get_mut(username)?;
        let next = slot.reserve();
        if let Some(handle) = slot.handle.take() {
            handle.shutdown().await;
        }
        Some(next)
    }

    /// Tear the named instance down and install a replacement after `delay`.
    async fn schedule_reconnect(&mut self, username: &str, delay: Duration, carry: Carry) {
        let Some(generation) = self.teardown(username).await else {
            warn!(bot = %username, "reconnect for unknown identity");
            return;
        };
        info!(bot = %username, delay_ms = millis(delay), "reconnect scheduled by fleet");
        self.stats
            .update(username, BotStatus::Waiting, false, Instant::now());
        self.after(
            delay,
            Internal::Install {
                username: username.to_owned(),
                generation,
                carry,
            },
        );
    }

    /// Stagger an install for every identity.
    fn start_all(&mut self) {
        let timing = &self.config.timing;
        let (stagger, spread) = (timing.start_stagger_ms, timing.start_stagger_jitter_ms);
        let mut planned = Vec::with_capacity(self.order.len());
        for (i, username) in self.order.iter().enumerate() {
            let Some(slot) = self.slots.get(username) else {
                continue;
            };
            let offset = jitter(&mut self.rng, 0, spread);
            let index = u64::try_from(i).unwrap_or(u64::MAX);
            let delay = ms(stagger.saturating_mul(index)) + offset;
            planned.push((username.clone(), slot.reserve(), delay));
        }
        for (username, generation, delay) in planned {
            debug!(bot = %username, delay_ms = millis(delay), "start planned");
            self.after(
                delay,
                Internal::Install {
                    username,
                    generation,
                    carry: Carry::default(),
                },
            );
        }
    }

    /// Invalidate and tear down every instance.
    async fn stop_all(&mut self) {
        let names = self.order.clone();
        for username in names {
            self.teardown(&username).await;
            self.stats
                .update(&username, BotStatus::Offline, false, Instant::now());
        }
    }

    async fn full_restart(&mut self, reason: &str) -> bool {
        if self.restarting || self.stopping {
            return false;
        }
        self.restarting = true;
        self.rotation = None;
        let span = info_span!("fleet_restart", reason);
        async {
            warn!("full fleet restart");
            self.global_errors.clear();
            self.stop_all().await;
            let restart = &self.config.global_restart;
            let delay = jitter(
                &mut self.rng,
                restart.restart_delay_min_ms,
                restart.restart_delay_max_ms,
            );
            self.after(delay, Internal::RestartReady);
        }
        .instrument(span)
        .await;
        true
    }

    async fn note_global_error(&mut self, username: &str, reason: &str) {
        let now = Instant::now();
        let tripped = self.global_errors.record(now);
        warn!(
            bot = %username,
            reason,
            threshold = self.config.global_restart.error_threshold,
            "global error"
        );
        if tripped {
            error!("too many errors, restarting every bot");
            self.full_restart("error threshold").await;
        }
    }

    async fn note_no_internet(&mut self, username: &str, reason: &str) {
        let config = Arc::clone(&self.config);
        let restart = &config.global_restart;
        if restart.stop_on_no_internet {
            warn!(bot = %username, reason, "no network");
            if self.no_internet_errors.record(Instant::now()) {
                error!("network unavailable for too long, stopping");
                self.stopping = true;
                self.stop_all().await;
                self.exit = Some(Err(AppError::ConnectivityLost(format!(
                    "{} network failures within {}s",
                    restart.no_internet_threshold,
                    restart.no_internet_window_ms / 1000
                ))));
            }
        } else if restart.unstable_internet_mode {
            debug!(bot = %username, reason, "network error ignored in unstable mode");
        } else {
            self.note_global_error(username, reason).await;
        }
    }

    // ── Rotation ────────────────────────────────────────

    /// Start a serialized rotation of every online identity.
    fn rotate_all(&mut self) -> bool {
        if self.rotation.is_some() || self.restarting || self.stopping {
            debug!("rotation already running");
            return false;
        }
        let queue: VecDeque<String> = self
            .order
            .iter()
            .filter(|name| {
                self.slots
                    .get(*name)
                    .and_then(|slot| slot.handle.as_ref())
                    .is_some_and(InstanceHandle::is_online)
            })
            .cloned()
            .collect();
        info!(bots = queue.len(), "rotation started");
        self.rotation = Some(queue);
        let _ = self.internal_tx.send(Internal::RotateNext);
        true
    }

    async fn rotate_next(&mut self) {
        let Some(queue) = self.rotation.as_mut() else {
            return;
        };
        let Some(username) = queue.pop_front() else {
            self.rotation = None;
            info!("rotation finished");
            return;
        };

        let online = self
            .slots
            .get(&username)
            .and_then(|slot| slot.handle.as_ref())
            .is_some_and(InstanceHandle::is_online);
        if !online {
            let _ = self.internal_tx.send(Internal::RotateNext);
            return;
        }
        if let Some(handle) = self.slots.get(&username).and_then(|s| s.handle.as_ref()) {
            handle.set_rotating(true);
        }

        let timing = &self.config.timing;
        let settle = ms(timing.rotation_settle_ms);
        let between = ms(timing.rotation_delay_between_bots_ms);
        info!(bot = %username, "rotating");
        if let Some(generation) = self.teardown(&username).await {
            self.stats
                .update(&username, BotStatus::Waiting, false, Instant::now());
            self.after(
                settle,
                Internal::Install {
                    username,
                    generation,
                    carry: Carry::default(),
                },
            );
        }
        self.after(settle + between, Internal::RotateNext);
    }

    // ── Watchdogs ───────────────────────────────────────

    async fn sweep_stuck(&mut self) {
        if self.restarting || self.stopping {
            return;
        }
        let now = Instant::now();
        let limit = ms(self.config.timing.stuck_offline_ms);
        let stuck: Vec<String> = self
            .order
            .iter()
            .filter(|name| {
                let Some(handle) = self.slots.get(*name).and_then(|s| s.handle.as_ref()) else {
                    return false;
                };
                let Some(stats) = self.stats.get(name) else {
                    return false;
                };
                !handle.is_online()
                    && !handle.flags().reconnect_scheduled()
                    && stats.status == BotStatus::Offline
                    && now.duration_since(stats.last_block_at) > limit
            })
            .cloned()
            .collect();

        for username in stuck {
            warn!(bot = %username, "stuck offline, forcing restart");
            let restart = &self.config.global_restart;
            let delay = jitter(
                &mut self.rng,
                restart.restart_delay_min_ms,
                restart.restart_delay_max_ms,
            );
            self.schedule_reconnect(&username, delay, Carry::default())
                .await;
        }
    }

    async fn shutdown(&mut self) {
        info!("fleet shutting down");
        self.stopping = true;
        self.rotation = None;
        self.stop_all().await;
        self.write_snapshot();
    }
}

/// Interval whose first tick is one period from now.
fn periodic(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
