//! One bot identity's connection lifecycle.
//!
//! A [`SessionInstance`] is a single task that owns all state for one
//! generation of an identity: the connection, lifecycle flags, timers and
//! sub-tasks (menu opener, bypass, dig loop, return walk). Game events,
//! timer expiries and sub-task results all arrive through one `select!` loop
//! and are handled by one method per event type, so no state is shared
//! except the atomic [`InstanceFlags`] read by sub-tasks and the fleet.
//!
//! The instance never rebuilds itself. When a reconnect is due it quits the
//! connection, cancels everything it owns and asks the fleet to install a
//! replacement, carrying only the rate-limit streak forward.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use super::backoff::{jitter, BackoffPolicy};
use super::bypass::{run_bypass, BypassMode, BypassOutcome, BypassSettings};
use super::drift::{return_to_stand, DriftVerdict, ReturnOutcome};
use super::hooks::{Carry, FleetHooks, Generation};
use super::menu::{ClickResult, MenuNavigator};
use super::signals::{kick_reason_text, ChatSignal, ErrorClass, KickClass, SignalClassifier};
use super::task_loop::{LoopReport, RecoveryReason, TaskHooks, TaskLoop, TaskSettings};
use super::timers::{TimerKind, Timers};
use crate::client::{
    ActionError, ClientError, ClientErrorKind, ConnectOptions, Connector, GameEvent, GameSession,
};
use crate::config::{millis, ms, FleetConfig, IdentityConfig};
use crate::models::geometry::BlockPos;
use crate::models::status::BotStatus;

/// Upper bound on the deferral of a non-forced reconnect during the grace window.
const MAX_GRACE_DEFERRAL: Duration = Duration::from_secs(30);

/// How long [`InstanceHandle::shutdown`] waits for the task to exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle phase, published for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Opening the connection.
    Connecting,
    /// Spawned; waiting for the login exchange.
    Authenticating,
    /// Waiting for the probe or its fallback timeout.
    BypassPending,
    /// Clicking through the selector window.
    MenuNavigating,
    /// In the target instance.
    Joined,
    /// Joined and walking back to the stand position.
    Returning,
    /// Waiting for a scheduled reconnect.
    Disconnected,
    /// Handed over to a replacement or torn down.
    Replaced,
}

/// Flags shared between the instance task, its sub-tasks and the fleet.
#[derive(Debug, Default)]
pub struct InstanceFlags {
    online: AtomicBool,
    joined: AtomicBool,
    position_confirmed: AtomicBool,
    returning: AtomicBool,
    reconnect_scheduled: AtomicBool,
    rotating: AtomicBool,
    wait_kick_count: AtomicU32,
    last_delay_ms: AtomicU64,
}

impl InstanceFlags {
    /// Connected and spawned.
    #[must_use]
    pub fn online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// In the target instance.
    #[must_use]
    pub fn joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    /// Position known to be the stand position.
    #[must_use]
    pub fn position_confirmed(&self) -> bool {
        self.position_confirmed.load(Ordering::SeqCst)
    }

    /// Walking back to the stand position.
    #[must_use]
    pub fn returning(&self) -> bool {
        self.returning.load(Ordering::SeqCst)
    }

    /// A reconnect is pending.
    #[must_use]
    pub fn reconnect_scheduled(&self) -> bool {
        self.reconnect_scheduled.load(Ordering::SeqCst)
    }

    /// Being replaced by a planned rotation.
    #[must_use]
    pub fn rotating(&self) -> bool {
        self.rotating.load(Ordering::SeqCst)
    }

    /// Consecutive rate-limit kicks.
    #[must_use]
    pub fn wait_kick_count(&self) -> u32 {
        self.wait_kick_count.load(Ordering::SeqCst)
    }

    /// Delay of the most recently scheduled reconnect.
    #[must_use]
    pub fn last_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.last_delay_ms.load(Ordering::SeqCst))
    }

    fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }
}

/// Everything an instance needs from the fleet.
pub struct InstanceContext {
    /// Identity configuration.
    pub identity: Arc<IdentityConfig>,
    /// Fleet configuration.
    pub config: Arc<FleetConfig>,
    /// Connection factory.
    pub connector: Arc<dyn Connector>,
    /// Channel back to the fleet, bound to this generation.
    pub hooks: FleetHooks,
    /// Fleet-wide pause flag.
    pub paused: Arc<AtomicBool>,
    /// State inherited from the predecessor.
    pub carry: Carry,
    /// Parent cancellation token.
    pub cancel: CancellationToken,
}

/// Fleet-side handle to a running instance. Dropping it cancels the task.
#[derive(Debug)]
pub struct InstanceHandle {
    username: String,
    generation: u64,
    flags: Arc<InstanceFlags>,
    phase: watch::Receiver<SessionPhase>,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl Drop for InstanceHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl InstanceHandle {
    /// Identity name.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Generation number.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Shared flags.
    #[must_use]
    pub fn flags(&self) -> &Arc<InstanceFlags> {
        &self.flags
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    /// Phase watch for observers.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionPhase> {
        self.phase.clone()
    }

    /// Connected and spawned.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.flags.online()
    }

    /// Mark the instance as being rotated out.
    pub fn set_rotating(&self, rotating: bool) {
        InstanceFlags::set(&self.flags.rotating, rotating);
    }

    /// Cancel the task and wait for it to quit its connection.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            let abort = join.abort_handle();
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, join).await.is_err() {
                warn!(bot = %self.username, "instance did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

/// Messages delivered to the instance mailbox by timers and sub-tasks.
#[derive(Debug)]
enum InstanceMsg {
    GraceOver,
    KeepAliveCheck,
    BypassFallback,
    BypassCeiling,
    BypassFinished(BypassOutcome),
    AutoJoin,
    MenuTick,
    MenuSecondClick,
    DriftStart,
    PositionCheck,
    ReturnFinished(Result<ReturnOutcome, ActionError>),
    PreventiveRestart,
    StartTaskLoop,
    TaskLoopExited(LoopReport),
    BlockMined(BlockPos),
    RecoveryRequested(RecoveryReason),
    DeferredReconnect(Duration),
    ReconnectDue,
}

/// [`TaskHooks`] backed by the instance flags and mailbox.
struct InstanceTaskHooks {
    flags: Arc<InstanceFlags>,
    paused: Arc<AtomicBool>,
    generation: Generation,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<InstanceMsg>,
}

impl TaskHooks for InstanceTaskHooks {
    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled()
            || self.flags.reconnect_scheduled()
            || !self.flags.joined()
            || !self.generation.is_current()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn is_returning(&self) -> bool {
        self.flags.returning()
    }

    fn on_block_mined(&self, pos: BlockPos) {
        let _ = self.tx.send(InstanceMsg::BlockMined(pos));
    }

    fn request_recovery(&self, reason: RecoveryReason) {
        let _ = self.tx.send(InstanceMsg::RecoveryRequested(reason));
    }
}

/// The per-identity state machine.
pub struct SessionInstance {
    username: String,
    identity: Arc<IdentityConfig>,
    config: Arc<FleetConfig>,
    connector: Arc<dyn Connector>,
    hooks: FleetHooks,
    generation: Generation,
    paused: Arc<AtomicBool>,
    cancel: CancellationToken,
    subtasks: CancellationToken,
    flags: Arc<InstanceFlags>,
    phase: watch::Sender<SessionPhase>,
    timers: Timers<InstanceMsg>,
    tx: mpsc::UnboundedSender<InstanceMsg>,
    span: Span,
    classifier: SignalClassifier,
    policy: BackoffPolicy,
    menu: MenuNavigator,
    rng: StdRng,
    session: Option<Arc<dyn GameSession>>,
    wait_kick_count: u32,
    backoff: Duration,
    allow_reconnects: bool,
    spawned: bool,
    last_keep_alive: Instant,
    probe_seen: bool,
    bypass_resolved: bool,
    bypass_cancel: Option<CancellationToken>,
    preventive_armed: bool,
    handed_off: bool,
    finished: bool,
}

impl SessionInstance {
    /// Start the instance task.
    #[must_use]
    pub fn spawn(ctx: InstanceContext) -> InstanceHandle {
        let username = ctx.identity.username.clone();
        let generation = ctx.hooks.generation().clone();
        let cancel = ctx.cancel.child_token();
        let flags = Arc::new(InstanceFlags::default());
        flags
            .wait_kick_count
            .store(ctx.carry.wait_kick_count, Ordering::SeqCst);
        let (phase_tx, phase_rx) = watch::channel(SessionPhase::Connecting);
        let (tx, rx) = mpsc::unbounded_channel();
        let span = info_span!("instance", bot = %username, generation = generation.id());
        let config = ctx.config;

        let instance = Self {
            username: username.clone(),
            classifier: SignalClassifier::new(&config.phrases),
            policy: BackoffPolicy::new(config.backoff.clone()),
            menu: MenuNavigator::new(ctx.identity.menu_slots(&config.menu), &config.menu),
            backoff: ms(config.timing.reconnect_regular_ms),
            identity: ctx.identity,
            connector: ctx.connector,
            hooks: ctx.hooks,
            timers: Timers::new(cancel.clone(), tx.clone(), generation.clone()),
            generation: generation.clone(),
            paused: ctx.paused,
            subtasks: cancel.child_token(),
            cancel: cancel.clone(),
            flags: Arc::clone(&flags),
            phase: phase_tx,
            tx,
            span: span.clone(),
            rng: StdRng::from_entropy(),
            session: None,
            wait_kick_count: ctx.carry.wait_kick_count,
            allow_reconnects: false,
            spawned: false,
            last_keep_alive: Instant::now(),
            probe_seen: false,
            bypass_resolved: false,
            bypass_cancel: None,
            preventive_armed: false,
            handed_off: false,
            finished: false,
            config,
        };

        let join = tokio::spawn(instance.run(rx).instrument(span));

        InstanceHandle {
            username,
            generation: generation.id(),
            flags,
            phase: phase_rx,
            cancel,
            join: Some(join),
        }
    }

    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<InstanceMsg>) {
        self.set_phase(SessionPhase::Connecting);
        self.hooks.status(BotStatus::Connecting, false);

        let mut events = self.connect().await;

        while !self.finished {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                Some(msg) = mailbox.recv() => self.on_message(msg),
                event = next_event(&mut events) => match event {
                    Some(event) => self.on_event(event),
                    None => {
                        events = None;
                        self.on_end("event stream closed");
                    }
                },
            }
            if !self.generation.is_current() {
                debug!("generation superseded, stopping");
                break;
            }
        }

        self.teardown();
    }

    async fn connect(&mut self) -> Option<mpsc::UnboundedReceiver<GameEvent>> {
        let options = ConnectOptions::from_config(&self.config, &self.username);
        let timeout = options.connect_timeout;
        debug!(host = %options.host, port = options.port, "connecting");
        let result = tokio::select! {
            () = self.cancel.cancelled() => return None,
            result = tokio::time::timeout(timeout, self.connector.connect(options)) => result,
        };
        match result {
            Ok(Ok(connection)) => {
                self.session = Some(connection.session);
                Some(connection.events)
            }
            // Link-down kinds keep feeding the no-network budget; every other
            // failure to establish the session backs off as a connect failure.
            Ok(Err(err)) if err.kind.is_no_network() => {
                self.on_client_error(&err);
                None
            }
            Ok(Err(err)) => {
                let err = ClientError::new(ClientErrorKind::ConnectFailed, err.message);
                self.on_client_error(&err);
                None
            }
            Err(_) => {
                self.on_client_error(&ClientError::new(
                    ClientErrorKind::ConnectFailed,
                    format!("connect timed out after {}s", timeout.as_secs()),
                ));
                None
            }
        }
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.phase.send_replace(phase);
    }

    fn carry(&self) -> Carry {
        Carry {
            wait_kick_count: self.wait_kick_count,
        }
    }

    fn mining_status(&self) -> BotStatus {
        if self.paused.load(Ordering::SeqCst) {
            BotStatus::Paused
        } else {
            BotStatus::Mining
        }
    }

    fn spawn_subtask<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future.instrument(self.span.clone()));
    }

    fn human_delay(&mut self, min_ms: u64, max_ms: u64) -> Duration {
        jitter(&mut self.rng, min_ms, max_ms)
    }

    // ── Game events ─────────────────────────────────────

    fn on_event(&mut self, event: GameEvent) {
        if self.handed_off {
            return;
        }
        match event {
            GameEvent::Spawn => self.on_spawn(),
            GameEvent::Message(text) => self.on_chat(&text),
            GameEvent::Kicked(reason) => self.on_kicked(&reason),
            GameEvent::End(reason) => self.on_end(&reason),
            GameEvent::Error(err) => self.on_client_error(&err),
            GameEvent::KeepAlive => self.last_keep_alive = Instant::now(),
        }
    }

    fn on_spawn(&mut self) {
        if self.spawned {
            return;
        }
        self.spawned = true;
        info!("connected to server");
        InstanceFlags::set(&self.flags.online, true);
        self.last_keep_alive = Instant::now();
        self.allow_reconnects = false;
        self.set_phase(SessionPhase::Authenticating);
        self.hooks.status(BotStatus::Connecting, false);

        let timing = &self.config.timing;
        let grace = ms(timing.grace_after_spawn_ms);
        let keep_alive_check = ms(timing.keep_alive_check_ms);
        self.timers.arm(TimerKind::Grace, grace, InstanceMsg::GraceOver);
        self.timers
            .arm_interval(TimerKind::KeepAlive, keep_alive_check, || InstanceMsg::KeepAliveCheck);
        self.timers.arm(
            TimerKind::BypassFallback,
            ms(self.config.antibot.probe_wait_ms),
            InstanceMsg::BypassFallback,
        );

        self.open_menu();

        let menu_delay = self.human_delay(self.config.menu.retry_min_ms, self.config.menu.retry_max_ms);
        self.timers.arm(TimerKind::MenuTick, menu_delay, InstanceMsg::MenuTick);
    }

    /// Select the menu item and use it after humanized pauses.
    fn open_menu(&mut self) {
        let Some(session) = self.session.clone() else {
            return;
        };
        let first = self.human_delay(800, 2000);
        let second = self.human_delay(700, 1300);
        let hotbar_slot = self.config.menu.hotbar_slot;
        let cancel = self.subtasks.clone();
        self.spawn_subtask(async move {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(first) => {}
            }
            if let Err(err) = session.set_hotbar_slot(hotbar_slot) {
                debug!(%err, "hotbar selection failed");
                return;
            }
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(second) => {}
            }
            if let Err(err) = session.activate_item() {
                debug!(%err, "menu item activation failed");
            }
        });
    }

    fn on_chat(&mut self, text: &str) {
        let signals = self.classifier.classify_chat(text);
        if signals.is_empty() {
            return;
        }
        debug!(?signals, "server message classified");
        for signal in signals {
            match signal {
                ChatSignal::LoginPrompt => self.send_login(),
                ChatSignal::QuickLogin => {
                    info!("quick login, probe skipped");
                    self.resolve_bypass(BypassOutcome::Skipped);
                }
                ChatSignal::ProbeDetected => self.start_bypass(),
                ChatSignal::Joined => {
                    let confirmed = !self.probe_seen;
                    self.on_joined(confirmed);
                }
            }
        }
    }

    fn send_login(&mut self) {
        let Some(session) = self.session.clone() else {
            return;
        };
        if !self.flags.joined() {
            self.set_phase(SessionPhase::BypassPending);
        }
        let line = format!("/login {}", self.config.server.password);
        self.spawn_subtask(async move {
            if let Err(err) = session.chat(line).await {
                debug!(%err, "login command failed");
            }
        });
    }

    fn on_kicked(&mut self, raw: &str) {
        InstanceFlags::set(&self.flags.online, false);
        InstanceFlags::set(&self.flags.position_confirmed, false);
        let reason = kick_reason_text(raw);
        warn!(reason = %truncate(&reason, 100), "kicked");
        self.hooks.status(BotStatus::Offline, false);
        self.cleanup();

        let class = self.classifier.classify_kick(&reason);
        if class == KickClass::RateLimited {
            self.wait_kick_count += 1;
            self.flags
                .wait_kick_count
                .store(self.wait_kick_count, Ordering::SeqCst);
        }
        let delay = self
            .policy
            .after_kick(class, self.wait_kick_count, &mut self.rng);
        match class {
            KickClass::RateLimited => warn!(
                attempt = self.wait_kick_count,
                wait_mins = delay.as_secs() / 60,
                "rate limited by server"
            ),
            KickClass::TooFast => warn!("logging in too fast"),
            KickClass::AntibotFailed => warn!("probe failed, anti-bot limit exceeded"),
            KickClass::AntibotRejected => warn!("rejected by anti-bot"),
            KickClass::AlreadyConnected => warn!("identity already connected"),
            KickClass::Other => {}
        }
        self.backoff = delay;
        self.schedule_reconnect(delay, true);
    }

    fn on_end(&mut self, reason: &str) {
        if self.handed_off {
            return;
        }
        InstanceFlags::set(&self.flags.online, false);
        InstanceFlags::set(&self.flags.position_confirmed, false);
        if self.flags.reconnect_scheduled() || self.flags.rotating() {
            return;
        }
        warn!(reason, "disconnected from server");
        self.hooks.status(BotStatus::Offline, false);
        self.cleanup();
        let delay = self.policy.after_end(&mut self.rng);
        self.backoff = delay;
        self.schedule_reconnect(delay, false);
    }

    fn on_client_error(&mut self, err: &ClientError) {
        let class = self.classifier.classify_error(err);
        let message = truncate(&err.message, 60);
        match class {
            ErrorClass::Noise => {
                debug!(error = %message, "ignored client noise");
                return;
            }
            ErrorClass::NoNetwork => {
                warn!(error = %message, kind = ?err.kind, "network unreachable");
                self.hooks.no_internet(message.clone());
            }
            ErrorClass::Network | ErrorClass::ConnectFailed | ErrorClass::ClientTimeout => {
                warn!(error = %message, kind = ?err.kind, "network error");
            }
            ErrorClass::Other => {
                error!(error = %message, "client error");
                self.hooks.global_error(message.clone());
            }
        }

        InstanceFlags::set(&self.flags.online, false);
        InstanceFlags::set(&self.flags.position_confirmed, false);
        self.cleanup();
        self.hooks.status(BotStatus::Offline, false);
        if let Some(delay) = self.policy.after_error(class, &mut self.rng) {
            self.backoff = delay;
            self.schedule_reconnect(delay, true);
        }
    }

    // ── Mailbox ─────────────────────────────────────────

    fn on_message(&mut self, msg: InstanceMsg) {
        if self.handed_off && !matches!(msg, InstanceMsg::TaskLoopExited(_)) {
            return;
        }
        match msg {
            InstanceMsg::GraceOver => self.allow_reconnects = true,
            InstanceMsg::KeepAliveCheck => self.check_keep_alive(),
            InstanceMsg::BypassFallback => {
                if !self.probe_seen {
                    debug!("no probe announced, bypass satisfied");
                    self.resolve_bypass(BypassOutcome::Skipped);
                }
            }
            InstanceMsg::BypassCeiling => {
                if !self.bypass_resolved {
                    warn!("bypass ceiling reached, treating as passed");
                    self.resolve_bypass(BypassOutcome::Passed { drop: 0.0 });
                }
            }
            InstanceMsg::BypassFinished(outcome) => self.resolve_bypass(outcome),
            InstanceMsg::AutoJoin => {
                if !self.flags.joined() {
                    info!("no join message after probe, assuming joined");
                    self.on_joined(false);
                }
            }
            InstanceMsg::MenuTick => self.menu_tick(),
            InstanceMsg::MenuSecondClick => self.menu_second_click(),
            InstanceMsg::DriftStart => self.start_drift_supervision(),
            InstanceMsg::PositionCheck => self.check_position(),
            InstanceMsg::ReturnFinished(result) => self.on_return_finished(result),
            InstanceMsg::PreventiveRestart => {
                info!("preventive restart");
                self.hooks.status(BotStatus::Waiting, false);
                self.cleanup();
                let delay = self.policy.preventive(&mut self.rng);
                self.backoff = delay;
                self.schedule_reconnect(delay, true);
            }
            InstanceMsg::StartTaskLoop => self.start_task_loop(),
            InstanceMsg::TaskLoopExited(report) => {
                debug!(mined = report.mined, exit = ?report.exit, "dig loop exited");
            }
            InstanceMsg::BlockMined(pos) => {
                if !self.flags.position_confirmed() {
                    InstanceFlags::set(&self.flags.position_confirmed, true);
                    info!(%pos, "position confirmed by first mined block");
                }
                self.hooks.status(self.mining_status(), true);
            }
            InstanceMsg::RecoveryRequested(reason) => {
                warn!(?reason, "dig loop requested reconnect");
                self.hooks.status(BotStatus::Waiting, false);
                self.schedule_reconnect(self.backoff, false);
            }
            InstanceMsg::DeferredReconnect(delay) => self.schedule_reconnect(delay, true),
            InstanceMsg::ReconnectDue => self.replace_self(),
        }
    }

    fn check_keep_alive(&mut self) {
        if !self.flags.joined() || self.session.is_none() {
            return;
        }
        let timing = &self.config.timing;
        let silent = Instant::now().duration_since(self.last_keep_alive);
        if silent <= ms(timing.keep_alive_warn_ms) {
            return;
        }
        warn!(silent_secs = silent.as_secs(), "no keep-alive");
        if silent > ms(timing.keep_alive_timeout_ms) && self.allow_reconnects {
            error!("keep-alive timeout, restarting");
            let delay = ms(timing.keep_alive_reconnect_ms);
            self.cleanup();
            self.hooks.status(BotStatus::Waiting, false);
            self.hand_off_to_fleet(delay);
        }
    }

    // ── Challenge bypass ────────────────────────────────

    fn start_bypass(&mut self) {
        if self.flags.joined() || self.bypass_cancel.is_some() {
            return;
        }
        let Some(session) = self.session.clone() else {
            return;
        };
        self.probe_seen = true;
        self.bypass_resolved = false;
        self.timers.cancel(TimerKind::BypassFallback);
        self.set_phase(SessionPhase::BypassPending);

        let antibot = &self.config.antibot;
        let settings = BypassSettings {
            mode: if self.config.features.active_fall_check {
                BypassMode::Active
            } else {
                BypassMode::Passive
            },
            fall_threshold: antibot.fall_threshold,
            ceiling: ms(antibot.ceiling_ms),
        };
        info!(mode = ?settings.mode, "probe detected, running bypass");

        let cancel = self.subtasks.child_token();
        self.bypass_cancel = Some(cancel.clone());
        let rng = StdRng::seed_from_u64(self.rng.gen());
        let tx = self.tx.clone();
        self.spawn_subtask(async move {
            let outcome = run_bypass(session, settings, cancel, rng).await;
            let _ = tx.send(InstanceMsg::BypassFinished(outcome));
        });
        self.timers
            .arm(TimerKind::BypassCeiling, settings.ceiling, InstanceMsg::BypassCeiling);
    }

    fn resolve_bypass(&mut self, outcome: BypassOutcome) {
        if self.bypass_resolved {
            return;
        }
        self.bypass_resolved = true;
        self.timers.cancel(TimerKind::BypassFallback);
        self.timers.cancel(TimerKind::BypassCeiling);
        if let Some(cancel) = self.bypass_cancel.take() {
            cancel.cancel();
        }
        match outcome {
            BypassOutcome::Passed { drop } => info!(drop, "probe passed"),
            BypassOutcome::Inconclusive { drop } => {
                info!(drop, "probe finished without a fall");
            }
            BypassOutcome::TimedOut => warn!("probe fall never reached the ground"),
            BypassOutcome::Skipped => debug!("probe not required"),
        }
        if self.flags.joined() {
            return;
        }
        self.set_phase(SessionPhase::MenuNavigating);
        if self.probe_seen {
            self.timers.arm(
                TimerKind::AutoJoin,
                ms(self.config.antibot.auto_join_ms),
                InstanceMsg::AutoJoin,
            );
        }
    }

    // ── Menu ────────────────────────────────────────────

    fn menu_tick(&mut self) {
        if self.flags.joined() {
            return;
        }
        let next = self.human_delay(self.config.menu.retry_min_ms, self.config.menu.retry_max_ms);
        self.timers.arm(TimerKind::MenuTick, next, InstanceMsg::MenuTick);

        if !self.bypass_resolved {
            return;
        }
        let Some(session) = self.session.clone() else {
            return;
        };
        if session.current_window().is_none() {
            return;
        }
        if self.menu.exhausted() {
            warn!(attempts = self.menu.attempts(), "menu attempts exhausted");
            let delay = self.policy.after_menu_exhausted(&mut self.rng);
            self.backoff = delay;
            self.schedule_reconnect(delay, true);
            return;
        }
        let result = self.menu.first_click(session.as_ref());
        self.on_click(&result);
        if result == ClickResult::Sent {
            let gap = self.human_delay(800, 1500);
            self.timers
                .arm(TimerKind::MenuSecondClick, gap, InstanceMsg::MenuSecondClick);
        }
    }

    fn menu_second_click(&mut self) {
        if self.flags.joined() {
            return;
        }
        let Some(session) = self.session.clone() else {
            return;
        };
        let result = self.menu.second_click(session.as_ref());
        self.on_click(&result);
    }

    fn on_click(&self, result: &ClickResult) {
        match result {
            ClickResult::Sent => debug!(attempt = self.menu.attempts(), "menu click sent"),
            ClickResult::Throttled | ClickResult::NoWindow => debug!(?result, "menu click skipped"),
            ClickResult::Failed(err) => {
                warn!(%err, "menu click failed");
                self.hooks.global_error(format!("menu click failed: {err}"));
            }
        }
    }

    // ── Joined ──────────────────────────────────────────

    fn on_joined(&mut self, position_confirmed: bool) {
        if self.flags.joined() {
            return;
        }
        InstanceFlags::set(&self.flags.joined, true);
        InstanceFlags::set(&self.flags.position_confirmed, position_confirmed);
        self.wait_kick_count = 0;
        self.flags.wait_kick_count.store(0, Ordering::SeqCst);
        self.backoff = ms(self.config.timing.reconnect_regular_ms);

        for kind in [
            TimerKind::MenuTick,
            TimerKind::MenuSecondClick,
            TimerKind::BypassFallback,
            TimerKind::BypassCeiling,
            TimerKind::AutoJoin,
        ] {
            self.timers.cancel(kind);
        }
        if let Some(cancel) = self.bypass_cancel.take() {
            cancel.cancel();
        }
        self.bypass_resolved = true;

        info!(position_confirmed, "joined target instance");
        self.set_phase(SessionPhase::Joined);
        self.hooks.status(self.mining_status(), false);

        if self.identity.stand_position.is_some() {
            self.timers.arm(
                TimerKind::DriftStart,
                ms(self.config.position.settle_delay_ms),
                InstanceMsg::DriftStart,
            );
        }
        if !self.preventive_armed {
            self.preventive_armed = true;
            self.timers.arm(
                TimerKind::PreventiveRestart,
                ms(self.config.timing.preventive_restart_ms),
                InstanceMsg::PreventiveRestart,
            );
        }
        let start = self.human_delay(700, 1300);
        self.timers
            .arm(TimerKind::StartTaskLoop, start, InstanceMsg::StartTaskLoop);
    }

    fn start_task_loop(&mut self) {
        if !self.flags.joined() || self.flags.reconnect_scheduled() {
            return;
        }
        let Some(session) = self.session.clone() else {
            return;
        };
        info!("starting dig loop");
        self.hooks.status(self.mining_status(), false);
        let hooks = InstanceTaskHooks {
            flags: Arc::clone(&self.flags),
            paused: Arc::clone(&self.paused),
            generation: self.generation.clone(),
            cancel: self.subtasks.clone(),
            tx: self.tx.clone(),
        };
        let task = TaskLoop::new(
            session,
            self.identity.blocks.clone(),
            TaskSettings::from_config(&self.config),
            hooks,
        );
        let tx = self.tx.clone();
        self.spawn_subtask(async move {
            let report = task.run().await;
            let _ = tx.send(InstanceMsg::TaskLoopExited(report));
        });
    }

    // ── Drift supervision ───────────────────────────────

    fn start_drift_supervision(&mut self) {
        if !self.flags.joined() || self.identity.stand_position.is_none() {
            return;
        }
        if self.timers.is_armed(TimerKind::PositionCheck) {
            return;
        }
        self.timers.arm_interval(
            TimerKind::PositionCheck,
            ms(self.config.position.check_interval_ms),
            || InstanceMsg::PositionCheck,
        );
        info!("drift supervision active");
    }

    fn check_position(&mut self) {
        if !self.flags.joined() || self.flags.returning() || !self.flags.position_confirmed() {
            return;
        }
        let Some(stand) = self.identity.stand_position else {
            return;
        };
        let Some(session) = self.session.clone() else {
            return;
        };
        let Some(entity) = session.entity() else {
            return;
        };
        let config = Arc::clone(&self.config);
        let position = &config.position;
        let max_distance = self.identity.max_distance(position);
        let distance = entity.position.distance_to(stand);

        match DriftVerdict::classify(distance, max_distance, position.teleport_distance) {
            DriftVerdict::Hold => {}
            DriftVerdict::Teleport => {
                warn!(distance, "moved to spawn, reconnecting");
                self.hooks.status(BotStatus::Waiting, false);
                self.cleanup();
                InstanceFlags::set(&self.flags.position_confirmed, false);
                let delay = self.policy.after_teleport();
                self.hand_off_to_fleet(delay);
            }
            DriftVerdict::Return => {
                warn!(distance, max_distance, "drifted from stand position, returning");
                self.hooks.status(BotStatus::Returning, false);
                InstanceFlags::set(&self.flags.returning, true);
                self.set_phase(SessionPhase::Returning);
                let config = position.clone();
                let cancel = self.subtasks.clone();
                let tx = self.tx.clone();
                self.spawn_subtask(async move {
                    let result = return_to_stand(session.as_ref(), stand, &config, &cancel).await;
                    let _ = tx.send(InstanceMsg::ReturnFinished(result));
                });
            }
        }
    }

    fn on_return_finished(&mut self, result: Result<ReturnOutcome, ActionError>) {
        InstanceFlags::set(&self.flags.returning, false);
        match result {
            Ok(ReturnOutcome::Arrived) => info!("back at stand position"),
            Ok(ReturnOutcome::TimedOut) => warn!("return to stand timed out"),
            Ok(outcome) => debug!(?outcome, "return to stand ended"),
            Err(err) => error!(%err, "return to stand failed"),
        }
        if self.flags.joined() && !self.flags.reconnect_scheduled() {
            self.set_phase(SessionPhase::Joined);
            self.hooks.status(self.mining_status(), false);
        }
    }

    // ── Reconnect ───────────────────────────────────────

    /// Request exactly one reconnect after `delay`.
    ///
    /// A second request while one is pending is a no-op. Non-forced
    /// requests inside the spawn grace window are deferred and re-issued
    /// as forced.
    fn schedule_reconnect(&mut self, delay: Duration, forced: bool) {
        if self.flags.reconnect_scheduled() || self.handed_off || !self.generation.is_current() {
            return;
        }
        if !self.allow_reconnects && !forced {
            let grace = ms(self.config.timing.grace_after_spawn_ms).min(MAX_GRACE_DEFERRAL);
            debug!(defer_secs = grace.as_secs(), "inside grace window, deferring reconnect");
            self.timers
                .arm(TimerKind::Deferred, grace, InstanceMsg::DeferredReconnect(delay));
            return;
        }
        InstanceFlags::set(&self.flags.reconnect_scheduled, true);
        self.flags.last_delay_ms.store(millis(delay), Ordering::SeqCst);
        info!(delay_ms = millis(delay), forced, "reconnect scheduled");
        self.hooks.status(BotStatus::Waiting, false);
        self.set_phase(SessionPhase::Disconnected);
        self.timers
            .arm(TimerKind::Reconnect, delay, InstanceMsg::ReconnectDue);
    }

    /// Quit, cancel everything and ask the fleet for a replacement.
    fn replace_self(&mut self) {
        if !self.generation.is_current() {
            return;
        }
        if let Some(session) = self.session.take() {
            session.quit("reconnecting");
        }
        self.cleanup();
        self.backoff = ms(self.config.timing.reconnect_regular_ms);
        self.handed_off = true;
        self.finished = true;
        self.set_phase(SessionPhase::Replaced);
        info!("handing over to a fresh instance");
        self.hooks.replace(self.carry());
    }

    /// Let the fleet tear this instance down and rebuild it after `delay`.
    fn hand_off_to_fleet(&mut self, delay: Duration) {
        if self.handed_off || !self.generation.is_current() {
            return;
        }
        self.handed_off = true;
        InstanceFlags::set(&self.flags.reconnect_scheduled, true);
        self.set_phase(SessionPhase::Disconnected);
        self.hooks.schedule_reconnect(delay, self.carry());
    }

    /// Cancel every timer and sub-task. A pending reconnect survives.
    fn cleanup(&mut self) {
        self.timers.cancel_all_except(TimerKind::Reconnect);
        self.subtasks.cancel();
        self.subtasks = self.cancel.child_token();
        self.bypass_cancel = None;
        InstanceFlags::set(&self.flags.returning, false);
    }

    fn teardown(&mut self) {
        self.cleanup();
        self.timers.cancel_all();
        if let Some(session) = self.session.take() {
            session.quit("instance stopped");
        }
        InstanceFlags::set(&self.flags.online, false);
        InstanceFlags::set(&self.flags.joined, false);
        self.set_phase(SessionPhase::Replaced);
        debug!("instance stopped");
    }
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<GameEvent>>) -> Option<GameEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
