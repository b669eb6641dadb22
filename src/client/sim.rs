//! In-process simulated game server.
//!
//! Implements [`Connector`] with a scripted login flow (login prompt, optional
//! probe, selector window, join message), keep-alives, timed digs with block
//! regeneration and simple walking physics. Server-side operations
//! ([`SimServer::kick`], [`SimServer::teleport`], ...) let tests drive edge
//! cases, and every connection, dig and packet is recorded with its
//! `tokio::time::Instant` so paused-clock tests can assert on timing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    ActionError, ActionErrorKind, Block, BoxFuture, ClientError, ClientErrorKind, Connection,
    ConnectOptions, Connector, Control, EntityState, GameEvent, GameSession, Item,
    OutboundPacket, WindowInfo,
};
use crate::config::FleetConfig;
use crate::models::geometry::{BlockPos, Vec3};

/// Walking speed in blocks per second.
const WALK_SPEED: f64 = 4.317;

/// Window id used for the selector menu.
const MENU_WINDOW_ID: u8 = 1;

/// Text sent when a session enters the target instance.
pub const JOIN_MESSAGE: &str = "You entered instance 1. Your position is tracked.";
/// Login prompt text.
pub const LOGIN_PROMPT: &str = "Please log in: /login <password>";
/// Quick-login text.
pub const QUICK_LOGIN_MESSAGE: &str = "You recently logged in, no password required.";
/// Probe announcement text.
pub const PROBE_MESSAGE: &str = "[Scanner] Please wait and don't move while we check you.";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted server behaviour.
#[derive(Debug, Clone)]
pub struct SimBehavior {
    /// Connect → spawn delay.
    pub spawn_delay: Duration,
    /// Send the login prompt after spawn.
    pub login_prompt: bool,
    /// Send the quick-login message instead of the prompt.
    pub quick_login: bool,
    /// Send the probe announcement once logged in.
    pub probe: bool,
    /// Open the selector window when the menu item is used.
    pub menu_window: bool,
    /// Send the join message after two clicks in the selector window.
    pub join_on_menu: bool,
    /// Keep-alive period; `None` silences keep-alives.
    pub keep_alive: Option<Duration>,
    /// Time one dig takes.
    pub dig_time: Duration,
    /// Time until a mined block reappears.
    pub block_regen: Duration,
    /// Kick every session this long after spawn.
    pub kick_after: Option<Duration>,
    /// Reason used for scheduled kicks.
    pub kick_reason: String,
    /// Spawn point for identities without an explicit one.
    pub spawn_position: Vec3,
    /// Per-identity spawn points.
    pub spawn_positions: HashMap<String, Vec3>,
    /// Positions holding a solid block.
    pub world: HashSet<BlockPos>,
    /// Whether world regions are sent to clients.
    pub chunks_loaded: bool,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            spawn_delay: Duration::from_millis(500),
            login_prompt: true,
            quick_login: false,
            probe: false,
            menu_window: true,
            join_on_menu: true,
            keep_alive: Some(Duration::from_secs(10)),
            dig_time: Duration::from_millis(250),
            block_regen: Duration::ZERO,
            kick_after: None,
            kick_reason: "Server restarting".into(),
            spawn_position: Vec3::new(0.5, 64.0, 0.5),
            spawn_positions: HashMap::new(),
            world: HashSet::new(),
            chunks_loaded: true,
        }
    }
}

impl SimBehavior {
    /// Behaviour derived from the `[simulation]` section and the identities'
    /// target blocks and stand positions.
    #[must_use]
    pub fn from_config(config: &FleetConfig) -> Self {
        let sim = &config.simulation;
        let mut behavior = Self {
            spawn_delay: Duration::from_millis(sim.spawn_delay_ms),
            login_prompt: sim.login_prompt,
            quick_login: !sim.login_prompt,
            probe: sim.probe,
            menu_window: sim.menu_window,
            join_on_menu: sim.join_on_menu,
            keep_alive: (sim.keep_alive_ms > 0).then(|| Duration::from_millis(sim.keep_alive_ms)),
            dig_time: Duration::from_millis(sim.dig_ms),
            block_regen: Duration::from_millis(sim.block_regen_ms),
            kick_after: sim.kick_after_ms.map(Duration::from_millis),
            kick_reason: sim.kick_reason.clone(),
            ..Self::default()
        };
        for bot in &config.bots {
            behavior.world.extend(bot.blocks.iter().copied());
            let spawn = bot.stand_position.or_else(|| {
                bot.blocks
                    .first()
                    .map(|b| b.as_vec3().offset(1.5, 0.0, 0.5))
            });
            if let Some(spawn) = spawn {
                behavior.spawn_positions.insert(bot.username.clone(), spawn);
            }
        }
        behavior
    }
}

#[derive(Default)]
struct SimState {
    live: HashMap<String, usize>,
    peak: HashMap<String, usize>,
    connects: HashMap<String, Vec<Instant>>,
    digs: Vec<(String, BlockPos, Instant)>,
    chats: Vec<(String, String)>,
    packets: Vec<(String, OutboundPacket, Instant)>,
    mined: HashMap<BlockPos, Instant>,
    sessions: HashMap<String, Arc<SimSession>>,
    connect_failures: VecDeque<ClientErrorKind>,
}

struct SimInner {
    behavior: Mutex<SimBehavior>,
    state: Mutex<SimState>,
}

impl SimInner {
    fn behavior(&self) -> SimBehavior {
        lock(&self.behavior).clone()
    }

    fn block_at(&self, pos: BlockPos) -> Option<Block> {
        let behavior = lock(&self.behavior);
        if !behavior.chunks_loaded {
            return None;
        }
        if !behavior.world.contains(&pos) {
            return Some(Block::air());
        }
        drop(behavior);
        let regen_at = lock(&self.state).mined.get(&pos).copied();
        match regen_at {
            Some(at) if Instant::now() < at => Some(Block::air()),
            _ => Some(Block::new("stone")),
        }
    }

    fn connection_closed(&self, username: &str) {
        let mut state = lock(&self.state);
        if let Some(count) = state.live.get_mut(username) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Shared handle to the simulated server.
#[derive(Clone)]
pub struct SimServer {
    inner: Arc<SimInner>,
}

impl SimServer {
    /// Start a server with the given behaviour.
    #[must_use]
    pub fn new(behavior: SimBehavior) -> Self {
        Self {
            inner: Arc::new(SimInner {
                behavior: Mutex::new(behavior),
                state: Mutex::new(SimState::default()),
            }),
        }
    }

    /// Server configured from a fleet configuration.
    #[must_use]
    pub fn from_config(config: &FleetConfig) -> Self {
        Self::new(SimBehavior::from_config(config))
    }

    /// Modify behaviour for future connections (and world queries).
    pub fn update_behavior(&self, update: impl FnOnce(&mut SimBehavior)) {
        update(&mut lock(&self.inner.behavior));
    }

    /// Make the next `count` connection attempts fail with `kind`.
    pub fn fail_next_connects(&self, kind: ClientErrorKind, count: usize) {
        let mut state = lock(&self.inner.state);
        state
            .connect_failures
            .extend(std::iter::repeat(kind).take(count));
    }

    fn session(&self, username: &str) -> Option<Arc<SimSession>> {
        lock(&self.inner.state)
            .sessions
            .get(username)
            .filter(|s| !s.is_closed())
            .cloned()
    }

    /// Disconnect `username` with a kick reason. Returns whether a live
    /// session existed.
    pub fn kick(&self, username: &str, reason: &str) -> bool {
        let Some(session) = self.session(username) else {
            return false;
        };
        session.emit(GameEvent::Kicked(reason.to_owned()));
        session.emit(GameEvent::End("kicked".into()));
        session.close();
        true
    }

    /// Close `username`'s connection without a reason.
    pub fn end(&self, username: &str) -> bool {
        let Some(session) = self.session(username) else {
            return false;
        };
        session.emit(GameEvent::End("socket closed".into()));
        session.close();
        true
    }

    /// Deliver a client error to `username` without closing the connection.
    pub fn error(&self, username: &str, error: ClientError) -> bool {
        let Some(session) = self.session(username) else {
            return false;
        };
        session.emit(GameEvent::Error(error));
        true
    }

    /// Send chat text to `username`.
    pub fn say(&self, username: &str, text: &str) -> bool {
        let Some(session) = self.session(username) else {
            return false;
        };
        session.emit(GameEvent::Message(text.to_owned()));
        true
    }

    /// Move `username`'s entity.
    pub fn teleport(&self, username: &str, position: Vec3) -> bool {
        let Some(session) = self.session(username) else {
            return false;
        };
        session.teleport(position);
        true
    }

    /// Current entity of `username`'s live session.
    #[must_use]
    pub fn entity(&self, username: &str) -> Option<EntityState> {
        self.session(username).and_then(|s| s.entity())
    }

    /// Open connections for `username`.
    #[must_use]
    pub fn live_connections(&self, username: &str) -> usize {
        lock(&self.inner.state)
            .live
            .get(username)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of simultaneously open connections seen for `username`.
    #[must_use]
    pub fn peak_connections(&self, username: &str) -> usize {
        lock(&self.inner.state)
            .peak
            .get(username)
            .copied()
            .unwrap_or(0)
    }

    /// Times at which `username` connected.
    #[must_use]
    pub fn connect_times(&self, username: &str) -> Vec<Instant> {
        lock(&self.inner.state)
            .connects
            .get(username)
            .cloned()
            .unwrap_or_default()
    }

    /// Successful digs by `username`.
    #[must_use]
    pub fn digs(&self, username: &str) -> Vec<(BlockPos, Instant)> {
        lock(&self.inner.state)
            .digs
            .iter()
            .filter(|(u, _, _)| u == username)
            .map(|(_, pos, at)| (*pos, *at))
            .collect()
    }

    /// Chat lines sent by `username`.
    #[must_use]
    pub fn chats(&self, username: &str) -> Vec<String> {
        lock(&self.inner.state)
            .chats
            .iter()
            .filter(|(u, _)| u == username)
            .map(|(_, text)| text.clone())
            .collect()
    }

    /// Raw packets written by `username`.
    #[must_use]
    pub fn packets(&self, username: &str) -> Vec<(OutboundPacket, Instant)> {
        lock(&self.inner.state)
            .packets
            .iter()
            .filter(|(u, _, _)| u == username)
            .map(|(_, p, at)| (p.clone(), *at))
            .collect()
    }
}

impl Connector for SimServer {
    fn connect(&self, options: ConnectOptions) -> BoxFuture<'_, Result<Connection, ClientError>> {
        Box::pin(async move {
            let failure = lock(&self.inner.state).connect_failures.pop_front();
            if let Some(kind) = failure {
                return Err(ClientError::new(
                    kind,
                    format!("simulated connect failure to {}:{}", options.host, options.port),
                ));
            }

            let behavior = self.inner.behavior();
            let (tx, rx) = mpsc::unbounded_channel();
            let session = Arc::new(SimSession {
                username: options.username.clone(),
                server: Arc::clone(&self.inner),
                events: tx,
                cancel: CancellationToken::new(),
                state: Mutex::new(SessionState::new()),
            });

            {
                let mut state = lock(&self.inner.state);
                let live = state.live.entry(options.username.clone()).or_insert(0);
                *live += 1;
                let live = *live;
                let peak = state.peak.entry(options.username.clone()).or_insert(0);
                *peak = (*peak).max(live);
                state
                    .connects
                    .entry(options.username.clone())
                    .or_default()
                    .push(Instant::now());
                state
                    .sessions
                    .insert(options.username.clone(), Arc::clone(&session));
            }
            debug!(bot = %options.username, "sim connection opened");

            tokio::spawn(run_session(Arc::clone(&session), behavior));

            let session: Arc<dyn GameSession> = session;
            Ok(Connection {
                session,
                events: rx,
            })
        })
    }
}

/// Server side of one connection: spawn, greeting, keep-alives, scheduled kick.
async fn run_session(session: Arc<SimSession>, behavior: SimBehavior) {
    tokio::select! {
        () = session.cancel.cancelled() => return,
        () = tokio::time::sleep(behavior.spawn_delay) => {}
    }

    let spawn = behavior
        .spawn_positions
        .get(&session.username)
        .copied()
        .unwrap_or(behavior.spawn_position);
    {
        let mut state = lock(&session.state);
        state.entity = Some(EntityState {
            position: spawn,
            yaw: 0.0,
            pitch: 0.0,
            on_ground: true,
        });
        state.moved_at = Instant::now();
    }
    session.emit(GameEvent::Spawn);

    if behavior.login_prompt {
        session.emit(GameEvent::Message(LOGIN_PROMPT.into()));
    } else {
        if behavior.quick_login {
            session.emit(GameEvent::Message(QUICK_LOGIN_MESSAGE.into()));
        }
        if behavior.probe {
            session.emit(GameEvent::Message(PROBE_MESSAGE.into()));
        }
    }

    let kick_at = behavior.kick_after.map(|d| Instant::now() + d);
    let keep_alive = behavior.keep_alive;
    let mut next_keep_alive = keep_alive.map(|d| Instant::now() + d);

    loop {
        let keep_alive_at = next_keep_alive;
        let keep_alive_sleep = async move {
            match keep_alive_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        let kick_sleep = async move {
            match kick_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            () = session.cancel.cancelled() => break,
            () = keep_alive_sleep => {
                if session.events.send(GameEvent::KeepAlive).is_err() {
                    break;
                }
                next_keep_alive = keep_alive.map(|d| Instant::now() + d);
            }
            () = kick_sleep => {
                session.emit(GameEvent::Kicked(behavior.kick_reason.clone()));
                session.emit(GameEvent::End("kicked".into()));
                session.close();
                break;
            }
        }
    }
}

struct SessionState {
    entity: Option<EntityState>,
    moved_at: Instant,
    controls: HashSet<Control>,
    window: Option<WindowInfo>,
    window_clicks: u32,
    hotbar: u8,
    held: Option<Item>,
    inventory: Vec<Item>,
    closed: bool,
}

impl SessionState {
    fn new() -> Self {
        let inventory = vec![
            Item::new("compass", 36),
            Item::new("diamond_pickaxe", 37),
            Item::new("cobblestone", 38),
        ];
        Self {
            entity: None,
            moved_at: Instant::now(),
            controls: HashSet::new(),
            window: None,
            window_clicks: 0,
            hotbar: 0,
            held: inventory.first().cloned(),
            inventory,
            closed: false,
        }
    }

    /// Integrate walking since the last update.
    fn advance(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.moved_at).as_secs_f64();
        self.moved_at = now;
        if !self.controls.contains(&Control::Forward) {
            return;
        }
        if let Some(entity) = self.entity.as_mut() {
            let yaw = f64::from(entity.yaw);
            let step = WALK_SPEED * elapsed;
            entity.position = entity
                .position
                .offset(-yaw.sin() * step, 0.0, -yaw.cos() * step);
        }
    }
}

/// Client side of one simulated connection.
pub struct SimSession {
    username: String,
    server: Arc<SimInner>,
    events: mpsc::UnboundedSender<GameEvent>,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
}

impl SimSession {
    fn emit(&self, event: GameEvent) {
        let _ = self.events.send(event);
    }

    fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    fn close(&self) {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.controls.clear();
        }
        self.cancel.cancel();
        self.server.connection_closed(&self.username);
        debug!(bot = %self.username, "sim connection closed");
    }

    fn teleport(&self, position: Vec3) {
        let mut state = lock(&self.state);
        state.advance(Instant::now());
        if let Some(entity) = state.entity.as_mut() {
            entity.position = position;
        }
    }

    fn ensure_open(&self) -> Result<(), ActionError> {
        if self.is_closed() {
            Err(ActionError::not_connected())
        } else {
            Ok(())
        }
    }

    fn record_packet(&self, packet: OutboundPacket) {
        lock(&self.server.state)
            .packets
            .push((self.username.clone(), packet, Instant::now()));
    }

    fn on_login(&self) {
        if self.server.behavior().probe {
            self.emit(GameEvent::Message("Logged in successfully.".into()));
            self.emit(GameEvent::Message(PROBE_MESSAGE.into()));
        } else {
            self.emit(GameEvent::Message("Logged in successfully.".into()));
        }
    }
}

impl GameSession for SimSession {
    fn username(&self) -> &str {
        &self.username
    }

    fn entity(&self) -> Option<EntityState> {
        let mut state = lock(&self.state);
        state.advance(Instant::now());
        state.entity
    }

    fn block_at(&self, pos: BlockPos) -> Option<Block> {
        self.server.block_at(pos)
    }

    fn is_chunk_loaded(&self, _pos: BlockPos) -> bool {
        let loaded = lock(&self.server.behavior).chunks_loaded;
        let spawned = lock(&self.state).entity.is_some();
        loaded && spawned
    }

    fn inventory(&self) -> Vec<Item> {
        lock(&self.state).inventory.clone()
    }

    fn held_item(&self) -> Option<Item> {
        lock(&self.state).held.clone()
    }

    fn current_window(&self) -> Option<WindowInfo> {
        lock(&self.state).window.clone()
    }

    fn look(&self, yaw: f32, pitch: f32) -> BoxFuture<'_, Result<(), ActionError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = lock(&self.state);
            state.advance(Instant::now());
            if let Some(entity) = state.entity.as_mut() {
                entity.yaw = yaw;
                entity.pitch = pitch;
            }
            Ok(())
        })
    }

    fn look_at(&self, target: Vec3) -> BoxFuture<'_, Result<(), ActionError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = lock(&self.state);
            state.advance(Instant::now());
            if let Some(entity) = state.entity.as_mut() {
                entity.yaw = entity.position.yaw_towards(target);
            }
            Ok(())
        })
    }

    fn set_control_state(&self, control: Control, pressed: bool) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.advance(Instant::now());
        if pressed {
            state.controls.insert(control);
        } else {
            state.controls.remove(&control);
        }
    }

    fn clear_control_states(&self) {
        let mut state = lock(&self.state);
        state.advance(Instant::now());
        state.controls.clear();
    }

    fn dig(&self, pos: BlockPos) -> BoxFuture<'_, Result<(), ActionError>> {
        Box::pin(async move {
            self.ensure_open()?;
            if !self.block_at(pos).is_some_and(|b| !b.is_air()) {
                return Err(ActionError::new(
                    ActionErrorKind::BlockGone,
                    "block no longer exists",
                ));
            }
            let dig_time = self.server.behavior().dig_time;
            tokio::select! {
                () = self.cancel.cancelled() => {
                    return Err(ActionError::new(ActionErrorKind::Aborted, "digging aborted"));
                }
                () = tokio::time::sleep(dig_time) => {}
            }
            let regen = self.server.behavior().block_regen;
            let now = Instant::now();
            let mut state = lock(&self.server.state);
            state.mined.insert(pos, now + regen);
            state.digs.push((self.username.clone(), pos, now));
            Ok(())
        })
    }

    fn equip(&self, item: Item) -> BoxFuture<'_, Result<(), ActionError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = lock(&self.state);
            if !state.inventory.contains(&item) {
                return Err(ActionError::new(
                    ActionErrorKind::Other,
                    format!("{} is not in the inventory", item.name),
                ));
            }
            state.held = Some(item);
            Ok(())
        })
    }

    fn chat(&self, message: String) -> BoxFuture<'_, Result<(), ActionError>> {
        Box::pin(async move {
            self.ensure_open()?;
            let is_login = message.starts_with("/login ");
            lock(&self.server.state)
                .chats
                .push((self.username.clone(), message));
            if is_login {
                self.on_login();
            }
            Ok(())
        })
    }

    fn set_hotbar_slot(&self, slot: u8) -> Result<(), ActionError> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        state.hotbar = slot;
        let held = state
            .inventory
            .iter()
            .find(|i| i.slot == 36 + u16::from(slot))
            .cloned();
        state.held = held;
        Ok(())
    }

    fn activate_item(&self) -> Result<(), ActionError> {
        self.ensure_open()?;
        if !self.server.behavior().menu_window {
            return Ok(());
        }
        let mut state = lock(&self.state);
        state.window = Some(WindowInfo {
            id: MENU_WINDOW_ID,
            title: "Select a server".into(),
            slots: 27,
        });
        state.window_clicks = 0;
        Ok(())
    }

    fn write_packet(&self, packet: OutboundPacket) -> Result<(), ActionError> {
        self.ensure_open()?;
        self.record_packet(packet.clone());
        match packet {
            OutboundPacket::Position { x, y, z, on_ground } => {
                let mut state = lock(&self.state);
                state.advance(Instant::now());
                if let Some(entity) = state.entity.as_mut() {
                    entity.position = Vec3::new(x, y, z);
                    entity.on_ground = on_ground;
                }
            }
            OutboundPacket::WindowClick { window_id, .. } => {
                let join_on_menu = self.server.behavior().join_on_menu;
                let joined = {
                    let mut state = lock(&self.state);
                    if state.window.as_ref().map(|w| w.id) != Some(window_id) {
                        return Err(ActionError::new(
                            ActionErrorKind::Other,
                            format!("window {window_id} is not open"),
                        ));
                    }
                    state.window_clicks += 1;
                    let joined = state.window_clicks >= 2 && join_on_menu;
                    if joined {
                        state.window = None;
                    }
                    joined
                };
                if joined {
                    self.emit(GameEvent::Message(JOIN_MESSAGE.into()));
                }
            }
        }
        Ok(())
    }

    fn quit(&self, reason: &str) {
        debug!(bot = %self.username, reason, "sim client quit");
        self.close();
    }
}
