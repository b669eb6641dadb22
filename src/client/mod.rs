//! Game-client abstraction.
//!
//! The [`Connector`] and [`GameSession`] traits decouple session supervision
//! from the wire protocol. Everything above this module (instances, the task
//! loop, the fleet) speaks only these traits; [`sim`] provides an in-process
//! implementation used by the binary's dry-run mode and by the tests.

pub mod sim;

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::FleetConfig;
use crate::models::geometry::{BlockPos, Vec3};

/// Boxed future returned by object-safe client methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Parameters for opening one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Account name (offline auth).
    pub username: String,
    /// Protocol version string.
    pub version: String,
    /// Give up connecting after this long.
    pub connect_timeout: Duration,
    /// Client keep-alive period.
    pub keep_alive_interval: Duration,
    /// Client-side timeout check period.
    pub check_timeout_interval: Duration,
}

impl ConnectOptions {
    /// Options for `username` taken from the fleet configuration.
    #[must_use]
    pub fn from_config(config: &FleetConfig, username: &str) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            username: username.to_owned(),
            version: config.server.version.clone(),
            connect_timeout: Duration::from_millis(config.timing.connect_timeout_ms),
            keep_alive_interval: Duration::from_millis(config.timing.keep_alive_interval_ms),
            check_timeout_interval: Duration::from_millis(
                config.timing.check_timeout_interval_ms,
            ),
        }
    }
}

/// Connection-level failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    /// Socket or handshake timeout.
    Timeout,
    /// Peer reset or broken pipe.
    ConnectionReset,
    /// Connection refused.
    ConnectionRefused,
    /// Name resolution failed.
    Dns,
    /// No route to host / network unreachable.
    HostUnreachable,
    /// Connecting failed for another reason.
    ConnectFailed,
    /// The client's own keep-alive check timed out.
    ClientTimedOut,
    /// Anything else.
    Other,
}

impl ClientErrorKind {
    /// Transient network fault that never counts against the error budget.
    #[must_use]
    pub fn is_network(self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ConnectionReset
                | Self::ConnectionRefused
                | Self::Dns
                | Self::HostUnreachable
        )
    }

    /// Fault that suggests the local link is down.
    #[must_use]
    pub fn is_no_network(self) -> bool {
        matches!(self, Self::Dns | Self::HostUnreachable)
    }
}

/// Error reported by the game client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientError {
    /// Classification.
    pub kind: ClientErrorKind,
    /// Library-provided message.
    pub message: String,
}

impl ClientError {
    /// Construct an error.
    #[must_use]
    pub fn new(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl Display for ClientError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ClientError {}

/// World-interaction failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionErrorKind {
    /// Target block no longer exists.
    BlockGone,
    /// Digging was interrupted.
    Aborted,
    /// Target is out of reach.
    OutOfReach,
    /// The server did not confirm a broken block.
    NothingDug,
    /// The connection is already closed.
    NotConnected,
    /// Anything else.
    Other,
}

/// Error returned by a world action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionError {
    /// Classification.
    pub kind: ActionErrorKind,
    /// Library-provided message.
    pub message: String,
}

impl ActionError {
    /// Construct an error.
    #[must_use]
    pub fn new(kind: ActionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a closed connection.
    #[must_use]
    pub fn not_connected() -> Self {
        Self::new(ActionErrorKind::NotConnected, "not connected")
    }

    /// Expected during normal mining; logged at debug and skipped.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind,
            ActionErrorKind::BlockGone
                | ActionErrorKind::Aborted
                | ActionErrorKind::OutOfReach
                | ActionErrorKind::NothingDug
        )
    }
}

impl Display for ActionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ActionError {}

/// Snapshot of the controlled entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityState {
    /// Feet position.
    pub position: Vec3,
    /// Horizontal look angle in radians.
    pub yaw: f32,
    /// Vertical look angle in radians.
    pub pitch: f32,
    /// Ground contact.
    pub on_ground: bool,
}

/// A world block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Registry name, e.g. `stone`.
    pub name: String,
}

impl Block {
    /// Construct a block.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Empty space.
    #[must_use]
    pub fn air() -> Self {
        Self::new("air")
    }

    /// Whether the block is empty space.
    #[must_use]
    pub fn is_air(&self) -> bool {
        self.name.ends_with("air")
    }
}

/// An inventory stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Registry name, e.g. `diamond_pickaxe`.
    pub name: String,
    /// Inventory slot.
    pub slot: u16,
}

impl Item {
    /// Construct an item.
    #[must_use]
    pub fn new(name: impl Into<String>, slot: u16) -> Self {
        Self {
            name: name.into(),
            slot,
        }
    }
}

/// An open container window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    /// Protocol window id.
    pub id: u8,
    /// Window title.
    pub title: String,
    /// Number of slots.
    pub slots: u16,
}

/// Movement controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Control {
    /// Walk forward.
    Forward,
    /// Walk backward.
    Back,
    /// Strafe left.
    Left,
    /// Strafe right.
    Right,
    /// Jump.
    Jump,
    /// Sprint.
    Sprint,
    /// Sneak.
    Sneak,
}

/// Raw packets written past the high-level API.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundPacket {
    /// Player position update.
    Position {
        /// X.
        x: f64,
        /// Y.
        y: f64,
        /// Z.
        z: f64,
        /// Ground contact flag.
        on_ground: bool,
    },
    /// Click inside a container window.
    WindowClick {
        /// Window id.
        window_id: u8,
        /// Clicked slot.
        slot: u16,
        /// Mouse button.
        mouse_button: u8,
        /// Click mode.
        mode: u8,
        /// Name of the item in the slot, if known.
        item: Option<String>,
    },
}

/// Events emitted by a connection, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    /// The entity entered the world.
    Spawn,
    /// Chat or system text.
    Message(String),
    /// The server disconnected the client with a reason.
    Kicked(String),
    /// The connection closed.
    End(String),
    /// Client-side failure.
    Error(ClientError),
    /// A keep-alive round trip completed.
    KeepAlive,
}

/// One live connection's world view and action primitives.
pub trait GameSession: Send + Sync {
    /// Account name.
    fn username(&self) -> &str;

    /// Controlled entity, if spawned.
    fn entity(&self) -> Option<EntityState>;

    /// Block at `pos`; `None` when unknown.
    fn block_at(&self, pos: BlockPos) -> Option<Block>;

    /// Whether the region holding `pos` has been received.
    fn is_chunk_loaded(&self, pos: BlockPos) -> bool;

    /// Inventory contents.
    fn inventory(&self) -> Vec<Item>;

    /// Item in hand.
    fn held_item(&self) -> Option<Item>;

    /// Open container window.
    fn current_window(&self) -> Option<WindowInfo>;

    /// Set absolute look angles.
    fn look(&self, yaw: f32, pitch: f32) -> BoxFuture<'_, Result<(), ActionError>>;

    /// Face a world point.
    fn look_at(&self, target: Vec3) -> BoxFuture<'_, Result<(), ActionError>>;

    /// Press or release a movement control.
    fn set_control_state(&self, control: Control, pressed: bool);

    /// Release every movement control.
    fn clear_control_states(&self);

    /// Break the block at `pos`, resolving when it is broken.
    fn dig(&self, pos: BlockPos) -> BoxFuture<'_, Result<(), ActionError>>;

    /// Move `item` into the hand.
    fn equip(&self, item: Item) -> BoxFuture<'_, Result<(), ActionError>>;

    /// Send a chat line or command.
    fn chat(&self, message: String) -> BoxFuture<'_, Result<(), ActionError>>;

    /// Select a hotbar slot.
    ///
    /// # Errors
    ///
    /// Returns [`ActionErrorKind::NotConnected`] after the connection closed.
    fn set_hotbar_slot(&self, slot: u8) -> Result<(), ActionError>;

    /// Use the held item.
    ///
    /// # Errors
    ///
    /// Returns [`ActionErrorKind::NotConnected`] after the connection closed.
    fn activate_item(&self) -> Result<(), ActionError>;

    /// Write a raw packet.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the write fails.
    fn write_packet(&self, packet: OutboundPacket) -> Result<(), ActionError>;

    /// Close the connection. Idempotent.
    fn quit(&self, reason: &str);
}

/// A freshly opened connection.
pub struct Connection {
    /// Action and world access.
    pub session: Arc<dyn GameSession>,
    /// Event stream; closes when the connection is torn down.
    pub events: mpsc::UnboundedReceiver<GameEvent>,
}

/// Opens connections to the game server.
pub trait Connector: Send + Sync {
    /// Open one connection.
    ///
    /// # Errors
    ///
    /// Returns a classified [`ClientError`] when the connection cannot be
    /// established.
    fn connect(&self, options: ConnectOptions) -> BoxFuture<'_, Result<Connection, ClientError>>;
}
