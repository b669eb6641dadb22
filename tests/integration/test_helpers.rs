//! Shared test helpers for instance- and fleet-level integration tests.
//!
//! Provides a small fleet configuration backed by the simulated server, a
//! harness that spawns single instances against a fake fleet mailbox, and
//! polling helpers for paused-clock tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use digfleet::client::sim::SimServer;
use digfleet::config::FleetConfig;
use digfleet::session::{
    Carry, FleetEvent, FleetHooks, Generation, InstanceContext, InstanceHandle, SessionInstance,
    SessionPhase,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Upper bound for any single wait in simulated time.
pub const WAIT_LIMIT: Duration = Duration::from_secs(120);

/// Build a valid configuration with one identity per name. Identity `i`
/// digs the two stacked blocks at `x = i * 10` and stands next to them.
pub fn test_config(names: &[&str]) -> FleetConfig {
    let mut toml = String::from(
        r#"
[server]
host = "sim.local"
version = "1.20.4"
password = "hunter2"

[ipc]
enabled = false
"#,
    );
    for (i, name) in names.iter().enumerate() {
        let x = i * 10;
        toml.push_str(&format!(
            r#"
[[bots]]
username = "{name}"
blocks = [{{ x = {x}, y = 64, z = 0 }}, {{ x = {x}, y = 65, z = 0 }}]
stand_position = {{ x = {x}.5, y = 64.0, z = 0.5 }}
"#
        ));
    }
    FleetConfig::from_toml_str(&toml).expect("valid test config")
}

/// Spawns instances for one identity against a fake fleet mailbox.
pub struct InstanceHarness {
    pub sim: SimServer,
    pub config: Arc<FleetConfig>,
    pub events: mpsc::UnboundedReceiver<FleetEvent>,
    pub cell: Arc<AtomicU64>,
    events_tx: mpsc::UnboundedSender<FleetEvent>,
    cancel: CancellationToken,
}

impl InstanceHarness {
    pub fn new(config: FleetConfig) -> Self {
        let sim = SimServer::from_config(&config);
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            sim,
            config: Arc::new(config),
            events,
            cell: Arc::new(AtomicU64::new(0)),
            events_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Start generation `generation` of `username`, making it current.
    pub fn spawn(&self, username: &str, generation: u64, carry: Carry) -> InstanceHandle {
        self.cell.store(generation, Ordering::SeqCst);
        let identity = self
            .config
            .identity(username)
            .expect("identity configured")
            .clone();
        SessionInstance::spawn(InstanceContext {
            identity: Arc::new(identity),
            config: Arc::clone(&self.config),
            connector: Arc::new(self.sim.clone()),
            hooks: FleetHooks::new(
                self.events_tx.clone(),
                username,
                Generation::new(Arc::clone(&self.cell), generation),
            ),
            paused: Arc::default(),
            carry,
            cancel: self.cancel.clone(),
        })
    }

    /// Wait for the next event matching `pick`, skipping the rest.
    pub async fn next_event<T>(&mut self, mut pick: impl FnMut(FleetEvent) -> Option<T>) -> T {
        loop {
            let event = self.events.recv().await.expect("fleet mailbox open");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    }

    /// Wait for the next replacement request and return its carry.
    pub async fn next_replace(&mut self) -> Carry {
        self.next_event(|event| match event {
            FleetEvent::Replace { carry, .. } => Some(carry),
            _ => None,
        })
        .await
    }

    /// Drain everything already queued.
    pub fn drain(&mut self) -> Vec<FleetEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

/// Block until `handle` publishes `phase`.
pub async fn wait_for_phase(handle: &InstanceHandle, phase: SessionPhase) {
    wait_until_phase(handle, |p| p == phase).await;
}

/// Block until the published phase satisfies `done`.
pub async fn wait_until_phase(handle: &InstanceHandle, done: impl Fn(SessionPhase) -> bool) {
    let mut rx = handle.subscribe();
    tokio::time::timeout(WAIT_LIMIT, rx.wait_for(|p| done(*p)))
        .await
        .expect("phase reached in time")
        .map(|_| ())
        .expect("phase channel open");
}

/// Block until the instance has spawned in the world.
pub async fn wait_for_spawn(handle: &InstanceHandle) {
    wait_until_phase(handle, |p| {
        !matches!(p, SessionPhase::Connecting | SessionPhase::Replaced)
    })
    .await;
}

/// Poll until `username` has at least `count` recorded digs.
pub async fn wait_for_digs(sim: &SimServer, username: &str, count: usize) {
    tokio::time::timeout(WAIT_LIMIT, async {
        while sim.digs(username).len() < count {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await
    .expect("digs recorded in time");
}

/// Poll until `username` has connected `count` times.
pub async fn wait_for_connects(sim: &SimServer, username: &str, count: usize, limit: Duration) {
    tokio::time::timeout(limit, async {
        while sim.connect_times(username).len() < count {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("connections opened in time");
}
