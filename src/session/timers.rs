//! Named, cancellable timers owned by one session instance.
//!
//! Each timer is a spawned task holding a child of the instance token. On
//! expiry it checks the generation token and only then posts its message to
//! the instance mailbox, so a timer that outlives its instance is a no-op.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::hooks::Generation;

/// Timer slots; arming a slot replaces whatever it held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// End of the post-spawn grace window.
    Grace,
    /// Keep-alive watchdog poll.
    KeepAlive,
    /// Probe never arrived; bypass satisfied.
    BypassFallback,
    /// Hard ceiling of a running bypass.
    BypassCeiling,
    /// Join without the server message after a probe.
    AutoJoin,
    /// Next menu attempt.
    MenuTick,
    /// Second click of a menu attempt.
    MenuSecondClick,
    /// Drift supervision settle delay.
    DriftStart,
    /// Drift check poll.
    PositionCheck,
    /// Proactive restart of a joined session.
    PreventiveRestart,
    /// Humanized delay before the dig loop starts.
    StartTaskLoop,
    /// Deferred reconnect request during the grace window.
    Deferred,
    /// Scheduled reconnect.
    Reconnect,
}

/// Timer registry for one instance.
#[derive(Debug)]
pub struct Timers<M> {
    parent: CancellationToken,
    slots: HashMap<TimerKind, CancellationToken>,
    tx: mpsc::UnboundedSender<M>,
    generation: Generation,
}

impl<M: Send + 'static> Timers<M> {
    /// Registry whose timers post to `tx` while `generation` is current.
    #[must_use]
    pub fn new(
        parent: CancellationToken,
        tx: mpsc::UnboundedSender<M>,
        generation: Generation,
    ) -> Self {
        Self {
            parent,
            slots: HashMap::new(),
            tx,
            generation,
        }
    }

    /// Post `message` once after `delay`.
    pub fn arm(&mut self, kind: TimerKind, delay: Duration, message: M) {
        let token = self.replace_slot(kind);
        let tx = self.tx.clone();
        let generation = self.generation.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if generation.is_current() && !token.is_cancelled() {
                        let _ = tx.send(message);
                    }
                    token.cancel();
                }
            }
        });
    }

    /// Post a message from `make` every `period` until cancelled.
    pub fn arm_interval<F>(&mut self, kind: TimerKind, period: Duration, make: F)
    where
        F: Fn() -> M + Send + 'static,
    {
        let token = self.replace_slot(kind);
        let tx = self.tx.clone();
        let generation = self.generation.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !generation.is_current() || tx.send(make()).is_err() {
                            token.cancel();
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Whether `kind` is armed and has not fired or been cancelled.
    #[must_use]
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots.get(&kind).is_some_and(|t| !t.is_cancelled())
    }

    /// Disarm one slot.
    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(token) = self.slots.remove(&kind) {
            token.cancel();
        }
    }

    /// Disarm every slot.
    pub fn cancel_all(&mut self) {
        for (_, token) in self.slots.drain() {
            token.cancel();
        }
    }

    /// Disarm every slot except `keep`.
    pub fn cancel_all_except(&mut self, keep: TimerKind) {
        self.slots.retain(|kind, token| {
            if *kind == keep {
                return true;
            }
            token.cancel();
            false
        });
    }

    fn replace_slot(&mut self, kind: TimerKind) -> CancellationToken {
        let token = self.parent.child_token();
        if let Some(previous) = self.slots.insert(kind, token.clone()) {
            previous.cancel();
        }
        token
    }
}
