//! Integration tests for reconnect scheduling and replacement.
//!
//! Validates:
//! - Rate-limit kicks escalate the delay and carry the streak forward
//! - Kick, end and error at the same instant yield exactly one reconnect
//! - Connect failures schedule a reconnect without a spawn
//! - Unresolvable hosts report lost network
//! - Non-forced reconnects inside the spawn grace window are deferred

use std::time::Duration;

use digfleet::client::{ClientError, ClientErrorKind};
use digfleet::session::{Carry, FleetEvent, SessionPhase};
use tokio::time::Instant;

use super::test_helpers::{test_config, wait_for_phase, wait_for_spawn, InstanceHarness};

const RATE_LIMIT_KICK: &str = "Please wait 10 minutes before reconnecting";

fn secs(value: Duration) -> u64 {
    value.as_secs()
}

#[tokio::test(start_paused = true)]
async fn rate_limit_kicks_escalate_and_carry_the_streak() {
    let mut harness = InstanceHarness::new(test_config(&["Bot1"]));

    // First kick after a join: the streak restarts from zero.
    let first = harness.spawn("Bot1", 1, Carry::default());
    wait_for_phase(&first, SessionPhase::Joined).await;
    let kicked_at = Instant::now();
    assert!(harness.sim.kick("Bot1", RATE_LIMIT_KICK));
    let carry = harness.next_replace().await;
    let waited_first = kicked_at.elapsed();
    assert_eq!(carry.wait_kick_count, 1);
    assert!((600..=660).contains(&secs(waited_first)), "{waited_first:?}");
    assert_eq!(first.flags().wait_kick_count(), 1);
    first.shutdown().await;

    // Kicked again before joining: the streak grows.
    let second = harness.spawn("Bot1", 2, carry);
    wait_for_spawn(&second).await;
    let kicked_at = Instant::now();
    assert!(harness.sim.kick("Bot1", RATE_LIMIT_KICK));
    let carry = harness.next_replace().await;
    let waited_second = kicked_at.elapsed();
    assert_eq!(carry.wait_kick_count, 2);
    assert!((900..=960).contains(&secs(waited_second)), "{waited_second:?}");
    second.shutdown().await;

    let third = harness.spawn("Bot1", 3, carry);
    wait_for_spawn(&third).await;
    let kicked_at = Instant::now();
    assert!(harness.sim.kick("Bot1", RATE_LIMIT_KICK));
    let carry = harness.next_replace().await;
    let waited_third = kicked_at.elapsed();
    assert_eq!(carry.wait_kick_count, 3);
    assert!(waited_first < waited_second && waited_second < waited_third);
    third.shutdown().await;

    assert_eq!(harness.sim.peak_connections("Bot1"), 1);
}

#[tokio::test(start_paused = true)]
async fn simultaneous_disconnect_signals_schedule_one_reconnect() {
    let mut harness = InstanceHarness::new(test_config(&["Bot1"]));
    let handle = harness.spawn("Bot1", 1, Carry::default());
    wait_for_phase(&handle, SessionPhase::Joined).await;
    harness.drain();

    let at = Instant::now();
    assert!(harness.sim.error(
        "Bot1",
        ClientError::new(ClientErrorKind::ConnectionReset, "read ECONNRESET"),
    ));
    assert!(harness.sim.kick("Bot1", "Server restarting"));

    harness.next_replace().await;
    let waited = at.elapsed();
    assert!(
        (8..=20).contains(&secs(waited)),
        "first signal's network delay wins: {waited:?}"
    );
    let delay = handle.flags().last_reconnect_delay();
    assert!(delay >= Duration::from_secs(8) && delay < Duration::from_secs(20));

    tokio::time::sleep(Duration::from_secs(120)).await;
    let extra: Vec<FleetEvent> = harness
        .drain()
        .into_iter()
        .filter(|event| {
            matches!(
                event,
                FleetEvent::Replace { .. } | FleetEvent::ScheduleReconnect { .. }
            )
        })
        .collect();
    assert!(extra.is_empty(), "no second reconnect: {extra:?}");
    assert_eq!(handle.phase(), SessionPhase::Replaced);
    assert_eq!(harness.sim.live_connections("Bot1"), 0);
}

#[tokio::test(start_paused = true)]
async fn connect_failure_schedules_reconnect() {
    let mut harness = InstanceHarness::new(test_config(&["Bot1"]));
    harness
        .sim
        .fail_next_connects(ClientErrorKind::ConnectionRefused, 1);
    let at = Instant::now();
    let handle = harness.spawn("Bot1", 1, Carry::default());

    harness.next_replace().await;
    assert!(
        (15..=30).contains(&secs(at.elapsed())),
        "refused connect backs off as a connect failure: {:?}",
        at.elapsed()
    );
    let delay = handle.flags().last_reconnect_delay();
    assert!(delay >= Duration::from_secs(15) && delay <= Duration::from_secs(30));
    assert!(!handle.flags().online());
    assert!(harness.sim.connect_times("Bot1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn unresolvable_host_reports_lost_network() {
    let mut harness = InstanceHarness::new(test_config(&["Bot1"]));
    harness.sim.fail_next_connects(ClientErrorKind::Dns, 1);
    let handle = harness.spawn("Bot1", 1, Carry::default());

    harness
        .next_event(|event| match event {
            FleetEvent::NoInternet { .. } => Some(()),
            _ => None,
        })
        .await;
    harness.next_replace().await;
    let delay = handle.flags().last_reconnect_delay();
    assert!(delay >= Duration::from_secs(20) && delay <= Duration::from_secs(40));
}

#[tokio::test(start_paused = true)]
async fn clean_end_inside_grace_window_is_deferred() {
    let mut harness = InstanceHarness::new(test_config(&["Bot1"]));
    let handle = harness.spawn("Bot1", 1, Carry::default());
    wait_for_spawn(&handle).await;

    let at = Instant::now();
    assert!(harness.sim.end("Bot1"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(
        !handle.flags().reconnect_scheduled(),
        "deferred while the grace window is open"
    );

    harness.next_replace().await;
    let waited = secs(at.elapsed());
    // 20s deferral, then the 8-20s end delay.
    assert!((28..=40).contains(&waited), "{waited}");
}

#[tokio::test(start_paused = true)]
async fn client_noise_is_ignored() {
    let mut harness = InstanceHarness::new(test_config(&["Bot1"]));
    let handle = harness.spawn("Bot1", 1, Carry::default());
    wait_for_phase(&handle, SessionPhase::Joined).await;
    harness.drain();

    assert!(harness.sim.error(
        "Bot1",
        ClientError::new(ClientErrorKind::Other, "Ignoring block entities as chunk failed to load"),
    ));
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert!(!handle.flags().reconnect_scheduled());
    assert!(handle.flags().online());
    let errors = harness
        .drain()
        .into_iter()
        .filter(|event| matches!(event, FleetEvent::GlobalError { .. }))
        .count();
    assert_eq!(errors, 0);
}
