//! Integration tests for one instance's connect → join → dig lifecycle
//! against the simulated server, on a paused clock.
//!
//! Validates:
//! - Plain login, menu navigation and join lead to mining at the stand
//! - A probe is answered with a synthetic fall before the join
//! - Position stays unconfirmed after a probe until the first mined block
//! - Keep-alive silence and teleports hand the identity back to the fleet
//! - Drift beyond the allowed distance walks the identity back
//! - The second menu click follows the first within a human gap

use std::time::Duration;

use digfleet::client::OutboundPacket;
use digfleet::models::geometry::Vec3;
use digfleet::models::status::BotStatus;
use digfleet::session::{Carry, FleetEvent, SessionPhase};
use tokio::time::Instant;

use super::test_helpers::{test_config, wait_for_digs, wait_for_phase, InstanceHarness};

#[tokio::test(start_paused = true)]
async fn plain_login_joins_and_mines() {
    let harness = InstanceHarness::new(test_config(&["Bot1"]));
    let started = Instant::now();
    let handle = harness.spawn("Bot1", 1, Carry::default());

    wait_for_phase(&handle, SessionPhase::Joined).await;
    let joined_after = started.elapsed();
    assert!(
        joined_after >= Duration::from_secs(8),
        "menu is not clicked before the probe wait expires: {joined_after:?}"
    );
    assert!(handle.flags().joined());
    assert!(handle.flags().position_confirmed());
    assert!(handle.is_online());

    wait_for_digs(&harness.sim, "Bot1", 3).await;
    let digs = harness.sim.digs("Bot1");
    assert!(digs.iter().all(|(pos, _)| pos.x == 0 && pos.z == 0));

    let chats = harness.sim.chats("Bot1");
    assert_eq!(chats, vec!["/login hunter2".to_owned()]);

    let clicks = window_clicks(&harness);
    let slots: Vec<u16> = clicks.iter().map(|(slot, _)| *slot).collect();
    assert!(slots.ends_with(&[10, 13]), "sequence ends on the second slot: {slots:?}");
    assert_eq!(harness.sim.live_connections("Bot1"), 1);
}

fn window_clicks(harness: &InstanceHarness) -> Vec<(u16, Instant)> {
    harness
        .sim
        .packets("Bot1")
        .into_iter()
        .filter_map(|(packet, at)| match packet {
            OutboundPacket::WindowClick { slot, .. } => Some((slot, at)),
            OutboundPacket::Position { .. } => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn second_menu_click_follows_within_a_human_gap() {
    let harness = InstanceHarness::new(test_config(&["Bot1"]));
    let handle = harness.spawn("Bot1", 1, Carry::default());
    wait_for_phase(&handle, SessionPhase::Joined).await;

    let clicks = window_clicks(&harness);
    let gaps: Vec<Duration> = clicks
        .windows(2)
        .filter(|pair| pair[0].0 == 10 && pair[1].0 == 13)
        .map(|pair| pair[1].1.duration_since(pair[0].1))
        .collect();
    assert!(!gaps.is_empty(), "a full sequence was sent: {clicks:?}");
    for gap in gaps {
        assert!(
            gap >= Duration::from_millis(900) && gap <= Duration::from_millis(1_505),
            "second click {gap:?} after the first"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn probe_is_answered_with_a_fall_before_join() {
    let harness = InstanceHarness::new(test_config(&["Bot1"]));
    harness.sim.update_behavior(|b| b.probe = true);
    let handle = harness.spawn("Bot1", 1, Carry::default());

    wait_for_phase(&handle, SessionPhase::Joined).await;
    assert!(
        !handle.flags().position_confirmed(),
        "a join after a probe leaves the position unconfirmed"
    );

    let positions: Vec<(f64, bool)> = harness
        .sim
        .packets("Bot1")
        .into_iter()
        .filter_map(|(packet, _)| match packet {
            OutboundPacket::Position { y, on_ground, .. } => Some((y, on_ground)),
            OutboundPacket::WindowClick { .. } => None,
        })
        .collect();
    assert!(positions.len() >= 100, "fall trajectory written");
    assert!(positions.iter().any(|(y, _)| *y < 63.0), "altitude dropped");
    let (last_y, landed) = *positions.last().expect("at least one position");
    assert!(landed, "trajectory ends on the ground");
    assert!((last_y - 64.0).abs() < f64::EPSILON);

    wait_for_digs(&harness.sim, "Bot1", 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        handle.flags().position_confirmed(),
        "first mined block confirms the position"
    );
}

#[tokio::test(start_paused = true)]
async fn quick_login_skips_password_and_probe() {
    let mut config = test_config(&["Bot1"]);
    config.simulation.login_prompt = false;
    let harness = InstanceHarness::new(config);
    let handle = harness.spawn("Bot1", 1, Carry::default());

    wait_for_phase(&handle, SessionPhase::Joined).await;
    assert!(harness.sim.chats("Bot1").is_empty());
    assert!(handle.flags().position_confirmed());
}

#[tokio::test(start_paused = true)]
async fn mining_status_is_reported_with_blocks() {
    let mut harness = InstanceHarness::new(test_config(&["Bot1"]));
    let _handle = harness.spawn("Bot1", 1, Carry::default());

    let mined = harness
        .next_event(|event| match event {
            FleetEvent::Status {
                status,
                block_mined: true,
                generation,
                ..
            } => Some((status, generation)),
            _ => None,
        })
        .await;
    assert_eq!(mined, (BotStatus::Mining, 1));
}

#[tokio::test(start_paused = true)]
async fn keep_alive_silence_hands_off_to_fleet() {
    let mut harness = InstanceHarness::new(test_config(&["Bot1"]));
    harness.sim.update_behavior(|b| b.keep_alive = None);
    let handle = harness.spawn("Bot1", 1, Carry { wait_kick_count: 2 });

    let (delay, carry) = harness
        .next_event(|event| match event {
            FleetEvent::ScheduleReconnect { delay, carry, .. } => Some((delay, carry)),
            _ => None,
        })
        .await;
    assert_eq!(delay, Duration::from_secs(5));
    assert_eq!(carry, Carry::default(), "joined before the timeout, streak reset");
    assert!(handle.flags().reconnect_scheduled());
    assert_eq!(handle.phase(), SessionPhase::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn teleport_far_from_stand_hands_off_to_fleet() {
    let mut harness = InstanceHarness::new(test_config(&["Bot1"]));
    let handle = harness.spawn("Bot1", 1, Carry::default());
    wait_for_phase(&handle, SessionPhase::Joined).await;
    wait_for_digs(&harness.sim, "Bot1", 1).await;

    assert!(harness.sim.teleport("Bot1", Vec3::new(1000.0, 70.0, 1000.0)));
    let delay = tokio::time::timeout(
        Duration::from_secs(60),
        harness.next_event(|event| match event {
            FleetEvent::ScheduleReconnect { delay, .. } => Some(delay),
            _ => None,
        }),
    )
    .await
    .expect("teleport detected by the drift check");
    assert_eq!(delay, Duration::from_secs(3));
    assert!(!handle.flags().position_confirmed());
}

#[tokio::test(start_paused = true)]
async fn small_drift_walks_back_to_stand() {
    let harness = InstanceHarness::new(test_config(&["Bot1"]));
    let handle = harness.spawn("Bot1", 1, Carry::default());
    wait_for_phase(&handle, SessionPhase::Joined).await;
    wait_for_digs(&harness.sim, "Bot1", 1).await;

    let stand = Vec3::new(0.5, 64.0, 0.5);
    assert!(harness.sim.teleport("Bot1", Vec3::new(2.5, 64.0, 0.5)));

    // Supervision starts after the settle delay, then checks every 10s.
    tokio::time::sleep(Duration::from_secs(45)).await;
    let entity = harness.sim.entity("Bot1").expect("still connected");
    assert!(
        entity.position.distance_to(stand) <= 0.8,
        "back at the stand position: {}",
        entity.position
    );
    assert!(!handle.flags().returning());
    assert_eq!(handle.phase(), SessionPhase::Joined);
}

#[tokio::test(start_paused = true)]
async fn stale_generation_stops_itself() {
    let harness = InstanceHarness::new(test_config(&["Bot1"]));
    let handle = harness.spawn("Bot1", 1, Carry::default());
    wait_for_phase(&handle, SessionPhase::Joined).await;

    harness.cell.store(2, std::sync::atomic::Ordering::SeqCst);
    // Any event or timer wakes the loop; keep-alives arrive every 10s.
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(handle.phase(), SessionPhase::Replaced);
    assert_eq!(harness.sim.live_connections("Bot1"), 0);
}
