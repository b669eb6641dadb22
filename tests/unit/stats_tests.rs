use std::time::Duration;

use digfleet::models::stats::FleetStats;
use digfleet::models::status::BotStatus;
use tokio::time::Instant;

#[test]
fn snapshot_aggregates_per_identity_counters() {
    let start = Instant::now();
    let mut stats = FleetStats::new(start);
    for _ in 0..3 {
        stats.update("Bot1", BotStatus::Mining, true, start);
    }
    stats.update("Bot2", BotStatus::Connecting, false, start);

    let later = start + Duration::from_secs(1800);
    let snapshot = stats.snapshot(later, false);

    assert_eq!(snapshot.total_bots, 2);
    assert_eq!(snapshot.active_bots, 1);
    assert_eq!(snapshot.total_blocks, 3);
    assert_eq!(snapshot.uptime_seconds, 1800);
    assert!((snapshot.blocks_per_hour - 6.0).abs() < 1e-9);

    let bot1 = &snapshot.bots[0];
    assert_eq!(bot1.username, "Bot1");
    assert_eq!(bot1.blocks_total, 3);
    assert_eq!(bot1.blocks_last_minute, 0);
    assert_eq!(bot1.seconds_since_last_block, 1800);
    assert_eq!(snapshot.bots[1].status, BotStatus::Connecting);
}

#[test]
fn empty_uptime_has_zero_rate() {
    let now = Instant::now();
    let stats = FleetStats::new(now);
    let snapshot = stats.snapshot(now, true);

    assert!(snapshot.paused);
    assert_eq!(snapshot.total_bots, 0);
    assert!(snapshot.blocks_per_hour.abs() < f64::EPSILON);
}

#[test]
fn reset_zeroes_counts_but_keeps_identity_and_run() {
    let now = Instant::now();
    let mut stats = FleetStats::new(now);
    stats.update("Bot1", BotStatus::Mining, true, now);
    stats.update("Bot1", BotStatus::Mining, true, now);
    let run_id = stats.snapshot(now, false).run_id;

    stats.reset_counts();

    let snapshot = stats.snapshot(now, false);
    assert_eq!(snapshot.total_blocks, 0);
    assert_eq!(snapshot.bots[0].blocks_total, 0);
    assert_eq!(snapshot.bots[0].status, BotStatus::Mining);
    assert_eq!(snapshot.run_id, run_id);
}

#[test]
fn status_without_block_keeps_last_block_time() {
    let start = Instant::now();
    let mut stats = FleetStats::new(start);
    stats.update("Bot1", BotStatus::Mining, true, start);
    stats.update(
        "Bot1",
        BotStatus::Waiting,
        false,
        start + Duration::from_secs(30),
    );

    let bot = stats.get("Bot1").expect("registered");
    assert_eq!(bot.status, BotStatus::Waiting);
    assert_eq!(bot.last_block_at, start);
    assert_eq!(bot.blocks_total, 1);
}

#[test]
fn status_labels_are_lowercase() {
    assert_eq!(BotStatus::Mining.to_string(), "mining");
    assert_eq!(BotStatus::Returning.as_str(), "returning");
    assert_eq!(
        serde_json::to_string(&BotStatus::Offline).expect("serialize"),
        "\"offline\""
    );
}
