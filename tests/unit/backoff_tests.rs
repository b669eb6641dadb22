//! Unit tests for the reconnect delay policy.
//!
//! Validates:
//! - Rate-limit delays grow strictly with the streak until the cap
//! - Every disconnect class samples inside its configured range
//! - Seeded RNGs make delays reproducible

use std::time::Duration;

use digfleet::config::BackoffConfig;
use digfleet::session::backoff::{jitter, BackoffPolicy};
use digfleet::session::signals::{ErrorClass, KickClass};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn policy() -> BackoffPolicy {
    BackoffPolicy::new(BackoffConfig::default())
}

fn within(value: Duration, min_secs: u64, max_secs: u64) -> bool {
    value >= Duration::from_secs(min_secs) && value < Duration::from_secs(max_secs)
}

#[test]
fn rate_limit_escalates_then_plateaus() {
    let policy = policy();
    let bases: Vec<Duration> = (1..=8).map(|streak| policy.rate_limit_base(streak)).collect();

    for pair in bases[..5].windows(2) {
        assert!(pair[0] < pair[1], "strictly increasing before the cap: {bases:?}");
    }
    for base in &bases[4..] {
        assert_eq!(*base, Duration::from_secs(1800));
    }
}

#[test]
fn streak_zero_is_treated_as_first_kick() {
    let policy = policy();
    assert_eq!(policy.rate_limit_base(0), policy.rate_limit_base(1));
}

#[test]
fn rate_limit_jitter_stays_under_a_minute() {
    let policy = policy();
    let mut rng = StdRng::seed_from_u64(11);
    for streak in 1..=6 {
        let base = policy.rate_limit_base(streak);
        let delay = policy.rate_limit(streak, &mut rng);
        assert!(delay >= base && delay < base + Duration::from_secs(60));
    }
}

#[test]
fn kick_classes_sample_their_ranges() {
    let policy = policy();
    let mut rng = StdRng::seed_from_u64(12);
    for _ in 0..50 {
        assert!(within(policy.after_kick(KickClass::TooFast, 0, &mut rng), 300, 600));
        assert!(within(policy.after_kick(KickClass::AntibotFailed, 0, &mut rng), 15, 30));
        assert!(within(policy.after_kick(KickClass::AntibotRejected, 0, &mut rng), 8, 20));
        assert!(within(policy.after_kick(KickClass::AlreadyConnected, 0, &mut rng), 45, 90));
        assert!(within(policy.after_kick(KickClass::Other, 0, &mut rng), 10, 20));
        assert!(within(policy.after_kick(KickClass::RateLimited, 1, &mut rng), 600, 660));
    }
}

#[test]
fn error_classes_sample_their_ranges() {
    let policy = policy();
    let mut rng = StdRng::seed_from_u64(13);
    let mut sample = |class| policy.after_error(class, &mut rng).expect("scheduled");
    for _ in 0..50 {
        assert!(within(sample(ErrorClass::NoNetwork), 20, 40));
        assert!(within(sample(ErrorClass::Network), 8, 20));
        assert!(within(sample(ErrorClass::ConnectFailed), 15, 30));
        assert!(within(sample(ErrorClass::ClientTimeout), 20, 40));
        assert!(within(sample(ErrorClass::Other), 15, 30));
    }
}

#[test]
fn other_causes_sample_their_ranges() {
    let policy = policy();
    let mut rng = StdRng::seed_from_u64(14);
    assert!(within(policy.after_end(&mut rng), 8, 20));
    assert!(within(policy.after_menu_exhausted(&mut rng), 60, 180));
    assert!(within(policy.preventive(&mut rng), 5, 10));
    assert_eq!(policy.after_teleport(), Duration::from_secs(3));
}

#[test]
fn seeded_rng_is_reproducible() {
    let policy = policy();
    let draws = |seed| {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..10)
            .map(|_| policy.after_end(&mut rng))
            .collect::<Vec<_>>()
    };
    assert_eq!(draws(42), draws(42));
}

#[test]
fn jitter_stays_in_half_open_range() {
    let mut rng = StdRng::seed_from_u64(15);
    for _ in 0..200 {
        let value = jitter(&mut rng, 100, 102);
        assert!(value == Duration::from_millis(100) || value == Duration::from_millis(101));
    }
}
