use std::time::Duration;

use digfleet::fleet::window::ErrorWindow;
use tokio::time::Instant;

#[test]
fn events_outside_the_window_do_not_count() {
    let start = Instant::now();
    let mut window = ErrorWindow::new(Duration::from_secs(120), 3);

    assert!(!window.record(start));
    assert!(!window.record(start + Duration::from_secs(60)));
    // The first event has aged out by now.
    assert!(!window.record(start + Duration::from_secs(130)));
    assert_eq!(window.count(start + Duration::from_secs(130)), 2);

    assert!(window.record(start + Duration::from_secs(140)));
}

#[test]
fn window_starts_over_after_tripping() {
    let start = Instant::now();
    let mut window = ErrorWindow::new(Duration::from_secs(600), 2);

    assert!(!window.record(start));
    assert!(window.record(start));
    assert!(!window.record(start + Duration::from_secs(1)));
    assert!(window.record(start + Duration::from_secs(2)));
}

#[test]
fn zero_threshold_behaves_like_one() {
    let mut window = ErrorWindow::new(Duration::from_secs(10), 0);
    assert!(window.record(Instant::now()));
}

#[test]
fn clear_forgets_events() {
    let start = Instant::now();
    let mut window = ErrorWindow::new(Duration::from_secs(60), 3);
    window.record(start);
    window.record(start);
    window.clear();

    assert_eq!(window.count(start), 0);
    assert!(!window.record(start));
}

#[test]
fn event_exactly_at_the_edge_still_counts() {
    let start = Instant::now();
    let mut window = ErrorWindow::new(Duration::from_secs(60), 2);

    assert!(!window.record(start));
    assert!(window.record(start + Duration::from_secs(60)));
}
