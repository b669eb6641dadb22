use std::io::Write;

use digfleet::config::{DelayRange, FleetConfig};
use digfleet::models::geometry::{BlockPos, Vec3};
use digfleet::AppError;

fn minimal_toml() -> String {
    r#"
[server]
host = "play.example.net"
version = "1.20.4"
password = "secret"

[[bots]]
username = "Miner1"
blocks = [{ x = 10, y = 64, z = -3 }]
"#
    .to_owned()
}

fn config_error(raw: &str) -> String {
    match FleetConfig::from_toml_str(raw) {
        Err(AppError::Config(msg)) => msg,
        other => panic!("expected a config error, got {other:?}"),
    }
}

#[test]
fn minimal_config_fills_defaults() {
    let config = FleetConfig::from_toml_str(&minimal_toml()).expect("valid config");

    assert_eq!(config.server.port, 25565);
    assert_eq!(config.timing.restart_if_idle_ms, 120_000);
    assert_eq!(config.timing.stuck_threshold_ms, 30_000);
    assert_eq!(config.timing.grace_after_spawn_ms, 20_000);
    assert_eq!(config.timing.keep_alive_timeout_ms, 28_000);
    assert_eq!(config.antibot.probe_wait_ms, 8_000);
    assert_eq!(config.menu.slot1, 10);
    assert_eq!(config.menu.slot2, 13);
    assert_eq!(config.menu.max_attempts, 6);
    assert_eq!(config.global_restart.error_threshold, 15);
    assert!(config.global_restart.unstable_internet_mode);
    assert!(!config.global_restart.stop_on_no_internet);
    assert_eq!(config.backoff.rate_limit_base_ms, 600_000);
    assert_eq!(config.backoff.kick, DelayRange::new(10_000, 20_000));
    assert!(config.features.active_fall_check);
    assert!(config.ipc.enabled);
    assert_eq!(config.ipc.name, "digfleet");

    let bot = config.identity("Miner1").expect("identity present");
    assert_eq!(bot.blocks, vec![BlockPos::new(10, 64, -3)]);
    assert!(bot.stand_position.is_none());
    assert!((bot.max_distance(&config.position) - 0.6).abs() < f64::EPSILON);
    assert_eq!(bot.menu_slots(&config.menu), (10, 13));
}

#[test]
fn identity_overrides_are_applied() {
    let raw = format!(
        "{}stand_position = {{ x = 11.5, y = 64.0, z = -2.5 }}\nmax_distance_from_stand = 1.5\nmenu_slot1 = 20\n",
        minimal_toml()
    );
    let config = FleetConfig::from_toml_str(&raw).expect("valid config");
    let bot = &config.bots[0];

    assert_eq!(bot.stand_position, Some(Vec3::new(11.5, 64.0, -2.5)));
    assert!((bot.max_distance(&config.position) - 1.5).abs() < f64::EPSILON);
    assert_eq!(bot.menu_slots(&config.menu), (20, 13));
}

#[test]
fn sections_override_defaults() {
    let raw = format!(
        "{}\n[menu]\nmax_attempts = 2\n\n[global_restart]\nstop_on_no_internet = true\nno_internet_threshold = 3\n",
        minimal_toml()
    );
    let config = FleetConfig::from_toml_str(&raw).expect("valid config");

    assert_eq!(config.menu.max_attempts, 2);
    assert_eq!(config.menu.retry_min_ms, 3_000);
    assert!(config.global_restart.stop_on_no_internet);
    assert_eq!(config.global_restart.no_internet_threshold, 3);
}

#[test]
fn every_violation_is_reported_at_once() {
    let msg = config_error(
        r#"
[server]
host = ""

[menu]
max_attempts = 0

[[bots]]
username = "Miner1"
blocks = []
"#,
    );

    assert!(msg.contains("server.host is required"), "{msg}");
    assert!(msg.contains("server.version is required"), "{msg}");
    assert!(msg.contains("server.password is required"), "{msg}");
    assert!(msg.contains("menu.max_attempts"), "{msg}");
    assert!(msg.contains("bots[0].blocks must be a non-empty list"), "{msg}");
}

#[test]
fn missing_bots_is_rejected() {
    let msg = config_error(
        r#"
[server]
host = "play.example.net"
version = "1.20.4"
password = "secret"
"#,
    );
    assert!(msg.contains("bots must be a non-empty list"), "{msg}");
}

#[test]
fn duplicate_username_is_rejected() {
    let raw = format!(
        "{}\n[[bots]]\nusername = \"Miner1\"\nblocks = [{{ x = 0, y = 64, z = 0 }}]\n",
        minimal_toml()
    );
    let msg = config_error(&raw);
    assert!(msg.contains("bots[1].username 'Miner1' is duplicated"), "{msg}");
}

#[test]
fn zero_watchdog_interval_is_rejected() {
    let raw = format!("{}\n[timing]\nkeep_alive_check_ms = 0\n", minimal_toml());
    let msg = config_error(&raw);
    assert!(msg.contains("watchdog intervals"), "{msg}");
}

#[test]
fn inverted_menu_retry_range_is_rejected() {
    let raw = format!(
        "{}\n[menu]\nretry_min_ms = 9000\nretry_max_ms = 1000\n",
        minimal_toml()
    );
    let msg = config_error(&raw);
    assert!(msg.contains("menu.retry_min_ms"), "{msg}");
}

#[test]
fn malformed_toml_is_a_config_error() {
    let msg = config_error("[server\nhost = 1");
    assert!(msg.starts_with("invalid config"), "{msg}");
}

#[test]
fn load_from_path_reads_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(minimal_toml().as_bytes()).expect("write config");

    let config = FleetConfig::load_from_path(file.path()).expect("loaded");
    assert_eq!(config.server.host, "play.example.net");
}

#[test]
fn load_from_missing_path_fails() {
    let dir = tempfile::tempdir().expect("temp dir");
    let err = FleetConfig::load_from_path(dir.path().join("absent.toml"))
        .expect_err("missing file");
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("failed to read config")));
}
