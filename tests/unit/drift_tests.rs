//! Unit tests for walking back to the stand position.
//!
//! Validates:
//! - A displaced entity walks back within the arrival distance
//! - The walk gives up after the return timeout
//! - Cancellation and a missing entity end the walk without error
//! - Controls are released whatever the outcome

use std::sync::Arc;
use std::time::Duration;

use digfleet::client::sim::{SimBehavior, SimServer};
use digfleet::client::{ConnectOptions, Connector, GameSession};
use digfleet::config::PositionConfig;
use digfleet::models::geometry::Vec3;
use digfleet::session::drift::{return_to_stand, DriftVerdict, ReturnOutcome};
use tokio_util::sync::CancellationToken;

const STAND: Vec3 = Vec3::new(0.5, 64.0, 0.5);

fn options() -> ConnectOptions {
    ConnectOptions {
        host: "sim.local".into(),
        port: 25565,
        username: "Bot1".into(),
        version: "1.20.4".into(),
        connect_timeout: Duration::from_secs(5),
        keep_alive_interval: Duration::from_secs(15),
        check_timeout_interval: Duration::from_secs(90),
    }
}

async fn session_at(spawn: Vec3) -> (SimServer, Arc<dyn GameSession>) {
    let sim = SimServer::new(SimBehavior {
        spawn_position: spawn,
        login_prompt: false,
        keep_alive: None,
        ..SimBehavior::default()
    });
    let connection = sim.connect(options()).await.expect("sim connect");
    tokio::time::sleep(Duration::from_secs(1)).await;
    (sim, connection.session)
}

#[tokio::test(start_paused = true)]
async fn walks_back_to_stand() {
    let (sim, session) = session_at(Vec3::new(4.5, 64.0, 0.5)).await;

    let outcome = return_to_stand(
        session.as_ref(),
        STAND,
        &PositionConfig::default(),
        &CancellationToken::new(),
    )
    .await
    .expect("walk completes");

    assert_eq!(outcome, ReturnOutcome::Arrived);
    let entity = sim.entity("Bot1").expect("connected");
    assert!(entity.position.horizontal_distance_to(STAND) <= 0.8, "{}", entity.position);

    // Controls were released: the entity stays put.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let later = sim.entity("Bot1").expect("connected");
    assert!(later.position.distance_to(entity.position) < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_return_timeout() {
    let (_sim, session) = session_at(Vec3::new(60.5, 64.0, 0.5)).await;
    let config = PositionConfig {
        return_timeout_ms: 1_000,
        ..PositionConfig::default()
    };

    let outcome = return_to_stand(session.as_ref(), STAND, &config, &CancellationToken::new())
        .await
        .expect("walk ends");
    assert_eq!(outcome, ReturnOutcome::TimedOut);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_the_walk() {
    let (_sim, session) = session_at(Vec3::new(6.5, 64.0, 0.5)).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = return_to_stand(session.as_ref(), STAND, &PositionConfig::default(), &cancel)
        .await
        .expect("walk ends");
    assert_eq!(outcome, ReturnOutcome::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn missing_entity_is_lost() {
    let sim = SimServer::new(SimBehavior::default());
    let connection = sim.connect(options()).await.expect("sim connect");

    // Not spawned yet.
    let outcome = return_to_stand(
        connection.session.as_ref(),
        STAND,
        &PositionConfig::default(),
        &CancellationToken::new(),
    )
    .await
    .expect("walk ends");
    assert_eq!(outcome, ReturnOutcome::Lost);
}

#[tokio::test(start_paused = true)]
async fn closed_session_is_an_error() {
    let (sim, session) = session_at(Vec3::new(4.5, 64.0, 0.5)).await;
    assert!(sim.end("Bot1"));

    let result = return_to_stand(
        session.as_ref(),
        STAND,
        &PositionConfig::default(),
        &CancellationToken::new(),
    )
    .await;
    assert!(result.is_err());
}

#[test]
fn verdicts_scale_with_the_allowed_drift() {
    let config = PositionConfig::default();
    let classify =
        |distance| DriftVerdict::classify(distance, 2.0, config.teleport_distance);

    assert_eq!(classify(1.9), DriftVerdict::Hold);
    assert_eq!(classify(2.5), DriftVerdict::Return);
    assert_eq!(classify(120.0), DriftVerdict::Return);
    assert_eq!(classify(1_000.0), DriftVerdict::Teleport);
}
