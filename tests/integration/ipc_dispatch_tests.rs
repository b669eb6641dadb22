//! Integration tests for IPC command dispatch against a running fleet.
//!
//! Validates:
//! - `status` returns the fleet snapshot as JSON
//! - `toggle-pause`, `pause` and `resume` report the new flag
//! - Unknown commands and bad tokens are rejected
//! - `shutdown` stops the fleet actor
//! - A request over a real local socket gets a line-delimited reply

use std::sync::Arc;
use std::time::Duration;

use digfleet::client::sim::SimServer;
use digfleet::fleet::FleetManager;
use digfleet::ipc::server::{dispatch_command, spawn_ipc_server, IpcRequest, IpcResponse, IpcState};
use digfleet::Result;
use interprocess::local_socket::tokio::{prelude::*, Stream};
use interprocess::local_socket::GenericNamespaced;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::test_helpers::test_config;

fn start(auth_token: Option<&str>) -> (IpcState, JoinHandle<Result<()>>, CancellationToken) {
    let config = test_config(&["Bot1"]);
    let sim = SimServer::from_config(&config);
    let cancel = CancellationToken::new();
    let (manager, control) = FleetManager::new(Arc::new(config), Arc::new(sim), cancel.clone());
    let task = tokio::spawn(manager.run());
    let state = IpcState {
        control,
        auth_token: auth_token.map(str::to_owned),
    };
    (state, task, cancel)
}

fn request(command: &str, auth_token: Option<&str>) -> IpcRequest {
    IpcRequest {
        command: command.to_owned(),
        auth_token: auth_token.map(str::to_owned),
    }
}

#[tokio::test(start_paused = true)]
async fn status_returns_snapshot() {
    let (state, task, cancel) = start(None);

    let response = dispatch_command(&request("status", None), &state).await;
    assert!(response.ok, "{response:?}");
    let data = response.data.expect("status payload");
    assert_eq!(data["paused"], serde_json::json!(false));
    assert_eq!(data["total_bots"], serde_json::json!(1));

    cancel.cancel();
    task.await.expect("fleet task").expect("clean exit");
}

#[tokio::test(start_paused = true)]
async fn pause_commands_report_the_flag() {
    let (state, task, cancel) = start(None);

    let toggled = dispatch_command(&request("toggle-pause", None), &state).await;
    assert_eq!(toggled.data, Some(serde_json::json!({ "paused": true })));

    let resumed = dispatch_command(&request("resume", None), &state).await;
    assert_eq!(resumed.data, Some(serde_json::json!({ "paused": false })));

    let paused = dispatch_command(&request("pause", None), &state).await;
    assert_eq!(paused.data, Some(serde_json::json!({ "paused": true })));

    let status = dispatch_command(&request("status", None), &state).await;
    assert_eq!(
        status.data.expect("status payload")["paused"],
        serde_json::json!(true)
    );

    cancel.cancel();
    task.await.expect("fleet task").expect("clean exit");
}

#[tokio::test(start_paused = true)]
async fn unknown_command_is_rejected() {
    let (state, task, cancel) = start(None);

    let response = dispatch_command(&request("foo", None), &state).await;
    assert!(!response.ok);
    assert_eq!(response.error.as_deref(), Some("unknown command: foo"));
    assert!(response.data.is_none());

    cancel.cancel();
    task.await.expect("fleet task").expect("clean exit");
}

#[tokio::test(start_paused = true)]
async fn auth_token_is_enforced() {
    let (state, task, cancel) = start(Some("secret"));

    let missing = dispatch_command(&request("status", None), &state).await;
    assert_eq!(missing.error.as_deref(), Some("unauthorized"));

    let wrong = dispatch_command(&request("status", Some("guess")), &state).await;
    assert_eq!(wrong.error.as_deref(), Some("unauthorized"));

    let accepted = dispatch_command(&request("status", Some("secret")), &state).await;
    assert!(accepted.ok, "{accepted:?}");

    cancel.cancel();
    task.await.expect("fleet task").expect("clean exit");
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_fleet() {
    let (state, task, _cancel) = start(None);

    let response = dispatch_command(&request("shutdown", None), &state).await;
    assert_eq!(response.data, Some(serde_json::json!({ "stopping": true })));

    tokio::time::timeout(Duration::from_secs(30), task)
        .await
        .expect("fleet stopped in time")
        .expect("fleet task")
        .expect("clean exit");

    let after = dispatch_command(&request("status", None), &state).await;
    assert!(!after.ok, "actor has exited");
}

#[tokio::test]
async fn socket_roundtrip_answers_one_line_per_request() {
    let (state, task, cancel) = start(None);
    let name = format!("digfleet-test-{}", uuid::Uuid::new_v4());
    let server = spawn_ipc_server(&name, state, cancel.clone()).expect("listener created");

    let socket_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .expect("valid socket name");
    let stream = Stream::connect(socket_name).await.expect("connect");
    let (reader, mut writer) = stream.split();
    let mut lines = BufReader::new(reader).lines();

    writer
        .write_all(b"{\"command\":\"toggle-pause\"}\nnot json\n")
        .await
        .expect("write requests");

    let first = lines.next_line().await.expect("read").expect("reply");
    let first: IpcResponse = serde_json::from_str(&first).expect("json reply");
    assert_eq!(first.data, Some(serde_json::json!({ "paused": true })));

    let second = lines.next_line().await.expect("read").expect("reply");
    let second: IpcResponse = serde_json::from_str(&second).expect("json reply");
    assert!(!second.ok);
    assert!(second
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("invalid json")));

    cancel.cancel();
    server.await.expect("server task");
    task.await.expect("fleet task").expect("clean exit");
}
