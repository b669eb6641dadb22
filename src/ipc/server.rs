//! Local IPC server for `digfleet-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands
//! and forwards them to the fleet actor through [`FleetControl`].
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "status"}
//! {"command": "toggle-pause", "auth_token": "secret"}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "unknown command: foo"}
//! ```

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::fleet::FleetControl;
use crate::{AppError, Result};

/// Inbound request from `digfleet-ctl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpcRequest {
    /// Command verb.
    pub command: String,
    /// Shared-secret authentication token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// Outbound reply to `digfleet-ctl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// What the server needs to answer commands.
#[derive(Debug, Clone)]
pub struct IpcState {
    /// Fleet actor client.
    pub control: FleetControl,
    /// Required token, if any.
    pub auth_token: Option<String>,
}

/// Spawn the IPC server task listening on `name`.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    name: &str,
    state: IpcState,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = name.to_owned();
    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let span = info_span!("ipc_server", name = %name);
    let handle = tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => match accept_result {
                        Ok(stream) => {
                            tokio::spawn(handle_connection(stream, state.clone()));
                        }
                        Err(err) => warn!(%err, "IPC accept failed"),
                    },
                }
            }
        }
        .instrument(span),
    );

    Ok(handle)
}

async fn handle_connection(stream: interprocess::local_socket::tokio::Stream, state: IpcState) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_command(&request, &state).await,
                        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }
    }
    .instrument(span)
    .await;
}

/// Authenticate `request` and run it against the fleet.
pub async fn dispatch_command(request: &IpcRequest, state: &IpcState) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    async {
        if let Some(expected) = state.auth_token.as_deref() {
            if request.auth_token.as_deref() != Some(expected) {
                warn!("IPC request rejected: invalid auth token");
                return IpcResponse::error("unauthorized");
            }
        }

        let control = &state.control;
        let result = match request.command.as_str() {
            "status" => control
                .status()
                .await
                .and_then(|snapshot| to_value(&snapshot)),
            "pause" => control
                .set_paused(true)
                .await
                .map(|paused| serde_json::json!({ "paused": paused })),
            "resume" => control
                .set_paused(false)
                .await
                .map(|paused| serde_json::json!({ "paused": paused })),
            "toggle-pause" => control
                .toggle_pause()
                .await
                .map(|paused| serde_json::json!({ "paused": paused })),
            "reconnect" => control
                .restart()
                .await
                .map(|started| serde_json::json!({ "restarting": started })),
            "rotate" => control
                .rotate()
                .await
                .map(|started| serde_json::json!({ "rotating": started })),
            "reset-stats" => control
                .reset_stats()
                .await
                .map(|()| serde_json::json!({ "reset": true })),
            "shutdown" => control
                .shutdown()
                .await
                .map(|()| serde_json::json!({ "stopping": true })),
            other => return IpcResponse::error(format!("unknown command: {other}")),
        };

        match result {
            Ok(data) => {
                info!("ipc command handled");
                IpcResponse::success(data)
            }
            Err(err) => IpcResponse::error(err.to_string()),
        }
    }
    .instrument(span)
    .await
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|err| AppError::Ipc(format!("serialization failed: {err}")))
}
