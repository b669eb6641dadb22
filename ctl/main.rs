#![forbid(unsafe_code)]

//! `digfleet-ctl`: local CLI companion for `digfleet`.
//!
//! Connects to the IPC socket, sends one JSON command and prints the reply.

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "digfleet-ctl",
    about = "Local CLI for a running digfleet",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the server's `[ipc] name`).
    #[arg(long, default_value = "digfleet")]
    ipc_name: String,

    /// Shared secret, when the server sets `[ipc] auth_token`.
    #[arg(long, env = "DIGFLEET_IPC_TOKEN")]
    auth_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print fleet statistics.
    Status,
    /// Pause digging on every bot.
    Pause,
    /// Resume digging.
    Resume,
    /// Flip the pause flag.
    TogglePause,
    /// Restart every bot.
    Reconnect,
    /// Rotate online bots one by one.
    Rotate,
    /// Zero block counters.
    ResetStats,
    /// Stop the fleet and exit.
    Shutdown,
}

impl Command {
    fn verb(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::TogglePause => "toggle-pause",
            Self::Reconnect => "reconnect",
            Self::Rotate => "rotate",
            Self::ResetStats => "reset-stats",
            Self::Shutdown => "shutdown",
        }
    }
}

fn main() {
    let args = Cli::parse();

    let mut request_json = serde_json::json!({ "command": args.command.verb() });
    if let Some(token) = &args.auth_token {
        request_json["auth_token"] = serde_json::Value::String(token.clone());
    }

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            let ok = response
                .get("ok")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            if ok {
                match response.get("data") {
                    Some(data) => {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    }
                    None => println!("OK"),
                }
            } else {
                let err_msg = response
                    .get("error")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unknown error");
                eprintln!("Error: {err_msg}");
                std::process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to digfleet: {err}");
            eprintln!("Is digfleet running with ipc name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    Ok(serde_json::from_str(response_line.trim())?)
}
