#![forbid(unsafe_code)]

//! `qual-ctl`: operator CLI companion for `qual-sequencer`.
//!
//! Connects to the IPC socket and sends JSON session control commands.

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "qual-ctl",
    about = "Operator CLI for the qualification sequencer",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the server's `ipc_name` config).
    #[arg(long, default_value = "qual-sequencer")]
    ipc_name: String,

    /// Shared secret for servers started with `ipc_auth`; defaults to `QUAL_IPC_TOKEN`.
    #[arg(long)]
    auth_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a test session for a unit.
    Start {
        /// Unit identifier (serial number).
        unit_id: String,
        /// Hardware rework note recorded against the unit.
        #[arg(long)]
        note: Option<String>,
    },

    /// Check whether a test is defined for a unit.
    Check {
        /// Unit identifier (serial number).
        unit_id: String,
    },

    /// Acknowledge the instructions and continue.
    Ack,

    /// Cancel the active session.
    Cancel {
        /// Reason recorded in the session history.
        #[arg(long)]
        reason: Option<String>,
    },

    /// Pass the subtest awaiting a verdict.
    Accept,

    /// Fail the subtest awaiting a verdict.
    Reject {
        /// Failure reason.
        reason: Option<String>,
    },

    /// Run the subtest awaiting a verdict again.
    Retry,

    /// Submit the final report.
    Submit {
        /// Replace the generated summary.
        #[arg(long)]
        summary: Option<String>,
        /// Notes appended to the summary.
        #[arg(long)]
        notes: Option<String>,
    },

    /// Drop final results without submitting.
    Discard,

    /// Show the current session state.
    Status,

    /// List recent sessions.
    History {
        /// Maximum number of sessions.
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

impl Command {
    fn to_request(&self) -> serde_json::Value {
        use serde_json::json;

        match self {
            Self::Start { unit_id, note } => {
                json!({ "command": "start", "unit_id": unit_id, "note": note })
            }
            Self::Check { unit_id } => json!({ "command": "check", "unit_id": unit_id }),
            Self::Ack => json!({ "command": "ack" }),
            Self::Cancel { reason } => json!({ "command": "cancel", "reason": reason }),
            Self::Accept => json!({ "command": "accept" }),
            Self::Reject { reason } => json!({ "command": "reject", "reason": reason }),
            Self::Retry => json!({ "command": "retry" }),
            Self::Submit { summary, notes } => {
                json!({ "command": "submit", "summary": summary, "notes": notes })
            }
            Self::Discard => json!({ "command": "discard" }),
            Self::Status => json!({ "command": "status" }),
            Self::History { limit } => json!({ "command": "history", "limit": limit }),
        }
    }
}

fn main() {
    let args = Cli::parse();
    let mut request_json = args.command.to_request();
    let auth_token = args
        .auth_token
        .clone()
        .or_else(|| std::env::var("QUAL_IPC_TOKEN").ok());
    if let (Some(token), Some(obj)) = (auth_token, request_json.as_object_mut()) {
        obj.insert("auth_token".to_owned(), serde_json::Value::String(token));
    }

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj
                    .get("ok")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let err_msg = obj
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to server: {err}");
            eprintln!("Is qual-sequencer running with ipc_name '{}'?", args.ipc_name);
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

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
