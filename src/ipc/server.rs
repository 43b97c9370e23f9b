//! Local IPC server for `qual-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Every command is forwarded to the
//! orchestrator through an [`OrchestratorHandle`].
//!
//! ## Protocol
//!
//! Request (one JSON object per line; `auth_token` is required when the
//! server was started with one):
//! ```json
//! {"command": "start", "unit_id": "PSU-0042", "note": "replaced C12"}
//! {"command": "ack"}
//! {"command": "reject", "reason": "ripple out of spec"}
//! {"command": "submit", "notes": "bench 3"}
//! {"command": "history", "limit": 10}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "no pending decision"}
//! ```

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::manifest::ManifestStore;
use crate::models::decision::Verdict;
use crate::orchestrator::OrchestratorHandle;
use crate::{AppError, Result};

const DEFAULT_HISTORY_LIMIT: u32 = 20;

/// Inbound IPC request from `qual-ctl`.
#[derive(Debug, Deserialize)]
struct IpcRequest {
    /// Command verb.
    command: String,
    /// Shared-secret authentication token.
    auth_token: Option<String>,
    /// Unit identifier (for `start`, `check`).
    unit_id: Option<String>,
    /// Rework note (for `start`).
    note: Option<String>,
    /// Cancellation or rejection reason.
    reason: Option<String>,
    /// Report summary override (for `submit`).
    summary: Option<String>,
    /// Operator notes appended to the report (for `submit`).
    notes: Option<String>,
    /// Maximum entries (for `history`).
    limit: Option<u32>,
}

/// Outbound IPC response to `qual-ctl`.
#[derive(Debug, Serialize)]
struct IpcResponse {
    /// Whether the command succeeded.
    ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn done() -> Self {
        Self {
            ok: true,
            data: None,
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

    fn from_result<T: Serialize>(result: Result<T>) -> Self {
        match result.and_then(|value| {
            serde_json::to_value(value)
                .map_err(|err| AppError::Ipc(format!("failed to encode response: {err}")))
        }) {
            Ok(data) => Self::success(data),
            Err(err) => Self::error(err.to_string()),
        }
    }

    fn from_unit(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::done(),
            Err(err) => Self::error(err.to_string()),
        }
    }
}

/// Everything a connection needs to serve commands.
#[derive(Clone)]
struct IpcContext {
    handle: OrchestratorHandle,
    manifests: Arc<dyn ManifestStore>,
    auth_token: Option<String>,
}

/// Spawn the IPC server task.
///
/// When `auth_token` is set, commands that do not carry the same token are
/// answered with `unauthorized`.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    name: String,
    handle: OrchestratorHandle,
    manifests: Arc<dyn ManifestStore>,
    auth_token: Option<String>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let context = IpcContext {
        handle,
        manifests,
        auth_token,
    };
    let span = info_span!("ipc_server", name = %name);
    let task = tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                tokio::spawn(handle_connection(stream, context.clone()));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span),
    );

    Ok(task)
}

/// Handle a single IPC client connection.
async fn handle_connection(stream: interprocess::local_socket::tokio::Stream, context: IpcContext) {
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
                        Ok(request) => dispatch_command(request, &context).await,
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

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Route an IPC command to the orchestrator.
async fn dispatch_command(request: IpcRequest, context: &IpcContext) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    let handle = &context.handle;
    async move {
        if let Some(ref expected) = context.auth_token {
            match request.auth_token {
                Some(ref provided) if provided == expected => {}
                _ => {
                    warn!("IPC request rejected: invalid auth token");
                    return IpcResponse::error("unauthorized");
                }
            }
        }

        match request.command.as_str() {
            "start" => {
                let Some(unit_id) = request.unit_id else {
                    return IpcResponse::error("missing required 'unit_id' field");
                };
                IpcResponse::from_result(handle.start_session(unit_id, request.note).await)
            }
            "check" => {
                let Some(unit_id) = request.unit_id else {
                    return IpcResponse::error("missing required 'unit_id' field");
                };
                let has_plan = context.manifests.has_plan(&unit_id);
                IpcResponse::success(json!({ "unit_id": unit_id, "has_plan": has_plan }))
            }
            "ack" => IpcResponse::from_unit(handle.acknowledge_instructions().await),
            "cancel" => {
                let reason = request
                    .reason
                    .unwrap_or_else(|| "cancelled by operator".to_owned());
                IpcResponse::from_unit(handle.cancel(reason).await)
            }
            "accept" => IpcResponse::from_unit(handle.resolve_decision(Verdict::Accept).await),
            "reject" => {
                let verdict = Verdict::Reject {
                    reason: request.reason.unwrap_or_default(),
                };
                IpcResponse::from_unit(handle.resolve_decision(verdict).await)
            }
            "retry" => IpcResponse::from_unit(handle.resolve_decision(Verdict::Retry).await),
            "submit" => IpcResponse::from_result(
                handle.submit_report(request.summary, request.notes).await,
            ),
            "discard" => IpcResponse::from_unit(handle.discard_results().await),
            "status" => IpcResponse::from_result(handle.status().await),
            "history" => {
                let limit = request.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
                IpcResponse::from_result(handle.history(limit).await)
            }
            other => {
                warn!(command = other, "unknown ipc command");
                IpcResponse::error(format!("unknown command: {other}"))
            }
        }
    }
    .instrument(span)
    .await
}
