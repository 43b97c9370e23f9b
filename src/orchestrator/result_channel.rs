//! Result channel: the path by which a running subtest reports its outcome.
//!
//! Each session registers a fresh token, replacing any previous
//! registration. Subtest processes find the endpoint and token in their
//! environment and call `POST /result` once:
//!
//! ```json
//! {"token": "…", "outcome": "PASS", "text": "all rails nominal", "plots": []}
//! ```
//!
//! Accepted calls are forwarded to the orchestrator inbox and acknowledged
//! with `{}`. Calls presenting a stale token are refused with `409`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::inbox::Inbound;
use crate::models::result::ResultReport;
use crate::{AppError, Result};

/// Environment variable carrying the result endpoint URL.
pub const ENV_RESULT_URL: &str = "QUAL_RESULT_URL";
/// Environment variable carrying the registration token.
pub const ENV_RESULT_TOKEN: &str = "QUAL_RESULT_TOKEN";
/// Environment variable carrying the unit identifier.
pub const ENV_UNIT_ID: &str = "QUAL_UNIT_ID";
/// Environment variable carrying the subtest name.
pub const ENV_SUBTEST: &str = "QUAL_SUBTEST";

/// The live registration of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Token presented by subtest processes.
    pub token: String,
    /// Owning session.
    pub session_id: String,
}

/// Body of `POST /result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultCall {
    /// Registration token from [`ENV_RESULT_TOKEN`].
    pub token: String,
    /// Reported outcome and payload.
    #[serde(flatten)]
    pub report: ResultReport,
}

/// Registration registry plus forwarding into the orchestrator inbox.
#[derive(Debug, Clone)]
pub struct ResultChannel {
    current: Arc<Mutex<Option<Registration>>>,
    inbox: mpsc::Sender<Inbound>,
    endpoint: String,
}

impl ResultChannel {
    /// Construct a channel forwarding into `inbox`; `endpoint` is the URL
    /// advertised to subtest processes.
    #[must_use]
    pub fn new(inbox: mpsc::Sender<Inbound>, endpoint: impl Into<String>) -> Self {
        Self {
            current: Arc::new(Mutex::new(None)),
            inbox,
            endpoint: endpoint.into(),
        }
    }

    /// Advertised endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Register a fresh listener for `session_id`, replacing any prior one.
    pub async fn register(&self, session_id: &str) -> Registration {
        let registration = Registration {
            token: Uuid::new_v4().to_string(),
            session_id: session_id.to_owned(),
        };
        let previous = self.current.lock().await.replace(registration.clone());
        if let Some(previous) = previous {
            info!(
                previous_session = %previous.session_id,
                session_id,
                "result channel registration replaced"
            );
        }
        registration
    }

    /// Drop the registration if it still belongs to `token`.
    pub async fn unregister(&self, token: &str) {
        let mut guard = self.current.lock().await;
        if guard.as_ref().is_some_and(|r| r.token == token) {
            *guard = None;
        }
    }

    /// Current registration, if any.
    pub async fn current(&self) -> Option<Registration> {
        self.current.lock().await.clone()
    }

    /// Forward a report presented with `token` to the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown or stale token and
    /// `AppError::Channel` if the orchestrator inbox is closed.
    pub async fn deliver(&self, token: &str, report: ResultReport) -> Result<()> {
        let registered = self
            .current
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| r.token == token);
        if !registered {
            return Err(AppError::NotFound(
                "no live result registration for token".into(),
            ));
        }

        self.inbox
            .send(Inbound::SubtestReport {
                token: token.to_owned(),
                report,
            })
            .await
            .map_err(|_| AppError::Channel("orchestrator inbox closed".into()))
    }
}

/// HTTP router exposing `POST /result` and `GET /health`.
pub fn router(channel: ResultChannel) -> Router {
    Router::new()
        .route("/result", post(post_result))
        .route("/health", get(health))
        .with_state(channel)
}

async fn health() -> &'static str {
    "ok"
}

async fn post_result(
    State(channel): State<ResultChannel>,
    Json(call): Json<ResultCall>,
) -> (StatusCode, Json<serde_json::Value>) {
    let outcome = call.report.outcome;
    match channel.deliver(&call.token, call.report).await {
        Ok(()) => {
            info!(?outcome, "subtest result received");
            (StatusCode::OK, Json(json!({})))
        }
        Err(AppError::NotFound(msg)) => {
            warn!(?outcome, "result call with stale token refused");
            (StatusCode::CONFLICT, Json(json!({ "error": msg })))
        }
        Err(err) => {
            warn!(%err, "failed to forward result");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": err.to_string() })),
            )
        }
    }
}

/// Bind the result channel listener.
///
/// # Errors
///
/// Returns `AppError::Channel` if the address cannot be bound.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::Channel(format!("failed to bind result channel on {addr}: {err}")))?;
    info!(%addr, "result channel listening");
    Ok(listener)
}

/// Serve the result channel on an already bound `listener` until `ct` fires.
///
/// # Errors
///
/// Returns `AppError::Channel` if the server fails.
pub async fn serve(
    channel: ResultChannel,
    listener: TcpListener,
    ct: CancellationToken,
) -> Result<()> {
    axum::serve(listener, router(channel))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Channel(format!("result channel server error: {err}")))?;

    info!("result channel shut down");
    Ok(())
}
