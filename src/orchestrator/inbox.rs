//! Inbound event queue and the session control handle.
//!
//! Everything that wants to change session state (operator commands,
//! decision resolutions, result channel calls) is marshalled into an
//! [`Inbound`] message. The orchestrator drains the queue at the top of each
//! scheduler tick, so a [`Session`](crate::models::session::Session) only
//! ever has one writer.

use tokio::sync::{mpsc, oneshot};

use crate::models::decision::Verdict;
use crate::models::result::ResultReport;
use crate::models::session::SessionSnapshot;
use crate::persistence::session_repo::HistoryEntry;
use crate::report::SubmissionReceipt;
use crate::{AppError, Result};

/// Capacity of the orchestrator inbox.
pub const INBOX_CAPACITY: usize = 64;

/// Message delivered to the orchestrator's inbox.
#[derive(Debug)]
pub enum Inbound {
    /// Start a session for a unit.
    StartSession {
        /// Unit identifier.
        unit_id: String,
        /// Optional rework note.
        rework_note: Option<String>,
        /// Reply with the snapshot after the session opened.
        reply: oneshot::Sender<Result<SessionSnapshot>>,
    },
    /// Operator read the instructions.
    AcknowledgeInstructions {
        /// Reply channel.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Cancel the active session.
    Cancel {
        /// Reason recorded in the log and history.
        reason: String,
        /// Reply channel.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Resolve the outstanding human decision.
    ResolveDecision {
        /// Operator verdict.
        verdict: Verdict,
        /// Reply channel.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Submit the final report.
    SubmitReport {
        /// Summary text; the rendered summary is used when absent.
        summary: Option<String>,
        /// Operator notes appended to the summary.
        notes: Option<String>,
        /// Reply channel.
        reply: oneshot::Sender<Result<SubmissionReceipt>>,
    },
    /// Drop final results without submitting.
    DiscardResults {
        /// Reply channel.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Read the current state.
    Status {
        /// Reply channel.
        reply: oneshot::Sender<SessionSnapshot>,
    },
    /// List recently finished sessions.
    History {
        /// Maximum entries.
        limit: u32,
        /// Reply channel.
        reply: oneshot::Sender<Result<Vec<HistoryEntry>>>,
    },
    /// A subtest reported its outcome over the result channel.
    SubtestReport {
        /// Registration token presented by the subtest.
        token: String,
        /// Reported outcome and payload.
        report: ResultReport,
    },
}

/// Create the inbox channel pair.
#[must_use]
pub fn channel() -> (OrchestratorHandle, mpsc::Receiver<Inbound>) {
    let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
    (OrchestratorHandle { tx }, rx)
}

/// Cloneable session control surface.
///
/// Every method enqueues a message and waits for the orchestrator to
/// process it on its next tick.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Inbound>,
}

impl OrchestratorHandle {
    /// Raw sender, used by the result channel.
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<Inbound> {
        self.tx.clone()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Inbound,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| AppError::Channel("orchestrator is not running".into()))?;
        rx.await
            .map_err(|_| AppError::Channel("orchestrator dropped the request".into()))
    }

    /// Start a session for `unit_id`.
    ///
    /// Replies once the session is open (core services up, result channel
    /// registered); the startup sequence continues afterwards.
    ///
    /// # Errors
    ///
    /// `NoPlanForUnit`, `EmptyPlan`, `Manifest` or `Launch` from the
    /// orchestrator, or `Channel` if it is not running.
    pub async fn start_session(
        &self,
        unit_id: impl Into<String>,
        rework_note: Option<String>,
    ) -> Result<SessionSnapshot> {
        let unit_id = unit_id.into();
        self.request(|reply| Inbound::StartSession {
            unit_id,
            rework_note,
            reply,
        })
        .await?
    }

    /// Acknowledge the instructions document.
    ///
    /// # Errors
    ///
    /// `InvalidState` when no instructions are pending.
    pub async fn acknowledge_instructions(&self) -> Result<()> {
        self.request(|reply| Inbound::AcknowledgeInstructions { reply })
            .await?
    }

    /// Cancel the active session.
    ///
    /// # Errors
    ///
    /// `InvalidState` when there is nothing to cancel.
    pub async fn cancel(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.request(|reply| Inbound::Cancel { reason, reply })
            .await?
    }

    /// Resolve the outstanding decision.
    ///
    /// # Errors
    ///
    /// `NoPendingDecision` when no decision is outstanding.
    pub async fn resolve_decision(&self, verdict: Verdict) -> Result<()> {
        self.request(|reply| Inbound::ResolveDecision { verdict, reply })
            .await?
    }

    /// Submit the final report.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless results are ready.
    pub async fn submit_report(
        &self,
        summary: Option<String>,
        notes: Option<String>,
    ) -> Result<SubmissionReceipt> {
        self.request(|reply| Inbound::SubmitReport {
            summary,
            notes,
            reply,
        })
        .await?
    }

    /// Discard final results.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless results are ready.
    pub async fn discard_results(&self) -> Result<()> {
        self.request(|reply| Inbound::DiscardResults { reply })
            .await?
    }

    /// Current state.
    ///
    /// # Errors
    ///
    /// `Channel` if the orchestrator is not running.
    pub async fn status(&self) -> Result<SessionSnapshot> {
        self.request(|reply| Inbound::Status { reply }).await
    }

    /// Recent session history.
    ///
    /// # Errors
    ///
    /// `Db` on query failure or `Channel` if the orchestrator is not running.
    pub async fn history(&self, limit: u32) -> Result<Vec<HistoryEntry>> {
        self.request(|reply| Inbound::History { limit, reply })
            .await?
    }
}
