//! Decision surface: the operator-facing side of a session.
//!
//! The orchestrator never blocks on the surface. It announces what the
//! operator should see; the operator answers later through the session
//! control surface (IPC or an [`OrchestratorHandle`](super::inbox::OrchestratorHandle)),
//! which marshals the answer onto the orchestrator's inbox.

use std::path::Path;

use tracing::{info, warn};

use crate::models::decision::DecisionRequest;
use crate::models::result::SubtestResult;

/// Capability to show session state to an operator and request verdicts.
pub trait DecisionSurface: Send + Sync {
    /// Show the instructions document and wait for an acknowledgement.
    fn present_instructions(&self, unit_id: &str, document: &Path);

    /// Ask for a pass/fail/retry verdict on an ambiguous subtest.
    fn request_decision(&self, request: &DecisionRequest);

    /// The outstanding request was resolved or abandoned.
    fn withdraw_decision(&self, session_id: &str);

    /// Results are final and ready for submission.
    fn present_results(&self, unit_id: &str, results: &[SubtestResult]);
}

/// Surface that renders everything into the structured log.
///
/// Operators act on the log through `qual-ctl`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSurface;

impl DecisionSurface for LogSurface {
    fn present_instructions(&self, unit_id: &str, document: &Path) {
        info!(
            unit_id,
            document = %document.display(),
            "instructions pending; acknowledge with `qual-ctl ack`"
        );
    }

    fn request_decision(&self, request: &DecisionRequest) {
        info!(
            session_id = %request.session_id,
            subtest = %request.subtest,
            plots = request.report.plots.len(),
            text = %request.report.text,
            "subtest needs a human verdict; answer with `qual-ctl accept|reject|retry`"
        );
    }

    fn withdraw_decision(&self, session_id: &str) {
        info!(session_id, "decision request closed");
    }

    fn present_results(&self, unit_id: &str, results: &[SubtestResult]) {
        for result in results {
            if let Some(ref reason) = result.failure_reason {
                warn!(unit_id, subtest = %result.name, outcome = result.outcome.as_str(), reason, "result");
            } else {
                info!(unit_id, subtest = %result.name, outcome = result.outcome.as_str(), "result");
            }
        }
        info!(
            unit_id,
            count = results.len(),
            "results ready; submit with `qual-ctl submit` or drop with `qual-ctl discard`"
        );
    }
}
