//! Human decision requests and verdicts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::result::ResultReport;

/// Outstanding request for an operator to judge an ambiguous subtest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecisionRequest {
    /// Owning session identifier.
    pub session_id: String,
    /// Unit under test.
    pub unit_id: String,
    /// Index of the subtest awaiting judgement.
    pub subtest_index: usize,
    /// Name of the subtest awaiting judgement.
    pub subtest: String,
    /// Report delivered by the subtest, including plots for display.
    pub report: ResultReport,
    /// When the request was raised.
    pub requested_at: DateTime<Utc>,
}

/// Operator verdict resolving a [`DecisionRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Record the subtest as passed.
    Accept,
    /// Record the subtest as failed with the operator's reason.
    Reject {
        /// Failure reason entered by the operator.
        reason: String,
    },
    /// Discard the report and run the subtest again from its pre-script.
    Retry,
}
