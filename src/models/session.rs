//! Session model and stage lifecycle helpers.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::decision::DecisionRequest;
use super::plan::TestPlan;
use super::result::SubtestResult;

/// Stage of the test session state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "stage", content = "index", rename_all = "snake_case")]
pub enum Stage {
    /// No session.
    Idle,
    /// Instructions shown; waiting for the operator to continue.
    AwaitingInstructionAck,
    /// Running prestartup scripts.
    PreStartup,
    /// Launching the startup script.
    Startup,
    /// Running pre-subtest and launching the subtest script.
    SubtestActive(usize),
    /// Subtest running; waiting for its result channel call.
    AwaitingAutoResult(usize),
    /// Waiting for an operator verdict.
    AwaitingHumanDecision(usize),
    /// Recording the result and running the post-subtest script.
    PostSubtest(usize),
    /// No further subtests will run.
    Finishing,
    /// Running the shutdown script and stopping process groups.
    Shutdown,
    /// Results are final and awaiting submission.
    ResultsReady,
    /// Cancellation in progress.
    Cancelled,
}

impl Stage {
    /// Whether `cancel` is accepted from this stage.
    #[must_use]
    pub fn is_cancellable(self) -> bool {
        !matches!(self, Self::Idle | Self::ResultsReady | Self::Cancelled)
    }

    /// Subtest index carried by the stage, if any.
    #[must_use]
    pub fn subtest_index(self) -> Option<usize> {
        match self {
            Self::SubtestActive(i)
            | Self::AwaitingAutoResult(i)
            | Self::AwaitingHumanDecision(i)
            | Self::PostSubtest(i) => Some(i),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::AwaitingInstructionAck => write!(f, "awaiting_instruction_ack"),
            Self::PreStartup => write!(f, "pre_startup"),
            Self::Startup => write!(f, "startup"),
            Self::SubtestActive(i) => write!(f, "subtest_active({i})"),
            Self::AwaitingAutoResult(i) => write!(f, "awaiting_auto_result({i})"),
            Self::AwaitingHumanDecision(i) => write!(f, "awaiting_human_decision({i})"),
            Self::PostSubtest(i) => write!(f, "post_subtest({i})"),
            Self::Finishing => write!(f, "finishing"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::ResultsReady => write!(f, "results_ready"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How a session ended, as recorded in the history database.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    /// Session still running.
    Active,
    /// All scheduled subtests finished; report not yet submitted.
    ResultsReady,
    /// Prestartup failed; synthetic failure recorded.
    Aborted,
    /// Cancelled by operator or error; no report produced.
    Cancelled,
    /// Report submitted.
    Submitted,
    /// Results discarded without submission.
    Discarded,
}

impl HistoryStatus {
    /// Database representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::ResultsReady => "results_ready",
            Self::Aborted => "aborted",
            Self::Cancelled => "cancelled",
            Self::Submitted => "submitted",
            Self::Discarded => "discarded",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(Self::Active),
            "results_ready" => Some(Self::ResultsReady),
            "aborted" => Some(Self::Aborted),
            "cancelled" => Some(Self::Cancelled),
            "submitted" => Some(Self::Submitted),
            "discarded" => Some(Self::Discarded),
            _ => None,
        }
    }
}

/// One end-to-end run of a test plan against one unit.
///
/// Mutated exclusively by the orchestrator. Process-group handles live
/// beside it in the orchestrator so this record stays plain data.
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique session identifier.
    pub id: String,
    /// Unit under test.
    pub unit_id: String,
    /// Optional rework note supplied at start.
    pub rework_note: Option<String>,
    /// Creation timestamp; keys the submitted report.
    pub created_at: DateTime<Utc>,
    /// Immutable plan.
    pub plan: Arc<TestPlan>,
    /// Current stage.
    pub stage: Stage,
    /// Index of the current subtest; `None` until a subtest starts.
    pub subtest_index: Option<usize>,
    /// Append-only results.
    pub results: Vec<SubtestResult>,
    /// Outstanding human decision, if any.
    pub pending_decision: Option<DecisionRequest>,
    /// Result channel token for this session.
    pub result_token: String,
}

impl Session {
    /// Construct a fresh session in `Idle`.
    #[must_use]
    pub fn new(unit_id: String, rework_note: Option<String>, plan: Arc<TestPlan>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            unit_id,
            rework_note,
            created_at: Utc::now(),
            plan,
            stage: Stage::Idle,
            subtest_index: None,
            results: Vec::new(),
            pending_decision: None,
            result_token: String::new(),
        }
    }

    /// Name of the current subtest, if one has started.
    #[must_use]
    pub fn current_subtest(&self) -> Option<&str> {
        self.subtest_index
            .and_then(|i| self.plan.subtest(i))
            .map(|s| s.name.as_str())
    }

    /// Whether `index` is the last subtest of the plan.
    #[must_use]
    pub fn is_last_subtest(&self, index: usize) -> bool {
        index + 1 >= self.plan.len()
    }
}

/// Read-only view of orchestrator state for front ends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session identifier; absent when idle.
    pub session_id: Option<String>,
    /// Unit under test; absent when idle.
    pub unit_id: Option<String>,
    /// Plan name; absent when idle.
    pub plan: Option<String>,
    /// Current stage.
    pub stage: Stage,
    /// Current subtest index.
    pub subtest_index: Option<usize>,
    /// Current subtest name.
    pub subtest: Option<String>,
    /// Accumulated results.
    pub results: Vec<SubtestResult>,
    /// Outstanding decision request.
    pub pending_decision: Option<DecisionRequest>,
    /// Live process-group handles.
    pub active_groups: usize,
}

impl SessionSnapshot {
    /// Snapshot of an idle orchestrator.
    #[must_use]
    pub fn idle() -> Self {
        Self {
            session_id: None,
            unit_id: None,
            plan: None,
            stage: Stage::Idle,
            subtest_index: None,
            subtest: None,
            results: Vec::new(),
            pending_decision: None,
            active_groups: 0,
        }
    }
}
