//! Test session state machine.
//!
//! The [`Orchestrator`] owns at most one [`Session`] together with the
//! process-group handles launched for it. It is driven from a single task:
//! inbound events are applied through [`Orchestrator::handle`], and
//! [`Orchestrator::tick`] runs any pending synchronous stages before polling
//! every live group. Synchronous stages (prestartup, pre-subtest,
//! post-subtest, shutdown) are awaited inline; the subtest script itself is
//! left running until its result channel call arrives.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::groups::{ActiveGroups, GroupSlot};
use super::inbox::Inbound;
use super::result_channel::{
    ResultChannel, ENV_RESULT_TOKEN, ENV_RESULT_URL, ENV_SUBTEST, ENV_UNIT_ID,
};
use super::surface::DecisionSurface;
use crate::launcher::{ExitTracker, LaunchDescriptor, ProcessLauncher};
use crate::manifest::ManifestStore;
use crate::models::decision::{DecisionRequest, Verdict};
use crate::models::result::{Outcome, ReportedOutcome, ResultReport, SubtestResult};
use crate::models::session::{HistoryStatus, Session, SessionSnapshot, Stage};
use crate::persistence::session_repo::{HistoryEntry, SessionRepo};
use crate::report::{FinalReport, ReportPublisher, SubmissionReceipt};
use crate::{AppError, Result};

/// Failure reason recorded for a subtest that reported `FAIL` itself.
pub const AUTOMATED_FAILURE: &str = "Automated failure";

/// Failure reason recorded when an operator rejects without a reason.
pub const NO_REASON_GIVEN: &str = "No reason given";

struct ActiveSession {
    session: Session,
    groups: ActiveGroups,
}

/// Single-writer owner of the active session.
pub struct Orchestrator {
    manifests: Arc<dyn ManifestStore>,
    launcher: Arc<dyn ProcessLauncher>,
    surface: Arc<dyn DecisionSurface>,
    publisher: ReportPublisher,
    channel: ResultChannel,
    history: HistoryRecorder,
    active: Option<ActiveSession>,
}

impl Orchestrator {
    /// Construct an idle orchestrator.
    #[must_use]
    pub fn new(
        manifests: Arc<dyn ManifestStore>,
        launcher: Arc<dyn ProcessLauncher>,
        surface: Arc<dyn DecisionSurface>,
        publisher: ReportPublisher,
        channel: ResultChannel,
    ) -> Self {
        Self {
            manifests,
            launcher,
            surface,
            publisher,
            channel,
            history: HistoryRecorder::default(),
            active: None,
        }
    }

    /// Record sessions and results in `repo`.
    #[must_use]
    pub fn with_history(mut self, repo: SessionRepo) -> Self {
        self.history = HistoryRecorder { repo: Some(repo) };
        self
    }

    /// Current stage; `Idle` without a session.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.active
            .as_ref()
            .map_or(Stage::Idle, |a| a.session.stage)
    }

    /// Result channel token of the active session.
    #[must_use]
    pub fn result_token(&self) -> Option<&str> {
        self.active
            .as_ref()
            .map(|a| a.session.result_token.as_str())
    }

    /// Number of live process-group handles.
    #[must_use]
    pub fn active_group_count(&self) -> usize {
        self.active.as_ref().map_or(0, |a| a.groups.len())
    }

    /// Read-only view of the current state.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let Some(ref active) = self.active else {
            return SessionSnapshot::idle();
        };
        let session = &active.session;
        SessionSnapshot {
            session_id: Some(session.id.clone()),
            unit_id: Some(session.unit_id.clone()),
            plan: Some(session.plan.name().to_owned()),
            stage: session.stage,
            subtest_index: session.subtest_index,
            subtest: session.current_subtest().map(str::to_owned),
            results: session.results.clone(),
            pending_decision: session.pending_decision.clone(),
            active_groups: active.groups.len(),
        }
    }

    /// Apply one inbound event.
    pub async fn handle(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::StartSession {
                unit_id,
                rework_note,
                reply,
            } => {
                let result = self.start_session(unit_id, rework_note).await;
                respond(reply, result);
            }
            Inbound::AcknowledgeInstructions { reply } => {
                respond(reply, self.acknowledge_instructions());
            }
            Inbound::Cancel { reason, reply } => {
                let result = self.cancel(&reason).await;
                respond(reply, result);
            }
            Inbound::ResolveDecision { verdict, reply } => {
                let result = self.resolve_decision(verdict).await;
                respond(reply, result);
            }
            Inbound::SubmitReport {
                summary,
                notes,
                reply,
            } => {
                let result = self.submit_report(summary, notes).await;
                respond(reply, result);
            }
            Inbound::DiscardResults { reply } => {
                let result = self.discard_results().await;
                respond(reply, result);
            }
            Inbound::Status { reply } => respond(reply, self.snapshot()),
            Inbound::History { limit, reply } => {
                let result = self.history.list(limit).await;
                respond(reply, result);
            }
            Inbound::SubtestReport { token, report } => {
                self.on_subtest_report(&token, report).await;
            }
        }
    }

    /// One scheduler tick: run pending synchronous stages, then poll every
    /// live process group.
    pub async fn tick(&mut self) {
        if self.stage() == Stage::PreStartup {
            self.run_prestartup().await;
        }
        if let Some(active) = self.active.as_mut() {
            active.groups.poll_all();
        }
    }

    /// Open a session for `unit_id`.
    ///
    /// A session awaiting submission is discarded and any other active
    /// session is cancelled first. On success the session is either waiting
    /// for an instruction acknowledgement or in `PreStartup`; the next
    /// [`tick`](Self::tick) continues from there.
    ///
    /// # Errors
    ///
    /// * `NoPlanForUnit` when no test matches the unit.
    /// * `EmptyPlan` when the plan has no subtests; nothing is launched.
    /// * `Manifest` when the matching manifest is invalid.
    /// * `Launch` when core services cannot be started.
    pub async fn start_session(
        &mut self,
        unit_id: String,
        rework_note: Option<String>,
    ) -> Result<SessionSnapshot> {
        let span = info_span!("start_session", unit_id = %unit_id);
        async move {
            let plan = self
                .manifests
                .resolve(&unit_id)?
                .ok_or_else(|| AppError::NoPlanForUnit(unit_id.clone()))?;
            if plan.is_empty() {
                return Err(AppError::EmptyPlan(unit_id));
            }

            match self.stage() {
                Stage::Idle => {}
                Stage::ResultsReady => {
                    warn!("unsubmitted results discarded by a new session");
                    self.discard_results().await?;
                }
                _ => self.cancel_active("superseded by a new session").await,
            }

            let rework_note = rework_note.filter(|n| !n.trim().is_empty());
            let mut session = Session::new(unit_id, rework_note, Arc::new(plan));

            let core = self.launcher.launch(LaunchDescriptor::core_services())?;
            let mut groups = ActiveGroups::new();
            groups.insert(GroupSlot::Core, core).await;

            session.result_token = self.channel.register(&session.id).await.token;

            if let Some(ref note) = session.rework_note {
                self.publisher.record_rework(&session.unit_id, note).await;
            }

            self.history.record_start(&session).await;

            info!(
                session_id = %session.id,
                plan = session.plan.name(),
                subtests = session.plan.len(),
                "session opened"
            );

            let instructions = session.plan.instructions().map(Path::to_path_buf);
            session.stage = if instructions.is_some() {
                Stage::AwaitingInstructionAck
            } else {
                Stage::PreStartup
            };
            let unit_id = session.unit_id.clone();
            self.active = Some(ActiveSession { session, groups });

            if let Some(document) = instructions {
                self.surface.present_instructions(&unit_id, &document);
            }

            Ok(self.snapshot())
        }
        .instrument(span)
        .await
    }

    /// The operator has read the instructions; prestartup runs on the next tick.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the session is waiting for an acknowledgement.
    pub fn acknowledge_instructions(&mut self) -> Result<()> {
        match self.active.as_mut() {
            Some(active) if active.session.stage == Stage::AwaitingInstructionAck => {
                info!(session_id = %active.session.id, "instructions acknowledged");
                active.session.stage = Stage::PreStartup;
                Ok(())
            }
            _ => Err(AppError::InvalidState(format!(
                "no instructions awaiting acknowledgement (stage {})",
                self.stage()
            ))),
        }
    }

    /// Cancel the active session: run the shutdown script, stop every group
    /// and return to `Idle` without producing a report.
    ///
    /// # Errors
    ///
    /// `InvalidState` when idle or when results are already final.
    pub async fn cancel(&mut self, reason: &str) -> Result<()> {
        let stage = self.stage();
        if !stage.is_cancellable() {
            return Err(AppError::InvalidState(format!(
                "nothing to cancel in stage {stage}"
            )));
        }
        self.cancel_active(reason).await;
        Ok(())
    }

    /// Resolve the outstanding human decision.
    ///
    /// # Errors
    ///
    /// `NoPendingDecision` when no decision is outstanding.
    pub async fn resolve_decision(&mut self, verdict: Verdict) -> Result<()> {
        let request = self
            .active
            .as_mut()
            .and_then(|a| a.session.pending_decision.take())
            .ok_or(AppError::NoPendingDecision)?;
        self.surface.withdraw_decision(&request.session_id);

        let index = request.subtest_index;
        let payload = request.report.payload();
        match verdict {
            Verdict::Accept => {
                info!(subtest = %request.subtest, "operator accepted result");
                let result =
                    SubtestResult::pass(request.subtest, request.report.text).with_payload(payload);
                self.finalize(index, result).await;
            }
            Verdict::Reject { reason } => {
                let reason = if reason.trim().is_empty() {
                    NO_REASON_GIVEN.to_owned()
                } else {
                    reason
                };
                info!(subtest = %request.subtest, %reason, "operator rejected result");
                let result = SubtestResult::fail(request.subtest, request.report.text, reason)
                    .with_payload(payload);
                self.finalize(index, result).await;
            }
            Verdict::Retry => {
                info!(subtest = %request.subtest, "operator requested retry");
                if let Some(active) = self.active.as_mut() {
                    active.groups.stop(GroupSlot::Subtest).await;
                }
                self.start_subtest(index).await;
            }
        }
        Ok(())
    }

    /// Apply a result channel call.
    ///
    /// Reports with a stale token, or arriving while no subtest awaits an
    /// automatic result, are logged and dropped.
    pub async fn on_subtest_report(&mut self, token: &str, report: ResultReport) {
        let Some(active) = self.active.as_mut() else {
            warn!(outcome = ?report.outcome, "result report without an active session dropped");
            return;
        };
        if active.session.result_token != token {
            warn!(outcome = ?report.outcome, "result report with stale token dropped");
            return;
        }
        let Stage::AwaitingAutoResult(index) = active.session.stage else {
            warn!(
                stage = %active.session.stage,
                outcome = ?report.outcome,
                "unexpected result report dropped"
            );
            return;
        };
        let Some(name) = active.session.plan.subtest(index).map(|s| s.name.clone()) else {
            return;
        };

        info!(subtest = %name, outcome = ?report.outcome, "subtest reported");
        let payload = report.payload();
        match report.outcome {
            ReportedOutcome::Pass => {
                let result = SubtestResult::pass(name, report.text).with_payload(payload);
                self.finalize(index, result).await;
            }
            ReportedOutcome::Fail => {
                let result =
                    SubtestResult::fail(name, report.text, AUTOMATED_FAILURE).with_payload(payload);
                self.finalize(index, result).await;
            }
            ReportedOutcome::HumanRequired => {
                let request = DecisionRequest {
                    session_id: active.session.id.clone(),
                    unit_id: active.session.unit_id.clone(),
                    subtest_index: index,
                    subtest: name,
                    report,
                    requested_at: Utc::now(),
                };
                active.session.stage = Stage::AwaitingHumanDecision(index);
                active.session.pending_decision = Some(request.clone());
                self.surface.request_decision(&request);
            }
        }
    }

    /// Submit the final report and return to `Idle`.
    ///
    /// Sink failures are logged; the local copy is always attempted.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless results are ready.
    pub async fn submit_report(
        &mut self,
        summary: Option<String>,
        notes: Option<String>,
    ) -> Result<SubmissionReceipt> {
        let session = self.take_finished("submit")?;
        let report = FinalReport::new(
            session.unit_id.clone(),
            session.created_at,
            session.results,
            summary,
            notes.as_deref(),
        );
        let receipt = self.publisher.publish(&report).await;
        self.history.record_status(&session.id, HistoryStatus::Submitted, None).await;
        info!(
            session_id = %session.id,
            delivered = receipt.delivered,
            "report submitted; idle"
        );
        Ok(receipt)
    }

    /// Drop final results without submitting and return to `Idle`.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless results are ready.
    pub async fn discard_results(&mut self) -> Result<()> {
        let session = self.take_finished("discard")?;
        self.history.record_status(&session.id, HistoryStatus::Discarded, None).await;
        info!(session_id = %session.id, results = session.results.len(), "results discarded; idle");
        Ok(())
    }

    /// Tear down whatever is active before the process exits.
    pub async fn shutdown(&mut self) {
        match self.stage() {
            Stage::Idle => {}
            Stage::ResultsReady => {
                warn!("sequencer stopping with unsubmitted results");
                self.active = None;
            }
            _ => self.cancel_active("sequencer shutting down").await,
        }
    }

    fn take_finished(&mut self, action: &str) -> Result<Session> {
        if self.stage() != Stage::ResultsReady {
            return Err(AppError::InvalidState(format!(
                "cannot {action} results in stage {}",
                self.stage()
            )));
        }
        self.active
            .take()
            .map(|a| a.session)
            .ok_or_else(|| AppError::InvalidState("no session".into()))
    }

    async fn run_prestartup(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let scripts = active.session.plan.prestartup().to_vec();
        for script in scripts {
            info!(script = %script.display(), "running prestartup script");
            let failure = match run_blocking(
                self.launcher.as_ref(),
                &mut active.groups,
                LaunchDescriptor::script(&script),
            )
            .await
            {
                Ok(tracker) => tracker.first_failure(),
                Err(err) => Some(err.to_string()),
            };
            if let Some(detail) = failure {
                self.abort_prestartup(&script, &detail).await;
                return;
            }
        }

        active.session.stage = Stage::Startup;
        if let Some(script) = active.session.plan.startup().map(Path::to_path_buf) {
            info!(script = %script.display(), "launching startup script");
            match self.launcher.launch(LaunchDescriptor::script(&script)) {
                Ok(group) => active.groups.insert(GroupSlot::Startup, group).await,
                Err(err) => {
                    let reason = format!("startup script failed to launch: {err}");
                    self.cancel_active(&reason).await;
                    return;
                }
            }
        }

        self.start_subtest(0).await;
    }

    async fn abort_prestartup(&mut self, script: &Path, detail: &str) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        error!(script = %script.display(), detail, "prestartup failed; aborting session");

        let result = SubtestResult::prestartup_failure(&script.display().to_string());
        active.session.results.push(result.clone());
        active.groups.stop_all().await;
        active.session.stage = Stage::ResultsReady;

        let session_id = active.session.id.clone();
        let unit_id = active.session.unit_id.clone();
        let token = active.session.result_token.clone();
        let results = active.session.results.clone();

        self.channel.unregister(&token).await;
        self.history.record_result(&session_id, 0, &result).await;
        self.history.record_status(&session_id, HistoryStatus::Aborted, Some(detail)).await;
        self.surface.present_results(&unit_id, &results);
    }

    async fn start_subtest(&mut self, index: usize) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let Some(subtest) = active.session.plan.subtest(index).cloned() else {
            warn!(index, "no subtest at index");
            return;
        };
        active.session.stage = Stage::SubtestActive(index);
        active.session.subtest_index = Some(index);
        info!(subtest = %subtest.name, index, "starting subtest");

        if let Some(ref pre) = subtest.pre {
            match run_blocking(
                self.launcher.as_ref(),
                &mut active.groups,
                LaunchDescriptor::script(pre),
            )
            .await
            {
                Ok(tracker) => {
                    if let Some(detail) = tracker.first_failure() {
                        warn!(subtest = %subtest.name, detail, "pre-subtest script exited abnormally");
                    }
                }
                Err(err) => {
                    let reason = format!("pre-subtest script for {} failed: {err}", subtest.name);
                    self.cancel_active(&reason).await;
                    return;
                }
            }
        }

        let descriptor = LaunchDescriptor::script(&subtest.script)
            .with_env(ENV_RESULT_URL, self.channel.endpoint())
            .with_env(ENV_RESULT_TOKEN, &active.session.result_token)
            .with_env(ENV_UNIT_ID, &active.session.unit_id)
            .with_env(ENV_SUBTEST, &subtest.name);
        match self.launcher.launch(descriptor) {
            Ok(group) => {
                active.groups.insert(GroupSlot::Subtest, group).await;
                active.session.stage = Stage::AwaitingAutoResult(index);
                debug!(subtest = %subtest.name, "awaiting result channel call");
            }
            Err(err) => {
                let reason = format!("subtest {} failed to launch: {err}", subtest.name);
                self.cancel_active(&reason).await;
            }
        }
    }

    async fn finalize(&mut self, index: usize, result: SubtestResult) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.groups.stop(GroupSlot::Subtest).await;
        active.session.stage = Stage::PostSubtest(index);

        let position = active.session.results.len();
        active.session.results.push(result.clone());
        let session_id = active.session.id.clone();
        let post = active
            .session
            .plan
            .post_subtest(&result.name)
            .map(Path::to_path_buf);
        let last = active.session.is_last_subtest(index);
        info!(
            subtest = %result.name,
            outcome = result.outcome.as_str(),
            "subtest result recorded"
        );

        self.history.record_result(&session_id, position, &result).await;

        if let Some(script) = post {
            self.run_post_subtest(&script).await;
        }

        if result.outcome == Outcome::Fail || last {
            self.finish().await;
        } else {
            self.start_subtest(index + 1).await;
        }
    }

    async fn run_post_subtest(&mut self, script: &Path) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        match run_blocking(
            self.launcher.as_ref(),
            &mut active.groups,
            LaunchDescriptor::script(script),
        )
        .await
        {
            Ok(tracker) => {
                if let Some(detail) = tracker.first_failure() {
                    warn!(script = %script.display(), detail, "post-subtest script exited abnormally");
                }
            }
            Err(err) => {
                warn!(script = %script.display(), %err, "post-subtest script failed");
            }
        }
    }

    async fn finish(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.session.stage = Stage::Finishing;
        debug!(results = active.session.results.len(), "no further subtests");

        active.session.stage = Stage::Shutdown;
        let shutdown = active.session.plan.shutdown().map(Path::to_path_buf);
        run_shutdown(self.launcher.as_ref(), &mut active.groups, shutdown).await;
        active.groups.stop_all().await;
        active.session.stage = Stage::ResultsReady;

        let session_id = active.session.id.clone();
        let unit_id = active.session.unit_id.clone();
        let token = active.session.result_token.clone();
        let results = active.session.results.clone();

        self.channel.unregister(&token).await;
        self.history.record_status(&session_id, HistoryStatus::ResultsReady, None).await;
        info!(%session_id, results = results.len(), "results ready");
        self.surface.present_results(&unit_id, &results);
    }

    async fn cancel_active(&mut self, reason: &str) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        let span = info_span!("cancel_session", session_id = %active.session.id);
        async move {
            warn!(stage = %active.session.stage, reason, "cancelling session");
            active.session.stage = Stage::Cancelled;

            if let Some(pending) = active.session.pending_decision.take() {
                self.surface.withdraw_decision(&pending.session_id);
            }

            let shutdown = active.session.plan.shutdown().map(Path::to_path_buf);
            run_shutdown(self.launcher.as_ref(), &mut active.groups, shutdown).await;
            active.groups.stop_all().await;

            self.channel.unregister(&active.session.result_token).await;
            self.history
                .record_status(&active.session.id, HistoryStatus::Cancelled, Some(reason))
                .await;
            info!("session cancelled; idle");
        }
        .instrument(span)
        .await;
    }
}

/// Best-effort session history writer.
#[derive(Default)]
struct HistoryRecorder {
    repo: Option<SessionRepo>,
}

impl HistoryRecorder {
    async fn record_start(&self, session: &Session) {
        let Some(ref repo) = self.repo else {
            return;
        };
        if let Err(err) = repo.create(session).await {
            warn!(%err, session_id = %session.id, "failed to record session start");
        }
    }

    async fn record_result(&self, session_id: &str, position: usize, result: &SubtestResult) {
        let Some(ref repo) = self.repo else {
            return;
        };
        if let Err(err) = repo.append_result(session_id, position, result).await {
            warn!(%err, session_id, "failed to record subtest result");
        }
    }

    async fn record_status(&self, session_id: &str, status: HistoryStatus, detail: Option<&str>) {
        let Some(ref repo) = self.repo else {
            return;
        };
        if let Err(err) = repo.set_status(session_id, status, detail).await {
            warn!(%err, session_id, status = status.as_str(), "failed to record session status");
        }
    }

    async fn list(&self, limit: u32) -> Result<Vec<HistoryEntry>> {
        match self.repo {
            Some(ref repo) => repo.list_recent(limit).await,
            None => Err(AppError::NotFound("session history is not enabled".into())),
        }
    }
}

fn respond<T>(reply: oneshot::Sender<T>, value: T) {
    let _ = reply.send(value);
}

/// Launch `descriptor` into the transient slot, wait for it to exit and
/// release it. The returned tracker says whether anything died badly.
async fn run_blocking(
    launcher: &dyn ProcessLauncher,
    groups: &mut ActiveGroups,
    descriptor: LaunchDescriptor,
) -> Result<Arc<ExitTracker>> {
    let tracker = ExitTracker::new();
    let group = launcher.launch(descriptor.with_listener(tracker.clone()))?;
    groups.insert(GroupSlot::Transient, group).await;
    if let Some(group) = groups.get_mut(GroupSlot::Transient) {
        group.wait_until_done().await;
    }
    groups.stop(GroupSlot::Transient).await;
    Ok(tracker)
}

/// Run the shutdown script to completion. Never fails the session; problems
/// are logged for manual intervention.
async fn run_shutdown(
    launcher: &dyn ProcessLauncher,
    groups: &mut ActiveGroups,
    script: Option<PathBuf>,
) {
    let Some(script) = script else {
        warn!("no shutdown script declared; shut down unit power manually");
        return;
    };
    info!(script = %script.display(), "running shutdown script");

    let tracker = ExitTracker::new();
    match launcher.launch(LaunchDescriptor::script(&script).with_listener(tracker.clone())) {
        Ok(group) => {
            groups.insert(GroupSlot::Shutdown, group).await;
            if let Some(group) = groups.get_mut(GroupSlot::Shutdown) {
                group.wait_until_done().await;
            }
            groups.stop(GroupSlot::Shutdown).await;
            if let Some(detail) = tracker.first_failure() {
                error!(detail, "shutdown script exited abnormally; shut down unit power manually");
            }
        }
        Err(err) => {
            error!(%err, "shutdown script failed to launch; shut down unit power manually");
        }
    }
}
