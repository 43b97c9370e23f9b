//! Session history recorded by the orchestrator into `SQLite`.

use std::sync::Arc;
use std::time::Duration;

use qualification_sequencer::models::decision::Verdict;
use qualification_sequencer::models::result::{Outcome, ReportedOutcome};
use qualification_sequencer::models::session::HistoryStatus;
use qualification_sequencer::orchestrator::inbox::Inbound;
use qualification_sequencer::persistence::db::{self, Database};
use qualification_sequencer::persistence::retention;
use qualification_sequencer::persistence::session_repo::SessionRepo;
use qualification_sequencer::AppError;
use tokio::sync::oneshot;

use super::test_helpers::{harness, plan, Harness, UNIT};

async fn recorded(plan_names: &[&str]) -> (Harness, SessionRepo, Arc<Database>) {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let repo = SessionRepo::new(Arc::clone(&database));
    let h = harness(plan(plan_names)).with_history(repo.clone());
    (h, repo, database)
}

#[tokio::test]
async fn finished_session_is_results_ready_then_submitted() {
    let (mut h, repo, _db) = recorded(&["a", "b"]).await;
    h.start().await;
    h.report(ReportedOutcome::Pass, "ok").await;
    h.report(ReportedOutcome::Fail, "bad").await;

    let entries = repo.list_recent(10).await.expect("list");
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.unit_id, UNIT);
    assert_eq!(entry.plan, "bench");
    assert_eq!(entry.status, HistoryStatus::ResultsReady);
    assert_eq!(entry.result_count, 2);
    assert_eq!(entry.last_outcome, Some(Outcome::Fail));
    assert!(entry.finished_at.is_some());

    let results = repo.results_for(&entry.session_id).await.expect("results");
    assert_eq!(results[0].name, "a");
    assert_eq!(results[1].failure_reason.as_deref(), Some("Automated failure"));

    h.orchestrator.submit_report(None, None).await.expect("submit");
    let entries = repo.list_recent(10).await.expect("list");
    assert_eq!(entries[0].status, HistoryStatus::Submitted);
}

#[tokio::test]
async fn cancellation_is_recorded_with_its_reason() {
    let (mut h, repo, _db) = recorded(&["a"]).await;
    h.start().await;

    let entries = repo.list_recent(10).await.expect("list");
    assert_eq!(entries[0].status, HistoryStatus::Active);
    assert!(entries[0].finished_at.is_none());

    h.orchestrator.cancel("fixture unplugged").await.expect("cancel");

    let entries = repo.list_recent(10).await.expect("list");
    assert_eq!(entries[0].status, HistoryStatus::Cancelled);
    assert_eq!(entries[0].detail.as_deref(), Some("fixture unplugged"));
    assert_eq!(entries[0].result_count, 0);
}

#[tokio::test]
async fn prestartup_abort_is_recorded() {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let repo = SessionRepo::new(Arc::clone(&database));
    let plan = plan(&["a"]).with_prestartup(vec!["s1.sh".into()]);
    let mut h = harness(plan).with_history(repo.clone());
    h.launcher.exit_with("s1.sh", 4);

    h.start().await;

    let entries = repo.list_recent(10).await.expect("list");
    assert_eq!(entries[0].status, HistoryStatus::Aborted);
    assert_eq!(entries[0].result_count, 1);
    assert_eq!(entries[0].last_outcome, Some(Outcome::Fail));
    assert!(entries[0].detail.is_some());
}

#[tokio::test]
async fn discarded_results_are_recorded() {
    let (mut h, repo, _db) = recorded(&["a"]).await;
    h.start().await;
    h.report(ReportedOutcome::HumanRequired, "").await;
    h.orchestrator
        .resolve_decision(Verdict::Accept)
        .await
        .expect("accept");

    h.orchestrator.discard_results().await.expect("discard");

    let entries = repo.list_recent(10).await.expect("list");
    assert_eq!(entries[0].status, HistoryStatus::Discarded);
    assert_eq!(entries[0].last_outcome, Some(Outcome::Pass));
}

#[tokio::test]
async fn history_request_lists_newest_first() {
    let (mut h, _repo, _db) = recorded(&["a"]).await;
    h.start().await;
    h.report(ReportedOutcome::Pass, "").await;
    h.orchestrator.discard_results().await.expect("discard");
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.start().await;

    let (reply, rx) = oneshot::channel();
    h.orchestrator
        .handle(Inbound::History { limit: 10, reply })
        .await;
    let entries = rx.await.expect("reply").expect("history");

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].status, HistoryStatus::Active);
    assert_eq!(entries[1].status, HistoryStatus::Discarded);
}

#[tokio::test]
async fn history_without_a_database_is_not_found() {
    let mut h = harness(plan(&["a"]));

    let (reply, rx) = oneshot::channel();
    h.orchestrator
        .handle(Inbound::History { limit: 5, reply })
        .await;

    assert!(matches!(rx.await.expect("reply"), Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn stale_active_sessions_are_interrupted() {
    let (mut h, repo, _db) = recorded(&["a"]).await;
    h.start().await;

    let interrupted = repo.interrupt_stale().await.expect("interrupt");

    assert_eq!(interrupted, 1);
    let entries = repo.list_recent(1).await.expect("list");
    assert_eq!(entries[0].status, HistoryStatus::Cancelled);
    assert_eq!(entries[0].detail.as_deref(), Some("sequencer restarted"));
}

#[tokio::test]
async fn purge_removes_finished_sessions_only() {
    let (mut h, repo, database) = recorded(&["a"]).await;
    h.start().await;
    h.report(ReportedOutcome::Pass, "").await;
    h.orchestrator.discard_results().await.expect("discard");
    h.start().await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let removed = retention::purge(&database, 0).await.expect("purge");

    assert_eq!(removed, 1);
    let entries = repo.list_recent(10).await.expect("list");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, HistoryStatus::Active);
}

#[tokio::test]
async fn purge_keeps_recent_sessions() {
    let (mut h, repo, database) = recorded(&["a"]).await;
    h.start().await;
    h.report(ReportedOutcome::Pass, "").await;

    let removed = retention::purge(&database, 30).await.expect("purge");

    assert_eq!(removed, 0);
    assert_eq!(repo.list_recent(10).await.expect("list").len(), 1);
}

#[tokio::test]
async fn unknown_session_status_update_is_not_found() {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let repo = SessionRepo::new(database);

    let err = repo
        .set_status("missing", HistoryStatus::Cancelled, None)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NotFound(_)));
}
