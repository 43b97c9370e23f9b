//! Final report submission, discard and rework notes.

use std::fs;

use qualification_sequencer::models::result::{Plot, ReportedOutcome, ResultReport};
use qualification_sequencer::models::session::Stage;
use qualification_sequencer::AppError;

use super::test_helpers::{harness, plan, UNIT};

#[tokio::test]
async fn submit_delivers_and_writes_local_copy() {
    let mut h = harness(plan(&["a", "b"]));
    h.start().await;
    h.report(ReportedOutcome::Pass, "rails nominal").await;
    h.report(ReportedOutcome::Fail, "ripple 80mV").await;

    let receipt = h
        .orchestrator
        .submit_report(None, Some("retest after rework".into()))
        .await
        .expect("submit");

    assert!(receipt.delivered);
    assert_eq!(h.orchestrator.stage(), Stage::Idle);

    let path = receipt.local_path.expect("local copy written");
    assert!(path.starts_with(h.results_dir.path()));
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    assert!(file_name.starts_with("PSU-0042_"));
    assert!(file_name.ends_with(".test"));

    let written = fs::read_to_string(&path).expect("read local copy");
    assert!(written.contains("Subtest 'a':"));
    assert!(written.contains("Result: FAIL"));
    assert!(written.contains("Failure reason: Automated failure"));
    assert!(written.ends_with("\n Notes: retest after rework"));

    let submissions = h.sink.submissions.lock().unwrap();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].unit_id, UNIT);
    assert_eq!(submissions[0].status, "FAIL");
    assert!(submissions[0].attachments[0].name.ends_with("/summary"));
}

#[tokio::test]
async fn submitted_summary_overrides_rendered_text() {
    let mut h = harness(plan(&["a"]));
    h.start().await;
    h.report(ReportedOutcome::Pass, "").await;

    let receipt = h
        .orchestrator
        .submit_report(Some("edited by operator".into()), None)
        .await
        .expect("submit");

    let written = fs::read_to_string(receipt.local_path.expect("path")).expect("read");
    assert_eq!(written, "edited by operator");
    assert_eq!(h.sink.submissions.lock().unwrap()[0].status, "PASS");
}

#[tokio::test]
async fn plot_images_become_attachments() {
    let mut h = harness(plan(&["a"]));
    h.start().await;
    let token = h.orchestrator.result_token().expect("token").to_owned();
    let mut report = ResultReport::new(ReportedOutcome::Pass, "scope capture");
    report.plots = vec![
        Plot {
            title: "ripple".into(),
            text: "80mV".into(),
            image: vec![1, 2, 3],
            image_format: "png".into(),
        },
        Plot {
            title: "text-only".into(),
            text: "no image".into(),
            ..Plot::default()
        },
    ];
    h.orchestrator.on_subtest_report(&token, report).await;

    let receipt = h.orchestrator.submit_report(None, None).await.expect("submit");

    let submissions = h.sink.submissions.lock().unwrap();
    let names: Vec<&str> = submissions[0]
        .attachments
        .iter()
        .map(|a| a.name.as_str())
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names[1].ends_with("/ripple"));
    assert_eq!(submissions[0].attachments[1].content_type, "image/png");

    let written = fs::read_to_string(receipt.local_path.expect("path")).expect("read");
    assert!(written.contains("Plot 2:\nno image"));
}

#[tokio::test]
async fn sink_failure_keeps_the_local_copy() {
    let mut h = harness(plan(&["a"]));
    *h.sink.fail.lock().unwrap() = true;
    h.start().await;
    h.report(ReportedOutcome::Pass, "").await;

    let receipt = h.orchestrator.submit_report(None, None).await.expect("submit");

    assert!(!receipt.delivered);
    assert!(receipt.local_path.expect("path").exists());
    assert_eq!(h.orchestrator.stage(), Stage::Idle);
}

#[tokio::test]
async fn discard_returns_to_idle_without_writing() {
    let mut h = harness(plan(&["a"]));
    h.start().await;
    h.report(ReportedOutcome::Pass, "").await;

    h.orchestrator.discard_results().await.expect("discard");

    assert_eq!(h.orchestrator.stage(), Stage::Idle);
    assert!(h.sink.submissions.lock().unwrap().is_empty());
    let entries = fs::read_dir(h.results_dir.path()).expect("read dir").count();
    assert_eq!(entries, 0);
}

#[tokio::test]
async fn submit_or_discard_outside_results_ready_is_invalid() {
    let mut h = harness(plan(&["a"]));

    let idle = h.orchestrator.submit_report(None, None).await;
    assert!(matches!(idle, Err(AppError::InvalidState(_))));

    h.start().await;
    let running = h.orchestrator.discard_results().await;
    assert!(matches!(running, Err(AppError::InvalidState(_))));
    assert_eq!(h.orchestrator.stage(), Stage::AwaitingAutoResult(0));
}

#[tokio::test]
async fn rework_note_is_recorded_at_start() {
    let mut h = harness(plan(&["a"]));

    h.orchestrator
        .start_session(UNIT.to_owned(), Some("replaced C12".into()))
        .await
        .expect("start");

    let notes = h.sink.notes.lock().unwrap().clone();
    assert_eq!(
        notes,
        vec![(
            UNIT.to_owned(),
            "Hardware rework, reason given: replaced C12".to_owned()
        )]
    );
}

#[tokio::test]
async fn blank_rework_note_is_ignored() {
    let mut h = harness(plan(&["a"]));

    h.orchestrator
        .start_session(UNIT.to_owned(), Some("  ".into()))
        .await
        .expect("start");

    assert!(h.sink.notes.lock().unwrap().is_empty());
}
