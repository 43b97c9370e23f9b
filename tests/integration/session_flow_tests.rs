//! End-to-end session flows driven directly on the orchestrator.

use qualification_sequencer::manifest::MemoryManifestStore;
use qualification_sequencer::models::plan::{Subtest, TestPlan};
use qualification_sequencer::models::result::{
    Outcome, ReportedOutcome, ResultReport, SubtestResult,
};
use qualification_sequencer::models::session::Stage;
use qualification_sequencer::AppError;

use super::test_helpers::{harness, harness_with_store, plan, plan_of, SurfaceEvent, UNIT};

#[tokio::test]
async fn empty_plan_is_rejected_before_anything_launches() {
    let empty = TestPlan::new("empty", Vec::new()).expect("plan");
    let mut h = harness(empty);

    let err = h
        .orchestrator
        .start_session(UNIT.to_owned(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::EmptyPlan(ref unit) if unit == UNIT));
    assert!(h.launcher.launched().is_empty());
    assert_eq!(h.orchestrator.stage(), Stage::Idle);
}

#[tokio::test]
async fn unknown_unit_has_no_plan() {
    let mut h = harness_with_store(MemoryManifestStore::new());

    let err = h
        .orchestrator
        .start_session("XYZ-1".to_owned(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NoPlanForUnit(ref unit) if unit == "XYZ-1"));
    assert!(h.launcher.launched().is_empty());
}

#[tokio::test]
async fn automatic_pass_then_fail_reaches_results_ready() {
    let mut h = harness(plan(&["a", "b"]));
    h.start().await;
    assert_eq!(h.orchestrator.stage(), Stage::AwaitingAutoResult(0));

    h.report(ReportedOutcome::Pass, "rails nominal").await;
    assert_eq!(h.orchestrator.stage(), Stage::AwaitingAutoResult(1));

    h.report(ReportedOutcome::Fail, "ripple 80mV").await;

    let snapshot = h.orchestrator.snapshot();
    assert_eq!(snapshot.stage, Stage::ResultsReady);
    assert_eq!(snapshot.subtest_index, Some(1));
    let summary: Vec<(String, Outcome, Option<String>)> = snapshot
        .results
        .iter()
        .map(|r| (r.name.clone(), r.outcome, r.failure_reason.clone()))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("a".to_owned(), Outcome::Pass, None),
            ("b".to_owned(), Outcome::Fail, Some("Automated failure".to_owned())),
        ]
    );
    assert_eq!(h.orchestrator.active_group_count(), 0);
    assert_eq!(h.launcher.live(), 0);
    assert_eq!(h.surface.events().last(), Some(&SurfaceEvent::Results(2)));
}

#[tokio::test]
async fn failure_skips_remaining_subtests() {
    let mut h = harness(plan(&["a", "b", "c"]));
    h.start().await;

    h.report(ReportedOutcome::Fail, "no output").await;

    let snapshot = h.orchestrator.snapshot();
    assert_eq!(snapshot.stage, Stage::ResultsReady);
    assert_eq!(snapshot.results.len(), 1);
    assert_eq!(h.launcher.launch_count("b.sh"), 0);
    assert_eq!(h.launcher.launch_count("c.sh"), 0);
}

#[tokio::test]
async fn stages_launch_in_declared_order() {
    let plan = plan_of(vec![
        Subtest::new("a", "a.sh").with_pre("pre_a.sh").with_post("post_a.sh"),
        Subtest::new("b", "b.sh"),
    ])
    .with_prestartup(vec!["s1.sh".into(), "s2.sh".into()])
    .with_startup("startup.sh")
    .with_shutdown("shutdown.sh");
    let mut h = harness(plan);
    h.start().await;

    // Core, startup and the running subtest are alive.
    assert_eq!(h.orchestrator.active_group_count(), 3);

    h.report(ReportedOutcome::Pass, "").await;
    h.report(ReportedOutcome::Pass, "").await;

    assert_eq!(
        h.launcher.launched(),
        vec![
            "core-services",
            "s1.sh",
            "s2.sh",
            "startup.sh",
            "pre_a.sh",
            "a.sh",
            "post_a.sh",
            "b.sh",
            "shutdown.sh",
        ]
    );
    assert_eq!(h.orchestrator.stage(), Stage::ResultsReady);
    assert_eq!(h.launcher.live(), 0);
}

#[tokio::test]
async fn subtest_environment_carries_result_channel_registration() {
    let mut h = harness(plan(&["a"]));
    h.start().await;

    let token = h.orchestrator.result_token().expect("token").to_owned();
    let env = h.launcher.env_of("a.sh");

    assert_eq!(env.get("QUAL_RESULT_TOKEN"), Some(&token));
    assert_eq!(env.get("QUAL_UNIT_ID").map(String::as_str), Some(UNIT));
    assert_eq!(env.get("QUAL_SUBTEST").map(String::as_str), Some("a"));
    assert_eq!(
        env.get("QUAL_RESULT_URL").map(String::as_str),
        Some("http://127.0.0.1:7411/result")
    );
    assert_eq!(
        h.channel.current().await.map(|r| r.token),
        Some(token),
        "registration is live while the session runs"
    );
}

#[tokio::test]
async fn results_ready_releases_the_result_channel() {
    let mut h = harness(plan(&["a"]));
    h.start().await;
    h.report(ReportedOutcome::Pass, "").await;

    assert_eq!(h.orchestrator.stage(), Stage::ResultsReady);
    assert!(h.channel.current().await.is_none());
}

#[tokio::test]
async fn prestartup_abnormal_exit_aborts_to_results_ready() {
    let plan = plan(&["a"])
        .with_prestartup(vec!["s1.sh".into(), "s2.sh".into()])
        .with_startup("startup.sh")
        .with_shutdown("shutdown.sh");
    let mut h = harness(plan);
    h.launcher.exit_with("s1.sh", 3);

    h.start().await;

    let snapshot = h.orchestrator.snapshot();
    assert_eq!(snapshot.stage, Stage::ResultsReady);
    assert_eq!(snapshot.results.len(), 1);
    let result = &snapshot.results[0];
    assert_eq!(result.outcome, Outcome::Fail);
    assert!(result.failure_reason.as_deref().unwrap_or("").contains("s1.sh"));
    assert_eq!(h.launcher.launch_count("s2.sh"), 0);
    assert_eq!(h.launcher.launch_count("startup.sh"), 0);
    assert_eq!(h.launcher.launch_count("a.sh"), 0);
    assert_eq!(h.launcher.launch_count("shutdown.sh"), 0);
    assert_eq!(h.launcher.live(), 0);
}

#[tokio::test]
async fn prestartup_launch_failure_is_reported_like_abnormal_exit() {
    let plan = plan(&["a"]).with_prestartup(vec!["s1.sh".into()]);
    let mut h = harness(plan);
    h.launcher.fail_launch("s1.sh");

    h.start().await;

    let snapshot = h.orchestrator.snapshot();
    assert_eq!(snapshot.stage, Stage::ResultsReady);
    assert_eq!(
        snapshot.results,
        vec![SubtestResult::prestartup_failure("s1.sh")]
    );
    assert_eq!(h.launcher.live(), 0);
}

#[tokio::test]
async fn startup_launch_failure_cancels_without_results() {
    let plan = plan(&["a"])
        .with_startup("startup.sh")
        .with_shutdown("shutdown.sh");
    let mut h = harness(plan);
    h.launcher.fail_launch("startup.sh");

    h.start().await;

    assert_eq!(h.orchestrator.stage(), Stage::Idle);
    assert_eq!(h.launcher.launch_count("shutdown.sh"), 1);
    assert_eq!(h.launcher.launch_count("a.sh"), 0);
    assert_eq!(h.launcher.live(), 0);
}

#[tokio::test]
async fn pre_subtest_launch_failure_cancels_the_session() {
    let plan = plan_of(vec![
        Subtest::new("a", "a.sh"),
        Subtest::new("b", "b.sh").with_pre("pre_b.sh"),
    ]);
    let mut h = harness(plan);
    h.launcher.fail_launch("pre_b.sh");
    h.start().await;

    h.report(ReportedOutcome::Pass, "").await;

    assert_eq!(h.orchestrator.stage(), Stage::Idle);
    assert_eq!(h.launcher.launch_count("b.sh"), 0);
    assert_eq!(h.launcher.live(), 0);
}

#[tokio::test]
async fn pre_subtest_abnormal_exit_is_only_logged() {
    let plan = plan_of(vec![Subtest::new("a", "a.sh").with_pre("pre_a.sh")]);
    let mut h = harness(plan);
    h.launcher.exit_with("pre_a.sh", 1);

    h.start().await;

    assert_eq!(h.orchestrator.stage(), Stage::AwaitingAutoResult(0));
    assert_eq!(h.launcher.launch_count("a.sh"), 1);
}

#[tokio::test]
async fn post_subtest_failure_does_not_escalate() {
    let plan = plan_of(vec![
        Subtest::new("a", "a.sh").with_post("post_a.sh"),
        Subtest::new("b", "b.sh").with_post("post_b.sh"),
    ]);
    let mut h = harness(plan);
    h.launcher.fail_launch("post_a.sh");
    h.launcher.exit_with("post_b.sh", 2);
    h.start().await;

    h.report(ReportedOutcome::Pass, "").await;
    assert_eq!(h.orchestrator.stage(), Stage::AwaitingAutoResult(1));

    h.report(ReportedOutcome::Pass, "").await;
    let snapshot = h.orchestrator.snapshot();
    assert_eq!(snapshot.stage, Stage::ResultsReady);
    assert!(snapshot.results.iter().all(|r| r.outcome == Outcome::Pass));
}

#[tokio::test]
async fn shutdown_failure_still_reaches_results_ready() {
    let plan = plan(&["a"]).with_shutdown("shutdown.sh");
    let mut h = harness(plan);
    h.launcher.fail_launch("shutdown.sh");
    h.start().await;

    h.report(ReportedOutcome::Pass, "").await;

    assert_eq!(h.orchestrator.stage(), Stage::ResultsReady);
    assert_eq!(h.launcher.live(), 0);
}

#[tokio::test]
async fn core_services_failure_fails_the_start() {
    let mut h = harness(plan(&["a"]));
    h.launcher.fail_launch("core-services");

    let err = h
        .orchestrator
        .start_session(UNIT.to_owned(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Launch(_)));
    assert_eq!(h.orchestrator.stage(), Stage::Idle);
    assert!(h.channel.current().await.is_none());
}

#[tokio::test]
async fn instructions_wait_for_acknowledgement() {
    let plan = plan(&["a"]).with_instructions("README.txt");
    let mut h = harness(plan);

    let snapshot = h
        .orchestrator
        .start_session(UNIT.to_owned(), None)
        .await
        .expect("start");
    assert_eq!(snapshot.stage, Stage::AwaitingInstructionAck);
    assert_eq!(
        h.surface.events(),
        vec![SurfaceEvent::Instructions("README.txt".to_owned())]
    );

    h.orchestrator.tick().await;
    assert_eq!(h.orchestrator.stage(), Stage::AwaitingInstructionAck);
    assert_eq!(h.launcher.launched(), vec!["core-services"]);

    h.orchestrator.acknowledge_instructions().expect("ack");
    assert_eq!(h.orchestrator.stage(), Stage::PreStartup);
    h.orchestrator.tick().await;
    assert_eq!(h.orchestrator.stage(), Stage::AwaitingAutoResult(0));
}

#[tokio::test]
async fn acknowledgement_without_instructions_is_invalid() {
    let mut h = harness(plan(&["a"]));
    h.start().await;

    let err = h.orchestrator.acknowledge_instructions().unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
    assert_eq!(h.orchestrator.stage(), Stage::AwaitingAutoResult(0));
}

#[tokio::test]
async fn stale_and_duplicate_reports_are_dropped() {
    let mut h = harness(plan(&["a", "b"]));
    h.start().await;

    h.orchestrator
        .on_subtest_report(
            "not-the-token",
            ResultReport::new(ReportedOutcome::Pass, ""),
        )
        .await;
    assert_eq!(h.orchestrator.stage(), Stage::AwaitingAutoResult(0));
    assert!(h.orchestrator.snapshot().results.is_empty());

    h.report(ReportedOutcome::Fail, "").await;
    assert_eq!(h.orchestrator.stage(), Stage::ResultsReady);

    // The registration is gone, but the orchestrator also ignores a late
    // report carrying the old token.
    h.report(ReportedOutcome::Pass, "late").await;
    assert_eq!(h.orchestrator.snapshot().results.len(), 1);
}

#[tokio::test]
async fn new_session_cancels_the_running_one() {
    let plan = plan(&["a"]).with_shutdown("shutdown.sh");
    let mut h = harness(plan);
    h.start().await;
    let first = h.orchestrator.snapshot().session_id;

    h.start().await;

    let snapshot = h.orchestrator.snapshot();
    assert_ne!(snapshot.session_id, first);
    assert_eq!(snapshot.stage, Stage::AwaitingAutoResult(0));
    assert_eq!(h.launcher.launch_count("shutdown.sh"), 1);
    // Core services and the new subtest only.
    assert_eq!(h.launcher.live(), 2);
}

#[tokio::test]
async fn new_session_discards_unsubmitted_results() {
    let mut h = harness(plan(&["a"]));
    h.start().await;
    h.report(ReportedOutcome::Pass, "").await;
    assert_eq!(h.orchestrator.stage(), Stage::ResultsReady);

    h.start().await;

    let snapshot = h.orchestrator.snapshot();
    assert_eq!(snapshot.stage, Stage::AwaitingAutoResult(0));
    assert!(snapshot.results.is_empty());
}
