//! Final report rendering, local persistence, and inventory submission.
//!
//! A submitted report is handed to the [`ReportSink`] (the inventory) keyed
//! by unit identifier and session start time, and a local copy of the
//! summary is always written to `results_dir` as the durability fallback.
//! Sink failures are logged and never block the session from returning to
//! idle.

pub mod inventory;

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};

use crate::launcher::BoxFuture;
use crate::models::result::SubtestResult;
use crate::Result;

pub use inventory::HttpInventorySink;

/// Inventory key holding the latest test status of a unit.
pub const STATUS_KEY: &str = "Test Status";

const RULE: &str = "------------------------------------------------";

/// A named binary attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedAttachment {
    /// Attachment name, prefixed with the session start stamp.
    pub name: String,
    /// MIME type.
    pub content_type: String,
    /// Raw bytes.
    pub data: Vec<u8>,
}

/// Everything handed to the inventory for one report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventorySubmission {
    /// Unit under test.
    pub unit_id: String,
    /// Outcome label of the last result.
    pub status: String,
    /// Human-readable test log line.
    pub note: String,
    /// Summary first, then plot images.
    pub attachments: Vec<NamedAttachment>,
}

/// Destination for notes and submitted reports.
pub trait ReportSink: Send + Sync {
    /// Attach a free-text note to a unit.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ReportSink` if the note cannot be stored.
    fn add_note<'a>(&'a self, unit_id: &'a str, note: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Store a complete submission.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ReportSink` if any part of the submission fails.
    fn submit<'a>(&'a self, submission: &'a InventorySubmission) -> BoxFuture<'a, Result<()>>;
}

/// Report for a session whose results are final.
#[derive(Debug, Clone)]
pub struct FinalReport {
    /// Unit under test.
    pub unit_id: String,
    /// Session start time.
    pub started_at: DateTime<Utc>,
    /// Final results in order.
    pub results: Vec<SubtestResult>,
    /// Summary text, including operator notes.
    pub summary: String,
}

impl FinalReport {
    /// Build a report, falling back to the rendered summary when `summary`
    /// is absent or blank and appending non-blank `notes`.
    #[must_use]
    pub fn new(
        unit_id: String,
        started_at: DateTime<Utc>,
        results: Vec<SubtestResult>,
        summary: Option<String>,
        notes: Option<&str>,
    ) -> Self {
        let mut summary = summary
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| render_summary(&results));
        if let Some(notes) = notes.map(str::trim).filter(|n| !n.is_empty()) {
            let _ = write!(summary, "\n Notes: {notes}");
        }
        Self {
            unit_id,
            started_at,
            results,
            summary,
        }
    }

    /// Outcome label of the last result, or `UNKNOWN` when there is none.
    #[must_use]
    pub fn status(&self) -> &'static str {
        self.results
            .last()
            .map_or("UNKNOWN", |r| r.outcome.as_str())
    }

    /// Stamp used to prefix attachment names and the local file name.
    #[must_use]
    pub fn start_stamp(&self) -> String {
        self.started_at.format("%Y%m%d_%H%M").to_string()
    }
}

/// What happened to a submitted report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionReceipt {
    /// Local copy, when it could be written.
    pub local_path: Option<PathBuf>,
    /// Whether the inventory accepted the submission.
    pub delivered: bool,
}

/// Render the human-readable summary of a result list.
#[must_use]
pub fn render_summary(results: &[SubtestResult]) -> String {
    let mut out = String::new();
    for result in results {
        let _ = writeln!(out, "{RULE}");
        let _ = writeln!(out, "Subtest '{}':", result.name);
        let _ = writeln!(out, "Result: {}", result.outcome.as_str());
        if let Some(ref reason) = result.failure_reason {
            let _ = writeln!(out, "Failure reason: {reason}");
        }

        let mut text = result.text.clone();
        if let Some(ref payload) = result.payload {
            for (i, plot) in payload.plots.iter().enumerate() {
                let _ = write!(text, "\n------\nPlot {}:\n{}", i + 1, plot.text);
            }
        }
        let _ = writeln!(out, "Text: {text}");
    }
    out
}

/// Build the inventory submission for a report.
#[must_use]
pub fn build_submission(report: &FinalReport) -> InventorySubmission {
    let prefix = report.start_stamp();
    let status = report.status().to_owned();
    let note = format!(
        "Test run on {} at {} UTC, status: {status}.",
        report.started_at.format("%m/%d/%Y"),
        report.started_at.format("%H:%M"),
    );

    let mut attachments = vec![NamedAttachment {
        name: format!("{prefix}/summary"),
        content_type: "text/plain".into(),
        data: report.summary.clone().into_bytes(),
    }];
    for payload in report.results.iter().filter_map(|r| r.payload.as_ref()) {
        for plot in payload.plots.iter().filter(|p| p.has_image()) {
            attachments.push(NamedAttachment {
                name: format!("{prefix}/{}", plot.title),
                content_type: format!("image/{}", plot.image_format),
                data: plot.image.clone(),
            });
        }
    }

    InventorySubmission {
        unit_id: report.unit_id.clone(),
        status,
        note,
        attachments,
    }
}

/// File name of the local report copy: `<unitId>_<YYYYmmdd_HHMM>.test`.
#[must_use]
pub fn local_file_name(unit_id: &str, started_at: DateTime<Utc>) -> String {
    let safe_unit: String = unit_id
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{safe_unit}_{}.test", started_at.format("%Y%m%d_%H%M"))
}

/// Write the summary to `results_dir`.
///
/// # Errors
///
/// Returns `AppError::Io` if the file cannot be written.
pub async fn write_local_copy(results_dir: &Path, report: &FinalReport) -> Result<PathBuf> {
    fs::create_dir_all(results_dir).await?;
    let path = results_dir.join(local_file_name(&report.unit_id, report.started_at));
    fs::write(&path, report.summary.as_bytes()).await?;
    Ok(path)
}

/// Publishes reports and notes to the sink and the results directory.
#[derive(Clone)]
pub struct ReportPublisher {
    sink: Option<Arc<dyn ReportSink>>,
    results_dir: PathBuf,
}

impl ReportPublisher {
    /// Construct a publisher; with no sink reports are only written locally.
    #[must_use]
    pub fn new(sink: Option<Arc<dyn ReportSink>>, results_dir: PathBuf) -> Self {
        Self { sink, results_dir }
    }

    /// Directory receiving local report copies.
    #[must_use]
    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Record a hardware rework note against the unit. Best-effort.
    pub async fn record_rework(&self, unit_id: &str, reason: &str) {
        let Some(ref sink) = self.sink else {
            info!(unit_id, reason, "rework noted (no inventory configured)");
            return;
        };
        let note = format!("Hardware rework, reason given: {reason}");
        if let Err(err) = sink.add_note(unit_id, &note).await {
            warn!(unit_id, %err, "failed to record rework note");
        }
    }

    /// Deliver a report to the sink, then write the local copy.
    ///
    /// Neither failure is escalated; the receipt says what succeeded.
    pub async fn publish(&self, report: &FinalReport) -> SubmissionReceipt {
        let span = info_span!("publish_report", unit_id = %report.unit_id);
        async move {
            let delivered = match self.sink {
                Some(ref sink) => {
                    let submission = build_submission(report);
                    match sink.submit(&submission).await {
                        Ok(()) => {
                            info!(
                                attachments = submission.attachments.len(),
                                "results submitted to inventory"
                            );
                            true
                        }
                        Err(err) => {
                            warn!(%err, "inventory submission failed; local copy is authoritative");
                            false
                        }
                    }
                }
                None => false,
            };

            let local_path = match write_local_copy(&self.results_dir, report).await {
                Ok(path) => {
                    info!(path = %path.display(), "results logged");
                    Some(path)
                }
                Err(err) => {
                    error!(%err, "failed to write local results copy");
                    None
                }
            };

            SubmissionReceipt {
                local_path,
                delivered,
            }
        }
        .instrument(span)
        .await
    }
}
