//! Session history repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::result::{Outcome, SubtestResult};
use crate::models::session::{HistoryStatus, Session};
use crate::{AppError, Result};

use super::db::Database;

/// One recorded session as listed by `qual-ctl history`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Session identifier.
    pub session_id: String,
    /// Unit under test.
    pub unit_id: String,
    /// Plan name.
    pub plan: String,
    /// Final (or current) status.
    pub status: HistoryStatus,
    /// Session start.
    pub created_at: DateTime<Utc>,
    /// When the session left the active state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Cancellation reason or abort detail.
    pub detail: Option<String>,
    /// Number of recorded subtest results.
    pub result_count: u32,
    /// Outcome of the last recorded result.
    pub last_outcome: Option<Outcome>,
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: String,
    unit_id: String,
    plan_name: String,
    status: String,
    created_at: String,
    finished_at: Option<String>,
    detail: Option<String>,
    result_count: i64,
    last_outcome: Option<String>,
}

impl HistoryRow {
    fn into_entry(self) -> Result<HistoryEntry> {
        let status = HistoryStatus::parse(&self.status)
            .ok_or_else(|| AppError::Db(format!("invalid session status: {}", self.status)))?;
        let finished_at = self.finished_at.as_deref().map(parse_ts).transpose()?;
        let last_outcome = self.last_outcome.as_deref().map(parse_outcome).transpose()?;

        Ok(HistoryEntry {
            session_id: self.id,
            unit_id: self.unit_id,
            plan: self.plan_name,
            status,
            created_at: parse_ts(&self.created_at)?,
            finished_at,
            detail: self.detail,
            result_count: u32::try_from(self.result_count).unwrap_or(u32::MAX),
            last_outcome,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResultRow {
    name: String,
    outcome: String,
    text: String,
    failure_reason: Option<String>,
}

impl ResultRow {
    fn into_result(self) -> Result<SubtestResult> {
        Ok(SubtestResult {
            name: self.name,
            outcome: parse_outcome(&self.outcome)?,
            text: self.text,
            failure_reason: self.failure_reason,
            payload: None,
        })
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid timestamp {raw}: {e}")))
}

fn parse_outcome(raw: &str) -> Result<Outcome> {
    match raw {
        "PASS" => Ok(Outcome::Pass),
        "FAIL" => Ok(Outcome::Fail),
        other => Err(AppError::Db(format!("invalid outcome: {other}"))),
    }
}

/// Repository for session history records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record a freshly opened session as `active`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn create(&self, session: &Session) -> Result<()> {
        let created_at = session.created_at.to_rfc3339();
        sqlx::query(
            "INSERT INTO qual_session (id, unit_id, plan_name, rework_note, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        )
        .bind(&session.id)
        .bind(&session.unit_id)
        .bind(session.plan.name())
        .bind(&session.rework_note)
        .bind(HistoryStatus::Active.as_str())
        .bind(&created_at)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Move a session to `status`, stamping `finished_at` the first time it
    /// leaves `active`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is unknown or
    /// `AppError::Db` if the update fails.
    pub async fn set_status(
        &self,
        id: &str,
        status: HistoryStatus,
        detail: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let finished = (status != HistoryStatus::Active).then_some(now.as_str());
        let result = sqlx::query(
            "UPDATE qual_session
             SET status = ?2, updated_at = ?3,
                 finished_at = COALESCE(finished_at, ?4),
                 detail = COALESCE(?5, detail)
             WHERE id = ?1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(&now)
        .bind(finished)
        .bind(detail)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("session {id} not recorded")));
        }
        Ok(())
    }

    /// Append a recorded subtest result.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn append_result(
        &self,
        session_id: &str,
        position: usize,
        result: &SubtestResult,
    ) -> Result<()> {
        let position = i64::try_from(position)
            .map_err(|_| AppError::Db("result position out of range".into()))?;
        sqlx::query(
            "INSERT INTO subtest_result (session_id, position, name, outcome, text, failure_reason, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(session_id)
        .bind(position)
        .bind(&result.name)
        .bind(result.outcome.as_str())
        .bind(&result.text)
        .bind(&result.failure_reason)
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Most recent sessions first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<HistoryEntry>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            "SELECT s.id, s.unit_id, s.plan_name, s.status, s.created_at, s.finished_at, s.detail,
                    (SELECT COUNT(*) FROM subtest_result r WHERE r.session_id = s.id) AS result_count,
                    (SELECT r.outcome FROM subtest_result r WHERE r.session_id = s.id
                     ORDER BY r.position DESC LIMIT 1) AS last_outcome
             FROM qual_session s
             ORDER BY s.created_at DESC
             LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(HistoryRow::into_entry).collect()
    }

    /// Recorded results of one session, in order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn results_for(&self, session_id: &str) -> Result<Vec<SubtestResult>> {
        let rows: Vec<ResultRow> = sqlx::query_as(
            "SELECT name, outcome, text, failure_reason
             FROM subtest_result
             WHERE session_id = ?1
             ORDER BY position ASC",
        )
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(ResultRow::into_result).collect()
    }

    /// Mark sessions left `active` by a previous process as cancelled.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn interrupt_stale(&self) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE qual_session
             SET status = 'cancelled', updated_at = ?1, finished_at = ?1,
                 detail = 'sequencer restarted'
             WHERE status = 'active'",
        )
        .bind(&now)
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }
}
