//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` and are re-run on
//! every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS qual_session (
    id              TEXT PRIMARY KEY NOT NULL,
    unit_id         TEXT NOT NULL,
    plan_name       TEXT NOT NULL,
    rework_note     TEXT,
    status          TEXT NOT NULL CHECK(status IN ('active','results_ready','aborted','cancelled','submitted','discarded')),
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    finished_at     TEXT,
    detail          TEXT
);

CREATE TABLE IF NOT EXISTS subtest_result (
    session_id      TEXT NOT NULL,
    position        INTEGER NOT NULL,
    name            TEXT NOT NULL,
    outcome         TEXT NOT NULL CHECK(outcome IN ('PASS','FAIL')),
    text            TEXT NOT NULL,
    failure_reason  TEXT,
    recorded_at     TEXT NOT NULL,
    PRIMARY KEY (session_id, position)
);

CREATE INDEX IF NOT EXISTS idx_session_unit ON qual_session(unit_id);
CREATE INDEX IF NOT EXISTS idx_result_session ON subtest_result(session_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
