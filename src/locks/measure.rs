//! Shadow-database timing of plan steps.
//!
//! The first statement of a step runs inside a transaction that is always
//! rolled back. Statements that refuse to run in a transaction (concurrent
//! index builds) run bare and the created index is dropped afterwards.
//! Timings are indicators only: multi-statement steps are measured by their
//! first statement.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, warn};

use super::rewrite::extract_index_name;
use super::{LockImpact, LockMode, analyze, detect};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::plan::PlanStep;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockMeasurement {
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub lock_mode: LockMode,
    pub sql: String,
}

impl LockMeasurement {
    fn failed(lock_mode: LockMode, sql: &str, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            duration_ms,
            success: false,
            error: Some(error.into()),
            lock_mode,
            sql: sql.to_string(),
        }
    }
}

fn is_transaction_refusal(message: &str) -> bool {
    message.contains("CONCURRENTLY") && message.contains("cannot run inside a transaction")
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Time a step's first statement on the shadow database.
///
/// A missing connection is an error; everything else is reported through
/// the returned measurement.
pub async fn measure(conn: Option<&mut dyn Database>, step: &PlanStep) -> Result<LockMeasurement> {
    let conn = conn.ok_or_else(|| Error::Measurement("database connection is missing".into()))?;

    let Some(sql) = step.sql.first() else {
        return Ok(LockMeasurement::failed(LockMode::AccessShare, "", "no SQL to measure", 0));
    };

    let lock_mode = detect(step);
    if sql.trim().is_empty() {
        return Ok(LockMeasurement::failed(lock_mode, sql, "empty SQL", 0));
    }

    if let Err(e) = conn.begin().await {
        return Ok(LockMeasurement::failed(
            lock_mode,
            sql,
            format!("failed to begin transaction: {}", e),
            0,
        ));
    }

    let start = Instant::now();
    let outcome = conn.execute(sql).await;
    let duration_ms = elapsed_ms(start);

    if let Err(e) = conn.rollback().await {
        debug!(error = %e, "rollback after measurement failed");
    }

    match outcome {
        Ok(()) => Ok(LockMeasurement {
            duration_ms,
            success: true,
            error: None,
            lock_mode,
            sql: sql.clone(),
        }),
        Err(e) if is_transaction_refusal(&e.to_string()) => {
            Ok(measure_outside_transaction(conn, sql, lock_mode).await)
        }
        Err(e) => Ok(LockMeasurement::failed(
            lock_mode,
            sql,
            format!("execution failed: {}", e),
            duration_ms,
        )),
    }
}

async fn measure_outside_transaction(
    conn: &mut dyn Database,
    sql: &str,
    lock_mode: LockMode,
) -> LockMeasurement {
    let index_name = extract_index_name(sql);

    let start = Instant::now();
    let outcome = conn.execute(sql).await;
    let duration_ms = elapsed_ms(start);

    if let Err(e) = outcome {
        return LockMeasurement::failed(
            lock_mode,
            sql,
            format!("concurrent operation failed: {}", e),
            duration_ms,
        );
    }

    if !index_name.is_empty() {
        let drop = format!("DROP INDEX IF EXISTS {}", index_name);
        if let Err(e) = conn.execute(&drop).await {
            warn!(index = %index_name, error = %e, "could not drop index created during measurement");
        }
    }

    LockMeasurement {
        duration_ms,
        success: true,
        error: None,
        lock_mode,
        sql: sql.to_string(),
    }
}

/// Static analysis enriched with a shadow timing when one can be taken.
pub async fn measure_step_impact(conn: &mut dyn Database, step: &PlanStep) -> LockImpact {
    let mut impact = analyze(step);
    match measure(Some(conn), step).await {
        Ok(m) if m.success => {
            impact.estimated_duration_ms = Some(m.duration_ms);
            impact.measured_on_shadow = true;
        }
        Ok(m) => {
            debug!(step = %step.description, error = ?m.error, "measurement unsuccessful");
        }
        Err(e) => {
            warn!(step = %step.description, error = %e, "measurement failed");
        }
    }
    impact
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Connection;

    async fn shadow() -> Connection {
        let mut conn = Connection::sqlite_memory().await.unwrap();
        conn.execute("CREATE TABLE users (id integer PRIMARY KEY, email text)")
            .await
            .unwrap();
        conn
    }

    async fn index_count(conn: &mut Connection) -> i64 {
        let Connection::Sqlite(inner) = conn else {
            panic!("expected sqlite");
        };
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_users_email'")
            .fetch_one(&mut *inner)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_connection_is_error() {
        let step = PlanStep::new("x", ["SELECT 1"]);
        assert!(matches!(measure(None, &step).await, Err(Error::Measurement(_))));
    }

    #[tokio::test]
    async fn test_empty_sql_is_failed_measurement() {
        let mut conn = shadow().await;

        let none = PlanStep::new("none", Vec::<String>::new());
        let m = measure(Some(&mut conn as &mut dyn Database), &none).await.unwrap();
        assert!(!m.success);
        assert_eq!(m.error.as_deref(), Some("no SQL to measure"));

        let blank = PlanStep::new("blank", ["  "]);
        let m = measure(Some(&mut conn as &mut dyn Database), &blank).await.unwrap();
        assert!(!m.success);
        assert_eq!(m.error.as_deref(), Some("empty SQL"));
    }

    #[tokio::test]
    async fn test_measurement_is_rolled_back() {
        let mut conn = shadow().await;
        let step = PlanStep::new("Create index", ["CREATE INDEX idx_users_email ON users (email)"]);

        let m = measure(Some(&mut conn as &mut dyn Database), &step).await.unwrap();
        assert!(m.success, "{:?}", m.error);
        assert_eq!(m.lock_mode, LockMode::Share);
        assert_eq!(index_count(&mut conn).await, 0);
    }

    #[tokio::test]
    async fn test_failed_statement_is_reported() {
        let mut conn = shadow().await;
        let step = PlanStep::new("Bad", ["CREATE INDEX idx_missing ON ghosts (a)"]);

        let m = measure(Some(&mut conn as &mut dyn Database), &step).await.unwrap();
        assert!(!m.success);
        assert!(m.error.unwrap().starts_with("execution failed"));
    }

    #[tokio::test]
    async fn test_step_impact_carries_duration() {
        let mut conn = shadow().await;
        let step = PlanStep::new("Create index", ["CREATE INDEX idx_users_email ON users (email)"]);

        let impact = measure_step_impact(&mut conn, &step).await;
        assert!(impact.measured_on_shadow);
        assert!(impact.estimated_duration_ms.is_some());
        assert_eq!(impact.lock_mode, LockMode::Share);
    }
}
