//! Static lock classification.
//!
//! Only the first statement of a step is inspected. Rules are checked in
//! order and the first match wins; anything unrecognised is assumed to take
//! ACCESS EXCLUSIVE.

use super::{LockImpact, LockMode, rewrite};
use crate::plan::{Plan, PlanStep};

/// Uppercased first statement with runs of whitespace collapsed.
fn normalized_first(step: &PlanStep) -> String {
    step.first_sql()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

fn is_create_index(sql: &str) -> bool {
    sql.starts_with("CREATE INDEX") || sql.starts_with("CREATE UNIQUE INDEX")
}

/// Lock mode the step's first statement acquires.
pub fn detect(step: &PlanStep) -> LockMode {
    let sql = normalized_first(step);
    if sql.is_empty() {
        return LockMode::AccessShare;
    }

    if is_create_index(&sql) {
        return if sql.contains("CONCURRENTLY") {
            LockMode::ShareUpdateExclusive
        } else {
            LockMode::Share
        };
    }

    if sql.starts_with("ALTER TABLE") {
        // NOT VALID still takes ACCESS EXCLUSIVE, only briefly.
        if sql.contains("ADD CONSTRAINT") {
            return LockMode::AccessExclusive;
        }
        if sql.contains("VALIDATE CONSTRAINT") {
            return LockMode::ShareUpdateExclusive;
        }
        return LockMode::AccessExclusive;
    }

    if sql.starts_with("DROP TABLE") || sql.starts_with("DROP INDEX") || sql.starts_with("TRUNCATE")
    {
        return LockMode::AccessExclusive;
    }

    if sql.starts_with("CREATE TABLE") {
        return LockMode::AccessShare;
    }

    if sql.starts_with("INSERT") || sql.starts_with("UPDATE") || sql.starts_with("DELETE") {
        return LockMode::RowExclusive;
    }

    if sql.starts_with("SELECT") {
        return LockMode::AccessShare;
    }

    LockMode::AccessExclusive
}

/// Classify a step and explain the consequence for concurrent traffic.
pub fn analyze(step: &PlanStep) -> LockImpact {
    let mode = detect(step);
    LockImpact {
        operation: step.description.clone(),
        lock_mode: mode,
        blocks_reads: mode.blocks_reads(),
        blocks_writes: mode.blocks_writes(),
        impact: mode.impact_level(),
        estimated_duration_ms: None,
        measured_on_shadow: false,
        explanation: explain(step, mode),
    }
}

fn explain(step: &PlanStep, mode: LockMode) -> String {
    if step.sql.is_empty() {
        return "No SQL operations".into();
    }
    let sql = normalized_first(step);

    let text = match mode {
        LockMode::AccessExclusive => {
            if sql.contains("ALTER TABLE") {
                if sql.contains("ADD COLUMN") {
                    if sql.contains("DEFAULT") {
                        "ALTER TABLE ADD COLUMN with DEFAULT requires rewriting the entire table"
                    } else {
                        "ALTER TABLE requires exclusive access to modify table structure"
                    }
                } else if sql.contains("DROP COLUMN") {
                    "DROP COLUMN requires exclusive access to modify table structure"
                } else if sql.contains("ALTER COLUMN") && sql.contains(" TYPE ") {
                    "Changing column type may require rewriting the entire table"
                } else if sql.contains("ADD CONSTRAINT") && sql.contains("NOT VALID") {
                    "ADD CONSTRAINT NOT VALID takes a brief exclusive lock without scanning rows"
                } else if sql.contains("ADD CONSTRAINT") {
                    "ADD CONSTRAINT scans all existing rows to validate the constraint"
                } else {
                    "ALTER TABLE operation requires exclusive access"
                }
            } else if sql.contains("DROP TABLE") {
                "DROP TABLE requires exclusive access to remove the table"
            } else if sql.contains("DROP INDEX") {
                "DROP INDEX requires exclusive access to the indexed table"
            } else if sql.contains("TRUNCATE") {
                "TRUNCATE requires exclusive access to delete all rows"
            } else {
                "This operation requires exclusive table access"
            }
        }
        LockMode::Share => {
            if is_create_index(&sql) && !sql.contains("CONCURRENTLY") {
                "CREATE INDEX requires SHARE lock, blocking writes during index build"
            } else {
                "This operation blocks writes but allows reads"
            }
        }
        LockMode::ShareUpdateExclusive => {
            if is_create_index(&sql) {
                "CREATE INDEX CONCURRENTLY allows concurrent reads and writes"
            } else if sql.contains("VALIDATE CONSTRAINT") {
                "VALIDATE CONSTRAINT allows concurrent reads and writes"
            } else {
                "This operation allows concurrent reads and writes"
            }
        }
        LockMode::RowExclusive => "Normal DML operation (INSERT/UPDATE/DELETE)",
        LockMode::AccessShare => "Read-only operation",
        _ => "Standard locking for this operation type",
    };
    text.to_string()
}

/// Fill the lock annotation fields of every step in a plan.
pub fn annotate(plan: &mut Plan) {
    for step in &mut plan.steps {
        let impact = analyze(step);
        step.rewritable = rewrite::synthesise(step).is_some();
        step.lock_mode = Some(impact.lock_mode);
        step.lock_impact = Some(impact.explanation);
        step.blocks_reads = impact.blocks_reads;
        step.blocks_writes = impact.blocks_writes;
    }
}
