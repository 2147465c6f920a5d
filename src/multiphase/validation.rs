//! Validation phase: add a constraint without a long exclusive lock.

use super::{require, steps};
use crate::error::{Error, Result};
use crate::plan::{MultiPhasePlan, Pattern, Phase, PhaseRollback};

/// Constraint added by [`validation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintKind {
    NotNull,
    /// Boolean expression without the `CHECK` keyword or outer parentheses.
    Check(String),
    Unique,
}

impl ConstraintKind {
    /// Parse `NOT NULL`, `UNIQUE` or `CHECK (<expr>)`, case-insensitively.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let upper = trimmed.to_uppercase();
        let words: Vec<&str> = upper.split_whitespace().collect();
        match words.as_slice() {
            ["NOT", "NULL"] | ["NOT_NULL"] => return Ok(Self::NotNull),
            ["UNIQUE"] => return Ok(Self::Unique),
            _ => {}
        }
        if upper.starts_with("CHECK") {
            let expr = strip_parens(trimmed["CHECK".len()..].trim());
            if expr.is_empty() {
                return Err(Error::validation("CHECK constraint requires an expression"));
            }
            return Ok(Self::Check(expr.to_string()));
        }
        Err(Error::validation(format!(
            "unsupported constraint '{}': expected NOT NULL, UNIQUE or CHECK (...)",
            trimmed
        )))
    }

    fn suffix(&self) -> &'static str {
        match self {
            Self::NotNull => "not_null",
            Self::Check(_) => "check",
            Self::Unique => "unique",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::NotNull => "NOT NULL",
            Self::Check(_) => "CHECK",
            Self::Unique => "UNIQUE",
        }
    }
}

/// Remove one pair of parentheses wrapping the whole expression.
fn strip_parens(expr: &str) -> &str {
    let Some(inner) = expr.strip_prefix('(').and_then(|e| e.strip_suffix(')')) else {
        return expr;
    };
    let mut depth = 0i32;
    for c in inner.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return expr;
                }
            }
            _ => {}
        }
    }
    if depth == 0 { inner.trim() } else { expr }
}

/// Backfill, add the constraint unvalidated, validate it, and for NOT NULL
/// promote it to a column constraint.
///
/// `backfill` is the value or SQL expression written into NULL rows and is
/// required for [`ConstraintKind::NotNull`].
pub fn validation(
    table: &str,
    column: &str,
    kind: &ConstraintKind,
    backfill: Option<&str>,
    source_hash: &str,
) -> Result<MultiPhasePlan> {
    require(&[("table", table), ("column", column)])?;

    let name = format!("{}_{}_{}", table, column, kind.suffix());

    let (backfill_desc, backfill_sql) = match kind {
        ConstraintKind::NotNull => {
            let value = backfill
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::validation("a backfill value is required for NOT NULL constraints"))?;
            (
                format!("Backfill NULL values in {}.{} with {}", table, column, value),
                format!("UPDATE {} SET {} = {} WHERE {} IS NULL", table, column, value, column),
            )
        }
        ConstraintKind::Check(expr) => (
            format!("Fix data in {}.{} to satisfy CHECK constraint", table, column),
            format!("-- Review and fix data that violates: {}", expr),
        ),
        ConstraintKind::Unique => (
            format!("Deduplicate values in {}.{} for UNIQUE constraint", table, column),
            format!("-- Review and deduplicate values in {}.{}", table, column),
        ),
    };

    let mut phases = vec![Phase::new(1, "backfill", backfill_desc.clone())
        .code_changes(["No code changes required for this phase"])
        .plan(steps(vec![(backfill_desc, backfill_sql)]))
        .verification([
            format!(
                "Verify no NULL values remain: SELECT COUNT(*) FROM {} WHERE {} IS NULL",
                table, column
            ),
            "Check affected row count".to_string(),
        ])
        .rollback(
            PhaseRollback::new("Backfill cannot be rolled back")
                .note("Data modifications are permanent, but constraint is not yet added")
                .warning("If backfill was incorrect, must manually fix data"),
        )
        .duration("Depends on table size and number of NULL values")
        .lock_impact("Row-level locks during UPDATE")];

    let (add_desc, add_sql) = match kind {
        ConstraintKind::NotNull => (
            format!("Add NOT NULL check constraint (NOT VALID) on {}.{}", table, column),
            format!(
                "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({} IS NOT NULL) NOT VALID",
                table, name, column
            ),
        ),
        ConstraintKind::Check(expr) => (
            format!("Add CHECK constraint (NOT VALID) on {}.{}", table, column),
            format!("ALTER TABLE {} ADD CONSTRAINT {} CHECK ({}) NOT VALID", table, name, expr),
        ),
        // UNIQUE has no NOT VALID form; build the index concurrently instead.
        ConstraintKind::Unique => (
            format!("Create UNIQUE index concurrently on {}.{}", table, column),
            format!("CREATE UNIQUE INDEX CONCURRENTLY {}_idx ON {}({})", name, table, column),
        ),
    };
    let (add_duration, add_locks) = match kind {
        ConstraintKind::Unique => (
            "Depends on table size (concurrent index build)",
            "None (CONCURRENTLY avoids locks)",
        ),
        _ => (
            "< 1 second for NOT VALID constraint",
            "ShareUpdateExclusive lock (allows reads and writes)",
        ),
    };
    let add_rollback_sql = match kind {
        ConstraintKind::Unique => format!("DROP INDEX CONCURRENTLY IF EXISTS {}_idx", name),
        _ => format!("ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}", table, name),
    };

    phases.push(
        Phase::new(2, "add_constraint_not_valid", add_desc.clone())
            .code_changes(["No code changes required"])
            .plan(steps(vec![(add_desc, add_sql)]))
            .verification([
                format!("Verify constraint exists: Check pg_constraint for {}", name),
                "Verify new inserts/updates are validated".to_string(),
            ])
            .rollback(
                PhaseRollback::new(format!("Drop constraint {}", name))
                    .sql([add_rollback_sql])
                    .note("Safe to rollback - constraint not yet validated on existing rows"),
            )
            .duration(add_duration)
            .lock_impact(add_locks),
    );

    let (validate_desc, validate_sql) = match kind {
        ConstraintKind::Unique => (
            format!("Convert unique index to UNIQUE constraint on {}.{}", table, column),
            format!("ALTER TABLE {} ADD CONSTRAINT {} UNIQUE USING INDEX {}_idx", table, name, name),
        ),
        _ => (
            format!("Validate {} constraint on existing rows", kind.suffix()),
            format!("ALTER TABLE {} VALIDATE CONSTRAINT {}", table, name),
        ),
    };

    phases.push(
        Phase::new(3, "validate", validate_desc.clone())
            .code_changes(["No code changes required"])
            .plan(steps(vec![(validate_desc, validate_sql)]))
            .verification([
                "Verify validation completed without errors".to_string(),
                format!(
                    "Check constraint is valid: SELECT convalidated FROM pg_constraint WHERE conname = '{}'",
                    name
                ),
            ])
            .rollback(
                PhaseRollback::new(format!("Drop constraint {}", name))
                    .sql([format!("ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}", table, name)])
                    .warning("Rollback removes constraint that was just validated"),
            )
            .duration("Depends on table size (scans all rows)")
            .lock_impact("ShareUpdateExclusive lock during validation"),
    );

    if *kind == ConstraintKind::NotNull {
        phases.push(
            Phase::new(4, "make_not_null", format!("Set {}.{} to NOT NULL", table, column))
                .code_changes(["No code changes required"])
                .plan(steps(vec![
                    (
                        format!("Set {} column to NOT NULL", column),
                        format!("ALTER TABLE {} ALTER COLUMN {} SET NOT NULL", table, column),
                    ),
                    (
                        "Drop CHECK constraint (now redundant with NOT NULL)".to_string(),
                        format!("ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}", table, name),
                    ),
                ]))
                .verification([
                    format!("Verify column is NOT NULL: Check pg_attribute for {}.{}", table, column),
                    "Attempt to insert NULL (should fail)".to_string(),
                ])
                .rollback(
                    PhaseRollback::new(format!("Remove NOT NULL constraint from {}", column))
                        .sql([format!("ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL", table, column)])
                        .warning("Removes NOT NULL - allows NULL values again"),
                )
                .duration("< 1 second (no table scan needed)")
                .lock_impact("AccessExclusive lock (brief)"),
        );
    }

    let mut notes = vec![
        format!("Adding {} constraint safely using validation phase pattern", kind.label()),
        "Phase 1: Fix existing data to satisfy constraint".to_string(),
        "Phase 2: Add constraint (NOT VALID) - validates new data only".to_string(),
        "Phase 3: Validate existing rows (lighter lock)".to_string(),
    ];
    if *kind == ConstraintKind::NotNull {
        notes.push("Phase 4: Make column NOT NULL and drop CHECK constraint".to_string());
    }
    notes.push("This approach avoids heavyweight AccessExclusive lock on large tables".to_string());

    Ok(MultiPhasePlan::workflow(
        Pattern::Validation,
        format!("add_{}_constraint", kind.suffix()),
        format!(
            "Add {} constraint to {}.{} using validation phase pattern",
            kind.label(),
            table,
            column
        ),
        table,
    )
    .on_column(column)
    .with_phases(phases, source_hash)
    .safety_notes(notes))
}
