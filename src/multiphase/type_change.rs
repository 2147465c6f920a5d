//! Dual-write column type change.

use super::{require, steps};
use crate::error::Result;
use crate::plan::{MultiPhasePlan, Pattern, Phase, PhaseRollback, Plan};

/// Five phases through a `<column>_new` shadow column.
///
/// `conversion` converts an old value to the new type and defaults to
/// `CAST(<column> AS <new_type>)`.
pub fn type_change(
    table: &str,
    column: &str,
    old_type: &str,
    new_type: &str,
    conversion: Option<&str>,
    source_hash: &str,
) -> Result<MultiPhasePlan> {
    require(&[
        ("table", table),
        ("column", column),
        ("old type", old_type),
        ("new type", new_type),
    ])?;

    let conversion = match conversion.map(str::trim).filter(|c| !c.is_empty()) {
        Some(expr) => expr.to_string(),
        None => format!("CAST({} AS {})", column, new_type),
    };
    let new_column = format!("{}_new", column);

    let add = Phase::new(1, "add_new_column", format!("Add {} column with {} type", new_column, new_type))
        .code_changes(["No code changes yet - new column is not used"])
        .plan(steps(vec![(
            format!("Add {} column (type: {})", new_column, new_type),
            format!("ALTER TABLE {} ADD COLUMN {} {}", table, new_column, new_type),
        )]))
        .verification([
            format!("Verify column exists: SELECT {} FROM {} LIMIT 1", new_column, table),
            "Check column type is correct".to_string(),
        ])
        .rollback(
            PhaseRollback::new(format!("Drop {} column", new_column))
                .sql([format!("ALTER TABLE {} DROP COLUMN {}", table, new_column)])
                .note("Safe to rollback - old column still in use"),
        )
        .duration("< 1 second")
        .lock_impact("AccessExclusive lock (brief)");

    let dual_write = Phase::new(
        2,
        "enable_dual_write",
        format!("Update application to write to both {} and {}", column, new_column),
    )
    .code_deploy()
    .code_changes([
        format!("Update INSERT statements to include {}", new_column),
        format!("Update UPDATE statements to modify both {} and {}", column, new_column),
        format!("Apply conversion logic: {}", conversion),
        format!("Continue reading from {}", column),
    ])
    .plan(Plan::default())
    .verification([
        "Monitor application logs for dual-write activity".to_string(),
        format!("Verify new rows have both {} and {} populated", column, new_column),
        "Check for any errors in conversion logic".to_string(),
    ])
    .rollback(
        PhaseRollback::new(format!("Stop writing to {}", new_column))
            .note("Code deployment only - remove dual-write logic")
            .requires_code(),
    )
    .duration("Instant (code deployment only)")
    .lock_impact("None");

    let backfill = Phase::new(
        3,
        "backfill",
        format!("Backfill {} from {} using conversion expression", new_column, column),
    )
    .code_changes(["No code changes required for this phase"])
    .plan(steps(vec![(
        format!("Backfill {} from {}", new_column, column),
        format!(
            "UPDATE {} SET {} = {} WHERE {} IS NULL AND {} IS NOT NULL",
            table, new_column, conversion, new_column, column
        ),
    )]))
    .verification([
        format!(
            "Verify all rows have {} populated: SELECT COUNT(*) FROM {} WHERE {} IS NULL AND {} IS NOT NULL",
            new_column, table, new_column, column
        ),
        "Check data integrity - compare sample rows".to_string(),
        "Verify conversion logic worked correctly".to_string(),
    ])
    .rollback(
        PhaseRollback::new(format!("Clear {} column", new_column))
            .sql([format!("UPDATE {} SET {} = NULL", table, new_column)])
            .note("Clears backfilled data but keeps column")
            .warning("Recent data from dual-write will also be cleared"),
    )
    .duration("Depends on table size")
    .lock_impact("Row-level locks during UPDATE");

    let migrate_reads = Phase::new(4, "migrate_reads", format!("Update application to read from {}", new_column))
        .code_deploy()
        .code_changes([
            format!("Update all SELECT statements to read from {}", new_column),
            format!("Continue writing to both {} and {}", column, new_column),
            "Update any business logic that depends on the column type".to_string(),
            "Deploy and monitor carefully".to_string(),
        ])
        .plan(Plan::default())
        .verification([
            format!("Monitor application logs - confirm reading from {}", new_column),
            format!("Verify no queries reference {} column", column),
            "Check application metrics for any type-related errors".to_string(),
            "Validate business logic still works correctly".to_string(),
        ])
        .rollback(
            PhaseRollback::new(format!("Switch reads back to {}", column))
                .note("Code deployment only")
                .warning("Must redeploy to read from old column again")
                .requires_code(),
        )
        .duration("Instant (code deployment only)")
        .lock_impact("None");

    let drop_old = Phase::new(
        5,
        "drop_old_column",
        format!("Drop old {} column and rename {} to {}", column, new_column, column),
    )
    .code_deploy()
    .code_changes([
        format!("Update all references from {} to {} in application code", new_column, column),
        format!("Remove dual-write logic for {}", column),
        "Use only the renamed column".to_string(),
    ])
    .plan(steps(vec![
        (
            format!("Drop old {} column", column),
            format!("ALTER TABLE {} DROP COLUMN {}", table, column),
        ),
        (
            format!("Rename {} to {}", new_column, column),
            format!("ALTER TABLE {} RENAME COLUMN {} TO {}", table, new_column, column),
        ),
    ]))
    .verification([
        format!("Verify {} column exists with correct type", column),
        format!(
            "Verify old column is gone: SELECT * FROM information_schema.columns WHERE table_name = '{}'",
            table
        ),
        "Confirm application works with final schema".to_string(),
    ])
    .rollback(
        PhaseRollback::new("Cannot easily rollback - requires re-creating old column with old type")
            .warning(format!(
                "Complex rollback: would need to add {} column back with type {}, backfill from {}, update code",
                column, old_type, new_column
            ))
            .requires_code(),
    )
    .duration("< 1 second")
    .lock_impact("AccessExclusive lock during DROP and RENAME");

    Ok(MultiPhasePlan::workflow(
        Pattern::TypeChange,
        "alter_column_type",
        format!(
            "Change {}.{} type from {} to {} using dual-write pattern",
            table, column, old_type, new_type
        ),
        table,
    )
    .on_column(column)
    .with_phases(vec![add, dual_write, backfill, migrate_reads, drop_old], source_hash)
    .safety_notes([
        "Type change requires coordination between database and application".to_string(),
        "Each phase is backward compatible with previous phase".to_string(),
        format!("Phase 1: Add {} column ({} type)", new_column, new_type),
        "Phase 2: Application writes to both columns (dual-write)".to_string(),
        format!("Phase 3: Backfill {} from {}", new_column, column),
        format!("Phase 4: Application reads from {}", new_column),
        format!("Phase 5: Drop {}, rename {} to {}", column, new_column, column),
        "⚠️  Monitor application behavior carefully during Phase 4 (read migration)".to_string(),
        format!("Conversion expression: {}", conversion),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_conversion_is_cast() {
        let plan = type_change("users", "age", "integer", "bigint", None, "h").unwrap();
        assert_eq!(plan.total_phases, 5);
        assert_eq!(
            plan.phases[2].plan.steps[0].sql,
            vec!["UPDATE users SET age_new = CAST(age AS bigint) WHERE age_new IS NULL AND age IS NOT NULL"]
        );
        assert_eq!(plan.phases[0].plan.source_hash, "h");
        assert_eq!(plan.phases[2].plan.source_hash, "");
    }

    #[test]
    fn test_custom_conversion_and_final_rename() {
        let plan =
            type_change("users", "price", "text", "numeric", Some("price::numeric"), "").unwrap();
        assert!(plan.phases[2].plan.steps[0].sql[0].contains("SET price_new = price::numeric"));
        let last: Vec<_> = plan.phases[4]
            .plan
            .steps
            .iter()
            .map(|s| s.sql[0].as_str())
            .collect();
        assert_eq!(
            last,
            vec![
                "ALTER TABLE users DROP COLUMN price",
                "ALTER TABLE users RENAME COLUMN price_new TO price",
            ]
        );
        let code_only: Vec<_> = plan.phases.iter().filter(|p| !p.has_sql()).map(|p| p.phase_number).collect();
        assert_eq!(code_only, vec![2, 4]);
    }

    #[test]
    fn test_requires_types() {
        assert!(type_change("users", "age", "", "bigint", None, "").is_err());
    }
}
