//! Deprecation period: drop a column once nothing reads or writes it.

use super::{require, steps};
use crate::error::Result;
use crate::plan::{MultiPhasePlan, Pattern, Phase, PhaseRollback, Plan};

/// Stop writes, optionally archive, stop reads, drop the column.
///
/// With `archive` and a known `column_type`, the final phase's rollback
/// restores the column from the archive table.
pub fn deprecation(
    table: &str,
    column: &str,
    column_type: &str,
    archive: bool,
    source_hash: &str,
) -> Result<MultiPhasePlan> {
    require(&[("table", table), ("column", column)])?;

    let archive_table = format!("{}_{}_archive", table, column);
    let mut phases = Vec::new();

    phases.push(
        Phase::new(1, "stop_writes", format!("Stop all writes to {}.{} column", table, column))
            .code_deploy()
            .code_changes([
                format!("Remove all code that writes to {} column", column),
                format!("Keep code that reads from {} column (for now)", column),
                "Deploy and monitor for any write attempts".to_string(),
            ])
            .plan(Plan::default())
            .verification([
                "Monitor database logs for any INSERT/UPDATE statements affecting this column",
                "Verify no application errors related to missing column writes",
                "Check that column values are not changing",
            ])
            .rollback(
                PhaseRollback::new(format!("Re-enable writes to {} column", column))
                    .note("Code deployment only - restore write logic")
                    .requires_code(),
            )
            .duration("Instant (code deployment only)")
            .lock_impact("None"),
    );

    if archive {
        phases.push(
            Phase::new(2, "archive", format!("Archive {}.{} data for audit/recovery", table, column))
                .code_changes(["No code changes required for this phase"])
                .plan(steps(vec![(
                    format!("Create archive table for {}.{}", table, column),
                    format!(
                        "CREATE TABLE {} AS SELECT id, {}, NOW() as archived_at FROM {} WHERE {} IS NOT NULL",
                        archive_table, column, table, column
                    ),
                )]))
                .verification([
                    format!("Verify archive table {} was created", archive_table),
                    "Check row counts match".to_string(),
                    "Verify data integrity in archive".to_string(),
                ])
                .rollback(
                    PhaseRollback::new(format!("Drop archive table {}", archive_table))
                        .sql([format!("DROP TABLE IF EXISTS {}", archive_table)])
                        .note("Archive can be safely dropped - original column still exists"),
                )
                .duration("Depends on table size")
                .lock_impact("None (reads only)"),
        );
    }

    let stop_reads = phases.len() as u32 + 1;
    phases.push(
        Phase::new(stop_reads, "stop_reads", format!("Stop all reads from {}.{} column", table, column))
            .code_deploy()
            .code_changes([
                format!("Remove all code that reads from {} column", column),
                "Verify no queries reference this column".to_string(),
                "Deploy and monitor for any read attempts".to_string(),
            ])
            .plan(Plan::default())
            .verification([
                "Monitor application logs for any SELECT statements referencing this column",
                "Verify no application errors",
                "Check database slow query logs",
            ])
            .rollback(
                PhaseRollback::new(format!("Re-enable reads from {} column", column))
                    .note("Code deployment only - restore read logic")
                    .warning("Must redeploy application code")
                    .requires_code(),
            )
            .duration("Instant (code deployment only)")
            .lock_impact("None"),
    );

    let mut drop_rollback = PhaseRollback::new("Cannot fully rollback - data is permanently lost")
        .warning(format!(
            "Column {} data is permanently lost. If archived, can restore from {} table, but requires manual intervention.",
            column, archive_table
        ))
        .requires_code();
    if archive && !column_type.trim().is_empty() {
        drop_rollback = PhaseRollback::new(format!("Restore {} column from {}", column, archive_table))
            .sql([
                format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, column_type),
                format!(
                    "UPDATE {} SET {} = a.{} FROM {} a WHERE a.id = {}.id",
                    table, column, column, archive_table, table
                ),
            ])
            .warning("Rows written after the archive was taken are not restored")
            .requires_code();
    }

    phases.push(
        Phase::new(stop_reads + 1, "drop_column", format!("Drop {}.{} column", table, column))
            .code_changes(["No code changes required - column is no longer referenced"])
            .plan(steps(vec![(
                format!("Drop column {}.{}", table, column),
                format!("ALTER TABLE {} DROP COLUMN {}", table, column),
            )]))
            .verification([
                "Verify application continues to work correctly",
                "Check that no errors appear in logs",
                "Confirm column is removed from schema",
            ])
            .rollback(drop_rollback)
            .duration("< 1 minute")
            .lock_impact("Brief AccessExclusive lock during DROP COLUMN"),
    );

    let mut notes = vec![
        "This is a deprecation period workflow - allows safe column removal".to_string(),
        "Each phase is backward compatible".to_string(),
        "Code must be deployed before SQL changes in each phase".to_string(),
        format!("Phase 1: Stop writes to {}", column),
    ];
    if archive {
        notes.push(format!("Phase 2: Archive {} data to {}", column, archive_table));
        notes.push(format!("Phase 3: Stop reads from {}", column));
        notes.push(format!("Phase 4: Drop {} column permanently", column));
    } else {
        notes.push(format!("Phase 2: Stop reads from {}", column));
        notes.push(format!("Phase 3: Drop {} column permanently", column));
    }
    notes.push("⚠️  Final phase is irreversible - column data will be lost".to_string());
    notes.push("Monitor application between each phase to ensure no issues".to_string());

    Ok(MultiPhasePlan::workflow(
        Pattern::Deprecation,
        "drop_column",
        format!("Safely drop {}.{} using deprecation period pattern", table, column),
        table,
    )
    .on_column(column)
    .with_phases(phases, source_hash)
    .safety_notes(notes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_without_archive() {
        let plan = deprecation("users", "legacy", "text", false, "h").unwrap();
        let names: Vec<_> = plan.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["stop_writes", "stop_reads", "drop_column"]);
        assert_eq!(
            plan.phases[2].plan.steps[0].sql,
            vec!["ALTER TABLE users DROP COLUMN legacy"]
        );
        assert!(plan.phases[2].rollback.sql.is_empty());
        assert_eq!(plan.phases[2].plan.source_hash, "h");
        plan.validate().unwrap();
    }

    #[test]
    fn test_with_archive() {
        let plan = deprecation("users", "legacy", "text", true, "").unwrap();
        assert_eq!(plan.total_phases, 4);
        assert_eq!(plan.phases[1].name, "archive");
        assert_eq!(
            plan.phases[1].plan.steps[0].sql,
            vec!["CREATE TABLE users_legacy_archive AS SELECT id, legacy, NOW() as archived_at FROM users WHERE legacy IS NOT NULL"]
        );
        assert_eq!(plan.phases[3].depends_on_phase, 3);
        assert_eq!(plan.phases[3].rollback.sql.len(), 2);
        plan.validate().unwrap();
    }

    #[test]
    fn test_requires_table_and_column() {
        assert!(deprecation("users", "", "text", false, "").is_err());
    }
}
