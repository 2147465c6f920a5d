//! Deprecation period for a whole table.

use super::require;
use crate::error::Result;
use crate::plan::{MultiPhasePlan, Pattern, Phase, PhaseRollback, Plan, PlanStep};

/// Stop writes, optionally archive the table, stop reads, drop the table.
pub fn table_deprecation(table: &str, archive: bool, source_hash: &str) -> Result<MultiPhasePlan> {
    require(&[("table", table)])?;

    let archive_table = format!("{}_archive", table);
    let mut phases = Vec::new();

    phases.push(
        Phase::new(1, "stop_writes", format!("Stop all writes to {} table", table))
            .code_deploy()
            .code_changes([
                format!("Remove all code that writes to {} table", table),
                format!("Keep code that reads from {} table (for now)", table),
                "Deploy and monitor for any write attempts".to_string(),
            ])
            .plan(Plan::default())
            .verification([
                format!("Monitor database logs for any INSERT/UPDATE/DELETE statements on {} table", table),
                "Verify no application errors related to missing table writes".to_string(),
                format!("Check that {} table data is not changing", table),
                format!(
                    "Run: SELECT COUNT(*) FROM pg_stat_user_tables WHERE schemaname = 'public' AND relname = '{}' AND n_tup_ins + n_tup_upd + n_tup_del > 0",
                    table
                ),
            ])
            .rollback(
                PhaseRollback::new(format!("Re-enable writes to {} table", table))
                    .note("Code deployment only - restore write logic")
                    .requires_code(),
            )
            .duration("Instant (code deployment only)")
            .lock_impact("None"),
    );

    if archive {
        let plan = Plan::default()
            .step(PlanStep::new(
                format!("Create archive table for {}", table),
                [
                    format!("CREATE TABLE {} AS TABLE {}", archive_table, table),
                    format!(
                        "ALTER TABLE {} ADD COLUMN archived_at TIMESTAMP DEFAULT NOW()",
                        archive_table
                    ),
                ],
            ))
            .step(PlanStep::new(
                "Create index on archive timestamp for audit queries",
                [format!(
                    "CREATE INDEX idx_{}_archived_at ON {}(archived_at)",
                    archive_table, archive_table
                )],
            ));

        phases.push(
            Phase::new(2, "archive", format!("Archive {} table data for audit/recovery", table))
                .code_changes(["No code changes required for this phase"])
                .plan(plan)
                .verification([
                    format!("Verify archive table {} was created", archive_table),
                    format!(
                        "Check row counts match: SELECT COUNT(*) FROM {}; SELECT COUNT(*) FROM {};",
                        table, archive_table
                    ),
                    "Verify data integrity in archive".to_string(),
                    "Test sample queries against archive table".to_string(),
                ])
                .rollback(
                    PhaseRollback::new(format!("Drop archive table {}", archive_table))
                        .sql([format!("DROP TABLE IF EXISTS {}", archive_table)])
                        .note("Archive can be safely dropped - original table still exists"),
                )
                .duration("Depends on table size (full table copy)")
                .lock_impact("None (reads only, archive table is new)"),
        );
    }

    let stop_reads = phases.len() as u32 + 1;
    phases.push(
        Phase::new(stop_reads, "stop_reads", format!("Stop all reads from {} table", table))
            .code_deploy()
            .code_changes([
                format!("Remove all code that reads from {} table", table),
                format!("Verify no queries reference {} table", table),
                "Remove table from ORM models/schemas".to_string(),
                "Deploy and monitor for any read attempts".to_string(),
            ])
            .plan(Plan::default())
            .verification([
                format!("Monitor application logs for any SELECT statements on {} table", table),
                "Verify no application errors".to_string(),
                "Check database slow query logs".to_string(),
                format!(
                    "Run: SELECT query FROM pg_stat_statements WHERE query ILIKE '%{}%' LIMIT 10",
                    table
                ),
            ])
            .rollback(
                PhaseRollback::new(format!("Re-enable reads from {} table", table))
                    .note("Code deployment only - restore read logic and ORM models")
                    .warning("Must redeploy application code with table models restored")
                    .requires_code(),
            )
            .duration("Instant (code deployment only)")
            .lock_impact("None"),
    );

    phases.push(
        Phase::new(stop_reads + 1, "drop_table", format!("Drop {} table permanently", table))
            .code_changes(["No code changes required - table is no longer referenced"])
            .plan(Plan::default().step(PlanStep::new(
                format!("Drop table {}", table),
                [format!("DROP TABLE {}", table)],
            )))
            .verification([
                "Verify application continues to work correctly".to_string(),
                "Check that no errors appear in logs".to_string(),
                "Confirm table is removed from schema".to_string(),
                format!(
                    "Run: SELECT tablename FROM pg_tables WHERE schemaname = 'public' AND tablename = '{}' (should return 0 rows)",
                    table
                ),
            ])
            .rollback(
                PhaseRollback::new("Cannot fully rollback - table and all data are permanently lost")
                    .warning(format!(
                        "Table {} and all its data are permanently lost. If archived, data exists in {} table, but table structure, constraints, indexes, and foreign keys must be manually recreated.",
                        table, archive_table
                    ))
                    .note("Restoration requires: 1) Recreating table schema, 2) Restoring data from archive, 3) Redeploying application code")
                    .requires_code(),
            )
            .duration("< 1 minute (instant for small tables, longer for large tables with indexes)")
            .lock_impact("Brief AccessExclusive lock during DROP TABLE"),
    );

    let mut notes = vec![
        "This is a deprecation period workflow - allows safe table removal".to_string(),
        "Each phase is backward compatible with the previous phase".to_string(),
        "Code must be deployed before SQL changes in each phase".to_string(),
        format!("Phase 1: Stop writes to {} table", table),
    ];
    if archive {
        notes.push(format!("Phase 2: Archive entire {} table to {}", table, archive_table));
        notes.push(format!("Phase 3: Stop reads from {} table", table));
        notes.push(format!("Phase 4: Drop {} table permanently", table));
    } else {
        notes.push(format!("Phase 2: Stop reads from {} table", table));
        notes.push(format!("Phase 3: Drop {} table permanently", table));
    }
    notes.extend([
        "⚠️  Final phase is IRREVERSIBLE - entire table and all data will be lost".to_string(),
        "⚠️  All foreign keys referencing this table must be removed first".to_string(),
        "Monitor application between each phase to ensure no issues".to_string(),
        "Consider keeping archive indefinitely for compliance/audit purposes".to_string(),
    ]);

    Ok(MultiPhasePlan::workflow(
        Pattern::TableDeprecation,
        "drop_table",
        format!("Safely drop {} table using deprecation period pattern", table),
        table,
    )
    .with_phases(phases, source_hash)
    .safety_notes(notes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_archive_phase_copies_table() {
        let plan = table_deprecation("sessions", true, "h").unwrap();
        assert_eq!(plan.total_phases, 4);
        assert_eq!(plan.column, None);

        let archive = &plan.phases[1];
        assert_eq!(archive.plan.source_hash, "h");
        assert_eq!(archive.plan.steps[0].sql[0], "CREATE TABLE sessions_archive AS TABLE sessions");
        assert_eq!(
            archive.plan.steps[1].sql,
            vec!["CREATE INDEX idx_sessions_archive_archived_at ON sessions_archive(archived_at)"]
        );
        assert_eq!(plan.phases[3].plan.steps[0].sql, vec!["DROP TABLE sessions"]);
        plan.validate().unwrap();
    }

    #[test]
    fn test_without_archive() {
        let plan = table_deprecation("sessions", false, "").unwrap();
        let names: Vec<_> = plan.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["stop_writes", "stop_reads", "drop_table"]);
    }

    #[test]
    fn test_requires_table() {
        assert!(table_deprecation(" ", false, "").is_err());
    }
}
