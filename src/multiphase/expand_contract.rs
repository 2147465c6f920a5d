//! Expand/contract: rename a column without breaking deployed code.

use super::{require, steps};
use crate::error::{Error, Result};
use crate::plan::{MultiPhasePlan, Pattern, Phase, PhaseRollback, Plan};

/// Three phases: add and backfill the new column, move reads, drop the old column.
pub fn expand_contract(
    table: &str,
    old_column: &str,
    new_column: &str,
    column_type: &str,
    source_hash: &str,
) -> Result<MultiPhasePlan> {
    require(&[
        ("table", table),
        ("old column", old_column),
        ("new column", new_column),
        ("column type", column_type),
    ])?;
    if old_column == new_column {
        return Err(Error::validation("old and new column must be different"));
    }

    let expand = Phase::new(
        1,
        "expand",
        format!("Add {} column and backfill from {}", new_column, old_column),
    )
    .code_deploy()
    .code_changes([
        format!("Update application to write to both {} and {} columns", old_column, new_column),
        format!("Keep reading from {} column", old_column),
        "Deploy this code before proceeding to Phase 2".to_string(),
    ])
    .plan(steps(vec![
        (
            format!("Add {} column (nullable)", new_column),
            format!("ALTER TABLE {} ADD COLUMN {} {}", table, new_column, column_type),
        ),
        (
            format!("Backfill {} from {}", new_column, old_column),
            format!(
                "UPDATE {} SET {} = {} WHERE {} IS NULL",
                table, new_column, old_column, new_column
            ),
        ),
    ]))
    .verification([
        format!(
            "Verify dual-write is working: SELECT COUNT(*) FROM {} WHERE {} IS NULL AND {} IS NOT NULL",
            table, new_column, old_column
        ),
        format!("Monitor application logs for {} writes", new_column),
        format!("Check that all new rows have both {} and {} populated", old_column, new_column),
    ])
    .rollback(
        PhaseRollback::new(format!("Drop {} column", new_column))
            .sql([format!("ALTER TABLE {} DROP COLUMN {}", table, new_column)])
            .note("Safe to rollback - old column still in use")
            .warning("Any data written to new column will be lost")
            .requires_code(),
    )
    .duration("< 1 minute (depends on table size)")
    .lock_impact("Brief AccessExclusive lock during ALTER TABLE");

    let migrate_reads = Phase::new(
        2,
        "migrate_reads",
        format!("Switch application to read from {} column", new_column),
    )
    .code_deploy()
    .code_changes([
        format!("Update application to read from {} column", new_column),
        format!("Continue writing to both {} and {} columns", old_column, new_column),
        "Deploy this code before proceeding to Phase 3".to_string(),
    ])
    .plan(Plan::default())
    .verification([
        format!("Monitor application logs to confirm reading from {}", new_column),
        format!("Verify no queries are reading from {} column", old_column),
        "Check application metrics for any errors".to_string(),
    ])
    .rollback(
        PhaseRollback::new(format!("Switch reads back to {} column", old_column))
            .note("Code deployment only - no SQL changes")
            .warning("Must redeploy application to read from old column")
            .requires_code(),
    )
    .duration("Instant (code deployment only)")
    .lock_impact("None");

    let contract = Phase::new(3, "contract", format!("Remove old {} column", old_column))
        .code_deploy()
        .code_changes([
            format!("Remove all references to {} column from application code", old_column),
            format!("Use only {} column", new_column),
            "Deploy this code before executing Phase 3".to_string(),
        ])
        .plan(steps(vec![(
            format!("Drop old {} column", old_column),
            format!("ALTER TABLE {} DROP COLUMN {}", table, old_column),
        )]))
        .verification([
            "Verify application is working correctly with new column".to_string(),
            format!("Check that no errors related to {} column appear in logs", old_column),
            "Monitor application metrics".to_string(),
        ])
        .rollback(
            PhaseRollback::new(format!(
                "Re-add {} column and backfill from {}",
                old_column, new_column
            ))
            .sql([
                format!("ALTER TABLE {} ADD COLUMN {} {}", table, old_column, column_type),
                format!("UPDATE {} SET {} = {}", table, old_column, new_column),
            ])
            .warning("Rollback requires redeploying code to dual-write again")
            .requires_code(),
        )
        .duration("< 1 minute")
        .lock_impact("Brief AccessExclusive lock during DROP COLUMN");

    Ok(MultiPhasePlan::workflow(
        Pattern::ExpandContract,
        "rename_column",
        format!(
            "Rename {}.{} to {}.{} using expand/contract pattern",
            table, old_column, table, new_column
        ),
        table,
    )
    .on_column(old_column)
    .with_phases(vec![expand, migrate_reads, contract], source_hash)
    .safety_notes([
        "Each phase is backward compatible with the previous phase".to_string(),
        "Code must be deployed between phases".to_string(),
        "Rollback is possible at any phase but may require code changes".to_string(),
        "Monitor application behavior between phases".to_string(),
        format!("Phase 1: Both columns exist, app writes to both, reads from {}", old_column),
        format!("Phase 2: Both columns exist, app writes to both, reads from {}", new_column),
        format!("Phase 3: Only {} column exists", new_column),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rename_phases() {
        let plan = expand_contract("users", "email", "email_address", "TEXT", "hash").unwrap();

        assert_eq!(plan.operation, "rename_column");
        assert_eq!(plan.total_phases, 3);
        let names: Vec<_> = plan.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["expand", "migrate_reads", "contract"]);

        let expand = &plan.phases[0];
        assert_eq!(expand.plan.source_hash, "hash");
        assert_eq!(expand.plan.steps.len(), 2);
        assert_eq!(
            expand.plan.steps[0].sql,
            vec!["ALTER TABLE users ADD COLUMN email_address TEXT"]
        );
        assert_eq!(
            expand.plan.steps[1].sql,
            vec!["UPDATE users SET email_address = email WHERE email_address IS NULL"]
        );

        let reads = &plan.phases[1];
        assert!(reads.plan.steps.is_empty());
        assert!(reads.requires_code_deploy);
        assert_eq!(reads.depends_on_phase, 1);

        let contract = &plan.phases[2];
        assert_eq!(contract.plan.steps.len(), 1);
        assert_eq!(contract.plan.steps[0].sql, vec!["ALTER TABLE users DROP COLUMN email"]);
        assert_eq!(contract.rollback.sql.len(), 2);

        plan.validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(expand_contract("", "a", "b", "text", "").is_err());
        assert!(expand_contract("users", "email", "email", "text", "").is_err());
        assert!(expand_contract("users", "email", "mail", "", "").is_err());
    }
}
