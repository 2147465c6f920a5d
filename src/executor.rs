//! Plan execution.
//!
//! Apply order: drift check against the plan's source hash, then a dry run on
//! the shadow database (prepared to mirror the current schema and always
//! rolled back), then the target. Target failures are reported through
//! [`ExecutionResult`]; drift and shadow failures are errors.
//!
//! Plans that rebuild tables run inside the driver's rebuild guard, and
//! foreign keys are checked before commit.

use colored::*;
use tracing::{debug, info, warn};

use crate::db::{Connection, Database};
use crate::driver::{Driver, Feature};
use crate::error::{Error, Result};
use crate::locks::lock_timeout_statement;
use crate::plan::{ExecutionResult, Plan, PlanStep, is_skippable};
use crate::schema::{Schema, Table};

/// Knobs for [`apply`].
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Print each step and statement as it runs.
    pub verbose: bool,
    /// Seconds; set on the target session when the driver supports it.
    pub lock_timeout: Option<i64>,
}

/// Fail when `current` no longer hashes to the plan's source hash.
pub fn check_drift(plan: &Plan, current: &Schema) -> Result<()> {
    if plan.source_hash.is_empty() {
        warn!("plan has no source hash; skipping drift check");
        return Ok(());
    }
    let actual = current.content_hash()?;
    if actual != plan.source_hash {
        return Err(Error::Drift {
            expected: plan.source_hash.clone(),
            actual,
        });
    }
    Ok(())
}

/// Apply `plan` to `target`, dry-running it on `shadow` first when given.
pub async fn apply(
    target: &mut dyn Database,
    plan: &Plan,
    shadow: Option<&mut Connection>,
    current: &Schema,
    driver: &dyn Driver,
    opts: &ApplyOptions,
) -> Result<ExecutionResult> {
    check_drift(plan, current)?;

    let guard = rebuild_guard(plan, driver);

    if let Some(shadow) = shadow {
        dry_run(shadow, plan, current, driver, guard, opts.verbose)
            .await
            .map_err(|e| match e {
                Error::ShadowRejection(_) => e,
                other => Error::ShadowRejection(other.to_string()),
            })?;
    }

    let lock_timeout = opts
        .lock_timeout
        .filter(|_| driver.supports_feature(Feature::LockTimeout));
    if let Some(set) = lock_timeout.and_then(lock_timeout_statement) {
        if let Err(e) = target.execute(&set).await {
            return Ok(ExecutionResult {
                errors: vec![format!("failed to set lock timeout: {}", e)],
                ..Default::default()
            });
        }
    }

    if runs_in_transaction(plan, driver) {
        Ok(apply_transactional(target, plan, guard, opts.verbose).await)
    } else {
        Ok(apply_sequential(target, plan, opts.verbose).await)
    }
}

/// Drop everything on the shadow, then replay `schema`: tables with their
/// indexes first, foreign keys last where the engine can add them.
pub async fn prepare_shadow(shadow: &mut Connection, schema: &Schema, driver: &dyn Driver) -> Result<()> {
    let existing = driver.introspect(shadow).await?;
    if !existing.tables.is_empty() {
        debug!(tables = existing.tables.len(), "cleaning shadow database");
        shadow.begin().await?;
        let dropped = drop_tables(shadow, &existing.tables, driver).await;
        finish(shadow, dropped).await?;
    }

    shadow.begin().await?;
    let replayed = replay(shadow, schema, driver).await;
    finish(shadow, replayed).await
}

async fn drop_tables(conn: &mut Connection, tables: &[Table], driver: &dyn Driver) -> Result<()> {
    // Children before parents so engines without CASCADE accept the drops.
    for table in tables.iter().rev() {
        run_step(conn, &driver.drop_table(table)).await?;
    }
    Ok(())
}

async fn replay(conn: &mut Connection, schema: &Schema, driver: &dyn Driver) -> Result<()> {
    let deferred_fks = driver.supports_feature(Feature::AlterAddForeignKey);
    for table in &schema.tables {
        let mut create = table.clone();
        if deferred_fks {
            create.foreign_keys.clear();
        }
        run_step(conn, &driver.create_table(&create)).await?;
        for idx in &table.indexes {
            run_step(conn, &driver.add_index(&table.name, idx)).await?;
        }
    }
    if deferred_fks {
        for table in &schema.tables {
            for fk in &table.foreign_keys {
                run_step(conn, &driver.add_foreign_key(&table.name, fk)).await?;
            }
        }
    }
    Ok(())
}

async fn run_step(conn: &mut dyn Database, step: &PlanStep) -> Result<()> {
    for sql in step.sql.iter().filter(|s| !is_skippable(s)) {
        conn.execute(sql).await?;
    }
    Ok(())
}

/// Commit on success, roll back and surface the error otherwise.
async fn finish(conn: &mut dyn Database, outcome: Result<()>) -> Result<()> {
    match outcome {
        Ok(()) => conn.commit().await,
        Err(e) => {
            if let Err(rb) = conn.rollback().await {
                warn!(error = %rb, "rollback failed");
            }
            Err(e)
        }
    }
}

async fn dry_run(
    shadow: &mut Connection,
    plan: &Plan,
    current: &Schema,
    driver: &dyn Driver,
    guard: Option<[&'static str; 2]>,
    verbose: bool,
) -> Result<()> {
    if verbose {
        eprintln!("  {} Preparing shadow database to match current state...", "[shadow]".cyan());
    }
    prepare_shadow(shadow, current, driver).await?;

    if verbose {
        eprintln!("  {} Testing migration plan...", "[shadow]".cyan());
    }

    if let Some([suspend, _]) = guard {
        shadow.execute(suspend).await?;
    }
    let in_tx = runs_in_transaction(plan, driver);
    if in_tx {
        shadow.begin().await?;
    }

    let mut outcome = run_on_shadow(shadow, plan, verbose).await;
    if outcome.is_ok() && guard.is_some() {
        outcome = match shadow.foreign_key_violations().await {
            Ok(violations) if violations.is_empty() => Ok(()),
            Ok(violations) => Err(Error::ShadowRejection(format!(
                "foreign key check failed: {}",
                violations.join("; ")
            ))),
            Err(e) => Err(e),
        };
    }

    if in_tx {
        if let Err(e) = shadow.rollback().await {
            warn!(error = %e, "shadow rollback failed");
        }
    }
    if let Some([_, restore]) = guard {
        if let Err(e) = shadow.execute(restore).await {
            warn!(error = %e, "failed to restore foreign key enforcement on shadow");
        }
    }

    if outcome.is_ok() && verbose {
        eprintln!("  {} {} Migration test successful", "[shadow]".cyan(), "✓".green());
    }
    outcome
}

async fn run_on_shadow(shadow: &mut Connection, plan: &Plan, verbose: bool) -> Result<()> {
    let total = plan.steps.len();
    for (i, step) in plan.steps.iter().enumerate() {
        if verbose {
            eprintln!("    {} {}", format!("[{}/{}]", i + 1, total).cyan(), step.description);
        }
        let statements: Vec<&String> = step.sql.iter().filter(|s| !is_skippable(s)).collect();
        for (j, sql) in statements.iter().enumerate() {
            if let Err(e) = shadow.execute(sql).await {
                return Err(Error::ShadowRejection(format!(
                    "step {}, statement {}/{} ({}) failed: {}",
                    i + 1,
                    j + 1,
                    statements.len(),
                    step.description,
                    e
                )));
            }
        }
    }
    Ok(())
}

fn runs_in_transaction(plan: &Plan, driver: &dyn Driver) -> bool {
    driver.supports_feature(Feature::TransactionalDdl)
        && !plan
            .steps
            .iter()
            .flat_map(|s| s.sql.iter())
            .any(|sql| sql.to_uppercase().contains("CONCURRENTLY"))
}

/// The driver's rebuild guard, when `plan` recreates a table.
fn rebuild_guard(plan: &Plan, driver: &dyn Driver) -> Option<[&'static str; 2]> {
    driver
        .table_rebuild_guard()
        .filter(|_| plan.steps.iter().any(PlanStep::is_table_rebuild))
}

async fn apply_transactional(
    target: &mut dyn Database,
    plan: &Plan,
    guard: Option<[&'static str; 2]>,
    verbose: bool,
) -> ExecutionResult {
    if let Some([suspend, _]) = guard {
        debug!(sql = suspend, "suspending foreign key enforcement for table rebuild");
        if let Err(e) = target.execute(suspend).await {
            return ExecutionResult {
                errors: vec![format!("failed to prepare table rebuild: {}", e)],
                ..Default::default()
            };
        }
    }

    let result = run_transaction(target, plan, guard.is_some(), verbose).await;

    if let Some([_, restore]) = guard {
        if let Err(e) = target.execute(restore).await {
            warn!(error = %e, "failed to restore foreign key enforcement");
        }
    }
    result
}

async fn run_transaction(
    target: &mut dyn Database,
    plan: &Plan,
    check_foreign_keys: bool,
    verbose: bool,
) -> ExecutionResult {
    let mut result = ExecutionResult::default();

    if let Err(e) = target.begin().await {
        result.errors.push(format!("failed to begin transaction: {}", e));
        return result;
    }

    let mut applied = 0;
    for (i, step) in plan.steps.iter().enumerate() {
        if let Err(msg) = execute_step(target, plan, i, step, verbose).await {
            result.errors.push(msg);
            abort(target, &mut result).await;
            return result;
        }
        applied += 1;
    }

    if check_foreign_keys {
        let problem = match target.foreign_key_violations().await {
            Ok(violations) if violations.is_empty() => None,
            Ok(violations) => Some(format!("foreign key check failed: {}", violations.join("; "))),
            Err(e) => Some(format!("foreign key check failed: {}", e)),
        };
        if let Some(msg) = problem {
            result.errors.push(msg);
            abort(target, &mut result).await;
            return result;
        }
    }

    if let Err(e) = target.commit().await {
        result.errors.push(format!("failed to commit: {}", e));
        return result;
    }

    info!(steps = applied, "plan applied");
    result.steps_applied = applied;
    result.success = true;
    result
}

async fn abort(target: &mut dyn Database, result: &mut ExecutionResult) {
    if let Err(e) = target.rollback().await {
        result.errors.push(format!("failed to roll back: {}", e));
    }
}

async fn apply_sequential(target: &mut dyn Database, plan: &Plan, verbose: bool) -> ExecutionResult {
    let mut result = ExecutionResult::default();
    for (i, step) in plan.steps.iter().enumerate() {
        if let Err(msg) = execute_step(target, plan, i, step, verbose).await {
            result.errors.push(msg);
            return result;
        }
        result.steps_applied += 1;
    }
    info!(steps = result.steps_applied, "plan applied without a transaction");
    result.success = true;
    result
}

async fn execute_step(
    target: &mut dyn Database,
    plan: &Plan,
    index: usize,
    step: &PlanStep,
    verbose: bool,
) -> std::result::Result<(), String> {
    if verbose {
        eprintln!(
            "  {} {}",
            format!("[{}/{}]", index + 1, plan.steps.len()).cyan(),
            step.description
        );
    }

    for (j, sql) in step.sql.iter().enumerate() {
        if is_skippable(sql) {
            continue;
        }
        if verbose {
            eprintln!("    {} {}", "SQL:".yellow(), preview(sql));
        }
        if let Err(e) = target.execute(sql).await {
            return Err(format!(
                "step {}, statement {}/{} ({}) failed: {}",
                index + 1,
                j + 1,
                step.sql.len(),
                step.description,
                e
            ));
        }
        if verbose {
            eprintln!("    {} Executed successfully", "✓".green());
        }
    }
    Ok(())
}

fn preview(sql: &str) -> String {
    const LIMIT: usize = 200;
    if sql.chars().count() <= LIMIT {
        return sql.to_string();
    }
    let cut: String = sql.chars().take(LIMIT).collect();
    format!("{}...", cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{PostgresDriver, SqliteDriver};
    use crate::schema::Column;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    /// Records statements and, like PostgreSQL, refuses CONCURRENTLY inside
    /// a multi-statement query.
    #[derive(Default)]
    struct Recorder {
        statements: Vec<String>,
    }

    #[async_trait]
    impl Database for Recorder {
        async fn execute(&mut self, sql: &str) -> Result<()> {
            if sql.contains(';') && sql.to_uppercase().contains("CONCURRENTLY") {
                return Err(Error::Execution(
                    "CREATE INDEX CONCURRENTLY cannot run inside a transaction block".into(),
                ));
            }
            self.statements.push(sql.to_string());
            Ok(())
        }
    }

    async fn count(conn: &mut Connection, sql: &str) -> i64 {
        let Connection::Sqlite(inner) = conn else {
            unreachable!()
        };
        sqlx::query_scalar(sql).fetch_one(&mut *inner).await.unwrap()
    }

    fn users() -> Schema {
        let mut schema = Schema::new();
        schema.add_table(
            Table::new("users")
                .column(Column::new("id", "integer").primary_key())
                .column(Column::new("email", "text")),
        );
        schema
    }

    async fn target_with(schema: &Schema) -> Connection {
        let mut conn = Connection::sqlite_memory().await.unwrap();
        prepare_shadow(&mut conn, schema, &SqliteDriver).await.unwrap();
        conn
    }

    async fn columns(conn: &mut Connection, table: &str) -> Vec<String> {
        let schema = SqliteDriver.introspect(conn).await.unwrap();
        schema
            .table(table)
            .map(|t| t.columns.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_check_drift() {
        let schema = users();
        let hash = schema.content_hash().unwrap();
        check_drift(&Plan::new(hash), &schema).unwrap();
        check_drift(&Plan::default(), &schema).unwrap();
        assert!(matches!(
            check_drift(&Plan::new("deadbeef"), &schema),
            Err(Error::Drift { .. })
        ));
    }

    #[test]
    fn test_preview_truncates() {
        let long = "x".repeat(250);
        assert_eq!(preview(&long).len(), 203);
        assert_eq!(preview("SELECT 1"), "SELECT 1");
    }

    #[tokio::test]
    async fn test_apply_commits_all_steps() {
        let current = users();
        let mut target = target_with(&current).await;
        let plan = Plan::new(current.content_hash().unwrap())
            .step(PlanStep::new("Add column name", ["ALTER TABLE users ADD COLUMN name text"]))
            .step(PlanStep::new("note", ["-- nothing to run"]))
            .step(PlanStep::new(
                "Add index",
                ["CREATE INDEX idx_users_email ON users (email)"],
            ));

        let result = apply(&mut target, &plan, None, &current, &SqliteDriver, &ApplyOptions::default())
            .await
            .unwrap();

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.steps_applied, 3);
        assert_eq!(columns(&mut target, "users").await, vec!["id", "email", "name"]);
    }

    #[tokio::test]
    async fn test_failed_step_rolls_back_transaction() {
        let current = users();
        let mut target = target_with(&current).await;
        let plan = Plan::default()
            .step(PlanStep::new("Add column name", ["ALTER TABLE users ADD COLUMN name text"]))
            .step(PlanStep::new("Broken", ["ALTER TABLE missing ADD COLUMN x text"]));

        let result = apply(&mut target, &plan, None, &current, &SqliteDriver, &ApplyOptions::default())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.steps_applied, 0);
        assert!(result.errors[0].starts_with("step 2, statement 1/1 (Broken) failed"));
        assert_eq!(columns(&mut target, "users").await, vec!["id", "email"]);
    }

    #[tokio::test]
    async fn test_shadow_rejection_leaves_target_untouched() {
        let current = users();
        let mut target = target_with(&current).await;
        let mut shadow = Connection::sqlite_memory().await.unwrap();
        let plan = Plan::default()
            .step(PlanStep::new("Add column name", ["ALTER TABLE users ADD COLUMN name text"]))
            .step(PlanStep::new("Broken", ["ALTER TABLE missing ADD COLUMN x text"]));

        let err = apply(
            &mut target,
            &plan,
            Some(&mut shadow),
            &current,
            &SqliteDriver,
            &ApplyOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::ShadowRejection(_)));
        assert_eq!(columns(&mut target, "users").await, vec!["id", "email"]);
        assert_eq!(columns(&mut shadow, "users").await, vec!["id", "email"]);
    }

    #[tokio::test]
    async fn test_drift_blocks_apply() {
        let current = users();
        let mut target = target_with(&current).await;
        let plan = Plan::new("0000").step(PlanStep::new("x", ["ALTER TABLE users ADD COLUMN name text"]));

        let err = apply(&mut target, &plan, None, &current, &SqliteDriver, &ApplyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Drift { .. }));
        assert_eq!(columns(&mut target, "users").await, vec!["id", "email"]);
    }

    #[tokio::test]
    async fn test_prepare_shadow_replaces_existing_tables() {
        let mut shadow = Connection::sqlite_memory().await.unwrap();
        shadow.execute("CREATE TABLE stale (id integer)").await.unwrap();

        prepare_shadow(&mut shadow, &users(), &SqliteDriver).await.unwrap();

        let schema = SqliteDriver.introspect(&mut shadow).await.unwrap();
        let names: Vec<_> = schema.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["users"]);
    }

    #[tokio::test]
    async fn test_lock_timeout_set_before_concurrent_index() {
        let mut target = Recorder::default();
        let plan = Plan::default()
            .step(PlanStep::new(
                "Add index",
                ["CREATE INDEX CONCURRENTLY idx_users_email ON users (email)"],
            ))
            .step(PlanStep::new("Add column", ["ALTER TABLE users ADD COLUMN name text"]));
        let opts = ApplyOptions {
            lock_timeout: Some(5),
            ..Default::default()
        };

        let result = apply(&mut target, &plan, None, &Schema::new(), &PostgresDriver, &opts)
            .await
            .unwrap();

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(
            target.statements,
            vec![
                "SET lock_timeout = '5s'",
                "CREATE INDEX CONCURRENTLY idx_users_email ON users (email)",
                "ALTER TABLE users ADD COLUMN name text",
            ]
        );
    }

    #[tokio::test]
    async fn test_lock_timeout_set_before_transaction() {
        let mut target = Recorder::default();
        let plan = Plan::default().step(PlanStep::new(
            "Add column",
            ["ALTER TABLE users ADD COLUMN name text"],
        ));
        let opts = ApplyOptions {
            lock_timeout: Some(3),
            ..Default::default()
        };

        let result = apply(&mut target, &plan, None, &Schema::new(), &PostgresDriver, &opts)
            .await
            .unwrap();

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(
            target.statements,
            vec![
                "SET lock_timeout = '3s'",
                "BEGIN",
                "ALTER TABLE users ADD COLUMN name text",
                "COMMIT",
            ]
        );
    }

    #[tokio::test]
    async fn test_lock_timeout_ignored_without_driver_support() {
        let current = users();
        let mut target = target_with(&current).await;
        let plan = Plan::default().step(PlanStep::new(
            "Add column name",
            ["ALTER TABLE users ADD COLUMN name text"],
        ));
        let opts = ApplyOptions {
            lock_timeout: Some(5),
            ..Default::default()
        };

        let result = apply(&mut target, &plan, None, &current, &SqliteDriver, &opts)
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(columns(&mut target, "users").await, vec!["id", "email", "name"]);
    }

    #[tokio::test]
    async fn test_rebuild_with_orphaned_children_rolls_back() {
        let mut target = Connection::sqlite_memory().await.unwrap();
        target
            .execute("CREATE TABLE users (id integer PRIMARY KEY, email text)")
            .await
            .unwrap();
        target
            .execute("CREATE TABLE posts (id integer PRIMARY KEY, user_id integer REFERENCES users (id) ON DELETE CASCADE)")
            .await
            .unwrap();
        target.execute("INSERT INTO users (id, email) VALUES (1, 'a@example.com')").await.unwrap();
        target.execute("INSERT INTO posts (id, user_id) VALUES (1, 1)").await.unwrap();

        // Rebuild that forgets to copy the rows.
        let plan = Plan::default().step(PlanStep::new(
            "Recreate users",
            [
                "CREATE TABLE users_new (id integer PRIMARY KEY, email text)",
                "DROP TABLE users",
                "ALTER TABLE users_new RENAME TO users",
            ],
        ));
        let result = apply(&mut target, &plan, None, &Schema::new(), &SqliteDriver, &ApplyOptions::default())
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.errors[0].starts_with("foreign key check failed: posts row 1"), "{:?}", result.errors);
        assert_eq!(count(&mut target, "SELECT COUNT(*) FROM users").await, 1);
        assert_eq!(count(&mut target, "SELECT COUNT(*) FROM posts").await, 1);
        assert_eq!(count(&mut target, "PRAGMA foreign_keys").await, 1);
    }

    #[test]
    fn test_rebuild_guard_only_for_rebuilds() {
        let rebuild = Plan::default().step(PlanStep::new(
            "Recreate users",
            [
                "CREATE TABLE users_new (id integer)",
                "DROP TABLE users",
                "ALTER TABLE users_new RENAME TO users",
            ],
        ));
        let plain = Plan::default().step(PlanStep::new("Add column", ["ALTER TABLE users ADD COLUMN a text"]));

        assert!(rebuild_guard(&rebuild, &SqliteDriver).is_some());
        assert!(rebuild_guard(&plain, &SqliteDriver).is_none());
        assert!(rebuild_guard(&rebuild, &PostgresDriver).is_none());
    }
}
