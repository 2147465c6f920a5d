//! Lock classification, safer rewrites and shadow dry runs.

use lockplan::db::{Connection, Database};
use lockplan::diff::diff;
use lockplan::driver::{Driver, PostgresDriver, SqliteDriver};
use lockplan::executor::{self, ApplyOptions};
use lockplan::locks::{ImpactLevel, LockMode, analyze, detect, synthesise};
use lockplan::plan::{Plan, PlanStep};
use lockplan::planner;
use lockplan::rollback::rollback;
use lockplan::schema::{Column, Schema, Table};
use pretty_assertions::assert_eq;

fn step(sql: &str) -> PlanStep {
    PlanStep::new("step", [sql])
}

#[test]
fn test_add_table_plan_lock_and_rollback() {
    let before = Schema::new();
    let mut after = Schema::new();
    after.add_table(
        Table::new("users")
            .column(Column::new("id", "integer").primary_key().not_null())
            .column(Column::new("email", "text").not_null()),
    );

    let plan = planner::generate(&diff(&before, &after), Some(&before), &PostgresDriver).unwrap();
    assert_eq!(plan.steps.len(), 1);
    assert_eq!(
        plan.steps[0].sql,
        vec!["CREATE TABLE users (id integer NOT NULL PRIMARY KEY, email text NOT NULL)"]
    );
    assert_eq!(detect(&plan.steps[0]), LockMode::AccessShare);

    let reverse = rollback(&plan, &before, &PostgresDriver);
    assert_eq!(reverse.steps.len(), 1);
    assert_eq!(reverse.steps[0].sql, vec!["DROP TABLE users CASCADE"]);
}

#[test]
fn test_plain_index_rewritten_concurrently() {
    let original = step("CREATE INDEX idx_users_email ON users(email)");
    let impact = analyze(&original);
    assert_eq!(impact.lock_mode, LockMode::Share);
    assert_eq!(impact.impact, ImpactLevel::Medium);

    let rewrite = synthesise(&original).unwrap();
    assert_eq!(rewrite.sql, vec!["CREATE INDEX CONCURRENTLY idx_users_email ON users(email)"]);
    assert_eq!(rewrite.lock_mode, LockMode::ShareUpdateExclusive);
    assert!(rewrite.lock_mode < impact.lock_mode);
    assert_eq!(synthesise(&rewrite.to_step(&original)), None);
}

#[test]
fn test_constraint_split_into_not_valid_and_validate() {
    let original = step("ALTER TABLE orders ADD CONSTRAINT check_positive CHECK (amount > 0)");
    let rewrite = synthesise(&original).unwrap();
    assert_eq!(
        rewrite.sql,
        vec![
            "ALTER TABLE orders ADD CONSTRAINT check_positive CHECK (amount > 0) NOT VALID",
            "ALTER TABLE orders VALIDATE CONSTRAINT check_positive",
        ]
    );
    assert!(rewrite.requires_multiple_steps);
    assert_eq!(synthesise(&rewrite.to_step(&original)), None);
}

#[test]
fn test_type_change_points_at_multiphase() {
    let rewrite = synthesise(&step("ALTER TABLE users ALTER COLUMN age TYPE BIGINT")).unwrap();
    assert!(rewrite.is_sentinel());
    assert!(rewrite.notes.contains("type_change"));
}

#[tokio::test]
async fn test_shadow_failure_leaves_target_unchanged() {
    let mut target = Connection::sqlite_memory().await.unwrap();
    target
        .execute("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT)")
        .await
        .unwrap();
    let current = SqliteDriver.introspect(&mut target).await.unwrap();

    let plan = Plan::new(current.content_hash().unwrap())
        .step(PlanStep::new("Add name", ["ALTER TABLE users ADD COLUMN name TEXT"]))
        .step(PlanStep::new("Index missing column", ["CREATE INDEX idx_users_missing ON users (missing)"]));

    let mut shadow = Connection::sqlite_memory().await.unwrap();
    let err = executor::apply(
        &mut target,
        &plan,
        Some(&mut shadow),
        &current,
        &SqliteDriver,
        &ApplyOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, lockplan::Error::ShadowRejection(_)));

    let after = SqliteDriver.introspect(&mut target).await.unwrap();
    assert_eq!(after, current);
}

#[tokio::test]
async fn test_measured_impact_on_shadow() {
    let mut shadow = Connection::sqlite_memory().await.unwrap();
    shadow
        .execute("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT)")
        .await
        .unwrap();

    let impact = lockplan::locks::measure_step_impact(
        &mut shadow,
        &step("CREATE INDEX idx_users_email ON users (email)"),
    )
    .await;
    assert!(impact.measured_on_shadow);
    assert!(impact.estimated_duration_ms.is_some());

    // Measurement is rolled back.
    let schema = SqliteDriver.introspect(&mut shadow).await.unwrap();
    assert!(schema.table("users").unwrap().indexes.is_empty());
}

/// Disposable PostgreSQL database from `LOCKPLAN_TEST_POSTGRES_URL`.
async fn postgres() -> Option<Connection> {
    let Ok(url) = std::env::var("LOCKPLAN_TEST_POSTGRES_URL") else {
        eprintln!("LOCKPLAN_TEST_POSTGRES_URL not set; skipping");
        return None;
    };
    Some(Connection::connect(&url).await.unwrap())
}

async fn index_count(conn: &mut Connection, name: &str) -> i64 {
    let Connection::Postgres(inner) = conn else {
        unreachable!()
    };
    sqlx::query_scalar("SELECT COUNT(*) FROM pg_indexes WHERE indexname = $1")
        .bind(name)
        .fetch_one(&mut *inner)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_postgres_concurrent_index_under_lock_timeout() {
    let Some(mut conn) = postgres().await else {
        return;
    };
    conn.execute("DROP TABLE IF EXISTS lockplan_timeout_items").await.unwrap();
    conn.execute("CREATE TABLE lockplan_timeout_items (id integer PRIMARY KEY, name text)")
        .await
        .unwrap();

    let plan = Plan::default().step(step(
        "CREATE INDEX CONCURRENTLY idx_lockplan_timeout_items_name ON lockplan_timeout_items (name)",
    ));
    let opts = ApplyOptions {
        lock_timeout: Some(5),
        ..Default::default()
    };
    let result = executor::apply(&mut conn, &plan, None, &Schema::new(), &PostgresDriver, &opts)
        .await
        .unwrap();

    assert!(result.success, "{:?}", result.errors);
    assert_eq!(index_count(&mut conn, "idx_lockplan_timeout_items_name").await, 1);
    conn.execute("DROP TABLE lockplan_timeout_items").await.unwrap();
}

#[tokio::test]
async fn test_postgres_concurrent_index_measured_outside_transaction() {
    let Some(mut conn) = postgres().await else {
        return;
    };
    conn.execute("DROP TABLE IF EXISTS lockplan_measure_items").await.unwrap();
    conn.execute("CREATE TABLE lockplan_measure_items (id integer PRIMARY KEY, name text)")
        .await
        .unwrap();

    let concurrent = step(
        "CREATE INDEX CONCURRENTLY idx_lockplan_measure_items_name ON lockplan_measure_items (name)",
    );
    let measurement = lockplan::locks::measure(Some(&mut conn as &mut dyn Database), &concurrent)
        .await
        .unwrap();
    assert!(measurement.success, "{:?}", measurement.error);
    assert_eq!(measurement.lock_mode, LockMode::ShareUpdateExclusive);

    let impact = lockplan::locks::measure_step_impact(&mut conn, &concurrent).await;
    assert!(impact.measured_on_shadow);

    // The index built outside the transaction is dropped again.
    assert_eq!(index_count(&mut conn, "idx_lockplan_measure_items_name").await, 0);
    conn.execute("DROP TABLE lockplan_measure_items").await.unwrap();
}
