//! Plan and rollback round trips against a real SQLite database.
//!
//! Schemas are declared as DDL, planned with the SQLite driver, applied
//! through the executor and read back through introspection.

use lockplan::db::Connection;
use lockplan::diff::diff;
use lockplan::driver::{Driver, SqliteDriver};
use lockplan::executor::{self, ApplyOptions, prepare_shadow};
use lockplan::plan::Plan;
use lockplan::planner;
use lockplan::rollback::rollback;
use lockplan::schema::Schema;
use lockplan::schema::loader::schema_from_sql;
use pretty_assertions::assert_eq;

const BEFORE: &str = "
    CREATE TABLE users (
        id INTEGER PRIMARY KEY,
        email TEXT NOT NULL
    );
    CREATE INDEX idx_users_email ON users (email);
";

const AFTER: &str = "
    CREATE TABLE users (
        id INTEGER PRIMARY KEY,
        email TEXT NOT NULL,
        name TEXT
    );
    CREATE UNIQUE INDEX idx_users_email_unique ON users (email);
    CREATE TABLE posts (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL,
        title TEXT NOT NULL DEFAULT 'untitled',
        CONSTRAINT fk_posts_user FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
    );
    CREATE INDEX idx_posts_user_id ON posts (user_id);
";

/// Target database holding `schema`, plus its introspected form.
async fn target_with(schema: &Schema) -> (Connection, Schema) {
    let mut conn = Connection::sqlite_memory().await.unwrap();
    prepare_shadow(&mut conn, schema, &SqliteDriver).await.unwrap();
    let current = SqliteDriver.introspect(&mut conn).await.unwrap();
    (conn, current)
}

async fn apply_and_introspect(conn: &mut Connection, plan: &Plan, current: &Schema) -> Schema {
    let result = executor::apply(conn, plan, None, current, &SqliteDriver, &ApplyOptions::default())
        .await
        .unwrap();
    assert!(result.success, "apply failed: {:?}", result.errors);
    assert_eq!(result.steps_applied, plan.steps.len());
    SqliteDriver.introspect(conn).await.unwrap()
}

#[tokio::test]
async fn test_identical_schemas_produce_empty_plan() {
    let schema = schema_from_sql(AFTER).await.unwrap();
    let changes = diff(&schema, &schema);
    assert!(changes.is_empty());
    let plan = planner::generate(&changes, Some(&schema), &SqliteDriver).unwrap();
    assert!(plan.is_empty());
}

#[tokio::test]
async fn test_applied_plan_reaches_desired_hash() {
    let before = schema_from_sql(BEFORE).await.unwrap();
    let after = schema_from_sql(AFTER).await.unwrap();
    let (mut conn, current) = target_with(&before).await;
    assert_eq!(current.content_hash().unwrap(), before.content_hash().unwrap());

    let plan = planner::generate(&diff(&current, &after), Some(&current), &SqliteDriver).unwrap();
    assert_eq!(plan.source_hash, current.content_hash().unwrap());

    let migrated = apply_and_introspect(&mut conn, &plan, &current).await;
    assert_eq!(migrated.content_hash().unwrap(), after.content_hash().unwrap());
}

#[tokio::test]
async fn test_rollback_restores_original_hash() {
    let before = schema_from_sql(BEFORE).await.unwrap();
    let after = schema_from_sql(AFTER).await.unwrap();
    let (mut conn, current) = target_with(&before).await;

    let forward = planner::generate(&diff(&current, &after), Some(&current), &SqliteDriver).unwrap();
    let migrated = apply_and_introspect(&mut conn, &forward, &current).await;

    let reverse = rollback(&forward, &current, &SqliteDriver);
    assert!(reverse.source_hash.is_empty());
    let restored = apply_and_introspect(&mut conn, &reverse, &migrated).await;
    assert_eq!(restored.content_hash().unwrap(), before.content_hash().unwrap());
}

#[tokio::test]
async fn test_nullability_change_recreates_table_and_rolls_back() {
    let before = schema_from_sql("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT)")
        .await
        .unwrap();
    let after = schema_from_sql("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL)")
        .await
        .unwrap();
    let (mut conn, current) = target_with(&before).await;
    sqlx_insert(&mut conn, "INSERT INTO users (id, email) VALUES (1, 'a@example.com')").await;

    let forward = planner::generate(&diff(&current, &after), Some(&current), &SqliteDriver).unwrap();
    assert_eq!(forward.steps.len(), 1);
    assert!(forward.steps[0].sql.len() >= 4, "expected a table recreation sequence");

    let migrated = apply_and_introspect(&mut conn, &forward, &current).await;
    assert_eq!(migrated.content_hash().unwrap(), after.content_hash().unwrap());

    let reverse = rollback(&forward, &current, &SqliteDriver);
    let restored = apply_and_introspect(&mut conn, &reverse, &migrated).await;
    assert_eq!(restored.content_hash().unwrap(), before.content_hash().unwrap());
}

const PARENT_WITH_CHILDREN: &str = "
    CREATE TABLE users (
        id INTEGER PRIMARY KEY,
        email TEXT NOT NULL
    );
    CREATE TABLE posts (
        id INTEGER PRIMARY KEY,
        user_id INTEGER NOT NULL,
        CONSTRAINT fk_posts_user FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
    );
";

#[tokio::test]
async fn test_recreating_parent_keeps_child_rows() {
    let before = schema_from_sql(PARENT_WITH_CHILDREN).await.unwrap();
    let after = schema_from_sql(&PARENT_WITH_CHILDREN.replace("email TEXT NOT NULL", "email TEXT"))
        .await
        .unwrap();
    let (mut conn, current) = target_with(&before).await;
    sqlx_insert(&mut conn, "INSERT INTO users (id, email) VALUES (1, 'a@example.com')").await;
    sqlx_insert(&mut conn, "INSERT INTO posts (id, user_id) VALUES (1, 1)").await;

    let forward = planner::generate(&diff(&current, &after), Some(&current), &SqliteDriver).unwrap();
    assert!(forward.steps.iter().any(|s| s.is_table_rebuild()));

    let mut shadow = Connection::sqlite_memory().await.unwrap();
    let result = executor::apply(
        &mut conn,
        &forward,
        Some(&mut shadow),
        &current,
        &SqliteDriver,
        &ApplyOptions::default(),
    )
    .await
    .unwrap();
    assert!(result.success, "apply failed: {:?}", result.errors);

    assert_eq!(scalar(&mut conn, "SELECT COUNT(*) FROM posts").await, 1);
    assert_eq!(scalar(&mut conn, "SELECT COUNT(*) FROM users").await, 1);
    let migrated = SqliteDriver.introspect(&mut conn).await.unwrap();
    assert_eq!(migrated.content_hash().unwrap(), after.content_hash().unwrap());

    // Enforcement is back on once the plan has run.
    assert_eq!(scalar(&mut conn, "PRAGMA foreign_keys").await, 1);
    let orphan = lockplan::db::Database::execute(&mut conn, "INSERT INTO posts (id, user_id) VALUES (2, 99)").await;
    assert!(orphan.is_err());

    let reverse = rollback(&forward, &current, &SqliteDriver);
    let restored = apply_and_introspect(&mut conn, &reverse, &migrated).await;
    assert_eq!(restored.content_hash().unwrap(), before.content_hash().unwrap());
    assert_eq!(scalar(&mut conn, "SELECT COUNT(*) FROM posts").await, 1);
}

async fn scalar(conn: &mut Connection, sql: &str) -> i64 {
    let Connection::Sqlite(inner) = conn else {
        unreachable!()
    };
    sqlx::query_scalar(sql).fetch_one(&mut *inner).await.unwrap()
}

async fn sqlx_insert(conn: &mut Connection, sql: &str) {
    use lockplan::db::Database;
    conn.execute(sql).await.unwrap();
}
