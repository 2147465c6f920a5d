//! Migration plan generation.
//!
//! Steps are emitted in an order that never references a missing object and
//! never drops one that is still referenced:
//!
//! 1. added tables, then their indexes, then their foreign keys
//! 2. per modified table: added columns, modified columns, added foreign
//!    keys, added indexes, removed indexes, removed foreign keys, removed
//!    columns
//! 3. removed tables
//!
//! Engines without in-place ALTER support get a single table-recreation step
//! for a modified table when the source schema is known.

use tracing::debug;

use crate::diff::{SchemaDiff, TableDiff};
use crate::driver::{Driver, Feature};
use crate::error::Result;
use crate::plan::{Plan, PlanStep};
use crate::schema::{self, Schema, Table};

/// Build a plan for `diff`. The plan's source hash is the hash of `source`,
/// or empty when no source schema was given.
pub fn generate(diff: &SchemaDiff, source: Option<&Schema>, driver: &dyn Driver) -> Result<Plan> {
    let source_hash = match source {
        Some(s) => schema::hash(Some(s))?,
        None => String::new(),
    };
    let mut plan = Plan::new(source_hash);
    let separate_fks = driver.supports_feature(Feature::AlterAddForeignKey);

    for table in &diff.added_tables {
        plan.steps.push(driver.create_table(table));
    }
    for table in &diff.added_tables {
        for idx in &table.indexes {
            plan.steps.push(driver.add_index(&table.name, idx));
        }
    }
    if separate_fks {
        for table in &diff.added_tables {
            for fk in &table.foreign_keys {
                plan.steps.push(driver.add_foreign_key(&table.name, fk));
            }
        }
    }

    for table_diff in &diff.modified_tables {
        let source_table = source.and_then(|s| s.table(&table_diff.table_name));
        match source_table {
            Some(current) if needs_recreate(table_diff, driver) => {
                plan.steps.extend(recreate(table_diff, current, driver));
            }
            _ => plan.steps.extend(alter(table_diff, driver)),
        }
    }

    for table in &diff.removed_tables {
        plan.steps.push(driver.drop_table(table));
    }

    debug!(steps = plan.steps.len(), driver = driver.name(), "generated plan");
    Ok(plan)
}

fn needs_recreate(diff: &TableDiff, driver: &dyn Driver) -> bool {
    let column_changes =
        !diff.modified_columns.is_empty() && !driver.supports_feature(Feature::AlterColumnType);
    let fk_changes = (!diff.added_foreign_keys.is_empty() || !diff.removed_foreign_keys.is_empty())
        && !driver.supports_feature(Feature::AlterAddForeignKey);
    column_changes || fk_changes
}

fn alter(diff: &TableDiff, driver: &dyn Driver) -> Vec<PlanStep> {
    let table = diff.table_name.as_str();
    let mut steps = Vec::new();

    for col in &diff.added_columns {
        steps.push(driver.add_column(table, col));
    }
    for col in &diff.modified_columns {
        steps.extend(driver.modify_column(table, col));
    }
    for fk in &diff.added_foreign_keys {
        steps.push(driver.add_foreign_key(table, fk));
    }
    for idx in &diff.added_indexes {
        steps.push(driver.add_index(table, idx));
    }
    for idx in &diff.removed_indexes {
        steps.push(driver.drop_index(table, idx));
    }
    for fk in &diff.removed_foreign_keys {
        steps.push(driver.drop_foreign_key(table, fk));
    }
    for col in &diff.removed_columns {
        steps.push(driver.drop_column(table, col));
    }
    steps
}

/// One recreation step carrying every column, foreign-key and surviving index
/// change, followed by the added indexes.
fn recreate(diff: &TableDiff, current: &Table, driver: &dyn Driver) -> Vec<PlanStep> {
    let (target, copy_columns) = target_table(diff, current);
    let Some(step) = driver.recreate_table(&target, &copy_columns) else {
        return alter(diff, driver);
    };

    let mut steps = vec![step];
    for idx in &diff.added_indexes {
        steps.push(driver.add_index(&diff.table_name, idx));
    }
    steps
}

/// The table as it should look after `diff`, plus the columns whose data
/// carries over from `current`.
pub(crate) fn target_table(diff: &TableDiff, current: &Table) -> (Table, Vec<String>) {
    let removed = |name: &str| diff.removed_columns.iter().any(|c| c.name == name);

    let mut columns = Vec::new();
    let mut copy_columns = Vec::new();
    for col in &current.columns {
        if removed(&col.name) {
            continue;
        }
        copy_columns.push(col.name.clone());
        match diff.modified_columns.iter().find(|m| m.column_name == col.name) {
            Some(modified) => columns.push(modified.new.clone()),
            None => columns.push(col.clone()),
        }
    }
    columns.extend(diff.added_columns.iter().cloned());

    let indexes = current
        .indexes
        .iter()
        .filter(|idx| !diff.removed_indexes.iter().any(|r| r.name == idx.name))
        .cloned()
        .collect();

    let mut foreign_keys: Vec<_> = current
        .foreign_keys
        .iter()
        .filter(|fk| !diff.removed_foreign_keys.iter().any(|r| r.name == fk.name))
        .cloned()
        .collect();
    foreign_keys.extend(diff.added_foreign_keys.iter().cloned());

    let table = Table {
        name: current.name.clone(),
        columns,
        indexes,
        foreign_keys,
    };
    (table, copy_columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::diff;
    use crate::driver::{PostgresDriver, SqliteDriver};
    use crate::schema::{Column, ForeignKey, Index};
    use pretty_assertions::assert_eq;

    fn users() -> Table {
        Table::new("users")
            .column(Column::new("id", "integer").primary_key())
            .column(Column::new("email", "text").not_null())
    }

    fn schema(tables: Vec<Table>) -> Schema {
        let mut s = Schema::new();
        for t in tables {
            s.add_table(t);
        }
        s
    }

    fn sql(plan: &Plan) -> Vec<String> {
        plan.steps.iter().flat_map(|s| s.sql.clone()).collect()
    }

    #[test]
    fn test_add_table() {
        let d = diff(&Schema::new(), &schema(vec![users()]));
        let plan = generate(&d, None, &PostgresDriver).unwrap();

        assert_eq!(plan.source_hash, "");
        assert_eq!(
            sql(&plan),
            vec!["CREATE TABLE users (id integer NOT NULL PRIMARY KEY, email text NOT NULL)"]
        );
    }

    #[test]
    fn test_source_hash_is_recorded() {
        let before = schema(vec![users()]);
        let after = schema(vec![users().column(Column::new("age", "integer"))]);
        let plan = generate(&diff(&before, &after), Some(&before), &PostgresDriver).unwrap();
        assert_eq!(plan.source_hash, before.content_hash().unwrap());
    }

    #[test]
    fn test_added_tables_before_their_foreign_keys() {
        let posts = Table::new("posts")
            .column(Column::new("id", "integer").primary_key())
            .column(Column::new("user_id", "integer"))
            .index(Index::new("idx_posts_user", ["user_id"]))
            .foreign_key(ForeignKey::new("fk_posts_user", ["user_id"], "users", ["id"]));
        let d = diff(&Schema::new(), &schema(vec![posts, users()]));
        let plan = generate(&d, None, &PostgresDriver).unwrap();

        let descriptions: Vec<_> = plan.steps.iter().map(|s| s.description.as_str()).collect();
        assert_eq!(
            descriptions,
            vec![
                "Create table posts",
                "Create table users",
                "Create index idx_posts_user on table posts",
                "Add foreign key fk_posts_user to table posts",
            ]
        );
    }

    #[test]
    fn test_modified_table_ordering() {
        let before = schema(vec![
            users()
                .column(Column::new("legacy", "text"))
                .index(Index::new("idx_old", ["legacy"])),
        ]);
        let after = schema(vec![
            users()
                .column(Column::new("age", "integer"))
                .index(Index::new("idx_age", ["age"])),
        ]);
        let plan = generate(&diff(&before, &after), Some(&before), &PostgresDriver).unwrap();

        assert_eq!(
            sql(&plan),
            vec![
                "ALTER TABLE users ADD COLUMN age integer",
                "CREATE INDEX idx_age ON users (age)",
                "DROP INDEX idx_old",
                "ALTER TABLE users DROP COLUMN legacy",
            ]
        );
    }

    #[test]
    fn test_removed_tables_last() {
        let before = schema(vec![users(), Table::new("audit").column(Column::new("id", "integer"))]);
        let after = schema(vec![users().column(Column::new("age", "integer"))]);
        let plan = generate(&diff(&before, &after), None, &PostgresDriver).unwrap();
        assert_eq!(plan.steps.last().unwrap().sql, vec!["DROP TABLE audit CASCADE"]);
    }

    #[test]
    fn test_sqlite_without_source_documents_limitation() {
        let before = schema(vec![users()]);
        let after = schema(vec![
            Table::new("users")
                .column(Column::new("id", "integer").primary_key())
                .column(Column::new("email", "text")),
        ]);
        let plan = generate(&diff(&before, &after), None, &SqliteDriver).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert!(plan.steps[0].is_comment_only());
    }

    #[test]
    fn test_sqlite_recreates_table_with_source() {
        let before = schema(vec![users().column(Column::new("legacy", "text"))]);
        let after = schema(vec![
            Table::new("users")
                .column(Column::new("id", "integer").primary_key())
                .column(Column::new("email", "text"))
                .column(Column::new("age", "integer"))
                .index(Index::new("idx_age", ["age"])),
        ]);
        let plan = generate(&diff(&before, &after), Some(&before), &SqliteDriver).unwrap();

        assert_eq!(plan.steps.len(), 2);
        assert_eq!(
            plan.steps[0].sql,
            vec![
                "CREATE TABLE users_new (id integer PRIMARY KEY NOT NULL, email text, age integer)",
                "INSERT INTO users_new (id, email) SELECT id, email FROM users",
                "DROP TABLE users",
                "ALTER TABLE users_new RENAME TO users",
            ]
        );
        assert_eq!(plan.steps[1].sql, vec!["CREATE INDEX idx_age ON users (age)"]);
    }

    #[test]
    fn test_sqlite_plain_alter_when_possible() {
        let before = schema(vec![users()]);
        let after = schema(vec![users().column(Column::new("age", "integer"))]);
        let plan = generate(&diff(&before, &after), Some(&before), &SqliteDriver).unwrap();
        assert_eq!(sql(&plan), vec!["ALTER TABLE users ADD COLUMN age integer"]);
    }
}
