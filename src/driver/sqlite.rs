//! SQLite driver.
//!
//! SQLite cannot alter a column or add and drop foreign keys in place. When
//! the planner has the source schema it asks for a table recreation instead;
//! without one, those operations come back as comment-only steps.

use async_trait::async_trait;
use regex::Regex;
use sqlx::{Row, SqliteConnection};
use std::collections::HashMap;
use std::sync::LazyLock;

use super::{Driver, Feature, column_defs, fk_clause, index_sql, referential_action};
use crate::db::Connection;
use crate::diff::ColumnDiff;
use crate::error::{Error, Result};
use crate::plan::PlanStep;
use crate::schema::{
    Column, Dialect, ForeignKey, Index, Schema, Table, TypeMetadata, normalize_type,
};

static NAMED_FK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)CONSTRAINT\s+(\w+)\s+FOREIGN\s+KEY\s*\(([^)]*)\)").unwrap()
});

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    fn limitation(description: String) -> PlanStep {
        let sql = format!("-- {}", description);
        PlanStep::new(description, [sql])
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn supports_feature(&self, feature: Feature) -> bool {
        matches!(
            feature,
            Feature::ForeignKeys | Feature::DropColumn | Feature::TransactionalDdl
        )
    }

    fn format_column(&self, col: &Column) -> String {
        let mut def = format!("{} {}", col.name, col.data_type);
        // PRIMARY KEY must come before NOT NULL.
        if col.is_primary_key {
            def.push_str(" PRIMARY KEY");
        }
        if !col.nullable {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = &col.default {
            def.push_str(&format!(" DEFAULT {}", default));
        }
        def
    }

    fn create_table(&self, table: &Table) -> PlanStep {
        PlanStep::new(
            format!("Create table {}", table.name),
            [create_table_sql(self, table, &table.name)],
        )
    }

    fn drop_table(&self, table: &Table) -> PlanStep {
        PlanStep::new(
            format!("Drop table {}", table.name),
            [format!("DROP TABLE {}", table.name)],
        )
    }

    fn add_column(&self, table: &str, col: &Column) -> PlanStep {
        PlanStep::new(
            format!("Add column {} to table {}", col.name, table),
            [format!("ALTER TABLE {} ADD COLUMN {}", table, self.format_column(col))],
        )
    }

    fn drop_column(&self, table: &str, col: &Column) -> PlanStep {
        PlanStep::new(
            format!("Drop column {} from table {}", col.name, table),
            [format!("ALTER TABLE {} DROP COLUMN {}", table, col.name)],
        )
    }

    fn modify_column(&self, table: &str, diff: &ColumnDiff) -> Vec<PlanStep> {
        if diff.changes.is_empty() {
            return Vec::new();
        }
        let changes: Vec<String> = diff.changes.iter().map(|c| c.to_string()).collect();
        vec![Self::limitation(format!(
            "SQLite limitation: Cannot modify column {}.{} (changes: {}). Would require table recreation.",
            table,
            diff.column_name,
            changes.join(", ")
        ))]
    }

    fn add_index(&self, table: &str, idx: &Index) -> PlanStep {
        PlanStep::new(
            format!("Create index {} on table {}", idx.name, table),
            [index_sql(table, idx)],
        )
    }

    fn drop_index(&self, table: &str, idx: &Index) -> PlanStep {
        PlanStep::new(
            format!("Drop index {} from table {}", idx.name, table),
            [format!("DROP INDEX {}", idx.name)],
        )
    }

    fn add_foreign_key(&self, table: &str, fk: &ForeignKey) -> PlanStep {
        Self::limitation(format!(
            "SQLite limitation: Cannot add foreign key {} to existing table {}. Foreign keys must be defined at table creation.",
            fk.name, table
        ))
    }

    fn drop_foreign_key(&self, table: &str, fk: &ForeignKey) -> PlanStep {
        Self::limitation(format!(
            "SQLite limitation: Cannot drop foreign key {} from table {}. Would require table recreation.",
            fk.name, table
        ))
    }

    fn recreate_table(&self, target: &Table, copy_columns: &[String]) -> Option<PlanStep> {
        let name = &target.name;
        let temp = format!("{}_new", name);

        let mut sql = vec![create_table_sql(self, target, &temp)];
        if !copy_columns.is_empty() {
            let cols = copy_columns.join(", ");
            sql.push(format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}",
                temp, cols, cols, name
            ));
        }
        sql.push(format!("DROP TABLE {}", name));
        sql.push(format!("ALTER TABLE {} RENAME TO {}", temp, name));
        sql.extend(target.indexes.iter().map(|idx| index_sql(name, idx)));

        Some(PlanStep::new(
            format!("Recreate table {} to apply schema changes", name),
            sql,
        ))
    }

    // DROP TABLE under enforcement deletes the rows first, firing ON DELETE
    // actions in every child table. SQLite ignores the pragma inside a
    // transaction.
    fn table_rebuild_guard(&self) -> Option<[&'static str; 2]> {
        Some(["PRAGMA foreign_keys = OFF", "PRAGMA foreign_keys = ON"])
    }

    async fn introspect(&self, conn: &mut Connection) -> Result<Schema> {
        let Connection::Sqlite(conn) = conn else {
            return Err(Error::UnsupportedDriver(
                "sqlite driver needs a sqlite connection".into(),
            ));
        };

        let mut schema = Schema::new().with_dialect(Dialect::Sqlite);
        for (name, create_sql) in tables(conn).await? {
            let table = Table {
                columns: columns(conn, &name).await?,
                indexes: indexes(conn, &name).await?,
                foreign_keys: foreign_keys(conn, &name, &create_sql).await?,
                name,
            };
            schema.add_table(table);
        }
        Ok(schema)
    }
}

/// CREATE TABLE with foreign keys declared inline.
fn create_table_sql(driver: &SqliteDriver, table: &Table, name: &str) -> String {
    let mut defs = column_defs(driver, table);
    defs.extend(
        table
            .foreign_keys
            .iter()
            .map(|fk| format!("CONSTRAINT {} {}", fk.name, fk_clause(fk))),
    );
    format!("CREATE TABLE {} ({})", name, defs.join(", "))
}

async fn tables(conn: &mut SqliteConnection) -> Result<Vec<(String, String)>> {
    let rows = sqlx::query(
        "SELECT name, COALESCE(sql, '') AS sql
         FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut tables = Vec::with_capacity(rows.len());
    for row in rows {
        tables.push((row.try_get("name")?, row.try_get("sql")?));
    }
    Ok(tables)
}

async fn columns(conn: &mut SqliteConnection, table: &str) -> Result<Vec<Column>> {
    let rows = sqlx::query(
        "SELECT name, type, \"notnull\" AS not_null, dflt_value, pk
         FROM pragma_table_info(?)
         ORDER BY cid",
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let data_type: String = row.try_get("type")?;
        let not_null: i64 = row.try_get("not_null")?;
        let pk: i64 = row.try_get("pk")?;
        columns.push(Column {
            name: row.try_get("name")?,
            type_metadata: Some(TypeMetadata {
                logical: normalize_type(&data_type),
                raw: data_type.clone(),
                dialect: Dialect::Sqlite,
            }),
            data_type,
            // Primary-key columns are treated as NOT NULL.
            nullable: not_null == 0 && pk == 0,
            is_primary_key: pk > 0,
            default: row.try_get("dflt_value")?,
        });
    }
    Ok(columns)
}

async fn indexes(conn: &mut SqliteConnection, table: &str) -> Result<Vec<Index>> {
    let rows = sqlx::query("SELECT name, \"unique\" AS is_unique, origin FROM pragma_index_list(?)")
        .bind(table)
        .fetch_all(&mut *conn)
        .await?;

    let mut indexes = Vec::new();
    for row in rows {
        let name: String = row.try_get("name")?;
        let origin: String = row.try_get("origin")?;
        // Only explicit CREATE INDEX; "pk" and "u" indexes belong to constraints.
        if origin != "c" || name.starts_with("sqlite_autoindex") {
            continue;
        }
        let unique: i64 = row.try_get("is_unique")?;

        let info = sqlx::query("SELECT name FROM pragma_index_info(?) ORDER BY seqno")
            .bind(&name)
            .fetch_all(&mut *conn)
            .await?;
        let mut columns = Vec::with_capacity(info.len());
        for col in info {
            // Expression columns have no name.
            if let Some(col) = col.try_get::<Option<String>, _>("name")? {
                columns.push(col);
            }
        }

        indexes.push(Index {
            name,
            columns,
            unique: unique == 1,
        });
    }
    indexes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(indexes)
}

async fn foreign_keys(
    conn: &mut SqliteConnection,
    table: &str,
    create_sql: &str,
) -> Result<Vec<ForeignKey>> {
    let rows = sqlx::query(
        "SELECT id, \"table\" AS referenced_table, \"from\" AS from_column,
                \"to\" AS to_column, on_update, on_delete
         FROM pragma_foreign_key_list(?)
         ORDER BY id, seq",
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;

    let declared = declared_fk_names(create_sql);
    let mut fks: Vec<(i64, ForeignKey)> = Vec::new();
    for row in rows {
        let id: i64 = row.try_get("id")?;
        let from: String = row.try_get("from_column")?;
        // `to` is NULL when the reference targets the parent's primary key implicitly.
        let to: Option<String> = row.try_get("to_column")?;
        let to = to.unwrap_or_default();

        match fks.last_mut() {
            Some((last, fk)) if *last == id => {
                fk.columns.push(from);
                fk.referenced_columns.push(to);
            }
            _ => {
                let on_update: String = row.try_get("on_update")?;
                let on_delete: String = row.try_get("on_delete")?;
                fks.push((
                    id,
                    ForeignKey {
                        name: format!("fk_{}_{}", table, id),
                        columns: vec![from],
                        referenced_table: row.try_get("referenced_table")?,
                        referenced_columns: vec![to],
                        on_delete: referential_action(&on_delete),
                        on_update: referential_action(&on_update),
                    },
                ));
            }
        }
    }

    let mut fks: Vec<ForeignKey> = fks
        .into_iter()
        .map(|(_, mut fk)| {
            if let Some(name) = declared.get(&fk.columns.join(",")) {
                fk.name = name.clone();
            }
            fk
        })
        .collect();
    fks.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(fks)
}

/// Names of `CONSTRAINT <name> FOREIGN KEY (...)` clauses keyed by column list.
fn declared_fk_names(create_sql: &str) -> HashMap<String, String> {
    NAMED_FK_RE
        .captures_iter(create_sql)
        .map(|caps| {
            let columns: Vec<&str> = caps[2].split(',').map(|c| c.trim()).collect();
            (columns.join(","), caps[1].to_string())
        })
        .collect()
}
