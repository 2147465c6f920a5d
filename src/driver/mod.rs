//! Dialect drivers.
//!
//! A [`Driver`] emits DDL for one engine, advertises which operations that
//! engine supports, and reads a live schema back from its catalog. The
//! planner, rollback synthesiser and executor only ever see this trait.

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresDriver;
pub use sqlite::SqliteDriver;

use async_trait::async_trait;

use crate::db::Connection;
use crate::diff::ColumnDiff;
use crate::error::{Error, Result};
use crate::plan::PlanStep;
use crate::schema::{Column, Dialect, ForeignKey, Index, Schema, Table};

/// Optional engine capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// `DROP TABLE ... CASCADE`
    Cascade,
    AlterColumnType,
    AlterColumnNullable,
    AlterColumnDefault,
    /// `ALTER TABLE ... ADD CONSTRAINT ... FOREIGN KEY`
    AlterAddForeignKey,
    ForeignKeys,
    DropColumn,
    /// DDL can be rolled back as part of a transaction.
    TransactionalDdl,
    /// `CREATE INDEX CONCURRENTLY`
    ConcurrentIndex,
    /// `ADD CONSTRAINT ... NOT VALID`
    NotValidConstraint,
    /// `SET lock_timeout`
    LockTimeout,
}

#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    fn dialect(&self) -> Dialect;

    fn supports_feature(&self, feature: Feature) -> bool;

    /// `name type [constraints]` as used in CREATE TABLE and ADD COLUMN.
    fn format_column(&self, col: &Column) -> String;

    fn create_table(&self, table: &Table) -> PlanStep;

    fn drop_table(&self, table: &Table) -> PlanStep;

    fn add_column(&self, table: &str, col: &Column) -> PlanStep;

    fn drop_column(&self, table: &str, col: &Column) -> PlanStep;

    /// One step per changed attribute where the engine allows it.
    fn modify_column(&self, table: &str, diff: &ColumnDiff) -> Vec<PlanStep>;

    fn add_index(&self, table: &str, idx: &Index) -> PlanStep;

    fn drop_index(&self, table: &str, idx: &Index) -> PlanStep;

    fn add_foreign_key(&self, table: &str, fk: &ForeignKey) -> PlanStep;

    fn drop_foreign_key(&self, table: &str, fk: &ForeignKey) -> PlanStep;

    /// Rebuild a table as `target`, copying `copy_columns` across.
    ///
    /// Only engines without in-place ALTER support need this.
    fn recreate_table(&self, _target: &Table, _copy_columns: &[String]) -> Option<PlanStep> {
        None
    }

    /// Statements bracketing a plan that rebuilds tables, run outside any
    /// transaction: the first before `BEGIN`, the second once it has ended.
    fn table_rebuild_guard(&self) -> Option<[&'static str; 2]> {
        None
    }

    /// Read the live schema.
    async fn introspect(&self, conn: &mut Connection) -> Result<Schema>;
}

/// Driver for a dialect.
pub fn driver_for(dialect: Dialect) -> Result<Box<dyn Driver>> {
    match dialect {
        Dialect::Postgres => Ok(Box::new(PostgresDriver)),
        Dialect::Sqlite => Ok(Box::new(SqliteDriver)),
        Dialect::Unknown => Err(Error::UnsupportedDriver("unknown dialect".into())),
    }
}

/// Driver named by a CLI or config value.
pub fn driver_by_name(name: &str) -> Result<Box<dyn Driver>> {
    match name.to_lowercase().as_str() {
        "postgres" | "postgresql" | "pg" => Ok(Box::new(PostgresDriver)),
        "sqlite" | "sqlite3" | "libsql" => Ok(Box::new(SqliteDriver)),
        other => Err(Error::UnsupportedDriver(other.to_string())),
    }
}

/// Driver implied by a connection string.
pub fn detect_driver(conn: &str) -> Box<dyn Driver> {
    match Dialect::from_connection_string(conn) {
        Dialect::Sqlite => Box::new(SqliteDriver),
        _ => Box::new(PostgresDriver),
    }
}

/// Connect and introspect in one go.
pub async fn introspect_url(url: &str) -> Result<Schema> {
    let driver = detect_driver(url);
    let mut conn = Connection::connect(url).await?;
    let schema = driver.introspect(&mut conn).await?;
    conn.close().await?;
    Ok(schema)
}

/// Column definitions for a CREATE TABLE body.
///
/// A composite primary key is emitted as a table constraint rather than
/// inline on each column.
pub(crate) fn column_defs(driver: &dyn Driver, table: &Table) -> Vec<String> {
    let pk: Vec<&str> = table
        .columns
        .iter()
        .filter(|c| c.is_primary_key)
        .map(|c| c.name.as_str())
        .collect();
    if pk.len() <= 1 {
        return table.columns.iter().map(|c| driver.format_column(c)).collect();
    }

    let mut defs: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            let mut col = c.clone();
            col.is_primary_key = false;
            driver.format_column(&col)
        })
        .collect();
    defs.push(format!("PRIMARY KEY ({})", pk.join(", ")));
    defs
}

pub(crate) fn fk_clause(fk: &ForeignKey) -> String {
    let mut sql = format!(
        "FOREIGN KEY ({}) REFERENCES {} ({})",
        fk.columns.join(", "),
        fk.referenced_table,
        fk.referenced_columns.join(", ")
    );
    if let Some(action) = &fk.on_delete {
        sql.push_str(&format!(" ON DELETE {}", action));
    }
    if let Some(action) = &fk.on_update {
        sql.push_str(&format!(" ON UPDATE {}", action));
    }
    sql
}

pub(crate) fn index_sql(table: &str, idx: &Index) -> String {
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        if idx.unique { "UNIQUE " } else { "" },
        idx.name,
        table,
        idx.columns.join(", ")
    )
}

/// Referential actions are reported in upper case; NO ACTION is the default and omitted.
pub(crate) fn referential_action(rule: &str) -> Option<String> {
    let rule = rule.trim().to_uppercase();
    if rule.is_empty() || rule == "NO ACTION" {
        None
    } else {
        Some(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_driver() {
        assert_eq!(detect_driver("postgres://localhost/db").name(), "postgres");
        assert_eq!(detect_driver("sqlite://app.db").name(), "sqlite");
        assert_eq!(detect_driver("libsql://db.turso.io").name(), "sqlite");
        assert_eq!(detect_driver("whatever").name(), "postgres");
    }

    #[test]
    fn test_driver_by_name() {
        assert_eq!(driver_by_name("PostgreSQL").unwrap().dialect(), Dialect::Postgres);
        assert_eq!(driver_by_name("sqlite3").unwrap().dialect(), Dialect::Sqlite);
        assert!(matches!(driver_by_name("mysql"), Err(Error::UnsupportedDriver(_))));
        assert!(driver_for(Dialect::Unknown).is_err());
    }

    #[test]
    fn test_composite_primary_key() {
        let table = Table::new("memberships")
            .column(Column::new("user_id", "integer").primary_key())
            .column(Column::new("team_id", "integer").primary_key());
        assert_eq!(
            column_defs(&PostgresDriver, &table),
            vec![
                "user_id integer NOT NULL",
                "team_id integer NOT NULL",
                "PRIMARY KEY (user_id, team_id)",
            ]
        );
    }

    #[test]
    fn test_fk_clause() {
        let fk = ForeignKey::new("fk", ["user_id"], "users", ["id"]).on_delete("CASCADE");
        assert_eq!(
            fk_clause(&fk),
            "FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE"
        );
    }

    #[test]
    fn test_referential_action() {
        assert_eq!(referential_action("NO ACTION"), None);
        assert_eq!(referential_action("cascade"), Some("CASCADE".into()));
    }
}
