//! PostgreSQL driver.

use async_trait::async_trait;
use sqlx::{PgConnection, Row};

use super::{Driver, Feature, column_defs, fk_clause, index_sql, referential_action};
use crate::db::Connection;
use crate::diff::{ColumnChange, ColumnDiff};
use crate::error::{Error, Result};
use crate::plan::PlanStep;
use crate::schema::{
    Column, Dialect, ForeignKey, Index, Schema, Table, TypeMetadata, normalize_type,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

#[async_trait]
impl Driver for PostgresDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn supports_feature(&self, feature: Feature) -> bool {
        match feature {
            Feature::Cascade
            | Feature::AlterColumnType
            | Feature::AlterColumnNullable
            | Feature::AlterColumnDefault
            | Feature::AlterAddForeignKey
            | Feature::ForeignKeys
            | Feature::DropColumn
            | Feature::TransactionalDdl
            | Feature::ConcurrentIndex
            | Feature::NotValidConstraint
            | Feature::LockTimeout => true,
        }
    }

    fn format_column(&self, col: &Column) -> String {
        let mut def = format!("{} {}", col.name, col.data_type);
        if !col.nullable {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = &col.default {
            def.push_str(&format!(" DEFAULT {}", default));
        }
        if col.is_primary_key {
            def.push_str(" PRIMARY KEY");
        }
        def
    }

    fn create_table(&self, table: &Table) -> PlanStep {
        let columns = column_defs(self, table);
        PlanStep::new(
            format!("Create table {}", table.name),
            [format!("CREATE TABLE {} ({})", table.name, columns.join(", "))],
        )
    }

    fn drop_table(&self, table: &Table) -> PlanStep {
        PlanStep::new(
            format!("Drop table {}", table.name),
            [format!("DROP TABLE {} CASCADE", table.name)],
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
        let column = &diff.column_name;
        let mut steps = Vec::new();

        if diff.has(ColumnChange::Type) {
            steps.push(PlanStep::new(
                format!(
                    "Change type of {}.{} from {} to {}",
                    table, column, diff.old.data_type, diff.new.data_type
                ),
                [format!(
                    "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
                    table, column, diff.new.data_type
                )],
            ));
        }

        if diff.has(ColumnChange::Nullable) {
            let action = if diff.new.nullable { "DROP NOT NULL" } else { "SET NOT NULL" };
            steps.push(PlanStep::new(
                format!("Change nullability of {}.{} to {}", table, column, diff.new.nullable),
                [format!("ALTER TABLE {} ALTER COLUMN {} {}", table, column, action)],
            ));
        }

        if diff.has(ColumnChange::Default) {
            let sql = match &diff.new.default {
                Some(default) => format!(
                    "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                    table, column, default
                ),
                None => format!("ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT", table, column),
            };
            steps.push(PlanStep::new(
                format!("Change default of {}.{}", table, column),
                [sql],
            ));
        }

        if diff.has(ColumnChange::PrimaryKey) {
            let sql = if diff.new.is_primary_key {
                format!("ALTER TABLE {} ADD PRIMARY KEY ({})", table, column)
            } else {
                format!("ALTER TABLE {} DROP CONSTRAINT {}_pkey", table, table)
            };
            steps.push(PlanStep::new(
                format!("Change primary key of {}.{}", table, column),
                [sql],
            ));
        }

        steps
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
        PlanStep::new(
            format!("Add foreign key {} to table {}", fk.name, table),
            [format!(
                "ALTER TABLE {} ADD CONSTRAINT {} {}",
                table,
                fk.name,
                fk_clause(fk)
            )],
        )
    }

    fn drop_foreign_key(&self, table: &str, fk: &ForeignKey) -> PlanStep {
        PlanStep::new(
            format!("Drop foreign key {} from table {}", fk.name, table),
            [format!("ALTER TABLE {} DROP CONSTRAINT {}", table, fk.name)],
        )
    }

    async fn introspect(&self, conn: &mut Connection) -> Result<Schema> {
        let Connection::Postgres(conn) = conn else {
            return Err(Error::UnsupportedDriver(
                "postgres driver needs a postgres connection".into(),
            ));
        };

        let mut schema = Schema::new().with_dialect(Dialect::Postgres);
        for name in tables(conn).await? {
            let table = Table {
                columns: columns(conn, &name).await?,
                indexes: indexes(conn, &name).await?,
                foreign_keys: foreign_keys(conn, &name).await?,
                name,
            };
            schema.add_table(table);
        }
        Ok(schema)
    }
}

async fn tables(conn: &mut PgConnection) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT table_name::text AS table_name
         FROM information_schema.tables
         WHERE table_schema = current_schema()
           AND table_type = 'BASE TABLE'
         ORDER BY table_name",
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| row.try_get::<String, _>("table_name").map_err(Error::from))
        .collect()
}

async fn columns(conn: &mut PgConnection, table: &str) -> Result<Vec<Column>> {
    let rows = sqlx::query(
        "SELECT a.attname::text AS column_name,
                format_type(a.atttypid, a.atttypmod) AS data_type,
                NOT a.attnotnull AS nullable,
                pg_get_expr(d.adbin, d.adrelid) AS column_default,
                EXISTS (
                    SELECT 1 FROM pg_index i
                    WHERE i.indrelid = a.attrelid
                      AND i.indisprimary
                      AND a.attnum = ANY(i.indkey::int2[])
                ) AS is_primary_key
         FROM pg_attribute a
         JOIN pg_class c ON c.oid = a.attrelid
         JOIN pg_namespace n ON n.oid = c.relnamespace
         LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
         WHERE n.nspname = current_schema()
           AND c.relname = $1
           AND a.attnum > 0
           AND NOT a.attisdropped
         ORDER BY a.attnum",
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get("column_name")?;
        let data_type: String = row.try_get("data_type")?;
        let nullable: bool = row.try_get("nullable")?;
        let default: Option<String> = row.try_get("column_default")?;
        let is_primary_key: bool = row.try_get("is_primary_key")?;

        let serial = default.as_deref().is_some_and(is_serial_default);
        let data_type = match data_type.as_str() {
            "integer" if serial => "serial".to_string(),
            "bigint" if serial => "bigserial".to_string(),
            _ => data_type,
        };
        let default = match default {
            Some(_) if matches!(data_type.as_str(), "serial" | "bigserial") => None,
            Some(value) => Some(normalize_default(&value)),
            None => None,
        };

        columns.push(Column {
            type_metadata: Some(TypeMetadata {
                logical: normalize_type(&data_type),
                raw: data_type.clone(),
                dialect: Dialect::Postgres,
            }),
            name,
            data_type,
            nullable,
            is_primary_key,
            default,
        });
    }
    Ok(columns)
}

async fn indexes(conn: &mut PgConnection, table: &str) -> Result<Vec<Index>> {
    // Indexes backing PRIMARY KEY and UNIQUE constraints belong to the constraint.
    let rows = sqlx::query(
        "SELECT ic.relname::text AS index_name,
                ix.indisunique AS is_unique,
                array_agg(a.attname::text ORDER BY k.ord) AS columns
         FROM pg_index ix
         JOIN pg_class t ON t.oid = ix.indrelid
         JOIN pg_class ic ON ic.oid = ix.indexrelid
         JOIN pg_namespace n ON n.oid = t.relnamespace
         CROSS JOIN LATERAL unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
         JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
         WHERE n.nspname = current_schema()
           AND t.relname = $1
           AND NOT ix.indisprimary
           AND NOT EXISTS (
               SELECT 1 FROM pg_constraint con
               WHERE con.conindid = ix.indexrelid
                 AND con.contype IN ('p', 'u')
           )
         GROUP BY ic.relname, ix.indisunique
         ORDER BY ic.relname",
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;

    let mut indexes = Vec::with_capacity(rows.len());
    for row in rows {
        indexes.push(Index {
            name: row.try_get("index_name")?,
            columns: row.try_get("columns")?,
            unique: row.try_get("is_unique")?,
        });
    }
    Ok(indexes)
}

async fn foreign_keys(conn: &mut PgConnection, table: &str) -> Result<Vec<ForeignKey>> {
    let rows = sqlx::query(
        "SELECT con.conname::text AS constraint_name,
                a.attname::text AS column_name,
                rt.relname::text AS referenced_table,
                ra.attname::text AS referenced_column,
                CASE con.confupdtype
                    WHEN 'r' THEN 'RESTRICT' WHEN 'c' THEN 'CASCADE'
                    WHEN 'n' THEN 'SET NULL' WHEN 'd' THEN 'SET DEFAULT'
                    ELSE 'NO ACTION' END AS update_rule,
                CASE con.confdeltype
                    WHEN 'r' THEN 'RESTRICT' WHEN 'c' THEN 'CASCADE'
                    WHEN 'n' THEN 'SET NULL' WHEN 'd' THEN 'SET DEFAULT'
                    ELSE 'NO ACTION' END AS delete_rule
         FROM pg_constraint con
         JOIN pg_class t ON t.oid = con.conrelid
         JOIN pg_namespace n ON n.oid = t.relnamespace
         JOIN pg_class rt ON rt.oid = con.confrelid
         CROSS JOIN LATERAL unnest(con.conkey, con.confkey) WITH ORDINALITY AS k(attnum, refnum, ord)
         JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
         JOIN pg_attribute ra ON ra.attrelid = con.confrelid AND ra.attnum = k.refnum
         WHERE con.contype = 'f'
           AND n.nspname = current_schema()
           AND t.relname = $1
         ORDER BY con.conname, k.ord",
    )
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;

    let mut fks: Vec<ForeignKey> = Vec::new();
    for row in rows {
        let name: String = row.try_get("constraint_name")?;
        let column: String = row.try_get("column_name")?;
        let referenced_column: String = row.try_get("referenced_column")?;

        // Rows arrive grouped by constraint name.
        match fks.last_mut() {
            Some(fk) if fk.name == name => {
                fk.columns.push(column);
                fk.referenced_columns.push(referenced_column);
            }
            _ => {
                let update_rule: String = row.try_get("update_rule")?;
                let delete_rule: String = row.try_get("delete_rule")?;
                fks.push(ForeignKey {
                    name,
                    columns: vec![column],
                    referenced_table: row.try_get("referenced_table")?,
                    referenced_columns: vec![referenced_column],
                    on_delete: referential_action(&delete_rule),
                    on_update: referential_action(&update_rule),
                });
            }
        }
    }
    Ok(fks)
}

/// `nextval('..._seq'::regclass)` marks a SERIAL column.
fn is_serial_default(default: &str) -> bool {
    default.starts_with("nextval(") && default.contains("_seq")
}

/// Drop a trailing `::type` cast when it sits outside any string literal.
pub(crate) fn normalize_default(default: &str) -> String {
    if let Some(pos) = default.rfind("::") {
        let before = &default[..pos];
        if pos > 0 && before.matches('\'').count() % 2 == 0 {
            return before.to_string();
        }
    }
    default.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn users() -> Table {
        Table::new("users")
            .column(Column::new("id", "integer").primary_key())
            .column(Column::new("email", "text").not_null())
    }

    #[test]
    fn test_create_table() {
        let step = PostgresDriver.create_table(&users());
        assert_eq!(step.description, "Create table users");
        assert_eq!(
            step.sql,
            vec!["CREATE TABLE users (id integer NOT NULL PRIMARY KEY, email text NOT NULL)"]
        );
    }

    #[test]
    fn test_format_column_with_default() {
        let col = Column::new("status", "text").not_null().default("'active'");
        assert_eq!(
            PostgresDriver.format_column(&col),
            "status text NOT NULL DEFAULT 'active'"
        );
    }

    #[test]
    fn test_drop_table_cascades() {
        assert_eq!(PostgresDriver.drop_table(&users()).sql, vec!["DROP TABLE users CASCADE"]);
    }

    #[test]
    fn test_column_statements() {
        let col = Column::new("age", "integer");
        assert_eq!(
            PostgresDriver.add_column("users", &col).sql,
            vec!["ALTER TABLE users ADD COLUMN age integer"]
        );
        let drop = PostgresDriver.drop_column("users", &col);
        assert_eq!(drop.description, "Drop column age from table users");
        assert_eq!(drop.sql, vec!["ALTER TABLE users DROP COLUMN age"]);
    }

    #[test]
    fn test_modify_column_splits_changes() {
        let diff = ColumnDiff {
            column_name: "age".into(),
            old: Column::new("age", "integer"),
            new: Column::new("age", "bigint").not_null().default("0"),
            changes: vec![ColumnChange::Type, ColumnChange::Nullable, ColumnChange::Default],
        };
        let steps = PostgresDriver.modify_column("users", &diff);
        let sql: Vec<_> = steps.iter().map(|s| s.sql[0].as_str()).collect();
        assert_eq!(
            sql,
            vec![
                "ALTER TABLE users ALTER COLUMN age TYPE bigint",
                "ALTER TABLE users ALTER COLUMN age SET NOT NULL",
                "ALTER TABLE users ALTER COLUMN age SET DEFAULT 0",
            ]
        );
        assert_eq!(steps[0].description, "Change type of users.age from integer to bigint");
        assert_eq!(steps[1].description, "Change nullability of users.age to false");
    }

    #[test]
    fn test_drop_default() {
        let diff = ColumnDiff {
            column_name: "age".into(),
            old: Column::new("age", "integer").default("0"),
            new: Column::new("age", "integer"),
            changes: vec![ColumnChange::Default],
        };
        let steps = PostgresDriver.modify_column("users", &diff);
        assert_eq!(steps[0].sql, vec!["ALTER TABLE users ALTER COLUMN age DROP DEFAULT"]);
    }

    #[test]
    fn test_index_statements() {
        let idx = Index::new("idx_users_email", ["email"]).unique();
        assert_eq!(
            PostgresDriver.add_index("users", &idx).sql,
            vec!["CREATE UNIQUE INDEX idx_users_email ON users (email)"]
        );
        assert_eq!(
            PostgresDriver.drop_index("users", &idx).sql,
            vec!["DROP INDEX idx_users_email"]
        );
    }

    #[test]
    fn test_foreign_key_statements() {
        let fk = ForeignKey::new("fk_posts_user", ["user_id"], "users", ["id"])
            .on_delete("CASCADE")
            .on_update("RESTRICT");
        assert_eq!(
            PostgresDriver.add_foreign_key("posts", &fk).sql,
            vec![
                "ALTER TABLE posts ADD CONSTRAINT fk_posts_user FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE ON UPDATE RESTRICT"
            ]
        );
        assert_eq!(
            PostgresDriver.drop_foreign_key("posts", &fk).sql,
            vec!["ALTER TABLE posts DROP CONSTRAINT fk_posts_user"]
        );
    }

    #[test]
    fn test_normalize_default() {
        assert_eq!(normalize_default("'active'::character varying"), "'active'");
        assert_eq!(normalize_default("'{}'::jsonb"), "'{}'");
        assert_eq!(normalize_default("now()"), "now()");
        assert_eq!(normalize_default("'a::b'"), "'a::b'");
        assert!(is_serial_default("nextval('users_id_seq'::regclass)"));
        assert!(!is_serial_default("0"));
    }
}
