//! Database connections.
//!
//! The executor and the shadow measurer only need to run raw statements and
//! control transactions, so they talk to a [`Database`]. [`Connection`] is the
//! sqlx-backed implementation used by the CLI; introspection needs the
//! concrete connection to run catalog queries.

use async_trait::async_trait;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection as _, Executor, PgConnection, Row, SqliteConnection};
use std::str::FromStr;
use tracing::debug;

use crate::error::{Error, Result};
use crate::schema::Dialect;

/// Minimal statement-level access to a database.
#[async_trait]
pub trait Database: Send {
    /// Execute one or more statements without bind parameters.
    async fn execute(&mut self, sql: &str) -> Result<()>;

    async fn begin(&mut self) -> Result<()> {
        self.execute("BEGIN").await
    }

    async fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK").await
    }

    /// Rows whose foreign keys point at missing parents, one line each.
    /// Engines that enforce foreign keys on every statement report none.
    async fn foreign_key_violations(&mut self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// A live connection to a supported engine.
pub enum Connection {
    Postgres(PgConnection),
    Sqlite(SqliteConnection),
}

impl Connection {
    /// Open a connection, picking the engine from the connection string.
    pub async fn connect(url: &str) -> Result<Self> {
        match Dialect::from_connection_string(url) {
            Dialect::Postgres => {
                debug!("connecting to postgres");
                Ok(Connection::Postgres(PgConnection::connect(url).await?))
            }
            Dialect::Sqlite => {
                if url.starts_with("libsql://") {
                    return Err(Error::UnsupportedDriver(
                        "libsql:// remote databases cannot be opened directly; use a local sqlite file".into(),
                    ));
                }
                let options = SqliteConnectOptions::from_str(sqlite_path(url))?
                    .create_if_missing(true)
                    .foreign_keys(true);
                debug!(path = sqlite_path(url), "connecting to sqlite");
                Ok(Connection::Sqlite(options.connect().await?))
            }
            Dialect::Unknown => Err(Error::UnsupportedDriver(url.to_string())),
        }
    }

    /// Fresh private in-memory SQLite database.
    pub async fn sqlite_memory() -> Result<Self> {
        let conn = SqliteConnectOptions::from_str(":memory:")?
            .foreign_keys(true)
            .connect()
            .await?;
        Ok(Connection::Sqlite(conn))
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            Connection::Postgres(_) => Dialect::Postgres,
            Connection::Sqlite(_) => Dialect::Sqlite,
        }
    }

    pub async fn close(self) -> Result<()> {
        match self {
            Connection::Postgres(conn) => conn.close().await?,
            Connection::Sqlite(conn) => conn.close().await?,
        }
        Ok(())
    }
}

#[async_trait]
impl Database for Connection {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        debug!(sql, "execute");
        match self {
            Connection::Postgres(conn) => {
                conn.execute(sql).await?;
            }
            Connection::Sqlite(conn) => {
                conn.execute(sql).await?;
            }
        }
        Ok(())
    }

    async fn foreign_key_violations(&mut self) -> Result<Vec<String>> {
        let Connection::Sqlite(conn) = self else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query("PRAGMA foreign_key_check")
            .fetch_all(&mut *conn)
            .await?;
        rows.iter()
            .map(|row| {
                let table: String = row.try_get(0)?;
                let rowid: Option<i64> = row.try_get(1)?;
                let parent: String = row.try_get(2)?;
                Ok(match rowid {
                    Some(id) => format!("{} row {} references a missing {} row", table, id, parent),
                    None => format!("{} references a missing {} row", table, parent),
                })
            })
            .collect()
    }
}

impl Dialect {
    /// Engine implied by a connection string. Unrecognised strings are PostgreSQL.
    pub fn from_connection_string(conn: &str) -> Dialect {
        let lower = conn.trim().to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            return Dialect::Postgres;
        }
        if lower.starts_with("libsql://")
            || lower.starts_with("sqlite:")
            || lower.starts_with("file:")
            || lower == ":memory:"
            || lower.ends_with(".db")
            || lower.ends_with(".sqlite")
            || lower.ends_with(".sqlite3")
        {
            return Dialect::Sqlite;
        }
        Dialect::Postgres
    }
}

/// True for strings that name a database rather than a schema file.
pub fn is_connection_string(input: &str) -> bool {
    let lower = input.trim().to_lowercase();
    ["postgres://", "postgresql://", "libsql://", "sqlite:", "file:"]
        .iter()
        .any(|prefix| lower.starts_with(prefix))
        || [".db", ".sqlite", ".sqlite3"]
            .iter()
            .any(|suffix| lower.ends_with(suffix))
        || lower == ":memory:"
}

fn sqlite_path(url: &str) -> &str {
    url.strip_prefix("file:").unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_from_connection_string() {
        assert_eq!(
            Dialect::from_connection_string("postgres://u@localhost/db"),
            Dialect::Postgres
        );
        assert_eq!(
            Dialect::from_connection_string("postgresql://u@localhost/db"),
            Dialect::Postgres
        );
        assert_eq!(Dialect::from_connection_string("sqlite://app.db"), Dialect::Sqlite);
        assert_eq!(Dialect::from_connection_string("sqlite::memory:"), Dialect::Sqlite);
        assert_eq!(Dialect::from_connection_string("file:test.db"), Dialect::Sqlite);
        assert_eq!(Dialect::from_connection_string("./data/app.sqlite3"), Dialect::Sqlite);
        assert_eq!(Dialect::from_connection_string("libsql://db.turso.io"), Dialect::Sqlite);
        assert_eq!(Dialect::from_connection_string(":memory:"), Dialect::Sqlite);
        assert_eq!(Dialect::from_connection_string("host=localhost"), Dialect::Postgres);
    }

    #[test]
    fn test_is_connection_string() {
        assert!(is_connection_string("postgres://localhost/db"));
        assert!(is_connection_string("sqlite://app.db"));
        assert!(is_connection_string("./data/app.sqlite3"));
        assert!(!is_connection_string("schema/"));
        assert!(!is_connection_string("schema.json"));
    }

    #[tokio::test]
    async fn test_sqlite_transaction_control() {
        let mut conn = Connection::sqlite_memory().await.unwrap();
        conn.execute("CREATE TABLE t (id integer)").await.unwrap();
        conn.begin().await.unwrap();
        conn.execute("INSERT INTO t (id) VALUES (1)").await.unwrap();
        conn.rollback().await.unwrap();

        if let Connection::Sqlite(inner) = &mut conn {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t")
                .fetch_one(&mut *inner)
                .await
                .unwrap();
            assert_eq!(count, 0);
        }
    }

    #[tokio::test]
    async fn test_sqlite_foreign_key_violations() {
        let mut conn = Connection::sqlite_memory().await.unwrap();
        conn.execute("CREATE TABLE users (id integer PRIMARY KEY)").await.unwrap();
        conn.execute("CREATE TABLE posts (id integer PRIMARY KEY, user_id integer REFERENCES users (id))")
            .await
            .unwrap();
        assert!(conn.foreign_key_violations().await.unwrap().is_empty());

        conn.execute("PRAGMA foreign_keys = OFF").await.unwrap();
        conn.execute("INSERT INTO posts (id, user_id) VALUES (7, 42)").await.unwrap();

        assert_eq!(
            conn.foreign_key_violations().await.unwrap(),
            vec!["posts row 7 references a missing users row"]
        );
    }
}
