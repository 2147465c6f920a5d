//! Desired-schema sources.
//!
//! A schema can be given as JSON, YAML, a single `.lockplan.sql` file or a
//! directory of them. SQL is executed on a private in-memory SQLite database
//! and read back through the SQLite introspector, so only DDL that SQLite
//! accepts can be used this way.

use std::path::{Path, PathBuf};
use tracing::debug;

use super::{Dialect, Schema};
use crate::db::{Connection, Database, is_connection_string};
use crate::driver::{Driver, SqliteDriver, introspect_url};
use crate::error::{Error, Result};

pub const SQL_EXTENSION: &str = ".lockplan.sql";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFormat {
    Json,
    Yaml,
}

impl SchemaFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_lowercase().as_str() {
            "json" => Some(SchemaFormat::Json),
            "yaml" | "yml" => Some(SchemaFormat::Yaml),
            _ => None,
        }
    }
}

/// Parse a JSON or YAML schema document and check it for consistency.
pub fn parse_schema(content: &str, format: SchemaFormat) -> Result<Schema> {
    let schema: Schema = match format {
        SchemaFormat::Json => serde_json::from_str(content)?,
        SchemaFormat::Yaml => serde_yaml::from_str(content)?,
    };
    schema.ensure_valid()?;
    Ok(schema)
}

/// Load a schema from a file or a directory of SQL files.
pub async fn load_schema(path: &Path) -> Result<Schema> {
    if path.is_dir() {
        let files = sql_files(path)?;
        if files.is_empty() {
            return Err(Error::validation(format!(
                "no *{} files in {}",
                SQL_EXTENSION,
                path.display()
            )));
        }
        let mut sql = String::new();
        for file in &files {
            debug!(file = %file.display(), "reading schema file");
            sql.push_str(&tokio::fs::read_to_string(file).await?);
            sql.push_str(";\n");
        }
        return schema_from_sql(&sql).await;
    }

    if let Some(format) = SchemaFormat::from_path(path) {
        let content = tokio::fs::read_to_string(path).await?;
        return parse_schema(&content, format);
    }

    if path.extension().is_some_and(|ext| ext == "sql") {
        let sql = tokio::fs::read_to_string(path).await?;
        return schema_from_sql(&sql).await;
    }

    Err(Error::validation(format!(
        "unsupported schema file {} (expected .json, .yaml, .yml or {})",
        path.display(),
        SQL_EXTENSION
    )))
}

/// A connection string is introspected; anything else is loaded from disk.
pub async fn load_schema_or_introspect(input: &str) -> Result<Schema> {
    if is_connection_string(input) {
        introspect_url(input).await
    } else {
        load_schema(Path::new(input)).await
    }
}

/// Run DDL on a scratch database and read back the resulting schema.
pub async fn schema_from_sql(sql: &str) -> Result<Schema> {
    let mut conn = Connection::sqlite_memory().await?;
    conn.execute(sql)
        .await
        .map_err(|e| Error::validation(format!("schema SQL failed: {}", e)))?;
    let mut schema = SqliteDriver.introspect(&mut conn).await?;
    conn.close().await?;

    // The SQL describes a desired schema, not a SQLite database.
    schema.dialect = Dialect::Unknown;
    schema.ensure_valid()?;
    Ok(schema)
}

fn sql_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_schema_file = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(SQL_EXTENSION));
        if path.is_file() && is_schema_file {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
