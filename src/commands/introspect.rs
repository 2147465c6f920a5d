//! Dump a live database schema.

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use colored::*;

use super::{GlobalOpts, connect, table_count};
use crate::diff::diff;
use crate::driver::{Driver, detect_driver};
use crate::planner;
use crate::schema::Schema;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Json,
    Yaml,
    /// DDL that recreates the schema
    Sql,
}

#[derive(Args, Debug, Clone, Default)]
pub struct IntrospectArgs {
    /// Database connection string (overrides environment selection)
    #[arg(long, env = "LOCKPLAN_DATABASE_URL")]
    pub db: Option<String>,

    /// Environment to introspect (defaults to the configured default)
    #[arg(long)]
    pub source_environment: Option<String>,

    /// Use the environment's shadow database
    #[arg(long)]
    pub shadow: bool,

    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

/// Print the schema of a database on stdout.
pub async fn introspect(opts: &GlobalOpts, args: &IntrospectArgs) -> Result<()> {
    let config = &opts.config;
    let environment = args.source_environment.as_deref();
    let url = if args.shadow {
        config
            .resolve_shadow(None, environment)?
            .context("No shadow database configured for this environment")?
    } else {
        config.resolve_target(args.db.as_deref(), environment)?
    };

    eprintln!("{} Introspecting database...", "→".cyan());
    let driver = detect_driver(&url);
    let mut conn = connect(&url, "source").await?;
    let schema = driver.introspect(&mut conn).await?;
    conn.close().await?;
    eprintln!("{} Found {}", "✓".green(), table_count(&schema));

    println!("{}", render(&schema, args.format, driver.as_ref())?);
    Ok(())
}

fn render(schema: &Schema, format: OutputFormat, driver: &dyn Driver) -> Result<String> {
    Ok(match format {
        OutputFormat::Json => serde_json::to_string_pretty(schema)?,
        OutputFormat::Yaml => serde_yaml::to_string(schema)?,
        OutputFormat::Sql => {
            let plan = planner::generate(&diff(&Schema::new(), schema), None, driver)?;
            plan.steps
                .iter()
                .flat_map(|step| step.sql.iter())
                .map(|sql| format!("{};", sql))
                .collect::<Vec<_>>()
                .join("\n\n")
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::PostgresDriver;
    use crate::schema::{Column, Index, Table};

    fn users() -> Schema {
        let mut schema = Schema::new();
        schema.add_table(
            Table::new("users")
                .column(Column::new("id", "integer").primary_key())
                .column(Column::new("email", "text").not_null())
                .index(Index::new("idx_users_email", ["email"]).unique()),
        );
        schema
    }

    #[test]
    fn test_render_sql() {
        let sql = render(&users(), OutputFormat::Sql, &PostgresDriver).unwrap();
        assert!(sql.starts_with("CREATE TABLE users ("));
        assert!(sql.contains("CREATE UNIQUE INDEX idx_users_email ON users"));
        assert!(sql.ends_with(';'));
    }

    #[test]
    fn test_render_json_round_trips() {
        let json = render(&users(), OutputFormat::Json, &PostgresDriver).unwrap();
        let back: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(back, users());
    }
}
