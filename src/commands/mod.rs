//! `lockplan` subcommands.
//!
//! Submodules:
//! - `plan`: diff two schemas into a lock-annotated plan
//! - `multiphase`: generate a multi-phase workflow plan
//! - `apply`: run a plan against a target, shadow first
//! - `rollback`: reverse a plan and optionally run it
//! - `phase`: apply, roll back and inspect multi-phase workflows
//! - `validate`: check schema and plan files
//! - `introspect`: dump a live schema
//!
//! Human-facing output goes to stderr so plan JSON on stdout can be piped.

mod apply;
mod introspect;
mod multiphase;
mod phase;
mod plan;
mod rollback;
mod validate;

pub use apply::{ApplyArgs, apply};
pub use introspect::{IntrospectArgs, OutputFormat, introspect};
pub use multiphase::{MultiPhaseArgs, plan_multiphase};
pub use phase::{ApplyPhaseArgs, RollbackPhaseArgs, apply_phase, phase_status, rollback_phase};
pub use plan::{PlanArgs, plan};
pub use rollback::{RollbackArgs, rollback};
pub use validate::{ValidateArgs, validate};

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use std::io::{BufRead, Write};
use std::path::Path;

use crate::config::Config;
use crate::db::Connection;
use crate::plan::Plan;
use crate::schema::Schema;

/// Settings shared by every subcommand.
#[derive(Debug, Clone)]
pub struct GlobalOpts {
    pub config: Config,
    pub verbose: bool,
    /// `--lock-timeout` in seconds.
    pub lock_timeout: Option<i64>,
}

impl GlobalOpts {
    pub fn lock_timeout(&self) -> Option<i64> {
        self.config.lock_timeout(self.lock_timeout)
    }
}

/// Target database selection.
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Target database connection string
    #[arg(long, env = "LOCKPLAN_DATABASE_URL")]
    pub target: Option<String>,

    /// Environment in lockplan.toml providing the target connection
    #[arg(long)]
    pub target_environment: Option<String>,
}

/// Shadow database selection.
#[derive(Args, Debug, Clone, Default)]
pub struct ShadowArgs {
    /// Shadow database used for dry runs
    #[arg(long, env = "LOCKPLAN_SHADOW_DATABASE_URL")]
    pub shadow_db: Option<String>,

    /// Environment in lockplan.toml providing the shadow connection
    #[arg(long)]
    pub shadow_db_environment: Option<String>,

    /// Apply without a shadow dry run
    #[arg(long)]
    pub skip_shadow: bool,
}

impl TargetArgs {
    pub fn resolve(&self, config: &Config) -> Result<String> {
        Ok(config.resolve_target(self.target.as_deref(), self.target_environment.as_deref())?)
    }
}

impl ShadowArgs {
    /// Shadow URL unless skipped. The target environment is the fallback.
    pub fn resolve(&self, config: &Config, target_environment: Option<&str>) -> Result<Option<String>> {
        if self.skip_shadow {
            return Ok(None);
        }
        let environment = self.shadow_db_environment.as_deref().or(target_environment);
        Ok(config.resolve_shadow(self.shadow_db.as_deref(), environment)?)
    }
}

pub(crate) async fn connect(url: &str, role: &str) -> Result<Connection> {
    Connection::connect(url)
        .await
        .with_context(|| format!("Failed to connect to {} database", role))
}

/// Open the shadow connection, warning when none is configured.
pub(crate) async fn connect_shadow(url: Option<&str>) -> Result<Option<Connection>> {
    match url {
        Some(url) => {
            let conn = connect(url, "shadow").await?;
            eprintln!("{} Shadow database connected", "✓".green());
            Ok(Some(conn))
        }
        None => {
            eprintln!(
                "{} No shadow database configured; skipping dry run",
                "⚠".yellow()
            );
            Ok(None)
        }
    }
}

/// Ask on stderr; `yes` or `y` proceeds.
pub(crate) fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{} (yes/no): ", prompt);
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "yes" | "y")
}

/// Write JSON to `output`, or stdout when none is given.
pub(crate) fn emit_json<T: serde::Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            std::fs::write(path, json + "\n")
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("{} Wrote {}", "✓".green(), path.display().to_string().cyan());
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// Numbered step listing with lock annotations.
pub(crate) fn print_plan(plan: &Plan) {
    for (i, step) in plan.steps.iter().enumerate() {
        let lock = step
            .lock_mode
            .map(|m| format!(" [{}]", m))
            .unwrap_or_default();
        eprintln!(
            "  {} {}{}",
            format!("[{}/{}]", i + 1, plan.steps.len()).dimmed(),
            step.description,
            lock.yellow()
        );
        for sql in &step.sql {
            eprintln!("      {}", sql.cyan());
        }
    }
}

pub(crate) fn table_count(schema: &Schema) -> String {
    format!("{} tables", schema.tables.len())
}
