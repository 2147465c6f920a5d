//! Apply a migration plan to the target database.

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use std::path::{Path, PathBuf};

use super::{
    GlobalOpts, ShadowArgs, TargetArgs, confirm, connect, connect_shadow, print_plan, table_count,
};
use crate::diff::diff;
use crate::driver::detect_driver;
use crate::executor::{self, ApplyOptions};
use crate::locks::annotate;
use crate::plan::{ExecutionResult, Plan};
use crate::planner;
use crate::schema::loader::{SQL_EXTENSION, load_schema_or_introspect};

#[derive(Args, Debug, Clone, Default)]
pub struct ApplyArgs {
    /// Plan JSON written by `lockplan plan`
    pub plan: Option<PathBuf>,

    /// Desired schema to plan against the target when no plan file is given
    #[arg(long)]
    pub schema: Option<PathBuf>,

    /// Apply without asking for confirmation
    #[arg(long)]
    pub auto_approve: bool,

    #[command(flatten)]
    pub target: TargetArgs,

    #[command(flatten)]
    pub shadow: ShadowArgs,
}

/// Apply a plan file, or plan and apply `--schema` against the target.
pub async fn apply(opts: &GlobalOpts, args: &ApplyArgs) -> Result<()> {
    let config = &opts.config;
    let target_url = args.target.resolve(config)?;
    let environment = args.target.target_environment.as_deref();
    let driver = detect_driver(&target_url);

    eprintln!("{} Introspecting target database...", "→".cyan());
    let mut target = connect(&target_url, "target").await?;
    let current = driver
        .introspect(&mut target)
        .await
        .context("Failed to introspect target database")?;
    if opts.verbose {
        eprintln!("{} Target schema has {}", "✓".green(), table_count(&current));
    }

    let plan = match args.plan.as_deref() {
        Some(path) => {
            reject_schema_as_plan(path)?;
            if args.schema.is_some() {
                eprintln!(
                    "{} Ignoring --schema: {} already contains the migration steps",
                    "⚠".yellow(),
                    path.display()
                );
            }
            let plan = Plan::load(path)
                .with_context(|| format!("Failed to load migration plan {}", path.display()))?;
            eprintln!(
                "{} Loaded migration plan with {} steps from {}",
                "📋".cyan(),
                plan.steps.len(),
                path.display()
            );
            plan
        }
        None => {
            let schema_path = config
                .resolve_schema_path(args.schema.as_deref(), environment)?
                .or_else(|| Some(PathBuf::from("schema")).filter(|p| p.is_dir()))
                .context("--schema required when no plan file is given (or set schema_path in lockplan.toml)")?;
            eprintln!("{} Loading desired schema from {}", "→".cyan(), schema_path.display());
            let desired = load_schema_or_introspect(&schema_path.display().to_string()).await?;
            let changes = diff(&current, &desired);
            if changes.is_empty() {
                eprintln!(
                    "{}",
                    "✓ No changes detected - database already matches desired schema".green()
                );
                return Ok(());
            }
            let mut plan = planner::generate(&changes, Some(&current), driver.as_ref())?;
            annotate(&mut plan);
            plan
        }
    };

    if plan.is_empty() {
        eprintln!("{}", "✓ Plan has no steps".green());
        return Ok(());
    }

    eprintln!();
    eprintln!("{}", format!("📋 Migration plan ({} steps):", plan.steps.len()).cyan().bold());
    print_plan(&plan);
    eprintln!();

    if !args.auto_approve && !confirm("Apply this migration?")? {
        anyhow::bail!("migration cancelled");
    }

    let shadow_url = args.shadow.resolve(config, environment)?;
    let mut shadow = connect_shadow(shadow_url.as_deref()).await?;

    let apply_opts = ApplyOptions {
        verbose: opts.verbose,
        lock_timeout: opts.lock_timeout(),
    };
    let result = executor::apply(
        &mut target,
        &plan,
        shadow.as_mut(),
        &current,
        driver.as_ref(),
        &apply_opts,
    )
    .await?;

    if let Some(shadow) = shadow {
        shadow.close().await?;
    }
    target.close().await?;

    report(&result, plan.steps.len())
}

/// `.sql` inputs are schemas, not plans.
fn reject_schema_as_plan(path: &Path) -> Result<()> {
    let name = path.to_string_lossy();
    if name.ends_with(".sql") || name.ends_with(SQL_EXTENSION) {
        anyhow::bail!(
            "'{}' appears to be a schema file, not a migration plan. Did you mean --schema {}?",
            name,
            name
        );
    }
    Ok(())
}

pub(crate) fn report(result: &ExecutionResult, total: usize) -> Result<()> {
    if result.success {
        eprintln!(
            "\n{} Applied {}/{} steps successfully",
            "✓".green().bold(),
            result.steps_applied,
            total
        );
        return Ok(());
    }

    eprintln!(
        "\n{} Migration failed after {}/{} steps",
        "✗".red().bold(),
        result.steps_applied,
        total
    );
    for err in &result.errors {
        eprintln!("  {} {}", "✗".red(), err);
    }
    anyhow::bail!("migration failed")
}
