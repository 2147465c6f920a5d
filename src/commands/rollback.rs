//! Rollback plans from a forward plan and its pre-image schema.

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use std::path::PathBuf;

use super::apply::report;
use super::plan::select_driver;
use super::{
    GlobalOpts, ShadowArgs, TargetArgs, confirm, connect, connect_shadow, emit_json, print_plan,
};
use crate::executor::{self, ApplyOptions};
use crate::locks::annotate;
use crate::plan::Plan;
use crate::rollback::rollback as synthesise_rollback;
use crate::schema::loader::load_schema_or_introspect;

#[derive(Args, Debug, Clone, Default)]
pub struct RollbackArgs {
    /// Forward plan JSON
    #[arg(long)]
    pub plan: PathBuf,

    /// Schema before the forward plan ran: file, directory or connection string
    #[arg(long)]
    pub from: Option<String>,

    /// Environment whose database holds the pre-image schema
    #[arg(long)]
    pub from_environment: Option<String>,

    /// Only reverse the first N forward steps (recovery after a partial apply)
    #[arg(long)]
    pub applied_steps: Option<usize>,

    /// Driver to generate SQL for (postgres, sqlite)
    #[arg(long)]
    pub driver: Option<String>,

    /// Execute the rollback against the target instead of printing it
    #[arg(long)]
    pub apply: bool,

    /// Apply without asking for confirmation
    #[arg(long)]
    pub auto_approve: bool,

    /// Write the rollback plan here instead of stdout
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub target: TargetArgs,

    #[command(flatten)]
    pub shadow: ShadowArgs,
}

/// Generate the rollback plan, and run it with `--apply`.
pub async fn rollback(opts: &GlobalOpts, args: &RollbackArgs) -> Result<()> {
    let config = &opts.config;

    let mut forward = Plan::load(&args.plan)
        .with_context(|| format!("Failed to load forward plan {}", args.plan.display()))?;
    if let Some(k) = args.applied_steps {
        forward.steps.truncate(k);
    }

    let from_input = match args.from.as_deref() {
        Some(from) => from.to_string(),
        None => config
            .resolve_target(None, args.from_environment.as_deref())
            .context("No pre-image schema: pass --from or --from-environment")?,
    };
    let before = load_schema_or_introspect(&from_input)
        .await
        .with_context(|| format!("Failed to load pre-image schema from {}", from_input))?;

    let target_url = if args.apply {
        Some(args.target.resolve(config)?)
    } else {
        None
    };
    let driver = select_driver(
        args.driver.as_deref(),
        &from_input,
        target_url.as_deref().unwrap_or(&from_input),
        &before,
        &before,
    )?;

    let mut plan = synthesise_rollback(&forward, &before, driver.as_ref());
    annotate(&mut plan);

    let manual = plan
        .steps
        .iter()
        .filter(|s| s.is_comment_only() && !s.sql.is_empty())
        .count();
    if manual > 0 {
        eprintln!(
            "{} {} step(s) need a manual rollback; see the plan comments",
            "⚠".yellow(),
            manual
        );
    }

    let Some(target_url) = target_url else {
        eprintln!(
            "{} Rollback plan with {} steps for {}",
            "📋".cyan(),
            plan.steps.len(),
            args.plan.display()
        );
        return emit_json(&plan, args.output.as_deref());
    };

    eprintln!("{}", format!("↩ Rollback plan ({} steps):", plan.steps.len()).cyan().bold());
    print_plan(&plan);
    eprintln!();

    if plan.is_empty() {
        eprintln!("{}", "✓ Nothing to roll back".green());
        return Ok(());
    }
    if !args.auto_approve && !confirm("Apply this rollback?")? {
        anyhow::bail!("rollback cancelled");
    }

    let mut target = connect(&target_url, "target").await?;
    let current = driver
        .introspect(&mut target)
        .await
        .context("Failed to introspect target database")?;
    let shadow_url = args
        .shadow
        .resolve(config, args.target.target_environment.as_deref())?;
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
