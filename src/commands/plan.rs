//! Migration plan from two schemas.

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use std::path::{Path, PathBuf};

use super::{GlobalOpts, ShadowArgs, connect, emit_json, print_plan, table_count};
use crate::db::is_connection_string;
use crate::diff::diff;
use crate::driver::{Driver, Feature, PostgresDriver, detect_driver, driver_by_name, driver_for};
use crate::executor::prepare_shadow;
use crate::locks::{LockImpact, SaferRewrite, analyze, annotate, measure_step_impact, synthesise};
use crate::plan::Plan;
use crate::planner;
use crate::schema::Schema;
use crate::schema::loader::load_schema_or_introspect;

#[derive(Args, Debug, Clone, Default)]
pub struct PlanArgs {
    /// Current schema: file, directory or connection string
    #[arg(long)]
    pub from: Option<String>,

    /// Environment whose database is the current schema
    #[arg(long)]
    pub from_environment: Option<String>,

    /// Desired schema: file, directory or connection string
    #[arg(long)]
    pub to: Option<String>,

    /// Environment whose schema path is the desired schema
    #[arg(long)]
    pub to_environment: Option<String>,

    /// Driver to generate SQL for (postgres, sqlite)
    #[arg(long)]
    pub driver: Option<String>,

    /// Replace blocking steps with their safer rewrites
    #[arg(long)]
    pub rewrite: bool,

    /// Write the plan here instead of stdout
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub shadow: ShadowArgs,
}

/// Diff `--from` against `--to` and emit a lock-annotated plan.
pub async fn plan(opts: &GlobalOpts, args: &PlanArgs) -> Result<()> {
    let config = &opts.config;

    let from_input = match args.from.as_deref() {
        Some(from) => from.to_string(),
        None => config
            .resolve_target(None, args.from_environment.as_deref())
            .context("No current schema: pass --from or configure an environment")?,
    };
    let to_input = match args.to.as_deref() {
        Some(to) => to.to_string(),
        None => default_desired_schema(opts, args.to_environment.as_deref())?,
    };

    eprintln!("{}", "📋 Migration Plan".cyan().bold());
    eprintln!("  {} → {}", from_input.yellow(), to_input.yellow());
    eprintln!();

    let before = load_schema_or_introspect(&from_input)
        .await
        .with_context(|| format!("Failed to load current schema from {}", from_input))?;
    if opts.verbose {
        eprintln!("{} Loaded current schema ({})", "✓".green(), table_count(&before));
    }
    let after = load_schema_or_introspect(&to_input)
        .await
        .with_context(|| format!("Failed to load desired schema from {}", to_input))?;
    if opts.verbose {
        eprintln!("{} Loaded desired schema ({})", "✓".green(), table_count(&after));
    }

    let driver = select_driver(args.driver.as_deref(), &from_input, &to_input, &before, &after)?;
    let changes = diff(&before, &after);
    let mut plan = planner::generate(&changes, Some(&before), driver.as_ref())?;
    annotate(&mut plan);

    if plan.is_empty() {
        eprintln!("{}", "✓ No migrations needed - schemas are identical".green());
        return emit_json(&plan, args.output.as_deref());
    }

    let shadow_url = args.shadow.resolve(config, args.from_environment.as_deref())?;
    let impacts = match shadow_url.as_deref() {
        Some(url) => {
            let mut shadow = connect(url, "shadow").await?;
            eprintln!("{} Measuring lock impact on shadow database", "→".cyan());
            prepare_shadow(&mut shadow, &before, driver.as_ref())
                .await
                .context("Failed to prepare shadow database")?;
            let mut impacts = Vec::with_capacity(plan.steps.len());
            for step in &plan.steps {
                impacts.push(measure_step_impact(&mut shadow, step).await);
            }
            shadow.close().await?;
            impacts
        }
        None => plan.steps.iter().map(analyze).collect(),
    };

    print_plan(&plan);
    eprintln!();
    report_locks(&plan, &impacts);

    if args.rewrite {
        let rewritten = apply_rewrites(&mut plan, &impacts, driver.as_ref());
        if rewritten > 0 {
            annotate(&mut plan);
            eprintln!(
                "{} Rewrote {} step(s) to lock-friendly equivalents",
                "✓".green(),
                rewritten
            );
        }
    }

    emit_json(&plan, args.output.as_deref())
}

/// Configured schema path, then `./schema`.
fn default_desired_schema(opts: &GlobalOpts, environment: Option<&str>) -> Result<String> {
    if let Some(path) = opts.config.resolve_schema_path(None, environment)? {
        return Ok(path.display().to_string());
    }
    let local = Path::new("schema");
    if local.is_dir() {
        if opts.verbose {
            eprintln!("{} Auto-detected schema directory: schema/", "ℹ".cyan());
        }
        return Ok("schema".to_string());
    }
    anyhow::bail!("No desired schema: pass --to, set schema_path in lockplan.toml or create ./schema")
}

/// Explicit name, then a known schema dialect, then the connection strings.
pub(super) fn select_driver(
    explicit: Option<&str>,
    from: &str,
    to: &str,
    before: &Schema,
    after: &Schema,
) -> Result<Box<dyn Driver>> {
    if let Some(name) = explicit {
        return Ok(driver_by_name(name)?);
    }
    for schema in [after, before] {
        if !schema.dialect.is_unknown() {
            return Ok(driver_for(schema.dialect)?);
        }
    }
    for input in [to, from] {
        if is_connection_string(input) {
            return Ok(detect_driver(input));
        }
    }
    Ok(Box::new(PostgresDriver))
}

fn report_locks(plan: &Plan, impacts: &[LockImpact]) {
    let mut flagged = 0;
    for (step, impact) in plan.steps.iter().zip(impacts) {
        if !impact.requires_safer_alternative() {
            continue;
        }
        flagged += 1;

        let timing = impact
            .estimated_duration_ms
            .map(|ms| format!(", ~{}ms on shadow", ms))
            .unwrap_or_default();
        eprintln!(
            "{} {} ({} impact, {}{})",
            "⚠".yellow(),
            step.description.bold(),
            impact.impact,
            impact.lock_mode,
            timing
        );
        eprintln!("    {}", impact.explanation);

        if let Some(alt) = synthesise(step) {
            print_rewrite(&alt);
        }
    }

    if flagged == 0 {
        eprintln!("{} No blocking locks detected", "✓".green());
    }
    eprintln!();
}

fn print_rewrite(alt: &SaferRewrite) {
    eprintln!("    {} {}", "💡".cyan(), alt.description);
    for sql in &alt.sql {
        eprintln!("       {}", sql.green());
    }
    for tradeoff in &alt.tradeoffs {
        eprintln!("       • {}", tradeoff.dimmed());
    }
    if !alt.notes.is_empty() {
        eprintln!("       {}", alt.notes);
    }
}

/// Swap in rewrites the driver can run. Returns how many steps changed.
fn apply_rewrites(plan: &mut Plan, impacts: &[LockImpact], driver: &dyn Driver) -> usize {
    let mut rewritten = 0;
    for (step, impact) in plan.steps.iter_mut().zip(impacts) {
        if !impact.should_rewrite() {
            continue;
        }
        let Some(alt) = synthesise(step) else { continue };
        if alt.is_sentinel() || !driver_supports(&alt, driver) {
            continue;
        }
        *step = alt.to_step(step);
        rewritten += 1;
    }
    rewritten
}

fn driver_supports(alt: &SaferRewrite, driver: &dyn Driver) -> bool {
    let upper = alt.sql.join(" ").to_uppercase();
    (!upper.contains("CONCURRENTLY") || driver.supports_feature(Feature::ConcurrentIndex))
        && (!upper.contains("NOT VALID") || driver.supports_feature(Feature::NotValidConstraint))
}
