//! Multi-phase workflow execution.
//!
//! Progress lives in the state file at the project root, so phases can be
//! applied days apart across separate code deploys.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use colored::*;
use std::path::{Path, PathBuf};

use super::apply::report;
use super::{GlobalOpts, ShadowArgs, TargetArgs, confirm, connect, connect_shadow};
use crate::driver::detect_driver;
use crate::executor::{self, ApplyOptions};
use crate::plan::{MultiPhasePlan, Phase, Plan, PlanStep};
use crate::state::{ActiveMigration, NewMigration, STATE_FILE, State};

#[derive(Args, Debug, Clone, Default)]
pub struct ApplyPhaseArgs {
    /// Multi-phase plan JSON written by `lockplan plan-multiphase`
    pub plan: PathBuf,

    /// Phase number to execute
    #[arg(long, conflicts_with = "next")]
    pub phase: Option<u32>,

    /// Execute the next pending phase
    #[arg(long)]
    pub next: bool,

    /// Skip phase ordering checks
    #[arg(long)]
    pub force: bool,

    /// Show what would run without executing
    #[arg(long)]
    pub dry_run: bool,

    /// Execute without asking for confirmation
    #[arg(long)]
    pub auto_approve: bool,

    #[command(flatten)]
    pub target: TargetArgs,

    #[command(flatten)]
    pub shadow: ShadowArgs,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RollbackPhaseArgs {
    /// Multi-phase plan JSON
    pub plan: PathBuf,

    /// Phase to roll back; defaults to the current phase
    #[arg(long)]
    pub phase: Option<u32>,

    /// Show the rollback without executing it
    #[arg(long)]
    pub dry_run: bool,

    /// Roll back without asking for confirmation
    #[arg(long)]
    pub auto_approve: bool,

    /// Roll back even if the plan is not the active migration's
    #[arg(long)]
    pub force: bool,

    #[command(flatten)]
    pub target: TargetArgs,
}

fn load_plan(path: &Path) -> Result<MultiPhasePlan> {
    let plan = MultiPhasePlan::load(path)
        .with_context(|| format!("Failed to load multi-phase plan {}", path.display()))?;
    plan.validate()?;
    Ok(plan)
}

fn phase_of(plan: &MultiPhasePlan, n: u32) -> Result<&Phase> {
    plan.phase(n).with_context(|| {
        format!("Invalid phase number {} (plan has {} phases)", n, plan.total_phases)
    })
}

/// Fail unless `plan` is the plan the active migration was started from.
fn ensure_same_migration(state: &State, plan: &MultiPhasePlan, plan_path: &Path) -> Result<()> {
    let Some(migration) = &state.active_migration else {
        return Ok(());
    };

    let pattern = plan.pattern.to_string();
    let mut mismatches = Vec::new();
    for (field, recorded, given) in [
        ("operation", migration.operation.as_str(), plan.operation.as_str()),
        ("pattern", migration.pattern.as_str(), pattern.as_str()),
        ("table", migration.table.as_str(), plan.table.as_str()),
        (
            "column",
            migration.column.as_deref().unwrap_or(""),
            plan.column.as_deref().unwrap_or(""),
        ),
    ] {
        if recorded != given {
            mismatches.push(format!("{} {} != {}", field, recorded, given));
        }
    }
    if migration.total_phases != plan.total_phases {
        mismatches.push(format!(
            "phases {} != {}",
            migration.total_phases, plan.total_phases
        ));
    }
    if !same_path(Path::new(&migration.plan_path), plan_path) {
        mismatches.push(format!(
            "plan file {} != {}",
            migration.plan_path,
            plan_path.display()
        ));
    }

    if mismatches.is_empty() {
        return Ok(());
    }
    anyhow::bail!(
        "{} does not belong to active migration {} ({}); use --force to override",
        plan_path.display(),
        migration.id,
        mismatches.join(", ")
    )
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// `ensure_same_migration`, downgraded to a warning under `--force`.
fn check_migration(state: &State, plan: &MultiPhasePlan, plan_path: &Path, force: bool) -> Result<()> {
    match ensure_same_migration(state, plan, plan_path) {
        Err(e) if force => {
            println!("{} {}", "⚠".yellow(), e);
            Ok(())
        }
        other => other,
    }
}

/// Run one phase and record it in the state file.
pub async fn apply_phase(opts: &GlobalOpts, args: &ApplyPhaseArgs) -> Result<()> {
    let plan = load_plan(&args.plan)?;
    let mut state = State::load(opts.config.state_path())?;
    check_migration(&state, &plan, &args.plan, args.force)?;

    let n = match (args.phase, args.next) {
        (Some(n), _) => n,
        (None, true) => match state.next_phase() {
            0 => {
                println!("{}", "✓ All phases complete!".green().bold());
                return Ok(());
            }
            n => n,
        },
        (None, false) => anyhow::bail!("Specify --phase <N> or --next"),
    };
    let phase = phase_of(&plan, n)?;

    if args.force {
        if let Err(e) = state.can_execute(n) {
            println!("{} Forcing phase {}: {}", "⚠".yellow(), n, e);
        }
    } else {
        state.can_execute(n)?;
    }

    print_phase(&plan, phase);

    if args.dry_run {
        println!("{}", "🔍 DRY RUN: No changes will be applied".yellow());
        return Ok(());
    }
    if !args.auto_approve && !confirm(&format!("Proceed with phase {} execution?", n))? {
        anyhow::bail!("phase {} cancelled", n);
    }

    if state.active_migration.is_none() && n == 1 {
        state.start(new_migration(&plan, &args.plan))?;
    }

    if !phase.has_sql() {
        println!("No SQL to execute. Mark this phase complete after code deployment.");
    } else {
        execute_phase(opts, args, phase).await?;
    }

    match state.complete(n) {
        Ok(()) => {}
        Err(e) if args.force => {
            println!("{} Phase ran but state was not updated: {}", "⚠".yellow(), e);
        }
        Err(e) => return Err(e.into()),
    }

    println!("\n{} Phase {} complete", "✓".green().bold(), n);
    print_next_steps(&plan, &args.plan, n);
    Ok(())
}

async fn execute_phase(opts: &GlobalOpts, args: &ApplyPhaseArgs, phase: &Phase) -> Result<()> {
    let config = &opts.config;
    let target_url = args.target.resolve(config)?;
    let driver = detect_driver(&target_url);

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
        &phase.plan,
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

    report(&result, phase.plan.steps.len())?;
    println!("Executed {} steps successfully", result.steps_applied);
    Ok(())
}

fn new_migration(plan: &MultiPhasePlan, plan_path: &Path) -> NewMigration {
    NewMigration {
        id: format!("{}_{}_{}", plan.operation, plan.pattern, Utc::now().timestamp()),
        operation: plan.operation.clone(),
        pattern: plan.pattern.to_string(),
        table: plan.table.clone(),
        column: plan.column.clone(),
        total_phases: plan.total_phases,
        plan_path: plan_path.display().to_string(),
    }
}

fn print_phase(plan: &MultiPhasePlan, phase: &Phase) {
    println!(
        "\n{}",
        format!(
            "📋 Phase {}/{}: {}",
            phase.phase_number, plan.total_phases, phase.name
        )
        .cyan()
        .bold()
    );
    println!("{}", phase.description);
    if !phase.lock_impact.is_empty() {
        println!("  Lock impact: {}", phase.lock_impact.yellow());
    }
    if !phase.estimated_duration.is_empty() {
        println!("  Estimated duration: {}", phase.estimated_duration);
    }

    if phase.requires_code_deploy {
        println!("\n{} Code deployment required:", "⚠".yellow());
        for change in &phase.code_changes_required {
            println!("  • {}", change);
        }
    }

    if phase.has_sql() {
        println!("\nSQL:");
        let mut i = 0;
        for step in &phase.plan.steps {
            for sql in &step.sql {
                i += 1;
                println!("  {}. {}", i, sql.cyan());
            }
        }
    }
    println!();
}

fn print_next_steps(plan: &MultiPhasePlan, plan_path: &Path, completed: u32) {
    let Some(next) = plan.phase(completed + 1) else {
        println!("\n{}", "✓ All phases complete!".green().bold());
        println!("\nTo clean up:");
        println!("  rm {}", STATE_FILE);
        return;
    };

    let current = plan.phase(completed);
    println!("\n{}", "Next steps:".cyan().bold());
    if let Some(current) = current.filter(|p| !p.verification.is_empty()) {
        println!("  Verify phase {}:", completed);
        for check in &current.verification {
            println!("    • {}", check);
        }
    }
    if next.requires_code_deploy && !next.code_changes_required.is_empty() {
        println!("  Before phase {}, deploy:", next.phase_number);
        for change in &next.code_changes_required {
            println!("    • {}", change);
        }
    }
    println!(
        "\n  {} lockplan apply-phase {} --phase {}",
        "→".cyan(),
        plan_path.display(),
        next.phase_number
    );
    println!("  {} lockplan apply-phase {} --next", "→".cyan(), plan_path.display());
}

/// Undo one phase with its rollback SQL and step the state back.
pub async fn rollback_phase(opts: &GlobalOpts, args: &RollbackPhaseArgs) -> Result<()> {
    let plan = load_plan(&args.plan)?;
    let mut state = State::load(opts.config.state_path())?;
    check_migration(&state, &plan, &args.plan, args.force)?;

    let n = match args.phase {
        Some(n) => n,
        None => {
            let migration = state
                .active_migration
                .as_ref()
                .context("No active migration to roll back")?;
            if migration.current_phase == 0 {
                anyhow::bail!("No phases have been executed yet");
            }
            println!("Rolling back current phase: {}", migration.current_phase);
            migration.current_phase
        }
    };
    let phase = phase_of(&plan, n)?;

    if let Some(migration) = &state.active_migration {
        if migration.current_phase != n {
            anyhow::bail!(
                "Cannot roll back phase {}: current phase is {}. Roll back phases in reverse order.",
                n,
                migration.current_phase
            );
        }
    }

    let rb = &phase.rollback;
    println!(
        "\n{} Rolling back phase {}/{}: {}",
        "⚠".yellow(),
        n,
        plan.total_phases,
        phase.name.bold()
    );
    println!("Description: {}", phase.description);
    println!("\nRollback: {}", rb.description);
    if let Some(note) = &rb.note {
        println!("Note: {}", note);
    }
    if let Some(warning) = &rb.warning {
        println!("{} WARNING: {}", "⚠".yellow(), warning.yellow());
    }
    if rb.requires_code {
        println!("\n{} Code rollback required:", "⚠".yellow());
        println!("  Redeploy the previous version of your application before proceeding.");
    }
    if rb.sql.is_empty() {
        println!("\nNo SQL rollback (code-only rollback)");
    } else {
        println!("\nRollback SQL:");
        for (i, sql) in rb.sql.iter().enumerate() {
            println!("  {}. {}", i + 1, sql.cyan());
        }
    }
    println!();

    if args.dry_run {
        println!("{}", "🔍 DRY RUN: No changes will be applied".yellow());
        return Ok(());
    }
    if !args.auto_approve
        && !confirm(&format!(
            "{} Proceed with phase {} rollback? This may cause data loss.",
            "⚠".yellow(),
            n
        ))?
    {
        anyhow::bail!("rollback of phase {} cancelled", n);
    }

    if !rb.sql.is_empty() {
        let rollback_plan = Plan::new("").step(PlanStep::new(
            format!("Rollback phase {}: {}", n, rb.description),
            rb.sql.clone(),
        ));
        if let Err(e) = execute_rollback(opts, args, &rollback_plan).await {
            print_recovery(n, &e);
            return Err(e);
        }
    }

    if state.active_migration.is_some() {
        state.rollback(n)?;
    } else {
        println!(
            "{} No active migration in {}; state not updated",
            "⚠".yellow(),
            STATE_FILE
        );
    }

    println!("\n{} Phase {} rollback complete", "✓".green().bold(), n);
    if rb.requires_code {
        println!(
            "\n{} Don't forget to redeploy the previous version of your application!",
            "⚠".yellow()
        );
    }
    Ok(())
}

async fn execute_rollback(opts: &GlobalOpts, args: &RollbackPhaseArgs, plan: &Plan) -> Result<()> {
    let target_url = args.target.resolve(&opts.config)?;
    let driver = detect_driver(&target_url);
    let mut target = connect(&target_url, "target").await?;
    let current = driver.introspect(&mut target).await?;

    println!("{} Executing rollback...", "→".cyan());
    let apply_opts = ApplyOptions {
        verbose: opts.verbose,
        lock_timeout: opts.lock_timeout(),
    };
    let result = executor::apply(&mut target, plan, None, &current, driver.as_ref(), &apply_opts).await?;
    target.close().await?;
    report(&result, plan.steps.len())
}

fn print_recovery(n: u32, err: &anyhow::Error) {
    println!("\n{} Phase {} rollback encountered an error\n", "✗".red().bold(), n);
    println!("Error: {:#}\n", err);
    println!("Current state:");
    println!("  • Rollback of phase {} FAILED", n);
    println!("  • Database may be in an inconsistent state");
    println!("  • Phase {} is still marked as complete in {}", n, STATE_FILE);
    println!("\nRecovery:");
    println!("  1. Check database connectivity and permissions, and read the error above");
    println!("  2. Inspect the schema: lockplan introspect");
    println!("  3. Fix the cause and retry: lockplan rollback-phase <plan-file> --phase {}", n);
}

/// Print the active migration and what to run next.
pub fn phase_status(opts: &GlobalOpts) -> Result<()> {
    let state_path = opts.config.state_path();
    let state = State::load(&state_path)?;

    let Some(m) = &state.active_migration else {
        println!("No active multi-phase migration");
        println!("\nTo start a new multi-phase migration:");
        println!("  1. Generate plan: lockplan plan-multiphase --pattern <pattern> ...");
        println!("  2. Execute phase 1: lockplan apply-phase <plan-file> --phase 1");
        return Ok(());
    };

    println!("{}\n", "📋 Active Multi-Phase Migration".cyan().bold());
    println!("ID:          {}", m.id);
    println!("Operation:   {}", m.operation);
    println!("Pattern:     {}", m.pattern);
    println!("Table:       {}", m.table);
    if let Some(column) = &m.column {
        println!("Column:      {}", column);
    }
    println!("Started:     {}", m.started_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Last Update: {}", m.last_updated.format("%Y-%m-%d %H:%M:%S"));
    println!(
        "\nProgress: {}/{} phases complete\n",
        m.phases_completed.len(),
        m.total_phases
    );

    println!("Phase Status:");
    for n in 1..=m.total_phases {
        let status = PhaseStatus::of(m, n);
        println!("  {} Phase {}: {}", status.icon(), n, status.label());
    }
    println!();

    if m.current_phase >= m.total_phases {
        println!("{}", "✓ All phases complete!".green().bold());
        println!("\nTo clean up:\n  rm {}", STATE_FILE);
    } else {
        let next = m.current_phase + 1;
        println!("Next: Execute phase {}", next);
        println!("  lockplan apply-phase {} --phase {}", m.plan_path, next);
        println!("  or: lockplan apply-phase {} --next", m.plan_path);
    }

    if opts.verbose {
        println!("\nState file: {}", state_path.display());
        println!("Plan file:  {}", m.plan_path);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseStatus {
    Complete,
    Ready,
    Pending,
}

impl PhaseStatus {
    fn of(m: &ActiveMigration, n: u32) -> Self {
        if m.is_completed(n) || n <= m.current_phase {
            PhaseStatus::Complete
        } else if n == m.current_phase + 1 {
            PhaseStatus::Ready
        } else {
            PhaseStatus::Pending
        }
    }

    fn label(self) -> &'static str {
        match self {
            PhaseStatus::Complete => "Complete",
            PhaseStatus::Ready => "Ready to execute",
            PhaseStatus::Pending => "Pending",
        }
    }

    fn icon(self) -> ColoredString {
        match self {
            PhaseStatus::Complete => "✓".green(),
            PhaseStatus::Ready => "▶".cyan(),
            PhaseStatus::Pending => "·".dimmed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiphase::expand_contract;
    use pretty_assertions::assert_eq;

    fn migration(current: u32, completed: Vec<u32>) -> ActiveMigration {
        ActiveMigration {
            id: "m".into(),
            operation: "rename_column".into(),
            pattern: "expand_contract".into(),
            table: "users".into(),
            column: Some("email".into()),
            total_phases: 3,
            current_phase: current,
            phases_completed: completed,
            started_at: Utc::now(),
            last_updated: Utc::now(),
            plan_path: "plan.json".into(),
        }
    }

    #[test]
    fn test_phase_status_labels() {
        let m = migration(1, vec![1]);
        let statuses: Vec<_> = (1..=3).map(|n| PhaseStatus::of(&m, n)).collect();
        assert_eq!(
            statuses,
            vec![PhaseStatus::Complete, PhaseStatus::Ready, PhaseStatus::Pending]
        );
    }

    #[test]
    fn test_new_migration_uses_plan_identity() {
        let plan = expand_contract("users", "email", "email_address", "text", "").unwrap();
        let m = new_migration(&plan, Path::new("plans/rename.json"));
        assert!(m.id.starts_with(&format!("{}_expand_contract_", plan.operation)));
        assert_eq!(m.table, "users");
        assert_eq!(m.total_phases, plan.total_phases);
        assert_eq!(m.plan_path, "plans/rename.json");
    }

    #[test]
    fn test_phase_out_of_range() {
        let plan = expand_contract("users", "email", "email_address", "text", "").unwrap();
        assert!(phase_of(&plan, 0).is_err());
        assert!(phase_of(&plan, plan.total_phases + 1).is_err());
        assert_eq!(phase_of(&plan, 1).unwrap().phase_number, 1);
    }

    #[test]
    fn test_plan_must_match_active_migration() {
        let dir = tempfile::TempDir::new().unwrap();
        let rename = dir.path().join("rename.json");
        let other = dir.path().join("other.json");
        std::fs::write(&rename, "{}").unwrap();
        std::fs::write(&other, "{}").unwrap();

        let plan = expand_contract("users", "email", "email_address", "text", "").unwrap();
        let mut state = State::load(dir.path().join(STATE_FILE)).unwrap();
        ensure_same_migration(&state, &plan, &other).unwrap();

        state.start(new_migration(&plan, &rename)).unwrap();
        ensure_same_migration(&state, &plan, &rename).unwrap();

        let err = ensure_same_migration(&state, &plan, &other).unwrap_err();
        assert!(err.to_string().contains("plan file"), "{err}");

        let orders = expand_contract("orders", "total", "amount", "numeric", "").unwrap();
        let err = ensure_same_migration(&state, &orders, &rename).unwrap_err();
        assert!(err.to_string().contains("table users != orders"), "{err}");

        check_migration(&state, &orders, &other, true).unwrap();
        assert!(check_migration(&state, &orders, &other, false).is_err());
    }
}
