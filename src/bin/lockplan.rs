//! lockplan command-line interface.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use tracing_subscriber::EnvFilter;

use lockplan::commands::{
    self, ApplyArgs, ApplyPhaseArgs, GlobalOpts, IntrospectArgs, MultiPhaseArgs, PlanArgs,
    RollbackArgs, RollbackPhaseArgs, ValidateArgs,
};
use lockplan::config::Config;

#[derive(Parser)]
#[command(name = "lockplan")]
#[command(version, about = "Lock-aware schema migrations")]
struct Cli {
    /// Debug logging and step-by-step execution output
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Lock timeout in seconds applied to each target statement
    #[arg(long, global = true)]
    lock_timeout: Option<i64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diff two schemas into a lock-annotated migration plan
    Plan(PlanArgs),

    /// Generate a multi-phase plan for a breaking change
    PlanMultiphase(MultiPhaseArgs),

    /// Apply a migration plan to the target database
    Apply(ApplyArgs),

    /// Execute one phase of a multi-phase plan
    ApplyPhase(ApplyPhaseArgs),

    /// Generate (and optionally apply) the rollback of a plan
    Rollback(RollbackArgs),

    /// Roll back one phase of a multi-phase plan
    RollbackPhase(RollbackPhaseArgs),

    /// Show progress of the active multi-phase migration
    PhaseStatus,

    /// Validate a schema or plan file
    Validate(ValidateArgs),

    /// Print the schema of a live database
    Introspect(IntrospectArgs),
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "lockplan=debug" } else { "lockplan=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "✗".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let opts = GlobalOpts {
        config: Config::load()?,
        verbose: cli.verbose,
        lock_timeout: cli.lock_timeout,
    };

    match &cli.command {
        Commands::Plan(args) => commands::plan(&opts, args).await,
        Commands::PlanMultiphase(args) => commands::plan_multiphase(&opts, args).await,
        Commands::Apply(args) => commands::apply(&opts, args).await,
        Commands::ApplyPhase(args) => commands::apply_phase(&opts, args).await,
        Commands::Rollback(args) => commands::rollback(&opts, args).await,
        Commands::RollbackPhase(args) => commands::rollback_phase(&opts, args).await,
        Commands::PhaseStatus => commands::phase_status(&opts),
        Commands::Validate(args) => commands::validate(&opts, args).await,
        Commands::Introspect(args) => commands::introspect(&opts, args).await,
    }
}
