//! Multi-phase plan generation.

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use std::path::PathBuf;

use super::{GlobalOpts, emit_json};
use crate::multiphase::{PatternArgs, generate};
use crate::plan::{MultiPhasePlan, Pattern};
use crate::schema::loader::load_schema_or_introspect;

#[derive(Args, Debug, Clone)]
pub struct MultiPhaseArgs {
    /// expand_contract, deprecation, table_deprecation, validation or type_change
    #[arg(long)]
    pub pattern: Pattern,

    #[arg(long)]
    pub table: String,

    #[arg(long)]
    pub column: Option<String>,

    /// Column being renamed (expand_contract)
    #[arg(long)]
    pub old_column: Option<String>,

    /// Replacement column (expand_contract)
    #[arg(long)]
    pub new_column: Option<String>,

    /// Column type (expand_contract, deprecation)
    #[arg(long = "type")]
    pub column_type: Option<String>,

    #[arg(long)]
    pub old_type: Option<String>,

    #[arg(long)]
    pub new_type: Option<String>,

    /// `NOT NULL`, `UNIQUE` or `CHECK (<expr>)` (validation)
    #[arg(long)]
    pub constraint: Option<String>,

    /// Value written into NULL rows before a NOT NULL constraint
    #[arg(long)]
    pub backfill: Option<String>,

    /// Old-to-new value expression (type_change)
    #[arg(long)]
    pub conversion: Option<String>,

    /// Copy data into an archive table before dropping it
    #[arg(long)]
    pub archive: bool,

    /// Hash of the schema phase 1 runs against
    #[arg(long, conflicts_with = "from")]
    pub source_hash: Option<String>,

    /// Schema or database to compute the source hash from
    #[arg(long)]
    pub from: Option<String>,

    /// Write the plan here instead of stdout
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

/// Generate a multi-phase plan for one of the workflow patterns.
pub async fn plan_multiphase(opts: &GlobalOpts, args: &MultiPhaseArgs) -> Result<()> {
    let source_hash = match (&args.source_hash, &args.from) {
        (Some(hash), _) => hash.clone(),
        (None, Some(from)) => load_schema_or_introspect(from)
            .await
            .with_context(|| format!("Failed to load schema from {}", from))?
            .content_hash()?,
        (None, None) => {
            eprintln!(
                "{} No --source-hash or --from given; phase 1 will skip the drift check",
                "⚠".yellow()
            );
            String::new()
        }
    };

    let plan = generate(args.pattern, &pattern_args(args, source_hash))
        .with_context(|| format!("Failed to generate {} plan", args.pattern))?;

    print_summary(&plan, opts.verbose);
    emit_json(&plan, args.output.as_deref())
}

fn pattern_args(args: &MultiPhaseArgs, source_hash: String) -> PatternArgs {
    let backfill = match (&args.backfill, args.pattern) {
        (Some(value), _) => Some(value.clone()),
        (None, Pattern::Validation) if is_not_null(args.constraint.as_deref()) => {
            Some("''".to_string())
        }
        (None, _) => None,
    };
    PatternArgs {
        table: args.table.clone(),
        column: args.column.clone(),
        old_column: args.old_column.clone(),
        new_column: args.new_column.clone(),
        column_type: args.column_type.clone(),
        old_type: args.old_type.clone(),
        new_type: args.new_type.clone(),
        constraint: args.constraint.clone(),
        backfill,
        conversion: args.conversion.clone(),
        archive: args.archive,
        source_hash,
    }
}

fn is_not_null(constraint: Option<&str>) -> bool {
    constraint
        .map(|c| c.trim().to_uppercase().replace('_', " ") == "NOT NULL")
        .unwrap_or(false)
}

fn print_summary(plan: &MultiPhasePlan, verbose: bool) {
    eprintln!("{}", format!("📋 {}", plan.description).cyan().bold());
    eprintln!();
    for phase in &plan.phases {
        let kind = if phase.has_sql() {
            "database".cyan()
        } else {
            "code deploy".yellow()
        };
        eprintln!(
            "  {} {} ({})",
            format!("[{}/{}]", phase.phase_number, plan.total_phases).dimmed(),
            phase.name,
            kind
        );
        if verbose {
            eprintln!("      {}", phase.description);
        }
    }
    if !plan.safety_notes.is_empty() {
        eprintln!();
        for note in &plan.safety_notes {
            eprintln!("  • {}", note);
        }
    }
    eprintln!();
}
