//! Validate schema and plan files.

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use serde_json::Value;
use std::path::{Path, PathBuf};

use super::GlobalOpts;
use crate::plan::{MultiPhasePlan, Plan};
use crate::schema::Schema;
use crate::schema::loader::{SchemaFormat, load_schema};

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    /// Schema (JSON, YAML, SQL file or directory), plan or multi-phase plan
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Schema(SchemaFormat),
    Plan,
    MultiPhasePlan,
    SqlSchema,
}

/// Check a file and list every problem found.
pub async fn validate(opts: &GlobalOpts, args: &ValidateArgs) -> Result<()> {
    let path = args.path.as_path();
    let kind = detect_kind(path)?;
    if opts.verbose {
        eprintln!("{} Validating {} as {:?}", "→".cyan(), path.display(), kind);
    }

    let problems = match kind {
        FileKind::Schema(format) => {
            let content = read(path)?;
            let schema: Schema = match format {
                SchemaFormat::Json => serde_json::from_str(&content)?,
                SchemaFormat::Yaml => serde_yaml::from_str(&content)?,
            };
            schema.validate()
        }
        FileKind::SqlSchema => match load_schema(path).await {
            Ok(_) => Vec::new(),
            Err(e) => vec![e.to_string()],
        },
        FileKind::Plan => {
            let plan = Plan::load(path)?;
            plan_problems(&plan)
        }
        FileKind::MultiPhasePlan => {
            let plan = MultiPhasePlan::load(path)?;
            let mut problems = Vec::new();
            if let Err(e) = plan.validate() {
                problems.push(e.to_string());
            }
            for phase in &plan.phases {
                problems.extend(
                    plan_problems(&phase.plan)
                        .into_iter()
                        .map(|p| format!("phase {}: {}", phase.phase_number, p)),
                );
            }
            problems
        }
    };

    if problems.is_empty() {
        println!("{} {} is valid", "✓".green(), path.display());
        return Ok(());
    }

    println!("{} {} has {} problem(s):", "✗".red(), path.display(), problems.len());
    for problem in &problems {
        println!("  {} {}", "✗".red(), problem);
    }
    anyhow::bail!("validation failed")
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn detect_kind(path: &Path) -> Result<FileKind> {
    if path.is_dir() {
        return Ok(FileKind::SqlSchema);
    }
    match SchemaFormat::from_path(path) {
        Some(SchemaFormat::Json) => {
            let value: Value = serde_json::from_str(&read(path)?)
                .with_context(|| format!("{} is not valid JSON", path.display()))?;
            Ok(classify_json(&value))
        }
        Some(format) => Ok(FileKind::Schema(format)),
        None if path.to_string_lossy().ends_with(".sql") => Ok(FileKind::SqlSchema),
        None => anyhow::bail!(
            "Cannot tell what {} is: expected .json, .yaml, .sql or a directory",
            path.display()
        ),
    }
}

fn classify_json(value: &Value) -> FileKind {
    if value.get("multi_phase").and_then(Value::as_bool) == Some(true) {
        FileKind::MultiPhasePlan
    } else if value.get("steps").is_some() {
        FileKind::Plan
    } else {
        FileKind::Schema(SchemaFormat::Json)
    }
}

fn plan_problems(plan: &Plan) -> Vec<String> {
    let mut problems = Vec::new();
    for (i, step) in plan.steps.iter().enumerate() {
        if step.description.trim().is_empty() {
            problems.push(format!("step {} has no description", i + 1));
        }
        if step.sql.is_empty() {
            problems.push(format!("step {} ({}) has no SQL", i + 1, step.description));
        }
    }
    problems
}
