//! Multi-phase migration workflows.
//!
//! Each generator splits a change that would break running application code
//! into phases that alternate between database changes and code deploys.
//! Every phase stays compatible with the code deployed for the phase before.

pub mod deprecation;
pub mod expand_contract;
pub mod table_deprecation;
pub mod type_change;
pub mod validation;

pub use deprecation::deprecation;
pub use expand_contract::expand_contract;
pub use table_deprecation::table_deprecation;
pub use type_change::type_change;
pub use validation::{ConstraintKind, validation};

use chrono::Utc;

use crate::error::{Error, Result};
use crate::plan::{MultiPhasePlan, Pattern, Phase, Plan, PlanStep};

/// Arguments for [`generate`]. Each pattern reads only the fields it needs.
#[derive(Debug, Clone, Default)]
pub struct PatternArgs {
    pub table: String,
    pub column: Option<String>,
    pub old_column: Option<String>,
    pub new_column: Option<String>,
    pub column_type: Option<String>,
    pub old_type: Option<String>,
    pub new_type: Option<String>,
    /// `NOT NULL`, `UNIQUE` or `CHECK (<expr>)`.
    pub constraint: Option<String>,
    pub backfill: Option<String>,
    pub conversion: Option<String>,
    pub archive: bool,
    pub source_hash: String,
}

/// Dispatch to the generator for `pattern`.
pub fn generate(pattern: Pattern, args: &PatternArgs) -> Result<MultiPhasePlan> {
    let opt = |v: &Option<String>| v.clone().unwrap_or_default();
    match pattern {
        Pattern::ExpandContract => expand_contract(
            &args.table,
            &opt(&args.old_column),
            &opt(&args.new_column),
            &opt(&args.column_type),
            &args.source_hash,
        ),
        Pattern::Deprecation => deprecation(
            &args.table,
            &opt(&args.column),
            &opt(&args.column_type),
            args.archive,
            &args.source_hash,
        ),
        Pattern::TableDeprecation => {
            table_deprecation(&args.table, args.archive, &args.source_hash)
        }
        Pattern::Validation => {
            let constraint = args
                .constraint
                .as_deref()
                .ok_or_else(|| Error::validation("validation pattern requires a constraint"))?;
            let kind = ConstraintKind::parse(constraint)?;
            validation(
                &args.table,
                &opt(&args.column),
                &kind,
                args.backfill.as_deref(),
                &args.source_hash,
            )
        }
        Pattern::TypeChange => type_change(
            &args.table,
            &opt(&args.column),
            &opt(&args.old_type),
            &opt(&args.new_type),
            args.conversion.as_deref(),
            &args.source_hash,
        ),
    }
}

impl MultiPhasePlan {
    pub(crate) fn workflow(
        pattern: Pattern,
        operation: impl Into<String>,
        description: impl Into<String>,
        table: &str,
    ) -> Self {
        Self {
            multi_phase: true,
            operation: operation.into(),
            description: description.into(),
            pattern,
            total_phases: 0,
            phases: Vec::new(),
            safety_notes: Vec::new(),
            created_at: Utc::now(),
            table: table.to_string(),
            column: None,
        }
    }

    pub(crate) fn on_column(mut self, column: &str) -> Self {
        self.column = Some(column.to_string());
        self
    }

    /// Attach the phases. The source hash goes to the first phase with SQL;
    /// later phases start from schemas that hash differently.
    pub(crate) fn with_phases(mut self, mut phases: Vec<Phase>, source_hash: &str) -> Self {
        if let Some(first) = phases.iter_mut().find(|p| p.has_sql()) {
            first.plan.source_hash = source_hash.to_string();
        }
        self.total_phases = phases.len() as u32;
        self.phases = phases;
        self
    }

    pub(crate) fn safety_notes<I, S>(mut self, notes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.safety_notes = notes.into_iter().map(Into::into).collect();
        self
    }

    /// Check phase numbering and dependencies.
    pub fn validate(&self) -> Result<()> {
        if self.phases.len() as u32 != self.total_phases {
            return Err(Error::validation(format!(
                "plan declares {} phases but contains {}",
                self.total_phases,
                self.phases.len()
            )));
        }
        for (i, phase) in self.phases.iter().enumerate() {
            let expected = i as u32 + 1;
            if phase.phase_number != expected {
                return Err(Error::validation(format!(
                    "phase {} is numbered {}",
                    expected, phase.phase_number
                )));
            }
            if phase.depends_on_phase >= phase.phase_number {
                return Err(Error::validation(format!(
                    "phase {} depends on later phase {}",
                    phase.phase_number, phase.depends_on_phase
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn require(fields: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<&str> = fields
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(format!("{} required", missing.join(", "))))
    }
}

/// Plan with one single-statement step per entry.
pub(crate) fn steps(entries: Vec<(String, String)>) -> Plan {
    Plan {
        source_hash: String::new(),
        steps: entries
            .into_iter()
            .map(|(description, sql)| PlanStep::new(description, [sql]))
            .collect(),
    }
}
