//! Plan artifacts.
//!
//! These are the JSON documents written by `lockplan plan` and
//! `lockplan plan-multiphase` and read back by the apply commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::locks::LockMode;

/// Ordered migration steps plus the hash of the schema they were planned against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub source_hash: String,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

/// One logical operation. All statements are applied together or not at all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    #[serde(deserialize_with = "one_or_many")]
    pub sql: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_mode: Option<LockMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_impact: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub blocks_reads: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub blocks_writes: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub rewritable: bool,
}

/// Outcome of applying a plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub steps_applied: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Multi-phase workflow pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    ExpandContract,
    Deprecation,
    TableDeprecation,
    Validation,
    TypeChange,
}

impl Pattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pattern::ExpandContract => "expand_contract",
            Pattern::Deprecation => "deprecation",
            Pattern::TableDeprecation => "table_deprecation",
            Pattern::Validation => "validation",
            Pattern::TypeChange => "type_change",
        }
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Pattern {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "expand_contract" => Ok(Pattern::ExpandContract),
            "deprecation" => Ok(Pattern::Deprecation),
            "table_deprecation" => Ok(Pattern::TableDeprecation),
            "validation" => Ok(Pattern::Validation),
            "type_change" => Ok(Pattern::TypeChange),
            other => Err(format!("unknown pattern '{}'", other)),
        }
    }
}

/// A migration spread over several coordinated database and code deploys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiPhasePlan {
    pub multi_phase: bool,
    pub operation: String,
    pub description: String,
    pub pattern: Pattern,
    pub total_phases: u32,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub safety_notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Table the workflow targets.
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub phase_number: u32,
    pub name: String,
    pub description: String,
    pub requires_code_deploy: bool,
    #[serde(default)]
    pub depends_on_phase: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_changes_required: Vec<String>,
    pub plan: Plan,
    #[serde(default)]
    pub verification: Vec<String>,
    pub rollback: PhaseRollback,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub estimated_duration: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lock_impact: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseRollback {
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sql: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub requires_code: bool,
}

impl Plan {
    pub fn new(source_hash: impl Into<String>) -> Self {
        Self {
            source_hash: source_hash.into(),
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: PlanStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

impl PlanStep {
    pub fn new<I, S>(description: impl Into<String>, sql: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            description: description.into(),
            sql: sql.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// First statement, used by the classifier and the measurer.
    pub fn first_sql(&self) -> &str {
        self.sql.first().map(String::as_str).unwrap_or("")
    }

    /// True for a table recreation: `CREATE TABLE <t>_new`, copy, drop, then
    /// `ALTER TABLE <t>_new RENAME TO <t>`.
    pub fn is_table_rebuild(&self) -> bool {
        self.sql.len() >= 3
            && self
                .first_sql()
                .trim_start()
                .to_uppercase()
                .starts_with("CREATE TABLE")
            && self
                .sql
                .iter()
                .any(|s| s.to_uppercase().contains("_NEW RENAME TO"))
    }

    /// True when every statement is blank or a `--` comment.
    pub fn is_comment_only(&self) -> bool {
        self.sql.iter().all(|s| is_skippable(s))
    }
}

/// Statements the executor never sends to the database.
pub fn is_skippable(sql: &str) -> bool {
    let trimmed = sql.trim();
    trimmed.is_empty() || trimmed.starts_with("--")
}

impl Phase {
    /// New phase depending on the one before it.
    pub fn new(phase_number: u32, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            phase_number,
            name: name.into(),
            description: description.into(),
            requires_code_deploy: false,
            depends_on_phase: phase_number.saturating_sub(1),
            code_changes_required: Vec::new(),
            plan: Plan::default(),
            verification: Vec::new(),
            rollback: PhaseRollback::default(),
            estimated_duration: String::new(),
            lock_impact: String::new(),
        }
    }

    pub fn code_deploy(mut self) -> Self {
        self.requires_code_deploy = true;
        self
    }

    pub fn code_changes<I, S>(mut self, changes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.code_changes_required = changes.into_iter().map(Into::into).collect();
        self
    }

    pub fn plan(mut self, plan: Plan) -> Self {
        self.plan = plan;
        self
    }

    pub fn verification<I, S>(mut self, checks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.verification = checks.into_iter().map(Into::into).collect();
        self
    }

    pub fn rollback(mut self, rollback: PhaseRollback) -> Self {
        self.rollback = rollback;
        self
    }

    pub fn duration(mut self, estimate: impl Into<String>) -> Self {
        self.estimated_duration = estimate.into();
        self
    }

    pub fn lock_impact(mut self, impact: impl Into<String>) -> Self {
        self.lock_impact = impact.into();
        self
    }

    /// Code-only phases carry no SQL.
    pub fn has_sql(&self) -> bool {
        self.plan.steps.iter().any(|s| !s.is_comment_only())
    }
}

impl PhaseRollback {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn sql<I, S>(mut self, sql: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sql = sql.into_iter().map(Into::into).collect();
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }

    pub fn requires_code(mut self) -> Self {
        self.requires_code = true;
        self
    }
}

impl MultiPhasePlan {
    pub fn phase(&self, number: u32) -> Option<&Phase> {
        self.phases.iter().find(|p| p.phase_number == number)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Older plan files stored a single statement per step.
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(sql) => vec![sql],
        OneOrMany::Many(sql) => sql,
    })
}
