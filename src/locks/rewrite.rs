//! Lock-friendly rewrites of blocking DDL.
//!
//! Three shapes are recognised:
//!
//! | Input                                   | Rewrite                                   |
//! |-----------------------------------------|-------------------------------------------|
//! | `CREATE [UNIQUE] INDEX ...`             | `CREATE [UNIQUE] INDEX CONCURRENTLY ...`  |
//! | `ALTER TABLE t ADD CONSTRAINT c ...`    | `... NOT VALID` then `VALIDATE CONSTRAINT`|
//! | `ALTER TABLE t ALTER COLUMN c TYPE ...` | no SQL; use the `type_change` workflow    |

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use super::LockMode;
use crate::plan::PlanStep;

static RE_CREATE_UNIQUE_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(CREATE\s+UNIQUE\s+INDEX)").unwrap());
static RE_CREATE_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(CREATE\s+INDEX)").unwrap());
static RE_ALTER_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)ALTER\s+TABLE\s+([a-zA-Z_][a-zA-Z0-9_]*)").unwrap());
static RE_ADD_CONSTRAINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)ADD\s+CONSTRAINT\s+([a-zA-Z_][a-zA-Z0-9_]*)\s+").unwrap());
static RE_ALTER_COLUMN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)ALTER\s+COLUMN\s+([a-zA-Z_][a-zA-Z0-9_]*)").unwrap());
static RE_ALTER_COLUMN_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)ALTER\s+COLUMN\s+[a-zA-Z_][a-zA-Z0-9_]*\s+(SET\s+DATA\s+)?TYPE\b").unwrap()
});
static RE_INDEX_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)CREATE\s+(?:UNIQUE\s+)?INDEX\s+(?:CONCURRENTLY\s+)?(?:IF\s+NOT\s+EXISTS\s+)?([a-zA-Z_][a-zA-Z0-9_]*)\s+ON\b",
    )
    .unwrap()
});

const CONSTRAINT_KEYWORDS: [&str; 4] = ["CHECK", "UNIQUE", "FOREIGN", "PRIMARY"];

/// A safer equivalent of a blocking step.
///
/// An empty `sql` means there is no single-run rewrite and the change should
/// go through a multi-phase workflow instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaferRewrite {
    pub description: String,
    pub sql: Vec<String>,
    pub lock_mode: LockMode,
    pub requires_multiple_steps: bool,
    pub tradeoffs: Vec<String>,
    pub notes: String,
}

impl SaferRewrite {
    /// True when the rewrite only points at the multi-phase path.
    pub fn is_sentinel(&self) -> bool {
        self.sql.is_empty()
    }

    /// The rewrite as a plan step, keeping the original description.
    pub fn to_step(&self, original: &PlanStep) -> PlanStep {
        PlanStep::new(original.description.clone(), self.sql.clone())
    }
}

/// Find a safer alternative for the step's first statement.
pub fn synthesise(step: &PlanStep) -> Option<SaferRewrite> {
    let sql = step.first_sql().trim();
    if sql.is_empty() {
        return None;
    }
    let upper = sql.to_uppercase();

    rewrite_create_index(sql, &upper)
        .or_else(|| rewrite_add_constraint(sql, &upper))
        .or_else(|| suggest_type_change(sql, &upper))
}

fn rewrite_create_index(sql: &str, upper: &str) -> Option<SaferRewrite> {
    if upper.contains("CONCURRENTLY") {
        return None;
    }

    let rewritten = if RE_CREATE_UNIQUE_INDEX.is_match(sql) {
        RE_CREATE_UNIQUE_INDEX.replace(sql, "$1 CONCURRENTLY").into_owned()
    } else if RE_CREATE_INDEX.is_match(sql) {
        RE_CREATE_INDEX.replace(sql, "$1 CONCURRENTLY").into_owned()
    } else {
        return None;
    };

    Some(SaferRewrite {
        description: "Use CREATE INDEX CONCURRENTLY to avoid blocking writes".into(),
        sql: vec![rewritten],
        lock_mode: LockMode::ShareUpdateExclusive,
        requires_multiple_steps: false,
        tradeoffs: vec![
            "Takes longer to build (requires multiple table scans)".into(),
            "Cannot run inside a transaction".into(),
            "May create invalid index if interrupted (must monitor completion)".into(),
            "Allows concurrent INSERT/UPDATE/DELETE during build".into(),
        ],
        notes: "Monitor index creation: SELECT * FROM pg_stat_progress_create_index".into(),
    })
}

fn rewrite_add_constraint(sql: &str, upper: &str) -> Option<SaferRewrite> {
    if !upper.contains("ALTER TABLE") || !upper.contains("ADD CONSTRAINT") {
        return None;
    }
    if upper.contains("NOT VALID") || upper.contains("VALIDATE CONSTRAINT") {
        return None;
    }

    let table = extract_table_name(sql);
    if table.is_empty() {
        return None;
    }
    let constraint = extract_constraint_name(sql);

    let not_valid = match sql.strip_suffix(';') {
        Some(body) => format!("{} NOT VALID;", body.trim_end()),
        None => format!("{} NOT VALID", sql),
    };
    let validate = format!("ALTER TABLE {} VALIDATE CONSTRAINT {}", table, constraint);

    Some(SaferRewrite {
        description: "Add constraint in two phases: NOT VALID + VALIDATE to avoid long exclusive lock"
            .into(),
        sql: vec![not_valid, validate],
        lock_mode: LockMode::ShareUpdateExclusive,
        requires_multiple_steps: true,
        tradeoffs: vec![
            "Requires two separate operations".into(),
            "Phase 1: Brief ACCESS EXCLUSIVE lock (~100ms)".into(),
            "Phase 2: Longer SHARE UPDATE EXCLUSIVE lock (allows reads/writes)".into(),
            "New rows validated immediately, existing rows validated in phase 2".into(),
            "Total time is longer but safer for production".into(),
        ],
        notes: "Execute phase 1, then phase 2 after verifying no errors".into(),
    })
}

fn suggest_type_change(sql: &str, upper: &str) -> Option<SaferRewrite> {
    if !upper.contains("ALTER TABLE") || !RE_ALTER_COLUMN_TYPE.is_match(sql) {
        return None;
    }

    let table = extract_table_name(sql);
    let column = extract_column_name_from_alter(sql);
    if table.is_empty() || column.is_empty() {
        return None;
    }

    Some(SaferRewrite {
        description: "ALTER COLUMN TYPE requires multi-phase migration to avoid downtime".into(),
        sql: Vec::new(),
        lock_mode: LockMode::ShareUpdateExclusive,
        requires_multiple_steps: true,
        tradeoffs: vec![
            "Requires 3-5 phases with code deployments".into(),
            "Phase 1: Add new column with new type".into(),
            "Phase 2: Dual-write to both columns (code deploy)".into(),
            "Phase 3: Backfill data to new column".into(),
            "Phase 4: Migrate reads to new column (code deploy)".into(),
            "Phase 5: Drop old column".into(),
            "Temporary storage overhead (two columns exist)".into(),
        ],
        notes: format!(
            "Generate multi-phase plan: lockplan plan-multiphase --pattern type_change --table {} --column {}",
            table, column
        ),
    })
}

/// `SET lock_timeout` for a positive number of seconds.
pub fn lock_timeout_statement(seconds: i64) -> Option<String> {
    (seconds > 0).then(|| format!("SET lock_timeout = '{}s'", seconds))
}

/// Prefix a statement with a session lock timeout. Non-positive timeouts leave it unchanged.
///
/// PostgreSQL runs a multi-statement query as one implicit transaction, so the
/// result must not be used for statements that refuse transactions
/// (`CREATE INDEX CONCURRENTLY`). The executor sends
/// [`lock_timeout_statement`] on its own instead.
pub fn inject_lock_timeout(sql: &str, seconds: i64) -> String {
    let Some(set) = lock_timeout_statement(seconds) else {
        return sql.to_string();
    };
    let body = sql.trim();
    let body = body.strip_suffix(';').unwrap_or(body);
    format!("{}; {};", set, body)
}

/// Table name from `ALTER TABLE <name>`, or empty.
pub fn extract_table_name(sql: &str) -> String {
    capture(&RE_ALTER_TABLE, sql)
}

/// Constraint name from `ADD CONSTRAINT <name>`.
///
/// Unnamed constraints get `<table>_check`, `<table>_unique` or
/// `<table>_fkey`; anything else on a known table gets `<table>_constraint`.
/// Returns empty when neither a name nor a table can be found.
pub fn extract_constraint_name(sql: &str) -> String {
    let name = capture(&RE_ADD_CONSTRAINT, sql);
    if !name.is_empty() && !CONSTRAINT_KEYWORDS.contains(&name.to_uppercase().as_str()) {
        return name;
    }

    let table = extract_table_name(sql);
    if table.is_empty() {
        return String::new();
    }
    let upper = sql.to_uppercase();
    if upper.contains("CHECK") {
        format!("{}_check", table)
    } else if upper.contains("UNIQUE") {
        format!("{}_unique", table)
    } else if upper.contains("FOREIGN KEY") {
        format!("{}_fkey", table)
    } else {
        format!("{}_constraint", table)
    }
}

/// Column name from `ALTER COLUMN <name>`, or empty.
pub fn extract_column_name_from_alter(sql: &str) -> String {
    capture(&RE_ALTER_COLUMN, sql)
}

/// Index name from `CREATE [UNIQUE] INDEX [CONCURRENTLY] [IF NOT EXISTS] <name> ON`, or empty.
///
/// Quoted and schema-qualified names are not recognised.
pub fn extract_index_name(sql: &str) -> String {
    capture(&RE_INDEX_NAME, sql)
}

fn capture(re: &Regex, sql: &str) -> String {
    re.captures(sql)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}
