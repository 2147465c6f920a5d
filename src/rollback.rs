//! Rollback plan synthesis.
//!
//! Forward steps are walked in reverse and each is inverted against the
//! schema as it was before the forward plan ran. Inverses that need the old
//! definition (dropped tables, columns, indexes and foreign keys, previous
//! types and defaults) read it from that schema. Steps that cannot be
//! inverted become comment-only steps asking for a manual rollback; the
//! executor skips those.

use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

use crate::driver::{Driver, fk_clause, index_sql};
use crate::locks::rewrite::extract_index_name;
use crate::plan::{Plan, PlanStep};
use crate::schema::{Schema, Table};

const IDENT: &str = r"([a-zA-Z_][a-zA-Z0-9_]*)";

static RE_CREATE_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)^\s*CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?{IDENT}")).unwrap()
});
static RE_DROP_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)^\s*DROP\s+TABLE\s+(?:IF\s+EXISTS\s+)?{IDENT}")).unwrap()
});
static RE_CREATE_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*CREATE\s+(?:UNIQUE\s+)?INDEX\b").unwrap());
static RE_DROP_INDEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)^\s*DROP\s+INDEX\s+(?:CONCURRENTLY\s+)?(?:IF\s+EXISTS\s+)?{IDENT}"
    ))
    .unwrap()
});
static RE_ALTER_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?is)^\s*ALTER\s+TABLE\s+(?:ONLY\s+)?(?:IF\s+EXISTS\s+)?{IDENT}\s+(.*)$"
    ))
    .unwrap()
});
static RE_RECREATE_INSERT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*INSERT\s+INTO\s+\w+\s*\(([^)]*)\)\s*SELECT").unwrap()
});

static RE_ADD_COLUMN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)^ADD\s+COLUMN\s+(?:IF\s+NOT\s+EXISTS\s+)?{IDENT}")).unwrap()
});
static RE_DROP_COLUMN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)^DROP\s+COLUMN\s+(?:IF\s+EXISTS\s+)?{IDENT}")).unwrap()
});
static RE_ALTER_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)^ALTER\s+COLUMN\s+{IDENT}\s+(?:SET\s+DATA\s+)?TYPE\b")).unwrap()
});
static RE_SET_NOT_NULL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)^ALTER\s+COLUMN\s+{IDENT}\s+SET\s+NOT\s+NULL")).unwrap()
});
static RE_DROP_NOT_NULL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)^ALTER\s+COLUMN\s+{IDENT}\s+DROP\s+NOT\s+NULL")).unwrap()
});
static RE_SET_DEFAULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)^ALTER\s+COLUMN\s+{IDENT}\s+SET\s+DEFAULT\b")).unwrap()
});
static RE_DROP_DEFAULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)^ALTER\s+COLUMN\s+{IDENT}\s+DROP\s+DEFAULT")).unwrap()
});
static RE_ADD_PRIMARY_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^ADD\s+PRIMARY\s+KEY\b").unwrap());
static RE_ADD_CONSTRAINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)^ADD\s+CONSTRAINT\s+{IDENT}")).unwrap()
});
static RE_VALIDATE_CONSTRAINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^VALIDATE\s+CONSTRAINT\b").unwrap());
static RE_DROP_CONSTRAINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)^DROP\s+CONSTRAINT\s+(?:IF\s+EXISTS\s+)?{IDENT}")).unwrap()
});
static RE_RENAME_COLUMN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)^RENAME\s+COLUMN\s+{IDENT}\s+TO\s+{IDENT}")).unwrap()
});
static RE_RENAME_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?i)^RENAME\s+TO\s+{IDENT}")).unwrap());
static RE_ENABLE_RLS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^ENABLE\s+ROW\s+LEVEL\s+SECURITY").unwrap());
static RE_DISABLE_RLS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^DISABLE\s+ROW\s+LEVEL\s+SECURITY").unwrap());

/// Build the plan that undoes `forward`, given the schema before it ran.
///
/// The result carries no source hash: the schema it starts from is the
/// forward plan's target, which is not known here.
pub fn rollback(forward: &Plan, before: &Schema, driver: &dyn Driver) -> Plan {
    let mut plan = Plan::default();
    for step in forward.steps.iter().rev() {
        match reverse(step, before, driver) {
            Ok(steps) => plan.steps.extend(steps),
            Err(reason) => {
                warn!(step = %step.description, %reason, "step needs a manual rollback");
                plan.steps.push(manual(step, &reason));
            }
        }
    }
    plan
}

type Reversal = std::result::Result<Vec<PlanStep>, String>;

fn reverse(step: &PlanStep, before: &Schema, driver: &dyn Driver) -> Reversal {
    if step.is_comment_only() {
        return Ok(Vec::new());
    }
    let sql = step.first_sql().trim();

    if let Some(copy_columns) = recreated_columns(step) {
        let name = RE_CREATE_TABLE
            .captures(sql)
            .map(|c| c[1].trim_end_matches("_new").to_string())
            .unwrap_or_default();
        return reverse_recreate(&name, &copy_columns, before, driver);
    }
    if let Some(caps) = RE_CREATE_TABLE.captures(sql) {
        let step = driver.drop_table(&Table::new(&caps[1]));
        return Ok(vec![rollback_step(step)]);
    }
    if let Some(caps) = RE_DROP_TABLE.captures(sql) {
        return reverse_drop_table(&caps[1], before, driver);
    }
    if RE_CREATE_INDEX.is_match(sql) {
        let name = extract_index_name(sql);
        if name.is_empty() {
            return Err("index name not recognised".into());
        }
        return Ok(vec![PlanStep::new(
            format!("Rollback: Drop index {}", name),
            [format!("DROP INDEX {}", name)],
        )]);
    }
    if let Some(caps) = RE_DROP_INDEX.captures(sql) {
        let name = &caps[1];
        let (table, idx) = before
            .find_index(name)
            .ok_or_else(|| format!("index {} not found in the previous schema", name))?;
        return Ok(vec![rollback_step(driver.add_index(&table.name, idx))]);
    }
    if let Some(caps) = RE_ALTER_TABLE.captures(sql) {
        return reverse_alter(&caps[1], caps[2].trim(), before, driver);
    }

    Err("unrecognised statement".into())
}

fn reverse_alter(table: &str, action: &str, before: &Schema, driver: &dyn Driver) -> Reversal {
    let column = |name: &str| {
        before
            .find_column(table, name)
            .ok_or_else(|| format!("column {}.{} not found in the previous schema", table, name))
    };
    let single = |description: String, sql: String| Ok(vec![PlanStep::new(description, [sql])]);

    if let Some(caps) = RE_ADD_COLUMN.captures(action) {
        let name = &caps[1];
        return single(
            format!("Rollback: Drop column {} from table {}", name, table),
            format!("ALTER TABLE {} DROP COLUMN {}", table, name),
        );
    }
    if let Some(caps) = RE_DROP_COLUMN.captures(action) {
        let col = column(&caps[1])?;
        return Ok(vec![rollback_step(driver.add_column(table, col))]);
    }
    if let Some(caps) = RE_ALTER_TYPE.captures(action) {
        let col = column(&caps[1])?;
        return single(
            format!(
                "Rollback: Change type of {}.{} back to {}",
                table, col.name, col.data_type
            ),
            format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
                table, col.name, col.data_type
            ),
        );
    }
    if let Some(caps) = RE_SET_NOT_NULL.captures(action) {
        let name = &caps[1];
        return single(
            format!("Rollback: Allow nulls in {}.{}", table, name),
            format!("ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL", table, name),
        );
    }
    if let Some(caps) = RE_DROP_NOT_NULL.captures(action) {
        let name = &caps[1];
        return single(
            format!("Rollback: Require non-null in {}.{}", table, name),
            format!("ALTER TABLE {} ALTER COLUMN {} SET NOT NULL", table, name),
        );
    }
    if let Some(caps) = RE_SET_DEFAULT
        .captures(action)
        .or_else(|| RE_DROP_DEFAULT.captures(action))
    {
        let col = column(&caps[1])?;
        let sql = match &col.default {
            Some(default) => format!(
                "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                table, col.name, default
            ),
            None => format!("ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT", table, col.name),
        };
        return single(
            format!("Rollback: Restore default for {}.{}", table, col.name),
            sql,
        );
    }
    if RE_ADD_PRIMARY_KEY.is_match(action) {
        return single(
            format!("Rollback: Drop primary key from table {}", table),
            format!("ALTER TABLE {} DROP CONSTRAINT {}_pkey", table, table),
        );
    }
    if let Some(caps) = RE_ADD_CONSTRAINT.captures(action) {
        let name = &caps[1];
        let kind = if action.to_uppercase().contains("FOREIGN KEY") {
            "foreign key"
        } else {
            "constraint"
        };
        return single(
            format!("Rollback: Drop {} {} from table {}", kind, name, table),
            format!("ALTER TABLE {} DROP CONSTRAINT {}", table, name),
        );
    }
    if RE_VALIDATE_CONSTRAINT.is_match(action) {
        // Validation changes no definition.
        return Ok(Vec::new());
    }
    if let Some(caps) = RE_DROP_CONSTRAINT.captures(action) {
        return reverse_drop_constraint(table, &caps[1], before, driver);
    }
    if let Some(caps) = RE_RENAME_COLUMN.captures(action) {
        let (from, to) = (&caps[1], &caps[2]);
        return single(
            format!("Rollback: Rename column {}.{} back to {}", table, to, from),
            format!("ALTER TABLE {} RENAME COLUMN {} TO {}", table, to, from),
        );
    }
    if let Some(caps) = RE_RENAME_TABLE.captures(action) {
        let to = &caps[1];
        return single(
            format!("Rollback: Rename table {} back to {}", to, table),
            format!("ALTER TABLE {} RENAME TO {}", to, table),
        );
    }
    if RE_ENABLE_RLS.is_match(action) {
        return single(
            format!("Rollback: Disable row level security on table {}", table),
            format!("ALTER TABLE {} DISABLE ROW LEVEL SECURITY", table),
        );
    }
    if RE_DISABLE_RLS.is_match(action) {
        return single(
            format!("Rollback: Enable row level security on table {}", table),
            format!("ALTER TABLE {} ENABLE ROW LEVEL SECURITY", table),
        );
    }

    Err("unrecognised ALTER TABLE action".into())
}

fn reverse_drop_table(name: &str, before: &Schema, driver: &dyn Driver) -> Reversal {
    let table = before
        .table(name)
        .ok_or_else(|| format!("table {} not found in the previous schema", name))?;

    let mut step = rollback_step(driver.create_table(table));
    step.sql
        .extend(table.indexes.iter().map(|idx| index_sql(&table.name, idx)));
    if driver.supports_feature(crate::driver::Feature::AlterAddForeignKey) {
        step.sql.extend(table.foreign_keys.iter().map(|fk| {
            format!(
                "ALTER TABLE {} ADD CONSTRAINT {} {}",
                table.name,
                fk.name,
                fk_clause(fk)
            )
        }));
    }
    Ok(vec![step])
}

fn reverse_drop_constraint(table: &str, name: &str, before: &Schema, driver: &dyn Driver) -> Reversal {
    if let Some((owner, fk)) = before.find_foreign_key(name) {
        if owner.name != table {
            return Err(format!(
                "foreign key {} belongs to table {}, not {}",
                name, owner.name, table
            ));
        }
        return Ok(vec![rollback_step(driver.add_foreign_key(table, fk))]);
    }

    if name == format!("{}_pkey", table) {
        let pk: Vec<&str> = before
            .table(table)
            .map(|t| {
                t.columns
                    .iter()
                    .filter(|c| c.is_primary_key)
                    .map(|c| c.name.as_str())
                    .collect()
            })
            .unwrap_or_default();
        if !pk.is_empty() {
            return Ok(vec![PlanStep::new(
                format!("Rollback: Restore primary key on table {}", table),
                [format!("ALTER TABLE {} ADD PRIMARY KEY ({})", table, pk.join(", "))],
            )]);
        }
    }

    Err(format!("constraint {} not found in the previous schema", name))
}

/// Column list copied by a table-recreation step, if `step` is one.
fn recreated_columns(step: &PlanStep) -> Option<Vec<String>> {
    let recreates = step.is_table_rebuild()
        && RE_CREATE_TABLE
            .captures(step.first_sql())
            .is_some_and(|c| c[1].ends_with("_new"));
    if !recreates {
        return None;
    }

    let columns = step
        .sql
        .iter()
        .find_map(|s| RE_RECREATE_INSERT.captures(s))
        .map(|c| c[1].split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();
    Some(columns)
}

fn reverse_recreate(
    name: &str,
    copied: &[String],
    before: &Schema,
    driver: &dyn Driver,
) -> Reversal {
    let table = before
        .table(name)
        .ok_or_else(|| format!("table {} not found in the previous schema", name))?;
    // Columns added by the forward step have no data to bring back.
    let copy: Vec<String> = copied
        .iter()
        .filter(|c| table.find_column(c).is_some())
        .cloned()
        .collect();
    let step = driver
        .recreate_table(table, &copy)
        .ok_or_else(|| format!("{} cannot recreate tables", driver.name()))?;
    Ok(vec![rollback_step(step)])
}

fn rollback_step(mut step: PlanStep) -> PlanStep {
    step.description = format!("Rollback: {}", step.description);
    step
}

fn manual(step: &PlanStep, reason: &str) -> PlanStep {
    let statement = step.first_sql().lines().next().unwrap_or("").trim();
    PlanStep::new(
        format!("Rollback: manual rollback required for '{}'", step.description),
        [format!(
            "-- Manual rollback required ({}): {}",
            reason, statement
        )],
    )
}
