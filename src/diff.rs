//! Schema diff engine.
//!
//! Pairs tables, columns, indexes and foreign keys by name. Every bucket is
//! sorted by name so the plans built from a diff are reproducible.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::schema::{Column, ForeignKey, Index, Schema, Table};

/// Differences between two schemas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDiff {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added_tables: Vec<Table>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_tables: Vec<Table>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modified_tables: Vec<TableDiff>,
}

/// Changes within a single table present on both sides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableDiff {
    pub table_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added_columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modified_columns: Vec<ColumnDiff>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added_indexes: Vec<Index>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_indexes: Vec<Index>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added_foreign_keys: Vec<ForeignKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_foreign_keys: Vec<ForeignKey>,
}

/// Attribute of a column tracked by the diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnChange {
    Type,
    Nullable,
    Default,
    PrimaryKey,
}

impl std::fmt::Display for ColumnChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnChange::Type => write!(f, "type"),
            ColumnChange::Nullable => write!(f, "nullable"),
            ColumnChange::Default => write!(f, "default"),
            ColumnChange::PrimaryKey => write!(f, "primary_key"),
        }
    }
}

/// A column present on both sides whose tracked attributes differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDiff {
    pub column_name: String,
    pub old: Column,
    pub new: Column,
    pub changes: Vec<ColumnChange>,
}

impl ColumnDiff {
    pub fn has(&self, change: ColumnChange) -> bool {
        self.changes.contains(&change)
    }
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.added_tables.is_empty()
            && self.removed_tables.is_empty()
            && self.modified_tables.is_empty()
    }
}

impl TableDiff {
    pub fn is_empty(&self) -> bool {
        self.added_columns.is_empty()
            && self.removed_columns.is_empty()
            && self.modified_columns.is_empty()
            && self.added_indexes.is_empty()
            && self.removed_indexes.is_empty()
            && self.added_foreign_keys.is_empty()
            && self.removed_foreign_keys.is_empty()
    }
}

/// Compute the changes needed to turn `before` into `after`.
pub fn diff(before: &Schema, after: &Schema) -> SchemaDiff {
    let old_tables = by_name(&before.tables, |t| &t.name);
    let new_tables = by_name(&after.tables, |t| &t.name);

    let mut result = SchemaDiff::default();

    for (name, new_table) in &new_tables {
        match old_tables.get(name) {
            None => result.added_tables.push((*new_table).clone()),
            Some(old_table) => {
                let table_diff = diff_tables(old_table, new_table);
                if !table_diff.is_empty() {
                    result.modified_tables.push(table_diff);
                }
            }
        }
    }

    for (name, old_table) in &old_tables {
        if !new_tables.contains_key(name) {
            result.removed_tables.push((*old_table).clone());
        }
    }

    result
}

fn diff_tables(old: &Table, new: &Table) -> TableDiff {
    let mut result = TableDiff {
        table_name: old.name.clone(),
        ..Default::default()
    };

    let old_cols = by_name(&old.columns, |c| &c.name);
    let new_cols = by_name(&new.columns, |c| &c.name);
    for (name, new_col) in &new_cols {
        match old_cols.get(name) {
            None => result.added_columns.push((*new_col).clone()),
            Some(old_col) => {
                if let Some(col_diff) = diff_columns(old_col, new_col) {
                    result.modified_columns.push(col_diff);
                }
            }
        }
    }
    for (name, old_col) in &old_cols {
        if !new_cols.contains_key(name) {
            result.removed_columns.push((*old_col).clone());
        }
    }

    // Same name but different definition is a drop plus a create.
    let (added, removed) = pair_by_name(&old.indexes, &new.indexes, |i| &i.name);
    result.added_indexes = added;
    result.removed_indexes = removed;

    let (added, removed) = pair_by_name(&old.foreign_keys, &new.foreign_keys, |fk| &fk.name);
    result.added_foreign_keys = added;
    result.removed_foreign_keys = removed;

    result
}

fn diff_columns(old: &Column, new: &Column) -> Option<ColumnDiff> {
    let mut changes = Vec::new();
    if old.logical_type() != new.logical_type() {
        changes.push(ColumnChange::Type);
    }
    if old.nullable != new.nullable {
        changes.push(ColumnChange::Nullable);
    }
    if old.default != new.default {
        changes.push(ColumnChange::Default);
    }
    if old.is_primary_key != new.is_primary_key {
        changes.push(ColumnChange::PrimaryKey);
    }

    if changes.is_empty() {
        return None;
    }

    Some(ColumnDiff {
        column_name: old.name.clone(),
        old: old.clone(),
        new: new.clone(),
        changes,
    })
}

fn by_name<'a, T>(items: &'a [T], name: impl Fn(&T) -> &String) -> BTreeMap<&'a str, &'a T> {
    items.iter().map(|item| (name(item).as_str(), item)).collect()
}

fn pair_by_name<T: Clone + PartialEq>(
    old: &[T],
    new: &[T],
    name: impl Fn(&T) -> &String + Copy,
) -> (Vec<T>, Vec<T>) {
    let old_map = by_name(old, name);
    let new_map = by_name(new, name);

    let mut added = Vec::new();
    for (n, &item) in &new_map {
        if old_map.get(n).is_none_or(|&o| o != item) {
            added.push(item.clone());
        }
    }

    let mut removed = Vec::new();
    for (n, &item) in &old_map {
        if new_map.get(n).is_none_or(|&o| o != item) {
            removed.push(item.clone());
        }
    }

    (added, removed)
}
