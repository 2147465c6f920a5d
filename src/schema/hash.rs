//! Deterministic content hash of a schema.
//!
//! The schema is rendered to a canonical JSON document (everything sorted by
//! name, logical types lowercased, absent defaults omitted) and hashed with
//! SHA-256. Plans record this hash so the executor can detect drift.

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use super::{Column, ForeignKey, Index, Schema, Table};
use crate::error::Result;

/// Hash a schema. `None` hashes the same as a schema with no tables.
pub fn hash(schema: Option<&Schema>) -> Result<String> {
    let canonical = match schema {
        Some(schema) => canonicalize(schema),
        None => json!({ "tables": [] }),
    };
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

impl Schema {
    pub fn content_hash(&self) -> Result<String> {
        hash(Some(self))
    }
}

fn canonicalize(schema: &Schema) -> Value {
    let mut tables: Vec<&Table> = schema.tables.iter().collect();
    tables.sort_by(|a, b| a.name.cmp(&b.name));

    json!({ "tables": tables.into_iter().map(canonical_table).collect::<Vec<_>>() })
}

fn canonical_table(table: &Table) -> Value {
    let mut map = Map::new();
    map.insert("name".into(), json!(table.name));

    let mut columns: Vec<&Column> = table.columns.iter().collect();
    columns.sort_by(|a, b| a.name.cmp(&b.name));
    map.insert(
        "columns".into(),
        Value::Array(columns.into_iter().map(canonical_column).collect()),
    );

    if !table.indexes.is_empty() {
        let mut indexes: Vec<&Index> = table.indexes.iter().collect();
        indexes.sort_by(|a, b| a.name.cmp(&b.name));
        let indexes = indexes
            .into_iter()
            .map(|idx| json!({ "name": idx.name, "columns": idx.columns, "unique": idx.unique }))
            .collect();
        map.insert("indexes".into(), Value::Array(indexes));
    }

    if !table.foreign_keys.is_empty() {
        let mut fks: Vec<&ForeignKey> = table.foreign_keys.iter().collect();
        fks.sort_by(|a, b| a.name.cmp(&b.name));
        map.insert(
            "foreign_keys".into(),
            Value::Array(fks.into_iter().map(canonical_foreign_key).collect()),
        );
    }

    Value::Object(map)
}

fn canonical_column(col: &Column) -> Value {
    let mut map = Map::new();
    map.insert("name".into(), json!(col.name));
    map.insert("type".into(), json!(col.logical_type()));
    map.insert("nullable".into(), json!(col.nullable));
    map.insert("is_primary_key".into(), json!(col.is_primary_key));
    if let Some(default) = &col.default {
        map.insert("default".into(), json!(default));
    }
    Value::Object(map)
}

fn canonical_foreign_key(fk: &ForeignKey) -> Value {
    let mut map = Map::new();
    map.insert("name".into(), json!(fk.name));
    map.insert("columns".into(), json!(fk.columns));
    map.insert("referenced_table".into(), json!(fk.referenced_table));
    map.insert("referenced_columns".into(), json!(fk.referenced_columns));
    if let Some(action) = &fk.on_delete {
        map.insert("on_delete".into(), json!(action));
    }
    if let Some(action) = &fk.on_update {
        map.insert("on_update".into(), json!(action));
    }
    Value::Object(map)
}
