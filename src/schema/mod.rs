//! Schema model shared by every stage of the pipeline.
//!
//! ```
//! use lockplan::schema::{Column, Index, Schema, Table};
//!
//! let mut schema = Schema::new();
//! schema.add_table(
//!     Table::new("users")
//!         .column(Column::new("id", "integer").primary_key())
//!         .column(Column::new("email", "text").not_null())
//!         .index(Index::new("idx_users_email", ["email"]).unique()),
//! );
//! assert!(schema.validate().is_empty());
//! ```
//!
//! Schemas load from JSON or YAML (see [`loader`]) using the same field
//! names the plan artifacts use.

pub mod hash;
pub mod loader;

pub use hash::hash;
pub use loader::{load_schema, parse_schema};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Error, Result};

/// Engine a schema was read from or written for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    Sqlite,
    #[default]
    Unknown,
}

impl Dialect {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Dialect::Unknown)
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::Postgres => write!(f, "postgres"),
            Dialect::Sqlite => write!(f, "sqlite"),
            Dialect::Unknown => write!(f, "unknown"),
        }
    }
}

/// A complete database schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default, skip_serializing_if = "Dialect::is_unknown")]
    pub dialect: Dialect,
}

/// A table definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub indexes: Vec<Index>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKey>,
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type", alias = "typ")]
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, alias = "primary_key")]
    pub is_primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_metadata: Option<TypeMetadata>,
}

/// Logical and surface forms of a column type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeMetadata {
    pub logical: String,
    pub raw: String,
    #[serde(default)]
    pub dialect: Dialect,
}

/// An index definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

/// A foreign key constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_update: Option<String>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn add_table(&mut self, table: Table) {
        self.tables.push(table);
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn find_column(&self, table: &str, column: &str) -> Option<&Column> {
        self.table(table)?.find_column(column)
    }

    /// Index lookup by name across all tables; returns the owning table too.
    pub fn find_index(&self, name: &str) -> Option<(&Table, &Index)> {
        self.tables
            .iter()
            .find_map(|t| t.indexes.iter().find(|i| i.name == name).map(|i| (t, i)))
    }

    pub fn find_foreign_key(&self, name: &str) -> Option<(&Table, &ForeignKey)> {
        self.tables.iter().find_map(|t| {
            t.foreign_keys
                .iter()
                .find(|fk| fk.name == name)
                .map(|fk| (t, fk))
        })
    }

    /// Check the model for consistency. Returns one message per problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut table_names = HashSet::new();

        for table in &self.tables {
            if table.name.trim().is_empty() {
                problems.push("table with empty name".to_string());
            }
            if !table_names.insert(table.name.as_str()) {
                problems.push(format!("duplicate table {}", table.name));
            }

            let mut column_names = HashSet::new();
            for col in &table.columns {
                if !column_names.insert(col.name.as_str()) {
                    problems.push(format!("duplicate column {}.{}", table.name, col.name));
                }
                if col.data_type.trim().is_empty() {
                    problems.push(format!("column {}.{} has no type", table.name, col.name));
                }
            }

            let mut index_names = HashSet::new();
            for idx in &table.indexes {
                if !index_names.insert(idx.name.as_str()) {
                    problems.push(format!("duplicate index {} on {}", idx.name, table.name));
                }
                if idx.columns.is_empty() {
                    problems.push(format!("index {} has no columns", idx.name));
                }
                for col in &idx.columns {
                    if !column_names.contains(col.as_str()) {
                        problems.push(format!(
                            "index {} references missing column {}.{}",
                            idx.name, table.name, col
                        ));
                    }
                }
            }

            let mut fk_names = HashSet::new();
            for fk in &table.foreign_keys {
                if !fk_names.insert(fk.name.as_str()) {
                    problems.push(format!("duplicate foreign key {} on {}", fk.name, table.name));
                }
                if fk.columns.len() != fk.referenced_columns.len() {
                    problems.push(format!(
                        "foreign key {} has {} columns but references {}",
                        fk.name,
                        fk.columns.len(),
                        fk.referenced_columns.len()
                    ));
                }
                for col in &fk.columns {
                    if !column_names.contains(col.as_str()) {
                        problems.push(format!(
                            "foreign key {} uses missing column {}.{}",
                            fk.name, table.name, col
                        ));
                    }
                }
                if self.table(&fk.referenced_table).is_none() {
                    problems.push(format!(
                        "foreign key {} references unknown table {}",
                        fk.name, fk.referenced_table
                    ));
                }
            }
        }

        problems
    }

    /// Like [`Schema::validate`] but folds problems into one error.
    pub fn ensure_valid(&self) -> Result<()> {
        let problems = self.validate();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(problems.join("; ")))
        }
    }
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    pub fn column(mut self, col: Column) -> Self {
        self.columns.push(col);
        self
    }

    pub fn index(mut self, idx: Index) -> Self {
        self.indexes.push(idx);
        self
    }

    pub fn foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    pub fn find_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            is_primary_key: false,
            default: None,
            type_metadata: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.nullable = false;
        self
    }

    pub fn default(mut self, val: impl Into<String>) -> Self {
        self.default = Some(val.into());
        self
    }

    pub fn with_metadata(mut self, logical: impl Into<String>, dialect: Dialect) -> Self {
        self.type_metadata = Some(TypeMetadata {
            logical: logical.into(),
            raw: self.data_type.clone(),
            dialect,
        });
        self
    }

    /// Normalized type used for comparison and hashing.
    pub fn logical_type(&self) -> String {
        match &self.type_metadata {
            Some(meta) if !meta.logical.is_empty() => normalize_type(&meta.logical),
            _ => normalize_type(&self.data_type),
        }
    }
}

/// Lowercase a type name and fold common aliases onto one spelling.
///
/// Length and precision modifiers are kept: `VARCHAR(255)` and
/// `character varying(255)` both become `varchar(255)`.
pub fn normalize_type(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    let (base, modifier) = match lower.find('(') {
        Some(pos) => (lower[..pos].trim_end(), &lower[pos..]),
        None => (lower.as_str(), ""),
    };
    let base = base.split_whitespace().collect::<Vec<_>>().join(" ");

    let canonical = match base.as_str() {
        "int" | "int4" | "integer" => "integer",
        "int8" | "bigint" => "bigint",
        "int2" | "smallint" => "smallint",
        "serial4" | "serial" => "serial",
        "serial8" | "bigserial" => "bigserial",
        "bool" | "boolean" => "boolean",
        "float8" | "double precision" | "double" => "double precision",
        "float4" | "real" => "real",
        "decimal" | "numeric" => "numeric",
        "character varying" | "varchar" => "varchar",
        "character" | "char" | "bpchar" => "char",
        "timestamp without time zone" | "timestamp" => "timestamp",
        "timestamp with time zone" | "timestamptz" => "timestamptz",
        "time without time zone" | "time" => "time",
        "time with time zone" | "timetz" => "timetz",
        other => other,
    };
    format!("{}{}", canonical, modifier.replace(' ', ""))
}

impl Index {
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

impl ForeignKey {
    pub fn new<I, J, S, T>(
        name: impl Into<String>,
        columns: I,
        referenced_table: impl Into<String>,
        referenced_columns: J,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            referenced_table: referenced_table.into(),
            referenced_columns: referenced_columns.into_iter().map(Into::into).collect(),
            on_delete: None,
            on_update: None,
        }
    }

    pub fn on_delete(mut self, action: impl Into<String>) -> Self {
        self.on_delete = Some(action.into());
        self
    }

    pub fn on_update(mut self, action: impl Into<String>) -> Self {
        self.on_update = Some(action.into());
        self
    }
}
