//! Lock-aware schema migrations.
//!
//! lockplan diffs a desired schema against a live one and produces an
//! ordered migration plan. Each step is classified by the table lock it
//! takes; blocking steps get safer rewrites, changes that would break
//! deployed code become multi-phase workflows, and plans are dry-run on a
//! shadow database before they touch the target.
//!
//! ```
//! use lockplan::diff::diff;
//! use lockplan::driver::PostgresDriver;
//! use lockplan::schema::{Column, Schema, Table};
//!
//! let before = Schema::new();
//! let mut after = Schema::new();
//! after.add_table(Table::new("users").column(Column::new("id", "integer").primary_key()));
//!
//! let plan = lockplan::planner::generate(&diff(&before, &after), Some(&before), &PostgresDriver)?;
//! assert_eq!(plan.steps.len(), 1);
//! # Ok::<(), lockplan::Error>(())
//! ```

pub mod commands;
pub mod config;
pub mod db;
pub mod diff;
pub mod driver;
pub mod error;
pub mod executor;
pub mod locks;
pub mod multiphase;
pub mod plan;
pub mod planner;
pub mod rollback;
pub mod schema;
pub mod state;

pub use error::{Error, Result};
