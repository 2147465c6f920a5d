//! Error taxonomy for lockplan.
//!
//! - `Validation`: malformed schema, bad generator input, illegal phase transition
//! - `Drift`: plan source hash does not match the live schema
//! - `Execution`: a statement failed on the target
//! - `ShadowRejection`: the plan failed on the shadow database first
//! - `Measurement`: shadow timing could not be taken
//! - `State`: state file unreadable or corrupt

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(
        "source schema hash mismatch: plan expects {expected}, database is at {actual}; regenerate the plan"
    )]
    Drift { expected: String, actual: String },

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("shadow database rejected the plan: {0}")]
    ShadowRejection(String),

    #[error("measurement failed: {0}")]
    Measurement(String),

    #[error("state file {}: {reason}", path.display())]
    State { path: PathBuf, reason: String },

    #[error("unsupported database driver: {0}")]
    UnsupportedDriver(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
