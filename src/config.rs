//! `lockplan.toml` configuration.
//!
//! ```toml
//! default_environment = "local"
//! lock_timeout_seconds = 5
//! schema_path = "schema"
//!
//! [environments.local]
//! database_url = "postgres://localhost/app"
//! shadow_database_url = "postgres://localhost/app_shadow"
//! ```
//!
//! The file is found by walking up from the working directory, stopping at
//! the project root. A global `<config_dir>/lockplan/config.toml` is used
//! when no project file exists.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::state::STATE_FILE;

pub const CONFIG_FILE: &str = "lockplan.toml";

const PROJECT_MARKERS: [&str; 4] = [".git", "Cargo.toml", "package.json", "go.mod"];

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub default_environment: Option<String>,
    pub lock_timeout_seconds: Option<i64>,
    pub schema_path: Option<String>,
    pub environments: BTreeMap<String, EnvironmentConfig>,
    /// File this config was read from.
    #[serde(skip)]
    pub path: Option<PathBuf>,
    /// Directory holding the state file.
    #[serde(skip)]
    pub project_root: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    #[serde(alias = "postgres_url")]
    pub database_url: Option<String>,
    pub shadow_database_url: Option<String>,
    pub schema_path: Option<String>,
}

impl Config {
    /// Discover configuration from the working directory.
    pub fn load() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        Self::discover(&cwd, global_config_path().as_deref())
    }

    /// Walk up from `start` looking for `lockplan.toml`, falling back to `global`.
    pub fn discover(start: &Path, global: Option<&Path>) -> Result<Self> {
        let root = project_root(start);
        if let Some(path) = find_config(start) {
            let mut config = Self::load_from(&path)?;
            config.project_root = path.parent().map(Path::to_path_buf).unwrap_or(root);
            return Ok(config);
        }

        let mut config = match global.filter(|p| p.is_file()) {
            Some(path) => Self::load_from(path)?,
            None => Self::default(),
        };
        config.project_root = root;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.path = Some(path.to_path_buf());
        config.project_root = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn state_path(&self) -> PathBuf {
        self.project_root.join(STATE_FILE)
    }

    /// Named environment, or the default one when `name` is `None`.
    pub fn environment(&self, name: Option<&str>) -> Result<Option<&EnvironmentConfig>> {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .or(self.default_environment.as_deref());
        match name {
            None => Ok(None),
            Some(name) => self
                .environments
                .get(name)
                .map(Some)
                .ok_or_else(|| Error::Config(format!("environment '{}' not defined in {}", name, CONFIG_FILE))),
        }
    }

    /// Target connection: explicit value (flag or env var), then environment.
    pub fn resolve_target(&self, explicit: Option<&str>, environment: Option<&str>) -> Result<String> {
        if let Some(url) = non_empty(explicit) {
            return Ok(url.to_string());
        }
        self.environment(environment)?
            .and_then(|env| non_empty(env.database_url.as_deref()))
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Config(
                    "no target database: pass --target, set LOCKPLAN_DATABASE_URL or define an environment in lockplan.toml"
                        .into(),
                )
            })
    }

    /// Shadow connection, if any is configured.
    pub fn resolve_shadow(&self, explicit: Option<&str>, environment: Option<&str>) -> Result<Option<String>> {
        if let Some(url) = non_empty(explicit) {
            return Ok(Some(url.to_string()));
        }
        Ok(self
            .environment(environment)?
            .and_then(|env| non_empty(env.shadow_database_url.as_deref()))
            .map(str::to_string))
    }

    /// Schema location, relative paths resolved against the project root.
    pub fn resolve_schema_path(&self, explicit: Option<&Path>, environment: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            return Ok(Some(path.to_path_buf()));
        }
        let configured = self
            .environment(environment)?
            .and_then(|env| non_empty(env.schema_path.as_deref()))
            .or(non_empty(self.schema_path.as_deref()));
        Ok(configured.map(|p| {
            let path = PathBuf::from(p);
            if path.is_absolute() {
                path
            } else {
                self.project_root.join(path)
            }
        }))
    }

    /// Explicit timeout wins over the configured one.
    pub fn lock_timeout(&self, explicit: Option<i64>) -> Option<i64> {
        explicit.or(self.lock_timeout_seconds).filter(|s| *s > 0)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn is_project_root(dir: &Path) -> bool {
    PROJECT_MARKERS.iter().any(|marker| dir.join(marker).exists())
}

fn find_config(start: &Path) -> Option<PathBuf> {
    for dir in start.ancestors() {
        let candidate = dir.join(CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        if is_project_root(dir) {
            break;
        }
    }
    None
}

/// Nearest ancestor carrying a project marker, else `start`.
pub fn project_root(start: &Path) -> PathBuf {
    start
        .ancestors()
        .find(|dir| is_project_root(dir))
        .unwrap_or(start)
        .to_path_buf()
}

fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("lockplan").join("config.toml"))
}
