//! Progress of the in-flight multi-phase migration.
//!
//! The state file is rewritten in full on every transition: the new content
//! goes to `<path>.tmp` and is renamed over `<path>`, so a reader sees either
//! the old or the new state, never a partial write. The temp file is synced
//! to disk before the rename.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{Error, Result};

/// File name, relative to the project root.
pub const STATE_FILE: &str = ".lockplan-state.json";

const VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_migration: Option<ActiveMigration>,
    #[serde(skip)]
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveMigration {
    pub id: String,
    pub operation: String,
    pub pattern: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub total_phases: u32,
    /// Last completed phase; 0 before phase 1 has run.
    pub current_phase: u32,
    pub phases_completed: Vec<u32>,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub plan_path: String,
}

/// Identity of a migration passed to [`State::start`].
#[derive(Debug, Clone)]
pub struct NewMigration {
    pub id: String,
    pub operation: String,
    pub pattern: String,
    pub table: String,
    pub column: Option<String>,
    pub total_phases: u32,
    pub plan_path: String,
}

impl State {
    /// Read the state at `path`. A missing file is an empty state.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self {
                    version: VERSION.to_string(),
                    active_migration: None,
                    path,
                });
            }
            Err(e) => {
                return Err(Error::State {
                    path,
                    reason: format!("failed to read: {}", e),
                });
            }
        };

        let mut state: State = serde_json::from_str(&content).map_err(|e| Error::State {
            path: path.clone(),
            reason: format!("failed to parse: {}", e),
        })?;
        state.path = path;
        Ok(state)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write to a sibling temp file, then rename over the state file.
    pub fn save(&self) -> Result<()> {
        let state_err = |reason: String| Error::State {
            path: self.path.clone(),
            reason,
        };

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| state_err(format!("failed to create directory: {}", e)))?;
        }

        let data = serde_json::to_string_pretty(self)?;
        let tmp = tmp_path(&self.path);
        let mut file =
            File::create(&tmp).map_err(|e| state_err(format!("failed to create: {}", e)))?;
        file.write_all(data.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| state_err(format!("failed to write: {}", e)))?;
        drop(file);
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| state_err(format!("failed to save: {}", e)))?;
        Ok(())
    }

    /// Begin tracking a migration at phase 0.
    pub fn start(&mut self, migration: NewMigration) -> Result<()> {
        if let Some(active) = &self.active_migration {
            return Err(Error::State {
                path: self.path.clone(),
                reason: format!(
                    "cannot start migration: another migration is already in progress ({})",
                    active.id
                ),
            });
        }

        let now = Utc::now();
        info!(id = %migration.id, phases = migration.total_phases, "starting multi-phase migration");
        self.active_migration = Some(ActiveMigration {
            id: migration.id,
            operation: migration.operation,
            pattern: migration.pattern,
            table: migration.table,
            column: migration.column,
            total_phases: migration.total_phases,
            current_phase: 0,
            phases_completed: Vec::new(),
            started_at: now,
            last_updated: now,
            plan_path: migration.plan_path,
        });
        self.save()
    }

    /// Whether phase `n` may run now.
    pub fn can_execute(&self, n: u32) -> Result<()> {
        match &self.active_migration {
            None if n == 1 => Ok(()),
            None => Err(Error::validation("no active migration: start with phase 1")),
            Some(m) => m.can_execute(n),
        }
    }

    /// Record phase `n` as done. Completing the last phase clears the migration.
    pub fn complete(&mut self, n: u32) -> Result<()> {
        let Some(migration) = self.active_migration.as_mut() else {
            return Err(Error::validation("no active migration"));
        };
        migration.complete(n)?;
        info!(phase = n, total = migration.total_phases, "phase complete");
        if migration.current_phase >= migration.total_phases {
            info!(id = %migration.id, "multi-phase migration finished");
            self.active_migration = None;
        }
        self.save()
    }

    /// Undo phase `n`, which must be the current phase.
    pub fn rollback(&mut self, n: u32) -> Result<()> {
        let Some(migration) = self.active_migration.as_mut() else {
            return Err(Error::validation("no active migration"));
        };
        migration.rollback(n)?;
        info!(phase = n, "phase rolled back");
        self.save()
    }

    /// 1 with no active migration, 0 once every phase is done.
    pub fn next_phase(&self) -> u32 {
        match &self.active_migration {
            None => 1,
            Some(m) if m.current_phase >= m.total_phases => 0,
            Some(m) => m.current_phase + 1,
        }
    }

    /// Drop the active migration without completing it.
    pub fn clear(&mut self) -> Result<()> {
        self.active_migration = None;
        self.save()
    }
}

impl ActiveMigration {
    pub fn is_completed(&self, n: u32) -> bool {
        self.phases_completed.contains(&n)
    }

    fn can_execute(&self, n: u32) -> Result<()> {
        if n == 0 {
            return Err(Error::validation("phases are numbered from 1"));
        }
        if self.is_completed(n) {
            return Err(Error::validation(format!("phase {} already completed", n)));
        }
        if n == self.current_phase || n == self.current_phase + 1 {
            return Ok(());
        }
        if n < self.current_phase {
            return Err(Error::validation(format!(
                "phase {} already completed (current phase: {})",
                n, self.current_phase
            )));
        }
        Err(Error::validation(format!(
            "cannot skip to phase {}: must complete phase {} first",
            n,
            self.current_phase + 1
        )))
    }

    fn complete(&mut self, n: u32) -> Result<()> {
        if n != self.current_phase && n != self.current_phase + 1 {
            return Err(Error::validation(format!(
                "cannot complete phase {}: current phase is {}",
                n, self.current_phase
            )));
        }
        if n == 0 || n > self.total_phases {
            return Err(Error::validation(format!(
                "phase {} is out of range 1..={}",
                n, self.total_phases
            )));
        }
        if !self.is_completed(n) {
            self.phases_completed.push(n);
        }
        self.current_phase = n;
        self.last_updated = Utc::now();
        Ok(())
    }

    fn rollback(&mut self, n: u32) -> Result<()> {
        if n == 0 || n != self.current_phase {
            return Err(Error::validation(format!(
                "cannot roll back phase {}: current phase is {}",
                n, self.current_phase
            )));
        }
        self.phases_completed.retain(|&p| p != n);
        self.current_phase = n - 1;
        self.last_updated = Utc::now();
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn migration(total: u32) -> NewMigration {
        NewMigration {
            id: "rename_column_users_1".into(),
            operation: "rename_column".into(),
            pattern: "expand_contract".into(),
            table: "users".into(),
            column: Some("email".into()),
            total_phases: total,
            plan_path: "rename.json".into(),
        }
    }

    fn fresh() -> (TempDir, State) {
        let dir = TempDir::new().unwrap();
        let state = State::load(dir.path().join(STATE_FILE)).unwrap();
        (dir, state)
    }

    #[test]
    fn test_missing_file_is_empty_state() {
        let (_dir, state) = fresh();
        assert_eq!(state.version, "1");
        assert!(state.active_migration.is_none());
        assert_eq!(state.next_phase(), 1);
    }

    #[test]
    fn test_malformed_file_is_state_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STATE_FILE);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(State::load(&path), Err(Error::State { .. })));
    }

    #[test]
    fn test_phase_sequence() {
        let (_dir, mut state) = fresh();
        state.can_execute(1).unwrap();
        assert!(state.can_execute(2).is_err());

        state.start(migration(3)).unwrap();
        assert!(state.start(migration(3)).is_err());

        state.complete(1).unwrap();
        assert!(state.can_execute(1).is_err());
        assert!(state.can_execute(3).is_err());
        state.can_execute(2).unwrap();
        assert_eq!(state.next_phase(), 2);

        state.complete(2).unwrap();
        state.complete(2).unwrap();
        assert_eq!(
            state.active_migration.as_ref().unwrap().phases_completed,
            vec![1, 2]
        );

        state.complete(3).unwrap();
        assert!(state.active_migration.is_none());
        assert_eq!(state.next_phase(), 1);
    }

    #[test]
    fn test_cannot_skip_ahead() {
        let (_dir, mut state) = fresh();
        state.start(migration(3)).unwrap();
        state.complete(1).unwrap();

        let err = state.can_execute(3).unwrap_err();
        assert_eq!(
            err.to_string(),
            "validation failed: cannot skip to phase 3: must complete phase 2 first"
        );
        assert!(state.complete(3).is_err());
    }

    #[test]
    fn test_phase_zero_never_executes() {
        let (_dir, mut state) = fresh();
        assert!(state.can_execute(0).is_err());

        state.start(migration(3)).unwrap();
        assert_eq!(state.active_migration.as_ref().unwrap().current_phase, 0);
        let err = state.can_execute(0).unwrap_err();
        assert_eq!(err.to_string(), "validation failed: phases are numbered from 1");
        state.can_execute(1).unwrap();
    }

    #[test]
    fn test_save_replaces_stale_temp_file() {
        let (dir, mut state) = fresh();
        let tmp = dir.path().join(format!("{}.tmp", STATE_FILE));
        std::fs::write(&tmp, "x".repeat(4096)).unwrap();

        state.start(migration(2)).unwrap();

        assert!(!tmp.exists());
        let content = std::fs::read_to_string(dir.path().join(STATE_FILE)).unwrap();
        let saved: State = serde_json::from_str(&content).unwrap();
        assert_eq!(saved.active_migration.unwrap().id, "rename_column_users_1");
    }

    #[test]
    fn test_rollback_steps_back_one_phase() {
        let (_dir, mut state) = fresh();
        state.start(migration(3)).unwrap();
        state.complete(1).unwrap();
        state.complete(2).unwrap();

        assert!(state.rollback(1).is_err());
        state.rollback(2).unwrap();

        let active = state.active_migration.as_ref().unwrap();
        assert_eq!(active.current_phase, 1);
        assert_eq!(active.phases_completed, vec![1]);
        state.can_execute(2).unwrap();
    }

    #[test]
    fn test_every_transition_is_persisted() {
        let (dir, mut state) = fresh();
        state.start(migration(3)).unwrap();
        state.complete(1).unwrap();

        let reloaded = State::load(dir.path().join(STATE_FILE)).unwrap();
        assert_eq!(reloaded, state);
        assert_eq!(reloaded.active_migration.unwrap().current_phase, 1);
        assert!(!dir.path().join(format!("{}.tmp", STATE_FILE)).exists());
    }

    #[test]
    fn test_interrupted_save_keeps_previous_state() {
        let (dir, mut state) = fresh();
        state.start(migration(3)).unwrap();
        state.complete(1).unwrap();

        // A crash between the temp write and the rename leaves a partial temp file.
        let tmp = dir.path().join(format!("{}.tmp", STATE_FILE));
        std::fs::write(&tmp, r#"{"version":"1","active_migration":{"id":"#).unwrap();

        let recovered = State::load(dir.path().join(STATE_FILE)).unwrap();
        assert_eq!(recovered.active_migration.as_ref().unwrap().current_phase, 1);

        let mut recovered = recovered;
        recovered.complete(2).unwrap();
        let reloaded = State::load(dir.path().join(STATE_FILE)).unwrap();
        assert_eq!(reloaded.active_migration.unwrap().current_phase, 2);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Advance,
        Retreat,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Advance), Just(Op::Retreat)]
    }

    proptest! {
        #[test]
        fn prop_legal_transitions_move_by_one(total in 1u32..8, ops in prop::collection::vec(op(), 0..40)) {
            let now = Utc::now();
            let mut m = ActiveMigration {
                id: "m".into(),
                operation: "op".into(),
                pattern: "deprecation".into(),
                table: "t".into(),
                column: None,
                total_phases: total,
                current_phase: 0,
                phases_completed: Vec::new(),
                started_at: now,
                last_updated: now,
                plan_path: "p.json".into(),
            };

            for op in ops {
                let before = m.current_phase;
                let moved = match op {
                    Op::Advance if before < total => {
                        m.can_execute(before + 1).unwrap();
                        m.complete(before + 1).is_ok()
                    }
                    Op::Retreat if before > 0 => m.rollback(before).is_ok(),
                    _ => false,
                };

                if moved {
                    prop_assert_eq!(before.abs_diff(m.current_phase), 1);
                } else {
                    prop_assert_eq!(before, m.current_phase);
                }
                prop_assert!(m.current_phase <= total);
                prop_assert!(m.phases_completed.iter().all(|&p| p >= 1 && p <= m.current_phase));
            }
        }
    }
}
