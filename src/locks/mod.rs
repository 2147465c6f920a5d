//! Lock analysis for migration steps.
//!
//! - [`detector`]: static classification of a step's DDL to a PostgreSQL lock mode
//! - [`measure`]: timing a step on a shadow database under a rolled-back transaction
//! - [`rewrite`]: lock-friendly alternatives for steps that block traffic

pub mod detector;
pub mod measure;
pub mod rewrite;

pub use detector::{analyze, annotate, detect};
pub use measure::{LockMeasurement, measure, measure_step_impact};
pub use rewrite::{SaferRewrite, inject_lock_timeout, lock_timeout_statement, synthesise};

use serde::{Deserialize, Serialize};

/// Table-level lock modes, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LockMode {
    #[serde(rename = "ACCESS SHARE")]
    AccessShare,
    #[serde(rename = "ROW SHARE")]
    RowShare,
    #[serde(rename = "ROW EXCLUSIVE")]
    RowExclusive,
    #[serde(rename = "SHARE UPDATE EXCLUSIVE")]
    ShareUpdateExclusive,
    #[serde(rename = "SHARE")]
    Share,
    #[serde(rename = "SHARE ROW EXCLUSIVE")]
    ShareRowExclusive,
    #[serde(rename = "EXCLUSIVE")]
    Exclusive,
    #[serde(rename = "ACCESS EXCLUSIVE")]
    AccessExclusive,
}

impl LockMode {
    pub const ALL: [LockMode; 8] = [
        LockMode::AccessShare,
        LockMode::RowShare,
        LockMode::RowExclusive,
        LockMode::ShareUpdateExclusive,
        LockMode::Share,
        LockMode::ShareRowExclusive,
        LockMode::Exclusive,
        LockMode::AccessExclusive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::AccessShare => "ACCESS SHARE",
            LockMode::RowShare => "ROW SHARE",
            LockMode::RowExclusive => "ROW EXCLUSIVE",
            LockMode::ShareUpdateExclusive => "SHARE UPDATE EXCLUSIVE",
            LockMode::Share => "SHARE",
            LockMode::ShareRowExclusive => "SHARE ROW EXCLUSIVE",
            LockMode::Exclusive => "EXCLUSIVE",
            LockMode::AccessExclusive => "ACCESS EXCLUSIVE",
        }
    }

    /// Only ACCESS EXCLUSIVE conflicts with plain SELECT.
    pub fn blocks_reads(&self) -> bool {
        *self == LockMode::AccessExclusive
    }

    /// SHARE and above conflict with ROW EXCLUSIVE (INSERT/UPDATE/DELETE).
    pub fn blocks_writes(&self) -> bool {
        *self >= LockMode::Share
    }

    pub fn impact_level(&self) -> ImpactLevel {
        match self {
            LockMode::AccessShare | LockMode::RowShare | LockMode::RowExclusive => ImpactLevel::None,
            LockMode::ShareUpdateExclusive => ImpactLevel::Low,
            LockMode::Share => ImpactLevel::Medium,
            LockMode::ShareRowExclusive | LockMode::Exclusive | LockMode::AccessExclusive => {
                ImpactLevel::High
            }
        }
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImpactLevel {
    None,
    Low,
    Medium,
    High,
}

impl std::fmt::Display for ImpactLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImpactLevel::None => write!(f, "NONE"),
            ImpactLevel::Low => write!(f, "LOW"),
            ImpactLevel::Medium => write!(f, "MEDIUM"),
            ImpactLevel::High => write!(f, "HIGH"),
        }
    }
}

/// Steps measured above this are treated as unsafe regardless of lock mode.
pub const SLOW_STEP_MS: u64 = 1000;

/// What a step does to concurrent traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockImpact {
    pub operation: String,
    pub lock_mode: LockMode,
    pub blocks_reads: bool,
    pub blocks_writes: bool,
    pub impact: ImpactLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_ms: Option<u64>,
    #[serde(default)]
    pub measured_on_shadow: bool,
    pub explanation: String,
}

impl LockImpact {
    fn slow(&self) -> bool {
        self.estimated_duration_ms.is_some_and(|ms| ms > SLOW_STEP_MS)
    }

    /// Medium impact or worse, or measured slower than a second.
    pub fn requires_safer_alternative(&self) -> bool {
        self.impact >= ImpactLevel::Medium || self.slow()
    }

    /// High impact, slow, or blocking writes. Missing measurements fall back to the mode.
    pub fn should_rewrite(&self) -> bool {
        self.impact == ImpactLevel::High || self.slow() || self.blocks_writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_mode_ordering() {
        for pair in LockMode::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_blocking_derivation() {
        for mode in LockMode::ALL {
            assert_eq!(mode.blocks_reads(), mode == LockMode::AccessExclusive);
            assert_eq!(mode.blocks_writes(), mode >= LockMode::Share);
        }
    }

    #[test]
    fn test_impact_table() {
        let expected = [
            ImpactLevel::None,
            ImpactLevel::None,
            ImpactLevel::None,
            ImpactLevel::Low,
            ImpactLevel::Medium,
            ImpactLevel::High,
            ImpactLevel::High,
            ImpactLevel::High,
        ];
        for (mode, level) in LockMode::ALL.iter().zip(expected) {
            assert_eq!(mode.impact_level(), level, "{mode}");
        }
    }

    #[test]
    fn test_lock_mode_serializes_as_sql_name() {
        assert_eq!(
            serde_json::to_string(&LockMode::ShareUpdateExclusive).unwrap(),
            "\"SHARE UPDATE EXCLUSIVE\""
        );
        assert_eq!(serde_json::to_string(&ImpactLevel::Medium).unwrap(), "\"MEDIUM\"");
    }

    fn impact(mode: LockMode, duration: Option<u64>) -> LockImpact {
        LockImpact {
            operation: "op".into(),
            lock_mode: mode,
            blocks_reads: mode.blocks_reads(),
            blocks_writes: mode.blocks_writes(),
            impact: mode.impact_level(),
            estimated_duration_ms: duration,
            measured_on_shadow: duration.is_some(),
            explanation: String::new(),
        }
    }

    #[test]
    fn test_requires_safer_alternative() {
        assert!(impact(LockMode::Share, None).requires_safer_alternative());
        assert!(!impact(LockMode::ShareUpdateExclusive, None).requires_safer_alternative());
        assert!(impact(LockMode::ShareUpdateExclusive, Some(1500)).requires_safer_alternative());
        assert!(!impact(LockMode::RowExclusive, Some(1000)).requires_safer_alternative());
    }

    #[test]
    fn test_should_rewrite() {
        assert!(impact(LockMode::AccessExclusive, None).should_rewrite());
        assert!(impact(LockMode::Share, None).should_rewrite());
        assert!(!impact(LockMode::ShareUpdateExclusive, Some(20)).should_rewrite());
        assert!(impact(LockMode::AccessShare, Some(2000)).should_rewrite());
    }
}
