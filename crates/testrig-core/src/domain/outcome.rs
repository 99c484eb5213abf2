//! Run outcomes and per-attempt records.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::BatchPlan;

/// Final result of a run. Always returned as a value, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed { reason: String },
    Skipped { reason: String },
}

impl RunOutcome {
    /// A failed run with a human-readable reason.
    pub fn failed(reason: impl Into<String>) -> Self {
        RunOutcome::Failed {
            reason: reason.into(),
        }
    }

    /// A run that had nothing to do, with the reason.
    pub fn skipped(reason: impl Into<String>) -> Self {
        RunOutcome::Skipped {
            reason: reason.into(),
        }
    }

    /// True only for `Succeeded`; a skipped run is neither success nor failure.
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RunOutcome::Failed { .. })
    }

    /// Reason carried by `Failed` and `Skipped`.
    pub fn reason(&self) -> Option<&str> {
        match self {
            RunOutcome::Succeeded => None,
            RunOutcome::Failed { reason } | RunOutcome::Skipped { reason } => Some(reason),
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Succeeded => write!(f, "succeeded"),
            RunOutcome::Failed { reason } => write!(f, "failed: {reason}"),
            RunOutcome::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

/// How the engine received its arguments for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptMode {
    ArgumentList { args: Vec<String> },
    ResponseFile { path: PathBuf },
}

/// One engine invocation and what it reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    /// 0 for the initial run, 1.. for reruns.
    pub attempt: u32,
    pub mode: AttemptMode,
    pub exit_code: i32,
    pub failed_test_ids: BTreeSet<String>,
    pub total_tests: usize,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

impl ExecutionAttempt {
    /// Clean exit and no failing test left.
    pub fn passed(&self) -> bool {
        self.exit_code == 0 && self.failed_test_ids.is_empty()
    }

    /// Whether this attempt reran earlier failures.
    pub fn is_rerun(&self) -> bool {
        self.attempt > 0
    }
}

/// How the set of tests to run was decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectionSummary {
    Full,
    Fallback { reason: String },
    NoImpactedTests,
    Impacted { clauses: usize },
    Slice { slices: Vec<usize> },
    NothingToRun,
}

/// Summary of a complete run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub attempts: Vec<ExecutionAttempt>,
    pub discovered: usize,
    pub selection: SelectionSummary,
    pub plan: Option<BatchPlan>,
    pub config_digest: String,
    pub duration_ms: u64,
}

impl RunReport {
    /// Number of engine executions, reruns included.
    pub fn execution_count(&self) -> usize {
        self.attempts.len()
    }

    /// Invocations after the first one.
    pub fn rerun_count(&self) -> usize {
        self.attempts.iter().filter(|a| a.is_rerun()).count()
    }
}
