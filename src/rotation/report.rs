//! Machine-readable outcome of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::slot::Slot;
use crate::Result;

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// First run provisioned both slots
    Bootstrapped,
    /// The application moved to the standby slot
    Rotated,
    /// The secret's pointer was corrected to match the application
    Reconciled,
    /// A pending stale-slot rotation was finished
    CleanupCompleted,
    /// Database users were synchronized with the secret
    Synced,
    /// The switch failed and the previous slot was restored
    RolledBack,
    /// Restoring the previous slot failed
    RollbackFailed,
    /// The flip succeeded but a trailing rotation failed
    CleanupFailed,
    /// The run aborted
    Error,
}

impl RunStatus {
    /// Whether the run achieved what it set out to do.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            RunStatus::Bootstrapped
                | RunStatus::Rotated
                | RunStatus::Reconciled
                | RunStatus::CleanupCompleted
                | RunStatus::Synced
        )
    }

    /// Alerting severity of this status.
    pub fn severity(self) -> Severity {
        match self {
            RunStatus::RolledBack | RunStatus::CleanupFailed => Severity::Warning,
            RunStatus::RollbackFailed | RunStatus::Error => Severity::Critical,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Bootstrapped => "bootstrapped",
            RunStatus::Rotated => "rotated",
            RunStatus::Reconciled => "reconciled",
            RunStatus::CleanupCompleted => "cleanup_completed",
            RunStatus::Synced => "synced",
            RunStatus::RolledBack => "rolled_back",
            RunStatus::RollbackFailed => "rollback_failed",
            RunStatus::CleanupFailed => "cleanup_failed",
            RunStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Alerting severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Nothing to do
    Info,
    /// Needs attention, the application is healthy
    Warning,
    /// Manual intervention required
    Critical,
}

/// Summary of a run, printed as the final status line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Correlates the report with the run's log lines
    pub run_id: Uuid,
    /// Final status
    pub status: RunStatus,
    /// Severity derived from `status`
    pub severity: Severity,
    /// Whether mutations were skipped
    pub dry_run: bool,
    /// Slot the application uses at the end of the run, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_slot: Option<Slot>,
    /// Slot the application used before the run, when it changed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_slot: Option<Slot>,
    /// Error description for non-success statuses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Completion time
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Creates a report stamped with the current time.
    pub fn new(run_id: Uuid, status: RunStatus, dry_run: bool) -> Self {
        Self {
            run_id,
            status,
            severity: status.severity(),
            dry_run,
            active_slot: None,
            previous_slot: None,
            error: None,
            finished_at: Utc::now(),
        }
    }

    /// Records the active and previous slots.
    pub fn with_slots(mut self, active: Option<Slot>, previous: Option<Slot>) -> Self {
        self.active_slot = active;
        self.previous_slot = previous;
        self
    }

    /// Records an error description.
    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Whether the run succeeded.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Process exit code: 0 on success, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    /// Serializes the report as a single JSON line.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            RunStatus::RolledBack => write!(f, "rolled back (no change)")?,
            RunStatus::RollbackFailed => {
                write!(f, "rollback failed - manual intervention required")?
            }
            status => write!(f, "{status}")?,
        }

        match (self.previous_slot, self.active_slot) {
            (Some(previous), Some(active)) => write!(f, ": slot {previous} -> {active}")?,
            (None, Some(active)) => write!(f, ": active slot {active}")?,
            _ => {}
        }
        if self.dry_run {
            write!(f, " (dry run)")?;
        }
        if let Some(ref error) = self.error {
            write!(f, ": {error}")?;
        }
        Ok(())
    }
}
