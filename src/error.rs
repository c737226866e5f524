//! Error types for rotation runs.
//!
//! The variants follow the rotation protocol's taxonomy: some are fatal
//! before any mutation, some trigger rollback, and some are only reported
//! because the application is already running on the new slot.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::slot::Slot;

/// Result type alias using [`RotationError`].
pub type Result<T> = std::result::Result<T, RotationError>;

/// Errors that can occur during a rotation run.
///
/// All errors implement `std::error::Error` and can be chained with `source()`.
#[derive(Debug, Error)]
pub enum RotationError {
    /// Secret store unreachable, or the stored document is malformed.
    #[error("secret {secret_id} unavailable: {reason}")]
    SecretUnavailable {
        /// Secret identifier (name or ARN)
        secret_id: String,
        /// What went wrong
        reason: String,
        /// Transport failures are retryable; malformed documents are not
        retryable: bool,
    },

    /// A password change did not take effect.
    #[error("password for database user {username} did not verify after change")]
    SyncVerificationFailed {
        /// Database user name
        username: String,
    },

    /// Rolling restart did not become healthy in time.
    #[error("rollout of {deployment} did not complete within {timeout:?}")]
    RolloutTimeout {
        /// Deployment name
        deployment: String,
        /// Configured timeout
        timeout: Duration,
    },

    /// Post-switch connectivity or health check failed.
    #[error("validation failed for {username}: {detail}")]
    ValidationFailed {
        /// Database user the check ran as
        username: String,
        /// Which check failed
        detail: String,
    },

    /// Trailing password rotation of the previous slot failed.
    #[error("rotation of stale slot {slot} failed: {source}")]
    OldSlotRotationFailed {
        /// Slot whose password could not be rotated
        slot: Slot,
        /// Underlying error
        #[source]
        source: Box<RotationError>,
    },

    /// Trailing admin password rotation failed.
    #[error("admin password rotation failed: {source}")]
    AdminRotationFailed {
        /// Underlying error
        #[source]
        source: Box<RotationError>,
    },

    /// Neither the stored admin password nor any slot password works.
    #[error("admin credential for {username} is invalid and no fallback password worked; reset the database master password manually")]
    AdminCredentialInvalid {
        /// Admin user name
        username: String,
    },

    /// Rollback itself failed; the system needs manual intervention.
    #[error("rollback failed, manual intervention required: {reason}")]
    RollbackFailed {
        /// Why the rollback was started
        reason: String,
        /// Error raised while rolling back
        #[source]
        source: Box<RotationError>,
    },

    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Shared config file could not be located, parsed or rendered.
    #[error("config file {path}: {reason}")]
    ConfigFile {
        /// File path
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// Identifier rejected before SQL interpolation.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Container orchestrator API call failed.
    #[error("orchestrator error: {0}")]
    Orchestrator(String),

    /// HTTP health probe could not be performed.
    #[error("health check error: {0}")]
    HealthCheck(String),

    /// A phase failed with context.
    #[error("{phase}: {source}")]
    PhaseFailed {
        /// Phase name
        phase: String,
        /// Underlying error
        #[source]
        source: Box<RotationError>,
    },

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error (catch-all).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RotationError {
    /// Wraps an error with the name of the phase that produced it.
    ///
    /// # Example
    ///
    /// ```
    /// use slotmux::RotationError;
    ///
    /// let err = RotationError::SyncVerificationFailed {
    ///     username: "openemr_b".to_string(),
    /// };
    /// let wrapped = RotationError::in_phase("sync-users", err);
    ///
    /// assert_eq!(
    ///     wrapped.to_string(),
    ///     "sync-users: password for database user openemr_b did not verify after change"
    /// );
    /// ```
    pub fn in_phase(phase: impl Into<String>, err: RotationError) -> Self {
        Self::PhaseFailed {
            phase: phase.into(),
            source: Box::new(err),
        }
    }

    /// Secret store transport failure (retryable).
    pub fn secret_unreachable(secret_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SecretUnavailable {
            secret_id: secret_id.into(),
            reason: reason.into(),
            retryable: true,
        }
    }

    /// Stored secret document is malformed (never retried).
    pub fn secret_malformed(secret_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SecretUnavailable {
            secret_id: secret_id.into(),
            reason: reason.into(),
            retryable: false,
        }
    }

    /// Returns true for transient network errors worth a bounded retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SecretUnavailable { retryable, .. } => *retryable,
            Self::Orchestrator(_) => true,
            Self::PhaseFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Returns true for errors raised after the flip was persisted.
    pub fn is_trailing(&self) -> bool {
        match self {
            Self::OldSlotRotationFailed { .. } | Self::AdminRotationFailed { .. } => true,
            Self::PhaseFailed { source, .. } => source.is_trailing(),
            _ => false,
        }
    }
}
