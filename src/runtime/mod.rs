//! Runtime secret projection and rolling restarts.
//!
//! The application reads its database credential from an orchestrator
//! secret and from the shared config file. After either changes, replicas
//! are restarted batch-wise so that each one reconnects with the new
//! credential without an outage.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::slot::DbCredential;
use crate::Result;

#[cfg(feature = "kubernetes")]
pub mod kubernetes;

#[cfg(feature = "mock")]
pub mod mock;

/// Pod template annotation whose change triggers a rolling restart.
pub const RESTART_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Why a rollout did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutFailure {
    /// Replicas did not become ready before the deadline
    Timeout,
}

/// Outcome of [`RuntimeCoordinator::restart_and_wait`].
///
/// A timeout is reported as a value so the caller decides whether to roll
/// back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloutResult {
    /// Whether every replica is running the new template
    pub succeeded: bool,
    /// Failure reason when `succeeded` is false
    pub reason: Option<RolloutFailure>,
}

impl RolloutResult {
    /// A completed rollout.
    pub fn success() -> Self {
        Self {
            succeeded: true,
            reason: None,
        }
    }

    /// A rollout that did not finish in time.
    pub fn timed_out() -> Self {
        Self {
            succeeded: false,
            reason: Some(RolloutFailure::Timeout),
        }
    }
}

/// Patches the runtime secret and restarts the application.
#[async_trait]
pub trait RuntimeCoordinator: Send + Sync {
    /// Returns the orchestrator name (e.g., "kubernetes", "mock").
    fn name(&self) -> &str;

    /// Replaces the credential keys of the runtime secret.
    async fn patch_runtime_secret(&self, credential: &DbCredential) -> Result<()>;

    /// Triggers a rolling restart and blocks until it completes or
    /// `timeout` elapses.
    async fn restart_and_wait(&self, timeout: Duration) -> Result<RolloutResult>;
}

/// Key/value projection of a credential as stored in the runtime secret.
///
/// ```
/// use slotmux::runtime::runtime_secret_data;
/// use slotmux::DbCredential;
///
/// let data = runtime_secret_data(&DbCredential::new("openemr_b", "p2", "db", 3306, "openemr"));
/// assert_eq!(data["mysql-user"], "openemr_b");
/// assert_eq!(data["mysql-port"], "3306");
/// ```
pub fn runtime_secret_data(credential: &DbCredential) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("mysql-host".to_string(), credential.host.clone()),
        ("mysql-port".to_string(), credential.port.to_string()),
        ("mysql-user".to_string(), credential.username.clone()),
        ("mysql-password".to_string(), credential.password.clone()),
        ("mysql-database".to_string(), credential.database_name.clone()),
    ])
}

/// Replica counts observed while waiting for a rollout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RolloutProgress {
    /// Desired replica count
    pub desired: i32,
    /// Replicas running the latest template
    pub updated: i32,
    /// Replicas passing readiness
    pub ready: i32,
    /// Replicas available to serve
    pub available: i32,
    /// Replicas not yet available
    pub unavailable: i32,
    /// Generation produced by the restart patch
    pub generation: Option<i64>,
    /// Generation the controller has acted on
    pub observed_generation: Option<i64>,
}

impl RolloutProgress {
    /// True once every replica runs the latest template and none is
    /// unavailable.
    pub fn is_complete(&self) -> bool {
        let observed = match (self.generation, self.observed_generation) {
            (Some(generation), Some(observed)) => observed >= generation,
            (Some(_), None) => false,
            (None, _) => true,
        };

        observed
            && self.updated >= self.desired
            && self.ready >= self.desired
            && self.available >= self.desired
            && self.unavailable == 0
    }
}

/// Coordinator used in dry-run mode: every call is a logged no-op.
#[derive(Debug, Clone)]
pub struct DryRunCoordinator {
    deployment: String,
    runtime_secret: String,
}

impl DryRunCoordinator {
    /// Creates a dry-run coordinator for the named deployment and secret.
    pub fn new(deployment: impl Into<String>, runtime_secret: impl Into<String>) -> Self {
        Self {
            deployment: deployment.into(),
            runtime_secret: runtime_secret.into(),
        }
    }
}

#[async_trait]
impl RuntimeCoordinator for DryRunCoordinator {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn patch_runtime_secret(&self, credential: &DbCredential) -> Result<()> {
        tracing::info!(
            secret = %self.runtime_secret,
            username = %credential.username,
            "dry run: skipping runtime secret patch"
        );
        Ok(())
    }

    async fn restart_and_wait(&self, timeout: Duration) -> Result<RolloutResult> {
        tracing::info!(
            deployment = %self.deployment,
            timeout_secs = timeout.as_secs(),
            "dry run: skipping rolling restart"
        );
        Ok(RolloutResult::success())
    }
}
