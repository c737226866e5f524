//! Recording coordinator for testing.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use super::{RolloutResult, RuntimeCoordinator};
use crate::slot::DbCredential;
use crate::{Result, RotationError};

/// Mock coordinator that records patches and restarts.
///
/// Rollouts succeed unless results are queued with
/// [`MockCoordinator::push_rollout_result`].
#[derive(Default)]
pub struct MockCoordinator {
    runtime_secret: RwLock<Option<DbCredential>>,
    patches: RwLock<Vec<DbCredential>>,
    restarts: AtomicU32,
    rollout_results: RwLock<VecDeque<RolloutResult>>,
    transient_patch_failures: AtomicU32,

    /// Error to return from `patch_runtime_secret()`
    pub patch_error: Option<RotationError>,
    /// Error to return from `restart_and_wait()`
    pub restart_error: Option<RotationError>,
}

impl MockCoordinator {
    /// Creates a coordinator with an empty runtime secret.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates the runtime secret.
    pub async fn set_runtime_secret(&self, credential: DbCredential) {
        *self.runtime_secret.write().await = Some(credential);
    }

    /// Current runtime secret projection.
    pub async fn runtime_secret(&self) -> Option<DbCredential> {
        self.runtime_secret.read().await.clone()
    }

    /// Every credential patched so far, oldest first.
    pub async fn patches(&self) -> Vec<DbCredential> {
        self.patches.read().await.clone()
    }

    /// Number of rolling restarts triggered.
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Queues the result of the next rollout.
    pub async fn push_rollout_result(&self, result: RolloutResult) {
        self.rollout_results.write().await.push_back(result);
    }

    /// Makes the next `count` patches fail with a retryable error.
    pub fn fail_next_patches(&self, count: u32) {
        self.transient_patch_failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl RuntimeCoordinator for MockCoordinator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn patch_runtime_secret(&self, credential: &DbCredential) -> Result<()> {
        if let Some(ref err) = self.patch_error {
            return Err(RotationError::Other(anyhow::anyhow!("{}", err)));
        }

        let remaining = self.transient_patch_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_patch_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(RotationError::Orchestrator(
                "simulated API server unavailable".to_string(),
            ));
        }

        *self.runtime_secret.write().await = Some(credential.clone());
        self.patches.write().await.push(credential.clone());
        Ok(())
    }

    async fn restart_and_wait(&self, _timeout: Duration) -> Result<RolloutResult> {
        if let Some(ref err) = self.restart_error {
            return Err(RotationError::Other(anyhow::anyhow!("{}", err)));
        }

        self.restarts.fetch_add(1, Ordering::SeqCst);
        let result = self.rollout_results.write().await.pop_front();
        Ok(result.unwrap_or_else(RolloutResult::success))
    }
}
