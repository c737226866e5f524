//! Kubernetes coordinator.
//!
//! Patches a namespaced `Secret` and restarts a `Deployment` the way
//! `kubectl rollout restart` does: by stamping the pod template with an
//! annotation, then polling the deployment status.
//!
//! # Requirements
//!
//! - In-cluster service account or a local kubeconfig
//! - RBAC: `patch` on the secret, `get`/`patch` on the deployment

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::time::Instant;

use super::{runtime_secret_data, RolloutProgress, RolloutResult, RuntimeCoordinator, RESTART_ANNOTATION};
use crate::slot::DbCredential;
use crate::{Config, Result, RotationError};

/// Kubernetes implementation of [`RuntimeCoordinator`].
pub struct KubernetesCoordinator {
    client: Client,
    namespace: String,
    deployment: String,
    runtime_secret: String,
    poll_interval: Duration,
}

impl KubernetesCoordinator {
    /// Connects using the in-cluster configuration, falling back to the
    /// local kubeconfig.
    pub async fn connect(config: &Config) -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| RotationError::Orchestrator(format!("loading kube config: {e}")))?;

        Ok(Self::with_client(client, config))
    }

    /// Creates a coordinator over an existing client.
    pub fn with_client(client: Client, config: &Config) -> Self {
        Self {
            client,
            namespace: config.namespace.clone(),
            deployment: config.deployment.clone(),
            runtime_secret: config.runtime_secret.clone(),
            poll_interval: config.rollout_poll_interval,
        }
    }

    async fn progress(&self, api: &Api<Deployment>, generation: Option<i64>) -> Result<RolloutProgress> {
        let deployment = api
            .get_status(&self.deployment)
            .await
            .map_err(|e| api_error("reading deployment status", e))?;

        Ok(rollout_progress(&deployment, generation))
    }
}

/// Converts a deployment into rollout progress.
pub fn rollout_progress(deployment: &Deployment, generation: Option<i64>) -> RolloutProgress {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let status = deployment.status.clone().unwrap_or_default();

    RolloutProgress {
        desired,
        updated: status.updated_replicas.unwrap_or(0),
        ready: status.ready_replicas.unwrap_or(0),
        available: status.available_replicas.unwrap_or(0),
        unavailable: status.unavailable_replicas.unwrap_or(0),
        generation,
        observed_generation: status.observed_generation,
    }
}

fn secret_patch(credential: &DbCredential) -> Value {
    let data: Map<String, Value> = runtime_secret_data(credential)
        .into_iter()
        .map(|(key, value)| (key, Value::String(STANDARD.encode(value))))
        .collect();

    json!({ "data": data })
}

fn restart_patch(restarted_at: &str) -> Value {
    let mut annotations = Map::new();
    annotations.insert(RESTART_ANNOTATION.to_string(), Value::String(restarted_at.to_string()));

    json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": annotations
                }
            }
        }
    })
}

fn api_error(action: &str, err: kube::Error) -> RotationError {
    RotationError::Orchestrator(format!("{action}: {err}"))
}

#[async_trait]
impl RuntimeCoordinator for KubernetesCoordinator {
    fn name(&self) -> &str {
        "kubernetes"
    }

    async fn patch_runtime_secret(&self, credential: &DbCredential) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let patch = secret_patch(credential);

        api.patch(&self.runtime_secret, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| api_error("patching runtime secret", e))?;

        tracing::info!(
            namespace = %self.namespace,
            secret = %self.runtime_secret,
            username = %credential.username,
            "runtime secret updated"
        );
        Ok(())
    }

    async fn restart_and_wait(&self, timeout: Duration) -> Result<RolloutResult> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let restarted_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let patch = restart_patch(&restarted_at);

        let patched = api
            .patch(&self.deployment, &PatchParams::default(), &Patch::Strategic(&patch))
            .await
            .map_err(|e| api_error("triggering rolling restart", e))?;
        let generation = patched.metadata.generation;

        tracing::info!(
            deployment = %self.deployment,
            %restarted_at,
            timeout_secs = timeout.as_secs(),
            "rolling restart triggered"
        );

        let deadline = Instant::now() + timeout;
        loop {
            match self.progress(&api, generation).await {
                Ok(progress) if progress.is_complete() => {
                    tracing::info!(
                        deployment = %self.deployment,
                        ready = progress.ready,
                        desired = progress.desired,
                        "rollout complete"
                    );
                    return Ok(RolloutResult::success());
                }
                Ok(progress) => {
                    tracing::info!(
                        deployment = %self.deployment,
                        updated = progress.updated,
                        ready = progress.ready,
                        available = progress.available,
                        desired = progress.desired,
                        "rollout in progress"
                    );
                }
                // A single failed poll does not end the wait.
                Err(err) => tracing::warn!(deployment = %self.deployment, error = %err, "rollout status poll failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::error!(deployment = %self.deployment, timeout_secs = timeout.as_secs(), "rollout timed out");
                return Ok(RolloutResult::timed_out());
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};

    #[test]
    fn test_secret_patch_is_base64() {
        let patch = secret_patch(&DbCredential::new("openemr_b", "p2", "db", 3306, "openemr"));
        assert_eq!(patch["data"]["mysql-user"], "b3BlbmVtcl9i");
        assert_eq!(patch["data"]["mysql-password"], "cDI=");
        assert_eq!(patch["data"]["mysql-port"], "MzMwNg==");
    }

    #[test]
    fn test_restart_patch_annotation() {
        let patch = restart_patch("2026-01-01T00:00:00Z");
        assert_eq!(
            patch["spec"]["template"]["metadata"]["annotations"][RESTART_ANNOTATION],
            "2026-01-01T00:00:00Z"
        );
    }

    #[test]
    fn test_rollout_progress_defaults() {
        let deployment = Deployment {
            spec: Some(DeploymentSpec::default()),
            status: Some(DeploymentStatus {
                updated_replicas: Some(1),
                ready_replicas: Some(1),
                available_replicas: Some(1),
                observed_generation: Some(7),
                ..Default::default()
            }),
            ..Default::default()
        };

        let progress = rollout_progress(&deployment, Some(7));
        assert_eq!(progress.desired, 1);
        assert_eq!(progress.unavailable, 0);
        assert!(progress.is_complete());

        assert!(!rollout_progress(&deployment, Some(8)).is_complete());
    }
}
