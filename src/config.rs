//! Configuration for rotation runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::{Result, RotationError};

/// Default mount point of the shared sites volume.
pub const DEFAULT_SITES_MOUNT_ROOT: &str = "/mnt/openemr-sites";

/// Owner applied to the shared config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileOwner {
    /// Numeric user id
    pub uid: u32,
    /// Numeric group id
    pub gid: u32,
}

impl Default for FileOwner {
    fn default() -> Self {
        // apache inside the application image
        Self { uid: 1000, gid: 101 }
    }
}

/// Configuration for a rotation run.
///
/// Use the builder pattern for ergonomic configuration:
///
/// ```
/// use slotmux::Config;
/// use std::time::Duration;
///
/// let config = Config::new("prod/db-slots", "prod/db-admin")
///     .with_region("us-east-1")
///     .with_kubernetes("openemr", "openemr", "openemr-db-credentials")
///     .with_rollout_timeout(Duration::from_secs(600));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// AWS region of the secret store (SDK default chain if unset)
    pub region: Option<String>,

    /// Custom secret store endpoint (LocalStack)
    pub secrets_endpoint: Option<String>,

    /// Slot secret identifier
    pub slot_secret_id: String,

    /// Admin secret identifier
    pub admin_secret_id: String,

    /// Mount point containing `default/sqlconf.php`
    pub sites_mount_root: PathBuf,

    /// Kubernetes namespace of the application
    pub namespace: String,

    /// Application deployment name
    pub deployment: String,

    /// Runtime secret name
    pub runtime_secret: String,

    /// Optional application health endpoint
    pub health_url: Option<String>,

    /// Accept self-signed certificates on the health endpoint
    pub health_accept_invalid_certs: bool,

    /// Upper bound on the rolling restart wait (default: 30 minutes)
    pub rollout_timeout: Duration,

    /// Rollout status poll interval (default: 15 seconds)
    pub rollout_poll_interval: Duration,

    /// Owner re-applied to the config file on every write (`None` skips chown)
    pub file_owner: Option<FileOwner>,

    /// Mode re-applied to the config file on every write
    pub file_mode: u32,

    /// Retry policy for transient secret store and orchestrator errors
    pub retry: RetryPolicy,

    /// Evaluate the flow without mutating anything
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region: None,
            secrets_endpoint: None,
            slot_secret_id: String::new(),
            admin_secret_id: String::new(),
            sites_mount_root: PathBuf::from(DEFAULT_SITES_MOUNT_ROOT),
            namespace: String::new(),
            deployment: String::new(),
            runtime_secret: String::new(),
            health_url: None,
            health_accept_invalid_certs: false,
            rollout_timeout: Duration::from_secs(1800), // 30 minutes
            rollout_poll_interval: Duration::from_secs(15),
            file_owner: Some(FileOwner::default()),
            file_mode: 0o644,
            retry: RetryPolicy::default(),
            dry_run: false,
        }
    }
}

impl Config {
    /// Creates a configuration for the given slot and admin secrets.
    pub fn new(slot_secret_id: impl Into<String>, admin_secret_id: impl Into<String>) -> Self {
        Self {
            slot_secret_id: slot_secret_id.into(),
            admin_secret_id: admin_secret_id.into(),
            ..Default::default()
        }
    }

    /// Sets the AWS region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Sets a custom secret store endpoint (LocalStack testing).
    pub fn with_secrets_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.secrets_endpoint = Some(endpoint.into());
        self
    }

    /// Sets the shared sites mount point.
    pub fn with_sites_mount_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sites_mount_root = root.into();
        self
    }

    /// Sets the Kubernetes namespace, deployment and runtime secret names.
    pub fn with_kubernetes(
        mut self,
        namespace: impl Into<String>,
        deployment: impl Into<String>,
        runtime_secret: impl Into<String>,
    ) -> Self {
        self.namespace = namespace.into();
        self.deployment = deployment.into();
        self.runtime_secret = runtime_secret.into();
        self
    }

    /// Sets the application health endpoint.
    pub fn with_health_url(mut self, url: impl Into<String>) -> Self {
        self.health_url = Some(url.into());
        self
    }

    /// Sets the rolling restart timeout.
    pub fn with_rollout_timeout(mut self, timeout: Duration) -> Self {
        self.rollout_timeout = timeout;
        self
    }

    /// Sets the rollout status poll interval.
    pub fn with_rollout_poll_interval(mut self, interval: Duration) -> Self {
        self.rollout_poll_interval = interval;
        self
    }

    /// Sets (or clears) the owner re-applied to the config file.
    pub fn with_file_owner(mut self, owner: Option<FileOwner>) -> Self {
        self.file_owner = owner;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enables or disables dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Path of the shared config file under the sites mount.
    pub fn config_file_path(&self) -> PathBuf {
        config_file_path(&self.sites_mount_root)
    }

    /// Checks the settings needed to read and write the two secrets.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Config`] naming every missing setting.
    pub fn validate_secrets(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.slot_secret_id.is_empty() {
            missing.push("SLOT_SECRET_ID");
        }
        if self.admin_secret_id.is_empty() {
            missing.push("ADMIN_SECRET_ID");
        }
        missing_to_error(missing)
    }

    /// Checks everything a full rotation needs.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Config`] naming every missing or invalid setting.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.slot_secret_id.is_empty() {
            missing.push("SLOT_SECRET_ID");
        }
        if self.admin_secret_id.is_empty() {
            missing.push("ADMIN_SECRET_ID");
        }
        if self.namespace.is_empty() {
            missing.push("K8S_NAMESPACE");
        }
        if self.deployment.is_empty() {
            missing.push("K8S_DEPLOYMENT_NAME");
        }
        if self.runtime_secret.is_empty() {
            missing.push("K8S_SECRET_NAME");
        }
        missing_to_error(missing)?;

        if self.rollout_poll_interval.is_zero() {
            return Err(RotationError::Config(
                "rollout poll interval must be greater than zero".to_string(),
            ));
        }

        self.retry.validate().map_err(RotationError::Config)
    }
}

/// Resolves `<root>/default/sqlconf.php`.
pub fn config_file_path(sites_mount_root: &Path) -> PathBuf {
    sites_mount_root.join("default").join("sqlconf.php")
}

fn missing_to_error(missing: Vec<&str>) -> Result<()> {
    if missing.is_empty() {
        Ok(())
    } else {
        Err(RotationError::Config(format!(
            "missing required environment variables: {}",
            missing.join(", ")
        )))
    }
}
