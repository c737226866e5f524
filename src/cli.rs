//! Command-line surface of the `slotmux` binary.
//!
//! Every setting can come from a flag or from the environment variable named
//! in its help text, so the binary runs unchanged as a scheduled job.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::{FileOwner, DEFAULT_SITES_MOUNT_ROOT};
use crate::factory;
use crate::rotation::{RotationEngine, RunReport, RunStatus};
use crate::runtime::DryRunCoordinator;
use crate::shared_config::{discover_config_path, ConfigWriter};
use crate::{Config, Result};

/// Default log filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "slotmux=info";

/// Zero-downtime dual-slot database credential rotation
#[derive(Debug, Parser)]
#[command(name = "slotmux", version, about, long_about = None)]
pub struct Cli {
    /// Log every action without changing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Emit logs and the final status line as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Only synchronize database users with the slot secret
    #[arg(long, conflicts_with = "fix_permissions")]
    pub sync_db_users: bool,

    /// Only re-apply owner and mode to the shared config file
    #[arg(long)]
    pub fix_permissions: bool,

    /// AWS region of the secret store
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Custom secret store endpoint (LocalStack)
    #[arg(long, env = "SECRETS_ENDPOINT_URL")]
    pub secrets_endpoint: Option<String>,

    /// Slot secret name or ARN
    #[arg(long, env = "SLOT_SECRET_ID")]
    pub slot_secret_id: Option<String>,

    /// Admin secret name or ARN
    #[arg(long, env = "ADMIN_SECRET_ID")]
    pub admin_secret_id: Option<String>,

    /// Mount point containing default/sqlconf.php
    #[arg(long, env = "SITES_MOUNT_ROOT", default_value = DEFAULT_SITES_MOUNT_ROOT)]
    pub sites_mount_root: PathBuf,

    /// Kubernetes namespace of the application
    #[arg(long, env = "K8S_NAMESPACE")]
    pub namespace: Option<String>,

    /// Application deployment name
    #[arg(long, env = "K8S_DEPLOYMENT_NAME")]
    pub deployment: Option<String>,

    /// Runtime secret name
    #[arg(long, env = "K8S_SECRET_NAME")]
    pub runtime_secret: Option<String>,

    /// Application health endpoint probed after each restart
    #[arg(long, env = "HEALTHCHECK_URL")]
    pub health_url: Option<String>,

    /// Accept self-signed certificates on the health endpoint
    #[arg(long, env = "HEALTHCHECK_INSECURE")]
    pub health_insecure: bool,

    /// Upper bound on the rolling restart wait, in seconds
    #[arg(long, env = "ROLLOUT_TIMEOUT_SECS", default_value_t = 1800)]
    pub rollout_timeout_secs: u64,

    /// Rollout status poll interval, in seconds
    #[arg(long, env = "ROLLOUT_POLL_INTERVAL_SECS", default_value_t = 15)]
    pub rollout_poll_interval_secs: u64,

    /// Owner uid of the shared config file
    #[arg(long, env = "CONFIG_FILE_UID", default_value_t = 1000)]
    pub config_file_uid: u32,

    /// Owner gid of the shared config file
    #[arg(long, env = "CONFIG_FILE_GID", default_value_t = 101)]
    pub config_file_gid: u32,
}

impl Cli {
    /// Maps the parsed arguments onto a [`Config`].
    ///
    /// Missing settings are left empty so that [`Config::validate`] can
    /// report all of them at once.
    pub fn to_config(&self) -> Config {
        let mut config = Config::new(
            self.slot_secret_id.clone().unwrap_or_default(),
            self.admin_secret_id.clone().unwrap_or_default(),
        )
        .with_sites_mount_root(self.sites_mount_root.clone())
        .with_kubernetes(
            self.namespace.clone().unwrap_or_default(),
            self.deployment.clone().unwrap_or_default(),
            self.runtime_secret.clone().unwrap_or_default(),
        )
        .with_rollout_timeout(Duration::from_secs(self.rollout_timeout_secs))
        .with_rollout_poll_interval(Duration::from_secs(self.rollout_poll_interval_secs))
        .with_file_owner(Some(FileOwner {
            uid: self.config_file_uid,
            gid: self.config_file_gid,
        }))
        .with_dry_run(self.dry_run);

        if let Some(ref region) = self.region {
            config = config.with_region(region.clone());
        }
        if let Some(ref endpoint) = self.secrets_endpoint {
            config = config.with_secrets_endpoint(endpoint.clone());
        }
        if let Some(ref url) = self.health_url {
            config = config.with_health_url(url.clone());
        }
        config.health_accept_invalid_certs = self.health_insecure;
        config
    }
}

/// Installs the global subscriber. Logs go to stderr; stdout is reserved for
/// the status line.
pub fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Runs the selected operation and prints its status line.
///
/// Returns the process exit code.
pub async fn run(cli: Cli) -> u8 {
    let config = cli.to_config();

    if cli.fix_permissions {
        let result = fix_permissions(&config);
        match result {
            Ok(ref path) => tracing::info!(path = %path.display(), "permissions fixed"),
            Err(ref err) => tracing::error!(error = %err, "fixing permissions failed"),
        }
        println!("{}", permissions_line(&result, cli.log_json));
        return if result.is_ok() { 0 } else { 1 };
    }

    let report = match execute(&cli, config).await {
        Ok(report) => report,
        Err(err) => {
            tracing::error!(error = %err, "run could not start");
            RunReport::new(Uuid::new_v4(), RunStatus::Error, cli.dry_run).with_error(err)
        }
    };

    print_report(&report, cli.log_json);
    report.exit_code()
}

async fn execute(cli: &Cli, config: Config) -> Result<RunReport> {
    if cli.sync_db_users {
        config.validate_secrets()?;
        let engine = sync_engine(config).await?;
        return Ok(engine.sync_users().await);
    }

    config.validate()?;
    let engine = factory::new_engine(config).await?;
    Ok(engine.run().await)
}

/// User sync never touches the application, so no cluster connection is
/// made.
async fn sync_engine(config: Config) -> Result<RotationEngine> {
    let secrets = factory::new_secret_store(&config).await?;
    let db = factory::new_database_admin(&config)?;
    let validator = factory::new_validator(&config, db.clone())?;
    let runtime = Arc::new(DryRunCoordinator::new(
        config.deployment.clone(),
        config.runtime_secret.clone(),
    ));
    Ok(RotationEngine::new(config, secrets, db, runtime, validator))
}

fn fix_permissions(config: &Config) -> Result<PathBuf> {
    let path = discover_config_path(&config.sites_mount_root)?;
    ConfigWriter::from_config(config).fix_permissions(&path)?;
    Ok(path)
}

fn permissions_line(result: &Result<PathBuf>, json: bool) -> String {
    match (result, json) {
        (Ok(path), true) => serde_json::json!({
            "status": "permissions_fixed",
            "path": path.display().to_string(),
        })
        .to_string(),
        (Err(err), true) => serde_json::json!({
            "status": "error",
            "error": err.to_string(),
        })
        .to_string(),
        (Ok(path), false) => format!("permissions fixed: {}", path.display()),
        (Err(err), false) => format!("error: {err}"),
    }
}

fn print_report(report: &RunReport, json: bool) {
    if json {
        match report.to_json() {
            Ok(line) => println!("{line}"),
            Err(err) => {
                tracing::error!(error = %err, "serializing run report failed");
                println!("{report}");
            }
        }
    } else {
        println!("{report}");
    }
}
