//! Construction of the concrete collaborators.
//!
//! Each backend lives behind a Cargo feature. When a feature is disabled the
//! constructor returns an error naming the flag instead of failing to link.

use std::sync::Arc;

use crate::database::DatabaseAdmin;
use crate::rotation::RotationEngine;
use crate::runtime::{DryRunCoordinator, RuntimeCoordinator};
use crate::secrets::SecretStore;
use crate::validator::{ConnectivityValidator, Validator};
use crate::{Config, Result, RotationError};

#[cfg_attr(all(feature = "aws", feature = "mysql", feature = "kubernetes"), allow(dead_code))]
fn missing_feature(component: &str, feature: &str) -> RotationError {
    RotationError::Config(format!(
        "no {} backend compiled in (did you enable the '{}' feature flag?)",
        component, feature
    ))
}

/// Creates the secret store client and initializes it.
///
/// # Errors
///
/// Returns an error if the `aws` feature is disabled or the SDK
/// configuration cannot be loaded.
pub async fn new_secret_store(config: &Config) -> Result<Arc<dyn SecretStore>> {
    #[cfg(feature = "aws")]
    {
        let mut store = crate::secrets::aws::AwsSecretStore::new(config);
        store.init().await?;
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "aws"))]
    {
        let _ = config;
        Err(missing_feature("secret store", "aws"))
    }
}

/// Creates the database driver.
pub fn new_database_admin(_config: &Config) -> Result<Arc<dyn DatabaseAdmin>> {
    #[cfg(feature = "mysql")]
    {
        Ok(Arc::new(crate::database::mysql::MySqlAdmin::new()))
    }

    #[cfg(not(feature = "mysql"))]
    {
        Err(missing_feature("database", "mysql"))
    }
}

/// Creates the runtime coordinator.
///
/// In dry-run mode no cluster connection is made.
pub async fn new_coordinator(config: &Config) -> Result<Arc<dyn RuntimeCoordinator>> {
    if config.dry_run {
        return Ok(Arc::new(DryRunCoordinator::new(
            config.deployment.clone(),
            config.runtime_secret.clone(),
        )));
    }

    #[cfg(feature = "kubernetes")]
    {
        let coordinator = crate::runtime::kubernetes::KubernetesCoordinator::connect(config).await?;
        Ok(Arc::new(coordinator))
    }

    #[cfg(not(feature = "kubernetes"))]
    {
        Err(missing_feature("orchestrator", "kubernetes"))
    }
}

/// Creates the post-switch validator over `db`.
pub fn new_validator(config: &Config, db: Arc<dyn DatabaseAdmin>) -> Result<Arc<dyn Validator>> {
    let validator = ConnectivityValidator::new(db, config.health_accept_invalid_certs)?;
    Ok(Arc::new(validator))
}

/// Builds a [`RotationEngine`] over the real backends.
///
/// # Example
///
/// ```no_run
/// use slotmux::{factory, Config};
///
/// #[tokio::main]
/// async fn main() -> slotmux::Result<()> {
///     let config = Config::new("openemr/db-slots", "openemr/db-admin")
///         .with_kubernetes("openemr", "openemr", "openemr-db-credentials");
///     config.validate()?;
///
///     let engine = factory::new_engine(config).await?;
///     let report = engine.run().await;
///     println!("{report}");
///     Ok(())
/// }
/// ```
pub async fn new_engine(config: Config) -> Result<RotationEngine> {
    let secrets = new_secret_store(&config).await?;
    let db = new_database_admin(&config)?;
    let runtime = new_coordinator(&config).await?;
    let validator = new_validator(&config, db.clone())?;

    tracing::debug!(
        secrets = secrets.name(),
        database = db.name(),
        runtime = runtime.name(),
        "collaborators created"
    );
    Ok(RotationEngine::new(config, secrets, db, runtime, validator))
}
