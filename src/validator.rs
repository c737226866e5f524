//! Post-switch validation.
//!
//! After a restart the new credential is checked directly against the
//! database, and the application is probed over HTTP when a health URL is
//! configured. Validation only reads; it never changes state.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::database::DatabaseAdmin;
use crate::slot::DbCredential;
use crate::{Result, RotationError};

/// HTTP health probe timeout.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    /// Every check passed
    pub ok: bool,
    /// The database accepted the credential
    pub database_ok: bool,
    /// Health probe outcome (`None` when no URL is configured)
    pub health_ok: Option<bool>,
    /// Description of the first failing check
    pub detail: Option<String>,
}

impl ValidationResult {
    /// Converts a failed validation into [`RotationError::ValidationFailed`].
    pub fn into_result(self, username: &str) -> Result<()> {
        if self.ok {
            return Ok(());
        }

        Err(RotationError::ValidationFailed {
            username: username.to_string(),
            detail: self
                .detail
                .unwrap_or_else(|| "validation failed".to_string()),
        })
    }
}

/// Checks that the application works with a credential.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Validates `credential`, probing `health_url` when given.
    async fn validate(&self, credential: &DbCredential, health_url: Option<&str>) -> ValidationResult;
}

/// Database probe plus HTTP health check.
///
/// Redirects are not followed: a 301 or 302 from the application's login
/// page counts as healthy.
pub struct ConnectivityValidator {
    db: Arc<dyn DatabaseAdmin>,
    http: reqwest::Client,
}

impl ConnectivityValidator {
    /// Creates a validator.
    ///
    /// `accept_invalid_certs` allows self-signed certificates on the health
    /// endpoint.
    pub fn new(db: Arc<dyn DatabaseAdmin>, accept_invalid_certs: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(HEALTH_TIMEOUT)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| RotationError::HealthCheck(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { db, http })
    }

    async fn check_health(&self, url: &str) -> std::result::Result<(), String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| format!("health probe {url} unreachable: {e}"))?;

        let status = response.status();
        if status.is_success() || status.as_u16() == 301 || status.as_u16() == 302 {
            Ok(())
        } else {
            Err(format!("health probe {url} returned status {}", status.as_u16()))
        }
    }
}

#[async_trait]
impl Validator for ConnectivityValidator {
    async fn validate(&self, credential: &DbCredential, health_url: Option<&str>) -> ValidationResult {
        let mut detail = None;

        let database_ok = match self.db.probe(credential).await {
            Ok(()) => true,
            Err(err) => {
                detail = Some(format!("database check failed: {err}"));
                false
            }
        };

        let health_ok = match health_url {
            Some(url) => match self.check_health(url).await {
                Ok(()) => Some(true),
                Err(reason) => {
                    if detail.is_none() {
                        detail = Some(reason);
                    }
                    Some(false)
                }
            },
            None => None,
        };

        let ok = database_ok && health_ok.unwrap_or(true);
        tracing::info!(
            username = %credential.username,
            database_ok,
            health_ok = ?health_ok,
            ok,
            "validation finished"
        );

        ValidationResult {
            ok,
            database_ok,
            health_ok,
            detail,
        }
    }
}
