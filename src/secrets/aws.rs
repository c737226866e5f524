//! AWS Secrets Manager store.
//!
//! Integrates with AWS Secrets Manager using the official AWS SDK.
//!
//! # Requirements
//!
//! - AWS credentials configured via:
//!   - Environment variables (`AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`)
//!   - Web identity token (IRSA service account in Kubernetes)
//!   - IAM instance role
//! - `secretsmanager:GetSecretValue` and `secretsmanager:PutSecretValue` on
//!   both secrets
//!
//! # Example
//!
//! ```no_run
//! use slotmux::secrets::{aws::AwsSecretStore, SecretStore};
//! use slotmux::Config;
//!
//! #[tokio::main]
//! async fn main() -> slotmux::Result<()> {
//!     let config = Config::new("prod/openemr-slots", "prod/rds-admin").with_region("us-west-2");
//!
//!     let mut store = AwsSecretStore::new(&config);
//!     store.init().await?;
//!
//!     let secret = store.read_slot_secret().await?;
//!     println!("active slot: {}", secret.active_slot);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use aws_sdk_secretsmanager::error::{DisplayErrorContext, SdkError};
use aws_sdk_secretsmanager::operation::get_secret_value::GetSecretValueError;
use aws_sdk_secretsmanager::Client;

use super::{decode_admin_secret, decode_slot_secret, encode, SecretStore};
use crate::slot::{AdminCredential, SlotSecret};
use crate::{Config, Result, RotationError};

/// AWS Secrets Manager store for the slot and admin secrets.
pub struct AwsSecretStore {
    client: Option<Client>,
    region: Option<String>,
    endpoint: Option<String>,
    slot_secret_id: String,
    admin_secret_id: String,
}

impl AwsSecretStore {
    /// Creates a store from configuration. Call [`AwsSecretStore::init`]
    /// before use.
    pub fn new(config: &Config) -> Self {
        Self {
            client: None,
            region: config.region.clone(),
            endpoint: config.secrets_endpoint.clone(),
            slot_secret_id: config.slot_secret_id.clone(),
            admin_secret_id: config.admin_secret_id.clone(),
        }
    }

    /// Loads the SDK configuration and builds the client.
    pub async fn init(&mut self) -> Result<()> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

        if let Some(ref region) = self.region {
            config_loader = config_loader.region(aws_config::Region::new(region.clone()));
        }

        // Use custom endpoint if provided (for LocalStack testing)
        if let Some(ref endpoint) = self.endpoint {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        let sdk_config = config_loader.load().await;
        self.client = Some(Client::new(&sdk_config));

        tracing::debug!(region = ?self.region, endpoint = ?self.endpoint, "secrets manager client ready");
        Ok(())
    }

    fn client(&self) -> Result<&Client> {
        self.client.as_ref().ok_or_else(|| {
            RotationError::Config("secrets manager client not initialized; call init() first".into())
        })
    }

    async fn read_string(&self, secret_id: &str) -> Result<String> {
        let response = self
            .client()?
            .get_secret_value()
            .secret_id(secret_id)
            .send()
            .await
            .map_err(|e| read_error(secret_id, e))?;

        response
            .secret_string()
            .map(str::to_string)
            .ok_or_else(|| RotationError::secret_malformed(secret_id, "secret has no string value"))
    }

    async fn write_string(&self, secret_id: &str, content: String) -> Result<()> {
        self.client()?
            .put_secret_value()
            .secret_id(secret_id)
            .secret_string(content)
            .send()
            .await
            .map_err(|e| {
                RotationError::secret_unreachable(
                    secret_id,
                    format!("failed to update secret: {}", DisplayErrorContext(&e)),
                )
            })?;

        tracing::debug!(secret_id, "secret updated");
        Ok(())
    }
}

fn read_error<R>(secret_id: &str, err: SdkError<GetSecretValueError, R>) -> RotationError
where
    R: std::fmt::Debug,
{
    let reason = DisplayErrorContext(&err).to_string();
    match err {
        SdkError::ServiceError(ref service)
            if service.err().is_resource_not_found_exception()
                || service.err().is_invalid_parameter_exception()
                || service.err().is_invalid_request_exception() =>
        {
            RotationError::secret_malformed(secret_id, reason)
        }
        _ => RotationError::secret_unreachable(secret_id, reason),
    }
}

#[async_trait]
impl SecretStore for AwsSecretStore {
    fn name(&self) -> &str {
        "awssecrets"
    }

    async fn read_slot_secret(&self) -> Result<SlotSecret> {
        let raw = self.read_string(&self.slot_secret_id).await?;
        decode_slot_secret(&self.slot_secret_id, &raw)
    }

    async fn write_slot_secret(&self, secret: &SlotSecret) -> Result<()> {
        self.write_string(&self.slot_secret_id, encode(secret)?).await
    }

    async fn read_admin_secret(&self) -> Result<AdminCredential> {
        let raw = self.read_string(&self.admin_secret_id).await?;
        decode_admin_secret(&self.admin_secret_id, &raw)
    }

    async fn write_admin_secret(&self, admin: &AdminCredential) -> Result<()> {
        self.write_string(&self.admin_secret_id, encode(admin)?).await
    }
}
