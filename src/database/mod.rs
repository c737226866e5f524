//! Database user management.
//!
//! [`DatabaseAdmin`] is the wire-level seam (connect, probe, upsert, alter);
//! [`CredentialSynchronizer`] builds the idempotent "make this user have this
//! password" operation on top of it.

use async_trait::async_trait;
use std::sync::Arc;

use crate::slot::{AdminCredential, DbCredential};
use crate::validation::{validate_database_name, validate_username};
use crate::{Result, RotationError};

pub mod sql;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "mock")]
pub mod mock;

/// Wire-level database operations.
///
/// `admin` arguments are fully resolved connection parameters for a
/// superuser (see [`AdminCredential::connection`]).
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    /// Returns the driver name (e.g., "mysql", "mock").
    fn name(&self) -> &str;

    /// Connects with `credential` and runs `SELECT 1`.
    async fn probe(&self, credential: &DbCredential) -> Result<()>;

    /// Checks whether an account named `username` exists.
    async fn user_exists(&self, admin: &DbCredential, username: &str) -> Result<bool>;

    /// Creates the account if missing, then sets its password, TLS
    /// requirement and database grant. Safe to repeat.
    async fn upsert_user(&self, admin: &DbCredential, credential: &DbCredential) -> Result<()>;

    /// Changes an existing account's password.
    async fn alter_password(&self, admin: &DbCredential, username: &str, password: &str)
        -> Result<()>;
}

/// Outcome of [`CredentialSynchronizer::sync_user`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncResult {
    /// Whether the database had to be changed (or would be, in dry run)
    pub changed: bool,
}

/// Reconciles database users with the passwords recorded in the secret store.
///
/// # Example
///
/// ```
/// use slotmux::database::{mock::MockDatabase, CredentialSynchronizer};
/// use slotmux::DbCredential;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> slotmux::Result<()> {
///     let db = Arc::new(MockDatabase::new());
///     db.add_user("admin", "root-pw").await;
///
///     let admin = DbCredential::new("admin", "root-pw", "db", 3306, "openemr");
///     let desired = DbCredential::new("openemr_a", "p1", "db", 3306, "openemr");
///
///     let sync = CredentialSynchronizer::new(db.clone());
///     assert!(sync.sync_user(&desired, &admin).await?.changed);
///     assert!(!sync.sync_user(&desired, &admin).await?.changed);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct CredentialSynchronizer {
    db: Arc<dyn DatabaseAdmin>,
    dry_run: bool,
}

impl CredentialSynchronizer {
    /// Creates a synchronizer over `db`.
    pub fn new(db: Arc<dyn DatabaseAdmin>) -> Self {
        Self { db, dry_run: false }
    }

    /// Enables or disables dry-run mode (probe only, never mutate).
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// The underlying database driver.
    pub fn database(&self) -> &Arc<dyn DatabaseAdmin> {
        &self.db
    }

    /// Ensures `desired.username` exists and authenticates with
    /// `desired.password`.
    ///
    /// # Errors
    ///
    /// - [`RotationError::InvalidIdentifier`]: unsafe user or database name
    /// - [`RotationError::SyncVerificationFailed`]: the change did not take
    ///   effect
    /// - [`RotationError::Database`]: the admin connection or a statement
    ///   failed
    pub async fn sync_user(&self, desired: &DbCredential, admin: &DbCredential) -> Result<SyncResult> {
        validate_username(&desired.username)?;
        validate_database_name(&desired.database_name)?;

        if self.db.probe(desired).await.is_ok() {
            tracing::debug!(username = %desired.username, "database user already in sync");
            return Ok(SyncResult { changed: false });
        }

        if self.dry_run {
            tracing::info!(username = %desired.username, "dry run: database user would be updated");
            return Ok(SyncResult { changed: true });
        }

        // The full statement set runs either way, so a user left without
        // its grant by an interrupted run is repaired here.
        let exists = self.db.user_exists(admin, &desired.username).await?;
        tracing::info!(
            username = %desired.username,
            database = %desired.database_name,
            exists,
            "upserting database user"
        );
        self.db.upsert_user(admin, desired).await?;

        if let Err(err) = self.db.probe(desired).await {
            tracing::error!(username = %desired.username, error = %err, "password change did not verify");
            return Err(RotationError::SyncVerificationFailed {
                username: desired.username.clone(),
            });
        }

        Ok(SyncResult { changed: true })
    }

    /// Changes the admin account's password to `password` and verifies it.
    ///
    /// `fallback` supplies host and database when the admin record has none.
    /// The returned record is not persisted; the caller stores it, and should
    /// have recorded `password` as pending beforehand.
    pub async fn rotate_admin(
        &self,
        admin: &AdminCredential,
        password: &str,
        fallback: &DbCredential,
    ) -> Result<AdminCredential> {
        validate_username(&admin.username)?;

        if self.dry_run {
            tracing::info!(username = %admin.username, "dry run: admin password would be rotated");
            return Ok(admin.clone());
        }

        let rotated = admin.with_password(password);
        self.db
            .alter_password(&admin.connection(fallback), &admin.username, &rotated.password)
            .await?;

        if let Err(err) = self.db.probe(&rotated.connection(fallback)).await {
            tracing::error!(username = %admin.username, error = %err, "new admin password did not verify");
            return Err(RotationError::SyncVerificationFailed {
                username: admin.username.clone(),
            });
        }

        tracing::info!(username = %admin.username, "admin password rotated");
        Ok(rotated)
    }
}
