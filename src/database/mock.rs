//! In-memory database for testing.
//!
//! Models the account and grant tables: a user authenticates when its stored
//! password matches and it holds a grant on the requested database.
//! Statements that would be sent to a real server are recorded.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::sql::{alter_password_statements, upsert_user_statements};
use super::DatabaseAdmin;
use crate::slot::DbCredential;
use crate::{Result, RotationError};

/// Grant entry held by accounts added with [`MockDatabase::add_user`].
const ALL_DATABASES: &str = "*";

/// Mock database with failure injection.
///
/// # Example
///
/// ```
/// use slotmux::database::{mock::MockDatabase, DatabaseAdmin};
/// use slotmux::DbCredential;
///
/// #[tokio::main]
/// async fn main() {
///     let db = MockDatabase::new();
///     db.add_user("openemr_a", "p1").await;
///
///     let cred = DbCredential::new("openemr_a", "p1", "db", 3306, "openemr");
///     assert!(db.probe(&cred).await.is_ok());
///
///     db.set_unreachable(true);
///     assert!(db.probe(&cred).await.is_err());
/// }
/// ```
#[derive(Default)]
pub struct MockDatabase {
    users: RwLock<HashMap<String, String>>,
    grants: RwLock<HashMap<String, HashSet<String>>>,
    statements: RwLock<Vec<String>>,
    interrupted: RwLock<HashSet<String>>,
    ignored: RwLock<HashSet<String>>,
    failing: RwLock<HashSet<String>>,
    unreachable: AtomicBool,
}

impl MockDatabase {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates an account with access to every database.
    pub async fn add_user(&self, username: impl Into<String>, password: impl Into<String>) {
        let username = username.into();
        self.grants
            .write()
            .await
            .insert(username.clone(), HashSet::from([ALL_DATABASES.to_string()]));
        self.users.write().await.insert(username, password.into());
    }

    /// Pre-populates an account that holds no grant.
    pub async fn add_user_without_grant(
        &self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) {
        let username = username.into();
        self.grants.write().await.insert(username.clone(), HashSet::new());
        self.users.write().await.insert(username, password.into());
    }

    /// Whether `username` may use `database`.
    pub async fn has_grant(&self, username: &str, database: &str) -> bool {
        self.grants
            .read()
            .await
            .get(username)
            .is_some_and(|dbs| dbs.contains(database) || dbs.contains(ALL_DATABASES))
    }

    /// The next upsert of `username` fails right after `CREATE USER`,
    /// leaving the account without its password change and grant.
    pub async fn interrupt_after_create(&self, username: impl Into<String>) {
        self.interrupted.write().await.insert(username.into());
    }

    /// Stored password of `username`.
    pub async fn password_of(&self, username: &str) -> Option<String> {
        self.users.read().await.get(username).cloned()
    }

    /// Statements executed so far, oldest first.
    pub async fn statements(&self) -> Vec<String> {
        self.statements.read().await.clone()
    }

    /// Password changes for `username` are accepted but have no effect.
    pub async fn ignore_password_changes(&self, username: impl Into<String>) {
        self.ignored.write().await.insert(username.into());
    }

    /// Creating or altering `username` fails with a database error.
    pub async fn fail_changes_for(&self, username: impl Into<String>) {
        self.failing.write().await.insert(username.into());
    }

    /// Clears every injected change failure.
    pub async fn clear_failures(&self) {
        self.failing.write().await.clear();
        self.ignored.write().await.clear();
    }

    /// Makes every connection attempt fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    async fn authenticate(&self, credential: &DbCredential) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RotationError::Database(format!(
                "can't connect to server on '{}' (timed out)",
                credential.host
            )));
        }

        let authenticated = self
            .users
            .read()
            .await
            .get(&credential.username)
            .is_some_and(|password| *password == credential.password);
        if !authenticated {
            return Err(RotationError::Database(format!(
                "access denied for user '{}'@'%'",
                credential.username
            )));
        }

        if !credential.database_name.is_empty()
            && !self
                .has_grant(&credential.username, &credential.database_name)
                .await
        {
            return Err(RotationError::Database(format!(
                "access denied for user '{}'@'%' to database '{}'",
                credential.username, credential.database_name
            )));
        }
        Ok(())
    }

    /// Admin connections select no database.
    async fn authenticate_admin(&self, admin: &DbCredential) -> Result<()> {
        let mut admin = admin.clone();
        admin.database_name.clear();
        self.authenticate(&admin).await
    }

    async fn check_failing(&self, username: &str) -> Result<()> {
        if self.failing.read().await.contains(username) {
            return Err(RotationError::Database(format!(
                "operation failed for user '{}'",
                username
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseAdmin for MockDatabase {
    fn name(&self) -> &str {
        "mock"
    }

    async fn probe(&self, credential: &DbCredential) -> Result<()> {
        self.authenticate(credential).await
    }

    async fn user_exists(&self, admin: &DbCredential, username: &str) -> Result<bool> {
        self.authenticate_admin(admin).await?;
        Ok(self.users.read().await.contains_key(username))
    }

    async fn upsert_user(&self, admin: &DbCredential, credential: &DbCredential) -> Result<()> {
        self.authenticate_admin(admin).await?;
        let mut statements = upsert_user_statements(credential)?.into_iter();
        self.check_failing(&credential.username).await?;
        let username = &credential.username;

        // CREATE USER IF NOT EXISTS
        self.statements.write().await.extend(statements.next());
        self.users
            .write()
            .await
            .entry(username.clone())
            .or_insert_with(|| credential.password.clone());
        self.grants.write().await.entry(username.clone()).or_default();

        if self.interrupted.write().await.remove(username) {
            return Err(RotationError::Database(
                "GRANT failed: lost connection to server during query".to_string(),
            ));
        }

        self.statements.write().await.extend(statements);
        if !self.ignored.read().await.contains(username) {
            self.users
                .write()
                .await
                .insert(username.clone(), credential.password.clone());
        }
        self.grants
            .write()
            .await
            .entry(username.clone())
            .or_default()
            .insert(credential.database_name.clone());
        Ok(())
    }

    async fn alter_password(
        &self,
        admin: &DbCredential,
        username: &str,
        password: &str,
    ) -> Result<()> {
        self.authenticate_admin(admin).await?;
        let statements = alter_password_statements(username, password)?;
        self.check_failing(username).await?;

        self.statements.write().await.extend(statements);
        if self.ignored.read().await.contains(username) {
            return Ok(());
        }

        let mut users = self.users.write().await;
        let entry = users.get_mut(username).ok_or_else(|| {
            RotationError::Database(format!("operation ALTER USER failed for '{}'@'%'", username))
        })?;
        *entry = password.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> DbCredential {
        DbCredential::new("admin", "root-pw", "db", 3306, "openemr")
    }

    #[tokio::test]
    async fn test_upsert_resets_existing_user() {
        let db = MockDatabase::new();
        db.add_user("admin", "root-pw").await;
        db.add_user_without_grant("openemr_a", "existing").await;

        let cred = DbCredential::new("openemr_a", "other", "db", 3306, "openemr");
        assert!(db.probe(&cred).await.is_err());

        db.upsert_user(&admin(), &cred).await.unwrap();
        assert_eq!(db.password_of("openemr_a").await.as_deref(), Some("other"));
        assert!(db.probe(&cred).await.is_ok());
        assert_eq!(db.statements().await.len(), 4);
    }

    #[tokio::test]
    async fn test_probe_requires_grant() {
        let db = MockDatabase::new();
        db.add_user_without_grant("openemr_a", "p1").await;

        let cred = DbCredential::new("openemr_a", "p1", "db", 3306, "openemr");
        let err = db.probe(&cred).await.unwrap_err();
        assert!(err.to_string().contains("to database 'openemr'"));
    }

    #[tokio::test]
    async fn test_alter_unknown_user_fails() {
        let db = MockDatabase::new();
        db.add_user("admin", "root-pw").await;

        assert!(db.alter_password(&admin(), "ghost", "pw").await.is_err());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let db = MockDatabase::new();
        db.add_user("admin", "root-pw").await;
        db.add_user("openemr_a", "p1").await;
        db.fail_changes_for("openemr_a").await;

        assert!(db.alter_password(&admin(), "openemr_a", "p2").await.is_err());
        assert!(db.statements().await.is_empty());

        db.clear_failures().await;
        db.alter_password(&admin(), "openemr_a", "p2").await.unwrap();
        assert_eq!(db.password_of("openemr_a").await.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn test_unreachable() {
        let db = MockDatabase::new();
        db.add_user("admin", "root-pw").await;
        db.set_unreachable(true);

        let err = db.user_exists(&admin(), "openemr_a").await.unwrap_err();
        assert!(err.to_string().contains("can't connect"));
    }
}
