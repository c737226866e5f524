//! MySQL driver built on sqlx.
//!
//! Every operation opens a short-lived TLS connection. Admin connections
//! select no default database, since account statements are server-wide.
//! Account statements
//! are sent as plain text because the server does not accept placeholders in
//! `CREATE USER` / `ALTER USER`; see [`super::sql`] for how they are built.

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlSslMode};
use sqlx::{ConnectOptions, Connection};
use std::time::Duration;

use super::sql::{alter_password_statements, upsert_user_statements, ACCOUNT_HOST};
use super::DatabaseAdmin;
use crate::slot::DbCredential;
use crate::{Result, RotationError};

/// Connect timeout applied to every connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// MySQL implementation of [`DatabaseAdmin`].
#[derive(Debug, Clone)]
pub struct MySqlAdmin {
    connect_timeout: Duration,
}

impl Default for MySqlAdmin {
    fn default() -> Self {
        Self::new()
    }
}

impl MySqlAdmin {
    /// Creates a driver with the default 5 second connect timeout.
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn options(credential: &DbCredential, select_database: bool) -> MySqlConnectOptions {
        let options = MySqlConnectOptions::new()
            .host(&credential.host)
            .port(credential.port)
            .username(&credential.username)
            .password(&credential.password)
            .ssl_mode(MySqlSslMode::Required);

        if select_database && !credential.database_name.is_empty() {
            options.database(&credential.database_name)
        } else {
            options
        }
    }

    async fn connect(&self, credential: &DbCredential) -> Result<MySqlConnection> {
        self.open(Self::options(credential, true), credential).await
    }

    async fn connect_admin(&self, admin: &DbCredential) -> Result<MySqlConnection> {
        self.open(Self::options(admin, false), admin).await
    }

    async fn open(
        &self,
        options: MySqlConnectOptions,
        credential: &DbCredential,
    ) -> Result<MySqlConnection> {
        let target = format!("{}@{}:{}", credential.username, credential.host, credential.port);

        match tokio::time::timeout(self.connect_timeout, options.connect()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(RotationError::Database(format!("connect as {target}: {e}"))),
            Err(_) => Err(RotationError::Database(format!(
                "connect as {target}: timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }

    async fn execute_all(&self, admin: &DbCredential, statements: &[String]) -> Result<()> {
        let mut conn = self.connect_admin(admin).await?;

        for statement in statements {
            // Statement text carries a password; log only the verb.
            let verb = statement.split_whitespace().next().unwrap_or_default();
            sqlx::raw_sql(statement)
                .execute(&mut conn)
                .await
                .map_err(|e| RotationError::Database(format!("{verb} failed: {e}")))?;
        }

        close(conn).await;
        Ok(())
    }
}

async fn close(conn: MySqlConnection) {
    if let Err(e) = conn.close().await {
        tracing::debug!(error = %e, "error closing database connection");
    }
}

#[async_trait]
impl DatabaseAdmin for MySqlAdmin {
    fn name(&self) -> &str {
        "mysql"
    }

    async fn probe(&self, credential: &DbCredential) -> Result<()> {
        let mut conn = self.connect(credential).await?;

        let row: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&mut conn)
            .await
            .map_err(|e| RotationError::Database(format!("SELECT 1 failed: {e}")))?;

        close(conn).await;

        if row != 1 {
            return Err(RotationError::Database(format!(
                "SELECT 1 returned unexpected result {row}"
            )));
        }
        Ok(())
    }

    async fn user_exists(&self, admin: &DbCredential, username: &str) -> Result<bool> {
        let mut conn = self.connect_admin(admin).await?;

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM mysql.user WHERE user = ? AND host = ?")
                .bind(username)
                .bind(ACCOUNT_HOST)
            .fetch_one(&mut conn)
            .await
            .map_err(|e| RotationError::Database(format!("user lookup failed: {e}")))?;

        close(conn).await;
        Ok(count > 0)
    }

    async fn upsert_user(&self, admin: &DbCredential, credential: &DbCredential) -> Result<()> {
        let statements = upsert_user_statements(credential)?;
        self.execute_all(admin, &statements).await
    }

    async fn alter_password(
        &self,
        admin: &DbCredential,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let statements = alter_password_statements(username, password)?;
        self.execute_all(admin, &statements).await
    }
}
