//! SQL text for account management statements.
//!
//! Account statements do not accept placeholders for the account name, so
//! they are assembled as text from validated identifiers and escaped
//! literals.

use crate::slot::DbCredential;
use crate::validation::{quote_literal, validate_database_name, validate_username};
use crate::Result;

/// Host part of every managed account.
pub const ACCOUNT_HOST: &str = "%";

fn account(username: &str) -> String {
    format!("'{}'@'{}'", username, ACCOUNT_HOST)
}

/// Statements bringing an application user to the credential's state.
///
/// Every statement is idempotent, so the full set is safe to re-run after a
/// partial failure: a user left behind without its grant is repaired by the
/// next call.
///
/// ```
/// use slotmux::database::sql::upsert_user_statements;
/// use slotmux::DbCredential;
///
/// let cred = DbCredential::new("openemr_b", "p2", "db", 3306, "openemr");
/// let statements = upsert_user_statements(&cred).unwrap();
///
/// assert_eq!(
///     statements[0],
///     "CREATE USER IF NOT EXISTS 'openemr_b'@'%' IDENTIFIED BY 'p2' REQUIRE SSL"
/// );
/// assert_eq!(statements[1], "ALTER USER 'openemr_b'@'%' IDENTIFIED BY 'p2' REQUIRE SSL");
/// assert_eq!(statements[2], "GRANT ALL PRIVILEGES ON `openemr`.* TO 'openemr_b'@'%'");
/// assert_eq!(statements[3], "FLUSH PRIVILEGES");
/// ```
pub fn upsert_user_statements(credential: &DbCredential) -> Result<Vec<String>> {
    validate_username(&credential.username)?;
    validate_database_name(&credential.database_name)?;

    let account = account(&credential.username);
    let password = quote_literal(&credential.password);
    Ok(vec![
        format!("CREATE USER IF NOT EXISTS {account} IDENTIFIED BY {password} REQUIRE SSL"),
        format!("ALTER USER {account} IDENTIFIED BY {password} REQUIRE SSL"),
        format!(
            "GRANT ALL PRIVILEGES ON `{}`.* TO {}",
            credential.database_name, account
        ),
        "FLUSH PRIVILEGES".to_string(),
    ])
}

/// Statements changing an existing user's password.
pub fn alter_password_statements(username: &str, password: &str) -> Result<Vec<String>> {
    validate_username(username)?;

    Ok(vec![
        format!(
            "ALTER USER {} IDENTIFIED BY {}",
            account(username),
            quote_literal(password)
        ),
        "FLUSH PRIVILEGES".to_string(),
    ])
}
