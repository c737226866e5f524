//! Input validation for values interpolated into SQL.
//!
//! MySQL does not accept placeholders for account names or database names in
//! `CREATE USER`, `ALTER USER` and `GRANT`, so those statements are built as
//! text. Identifiers are restricted to a safe character set and string
//! literals are escaped.

use crate::{Result, RotationError};

/// Maximum length of a MySQL account name.
const MAX_USERNAME_LENGTH: usize = 32;

/// Maximum length of a MySQL database name.
const MAX_DATABASE_NAME_LENGTH: usize = 64;

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Validates a database account name.
///
/// Only ASCII letters, digits and underscores are accepted.
///
/// # Errors
///
/// Returns [`RotationError::InvalidIdentifier`] if validation fails.
///
/// # Example
///
/// ```
/// use slotmux::validation::validate_username;
///
/// assert!(validate_username("openemr_a").is_ok());
/// assert!(validate_username("").is_err());
/// assert!(validate_username("a'@'%; DROP USER root").is_err());
/// ```
pub fn validate_username(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RotationError::InvalidIdentifier(
            "username cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_USERNAME_LENGTH {
        return Err(RotationError::InvalidIdentifier(format!(
            "username exceeds maximum length of {} characters",
            MAX_USERNAME_LENGTH
        )));
    }

    if !name.chars().all(is_identifier_char) {
        return Err(RotationError::InvalidIdentifier(format!(
            "unsupported characters in username: {}",
            name
        )));
    }

    Ok(())
}

/// Validates a database (schema) name used in `GRANT ... ON <db>.*`.
pub fn validate_database_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RotationError::InvalidIdentifier(
            "database name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_DATABASE_NAME_LENGTH {
        return Err(RotationError::InvalidIdentifier(format!(
            "database name exceeds maximum length of {} characters",
            MAX_DATABASE_NAME_LENGTH
        )));
    }

    if !name.chars().all(is_identifier_char) {
        return Err(RotationError::InvalidIdentifier(format!(
            "unsupported dbname for rotation: {}",
            name
        )));
    }

    Ok(())
}

/// Quotes a value as a single-quoted MySQL string literal.
///
/// ```
/// use slotmux::validation::quote_literal;
///
/// assert_eq!(quote_literal("abc"), "'abc'");
/// assert_eq!(quote_literal("it's"), "'it\\'s'");
/// ```
pub fn quote_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        match c {
            '\\' => quoted.push_str("\\\\"),
            '\'' => quoted.push_str("\\'"),
            '\0' => quoted.push_str("\\0"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\x1a' => quoted.push_str("\\Z"),
            _ => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_usernames() {
        assert!(validate_username("openemr_a").is_ok());
        assert!(validate_username("admin").is_ok());
        assert!(validate_username("USER_123").is_ok());
    }

    #[test]
    fn test_username_too_long() {
        let long_name = "a".repeat(33);
        let result = validate_username(&long_name);
        assert!(result.unwrap_err().to_string().contains("maximum length"));
    }

    #[test]
    fn test_injection_attempts() {
        let dangerous = vec![
            "user'@'%",
            "user; DROP DATABASE openemr",
            "user`",
            "user name",
            "user\"",
            "user\\",
            "user-name",
            "user\0",
        ];

        for name in dangerous {
            assert!(validate_username(name).is_err(), "expected '{}' to fail", name);
            assert!(validate_database_name(name).is_err(), "expected '{}' to fail", name);
        }
    }

    #[test]
    fn test_database_names() {
        assert!(validate_database_name("openemr").is_ok());
        assert!(validate_database_name("open_emr_2").is_ok());

        let result = validate_database_name("");
        assert!(result.unwrap_err().to_string().contains("empty"));
        assert!(validate_database_name(&"d".repeat(65)).is_err());
    }

    #[test]
    fn test_quote_literal_escapes() {
        assert_eq!(quote_literal(""), "''");
        assert_eq!(quote_literal("a\\b"), "'a\\\\b'");
        assert_eq!(quote_literal("x'; DROP"), "'x\\'; DROP'");
        assert_eq!(quote_literal("line\nbreak"), "'line\\nbreak'");
    }
}
