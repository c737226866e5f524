//! Secret store access for the slot and admin secrets.
//!
//! This module defines the [`SecretStore`] trait the rotation engine reads
//! durable state through. Both secrets are whole JSON documents; every write
//! replaces the full record.

use async_trait::async_trait;

use crate::slot::{AdminCredential, SlotSecret};
use crate::{Result, RotationError};

#[cfg(feature = "aws")]
pub mod aws;

#[cfg(feature = "mock")]
pub mod mock;

/// Typed access to the slot secret and the admin secret.
///
/// Implementations must be `Send + Sync`. They do not retry; the rotation
/// engine wraps calls in its own bounded retry policy.
///
/// # Implementations
///
/// - **SDK-based**: AWS Secrets Manager (feature `aws`)
/// - **Testing**: in-memory store with error injection (feature `mock`)
///
/// # Example
///
/// ```
/// use slotmux::secrets::{mock::MockSecretStore, SecretStore};
/// use slotmux::{DbCredential, Slot, SlotSecret};
///
/// #[tokio::main]
/// async fn main() -> slotmux::Result<()> {
///     let store = MockSecretStore::new();
///     store
///         .set_slot_secret(&SlotSecret::new(
///             Slot::A,
///             DbCredential::new("openemr_a", "p1", "db", 3306, "openemr"),
///             DbCredential::new("openemr_b", "p2", "db", 3306, "openemr"),
///         ))
///         .await;
///
///     let secret = store.read_slot_secret().await?;
///     assert_eq!(secret.active().username, "openemr_a");
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns the store name (e.g., "awssecrets", "mock").
    fn name(&self) -> &str;

    /// Reads and decodes the slot secret.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::SecretUnavailable`] if the store cannot be
    /// reached (retryable) or the document is malformed (not retryable).
    async fn read_slot_secret(&self) -> Result<SlotSecret>;

    /// Replaces the slot secret.
    async fn write_slot_secret(&self, secret: &SlotSecret) -> Result<()>;

    /// Reads and decodes the admin secret.
    ///
    /// # Errors
    ///
    /// Same as [`SecretStore::read_slot_secret`].
    async fn read_admin_secret(&self) -> Result<AdminCredential>;

    /// Replaces the admin secret.
    async fn write_admin_secret(&self, admin: &AdminCredential) -> Result<()>;
}

/// Decodes a slot secret document, rejecting anything partially valid.
pub fn decode_slot_secret(secret_id: &str, raw: &str) -> Result<SlotSecret> {
    let secret: SlotSecret = serde_json::from_str(raw).map_err(|e| {
        RotationError::secret_malformed(secret_id, format!("invalid slot secret: {e}"))
    })?;

    if secret.a.username.is_empty() || secret.b.username.is_empty() {
        return Err(RotationError::secret_malformed(
            secret_id,
            "slot usernames must not be empty",
        ));
    }

    if secret.a.username == secret.b.username {
        return Err(RotationError::secret_malformed(
            secret_id,
            format!("slots A and B share the username {}", secret.a.username),
        ));
    }

    Ok(secret)
}

/// Decodes an admin secret document.
pub fn decode_admin_secret(secret_id: &str, raw: &str) -> Result<AdminCredential> {
    let admin: AdminCredential = serde_json::from_str(raw).map_err(|e| {
        RotationError::secret_malformed(secret_id, format!("invalid admin secret: {e}"))
    })?;

    if admin.username.is_empty() || admin.password.is_empty() {
        return Err(RotationError::secret_malformed(
            secret_id,
            "admin username and password are required",
        ));
    }

    Ok(admin)
}

/// Serializes a secret document as compact JSON.
pub fn encode<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLOTS: &str = r#"{"active_slot":"B","A":{"username":"openemr_a","password":"p1","host":"db","port":"3306","dbname":"openemr"},"B":{"username":"openemr_b","password":"p2","host":"db","port":"3306","dbname":"openemr"}}"#;

    #[test]
    fn test_decode_slot_secret() {
        let secret = decode_slot_secret("slots", SLOTS).unwrap();
        assert_eq!(secret.active().username, "openemr_b");
        assert_eq!(encode(&secret).unwrap(), SLOTS);
    }

    #[test]
    fn test_malformed_slot_secret_not_retryable() {
        let cases = [
            "not json",
            r#"{"A": {}, "B": {}}"#,
            r#"{"active_slot": "A", "A": {"username": "u", "password": "p", "host": "h", "dbname": "d"}}"#,
        ];

        for raw in cases {
            let err = decode_slot_secret("slots", raw).unwrap_err();
            assert!(!err.is_retryable(), "{raw}");
            assert!(matches!(err, RotationError::SecretUnavailable { .. }));
        }
    }

    #[test]
    fn test_shared_username_rejected() {
        let raw = SLOTS.replace("openemr_b", "openemr_a");
        let err = decode_slot_secret("slots", &raw).unwrap_err();
        assert!(err.to_string().contains("share the username"));
    }

    #[test]
    fn test_decode_admin_secret() {
        let admin =
            decode_admin_secret("admin", r#"{"username":"root","password":"pw","engine":"mysql"}"#)
                .unwrap();
        assert_eq!(admin.username, "root");
        assert!(admin.host.is_empty());

        assert!(decode_admin_secret("admin", r#"{"username":"root","password":""}"#).is_err());
    }
}
