//! Slot and credential data structures.
//!
//! The slot secret holds two interchangeable credential sets (`A` and `B`)
//! plus a pointer to the one the application should be using. Everything the
//! rotation engine decides is derived from this record and the shared config
//! file on disk.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Default MySQL port used when a record omits it.
pub const DEFAULT_PORT: u16 = 3306;

/// Length of generated passwords.
pub const PASSWORD_LENGTH: usize = 30;

/// One of the two credential slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    /// Slot A
    A,
    /// Slot B
    B,
}

impl Slot {
    /// Returns the other slot.
    ///
    /// ```
    /// use slotmux::Slot;
    ///
    /// assert_eq!(Slot::A.standby(), Slot::B);
    /// assert_eq!(Slot::B.standby(), Slot::A);
    /// ```
    pub fn standby(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    /// Both slots, in a stable order.
    pub const ALL: [Slot; 2] = [Slot::A, Slot::B];
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// A database credential record.
///
/// This is the shape stored for each slot, for the admin secret, and the
/// projection written to the runtime secret and the shared config file.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbCredential {
    /// Database user name
    pub username: String,

    /// Password
    pub password: String,

    /// Database host
    pub host: String,

    /// Database port
    #[serde(
        default = "default_port",
        deserialize_with = "deserialize_port",
        serialize_with = "serialize_port"
    )]
    pub port: u16,

    /// Target database (schema) name
    #[serde(rename = "dbname", alias = "database_name")]
    pub database_name: String,
}

impl DbCredential {
    /// Creates a credential record.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        database_name: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            host: host.into(),
            port,
            database_name: database_name.into(),
        }
    }

    /// Returns a copy with a different password.
    pub fn with_password(&self, password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            ..self.clone()
        }
    }

    /// Returns a copy authenticating as a different user.
    pub fn as_user(&self, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..self.clone()
        }
    }
}

impl fmt::Debug for DbCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_name", &self.database_name)
            .finish()
    }
}

/// Superuser credential used for user management.
///
/// Managed database secrets often omit `host` and `dbname`; those fall back
/// to the application slot's values when connecting. Extra keys (such as
/// `engine`) are preserved when the secret is rewritten.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminCredential {
    /// Superuser name
    pub username: String,

    /// Superuser password
    pub password: String,

    /// Database host (empty when the secret does not record one)
    #[serde(default)]
    pub host: String,

    /// Database port
    #[serde(
        default = "default_port",
        deserialize_with = "deserialize_port",
        serialize_with = "serialize_port"
    )]
    pub port: u16,

    /// Database to connect to (empty when the secret does not record one)
    #[serde(default, rename = "dbname", alias = "database_name")]
    pub database_name: String,

    /// Password an admin rotation is about to set. Recorded before the
    /// change so the new password is never known only in memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_password: Option<String>,

    /// Unknown keys, preserved across read-modify-write
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AdminCredential {
    /// Creates an admin credential.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            host: host.into(),
            port,
            database_name: String::new(),
            pending_password: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Connection parameters, filling gaps from an application credential.
    pub fn connection(&self, fallback: &DbCredential) -> DbCredential {
        let host = if self.host.is_empty() {
            fallback.host.clone()
        } else {
            self.host.clone()
        };
        let database_name = if self.database_name.is_empty() {
            fallback.database_name.clone()
        } else {
            self.database_name.clone()
        };

        DbCredential {
            username: self.username.clone(),
            password: self.password.clone(),
            host,
            port: self.port,
            database_name,
        }
    }

    /// Returns a copy with a different password and no pending password.
    pub fn with_password(&self, password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            pending_password: None,
            ..self.clone()
        }
    }

    /// Returns a copy announcing `password` as the next admin password.
    pub fn with_pending_password(&self, password: impl Into<String>) -> Self {
        Self {
            pending_password: Some(password.into()),
            ..self.clone()
        }
    }
}

impl fmt::Debug for AdminCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("pending_password", &self.pending_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

// Older records store the port as a string.
fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortRepr {
        Number(u16),
        Text(String),
    }

    match PortRepr::deserialize(deserializer)? {
        PortRepr::Number(port) => Ok(port),
        PortRepr::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port: {text}"))),
    }
}

fn serialize_port<S>(port: &u16, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&port.to_string())
}

/// The slot secret document.
///
/// Every write is a full-record replace, so callers read, modify and write
/// the whole structure. Keys this crate does not know about are carried
/// through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSecret {
    /// Slot the application should be using
    pub active_slot: Slot,

    /// Slot A credentials
    #[serde(rename = "A")]
    pub a: DbCredential,

    /// Slot B credentials
    #[serde(rename = "B")]
    pub b: DbCredential,

    /// Previous active slot whose password still has to be rotated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_slot: Option<Slot>,

    /// Unknown keys, preserved across read-modify-write
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SlotSecret {
    /// Creates a slot secret with no pending cleanup.
    pub fn new(active_slot: Slot, a: DbCredential, b: DbCredential) -> Self {
        Self {
            active_slot,
            a,
            b,
            stale_slot: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Returns the credential stored in `slot`.
    pub fn slot(&self, slot: Slot) -> &DbCredential {
        match slot {
            Slot::A => &self.a,
            Slot::B => &self.b,
        }
    }

    /// Returns a mutable reference to the credential stored in `slot`.
    pub fn slot_mut(&mut self, slot: Slot) -> &mut DbCredential {
        match slot {
            Slot::A => &mut self.a,
            Slot::B => &mut self.b,
        }
    }

    /// Returns the active slot's credential.
    pub fn active(&self) -> &DbCredential {
        self.slot(self.active_slot)
    }

    /// Returns the standby slot's credential.
    pub fn standby(&self) -> &DbCredential {
        self.slot(self.active_slot.standby())
    }
}

/// Generates a random alphanumeric password.
///
/// Uses the thread-local RNG, which is seeded from the operating system.
///
/// ```
/// let password = slotmux::slot::generate_password(slotmux::slot::PASSWORD_LENGTH);
/// assert_eq!(password.len(), 30);
/// assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
/// ```
pub fn generate_password(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}
