//! In-memory secret store for testing.
//!
//! Documents are kept as raw JSON strings so malformed payloads can be
//! injected and go through the same decoding as a real store.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;

use super::{decode_admin_secret, decode_slot_secret, encode, SecretStore};
use crate::slot::{AdminCredential, SlotSecret};
use crate::{Result, RotationError};

const SLOT_SECRET_ID: &str = "mock/slots";
const ADMIN_SECRET_ID: &str = "mock/admin";

/// Mock secret store for testing.
///
/// Records every write so tests can assert on the order of persisted
/// states.
///
/// # Example
///
/// ```
/// use slotmux::secrets::{mock::MockSecretStore, SecretStore};
/// use slotmux::RotationError;
///
/// #[tokio::main]
/// async fn main() {
///     let mut store = MockSecretStore::new();
///     store.set_raw_slot_secret("{not json").await;
///
///     let err = store.read_slot_secret().await.unwrap_err();
///     assert!(!err.is_retryable());
///
///     store.write_error = Some(RotationError::secret_unreachable("mock/slots", "throttled"));
/// }
/// ```
#[derive(Default)]
pub struct MockSecretStore {
    slot_secret: RwLock<Option<String>>,
    admin_secret: RwLock<Option<String>>,
    slot_writes: RwLock<Vec<SlotSecret>>,
    admin_writes: RwLock<Vec<AdminCredential>>,
    transient_read_failures: AtomicU32,
    admin_writes_until_outage: RwLock<Option<u32>>,

    /// Error to return from `read_slot_secret()` and `read_admin_secret()`
    pub read_error: Option<RotationError>,
    /// Error to return from `write_slot_secret()`
    pub write_error: Option<RotationError>,
    /// Error to return from `write_admin_secret()`
    pub admin_write_error: Option<RotationError>,
}

impl MockSecretStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates the slot secret.
    pub async fn set_slot_secret(&self, secret: &SlotSecret) {
        *self.slot_secret.write().await = serde_json::to_string(secret).ok();
    }

    /// Pre-populates the slot secret with a raw (possibly malformed) document.
    pub async fn set_raw_slot_secret(&self, raw: impl Into<String>) {
        *self.slot_secret.write().await = Some(raw.into());
    }

    /// Pre-populates the admin secret.
    pub async fn set_admin_secret(&self, admin: &AdminCredential) {
        *self.admin_secret.write().await = serde_json::to_string(admin).ok();
    }

    /// Makes the next `count` reads fail with a retryable error.
    pub fn fail_next_reads(&self, count: u32) {
        self.transient_read_failures.store(count, Ordering::SeqCst);
    }

    /// Lets `successes` more admin writes through, then fails every admin
    /// write with a retryable error until [`restore_admin_writes`] is called.
    ///
    /// [`restore_admin_writes`]: MockSecretStore::restore_admin_writes
    pub async fn fail_admin_writes_after(&self, successes: u32) {
        *self.admin_writes_until_outage.write().await = Some(successes);
    }

    /// Ends an outage started by [`fail_admin_writes_after`].
    ///
    /// [`fail_admin_writes_after`]: MockSecretStore::fail_admin_writes_after
    pub async fn restore_admin_writes(&self) {
        *self.admin_writes_until_outage.write().await = None;
    }

    /// Current slot secret, decoded.
    pub async fn slot_secret(&self) -> Option<SlotSecret> {
        let raw = self.slot_secret.read().await.clone()?;
        decode_slot_secret(SLOT_SECRET_ID, &raw).ok()
    }

    /// Current admin secret, decoded.
    pub async fn admin_secret(&self) -> Option<AdminCredential> {
        let raw = self.admin_secret.read().await.clone()?;
        decode_admin_secret(ADMIN_SECRET_ID, &raw).ok()
    }

    /// Every slot secret written so far, oldest first.
    pub async fn slot_writes(&self) -> Vec<SlotSecret> {
        self.slot_writes.read().await.clone()
    }

    /// Every admin secret written so far, oldest first.
    pub async fn admin_writes(&self) -> Vec<AdminCredential> {
        self.admin_writes.read().await.clone()
    }

    fn check_read(&self, secret_id: &str) -> Result<()> {
        if let Some(ref err) = self.read_error {
            return Err(replay(secret_id, err));
        }

        let remaining = self.transient_read_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_read_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(RotationError::secret_unreachable(
                secret_id,
                "simulated connection reset",
            ));
        }

        Ok(())
    }
}

// RotationError is not Clone; injected errors keep their retry classification.
fn replay(secret_id: &str, err: &RotationError) -> RotationError {
    match err {
        RotationError::SecretUnavailable {
            reason, retryable, ..
        } => RotationError::SecretUnavailable {
            secret_id: secret_id.to_string(),
            reason: reason.clone(),
            retryable: *retryable,
        },
        other => RotationError::Other(anyhow::anyhow!("{}", other)),
    }
}

#[async_trait]
impl SecretStore for MockSecretStore {
    fn name(&self) -> &str {
        "mock"
    }

    async fn read_slot_secret(&self) -> Result<SlotSecret> {
        self.check_read(SLOT_SECRET_ID)?;

        let raw = self.slot_secret.read().await.clone().ok_or_else(|| {
            RotationError::secret_malformed(SLOT_SECRET_ID, "secret does not exist")
        })?;
        decode_slot_secret(SLOT_SECRET_ID, &raw)
    }

    async fn write_slot_secret(&self, secret: &SlotSecret) -> Result<()> {
        if let Some(ref err) = self.write_error {
            return Err(replay(SLOT_SECRET_ID, err));
        }

        *self.slot_secret.write().await = Some(encode(secret)?);
        self.slot_writes.write().await.push(secret.clone());
        Ok(())
    }

    async fn read_admin_secret(&self) -> Result<AdminCredential> {
        self.check_read(ADMIN_SECRET_ID)?;

        let raw = self.admin_secret.read().await.clone().ok_or_else(|| {
            RotationError::secret_malformed(ADMIN_SECRET_ID, "secret does not exist")
        })?;
        decode_admin_secret(ADMIN_SECRET_ID, &raw)
    }

    async fn write_admin_secret(&self, admin: &AdminCredential) -> Result<()> {
        if let Some(ref err) = self.admin_write_error {
            return Err(replay(ADMIN_SECRET_ID, err));
        }

        if let Some(remaining) = self.admin_writes_until_outage.write().await.as_mut() {
            if *remaining == 0 {
                return Err(RotationError::secret_unreachable(ADMIN_SECRET_ID, "throttled"));
            }
            *remaining -= 1;
        }

        *self.admin_secret.write().await = Some(encode(admin)?);
        self.admin_writes.write().await.push(admin.clone());
        Ok(())
    }
}
