//! End-to-end rotation runs over the in-memory collaborators.
//!
//! Each test drives a [`RotationEngine`] against a real file on disk and the
//! mock secret store, database and orchestrator, then inspects the durable
//! state the way the next run would see it.

#![cfg(feature = "mock")]

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use slotmux::database::mock::MockDatabase;
use slotmux::database::DatabaseAdmin;
use slotmux::retry::RetryPolicy;
use slotmux::rotation::{RotationEngine, RunStatus, Severity};
use slotmux::runtime::mock::MockCoordinator;
use slotmux::runtime::RolloutResult;
use slotmux::secrets::mock::MockSecretStore;
use slotmux::slot::PASSWORD_LENGTH;
use slotmux::sqlconf;
use slotmux::validator::{ValidationResult, Validator};
use slotmux::{AdminCredential, Config, DbCredential, Slot, SlotSecret};

const HOST: &str = "db.cluster.internal";

fn slot_a() -> DbCredential {
    DbCredential::new("openemr_a", "p1", HOST, 3306, "openemr")
}

fn slot_b() -> DbCredential {
    DbCredential::new("openemr_b", "p2", HOST, 3306, "openemr")
}

fn sqlconf_for(cred: &DbCredential) -> String {
    format!(
        "<?php\n//  OpenEMR\n//  MySQL Config\n\n$host   = '{}';\n$port   = '{}';\n$login  = '{}';\n$pass   = '{}';\n$dbase  = '{}';\n$db_encoding = 'utf8mb4';\n\n$sqlconf = array();\nglobal $sqlconf;\n$sqlconf[\"login\"] = $login;\n$config = 1;\n",
        cred.host, cred.port, cred.username, cred.password, cred.database_name
    )
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base_delay_ms: 1,
        max_delay_ms: 2,
        multiplier: 2.0,
        jitter: false,
    }
}

/// Validator that checks the database and can be told to fail for a user.
struct ScriptedValidator {
    db: Arc<MockDatabase>,
    failing: Mutex<HashSet<String>>,
    checked: Mutex<Vec<String>>,
}

impl ScriptedValidator {
    fn new(db: Arc<MockDatabase>) -> Self {
        Self {
            db,
            failing: Mutex::new(HashSet::new()),
            checked: Mutex::new(Vec::new()),
        }
    }

    fn fail_for(&self, username: &str) {
        self.failing.lock().unwrap().insert(username.to_string());
    }

    fn checked(&self) -> Vec<String> {
        self.checked.lock().unwrap().clone()
    }
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn validate(&self, credential: &DbCredential, _health_url: Option<&str>) -> ValidationResult {
        self.checked.lock().unwrap().push(credential.username.clone());
        let forced = self.failing.lock().unwrap().contains(&credential.username);

        let database_ok = !forced && self.db.probe(credential).await.is_ok();
        ValidationResult {
            ok: database_ok,
            database_ok,
            health_ok: None,
            detail: (!database_ok).then(|| format!("SELECT 1 as {} failed", credential.username)),
        }
    }
}

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    path: PathBuf,
    secrets: Arc<MockSecretStore>,
    db: Arc<MockDatabase>,
    runtime: Arc<MockCoordinator>,
    validator: Arc<ScriptedValidator>,
}

impl Harness {
    /// Secrets seeded with slots A/B (active A); the file holds `on_disk`;
    /// the database knows only the admin.
    async fn new(on_disk: &DbCredential) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::create_dir(root.join("default")).unwrap();
        let path = root.join("default").join("sqlconf.php");
        std::fs::write(&path, sqlconf_for(on_disk)).unwrap();

        let secrets = Arc::new(MockSecretStore::new());
        secrets
            .set_slot_secret(&SlotSecret::new(Slot::A, slot_a(), slot_b()))
            .await;
        secrets
            .set_admin_secret(&AdminCredential::new("admin", "root-pw", "", 3306))
            .await;

        let db = Arc::new(MockDatabase::new());
        db.add_user("admin", "root-pw").await;

        Self {
            _dir: dir,
            root,
            path,
            secrets,
            validator: Arc::new(ScriptedValidator::new(db.clone())),
            db,
            runtime: Arc::new(MockCoordinator::new()),
        }
    }

    /// A healthy system running on slot A.
    async fn steady() -> Self {
        let h = Self::new(&slot_a()).await;
        h.db.add_user("openemr_a", "p1").await;
        h.db.add_user("openemr_b", "p2").await;
        h.runtime.set_runtime_secret(slot_a()).await;
        h
    }

    fn config(&self) -> Config {
        Config::new("mock/slots", "mock/admin")
            .with_sites_mount_root(self.root.clone())
            .with_kubernetes("openemr", "openemr", "openemr-db-credentials")
            .with_file_owner(None)
            .with_rollout_timeout(Duration::from_secs(60))
            .with_retry(fast_retry())
    }

    fn engine(&self) -> RotationEngine {
        self.engine_with(self.config())
    }

    fn engine_with(&self, config: Config) -> RotationEngine {
        RotationEngine::new(
            config,
            self.secrets.clone(),
            self.db.clone(),
            self.runtime.clone(),
            self.validator.clone(),
        )
    }

    fn file(&self) -> String {
        std::fs::read_to_string(&self.path).unwrap()
    }

    async fn secret(&self) -> SlotSecret {
        self.secrets.slot_secret().await.unwrap()
    }

    async fn assert_both_slots_connect(&self) {
        let secret = self.secret().await;
        for slot in Slot::ALL {
            assert!(
                self.db.probe(secret.slot(slot)).await.is_ok(),
                "slot {slot} cannot connect"
            );
        }
    }
}

#[tokio::test]
async fn test_rotation_moves_to_standby_and_refreshes_old_slot() {
    let h = Harness::steady().await;

    let report = h.engine().run().await;
    assert_eq!(report.status, RunStatus::Rotated, "{report}");
    assert_eq!(report.active_slot, Some(Slot::B));
    assert_eq!(report.previous_slot, Some(Slot::A));
    assert_eq!(report.exit_code(), 0);

    assert!(sqlconf::parse(&h.file()).matches(&slot_b()));
    assert_eq!(h.runtime.runtime_secret().await, Some(slot_b()));
    assert_eq!(h.runtime.restarts(), 1);

    let secret = h.secret().await;
    assert_eq!(secret.active_slot, Slot::B);
    assert_eq!(secret.stale_slot, None);
    assert_eq!(secret.b, slot_b());
    assert_ne!(secret.a.password, "p1");
    assert_eq!(secret.a.password.len(), PASSWORD_LENGTH);
    assert_eq!(h.db.password_of("openemr_a").await, Some(secret.a.password.clone()));

    let admin = h.secrets.admin_secret().await.unwrap();
    assert_ne!(admin.password, "root-pw");
    assert_eq!(h.db.password_of("admin").await, Some(admin.password));
}

#[tokio::test]
async fn test_flip_is_persisted_with_stale_marker() {
    let h = Harness::steady().await;
    h.engine().run().await;

    let writes = h.secrets.slot_writes().await;
    assert_eq!(writes.len(), 3);
    assert_eq!(writes[0].active_slot, Slot::B);
    assert_eq!(writes[0].stale_slot, Some(Slot::A));
    assert_eq!(writes[0].a.password, "p1");

    // The marker outlives the slot rotation until the admin is rotated too.
    assert_eq!(writes[1].stale_slot, Some(Slot::A));
    assert_ne!(writes[1].a.password, "p1");
    assert_eq!(writes[2].stale_slot, None);
    assert_eq!(writes[2].a, writes[1].a);
}

#[tokio::test]
async fn test_two_runs_return_to_original_slot() {
    let h = Harness::steady().await;

    let first = h.engine().run().await;
    assert_eq!(first.status, RunStatus::Rotated);
    h.assert_both_slots_connect().await;

    let second = h.engine().run().await;
    assert_eq!(second.status, RunStatus::Rotated, "{second}");
    assert_eq!(second.active_slot, Some(Slot::A));
    h.assert_both_slots_connect().await;

    let secret = h.secret().await;
    assert_eq!(secret.active_slot, Slot::A);
    assert!(sqlconf::parse(&h.file()).matches(&secret.a));
    assert_eq!(h.runtime.runtime_secret().await, Some(secret.a.clone()));
    assert_ne!(secret.b.password, "p2");
}

#[tokio::test]
async fn test_validation_failure_restores_everything() {
    let h = Harness::steady().await;
    h.validator.fail_for("openemr_b");
    let before = h.file();

    let report = h.engine().run().await;
    assert_eq!(report.status, RunStatus::RolledBack, "{report}");
    assert_eq!(report.severity, Severity::Warning);
    assert_eq!(report.exit_code(), 1);
    assert!(report.error.unwrap().contains("openemr_b"));

    assert_eq!(h.file(), before);
    assert_eq!(h.runtime.runtime_secret().await, Some(slot_a()));
    assert_eq!(h.runtime.patches().await, vec![slot_b(), slot_a()]);
    assert_eq!(h.runtime.restarts(), 2);
    assert_eq!(h.validator.checked(), vec!["openemr_b", "openemr_a"]);

    assert!(h.secrets.slot_writes().await.is_empty());
    assert_eq!(h.secret().await.active_slot, Slot::A);
    assert!(h.secrets.admin_writes().await.is_empty());
}

#[tokio::test]
async fn test_rollout_timeout_rolls_back() {
    let h = Harness::steady().await;
    h.runtime.push_rollout_result(RolloutResult::timed_out()).await;
    let before = h.file();

    let report = h.engine().run().await;
    assert_eq!(report.status, RunStatus::RolledBack, "{report}");
    assert!(report.error.unwrap().contains("did not complete"));

    assert_eq!(h.file(), before);
    assert_eq!(h.runtime.runtime_secret().await, Some(slot_a()));
    assert_eq!(h.secret().await.active_slot, Slot::A);
}

#[tokio::test]
async fn test_failed_rollback_is_critical() {
    let h = Harness::steady().await;
    h.validator.fail_for("openemr_b");
    h.validator.fail_for("openemr_a");

    let report = h.engine().run().await;
    assert_eq!(report.status, RunStatus::RollbackFailed, "{report}");
    assert_eq!(report.severity, Severity::Critical);
    assert!(report.to_string().contains("manual intervention required"));

    // The pointer is never written when the switch fails.
    assert!(h.secrets.slot_writes().await.is_empty());
}

#[tokio::test]
async fn test_drift_corrects_pointer_first() {
    let h = Harness::new(&slot_b()).await;
    h.db.add_user("openemr_a", "p1").await;
    h.db.add_user("openemr_b", "p2").await;
    h.runtime.set_runtime_secret(slot_a()).await;
    let before = h.file();

    let report = h.engine().run().await;
    assert_eq!(report.status, RunStatus::Reconciled, "{report}");
    assert_eq!(report.active_slot, Some(Slot::B));

    let writes = h.secrets.slot_writes().await;
    assert_eq!(writes[0].active_slot, Slot::B);
    assert_eq!(writes[0].stale_slot, None);
    assert!(writes.iter().all(|w| w.active_slot == Slot::B));

    // Never flips back to A.
    assert_eq!(h.file(), before);
    assert_eq!(h.runtime.runtime_secret().await, Some(slot_b()));

    let secret = h.secret().await;
    assert_eq!(secret.active_slot, Slot::B);
    assert_eq!(secret.stale_slot, None);
    assert_ne!(secret.a.password, "p1");
    h.assert_both_slots_connect().await;
}

#[tokio::test]
async fn test_bootstrap_then_normal_rotation() {
    let legacy = DbCredential::new("openemr", "legacy", HOST, 3306, "openemr");
    let h = Harness::new(&legacy).await;

    let report = h.engine().run().await;
    assert_eq!(report.status, RunStatus::Bootstrapped, "{report}");
    assert_eq!(report.active_slot, Some(Slot::A));

    let secret = h.secret().await;
    assert_eq!(secret.active_slot, Slot::A);
    assert_eq!(secret.a.username, "openemr_a");
    assert_eq!(secret.b.username, "openemr_b");
    assert_ne!(secret.a.password, "p1");
    assert_ne!(secret.b.password, "p2");
    assert_eq!(secret.a.host, HOST);

    assert!(sqlconf::parse(&h.file()).matches(&secret.a));
    assert_eq!(h.runtime.runtime_secret().await, Some(secret.a.clone()));
    h.assert_both_slots_connect().await;

    let creates = h
        .db
        .statements()
        .await
        .into_iter()
        .filter(|s| s.starts_with("CREATE USER"))
        .count();
    assert_eq!(creates, 2);

    let second = h.engine().run().await;
    assert_eq!(second.status, RunStatus::Rotated, "{second}");
    assert_eq!(second.active_slot, Some(Slot::B));
}

#[tokio::test]
async fn test_old_slot_failure_does_not_undo_flip() {
    let h = Harness::steady().await;
    h.db.fail_changes_for("openemr_a").await;

    let report = h.engine().run().await;
    assert_eq!(report.status, RunStatus::CleanupFailed, "{report}");
    assert_eq!(report.severity, Severity::Warning);
    assert_eq!(report.active_slot, Some(Slot::B));
    assert!(report.error.unwrap().contains("stale slot A"));

    let secret = h.secret().await;
    assert_eq!(secret.active_slot, Slot::B);
    assert_eq!(secret.stale_slot, Some(Slot::A));
    assert_eq!(secret.a.password, "p1");
    assert!(sqlconf::parse(&h.file()).matches(&slot_b()));
    assert_eq!(h.runtime.runtime_secret().await, Some(slot_b()));

    // Admin rotation is independent of the failed slot rotation.
    let admin_writes = h.secrets.admin_writes().await;
    assert_eq!(admin_writes.len(), 2);
    assert!(admin_writes[0].pending_password.is_some());
    assert_eq!(admin_writes[1].pending_password, None);

    h.db.clear_failures().await;
    let file_before = h.file();

    let resumed = h.engine().run().await;
    assert_eq!(resumed.status, RunStatus::CleanupCompleted, "{resumed}");
    assert_eq!(resumed.active_slot, Some(Slot::B));
    assert_eq!(h.runtime.restarts(), 1);
    assert_eq!(h.file(), file_before);

    let secret = h.secret().await;
    assert_eq!(secret.stale_slot, None);
    assert_ne!(secret.a.password, "p1");
    h.assert_both_slots_connect().await;
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let h = Harness::steady().await;
    let before = h.file();

    let report = h.engine_with(h.config().with_dry_run(true)).run().await;
    assert_eq!(report.status, RunStatus::Rotated, "{report}");
    assert!(report.dry_run);

    assert_eq!(h.file(), before);
    assert!(h.runtime.patches().await.is_empty());
    assert_eq!(h.runtime.restarts(), 0);
    assert!(h.secrets.slot_writes().await.is_empty());
    assert!(h.secrets.admin_writes().await.is_empty());
    assert!(h.db.statements().await.is_empty());
    assert_eq!(h.db.password_of("admin").await.as_deref(), Some("root-pw"));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let h = Harness::steady().await;
    h.secrets.fail_next_reads(2);
    h.runtime.fail_next_patches(2);

    let report = h.engine().run().await;
    assert_eq!(report.status, RunStatus::Rotated, "{report}");
    assert_eq!(h.runtime.patches().await, vec![slot_b()]);
}

#[tokio::test]
async fn test_admin_recovered_from_slot_password() {
    let h = Harness::steady().await;
    h.db.add_user("admin", "p2").await;

    let report = h.engine().run().await;
    assert_eq!(report.status, RunStatus::Rotated, "{report}");

    let writes = h.secrets.admin_writes().await;
    assert_eq!(writes[0].password, "p2");
    let stored = h.secrets.admin_secret().await.unwrap();
    assert_eq!(h.db.password_of("admin").await, Some(stored.password));
}

#[tokio::test]
async fn test_invalid_admin_aborts_before_any_change() {
    let h = Harness::steady().await;
    h.db.add_user("admin", "reset-out-of-band").await;
    let before = h.file();

    let report = h.engine().run().await;
    assert_eq!(report.status, RunStatus::Error);
    assert!(report.error.unwrap().contains("reset the database master password"));

    assert_eq!(h.file(), before);
    assert!(h.runtime.patches().await.is_empty());
    assert!(h.secrets.slot_writes().await.is_empty());
}

#[tokio::test]
async fn test_malformed_slot_secret_aborts() {
    let h = Harness::steady().await;
    h.secrets
        .set_raw_slot_secret(r#"{"active_slot": "C", "A": {}, "B": {}}"#)
        .await;

    let report = h.engine().run().await;
    assert_eq!(report.status, RunStatus::Error);
    assert_eq!(report.exit_code(), 1);
    assert!(h.runtime.patches().await.is_empty());
}

#[tokio::test]
async fn test_sync_users_only_touches_database() {
    let h = Harness::steady().await;
    h.db.add_user("openemr_b", "drifted").await;
    let before = h.file();

    let report = h.engine().sync_users().await;
    assert_eq!(report.status, RunStatus::Synced, "{report}");

    assert_eq!(h.db.password_of("openemr_b").await.as_deref(), Some("p2"));
    assert_eq!(h.file(), before);
    assert_eq!(h.runtime.restarts(), 0);
    assert!(h.secrets.slot_writes().await.is_empty());
}

#[tokio::test]
async fn test_interrupted_user_create_is_repaired_next_run() {
    let legacy = DbCredential::new("openemr", "legacy", HOST, 3306, "openemr");
    let h = Harness::new(&legacy).await;
    h.db.interrupt_after_create("openemr_b").await;
    let before = h.file();

    let first = h.engine().run().await;
    assert_eq!(first.status, RunStatus::Error, "{first}");
    assert!(first.error.unwrap().contains("GRANT failed"));
    assert!(!h.db.has_grant("openemr_b", "openemr").await);
    assert!(h.secrets.slot_writes().await.is_empty());
    assert_eq!(h.file(), before);

    let second = h.engine().run().await;
    assert_eq!(second.status, RunStatus::Bootstrapped, "{second}");
    assert!(h.db.has_grant("openemr_b", "openemr").await);
    h.assert_both_slots_connect().await;
}

#[tokio::test]
async fn test_admin_secret_outage_keeps_cleanup_pending() {
    let h = Harness::steady().await;
    h.secrets.fail_admin_writes_after(0).await;

    let report = h.engine().run().await;
    assert_eq!(report.status, RunStatus::CleanupFailed, "{report}");
    assert!(report.error.unwrap().contains("admin password rotation failed"));

    // Nothing was announced, so the password was never changed.
    assert_eq!(h.db.password_of("admin").await.as_deref(), Some("root-pw"));

    // The slot rotation went through, but the marker stays for the admin.
    let secret = h.secret().await;
    assert_eq!(secret.active_slot, Slot::B);
    assert_eq!(secret.stale_slot, Some(Slot::A));
    assert_ne!(secret.a.password, "p1");

    h.secrets.restore_admin_writes().await;
    let resumed = h.engine().run().await;
    assert_eq!(resumed.status, RunStatus::CleanupCompleted, "{resumed}");
    assert_eq!(h.runtime.restarts(), 1);

    let stored = h.secrets.admin_secret().await.unwrap();
    assert_ne!(stored.password, "root-pw");
    assert_eq!(h.db.password_of("admin").await, Some(stored.password));
    assert_eq!(h.secret().await.stale_slot, None);
}

#[tokio::test]
async fn test_lost_admin_promotion_recovered_from_pending_password() {
    let h = Harness::steady().await;
    h.secrets.fail_admin_writes_after(1).await;

    let report = h.engine().run().await;
    assert_eq!(report.status, RunStatus::CleanupFailed, "{report}");

    // The database moved on; the secret still names the old password but
    // carries the new one as pending.
    let stored = h.secrets.admin_secret().await.unwrap();
    assert_eq!(stored.password, "root-pw");
    let pending = stored.pending_password.clone().unwrap();
    assert_eq!(h.db.password_of("admin").await, Some(pending));

    h.secrets.restore_admin_writes().await;
    let resumed = h.engine().run().await;
    assert_eq!(resumed.status, RunStatus::CleanupCompleted, "{resumed}");
    assert_eq!(h.runtime.restarts(), 1);

    let stored = h.secrets.admin_secret().await.unwrap();
    assert_eq!(stored.pending_password, None);
    assert_eq!(h.db.password_of("admin").await, Some(stored.password));
    h.assert_both_slots_connect().await;
}

#[tokio::test]
async fn test_unrenderable_config_aborts_bootstrap_untouched() {
    let legacy = DbCredential::new("openemr", "legacy", HOST, 3306, "openemr");
    let h = Harness::new(&legacy).await;
    let without_port: String = sqlconf_for(&legacy)
        .lines()
        .filter(|line| !line.starts_with("$port"))
        .map(|line| format!("{line}\n"))
        .collect();
    std::fs::write(&h.path, &without_port).unwrap();

    for _ in 0..2 {
        let report = h.engine().run().await;
        assert_eq!(report.status, RunStatus::Error, "{report}");
        assert!(report.error.unwrap().contains("$port"));
    }

    assert_eq!(h.file(), without_port);
    assert!(h.secrets.slot_writes().await.is_empty());
    assert!(h.db.statements().await.is_empty());
    assert_eq!(h.db.password_of("openemr_a").await, None);
    assert!(h.runtime.patches().await.is_empty());
    assert_eq!(h.runtime.restarts(), 0);
}

#[tokio::test]
async fn test_unrenderable_config_aborts_rotation_untouched() {
    let h = Harness::steady().await;
    let without_port: String = sqlconf_for(&slot_a())
        .lines()
        .filter(|line| !line.starts_with("$port"))
        .map(|line| format!("{line}\n"))
        .collect();
    std::fs::write(&h.path, &without_port).unwrap();

    let report = h.engine().run().await;
    assert_eq!(report.status, RunStatus::Error, "{report}");
    assert!(report.error.unwrap().contains("render-config"));

    assert_eq!(h.file(), without_port);
    assert!(h.secrets.slot_writes().await.is_empty());
    assert!(h.secrets.admin_writes().await.is_empty());
    assert!(h.runtime.patches().await.is_empty());
    assert_eq!(h.runtime.restarts(), 0);
}
