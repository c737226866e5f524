//! The rotation state machine.
//!
//! A run reads the Slot Secret, the Admin Secret and the shared config file,
//! decides a [`Plan`], and executes it. Every branch is resumable from those
//! three durable inputs: a run interrupted at any point is completed or
//! corrected by the next one.

use std::path::Path;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use super::plan::{plan, Plan};
use super::report::{RunReport, RunStatus, Severity};
use crate::database::{CredentialSynchronizer, DatabaseAdmin};
use crate::retry::retry;
use crate::runtime::{DryRunCoordinator, RuntimeCoordinator};
use crate::secrets::SecretStore;
use crate::shared_config::{discover_config_path, ConfigSnapshot, ConfigWriter};
use crate::slot::{generate_password, AdminCredential, DbCredential, Slot, SlotSecret, PASSWORD_LENGTH};
use crate::sqlconf::ParsedConfig;
use crate::validator::Validator;
use crate::{Config, Result, RotationError};

/// Per-run state, derived from the secrets at run start.
#[derive(Debug, Clone)]
pub struct RotationRun {
    /// Correlation id for log lines and the report
    pub run_id: Uuid,
    /// Slot the application uses
    pub active_slot: Slot,
    /// Slot the next switch targets
    pub standby_slot: Slot,
    /// Admin record as last read or recovered
    pub admin_credential: AdminCredential,
    /// Whether mutations are skipped
    pub dry_run: bool,
}

impl RotationRun {
    fn new(run_id: Uuid, secret: &SlotSecret, admin: AdminCredential, dry_run: bool) -> Self {
        Self {
            run_id,
            active_slot: secret.active_slot,
            standby_slot: secret.active_slot.standby(),
            admin_credential: admin,
            dry_run,
        }
    }
}

/// How a branch ended, before it becomes a [`RunReport`].
#[derive(Debug)]
struct Outcome {
    status: RunStatus,
    active: Option<Slot>,
    previous: Option<Slot>,
    error: Option<String>,
}

impl Outcome {
    fn new(status: RunStatus, active: Slot, previous: Option<Slot>) -> Self {
        Self {
            status,
            active: Some(active),
            previous,
            error: None,
        }
    }

    /// `status` unless a trailing rotation failed.
    fn after_cleanup(
        status: RunStatus,
        active: Slot,
        previous: Option<Slot>,
        errors: Vec<RotationError>,
    ) -> Self {
        let mut outcome = Self::new(status, active, previous);
        if !errors.is_empty() {
            outcome.status = RunStatus::CleanupFailed;
            outcome.error = Some(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            );
        }
        outcome
    }
}

fn in_phase<T>(phase: &str, result: Result<T>) -> Result<T> {
    result.map_err(|e| RotationError::in_phase(phase, e))
}

fn status_for(err: &RotationError) -> RunStatus {
    if matches!(err, RotationError::RollbackFailed { .. }) {
        RunStatus::RollbackFailed
    } else if err.is_trailing() {
        RunStatus::CleanupFailed
    } else {
        RunStatus::Error
    }
}

/// Host, port and database for bootstrap: taken from the config file where
/// present, otherwise from the secret's active slot.
fn bootstrap_base(secret: &SlotSecret, observed: &ParsedConfig) -> DbCredential {
    let fallback = secret.active();
    DbCredential::new(
        fallback.username.clone(),
        fallback.password.clone(),
        observed.host.clone().unwrap_or_else(|| fallback.host.clone()),
        observed.port_number().unwrap_or(fallback.port),
        observed
            .dbase
            .clone()
            .unwrap_or_else(|| fallback.database_name.clone()),
    )
}

/// Drives rotation runs over the injected collaborators.
///
/// # Example
///
/// ```
/// use slotmux::database::mock::MockDatabase;
/// use slotmux::rotation::{RotationEngine, RunStatus};
/// use slotmux::runtime::mock::MockCoordinator;
/// use slotmux::secrets::mock::MockSecretStore;
/// use slotmux::validator::ConnectivityValidator;
/// use slotmux::{AdminCredential, Config, DbCredential, Slot, SlotSecret};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> slotmux::Result<()> {
///     let dir = tempfile::tempdir()?;
///     std::fs::create_dir(dir.path().join("default"))?;
///     std::fs::write(
///         dir.path().join("default/sqlconf.php"),
///         "<?php\n$host = 'db';\n$port = '3306';\n$login = 'openemr_a';\n$pass = 'p1';\n$dbase = 'openemr';\n",
///     )?;
///
///     let secrets = Arc::new(MockSecretStore::new());
///     secrets
///         .set_slot_secret(&SlotSecret::new(
///             Slot::A,
///             DbCredential::new("openemr_a", "p1", "db", 3306, "openemr"),
///             DbCredential::new("openemr_b", "p2", "db", 3306, "openemr"),
///         ))
///         .await;
///     secrets.set_admin_secret(&AdminCredential::new("admin", "root-pw", "db", 3306)).await;
///
///     let db = Arc::new(MockDatabase::new());
///     db.add_user("admin", "root-pw").await;
///
///     let config = Config::new("mock/slots", "mock/admin")
///         .with_sites_mount_root(dir.path())
///         .with_kubernetes("openemr", "openemr", "openemr-db-credentials")
///         .with_file_owner(None);
///     let validator = Arc::new(ConnectivityValidator::new(db.clone(), false)?);
///     let engine = RotationEngine::new(config, secrets, db, Arc::new(MockCoordinator::new()), validator);
///
///     let report = engine.run().await;
///     assert_eq!(report.status, RunStatus::Rotated);
///     assert_eq!(report.active_slot, Some(Slot::B));
///     Ok(())
/// }
/// ```
pub struct RotationEngine {
    config: Config,
    secrets: Arc<dyn SecretStore>,
    sync: CredentialSynchronizer,
    writer: ConfigWriter,
    runtime: Arc<dyn RuntimeCoordinator>,
    validator: Arc<dyn Validator>,
}

impl RotationEngine {
    /// Creates an engine.
    ///
    /// In dry-run mode the coordinator is replaced by a
    /// [`DryRunCoordinator`], and the synchronizer and file writer skip
    /// every mutation.
    pub fn new(
        config: Config,
        secrets: Arc<dyn SecretStore>,
        db: Arc<dyn DatabaseAdmin>,
        runtime: Arc<dyn RuntimeCoordinator>,
        validator: Arc<dyn Validator>,
    ) -> Self {
        let runtime: Arc<dyn RuntimeCoordinator> = if config.dry_run {
            Arc::new(DryRunCoordinator::new(
                config.deployment.clone(),
                config.runtime_secret.clone(),
            ))
        } else {
            runtime
        };

        Self {
            sync: CredentialSynchronizer::new(db).with_dry_run(config.dry_run),
            writer: ConfigWriter::from_config(&config),
            config,
            secrets,
            runtime,
            validator,
        }
    }

    /// The engine's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Executes one rotation run and reports how it ended.
    ///
    /// Never panics and never returns an error: failures are folded into the
    /// report's status.
    pub async fn run(&self) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("rotation", %run_id, dry_run = self.config.dry_run);

        async move {
            tracing::info!(
                secrets = self.secrets.name(),
                database = self.sync.database().name(),
                runtime = self.runtime.name(),
                "rotation run started"
            );
            let result = self.execute(run_id).await;
            self.report(run_id, result)
        }
        .instrument(span)
        .await
    }

    /// Makes both slot users match the passwords in the Slot Secret,
    /// without touching the application.
    pub async fn sync_users(&self) -> RunReport {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("sync_users", %run_id, dry_run = self.config.dry_run);

        async move {
            let result: Result<Outcome> = async {
                let (secret, admin) = self.read_state().await?;
                let mut run = RotationRun::new(run_id, &secret, admin, self.config.dry_run);
                let admin = in_phase(
                    "validate-admin",
                    self.ensure_admin(&mut run, &secret, secret.active()).await,
                )?;
                self.sync_slots(&secret, &admin).await?;
                Ok(Outcome::new(RunStatus::Synced, secret.active_slot, None))
            }
            .await;
            self.report(run_id, result)
        }
        .instrument(span)
        .await
    }

    fn report(&self, run_id: Uuid, result: Result<Outcome>) -> RunReport {
        let report = match result {
            Ok(outcome) => {
                let report = RunReport::new(run_id, outcome.status, self.config.dry_run)
                    .with_slots(outcome.active, outcome.previous);
                match outcome.error {
                    Some(error) => report.with_error(error),
                    None => report,
                }
            }
            Err(err) => RunReport::new(run_id, status_for(&err), self.config.dry_run).with_error(err),
        };

        let error = report.error.as_deref().unwrap_or("");
        match report.severity {
            Severity::Info => tracing::info!(status = %report.status, "run finished"),
            Severity::Warning => tracing::warn!(status = %report.status, error, "run finished"),
            Severity::Critical => tracing::error!(status = %report.status, error, "run finished"),
        }
        report
    }

    async fn execute(&self, run_id: Uuid) -> Result<Outcome> {
        let path = in_phase(
            "locate-config",
            discover_config_path(&self.config.sites_mount_root),
        )?;
        let (secret, admin) = self.read_state().await?;
        let snapshot = in_phase("read-config", self.writer.read_current(&path))?;

        let plan = plan(&secret, &snapshot.parsed);
        let mut run = RotationRun::new(run_id, &secret, admin, self.config.dry_run);
        tracing::info!(
            plan = plan.name(),
            active_slot = %run.active_slot,
            path = %path.display(),
            "run planned"
        );

        match plan {
            Plan::Bootstrap => self.bootstrap(&mut run, secret, &path, &snapshot).await,
            Plan::Drift { from, to } => self.reconcile_drift(&mut run, secret, from, to).await,
            Plan::Cleanup { stale } => self.resume_cleanup(&mut run, secret, stale).await,
            Plan::Rotate { .. } => self.rotate(&mut run, secret, &path, &snapshot).await,
        }
    }

    async fn read_state(&self) -> Result<(SlotSecret, AdminCredential)> {
        let policy = &self.config.retry;
        let secret = in_phase(
            "read-state",
            retry(policy, "read-slot-secret", || self.secrets.read_slot_secret()).await,
        )?;
        let admin = in_phase(
            "read-state",
            retry(policy, "read-admin-secret", || self.secrets.read_admin_secret()).await,
        )?;
        Ok((secret, admin))
    }

    /// Normal rotation: switch to the standby slot, flip, clean up.
    async fn rotate(
        &self,
        run: &mut RotationRun,
        secret: SlotSecret,
        path: &Path,
        snapshot: &ConfigSnapshot,
    ) -> Result<Outcome> {
        let (from, to) = (run.active_slot, run.standby_slot);
        let target = secret.slot(to).clone();
        let content = in_phase("render-config", self.writer.render(path, snapshot, &target))?;

        let admin = in_phase(
            "validate-admin",
            self.ensure_admin(run, &secret, secret.active()).await,
        )?;
        self.sync_slots(&secret, &admin).await?;

        tracing::info!(
            phase = "switch",
            from = %from,
            to = %to,
            username = %target.username,
            "switching application to standby slot"
        );
        if let Err(cause) = self.switch_to(path, &content, &target).await {
            tracing::error!(phase = "switch", error = %cause, "switch failed");
            return self
                .roll_back(path, snapshot, Some(secret.active()), Some(from), cause)
                .await;
        }

        let mut flipped = secret;
        flipped.active_slot = to;
        flipped.stale_slot = Some(from);
        in_phase("flip", self.persist_slot_secret(&flipped).await)?;
        run.active_slot = to;
        run.standby_slot = from;
        tracing::info!(phase = "flip", active_slot = %to, stale_slot = %from, "active slot flipped");

        let errors = self.finish_cleanup(run, &mut flipped, &admin).await;
        Ok(Outcome::after_cleanup(RunStatus::Rotated, to, Some(from), errors))
    }

    /// The config file already holds the standby slot: trust it.
    async fn reconcile_drift(
        &self,
        run: &mut RotationRun,
        secret: SlotSecret,
        from: Slot,
        to: Slot,
    ) -> Result<Outcome> {
        tracing::warn!(
            phase = "reconcile-drift",
            recorded = %from,
            observed = %to,
            "config file holds the standby slot, correcting active slot"
        );

        let mut corrected = secret;
        corrected.active_slot = to;
        corrected.stale_slot = None;
        in_phase("reconcile-drift", self.persist_slot_secret(&corrected).await)?;
        run.active_slot = to;
        run.standby_slot = from;

        let admin = in_phase(
            "validate-admin",
            self.ensure_admin(run, &corrected, corrected.active()).await,
        )?;
        self.sync_slots(&corrected, &admin).await?;
        self.project(corrected.active()).await?;

        corrected.stale_slot = Some(from);
        in_phase("mark-stale", self.persist_slot_secret(&corrected).await)?;

        let errors = self.finish_cleanup(run, &mut corrected, &admin).await;
        Ok(Outcome::after_cleanup(RunStatus::Reconciled, to, Some(from), errors))
    }

    /// A previous run flipped but did not finish its trailing rotations.
    async fn resume_cleanup(
        &self,
        run: &mut RotationRun,
        secret: SlotSecret,
        stale: Slot,
    ) -> Result<Outcome> {
        tracing::info!(phase = "cleanup", stale_slot = %stale, "resuming trailing rotations");

        let admin = in_phase(
            "validate-admin",
            self.ensure_admin(run, &secret, secret.active()).await,
        )?;
        let mut secret = secret;
        let errors = self.finish_cleanup(run, &mut secret, &admin).await;
        Ok(Outcome::after_cleanup(
            RunStatus::CleanupCompleted,
            run.active_slot,
            None,
            errors,
        ))
    }

    /// First run: give both users fresh passwords and point everything at A.
    async fn bootstrap(
        &self,
        run: &mut RotationRun,
        secret: SlotSecret,
        path: &Path,
        snapshot: &ConfigSnapshot,
    ) -> Result<Outcome> {
        tracing::warn!(phase = "bootstrap", "config file matches neither slot, bootstrapping");

        let base = bootstrap_base(&secret, &snapshot.parsed);
        let mut fresh = secret.clone();
        for slot in Slot::ALL {
            let username = fresh.slot(slot).username.clone();
            *fresh.slot_mut(slot) = base.as_user(username, generate_password(PASSWORD_LENGTH));
        }
        fresh.active_slot = Slot::A;
        fresh.stale_slot = None;
        let content = in_phase("render-config", self.writer.render(path, snapshot, &fresh.a))?;

        let admin = in_phase("validate-admin", self.ensure_admin(run, &secret, &base).await)?;
        self.sync_slots(&fresh, &admin).await?;
        in_phase("bootstrap", self.persist_slot_secret(&fresh).await)?;
        run.active_slot = Slot::A;
        run.standby_slot = Slot::B;

        if run.dry_run {
            tracing::info!(phase = "bootstrap", "dry run: skipping switch to slot A");
            return Ok(Outcome::new(RunStatus::Bootstrapped, Slot::A, None));
        }

        if let Err(cause) = self.switch_to(path, &content, &fresh.a).await {
            tracing::error!(phase = "bootstrap", error = %cause, "bootstrap switch failed");
            let previous = snapshot.parsed.credential();
            return self
                .roll_back(path, snapshot, previous.as_ref(), None, cause)
                .await;
        }

        tracing::info!(phase = "bootstrap", active_slot = %Slot::A, "bootstrap complete");
        Ok(Outcome::new(RunStatus::Bootstrapped, Slot::A, None))
    }

    /// Returns working admin connection parameters. If the stored password is
    /// rejected, the pending password of an interrupted admin rotation and
    /// then each slot password are tried.
    async fn ensure_admin(
        &self,
        run: &mut RotationRun,
        secret: &SlotSecret,
        base: &DbCredential,
    ) -> Result<DbCredential> {
        let db = self.sync.database();
        let stored = run.admin_credential.connection(base);
        if db.probe(&stored).await.is_ok() {
            tracing::debug!(username = %stored.username, "admin credential valid");
            return Ok(stored);
        }

        tracing::warn!(
            username = %stored.username,
            "stored admin credential rejected, trying fallback passwords"
        );
        let fallbacks = run
            .admin_credential
            .pending_password
            .iter()
            .map(|password| ("pending".to_string(), password.clone()))
            .chain(
                Slot::ALL
                    .into_iter()
                    .map(|slot| (format!("slot {slot}"), secret.slot(slot).password.clone())),
            )
            .collect::<Vec<_>>();

        for (source, password) in fallbacks {
            let candidate = run.admin_credential.with_password(password);
            let connection = candidate.connection(base);
            if db.probe(&connection).await.is_err() {
                continue;
            }

            tracing::warn!(username = %connection.username, %source, "admin credential recovered");
            self.persist_admin(&candidate).await?;
            run.admin_credential = candidate;
            return Ok(connection);
        }

        tracing::error!(username = %stored.username, "no admin password works");
        Err(RotationError::AdminCredentialInvalid {
            username: stored.username,
        })
    }

    async fn sync_slots(&self, secret: &SlotSecret, admin: &DbCredential) -> Result<()> {
        for slot in Slot::ALL {
            let credential = secret.slot(slot);
            let result = in_phase("sync-users", self.sync.sync_user(credential, admin).await)?;
            tracing::info!(
                phase = "sync-users",
                slot = %slot,
                username = %credential.username,
                changed = result.changed,
                "database user synchronized"
            );
        }
        Ok(())
    }

    /// Writes the pre-rendered config file, then projects and validates
    /// `target`.
    async fn switch_to(&self, path: &Path, content: &str, target: &DbCredential) -> Result<()> {
        in_phase("write-config", self.writer.write(path, content))?;
        tracing::info!(phase = "write-config", username = %target.username, "config file updated");
        self.project(target).await
    }

    /// Patches the runtime secret, restarts and validates.
    async fn project(&self, target: &DbCredential) -> Result<()> {
        in_phase("patch-runtime-secret", self.patch_runtime(target).await)?;
        in_phase("rolling-restart", self.restart().await)?;
        in_phase("validate", self.validate(target).await)?;
        tracing::info!(phase = "validate", username = %target.username, "credential validated");
        Ok(())
    }

    async fn roll_back(
        &self,
        path: &Path,
        snapshot: &ConfigSnapshot,
        previous: Option<&DbCredential>,
        active: Option<Slot>,
        cause: RotationError,
    ) -> Result<Outcome> {
        tracing::warn!(phase = "rollback", reason = %cause, "rolling back");

        match self.restore(path, snapshot, previous).await {
            Ok(()) => {
                tracing::warn!(phase = "rollback", "rollback complete, no change applied");
                Ok(Outcome {
                    status: RunStatus::RolledBack,
                    active,
                    previous: None,
                    error: Some(cause.to_string()),
                })
            }
            Err(err) => {
                tracing::error!(phase = "rollback", error = %err, "rollback failed, manual intervention required");
                Err(RotationError::RollbackFailed {
                    reason: cause.to_string(),
                    source: Box::new(err),
                })
            }
        }
    }

    /// Restores the file bytes and, when known, the previous projection.
    async fn restore(
        &self,
        path: &Path,
        snapshot: &ConfigSnapshot,
        previous: Option<&DbCredential>,
    ) -> Result<()> {
        self.writer.write(path, &snapshot.raw)?;
        if let Some(previous) = previous {
            self.patch_runtime(previous).await?;
        }
        self.restart().await?;
        if let Some(previous) = previous {
            self.validate(previous).await?;
        }
        Ok(())
    }

    /// Trailing rotations after a flip. Independent: both are attempted.
    ///
    /// The stale marker is cleared only once both have succeeded, so a failed
    /// admin rotation is retried by the next run without another switch.
    async fn finish_cleanup(
        &self,
        run: &mut RotationRun,
        secret: &mut SlotSecret,
        admin: &DbCredential,
    ) -> Vec<RotationError> {
        let mut errors = Vec::new();
        if run.dry_run {
            tracing::info!(phase = "cleanup", "dry run: skipping trailing rotations");
            return errors;
        }

        if let Some(stale) = secret.stale_slot {
            if let Err(err) = self.rotate_stale_slot(secret, stale, admin).await {
                tracing::error!(phase = "cleanup", slot = %stale, error = %err, "stale slot rotation failed");
                errors.push(RotationError::OldSlotRotationFailed {
                    slot: stale,
                    source: Box::new(err),
                });
            }
        }

        if let Err(err) = self.rotate_admin(run, secret).await {
            tracing::error!(phase = "cleanup", error = %err, "admin rotation failed");
            errors.push(RotationError::AdminRotationFailed {
                source: Box::new(err),
            });
        }

        if errors.is_empty() && secret.stale_slot.is_some() {
            let mut done = secret.clone();
            done.stale_slot = None;
            match self.persist_slot_secret(&done).await {
                Ok(()) => *secret = done,
                Err(err) => errors.push(RotationError::in_phase("clear-stale", err)),
            }
        }

        errors
    }

    async fn rotate_stale_slot(&self, secret: &mut SlotSecret, stale: Slot, admin: &DbCredential) -> Result<()> {
        let rotated = secret
            .slot(stale)
            .with_password(generate_password(PASSWORD_LENGTH));
        self.sync.sync_user(&rotated, admin).await?;

        let mut next = secret.clone();
        *next.slot_mut(stale) = rotated;
        self.persist_slot_secret(&next).await?;
        *secret = next;

        tracing::info!(
            phase = "cleanup",
            slot = %stale,
            username = %secret.slot(stale).username,
            "stale slot password rotated"
        );
        Ok(())
    }

    /// Announces the new password in the admin secret, changes it, then
    /// promotes it. If the promotion is lost, the next run finds the working
    /// password under `pending_password`.
    async fn rotate_admin(&self, run: &mut RotationRun, secret: &SlotSecret) -> Result<()> {
        let password = generate_password(PASSWORD_LENGTH);
        let announced = run.admin_credential.with_pending_password(password.clone());
        self.persist_admin(&announced).await?;
        run.admin_credential = announced;

        let rotated = self
            .sync
            .rotate_admin(&run.admin_credential, &password, secret.active())
            .await?;
        run.admin_credential = rotated.clone();
        self.persist_admin(&rotated).await
    }

    async fn persist_slot_secret(&self, secret: &SlotSecret) -> Result<()> {
        if self.config.dry_run {
            tracing::info!(active_slot = %secret.active_slot, "dry run: skipping slot secret write");
            return Ok(());
        }
        retry(&self.config.retry, "write-slot-secret", || {
            self.secrets.write_slot_secret(secret)
        })
        .await
    }

    async fn persist_admin(&self, admin: &AdminCredential) -> Result<()> {
        if self.config.dry_run {
            tracing::info!(username = %admin.username, "dry run: skipping admin secret write");
            return Ok(());
        }
        retry(&self.config.retry, "write-admin-secret", || {
            self.secrets.write_admin_secret(admin)
        })
        .await
    }

    async fn patch_runtime(&self, credential: &DbCredential) -> Result<()> {
        retry(&self.config.retry, "patch-runtime-secret", || {
            self.runtime.patch_runtime_secret(credential)
        })
        .await
    }

    async fn restart(&self) -> Result<()> {
        let rollout = self
            .runtime
            .restart_and_wait(self.config.rollout_timeout)
            .await?;
        if rollout.succeeded {
            return Ok(());
        }

        Err(RotationError::RolloutTimeout {
            deployment: self.config.deployment.clone(),
            timeout: self.config.rollout_timeout,
        })
    }

    async fn validate(&self, credential: &DbCredential) -> Result<()> {
        self.validator
            .validate(credential, self.config.health_url.as_deref())
            .await
            .into_result(&credential.username)
    }
}
