//! Atomic writes of the shared database connection file.
//!
//! The file lives on a volume mounted by every application replica, so a
//! reader must never observe a partial write. Content goes to a temporary
//! file in the same directory, is flushed to disk, and is renamed over the
//! target. Mode and ownership are applied to the temporary file and again to
//! the final path on every write. The `default/` directory and the sites
//! directory above it get mode 0755 and the same owner, so replicas keep
//! read access after the volume is written from outside the pod.

use std::fs::{self, File, Permissions};
use std::io::Write;
use std::os::unix::fs::{chown, fchown, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::config::{config_file_path, Config, FileOwner};
use crate::slot::DbCredential;
use crate::sqlconf::{self, ParsedConfig};
use crate::{Result, RotationError};

/// Mode of the two directories above the config file.
pub const DIRECTORY_MODE: u32 = 0o755;

/// Contents of the config file captured before a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    /// Exact file contents, restored verbatim on rollback
    pub raw: String,
    /// Best-effort parse of the connection assignments
    pub parsed: ParsedConfig,
}

/// Writes the shared config file.
///
/// ```no_run
/// use slotmux::shared_config::ConfigWriter;
/// use slotmux::DbCredential;
/// use std::path::Path;
///
/// # fn main() -> slotmux::Result<()> {
/// let writer = ConfigWriter::new(0o644, None);
/// let path = Path::new("/mnt/openemr-sites/default/sqlconf.php");
///
/// let snapshot = writer.read_current(path)?;
/// let next = DbCredential::new("openemr_b", "p2", "db.internal", 3306, "openemr");
/// let content = writer.render(path, &snapshot, &next)?;
/// writer.write(path, &content)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConfigWriter {
    mode: u32,
    owner: Option<FileOwner>,
    dry_run: bool,
}

impl ConfigWriter {
    /// Creates a writer applying `mode` and, if set, `owner` on every write.
    pub fn new(mode: u32, owner: Option<FileOwner>) -> Self {
        Self {
            mode,
            owner,
            dry_run: false,
        }
    }

    /// Creates a writer from the run configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.file_mode, config.file_owner).with_dry_run(config.dry_run)
    }

    /// Enables or disables dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Reads the file, keeping the exact bytes for rollback.
    pub fn read_current(&self, path: &Path) -> Result<ConfigSnapshot> {
        let raw = fs::read_to_string(path).map_err(|e| file_error(path, e.to_string()))?;
        let parsed = sqlconf::parse(&raw);
        Ok(ConfigSnapshot { raw, parsed })
    }

    /// Renders `credential` into the snapshot's content without writing.
    pub fn render(
        &self,
        path: &Path,
        snapshot: &ConfigSnapshot,
        credential: &DbCredential,
    ) -> Result<String> {
        sqlconf::render(&snapshot.raw, credential).map_err(|e| match e {
            RotationError::ConfigFile { reason, .. } => file_error(path, reason),
            other => other,
        })
    }

    /// Atomically replaces the file with `content`.
    pub fn write(&self, path: &Path, content: &str) -> Result<()> {
        if self.dry_run {
            tracing::info!(path = %path.display(), "dry run: skipping config file write");
            return Ok(());
        }

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| file_error(path, "path has no file name".to_string()))?;

        fs::create_dir_all(dir)
            .map_err(|e| file_error(path, format!("creating {}: {e}", dir.display())))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .tempfile_in(dir)
            .map_err(|e| file_error(path, format!("creating temporary file: {e}")))?;

        tmp.write_all(content.as_bytes())
            .and_then(|_| tmp.flush())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| file_error(path, format!("writing temporary file: {e}")))?;

        self.apply_to_file(path, tmp.as_file())?;

        tmp.persist(path)
            .map_err(|e| file_error(path, format!("renaming into place: {}", e.error)))?;

        self.apply_to_path(path)?;
        self.apply_to_directories(path)?;

        tracing::debug!(path = %path.display(), mode = format_args!("{:o}", self.mode), "config file written");
        Ok(())
    }

    /// Re-applies mode and owner without changing the content.
    pub fn fix_permissions(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(file_error(path, "not found".to_string()));
        }

        if self.dry_run {
            tracing::info!(path = %path.display(), "dry run: skipping permission fix");
            return Ok(());
        }

        self.apply_to_path(path)?;
        self.apply_to_directories(path)
    }

    fn apply_to_file(&self, path: &Path, file: &File) -> Result<()> {
        file.set_permissions(Permissions::from_mode(self.mode))
            .map_err(|e| file_error(path, format!("setting mode: {e}")))?;

        if let Some(owner) = self.owner {
            fchown(file, Some(owner.uid), Some(owner.gid))
                .map_err(|e| file_error(path, format!("setting owner: {e}")))?;
        }
        Ok(())
    }

    fn apply_to_path(&self, path: &Path) -> Result<()> {
        fs::set_permissions(path, Permissions::from_mode(self.mode))
            .map_err(|e| file_error(path, format!("setting mode: {e}")))?;

        if let Some(owner) = self.owner {
            chown(path, Some(owner.uid), Some(owner.gid))
                .map_err(|e| file_error(path, format!("setting owner: {e}")))?;
        }
        Ok(())
    }

    /// Parent and grandparent of `path`: `default/` and the sites directory.
    fn apply_to_directories(&self, path: &Path) -> Result<()> {
        for dir in path
            .ancestors()
            .skip(1)
            .take(2)
            .filter(|d| !d.as_os_str().is_empty())
        {
            fs::set_permissions(dir, Permissions::from_mode(DIRECTORY_MODE))
                .map_err(|e| file_error(path, format!("setting mode on {}: {e}", dir.display())))?;

            if let Some(owner) = self.owner {
                chown(dir, Some(owner.uid), Some(owner.gid)).map_err(|e| {
                    file_error(path, format!("setting owner on {}: {e}", dir.display()))
                })?;
            }
        }
        Ok(())
    }
}

/// Resolves `<root>/default/sqlconf.php`, failing if the file is absent.
pub fn discover_config_path(sites_mount_root: &Path) -> Result<PathBuf> {
    let path = config_file_path(sites_mount_root);
    if !path.is_file() {
        return Err(file_error(&path, "sqlconf.php not found at discovered path".to_string()));
    }
    Ok(path)
}

fn file_error(path: &Path, reason: String) -> RotationError {
    RotationError::ConfigFile {
        path: path.to_path_buf(),
        reason,
    }
}
