//! Timestamped copies of finished session data and the registries.
//!
//! Backups are best-effort: the primary files under the data directory are
//! already complete by the time a backup runs, so a failed copy is reported
//! and recording carries on.

use chrono::Local;
use log::{error, info};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Timestamp tag appended to every backup file name.
const BACKUP_TAG_FMT: &str = "%Y%m%d_%H%M%S";

/// Why a backup copy did not happen.
#[derive(Debug)]
pub enum BackupError {
    /// The file to back up does not exist.
    MissingSource(PathBuf),
    /// The copy itself failed.
    Io(std::io::Error),
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BackupError::MissingSource(path) => {
                write!(f, "nothing to back up at {}", path.display())
            }
            BackupError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for BackupError {}

impl From<std::io::Error> for BackupError {
    fn from(value: std::io::Error) -> Self {
        BackupError::Io(value)
    }
}

/// Copies files into the backup directory under timestamped names.
#[derive(Debug, Clone)]
pub struct BackupManager {
    backup_dir: PathBuf,
}

impl BackupManager {
    /// A manager targeting `backup_dir`. The directory is created lazily on
    /// the first copy.
    pub fn new(backup_dir: impl AsRef<Path>) -> Self {
        BackupManager {
            backup_dir: backup_dir.as_ref().to_path_buf(),
        }
    }

    /// Where backups land.
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Copy one file into the backup directory as
    /// `<stem>_<YYYYmmdd_HHMMSS>.<ext>` and return the destination path.
    pub fn backup_file(&self, source: &Path) -> Result<PathBuf, BackupError> {
        if !source.exists() {
            return Err(BackupError::MissingSource(source.to_path_buf()));
        }
        fs::create_dir_all(&self.backup_dir)?;

        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("backup");
        let extension = source
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("csv");
        let tag = Local::now().format(BACKUP_TAG_FMT);
        let dest = self
            .backup_dir
            .join(format!("{}_{}.{}", stem, tag, extension));

        fs::copy(source, &dest)?;
        info!("backed up {} to {}", source.display(), dest.display());
        Ok(dest)
    }

    /// Copy the registry files. Failures are logged and handed back for
    /// reporting; registry backups must never interfere with a running
    /// session.
    pub fn backup_registries(&self, registries: &[PathBuf]) -> Vec<BackupError> {
        let mut failures = Vec::new();
        for path in registries {
            if let Err(e) = self.backup_file(path) {
                error!("registry backup of {} failed: {}", path.display(), e);
                failures.push(e);
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_under_a_timestamped_name() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("session_7.csv");
        fs::write(&source, "header\n1,2,3,4\n").unwrap();

        let manager = BackupManager::new(dir.path().join("backups"));
        let dest = manager.backup_file(&source).unwrap();

        assert!(dest.exists());
        let name = dest.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("session_7_"));
        assert!(name.ends_with(".csv"));
        assert_eq!(
            fs::read_to_string(&dest).unwrap(),
            fs::read_to_string(&source).unwrap()
        );
    }

    #[test]
    fn refuses_a_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(dir.path().join("backups"));
        let missing = dir.path().join("no_such.csv");
        assert!(matches!(
            manager.backup_file(&missing),
            Err(BackupError::MissingSource(_))
        ));
    }

    #[test]
    fn registry_backup_reports_failures_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("participants.csv");
        fs::write(&present, "participant_id,registered_at\n").unwrap();
        let manager = BackupManager::new(dir.path().join("backups"));

        // One exists, one does not; the good copy still lands and the bad
        // one comes back as a failure instead of aborting the batch.
        let failures =
            manager.backup_registries(&[present.clone(), dir.path().join("gone.csv")]);
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], BackupError::MissingSource(_)));

        let copies: Vec<_> = fs::read_dir(manager.backup_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(copies.len(), 1);
        assert!(copies[0].to_str().unwrap().starts_with("participants_"));
    }
}
