// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration artifact store
//!
//! All on-disk mutation goes through the store. The rule it enforces: an
//! existing file is never overwritten until a timestamped copy of it sits
//! next to the original. Appends are additive and skip the backup, matching
//! how credential material is handled. In dry-run mode the store records
//! every intended mutation and touches nothing.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;

/// A pre-mutation backup of a configuration file
#[derive(Debug, Clone, Serialize)]
pub struct BackupRecord {
    /// File that was about to be overwritten
    pub original: PathBuf,
    /// Timestamped copy with identical content
    pub backup: PathBuf,
}

/// Kind of mutation applied to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    Wrote,
    Appended,
    CreatedDir,
}

/// One recorded filesystem mutation
#[derive(Debug, Clone, Serialize)]
pub struct MutationRecord {
    pub path: PathBuf,
    pub kind: MutationKind,
}

/// Store that owns every filesystem mutation of a run
#[derive(Debug)]
pub struct ArtifactStore {
    dry_run: bool,
    stamp: String,
    backups: Vec<BackupRecord>,
    mutations: Vec<MutationRecord>,
}

impl ArtifactStore {
    /// Create a store; one timestamp covers the whole run
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            stamp: chrono::Local::now().format("%Y%m%dT%H%M%S").to_string(),
            backups: Vec::new(),
            mutations: Vec::new(),
        }
    }

    /// Whether the store is recording without touching disk
    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Backups taken so far
    pub fn backups(&self) -> &[BackupRecord] {
        &self.backups
    }

    /// Mutations applied (or, in dry-run, intended) so far
    pub fn mutations(&self) -> &[MutationRecord] {
        &self.mutations
    }

    /// The backup path a file would be copied to
    pub fn backup_path(&self, path: &Path) -> PathBuf {
        PathBuf::from(format!("{}.{}.bak", path.display(), self.stamp))
    }

    /// Create a directory (and parents) with the given mode
    pub fn ensure_dir(&mut self, path: &Path, mode: u32) -> Result<()> {
        if path.is_dir() {
            return Ok(());
        }

        self.mutations.push(MutationRecord {
            path: path.to_path_buf(),
            kind: MutationKind::CreatedDir,
        });

        if self.dry_run {
            info!(path = %path.display(), "[dry run] would create directory");
            return Ok(());
        }

        std::fs::create_dir_all(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        debug!(path = %path.display(), mode = format!("{:o}", mode), "Created directory");
        Ok(())
    }

    /// Overwrite a file, backing up any existing content first
    pub fn write_file(&mut self, path: &Path, contents: &str, mode: u32) -> Result<()> {
        if path.exists() {
            self.backup(path)?;
        }

        self.mutations.push(MutationRecord {
            path: path.to_path_buf(),
            kind: MutationKind::Wrote,
        });

        if self.dry_run {
            info!(path = %path.display(), "[dry run] would write file");
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            if !parent.is_dir() {
                std::fs::create_dir_all(parent)?;
            }
        }

        std::fs::write(path, contents)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        debug!(path = %path.display(), bytes = contents.len(), "Wrote file");
        Ok(())
    }

    /// Append a line to a file, creating it with the given mode if absent
    ///
    /// Appends are additive so no backup is taken. Existing content is
    /// preserved byte for byte; a missing trailing newline is repaired
    /// before the new line goes in.
    pub fn append_line(&mut self, path: &Path, line: &str, mode: u32) -> Result<()> {
        self.mutations.push(MutationRecord {
            path: path.to_path_buf(),
            kind: MutationKind::Appended,
        });

        if self.dry_run {
            info!(path = %path.display(), "[dry run] would append line");
            return Ok(());
        }

        let existed = path.exists();
        let mut contents = if existed {
            std::fs::read_to_string(path)?
        } else {
            String::new()
        };

        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(line);
        contents.push('\n');

        std::fs::write(path, contents)?;
        if !existed {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        }
        debug!(path = %path.display(), "Appended line");
        Ok(())
    }

    /// Copy a file to its timestamped backup path
    fn backup(&mut self, path: &Path) -> Result<()> {
        let backup = self.backup_path(path);

        self.backups.push(BackupRecord {
            original: path.to_path_buf(),
            backup: backup.clone(),
        });

        if self.dry_run {
            info!(
                original = %path.display(),
                backup = %backup.display(),
                "[dry run] would back up file"
            );
            return Ok(());
        }

        std::fs::copy(path, &backup)?;
        info!(
            original = %path.display(),
            backup = %backup.display(),
            "Backed up file"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_new_file_takes_no_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fresh.conf");

        let mut store = ArtifactStore::new(false);
        store.write_file(&path, "a = 1\n", 0o644).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a = 1\n");
        assert!(store.backups().is_empty());
        assert_eq!(store.mutations().len(), 1);
    }

    #[test]
    fn test_overwrite_backs_up_original_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("existing.conf");
        std::fs::write(&path, "original content\n").unwrap();

        let mut store = ArtifactStore::new(false);
        store.write_file(&path, "replaced\n", 0o644).unwrap();

        assert_eq!(store.backups().len(), 1);
        let record = &store.backups()[0];
        assert_eq!(record.original, path);
        assert!(record.backup.to_string_lossy().ends_with(".bak"));
        assert_eq!(
            std::fs::read_to_string(&record.backup).unwrap(),
            "original content\n"
        );
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "replaced\n");
    }

    #[test]
    fn test_backup_name_carries_run_stamp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.conf");
        let store = ArtifactStore::new(false);

        let backup = store.backup_path(&path);
        let name = backup.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("f.conf."));
        assert!(name.ends_with(".bak"));
        // The middle section is the run timestamp
        let stamp = name
            .trim_start_matches("f.conf.")
            .trim_end_matches(".bak");
        assert_eq!(stamp.len(), "20260823T101500".len());
    }

    #[test]
    fn test_append_creates_file_with_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("authorized_keys");

        let mut store = ArtifactStore::new(false);
        store.append_line(&path, "ssh-ed25519 AAAA test", 0o600).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "ssh-ed25519 AAAA test\n"
        );
    }

    #[test]
    fn test_append_repairs_missing_trailing_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys");
        std::fs::write(&path, "first line").unwrap();

        let mut store = ArtifactStore::new(false);
        store.append_line(&path, "second line", 0o600).unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "first line\nsecond line\n"
        );
        assert!(store.backups().is_empty());
    }

    #[test]
    fn test_ensure_dir_sets_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("root/.ssh");

        let mut store = ArtifactStore::new(false);
        store.ensure_dir(&path, 0o700).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_dry_run_records_but_touches_nothing() {
        let dir = tempdir().unwrap();
        let existing = dir.path().join("live.conf");
        std::fs::write(&existing, "untouched\n").unwrap();
        let fresh = dir.path().join("new.conf");

        let mut store = ArtifactStore::new(true);
        store.write_file(&existing, "changed\n", 0o644).unwrap();
        store.write_file(&fresh, "content\n", 0o644).unwrap();
        store.ensure_dir(&dir.path().join("sub"), 0o700).unwrap();

        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "untouched\n");
        assert!(!fresh.exists());
        assert!(!dir.path().join("sub").exists());
        assert!(!store.backup_path(&existing).exists());

        assert_eq!(store.backups().len(), 1);
        assert_eq!(store.mutations().len(), 3);
    }
}
