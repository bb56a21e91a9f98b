// SPDX-License-Identifier: Apache-2.0

//! On-disk worklog generations.
//!
//! A save first copies the current primary file to `<instance>.json.bak` and
//! then replaces the primary through a temp file + rename. Whatever point a
//! crash hits, either the primary or the backup parses. An empty primary is
//! what an explicit reset leaves behind and means "start from scratch".

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::worklog::range::FileRange;

/// Persisted worklog content: file path -> last known range.
pub type WorklogRecord = BTreeMap<String, FileRange>;

pub struct WorklogStore {
    primary: PathBuf,
    backup: PathBuf,
}

impl WorklogStore {
    pub fn new(dir: impl AsRef<Path>, instance_id: &str) -> Self {
        let dir = dir.as_ref();
        Self {
            primary: dir.join(format!("{}.json", instance_id)),
            backup: dir.join(format!("{}.json.bak", instance_id)),
        }
    }

    pub fn primary_path(&self) -> &Path {
        &self.primary
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    /// Make sure the storage location can hold the worklog, creating the
    /// directory when missing.
    pub fn ensure_usable(&self) -> Result<()> {
        if let Some(dir) = self.primary.parent() {
            if dir.exists() && !dir.is_dir() {
                return Err(Error::Worklog(format!(
                    "worklog location {:?} is not a directory",
                    dir
                )));
            }
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| {
                    Error::Worklog(format!("failed to create worklog directory {:?}: {}", dir, e))
                })?;
            }
        }
        if self.primary.is_dir() {
            return Err(Error::Worklog(format!(
                "worklog path {:?} is a directory",
                self.primary
            )));
        }
        Ok(())
    }

    /// Load the newest readable generation. Missing or empty primary means a
    /// cold start; a corrupt primary falls back to the backup.
    pub fn load(&self) -> Result<WorklogRecord> {
        self.ensure_usable()?;
        match read_generation(&self.primary) {
            Ok(Some(rec)) => {
                info!(path = ?self.primary, files = rec.len(), "Found worklog file");
                Ok(rec)
            }
            Ok(None) => {
                info!(path = ?self.primary, "No worklog data found, starting from scratch");
                Ok(WorklogRecord::new())
            }
            Err(primary_err) => {
                warn!(
                    path = ?self.primary,
                    error = %primary_err,
                    "Worklog file is unreadable, trying backup generation"
                );
                match read_generation(&self.backup) {
                    Ok(Some(rec)) => {
                        warn!(path = ?self.backup, files = rec.len(), "Restored worklog from backup");
                        Ok(rec)
                    }
                    Ok(None) => Err(Error::Worklog(format!(
                        "worklog {:?} is corrupt and no backup exists: {}",
                        self.primary, primary_err
                    ))),
                    Err(backup_err) => Err(Error::Worklog(format!(
                        "worklog {:?} and its backup are both unreadable: {}; {}",
                        self.primary, primary_err, backup_err
                    ))),
                }
            }
        }
    }

    /// Persist `rec`, keeping the previous generation as backup.
    pub fn save(&self, rec: &WorklogRecord) -> Result<()> {
        if self.primary.is_file() {
            fs::copy(&self.primary, &self.backup).map_err(|e| {
                Error::Worklog(format!("failed to write worklog backup {:?}: {}", self.backup, e))
            })?;
        }
        atomic_write(&self.primary, rec)
    }

    /// Truncate the primary file to empty so the next start re-processes
    /// every file from the beginning.
    pub fn truncate(&self) -> Result<()> {
        if self.primary.is_file() {
            File::create(&self.primary).map_err(|e| {
                Error::Worklog(format!("cannot reset worklog {:?}: {}", self.primary, e))
            })?;
        }
        Ok(())
    }
}

/// `Ok(None)` when the file is missing or empty.
fn read_generation(path: &Path) -> Result<Option<WorklogRecord>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if data.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&data)?))
}

/// Write `value` as JSON to `path` atomically (temp file in the same
/// directory, then rename).
pub(crate) fn atomic_write<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let unique_id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    let file = File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WorklogRecord {
        let mut rec = WorklogRecord::new();
        rec.insert("/var/log/a.log".to_string(), FileRange::confirmed(11, 0, 120));
        rec.insert("/var/log/b.log".to_string(), FileRange::unconfirmed(12, 40, 80));
        rec
    }

    #[test]
    fn test_missing_file_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorklogStore::new(dir.path().join("nested"), "tail");
        assert!(store.load().unwrap().is_empty());
        assert!(dir.path().join("nested").is_dir());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorklogStore::new(dir.path(), "tail");
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), sample());
        // first save has nothing to back up
        assert!(!store.backup_path().exists());
    }

    #[test]
    fn test_second_save_keeps_previous_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorklogStore::new(dir.path(), "tail");
        store.save(&sample()).unwrap();

        let mut newer = sample();
        newer.insert("/var/log/c.log".to_string(), FileRange::confirmed(13, 0, 5));
        store.save(&newer).unwrap();

        assert_eq!(store.load().unwrap(), newer);
        let backup: WorklogRecord =
            serde_json::from_slice(&fs::read(store.backup_path()).unwrap()).unwrap();
        assert_eq!(backup, sample());
    }

    #[test]
    fn test_crash_after_backup_before_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorklogStore::new(dir.path(), "tail");
        store.save(&sample()).unwrap();

        // simulate the first half of a save: backup written, primary untouched,
        // plus a stray temp file from the interrupted write
        fs::copy(store.primary_path(), store.backup_path()).unwrap();
        fs::write(store.primary_path().with_extension("tmp.1.1"), b"{\"half").unwrap();

        assert_eq!(store.load().unwrap(), sample());
    }

    #[test]
    fn test_corrupt_primary_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorklogStore::new(dir.path(), "tail");
        store.save(&sample()).unwrap();
        store.save(&sample()).unwrap();

        fs::write(store.primary_path(), b"{\"/var/log/a.log\": {\"ident").unwrap();
        assert_eq!(store.load().unwrap(), sample());
    }

    #[test]
    fn test_corrupt_primary_without_backup_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorklogStore::new(dir.path(), "tail");
        fs::write(store.primary_path(), b"not json").unwrap();
        assert!(matches!(store.load(), Err(Error::Worklog(_))));
    }

    #[test]
    fn test_truncate_means_cold_start_even_with_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorklogStore::new(dir.path(), "tail");
        store.save(&sample()).unwrap();
        store.save(&sample()).unwrap();

        store.truncate().unwrap();
        assert_eq!(fs::metadata(store.primary_path()).unwrap().len(), 0);
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_storage_path_that_is_a_file_is_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();
        let store = WorklogStore::new(&blocker, "tail");
        assert!(store.load().is_err());
    }
}
