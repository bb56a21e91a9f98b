// SPDX-License-Identifier: Apache-2.0

//! File identity and size lookups.
//!
//! The identity is the inode number, which stays the same when a file is
//! renamed and changes when a rotated log is replaced by a new file at the
//! same path.

use std::fs::{File, Metadata};
use std::io;
use std::path::Path;

/// Identity and current length of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileProps {
    pub identity: i64,
    pub size: i64,
}

impl FileProps {
    /// Stat a path.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Self::from_metadata(&metadata)
    }

    /// Stat an already open handle, so identity and content belong to the
    /// same file even if the path is swapped concurrently.
    pub fn from_file(file: &File) -> io::Result<Self> {
        let metadata = file.metadata()?;
        Self::from_metadata(&metadata)
    }

    #[cfg(unix)]
    fn from_metadata(metadata: &Metadata) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            ));
        }
        Ok(Self {
            identity: metadata.ino() as i64,
            size: metadata.len() as i64,
        })
    }

    #[cfg(not(unix))]
    fn from_metadata(_metadata: &Metadata) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "file identity requires inode support",
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_identity_survives_rename() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.log");
        let b = dir.path().join("b.log");
        std::fs::write(&a, b"hello\n").unwrap();

        let before = FileProps::from_path(&a).unwrap();
        std::fs::rename(&a, &b).unwrap();
        let after = FileProps::from_path(&b).unwrap();

        assert_eq!(before.identity, after.identity);
        assert_eq!(after.size, 6);
    }

    #[test]
    fn test_replaced_file_gets_new_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let rotated = dir.path().join("app.log.1");
        std::fs::write(&path, b"old\n").unwrap();
        let old = FileProps::from_path(&path).unwrap();

        std::fs::rename(&path, &rotated).unwrap();
        let mut f = File::create(&path).unwrap();
        f.write_all(b"new\n").unwrap();

        let new = FileProps::from_path(&path).unwrap();
        assert_ne!(old.identity, new.identity);
        assert_eq!(FileProps::from_file(&f).unwrap().identity, new.identity);
    }

    #[test]
    fn test_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileProps::from_path(dir.path()).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = FileProps::from_path("/nonexistent/really/not/here.log").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
