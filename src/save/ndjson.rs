// SPDX-License-Identifier: Apache-2.0

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::save::Sink;
use crate::servicelog::BoundOutputRecord;

/// Appends records as JSON lines to a single file.
///
/// The file is opened lazily on the first chunk and reopened after a failed
/// write, so a sink that lost its file (e.g. removed by logrotate) recovers
/// on the next chunk.
pub struct NdjsonSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl NdjsonSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::Sink(format!("cannot open {}: {}", self.path.display(), e)))
    }

    fn append(file: &File, chunk: &[BoundOutputRecord]) -> std::io::Result<()> {
        let mut w = BufWriter::new(file);
        for rec in chunk {
            serde_json::to_writer(&mut w, &rec.record)?;
            w.write_all(b"\n")?;
        }
        w.flush()?;
        file.sync_data()
    }
}

impl Sink for NdjsonSink {
    fn name(&self) -> &'static str {
        "ndjson"
    }

    fn write_chunk(&self, chunk: &[BoundOutputRecord]) -> Result<()> {
        let mut guard = self
            .file
            .lock()
            .map_err(|_| Error::Sink("file lock poisoned".to_string()))?;
        let file = match guard.take() {
            Some(f) => f,
            None => self.open()?,
        };
        match Self::append(&file, chunk) {
            Ok(()) => {
                *guard = Some(file);
                Ok(())
            }
            Err(e) => Err(Error::Sink(format!(
                "failed to write {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}
