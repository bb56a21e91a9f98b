// SPDX-License-Identifier: Apache-2.0

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::worklog::store::atomic_write;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchProgress {
    last_record: DateTime<Utc>,
}

/// Time of the newest record a batch run delivered. The next run skips
/// everything up to it.
#[derive(Debug, Clone)]
pub struct BatchWorklog {
    path: PathBuf,
}

impl BatchWorklog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when nothing was processed yet (missing or empty file).
    pub fn last_record(&self) -> Result<Option<DateTime<Utc>>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if data.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(None);
        }
        let progress: BatchProgress = serde_json::from_slice(&data).map_err(|e| {
            Error::Worklog(format!("invalid batch worklog {:?}: {}", self.path, e))
        })?;
        Ok(Some(progress.last_record))
    }

    /// Store `time` unless a newer record is already stored.
    pub fn save(&self, time: DateTime<Utc>) -> Result<()> {
        let last_record = match self.last_record()? {
            Some(prev) if prev > time => prev,
            _ => time,
        };
        atomic_write(&self.path, &BatchProgress { last_record })
    }

    pub fn reset(&self) -> Result<()> {
        if self.path.is_file() {
            File::create(&self.path).map_err(|e| {
                Error::Worklog(format!("cannot reset batch worklog {:?}: {}", self.path, e))
            })?;
            info!(path = ?self.path, "Batch worklog reset");
        }
        Ok(())
    }
}
