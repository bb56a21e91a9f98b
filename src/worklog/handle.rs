// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::info;

use crate::bounded_channel::{self, BoundedSender};
use crate::error::{Error, Result};
use crate::fsop::FileProps;
use crate::worklog::range::FileRange;
use crate::worklog::store::WorklogStore;
use crate::worklog::writer::{WorklogConfig, WorklogWriter};

pub(crate) type SharedRanges = Arc<RwLock<HashMap<String, FileRange>>>;

pub(crate) fn read_ranges(ranges: &SharedRanges) -> RwLockReadGuard<'_, HashMap<String, FileRange>> {
    ranges.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_ranges(
    ranges: &SharedRanges,
) -> RwLockWriteGuard<'_, HashMap<String, FileRange>> {
    ranges.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub path: String,
    pub range: FileRange,
}

/// Cloneable handle to the worklog. Reads go straight to the shared map,
/// updates are queued for the [`WorklogWriter`].
#[derive(Clone)]
pub struct Worklog {
    ranges: SharedRanges,
    requests: BoundedSender<UpdateRequest>,
}

impl Worklog {
    /// Load the persisted worklog of `instance_id` under `dir` and return a
    /// handle plus the writer task that must be spawned to apply updates.
    pub fn open(
        dir: impl AsRef<Path>,
        instance_id: &str,
        config: WorklogConfig,
    ) -> Result<(Worklog, WorklogWriter)> {
        let store = WorklogStore::new(dir, instance_id);
        let loaded = store.load()?;
        let ranges: SharedRanges = Arc::new(RwLock::new(loaded.into_iter().collect()));

        let (tx, rx) = bounded_channel::bounded(config.queue_size.max(1));
        let writer = WorklogWriter::new(rx, ranges.clone(), store, config);
        Ok((
            Worklog {
                ranges,
                requests: tx,
            },
            writer,
        ))
    }

    /// Truncate the persisted worklog so every file is processed again on the
    /// next start.
    pub fn reset(dir: impl AsRef<Path>, instance_id: &str) -> Result<()> {
        let store = WorklogStore::new(dir, instance_id);
        store.truncate()?;
        info!(path = ?store.primary_path(), "Worklog reset");
        Ok(())
    }

    /// Last known range of `path`, or [`FileRange::UNKNOWN`].
    pub fn get_range(&self, path: &str) -> FileRange {
        read_ranges(&self.ranges)
            .get(path)
            .copied()
            .unwrap_or(FileRange::UNKNOWN)
    }

    /// Queue a progress report. Returns once the request is queued, not once
    /// it is applied.
    pub async fn request_update(&self, path: &str, range: FileRange) -> Result<()> {
        self.requests
            .send(UpdateRequest {
                path: path.to_string(),
                range,
            })
            .await
            .map_err(|_| Error::ChannelSend)
    }

    /// Forget progress on `path` and start it over at its current identity.
    /// Returns that identity.
    pub async fn reset_file(&self, path: &str) -> Result<i64> {
        let props = FileProps::from_path(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound(path.into()),
            _ => Error::Io(e),
        })?;
        self.request_update(path, FileRange::confirmed(props.identity, 0, 0))
            .await?;
        Ok(props.identity)
    }
}
