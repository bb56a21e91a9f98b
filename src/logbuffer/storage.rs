// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{AnalysisState, BotState, BufferConf};
use crate::error::{Error, Result};
use crate::servicelog::InputRecord;
use crate::servicelog::hex;
use crate::worklog::store::atomic_write;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Inner<R> {
    records: HashMap<String, VecDeque<R>>,
    last_checks: HashMap<String, DateTime<Utc>>,
}

impl<R> Default for Inner<R> {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            last_checks: HashMap::new(),
        }
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a, R> {
    buffer: &'a Inner<R>,
    state: &'a AnalysisState,
}

#[derive(Deserialize)]
struct Snapshot<R> {
    buffer: Inner<R>,
    state: AnalysisState,
}

/// Where the state of buffer `id` is persisted.
pub fn state_file_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.buffer.json", id))
}

/// Id of the buffer serving `path`: the configured one for shared buffers,
/// otherwise derived from the path.
pub fn buffer_id(configured: Option<&str>, path: &str) -> String {
    match configured {
        Some(id) => id.to_string(),
        None => hex(&Sha256::digest(path.as_bytes())),
    }
}

/// Recent records per clustering client id, at most `capacity` per client,
/// oldest evicted first.
#[derive(Debug)]
pub struct LogBuffer<R> {
    id: String,
    capacity: usize,
    inner: Mutex<Inner<R>>,
    state: AnalysisState,
}

impl<R: InputRecord + Clone> LogBuffer<R> {
    pub fn new(id: impl Into<String>, capacity: usize, state: AnalysisState) -> Self {
        Self {
            id: id.into(),
            capacity,
            inner: Mutex::new(Inner::default()),
            state,
        }
    }

    /// Buffer that retains nothing, for files without a buffer configuration.
    pub fn disabled(id: impl Into<String>) -> Self {
        Self::new(id, 0, AnalysisState::Simple)
    }

    pub fn from_conf(id: impl Into<String>, conf: &BufferConf) -> Self {
        Self::new(
            id,
            conf.history_lookup_items,
            AnalysisState::for_conf(conf.bot_detection.as_ref()),
        )
    }

    fn lock(&self) -> MutexGuard<'_, Inner<R>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn state(&self) -> &AnalysisState {
        &self.state
    }

    pub fn bot_state(&self) -> Option<&BotState> {
        self.state.bot_state()
    }

    pub fn add_record(&self, rec: R) {
        if self.capacity == 0 {
            return;
        }
        let key = rec.clustering_client_id();
        let mut inner = self.lock();
        let queue = inner.records.entry(key).or_default();
        while queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(rec);
    }

    /// Time of the last analysis of `key`; `None` if it was never analyzed.
    pub fn last_check(&self, key: &str) -> Option<DateTime<Utc>> {
        self.lock().last_checks.get(key).copied()
    }

    /// Visit the records of `key` from oldest to newest.
    pub fn for_each(&self, key: &str, mut f: impl FnMut(&R)) {
        let inner = self.lock();
        if let Some(queue) = inner.records.get(key) {
            queue.iter().for_each(&mut f);
        }
    }

    pub fn records(&self, key: &str) -> Vec<R> {
        let mut ans = Vec::with_capacity(self.num_of_records(key));
        self.for_each(key, |r| ans.push(r.clone()));
        ans
    }

    pub fn num_of_records(&self, key: &str) -> usize {
        self.lock().records.get(key).map(|q| q.len()).unwrap_or(0)
    }

    pub fn num_of_keys(&self) -> usize {
        self.lock().records.len()
    }

    /// Drop records of `key` with time at or before `up_to`.
    pub fn remove_analyzed_records(&self, key: &str, up_to: DateTime<Utc>) {
        let mut inner = self.lock();
        if let Some(queue) = inner.records.get_mut(key) {
            queue.retain(|r| r.time() > up_to);
            if queue.is_empty() {
                inner.records.remove(key);
            }
        }
    }

    pub fn confirm_record_check(&self, rec: &R) {
        let key = rec.clustering_client_id();
        self.lock().last_checks.insert(key, rec.time());
    }

    /// Forget clients whose newest record is older than `now - max_idle`.
    /// Returns the number of removed keys.
    pub fn prune_idle_keys(&self, now: DateTime<Utc>, max_idle: Duration) -> usize {
        let horizon = now - max_idle;
        let mut inner = self.lock();
        let before = inner.records.len();
        inner
            .records
            .retain(|_, queue| queue.back().is_some_and(|r| r.time() >= horizon));
        let Inner {
            records,
            last_checks,
        } = &mut *inner;
        last_checks.retain(|key, checked| records.contains_key(key) || *checked >= horizon);
        let removed = before - records.len();
        if removed > 0 {
            debug!(buffer = %self.id, removed, "Pruned idle buffer keys");
        }
        removed
    }
}

impl<R: InputRecord + Clone + Serialize + DeserializeOwned> LogBuffer<R> {
    /// Persist records, check times and analysis state into `dir`.
    pub fn save_state(&self, dir: &Path) -> Result<()> {
        let path = state_file_path(dir, &self.id);
        let inner = self.lock();
        let snapshot = SnapshotRef {
            buffer: &*inner,
            state: &self.state,
        };
        atomic_write(&path, &snapshot)
            .map_err(|e| Error::BufferState(format!("failed to save {:?}: {}", path, e)))?;
        info!(buffer = %self.id, path = ?path, keys = inner.records.len(), "Saved log buffer state");
        Ok(())
    }

    /// Load the state saved by [`LogBuffer::save_state`].
    pub fn load_state(dir: &Path, id: &str, capacity: usize) -> Result<Self> {
        let path = state_file_path(dir, id);
        let data = std::fs::read(&path)?;
        let snapshot: Snapshot<R> = serde_json::from_slice(&data)
            .map_err(|e| Error::BufferState(format!("invalid state file {:?}: {}", path, e)))?;

        let mut inner = snapshot.buffer;
        if capacity > 0 {
            for queue in inner.records.values_mut() {
                while queue.len() > capacity {
                    queue.pop_front();
                }
            }
        } else {
            inner.records.clear();
        }
        Ok(Self {
            id: id.to_string(),
            capacity,
            inner: Mutex::new(inner),
            state: snapshot.state,
        })
    }

    /// Restore the buffer from `dir` when a saved state exists and matches
    /// the configuration, otherwise start empty. Each client key retains at
    /// most `capacity` records.
    pub fn restore_or_new(dir: Option<&Path>, id: &str, capacity: usize, conf: &BufferConf) -> Self {
        let empty = || Self::new(id, capacity, AnalysisState::for_conf(conf.bot_detection.as_ref()));
        let Some(dir) = dir else {
            return empty();
        };
        if !state_file_path(dir, id).exists() {
            return empty();
        }
        match Self::load_state(dir, id, capacity) {
            Ok(buffer) if buffer.state.bot_state().is_some() == conf.bot_detection.is_some() => {
                info!(buffer = id, keys = buffer.num_of_keys(), "Restored log buffer state");
                buffer
            }
            Ok(_) => {
                warn!(buffer = id, "Saved buffer state does not match the configuration, starting empty");
                empty()
            }
            Err(e) => {
                warn!(buffer = id, error = %e, "Failed to restore log buffer state, starting empty");
                empty()
            }
        }
    }
}
