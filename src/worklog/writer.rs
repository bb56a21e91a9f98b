// SPDX-License-Identifier: Apache-2.0

//! Single writer of the worklog.
//!
//! Every progress report goes through one task, so the reconciliation rules
//! are applied in arrival order and the shared map is never mutated
//! concurrently. The task outlives the tail tasks: it keeps receiving until
//! every [`Worklog`](super::Worklog) handle is dropped, then saves one last
//! time.

use std::time::{Duration, Instant};

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::BoundedReceiver;
use crate::error::Result;
use crate::worklog::handle::{SharedRanges, UpdateRequest, read_ranges, write_ranges};
use crate::worklog::range::FileRange;
use crate::worklog::store::{WorklogRecord, WorklogStore};

#[derive(Debug, Clone)]
pub struct WorklogConfig {
    /// Interval between periodic saves
    pub autosave_interval: Duration,
    /// Maximum time to wait for queued requests after cancellation
    pub drain_timeout: Duration,
    /// How long saves may keep failing before the writer gives up
    pub max_save_failure_duration: Duration,
    /// Capacity of the update request queue
    pub queue_size: usize,
}

impl Default for WorklogConfig {
    fn default() -> Self {
        Self {
            autosave_interval: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(2),
            max_save_failure_duration: Duration::from_secs(300),
            queue_size: 1000,
        }
    }
}

pub struct WorklogWriter {
    requests: BoundedReceiver<UpdateRequest>,
    ranges: SharedRanges,
    store: WorklogStore,
    config: WorklogConfig,
    dirty: bool,
    save_first_failure: Option<Instant>,
}

impl WorklogWriter {
    pub(crate) fn new(
        requests: BoundedReceiver<UpdateRequest>,
        ranges: SharedRanges,
        store: WorklogStore,
        config: WorklogConfig,
    ) -> Self {
        Self {
            requests,
            ranges,
            store,
            config,
            dirty: false,
            save_first_failure: None,
        }
    }

    /// Apply requests until every handle is gone or `cancel` fires, saving on
    /// the autosave interval. Always finishes with a final save.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(path = ?self.store.primary_path(), "Worklog writer started");

        let mut autosave = tokio::time::interval(self.config.autosave_interval);
        // first tick fires immediately
        autosave.tick().await;

        let mut fatal_error = None;
        let mut cancelled = false;

        loop {
            select! {
                biased;

                _ = autosave.tick() => {
                    if let Err(e) = self.maybe_save() {
                        error!(error = %e, "Worklog saves kept failing, giving up");
                        fatal_error = Some(e);
                        break;
                    }
                }

                req = self.requests.next() => {
                    match req {
                        Some(req) => self.apply(req),
                        None => {
                            debug!("All worklog handles dropped, exiting writer loop");
                            break;
                        }
                    }
                }

                _ = cancel.cancelled() => {
                    debug!("Worklog writer cancelled, draining pending requests");
                    cancelled = true;
                    break;
                }
            }
        }

        if cancelled {
            self.drain().await;
        }

        let final_save = self.save();
        match &final_save {
            Ok(()) => info!(path = ?self.store.primary_path(), "Worklog saved on close"),
            Err(e) => warn!(error = %e, "Failed to perform final worklog save"),
        }

        match fatal_error {
            Some(e) => Err(e),
            None => final_save,
        }
    }

    fn apply(&mut self, req: UpdateRequest) {
        let mut ranges = write_ranges(&self.ranges);
        let current = ranges
            .get(&req.path)
            .copied()
            .unwrap_or(FileRange::UNKNOWN);

        if !req.range.supersedes(&current) {
            debug!(path = %req.path, current = %current, candidate = %req.range, "Discarding stale range");
            return;
        }
        if !current.is_unknown() && current.identity != req.range.identity {
            warn!(
                path = %req.path,
                old_identity = current.identity,
                new_identity = req.range.identity,
                "File identity changed, previous progress discarded"
            );
        }
        debug!(path = %req.path, range = %req.range, "Worklog range updated");
        ranges.insert(req.path, req.range);
        self.dirty = true;
    }

    /// Apply whatever is still queued, bounded by the drain timeout.
    async fn drain(&mut self) {
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        let mut count = 0;

        loop {
            match tokio::time::timeout_at(deadline, self.requests.next()).await {
                Ok(Some(req)) => {
                    self.apply(req);
                    count += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(count, "Worklog drain deadline reached");
                    break;
                }
            }
        }

        if count > 0 {
            info!(count, "Drained pending worklog updates");
        }
    }

    /// Autosave. Errors only when failures outlast the configured threshold.
    fn maybe_save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        match self.save() {
            Ok(()) => {
                if self.save_first_failure.take().is_some() {
                    info!("Worklog save succeeded after previous failures");
                }
                Ok(())
            }
            Err(e) => {
                let first_failure = *self.save_first_failure.get_or_insert_with(Instant::now);
                let failing_for = first_failure.elapsed();
                if failing_for >= self.config.max_save_failure_duration {
                    Err(e)
                } else {
                    warn!(error = %e, ?failing_for, "Worklog autosave failed, will retry");
                    Ok(())
                }
            }
        }
    }

    fn save(&mut self) -> Result<()> {
        let snapshot: WorklogRecord = read_ranges(&self.ranges)
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        self.store.save(&snapshot)?;
        self.dirty = false;
        debug!(files = snapshot.len(), "Worklog saved");
        Ok(())
    }
}
