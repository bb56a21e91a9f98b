// SPDX-License-Identifier: Apache-2.0

//! Watchdog for files that stopped producing records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::notifications::{Notifier, spawn_notify};

pub trait ProcessingHealthChecker: Send + Sync {
    /// Report that `path` produced a record with the given time.
    fn ping(&self, path: &str, time: DateTime<Utc>);
}

/// Health checker for setups without inactivity limits.
#[derive(Debug, Default)]
pub struct NoopHealthChecker;

impl ProcessingHealthChecker for NoopHealthChecker {
    fn ping(&self, _path: &str, _time: DateTime<Utc>) {}
}

#[derive(Debug, Clone, Copy)]
struct Activity {
    last_seen: DateTime<Utc>,
    notified: bool,
}

/// Compares the last activity of every file with a limit and notifies once
/// per stall. A ping clears the stall.
pub struct InactivityMonitor {
    limits: HashMap<String, chrono::Duration>,
    activity: DashMap<String, Activity>,
    notifier: Arc<dyn Notifier>,
    tag: Option<String>,
}

impl InactivityMonitor {
    /// Files are considered active at `start`.
    pub fn new(
        limits: Vec<(String, Duration)>,
        start: DateTime<Utc>,
        notifier: Arc<dyn Notifier>,
        tag: Option<String>,
    ) -> Self {
        let activity = DashMap::new();
        let limits: HashMap<String, chrono::Duration> = limits
            .into_iter()
            .map(|(path, limit)| {
                activity.insert(
                    path.clone(),
                    Activity {
                        last_seen: start,
                        notified: false,
                    },
                );
                let limit = chrono::Duration::from_std(limit).unwrap_or(chrono::Duration::MAX);
                (path, limit)
            })
            .collect();
        Self {
            limits,
            activity,
            notifier,
            tag,
        }
    }

    pub fn last_seen(&self, path: &str) -> Option<DateTime<Utc>> {
        self.activity.get(path).map(|a| a.last_seen)
    }

    /// Notify about files inactive at `now`. Returns the newly stalled paths.
    pub fn check(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut stalled = Vec::new();
        for mut entry in self.activity.iter_mut() {
            let Some(limit) = self.limits.get(entry.key()) else {
                continue;
            };
            let idle = now - entry.last_seen;
            if idle <= *limit || entry.notified {
                continue;
            }
            entry.notified = true;
            warn!(
                path = %entry.key(),
                last_seen = %entry.last_seen,
                idle_secs = idle.num_seconds(),
                "No new records for too long"
            );
            stalled.push(entry.key().clone());
        }
        for path in &stalled {
            let tag = self.tag.as_deref().map(|t| format!("[{}] ", t)).unwrap_or_default();
            spawn_notify(
                self.notifier.clone(),
                format!("{}logproc: {} inactive", tag, path),
                format!(
                    "No records were read from {} for more than {} seconds",
                    path,
                    self.limits.get(path).map(|l| l.num_seconds()).unwrap_or(0)
                ),
            );
        }
        stalled
    }

    /// Check every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.tick().await;
        loop {
            select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check(Utc::now());
                }
            }
        }
        debug!("Exiting inactivity monitor");
    }
}

impl ProcessingHealthChecker for InactivityMonitor {
    fn ping(&self, path: &str, time: DateTime<Utc>) {
        if let Some(mut a) = self.activity.get_mut(path) {
            if time > a.last_seen {
                a.last_seen = time;
            }
            a.notified = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::testing::RecordingNotifier;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn monitor(notifier: &Arc<RecordingNotifier>) -> InactivityMonitor {
        InactivityMonitor::new(
            vec![("/a.log".to_string(), Duration::from_secs(100))],
            t(0),
            notifier.clone(),
            Some("test".to_string()),
        )
    }

    #[tokio::test]
    async fn test_notifies_once_per_stall() {
        let notifier = Arc::new(RecordingNotifier::default());
        let m = monitor(&notifier);

        assert!(m.check(t(50)).is_empty());
        assert_eq!(m.check(t(150)), vec!["/a.log".to_string()]);
        assert!(m.check(t(200)).is_empty());

        m.ping("/a.log", t(190));
        assert!(m.check(t(250)).is_empty());
        assert_eq!(m.check(t(300)), vec!["/a.log".to_string()]);
    }

    #[tokio::test]
    async fn test_ping_keeps_latest_time_and_ignores_unknown() {
        let notifier = Arc::new(RecordingNotifier::default());
        let m = monitor(&notifier);
        m.ping("/a.log", t(40));
        m.ping("/a.log", t(10));
        m.ping("/b.log", t(10));
        assert_eq!(m.last_seen("/a.log"), Some(t(40)));
        assert_eq!(m.last_seen("/b.log"), None);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let notifier = Arc::new(RecordingNotifier::default());
        let m = Arc::new(monitor(&notifier));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(m.run(Duration::from_secs(1), cancel.clone()));
        cancel.cancel();
        task.await.unwrap();
    }
}
