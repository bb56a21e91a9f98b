// SPDX-License-Identifier: Apache-2.0

//! Per-file error counting alarm.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::notifications::{Notifier, spawn_notify};

/// Collects processing errors of one watched file.
pub trait AppErrorRegister: Send + Sync {
    fn on_error(&self, message: &str);

    /// Called once per poll.
    fn evaluate(&self);

    fn reset(&self);
}

/// Used when the alarm is not configured.
#[derive(Debug, Default)]
pub struct NullAlarm;

impl AppErrorRegister for NullAlarm {
    fn on_error(&self, _message: &str) {}

    fn evaluate(&self) {}

    fn reset(&self) {}
}

#[derive(Default)]
struct AlarmState {
    errors: VecDeque<Instant>,
    last_message: Option<String>,
    fired: bool,
}

/// Fires when at least `max_errors` errors happened within `time_range`.
/// It fires once per breach and re-arms when the count drops below the
/// threshold again.
pub struct TailProcAlarm {
    path: String,
    max_errors: usize,
    time_range: Duration,
    notifier: Arc<dyn Notifier>,
    state: Mutex<AlarmState>,
}

impl TailProcAlarm {
    pub fn new(
        path: impl Into<String>,
        max_errors: usize,
        time_range: Duration,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            path: path.into(),
            max_errors: max_errors.max(1),
            time_range,
            notifier,
            state: Mutex::new(AlarmState::default()),
        }
    }
}

impl AppErrorRegister for TailProcAlarm {
    fn on_error(&self, message: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.errors.push_back(Instant::now());
        state.last_message = Some(message.to_string());
    }

    fn evaluate(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        while let Some(oldest) = state.errors.front() {
            if now.duration_since(*oldest) > self.time_range {
                state.errors.pop_front();
            } else {
                break;
            }
        }

        let num_errors = state.errors.len();
        if num_errors < self.max_errors {
            state.fired = false;
            return;
        }
        if state.fired {
            return;
        }
        state.fired = true;
        let last_error = state.last_message.clone().unwrap_or_default();
        drop(state);

        warn!(
            path = %self.path,
            num_errors,
            time_range_secs = self.time_range.as_secs(),
            last_error = %last_error,
            "Too many processing errors"
        );
        spawn_notify(
            self.notifier.clone(),
            format!("logproc: too many errors in {}", self.path),
            format!(
                "{} errors within the last {} seconds while processing {}. Last error: {}",
                num_errors,
                self.time_range.as_secs(),
                self.path,
                last_error
            ),
        );
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = AlarmState::default();
    }
}
