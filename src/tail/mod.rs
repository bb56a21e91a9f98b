// SPDX-License-Identifier: Apache-2.0

//! Tail mode: every watched file is polled by its own task, new complete
//! lines are dispatched through the application's parser and transformer to
//! the sink, and the sink's confirmations are reconciled into the worklog.

pub mod alarm;
pub mod config;
pub mod engine;
pub mod health;
pub mod processor;
pub mod reader;

pub use alarm::{AppErrorRegister, NullAlarm, TailProcAlarm};
pub use config::{FileConf, TailConf};
pub use engine::{FileTailer, PollReport, StartKind, TailSettings, run_tail, start_offset};
pub use health::{InactivityMonitor, NoopHealthChecker, ProcessingHealthChecker};
pub use processor::{CheckSession, ConfirmSummary, TailProcessor};
