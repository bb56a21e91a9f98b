// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::init::config::{AppConfig, SinkConf, SinkKind};
use crate::init::wait::{self, TaskSet};
use crate::logbuffer::{LogBuffer, buffer_id};
use crate::notifications::{LogNotifier, Notifier};
use crate::save::{DryRunSink, NdjsonSink, Sink};
use crate::servicelog::{AppRecord, new_line_parser, new_transformer};
use crate::tail::{
    AppErrorRegister, FileTailer, InactivityMonitor, NoopHealthChecker, NullAlarm,
    ProcessingHealthChecker, TailProcAlarm, TailProcessor, TailSettings, run_tail,
};
use crate::worklog::{Worklog, WorklogConfig};

/// Start every file of `paths` over at its current identity. Missing files
/// are left to the cold start of their first poll. Returns how many files
/// were reset.
pub async fn reset_file_positions<'a>(
    worklog: &Worklog,
    paths: impl IntoIterator<Item = &'a str>,
) -> Result<usize> {
    let mut num_reset = 0;
    for path in paths {
        match worklog.reset_file(path).await {
            Ok(identity) => {
                info!(path, identity, "Worklog position reset");
                num_reset += 1;
            }
            Err(Error::FileNotFound(_)) => {
                info!(path, "File does not exist yet, it will be read from the beginning")
            }
            Err(e) => return Err(e),
        }
    }
    Ok(num_reset)
}

/// Sink selected by `conf`; `dry_run` forces printing to stdout.
pub fn new_sink(conf: &SinkConf, dry_run: bool) -> Arc<dyn Sink> {
    if dry_run {
        warn!("Using dry-run mode, output goes to stdout");
        return Arc::new(DryRunSink::new());
    }
    match (&conf.kind, &conf.path) {
        (SinkKind::Ndjson, Some(path)) => Arc::new(NdjsonSink::new(path)),
        _ => Arc::new(DryRunSink::new()),
    }
}

/// Time the tailers get to finish their current poll after cancellation.
const TAIL_STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default)]
pub struct TailOptions {
    pub worklog_reset: bool,
    pub dry_run: bool,
}

pub struct Agent {
    config: Box<AppConfig>,
    options: TailOptions,
    worklog_config: WorklogConfig,
    notifier: Arc<dyn Notifier>,
}

impl Agent {
    pub fn new(config: Box<AppConfig>, options: TailOptions) -> Self {
        let notifier = Arc::new(LogNotifier::new(config.notification_tag.clone()));
        Self {
            config,
            options,
            worklog_config: WorklogConfig::default(),
            notifier,
        }
    }

    pub fn with_worklog_config(mut self, worklog_config: WorklogConfig) -> Self {
        self.worklog_config = worklog_config;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    fn sink(&self) -> Arc<dyn Sink> {
        new_sink(&self.config.sink, self.options.dry_run)
    }

    /// One tailer per configured file. Files configured with the same
    /// buffer id share one buffer.
    fn build_tailers(
        &self,
        worklog: &Worklog,
        sink: Arc<dyn Sink>,
        health: Arc<dyn ProcessingHealthChecker>,
    ) -> Result<Vec<FileTailer>> {
        let tail_conf = self.config.tail_conf()?;
        let state_dir = if self.options.worklog_reset {
            None
        } else {
            tail_conf.log_buffer_state_dir.as_deref()
        };
        if !tail_conf.alarm_enabled() {
            warn!("Logged errors counting alarm not set");
        }

        let mut shared: HashMap<String, Arc<LogBuffer<AppRecord>>> = HashMap::new();
        let mut tailers = Vec::with_capacity(tail_conf.files.len());
        for f in &tail_conf.files {
            let parser = new_line_parser(&f.app_type, &f.version)?;
            let transformer = new_transformer(
                &f.app_type,
                &f.version,
                self.config.transformer_settings(f.tz_shift_min, f.buffer.as_ref()),
            )?;

            let buffer = match &f.buffer {
                Some(conf) => {
                    let id = buffer_id(conf.id.as_deref(), &f.path);
                    match shared.get(&id) {
                        Some(b) if conf.id.is_some() => {
                            info!(buffer = %id, path = %f.path, "Reusing log processing buffer");
                            b.clone()
                        }
                        _ => {
                            let b = Arc::new(LogBuffer::restore_or_new(
                                state_dir,
                                &id,
                                transformer.history_lookup_items(),
                                conf,
                            ));
                            shared.insert(id, b.clone());
                            b
                        }
                    }
                }
                None => Arc::new(LogBuffer::disabled(buffer_id(None, &f.path))),
            };

            let alarm: Arc<dyn AppErrorRegister> = if tail_conf.alarm_enabled() {
                Arc::new(TailProcAlarm::new(
                    f.path.as_str(),
                    tail_conf.num_errors_alarm,
                    tail_conf.err_count_time_range(),
                    self.notifier.clone(),
                ))
            } else {
                Arc::new(NullAlarm)
            };

            info!(
                path = %f.path,
                app_type = %f.app_type,
                version = %f.version,
                "Creating tail log processor"
            );
            let processor = TailProcessor::new(
                f.path.as_str(),
                parser,
                transformer,
                buffer,
                sink.clone(),
                self.config.sink.chunk_size,
                alarm,
                health.clone(),
                worklog.clone(),
            );
            let settings = TailSettings {
                interval: tail_conf.interval(),
                max_lines_per_check: tail_conf.max_lines_per_check,
                max_line_size: tail_conf.max_line_size,
                max_idle: f
                    .buffer
                    .as_ref()
                    .and_then(|b| b.max_idle_secs)
                    .map(|secs| chrono::Duration::seconds(secs as i64)),
            };
            tailers.push(FileTailer::new(processor, settings));
        }
        Ok(tailers)
    }

    /// Run until `agent_cancel` fires or a task fails. Shutdown order:
    /// tailers (finishing their polls), inactivity monitor, then the
    /// worklog writer with its final save.
    pub async fn run(self, agent_cancel: CancellationToken) -> std::result::Result<(), BoxError> {
        let tail_conf = self.config.tail_conf()?;
        info!(instance_id = %tail_conf.instance_id, files = tail_conf.files.len(), "Starting logproc");

        if self.options.worklog_reset {
            Worklog::reset(&tail_conf.worklog_dir, &tail_conf.instance_id)?;
        }
        let (worklog, writer) = Worklog::open(
            &tail_conf.worklog_dir,
            &tail_conf.instance_id,
            self.worklog_config.clone(),
        )?;

        let mut writer_task_set = TaskSet::new();
        let mut monitor_task_set = TaskSet::new();
        let mut tail_task_set = TaskSet::new();

        let writer_cancel = CancellationToken::new();
        let monitor_cancel = CancellationToken::new();
        let tail_cancel = CancellationToken::new();

        {
            let writer_cancel = writer_cancel.clone();
            writer_task_set.spawn(async move { writer.run(writer_cancel).await.map_err(BoxError::from) });
        }

        if self.options.worklog_reset {
            let paths: Vec<&str> = tail_conf.files.iter().map(|f| f.path.as_str()).collect();
            reset_file_positions(&worklog, paths).await?;
        }

        let limits = tail_conf.inactivity_limits();
        let health: Arc<dyn ProcessingHealthChecker> = if limits.is_empty() {
            Arc::new(NoopHealthChecker)
        } else {
            let monitor = Arc::new(InactivityMonitor::new(
                limits,
                Utc::now(),
                self.notifier.clone(),
                self.config.notification_tag.clone(),
            ));
            let interval = tail_conf.inactivity_check_interval();
            let monitor_cancel = monitor_cancel.clone();
            let m = monitor.clone();
            monitor_task_set.spawn(async move {
                m.run(interval, monitor_cancel).await;
                Ok(())
            });
            monitor
        };

        let tailers = self.build_tailers(&worklog, self.sink(), health)?;
        drop(worklog);
        {
            let tail_cancel = tail_cancel.clone();
            let state_dir = tail_conf.log_buffer_state_dir.clone();
            tail_task_set.spawn(async move { run_tail(tailers, state_dir, tail_cancel).await });
        }

        let mut result = Ok(());
        select! {
            _ = agent_cancel.cancelled() => {
                debug!("Agent cancellation signaled.");
            },
            e = wait::wait_for_any_task(&mut tail_task_set) => {
                match e {
                    Ok(()) => info!("Unexpected early exit of the tailers."),
                    Err(e) => result = Err(e),
                }
            },
            e = wait::wait_for_any_task(&mut writer_task_set) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of the worklog writer."),
                    Err(e) => result = Err(e),
                }
            },
        }

        tail_cancel.cancel();
        if let Err(e) = wait::wait_for_tasks_with_timeout(&mut tail_task_set, TAIL_STOP_TIMEOUT).await {
            warn!(error = %e, "Tailers did not stop cleanly");
            if result.is_ok() {
                result = Err(e);
            }
        }

        monitor_cancel.cancel();
        let _ = wait::wait_for_tasks_with_timeout(&mut monitor_task_set, Duration::from_secs(1)).await;

        // every worklog handle is gone by now, the writer drains and saves
        writer_cancel.cancel();
        let writer_timeout = self.worklog_config.drain_timeout + Duration::from_secs(5);
        if let Err(e) = wait::wait_for_tasks_with_timeout(&mut writer_task_set, writer_timeout).await {
            return Err(format!("worklog writer failed: {}", e).into());
        }

        result
    }
}
