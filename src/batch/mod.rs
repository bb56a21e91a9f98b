// SPDX-License-Identifier: Apache-2.0

//! Batch mode: one pass over a log file or a directory of rotated logs.
//!
//! Unlike tail mode there are no byte positions. The batch worklog keeps the
//! time of the newest delivered record and the next run skips every record
//! up to it. The worklog only moves when every chunk of the run was written.

pub mod fileselect;
pub mod worklog;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analysis::bots;
use crate::bounded_channel::{self, BoundedSender};
use crate::error::{Error, Result};
use crate::fsop::FileProps;
use crate::logbuffer::{BufferConf, LogBuffer, buffer_id};
use crate::save::{Sink, run_write_consumer};
use crate::servicelog::{
    AppRecord, BoundOutputRecord, InputRecord, LineParser, Transformer, TransformerSettings,
    new_line_parser, new_transformer,
};
use crate::tail::reader::{self, LineSpan};
use crate::worklog::FileRange;

pub use worklog::BatchWorklog;

const LINES_PER_READ: usize = 1000;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConf {
    /// A log file or a directory of log files
    pub src_path: PathBuf,
    /// Also take files whose first record is older than the last processed
    /// one, if they were modified since
    #[serde(default)]
    pub partially_matching_files: bool,
    pub worklog_path: PathBuf,
    #[serde(default)]
    pub log_buffer_state_dir: Option<PathBuf>,
    pub app_type: String,
    pub version: String,
    #[serde(default)]
    pub tz_shift_min: i32,
    #[serde(default = "default_max_line_size")]
    pub max_line_size: usize,
    #[serde(default)]
    pub buffer: Option<BufferConf>,
}

fn default_max_line_size() -> usize {
    64 * 1024
}

impl BatchConf {
    pub fn validate(&self) -> Result<()> {
        if self.max_line_size == 0 {
            return Err(Error::Config("logFiles.maxLineSize must be positive".to_string()));
        }
        new_line_parser(&self.app_type, &self.version)?;
        new_transformer(&self.app_type, &self.version, TransformerSettings::default())?;
        if let Some(buffer) = &self.buffer {
            buffer.validate(&self.src_path.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Optional bounds on record time, both inclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatetimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DatetimeRange {
    /// Each bound is either a UNIX timestamp in seconds or an RFC 3339
    /// datetime.
    pub fn parse(from: Option<&str>, to: Option<&str>) -> Result<Self> {
        Ok(Self {
            from: from.map(parse_time_bound).transpose()?,
            to: to.map(parse_time_bound).transpose()?,
        })
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| time >= from) && self.to.is_none_or(|to| time <= to)
    }
}

fn parse_time_bound(value: &str) -> Result<DateTime<Utc>> {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        return value
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| Error::Config(format!("invalid UNIX timestamp {}", value)));
    }
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| {
            Error::Config(format!(
                "unrecognized time {:?}, expected a UNIX timestamp or YYYY-MM-DDTHH:mm:ss±hh:mm",
                value
            ))
        })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub num_files: usize,
    pub num_lines: usize,
    /// Lines that did not parse, were not processable or fell outside the
    /// processed time range
    pub skipped: usize,
    /// Chunks confirmed by the sink
    pub written: usize,
    /// Chunks the sink failed to write
    pub failed: usize,
    /// Newest record sent to the sink
    pub last_record: Option<DateTime<Utc>>,
}

/// One batch run over the sources of `conf`.
pub struct BatchRunner {
    conf: BatchConf,
    parser: LineParser,
    transformer: Transformer,
    buffer: LogBuffer<AppRecord>,
    sink: Arc<dyn Sink>,
    chunk_size: usize,
    range: DatetimeRange,
    worklog: BatchWorklog,
}

impl BatchRunner {
    pub fn new(
        conf: BatchConf,
        settings: TransformerSettings,
        sink: Arc<dyn Sink>,
        chunk_size: usize,
        range: DatetimeRange,
        worklog_reset: bool,
    ) -> Result<Self> {
        let parser = new_line_parser(&conf.app_type, &conf.version)?;
        let transformer = new_transformer(&conf.app_type, &conf.version, settings)?;
        let worklog = BatchWorklog::new(&conf.worklog_path);
        if worklog_reset {
            worklog.reset()?;
        }
        let path = conf.src_path.to_string_lossy().into_owned();
        let buffer = match &conf.buffer {
            Some(buffer_conf) => LogBuffer::restore_or_new(
                conf.log_buffer_state_dir.as_deref().filter(|_| !worklog_reset),
                &buffer_id(buffer_conf.id.as_deref(), &path),
                transformer.history_lookup_items(),
                buffer_conf,
            ),
            None => LogBuffer::disabled(buffer_id(None, &path)),
        };
        Ok(Self {
            conf,
            parser,
            transformer,
            buffer,
            sink,
            chunk_size: chunk_size.max(1),
            range,
            worklog,
        })
    }

    /// Process every selected file once. Stops between files when `cancel`
    /// fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<BatchReport> {
        if !self.conf.src_path.exists() {
            return Err(Error::FileNotFound(self.conf.src_path.clone()));
        }
        let min_time = self.worklog.last_record()?;
        info!(
            src_path = ?self.conf.src_path,
            worklog = ?self.worklog.path(),
            last_record = ?min_time,
            "Starting batch processing"
        );
        let files = fileselect::select_files(
            &self.conf.src_path,
            min_time,
            !self.conf.partially_matching_files,
            &self.parser,
        )?;
        info!(num_files = files.len(), src_path = ?self.conf.src_path, "Found files to process");

        let mut report = BatchReport::default();
        for (i, file) in files.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(rest = ?&files[i..], "Not processing other files due to cancellation");
                break;
            }
            self.process_file(file, min_time, &mut report).await?;
            report.num_files += 1;
        }

        match report.last_record {
            Some(last) if report.failed == 0 => self.worklog.save(last)?,
            Some(_) => warn!(
                failed = report.failed,
                "Some records were not written, batch worklog not updated"
            ),
            None => {}
        }
        if self.buffer.capacity() > 0 {
            if let Some(state) = self.buffer.bot_state() {
                bots::log_report(self.buffer.id(), state);
            }
            if let Some(dir) = &self.conf.log_buffer_state_dir {
                if let Err(e) = self.buffer.save_state(dir) {
                    error!(buffer = self.buffer.id(), error = %e, "Failed to save buffer state");
                }
            }
        }
        info!(?report, "Batch processing done");
        Ok(report)
    }

    async fn process_file(
        &self,
        path: &Path,
        min_time: Option<DateTime<Utc>>,
        report: &mut BatchReport,
    ) -> Result<()> {
        let path_str = path.to_string_lossy().into_owned();
        debug!(path = %path_str, "Processing log file");

        let (records_tx, records_rx) = bounded_channel::bounded(self.chunk_size * 2);
        let mut confirms = run_write_consumer(self.sink.clone(), records_rx, self.chunk_size);
        let counter = tokio::spawn(async move {
            let (mut written, mut failed) = (0, 0);
            while let Some(msg) = confirms.next().await {
                if msg.is_error() {
                    failed += 1;
                } else {
                    written += 1;
                }
            }
            (written, failed)
        });

        let read = self.send_file(path, &path_str, min_time, &records_tx, report).await;
        drop(records_tx);
        match counter.await {
            Ok((written, failed)) => {
                report.written += written;
                report.failed += failed;
            }
            Err(e) => {
                error!(path = %path_str, error = %e, "Confirmation counter failed");
                report.failed += 1;
            }
        }
        read
    }

    async fn send_file(
        &self,
        path: &Path,
        path_str: &str,
        min_time: Option<DateTime<Utc>>,
        records: &BoundedSender<BoundOutputRecord>,
        report: &mut BatchReport,
    ) -> Result<()> {
        let mut file = File::open(path)?;
        let identity = FileProps::from_file(&file)?.identity;
        let max_line_size = self.conf.max_line_size;
        let mut offset = 0;
        let mut line_num = 0;
        loop {
            let (f, lines) = tokio::task::spawn_blocking(move || {
                reader::read_lines(&mut file, offset, LINES_PER_READ, max_line_size)
                    .map(|lines| (file, lines))
            })
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;
            file = f;
            let Some(last) = lines.last() else {
                return Ok(());
            };
            offset = last.end;
            for line in &lines {
                line_num += 1;
                report.num_lines += 1;
                if !self
                    .send_line(line, line_num, identity, path_str, min_time, records, report)
                    .await?
                {
                    report.skipped += 1;
                }
            }
        }
    }

    /// Returns whether the line produced output.
    #[allow(clippy::too_many_arguments)]
    async fn send_line(
        &self,
        line: &LineSpan,
        line_num: i64,
        identity: i64,
        path: &str,
        min_time: Option<DateTime<Utc>>,
        records: &BoundedSender<BoundOutputRecord>,
        report: &mut BatchReport,
    ) -> Result<bool> {
        let parsed = match self.parser.parse_line(&line.text, line_num) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(path, error = %e, "Failed to parse line");
                return Ok(false);
            }
        };
        let time = parsed.time();
        if !parsed.is_processable()
            || min_time.is_some_and(|min| time <= min)
            || !self.range.contains(time)
        {
            return Ok(false);
        }

        let mut sent = false;
        for rec in self.transformer.preprocess(parsed, &self.buffer) {
            self.buffer.add_record(rec.clone());
            let out = match self.transformer.transform(&rec) {
                Ok(out) => out,
                Err(e) => {
                    warn!(path, error = %e, "Failed to transform record");
                    continue;
                }
            };
            let time = out.time();
            let bound = BoundOutputRecord {
                path: path.to_string(),
                span: FileRange::unconfirmed(identity, line.start, line.end),
                record: out,
            };
            records.send(bound).await.map_err(|_| Error::ChannelSend)?;
            report.last_record = report.last_record.max(Some(time));
            sent = true;
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_bounds() {
        let range = DatetimeRange::parse(Some("1568621040"), Some("2019-09-16T10:30:00+02:00")).unwrap();
        assert_eq!(range.from, Some(Utc.with_ymd_and_hms(2019, 9, 16, 8, 4, 0).unwrap()));
        assert_eq!(range.to, Some(Utc.with_ymd_and_hms(2019, 9, 16, 8, 30, 0).unwrap()));

        assert!(range.contains(Utc.with_ymd_and_hms(2019, 9, 16, 8, 30, 0).unwrap()));
        assert!(!range.contains(Utc.with_ymd_and_hms(2019, 9, 16, 8, 30, 1).unwrap()));
        assert!(!range.contains(Utc.with_ymd_and_hms(2019, 9, 16, 8, 0, 0).unwrap()));
        assert!(DatetimeRange::default().contains(DateTime::UNIX_EPOCH));
    }

    #[test]
    fn test_invalid_time_bound() {
        assert!(matches!(
            DatetimeRange::parse(Some("yesterday"), None),
            Err(Error::Config(_))
        ));
    }
}
