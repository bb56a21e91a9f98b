// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::logbuffer::BufferConf;

/// Tail mode settings (`logTail` section of the config file).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TailConf {
    pub worklog_dir: PathBuf,
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_lines_per_check")]
    pub max_lines_per_check: usize,
    #[serde(default = "default_max_line_size")]
    pub max_line_size: usize,
    /// Alarm threshold; 0 disables the alarm
    #[serde(default)]
    pub num_errors_alarm: usize,
    #[serde(default)]
    pub err_count_time_range_secs: u64,
    #[serde(default)]
    pub log_buffer_state_dir: Option<PathBuf>,
    #[serde(default = "default_inactivity_check_interval_secs")]
    pub inactivity_check_interval_secs: u64,
    pub files: Vec<FileConf>,
}

/// One watched file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConf {
    pub path: String,
    pub app_type: String,
    pub version: String,
    #[serde(default)]
    pub tz_shift_min: i32,
    /// Notify when no record was seen for this long
    #[serde(default)]
    pub inactivity_alarm_secs: Option<u64>,
    #[serde(default)]
    pub buffer: Option<BufferConf>,
}

fn default_instance_id() -> String {
    "logproc".to_string()
}

fn default_interval_secs() -> u64 {
    15
}

fn default_max_lines_per_check() -> usize {
    1000
}

fn default_max_line_size() -> usize {
    64 * 1024
}

fn default_inactivity_check_interval_secs() -> u64 {
    60
}

impl TailConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn err_count_time_range(&self) -> Duration {
        Duration::from_secs(self.err_count_time_range_secs)
    }

    pub fn inactivity_check_interval(&self) -> Duration {
        Duration::from_secs(self.inactivity_check_interval_secs)
    }

    pub fn alarm_enabled(&self) -> bool {
        self.num_errors_alarm > 0 && self.err_count_time_range_secs > 0
    }

    /// Inactivity limits of the files that have one.
    pub fn inactivity_limits(&self) -> Vec<(String, Duration)> {
        self.files
            .iter()
            .filter_map(|f| {
                f.inactivity_alarm_secs
                    .filter(|secs| *secs > 0)
                    .map(|secs| (f.path.clone(), Duration::from_secs(secs)))
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.instance_id.is_empty() {
            return Err(Error::Config("logTail.instanceId must not be empty".to_string()));
        }
        if self.interval_secs == 0 {
            return Err(Error::Config("logTail.intervalSecs must be positive".to_string()));
        }
        if self.max_lines_per_check == 0 {
            return Err(Error::Config(
                "logTail.maxLinesPerCheck must be positive".to_string(),
            ));
        }
        if self.max_line_size == 0 {
            return Err(Error::Config("logTail.maxLineSize must be positive".to_string()));
        }
        if self.files.is_empty() {
            return Err(Error::Config("logTail.files: no files to watch".to_string()));
        }
        let mut seen = HashSet::new();
        for f in &self.files {
            if f.path.is_empty() {
                return Err(Error::Config("logTail.files: empty path".to_string()));
            }
            if !seen.insert(f.path.as_str()) {
                return Err(Error::Config(format!(
                    "logTail.files: {} configured more than once",
                    f.path
                )));
            }
            if let Some(buffer) = &f.buffer {
                buffer.validate(&f.path)?;
            }
        }
        Ok(())
    }
}
