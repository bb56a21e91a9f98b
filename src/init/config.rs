// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Json};
use serde::Deserialize;

use crate::batch::BatchConf;
use crate::error::{Error, Result};
use crate::logbuffer::BufferConf;
use crate::servicelog::{TransformerSettings, new_line_parser, new_transformer};
use crate::tail::TailConf;

pub const ENV_PREFIX: &str = "LOGPROC_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SinkKind {
    #[default]
    DryRun,
    Ndjson,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkConf {
    #[serde(default)]
    pub kind: SinkKind,
    /// Output file of the NDJSON sink
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Records written and confirmed together
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_chunk_size() -> usize {
    100
}

impl Default for SinkConf {
    fn default() -> Self {
        Self {
            kind: SinkKind::default(),
            path: None,
            chunk_size: default_chunk_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Files watched by `tail`
    #[serde(default)]
    pub log_tail: Option<TailConf>,
    /// Source processed by `batch`
    #[serde(default)]
    pub log_files: Option<BatchConf>,
    /// User ids treated as anonymous
    #[serde(default)]
    pub anonymous_users: Vec<i64>,
    #[serde(default)]
    pub sink: SinkConf,
    #[serde(default)]
    pub notification_tag: Option<String>,
}

impl AppConfig {
    /// Everything that would otherwise fail only once files are watched.
    pub fn validate(&self) -> Result<()> {
        if self.log_tail.is_none() && self.log_files.is_none() {
            return Err(Error::Config(
                "at least one of logTail and logFiles must be configured".to_string(),
            ));
        }
        if self.sink.chunk_size == 0 {
            return Err(Error::Config("sink.chunkSize must be positive".to_string()));
        }
        if self.sink.kind == SinkKind::Ndjson && self.sink.path.is_none() {
            return Err(Error::Config("sink.path is required by the ndjson sink".to_string()));
        }
        if let Some(tail) = &self.log_tail {
            tail.validate()?;
            for f in &tail.files {
                new_line_parser(&f.app_type, &f.version)?;
                new_transformer(&f.app_type, &f.version, TransformerSettings::default())?;
            }
        }
        if let Some(batch) = &self.log_files {
            batch.validate()?;
        }
        Ok(())
    }

    pub fn tail_conf(&self) -> Result<&TailConf> {
        self.log_tail
            .as_ref()
            .ok_or_else(|| Error::Config("logTail section is required by tail".to_string()))
    }

    pub fn batch_conf(&self) -> Result<&BatchConf> {
        self.log_files
            .as_ref()
            .ok_or_else(|| Error::Config("logFiles section is required by batch".to_string()))
    }

    pub fn transformer_settings(
        &self,
        tz_shift_min: i32,
        buffer: Option<&BufferConf>,
    ) -> TransformerSettings {
        TransformerSettings {
            tz_shift_min,
            anonymous_users: self.anonymous_users.clone(),
            buffer: buffer.cloned(),
        }
    }
}

/// Load the JSON config at `path`. Environment variables prefixed with
/// `LOGPROC_` override single values, with `__` separating nested keys
/// (e.g. `LOGPROC_logTail__intervalSecs=5`).
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.is_file() {
        return Err(Error::Config(format!(
            "config file {} not found",
            path.display()
        )));
    }
    let config: AppConfig = Figment::new()
        .merge(Json::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__").lowercase(false))
        .extract()
        .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"{
        "logTail": {
            "worklogDir": "/var/lib/logproc",
            "intervalSecs": 5,
            "files": [
                {"path": "/var/log/kontext/app.log", "appType": "kontext", "version": "0.18"},
                {"path": "/var/log/mapka/access.log", "appType": "mapka", "version": "3",
                 "buffer": {"historyLookupItems": 200, "analysisIntervalSecs": 60,
                            "clusteringDbScan": {"minDensity": 3, "epsilon": 2.0}}}
            ]
        },
        "anonymousUsers": [0, 1],
        "sink": {"kind": "ndjson", "path": "/var/lib/logproc/out.ndjson", "chunkSize": 50},
        "notificationTag": "prod"
    }"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_load_config() {
        let f = write_config(CONFIG);
        let config = load_config(f.path()).unwrap();
        let tail = config.tail_conf().unwrap();
        assert_eq!(tail.interval_secs, 5);
        assert_eq!(tail.files.len(), 2);
        assert_eq!(config.sink.kind, SinkKind::Ndjson);
        assert_eq!(config.sink.chunk_size, 50);
        assert_eq!(config.anonymous_users, vec![0, 1]);

        let f = &tail.files[1];
        let settings = config.transformer_settings(f.tz_shift_min, f.buffer.as_ref());
        assert_eq!(settings.buffer.unwrap().history_lookup_items, 200);
        assert!(matches!(config.batch_conf(), Err(Error::Config(_))));
    }

    #[test]
    fn test_batch_only_config() {
        let config: AppConfig = serde_json::from_str(
            r#"{"logFiles": {"srcPath": "/var/log/mapka", "worklogPath": "/w/batch.json",
                "appType": "mapka", "version": "3", "tzShiftMin": 60}}"#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        let batch = config.batch_conf().unwrap();
        assert_eq!(batch.tz_shift_min, 60);
        assert_eq!(batch.max_line_size, 64 * 1024);
        assert!(!batch.partially_matching_files);
        assert!(matches!(config.tail_conf(), Err(Error::Config(_))));

        let empty: AppConfig = serde_json::from_str("{}").unwrap();
        assert!(matches!(empty.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_sink_defaults_to_dry_run() {
        let config: AppConfig = serde_json::from_str(
            r#"{"logTail": {"worklogDir": "/w", "files": [
                {"path": "/a.log", "appType": "mapka", "version": "3"}]}}"#,
        )
        .unwrap();
        assert_eq!(config.sink, SinkConf::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_configs() {
        let f = write_config(&CONFIG.replace("\"0.18\"", "\"0.9\""));
        assert!(matches!(load_config(f.path()), Err(Error::Config(_))));

        let f = write_config(&CONFIG.replace(r#""path": "/var/lib/logproc/out.ndjson", "#, ""));
        assert!(matches!(load_config(f.path()), Err(Error::Config(_))));

        let f = write_config("{not json");
        assert!(matches!(load_config(f.path()), Err(Error::Config(_))));

        assert!(matches!(
            load_config(Path::new("/nonexistent/logproc.json")),
            Err(Error::Config(_))
        ));
    }
}
