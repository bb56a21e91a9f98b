// SPDX-License-Identifier: Apache-2.0

//! Application log records.
//!
//! Every supported application contributes a line parser, an input record
//! and an output record. They are wired together by [`factory`] into the
//! closed [`AppRecord`], [`LineParser`] and [`Transformer`] enums the tail
//! engine works with.

pub mod factory;
pub mod kontext;
pub mod mapka;

use std::net::IpAddr;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::worklog::FileRange;

pub use factory::{LineParser, Transformer, TransformerSettings, new_line_parser, new_transformer};

pub const APP_TYPE_KONTEXT: &str = "kontext";
pub const APP_TYPE_MAPKA: &str = "mapka";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessingError {
    /// A line we wanted to read but could not. Not fatal, the line is skipped.
    #[error("line {line_num}: {message}")]
    LineParsing { line_num: i64, message: String },

    #[error("transform error: {0}")]
    Transform(String),
}

impl ProcessingError {
    pub fn line_parsing(line_num: i64, message: impl Into<String>) -> Self {
        ProcessingError::LineParsing {
            line_num,
            message: message.into(),
        }
    }
}

/// What the tail engine, the buffer and the analyzer need to know about an
/// input record, regardless of the application that produced it.
pub trait InputRecord {
    fn time(&self) -> DateTime<Utc>;

    fn client_ip(&self) -> Option<IpAddr>;

    fn user_agent(&self) -> &str;

    /// Records that could not be read completely are passed on as ignored.
    fn is_processable(&self) -> bool;

    /// Key grouping records of one client in the log buffer.
    fn clustering_client_id(&self) -> String {
        clustering_id(self.client_ip(), self.user_agent())
    }

    /// Number of records represented by this one; 0 for ordinary records.
    fn cluster_size(&self) -> usize;

    fn set_cluster_size(&mut self, size: usize);

    /// Coarse description of what was requested. Records of different shapes
    /// are kept apart by the clustering.
    fn request_shape(&self) -> &str;
}

/// SHA-256 fingerprint of client IP and user agent.
pub fn clustering_id(ip: Option<IpAddr>, user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    if let Some(ip) = ip {
        hasher.update(ip.to_string().as_bytes());
    }
    hasher.update(b"#");
    hasher.update(user_agent.as_bytes());
    hex(&hasher.finalize())
}

/// Idempotent record id built from the given parts.
pub(crate) fn create_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p.as_bytes());
    }
    hex(&hasher.finalize())
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// RFC 3339 rendering of `time` shifted by `tz_shift_min` minutes.
pub(crate) fn format_datetime(time: DateTime<Utc>, tz_shift_min: i32) -> String {
    match FixedOffset::east_opt(tz_shift_min * 60) {
        Some(offset) => time.with_timezone(&offset).to_rfc3339(),
        None => time.to_rfc3339(),
    }
}

pub(crate) fn user_is_anonymous(user_id: Option<i64>, anonymous_users: &[i64]) -> bool {
    match user_id {
        None => true,
        Some(id) => anonymous_users.contains(&id),
    }
}

/// A parsed record of one of the supported applications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "app", rename_all = "camelCase")]
pub enum AppRecord {
    Kontext(kontext::InputRecord),
    Mapka(mapka::InputRecord),
}

impl InputRecord for AppRecord {
    fn time(&self) -> DateTime<Utc> {
        match self {
            AppRecord::Kontext(r) => r.time(),
            AppRecord::Mapka(r) => r.time(),
        }
    }

    fn client_ip(&self) -> Option<IpAddr> {
        match self {
            AppRecord::Kontext(r) => r.client_ip(),
            AppRecord::Mapka(r) => r.client_ip(),
        }
    }

    fn user_agent(&self) -> &str {
        match self {
            AppRecord::Kontext(r) => r.user_agent(),
            AppRecord::Mapka(r) => r.user_agent(),
        }
    }

    fn is_processable(&self) -> bool {
        match self {
            AppRecord::Kontext(r) => r.is_processable(),
            AppRecord::Mapka(r) => r.is_processable(),
        }
    }

    fn clustering_client_id(&self) -> String {
        match self {
            AppRecord::Kontext(r) => r.clustering_client_id(),
            AppRecord::Mapka(r) => r.clustering_client_id(),
        }
    }

    fn cluster_size(&self) -> usize {
        match self {
            AppRecord::Kontext(r) => r.cluster_size(),
            AppRecord::Mapka(r) => r.cluster_size(),
        }
    }

    fn set_cluster_size(&mut self, size: usize) {
        match self {
            AppRecord::Kontext(r) => r.set_cluster_size(size),
            AppRecord::Mapka(r) => r.set_cluster_size(size),
        }
    }

    fn request_shape(&self) -> &str {
        match self {
            AppRecord::Kontext(r) => r.request_shape(),
            AppRecord::Mapka(r) => r.request_shape(),
        }
    }
}

/// Record ready to be written to a store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutputRecord {
    Kontext(kontext::OutputRecord),
    Mapka(mapka::OutputRecord),
}

impl OutputRecord {
    pub fn id(&self) -> &str {
        match self {
            OutputRecord::Kontext(r) => &r.id,
            OutputRecord::Mapka(r) => &r.id,
        }
    }

    pub fn app_type(&self) -> &str {
        match self {
            OutputRecord::Kontext(r) => &r.rec_type,
            OutputRecord::Mapka(r) => &r.rec_type,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            OutputRecord::Kontext(r) => r.time,
            OutputRecord::Mapka(r) => r.time,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Output record together with the file and byte span it came from, so the
/// sink's confirmation can be mapped back onto the worklog.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundOutputRecord {
    pub path: String,
    pub span: FileRange,
    pub record: OutputRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clustering_id_is_stable_and_distinguishes_clients() {
        let ip: Option<IpAddr> = "192.168.1.10".parse().ok();
        let a = clustering_id(ip, "Mozilla/5.0");
        assert_eq!(a, clustering_id(ip, "Mozilla/5.0"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, clustering_id(ip, "curl/8.0"));
        assert_ne!(a, clustering_id("192.168.1.11".parse().ok(), "Mozilla/5.0"));
    }

    #[test]
    fn test_format_datetime_shift() {
        let t = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_datetime(t, 0), "2024-03-01T10:00:00+00:00");
        assert_eq!(format_datetime(t, 60), "2024-03-01T11:00:00+01:00");
        assert_eq!(format_datetime(t, -90), "2024-03-01T08:30:00-01:30");
    }

    #[test]
    fn test_anonymous_users() {
        assert!(user_is_anonymous(None, &[]));
        assert!(user_is_anonymous(Some(0), &[0, 1]));
        assert!(!user_is_anonymous(Some(42), &[0, 1]));
    }
}
