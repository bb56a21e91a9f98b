// SPDX-License-Identifier: Apache-2.0

//! KonText 0.18 query log: one JSON document per line.
//!
//! ```text
//! {"date": "2024-03-01T10:00:00.120Z", "user_id": 12, "proc_time": 0.31,
//!  "action": "query_submit", "is_api": false,
//!  "request": {"HTTP_X_FORWARDED_FOR": "10.0.0.5", "HTTP_USER_AGENT": "Mozilla/5.0"},
//!  "args": {"corpname": "syn2020", "corpora": ["syn2020", "intercorp_en"]}}
//! ```

use std::net::IpAddr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ProcessingError, create_id, format_datetime, user_is_anonymous};
use crate::logbuffer::{BufferConf, LogBuffer};
use crate::servicelog::{AppRecord, InputRecord as _};

/// Actions counted as queries.
const QUERY_ACTIONS: &[&str] = &[
    "query_submit",
    "create_view",
    "create_lazy_view",
    "wordlist/submit",
];

const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

#[derive(Debug, Default, Deserialize)]
struct RawRequest {
    #[serde(rename = "HTTP_X_FORWARDED_FOR", default)]
    forwarded_for: String,
    #[serde(rename = "HTTP_USER_AGENT", default)]
    user_agent: String,
    #[serde(rename = "HTTP_REMOTE_ADDR", default)]
    http_remote_addr: String,
    #[serde(rename = "REMOTE_ADDR", default)]
    remote_addr: String,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    date: String,
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    proc_time: f64,
    #[serde(default)]
    action: String,
    #[serde(default)]
    is_indirect_call: bool,
    #[serde(default)]
    is_api: bool,
    #[serde(default)]
    request: RawRequest,
    #[serde(default)]
    args: Map<String, Value>,
}

/// Dates come either as RFC 3339 or as naive timestamps assumed to be UTC.
fn parse_date(date: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(date) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(date, fmt).ok())
        .map(|dt| dt.and_utc())
}

/// First address of a possibly comma separated header value.
fn parse_ip(value: &str) -> Option<IpAddr> {
    value.split(',').next()?.trim().parse().ok()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRecord {
    pub time: DateTime<Utc>,
    pub user_id: Option<i64>,
    pub proc_time: f64,
    pub action: String,
    pub is_indirect_call: bool,
    pub is_api: bool,
    pub client_ip: Option<IpAddr>,
    pub user_agent: String,
    pub args: Map<String, Value>,
    pub processable: bool,
    #[serde(default)]
    pub cluster_size: usize,
}

impl InputRecord {
    /// String argument; nested keys are followed level by level.
    pub fn string_arg(&self, names: &[&str]) -> Option<&str> {
        let (last, path) = names.split_last()?;
        let mut current = &self.args;
        for name in path {
            current = current.get(*name)?.as_object()?;
        }
        current.get(*last)?.as_str()
    }

    /// Corpora aligned with the main one (all but the first in `corpora`).
    pub fn aligned_corpora(&self) -> Vec<String> {
        match self.args.get("corpora").and_then(Value::as_array) {
            Some(items) => items
                .iter()
                .skip(1)
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn is_query(&self) -> bool {
        QUERY_ACTIONS.contains(&self.action.as_str())
    }
}

impl super::InputRecord for InputRecord {
    fn time(&self) -> DateTime<Utc> {
        self.time
    }

    fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    fn user_agent(&self) -> &str {
        &self.user_agent
    }

    fn is_processable(&self) -> bool {
        self.processable
    }

    fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    fn set_cluster_size(&mut self, size: usize) {
        self.cluster_size = size;
    }

    fn request_shape(&self) -> &str {
        &self.action
    }
}

#[derive(Debug, Default)]
pub struct LineParser;

impl LineParser {
    pub fn parse_line(&self, line: &str, line_num: i64) -> Result<InputRecord, ProcessingError> {
        let raw: RawRecord = serde_json::from_str(line)
            .map_err(|e| ProcessingError::line_parsing(line_num, e.to_string()))?;

        let parsed_time = parse_date(&raw.date);
        let client_ip = [
            &raw.request.forwarded_for,
            &raw.request.http_remote_addr,
            &raw.request.remote_addr,
        ]
        .into_iter()
        .find(|v| !v.is_empty())
        .and_then(|v| parse_ip(v));

        Ok(InputRecord {
            time: parsed_time.unwrap_or(DateTime::UNIX_EPOCH),
            user_id: raw.user_id,
            proc_time: raw.proc_time,
            action: raw.action,
            is_indirect_call: raw.is_indirect_call,
            is_api: raw.is_api,
            client_ip,
            user_agent: raw.request.user_agent,
            args: raw.args,
            processable: parsed_time.is_some(),
            cluster_size: 0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub rec_type: String,
    pub action: String,
    pub corpus: Option<String>,
    pub aligned_corpora: Vec<String>,
    pub datetime: String,
    #[serde(skip)]
    pub time: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: String,
    pub user_id: Option<i64>,
    pub is_anonymous: bool,
    pub is_query: bool,
    pub is_api: bool,
    pub is_indirect_call: bool,
    pub proc_time: f64,
}

pub struct Transformer {
    pub(crate) app_type: String,
    pub(crate) tz_shift_min: i32,
    pub(crate) anonymous_users: Vec<i64>,
    pub(crate) buffer_conf: Option<BufferConf>,
}

impl Transformer {
    pub fn transform(&self, rec: &InputRecord) -> Result<OutputRecord, ProcessingError> {
        if !rec.processable {
            return Err(ProcessingError::Transform(
                "record without a valid date".to_string(),
            ));
        }
        let datetime = format_datetime(rec.time, self.tz_shift_min);
        let ip_address = rec.client_ip.map(|ip| ip.to_string());
        let user = rec.user_id.map(|u| u.to_string()).unwrap_or_default();
        let id = create_id(&[
            &self.app_type,
            &rec.action,
            &datetime,
            ip_address.as_deref().unwrap_or(""),
            &user,
            &rec.proc_time.to_string(),
        ]);

        Ok(OutputRecord {
            id,
            rec_type: self.app_type.clone(),
            action: rec.action.clone(),
            corpus: rec.string_arg(&["corpname"]).map(str::to_string),
            aligned_corpora: rec.aligned_corpora(),
            datetime,
            time: rec.time,
            ip_address,
            user_agent: rec.user_agent.clone(),
            user_id: rec.user_id,
            is_anonymous: user_is_anonymous(rec.user_id, &self.anonymous_users),
            is_query: rec.is_query(),
            is_api: rec.is_api,
            is_indirect_call: rec.is_indirect_call,
            proc_time: rec.proc_time,
        })
    }

    /// Query records take part in the windowed analysis (bot sampling); the
    /// rest pass through untouched.
    pub fn preprocess(&self, rec: AppRecord, buffer: &LogBuffer<AppRecord>) -> Vec<AppRecord> {
        let is_query = matches!(&rec, AppRecord::Kontext(r) if r.is_query());
        match &self.buffer_conf {
            Some(conf) if is_query && rec.is_processable() => {
                crate::analysis::windowed_preprocess(rec, buffer, conf)
            }
            _ => vec![rec],
        }
    }

    pub fn history_lookup_items(&self) -> usize {
        self.buffer_conf
            .as_ref()
            .map(|c| c.history_lookup_items)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = r#"{"logger": "QUERY", "level": "INFO", "date": "2024-03-01T10:00:00.120Z", "user_id": 12, "proc_time": 0.31, "action": "query_submit", "is_indirect_call": false, "is_api": true, "request": {"HTTP_X_FORWARDED_FOR": "10.0.0.5, 172.16.0.1", "HTTP_USER_AGENT": "Mozilla/5.0", "REMOTE_ADDR": "127.0.0.1"}, "args": {"corpname": "syn2020", "corpora": ["syn2020", "intercorp_en"], "q": {"form": "hrad"}}}"#;

    fn transformer() -> Transformer {
        Transformer {
            app_type: "kontext".to_string(),
            tz_shift_min: 60,
            anonymous_users: vec![0, 1],
            buffer_conf: None,
        }
    }

    #[test]
    fn test_parse_line() {
        let rec = LineParser.parse_line(LINE, 3).unwrap();
        assert!(rec.is_processable());
        assert_eq!(rec.client_ip, "10.0.0.5".parse().ok());
        assert_eq!(rec.user_agent(), "Mozilla/5.0");
        assert_eq!(rec.request_shape(), "query_submit");
        assert_eq!(rec.time().timestamp_millis(), 1709287200120);
        assert_eq!(rec.string_arg(&["q", "form"]), Some("hrad"));
        assert_eq!(rec.aligned_corpora(), vec!["intercorp_en".to_string()]);
    }

    #[test]
    fn test_ip_fallback_order() {
        let line = r#"{"date": "2024-03-01 10:00:00.0", "action": "view", "request": {"HTTP_REMOTE_ADDR": "10.1.1.1", "REMOTE_ADDR": "127.0.0.1"}}"#;
        let rec = LineParser.parse_line(line, 1).unwrap();
        assert_eq!(rec.client_ip, "10.1.1.1".parse().ok());

        let line = r#"{"date": "2024-03-01 10:00:00.0", "action": "view", "request": {"REMOTE_ADDR": "127.0.0.1"}}"#;
        let rec = LineParser.parse_line(line, 1).unwrap();
        assert_eq!(rec.client_ip, "127.0.0.1".parse().ok());
    }

    #[test]
    fn test_bad_date_is_not_processable() {
        let line = r#"{"date": "yesterday", "action": "view"}"#;
        let rec = LineParser.parse_line(line, 1).unwrap();
        assert!(!rec.is_processable());
        assert!(transformer().transform(&rec).is_err());
    }

    #[test]
    fn test_invalid_json_is_line_error() {
        let err = LineParser.parse_line("{not json", 7).unwrap_err();
        assert!(matches!(err, ProcessingError::LineParsing { line_num: 7, .. }));
    }

    #[test]
    fn test_transform() {
        let rec = LineParser.parse_line(LINE, 3).unwrap();
        let out = transformer().transform(&rec).unwrap();
        assert_eq!(out.rec_type, "kontext");
        assert_eq!(out.datetime, "2024-03-01T11:00:00.120+01:00");
        assert_eq!(out.corpus.as_deref(), Some("syn2020"));
        assert!(out.is_query);
        assert!(out.is_api);
        assert!(!out.is_anonymous);
        assert_eq!(out.ip_address.as_deref(), Some("10.0.0.5"));

        // same input, same id
        let again = transformer().transform(&rec).unwrap();
        assert_eq!(out.id, again.id);
    }

    #[test]
    fn test_output_json_shape() {
        let rec = LineParser.parse_line(LINE, 3).unwrap();
        let out = transformer().transform(&rec).unwrap();
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["type"], "kontext");
        assert_eq!(json["userId"], 12);
        assert!(json.get("time").is_none());
    }
}
