// SPDX-License-Identifier: Apache-2.0

//! Mapka 3 access log: combined format with an optional processing time.
//!
//! ```text
//! 195.113.53.123 - johndoe [16/Sep/2019:08:24:05 +0200] "GET /map/tiles?z=3 HTTP/2.0" 200 332 "https://example.org/" "Mozilla/5.0" rt=0.012
//! ```

use std::net::IpAddr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{ProcessingError, create_id, format_datetime};
use crate::error::Error;
use crate::logbuffer::{BufferConf, LogBuffer};
use crate::servicelog::AppRecord;

/// Access log time format.
pub const TIME_LOCAL_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

pub const ACCESS_LOG_PATTERN: &str = r#"^(?P<remote_addr>\S+) \S+ (?P<remote_user>\S+) \[(?P<time_local>[^\]]+)\] "(?P<request>[^"]*)" (?P<status>\d+) (?P<body_bytes_sent>\d+|-) "(?P<http_referer>[^"]*)" "(?P<http_user_agent>[^"]*)"(?:\s+rt="?(?P<rt>[0-9.]+)"?)?\s*$"#;

static ACCESS_LOG_REGEX: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(ACCESS_LOG_PATTERN));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRecord {
    pub time: DateTime<Utc>,
    pub client_ip: Option<IpAddr>,
    pub user_id: Option<String>,
    pub method: String,
    pub path: String,
    pub query: String,
    pub status: u16,
    pub referrer: String,
    pub user_agent: String,
    pub proc_time: Option<f64>,
    #[serde(default)]
    pub cluster_size: usize,
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
        true
    }

    fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    fn set_cluster_size(&mut self, size: usize) {
        self.cluster_size = size;
    }

    fn request_shape(&self) -> &str {
        &self.path
    }
}

pub struct LineParser {
    regex: &'static Regex,
}

impl LineParser {
    pub fn new() -> crate::error::Result<Self> {
        match &*ACCESS_LOG_REGEX {
            Ok(regex) => Ok(Self { regex }),
            Err(e) => Err(Error::Config(format!("invalid access log pattern: {}", e))),
        }
    }

    pub fn parse_line(&self, line: &str, line_num: i64) -> Result<InputRecord, ProcessingError> {
        let caps = self
            .regex
            .captures(line)
            .ok_or_else(|| ProcessingError::line_parsing(line_num, "not an access log line"))?;
        let field = |name: &str| caps.name(name).map(|m| m.as_str()).unwrap_or("");

        let time = DateTime::parse_from_str(field("time_local"), TIME_LOCAL_FORMAT)
            .map_err(|e| ProcessingError::line_parsing(line_num, format!("invalid time: {}", e)))?
            .with_timezone(&Utc);

        let mut request = field("request").split_whitespace();
        let (method, url) = match (request.next(), request.next(), request.next()) {
            (Some(method), Some(url), Some(_version)) => (method, url),
            _ => ("", ""),
        };
        let (path, query) = url.split_once('?').unwrap_or((url, ""));

        let proc_time = match caps.name("rt") {
            Some(rt) => Some(rt.as_str().parse::<f64>().map_err(|e| {
                ProcessingError::line_parsing(line_num, format!("invalid proc. time: {}", e))
            })?),
            None => None,
        };

        let user = field("remote_user");
        Ok(InputRecord {
            time,
            client_ip: field("remote_addr").parse().ok(),
            user_id: (user != "-" && !user.is_empty()).then(|| user.to_string()),
            method: method.to_string(),
            path: path.to_string(),
            query: query.to_string(),
            status: field("status").parse().unwrap_or(0),
            referrer: field("http_referer").to_string(),
            user_agent: field("http_user_agent").to_string(),
            proc_time,
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
    pub path: String,
    pub datetime: String,
    #[serde(skip)]
    pub time: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: String,
    pub user_id: Option<String>,
    pub is_anonymous: bool,
    pub is_query: bool,
    pub cluster_size: usize,
    pub proc_time: Option<f64>,
}

pub struct Transformer {
    pub(crate) app_type: String,
    pub(crate) tz_shift_min: i32,
    pub(crate) anonymous_users: Vec<i64>,
    pub(crate) buffer_conf: Option<BufferConf>,
}

impl Transformer {
    pub fn transform(&self, rec: &InputRecord) -> Result<OutputRecord, ProcessingError> {
        let datetime = format_datetime(rec.time, self.tz_shift_min);
        let ip_address = rec.client_ip.map(|ip| ip.to_string());
        let user_id = rec.user_id.clone();
        let is_anonymous = match &user_id {
            None => true,
            Some(u) => u
                .parse::<i64>()
                .map(|id| self.anonymous_users.contains(&id))
                .unwrap_or(false),
        };
        let id = create_id(&[
            &self.app_type,
            &rec.path,
            &datetime,
            ip_address.as_deref().unwrap_or(""),
            user_id.as_deref().unwrap_or(""),
        ]);

        Ok(OutputRecord {
            id,
            rec_type: self.app_type.clone(),
            action: "interaction".to_string(),
            path: rec.path.clone(),
            datetime,
            time: rec.time,
            ip_address,
            user_agent: rec.user_agent.clone(),
            user_id,
            is_anonymous,
            is_query: rec.cluster_size > 0,
            cluster_size: rec.cluster_size,
            proc_time: rec.proc_time,
        })
    }

    /// Bursts of interactions of one client collapse into cluster
    /// representatives.
    pub fn preprocess(&self, rec: AppRecord, buffer: &LogBuffer<AppRecord>) -> Vec<AppRecord> {
        match &self.buffer_conf {
            Some(conf) => crate::analysis::windowed_preprocess(rec, buffer, conf),
            None => vec![rec],
        }
    }

    pub fn history_lookup_items(&self) -> usize {
        self.buffer_conf
            .as_ref()
            .map(|c| c.history_lookup_items)
            .unwrap_or(0)
    }
}
