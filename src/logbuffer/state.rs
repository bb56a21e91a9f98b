// SPDX-License-Identifier: Apache-2.0

use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::{BotDetectionConf, ReservoirSample};

/// Buffer-internal analysis state, persisted along with the buffered records.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AnalysisState {
    #[default]
    Simple,
    BotAnalysis(BotState),
}

impl AnalysisState {
    pub fn for_conf(conf: Option<&BotDetectionConf>) -> Self {
        match conf {
            Some(c) => AnalysisState::BotAnalysis(BotState::new(c.prev_num_reqs_sample_size)),
            None => AnalysisState::Simple,
        }
    }

    pub fn bot_state(&self) -> Option<&BotState> {
        match self {
            AnalysisState::BotAnalysis(s) => Some(s),
            AnalysisState::Simple => None,
        }
    }
}

/// What is known about a client that looked like a bot at least once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspicionInfo {
    pub client_ip: Option<IpAddr>,
    pub user_agent: String,
    pub count: u32,
    pub last_window_requests: usize,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotState {
    prev_nums: Mutex<ReservoirSample>,
    suspicions: DashMap<String, SuspicionInfo>,
}

impl BotState {
    pub fn new(sample_size: usize) -> Self {
        Self {
            prev_nums: Mutex::new(ReservoirSample::new(sample_size)),
            suspicions: DashMap::new(),
        }
    }

    /// Run `f` with exclusive access to the request count reservoir.
    pub fn with_sample<T>(&self, f: impl FnOnce(&mut ReservoirSample) -> T) -> T {
        let mut sample = self.prev_nums.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut sample)
    }

    pub fn suspicions(&self) -> &DashMap<String, SuspicionInfo> {
        &self.suspicions
    }
}
