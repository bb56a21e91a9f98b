// SPDX-License-Identifier: Apache-2.0

//! Bounded per-client history of recent records, shared between the
//! transformers of files configured with the same buffer id.

mod sample;
mod state;
mod storage;

use serde::Deserialize;

use crate::error::{Error, Result};

pub use sample::ReservoirSample;
pub use state::{AnalysisState, BotState, SuspicionInfo};
pub use storage::{LogBuffer, buffer_id, state_file_path};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbScanConf {
    pub min_density: usize,
    pub epsilon: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotDetectionConf {
    /// Number of per-window request counts kept in the reservoir
    pub prev_num_reqs_sample_size: usize,
    /// How many standard deviations above the mean count as suspicious
    pub threshold_sigma: f64,
    /// Reservoir size needed before any verdict is made
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Windows with fewer requests are never suspicious
    #[serde(default = "default_min_requests")]
    pub min_requests: usize,
}

fn default_min_samples() -> usize {
    10
}

fn default_min_requests() -> usize {
    5
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferConf {
    /// Files configured with the same id share one buffer
    #[serde(default)]
    pub id: Option<String>,
    pub history_lookup_items: usize,
    #[serde(default)]
    pub analysis_interval_secs: u64,
    #[serde(default)]
    pub max_idle_secs: Option<u64>,
    #[serde(default)]
    pub clustering_db_scan: Option<DbScanConf>,
    #[serde(default)]
    pub bot_detection: Option<BotDetectionConf>,
}

impl BufferConf {
    pub fn analysis_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.analysis_interval_secs as i64)
    }

    /// `owner` names the configured file or source in the error.
    pub fn validate(&self, owner: &str) -> Result<()> {
        if let Some(db) = &self.clustering_db_scan {
            if db.min_density == 0 || db.epsilon <= 0.0 {
                return Err(Error::Config(format!(
                    "{}: clusteringDbScan needs positive minDensity and epsilon",
                    owner
                )));
            }
        }
        if self.bot_detection.is_some() && self.history_lookup_items == 0 {
            return Err(Error::Config(format!(
                "{}: botDetection requires historyLookupItems",
                owner
            )));
        }
        Ok(())
    }
}
