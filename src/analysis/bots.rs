// SPDX-License-Identifier: Apache-2.0

//! Request-frequency bot heuristic.
//!
//! Every analysis window contributes its request count to a reservoir
//! sample. A client whose window count sits more than `threshold_sigma`
//! standard deviations above the sampled mean gets its suspicion counter
//! incremented.

use chrono::{DateTime, Utc};
use std::net::IpAddr;
use tracing::{debug, info};

use crate::logbuffer::{BotDetectionConf, BotState, SuspicionInfo};

/// One window of a single client.
pub struct WindowSample<'a> {
    pub client_id: &'a str,
    pub client_ip: Option<IpAddr>,
    pub user_agent: &'a str,
    pub num_requests: usize,
    pub time: DateTime<Utc>,
}

/// Judge `window` against the sampled history, then add it to the history.
/// Returns whether the client was flagged.
pub fn sample_window(state: &BotState, conf: &BotDetectionConf, window: WindowSample<'_>) -> bool {
    let count = window.num_requests as f64;
    let suspicious = state.with_sample(|sample| {
        let verdict = sample.len() >= conf.min_samples.max(1)
            && window.num_requests >= conf.min_requests
            && count > sample.mean() + conf.threshold_sigma * sample.stddev();
        sample.add(count);
        verdict
    });

    if suspicious {
        let mut entry = state
            .suspicions()
            .entry(window.client_id.to_string())
            .or_insert_with(|| SuspicionInfo {
                client_ip: window.client_ip,
                user_agent: window.user_agent.to_string(),
                count: 0,
                last_window_requests: 0,
                last_seen: window.time,
            });
        entry.count += 1;
        entry.last_window_requests = window.num_requests;
        entry.last_seen = window.time;
        debug!(
            client_ip = ?window.client_ip,
            user_agent = window.user_agent,
            requests = window.num_requests,
            count = entry.count,
            "Client request rate looks automated"
        );
    }
    suspicious
}

#[derive(Debug, Clone, PartialEq)]
pub struct BotCandidate {
    pub client_id: String,
    pub info: SuspicionInfo,
}

/// Flagged clients, most often flagged first.
pub fn report(state: &BotState) -> Vec<BotCandidate> {
    let mut ans: Vec<BotCandidate> = state
        .suspicions()
        .iter()
        .map(|e| BotCandidate {
            client_id: e.key().clone(),
            info: e.value().clone(),
        })
        .collect();
    ans.sort_by(|a, b| {
        b.info
            .count
            .cmp(&a.info.count)
            .then_with(|| a.client_id.cmp(&b.client_id))
    });
    ans
}

/// Log the report of a buffer.
pub fn log_report(buffer_id: &str, state: &BotState) {
    let candidates = report(state);
    if candidates.is_empty() {
        return;
    }
    info!(buffer = buffer_id, num_candidates = candidates.len(), "Bot detection report");
    for c in candidates.iter().take(20) {
        info!(
            buffer = buffer_id,
            client_ip = ?c.info.client_ip,
            user_agent = %c.info.user_agent,
            suspicion_count = c.info.count,
            last_window_requests = c.info.last_window_requests,
            last_seen = %c.info.last_seen,
            "Bot candidate"
        );
    }
}
