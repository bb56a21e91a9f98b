// SPDX-License-Identifier: Apache-2.0

//! Windowed analysis of buffered client history: clustering of request
//! bursts and the bot heuristic.

pub mod bots;
pub mod clustering;

use tracing::debug;

use crate::logbuffer::{BufferConf, LogBuffer};
use crate::servicelog::InputRecord;

/// Analysis step shared by transformers that work with a buffer.
///
/// Once per `analysis_interval` per client the retained records of that
/// client (earlier cluster representatives excluded) are analyzed. When
/// clusters are found, the analyzed records are dropped from the buffer and
/// the cluster representatives replace `rec`. Otherwise `rec` passes through.
pub fn windowed_preprocess<R>(rec: R, buffer: &LogBuffer<R>, conf: &BufferConf) -> Vec<R>
where
    R: InputRecord + Clone,
{
    let key = rec.clustering_client_id();
    let due = match buffer.last_check(&key) {
        None => true,
        Some(last) => rec.time() - last > conf.analysis_interval(),
    };
    if !due {
        return vec![rec];
    }

    let mut items = Vec::with_capacity(buffer.num_of_records(&key));
    buffer.for_each(&key, |r| {
        if r.cluster_size() == 0 {
            items.push(r.clone());
        }
    });
    if items.is_empty() {
        return vec![rec];
    }

    if let (Some(state), Some(bot_conf)) = (buffer.bot_state(), conf.bot_detection.as_ref()) {
        bots::sample_window(
            state,
            bot_conf,
            bots::WindowSample {
                client_id: &key,
                client_ip: rec.client_ip(),
                user_agent: rec.user_agent(),
                num_requests: items.len(),
                time: rec.time(),
            },
        );
    }

    if let Some(db) = &conf.clustering_db_scan {
        let num_analyzed = items.len();
        let representatives = clustering::analyze(items, db.min_density, db.epsilon);
        debug!(
            buffer = buffer.id(),
            min_density = db.min_density,
            epsilon = db.epsilon,
            num_analyzed,
            found_clusters = representatives.len(),
            "Log clustering"
        );
        if !representatives.is_empty() {
            buffer.remove_analyzed_records(&key, rec.time());
            buffer.confirm_record_check(&rec);
            return representatives;
        }
    }

    buffer.confirm_record_check(&rec);
    vec![rec]
}
