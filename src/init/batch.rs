// SPDX-License-Identifier: Apache-2.0

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::batch::{BatchReport, BatchRunner, DatetimeRange};
use crate::error::Result;
use crate::init::agent::new_sink;
use crate::init::config::AppConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    pub worklog_reset: bool,
    pub dry_run: bool,
    pub range: DatetimeRange,
}

/// Process the `logFiles` source of `config` once.
pub async fn run_batch(
    config: &AppConfig,
    options: BatchOptions,
    cancel: CancellationToken,
) -> Result<BatchReport> {
    let conf = config.batch_conf()?;
    if options.range != DatetimeRange::default() {
        info!(from = ?options.range.from, to = ?options.range.to, "Limiting processed time range");
    }
    let runner = BatchRunner::new(
        conf.clone(),
        config.transformer_settings(conf.tz_shift_min, conf.buffer.as_ref()),
        new_sink(&config.sink, options.dry_run),
        config.sink.chunk_size,
        options.range,
        options.worklog_reset,
    )?;
    runner.run(cancel).await
}
