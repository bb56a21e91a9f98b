// SPDX-License-Identifier: Apache-2.0

use clap::{Args, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Args, Clone)]
pub struct TailArgs {
    /// JSON configuration file
    #[arg(long, env = "LOGPROC_CONFIG")]
    pub config: PathBuf,

    /// Truncate the worklog and skip restoring buffer state, so every
    /// watched file is processed from the beginning
    #[arg(long, env = "LOGPROC_WORKLOG_RESET", default_value = "false")]
    pub worklog_reset: bool,

    /// Print records to stdout instead of writing them to the configured sink
    #[arg(long, env = "LOGPROC_DRY_RUN", default_value = "false")]
    pub dry_run: bool,
}

#[derive(Debug, Args, Clone)]
pub struct BatchArgs {
    /// JSON configuration file
    #[arg(long, env = "LOGPROC_CONFIG")]
    pub config: PathBuf,

    /// Forget the last processed record, so the whole source is processed
    #[arg(long, env = "LOGPROC_WORKLOG_RESET", default_value = "false")]
    pub worklog_reset: bool,

    /// Print records to stdout instead of writing them to the configured sink
    #[arg(long, env = "LOGPROC_DRY_RUN", default_value = "false")]
    pub dry_run: bool,

    /// Skip records older than this (UNIX timestamp or RFC 3339)
    #[arg(long)]
    pub from: Option<String>,

    /// Skip records newer than this (UNIX timestamp or RFC 3339)
    #[arg(long)]
    pub to: Option<String>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}
