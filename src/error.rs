// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Worklog error: {0}")]
    Worklog(String),

    #[error("Buffer state error: {0}")]
    BufferState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Channel send error")]
    ChannelSend,
}

pub type Result<T> = std::result::Result<T, Error>;
