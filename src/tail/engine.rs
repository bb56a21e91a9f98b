// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::select;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, error, info, warn};

use crate::analysis::bots;
use crate::error::{Error, Result};
use crate::fsop::FileProps;
use crate::logbuffer::LogBuffer;
use crate::servicelog::AppRecord;
use crate::tail::processor::{ConfirmSummary, TailProcessor};
use crate::tail::reader::{self, LineSpan};
use crate::worklog::FileRange;

#[derive(Debug, Clone)]
pub struct TailSettings {
    pub interval: Duration,
    pub max_lines_per_check: usize,
    pub max_line_size: usize,
    /// Buffer keys idle for longer are dropped after each poll
    pub max_idle: Option<chrono::Duration>,
}

/// How the start offset of a poll was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartKind {
    /// Where the previous poll of this process ended
    Continue,
    /// From the worklog
    Resume,
    /// Unknown file, or a new file at the path
    New,
    /// Same file, but shorter than the known offset
    Truncated,
}

/// Start offset for a file with `props`. The in-memory `position`
/// (identity, offset) takes precedence over the worklog `ledger` range.
pub fn start_offset(
    props: FileProps,
    position: Option<(i64, i64)>,
    ledger: FileRange,
) -> (i64, StartKind) {
    let (offset, kind) = match position {
        Some((identity, offset)) if identity == props.identity => (offset, StartKind::Continue),
        _ if !ledger.is_unknown() && ledger.identity == props.identity => {
            (ledger.resume_offset(), StartKind::Resume)
        }
        _ => (0, StartKind::New),
    };
    if offset > props.size {
        (0, StartKind::Truncated)
    } else {
        (offset, kind)
    }
}

/// Result of one poll that read at least one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub identity: i64,
    pub start: i64,
    pub end: i64,
    pub num_lines: usize,
    pub summary: ConfirmSummary,
}

struct PollInput {
    props: FileProps,
    start: i64,
    kind: StartKind,
    lines: Vec<LineSpan>,
}

fn read_new_lines(
    path: &str,
    position: Option<(i64, i64)>,
    ledger: FileRange,
    settings: &TailSettings,
) -> Result<PollInput> {
    let mut file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::FileNotFound(PathBuf::from(path)),
        _ => Error::Io(e),
    })?;
    let props = FileProps::from_file(&file)?;
    let (start, kind) = start_offset(props, position, ledger);
    let lines = reader::read_lines(
        &mut file,
        start,
        settings.max_lines_per_check,
        settings.max_line_size,
    )?;
    Ok(PollInput {
        props,
        start,
        kind,
        lines,
    })
}

/// Polls one file.
pub struct FileTailer {
    processor: TailProcessor,
    settings: TailSettings,
    position: Option<(i64, i64)>,
    lines_read: i64,
    cancel: CancellationToken,
}

impl FileTailer {
    pub fn new(processor: TailProcessor, settings: TailSettings) -> Self {
        Self {
            processor,
            settings,
            position: None,
            lines_read: 0,
            cancel: CancellationToken::new(),
        }
    }

    pub fn path(&self) -> &str {
        self.processor.path()
    }

    pub fn buffer(&self) -> &Arc<LogBuffer<AppRecord>> {
        self.processor.buffer()
    }

    /// Read what was appended since the last poll and process it. Returns
    /// `None` when there was nothing new.
    pub async fn check(&mut self) -> Result<Option<PollReport>> {
        let path = self.processor.path();
        let input = {
            let path = path.to_string();
            let position = self.position;
            let ledger = self.processor.worklog().get_range(&path);
            let settings = self.settings.clone();
            tokio::task::spawn_blocking(move || read_new_lines(&path, position, ledger, &settings))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))??
        };
        let identity = input.props.identity;

        match input.kind {
            StartKind::Truncated => {
                warn!(path, identity, size = input.props.size, "File truncated, reading from the beginning")
            }
            StartKind::New if self.position.is_some() => {
                info!(path, identity, "File replaced, reading the new one from the beginning")
            }
            StartKind::Resume => {
                info!(path, identity, offset = input.start, "Resuming from the worklog")
            }
            _ => {}
        }

        let Some(last) = input.lines.last() else {
            self.position = Some((identity, input.start));
            return Ok(None);
        };
        let start = input.start;
        let end = last.end;

        // pin the resume point until the whole poll is confirmed
        self.processor
            .worklog()
            .request_update(path, FileRange::unconfirmed(identity, start, end))
            .await?;

        let session = self.processor.on_check_start(identity, start, &self.cancel);
        let mut dispatched = 0;
        for line in &input.lines {
            self.lines_read += 1;
            if let Err(e) = self
                .processor
                .on_entry(&session, line, self.lines_read, identity)
                .await
            {
                warn!(path, error = %e, offset = line.start, "Dispatch stopped");
                break;
            }
            dispatched += 1;
        }
        let summary = self.processor.on_check_stop(session).await;

        if !summary.all_ok() {
            warn!(
                path,
                start = summary.confirmed_end,
                end,
                failed = summary.failed,
                "Some records were not written, the range stays unconfirmed"
            );
            // keeps later polls from moving the worklog past the failed chunk
            self.processor
                .worklog()
                .request_update(
                    path,
                    FileRange::unconfirmed(identity, summary.confirmed_end, end),
                )
                .await?;
        }
        if dispatched == input.lines.len() {
            self.position = Some((identity, end));
        } else {
            self.lines_read -= (input.lines.len() - dispatched) as i64;
            self.position = Some((identity, summary.confirmed_end));
        }

        if let Some(max_idle) = self.settings.max_idle {
            let pruned = self.processor.buffer().prune_idle_keys(Utc::now(), max_idle);
            if pruned > 0 {
                debug!(path, pruned, "Dropped idle buffer keys");
            }
        }

        debug!(path, start, end, num_lines = input.lines.len(), ?summary, "Poll done");
        Ok(Some(PollReport {
            identity,
            start,
            end,
            num_lines: input.lines.len(),
            summary,
        }))
    }

    /// Poll until cancelled. A poll in progress stops dispatching at the
    /// first blocked queue send and waits for the confirmations of what it
    /// already dispatched.
    pub async fn run(mut self, cancel: CancellationToken) -> std::result::Result<(), BoxError> {
        self.cancel = cancel.clone();
        info!(
            path = self.processor.path(),
            app_type = self.processor.app_type(),
            interval_secs = self.settings.interval.as_secs(),
            "Watching file"
        );
        let mut ticker = tokio::time::interval(self.settings.interval);
        loop {
            select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.check().await {
                        Ok(_) => {}
                        Err(Error::FileNotFound(p)) => {
                            debug!(path = ?p, "Watched file does not exist (yet)")
                        }
                        Err(e @ Error::ChannelSend) => {
                            error!(path = self.processor.path(), error = %e, "Worklog writer is gone");
                            self.processor.on_quit();
                            return Err(e.into());
                        }
                        Err(e) => {
                            warn!(path = self.processor.path(), error = %e, "Poll failed")
                        }
                    }
                }
            }
        }
        self.processor.on_quit();
        debug!(path = self.processor.path(), "Exiting file tailer");
        Ok(())
    }
}

/// Run `tailers` until cancelled. Afterwards the state of every buffer is
/// saved to `buffer_state_dir` and the bot reports are logged.
pub async fn run_tail(
    tailers: Vec<FileTailer>,
    buffer_state_dir: Option<PathBuf>,
    cancel: CancellationToken,
) -> std::result::Result<(), BoxError> {
    let mut buffers: Vec<Arc<LogBuffer<AppRecord>>> = Vec::new();
    for t in &tailers {
        if !buffers.iter().any(|b| Arc::ptr_eq(b, t.buffer())) {
            buffers.push(t.buffer().clone());
        }
    }

    let mut tasks: JoinSet<std::result::Result<(), BoxError>> = JoinSet::new();
    for t in tailers {
        tasks.spawn(t.run(cancel.clone()));
    }

    let mut result = Ok(());
    while let Some(res) = tasks.join_next().await {
        let err: Option<BoxError> = match res {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(e) => Some(e.into()),
        };
        if let Some(e) = err {
            error!(error = %e, "File tailer failed, stopping");
            cancel.cancel();
            result = Err(e);
        }
    }

    for buffer in buffers.iter().filter(|b| b.capacity() > 0) {
        if let Some(state) = buffer.bot_state() {
            bots::log_report(buffer.id(), state);
        }
        if let Some(dir) = &buffer_state_dir {
            if let Err(e) = buffer.save_state(dir) {
                error!(buffer = buffer.id(), error = %e, "Failed to save buffer state");
            }
        }
    }
    result
}
