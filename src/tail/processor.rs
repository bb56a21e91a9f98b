// SPDX-License-Identifier: Apache-2.0

//! Line dispatch of one watched file.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::bounded_channel::{self, BoundedReceiver, BoundedSender, SendError};
use crate::logbuffer::LogBuffer;
use crate::save::{ConfirmMsg, Sink, run_write_consumer};
use crate::servicelog::{
    AppRecord, BoundOutputRecord, InputRecord, LineParser, ProcessingError, Transformer,
};
use crate::tail::alarm::AppErrorRegister;
use crate::tail::health::ProcessingHealthChecker;
use crate::tail::reader::LineSpan;
use crate::worklog::{FileRange, Worklog};

/// Counts of the confirmations seen during one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfirmSummary {
    pub written: usize,
    pub ignored: usize,
    pub failed: usize,
    /// End of the confirmed prefix of the poll
    pub confirmed_end: i64,
}

impl ConfirmSummary {
    pub fn all_ok(&self) -> bool {
        self.failed == 0
    }
}

/// Contiguous confirmed bytes of one poll, starting at the poll start.
/// Spans confirmed out of order wait in `pending` until the gap before
/// them is closed. A failed span blocks the prefix at its start.
#[derive(Debug)]
struct ConfirmedPrefix {
    end: i64,
    blocked_at: i64,
    pending: BTreeMap<i64, i64>,
}

impl ConfirmedPrefix {
    fn new(start: i64) -> Self {
        Self {
            end: start,
            blocked_at: i64::MAX,
            pending: BTreeMap::new(),
        }
    }

    /// Returns whether the prefix grew.
    fn confirm(&mut self, span: FileRange) -> bool {
        let pending_end = self.pending.entry(span.seek_start).or_insert(span.seek_end);
        *pending_end = (*pending_end).max(span.seek_end);

        let before = self.end;
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() > self.end {
                break;
            }
            self.end = self.end.max(entry.remove());
        }
        self.end = self.end.min(self.blocked_at);
        self.end > before
    }

    fn block(&mut self, span: FileRange) {
        self.blocked_at = self.blocked_at.min(span.seek_start);
    }
}

/// Queues of one poll. Dropping the senders ends the poll's sink task and
/// the confirmation forwarder.
pub struct CheckSession {
    records: BoundedSender<BoundOutputRecord>,
    ignored: BoundedSender<ConfirmMsg>,
    forwarder: JoinHandle<ConfirmSummary>,
    start: i64,
    cancel: CancellationToken,
}

pub struct TailProcessor {
    path: String,
    app_type: String,
    parser: LineParser,
    transformer: Transformer,
    buffer: Arc<LogBuffer<AppRecord>>,
    sink: Arc<dyn Sink>,
    chunk_size: usize,
    alarm: Arc<dyn AppErrorRegister>,
    health: Arc<dyn ProcessingHealthChecker>,
    worklog: Worklog,
}

impl TailProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: impl Into<String>,
        parser: LineParser,
        transformer: Transformer,
        buffer: Arc<LogBuffer<AppRecord>>,
        sink: Arc<dyn Sink>,
        chunk_size: usize,
        alarm: Arc<dyn AppErrorRegister>,
        health: Arc<dyn ProcessingHealthChecker>,
        worklog: Worklog,
    ) -> Self {
        let app_type = transformer.app_type().to_string();
        Self {
            path: path.into(),
            app_type,
            parser,
            transformer,
            buffer,
            sink,
            chunk_size: chunk_size.max(1),
            alarm,
            health,
            worklog,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn app_type(&self) -> &str {
        &self.app_type
    }

    pub fn buffer(&self) -> &Arc<LogBuffer<AppRecord>> {
        &self.buffer
    }

    pub fn worklog(&self) -> &Worklog {
        &self.worklog
    }

    /// Start the sink for a poll beginning at `start` of the file with
    /// `identity`, and the task forwarding its confirmations (and the
    /// ignored spans) to the worklog. Sends give up once `cancel` fires.
    pub fn on_check_start(
        &self,
        identity: i64,
        start: i64,
        cancel: &CancellationToken,
    ) -> CheckSession {
        let (records_tx, records_rx) = bounded_channel::bounded(self.chunk_size * 2);
        let (ignored_tx, ignored_rx) = bounded_channel::bounded(self.chunk_size * 2);
        let confirms = run_write_consumer(self.sink.clone(), records_rx, self.chunk_size);
        let forwarder = tokio::spawn(forward_confirmations(
            self.worklog.clone(),
            self.path.clone(),
            FileRange::confirmed(identity, start, start),
            confirms,
            ignored_rx,
        ));
        CheckSession {
            records: records_tx,
            ignored: ignored_tx,
            forwarder,
            start,
            cancel: cancel.clone(),
        }
    }

    /// Parse, preprocess, transform and enqueue one line. Fails when the
    /// poll's queues are gone or the session was cancelled while waiting
    /// for queue space.
    pub async fn on_entry(
        &self,
        session: &CheckSession,
        line: &LineSpan,
        line_num: i64,
        identity: i64,
    ) -> Result<(), SendError> {
        let span = FileRange::unconfirmed(identity, line.start, line.end);
        let parsed = match self.parser.parse_line(&line.text, line_num) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(path = %self.path, error = %e, "Failed to parse line");
                self.alarm.on_error(&e.to_string());
                return self.ignore(session, span).await;
            }
        };
        if !parsed.is_processable() {
            return self.ignore(session, span).await;
        }

        let prepared = self.transformer.preprocess(parsed, &self.buffer);
        let mut sent = 0;
        for rec in prepared {
            self.buffer.add_record(rec.clone());
            let out = match self.transformer.transform(&rec) {
                Ok(out) => out,
                Err(e) => {
                    self.report_transform_error(&e);
                    continue;
                }
            };
            let time = out.time();
            let bound = BoundOutputRecord {
                path: self.path.clone(),
                span,
                record: out,
            };
            session
                .records
                .send_or_cancel(bound, &session.cancel)
                .await
                .inspect_err(|e| debug!(path = %self.path, error = %e, "Record not queued"))?;
            sent += 1;
            self.health.ping(&self.path, time);
        }
        // the line is confirmed by the sink once one of its records is written
        if sent == 0 {
            return self.ignore(session, span).await;
        }
        Ok(())
    }

    fn report_transform_error(&self, e: &ProcessingError) {
        error!(path = %self.path, app_type = %self.app_type, error = %e, "Failed to transform record");
        self.alarm.on_error(&e.to_string());
    }

    async fn ignore(&self, session: &CheckSession, span: FileRange) -> Result<(), SendError> {
        session
            .ignored
            .send_or_cancel(ConfirmMsg::ignored(self.path.as_str(), span), &session.cancel)
            .await
            .inspect_err(|e| debug!(path = %self.path, error = %e, "Ignored span not queued"))
    }

    /// Close the poll's queues, evaluate the alarm and wait until every
    /// confirmation reached the worklog queue.
    pub async fn on_check_stop(&self, session: CheckSession) -> ConfirmSummary {
        let CheckSession {
            records,
            ignored,
            forwarder,
            start,
            ..
        } = session;
        drop(records);
        drop(ignored);
        self.alarm.evaluate();
        match forwarder.await {
            Ok(summary) => summary,
            Err(e) => {
                error!(path = %self.path, error = %e, "Confirmation forwarder failed");
                ConfirmSummary {
                    failed: 1,
                    confirmed_end: start,
                    ..Default::default()
                }
            }
        }
    }

    pub fn on_quit(&self) {
        self.alarm.reset();
    }
}

/// Forward the poll's confirmations to the worklog. Only the contiguous
/// confirmed prefix `[poll.seek_start, prefix_end)` is ever reported, so the
/// worklog cannot move past a chunk whose write is still in flight or failed.
async fn forward_confirmations(
    worklog: Worklog,
    path: String,
    poll: FileRange,
    mut confirms: BoundedReceiver<ConfirmMsg>,
    mut ignored: BoundedReceiver<ConfirmMsg>,
) -> ConfirmSummary {
    let mut summary = ConfirmSummary::default();
    let mut prefix = ConfirmedPrefix::new(poll.seek_start);
    let mut confirms_open = true;
    let mut ignored_open = true;

    while confirms_open || ignored_open {
        let msg = select! {
            m = confirms.next(), if confirms_open => match m {
                Some(m) => m,
                None => {
                    confirms_open = false;
                    continue;
                }
            },
            m = ignored.next(), if ignored_open => match m {
                Some(m) => m,
                None => {
                    ignored_open = false;
                    continue;
                }
            },
        };

        match &msg {
            ConfirmMsg::Ignored { .. } => summary.ignored += 1,
            ConfirmMsg::Written { error: None, .. } => summary.written += 1,
            ConfirmMsg::Written { error: Some(_), .. } => summary.failed += 1,
        }
        if msg.is_error() {
            prefix.block(msg.span());
            continue;
        }
        if !prefix.confirm(msg.span()) {
            continue;
        }
        let range = FileRange::confirmed(poll.identity, poll.seek_start, prefix.end);
        if let Err(e) = worklog.request_update(&path, range).await {
            error!(path = %path, error = %e, "Failed to queue worklog update");
            summary.failed += 1;
        }
    }
    summary.confirmed_end = prefix.end;
    debug!(path = %path, ?summary, "Confirmations forwarded");
    summary
}
