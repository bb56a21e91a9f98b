// SPDX-License-Identifier: Apache-2.0

//! Output sinks.
//!
//! A sink receives bound output records on a bounded queue, writes them in
//! chunks and answers every chunk with a [`ConfirmMsg`] carrying the byte
//! span the chunk covers. The confirmation queue closes once the record
//! queue is closed and drained.

pub mod dry_run;
pub mod ndjson;

use std::sync::Arc;

use tracing::{debug, error};

use crate::bounded_channel::{self, BoundedReceiver, BoundedSender};
use crate::error::Result;
use crate::servicelog::BoundOutputRecord;
use crate::worklog::FileRange;

pub use dry_run::DryRunSink;
pub use ndjson::NdjsonSink;

/// Outcome of processing a span of a watched file.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmMsg {
    /// Lines that produced no output (unparsable, not processable...).
    Ignored { path: String, span: FileRange },
    /// Lines whose output was written; `error` is set when the write failed.
    Written {
        path: String,
        span: FileRange,
        error: Option<String>,
    },
}

impl ConfirmMsg {
    pub fn ignored(path: impl Into<String>, span: FileRange) -> Self {
        ConfirmMsg::Ignored {
            path: path.into(),
            span,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            ConfirmMsg::Ignored { path, .. } | ConfirmMsg::Written { path, .. } => path,
        }
    }

    pub fn span(&self) -> FileRange {
        match self {
            ConfirmMsg::Ignored { span, .. } | ConfirmMsg::Written { span, .. } => *span,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ConfirmMsg::Written { error: Some(_), .. })
    }
}

/// Destination of output records.
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write one chunk. Called from a blocking context.
    fn write_chunk(&self, chunk: &[BoundOutputRecord]) -> Result<()>;
}

/// Smallest span covering every record of `chunk`.
fn chunk_span(chunk: &[BoundOutputRecord]) -> Option<FileRange> {
    let first = chunk.first()?.span;
    Some(chunk.iter().skip(1).fold(first, |acc, r| acc.union(&r.span)))
}

/// Consume `records` with `sink`, `chunk_size` records at a time. Returns
/// the confirmation queue, one message per chunk.
pub fn run_write_consumer(
    sink: Arc<dyn Sink>,
    mut records: BoundedReceiver<BoundOutputRecord>,
    chunk_size: usize,
) -> BoundedReceiver<ConfirmMsg> {
    let chunk_size = chunk_size.max(1);
    let (confirm_tx, confirm_rx) = bounded_channel::bounded(chunk_size);

    tokio::spawn(async move {
        let mut chunk = Vec::with_capacity(chunk_size);
        while let Some(rec) = records.next().await {
            chunk.push(rec);
            if chunk.len() >= chunk_size {
                let full = std::mem::replace(&mut chunk, Vec::with_capacity(chunk_size));
                flush_chunk(&sink, full, &confirm_tx).await;
            }
        }
        if !chunk.is_empty() {
            flush_chunk(&sink, chunk, &confirm_tx).await;
        }
        debug!(sink = sink.name(), "Record queue closed, sink done");
    });

    confirm_rx
}

async fn flush_chunk(
    sink: &Arc<dyn Sink>,
    chunk: Vec<BoundOutputRecord>,
    confirm_tx: &BoundedSender<ConfirmMsg>,
) {
    let Some(span) = chunk_span(&chunk) else {
        return;
    };
    let path = chunk[0].path.clone();
    let num_records = chunk.len();

    let writer = sink.clone();
    let res = match tokio::task::spawn_blocking(move || writer.write_chunk(&chunk)).await {
        Ok(res) => res.map_err(|e| e.to_string()),
        Err(e) => Err(format!("sink task failed: {}", e)),
    };
    if let Err(e) = &res {
        error!(sink = sink.name(), path = %path, num_records, error = %e, "Failed to write records");
    } else {
        debug!(sink = sink.name(), path = %path, num_records, span = %span, "Chunk written");
    }

    let msg = ConfirmMsg::Written {
        path,
        span,
        error: res.err(),
    };
    if confirm_tx.send(msg).await.is_err() {
        error!(sink = sink.name(), "Confirmation queue closed before the sink finished");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use crate::servicelog::{OutputRecord, mapka};
    use chrono::DateTime;
    use std::sync::Mutex;

    pub(crate) fn bound(path: &str, start: i64, end: i64) -> BoundOutputRecord {
        BoundOutputRecord {
            path: path.to_string(),
            span: FileRange::unconfirmed(1, start, end),
            record: OutputRecord::Mapka(mapka::OutputRecord {
                id: format!("id-{}", start),
                rec_type: "mapka".to_string(),
                action: "interaction".to_string(),
                path: "/".to_string(),
                datetime: "2024-01-01T00:00:00+00:00".to_string(),
                time: DateTime::UNIX_EPOCH,
                ip_address: None,
                user_agent: String::new(),
                user_id: None,
                is_anonymous: true,
                is_query: false,
                cluster_size: 0,
                proc_time: None,
            }),
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        chunks: Mutex<Vec<usize>>,
        fail: bool,
    }

    impl Sink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn write_chunk(&self, chunk: &[BoundOutputRecord]) -> Result<()> {
            self.chunks.lock().unwrap().push(chunk.len());
            if self.fail {
                return Err(Error::Sink("store unavailable".to_string()));
            }
            Ok(())
        }
    }

    async fn run(sink: Arc<RecordingSink>, n: i64, chunk_size: usize) -> Vec<ConfirmMsg> {
        let (tx, rx) = bounded_channel::bounded(4);
        let mut confirms = run_write_consumer(sink, rx, chunk_size);
        tokio::spawn(async move {
            for i in 0..n {
                tx.send(bound("/a.log", i * 10, i * 10 + 10)).await.unwrap();
            }
        });
        let mut ans = Vec::new();
        while let Some(c) = confirms.next().await {
            ans.push(c);
        }
        ans
    }

    #[tokio::test]
    async fn test_confirms_per_chunk_with_chunk_span() {
        let sink = Arc::new(RecordingSink::default());
        let confirms = run(sink.clone(), 5, 2).await;

        assert_eq!(*sink.chunks.lock().unwrap(), vec![2, 2, 1]);
        let spans: Vec<FileRange> = confirms.iter().map(|c| c.span()).collect();
        assert_eq!(
            spans,
            vec![
                FileRange::unconfirmed(1, 0, 20),
                FileRange::unconfirmed(1, 20, 40),
                FileRange::unconfirmed(1, 40, 50),
            ]
        );
        assert!(confirms.iter().all(|c| !c.is_error()));
    }

    #[tokio::test]
    async fn test_failed_write_is_unconfirmed() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let confirms = run(sink, 3, 10).await;
        assert_eq!(confirms.len(), 1);
        assert!(confirms[0].is_error());
        assert_eq!(confirms[0].span(), FileRange::unconfirmed(1, 0, 30));
    }

    #[tokio::test]
    async fn test_empty_queue_confirms_nothing() {
        let sink = Arc::new(RecordingSink::default());
        assert!(run(sink, 0, 3).await.is_empty());
    }

    #[test]
    fn test_ignored_is_never_an_error() {
        let msg = ConfirmMsg::ignored("/a.log", FileRange::unconfirmed(1, 5, 9));
        assert_eq!(msg.span(), FileRange::unconfirmed(1, 5, 9));
        assert!(!msg.is_error());
        assert_eq!(msg.path(), "/a.log");
    }
}
