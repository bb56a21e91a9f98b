// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use logproc::error::{Error, Result};
use logproc::init::agent::{Agent, TailOptions};
use logproc::init::config::AppConfig;
use logproc::logbuffer::LogBuffer;
use logproc::save::Sink;
use logproc::servicelog::{BoundOutputRecord, TransformerSettings, new_line_parser, new_transformer};
use logproc::tail::{FileTailer, NoopHealthChecker, NullAlarm, TailProcessor, TailSettings};
use logproc::worklog::{FileRange, Worklog, WorklogConfig};

#[derive(Default)]
struct MemorySink {
    records: Mutex<Vec<BoundOutputRecord>>,
    fail: AtomicBool,
}

impl MemorySink {
    fn num_records(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn write_chunk(&self, chunk: &[BoundOutputRecord]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Sink("store is down".to_string()));
        }
        self.records.lock().unwrap().extend_from_slice(chunk);
        Ok(())
    }
}

fn access_line(i: usize) -> String {
    format!(
        r#"10.0.0.{} - - [16/Sep/2019:08:24:{:02} +0200] "GET /map/tiles?z=3 HTTP/1.1" 200 332 "-" "Mozilla/5.0""#,
        i % 250,
        i % 60
    )
}

fn write_lines(path: &Path, lines: &[String]) {
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    for l in lines {
        writeln!(f, "{}", l).unwrap();
    }
    f.flush().unwrap();
}

fn open_worklog(dir: &Path) -> (Worklog, JoinHandle<Result<()>>) {
    let (worklog, writer) = Worklog::open(dir, "test", WorklogConfig::default()).unwrap();
    let task = tokio::spawn(writer.run(CancellationToken::new()));
    (worklog, task)
}

/// Close every handle, wait for the final save and read the range back.
async fn persisted_range(
    dir: &Path,
    worklog: Worklog,
    task: JoinHandle<Result<()>>,
    path: &str,
) -> FileRange {
    drop(worklog);
    task.await.unwrap().unwrap();
    let (reopened, _writer) = Worklog::open(dir, "test", WorklogConfig::default()).unwrap();
    reopened.get_range(path)
}

fn tailer(path: &str, worklog: &Worklog, sink: Arc<MemorySink>) -> FileTailer {
    let processor = TailProcessor::new(
        path,
        new_line_parser("mapka", "3").unwrap(),
        new_transformer("mapka", "3", TransformerSettings::default()).unwrap(),
        Arc::new(LogBuffer::disabled("test")),
        sink,
        3,
        Arc::new(NullAlarm),
        Arc::new(NoopHealthChecker),
        worklog.clone(),
    );
    FileTailer::new(
        processor,
        TailSettings {
            interval: Duration::from_secs(1),
            max_lines_per_check: 1000,
            max_line_size: 4096,
            max_idle: None,
        },
    )
}

#[tokio::test]
async fn test_unparsable_lines_are_ignored_and_range_confirmed() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("access.log");
    let mut lines: Vec<String> = (0..10).map(access_line).collect();
    lines[3] = "garbage".to_string();
    lines[7] = "more garbage".to_string();
    write_lines(&log, &lines);
    let path = log.to_str().unwrap();
    let meta = std::fs::metadata(&log).unwrap();

    let (worklog, task) = open_worklog(dir.path());
    let sink = Arc::new(MemorySink::default());
    let mut t = tailer(path, &worklog, sink.clone());

    let report = t.check().await.unwrap().unwrap();
    assert_eq!(report.num_lines, 10);
    assert_eq!(report.summary.ignored, 2);
    assert_eq!(report.summary.written, 3);
    assert!(report.summary.all_ok());
    assert_eq!(sink.num_records(), 8);

    // nothing new
    assert!(t.check().await.unwrap().is_none());
    drop(t);

    let range = persisted_range(dir.path(), worklog, task, path).await;
    assert_eq!(
        range,
        FileRange::confirmed(meta.ino() as i64, 0, meta.len() as i64)
    );
}

#[tokio::test]
async fn test_unconfirmed_then_confirmed_ranges_reconcile() {
    let dir = tempfile::tempdir().unwrap();
    let (worklog, task) = open_worklog(dir.path());

    worklog
        .request_update("/var/log/a.log", FileRange::unconfirmed(1, 0, 100))
        .await
        .unwrap();
    worklog
        .request_update("/var/log/a.log", FileRange::confirmed(1, 0, 50))
        .await
        .unwrap();
    worklog
        .request_update("/var/log/a.log", FileRange::confirmed(1, 0, 100))
        .await
        .unwrap();

    let range = persisted_range(dir.path(), worklog, task, "/var/log/a.log").await;
    assert_eq!(range, FileRange::confirmed(1, 0, 100));
}

#[tokio::test]
async fn test_reset_file_starts_over_at_current_identity() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    write_lines(&log, &[access_line(1)]);
    let path = log.to_str().unwrap();
    let inode = std::fs::metadata(&log).unwrap().ino() as i64;

    let (worklog, task) = open_worklog(dir.path());
    worklog
        .request_update(path, FileRange::confirmed(5, 0, 40))
        .await
        .unwrap();
    assert_eq!(worklog.reset_file(path).await.unwrap(), inode);

    let range = persisted_range(dir.path(), worklog, task, path).await;
    assert_eq!(range, FileRange::confirmed(inode, 0, 0));
}

#[tokio::test]
async fn test_reset_file_of_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let (worklog, _task) = open_worklog(dir.path());
    assert!(matches!(
        worklog.reset_file("/nonexistent/file.log").await,
        Err(Error::FileNotFound(_))
    ));
}

#[tokio::test]
async fn test_restart_resumes_after_confirmed_range() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("access.log");
    write_lines(&log, &(0..4).map(access_line).collect::<Vec<_>>());
    let path = log.to_str().unwrap();

    let (worklog, task) = open_worklog(dir.path());
    let sink = Arc::new(MemorySink::default());
    let mut t = tailer(path, &worklog, sink.clone());
    t.check().await.unwrap();
    drop(t);
    let first = persisted_range(dir.path(), worklog, task, path).await;

    write_lines(&log, &(4..6).map(access_line).collect::<Vec<_>>());
    let (worklog, task) = open_worklog(dir.path());
    let sink = Arc::new(MemorySink::default());
    let mut t = tailer(path, &worklog, sink.clone());
    let report = t.check().await.unwrap().unwrap();
    assert_eq!(report.start, first.seek_end);
    assert_eq!(report.num_lines, 2);
    assert_eq!(sink.num_records(), 2);
    drop(t);

    let range = persisted_range(dir.path(), worklog, task, path).await;
    assert!(range.confirmed);
    assert_eq!(range.seek_end, std::fs::metadata(&log).unwrap().len() as i64);
}

#[tokio::test]
async fn test_failed_writes_keep_range_for_replay() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("access.log");
    write_lines(&log, &(0..5).map(access_line).collect::<Vec<_>>());
    let path = log.to_str().unwrap();

    let (worklog, task) = open_worklog(dir.path());
    let sink = Arc::new(MemorySink::default());
    sink.fail.store(true, Ordering::SeqCst);
    let mut t = tailer(path, &worklog, sink.clone());

    let report = t.check().await.unwrap().unwrap();
    assert!(!report.summary.all_ok());
    assert_eq!(report.summary.confirmed_end, 0);

    // the store recovers, later polls must not move past the lost lines
    sink.fail.store(false, Ordering::SeqCst);
    write_lines(&log, &(5..8).map(access_line).collect::<Vec<_>>());
    let report = t.check().await.unwrap().unwrap();
    assert!(report.summary.all_ok());
    assert_eq!(report.num_lines, 3);
    drop(t);

    let range = persisted_range(dir.path(), worklog, task, path).await;
    assert!(!range.confirmed);
    assert_eq!(range.resume_offset(), 0);
}

#[tokio::test]
async fn test_rotation_and_truncation_restart_from_zero() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("access.log");
    write_lines(&log, &(0..3).map(access_line).collect::<Vec<_>>());
    let path = log.to_str().unwrap();

    let (worklog, _task) = open_worklog(dir.path());
    let sink = Arc::new(MemorySink::default());
    let mut t = tailer(path, &worklog, sink.clone());
    t.check().await.unwrap();

    // logrotate: move away, new file at the same path
    let keep = dir.path().join("access.log.1");
    std::fs::rename(&log, &keep).unwrap();
    write_lines(&log, &[access_line(10)]);
    let report = t.check().await.unwrap().unwrap();
    assert_eq!((report.start, report.num_lines), (0, 1));

    // copytruncate style
    std::fs::OpenOptions::new()
        .write(true)
        .open(&log)
        .unwrap()
        .set_len(0)
        .unwrap();
    assert!(t.check().await.unwrap().is_none());
    write_lines(&log, &[access_line(11), access_line(12)]);
    let report = t.check().await.unwrap().unwrap();
    assert_eq!((report.start, report.num_lines), (0, 2));
    assert_eq!(sink.num_records(), 6);
}

#[tokio::test]
async fn test_partial_line_waits_for_terminator() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("access.log");
    write_lines(&log, &[access_line(0)]);
    let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
    write!(f, "{}", access_line(1)).unwrap();
    f.flush().unwrap();
    let path = log.to_str().unwrap();

    let (worklog, _task) = open_worklog(dir.path());
    let sink = Arc::new(MemorySink::default());
    let mut t = tailer(path, &worklog, sink.clone());
    assert_eq!(t.check().await.unwrap().unwrap().num_lines, 1);

    writeln!(f).unwrap();
    f.flush().unwrap();
    assert_eq!(t.check().await.unwrap().unwrap().num_lines, 1);
    assert_eq!(sink.num_records(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_agent_end_to_end_with_shared_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let worklog_dir = dir.path().join("worklog");
    let state_dir = dir.path().join("state");
    std::fs::create_dir_all(&state_dir).unwrap();
    let out = dir.path().join("out.ndjson");
    let log_a = dir.path().join("a.log");
    let log_b = dir.path().join("b.log");
    write_lines(&log_a, &(0..4).map(access_line).collect::<Vec<_>>());
    write_lines(&log_b, &(10..13).map(access_line).collect::<Vec<_>>());

    let buffer = serde_json::json!({"id": "shared", "historyLookupItems": 10, "analysisIntervalSecs": 60});
    let config: AppConfig = serde_json::from_value(serde_json::json!({
        "logTail": {
            "worklogDir": worklog_dir,
            "instanceId": "e2e",
            "intervalSecs": 1,
            "logBufferStateDir": state_dir,
            "files": [
                {"path": log_a, "appType": "mapka", "version": "3", "buffer": buffer},
                {"path": log_b, "appType": "mapka", "version": "3", "buffer": buffer}
            ]
        },
        "sink": {"kind": "ndjson", "path": out, "chunkSize": 2}
    }))
    .unwrap();
    config.validate().unwrap();

    let cancel = CancellationToken::new();
    let agent = Agent::new(Box::new(config), TailOptions::default());
    let task = tokio::spawn(agent.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(1500)).await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    let written = std::fs::read_to_string(&out).unwrap();
    assert_eq!(written.lines().count(), 7);

    let saved: HashMap<String, FileRange> =
        serde_json::from_slice(&std::fs::read(worklog_dir.join("e2e.json")).unwrap()).unwrap();
    for log in [&log_a, &log_b] {
        let meta = std::fs::metadata(log).unwrap();
        assert_eq!(
            saved[log.to_str().unwrap()],
            FileRange::confirmed(meta.ino() as i64, 0, meta.len() as i64)
        );
    }

    // one buffer for both files, saved once
    let states: Vec<_> = std::fs::read_dir(&state_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(states, vec!["shared.buffer.json".to_string()]);
}
