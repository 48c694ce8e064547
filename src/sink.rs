//! Where log records go once a worker hands them to the coordinator.
//!
//! [`LogStore`] is the durable side, called once per record. [`RealtimeSink`] is
//! the live side, fed in batches by a [`BufferedEmitter`].

use crate::error::SinkError;
use crate::model::LogRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn insert_log(&self, record: &LogRecord) -> Result<(), SinkError>;

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

pub trait RealtimeSink: Send + Sync {
    fn emit_log(&self, run_id: &str, logs: &[LogRecord]);

    fn emit_done(&self, run_id: &str, message: &str);
}

/// Drops every record.
#[derive(Debug, Default)]
pub struct NoopLogStore;

#[async_trait]
impl LogStore for NoopLogStore {
    async fn insert_log(&self, _record: &LogRecord) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryLogStore {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn insert_log(&self, record: &LogRecord) -> Result<(), SinkError> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// One JSON object per line.
pub struct JsonLinesLogStore {
    writer: tokio::sync::Mutex<BufWriter<File>>,
}

impl JsonLinesLogStore {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let file = File::create(path).await?;
        Ok(Self {
            writer: tokio::sync::Mutex::new(BufWriter::new(file)),
        })
    }
}

#[async_trait]
impl LogStore for JsonLinesLogStore {
    async fn insert_log(&self, record: &LogRecord) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer.lock().await.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.writer.lock().await.flush().await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct TracingSink;

impl RealtimeSink for TracingSink {
    fn emit_log(&self, run_id: &str, logs: &[LogRecord]) {
        let errors = logs.iter().filter(|l| l.error.is_some()).count();
        tracing::info!(run_id, records = logs.len(), errors, "log batch");
    }

    fn emit_done(&self, run_id: &str, message: &str) {
        tracing::info!(run_id, "{message}");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Logs { run_id: String, logs: Vec<LogRecord> },
    Done { run_id: String, message: String },
}

/// Forwards batches over a channel, for embedders that push them to their own clients.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RealtimeSink for ChannelSink {
    fn emit_log(&self, run_id: &str, logs: &[LogRecord]) {
        let _ = self.tx.send(SinkEvent::Logs {
            run_id: run_id.to_string(),
            logs: logs.to_vec(),
        });
    }

    fn emit_done(&self, run_id: &str, message: &str) {
        let _ = self.tx.send(SinkEvent::Done {
            run_id: run_id.to_string(),
            message: message.to_string(),
        });
    }
}

/// Per-run buffer in front of a [`RealtimeSink`].
///
/// Flushes when `batch_size` records are pending or when the owner calls
/// [`flush`](Self::flush) on its timer. [`finish`](Self::finish) does the final
/// flush and the single `emit_done`, consuming the buffer.
pub struct BufferedEmitter {
    run_id: String,
    sink: Arc<dyn RealtimeSink>,
    buffer: Vec<LogRecord>,
    batch_size: usize,
}

impl BufferedEmitter {
    pub fn new(run_id: impl Into<String>, sink: Arc<dyn RealtimeSink>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            run_id: run_id.into(),
            sink,
            buffer: Vec::with_capacity(batch_size),
            batch_size,
        }
    }

    pub fn push(&mut self, record: LogRecord) {
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            self.flush();
        }
    }

    pub fn flush(&mut self) {
        if !self.buffer.is_empty() {
            self.sink.emit_log(&self.run_id, &self.buffer);
            self.buffer.clear();
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn finish(mut self, message: &str) {
        self.flush();
        self.sink.emit_done(&self.run_id, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(n: u16) -> LogRecord {
        LogRecord {
            run_id: "run".into(),
            endpoint_id: format!("ep-{n}"),
            status_code: 200,
            response_time: n as u64,
            error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn emitter_flushes_full_batches() {
        let (sink, mut rx) = ChannelSink::new();
        let mut emitter = BufferedEmitter::new("run", Arc::new(sink), 3);
        for n in 0..7 {
            emitter.push(record(n));
        }
        assert_eq!(emitter.pending(), 1);

        let mut sizes = Vec::new();
        while let Ok(SinkEvent::Logs { logs, .. }) = rx.try_recv() {
            sizes.push(logs.len());
        }
        assert_eq!(sizes, [3, 3]);
    }

    #[test]
    fn finish_flushes_then_reports_done_once() {
        let (sink, mut rx) = ChannelSink::new();
        let mut emitter = BufferedEmitter::new("run", Arc::new(sink), 100);
        emitter.push(record(1));
        emitter.push(record(2));
        emitter.flush();
        emitter.flush();
        emitter.push(record(3));
        emitter.finish("all done");

        let events: Vec<SinkEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], SinkEvent::Logs { logs, .. } if logs.len() == 2));
        assert!(matches!(&events[1], SinkEvent::Logs { logs, .. } if logs.len() == 1));
        assert_eq!(
            events[2],
            SinkEvent::Done {
                run_id: "run".into(),
                message: "all done".into()
            }
        );
    }

    #[tokio::test]
    async fn json_lines_store_writes_one_record_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.jsonl");
        let store = JsonLinesLogStore::create(&path).await.unwrap();
        store.insert_log(&record(1)).await.unwrap();
        store.insert_log(&record(2)).await.unwrap();
        store.flush().await.unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<LogRecord> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].endpoint_id, "ep-2");
        assert!(raw.contains("\"statusCode\":200"));
    }

    #[tokio::test]
    async fn memory_store_keeps_records() {
        let store = MemoryLogStore::new();
        store.insert_log(&record(4)).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.records()[0].response_time, 4);
    }
}
