//! Structured Trade Logger
//!
//! Append-only JSONL audit sink with a bounded in-memory queue. A single
//! writer task owns the file handles; senders never block. When the queue is
//! full, records are dropped and counted; a drop spike inside a 10-second
//! window fires the configured callback once per window so the session layer
//! can react (throttle, alert, halt).
//!
//! Files rotate daily by the UTC date derived from each record's own
//! timestamp (`dryrun_YYYYMMDD.jsonl`), never from wall-clock time, so a
//! replayed history lands in the same files as the original run.

use crate::dryrun::clock::{utc_day_key, Millis};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Record categories accepted by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogKind {
    Signal,
    Entry,
    Exit,
    Action,
    Snapshot,
}

/// One JSONL line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeLogRecord {
    pub kind: LogKind,
    pub timestamp_ms: Millis,
    pub symbol: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct TradeLoggerConfig {
    pub dir: PathBuf,
    /// Bounded queue size; overflow drops.
    pub queue_capacity: usize,
    /// Drops within one window that trigger the spike callback.
    pub drop_halt_threshold: u64,
    pub drop_window_ms: i64,
}

impl Default for TradeLoggerConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./dryrun-logs"),
            queue_capacity: 10_000,
            drop_halt_threshold: 100,
            drop_window_ms: 10_000,
        }
    }
}

/// Counters surfaced to status endpoints.
#[derive(Debug, Default)]
pub struct TradeLoggerStats {
    pub enqueued: AtomicU64,
    pub written: AtomicU64,
    pub dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TradeLoggerStatsSnapshot {
    pub enqueued: u64,
    pub written: u64,
    pub dropped: u64,
}

/// Windowed drop accounting: fires at most once per window, on the drop that
/// pushes the count past the threshold. Time comes from record timestamps,
/// keeping the behavior replay-deterministic.
#[derive(Debug)]
pub(crate) struct DropTracker {
    window_ms: i64,
    threshold: u64,
    window_start: Millis,
    count: u64,
    fired: bool,
}

impl DropTracker {
    pub(crate) fn new(window_ms: i64, threshold: u64) -> Self {
        Self {
            window_ms,
            threshold,
            window_start: 0,
            count: 0,
            fired: false,
        }
    }

    /// Register a drop; returns the window count when the spike callback
    /// should fire.
    pub(crate) fn record_drop(&mut self, ts_ms: Millis) -> Option<u64> {
        if self.count == 0 || ts_ms - self.window_start >= self.window_ms {
            self.window_start = ts_ms;
            self.count = 0;
            self.fired = false;
        }
        self.count += 1;
        if !self.fired && self.count > self.threshold {
            self.fired = true;
            return Some(self.count);
        }
        None
    }
}

enum WriterMessage {
    Record(TradeLogRecord),
    Shutdown,
}

pub type DropSpikeCallback = Arc<dyn Fn(u64) + Send + Sync>;

pub struct TradeLogger {
    tx: mpsc::Sender<WriterMessage>,
    stats: Arc<TradeLoggerStats>,
    drops: Mutex<DropTracker>,
    on_drop_spike: Option<DropSpikeCallback>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TradeLogger {
    pub fn new(config: TradeLoggerConfig, on_drop_spike: Option<DropSpikeCallback>) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)
            .with_context(|| format!("creating log dir {}", config.dir.display()))?;
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(TradeLoggerStats::default());
        let drops = Mutex::new(DropTracker::new(
            config.drop_window_ms,
            config.drop_halt_threshold,
        ));
        let writer_stats = Arc::clone(&stats);
        let dir = config.dir.clone();
        let handle = tokio::spawn(async move {
            writer_loop(rx, dir, writer_stats).await;
        });
        Ok(Self {
            tx,
            stats,
            drops,
            on_drop_spike,
            writer_handle: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue a record. Never blocks; a full queue drops the record and
    /// advances the drop counters.
    pub fn log(&self, record: TradeLogRecord) {
        let ts = record.timestamp_ms;
        match self.tx.try_send(WriterMessage::Record(record)) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                let spike = self.drops.lock().record_drop(ts);
                if let Some(count) = spike {
                    warn!(dropped, count, "trade log drop spike");
                    if let Some(cb) = &self.on_drop_spike {
                        cb(count);
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> TradeLoggerStatsSnapshot {
        TradeLoggerStatsSnapshot {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            written: self.stats.written.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }

    /// Flush and close all streams. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WriterMessage::Shutdown).await;
        let handle = self.writer_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

struct RotatingWriter {
    dir: PathBuf,
    day_key: String,
    writer: Option<BufWriter<File>>,
}

impl RotatingWriter {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            day_key: String::new(),
            writer: None,
        }
    }

    fn writer_for(&mut self, ts_ms: Millis) -> Result<&mut BufWriter<File>> {
        let key = utc_day_key(ts_ms);
        if key != self.day_key || self.writer.is_none() {
            if let Some(mut old) = self.writer.take() {
                let _ = old.flush();
            }
            let path = self.dir.join(format!("dryrun_{key}.jsonl"));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            debug!(path = %path.display(), "rotated trade log");
            self.writer = Some(BufWriter::new(file));
            self.day_key = key;
        }
        match self.writer.as_mut() {
            Some(writer) => Ok(writer),
            None => unreachable!("writer installed above"),
        }
    }

    fn flush(&mut self) {
        if let Some(writer) = &mut self.writer {
            let _ = writer.flush();
        }
    }
}

async fn writer_loop(
    mut rx: mpsc::Receiver<WriterMessage>,
    dir: PathBuf,
    stats: Arc<TradeLoggerStats>,
) {
    let mut rotating = RotatingWriter::new(dir);
    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMessage::Record(record) => {
                match write_record(&mut rotating, &record) {
                    Ok(()) => {
                        stats.written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(error = %e, "trade log write failed");
                    }
                }
                // Cooperative flush once the queue has drained.
                if rx.is_empty() {
                    rotating.flush();
                }
            }
            WriterMessage::Shutdown => break,
        }
    }
    rotating.flush();
}

fn write_record(rotating: &mut RotatingWriter, record: &TradeLogRecord) -> Result<()> {
    let writer = rotating.writer_for(record.timestamp_ms)?;
    serde_json::to_writer(&mut *writer, record).context("serializing trade log record")?;
    writer.write_all(b"\n").context("writing newline")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(ts_ms: Millis, kind: LogKind) -> TradeLogRecord {
        TradeLogRecord {
            kind,
            timestamp_ms: ts_ms,
            symbol: "BTCUSDT".to_string(),
            data: json!({"note": "test"}),
        }
    }

    #[tokio::test]
    async fn test_writes_jsonl_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = TradeLogger::new(
            TradeLoggerConfig {
                dir: dir.path().to_path_buf(),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        logger.log(record(1_785_542_400_000, LogKind::Signal));
        logger.log(record(1_785_542_401_000, LogKind::Action));
        logger.shutdown().await;

        let path = dir.path().join("dryrun_20260801.jsonl");
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: TradeLogRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.kind, LogKind::Signal);
    }

    #[tokio::test]
    async fn test_daily_rotation_by_record_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let logger = TradeLogger::new(
            TradeLoggerConfig {
                dir: dir.path().to_path_buf(),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        logger.log(record(1_785_542_400_000, LogKind::Entry)); // 2026-08-01
        logger.log(record(1_785_628_800_000, LogKind::Exit)); // 2026-08-02
        logger.shutdown().await;

        assert!(dir.path().join("dryrun_20260801.jsonl").exists());
        assert!(dir.path().join("dryrun_20260802.jsonl").exists());
    }

    #[test]
    fn test_drop_tracker_fires_once_per_window() {
        let mut tracker = DropTracker::new(10_000, 3);
        assert_eq!(tracker.record_drop(1_000), None);
        assert_eq!(tracker.record_drop(2_000), None);
        assert_eq!(tracker.record_drop(3_000), None);
        assert_eq!(tracker.record_drop(4_000), Some(4));
        // Still in the same window: no second firing.
        assert_eq!(tracker.record_drop(5_000), None);
        // New window resets the count.
        assert_eq!(tracker.record_drop(20_000), None);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let logger = TradeLogger::new(
            TradeLoggerConfig {
                dir: dir.path().to_path_buf(),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        logger.shutdown().await;
        logger.shutdown().await;
    }
}
