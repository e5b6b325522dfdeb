//! Per-operation stats records.
//!
//! Recording never blocks and never fails the operation being recorded: records go through a
//! bounded channel to a writer thread and are counted and dropped when the channel is full.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write as _};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::path::ObjectPath;

/// Capacity of the channel in front of the stats file writer.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Which operation a [`StatRecord`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatOp {
    /// A file was opened.
    Open,
    /// Bytes were read.
    Read,
    /// Attributes were looked up.
    Stat,
    /// A directory was listed.
    List,
    /// A permission check.
    Access,
    /// Filesystem statistics.
    Statfs,
    /// A handle was closed.
    Release,
}

/// One line of the stats file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatRecord {
    /// Operation.
    pub op: StatOp,
    /// Path the operation touched.
    pub path: String,
    /// Byte offset, for reads.
    pub offset: u64,
    /// Bytes transferred, or entries listed.
    pub bytes: u64,
    /// Unix epoch milliseconds.
    pub timestamp_ms: u64,
}

impl StatRecord {
    /// A record for `op` on `path`, stamped now.
    #[must_use]
    pub fn new(op: StatOp, path: &ObjectPath, offset: u64, bytes: u64) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        Self {
            op,
            path: path.to_string(),
            offset,
            bytes,
            timestamp_ms,
        }
    }
}

#[derive(Debug, Default)]
struct SinkCounters {
    recorded: AtomicU64,
    dropped: AtomicU64,
}

/// Fire-and-forget destination for [`StatRecord`]s.
#[derive(Debug)]
pub struct StatsSink {
    tx: Mutex<Option<Sender<StatRecord>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<SinkCounters>,
}

impl StatsSink {
    /// A sink that only traces records.
    #[must_use]
    pub fn disabled() -> Self {
        Self::from_parts(None, None)
    }

    /// A sink feeding the returned receiver directly, with room for `capacity` records.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, Receiver<StatRecord>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (Self::from_parts(Some(tx), None), rx)
    }

    /// A sink appending JSON lines to the file at `path`.
    pub fn to_file(path: &Path, capacity: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (tx, rx) = crossbeam_channel::bounded::<StatRecord>(capacity);
        let target = path.display().to_string();

        let writer = std::thread::Builder::new()
            .name("docfs-stats".to_owned())
            .spawn(move || {
                let mut out = BufWriter::new(file);
                for record in rx.iter() {
                    let written = serde_json::to_writer(&mut out, &record)
                        .map_err(std::io::Error::from)
                        .and_then(|()| out.write_all(b"\n"));
                    if let Err(e) = written {
                        error!(path = target, error = %e, "failed to write stats record");
                    }
                    if rx.is_empty()
                        && let Err(e) = out.flush()
                    {
                        warn!(path = target, error = %e, "failed to flush stats file");
                    }
                }
                if let Err(e) = out.flush() {
                    warn!(path = target, error = %e, "failed to flush stats file");
                }
                debug!(path = target, "stats writer exiting");
            })?;

        Ok(Self::from_parts(Some(tx), Some(writer)))
    }

    fn from_parts(tx: Option<Sender<StatRecord>>, writer: Option<JoinHandle<()>>) -> Self {
        Self {
            tx: Mutex::new(tx),
            writer: Mutex::new(writer),
            counters: Arc::new(SinkCounters::default()),
        }
    }

    /// Record one completed operation. Never blocks.
    pub fn record(&self, record: StatRecord) {
        trace!(
            op = ?record.op,
            path = record.path,
            offset = record.offset,
            bytes = record.bytes,
            "stat"
        );

        let Some(tx) = self.tx.lock().clone() else {
            return;
        };
        match tx.try_send(record) {
            Ok(()) => {
                self.counters.recorded.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Stop accepting records and wait for the writer to flush what it has.
    pub fn close(&self) {
        drop(self.tx.lock().take());
        if let Some(writer) = self.writer.lock().take()
            && writer.join().is_err()
        {
            error!("stats writer panicked");
        }
    }

    /// Records handed to the channel.
    #[must_use]
    pub fn recorded(&self) -> u64 {
        self.counters.recorded.load(Ordering::Relaxed)
    }

    /// Records dropped because the channel was full or its reader went away.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturated_sink_drops_instead_of_blocking() {
        let (sink, rx) = StatsSink::channel(1);
        let path = ObjectPath::parse("/a").unwrap();
        sink.record(StatRecord::new(StatOp::Stat, &path, 0, 0));
        sink.record(StatRecord::new(StatOp::Stat, &path, 0, 0));
        sink.record(StatRecord::new(StatOp::Stat, &path, 0, 0));

        assert_eq!(sink.recorded(), 1);
        assert_eq!(sink.dropped(), 2);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn closed_sink_ignores_records() {
        let (sink, rx) = StatsSink::channel(4);
        sink.close();
        sink.record(StatRecord::new(StatOp::Open, &ObjectPath::root(), 0, 0));
        assert_eq!(sink.recorded(), 0);
        assert_eq!(sink.dropped(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn file_sink_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stats").join("ops.jsonl");
        let sink = StatsSink::to_file(&file, 16).unwrap();
        let path = ObjectPath::parse("/docs/a.txt").unwrap();
        sink.record(StatRecord::new(StatOp::Read, &path, 4096, 10));
        sink.record(StatRecord::new(StatOp::Release, &path, 0, 0));
        sink.close();

        let contents = std::fs::read_to_string(&file).unwrap();
        let records: Vec<StatRecord> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].op, StatOp::Read);
        assert_eq!(records[0].path, "/docs/a.txt");
        assert_eq!(records[0].offset, 4096);
        assert_eq!(records[0].bytes, 10);
        assert_eq!(records[1].op, StatOp::Release);
    }
}
