//! Frame sinks.
//!
//! The data loop hands every received frame to a [`DataSink`] together with the stage
//! coordinates recorded when its trigger was issued.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::error::AppResult;
use crate::hardware::{Frame, StagePosition};

/// Destination for acquired frames.
pub trait DataSink: Send {
    /// Store one frame taken at `position`.
    fn write(&mut self, frame: &Frame, position: &StagePosition) -> AppResult<()>;

    /// Flush and release the destination. Called once after the last frame.
    fn close(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Per-frame metadata written by the sinks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameRecord {
    /// Frame id
    pub frame_id: u64,
    /// Stage x at trigger time
    pub x: f64,
    /// Stage y at trigger time
    pub y: f64,
    /// Stage z at trigger time
    pub z: f64,
    /// Stage theta at trigger time
    pub theta: f64,
    /// Stage f at trigger time
    pub f: f64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Mean pixel value
    pub mean: f64,
    /// Camera timestamp
    pub timestamp: DateTime<Utc>,
}

impl FrameRecord {
    fn new(frame: &Frame, position: &StagePosition) -> Self {
        let mean = if frame.buffer.is_empty() {
            0.0
        } else {
            frame.buffer.iter().map(|&p| f64::from(p)).sum::<f64>() / frame.buffer.len() as f64
        };
        Self {
            frame_id: frame.frame_id,
            x: position.x,
            y: position.y,
            z: position.z,
            theta: position.theta,
            f: position.f,
            width: frame.width,
            height: frame.height,
            mean,
            timestamp: frame.timestamp,
        }
    }
}

// =============================================================================
// MemorySink
// =============================================================================

/// Keeps frame records in memory. Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<FrameRecord>>>,
    closed: Arc<AtomicBool>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records written so far.
    pub fn records(&self) -> Vec<FrameRecord> {
        self.records.lock().clone()
    }

    /// Number of records written.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing was written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DataSink for MemorySink {
    fn write(&mut self, frame: &Frame, position: &StagePosition) -> AppResult<()> {
        self.records.lock().push(FrameRecord::new(frame, position));
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// JsonLinesSink
// =============================================================================

/// Writes one JSON [`FrameRecord`] per line.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: BufWriter<File>,
    written: u64,
}

impl JsonLinesSink {
    /// Create (or truncate) `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = BufWriter::new(File::create(&path)?);
        Ok(Self {
            path,
            writer,
            written: 0,
        })
    }
}

impl DataSink for JsonLinesSink {
    fn write(&mut self, frame: &Frame, position: &StagePosition) -> AppResult<()> {
        serde_json::to_writer(&mut self.writer, &FrameRecord::new(frame, position))?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    fn close(&mut self) -> AppResult<()> {
        self.writer.flush()?;
        info!(path = %self.path.display(), frames = self.written, "Frame metadata written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(frame_id: u64) -> Frame {
        Frame {
            frame_id,
            width: 2,
            height: 1,
            buffer: vec![10, 20],
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_memory_sink_shares_records() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        let position = StagePosition::new(1.0, 2.0, 3.0, 0.0, 4.0);

        writer.write(&frame(0), &position).unwrap();
        writer.close().unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].z, 3.0);
        assert_eq!(records[0].mean, 15.0);
        assert!(sink.is_closed());
    }

    #[test]
    fn test_json_lines_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.jsonl");
        let mut sink = JsonLinesSink::create(&path).unwrap();

        sink.write(&frame(0), &StagePosition::default()).unwrap();
        sink.write(&frame(1), &StagePosition::default()).unwrap();
        sink.close().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["frame_id"], 1);
    }
}
