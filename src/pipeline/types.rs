//! Pipeline types
//!
//! Frames, writer settings, writer errors and the shared pipeline counters.

use super::pool::PixelBuffer;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Pixel layouts understood by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit BGRA, the native layout of screen snapshots
    Bgra,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Bgra => 4,
        }
    }

    /// Name of this format in FFmpeg's `-pixel_format` option
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelFormat::Bgra => "bgra",
        }
    }

    /// Bytes needed for one frame of the given size
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

/// One captured frame on its way to the writer
#[derive(Debug)]
pub struct Frame {
    /// Pooled pixels; returned to the pool when the frame is dropped
    pub buffer: PixelBuffer,

    /// Presentation time relative to the first tick of the session
    pub pts: Duration,

    /// Sequence number assigned at capture
    pub index: u64,
}

impl Frame {
    pub fn pixels(&self) -> &[u8] {
        self.buffer.as_slice()
    }
}

/// Everything a writer needs to configure an output container
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterSettings {
    pub output_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Average bitrate in bits per second
    pub bitrate: u64,
    pub pixel_format: PixelFormat,
}

impl WriterSettings {
    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }
}

/// Result of a successfully closed writer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterOutput {
    pub path: PathBuf,
    /// Frames accepted by the writer
    pub frames_written: u64,
    /// Frames in the container, including repeats that fill timing gaps
    pub frames_encoded: u64,
    /// Size of the finished container
    pub bytes: u64,
}

/// Summary of a finished recording
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingOutput {
    pub session_id: Uuid,
    pub output_path: PathBuf,
    pub frames_written: u64,
    /// Frames in the container, including gap-filling repeats
    pub frames_encoded: u64,
    /// Frames captured but never written (write failures, out-of-order)
    pub frames_dropped: u64,
    /// Ticks skipped because a capture was still running
    pub ticks_coalesced: u64,
    pub duration_ms: u64,
    pub bytes: u64,
}

/// Writer failures, split by whether the session can continue
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// This frame was lost; later frames may still be written
    #[error("{0}")]
    Transient(String),

    /// The output cannot be continued
    #[error("{0}")]
    Fatal(String),
}

impl WriteError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, WriteError::Fatal(_))
    }
}

/// Result type alias for writer operations
pub type WriteResult<T> = Result<T, WriteError>;

/// Counters shared by every stage of one session
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub ticks: AtomicU64,
    pub coalesced: AtomicU64,
    pub backpressure_drops: AtomicU64,
    pub capture_failures: AtomicU64,
    pub frames_enqueued: AtomicU64,
    pub frames_written: AtomicU64,
    pub write_failures: AtomicU64,
    pub out_of_order: AtomicU64,
    pub discarded: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub ticks: u64,
    pub coalesced: u64,
    pub backpressure_drops: u64,
    pub capture_failures: u64,
    pub frames_enqueued: u64,
    pub frames_written: u64,
    pub write_failures: u64,
    pub out_of_order: u64,
    pub discarded: u64,
}

impl StatsSnapshot {
    /// Frames that were admitted to the queue but never written
    pub fn frames_dropped(&self) -> u64 {
        self.write_failures + self.out_of_order + self.discarded
    }
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            backpressure_drops: self.backpressure_drops.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            frames_enqueued: self.frames_enqueued.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}
