//! Encoding pipeline
//!
//! Pooled pixel buffers, the encode queue and the video writers that turn
//! captured frames into a container on disk.

pub mod ffmpeg;
pub mod pool;
pub mod queue;
pub mod types;
pub mod writer;

pub use ffmpeg::{FfmpegWriter, FfmpegWriterFactory};
pub use pool::{PixelBuffer, PixelBufferPool};
pub use queue::{EncodeQueue, QueueSender};
pub use types::{
    Frame, PipelineStats, PixelFormat, RecordingOutput, StatsSnapshot, WriteError, WriteResult,
    WriterOutput, WriterSettings,
};
pub use writer::{VideoWriter, VideoWriterFactory};
