//! Video writer abstraction
//!
//! The encode worker is the only caller of these methods, always from the
//! same thread and never concurrently.

use super::types::{WriteResult, WriterOutput, WriterSettings};
use crate::utils::error::RecorderResult;
use std::time::Duration;

/// Owns one output container from session start to finalization
pub trait VideoWriter: Send {
    /// Open the container and begin the session
    fn start_session(&mut self) -> WriteResult<()>;

    /// Append one frame of `settings.pixel_format` pixels at `pts`
    fn append(&mut self, pixels: &[u8], pts: Duration) -> WriteResult<()>;

    /// First phase of finalization: no more input will arrive
    fn mark_input_finished(&mut self) -> WriteResult<()>;

    /// Second phase: block until the encoder has flushed everything, at most
    /// `timeout`
    fn wait_for_completion(&mut self, timeout: Duration) -> WriteResult<()>;

    /// Close the container and report what was produced
    fn close(&mut self) -> WriteResult<WriterOutput>;

    /// Abandon the session and discard partial output
    fn cancel(&mut self);
}

/// Builds one writer per recording session
pub trait VideoWriterFactory: Send + Sync {
    /// Configuration errors surface synchronously from `start`
    fn create(&self, settings: &WriterSettings) -> RecorderResult<Box<dyn VideoWriter>>;
}
