//! Error types and handling
//!
//! Common error types used across the recorder, plus the failure-observer
//! plumbing that carries post-hoc errors out of the capture/encode path.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Recorder-wide error type
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("A recording session is already active")]
    AlreadyRecording,

    #[error("Frame write error: {0}")]
    FrameWrite(String),

    #[error("Writer fatal error: {0}")]
    WriterFatal(String),

    #[error("Failed to remove output file: {0}")]
    FileRemoval(String),

    #[error("Failed to persist recording: {0}")]
    ExternalPersistence(String),

    #[error("Pixel buffer pool exhausted")]
    Backpressure,

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RecorderError {
    /// Classification used when the error is handed to a failure observer.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecorderError::Configuration(_) => ErrorKind::Configuration,
            RecorderError::AlreadyRecording => ErrorKind::AlreadyRecording,
            RecorderError::FrameWrite(_) => ErrorKind::FrameWrite,
            RecorderError::WriterFatal(_) => ErrorKind::WriterFatal,
            RecorderError::FileRemoval(_) => ErrorKind::FileRemoval,
            RecorderError::ExternalPersistence(_) => ErrorKind::ExternalPersistence,
            RecorderError::Backpressure => ErrorKind::Backpressure,
            RecorderError::Capture(_) => ErrorKind::Capture,
            RecorderError::Io(_) | RecorderError::Serialization(_) => ErrorKind::Configuration,
        }
    }
}

/// Result type alias using RecorderError
pub type RecorderResult<T> = Result<T, RecorderError>;

/// Error kinds reported to the failure observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Configuration,
    AlreadyRecording,
    FrameWrite,
    WriterFatal,
    FileRemoval,
    ExternalPersistence,
    Backpressure,
    Capture,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ErrorKind::Configuration => "CONFIGURATION_ERROR",
            ErrorKind::AlreadyRecording => "ALREADY_RECORDING",
            ErrorKind::FrameWrite => "FRAME_WRITE_ERROR",
            ErrorKind::WriterFatal => "WRITER_FATAL_ERROR",
            ErrorKind::FileRemoval => "FILE_REMOVAL_ERROR",
            ErrorKind::ExternalPersistence => "EXTERNAL_PERSISTENCE_ERROR",
            ErrorKind::Backpressure => "BACKPRESSURE",
            ErrorKind::Capture => "CAPTURE_ERROR",
        };
        f.write_str(code)
    }
}

/// A single failure delivered to the registered observer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEvent {
    pub kind: ErrorKind,

    /// Human-readable description of what failed
    pub context: String,

    /// Index of the frame involved, for per-frame failures
    pub frame_index: Option<u64>,

    /// Wall-clock time the failure was observed
    pub at: DateTime<Utc>,
}

impl FailureEvent {
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
            frame_index: None,
            at: Utc::now(),
        }
    }

    pub fn for_frame(kind: ErrorKind, context: impl Into<String>, frame_index: u64) -> Self {
        Self {
            frame_index: Some(frame_index),
            ..Self::new(kind, context)
        }
    }

    /// Event describing `error`, classified by [`RecorderError::kind`]
    pub fn from_error(error: &RecorderError) -> Self {
        Self::new(error.kind(), error.to_string())
    }

    pub fn with_frame(mut self, frame_index: u64) -> Self {
        self.frame_index = Some(frame_index);
        self
    }
}

/// Capability registered by the caller to hear about post-hoc failures.
///
/// Called from whichever context observed the failure (encode worker,
/// control task); implementations must not block.
pub trait FailureObserver: Send + Sync {
    fn on_failure(&self, event: &FailureEvent);
}

impl<F> FailureObserver for F
where
    F: Fn(&FailureEvent) + Send + Sync,
{
    fn on_failure(&self, event: &FailureEvent) {
        self(event)
    }
}

/// Shared, swappable handle to the registered failure observer.
///
/// Every report is also logged, so failures are visible even when no
/// observer is registered.
#[derive(Clone, Default)]
pub struct FailureReporter {
    observer: Arc<RwLock<Option<Arc<dyn FailureObserver>>>>,
}

impl FailureReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_observer(&self, observer: Option<Arc<dyn FailureObserver>>) {
        *self.observer.write() = observer;
    }

    pub fn has_observer(&self) -> bool {
        self.observer.read().is_some()
    }

    /// Deliver one failure event
    pub fn report(&self, event: FailureEvent) {
        tracing::warn!(kind = %event.kind, frame = ?event.frame_index, "{}", event.context);

        // Clone out of the lock so a slow observer never blocks registration
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_failure(&event);
        }
    }
}

impl fmt::Debug for FailureReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureReporter")
            .field("has_observer", &self.has_observer())
            .finish()
    }
}
