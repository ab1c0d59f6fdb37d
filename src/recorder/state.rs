//! Recording state management
//!
//! Defines the writer state machine, quality presets, session tracking, the
//! recorder configuration and recording events.

use crate::pipeline::types::RecordingOutput;
use crate::utils::error::{RecorderError, RecorderResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Longest a capture may block waiting for a pixel buffer
pub const MAX_ACQUIRE_TIMEOUT_MS: u64 = 1_000;

/// Longest finalization may wait for the encoder
pub const MAX_FINISH_TIMEOUT_MS: u64 = 120_000;

/// Current state of the writer pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterState {
    /// No recording in progress
    #[default]
    Idle,
    /// Output location and writer are being prepared
    Configuring,
    /// Frames are being captured and written
    Writing,
    /// Stop requested, queue draining and writer finalizing
    Finishing,
    /// Output container finalized
    Finished,
    /// Unrecoverable writer error
    Failed,
}

impl WriterState {
    /// Whether a session currently owns the writer
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            WriterState::Configuring | WriterState::Writing | WriterState::Finishing
        )
    }
}

/// Video quality presets
///
/// Raw values are persisted in settings and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum QualityPreset {
    VeryLow = 0,
    Low = 1,
    #[default]
    Medium = 2,
    High = 4,
    VeryHigh = 8,
}

impl QualityPreset {
    /// Scale applied to the captured pixel resolution
    pub fn scale_factor(&self) -> f64 {
        match self {
            QualityPreset::VeryLow => 0.25,
            QualityPreset::Low => 0.5,
            QualityPreset::Medium => 0.75,
            QualityPreset::High | QualityPreset::VeryHigh => 1.0,
        }
    }

    /// Target bits per output pixel per second
    pub fn bits_per_pixel(&self) -> f64 {
        match self {
            QualityPreset::VeryLow => 2.0,
            QualityPreset::Low => 4.0,
            QualityPreset::Medium => 7.0,
            // 11.4 bits per pixel is the long-standing default for screen content
            QualityPreset::High => 11.4,
            QualityPreset::VeryHigh => 18.0,
        }
    }

    /// Average bitrate in bits per second for the given output size
    pub fn bitrate(&self, width: u32, height: u32) -> u64 {
        (width as f64 * height as f64 * self.bits_per_pixel()) as u64
    }

    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(QualityPreset::VeryLow),
            1 => Some(QualityPreset::Low),
            2 => Some(QualityPreset::Medium),
            4 => Some(QualityPreset::High),
            8 => Some(QualityPreset::VeryHigh),
            _ => None,
        }
    }
}

/// Information about the active recording session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSession {
    /// Unique session ID
    pub id: Uuid,

    /// Where the container is being written
    pub output_path: PathBuf,

    /// Quality fixed for the whole session
    pub quality: QualityPreset,

    /// Output resolution after scaling
    pub width: u32,
    pub height: u32,

    /// Wall-clock start of the session
    pub started_at: DateTime<Utc>,

    /// State at the time this snapshot was taken
    pub state: WriterState,
}

impl RecordingSession {
    /// Create a new session starting now
    pub fn new(output_path: PathBuf, quality: QualityPreset, width: u32, height: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            output_path,
            quality,
            width,
            height,
            started_at: Utc::now(),
            state: WriterState::Configuring,
        }
    }

    /// Milliseconds elapsed since the session started
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }
}

/// Configuration for the recorder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecorderConfig {
    /// Output container location; cannot change while recording
    pub output_path: PathBuf,

    /// Quality used by `start`
    pub quality: QualityPreset,

    /// Capture cadence; `None` uses the display refresh rate
    pub frame_rate: Option<u32>,

    /// Save finished recordings to the media library
    pub save_to_library: bool,

    /// Maximum number of pixel buffers in flight
    pub pool_capacity: usize,

    /// How long a capture may wait for a free pixel buffer
    pub acquire_timeout_ms: u64,

    /// How long finalization may wait for the encoder
    pub finish_timeout_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_path: std::env::temp_dir().join("screen-capture.mp4"),
            quality: QualityPreset::default(),
            frame_rate: None,
            save_to_library: false,
            pool_capacity: 4,
            acquire_timeout_ms: 20,
            finish_timeout_ms: 10_000,
        }
    }
}

impl RecorderConfig {
    /// Parse a configuration from JSON, filling missing fields with defaults
    pub fn from_json(json: &str) -> RecorderResult<Self> {
        let config: RecorderConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> RecorderResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> RecorderResult<()> {
        if self.output_path.as_os_str().is_empty() {
            return Err(RecorderError::Configuration(
                "Output path must not be empty".to_string(),
            ));
        }
        if self.pool_capacity == 0 {
            return Err(RecorderError::Configuration(
                "Pixel buffer pool capacity must be at least 1".to_string(),
            ));
        }
        if matches!(self.frame_rate, Some(0)) {
            return Err(RecorderError::Configuration(
                "Frame rate must be greater than zero".to_string(),
            ));
        }
        if self.acquire_timeout_ms > MAX_ACQUIRE_TIMEOUT_MS {
            return Err(RecorderError::Configuration(format!(
                "Buffer acquire timeout {}ms exceeds the {}ms limit",
                self.acquire_timeout_ms, MAX_ACQUIRE_TIMEOUT_MS
            )));
        }
        if self.finish_timeout_ms > MAX_FINISH_TIMEOUT_MS {
            return Err(RecorderError::Configuration(format!(
                "Finish timeout {}ms exceeds the {}ms limit",
                self.finish_timeout_ms, MAX_FINISH_TIMEOUT_MS
            )));
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn finish_timeout(&self) -> Duration {
        Duration::from_millis(self.finish_timeout_ms)
    }
}

/// How a stop request ended, delivered to the completion callback
#[derive(Debug, Clone)]
pub enum StopOutcome {
    /// No session was active; nothing changed
    NotRecording,
    /// The container was finalized
    Finished(RecordingOutput),
    /// The session ended because of an unrecoverable error
    Failed(String),
}

impl StopOutcome {
    pub fn output(&self) -> Option<&RecordingOutput> {
        match self {
            StopOutcome::Finished(output) => Some(output),
            _ => None,
        }
    }
}

/// Events emitted during recording
#[derive(Debug, Clone)]
pub enum RecordingEvent {
    /// Writer state changed
    StateChanged(WriterState),
    /// A session began writing
    Started(RecordingSession),
    /// A session ended, either on request or after a fatal error
    Stopped(StopOutcome),
    /// Post-hoc error worth surfacing to listeners
    Error(String),
}

/// Writer state shared between the controller and the encode worker.
///
/// Every change is broadcast as [`RecordingEvent::StateChanged`].
pub struct StateCell {
    state: Mutex<WriterState>,
    events: broadcast::Sender<RecordingEvent>,
}

impl StateCell {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(100);
        Self {
            state: Mutex::new(WriterState::Idle),
            events,
        }
    }

    pub fn get(&self) -> WriterState {
        *self.state.lock()
    }

    /// Move to `next`, returning the previous state
    pub fn set(&self, next: WriterState) -> WriterState {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous != next {
            tracing::debug!("Writer state {:?} -> {:?}", previous, next);
            self.emit(RecordingEvent::StateChanged(next));
        }
        previous
    }

    /// Move to `next` only if the current state satisfies `allowed`
    pub fn transition<F>(&self, allowed: F, next: WriterState) -> Result<WriterState, WriterState>
    where
        F: FnOnce(WriterState) -> bool,
    {
        let mut state = self.state.lock();
        let previous = *state;
        if !allowed(previous) {
            return Err(previous);
        }
        *state = next;
        drop(state);

        if previous != next {
            tracing::debug!("Writer state {:?} -> {:?}", previous, next);
            self.emit(RecordingEvent::StateChanged(next));
        }
        Ok(previous)
    }

    pub fn emit(&self, event: RecordingEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.events.subscribe()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
