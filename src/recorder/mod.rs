//! Recording control
//!
//! The controller that owns the session lifecycle, plus the writer state
//! machine, configuration and events it publishes.

pub mod controller;
pub mod state;

pub use controller::{RecorderController, RecorderDeps, StopCallback};
pub use state::{
    QualityPreset, RecorderConfig, RecordingEvent, RecordingSession, StopOutcome, WriterState,
};
