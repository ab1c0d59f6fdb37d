//! Screen recorder
//!
//! Captures the screen on every display tick, composites an optional text
//! label and drawing hook on top, and encodes the frames into a video file.
//! Platform capabilities (screen snapshots, tick source, writer, media
//! library) are injected through [`RecorderDeps`].

pub mod capture;
pub mod library;
pub mod pipeline;
pub mod recorder;
pub mod utils;

#[cfg(test)]
mod testing;

pub use recorder::{RecorderConfig, RecorderController, RecorderDeps, StopOutcome};
pub use utils::error::{RecorderError, RecorderResult};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the default tracing subscriber. `RUST_LOG` overrides the filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "screen_recorder=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
