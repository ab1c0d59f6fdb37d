//! Tick sources
//!
//! A tick source drives capture at the display cadence. Ticks carry the
//! instant they were observed so presentation times do not depend on how
//! quickly the capture work gets scheduled.

use crate::utils::error::{RecorderError, RecorderResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Callback run once per tick
pub type TickCallback = Arc<dyn Fn(Instant) + Send + Sync>;

/// Periodic signal aligned to the display refresh
pub trait TickSource: Send {
    /// Begin delivering ticks to `on_tick`
    fn start(&mut self, on_tick: TickCallback) -> RecorderResult<()>;

    /// Stop delivering ticks. A tick already being delivered may still run.
    fn stop(&mut self);

    /// Nominal ticks per second
    fn frame_rate(&self) -> u32;
}

/// Fallback cadence when the display does not report its refresh rate
pub const DEFAULT_FRAME_RATE: u32 = 60;

/// Tick source backed by a tokio interval.
///
/// Each tick's callback runs on the blocking pool so a slow capture never
/// stalls the timer; overlapping captures are resolved by the frame source.
pub struct IntervalTickSource {
    frame_rate: u32,
    runtime: Handle,
    task: Option<JoinHandle<()>>,
}

impl IntervalTickSource {
    pub fn new(frame_rate: u32, runtime: Handle) -> Self {
        Self {
            frame_rate: frame_rate.max(1),
            runtime,
            task: None,
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate as f64)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl TickSource for IntervalTickSource {
    fn start(&mut self, on_tick: TickCallback) -> RecorderResult<()> {
        if self.is_running() {
            return Err(RecorderError::Configuration(
                "Tick source already running".to_string(),
            ));
        }

        let period = self.period();
        let runtime = self.runtime.clone();
        tracing::debug!("Starting tick source at {}fps ({:?})", self.frame_rate, period);

        self.task = Some(self.runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                let tick = interval.tick().await.into_std();
                let on_tick = Arc::clone(&on_tick);
                runtime.spawn_blocking(move || on_tick(tick));
            }
        }));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!("Tick source stopped");
        }
    }

    fn frame_rate(&self) -> u32 {
        self.frame_rate
    }
}

impl Drop for IntervalTickSource {
    fn drop(&mut self) {
        self.stop();
    }
}
