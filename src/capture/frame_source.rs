//! Frame source
//!
//! Turns ticks into composited frames. Only one capture runs at a time: a
//! tick that arrives while the previous capture is still running is
//! coalesced (skipped) rather than queued. Frames are handed to the sink
//! before the capture lock is released, so once [`FrameSource::close`]
//! returns no further frame can reach the sink.

use super::bitmap::Color;
use super::compositor::FrameCompositor;
use super::traits::{CaptureError, DisplayInfo, ScreenSnapshot};
use crate::pipeline::pool::PixelBufferPool;
use crate::pipeline::types::{Frame, PipelineStats, PixelFormat};
use crate::recorder::state::QualityPreset;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Output resolution of a session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputGeometry {
    pub width: u32,
    pub height: u32,
    /// Display points to output pixels
    pub scale: f64,
}

impl OutputGeometry {
    /// Display size in pixels scaled by the quality preset, rounded down to
    /// even dimensions (H.264 with 4:2:0 chroma requires it)
    pub fn for_display(display: &DisplayInfo, quality: QualityPreset) -> Self {
        let scale = display.scale_factor * quality.scale_factor();
        let even = |points: u32| {
            let pixels = (points as f64 * scale).floor() as u32;
            (pixels & !1).max(2)
        };
        Self {
            width: even(display.width),
            height: even(display.height),
            scale,
        }
    }
}

/// What happened to a tick
#[derive(Debug)]
pub enum CaptureOutcome {
    /// A frame was produced and handed to the sink
    Captured { index: u64, pts: Duration },
    /// A capture was already running; this tick was skipped
    Coalesced,
    /// The source no longer admits frames
    Closed,
    /// No pixel buffer became free in time
    Backpressure,
    /// The snapshot provider failed
    Failed(CaptureError),
}

struct CaptureClock {
    first_tick: Option<Instant>,
    next_index: u64,
}

/// Produces frames from ticks for one session
pub struct FrameSource {
    snapshot: Arc<dyn ScreenSnapshot>,
    compositor: FrameCompositor,
    pool: PixelBufferPool,
    geometry: OutputGeometry,
    clock: Mutex<CaptureClock>,
    admitting: AtomicBool,
    stats: Arc<PipelineStats>,
    acquire_timeout: Duration,
}

impl FrameSource {
    pub fn new(
        snapshot: Arc<dyn ScreenSnapshot>,
        compositor: FrameCompositor,
        geometry: OutputGeometry,
        pool_capacity: usize,
        acquire_timeout: Duration,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            snapshot,
            compositor,
            pool: PixelBufferPool::new(
                geometry.width,
                geometry.height,
                PixelFormat::Bgra,
                pool_capacity,
            ),
            geometry,
            clock: Mutex::new(CaptureClock {
                first_tick: None,
                next_index: 0,
            }),
            admitting: AtomicBool::new(true),
            stats,
            acquire_timeout,
        }
    }

    pub fn geometry(&self) -> OutputGeometry {
        self.geometry
    }

    pub fn pool(&self) -> &PixelBufferPool {
        &self.pool
    }

    pub fn is_admitting(&self) -> bool {
        self.admitting.load(Ordering::SeqCst)
    }

    /// Capture one frame for the tick observed at `tick` and pass it to
    /// `deliver`.
    ///
    /// The frame's presentation time is the tick's distance from the first
    /// captured tick, truncated to whole milliseconds.
    pub fn capture<F>(&self, tick: Instant, deliver: F) -> CaptureOutcome
    where
        F: FnOnce(Frame),
    {
        PipelineStats::bump(&self.stats.ticks);

        let Some(mut clock) = self.clock.try_lock() else {
            PipelineStats::bump(&self.stats.coalesced);
            tracing::trace!("Tick coalesced, capture still in progress");
            return CaptureOutcome::Coalesced;
        };

        if !self.is_admitting() {
            return CaptureOutcome::Closed;
        }

        let mut buffer = match self.pool.acquire(self.acquire_timeout) {
            Ok(buffer) => buffer,
            Err(_) => {
                PipelineStats::bump(&self.stats.backpressure_drops);
                tracing::debug!("No pixel buffer free within {:?}", self.acquire_timeout);
                return CaptureOutcome::Backpressure;
            }
        };

        {
            let mut context = buffer.context();
            context.clear(Color::BLACK);
            if let Err(e) = self.snapshot.render(&mut context, self.geometry.scale) {
                PipelineStats::bump(&self.stats.capture_failures);
                return CaptureOutcome::Failed(e);
            }
            self.compositor.compose(&mut context);
        }

        let first = *clock.first_tick.get_or_insert(tick);
        let elapsed = tick.saturating_duration_since(first);
        let pts = Duration::from_millis(elapsed.as_millis() as u64);

        let index = clock.next_index;
        clock.next_index += 1;

        deliver(Frame { buffer, pts, index });
        CaptureOutcome::Captured { index, pts }
    }

    /// Stop admitting frames and wait for an in-flight capture to finish
    pub fn close(&self) {
        self.admitting.store(false, Ordering::SeqCst);
        // Taking the lock waits out any capture that passed the admit check
        drop(self.clock.lock());
    }
}
