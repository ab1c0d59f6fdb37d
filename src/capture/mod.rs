//! Screen capture
//!
//! Tick sources, the frame source that turns ticks into composited frames,
//! and the drawing surface overlays render into.

pub mod bitmap;
pub mod compositor;
pub mod frame_source;
pub mod ticker;
pub mod traits;

pub use bitmap::{BitmapContext, Color};
pub use compositor::FrameCompositor;
pub use frame_source::{CaptureOutcome, FrameSource, OutputGeometry};
pub use ticker::{IntervalTickSource, TickCallback, TickSource};
pub use traits::{CaptureError, DisplayInfo, OverlayDrawer, OverlayText, ScreenSnapshot};
