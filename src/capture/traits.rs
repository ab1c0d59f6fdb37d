//! Capture trait definitions
//!
//! Platform-agnostic capabilities the capture path consumes. Platform code
//! (or a test double) implements these and hands them to the recorder.

use super::bitmap::BitmapContext;
use crate::utils::error::RecorderError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Information about the display being recorded
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayInfo {
    /// Unique display ID
    pub id: u32,

    /// Display name
    pub name: String,

    /// Width in points
    pub width: u32,

    /// Height in points
    pub height: u32,

    /// Scale factor (e.g., 2.0 for Retina)
    pub scale_factor: f64,

    /// Whether this is the primary display
    pub is_primary: bool,

    /// Refresh rate in Hz (if available)
    pub refresh_rate: Option<u32>,
}

impl DisplayInfo {
    pub fn new(width: u32, height: u32, scale_factor: f64) -> Self {
        Self {
            id: 0,
            name: "Main Display".to_string(),
            width,
            height,
            scale_factor,
            is_primary: true,
            refresh_rate: None,
        }
    }

    /// Size of the display in physical pixels
    pub fn pixel_size(&self) -> (u32, u32) {
        (
            (self.width as f64 * self.scale_factor).round() as u32,
            (self.height as f64 * self.scale_factor).round() as u32,
        )
    }
}

/// Errors from the screen snapshot capability
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Screen content unavailable: {0}")]
    Unavailable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

impl From<CaptureError> for RecorderError {
    fn from(error: CaptureError) -> Self {
        RecorderError::Capture(error.to_string())
    }
}

/// Renders the current on-screen content into a target context.
///
/// Called synchronously from the capture context once per admitted tick.
/// `scale` maps display points to context pixels. Must not retain the
/// context past the call.
pub trait ScreenSnapshot: Send + Sync {
    fn render(&self, context: &mut BitmapContext<'_>, scale: f64) -> Result<(), CaptureError>;
}

/// Caller-supplied drawing hook run on every produced frame.
///
/// Draws on top of the screen content (and label). Must return well within
/// the tick period, otherwise later ticks are coalesced.
pub trait OverlayDrawer: Send + Sync {
    fn draw(&self, context: &mut BitmapContext<'_>);
}

impl<F> OverlayDrawer for F
where
    F: Fn(&mut BitmapContext<'_>) + Send + Sync,
{
    fn draw(&self, context: &mut BitmapContext<'_>) {
        self(context)
    }
}

/// Supplies a text label rendered into the frame before the drawing hook
pub trait OverlayText: Send + Sync {
    fn text(&self) -> Option<String>;
}

impl<F> OverlayText for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn text(&self) -> Option<String> {
        self()
    }
}
