//! Frame compositor
//!
//! Draws the optional text label and the caller's overlay hook on top of a
//! captured frame. The hooks can be swapped at any time, including while a
//! session is running; a swap takes effect on the next frame.

use super::bitmap::{BitmapContext, Color};
use super::traits::{OverlayDrawer, OverlayText};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Margin between the label and the frame edge, in pixels
const LABEL_MARGIN: i32 = 8;

/// Padding inside the label backdrop, in pixels
const LABEL_PADDING: u32 = 4;

/// Backdrop behind the label so it stays readable on any content
const LABEL_BACKDROP: Color = Color::rgba(0, 0, 0, 160);

#[derive(Default)]
struct OverlayHooks {
    drawer: Option<Arc<dyn OverlayDrawer>>,
    text: Option<Arc<dyn OverlayText>>,
}

/// Applies the label and drawing hook to every produced frame
#[derive(Clone, Default)]
pub struct FrameCompositor {
    hooks: Arc<RwLock<OverlayHooks>>,
}

impl FrameCompositor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_drawer(&self, drawer: Option<Arc<dyn OverlayDrawer>>) {
        self.hooks.write().drawer = drawer;
    }

    pub fn set_text(&self, text: Option<Arc<dyn OverlayText>>) {
        self.hooks.write().text = text;
    }

    pub fn has_drawer(&self) -> bool {
        self.hooks.read().drawer.is_some()
    }

    /// Glyph scale for the label at a given frame height
    pub fn label_scale(frame_height: u32) -> u32 {
        (frame_height / 240).max(1)
    }

    /// Draw the label, then the hook, over the already-rendered screen content
    pub fn compose(&self, context: &mut BitmapContext<'_>) {
        let (drawer, text) = {
            let hooks = self.hooks.read();
            (hooks.drawer.clone(), hooks.text.clone())
        };

        if let Some(label) = text.and_then(|t| t.text()).filter(|s| !s.is_empty()) {
            Self::draw_label(context, &label);
        }

        if let Some(drawer) = drawer {
            drawer.draw(context);
        }
    }

    fn draw_label(context: &mut BitmapContext<'_>, label: &str) {
        let scale = Self::label_scale(context.height());
        let (text_width, text_height) = BitmapContext::measure_text(label, scale);
        let padding = LABEL_PADDING * scale;

        context.fill_rect(
            LABEL_MARGIN,
            LABEL_MARGIN,
            text_width + padding * 2,
            text_height + padding * 2,
            LABEL_BACKDROP,
        );
        context.draw_text(
            label,
            LABEL_MARGIN + padding as i32,
            LABEL_MARGIN + padding as i32,
            scale,
            Color::WHITE,
        );
    }
}

impl fmt::Debug for FrameCompositor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks = self.hooks.read();
        f.debug_struct("FrameCompositor")
            .field("drawer", &hooks.drawer.is_some())
            .field("text", &hooks.text.is_some())
            .finish()
    }
}
