//! "Stick to bottom" viewport tracking.

use crate::log::MessageLog;

/// Distance (in the consumer's scroll units) within which the viewport still
/// counts as resting on the newest message. Absorbs fractional measurements.
pub const PIN_TOLERANCE: f64 = 1.0;

/// A scroll measurement reported by the rendering side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollPosition {
    pub offset: f64,
    pub max_offset: f64,
}

impl ScrollPosition {
    pub fn new(offset: f64, max_offset: f64) -> Self {
        Self { offset, max_offset }
    }

    /// Build from DOM-style extents: scroll top, total content height and
    /// visible height.
    pub fn from_extents(scroll_top: f64, content_height: f64, viewport_height: f64) -> Self {
        Self {
            offset: scroll_top,
            max_offset: (content_height - viewport_height).max(0.0),
        }
    }

    pub fn distance_to_end(&self) -> f64 {
        (self.max_offset - self.offset).abs()
    }
}

/// Tracks whether the viewport is pinned to the latest message.
///
/// Only scroll signals change the pinned flag; message arrival only reads it.
#[derive(Debug, Clone)]
pub struct FollowTracker {
    pinned: bool,
}

impl Default for FollowTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FollowTracker {
    /// New channel views open scrolled to the newest message.
    pub fn new() -> Self {
        Self { pinned: true }
    }

    pub fn on_scroll(&mut self, position: ScrollPosition) {
        self.pinned = position.distance_to_end() < PIN_TOLERANCE;
    }

    /// Whether the consumer should move the viewport to the newest message
    /// after the log changed.
    pub fn on_messages_changed(&self, _log: &MessageLog) -> bool {
        self.pinned
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}
