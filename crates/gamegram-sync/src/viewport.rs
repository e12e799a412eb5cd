use serde::{Deserialize, Serialize};

/// Scroll geometry reported by the presentation layer, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScrollPosition {
    pub offset: f64,
    pub viewport_height: f64,
    pub content_height: f64,
}

impl ScrollPosition {
    pub fn distance_from_bottom(&self) -> f64 {
        (self.content_height - self.offset - self.viewport_height).max(0.0)
    }
}

/// Instructions for the presentation layer to move the scroll position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "offset", rename_all = "snake_case")]
pub enum ScrollDirective {
    ScrollToBottom,
    /// Absolute offset that keeps previously visible content in place after
    /// older messages were prepended above it.
    ScrollTo(f64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScrollUpdate {
    pub at_top: bool,
    pub directive: Option<ScrollDirective>,
}

/// Bottom-of-view tracking, auto-scroll and unread accounting.
#[derive(Debug)]
pub struct ViewportTracker {
    bottom_threshold: f64,
    top_threshold: f64,
    at_bottom: bool,
    unviewed: usize,
    last: Option<ScrollPosition>,
    /// Content height last reported before older messages were prepended.
    anchor: Option<f64>,
}

impl ViewportTracker {
    pub fn new(bottom_threshold: f64, top_threshold: f64) -> Self {
        Self {
            bottom_threshold,
            top_threshold,
            at_bottom: true,
            unviewed: 0,
            last: None,
            anchor: None,
        }
    }

    pub fn is_at_bottom(&self) -> bool {
        self.at_bottom
    }

    pub fn unviewed_count(&self) -> usize {
        self.unviewed
    }

    pub fn on_scroll(&mut self, pos: ScrollPosition) -> ScrollUpdate {
        let mut update = ScrollUpdate::default();

        if let Some(before) = self.anchor {
            if pos.content_height != before {
                self.anchor = None;
                let target = pos.offset + (pos.content_height - before);
                update.directive = Some(ScrollDirective::ScrollTo(target));
                self.last = Some(ScrollPosition { offset: target, ..pos });
                return update;
            }
        }

        let now_at_bottom = pos.distance_from_bottom() <= self.bottom_threshold;
        if now_at_bottom {
            self.unviewed = 0;
        }
        self.at_bottom = now_at_bottom;
        self.last = Some(pos);
        update.at_top =
            pos.offset <= self.top_threshold && pos.content_height > pos.viewport_height;
        update
    }

    /// A record grew the live end of the timeline.
    pub fn on_arrival(&mut self, authored_by_me: bool) -> Option<ScrollDirective> {
        if authored_by_me {
            return Some(self.scroll_to_bottom());
        }
        if self.at_bottom {
            return Some(ScrollDirective::ScrollToBottom);
        }
        self.unviewed += 1;
        None
    }

    /// Idempotent: repeated calls leave the same state.
    pub fn scroll_to_bottom(&mut self) -> ScrollDirective {
        self.at_bottom = true;
        self.unviewed = 0;
        self.anchor = None;
        ScrollDirective::ScrollToBottom
    }

    /// Older records were just committed above the loaded ones. The last
    /// reported height predates them, so the next report with a different
    /// height is corrected by the difference.
    pub fn on_prepended(&mut self) {
        if let Some(last) = self.last {
            self.anchor = Some(last.content_height);
        }
    }
}
