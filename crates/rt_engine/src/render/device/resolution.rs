//! Scene resolution presets and letterboxing
//!
//! The scene renders at one of a fixed set of resolutions independent of the
//! window size; the post pass scales it into the largest rectangle of the
//! output that keeps the preset's aspect ratio.

use serde::{Deserialize, Serialize};

use crate::render::api::{Rect, Viewport};

/// A scene rendering resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Resolution {
    /// Create a resolution
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Selectable scene resolutions
pub const RESOLUTION_OPTIONS: [Resolution; 8] = [
    Resolution::new(800, 600),
    Resolution::new(1200, 900),
    Resolution::new(1280, 720),
    Resolution::new(1920, 1080),
    Resolution::new(1920, 1200),
    Resolution::new(2560, 1440),
    Resolution::new(3440, 1440),
    Resolution::new(3840, 2160),
];

/// Preset selected at start-up (1280x720)
pub const DEFAULT_RESOLUTION_INDEX: usize = 2;

/// Index into [`RESOLUTION_OPTIONS`] that wraps in both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolutionSelector {
    index: usize,
}

impl ResolutionSelector {
    /// Selector at `index`, wrapped into range
    pub const fn new(index: usize) -> Self {
        Self { index: index % RESOLUTION_OPTIONS.len() }
    }

    /// Current index
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Current preset
    pub const fn current(&self) -> Resolution {
        RESOLUTION_OPTIONS[self.index]
    }

    /// Step to the next preset, wrapping to the first
    pub fn increase(&mut self) -> Resolution {
        self.index = (self.index + 1) % RESOLUTION_OPTIONS.len();
        self.current()
    }

    /// Step to the previous preset, wrapping to the last
    pub fn decrease(&mut self) -> Resolution {
        self.index = self.index.checked_sub(1).unwrap_or(RESOLUTION_OPTIONS.len() - 1);
        self.current()
    }
}

impl Default for ResolutionSelector {
    fn default() -> Self {
        Self::new(DEFAULT_RESOLUTION_INDEX)
    }
}

/// Letterboxed viewport and scissor for scaling `scene` onto an output of `output_width` x `output_height`
pub fn post_view_and_scissor(scene: Resolution, output_width: u32, output_height: u32) -> (Viewport, Rect) {
    let output_width = output_width.max(1) as f32;
    let output_height = output_height.max(1) as f32;
    let width_ratio = scene.width as f32 / output_width;
    let height_ratio = scene.height as f32 / output_height;

    // Fit the tighter axis, shrink the other one
    let (x, y) = if width_ratio < height_ratio {
        (width_ratio / height_ratio, 1.0)
    } else {
        (1.0, height_ratio / width_ratio)
    };

    let viewport = Viewport {
        top_left_x: output_width * (1.0 - x) / 2.0,
        top_left_y: output_height * (1.0 - y) / 2.0,
        width: x * output_width,
        height: y * output_height,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = Rect::new(
        viewport.top_left_x as i32,
        viewport.top_left_y as i32,
        (viewport.top_left_x + viewport.width) as i32,
        (viewport.top_left_y + viewport.height) as i32,
    );
    (viewport, scissor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Eight increases walk the whole table and land back on the start
    #[test]
    fn test_increase_wraps() {
        let mut selector = ResolutionSelector::default();
        assert_eq!(selector.current(), Resolution::new(1280, 720));
        for _ in 0..RESOLUTION_OPTIONS.len() {
            selector.increase();
        }
        assert_eq!(selector.index(), DEFAULT_RESOLUTION_INDEX);
    }

    #[test]
    fn test_decrease_wraps_to_last() {
        let mut selector = ResolutionSelector::new(0);
        assert_eq!(selector.decrease(), Resolution::new(3840, 2160));
        assert_eq!(selector.index(), 7);
        assert_eq!(selector.decrease(), Resolution::new(3440, 1440));
    }

    #[test]
    fn test_new_wraps_out_of_range_index() {
        assert_eq!(ResolutionSelector::new(10).index(), 2);
    }

    /// Same aspect ratio fills the output exactly
    #[test]
    fn test_matching_aspect_fills_output() {
        let (viewport, scissor) = post_view_and_scissor(Resolution::new(1280, 720), 1920, 1080);
        assert_relative_eq!(viewport.top_left_x, 0.0);
        assert_relative_eq!(viewport.width, 1920.0);
        assert_relative_eq!(viewport.height, 1080.0);
        assert_eq!(scissor, Rect::new(0, 0, 1920, 1080));
    }

    /// 4:3 scene on a 16:9 output is pillarboxed
    #[test]
    fn test_pillarbox() {
        let (viewport, scissor) = post_view_and_scissor(Resolution::new(800, 600), 1920, 1080);
        assert_relative_eq!(viewport.height, 1080.0);
        assert_relative_eq!(viewport.width, 1440.0, epsilon = 1e-3);
        assert_relative_eq!(viewport.top_left_x, 240.0, epsilon = 1e-3);
        assert_eq!(scissor, Rect::new(240, 0, 1680, 1080));
    }

    /// Ultra-wide scene on a 16:10 output is letterboxed
    #[test]
    fn test_letterbox() {
        let (viewport, _) = post_view_and_scissor(Resolution::new(3440, 1440), 1920, 1200);
        assert_relative_eq!(viewport.width, 1920.0);
        assert!(viewport.height < 1200.0);
        assert_relative_eq!(viewport.top_left_y * 2.0 + viewport.height, 1200.0, epsilon = 1e-3);
    }
}
