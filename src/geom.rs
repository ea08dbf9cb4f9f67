//! Rectangles and dirty-region accumulation.

/// An axis-aligned rectangle in logical screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Clip away any portion with negative coordinates and anything past
    /// the given screen bounds. Returns `None` when nothing remains.
    pub fn clipped(mut self, screen_width: u32, screen_height: u32) -> Option<Rect> {
        if self.x < 0 {
            let off = (-self.x) as u32;
            if off >= self.width {
                return None;
            }
            self.x = 0;
            self.width -= off;
        }
        if self.y < 0 {
            let off = (-self.y) as u32;
            if off >= self.height {
                return None;
            }
            self.y = 0;
            self.height -= off;
        }
        if self.x as u32 >= screen_width || self.y as u32 >= screen_height {
            return None;
        }
        self.width = self.width.min(screen_width - self.x as u32);
        self.height = self.height.min(screen_height - self.y as u32);
        Some(self)
    }
}

/// Running bounding box of all canvas changes since the last flush.
///
/// Starts at empty sentinel bounds and grows by min/max as change
/// rectangles arrive; [`DirtyRegion::take`] returns the accumulated box and
/// resets the sentinels.
#[derive(Debug)]
pub struct DirtyRegion {
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
}

impl Default for DirtyRegion {
    fn default() -> Self {
        Self::new()
    }
}

impl DirtyRegion {
    pub fn new() -> Self {
        Self {
            x1: i32::MAX,
            y1: i32::MAX,
            x2: i32::MIN,
            y2: i32::MIN,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.x2 < self.x1
    }

    /// Grow the bounding box to include `rect`.
    pub fn include(&mut self, rect: Rect) {
        let x2 = rect.x + rect.width as i32 - 1;
        let y2 = rect.y + rect.height as i32 - 1;
        self.x1 = self.x1.min(rect.x);
        self.y1 = self.y1.min(rect.y);
        self.x2 = self.x2.max(x2);
        self.y2 = self.y2.max(y2);
    }

    /// Return the accumulated bounding box and reset to empty sentinels.
    pub fn take(&mut self) -> Option<Rect> {
        if self.is_empty() {
            return None;
        }
        let rect = Rect::new(
            self.x1,
            self.y1,
            (self.x2 - self.x1 + 1) as u32,
            (self.y2 - self.y1 + 1) as u32,
        );
        *self = Self::new();
        Some(rect)
    }
}
