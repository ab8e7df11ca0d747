//! Pixel-space geometry shared between producer and consumers.
//!
//! These types are embedded in the frame metadata record, so they must be
//! `#[repr(C)]` and free of padding surprises.

/// A texture size in pixels.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

impl PixelSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub const fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Scale to fit inside `container`, preserving aspect ratio.
    pub fn scaled_to_fit(&self, container: PixelSize) -> PixelSize {
        if self.is_empty() {
            return *self;
        }
        let scale_x = container.width as f32 / self.width as f32;
        let scale_y = container.height as f32 / self.height as f32;
        let scale = scale_x.min(scale_y);
        PixelSize {
            width: (self.width as f32 * scale).round() as u32,
            height: (self.height as f32 * scale).round() as u32,
        }
    }
}

/// A point in texture space.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PixelPoint {
    pub x: u32,
    pub y: u32,
}

/// A sub-rectangle of the shared texture; `origin` is top-left.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub origin: PixelPoint,
    pub size: PixelSize,
}

impl PixelRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            origin: PixelPoint { x, y },
            size: PixelSize::new(width, height),
        }
    }

    pub const fn right(&self) -> u32 {
        self.origin.x + self.size.width
    }

    pub const fn bottom(&self) -> u32 {
        self.origin.y + self.size.height
    }

    /// True if `self` lies entirely within a texture of the given size.
    pub const fn fits_in(&self, texture: PixelSize) -> bool {
        self.right() <= texture.width && self.bottom() <= texture.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_to_fit() {
        let source = PixelSize::new(2048, 1024);
        let fitted = source.scaled_to_fit(PixelSize::new(1024, 1024));
        assert_eq!(fitted, PixelSize::new(1024, 512));

        // Degenerate sizes pass through untouched
        assert_eq!(
            PixelSize::default().scaled_to_fit(PixelSize::new(64, 64)),
            PixelSize::default()
        );
    }

    #[test]
    fn test_rect_bounds() {
        let rect = PixelRect::new(100, 200, 300, 400);
        assert_eq!(rect.right(), 400);
        assert_eq!(rect.bottom(), 600);
        assert!(rect.fits_in(PixelSize::new(400, 600)));
        assert!(!rect.fits_in(PixelSize::new(399, 600)));
    }
}
