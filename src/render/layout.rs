use anyhow::{bail, Result};

use crate::framebuffer::Rect;

/// Where the visible part of the emulated screen ends up on the display.
///
/// The emulated screen is landscape while the display is portrait, so the cropped source is
/// rotated by 90 degrees clockwise: source columns become destination rows (top to bottom) and
/// source rows become destination columns (bottom to top). The rotated image is centred on the
/// output surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    native_width: usize,
    native_height: usize,
    crop: Rect,
    surface_width: usize,
    surface_height: usize,
    col_offset: usize,
    row_offset: usize,
}

/// A vertex of the quad drawn by the GPU path, in normalized device coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub position: [f32; 2],
    pub tex_coord: [f32; 2],
}

/// The part of the indexed framebuffer uploaded as a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadRegion {
    /// Offset of the first uploaded byte in the framebuffer
    pub offset: usize,
    pub bytes_per_row: usize,
    pub width: usize,
    pub height: usize,
}

impl Layout {
    pub fn new(
        native: (usize, usize),
        crop: Rect,
        surface: (usize, usize),
    ) -> Result<Self> {
        let (native_width, native_height) = native;
        let (surface_width, surface_height) = surface;
        if crop.width == 0 || crop.height == 0 {
            bail!("Empty visible area {:?}", crop);
        }
        if !crop.fits_in(native_width, native_height) {
            bail!(
                "Visible area {:?} doesn't fit in a {}x{} screen",
                crop,
                native_width,
                native_height
            );
        }
        // rotated: the crop's height is laid out horizontally
        if crop.height > surface_width || crop.width > surface_height {
            bail!(
                "Rotated visible area ({}x{}) doesn't fit in a {}x{} surface",
                crop.height,
                crop.width,
                surface_width,
                surface_height
            );
        }

        Ok(Self {
            native_width,
            native_height,
            crop,
            surface_width,
            surface_height,
            col_offset: (surface_width - crop.height) / 2,
            row_offset: (surface_height - crop.width) / 2,
        })
    }

    /// A layout whose surface is exactly the size of the rotated visible area.
    pub fn fitted(native: (usize, usize), crop: Rect) -> Result<Self> {
        Self::new(native, crop, (crop.height, crop.width))
    }

    pub fn native_size(&self) -> (usize, usize) {
        (self.native_width, self.native_height)
    }

    pub fn crop(&self) -> Rect {
        self.crop
    }

    pub fn surface_size(&self) -> (usize, usize) {
        (self.surface_width, self.surface_height)
    }

    /// The area of the surface covered by the rotated image.
    pub fn output_rect(&self) -> Rect {
        Rect::new(
            self.col_offset,
            self.row_offset,
            self.crop.height,
            self.crop.width,
        )
    }

    /// Map a source pixel inside the crop to its `(column, row)` on the surface.
    #[inline]
    pub fn map(&self, x: usize, y: usize) -> (usize, usize) {
        debug_assert!(self.crop.contains(x, y));
        let col = self.col_offset + (self.crop.bottom() - 1 - y);
        let row = self.row_offset + (x - self.crop.left);
        (col, row)
    }

    /// The quad covering `output_rect`, as a triangle strip, with texture coordinates spanning
    /// the uploaded region. `u` follows the source x axis and `v` the source y axis, which
    /// performs the same rotation as `map`.
    pub fn quad(&self) -> [Vertex; 4] {
        let out = self.output_rect();
        let left = self.ndc_x(out.left);
        let right = self.ndc_x(out.right());
        let top = self.ndc_y(out.top);
        let bottom = self.ndc_y(out.bottom());

        [
            Vertex {
                position: [left, top],
                tex_coord: [0.0, 1.0],
            },
            Vertex {
                position: [right, top],
                tex_coord: [0.0, 0.0],
            },
            Vertex {
                position: [left, bottom],
                tex_coord: [1.0, 1.0],
            },
            Vertex {
                position: [right, bottom],
                tex_coord: [1.0, 0.0],
            },
        ]
    }

    pub fn upload_region(&self) -> UploadRegion {
        UploadRegion {
            offset: self.crop.top * self.native_width + self.crop.left,
            bytes_per_row: self.native_width,
            width: self.crop.width,
            height: self.crop.height,
        }
    }

    fn ndc_x(&self, col: usize) -> f32 {
        2.0 * col as f32 / self.surface_width as f32 - 1.0
    }

    fn ndc_y(&self, row: usize) -> f32 {
        1.0 - 2.0 * row as f32 / self.surface_height as f32
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::{SCREEN_HEIGHT, SCREEN_WIDTH, VISIBLE_RECT};

    fn atari() -> Layout {
        Layout::fitted((SCREEN_WIDTH, SCREEN_HEIGHT), VISIBLE_RECT).unwrap()
    }

    #[test]
    fn test_fitted_surface_is_portrait() {
        let layout = atari();
        assert_eq!(layout.surface_size(), (224, 336));
        assert_eq!(layout.output_rect(), Rect::new(0, 0, 224, 336));
    }

    #[test]
    fn test_map_is_clockwise_rotation() {
        let layout = atari();
        let crop = layout.crop();
        // top-left -> top-right
        assert_eq!(layout.map(crop.left, crop.top), (223, 0));
        // top-right -> bottom-right
        assert_eq!(layout.map(crop.right() - 1, crop.top), (223, 335));
        // bottom-left -> top-left
        assert_eq!(layout.map(crop.left, crop.bottom() - 1), (0, 0));
        // bottom-right -> bottom-left
        assert_eq!(layout.map(crop.right() - 1, crop.bottom() - 1), (0, 335));
    }

    #[test]
    fn test_map_is_bijection() {
        let layout = Layout::new((SCREEN_WIDTH, SCREEN_HEIGHT), VISIBLE_RECT, (240, 432)).unwrap();
        let crop = layout.crop();
        let out = layout.output_rect();
        assert_eq!(out, Rect::new(8, 48, 224, 336));

        let mut seen = HashSet::new();
        for y in crop.top..crop.bottom() {
            for x in crop.left..crop.right() {
                let (col, row) = layout.map(x, y);
                assert!(out.contains(col, row), "({}, {}) outside output", col, row);
                assert!(seen.insert((col, row)), "({}, {}) written twice", col, row);
            }
        }
        assert_eq!(seen.len(), out.width * out.height);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        // crop outside of the screen
        assert!(Layout::new((384, 240), Rect::new(100, 0, 300, 10), (100, 400)).is_err());
        // surface too small for the rotated crop
        assert!(Layout::new((384, 240), VISIBLE_RECT, (336, 224)).is_err());
        assert!(Layout::new((384, 240), Rect::new(0, 0, 0, 10), (100, 100)).is_err());
    }

    #[test]
    fn test_quad_covers_output() {
        let layout = Layout::new((SCREEN_WIDTH, SCREEN_HEIGHT), VISIBLE_RECT, (448, 336)).unwrap();
        let quad = layout.quad();
        // horizontally centred, full height
        assert_eq!(quad[0].position, [-0.5, 1.0]);
        assert_eq!(quad[3].position, [0.5, -1.0]);
        assert_eq!(quad[0].tex_coord, [0.0, 1.0]);
        assert_eq!(quad[3].tex_coord, [1.0, 0.0]);
    }

    #[test]
    fn test_upload_region() {
        let region = atari().upload_region();
        assert_eq!(region.offset, 8 * 384 + 24);
        assert_eq!(region.bytes_per_row, 384);
        assert_eq!((region.width, region.height), (336, 224));
        // the last uploaded byte is still inside the framebuffer
        let end = region.offset + (region.height - 1) * region.bytes_per_row + region.width;
        assert!(end <= SCREEN_WIDTH * SCREEN_HEIGHT);
    }
}
