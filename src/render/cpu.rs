use std::sync::Arc;

use anyhow::{bail, Result};

use super::layout::Layout;
use super::DisplaySurface;
use crate::framebuffer::{IndexedFramebuffer, Rect};
use crate::palette::{Palette, Rgb, ALPHA};

/// Expands indexed frames into an RGBA surface on the CPU.
#[derive(Debug)]
pub struct CpuRenderer {
    layout: Layout,
    palette: Arc<Palette>,
}

impl CpuRenderer {
    pub fn new(layout: Layout, palette: Arc<Palette>) -> Self {
        Self { layout, palette }
    }

    /// Clear the whole surface to opaque black, so the area around the image matches what the GPU
    /// path shows.
    pub fn setup(&self, surface: &mut DisplaySurface) {
        surface.fill(Rgb::default().pack(ALPHA));
    }

    pub fn blit(&self, frame: &IndexedFramebuffer, surface: &mut DisplaySurface) -> Result<Rect> {
        blit(&self.layout, frame, &self.palette, surface)
    }
}

/// Convert the visible part of `frame` and write it, rotated, into `surface`.
///
/// Returns the updated region of the surface.
pub fn blit(
    layout: &Layout,
    frame: &IndexedFramebuffer,
    palette: &Palette,
    surface: &mut DisplaySurface,
) -> Result<Rect> {
    if (frame.width(), frame.height()) != layout.native_size() {
        bail!(
            "Frame is {}x{}, expected {:?}",
            frame.width(),
            frame.height(),
            layout.native_size()
        );
    }
    if surface.size() != layout.surface_size() {
        bail!(
            "Surface is {:?}, expected {:?}",
            surface.size(),
            layout.surface_size()
        );
    }

    let crop = layout.crop();
    for y in crop.top..crop.bottom() {
        let row = &frame.row(y)[crop.left..crop.right()];
        for (x, &index) in (crop.left..).zip(row) {
            let (col, dest_row) = layout.map(x, y);
            surface.put(col, dest_row, palette.packed(index));
        }
    }

    Ok(layout.output_rect())
}
