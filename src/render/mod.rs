//! The frame bridge: turns the emulation core's indexed frames into something the host can
//! display.
//!
//! Two interchangeable strategies exist, picked once at setup:
//! - [`RenderMode::Cpu`] expands every pixel through the palette into the `pixels` frame buffer.
//! - [`RenderMode::Gpu`] uploads the raw indices as a single channel texture and lets a fragment
//!   shader do the palette lookup.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{info, trace};
use pixels::Pixels;

use crate::framebuffer::FrameReader;
use crate::palette::Palette;

pub mod cpu;
pub mod gpu;
pub mod layout;

use cpu::CpuRenderer;
use gpu::GpuRenderer;
use layout::Layout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RenderMode {
    Cpu,
    Gpu,
}

/// A packed RGBA8 pixel buffer owned by the presentation layer. One 32-bit word per pixel.
#[derive(Debug)]
pub struct DisplaySurface<'a> {
    data: &'a mut [u8],
    width: usize,
    height: usize,
}

impl<'a> DisplaySurface<'a> {
    pub fn new(data: &'a mut [u8], width: usize, height: usize) -> Result<Self> {
        if data.len() != width * height * 4 {
            bail!(
                "Surface buffer is {} bytes, expected {} for {}x{}",
                data.len(),
                width * height * 4,
                width,
                height
            );
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    pub fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    #[inline]
    pub fn put(&mut self, col: usize, row: usize, word: u32) {
        let offset = (row * self.width + col) * 4;
        self.data[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
    }

    #[inline]
    pub fn get(&self, col: usize, row: usize) -> u32 {
        let offset = (row * self.width + col) * 4;
        let mut bytes = [0; 4];
        bytes.copy_from_slice(&self.data[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    pub fn fill(&mut self, word: u32) {
        let bytes = word.to_le_bytes();
        for pixel in self.data.chunks_exact_mut(4) {
            pixel.copy_from_slice(&bytes);
        }
    }
}

enum Strategy {
    Cpu(CpuRenderer),
    Gpu(GpuRenderer),
}

/// Presents the latest published frame using the strategy chosen at setup.
pub struct FrameRenderer {
    strategy: Strategy,
    layout: Layout,
    /// Sequence number of the frame currently on screen
    presented: u64,
}

impl FrameRenderer {
    /// `pixels` must have been created with a buffer of `layout.surface_size()`.
    pub fn setup(
        mode: RenderMode,
        layout: Layout,
        palette: Arc<Palette>,
        pixels: &mut Pixels,
    ) -> Result<Self> {
        let strategy = match mode {
            RenderMode::Cpu => {
                let renderer = CpuRenderer::new(layout, palette);
                renderer.setup(&mut surface(&layout, pixels)?);
                Strategy::Cpu(renderer)
            }
            RenderMode::Gpu => Strategy::Gpu(GpuRenderer::new(pixels, layout, &palette)?),
        };
        info!("Frame renderer ready ({:?})", mode);

        Ok(Self {
            strategy,
            layout,
            presented: 0,
        })
    }

    pub fn mode(&self) -> RenderMode {
        match self.strategy {
            Strategy::Cpu(_) => RenderMode::Cpu,
            Strategy::Gpu(_) => RenderMode::Gpu,
        }
    }

    /// Present the latest frame. The framebuffer is only read if a new frame was published since
    /// the last call, otherwise the previous image is presented again.
    pub fn render(&mut self, pixels: &mut Pixels, frames: &FrameReader) -> Result<()> {
        if frames.sequence() != self.presented {
            let layout = &self.layout;
            let strategy = &mut self.strategy;
            self.presented = frames.read(|frame, sequence| -> Result<u64> {
                match strategy {
                    Strategy::Cpu(cpu) => {
                        cpu.blit(frame, &mut surface(layout, pixels)?)?;
                    }
                    Strategy::Gpu(gpu) => gpu.upload(pixels.queue(), frame)?,
                }
                Ok(sequence)
            })?;
            trace!("Presenting frame {}", self.presented);
        }

        match &self.strategy {
            Strategy::Cpu(_) => pixels.render().context("Failed to present frame")?,
            Strategy::Gpu(gpu) => pixels
                .render_with(|encoder, render_target, context| {
                    gpu.draw(encoder, render_target, context.scaling_renderer.clip_rect());
                    Ok(())
                })
                .context("Failed to present frame")?,
        }
        Ok(())
    }

    pub fn teardown(&mut self) {
        if let Strategy::Gpu(gpu) = &mut self.strategy {
            gpu.teardown();
        }
    }
}

fn surface<'a>(layout: &Layout, pixels: &'a mut Pixels) -> Result<DisplaySurface<'a>> {
    let (width, height) = layout.surface_size();
    DisplaySurface::new(pixels.frame_mut(), width, height)
}
