use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, error, info, trace, warn};
use pixels::{Pixels, SurfaceTexture};
use winit::dpi::{LogicalSize, PhysicalSize};
use winit::event_loop::EventLoopWindowTarget;
use winit::window::{Window, WindowBuilder};

use a8_bridge::audio::{AudioBridge, AudioFormat};
use a8_bridge::framebuffer::{self, FrameReader};
use a8_bridge::lifecycle::{Lifecycle, LifecycleConfig};
use a8_bridge::palette::Palette;
use a8_bridge::render::layout::Layout;
use a8_bridge::render::FrameRenderer;
use a8_bridge::{EmulationCore, FrameSignal};

use crate::Args;

/// Custom events sent to the host event loop from other threads.
#[derive(Debug, Clone, Copy)]
pub enum HostEvent {
    /// The emulation thread published frame number `n`.
    FrameReady(u64),
}

/// The object that pulls everything together: it owns the window, the frame renderer, the audio
/// stream and the emulation thread, and reacts to the host's lifecycle notifications.
pub struct Emulator {
    window: Arc<Window>,
    pixels: Pixels<'static>,
    renderer: FrameRenderer,
    frames: FrameReader,
    audio: Option<AudioBridge>,
    lifecycle: Lifecycle,
    paused: bool,
    terminated: bool,
}

impl Emulator {
    /// Bring everything up, in order: core, palette, window and renderer, audio, emulation thread.
    ///
    /// The emulation thread stays paused until [`Emulator::on_surface_ready`] is called.
    pub fn on_create(
        args: &Args,
        mut core: Box<dyn EmulationCore>,
        target: &EventLoopWindowTarget<HostEvent>,
        signal: Box<dyn FrameSignal>,
    ) -> Result<Self> {
        core.initialise(&args.core_args)
            .context("Failed to initialise emulation core")?;

        let palette = Arc::new(Palette::init(|index| core.colour(index)));
        let layout = Layout::fitted(core.native_size(), core.visible_rect())?;
        let (width, height) = layout.surface_size();
        debug!(
            "Native size {:?}, visible {:?}, surface {}x{}",
            layout.native_size(),
            layout.crop(),
            width,
            height
        );

        let scale = args.scale.max(1) as f64;
        let window = WindowBuilder::new()
            .with_title("a8-bridge")
            .with_inner_size(LogicalSize::new(width as f64 * scale, height as f64 * scale))
            .with_min_inner_size(LogicalSize::new(width as f64, height as f64))
            .build(target)
            .context("Failed to create window")?;
        let window = Arc::new(window);

        let size = window.inner_size();
        let surface = SurfaceTexture::new(size.width, size.height, Arc::clone(&window));
        let mut pixels = Pixels::new(width as u32, height as u32, surface)
            .context("Failed to create presentation surface")?;

        let (native_width, native_height) = layout.native_size();
        let (producer, frames) = framebuffer::exchange(native_width, native_height);
        let renderer = FrameRenderer::setup(args.renderer, layout, palette, &mut pixels)
            .context("Failed to set up frame renderer")?;

        let audio = if args.no_audio {
            info!("Audio disabled");
            None
        } else {
            let format = AudioFormat {
                sample_rate: args.sample_rate,
                sample_size: args.sample_size,
                channels: args.channels,
            };
            match AudioBridge::configure(format, args.buffer_frames, |frames| {
                core.audio_generator(&format, frames)
            }) {
                Ok(audio) => Some(audio),
                Err(e) => {
                    warn!("Audio unavailable, running video only: {:#}", e);
                    None
                }
            }
        };

        let lifecycle = Lifecycle::start(
            core,
            producer,
            signal,
            LifecycleConfig {
                poll_interval: args.poll_interval(),
                surface_ready: false,
            },
        )?;

        Ok(Self {
            window,
            pixels,
            renderer,
            frames,
            audio,
            lifecycle,
            paused: false,
            terminated: false,
        })
    }

    pub fn on_surface_ready(&mut self) {
        self.lifecycle.surface_ready();
        self.request_redraw();
    }

    pub fn on_pause(&mut self) {
        if self.paused || self.terminated {
            return;
        }
        info!("Pausing");
        self.paused = true;
        if let Some(audio) = self.audio.as_mut() {
            audio.pause();
        }
        self.lifecycle.request_pause();
    }

    pub fn on_resume(&mut self) {
        if !self.paused || self.terminated {
            return;
        }
        info!("Resuming");
        self.paused = false;
        self.lifecycle.request_resume();
        if let Some(audio) = self.audio.as_mut() {
            audio.resume();
        }
        self.request_redraw();
    }

    /// Stop the emulation thread, then release audio, the core and the renderer. Calling it again
    /// does nothing.
    pub fn on_terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        info!("Terminating");

        let core = self.lifecycle.request_exit();
        if let Some(mut audio) = self.audio.take() {
            audio.shutdown();
        }
        if let Some(mut core) = core {
            core.shutdown();
        }
        self.renderer.teardown();
    }

    pub fn on_frame_ready(&self, sequence: u64) {
        if !self.paused {
            trace!("Frame {} ready", sequence);
            self.request_redraw();
        }
    }

    /// Periodic tick from the host, independent from the emulation thread.
    pub fn on_tick(&self) {
        if !self.paused {
            self.request_redraw();
        }
    }

    pub fn on_resize(&mut self, size: PhysicalSize<u32>) {
        if size.width == 0 || size.height == 0 {
            return;
        }
        debug!("Surface resized to {}x{}", size.width, size.height);
        if let Err(e) = self.pixels.resize_surface(size.width, size.height) {
            error!("Failed to resize surface: {}", e);
        }
    }

    /// Notifications that don't affect this system.
    pub fn on_notification(&self, what: &str) {
        info!("Ignoring host notification: {}", what);
    }

    pub fn render(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.renderer.render(&mut self.pixels, &self.frames)
    }

    fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        self.on_terminate();
    }
}
