use anyhow::Result;

pub mod audio;
pub mod framebuffer;
pub mod lifecycle;
pub mod palette;
pub mod pattern;
pub mod render;

use audio::AudioFormat;
use framebuffer::{IndexedFramebuffer, Rect};
use palette::Rgb;

/// Native width of the emulated screen, border included.
pub const SCREEN_WIDTH: usize = 384;
/// Native height of the emulated screen, border included.
pub const SCREEN_HEIGHT: usize = 240;

/// The part of the native screen that is actually shown. Everything outside of it is
/// overscan/border area.
pub const VISIBLE_RECT: Rect = Rect {
    left: 24,
    top: 8,
    width: 336,
    height: 224,
};

/// The emulation engine driven by the bridge.
///
/// A core is moved onto the emulation thread once started and only comes back when that thread
/// has terminated, so `advance_frame` never runs concurrently with `shutdown`.
pub trait EmulationCore: Send {
    fn initialise(&mut self, args: &[String]) -> Result<()>;

    /// Run the machine for exactly one frame, rendering it into `frame`.
    ///
    /// The whole visible rectangle must be written: the bridge hands back whichever buffer the
    /// renderer released last, not necessarily the one from the previous call.
    fn advance_frame(&mut self, frame: &mut IndexedFramebuffer);

    /// Hand out the audio side of the core. The returned generator is driven from the host's
    /// audio thread, concurrently with `advance_frame`, so any state it shares with the core
    /// must be synchronised by the core itself.
    fn audio_generator(
        &mut self,
        format: &AudioFormat,
        buffer_frames: u32,
    ) -> Box<dyn AudioGenerator>;

    fn shutdown(&mut self);

    fn native_size(&self) -> (usize, usize) {
        (SCREEN_WIDTH, SCREEN_HEIGHT)
    }

    fn visible_rect(&self) -> Rect {
        VISIBLE_RECT
    }

    /// The core's colour model, mapping a palette index to RGB.
    fn colour(&self, index: u8) -> Rgb {
        palette::ntsc(index)
    }
}

pub trait AudioGenerator: Send + 'static {
    /// Synthesize exactly `buf.len()` bytes of audio in the configured format.
    fn generate(&mut self, buf: &mut [u8]);
}

/// Notification raised by the emulation thread every time a completed frame has been published.
pub trait FrameSignal: Send {
    fn frame_ready(&self, sequence: u64);
}

impl<F> FrameSignal for F
where
    F: Fn(u64) + Send,
{
    fn frame_ready(&self, sequence: u64) {
        self(sequence)
    }
}
