//! A stand-in emulation core drawing a test pattern, used when no real machine is plugged in.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use log::{debug, info};

use crate::audio::AudioFormat;
use crate::framebuffer::{IndexedFramebuffer, Rect};
use crate::{AudioGenerator, EmulationCore, VISIBLE_RECT};

/// PAL frame rate
const FRAMES_PER_SECOND: u32 = 50;
/// Palette index used for the overscan area
pub const BORDER_INDEX: u8 = 0x94;
const BAR_WIDTH: usize = 21;
const TONE_HZ: u32 = 440;

/// Moving colour bars inside the visible area, a solid border around it, and a square wave.
#[derive(Debug)]
pub struct PatternCore {
    frame_count: u64,
    pacer: Option<Pacer>,
    tone_hz: u32,
}

impl PatternCore {
    pub fn new() -> Self {
        Self {
            frame_count: 0,
            pacer: None,
            tone_hz: TONE_HZ,
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl Default for PatternCore {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulationCore for PatternCore {
    /// Accepts `-tone <hz>` and `-nopace`.
    fn initialise(&mut self, args: &[String]) -> Result<()> {
        let mut pace = true;
        let mut args = args.iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-tone" => {
                    let Some(hz) = args.next().and_then(|v| v.parse().ok()) else {
                        bail!("-tone expects a frequency in Hz");
                    };
                    self.tone_hz = hz;
                }
                "-nopace" => pace = false,
                other => bail!("Unknown option {}", other),
            }
        }

        if pace {
            self.pacer = Some(Pacer::new(FRAMES_PER_SECOND));
        }
        info!("Pattern core initialised (tone: {}Hz, paced: {})", self.tone_hz, pace);
        Ok(())
    }

    fn advance_frame(&mut self, frame: &mut IndexedFramebuffer) {
        draw(frame, VISIBLE_RECT, self.frame_count);
        self.frame_count += 1;
        if let Some(pacer) = self.pacer.as_mut() {
            pacer.wait();
        }
    }

    fn audio_generator(
        &mut self,
        format: &AudioFormat,
        buffer_frames: u32,
    ) -> Box<dyn AudioGenerator> {
        debug!("Audio buffer: {} frames", buffer_frames);
        Box::new(SquareWave::new(*format, self.tone_hz))
    }

    fn shutdown(&mut self) {
        info!("Pattern core shut down after {} frames", self.frame_count);
    }
}

/// Draw the pattern for frame number `n`.
pub fn draw(frame: &mut IndexedFramebuffer, visible: Rect, n: u64) {
    let shift = n as usize;
    for y in 0..frame.height() {
        let row = frame.row_mut(y);
        for (x, pixel) in row.iter_mut().enumerate() {
            *pixel = if visible.contains(x, y) {
                // hue from the scrolling bar, luminance from the line
                let hue = ((x - visible.left + shift) / BAR_WIDTH) % 16;
                let luma = ((y - visible.top) * 16) / visible.height;
                ((hue << 4) | luma) as u8
            } else {
                BORDER_INDEX
            };
        }
    }
}

/// Keeps the emulation at a fixed frame rate by sleeping until the next frame is due.
#[derive(Debug)]
struct Pacer {
    period: Duration,
    next: Instant,
}

impl Pacer {
    fn new(fps: u32) -> Self {
        let period = Duration::from_secs(1) / fps;
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    fn wait(&mut self) {
        let now = Instant::now();
        if self.next > now {
            thread::sleep(self.next - now);
            self.next += self.period;
        } else {
            // Too far behind (e.g. after a pause): don't try to catch up
            self.next = now + self.period;
        }
    }
}

/// A square wave, written as unsigned 8-bit or signed 16-bit little-endian samples.
#[derive(Debug)]
pub struct SquareWave {
    format: AudioFormat,
    half_period: u32,
    phase: u32,
}

impl SquareWave {
    pub fn new(format: AudioFormat, hz: u32) -> Self {
        let half_period = (format.sample_rate / hz.max(1).saturating_mul(2)).max(1);
        Self {
            format,
            half_period,
            phase: 0,
        }
    }

    fn next_level(&mut self) -> bool {
        let high = self.phase < self.half_period;
        self.phase = (self.phase + 1) % (self.half_period * 2);
        high
    }
}

impl AudioGenerator for SquareWave {
    fn generate(&mut self, buf: &mut [u8]) {
        let frame_size = self.format.frame_size().max(1);
        for chunk in buf.chunks_mut(frame_size) {
            let high = self.next_level();
            let sample: [u8; 2] = match (self.format.sample_size, high) {
                (1, true) => [0xA0, 0],
                (1, false) => [0x60, 0],
                (_, true) => 4000i16.to_le_bytes(),
                (_, false) => (-4000i16).to_le_bytes(),
            };
            let sample = &sample[..self.format.sample_size.clamp(1, 2) as usize];
            for (b, s) in chunk.iter_mut().zip(sample.iter().cycle()) {
                *b = *s;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SCREEN_HEIGHT, SCREEN_WIDTH};

    #[test]
    fn test_border_outside_visible_area() {
        let mut frame = IndexedFramebuffer::new(SCREEN_WIDTH, SCREEN_HEIGHT);
        draw(&mut frame, VISIBLE_RECT, 3);
        for y in 0..SCREEN_HEIGHT {
            for x in 0..SCREEN_WIDTH {
                let inside = VISIBLE_RECT.contains(x, y);
                assert_eq!(frame.get(x, y) == BORDER_INDEX, !inside, "at ({}, {})", x, y);
            }
        }
    }

    #[test]
    fn test_bars_scroll() {
        let mut a = IndexedFramebuffer::new(SCREEN_WIDTH, SCREEN_HEIGHT);
        let mut b = IndexedFramebuffer::new(SCREEN_WIDTH, SCREEN_HEIGHT);
        draw(&mut a, VISIBLE_RECT, 0);
        draw(&mut b, VISIBLE_RECT, 1);
        let (x, y) = (VISIBLE_RECT.left, VISIBLE_RECT.top);
        // one pixel to the left
        assert_eq!(b.get(x + BAR_WIDTH - 1, y), a.get(x + BAR_WIDTH, y));
    }

    #[test]
    fn test_initialise_options() {
        let mut core = PatternCore::new();
        core.initialise(&["-tone".to_string(), "1000".to_string(), "-nopace".to_string()])
            .unwrap();
        assert_eq!(core.tone_hz, 1000);
        assert!(core.pacer.is_none());

        assert!(PatternCore::new().initialise(&["-tone".to_string()]).is_err());
        assert!(PatternCore::new().initialise(&["-bogus".to_string()]).is_err());
    }

    #[test]
    fn test_square_wave_16bit_stereo() {
        let format = AudioFormat {
            sample_rate: 8,
            sample_size: 2,
            channels: 2,
        };
        // half period of 2 frames
        let mut wave = SquareWave::new(format, 2);
        let mut buf = [0u8; 16];
        wave.generate(&mut buf);

        let hi = 4000i16.to_le_bytes();
        let lo = (-4000i16).to_le_bytes();
        let expected: Vec<u8> = [hi, hi, hi, hi, lo, lo, lo, lo].concat();
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn test_square_wave_above_nyquist() {
        let format = AudioFormat {
            sample_rate: 44100,
            sample_size: 1,
            channels: 1,
        };
        // shortest possible period: alternates every frame
        let mut wave = SquareWave::new(format, u32::MAX);
        let mut buf = [0u8; 4];
        wave.generate(&mut buf);
        assert_eq!(buf, [0xA0, 0x60, 0xA0, 0x60]);
    }

    #[test]
    fn test_square_wave_8bit_mono() {
        let format = AudioFormat {
            sample_rate: 4,
            sample_size: 1,
            channels: 1,
        };
        let mut wave = SquareWave::new(format, 2);
        let mut buf = [0u8; 6];
        wave.generate(&mut buf);
        assert_eq!(buf, [0xA0, 0x60, 0xA0, 0x60, 0xA0, 0x60]);
    }
}
