use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use log::{debug, error, info, warn};

use crate::AudioGenerator;

/// Number of buffers per second used when no buffer size was requested (one per 50Hz frame).
const DEFAULT_BUFFERS_PER_SECOND: u32 = 50;
/// Slack factor applied on top of the rounded buffer size to absorb bursty sample production.
const BUFFER_SLACK: u32 = 8;
/// Unsigned 8-bit samples are centred on 0x80.
const U8_SILENCE: u8 = 0x80;

/// Sample format requested by the emulation core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    /// Bytes per sample: 1 for unsigned 8-bit, 2 for signed 16-bit little-endian.
    pub sample_size: u8,
    pub channels: u16,
}

impl AudioFormat {
    pub fn sample_format(&self) -> Result<SampleFormat> {
        match self.sample_size {
            1 => Ok(SampleFormat::U8),
            2 => Ok(SampleFormat::I16),
            n => bail!("Unsupported sample size: {} bytes", n),
        }
    }

    /// Size in bytes of one frame, i.e. one sample for every channel.
    pub fn frame_size(&self) -> usize {
        self.sample_size as usize * self.channels as usize
    }

    fn validate(&self) -> Result<SampleFormat> {
        if self.sample_rate == 0 {
            bail!("Invalid sample rate: 0Hz");
        }
        if !(1..=2).contains(&self.channels) {
            bail!("Unsupported channel count: {}", self.channels);
        }
        self.sample_format()
    }
}

/// Compute the buffer size (in frames) reported back to the core.
///
/// A request of 0 defaults to a 50th of a second. The result is then rounded up to the next power
/// of two and multiplied by 8. Fails if the result doesn't fit in a `u32`.
pub fn buffer_frames(sample_rate: u32, requested: u32) -> Result<u32> {
    let frames = if requested == 0 {
        sample_rate / DEFAULT_BUFFERS_PER_SECOND
    } else {
        requested
    };
    frames
        .checked_next_power_of_two()
        .and_then(|frames| frames.checked_mul(BUFFER_SLACK))
        .with_context(|| format!("Audio buffer of {} frames is too large", frames))
}

/// Pull side of the bridge: fills the host's buffers from the generator.
///
/// The scratch buffer only ever grows, so that a host alternating between request sizes doesn't
/// cause an allocation on every drain.
pub struct Drain {
    generator: Box<dyn AudioGenerator>,
    scratch: Vec<u8>,
    reallocations: usize,
}

impl Drain {
    pub fn new(generator: Box<dyn AudioGenerator>) -> Self {
        Self {
            generator,
            scratch: Vec::new(),
            reallocations: 0,
        }
    }

    /// Generate exactly `requested` bytes of audio.
    pub fn fill(&mut self, requested: usize) -> Result<&[u8]> {
        if requested > self.scratch.len() {
            let additional = requested - self.scratch.len();
            self.scratch
                .try_reserve_exact(additional)
                .with_context(|| format!("Failed to grow audio buffer to {} bytes", requested))?;
            self.scratch.resize(requested, 0);
            self.reallocations += 1;
            debug!("Audio scratch buffer grown to {} bytes", requested);
        }

        let buf = &mut self.scratch[..requested];
        self.generator.generate(buf);
        Ok(buf)
    }

    /// Current size of the scratch buffer in bytes.
    pub fn capacity(&self) -> usize {
        self.scratch.len()
    }

    /// Number of times the scratch buffer had to grow.
    pub fn reallocations(&self) -> usize {
        self.reallocations
    }
}

/// The host-facing audio stream.
pub struct AudioBridge {
    stream: Option<Stream>,
    format: AudioFormat,
    buffer_frames: u32,
    paused: bool,
    faulted: Arc<AtomicBool>,
}

impl AudioBridge {
    /// Open the default output device with the given format and start streaming.
    ///
    /// `generator` is called with the final buffer size, once the device accepted the format.
    pub fn configure<F>(format: AudioFormat, requested_frames: u32, generator: F) -> Result<Self>
    where
        F: FnOnce(u32) -> Box<dyn AudioGenerator>,
    {
        info!(
            "Sound setup: freq={} sample_size={} channels={} buffer_frames={}",
            format.sample_rate, format.sample_size, format.channels, requested_frames
        );
        let sample_format = format.validate()?;
        let buffer_frames = buffer_frames(format.sample_rate, requested_frames)?;
        debug!("Audio buffer size: {} frames", buffer_frames);

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .context("No default audio output device")?;
        let supported = device
            .supported_output_configs()
            .context("Failed to query audio output configs")?
            .filter(|cfg| cfg.channels() == format.channels)
            .filter(|cfg| cfg.sample_format() == sample_format)
            .find(|cfg| {
                (cfg.min_sample_rate().0..=cfg.max_sample_rate().0).contains(&format.sample_rate)
            })
            .with_context(|| format!("Audio device rejected format {:?}", format))?;
        let config: StreamConfig = supported
            .with_sample_rate(cpal::SampleRate(format.sample_rate))
            .config();

        let mut drain = Drain::new(generator(buffer_frames));
        let faulted = Arc::new(AtomicBool::new(false));
        let stream = match sample_format {
            SampleFormat::U8 => {
                let faulted = Arc::clone(&faulted);
                device.build_output_stream(
                    &config,
                    move |data: &mut [u8], _| {
                        let samples = on_drain(&mut drain, &faulted, data.len());
                        write_u8(data, samples)
                    },
                    |err| error!("Audio stream error: {}", err),
                    None,
                )
            }
            SampleFormat::I16 => {
                let faulted = Arc::clone(&faulted);
                device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _| {
                        let samples = on_drain(&mut drain, &faulted, data.len() * 2);
                        write_i16(data, samples)
                    },
                    |err| error!("Audio stream error: {}", err),
                    None,
                )
            }
            other => bail!("Unsupported sample format {:?}", other),
        }
        .context("Failed to build audio output stream")?;

        stream.play().context("Failed to start audio stream")?;
        info!("Sound setup ok");

        Ok(Self {
            stream: Some(stream),
            format,
            buffer_frames,
            paused: false,
            faulted,
        })
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn buffer_frames(&self) -> u32 {
        self.buffer_frames
    }

    /// Whether the stream stopped producing audio because the scratch buffer couldn't grow.
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// Suspend the stream, keeping the device and its format.
    pub fn pause(&mut self) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        if self.paused {
            return;
        }
        match stream.pause() {
            Ok(()) => self.paused = true,
            Err(e) => warn!("Failed to pause audio stream: {}", e),
        }
    }

    pub fn resume(&mut self) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        if !self.paused {
            return;
        }
        match stream.play() {
            Ok(()) => self.paused = false,
            Err(e) => warn!("Failed to resume audio stream: {}", e),
        }
    }

    /// Release the stream. Dropping it also frees the scratch buffer owned by its callback.
    pub fn shutdown(&mut self) {
        if self.stream.take().is_some() {
            info!("Sound exit ok");
        }
    }
}

impl Drop for AudioBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Body of the host's drain callback: generate `requested` bytes of audio.
///
/// Once the scratch buffer failed to grow the stream is latched as faulted and `None` is returned
/// from then on, so that the caller outputs silence instead of ever playing a truncated buffer.
fn on_drain<'a>(
    drain: &'a mut Drain,
    faulted: &AtomicBool,
    requested: usize,
) -> Option<&'a [u8]> {
    if faulted.load(Ordering::Relaxed) {
        return None;
    }
    match drain.fill(requested) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!("Audio stream faulted: {:#}", e);
            faulted.store(true, Ordering::SeqCst);
            None
        }
    }
}

fn write_u8(out: &mut [u8], samples: Option<&[u8]>) {
    match samples {
        Some(bytes) => out.copy_from_slice(bytes),
        None => out.fill(U8_SILENCE),
    }
}

fn write_i16(out: &mut [i16], samples: Option<&[u8]>) {
    match samples {
        Some(bytes) => LittleEndian::read_i16_into(bytes, out),
        None => out.fill(0),
    }
}
