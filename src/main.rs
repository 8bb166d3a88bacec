mod emulator;

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use winit::event::{Event, StartCause, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoopBuilder};

use a8_bridge::pattern::PatternCore;
use a8_bridge::render::RenderMode;
use a8_bridge::FrameSignal;

use crate::emulator::{Emulator, HostEvent};

#[derive(Debug, Parser)]
#[command(version, about = "Runs an emulation core behind a window and an audio stream")]
pub struct Args {
    /// How indexed frames are turned into pixels
    #[arg(long, value_enum, default_value_t = RenderMode::Gpu)]
    renderer: RenderMode,

    /// Audio sample rate in Hz
    #[arg(long, default_value_t = 44100)]
    sample_rate: u32,

    /// Bytes per audio sample (1: unsigned 8-bit, 2: signed 16-bit)
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(1..=2))]
    sample_size: u8,

    /// Number of audio channels
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..=2))]
    channels: u16,

    /// Requested audio buffer size in frames (0 picks one from the sample rate)
    #[arg(long, default_value_t = 0)]
    buffer_frames: u32,

    /// Run without sound
    #[arg(long)]
    no_audio: bool,

    /// Initial window scale
    #[arg(long, default_value_t = 2)]
    scale: u32,

    /// How often a paused emulation thread checks whether it should run again
    #[arg(long, default_value_t = 100)]
    poll_interval_ms: u64,

    /// Rate of the periodic redraw timer
    #[arg(long, default_value_t = 50)]
    frame_rate: u32,

    /// Options passed as-is to the emulation core
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    core_args: Vec<String>,
}

impl Args {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn frame_period(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate.max(1)
    }
}

fn main() -> Result<()> {
    env_logger::builder()
        .parse_filters("a8_bridge=info")
        .parse_default_env()
        .init();

    let args = Args::parse();
    let event_loop = EventLoopBuilder::<HostEvent>::with_user_event()
        .build()
        .context("Failed to create event loop")?;

    let proxy = event_loop.create_proxy();
    let signal: Box<dyn FrameSignal> = Box::new(move |sequence: u64| {
        // Only fails once the event loop is gone, at which point nobody is watching
        let _ = proxy.send_event(HostEvent::FrameReady(sequence));
    });
    let mut emulator =
        Emulator::on_create(&args, Box::new(PatternCore::new()), &event_loop, signal)?;

    let period = args.frame_period();
    let mut next_tick = Instant::now() + period;

    event_loop
        .run(move |event, elwt| match event {
            Event::NewEvents(StartCause::Init) => {
                elwt.set_control_flow(ControlFlow::WaitUntil(next_tick));
            }
            Event::NewEvents(StartCause::ResumeTimeReached { .. }) => {
                emulator.on_tick();
                next_tick += period;
                let now = Instant::now();
                if next_tick < now {
                    next_tick = now + period;
                }
                elwt.set_control_flow(ControlFlow::WaitUntil(next_tick));
            }
            Event::Resumed => {
                emulator.on_surface_ready();
                emulator.on_resume();
            }
            Event::Suspended => emulator.on_pause(),
            Event::UserEvent(HostEvent::FrameReady(sequence)) => emulator.on_frame_ready(sequence),
            Event::MemoryWarning => emulator.on_notification("low memory"),
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::CloseRequested => {
                    emulator.on_terminate();
                    elwt.exit();
                }
                WindowEvent::Occluded(true) => emulator.on_pause(),
                WindowEvent::Occluded(false) => emulator.on_resume(),
                WindowEvent::Resized(size) => emulator.on_resize(size),
                WindowEvent::ScaleFactorChanged { .. } => emulator.on_notification("scale factor"),
                WindowEvent::ThemeChanged(_) => emulator.on_notification("theme"),
                WindowEvent::RedrawRequested => {
                    if let Err(e) = emulator.render() {
                        error!("{:#}", e);
                        emulator.on_terminate();
                        elwt.exit();
                    }
                }
                _ => {}
            },
            Event::LoopExiting => {
                emulator.on_terminate();
                info!("Bye");
            }
            _ => {}
        })
        .context("Event loop failed")?;

    Ok(())
}
