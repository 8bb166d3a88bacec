use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, trace};

use crate::framebuffer::FrameProducer;
use crate::{EmulationCore, FrameSignal};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Running = 0,
    Paused = 1,
    Exiting = 2,
}

impl LifecycleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Paused,
            _ => Self::Exiting,
        }
    }
}

/// The state shared with the emulation thread.
#[derive(Debug)]
struct SharedState(AtomicU8);

impl SharedState {
    fn get(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: LifecycleState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    /// How long the emulation thread sleeps between two checks while paused.
    pub poll_interval: Duration,
    /// Whether the host's presentation surface is already usable. If not, emulation stays paused
    /// until [`Lifecycle::surface_ready`] is called.
    pub surface_ready: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            surface_ready: true,
        }
    }
}

/// What the host asked for, combined into the state the emulation thread sees.
#[derive(Debug)]
struct Gates {
    surface_ready: bool,
    host_paused: bool,
}

/// Owns the emulation thread and decides whether it advances time.
///
/// Transitions requested by the host are idempotent, and nothing ever leaves `Exiting`.
#[derive(Debug)]
pub struct Lifecycle {
    state: Arc<SharedState>,
    gates: Mutex<Gates>,
    thread: Mutex<Option<JoinHandle<Box<dyn EmulationCore>>>>,
}

impl Lifecycle {
    /// Spawn the emulation thread.
    pub fn start(
        core: Box<dyn EmulationCore>,
        producer: FrameProducer,
        signal: Box<dyn FrameSignal>,
        config: LifecycleConfig,
    ) -> Result<Self> {
        let initial = if config.surface_ready {
            LifecycleState::Running
        } else {
            LifecycleState::Paused
        };
        let state = Arc::new(SharedState(AtomicU8::new(initial as u8)));

        let thread_state = Arc::clone(&state);
        let poll_interval = config.poll_interval;
        let handle = thread::Builder::new()
            .name("emulation".to_string())
            .spawn(move || run(core, producer, signal, &thread_state, poll_interval))
            .context("Failed to spawn emulation thread")?;
        info!("Emulation thread started ({:?})", initial);

        Ok(Self {
            state,
            gates: Mutex::new(Gates {
                surface_ready: config.surface_ready,
                host_paused: false,
            }),
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state.get()
    }

    /// The presentation surface can now be used. Only the first call has an effect.
    pub fn surface_ready(&self) {
        self.update(|gates| gates.surface_ready = true);
    }

    pub fn request_pause(&self) {
        self.update(|gates| gates.host_paused = true);
    }

    pub fn request_resume(&self) {
        self.update(|gates| gates.host_paused = false);
    }

    /// Stop the emulation thread and wait for it to terminate.
    ///
    /// Returns the emulation core on the first call, so that it can be shut down now that nothing
    /// else uses it. Later calls return `None`.
    pub fn request_exit(&self) -> Option<Box<dyn EmulationCore>> {
        {
            let _gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
            self.state.set(LifecycleState::Exiting);
        }

        // Held while joining, so that a concurrent caller also waits for the thread to be gone
        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = thread.take()?;
        match handle.join() {
            Ok(core) => {
                info!("Emulation thread terminated");
                Some(core)
            }
            Err(_) => {
                error!("Emulation thread panicked");
                None
            }
        }
    }

    fn update(&self, f: impl FnOnce(&mut Gates)) {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut gates);

        let current = self.state.get();
        if current == LifecycleState::Exiting {
            return;
        }
        let next = if gates.surface_ready && !gates.host_paused {
            LifecycleState::Running
        } else {
            LifecycleState::Paused
        };
        if next != current {
            debug!("Lifecycle: {:?} -> {:?}", current, next);
            self.state.set(next);
        }
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if let Some(mut core) = self.request_exit() {
            core.shutdown();
        }
    }
}

/// Body of the emulation thread. The state is re-read on every iteration.
fn run(
    mut core: Box<dyn EmulationCore>,
    mut producer: FrameProducer,
    signal: Box<dyn FrameSignal>,
    state: &SharedState,
    poll_interval: Duration,
) -> Box<dyn EmulationCore> {
    loop {
        match state.get() {
            LifecycleState::Running => {
                core.advance_frame(producer.back_mut());
                if let Some(sequence) = producer.publish() {
                    trace!("Frame {} ready", sequence);
                    signal.frame_ready(sequence);
                }
            }
            LifecycleState::Paused => thread::sleep(poll_interval),
            LifecycleState::Exiting => break,
        }
    }
    core
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::mpsc;
    use std::time::Instant;

    use super::*;
    use crate::audio::AudioFormat;
    use crate::framebuffer::{self, IndexedFramebuffer};
    use crate::AudioGenerator;

    const POLL: Duration = Duration::from_millis(5);
    const TIMEOUT: Duration = Duration::from_secs(5);

    struct CountingCore {
        frames: Arc<AtomicUsize>,
        shut_down: Arc<AtomicBool>,
    }

    struct Silence;

    impl AudioGenerator for Silence {
        fn generate(&mut self, buf: &mut [u8]) {
            buf.fill(0);
        }
    }

    impl EmulationCore for CountingCore {
        fn initialise(&mut self, _args: &[String]) -> Result<()> {
            Ok(())
        }

        fn advance_frame(&mut self, frame: &mut IndexedFramebuffer) {
            let n = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
            frame.fill((n % 255 + 1) as u8);
            thread::sleep(Duration::from_millis(1));
        }

        fn audio_generator(&mut self, _: &AudioFormat, _: u32) -> Box<dyn AudioGenerator> {
            Box::new(Silence)
        }

        fn shutdown(&mut self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    struct Harness {
        lifecycle: Lifecycle,
        frames: Arc<AtomicUsize>,
        shut_down: Arc<AtomicBool>,
        ready: mpsc::Receiver<u64>,
        reader: framebuffer::FrameReader,
    }

    fn start(surface_ready: bool) -> Harness {
        let frames = Arc::new(AtomicUsize::new(0));
        let shut_down = Arc::new(AtomicBool::new(false));
        let core = CountingCore {
            frames: Arc::clone(&frames),
            shut_down: Arc::clone(&shut_down),
        };
        let (producer, reader) = framebuffer::exchange(8, 4);
        let (tx, ready) = mpsc::channel();
        let signal = move |seq: u64| {
            let _ = tx.send(seq);
        };
        let lifecycle = Lifecycle::start(
            Box::new(core),
            producer,
            Box::new(signal),
            LifecycleConfig {
                poll_interval: POLL,
                surface_ready,
            },
        )
        .unwrap();

        Harness {
            lifecycle,
            frames,
            shut_down,
            ready,
            reader,
        }
    }

    fn wait_for_frames(frames: &AtomicUsize, above: usize) {
        let start = Instant::now();
        while frames.load(Ordering::SeqCst) <= above {
            assert!(start.elapsed() < TIMEOUT, "emulation thread stalled");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_running_advances_and_signals() {
        let h = start(true);
        assert_eq!(h.lifecycle.state(), LifecycleState::Running);

        let seq = h.ready.recv_timeout(TIMEOUT).unwrap();
        assert!(seq >= 1);
        assert!(h.reader.sequence() >= seq);
        h.reader.read(|frame, _| {
            let first = frame.pixels()[0];
            assert!(first != 0);
            assert!(frame.pixels().iter().all(|&p| p == first));
        });

        h.lifecycle.request_exit();
    }

    #[test]
    fn test_waits_for_surface() {
        let h = start(false);
        assert_eq!(h.lifecycle.state(), LifecycleState::Paused);
        thread::sleep(POLL * 4);
        assert_eq!(h.frames.load(Ordering::SeqCst), 0);

        // resuming doesn't help until the surface is there
        h.lifecycle.request_resume();
        assert_eq!(h.lifecycle.state(), LifecycleState::Paused);

        h.lifecycle.surface_ready();
        assert_eq!(h.lifecycle.state(), LifecycleState::Running);
        wait_for_frames(&h.frames, 0);

        h.lifecycle.request_exit();
    }

    #[test]
    fn test_pause_stops_frames() {
        let h = start(true);
        wait_for_frames(&h.frames, 0);

        h.lifecycle.request_pause();
        assert_eq!(h.lifecycle.state(), LifecycleState::Paused);
        // let the thread finish the frame in flight
        thread::sleep(POLL * 4);
        let paused_at = h.frames.load(Ordering::SeqCst);
        thread::sleep(POLL * 4);
        assert_eq!(h.frames.load(Ordering::SeqCst), paused_at);

        h.lifecycle.request_resume();
        wait_for_frames(&h.frames, paused_at);

        h.lifecycle.request_exit();
    }

    #[test]
    fn test_quick_pause_resume_keeps_running() {
        let h = start(true);
        wait_for_frames(&h.frames, 0);

        h.lifecycle.request_pause();
        h.lifecycle.request_resume();
        assert_eq!(h.lifecycle.state(), LifecycleState::Running);

        let before = h.frames.load(Ordering::SeqCst);
        wait_for_frames(&h.frames, before + 2);

        h.lifecycle.request_exit();
    }

    #[test]
    fn test_redundant_transitions_are_noops() {
        let h = start(true);
        h.lifecycle.request_resume();
        h.lifecycle.request_resume();
        assert_eq!(h.lifecycle.state(), LifecycleState::Running);
        h.lifecycle.request_pause();
        h.lifecycle.request_pause();
        assert_eq!(h.lifecycle.state(), LifecycleState::Paused);
        h.lifecycle.surface_ready();
        assert_eq!(h.lifecycle.state(), LifecycleState::Paused);
        h.lifecycle.request_exit();
    }

    #[test]
    fn test_exit_is_synchronous_and_repeatable() {
        let h = start(true);
        wait_for_frames(&h.frames, 0);

        let mut core = h.lifecycle.request_exit().expect("core handed back");
        // the thread is gone: no more frames
        let after_exit = h.frames.load(Ordering::SeqCst);
        thread::sleep(POLL * 4);
        assert_eq!(h.frames.load(Ordering::SeqCst), after_exit);
        assert_eq!(h.lifecycle.state(), LifecycleState::Exiting);

        assert!(h.lifecycle.request_exit().is_none());

        core.shutdown();
        assert!(h.shut_down.load(Ordering::SeqCst));
    }

    #[test]
    fn test_exit_is_final() {
        let h = start(false);
        h.lifecycle.request_exit();
        h.lifecycle.request_resume();
        h.lifecycle.surface_ready();
        assert_eq!(h.lifecycle.state(), LifecycleState::Exiting);
        assert_eq!(h.frames.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_shuts_down_core() {
        let h = start(true);
        let shut_down = Arc::clone(&h.shut_down);
        drop(h);
        assert!(shut_down.load(Ordering::SeqCst));
    }
}
