use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};

use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub left: usize,
    pub top: usize,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    pub const fn new(left: usize, top: usize, width: usize, height: usize) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Exclusive right edge
    pub const fn right(&self) -> usize {
        self.left + self.width
    }

    /// Exclusive bottom edge
    pub const fn bottom(&self) -> usize {
        self.top + self.height
    }

    pub fn contains(&self, x: usize, y: usize) -> bool {
        (self.left..self.right()).contains(&x) && (self.top..self.bottom()).contains(&y)
    }

    pub fn fits_in(&self, width: usize, height: usize) -> bool {
        self.right() <= width && self.bottom() <= height
    }
}

/// A grid of palette indices, as produced by the emulation core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFramebuffer {
    width: usize,
    height: usize,
    pixels: Box<[u8]>,
}

impl IndexedFramebuffer {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width * height].into_boxed_slice(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Row-major pixel data, `width` bytes per row.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.pixels[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, index: u8) {
        self.pixels[y * self.width + x] = index;
    }

    pub fn row(&self, y: usize) -> &[u8] {
        &self.pixels[y * self.width..(y + 1) * self.width]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        &mut self.pixels[y * self.width..(y + 1) * self.width]
    }

    pub fn fill(&mut self, index: u8) {
        self.pixels.fill(index);
    }
}

/// The published ("front") frame shared between the emulation thread and the renderer.
#[derive(Debug)]
struct Exchange {
    front: Mutex<IndexedFramebuffer>,
    sequence: AtomicU64,
}

/// Create the two halves of a double-buffered frame exchange for frames of the given size.
///
/// The producer owns the back buffer and writes into it without any locking. Publishing swaps it
/// with the front buffer, unless the renderer is reading the front buffer at that moment, in
/// which case the frame is dropped instead of waiting for the reader.
pub fn exchange(width: usize, height: usize) -> (FrameProducer, FrameReader) {
    let shared = Arc::new(Exchange {
        front: Mutex::new(IndexedFramebuffer::new(width, height)),
        sequence: AtomicU64::new(0),
    });

    let producer = FrameProducer {
        back: IndexedFramebuffer::new(width, height),
        shared: Arc::clone(&shared),
        dropped: 0,
    };
    (producer, FrameReader { shared })
}

/// Emulation thread side of the exchange.
#[derive(Debug)]
pub struct FrameProducer {
    back: IndexedFramebuffer,
    shared: Arc<Exchange>,
    dropped: u64,
}

impl FrameProducer {
    /// The buffer the next frame should be written into.
    pub fn back_mut(&mut self) -> &mut IndexedFramebuffer {
        &mut self.back
    }

    /// Make the back buffer the current frame.
    ///
    /// Returns the new frame sequence number, or `None` if the renderer was busy reading the
    /// current frame. In that case the back buffer is kept and the frame is dropped.
    pub fn publish(&mut self) -> Option<u64> {
        let mut front = match self.shared.front.try_lock() {
            Ok(front) => front,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                self.dropped += 1;
                trace!("Renderer busy, dropping frame ({} dropped so far)", self.dropped);
                return None;
            }
        };
        std::mem::swap(&mut *front, &mut self.back);
        let sequence = self.shared.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        Some(sequence)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Render side of the exchange.
#[derive(Debug, Clone)]
pub struct FrameReader {
    shared: Arc<Exchange>,
}

impl FrameReader {
    /// Sequence number of the latest published frame. 0 means nothing was published yet.
    pub fn sequence(&self) -> u64 {
        self.shared.sequence.load(Ordering::SeqCst)
    }

    /// Read the latest published frame.
    ///
    /// The frame cannot be replaced while `f` runs, so it always observes one complete frame.
    /// Keep `f` short: the emulation thread drops frames for as long as it runs.
    pub fn read<R>(&self, f: impl FnOnce(&IndexedFramebuffer, u64) -> R) -> R {
        let front = self
            .shared
            .front
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let sequence = self.sequence();
        f(&front, sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect() {
        let r = Rect::new(24, 8, 336, 224);
        assert_eq!(r.right(), 360);
        assert_eq!(r.bottom(), 232);
        assert!(r.contains(24, 8));
        assert!(r.contains(359, 231));
        assert!(!r.contains(360, 8));
        assert!(!r.contains(24, 232));
        assert!(r.fits_in(384, 240));
        assert!(!r.fits_in(359, 240));
    }

    #[test]
    fn test_publish_swaps_buffers() {
        let (mut producer, reader) = exchange(4, 2);
        assert_eq!(reader.sequence(), 0);

        producer.back_mut().fill(7);
        assert_eq!(producer.publish(), Some(1));
        reader.read(|frame, seq| {
            assert_eq!(seq, 1);
            assert!(frame.pixels().iter().all(|&p| p == 7));
        });

        // The producer got the old front buffer back, writing to it doesn't affect the reader
        producer.back_mut().fill(9);
        reader.read(|frame, _| assert!(frame.pixels().iter().all(|&p| p == 7)));

        assert_eq!(producer.publish(), Some(2));
        reader.read(|frame, seq| {
            assert_eq!(seq, 2);
            assert!(frame.pixels().iter().all(|&p| p == 9));
        });
    }

    #[test]
    fn test_publish_while_reading_drops_frame() {
        let (mut producer, reader) = exchange(4, 2);
        producer.back_mut().fill(1);
        producer.publish();

        reader.read(|frame, _| {
            producer.back_mut().fill(2);
            // the front buffer is being read, it must not be swapped out
            assert_eq!(producer.publish(), None);
            assert!(frame.pixels().iter().all(|&p| p == 1));
        });
        assert_eq!(producer.dropped(), 1);
        assert_eq!(reader.sequence(), 1);

        // the back buffer was kept, so the next publish succeeds with it
        assert_eq!(producer.publish(), Some(2));
        reader.read(|frame, _| assert!(frame.pixels().iter().all(|&p| p == 2)));
    }

    #[test]
    fn test_reader_never_sees_partial_frame() {
        let (mut producer, reader) = exchange(64, 32);
        let writer = std::thread::spawn(move || {
            for i in 0..500u32 {
                let value = (i % 251) as u8;
                producer.back_mut().fill(value);
                producer.publish();
            }
        });

        for _ in 0..500 {
            reader.read(|frame, _| {
                let first = frame.pixels()[0];
                assert!(frame.pixels().iter().all(|&p| p == first));
            });
        }
        writer.join().unwrap();
    }
}
