//! Capture history: a virtual memory mirrored ring buffer addressed by absolute stream position.
//!
//! The mapping is doubled (`vmap::os::map_ring`), so any run of up to `len()` bytes starting
//! anywhere in the ring is contiguous in memory. Capture windows can then be borrowed as plain
//! slices regardless of where the ring wraps.

use core::marker::PhantomData;
use core::slice;

use crate::{Error, Result, Sample};

#[derive(Debug)]
pub struct RingSlice {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: Conceptually the same as `Box<[u8]>`. The destructor can run on any thread.
unsafe impl Send for RingSlice {}

impl RingSlice {
    pub fn new(min_size: usize) -> Result<RingSlice> {
        let len = min_size.max(1).next_multiple_of(vmap::allocation_size());
        let ptr = vmap::os::map_ring(len).map_err(std::io::Error::from)?;
        log::trace!("mapped ring slice at {:?}+{:#x?}*2", ptr, len);
        Ok(RingSlice { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrows `count` bytes starting at ring offset `start`, continuing past the end of the ring
    /// into its beginning.
    pub fn window(&self, start: usize, count: usize) -> &[u8] {
        assert!(start < self.len && count <= self.len);
        // SAFETY: `start + count < 2 * len`, which is the length of the doubled mapping.
        unsafe { slice::from_raw_parts(self.ptr.add(start), count) }
    }

    pub fn window_mut(&mut self, start: usize, count: usize) -> &mut [u8] {
        assert!(start < self.len && count <= self.len);
        // SAFETY: See `window`; `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.add(start), count) }
    }
}

impl Drop for RingSlice {
    fn drop(&mut self) {
        // SAFETY: Mapped with the same parameters in `Self::new`.
        match unsafe { vmap::os::unmap_ring(self.ptr, self.len) } {
            Ok(()) => log::trace!("unmapped ring slice at {:?}+{:#x?}*2", self.ptr, self.len),
            Err(error) => log::error!("failed to unmap ring slice at {:?}: {}", self.ptr, error),
        }
    }
}

/// A byte ring that remembers how much has ever been written to it.
#[derive(Debug)]
pub struct RingBuffer {
    buffer: RingSlice,
    written: u64,
}

impl RingBuffer {
    pub fn new(min_size: usize) -> Result<RingBuffer> {
        Ok(RingBuffer { buffer: RingSlice::new(min_size)?, written: 0 })
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Absolute position of the next byte to be appended.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Absolute position of the oldest byte still held.
    pub fn oldest(&self) -> u64 {
        self.written.saturating_sub(self.buffer.len() as u64)
    }

    fn index_of(&self, position: u64) -> usize {
        (position % self.buffer.len() as u64) as usize
    }

    /// Lets `writer` fill up to `max_size` bytes at the write position, and advances by the number
    /// of bytes it reports as written.
    pub fn append<F, E>(&mut self, max_size: usize, writer: F) -> core::result::Result<usize, E>
            where F: FnOnce(&mut [u8]) -> core::result::Result<usize, E> {
        let max_size = max_size.min(self.buffer.len());
        let index = self.index_of(self.written);
        let result = writer(self.buffer.window_mut(index, max_size));
        if let Ok(written) = result { self.written += written.min(max_size) as u64 }
        result
    }

    /// Borrows `count` bytes starting at absolute position `start`, or `None` if any of them has
    /// been overwritten or not yet written.
    pub fn read(&self, start: u64, count: usize) -> Option<&[u8]> {
        let end = start.checked_add(count as u64)?;
        if start < self.oldest() || end > self.written || count > self.buffer.len() {
            return None
        }
        Some(self.buffer.window(self.index_of(start), count))
    }
}

/// History of one channel, addressed by absolute sample index.
#[derive(Debug)]
pub struct SampleHistory<S> {
    ring: RingBuffer,
    _sample: PhantomData<S>,
}

impl<S: Sample> SampleHistory<S> {
    /// Creates a history that retains at least `min_samples` samples.
    pub fn new(min_samples: usize) -> Result<SampleHistory<S>> {
        let bytes = min_samples.checked_mul(std::mem::size_of::<S>())
            .ok_or_else(|| Error::InvalidParameter(format!("history of {min_samples} samples")))?;
        Ok(SampleHistory { ring: RingBuffer::new(bytes)?, _sample: PhantomData })
    }

    pub fn capacity(&self) -> usize {
        self.ring.len() / std::mem::size_of::<S>()
    }

    /// Absolute index of the next sample to be appended.
    pub fn end(&self) -> u64 {
        self.ring.written() / std::mem::size_of::<S>() as u64
    }

    /// Absolute index of the oldest sample still held.
    pub fn oldest(&self) -> u64 {
        self.ring.oldest() / std::mem::size_of::<S>() as u64
    }

    /// Appends `count` samples produced in place by `fill`.
    pub fn append_with<F>(&mut self, count: usize, fill: F) -> Result<()>
            where F: FnOnce(&mut [S]) {
        if count > self.capacity() {
            return Err(Error::InvalidParameter(format!(
                "cannot append {count} samples to a history of {}", self.capacity())))
        }
        let size = count * std::mem::size_of::<S>();
        self.ring.append(size, |bytes| -> Result<usize> {
            // the ring is page aligned and only ever advanced by whole samples
            let samples = bytemuck::try_cast_slice_mut(bytes)
                .map_err(|error| Error::InvalidParameter(format!("misaligned history: {error}")))?;
            fill(samples);
            Ok(size)
        })?;
        Ok(())
    }

    /// Borrows `count` samples starting at absolute index `start`, if they are all retained.
    pub fn read(&self, start: u64, count: usize) -> Option<&[S]> {
        let size = std::mem::size_of::<S>();
        let bytes = self.ring.read(start.checked_mul(size as u64)?, count.checked_mul(size)?)?;
        bytemuck::try_cast_slice(bytes).ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ring_slice_window() {
        let mut buf = RingSlice::new(8).unwrap();
        buf.window_mut(0, 8).copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buf.window(2, 4), &[3, 4, 5, 6]);
        assert_eq!(buf.window(5, 3), &[6, 7, 8]);
    }

    #[test]
    fn test_ring_slice_window_wraps() {
        let mut buf = RingSlice::new(8192).unwrap();
        let len = buf.len();
        buf.window_mut(len - 3, 6).copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(buf.window(0, 3), &[4, 5, 6]);
        assert_eq!(buf.window(len - 1, 2), &[3, 4]);
        assert_eq!(buf.window(len - 3, len).len(), len);
    }

    #[test]
    #[should_panic]
    fn test_ring_slice_window_longer_than_ring() {
        let buf = RingSlice::new(8).unwrap();
        buf.window(0, buf.len() + 1);
    }

    #[test]
    fn test_ring_buffer_positions() {
        let mut ring = RingBuffer::new(1).unwrap();
        let len = ring.len();
        let appended = ring.append(len - 3, |bytes| -> Result<usize> {
            bytes.fill(1);
            Ok(bytes.len())
        }).unwrap();
        assert_eq!(appended, len - 3);
        ring.append(6, |bytes| -> Result<usize> {
            bytes.copy_from_slice(&[2, 3, 4, 5, 6, 7]);
            Ok(6)
        }).unwrap();
        assert_eq!(ring.written(), len as u64 + 3);
        assert_eq!(ring.oldest(), 3);
        // the read crosses the physical end of the ring
        assert_eq!(ring.read(len as u64 - 4, 5).unwrap(), &[1, 2, 3, 4, 5]);
        assert!(ring.read(2, 4).is_none());
        assert!(ring.read(len as u64, 4).is_none());
    }

    #[test]
    fn test_short_append_advances_by_written() {
        let mut ring = RingBuffer::new(64).unwrap();
        ring.append(16, |bytes| -> Result<usize> {
            bytes[..4].copy_from_slice(&[9, 9, 9, 9]);
            Ok(4)
        }).unwrap();
        assert_eq!(ring.written(), 4);
        assert!(ring.append(16, |_| Err(Error::HorizontalNotSet)).is_err());
        assert_eq!(ring.written(), 4);
    }

    #[test]
    fn test_sample_history() {
        let mut history = SampleHistory::<i16>::new(100).unwrap();
        let capacity = history.capacity();
        assert!(capacity >= 100);
        let mut next = 0i16;
        for _ in 0..3 {
            history.append_with(capacity / 2, |samples| {
                for sample in samples {
                    *sample = next;
                    next = next.wrapping_add(1);
                }
            }).unwrap();
        }
        let end = history.end();
        assert_eq!(end, (capacity / 2 * 3) as u64);
        assert_eq!(history.oldest(), end - capacity as u64);
        let window = history.read(end - 10, 10).unwrap();
        assert_eq!(window[9], (end - 1) as i16);
        assert_eq!(window[0], (end - 10) as i16);
        assert!(history.read(history.oldest() - 1, 2).is_none());
        assert!(history.append_with(capacity + 1, |_| ()).is_err());
    }
}
