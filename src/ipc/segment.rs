//! Shared memory arena with a fixed-layout control header
//!
//! ```text
//! offset 0    stop flag            (AtomicU32, parent writes)
//! offset 64   bytes transferred    (AtomicU64, producer writes)
//! offset 128  messages published   (AtomicU64, producer writes)
//! offset 136  producer finished    (AtomicU32, producer/parent write)
//! offset 192  messages consumed    (AtomicU64, consumer writes)
//! offset 200  messages corrupt     (AtomicU64, consumer writes)
//! offset 208  latency samples      (AtomicU64, consumer writes)
//! offset 256  latency sample slots (AtomicU64 f64 bits, sample_capacity)
//! aligned     payload slot         (payload_capacity bytes)
//! ```
//!
//! Fields written by different sides live on different cache lines. All
//! header access goes through [`ControlBlock`] so the memory ordering is
//! explicit at every use.

use super::IpcError;
use shared_memory::{Shmem, ShmemConf};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

const CACHE_LINE: usize = 64;
const STOP_FLAG_OFFSET: usize = 0;
const BYTES_TRANSFERRED_OFFSET: usize = 64;
const PUBLISHED_OFFSET: usize = 128;
const PRODUCER_DONE_OFFSET: usize = 136;
const CONSUMED_OFFSET: usize = 192;
const CORRUPT_OFFSET: usize = 200;
const SAMPLE_COUNT_OFFSET: usize = 208;

/// Sizes of the variable parts of the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    pub sample_capacity: usize,
    pub payload_capacity: usize,
}

impl SegmentLayout {
    pub const HEADER_LEN: usize = 256;

    pub fn samples_offset(&self) -> usize {
        Self::HEADER_LEN
    }

    pub fn payload_offset(&self) -> usize {
        let end = Self::HEADER_LEN + self.sample_capacity * std::mem::size_of::<u64>();
        (end + CACHE_LINE - 1) / CACHE_LINE * CACHE_LINE
    }

    pub fn required_len(&self) -> usize {
        self.payload_offset() + self.payload_capacity
    }
}

/// Typed view of the control header and payload slot
///
/// Cheap to copy; valid for as long as the segment it was taken from.
#[derive(Clone, Copy)]
pub struct ControlBlock<'a> {
    base: NonNull<u8>,
    layout: SegmentLayout,
    _segment: PhantomData<&'a ()>,
}

// SAFETY: every shared field is accessed through atomics; the payload slot
// is only touched inside the unsafe read/write functions whose contract
// requires the caller to hold the slot via the semaphore protocol.
unsafe impl Send for ControlBlock<'_> {}
unsafe impl Sync for ControlBlock<'_> {}

impl<'a> ControlBlock<'a> {
    /// # Safety
    ///
    /// `base` must be 8-byte aligned, point to at least
    /// `layout.required_len()` writable bytes, and outlive `'a`.
    pub(crate) unsafe fn from_raw(base: NonNull<u8>, layout: SegmentLayout) -> Self {
        Self {
            base,
            layout,
            _segment: PhantomData,
        }
    }

    fn u32_at(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: offsets are fixed, aligned and inside the header.
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU32) }
    }

    fn u64_at(&self, offset: usize) -> &AtomicU64 {
        // SAFETY: offsets are fixed, 8-aligned and inside the mapped region.
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU64) }
    }

    pub fn layout(&self) -> SegmentLayout {
        self.layout
    }

    /// Zero every header counter before a new exchange
    pub fn reset(&self) {
        self.u32_at(STOP_FLAG_OFFSET).store(0, Ordering::Relaxed);
        self.u32_at(PRODUCER_DONE_OFFSET).store(0, Ordering::Relaxed);
        for offset in [
            BYTES_TRANSFERRED_OFFSET,
            PUBLISHED_OFFSET,
            CONSUMED_OFFSET,
            CORRUPT_OFFSET,
            SAMPLE_COUNT_OFFSET,
        ] {
            self.u64_at(offset).store(0, Ordering::Relaxed);
        }
        std::sync::atomic::fence(Ordering::Release);
    }

    pub fn request_stop(&self) {
        self.u32_at(STOP_FLAG_OFFSET).store(1, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.u32_at(STOP_FLAG_OFFSET).load(Ordering::Acquire) != 0
    }

    pub fn mark_producer_done(&self) {
        self.u32_at(PRODUCER_DONE_OFFSET).store(1, Ordering::Release);
    }

    pub fn producer_done(&self) -> bool {
        self.u32_at(PRODUCER_DONE_OFFSET).load(Ordering::Acquire) != 0
    }

    pub fn add_bytes_transferred(&self, bytes: u64) {
        self.u64_at(BYTES_TRANSFERRED_OFFSET)
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.u64_at(BYTES_TRANSFERRED_OFFSET).load(Ordering::Acquire)
    }

    /// Announce that the payload slot holds the next message; returns its
    /// sequence number
    pub fn publish(&self) -> u64 {
        self.u64_at(PUBLISHED_OFFSET).fetch_add(1, Ordering::Release) + 1
    }

    pub fn published(&self) -> u64 {
        self.u64_at(PUBLISHED_OFFSET).load(Ordering::Acquire)
    }

    pub fn record_consumed(&self) {
        self.u64_at(CONSUMED_OFFSET).fetch_add(1, Ordering::Release);
    }

    pub fn consumed(&self) -> u64 {
        self.u64_at(CONSUMED_OFFSET).load(Ordering::Acquire)
    }

    pub fn record_corrupt(&self) {
        self.u64_at(CORRUPT_OFFSET).fetch_add(1, Ordering::Release);
    }

    pub fn corrupt(&self) -> u64 {
        self.u64_at(CORRUPT_OFFSET).load(Ordering::Acquire)
    }

    /// Store one latency sample; samples past capacity are counted only.
    /// Single writer.
    pub fn record_latency(&self, value: f64) {
        let count = self.u64_at(SAMPLE_COUNT_OFFSET);
        let index = count.load(Ordering::Relaxed) as usize;
        if index < self.layout.sample_capacity {
            let slot = self.layout.samples_offset() + index * std::mem::size_of::<u64>();
            self.u64_at(slot).store(value.to_bits(), Ordering::Relaxed);
        }
        count.store(index as u64 + 1, Ordering::Release);
    }

    /// Number of latency samples recorded, including those past capacity
    pub fn latency_samples_recorded(&self) -> u64 {
        self.u64_at(SAMPLE_COUNT_OFFSET).load(Ordering::Acquire)
    }

    pub fn latency_samples(&self) -> Vec<f64> {
        let stored = (self.latency_samples_recorded() as usize).min(self.layout.sample_capacity);
        (0..stored)
            .map(|i| {
                let slot = self.layout.samples_offset() + i * std::mem::size_of::<u64>();
                f64::from_bits(self.u64_at(slot).load(Ordering::Relaxed))
            })
            .collect()
    }

    /// Copy `src` into the payload slot, truncated to its capacity
    ///
    /// # Safety
    ///
    /// The caller must own the slot: no other process or thread may read or
    /// write it until ownership is handed over through the semaphores.
    pub unsafe fn write_payload(&self, src: &[u8]) -> usize {
        let len = src.len().min(self.layout.payload_capacity);
        std::ptr::copy_nonoverlapping(
            src.as_ptr(),
            self.base.as_ptr().add(self.layout.payload_offset()),
            len,
        );
        len
    }

    /// Copy the payload slot into `dst`, truncated to its capacity
    ///
    /// # Safety
    ///
    /// Same ownership requirement as [`Self::write_payload`].
    pub unsafe fn read_payload(&self, dst: &mut [u8]) -> usize {
        let len = dst.len().min(self.layout.payload_capacity);
        std::ptr::copy_nonoverlapping(
            self.base.as_ptr().add(self.layout.payload_offset()),
            dst.as_mut_ptr(),
            len,
        );
        len
    }
}

/// Named POSIX shared memory region holding a [`ControlBlock`]
pub struct SharedSegment {
    name: String,
    layout: SegmentLayout,
    shmem: Option<Shmem>,
}

// SAFETY: the mapping is only accessed through ControlBlock, whose shared
// state is atomic; Shmem itself is not touched after creation except to
// drop it in `destroy`, which requires `&mut self`.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create and zero a segment of `size` bytes named `name`
    pub fn create(name: &str, size: usize, layout: SegmentLayout) -> Result<Self, IpcError> {
        if layout.required_len() > size {
            return Err(IpcError::SegmentTooSmall {
                size,
                needed: layout.required_len(),
            });
        }

        let shmem = ShmemConf::new()
            .size(size)
            .os_id(name)
            .create()
            .map_err(|e| IpcError::SharedMemory {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        let segment = Self {
            name: name.to_string(),
            layout,
            shmem: Some(shmem),
        };
        if let Some(control) = segment.control() {
            control.reset();
        }
        debug!("Created shared memory segment {} ({} bytes)", name, size);
        Ok(segment)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.shmem.as_ref().map_or(0, |s| s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Header view, or `None` once destroyed
    pub fn control(&self) -> Option<ControlBlock<'_>> {
        let shmem = self.shmem.as_ref()?;
        let base = NonNull::new(shmem.as_ptr())?;
        // SAFETY: the mapping is page aligned, at least required_len() long,
        // and lives as long as `self` borrows it.
        Some(unsafe { ControlBlock::from_raw(base, self.layout) })
    }

    /// Unmap and unlink the segment; later calls do nothing
    pub fn destroy(&mut self) {
        if let Some(shmem) = self.shmem.take() {
            // Dropping the owning mapping unlinks the name.
            drop(shmem);
            debug!("Destroyed shared memory segment {}", self.name);
        }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::posix_resource_name;

    fn small_layout() -> SegmentLayout {
        SegmentLayout {
            sample_capacity: 4,
            payload_capacity: 128,
        }
    }

    fn with_heap_block<F: FnOnce(ControlBlock<'_>)>(layout: SegmentLayout, f: F) {
        let mut backing = vec![0u64; layout.required_len() / 8 + 1];
        let base = NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap();
        let block = unsafe { ControlBlock::from_raw(base, layout) };
        f(block);
    }

    #[test]
    fn test_layout_offsets() {
        let layout = SegmentLayout {
            sample_capacity: 3,
            payload_capacity: 1000,
        };
        assert_eq!(layout.samples_offset(), 256);
        // 256 + 24 rounds up to the next cache line
        assert_eq!(layout.payload_offset(), 320);
        assert_eq!(layout.required_len(), 1320);
    }

    #[test]
    fn test_header_counters() {
        with_heap_block(small_layout(), |block| {
            assert!(!block.stop_requested());
            block.request_stop();
            assert!(block.stop_requested());

            assert_eq!(block.publish(), 1);
            assert_eq!(block.publish(), 2);
            assert_eq!(block.published(), 2);

            block.add_bytes_transferred(64);
            block.add_bytes_transferred(64);
            assert_eq!(block.bytes_transferred(), 128);

            block.record_consumed();
            block.record_corrupt();
            assert_eq!(block.consumed(), 1);
            assert_eq!(block.corrupt(), 1);

            block.mark_producer_done();
            assert!(block.producer_done());

            block.reset();
            assert!(!block.stop_requested());
            assert!(!block.producer_done());
            assert_eq!(block.published(), 0);
            assert_eq!(block.bytes_transferred(), 0);
        });
    }

    #[test]
    fn test_latency_slots_cap_at_capacity() {
        with_heap_block(small_layout(), |block| {
            for i in 0..6 {
                block.record_latency(i as f64 * 0.5);
            }
            assert_eq!(block.latency_samples_recorded(), 6);
            assert_eq!(block.latency_samples(), vec![0.0, 0.5, 1.0, 1.5]);
        });
    }

    #[test]
    fn test_payload_round_trip_truncates() {
        with_heap_block(small_layout(), |block| {
            let src: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
            let written = unsafe { block.write_payload(&src) };
            assert_eq!(written, 128);

            let mut dst = vec![0u8; 64];
            let read = unsafe { block.read_payload(&mut dst) };
            assert_eq!(read, 64);
            assert_eq!(&dst[..], &src[..64]);
        });
    }

    #[test]
    fn test_segment_rejects_small_size() {
        let result = SharedSegment::create(&posix_resource_name("shm"), 64, small_layout());
        assert!(matches!(result, Err(IpcError::SegmentTooSmall { .. })));
    }

    #[test]
    fn test_segment_create_and_destroy() {
        let name = posix_resource_name("shm");
        let mut segment = SharedSegment::create(&name, 4096, small_layout()).unwrap();
        assert!(segment.len() >= 4096);
        {
            let control = segment.control().unwrap();
            assert_eq!(control.published(), 0);
            control.publish();
            assert_eq!(control.published(), 1);
        }

        segment.destroy();
        segment.destroy();
        assert!(segment.control().is_none());

        #[cfg(target_os = "linux")]
        assert!(!std::path::Path::new("/dev/shm")
            .join(name.trim_start_matches('/'))
            .exists());
    }
}
