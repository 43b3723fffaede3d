//! Shared Buffer Descriptor
//!
//! A metadata page followed by a power-of-two data region. The head and tail
//! counters live in the metadata page at the offsets the kernel uses for
//! `perf_event_mmap_page`, so the same accessors serve a real perf mapping
//! and the in-process simulation ring.
//!
//! This module is the only place that touches the shared memory directly.
//! Everything above it works with `RingSpan` borrows.

use crate::error::{CaptureError, CaptureResult};
use crate::producer::RingProducer;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use syscap_core::BufferId;

/// `perf_event_mmap_page::data_head`
pub const DATA_HEAD_OFFSET: usize = 1024;
/// `perf_event_mmap_page::data_tail`
pub const DATA_TAIL_OFFSET: usize = 1032;
/// `perf_event_mmap_page::data_offset`
pub const DATA_OFFSET_OFFSET: usize = 1040;
/// `perf_event_mmap_page::data_size`
pub const DATA_SIZE_OFFSET: usize = 1048;

/// Size of the metadata page for heap-backed buffers
pub const META_PAGE_SIZE: usize = 4096;

/// Smallest accepted data region
pub const MIN_DATA_SIZE: usize = 64;

enum Backing {
    Heap(Layout),
    #[cfg(target_os = "linux")]
    Mmap,
}

/// Raw shared memory region
pub(crate) struct Region {
    base: NonNull<u8>,
    len: usize,
    data_offset: usize,
    data_size: usize,
    backing: Backing,
}

// The region is only accessed through atomics (counters) and through byte
// ranges that the head/tail protocol partitions between the two sides.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn heap(data_size: usize) -> CaptureResult<Self> {
        validate_data_size(data_size)?;
        let len = META_PAGE_SIZE + data_size;
        let layout = Layout::from_size_align(len, META_PAGE_SIZE)
            .map_err(|e| CaptureError::InvalidLayout(e.to_string()))?;

        // SAFETY: layout has a non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(raw)
            .ok_or_else(|| CaptureError::InvalidLayout(format!("allocation of {} bytes failed", len)))?;

        let region = Self {
            base,
            len,
            data_offset: META_PAGE_SIZE,
            data_size,
            backing: Backing::Heap(layout),
        };
        region
            .counter(DATA_OFFSET_OFFSET)
            .store(META_PAGE_SIZE as u64, Ordering::Relaxed);
        region
            .counter(DATA_SIZE_OFFSET)
            .store(data_size as u64, Ordering::Relaxed);
        Ok(region)
    }

    /// Adopt an existing perf mapping
    ///
    /// # Safety
    ///
    /// `base` must point at a live `MAP_SHARED` mapping of `len` bytes that
    /// stays mapped until the region is dropped. The mapping is released if
    /// the descriptor page does not describe a usable data region.
    #[cfg(target_os = "linux")]
    pub(crate) unsafe fn from_mmap(base: NonNull<u8>, len: usize) -> CaptureResult<Self> {
        let mut region = Self {
            base,
            len,
            data_offset: 0,
            data_size: 0,
            backing: Backing::Mmap,
        };
        let data_offset = region.counter(DATA_OFFSET_OFFSET).load(Ordering::Relaxed) as usize;
        let data_size = region.counter(DATA_SIZE_OFFSET).load(Ordering::Relaxed) as usize;
        validate_data_size(data_size)?;
        if data_offset < DATA_SIZE_OFFSET + 8 || data_offset.checked_add(data_size).map_or(true, |end| end > len) {
            return Err(CaptureError::InvalidLayout(format!(
                "data region {}+{} does not fit a {} byte mapping",
                data_offset, data_size, len
            )));
        }
        region.data_offset = data_offset;
        region.data_size = data_size;
        Ok(region)
    }

    fn counter(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset % 8 == 0 && offset + 8 <= self.len);
        // SAFETY: the base is page aligned, the offset is 8-byte aligned and
        // inside the metadata page, and the counter is only accessed atomically.
        unsafe { &*(self.base.as_ptr().add(offset) as *const AtomicU64) }
    }

    pub(crate) fn data_size(&self) -> usize {
        self.data_size
    }

    pub(crate) fn load_head(&self) -> u64 {
        self.counter(DATA_HEAD_OFFSET).load(Ordering::Acquire)
    }

    pub(crate) fn load_tail(&self) -> u64 {
        self.counter(DATA_TAIL_OFFSET).load(Ordering::Acquire)
    }

    pub(crate) fn store_tail(&self, tail: u64) {
        self.counter(DATA_TAIL_OFFSET).store(tail, Ordering::Release);
    }

    pub(crate) fn store_head(&self, head: u64) {
        self.counter(DATA_HEAD_OFFSET).store(head, Ordering::Release);
    }

    /// Borrow `len` data bytes starting at ring offset `at`
    ///
    /// # Safety
    ///
    /// The range must be published (between tail and head) and must not be
    /// written by the producer for the lifetime of the borrow.
    pub(crate) unsafe fn data_slice(&self, at: usize, len: usize) -> &[u8] {
        debug_assert!(at + len <= self.data_size);
        std::slice::from_raw_parts(self.base.as_ptr().add(self.data_offset + at), len)
    }

    /// Copy `bytes` into the data region at ring offset `at`
    ///
    /// # Safety
    ///
    /// The range must be free space (between head and tail + size), so the
    /// reader holds no borrow over it.
    pub(crate) unsafe fn write_data(&self, at: usize, bytes: &[u8]) {
        debug_assert!(at + bytes.len() <= self.data_size);
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            self.base.as_ptr().add(self.data_offset + at),
            bytes.len(),
        );
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        match self.backing {
            // SAFETY: allocated in Region::heap with this layout
            Backing::Heap(layout) => unsafe { alloc::dealloc(self.base.as_ptr(), layout) },
            #[cfg(target_os = "linux")]
            Backing::Mmap => {
                // SAFETY: the mapping was handed over in from_mmap
                let rc = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) };
                if rc != 0 {
                    tracing::warn!("munmap of {} bytes failed: {}", self.len, std::io::Error::last_os_error());
                }
            }
        }
    }
}

fn validate_data_size(data_size: usize) -> CaptureResult<()> {
    if data_size < MIN_DATA_SIZE || !data_size.is_power_of_two() {
        return Err(CaptureError::InvalidLayout(format!(
            "data size {} is not a power of two of at least {}",
            data_size, MIN_DATA_SIZE
        )));
    }
    Ok(())
}

/// Readable bytes between `tail` and `head` in a ring of `data_size` bytes
///
/// Offsets are taken modulo the ring size. When the tail offset is past the
/// head offset the readable run wraps the physical end. Equal offsets with
/// distinct counters mean the producer filled the whole ring.
pub fn readable_len(head: u64, tail: u64, data_size: u64) -> u64 {
    let begin = tail % data_size;
    let end = head % data_size;
    if begin > end {
        data_size - begin + end
    } else if begin == end && head != tail {
        data_size
    } else {
        end - begin
    }
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingPointers {
    pub head: u64,
    pub tail: u64,
    pub read_size: u64,
}

/// One mapped per-CPU buffer, reader side
pub struct SharedBuffer {
    id: BufferId,
    region: Arc<Region>,
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("id", &self.id)
            .field("data_size", &self.region.data_size)
            .finish()
    }
}

impl SharedBuffer {
    /// Heap-backed ring together with its in-process producer
    pub fn with_producer(id: BufferId, data_size: usize) -> CaptureResult<(Self, RingProducer)> {
        Self::with_producer_at(id, data_size, 0)
    }

    /// Like `with_producer`, with both counters starting at `start`
    ///
    /// Starting near the ring end puts the first records across the wrap.
    pub fn with_producer_at(
        id: BufferId,
        data_size: usize,
        start: u64,
    ) -> CaptureResult<(Self, RingProducer)> {
        let region = Arc::new(Region::heap(data_size)?);
        region.store_tail(start);
        region.store_head(start);
        let producer = RingProducer::new(id, region.clone());
        Ok((Self { id, region }, producer))
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn from_region(id: BufferId, region: Region) -> Self {
        Self {
            id,
            region: Arc::new(region),
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn data_size(&self) -> usize {
        self.region.data_size()
    }

    /// Load both counters, head first with acquire ordering
    pub fn pointers(&self) -> RingPointers {
        let head = self.region.load_head();
        let tail = self.region.load_tail();
        RingPointers {
            head,
            tail,
            read_size: readable_len(head, tail, self.region.data_size() as u64),
        }
    }

    /// Borrow `len` published bytes starting at counter `tail`
    ///
    /// `len` must not exceed what `pointers()` reported for that tail.
    pub(crate) fn span(&self, tail: u64, len: u64) -> RingSpan<'_> {
        let size = self.region.data_size();
        let len = (len as usize).min(size);
        let begin = (tail % size as u64) as usize;
        let first_len = len.min(size - begin);
        // SAFETY: [tail, tail + len) is published and the producer does not
        // write it until the tail moves, which needs the reader's &mut.
        let (first, second) = unsafe {
            (
                self.region.data_slice(begin, first_len),
                self.region.data_slice(0, len - first_len),
            )
        };
        RingSpan {
            first,
            second,
            start: tail,
        }
    }

    pub(crate) fn store_tail(&self, tail: u64) {
        self.region.store_tail(tail);
    }
}

/// Location of a byte range inside a span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Piece<'a> {
    /// The range is one run of ring memory
    Contiguous(&'a [u8]),
    /// The range crosses the physical end of the ring
    Split(&'a [u8], &'a [u8]),
}

/// Readable window of a ring, borrowed until the next commit
///
/// At most two runs: from the tail offset to the physical end, and from the
/// start of the data region. The second run is empty unless the window wraps.
#[derive(Debug, Clone, Copy)]
pub struct RingSpan<'a> {
    first: &'a [u8],
    second: &'a [u8],
    start: u64,
}

impl<'a> RingSpan<'a> {
    pub fn empty(start: u64) -> RingSpan<'static> {
        RingSpan {
            first: &[],
            second: &[],
            start,
        }
    }

    /// Span over a plain byte slice, for framing stored data
    pub fn from_slice(bytes: &'a [u8]) -> Self {
        Self {
            first: bytes,
            second: &[],
            start: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tail counter the span starts at
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Whether the span crosses the physical end of the ring
    pub fn wraps(&self) -> bool {
        !self.second.is_empty()
    }

    /// The run starting at the tail offset
    pub fn contiguous(&self) -> &'a [u8] {
        self.first
    }

    /// Locate `len` bytes at `offset`, `None` if out of range
    pub fn piece(&self, offset: usize, len: usize) -> Option<Piece<'a>> {
        let end = offset.checked_add(len)?;
        if end > self.len() {
            return None;
        }
        let split = self.first.len();
        Some(if end <= split {
            Piece::Contiguous(&self.first[offset..end])
        } else if offset >= split {
            Piece::Contiguous(&self.second[offset - split..end - split])
        } else {
            Piece::Split(&self.first[offset..], &self.second[..end - split])
        })
    }

    /// Copy `N` bytes at `offset`
    pub fn read_array<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let mut out = [0u8; N];
        match self.piece(offset, N)? {
            Piece::Contiguous(bytes) => out.copy_from_slice(bytes),
            Piece::Split(head, tail) => {
                out[..head.len()].copy_from_slice(head);
                out[head.len()..].copy_from_slice(tail);
            }
        }
        Some(out)
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        self.read_array(offset).map(u32::from_le_bytes)
    }

    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        self.read_array(offset).map(u64::from_le_bytes)
    }
}
