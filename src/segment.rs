//! Shared database memory segment.
//!
//! The segment may be mapped at different virtual addresses in different
//! processes, so everything inside it refers to other locations by byte
//! offset from the segment base, never by pointer. [`Segment`] owns (or
//! borrows) the raw mapping and hands out typed accessors for the shared
//! words instead of exposing addresses.

use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::{mem, slice};

use thiserror::Error;

/// Marker stored in the header of every initialized segment.
const SEGMENT_MARK: u64 = 0x7365_676c_6f63_6b31; // "seglock1"

/// Alignment and cell size for synchronization variables, sized so that
/// each queue node spins on its own cache line.
pub const SYN_VAR_PADDING: usize = 128;

const WORD: usize = mem::size_of::<u64>();

/// Errors from segment creation and attachment.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// The backing memory could not be allocated.
    #[error("cannot allocate {0} bytes of shared memory")]
    AllocFailed(usize),

    /// An attached mapping is smaller than the fixed segment prologue.
    #[error("segment too small: {got} bytes, need at least {need}")]
    TooSmall { got: usize, need: usize },

    /// An attached mapping does not satisfy the segment alignment.
    #[error("segment base is not aligned to {0} bytes")]
    Misaligned(usize),
}

/// Lock control block, part of the segment header.
///
/// `tail`, `next_writer`, `reader_count` and `freelist` belong to the
/// queued locking algorithm; the global-flag algorithm uses only the
/// word designated by `global_lock`.
#[repr(C)]
pub struct LockHdr {
    /// Offset of the global-flag lock word.
    pub global_lock: u64,
    /// Offset of the last queue node, or 0 for an empty queue.
    pub tail: AtomicU64,
    /// Offset of the writer node that acquires once readers drain, or 0.
    pub next_writer: AtomicU64,
    /// Number of readers currently inside the critical section.
    pub reader_count: AtomicU64,
    /// Base offset of the queue node pool.
    pub storage: u64,
    /// Capacity of the node pool.
    pub max_nodes: u64,
    /// Top-of-stack offset of the node freelist.
    pub freelist: AtomicU64,
}

/// Segment header, always at offset 0 of the mapping.
#[repr(C)]
pub struct SegmentHeader {
    mark: u64,
    len: u64,
    /// Lock subsystem control words.
    pub locks: LockHdr,
    data: u64,
    data_len: u64,
}

/// One queue node cell. Padded to a cache line of its own so that a
/// requester spinning on `state` does not share the line with anyone.
#[repr(C, align(128))]
pub struct QueueNode {
    /// This requester's kind.
    pub class: AtomicU64,
    /// Offset of the successor node, or 0.
    pub next: AtomicU64,
    /// Bit 0: blocked. Upper bits: successor class hint.
    pub state: AtomicU64,
    /// Reference count. Even while referenced; bit 0 marks a cell claimed
    /// for the freelist push.
    pub refcount: AtomicU64,
    /// Freelist link, meaningful only while the cell is free.
    pub next_cell: AtomicU64,
}

enum Backing {
    #[cfg(target_os = "linux")]
    Mmap { len: usize },
    Heap { layout: std::alloc::Layout },
    Foreign,
}

/// Handle to a shared database memory segment.
pub struct Segment {
    base: *mut u8,
    len: usize,
    backing: Backing,
}

// The segment is a raw shared mapping; all concurrent access goes through
// the atomic words handed out below.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

const fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[cfg(target_os = "linux")]
mod shm_alloc {
    use std::ptr;

    const HUGE_PAGE_SIZE: usize = 1 << 21;

    fn mmap_shared(len: usize, flags: i32) -> *mut u8 {
        // MAP_SHARED so that a forked process observes the same lock state.
        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS | flags,
                -1,
                0,
            ) as *mut u8
        };

        if ret != libc::MAP_FAILED as _ {
            ret
        } else {
            ptr::null_mut()
        }
    }

    /// Map a zeroed shared region, preferring huge pages.
    /// Returns the base and the length actually mapped.
    pub(super) fn alloc(len: usize) -> Option<(*mut u8, usize)> {
        let huge_len = super::round_up(len, HUGE_PAGE_SIZE);
        let ptr = mmap_shared(huge_len, libc::MAP_HUGETLB);
        if !ptr.is_null() {
            return Some((ptr, huge_len));
        }

        log::warn!(
            "failed to mmap {}MB hugepages, trying normal pages; performance can be low",
            huge_len >> 20
        );

        let page_len = super::round_up(len, 1 << 12);
        let ptr = mmap_shared(page_len, 0);
        if !ptr.is_null() {
            return Some((ptr, page_len));
        }
        None
    }

    pub(super) fn free(base: *mut u8, len: usize) {
        unsafe { libc::munmap(base as *mut libc::c_void, len) };
    }
}

impl Segment {
    /// Create and initialize a fresh segment.
    ///
    /// `max_nodes` sizes the queue node pool; `data_len` sizes the
    /// application data region. Single-threaded; the handle may be shared
    /// freely afterwards. The lock queue itself still has to be threaded
    /// by [`init_lock_queue`](crate::lock::init_lock_queue).
    pub fn create(max_nodes: usize, data_len: usize) -> Result<Self, SegmentError> {
        let header_len = round_up(mem::size_of::<SegmentHeader>(), SYN_VAR_PADDING);
        let global_lock = header_len;
        let storage = global_lock + SYN_VAR_PADDING;
        let data = storage + max_nodes * SYN_VAR_PADDING;
        let data_len = round_up(data_len, WORD);
        let len = data + data_len;

        let (base, backing) = Self::alloc_zeroed(len)?;

        let seg = Segment { base, len, backing };
        let hdr = base as *mut SegmentHeader;
        unsafe {
            (*hdr).len = len as u64;
            (*hdr).locks.global_lock = global_lock as u64;
            (*hdr).locks.storage = storage as u64;
            (*hdr).locks.max_nodes = max_nodes as u64;
            (*hdr).data = data as u64;
            (*hdr).data_len = data_len as u64;
            // Mark last, so a concurrently attaching process never
            // validates a half-written header.
            (*hdr).mark = SEGMENT_MARK;
        }
        Ok(seg)
    }

    /// Attach to an existing mapping of a segment created elsewhere.
    ///
    /// The returned handle does not own the mapping. Whether the region
    /// holds an initialized segment is reported by [`check`](Self::check),
    /// which every locking entry point consults.
    ///
    /// # Safety
    ///
    /// `base..base + len` must stay a live, readable and writable mapping
    /// for the lifetime of the returned handle.
    pub unsafe fn attach(base: *mut u8, len: usize) -> Result<Self, SegmentError> {
        if base as usize % SYN_VAR_PADDING != 0 {
            return Err(SegmentError::Misaligned(SYN_VAR_PADDING));
        }
        let need = round_up(mem::size_of::<SegmentHeader>(), SYN_VAR_PADDING);
        if len < need {
            return Err(SegmentError::TooSmall { got: len, need });
        }
        Ok(Segment {
            base,
            len,
            backing: Backing::Foreign,
        })
    }

    fn alloc_zeroed(len: usize) -> Result<(*mut u8, Backing), SegmentError> {
        #[cfg(target_os = "linux")]
        if let Some((base, mapped_len)) = shm_alloc::alloc(len) {
            return Ok((base, Backing::Mmap { len: mapped_len }));
        }

        // Heap fallback. The region is process-private here, which is
        // fine for threads but not for forked processes.
        log::warn!("falling back to heap allocation; segment is not shareable across processes");
        let layout = std::alloc::Layout::from_size_align(len, SYN_VAR_PADDING)
            .map_err(|_| SegmentError::AllocFailed(len))?;
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return Err(SegmentError::AllocFailed(len));
        }
        Ok((base, Backing::Heap { layout }))
    }

    fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.base as *const SegmentHeader) }
    }

    /// Whether this handle points at an initialized segment.
    pub fn check(&self) -> bool {
        self.header().mark == SEGMENT_MARK
    }

    /// The lock control block.
    pub fn locks(&self) -> &LockHdr {
        &self.header().locks
    }

    /// The shared word at the given byte offset.
    pub fn word(&self, offset: u64) -> &AtomicU64 {
        let offset = offset as usize;
        debug_assert!(offset + WORD <= self.len);
        debug_assert_eq!(offset % WORD, 0);
        unsafe { &*(self.base.add(offset) as *const AtomicU64) }
    }

    /// The global-flag lock word.
    pub fn global_lock(&self) -> &AtomicU64 {
        self.word(self.locks().global_lock)
    }

    /// The queue node at the given offset.
    pub(crate) fn node(&self, offset: u64) -> &QueueNode {
        let locks = self.locks();
        debug_assert!(offset >= locks.storage);
        debug_assert!(offset < locks.storage + locks.max_nodes * SYN_VAR_PADDING as u64);
        debug_assert_eq!((offset - locks.storage) % SYN_VAR_PADDING as u64, 0);
        unsafe { &*(self.base.add(offset as usize) as *const QueueNode) }
    }

    /// The application data region, as shared words.
    pub fn data_words(&self) -> &[AtomicU64] {
        let hdr = self.header();
        let count = hdr.data_len as usize / WORD;
        unsafe {
            slice::from_raw_parts(
                self.base.add(hdr.data as usize) as *const AtomicU64,
                count,
            )
        }
    }

    /// Total length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is zero-length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of the mapping, for handing to [`attach`](Self::attach)
    /// in another mapping context.
    pub fn base(&self) -> *mut u8 {
        self.base
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        match self.backing {
            #[cfg(target_os = "linux")]
            Backing::Mmap { len } => shm_alloc::free(self.base, len),
            Backing::Heap { layout } => unsafe { std::alloc::dealloc(self.base, layout) },
            Backing::Foreign => {}
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let locks = self.locks();
        f.debug_struct("Segment")
            .field("len", &self.len)
            .field("valid", &self.check())
            .field("max_nodes", &locks.max_nodes)
            .field("tail", &locks.tail.load(SeqCst))
            .field("reader_count", &locks.reader_count.load(SeqCst))
            .finish()
    }
}
