//! Kernel heap
//!
//! First-fit allocator over an address-sorted free list of blocks. Each
//! block carries `{size, tag, next}` and a 32-bit canary at the end of the
//! user area, checked on free. The heap is growable: when no block fits,
//! a region of at least [`MIN_GROW`] is pulled from the frame allocator
//! (identity-mapped low memory) and appended.
//!
//! A canary mismatch is logged with the block tag but is not fatal; the
//! kernel cannot recover from the corruption, the log line is forensic.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use crate::sync::IrqMutex;

use super::{frame, vmem};

/// Payload alignment guarantee.
pub const ALIGN: usize = 8;

/// Minimum expansion request.
pub const MIN_GROW: usize = 1024 * 1024;

const CANARY: u32 = 0xFEED_C0DE;
const CANARY_LEN: usize = core::mem::size_of::<u32>();

/// Tag used for allocations arriving through Rust's `alloc` machinery.
const RUST_TAG: u32 = u32::from_le_bytes(*b"rust");

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// Block header. `size` is the payload capacity in bytes (canary
/// included); `next` links free blocks in address order and is null for
/// allocated blocks.
#[repr(C)]
struct BlockHeader {
    size: usize,
    tag: u32,
    _reserved: u32,
    next: *mut BlockHeader,
}

/// Heap statistics
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapStats {
    pub total_bytes: usize,
    pub used_bytes: usize,
    pub alloc_count: u64,
    pub free_count: u64,
    pub expand_count: u64,
    pub canary_failures: u64,
}

/// The allocator proper; the global instance lives behind [`IrqMutex`].
pub struct Heap {
    /// Address-sorted free list.
    head: *mut BlockHeader,
    stats: HeapStats,
}

// SAFETY: all access goes through the IrqMutex critical section.
unsafe impl Send for Heap {}

impl Heap {
    pub const fn empty() -> Self {
        Self {
            head: ptr::null_mut(),
            stats: HeapStats {
                total_bytes: 0,
                used_bytes: 0,
                alloc_count: 0,
                free_count: 0,
                expand_count: 0,
                canary_failures: 0,
            },
        }
    }

    /// Donate `[start, start + len)` to the heap.
    ///
    /// # Safety
    ///
    /// The region must be writable, unused by anything else, and live for
    /// the rest of the kernel's life. `start` must be `ALIGN`-aligned.
    pub unsafe fn add_region(&mut self, start: usize, len: usize) {
        if len <= HEADER_SIZE + 2 * ALIGN {
            return;
        }
        let header = start as *mut BlockHeader;
        // SAFETY: caller guarantees the region is writable and owned.
        unsafe {
            (*header).size = len - HEADER_SIZE;
            (*header).tag = 0;
            (*header).next = ptr::null_mut();
            self.insert_free(header);
        }
        self.stats.total_bytes += len;
    }

    /// Would a request of `size` bytes succeed without expansion?
    pub fn has_space(&self, size: usize) -> bool {
        let want = Self::payload_want(size);
        let mut cur = self.head;
        while !cur.is_null() {
            // SAFETY: free-list nodes are valid headers inside donated regions.
            unsafe {
                if (*cur).size >= want {
                    return true;
                }
                cur = (*cur).next;
            }
        }
        false
    }

    /// Capacity needed for a request: payload rounded up plus the canary,
    /// re-rounded so the following block stays aligned.
    fn payload_want(size: usize) -> usize {
        let padded = size
            .checked_add(CANARY_LEN)
            .and_then(|s| s.checked_add(ALIGN - 1))
            .map(|s| s & !(ALIGN - 1));
        padded.unwrap_or(usize::MAX)
    }

    /// First-fit allocation; returns null when nothing fits.
    pub fn alloc(&mut self, size: usize, tag: u32) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        let want = Self::payload_want(size);
        if want == usize::MAX {
            return ptr::null_mut();
        }

        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut cur = self.head;
        while !cur.is_null() {
            // SAFETY: `cur` is a valid free-list node.
            let capacity = unsafe { (*cur).size };
            if capacity >= want {
                // SAFETY: the block is large enough; split bookkeeping
                // stays within the donated region.
                unsafe {
                    let next = (*cur).next;
                    // Split only when the remainder holds a header plus a
                    // useful payload.
                    if capacity - want >= HEADER_SIZE + 2 * ALIGN {
                        let rest =
                            (cur as *mut u8).add(HEADER_SIZE + want) as *mut BlockHeader;
                        (*rest).size = capacity - want - HEADER_SIZE;
                        (*rest).tag = 0;
                        (*rest).next = next;
                        (*cur).size = want;
                        self.unlink(prev, rest);
                    } else {
                        self.unlink(prev, next);
                    }
                    (*cur).tag = tag;
                    (*cur).next = ptr::null_mut();
                    let payload = (cur as *mut u8).add(HEADER_SIZE);
                    let canary_at = payload.add((*cur).size - CANARY_LEN) as *mut u32;
                    canary_at.write_unaligned(CANARY);
                    self.stats.used_bytes += HEADER_SIZE + (*cur).size;
                    self.stats.alloc_count += 1;
                    return payload;
                }
            }
            prev = cur;
            // SAFETY: `cur` is valid; advancing along the list.
            cur = unsafe { (*cur).next };
        }
        ptr::null_mut()
    }

    fn unlink(&mut self, prev: *mut BlockHeader, replacement: *mut BlockHeader) {
        if prev.is_null() {
            self.head = replacement;
        } else {
            // SAFETY: `prev` is a live free-list node.
            unsafe { (*prev).next = replacement };
        }
    }

    /// Return a block. Verifies the canary, inserts address-sorted, and
    /// eagerly coalesces with both neighbors.
    ///
    /// # Safety
    ///
    /// `payload` must be a pointer previously returned by [`Heap::alloc`]
    /// and not freed since.
    pub unsafe fn free(&mut self, payload: *mut u8) {
        if payload.is_null() {
            return;
        }
        // SAFETY: caller guarantees `payload` came from alloc; the header
        // sits immediately below it.
        unsafe {
            let header = payload.sub(HEADER_SIZE) as *mut BlockHeader;
            let canary_at = payload.add((*header).size - CANARY_LEN) as *const u32;
            let found = canary_at.read_unaligned();
            if found != CANARY {
                self.stats.canary_failures += 1;
                log::error!(
                    "heap: canary mismatch on free (tag {:#x}, found {:#x})",
                    (*header).tag,
                    found
                );
            }
            self.stats.used_bytes -= HEADER_SIZE + (*header).size;
            self.stats.free_count += 1;
            self.insert_free(header);
        }
    }

    /// Insert into the sorted free list and merge adjacent blocks.
    ///
    /// # Safety
    ///
    /// `block` must be a valid, unlinked header owned by the heap.
    unsafe fn insert_free(&mut self, block: *mut BlockHeader) {
        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut cur = self.head;
        while !cur.is_null() && cur < block {
            prev = cur;
            // SAFETY: walking valid nodes.
            cur = unsafe { (*cur).next };
        }
        // SAFETY: pointer arithmetic stays inside donated regions; the
        // adjacency checks compare one-past-the-end addresses only.
        unsafe {
            (*block).next = cur;
            let mut merged = block;
            if !prev.is_null() {
                (*prev).next = block;
                if (prev as *mut u8).add(HEADER_SIZE + (*prev).size) == block as *mut u8 {
                    (*prev).size += HEADER_SIZE + (*block).size;
                    (*prev).next = cur;
                    merged = prev;
                }
            } else {
                self.head = block;
            }
            // Merge forward while adjacent.
            loop {
                let next = (*merged).next;
                if next.is_null()
                    || (merged as *mut u8).add(HEADER_SIZE + (*merged).size) != next as *mut u8
                {
                    break;
                }
                (*merged).size += HEADER_SIZE + (*next).size;
                (*merged).next = (*next).next;
            }
        }
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Number of blocks on the free list (diagnostics and tests).
    pub fn free_blocks(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while !cur.is_null() {
            n += 1;
            // SAFETY: walking valid free-list nodes.
            cur = unsafe { (*cur).next };
        }
        n
    }
}

static KERNEL_HEAP: IrqMutex<Heap> = IrqMutex::new(Heap::empty());

/// Seed the heap with its first region, `len` bytes of frames.
pub fn init(len: usize) -> Result<(), crate::error::KernelError> {
    let frames = len.div_ceil(frame::FRAME_SIZE);
    let phys = frame::alloc_frames(frames)
        .ok_or(crate::error::KernelError::OutOfMemory { requested: len })?;
    let virt = vmem::phys_to_virt(phys);
    KERNEL_HEAP.with(|heap| {
        // SAFETY: freshly allocated frames, identity-reachable, owned by
        // the heap from here on.
        unsafe { heap.add_region(virt.as_u64() as usize, frames * frame::FRAME_SIZE) }
    });
    log::info!("heap: {} KiB initial region", (frames * frame::FRAME_SIZE) / 1024);
    Ok(())
}

/// Allocate `size` bytes with the default tag.
pub fn kmalloc(size: usize) -> *mut u8 {
    kmalloc_tagged(size, 0)
}

/// Allocate `size` bytes, recording `tag` for forensics.
pub fn kmalloc_tagged(size: usize, tag: u32) -> *mut u8 {
    let p = KERNEL_HEAP.with(|heap| heap.alloc(size, tag));
    if !p.is_null() {
        return p;
    }
    // Expansion: at least MIN_GROW, rounded up to whole pages, then one
    // retry. Frames come from the identity-mapped low range.
    let grow = (size + HEADER_SIZE + ALIGN)
        .max(MIN_GROW)
        .div_ceil(frame::FRAME_SIZE);
    match frame::alloc_frames(grow) {
        Some(phys) => {
            let virt = vmem::phys_to_virt(phys);
            KERNEL_HEAP.with(|heap| {
                heap.stats.expand_count += 1;
                // SAFETY: fresh contiguous frames, identity-reachable.
                unsafe { heap.add_region(virt.as_u64() as usize, grow * frame::FRAME_SIZE) };
                heap.alloc(size, tag)
            })
        }
        None => ptr::null_mut(),
    }
}

/// Free a pointer from [`kmalloc`]. Null is ignored.
///
/// # Safety
///
/// `p` must be null or a live allocation from this heap.
pub unsafe fn kfree(p: *mut u8) {
    // SAFETY: forwarded contract.
    KERNEL_HEAP.with(|heap| unsafe { heap.free(p) });
}

/// Would `size` bytes fit without expansion?
pub fn has_space(size: usize) -> bool {
    KERNEL_HEAP.with(|heap| heap.has_space(size))
}

pub fn stats() -> HeapStats {
    KERNEL_HEAP.with(|heap| heap.stats())
}

/// `GlobalAlloc` adapter over the kmalloc heap, installed as the Rust
/// allocator on bare metal. Alignments above [`ALIGN`] are served by
/// over-allocating and stashing the original pointer just below the
/// aligned payload.
pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= ALIGN {
            return kmalloc_tagged(layout.size().max(1), RUST_TAG);
        }
        let raw = kmalloc_tagged(layout.size() + layout.align() + ALIGN, RUST_TAG);
        if raw.is_null() {
            return raw;
        }
        let aligned =
            (raw as usize + ALIGN + layout.align() - 1) & !(layout.align() - 1);
        // SAFETY: `aligned - ALIGN >= raw`, inside the over-allocation.
        unsafe { ((aligned - ALIGN) as *mut usize).write(raw as usize) };
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }
        if layout.align() <= ALIGN {
            // SAFETY: `ptr` came from the matching alloc arm.
            unsafe { kfree(ptr) };
        } else {
            // SAFETY: the original pointer was stashed below the payload.
            unsafe {
                let raw = ((ptr as usize - ALIGN) as *const usize).read();
                kfree(raw as *mut u8);
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn heap_with(len: usize) -> Heap {
        let region = alloc::vec![0u8; len].leak();
        let mut heap = Heap::empty();
        // SAFETY: leaked, exclusively owned, 'static.
        unsafe { heap.add_region(region.as_mut_ptr() as usize, len) };
        heap
    }

    #[test]
    fn everything_freed_leaves_one_block() {
        let mut heap = heap_with(64 * 1024);
        let mut ptrs = alloc::vec::Vec::new();
        for i in 1..40usize {
            ptrs.push(heap.alloc(i * 7, 1));
        }
        // Free in a scrambled order to exercise both merge directions.
        for idx in [3usize, 0, 7, 1, 2, 5, 4, 6] {
            for (n, p) in ptrs.iter().enumerate() {
                if n % 8 == idx {
                    // SAFETY: each pointer freed exactly once.
                    unsafe { heap.free(*p) };
                }
            }
        }
        assert_eq!(heap.free_blocks(), 1);
        assert_eq!(heap.stats().used_bytes, 0);
    }

    #[test]
    fn payload_is_aligned() {
        let mut heap = heap_with(4096);
        for size in [1usize, 3, 8, 13, 100] {
            let p = heap.alloc(size, 0);
            assert!(!p.is_null());
            assert_eq!(p as usize % ALIGN, 0);
        }
    }

    #[test]
    fn overflow_trips_canary() {
        let mut heap = heap_with(4096);
        let p = heap.alloc(16, u32::from_le_bytes(*b"test"));
        // SAFETY: deliberately writing past the requested payload into
        // the canary slot to assert detection.
        unsafe {
            core::ptr::write_bytes(p, 0xAA, 16 + CANARY_LEN + 1);
            heap.free(p);
        }
        assert_eq!(heap.stats().canary_failures, 1);
    }

    #[test]
    fn in_bounds_write_keeps_canary() {
        let mut heap = heap_with(4096);
        let p = heap.alloc(24, 0);
        // SAFETY: staying within the requested payload.
        unsafe {
            core::ptr::write_bytes(p, 0x55, 24);
            heap.free(p);
        }
        assert_eq!(heap.stats().canary_failures, 0);
    }

    #[test]
    fn no_fit_returns_null_and_region_growth_recovers() {
        let mut heap = heap_with(8 * 1024);
        assert!(heap.alloc(64 * 1024, 0).is_null());
        let region = alloc::vec![0u8; 128 * 1024].leak();
        // SAFETY: leaked region handed over.
        unsafe { heap.add_region(region.as_mut_ptr() as usize, 128 * 1024) };
        assert!(!heap.alloc(64 * 1024, 0).is_null());
    }

    #[test]
    fn split_leaves_usable_remainder() {
        let mut heap = heap_with(4096);
        let a = heap.alloc(64, 0);
        let b = heap.alloc(64, 0);
        assert!(!a.is_null() && !b.is_null());
        // Second block starts right after the first one's capacity.
        assert!(b as usize > a as usize);
        assert!((b as usize - a as usize) < 4096);
    }

    #[test]
    fn has_space_tracks_free_list() {
        let mut heap = heap_with(2048);
        assert!(heap.has_space(1024));
        assert!(!heap.has_space(4096));
        let p = heap.alloc(1024, 0);
        assert!(!heap.has_space(1500));
        // SAFETY: freeing the only live allocation.
        unsafe { heap.free(p) };
        assert!(heap.has_space(1500));
    }

    #[test]
    fn contiguous_regions_merge() {
        let region = alloc::vec![0u8; 64 * 1024].leak();
        let base = region.as_mut_ptr() as usize;
        let mut heap = Heap::empty();
        // SAFETY: two halves of one leaked region.
        unsafe {
            heap.add_region(base, 32 * 1024);
            heap.add_region(base + 32 * 1024, 32 * 1024);
        }
        assert_eq!(heap.free_blocks(), 1);
        // A block bigger than either half must fit after the merge.
        assert!(!heap.alloc(48 * 1024, 0).is_null());
    }
}
