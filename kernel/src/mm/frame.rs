//! Physical frame allocator
//!
//! A chunked bitmap over 4 KiB frames. The managed range is partitioned
//! into 1 MiB chunks (256 frames, four u64 words each); a chunk's bitmap
//! is initialized lazily on first touch. Bit set = frame in use.
//!
//! This module never panics: exhaustion is reported as `None` and the
//! caller decides whether that is fatal.

use crate::sync::IrqMutex;

use super::PhysAddr;

/// Size of a physical frame (4 KiB)
pub const FRAME_SIZE: usize = 4096;

/// Frames per chunk (1 MiB of physical memory)
pub const CHUNK_FRAMES: usize = 256;

const CHUNK_WORDS: usize = CHUNK_FRAMES / 64;

/// Chunks covering up to 4 GiB of physical memory.
const MAX_CHUNKS: usize = 4096;

/// Allocation map for one 1 MiB span.
#[derive(Clone, Copy)]
struct Chunk {
    bits: [u64; CHUNK_WORDS],
    /// Lazily set on first touch; an untouched chunk is all-free.
    touched: bool,
}

impl Chunk {
    const EMPTY: Chunk = Chunk {
        bits: [0; CHUNK_WORDS],
        touched: false,
    };
}

/// Counters reported by [`stats`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameStats {
    pub total_frames: u64,
    pub used_frames: u64,
    pub alloc_count: u64,
    pub free_count: u64,
}

/// The bitmap proper. Kept separate from the global so unit tests can
/// drive an instance over a synthetic range.
pub struct FrameBitmap {
    /// Managed physical range, page-aligned, end exclusive.
    start: u64,
    end: u64,
    chunks: [Chunk; MAX_CHUNKS],
    used: u64,
    alloc_count: u64,
    free_count: u64,
}

impl FrameBitmap {
    pub const fn empty() -> Self {
        Self {
            start: 0,
            end: 0,
            chunks: [Chunk::EMPTY; MAX_CHUNKS],
            used: 0,
            alloc_count: 0,
            free_count: 0,
        }
    }

    /// Set the managed range. Frames outside `[start, end)` are never
    /// handed out; both bounds are truncated to page alignment.
    pub fn set_range(&mut self, start: u64, end: u64) {
        self.start = start & !(FRAME_SIZE as u64 - 1);
        self.end = end & !(FRAME_SIZE as u64 - 1);
    }

    fn frame_count(&self) -> u64 {
        (self.end.saturating_sub(self.start)) / FRAME_SIZE as u64
    }

    /// First touch of a chunk: mark in-range frames free and everything
    /// outside the managed range as permanently in use.
    fn touch(&mut self, chunk_idx: usize) {
        if self.chunks[chunk_idx].touched {
            return;
        }
        self.chunks[chunk_idx].touched = true;
        let first = self.start + (chunk_idx * CHUNK_FRAMES * FRAME_SIZE) as u64;
        for frame in 0..CHUNK_FRAMES {
            let addr = first + (frame * FRAME_SIZE) as u64;
            if addr >= self.end {
                self.chunks[chunk_idx].bits[frame / 64] |= 1 << (frame % 64);
            }
        }
    }

    fn frame_index(&self, addr: u64) -> Option<(usize, usize)> {
        if addr < self.start || addr >= self.end {
            return None;
        }
        let frame = ((addr - self.start) / FRAME_SIZE as u64) as usize;
        let chunk = frame / CHUNK_FRAMES;
        if chunk >= MAX_CHUNKS {
            return None;
        }
        Some((chunk, frame % CHUNK_FRAMES))
    }

    /// Allocate the lowest-addressed free frame.
    pub fn alloc_frame(&mut self) -> Option<PhysAddr> {
        let chunks = (self.frame_count() as usize).div_ceil(CHUNK_FRAMES).min(MAX_CHUNKS);
        for chunk_idx in 0..chunks {
            self.touch(chunk_idx);
            for word_idx in 0..CHUNK_WORDS {
                let word = self.chunks[chunk_idx].bits[word_idx];
                if word == u64::MAX {
                    continue;
                }
                let bit = (!word).trailing_zeros() as usize;
                self.chunks[chunk_idx].bits[word_idx] |= 1 << bit;
                self.used += 1;
                self.alloc_count += 1;
                let frame = chunk_idx * CHUNK_FRAMES + word_idx * 64 + bit;
                return Some(PhysAddr::new(self.start + (frame * FRAME_SIZE) as u64));
            }
        }
        None
    }

    /// Allocate `count` physically contiguous frames, returning the base.
    /// Used by heap expansion; the run may span chunk boundaries.
    pub fn alloc_frames(&mut self, count: usize) -> Option<PhysAddr> {
        if count == 0 {
            return None;
        }
        let total = self.frame_count() as usize;
        let mut run = 0usize;
        let mut run_start = 0usize;
        for frame in 0..total {
            let chunk = frame / CHUNK_FRAMES;
            if chunk >= MAX_CHUNKS {
                break;
            }
            self.touch(chunk);
            let bit = frame % CHUNK_FRAMES;
            let in_use = self.chunks[chunk].bits[bit / 64] & (1 << (bit % 64)) != 0;
            if in_use {
                run = 0;
            } else {
                if run == 0 {
                    run_start = frame;
                }
                run += 1;
                if run == count {
                    for f in run_start..run_start + count {
                        let c = f / CHUNK_FRAMES;
                        let b = f % CHUNK_FRAMES;
                        self.chunks[c].bits[b / 64] |= 1 << (b % 64);
                    }
                    self.used += count as u64;
                    self.alloc_count += count as u64;
                    return Some(PhysAddr::new(
                        self.start + (run_start * FRAME_SIZE) as u64,
                    ));
                }
            }
        }
        None
    }

    /// Release a frame. Requires page alignment; clearing an already-free
    /// bit is a no-op (idempotent).
    pub fn free_frame(&mut self, addr: PhysAddr) {
        if !addr.is_page_aligned() {
            log::warn!("frame: ignoring unaligned free of {:#x}", addr.as_u64());
            return;
        }
        let Some((chunk, bit)) = self.frame_index(addr.as_u64()) else {
            log::warn!("frame: ignoring out-of-range free of {:#x}", addr.as_u64());
            return;
        };
        self.touch(chunk);
        let mask = 1u64 << (bit % 64);
        if self.chunks[chunk].bits[bit / 64] & mask != 0 {
            self.chunks[chunk].bits[bit / 64] &= !mask;
            self.used -= 1;
            self.free_count += 1;
        }
    }

    /// Mark every frame overlapping `[start, end)` as in use. Idempotent;
    /// lazily creates the covering chunks.
    pub fn reserve(&mut self, start: u64, end: u64) {
        let mut addr = start & !(FRAME_SIZE as u64 - 1);
        while addr < end {
            if let Some((chunk, bit)) = self.frame_index(addr) {
                self.touch(chunk);
                let mask = 1u64 << (bit % 64);
                if self.chunks[chunk].bits[bit / 64] & mask == 0 {
                    self.chunks[chunk].bits[bit / 64] |= mask;
                    self.used += 1;
                }
            }
            addr += FRAME_SIZE as u64;
        }
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total_frames: self.frame_count(),
            used_frames: self.used,
            alloc_count: self.alloc_count,
            free_count: self.free_count,
        }
    }
}

static FRAME_MAP: IrqMutex<FrameBitmap> = IrqMutex::new(FrameBitmap::empty());

/// Bring up the global allocator over `[start, end)`.
pub fn init(start: u64, end: u64) {
    FRAME_MAP.with(|map| map.set_range(start, end));
    log::info!(
        "frame: managing {:#x}..{:#x} ({} MiB)",
        start,
        end,
        (end - start) / (1024 * 1024)
    );
}

pub fn alloc_frame() -> Option<PhysAddr> {
    FRAME_MAP.with(|map| map.alloc_frame())
}

pub fn alloc_frames(count: usize) -> Option<PhysAddr> {
    FRAME_MAP.with(|map| map.alloc_frames(count))
}

pub fn free_frame(addr: PhysAddr) {
    FRAME_MAP.with(|map| map.free_frame(addr));
}

pub fn reserve(start: u64, end: u64) {
    FRAME_MAP.with(|map| map.reserve(start, end));
}

pub fn stats() -> FrameStats {
    FRAME_MAP.with(|map| map.stats())
}

/// (total, free) frame counts.
pub fn frames() -> (u64, u64) {
    let s = stats();
    (s.total_frames, s.total_frames - s.used_frames)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn bitmap(mib: u64) -> alloc::boxed::Box<FrameBitmap> {
        let mut map = alloc::boxed::Box::new(FrameBitmap::empty());
        map.set_range(0x10_0000, 0x10_0000 + mib * 1024 * 1024);
        map
    }

    #[test]
    fn alloc_returns_lowest_free() {
        let mut map = bitmap(2);
        let a = map.alloc_frame().unwrap();
        let b = map.alloc_frame().unwrap();
        assert_eq!(a.as_u64(), 0x10_0000);
        assert_eq!(b.as_u64(), 0x10_1000);
        map.free_frame(a);
        assert_eq!(map.alloc_frame().unwrap(), a);
    }

    #[test]
    fn set_bits_match_outstanding_allocations() {
        let mut map = bitmap(4);
        let mut held = alloc::vec::Vec::new();
        for _ in 0..300 {
            held.push(map.alloc_frame().unwrap());
        }
        assert_eq!(map.stats().used_frames, 300);
        for addr in held.drain(..) {
            map.free_frame(addr);
        }
        assert_eq!(map.stats().used_frames, 0);
        // free(alloc()) restores the initial state
        let probe = map.alloc_frame().unwrap();
        map.free_frame(probe);
        assert_eq!(map.stats().used_frames, 0);
    }

    #[test]
    fn free_is_idempotent_and_checks_alignment() {
        let mut map = bitmap(1);
        let a = map.alloc_frame().unwrap();
        map.free_frame(a);
        map.free_frame(a);
        assert_eq!(map.stats().used_frames, 0);
        let b = map.alloc_frame().unwrap();
        map.free_frame(PhysAddr::new(b.as_u64() + 12));
        assert_eq!(map.stats().used_frames, 1, "unaligned free must be dropped");
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut map = bitmap(1);
        for _ in 0..256 {
            assert!(map.alloc_frame().is_some());
        }
        assert!(map.alloc_frame().is_none());
    }

    #[test]
    fn reserve_excludes_frames() {
        let mut map = bitmap(1);
        map.reserve(0x10_0000, 0x10_3000);
        assert_eq!(map.alloc_frame().unwrap().as_u64(), 0x10_3000);
        // reserving again must not double-count
        let used = map.stats().used_frames;
        map.reserve(0x10_0000, 0x10_3000);
        assert_eq!(map.stats().used_frames, used);
    }

    #[test]
    fn contiguous_run_spans_chunks() {
        let mut map = bitmap(3);
        // 300 frames > one 256-frame chunk
        let base = map.alloc_frames(300).unwrap();
        assert_eq!(base.as_u64(), 0x10_0000);
        let next = map.alloc_frame().unwrap();
        assert_eq!(next.as_u64(), 0x10_0000 + 300 * 4096);
    }
}
