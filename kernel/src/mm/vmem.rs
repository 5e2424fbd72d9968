//! Physical/virtual address translation
//!
//! Three selectable modes: identity (virt == phys), fixed offset (the
//! bootloader's physical-memory window), and a software walk of a PML4.
//! The walk is what lets the mapper mutate page tables that are no longer
//! identity-reachable once a user CR3 is loaded.

use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use super::{PageFlags, PhysAddr, VirtAddr};

const MODE_IDENTITY: u8 = 0;
const MODE_OFFSET: u8 = 1;
const MODE_WALK: u8 = 2;

static MODE: AtomicU8 = AtomicU8::new(MODE_IDENTITY);
static OFFSET: AtomicU64 = AtomicU64::new(0);

/// Physical-address bits of a table entry.
pub const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Translation mode for [`phys_to_virt`] / [`virt_to_phys`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateMode {
    /// virt == phys (the kernel's low-4 GiB identity map)
    Identity,
    /// virt = phys + offset
    Offset(u64),
    /// Software walk of the current CR3
    Walk,
}

pub fn set_mode(mode: TranslateMode) {
    match mode {
        TranslateMode::Identity => MODE.store(MODE_IDENTITY, Ordering::Relaxed),
        TranslateMode::Offset(off) => {
            OFFSET.store(off, Ordering::Relaxed);
            MODE.store(MODE_OFFSET, Ordering::Relaxed);
        }
        TranslateMode::Walk => MODE.store(MODE_WALK, Ordering::Relaxed),
    }
}

/// Translation under an explicit mode; the public entry points read the
/// configured global mode.
fn phys_to_virt_with(mode: TranslateMode, p: PhysAddr) -> VirtAddr {
    match mode {
        TranslateMode::Offset(off) => VirtAddr::new(p.as_u64() + off),
        _ => VirtAddr::new(p.as_u64()),
    }
}

fn virt_to_phys_with(mode: TranslateMode, v: VirtAddr) -> Option<PhysAddr> {
    match mode {
        TranslateMode::Identity => Some(PhysAddr::new(v.as_u64())),
        TranslateMode::Offset(off) => v.as_u64().checked_sub(off).map(PhysAddr::new),
        TranslateMode::Walk => walk(current_pml4()?, v).map(|(p, _)| p),
    }
}

fn mode() -> TranslateMode {
    match MODE.load(Ordering::Relaxed) {
        MODE_OFFSET => TranslateMode::Offset(OFFSET.load(Ordering::Relaxed)),
        MODE_WALK => TranslateMode::Walk,
        _ => TranslateMode::Identity,
    }
}

/// Map a physical address into the kernel's view of it.
///
/// Under `Walk` mode page tables themselves are still reached through the
/// direct window, so this degrades to the offset translation.
pub fn phys_to_virt(p: PhysAddr) -> VirtAddr {
    phys_to_virt_with(mode(), p)
}

/// Resolve a virtual address to its physical backing, if mapped.
pub fn virt_to_phys(v: VirtAddr) -> Option<PhysAddr> {
    virt_to_phys_with(mode(), v)
}

/// Physical address of the live PML4 (CR3). Unavailable on the host.
pub fn current_pml4() -> Option<PhysAddr> {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use x86_64::registers::control::Cr3;
        let (frame, _) = Cr3::read();
        Some(PhysAddr::new(frame.start_address().as_u64()))
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        None
    }
}

/// Read one 8-byte entry from the table at `table_phys`.
fn entry(table_phys: PhysAddr, index: usize) -> u64 {
    let virt = phys_to_virt(table_phys).as_u64() as *const u64;
    // SAFETY: `table_phys` points at a live page table reachable through
    // the direct window; `index` is masked to the 512-entry range by all
    // callers.
    unsafe { virt.add(index).read_volatile() }
}

/// Software page walk. Honors 1 GiB (PDPT) and 2 MiB (PD) large-page
/// bits; returns the physical address plus the flag bits of the mapping
/// entry, or `None` when any level is non-present.
pub fn walk(pml4: PhysAddr, virt: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
    let [l4, l3, l2, l1] = virt.table_indices();
    let present = PageFlags::PRESENT.bits();
    let huge = PageFlags::HUGE.bits();

    let e4 = entry(pml4, l4);
    if e4 & present == 0 {
        return None;
    }
    let e3 = entry(PhysAddr::new(e4 & ENTRY_ADDR_MASK), l3);
    if e3 & present == 0 {
        return None;
    }
    if e3 & huge != 0 {
        let base = e3 & ENTRY_ADDR_MASK & !0x3FFF_F000;
        let off = virt.as_u64() & 0x3FFF_FFFF;
        return Some((PhysAddr::new(base + off), PageFlags(e3 & 0xFFF)));
    }
    let e2 = entry(PhysAddr::new(e3 & ENTRY_ADDR_MASK), l2);
    if e2 & present == 0 {
        return None;
    }
    if e2 & huge != 0 {
        let base = e2 & ENTRY_ADDR_MASK & !0x1F_F000;
        let off = virt.as_u64() & 0x1F_FFFF;
        return Some((PhysAddr::new(base + off), PageFlags(e2 & 0xFFF)));
    }
    let e1 = entry(PhysAddr::new(e2 & ENTRY_ADDR_MASK), l1);
    if e1 & present == 0 {
        return None;
    }
    Some((
        PhysAddr::new((e1 & ENTRY_ADDR_MASK) + virt.page_offset()),
        PageFlags(e1 & 0xFFF),
    ))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    // Exercised through the explicit-mode variants: the configured mode
    // is process-global and other tests walk page tables concurrently.
    #[test]
    fn offset_mode_round_trips() {
        let mode = TranslateMode::Offset(0x1000);
        assert_eq!(
            phys_to_virt_with(mode, PhysAddr::new(0x2000)).as_u64(),
            0x3000
        );
        assert_eq!(
            virt_to_phys_with(mode, VirtAddr::new(0x3000)),
            Some(PhysAddr::new(0x2000))
        );
        assert_eq!(
            virt_to_phys_with(TranslateMode::Identity, VirtAddr::new(0x42)),
            Some(PhysAddr::new(0x42))
        );
    }

    #[test]
    fn walk_stops_at_non_present() {
        let table = alloc::boxed::Box::leak(alloc::boxed::Box::new([0u64; 512]));
        let pml4 = PhysAddr::new(table.as_ptr() as u64);
        assert!(walk(pml4, VirtAddr::new(0xDEAD_B000)).is_none());
    }
}
