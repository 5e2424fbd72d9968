//! 4-level page mapping
//!
//! PML4 -> PDPT -> PD -> PT walks with on-demand intermediate tables, the
//! 2 MiB large-page split for user mappings that overlap the identity
//! region, and per-task PML4 construction. Table memory is always reached
//! through `vmem`, so the mapper keeps working after a user CR3 load.

use core::sync::atomic::{AtomicU64, Ordering};

use super::{frame, vmem, PageFlags, PhysAddr, VirtAddr};
use crate::error::KernelError;

/// Entries per table.
const ENTRIES: usize = 512;

/// High-half entries shared into every user PML4.
const KERNEL_HALF_START: usize = 256;

/// Physical address of the kernel PML4, set once at boot.
static KERNEL_PML4: AtomicU64 = AtomicU64::new(0);

/// Flags for intermediate tables: writable + user so leaf flags alone
/// decide access.
fn table_flags() -> u64 {
    (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER).bits()
}

fn table_ptr(phys: PhysAddr) -> *mut u64 {
    vmem::phys_to_virt(phys).as_u64() as *mut u64
}

/// Flush one page translation.
fn flush_page(virt: VirtAddr) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt.as_u64()));
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = virt;
}

/// Allocate and zero one table frame through `alloc`.
fn new_table(alloc: &mut dyn FnMut() -> Option<PhysAddr>) -> Option<PhysAddr> {
    let phys = alloc()?;
    // SAFETY: a fresh frame reachable through the direct window; zeroing
    // the full 4 KiB makes every entry non-present.
    unsafe { core::ptr::write_bytes(table_ptr(phys) as *mut u8, 0, frame::FRAME_SIZE) };
    Some(phys)
}

/// Map `virt -> phys` in the address space rooted at `pml4`, taking
/// intermediate-table frames from `alloc`. The injectable allocator keeps
/// the walk testable; kernel callers use [`map_page`].
pub fn map_page_with(
    pml4: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageFlags,
    alloc: &mut dyn FnMut() -> Option<PhysAddr>,
) -> Result<(), KernelError> {
    let [l4, l3, l2, l1] = virt.table_indices();
    let user = flags.contains(PageFlags::USER);

    let pdpt = descend(pml4, l4, user, alloc, virt)?;
    let pd = descend(pdpt, l3, user, alloc, virt)?;

    // SAFETY: `pd` is a live page table; index is in range.
    let pd_entry_ptr = unsafe { table_ptr(pd).add(l2) };
    // SAFETY: as above.
    let pd_entry = unsafe { pd_entry_ptr.read_volatile() };

    let pt = if pd_entry & PageFlags::PRESENT.bits() != 0
        && pd_entry & PageFlags::HUGE.bits() != 0
    {
        split_large_page(pd_entry_ptr, pd_entry, virt, alloc)?
    } else if pd_entry & PageFlags::PRESENT.bits() == 0 {
        let pt = new_table(alloc).ok_or(KernelError::MappingFailed {
            virt: virt.as_u64(),
        })?;
        // SAFETY: installing the fresh table into a live PD slot.
        unsafe { pd_entry_ptr.write_volatile(pt.as_u64() | table_flags()) };
        pt
    } else {
        if user {
            promote_user(pd_entry_ptr, pd_entry);
        }
        PhysAddr::new(pd_entry & vmem::ENTRY_ADDR_MASK)
    };

    // Leaf entry: only the low 12 flag bits are honored and NX stays
    // clear.
    let pte = (phys.as_u64() & vmem::ENTRY_ADDR_MASK) | (flags.bits() & 0xFFF);
    // SAFETY: `pt` is a live page table; index is in range.
    unsafe { table_ptr(pt).add(l1).write_volatile(pte) };
    flush_page(virt.align_down());
    Ok(())
}

/// Walk one level down, allocating the next table on demand. Existing
/// entries gain the USER bit when the mapping being installed is a user
/// mapping, since a cleared branch bit overrides leaf permissions.
fn descend(
    table: PhysAddr,
    index: usize,
    user: bool,
    alloc: &mut dyn FnMut() -> Option<PhysAddr>,
    virt: VirtAddr,
) -> Result<PhysAddr, KernelError> {
    // SAFETY: `table` is a live page table; index is in range.
    let entry_ptr = unsafe { table_ptr(table).add(index) };
    // SAFETY: as above.
    let entry = unsafe { entry_ptr.read_volatile() };
    if entry & PageFlags::PRESENT.bits() == 0 {
        let next = new_table(alloc).ok_or(KernelError::MappingFailed {
            virt: virt.as_u64(),
        })?;
        // SAFETY: installing a fresh table into the parent slot.
        unsafe { entry_ptr.write_volatile(next.as_u64() | table_flags()) };
        return Ok(next);
    }
    if user {
        promote_user(entry_ptr, entry);
    }
    Ok(PhysAddr::new(entry & vmem::ENTRY_ADDR_MASK))
}

fn promote_user(entry_ptr: *mut u64, entry: u64) {
    if entry & PageFlags::USER.bits() == 0 {
        // SAFETY: same live entry the caller just read.
        unsafe { entry_ptr.write_volatile(entry | PageFlags::USER.bits()) };
    }
}

/// Replace a 2 MiB PD mapping with a page table whose 512 entries
/// replicate the original range (PS cleared, flags preserved), then
/// invalidate the covered translations.
fn split_large_page(
    pd_entry_ptr: *mut u64,
    pd_entry: u64,
    virt: VirtAddr,
    alloc: &mut dyn FnMut() -> Option<PhysAddr>,
) -> Result<PhysAddr, KernelError> {
    let pt = new_table(alloc).ok_or(KernelError::MappingFailed {
        virt: virt.as_u64(),
    })?;
    let base = pd_entry & vmem::ENTRY_ADDR_MASK & !0x1F_F000;
    let flags = (pd_entry & 0xFFF) & !PageFlags::HUGE.bits();
    let pt_virt = table_ptr(pt);
    for i in 0..ENTRIES {
        let replicated = (base + i as u64 * frame::FRAME_SIZE as u64) | flags;
        // SAFETY: writing all 512 entries of the fresh table.
        unsafe { pt_virt.add(i).write_volatile(replicated) };
    }
    // SAFETY: swapping the live PD entry from large page to table.
    unsafe { pd_entry_ptr.write_volatile(pt.as_u64() | table_flags()) };

    // Invalidate the whole 2 MiB window the large page covered.
    let window = VirtAddr::new(virt.as_u64() & !0x1F_FFFF);
    for i in 0..ENTRIES {
        flush_page(VirtAddr::new(
            window.as_u64() + (i * frame::FRAME_SIZE) as u64,
        ));
    }
    Ok(pt)
}

/// Map through the global frame allocator.
pub fn map_page(
    pml4: PhysAddr,
    virt: VirtAddr,
    phys: PhysAddr,
    flags: PageFlags,
) -> Result<(), KernelError> {
    map_page_with(pml4, virt, phys, flags, &mut frame::alloc_frame)
}

/// Remove a 4 KiB mapping, returning the frame it pointed at. Large-page
/// mappings are not unmapped through this path.
pub fn unmap_page(pml4: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
    let [l4, l3, l2, l1] = virt.table_indices();
    let mut table = pml4;
    for index in [l4, l3, l2] {
        // SAFETY: live table, in-range index.
        let entry = unsafe { table_ptr(table).add(index).read_volatile() };
        if entry & PageFlags::PRESENT.bits() == 0 || entry & PageFlags::HUGE.bits() != 0 {
            return None;
        }
        table = PhysAddr::new(entry & vmem::ENTRY_ADDR_MASK);
    }
    // SAFETY: leaf table is live.
    let pte_ptr = unsafe { table_ptr(table).add(l1) };
    // SAFETY: as above.
    let pte = unsafe { pte_ptr.read_volatile() };
    if pte & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    // SAFETY: clearing the live leaf entry.
    unsafe { pte_ptr.write_volatile(0) };
    flush_page(virt.align_down());
    Some(PhysAddr::new(pte & vmem::ENTRY_ADDR_MASK))
}

/// Clone the bootloader PML4 into our own, graft a 4 GiB identity map of
/// 2 MiB pages at index 0, and switch CR3 to it.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init_kernel_pml4() -> Result<PhysAddr, KernelError> {
    use x86_64::registers::control::{Cr3, Cr3Flags};

    let (boot_frame, _) = Cr3::read();
    let boot_pml4 = PhysAddr::new(boot_frame.start_address().as_u64());

    let pml4 = frame::alloc_frame().ok_or(KernelError::OutOfMemory {
        requested: frame::FRAME_SIZE,
    })?;
    let src = table_ptr(boot_pml4);
    let dst = table_ptr(pml4);
    for i in 0..ENTRIES {
        // SAFETY: both tables are live and direct-window reachable.
        unsafe { dst.add(i).write_volatile(src.add(i).read_volatile()) };
    }

    // Identity map the low 4 GiB with 2 MiB pages: one PDPT, four PDs.
    let pdpt = new_table(&mut frame::alloc_frame).ok_or(KernelError::OutOfMemory {
        requested: frame::FRAME_SIZE,
    })?;
    for gib in 0..4u64 {
        let pd = new_table(&mut frame::alloc_frame).ok_or(KernelError::OutOfMemory {
            requested: frame::FRAME_SIZE,
        })?;
        let pd_ptr = table_ptr(pd);
        for i in 0..ENTRIES as u64 {
            let addr = gib * 0x4000_0000 + i * 0x20_0000;
            let entry = addr
                | (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::HUGE).bits();
            // SAFETY: filling the fresh PD.
            unsafe { pd_ptr.add(i as usize).write_volatile(entry) };
        }
        // SAFETY: installing the PD into the fresh PDPT.
        unsafe {
            table_ptr(pdpt).add(gib as usize).write_volatile(
                pd.as_u64() | (PageFlags::PRESENT | PageFlags::WRITABLE).bits(),
            )
        };
    }
    // SAFETY: slot 0 of our own PML4.
    unsafe {
        dst.write_volatile(pdpt.as_u64() | (PageFlags::PRESENT | PageFlags::WRITABLE).bits())
    };

    KERNEL_PML4.store(pml4.as_u64(), Ordering::Release);
    // SAFETY: the new PML4 is a superset of the bootloader's mappings.
    unsafe {
        Cr3::write(
            x86_64::structures::paging::PhysFrame::containing_address(x86_64::PhysAddr::new(
                pml4.as_u64(),
            )),
            Cr3Flags::empty(),
        )
    };
    log::info!("paging: kernel PML4 at {:#x}, low 4 GiB identity mapped", pml4.as_u64());
    Ok(pml4)
}

/// Kernel PML4 physical address; zero before `init_kernel_pml4`.
pub fn kernel_pml4() -> PhysAddr {
    PhysAddr::new(KERNEL_PML4.load(Ordering::Acquire))
}

/// Test hook: lets host tests stand in a synthetic kernel PML4.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn set_kernel_pml4(pml4: PhysAddr) {
    KERNEL_PML4.store(pml4.as_u64(), Ordering::Release);
}

/// Build a fresh user PML4: high half shared with the kernel, entry 0
/// cloned so the identity-mapped low range stays reachable, entries
/// 1..256 zero.
pub fn create_user_pml4_with(
    alloc: &mut dyn FnMut() -> Option<PhysAddr>,
) -> Option<PhysAddr> {
    let kernel = kernel_pml4();
    if kernel.as_u64() == 0 {
        return None;
    }
    let pml4 = new_table(alloc)?;
    let src = table_ptr(kernel);
    let dst = table_ptr(pml4);
    // SAFETY: both tables live; copying entry 0 and the kernel half.
    unsafe {
        dst.write_volatile(src.read_volatile());
        for i in KERNEL_HALF_START..ENTRIES {
            dst.add(i).write_volatile(src.add(i).read_volatile());
        }
    }
    Some(pml4)
}

pub fn create_user_pml4() -> Option<PhysAddr> {
    create_user_pml4_with(&mut frame::alloc_frame)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    /// Hand out leaked, zeroed, page-aligned host allocations as "frames";
    /// under identity translation the walker sees ordinary memory.
    fn test_alloc() -> Option<PhysAddr> {
        let layout = core::alloc::Layout::from_size_align(4096, 4096).unwrap();
        // SAFETY: valid non-zero layout; leaked for 'static life.
        let p = unsafe { std::alloc::alloc_zeroed(layout) };
        (!p.is_null()).then(|| PhysAddr::new(p as u64))
    }

    #[test]
    fn map_then_walk_round_trips() {
        let pml4 = test_alloc().unwrap();
        let phys = PhysAddr::new(0xABCD_E000);
        let virt = VirtAddr::new(0x4000_2000);
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
        map_page_with(pml4, virt, phys, flags, &mut test_alloc).unwrap();

        let (out, out_flags) = vmem::walk(pml4, virt).unwrap();
        assert_eq!(out, phys);
        assert!(out_flags.contains(PageFlags::PRESENT));
        assert!(out_flags.contains(PageFlags::WRITABLE));
        assert!(out_flags.contains(PageFlags::USER));

        // Offsets within the page resolve too.
        let (mid, _) = vmem::walk(pml4, VirtAddr::new(0x4000_2ABC)).unwrap();
        assert_eq!(mid.as_u64(), 0xABCD_EABC);
    }

    #[test]
    fn unmap_removes_translation() {
        let pml4 = test_alloc().unwrap();
        let virt = VirtAddr::new(0x5000_0000);
        let phys = PhysAddr::new(0x1234_5000);
        map_page_with(pml4, virt, phys, PageFlags::PRESENT, &mut test_alloc).unwrap();
        assert_eq!(unmap_page(pml4, virt), Some(phys));
        assert!(vmem::walk(pml4, virt).is_none());
        assert_eq!(unmap_page(pml4, virt), None);
    }

    fn install_large_page(pml4: PhysAddr, virt: u64, base: u64) {
        // Build PML4 -> PDPT -> PD by mapping a scratch page, then
        // overwrite the PD entry with a 2 MiB mapping.
        map_page_with(
            pml4,
            VirtAddr::new(virt),
            PhysAddr::new(base),
            PageFlags::PRESENT,
            &mut test_alloc,
        )
        .unwrap();
        let [l4, l3, l2, _] = VirtAddr::new(virt).table_indices();
        unsafe {
            let pdpt = (*table_ptr(pml4).add(l4)) & vmem::ENTRY_ADDR_MASK;
            let pd = (*table_ptr(PhysAddr::new(pdpt)).add(l3)) & vmem::ENTRY_ADDR_MASK;
            table_ptr(PhysAddr::new(pd)).add(l2).write_volatile(
                base | (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::HUGE).bits(),
            );
        }
    }

    #[test]
    fn split_preserves_other_windows() {
        let pml4 = test_alloc().unwrap();
        let window = 0x4020_0000u64; // 2 MiB aligned
        install_large_page(pml4, window, 0x1000_0000);

        // The large page resolves before the split.
        let (before, f) = vmem::walk(pml4, VirtAddr::new(window + 0x5_3000)).unwrap();
        assert_eq!(before.as_u64(), 0x1000_0000 + 0x5_3000);
        assert!(f.contains(PageFlags::HUGE));

        // Map one user page inside the window.
        let user_virt = VirtAddr::new(window + 0x7_0000);
        let user_phys = PhysAddr::new(0x7777_7000);
        map_page_with(
            pml4,
            user_virt,
            user_phys,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
            &mut test_alloc,
        )
        .unwrap();

        // The new page resolves to its own frame...
        let (got, _) = vmem::walk(pml4, user_virt).unwrap();
        assert_eq!(got, user_phys);

        // ...and all other 4 KiB windows still resolve to the original
        // physical bytes, without the PS bit.
        for i in 0..512u64 {
            let va = window + i * 4096;
            if va == user_virt.as_u64() {
                continue;
            }
            let (p, flags) = vmem::walk(pml4, VirtAddr::new(va)).unwrap();
            assert_eq!(p.as_u64(), 0x1000_0000 + i * 4096);
            assert!(!flags.contains(PageFlags::HUGE));
            assert!(flags.contains(PageFlags::PRESENT));
            assert!(flags.contains(PageFlags::WRITABLE));
        }
    }

    #[test]
    fn user_pml4_shares_kernel_half_and_entry_zero() {
        let kernel = test_alloc().unwrap();
        unsafe {
            table_ptr(kernel).write_volatile(0x1111_1000 | PageFlags::PRESENT.bits());
            table_ptr(kernel)
                .add(300)
                .write_volatile(0x2222_2000 | PageFlags::PRESENT.bits());
            table_ptr(kernel)
                .add(5)
                .write_volatile(0x3333_3000 | PageFlags::PRESENT.bits());
        }
        set_kernel_pml4(kernel);
        let user = create_user_pml4_with(&mut test_alloc).unwrap();
        unsafe {
            assert_eq!(
                table_ptr(user).read_volatile(),
                0x1111_1000 | PageFlags::PRESENT.bits()
            );
            assert_eq!(
                table_ptr(user).add(300).read_volatile(),
                0x2222_2000 | PageFlags::PRESENT.bits()
            );
            // Task-private low entries start out zero.
            assert_eq!(table_ptr(user).add(5).read_volatile(), 0);
        }
        set_kernel_pml4(PhysAddr::new(0));
    }

    #[test]
    fn failed_table_allocation_is_reported() {
        let pml4 = test_alloc().unwrap();
        let mut none = || None;
        let err = map_page_with(
            pml4,
            VirtAddr::new(0x6000_0000),
            PhysAddr::new(0x1000),
            PageFlags::PRESENT,
            &mut none,
        );
        assert!(matches!(err, Err(KernelError::MappingFailed { .. })));
    }
}
