//! ELF64 loader
//!
//! Materializes a user task from an executable on the mounted
//! filesystem: validates the header, creates the task (which brings a
//! user PML4 and the stack window with it), then places every `PT_LOAD`
//! segment page by page -- allocate, zero, copy up to `p_filesz`, map
//! with user flags. On any failure the half-built task is abandoned as
//! `Dead` for lazy reclamation.

pub mod types;

use crate::error::KernelError;
use crate::mm::{frame, paging, vmem, PageFlags, PhysAddr, VirtAddr};
use crate::sched::{scheduler, TaskId, TaskState};

use types::{program_headers, ElfError, ElfHeader, SegmentFlags};

impl From<ElfError> for KernelError {
    fn from(_: ElfError) -> Self {
        KernelError::InvalidArgument { name: "elf image" }
    }
}

/// Load `path` into a fresh user task, ready to be scheduled. Returns
/// the task id; the caller decides between `task_ready` and an immediate
/// [`run`].
pub fn load(path: &str) -> Result<TaskId, KernelError> {
    let image = crate::fs::read_file_all(path).map_err(KernelError::from)?;
    let header = ElfHeader::parse(&image)?;
    let segments = program_headers(&image, &header)?;

    let name = path.rsplit('/').next().unwrap_or(path);
    let tid = scheduler::task_create(header.entry, name, false)?;
    let pml4 = scheduler::TASKS.with(|table| table.task(tid).map(|t| t.pml4));
    let pml4 = pml4.ok_or(KernelError::InvalidArgument { name: "task" })?;

    for segment in segments.iter().filter(|s| s.is_load()) {
        if let Err(e) = map_segment(pml4, &image, segment) {
            abandon(tid);
            return Err(e);
        }
    }

    scheduler::TASKS.with(|table| {
        if let Some(task) = table.task_mut(tid) {
            task.user_entry = header.entry;
        }
    });
    log::info!(
        "elf: loaded {} (entry {:#x}, {} segments)",
        path,
        header.entry,
        segments.iter().filter(|s| s.is_load()).count()
    );
    Ok(tid)
}

/// Place one PT_LOAD segment: page-align the base, then for every page
/// of `[vaddr, vaddr + memsz)` allocate a zeroed frame, copy the
/// file-backed slice, and map it.
fn map_segment(
    pml4: PhysAddr,
    image: &[u8],
    segment: &types::ProgramHeader,
) -> Result<(), KernelError> {
    let page = frame::FRAME_SIZE as u64;
    let base = segment.vaddr & !(page - 1);
    let end = segment
        .vaddr
        .checked_add(segment.memsz)
        .ok_or(KernelError::InvalidArgument { name: "segment" })?;
    let pages = (end - base).div_ceil(page);

    let mut flags = PageFlags::PRESENT | PageFlags::USER;
    if segment.flags.contains(SegmentFlags::WRITE) {
        flags = flags | PageFlags::WRITABLE;
    }

    for i in 0..pages {
        let va = base + i * page;
        let phys = frame::alloc_frame().ok_or(KernelError::OutOfMemory {
            requested: frame::FRAME_SIZE,
        })?;
        let dst = vmem::phys_to_virt(phys).as_u64() as *mut u8;
        // SAFETY: fresh identity-reachable frame; zero then fill.
        unsafe { core::ptr::write_bytes(dst, 0, frame::FRAME_SIZE) };

        // Intersection of this page with the file-backed part of the
        // segment.
        let file_start = segment.vaddr.max(va);
        let file_end = (segment.vaddr + segment.filesz).min(va + page);
        if file_end > file_start {
            let src_off = (segment.offset + (file_start - segment.vaddr)) as usize;
            let len = (file_end - file_start) as usize;
            let src = image
                .get(src_off..src_off + len)
                .ok_or(KernelError::InvalidArgument { name: "segment" })?;
            // SAFETY: destination stays inside the fresh frame.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.as_ptr(),
                    dst.add((file_start - va) as usize),
                    len,
                );
            }
        }
        paging::map_page(pml4, VirtAddr::new(va), phys, flags)?;
    }
    Ok(())
}

/// Mark a half-built task dead; its slot and tracked resources are
/// reclaimed lazily by the next `task_create`.
fn abandon(tid: TaskId) {
    scheduler::TASKS.with(|table| {
        if let Some(task) = table.task_mut(tid) {
            task.state = TaskState::Dead;
        }
    });
}

/// Load and immediately enter user mode, without a trip through the
/// ready queue (the shell's `run` path).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn run(path: &str) -> Result<(), KernelError> {
    use core::sync::atomic::Ordering;

    let tid = load(path)?;
    let (entry, user_rsp, cr3, kernel_stack) = scheduler::TASKS.with(|table| {
        let task = table.task_mut(tid).expect("just created");
        task.state = TaskState::Running;
        (
            task.user_entry,
            task.user_stack_top,
            task.ctx.cr3,
            task.kernel_stack_top,
        )
    });
    scheduler::set_current(tid);
    crate::arch::x86_64::gdt::set_kernel_stack(kernel_stack);
    crate::arch::x86_64::syscall_entry::SYSCALL_KERNEL_RSP.store(kernel_stack, Ordering::Release);
    // SAFETY: the loader mapped entry and stack under cr3, and TSS.rsp0
    // was pointed at this task's kernel stack on the lines above.
    unsafe { crate::arch::x86_64::usermode::enter_usermode(entry, user_rsp, cr3) }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::types::*;

    /// Minimal valid ELF64 header for a static x86_64 executable.
    fn header_bytes() -> [u8; 64] {
        let mut h = [0u8; 64];
        h[0..4].copy_from_slice(&ELF_MAGIC);
        h[4] = ELFCLASS64;
        h[5] = ELFDATA2LSB;
        h[6] = 1; // EV_CURRENT
        h[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        h[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        h[24..32].copy_from_slice(&0x40_1000u64.to_le_bytes()); // e_entry
        h[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        h[54..56].copy_from_slice(&(ProgramHeader::SIZE as u16).to_le_bytes());
        h[56..58].copy_from_slice(&1u16.to_le_bytes());
        h
    }

    #[test]
    fn accepts_valid_header() {
        let h = ElfHeader::parse(&header_bytes()).unwrap();
        assert_eq!(h.entry, 0x40_1000);
        assert_eq!(h.phnum, 1);
    }

    #[test]
    fn rejects_corrupt_headers() {
        let mut bad = header_bytes();
        bad[0] = 0;
        assert_eq!(ElfHeader::parse(&bad), Err(ElfError::BadMagic));

        let mut bad = header_bytes();
        bad[4] = 1; // ELFCLASS32
        assert_eq!(ElfHeader::parse(&bad), Err(ElfError::NotElf64));

        let mut bad = header_bytes();
        bad[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        assert_eq!(ElfHeader::parse(&bad), Err(ElfError::NotExecutable));

        let mut bad = header_bytes();
        bad[18..20].copy_from_slice(&40u16.to_le_bytes()); // EM_ARM
        assert_eq!(ElfHeader::parse(&bad), Err(ElfError::WrongMachine));

        assert_eq!(ElfHeader::parse(&[0u8; 10]), Err(ElfError::TooShort));
    }

    #[test]
    fn parses_load_segment() {
        let mut image = alloc::vec::Vec::from(header_bytes());
        let mut ph = [0u8; ProgramHeader::SIZE];
        ph[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        ph[4..8].copy_from_slice(&0x5u32.to_le_bytes()); // R+X
        ph[8..16].copy_from_slice(&0x1000u64.to_le_bytes()); // offset
        ph[16..24].copy_from_slice(&0x40_1000u64.to_le_bytes()); // vaddr
        ph[32..40].copy_from_slice(&0x800u64.to_le_bytes()); // filesz
        ph[40..48].copy_from_slice(&0x2000u64.to_le_bytes()); // memsz
        image.extend_from_slice(&ph);

        let header = ElfHeader::parse(&image).unwrap();
        let phs = program_headers(&image, &header).unwrap();
        assert_eq!(phs.len(), 1);
        let seg = &phs[0];
        assert!(seg.is_load());
        assert!(seg.flags.contains(SegmentFlags::READ | SegmentFlags::EXEC));
        assert!(!seg.flags.contains(SegmentFlags::WRITE));
        assert_eq!(seg.memsz, 0x2000);

        // Truncated program header table is caught.
        let short = &image[..80];
        assert!(matches!(
            program_headers(short, &header),
            Err(ElfError::BadProgramHeader)
        ));
    }
}
