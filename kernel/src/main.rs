#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

extern crate alloc;

#[macro_use]
extern crate ferrite_kernel;

#[cfg(target_os = "none")]
mod boot {
    use core::panic::PanicInfo;

    use alloc::sync::Arc;

    use bootloader_api::config::Mapping;
    use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
    use bootloader_api::{entry_point, BootInfo, BootloaderConfig};

    use ferrite_kernel::drivers::ata::AtaDisk;
    use ferrite_kernel::drivers::framebuffer::{self, FramebufferInfo};
    use ferrite_kernel::fs::{self, blockdev::SECTOR_SIZE, BlockCache};
    use ferrite_kernel::mm::vmem::TranslateMode;
    use ferrite_kernel::mm::{frame, heap, paging, vmem};
    use ferrite_kernel::{arch, elf, logger, sched, serial};

    /// Highest physical address the frame bitmap manages (the identity
    /// map covers exactly this much).
    const PHYS_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

    /// Initial kernel heap region.
    const HEAP_INITIAL: usize = 2 * 1024 * 1024;

    /// Block cache sizing for the data disk.
    const CACHE_ENTRIES: usize = 64;

    /// Size cap assumed for the FAT16 data image (no ATA IDENTIFY pass).
    const DATA_DISK_SECTORS: u64 = 131_072;

    /// First user program looked for after mount.
    const INIT_PATH: &str = "/usr/init.elf";

    static BOOT_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    entry_point!(kernel_main, config = &BOOT_CONFIG);

    fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
        serial::init();
        println!("Ferrite v{}", env!("CARGO_PKG_VERSION"));
        logger::init(log::LevelFilter::Info);

        if let Some(fb) = boot_info.framebuffer.as_ref() {
            let info = fb.info();
            framebuffer::record(FramebufferInfo {
                base: fb.buffer().as_ptr() as u64,
                width: info.width as u32,
                height: info.height as u32,
                stride: info.stride as u32,
            });
        }

        let phys_offset = boot_info
            .physical_memory_offset
            .into_option()
            .expect("bootloader must map physical memory");
        vmem::set_mode(TranslateMode::Offset(phys_offset));

        init_frame_allocator(&boot_info.memory_regions);
        heap::init(HEAP_INITIAL).expect("initial heap region");

        arch::x86_64::init();
        paging::init_kernel_pml4().expect("kernel PML4");
        // The identity map is live now; drop the bootloader's offset
        // window from the translation path.
        vmem::set_mode(TranslateMode::Identity);

        sched::scheduler::init();
        mount_data_disk();
        ferrite_kernel::mm::log_stats();

        match elf::load(INIT_PATH) {
            Ok(tid) => sched::task_ready(tid),
            Err(e) => log::warn!("no init task: {} ({})", INIT_PATH, e),
        }

        arch::x86_64::pit::start();
        log::info!("boot complete, entering idle loop");
        loop {
            sched::schedule();
            arch::wait_for_interrupt();
        }
    }

    /// Seed the frame bitmap from the bootloader's memory map: the
    /// managed range spans the usable regions (capped at the identity
    /// limit) and every non-usable range inside it is reserved. Runs
    /// before the heap exists, so no allocation here.
    fn init_frame_allocator(regions: &MemoryRegions) {
        let mut start = u64::MAX;
        let mut end = 0u64;
        for region in regions.iter() {
            if region.kind == MemoryRegionKind::Usable {
                start = start.min(region.start);
                end = end.max(region.end);
            }
        }
        assert!(start < end, "no usable memory reported");
        // Leave real-mode memory alone.
        start = start.max(0x10_0000);
        end = end.min(PHYS_LIMIT);
        frame::init(start, end);

        for region in regions.iter() {
            if region.kind != MemoryRegionKind::Usable
                && region.end > start
                && region.start < end
            {
                frame::reserve(region.start.max(start), region.end.min(end));
            }
        }
    }

    /// Probe the data disk and hand it to the VFS.
    fn mount_data_disk() {
        fs::register_backend("fat16", fs::fat16::probe);
        let disk = Arc::new(AtaDisk::new(0, DATA_DISK_SECTORS));
        match BlockCache::new(disk, SECTOR_SIZE, CACHE_ENTRIES) {
            Ok(cache) => match fs::mount_with_cache(cache) {
                Ok(name) => log::info!("data disk mounted ({})", name),
                Err(e) => log::warn!("no filesystem on data disk: {:?}", e),
            },
            Err(e) => log::warn!("block cache init failed: {}", e),
        }
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        println!("[KERNEL PANIC] {}", info);
        arch::halt();
    }
}

// Host builds (cargo check / test) only need the library; the kernel
// entry above is bare-metal only.
#[cfg(not(target_os = "none"))]
fn main() {}
