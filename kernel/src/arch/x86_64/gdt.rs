// Global Descriptor Table

use lazy_static::lazy_static;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// 32-bit Ring 3 code descriptor. Present only so STAR can point at the
/// descriptor pair SYSRET expects: SS = STAR[63:48]+8, CS = STAR[63:48]+16.
const USER_CODE32_BITS: u64 = 0x00CF_FA00_0000_FFFF;

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        // Ring 3 -> Ring 0 transition stack. Replaced with the current
        // task's kernel stack before every user-mode entry; this static
        // stack only covers the window before the first task runs.
        // 16-byte aligned for the x86_64 ABI.
        tss.privilege_stack_table[0] = {
            const STACK_SIZE: usize = 4096 * 5;
            #[repr(align(16))]
            #[allow(dead_code)] // Alignment wrapper -- field accessed via raw pointer
            struct AlignedStack([u8; STACK_SIZE]);
            static mut KERNEL_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_ptr = &raw const KERNEL_STACK;
            let stack_start = VirtAddr::from_ptr(stack_ptr);
            stack_start + STACK_SIZE as u64
        };

        // Dedicated double-fault stack.
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            const STACK_SIZE: usize = 4096 * 5;
            #[repr(align(16))]
            #[allow(dead_code)] // Alignment wrapper -- field accessed via raw pointer
            struct AlignedStack([u8; STACK_SIZE]);
            static mut STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_ptr = &raw const STACK;
            let stack_start = VirtAddr::from_ptr(stack_ptr);
            stack_start + STACK_SIZE as u64
        };
        tss
    };
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());        // 0x08
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());        // 0x10
        let user_code32 = gdt.append(Descriptor::UserSegment(USER_CODE32_BITS)); // 0x18
        let user_data = gdt.append(Descriptor::user_data_segment());            // 0x20 (0x23 with RPL)
        let user_code = gdt.append(Descriptor::user_code_segment());            // 0x28 (0x2B with RPL)
        let tss = gdt.append(Descriptor::tss_segment(&TSS));                    // 0x30 (2 entries)
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                user_code32,
                user_data,
                user_code,
                tss,
            },
        )
    };
}

/// GDT segment selectors.
///
/// Layout:
/// - 0x00: Null descriptor
/// - 0x08: Kernel code (Ring 0)
/// - 0x10: Kernel data (Ring 0)
/// - 0x18: User code, 32-bit (SYSRET compatibility anchor)
/// - 0x20: User data (Ring 3, selector 0x23 with RPL)
/// - 0x28: User code, 64-bit (Ring 3, selector 0x2B with RPL)
/// - 0x30: TSS (occupies 2 entries)
pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_code32: SegmentSelector,
    pub user_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub tss: SegmentSelector,
}

pub fn init() {
    use x86_64::instructions::{
        segmentation::{Segment, CS, DS, ES, SS},
        tables::load_tss,
    };

    GDT.0.load();
    // SAFETY: the selectors reference descriptors in the GDT loaded on the
    // line above; reloading segment registers right after lgdt is the
    // required sequence.
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        SS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
}

/// Selectors for the user-mode and syscall paths. Valid after `init()`.
pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Update `TSS.rsp0`, the stack the CPU switches to on a Ring 3 -> Ring 0
/// transition. Called before every user-mode entry with interrupts
/// disabled.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: single CPU, interrupts disabled by the caller; nothing else
    // reads the privilege stack table concurrently.
    unsafe {
        let tss_ptr = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss_ptr).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}

/// Current `TSS.rsp0`.
pub fn kernel_stack() -> u64 {
    TSS.privilege_stack_table[0].as_u64()
}
