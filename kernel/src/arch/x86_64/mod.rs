//! x86_64 support: descriptor tables, interrupt delivery, the PIT tick
//! source, context switching, and the user-mode transitions.

pub mod context;
#[cfg(target_os = "none")]
pub mod gdt;
#[cfg(target_os = "none")]
pub mod idt;
#[cfg(target_os = "none")]
pub mod pic;
#[cfg(target_os = "none")]
pub mod pit;
#[cfg(target_os = "none")]
pub mod syscall_entry;
#[cfg(target_os = "none")]
pub mod usermode;

pub mod timer;

/// Bring up descriptor tables and the interrupt path. Interrupts stay
/// disabled until the scheduler is ready; `pit::start` unmasks the tick.
#[cfg(target_os = "none")]
pub fn init() {
    gdt::init();
    idt::init();
    pic::init();
    syscall_entry::init_msrs();
    log::info!("arch: GDT/IDT/PIC ready");
}
