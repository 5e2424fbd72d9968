// Interrupt Descriptor Table

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};
use x86_64::{PrivilegeLevel, VirtAddr};

use super::context::TrapFrame;
use super::pic;

/// Legacy PIC base: IRQ0 lands on vector 32 after the remap.
pub const IRQ_BASE: u8 = 0x20;
pub const TIMER_VECTOR: u8 = IRQ_BASE;
pub const KEYBOARD_VECTOR: u8 = IRQ_BASE + 1;
/// `int 0x80` syscall gate.
pub const SYSCALL_VECTOR: u8 = 0x80;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.debug.set_handler_fn(debug_handler);
        idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded.set_handler_fn(bound_range_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available.set_handler_fn(device_not_available_handler);
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present.set_handler_fn(segment_not_present_handler);
        idt.stack_segment_fault.set_handler_fn(stack_segment_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point.set_handler_fn(x87_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.machine_check.set_handler_fn(machine_check_handler);
        idt.simd_floating_point.set_handler_fn(simd_handler);
        idt.virtualization.set_handler_fn(virtualization_handler);
        // SAFETY: the double-fault handler runs on its own IST stack so a
        // corrupt kernel stack cannot cascade into a triple fault.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(super::gdt::DOUBLE_FAULT_IST_INDEX);
        }
        // Timer and syscall go through naked stubs that capture the full
        // register frame; the typed signatures cannot express that.
        // SAFETY: both stubs build a TrapFrame and end in iretq.
        unsafe {
            idt[TIMER_VECTOR]
                .set_handler_addr(VirtAddr::new(timer_entry as usize as u64));
            idt[SYSCALL_VECTOR]
                .set_handler_addr(VirtAddr::new(
                    super::syscall_entry::int80_entry as usize as u64,
                ))
                .set_privilege_level(PrivilegeLevel::Ring3);
        }
        idt[KEYBOARD_VECTOR].set_handler_fn(keyboard_interrupt_handler);
        idt
    };
}

pub fn init() {
    IDT.load();
}

/// Fatal exception: print the diagnostic frame and halt. There is no
/// process kill in this release; a single fault stops the machine.
fn fatal(name: &str, stack_frame: &InterruptStackFrame, error_code: Option<u64>) -> ! {
    println!("EXCEPTION: {}", name);
    if let Some(code) = error_code {
        println!("Error Code: {:#x}", code);
    }
    println!("{:#?}", stack_frame);
    crate::arch::halt();
}

extern "x86-interrupt" fn divide_error_handler(stack_frame: InterruptStackFrame) {
    fatal("DIVIDE ERROR", &stack_frame, None);
}

extern "x86-interrupt" fn debug_handler(stack_frame: InterruptStackFrame) {
    fatal("DEBUG", &stack_frame, None);
}

extern "x86-interrupt" fn nmi_handler(stack_frame: InterruptStackFrame) {
    fatal("NON-MASKABLE INTERRUPT", &stack_frame, None);
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    fatal("BREAKPOINT", &stack_frame, None);
}

extern "x86-interrupt" fn overflow_handler(stack_frame: InterruptStackFrame) {
    fatal("OVERFLOW", &stack_frame, None);
}

extern "x86-interrupt" fn bound_range_handler(stack_frame: InterruptStackFrame) {
    fatal("BOUND RANGE EXCEEDED", &stack_frame, None);
}

extern "x86-interrupt" fn invalid_opcode_handler(stack_frame: InterruptStackFrame) {
    fatal("INVALID OPCODE", &stack_frame, None);
}

extern "x86-interrupt" fn device_not_available_handler(stack_frame: InterruptStackFrame) {
    fatal("DEVICE NOT AVAILABLE", &stack_frame, None);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) -> ! {
    fatal("DOUBLE FAULT", &stack_frame, Some(error_code));
}

extern "x86-interrupt" fn invalid_tss_handler(stack_frame: InterruptStackFrame, error_code: u64) {
    fatal("INVALID TSS", &stack_frame, Some(error_code));
}

extern "x86-interrupt" fn segment_not_present_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    fatal("SEGMENT NOT PRESENT", &stack_frame, Some(error_code));
}

extern "x86-interrupt" fn stack_segment_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    fatal("STACK SEGMENT FAULT", &stack_frame, Some(error_code));
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    fatal("GENERAL PROTECTION FAULT", &stack_frame, Some(error_code));
}

extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    println!("EXCEPTION: PAGE FAULT");
    println!("Accessed Address: {:?}", Cr2::read());
    println!("Error Code: {:?}", error_code);
    println!("{:#?}", stack_frame);
    crate::arch::halt();
}

extern "x86-interrupt" fn x87_handler(stack_frame: InterruptStackFrame) {
    fatal("x87 FLOATING POINT", &stack_frame, None);
}

extern "x86-interrupt" fn alignment_check_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    fatal("ALIGNMENT CHECK", &stack_frame, Some(error_code));
}

extern "x86-interrupt" fn machine_check_handler(stack_frame: InterruptStackFrame) -> ! {
    fatal("MACHINE CHECK", &stack_frame, None);
}

extern "x86-interrupt" fn simd_handler(stack_frame: InterruptStackFrame) {
    fatal("SIMD FLOATING POINT", &stack_frame, None);
}

extern "x86-interrupt" fn virtualization_handler(stack_frame: InterruptStackFrame) {
    fatal("VIRTUALIZATION", &stack_frame, None);
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    use x86_64::instructions::port::Port;

    let mut data: Port<u8> = Port::new(0x60);
    // SAFETY: reading the PS/2 output buffer in the IRQ1 handler.
    let scancode = unsafe { data.read() };
    crate::drivers::keyboard::handle_scancode(scancode);
    pic::end_of_interrupt(KEYBOARD_VECTOR);
}

/// Timer tick: full GPR capture so the scheduler can snapshot the
/// interrupted task, then either a plain return into the stub (same task
/// continues via iretq) or a `task_restore` into the next one.
#[unsafe(naked)]
pub unsafe extern "C" fn timer_entry() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "call {handler}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        handler = sym timer_interrupt,
    );
}

extern "C" fn timer_interrupt(frame: &mut TrapFrame) {
    super::timer::record_tick();
    // EOI before a possible task_restore: the chosen task must be able to
    // receive the next tick.
    pic::end_of_interrupt(TIMER_VECTOR);
    crate::sched::scheduler::preempt_from_irq(frame);
}
