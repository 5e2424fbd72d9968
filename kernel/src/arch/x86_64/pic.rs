// Legacy 8259 PIC pair, remapped to 0x20/0x28

use pic8259::ChainedPics;

use crate::sync::IrqMutex;

use super::idt::IRQ_BASE;

static PICS: IrqMutex<ChainedPics> =
    // SAFETY: 0x20/0x28 do not collide with CPU exception vectors.
    IrqMutex::new(unsafe { ChainedPics::new(IRQ_BASE, IRQ_BASE + 8) });

/// Remap the PICs away from the exception range and mask everything
/// except timer and keyboard.
pub fn init() {
    PICS.with(|pics| {
        // SAFETY: standard 8259 initialization sequence on the I/O ports
        // owned by this module.
        unsafe {
            pics.initialize();
            // IRQ0 (timer) + IRQ1 (keyboard) unmasked on the master; all
            // slave lines masked.
            pics.write_masks(0b1111_1100, 0b1111_1111);
        }
    });
}

/// Acknowledge an IRQ so the PIC will deliver the next one.
pub fn end_of_interrupt(vector: u8) {
    PICS.with(|pics| {
        // SAFETY: vector originates from our own IDT dispatch.
        unsafe { pics.notify_end_of_interrupt(vector) }
    });
}
