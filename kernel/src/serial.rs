//! COM1 serial console
//!
//! 38400 8N1 on port 0x3F8. Every `printk`-style diagnostic in the kernel
//! is mirrored here; it is also the write sink for user fds 1 and 2 until
//! a framebuffer console takes over.

use core::fmt;

use crate::sync::IrqMutex;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
static COM1: IrqMutex<Option<uart_16550::SerialPort>> = IrqMutex::new(None);

/// Host-side capture buffer so unit tests can assert on console output.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
static COM1: IrqMutex<alloc::string::String> = IrqMutex::new(alloc::string::String::new());

/// Initialize COM1. Must run before the first `println!`.
pub fn init() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    COM1.with(|port| {
        // SAFETY: 0x3F8 is the standard COM1 I/O port block; nothing else
        // in the kernel drives these ports.
        let mut com = unsafe { uart_16550::SerialPort::new(0x3F8) };
        com.init();
        *port = Some(com);
    });
}

/// Write raw bytes to the serial line.
pub fn write_bytes(bytes: &[u8]) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    COM1.with(|port| {
        if let Some(com) = port {
            for &b in bytes {
                com.send(b);
            }
        }
    });
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    COM1.with(|buf| {
        buf.push_str(core::str::from_utf8(bytes).unwrap_or("<non-utf8>"));
    });
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;

    struct Sink;
    impl fmt::Write for Sink {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            write_bytes(s.as_bytes());
            Ok(())
        }
    }
    let _ = Sink.write_fmt(args);
}

/// Drain the host capture buffer (test helper).
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn take_captured() -> alloc::string::String {
    COM1.with(core::mem::take)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn captures_formatted_output() {
        let _ = take_captured();
        _print(format_args!("tick {}", 7));
        assert!(take_captured().contains("tick 7"));
    }
}
