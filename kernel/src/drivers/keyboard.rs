//! PS/2 keyboard line source
//!
//! IRQ1 pushes decoded characters into a line buffer; `read_line` is the
//! blocking consumer behind `read(0, ...)`. Scancode decoding comes from
//! the `pc-keyboard` crate (set 1, US layout).

use crate::sync::IrqMutex;

const BUFFER_SIZE: usize = 256;

/// Simple byte ring. Oldest data is dropped when the buffer is full; a
/// line-oriented consumer never needs more than one line of history.
struct LineBuffer {
    data: [u8; BUFFER_SIZE],
    head: usize,
    len: usize,
    newlines: usize,
}

impl LineBuffer {
    const fn new() -> Self {
        Self {
            data: [0; BUFFER_SIZE],
            head: 0,
            len: 0,
            newlines: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        if self.len == BUFFER_SIZE {
            let dropped = self.data[self.head];
            if dropped == b'\n' {
                self.newlines -= 1;
            }
            self.head = (self.head + 1) % BUFFER_SIZE;
            self.len -= 1;
        }
        self.data[(self.head + self.len) % BUFFER_SIZE] = byte;
        self.len += 1;
        if byte == b'\n' {
            self.newlines += 1;
        }
    }

    fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let byte = self.data[self.head];
        self.head = (self.head + 1) % BUFFER_SIZE;
        self.len -= 1;
        if byte == b'\n' {
            self.newlines -= 1;
        }
        Some(byte)
    }

    fn unpush(&mut self) {
        if self.len > 0 && self.data[(self.head + self.len - 1) % BUFFER_SIZE] != b'\n' {
            self.len -= 1;
        }
    }

    fn has_line(&self) -> bool {
        self.newlines > 0 || self.len == BUFFER_SIZE
    }
}

static LINE: IrqMutex<LineBuffer> = IrqMutex::new(LineBuffer::new());

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod decode {
    use lazy_static::lazy_static;
    use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};

    use crate::sync::IrqMutex;

    lazy_static! {
        static ref KEYBOARD: IrqMutex<Keyboard<layouts::Us104Key, ScancodeSet1>> =
            IrqMutex::new(Keyboard::new(
                ScancodeSet1::new(),
                layouts::Us104Key,
                HandleControl::Ignore,
            ));
    }

    pub fn decode(scancode: u8) -> Option<char> {
        KEYBOARD.with(|kb| {
            let event = kb.add_byte(scancode).ok().flatten()?;
            match kb.process_keyevent(event)? {
                DecodedKey::Unicode(c) => Some(c),
                DecodedKey::RawKey(_) => None,
            }
        })
    }
}

/// IRQ1 path: decode and buffer one scancode.
pub fn handle_scancode(scancode: u8) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    if let Some(c) = decode::decode(scancode) {
        push_char(c);
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = scancode;
}

/// Feed one character into the line buffer. Backspace removes the last
/// unread byte of the current line; everything is echoed to the console.
pub fn push_char(c: char) {
    LINE.with(|buf| match c {
        '\u{8}' => buf.unpush(),
        '\r' | '\n' => buf.push(b'\n'),
        c if c.is_ascii() => buf.push(c as u8),
        _ => {}
    });
    if c == '\r' {
        crate::serial::write_bytes(b"\n");
    } else if c.is_ascii() {
        crate::serial::write_bytes(&[c as u8]);
    }
}

/// Blocking line read for fd 0: waits until a full line (or a full
/// buffer) is available, then drains up to `out.len()` bytes ending at
/// the newline.
pub fn read_line(out: &mut [u8]) -> usize {
    loop {
        let n = LINE.with(|buf| {
            if !buf.has_line() {
                return None;
            }
            let mut n = 0;
            while n < out.len() {
                match buf.pop() {
                    Some(b) => {
                        out[n] = b;
                        n += 1;
                        if b == b'\n' {
                            break;
                        }
                    }
                    None => break,
                }
            }
            Some(n)
        });
        if let Some(n) = n {
            return n;
        }
        crate::arch::wait_for_interrupt();
    }
}

/// Non-blocking probe used by tests and the shell's key polling.
pub fn line_ready() -> bool {
    LINE.with(|buf| buf.has_line())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    // One test body: the line buffer is a process-wide singleton and the
    // harness runs tests concurrently.
    #[test]
    fn line_assembly_read_and_backspace() {
        for c in "hi\n".chars() {
            push_char(c);
        }
        assert!(line_ready());
        let mut out = [0u8; 16];
        let n = read_line(&mut out);
        assert_eq!(&out[..n], b"hi\n");
        assert!(!line_ready());

        for c in "ax\u{8}b\n".chars() {
            push_char(c);
        }
        let n = read_line(&mut out);
        assert_eq!(&out[..n], b"ab\n");
    }
}
