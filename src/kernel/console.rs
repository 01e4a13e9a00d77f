// Console input and output.
// Input arrives through intr(), one character at a time, and is
// edited into lines before read() may see it:
//   newline -- end of line
//   control-h -- backspace
//   control-u -- kill line
//   control-d -- end of file
// Output, including the echo of typed characters, is kept for the
// host to collect with output().

use crate::error::{Error::*, Result};
use crate::file::{Device, RawMode};
use crate::spinlock::Mutex;
use core::num::Wrapping;

const BS: u8 = 0x08;

// Control-x
const fn ctrl(x: u8) -> u8 {
    x - b'@'
}

// ioctl requests
pub const TIOCGETP: u16 = 0;
pub const TIOCSETP: u16 = 1;

pub const ECHO: u16 = 0o10; // echo typed characters

const INPUT_BUF_SIZE: usize = 128;
struct Cons {
    buf: [u8; INPUT_BUF_SIZE],
    r: Wrapping<usize>, // Read index
    w: Wrapping<usize>, // Write index
    e: Wrapping<usize>, // Edit index
    flags: u16,
    out: Vec<u8>,
}

pub struct Console {
    cons: Mutex<Cons>,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Cons {
    fn putc(&mut self, c: u8) {
        if self.flags & ECHO == 0 {
            return;
        }
        if c == ctrl(b'H') {
            self.out.extend_from_slice(&[BS, b' ', BS]);
        } else {
            self.out.push(c);
        }
    }
}

impl Console {
    pub fn new() -> Self {
        Self {
            cons: Mutex::new(
                Cons {
                    buf: [0; INPUT_BUF_SIZE],
                    r: Wrapping(0),
                    w: Wrapping(0),
                    e: Wrapping(0),
                    flags: ECHO,
                    out: Vec::new(),
                },
                "cons",
            ),
        }
    }

    //
    // the console input interrupt handler.
    // do erase/kill processing, append to the input buffer,
    // and make a whole line visible to read() once it has arrived.
    //
    pub fn intr(&self, c: u8) {
        let mut cons_guard = self.cons.lock();
        match c {
            // Kill line
            m if m == ctrl(b'U') => {
                while cons_guard.e != cons_guard.w
                    && cons_guard.buf[(cons_guard.e - Wrapping(1)).0 % INPUT_BUF_SIZE] != b'\n'
                {
                    cons_guard.e -= Wrapping(1);
                    cons_guard.putc(ctrl(b'H'));
                }
            }
            // Backspace
            m if m == ctrl(b'H') || m == b'\x7f' => {
                if cons_guard.e != cons_guard.w {
                    cons_guard.e -= Wrapping(1);
                    cons_guard.putc(ctrl(b'H'));
                }
            }
            _ => {
                if c != 0 && (cons_guard.e - cons_guard.r).0 < INPUT_BUF_SIZE {
                    let c = if c == b'\r' { b'\n' } else { c };

                    // echo back to the user
                    cons_guard.putc(c);

                    let e_idx = cons_guard.e.0 % INPUT_BUF_SIZE;
                    cons_guard.buf[e_idx] = c;
                    cons_guard.e += Wrapping(1);

                    if c == b'\n'
                        || c == ctrl(b'D')
                        || (cons_guard.e - cons_guard.r).0 == INPUT_BUF_SIZE
                    {
                        cons_guard.w = cons_guard.e;
                    }
                }
            }
        }
    }

    pub fn feed(&self, input: &[u8]) {
        input.iter().for_each(|&c| self.intr(c));
    }

    pub fn output(&self) -> Vec<u8> {
        self.cons.lock().out.clone()
    }
}

impl Device for Console {
    fn open(&self, minor: u16) -> Result<()> {
        if minor != 0 {
            return Err(NoSuchNode);
        }
        Ok(())
    }

    //
    // copy (up to) a whole input line to dst.
    // there is nobody to wait for, so an empty buffer reads as 0 bytes.
    //
    fn read(&self, _minor: u16, _mode: RawMode, dst: &mut [u8]) -> Result<usize> {
        let mut cons_guard = self.cons.lock();
        let mut n = 0;
        while n < dst.len() && cons_guard.r != cons_guard.w {
            let c = cons_guard.buf[cons_guard.r.0 % INPUT_BUF_SIZE];
            cons_guard.r += Wrapping(1);

            if c == ctrl(b'D') {
                // end of file
                if n > 0 {
                    // Save ^D for next time, to make sure
                    // caller gets a 0-bytes result.
                    cons_guard.r -= Wrapping(1);
                }
                break;
            }

            dst[n] = c;
            n += 1;

            if c == b'\n' {
                break;
            }
        }
        Ok(n)
    }

    fn write(&self, _minor: u16, _mode: RawMode, src: &[u8]) -> Result<usize> {
        self.cons.lock().out.extend_from_slice(src);
        Ok(src.len())
    }

    fn ioctl(&self, _minor: u16, request: u16, data: &mut [u8]) -> Result<()> {
        let mut cons_guard = self.cons.lock();
        match (request, data) {
            (TIOCGETP, [lo, hi, ..]) => {
                [*lo, *hi] = cons_guard.flags.to_le_bytes();
                Ok(())
            }
            (TIOCSETP, [lo, hi, ..]) => {
                cons_guard.flags = u16::from_le_bytes([*lo, *hi]);
                Ok(())
            }
            _ => Err(InvalidArgument),
        }
    }

    fn name(&self) -> &'static str {
        "console"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_editing() {
        let cons = Console::new();
        cons.feed(b"lx\x08s\n");
        let mut buf = [0u8; 16];
        // the line is held back until its newline arrives
        cons.feed(b"pa");
        assert_eq!(cons.read(0, RawMode::Char(0), &mut buf), Ok(3));
        assert_eq!(&buf[..3], b"ls\n");
        assert_eq!(cons.read(0, RawMode::Char(0), &mut buf), Ok(0));

        cons.feed(&[ctrl(b'U')]);
        cons.feed(b"ok\n");
        assert_eq!(cons.read(0, RawMode::Char(0), &mut buf), Ok(3));
        assert_eq!(&buf[..3], b"ok\n");
        assert_eq!(cons.output(), b"lx\x08 \x08s\npa\x08 \x08\x08 \x08ok\n");
    }

    #[test]
    fn ioctl_flags() {
        let cons = Console::new();
        let mut flags = [0u8; 2];
        cons.ioctl(0, TIOCGETP, &mut flags).unwrap();
        assert_eq!(u16::from_le_bytes(flags), ECHO);
        cons.ioctl(0, TIOCSETP, &mut [0, 0]).unwrap();
        cons.feed(b"quiet\n");
        assert!(cons.output().is_empty());
        assert_eq!(cons.ioctl(0, 9, &mut flags), Err(InvalidArgument));
        assert_eq!(cons.open(1), Err(NoSuchNode));
    }
}
