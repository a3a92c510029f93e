//! Character I/O port.
//!
//! Register layout (byte offsets within the mapped region):
//! - `+0` read: next queued input byte, or zero when the queue is empty;
//!   write: emit the low byte on the host character stream, flushed.
//! - `+5` read: line status; bit 0 signals a queued input byte, bits 5 and 6
//!   (transmitter idle) are always set.
//!
//! The same port backs the environment-call character stream: syscall writes
//! go out through [`Console::write_host`], syscall reads come in through
//! [`Console::read_host`], which may block on the host reader.

use crate::bus::{AccessWidth, Device};
use bitvec::order::Lsb0;
use bitvec::view::BitView;
use log::trace;
use std::collections::VecDeque;
use std::io;
use std::io::{Read, Write};

const DATA: u32 = 0;
const STATUS: u32 = 5;

pub struct Console {
    output: Box<dyn Write>,
    input: Option<Box<dyn Read>>,
    rx_queue: VecDeque<u8>,
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("rx_queue", &self.rx_queue)
            .finish_non_exhaustive()
    }
}

impl Console {
    /// Console writing to the process's stdout and reading from its stdin.
    pub fn stdio() -> Self {
        Self::new(Box::new(io::stdout()), Some(Box::new(io::stdin())))
    }

    pub fn new(output: Box<dyn Write>, input: Option<Box<dyn Read>>) -> Self {
        Self {
            output,
            input,
            rx_queue: VecDeque::new(),
        }
    }

    /// Queue a byte for the guest to pick up through the data register.
    pub fn push_byte(&mut self, byte: u8) {
        self.rx_queue.push_back(byte);
    }

    fn status(&self) -> u8 {
        let mut status = 0u8;
        let bits = status.view_bits_mut::<Lsb0>();
        bits.set(0, !self.rx_queue.is_empty());
        // Transmitter holding register and FIFO always empty: output is
        // flushed synchronously.
        bits.set(5, true);
        bits.set(6, true);
        status
    }

    /// Write `bytes` to the host character stream and flush.
    pub fn write_host(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.output.write_all(bytes)?;
        self.output.flush()
    }

    /// Read up to `buf.len()` bytes from the host reader, stopping after a
    /// newline the way a line-buffered terminal does. May block. Returns the
    /// number of bytes read; `Ok(0)` on end of input or if no reader is
    /// attached.
    pub fn read_host(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(input) = self.input.as_mut() else {
            return Ok(0);
        };
        let mut filled = 0;
        while filled < buf.len() {
            let mut byte = [0u8; 1];
            match input.read(&mut byte)? {
                0 => break,
                _ => {
                    buf[filled] = byte[0];
                    filled += 1;
                    if byte[0] == b'\n' {
                        break;
                    }
                }
            }
        }
        Ok(filled)
    }
}

impl Device for Console {
    fn name(&self) -> &'static str {
        "console"
    }

    fn load(&mut self, offset: u32, _width: AccessWidth) -> u32 {
        match offset {
            DATA => u32::from(self.rx_queue.pop_front().unwrap_or(0)),
            STATUS => u32::from(self.status()),
            _ => 0,
        }
    }

    fn store(&mut self, offset: u32, value: u32, _width: AccessWidth) {
        if offset == DATA {
            if let Err(err) = self.write_host(&[value as u8]) {
                trace!("console write failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bits() {
        let mut console = Console::new(Box::new(io::sink()), None);
        assert_eq!(0x60, console.load(STATUS, AccessWidth::Byte));
        console.push_byte(b'a');
        assert_eq!(0x61, console.load(STATUS, AccessWidth::Byte));
    }

    #[test]
    fn test_data_pops_queue() {
        let mut console = Console::new(Box::new(io::sink()), None);
        console.push_byte(b'h');
        console.push_byte(b'i');
        assert_eq!(u32::from(b'h'), console.load(DATA, AccessWidth::Byte));
        assert_eq!(u32::from(b'i'), console.load(DATA, AccessWidth::Byte));
        // Empty queue reads as zero
        assert_eq!(0, console.load(DATA, AccessWidth::Byte));
    }

    #[test]
    fn test_read_host_stops_at_newline() {
        let input: &[u8] = b"ab\ncd";
        let mut console = Console::new(Box::new(io::sink()), Some(Box::new(input)));
        let mut buf = [0u8; 8];
        assert_eq!(3, console.read_host(&mut buf).unwrap());
        assert_eq!(b"ab\n", &buf[..3]);
    }

    #[test]
    fn test_unmapped_offset_is_silent() {
        let mut console = Console::new(Box::new(io::sink()), None);
        assert_eq!(0, console.load(9, AccessWidth::Byte));
        console.store(9, 0xFF, AccessWidth::Byte);
    }
}
