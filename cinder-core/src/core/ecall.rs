//! The environment-call shim.
//!
//! The guest selects an operation in `a7` (x17), passes arguments in
//! `a0`..`a5`, and receives the result in `a0`. Only the handful of calls
//! the bare-metal payloads rely on is implemented; everything else reports
//! "not implemented".

use super::{Core, Halt};
use crate::bus::AccessWidth;
use crate::registers::Specifier;
use crate::system_bus::SystemBus;
use log::debug;

const SYS_READ: u32 = 63;
const SYS_WRITE: u32 = 64;
const SYS_EXIT: u32 = 93;
const SYS_BRK: u32 = 214;
const SYS_MMAP: u32 = 222;
const SYS_CLOCK_GETTIME: u32 = 403;

const ENOSYS: i32 = -38;

/// Granularity of `mmap` reservations.
const PAGE: u32 = 0x1000;

/// Upper bound on a single `read` transfer. Reads of more return a short
/// count, which callers of `read` must handle anyway.
const READ_CHUNK: usize = 1 << 16;

impl Core {
    pub(crate) fn environment_call(&mut self, bus: &mut SystemBus) -> Result<(), Halt> {
        let selector = self.registers.x(Specifier::A7);
        match selector {
            SYS_EXIT => Err(Halt::Exit(self.registers.x(Specifier::A0))),
            SYS_WRITE => {
                let result = self.sys_write(bus);
                self.set_result(result);
                Ok(())
            }
            SYS_READ => {
                let result = self.sys_read(bus);
                self.set_result(result);
                Ok(())
            }
            SYS_BRK => {
                let result = self.sys_brk();
                self.set_result(result);
                Ok(())
            }
            SYS_MMAP => {
                let result = self.sys_mmap();
                self.set_result(result);
                Ok(())
            }
            SYS_CLOCK_GETTIME => {
                let result = self.sys_clock_gettime(bus);
                self.set_result(result);
                Ok(())
            }
            _ => {
                debug!("unimplemented environment call {selector}");
                self.set_result(ENOSYS);
                Ok(())
            }
        }
    }

    fn set_result(&mut self, value: i32) {
        self.registers.set_x(Specifier::A0, value as u32);
    }

    fn arg(&self, n: u8) -> u32 {
        self.registers.x(Specifier::new(10 + n).unwrap())
    }

    /// write(fd, buffer, count): emit `count` bytes from guest memory on the
    /// host character stream. Only stdout and stderr are backed.
    fn sys_write(&mut self, bus: &mut SystemBus) -> i32 {
        let fd = self.arg(0);
        let buffer = self.arg(1);
        let count = self.arg(2);
        if fd != 1 && fd != 2 {
            return -1;
        }
        let mut bytes = Vec::with_capacity(count.min(READ_CHUNK as u32) as usize);
        for i in 0..count {
            match bus.read(buffer.wrapping_add(i), AccessWidth::Byte) {
                Ok(byte) => bytes.push(byte as u8),
                Err(_) => break,
            }
        }
        let written = bytes.len() as i32;
        match self.console.borrow_mut().write_host(&bytes) {
            Ok(()) => written,
            Err(_) => -1,
        }
    }

    /// read(fd, buffer, count): read up to `count` bytes from the host input
    /// stream into guest memory. Only stdin is backed. May block.
    fn sys_read(&mut self, bus: &mut SystemBus) -> i32 {
        let fd = self.arg(0);
        let buffer = self.arg(1);
        let count = self.arg(2);
        if fd != 0 {
            return -1;
        }
        let mut bytes = vec![0u8; (count as usize).min(READ_CHUNK)];
        let filled = match self.console.borrow_mut().read_host(&mut bytes) {
            Ok(filled) => filled,
            Err(_) => return -1,
        };
        for (i, &byte) in bytes[..filled].iter().enumerate() {
            if !self.shim_store(bus, buffer.wrapping_add(i as u32), u32::from(byte), AccessWidth::Byte)
            {
                return i as i32;
            }
        }
        filled as i32
    }

    /// brk(address): move the program break. Zero queries; growth is only
    /// honored up to the mmap region. The result is always the current
    /// break.
    fn sys_brk(&mut self) -> i32 {
        let requested = self.arg(0);
        if requested != 0 && requested >= self.config.initial_break && requested < self.mmap_base {
            self.brk = requested;
        }
        self.brk as i32
    }

    /// mmap(..., length, ...): carve a page-rounded region downward from
    /// high memory. Only the length argument (in `a1`) matters.
    fn sys_mmap(&mut self) -> i32 {
        let length = self.arg(1);
        if length == 0 {
            return -1;
        }
        let rounded = match length.checked_add(PAGE - 1) {
            Some(n) => n & !(PAGE - 1),
            None => return -1,
        };
        match self.mmap_base.checked_sub(rounded) {
            Some(base) if base > self.brk => {
                self.mmap_base = base;
                base as i32
            }
            _ => -1,
        }
    }

    /// clock_gettime(id, timespec): fill `{seconds, 0, nanoseconds}` from
    /// the device timer at the given guest address.
    fn sys_clock_gettime(&mut self, bus: &mut SystemBus) -> i32 {
        let timespec = self.arg(1);
        let micros = self.read_mtime(bus);
        let seconds = (micros / 1_000_000) as u32;
        let nanos = ((micros % 1_000_000) * 1000) as u32;
        self.shim_store(bus, timespec, seconds, AccessWidth::Word);
        self.shim_store(bus, timespec.wrapping_add(4), 0, AccessWidth::Word);
        self.shim_store(bus, timespec.wrapping_add(8), nanos, AccessWidth::Word);
        0
    }

    /// A store performed on the guest's behalf. Follows the same rules as
    /// an architectural store, including breaking a matching reservation.
    fn shim_store(
        &mut self,
        bus: &mut SystemBus,
        address: u32,
        value: u32,
        width: AccessWidth,
    ) -> bool {
        match bus.write(address, value, width) {
            Ok(()) => {
                self.note_store(address, width.size());
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Config;
    use crate::devices::{Console, Ram};
    use std::cell::RefCell;
    use std::io;
    use std::rc::Rc;

    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn machine_with_output() -> (Core, SystemBus, Rc<RefCell<Vec<u8>>>) {
        let captured = Rc::new(RefCell::new(Vec::new()));
        let console = Rc::new(RefCell::new(Console::new(
            Box::new(SharedBuf(captured.clone())),
            Some(Box::new(&b"hello\nworld"[..])),
        )));
        let core = Core::new(
            Config {
                reset_pc: 0,
                mtime_address: 0x1100_BFF8,
                initial_break: 0x8_0000,
                mmap_top: 0x10_0000,
            },
            console,
        );
        let bus = SystemBus::new(Ram::new(1 << 20).unwrap(), 0);
        (core, bus, captured)
    }

    fn a(n: u8) -> Specifier {
        Specifier::new(10 + n).unwrap()
    }

    #[test]
    fn test_write_to_stdout() {
        let (mut core, mut bus, captured) = machine_with_output();
        bus.load_image(0x1000, b"Hello").unwrap();
        core.registers_mut().set_x(Specifier::A7, SYS_WRITE);
        core.registers_mut().set_x(a(0), 1);
        core.registers_mut().set_x(a(1), 0x1000);
        core.registers_mut().set_x(a(2), 5);
        core.environment_call(&mut bus).unwrap();
        assert_eq!(5, core.registers().x(a(0)));
        assert_eq!(b"Hello", captured.borrow().as_slice());
    }

    #[test]
    fn test_write_bad_fd() {
        let (mut core, mut bus, _) = machine_with_output();
        core.registers_mut().set_x(Specifier::A7, SYS_WRITE);
        core.registers_mut().set_x(a(0), 7);
        core.environment_call(&mut bus).unwrap();
        assert_eq!(-1i32 as u32, core.registers().x(a(0)));
    }

    #[test]
    fn test_read_fills_buffer() {
        let (mut core, mut bus, _) = machine_with_output();
        core.registers_mut().set_x(Specifier::A7, SYS_READ);
        core.registers_mut().set_x(a(0), 0);
        core.registers_mut().set_x(a(1), 0x2000);
        core.registers_mut().set_x(a(2), 16);
        core.environment_call(&mut bus).unwrap();
        // Stops after the newline
        assert_eq!(6, core.registers().x(a(0)));
        assert_eq!(
            u32::from(b'h'),
            bus.read(0x2000, crate::bus::AccessWidth::Byte).unwrap()
        );
        assert_eq!(
            u32::from(b'\n'),
            bus.read(0x2005, crate::bus::AccessWidth::Byte).unwrap()
        );
    }

    #[test]
    fn test_brk_query_and_grow() {
        let (mut core, mut bus, _) = machine_with_output();
        core.registers_mut().set_x(Specifier::A7, SYS_BRK);
        core.registers_mut().set_x(a(0), 0);
        core.environment_call(&mut bus).unwrap();
        assert_eq!(0x8_0000, core.registers().x(a(0)));
        core.registers_mut().set_x(Specifier::A7, SYS_BRK);
        core.registers_mut().set_x(a(0), 0x9_0000);
        core.environment_call(&mut bus).unwrap();
        assert_eq!(0x9_0000, core.registers().x(a(0)));
        // Shrinking below the initial break is refused
        core.registers_mut().set_x(Specifier::A7, SYS_BRK);
        core.registers_mut().set_x(a(0), 0x1000);
        core.environment_call(&mut bus).unwrap();
        assert_eq!(0x9_0000, core.registers().x(a(0)));
    }

    #[test]
    fn test_mmap_carves_downward() {
        let (mut core, mut bus, _) = machine_with_output();
        core.registers_mut().set_x(Specifier::A7, SYS_MMAP);
        core.registers_mut().set_x(a(1), 0x800);
        core.environment_call(&mut bus).unwrap();
        let first = core.registers().x(a(0));
        assert_eq!(0x10_0000 - 0x1000, first);
        core.registers_mut().set_x(Specifier::A7, SYS_MMAP);
        core.registers_mut().set_x(a(1), 0x1000);
        core.environment_call(&mut bus).unwrap();
        assert_eq!(first - 0x1000, core.registers().x(a(0)));
        // Zero length fails
        core.registers_mut().set_x(Specifier::A7, SYS_MMAP);
        core.registers_mut().set_x(a(1), 0);
        core.environment_call(&mut bus).unwrap();
        assert_eq!(-1i32 as u32, core.registers().x(a(0)));
    }

    #[test]
    fn test_exit_halts() {
        let (mut core, mut bus, _) = machine_with_output();
        core.registers_mut().set_x(Specifier::A7, SYS_EXIT);
        core.registers_mut().set_x(a(0), 3);
        assert_eq!(Err(Halt::Exit(3)), core.environment_call(&mut bus));
    }

    #[test]
    fn test_unknown_selector() {
        let (mut core, mut bus, _) = machine_with_output();
        core.registers_mut().set_x(Specifier::A7, 999);
        core.environment_call(&mut bus).unwrap();
        assert_eq!(ENOSYS as u32, core.registers().x(a(0)));
    }
}
