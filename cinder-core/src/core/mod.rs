//! The interpreter core: architectural state and the step cycle.

pub mod csr;
mod ecall;
mod execute;

use crate::bus::AccessWidth;
use crate::devices::Console;
use crate::instruction::{expand_compressed, is_compressed, Instruction};
use crate::registers::Registers;
use crate::system_bus::SystemBus;
use csr::{CsrFile, CsrSpecifier};
use execute::Executor;
use log::debug;
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;

/// Why the interpreter stopped.
///
/// `Exit` and `Shutdown` are clean terminations; everything else is fatal
/// and reported to the user as a diagnostic. There is no exception
/// machinery: control never returns to the guest after a fatal halt.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum Halt {
    #[error("guest exited with code {0}")]
    Exit(u32),
    #[error("guest requested shutdown through system control")]
    Shutdown,
    #[error("breakpoint trap at pc {pc:#010x}")]
    Break { pc: u32 },
    #[error("illegal instruction {instruction:#010x} at pc {pc:#010x}")]
    IllegalInstruction { pc: u32, instruction: u32 },
    #[error("access fault for address {address:#010x} at pc {pc:#010x}")]
    AccessFault { pc: u32, address: u32 },
}

impl Halt {
    /// `true` for halts that should produce a non-zero process exit.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Halt::Exit(_) | Halt::Shutdown)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the program counter is set to on reset.
    pub reset_pc: u32,
    /// Guest address of the memory-mapped microsecond timer. The `time`
    /// CSRs and the clock syscall read through the fabric at this address.
    pub mtime_address: u32,
    /// Initial program break for the `brk` syscall.
    pub initial_break: u32,
    /// Upper bound of the heap; `mmap` carves regions downward from here.
    pub mmap_top: u32,
}

pub(crate) type ExecutionResult = Result<(), Halt>;

/// Everything the host needs to render one retired instruction.
#[derive(Debug, Clone)]
pub struct StepInfo {
    /// Program counter the instruction was fetched from.
    pub pc: u32,
    /// The fetched encoding: the 16-bit halfword for compressed
    /// instructions, the full word otherwise.
    pub raw: u32,
    /// `true` if the instruction came from a 16-bit encoding.
    pub compressed: bool,
    pub instruction: Instruction,
}

/// A single-hart core executing out of a [`SystemBus`].
#[derive(Debug)]
pub struct Core {
    config: Config,
    registers: Registers,
    csr_file: CsrFile,
    /// Target word address of the most recent load-reserved, if no
    /// conflicting store has happened since.
    reservation: Option<u32>,
    /// Retired-instruction counter; also serves as the cycle counter since
    /// this interpreter retires one instruction per cycle.
    retired: u64,
    /// The character stream used by the environment-call shim.
    console: Rc<RefCell<Console>>,
    brk: u32,
    mmap_base: u32,
}

impl Core {
    pub fn new(config: Config, console: Rc<RefCell<Console>>) -> Self {
        let registers = Registers::new(config.reset_pc);
        let brk = config.initial_break;
        let mmap_base = config.mmap_top;
        Self {
            config,
            registers,
            csr_file: CsrFile::new(),
            reservation: None,
            retired: 0,
            console,
            brk,
            mmap_base,
        }
    }

    /// Force the core back to its reset state.
    pub fn reset(&mut self) {
        self.registers = Registers::new(self.config.reset_pc);
        self.csr_file.clear();
        self.reservation = None;
        self.retired = 0;
        self.brk = self.config.initial_break;
        self.mmap_base = self.config.mmap_top;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    /// The retired-instruction counter.
    pub fn retired(&self) -> u64 {
        self.retired
    }

    /// Restore the counter, for the debugger's reverse step.
    pub fn set_retired(&mut self, value: u64) {
        self.retired = value;
    }

    pub fn reservation(&self) -> Option<u32> {
        self.reservation
    }

    /// Overwrite the reservation, for the debugger's reverse step.
    pub fn set_reservation(&mut self, reservation: Option<u32>) {
        self.reservation = reservation;
    }

    /// Invalidate the reservation if the `size`-byte store at `address`
    /// overlaps the reserved word. Called on every successful store path,
    /// including host-side debugger pokes.
    pub fn note_store(&mut self, address: u32, size: u32) {
        if let Some(reserved) = self.reservation {
            let store_end = address.wrapping_add(size);
            let reserved_end = reserved.wrapping_add(4);
            if address < reserved_end && reserved < store_end {
                self.reservation = None;
            }
        }
    }

    /// Fetch, decode and execute a single instruction.
    ///
    /// On success all effects of the instruction are applied and the
    /// retired counter has advanced by one. On `Err` the architectural
    /// state is unchanged except for effects already performed by the
    /// faulting instruction's syscall (there are none: the shim only
    /// commits on success).
    pub fn step(&mut self, bus: &mut SystemBus) -> Result<StepInfo, Halt> {
        let pc = self.registers.pc();
        let halfword = self
            .fetch_halfword(bus, pc)
            .map_err(|address| Halt::AccessFault { pc, address })?;

        let (raw, word, compressed) = if is_compressed(halfword) {
            let word = expand_compressed(halfword).map_err(|_| Halt::IllegalInstruction {
                pc,
                instruction: u32::from(halfword),
            })?;
            (u32::from(halfword), word, true)
        } else {
            let word = bus
                .fetch_word(pc)
                .map_err(|_| Halt::AccessFault { pc, address: pc })?;
            (word, word, false)
        };

        let instruction = Instruction::decode(word).map_err(|_| Halt::IllegalInstruction {
            pc,
            instruction: raw,
        })?;

        Executor {
            core: self,
            bus,
            step_len: if compressed { 2 } else { 4 },
        }
        .execute(instruction)?;

        self.retired += 1;

        Ok(StepInfo {
            pc,
            raw,
            compressed,
            instruction,
        })
    }

    fn fetch_halfword(&self, bus: &SystemBus, pc: u32) -> Result<u16, u32> {
        bus.fetch_halfword(pc).map_err(|_| pc)
    }

    /// Read a CSR. The counter shadows read the retired counter; the time
    /// shadows read the device timer through the fabric.
    pub fn read_csr(&mut self, bus: &mut SystemBus, specifier: CsrSpecifier) -> u32 {
        match specifier {
            csr::CYCLE | csr::MCYCLE | csr::INSTRET | csr::MINSTRET => self.retired as u32,
            csr::CYCLEH | csr::MCYCLEH | csr::INSTRETH | csr::MINSTRETH => {
                (self.retired >> 32) as u32
            }
            csr::TIME => self.read_mtime(bus) as u32,
            csr::TIMEH => (self.read_mtime(bus) >> 32) as u32,
            _ => self.csr_file.get(specifier),
        }
    }

    /// Write a CSR. Writes to the read-only shadows are silently dropped.
    pub fn write_csr(&mut self, specifier: CsrSpecifier, value: u32) {
        if csr::is_read_only(specifier) {
            debug!("dropping write to read-only csr {specifier:#05x}");
            return;
        }
        self.csr_file.set(specifier, value);
    }

    /// The 64-bit microsecond counter, read through the fabric.
    pub(crate) fn read_mtime(&self, bus: &mut SystemBus) -> u64 {
        let low = bus
            .read(self.config.mtime_address, AccessWidth::Word)
            .unwrap_or(0);
        let high = bus
            .read(self.config.mtime_address + 4, AccessWidth::Word)
            .unwrap_or(0);
        (u64::from(high) << 32) | u64::from(low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::Ram;
    use std::io;

    fn test_core() -> (Core, SystemBus) {
        let console = Rc::new(RefCell::new(Console::new(Box::new(io::sink()), None)));
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
        (core, bus)
    }

    #[test]
    fn test_retired_counts_steps() {
        let (mut core, mut bus) = test_core();
        // addi x1, x0, 5; addi x2, x0, 7
        bus.load_image(0, &[0x93, 0x00, 0x50, 0x00, 0x13, 0x01, 0x70, 0x00])
            .unwrap();
        core.step(&mut bus).unwrap();
        core.step(&mut bus).unwrap();
        assert_eq!(2, core.retired());
        assert_eq!(8, core.registers().pc());
    }

    #[test]
    fn test_illegal_instruction_halts() {
        let (mut core, mut bus) = test_core();
        bus.load_image(0, &[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
        assert_eq!(
            Err(Halt::IllegalInstruction {
                pc: 0,
                instruction: 0xFFFF_FFFF,
            }),
            core.step(&mut bus).map(|_| ())
        );
        // Nothing retired, pc unchanged
        assert_eq!(0, core.retired());
        assert_eq!(0, core.registers().pc());
    }

    #[test]
    fn test_fetch_outside_ram_faults() {
        let (mut core, mut bus) = test_core();
        *core.registers_mut().pc_mut() = 0x4000_0000;
        assert!(matches!(
            core.step(&mut bus),
            Err(Halt::AccessFault { .. })
        ));
    }

    #[test]
    fn test_note_store_clears_overlapping_reservation() {
        let (mut core, _) = test_core();
        core.reservation = Some(0x2000);
        core.note_store(0x1FFC, 4);
        assert_eq!(Some(0x2000), core.reservation());
        core.note_store(0x2003, 1);
        assert_eq!(None, core.reservation());
    }

    #[test]
    fn test_csr_counter_shadows() {
        let (mut core, mut bus) = test_core();
        core.retired = 0x1_0000_0002;
        assert_eq!(2, core.read_csr(&mut bus, csr::CYCLE));
        assert_eq!(1, core.read_csr(&mut bus, csr::CYCLEH));
        assert_eq!(2, core.read_csr(&mut bus, csr::INSTRET));
        // Writes to the shadows are dropped
        core.write_csr(csr::CYCLE, 99);
        assert_eq!(2, core.read_csr(&mut bus, csr::CYCLE));
        // Scratch CSRs store
        core.write_csr(0x340, 42);
        assert_eq!(42, core.read_csr(&mut bus, 0x340));
    }
}
