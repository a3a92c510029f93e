//! The reference board: RAM, the canonical device map, one core, and the
//! debugger history, wired together behind the host-facing operations.

use crate::asm::{assemble, disassemble, AsmError};
use crate::core::{Config, Core, Halt, StepInfo};
use crate::debug::{History, Snapshot, TraceRecord, DEFAULT_SNAPSHOT_LIMIT, DEFAULT_TRACE_LIMIT};
use crate::devices::ram::RamError;
use crate::devices::{framebuffer, Console, Framebuffer, Keyboard, MicroTimer, Ram, Syscon};
use crate::system_bus::{MappingError, SystemBus};
use log::info;
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;

/// Address map and sizing of the reference board.
///
/// The device bases are host-configurable; the defaults follow the layout
/// the bundled bare-metal payloads were built against.
#[derive(Debug, Clone)]
pub struct BoardConfig {
    /// RAM size in bytes (1 MiB..=128 MiB).
    pub memory_size: usize,
    /// Guest address where RAM begins.
    pub ram_base: u32,
    pub console_base: u32,
    pub timer_base: u32,
    pub framebuffer_base: u32,
    pub keyboard_base: u32,
    pub syscon_base: u32,
    pub snapshot_limit: usize,
    pub trace_limit: usize,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            memory_size: 16 << 20,
            ram_base: 0,
            console_base: 0x1000_0000,
            timer_base: 0x1100_BFF8,
            framebuffer_base: 0x1110_0000,
            keyboard_base: 0x1120_0000,
            syscon_base: 0x1130_0000,
            snapshot_limit: DEFAULT_SNAPSHOT_LIMIT,
            trace_limit: DEFAULT_TRACE_LIMIT,
        }
    }
}

#[derive(Error, Debug)]
pub enum BoardError {
    #[error(transparent)]
    Ram(#[from] RamError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Asm(#[from] AsmError),
}

pub struct Board {
    core: Core,
    bus: SystemBus,
    history: History,
    console: Rc<RefCell<Console>>,
    framebuffer: Rc<RefCell<Framebuffer>>,
    keyboard: Rc<RefCell<Keyboard>>,
    syscon: Rc<RefCell<Syscon>>,
    load_address: u32,
    image_len: usize,
}

impl std::fmt::Debug for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Board")
            .field("core", &self.core)
            .field("image_len", &self.image_len)
            .finish_non_exhaustive()
    }
}

impl Board {
    /// A board whose console talks to the process's stdio.
    pub fn new(config: BoardConfig) -> Result<Self, BoardError> {
        Self::with_console(config, Console::stdio())
    }

    /// A board with a caller-supplied console, for hosts that redirect the
    /// character stream (and for tests).
    pub fn with_console(config: BoardConfig, console: Console) -> Result<Self, BoardError> {
        let ram = Ram::new(config.memory_size)?;
        let mut bus = SystemBus::new(ram, config.ram_base);

        let console = Rc::new(RefCell::new(console));
        let timer = Rc::new(RefCell::new(MicroTimer::new()));
        let framebuffer = Rc::new(RefCell::new(Framebuffer::new(
            framebuffer::WIDTH,
            framebuffer::HEIGHT,
        )));
        let keyboard = Rc::new(RefCell::new(Keyboard::new()));
        let syscon = Rc::new(RefCell::new(Syscon::new()));

        bus.attach_device(config.console_base, 256, console.clone())?;
        bus.attach_device(config.timer_base, 8, timer)?;
        let fb_size = framebuffer.borrow().size_bytes();
        bus.attach_device(config.framebuffer_base, fb_size, framebuffer.clone())?;
        bus.attach_device(config.keyboard_base, 12, keyboard.clone())?;
        bus.attach_device(config.syscon_base, 4, syscon.clone())?;

        let memory_size = config.memory_size as u32;
        let core = Core::new(
            Config {
                reset_pc: config.ram_base,
                mtime_address: config.timer_base,
                initial_break: config.ram_base + memory_size / 2,
                mmap_top: config.ram_base + memory_size,
            },
            console.clone(),
        );

        Ok(Self {
            core,
            bus,
            history: History::new(config.snapshot_limit, config.trace_limit),
            console,
            framebuffer,
            keyboard,
            syscon,
            load_address: config.ram_base,
            image_len: 0,
        })
    }

    /// Load a raw program image at `address` and reset the machine:
    /// registers cleared, counters cleared, history and trace cleared, and
    /// the program counter set to `address`. On failure nothing changes.
    pub fn load_image(&mut self, address: u32, image: &[u8]) -> Result<(), BoardError> {
        self.bus.load_image(address, image)?;
        self.core.reset();
        *self.core.registers_mut().pc_mut() = address;
        self.history.clear();
        self.bus.take_written();
        self.keyboard.borrow_mut().clear();
        self.syscon.borrow_mut().reset();
        self.load_address = address;
        self.image_len = image.len();
        info!("loaded {} bytes at {address:#010x}", image.len());
        Ok(())
    }

    /// The bytes of the loaded image as they currently sit in memory.
    pub fn image_bytes(&self) -> &[u8] {
        let offset = self.load_address - self.bus.ram_base();
        self.bus.ram().slice(offset, self.image_len)
    }

    /// Execute one instruction, maintaining the debugger history.
    pub fn step(&mut self) -> Result<StepInfo, Halt> {
        let snapshot = Snapshot {
            pc: self.core.registers().pc(),
            x: self.core.registers().x_all(),
            retired: self.core.retired(),
            reservation: self.core.reservation(),
        };
        self.bus.take_written();

        let info = self.core.step(&mut self.bus)?;

        let record = TraceRecord {
            cycle: snapshot.retired,
            pc: info.pc,
            raw: info.raw,
            text: info.instruction.to_string(),
        };
        self.history.push_snapshot(snapshot);
        let written = self.bus.take_written();
        self.history
            .finish_step(&self.core.registers().x_all(), written, record);

        if self.syscon.borrow().shutdown_requested() {
            return Err(Halt::Shutdown);
        }
        Ok(info)
    }

    /// Run up to `steps` instructions, stopping early on any halt.
    pub fn run(&mut self, steps: u32) -> Result<(), Halt> {
        for _ in 0..steps {
            self.step()?;
        }
        Ok(())
    }

    /// Restore the most recent snapshot: program counter, register file,
    /// retired counter, and reservation. Memory is left as the forward run
    /// wrote it. Returns `false` when the history is empty.
    pub fn step_back(&mut self) -> bool {
        let Some(snapshot) = self.history.pop_snapshot() else {
            return false;
        };
        let registers = self.core.registers_mut();
        *registers.pc_mut() = snapshot.pc;
        registers.restore_x(snapshot.x);
        self.core.set_retired(snapshot.retired);
        self.core.set_reservation(snapshot.reservation);
        true
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut History {
        &mut self.history
    }

    /// Read a register by index; out-of-range indices read as zero.
    pub fn read_register(&self, index: u8) -> u32 {
        crate::registers::Specifier::new(index)
            .map(|specifier| self.core.registers().x(specifier))
            .unwrap_or(0)
    }

    /// Read one byte of RAM. `None` for addresses outside RAM; device
    /// registers are not read, since a debugger peek must not trigger
    /// device side effects.
    pub fn read_memory_byte(&self, address: u32) -> Option<u8> {
        let offset = address.checked_sub(self.bus.ram_base())?;
        self.bus
            .ram()
            .contains(offset, 1)
            .then(|| self.bus.ram().read_u8(offset))
    }

    /// Write one byte of RAM. Breaks a matching reservation like any other
    /// store. Returns `false` for addresses outside RAM.
    pub fn write_memory_byte(&mut self, address: u32, value: u8) -> bool {
        let Some(offset) = address.checked_sub(self.bus.ram_base()) else {
            return false;
        };
        if !self.bus.ram().contains(offset, 1) {
            return false;
        }
        self.bus.ram_mut().write_u8(offset, value);
        self.core.note_store(address, 1);
        true
    }

    /// Render the loaded image as assembly text, one word per line, for
    /// the editor surface.
    pub fn disassemble_image(&self) -> String {
        let mut text = String::new();
        for chunk in self.image_bytes().chunks_exact(4) {
            let word = u32::from_le_bytes(chunk.try_into().unwrap());
            text.push_str(&disassemble(word));
            text.push('\n');
        }
        text
    }

    /// Leave the editor: assemble `text` and, on success, load the result
    /// at the current load address (resetting the machine). On failure the
    /// machine is untouched and the error describes the offending line.
    pub fn apply_edited_source(&mut self, text: &str) -> Result<(), BoardError> {
        let image = assemble(text)?;
        self.load_image(self.load_address, &image)
    }

    /// Queue a translated key event for the guest.
    pub fn push_key_event(&mut self, code: u32) {
        self.keyboard.borrow_mut().push_event(code);
    }

    /// Queue a byte on the console input port.
    pub fn push_console_byte(&mut self, byte: u8) {
        self.console.borrow_mut().push_byte(byte);
    }

    /// Host access to the framebuffer, for blitting.
    pub fn framebuffer(&self) -> &Rc<RefCell<Framebuffer>> {
        &self.framebuffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn board() -> Board {
        let config = BoardConfig {
            memory_size: 1 << 20,
            ..BoardConfig::default()
        };
        Board::with_console(config, Console::new(Box::new(io::sink()), None)).unwrap()
    }

    #[test]
    fn test_load_resets_machine() {
        let mut b = board();
        b.load_image(0, &[0x13, 0x0E, 0x10, 0x00]).unwrap();
        b.step().unwrap();
        assert_eq!(1, b.core().retired());
        b.load_image(0, &[0x13, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(0, b.core().retired());
        assert_eq!(0, b.core().registers().pc());
        assert_eq!(0, b.history().snapshot_count());
    }

    #[test]
    fn test_step_back_restores_state() {
        let mut b = board();
        // addi x1, x0, 5; addi x1, x1, 1
        b.load_image(0, &[0x93, 0x00, 0x50, 0x00, 0x93, 0x80, 0x10, 0x00])
            .unwrap();
        b.step().unwrap();
        b.step().unwrap();
        assert_eq!(6, b.read_register(1));
        assert!(b.step_back());
        assert_eq!(5, b.read_register(1));
        assert_eq!(4, b.core().registers().pc());
        assert_eq!(1, b.core().retired());
        assert!(b.step_back());
        assert_eq!(0, b.read_register(1));
        assert_eq!(0, b.core().retired());
        assert!(!b.step_back());
    }

    #[test]
    fn test_memory_peek_poke() {
        let mut b = board();
        assert!(b.write_memory_byte(0x100, 0xAB));
        assert_eq!(Some(0xAB), b.read_memory_byte(0x100));
        // Device window is not peekable
        assert_eq!(None, b.read_memory_byte(0x1000_0000));
        assert!(!b.write_memory_byte(0x1000_0000, 1));
    }

    #[test]
    fn test_edit_round_trip() {
        let mut b = board();
        let image = assemble("addi x1, x0, 1\nnop\n").unwrap();
        b.load_image(0, &image).unwrap();
        let text = b.disassemble_image();
        assert_eq!("addi x1, x0, 1\naddi x0, x0, 0\n", text);
        b.apply_edited_source("addi x1, x0, 2\n").unwrap();
        b.step().unwrap();
        assert_eq!(2, b.read_register(1));
        // A failed edit leaves the machine alone
        assert!(b.apply_edited_source("bogus\n").is_err());
        assert_eq!(2, b.read_register(1));
    }

    #[test]
    fn test_shutdown_through_syscon() {
        let mut b = board();
        // lui x1, 0x11300 ; addi x2, x0, 0x555 ; slli x2, x2, 4 ;
        // addi x2, x2, 5 ; sw x2, 0(x1)
        let image = assemble(
            "lui x1, 0x11300\naddi x2, x0, 0x555\nslli x2, x2, 4\naddi x2, x2, 5\nsw x2, 0(x1)\n",
        )
        .unwrap();
        b.load_image(0, &image).unwrap();
        for _ in 0..4 {
            b.step().unwrap();
        }
        assert_eq!(Err(Halt::Shutdown), b.step().map(|_| ()));
    }

    #[test]
    fn test_changed_addresses_flow_to_history() {
        let mut b = board();
        let image = assemble("lui x1, 0x1\nsw x1, 0(x1)\n").unwrap();
        b.load_image(0, &image).unwrap();
        b.step().unwrap();
        assert!(b.history_mut().take_written().is_empty());
        b.step().unwrap();
        assert_eq!(
            vec![0x1000, 0x1001, 0x1002, 0x1003],
            b.history_mut().take_written()
        );
    }
}
