//! General purpose registers and the program counter.

use core::fmt;
use std::fmt::Formatter;

/// The number of `x` registers (indices start at `0` for `x0`).
pub const LEN: u8 = 32;

/// A core's general purpose register file.
///
/// There are 32 word-size registers `x0`..`x31` plus the program counter.
/// Register `x0` is hardwired to zero: reads always return `0` and writes
/// are discarded at this level, so no caller can break the invariant.
///
/// It is not possible to get a mutable reference to an `x` register, since
/// that would allow unchecked writes to register `x0`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Registers {
    x_registers: [u32; LEN as usize],
    pc: u32,
}

impl Default for Registers {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Registers {
    /// Returns a fresh all-zero register file with the given program counter.
    pub fn new(initial_pc: u32) -> Self {
        Self {
            x_registers: [0; LEN as usize],
            pc: initial_pc,
        }
    }

    /// Returns the value of an `x` register.
    pub fn x(&self, specifier: Specifier) -> u32 {
        self.x_registers[usize::from(specifier)]
    }

    /// Sets the value of an `x` register. Writes to `x0` are ignored.
    pub fn set_x(&mut self, specifier: Specifier, value: u32) {
        if specifier.0 != 0 {
            self.x_registers[specifier.0 as usize] = value;
        }
    }

    /// Returns the value of the `pc` register.
    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// Returns a mutable reference to the `pc` register value.
    pub fn pc_mut(&mut self) -> &mut u32 {
        &mut self.pc
    }

    /// Snapshot of all `x` registers, for the debugger history.
    pub fn x_all(&self) -> [u32; LEN as usize] {
        self.x_registers
    }

    /// Restore all `x` registers from a snapshot taken with [`Self::x_all`].
    ///
    /// The `x0` slot of a snapshot is zero by construction, so this cannot
    /// violate the hardwired-zero invariant.
    pub fn restore_x(&mut self, snapshot: [u32; LEN as usize]) {
        self.x_registers = snapshot;
        self.x_registers[0] = 0;
    }
}

/// An `x` register specifier. Can take values in the range `0..LEN`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Specifier(u8);

impl Specifier {
    /// Register `x0`, a.k.a. `zero`: reads as `0`, ignores writes.
    pub const X0: Self = Specifier(0);
    /// Register `x1`, a.k.a. `ra`, the standard link register.
    pub const RA: Self = Specifier(1);
    /// Register `x2`, a.k.a. `sp`, the standard stack pointer.
    pub const SP: Self = Specifier(2);
    /// Register `x10`, a.k.a. `a0`, first argument / return value.
    pub const A0: Self = Specifier(10);
    /// Register `x17`, a.k.a. `a7`, the environment-call selector.
    pub const A7: Self = Specifier(17);

    /// Create a register specifier from its index, returning `None` if the
    /// index is out of range.
    pub fn new<U: TryInto<u8>>(index: U) -> Option<Self> {
        let index = index.try_into().ok()?;
        (index < LEN).then_some(Self(index))
    }

    /// Convert a 5-bit value into a register specifier.
    /// Panics if the value doesn't fit in 5 bits (`0..=31`).
    pub fn from_u5(value_u5: u8) -> Self {
        const_assert_eq!(LEN, 32);
        if value_u5 > 31 {
            panic!("out of range u5 used");
        }
        Self(value_u5)
    }

    /// Return an iterator over all register specifiers, from x0 up to x31.
    pub fn iter_all() -> impl Iterator<Item = Self> {
        (0..LEN).map(Self)
    }

    /// The ABI name of this register (`zero`, `ra`, `sp`, ..., `t6`).
    pub fn abi_name(self) -> &'static str {
        ABI_NAMES[self.0 as usize]
    }

    /// Parse a register name in either numeric (`x7`) or ABI (`t2`) form.
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(digits) = name.strip_prefix('x') {
            if digits.len() == 1 || (digits.len() == 2 && !digits.starts_with('0')) {
                return digits.parse::<u8>().ok().and_then(Self::new);
            }
            return None;
        }
        // `s0` and `fp` both name x8.
        if name == "fp" {
            return Some(Self(8));
        }
        ABI_NAMES
            .iter()
            .position(|&abi| abi == name)
            .map(|i| Self(i as u8))
    }
}

const ABI_NAMES: [&str; LEN as usize] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

impl From<Specifier> for u8 {
    fn from(value: Specifier) -> Self {
        value.0
    }
}

impl From<Specifier> for u32 {
    fn from(value: Specifier) -> Self {
        value.0 as u32
    }
}

impl From<Specifier> for usize {
    fn from(value: Specifier) -> Self {
        value.0 as usize
    }
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_to_zero() {
        let mut registers = Registers::default();
        assert_eq!(0, registers.x(Specifier::X0));
        registers.set_x(Specifier::X0, 0xDEADBEEF);
        assert_eq!(0, registers.x(Specifier::X0));
    }

    #[test]
    fn test_set_and_get() {
        let mut registers = Registers::default();
        for i in 1..LEN {
            registers.set_x(Specifier::from_u5(i), i as u32 + 1);
        }
        assert_eq!(0, registers.x(Specifier::X0));
        for i in 1..LEN {
            assert_eq!(i as u32 + 1, registers.x(Specifier::from_u5(i)));
        }
    }

    #[test]
    fn test_restore_forces_x0() {
        let mut registers = Registers::default();
        let mut snapshot = registers.x_all();
        snapshot[0] = 7;
        registers.restore_x(snapshot);
        assert_eq!(0, registers.x(Specifier::X0));
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(Some(Specifier::X0), Specifier::parse("x0"));
        assert_eq!(Some(Specifier::X0), Specifier::parse("zero"));
        assert_eq!(Some(Specifier::SP), Specifier::parse("sp"));
        assert_eq!(Some(Specifier::from_u5(8)), Specifier::parse("fp"));
        assert_eq!(Some(Specifier::from_u5(8)), Specifier::parse("s0"));
        assert_eq!(Some(Specifier::from_u5(31)), Specifier::parse("t6"));
        assert_eq!(None, Specifier::parse("x32"));
        assert_eq!(None, Specifier::parse("x01"));
        assert_eq!(None, Specifier::parse("q3"));
    }

    #[test]
    fn test_abi_names_round_trip() {
        for spec in Specifier::iter_all() {
            assert_eq!(Some(spec), Specifier::parse(spec.abi_name()));
            assert_eq!(Some(spec), Specifier::parse(&spec.to_string()));
        }
    }
}
