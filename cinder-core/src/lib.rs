//! Interpreter core for a 32-bit little-endian RISC machine.
//!
//! The crate is organised around a [`board::Board`] that owns the
//! architectural state ([`core::Core`]), the memory fabric
//! ([`system_bus::SystemBus`]) with its attached devices, and the debugger
//! history ([`debug::History`]). Hosts drive the board one instruction at a
//! time and observe device side effects through the handles the board hands
//! out; nothing in here depends on a particular windowing or terminal shell.

#[macro_use]
extern crate static_assertions;

pub mod asm;
pub mod board;
pub mod bus;
pub mod core;
pub mod debug;
pub mod devices;
pub mod instruction;
pub mod registers;
pub mod system_bus;

/// Re-export of the most commonly used entry points.
pub use crate::board::{Board, BoardConfig};
pub use crate::core::Halt;
