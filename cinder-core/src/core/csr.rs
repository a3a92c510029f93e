//! The control and status register file.
//!
//! A 12-bit specifier addresses up to 4096 registers. A small fixed set has
//! overridden read semantics (the counter shadows below) and ignores writes;
//! every other index is plain storage that reads as zero until written.

use std::collections::HashMap;

/// Type for specifying CSRs by their 12-bit index.
pub type CsrSpecifier = u16;

pub const CYCLE: CsrSpecifier = 0xC00;
pub const TIME: CsrSpecifier = 0xC01;
pub const INSTRET: CsrSpecifier = 0xC02;
pub const CYCLEH: CsrSpecifier = 0xC80;
pub const TIMEH: CsrSpecifier = 0xC81;
pub const INSTRETH: CsrSpecifier = 0xC82;
pub const MCYCLE: CsrSpecifier = 0xB00;
pub const MINSTRET: CsrSpecifier = 0xB02;
pub const MCYCLEH: CsrSpecifier = 0xB80;
pub const MINSTRETH: CsrSpecifier = 0xB82;

/// Returns `true` for the counter shadows whose values are derived rather
/// than stored. Writes to these are silently discarded.
pub fn is_read_only(specifier: CsrSpecifier) -> bool {
    matches!(
        specifier,
        CYCLE | TIME | INSTRET | CYCLEH | TIMEH | INSTRETH | MCYCLE | MINSTRET | MCYCLEH
            | MINSTRETH
    )
}

/// Backing storage for the freely writable CSRs.
#[derive(Debug, Default, Clone)]
pub struct CsrFile {
    storage: HashMap<CsrSpecifier, u32>,
}

impl CsrFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a plainly stored CSR. Unwritten registers read as zero.
    pub fn get(&self, specifier: CsrSpecifier) -> u32 {
        self.storage.get(&specifier).copied().unwrap_or(0)
    }

    /// Overwrite a plainly stored CSR.
    pub fn set(&mut self, specifier: CsrSpecifier, value: u32) {
        self.storage.insert(specifier, value);
    }

    /// Drop all stored values, as on machine reset.
    pub fn clear(&mut self) {
        self.storage.clear();
    }
}
