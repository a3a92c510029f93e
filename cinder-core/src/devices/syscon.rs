//! System control register.

use crate::bus::{AccessWidth, Device};
use log::debug;

/// Value a guest writes to request a clean shutdown.
pub const SHUTDOWN_MAGIC: u32 = 0x5555;

/// Identification value returned on reads.
const IDENT: u32 = 0x5241_524D;

#[derive(Debug, Default)]
pub struct Syscon {
    shutdown_requested: bool,
}

impl Syscon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once a guest has written the shutdown magic.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Drop a pending shutdown request, as on program load.
    pub fn reset(&mut self) {
        self.shutdown_requested = false;
    }
}

impl Device for Syscon {
    fn name(&self) -> &'static str {
        "syscon"
    }

    fn load(&mut self, offset: u32, _width: AccessWidth) -> u32 {
        match offset {
            0 => IDENT,
            _ => 0,
        }
    }

    fn store(&mut self, offset: u32, value: u32, _width: AccessWidth) {
        if offset == 0 && value == SHUTDOWN_MAGIC {
            debug!("guest requested shutdown");
            self.shutdown_requested = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_magic() {
        let mut syscon = Syscon::new();
        assert!(!syscon.shutdown_requested());
        syscon.store(0, 0x1234, AccessWidth::Word);
        assert!(!syscon.shutdown_requested());
        syscon.store(0, SHUTDOWN_MAGIC, AccessWidth::Word);
        assert!(syscon.shutdown_requested());
    }
}
