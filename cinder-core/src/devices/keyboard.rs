//! Keyboard event queue device.
//!
//! Register layout (byte offsets):
//! - `+0` read: status, bit 0 set while an event is queued;
//! - `+4` read: pop the next event code, zero when empty;
//! - `+8` write: clear the queue.
//!
//! The host pushes already-translated key codes (the guest defines the code
//! space; the DOOM port uses its own scan codes). The queue is bounded; when
//! full, the newest event is dropped.

use crate::bus::{AccessWidth, Device};
use log::warn;
use std::collections::VecDeque;

const STATUS: u32 = 0;
const DATA: u32 = 4;
const CLEAR: u32 = 8;

/// Maximum number of buffered key events.
pub const QUEUE_LIMIT: usize = 64;

#[derive(Debug, Default)]
pub struct Keyboard {
    queue: VecDeque<u32>,
}

impl Keyboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a translated key event. Dropped (with a warning) when the queue
    /// is full.
    pub fn push_event(&mut self, code: u32) {
        if self.queue.len() >= QUEUE_LIMIT {
            warn!("keyboard queue full, dropping event {code:#x}");
            return;
        }
        self.queue.push_back(code);
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl Device for Keyboard {
    fn name(&self) -> &'static str {
        "keyboard"
    }

    fn load(&mut self, offset: u32, _width: AccessWidth) -> u32 {
        match offset {
            STATUS => u32::from(!self.queue.is_empty()),
            DATA => self.queue.pop_front().unwrap_or(0),
            _ => 0,
        }
    }

    fn store(&mut self, offset: u32, _value: u32, _width: AccessWidth) {
        if offset == CLEAR {
            self.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_pop() {
        let mut kbd = Keyboard::new();
        assert_eq!(0, kbd.load(STATUS, AccessWidth::Word));
        kbd.push_event(0xAC);
        kbd.push_event(0xAE);
        assert_eq!(1, kbd.load(STATUS, AccessWidth::Word));
        assert_eq!(0xAC, kbd.load(DATA, AccessWidth::Word));
        assert_eq!(0xAE, kbd.load(DATA, AccessWidth::Word));
        assert_eq!(0, kbd.load(STATUS, AccessWidth::Word));
        assert_eq!(0, kbd.load(DATA, AccessWidth::Word));
    }

    #[test]
    fn test_clear_register() {
        let mut kbd = Keyboard::new();
        kbd.push_event(1);
        kbd.push_event(2);
        kbd.store(CLEAR, 0, AccessWidth::Word);
        assert_eq!(0, kbd.load(STATUS, AccessWidth::Word));
    }

    #[test]
    fn test_bounded_queue() {
        let mut kbd = Keyboard::new();
        for code in 0..(QUEUE_LIMIT as u32 + 8) {
            kbd.push_event(code);
        }
        let mut drained = 0;
        while kbd.load(STATUS, AccessWidth::Word) == 1 {
            kbd.load(DATA, AccessWidth::Word);
            drained += 1;
        }
        assert_eq!(QUEUE_LIMIT, drained);
    }
}
