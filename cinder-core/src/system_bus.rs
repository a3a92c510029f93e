//! The memory fabric: flat RAM plus the memory-mapped device window.
//!
//! Every architectural load and store goes through here. Accesses whose
//! address falls inside an attached device's region are forwarded to that
//! device with a region-relative offset; everything else hits RAM. An access
//! that lands in neither is an error the core turns into a fatal halt.
//!
//! A halfword or word access is routed entirely by its lowest byte address;
//! accesses straddling a region boundary are not meaningful and simply
//! follow the lowest byte.

use crate::bus::{AccessWidth, Device};
use crate::devices::ram::{Ram, RamError};
use log::trace;
use rangemap::RangeInclusiveMap;
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;

/// Handle type under which devices are attached to the fabric.
///
/// The board keeps a second handle to each device so the host can reach
/// device-specific surfaces (pixel buffer, key queue) between steps.
pub type DeviceHandle = Rc<RefCell<dyn Device>>;

#[derive(Debug)]
pub struct SystemBus {
    ram: Ram,
    ram_base: u32,
    /// Map of guest address range to an index into `devices`.
    regions: RangeInclusiveMap<u32, usize>,
    devices: Vec<(u32, DeviceHandle)>,
    /// Byte addresses written since the last [`Self::take_written`], device
    /// regions included. Consumed by the debugger history every step.
    written: Vec<u32>,
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum AccessError {
    #[error("no RAM or device mapped at address {0:#010x}")]
    Unmapped(u32),
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum MappingError {
    #[error("device region overlaps a previously mapped region")]
    OverlappingRegions,
    #[error("device region overlaps RAM")]
    OverlapsRam,
    #[error("device region is empty or exceeds the address space")]
    InvalidRegion,
}

impl SystemBus {
    pub fn new(ram: Ram, ram_base: u32) -> Self {
        Self {
            ram,
            ram_base,
            regions: RangeInclusiveMap::new(),
            devices: Vec::new(),
            written: Vec::new(),
        }
    }

    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut Ram {
        &mut self.ram
    }

    pub fn ram_base(&self) -> u32 {
        self.ram_base
    }

    /// Attach `device` to the guest address range `base..base+size`.
    pub fn attach_device(
        &mut self,
        base: u32,
        size: u32,
        device: DeviceHandle,
    ) -> Result<(), MappingError> {
        let end = size
            .checked_sub(1)
            .and_then(|s| base.checked_add(s))
            .ok_or(MappingError::InvalidRegion)?;
        let range = base..=end;
        if self.regions.overlaps(&range) {
            return Err(MappingError::OverlappingRegions);
        }
        let ram_end = self.ram_base + (self.ram.len() - 1) as u32;
        if base <= ram_end && end >= self.ram_base {
            return Err(MappingError::OverlapsRam);
        }
        trace!(
            "mapping {} at {base:#010x}..={end:#010x}",
            device.borrow().name()
        );
        let index = self.devices.len();
        self.devices.push((base, device));
        self.regions.insert(range, index);
        Ok(())
    }

    /// Perform a read access. Signed widening is the caller's business; the
    /// returned value is zero-extended from the access width.
    pub fn read(&mut self, address: u32, width: AccessWidth) -> Result<u32, AccessError> {
        if let Some(&index) = self.regions.get(&address) {
            let (base, device) = &self.devices[index];
            let value = device.borrow_mut().load(address - base, width);
            return Ok(width.truncate(value));
        }
        let offset = self.ram_offset(address, width)?;
        Ok(match width {
            AccessWidth::Byte => u32::from(self.ram.read_u8(offset)),
            AccessWidth::Halfword => u32::from(self.ram.read_u16(offset)),
            AccessWidth::Word => self.ram.read_u32(offset),
        })
    }

    /// Perform a write access of the low `width` bytes of `value`.
    pub fn write(
        &mut self,
        address: u32,
        value: u32,
        width: AccessWidth,
    ) -> Result<(), AccessError> {
        if let Some(&index) = self.regions.get(&address) {
            let (base, device) = &self.devices[index];
            device
                .borrow_mut()
                .store(address - base, width.truncate(value), width);
            self.record_write(address, width);
            return Ok(());
        }
        let offset = self.ram_offset(address, width)?;
        match width {
            AccessWidth::Byte => self.ram.write_u8(offset, value as u8),
            AccessWidth::Halfword => self.ram.write_u16(offset, value as u16),
            AccessWidth::Word => self.ram.write_u32(offset, value),
        }
        self.record_write(address, width);
        Ok(())
    }

    /// Fetch goes straight to RAM: the program image lives there, and
    /// executing out of a device region is never meaningful.
    pub fn fetch_halfword(&self, address: u32) -> Result<u16, AccessError> {
        let offset = self.ram_offset(address, AccessWidth::Halfword)?;
        Ok(self.ram.read_u16(offset))
    }

    pub fn fetch_word(&self, address: u32) -> Result<u32, AccessError> {
        let offset = self.ram_offset(address, AccessWidth::Word)?;
        Ok(self.ram.read_u32(offset))
    }

    /// Copy a program image into RAM at guest address `address`.
    /// On failure nothing is written.
    pub fn load_image(&mut self, address: u32, image: &[u8]) -> Result<(), RamError> {
        let offset = address
            .checked_sub(self.ram_base)
            .ok_or(RamError::ImageTooLarge {
                image_len: image.len(),
                offset: address,
            })?;
        self.ram.load_image(offset, image)
    }

    /// Take the list of byte addresses written since the last call.
    pub fn take_written(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.written)
    }

    fn record_write(&mut self, address: u32, width: AccessWidth) {
        for i in 0..width.size() {
            self.written.push(address.wrapping_add(i));
        }
    }

    fn ram_offset(&self, address: u32, width: AccessWidth) -> Result<u32, AccessError> {
        let offset = address
            .checked_sub(self.ram_base)
            .ok_or(AccessError::Unmapped(address))?;
        if self.ram.contains(offset, width.size()) {
            Ok(offset)
        } else {
            Err(AccessError::Unmapped(address))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{Keyboard, Syscon};

    fn bus() -> SystemBus {
        SystemBus::new(Ram::new(1 << 20).unwrap(), 0)
    }

    #[test]
    fn test_ram_round_trip() {
        let mut bus = bus();
        bus.write(0x100, 0xAB, AccessWidth::Byte).unwrap();
        assert_eq!(0xAB, bus.read(0x100, AccessWidth::Byte).unwrap());
        bus.write(0x200, 0xDEADBEEF, AccessWidth::Word).unwrap();
        assert_eq!(0xBEEF, bus.read(0x200, AccessWidth::Halfword).unwrap());
    }

    #[test]
    fn test_out_of_range_is_error() {
        let mut bus = bus();
        assert!(bus.read(0x4000_0000, AccessWidth::Word).is_err());
        assert!(bus.write(0x4000_0000, 0, AccessWidth::Word).is_err());
        // Word access hanging off the end of RAM
        assert!(bus.read((1 << 20) - 2, AccessWidth::Word).is_err());
    }

    #[test]
    fn test_device_dispatch() {
        let mut bus = bus();
        let kbd = Rc::new(RefCell::new(Keyboard::new()));
        bus.attach_device(0x1120_0000, 12, kbd.clone()).unwrap();
        kbd.borrow_mut().push_event(0x42);
        assert_eq!(1, bus.read(0x1120_0000, AccessWidth::Word).unwrap());
        assert_eq!(0x42, bus.read(0x1120_0004, AccessWidth::Word).unwrap());
        assert_eq!(0, bus.read(0x1120_0000, AccessWidth::Word).unwrap());
    }

    #[test]
    fn test_mapping_overlap_rejected() {
        let mut bus = bus();
        let a = Rc::new(RefCell::new(Syscon::new()));
        let b = Rc::new(RefCell::new(Syscon::new()));
        bus.attach_device(0x1130_0000, 4, a).unwrap();
        assert_eq!(
            Err(MappingError::OverlappingRegions),
            bus.attach_device(0x1130_0002, 4, b.clone())
        );
        assert_eq!(
            Err(MappingError::OverlapsRam),
            bus.attach_device(0x0000_1000, 4, b)
        );
    }

    #[test]
    fn test_written_log() {
        let mut bus = bus();
        bus.write(0x10, 0x1234, AccessWidth::Halfword).unwrap();
        assert_eq!(vec![0x10, 0x11], bus.take_written());
        assert!(bus.take_written().is_empty());
    }

    #[test]
    fn test_load_image_at_base() {
        let mut bus = SystemBus::new(Ram::new(1 << 20).unwrap(), 0x8000_0000);
        bus.load_image(0x8000_0000, &[0x13, 0x0E, 0x10, 0x00]).unwrap();
        assert_eq!(0x0010_0E13, bus.fetch_word(0x8000_0000).unwrap());
        assert!(bus.load_image(0x0, &[0]).is_err());
    }
}
