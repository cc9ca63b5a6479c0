//! Devices that claim a window of the physical address space.

/// A device servicing reads and writes inside a memory window.
///
/// Addresses passed to the device are absolute physical addresses, not
/// offsets into the window. Only byte access is mandatory; wider accesses
/// default to little-endian composition of byte accesses, which is what most
/// 8-bit-bus devices do anyways.
pub trait MemoryDevice: Send {
    fn read_u8(&mut self, addr: u32) -> u8;

    fn write_u8(&mut self, addr: u32, value: u8);

    fn read_u16(&mut self, addr: u32) -> u16 {
        let lo = u16::from(self.read_u8(addr));
        let hi = u16::from(self.read_u8(addr.wrapping_add(1)));
        hi << 8 | lo
    }

    fn write_u16(&mut self, addr: u32, value: u16) {
        self.write_u8(addr, value as u8);
        self.write_u8(addr.wrapping_add(1), (value >> 8) as u8);
    }

    fn read_u32(&mut self, addr: u32) -> u32 {
        let lo = u32::from(self.read_u16(addr));
        let hi = u32::from(self.read_u16(addr.wrapping_add(2)));
        hi << 16 | lo
    }

    fn write_u32(&mut self, addr: u32, value: u32) {
        self.write_u16(addr, value as u16);
        self.write_u16(addr.wrapping_add(2), (value >> 16) as u16);
    }
}

/// A plain RAM-backed device.
///
/// Stands in for video RAM or a paged-memory frame in tests and in the CLI,
/// where nothing needs device semantics beyond "remember what was stored".
#[derive(Debug)]
pub struct RamDevice {
    base: u32,
    data: Vec<u8>,
}

impl RamDevice {
    pub fn new(base: u32, size: u32) -> Self {
        Self {
            base,
            data: vec![0; size as usize],
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn index(&self, addr: u32) -> Option<usize> {
        let idx = addr.wrapping_sub(self.base) as usize;
        if idx < self.data.len() {
            Some(idx)
        } else {
            None
        }
    }
}

impl MemoryDevice for RamDevice {
    fn read_u8(&mut self, addr: u32) -> u8 {
        self.index(addr).map(|i| self.data[i]).unwrap_or(0xFF)
    }

    fn write_u8(&mut self, addr: u32, value: u8) {
        if let Some(i) = self.index(addr) {
            self.data[i] = value;
        }
    }
}
