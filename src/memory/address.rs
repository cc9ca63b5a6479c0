//! Real-mode address arithmetic.

use std::fmt;

/// Highest physical address reachable while the A20 line is disabled, plus
/// one. Addresses computed from a segment and offset wrap around here.
pub const A20_DISABLED_SIZE: u32 = 0x10_0000;

/// Address mask applied to physical addresses when A20 is disabled.
pub const A20_DISABLED_MASK: u32 = A20_DISABLED_SIZE - 1;

/// Address mask applied when A20 is enabled (21 address lines).
pub const A20_ENABLED_MASK: u32 = 0x1F_FFFF;

/// A real-mode `segment:offset` address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentedAddress {
    pub segment: u16,
    pub offset: u16,
}

impl SegmentedAddress {
    pub const fn new(segment: u16, offset: u16) -> Self {
        Self { segment, offset }
    }

    /// Computes `segment * 16 + offset` without applying any address mask.
    ///
    /// The result can exceed 1 MiB by up to 64 KiB - 16 bytes (the high memory
    /// area). Use `Memory::physical` to apply the A20 gate.
    pub fn linear(&self) -> u32 {
        (u32::from(self.segment) << 4) + u32::from(self.offset)
    }

    /// Returns the address `delta` bytes further, wrapping inside the segment.
    pub fn wrapping_add(&self, delta: u16) -> Self {
        Self::new(self.segment, self.offset.wrapping_add(delta))
    }
}

impl fmt::Display for SegmentedAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.segment, self.offset)
    }
}

/// Converts a segment and offset to a physical address with real-mode
/// wraparound at 1 MiB (A20 disabled).
pub fn physical(segment: u16, offset: u16) -> u32 {
    SegmentedAddress::new(segment, offset).linear() & A20_DISABLED_MASK
}

/// Number of 16-byte paragraphs needed to hold `bytes` bytes.
pub fn paragraphs(bytes: u32) -> u32 {
    bytes / 16 + u32::from(bytes % 16 != 0)
}
