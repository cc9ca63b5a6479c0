//! Bump allocation of conventional memory for bootstrap code.

use crate::memory::address::paragraphs;
use crate::memory::MemoryError;

/// First segment past conventional memory and the upper memory area.
const END_SEGMENT: u32 = 0x1_0000;

/// Hands out blocks of the lowest 1 MiB, paragraph-aligned.
///
/// Each request names the lowest segment it may start at. The allocator
/// never reuses memory: it only moves its free pointer upwards, so fixed
/// structures (interrupt vector table, BIOS data area, ROM stubs) must be
/// reserved in ascending order of their minimum segment if they are meant to
/// land exactly there.
#[derive(Debug, Default)]
pub struct ConventionalAllocator {
    /// First free segment.
    next_free: u32,
}

impl ConventionalAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `size` bytes starting no lower than `min_segment:0000`.
    ///
    /// Returns the segment of the reserved block.
    pub fn allocate(&mut self, min_segment: u16, size: u32) -> Result<u16, MemoryError> {
        let start = self.next_free.max(u32::from(min_segment));
        let end = start + paragraphs(size);
        if start >= END_SEGMENT || end > END_SEGMENT {
            return Err(MemoryError::OutOfConventionalMemory { requested: size });
        }

        debug!("reserved {} bytes at {:04X}:0000", size, start);
        self.next_free = end;
        Ok(start as u16)
    }

    /// The segment the next unconstrained allocation would return.
    pub fn next_free_segment(&self) -> u32 {
        self.next_free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_minimum_segment() {
        let mut alloc = ConventionalAllocator::new();
        assert_eq!(alloc.allocate(0x0000, 0x400).unwrap(), 0x0000);
        assert_eq!(alloc.allocate(0x0040, 0x100).unwrap(), 0x0040);
        assert_eq!(alloc.next_free_segment(), 0x0050);
        assert_eq!(alloc.allocate(0xF000, 2).unwrap(), 0xF000);
    }

    #[test]
    fn never_moves_backwards() {
        let mut alloc = ConventionalAllocator::new();
        alloc.allocate(0x2000, 0x20).unwrap();
        // asking for a lower segment afterwards bumps past the previous block
        assert_eq!(alloc.allocate(0x0040, 0x10).unwrap(), 0x2002);
    }

    #[test]
    fn exhaustion() {
        let mut alloc = ConventionalAllocator::new();
        alloc.allocate(0xFFF0, 0x100).unwrap();
        match alloc.allocate(0, 1) {
            Err(MemoryError::OutOfConventionalMemory { requested: 1 }) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn huge_request() {
        let mut alloc = ConventionalAllocator::new();
        match alloc.allocate(0, u32::max_value()) {
            Err(MemoryError::OutOfConventionalMemory { requested }) => assert_eq!(requested, u32::max_value()),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(alloc.next_free_segment(), 0);
    }
}
