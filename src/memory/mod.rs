//! Physical memory of the emulated machine.
//!
//! Guest RAM is a single anonymous mapping addressed by physical address.
//! Devices (video RAM, paged-memory frames, ROMs with side effects) can claim
//! page-aligned windows of the address space; accesses to a window are routed
//! to its device instead of RAM.
//!
//! Every access made on behalf of the guest notifies the shared breakpoint
//! registry. Bulk operations notify once for the whole span they touch.
//! Instruction fetches go through `AddressSpace::load` instead, which neither
//! notifies nor counts as a guest data access.
//!
//! Memory also keeps a bitmap of bytes that belong to decoded instructions.
//! Writing to one of those bytes records the address in a log of dirty code,
//! which the node cache drains before handing out cached instructions.

mod address;
mod alloc;
mod device;

pub use self::address::*;
pub use self::alloc::ConventionalAllocator;
pub use self::device::{MemoryDevice, RamDevice};

use crate::breakpoint::{BreakpointKind, Breakpoints};
use crate::utils::NoDebug;

use memmap::MmapMut;

use std::error::Error;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::{fmt, io};

/// Smallest supported amount of RAM: conventional memory, the upper memory
/// area and the high memory area.
pub const MIN_MEMORY_SIZE: usize = 0x11_0000;

/// Size of the physical address space device windows can be mapped into.
pub const ADDRESS_SPACE_SIZE: u32 = A20_ENABLED_MASK + 1;

const PAGE_SHIFT: u32 = 12;

/// Granularity of device windows.
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;

/// Memory as seen by the instruction decoder.
pub trait AddressSpace {
    /// Loads the byte at physical address `addr`.
    fn load(&mut self, addr: u32) -> Result<u8, MemoryError>;

    fn load_u16(&mut self, addr: u32) -> Result<u16, MemoryError> {
        let (b0, b1) = (
            self.load(addr)? as u16,
            self.load(addr.wrapping_add(1))? as u16,
        );

        Ok(b1 << 8 | b0)
    }
}

/// A static, contiguous address space that stores everything in a `Vec`,
/// starting at physical address 0.
///
/// This is mostly useful for tests and benchmarks.
#[derive(Debug)]
pub struct ArrayMemory {
    mem: Vec<u8>,
}

impl ArrayMemory {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            mem: data
        }
    }

    pub fn as_vec_mut(&mut self) -> &mut Vec<u8> {
        &mut self.mem
    }
}

impl AddressSpace for ArrayMemory {
    fn load(&mut self, addr: u32) -> Result<u8, MemoryError> {
        self.mem.get(addr as usize).cloned().ok_or(MemoryError::Unmapped { address: addr })
    }
}

/// Describes a region of the physical address space.
#[derive(Debug, Clone)]
pub struct Mapping<'a> {
    range: RangeInclusive<u32>,
    name: &'a str,
}

impl<'a> Mapping<'a> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn range(&self) -> RangeInclusive<u32> {
        self.range.clone()
    }
}

impl<'a> fmt::Display for Mapping<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (start, end) = (self.range.start(), self.range.end());
        write!(f, "{:06X}-{:06X} {}", start, end, self.name)
    }
}

#[derive(Debug)]
struct Window {
    range: RangeInclusive<u32>,
    name: String,
    device: NoDebug<Box<dyn MemoryDevice>>,
}

/// Where a multi-byte access lands.
enum Span {
    Ram,
    Window(usize),
    Mixed,
}

/// The machine's physical memory.
#[derive(Debug)]
pub struct Memory {
    ram: MmapMut,
    a20_mask: u32,
    windows: Vec<Window>,
    /// Per page: 0 for RAM, otherwise the index of the claiming window plus 1.
    pages: Vec<u8>,
    /// One bit per byte of RAM or device window that is part of a decoded
    /// instruction.
    code: Vec<u64>,
    dirty_code: Vec<u32>,
    breakpoints: Arc<Breakpoints>,
}

impl Memory {
    /// Creates `size` bytes of zeroed RAM with the A20 gate disabled.
    pub fn new(size: usize, breakpoints: Arc<Breakpoints>) -> Result<Self, MemoryError> {
        if size < MIN_MEMORY_SIZE {
            return Err(MemoryError::TooSmall {
                requested: size,
                minimum: MIN_MEMORY_SIZE,
            });
        }

        let ram = MmapMut::map_anon(size).map_err(MemoryError::Alloc)?;
        let limit = size.max(ADDRESS_SPACE_SIZE as usize);
        let pages = (limit + PAGE_SIZE as usize - 1) >> PAGE_SHIFT;
        info!("{} KiB of RAM", size / 1024);

        Ok(Self {
            ram,
            a20_mask: A20_DISABLED_MASK,
            windows: Vec::new(),
            pages: vec![0; pages],
            code: vec![0; (limit + 63) / 64],
            dirty_code: Vec::new(),
            breakpoints,
        })
    }

    /// Size of RAM in bytes.
    pub fn size(&self) -> usize {
        self.ram.len()
    }

    pub fn breakpoints(&self) -> &Arc<Breakpoints> {
        &self.breakpoints
    }

    pub fn set_a20(&mut self, enabled: bool) {
        debug!("A20 gate {}", if enabled { "enabled" } else { "disabled" });
        self.a20_mask = if enabled { A20_ENABLED_MASK } else { A20_DISABLED_MASK };
    }

    pub fn a20_enabled(&self) -> bool {
        self.a20_mask == A20_ENABLED_MASK
    }

    /// Translates a `segment:offset` address through the A20 gate.
    pub fn physical(&self, addr: SegmentedAddress) -> u32 {
        addr.linear() & self.a20_mask
    }

    /// Claims `range` of the physical address space for `device`.
    ///
    /// The range must start and end on page boundaries and may not overlap
    /// any other device window. It may overlap RAM, which then becomes
    /// inaccessible.
    pub fn map_device(
        &mut self,
        range: RangeInclusive<u32>,
        name: &str,
        device: Box<dyn MemoryDevice>,
    ) -> Result<(), MapError> {
        let (start, end) = (*range.start(), *range.end());
        if start > end || end as usize >= self.pages.len() << PAGE_SHIFT {
            return Err(MapError::OutOfRange);
        }
        if start % PAGE_SIZE != 0 || end.wrapping_add(1) % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if let Some(existing) = self.windows.iter().find(|w| {
            *w.range.start() <= end && start <= *w.range.end()
        }) {
            return Err(MapError::Overlap { existing: existing.name.clone() });
        }
        if self.windows.len() >= usize::from(u8::max_value()) {
            return Err(MapError::TooManyWindows);
        }

        self.windows.push(Window {
            range: range.clone(),
            name: name.to_string(),
            device: NoDebug(device),
        });
        let tag = self.windows.len() as u8;
        for page in (start >> PAGE_SHIFT)..=(end >> PAGE_SHIFT) {
            self.pages[page as usize] = tag;
        }

        info!("mapped device window {:06X}-{:06X} {}", start, end, name);
        Ok(())
    }

    /// Iterates over RAM and all device windows.
    pub fn mappings(&self) -> impl Iterator<Item=Mapping<'_>> + '_ {
        let ram = Mapping {
            range: 0..=self.ram.len() as u32 - 1,
            name: "<ram>",
        };

        Some(ram).into_iter().chain(self.windows.iter().map(|w| Mapping {
            range: w.range.clone(),
            name: &w.name,
        }))
    }

    /// Determines the mapping the given address is a part of.
    pub fn mapping_containing_addr(&self, addr: u32) -> Option<Mapping> {
        match self.window_index(addr) {
            Some(i) => {
                let w = &self.windows[i];
                Some(Mapping { range: w.range.clone(), name: &w.name })
            }
            None => self.mappings().next().filter(|ram| ram.range.contains(&addr)),
        }
    }

    fn window_index(&self, addr: u32) -> Option<usize> {
        match self.pages.get((addr >> PAGE_SHIFT) as usize) {
            Some(&tag) if tag != 0 => Some(usize::from(tag) - 1),
            _ => None,
        }
    }

    fn span(&self, addr: u32, len: u32) -> Span {
        let last = addr.wrapping_add(len - 1);
        match (self.window_index(addr), self.window_index(last)) {
            (None, None) if last >= addr && (last as usize) < self.ram.len() => Span::Ram,
            (Some(a), Some(b)) if a == b && last >= addr => Span::Window(a),
            _ => Span::Mixed,
        }
    }

    /// Marks a byte as written, logging it if it held code.
    fn touch(&mut self, addr: u32) {
        let (word, bit) = ((addr / 64) as usize, addr % 64);
        if let Some(w) = self.code.get_mut(word) {
            if *w & (1u64 << bit) != 0 {
                *w &= !(1u64 << bit);
                self.dirty_code.push(addr);
            }
        }
    }

    fn load_raw(&mut self, addr: u32) -> u8 {
        if let Some(i) = self.window_index(addr) {
            return self.windows[i].device.read_u8(addr);
        }

        match self.ram.get(addr as usize) {
            Some(b) => *b,
            None => {
                warn!("read from unmapped address {:#07X}", addr);
                0xFF
            }
        }
    }

    fn store_raw(&mut self, addr: u32, value: u8) {
        if let Some(i) = self.window_index(addr) {
            self.touch(addr);
            self.windows[i].device.write_u8(addr, value);
        } else if (addr as usize) < self.ram.len() {
            self.touch(addr);
            self.ram[addr as usize] = value;
        } else {
            warn!("write of {:#04X} to unmapped address {:#07X} ignored", value, addr);
        }
    }

    fn load_u16_raw(&mut self, addr: u32) -> u16 {
        match self.span(addr, 2) {
            Span::Ram => {
                let i = addr as usize;
                u16::from_le_bytes([self.ram[i], self.ram[i + 1]])
            }
            Span::Window(w) => self.windows[w].device.read_u16(addr),
            Span::Mixed => {
                let lo = u16::from(self.load_raw(addr));
                let hi = u16::from(self.load_raw(addr.wrapping_add(1)));
                hi << 8 | lo
            }
        }
    }

    fn store_u16_raw(&mut self, addr: u32, value: u16) {
        match self.span(addr, 2) {
            Span::Ram => {
                self.touch(addr);
                self.touch(addr + 1);
                let i = addr as usize;
                self.ram[i..i + 2].copy_from_slice(&value.to_le_bytes());
            }
            Span::Window(w) => {
                self.touch(addr);
                self.touch(addr + 1);
                self.windows[w].device.write_u16(addr, value);
            }
            Span::Mixed => {
                self.store_raw(addr, value as u8);
                self.store_raw(addr.wrapping_add(1), (value >> 8) as u8);
            }
        }
    }

    fn load_u32_raw(&mut self, addr: u32) -> u32 {
        match self.span(addr, 4) {
            Span::Window(w) => self.windows[w].device.read_u32(addr),
            _ => {
                let lo = u32::from(self.load_u16_raw(addr));
                let hi = u32::from(self.load_u16_raw(addr.wrapping_add(2)));
                hi << 16 | lo
            }
        }
    }

    fn store_u32_raw(&mut self, addr: u32, value: u32) {
        match self.span(addr, 4) {
            Span::Window(w) => {
                for a in addr..addr + 4 {
                    self.touch(a);
                }
                self.windows[w].device.write_u32(addr, value);
            }
            _ => {
                self.store_u16_raw(addr, value as u16);
                self.store_u16_raw(addr.wrapping_add(2), (value >> 16) as u16);
            }
        }
    }

    fn notify_read(&self, addr: u32, len: u32) {
        if len != 0 {
            self.breakpoints.trigger(BreakpointKind::Read, addr..=addr.wrapping_add(len - 1), None);
        }
    }

    fn notify_write(&self, addr: u32, len: u32, value: Option<u32>) {
        if len != 0 {
            self.breakpoints.trigger(BreakpointKind::Write, addr..=addr.wrapping_add(len - 1), value);
        }
    }

    pub fn read_u8(&mut self, addr: u32) -> u8 {
        self.notify_read(addr, 1);
        self.load_raw(addr)
    }

    pub fn read_u16(&mut self, addr: u32) -> u16 {
        self.notify_read(addr, 2);
        self.load_u16_raw(addr)
    }

    pub fn read_u32(&mut self, addr: u32) -> u32 {
        self.notify_read(addr, 4);
        self.load_u32_raw(addr)
    }

    pub fn write_u8(&mut self, addr: u32, value: u8) {
        self.notify_write(addr, 1, Some(value.into()));
        self.store_raw(addr, value);
    }

    pub fn write_u16(&mut self, addr: u32, value: u16) {
        self.notify_write(addr, 2, Some(value.into()));
        self.store_u16_raw(addr, value);
    }

    pub fn write_u32(&mut self, addr: u32, value: u32) {
        self.notify_write(addr, 4, Some(value));
        self.store_u32_raw(addr, value);
    }

    pub fn read_u8_at(&mut self, addr: SegmentedAddress) -> u8 {
        let phys = self.physical(addr);
        self.read_u8(phys)
    }

    /// Reads a word; at offset `FFFF` the high byte comes from offset 0 of
    /// the same segment.
    pub fn read_u16_at(&mut self, addr: SegmentedAddress) -> u16 {
        if addr.offset == 0xFFFF {
            let lo = u16::from(self.read_u8_at(addr));
            let hi = u16::from(self.read_u8_at(addr.wrapping_add(1)));
            hi << 8 | lo
        } else {
            let phys = self.physical(addr);
            self.read_u16(phys)
        }
    }

    pub fn read_u32_at(&mut self, addr: SegmentedAddress) -> u32 {
        let lo = u32::from(self.read_u16_at(addr));
        let hi = u32::from(self.read_u16_at(addr.wrapping_add(2)));
        hi << 16 | lo
    }

    pub fn write_u8_at(&mut self, addr: SegmentedAddress, value: u8) {
        let phys = self.physical(addr);
        self.write_u8(phys, value);
    }

    pub fn write_u16_at(&mut self, addr: SegmentedAddress, value: u16) {
        if addr.offset == 0xFFFF {
            self.write_u8_at(addr, value as u8);
            self.write_u8_at(addr.wrapping_add(1), (value >> 8) as u8);
        } else {
            let phys = self.physical(addr);
            self.write_u16(phys, value);
        }
    }

    pub fn write_u32_at(&mut self, addr: SegmentedAddress, value: u32) {
        self.write_u16_at(addr, value as u16);
        self.write_u16_at(addr.wrapping_add(2), (value >> 16) as u16);
    }

    /// Copies `data` into memory starting at `addr`.
    pub fn load_block(&mut self, addr: u32, data: &[u8]) {
        self.notify_write(addr, data.len() as u32, None);
        for (i, byte) in data.iter().enumerate() {
            self.store_raw(addr.wrapping_add(i as u32), *byte);
        }
    }

    /// Reads `len` bytes starting at `addr`.
    pub fn read_block(&mut self, addr: u32, len: u32) -> Vec<u8> {
        self.notify_read(addr, len);
        (0..len).map(|i| self.load_raw(addr.wrapping_add(i))).collect()
    }

    /// Copies `len` bytes from `src` to `dst`, as if through a temporary
    /// buffer (overlapping ranges are fine).
    pub fn copy_block(&mut self, src: u32, dst: u32, len: u32) {
        self.notify_read(src, len);
        self.notify_write(dst, len, None);
        let data: Vec<u8> = (0..len).map(|i| self.load_raw(src.wrapping_add(i))).collect();
        for (i, byte) in data.into_iter().enumerate() {
            self.store_raw(dst.wrapping_add(i as u32), byte);
        }
    }

    /// Sets `len` bytes starting at `addr` to `value`.
    pub fn fill_block(&mut self, addr: u32, value: u8, len: u32) {
        self.notify_write(addr, len, Some(value.into()));
        for i in 0..len {
            self.store_raw(addr.wrapping_add(i), value);
        }
    }

    /// Finds the first occurrence of `pattern` in `[start, start + len)`.
    ///
    /// Returns the physical address of the match.
    pub fn search(&mut self, start: u32, len: u32, pattern: &[u8]) -> Option<u32> {
        if pattern.is_empty() || (pattern.len() as u32) > len {
            return None;
        }

        self.notify_read(start, len);
        let haystack: Vec<u8> = (0..len).map(|i| self.load_raw(start.wrapping_add(i))).collect();
        haystack.windows(pattern.len())
            .position(|w| w == pattern)
            .map(|pos| start.wrapping_add(pos as u32))
    }

    /// Marks `[addr, addr + len)` as holding a decoded instruction.
    ///
    /// Writes to marked bytes are logged, whether they land in RAM or in a
    /// device window.
    pub fn watch_code(&mut self, addr: u32, len: u32) {
        for a in addr..addr.saturating_add(len) {
            let (word, bit) = ((a / 64) as usize, a % 64);
            if let Some(w) = self.code.get_mut(word) {
                *w |= 1u64 << bit;
            }
        }
    }

    /// Returns whether the byte at `addr` is part of a decoded instruction.
    pub fn is_code(&self, addr: u32) -> bool {
        let (word, bit) = ((addr / 64) as usize, addr % 64);
        self.code.get(word).map_or(false, |&w| w & (1u64 << bit) != 0)
    }

    pub fn has_dirty_code(&self) -> bool {
        !self.dirty_code.is_empty()
    }

    /// Takes the log of overwritten code bytes, oldest first.
    pub fn drain_dirty_code(&mut self) -> std::vec::Drain<'_, u32> {
        self.dirty_code.drain(..)
    }
}

impl AddressSpace for Memory {
    fn load(&mut self, addr: u32) -> Result<u8, MemoryError> {
        Ok(self.load_raw(addr))
    }

    fn load_u16(&mut self, addr: u32) -> Result<u16, MemoryError> {
        Ok(self.load_u16_raw(addr))
    }
}

/// An error that can occur when creating or accessing memory.
#[derive(Debug)]
pub enum MemoryError {
    /// Requested RAM size is below `MIN_MEMORY_SIZE`.
    TooSmall {
        requested: usize,
        minimum: usize,
    },
    /// The host refused to allocate guest RAM.
    Alloc(io::Error),
    /// No free conventional memory is left for a bootstrap allocation.
    OutOfConventionalMemory {
        requested: u32,
    },
    /// Accessed address is not backed by anything.
    Unmapped {
        address: u32,
    },
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemoryError::TooSmall { requested, minimum } => {
                write!(f, "memory size {:#X} is below the minimum of {:#X} bytes", requested, minimum)
            }
            MemoryError::Alloc(e) => write!(f, "could not allocate guest memory: {}", e),
            MemoryError::OutOfConventionalMemory { requested } => {
                write!(f, "out of conventional memory (requested {} bytes)", requested)
            }
            MemoryError::Unmapped { address } => write!(f, "address {:#07X} is not mapped", address),
        }
    }
}

impl Error for MemoryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MemoryError::Alloc(e) => Some(e),
            _ => None,
        }
    }
}

/// Error returned by `map_device`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    /// The window would overlap with an existing one.
    Overlap {
        existing: String,
    },
    /// The window does not start and end on a page boundary.
    Unaligned,
    /// The window is empty or extends past the physical address space.
    OutOfRange,
    /// No more windows can be mapped.
    TooManyWindows,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MapError::Overlap { existing } => write!(f, "window overlaps existing mapping '{}'", existing),
            MapError::Unaligned => write!(f, "window is not page-aligned"),
            MapError::OutOfRange => write!(f, "window lies outside of the physical address space"),
            MapError::TooManyWindows => write!(f, "too many device windows"),
        }
    }
}

impl Error for MapError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::{Breakpoint, BreakpointTarget, BreakpointHit};
    use std::sync::Mutex;

    fn memory() -> Memory {
        Memory::new(MIN_MEMORY_SIZE, Arc::new(Breakpoints::new())).unwrap()
    }

    fn record(mem: &Memory, kind: BreakpointKind, target: BreakpointTarget) -> Arc<Mutex<Vec<BreakpointHit>>> {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let h = hits.clone();
        mem.breakpoints().insert(
            Breakpoint::new(kind, target).with_callback(move |hit| h.lock().unwrap().push(hit.clone()))
        ).unwrap();
        hits
    }

    #[test]
    fn too_small() {
        match Memory::new(0x10_0000, Arc::new(Breakpoints::new())) {
            Err(MemoryError::TooSmall { requested: 0x10_0000, minimum: MIN_MEMORY_SIZE }) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn round_trip() {
        let mut mem = memory();
        for &addr in &[0u32, 0x7C00, 0x1_2345, 0x10_FFFE] {
            mem.write_u16(addr, 0xBEEF);
            assert_eq!(mem.read_u16(addr), 0xBEEF);
            assert_eq!(mem.read_u8(addr), 0xEF);
        }
        mem.write_u32(0x500, 0x1234_5678);
        assert_eq!(mem.read_u32(0x500), 0x1234_5678);
        assert_eq!(mem.read_u16(0x502), 0x1234);
    }

    #[test]
    fn unmapped_reads_float_high() {
        let mut mem = memory();
        let end = mem.size() as u32;
        mem.write_u8(end, 0x12);
        assert_eq!(mem.read_u8(end), 0xFF);
        assert_eq!(mem.read_u16(end - 1), 0xFF00);
    }

    #[test]
    fn segmented_access_and_a20() {
        let mut mem = memory();
        let hma = SegmentedAddress::new(0xFFFF, 0x0010);
        mem.write_u8_at(hma, 0xAA);
        assert_eq!(mem.read_u8(0), 0xAA, "A20 disabled wraps to 0");

        mem.set_a20(true);
        assert!(mem.a20_enabled());
        mem.write_u8_at(hma, 0x55);
        assert_eq!(mem.read_u8(0x10_0000), 0x55);
        assert_eq!(mem.read_u8(0), 0xAA);
    }

    #[test]
    fn word_at_segment_end_wraps_inside_segment() {
        let mut mem = memory();
        let addr = SegmentedAddress::new(0x2000, 0xFFFF);
        mem.write_u16_at(addr, 0x1234);
        assert_eq!(mem.read_u8(0x2_FFFF), 0x34);
        assert_eq!(mem.read_u8(0x2_0000), 0x12);
        assert_eq!(mem.read_u16_at(addr), 0x1234);
    }

    #[test]
    fn device_window_takes_precedence() {
        let mut mem = memory();
        mem.write_u16(0xB_8000, 0x1111);
        mem.map_device(0xB_8000..=0xB_8FFF, "vram", Box::new(RamDevice::new(0xB_8000, 0x1000))).unwrap();

        assert_eq!(mem.read_u16(0xB_8000), 0x0000, "device starts zeroed");
        mem.write_u16(0xB_8000, 0x0741);
        assert_eq!(mem.read_u16(0xB_8000), 0x0741);
        assert_eq!(mem.read_u8(0xB_8001), 0x07);
        assert_eq!(mem.ram[0xB_8000], 0x11, "plain RAM untouched");

        let names: Vec<String> = mem.mappings().map(|m| m.to_string()).collect();
        assert_eq!(names, vec!["000000-10FFFF <ram>", "0B8000-0B8FFF vram"]);
        assert_eq!(mem.mapping_containing_addr(0xB_8123).unwrap().name(), "vram");
        assert_eq!(mem.mapping_containing_addr(0x100).unwrap().name(), "<ram>");
    }

    #[test]
    fn map_errors() {
        let mut mem = memory();
        let dev = || Box::new(RamDevice::new(0xA_0000, 0x2_0000));
        mem.map_device(0xA_0000..=0xB_FFFF, "vga", dev()).unwrap();
        assert_eq!(
            mem.map_device(0xB_0000..=0xB_FFFF, "mda", dev()),
            Err(MapError::Overlap { existing: "vga".to_string() })
        );
        assert_eq!(mem.map_device(0xC_0001..=0xC_0FFF, "x", dev()), Err(MapError::Unaligned));
        assert_eq!(mem.map_device(0xC_0000..=0xC_0FFE, "x", dev()), Err(MapError::Unaligned));
        assert_eq!(mem.map_device(0x1F_F000..=0x20_0FFF, "x", dev()), Err(MapError::OutOfRange));
    }

    #[test]
    fn access_notifications() {
        let mut mem = memory();
        let reads = record(&mem, BreakpointKind::Read, BreakpointTarget::Address(0x601));
        let writes = record(&mem, BreakpointKind::Write, BreakpointTarget::Address(0x601));

        mem.write_u16(0x600, 0xCAFE);
        assert_eq!(writes.lock().unwrap()[0].value, Some(0xCAFE));
        assert_eq!(mem.read_u16(0x600), 0xCAFE);
        assert_eq!(reads.lock().unwrap().len(), 1);

        // fetches are not data reads
        mem.load(0x601).unwrap();
        mem.read_u8(0x602);
        assert_eq!(reads.lock().unwrap().len(), 1);
    }

    #[test]
    fn bulk_ops_notify_once() {
        let mut mem = memory();
        let writes = record(&mem, BreakpointKind::Write, BreakpointTarget::Range(0x1000..=0x1FFF));
        let reads = record(&mem, BreakpointKind::Read, BreakpointTarget::Range(0x1000..=0x1FFF));

        mem.load_block(0x1000, &[1, 2, 3, 4, 5, 6, 7, 8]);
        mem.fill_block(0x1100, 0x90, 0x40);
        mem.copy_block(0x1000, 0x1200, 8);
        assert_eq!(writes.lock().unwrap().len(), 3);
        assert_eq!(reads.lock().unwrap().len(), 1);

        assert_eq!(mem.read_block(0x1200, 8), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(mem.search(0x1000, 0x300, &[0x90, 0x90]), Some(0x1100));
        assert_eq!(mem.search(0x1000, 0x300, &[4, 5, 6]), Some(0x1003));
        assert_eq!(mem.search(0x1000, 0x300, &[9, 9]), None);
        assert_eq!(reads.lock().unwrap().len(), 5);
        assert_eq!(writes.lock().unwrap().len(), 3);
    }

    #[test]
    fn overlapping_copy() {
        let mut mem = memory();
        mem.load_block(0x3000, &[1, 2, 3, 4]);
        mem.copy_block(0x3000, 0x3001, 4);
        assert_eq!(mem.read_block(0x3000, 5), vec![1, 1, 2, 3, 4]);
    }

    #[test]
    fn writes_to_code_are_logged() {
        let mut mem = memory();
        mem.load_block(0x1_0000, &[0x83, 0xF9, 0x03]);
        assert!(!mem.has_dirty_code(), "loading before decode is not self-modification");

        mem.watch_code(0x1_0000, 3);
        assert!(mem.is_code(0x1_0002));
        mem.write_u8(0x1_0003, 0x90);
        assert!(!mem.has_dirty_code());

        mem.write_u16(0x1_0001, 0x9090);
        assert_eq!(mem.drain_dirty_code().collect::<Vec<_>>(), vec![0x1_0001, 0x1_0002]);
        assert!(!mem.is_code(0x1_0001));
        assert!(mem.is_code(0x1_0000));

        mem.write_u8(0x1_0001, 0x90);
        assert!(!mem.has_dirty_code(), "only the first write to a byte is logged");
    }

    #[test]
    fn writes_to_window_code_are_logged() {
        let mut mem = memory();
        mem.map_device(0xD_0000..=0xD_FFFF, "ems", Box::new(RamDevice::new(0xD_0000, 0x1_0000))).unwrap();
        mem.watch_code(0xD_0002, 2);

        mem.write_u32(0xD_0000, 0x9090_9090);
        assert_eq!(mem.drain_dirty_code().collect::<Vec<_>>(), vec![0xD_0002, 0xD_0003]);
        assert_eq!(mem.read_u32(0xD_0000), 0x9090_9090);
    }
}
