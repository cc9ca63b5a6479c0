//! Bootstrapping low memory and loading guest images.

use crate::cpu::{Flags, State};
use crate::machine::Machine;
use crate::memory::{physical, ConventionalAllocator, MemoryError, SegmentedAddress};

use std::error::Error;
use std::fmt;

/// Segment of the BIOS ROM area holding the default interrupt handlers.
pub const BIOS_SEGMENT: u16 = 0xF000;
/// Segment of the BIOS data area.
pub const BDA_SEGMENT: u16 = 0x0040;

const IVT_SIZE: u32 = 256 * 4;
const BDA_SIZE: u32 = 0x100;
/// Offset of the conventional memory size (in KiB) in the BIOS data area.
const BDA_MEMORY_SIZE: u16 = 0x13;
const CONVENTIONAL_KIB: u16 = 640;

const IRET: u8 = 0xCF;
const HLT: u8 = 0xF4;
/// Offsets of the stubs in the BIOS segment.
const IRET_STUB: u16 = 0x0000;
const HLT_STUB: u16 = 0x0001;
/// Vectors that end the program: `int 20h` and the DOS services.
const EXIT_VECTORS: [u8; 2] = [0x20, 0x21];

/// Sets up the interrupt vector table, BIOS data area and default handlers.
///
/// Every vector points to an `iret` stub except for `int 20h` and `int 21h`,
/// which point to a `hlt` stub so that a program ending through DOS stops
/// the machine. Returns the allocator for further reservations.
pub fn bootstrap(machine: &mut Machine) -> Result<ConventionalAllocator, LoaderError> {
    let mut alloc = ConventionalAllocator::new();
    let ivt = alloc.allocate(0, IVT_SIZE)?;
    let bda = alloc.allocate(BDA_SEGMENT, BDA_SIZE)?;
    let bios = alloc.allocate(BIOS_SEGMENT, 2)?;

    let mem = machine.memory_mut();
    mem.load_block(physical(bios, 0), &[IRET, HLT]);
    for vector in 0..=255u8 {
        let stub = if EXIT_VECTORS.contains(&vector) { HLT_STUB } else { IRET_STUB };
        let entry = physical(ivt, 0) + u32::from(vector) * 4;
        mem.write_u16(entry, stub);
        mem.write_u16(entry + 2, bios);
    }
    mem.write_u16(physical(bda, BDA_MEMORY_SIZE), CONVENTIONAL_KIB);

    info!("IVT at {:04X}:0000, BDA at {:04X}:0000, handlers at {:04X}:0000", ivt, bda, bios);
    Ok(alloc)
}

/// Layout of a guest image.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ImageFormat {
    /// Flat binary loaded at `segment:0000` and entered there.
    Raw,
    /// DOS COM program loaded at `segment:0100` behind a minimal PSP.
    Com,
}

impl ImageFormat {
    fn entry_offset(self) -> u16 {
        match self {
            ImageFormat::Raw => 0x0000,
            ImageFormat::Com => 0x0100,
        }
    }

    /// Largest image that fits the segment, leaving room for the stack.
    fn max_size(self) -> usize {
        0xFF00 - usize::from(self.entry_offset())
    }
}

/// Copies `image` into memory and points the CPU at it.
///
/// `CS`, `DS`, `ES` and `SS` are set to `segment`, `SP` to `FFFE` and
/// interrupts are enabled. COM images get a PSP whose first bytes are
/// `int 20h`, and a zero word on the stack, so that a final `ret` ends the
/// program.
pub fn load_image(
    machine: &mut Machine,
    image: &[u8],
    format: ImageFormat,
    segment: u16,
) -> Result<(), LoaderError> {
    if image.len() > format.max_size() {
        return Err(LoaderError::ImageTooLarge {
            size: image.len(),
            max: format.max_size(),
        });
    }

    let entry = SegmentedAddress::new(segment, format.entry_offset());
    let stack = SegmentedAddress::new(segment, 0xFFFE);
    let mem = machine.memory_mut();
    if format == ImageFormat::Com {
        mem.fill_block(physical(segment, 0), 0, 0x100);
        mem.load_block(physical(segment, 0), &[0xCD, 0x20]);
        mem.write_u16(physical(segment, stack.offset), 0);
    }
    mem.load_block(physical(segment, entry.offset), image);
    info!("loaded {:?} image of {} bytes at {}", format, image.len(), entry);

    let mut state = State::new(entry, stack);
    state.update_flags(Flags::IF, true);
    *machine.state_mut() = state;
    Ok(())
}

#[derive(Debug)]
pub enum LoaderError {
    Memory(MemoryError),
    ImageTooLarge {
        size: usize,
        max: usize,
    },
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoaderError::Memory(e) => e.fmt(f),
            LoaderError::ImageTooLarge { size, max } => {
                write!(f, "image of {} bytes exceeds the maximum of {} bytes", size, max)
            }
        }
    }
}

impl Error for LoaderError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LoaderError::Memory(e) => Some(e),
            LoaderError::ImageTooLarge { .. } => None,
        }
    }
}

impl From<MemoryError> for LoaderError {
    fn from(e: MemoryError) -> Self {
        LoaderError::Memory(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu_loop::{EmulationLoop, StopReason};
    use crate::machine::MachineConfig;

    fn machine() -> Machine {
        let mut machine = Machine::new(MachineConfig::default()).unwrap();
        bootstrap(&mut machine).unwrap();
        machine
    }

    #[test]
    fn vector_table() {
        let mut m = machine();
        let mem = m.memory_mut();
        assert_eq!(mem.read_u16(0x08 * 4), IRET_STUB);
        assert_eq!(mem.read_u16(0x08 * 4 + 2), BIOS_SEGMENT);
        assert_eq!(mem.read_u16(0x21 * 4), HLT_STUB);
        assert_eq!(mem.read_u8(0xF0000), IRET);
        assert_eq!(mem.read_u8(0xF0001), HLT);
        assert_eq!(mem.read_u16(0x413), 640);
    }

    #[test]
    fn com_image_layout() {
        let mut m = machine();
        load_image(&mut m, &[0x90, 0xC3], ImageFormat::Com, 0x1000).unwrap();
        assert_eq!(m.state().cs_ip(), SegmentedAddress::new(0x1000, 0x100));
        assert_eq!(m.state().ss_sp(), SegmentedAddress::new(0x1000, 0xFFFE));
        assert_eq!((m.state().ds(), m.state().es()), (0x1000, 0x1000));
        assert!(m.state().flag(Flags::IF));
        let mem = m.memory_mut();
        assert_eq!(mem.read_u16(0x10000), 0x20CD);
        assert_eq!(mem.read_u8(0x10100), 0x90);
        assert_eq!(mem.read_u16(0x1FFFE), 0);
    }

    #[test]
    fn com_return_ends_program() {
        let mut m = machine();
        // mov ax,0x4C00; ret
        load_image(&mut m, &[0xB8, 0x00, 0x4C, 0xC3], ImageFormat::Com, 0x1000).unwrap();
        let report = EmulationLoop::run(&mut m).unwrap();
        assert_eq!(report.reason, StopReason::Halted);
        // mov, ret, int 20h, hlt
        assert_eq!(report.instructions, 4);
        assert_eq!(m.state().cs(), BIOS_SEGMENT);
    }

    #[test]
    fn raw_image_and_size_limit() {
        let mut m = machine();
        load_image(&mut m, &[0xF4], ImageFormat::Raw, 0x2000).unwrap();
        assert_eq!(m.state().cs_ip(), SegmentedAddress::new(0x2000, 0));

        let big = vec![0x90; 0xFF00];
        match load_image(&mut m, &big, ImageFormat::Com, 0x2000) {
            Err(LoaderError::ImageTooLarge { size: 0xFF00, max: 0xFE00 }) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }
}
