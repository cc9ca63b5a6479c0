//! 8086/80186 real-mode instruction decoder.

use crate::cpu::instr::*;
use crate::cpu::prefix::RawPrefixes;
use crate::memory::{AddressSpace, MemoryError};

use num_traits::FromPrimitive;

use std::error::Error;
use std::fmt;

/// Maximum length of a single instruction, including prefixes.
pub const MAX_INSTR_LEN: u32 = 15;

/// x86 machine instruction decoder.
#[derive(Debug)]
pub struct Decoder<'a, M: AddressSpace + 'a> {
    /// Physical address of the first byte of the current instruction.
    start: u32,
    /// Physical address of the next byte that will be loaded from memory.
    pos: u32,
    /// Length of the currently decoded instruction.
    len: u32,
    prefixes: RawPrefixes,
    mem: &'a mut M,
}

impl<'a, M: AddressSpace> Decoder<'a, M> {
    /// Creates a new instruction decoder.
    ///
    /// # Parameters
    ///
    /// * `mem`: The address space to read machine code from.
    /// * `addr`: The physical address at which to start decoding.
    pub fn new(mem: &'a mut M, addr: u32) -> Self {
        Self {
            start: addr,
            pos: addr,
            len: 0,
            prefixes: RawPrefixes::empty(),
            mem,
        }
    }

    /// Returns the physical address of the first byte of the next instruction
    /// we're going to decode.
    ///
    /// This is incremented as `decode_next` is called.
    pub fn current_address(&self) -> u32 {
        self.pos
    }

    /// Length in bytes of the instruction last returned by `decode_next`.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Read and decode the next instruction in the stream.
    ///
    /// If this returns an error, the decoder's address most likely points into
    /// the middle of the instruction and the decoder should not be used for
    /// further instruction decoding.
    pub fn decode_next(&mut self) -> Result<Instr, DecoderError> {
        self.start = self.pos;
        self.len = 0;
        self.prefixes = RawPrefixes::empty();

        let mut byte = self.read()?;

        // Collect prefix bytes
        loop {
            match self.prefixes.decode(byte) {
                Ok(new) => self.prefixes = new,
                Err(_) => break,
            }
            byte = self.read()?;
        }

        // Many instrs look like this: X X X X X X D S
        // Pull out D and S bits for convenience
        let default_dir_bit = (byte & 0b10) >> 1 != 0; // false = Reg to R/M, true = R/M to Reg
        let default_size = if byte & 0b01 != 0 { OpSize::Bits16 } else { OpSize::Bits8 };

        let instr = match byte {
            0x0F => return Err(self.ud("pop cs / extended opcode page")),
            0x27 => Instr::Bcd { op: BcdOp::Daa },
            0x2F => Instr::Bcd { op: BcdOp::Das },
            0x37 => Instr::Bcd { op: BcdOp::Aaa },
            0x3F => Instr::Bcd { op: BcdOp::Aas },
            _ if bitpat!(0 0 0 _ _ 1 1 _)(byte) => {
                // 0x06/0x07/0x0E/0x16/0x17/0x1E/0x1F: push/pop segment register
                let seg = Segment::from_u8((byte >> 3) & 0b11).ok_or_else(|| self.ud("segment"))?;
                if byte & 1 == 0 {
                    Instr::Push { operand: seg.into() }
                } else {
                    Instr::Pop { operand: seg.into() }
                }
            }
            _ if bitpat!(0 0 _ _ _ 0 _ _)(byte) => {
                // "Normal" ALU opcode with Mod-Reg-R/M byte
                let op = self.alu_op(byte >> 3)?;
                let modrm = self.read_modrm()?;
                let reg = modrm.reg(default_size).into();
                let rm = self.read_addressing(modrm, default_size)?;
                let (src, dest) = if default_dir_bit {
                    (rm, reg)
                } else {
                    (reg, rm)
                };

                Instr::Alu { op, dest, src }
            }
            _ if bitpat!(0 0 _ _ _ 1 0 _)(byte) => {
                // ALU op with immediate and al/ax
                let op = self.alu_op(byte >> 3)?;
                let dest = Register::accumulator(default_size).into();
                let src = self.read_immediate(default_size)?.into();

                Instr::Alu { op, dest, src }
            }
            _ if bitpat!(0 1 0 0 _ _ _ _)(byte) => {  // 0x4_
                let operand = Register::from_index(byte, OpSize::Bits16).into();
                if byte & 0b1000 == 0 {
                    Instr::Inc { operand }
                } else {
                    Instr::Dec { operand }
                }
            }
            _ if bitpat!(0 1 0 1 _ _ _ _)(byte) => {  // 0x5_
                let operand = Register::from_index(byte, OpSize::Bits16).into();
                if byte & 0b1000 == 0 {
                    Instr::Push { operand }
                } else {
                    Instr::Pop { operand }
                }
            }
            0x68 => Instr::Push { operand: self.read_immediate(OpSize::Bits16)?.into() },
            0x6A => Instr::Push { operand: Immediate::from(self.read()?).sign_ext_to(OpSize::Bits16).into() },
            0x69 | 0x6B => {
                let modrm = self.read_modrm()?;
                let dest = modrm.reg(OpSize::Bits16);
                let src1 = self.read_addressing(modrm, OpSize::Bits16)?;
                let src2 = if byte == 0x6B {
                    Immediate::from(self.read()?).sign_ext_to(OpSize::Bits16)
                } else {
                    self.read_immediate(OpSize::Bits16)?
                }.into();

                Instr::ImulTrunc { dest, src1, src2 }
            }
            _ if bitpat!(0 1 1 0 _ _ _ _)(byte) => {
                return Err(self.ud(format!("opcode {:#04X} needs a 186/386 mode we don't emulate", byte)));
            }
            _ if bitpat!(0 1 1 1 _ _ _ _)(byte) => {  // 0x7_
                // conditional short jumps
                let cc = ConditionCode::from_u8(byte & 0x0F)
                    .ok_or_else(|| self.ud("condition code"))?;
                let rel = self.read_rel8()?;

                Instr::JumpIf { cc, rel }
            }
            _ if bitpat!(1 0 0 0 0 0 _ _)(byte) => {
                // ALU opcode with immediate

                // 0x83 sign-extends an 8-bit immediate, 0x82 is an alias of 0x80
                let modrm = self.read_modrm()?;
                let op = self.alu_op(modrm.reg_raw())?;
                let dest = self.read_addressing(modrm, default_size)?;
                let src = if byte == 0x83 {
                    Immediate::from(self.read()?).sign_ext_to(OpSize::Bits16)
                } else {
                    self.read_immediate(default_size)?
                }.into();

                Instr::Alu { op, dest, src }
            }
            0x84 | 0x85 => {
                let modrm = self.read_modrm()?;
                let rhs = modrm.reg(default_size).into();
                let lhs = self.read_addressing(modrm, default_size)?;
                Instr::Test { lhs, rhs }
            }
            0x86 | 0x87 => {
                let modrm = self.read_modrm()?;
                let b = modrm.reg(default_size).into();
                let a = self.read_addressing(modrm, default_size)?;
                Instr::Xchg { a, b }
            }
            _ if bitpat!(1 0 0 0 1 0 _ _)(byte) => {
                // mov reg/mem <-> GP reg (basically, load/store)
                let modrm = self.read_modrm()?;
                let reg = modrm.reg(default_size).into();
                let rm = self.read_addressing(modrm, default_size)?;
                let (src, dest) = if default_dir_bit {
                    (rm, reg)
                } else {
                    (reg, rm)
                };

                Instr::Mov { dest, src }
            }
            0x8C | 0x8E => {
                let modrm = self.read_modrm()?;
                let seg = Segment::from_u8(modrm.reg_raw() & 0b11).ok_or_else(|| self.ud("segment"))?;
                let rm = self.read_addressing(modrm, OpSize::Bits16)?;
                if byte == 0x8C {
                    Instr::Mov { dest: rm, src: seg.into() }
                } else if seg == Segment::Cs {
                    return Err(self.ud("mov to cs"));
                } else {
                    Instr::Mov { dest: seg.into(), src: rm }
                }
            }
            0x8D => {
                let modrm = self.read_modrm()?;
                let dest = modrm.reg(OpSize::Bits16);
                match self.read_addressing(modrm, OpSize::Bits16)? {
                    Operand::Mem(src) => Instr::Lea { dest, src },
                    _ => return Err(self.ud("lea with register operand")),
                }
            }
            0x8F => {
                let modrm = self.read_modrm()?;
                if modrm.reg_raw() != 0 {
                    return Err(self.ud("invalid reg field for 0x8F"));
                }
                Instr::Pop { operand: self.read_addressing(modrm, OpSize::Bits16)? }
            }
            0x90 => Instr::Nop,
            _ if bitpat!(1 0 0 1 0 _ _ _)(byte) => {
                Instr::Xchg {
                    a: Register::Ax.into(),
                    b: Register::from_index(byte, OpSize::Bits16).into(),
                }
            }
            0x98 => Instr::Cbw,
            0x99 => Instr::Cwd,
            0x9A => {
                let offset = self.read_u16()?;
                let segment = self.read_u16()?;
                Instr::CallFar { segment, offset }
            }
            0x9B => Instr::Nop,   // wait: there is no FPU to wait for
            0x9C => Instr::Pushf,
            0x9D => Instr::Popf,
            0x9E => Instr::Sahf,
            0x9F => Instr::Lahf,
            _ if bitpat!(1 0 1 0 0 0 _ _)(byte) => {
                // mov between al/ax and abs. memory offset
                let rm = MemoryLocation {
                    size: default_size,
                    segment: self.prefixes.segment(Segment::Ds),
                    addressing: Addressing::absolute(self.read_u16()?),
                }.into();
                let reg = Register::accumulator(default_size).into();
                let (src, dest) = if default_dir_bit {
                    // inverted!
                    (reg, rm)
                } else {
                    (rm, reg)
                };

                Instr::Mov { dest, src }
            }
            0xA8 | 0xA9 => {
                let lhs = Register::accumulator(default_size).into();
                let rhs = self.read_immediate(default_size)?.into();
                Instr::Test { lhs, rhs }
            }
            _ if bitpat!(1 0 1 0 _ _ _ _)(byte) => {  // 0xA4-0xAF
                let op = match byte & !1 {
                    0xA4 => StrMemOp::Movs,
                    0xA6 => StrMemOp::Cmps,
                    0xAA => StrMemOp::Stos,
                    0xAC => StrMemOp::Lods,
                    0xAE => StrMemOp::Scas,
                    _ => return Err(self.ud("string op")),
                };

                Instr::StrMem {
                    op,
                    rep: self.prefixes.rep(),
                    size: default_size,
                    segment: self.prefixes.segment(Segment::Ds),
                }
            }
            _ if bitpat!(1 0 1 1 _ _ _ _)(byte) => {  // 0xB_
                // 0xB_ = load immediate to register
                let size = if byte & 0b0000_1000 != 0 { OpSize::Bits16 } else { OpSize::Bits8 };
                let dest = Register::from_index(byte, size).into();
                let src = self.read_immediate(size)?.into();

                Instr::Mov { dest, src }
            }
            0xC0 | 0xC1 => {
                let modrm = self.read_modrm()?;
                let op = self.shift_op(modrm)?;
                let dest = self.read_addressing(modrm, default_size)?;
                let src = Immediate::from(self.read()?).into();
                Instr::Shift { op, dest, src }
            }
            0xC2 => Instr::Ret { pop: self.read_u16()? },
            0xC3 => Instr::Ret { pop: 0 },
            0xC4 | 0xC5 => {
                let segment = if byte == 0xC4 { Segment::Es } else { Segment::Ds };
                let modrm = self.read_modrm()?;
                let dest = modrm.reg(OpSize::Bits16);
                match self.read_addressing(modrm, OpSize::Bits16)? {
                    Operand::Mem(src) => Instr::LoadFarPointer { segment, dest, src },
                    _ => return Err(self.ud("far pointer load from register")),
                }
            }
            0xC6 | 0xC7 => {
                let modrm = self.read_modrm()?;
                if modrm.reg_raw() != 0 {
                    return Err(self.ud("invalid reg field for mov r/m,imm"));
                }
                let dest = self.read_addressing(modrm, default_size)?;
                let src = self.read_immediate(default_size)?.into();
                Instr::Mov { dest, src }
            }
            0xCA => Instr::RetFar { pop: self.read_u16()? },
            0xCB => Instr::RetFar { pop: 0 },
            0xCC => Instr::Int { vector: 3 },
            0xCD => Instr::Int { vector: self.read()? },
            0xCE => Instr::IntO,
            0xCF => Instr::Iret,
            0xD0..=0xD3 => {
                let modrm = self.read_modrm()?;
                let op = self.shift_op(modrm)?;
                let dest = self.read_addressing(modrm, default_size)?;
                let src = if byte & 0b10 == 0 {
                    Immediate::from(1u8).into()
                } else {
                    Register::Cl.into()
                };
                Instr::Shift { op, dest, src }
            }
            0xD4 => Instr::Bcd { op: BcdOp::Aam(self.read()?) },
            0xD5 => Instr::Bcd { op: BcdOp::Aad(self.read()?) },
            0xD7 => Instr::Xlat { segment: self.prefixes.segment(Segment::Ds) },
            0xD8..=0xDF => return Err(self.ud("x87 escape without coprocessor")),
            0xE0..=0xE3 => {
                let kind = match byte {
                    0xE0 => LoopKind::Loopnz,
                    0xE1 => LoopKind::Loopz,
                    0xE2 => LoopKind::Loop,
                    _ => LoopKind::Jcxz,
                };
                Instr::Loop { kind, rel: self.read_rel8()? }
            }
            0xE4 | 0xE5 => Instr::In { size: default_size, port: Port::Imm(self.read()?) },
            0xE6 | 0xE7 => Instr::Out { size: default_size, port: Port::Imm(self.read()?) },
            0xE8 => Instr::CallRel { rel: self.read_u16()? as i16 },
            0xE9 => Instr::JumpRel { rel: self.read_u16()? as i16 },
            0xEA => {
                let offset = self.read_u16()?;
                let segment = self.read_u16()?;
                Instr::JumpFar { segment, offset }
            }
            0xEB => Instr::JumpRel { rel: self.read_rel8()? },
            0xEC | 0xED => Instr::In { size: default_size, port: Port::Dx },
            0xEE | 0xEF => Instr::Out { size: default_size, port: Port::Dx },
            0xF4 => Instr::Hlt,
            0xF5 => Instr::Flag { op: FlagOp::Cmc },
            0xF6 | 0xF7 => {
                let modrm = self.read_modrm()?;
                let operand = self.read_addressing(modrm, default_size)?;
                match modrm.reg_raw() {
                    0b000 => {
                        let rhs = self.read_immediate(default_size)?.into();
                        Instr::Test { lhs: operand, rhs }
                    }
                    0b010 => Instr::Not { operand },
                    0b011 => Instr::Neg { operand },
                    0b100 => Instr::Mul { operand },
                    0b101 => Instr::Imul { operand },
                    0b110 => Instr::Div { operand },
                    0b111 => Instr::Idiv { operand },
                    _ => return Err(self.ud("invalid reg field for group 3")),
                }
            }
            0xF8 => Instr::Flag { op: FlagOp::Clc },
            0xF9 => Instr::Flag { op: FlagOp::Stc },
            0xFA => Instr::Flag { op: FlagOp::Cli },
            0xFB => Instr::Flag { op: FlagOp::Sti },
            0xFC => Instr::Flag { op: FlagOp::Cld },
            0xFD => Instr::Flag { op: FlagOp::Std },
            0xFE => {
                let modrm = self.read_modrm()?;
                let operand = self.read_addressing(modrm, OpSize::Bits8)?;
                match modrm.reg_raw() {
                    0b000 => Instr::Inc { operand },
                    0b001 => Instr::Dec { operand },
                    _ => return Err(self.ud("invalid reg field for 0xFE")),
                }
            }
            0xFF => {
                let modrm = self.read_modrm()?;
                let operand = self.read_addressing(modrm, OpSize::Bits16)?;
                match (modrm.reg_raw(), operand) {
                    (0b000, operand) => Instr::Inc { operand },
                    (0b001, operand) => Instr::Dec { operand },
                    (0b010, target) => Instr::Call { target },
                    (0b011, Operand::Mem(target)) => Instr::CallFarIndirect { target },
                    (0b100, target) => Instr::Jump { target },
                    (0b101, Operand::Mem(target)) => Instr::JumpFarIndirect { target },
                    (0b110, operand) => Instr::Push { operand },
                    _ => return Err(self.ud("invalid operand for 0xFF")),
                }
            }
            _ => return Err(self.ud(format!("unknown opcode {:#04X}", byte))),
        };

        if !self.prefixes.is_empty() {
            trace!("ignoring prefixes {:?} on {}", self.prefixes, instr);
        }

        Ok(instr)
    }

    #[cold]
    fn ud<S: AsRef<str>>(&self, why: S) -> DecoderError {
        DecoderError::InvalidOpcode {
            address: self.start,
            reason: why.as_ref().to_string(),
        }
    }

    fn alu_op(&self, raw: u8) -> Result<AluOp, DecoderError> {
        AluOp::from_u8(raw & 0b111).ok_or_else(|| self.ud("ALU op"))
    }

    fn shift_op(&self, modrm: ModRegRm) -> Result<ShiftOp, DecoderError> {
        ShiftOp::from_u8(modrm.reg_raw()).ok_or_else(|| self.ud("shift op"))
    }

    /// Reads a byte, enforcing the instruction length limit.
    fn read(&mut self) -> Result<u8, DecoderError> {
        if self.len >= MAX_INSTR_LEN {
            return Err(DecoderError::TooLong { address: self.start });
        }

        let byte = self.mem.load(self.pos)?;
        self.pos = self.pos.wrapping_add(1);
        self.len += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, DecoderError> {
        let lo = self.read()?;
        let hi = self.read()?;
        Ok(u16::from(hi) << 8 | u16::from(lo))
    }

    fn read_rel8(&mut self) -> Result<i16, DecoderError> {
        Ok(i16::from(self.read()? as i8))
    }

    fn read_modrm(&mut self) -> Result<ModRegRm, DecoderError> {
        Ok(ModRegRm(self.read()?))
    }

    fn read_immediate(&mut self, size: OpSize) -> Result<Immediate, DecoderError> {
        Ok(match size {
            OpSize::Bits8 => self.read()?.into(),
            OpSize::Bits16 => self.read_u16()?.into(),
        })
    }

    /// Reads the displacement following a Mod-Reg-R/M byte and builds the
    /// operand it refers to.
    fn read_addressing(&mut self, modrm: ModRegRm, size: OpSize) -> Result<Operand, DecoderError> {
        use crate::cpu::instr::Register::*;

        let mode = modrm.addressing_mode();
        if mode == AddressingMode::Register {
            return Ok(modrm.rm_as_reg(size).into());
        }

        if mode == AddressingMode::RegIndirect && modrm.rm_raw() == 0b110 {
            // No `[bp]` without displacement, this encodes an absolute offset
            let addressing = Addressing::absolute(self.read_u16()?);
            return Ok(MemoryLocation {
                size,
                segment: self.prefixes.segment(Segment::Ds),
                addressing,
            }.into());
        }

        let (base, index) = match modrm.rm_raw() {
            0b000 => (Some(Bx), Some(Si)),
            0b001 => (Some(Bx), Some(Di)),
            0b010 => (Some(Bp), Some(Si)),
            0b011 => (Some(Bp), Some(Di)),
            0b100 => (None, Some(Si)),
            0b101 => (None, Some(Di)),
            0b110 => (Some(Bp), None),
            _ => (Some(Bx), None),
        };
        let disp = match mode {
            AddressingMode::OneByteDisplacement => i16::from(self.read()? as i8),
            AddressingMode::TwoByteDisplacement => self.read_u16()? as i16,
            _ => 0,
        };
        let addressing = Addressing { base, index, disp };

        Ok(MemoryLocation {
            size,
            segment: self.prefixes.segment(addressing.default_segment()),
            addressing,
        }.into())
    }
}

/// A Mod-Reg-R/M byte (also called Mod-R/M).
///
/// This is used by many opcodes to define their source and destination operands
/// and, if present, follows right after the opcode bytes.
#[derive(Debug, Copy, Clone)]
struct ModRegRm(u8);

impl ModRegRm {
    /// Get the addressing mode, specified by the `Mod` field.
    ///
    /// This influences the interpretation of the `R/M` field.
    fn addressing_mode(&self) -> AddressingMode {
        match self.0 >> 6 {
            0b00 => AddressingMode::RegIndirect,
            0b01 => AddressingMode::OneByteDisplacement,
            0b10 => AddressingMode::TwoByteDisplacement,
            _ => AddressingMode::Register,
        }
    }

    /// Get the register specified in the `Reg` field, given the operand size.
    fn reg(&self, size: OpSize) -> Register {
        Register::from_index(self.reg_raw(), size)
    }

    /// Gets the raw value of the `Reg` field.
    ///
    /// This is used to encode ALU opcodes that take an immediate, for example.
    fn reg_raw(&self) -> u8 {
        (self.0 & 0b00111000) >> 3
    }

    /// Interprets the R/M field as a register (like Reg) for when using the
    /// register addressing mode.
    fn rm_as_reg(&self, size: OpSize) -> Register {
        Register::from_index(self.rm_raw(), size)
    }

    fn rm_raw(&self) -> u8 {
        self.0 & 0b111
    }
}

/// The possible values of the Mod-Reg-R/M bytes Mod field (16-bit
/// interpretation).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum AddressingMode {
    /// `00` - Operand is in memory at `base + index`.
    ///
    /// If `R/M == 0b110`, a 16-bit absolute offset follows instead.
    RegIndirect,

    /// `01` - Same as `RegIndirect`, followed by a sign-extended 8-bit
    /// displacement.
    OneByteDisplacement,

    /// `10` - Same as `RegIndirect`, followed by a 16-bit displacement.
    TwoByteDisplacement,

    /// `11` - Register-register op, no memory access. R/M is interpreted just
    /// like Reg.
    Register,
}

/// Error type returned by the decoder.
#[derive(Debug)]
pub enum DecoderError {
    /// Memory error while reading machine code bytes.
    Memory(MemoryError),
    /// The bytes at `address` do not encode a supported instruction.
    InvalidOpcode {
        address: u32,
        reason: String,
    },
    /// The instruction at `address` is longer than `MAX_INSTR_LEN` bytes.
    TooLong {
        address: u32,
    },
}

impl fmt::Display for DecoderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecoderError::Memory(e) => write!(f, "failed to fetch instruction: {}", e),
            DecoderError::InvalidOpcode { address, reason } => {
                write!(f, "invalid opcode at {:#07X}: {}", address, reason)
            }
            DecoderError::TooLong { address } => {
                write!(f, "instruction at {:#07X} exceeds {} bytes", address, MAX_INSTR_LEN)
            }
        }
    }
}

impl Error for DecoderError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DecoderError::Memory(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MemoryError> for DecoderError {
    #[cold]
    fn from(e: MemoryError) -> Self {
        DecoderError::Memory(e)
    }
}
