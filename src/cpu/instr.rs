//! Decoded 8086 instruction representation.

pub use crate::cpu::imm::Immediate;

use std::fmt;

/// A decoded real-mode x86 instruction.
///
/// Note that these decoded instructions do not carry *all* information from the
/// raw machine code stream: For example, shorthand encodings are
/// indistinguishable from their longer forms, and duplicate prefix bytes are
/// dropped. Apart from that, one `Instr` still corresponds to one x86
/// instruction.
///
/// Relative branch targets are stored as the signed displacement from the end
/// of the instruction, since the same bytes can be reached through different
/// `CS:IP` pairs.
///
/// Unless otherwise noted, an `Operand` called `dest` may not be an immediate.
///
/// `Instr` also implements `Display`, which prints a basic disassembly of the
/// instruction. Since no context is available, all jumps and calls will be
/// displayed using the relative offset instead of the target address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    /// Perform a binary arithmetic or logic function on `dest` and `src` and
    /// store the result in `dest`.
    ///
    /// Reads and modifies flags according to `op`.
    Alu {
        op: AluOp,
        dest: Operand,
        src: Operand,
    },

    /// Shift-group operation.
    Shift {
        op: ShiftOp,
        /// Shifted value and destination.
        dest: Operand,
        /// 8-bit shift amount (immediate or `CL`).
        src: Operand,
    },

    /// Store `src` in `dest`. Either may be a segment register.
    ///
    /// Does not read or modify any flags.
    Mov {
        dest: Operand,
        src: Operand,
    },

    /// Exchange the contents of two operands.
    Xchg {
        a: Operand,
        b: Operand,
    },

    /// Load Effective Address.
    ///
    /// Calculate the offset specified by `src` and store it in `dest`.
    ///
    /// Does not read or modify any flags.
    Lea {
        dest: Register,
        src: MemoryLocation,
    },

    /// `lds`/`les`: load a far pointer from memory into `segment:dest`.
    LoadFarPointer {
        segment: Segment,
        dest: Register,
        src: MemoryLocation,
    },

    /// Calculate the bitwise AND of `lhs` and `rhs` and set the flags
    /// accordingly, but do not modify `lhs` or `rhs`.
    Test {
        lhs: Operand,
        rhs: Operand,
    },

    /// Invert every bit in `operand`.
    ///
    /// Does not read or modify any flags.
    Not {
        operand: Operand,
    },

    /// Replace `operand` with its two's complement.
    Neg {
        operand: Operand,
    },

    /// Unsigned multiplication of `AL`/`AX` with `operand` into `AX`/`DX:AX`.
    Mul {
        operand: Operand,
    },

    /// `imul` with a single operand.
    Imul {
        operand: Operand,
    },

    /// Truncating 3-operand `imul` (80186).
    ///
    /// `dest = src1 * src2`.
    ImulTrunc {
        dest: Register,
        src1: Operand,
        src2: Operand,
    },

    /// Unsigned division of `AX`/`DX:AX` by `operand`.
    Div {
        operand: Operand,
    },

    Idiv {
        operand: Operand,
    },

    Inc {
        operand: Operand,
    },

    Dec {
        operand: Operand,
    },

    /// Push a 16-bit value onto the stack.
    ///
    /// If `operand` is `SP` itself, the value *after* `SP` is decremented is
    /// pushed (8086 behaviour).
    Push {
        operand: Operand,
    },

    /// Pop a 16-bit value from the stack into a register, segment register
    /// or memory location.
    Pop {
        operand: Operand,
    },

    Pushf,
    Popf,
    Lahf,
    Sahf,

    /// Branch by `rel` if the condition `cc` holds.
    JumpIf {
        cc: ConditionCode,
        rel: i16,
    },

    /// Unconditional near jump relative to the next instruction.
    JumpRel {
        rel: i16,
    },

    /// Indirect near jump through a register or memory operand.
    Jump {
        target: Operand,
    },

    /// Direct far jump.
    JumpFar {
        segment: u16,
        offset: u16,
    },

    /// Far jump through a far pointer in memory.
    JumpFarIndirect {
        target: MemoryLocation,
    },

    /// Near call relative to the next instruction.
    CallRel {
        rel: i16,
    },

    /// Indirect near call.
    Call {
        target: Operand,
    },

    CallFar {
        segment: u16,
        offset: u16,
    },

    CallFarIndirect {
        target: MemoryLocation,
    },

    /// Near return to caller, removing `pop` bytes of arguments afterwards.
    Ret {
        pop: u16,
    },

    /// Far return to caller, removing `pop` bytes of arguments afterwards.
    RetFar {
        pop: u16,
    },

    /// Return from interrupt.
    Iret,

    /// `loop`, `loopz`, `loopnz` or `jcxz`.
    Loop {
        kind: LoopKind,
        rel: i16,
    },

    /// String memory operation.
    StrMem {
        /// The operation to perform.
        op: StrMemOp,
        /// Repeat prefix, if present.
        ///
        /// This will perform the operation as many times as specified in `CX`,
        /// decrementing its value each time.
        rep: Option<RepPrefix>,
        /// The amount of data to move (per iteration). Also specifies the part
        /// of the `a` register to use.
        size: OpSize,
        /// Segment of the source operand (`DS` unless overridden). The
        /// destination is always `ES:DI`.
        segment: Segment,
    },

    /// Read from an I/O port into `AL`/`AX`.
    In {
        size: OpSize,
        port: Port,
    },

    /// Write `AL`/`AX` to an I/O port.
    Out {
        size: OpSize,
        port: Port,
    },

    /// Raise interrupt.
    Int {
        vector: u8,
    },

    /// Raise interrupt 4 if overflow flag is set.
    IntO,

    /// Sign-extend `AL` into `AX`.
    Cbw,

    /// Write the most significant bit of `AX` into all of `DX`.
    Cwd,

    /// `AL = [segment:BX + AL]`.
    Xlat {
        segment: Segment,
    },

    /// Decimal adjust of `AL`/`AX` after BCD arithmetic.
    Bcd {
        op: BcdOp,
    },

    /// Set, clear or complement a single flag.
    Flag {
        op: FlagOp,
    },

    /// Stop executing until an interrupt arrives.
    Hlt,

    Nop,
}

impl Instr {
    /// Whether executing this instruction always enters a subroutine.
    pub fn is_call(&self) -> bool {
        match self {
            Instr::CallRel { .. }
            | Instr::Call { .. }
            | Instr::CallFar { .. }
            | Instr::CallFarIndirect { .. }
            | Instr::Int { .. } => true,
            _ => false,
        }
    }

    /// Whether executing this instruction always leaves a subroutine.
    pub fn is_return(&self) -> bool {
        match self {
            Instr::Ret { .. } | Instr::RetFar { .. } | Instr::Iret => true,
            _ => false,
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use crate::cpu::disasm::print_instr;

        let mut s = String::new();
        print_instr(self, &mut s);
        f.write_str(&s)
    }
}

/// A decoded operand, usually from a Mod-Reg-R/M byte and the following bytes.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Operand {
    /// The operand is the value inside a register, or the register itself.
    Reg(Register),

    /// A segment register.
    Seg(Segment),

    /// Immediate value.
    Imm(Immediate),

    /// The operand is stored in memory.
    Mem(MemoryLocation),
}

impl Operand {
    pub fn size(&self) -> OpSize {
        match self {
            Operand::Reg(reg) => reg.size(),
            Operand::Seg(_) => OpSize::Bits16,
            Operand::Imm(imm) => imm.size(),
            Operand::Mem(mem) => mem.size,
        }
    }
}

impl From<Register> for Operand {
    fn from(reg: Register) -> Self {
        Operand::Reg(reg)
    }
}

impl From<Segment> for Operand {
    fn from(seg: Segment) -> Self {
        Operand::Seg(seg)
    }
}

impl From<Immediate> for Operand {
    fn from(imm: Immediate) -> Self {
        Operand::Imm(imm)
    }
}

impl From<MemoryLocation> for Operand {
    fn from(mem: MemoryLocation) -> Self {
        Operand::Mem(mem)
    }
}

/// A location in segmented memory.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MemoryLocation {
    /// The operand's size. Since we only store an address, we wouldn't know
    /// this if we didn't store it.
    pub size: OpSize,
    /// The segment the offset is relative to: the instruction's default
    /// segment, or the one named by a segment override prefix.
    pub segment: Segment,
    /// The addressing mode used to calculate the offset.
    pub addressing: Addressing,
}

/// A segment register.
///
/// The discriminant matches the encoding in the `Reg` field of segment moves
/// and in the segment-override prefix bytes.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash, FromPrimitive)]
pub enum Segment {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
}

impl Segment {
    pub fn name(&self) -> &'static str {
        match self {
            Segment::Es => "es",
            Segment::Cs => "cs",
            Segment::Ss => "ss",
            Segment::Ds => "ds",
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 16-bit effective address: `base + index + disp`.
///
/// At most one of `BX`/`BP` is the base and at most one of `SI`/`DI` the
/// index. Without base and index, `disp` is the absolute offset.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Addressing {
    pub base: Option<Register>,
    pub index: Option<Register>,
    pub disp: i16,
}

impl Addressing {
    pub fn absolute(offset: u16) -> Self {
        Addressing {
            base: None,
            index: None,
            disp: offset as i16,
        }
    }

    /// The segment used when no override prefix is present: `SS` for
    /// `BP`-based addressing, `DS` otherwise.
    pub fn default_segment(&self) -> Segment {
        if self.base == Some(Register::Bp) {
            Segment::Ss
        } else {
            Segment::Ds
        }
    }
}

/// Operand or operation size.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OpSize {
    Bits8,
    Bits16,
}

impl OpSize {
    pub fn bytes(&self) -> u32 {
        match self {
            OpSize::Bits8 => 1,
            OpSize::Bits16 => 2,
        }
    }

    pub fn bits(&self) -> u32 {
        self.bytes() * 8
    }

    /// All-ones value of this size.
    pub fn mask(&self) -> u32 {
        match self {
            OpSize::Bits8 => 0xFF,
            OpSize::Bits16 => 0xFFFF,
        }
    }

    /// The most significant bit of a value of this size.
    pub fn sign_bit(&self) -> u32 {
        match self {
            OpSize::Bits8 => 0x80,
            OpSize::Bits16 => 0x8000,
        }
    }
}

/// The 8- and 16-bit general purpose registers.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum Register {
    Al,
    Cl,
    Dl,
    Bl,
    Ah,
    Ch,
    Dh,
    Bh,
    Ax,
    Cx,
    Dx,
    Bx,
    Sp,
    Bp,
    /// 16-bit Source Index.
    Si,
    /// 16-bit Destination Index.
    Di,
}

impl Register {
    /// Converts a 3-bit register encoding to the register, given the size.
    pub fn from_index(index: u8, size: OpSize) -> Self {
        use self::Register::*;

        const BYTE: [Register; 8] = [Al, Cl, Dl, Bl, Ah, Ch, Dh, Bh];
        const WORD: [Register; 8] = [Ax, Cx, Dx, Bx, Sp, Bp, Si, Di];
        match size {
            OpSize::Bits8 => BYTE[usize::from(index & 0b111)],
            OpSize::Bits16 => WORD[usize::from(index & 0b111)],
        }
    }

    /// The accumulator of the given size (`AL` or `AX`).
    pub fn accumulator(size: OpSize) -> Self {
        Self::from_index(0, size)
    }

    pub fn name(&self) -> &'static str {
        use self::Register::*;
        match self {
            Al => "al",
            Cl => "cl",
            Dl => "dl",
            Bl => "bl",
            Ah => "ah",
            Ch => "ch",
            Dh => "dh",
            Bh => "bh",
            Ax => "ax",
            Cx => "cx",
            Dx => "dx",
            Bx => "bx",
            Sp => "sp",
            Bp => "bp",
            Si => "si",
            Di => "di",
        }
    }

    pub fn size(&self) -> OpSize {
        use self::Register::*;
        match self {
            Al | Ah | Bl | Bh | Cl | Ch | Dl | Dh => OpSize::Bits8,
            Ax | Bx | Cx | Dx | Si | Di | Bp | Sp => OpSize::Bits16,
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Specifies the operation to perform for ALU instructions.
///
/// All of these share a common encoding (but might have a shorter aliased
/// encoding in some cases):
///
/// ```notrust
/// +-----------------+
/// | 0 0 A A A 0 D S |
/// +-----------------+
/// ```
///
/// Where:
///
/// * `A`: Value of `AluOp` (3-bit ALU operation).
/// * `D`: Direction bit (0 = Reg field is the source, 1 = R/M field is the
///   source).
/// * `S`: Size bit (0 = 8-bit operands, 1 = 16-bit operands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum AluOp {
    Add = 0,
    Or = 1,
    /// Add with carry.
    Adc = 2,
    /// Subtract with borrow.
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    /// Set `FLAGS` like `sub` would, but do not change `dest`.
    Cmp = 7,
}

/// Shift instruction group opcode.
///
/// Stored in the `Reg` field of the Mod-Reg-R/M byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
pub enum ShiftOp {
    Rol = 0,
    Ror = 1,
    Rcl = 2,
    Rcr = 3,
    Shl = 4,
    Shr = 5,
    /// Undocumented alias of `Shl`.
    Sal = 6,
    Sar = 7,
}

/// A condition for conditional branches.
///
/// The discriminant is set according to the x86 instruction encoding. Condition
/// codes are encoded in 4 bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ConditionCode {
    /// CF=0 and ZF=0
    Above = 0x7,
    /// CF=0
    ///
    /// Aka "above or equal".
    NotCarry = 0x3,
    /// CF=1
    ///
    /// Aka "below".
    Carry = 0x2,
    /// CF=1 or ZF=1
    BelowOrEqual = 0x6,
    /// ZF=1
    Equal = 0x4,
    /// ZF=0 and SF=OF
    Greater = 0xF,
    /// SF=OF
    GreaterOrEqual = 0xD,
    /// SF!=OF
    Less = 0xC,
    /// ZF=1 or SF!=OF
    LessOrEqual = 0xE,
    /// ZF=0
    ///
    /// Aka "not zero".
    NotEqual = 0x5,
    /// OF=0
    NotOverflow = 0x1,
    /// PF=0
    ///
    /// Aka "parity odd".
    NotParity = 0xB,
    /// SF=0
    NotSign = 0x9,
    /// OF=1
    Overflow = 0x0,
    /// PF=1
    ///
    /// Aka "parity even".
    Parity = 0xA,
    /// SF=1
    Sign = 0x8,
}

/// Variants of the `CX`-driven short branches (`0xE0`-`0xE3`).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoopKind {
    /// Decrement `CX`, branch if `CX != 0 && ZF == 0`.
    Loopnz,
    /// Decrement `CX`, branch if `CX != 0 && ZF == 1`.
    Loopz,
    /// Decrement `CX`, branch if `CX != 0`.
    Loop,
    /// Branch if `CX == 0`, without decrementing.
    Jcxz,
}

/// "String" operation (more like batch memory operation).
///
/// Source operands live at `DS:SI` (the segment can be overridden), the
/// destination at `ES:DI`. After each element, `SI` and/or `DI` advance by
/// the element size, or move backwards if `DF` is set.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StrMemOp {
    /// Move string within memory.
    Movs,
    /// Compare `[src]` with `[ES:DI]`.
    Cmps,
    /// Store `AL`/`AX` to `ES:DI`.
    Stos,
    /// Load `[src]` into `AL`/`AX`.
    Lods,
    /// Compare `AL`/`AX` with `[ES:DI]`.
    Scas,
}

impl StrMemOp {
    /// Whether the operation sets flags, which makes `rep` mean `repe`.
    pub fn compares(&self) -> bool {
        match self {
            StrMemOp::Cmps | StrMemOp::Scas => true,
            _ => false,
        }
    }
}

/// `0xF3` / `0xF2` repeat prefixes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RepPrefix {
    /// `rep`/`repe`: repeat while `CX != 0` (and `ZF == 1` for comparisons).
    Rep,
    /// `repne`: repeat while `CX != 0` and `ZF == 0`.
    Repne,
}

/// Port operand of `in`/`out`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Port {
    Imm(u8),
    Dx,
}

/// BCD adjust instructions.
///
/// `aam` and `aad` carry their number base, which is 10 unless the
/// instruction was hand-encoded with another one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BcdOp {
    Daa,
    Das,
    Aaa,
    Aas,
    Aam(u8),
    Aad(u8),
}

/// Single-flag instructions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlagOp {
    Clc,
    Stc,
    Cmc,
    Cli,
    Sti,
    Cld,
    Std,
}
