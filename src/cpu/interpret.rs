//! Real-mode x86 interpreter.
//!
//! The interpreter executes already decoded instructions. Fetching and
//! decoding is the node cache's business, so `execute` receives the
//! instruction together with its encoded length and starts by advancing `IP`
//! past it. Afterwards it reports how control left the instruction, which is
//! what the linker needs to pick the right outgoing edge.

use crate::breakpoint::BreakpointKind;
use crate::cpu::instr::*;
use crate::cpu::{Flags, State};
use crate::io::{IoError, IoPortDispatcher};
use crate::memory::{Memory, SegmentedAddress};

use std::error::Error;
use std::fmt;

/// Raised by `div`/`idiv` when dividing by zero or when the quotient does not
/// fit.
pub const DIVIDE_ERROR_VECTOR: u8 = 0x00;
/// Raised by `into` if the overflow flag is set.
pub const OVERFLOW_VECTOR: u8 = 0x04;

/// How control left an executed instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Continues with the instruction following it in memory.
    Sequential,
    /// A conditional branch (including `loop`/`jcxz`) that was either taken
    /// or not.
    Branch {
        taken: bool,
    },
    /// Unconditional transfer to a target encoded in the instruction.
    Direct,
    /// Transfer to a target computed at runtime: indirect jumps and calls,
    /// returns and interrupts.
    Indirect,
    /// The CPU halted.
    Halt,
}

/// The CPU core: register state, memory and port space.
#[derive(Debug)]
pub struct Interpreter {
    state: State,
    mem: Memory,
    io: IoPortDispatcher,
}

impl Interpreter {
    /// Creates a new interpreter.
    ///
    /// # Parameters
    ///
    /// * `state`: Initial CPU state. `CS:IP` points to the first instruction
    ///   that will be executed.
    /// * `mem`: The physical memory to operate on.
    /// * `io`: Handlers for `in` and `out`.
    pub fn new(state: State, mem: Memory, io: IoPortDispatcher) -> Self {
        Self {
            state,
            mem,
            io,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    pub fn mem(&self) -> &Memory {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut Memory {
        &mut self.mem
    }

    pub fn io_mut(&mut self) -> &mut IoPortDispatcher {
        &mut self.io
    }

    /// Physical address of the instruction at `CS:IP`.
    pub fn next_address(&self) -> u32 {
        self.mem.physical(self.state.cs_ip())
    }

    /// Execute a decoded instruction of `len` bytes located at `CS:IP` and
    /// perform its side effects.
    pub fn execute(&mut self, instr: &Instr, len: u32) -> Result<Flow, InterpreterError> {
        use crate::cpu::instr::Instr::*;

        let next_ip = self.state.ip().wrapping_add(len as u16);
        self.state.set_ip(next_ip);

        let flow = match instr {
            Alu { op, dest, src } => {
                let size = dest.size();
                let (lhs, rhs) = (self.read_operand(dest), self.read_operand(src) & size.mask());
                let res = self.alu(*op, lhs, rhs, size);
                if *op != AluOp::Cmp {
                    self.write_operand(dest, res)?;
                }
                Flow::Sequential
            }
            Shift { op, dest, src } => {
                // 80186 and later mask the count to 5 bits
                let amount = self.read_operand(src) & 0x1F;
                if amount != 0 {
                    let value = self.read_operand(dest);
                    let res = self.shift(*op, value, amount, dest.size());
                    self.write_operand(dest, res)?;
                }
                Flow::Sequential
            }
            Mov { dest, src } => {
                let value = self.read_operand(src);
                self.write_operand(dest, value)?;
                Flow::Sequential
            }
            Xchg { a, b } => {
                let (va, vb) = (self.read_operand(a), self.read_operand(b));
                self.write_operand(a, vb)?;
                self.write_operand(b, va)?;
                Flow::Sequential
            }
            Lea { dest, src } => {
                let offset = self.effective_offset(src);
                self.state.set_register(*dest, offset);
                Flow::Sequential
            }
            LoadFarPointer { segment, dest, src } => {
                let addr = self.location(src);
                let offset = self.mem.read_u16_at(addr);
                let seg = self.mem.read_u16_at(addr.wrapping_add(2));
                self.state.set_register(*dest, offset);
                self.state.set_segment(*segment, seg);
                Flow::Sequential
            }
            Test { lhs, rhs } => {
                let res = self.read_operand(lhs) & self.read_operand(rhs);
                self.logic(res, lhs.size());
                Flow::Sequential
            }
            Not { operand } => {
                let value = self.read_operand(operand);
                self.write_operand(operand, !value & operand.size().mask())?;
                Flow::Sequential
            }
            Neg { operand } => {
                let value = self.read_operand(operand);
                let res = self.sub(0, value, 0, operand.size());
                self.write_operand(operand, res)?;
                Flow::Sequential
            }
            Inc { operand } | Dec { operand } => {
                // like add/sub 1, but CF is preserved
                let cf = self.state.flag(Flags::CF);
                let value = self.read_operand(operand);
                let res = match instr {
                    Inc { .. } => self.add(value, 1, 0, operand.size()),
                    _ => self.sub(value, 1, 0, operand.size()),
                };
                self.state.update_flags(Flags::CF, cf);
                self.write_operand(operand, res)?;
                Flow::Sequential
            }
            Mul { operand } => {
                let src = self.read_operand(operand);
                let overflow = match operand.size() {
                    OpSize::Bits8 => {
                        let res = u32::from(self.state.al()) * src;
                        self.state.set_ax(res as u16);
                        res > 0xFF
                    }
                    OpSize::Bits16 => {
                        let res = u32::from(self.state.ax()) * src;
                        self.state.set_ax(res as u16);
                        self.state.set_dx((res >> 16) as u16);
                        res > 0xFFFF
                    }
                };
                self.state.update_flags(Flags::CF | Flags::OF, overflow);
                Flow::Sequential
            }
            Imul { operand } => {
                let src = self.read_operand(operand);
                let overflow = match operand.size() {
                    OpSize::Bits8 => {
                        let res = i32::from(self.state.al() as i8) * i32::from(src as u8 as i8);
                        self.state.set_ax(res as u16);
                        res != i32::from(res as i8)
                    }
                    OpSize::Bits16 => {
                        let res = i32::from(self.state.ax() as i16) * i32::from(src as u16 as i16);
                        self.state.set_ax(res as u16);
                        self.state.set_dx((res >> 16) as u16);
                        res != i32::from(res as i16)
                    }
                };
                self.state.update_flags(Flags::CF | Flags::OF, overflow);
                Flow::Sequential
            }
            ImulTrunc { dest, src1, src2 } => {
                let a = i32::from(self.read_operand(src1) as u16 as i16);
                let b = i32::from(self.read_operand(src2) as u16 as i16);
                let res = a * b;
                self.state.set_register(*dest, res as u16);
                self.state.update_flags(Flags::CF | Flags::OF, res != i32::from(res as i16));
                Flow::Sequential
            }
            Div { operand } | Idiv { operand } => {
                let signed = match instr {
                    Idiv { .. } => true,
                    _ => false,
                };
                if self.divide(operand, signed) {
                    Flow::Sequential
                } else {
                    // IP already points past the instruction, as on the 8086
                    trace!("divide error at {}", self.state.cs_ip());
                    self.interrupt(DIVIDE_ERROR_VECTOR);
                    Flow::Indirect
                }
            }
            Push { operand } => {
                let value = match operand {
                    // 8086: the decremented value is pushed
                    Operand::Reg(Register::Sp) => self.state.sp().wrapping_sub(2),
                    _ => self.read_operand(operand) as u16,
                };
                self.push(value);
                Flow::Sequential
            }
            Pop { operand } => {
                let value = self.pop();
                self.write_operand(operand, value.into())?;
                Flow::Sequential
            }
            Pushf => {
                let flags = self.state.flags().to_word();
                self.push(flags);
                Flow::Sequential
            }
            Popf => {
                let word = self.pop();
                self.state.set_flags(Flags::from_word(word));
                Flow::Sequential
            }
            Lahf => {
                let low = (self.state.flags() & Flags::low_byte()).to_word();
                self.state.set_ah(low as u8);
                Flow::Sequential
            }
            Sahf => {
                let ah = Flags::from_word(self.state.ah().into()) & Flags::low_byte();
                let flags = (self.state.flags() - Flags::low_byte()) | ah;
                self.state.set_flags(flags);
                Flow::Sequential
            }
            JumpIf { cc, rel } => {
                let taken = self.eval_cc(*cc);
                if taken {
                    self.jump_relative(*rel);
                }
                Flow::Branch { taken }
            }
            JumpRel { rel } => {
                self.jump_relative(*rel);
                Flow::Direct
            }
            Jump { target } => {
                let ip = self.read_operand(target) as u16;
                self.state.set_ip(ip);
                Flow::Indirect
            }
            JumpFar { segment, offset } => {
                self.state.set_cs(*segment);
                self.state.set_ip(*offset);
                Flow::Direct
            }
            JumpFarIndirect { target } => {
                let (segment, offset) = self.read_far_pointer(target);
                self.state.set_cs(segment);
                self.state.set_ip(offset);
                Flow::Indirect
            }
            CallRel { rel } => {
                self.push(next_ip);
                self.jump_relative(*rel);
                Flow::Direct
            }
            Call { target } => {
                let ip = self.read_operand(target) as u16;
                self.push(next_ip);
                self.state.set_ip(ip);
                Flow::Indirect
            }
            CallFar { segment, offset } => {
                self.push(self.state.cs());
                self.push(next_ip);
                self.state.set_cs(*segment);
                self.state.set_ip(*offset);
                Flow::Direct
            }
            CallFarIndirect { target } => {
                let (segment, offset) = self.read_far_pointer(target);
                self.push(self.state.cs());
                self.push(next_ip);
                self.state.set_cs(segment);
                self.state.set_ip(offset);
                Flow::Indirect
            }
            Ret { pop } => {
                let ip = self.pop();
                self.state.set_ip(ip);
                self.state.set_sp(self.state.sp().wrapping_add(*pop));
                Flow::Indirect
            }
            RetFar { pop } => {
                let ip = self.pop();
                let cs = self.pop();
                self.state.set_ip(ip);
                self.state.set_cs(cs);
                self.state.set_sp(self.state.sp().wrapping_add(*pop));
                Flow::Indirect
            }
            Iret => {
                let ip = self.pop();
                let cs = self.pop();
                let flags = self.pop();
                self.state.set_ip(ip);
                self.state.set_cs(cs);
                self.state.set_flags(Flags::from_word(flags));
                Flow::Indirect
            }
            Loop { kind, rel } => {
                let taken = match kind {
                    LoopKind::Jcxz => self.state.cx() == 0,
                    _ => {
                        let cx = self.state.cx().wrapping_sub(1);
                        self.state.set_cx(cx);
                        let zf = self.state.flag(Flags::ZF);
                        cx != 0 && match kind {
                            LoopKind::Loopz => zf,
                            LoopKind::Loopnz => !zf,
                            _ => true,
                        }
                    }
                };
                if taken {
                    self.jump_relative(*rel);
                }
                Flow::Branch { taken }
            }
            StrMem { op, rep, size, segment } => {
                self.string_op(*op, *rep, *size, *segment);
                Flow::Sequential
            }
            In { size, port } => {
                let port = self.port(*port);
                match size {
                    OpSize::Bits8 => {
                        let value = self.io.read_byte(port)?;
                        self.state.set_al(value);
                    }
                    OpSize::Bits16 => {
                        let value = self.io.read_word(port)?;
                        self.state.set_ax(value);
                    }
                }
                Flow::Sequential
            }
            Out { size, port } => {
                let port = self.port(*port);
                match size {
                    OpSize::Bits8 => self.io.write_byte(port, self.state.al())?,
                    OpSize::Bits16 => self.io.write_word(port, self.state.ax())?,
                }
                Flow::Sequential
            }
            Int { vector } => {
                self.interrupt(*vector);
                Flow::Indirect
            }
            IntO => {
                if self.state.flag(Flags::OF) {
                    self.interrupt(OVERFLOW_VECTOR);
                    Flow::Indirect
                } else {
                    Flow::Sequential
                }
            }
            Cbw => {
                let ax = self.state.al() as i8 as i16 as u16;
                self.state.set_ax(ax);
                Flow::Sequential
            }
            Cwd => {
                let bit = self.state.ax() & 0x8000 != 0;
                self.state.set_dx(if bit { 0xffff } else { 0 });
                Flow::Sequential
            }
            Xlat { segment } => {
                let offset = self.state.bx().wrapping_add(self.state.al().into());
                let addr = SegmentedAddress::new(self.state.segment(*segment), offset);
                let value = self.mem.read_u8_at(addr);
                self.state.set_al(value);
                Flow::Sequential
            }
            Bcd { op } => {
                if self.adjust(*op) {
                    Flow::Sequential
                } else {
                    trace!("aam by zero at {}", self.state.cs_ip());
                    self.interrupt(DIVIDE_ERROR_VECTOR);
                    Flow::Indirect
                }
            }
            Flag { op } => {
                match op {
                    FlagOp::Clc => self.state.update_flags(Flags::CF, false),
                    FlagOp::Stc => self.state.update_flags(Flags::CF, true),
                    FlagOp::Cmc => {
                        let cf = self.state.flag(Flags::CF);
                        self.state.update_flags(Flags::CF, !cf);
                    }
                    FlagOp::Cli => self.state.update_flags(Flags::IF, false),
                    FlagOp::Sti => self.state.update_flags(Flags::IF, true),
                    FlagOp::Cld => self.state.update_flags(Flags::DF, false),
                    FlagOp::Std => self.state.update_flags(Flags::DF, true),
                }
                Flow::Sequential
            }
            Hlt => {
                self.state.set_running(false);
                Flow::Halt
            }
            Nop => Flow::Sequential,
        };

        Ok(flow)
    }

    /// Performs the interrupt entry sequence for `vector`.
    ///
    /// Pushes `FLAGS`, `CS` and `IP`, clears `IF` and `TF` and continues at
    /// the handler stored in the interrupt vector table.
    pub fn interrupt(&mut self, vector: u8) {
        self.mem.breakpoints().trigger_at(BreakpointKind::Interrupt, vector.into());

        let flags = self.state.flags().to_word();
        self.push(flags);
        self.push(self.state.cs());
        self.push(self.state.ip());
        self.state.update_flags(Flags::IF | Flags::TF, false);

        let entry = u32::from(vector) * 4;
        let ip = self.mem.read_u16(entry);
        let cs = self.mem.read_u16(entry + 2);
        self.state.set_cs(cs);
        self.state.set_ip(ip);
        trace!("int {:#04X} -> {}", vector, self.state.cs_ip());
    }

    /// Evaluates an operand by returning the immediate, reading a register or
    /// reading from memory.
    ///
    /// The value is zero-extended from the operand size.
    fn read_operand(&mut self, operand: &Operand) -> u32 {
        match operand {
            Operand::Reg(reg) => self.state.get_register(*reg).into(),
            Operand::Seg(seg) => self.state.segment(*seg).into(),
            Operand::Imm(imm) => imm.zero_extended(),
            Operand::Mem(loc) => {
                let addr = self.location(loc);
                match loc.size {
                    OpSize::Bits8 => self.mem.read_u8_at(addr).into(),
                    OpSize::Bits16 => self.mem.read_u16_at(addr).into(),
                }
            }
        }
    }

    /// Stores the low bits of `value` to a writeable operand.
    ///
    /// The `dest` operand must be a register or memory location.
    fn write_operand(&mut self, dest: &Operand, value: u32) -> Result<(), InterpreterError> {
        match dest {
            Operand::Reg(reg) => self.state.set_register(*reg, value as u16),
            Operand::Seg(seg) => self.state.set_segment(*seg, value as u16),
            Operand::Imm(_) => return Err(InterpreterError::InvalidOperand("store to immediate")),
            Operand::Mem(loc) => {
                let addr = self.location(loc);
                match loc.size {
                    OpSize::Bits8 => self.mem.write_u8_at(addr, value as u8),
                    OpSize::Bits16 => self.mem.write_u16_at(addr, value as u16),
                }
            }
        }

        Ok(())
    }

    /// Evaluates the offset part of a `MemoryLocation`, which might depend on
    /// register values.
    fn effective_offset(&self, loc: &MemoryLocation) -> u16 {
        let addressing = &loc.addressing;
        let reg = |r: Option<Register>| r.map(|r| self.state.get_register(r)).unwrap_or(0);

        reg(addressing.base)
            .wrapping_add(reg(addressing.index))
            .wrapping_add(addressing.disp as u16)
    }

    fn location(&self, loc: &MemoryLocation) -> SegmentedAddress {
        SegmentedAddress::new(self.state.segment(loc.segment), self.effective_offset(loc))
    }

    /// Reads an `offset, segment` pair.
    fn read_far_pointer(&mut self, loc: &MemoryLocation) -> (u16, u16) {
        let addr = self.location(loc);
        let offset = self.mem.read_u16_at(addr);
        let segment = self.mem.read_u16_at(addr.wrapping_add(2));
        (segment, offset)
    }

    fn port(&self, port: Port) -> u16 {
        match port {
            Port::Imm(n) => n.into(),
            Port::Dx => self.state.dx(),
        }
    }

    fn jump_relative(&mut self, rel: i16) {
        let ip = self.state.ip().wrapping_add(rel as u16);
        self.state.set_ip(ip);
    }

    fn push(&mut self, value: u16) {
        let sp = self.state.sp().wrapping_sub(2);
        self.state.set_sp(sp);
        let addr = self.state.ss_sp();
        self.mem.write_u16_at(addr, value);
    }

    fn pop(&mut self) -> u16 {
        let value = self.mem.read_u16_at(self.state.ss_sp());
        self.state.set_sp(self.state.sp().wrapping_add(2));
        value
    }

    fn alu(&mut self, op: AluOp, lhs: u32, rhs: u32, size: OpSize) -> u32 {
        let carry = if self.state.flag(Flags::CF) { 1 } else { 0 };
        match op {
            AluOp::Add => self.add(lhs, rhs, 0, size),
            AluOp::Adc => self.add(lhs, rhs, carry, size),
            AluOp::Sub | AluOp::Cmp => self.sub(lhs, rhs, 0, size),
            AluOp::Sbb => self.sub(lhs, rhs, carry, size),
            AluOp::And => self.logic(lhs & rhs, size),
            AluOp::Or => self.logic(lhs | rhs, size),
            AluOp::Xor => self.logic(lhs ^ rhs, size),
        }
    }

    /// `a + b + carry`, setting all arithmetic flags.
    fn add(&mut self, a: u32, b: u32, carry: u32, size: OpSize) -> u32 {
        let full = a + b + carry;
        let res = full & size.mask();
        self.state.update_flags(Flags::CF, full > size.mask());
        // inputs have same sign, but output changed
        self.state.update_flags(Flags::OF, (a ^ res) & (b ^ res) & size.sign_bit() != 0);
        self.state.update_flags(Flags::AF, (a ^ b ^ res) & 0x10 != 0);
        self.update_szp(res, size);
        res
    }

    /// `a - b - borrow`, setting all arithmetic flags.
    fn sub(&mut self, a: u32, b: u32, borrow: u32, size: OpSize) -> u32 {
        let res = a.wrapping_sub(b).wrapping_sub(borrow) & size.mask();
        self.state.update_flags(Flags::CF, b + borrow > a);
        self.state.update_flags(Flags::OF, (a ^ b) & (a ^ res) & size.sign_bit() != 0);
        self.state.update_flags(Flags::AF, (a ^ b ^ res) & 0x10 != 0);
        self.update_szp(res, size);
        res
    }

    fn logic(&mut self, res: u32, size: OpSize) -> u32 {
        self.state.update_flags(Flags::OF | Flags::CF | Flags::AF, false);
        self.update_szp(res, size);
        res
    }

    fn shift(&mut self, op: ShiftOp, value: u32, amount: u32, size: OpSize) -> u32 {
        let (mask, msb) = (size.mask(), size.sign_bit());
        let mut cf = self.state.flag(Flags::CF);
        let mut v = value;
        for _ in 0..amount {
            match op {
                ShiftOp::Rol => {
                    cf = v & msb != 0;
                    v = (v << 1 | cf as u32) & mask;
                }
                ShiftOp::Ror => {
                    cf = v & 1 != 0;
                    v = v >> 1 | if cf { msb } else { 0 };
                }
                ShiftOp::Rcl => {
                    let out = v & msb != 0;
                    v = (v << 1 | cf as u32) & mask;
                    cf = out;
                }
                ShiftOp::Rcr => {
                    let out = v & 1 != 0;
                    v = v >> 1 | if cf { msb } else { 0 };
                    cf = out;
                }
                ShiftOp::Shl | ShiftOp::Sal => {
                    cf = v & msb != 0;
                    v = (v << 1) & mask;
                }
                ShiftOp::Shr => {
                    cf = v & 1 != 0;
                    v >>= 1;
                }
                ShiftOp::Sar => {
                    cf = v & 1 != 0;
                    v = v >> 1 | (v & msb);
                }
            }
        }

        let res_msb = v & msb != 0;
        let of = match op {
            ShiftOp::Rol | ShiftOp::Rcl | ShiftOp::Shl | ShiftOp::Sal => res_msb ^ cf,
            ShiftOp::Ror | ShiftOp::Rcr => res_msb ^ (v & (msb >> 1) != 0),
            ShiftOp::Shr => value & msb != 0,
            ShiftOp::Sar => false,
        };

        self.state.update_flags(Flags::CF, cf);
        self.state.update_flags(Flags::OF, of);
        match op {
            ShiftOp::Rol | ShiftOp::Ror | ShiftOp::Rcl | ShiftOp::Rcr => {}
            _ => self.update_szp(v, size),
        }
        v
    }

    /// Divides `AX` or `DX:AX` by `operand`.
    ///
    /// Returns `false` without modifying any register if the division faults.
    fn divide(&mut self, operand: &Operand, signed: bool) -> bool {
        let divisor = self.read_operand(operand);
        if divisor == 0 {
            return false;
        }

        match (operand.size(), signed) {
            (OpSize::Bits8, false) => {
                let dividend = u32::from(self.state.ax());
                let quot = dividend / divisor;
                if quot > 0xFF {
                    return false;
                }
                self.state.set_al(quot as u8);
                self.state.set_ah((dividend % divisor) as u8);
            }
            (OpSize::Bits16, false) => {
                let dividend = u32::from(self.state.dx()) << 16 | u32::from(self.state.ax());
                let quot = dividend / divisor;
                if quot > 0xFFFF {
                    return false;
                }
                self.state.set_ax(quot as u16);
                self.state.set_dx((dividend % divisor) as u16);
            }
            (OpSize::Bits8, true) => {
                let dividend = i32::from(self.state.ax() as i16);
                let divisor = i32::from(divisor as u8 as i8);
                let quot = dividend / divisor;
                // for each destination size, check if `quot` can "go there"
                // and back without changing
                if quot != i32::from(quot as i8) {
                    return false;
                }
                self.state.set_al(quot as u8);
                self.state.set_ah((dividend % divisor) as u8);
            }
            (OpSize::Bits16, true) => {
                let dividend = i64::from((u32::from(self.state.dx()) << 16 | u32::from(self.state.ax())) as i32);
                let divisor = i64::from(divisor as u16 as i16);
                let quot = dividend / divisor;
                if quot != i64::from(quot as i16) {
                    return false;
                }
                self.state.set_ax(quot as u16);
                self.state.set_dx((dividend % divisor) as u16);
            }
        }

        true
    }

    /// Performs a BCD adjust instruction.
    ///
    /// Returns `false` if `aam` divides by zero.
    fn adjust(&mut self, op: BcdOp) -> bool {
        let (al, ah) = (self.state.al(), self.state.ah());
        // the low digit left the 0-9 range
        let low = al & 0x0F > 9 || self.state.flag(Flags::AF);

        match op {
            BcdOp::Daa | BcdOp::Das => {
                let high = al > 0x99 || self.state.flag(Flags::CF);
                let adjust = (if low { 0x06 } else { 0 }) | (if high { 0x60 } else { 0 });
                let res = if op == BcdOp::Daa {
                    al.wrapping_add(adjust)
                } else {
                    al.wrapping_sub(adjust)
                };
                self.state.set_al(res);
                self.state.update_flags(Flags::AF, low);
                self.state.update_flags(Flags::CF, high);
                self.update_szp(res.into(), OpSize::Bits8);
            }
            BcdOp::Aaa | BcdOp::Aas => {
                let (al, ah) = match (low, op == BcdOp::Aaa) {
                    (false, _) => (al, ah),
                    (true, true) => (al.wrapping_add(6), ah.wrapping_add(1)),
                    (true, false) => (al.wrapping_sub(6), ah.wrapping_sub(1)),
                };
                self.state.set_al(al & 0x0F);
                self.state.set_ah(ah);
                self.state.update_flags(Flags::AF | Flags::CF, low);
            }
            BcdOp::Aam(base) => {
                if base == 0 {
                    return false;
                }
                self.state.set_ah(al / base);
                self.state.set_al(al % base);
                self.update_szp((al % base).into(), OpSize::Bits8);
            }
            BcdOp::Aad(base) => {
                let res = al.wrapping_add(ah.wrapping_mul(base));
                self.state.set_ax(res.into());
                self.update_szp(res.into(), OpSize::Bits8);
            }
        }

        true
    }

    /// Runs a string instruction, including all repetitions.
    fn string_op(&mut self, op: StrMemOp, rep: Option<RepPrefix>, size: OpSize, segment: Segment) {
        let step = if self.state.flag(Flags::DF) {
            (size.bytes() as u16).wrapping_neg()
        } else {
            size.bytes() as u16
        };
        let acc = Register::accumulator(size);

        loop {
            if rep.is_some() && self.state.cx() == 0 {
                break;
            }

            let src = MemoryLocation {
                size,
                segment,
                addressing: Addressing::absolute(self.state.si()),
            };
            let dst = MemoryLocation {
                size,
                segment: Segment::Es,
                addressing: Addressing::absolute(self.state.di()),
            };
            let (src, dst) = (Operand::Mem(src), Operand::Mem(dst));

            let (advance_si, advance_di) = match op {
                StrMemOp::Movs => {
                    let value = self.read_operand(&src);
                    self.write_mem(&dst, value);
                    (true, true)
                }
                StrMemOp::Cmps => {
                    let (a, b) = (self.read_operand(&src), self.read_operand(&dst));
                    self.sub(a, b, 0, size);
                    (true, true)
                }
                StrMemOp::Stos => {
                    let value = u32::from(self.state.get_register(acc));
                    self.write_mem(&dst, value);
                    (false, true)
                }
                StrMemOp::Lods => {
                    let value = self.read_operand(&src);
                    self.state.set_register(acc, value as u16);
                    (true, false)
                }
                StrMemOp::Scas => {
                    let a = u32::from(self.state.get_register(acc));
                    let b = self.read_operand(&dst);
                    self.sub(a, b, 0, size);
                    (false, true)
                }
            };

            if advance_si {
                self.state.set_si(self.state.si().wrapping_add(step));
            }
            if advance_di {
                self.state.set_di(self.state.di().wrapping_add(step));
            }

            let rep = match rep {
                Some(rep) => rep,
                None => break,
            };
            self.state.set_cx(self.state.cx().wrapping_sub(1));
            if op.compares() {
                let zf = self.state.flag(Flags::ZF);
                match rep {
                    RepPrefix::Rep if !zf => break,
                    RepPrefix::Repne if zf => break,
                    _ => {}
                }
            }
        }
    }

    /// Writes to a memory operand built by the interpreter itself.
    fn write_mem(&mut self, dst: &Operand, value: u32) {
        if let Operand::Mem(loc) = dst {
            let addr = self.location(loc);
            match loc.size {
                OpSize::Bits8 => self.mem.write_u8_at(addr, value as u8),
                OpSize::Bits16 => self.mem.write_u16_at(addr, value as u16),
            }
        }
    }

    /// Calculates new values for the SF, ZF and PF flags given the result of
    /// the performed operation.
    fn update_szp(&mut self, res: u32, size: OpSize) {
        self.state.update_flags(Flags::SF, res & size.sign_bit() != 0);
        self.state.update_flags(Flags::ZF, res & size.mask() == 0);
        self.state.update_flags(Flags::PF, (res as u8).count_ones() & 1 == 0);
    }

    /// Checks a condition code against the currently set status flags.
    ///
    /// Returns `true` if the condition is fulfilled, `false` if not.
    fn eval_cc(&self, cc: ConditionCode) -> bool {
        use crate::cpu::instr::ConditionCode::*;

        let flags = self.state.flags();
        let cf = flags.contains(Flags::CF);
        let zf = flags.contains(Flags::ZF);
        let sf = flags.contains(Flags::SF);
        let of = flags.contains(Flags::OF);
        match cc {
            Above          => !cf && !zf,
            NotCarry       => !cf,
            Carry          => cf,
            BelowOrEqual   => cf || zf,
            Equal          => zf,
            Greater        => !zf && (sf == of),
            GreaterOrEqual => sf == of,
            Less           => sf != of,
            LessOrEqual    => zf || (sf != of),
            NotEqual       => !zf,
            NotOverflow    => !of,
            NotParity      => !flags.contains(Flags::PF),
            NotSign        => !sf,
            Overflow       => of,
            Parity         => flags.contains(Flags::PF),
            Sign           => sf,
        }
    }
}

#[derive(Debug)]
pub enum InterpreterError {
    /// An `in`/`out` instruction accessed an unhandled port on a strict
    /// dispatcher.
    Io(IoError),
    /// The instruction has an operand it cannot operate on.
    InvalidOperand(&'static str),
}

impl fmt::Display for InterpreterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InterpreterError::Io(e) => write!(f, "I/O error: {}", e),
            InterpreterError::InvalidOperand(what) => write!(f, "invalid operand: {}", what),
        }
    }
}

impl Error for InterpreterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            InterpreterError::Io(e) => Some(e),
            InterpreterError::InvalidOperand(_) => None,
        }
    }
}

impl From<IoError> for InterpreterError {
    fn from(e: IoError) -> Self {
        InterpreterError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::Breakpoints;
    use crate::cpu::decode::Decoder;
    use crate::memory::MIN_MEMORY_SIZE;
    use std::sync::Arc;

    const CODE: SegmentedAddress = SegmentedAddress::new(0x1000, 0x0100);

    fn interpreter() -> Interpreter {
        let bps = Arc::new(Breakpoints::new());
        let mem = Memory::new(MIN_MEMORY_SIZE, bps.clone()).unwrap();
        let io = IoPortDispatcher::new(false, bps);
        Interpreter::new(State::new(CODE, SegmentedAddress::new(0x2000, 0xFFFE)), mem, io)
    }

    /// Loads `code` at `CS:IP` and executes `count` instructions.
    fn run(interp: &mut Interpreter, code: &[u8], count: usize) -> Vec<Flow> {
        let base = interp.next_address();
        interp.mem_mut().load_block(base, code);
        (0..count).map(|_| {
            let addr = interp.next_address();
            let (instr, len) = {
                let mut dec = Decoder::new(interp.mem_mut(), addr);
                let instr = dec.decode_next().unwrap();
                (instr, dec.len())
            };
            interp.execute(&instr, len).unwrap()
        }).collect()
    }

    #[test]
    fn add_sets_flags() {
        let mut i = interpreter();
        // mov al,0x7f; add al,1
        run(&mut i, &[0xB0, 0x7F, 0x04, 0x01], 2);
        assert_eq!(i.state().al(), 0x80);
        assert!(i.state().flag(Flags::OF));
        assert!(i.state().flag(Flags::SF));
        assert!(i.state().flag(Flags::AF));
        assert!(!i.state().flag(Flags::CF));
        assert!(!i.state().flag(Flags::ZF));
    }

    #[test]
    fn cmp_and_conditional_branch() {
        let mut i = interpreter();
        // mov cx,3; cmp cx,3; jne -2
        let flows = run(&mut i, &[0xB9, 0x03, 0x00, 0x83, 0xF9, 0x03, 0x75, 0xFE], 3);
        assert_eq!(flows[2], Flow::Branch { taken: false });
        assert!(i.state().flag(Flags::ZF));
        assert_eq!(i.state().ip(), 0x0108);
    }

    #[test]
    fn sub_borrows() {
        let mut i = interpreter();
        // xor ax,ax; sub ax,1; sbb dx,dx
        run(&mut i, &[0x31, 0xC0, 0x2D, 0x01, 0x00, 0x19, 0xD2], 3);
        assert_eq!(i.state().ax(), 0xFFFF);
        assert_eq!(i.state().dx(), 0xFFFF);
        assert!(i.state().flag(Flags::CF));
    }

    #[test]
    fn inc_preserves_carry() {
        let mut i = interpreter();
        // stc; mov bx,0xffff; inc bx
        run(&mut i, &[0xF9, 0xBB, 0xFF, 0xFF, 0x43], 3);
        assert_eq!(i.state().bx(), 0);
        assert!(i.state().flag(Flags::CF));
        assert!(i.state().flag(Flags::ZF));
    }

    #[test]
    fn call_and_ret() {
        let mut i = interpreter();
        // call +1; nop; ret
        let flows = run(&mut i, &[0xE8, 0x01, 0x00, 0x90, 0xC3], 2);
        assert_eq!(flows, vec![Flow::Direct, Flow::Indirect]);
        assert_eq!(i.state().ip(), 0x0103);
        assert_eq!(i.state().sp(), 0xFFFE);
    }

    #[test]
    fn shifts_and_rotates() {
        let mut i = interpreter();
        // mov ax,0x8001; shl ax,1
        run(&mut i, &[0xB8, 0x01, 0x80, 0xD1, 0xE0], 2);
        assert_eq!(i.state().ax(), 0x0002);
        assert!(i.state().flag(Flags::CF));
        assert!(i.state().flag(Flags::OF));

        let mut i = interpreter();
        // mov al,0x81; ror al,1; sar al,1
        run(&mut i, &[0xB0, 0x81, 0xD0, 0xC8, 0xD0, 0xF8], 3);
        assert_eq!(i.state().al(), 0xE0);
        assert!(i.state().flag(Flags::SF));

        let mut i = interpreter();
        // mov cl,4; mov dx,0x1234; rol dx,cl
        run(&mut i, &[0xB1, 0x04, 0xBA, 0x34, 0x12, 0xD3, 0xC2], 3);
        assert_eq!(i.state().dx(), 0x2341);
    }

    #[test]
    fn mul_and_div() {
        let mut i = interpreter();
        // mov ax,0x1234; mov bx,0x100; mul bx; div bx
        run(&mut i, &[0xB8, 0x34, 0x12, 0xBB, 0x00, 0x01, 0xF7, 0xE3, 0xF7, 0xF3], 4);
        assert_eq!(i.state().ax(), 0x1234);
        assert_eq!(i.state().dx(), 0);

        let mut i = interpreter();
        // mov ax,-7; mov bl,2; idiv bl
        run(&mut i, &[0xB8, 0xF9, 0xFF, 0xB3, 0x02, 0xF6, 0xFB], 3);
        assert_eq!(i.state().al() as i8, -3);
        assert_eq!(i.state().ah() as i8, -1);
    }

    #[test]
    fn decimal_adjust() {
        let mut i = interpreter();
        // mov al,0x19; add al,0x28; daa
        run(&mut i, &[0xB0, 0x19, 0x04, 0x28, 0x27], 3);
        assert_eq!(i.state().al(), 0x47);
        assert!(!i.state().flag(Flags::CF));

        let mut i = interpreter();
        // mov al,0x99; add al,1; daa
        run(&mut i, &[0xB0, 0x99, 0x04, 0x01, 0x27], 3);
        assert_eq!(i.state().al(), 0x00);
        assert!(i.state().flag(Flags::CF));
        assert!(i.state().flag(Flags::ZF));

        let mut i = interpreter();
        // mov al,0x47; sub al,0x19; das
        run(&mut i, &[0xB0, 0x47, 0x2C, 0x19, 0x2F], 3);
        assert_eq!(i.state().al(), 0x28);
        assert!(!i.state().flag(Flags::CF));
    }

    #[test]
    fn ascii_adjust() {
        let mut i = interpreter();
        // mov ax,9; add al,8; aaa
        run(&mut i, &[0xB8, 0x09, 0x00, 0x04, 0x08, 0x37], 3);
        assert_eq!(i.state().ax(), 0x0107);
        assert!(i.state().flag(Flags::CF));

        let mut i = interpreter();
        // mov ax,0x0102; sub al,5; aas
        run(&mut i, &[0xB8, 0x02, 0x01, 0x2C, 0x05, 0x3F], 3);
        assert_eq!(i.state().ax(), 0x0007);
        assert!(i.state().flag(Flags::CF));

        let mut i = interpreter();
        // mov al,47; aam; aad
        run(&mut i, &[0xB0, 0x2F, 0xD4, 0x0A], 2);
        assert_eq!(i.state().ax(), 0x0407);
        run(&mut i, &[0xD5, 0x0A], 1);
        assert_eq!(i.state().ax(), 0x002F);
    }

    #[test]
    fn aam_by_zero_raises_interrupt_0() {
        let mut i = interpreter();
        i.mem_mut().write_u16(0, 0x0010);
        i.mem_mut().write_u16(2, 0x3000);
        // aam 0
        let flows = run(&mut i, &[0xD4, 0x00], 1);
        assert_eq!(flows[0], Flow::Indirect);
        assert_eq!(i.state().cs_ip(), SegmentedAddress::new(0x3000, 0x0010));
    }

    #[test]
    fn divide_error_raises_interrupt_0() {
        let mut i = interpreter();
        // handler for int 0 at 0x3000:0x0010
        i.mem_mut().write_u16(0, 0x0010);
        i.mem_mut().write_u16(2, 0x3000);
        // xor bl,bl; div bl
        let flows = run(&mut i, &[0x30, 0xDB, 0xF6, 0xF3], 2);
        assert_eq!(flows[1], Flow::Indirect);
        assert_eq!(i.state().cs_ip(), SegmentedAddress::new(0x3000, 0x0010));
        // the pushed return address is the next instruction
        let sp = i.state().ss_sp();
        assert_eq!(i.mem_mut().read_u16_at(sp), 0x0104);
        assert_eq!(i.mem_mut().read_u16_at(sp.wrapping_add(2)), 0x1000);
    }

    #[test]
    fn rep_movsb_and_repe_cmpsb() {
        let mut i = interpreter();
        i.state_mut().set_es(0x1000);
        i.mem_mut().load_block(0x10200, b"hello");
        // mov si,0x200; mov di,0x300; mov cx,5; rep movsb
        run(&mut i, &[0xBE, 0x00, 0x02, 0xBF, 0x00, 0x03, 0xB9, 0x05, 0x00, 0xF3, 0xA4], 4);
        assert_eq!(i.mem_mut().read_block(0x10300, 5), b"hello".to_vec());
        assert_eq!(i.state().cx(), 0);
        assert_eq!(i.state().si(), 0x205);

        i.mem_mut().write_u8(0x10302, b'L');
        // mov si,0x200; mov di,0x300; mov cx,5; repe cmpsb
        i.state_mut().set_ip(0x0100);
        run(&mut i, &[0xBE, 0x00, 0x02, 0xBF, 0x00, 0x03, 0xB9, 0x05, 0x00, 0xF3, 0xA6], 4);
        assert_eq!(i.state().cx(), 2);
        assert!(!i.state().flag(Flags::ZF));
    }

    #[test]
    fn push_pop_segments_and_flags() {
        let mut i = interpreter();
        // push cs; pop ds; stc; pushf; popf; lahf
        run(&mut i, &[0x0E, 0x1F, 0xF9, 0x9C, 0x9D, 0x9F], 6);
        assert_eq!(i.state().ds(), 0x1000);
        assert!(i.state().flag(Flags::CF));
        assert_eq!(i.state().ah() & 0x01, 0x01);
        assert_eq!(i.state().sp(), 0xFFFE);
    }

    #[test]
    fn hlt_stops() {
        let mut i = interpreter();
        let flows = run(&mut i, &[0xF4], 1);
        assert_eq!(flows, vec![Flow::Halt]);
        assert!(!i.state().is_running());
    }

    #[test]
    fn loop_counts_down() {
        let mut i = interpreter();
        // mov cx,2; loop -2 (to itself)
        let flows = run(&mut i, &[0xB9, 0x02, 0x00, 0xE2, 0xFE], 3);
        assert_eq!(flows[1], Flow::Branch { taken: true });
        assert_eq!(flows[2], Flow::Branch { taken: false });
        assert_eq!(i.state().cx(), 0);
    }
}
