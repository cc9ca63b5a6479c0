//! Contains x86 instruction visitor machinery.

use crate::cpu::instr::*;

/// Instruction visitor.
///
/// When overriding a method, call the corresponding `walk_*` method to keep the
/// default behaviour of descending into the object. Omit it to stop descending.
pub trait Visitor {
    /// Visit the whole instruction.
    ///
    /// This is called when a new instruction is about to be processed. By
    /// default, it calls into `walk_instr`, which will decompose the
    /// instruction into its prefixes, mnemonic and operands and call the
    /// corresponding visitor methods on those.
    fn visit_instr(&mut self, instr: &Instr) { walk_instr(self, instr) }
    fn visit_prefixes(&mut self, _prefixes: &[&str]) {}
    fn visit_mnemonic(&mut self, _mnemonic: &str) {}

    /// Visit the assembly-level operands of an instruction.
    fn visit_operands(&mut self, operands: &[&Operand]) {
        for op in operands {
            walk_operand(self, op);
        }
    }

    /// Visit a register operand.
    fn visit_register(&mut self, _reg: Register) {}

    /// Visit a segment register operand.
    fn visit_segment(&mut self, _seg: Segment) {}

    /// Visit an immediate operand.
    ///
    /// Note that, depending on the instruction, this might be an interrupt or
    /// port number instead of a numeric operand.
    fn visit_immediate(&mut self, _imm: &Immediate) {}

    /// Visit a memory location operand.
    fn visit_memory_location(&mut self, _mem: &MemoryLocation) {}

    /// Visit the displacement of a relative branch, measured from the end of
    /// the instruction.
    fn visit_branch_offset(&mut self, _rel: i16) {}

    /// Visit the `segment:offset` target of a direct far branch.
    fn visit_far_target(&mut self, _segment: u16, _offset: u16) {}
}

/// Decomposes an `Instr` into its components and calls the corresponding
/// visitor methods.
pub fn walk_instr<V: Visitor + ?Sized>(v: &mut V, instr: &Instr) {
    use crate::cpu::instr::Instr::*;

    v.visit_prefixes(&prefixes(instr));
    v.visit_mnemonic(&mnemonic(instr));

    match instr {
        // operand, operand
        Alu { dest, src, op: _ }
        | Shift { dest, src, op: _ }
        | Mov { dest, src }
        | Xchg { a: dest, b: src }
        | Test { lhs: dest, rhs: src } => {
            v.visit_operands(&[dest, src]);
        }
        // register, memory
        Lea { dest, src }
        | LoadFarPointer { dest, src, .. } => {
            let dest = &Operand::Reg(*dest);
            let src = &Operand::Mem(src.clone());
            v.visit_operands(&[dest, src]);
        }
        ImulTrunc { dest, src1, src2 } => {
            // 2/3 operand imul
            let dest = &Operand::Reg(*dest);
            if src1 == dest {
                // 2 operands
                v.visit_operands(&[dest, src2]);
            } else {
                // 3 operands
                v.visit_operands(&[dest, src1, src2]);
            }
        }
        JumpIf { rel, .. }
        | JumpRel { rel }
        | CallRel { rel }
        | Loop { rel, .. } => v.visit_branch_offset(*rel),
        JumpFar { segment, offset }
        | CallFar { segment, offset } => v.visit_far_target(*segment, *offset),
        Jump { target }
        | Call { target } => {
            v.visit_operands(&[target]);
        }
        JumpFarIndirect { target }
        | CallFarIndirect { target } => {
            let target = &Operand::Mem(target.clone());
            v.visit_operands(&[target]);
        }
        Ret { pop }
        | RetFar { pop } => {
            if *pop > 0 {
                let pop = &Operand::Imm(Immediate::from(*pop));
                v.visit_operands(&[pop]);
            }
        }
        Push { operand }
        | Pop { operand }
        | Not { operand }
        | Neg { operand }
        | Mul { operand }
        | Imul { operand }
        | Div { operand }
        | Idiv { operand }
        | Inc { operand }
        | Dec { operand } => {
            v.visit_operands(&[operand]);
        }
        In { size, port } => {
            let acc = &Operand::Reg(Register::accumulator(*size));
            let port = &port_operand(*port);
            v.visit_operands(&[acc, port]);
        }
        Out { size, port } => {
            let acc = &Operand::Reg(Register::accumulator(*size));
            let port = &port_operand(*port);
            v.visit_operands(&[port, acc]);
        }
        Int { vector } => {
            let vector = &Operand::Imm(Immediate::from(*vector));
            v.visit_operands(&[vector]);
        }
        Bcd { op: BcdOp::Aam(base) }
        | Bcd { op: BcdOp::Aad(base) } => {
            if *base != 10 {
                let base = &Operand::Imm(Immediate::from(*base));
                v.visit_operands(&[base]);
            }
        }
        StrMem { .. }
        | Pushf
        | Popf
        | Lahf
        | Sahf
        | Iret
        | IntO
        | Cbw
        | Cwd
        | Xlat { .. }
        | Bcd { .. }
        | Flag { .. }
        | Hlt
        | Nop => {},    // no operands
    }
}

/// Decomposes an operand into its components and calls the corresponding
/// visitor methods.
pub fn walk_operand<V: Visitor + ?Sized>(v: &mut V, op: &Operand) {
    match op {
        Operand::Reg(reg) => v.visit_register(*reg),
        Operand::Seg(seg) => v.visit_segment(*seg),
        Operand::Imm(imm) => v.visit_immediate(imm),
        Operand::Mem(mem) => v.visit_memory_location(mem),
    }
}

fn port_operand(port: Port) -> Operand {
    match port {
        Port::Imm(n) => Operand::Imm(Immediate::from(n)),
        Port::Dx => Operand::Reg(Register::Dx),
    }
}

fn prefixes(instr: &Instr) -> Vec<&'static str> {
    use crate::cpu::instr::Instr::*;

    let mut prefixes = Vec::new();
    match instr {
        StrMem { op, rep, segment, .. } => {
            if *segment != Segment::Ds {
                prefixes.push(segment.name());
            }
            match rep {
                Some(RepPrefix::Rep) if op.compares() => prefixes.push("repe"),
                Some(RepPrefix::Rep) => prefixes.push("rep"),
                Some(RepPrefix::Repne) => prefixes.push("repne"),
                None => {}
            }
        }
        Xlat { segment } if *segment != Segment::Ds => prefixes.push(segment.name()),
        _ => {}   // prefixes don't need display
    }

    prefixes
}

fn mnemonic(instr: &Instr) -> String {
    use crate::cpu::instr::Instr::*;

    let simple = match instr {
        Alu { op, .. } => match op {
            AluOp::Add => "add",
            AluOp::Or => "or",
            AluOp::Adc => "adc",
            AluOp::Sbb => "sbb",
            AluOp::And => "and",
            AluOp::Sub => "sub",
            AluOp::Xor => "xor",
            AluOp::Cmp => "cmp",
        },
        Shift { op, .. } => match op {
            ShiftOp::Rol => "rol",
            ShiftOp::Ror => "ror",
            ShiftOp::Rcl => "rcl",
            ShiftOp::Rcr => "rcr",
            ShiftOp::Shl => "shl",
            ShiftOp::Shr => "shr",
            ShiftOp::Sal => "sal",
            ShiftOp::Sar => "sar",
        }
        Mov { .. } => "mov",
        Xchg { .. } => "xchg",
        Lea { .. } => "lea",
        LoadFarPointer { segment: Segment::Ds, .. } => "lds",
        LoadFarPointer { .. } => "les",
        Test { .. } => "test",
        Not { .. } => "not",
        Neg { .. } => "neg",
        Mul { .. } => "mul",
        Imul { .. } | ImulTrunc { .. } => "imul",
        Div { .. } => "div",
        Idiv { .. } => "idiv",
        Inc { .. } => "inc",
        Dec { .. } => "dec",
        Push { .. } => "push",
        Pop { .. } => "pop",
        Pushf => "pushf",
        Popf => "popf",
        Lahf => "lahf",
        Sahf => "sahf",
        JumpIf { cc, .. } => return format!("j{}", condition_code(*cc)),
        JumpRel { .. } | Jump { .. } | JumpFar { .. } => "jmp",
        JumpFarIndirect { .. } => "jmp far",
        CallRel { .. } | Call { .. } | CallFar { .. } => "call",
        CallFarIndirect { .. } => "call far",
        Ret { .. } => "ret",
        RetFar { .. } => "retf",
        Iret => "iret",
        Loop { kind, .. } => match kind {
            LoopKind::Loopnz => "loopnz",
            LoopKind::Loopz => "loopz",
            LoopKind::Loop => "loop",
            LoopKind::Jcxz => "jcxz",
        },
        StrMem { op, size, .. } => {
            let mut s = String::new();
            s.push_str(match op {
                StrMemOp::Movs => "movs",
                StrMemOp::Cmps => "cmps",
                StrMemOp::Stos => "stos",
                StrMemOp::Lods => "lods",
                StrMemOp::Scas => "scas",
            });
            s.push_str(match size {
                OpSize::Bits8 => "b",
                OpSize::Bits16 => "w",
            });
            return s;
        },
        In { .. } => "in",
        Out { .. } => "out",
        Int { .. } => "int",
        IntO => "into",
        Cbw => "cbw",
        Cwd => "cwd",
        Xlat { .. } => "xlatb",
        Bcd { op } => match op {
            BcdOp::Daa => "daa",
            BcdOp::Das => "das",
            BcdOp::Aaa => "aaa",
            BcdOp::Aas => "aas",
            BcdOp::Aam(_) => "aam",
            BcdOp::Aad(_) => "aad",
        },
        Flag { op } => match op {
            FlagOp::Clc => "clc",
            FlagOp::Stc => "stc",
            FlagOp::Cmc => "cmc",
            FlagOp::Cli => "cli",
            FlagOp::Sti => "sti",
            FlagOp::Cld => "cld",
            FlagOp::Std => "std",
        },
        Hlt => "hlt",
        Nop => "nop",
    };

    simple.to_string()
}

fn condition_code(cc: ConditionCode) -> &'static str {
    use self::ConditionCode::*;

    match cc {
        Above => "a",
        NotCarry => "nc",
        Carry => "c",
        BelowOrEqual => "be",
        Equal => "e",
        Greater => "g",
        GreaterOrEqual => "ge",
        Less => "l",
        LessOrEqual => "le",
        NotEqual => "ne",
        NotOverflow => "no",
        NotParity => "np",
        NotSign => "ns",
        Overflow => "o",
        Parity => "p",
        Sign => "s",
    }
}
