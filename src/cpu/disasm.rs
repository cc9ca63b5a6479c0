//! Instruction disassembler and pretty printer.

use crate::cpu::instr::*;
use crate::cpu::visit::{self, Visitor};

use termcolor::{Color, ColorSpec, WriteColor};

use std::fmt;
use std::io::{self, Write};

/// Trait for assembly printing contexts.
///
/// This can be implemented to color specific parts of an instruction and to
/// supply a base address to resolve relative branch targets.
pub trait AsmPrinter {
    /// Print an instruction mnemonic/name.
    fn print_mnemonic(&mut self, mnemonic: &str);

    /// Prints a register operand (or part of an operand).
    fn print_register(&mut self, name: &str);

    /// Prints an immediate operand.
    fn print_immediate(&mut self, imm: &str);

    /// Prints an address or an address offset of an operand.
    fn print_addr_or_offset(&mut self, addr: &str);

    /// Prints a jump or call target.
    fn print_jump_target(&mut self, target: &str);

    /// Print a string of symbol characters like `&,[]+ `.
    fn print_symbols(&mut self, sym: &str);

    /// Called when the instruction is fully printed.
    fn done(&mut self);

    /// Get the program counter reference.
    ///
    /// This is the value of `IP` after the currently printed instruction
    /// completes execution. x86 determines relative jump and call targets
    /// relative to that address.
    ///
    /// If this is provided, relative branches are displayed with their
    /// resolved target offset.
    fn pc_ref(&self) -> Option<u32> { None }
}

/// Prints the instruction to a string, without formatting.
impl AsmPrinter for String {
    fn print_mnemonic(&mut self, mnemonic: &str) {
        self.push_str(mnemonic);
    }

    fn print_register(&mut self, name: &str) {
        self.push_str(name);
    }

    fn print_immediate(&mut self, imm: &str) {
        self.push_str(imm);
    }

    fn print_addr_or_offset(&mut self, addr: &str) {
        self.push_str(addr);
    }

    fn print_jump_target(&mut self, target: &str) {
        self.push_str(target);
    }

    fn print_symbols(&mut self, sym: &str) {
        self.push_str(sym);
    }

    fn done(&mut self) {}
}

const COLOR_MNEMONIC: Color = Color::Blue;
const COLOR_REGISTER: Color = Color::Red;
const COLOR_IMMEDIATE: Color = Color::Green;
const COLOR_ADDR: Color = Color::Cyan;
const COLOR_TARGET: Color = Color::Yellow;

/// Prints colored disassembly to a terminal.
///
/// Write errors are remembered and reported by `finish`.
pub struct TermPrinter<W: WriteColor> {
    w: W,
    pc: Option<u32>,
    error: Option<io::Error>,
}

impl<W: WriteColor> TermPrinter<W> {
    pub fn new(w: W) -> Self {
        Self {
            w,
            pc: None,
            error: None,
        }
    }

    /// Sets the offset following the instruction that is printed next.
    pub fn set_pc(&mut self, pc: u32) {
        self.pc = Some(pc);
    }

    /// Prints `text` in `color`.
    pub fn print(&mut self, color: Color, text: &str) {
        if self.error.is_some() {
            return;
        }

        if let Err(e) = self.write_colored(color, text) {
            self.error = Some(e);
        }
    }

    fn write_colored(&mut self, color: Color, text: &str) -> io::Result<()> {
        self.w.set_color(ColorSpec::new().set_fg(Some(color)))?;
        self.w.write_all(text.as_bytes())?;
        self.w.reset()
    }

    /// Prints a physical address column.
    pub fn print_address(&mut self, text: &str) {
        self.print(COLOR_ADDR, text);
    }

    /// Prints the raw instruction bytes column.
    pub fn print_raw(&mut self, text: &str) {
        self.print(COLOR_IMMEDIATE, text);
    }

    pub fn newline(&mut self) {
        self.print_symbols("\n");
    }

    /// Flushes the output and returns the first error that occurred.
    pub fn finish(&mut self) -> io::Result<()> {
        match self.error.take() {
            Some(e) => Err(e),
            None => self.w.flush(),
        }
    }
}

impl<W: WriteColor> fmt::Debug for TermPrinter<W> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TermPrinter")
            .field("pc", &self.pc)
            .field("error", &self.error)
            .finish()
    }
}

impl<W: WriteColor> AsmPrinter for TermPrinter<W> {
    fn print_mnemonic(&mut self, mnemonic: &str) {
        self.print(COLOR_MNEMONIC, mnemonic);
    }

    fn print_register(&mut self, name: &str) {
        self.print(COLOR_REGISTER, name);
    }

    fn print_immediate(&mut self, imm: &str) {
        self.print(COLOR_IMMEDIATE, imm);
    }

    fn print_addr_or_offset(&mut self, addr: &str) {
        self.print(COLOR_ADDR, addr);
    }

    fn print_jump_target(&mut self, target: &str) {
        self.print(COLOR_TARGET, target);
    }

    fn print_symbols(&mut self, sym: &str) {
        if self.error.is_none() {
            if let Err(e) = self.w.write_all(sym.as_bytes()) {
                self.error = Some(e);
            }
        }
    }

    fn done(&mut self) {}

    fn pc_ref(&self) -> Option<u32> {
        self.pc
    }
}

/// Extension trait for internal use by the disassembly printer.
trait PrinterExt {
    fn space(&mut self);
    fn with_indirect<F>(&mut self, f: F)
        where F: FnOnce(&mut Self);
}

impl<P: AsmPrinter> PrinterExt for P {
    fn space(&mut self) {
        self.print_symbols(" ");
    }

    fn with_indirect<F>(&mut self, f: F)
        where F: FnOnce(&mut Self) {
        self.print_symbols("[");
        f(self);
        self.print_symbols("]");
    }
}

/// Printer hint for operands - this will cause immediates to be printed as
/// decimal or hexadecimal.
#[derive(Copy, Clone)]
enum ImmReprHint {
    Dec,
    Hex,
}

struct Disassembler<'a, A: AsmPrinter + 'a> {
    printer: &'a mut A,
    dont_disambiguate: bool,
    /// Only the first operand determines whether a size is printed.
    size_from_first: bool,
    imm_fmt: ImmReprHint,
}

impl<'a, A: AsmPrinter> Visitor for Disassembler<'a, A> {
    fn visit_instr(&mut self, instr: &Instr) {
        use crate::cpu::instr::Instr::*;

        self.imm_fmt = match instr {
            Alu { op, .. } => match op {
                AluOp::Add => ImmReprHint::Dec,
                AluOp::Or => ImmReprHint::Hex,
                AluOp::Adc => ImmReprHint::Dec,
                AluOp::Sbb => ImmReprHint::Dec,
                AluOp::And => ImmReprHint::Hex,
                AluOp::Sub => ImmReprHint::Dec,
                AluOp::Xor => ImmReprHint::Hex,
                AluOp::Cmp => ImmReprHint::Hex,
            },
            Ret { .. } | RetFar { .. } => ImmReprHint::Dec,
            Imul { .. }
            | ImulTrunc { .. }
            | Idiv { .. } => ImmReprHint::Dec,
            Shift { .. } => ImmReprHint::Dec,
            _ => ImmReprHint::Hex,
        };

        self.dont_disambiguate = match instr {
            Ret { .. }
            | RetFar { .. }
            | Jump { .. }
            | JumpFarIndirect { .. }
            | Call { .. }
            | CallFarIndirect { .. }
            | Int { .. }
            | In { .. }
            | Out { .. }
            | Lea { .. }
            | LoadFarPointer { .. } => true,
            _ => false,
        };

        self.size_from_first = match instr {
            Shift { .. } => true,
            _ => false,
        };

        visit::walk_instr(self, instr);
        self.printer.done();
    }

    fn visit_prefixes(&mut self, prefixes: &[&str]) {
        for prefix in prefixes {
            self.printer.print_mnemonic(prefix);
            self.printer.print_symbols(" ");
        }
    }

    fn visit_mnemonic(&mut self, mnemonic: &str) {
        self.printer.print_mnemonic(mnemonic);
    }

    fn visit_operands(&mut self, operands: &[&Operand]) {
        if !operands.is_empty() {
            self.printer.space();
        }

        // Memory locations and immediates have no size by themselves. If no
        // register operand of the same size pins it down, a `byte`/`word`
        // prefix is printed before the first of them.
        let considered = if self.size_from_first { &operands[..1.min(operands.len())] } else { operands };
        let ambig_size = considered.iter().find(|op| !is_reg(op)).map(|op| op.size());
        let mut disambiguate = match ambig_size {
            Some(size) if !self.dont_disambiguate => {
                !considered.iter().any(|op| is_reg(op) && op.size() == size)
            }
            _ => false,
        };

        for (i, op) in operands.iter().enumerate() {
            if i != 0 {
                self.printer.print_symbols(",");
            }

            if disambiguate && !is_reg(op) {
                let word = match op.size() {
                    OpSize::Bits8 => "byte",
                    OpSize::Bits16 => "word",
                };

                self.printer.print_immediate(word);
                self.printer.space();
                disambiguate = false;
            }

            visit::walk_operand(self, op);
        }
    }

    fn visit_register(&mut self, reg: Register) {
        self.printer.print_register(reg.name());
    }

    fn visit_segment(&mut self, seg: Segment) {
        self.printer.print_register(seg.name());
    }

    fn visit_immediate(&mut self, imm: &Immediate) {
        let s = match self.imm_fmt {
            ImmReprHint::Dec => format!("{}", imm),
            ImmReprHint::Hex => format!("{:#x}", imm),
        };
        self.printer.print_immediate(&s);
    }

    fn visit_memory_location(&mut self, mem: &MemoryLocation) {
        self.printer.with_indirect(|p| {
            let addressing = &mem.addressing;
            if mem.segment != addressing.default_segment() {
                p.print_register(mem.segment.name());
                p.print_symbols(":");
            }

            match (addressing.base, addressing.index) {
                (None, None) => {
                    p.print_addr_or_offset(&format!("{:#x}", addressing.disp as u16));
                    return;
                }
                (Some(base), None) => p.print_register(base.name()),
                (None, Some(index)) => p.print_register(index.name()),
                (Some(base), Some(index)) => {
                    p.print_register(base.name());
                    p.print_symbols("+");
                    p.print_register(index.name());
                }
            }

            let disp = i32::from(addressing.disp);
            if disp != 0 {
                p.print_symbols(if disp > 0 { "+" } else { "-" });
                p.print_addr_or_offset(&format!("{:#x}", disp.abs()));
            }
        });
    }

    fn visit_branch_offset(&mut self, rel: i16) {
        self.printer.space();
        match self.printer.pc_ref() {
            Some(pc) => {
                let target = (pc as u16).wrapping_add(rel as u16);
                self.printer.print_jump_target(&format!("{:+}", rel));
                self.printer.print_symbols(" (-> ");
                self.printer.print_jump_target(&format!("{:#06X}", target));
                self.printer.print_symbols(")");
            }
            None => self.printer.print_jump_target(&format!("{:+}", rel)),
        }
    }

    fn visit_far_target(&mut self, segment: u16, offset: u16) {
        self.printer.space();
        self.printer.print_jump_target(&format!("{:04X}:{:04X}", segment, offset));
    }
}

fn is_reg(op: &Operand) -> bool {
    match op {
        Operand::Reg(_) | Operand::Seg(_) => true,
        Operand::Imm(_) | Operand::Mem(_) => false,
    }
}

pub fn print_instr<P: AsmPrinter>(instr: &Instr, p: &mut P) {
    Disassembler {
        printer: p,
        dont_disambiguate: false,
        size_from_first: false,
        imm_fmt: ImmReprHint::Hex,
    }.visit_instr(instr);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct WithPc(String, u32);

    impl AsmPrinter for WithPc {
        fn print_mnemonic(&mut self, s: &str) { self.0.push_str(s) }
        fn print_register(&mut self, s: &str) { self.0.push_str(s) }
        fn print_immediate(&mut self, s: &str) { self.0.push_str(s) }
        fn print_addr_or_offset(&mut self, s: &str) { self.0.push_str(s) }
        fn print_jump_target(&mut self, s: &str) { self.0.push_str(s) }
        fn print_symbols(&mut self, s: &str) { self.0.push_str(s) }
        fn done(&mut self) {}
        fn pc_ref(&self) -> Option<u32> { Some(self.1) }
    }

    #[test]
    fn resolves_relative_targets() {
        let mut p = WithPc(String::new(), 0x0106);
        print_instr(&Instr::JumpIf { cc: ConditionCode::NotEqual, rel: -6 }, &mut p);
        assert_eq!(p.0, "jne -6 (-> 0x0100)");
    }

    #[test]
    fn segment_operands() {
        let instr = Instr::Mov { dest: Segment::Ds.into(), src: Register::Ax.into() };
        assert_eq!(instr.to_string(), "mov ds,ax");
    }
}
