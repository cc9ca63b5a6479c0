//! 8086 processor state.

use crate::cpu::instr::{Register, Segment};
use crate::cpu::Flags;
use crate::memory::SegmentedAddress;

/// CPU state consisting of the emulated registers and the running flag.
#[derive(Debug, Clone)]
pub struct State {
    ax: u16,
    bx: u16,
    cx: u16,
    dx: u16,

    si: u16,
    di: u16,
    bp: u16,
    sp: u16,

    es: u16,
    cs: u16,
    ss: u16,
    ds: u16,

    ip: u16,
    flags: Flags,
    running: bool,
}

impl State {
    /// Creates a new, running state.
    ///
    /// # Parameters
    ///
    /// * `entry`: `CS:IP` of the first instruction. `DS` and `ES` start out
    ///   equal to `CS`.
    /// * `stack`: Initial `SS:SP`. `SP` should normally point just behind the
    ///   allocated stack memory.
    pub fn new(entry: SegmentedAddress, stack: SegmentedAddress) -> Self {
        Self {
            ax: 0,
            bx: 0,
            cx: 0,
            dx: 0,
            si: 0,
            di: 0,
            bp: 0,
            sp: stack.offset,
            es: entry.segment,
            cs: entry.segment,
            ss: stack.segment,
            ds: entry.segment,
            ip: entry.offset,
            flags: Flags::empty(),
            running: true,
        }
    }
}

macro_rules! accessors {
    (
        $base:ident: [ $getter16:ident/$setter16:ident ]
    ) => {
        pub fn $getter16(&self) -> u16 { self.$base }
        pub fn $setter16(&mut self, value: u16) { self.$base = value; }
    };
    (
        $base:ident: [ $getter16:ident/$setter16:ident, $getter8h:ident/$setter8h:ident, $getter8l:ident/$setter8l:ident ]
    ) => {
        pub fn $getter16(&self) -> u16 { self.$base }
        pub fn $setter16(&mut self, value: u16) { self.$base = value; }
        pub fn $getter8h(&self) -> u8 { (self.$base >> 8) as u8 }
        pub fn $setter8h(&mut self, value: u8) { self.$base = (self.$base & 0x00FF) | u16::from(value) << 8; }
        pub fn $getter8l(&self) -> u8 { self.$base as u8 }
        pub fn $setter8l(&mut self, value: u8) { self.$base = (self.$base & 0xFF00) | u16::from(value); }
    };
}

impl State {
    accessors!(ax: [ax/set_ax, ah/set_ah, al/set_al]);
    accessors!(bx: [bx/set_bx, bh/set_bh, bl/set_bl]);
    accessors!(cx: [cx/set_cx, ch/set_ch, cl/set_cl]);
    accessors!(dx: [dx/set_dx, dh/set_dh, dl/set_dl]);
    accessors!(si: [si/set_si]);
    accessors!(di: [di/set_di]);
    accessors!(bp: [bp/set_bp]);
    accessors!(sp: [sp/set_sp]);
    accessors!(ip: [ip/set_ip]);
    accessors!(es: [es/set_es]);
    accessors!(cs: [cs/set_cs]);
    accessors!(ss: [ss/set_ss]);
    accessors!(ds: [ds/set_ds]);

    /// Reads a general purpose register, zero-extended.
    pub fn get_register(&self, reg: Register) -> u16 {
        use crate::cpu::instr::Register::*;

        match reg {
            Al => self.al().into(),
            Cl => self.cl().into(),
            Dl => self.dl().into(),
            Bl => self.bl().into(),
            Ah => self.ah().into(),
            Ch => self.ch().into(),
            Dh => self.dh().into(),
            Bh => self.bh().into(),
            Ax => self.ax,
            Cx => self.cx,
            Dx => self.dx,
            Bx => self.bx,
            Sp => self.sp,
            Bp => self.bp,
            Si => self.si,
            Di => self.di,
        }
    }

    /// Writes a general purpose register. 8-bit registers take the low byte
    /// of `value`.
    pub fn set_register(&mut self, reg: Register, value: u16) {
        use crate::cpu::instr::Register::*;

        match reg {
            Al => self.set_al(value as u8),
            Cl => self.set_cl(value as u8),
            Dl => self.set_dl(value as u8),
            Bl => self.set_bl(value as u8),
            Ah => self.set_ah(value as u8),
            Ch => self.set_ch(value as u8),
            Dh => self.set_dh(value as u8),
            Bh => self.set_bh(value as u8),
            Ax => self.ax = value,
            Cx => self.cx = value,
            Dx => self.dx = value,
            Bx => self.bx = value,
            Sp => self.sp = value,
            Bp => self.bp = value,
            Si => self.si = value,
            Di => self.di = value,
        }
    }

    pub fn segment(&self, seg: Segment) -> u16 {
        match seg {
            Segment::Es => self.es,
            Segment::Cs => self.cs,
            Segment::Ss => self.ss,
            Segment::Ds => self.ds,
        }
    }

    pub fn set_segment(&mut self, seg: Segment, value: u16) {
        match seg {
            Segment::Es => self.es = value,
            Segment::Cs => self.cs = value,
            Segment::Ss => self.ss = value,
            Segment::Ds => self.ds = value,
        }
    }

    /// Address of the next instruction.
    pub fn cs_ip(&self) -> SegmentedAddress {
        SegmentedAddress::new(self.cs, self.ip)
    }

    /// Address of the top of the stack.
    pub fn ss_sp(&self) -> SegmentedAddress {
        SegmentedAddress::new(self.ss, self.sp)
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: Flags) {
        self.flags = flags;
    }

    /// Sets or clears all flags in `flags`.
    pub fn update_flags(&mut self, flags: Flags, value: bool) {
        self.flags.set(flags, value);
    }

    pub fn flag(&self, flag: Flags) -> bool {
        self.flags.contains(flag)
    }

    /// Whether the CPU keeps executing instructions.
    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        let mut state = State::new(SegmentedAddress::new(0x1000, 0x100), SegmentedAddress::new(0x1000, 0xFFFE));
        assert_eq!(state.ax(), 0);
        assert_eq!(state.ah(), 0);
        assert_eq!(state.al(), 0);
        state.set_ax(!0);
        assert_eq!(state.ax(), !0);
        assert_eq!(state.ah(), !0);
        assert_eq!(state.al(), !0);
        state.set_al(0);
        assert_eq!(state.ah(), !0);
        assert_eq!(state.al(), 0);
        state.set_ax(!0);
        state.set_ah(0);
        assert_eq!(state.ah(), 0);
        assert_eq!(state.al(), !0);
    }

    #[test]
    fn registers_by_name() {
        let mut state = State::new(SegmentedAddress::new(0x1000, 0x100), SegmentedAddress::new(0x2000, 0xFFFE));
        state.set_register(Register::Bx, 0x1234);
        assert_eq!(state.get_register(Register::Bh), 0x12);
        assert_eq!(state.get_register(Register::Bl), 0x34);
        state.set_register(Register::Dh, 0xABCD);
        assert_eq!(state.dx(), 0xCD00);
        assert_eq!(state.segment(Segment::Ds), 0x1000);
        assert_eq!(state.ss_sp(), SegmentedAddress::new(0x2000, 0xFFFE));
        assert_eq!(state.cs_ip().to_string(), "1000:0100");
        assert!(state.is_running());
    }
}
