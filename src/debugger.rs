//! Bridge between the emulation loop and a debugger front end.
//!
//! A `Debugger` is a cheap handle that can be cloned and moved to another
//! thread. Front ends use it to manage breakpoints and to pause, step or stop
//! the machine; the emulation loop uses the same handle to check breakpoints
//! before each instruction and to report that the machine stopped.

use crate::breakpoint::{Breakpoint, BreakpointError, BreakpointId, BreakpointKind, Breakpoints};
use crate::control::RunControl;
use crate::cpu::State;

use std::convert::TryFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Debugger {
    breakpoints: Arc<Breakpoints>,
    control: Arc<RunControl>,
    stopped: Arc<AtomicBool>,
}

impl Debugger {
    pub fn new(breakpoints: Arc<Breakpoints>) -> Self {
        Self {
            breakpoints,
            control: Arc::new(RunControl::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn breakpoints(&self) -> &Arc<Breakpoints> {
        &self.breakpoints
    }

    pub fn control(&self) -> &Arc<RunControl> {
        &self.control
    }

    pub fn add_breakpoint(&self, breakpoint: Breakpoint) -> Result<BreakpointId, BreakpointError> {
        self.breakpoints.insert(breakpoint)
    }

    /// Enables or disables a breakpoint. Returns `false` if it does not exist.
    pub fn toggle_breakpoint(&self, id: BreakpointId, enabled: bool) -> bool {
        self.breakpoints.toggle(id, enabled)
    }

    pub fn remove_breakpoint(&self, id: BreakpointId) -> bool {
        self.breakpoints.remove(id).is_some()
    }

    /// Fires the breakpoints due before executing the instruction at
    /// `address` after `instructions` instructions have completed.
    ///
    /// `Cycles` breakpoints target 32-bit counts, so none of them fire once
    /// more than `u32::MAX` instructions have completed.
    ///
    /// Returns the number of breakpoints that fired.
    pub fn check_breakpoint(&self, address: u32, instructions: u64) -> usize {
        let mut fired = self.check_execute(address);
        if self.breakpoints.is_armed(BreakpointKind::Cycles) {
            if let Ok(count) = u32::try_from(instructions) {
                fired += self.breakpoints.trigger_at(BreakpointKind::Cycles, count);
            }
        }
        fired
    }

    /// Fires only the execute breakpoints at `address`.
    ///
    /// Used when control moves without an instruction completing, like on
    /// interrupt entry.
    pub fn check_execute(&self, address: u32) -> usize {
        self.breakpoints.trigger_at(BreakpointKind::Execute, address)
    }

    /// Reports that the emulation loop started, rearming `on_machine_stop`.
    pub fn on_machine_start(&self) {
        self.stopped.store(false, Ordering::Release);
    }

    /// Reports that the emulation loop exited.
    ///
    /// `MachineStop` breakpoints fire on the first call after each
    /// `on_machine_start`; later calls return `false`.
    pub fn on_machine_stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.breakpoints.trigger(BreakpointKind::MachineStop, 0..=0, None);
        true
    }

    pub fn has_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        self.control.request_pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn step(&self, count: u64) {
        self.control.step(count);
    }

    pub fn stop(&self) {
        self.control.request_stop();
    }

    /// Copies the register file out of `state`.
    pub fn read_registers(state: &State) -> Registers {
        Registers {
            ax: state.ax(),
            bx: state.bx(),
            cx: state.cx(),
            dx: state.dx(),
            si: state.si(),
            di: state.di(),
            bp: state.bp(),
            sp: state.sp(),
            ip: state.ip(),
            flags: state.flags().to_word(),
            cs: state.cs(),
            ss: state.ss(),
            ds: state.ds(),
            es: state.es(),
        }
    }
}

/// A snapshot of the CPU registers, as shown by debugger front ends.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Registers {
    pub ax: u16,
    pub bx: u16,
    pub cx: u16,
    pub dx: u16,
    pub si: u16,
    pub di: u16,
    pub bp: u16,
    pub sp: u16,
    pub ip: u16,
    pub flags: u16,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::{BreakpointTarget, PendingAction};
    use crate::memory::SegmentedAddress;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn execute_and_cycles() {
        let dbg = Debugger::new(Arc::new(Breakpoints::new()));
        dbg.add_breakpoint(Breakpoint::new(BreakpointKind::Execute, BreakpointTarget::Address(0x10010))).unwrap();
        let cycles = dbg.add_breakpoint(Breakpoint::new(BreakpointKind::Cycles, BreakpointTarget::Address(100))).unwrap();

        assert_eq!(dbg.check_breakpoint(0x10000, 99), 0);
        assert_eq!(dbg.check_breakpoint(0x10010, 100), 2);
        assert_eq!(dbg.breakpoints().take_pending(), vec![PendingAction::Pause, PendingAction::Pause]);

        assert!(dbg.toggle_breakpoint(cycles, false));
        assert_eq!(dbg.check_breakpoint(0x10000, 100), 0);
        assert!(dbg.remove_breakpoint(cycles));
        assert!(!dbg.remove_breakpoint(cycles));
    }

    #[test]
    fn cycles_do_not_wrap() {
        let dbg = Debugger::new(Arc::new(Breakpoints::new()));
        dbg.add_breakpoint(Breakpoint::new(BreakpointKind::Cycles, BreakpointTarget::Address(10))).unwrap();

        assert_eq!(dbg.check_breakpoint(0, (1 << 32) + 10), 0);
        assert_eq!(dbg.check_breakpoint(0, u64::from(u32::MAX) + 1), 0);
        assert_eq!(dbg.check_breakpoint(0, 10), 1);
    }

    #[test]
    fn check_execute_ignores_cycles() {
        let dbg = Debugger::new(Arc::new(Breakpoints::new()));
        dbg.add_breakpoint(Breakpoint::new(BreakpointKind::Cycles, BreakpointTarget::Address(0))).unwrap();
        dbg.add_breakpoint(Breakpoint::new(BreakpointKind::Execute, BreakpointTarget::Address(0xF0000))).unwrap();

        assert_eq!(dbg.check_execute(0xF0000), 1);
        assert_eq!(dbg.breakpoints().take_pending(), vec![PendingAction::Pause]);
    }

    #[test]
    fn machine_stop_fires_once() {
        let dbg = Debugger::new(Arc::new(Breakpoints::new()));
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        dbg.add_breakpoint(Breakpoint::new(BreakpointKind::MachineStop, BreakpointTarget::Always)
            .with_callback(move |_| { c.fetch_add(1, Ordering::SeqCst); })).unwrap();

        let other = dbg.clone();
        assert!(dbg.on_machine_stop());
        assert!(!other.on_machine_stop());
        assert!(other.has_stopped());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        other.on_machine_start();
        assert!(!dbg.has_stopped());
        assert!(dbg.on_machine_stop());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clones_share_run_control() {
        let dbg = Debugger::new(Arc::new(Breakpoints::new()));
        let front_end = dbg.clone();
        front_end.pause();
        assert!(dbg.control().is_paused());
        front_end.stop();
        assert!(!dbg.control().wait_if_paused());
    }

    #[test]
    fn register_snapshot() {
        let mut state = State::new(SegmentedAddress::new(0x1000, 0x100), SegmentedAddress::new(0x2000, 0xFFFE));
        state.set_ax(0x1234);
        let regs = Debugger::read_registers(&state);
        assert_eq!(regs.ax, 0x1234);
        assert_eq!(regs.cs, 0x1000);
        assert_eq!(regs.ds, 0x1000);
        assert_eq!((regs.ss, regs.sp), (0x2000, 0xFFFE));
        assert_eq!(regs.ip, 0x100);
    }
}
