//! The emulation loop.
//!
//! Each iteration checks the breakpoints due at `CS:IP`, takes a pending
//! hardware interrupt, waits while paused, executes one instruction and ticks
//! the timer. Breakpoint actions queued by
//! the registry are applied at the instruction boundaries around the step, so
//! their effects are visible to the very next iteration.

use crate::breakpoint::PendingAction;
use crate::cfg::StepError;
use crate::debugger::Debugger;
use crate::machine::Machine;
use crate::memory::SegmentedAddress;

use std::error::Error;
use std::fmt;
use std::time::{Duration, Instant};

/// Why the loop returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The CPU executed `hlt`.
    Halted,
    /// A stop was requested through `RunControl`.
    Stopped,
    /// The configured instruction limit was reached.
    LimitReached,
}

/// Outcome of a finished run.
#[derive(Debug, Copy, Clone)]
pub struct RunReport {
    pub reason: StopReason,
    /// Instructions executed during this run.
    pub instructions: u64,
    pub elapsed: Duration,
}

impl RunReport {
    /// Instructions per second.
    pub fn ips(&self) -> f64 {
        let secs = self.elapsed.as_secs() as f64 + f64::from(self.elapsed.subsec_nanos()) * 1e-9;
        if secs == 0.0 {
            0.0
        } else {
            self.instructions as f64 / secs
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} after {} instructions in {:?} ({:.0} IPS)",
            self.reason, self.instructions, self.elapsed, self.ips())
    }
}

#[derive(Debug)]
pub struct EmulationLoop;

impl EmulationLoop {
    /// Runs `machine` until it halts, is stopped or reaches its instruction
    /// limit.
    ///
    /// Any error aborts the run and is returned together with the address of
    /// the instruction that caused it. The debugger's machine stop hook runs
    /// in all cases; the initial execution context is closed after a halt.
    pub fn run(machine: &mut Machine) -> Result<RunReport, EmulationError> {
        let debugger = machine.debugger().clone();
        let control = debugger.control().clone();
        let limit = machine.config().instruction_limit;
        let first = machine.cpu().instructions();
        let stopwatch = Instant::now();
        debugger.on_machine_start();

        info!("starting emulation at {}", machine.state().cs_ip());
        let result = loop {
            if !machine.state().is_running() {
                break Ok(StopReason::Halted);
            }
            if control.stop_requested() {
                break Ok(StopReason::Stopped);
            }

            let addr = machine.cpu().interpreter().next_address();
            debugger.check_breakpoint(addr, machine.cpu().instructions());
            apply_pending(machine, &debugger);

            // after the return breakpoints at CS:IP restored their context
            match machine.cpu_mut().deliver_pending_interrupt() {
                Ok(Some(handler)) => {
                    debugger.check_execute(handler);
                    apply_pending(machine, &debugger);
                }
                Ok(None) => {}
                Err(source) => break Err(EmulationError {
                    at: machine.state().cs_ip(),
                    instructions: machine.cpu().instructions(),
                    source,
                }),
            }

            if !control.wait_if_paused() {
                break Ok(StopReason::Stopped);
            }

            let at = machine.state().cs_ip();
            if let Err(source) = machine.cpu_mut().step() {
                break Err(EmulationError {
                    at,
                    instructions: machine.cpu().instructions(),
                    source,
                });
            }
            apply_pending(machine, &debugger);
            control.instruction_retired();
            machine.tick_timer();

            if let Some(limit) = limit {
                if machine.cpu().instructions() - first >= limit {
                    break Ok(StopReason::LimitReached);
                }
            }
        };

        debugger.on_machine_stop();
        let reason = match result {
            Ok(reason) => reason,
            Err(e) => {
                info!("emulation aborted: {}", e);
                return Err(e);
            }
        };
        if reason == StopReason::Halted {
            machine.cpu_mut().contexts_mut().close_initial();
        }

        let report = RunReport {
            reason,
            instructions: machine.cpu().instructions() - first,
            elapsed: stopwatch.elapsed(),
        };
        info!("{}", report);
        Ok(report)
    }
}

/// Applies the breakpoint actions the registry could not perform itself.
fn apply_pending(machine: &mut Machine, debugger: &Debugger) {
    for action in debugger.breakpoints().take_pending() {
        match action {
            PendingAction::Pause => {
                debug!("breakpoint hit at {}, pausing", machine.state().cs_ip());
                debugger.control().request_pause();
            }
            PendingAction::RestoreContext(id) => {
                if !machine.cpu_mut().contexts_mut().restore(id) {
                    warn!("return breakpoint refers to unknown context {}", id);
                }
            }
        }
    }
}

/// A run aborted by an unrecoverable error.
#[derive(Debug)]
pub struct EmulationError {
    /// Address of the instruction that failed.
    pub at: SegmentedAddress,
    /// Instructions completed before the failure.
    pub instructions: u64,
    pub source: StepError,
}

impl fmt::Display for EmulationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "at {} after {} instructions: {}", self.at, self.instructions, self.source)
    }
}

impl Error for EmulationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::{Breakpoint, BreakpointKind, BreakpointTarget};
    use crate::cfg::context::ContextId;
    use crate::cpu::decode::DecoderError;
    use crate::cpu::State;
    use crate::machine::MachineConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn machine(config: MachineConfig, code: &[u8]) -> Machine {
        let mut machine = Machine::new(config).unwrap();
        machine.memory_mut().load_block(0x10000, code);
        *machine.state_mut() = State::new(SegmentedAddress::new(0x1000, 0), SegmentedAddress::new(0x2000, 0xFFFE));
        machine
    }

    #[test]
    fn runs_until_halt() {
        // mov cx,3; l: loop l; hlt
        let mut m = machine(MachineConfig::default(), &[0xB9, 0x03, 0x00, 0xE2, 0xFE, 0xF4]);
        let report = EmulationLoop::run(&mut m).unwrap();
        assert_eq!(report.reason, StopReason::Halted);
        assert_eq!(report.instructions, 5);
        assert!(m.cpu().contexts().is_initial_closed());
        assert!(m.debugger().has_stopped());

        // the machine stays halted
        let again = EmulationLoop::run(&mut m).unwrap();
        assert_eq!(again.instructions, 0);
    }

    #[test]
    fn machine_stop_fires_every_run() {
        let config = MachineConfig { instruction_limit: Some(3), ..MachineConfig::default() };
        let mut m = machine(config, &[0xEB, 0xFE]);
        let stops = Arc::new(AtomicUsize::new(0));
        let s = stops.clone();
        m.debugger().add_breakpoint(Breakpoint::new(BreakpointKind::MachineStop, BreakpointTarget::Always)
            .with_callback(move |_| { s.fetch_add(1, Ordering::SeqCst); })).unwrap();

        EmulationLoop::run(&mut m).unwrap();
        EmulationLoop::run(&mut m).unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 2);
        assert_eq!(m.cpu().instructions(), 6);
    }

    #[test]
    fn interrupt_during_handler_returns_to_caller_context() {
        // 1000:0000: sti; nop x8; hlt
        // 2000:0000: nop; iret
        let config = MachineConfig { instruction_limit: Some(1), ..MachineConfig::default() };
        let mut code = vec![0xFB];
        code.extend_from_slice(&[0x90; 8]);
        code.push(0xF4);
        let mut m = machine(config, &code);
        m.memory_mut().load_block(0x20000, &[0x90, 0xCF]);
        m.memory_mut().write_u16(8 * 4, 0x0000);
        m.memory_mut().write_u16(8 * 4 + 2, 0x2000);

        EmulationLoop::run(&mut m).unwrap();
        assert!(m.cpu_mut().raise_irq(8));
        // enters the handler and runs its `nop`
        EmulationLoop::run(&mut m).unwrap();
        let handler = m.cpu().contexts().current_id();
        assert_ne!(handler, ContextId::initial());
        assert_eq!(m.state().cs_ip(), SegmentedAddress::new(0x2000, 1));

        // the next request arrives while the handler is still running
        assert!(m.cpu_mut().raise_irq(8));
        EmulationLoop::run(&mut m).unwrap();
        assert_eq!(m.state().cs_ip(), SegmentedAddress::new(0x1000, 1));
        assert_eq!(m.cpu().contexts().current_id(), handler);

        // the return breakpoint restores the caller before the second entry,
        // which then returns to the caller again
        EmulationLoop::run(&mut m).unwrap();
        assert_eq!(m.state().cs_ip(), SegmentedAddress::new(0x2000, 1));
        assert_eq!(m.cpu().contexts().current_id(), handler);
        EmulationLoop::run(&mut m).unwrap();
        assert_eq!(m.state().cs_ip(), SegmentedAddress::new(0x1000, 1));
        EmulationLoop::run(&mut m).unwrap();
        assert_eq!(m.state().cs_ip(), SegmentedAddress::new(0x1000, 2));
        assert_eq!(m.cpu().contexts().current_id(), ContextId::initial());
        assert!(m.debugger().breakpoints().is_empty());

        let report = EmulationLoop::run(&mut m).unwrap();
        assert_eq!(report.reason, StopReason::LimitReached);
        assert_eq!(m.cpu().contexts().current_id(), ContextId::initial());
        assert_eq!(m.cpu().contexts().get(handler).unwrap().entries(), 2);
    }

    #[test]
    fn instruction_limit() {
        let config = MachineConfig { instruction_limit: Some(100), ..MachineConfig::default() };
        let mut m = machine(config, &[0xEB, 0xFE]);
        let report = EmulationLoop::run(&mut m).unwrap();
        assert_eq!(report.reason, StopReason::LimitReached);
        assert_eq!(report.instructions, 100);
        assert!(!m.cpu().contexts().is_initial_closed());
    }

    #[test]
    fn errors_carry_location() {
        let mut m = machine(MachineConfig::default(), &[0x90, 0x90, 0x0F, 0x0B]);
        let err = EmulationLoop::run(&mut m).unwrap_err();
        assert_eq!(err.at, SegmentedAddress::new(0x1000, 2));
        assert_eq!(err.instructions, 2);
        match err.source {
            StepError::Decode(DecoderError::InvalidOpcode { address: 0x10002, .. }) => {}
            ref other => panic!("unexpected error {:?}", other),
        }
        assert!(m.debugger().has_stopped());
    }

    #[test]
    fn cycles_breakpoint_pauses() {
        let config = MachineConfig { instruction_limit: Some(50), ..MachineConfig::default() };
        let mut m = machine(config, &[0xEB, 0xFE]);
        let dbg = m.debugger().clone();
        dbg.add_breakpoint(Breakpoint::new(BreakpointKind::Cycles, BreakpointTarget::Address(10))).unwrap();

        // stop instead of blocking forever once the breakpoint pauses
        let stopper = dbg.clone();
        dbg.add_breakpoint(Breakpoint::new(BreakpointKind::Cycles, BreakpointTarget::Address(10))
            .with_callback(move |_| stopper.stop())).unwrap();

        let report = EmulationLoop::run(&mut m).unwrap();
        assert_eq!(report.reason, StopReason::Stopped);
        assert_eq!(report.instructions, 10);
        assert!(dbg.control().is_paused());
    }
}
