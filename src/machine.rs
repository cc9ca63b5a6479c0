//! Assembling the emulated PC from its parts.

use crate::breakpoint::{BreakpointError, Breakpoints};
use crate::cfg::context::ContextId;
use crate::cfg::CfgCpu;
use crate::cpu::interpret::Interpreter;
use crate::cpu::State;
use crate::debugger::Debugger;
use crate::io::{IoPortDispatcher, IoPortHandler};
use crate::memory::{MapError, Memory, MemoryDevice, MemoryError, SegmentedAddress, MIN_MEMORY_SIZE};
use crate::timer::{NullTimer, Pit, Timer};
use crate::utils::NoDebug;

use std::error::Error;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Where an 8086 starts executing after reset.
pub const RESET_VECTOR: SegmentedAddress = SegmentedAddress::new(0xF000, 0xFFF0);

/// Machine construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// Size of RAM in bytes, at least `MIN_MEMORY_SIZE`.
    pub memory_size: usize,
    /// Initial state of the A20 gate.
    pub a20_enabled: bool,
    /// Abort on accesses to I/O ports without a handler.
    pub strict_io: bool,
    /// Install a PIT firing every this many instructions.
    pub timer_divisor: Option<u32>,
    /// Stop the emulation loop after this many instructions.
    pub instruction_limit: Option<u64>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory_size: MIN_MEMORY_SIZE,
            a20_enabled: false,
            strict_io: false,
            timer_divisor: None,
            instruction_limit: None,
        }
    }
}

#[derive(Debug)]
pub struct Machine {
    cpu: CfgCpu,
    timer: NoDebug<Box<dyn Timer>>,
    debugger: Debugger,
    config: MachineConfig,
}

impl Machine {
    /// Creates a machine with zeroed RAM, no devices and the CPU at the
    /// reset vector.
    pub fn new(config: MachineConfig) -> Result<Self, MachineError> {
        let breakpoints = Arc::new(Breakpoints::new());
        let mut mem = Memory::new(config.memory_size, breakpoints.clone())?;
        mem.set_a20(config.a20_enabled);
        let io = IoPortDispatcher::new(config.strict_io, breakpoints.clone());
        let state = State::new(RESET_VECTOR, SegmentedAddress::new(0, 0));

        let timer: Box<dyn Timer> = match config.timer_divisor {
            Some(divisor) => Box::new(Pit::new(divisor)),
            None => Box::new(NullTimer),
        };

        Ok(Self {
            cpu: CfgCpu::new(Interpreter::new(state, mem, io)),
            timer: NoDebug(timer),
            debugger: Debugger::new(breakpoints),
            config,
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn cpu(&self) -> &CfgCpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut CfgCpu {
        &mut self.cpu
    }

    pub fn state(&self) -> &State {
        self.cpu.interpreter().state()
    }

    pub fn state_mut(&mut self) -> &mut State {
        self.cpu.interpreter_mut().state_mut()
    }

    pub fn memory(&self) -> &Memory {
        self.cpu.interpreter().mem()
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        self.cpu.interpreter_mut().mem_mut()
    }

    /// A handle for controlling the machine, possibly from another thread.
    pub fn debugger(&self) -> &Debugger {
        &self.debugger
    }

    /// Lets `device` service all accesses to `range`.
    pub fn map_device(
        &mut self,
        range: RangeInclusive<u32>,
        name: &str,
        device: Box<dyn MemoryDevice>,
    ) -> Result<(), MachineError> {
        self.memory_mut().map_device(range, name, device)?;
        Ok(())
    }

    /// Routes the I/O `ports` to `handler`.
    pub fn register_io<I>(&mut self, ports: I, handler: Box<dyn IoPortHandler>)
    where I: IntoIterator<Item=u16> {
        self.cpu.interpreter_mut().io_mut().register(ports, handler);
    }

    /// Replaces the timer device.
    pub fn set_timer(&mut self, timer: Box<dyn Timer>) {
        self.timer = NoDebug(timer);
    }

    /// Advances the timer by one instruction.
    pub fn tick_timer(&mut self) {
        self.timer.0.tick(self.cpu.irqs_mut());
    }

    /// See `ExecutionContextManager::signal_new_execution_context`.
    pub fn signal_new_execution_context(
        &mut self,
        entry: u32,
        expected_return: Option<u32>,
    ) -> Result<ContextId, MachineError> {
        Ok(self.cpu.signal_new_execution_context(entry, expected_return)?)
    }
}

/// Error building or configuring a machine.
#[derive(Debug)]
pub enum MachineError {
    Memory(MemoryError),
    Map(MapError),
    Breakpoint(BreakpointError),
}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MachineError::Memory(e) => e.fmt(f),
            MachineError::Map(e) => write!(f, "cannot map device: {}", e),
            MachineError::Breakpoint(e) => e.fmt(f),
        }
    }
}

impl Error for MachineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MachineError::Memory(e) => Some(e),
            MachineError::Map(e) => Some(e),
            MachineError::Breakpoint(e) => Some(e),
        }
    }
}

impl From<MemoryError> for MachineError {
    fn from(e: MemoryError) -> Self {
        MachineError::Memory(e)
    }
}

impl From<MapError> for MachineError {
    fn from(e: MapError) -> Self {
        MachineError::Map(e)
    }
}

impl From<BreakpointError> for MachineError {
    fn from(e: BreakpointError) -> Self {
        MachineError::Breakpoint(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RamDevice;
    use crate::timer::PIT_VECTOR;

    #[test]
    fn defaults() {
        let machine = Machine::new(MachineConfig::default()).unwrap();
        assert_eq!(machine.state().cs_ip(), RESET_VECTOR);
        assert!(!machine.memory().a20_enabled());
        assert_eq!(machine.memory().size(), MIN_MEMORY_SIZE);
        assert_eq!(machine.cpu().contexts().len(), 1);
    }

    #[test]
    fn rejects_small_memory() {
        let config = MachineConfig { memory_size: 0x8_0000, ..MachineConfig::default() };
        match Machine::new(config) {
            Err(MachineError::Memory(MemoryError::TooSmall { .. })) => {}
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn device_window_takes_precedence() {
        let mut machine = Machine::new(MachineConfig::default()).unwrap();
        machine.memory_mut().write_u16(0xB8000, 0x1111);
        machine.map_device(0xB8000..=0xBFFFF, "vram", Box::new(RamDevice::new(0xB8000, 0x8000))).unwrap();
        assert_eq!(machine.memory_mut().read_u16(0xB8000), 0);
        machine.memory_mut().write_u16(0xB8000, 0x0741);
        assert_eq!(machine.memory_mut().read_u16(0xB8000), 0x0741);

        match machine.map_device(0xBC000..=0xBCFFF, "other", Box::new(RamDevice::new(0xBC000, 0x1000))) {
            Err(MachineError::Map(MapError::Overlap { existing })) => assert_eq!(existing, "vram"),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn timer_raises_irq() {
        let config = MachineConfig { timer_divisor: Some(2), ..MachineConfig::default() };
        let mut machine = Machine::new(config).unwrap();
        machine.tick_timer();
        assert!(machine.cpu_mut().irqs_mut().is_empty());
        machine.tick_timer();
        assert_eq!(machine.cpu_mut().irqs_mut().take(), Some(PIT_VECTOR));
    }
}
