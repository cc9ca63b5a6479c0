//! Emulation of the 8086 real-mode CPU.

mod prefix;
mod flags;
mod state;
pub mod decode;
pub mod disasm;
pub mod instr;
pub mod interpret;
pub mod visit;
pub mod imm;

pub use self::flags::Flags;
pub use self::state::State;

use crate::memory::Memory;

/// Trait for CPU implementations / executors.
pub trait ExecutionEngine {
    type Error;

    /// Get a reference to the CPU's state.
    fn state(&mut self) -> &mut State;

    /// Get a reference to the memory.
    fn memory(&mut self) -> &mut Memory;

    /// Executes the next instruction, then returns control back to the caller.
    fn step(&mut self) -> Result<(), Self::Error>;

    /// Executes instructions until the CPU halts.
    ///
    /// This is equivalent to calling `step` in a loop, but may be faster. Any
    /// error returned by `step` is returned to the caller.
    fn run(&mut self) -> Result<(), Self::Error> {
        while self.state().is_running() {
            self.step()?;
        }
        Ok(())
    }
}
