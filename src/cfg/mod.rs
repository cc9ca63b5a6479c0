//! Control flow graph driven execution.
//!
//! `CfgCpu` executes one instruction at a time like a plain interpreter, but
//! takes its instructions from the node cache and links every executed node
//! to its actual successor. Straight-line code and loops therefore only pay
//! for decoding once, and a node's edges double as a record of where control
//! went from it.

pub mod cache;
pub mod context;
pub mod linker;
pub mod node;

use self::cache::NodeCache;
use self::context::{ContextId, ExecutionContextManager};
use self::linker::Linker;
use self::node::{Discriminant, InstructionNode, NodeId};
use crate::breakpoint::BreakpointError;
use crate::cpu::decode::DecoderError;
use crate::cpu::interpret::{Interpreter, InterpreterError};
use crate::cpu::{ExecutionEngine, Flags, State};
use crate::irq::InterruptRequests;
use crate::memory::Memory;
use crate::utils::NoDebug;

use std::error::Error;
use std::{fmt, io};

/// Callback invoked with the CPU state before each instruction executes.
pub type Tracer = Box<dyn FnMut(&State, &InstructionNode) + Send>;

#[derive(Debug)]
pub struct CfgCpu {
    interpreter: Interpreter,
    cache: NodeCache,
    linker: Linker,
    contexts: ExecutionContextManager,
    irqs: InterruptRequests,
    instructions: u64,
    tracer: Option<NoDebug<Tracer>>,
}

impl CfgCpu {
    pub fn new(interpreter: Interpreter) -> Self {
        Self {
            interpreter,
            cache: NodeCache::new(),
            linker: Linker::new(),
            contexts: ExecutionContextManager::new(),
            irqs: InterruptRequests::new(),
            instructions: 0,
            tracer: None,
        }
    }

    pub fn set_tracer(&mut self, tracer: Option<Tracer>) {
        self.tracer = tracer.map(NoDebug);
    }

    /// Executes the instruction at `CS:IP` and links it to its successor.
    ///
    /// Pending hardware interrupts are not delivered here, see
    /// `deliver_pending_interrupt`.
    pub fn step(&mut self) -> Result<(), StepError> {
        let addr = self.interpreter.next_address();
        self.cache.sync(self.interpreter.mem_mut());

        let cache = &self.cache;
        let predicted = self.contexts.current().next_by_graph()
            .filter(|&id| cache.get_valid(id).map_or(false, |n| n.address() == addr));
        let id = match predicted {
            Some(id) => id,
            None => self.cache.fetch_or_decode(self.interpreter.mem_mut(), addr)?,
        };

        let node = &self.cache[id];
        let (is_call, is_return) = (node.instr().is_call(), node.instr().is_return());
        if let Some(tracer) = &mut self.tracer {
            (tracer.0)(self.interpreter.state(), node);
        }

        let flow = self.interpreter.execute(node.instr(), node.len())?;
        self.instructions += 1;

        let next = match Discriminant::from_flow(flow) {
            Some(discriminant) => self.link(id, discriminant),
            None => None,
        };

        let ctx = self.contexts.current_mut();
        ctx.advance(id, next);
        if is_call {
            ctx.enter_call();
        } else if is_return {
            ctx.leave_call();
        }

        Ok(())
    }

    /// Enters the handler of a pending hardware interrupt if the CPU is
    /// running with interrupts enabled, and returns the handler's address.
    ///
    /// Must be called at an instruction boundary after the execute
    /// breakpoints at `CS:IP` were handled. A return breakpoint at the
    /// interrupted address has then already restored its context, which
    /// becomes the context the new handler returns to.
    pub fn deliver_pending_interrupt(&mut self) -> Result<Option<u32>, StepError> {
        let state = self.interpreter.state();
        if !state.is_running() || !state.flag(Flags::IF) {
            return Ok(None);
        }

        match self.irqs.take() {
            Some(vector) => {
                self.deliver_interrupt(vector)?;
                Ok(Some(self.interpreter.next_address()))
            }
            None => Ok(None),
        }
    }

    /// Resolves the successor of `from` at the current `CS:IP`.
    ///
    /// Failing to decode the successor is not an error yet: it is reported
    /// by the next `step` if control really gets there.
    fn link(&mut self, from: NodeId, discriminant: Discriminant) -> Option<NodeId> {
        let target = self.interpreter.next_address();
        match self.linker.resolve(&mut self.cache, self.interpreter.mem_mut(), from, discriminant, target) {
            Ok(next) => Some(next),
            Err(e) => {
                debug!("cannot link to {:#07X} yet: {}", target, e);
                None
            }
        }
    }

    /// Enters the handler for `vector` in a context of its own, returning to
    /// the interrupted instruction.
    fn deliver_interrupt(&mut self, vector: u8) -> Result<(), StepError> {
        let interrupted = self.interpreter.next_address();
        self.interpreter.interrupt(vector);
        let handler = self.interpreter.next_address();
        debug!("IRQ {:#04X}: {:#07X} interrupted, handler at {:#07X}", vector, interrupted, handler);
        self.signal_new_execution_context(handler, Some(interrupted))?;
        Ok(())
    }

    /// Switches to the execution context entered at `entry`.
    ///
    /// See `ExecutionContextManager::signal_new_execution_context`.
    pub fn signal_new_execution_context(
        &mut self,
        entry: u32,
        expected_return: Option<u32>,
    ) -> Result<ContextId, BreakpointError> {
        let breakpoints = self.interpreter.mem().breakpoints();
        self.contexts.signal_new_execution_context(entry, expected_return, breakpoints)
    }

    /// Queues a hardware interrupt. Returns `false` if it was already pending.
    pub fn raise_irq(&mut self, vector: u8) -> bool {
        self.irqs.raise(vector)
    }

    pub fn irqs_mut(&mut self) -> &mut InterruptRequests {
        &mut self.irqs
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    pub fn interpreter_mut(&mut self) -> &mut Interpreter {
        &mut self.interpreter
    }

    pub fn cache(&self) -> &NodeCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut NodeCache {
        &mut self.cache
    }

    pub fn linker(&self) -> &Linker {
        &self.linker
    }

    pub fn contexts(&self) -> &ExecutionContextManager {
        &self.contexts
    }

    pub fn contexts_mut(&mut self) -> &mut ExecutionContextManager {
        &mut self.contexts
    }

    /// Number of instructions executed so far.
    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    /// Writes every valid node with its disassembly and outgoing edges.
    pub fn write_graph<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
        let stats = self.cache.stats();
        writeln!(w, "; {} nodes, {} decodes, {} invalidations, {} edge hits, {} edge misses",
            self.cache.len(), stats.decodes, stats.invalidations, self.linker.hits(), self.linker.misses())?;

        for (_, node) in self.cache.valid_nodes() {
            writeln!(w, "{:05X}  {}", node.address(), node.instr())?;
            for edge in node.edges() {
                let stale = if self.cache.get_valid(edge.target).is_some() { "" } else { " (stale)" };
                writeln!(w, "         {:?} -> {:05X}{}", edge.discriminant, edge.target_address, stale)?;
            }
        }
        Ok(())
    }
}

impl ExecutionEngine for CfgCpu {
    type Error = StepError;

    fn state(&mut self) -> &mut State {
        self.interpreter.state_mut()
    }

    fn memory(&mut self) -> &mut Memory {
        self.interpreter.mem_mut()
    }

    fn step(&mut self) -> Result<(), StepError> {
        self.deliver_pending_interrupt()?;
        CfgCpu::step(self)
    }
}

/// Error aborting a single step.
#[derive(Debug)]
pub enum StepError {
    Decode(DecoderError),
    Interpreter(InterpreterError),
    Breakpoint(BreakpointError),
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StepError::Decode(e) => write!(f, "decode error: {}", e),
            StepError::Interpreter(e) => write!(f, "execution error: {}", e),
            StepError::Breakpoint(e) => write!(f, "breakpoint error: {}", e),
        }
    }
}

impl Error for StepError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StepError::Decode(e) => Some(e),
            StepError::Interpreter(e) => Some(e),
            StepError::Breakpoint(e) => Some(e),
        }
    }
}

impl From<DecoderError> for StepError {
    fn from(e: DecoderError) -> Self {
        StepError::Decode(e)
    }
}

impl From<InterpreterError> for StepError {
    fn from(e: InterpreterError) -> Self {
        StepError::Interpreter(e)
    }
}

impl From<BreakpointError> for StepError {
    fn from(e: BreakpointError) -> Self {
        StepError::Breakpoint(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::Breakpoints;
    use crate::io::IoPortDispatcher;
    use crate::memory::{SegmentedAddress, MIN_MEMORY_SIZE};
    use std::sync::{Arc, Mutex};

    fn cpu(code: &[u8]) -> CfgCpu {
        let bps = Arc::new(Breakpoints::new());
        let mut mem = Memory::new(MIN_MEMORY_SIZE, bps.clone()).unwrap();
        mem.load_block(0x10000, code);
        let state = State::new(SegmentedAddress::new(0x1000, 0), SegmentedAddress::new(0x2000, 0xFFFE));
        CfgCpu::new(Interpreter::new(state, mem, IoPortDispatcher::new(false, bps)))
    }

    #[test]
    fn loop_decodes_once() {
        // mov cx,5; l: nop; loop l; hlt
        let mut cpu = cpu(&[0xB9, 0x05, 0x00, 0x90, 0xE2, 0xFD, 0xF4]);
        cpu.run().unwrap();

        assert_eq!(cpu.interpreter().state().cx(), 0);
        assert_eq!(cpu.instructions(), 1 + 5 * 2 + 1);
        assert_eq!(cpu.cache().stats().decodes, 4);
        assert!(cpu.linker().hits() > 0);

        let lp = cpu.cache().node_at(0x10004).unwrap();
        let node = &cpu.cache()[lp];
        assert!(node.edge(Discriminant::Taken).is_some());
        assert!(node.edge(Discriminant::NotTaken).is_some());
    }

    #[test]
    fn tracks_call_depth() {
        // call +1; hlt; ret
        let mut cpu = cpu(&[0xE8, 0x01, 0x00, 0xF4, 0xC3]);
        cpu.step().unwrap();
        assert_eq!(cpu.contexts().current().depth(), 1);
        cpu.step().unwrap();
        assert_eq!(cpu.contexts().current().depth(), 0);
        cpu.step().unwrap();
        assert!(!cpu.interpreter().state().is_running());
    }

    #[test]
    fn self_modifying_code() {
        // mov byte [0x0009],0x41; nop x4; mov cx,0x9090; hlt
        // the first instruction turns `mov cx,0x9090` into `inc cx; nop; nop`
        let mut cpu = cpu(&[0xC6, 0x06, 0x09, 0x00, 0x41, 0x90, 0x90, 0x90, 0x90, 0xB9, 0x90, 0x90, 0xF4]);
        let old = cpu.cache.fetch_or_decode(cpu.interpreter.mem_mut(), 0x10009).unwrap();
        assert_eq!(cpu.cache[old].len(), 3);

        cpu.run().unwrap();
        assert_eq!(cpu.interpreter().state().cx(), 1);
        assert_eq!(cpu.instructions(), 9);
        assert_eq!(cpu.cache().stats().invalidations, 1);
        assert!(cpu.cache().get(old).is_none());
        let new = cpu.cache().node_at(0x10009).unwrap();
        assert_eq!(cpu.cache()[new].len(), 1);
    }

    #[test]
    fn irq_enters_handler_context() {
        // program at 1000:0000: sti; nop; nop; hlt
        // handler at 3000:0000: iret
        let mut cpu = cpu(&[0xFB, 0x90, 0x90, 0xF4]);
        {
            let mem = cpu.interpreter_mut().mem_mut();
            mem.write_u8(0x30000, 0xCF);
            mem.write_u16(8 * 4, 0x0000);
            mem.write_u16(8 * 4 + 2, 0x3000);
        }
        cpu.raise_irq(8);

        // masked until `sti` ran
        assert_eq!(cpu.deliver_pending_interrupt().unwrap(), None);
        cpu.step().unwrap();
        assert_eq!(cpu.deliver_pending_interrupt().unwrap(), Some(0x30000));
        let handler = cpu.contexts().current_id();
        assert_ne!(handler, ContextId::initial());
        assert_eq!(cpu.contexts().current().entry(), Some(0x30000));
        assert_eq!(cpu.interpreter().next_address(), 0x30000);
        assert_eq!(cpu.interpreter().mem().breakpoints().len(), 1);

        // iret returns to the interrupted address; the breakpoint there is
        // checked by the emulation loop, so apply it by hand
        cpu.step().unwrap();
        assert_eq!(cpu.interpreter().next_address(), 0x10001);
        assert_eq!(cpu.contexts().current_id(), handler);
        let bps = cpu.interpreter().mem().breakpoints().clone();
        bps.trigger_at(crate::breakpoint::BreakpointKind::Execute, 0x10001);
        for action in bps.take_pending() {
            if let crate::breakpoint::PendingAction::RestoreContext(id) = action {
                cpu.contexts_mut().restore(id);
            }
        }
        assert_eq!(cpu.contexts().current_id(), ContextId::initial());
    }

    #[test]
    fn irqs_wait_for_interrupt_flag() {
        let mut cpu = cpu(&[0x90, 0xF4]);
        cpu.raise_irq(8);
        cpu.run().unwrap();
        assert_eq!(cpu.irqs_mut().take(), Some(8));
        assert_eq!(cpu.contexts().len(), 1);
    }

    #[test]
    fn tracer_sees_every_instruction() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let mut cpu = cpu(&[0x90, 0x40, 0xF4]);
        cpu.set_tracer(Some(Box::new(move |state: &State, node: &InstructionNode| {
            s.lock().unwrap().push((state.ip(), node.len()));
        })));
        cpu.run().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(0, 1), (1, 1), (2, 1)]);
    }

    #[test]
    fn graph_dump() {
        let mut cpu = cpu(&[0x90, 0xF4]);
        cpu.run().unwrap();
        let mut out = Vec::new();
        cpu.write_graph(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("10000  nop"), "{}", out);
        assert!(out.contains("Fallthrough -> 10001"), "{}", out);
    }

    #[test]
    fn invalid_opcode_aborts_step() {
        let mut cpu = cpu(&[0x0F, 0x0B]);
        match cpu.step() {
            Err(StepError::Decode(DecoderError::InvalidOpcode { address: 0x10000, .. })) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }
}
