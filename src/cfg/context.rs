//! Execution contexts: one logical flow of control per entry point.
//!
//! The outermost program runs in the initial context. Every interrupt handler
//! (or any other code a caller declares as an entry point) gets a context of
//! its own, keyed by the handler's physical address. Entering a context
//! registers a one-shot execute breakpoint on the expected return address
//! that switches back to the context that was active before.
//!
//! Contexts are never destroyed. A context whose return address is never
//! reached stays dormant, and so does its return breakpoint.

use crate::breakpoint::{
    Breakpoint, BreakpointAction, BreakpointError, BreakpointKind, BreakpointTarget, Breakpoints,
};
use crate::cfg::node::NodeId;

use std::collections::HashMap;
use std::fmt;

/// Identifies an execution context.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(usize);

impl ContextId {
    /// The context the machine starts in.
    pub fn initial() -> Self {
        ContextId(0)
    }

    pub fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

#[derive(Debug)]
pub struct ExecutionContext {
    id: ContextId,
    /// Physical address the context was entered at. `None` for the initial
    /// context, which is never looked up by address.
    entry: Option<u32>,
    last_executed: Option<NodeId>,
    next_by_graph: Option<NodeId>,
    /// Calls minus returns executed since the context was last entered.
    depth: u32,
    entries: u64,
}

impl ExecutionContext {
    fn new(id: ContextId, entry: Option<u32>) -> Self {
        Self {
            id,
            entry,
            last_executed: None,
            next_by_graph: None,
            depth: 0,
            entries: 0,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn entry(&self) -> Option<u32> {
        self.entry
    }

    /// The node executed last in this context.
    pub fn last_executed(&self) -> Option<NodeId> {
        self.last_executed
    }

    /// The node the graph predicts to run next in this context.
    pub fn next_by_graph(&self) -> Option<NodeId> {
        self.next_by_graph
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// How often the context was entered through `signal_new_execution_context`.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Whether nothing was executed since the context was (re-)entered.
    pub fn is_fresh(&self) -> bool {
        self.last_executed.is_none()
    }

    /// Records that `node` was executed and `next` is expected to follow it.
    pub fn advance(&mut self, node: NodeId, next: Option<NodeId>) {
        self.last_executed = Some(node);
        self.next_by_graph = next;
    }

    pub fn enter_call(&mut self) {
        self.depth += 1;
    }

    /// Returns out of the context's entry function do not underflow.
    pub fn leave_call(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn reset(&mut self) {
        self.last_executed = None;
        self.next_by_graph = None;
        self.depth = 0;
    }
}

#[derive(Debug)]
pub struct ExecutionContextManager {
    /// Indexed by `ContextId`. Slot 0 is the initial context.
    contexts: Vec<ExecutionContext>,
    by_entry: HashMap<u32, ContextId>,
    current: ContextId,
    initial_closed: bool,
}

impl Default for ExecutionContextManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContextManager {
    /// Creates a manager holding only the initial context, which is current.
    pub fn new() -> Self {
        Self {
            contexts: vec![ExecutionContext::new(ContextId::initial(), None)],
            by_entry: HashMap::new(),
            current: ContextId::initial(),
            initial_closed: false,
        }
    }

    /// Enters the context keyed by `entry`, creating it on first use.
    ///
    /// The context's graph position is cleared even if it was entered before.
    /// If `expected_return` is given, a one-shot execute breakpoint at that
    /// address makes the previously current context current again.
    ///
    /// Entering an address whose context is still waiting for its return
    /// reuses that same context.
    pub fn signal_new_execution_context(
        &mut self,
        entry: u32,
        expected_return: Option<u32>,
        breakpoints: &Breakpoints,
    ) -> Result<ContextId, BreakpointError> {
        let previous = self.current;
        if let Some(ret) = expected_return {
            breakpoints.insert(
                Breakpoint::new(BreakpointKind::Execute, BreakpointTarget::Address(ret))
                    .one_shot()
                    .with_action(BreakpointAction::RestoreContext(previous))
            )?;
        }

        let id = match self.by_entry.get(&entry) {
            Some(&id) => id,
            None => {
                let id = ContextId(self.contexts.len());
                self.contexts.push(ExecutionContext::new(id, Some(entry)));
                self.by_entry.insert(entry, id);
                debug!("new execution context {} at {:#07X}", id, entry);
                id
            }
        };

        let ctx = &mut self.contexts[id.0];
        ctx.reset();
        ctx.entries += 1;
        self.current = id;
        debug!("entering {} at {:#07X} from {}{}", id, entry, previous,
            expected_return.map(|r| format!(", returning to {:#07X}", r)).unwrap_or_default());
        Ok(id)
    }

    /// Makes `id` the current context.
    ///
    /// Returns `false` if no such context exists.
    pub fn restore(&mut self, id: ContextId) -> bool {
        if id.0 >= self.contexts.len() {
            return false;
        }

        debug!("restoring {} (was {})", id, self.current);
        self.current = id;
        true
    }

    /// Tears down the outermost context after the program ended.
    ///
    /// Only the first call has an effect and returns `true`.
    pub fn close_initial(&mut self) -> bool {
        if self.initial_closed {
            return false;
        }

        self.initial_closed = true;
        let initial = &self.contexts[0];
        debug!("closing initial context (depth {}, {} contexts total)", initial.depth, self.contexts.len());
        true
    }

    pub fn is_initial_closed(&self) -> bool {
        self.initial_closed
    }

    pub fn current_id(&self) -> ContextId {
        self.current
    }

    pub fn current(&self) -> &ExecutionContext {
        &self.contexts[self.current.0]
    }

    pub fn current_mut(&mut self) -> &mut ExecutionContext {
        &mut self.contexts[self.current.0]
    }

    pub fn initial(&self) -> &ExecutionContext {
        &self.contexts[0]
    }

    pub fn get(&self, id: ContextId) -> Option<&ExecutionContext> {
        self.contexts.get(id.0)
    }

    /// The context entered at `entry`, if there is one.
    pub fn lookup(&self, entry: u32) -> Option<ContextId> {
        self.by_entry.get(&entry).cloned()
    }

    /// Number of contexts, including the initial one.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item=&ExecutionContext> {
        self.contexts.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::PendingAction;
    use generational_arena::Arena;

    #[test]
    fn starts_in_initial_context() {
        let mgr = ExecutionContextManager::new();
        assert_eq!(mgr.current_id(), ContextId::initial());
        assert_eq!(mgr.current().entry(), None);
        assert!(mgr.current().is_fresh());
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn signal_resets_transient_state() {
        let bps = Breakpoints::new();
        let mut arena = Arena::new();
        let node = arena.insert(());

        let mut mgr = ExecutionContextManager::new();
        let id = mgr.signal_new_execution_context(0x10000, None, &bps).unwrap();
        assert_eq!(mgr.current_id(), id);
        mgr.current_mut().advance(node, Some(node));
        mgr.current_mut().enter_call();
        assert!(!mgr.current().is_fresh());

        mgr.restore(ContextId::initial());
        let again = mgr.signal_new_execution_context(0x10000, None, &bps).unwrap();
        assert_eq!(again, id);
        let ctx = mgr.current();
        assert_eq!(ctx.entry(), Some(0x10000));
        assert_eq!(ctx.last_executed(), None);
        assert_eq!(ctx.next_by_graph(), None);
        assert_eq!(ctx.depth(), 0);
        assert_eq!(ctx.entries(), 2);
        assert!(bps.is_empty());
    }

    #[test]
    fn return_breakpoint_restores_once() {
        let bps = Breakpoints::new();
        let mut mgr = ExecutionContextManager::new();
        let outer = mgr.signal_new_execution_context(0x20000, None, &bps).unwrap();
        let inner = mgr.signal_new_execution_context(0x10000, Some(0x10010), &bps).unwrap();
        assert_ne!(outer, inner);
        assert_eq!(bps.len(), 1);

        assert_eq!(bps.trigger_at(BreakpointKind::Execute, 0x10010), 1);
        for action in bps.take_pending() {
            if let PendingAction::RestoreContext(id) = action {
                assert!(mgr.restore(id));
            }
        }
        assert_eq!(mgr.current_id(), outer);
        assert!(bps.is_empty());

        assert_eq!(bps.trigger_at(BreakpointKind::Execute, 0x10010), 0);
        assert!(bps.take_pending().is_empty());
        assert_eq!(mgr.current_id(), outer);
    }

    #[test]
    fn reentry_aliases_context() {
        let bps = Breakpoints::new();
        let mut mgr = ExecutionContextManager::new();
        let first = mgr.signal_new_execution_context(0x10000, Some(0x500), &bps).unwrap();
        let second = mgr.signal_new_execution_context(0x10000, Some(0x10005), &bps).unwrap();
        assert_eq!(first, second);
        assert_eq!(mgr.len(), 2);
        assert_eq!(bps.len(), 2);

        // the inner return restores the aliased context itself
        bps.trigger_at(BreakpointKind::Execute, 0x10005);
        assert_eq!(bps.take_pending(), vec![PendingAction::RestoreContext(first)]);
        bps.trigger_at(BreakpointKind::Execute, 0x500);
        assert_eq!(bps.take_pending(), vec![PendingAction::RestoreContext(ContextId::initial())]);
    }

    #[test]
    fn unreached_return_leaves_breakpoint() {
        let bps = Breakpoints::new();
        let mut mgr = ExecutionContextManager::new();
        mgr.signal_new_execution_context(0x10000, Some(0x10010), &bps).unwrap();
        mgr.signal_new_execution_context(0x30000, None, &bps).unwrap();
        assert_eq!(bps.len(), 1);
        assert_eq!(mgr.lookup(0x10000).and_then(|id| mgr.get(id)).map(|c| c.entries()), Some(1));
    }

    #[test]
    fn close_initial_runs_once() {
        let mut mgr = ExecutionContextManager::new();
        assert!(mgr.close_initial());
        assert!(!mgr.close_initial());
        assert!(mgr.is_initial_closed());
    }

    #[test]
    fn restore_unknown_context() {
        let mut mgr = ExecutionContextManager::new();
        assert!(!mgr.restore(ContextId(3)));
        assert_eq!(mgr.current_id(), ContextId::initial());
    }

    #[test]
    fn call_depth_saturates() {
        let mut mgr = ExecutionContextManager::new();
        let ctx = mgr.current_mut();
        ctx.leave_call();
        ctx.enter_call();
        ctx.enter_call();
        ctx.leave_call();
        assert_eq!(ctx.depth(), 1);
    }
}
