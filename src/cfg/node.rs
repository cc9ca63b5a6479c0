//! Instruction nodes and their outgoing edges.

use crate::cpu::instr::Instr;
use crate::cpu::interpret::Flow;

use generational_arena::Index;

/// Handle of a node in the `NodeCache` arena.
///
/// Handles of replaced nodes go stale: looking them up fails instead of
/// yielding the replacement.
pub type NodeId = Index;

/// Which runtime outcome of an instruction an edge stands for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Discriminant {
    /// Continued with the next instruction in memory.
    Fallthrough,
    /// Conditional branch taken, or an unconditional direct transfer.
    Taken,
    /// Conditional branch not taken.
    NotTaken,
    /// Target computed at runtime (indirect jump or call, return,
    /// interrupt). Only reused while the computed target stays the same.
    Dynamic,
}

impl Discriminant {
    /// The edge kind taken for an execution outcome, or `None` if control
    /// does not continue (the CPU halted).
    pub fn from_flow(flow: Flow) -> Option<Self> {
        match flow {
            Flow::Sequential => Some(Discriminant::Fallthrough),
            Flow::Branch { taken: true } | Flow::Direct => Some(Discriminant::Taken),
            Flow::Branch { taken: false } => Some(Discriminant::NotTaken),
            Flow::Indirect => Some(Discriminant::Dynamic),
            Flow::Halt => None,
        }
    }
}

/// A control flow edge observed at runtime.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Edge {
    pub discriminant: Discriminant,
    /// Physical address of the successor when the edge was created.
    pub target_address: u32,
    pub target: NodeId,
}

/// A decoded instruction at a physical address.
#[derive(Debug)]
pub struct InstructionNode {
    address: u32,
    len: u32,
    instr: Instr,
    /// At most one edge per discriminant.
    edges: Vec<Edge>,
    valid: bool,
}

impl InstructionNode {
    pub fn new(address: u32, len: u32, instr: Instr) -> Self {
        Self {
            address,
            len,
            instr,
            edges: Vec::new(),
            valid: true,
        }
    }

    pub fn address(&self) -> u32 {
        self.address
    }

    /// Length of the encoded instruction in bytes.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Address of the first byte after the instruction.
    pub fn end(&self) -> u32 {
        self.address.wrapping_add(self.len)
    }

    /// Whether `addr` is one of the instruction's bytes.
    pub fn contains(&self, addr: u32) -> bool {
        addr.wrapping_sub(self.address) < self.len
    }

    pub fn instr(&self) -> &Instr {
        &self.instr
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge(&self, discriminant: Discriminant) -> Option<&Edge> {
        self.edges.iter().find(|e| e.discriminant == discriminant)
    }

    /// Adds `edge`, replacing an existing edge with the same discriminant.
    pub fn set_edge(&mut self, edge: Edge) {
        match self.edges.iter_mut().find(|e| e.discriminant == edge.discriminant) {
            Some(existing) => *existing = edge,
            None => self.edges.push(edge),
        }
    }

    /// Whether the bytes the node was decoded from are unchanged.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub(crate) fn invalidate(&mut self) {
        self.valid = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use generational_arena::Arena;

    #[test]
    fn edges_are_replaced_per_discriminant() {
        let mut arena = Arena::new();
        let a = arena.insert(());
        let b = arena.insert(());

        let mut node = InstructionNode::new(0x10000, 2, Instr::Nop);
        node.set_edge(Edge { discriminant: Discriminant::Taken, target_address: 0x10010, target: a });
        node.set_edge(Edge { discriminant: Discriminant::NotTaken, target_address: 0x10002, target: b });
        node.set_edge(Edge { discriminant: Discriminant::Taken, target_address: 0x10020, target: b });

        assert_eq!(node.edges().len(), 2);
        assert_eq!(node.edge(Discriminant::Taken).map(|e| e.target_address), Some(0x10020));
        assert!(node.edge(Discriminant::Dynamic).is_none());
    }

    #[test]
    fn byte_range() {
        let node = InstructionNode::new(0x100, 3, Instr::Nop);
        assert!(!node.contains(0xFF));
        assert!(node.contains(0x100));
        assert!(node.contains(0x102));
        assert!(!node.contains(0x103));
        assert_eq!(node.end(), 0x103);
    }

    #[test]
    fn flow_mapping() {
        assert_eq!(Discriminant::from_flow(Flow::Direct), Some(Discriminant::Taken));
        assert_eq!(Discriminant::from_flow(Flow::Indirect), Some(Discriminant::Dynamic));
        assert_eq!(Discriminant::from_flow(Flow::Halt), None);
    }
}
