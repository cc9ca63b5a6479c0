//! Cache of decoded instruction nodes, keyed by physical address.
//!
//! Memory marks every byte a node was decoded from. Guest writes to marked
//! bytes are logged by memory, and the cache applies that log before it hands
//! out any node, so a node that is returned always matches the bytes
//! currently in memory. Invalidated nodes stay in the arena, flagged invalid,
//! until the next fetch at their address replaces them.

use crate::cfg::node::{InstructionNode, NodeId};
use crate::cpu::decode::{Decoder, DecoderError, MAX_INSTR_LEN};
use crate::memory::Memory;

use generational_arena::Arena;

use std::collections::HashMap;
use std::ops::Index;

/// Counters describing the cache's effectiveness.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Instructions decoded from memory.
    pub decodes: u64,
    /// Fetches answered with an existing node.
    pub hits: u64,
    /// Nodes invalidated by writes to their bytes.
    pub invalidations: u64,
}

#[derive(Debug, Default)]
pub struct NodeCache {
    nodes: Arena<InstructionNode>,
    by_address: HashMap<u32, NodeId>,
    stats: CacheStats,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the valid node at `addr`, decoding it if necessary.
    ///
    /// Two fetches of the same unmodified code return the same node. After
    /// any byte of a node was written to, the next fetch decodes a fresh node
    /// from the current bytes.
    pub fn fetch_or_decode(&mut self, mem: &mut Memory, addr: u32) -> Result<NodeId, DecoderError> {
        self.sync(mem);

        if let Some(&id) = self.by_address.get(&addr) {
            if self.nodes.get(id).map_or(false, |n| n.is_valid()) {
                self.stats.hits += 1;
                return Ok(id);
            }

            self.nodes.remove(id);
            self.by_address.remove(&addr);
        }

        let (instr, len) = {
            let mut decoder = Decoder::new(mem, addr);
            let instr = decoder.decode_next()?;
            (instr, decoder.len())
        };
        trace!("decoded {:#07X}: {} ({} bytes)", addr, instr, len);

        mem.watch_code(addr, len);
        let id = self.nodes.insert(InstructionNode::new(addr, len, instr));
        self.by_address.insert(addr, id);
        self.stats.decodes += 1;
        Ok(id)
    }

    /// Applies the writes to code memory has logged since the last call.
    pub fn sync(&mut self, mem: &mut Memory) {
        if !mem.has_dirty_code() {
            return;
        }

        let dirty: Vec<u32> = mem.drain_dirty_code().collect();
        for addr in dirty {
            self.invalidate(addr);
        }
    }

    /// Invalidates every valid node that contains the byte at `addr`.
    ///
    /// Returns the number of nodes invalidated.
    pub fn invalidate(&mut self, addr: u32) -> usize {
        let mut count = 0;
        for start in addr.saturating_sub(MAX_INSTR_LEN - 1)..=addr {
            let id = match self.by_address.get(&start) {
                Some(&id) => id,
                None => continue,
            };

            if let Some(node) = self.nodes.get_mut(id) {
                if node.is_valid() && node.contains(addr) {
                    trace!("write to {:#07X} invalidates {:#07X}: {}", addr, start, node.instr());
                    node.invalidate();
                    count += 1;
                }
            }
        }

        self.stats.invalidations += count as u64;
        count
    }

    /// Looks up a node, valid or not. Fails for nodes that were replaced.
    pub fn get(&self, id: NodeId) -> Option<&InstructionNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut InstructionNode> {
        self.nodes.get_mut(id)
    }

    /// Looks up a node that still matches memory.
    pub fn get_valid(&self, id: NodeId) -> Option<&InstructionNode> {
        self.nodes.get(id).filter(|n| n.is_valid())
    }

    /// The valid node starting at `addr`, without decoding.
    pub fn node_at(&self, addr: u32) -> Option<NodeId> {
        self.by_address.get(&addr)
            .cloned()
            .filter(|&id| self.get_valid(id).is_some())
    }

    /// Iterates over all valid nodes in address order.
    pub fn valid_nodes(&self) -> Vec<(NodeId, &InstructionNode)> {
        let mut nodes: Vec<_> = self.nodes.iter().filter(|(_, n)| n.is_valid()).collect();
        nodes.sort_by_key(|(_, n)| n.address());
        nodes
    }

    /// Number of valid nodes.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|(_, n)| n.is_valid()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

impl Index<NodeId> for NodeCache {
    type Output = InstructionNode;

    fn index(&self, id: NodeId) -> &InstructionNode {
        &self.nodes[id]
    }
}
