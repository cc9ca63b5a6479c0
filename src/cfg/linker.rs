//! Resolves runtime successors into graph edges.

use crate::cfg::cache::NodeCache;
use crate::cfg::node::{Discriminant, Edge, NodeId};
use crate::cpu::decode::DecoderError;
use crate::memory::Memory;

/// Creates and reuses the edges between instruction nodes.
///
/// An edge is only followed while its target node is still valid and sits at
/// the address control actually went to, so `Dynamic` edges behave like a
/// single-slot cache of the last computed target.
#[derive(Debug, Default)]
pub struct Linker {
    hits: u64,
    misses: u64,
}

impl Linker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the node at `target` reached from `from` through the outcome
    /// `discriminant`, creating or replacing the edge as needed.
    ///
    /// If `from` was invalidated or replaced in the meantime, the target is
    /// still resolved but no edge is recorded.
    pub fn resolve(
        &mut self,
        cache: &mut NodeCache,
        mem: &mut Memory,
        from: NodeId,
        discriminant: Discriminant,
        target: u32,
    ) -> Result<NodeId, DecoderError> {
        cache.sync(mem);

        let existing = cache.get_valid(from)
            .and_then(|node| node.edge(discriminant))
            .cloned();
        if let Some(edge) = existing {
            if edge.target_address == target && cache.get_valid(edge.target).is_some() {
                self.hits += 1;
                return Ok(edge.target);
            }
        }

        self.misses += 1;
        let id = cache.fetch_or_decode(mem, target)?;
        if let Some(node) = cache.get_mut(from).filter(|n| n.is_valid()) {
            trace!("edge {:#07X} -[{:?}]-> {:#07X}", node.address(), discriminant, target);
            node.set_edge(Edge {
                discriminant,
                target_address: target,
                target: id,
            });
        }
        Ok(id)
    }

    /// Number of transitions served by an existing edge.
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Number of transitions that had to create or replace an edge.
    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::Breakpoints;
    use crate::memory::MIN_MEMORY_SIZE;
    use std::sync::Arc;

    const P: u32 = 0x10000;

    fn setup(code: &[u8]) -> (Memory, NodeCache, Linker) {
        let mut mem = Memory::new(MIN_MEMORY_SIZE, Arc::new(Breakpoints::new())).unwrap();
        mem.load_block(P, code);
        (mem, NodeCache::new(), Linker::new())
    }

    #[test]
    fn second_transition_uses_edge() {
        // inc cx; jmp short -3
        let (mut mem, mut cache, mut linker) = setup(&[0x41, 0xEB, 0xFD]);
        let inc = cache.fetch_or_decode(&mut mem, P).unwrap();
        let jmp = linker.resolve(&mut cache, &mut mem, inc, Discriminant::Fallthrough, P + 1).unwrap();
        let back = linker.resolve(&mut cache, &mut mem, jmp, Discriminant::Taken, P).unwrap();
        assert_eq!(back, inc);
        assert_eq!((linker.hits(), linker.misses()), (0, 2));

        let decodes = cache.stats().decodes;
        assert_eq!(linker.resolve(&mut cache, &mut mem, inc, Discriminant::Fallthrough, P + 1).unwrap(), jmp);
        assert_eq!(linker.resolve(&mut cache, &mut mem, jmp, Discriminant::Taken, P).unwrap(), inc);
        assert_eq!(linker.hits(), 2);
        assert_eq!(cache.stats().decodes, decodes);
        assert_eq!(cache[inc].edges().len(), 1);
    }

    #[test]
    fn dynamic_edge_is_checked_against_target() {
        let (mut mem, mut cache, mut linker) = setup(&[0xC3, 0x90, 0x90]);
        let ret = cache.fetch_or_decode(&mut mem, P).unwrap();
        let a = linker.resolve(&mut cache, &mut mem, ret, Discriminant::Dynamic, P + 1).unwrap();
        let b = linker.resolve(&mut cache, &mut mem, ret, Discriminant::Dynamic, P + 2).unwrap();
        assert_ne!(a, b);
        assert_eq!(linker.hits(), 0);

        let edge = cache[ret].edge(Discriminant::Dynamic).cloned().unwrap();
        assert_eq!(edge.target_address, P + 2);
        assert_eq!(edge.target, b);
    }

    #[test]
    fn edge_to_invalidated_target_is_reresolved() {
        let (mut mem, mut cache, mut linker) = setup(&[0x90, 0x83, 0xF9, 0x03]);
        let nop = cache.fetch_or_decode(&mut mem, P).unwrap();
        let cmp = linker.resolve(&mut cache, &mut mem, nop, Discriminant::Fallthrough, P + 1).unwrap();

        mem.write_u8(P + 1, 0x41);
        let inc = linker.resolve(&mut cache, &mut mem, nop, Discriminant::Fallthrough, P + 1).unwrap();
        assert_ne!(inc, cmp);
        assert_eq!(cache[inc].len(), 1);
        assert_eq!(cache[nop].edge(Discriminant::Fallthrough).map(|e| e.target), Some(inc));
    }

    #[test]
    fn invalidated_source_records_no_edge() {
        let (mut mem, mut cache, mut linker) = setup(&[0x90, 0x90]);
        let first = cache.fetch_or_decode(&mut mem, P).unwrap();
        mem.write_u8(P, 0x40);
        let second = linker.resolve(&mut cache, &mut mem, first, Discriminant::Fallthrough, P + 1).unwrap();
        assert!(cache.get_valid(first).is_none());
        assert!(cache.get_valid(second).is_some());
    }
}
