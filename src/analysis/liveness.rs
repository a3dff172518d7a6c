//! Live-local analysis used to prune dead locals at block entry.

use crate::{
    analysis::{BlockId, BlockKind, BlockMap},
    bytecode::{MethodBody, Opcode},
    utils::BitSet,
};

/// Answers whether a local slot may be read before being written after entering a block.
pub trait LivenessOracle {
    /// Returns `true` if `slot` is live on entry to `block`.
    fn is_live_at(&self, block: BlockId, slot: usize) -> bool;
}

/// Oracle that reports every local live; disables pruning.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllLive;

impl LivenessOracle for AllLive {
    fn is_live_at(&self, _block: BlockId, _slot: usize) -> bool {
        true
    }
}

/// Backward dataflow over a [`BlockMap`]: `live_in = use ∪ (live_out \ def)`.
#[derive(Debug, Clone)]
pub struct LocalLiveness {
    live_in: Vec<BitSet>,
}

impl LocalLiveness {
    /// Computes live-in sets for every block, iterating to a fixed point.
    ///
    /// # Arguments
    ///
    /// * `body` - The method body whose loads and stores are scanned
    /// * `blocks` - The block map built from the same `body`
    ///
    /// # Returns
    ///
    /// Live-in local slots per block, queried through [`LivenessOracle::is_live_at`].
    #[must_use]
    pub fn compute(body: &MethodBody, blocks: &BlockMap) -> Self {
        let slots = usize::from(body.max_locals);
        let count = blocks.len();

        let mut uses = vec![BitSet::new(slots); count];
        let mut defs = vec![BitSet::new(slots); count];
        for block in blocks.blocks() {
            if block.kind != BlockKind::Instructions {
                continue;
            }
            let (used, defined) = (&mut uses[block.id.index()], &mut defs[block.id.index()]);
            for opcode in &body.code[block.start.index()..block.end.index()] {
                match opcode {
                    Opcode::Load(slot) if !defined.contains(usize::from(*slot)) => {
                        used.insert(usize::from(*slot));
                    }
                    Opcode::Store(slot) => defined.insert(usize::from(*slot)),
                    _ => {}
                }
            }
        }

        let mut live_in = vec![BitSet::new(slots); count];
        let mut changed = true;
        while changed {
            changed = false;
            for block in blocks.blocks().iter().rev() {
                let mut live = BitSet::new(slots);
                for succ in &block.successors {
                    live.union_with(&live_in[succ.index()]);
                }
                live.difference_with(&defs[block.id.index()]);
                live.union_with(&uses[block.id.index()]);
                if live != live_in[block.id.index()] {
                    live_in[block.id.index()] = live;
                    changed = true;
                }
            }
        }

        Self { live_in }
    }

    /// Live-in set of a block.
    #[must_use]
    pub fn live_in(&self, block: BlockId) -> Option<&BitSet> {
        self.live_in.get(block.index())
    }
}

impl LivenessOracle for LocalLiveness {
    fn is_live_at(&self, block: BlockId, slot: usize) -> bool {
        self.live_in
            .get(block.index())
            .is_some_and(|set| set.contains(slot))
    }
}
