//! Basic-block partitioning, exception dispatch chains and loop membership.
//!
//! Blocks are numbered in reverse postorder from the entry, so every forward edge goes
//! from a lower to a higher id and every back edge targets a loop header whose id is not
//! greater than its source. The synthetic return and unwind blocks are numbered last.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

use crate::{
    bytecode::{MethodBody, Position},
    utils::BitSet,
    Error, Result,
};

/// Identity of a block within one [`BlockMap`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(usize);

impl BlockId {
    /// Creates a block id from its index.
    #[must_use]
    pub const fn new(index: usize) -> Self {
        BlockId(index)
    }

    /// Returns the index of the block.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// What a block represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// A run of instructions.
    Instructions,
    /// One step of an exception dispatch chain: tests one handler.
    ExceptionDispatch {
        /// Index into the body's handler table
        handler: usize,
        /// Block tested when the handler does not match; `None` after a catch-all
        next: Option<BlockId>,
    },
    /// Synthetic join of all normal returns.
    Return,
    /// Synthetic join of all exceptions leaving the method.
    Unwind,
}

/// A basic block.
#[derive(Debug, Clone)]
pub struct Block {
    /// Block identity, equal to its reverse-postorder number
    pub id: BlockId,
    /// What the block represents
    pub kind: BlockKind,
    /// First instruction (for dispatch blocks the handler entry, for the synthetic
    /// return/unwind blocks the end of the body)
    pub start: Position,
    /// One past the last instruction; equal to `start` for blocks without instructions
    pub end: Position,
    /// Successor blocks
    pub successors: Vec<BlockId>,
    /// Predecessor blocks
    pub predecessors: Vec<BlockId>,
    /// Indices of every loop containing this block
    pub loops: BitSet,
    /// Loop index if this block is a loop header
    pub loop_header: Option<usize>,
}

impl Block {
    /// Returns `true` if this block is the header of a loop.
    #[must_use]
    pub fn is_loop_header(&self) -> bool {
        self.loop_header.is_some()
    }

    /// Position of the last instruction, if the block has instructions.
    #[must_use]
    pub fn last_position(&self) -> Option<Position> {
        (self.end > self.start).then(|| Position::new(self.end.index() as u32 - 1))
    }
}

/// The basic blocks of one method.
#[derive(Debug, Clone)]
pub struct BlockMap {
    blocks: Vec<Block>,
    by_start: HashMap<Position, BlockId>,
    dispatch_at: HashMap<Position, BlockId>,
    loop_headers: Vec<BlockId>,
    return_block: BlockId,
    unwind_block: BlockId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawKind {
    Instructions { start: usize, end: usize },
    Dispatch { handler: usize, next: Option<usize> },
    Return,
    Unwind,
}

impl BlockMap {
    /// Partitions `body` into blocks.
    ///
    /// # Arguments
    ///
    /// * `body` - The method body to partition; validated before any block is formed
    ///
    /// # Returns
    ///
    /// The blocks in reverse postorder, followed by the synthetic return and unwind
    /// blocks, with loops and exception dispatch chains attached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if the body fails validation and [`Error::NotSupported`]
    /// for irreducible control flow.
    pub fn build(body: &MethodBody) -> Result<Self> {
        body.validate()?;
        let len = body.len();

        // Leaders
        let mut leaders = BTreeSet::new();
        leaders.insert(0usize);
        for (idx, opcode) in body.code.iter().enumerate() {
            let position = Position::new(idx as u32);
            for target in opcode.branch_targets() {
                leaders.insert(target.index());
            }
            let ends_block = opcode.is_block_end()
                || (opcode.can_throw() && !body.handlers_at(position).is_empty());
            if ends_block && idx + 1 < len {
                leaders.insert(idx + 1);
            }
        }
        for handler in &body.handlers {
            leaders.insert(handler.start.index());
            leaders.insert(handler.handler.index());
            if handler.end.index() < len {
                leaders.insert(handler.end.index());
            }
        }

        let starts: Vec<usize> = leaders.into_iter().collect();
        let mut raw: Vec<RawKind> = starts
            .iter()
            .enumerate()
            .map(|(i, &start)| RawKind::Instructions {
                start,
                end: starts.get(i + 1).copied().unwrap_or(len),
            })
            .collect();
        let raw_at: HashMap<usize, usize> =
            starts.iter().enumerate().map(|(i, &s)| (s, i)).collect();

        // Dispatch chains, one block per handler suffix
        let unwind_raw = usize::MAX;
        let mut chains: HashMap<Vec<usize>, usize> = HashMap::new();
        let mut dispatch_raw_at: HashMap<Position, usize> = HashMap::new();
        for (idx, opcode) in body.code.iter().enumerate() {
            let position = Position::new(idx as u32);
            if !opcode.can_throw() {
                continue;
            }
            let covering = body.handlers_at(position);
            if covering.is_empty() {
                continue;
            }
            let head = Self::dispatch_chain(body, &covering, &mut raw, &mut chains, unwind_raw);
            dispatch_raw_at.insert(position, head);
        }

        let return_idx = raw.len();
        raw.push(RawKind::Return);
        let unwind_idx = raw.len();
        raw.push(RawKind::Unwind);
        for kind in &mut raw {
            if let RawKind::Dispatch { next: Some(n), .. } = kind {
                if *n == unwind_raw {
                    *n = unwind_idx;
                }
            }
        }

        // Raw successors
        let mut raw_succs: Vec<Vec<usize>> = vec![Vec::new(); raw.len()];
        for (idx, kind) in raw.iter().enumerate() {
            let succs = &mut raw_succs[idx];
            match *kind {
                RawKind::Instructions { end, .. } => {
                    let last = end - 1;
                    let opcode = &body.code[last];
                    let position = Position::new(last as u32);
                    for target in opcode.branch_targets() {
                        succs.push(raw_at[&target.index()]);
                    }
                    if opcode.falls_through() && end < len {
                        succs.push(raw_at[&end]);
                    }
                    if opcode.is_return() {
                        succs.push(return_idx);
                    }
                    if opcode.can_throw() {
                        match dispatch_raw_at.get(&position) {
                            Some(d) => succs.push(*d),
                            None if !opcode.falls_through() => succs.push(unwind_idx),
                            None => {}
                        }
                    }
                }
                RawKind::Dispatch { handler, next } => {
                    succs.push(raw_at[&body.handlers[handler].handler.index()]);
                    if let Some(next) = next {
                        succs.push(next);
                    }
                }
                RawKind::Return | RawKind::Unwind => {}
            }
            succs.dedup();
        }

        // Reverse postorder, synthetic exits last
        let mut postorder = Vec::with_capacity(raw.len());
        let mut visited = vec![false; raw.len()];
        visited[return_idx] = true;
        visited[unwind_idx] = true;
        let mut stack: Vec<(usize, usize)> = vec![(0, 0)];
        visited[0] = true;
        while let Some((node, child)) = stack.last_mut() {
            if let Some(&succ) = raw_succs[*node].get(*child) {
                *child += 1;
                if !visited[succ] {
                    visited[succ] = true;
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(*node);
                stack.pop();
            }
        }
        let mut order: Vec<usize> = postorder.into_iter().rev().collect();
        order.push(return_idx);
        order.push(unwind_idx);

        let mut new_id = vec![None; raw.len()];
        for (id, raw_idx) in order.iter().enumerate() {
            new_id[*raw_idx] = Some(BlockId(id));
        }

        let exit_position = Position::new(len as u32);
        let mut blocks: Vec<Block> = order
            .iter()
            .enumerate()
            .map(|(id, &r)| {
                let (kind, start, end) = match raw[r] {
                    RawKind::Instructions { start, end } => (
                        BlockKind::Instructions,
                        Position::new(start as u32),
                        Position::new(end as u32),
                    ),
                    RawKind::Dispatch { handler, next } => {
                        let entry = body.handlers[handler].handler;
                        (
                            BlockKind::ExceptionDispatch {
                                handler,
                                next: next.and_then(|n| new_id[n]),
                            },
                            entry,
                            entry,
                        )
                    }
                    RawKind::Return => (BlockKind::Return, exit_position, exit_position),
                    RawKind::Unwind => (BlockKind::Unwind, exit_position, exit_position),
                };
                Block {
                    id: BlockId(id),
                    kind,
                    start,
                    end,
                    successors: raw_succs[r].iter().filter_map(|s| new_id[*s]).collect(),
                    predecessors: Vec::new(),
                    loops: BitSet::default(),
                    loop_header: None,
                }
            })
            .collect();

        for id in 0..blocks.len() {
            for succ in blocks[id].successors.clone() {
                blocks[succ.0].predecessors.push(BlockId(id));
            }
        }

        let by_start = blocks
            .iter()
            .filter(|b| b.kind == BlockKind::Instructions)
            .map(|b| (b.start, b.id))
            .collect();
        let dispatch_at = dispatch_raw_at
            .into_iter()
            .filter_map(|(pos, r)| new_id[r].map(|id| (pos, id)))
            .collect();

        let mut map = BlockMap {
            return_block: BlockId(blocks.len() - 2),
            unwind_block: BlockId(blocks.len() - 1),
            blocks,
            by_start,
            dispatch_at,
            loop_headers: Vec::new(),
        };
        map.compute_loops()?;

        tracing::debug!(
            blocks = map.blocks.len(),
            loops = map.loop_headers.len(),
            "built block map"
        );
        Ok(map)
    }

    /// Returns the raw index of the dispatch chain for `handlers`, creating it on demand.
    fn dispatch_chain(
        body: &MethodBody,
        handlers: &[usize],
        raw: &mut Vec<RawKind>,
        chains: &mut HashMap<Vec<usize>, usize>,
        unwind_raw: usize,
    ) -> usize {
        if let Some(&existing) = chains.get(handlers) {
            return existing;
        }
        let first = handlers[0];
        let next = if body.handlers[first].is_catch_all() {
            None
        } else if handlers.len() > 1 {
            Some(Self::dispatch_chain(body, &handlers[1..], raw, chains, unwind_raw))
        } else {
            Some(unwind_raw)
        };
        let idx = raw.len();
        raw.push(RawKind::Dispatch {
            handler: first,
            next,
        });
        chains.insert(handlers.to_vec(), idx);
        idx
    }

    /// Finds natural loops and rejects irreducible control flow.
    fn compute_loops(&mut self) -> Result<()> {
        let count = self.blocks.len();
        let idom = self.dominators();

        let mut back_edges: Vec<(usize, usize)> = Vec::new();
        for block in &self.blocks {
            for succ in &block.successors {
                if succ.0 <= block.id.0 {
                    if !Self::dominates(&idom, succ.0, block.id.0) {
                        return Err(Error::NotSupported(format!(
                            "irreducible control flow: edge {} -> {} enters a loop not through its header",
                            block.id, succ
                        )));
                    }
                    back_edges.push((block.id.0, succ.0));
                }
            }
        }

        let mut headers: Vec<usize> = back_edges.iter().map(|(_, h)| *h).collect();
        headers.sort_unstable();
        headers.dedup();

        let loop_count = headers.len();
        for block in &mut self.blocks {
            block.loops = BitSet::new(loop_count);
        }

        for (loop_index, &header) in headers.iter().enumerate() {
            self.blocks[header].loop_header = Some(loop_index);
            self.loop_headers.push(BlockId(header));

            let mut in_loop = vec![false; count];
            in_loop[header] = true;
            let mut worklist: Vec<usize> = back_edges
                .iter()
                .filter(|(_, h)| *h == header)
                .map(|(s, _)| *s)
                .collect();
            while let Some(b) = worklist.pop() {
                if in_loop[b] {
                    continue;
                }
                in_loop[b] = true;
                worklist.extend(self.blocks[b].predecessors.iter().map(|p| p.0));
            }
            for (b, member) in in_loop.iter().enumerate() {
                if *member {
                    self.blocks[b].loops.insert(loop_index);
                }
            }
        }
        Ok(())
    }

    /// Immediate dominators over reverse-postorder ids (Cooper, Harvey, Kennedy).
    fn dominators(&self) -> Vec<Option<usize>> {
        let count = self.blocks.len();
        let mut idom: Vec<Option<usize>> = vec![None; count];
        idom[0] = Some(0);

        let intersect = |idom: &[Option<usize>], mut a: usize, mut b: usize| {
            while a != b {
                while a > b {
                    a = idom[a].unwrap_or(0);
                }
                while b > a {
                    b = idom[b].unwrap_or(0);
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for b in 1..count {
                let mut new_idom: Option<usize> = None;
                for pred in &self.blocks[b].predecessors {
                    if idom[pred.0].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred.0,
                        Some(current) => intersect(&idom, pred.0, current),
                    });
                }
                if new_idom.is_some() && idom[b] != new_idom {
                    idom[b] = new_idom;
                    changed = true;
                }
            }
        }
        idom
    }

    fn dominates(idom: &[Option<usize>], a: usize, mut b: usize) -> bool {
        loop {
            if a == b {
                return true;
            }
            match idom[b] {
                Some(parent) if parent != b => b = parent,
                _ => return false,
            }
        }
    }

    /// All blocks, indexed by [`BlockId`].
    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Returns a block.
    #[must_use]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0]
    }

    /// Number of blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Always `false`: every map has at least the entry and the synthetic exits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Successors of a block.
    #[must_use]
    pub fn successors_of(&self, id: BlockId) -> &[BlockId] {
        &self.blocks[id.0].successors
    }

    /// Header block of a loop.
    #[must_use]
    pub fn loop_header_of(&self, loop_index: usize) -> Option<BlockId> {
        self.loop_headers.get(loop_index).copied()
    }

    /// Number of loops.
    #[must_use]
    pub fn loop_count(&self) -> usize {
        self.loop_headers.len()
    }

    /// First dispatch block for an exception raised at `position`, if a handler covers it.
    #[must_use]
    pub fn exception_dispatch_block_of(&self, position: Position) -> Option<BlockId> {
        self.dispatch_at.get(&position).copied()
    }

    /// The synthetic block all normal returns flow into.
    #[must_use]
    pub fn return_block(&self) -> BlockId {
        self.return_block
    }

    /// The synthetic block all uncaught exceptions flow into.
    #[must_use]
    pub fn unwind_block(&self) -> BlockId {
        self.unwind_block
    }

    /// The reachable instruction block starting at `position`.
    #[must_use]
    pub fn block_at(&self, position: Position) -> Option<BlockId> {
        self.by_start.get(&position).copied()
    }
}
