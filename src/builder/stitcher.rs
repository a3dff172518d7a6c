//! Connecting blocks: entry stubs, merges, phis, loop ends and loop exits.
//!
//! Every block is represented in the graph by one node recorded in the entry table. The
//! first edge into a block creates a `Begin`; a second forward edge promotes it to a
//! `Merge` whose phis reconcile the incoming states. Loop headers exist before any edge
//! reaches them so that back edges and exits can refer to them while the loop body is
//! still being parsed.

use std::{
    cmp::Reverse,
    collections::{HashMap, HashSet},
};

use tracing::trace;

use crate::{
    analysis::BlockId,
    builder::{parser::BlockParser, scope::BlockEntry},
    bytecode::Position,
    frame::{FrameState, FrameValue},
    ir::{DeoptReason, EdgeKind, Graph, NodeId, NodeKind},
    Result,
};

/// `LoopExit` nodes created for one edge, outermost last.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LoopExitChain {
    pub(crate) first: NodeId,
    pub(crate) last: NodeId,
}

impl BlockParser<'_, '_> {
    /// Returns the node the caller must link to in order to transfer control to `target`.
    ///
    /// With dead-code elimination enabled, a probability of zero yields an unreached-code
    /// trap instead of an edge into the target.
    pub(crate) fn resolve_target(
        &mut self,
        from: BlockId,
        target: BlockId,
        state: FrameState,
        probability: f64,
        position: Position,
    ) -> Result<NodeId> {
        if probability <= 0.0 && self.ctx.config.dead_code_elimination {
            trace!(%from, %target, "edge never taken, emitting trap");
            let trap = self.ctx.graph.add_node(
                NodeKind::Deoptimize {
                    reason: DeoptReason::Unreached,
                },
                vec![],
            );
            let snapshot = self.scope.snapshot(&state, position);
            self.ctx.graph.set_snapshot(trap, snapshot)?;
            return Ok(trap);
        }

        let (state, exits) = self.check_loop_exit(from, target, state, position)?;
        let stub = self.create_target(from, target, state, position)?;
        self.prepend_exits(exits, stub)
    }

    /// Links `exits` in front of `stub` and returns the first node of the chain.
    pub(crate) fn prepend_exits(
        &mut self,
        exits: Option<LoopExitChain>,
        stub: NodeId,
    ) -> Result<NodeId> {
        match exits {
            Some(chain) => {
                self.ctx
                    .graph
                    .add_edge(chain.last, stub, EdgeKind::Next, 1.0)?;
                Ok(chain.first)
            }
            None => Ok(stub),
        }
    }

    /// Creates one `LoopExit` per loop left by the edge `from -> target`, innermost first,
    /// and proxies every value of `state` that was defined inside the exited loop.
    pub(crate) fn check_loop_exit(
        &mut self,
        from: BlockId,
        target: BlockId,
        mut state: FrameState,
        position: Position,
    ) -> Result<(FrameState, Option<LoopExitChain>)> {
        let blocks = &self.scope.blocks;
        let exited = blocks
            .block(from)
            .loops
            .difference(&blocks.block(target).loops);
        if exited.is_empty() {
            return Ok((state, None));
        }

        // Inner loop headers come later in reverse postorder.
        let mut loops: Vec<usize> = exited.iter().collect();
        loops.sort_by_key(|l| Reverse(blocks.loop_header_of(*l).map_or(0, BlockId::index)));

        let mut chain: Option<LoopExitChain> = None;
        for loop_index in loops {
            let (Some(&header), Some(&mark)) = (
                self.scope.loop_headers.get(loop_index),
                self.scope.loop_marks.get(loop_index),
            ) else {
                return Err(malformed_error!("Loop {} has no header node", loop_index));
            };

            let graph = &mut self.ctx.graph;
            let exit = graph.add_node(NodeKind::LoopExit { header }, vec![]);
            let mut proxies: HashMap<NodeId, NodeId> = HashMap::new();
            state.for_each_value_mut(|value| {
                let original = value.node;
                if defined_in_loop(graph, original, header, mark) {
                    value.node = *proxies.entry(original).or_insert_with(|| {
                        graph.add_node(NodeKind::Proxy { exit }, vec![original])
                    });
                }
            });
            graph.set_snapshot(exit, self.scope.snapshot(&state, position))?;
            trace!(%from, %target, %exit, proxies = proxies.len(), "loop exit");

            chain = Some(match chain {
                Some(c) => {
                    graph.add_edge(c.last, exit, EdgeKind::Next, 1.0)?;
                    LoopExitChain {
                        first: c.first,
                        last: exit,
                    }
                }
                None => LoopExitChain {
                    first: exit,
                    last: exit,
                },
            });
        }
        Ok((state, chain))
    }

    /// Returns the stub for an edge into `target`, creating or promoting the block's entry
    /// and merging `state` into it.
    pub(crate) fn create_target(
        &mut self,
        from: BlockId,
        target: BlockId,
        state: FrameState,
        position: Position,
    ) -> Result<NodeId> {
        if self.scope.blocks.block(target).is_loop_header() {
            return if from.index() >= target.index() {
                self.add_loop_end(target, state, position)
            } else {
                self.add_loop_entry(target, state, position)
            };
        }

        let Some(entry) = self.scope.entry(target) else {
            let state = self.prune(state, target);
            let begin = self.ctx.graph.add_node(NodeKind::Begin, vec![]);
            self.scope.entries[target.index()] = Some(BlockEntry {
                node: begin,
                state: Some(state),
                processed: false,
            });
            return Ok(begin);
        };
        if entry.processed {
            return Err(malformed_error!(
                "Forward edge {} -> {} reaches a block that was already parsed",
                from,
                target
            ));
        }

        let node = entry.node;
        let merge = if matches!(self.ctx.graph.kind(node), Some(NodeKind::Begin)) {
            self.promote_to_merge(target, node)?
        } else {
            node
        };
        let end = self.ctx.graph.add_node(NodeKind::End, vec![]);
        self.ctx.graph.add_edge(end, merge, EdgeKind::Next, 1.0)?;
        self.merge_forward(target, merge, state, position)?;
        Ok(end)
    }

    /// Replaces the `Begin` of `target` by a `Merge` reached through a new `End`.
    ///
    /// The edge into the `Begin` is moved to the `End`, leaving the `Begin` orphaned for
    /// cleanup. After a control split the `Begin` has to stay and is linked to the `End`.
    fn promote_to_merge(&mut self, target: BlockId, begin: NodeId) -> Result<NodeId> {
        let graph = &mut self.ctx.graph;
        let merge = graph.add_node(NodeKind::Merge, vec![]);
        let end = graph.add_node(NodeKind::End, vec![]);
        graph.add_edge(end, merge, EdgeKind::Next, 1.0)?;

        let incoming: Vec<_> = graph
            .predecessor_edges(begin)
            .map(|(id, e)| (id, e.source))
            .collect();
        match incoming.as_slice() {
            [(edge, source)]
                if !graph
                    .kind(*source)
                    .is_some_and(NodeKind::is_control_split) =>
            {
                graph.retarget_edge(*edge, end)?;
            }
            _ => {
                graph.add_edge(begin, end, EdgeKind::Next, 1.0)?;
            }
        }

        self.scope.entry_mut(target)?.node = merge;
        trace!(%target, %begin, %merge, "promoted begin to merge");
        Ok(merge)
    }

    /// A forward edge into a loop header: merge like any other join.
    pub(crate) fn add_loop_entry(
        &mut self,
        target: BlockId,
        state: FrameState,
        position: Position,
    ) -> Result<NodeId> {
        let entry = self
            .scope
            .entry(target)
            .ok_or_else(|| malformed_error!("Loop header {} was not created", target))?;
        if entry.processed {
            return Err(malformed_error!(
                "Forward edge into loop header {} after it was parsed",
                target
            ));
        }
        let header = entry.node;
        let first = entry.state.is_none();

        let end = self.ctx.graph.add_node(NodeKind::End, vec![]);
        self.ctx.graph.add_edge(end, header, EdgeKind::Next, 1.0)?;
        if first {
            let state = self.prune(state, target);
            self.scope.entry_mut(target)?.state = Some(state);
        } else {
            self.merge_forward(target, header, state, position)?;
        }
        Ok(end)
    }

    /// A back edge: a `LoopEnd` whose values feed the header's loop phis.
    fn add_loop_end(
        &mut self,
        target: BlockId,
        incoming: FrameState,
        position: Position,
    ) -> Result<NodeId> {
        let entry = self.scope.entry_mut(target)?;
        if !entry.processed {
            return Err(malformed_error!(
                "Back edge into loop header {} before it was parsed",
                target
            ));
        }
        let header = entry.node;
        let mut header_state = entry
            .state
            .take()
            .ok_or_else(|| malformed_error!("Loop header {} has no state", target))?;

        let result = self.fill_loop_phis(target, &mut header_state, &incoming, position);
        self.scope.entry_mut(target)?.state = Some(header_state);
        result?;

        let graph = &mut self.ctx.graph;
        let loop_end = graph.add_node(NodeKind::LoopEnd { header }, vec![]);
        graph.add_edge(loop_end, header, EdgeKind::Next, 1.0)?;
        Ok(loop_end)
    }

    fn fill_loop_phis(
        &mut self,
        target: BlockId,
        header_state: &mut FrameState,
        incoming: &FrameState,
        position: Position,
    ) -> Result<()> {
        header_state.check_compatible(position, incoming)?;
        let undefined: Vec<NodeId> = header_state
            .locals()
            .iter()
            .enumerate()
            .filter_map(|(slot, local)| {
                let phi = (*local)?;
                match incoming.local(slot) {
                    Some(value) if value.kind == phi.kind => None,
                    _ => Some(phi.node),
                }
            })
            .collect();
        if !undefined.is_empty() {
            self.kill_loop_phis(target, header_state, incoming, undefined, position)?;
        }

        let graph = &mut self.ctx.graph;
        for (slot, local) in header_state.locals().iter().enumerate() {
            if let (Some(phi), Some(value)) = (local, incoming.local(slot)) {
                graph.add_phi_input(phi.node, value.node)?;
            }
        }
        let pairs = header_state
            .stack()
            .iter()
            .zip(incoming.stack())
            .chain(header_state.monitors().iter().zip(incoming.monitors()));
        for (phi, value) in pairs {
            graph.add_phi_input(phi.node, value.node)?;
        }
        Ok(())
    }

    /// Drops the loop phis of locals a back edge leaves undefined or rebinds to another
    /// kind, together with every phi and proxy derived from them.
    ///
    /// Frame states and snapshots lose the affected locals. Any other use of a dropped
    /// value means the local is read inside the loop, which is a verification error.
    fn kill_loop_phis(
        &mut self,
        target: BlockId,
        header_state: &mut FrameState,
        incoming: &FrameState,
        roots: Vec<NodeId>,
        position: Position,
    ) -> Result<()> {
        let graph = &mut self.ctx.graph;
        let dead = state_only_closure(graph, roots).map_err(|user| {
            verification_error!(
                position,
                "a local undefined on the back edge into loop header {} is used by {}",
                target,
                user
            )
        })?;
        let still_live = || {
            verification_error!(
                position,
                "a local undefined on the back edge into loop header {} is still on the stack",
                target
            )
        };
        if incoming.values().any(|v| dead.contains(&v.node)) || !header_state.clear_locals_in(&dead)
        {
            return Err(still_live());
        }
        for state in self
            .scope
            .entries
            .iter_mut()
            .flatten()
            .filter_map(|e| e.state.as_mut())
        {
            if !state.clear_locals_in(&dead) {
                return Err(still_live());
            }
        }

        let stale: Vec<NodeId> = graph
            .live_nodes()
            .filter(|(_, n)| n.snapshot.as_ref().is_some_and(|s| s.references_any(&dead)))
            .map(|(id, _)| id)
            .collect();
        for id in stale {
            let Some(snapshot) = graph.snapshot(id).and_then(|s| s.without_locals(&dead)) else {
                return Err(still_live());
            };
            graph.set_snapshot(id, snapshot)?;
        }
        for node in &dead {
            graph.remove_node(*node);
        }
        trace!(%target, dropped = dead.len(), "loop phis of undefined locals dropped");
        Ok(())
    }

    /// Turns every value of a loop header's entry state into a loop phi.
    ///
    /// Called when the header block is about to be parsed; the allocation mark taken here
    /// tells [`Self::check_loop_exit`] which values were defined inside the loop.
    pub(crate) fn begin_loop(
        &mut self,
        loop_index: usize,
        header: NodeId,
        state: &mut FrameState,
    ) -> Result<()> {
        let graph = &mut self.ctx.graph;
        let mark = graph.node_count();
        let forward = graph.in_degree(header);
        state.for_each_value_mut(|value| {
            if !is_phi_of(graph, value.node, header) {
                value.node =
                    graph.add_node(NodeKind::Phi { merge: header }, vec![value.node; forward]);
            }
        });
        let slot = self
            .scope
            .loop_marks
            .get_mut(loop_index)
            .ok_or_else(|| malformed_error!("Loop {} has no header node", loop_index))?;
        *slot = mark;
        trace!(%header, loop_index, "loop header parsed");
        Ok(())
    }

    /// Merges a state arriving at an existing join `merge` of block `target`.
    fn merge_forward(
        &mut self,
        target: BlockId,
        merge: NodeId,
        incoming: FrameState,
        position: Position,
    ) -> Result<()> {
        let mut current = self
            .scope
            .entry_mut(target)?
            .state
            .take()
            .ok_or_else(|| malformed_error!("Block {} has no entry state", target))?;

        let result = self.merge_states(merge, &mut current, &incoming, position);
        self.scope.entry_mut(target)?.state = Some(current);
        result
    }

    fn merge_states(
        &mut self,
        merge: NodeId,
        current: &mut FrameState,
        incoming: &FrameState,
        position: Position,
    ) -> Result<()> {
        current.check_compatible(position, incoming)?;
        let graph = &mut self.ctx.graph;
        // The new end is already linked to the merge.
        let ends_before = graph.in_degree(merge).saturating_sub(1);

        for (slot, local) in current.locals_mut().iter_mut().enumerate() {
            let Some(old) = *local else {
                continue;
            };
            match incoming.local(slot) {
                Some(new) if new.kind == old.kind => {
                    *local = Some(merge_value(graph, merge, old, new, ends_before)?);
                }
                _ => {
                    if is_phi_of(graph, old.node, merge) {
                        graph.remove_node(old.node);
                    }
                    *local = None;
                }
            }
        }
        for (old, new) in current.stack_mut().iter_mut().zip(incoming.stack()) {
            *old = merge_value(graph, merge, *old, *new, ends_before)?;
        }
        for (old, new) in current.monitors_mut().iter_mut().zip(incoming.monitors()) {
            *old = merge_value(graph, merge, *old, *new, ends_before)?;
        }
        Ok(())
    }

    /// Clears the locals that are dead on entry to `block`, if pruning is enabled.
    pub(crate) fn prune(&self, mut state: FrameState, block: BlockId) -> FrameState {
        if self.ctx.config.liveness_pruning {
            state.clear_dead_locals(self.scope.liveness.as_ref(), block);
        }
        state
    }
}

fn is_phi_of(graph: &Graph, node: NodeId, merge: NodeId) -> bool {
    matches!(graph.kind(node), Some(NodeKind::Phi { merge: m }) if *m == merge)
}

/// Collects `roots` and every phi or proxy that consumes one of them, transitively.
///
/// Fails with the first other consumer.
fn state_only_closure(
    graph: &Graph,
    roots: Vec<NodeId>,
) -> std::result::Result<HashSet<NodeId>, NodeId> {
    let mut dead: HashSet<NodeId> = roots.iter().copied().collect();
    let mut work = roots;
    while let Some(value) = work.pop() {
        for (user, node) in graph.live_nodes() {
            if dead.contains(&user) || !node.inputs.contains(&value) {
                continue;
            }
            match node.kind {
                NodeKind::Phi { .. } | NodeKind::Proxy { .. } => {
                    dead.insert(user);
                    work.push(user);
                }
                _ => return Err(user),
            }
        }
    }
    Ok(dead)
}

/// Combines the value one slot had on the first `ends_before` edges with a new arrival.
fn merge_value(
    graph: &mut Graph,
    merge: NodeId,
    old: FrameValue,
    new: FrameValue,
    ends_before: usize,
) -> Result<FrameValue> {
    if is_phi_of(graph, old.node, merge) {
        graph.add_phi_input(old.node, new.node)?;
        return Ok(old);
    }
    if old.node == new.node {
        return Ok(old);
    }
    let mut inputs = vec![old.node; ends_before];
    inputs.push(new.node);
    let phi = graph.add_node(NodeKind::Phi { merge }, inputs);
    Ok(FrameValue::new(phi, old.kind))
}

/// Returns `true` for values that must be proxied when leaving the loop of `header`:
/// the header's phis and anything allocated after the header was parsed.
fn defined_in_loop(graph: &Graph, node: NodeId, header: NodeId, mark: usize) -> bool {
    match graph.kind(node) {
        None
        | Some(NodeKind::Constant(_) | NodeKind::Null | NodeKind::Parameter { .. }) => false,
        Some(NodeKind::Phi { merge }) if *merge == header => true,
        Some(_) => node.index() >= mark,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        builder::{
            scope::{BuildContext, MethodScope},
            BuildEnv,
        },
        bytecode::{Condition, MethodAssembler, MethodBody},
        config::BuilderConfig,
        ir::NodeClass,
        metadata::{ClassHierarchy, MethodId, MethodInfo, TypeId},
    };

    fn scope_for(body: MethodBody, config: &BuilderConfig) -> Result<MethodScope> {
        let method = Arc::new(MethodInfo::new(MethodId::new(1), "m", TypeId::new(1)));
        MethodScope::new(method, Arc::new(body), config, vec![MethodId::new(1)], None, false)
    }

    fn diamond() -> Result<MethodBody> {
        MethodAssembler::new()
            .locals(1)
            .load(0)
            .if_zero(Condition::Eq, "else")
            .iconst(1)
            .goto("join")
            .label("else")
            .iconst(2)
            .label("join")
            .ret_value()
            .finish()
    }

    #[test]
    fn test_second_visit_promotes_to_merge() -> Result<()> {
        let env = BuildEnv::new(Arc::new(ClassHierarchy::new()));
        let config = BuilderConfig::default();
        let mut ctx = BuildContext::new(&env, &config);
        let scope = scope_for(diamond()?, &config)?;
        let join = scope
            .blocks
            .block_at(Position::new(5))
            .ok_or_else(|| malformed_error!("join block missing"))?;
        let mut parser = BlockParser::new(&mut ctx, scope);

        let a = parser.ctx.graph.add_node(NodeKind::Constant(1), vec![]);
        let b = parser.ctx.graph.add_node(NodeKind::Constant(2), vec![]);
        let pred = parser.ctx.graph.add_node(NodeKind::Begin, vec![]);
        let mut first = FrameState::new(1);
        first.push(FrameValue::int(a));
        let mut second = FrameState::new(1);
        second.push(FrameValue::int(b));

        let stub = parser.create_target(BlockId::new(1), join, first, Position::new(3))?;
        assert_eq!(parser.ctx.graph.kind(stub), Some(&NodeKind::Begin));
        parser.ctx.graph.add_edge(pred, stub, EdgeKind::Next, 1.0)?;

        let end = parser.create_target(BlockId::new(2), join, second, Position::new(4))?;
        assert_eq!(parser.ctx.graph.kind(end), Some(&NodeKind::End));

        let graph = &parser.ctx.graph;
        let merge = parser.scope.entry(join).map(|e| e.node);
        assert!(merge.is_some_and(|m| graph.kind(m) == Some(&NodeKind::Merge)));
        assert_eq!(graph.in_degree(stub), 0, "orphaned begin");
        assert_eq!(graph.count(NodeClass::Phi), 1);

        let state = parser.scope.entry(join).and_then(|e| e.state.clone());
        let top = state.and_then(|s| s.peek().copied());
        let phi = top.map(|v| v.node);
        assert_eq!(phi.map(|p| graph.inputs(p).to_vec()), Some(vec![a, b]));
        Ok(())
    }

    #[test]
    fn test_mismatched_stack_is_rejected() -> Result<()> {
        let env = BuildEnv::new(Arc::new(ClassHierarchy::new()));
        let config = BuilderConfig::default();
        let mut ctx = BuildContext::new(&env, &config);
        let scope = scope_for(diamond()?, &config)?;
        let join = scope
            .blocks
            .block_at(Position::new(5))
            .ok_or_else(|| malformed_error!("join block missing"))?;
        let mut parser = BlockParser::new(&mut ctx, scope);

        let a = parser.ctx.graph.add_node(NodeKind::Constant(1), vec![]);
        let mut first = FrameState::new(1);
        first.push(FrameValue::int(a));
        parser.create_target(BlockId::new(1), join, first, Position::new(3))?;

        let result = parser.create_target(BlockId::new(2), join, FrameState::new(1), Position::new(4));
        assert!(result.is_err_and(|e| e.is_verification()));
        Ok(())
    }

    #[test]
    fn test_zero_probability_becomes_trap() -> Result<()> {
        let env = BuildEnv::new(Arc::new(ClassHierarchy::new()));
        let config = BuilderConfig::default();
        let mut ctx = BuildContext::new(&env, &config);
        let scope = scope_for(diamond()?, &config)?;
        let mut parser = BlockParser::new(&mut ctx, scope);

        let stub = parser.resolve_target(
            BlockId::new(0),
            BlockId::new(1),
            FrameState::new(1),
            0.0,
            Position::new(1),
        )?;
        assert_eq!(
            parser.ctx.graph.kind(stub),
            Some(&NodeKind::Deoptimize {
                reason: DeoptReason::Unreached
            })
        );
        assert!(parser.ctx.graph.snapshot(stub).is_some());
        assert!(parser.scope.entry(BlockId::new(1)).is_none());
        Ok(())
    }

    #[test]
    fn test_killed_local_drops_its_phi() -> Result<()> {
        let env = BuildEnv::new(Arc::new(ClassHierarchy::new()));
        let config = BuilderConfig::default().with_liveness_pruning(false);
        let mut ctx = BuildContext::new(&env, &config);
        let body = MethodAssembler::new()
            .locals(1)
            .iconst(0)
            .switch(&[(0, "join"), (1, "join")], "join")
            .label("join")
            .ret()
            .finish()?;
        let scope = scope_for(body, &config)?;
        let join = scope
            .blocks
            .block_at(Position::new(2))
            .ok_or_else(|| malformed_error!("join block missing"))?;
        let mut parser = BlockParser::new(&mut ctx, scope);

        let split = parser.ctx.graph.add_node(NodeKind::If, vec![]);
        let values: Vec<NodeId> = (0..2)
            .map(|v| parser.ctx.graph.add_node(NodeKind::Constant(v), vec![]))
            .collect();
        let with_local = |node| -> Result<FrameState> {
            let mut state = FrameState::new(1);
            state.store_local(Position::new(0), 0, FrameValue::int(node))?;
            Ok(state)
        };

        let stub = parser.create_target(BlockId::new(0), join, with_local(values[0])?, Position::new(1))?;
        parser.ctx.graph.add_edge(split, stub, EdgeKind::True, 0.5)?;
        parser.create_target(BlockId::new(0), join, with_local(values[1])?, Position::new(1))?;
        assert_eq!(parser.ctx.graph.count(NodeClass::Phi), 1);
        // After a split the begin survives promotion.
        assert_eq!(parser.ctx.graph.in_degree(stub), 1);

        parser.create_target(BlockId::new(0), join, FrameState::new(1), Position::new(1))?;
        assert_eq!(parser.ctx.graph.count(NodeClass::Phi), 0);
        let state = parser.scope.entry(join).and_then(|e| e.state.clone());
        assert_eq!(state.and_then(|s| s.local(0)), None);
        Ok(())
    }

    #[test]
    fn test_first_visit_keeps_state() -> Result<()> {
        let env = BuildEnv::new(Arc::new(ClassHierarchy::new()));
        let config = BuilderConfig::default().with_liveness_pruning(false);
        let mut ctx = BuildContext::new(&env, &config);
        let scope = scope_for(diamond()?, &config)?;
        let mut parser = BlockParser::new(&mut ctx, scope);

        let mut state = FrameState::new(1);
        let local = parser.ctx.graph.add_node(NodeKind::Parameter { index: 0 }, vec![]);
        let pushed = parser.ctx.graph.add_node(NodeKind::Constant(7), vec![]);
        state.store_local(Position::new(0), 0, FrameValue::int(local))?;
        state.push(FrameValue::int(pushed));

        let target = BlockId::new(1);
        let stub = parser.create_target(BlockId::new(0), target, state.clone(), Position::new(1))?;
        assert_eq!(parser.ctx.graph.kind(stub), Some(&NodeKind::Begin));
        let entry = parser.scope.entry(target);
        assert_eq!(entry.map(|e| e.node), Some(stub));
        assert_eq!(entry.and_then(|e| e.state.as_ref()), Some(&state));
        Ok(())
    }
}
