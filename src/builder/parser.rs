//! The block walk and the translation of individual instructions.

use std::{iter, mem, sync::Arc};

use tracing::trace;

use crate::{
    analysis::{BlockId, BlockKind},
    builder::{
        report::{UnresolvedKind, UnresolvedReference},
        scope::{BlockEntry, BuildContext, MethodScope, ScopeExit, ScopeExits},
        EXCEPTION_EDGE_PROBABILITY,
    },
    bytecode::{ArithOp, BytecodeStream, Condition, Opcode, Position},
    frame::{FrameState, FrameValue, ValueKind},
    ir::{DeoptReason, EdgeKind, NodeId, NodeKind},
    metadata::{Resolution, TypeId},
    Result,
};

/// Translates the blocks of one method into the shared graph.
///
/// Inlining creates a nested parser for the callee that borrows the same
/// [`BuildContext`]; everything per-method lives in the [`MethodScope`].
pub(crate) struct BlockParser<'c, 'env> {
    pub(crate) ctx: &'c mut BuildContext<'env>,
    pub(crate) scope: MethodScope,
}

/// Parsing position inside one block.
#[derive(Debug)]
pub(crate) struct Cursor {
    pub(crate) block: BlockId,
    pub(crate) position: Position,
    pub(crate) state: FrameState,
    /// Control point new fixed nodes are linked to; `None` once control has left the block
    pub(crate) last: Option<NodeId>,
}

impl<'c, 'env> BlockParser<'c, 'env> {
    pub(crate) fn new(ctx: &'c mut BuildContext<'env>, scope: MethodScope) -> Self {
        Self { ctx, scope }
    }

    /// Parses every reachable block in reverse postorder.
    ///
    /// `predecessor` is the caller's control point when the method is inlined; the root
    /// method instead becomes the graph's start.
    pub(crate) fn parse(
        mut self,
        state: FrameState,
        predecessor: Option<NodeId>,
    ) -> Result<ScopeExits> {
        self.create_loop_headers()?;
        self.connect_entry(state, predecessor)?;

        for index in 0..self.scope.blocks.len() {
            let block = BlockId::new(index);
            if !self.scope.entry(block).is_some_and(|e| e.state.is_some()) {
                continue;
            }
            let (kind, start) = {
                let b = self.scope.blocks.block(block);
                (b.kind, b.start)
            };
            self.ctx.check_budget(start)?;
            trace!(method = %self.scope.id(), %block, "parsing block");

            match kind {
                BlockKind::Instructions => self.process_instructions(block)?,
                BlockKind::ExceptionDispatch { handler, next } => {
                    self.process_dispatch(block, handler, next)?;
                }
                BlockKind::Return => self.process_return_block(block)?,
                BlockKind::Unwind => self.process_unwind_block(block)?,
            }
        }
        Ok(self.scope.exits)
    }

    fn create_loop_headers(&mut self) -> Result<()> {
        for loop_index in 0..self.scope.blocks.loop_count() {
            let block = self
                .scope
                .blocks
                .loop_header_of(loop_index)
                .ok_or_else(|| malformed_error!("Loop {} has no header block", loop_index))?;
            let header = self
                .ctx
                .graph
                .add_node(NodeKind::LoopHeader { loop_index }, vec![]);
            self.scope.entries[block.index()] = Some(BlockEntry {
                node: header,
                state: None,
                processed: false,
            });
            self.scope.loop_headers.push(header);
            self.scope.loop_marks.push(usize::MAX);
        }
        Ok(())
    }

    fn connect_entry(&mut self, state: FrameState, predecessor: Option<NodeId>) -> Result<()> {
        let entry_block = BlockId::new(0);
        let origin = Position::new(0);
        let begin = self.ctx.graph.add_node(NodeKind::Begin, vec![]);
        match predecessor {
            Some(pred) => {
                self.ctx.graph.add_edge(pred, begin, EdgeKind::Next, 1.0)?;
            }
            None => {
                self.ctx.graph.set_start(begin);
                let snapshot = self.scope.snapshot(&state, origin);
                self.ctx.graph.set_snapshot(begin, snapshot)?;
            }
        }

        if self.scope.blocks.block(entry_block).is_loop_header() {
            let end = self.add_loop_entry(entry_block, state, origin)?;
            self.ctx.graph.add_edge(begin, end, EdgeKind::Next, 1.0)?;
        } else {
            let state = self.prune(state, entry_block);
            self.scope.entries[entry_block.index()] = Some(BlockEntry {
                node: begin,
                state: Some(state),
                processed: false,
            });
        }
        Ok(())
    }

    /// Takes the entry of `block` for processing.
    fn open_block(&mut self, block: BlockId) -> Result<(NodeId, FrameState)> {
        let entry = self.scope.entry_mut(block)?;
        entry.processed = true;
        let node = entry.node;
        let state = entry
            .state
            .clone()
            .ok_or_else(|| malformed_error!("Block {} has no entry state", block))?;
        Ok((node, state))
    }

    /// Attaches the entry snapshot to a merge; other entry nodes carry none.
    fn snapshot_merge(&mut self, node: NodeId, state: &FrameState, position: Position) -> Result<()> {
        if self.ctx.graph.kind(node).is_some_and(NodeKind::is_merge) {
            self.attach_snapshot(node, state, position)?;
        }
        Ok(())
    }

    fn process_instructions(&mut self, block: BlockId) -> Result<()> {
        let (node, mut state) = self.open_block(block)?;
        let (start, end, loop_header) = {
            let b = self.scope.blocks.block(block);
            (b.start, b.end, b.loop_header)
        };
        if let Some(loop_index) = loop_header {
            self.begin_loop(loop_index, node, &mut state)?;
            self.scope.entry_mut(block)?.state = Some(state.clone());
        }
        self.snapshot_merge(node, &state, start)?;

        let body = Arc::clone(&self.scope.body);
        let mut stream = BytecodeStream::new(&body);
        stream.set_position(start);
        let mut cur = Cursor {
            block,
            position: start,
            state,
            last: Some(node),
        };
        while cur.last.is_some() && stream.position() < end {
            let Some(opcode) = stream.current_opcode() else {
                break;
            };
            cur.position = stream.position();
            self.process_opcode(&mut cur, opcode)?;
            stream.advance();
        }

        if cur.last.is_some() {
            let next = self.scope.blocks.block_at(end).ok_or_else(|| {
                malformed_error!("Block {} falls through past the end of the method", block)
            })?;
            self.jump(&mut cur, next)?;
        }
        Ok(())
    }

    fn process_opcode(&mut self, cur: &mut Cursor, opcode: &Opcode) -> Result<()> {
        let pos = cur.position;
        match opcode {
            Opcode::Nop => {}
            Opcode::Const(value) => {
                let node = self.constant(*value);
                cur.state.push(FrameValue::int(node));
            }
            Opcode::ConstNull => {
                let node = self.ctx.graph.add_node(NodeKind::Null, vec![]);
                cur.state.push(FrameValue::object(node));
            }
            Opcode::Load(slot) => {
                let value = cur.state.load_local(pos, *slot)?;
                cur.state.push(value);
            }
            Opcode::Store(slot) => {
                let value = cur.state.pop(pos)?;
                cur.state.store_local(pos, *slot, value)?;
            }
            Opcode::Pop => {
                cur.state.pop(pos)?;
            }
            Opcode::Dup => {
                let value = cur
                    .state
                    .peek()
                    .copied()
                    .ok_or_else(|| verification_error!(pos, "operand stack underflow"))?;
                cur.state.push(value);
            }
            Opcode::Swap => {
                let b = cur.state.pop(pos)?;
                let a = cur.state.pop(pos)?;
                cur.state.push(b);
                cur.state.push(a);
            }
            Opcode::Arith(op) => self.arithmetic(cur, *op)?,
            Opcode::If { cond, target } => {
                let b = cur.state.pop_kind(pos, ValueKind::Int)?;
                let a = cur.state.pop_kind(pos, ValueKind::Int)?;
                let compare = self
                    .ctx
                    .graph
                    .add_node(NodeKind::Compare { cond: *cond }, vec![a.node, b.node]);
                self.branch(cur, compare, *target)?;
            }
            Opcode::IfZero { cond, target } => {
                let a = cur.state.pop_kind(pos, ValueKind::Int)?;
                let zero = self.constant(0);
                let compare = self
                    .ctx
                    .graph
                    .add_node(NodeKind::Compare { cond: *cond }, vec![a.node, zero]);
                self.branch(cur, compare, *target)?;
            }
            Opcode::IfNull { target } => self.null_branch(cur, Condition::Eq, *target)?,
            Opcode::IfNonNull { target } => self.null_branch(cur, Condition::Ne, *target)?,
            Opcode::Goto(target) => {
                let target = self.block_at(*target)?;
                self.jump(cur, target)?;
            }
            Opcode::Switch {
                keys,
                targets,
                default,
            } => self.switch(cur, keys, targets, *default)?,
            Opcode::Invoke { kind, method } => self.invoke(cur, *kind, *method)?,
            Opcode::New(ty) => {
                if self.resolve_type(cur, *ty)? {
                    let snapshot = self.scope.snapshot(&cur.state, pos);
                    let node = self.append(cur, NodeKind::New { ty: *ty }, vec![])?;
                    self.ctx.graph.set_snapshot(node, snapshot)?;
                    cur.state.push(FrameValue::object(node));
                }
            }
            Opcode::CheckCast(ty) => {
                if self.resolve_type(cur, *ty)? {
                    let snapshot = self.scope.snapshot(&cur.state, pos);
                    let object = cur.state.pop_kind(pos, ValueKind::Object)?;
                    let node = self.append(cur, NodeKind::CheckCast { ty: *ty }, vec![object.node])?;
                    self.ctx.graph.set_snapshot(node, snapshot)?;
                    cur.state.push(FrameValue::object(node));
                }
            }
            Opcode::InstanceOf(ty) => {
                if self.resolve_type(cur, *ty)? {
                    let object = cur.state.pop_kind(pos, ValueKind::Object)?;
                    let node = self
                        .ctx
                        .graph
                        .add_node(NodeKind::InstanceOf { ty: *ty }, vec![object.node]);
                    cur.state.push(FrameValue::int(node));
                }
            }
            Opcode::Throw => {
                let exception = cur.state.pop_kind(pos, ValueKind::Object)?;
                let last = self.take_last(cur)?;
                self.dispatch_exception(cur.block, last, &cur.state, exception, pos)?;
            }
            Opcode::Return => self.emit_return(cur, None)?,
            Opcode::ReturnValue => {
                let value = cur.state.pop(pos)?;
                self.emit_return(cur, Some(value))?;
            }
            Opcode::MonitorEnter => {
                let object = cur.state.pop_kind(pos, ValueKind::Object)?;
                let node = self.append(cur, NodeKind::MonitorEnter, vec![object.node])?;
                cur.state.enter_monitor(object);
                self.attach_snapshot(node, &cur.state, pos.next())?;
            }
            Opcode::MonitorExit => {
                let object = cur.state.pop_kind(pos, ValueKind::Object)?;
                cur.state.exit_monitor(pos)?;
                let node = self.append(cur, NodeKind::MonitorExit, vec![object.node])?;
                self.attach_snapshot(node, &cur.state, pos.next())?;
            }
        }
        Ok(())
    }

    fn arithmetic(&mut self, cur: &mut Cursor, op: ArithOp) -> Result<()> {
        let pos = cur.position;
        if op.is_unary() {
            let a = cur.state.pop_kind(pos, ValueKind::Int)?;
            let node = self
                .ctx
                .graph
                .add_node(NodeKind::Arithmetic { op }, vec![a.node]);
            cur.state.push(FrameValue::int(node));
            return Ok(());
        }

        let b = cur.state.pop_kind(pos, ValueKind::Int)?;
        let a = cur.state.pop_kind(pos, ValueKind::Int)?;
        if op.can_throw() && self.needs_zero_check(pos) {
            self.zero_check(cur, b)?;
        }
        let node = self
            .ctx
            .graph
            .add_node(NodeKind::Arithmetic { op }, vec![a.node, b.node]);
        cur.state.push(FrameValue::int(node));
        Ok(())
    }

    /// A division needs an explicit check when its exception is observed and has happened.
    fn needs_zero_check(&self, position: Position) -> bool {
        self.scope.exception_observable(position)
            && self.scope.profile(self.ctx.env).exception_seen(position)
    }

    /// Splits control on `divisor == 0`; the zero branch raises into the handler chain.
    fn zero_check(&mut self, cur: &mut Cursor, divisor: FrameValue) -> Result<()> {
        let pos = cur.position;
        let zero = self.constant(0);
        let compare = self.ctx.graph.add_node(
            NodeKind::Compare {
                cond: Condition::Eq,
            },
            vec![divisor.node, zero],
        );
        let split = self.append(cur, NodeKind::If, vec![compare])?;

        let exception = self.exception_object(&cur.state, pos)?;
        self.ctx
            .graph
            .add_edge(split, exception, EdgeKind::True, EXCEPTION_EDGE_PROBABILITY)?;
        self.dispatch_exception(
            cur.block,
            exception,
            &cur.state,
            FrameValue::object(exception),
            pos,
        )?;

        let proceed = self.ctx.graph.add_node(NodeKind::Begin, vec![]);
        self.ctx.graph.add_edge(
            split,
            proceed,
            EdgeKind::False,
            1.0 - EXCEPTION_EDGE_PROBABILITY,
        )?;
        cur.last = Some(proceed);
        Ok(())
    }

    fn null_branch(&mut self, cur: &mut Cursor, cond: Condition, target: Position) -> Result<()> {
        let object = cur.state.pop_kind(cur.position, ValueKind::Object)?;
        let null = self.ctx.graph.add_node(NodeKind::Null, vec![]);
        let compare = self
            .ctx
            .graph
            .add_node(NodeKind::Compare { cond }, vec![object.node, null]);
        self.branch(cur, compare, target)
    }

    /// Two-way split on `condition`; the explicit target is the `True` successor.
    fn branch(&mut self, cur: &mut Cursor, condition: NodeId, target: Position) -> Result<()> {
        let pos = cur.position;
        let taken = self.scope.profile(self.ctx.env).branch_probability(pos);
        let split = self.append(cur, NodeKind::If, vec![condition])?;
        let target = self.block_at(target)?;
        let fall_through = self.block_at(pos.next())?;

        self.add_branch(cur.block, split, target, cur.state.clone(), taken, EdgeKind::True, pos)?;
        self.add_branch(
            cur.block,
            split,
            fall_through,
            mem::take(&mut cur.state),
            1.0 - taken,
            EdgeKind::False,
            pos,
        )?;
        cur.last = None;
        Ok(())
    }

    fn switch(
        &mut self,
        cur: &mut Cursor,
        keys: &[i64],
        targets: &[Position],
        default: Position,
    ) -> Result<()> {
        let pos = cur.position;
        let key = cur.state.pop_kind(pos, ValueKind::Int)?;
        let probabilities = self
            .scope
            .profile(self.ctx.env)
            .switch_probabilities(pos, targets.len() + 1);
        let split = self.append(
            cur,
            NodeKind::Switch {
                keys: keys.to_vec(),
            },
            vec![key.node],
        )?;

        let successors = targets.iter().chain(iter::once(&default));
        for (index, (target, probability)) in successors.zip(probabilities).enumerate() {
            let kind = if index < targets.len() {
                EdgeKind::Case(index)
            } else {
                EdgeKind::Default
            };
            let target = self.block_at(*target)?;
            self.add_branch(cur.block, split, target, cur.state.clone(), probability, kind, pos)?;
        }
        cur.last = None;
        Ok(())
    }

    /// Links one successor of a control split, wrapping the stub in a `Begin` if needed.
    pub(crate) fn add_branch(
        &mut self,
        from: BlockId,
        split: NodeId,
        target: BlockId,
        state: FrameState,
        probability: f64,
        kind: EdgeKind,
        position: Position,
    ) -> Result<()> {
        let stub = self.resolve_target(from, target, state, probability, position)?;
        let stub = self.begin_stub(stub)?;
        self.ctx.graph.add_edge(split, stub, kind, probability)?;
        Ok(())
    }

    /// Unconditional transfer to `target`.
    fn jump(&mut self, cur: &mut Cursor, target: BlockId) -> Result<()> {
        let state = mem::take(&mut cur.state);
        let stub = self.resolve_target(cur.block, target, state, 1.0, cur.position)?;
        let last = self.take_last(cur)?;
        self.ctx.graph.add_edge(last, stub, EdgeKind::Next, 1.0)?;
        Ok(())
    }

    fn emit_return(&mut self, cur: &mut Cursor, value: Option<FrameValue>) -> Result<()> {
        let pos = cur.position;
        let expected = self.scope.method.return_kind;
        match value {
            None if expected != ValueKind::Void => {
                return Err(verification_error!(pos, "missing {} return value", expected));
            }
            Some(v) if v.kind != expected => {
                return Err(verification_error!(
                    pos,
                    "returning {} from a method declared {}",
                    v.kind,
                    expected
                ));
            }
            _ => {}
        }
        if cur.state.monitor_depth() != 0 {
            return Err(verification_error!(
                pos,
                "returning with {} monitors held",
                cur.state.monitor_depth()
            ));
        }

        let mut state = mem::take(&mut cur.state);
        if let Some(v) = value {
            state.push(v);
        }
        let return_block = self.scope.blocks.return_block();
        let (mut state, exits) = self.check_loop_exit(cur.block, return_block, state, pos)?;
        let value = match value {
            Some(_) => Some(state.pop(pos)?),
            None => None,
        };

        let stub = if self.scope.depth == 0 {
            let inputs = value.map(|v| vec![v.node]).unwrap_or_default();
            self.ctx.graph.add_node(NodeKind::Return, inputs)
        } else {
            let mut result = FrameState::new(0);
            if let Some(v) = value {
                result.push(v);
            }
            self.create_target(cur.block, return_block, result, pos)?
        };
        let head = self.prepend_exits(exits, stub)?;
        let last = self.take_last(cur)?;
        self.ctx.graph.add_edge(last, head, EdgeKind::Next, 1.0)?;
        Ok(())
    }

    /// The merged returns of an inlined method.
    fn process_return_block(&mut self, block: BlockId) -> Result<()> {
        let (node, state) = self.open_block(block)?;
        self.scope.exits.returned = Some(ScopeExit { node, state });
        Ok(())
    }

    /// Exceptions leaving the method: `Unwind` at the root, an exit for the caller otherwise.
    fn process_unwind_block(&mut self, block: BlockId) -> Result<()> {
        let (node, state) = self.open_block(block)?;
        if self.scope.depth > 0 {
            self.scope.exits.unwound = Some(ScopeExit { node, state });
            return Ok(());
        }

        let start = self.scope.blocks.block(block).start;
        self.snapshot_merge(node, &state, start)?;
        let exception = state
            .peek()
            .copied()
            .ok_or_else(|| verification_error!(start, "unwinding without an exception"))?;
        let unwind = self
            .ctx
            .graph
            .add_node(NodeKind::Unwind, vec![exception.node]);
        self.ctx.graph.add_edge(node, unwind, EdgeKind::Next, 1.0)?;
        Ok(())
    }

    /// Creates an `ExceptionObject` whose snapshot holds only the exception on the stack.
    pub(crate) fn exception_object(&mut self, state: &FrameState, position: Position) -> Result<NodeId> {
        let node = self.ctx.graph.add_node(NodeKind::ExceptionObject, vec![]);
        let mut state = state.clone();
        state.clear_stack();
        state.push(FrameValue::object(node));
        self.attach_snapshot(node, &state, position)?;
        Ok(node)
    }

    /// Routes `exception`, raised at `position`, from control point `from` to the first
    /// dispatch block covering `position` or to the unwind block.
    pub(crate) fn dispatch_exception(
        &mut self,
        block: BlockId,
        from: NodeId,
        state: &FrameState,
        exception: FrameValue,
        position: Position,
    ) -> Result<()> {
        let mut state = state.clone();
        state.clear_stack();
        state.push(exception);
        let target = self.scope.exception_target(position);
        let stub = self.resolve_target(block, target, state, 1.0, position)?;
        self.ctx.graph.add_edge(from, stub, EdgeKind::Next, 1.0)?;
        Ok(())
    }

    /// Returns `true` if `ty` resolves; otherwise ends the block with a deoptimization.
    fn resolve_type(&mut self, cur: &mut Cursor, ty: TypeId) -> Result<bool> {
        match self.ctx.env.metadata.type_info(ty) {
            Resolution::Resolved(_) => Ok(true),
            Resolution::Unresolved(reason) => {
                self.record_unresolved(cur.position, UnresolvedKind::Type(ty), reason);
                self.deoptimize(cur, DeoptReason::Unresolved)?;
                Ok(false)
            }
        }
    }

    pub(crate) fn record_unresolved(&mut self, position: Position, kind: UnresolvedKind, reason: String) {
        trace!(method = %self.scope.id(), %position, ?kind, "unresolved reference");
        self.ctx.report.unresolved.push(UnresolvedReference {
            method: self.scope.id(),
            position,
            kind,
            reason,
        });
    }

    /// Ends the block with a deoptimization that resumes before the current instruction.
    pub(crate) fn deoptimize(&mut self, cur: &mut Cursor, reason: DeoptReason) -> Result<()> {
        let node = self
            .ctx
            .graph
            .add_node(NodeKind::Deoptimize { reason }, vec![]);
        self.attach_snapshot(node, &cur.state, cur.position)?;
        let last = self.take_last(cur)?;
        self.ctx.graph.add_edge(last, node, EdgeKind::Next, 1.0)?;
        Ok(())
    }

    /// Appends a fixed node after the cursor's control point.
    pub(crate) fn append(&mut self, cur: &mut Cursor, kind: NodeKind, inputs: Vec<NodeId>) -> Result<NodeId> {
        let last = self.take_last(cur)?;
        let node = self.ctx.graph.add_node(kind, inputs);
        self.ctx.graph.add_edge(last, node, EdgeKind::Next, 1.0)?;
        cur.last = Some(node);
        Ok(node)
    }

    pub(crate) fn take_last(&self, cur: &mut Cursor) -> Result<NodeId> {
        cur.last.take().ok_or_else(|| {
            malformed_error!(
                "No control point at {} in {}",
                cur.position,
                self.scope.id()
            )
        })
    }

    pub(crate) fn attach_snapshot(
        &mut self,
        node: NodeId,
        state: &FrameState,
        position: Position,
    ) -> Result<()> {
        let snapshot = self.scope.snapshot(state, position);
        self.ctx.graph.set_snapshot(node, snapshot)
    }

    /// Successors of control splits must be begin-like.
    pub(crate) fn begin_stub(&mut self, stub: NodeId) -> Result<NodeId> {
        if self.ctx.graph.kind(stub).is_some_and(NodeKind::is_begin_like) {
            return Ok(stub);
        }
        let begin = self.ctx.graph.add_node(NodeKind::Begin, vec![]);
        self.ctx.graph.add_edge(begin, stub, EdgeKind::Next, 1.0)?;
        Ok(begin)
    }

    pub(crate) fn constant(&mut self, value: i64) -> NodeId {
        self.ctx.graph.add_node(NodeKind::Constant(value), vec![])
    }

    pub(crate) fn block_at(&self, position: Position) -> Result<BlockId> {
        self.scope
            .blocks
            .block_at(position)
            .ok_or_else(|| malformed_error!("No block starts at {}", position))
    }
}
