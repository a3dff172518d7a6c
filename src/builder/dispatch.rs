//! Lowering of exception dispatch blocks into type tests.
//!
//! Every handler covering a position owns one dispatch block. The blocks are chained in
//! handler-table order: a block tests its catch type and either enters the handler or
//! falls to the next block of the chain, the last of which leads to the unwind block.

use tracing::trace;

use crate::{
    analysis::BlockId,
    builder::{parser::BlockParser, report::UnresolvedKind},
    frame::{FrameValue, ValueKind},
    ir::{DeoptReason, EdgeKind, NodeKind},
    metadata::Resolution,
    Result,
};

/// Profile-free probability that a dispatch test matches.
pub(crate) const DISPATCH_MATCH_PROBABILITY: f64 = 0.5;

impl BlockParser<'_, '_> {
    /// Parses the dispatch block for handler `handler`.
    pub(crate) fn process_dispatch(
        &mut self,
        block: BlockId,
        handler: usize,
        next: Option<BlockId>,
    ) -> Result<()> {
        let entry = self.scope.entry_mut(block)?;
        entry.processed = true;
        let node = entry.node;
        let mut state = entry
            .state
            .clone()
            .ok_or_else(|| malformed_error!("Dispatch block {} has no entry state", block))?;

        let info = *self
            .scope
            .body
            .handlers
            .get(handler)
            .ok_or_else(|| malformed_error!("Handler {} does not exist", handler))?;
        let position = self.scope.blocks.block(block).start;

        let exception = match state.stack() {
            [value] if value.kind == ValueKind::Object => *value,
            stack => {
                return Err(verification_error!(
                    position,
                    "exception dispatch expects a single object on the stack, found {} values",
                    stack.len()
                ))
            }
        };
        if self.ctx.graph.kind(node).is_some_and(NodeKind::is_merge) {
            self.attach_snapshot(node, &state, position)?;
        }

        let handler_block = self.block_at(info.handler)?;
        let Some(catch_type) = info.catch_type else {
            trace!(%block, handler, "catch-all handler");
            let stub = self.resolve_target(block, handler_block, state, 1.0, position)?;
            self.ctx.graph.add_edge(node, stub, EdgeKind::Next, 1.0)?;
            return Ok(());
        };

        let no_match = next.ok_or_else(|| {
            malformed_error!("Typed handler {} has no dispatch successor", handler)
        })?;

        let skipped = self.ctx.config.skipped_exception_types.contains(&catch_type);
        if !skipped {
            if let Resolution::Unresolved(reason) = self.ctx.env.metadata.type_info(catch_type) {
                self.record_unresolved(position, UnresolvedKind::Type(catch_type), reason);
                let deopt = self.ctx.graph.add_node(
                    NodeKind::Deoptimize {
                        reason: DeoptReason::Unresolved,
                    },
                    vec![],
                );
                self.attach_snapshot(deopt, &state, position)?;
                self.ctx.graph.add_edge(node, deopt, EdgeKind::Next, 1.0)?;
                return Ok(());
            }
        }

        let test = self
            .ctx
            .graph
            .add_node(NodeKind::InstanceOf { ty: catch_type }, vec![exception.node]);
        let split = self.ctx.graph.add_node(NodeKind::If, vec![test]);
        self.ctx.graph.add_edge(node, split, EdgeKind::Next, 1.0)?;

        let matched = if skipped {
            trace!(%block, %catch_type, "handler type is skipped");
            0.0
        } else {
            DISPATCH_MATCH_PROBABILITY
        };

        if skipped {
            let deopt = self.ctx.graph.add_node(
                NodeKind::Deoptimize {
                    reason: DeoptReason::Unreached,
                },
                vec![],
            );
            self.attach_snapshot(deopt, &state, position)?;
            let begin = self.begin_stub(deopt)?;
            self.ctx.graph.add_edge(split, begin, EdgeKind::True, matched)?;
        } else {
            let mut narrowed = state.clone();
            let pi = self
                .ctx
                .graph
                .add_node(NodeKind::Pi { ty: catch_type }, vec![exception.node]);
            narrowed.clear_stack();
            narrowed.push(FrameValue::object(pi));
            self.add_branch(
                block,
                split,
                handler_block,
                narrowed,
                matched,
                EdgeKind::True,
                position,
            )?;
        }

        // The state is handed to the next test unchanged.
        state.clear_stack();
        state.push(exception);
        self.add_branch(
            block,
            split,
            no_match,
            state,
            1.0 - matched,
            EdgeKind::False,
            position,
        )
    }
}
