use std::{collections::HashSet, sync::Arc};

use crate::{bytecode::Position, frame::FrameValue, ir::NodeId, metadata::MethodId};

/// Immutable capture of a [`crate::frame::FrameState`] at a position.
///
/// Inlined frames chain the caller's snapshot at the call site through `outer`, so the full
/// interpreter stack can be rebuilt from the innermost snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSnapshot {
    method: MethodId,
    position: Position,
    locals: Vec<Option<FrameValue>>,
    stack: Vec<FrameValue>,
    monitors: Vec<FrameValue>,
    outer: Option<Arc<FrameSnapshot>>,
}

impl FrameSnapshot {
    pub(crate) fn new(
        method: MethodId,
        position: Position,
        locals: Vec<Option<FrameValue>>,
        stack: Vec<FrameValue>,
        monitors: Vec<FrameValue>,
        outer: Option<Arc<FrameSnapshot>>,
    ) -> Self {
        Self {
            method,
            position,
            locals,
            stack,
            monitors,
            outer,
        }
    }

    /// Method the frame belongs to.
    #[must_use]
    pub fn method(&self) -> MethodId {
        self.method
    }

    /// Position at which the frame was captured.
    #[must_use]
    pub fn position(&self) -> Position {
        self.position
    }

    /// Captured locals; `None` marks a dead or undefined slot.
    #[must_use]
    pub fn locals(&self) -> &[Option<FrameValue>] {
        &self.locals
    }

    /// Captured operand stack, bottom first.
    #[must_use]
    pub fn stack(&self) -> &[FrameValue] {
        &self.stack
    }

    /// Objects whose monitors are held, outermost first.
    #[must_use]
    pub fn monitors(&self) -> &[FrameValue] {
        &self.monitors
    }

    /// Snapshot of the calling frame for inlined code.
    #[must_use]
    pub fn outer(&self) -> Option<&Arc<FrameSnapshot>> {
        self.outer.as_ref()
    }

    /// Number of frames in the chain, this one included.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        1 + self.outer.as_ref().map_or(0, |o| o.frame_count())
    }

    /// Iterates every value referenced by this frame (not the outer frames).
    pub fn values(&self) -> impl Iterator<Item = &FrameValue> + '_ {
        self.locals
            .iter()
            .flatten()
            .chain(self.stack.iter())
            .chain(self.monitors.iter())
    }

    /// Returns `true` if this frame or an outer one references a node of `nodes`.
    pub(crate) fn references_any(&self, nodes: &HashSet<NodeId>) -> bool {
        self.values().any(|v| nodes.contains(&v.node))
            || self.outer.as_ref().is_some_and(|o| o.references_any(nodes))
    }

    /// Returns a copy in which every local holding one of `dead` is undefined, in this frame
    /// and the outer ones. `None` if a stack slot or a monitor holds one of them.
    pub(crate) fn without_locals(&self, dead: &HashSet<NodeId>) -> Option<Arc<FrameSnapshot>> {
        if self
            .stack
            .iter()
            .chain(self.monitors.iter())
            .any(|v| dead.contains(&v.node))
        {
            return None;
        }
        let outer = match &self.outer {
            Some(o) if o.references_any(dead) => Some(o.without_locals(dead)?),
            other => other.clone(),
        };
        let locals = self
            .locals
            .iter()
            .map(|l| l.filter(|v| !dead.contains(&v.node)))
            .collect();
        Some(Arc::new(FrameSnapshot {
            method: self.method,
            position: self.position,
            locals,
            stack: self.stack.clone(),
            monitors: self.monitors.clone(),
            outer,
        }))
    }
}
