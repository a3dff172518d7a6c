use std::{collections::HashSet, sync::Arc};

use crate::{
    analysis::{BlockId, LivenessOracle},
    bytecode::Position,
    frame::{FrameSnapshot, FrameValue, ValueKind},
    ir::NodeId,
    metadata::MethodId,
    Result,
};

/// Operand stack, locals and held monitors of one frame.
///
/// All fallible operations take the position of the instruction being executed so a
/// failure can be reported as a verification error at that position.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameState {
    locals: Vec<Option<FrameValue>>,
    stack: Vec<FrameValue>,
    monitors: Vec<FrameValue>,
}

impl FrameState {
    /// Creates a state with `max_locals` undefined locals and an empty stack.
    #[must_use]
    pub fn new(max_locals: u16) -> Self {
        Self {
            locals: vec![None; usize::from(max_locals)],
            stack: Vec::new(),
            monitors: Vec::new(),
        }
    }

    /// Creates the entry state of a method: arguments in the first local slots.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Verification`] if there are more arguments than locals.
    pub fn with_args(max_locals: u16, args: &[FrameValue]) -> Result<Self> {
        if args.len() > usize::from(max_locals) {
            return Err(verification_error!(
                Position::new(0),
                "{} arguments do not fit in {} locals",
                args.len(),
                max_locals
            ));
        }
        let mut state = Self::new(max_locals);
        for (slot, arg) in args.iter().enumerate() {
            state.locals[slot] = Some(*arg);
        }
        Ok(state)
    }

    /// Pushes a value.
    pub fn push(&mut self, value: FrameValue) {
        self.stack.push(value);
    }

    /// Pops a value.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Verification`] on stack underflow.
    pub fn pop(&mut self, position: Position) -> Result<FrameValue> {
        self.stack
            .pop()
            .ok_or_else(|| verification_error!(position, "operand stack underflow"))
    }

    /// Pops a value that must be of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Verification`] on underflow or a kind mismatch.
    pub fn pop_kind(&mut self, position: Position, kind: ValueKind) -> Result<FrameValue> {
        let value = self.pop(position)?;
        if value.kind != kind {
            return Err(verification_error!(
                position,
                "expected {} on the stack, found {}",
                kind,
                value.kind
            ));
        }
        Ok(value)
    }

    /// Returns the top of stack.
    #[must_use]
    pub fn peek(&self) -> Option<&FrameValue> {
        self.stack.last()
    }

    /// Reads a local.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Verification`] if the slot does not exist or is undefined.
    pub fn load_local(&self, position: Position, slot: u16) -> Result<FrameValue> {
        self.locals
            .get(usize::from(slot))
            .copied()
            .flatten()
            .ok_or_else(|| verification_error!(position, "local {} is undefined", slot))
    }

    /// Writes a local.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Verification`] if the slot does not exist.
    pub fn store_local(&mut self, position: Position, slot: u16, value: FrameValue) -> Result<()> {
        match self.locals.get_mut(usize::from(slot)) {
            Some(local) => {
                *local = Some(value);
                Ok(())
            }
            None => Err(verification_error!(position, "local {} out of range", slot)),
        }
    }

    /// Returns the value of a local, `None` if undefined or out of range.
    #[must_use]
    pub fn local(&self, slot: usize) -> Option<FrameValue> {
        self.locals.get(slot).copied().flatten()
    }

    /// Removes every stack value.
    pub fn clear_stack(&mut self) {
        self.stack.clear();
    }

    /// Removes every local.
    pub fn clear_locals(&mut self) {
        self.locals.iter_mut().for_each(|l| *l = None);
    }

    /// Number of values on the operand stack.
    #[must_use]
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Number of held monitors.
    #[must_use]
    pub fn monitor_depth(&self) -> usize {
        self.monitors.len()
    }

    /// Records that the monitor of `object` is now held.
    pub fn enter_monitor(&mut self, object: FrameValue) {
        self.monitors.push(object);
    }

    /// Releases the innermost held monitor.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Verification`] if no monitor is held.
    pub fn exit_monitor(&mut self, position: Position) -> Result<FrameValue> {
        self.monitors
            .pop()
            .ok_or_else(|| verification_error!(position, "monitor exit without matching enter"))
    }

    /// Locals, indexed by slot.
    #[must_use]
    pub fn locals(&self) -> &[Option<FrameValue>] {
        &self.locals
    }

    /// Operand stack, bottom first.
    #[must_use]
    pub fn stack(&self) -> &[FrameValue] {
        &self.stack
    }

    /// Held monitors, outermost first.
    #[must_use]
    pub fn monitors(&self) -> &[FrameValue] {
        &self.monitors
    }

    pub(crate) fn locals_mut(&mut self) -> &mut [Option<FrameValue>] {
        &mut self.locals
    }

    pub(crate) fn stack_mut(&mut self) -> &mut [FrameValue] {
        &mut self.stack
    }

    pub(crate) fn monitors_mut(&mut self) -> &mut [FrameValue] {
        &mut self.monitors
    }

    /// Returns `true` if both states can flow into the same block: equal stack depth with
    /// equal kinds slot by slot, and equal monitor depth.
    #[must_use]
    pub fn is_compatible_with(&self, other: &FrameState) -> bool {
        self.stack.len() == other.stack.len()
            && self
                .stack
                .iter()
                .zip(other.stack.iter())
                .all(|(a, b)| a.kind == b.kind)
            && self.monitors.len() == other.monitors.len()
    }

    /// Like [`FrameState::is_compatible_with`] but explains the mismatch.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Verification`] describing the first difference.
    pub fn check_compatible(&self, position: Position, other: &FrameState) -> Result<()> {
        if self.stack.len() != other.stack.len() {
            return Err(verification_error!(
                position,
                "stack depth mismatch at merge: {} vs {}",
                self.stack.len(),
                other.stack.len()
            ));
        }
        for (idx, (a, b)) in self.stack.iter().zip(other.stack.iter()).enumerate() {
            if a.kind != b.kind {
                return Err(verification_error!(
                    position,
                    "stack slot {} kind mismatch at merge: {} vs {}",
                    idx,
                    a.kind,
                    b.kind
                ));
            }
        }
        if self.monitors.len() != other.monitors.len() {
            return Err(verification_error!(
                position,
                "monitor depth mismatch at merge: {} vs {}",
                self.monitors.len(),
                other.monitors.len()
            ));
        }
        Ok(())
    }

    /// Clears every local that is dead on entry to `block`.
    pub fn clear_dead_locals(&mut self, liveness: &dyn LivenessOracle, block: BlockId) {
        for (slot, local) in self.locals.iter_mut().enumerate() {
            if local.is_some() && !liveness.is_live_at(block, slot) {
                *local = None;
            }
        }
    }

    /// Clears every local holding one of `dead`.
    ///
    /// Returns `false`, leaving the state untouched, if a stack slot or a monitor holds
    /// one of them.
    pub(crate) fn clear_locals_in(&mut self, dead: &HashSet<NodeId>) -> bool {
        if self
            .stack
            .iter()
            .chain(self.monitors.iter())
            .any(|v| dead.contains(&v.node))
        {
            return false;
        }
        for local in &mut self.locals {
            if local.is_some_and(|v| dead.contains(&v.node)) {
                *local = None;
            }
        }
        true
    }

    /// Freezes the state.
    #[must_use]
    pub fn snapshot(
        &self,
        method: MethodId,
        position: Position,
        outer: Option<Arc<FrameSnapshot>>,
    ) -> Arc<FrameSnapshot> {
        Arc::new(FrameSnapshot::new(
            method,
            position,
            self.locals.clone(),
            self.stack.clone(),
            self.monitors.clone(),
            outer,
        ))
    }

    /// Iterates every defined value: locals, then stack, then monitors.
    pub fn values(&self) -> impl Iterator<Item = &FrameValue> + '_ {
        self.locals
            .iter()
            .flatten()
            .chain(self.stack.iter())
            .chain(self.monitors.iter())
    }

    /// Applies `f` to every defined value in place.
    pub fn for_each_value_mut(&mut self, mut f: impl FnMut(&mut FrameValue)) {
        self.locals.iter_mut().flatten().for_each(&mut f);
        self.stack.iter_mut().for_each(&mut f);
        self.monitors.iter_mut().for_each(&mut f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::NodeId;

    fn int(n: u32) -> FrameValue {
        FrameValue::int(NodeId::new(n))
    }

    struct OnlySlotZero;

    impl LivenessOracle for OnlySlotZero {
        fn is_live_at(&self, _block: BlockId, slot: usize) -> bool {
            slot == 0
        }
    }

    #[test]
    fn test_push_pop() -> Result<()> {
        let mut state = FrameState::new(0);
        state.push(int(1));
        state.push(FrameValue::object(NodeId::new(2)));

        assert_eq!(state.stack_depth(), 2);
        assert!(state.pop_kind(Position::new(0), ValueKind::Int).is_err());

        let mut state = FrameState::new(0);
        state.push(int(1));
        assert_eq!(state.pop(Position::new(0))?, int(1));
        assert!(state.pop(Position::new(3)).is_err());
        Ok(())
    }

    #[test]
    fn test_locals() -> Result<()> {
        let mut state = FrameState::with_args(3, &[int(1)])?;
        assert_eq!(state.load_local(Position::new(0), 0)?, int(1));
        assert!(state.load_local(Position::new(0), 1).is_err());
        assert!(state.store_local(Position::new(0), 5, int(2)).is_err());

        state.store_local(Position::new(0), 2, int(4))?;
        state.clear_dead_locals(&OnlySlotZero, BlockId::new(0));
        assert_eq!(state.local(0), Some(int(1)));
        assert_eq!(state.local(2), None);

        assert!(FrameState::with_args(0, &[int(1)]).is_err());
        Ok(())
    }

    #[test]
    fn test_monitors() {
        let mut state = FrameState::new(0);
        assert!(state.exit_monitor(Position::new(1)).is_err());
        state.enter_monitor(FrameValue::object(NodeId::new(7)));
        assert_eq!(state.monitor_depth(), 1);
        assert!(state.exit_monitor(Position::new(2)).is_ok());
    }

    #[test]
    fn test_compatibility() {
        let mut a = FrameState::new(1);
        let mut b = FrameState::new(1);
        a.push(int(1));
        b.push(int(2));
        assert!(a.is_compatible_with(&b));

        b.push(int(3));
        assert!(!a.is_compatible_with(&b));
        assert!(a.check_compatible(Position::new(4), &b).is_err());

        let mut c = FrameState::new(1);
        c.push(FrameValue::object(NodeId::new(5)));
        assert!(!a.is_compatible_with(&c));

        let mut d = a.clone();
        d.enter_monitor(FrameValue::object(NodeId::new(5)));
        assert!(!a.is_compatible_with(&d));
    }

    #[test]
    fn test_snapshot_chain() {
        let mut state = FrameState::new(1);
        state.push(int(9));
        let outer = state.snapshot(MethodId::new(1), Position::new(3), None);
        let inner = FrameState::new(0).snapshot(MethodId::new(2), Position::new(0), Some(outer));

        assert_eq!(inner.frame_count(), 2);
        assert_eq!(inner.outer().map(|o| o.stack().len()), Some(1));
        assert_eq!(inner.method(), MethodId::new(2));
    }

    #[test]
    fn test_for_each_value_mut() {
        let mut state = FrameState::with_args(2, &[int(1)]).unwrap_or_default();
        state.push(int(2));
        state.for_each_value_mut(|v| v.node = NodeId::new(v.node.index() as u32 + 10));
        let nodes: Vec<_> = state.values().map(|v| v.node).collect();
        assert_eq!(nodes, vec![NodeId::new(11), NodeId::new(12)]);
    }

    #[test]
    fn test_clear_locals_in() {
        let dead: HashSet<NodeId> = [NodeId::new(1)].into_iter().collect();
        let mut state = FrameState::with_args(3, &[int(1), int(2), int(1)]).unwrap_or_default();
        assert!(state.clear_locals_in(&dead));
        assert_eq!(state.local(0), None);
        assert_eq!(state.local(1), Some(int(2)));
        assert_eq!(state.local(2), None);

        let mut on_stack = FrameState::with_args(1, &[int(2)]).unwrap_or_default();
        on_stack.push(int(1));
        assert!(!on_stack.clear_locals_in(&dead));
        assert_eq!(on_stack.local(0), Some(int(2)));
    }
}
