//! Symbolic execution state of one interpreter frame.
//!
//! While a block is parsed, every operand stack slot, local and held monitor is a
//! [`FrameValue`]: a graph node plus its [`ValueKind`]. [`FrameState`] has value semantics;
//! cloning it forks the state for a second successor. [`FrameSnapshot`] freezes a state at
//! a position so a deoptimization can rebuild the interpreter frame.

use strum::Display;

use crate::ir::NodeId;

mod snapshot;
mod state;

pub use snapshot::FrameSnapshot;
pub use state::FrameState;

/// Kind of a value on the operand stack or in a local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ValueKind {
    /// 64-bit integer
    Int,
    /// Object reference (possibly `null`)
    Object,
    /// No value. Only used as a return kind.
    Void,
}

/// A symbolic value: the node computing it and its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameValue {
    /// Node producing the value
    pub node: NodeId,
    /// Kind of the value
    pub kind: ValueKind,
}

impl FrameValue {
    /// Creates a value.
    #[must_use]
    pub const fn new(node: NodeId, kind: ValueKind) -> Self {
        Self { node, kind }
    }

    /// Creates an `Int` value.
    #[must_use]
    pub const fn int(node: NodeId) -> Self {
        Self::new(node, ValueKind::Int)
    }

    /// Creates an `Object` value.
    #[must_use]
    pub const fn object(node: NodeId) -> Self {
        Self::new(node, ValueKind::Object)
    }
}
