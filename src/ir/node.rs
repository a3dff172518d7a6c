//! Node identities and the tagged node variant.

use std::{fmt, sync::Arc};

use strum::{Display, EnumCount, EnumDiscriminants, EnumIter};

use crate::{
    bytecode::{ArithOp, Condition, InvokeKind},
    frame::FrameSnapshot,
    metadata::{MethodId, TypeId},
};

/// Stable handle of a node in a [`crate::ir::Graph`].
///
/// Handles are never reused, even after the node is removed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// Creates a handle from a raw index.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        NodeId(index)
    }

    /// Returns the raw arena index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Why a [`NodeKind::Deoptimize`] abandons compiled code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DeoptReason {
    /// Control never reached this point while profiling.
    Unreached,
    /// A method or type could not be resolved at compile time.
    Unresolved,
    /// Every call site is configured to deoptimize.
    Forced,
}

/// The operation a node performs.
///
/// Control nodes are linked through the graph's edges; data nodes float and are only
/// referenced through node inputs.
#[derive(Debug, Clone, PartialEq, EnumDiscriminants)]
#[strum_discriminants(name(NodeClass))]
#[strum_discriminants(derive(Hash, Display, EnumCount, EnumIter))]
#[strum_discriminants(doc = "Payload-free class of a [`NodeKind`], used to count and filter nodes.")]
#[strum_discriminants(allow(missing_docs))]
pub enum NodeKind {
    /// Start of a straight-line region with a single predecessor.
    Begin,
    /// Forward control join. Inputs of its phis follow predecessor order.
    Merge,
    /// Top of a loop: forward ends first, then loop ends.
    LoopHeader {
        /// Loop index in the block map of the method the loop belongs to
        loop_index: usize,
    },
    /// Forward edge into a merge or loop header.
    End,
    /// Back edge into a loop header.
    LoopEnd {
        /// Loop header this back edge returns to
        header: NodeId,
    },
    /// Boundary where control leaves a loop.
    LoopExit {
        /// Loop header of the exited loop
        header: NodeId,
    },
    /// Two-way branch on its single `Int` input (non-zero takes the true edge).
    If,
    /// Multi-way branch on its single `Int` input.
    Switch {
        /// Case keys, parallel to the case edges
        keys: Vec<i64>,
    },
    /// Call without an exception edge. Inputs are the arguments.
    Invoke {
        /// Dispatch kind after devirtualization
        kind: InvokeKind,
        /// Called method
        target: MethodId,
    },
    /// Call with a normal successor and an exception successor.
    InvokeWithException {
        /// Dispatch kind after devirtualization
        kind: InvokeKind,
        /// Called method
        target: MethodId,
    },
    /// The in-flight exception at the start of an exceptional path.
    ExceptionObject,
    /// Abandon compiled code and resume in the interpreter.
    Deoptimize {
        /// Why the code is abandoned
        reason: DeoptReason,
    },
    /// Normal method exit. Optional input: the returned value.
    Return,
    /// Exceptional method exit. Input: the exception.
    Unwind,
    /// Acquire a monitor. Input: the object.
    MonitorEnter,
    /// Release a monitor. Input: the object.
    MonitorExit,
    /// Allocate an instance.
    New {
        /// Allocated type
        ty: TypeId,
    },
    /// Checked downcast. Input: the object.
    CheckCast {
        /// Target type
        ty: TypeId,
    },
    /// Incoming argument.
    Parameter {
        /// Argument index (receiver is 0 for instance methods)
        index: usize,
    },
    /// Integer constant.
    Constant(i64),
    /// The `null` reference.
    Null,
    /// Arithmetic on its inputs.
    Arithmetic {
        /// Operation
        op: ArithOp,
    },
    /// Comparison of its two inputs, `1` if `cond` holds.
    Compare {
        /// Comparison
        cond: Condition,
    },
    /// `1` if its input is an instance of `ty`.
    InstanceOf {
        /// Tested type
        ty: TypeId,
    },
    /// Its input, narrowed to `ty` on a path where the narrowing has been checked.
    Pi {
        /// Narrowed type
        ty: TypeId,
    },
    /// Per-value merge at a [`NodeKind::Merge`] or [`NodeKind::LoopHeader`].
    Phi {
        /// Owning merge
        merge: NodeId,
    },
    /// A loop-defined value used after the loop.
    Proxy {
        /// Loop exit the value passes through
        exit: NodeId,
    },
}

impl NodeKind {
    /// Returns the payload-free class of this node.
    #[must_use]
    pub fn class(&self) -> NodeClass {
        NodeClass::from(self)
    }

    /// Returns `true` for nodes that take part in control flow.
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.class().is_control()
    }

    /// Returns `true` for nodes that must carry a frame snapshot.
    ///
    /// The unit's start [`NodeKind::Begin`] needs one too; that is checked separately since
    /// it depends on the node's role rather than its kind.
    #[must_use]
    pub fn is_state_effecting(&self) -> bool {
        matches!(
            self,
            NodeKind::Merge
                | NodeKind::LoopHeader { .. }
                | NodeKind::LoopExit { .. }
                | NodeKind::Invoke { .. }
                | NodeKind::InvokeWithException { .. }
                | NodeKind::ExceptionObject
                | NodeKind::Deoptimize { .. }
                | NodeKind::MonitorEnter
                | NodeKind::MonitorExit
                | NodeKind::New { .. }
                | NodeKind::CheckCast { .. }
        )
    }

    /// Returns `true` for nodes that may directly follow a control split.
    #[must_use]
    pub fn is_begin_like(&self) -> bool {
        matches!(
            self,
            NodeKind::Begin | NodeKind::LoopExit { .. } | NodeKind::ExceptionObject
        )
    }

    /// Returns `true` for nodes with more than one control successor.
    #[must_use]
    pub fn is_control_split(&self) -> bool {
        matches!(
            self,
            NodeKind::If | NodeKind::Switch { .. } | NodeKind::InvokeWithException { .. }
        )
    }

    /// Returns `true` for control joins.
    #[must_use]
    pub fn is_merge(&self) -> bool {
        matches!(self, NodeKind::Merge | NodeKind::LoopHeader { .. })
    }

    /// Returns `true` for nodes that end control flow.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeKind::Return | NodeKind::Unwind | NodeKind::Deoptimize { .. }
        )
    }
}

impl NodeClass {
    /// Returns `true` for classes that take part in control flow.
    #[must_use]
    pub fn is_control(self) -> bool {
        !matches!(
            self,
            NodeClass::Parameter
                | NodeClass::Constant
                | NodeClass::Null
                | NodeClass::Arithmetic
                | NodeClass::Compare
                | NodeClass::InstanceOf
                | NodeClass::Pi
                | NodeClass::Phi
                | NodeClass::Proxy
        )
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::LoopHeader { loop_index } => write!(f, "LoopHeader#{loop_index}"),
            NodeKind::LoopEnd { header } => write!(f, "LoopEnd({header})"),
            NodeKind::LoopExit { header } => write!(f, "LoopExit({header})"),
            NodeKind::Switch { keys } => write!(f, "Switch{keys:?}"),
            NodeKind::Invoke { kind, target } | NodeKind::InvokeWithException { kind, target } => {
                let kind: &'static str = kind.into();
                write!(f, "{}[{} {}]", self.class(), kind, target)
            }
            NodeKind::Deoptimize { reason } => write!(f, "Deoptimize<{reason}>"),
            NodeKind::New { ty } | NodeKind::CheckCast { ty } | NodeKind::InstanceOf { ty } => {
                write!(f, "{}[{}]", self.class(), ty)
            }
            NodeKind::Pi { ty } => write!(f, "Pi[{ty}]"),
            NodeKind::Parameter { index } => write!(f, "Parameter({index})"),
            NodeKind::Constant(value) => write!(f, "Constant({value})"),
            NodeKind::Arithmetic { op } => {
                let op: &'static str = op.into();
                write!(f, "Arithmetic[{op}]")
            }
            NodeKind::Compare { cond } => {
                let cond: &'static str = cond.into();
                write!(f, "Compare[{cond}]")
            }
            NodeKind::Phi { merge } => write!(f, "Phi({merge})"),
            NodeKind::Proxy { exit } => write!(f, "Proxy({exit})"),
            _ => write!(f, "{}", self.class()),
        }
    }
}

/// A node in the graph arena.
#[derive(Debug, Clone)]
pub struct Node {
    /// What the node does
    pub kind: NodeKind,
    /// Data inputs, in operand order
    pub inputs: Vec<NodeId>,
    /// Frame state attached to state-effecting nodes
    pub snapshot: Option<Arc<FrameSnapshot>>,
}

impl Node {
    pub(crate) fn new(kind: NodeKind, inputs: Vec<NodeId>) -> Self {
        Self {
            kind,
            inputs,
            snapshot: None,
        }
    }

    /// Returns the payload-free class of this node.
    #[must_use]
    pub fn class(&self) -> NodeClass {
        self.kind.class()
    }
}
