//! What happened during a build, beyond the graph itself.

use crate::{
    bytecode::Position,
    ir::DeoptReason,
    metadata::{MethodId, TypeId},
};

/// How an indirect call site was proven to have a single target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevirtualizationKind {
    /// The receiver was allocated in the same unit, so its exact type is known.
    ExactType,
    /// The method or its declaring type cannot be overridden.
    Final,
    /// Class hierarchy analysis found a single concrete implementation.
    ClassHierarchy,
}

/// The devirtualization step of a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Devirtualization {
    /// The call site was lowered before devirtualization could run.
    NotAttempted,
    /// The call was direct to begin with.
    NotNeeded,
    /// The call was rebound to a `Special` call of `target`.
    Devirtualized {
        /// The concrete target
        target: MethodId,
        /// What proved the target unique
        via: DevirtualizationKind,
    },
    /// No unique target could be proven.
    NotDevirtualizable,
}

/// How a call site was finally lowered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSiteOutcome {
    /// An invocation plugin claimed the call.
    PluginHandled {
        /// Name of the plugin
        plugin: String,
    },
    /// The callee's body was parsed into the graph.
    Inlined {
        /// The inlined method
        callee: MethodId,
    },
    /// A call node with a fixed target.
    DirectCallNode {
        /// Called method
        target: MethodId,
        /// Whether the call has an exception edge
        exception_edge: bool,
    },
    /// A call node dispatched at run time.
    IndirectCallNode {
        /// Declared method
        target: MethodId,
        /// Whether the call has an exception edge
        exception_edge: bool,
    },
    /// The call site was replaced by a deoptimization.
    Deoptimized {
        /// Why
        reason: DeoptReason,
    },
}

/// One call site visited during the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSiteRecord {
    /// Method containing the call
    pub caller: MethodId,
    /// Position of the call in the caller
    pub position: Position,
    /// Inlining depth of the caller
    pub depth: usize,
    /// Method named by the call instruction
    pub declared: MethodId,
    /// Devirtualization step
    pub devirtualization: Devirtualization,
    /// Final lowering
    pub outcome: CallSiteOutcome,
}

/// What could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedKind {
    /// A called method
    Method(MethodId),
    /// A type used by an allocation, cast, type test or catch filter
    Type(TypeId),
}

/// A reference lowered to a deoptimization because it could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedReference {
    /// Method containing the reference
    pub method: MethodId,
    /// Position of the reference
    pub position: Position,
    /// The unresolved entity
    pub kind: UnresolvedKind,
    /// Explanation from the metadata provider
    pub reason: String,
}

/// A method inlined into the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlinedMethod {
    /// The inlined method
    pub method: MethodId,
    /// The method it was inlined into
    pub caller: MethodId,
    /// Position of the call in the caller
    pub position: Position,
    /// Depth of the inlined frame (the root is 0)
    pub depth: usize,
}

/// Side information collected while building one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    /// Every call site, in visiting order
    pub call_sites: Vec<CallSiteRecord>,
    /// Every inlined method, in visiting order
    pub inlined: Vec<InlinedMethod>,
    /// References lowered to deoptimizations
    pub unresolved: Vec<UnresolvedReference>,
    /// Deepest inlined frame
    pub max_inline_depth: usize,
}

impl BuildReport {
    /// Returns the call site of `caller` at `position`.
    #[must_use]
    pub fn call_site(&self, caller: MethodId, position: Position) -> Option<&CallSiteRecord> {
        self.call_sites
            .iter()
            .find(|c| c.caller == caller && c.position == position)
    }

    /// Returns the number of times `method` was inlined.
    #[must_use]
    pub fn inline_count(&self, method: MethodId) -> usize {
        self.inlined.iter().filter(|i| i.method == method).count()
    }
}
