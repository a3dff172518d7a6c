//! Extension points consulted at call sites.
//!
//! Plugins are trait objects tried in registration order; the first one to claim a call
//! site wins. [`InvocationPlugin`]s replace the lowering of a call, for instance with an
//! intrinsic. [`InlineDecisionPlugin`]s override the default inlining policy.

use std::{fmt, sync::Arc};

use crate::{
    builder::InvocationDescriptor,
    bytecode::Position,
    frame::{FrameSnapshot, FrameState, FrameValue},
    ir::{DeoptReason, EdgeKind, Graph, NodeId, NodeKind},
    metadata::{MethodId, MethodInfo},
    Result,
};

/// Which call sites an [`InvocationPlugin`] wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginScope {
    /// Only direct calls (including devirtualized ones).
    Direct,
    /// Only calls that are still indirect after devirtualization.
    Indirect,
    /// Every call.
    Any,
}

impl PluginScope {
    /// Returns `true` if a plugin with this scope may see a call with the given directness.
    #[must_use]
    pub fn accepts(self, direct: bool) -> bool {
        match self {
            PluginScope::Direct => direct,
            PluginScope::Indirect => !direct,
            PluginScope::Any => true,
        }
    }
}

/// The builder state a plugin may touch while handling a call.
///
/// Arguments have already been popped. A plugin that claims a call must leave exactly the
/// callee's return value (if any) pushed on the stack.
pub struct PluginContext<'a> {
    pub(crate) graph: &'a mut Graph,
    pub(crate) state: &'a mut FrameState,
    pub(crate) last: &'a mut Option<NodeId>,
    pub(crate) method: MethodId,
    pub(crate) position: Position,
    pub(crate) outer: Option<Arc<FrameSnapshot>>,
}

impl PluginContext<'_> {
    /// Adds a floating data node.
    pub fn add_value(&mut self, kind: NodeKind, inputs: Vec<NodeId>) -> NodeId {
        self.graph.add_node(kind, inputs)
    }

    /// Adds an integer constant.
    pub fn constant(&mut self, value: i64) -> NodeId {
        self.graph.add_node(NodeKind::Constant(value), vec![])
    }

    /// Appends a fixed node after the current control point. State-effecting nodes get a
    /// snapshot of the current state.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if control flow has already ended.
    pub fn append(&mut self, kind: NodeKind, inputs: Vec<NodeId>) -> Result<NodeId> {
        let last = self
            .last
            .ok_or_else(|| malformed_error!("Plugin appended a node after control flow ended"))?;
        let state_effecting = kind.is_state_effecting();
        let node = self.graph.add_node(kind, inputs);
        self.graph.add_edge(last, node, EdgeKind::Next, 1.0)?;
        if state_effecting {
            let snapshot = self
                .state
                .snapshot(self.method, self.position, self.outer.clone());
            self.graph.set_snapshot(node, snapshot)?;
        }
        *self.last = Some(node);
        Ok(node)
    }

    /// Ends control flow here with a deoptimization.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] if control flow has already ended.
    pub fn deoptimize(&mut self, reason: DeoptReason) -> Result<NodeId> {
        let node = self.append(NodeKind::Deoptimize { reason }, vec![])?;
        *self.last = None;
        Ok(node)
    }

    /// Pushes a value on the operand stack.
    pub fn push(&mut self, value: FrameValue) {
        self.state.push(value);
    }

    /// The current frame state.
    #[must_use]
    pub fn state(&self) -> &FrameState {
        self.state
    }

    /// Read access to the graph.
    #[must_use]
    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// Position of the call site.
    #[must_use]
    pub fn position(&self) -> Position {
        self.position
    }
}

/// Replaces the default lowering of call sites.
pub trait InvocationPlugin: Send + Sync {
    /// Name used in logs and the build report.
    fn name(&self) -> &str;

    /// Which call sites this plugin wants to see.
    fn scope(&self) -> PluginScope {
        PluginScope::Any
    }

    /// Handles the call and returns `true`, or returns `false` without touching `cx`.
    ///
    /// # Errors
    ///
    /// Errors abort the build.
    fn try_handle(&self, cx: &mut PluginContext<'_>, call: &InvocationDescriptor) -> Result<bool>;
}

/// Handler signature of an [`IntrinsicPlugin`].
pub type IntrinsicFn =
    dyn Fn(&mut PluginContext<'_>, &InvocationDescriptor) -> Result<()> + Send + Sync;

/// An [`InvocationPlugin`] bound to one method.
pub struct IntrinsicPlugin {
    name: String,
    method: MethodId,
    scope: PluginScope,
    handler: Box<IntrinsicFn>,
}

impl IntrinsicPlugin {
    /// Creates a plugin that lowers calls to `method` with `handler`.
    pub fn new<F>(name: impl Into<String>, method: MethodId, handler: F) -> Self
    where
        F: Fn(&mut PluginContext<'_>, &InvocationDescriptor) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            method,
            scope: PluginScope::Any,
            handler: Box::new(handler),
        }
    }

    /// Restricts the plugin to a subset of call sites.
    #[must_use]
    pub fn with_scope(mut self, scope: PluginScope) -> Self {
        self.scope = scope;
        self
    }
}

impl InvocationPlugin for IntrinsicPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> PluginScope {
        self.scope
    }

    fn try_handle(&self, cx: &mut PluginContext<'_>, call: &InvocationDescriptor) -> Result<bool> {
        if call.target.id != self.method {
            return Ok(false);
        }
        (self.handler)(cx, call)?;
        Ok(true)
    }
}

/// Answer of an [`InlineDecisionPlugin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineDecision {
    /// Inline the callee.
    Inline,
    /// Never inline the callee here.
    DoNotInline,
    /// Let the next plugin or the default policy decide.
    NoDecision,
}

/// Overrides the default inlining policy.
pub trait InlineDecisionPlugin: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Decides whether `callee` is inlined into `caller` at inlining depth `depth`.
    fn decide(&self, caller: &MethodInfo, callee: &MethodInfo, depth: usize) -> InlineDecision;
}

/// Ordered plugin lists.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    invocation: Vec<Arc<dyn InvocationPlugin>>,
    inline_decision: Vec<Arc<dyn InlineDecisionPlugin>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an invocation plugin.
    pub fn register_invocation(&mut self, plugin: impl InvocationPlugin + 'static) {
        self.invocation.push(Arc::new(plugin));
    }

    /// Appends an inline decision plugin.
    pub fn register_inline_decision(&mut self, plugin: impl InlineDecisionPlugin + 'static) {
        self.inline_decision.push(Arc::new(plugin));
    }

    /// Invocation plugins in registration order.
    #[must_use]
    pub fn invocation_plugins(&self) -> &[Arc<dyn InvocationPlugin>] {
        &self.invocation
    }

    /// Inline decision plugins in registration order.
    #[must_use]
    pub fn inline_decision_plugins(&self) -> &[Arc<dyn InlineDecisionPlugin>] {
        &self.inline_decision
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field(
                "invocation",
                &self.invocation.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field(
                "inline_decision",
                &self
                    .inline_decision
                    .iter()
                    .map(|p| p.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl InlineDecisionPlugin for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn decide(&self, _: &MethodInfo, _: &MethodInfo, _: usize) -> InlineDecision {
            InlineDecision::NoDecision
        }
    }

    #[test]
    fn test_scope_accepts() {
        assert!(PluginScope::Direct.accepts(true));
        assert!(!PluginScope::Direct.accepts(false));
        assert!(PluginScope::Indirect.accepts(false));
        assert!(!PluginScope::Indirect.accepts(true));
        assert!(PluginScope::Any.accepts(true) && PluginScope::Any.accepts(false));
    }

    #[test]
    fn test_registry_keeps_order() {
        let mut registry = PluginRegistry::new();
        registry.register_inline_decision(Named("first"));
        registry.register_inline_decision(Named("second"));
        registry.register_invocation(IntrinsicPlugin::new("id", MethodId::new(1), |_, _| Ok(())));

        let names: Vec<_> = registry
            .inline_decision_plugins()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(registry.invocation_plugins().len(), 1);
        assert!(format!("{registry:?}").contains("\"id\""));
    }
}
