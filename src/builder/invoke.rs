//! Call sites: devirtualization, plugins, inlining and call nodes.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
    builder::{
        parser::{BlockParser, Cursor},
        plugins::{InlineDecision, PluginContext},
        report::{
            CallSiteOutcome, CallSiteRecord, Devirtualization, DevirtualizationKind,
            InlinedMethod, UnresolvedKind,
        },
        scope::MethodScope,
        EXCEPTION_EDGE_PROBABILITY,
    },
    bytecode::{InvokeKind, Position},
    error::BudgetKind,
    frame::{FrameState, FrameValue, ValueKind},
    ir::{DeoptReason, EdgeKind, NodeKind},
    metadata::{MethodFlags, MethodId, MethodInfo, Resolution},
    Error, Result,
};

/// A call site after argument popping and devirtualization.
///
/// This is what [`crate::builder::InvocationPlugin`]s see.
#[derive(Debug, Clone)]
pub struct InvocationDescriptor {
    /// Dispatch kind; `Special` if the call was devirtualized
    pub kind: InvokeKind,
    /// The method that will run
    pub target: Arc<MethodInfo>,
    /// Arguments, receiver first
    pub args: Vec<FrameValue>,
    /// Kind of the pushed result, `Void` if none
    pub return_kind: ValueKind,
}

impl InvocationDescriptor {
    /// Returns the receiver argument of an instance call.
    #[must_use]
    pub fn receiver(&self) -> Option<FrameValue> {
        if self.kind.has_receiver() {
            self.args.first().copied()
        } else {
            None
        }
    }
}

impl BlockParser<'_, '_> {
    /// Translates the call instruction at the cursor.
    pub(crate) fn invoke(
        &mut self,
        cur: &mut Cursor,
        kind: InvokeKind,
        declared: MethodId,
    ) -> Result<()> {
        let pos = cur.position;
        if self.ctx.config.deopt_all_invokes {
            self.deoptimize(cur, DeoptReason::Forced)?;
            self.record_call(
                pos,
                declared,
                Devirtualization::NotAttempted,
                CallSiteOutcome::Deoptimized {
                    reason: DeoptReason::Forced,
                },
            );
            return Ok(());
        }

        let method = match self.ctx.env.metadata.method(declared) {
            Resolution::Resolved(method) => method,
            Resolution::Unresolved(reason) => {
                self.record_unresolved(pos, UnresolvedKind::Method(declared), reason);
                self.deoptimize(cur, DeoptReason::Unresolved)?;
                self.record_call(
                    pos,
                    declared,
                    Devirtualization::NotAttempted,
                    CallSiteOutcome::Deoptimized {
                        reason: DeoptReason::Unresolved,
                    },
                );
                return Ok(());
            }
        };
        if kind.has_receiver() == method.is_static() {
            let kind_name: &'static str = kind.into();
            return Err(verification_error!(
                pos,
                "{} call to {} method {}",
                kind_name,
                if method.is_static() { "static" } else { "instance" },
                declared
            ));
        }

        let mut args = Vec::new();
        for arg_kind in method.arg_kinds().into_iter().rev() {
            args.push(cur.state.pop_kind(pos, arg_kind)?);
        }
        args.reverse();

        let (kind, target, devirtualization) = if kind.is_direct() {
            (kind, method, Devirtualization::NotNeeded)
        } else {
            match self.devirtualize(&method, &args) {
                Some((target, via)) => {
                    trace!(%declared, target = %target.id, ?via, "devirtualized");
                    let devirtualized = Devirtualization::Devirtualized {
                        target: target.id,
                        via,
                    };
                    (InvokeKind::Special, target, devirtualized)
                }
                None => (kind, method, Devirtualization::NotDevirtualizable),
            }
        };
        let call = InvocationDescriptor {
            kind,
            return_kind: target.return_kind,
            target,
            args,
        };

        let outcome = if let Some(plugin) = self.try_plugins(cur, &call)? {
            CallSiteOutcome::PluginHandled { plugin }
        } else if self.should_inline(&call) {
            if self.scope.depth >= self.ctx.config.max_inlining_depth {
                debug!(depth = self.scope.depth, callee = %call.target.id, "inlining too deep");
                return Err(Error::BudgetExceeded {
                    position: pos,
                    kind: BudgetKind::TooDeepInlining {
                        depth: self.scope.depth,
                    },
                });
            }
            self.inline(cur, &call)?;
            CallSiteOutcome::Inlined {
                callee: call.target.id,
            }
        } else {
            let exception_edge = self.emit_call(cur, &call)?;
            if call.kind.is_direct() {
                CallSiteOutcome::DirectCallNode {
                    target: call.target.id,
                    exception_edge,
                }
            } else {
                CallSiteOutcome::IndirectCallNode {
                    target: call.target.id,
                    exception_edge,
                }
            }
        };
        self.record_call(pos, declared, devirtualization, outcome);
        Ok(())
    }

    /// Proves a single target for a virtual or interface call.
    fn devirtualize(
        &self,
        method: &MethodInfo,
        args: &[FrameValue],
    ) -> Option<(Arc<MethodInfo>, DevirtualizationKind)> {
        let metadata = &self.ctx.env.metadata;
        let exact = args.first().and_then(|receiver| match self.ctx.graph.kind(receiver.node) {
            Some(NodeKind::New { ty }) => metadata
                .resolve_implementation(method.id, *ty)
                .map(|m| (m, DevirtualizationKind::ExactType)),
            _ => None,
        });

        let (id, via) = exact
            .or_else(|| {
                let final_holder = matches!(
                    metadata.type_info(method.holder),
                    Resolution::Resolved(ty) if ty.is_final()
                );
                let cannot_override = method.flags.contains(MethodFlags::FINAL) || final_holder;
                (method.is_concrete() && cannot_override)
                    .then_some((method.id, DevirtualizationKind::Final))
            })
            .or_else(|| {
                metadata
                    .unique_concrete_method(method.id)
                    .map(|m| (m, DevirtualizationKind::ClassHierarchy))
            })?;
        metadata.method(id).ok().map(|target| (target, via))
    }

    /// Offers the call to the registered invocation plugins; returns the name of the one
    /// that claimed it.
    fn try_plugins(&mut self, cur: &mut Cursor, call: &InvocationDescriptor) -> Result<Option<String>> {
        let env = self.ctx.env;
        let direct = call.kind.is_direct();
        for plugin in env.plugins.invocation_plugins() {
            if !plugin.scope().accepts(direct) {
                continue;
            }

            let depth_before = cur.state.stack_depth();
            let mut cx = PluginContext {
                graph: &mut self.ctx.graph,
                state: &mut cur.state,
                last: &mut cur.last,
                method: self.scope.id(),
                position: cur.position,
                outer: self.scope.outer.clone(),
            };
            if !plugin.try_handle(&mut cx, call)? {
                continue;
            }

            if cfg!(debug_assertions) && cur.last.is_some() {
                let pushed = usize::from(call.return_kind != ValueKind::Void);
                let depth_after = cur.state.stack_depth();
                if depth_after != depth_before + pushed {
                    return Err(malformed_error!(
                        "Plugin '{}' left {} values on the stack for {} (expected {})",
                        plugin.name(),
                        depth_after,
                        call.target.id,
                        depth_before + pushed
                    ));
                }
            }
            debug!(plugin = plugin.name(), target = %call.target.id, "call handled by plugin");
            return Ok(Some(plugin.name().to_string()));
        }
        Ok(None)
    }

    /// Decision plugins first, then the size and recursion policy.
    fn should_inline(&self, call: &InvocationDescriptor) -> bool {
        if !call.kind.is_direct() {
            return false;
        }
        let callee = &call.target;
        for plugin in self.ctx.env.plugins.inline_decision_plugins() {
            match plugin.decide(&self.scope.method, callee, self.scope.depth) {
                InlineDecision::Inline => {
                    trace!(plugin = plugin.name(), callee = %callee.id, "inline forced");
                    return callee.body.is_some();
                }
                InlineDecision::DoNotInline => {
                    trace!(plugin = plugin.name(), callee = %callee.id, "inline refused");
                    return false;
                }
                InlineDecision::NoDecision => {}
            }
        }

        let config = self.ctx.config;
        let blocked = MethodFlags::NEVER_INLINE | MethodFlags::NATIVE | MethodFlags::ABSTRACT;
        let occurrences = self.scope.chain.iter().filter(|m| **m == callee.id).count();
        config.enable_inlining
            && !callee.flags.intersects(blocked)
            && callee
                .code_size()
                .is_some_and(|size| size <= config.inline_size_threshold)
            && occurrences < config.max_recursive_inlining
    }

    /// Parses the callee into the graph and splices its exits back into the caller.
    fn inline(&mut self, cur: &mut Cursor, call: &InvocationDescriptor) -> Result<()> {
        let pos = cur.position;
        let callee = Arc::clone(&call.target);
        let body = callee
            .body
            .clone()
            .ok_or_else(|| malformed_error!("Inlined method {} has no body", callee.id))?;
        self.ctx.check_budget(pos)?;

        let outer = self.scope.snapshot(&cur.state, pos);
        let mut chain = self.scope.chain.clone();
        chain.push(callee.id);
        let caller_handles = self.scope.exception_observable(pos);
        let state = FrameState::with_args(body.max_locals, &call.args)?;
        let scope = MethodScope::new(
            Arc::clone(&callee),
            body,
            self.ctx.config,
            chain,
            Some(outer),
            caller_handles,
        )?;
        let depth = scope.depth;

        debug!(caller = %self.scope.id(), callee = %callee.id, depth, %pos, "inlining");
        let predecessor = self.take_last(cur)?;
        let exits = BlockParser::new(&mut *self.ctx, scope).parse(state, Some(predecessor))?;

        let report = &mut self.ctx.report;
        report.inlined.push(InlinedMethod {
            method: callee.id,
            caller: self.scope.id(),
            position: pos,
            depth,
        });
        report.max_inline_depth = report.max_inline_depth.max(depth);

        if let Some(exit) = exits.unwound {
            let exception = exit
                .state
                .peek()
                .copied()
                .ok_or_else(|| malformed_error!("Unwind exit of {} has no exception", callee.id))?;
            if self.ctx.graph.kind(exit.node).is_some_and(NodeKind::is_merge) {
                let mut state = cur.state.clone();
                state.clear_stack();
                state.push(exception);
                self.attach_snapshot(exit.node, &state, pos)?;
            }
            self.dispatch_exception(cur.block, exit.node, &cur.state, exception, pos)?;
        }

        match exits.returned {
            Some(exit) => {
                if call.return_kind != ValueKind::Void {
                    let value = exit.state.peek().copied().ok_or_else(|| {
                        malformed_error!("Return exit of {} has no value", callee.id)
                    })?;
                    cur.state.push(value);
                }
                if self.ctx.graph.kind(exit.node).is_some_and(NodeKind::is_merge) {
                    self.attach_snapshot(exit.node, &cur.state, pos.next())?;
                }
                cur.last = Some(exit.node);
            }
            None => {
                trace!(callee = %callee.id, "inlined method never returns");
                cur.last = None;
            }
        }
        Ok(())
    }

    /// Emits a call node; returns whether it got an exception edge.
    fn emit_call(&mut self, cur: &mut Cursor, call: &InvocationDescriptor) -> Result<bool> {
        let pos = cur.position;
        let with_exception = self.scope.exception_observable(pos)
            && (!self.ctx.config.use_profile_for_exception_edges
                || self.scope.profile(self.ctx.env).exception_seen(pos));

        let inputs = call.args.iter().map(|a| a.node).collect();
        let kind = if with_exception {
            NodeKind::InvokeWithException {
                kind: call.kind,
                target: call.target.id,
            }
        } else {
            NodeKind::Invoke {
                kind: call.kind,
                target: call.target.id,
            }
        };
        let node = self.append(cur, kind, inputs)?;
        let exception_state = cur.state.clone();
        if call.return_kind != ValueKind::Void {
            cur.state.push(FrameValue::new(node, call.return_kind));
        }
        self.attach_snapshot(node, &cur.state, pos.next())?;

        if with_exception {
            let normal = self.ctx.graph.add_node(NodeKind::Begin, vec![]);
            self.ctx.graph.add_edge(
                node,
                normal,
                EdgeKind::Next,
                1.0 - EXCEPTION_EDGE_PROBABILITY,
            )?;
            cur.last = Some(normal);

            let exception = self.exception_object(&exception_state, pos)?;
            self.ctx
                .graph
                .add_edge(node, exception, EdgeKind::Exception, EXCEPTION_EDGE_PROBABILITY)?;
            self.dispatch_exception(
                cur.block,
                exception,
                &exception_state,
                FrameValue::object(exception),
                pos,
            )?;
        }
        Ok(with_exception)
    }

    fn record_call(
        &mut self,
        position: Position,
        declared: MethodId,
        devirtualization: Devirtualization,
        outcome: CallSiteOutcome,
    ) {
        self.ctx.report.call_sites.push(CallSiteRecord {
            caller: self.scope.id(),
            position,
            depth: self.scope.depth,
            declared,
            devirtualization,
            outcome,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        builder::{BuildEnv, GraphBuilder, IntrinsicPlugin, PluginRegistry, PluginScope},
        bytecode::MethodAssembler,
        config::BuilderConfig,
        ir::NodeClass,
        metadata::{ClassHierarchy, TypeFlags, TypeId, TypeInfo},
    };

    const ROOT: MethodId = MethodId::new(1);
    const AREA: MethodId = MethodId::new(2);
    const CIRCLE_AREA: MethodId = MethodId::new(3);
    const SHAPE: TypeId = TypeId::new(1);
    const CIRCLE: TypeId = TypeId::new(2);

    fn area_body(value: i64) -> Result<crate::bytecode::MethodBody> {
        MethodAssembler::new().locals(1).iconst(value).ret_value().finish()
    }

    /// `Shape.area` is abstract, `Circle.area` its only implementation.
    fn shapes(root: crate::bytecode::MethodBody) -> Result<ClassHierarchy> {
        let mut h = ClassHierarchy::new();
        h.add_type(TypeInfo::new(SHAPE, "Shape").with_flags(TypeFlags::ABSTRACT));
        h.add_type(TypeInfo::new(CIRCLE, "Circle").extends(SHAPE));
        h.add_method(
            MethodInfo::new(AREA, "area", SHAPE)
                .with_flags(MethodFlags::ABSTRACT)
                .returns(ValueKind::Int),
        );
        h.add_method(
            MethodInfo::new(CIRCLE_AREA, "area", CIRCLE)
                .returns(ValueKind::Int)
                .with_body(area_body(3)?),
        );
        h.add_method(
            MethodInfo::new(ROOT, "main", SHAPE)
                .with_params(&[ValueKind::Object])
                .returns(ValueKind::Int)
                .with_body(root),
        );
        Ok(h)
    }

    fn virtual_call_on_param() -> Result<crate::bytecode::MethodBody> {
        MethodAssembler::new()
            .locals(2)
            .load(1)
            .invoke_virtual(AREA)
            .ret_value()
            .finish()
    }

    #[test]
    fn test_class_hierarchy_devirtualizes_and_inlines() -> Result<()> {
        let env = BuildEnv::new(Arc::new(shapes(virtual_call_on_param()?)?));
        let config = BuilderConfig::default();
        let built = GraphBuilder::new(&env, &config).build(ROOT)?;

        let site = built
            .report
            .call_site(ROOT, crate::bytecode::Position::new(1))
            .cloned()
            .ok_or_else(|| malformed_error!("call site missing"))?;
        assert_eq!(
            site.devirtualization,
            Devirtualization::Devirtualized {
                target: CIRCLE_AREA,
                via: DevirtualizationKind::ClassHierarchy
            }
        );
        assert_eq!(site.outcome, CallSiteOutcome::Inlined { callee: CIRCLE_AREA });
        assert_eq!(built.graph.count(NodeClass::Invoke), 0);
        assert_eq!(built.report.max_inline_depth, 1);
        Ok(())
    }

    #[test]
    fn test_exact_receiver_type_devirtualizes() -> Result<()> {
        let root = MethodAssembler::new()
            .locals(2)
            .new_object(CIRCLE)
            .invoke_virtual(AREA)
            .ret_value()
            .finish()?;
        let mut h = shapes(root)?;
        // A second implementation defeats the hierarchy lookup.
        h.add_type(TypeInfo::new(TypeId::new(3), "Square").extends(SHAPE));
        h.add_method(
            MethodInfo::new(MethodId::new(4), "area", TypeId::new(3))
                .returns(ValueKind::Int)
                .with_body(area_body(4)?),
        );
        let env = BuildEnv::new(Arc::new(h));
        let config = BuilderConfig::default().with_inlining(false, 0);
        let built = GraphBuilder::new(&env, &config).build(ROOT)?;

        let site = &built.report.call_sites[0];
        assert_eq!(
            site.devirtualization,
            Devirtualization::Devirtualized {
                target: CIRCLE_AREA,
                via: DevirtualizationKind::ExactType
            }
        );
        assert_eq!(
            site.outcome,
            CallSiteOutcome::DirectCallNode {
                target: CIRCLE_AREA,
                exception_edge: false
            }
        );
        Ok(())
    }

    #[test]
    fn test_indirect_plugin_skips_devirtualized_site() -> Result<()> {
        let mut plugins = PluginRegistry::new();
        plugins.register_invocation(
            IntrinsicPlugin::new("indirect-only", CIRCLE_AREA, |cx, _| {
                let value = cx.constant(7);
                cx.push(FrameValue::int(value));
                Ok(())
            })
            .with_scope(PluginScope::Indirect),
        );
        let env = BuildEnv::new(Arc::new(shapes(virtual_call_on_param()?)?)).with_plugins(plugins);
        let config = BuilderConfig::default();
        let built = GraphBuilder::new(&env, &config).build(ROOT)?;

        assert!(matches!(
            built.report.call_sites[0].outcome,
            CallSiteOutcome::Inlined { .. }
        ));
        Ok(())
    }

    #[test]
    fn test_plugin_with_wrong_stack_delta_is_rejected() {
        let mut plugins = PluginRegistry::new();
        plugins.register_invocation(IntrinsicPlugin::new("forgetful", CIRCLE_AREA, |_, _| Ok(())));
        let Ok(hierarchy) = virtual_call_on_param().and_then(shapes) else {
            panic!("fixture must assemble");
        };
        let env = BuildEnv::new(Arc::new(hierarchy)).with_plugins(plugins);
        let config = BuilderConfig::default();
        let result = GraphBuilder::new(&env, &config).build(ROOT);

        if cfg!(debug_assertions) {
            assert!(matches!(result, Err(Error::Malformed { .. })));
        }
    }

    #[test]
    fn test_static_kind_mismatch_is_a_verification_error() -> Result<()> {
        let root = MethodAssembler::new()
            .locals(2)
            .invoke_static(CIRCLE_AREA)
            .ret_value()
            .finish()?;
        let env = BuildEnv::new(Arc::new(shapes(root)?));
        let config = BuilderConfig::default();
        let err = GraphBuilder::new(&env, &config)
            .build(ROOT)
            .err()
            .ok_or_else(|| malformed_error!("expected failure"))?;
        assert!(err.is_verification());
        Ok(())
    }
}
