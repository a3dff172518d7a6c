//! Integration tests for call sites: devirtualization, plugins, inlining and exception
//! dispatch across inlined frames.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use bytegraph::prelude::*;

const OBJECT: TypeId = TypeId::new(1);
const ROOT: MethodId = MethodId::new(1);

/// Handlers are selected with these exception types.
const ERROR_A: TypeId = TypeId::new(20);
const ERROR_B: TypeId = TypeId::new(21);
const ERROR_B_SUB: TypeId = TypeId::new(22);

fn base_hierarchy() -> ClassHierarchy {
    let mut h = ClassHierarchy::new();
    h.add_type(TypeInfo::new(OBJECT, "Object"));
    h.add_type(TypeInfo::new(ERROR_A, "ErrorA").extends(OBJECT));
    h.add_type(TypeInfo::new(ERROR_B, "ErrorB").extends(OBJECT));
    h.add_type(TypeInfo::new(ERROR_B_SUB, "ErrorBSub").extends(ERROR_B));
    h
}

fn static_method(id: u32, params: &[ValueKind], returns: ValueKind) -> MethodInfo {
    MethodInfo::new(MethodId::new(id), format!("m{id}"), OBJECT)
        .with_flags(MethodFlags::STATIC)
        .with_params(params)
        .returns(returns)
}

fn build(hierarchy: ClassHierarchy, config: &BuilderConfig) -> Result<BuiltGraph> {
    let env = BuildEnv::new(Arc::new(hierarchy));
    GraphBuilder::new(&env, config).build(ROOT)
}

#[test]
fn test_leaf_callee_splices_without_merge() -> Result<()> {
    let mut h = base_hierarchy();
    let callee = MethodAssembler::new()
        .locals(2)
        .load(0)
        .load(1)
        .add()
        .ret_value()
        .finish()?;
    h.add_method(static_method(2, &[ValueKind::Int, ValueKind::Int], ValueKind::Int).with_body(callee));
    let root = MethodAssembler::new()
        .iconst(40)
        .iconst(2)
        .invoke_static(MethodId::new(2))
        .ret_value()
        .finish()?;
    h.add_method(static_method(1, &[], ValueKind::Int).with_body(root));

    let built = build(h, &BuilderConfig::default())?;
    let graph = &built.graph;
    assert_eq!(graph.count(NodeClass::Merge), 0);
    assert_eq!(graph.count(NodeClass::Invoke), 0);
    assert_eq!(graph.count(NodeClass::Begin), 1);
    assert_eq!(graph.count(NodeClass::Return), 1);
    assert_eq!(graph.count(NodeClass::Arithmetic), 1);

    assert_eq!(built.report.max_inline_depth, 1);
    assert_eq!(built.report.inline_count(MethodId::new(2)), 1);
    assert_eq!(built.report.inlined[0].depth, 1);

    // The argument constants flow straight into the callee's add.
    let ret = graph.nodes_of(NodeClass::Return)[0];
    let sum = graph.inputs(ret)[0];
    let operands: Vec<_> = graph
        .inputs(sum)
        .iter()
        .map(|n| graph.kind(*n).cloned())
        .collect();
    assert_eq!(
        operands,
        vec![Some(NodeKind::Constant(40)), Some(NodeKind::Constant(2))]
    );
    Ok(())
}

#[test]
fn test_callee_with_two_returns_adds_one_merge() -> Result<()> {
    let mut h = base_hierarchy();
    let callee = MethodAssembler::new()
        .locals(1)
        .load(0)
        .if_zero(Condition::Eq, "zero")
        .iconst(1)
        .ret_value()
        .label("zero")
        .iconst(0)
        .ret_value()
        .finish()?;
    h.add_method(static_method(2, &[ValueKind::Int], ValueKind::Int).with_body(callee));
    let root = MethodAssembler::new()
        .locals(1)
        .load(0)
        .invoke_static(MethodId::new(2))
        .ret_value()
        .finish()?;
    h.add_method(static_method(1, &[ValueKind::Int], ValueKind::Int).with_body(root));

    let built = build(h, &BuilderConfig::default())?;
    let graph = &built.graph;
    assert_eq!(graph.count(NodeClass::Merge), 1);
    assert_eq!(graph.count(NodeClass::Return), 1);

    // The merge belongs to the caller frame after the call.
    let merge = graph.nodes_of(NodeClass::Merge)[0];
    let snapshot = graph
        .snapshot(merge)
        .ok_or_else(|| Error::NotSupported("merge without snapshot".into()))?;
    assert_eq!(snapshot.method(), ROOT);
    assert_eq!(snapshot.position(), Position::new(2));
    assert_eq!(snapshot.stack().len(), 1);
    Ok(())
}

#[test]
fn test_inlined_snapshots_chain_to_caller() -> Result<()> {
    let mut h = base_hierarchy();
    let callee = MethodAssembler::new()
        .locals(1)
        .load(0)
        .monitor_enter()
        .load(0)
        .monitor_exit()
        .ret()
        .finish()?;
    h.add_method(static_method(2, &[ValueKind::Object], ValueKind::Void).with_body(callee));
    let root = MethodAssembler::new()
        .locals(1)
        .iconst(5)
        .load(0)
        .invoke_static(MethodId::new(2))
        .ret_value()
        .finish()?;
    h.add_method(static_method(1, &[ValueKind::Object], ValueKind::Int).with_body(root));

    let built = build(h, &BuilderConfig::default())?;
    let graph = &built.graph;
    let enter = graph.nodes_of(NodeClass::MonitorEnter)[0];
    let snapshot = graph
        .snapshot(enter)
        .ok_or_else(|| Error::NotSupported("monitor without snapshot".into()))?;
    assert_eq!(snapshot.frame_count(), 2);
    assert_eq!(snapshot.method(), MethodId::new(2));
    let outer = snapshot
        .outer()
        .ok_or_else(|| Error::NotSupported("no caller frame".into()))?;
    assert_eq!(outer.method(), ROOT);
    assert_eq!(outer.position(), Position::new(2));
    // The pending constant is still on the caller's stack during the call.
    assert_eq!(outer.stack().len(), 1);
    Ok(())
}

fn shapes(root: MethodBody) -> Result<ClassHierarchy> {
    let shape = TypeId::new(2);
    let circle = TypeId::new(3);
    let mut h = base_hierarchy();
    h.add_type(TypeInfo::new(shape, "Shape").with_flags(TypeFlags::ABSTRACT));
    h.add_type(TypeInfo::new(circle, "Circle").extends(shape));
    h.add_method(
        MethodInfo::new(MethodId::new(10), "area", shape)
            .with_flags(MethodFlags::ABSTRACT)
            .returns(ValueKind::Int),
    );
    h.add_method(
        MethodInfo::new(MethodId::new(11), "area", circle)
            .returns(ValueKind::Int)
            .with_body(MethodAssembler::new().locals(1).iconst(3).ret_value().finish()?),
    );
    h.add_method(static_method(1, &[ValueKind::Object], ValueKind::Int).with_body(root));
    Ok(h)
}

struct Counting {
    name: &'static str,
    calls: Arc<AtomicUsize>,
}

impl InvocationPlugin for Counting {
    fn name(&self) -> &str {
        self.name
    }

    fn scope(&self) -> PluginScope {
        PluginScope::Indirect
    }

    fn try_handle(&self, _: &mut PluginContext<'_>, _: &InvocationDescriptor) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }
}

#[test]
fn test_devirtualized_call_skips_indirect_plugins() -> Result<()> {
    let root = MethodAssembler::new()
        .locals(1)
        .load(0)
        .invoke_virtual(MethodId::new(10))
        .ret_value()
        .finish()?;
    let calls = Arc::new(AtomicUsize::new(0));
    let mut plugins = PluginRegistry::new();
    plugins.register_invocation(Counting {
        name: "counting",
        calls: Arc::clone(&calls),
    });
    let env = BuildEnv::new(Arc::new(shapes(root)?)).with_plugins(plugins);
    let config = BuilderConfig::default().with_inlining(false, 0);
    let built = GraphBuilder::new(&env, &config).build(ROOT)?;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let site = &built.report.call_sites[0];
    assert!(matches!(
        site.devirtualization,
        Devirtualization::Devirtualized { target, .. } if target == MethodId::new(11)
    ));
    let invoke = built.graph.nodes_of(NodeClass::Invoke)[0];
    assert_eq!(
        built.graph.kind(invoke),
        Some(&NodeKind::Invoke {
            kind: InvokeKind::Special,
            target: MethodId::new(11)
        })
    );
    Ok(())
}

#[test]
fn test_indirect_call_reaches_indirect_plugins() -> Result<()> {
    let root = MethodAssembler::new()
        .locals(1)
        .load(0)
        .invoke_virtual(MethodId::new(10))
        .ret_value()
        .finish()?;
    let mut h = shapes(root)?;
    // A second implementation keeps the call indirect.
    h.add_type(TypeInfo::new(TypeId::new(4), "Square").extends(TypeId::new(2)));
    h.add_method(
        MethodInfo::new(MethodId::new(12), "area", TypeId::new(4))
            .returns(ValueKind::Int)
            .with_body(MethodAssembler::new().locals(1).iconst(4).ret_value().finish()?),
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let mut plugins = PluginRegistry::new();
    plugins.register_invocation(Counting {
        name: "counting",
        calls: Arc::clone(&calls),
    });
    let env = BuildEnv::new(Arc::new(h)).with_plugins(plugins);
    let config = BuilderConfig::default();
    let built = GraphBuilder::new(&env, &config).build(ROOT)?;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        built.report.call_sites[0].outcome,
        CallSiteOutcome::IndirectCallNode {
            target: MethodId::new(10),
            exception_edge: false
        }
    );
    Ok(())
}

#[test]
fn test_first_claiming_plugin_wins() -> Result<()> {
    let mut h = base_hierarchy();
    h.add_method(
        static_method(2, &[ValueKind::Int], ValueKind::Int).with_flags(MethodFlags::STATIC | MethodFlags::NATIVE),
    );
    let root = MethodAssembler::new()
        .locals(1)
        .load(0)
        .invoke_static(MethodId::new(2))
        .ret_value()
        .finish()?;
    h.add_method(static_method(1, &[ValueKind::Int], ValueKind::Int).with_body(root));

    let mut plugins = PluginRegistry::new();
    plugins.register_invocation(IntrinsicPlugin::new("negate", MethodId::new(2), |cx, call| {
        let node = cx.add_value(
            NodeKind::Arithmetic { op: ArithOp::Neg },
            vec![call.args[0].node],
        );
        cx.push(FrameValue::int(node));
        Ok(())
    }));
    plugins.register_invocation(IntrinsicPlugin::new("never", MethodId::new(2), |_, _| {
        Err(Error::NotSupported("second plugin consulted".into()))
    }));
    let env = BuildEnv::new(Arc::new(h)).with_plugins(plugins);
    let config = BuilderConfig::default();
    let built = GraphBuilder::new(&env, &config).build(ROOT)?;

    assert_eq!(
        built.report.call_sites[0].outcome,
        CallSiteOutcome::PluginHandled {
            plugin: "negate".to_string()
        }
    );
    assert_eq!(built.graph.count(NodeClass::Invoke), 0);
    assert_eq!(built.graph.count(NodeClass::Arithmetic), 1);
    Ok(())
}

struct AlwaysInline;

impl InlineDecisionPlugin for AlwaysInline {
    fn name(&self) -> &str {
        "always"
    }

    fn decide(&self, _: &MethodInfo, _: &MethodInfo, _: usize) -> InlineDecision {
        InlineDecision::Inline
    }
}

fn recursive() -> Result<ClassHierarchy> {
    let mut h = base_hierarchy();
    let body = MethodAssembler::new()
        .locals(1)
        .load(0)
        .if_zero(Condition::Eq, "done")
        .load(0)
        .iconst(1)
        .sub()
        .invoke_static(ROOT)
        .ret_value()
        .label("done")
        .iconst(0)
        .ret_value()
        .finish()?;
    h.add_method(static_method(1, &[ValueKind::Int], ValueKind::Int).with_body(body));
    Ok(h)
}

#[test]
fn test_forced_recursive_inlining_is_too_deep() -> Result<()> {
    let mut plugins = PluginRegistry::new();
    plugins.register_inline_decision(AlwaysInline);
    let env = BuildEnv::new(Arc::new(recursive()?)).with_plugins(plugins);
    let config = BuilderConfig::default().with_inlining_limits(3, 1);
    let result = GraphBuilder::new(&env, &config).build(ROOT);

    let err = result
        .err()
        .ok_or_else(|| Error::NotSupported("expected failure".into()))?;
    assert!(err.is_too_deep_inlining(), "{err}");
    assert!(matches!(
        err,
        Error::BudgetExceeded {
            kind: BudgetKind::TooDeepInlining { depth: 3 },
            ..
        }
    ));
    Ok(())
}

#[test]
fn test_recursion_budget_stops_default_inlining() -> Result<()> {
    let config = BuilderConfig::default().with_inlining_limits(8, 2);
    let built = build(recursive()?, &config)?;

    // The root frame counts as the first occurrence.
    assert_eq!(built.report.inline_count(ROOT), 1);
    assert_eq!(built.report.max_inline_depth, 1);
    assert_eq!(built.graph.count(NodeClass::Invoke), 1);
    Ok(())
}

#[test]
fn test_unresolved_call_deoptimizes_only_that_site() -> Result<()> {
    let mut h = base_hierarchy();
    h.mark_unresolved_method(MethodId::new(2));
    let root = MethodAssembler::new()
        .locals(1)
        .load(0)
        .if_zero(Condition::Eq, "call")
        .iconst(1)
        .ret_value()
        .label("call")
        .invoke_static(MethodId::new(2))
        .ret()
        .finish()?;
    h.add_method(static_method(1, &[ValueKind::Int], ValueKind::Int).with_body(root));

    let built = build(h, &BuilderConfig::default())?;
    let graph = &built.graph;
    assert_eq!(graph.count(NodeClass::Return), 1);
    let deopts: Vec<_> = graph
        .live_nodes()
        .filter(|(_, n)| {
            n.kind
                == NodeKind::Deoptimize {
                    reason: DeoptReason::Unresolved,
                }
        })
        .collect();
    assert_eq!(deopts.len(), 1);
    assert_eq!(built.report.unresolved.len(), 1);
    assert_eq!(
        built.report.call_sites[0].outcome,
        CallSiteOutcome::Deoptimized {
            reason: DeoptReason::Unresolved
        }
    );
    Ok(())
}

#[test]
fn test_deopt_all_invokes() -> Result<()> {
    let mut h = base_hierarchy();
    h.add_method(
        static_method(2, &[], ValueKind::Int).with_body(MethodAssembler::new().iconst(1).ret_value().finish()?),
    );
    let root = MethodAssembler::new()
        .invoke_static(MethodId::new(2))
        .ret_value()
        .finish()?;
    h.add_method(static_method(1, &[], ValueKind::Int).with_body(root));

    let config = BuilderConfig::default().with_deopt_all_invokes(true);
    let built = build(h, &config)?;
    assert_eq!(built.graph.count(NodeClass::Return), 0);
    assert_eq!(built.graph.count(NodeClass::Deoptimize), 1);
    assert!(built.report.inlined.is_empty());
    Ok(())
}

/// Root calls a native method inside a try region with handlers `[A, B, catch-all]`
/// returning 1, 2 and 3.
fn three_handlers() -> Result<ClassHierarchy> {
    let mut h = base_hierarchy();
    h.add_method(
        static_method(2, &[], ValueKind::Void).with_flags(MethodFlags::STATIC | MethodFlags::NATIVE),
    );
    let root = MethodAssembler::new()
        .label("try")
        .invoke_static(MethodId::new(2))
        .iconst(0)
        .ret_value()
        .label("end")
        .label("catch_a")
        .pop()
        .iconst(1)
        .ret_value()
        .label("catch_b")
        .pop()
        .iconst(2)
        .ret_value()
        .label("catch_all")
        .pop()
        .iconst(3)
        .ret_value()
        .try_catch("try", "end", "catch_a", Some(ERROR_A))
        .try_catch("try", "end", "catch_b", Some(ERROR_B))
        .try_catch("try", "end", "catch_all", None)
        .finish()?;
    h.add_method(static_method(1, &[], ValueKind::Int).with_body(root));
    Ok(h)
}

/// Follows the exceptional path for an exception of type `thrown`, evaluating each type
/// test against the hierarchy. Returns the tested types and the returned constant.
fn route(
    graph: &Graph,
    hierarchy: &ClassHierarchy,
    thrown: TypeId,
) -> Result<(Vec<TypeId>, Option<i64>)> {
    let missing = || Error::NotSupported("broken dispatch path".into());
    let mut node = graph.nodes_of(NodeClass::ExceptionObject)[0];
    let mut tested = Vec::new();
    loop {
        let kind = graph.kind(node).ok_or_else(missing)?;
        match kind {
            NodeKind::Return => {
                let value = graph.inputs(node).first().and_then(|v| match graph.kind(*v) {
                    Some(NodeKind::Constant(c)) => Some(*c),
                    _ => None,
                });
                return Ok((tested, value));
            }
            NodeKind::If => {
                let test = graph.inputs(node)[0];
                let Some(NodeKind::InstanceOf { ty }) = graph.kind(test) else {
                    return Err(missing());
                };
                tested.push(*ty);
                let wanted = if hierarchy.is_subtype(thrown, *ty) {
                    EdgeKind::True
                } else {
                    EdgeKind::False
                };
                node = graph
                    .successor_edges(node)
                    .find(|(_, e)| e.kind == wanted)
                    .map(|(_, e)| e.target)
                    .ok_or_else(missing)?;
            }
            _ => node = graph.successors(node).next().ok_or_else(missing)?,
        }
    }
}

#[test]
fn test_dispatch_tests_handlers_in_order() -> Result<()> {
    let hierarchy = three_handlers()?;
    let built = build(hierarchy.clone(), &BuilderConfig::default())?;
    let graph = &built.graph;

    assert_eq!(graph.count(NodeClass::InvokeWithException), 1);
    assert_eq!(graph.count(NodeClass::InstanceOf), 2);
    assert_eq!(graph.count(NodeClass::Unwind), 0);

    let (tested, value) = route(graph, &hierarchy, ERROR_B_SUB)?;
    assert_eq!(tested, vec![ERROR_A, ERROR_B]);
    assert_eq!(value, Some(2));

    let (tested, value) = route(graph, &hierarchy, ERROR_A)?;
    assert_eq!(tested, vec![ERROR_A]);
    assert_eq!(value, Some(1));

    let (tested, value) = route(graph, &hierarchy, OBJECT)?;
    assert_eq!(tested, vec![ERROR_A, ERROR_B]);
    assert_eq!(value, Some(3));
    Ok(())
}

#[test]
fn test_profile_without_exception_drops_exception_edge() -> Result<()> {
    let hierarchy = three_handlers()?;
    let profile = RecordedProfile::new().with_exception_seen(ROOT, Position::new(0), false);
    let env = BuildEnv::new(Arc::new(hierarchy)).with_profile(Arc::new(profile));
    let config = BuilderConfig::default();
    let built = GraphBuilder::new(&env, &config).build(ROOT)?;

    let graph = &built.graph;
    assert_eq!(graph.count(NodeClass::InvokeWithException), 0);
    assert_eq!(graph.count(NodeClass::Invoke), 1);
    assert_eq!(graph.count(NodeClass::ExceptionObject), 0);
    assert_eq!(graph.count(NodeClass::Return), 1);
    Ok(())
}

#[test]
fn test_callee_throw_reaches_caller_handler() -> Result<()> {
    let mut h = base_hierarchy();
    let thrower = MethodAssembler::new()
        .new_object(ERROR_B)
        .throw()
        .finish()?;
    h.add_method(static_method(2, &[], ValueKind::Void).with_body(thrower));
    let root = MethodAssembler::new()
        .label("try")
        .invoke_static(MethodId::new(2))
        .iconst(0)
        .ret_value()
        .label("end")
        .label("handler")
        .pop()
        .iconst(7)
        .ret_value()
        .try_catch("try", "end", "handler", Some(ERROR_B))
        .finish()?;
    h.add_method(static_method(1, &[], ValueKind::Int).with_body(root));

    let built = build(h, &BuilderConfig::default())?;
    let graph = &built.graph;
    assert_eq!(built.report.inline_count(MethodId::new(2)), 1);
    assert_eq!(graph.count(NodeClass::Invoke), 0);
    assert_eq!(graph.count(NodeClass::InstanceOf), 1);
    // Thrown, caught, and the normal return never happens.
    assert_eq!(graph.count(NodeClass::Return), 1);
    assert_eq!(graph.count(NodeClass::Unwind), 1);

    let ret = graph.nodes_of(NodeClass::Return)[0];
    let value = graph.inputs(ret).first().and_then(|v| graph.kind(*v));
    assert_eq!(value, Some(&NodeKind::Constant(7)));
    Ok(())
}
