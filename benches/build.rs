#![allow(unused)]
extern crate bytegraph;

use std::{hint::black_box, sync::Arc};

use bytegraph::prelude::*;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};

const MAIN: TypeId = TypeId::new(1);

/// A static `fn(n) -> int` summing `helper(i)` over `0..n`, with `helper` small enough to
/// be inlined.
fn hierarchy() -> ClassHierarchy {
    let helper = MethodAssembler::new()
        .locals(1)
        .load(0)
        .if_zero(Condition::Eq, "zero")
        .load(0)
        .iconst(3)
        .mul()
        .ret_value()
        .label("zero")
        .iconst(1)
        .ret_value()
        .finish()
        .unwrap();

    let root = MethodAssembler::new()
        .locals(3)
        .iconst(0)
        .store(1)
        .iconst(0)
        .store(2)
        .label("head")
        .load(2)
        .load(0)
        .if_cmp(Condition::Ge, "exit")
        .load(1)
        .load(2)
        .invoke_static(MethodId::new(2))
        .add()
        .store(1)
        .load(2)
        .iconst(1)
        .add()
        .store(2)
        .goto("head")
        .label("exit")
        .load(1)
        .ret_value()
        .finish()
        .unwrap();

    let mut h = ClassHierarchy::new();
    h.add_type(TypeInfo::new(MAIN, "Main"));
    for (id, body) in [(1, root), (2, helper)] {
        h.add_method(
            MethodInfo::new(MethodId::new(id), format!("m{id}"), MAIN)
                .with_flags(MethodFlags::STATIC)
                .with_params(&[ValueKind::Int])
                .returns(ValueKind::Int)
                .with_body(body),
        );
    }
    h
}

/// Benchmark building a loop with an inlined call, with and without inlining.
fn bench_build(c: &mut Criterion) {
    let env = BuildEnv::new(Arc::new(hierarchy()));
    let inlining = BuilderConfig::default();
    let no_inlining = BuilderConfig::default().with_inlining(false, 0);

    let mut group = c.benchmark_group("build");
    group.throughput(Throughput::Elements(1));
    group.bench_function("loop_with_inlined_call", |b| {
        let builder = GraphBuilder::new(&env, &inlining);
        b.iter(|| black_box(builder.build(black_box(MethodId::new(1))).unwrap()));
    });
    group.bench_function("loop_with_call_node", |b| {
        let builder = GraphBuilder::new(&env, &no_inlining);
        b.iter(|| black_box(builder.build(black_box(MethodId::new(1))).unwrap()));
    });
    group.finish();

    let methods: Vec<MethodId> = (0..64).map(|i| MethodId::new(1 + i % 2)).collect();
    let mut group = c.benchmark_group("build_all");
    group.throughput(Throughput::Elements(methods.len() as u64));
    group.bench_function("parallel_units", |b| {
        b.iter(|| black_box(build_all(&env, &inlining, black_box(&methods))));
    });
    group.finish();
}

criterion_group!(benches, bench_build);
criterion_main!(benches);
