//! Engine throughput benchmarks
//!
//! Measures whole simulation runs: a linear replay -> sum -> sink chain and
//! a map over a dict with one nested graph per key.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use cadence_core::prelude::*;

fn t(secs: i64) -> EngineTime {
    EngineTime::from_secs(secs)
}

fn int_value(ctx: &NodeContext<'_>, name: &str) -> Result<i64> {
    ctx.value(name)?
        .and_then(|v| v.as_int())
        .ok_or_else(|| EngineError::evaluation(format!("`{name}` is not an int")))
}

fn chain_graph(ticks: i64) -> GraphBuilder {
    let values = (1..=ticks).map(|s| (t(s), DeltaValue::from(s))).collect();
    let mut graph = GraphBuilder::new();
    let src = graph.add_node(replay_source("src", TsType::Value, values));
    let sum = graph.add_node(compute_node("sum", [("ts", TsType::Value)], TsType::Value, |ctx| {
        let x = int_value(ctx, "ts")?;
        let output = ctx.output()?;
        let total = ctx.runtime().output_value(output).and_then(|v| v.as_int()).unwrap_or_default();
        ctx.set_output(total + x)
    }));
    let sink = graph.add_node(sink_node("sink", [("ts", TsType::Value)], |ctx| {
        black_box(ctx.value("ts")?);
        Ok(())
    }));
    graph.connect(src, sum, "ts").expect("connect");
    graph.connect(sum, sink, "ts").expect("connect");
    graph
}

fn map_graph(keys: i64, ticks: i64) -> GraphBuilder {
    let mut nested = GraphBuilder::new();
    let stub = nested.add_node(reference_stub("ts", TsType::Value));
    let double = nested.add_node(compute_node("double", [("ts", TsType::Value)], TsType::Value, |ctx| {
        let x = int_value(ctx, "ts")?;
        ctx.set_output(x * 2)
    }));
    nested.connect(stub, double, "ts").expect("connect");
    let spec = MapSpec::new(NestedGraph::new(nested).with_input("ts", stub).with_output(double))
        .with_multiplexed_args(["ts"]);

    let values = (1..=ticks)
        .map(|s| (t(s), DeltaValue::dict((0..keys).map(|k| (k, s * k)))))
        .collect();
    let mut graph = GraphBuilder::new();
    let src = graph.add_node(replay_source("src", TsType::dict(TsType::Value), values));
    let map = graph.add_node(map_node(
        "map",
        spec,
        [("ts", TsType::dict(TsType::Value))],
        Some(TsType::dict(TsType::Value)),
    ));
    let sink = graph.add_node(sink_node("sink", [("ts", TsType::dict(TsType::Value))], |ctx| {
        let input = ctx.input("ts")?;
        black_box(ctx.runtime().input_delta_value(input));
        Ok(())
    }));
    graph.connect(src, map, "ts").expect("connect");
    graph.connect(map, sink, "ts").expect("connect");
    graph
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain");
    for ticks in [100, 1_000, 10_000] {
        let graph = chain_graph(ticks);
        group.bench_with_input(BenchmarkId::from_parameter(ticks), &ticks, |b, &ticks| {
            b.iter(|| {
                let config = GraphConfiguration::simulation(t(1), t(ticks + 1));
                evaluate_graph(&graph, config).expect("run")
            })
        });
    }
    group.finish();
}

fn bench_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("map");
    for keys in [10, 100] {
        let graph = map_graph(keys, 100);
        group.bench_with_input(BenchmarkId::from_parameter(keys), &keys, |b, _| {
            b.iter(|| evaluate_graph(&graph, GraphConfiguration::simulation(t(1), t(101))).expect("run"))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_chain, bench_map);
criterion_main!(benches);
