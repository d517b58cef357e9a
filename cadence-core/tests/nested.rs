//! Integration Tests for Nested Graph Nodes
//!
//! Map, reduce, switch, mesh and try-except nodes, each driven end to end
//! through a simulation run.

use std::sync::Arc;

use parking_lot::Mutex;

use cadence_core::graph::NodeRef;
use cadence_core::prelude::*;
use cadence_core::series::GraphKey;

fn t(secs: i64) -> EngineTime {
    EngineTime::from_secs(secs)
}

fn ticks(values: &[(i64, i64)]) -> Vec<(EngineTime, DeltaValue)> {
    values.iter().map(|(s, v)| (t(*s), DeltaValue::from(*v))).collect()
}

fn int_value(ctx: &NodeContext<'_>, name: &str) -> Result<i64> {
    ctx.value(name)?
        .and_then(|v| v.as_int())
        .ok_or_else(|| EngineError::evaluation(format!("`{name}` is not an int")))
}

fn simulate(graph: &GraphBuilder, end: i64) -> Result<()> {
    evaluate_graph(graph, GraphConfiguration::simulation(t(1), t(end)))
}

/// `stub -> f(ts)`, with the stub fed from the outer `ts` argument.
fn unary(name: &str, f: fn(i64) -> Result<i64>) -> NestedGraph {
    let mut graph = GraphBuilder::new();
    let stub = graph.add_node(reference_stub("ts", TsType::Value));
    let op = graph.add_node(compute_node(name, [("ts", TsType::Value)], TsType::Value, move |ctx| {
        let x = int_value(ctx, "ts")?;
        ctx.set_output(f(x)?)
    }));
    graph.connect(stub, op, "ts").unwrap();
    NestedGraph::new(graph).with_input("ts", stub).with_output(op)
}

fn int_dict(items: &[(&str, i64)]) -> DeltaValue {
    DeltaValue::dict(items.iter().map(|(k, v)| (*k, *v)))
}

#[test]
fn map_runs_one_graph_per_key() {
    let mut graph = GraphBuilder::new();
    let src = graph.add_node(replay_source(
        "src",
        TsType::dict(TsType::Value),
        vec![
            (t(1), int_dict(&[("a", 1), ("b", 2)])),
            (t(2), int_dict(&[("a", 10)])),
            (
                t(3),
                DeltaValue::Dict {
                    modified: vec![],
                    removed: vec![Scalar::from("b")],
                },
            ),
        ],
    ));
    let spec = MapSpec::new(unary("double", |x| Ok(x * 2))).with_multiplexed_args(["ts"]);
    let map = graph.add_node(map_node(
        "map",
        spec,
        [("ts", TsType::dict(TsType::Value))],
        Some(TsType::dict(TsType::Value)),
    ));
    let (sink, recording) = record_sink("out", TsType::dict(TsType::Value));
    let sink = graph.add_node(sink);
    graph.connect(src, map, "ts").unwrap();
    graph.connect(map, sink, "ts").unwrap();

    simulate(&graph, 10).unwrap();

    assert_eq!(
        *recording.lock(),
        vec![
            (t(1), int_dict(&[("a", 2), ("b", 4)])),
            (t(2), int_dict(&[("a", 20)])),
            (
                t(3),
                DeltaValue::Dict {
                    modified: vec![],
                    removed: vec![Scalar::from("b")],
                }
            ),
        ]
    );
}

/// Removing and re-adding a key in one cycle replaces its graph.
#[test]
fn map_rebuilds_a_key_removed_and_readded() {
    let mut graph = GraphBuilder::new();
    let src = graph.add_node(replay_source(
        "src",
        TsType::dict(TsType::Value),
        vec![
            (t(1), int_dict(&[("a", 1)])),
            (
                t(2),
                DeltaValue::Dict {
                    modified: vec![(Scalar::from("a"), DeltaValue::from(5))],
                    removed: vec![Scalar::from("a")],
                },
            ),
        ],
    ));
    let spec = MapSpec::new(unary("double", |x| Ok(x * 2))).with_multiplexed_args(["ts"]);
    let map = graph.add_node(map_node(
        "map",
        spec,
        [("ts", TsType::dict(TsType::Value))],
        Some(TsType::dict(TsType::Value)),
    ));
    let seen: Arc<Mutex<Vec<Vec<GraphKey>>>> = Arc::default();
    let graphs = seen.clone();
    let sink = graph.add_node(sink_node("graphs", [("ts", TsType::dict(TsType::Value))], move |ctx| {
        let owner = NodeRef::new(ctx.node().graph, map);
        graphs.lock().push(ctx.runtime().nested_graphs(owner));
        Ok(())
    }));
    graph.connect(src, map, "ts").unwrap();
    graph.connect(map, sink, "ts").unwrap();

    simulate(&graph, 10).unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].len(), 1);
    assert_eq!(seen[1].len(), 1);
    assert_ne!(seen[0][0], seen[1][0]);
}

/// A key graph asking to run again in the cycle it is running in does not
/// wake its map a second time.
#[test]
fn key_graph_rescheduling_itself_now_runs_once_per_cycle() {
    let seen: Arc<Mutex<Vec<EngineTime>>> = Arc::default();
    let times = seen.clone();
    let mut nested = GraphBuilder::new();
    let stub = nested.add_node(reference_stub("ts", TsType::Value));
    let again = nested.add_node(compute_node("again", [("ts", TsType::Value)], TsType::Value, move |ctx| {
        let now = ctx.evaluation_time();
        times.lock().push(now);
        let node = ctx.node();
        ctx.runtime_mut().schedule_node(node, now)?;
        let x = int_value(ctx, "ts")?;
        ctx.set_output(x)
    }));
    nested.connect(stub, again, "ts").unwrap();
    let spec = MapSpec::new(NestedGraph::new(nested).with_input("ts", stub).with_output(again))
        .with_multiplexed_args(["ts"]);

    let mut graph = GraphBuilder::new();
    let src = graph.add_node(replay_source(
        "src",
        TsType::dict(TsType::Value),
        vec![(t(1), int_dict(&[("a", 1)])), (t(2), int_dict(&[("a", 2)]))],
    ));
    let map = graph.add_node(map_node(
        "map",
        spec,
        [("ts", TsType::dict(TsType::Value))],
        Some(TsType::dict(TsType::Value)),
    ));
    let (sink, recording) = record_sink("out", TsType::dict(TsType::Value));
    let sink = graph.add_node(sink);
    graph.connect(src, map, "ts").unwrap();
    graph.connect(map, sink, "ts").unwrap();

    simulate(&graph, 10).unwrap();

    assert_eq!(*seen.lock(), vec![t(1), t(2)]);
    assert_eq!(
        *recording.lock(),
        vec![(t(1), int_dict(&[("a", 1)])), (t(2), int_dict(&[("a", 2)]))]
    );
}

#[test]
fn reduce_folds_a_dict() {
    let mut op = GraphBuilder::new();
    let lhs = op.add_node(reference_stub("lhs", TsType::Value));
    let rhs = op.add_node(reference_stub("rhs", TsType::Value));
    let add = op.add_node(compute_node(
        "add",
        [("lhs", TsType::Value), ("rhs", TsType::Value)],
        TsType::Value,
        |ctx| {
            let sum = int_value(ctx, "lhs")? + int_value(ctx, "rhs")?;
            ctx.set_output(sum)
        },
    ));
    op.connect(lhs, add, "lhs").unwrap();
    op.connect(rhs, add, "rhs").unwrap();
    let op = NestedGraph::new(op)
        .with_input("lhs", lhs)
        .with_input("rhs", rhs)
        .with_output(add);

    let mut graph = GraphBuilder::new();
    let src = graph.add_node(replay_source(
        "src",
        TsType::dict(TsType::Value),
        vec![
            (t(1), int_dict(&[("a", 1), ("b", 2), ("c", 3)])),
            (t(2), int_dict(&[("b", 20)])),
            (
                t(3),
                DeltaValue::Dict {
                    modified: vec![],
                    removed: vec![Scalar::from("a")],
                },
            ),
        ],
    ));
    let zero = graph.add_node(replay_source("zero", TsType::Value, ticks(&[(1, 0)])));
    let reduce = graph.add_node(reduce_node("sum", op, TsType::Value));
    let (sink, recording) = record_sink("out", TsType::Value);
    let sink = graph.add_node(sink);
    graph.connect(src, reduce, "ts").unwrap();
    graph.connect(zero, reduce, "zero").unwrap();
    graph.connect(reduce, sink, "ts").unwrap();

    simulate(&graph, 10).unwrap();

    assert_eq!(*recording.lock(), ticks(&[(1, 6), (2, 24), (3, 23)]));
}

fn switch_graph(keys: &[(i64, &str)]) -> (GraphBuilder, Recording) {
    let spec = SwitchSpec::new()
        .with_branch("double", unary("double", |x| Ok(x * 2)))
        .with_branch("negate", unary("negate", |x| Ok(-x)));
    let mut graph = GraphBuilder::new();
    let key = graph.add_node(replay_source(
        "key",
        TsType::Value,
        keys.iter().map(|(s, k)| (t(*s), DeltaValue::from(*k))).collect(),
    ));
    let ts = graph.add_node(replay_source("ts", TsType::Value, ticks(&[(1, 5), (2, 6), (3, 7)])));
    let switch = graph.add_node(switch_node("switch", spec, [("ts", TsType::Value)], Some(TsType::Value)));
    let (sink, recording) = record_sink("out", TsType::Value);
    let sink = graph.add_node(sink);
    graph.connect(key, switch, SWITCH_KEY).unwrap();
    graph.connect(ts, switch, "ts").unwrap();
    graph.connect(switch, sink, "ts").unwrap();
    (graph, recording)
}

#[test]
fn switch_follows_its_key() {
    let (graph, recording) = switch_graph(&[(1, "double"), (2, "negate"), (3, "negate")]);
    simulate(&graph, 10).unwrap();
    assert_eq!(*recording.lock(), ticks(&[(1, 10), (2, -6), (3, -7)]));
}

#[test]
fn switch_without_branch_fails() {
    let (graph, _) = switch_graph(&[(1, "double"), (2, "triple")]);
    let err = simulate(&graph, 10).unwrap_err();
    assert!(err.to_string().contains("no branch"), "{err}");
}

/// Key graph `key + result[dep(key)]`, where `dep` names the key read.
fn mesh_spec(dep: fn(i64) -> Option<i64>) -> MapSpec {
    let mut graph = GraphBuilder::new();
    let key = graph.add_node(key_stub("key"));
    let depends_on = graph.add_node(compute_node("dep", [("key", TsType::Value)], TsType::Value, move |ctx| {
        match dep(int_value(ctx, "key")?) {
            Some(k) => ctx.set_output(k),
            None => Ok(()),
        }
    }));
    let lookup = graph.add_node(mesh_lookup("lookup", "acc", TsType::Value));
    let acc = graph.add_node(compute_node_with(
        NodeSignature::new("acc", NodeKind::Compute).with_valid_inputs(["key"]),
        [("key", TsType::Value), ("prev", TsType::Value)],
        Some(TsType::Value),
        |ctx| {
            let k = int_value(ctx, "key")?;
            if k == 0 {
                return ctx.set_output(0);
            }
            if !ctx.valid("prev") {
                return Ok(());
            }
            let prev = int_value(ctx, "prev")?;
            ctx.set_output(k + prev)
        },
    ));
    graph.connect(key, depends_on, "key").unwrap();
    graph.connect(key, lookup, "key").unwrap();
    graph.connect(depends_on, lookup, "depends_on").unwrap();
    graph.connect(key, acc, "key").unwrap();
    graph.connect(lookup, acc, "prev").unwrap();
    MapSpec::new(NestedGraph::new(graph).with_input("key", key).with_output(acc)).with_key_arg("key")
}

fn mesh_graph(spec: MapSpec, key: i64) -> (GraphBuilder, Arc<Mutex<Vec<(i64, i64)>>>) {
    let mut graph = GraphBuilder::new();
    let keys = graph.add_node(replay_source("keys", TsType::Set, vec![(t(1), DeltaValue::set_added([key]))]));
    let mesh = graph.add_node(mesh_node(
        "mesh",
        "acc",
        spec,
        [(KEYS_ARG, TsType::Set)],
        Some(TsType::dict(TsType::Value)),
    ));
    let latest: Arc<Mutex<Vec<(i64, i64)>>> = Arc::default();
    let snapshot = latest.clone();
    let sink = graph.add_node(sink_node("values", [("ts", TsType::dict(TsType::Value))], move |ctx| {
        let input = ctx.input("ts")?;
        let rt = ctx.runtime();
        let mut items: Vec<(i64, i64)> = rt
            .dict_input_items(input)
            .into_iter()
            .filter_map(|(k, item)| Some((k.as_int()?, rt.input_value(item)?.as_int()?)))
            .collect();
        items.sort_unstable();
        *snapshot.lock() = items;
        Ok(())
    }));
    graph.connect(keys, mesh, KEYS_ARG).unwrap();
    graph.connect(mesh, sink, "ts").unwrap();
    (graph, latest)
}

/// Each key adds itself to the result of the key below it; the mesh builds
/// the graphs for the keys it is asked for and evaluates them in order.
#[test]
fn mesh_builds_requested_keys_in_dependency_order() {
    let spec = mesh_spec(|k| (k > 0).then(|| k - 1));
    let (graph, latest) = mesh_graph(spec, 3);
    simulate(&graph, 10).unwrap();
    assert_eq!(*latest.lock(), vec![(0, 0), (1, 1), (2, 3), (3, 6)]);
}

#[test]
fn mesh_rejects_dependency_cycles() {
    let spec = mesh_spec(|k| match k {
        1 => Some(2),
        2 => Some(1),
        _ => None,
    });
    let (graph, _) = mesh_graph(spec, 1);
    let err = simulate(&graph, 10).unwrap_err();
    assert!(err.to_string().contains("dependency cycle"), "{err}");
}

#[test]
fn try_except_turns_failures_into_values() {
    let nested = unary("checked", |x| {
        if x < 0 {
            Err(EngineError::evaluation("negative input"))
        } else {
            Ok(x)
        }
    });
    let output = TsType::bundle([(EXCEPTION_FIELD, TsType::Value), (OUT_FIELD, TsType::Value)]);
    let mut graph = GraphBuilder::new();
    let src = graph.add_node(replay_source("src", TsType::Value, ticks(&[(1, 1), (2, -1), (3, 2)])));
    let guarded = graph.add_node(try_except_node("guarded", nested, [("ts", TsType::Value)], Some(TsType::Value)));
    let (sink, recording) = record_sink("out", output);
    let sink = graph.add_node(sink);
    graph.connect(src, guarded, "ts").unwrap();
    graph.connect(guarded, sink, "ts").unwrap();

    simulate(&graph, 10).unwrap();

    let recording = recording.lock();
    assert_eq!(recording.len(), 2);
    assert_eq!(
        recording[0],
        (t(1), DeltaValue::Bundle(vec![(1, DeltaValue::from(1))]))
    );
    let (time, DeltaValue::Bundle(fields)) = &recording[1] else {
        panic!("expected a bundle, got {:?}", recording[1]);
    };
    assert_eq!(*time, t(2));
    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].0, 0);
    let error = fields[0].1.as_scalar().and_then(|s| s.as_error()).expect("error value");
    assert!(error.error_msg.contains("negative"));
}
