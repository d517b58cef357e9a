//! Integration Tests for the Evaluation Engine
//!
//! These tests run whole graphs through the engine and check what reaches
//! the sinks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cadence_core::graph::{NodeRef, ERROR_PATH};
use cadence_core::prelude::*;
use cadence_core::runtime::EvaluationLifecycleObserver;

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

fn running_sum() -> NodeBuilder {
    compute_node("sum", [("ts", TsType::Value)], TsType::Value, |ctx| {
        let x = int_value(ctx, "ts")?;
        let output = ctx.output()?;
        let total = ctx
            .runtime()
            .output_value(output)
            .and_then(|v| v.as_int())
            .unwrap_or_default();
        ctx.set_output(total + x)
    })
}

fn sum_graph(values: &[(i64, i64)]) -> (GraphBuilder, Recording) {
    let mut graph = GraphBuilder::new();
    let src = graph.add_node(replay_source("src", TsType::Value, ticks(values)));
    let sum = graph.add_node(running_sum());
    let (sink, recording) = record_sink("out", TsType::Value);
    let sink = graph.add_node(sink);
    graph.connect(src, sum, "ts").unwrap();
    graph.connect(sum, sink, "ts").unwrap();
    (graph, recording)
}

/// A running sum sees every tick before the end time and none after it.
#[test]
fn running_sum_stops_before_end_time() {
    let (graph, recording) = sum_graph(&[(1, 1), (2, 2), (3, 3), (4, 4)]);
    evaluate_graph(&graph, GraphConfiguration::simulation(t(1), t(4))).unwrap();

    assert_eq!(*recording.lock(), ticks(&[(1, 1), (2, 3), (3, 6)]));
}

/// A JSON configuration drives the same run.
#[test]
fn json_configuration_runs_a_graph() {
    let (graph, recording) = sum_graph(&[(1, 5), (2, 5)]);
    let config = GraphConfiguration::from_json(r#"{"start_time": 1000000, "end_time": 10000000}"#).unwrap();
    assert_eq!(config.run_mode, EvaluationMode::Simulation);

    evaluate_graph(&graph, config).unwrap();
    assert_eq!(*recording.lock(), ticks(&[(1, 5), (2, 10)]));
}

#[test]
fn invalid_time_window_is_rejected() {
    let (graph, _) = sum_graph(&[(1, 1)]);
    let err = evaluate_graph(&graph, GraphConfiguration::simulation(t(5), t(5))).unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));
}

/// Nodes only run when an active input ticks or they are scheduled.
#[test]
fn observers_see_each_node_evaluation() {
    #[derive(Clone, Default)]
    struct CountEvaluations(Arc<AtomicUsize>);

    impl EvaluationLifecycleObserver for CountEvaluations {
        fn on_after_node_evaluation(&mut self, _rt: &Runtime, _node: NodeRef) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let (graph, _) = sum_graph(&[(1, 1), (3, 1)]);
    let counter = CountEvaluations::default();
    let mut engine = EvaluationEngine::new(&graph, GraphConfiguration::simulation(t(1), t(10)).with_trace(true)).unwrap();
    engine.add_observer(counter.clone());
    engine.run().unwrap();

    // Source, sum and sink at t1 and again at t3.
    assert_eq!(counter.0.load(Ordering::SeqCst), 6);
}

/// A failing node stops the run with its wiring context attached.
#[test]
fn node_failure_aborts_the_run() {
    let mut graph = GraphBuilder::new();
    let src = graph.add_node(replay_source("src", TsType::Value, ticks(&[(1, 1), (2, 0)])));
    let divide = graph.add_node(compute_node("divide", [("ts", TsType::Value)], TsType::Value, |ctx| {
        match int_value(ctx, "ts")? {
            0 => Err(EngineError::evaluation("division by zero")),
            x => ctx.set_output(100 / x),
        }
    }));
    graph.connect(src, divide, "ts").unwrap();

    let err = evaluate_graph(&graph, GraphConfiguration::simulation(t(1), t(10))).unwrap_err();
    let node_error = err.as_node_error().expect("node error");
    assert_eq!(node_error.signature_name, "divide");
    assert_eq!(node_error.error_msg, "division by zero");
    assert_eq!(node_error.additional_context.as_deref(), Some("During evaluation"));
}

/// With error capture the failure is published and the run carries on.
#[test]
fn captured_errors_tick_the_error_output() {
    let mut graph = GraphBuilder::new();
    let src = graph.add_node(replay_source("src", TsType::Value, ticks(&[(1, 1), (2, 0), (3, 4)])));
    let signature = NodeSignature::new("divide", NodeKind::Compute).with_capture_exception();
    let divide = graph.add_node(compute_node_with(
        signature,
        [("ts", TsType::Value)],
        Some(TsType::Value),
        |ctx| match int_value(ctx, "ts")? {
            0 => Err(EngineError::evaluation("division by zero")),
            x => ctx.set_output(100 / x),
        },
    ));
    let (values, value_recording) = record_sink("values", TsType::Value);
    let values = graph.add_node(values);
    let (errors, error_recording) = record_sink("errors", TsType::Value);
    let errors = graph.add_node(errors);
    graph.connect(src, divide, "ts").unwrap();
    graph.connect(divide, values, "ts").unwrap();
    graph.connect_path(divide, [ERROR_PATH], errors, [0]).unwrap();

    evaluate_graph(&graph, GraphConfiguration::simulation(t(1), t(10))).unwrap();

    assert_eq!(*value_recording.lock(), ticks(&[(1, 100), (3, 25)]));
    let errors = error_recording.lock();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, t(2));
    let error = errors[0].1.as_scalar().and_then(|s| s.as_error()).expect("error value");
    assert_eq!(error.error_msg, "division by zero");
}

/// Invalidating an output wakes its consumers once; a second call is a no-op.
#[test]
fn invalidated_output_notifies_consumers() {
    let mut graph = GraphBuilder::new();
    let src = graph.add_node(replay_source("src", TsType::Value, ticks(&[(1, 1), (2, 0)])));
    let gate = graph.add_node(compute_node("gate", [("ts", TsType::Value)], TsType::Value, |ctx| {
        match int_value(ctx, "ts")? {
            0 => {
                let output = ctx.output()?;
                ctx.runtime_mut().mark_invalid(output)?;
                ctx.runtime_mut().mark_invalid(output)
            }
            x => ctx.set_output(x),
        }
    }));
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let log = seen.clone();
    let watch = graph.add_node(compute_node_with(
        NodeSignature::new("watch", NodeKind::Sink).with_valid_inputs(Vec::<String>::new()),
        [("ts", TsType::Value)],
        None,
        move |ctx| {
            log.lock().push((ctx.evaluation_time(), ctx.valid("ts")));
            Ok(())
        },
    ));
    graph.connect(src, gate, "ts").unwrap();
    graph.connect(gate, watch, "ts").unwrap();

    evaluate_graph(&graph, GraphConfiguration::simulation(t(1), t(10))).unwrap();
    assert_eq!(*seen.lock(), vec![(t(1), true), (t(2), false)]);
}

/// A sink reading through a reference follows it when it is repointed.
#[test]
fn reference_outputs_rebind_consumers() {
    let mut graph = GraphBuilder::new();
    let a = graph.add_node(replay_source("a", TsType::Value, ticks(&[(1, 1), (3, 3)])));
    let b = graph.add_node(replay_source("b", TsType::Value, ticks(&[(2, 20), (4, 40)])));
    let sel = graph.add_node(replay_source(
        "sel",
        TsType::Value,
        vec![(t(1), DeltaValue::from("a")), (t(3), DeltaValue::from("b"))],
    ));
    let select = graph.add_node(compute_node_with(
        NodeSignature::new("select", NodeKind::Compute),
        [
            ("a", TsType::reference(TsType::Value)),
            ("b", TsType::reference(TsType::Value)),
            ("sel", TsType::Value),
        ],
        Some(TsType::reference(TsType::Value)),
        |ctx| {
            let name = ctx
                .value("sel")?
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| EngineError::evaluation("no selection"))?;
            let input = ctx.input(&name)?;
            let output = ctx.output()?;
            let rt = ctx.runtime_mut();
            let reference = rt.reference_input_value(input).unwrap_or_default();
            rt.set_reference(output, reference)
        },
    ));
    let (sink, recording) = record_sink("out", TsType::Value);
    let sink = graph.add_node(sink);
    graph.connect(a, select, "a").unwrap();
    graph.connect(b, select, "b").unwrap();
    graph.connect(sel, select, "sel").unwrap();
    graph.connect(select, sink, "ts").unwrap();

    evaluate_graph(&graph, GraphConfiguration::simulation(t(1), t(10))).unwrap();

    assert_eq!(*recording.lock(), ticks(&[(1, 1), (3, 20), (4, 40)]));
}

#[test]
fn push_sources_need_real_time() {
    let mut graph = GraphBuilder::new();
    graph.add_node(push_source("push", TsType::Value));
    let err = EvaluationEngine::new(&graph, GraphConfiguration::simulation(t(1), t(10))).err();
    assert!(matches!(err, Some(EngineError::Configuration(_))));
}

#[test]
fn recorded_replay_is_not_supported() {
    let mut graph = GraphBuilder::new();
    graph.add_node(recorded_replay_source("replay", "state-1", TsType::Value));
    let err = evaluate_graph(&graph, GraphConfiguration::simulation(t(1), t(10))).unwrap_err();
    assert!(err.to_string().contains("not implemented"));
}

/// Values pushed from another thread arrive in order; a stop request ends
/// the run long before the end time.
#[test]
fn real_time_push_and_stop() {
    let mut graph = GraphBuilder::new();
    let push = graph.add_node(push_source("push", TsType::Value));
    let (sink, recording) = record_sink("out", TsType::Value);
    let sink = graph.add_node(sink);
    graph.connect(push, sink, "ts").unwrap();

    let start = EngineTime::now();
    let config = GraphConfiguration::new(EvaluationMode::RealTime, start, start + EngineTimeDelta::from_secs(30));
    let engine = EvaluationEngine::new(&graph, config).unwrap();
    let sender = engine.push_sender();
    let stop = engine.stop_handle();
    let seen = recording.clone();

    let producer = thread::spawn(move || {
        for v in 1..=3 {
            assert!(sender.send(push, v));
            thread::sleep(Duration::from_millis(5));
        }
        for _ in 0..1000 {
            if seen.lock().len() >= 3 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        stop.request_stop();
        assert!(!sender.send(push, 4));
    });

    engine.run().unwrap();
    producer.join().unwrap();

    let values: Vec<DeltaValue> = recording.lock().iter().map(|(_, v)| v.clone()).collect();
    assert_eq!(values, vec![DeltaValue::from(1), DeltaValue::from(2), DeltaValue::from(3)]);
    let times: Vec<EngineTime> = recording.lock().iter().map(|(t, _)| *t).collect();
    assert!(times.windows(2).all(|w| w[0] < w[1]));
    assert!(times.iter().all(|t| *t >= start));
}
