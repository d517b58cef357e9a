//! Lifecycle observers.
//!
//! Observers are told about graph start/stop, node start/stop and every
//! graph and node evaluation. They only read the runtime.

use tracing::{debug, info};

use super::Runtime;
use crate::graph::NodeRef;
use crate::series::GraphKey;

/// Hooks fired around engine activity. Every hook defaults to doing nothing.
#[allow(unused_variables)]
pub trait EvaluationLifecycleObserver: Send {
    fn on_before_start_graph(&mut self, rt: &Runtime, graph: GraphKey) {}
    fn on_after_start_graph(&mut self, rt: &Runtime, graph: GraphKey) {}
    fn on_before_start_node(&mut self, rt: &Runtime, node: NodeRef) {}
    fn on_after_start_node(&mut self, rt: &Runtime, node: NodeRef) {}
    fn on_before_graph_evaluation(&mut self, rt: &Runtime, graph: GraphKey) {}
    fn on_after_graph_evaluation(&mut self, rt: &Runtime, graph: GraphKey) {}
    fn on_before_node_evaluation(&mut self, rt: &Runtime, node: NodeRef) {}
    fn on_after_node_evaluation(&mut self, rt: &Runtime, node: NodeRef) {}
    fn on_before_stop_node(&mut self, rt: &Runtime, node: NodeRef) {}
    fn on_after_stop_node(&mut self, rt: &Runtime, node: NodeRef) {}
    fn on_before_stop_graph(&mut self, rt: &Runtime, graph: GraphKey) {}
    fn on_after_stop_graph(&mut self, rt: &Runtime, graph: GraphKey) {}
}

/// Emits a tracing event for every hook. Installed when the run
/// configuration sets `trace`.
#[derive(Debug, Default)]
pub struct EvaluationTrace {
    /// Also trace individual node evaluations.
    pub nodes: bool,
}

impl EvaluationTrace {
    pub fn new() -> Self {
        Self { nodes: true }
    }

    fn node_name(rt: &Runtime, node: NodeRef) -> String {
        let name = rt
            .node_signature(node)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        let path = rt.wiring_path(node).unwrap_or_default();
        format!("{path} {name}")
    }

    fn graph_name(rt: &Runtime, graph: GraphKey) -> String {
        let id = rt.graph_id(graph).map(|id| format!("{:?}", id.as_slice())).unwrap_or_default();
        match rt.graph_label(graph) {
            Some(label) => format!("{id} ({label})"),
            None => id,
        }
    }
}

impl EvaluationLifecycleObserver for EvaluationTrace {
    fn on_before_start_graph(&mut self, rt: &Runtime, graph: GraphKey) {
        info!(time = %rt.evaluation_time(), graph = %Self::graph_name(rt, graph), "starting graph");
    }

    fn on_after_start_graph(&mut self, rt: &Runtime, graph: GraphKey) {
        info!(time = %rt.evaluation_time(), graph = %Self::graph_name(rt, graph), "started graph");
    }

    fn on_before_start_node(&mut self, rt: &Runtime, node: NodeRef) {
        debug!(node = %Self::node_name(rt, node), "starting node");
    }

    fn on_after_start_node(&mut self, rt: &Runtime, node: NodeRef) {
        debug!(node = %Self::node_name(rt, node), "started node");
    }

    fn on_before_graph_evaluation(&mut self, rt: &Runtime, graph: GraphKey) {
        debug!(time = %rt.evaluation_time(), graph = %Self::graph_name(rt, graph), "evaluating graph");
    }

    fn on_after_graph_evaluation(&mut self, rt: &Runtime, graph: GraphKey) {
        debug!(
            time = %rt.evaluation_time(),
            graph = %Self::graph_name(rt, graph),
            cycle_time = ?rt.cycle_time(),
            "evaluated graph"
        );
    }

    fn on_before_node_evaluation(&mut self, rt: &Runtime, node: NodeRef) {
        if self.nodes {
            debug!(time = %rt.evaluation_time(), node = %Self::node_name(rt, node), "evaluating node");
        }
    }

    fn on_after_node_evaluation(&mut self, rt: &Runtime, node: NodeRef) {
        if !self.nodes {
            return;
        }
        let modified = rt
            .node_output(node)
            .is_some_and(|output| rt.output_modified(output));
        debug!(node = %Self::node_name(rt, node), modified, "evaluated node");
    }

    fn on_before_stop_node(&mut self, rt: &Runtime, node: NodeRef) {
        debug!(node = %Self::node_name(rt, node), "stopping node");
    }

    fn on_after_stop_node(&mut self, rt: &Runtime, node: NodeRef) {
        debug!(node = %Self::node_name(rt, node), "stopped node");
    }

    fn on_before_stop_graph(&mut self, rt: &Runtime, graph: GraphKey) {
        info!(time = %rt.evaluation_time(), graph = %Self::graph_name(rt, graph), "stopping graph");
    }

    fn on_after_stop_graph(&mut self, rt: &Runtime, graph: GraphKey) {
        info!(time = %rt.evaluation_time(), graph = %Self::graph_name(rt, graph), "stopped graph");
    }
}

macro_rules! notify {
    ($($name:ident => $hook:ident($arg:ident: $ty:ty);)*) => {
        impl Runtime {
            $(
                pub(crate) fn $name(&mut self, $arg: $ty) {
                    self.with_observers(|observer, rt| observer.$hook(rt, $arg));
                }
            )*
        }
    };
}

notify! {
    notify_before_start_graph => on_before_start_graph(graph: GraphKey);
    notify_after_start_graph => on_after_start_graph(graph: GraphKey);
    notify_before_start_node => on_before_start_node(node: NodeRef);
    notify_after_start_node => on_after_start_node(node: NodeRef);
    notify_before_graph_evaluation => on_before_graph_evaluation(graph: GraphKey);
    notify_after_graph_evaluation => on_after_graph_evaluation(graph: GraphKey);
    notify_before_node_evaluation => on_before_node_evaluation(node: NodeRef);
    notify_after_node_evaluation => on_after_node_evaluation(node: NodeRef);
    notify_before_stop_node => on_before_stop_node(node: NodeRef);
    notify_after_stop_node => on_after_stop_node(node: NodeRef);
    notify_before_stop_graph => on_before_stop_graph(graph: GraphKey);
    notify_after_stop_graph => on_after_stop_graph(graph: GraphKey);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::EngineTime;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    impl EvaluationLifecycleObserver for Recorder {
        fn on_before_graph_evaluation(&mut self, _rt: &Runtime, _graph: GraphKey) {
            self.0.lock().push("before");
        }

        fn on_after_graph_evaluation(&mut self, _rt: &Runtime, _graph: GraphKey) {
            self.0.lock().push("after");
        }
    }

    #[test]
    fn observers_see_hooks_in_order() {
        use crate::series::ArenaHandle;
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut rt = Runtime::for_tests(EngineTime::from_secs(1));
        rt.add_observer(Recorder(log.clone()));
        let graph = GraphKey::from_parts(0, 0);
        rt.notify_before_graph_evaluation(graph);
        rt.notify_after_graph_evaluation(graph);
        assert_eq!(*log.lock(), vec!["before", "after"]);
    }
}
