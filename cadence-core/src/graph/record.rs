//! Graph records.
//!
//! A graph is an ordered list of nodes plus a schedule table holding, for
//! each node, the time it next has to be evaluated. Push-source nodes sit at
//! the front of the list and are driven by queued messages instead of the
//! schedule. Nested graphs (map keys, switch branches, reduce trees) are
//! graphs like any other, with a parent node and a nested clock.

use smallvec::SmallVec;
use tracing::{debug, warn};

use super::builder::GraphBuilder;
use super::node::{NodeRecord, NodeRef};
use crate::error::{EngineError, Result};
use crate::lifecycle::LifecycleState;
use crate::runtime::{NestedEngineEvaluationClock, Runtime};
use crate::series::GraphKey;
use crate::time::{EngineTime, MIN_DT};

pub(crate) enum GraphClock {
    /// Scheduling goes to the engine's clock.
    Root,
    /// Scheduling goes to the owning node in the parent graph.
    Nested(NestedEngineEvaluationClock),
}

pub(crate) struct GraphRecord {
    pub id: SmallVec<[i64; 4]>,
    pub label: Option<String>,
    pub parent: Option<NodeRef>,
    pub nodes: Vec<NodeRecord>,
    pub schedule: Vec<EngineTime>,
    pub clock: GraphClock,
    pub state: LifecycleState,
    pub last_evaluation_time: EngineTime,
    pub push_source_nodes_end: usize,
}

impl Runtime {
    pub(crate) fn graph(&self, key: GraphKey) -> Result<&GraphRecord> {
        self.graphs
            .get(key)
            .ok_or_else(|| EngineError::StaleHandle(format!("graph {key}")))
    }

    pub(crate) fn graph_mut(&mut self, key: GraphKey) -> Result<&mut GraphRecord> {
        self.graphs
            .get_mut(key)
            .ok_or_else(|| EngineError::StaleHandle(format!("graph {key}")))
    }

    pub fn graph_exists(&self, key: GraphKey) -> bool {
        self.graphs.contains(key)
    }

    pub fn graph_id(&self, key: GraphKey) -> Result<SmallVec<[i64; 4]>> {
        Ok(self.graph(key)?.id.clone())
    }

    pub fn graph_label(&self, key: GraphKey) -> Option<String> {
        self.graph(key).ok()?.label.clone()
    }

    pub fn graph_parent(&self, key: GraphKey) -> Option<NodeRef> {
        self.graph(key).ok()?.parent
    }

    /// Live graphs driven by `owner`.
    pub fn nested_graphs(&self, owner: NodeRef) -> Vec<GraphKey> {
        self.graphs
            .iter()
            .filter(|(_, graph)| graph.parent == Some(owner))
            .map(|(key, _)| key)
            .collect()
    }

    pub fn graph_len(&self, key: GraphKey) -> usize {
        self.graph(key).map_or(0, |g| g.nodes.len())
    }

    pub fn graph_state(&self, key: GraphKey) -> Option<LifecycleState> {
        self.graph(key).ok().map(|g| g.state)
    }

    pub fn graph_last_evaluation_time(&self, key: GraphKey) -> EngineTime {
        self.graph(key).map_or(MIN_DT, |g| g.last_evaluation_time)
    }

    /// The time the node is next due, `MIN_DT` if never scheduled.
    pub fn node_scheduled_time(&self, node: NodeRef) -> EngineTime {
        self.graph(node.graph)
            .ok()
            .and_then(|g| g.schedule.get(node.ndx).copied())
            .unwrap_or(MIN_DT)
    }

    /// Mark the node as due at `when` and wake its graph.
    pub fn schedule_node(&mut self, node: NodeRef, when: EngineTime) -> Result<()> {
        let now = self.evaluation_time();
        if when < now {
            return Err(EngineError::scheduling(format!(
                "cannot schedule node {} at {when}, evaluation time is already {now}",
                self.wiring_path(node)?
            )));
        }
        let graph = self.graph_mut(node.graph)?;
        let last_evaluation_time = graph
            .nodes
            .get(node.ndx)
            .map_or(MIN_DT, |n| n.last_evaluation_time);
        let slot = graph
            .schedule
            .get_mut(node.ndx)
            .ok_or_else(|| EngineError::StaleHandle(format!("node {node}")))?;
        let scheduled = *slot;
        if scheduled < now || scheduled > when || (scheduled == now && last_evaluation_time == now) {
            *slot = when;
        }
        self.update_graph_next_scheduled(node.graph, when)
    }

    fn graph_node_refs(&self, key: GraphKey, range: std::ops::Range<usize>) -> Vec<NodeRef> {
        range.map(|ndx| NodeRef::new(key, ndx)).collect()
    }

    pub(crate) fn initialise_graph(&mut self, key: GraphKey) -> Result<()> {
        for node in self.graph_node_refs(key, 0..self.graph_len(key)) {
            self.initialise_node(node)?;
        }
        let graph = self.graph_mut(key)?;
        graph.state = graph.state.transition(LifecycleState::Initialised)?;
        Ok(())
    }

    pub(crate) fn start_graph(&mut self, key: GraphKey) -> Result<()> {
        {
            let graph = self.graph_mut(key)?;
            graph.state = graph.state.transition(LifecycleState::Starting)?;
        }
        debug!(graph = %key, "starting graph");
        self.notify_before_start_graph(key);
        self.start_subgraph(key, 0, self.graph_len(key))?;
        let graph = self.graph_mut(key)?;
        graph.state = graph.state.transition(LifecycleState::Started)?;
        self.notify_after_start_graph(key);
        Ok(())
    }

    /// Start the nodes in `start..end`.
    pub(crate) fn start_subgraph(&mut self, key: GraphKey, start: usize, end: usize) -> Result<()> {
        for node in self.graph_node_refs(key, start..end) {
            self.start_node(node)?;
        }
        Ok(())
    }

    /// Stop every running node; the first failure is returned once all are stopped.
    pub(crate) fn stop_graph(&mut self, key: GraphKey) -> Result<()> {
        {
            let graph = self.graph_mut(key)?;
            if !graph.state.is_running() {
                return Ok(());
            }
            graph.state = graph.state.transition(LifecycleState::Stopping)?;
        }
        debug!(graph = %key, "stopping graph");
        self.notify_before_stop_graph(key);
        let result = self.stop_subgraph(key, 0, self.graph_len(key));
        let graph = self.graph_mut(key)?;
        graph.state = graph.state.transition(LifecycleState::Stopped)?;
        self.notify_after_stop_graph(key);
        result
    }

    pub(crate) fn stop_subgraph(&mut self, key: GraphKey, start: usize, end: usize) -> Result<()> {
        let mut first_error = None;
        for node in self.graph_node_refs(key, start..end) {
            if !self.node_is_running(node) {
                continue;
            }
            if let Err(err) = self.stop_node(node) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Dispose every node in reverse order and release the graph.
    pub(crate) fn dispose_graph(&mut self, key: GraphKey) -> Result<()> {
        if !self.graph_exists(key) {
            return Ok(());
        }
        let result = self.dispose_subgraph(key, 0);
        self.graphs.remove(key);
        debug!(graph = %key, "disposed graph");
        result
    }

    fn dispose_subgraph(&mut self, key: GraphKey, start: usize) -> Result<()> {
        let mut first_error = None;
        for node in self.graph_node_refs(key, start..self.graph_len(key)).into_iter().rev() {
            if self.node_state(node) == Some(LifecycleState::Disposed) {
                continue;
            }
            if let Err(err) = self.dispose_node(node) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Release a graph whose construction failed part-way.
    pub(crate) fn discard_graph(&mut self, key: GraphKey) {
        let Some(graph) = self.graphs.remove(key) else {
            return;
        };
        for node in graph.nodes {
            if let Some(input) = node.input {
                if let Err(err) = self.release_input(input) {
                    warn!(graph = %key, error = %err, "failed to release input of discarded graph");
                }
            }
            let outputs = node
                .output
                .filter(|_| !node.output_borrowed)
                .into_iter()
                .chain(node.error_output)
                .chain(node.recordable_state);
            for output in outputs {
                self.release_output(output);
            }
        }
    }

    /// Append the nodes of `builder` to a live graph.
    ///
    /// New nodes are initialised, and started too if the graph is running
    /// and `delay_start` is not set.
    pub(crate) fn extend_graph(&mut self, key: GraphKey, builder: &GraphBuilder, delay_start: bool) -> Result<()> {
        let first = self.graph_len(key);
        builder.make_and_connect_nodes(self, key, first)?;
        let end = self.graph_len(key);
        for node in self.graph_node_refs(key, first..end) {
            self.initialise_node(node)?;
        }
        if !delay_start && self.graph(key)?.state.is_running() {
            self.start_subgraph(key, first, end)?;
        }
        Ok(())
    }

    /// Stop, dispose and drop every node from `start` on.
    pub(crate) fn reduce_graph(&mut self, key: GraphKey, start: usize) -> Result<()> {
        let end = self.graph_len(key);
        if start >= end {
            return Ok(());
        }
        let stopped = self.stop_subgraph(key, start, end);
        let disposed = self.dispose_subgraph(key, start);
        let graph = self.graph_mut(key)?;
        graph.nodes.truncate(start);
        graph.schedule.truncate(start);
        stopped.and(disposed)
    }

    /// One evaluation pass over a graph at the current evaluation time.
    pub(crate) fn evaluate_graph(&mut self, key: GraphKey) -> Result<()> {
        let now = self.evaluation_time();
        self.notify_before_graph_evaluation(key);
        let push_end = {
            let graph = self.graph_mut(key)?;
            graph.last_evaluation_time = now;
            graph.push_source_nodes_end
        };
        if push_end > 0 && self.clock.push_node_requires_scheduling() {
            self.clock.reset_push_node_requires_scheduling();
            self.apply_push_messages(key, push_end)?;
        }

        let mut ndx = push_end;
        while ndx < self.graph_len(key) {
            let scheduled = self.graph(key)?.schedule[ndx];
            let node = NodeRef::new(key, ndx);
            if scheduled == now {
                self.notify_before_node_evaluation(node);
                let result = self.eval_node(node);
                self.notify_after_node_evaluation(node);
                result?;
            } else if scheduled > now {
                self.update_graph_next_scheduled(key, scheduled)?;
            }
            ndx += 1;
        }
        self.notify_after_graph_evaluation(key);
        Ok(())
    }

    fn apply_push_messages(&mut self, key: GraphKey, push_end: usize) -> Result<()> {
        let now = self.evaluation_time();
        loop {
            let Some(message) = self.push_queue.lock().pop_front() else {
                break;
            };
            if message.node_ndx >= push_end {
                return Err(EngineError::wiring(format!(
                    "push message for node {} which is not a push source",
                    message.node_ndx
                )));
            }
            let node = NodeRef::new(key, message.node_ndx);
            self.node_record_mut(node)?.last_evaluation_time = now;
            let value = message.value.clone();
            let accepted = self.with_node_logic(node, |logic, ctx| logic.apply_message(ctx, value))?;
            if !accepted {
                self.push_queue.lock().push_front(message);
                self.clock.mark_push_node_requires_scheduling();
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::key_stub;

    fn at(secs: i64) -> EngineTime {
        EngineTime::from_secs(secs)
    }

    fn one_node_graph(rt: &mut Runtime) -> NodeRef {
        let mut builder = GraphBuilder::new();
        builder.add_node(key_stub("node"));
        let key = builder.make_instance(rt, SmallVec::new(), None, None).unwrap();
        NodeRef::new(key, 0)
    }

    #[test]
    fn schedule_in_the_past_is_rejected() {
        let mut rt = Runtime::for_tests(at(2));
        let node = one_node_graph(&mut rt);
        let err = rt.schedule_node(node, at(1)).unwrap_err();
        assert!(matches!(err, EngineError::Scheduling(_)));
        assert_eq!(rt.node_scheduled_time(node), MIN_DT);
    }

    #[test]
    fn schedule_keeps_the_earliest_pending_time() {
        let mut rt = Runtime::for_tests(at(2));
        let node = one_node_graph(&mut rt);
        rt.schedule_node(node, at(3)).unwrap();
        assert_eq!(rt.node_scheduled_time(node), at(3));
        rt.schedule_node(node, at(2)).unwrap();
        assert_eq!(rt.node_scheduled_time(node), at(2));
        rt.schedule_node(node, at(5)).unwrap();
        assert_eq!(rt.node_scheduled_time(node), at(2));
    }
}
