//! Nested evaluation.
//!
//! A nested graph shares its outer engine's runtime, clock and observers. Its
//! only difference is where scheduling requests go: instead of the engine
//! clock, they narrow a per-graph next time and wake the owning node in the
//! parent graph, which then evaluates the nested graph from its own `eval`.
//!
//! ```text
//! update(t):
//!     if owner.last_evaluation_time >= t or owner is stopping: drop
//!     next = min(next, t)         (a stale next counts as MAX_DT)
//!     parent.schedule_node(owner, next)
//! ```
//!
//! The owner's last evaluation time is stamped before its logic runs, so a
//! request for the current cycle made while the owner evaluates the graph is
//! dropped, while an outer tick arriving before the owner has run still
//! wakes it.

use tracing::trace;

use super::Runtime;
use crate::error::{EngineError, Result};
use crate::graph::{GraphClock, NodeRef};
use crate::series::GraphKey;
use crate::time::{EngineTime, MAX_DT};

/// Scheduling state of a nested graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NestedEngineEvaluationClock {
    owner: NodeRef,
    next_scheduled: EngineTime,
}

impl NestedEngineEvaluationClock {
    pub fn new(owner: NodeRef) -> Self {
        Self {
            owner,
            next_scheduled: MAX_DT,
        }
    }

    /// The node in the parent graph that evaluates this graph.
    pub fn owner(&self) -> NodeRef {
        self.owner
    }

    pub fn next_scheduled_evaluation_time(&self) -> EngineTime {
        self.next_scheduled
    }

    pub(crate) fn reset_next_scheduled_evaluation_time(&mut self) {
        self.next_scheduled = MAX_DT;
    }
}

/// View of the engine from inside a nested graph.
///
/// Time, observers and stop requests are the outer engine's; scheduling
/// goes through the graph's [`NestedEngineEvaluationClock`].
pub struct NestedEvaluationEngine<'a> {
    rt: &'a mut Runtime,
    graph: GraphKey,
}

impl<'a> NestedEvaluationEngine<'a> {
    pub fn graph(&self) -> GraphKey {
        self.graph
    }

    pub fn evaluation_time(&self) -> EngineTime {
        self.rt.evaluation_time()
    }

    pub fn next_scheduled_evaluation_time(&self) -> Result<EngineTime> {
        Ok(self.rt.nested_clock(self.graph)?.next_scheduled_evaluation_time())
    }

    pub fn request_stop(&self) {
        self.rt.request_stop();
    }

    /// Evaluate the graph once and return the next time it wants to run,
    /// `MAX_DT` if none. The nested clock is reset before and after.
    pub fn evaluate(&mut self) -> Result<EngineTime> {
        self.rt.nested_clock_mut(self.graph)?.reset_next_scheduled_evaluation_time();
        self.rt.evaluate_graph(self.graph)?;
        let clock = self.rt.nested_clock_mut(self.graph)?;
        let next = clock.next_scheduled_evaluation_time();
        clock.reset_next_scheduled_evaluation_time();
        trace!(graph = %self.graph, %next, "evaluated nested graph");
        Ok(next)
    }
}

impl Runtime {
    pub fn nested_engine(&mut self, graph: GraphKey) -> NestedEvaluationEngine<'_> {
        NestedEvaluationEngine { rt: self, graph }
    }

    pub(crate) fn nested_clock(&self, graph: GraphKey) -> Result<&NestedEngineEvaluationClock> {
        match &self.graph(graph)?.clock {
            GraphClock::Nested(clock) => Ok(clock),
            GraphClock::Root => Err(EngineError::Configuration(format!("graph {graph} is not nested"))),
        }
    }

    pub(crate) fn nested_clock_mut(&mut self, graph: GraphKey) -> Result<&mut NestedEngineEvaluationClock> {
        match &mut self.graph_mut(graph)?.clock {
            GraphClock::Nested(clock) => Ok(clock),
            GraphClock::Root => Err(EngineError::Configuration(format!("graph {graph} is not nested"))),
        }
    }

    /// Route a scheduling request from a graph to its clock.
    pub(crate) fn update_graph_next_scheduled(&mut self, graph: GraphKey, t: EngineTime) -> Result<()> {
        let nested = match &self.graph(graph)?.clock {
            GraphClock::Root => {
                self.clock.update_next_scheduled_evaluation_time(t);
                return Ok(());
            }
            GraphClock::Nested(clock) => *clock,
        };
        let owner = self.node_record(nested.owner)?;
        let last = owner.last_evaluation_time;
        if (last.is_set() && last >= t) || owner.state.is_stopping() {
            return Ok(());
        }
        let now = self.evaluation_time();
        let current = if nested.next_scheduled < now {
            MAX_DT
        } else {
            nested.next_scheduled
        };
        let next = current.min(t);
        self.nested_clock_mut(graph)?.next_scheduled = next;
        self.schedule_node(nested.owner, next)
    }
}
