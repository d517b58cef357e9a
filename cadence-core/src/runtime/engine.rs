//! The evaluation engine.
//!
//! # Run Loop
//!
//! ```text
//! initialise; start
//! while evaluation_time < end_time and no stop requested:
//!     evaluate the root graph
//!     run after-evaluation callbacks
//!     advance the clock, firing any alarms that came due
//! stop; dispose        (always, even after an error)
//! ```

use smallvec::SmallVec;
use tracing::{debug, error, trace};

use super::{EvaluationLifecycleObserver, EvaluationTrace, PushMessageSender, Runtime, StopHandle};
use crate::config::{EvaluationMode, GraphConfiguration};
use crate::error::{EngineError, Result};
use crate::graph::{GraphBuilder, NodeRef};
use crate::series::GraphKey;

/// Runs one root graph to completion.
pub struct EvaluationEngine {
    rt: Runtime,
    graph: GraphKey,
    config: GraphConfiguration,
}

impl EvaluationEngine {
    pub fn new(builder: &GraphBuilder, config: GraphConfiguration) -> Result<Self> {
        config.validate()?;
        if config.run_mode == EvaluationMode::Simulation && builder.push_source_nodes_end() > 0 {
            return Err(EngineError::Configuration(
                "push source nodes require real-time mode".to_string(),
            ));
        }
        let mut rt = Runtime::new(&config);
        if config.trace {
            rt.add_observer(EvaluationTrace::new());
        }
        let graph = builder.make_instance(&mut rt, SmallVec::new(), None, None)?;
        Ok(Self { rt, graph, config })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    pub fn runtime_mut(&mut self) -> &mut Runtime {
        &mut self.rt
    }

    pub fn graph(&self) -> GraphKey {
        self.graph
    }

    /// The node at `ndx` of the root graph.
    pub fn node(&self, ndx: usize) -> NodeRef {
        NodeRef::new(self.graph, ndx)
    }

    pub fn config(&self) -> &GraphConfiguration {
        &self.config
    }

    pub fn add_observer(&mut self, observer: impl EvaluationLifecycleObserver + 'static) {
        self.rt.add_observer(observer);
    }

    /// A handle for feeding push-source nodes from other threads.
    pub fn push_sender(&self) -> PushMessageSender {
        self.rt.push_sender()
    }

    /// A handle for stopping the run from other threads.
    pub fn stop_handle(&self) -> StopHandle {
        self.rt.stop_handle()
    }

    pub fn request_stop(&self) {
        self.rt.request_stop();
    }

    /// Run from the start time until the end time or a stop request.
    ///
    /// The graph is stopped and disposed whatever happens; the first error
    /// encountered is returned.
    pub fn run(mut self) -> Result<()> {
        debug!(
            mode = ?self.config.run_mode,
            start = %self.config.start_time,
            end = %self.config.end_time,
            "running graph"
        );
        let result = self.run_cycles();
        let stopped = self.rt.stop_graph(self.graph);
        let disposed = self.rt.dispose_graph(self.graph);
        let result = result.and(stopped).and(disposed);
        if let Err(err) = &result {
            error!(error = %err, "graph run failed");
        }
        result
    }

    fn run_cycles(&mut self) -> Result<()> {
        self.rt.initialise_graph(self.graph)?;
        self.rt.start_graph(self.graph)?;
        self.rt.run_after_evaluation()?;
        let end_time = self.config.end_time;
        while self.rt.evaluation_time() < end_time && !self.rt.stop_requested() {
            self.rt.evaluate_graph(self.graph)?;
            self.rt.run_after_evaluation()?;
            self.rt.clock.advance_to_next_scheduled_time()?;
            for (time, name, callback) in self.rt.clock.take_due_alarms() {
                trace!(%time, alarm = %name, "alarm fired");
                callback(&mut self.rt, time)?;
            }
        }
        debug!(time = %self.rt.evaluation_time(), "graph run finished");
        Ok(())
    }
}

/// Build and run a graph.
pub fn evaluate_graph(builder: &GraphBuilder, config: GraphConfiguration) -> Result<()> {
    EvaluationEngine::new(builder, config)?.run()
}
