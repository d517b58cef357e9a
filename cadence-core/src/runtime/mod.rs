//! Evaluation Runtime
//!
//! The [`Runtime`] owns everything a running graph needs: the arenas of
//! output and input cells, the graph records, the clock, lifecycle
//! observers and the after-evaluation callback list.
//!
//! # Overview
//!
//! There is exactly one runtime per [`EvaluationEngine`]. Nested graphs
//! (map keys, switch branches, reduce trees) share their outer engine's
//! runtime and differ only in the clock they schedule through; see
//! [`NestedEvaluationEngine`].
//!
//! Evaluation is single-threaded. Other threads interact with a running
//! engine only through [`PushMessageSender`] and [`StopHandle`].

mod clock;
mod engine;
mod nested;
mod observer;
mod push;
mod realtime;

pub use clock::{AlarmCallback, BaseEvaluationClock, EvaluationClock, SimulationEvaluationClock};
pub use engine::{evaluate_graph, EvaluationEngine};
pub use nested::{NestedEngineEvaluationClock, NestedEvaluationEngine};
pub use observer::{EvaluationLifecycleObserver, EvaluationTrace};
pub use push::{PushMessage, PushMessageSender, PushSignal, StopHandle};
pub use realtime::RealTimeEvaluationClock;

use std::collections::HashMap;
use std::sync::Arc;

use push::PushQueue;

use crate::config::{EvaluationMode, GraphConfiguration};
use crate::error::Result;
use crate::graph::GraphRecord;
use crate::nodes::MeshContext;
use crate::series::{Arena, GraphKey, InputCell, InputId, OutputCell, OutputId};
use crate::time::{EngineTime, EngineTimeDelta};

type AfterEvaluation = Box<dyn FnOnce(&mut Runtime) -> Result<()> + Send>;

/// Cells, graphs and clock of one engine.
pub struct Runtime {
    pub(crate) outputs: Arena<OutputId, OutputCell>,
    pub(crate) inputs: Arena<InputId, InputCell>,
    pub(crate) graphs: Arena<GraphKey, GraphRecord>,
    pub(crate) clock: Box<dyn EvaluationClock>,
    observers: Vec<Box<dyn EvaluationLifecycleObserver>>,
    after_evaluation: Vec<AfterEvaluation>,
    /// Shared mesh contexts, by name.
    pub(crate) mesh_contexts: HashMap<String, MeshContext>,
    pub(crate) trace_back_depth: usize,
    pub(crate) capture_values: bool,
    signal: Arc<PushSignal>,
    pub(crate) push_queue: PushQueue,
}

impl Runtime {
    /// A runtime with the clock selected by `config.run_mode`.
    pub fn new(config: &GraphConfiguration) -> Self {
        let signal = Arc::new(PushSignal::new());
        let clock: Box<dyn EvaluationClock> = match config.run_mode {
            EvaluationMode::Simulation => Box::new(SimulationEvaluationClock::new(config.start_time)),
            EvaluationMode::RealTime => Box::new(RealTimeEvaluationClock::new(
                config.start_time,
                config.end_time,
                signal.clone(),
            )),
        };
        Self {
            outputs: Arena::new(),
            inputs: Arena::new(),
            graphs: Arena::new(),
            clock,
            observers: Vec::new(),
            after_evaluation: Vec::new(),
            mesh_contexts: HashMap::new(),
            trace_back_depth: config.trace_back_depth,
            capture_values: config.capture_values,
            signal,
            push_queue: PushQueue::default(),
        }
    }

    pub fn evaluation_time(&self) -> EngineTime {
        self.clock.evaluation_time()
    }

    /// The clock's notion of "now": the evaluation time in simulation, the
    /// wall clock in real time.
    pub fn now(&self) -> EngineTime {
        self.clock.now()
    }

    pub fn cycle_time(&self) -> EngineTimeDelta {
        self.clock.cycle_time()
    }

    pub fn clock(&self) -> &dyn EvaluationClock {
        self.clock.as_ref()
    }

    pub(crate) fn clock_mut(&mut self) -> &mut dyn EvaluationClock {
        self.clock.as_mut()
    }

    pub fn add_observer(&mut self, observer: impl EvaluationLifecycleObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Run `f` once the current cycle's evaluation pass completes.
    pub fn add_after_evaluation_notification(
        &mut self,
        f: impl FnOnce(&mut Runtime) -> Result<()> + Send + 'static,
    ) {
        self.after_evaluation.push(Box::new(f));
    }

    /// Drain the after-evaluation callbacks, including any they register.
    pub(crate) fn run_after_evaluation(&mut self) -> Result<()> {
        while !self.after_evaluation.is_empty() {
            for callback in std::mem::take(&mut self.after_evaluation) {
                callback(self)?;
            }
        }
        Ok(())
    }

    /// Ask the engine to stop after the current cycle.
    pub fn request_stop(&self) {
        self.signal.request_stop();
    }

    pub fn stop_requested(&self) -> bool {
        self.signal.stop_requested()
    }

    pub fn push_sender(&self) -> PushMessageSender {
        PushMessageSender::new(self.push_queue.clone(), self.signal.clone())
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.signal.clone())
    }

    pub(crate) fn with_observers(&mut self, f: impl Fn(&mut dyn EvaluationLifecycleObserver, &Runtime)) {
        if self.observers.is_empty() {
            return;
        }
        let mut observers = std::mem::take(&mut self.observers);
        for observer in observers.iter_mut() {
            f(observer.as_mut(), self);
        }
        observers.append(&mut self.observers);
        self.observers = observers;
    }
}

#[cfg(test)]
impl Runtime {
    /// A bare simulation runtime at `t`, for exercising cells directly.
    pub(crate) fn for_tests(t: EngineTime) -> Self {
        Self::new(&GraphConfiguration::simulation(t, crate::time::MAX_ET))
    }

    pub(crate) fn set_test_time(&mut self, t: EngineTime) {
        self.clock.set_evaluation_time(t);
    }

    fn test_node() -> crate::graph::NodeRef {
        use crate::series::ArenaHandle;
        crate::graph::NodeRef::new(GraphKey::from_parts(u32::MAX, 0), 0)
    }

    /// A free-standing output with no owning graph.
    pub(crate) fn test_output(&mut self, tp: &crate::series::TsType) -> OutputId {
        self.create_output(Self::test_node(), None, tp)
            .expect("valid test output type")
    }

    pub(crate) fn test_input(&mut self, tp: &crate::series::TsType) -> InputId {
        self.create_input(Self::test_node(), None, tp)
            .expect("valid test input type")
    }
}
