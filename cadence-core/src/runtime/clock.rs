//! Evaluation Clocks
//!
//! A clock owns the engine's notion of "now" for graph purposes: the
//! evaluation time of the current cycle, and the earliest time anything has
//! asked to be evaluated at next.
//!
//! # Scheduling Law
//!
//! Requests narrow the pending wake time monotonically:
//!
//! ```text
//! next = max(next_cycle_evaluation_time, min(next, t))
//! ```
//!
//! so a request can never pull the next cycle earlier than one tick past the
//! current evaluation time, and a later request never pushes back an earlier
//! one. A request for the current evaluation time is already covered by the
//! cycle in progress and is ignored.

use std::time::Instant;

use crate::error::{EngineError, Result};
use crate::runtime::Runtime;
use crate::time::{EngineTime, EngineTimeDelta, MAX_DT, MIN_TD};

/// Callback fired when a real-time alarm comes due.
pub type AlarmCallback = Box<dyn FnOnce(&mut Runtime, EngineTime) -> Result<()> + Send>;

/// The time source driving an engine.
pub trait EvaluationClock: Send {
    /// The time of the cycle in progress.
    fn evaluation_time(&self) -> EngineTime;

    fn set_evaluation_time(&mut self, t: EngineTime);

    /// The time according to this clock's notion of "now".
    fn now(&self) -> EngineTime;

    /// Wall-clock time spent in the current cycle so far.
    fn cycle_time(&self) -> EngineTimeDelta;

    fn next_cycle_evaluation_time(&self) -> EngineTime {
        self.evaluation_time() + MIN_TD
    }

    fn next_scheduled_evaluation_time(&self) -> EngineTime;

    fn update_next_scheduled_evaluation_time(&mut self, t: EngineTime);

    /// Move to the next cycle, blocking if the clock follows the wall clock.
    fn advance_to_next_scheduled_time(&mut self) -> Result<()>;

    fn mark_push_node_requires_scheduling(&mut self) {}

    fn push_node_requires_scheduling(&self) -> bool {
        false
    }

    fn reset_push_node_requires_scheduling(&mut self) {}

    /// Register a named wake-up at `time`, replacing any alarm of that name.
    fn set_alarm(&mut self, time: EngineTime, name: String, callback: AlarmCallback) -> Result<()> {
        let _ = (time, name, callback);
        Err(EngineError::Configuration(
            "alarms require a real-time clock".to_string(),
        ))
    }

    fn cancel_alarm(&mut self, name: &str) {
        let _ = name;
    }

    /// Remove and return alarms due at or before the evaluation time.
    fn take_due_alarms(&mut self) -> Vec<(EngineTime, String, AlarmCallback)> {
        Vec::new()
    }
}

/// State and scheduling law shared by the concrete clocks.
#[derive(Debug, Clone)]
pub struct BaseEvaluationClock {
    evaluation_time: EngineTime,
    next_scheduled_evaluation_time: EngineTime,
    cycle_start: Instant,
}

impl BaseEvaluationClock {
    pub fn new(start_time: EngineTime) -> Self {
        Self {
            evaluation_time: start_time,
            next_scheduled_evaluation_time: MAX_DT,
            cycle_start: Instant::now(),
        }
    }

    pub fn evaluation_time(&self) -> EngineTime {
        self.evaluation_time
    }

    pub fn set_evaluation_time(&mut self, t: EngineTime) {
        self.evaluation_time = t;
        self.cycle_start = Instant::now();
    }

    pub fn next_cycle_evaluation_time(&self) -> EngineTime {
        self.evaluation_time + MIN_TD
    }

    pub fn next_scheduled_evaluation_time(&self) -> EngineTime {
        self.next_scheduled_evaluation_time
    }

    pub fn update_next_scheduled_evaluation_time(&mut self, t: EngineTime) {
        if t == self.evaluation_time {
            return;
        }
        self.next_scheduled_evaluation_time = self
            .next_scheduled_evaluation_time
            .min(t)
            .max(self.next_cycle_evaluation_time());
    }

    pub(crate) fn reset_next_scheduled_evaluation_time(&mut self) {
        self.next_scheduled_evaluation_time = MAX_DT;
    }

    pub fn cycle_time(&self) -> EngineTimeDelta {
        self.cycle_start.elapsed().into()
    }
}

/// Simulated time: every advance jumps straight to the next scheduled time.
#[derive(Debug, Clone)]
pub struct SimulationEvaluationClock {
    base: BaseEvaluationClock,
}

impl SimulationEvaluationClock {
    pub fn new(start_time: EngineTime) -> Self {
        Self {
            base: BaseEvaluationClock::new(start_time),
        }
    }
}

impl EvaluationClock for SimulationEvaluationClock {
    fn evaluation_time(&self) -> EngineTime {
        self.base.evaluation_time()
    }

    fn set_evaluation_time(&mut self, t: EngineTime) {
        self.base.set_evaluation_time(t);
    }

    fn now(&self) -> EngineTime {
        self.base.evaluation_time()
    }

    fn cycle_time(&self) -> EngineTimeDelta {
        self.base.cycle_time()
    }

    fn next_scheduled_evaluation_time(&self) -> EngineTime {
        self.base.next_scheduled_evaluation_time()
    }

    fn update_next_scheduled_evaluation_time(&mut self, t: EngineTime) {
        self.base.update_next_scheduled_evaluation_time(t);
    }

    fn advance_to_next_scheduled_time(&mut self) -> Result<()> {
        let next = self
            .base
            .next_scheduled_evaluation_time()
            .max(self.base.next_cycle_evaluation_time());
        self.base.set_evaluation_time(next);
        self.base.reset_next_scheduled_evaluation_time();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> EngineTime {
        EngineTime::from_secs(secs)
    }

    #[test]
    fn scheduling_only_narrows() {
        let mut clock = SimulationEvaluationClock::new(t(1));
        clock.update_next_scheduled_evaluation_time(t(5));
        clock.update_next_scheduled_evaluation_time(t(3));
        clock.update_next_scheduled_evaluation_time(t(4));
        assert_eq!(clock.next_scheduled_evaluation_time(), t(3));
    }

    #[test]
    fn scheduling_never_precedes_next_cycle() {
        let mut clock = SimulationEvaluationClock::new(t(1));
        clock.update_next_scheduled_evaluation_time(t(1) - MIN_TD);
        assert_eq!(clock.next_scheduled_evaluation_time(), clock.next_cycle_evaluation_time());
    }

    #[test]
    fn request_for_current_cycle_is_ignored() {
        let mut clock = SimulationEvaluationClock::new(t(1));
        clock.update_next_scheduled_evaluation_time(t(1));
        assert_eq!(clock.next_scheduled_evaluation_time(), MAX_DT);
    }

    #[test]
    fn monotone_narrowing_law_holds_for_any_sequence() {
        let proposals = [9, 4, 7, 2, 2, 8, 3];
        let mut clock = SimulationEvaluationClock::new(t(1));
        for p in proposals {
            clock.update_next_scheduled_evaluation_time(t(p));
        }
        let min = proposals.iter().copied().map(t).min().unwrap_or(MAX_DT);
        let next = clock.next_scheduled_evaluation_time();
        assert!(next <= min);
        assert!(next > clock.evaluation_time());
    }

    #[test]
    fn advance_jumps_to_next_scheduled_time() {
        let mut clock = SimulationEvaluationClock::new(t(1));
        clock.update_next_scheduled_evaluation_time(t(10));
        clock.advance_to_next_scheduled_time().unwrap();
        assert_eq!(clock.evaluation_time(), t(10));
        assert_eq!(clock.now(), t(10));
        assert_eq!(clock.next_scheduled_evaluation_time(), MAX_DT);

        clock.advance_to_next_scheduled_time().unwrap();
        assert_eq!(clock.evaluation_time(), MAX_DT);
    }

    #[test]
    fn alarms_need_real_time() {
        let mut clock = SimulationEvaluationClock::new(t(1));
        let result = clock.set_alarm(t(2), "a".into(), Box::new(|_, _| Ok(())));
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }
}
