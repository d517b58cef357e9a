//! Wall-clock time.
//!
//! Between cycles the real-time clock sleeps until the earliest of: the next
//! scheduled time, the next alarm, the end of the run, or a push/stop signal.
//! Evaluation time then becomes the wall clock, never less than one tick
//! past the previous cycle.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::clock::{AlarmCallback, BaseEvaluationClock, EvaluationClock};
use super::push::PushSignal;
use crate::error::{EngineError, Result};
use crate::time::{EngineTime, EngineTimeDelta, MAX_DT};

/// Longest single wait, so that a missed wake-up only costs this much.
const MAX_WAIT: Duration = Duration::from_millis(250);

pub struct RealTimeEvaluationClock {
    base: BaseEvaluationClock,
    signal: Arc<PushSignal>,
    end_time: EngineTime,
    alarms: BTreeMap<(EngineTime, String), AlarmCallback>,
    alarm_times: HashMap<String, EngineTime>,
}

impl RealTimeEvaluationClock {
    pub fn new(start_time: EngineTime, end_time: EngineTime, signal: Arc<PushSignal>) -> Self {
        Self {
            base: BaseEvaluationClock::new(start_time),
            signal,
            end_time,
            alarms: BTreeMap::new(),
            alarm_times: HashMap::new(),
        }
    }

    fn next_alarm_time(&self) -> EngineTime {
        self.alarms
            .keys()
            .next()
            .map_or(MAX_DT, |(time, _)| *time)
    }
}

impl EvaluationClock for RealTimeEvaluationClock {
    fn evaluation_time(&self) -> EngineTime {
        self.base.evaluation_time()
    }

    fn set_evaluation_time(&mut self, t: EngineTime) {
        self.base.set_evaluation_time(t);
    }

    fn now(&self) -> EngineTime {
        EngineTime::now()
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
            .min(self.next_alarm_time());
        let deadline = next.min(self.end_time);
        loop {
            let now = EngineTime::now();
            if now >= deadline {
                break;
            }
            let wait = (deadline - now).to_duration().min(MAX_WAIT);
            if self.signal.wait(wait) {
                break;
            }
        }
        let now = EngineTime::now();
        let evaluation_time = self
            .base
            .next_cycle_evaluation_time()
            .max(now.min(next));
        self.base.set_evaluation_time(evaluation_time);
        self.base.reset_next_scheduled_evaluation_time();
        Ok(())
    }

    fn mark_push_node_requires_scheduling(&mut self) {
        self.signal.mark_push_pending();
    }

    fn push_node_requires_scheduling(&self) -> bool {
        self.signal.push_pending()
    }

    fn reset_push_node_requires_scheduling(&mut self) {
        self.signal.reset_push_pending();
    }

    fn set_alarm(&mut self, time: EngineTime, name: String, callback: AlarmCallback) -> Result<()> {
        if time <= self.base.evaluation_time() {
            return Err(EngineError::scheduling(format!(
                "alarm `{name}` at {time} is not after the evaluation time {}",
                self.base.evaluation_time()
            )));
        }
        self.cancel_alarm(&name);
        debug!(%time, alarm = %name, "alarm set");
        self.alarm_times.insert(name.clone(), time);
        self.alarms.insert((time, name), callback);
        Ok(())
    }

    fn cancel_alarm(&mut self, name: &str) {
        if let Some(time) = self.alarm_times.remove(name) {
            self.alarms.remove(&(time, name.to_string()));
        }
    }

    fn take_due_alarms(&mut self) -> Vec<(EngineTime, String, AlarmCallback)> {
        let now = self.base.evaluation_time();
        let mut due = Vec::new();
        while let Some(entry) = self.alarms.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((time, name), callback) = entry.remove_entry();
            self.alarm_times.remove(&name);
            due.push((time, name, callback));
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_returns_at_the_end_time_when_idle() {
        let start = EngineTime::now();
        let end = start + EngineTimeDelta::from_millis(20);
        let mut clock = RealTimeEvaluationClock::new(start, end, Arc::new(PushSignal::new()));
        clock.advance_to_next_scheduled_time().unwrap();
        assert!(clock.evaluation_time() > start);
        assert!(EngineTime::now() >= end);
    }

    #[test]
    fn push_wakes_the_clock_early() {
        let start = EngineTime::now();
        let end = start + EngineTimeDelta::from_secs(30);
        let signal = Arc::new(PushSignal::new());
        let mut clock = RealTimeEvaluationClock::new(start, end, signal.clone());
        signal.mark_push_pending();
        clock.advance_to_next_scheduled_time().unwrap();
        assert!(clock.push_node_requires_scheduling());
        assert!(clock.evaluation_time() < end);
    }

    #[test]
    fn alarms_fire_in_time_order_and_can_be_cancelled() {
        let start = EngineTime::from_secs(100);
        let mut clock =
            RealTimeEvaluationClock::new(start, MAX_DT, Arc::new(PushSignal::new()));
        for (secs, name) in [(3, "c"), (1, "a"), (2, "b")] {
            clock
                .set_alarm(start + EngineTimeDelta::from_secs(secs), name.into(), Box::new(|_, _| Ok(())))
                .unwrap();
        }
        clock.cancel_alarm("b");
        clock.set_evaluation_time(start + EngineTimeDelta::from_secs(5));
        let names: Vec<String> = clock.take_due_alarms().into_iter().map(|(_, n, _)| n).collect();
        assert_eq!(names, vec!["a".to_string(), "c".to_string()]);
        assert!(clock.take_due_alarms().is_empty());
    }

    #[test]
    fn alarms_must_be_in_the_future() {
        let start = EngineTime::from_secs(100);
        let mut clock =
            RealTimeEvaluationClock::new(start, MAX_DT, Arc::new(PushSignal::new()));
        assert!(clock.set_alarm(start, "now".into(), Box::new(|_, _| Ok(()))).is_err());
    }
}
