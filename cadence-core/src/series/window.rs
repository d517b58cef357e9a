//! Fixed-size windows (`TSW`).

use super::handle::{InputId, OutputId};
use super::store::{OutputData, WindowOutputState};
use crate::error::{EngineError, Result};
use crate::runtime::Runtime;
use crate::time::EngineTime;
use crate::value::Scalar;

impl Runtime {
    fn window_state(&self, id: OutputId) -> Option<&WindowOutputState> {
        match &self.outputs.get(id)?.data {
            OutputData::Window(state) => Some(state),
            _ => None,
        }
    }

    /// Append a value at the current time, evicting the oldest entry when full.
    ///
    /// A window takes at most one value per cycle, so the evicted entry of a
    /// cycle is unambiguous.
    pub fn window_push(&mut self, id: OutputId, value: Scalar) -> Result<()> {
        let now = self.evaluation_time();
        let OutputData::Window(state) = &mut self.output_cell_mut(id)?.data else {
            return Err(EngineError::TypeMismatch {
                expected: "TSW",
                found: "scalar",
            });
        };
        if state.buffer.back().is_some_and(|(_, t)| *t == now) {
            return Err(EngineError::scheduling(format!("window {id} already ticked at {now}")));
        }
        state.buffer.push_back((value, now));
        let mut schedule = false;
        if state.buffer.len() > state.size {
            state.removed = state.buffer.pop_front();
            schedule = !state.cleanup_scheduled;
            state.cleanup_scheduled = true;
        }
        if schedule {
            self.add_after_evaluation_notification(move |rt| {
                if let Some(OutputData::Window(state)) = rt.outputs.get_mut(id).map(|c| &mut c.data) {
                    state.removed = None;
                    state.cleanup_scheduled = false;
                }
                Ok(())
            });
        }
        self.mark_modified(id)
    }

    /// Buffered values, oldest first.
    pub fn window_values(&self, id: OutputId) -> Vec<Scalar> {
        self.window_state(id)
            .map(|state| state.buffer.iter().map(|(v, _)| v.clone()).collect())
            .unwrap_or_default()
    }

    pub fn window_times(&self, id: OutputId) -> Vec<EngineTime> {
        self.window_state(id)
            .map(|state| state.buffer.iter().map(|(_, t)| *t).collect())
            .unwrap_or_default()
    }

    pub fn window_len(&self, id: OutputId) -> usize {
        self.window_state(id).map_or(0, |state| state.buffer.len())
    }

    /// `(size, min_size)`.
    pub fn window_bounds(&self, id: OutputId) -> Option<(usize, usize)> {
        self.window_state(id).map(|state| (state.size, state.min_size))
    }

    /// The entry evicted in the current cycle, if any.
    pub fn window_removed_value(&self, id: OutputId) -> Option<(Scalar, EngineTime)> {
        self.window_state(id)?.removed.clone()
    }

    pub fn input_window_values(&self, input: InputId) -> Vec<Scalar> {
        self.input_output(input)
            .map(|output| self.window_values(output))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use crate::error::EngineError;
    use crate::runtime::Runtime;
    use crate::series::TsType;
    use crate::time::EngineTime;
    use crate::value::{DeltaValue, Scalar};

    #[test]
    fn eviction_is_visible_for_one_cycle() {
        let mut rt = Runtime::for_tests(EngineTime::from_secs(1));
        let window = rt.test_output(&TsType::window(2, 2));
        rt.window_push(window, Scalar::from(1)).unwrap();
        assert!(!rt.output_all_valid(window));

        rt.set_test_time(EngineTime::from_secs(2));
        rt.window_push(window, Scalar::from(2)).unwrap();
        assert!(rt.output_all_valid(window));
        assert!(rt.window_removed_value(window).is_none());

        rt.set_test_time(EngineTime::from_secs(3));
        rt.window_push(window, Scalar::from(3)).unwrap();
        assert_eq!(rt.window_len(window), 2);
        assert_eq!(
            rt.window_removed_value(window),
            Some((Scalar::from(1), EngineTime::from_secs(1)))
        );
        assert_eq!(rt.window_values(window), vec![Scalar::from(2), Scalar::from(3)]);
        assert_eq!(
            rt.window_times(window),
            vec![EngineTime::from_secs(2), EngineTime::from_secs(3)]
        );

        rt.run_after_evaluation().unwrap();
        assert!(rt.window_removed_value(window).is_none());
    }

    #[test]
    fn second_push_in_a_cycle_is_rejected() {
        let mut rt = Runtime::for_tests(EngineTime::from_secs(1));
        let window = rt.test_output(&TsType::window(1, 1));
        rt.window_push(window, Scalar::from(1)).unwrap();

        rt.set_test_time(EngineTime::from_secs(2));
        let several = DeltaValue::List(vec![
            (0, DeltaValue::from(2)),
            (1, DeltaValue::from(3)),
        ]);
        let err = rt.apply_result(window, several).unwrap_err();
        assert!(matches!(err, EngineError::Scheduling(_)));
        assert_eq!(rt.window_values(window), vec![Scalar::from(2)]);
        assert_eq!(
            rt.window_removed_value(window),
            Some((Scalar::from(1), EngineTime::from_secs(1)))
        );
    }
}
