//! Run configuration.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::time::{EngineTime, MAX_ET, MIN_ST};

/// How the engine advances time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationMode {
    /// Time jumps straight to the next scheduled event.
    #[default]
    Simulation,
    /// Time follows the wall clock; push sources are supported.
    RealTime,
}

/// Parameters of a single graph run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfiguration {
    pub run_mode: EvaluationMode,
    pub start_time: EngineTime,
    /// Exclusive: the run stops once evaluation time reaches it.
    pub end_time: EngineTime,
    /// Emit a tracing event for every lifecycle hook.
    pub trace: bool,
    /// How many upstream levels a node error back trace walks.
    pub trace_back_depth: usize,
    /// Render input values into node error back traces.
    pub capture_values: bool,
}

impl Default for GraphConfiguration {
    fn default() -> Self {
        Self {
            run_mode: EvaluationMode::Simulation,
            start_time: MIN_ST,
            end_time: MAX_ET,
            trace: false,
            trace_back_depth: 1,
            capture_values: false,
        }
    }
}

impl GraphConfiguration {
    pub fn new(run_mode: EvaluationMode, start_time: EngineTime, end_time: EngineTime) -> Self {
        Self {
            run_mode,
            start_time,
            end_time,
            ..Self::default()
        }
    }

    pub fn simulation(start_time: EngineTime, end_time: EngineTime) -> Self {
        Self::new(EvaluationMode::Simulation, start_time, end_time)
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the time window is usable.
    pub fn validate(&self) -> Result<()> {
        if self.start_time < MIN_ST {
            return Err(EngineError::Configuration(format!(
                "start time {} is before the earliest start time {}",
                self.start_time, MIN_ST
            )));
        }
        if self.end_time <= self.start_time {
            return Err(EngineError::Configuration(format!(
                "end time {} must be after start time {}",
                self.end_time, self.start_time
            )));
        }
        if self.end_time > MAX_ET {
            return Err(EngineError::Configuration(format!(
                "end time {} is after the latest end time {}",
                self.end_time, MAX_ET
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_with_defaults() {
        let config = GraphConfiguration::from_json(
            r#"{"run_mode": "REAL_TIME", "start_time": 10, "end_time": 20}"#,
        )
        .unwrap();
        assert_eq!(config.run_mode, EvaluationMode::RealTime);
        assert_eq!(config.start_time, EngineTime::from_micros(10));
        assert_eq!(config.trace_back_depth, 1);
        assert!(!config.trace);
    }

    #[test]
    fn end_must_follow_start() {
        let config = GraphConfiguration::simulation(EngineTime::from_micros(5), EngineTime::from_micros(5));
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn start_must_not_precede_min_st() {
        let json = r#"{"start_time": 0, "end_time": 20}"#;
        assert!(GraphConfiguration::from_json(json).is_err());
    }
}
