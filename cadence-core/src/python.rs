//! Python bindings.
//!
//! Values cross the boundary as JSON: [`PyBridge`] renders engine values
//! with [`JsonBridge`] and hands them to Python's `json` module, and the
//! reverse for values coming in.

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::config::{EvaluationMode, GraphConfiguration};
use crate::error::{EngineError, Result};
use crate::series::TsType;
use crate::value::{DeltaValue, ExternalBridge, JsonBridge};

fn to_py_err(err: EngineError) -> PyErr {
    PyValueError::new_err(err.to_string())
}

fn from_py_err(err: PyErr) -> EngineError {
    EngineError::evaluation(err.to_string())
}

/// Converts engine values to and from Python objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct PyBridge {
    json: JsonBridge,
}

impl ExternalBridge for PyBridge {
    type Value = Py<PyAny>;

    fn to_external(&self, value: &DeltaValue, tp: &TsType) -> Result<Py<PyAny>> {
        let text = serde_json::to_string(&self.json.to_external(value, tp)?)?;
        Python::with_gil(|py| {
            let json = py.import_bound("json")?;
            Ok(json.call_method1("loads", (text,))?.unbind())
        })
        .map_err(from_py_err)
    }

    fn from_external(&self, value: &Py<PyAny>, tp: &TsType) -> Result<DeltaValue> {
        let text: String = Python::with_gil(|py| {
            let json = py.import_bound("json")?;
            json.call_method1("dumps", (value.bind(py),))?.extract()
        })
        .map_err(from_py_err)?;
        self.json.from_external(&serde_json::from_str(&text)?, tp)
    }
}

/// A validated run configuration.
#[pyclass(name = "GraphConfiguration")]
#[derive(Clone)]
pub struct PyGraphConfiguration {
    inner: GraphConfiguration,
}

#[pymethods]
impl PyGraphConfiguration {
    #[staticmethod]
    fn from_json(json: &str) -> PyResult<Self> {
        GraphConfiguration::from_json(json)
            .map(|inner| Self { inner })
            .map_err(to_py_err)
    }

    fn to_json(&self) -> PyResult<String> {
        serde_json::to_string(&self.inner).map_err(|err| to_py_err(err.into()))
    }

    #[getter]
    fn real_time(&self) -> bool {
        self.inner.run_mode == EvaluationMode::RealTime
    }

    /// Start time in microseconds since the epoch.
    #[getter]
    fn start_time(&self) -> i64 {
        self.inner.start_time.micros()
    }

    /// End time in microseconds since the epoch.
    #[getter]
    fn end_time(&self) -> i64 {
        self.inner.end_time.micros()
    }

    fn __repr__(&self) -> String {
        format!(
            "GraphConfiguration(run_mode={:?}, start_time={}, end_time={})",
            self.inner.run_mode, self.inner.start_time, self.inner.end_time
        )
    }
}

#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyGraphConfiguration>()?;
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    Ok(())
}
