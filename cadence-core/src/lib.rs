//! Cadence Core
//!
//! This crate provides a push/pull dataflow engine for time-series graphs.
//! It implements:
//!
//! - The time-series protocol (scalar, bundle, list, dict, set, window and
//!   reference series) with per-cycle change tracking
//! - Graphs of nodes scheduled by evaluation time
//! - Simulation and real-time clocks, plus nested clocks for sub-graphs
//! - Higher-order nodes: map, reduce, switch, mesh and try-except
//!
//! The crate is designed to be used both as a native Rust library and as a
//! Python extension module via PyO3 (feature `python`).
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `value`: scalar values, deltas and references
//! - `series`: time-series cells and the protocol over them
//! - `graph`: nodes, graphs, builders and the node scheduler
//! - `runtime`: clocks, the evaluation engine and push messages
//! - `nodes`: ready-made node builders
//!
//! # Example
//!
//! ```rust,ignore
//! use cadence_core::prelude::*;
//!
//! let mut graph = GraphBuilder::new();
//! let src = graph.add_node(replay_source("src", TsType::Value, ticks));
//! let (sink, recording) = record_sink("out", TsType::Value);
//! let sink = graph.add_node(sink);
//! graph.connect(src, sink, "ts")?;
//!
//! let config = GraphConfiguration::simulation(start, end);
//! evaluate_graph(&graph, config)?;
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod lifecycle;
pub mod nodes;
pub mod runtime;
pub mod series;
pub mod time;
pub mod value;

#[cfg(feature = "python")]
mod python;

/// The types most graphs need.
pub mod prelude {
    pub use crate::config::{EvaluationMode, GraphConfiguration};
    pub use crate::error::{EngineError, NodeError, Result};
    pub use crate::graph::{GraphBuilder, NodeBuilder, NodeContext, NodeKind, NodeLogic, NodeRef, NodeSignature};
    pub use crate::nodes::*;
    pub use crate::runtime::{evaluate_graph, EvaluationEngine, Runtime, StopHandle};
    pub use crate::series::TsType;
    pub use crate::time::{EngineTime, EngineTimeDelta, MAX_ET, MIN_ST, MIN_TD};
    pub use crate::value::{DeltaValue, Scalar, TimeSeriesReference};
}
