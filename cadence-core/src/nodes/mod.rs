//! Node Library
//!
//! Ready-made node builders. Closure-backed compute, sink and source nodes
//! cover most graphs; the rest are the higher-order nodes that run nested
//! graphs:
//!
//! - [`map_node`]: one nested graph per key of a dict input
//! - [`reduce_node`]: a balanced tree of binary operations over a dict
//! - [`switch_node`]: one nested graph chosen by a key input
//! - [`mesh_node`]: keyed graphs that may depend on each other's results
//! - [`try_except_node`]: a nested graph whose failures become values
//!
//! Nested graphs are described by a [`NestedGraph`]: a builder plus the
//! stub nodes that stand in for the outer inputs and output.

mod function;
mod map;
mod mesh;
mod nested;
mod reduce;
mod stubs;
mod switch;
mod try_except;

pub use function::{
    compute_node, compute_node_with, push_source, record_sink, recorded_replay_source, replay_source, sink_node,
    FnNode, Recording,
};
pub use map::{map_node, MapSpec, KEYS_ARG};
pub use mesh::{mesh_lookup, mesh_node};
pub use nested::NestedGraph;
pub use reduce::reduce_node;
pub use stubs::{key_stub, reference_stub, STUB_INPUT};
pub use switch::{switch_node, SwitchSpec, SWITCH_KEY};
pub use try_except::{try_except_node, EXCEPTION_FIELD, OUT_FIELD};

pub(crate) use mesh::MeshContext;
