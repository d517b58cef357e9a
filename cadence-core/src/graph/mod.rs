//! Nodes and Graphs
//!
//! This module implements the unit of computation (the node), its
//! container (the graph) and the builders that produce both.
//!
//! # Overview
//!
//! A graph is a topologically ordered list of nodes. Each node owns an input
//! bundle, an optional output, and a schedule slot in its graph. When an
//! output ticks, every active input bound to it schedules its node for the
//! current evaluation time; the graph then evaluates the due nodes in index
//! order, which is always a valid dependency order.
//!
//! # Design Decisions
//!
//! 1. Graph and node state lives in the runtime's arenas and is addressed by
//!    [`NodeRef`] and [`GraphKey`](crate::series::GraphKey), so nested graphs
//!    can be created and dropped while their owner evaluates.
//!
//! 2. Node logic is a trait object taken out of its record while it runs,
//!    leaving the runtime free to be borrowed mutably by the logic.
//!
//! 3. Builders are plain data and can be instantiated many times.

mod backtrace;
mod builder;
mod node;
mod record;
mod scheduler;
mod signature;

pub use builder::{Edge, GraphBuilder, LogicFactory, NodeBuilder};
pub use node::{NodeContext, NodeLogic, NodeRef};
pub use scheduler::{NodeScheduler, SchedulerHandle};
pub use signature::{NodeKind, NodeSignature};

pub(crate) use node::NodeRecord;
pub(crate) use record::{GraphClock, GraphRecord};

/// Output path marker selecting a node's error output.
pub const ERROR_PATH: i64 = -1;
/// Output path marker selecting a node's recordable state.
pub const STATE_PATH: i64 = -2;
/// Path element selecting a dict's key set.
pub const KEY_SET_ID: i64 = -3;
