//! Time-series cells.
//!
//! Outputs and inputs are stored in arenas on the [`Runtime`] and addressed
//! by [`OutputId`] / [`InputId`]. The protocol (validity, modification,
//! subscription, binding) is implemented as methods on the runtime, split by
//! concern:
//!
//! - `output` / `input`: the protocol shared by every cell kind;
//! - `dict`, `set`, `window`: the dynamic containers and their deltas;
//! - `reference`: reference outputs, observers and rebinding.
//!
//! [`Runtime`]: crate::runtime::Runtime

mod dict;
mod handle;
mod input;
mod output;
mod reference;
mod schema;
mod set;
mod store;
mod subscriber;
mod window;

pub use handle::{ArenaHandle, GraphKey, InputId, OutputId};
pub use schema::{BundleSchema, TsType};
pub use subscriber::SubscriberSet;

pub(crate) use handle::Arena;
pub(crate) use store::{InputCell, OutputCell};

#[cfg(test)]
mod tests;
