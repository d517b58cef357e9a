//! Payloads carried by time-series.
//!
//! - [`Scalar`]: the leaf value of a `TS`, `TSS` item or dict key.
//! - [`TimeSeriesReference`]: the payload of a `REF` time-series.
//! - [`DeltaValue`]: a change set, read from outputs and applied to them.
//! - [`ExternalBridge`]: conversion to and from a host representation.

mod delta;
mod external;
mod reference;
mod scalar;

pub use delta::DeltaValue;
pub use external::{ExternalBridge, JsonBridge};
pub use reference::TimeSeriesReference;
pub use scalar::{ExternalValue, ObjectValue, Scalar};
