//! Galaxy Buds protocol implementation.
//!
//! Framing, parsing, telemetry tracking and device recognition for the
//! earbuds side of the bridge.

pub mod parser;
pub mod protocol;
pub mod recognition;
pub mod telemetry;
