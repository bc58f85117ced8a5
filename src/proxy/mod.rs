//! Gopher side of the gateway
//!
//! This module opens connections to the remote Gopher server, frames the
//! selector request, and holds the buffer used to relay its response.

pub mod relay;
pub mod upstream;

pub use relay::RelayBuffer;
pub use upstream::{ConnectError, Upstream};
