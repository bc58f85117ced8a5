//! Listening sockets, socket and connection tables, and the event loop.

pub mod connections;
pub mod gateway;
pub mod listener;
pub mod sockets;

pub use gateway::{Gateway, ShutdownHandle};
