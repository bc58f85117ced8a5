//! Idigna - HTTP to Gopher gateway
//!
//! Accepts `GET <path>` requests, sends `<path>` as a selector to a Gopher
//! server and copies the raw reply back to the client.

pub mod config;
pub mod http;
pub mod proxy;
pub mod server;
