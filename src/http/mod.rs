//! HTTP side of the gateway.
//!
//! Only as much HTTP is understood as is needed to find the Gopher selector:
//! the request must start with `GET `, the path runs up to the next space,
//! and the request ends at the first blank line. Headers are skipped unread.
//!
//! # Architecture
//!
//! - **`parser`**: Incremental capture of the request line and the header terminator
//! - **`connection`**: The per-client state machine driving capture, remote request and relay
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │    Start    │ ← Wait for "GET "
//!        └──────┬──────┘
//!               ▼
//!        ┌─────────────┐
//!        │    Path     │ ← Collect bytes up to the first space
//!        └──────┬──────┘
//!               ▼
//!        ┌─────────────┐
//!        │ RequestEnd  │ ← Slide a 4-byte window until "\r\n\r\n"
//!        └──────┬──────┘
//!               ▼
//!        ┌─────────────┐
//!        │   Connect   │ ← Open the remote; it becomes the active socket
//!        └──────┬──────┘
//!               ▼
//!        ┌──────────────┐
//!        │ RequestWrite │ ← Send "<path>\r\n"
//!        └──────┬───────┘
//!               ▼
//!        ┌─────────────┐   chunk read    ┌─────────────┐
//!        │    Read     │ ──────────────▶ │    Write    │
//!        │  (remote)   │ ◀────────────── │  (client)   │
//!        └──────┬──────┘  chunk written  └─────────────┘
//!               │ EOF or error on either side
//!               ▼
//!            closed
//! ```
//!
//! The relay is half-duplex: one chunk is read completely and written
//! completely before the next read, and only one socket is watched at a time.

pub mod connection;
pub mod parser;
