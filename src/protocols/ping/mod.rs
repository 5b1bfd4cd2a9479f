//! Ping protocol.
//!
//! A minimal line protocol for health checks and latency measurement. It
//! exercises the runtime without any application state.
//!
//! ```text
//! Request:  PING\r\n
//! Response: PONG\r\n
//!
//! Request:  PING hello\r\n
//! Response: PONG hello\r\n
//!
//! Request:  QUIT\r\n
//! Response: OK\r\n        (then the server closes)
//! ```
//!
//! Commands are case-insensitive. Anything else gets
//! `ERROR unknown command\r\n` and the connection stays open.

pub mod handler;
pub mod parser;

pub use handler::PingSession;
