//! Echo protocol.
//!
//! Length-prefixed echo for throughput testing and for exercising partial
//! reads and writes with payloads from a few bytes to megabytes.
//!
//! ```text
//! Request:  <length>\r\n<data of exactly length bytes>
//! Response: <length>\r\n<data of exactly length bytes>
//!
//! Request:  5\r\nhello
//! Response: 5\r\nhello
//! ```
//!
//! `QUIT\r\n` is answered with `OK\r\n` and closes the connection. A bad
//! header gets `ERROR invalid length\r\n` or `ERROR payload too large\r\n`
//! and the header line is skipped.

pub mod handler;
pub mod parser;

pub use handler::EchoSession;
pub use parser::MAX_ECHO_SIZE;
