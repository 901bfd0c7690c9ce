//! BTP wire plumbing between the test controller and the IUT's test agent.
//!
//! # Architecture
//!
//! - **protocol**: Frame header layout, opcode classification, status codes
//! - **codec**: Streaming framing codec for AsyncRead/AsyncWrite
//! - **transport**: Listening endpoint and the single accepted connection

pub mod codec;
pub mod protocol;
pub mod transport;
