//! Error types for the BTP transport.

use std::time::Duration;

use thiserror::Error;

use crate::bridge::protocol::StatusCode;

/// Reasons a reply frame does not complete the command that was sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("incorrect service id {got} in the response, expected {expected}")]
    ServiceMismatch { expected: u8, got: u8 },

    /// IUT answered with the STATUS opcode: the command was rejected.
    #[error("command 0x{opcode:02x} rejected by service {service} ({status})")]
    CommandFailed {
        service: u8,
        opcode: u8,
        status: StatusCode,
    },

    #[error("invalid opcode 0x{got:02x} in the response, expected 0x{expected:02x}")]
    OpcodeMismatch { expected: u8, got: u8 },
}

/// Main error type for transport and worker operations.
#[derive(Debug, Error)]
pub enum BtpError {
    /// No frame or connection arrived before the deadline. The caller decides
    /// whether to try again.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Bind, accept or socket failure. Fatal to the session.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer went away, possibly in the middle of a frame.
    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Malformed frame on the wire.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("payload of {len} bytes does not fit in a frame (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// A second command was issued while one is still waiting for its reply.
    #[error("another command is already waiting for a response")]
    CommandInFlight,

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl BtpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Errors after which the connection cannot deliver further frames.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Transport(_))
    }
}

/// Result type alias using BtpError.
pub type Result<T> = std::result::Result<T, BtpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_messages() {
        let err = BtpError::from(ProtocolError::ServiceMismatch {
            expected: 6,
            got: 2,
        });
        insta::assert_snapshot!(err.to_string(), @"protocol error: incorrect service id 2 in the response, expected 6");

        let err = ProtocolError::CommandFailed {
            service: 6,
            opcode: 0x01,
            status: StatusCode::Failed,
        };
        insta::assert_snapshot!(err.to_string(), @"command 0x01 rejected by service 6 (failed)");

        let err = ProtocolError::CommandFailed {
            service: 6,
            opcode: 0x01,
            status: StatusCode::Missing,
        };
        insta::assert_snapshot!(err.to_string(), @"command 0x01 rejected by service 6 (no status code)");

        let err = ProtocolError::OpcodeMismatch {
            expected: 0x1a,
            got: 0x02,
        };
        insta::assert_snapshot!(err.to_string(), @"invalid opcode 0x02 in the response, expected 0x1a");
    }

    #[test]
    fn classification_helpers() {
        assert!(BtpError::Timeout(Duration::from_secs(1)).is_timeout());
        assert!(BtpError::ConnectionClosed.is_fatal());
        assert!(BtpError::Transport("reader stopped".to_string()).is_fatal());
        assert!(!BtpError::Decode("bad".to_string()).is_fatal());
        assert!(!BtpError::CommandInFlight.is_timeout());
    }
}
