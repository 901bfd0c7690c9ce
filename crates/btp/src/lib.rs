//! btp: Bluetooth Test Protocol transport for driving an IUT.
//!
//! The tester listens on a local endpoint, the IUT connects, and commands and
//! replies flow as framed BTP messages. Unsolicited events go to a registered
//! handler. Helpers for the IUT's debug console (rtt2pty) and HCI capture
//! (btmon) live in [`process`].

pub mod bridge;
pub mod config;
pub mod error;
pub mod process;
pub mod worker;

pub use bridge::codec::BtpCodec;
pub use bridge::protocol::{Frame, FrameHeader, INDEX_NONE, StatusCode};
pub use bridge::transport::{BtpAddress, Transport};
pub use config::{ReaderErrorPolicy, WorkerConfig};
pub use error::{BtpError, ProtocolError, Result};
pub use process::{Btmon, BtmonConfig, ProcessError, Rtt2Pty, Rtt2PtyConfig};
pub use worker::{BtpWorker, EventHandler, WorkerState};
