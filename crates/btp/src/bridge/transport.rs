//! Listening endpoint and the single accepted IUT connection.
//!
//! Two endpoint flavours:
//! - **Unix**: filesystem socket (the default on Unix, `/tmp/bt-stack-tester`)
//! - **Tcp**: loopback `host:port`, port 0 picks an ephemeral port (the
//!   default elsewhere)

use std::net::SocketAddr;
#[cfg(unix)]
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::BtpCodec;
use super::protocol::Frame;
use crate::error::{BtpError, Result};

/// Where the test agent on the IUT side connects.
pub const DEFAULT_BTP_ADDRESS: &str = "/tmp/bt-stack-tester";

/// Environment variable overriding [`DEFAULT_BTP_ADDRESS`].
pub const BTP_ADDRESS_ENV: &str = "BTP_ADDRESS";

pub(crate) type FrameReader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, BtpCodec>;
type FrameWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, BtpCodec>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BtpAddress {
    /// Only bindable on Unix.
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl BtpAddress {
    /// Address from `BTP_ADDRESS`, falling back to the default socket path.
    pub fn from_env() -> Self {
        match std::env::var(BTP_ADDRESS_ENV) {
            Ok(value) if !value.trim().is_empty() => Self::parse(value.trim()),
            _ => Self::default(),
        }
    }

    /// `host:port` is a TCP endpoint, anything else a socket path.
    pub fn parse(s: &str) -> Self {
        match s.parse::<SocketAddr>() {
            Ok(addr) => Self::Tcp(addr),
            Err(_) => Self::Unix(PathBuf::from(s)),
        }
    }
}

impl Default for BtpAddress {
    #[cfg(unix)]
    fn default() -> Self {
        Self::Unix(PathBuf::from(DEFAULT_BTP_ADDRESS))
    }

    #[cfg(not(unix))]
    fn default() -> Self {
        Self::Tcp(SocketAddr::from(([127, 0, 0, 1], 0)))
    }
}

impl FromStr for BtpAddress {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl std::fmt::Display for BtpAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "{}", path.display()),
            Self::Tcp(addr) => write!(f, "{}", addr),
        }
    }
}

enum Listener {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<(FrameSource, FrameSink)> {
        match self {
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                let (read, write) = stream.into_split();
                let source: FrameSource = Box::new(read);
                let sink: FrameSink = Box::new(write);
                Ok((source, sink))
            }
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                tracing::trace!(%peer, "TCP peer connected");
                stream.set_nodelay(true)?;
                let (read, write) = stream.into_split();
                let source: FrameSource = Box::new(read);
                let sink: FrameSink = Box::new(write);
                Ok((source, sink))
            }
        }
    }
}

type FrameSource = Box<dyn AsyncRead + Send + Unpin>;
type FrameSink = Box<dyn AsyncWrite + Send + Unpin>;

/// One listening endpoint and at most one connection.
///
/// The listener is dropped as soon as a peer is accepted, so a session never
/// sees a second connection.
pub struct Transport {
    address: BtpAddress,
    listener: Option<Listener>,
    reader: Option<FrameReader>,
    writer: Option<FrameWriter>,
    accepted: bool,
    closed: bool,
    max_payload_len: Option<usize>,
}

impl Transport {
    /// Bind the listening endpoint, replacing a stale socket file.
    pub async fn open(address: &BtpAddress) -> Result<Self> {
        let (listener, bound) = match address {
            #[cfg(unix)]
            BtpAddress::Unix(path) => {
                remove_stale_socket(path)?;
                let listener = UnixListener::bind(path).map_err(|e| {
                    BtpError::Transport(format!("failed to bind {}: {}", path.display(), e))
                })?;
                (Listener::Unix(listener), address.clone())
            }
            #[cfg(not(unix))]
            BtpAddress::Unix(path) => {
                return Err(BtpError::Transport(format!(
                    "cannot bind {}: Unix sockets are not available on this platform",
                    path.display()
                )));
            }
            BtpAddress::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| BtpError::Transport(format!("failed to bind {}: {}", addr, e)))?;
                let local = listener.local_addr().map_err(|e| {
                    BtpError::Transport(format!("failed to read bound address: {}", e))
                })?;
                (Listener::Tcp(listener), BtpAddress::Tcp(local))
            }
        };

        tracing::debug!(address = %bound, "BTP endpoint listening");

        Ok(Self {
            address: bound,
            listener: Some(listener),
            reader: None,
            writer: None,
            accepted: false,
            closed: false,
            max_payload_len: None,
        })
    }

    /// Reject frames announcing more than `max` payload bytes.
    pub fn with_max_payload_len(mut self, max: Option<usize>) -> Self {
        self.max_payload_len = max;
        self
    }

    /// Bound address. For TCP this carries the real port when 0 was requested.
    pub fn local_addr(&self) -> &BtpAddress {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.accepted && !self.closed
    }

    /// Wait for the IUT to connect.
    pub async fn accept(&mut self, timeout: Duration) -> Result<()> {
        if self.closed {
            return Err(BtpError::InvalidState("transport is closed".to_string()));
        }
        if self.accepted {
            return Err(BtpError::InvalidState(
                "a connection was already accepted".to_string(),
            ));
        }
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| BtpError::InvalidState("transport is not listening".to_string()))?;

        tracing::debug!(address = %self.address, ?timeout, "Waiting for IUT connection");
        let (source, sink) = match tokio::time::timeout(timeout, listener.accept()).await {
            Ok(Ok(halves)) => halves,
            Ok(Err(e)) => return Err(BtpError::Transport(format!("accept failed: {}", e))),
            Err(_) => return Err(BtpError::Timeout(timeout)),
        };

        let max = self.max_payload_len;
        self.reader = Some(FramedRead::new(
            source,
            BtpCodec::new().with_max_payload_len(max),
        ));
        self.writer = Some(FramedWrite::new(
            sink,
            BtpCodec::new().with_max_payload_len(max),
        ));
        self.listener = None;
        self.accepted = true;

        tracing::info!(address = %self.address, "IUT connected");
        Ok(())
    }

    /// Read exactly one frame.
    ///
    /// Cancel-safe: bytes of a frame that was still arriving when the timeout
    /// hit stay buffered for the next call.
    pub async fn read(&mut self, timeout: Duration) -> Result<Frame> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| BtpError::InvalidState("no readable connection".to_string()))?;
        read_frame(reader, timeout).await
    }

    /// Write one frame without waiting for a reply.
    pub async fn send(
        &mut self,
        service_id: u8,
        opcode: u8,
        controller_index: u8,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        let frame = Frame::new(service_id, opcode, controller_index, payload)?;
        self.send_frame(frame).await
    }

    pub async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| BtpError::InvalidState("not connected".to_string()))?;
        tracing::debug!(
            service = frame.header.service_id,
            opcode = frame.header.opcode,
            index = frame.header.controller_index,
            len = frame.payload.len(),
            "Sending command"
        );
        writer.send(frame).await
    }

    /// Hand the read side over to a dedicated reader task.
    pub(crate) fn take_reader(&mut self) -> Option<FrameReader> {
        self.reader.take()
    }

    /// Shut the connection down and release the endpoint. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take()
            && let Err(e) = writer.close().await
        {
            tracing::debug!(error = %e, "Ignoring error while shutting down connection");
        }
        self.reader = None;
        self.listener = None;
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.cleanup() {
                tracing::warn!(error = %e, "Failed to remove socket file");
            }
            tracing::debug!(address = %self.address, "BTP transport closed");
        }
    }

    fn cleanup(&self) -> std::io::Result<()> {
        if let BtpAddress::Unix(path) = &self.address {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if !self.closed
            && let Err(e) = self.cleanup()
        {
            tracing::warn!(error = %e, "Failed to remove socket file");
        }
    }
}

pub(crate) async fn read_frame(reader: &mut FrameReader, timeout: Duration) -> Result<Frame> {
    match tokio::time::timeout(timeout, reader.next()).await {
        Ok(Some(Ok(decoded))) => decoded,
        Ok(Some(Err(e))) => Err(e),
        Ok(None) => Err(BtpError::ConnectionClosed),
        Err(_) => Err(BtpError::Timeout(timeout)),
    }
}

#[cfg(unix)]
fn remove_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        tracing::debug!(path = %path.display(), "Removing stale socket file");
        std::fs::remove_file(path).map_err(|e| {
            BtpError::Transport(format!(
                "failed to remove stale endpoint {}: {}",
                path.display(),
                e
            ))
        })?;
    }
    Ok(())
}
