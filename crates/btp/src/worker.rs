//! BTP worker - drives one IUT session.
//!
//! Architecture:
//! - Reader task: the only code touching the socket's read side. Routes events
//!   to the registered handler and queues everything else in wire order.
//! - Callers: issue commands and dequeue replies through `send_wait_rsp`/`read`.
//!
//! Replies carry no request id; the next queued frame after a command is its
//! response. The worker therefore allows one outstanding command at a time and
//! rejects a concurrent second one with `CommandInFlight`.

use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Frame, FrameHeader, StatusCode};
use crate::bridge::transport::{self, BtpAddress, FrameReader, Transport};
use crate::config::{ReaderErrorPolicy, WorkerConfig};
use crate::error::{BtpError, ProtocolError, Result};

/// Consumer of unsolicited IUT events.
///
/// Runs on the reader task, so it must not block. Returning `true` consumes the
/// event; `false` lets it fall through to the response queue.
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, header: &FrameHeader, payload: &[u8]) -> bool;
}

impl<F> EventHandler for F
where
    F: Fn(&FrameHeader, &[u8]) -> bool + Send + Sync + 'static,
{
    fn handle(&self, header: &FrameHeader, payload: &[u8]) -> bool {
        self(header, payload)
    }
}

type HandlerSlot = Arc<RwLock<Option<Arc<dyn EventHandler>>>>;
type FaultSlot = Arc<StdMutex<Option<String>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Listening,
    Connected,
    /// Terminal. A new session needs a new worker.
    Closed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }
}

struct Session {
    transport: Option<Transport>,
    reader: Option<JoinHandle<()>>,
    /// Queue producer, handed to the reader task on accept.
    response_tx: Option<mpsc::UnboundedSender<Frame>>,
}

pub struct BtpWorker {
    config: WorkerConfig,
    state: StdMutex<WorkerState>,
    session: tokio::sync::Mutex<Session>,
    responses: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    command_lock: tokio::sync::Mutex<()>,
    handler: HandlerSlot,
    fault: FaultSlot,
    cancel: CancellationToken,
}

impl Default for BtpWorker {
    fn default() -> Self {
        Self::new(WorkerConfig::default())
    }
}

impl BtpWorker {
    pub fn new(config: WorkerConfig) -> Self {
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        Self {
            config,
            state: StdMutex::new(WorkerState::Idle),
            session: tokio::sync::Mutex::new(Session {
                transport: None,
                reader: None,
                response_tx: Some(response_tx),
            }),
            responses: tokio::sync::Mutex::new(response_rx),
            command_lock: tokio::sync::Mutex::new(()),
            handler: Arc::new(RwLock::new(None)),
            fault: Arc::new(StdMutex::new(None)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        tracing::debug!(from = state.as_str(), to = next.as_str(), "Worker state change");
        *state = next;
    }

    /// Bind the endpoint the IUT connects to. Returns the bound address.
    pub async fn open(&self, address: &BtpAddress) -> Result<BtpAddress> {
        let mut session = self.session.lock().await;
        let state = self.state();
        if state != WorkerState::Idle {
            return Err(BtpError::InvalidState(format!(
                "cannot open endpoint while {}",
                state.as_str()
            )));
        }

        let transport = Transport::open(address)
            .await?
            .with_max_payload_len(self.config.max_payload_len);
        let bound = transport.local_addr().clone();
        session.transport = Some(transport);
        self.set_state(WorkerState::Listening);
        Ok(bound)
    }

    /// Wait for the IUT connection and start the reader task.
    pub async fn accept(&self, timeout: Duration) -> Result<()> {
        let mut session = self.session.lock().await;
        let state = self.state();
        if state != WorkerState::Listening {
            return Err(BtpError::InvalidState(format!(
                "cannot accept while {}",
                state.as_str()
            )));
        }
        let transport = session
            .transport
            .as_mut()
            .ok_or_else(|| BtpError::InvalidState("no transport".to_string()))?;

        tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(BtpError::InvalidState("worker closed during accept".to_string()));
            }
            result = transport.accept(timeout) => result?,
        }

        let reader = transport
            .take_reader()
            .ok_or_else(|| BtpError::InvalidState("connection has no read side".to_string()))?;
        let response_tx = session
            .response_tx
            .take()
            .ok_or_else(|| BtpError::InvalidState("response queue already in use".to_string()))?;

        let task = ReaderTask {
            reader,
            response_tx,
            handler: Arc::clone(&self.handler),
            fault: Arc::clone(&self.fault),
            cancel: self.cancel.clone(),
            poll_interval: self.config.poll_interval,
            policy: self.config.error_policy,
        };
        session.reader = Some(tokio::spawn(task.run()));
        self.set_state(WorkerState::Connected);
        Ok(())
    }

    /// Install the event handler. The last registration wins.
    pub fn register_event_handler(&self, handler: impl EventHandler) {
        self.replace_handler(Some(Arc::new(handler)));
    }

    pub fn clear_event_handler(&self) {
        self.replace_handler(None);
    }

    fn replace_handler(&self, handler: Option<Arc<dyn EventHandler>>) {
        let mut slot = match self.handler.write() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = handler;
    }

    /// Write a command without waiting for its reply.
    pub async fn send(
        &self,
        service_id: u8,
        opcode: u8,
        controller_index: u8,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        let mut session = self.session.lock().await;
        self.ensure_connected()?;
        let transport = session
            .transport
            .as_mut()
            .ok_or_else(|| BtpError::InvalidState("no transport".to_string()))?;
        transport
            .send(service_id, opcode, controller_index, payload)
            .await
    }

    /// Dequeue the next non-consumed frame.
    ///
    /// Never touches the socket; only the reader task does.
    pub async fn read(&self, timeout: Duration) -> Result<Frame> {
        self.ensure_connected()?;
        let next = tokio::time::timeout(timeout, async {
            let mut responses = self.responses.lock().await;
            responses.recv().await
        })
        .await;

        match next {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(self.reader_stopped_error()),
            Err(_) => Err(BtpError::Timeout(timeout)),
        }
    }

    /// Send a command and return the payload of its reply.
    pub async fn send_wait_rsp(
        &self,
        service_id: u8,
        opcode: u8,
        controller_index: u8,
        payload: impl Into<Bytes>,
    ) -> Result<Bytes> {
        self.send_wait_rsp_with(service_id, opcode, controller_index, payload, |_| false)
            .await
    }

    /// Like [`send_wait_rsp`](Self::send_wait_rsp), for commands confirmed by
    /// more than one reply.
    ///
    /// `keep_waiting` sees each validated reply payload; returning `true`
    /// waits for another reply with the same service and opcode. The payload
    /// for which it returns `false` is returned.
    pub async fn send_wait_rsp_with<F>(
        &self,
        service_id: u8,
        opcode: u8,
        controller_index: u8,
        payload: impl Into<Bytes>,
        mut keep_waiting: F,
    ) -> Result<Bytes>
    where
        F: FnMut(&Bytes) -> bool,
    {
        let _command = self
            .command_lock
            .try_lock()
            .map_err(|_| BtpError::CommandInFlight)?;

        self.send(service_id, opcode, controller_index, payload)
            .await?;

        loop {
            let frame = self.read(self.config.response_timeout).await?;
            check_response(&frame, service_id, opcode)?;
            if !keep_waiting(&frame.payload) {
                return Ok(frame.payload);
            }
            tracing::trace!(service = service_id, opcode, "Waiting for a further reply");
        }
    }

    /// Stop the reader, drop queued frames and release the endpoint.
    ///
    /// Idempotent, and fine to call before `open` or `accept`.
    pub async fn close(&self) {
        self.cancel.cancel();

        let mut session = self.session.lock().await;
        if self.state() == WorkerState::Closed {
            return;
        }

        if let Some(handle) = session.reader.take() {
            let abort = handle.abort_handle();
            match tokio::time::timeout(self.config.close_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Reader task ended abnormally"),
                Err(_) => {
                    tracing::warn!(
                        timeout = ?self.config.close_timeout,
                        "Reader task did not stop in time, aborting"
                    );
                    abort.abort();
                }
            }
        }
        session.response_tx = None;

        let mut drained = 0usize;
        {
            let mut responses = self.responses.lock().await;
            while responses.try_recv().is_ok() {
                drained += 1;
            }
        }
        if drained > 0 {
            tracing::debug!(drained, "Dropped unread frames");
        }

        if let Some(mut transport) = session.transport.take() {
            transport.close().await;
        }
        self.set_state(WorkerState::Closed);
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            WorkerState::Connected => Ok(()),
            WorkerState::Closed => Err(BtpError::InvalidState("worker is closed".to_string())),
            other => Err(BtpError::InvalidState(format!(
                "not connected ({})",
                other.as_str()
            ))),
        }
    }

    fn reader_stopped_error(&self) -> BtpError {
        let fault = match self.fault.lock() {
            Ok(fault) => fault.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match fault {
            Some(reason) => BtpError::Transport(reason),
            None => BtpError::ConnectionClosed,
        }
    }
}

impl Drop for BtpWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Whether `FramedRead` follows this error with one spurious end-of-stream.
///
/// `Decode` rejections travel in-band from the codec and leave the stream
/// running; everything else surfaced by the stream is a real stream error.
fn pauses_stream(error: &BtpError) -> bool {
    !matches!(error, BtpError::Decode(_))
}

/// Validate a reply against the command it is supposed to answer.
fn check_response(frame: &Frame, service_id: u8, opcode: u8) -> Result<()> {
    let header = &frame.header;
    if header.service_id != service_id {
        return Err(ProtocolError::ServiceMismatch {
            expected: service_id,
            got: header.service_id,
        }
        .into());
    }
    if header.is_status() {
        return Err(ProtocolError::CommandFailed {
            service: service_id,
            opcode,
            status: StatusCode::from_payload(&frame.payload),
        }
        .into());
    }
    if header.opcode != opcode {
        return Err(ProtocolError::OpcodeMismatch {
            expected: opcode,
            got: header.opcode,
        }
        .into());
    }
    Ok(())
}

struct ReaderTask {
    reader: FrameReader,
    response_tx: mpsc::UnboundedSender<Frame>,
    handler: HandlerSlot,
    fault: FaultSlot,
    cancel: CancellationToken,
    poll_interval: Duration,
    policy: ReaderErrorPolicy,
}

impl ReaderTask {
    async fn run(mut self) {
        let mut consecutive_errors: u32 = 0;
        // FramedRead yields one end-of-stream right after a stream error before
        // it resumes reading; that one is not the peer going away.
        let mut after_error = false;

        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = transport::read_frame(&mut self.reader, self.poll_interval) => result,
            };

            match result {
                Ok(frame) => {
                    consecutive_errors = 0;
                    after_error = false;
                    if !self.dispatch(frame) {
                        tracing::debug!("Response queue dropped");
                        break;
                    }
                }
                Err(BtpError::Timeout(_)) => {}
                Err(BtpError::ConnectionClosed) if after_error => {
                    after_error = false;
                }
                Err(BtpError::ConnectionClosed) => {
                    tracing::info!("IUT closed the connection");
                    break;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    after_error = pauses_stream(&e);
                    tracing::warn!(error = %e, consecutive_errors, "Failed to read frame from IUT");
                    if self.policy.should_escalate(consecutive_errors) {
                        tracing::error!(
                            error = %e,
                            consecutive_errors,
                            "Too many consecutive read errors, stopping reader"
                        );
                        let mut fault = match self.fault.lock() {
                            Ok(fault) => fault,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        *fault = Some(format!(
                            "reader stopped after {} consecutive errors: {}",
                            consecutive_errors, e
                        ));
                        break;
                    }
                }
            }
        }

        tracing::debug!("Reader task exiting");
    }

    /// Route one frame. Returns false once nobody can receive responses.
    fn dispatch(&self, frame: Frame) -> bool {
        if frame.is_event() {
            let handler = match self.handler.read() {
                Ok(slot) => slot.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            };
            if let Some(handler) = handler
                && handler.handle(&frame.header, &frame.payload)
            {
                tracing::trace!(
                    service = frame.header.service_id,
                    opcode = frame.header.opcode,
                    "Event consumed by handler"
                );
                return true;
            }
        }
        self.response_tx.send(frame).is_ok()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn frame(service: u8, opcode: u8, payload: &[u8]) -> Frame {
        Frame::new(service, opcode, 0, payload.to_vec()).unwrap()
    }

    #[test]
    fn check_response_accepts_matching_reply() {
        assert!(check_response(&frame(6, 0x01, b"\x00"), 6, 0x01).is_ok());
    }

    #[test]
    fn check_response_order_of_checks() {
        // Wrong service wins over a STATUS opcode.
        let err = check_response(&frame(2, 0x00, b"\x01"), 6, 0x01).unwrap_err();
        assert!(matches!(
            err,
            BtpError::Protocol(ProtocolError::ServiceMismatch { expected: 6, got: 2 })
        ));

        let err = check_response(&frame(6, 0x00, b"\x01"), 6, 0x01).unwrap_err();
        assert!(matches!(
            err,
            BtpError::Protocol(ProtocolError::CommandFailed {
                service: 6,
                opcode: 0x01,
                status: StatusCode::Failed
            })
        ));

        let err = check_response(&frame(6, 0x02, b""), 6, 0x01).unwrap_err();
        assert!(matches!(
            err,
            BtpError::Protocol(ProtocolError::OpcodeMismatch {
                expected: 0x01,
                got: 0x02
            })
        ));
    }

    fn reader_parts() -> (
        ReaderTask,
        mpsc::UnboundedReceiver<Frame>,
        tokio::net::UnixStream,
    ) {
        reader_parts_with(crate::bridge::codec::BtpCodec::new())
    }

    fn reader_parts_with(
        codec: crate::bridge::codec::BtpCodec,
    ) -> (
        ReaderTask,
        mpsc::UnboundedReceiver<Frame>,
        tokio::net::UnixStream,
    ) {
        let (a, b) = tokio::net::UnixStream::pair().unwrap();
        let source: Box<dyn tokio::io::AsyncRead + Send + Unpin> = Box::new(a);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = ReaderTask {
            reader: tokio_util::codec::FramedRead::new(source, codec),
            response_tx: tx,
            handler: Arc::new(RwLock::new(None)),
            fault: Arc::new(StdMutex::new(None)),
            cancel: CancellationToken::new(),
            poll_interval: Duration::from_millis(20),
            policy: ReaderErrorPolicy::Tolerate,
        };
        (task, rx, b)
    }

    #[tokio::test]
    async fn dispatch_routes_events_and_responses() {
        let (task, mut rx, _peer) = reader_parts();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_handler = Arc::clone(&seen);
        let handler: Arc<dyn EventHandler> =
            Arc::new(move |header: &FrameHeader, _payload: &[u8]| {
                seen_in_handler.fetch_add(1, Ordering::SeqCst);
                header.opcode == 0x82
            });
        *task.handler.write().unwrap() = Some(handler);

        assert!(task.dispatch(frame(6, 0x82, b"consumed")));
        assert!(task.dispatch(frame(6, 0x83, b"declined")));
        assert!(task.dispatch(frame(6, 0x01, b"response")));

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(rx.recv().await.unwrap().header.opcode, 0x83);
        assert_eq!(rx.recv().await.unwrap().header.opcode, 0x01);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_without_handler_are_queued() {
        let (task, mut rx, _peer) = reader_parts();
        assert!(task.dispatch(frame(1, 0x80, b"")));
        assert!(rx.recv().await.unwrap().is_event());
    }

    #[tokio::test]
    async fn reader_exits_on_cancel() {
        let (task, _rx, _peer) = reader_parts();
        let cancel = task.cancel.clone();
        let handle = tokio::spawn(task.run());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reader did not observe cancellation")
            .unwrap();
    }

    #[test]
    fn only_stream_errors_pause_the_stream() {
        assert!(!pauses_stream(&BtpError::Decode("oversize".to_string())));
        assert!(pauses_stream(&BtpError::ConnectionClosed));
        assert!(pauses_stream(&BtpError::Io(std::io::Error::other("reset"))));
    }

    #[tokio::test]
    async fn reader_exits_when_peer_closes_after_rejected_frame() {
        let (task, mut rx, mut peer) =
            reader_parts_with(crate::bridge::codec::BtpCodec::new().with_max_payload_len(Some(2)));
        let handle = tokio::spawn(task.run());

        let oversize = crate::bridge::protocol::encode(1, 0x81, 0, b"too long").unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut peer, &oversize)
            .await
            .unwrap();
        drop(peer);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reader did not notice peer close")
            .unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn reader_exits_when_peer_closes() {
        let (task, mut rx, peer) = reader_parts();
        let handle = tokio::spawn(task.run());

        drop(peer);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reader did not notice peer close")
            .unwrap();
        assert!(rx.recv().await.is_none());
    }
}
