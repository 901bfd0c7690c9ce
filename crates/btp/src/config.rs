//! Worker tunables.

use std::time::Duration;

/// What the reader task does when reading from the IUT fails.
///
/// Timeouts are never counted; they are the normal idle case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReaderErrorPolicy {
    /// Log every error and keep reading.
    #[default]
    Tolerate,
    /// Stop the reader after this many consecutive errors. Waiting callers then
    /// fail with a transport error instead of running into their timeouts.
    EscalateAfter(u32),
}

impl ReaderErrorPolicy {
    pub(crate) fn should_escalate(&self, consecutive_errors: u32) -> bool {
        match self {
            Self::Tolerate => false,
            Self::EscalateAfter(limit) => consecutive_errors >= (*limit).max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long `accept` waits for the IUT when no timeout is given.
    pub accept_timeout: Duration,
    /// Per-frame wait in `send_wait_rsp`.
    pub response_timeout: Duration,
    /// Read timeout of a single reader task iteration.
    pub poll_interval: Duration,
    /// Bound on joining the reader task in `close`.
    pub close_timeout: Duration,
    pub error_policy: ReaderErrorPolicy,
    /// Frames announcing more payload than this are skipped.
    pub max_payload_len: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            accept_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_secs(1),
            close_timeout: Duration::from_secs(5),
            error_policy: ReaderErrorPolicy::Tolerate,
            max_payload_len: None,
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_error_policy(mut self, policy: ReaderErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_max_payload_len(mut self, max: usize) -> Self {
        self.max_payload_len = Some(max);
        self
    }
}
