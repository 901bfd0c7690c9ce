//! Auxiliary processes running alongside an IUT session.
//!
//! - **rtt2pty**: exposes the IUT's RTT debug channel as a PTY; its lines are
//!   copied into a log file
//! - **btmon**: HCI packet capture written straight to a capture file
//!
//! Each running process owns one drain task with its own cancellation token.
//! `stop` interrupts the process, waits for it and joins the task.

pub mod btmon;
pub mod rtt2pty;

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use btmon::{Btmon, BtmonConfig};
pub use rtt2pty::{Rtt2Pty, Rtt2PtyConfig};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not announce its PTY within {timeout:?}")]
    MissingAnnouncement { program: String, timeout: Duration },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is already running")]
    AlreadyRunning(String),
}

/// A spawned helper process plus the task draining its output.
struct Supervised {
    program: String,
    child: Child,
    drain: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Supervised {
    /// Interrupt the process, wait for it, then join the drain task.
    async fn stop(mut self, timeout: Duration) {
        interrupt_and_wait(&mut self.child, &self.program, timeout).await;

        self.cancel.cancel();
        let abort = self.drain.abort_handle();
        match tokio::time::timeout(timeout, self.drain).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(program = %self.program, error = %e, "Drain task ended abnormally"),
            Err(_) => {
                tracing::warn!(program = %self.program, "Drain task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

fn spawn_piped(program: &str, args: &[String]) -> Result<Child, ProcessError> {
    tracing::debug!(%program, ?args, "Spawning helper process");
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })
}

/// Next line from an optional pipe; `None` once it is closed or unreadable.
async fn next_line<R: AsyncRead + Unpin>(lines: &mut Option<Lines<BufReader<R>>>) -> Option<String> {
    lines.as_mut()?.next_line().await.ok().flatten()
}

/// Graceful stop: SIGINT, bounded wait, then kill.
async fn interrupt_and_wait(child: &mut Child, program: &str, timeout: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            tracing::debug!(%program, %status, "Helper process already exited");
            return;
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(%program, error = %e, "Failed to poll helper process"),
    }

    send_interrupt(child, program);

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => tracing::debug!(%program, %status, "Helper process exited"),
        Ok(Err(e)) => tracing::warn!(%program, error = %e, "Failed to wait for helper process"),
        Err(_) => {
            tracing::warn!(%program, "Helper process ignored SIGINT, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(%program, error = %e, "Failed to kill helper process");
            }
        }
    }
}

#[cfg(unix)]
fn send_interrupt(child: &mut Child, program: &str) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        tracing::warn!(%program, pid, error = %e, "Failed to send SIGINT");
    }
}

#[cfg(not(unix))]
fn send_interrupt(child: &mut Child, program: &str) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(%program, error = %e, "Failed to terminate helper process");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_failure_names_program() {
        let err = spawn_piped("/nonexistent/helper-binary", &[]).unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { ref program, .. } if program == "/nonexistent/helper-binary"));
    }

    #[tokio::test]
    async fn interrupt_stops_sleeping_process() {
        let mut child = spawn_piped("sleep", &["30".to_string()]).unwrap();
        let started = std::time::Instant::now();

        interrupt_and_wait(&mut child, "sleep", Duration::from_secs(5)).await;

        assert!(child.try_wait().unwrap().is_some());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn interrupt_after_exit_is_noop() {
        let mut child = spawn_piped("true", &[]).unwrap();
        child.wait().await.unwrap();

        interrupt_and_wait(&mut child, "true", Duration::from_secs(1)).await;
    }
}
