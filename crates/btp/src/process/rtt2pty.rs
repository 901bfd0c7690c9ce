//! RTT-to-PTY bridge: captures the IUT's debug console into a log file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio_util::sync::CancellationToken;

use super::{ProcessError, Supervised, next_line, spawn_piped};

/// Prefix of the stdout line in which rtt2pty names the PTY it created.
pub const PTY_ANNOUNCEMENT: &str = "PTY name is ";

#[derive(Debug, Clone)]
pub struct Rtt2PtyConfig {
    pub program: String,
    /// Arguments placed before the generated ones.
    pub program_args: Vec<String>,
    /// Serial number of the debug probe, passed as `-s`.
    pub debugger_snr: Option<String>,
    pub announce_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for Rtt2PtyConfig {
    fn default() -> Self {
        Self {
            program: "rtt2pty".to_string(),
            program_args: Vec::new(),
            debugger_snr: None,
            announce_timeout: Duration::from_secs(3),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl Rtt2PtyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.program_args = args;
        self
    }

    pub fn with_debugger(mut self, snr: impl Into<String>) -> Self {
        self.debugger_snr = Some(snr.into());
        self
    }

    pub fn with_announce_timeout(mut self, timeout: Duration) -> Self {
        self.announce_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    fn args(&self) -> Vec<String> {
        let mut args = self.program_args.clone();
        if let Some(snr) = &self.debugger_snr {
            args.push("-s".to_string());
            args.push(snr.clone());
        }
        args
    }
}

pub struct Rtt2Pty {
    config: Rtt2PtyConfig,
    running: Option<Supervised>,
    pty: Option<PathBuf>,
}

impl Rtt2Pty {
    pub fn new(config: Rtt2PtyConfig) -> Self {
        Self {
            config,
            running: None,
            pty: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// PTY announced by the running bridge.
    pub fn pty_name(&self) -> Option<&Path> {
        self.pty.as_deref()
    }

    /// Spawn the bridge and start copying its console lines into `log_path`.
    ///
    /// On failure nothing is left running.
    pub async fn start(&mut self, log_path: impl AsRef<Path>) -> Result<(), ProcessError> {
        if self.running.is_some() {
            return Err(ProcessError::AlreadyRunning(self.config.program.clone()));
        }
        let log_path = log_path.as_ref();
        let program = self.config.program.clone();

        let mut child = spawn_piped(&program, &self.config.args())?;
        let Some(stdout) = child.stdout.take() else {
            discard(child).await;
            return Err(ProcessError::Io {
                context: format!("{} stdout not captured", program),
                source: std::io::Error::other("missing pipe"),
            });
        };
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());

        let announced = tokio::time::timeout(
            self.config.announce_timeout,
            wait_for_pty(&mut stdout, &mut stderr),
        )
        .await;
        let pty = match announced {
            Ok(Some(pty)) => pty,
            Ok(None) | Err(_) => {
                discard(child).await;
                return Err(ProcessError::MissingAnnouncement {
                    program,
                    timeout: self.config.announce_timeout,
                });
            }
        };
        tracing::debug!(pty = %pty.display(), "rtt2pty announced PTY");

        let console = match open_console(&pty).await {
            Ok(file) => file,
            Err(source) => {
                discard(child).await;
                return Err(ProcessError::Io {
                    context: format!("failed to open {}", pty.display()),
                    source,
                });
            }
        };
        let log = match OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await
        {
            Ok(file) => file,
            Err(source) => {
                discard(child).await;
                return Err(ProcessError::Io {
                    context: format!("failed to open log {}", log_path.display()),
                    source,
                });
            }
        };

        let cancel = CancellationToken::new();
        let drain = tokio::spawn(drain_console(console, stdout, stderr, log, cancel.clone()));

        tracing::info!(pty = %pty.display(), log = %log_path.display(), "rtt2pty started");
        self.pty = Some(pty);
        self.running = Some(Supervised {
            program,
            child,
            drain,
            cancel,
        });
        Ok(())
    }

    /// Stop the bridge and close the log. No-op when not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.stop(self.config.stop_timeout).await;
        self.pty = None;
        tracing::info!("rtt2pty stopped");
    }
}

async fn discard(mut child: Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "Failed to kill helper process");
    }
    match child.wait().await {
        Ok(status) => tracing::debug!(%status, "Helper process reaped"),
        Err(e) => tracing::debug!(error = %e, "Failed to reap helper process"),
    }
}

/// Read stdout until the PTY announcement. Stderr is forwarded meanwhile so a
/// chatty bridge cannot stall on a full pipe.
async fn wait_for_pty(
    stdout: &mut Lines<BufReader<ChildStdout>>,
    stderr: &mut Option<Lines<BufReader<ChildStderr>>>,
) -> Option<PathBuf> {
    loop {
        tokio::select! {
            line = stdout.next_line() => {
                let line = line.ok().flatten()?;
                if let Some(name) = line.strip_prefix(PTY_ANNOUNCEMENT) {
                    return Some(PathBuf::from(name.trim()));
                }
                tracing::debug!(target: "btp::rtt2pty", "{}", line);
            }
            line = next_line(stderr), if stderr.is_some() => {
                match line {
                    Some(text) => tracing::warn!(target: "btp::rtt2pty", "{}", text),
                    None => *stderr = None,
                }
            }
        }
    }
}

/// Open the announced PTY without making it our controlling terminal and
/// switch it to raw mode.
async fn open_console(pty: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(unix)]
    options.custom_flags(nix::fcntl::OFlag::O_NOCTTY.bits());
    let console = options.open(pty).await?;
    make_raw(&console)?;
    Ok(console)
}

/// Disable echo, line editing and CR/NL translation so console bytes reach
/// the log untouched. Anything that is not a terminal is left alone.
#[cfg(unix)]
fn make_raw(console: &File) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::termios::{self, SetArg};

    let mut attrs = match termios::tcgetattr(console) {
        Ok(attrs) => attrs,
        Err(Errno::ENOTTY) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    termios::cfmakeraw(&mut attrs);
    termios::tcsetattr(console, SetArg::TCSANOW, &attrs)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_raw(_console: &File) -> std::io::Result<()> {
    Ok(())
}

/// Copy console lines into the log until cancelled or the PTY closes.
async fn drain_console(
    console: File,
    stdout: Lines<BufReader<ChildStdout>>,
    mut stderr: Option<Lines<BufReader<ChildStderr>>>,
    mut log: File,
    cancel: CancellationToken,
) {
    let mut console = BufReader::new(console);
    // read_until appends, so a line interrupted by another branch resumes here.
    let mut line = Vec::new();
    let mut stdout = Some(stdout);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = console.read_until(b'\n', &mut line) => {
                match read {
                    Ok(0) => {
                        tracing::debug!("PTY closed");
                        break;
                    }
                    Ok(_) => {
                        match std::str::from_utf8(&line) {
                            Ok(text) => {
                                if let Err(e) = write_line(&mut log, text).await {
                                    tracing::warn!(error = %e, "Failed to write console log");
                                }
                            }
                            Err(_) => tracing::trace!(len = line.len(), "Skipping undecodable console line"),
                        }
                        line.clear();
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "PTY read failed");
                        break;
                    }
                }
            }
            out = next_line(&mut stdout), if stdout.is_some() => {
                match out {
                    Some(text) => tracing::debug!(target: "btp::rtt2pty", "{}", text),
                    None => stdout = None,
                }
            }
            err = next_line(&mut stderr), if stderr.is_some() => {
                match err {
                    Some(text) => tracing::warn!(target: "btp::rtt2pty", "{}", text),
                    None => stderr = None,
                }
            }
        }
    }

    if let Err(e) = log.flush().await {
        tracing::warn!(error = %e, "Failed to flush console log");
    }
}

async fn write_line(log: &mut File, text: &str) -> std::io::Result<()> {
    log.write_all(text.as_bytes()).await?;
    log.flush().await
}
