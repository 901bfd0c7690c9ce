//! HCI monitor capturing the IUT's controller traffic over J-Link.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;

use super::{ProcessError, Supervised, next_line, spawn_piped};

#[derive(Debug, Clone)]
pub struct BtmonConfig {
    pub program: String,
    /// Arguments placed before the generated ones.
    pub program_args: Vec<String>,
    /// J-Link target device. `None` monitors the local HCI instead.
    pub jlink_device: Option<String>,
    pub debugger_snr: Option<String>,
    pub stop_timeout: Duration,
}

impl Default for BtmonConfig {
    fn default() -> Self {
        Self {
            program: "btmon".to_string(),
            program_args: Vec::new(),
            jlink_device: Some("NRF52".to_string()),
            debugger_snr: None,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl BtmonConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.program_args = args;
        self
    }

    pub fn with_jlink_device(mut self, device: Option<String>) -> Self {
        self.jlink_device = device;
        self
    }

    pub fn with_debugger(mut self, snr: impl Into<String>) -> Self {
        self.debugger_snr = Some(snr.into());
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    fn args(&self, capture: &Path) -> Vec<String> {
        let mut args = self.program_args.clone();
        if let Some(device) = &self.jlink_device {
            args.push("-J".to_string());
            match &self.debugger_snr {
                Some(snr) => args.push(format!("{},{}", device, snr)),
                None => args.push(device.clone()),
            }
        }
        args.push("-w".to_string());
        args.push(capture.display().to_string());
        args
    }
}

pub struct Btmon {
    config: BtmonConfig,
    running: Option<Supervised>,
}

impl Btmon {
    pub fn new(config: BtmonConfig) -> Self {
        Self {
            config,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Spawn btmon writing its capture to `capture_path`.
    pub async fn start(&mut self, capture_path: impl AsRef<Path>) -> Result<(), ProcessError> {
        if self.running.is_some() {
            return Err(ProcessError::AlreadyRunning(self.config.program.clone()));
        }
        let capture_path = capture_path.as_ref();
        let program = self.config.program.clone();

        let mut child = spawn_piped(&program, &self.config.args(capture_path))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let cancel = CancellationToken::new();
        let drain = tokio::spawn(drain_output(stdout, stderr, cancel.clone()));

        tracing::info!(capture = %capture_path.display(), "btmon started");
        self.running = Some(Supervised {
            program,
            child,
            drain,
            cancel,
        });
        Ok(())
    }

    /// Stop the capture. No-op when not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.stop(self.config.stop_timeout).await;
        tracing::info!("btmon stopped");
    }
}

async fn drain_output<O, E>(stdout: Option<O>, stderr: Option<E>, cancel: CancellationToken)
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut stdout = stdout.map(|s| BufReader::new(s).lines());
    let mut stderr = stderr.map(|s| BufReader::new(s).lines());

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = next_line(&mut stdout), if stdout.is_some() => {
                match line {
                    Some(text) => tracing::debug!(target: "btp::btmon", "{}", text),
                    None => stdout = None,
                }
            }
            line = next_line(&mut stderr), if stderr.is_some() => {
                match line {
                    Some(text) => tracing::warn!(target: "btp::btmon", "{}", text),
                    None => stderr = None,
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn jlink_arguments() {
        let capture = Path::new("/tmp/capture.snoop");

        let config = BtmonConfig::new().with_debugger("683123456");
        assert_eq!(
            config.args(capture),
            vec!["-J", "NRF52,683123456", "-w", "/tmp/capture.snoop"]
        );

        let config = BtmonConfig::new();
        assert_eq!(config.args(capture), vec!["-J", "NRF52", "-w", "/tmp/capture.snoop"]);

        let config = BtmonConfig::new().with_jlink_device(None);
        assert_eq!(config.args(capture), vec!["-w", "/tmp/capture.snoop"]);
    }

    #[tokio::test]
    async fn runs_with_capture_arguments_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let recorded = dir.path().join("args");
        let capture = dir.path().join("hci.snoop");
        let script = format!(
            "printf '%s\\n' \"$@\" > {}; echo 'noise on stderr' >&2; exec sleep 30",
            recorded.display()
        );
        let config = BtmonConfig::new()
            .with_program("sh", vec!["-c".to_string(), script, "btmon".to_string()])
            .with_debugger("683")
            .with_stop_timeout(Duration::from_secs(2));

        let mut monitor = Btmon::new(config);
        monitor.start(&capture).await.unwrap();
        assert!(monitor.is_running());

        let expected = format!("-J\nNRF52,683\n-w\n{}\n", capture.display());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        let mut contents = String::new();
        while tokio::time::Instant::now() < deadline {
            contents = tokio::fs::read_to_string(&recorded).await.unwrap_or_default();
            if contents == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(contents, expected);

        let started = std::time::Instant::now();
        monitor.stop().await;
        assert!(!monitor.is_running());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = BtmonConfig::new()
            .with_program("sh", vec!["-c".to_string(), "exec sleep 30".to_string(), "btmon".to_string()])
            .with_stop_timeout(Duration::from_secs(2));
        let mut monitor = Btmon::new(config);

        monitor.start(dir.path().join("a.snoop")).await.unwrap();
        let err = monitor.start(dir.path().join("b.snoop")).await.unwrap_err();
        assert!(matches!(err, ProcessError::AlreadyRunning(_)));

        monitor.stop().await;
        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn spawn_failure_leaves_monitor_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor =
            Btmon::new(BtmonConfig::new().with_program("/nonexistent/btmon", Vec::new()));

        let err = monitor.start(dir.path().join("hci.snoop")).await.unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(!monitor.is_running());
    }
}
