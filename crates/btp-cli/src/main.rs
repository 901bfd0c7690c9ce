use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use btp::{
    Btmon, BtmonConfig, BtpAddress, BtpError, BtpWorker, EventHandler, FrameHeader, Rtt2Pty,
    Rtt2PtyConfig, WorkerConfig,
};
use bytes::Bytes;
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "\
Usage: btpctl [options]

Options:
  --address <addr>            Socket path or host:port [default: $BTP_ADDRESS or /tmp/bt-stack-tester]
  --accept-timeout <secs>     Wait this long for the IUT to connect [default: 10]
  --response-timeout <secs>   Wait this long for each reply [default: 20]
  --send <svc:op:idx[:hex]>   Send a command and print its reply (repeatable)
  --monitor <secs>            Print frames for this long after the commands
  --rtt2pty-log <path>        Capture the IUT console via rtt2pty into <path>
  --btmon-log <path>          Capture HCI traffic via btmon into <path>
  --debugger <snr>            Debug probe serial number for rtt2pty/btmon";

#[derive(Debug, Default)]
struct Options {
    address: Option<BtpAddress>,
    accept_timeout: Option<Duration>,
    response_timeout: Option<Duration>,
    commands: Vec<Command>,
    monitor: Option<Duration>,
    rtt2pty_log: Option<PathBuf>,
    btmon_log: Option<PathBuf>,
    debugger: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Command {
    service_id: u8,
    opcode: u8,
    controller_index: u8,
    payload: Vec<u8>,
}

/// One line of stdout output.
#[derive(Serialize)]
struct FrameLine<'a> {
    kind: &'a str,
    #[serde(flatten)]
    header: FrameHeader,
    payload: String,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(options).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("BTP_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("btp={level},btpctl={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--address" => options.address = Some(BtpAddress::parse(value(args, &mut i)?)),
            "--accept-timeout" => options.accept_timeout = Some(parse_secs(value(args, &mut i)?)?),
            "--response-timeout" => {
                options.response_timeout = Some(parse_secs(value(args, &mut i)?)?)
            }
            "--send" => options.commands.push(parse_command(value(args, &mut i)?)?),
            "--monitor" => options.monitor = Some(parse_secs(value(args, &mut i)?)?),
            "--rtt2pty-log" => options.rtt2pty_log = Some(PathBuf::from(value(args, &mut i)?)),
            "--btmon-log" => options.btmon_log = Some(PathBuf::from(value(args, &mut i)?)),
            "--debugger" => options.debugger = Some(value(args, &mut i)?.to_string()),
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(options)
}

/// Value following the flag at `args[*i]`; advances `i` onto it.
fn value<'a>(args: &'a [String], i: &mut usize) -> Result<&'a str, String> {
    let flag = &args[*i];
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{flag} requires a value"))
}

/// `SVC:OP:IDX[:HEXPAYLOAD]`, numbers in decimal or `0x` hex.
fn parse_command(text: &str) -> Result<Command, String> {
    let mut parts = text.splitn(4, ':');
    let mut field = |name: &str| -> Result<u8, String> {
        let part = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| format!("command '{text}' is missing its {name}"))?;
        parse_u8(part).ok_or_else(|| format!("invalid {name} '{part}' in command '{text}'"))
    };
    let service_id = field("service id")?;
    let opcode = field("opcode")?;
    let controller_index = field("controller index")?;
    let payload = match parts.next() {
        Some(hex) => parse_hex(hex).map_err(|e| format!("command '{text}': {e}"))?,
        None => Vec::new(),
    };

    Ok(Command {
        service_id,
        opcode,
        controller_index,
        payload,
    })
}

fn parse_u8(s: &str) -> Option<u8> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn parse_hex(s: &str) -> Result<Vec<u8>, String> {
    if s.len() % 2 != 0 {
        return Err(format!("payload '{s}' has an odd number of hex digits"));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|byte| u8::from_str_radix(byte, 16).ok())
                .ok_or_else(|| format!("payload '{s}' is not valid hex"))
        })
        .collect()
}

fn parse_secs(s: &str) -> Result<Duration, String> {
    s.parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| format!("invalid duration '{s}', expected seconds"))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn print_frame(kind: &str, header: FrameHeader, payload: &[u8]) {
    let line = FrameLine {
        kind,
        header,
        payload: to_hex(payload),
    };
    match serde_json::to_string(&line) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::warn!(error = %e, "Failed to serialize frame"),
    }
}

async fn run(options: Options) -> anyhow::Result<()> {
    let mut rtt2pty = None;
    if let Some(log) = &options.rtt2pty_log {
        let mut config = Rtt2PtyConfig::new();
        if let Some(snr) = &options.debugger {
            config = config.with_debugger(snr.clone());
        }
        let mut bridge = Rtt2Pty::new(config);
        bridge.start(log).await.context("failed to start rtt2pty")?;
        rtt2pty = Some(bridge);
    }

    let mut btmon = None;
    if let Some(capture) = &options.btmon_log {
        let mut config = BtmonConfig::new();
        if let Some(snr) = &options.debugger {
            config = config.with_debugger(snr.clone());
        }
        let mut monitor = Btmon::new(config);
        match monitor.start(capture).await {
            Ok(()) => btmon = Some(monitor),
            Err(e) => {
                if let Some(bridge) = rtt2pty.as_mut() {
                    bridge.stop().await;
                }
                return Err(anyhow::Error::new(e).context("failed to start btmon"));
            }
        }
    }

    let mut config = WorkerConfig::new();
    if let Some(timeout) = options.response_timeout {
        config = config.with_response_timeout(timeout);
    }
    if let Some(timeout) = options.accept_timeout {
        config = config.with_accept_timeout(timeout);
    }
    let worker = BtpWorker::new(config);

    let result = session(&worker, &options, print_event).await;

    worker.close().await;
    if let Some(monitor) = btmon.as_mut() {
        monitor.stop().await;
    }
    if let Some(bridge) = rtt2pty.as_mut() {
        bridge.stop().await;
    }
    result
}

fn print_event(header: &FrameHeader, payload: &[u8]) -> bool {
    print_frame("event", *header, payload);
    true
}

async fn session(
    worker: &BtpWorker,
    options: &Options,
    events: impl EventHandler,
) -> anyhow::Result<()> {
    let address = options.address.clone().unwrap_or_else(BtpAddress::from_env);
    let bound = worker
        .open(&address)
        .await
        .with_context(|| format!("failed to listen on {address}"))?;
    tracing::info!(address = %bound, "Waiting for IUT");

    // The IUT may report events as soon as it connects.
    worker.register_event_handler(events);
    worker
        .accept(worker.config().accept_timeout)
        .await
        .context("IUT did not connect")?;

    for command in &options.commands {
        let payload = Bytes::from(command.payload.clone());
        let reply = worker
            .send_wait_rsp(
                command.service_id,
                command.opcode,
                command.controller_index,
                payload,
            )
            .await
            .with_context(|| {
                format!(
                    "command {}:{:#04x}:{} failed",
                    command.service_id, command.opcode, command.controller_index
                )
            })?;
        let header = FrameHeader::new(
            command.service_id,
            command.opcode,
            command.controller_index,
            u16::try_from(reply.len()).unwrap_or(u16::MAX),
        );
        print_frame("response", header, &reply);
    }

    if let Some(duration) = options.monitor {
        monitor(worker, duration).await?;
    }
    Ok(())
}

/// Print stray frames until `duration` elapses or the operator interrupts.
async fn monitor(worker: &BtpWorker, duration: Duration) -> anyhow::Result<()> {
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = &mut deadline => return Ok(()),
            _ = &mut interrupt => {
                tracing::info!("Interrupted");
                return Ok(());
            }
            next = worker.read(Duration::from_secs(1)) => match next {
                Ok(frame) => print_frame("frame", frame.header, &frame.payload),
                Err(BtpError::Timeout(_)) => {}
                Err(BtpError::ConnectionClosed) => {
                    tracing::info!("IUT disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e).context("monitoring failed"),
            },
        }
    }
}
