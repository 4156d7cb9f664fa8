//! Pairing Client
//!
//! A command-line endpoint that:
//! - Requests a pairing code (`initiate`), claims a peer's code (`join`) or
//!   reuses the stored pairing (`resume`)
//! - Waits for the peer through the rendezvous server
//! - Upgrades to a direct UDP channel when possible
//! - Sends each stdin line to the peer; prints text, hex-dumps binary

use std::fmt::Write as _;
use std::io::BufRead;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pairing_core::{ClientEvent, ClientOptions, DataHandler, EndpointError, PairingClient, Payload};

mod metrics;
mod storage;

use metrics::Metrics;

// ============================================================================
// Constants
// ============================================================================

/// Default rendezvous server port
const DEFAULT_SERVER_PORT: u16 = 4433;

/// Default stored-pairing file
const DEFAULT_PAIRING_FILE: &str = "pairing.json";

/// One event-loop step
const LOOP_STEP: Duration = Duration::from_millis(20);

// ============================================================================
// Command Line
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Mode {
    Initiate,
    Join(String),
    Resume,
}

#[derive(Debug, Clone)]
struct Options {
    mode: Mode,
    server_addr: SocketAddr,
    pairing_file: PathBuf,
    auto_upgrade: bool,
    origin: Option<String>,
}

const USAGE: &str = "usage: pairing-client <initiate | join <code> | resume> \
                     [--server <addr:port>] [--pairing-file <path>] [--origin <origin>] [--no-upgrade]";

impl Options {
    fn from_args(args: &[String]) -> Result<Self, String> {
        let mode = match args.get(1).map(String::as_str) {
            Some("initiate") => Mode::Initiate,
            Some("join") => match args.get(2) {
                Some(code) if !code.starts_with("--") => Mode::Join(code.clone()),
                _ => return Err(format!("join needs a code\n{}", USAGE)),
            },
            Some("resume") => Mode::Resume,
            _ => return Err(USAGE.to_string()),
        };

        let server_addr = parse_arg(args, "--server")
            .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_SERVER_PORT));
        let server_addr: SocketAddr = server_addr
            .parse()
            .map_err(|_| format!("Invalid server address: {}", server_addr))?;

        Ok(Options {
            mode,
            server_addr,
            pairing_file: PathBuf::from(
                parse_arg(args, "--pairing-file").unwrap_or_else(|| DEFAULT_PAIRING_FILE.to_string()),
            ),
            auto_upgrade: !args.iter().any(|a| a == "--no-upgrade"),
            origin: parse_arg(args, "--origin"),
        })
    }
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let args: Vec<String> = std::env::args().collect();
    let options = Options::from_args(&args)?;

    log::info!("Pairing Client starting...");
    log::info!("  Server:  {}", options.server_addr);
    log::info!("  Mode:    {:?}", options.mode);
    log::info!("  Pairing: {}", options.pairing_file.display());
    log::info!("  Direct:  {}", if options.auto_upgrade { "auto" } else { "disabled" });

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let metrics = Arc::new(Metrics::new());
    let result = run(&options, &shutdown, &metrics);
    log::info!("Session metrics:\n{}", metrics.render());
    result
}

fn run(
    options: &Options,
    shutdown: &AtomicBool,
    metrics: &Arc<Metrics>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client_options = ClientOptions::new(options.server_addr);
    client_options.auto_upgrade = options.auto_upgrade;
    client_options.origin = options.origin.clone();

    let mut client = PairingClient::new(client_options);
    client.set_handler(Box::new(StdoutHandler {
        metrics: Arc::clone(metrics),
    }));

    match &options.mode {
        Mode::Initiate => client.initiate()?,
        Mode::Join(code) => client.join(code)?,
        Mode::Resume => match storage::load_pairing(&options.pairing_file)? {
            Some(pairing) => client.resume(pairing)?,
            None => {
                return Err(format!(
                    "no stored pairing at {}",
                    options.pairing_file.display()
                )
                .into())
            }
        },
    }

    let mut lines = Some(spawn_stdin_reader());

    loop {
        if shutdown.load(Ordering::Relaxed) {
            log::info!("Shutdown requested");
            client.close();
            return Ok(());
        }

        client.drive(LOOP_STEP);

        while let Some(event) = client.poll_event() {
            if handle_event(&mut client, event, options, metrics)? {
                return Ok(());
            }
        }

        if let Some(rx) = &lines {
            if !drain_stdin(rx, &mut client, metrics) {
                // Keep the session up; only input is gone
                log::info!("stdin closed");
                lines = None;
            }
        }
    }
}

/// Send every queued stdin line. Returns false once stdin reached EOF.
fn drain_stdin(rx: &Receiver<String>, client: &mut PairingClient, metrics: &Metrics) -> bool {
    loop {
        match rx.try_recv() {
            Ok(line) => send_line(client, line, metrics),
            Err(TryRecvError::Empty) => return true,
            Err(TryRecvError::Disconnected) => return false,
        }
    }
}

/// Returns true when the session is over
fn handle_event(
    client: &mut PairingClient,
    event: ClientEvent,
    options: &Options,
    metrics: &Metrics,
) -> Result<bool, Box<dyn std::error::Error>> {
    match event {
        ClientEvent::PairingReady(pairing) => {
            if options.mode == Mode::Initiate {
                println!("Pairing code: {}", pairing.code);
            }
            if let Err(e) = storage::save_pairing(&options.pairing_file, &pairing) {
                log::warn!("Could not store pairing: {}", e);
            }
        }
        ClientEvent::Registered(pairing) => {
            log::info!("Waiting for peer on code {}", pairing.code);
        }
        ClientEvent::PeerConnected { is_initiator, .. } => {
            println!(
                "Peer connected ({})",
                if is_initiator { "initiator" } else { "joiner" }
            );
        }
        ClientEvent::DirectConnected => {
            metrics.direct_upgrades_total.fetch_add(1, Ordering::Relaxed);
            println!("Direct channel established");
        }
        ClientEvent::DirectFailed(e) => {
            metrics.direct_failures_total.fetch_add(1, Ordering::Relaxed);
            log::warn!("Direct channel unavailable, staying on relay: {}", e);
        }
        ClientEvent::DirectClosed => log::info!("Direct channel closed"),
        ClientEvent::ConnectFailed(e) => {
            if options.mode == Mode::Resume {
                if let EndpointError::PairingUnavailable(_) = e {
                    storage::clear_pairing(&options.pairing_file)?;
                }
            }
            client.close();
            return Err(e.into());
        }
        ClientEvent::Error(e) => log::warn!("Connection error: {}", e),
        ClientEvent::Closed => {
            println!("Disconnected");
            return Ok(true);
        }
    }
    Ok(false)
}

fn send_line(client: &mut PairingClient, line: String, metrics: &Metrics) {
    if !client.is_connected() {
        log::warn!("Not paired yet, dropping input");
        return;
    }
    let len = line.len();
    match client.send(Payload::from(line)) {
        Ok(()) => metrics.record_sent(len),
        Err(e) => log::warn!("Send failed: {}", e),
    }
}

/// Forward stdin lines over a channel; the channel disconnects at EOF
fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("stdin read error: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

// ============================================================================
// Output
// ============================================================================

/// Prints text payloads and hex-dumps binary ones
struct StdoutHandler {
    metrics: Arc<Metrics>,
}

impl DataHandler for StdoutHandler {
    fn on_binary_data(&mut self, data: &[u8]) {
        self.metrics.record_received(data.len());
        print!("{}", hex_dump(data));
    }

    fn on_string_data(&mut self, text: &str) {
        self.metrics.record_received(text.len());
        println!("{}", text);
    }
}

/// Classic 16-bytes-per-line dump: offset, hex bytes, printable ASCII
fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:08x} ", i * 16);
        for col in 0..16 {
            match chunk.get(col) {
                Some(b) => {
                    let _ = write!(out, " {:02x}", b);
                }
                None => out.push_str("   "),
            }
        }
        out.push_str("  |");
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }
    out
}
