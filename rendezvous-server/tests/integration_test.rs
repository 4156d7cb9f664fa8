//! Integration tests for the rendezvous server
//!
//! Each test spawns the built server binary on its own port with a fresh
//! self-signed certificate and drives two in-process `PairingClient`s
//! against it over real QUIC.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pairing_core::{ClientEvent, ClientOptions, DataHandler, EndpointError, Pairing, PairingClient, Payload};

/// Upper bound for any single wait in these tests
const WAIT: Duration = Duration::from_secs(15);

/// One loop step per client
const STEP: Duration = Duration::from_millis(5);

/// Helper to spawn the rendezvous server for tests
struct ServerProcess {
    child: Child,
    dir: PathBuf,
}

impl ServerProcess {
    fn start(port: u16) -> Result<Self, Box<dyn std::error::Error>> {
        let dir = std::env::temp_dir().join(format!(
            "rendezvous-test-{}-{}",
            port,
            std::process::id()
        ));
        std::fs::create_dir_all(&dir)?;

        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.pem())?;
        std::fs::write(&key_path, key_pair.serialize_pem())?;

        let child = Command::new(env!("CARGO_BIN_EXE_rendezvous-server"))
            .args(["--port", &port.to_string()])
            .arg("--cert")
            .arg(&cert_path)
            .arg("--key")
            .arg(&key_path)
            .env("RUST_LOG", "info")
            .spawn()?;

        // Give server time to start
        thread::sleep(Duration::from_millis(500));

        Ok(ServerProcess { child, dir })
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Records every application payload
#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<Payload>>>);

impl Capture {
    fn received(&self) -> Vec<Payload> {
        self.0.lock().unwrap().clone()
    }
}

impl DataHandler for Capture {
    fn on_binary_data(&mut self, data: &[u8]) {
        self.0.lock().unwrap().push(Payload::Binary(data.to_vec()));
    }

    fn on_string_data(&mut self, text: &str) {
        self.0.lock().unwrap().push(Payload::Text(text.to_string()));
    }
}

/// A client plus the events and data it has produced so far
struct Peer {
    client: PairingClient,
    events: Vec<ClientEvent>,
    data: Capture,
}

impl Peer {
    fn new(server: SocketAddr, auto_upgrade: bool) -> Self {
        let mut options = ClientOptions::new(server);
        options.auto_upgrade = auto_upgrade;
        let mut client = PairingClient::new(options);
        let data = Capture::default();
        client.set_handler(Box::new(data.clone()));
        Peer {
            client,
            events: Vec::new(),
            data,
        }
    }

    fn step(&mut self) {
        self.client.drive(STEP);
        while let Some(event) = self.client.poll_event() {
            self.events.push(event);
        }
    }

    fn pairing_ready(&self) -> Option<Pairing> {
        self.events.iter().find_map(|e| match e {
            ClientEvent::PairingReady(p) => Some(p.clone()),
            _ => None,
        })
    }

    fn role(&self) -> Option<bool> {
        self.events.iter().find_map(|e| match e {
            ClientEvent::PeerConnected { is_initiator, .. } => Some(*is_initiator),
            _ => None,
        })
    }

    fn saw(&self, wanted: &ClientEvent) -> bool {
        self.events.iter().any(|e| e == wanted)
    }
}

/// Drive both peers until `done` holds or the wait expires
fn drive_until(a: &mut Peer, b: &mut Peer, done: impl Fn(&Peer, &Peer) -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        a.step();
        b.step();
        if done(a, b) {
            return true;
        }
    }
    false
}

fn server_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// initiate on `a`, join on `b` with the issued code, wait for both roles
fn pair(a: &mut Peer, b: &mut Peer) -> Pairing {
    a.client.initiate().unwrap();
    assert!(
        drive_until(a, b, |a, _| a.pairing_ready().is_some()),
        "no pairing issued: {:?}",
        a.events
    );
    let pairing = a.pairing_ready().unwrap();
    assert_eq!(pairing.code.len(), 6);
    assert_eq!(pairing.hash.len(), 64);

    // Let `a` finish registering before `b` arrives
    assert!(drive_until(a, b, |a, _| a
        .saw(&ClientEvent::Registered(pairing.clone()))));

    b.client.join(&pairing.code).unwrap();
    assert!(
        drive_until(a, b, |a, b| a.role().is_some() && b.role().is_some()),
        "peers never connected: a={:?} b={:?}",
        a.events,
        b.events
    );
    pairing
}

#[test]
fn test_pair_and_relay_data() {
    const PORT: u16 = 4441;
    let _server = match ServerProcess::start(PORT) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to start server (expected in some CI environments): {}", e);
            return;
        }
    };

    let mut a = Peer::new(server_addr(PORT), false);
    let mut b = Peer::new(server_addr(PORT), false);
    let pairing = pair(&mut a, &mut b);

    assert_eq!(a.role(), Some(true));
    assert_eq!(b.role(), Some(false));
    assert_eq!(b.pairing_ready(), Some(pairing));
    assert!(a.client.observed_addr().is_some());

    a.client.send(Payload::Binary(vec![1, 2, 3])).unwrap();
    b.client.send(Payload::from("hello")).unwrap();
    assert!(drive_until(&mut a, &mut b, |a, b| {
        !a.data.received().is_empty() && !b.data.received().is_empty()
    }));

    assert_eq!(b.data.received(), vec![Payload::Binary(vec![1, 2, 3])]);
    assert_eq!(a.data.received(), vec![Payload::from("hello")]);
    assert!(!a.client.is_direct());
}

#[test]
fn test_join_with_unknown_code_fails() {
    const PORT: u16 = 4442;
    let _server = match ServerProcess::start(PORT) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to start server (expected in some CI environments): {}", e);
            return;
        }
    };

    let mut a = Peer::new(server_addr(PORT), false);
    let mut b = Peer::new(server_addr(PORT), false);

    // Never issued: generated codes have no leading zero
    a.client.join("000000").unwrap();
    let failed = ClientEvent::ConnectFailed(EndpointError::InvalidCode);
    assert!(drive_until(&mut a, &mut b, |a, _| a.saw(&failed)));
    assert!(!a.client.is_connected());

    // Malformed codes never leave the client
    assert_eq!(b.client.join("12ab"), Err(EndpointError::InvalidCode));
}

#[test]
fn test_close_propagates_to_peer() {
    const PORT: u16 = 4443;
    let _server = match ServerProcess::start(PORT) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to start server (expected in some CI environments): {}", e);
            return;
        }
    };

    let mut a = Peer::new(server_addr(PORT), false);
    let mut b = Peer::new(server_addr(PORT), false);
    pair(&mut a, &mut b);

    a.client.close();
    assert!(
        drive_until(&mut a, &mut b, |_, b| b.saw(&ClientEvent::Closed)),
        "peer not closed: {:?}",
        b.events
    );
    assert!(!b.client.is_connected());
}

#[test]
fn test_resume_stored_pairing() {
    const PORT: u16 = 4444;
    let _server = match ServerProcess::start(PORT) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to start server (expected in some CI environments): {}", e);
            return;
        }
    };

    let mut a = Peer::new(server_addr(PORT), false);
    let mut b = Peer::new(server_addr(PORT), false);
    let pairing = pair(&mut a, &mut b);
    a.client.close();
    assert!(drive_until(&mut a, &mut b, |_, b| b.saw(&ClientEvent::Closed)));

    // Both sides come back with the stored pairing: a fresh lobby entry
    let mut a = Peer::new(server_addr(PORT), false);
    let mut b = Peer::new(server_addr(PORT), false);
    a.client.resume(pairing.clone()).unwrap();
    assert!(drive_until(&mut a, &mut b, |a, _| a
        .saw(&ClientEvent::Registered(pairing.clone()))));
    b.client.resume(pairing.clone()).unwrap();
    assert!(drive_until(&mut a, &mut b, |a, b| a.role().is_some() && b.role().is_some()));
    assert_eq!(a.role(), Some(true));
    assert_eq!(b.role(), Some(false));

    // A forged pairing is refused before registration
    let mut c = Peer::new(server_addr(PORT), false);
    let forged = Pairing::new("000001", pairing.hash.clone());
    c.client.resume(forged).unwrap();
    assert!(drive_until(&mut c, &mut a, |c, _| c
        .events
        .iter()
        .any(|e| matches!(e, ClientEvent::ConnectFailed(EndpointError::PairingUnavailable(_))))));
}

#[test]
fn test_direct_upgrade_on_loopback() {
    const PORT: u16 = 4445;
    let _server = match ServerProcess::start(PORT) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to start server (expected in some CI environments): {}", e);
            return;
        }
    };

    let mut a = Peer::new(server_addr(PORT), true);
    let mut b = Peer::new(server_addr(PORT), true);
    pair(&mut a, &mut b);

    assert!(
        drive_until(&mut a, &mut b, |a, b| {
            a.saw(&ClientEvent::DirectConnected) && b.saw(&ClientEvent::DirectConnected)
        }),
        "direct channel not established: a={:?} b={:?}",
        a.events,
        b.events
    );
    assert!(a.client.is_direct());

    a.client.send(Payload::Binary(vec![7, 8, 9])).unwrap();
    assert!(drive_until(&mut a, &mut b, |_, b| !b.data.received().is_empty()));
    assert_eq!(b.data.received(), vec![Payload::Binary(vec![7, 8, 9])]);
}
