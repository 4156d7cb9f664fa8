//! UDP negotiation engine
//!
//! Reference engine for the direct channel. It does no ICE prioritisation
//! and no TURN; it probes every candidate the peer signalled and takes the
//! first address that answers.
//!
//! # Flow
//!
//! ```text
//! A                                   relay                                  B
//! │── Signal {candidates, token: ta} ──►│──── peer.signal ────────────────►│
//! │◄──────────────── peer.signal ───────│◄── Signal {candidates, token: tb}│
//! │                                                                        │
//! │──────────── Probe {ta} (every probe interval, each candidate) ────────►│
//! │◄─────────── ProbeAck {ta} ─────────────────────────────────────────────│
//! │  Connect                                                      Connect  │
//! │◄═══════════════════ Text / Binary datagrams ══════════════════════════►│
//! ```
//!
//! A probe is only answered when its token matches the token the peer
//! signalled, so stray datagrams cannot hijack the channel.

use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::candidate::{gather_candidates, Candidate};
use super::engine::{EngineError, EngineEvent, EngineFactory, EngineOptions, NegotiationEngine};
use crate::framing::Payload;

// ============================================================================
// Constants
// ============================================================================

/// Largest application payload carried in one datagram
pub const MAX_DIRECT_PAYLOAD: usize = 60_000;

/// How often the socket is polled once the channel is live
pub const DIRECT_POLL_INTERVAL: Duration = Duration::from_millis(20);

// ============================================================================
// Wire Format
// ============================================================================

/// Datagrams exchanged on the direct channel (bincode)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datagram {
    /// Reachability probe carrying the sender's token
    Probe { token: u64 },
    /// Answer to a probe, echoing its token
    ProbeAck { token: u64 },
    Text(String),
    Binary(Vec<u8>),
    Close,
}

pub fn encode_datagram(datagram: &Datagram) -> Result<Vec<u8>, EngineError> {
    bincode::serialize(datagram).map_err(|e| EngineError::Encode(e.to_string()))
}

pub fn decode_datagram(data: &[u8]) -> Option<Datagram> {
    bincode::deserialize(data).ok()
}

/// Negotiation payload carried through the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSignal {
    pub candidates: Vec<String>,
    pub token: u64,
}

// ============================================================================
// Engine State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    /// Own candidates signalled, waiting for the peer's
    Waiting,
    /// Probing peer candidates
    Probing,
    Connected,
    Closed,
}

/// UDP reference engine
#[derive(Debug)]
pub struct UdpEngine {
    socket: UdpSocket,
    state: EngineState,
    initiator: bool,
    /// Token this side puts in its probes
    token: u64,
    /// Token the peer signalled
    peer_token: Option<u64>,
    /// Addresses to probe
    peer_candidates: Vec<SocketAddr>,
    /// Peer address data is sent to (first confirmed address)
    remote: Option<SocketAddr>,
    /// Addresses that proved knowledge of a token; data is accepted from these
    verified: Vec<SocketAddr>,
    probe_interval: Duration,
    negotiation_timeout: Duration,
    /// Set on the first drive
    deadline: Option<Instant>,
    /// None = probe on the next drive
    next_probe: Option<Instant>,
    events: VecDeque<EngineEvent>,
}

impl UdpEngine {
    /// Bind a socket, gather candidates and queue the outbound signal
    pub fn new(options: EngineOptions) -> Result<Self, EngineError> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        let local_port = socket.local_addr()?.port();

        let mut token_bytes = [0u8; 8];
        SystemRandom::new()
            .fill(&mut token_bytes)
            .map_err(|_| EngineError::Io("system random unavailable".to_string()))?;
        let token = u64::from_be_bytes(token_bytes);

        let candidates = gather_candidates(local_port, options.observed_addr, &options.config);
        log::info!(
            "UDP engine on port {} ({}) with {} candidates",
            local_port,
            if options.initiator { "initiator" } else { "joiner" },
            candidates.len()
        );
        for candidate in &candidates {
            log::debug!("  candidate {}", candidate);
        }

        let mut engine = Self {
            socket,
            state: EngineState::Waiting,
            initiator: options.initiator,
            token,
            peer_token: None,
            peer_candidates: Vec::new(),
            remote: None,
            verified: Vec::new(),
            probe_interval: options.config.probe_interval(),
            negotiation_timeout: options.config.negotiation_timeout(),
            deadline: None,
            next_probe: None,
            events: VecDeque::new(),
        };
        engine.events.push_back(EngineEvent::Signal(engine.candidate_signal(&candidates)));
        Ok(engine)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, EngineError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    fn candidate_signal(&self, candidates: &[Candidate]) -> Value {
        let signal = CandidateSignal {
            candidates: candidates.iter().map(|c| c.address.to_string()).collect(),
            token: self.token,
        };
        serde_json::to_value(signal).unwrap_or_default()
    }

    fn send_datagram(&self, datagram: &Datagram, to: SocketAddr) {
        let bytes = match encode_datagram(datagram) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to encode datagram: {}", e);
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, to) {
            // Unreachable candidates are expected while probing
            log::trace!("send_to {} failed: {}", to, e);
        }
    }

    fn mark_connected(&mut self, addr: SocketAddr) {
        if !self.verified.contains(&addr) {
            self.verified.push(addr);
        }
        if self.state == EngineState::Connected || self.state == EngineState::Closed {
            return;
        }
        log::info!("Direct path established with {}", addr);
        self.state = EngineState::Connected;
        self.remote = Some(addr);
        self.events.push_back(EngineEvent::Connect);
    }

    fn fail(&mut self, error: EngineError) {
        log::warn!("UDP engine failed: {}", error);
        self.state = EngineState::Closed;
        self.events.push_back(EngineEvent::Error(error));
    }

    fn handle_datagram(&mut self, datagram: Datagram, from: SocketAddr) {
        match datagram {
            Datagram::Probe { token } => {
                if self.peer_token != Some(token) {
                    log::trace!("Ignoring probe with unknown token from {}", from);
                    return;
                }
                self.send_datagram(&Datagram::ProbeAck { token }, from);
                self.mark_connected(from);
            }
            Datagram::ProbeAck { token } => {
                if token == self.token {
                    self.mark_connected(from);
                }
            }
            Datagram::Text(text) if self.verified.contains(&from) => {
                self.events.push_back(EngineEvent::Data(Payload::Text(text)));
            }
            Datagram::Binary(data) if self.verified.contains(&from) => {
                self.events.push_back(EngineEvent::Data(Payload::Binary(data)));
            }
            Datagram::Close if self.verified.contains(&from) => {
                log::info!("Peer closed direct channel");
                self.state = EngineState::Closed;
                self.events.push_back(EngineEvent::Close);
            }
            _ => log::trace!("Ignoring datagram from unconfirmed address {}", from),
        }
    }

    fn recv_all(&mut self) {
        let mut buf = vec![0u8; 65_535];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, from)) => match decode_datagram(&buf[..len]) {
                    Some(datagram) => self.handle_datagram(datagram, from),
                    None => log::trace!("Undecodable datagram from {}", from),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                // ICMP port unreachable surfaces as ConnectionReset on some platforms
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => continue,
                Err(e) => {
                    self.fail(EngineError::Io(e.to_string()));
                    break;
                }
            }
            if self.state == EngineState::Closed {
                break;
            }
        }
    }
}

impl NegotiationEngine for UdpEngine {
    fn signal(&mut self, payload: Value) {
        let signal: CandidateSignal = match serde_json::from_value(payload) {
            Ok(signal) => signal,
            Err(e) => {
                log::debug!("Ignoring malformed candidate signal: {}", e);
                return;
            }
        };

        let addrs: Vec<SocketAddr> = signal
            .candidates
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        log::info!("Received {} peer candidates", addrs.len());

        self.peer_token = Some(signal.token);
        for addr in addrs {
            if !self.peer_candidates.contains(&addr) {
                self.peer_candidates.push(addr);
            }
        }
        if self.state == EngineState::Waiting {
            self.state = EngineState::Probing;
            self.next_probe = None;
        }
    }

    fn send(&mut self, payload: &Payload) -> Result<(), EngineError> {
        let remote = match (self.state, self.remote) {
            (EngineState::Connected, Some(remote)) => remote,
            _ => return Err(EngineError::NotConnected),
        };
        if payload.len() > MAX_DIRECT_PAYLOAD {
            return Err(EngineError::TooLarge(payload.len()));
        }

        let datagram = match payload {
            Payload::Text(text) => Datagram::Text(text.clone()),
            Payload::Binary(data) => Datagram::Binary(data.clone()),
        };
        let bytes = encode_datagram(&datagram)?;
        match self.socket.send_to(&bytes, remote) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                log::debug!("Direct socket busy, datagram dropped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn destroy(&mut self) {
        if let (EngineState::Connected, Some(remote)) = (self.state, self.remote) {
            self.send_datagram(&Datagram::Close, remote);
        }
        self.state = EngineState::Closed;
        self.events.clear();
    }

    fn drive(&mut self, now: Instant) {
        if self.state == EngineState::Closed {
            return;
        }
        let deadline = *self.deadline.get_or_insert(now + self.negotiation_timeout);

        self.recv_all();

        match self.state {
            EngineState::Waiting | EngineState::Probing if now >= deadline => {
                self.fail(EngineError::Timeout);
            }
            EngineState::Probing if self.next_probe.map_or(true, |at| now >= at) => {
                let probe = Datagram::Probe { token: self.token };
                for &addr in &self.peer_candidates {
                    self.send_datagram(&probe, addr);
                }
                self.next_probe = Some(now + self.probe_interval);
            }
            _ => {}
        }
    }

    fn poll_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    fn timeout(&self, now: Instant) -> Option<Duration> {
        match self.state {
            EngineState::Closed => None,
            EngineState::Connected => Some(DIRECT_POLL_INTERVAL),
            EngineState::Waiting | EngineState::Probing => {
                let mut wait = DIRECT_POLL_INTERVAL;
                if let Some(at) = self.next_probe {
                    wait = wait.min(at.saturating_duration_since(now));
                }
                if let Some(at) = self.deadline {
                    wait = wait.min(at.saturating_duration_since(now));
                }
                Some(wait)
            }
        }
    }
}

/// Factory producing `UdpEngine`s
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpEngineFactory;

impl EngineFactory for UdpEngineFactory {
    fn create(&self, options: EngineOptions) -> Result<Box<dyn NegotiationEngine>, EngineError> {
        Ok(Box::new(UdpEngine::new(options)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::DirectConfig;
    use serde_json::json;

    fn loopback_options(initiator: bool) -> EngineOptions {
        EngineOptions {
            initiator,
            config: DirectConfig {
                probe_interval_ms: 10,
                ..DirectConfig::default()
            },
            observed_addr: None,
        }
    }

    fn take_signal(engine: &mut UdpEngine) -> Value {
        match engine.poll_event() {
            Some(EngineEvent::Signal(signal)) => signal,
            other => panic!("expected signal, got {:?}", other),
        }
    }

    /// Drive both engines until `done` or two seconds pass
    fn pump(a: &mut UdpEngine, b: &mut UdpEngine, mut done: impl FnMut(&EngineEvent, bool) -> bool) {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            let now = Instant::now();
            a.drive(now);
            b.drive(now);
            let mut finished = false;
            while let Some(event) = a.poll_event() {
                finished |= done(&event, true);
            }
            while let Some(event) = b.poll_event() {
                finished |= done(&event, false);
            }
            if finished {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("engines did not reach the expected state");
    }

    #[test]
    fn test_datagram_codec() {
        let datagram = Datagram::Binary(vec![1, 2, 3]);
        let bytes = encode_datagram(&datagram).unwrap();
        assert_eq!(decode_datagram(&bytes), Some(datagram));
        assert_eq!(decode_datagram(&[0xff, 0xff, 0xff, 0xff]), None);
    }

    #[test]
    fn test_signal_lists_loopback_candidate() {
        let mut engine = UdpEngine::new(loopback_options(true)).unwrap();
        let port = engine.local_addr().unwrap().port();
        let signal: CandidateSignal = serde_json::from_value(take_signal(&mut engine)).unwrap();
        assert!(signal.candidates.contains(&format!("127.0.0.1:{}", port)));
    }

    #[test]
    fn test_send_before_connect() {
        let mut engine = UdpEngine::new(loopback_options(true)).unwrap();
        assert_eq!(
            engine.send(&Payload::Text("x".to_string())),
            Err(EngineError::NotConnected)
        );
    }

    #[test]
    fn test_malformed_signal_is_ignored() {
        let mut engine = UdpEngine::new(loopback_options(false)).unwrap();
        take_signal(&mut engine);
        engine.signal(json!({ "sdp": "v=0" }));
        assert_eq!(engine.state, EngineState::Waiting);
    }

    #[test]
    fn test_timeout_without_peer() {
        let mut options = loopback_options(true);
        options.config.negotiation_timeout_ms = 0;
        let mut engine = UdpEngine::new(options).unwrap();
        take_signal(&mut engine);

        engine.drive(Instant::now());
        assert_eq!(engine.poll_event(), Some(EngineEvent::Error(EngineError::Timeout)));
        assert_eq!(engine.timeout(Instant::now()), None);
    }

    #[test]
    fn test_loopback_connect_and_exchange() {
        let mut a = UdpEngine::new(loopback_options(true)).unwrap();
        let mut b = UdpEngine::new(loopback_options(false)).unwrap();
        let signal_a = take_signal(&mut a);
        let signal_b = take_signal(&mut b);
        a.signal(signal_b);
        b.signal(signal_a);

        let (mut a_up, mut b_up) = (false, false);
        pump(&mut a, &mut b, |event, is_a| {
            if *event == EngineEvent::Connect {
                if is_a {
                    a_up = true;
                } else {
                    b_up = true;
                }
            }
            a_up && b_up
        });

        a.send(&Payload::Binary(vec![1, 2, 3])).unwrap();
        let mut received = None;
        pump(&mut a, &mut b, |event, is_a| {
            if let (false, EngineEvent::Data(payload)) = (is_a, event) {
                received = Some(payload.clone());
            }
            received.is_some()
        });
        assert_eq!(received, Some(Payload::Binary(vec![1, 2, 3])));

        a.destroy();
        let mut closed = false;
        pump(&mut a, &mut b, |event, is_a| {
            closed |= !is_a && *event == EngineEvent::Close;
            closed
        });
    }
}
