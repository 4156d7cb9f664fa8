//! Pairing client
//!
//! Orchestrates one endpoint of a pairing: credential requests, relayed
//! handshake, optional upgrade to the direct channel, and teardown.
//!
//! # Flow
//!
//! ```text
//! initiate() ─► code.get ──────► code.issued ─────┐
//! join(code) ─► code.validate ─► code.claimed ────┼─► client.register ─► HANDSHAKE_SUCCESS
//! resume(p)  ─► pairing.validate ► pairing.validated ┘                        │
//!                                                                  peer.connected {isInitiator}
//!                                                                             │
//!                                                  upgrade(is_initiator) ◄────┘ (auto_upgrade)
//!                                                  peer.signal ⇄ relay ⇄ peer
//!                                                  direct channel live: send() prefers it
//! ```
//!
//! The client is polled: call `drive` in a loop and drain `poll_event`.
//!
//! Every operation ends in an event. The credential request is bounded by
//! the handshake timeout, and losing the transport during it reports
//! `ConnectFailed` just like a failed handshake.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::connection::{ConnectionEvent, DataHandler, LoggingHandler};
use crate::control::InternalEvent;
use crate::direct::DirectEndpoint;
use crate::error::EndpointError;
use crate::framing::Payload;
use crate::p2p::{DirectConfig, EngineFactory, UdpEngineFactory};
use crate::pairing::{code_is_valid, Pairing};
use crate::relayed::{RelayedEndpoint, Transmit, HANDSHAKE_TIMEOUT};
use crate::transport::RelayTransport;

// ============================================================================
// Options / Events
// ============================================================================

/// Client options
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Rendezvous server address
    pub server_addr: SocketAddr,
    /// Start the direct channel as soon as the peer is connected
    pub auto_upgrade: bool,
    /// Origin announced to the broker
    pub origin: Option<String>,
    /// Bound on the relay handshake
    pub handshake_timeout: Duration,
}

impl ClientOptions {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            auto_upgrade: true,
            origin: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

/// Events surfaced to the application
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A usable pairing was obtained (issued, claimed or revalidated)
    PairingReady(Pairing),
    /// Registered with the broker, waiting for the peer
    Registered(Pairing),
    /// Credential request or handshake failed
    ConnectFailed(EndpointError),
    /// The peer joined; role assigned by the broker
    PeerConnected { is_initiator: bool, pairing: Pairing },
    /// Direct channel is live
    DirectConnected,
    /// Direct channel could not be established
    DirectFailed(EndpointError),
    /// Direct channel closed
    DirectClosed,
    Error(EndpointError),
    /// Relayed channel closed (both channels are down)
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Idle,
    RequestingPairing,
    ClaimingCode,
    ValidatingStored(Pairing),
    Registering,
    Registered,
}

// ============================================================================
// Pairing Client
// ============================================================================

/// One endpoint of a pairing
pub struct PairingClient {
    options: ClientOptions,
    transport: Option<RelayTransport>,
    /// Transport establishment has been reported to the relay endpoint
    transport_announced: bool,
    relay: RelayedEndpoint,
    direct: DirectEndpoint,
    handler: Box<dyn DataHandler>,
    phase: Phase,
    /// Bound on the credential request (code.get / code.validate /
    /// pairing.validate); the relay takes over once registering
    request_deadline: Option<Instant>,
    events: VecDeque<ClientEvent>,
}

impl std::fmt::Debug for PairingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingClient")
            .field("server_addr", &self.options.server_addr)
            .field("phase", &self.phase)
            .field("relay", &self.relay.state())
            .field("direct", &self.direct.state())
            .finish()
    }
}

impl PairingClient {
    /// Client using the UDP reference engine for the direct channel
    pub fn new(options: ClientOptions) -> Self {
        Self::with_engine_factory(options, Box::new(UdpEngineFactory))
    }

    pub fn with_engine_factory(options: ClientOptions, factory: Box<dyn EngineFactory>) -> Self {
        let relay = RelayedEndpoint::new(options.handshake_timeout, options.origin.clone());
        Self {
            options,
            transport: None,
            transport_announced: false,
            relay,
            direct: DirectEndpoint::new(factory, DirectConfig::default()),
            handler: Box::new(LoggingHandler),
            phase: Phase::Idle,
            request_deadline: None,
            events: VecDeque::new(),
        }
    }

    /// Install the handler for inbound application data
    pub fn set_handler(&mut self, handler: Box<dyn DataHandler>) {
        self.handler = handler;
    }

    pub fn is_connected(&self) -> bool {
        self.relay.is_connected()
    }

    pub fn is_direct(&self) -> bool {
        self.direct.is_connected()
    }

    pub fn pairing(&self) -> Option<&Pairing> {
        self.relay.pairing()
    }

    pub fn observed_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().and_then(RelayTransport::observed_addr)
    }

    pub fn poll_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    // ========================================================================
    // Pairing Operations
    // ========================================================================

    /// Request a fresh pairing and register with it
    pub fn initiate(&mut self) -> Result<(), EndpointError> {
        self.begin()?;
        log::info!("Requesting a new pairing");
        self.relay.send_internal(InternalEvent::CodeGet);
        self.phase = Phase::RequestingPairing;
        self.pump_outbox();
        Ok(())
    }

    /// Claim the peer's code and register with the resulting pairing
    pub fn join(&mut self, code: &str) -> Result<(), EndpointError> {
        if !code_is_valid(code) {
            return Err(EndpointError::InvalidCode);
        }
        self.begin()?;
        log::info!("Claiming code {}", code);
        self.relay
            .send_internal(InternalEvent::CodeValidate(Some(code.to_string())));
        self.phase = Phase::ClaimingCode;
        self.pump_outbox();
        Ok(())
    }

    /// Revalidate a stored pairing and register with it
    pub fn resume(&mut self, pairing: Pairing) -> Result<(), EndpointError> {
        self.begin()?;
        log::info!("Validating stored pairing {}", pairing.code);
        self.relay
            .send_internal(InternalEvent::PairingValidate(Some(pairing.clone())));
        self.phase = Phase::ValidatingStored(pairing);
        self.pump_outbox();
        Ok(())
    }

    /// Common preamble: refuse while busy, open the transport, fetch config
    fn begin(&mut self) -> Result<(), EndpointError> {
        if self.relay.is_connected() || self.phase != Phase::Idle {
            return Err(EndpointError::AlreadyConnected);
        }
        self.ensure_transport()?;
        self.request_deadline = Some(Instant::now() + self.options.handshake_timeout);
        self.relay.send_internal(InternalEvent::ConfigGet);
        Ok(())
    }

    /// Reuse a live transport; anything closing or draining is replaced
    fn ensure_transport(&mut self) -> Result<(), EndpointError> {
        if let Some(transport) = &self.transport {
            if !transport.is_closing() {
                return Ok(());
            }
        }
        let transport = RelayTransport::connect(self.options.server_addr)
            .map_err(|e| EndpointError::Transport(e.to_string()))?;
        self.transport = Some(transport);
        self.transport_announced = false;
        Ok(())
    }

    fn register(&mut self, pairing: Pairing, now: Instant) {
        self.phase = Phase::Registering;
        self.request_deadline = None;
        self.events.push_back(ClientEvent::PairingReady(pairing.clone()));
        self.relay.connect(pairing, now);
    }

    // ========================================================================
    // Data / Upgrade / Close
    // ========================================================================

    /// Send application data, preferring the direct channel
    pub fn send(&mut self, payload: Payload) -> Result<(), EndpointError> {
        if self.direct.is_connected() {
            match self.direct.send(payload.clone()) {
                Ok(()) => return Ok(()),
                Err(EndpointError::ReservedPrefix) => return Err(EndpointError::ReservedPrefix),
                Err(e) => log::warn!("Direct send failed ({}), using relay", e),
            }
        }
        self.relay.send(payload)?;
        self.pump_outbox();
        Ok(())
    }

    /// Start the direct channel with the role the broker assigned
    pub fn upgrade(&mut self, is_initiator: bool) -> Result<(), EndpointError> {
        if !self.relay.is_connected() {
            return Err(EndpointError::NotConnected);
        }
        self.direct.set_observed_addr(self.observed_addr());
        self.direct.connect(is_initiator)
    }

    /// Close both channels
    pub fn close(&mut self) {
        self.direct.close();
        self.relay.close();
        self.phase = Phase::Idle;
        self.request_deadline = None;
        self.process_events(Instant::now());
        self.pump_outbox();
        // A transport still in its QUIC handshake has no relay-level close
        if let Some(transport) = self.transport.as_mut() {
            if !transport.is_closed() {
                transport.close("client closed");
            }
        }
    }

    // ========================================================================
    // Event Loop Step
    // ========================================================================

    /// One loop step: wait up to `max_wait` for I/O or the next timer, then
    /// process everything that happened.
    pub fn drive(&mut self, max_wait: Duration) {
        let now = Instant::now();
        let mut wait = max_wait;
        let request = self
            .request_deadline
            .map(|at| at.saturating_duration_since(now));
        for t in [self.relay.timeout(now), self.direct.timeout(now), request]
            .into_iter()
            .flatten()
        {
            wait = wait.min(t);
        }

        match self.transport.as_mut() {
            Some(transport) => {
                if let Err(e) = transport.wait(wait) {
                    log::warn!("Relay transport error: {}", e);
                    self.on_transport_lost(Some(e.to_string()));
                }
            }
            None => std::thread::sleep(wait),
        }

        let now = Instant::now();
        self.read_transport(now);
        self.check_request_deadline(now);
        self.relay.on_timeout(now);
        self.direct.drive(now, self.handler.as_mut());
        self.process_events(now);
        self.pump_outbox();
    }

    fn read_transport(&mut self, now: Instant) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };

        if transport.is_established() && !self.transport_announced {
            self.transport_announced = true;
            self.relay.on_transport_open();
        }

        while let Some(payload) = transport.recv_payload() {
            self.relay.on_payload(payload, now, self.handler.as_mut());
        }

        if transport.is_closed() {
            match transport.peer_error() {
                Some(reason) => log::info!("Relay connection closed by server: {}", reason),
                None => log::info!("Relay connection closed"),
            }
            self.on_transport_lost(None);
        }
    }

    /// The relay transport is gone (`error` is None for an orderly close)
    fn on_transport_lost(&mut self, error: Option<String>) {
        self.transport = None;
        match error {
            Some(message) => self.relay.on_transport_error(message),
            None => self.relay.on_transport_closed(),
        }
        // The relay only knows about the handshake; a credential request
        // in flight fails here
        if self.is_requesting() {
            self.fail_request(EndpointError::ConnectionFailed);
        }
    }

    fn is_requesting(&self) -> bool {
        matches!(
            self.phase,
            Phase::RequestingPairing | Phase::ClaimingCode | Phase::ValidatingStored(_)
        )
    }

    fn check_request_deadline(&mut self, now: Instant) {
        let Some(deadline) = self.request_deadline else {
            return;
        };
        if now < deadline || !self.is_requesting() {
            return;
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close("request timed out");
        }
        self.relay.on_transport_closed();
        self.fail_request(EndpointError::TimedOut);
    }

    fn fail_request(&mut self, error: EndpointError) {
        log::warn!("Pairing request failed in phase {:?}: {}", self.phase, error);
        self.phase = Phase::Idle;
        self.request_deadline = None;
        self.events.push_back(ClientEvent::ConnectFailed(error));
    }

    fn process_events(&mut self, now: Instant) {
        // Either endpoint may close the other; drain until both are quiet
        loop {
            let mut handled = false;
            while let Some(event) = self.relay.poll_event() {
                handled = true;
                self.handle_relay_event(event, now);
            }
            while let Some(event) = self.direct.poll_event() {
                handled = true;
                self.handle_direct_event(event);
            }
            if !handled {
                break;
            }
        }

        while let Some(signal) = self.direct.poll_signal() {
            if let Err(e) = self.relay.send_signal(signal) {
                log::debug!("Signal not relayed: {}", e);
            }
        }
    }

    fn handle_direct_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Established => self.events.push_back(ClientEvent::DirectConnected),
            ConnectionEvent::ConnectFailed(e) => {
                log::warn!("Direct channel failed, staying on relay: {}", e);
                self.events.push_back(ClientEvent::DirectFailed(e));
            }
            ConnectionEvent::Error(EndpointError::PeerTimedOut) => {
                log::warn!("Peer silent on the direct channel, closing both channels");
                self.events
                    .push_back(ClientEvent::Error(EndpointError::PeerTimedOut));
                self.relay.close();
            }
            ConnectionEvent::Error(e) => self.events.push_back(ClientEvent::Error(e)),
            ConnectionEvent::Closed => self.events.push_back(ClientEvent::DirectClosed),
            ConnectionEvent::AlreadyConnected => log::debug!("Direct channel already connected"),
            ConnectionEvent::Internal(event) => {
                log::debug!("Ignoring {:?} on direct channel", event)
            }
        }
    }

    fn handle_relay_event(&mut self, event: ConnectionEvent, now: Instant) {
        match event {
            ConnectionEvent::Established => {
                self.phase = Phase::Registered;
                if let Some(pairing) = self.relay.pairing().cloned() {
                    log::info!("Registered with pairing {}, waiting for peer", pairing.code);
                    self.events.push_back(ClientEvent::Registered(pairing));
                }
            }
            ConnectionEvent::ConnectFailed(e) => {
                self.phase = Phase::Idle;
                self.events.push_back(ClientEvent::ConnectFailed(e));
            }
            ConnectionEvent::AlreadyConnected => log::debug!("Relay already connected"),
            ConnectionEvent::Error(e) => self.events.push_back(ClientEvent::Error(e)),
            ConnectionEvent::Closed => {
                self.phase = Phase::Idle;
                self.direct.close();
                self.events.push_back(ClientEvent::Closed);
            }
            ConnectionEvent::Internal(event) => self.handle_internal(event, now),
        }
    }

    fn handle_internal(&mut self, event: InternalEvent, now: Instant) {
        match (event, self.phase.clone()) {
            (InternalEvent::Config(blob), _) => {
                self.direct.set_config(DirectConfig::from_value(&blob));
            }
            (InternalEvent::CodeIssued(pairing), Phase::RequestingPairing) => {
                log::info!("Pairing issued: code {}", pairing.code);
                self.register(pairing, now);
            }
            (InternalEvent::CodeError(message), Phase::RequestingPairing) => {
                self.fail_request(EndpointError::PairingUnavailable(message));
            }
            (InternalEvent::CodeClaimed(Some(pairing)), Phase::ClaimingCode) => {
                self.register(pairing, now);
            }
            (InternalEvent::CodeClaimed(None), Phase::ClaimingCode) => {
                self.fail_request(EndpointError::InvalidCode);
            }
            (InternalEvent::PairingValidated(true), Phase::ValidatingStored(pairing)) => {
                self.register(pairing, now);
            }
            (InternalEvent::PairingValidated(false), Phase::ValidatingStored(_)) => {
                self.fail_request(EndpointError::PairingUnavailable(
                    "stored pairing is no longer valid".to_string(),
                ));
            }
            (
                InternalEvent::PeerConnected {
                    is_initiator,
                    pairing,
                },
                _,
            ) => {
                self.events.push_back(ClientEvent::PeerConnected {
                    is_initiator,
                    pairing,
                });
                if self.options.auto_upgrade {
                    if let Err(e) = self.upgrade(is_initiator) {
                        log::warn!("Direct channel not started: {}", e);
                    }
                }
            }
            (InternalEvent::PeerSignal(signal), _) => self.direct.signal(signal),
            (event, phase) => log::debug!("Ignoring {:?} in phase {:?}", event, phase),
        }
    }

    /// Move queued relay frames into the transport
    fn pump_outbox(&mut self) {
        while let Some(transmit) = self.relay.poll_transmit() {
            let Some(transport) = self.transport.as_mut() else {
                log::debug!("No relay transport, dropping {:?}", transmit);
                continue;
            };
            match transmit {
                Transmit::Payload(payload) => {
                    if let Err(e) = transport.send_payload(&payload) {
                        log::warn!("Relay send failed: {}", e);
                    }
                }
                Transmit::Close => transport.close("client closed"),
            }
        }
        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.flush() {
                log::debug!("Relay flush failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::HANDSHAKE_SUCCESS;
    use crate::keepalive::PEER_TIMEOUT;
    use crate::p2p::{EngineError, EngineEvent, EngineOptions, NegotiationEngine};
    use serde_json::Value;
    use std::cell::RefCell;
    use std::net::UdpSocket;
    use std::rc::Rc;

    /// Direct-channel engine driven by the test
    #[derive(Default)]
    struct Script {
        sent: Vec<Payload>,
        pending: VecDeque<EngineEvent>,
        fail_send: bool,
        destroyed: bool,
    }

    struct ScriptedEngine(Rc<RefCell<Script>>);

    impl NegotiationEngine for ScriptedEngine {
        fn signal(&mut self, _payload: Value) {}

        fn send(&mut self, payload: &Payload) -> Result<(), EngineError> {
            let mut script = self.0.borrow_mut();
            if script.fail_send {
                return Err(EngineError::Io("host unreachable".to_string()));
            }
            script.sent.push(payload.clone());
            Ok(())
        }

        fn destroy(&mut self) {
            self.0.borrow_mut().destroyed = true;
        }

        fn drive(&mut self, _now: Instant) {}

        fn poll_event(&mut self) -> Option<EngineEvent> {
            self.0.borrow_mut().pending.pop_front()
        }

        fn timeout(&self, _now: Instant) -> Option<Duration> {
            None
        }
    }

    fn scripted_client() -> (PairingClient, Rc<RefCell<Script>>) {
        let script = Rc::new(RefCell::new(Script::default()));
        let handle = script.clone();
        let factory = move |_: EngineOptions| -> Result<Box<dyn NegotiationEngine>, EngineError> {
            Ok(Box::new(ScriptedEngine(handle.clone())))
        };
        let mut options = ClientOptions::new("127.0.0.1:9".parse().unwrap());
        options.auto_upgrade = false;
        (PairingClient::with_engine_factory(options, Box::new(factory)), script)
    }

    fn sample_pairing() -> Pairing {
        Pairing::new("482913", "c".repeat(64))
    }

    fn events(client: &mut PairingClient) -> Vec<ClientEvent> {
        std::iter::from_fn(|| client.poll_event()).collect()
    }

    /// Complete the relay handshake without a transport
    fn register_relay(client: &mut PairingClient, now: Instant) {
        client.phase = Phase::Registering;
        client.relay.connect(sample_pairing(), now);
        client
            .relay
            .on_payload(Payload::from(HANDSHAKE_SUCCESS), now, &mut LoggingHandler);
        client.process_events(now);
        assert!(client.is_connected());
    }

    /// Registered client whose direct channel is live
    fn direct_client(now: Instant) -> (PairingClient, Rc<RefCell<Script>>) {
        let (mut client, script) = scripted_client();
        register_relay(&mut client, now);
        client.upgrade(true).unwrap();
        script.borrow_mut().pending.push_back(EngineEvent::Connect);
        client.direct.drive(now, client.handler.as_mut());
        client.process_events(now);
        assert!(client.is_direct());
        events(&mut client);
        (client, script)
    }

    #[test]
    fn test_code_error_fails_initiate() {
        let (mut client, _) = scripted_client();
        client.phase = Phase::RequestingPairing;
        client.request_deadline = Some(Instant::now() + HANDSHAKE_TIMEOUT);

        client.handle_internal(InternalEvent::CodeError("store unavailable".to_string()), Instant::now());
        assert_eq!(
            events(&mut client),
            vec![ClientEvent::ConnectFailed(EndpointError::PairingUnavailable(
                "store unavailable".to_string()
            ))]
        );
        assert_eq!(client.phase, Phase::Idle);
        assert_eq!(client.request_deadline, None);
    }

    #[test]
    fn test_unknown_code_fails_join() {
        let (mut client, _) = scripted_client();
        client.phase = Phase::ClaimingCode;
        client.handle_internal(InternalEvent::CodeClaimed(None), Instant::now());
        assert_eq!(
            events(&mut client),
            vec![ClientEvent::ConnectFailed(EndpointError::InvalidCode)]
        );
        assert_eq!(client.phase, Phase::Idle);
    }

    #[test]
    fn test_issued_code_moves_to_registering() {
        let (mut client, _) = scripted_client();
        client.phase = Phase::RequestingPairing;
        client.request_deadline = Some(Instant::now() + HANDSHAKE_TIMEOUT);

        client.handle_internal(InternalEvent::CodeIssued(sample_pairing()), Instant::now());
        assert_eq!(events(&mut client), vec![ClientEvent::PairingReady(sample_pairing())]);
        assert_eq!(client.phase, Phase::Registering);
        assert_eq!(client.request_deadline, None);
        assert!(client.relay.is_handshaking());
    }

    #[test]
    fn test_transport_loss_during_request_is_reported() {
        let (mut client, _) = scripted_client();
        client.phase = Phase::ClaimingCode;
        client.request_deadline = Some(Instant::now() + HANDSHAKE_TIMEOUT);

        client.on_transport_lost(Some("connection reset".to_string()));
        assert_eq!(
            events(&mut client),
            vec![ClientEvent::ConnectFailed(EndpointError::ConnectionFailed)]
        );
        assert_eq!(client.phase, Phase::Idle);

        // Orderly close while validating a stored pairing
        client.phase = Phase::ValidatingStored(sample_pairing());
        client.on_transport_lost(None);
        assert_eq!(
            events(&mut client),
            vec![ClientEvent::ConnectFailed(EndpointError::ConnectionFailed)]
        );
    }

    #[test]
    fn test_request_deadline() {
        let (mut client, _) = scripted_client();
        let t0 = Instant::now();
        client.phase = Phase::ValidatingStored(sample_pairing());
        client.request_deadline = Some(t0 + Duration::from_secs(1));

        client.check_request_deadline(t0);
        assert!(events(&mut client).is_empty());

        client.check_request_deadline(t0 + Duration::from_secs(1));
        assert_eq!(
            events(&mut client),
            vec![ClientEvent::ConnectFailed(EndpointError::TimedOut)]
        );
        assert_eq!(client.phase, Phase::Idle);
    }

    #[test]
    fn test_initiate_times_out_against_silent_server() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut options = ClientOptions::new(silent.local_addr().unwrap());
        options.auto_upgrade = false;
        options.handshake_timeout = Duration::from_millis(100);
        let mut client = PairingClient::new(options);

        client.initiate().unwrap();
        assert_eq!(client.initiate(), Err(EndpointError::AlreadyConnected));

        let failed = ClientEvent::ConnectFailed(EndpointError::TimedOut);
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut seen = Vec::new();
        while Instant::now() < deadline && !seen.contains(&failed) {
            client.drive(Duration::from_millis(10));
            seen.extend(events(&mut client));
        }
        assert!(seen.contains(&failed), "no failure reported: {:?}", seen);
        assert_eq!(client.phase, Phase::Idle);

        // Free to try again
        client.initiate().unwrap();
    }

    #[test]
    fn test_initiate_after_close_uses_fresh_transport() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut client = PairingClient::new(ClientOptions::new(silent.local_addr().unwrap()));

        client.initiate().unwrap();
        client.close();
        assert!(client.transport.as_ref().map_or(true, RelayTransport::is_closing));

        client.initiate().unwrap();
        let transport = client.transport.as_ref().unwrap();
        assert!(!transport.is_closing());
        assert!(!client.transport_announced);
    }

    #[test]
    fn test_relay_close_tears_down_direct() {
        let (mut client, script) = direct_client(Instant::now());

        client.on_transport_lost(None);
        client.process_events(Instant::now());

        assert_eq!(
            events(&mut client),
            vec![ClientEvent::Closed, ClientEvent::DirectClosed]
        );
        assert!(!client.is_direct());
        assert!(script.borrow().destroyed);
    }

    #[test]
    fn test_direct_peer_timeout_closes_both_channels() {
        let t0 = Instant::now();
        let (mut client, script) = direct_client(t0);

        let later = t0 + PEER_TIMEOUT;
        client.direct.drive(later, client.handler.as_mut());
        client.process_events(later);

        let seen = events(&mut client);
        assert!(seen.contains(&ClientEvent::Error(EndpointError::PeerTimedOut)));
        assert!(seen.contains(&ClientEvent::DirectClosed));
        assert!(seen.contains(&ClientEvent::Closed));
        assert!(!client.is_direct());
        assert!(!client.is_connected());
        assert!(script.borrow().destroyed);
    }

    #[test]
    fn test_send_falls_back_to_relay() {
        let (mut client, script) = direct_client(Instant::now());

        client.send(Payload::Binary(vec![1])).unwrap();
        assert_eq!(script.borrow().sent, vec![Payload::Binary(vec![1])]);

        script.borrow_mut().fail_send = true;
        assert_eq!(client.send(Payload::Binary(vec![2])), Ok(()));
        assert_eq!(script.borrow().sent.len(), 1);

        // The control prefix is refused outright, not retried on the relay
        assert_eq!(
            client.send(Payload::Text("§x".to_string())),
            Err(EndpointError::ReservedPrefix)
        );

        client.relay.close();
        assert_eq!(
            client.send(Payload::Binary(vec![3])),
            Err(EndpointError::NotConnected)
        );
    }
}
