//! Relayed-channel endpoint
//!
//! Performs the credential handshake with the broker over the relay
//! transport, then behaves as a data pipe to the paired peer.
//!
//! # Handshake
//!
//! ```text
//! connect(pairing) ──► client.register ──► (pending)
//!                                             │
//!        HANDSHAKE_SUCCESS ◄──────────────────┤──► Connected
//!        HANDSHAKE_FAILED  ◄──────────────────┤──► ConnectFailed(InvalidPairing)
//!        any other payload ◄──────────────────┤──► ConnectFailed(ConnectionFailed)
//!        deadline          ◄──────────────────┘──► ConnectFailed(TimedOut)
//! ```
//!
//! The endpoint is sans-IO. The owner feeds it transport events and drains
//! `poll_transmit` into the transport.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::connection::{
    Connection, ConnectionEvent, ConnectionState, DataHandler, KeepAliveAction,
};
use crate::control::{is_control, InternalEvent, HANDSHAKE_FAILED, HANDSHAKE_SUCCESS};
use crate::error::EndpointError;
use crate::framing::Payload;
use crate::pairing::Pairing;

// ============================================================================
// Constants
// ============================================================================

/// Default bound on the register → handshake reply round trip
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Types
// ============================================================================

/// Work for the transport owner
#[derive(Debug, Clone, PartialEq)]
pub enum Transmit {
    /// Write one frame to the relay stream
    Payload(Payload),
    /// Close the relay transport
    Close,
}

/// Relayed-channel endpoint
#[derive(Debug)]
pub struct RelayedEndpoint {
    /// Shared state machine
    conn: Connection,
    /// Pairing this endpoint registers with
    pairing: Option<Pairing>,
    /// Origin announced in client.register
    origin: Option<String>,
    /// Handshake deadline while a register is unanswered
    handshake_deadline: Option<Instant>,
    /// Register is waiting for the transport to open
    register_pending: bool,
    handshake_timeout: Duration,
    /// Transport is open (and not yet asked to close)
    transport_open: bool,
    /// Frames and commands for the transport
    outbox: VecDeque<Transmit>,
}

impl RelayedEndpoint {
    pub fn new(handshake_timeout: Duration, origin: Option<String>) -> Self {
        Self {
            conn: Connection::new("relay"),
            pairing: None,
            origin,
            handshake_deadline: None,
            register_pending: false,
            handshake_timeout,
            transport_open: false,
            outbox: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Handshake sent and not yet answered
    pub fn is_handshaking(&self) -> bool {
        self.handshake_deadline.is_some()
    }

    pub fn pairing(&self) -> Option<&Pairing> {
        self.pairing.as_ref()
    }

    // ========================================================================
    // Connect / Handshake
    // ========================================================================

    /// Register `pairing` with the broker.
    ///
    /// If the transport is already open the register goes out immediately,
    /// otherwise on `on_transport_open`. While connected this is a no-op
    /// that emits `AlreadyConnected`.
    pub fn connect(&mut self, pairing: Pairing, now: Instant) {
        if !self.conn.begin_connect() {
            return;
        }

        log::info!("Registering pairing {} with broker", pairing.code);
        self.pairing = Some(pairing);
        self.handshake_deadline = Some(now + self.handshake_timeout);
        self.register_pending = true;

        if self.transport_open {
            self.send_register();
        }
    }

    /// Relay transport finished its own handshake
    pub fn on_transport_open(&mut self) {
        self.transport_open = true;
        if self.register_pending {
            self.send_register();
        }
    }

    fn send_register(&mut self) {
        self.register_pending = false;
        let event = InternalEvent::Register {
            pairing: self.pairing.clone(),
            origin: self.origin.clone(),
        };
        self.outbox.push_back(Transmit::Payload(event.into_payload()));
    }

    fn fail_handshake(&mut self, error: EndpointError) {
        self.handshake_deadline = None;
        self.register_pending = false;
        self.conn.handle_connect_failed(error);
        self.close_transport();
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Feed one payload received from the broker
    pub fn on_payload(&mut self, payload: Payload, now: Instant, handler: &mut dyn DataHandler) {
        if self.handshake_deadline.is_some() {
            let text = payload.as_text().unwrap_or_default();
            if text == HANDSHAKE_SUCCESS {
                self.handshake_deadline = None;
                self.conn.handle_connected(now);
            } else if text == HANDSHAKE_FAILED {
                self.fail_handshake(EndpointError::InvalidPairing);
            } else if is_control(text) {
                // Credential-lane replies may still be in flight
                self.conn.handle_incoming(payload, now, handler);
            } else {
                self.fail_handshake(EndpointError::ConnectionFailed);
            }
            return;
        }

        if let Some(InternalEvent::PeerConnected { is_initiator, .. }) =
            self.conn.handle_incoming(payload, now, handler)
        {
            log::info!(
                "Peer connected ({})",
                if is_initiator { "initiator" } else { "joiner" }
            );
            self.conn.monitor_peer(now);
        }
    }

    /// Relay transport closed underneath us
    pub fn on_transport_closed(&mut self) {
        self.transport_open = false;
        if self.handshake_deadline.is_some() {
            self.fail_handshake(EndpointError::ConnectionFailed);
        } else {
            self.conn.handle_close();
        }
    }

    /// Relay transport failed
    pub fn on_transport_error(&mut self, message: String) {
        self.transport_open = false;
        if self.handshake_deadline.is_some() {
            self.fail_handshake(EndpointError::ConnectionFailed);
        } else {
            self.conn.handle_error(EndpointError::Transport(message));
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Send application data to the peer
    pub fn send(&mut self, payload: Payload) -> Result<(), EndpointError> {
        if !self.is_connected() {
            return Err(EndpointError::NotConnected);
        }
        if payload.as_text().map(is_control).unwrap_or(false) {
            return Err(EndpointError::ReservedPrefix);
        }
        self.outbox.push_back(Transmit::Payload(payload));
        Ok(())
    }

    /// Carry a direct-channel negotiation payload to the peer
    pub fn send_signal(&mut self, signal: Value) -> Result<(), EndpointError> {
        if !self.is_connected() {
            return Err(EndpointError::NotConnected);
        }
        self.send_internal(InternalEvent::PeerSignal(signal));
        Ok(())
    }

    /// Queue a control message (credential lane requests go out before
    /// registration, so this does not require Connected)
    pub fn send_internal(&mut self, event: InternalEvent) {
        self.outbox
            .push_back(Transmit::Payload(event.into_payload()));
    }

    /// Close the endpoint. Safe to call any number of times, connected or not.
    pub fn close(&mut self) {
        self.handshake_deadline = None;
        self.register_pending = false;
        self.conn.handle_close();
        self.close_transport();
    }

    fn close_transport(&mut self) {
        if self.transport_open {
            self.transport_open = false;
            self.outbox.push_back(Transmit::Close);
        }
    }

    // ========================================================================
    // Timers / Polling
    // ========================================================================

    /// Fire expired deadlines (handshake timeout, keep-alive)
    pub fn on_timeout(&mut self, now: Instant) {
        if let Some(deadline) = self.handshake_deadline {
            if now >= deadline {
                self.fail_handshake(EndpointError::TimedOut);
                return;
            }
        }

        match self.conn.poll_keepalive(now) {
            KeepAliveAction::SendPing => self.send_internal(InternalEvent::Ping),
            KeepAliveAction::PeerDead => {
                self.conn.handle_error(EndpointError::PeerTimedOut);
                self.close_transport();
            }
            KeepAliveAction::None => {}
        }
    }

    /// Time until the next deadline
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        let next = match (self.handshake_deadline, self.conn.keepalive_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        next.map(|at| at.saturating_duration_since(now))
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.outbox.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.conn.poll_event()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LoggingHandler;
    use crate::control::decode_control;
    use crate::keepalive::{KEEPALIVE_INTERVAL, PEER_TIMEOUT};
    use serde_json::json;

    const HASH: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    fn pairing() -> Pairing {
        Pairing::new("123456", HASH)
    }

    fn drain(ep: &mut RelayedEndpoint) -> Vec<Transmit> {
        std::iter::from_fn(|| ep.poll_transmit()).collect()
    }

    fn events(ep: &mut RelayedEndpoint) -> Vec<ConnectionEvent> {
        std::iter::from_fn(|| ep.poll_event()).collect()
    }

    fn connected_endpoint(now: Instant) -> RelayedEndpoint {
        let mut ep = RelayedEndpoint::new(HANDSHAKE_TIMEOUT, None);
        ep.on_transport_open();
        ep.connect(pairing(), now);
        ep.on_payload(HANDSHAKE_SUCCESS.into(), now, &mut LoggingHandler);
        drain(&mut ep);
        events(&mut ep);
        ep
    }

    #[test]
    fn test_register_sent_on_transport_open() {
        let now = Instant::now();
        let mut ep = RelayedEndpoint::new(HANDSHAKE_TIMEOUT, Some("app://remote".into()));
        ep.connect(pairing(), now);
        assert!(drain(&mut ep).is_empty());

        ep.on_transport_open();
        let sent = drain(&mut ep);
        assert_eq!(sent.len(), 1);
        let Transmit::Payload(Payload::Text(text)) = &sent[0] else {
            panic!("expected text frame, got {:?}", sent[0]);
        };
        let msg = decode_control(text).unwrap();
        assert_eq!(msg.name, "client.register");
        assert_eq!(msg.data["hash"], HASH);
        assert_eq!(msg.data["origin"], "app://remote");
    }

    #[test]
    fn test_handshake_success() {
        let now = Instant::now();
        let mut ep = RelayedEndpoint::new(HANDSHAKE_TIMEOUT, None);
        ep.on_transport_open();
        ep.connect(pairing(), now);
        assert!(ep.is_handshaking());

        ep.on_payload(HANDSHAKE_SUCCESS.into(), now, &mut LoggingHandler);
        assert!(ep.is_connected());
        assert!(!ep.is_handshaking());
        assert_eq!(events(&mut ep), vec![ConnectionEvent::Established]);
    }

    #[test]
    fn test_handshake_failed_closes_transport() {
        let now = Instant::now();
        let mut ep = RelayedEndpoint::new(HANDSHAKE_TIMEOUT, None);
        ep.on_transport_open();
        ep.connect(pairing(), now);
        drain(&mut ep);

        ep.on_payload(HANDSHAKE_FAILED.into(), now, &mut LoggingHandler);
        assert_eq!(
            events(&mut ep),
            vec![ConnectionEvent::ConnectFailed(EndpointError::InvalidPairing)]
        );
        assert_eq!(drain(&mut ep), vec![Transmit::Close]);
        assert!(!ep.is_connected());
    }

    #[test]
    fn test_unexpected_reply_fails_handshake() {
        let now = Instant::now();
        let mut ep = RelayedEndpoint::new(HANDSHAKE_TIMEOUT, None);
        ep.on_transport_open();
        ep.connect(pairing(), now);

        ep.on_payload(Payload::Binary(vec![1]), now, &mut LoggingHandler);
        assert_eq!(
            events(&mut ep),
            vec![ConnectionEvent::ConnectFailed(EndpointError::ConnectionFailed)]
        );
    }

    #[test]
    fn test_handshake_timeout() {
        let t0 = Instant::now();
        let mut ep = RelayedEndpoint::new(Duration::from_secs(2), None);
        ep.on_transport_open();
        ep.connect(pairing(), t0);
        assert_eq!(ep.timeout(t0), Some(Duration::from_secs(2)));

        ep.on_timeout(t0 + Duration::from_secs(1));
        assert!(events(&mut ep).is_empty());

        ep.on_timeout(t0 + Duration::from_secs(2));
        assert_eq!(
            events(&mut ep),
            vec![ConnectionEvent::ConnectFailed(EndpointError::TimedOut)]
        );
        assert!(drain(&mut ep).contains(&Transmit::Close));
    }

    #[test]
    fn test_close_cancels_handshake_timer() {
        let t0 = Instant::now();
        let mut ep = RelayedEndpoint::new(Duration::from_secs(2), None);
        ep.on_transport_open();
        ep.connect(pairing(), t0);
        ep.close();
        events(&mut ep);

        // A stale deadline never fires after close
        ep.on_timeout(t0 + Duration::from_secs(5));
        assert!(events(&mut ep).is_empty());
        assert_eq!(ep.timeout(t0), None);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut ep = connected_endpoint(Instant::now());
        ep.close();
        ep.close();
        assert_eq!(drain(&mut ep), vec![Transmit::Close]);
        assert_eq!(events(&mut ep), vec![ConnectionEvent::Closed]);

        // Never connected
        let mut idle = RelayedEndpoint::new(HANDSHAKE_TIMEOUT, None);
        idle.close();
        assert!(drain(&mut idle).is_empty());
        assert!(events(&mut idle).is_empty());
    }

    #[test]
    fn test_connect_while_connected() {
        let now = Instant::now();
        let mut ep = connected_endpoint(now);
        ep.connect(pairing(), now);
        assert_eq!(events(&mut ep), vec![ConnectionEvent::AlreadyConnected]);
        assert!(drain(&mut ep).is_empty());
    }

    #[test]
    fn test_send_rules() {
        let mut idle = RelayedEndpoint::new(HANDSHAKE_TIMEOUT, None);
        assert_eq!(
            idle.send(Payload::Binary(vec![1])),
            Err(EndpointError::NotConnected)
        );

        let mut ep = connected_endpoint(Instant::now());
        assert_eq!(
            ep.send(Payload::Text("§sneaky".to_string())),
            Err(EndpointError::ReservedPrefix)
        );
        ep.send(Payload::Binary(vec![1, 2, 3])).unwrap();
        ep.send_signal(json!({ "candidates": [] })).unwrap();

        let sent = drain(&mut ep);
        assert_eq!(sent[0], Transmit::Payload(Payload::Binary(vec![1, 2, 3])));
        let Transmit::Payload(Payload::Text(text)) = &sent[1] else {
            panic!("expected signal frame");
        };
        assert_eq!(decode_control(text).unwrap().name, "peer.signal");
    }

    #[test]
    fn test_peer_connected_starts_monitoring() {
        let t0 = Instant::now();
        let mut ep = connected_endpoint(t0);
        let event = InternalEvent::PeerConnected {
            is_initiator: true,
            pairing: pairing(),
        };
        ep.on_payload(event.clone().into_payload(), t0, &mut LoggingHandler);
        assert_eq!(events(&mut ep), vec![ConnectionEvent::Internal(event)]);

        ep.on_timeout(t0 + KEEPALIVE_INTERVAL);
        let sent = drain(&mut ep);
        assert_eq!(sent.len(), 1);

        ep.on_timeout(t0 + PEER_TIMEOUT);
        assert_eq!(
            events(&mut ep),
            vec![
                ConnectionEvent::Error(EndpointError::PeerTimedOut),
                ConnectionEvent::Closed
            ]
        );
        assert!(drain(&mut ep).contains(&Transmit::Close));
    }

    #[test]
    fn test_transport_closed_after_connect() {
        let mut ep = connected_endpoint(Instant::now());
        ep.on_transport_closed();
        assert_eq!(events(&mut ep), vec![ConnectionEvent::Closed]);
        // Transport is already gone, nothing to close
        assert!(drain(&mut ep).is_empty());
    }
}
