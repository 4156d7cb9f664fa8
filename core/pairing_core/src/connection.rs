//! Transport-agnostic endpoint connection
//!
//! `Connection` holds the state both endpoint kinds share:
//! - connection state (`Disconnected → Connecting → Connected → Closed`)
//! - the keep-alive timer
//! - demultiplexing of inbound payloads into internal events vs.
//!   application data for the `DataHandler`
//! - a queue of `ConnectionEvent`s for the owner to poll
//!
//! It is sans-IO: the relayed and direct endpoints own the transport and
//! call into this state machine.

use std::collections::VecDeque;
use std::time::Instant;

use crate::control::{decode_control, is_control, InternalEvent};
use crate::error::EndpointError;
use crate::framing::Payload;
use crate::keepalive::KeepAlive;

// ============================================================================
// State
// ============================================================================

/// Endpoint connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected
    Disconnected,
    /// Transport open, handshake/negotiation in progress
    Connecting,
    /// Ready for application data
    Connected,
    /// Closed (locally or by the peer)
    Closed,
}

// ============================================================================
// Data Handler
// ============================================================================

/// Receives inbound application payloads once control messages are stripped.
///
/// The defaults log and drop, so an endpoint without a handler never fails.
pub trait DataHandler {
    fn on_binary_data(&mut self, data: &[u8]) {
        log::debug!("No binary data handler ({} bytes dropped)", data.len());
    }

    fn on_string_data(&mut self, text: &str) {
        log::debug!("No string data handler ({} bytes dropped)", text.len());
    }
}

/// Handler that only logs
#[derive(Debug, Default)]
pub struct LoggingHandler;

impl DataHandler for LoggingHandler {}

// ============================================================================
// Events
// ============================================================================

/// Lifecycle and internal events emitted by a connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Connect succeeded
    Established,
    /// Connect was rejected or timed out
    ConnectFailed(EndpointError),
    /// Connect was called while already connected (diagnostic only)
    AlreadyConnected,
    /// A control message arrived from the peer or broker
    Internal(InternalEvent),
    /// Transport or engine failure (followed by Closed)
    Error(EndpointError),
    /// Connection closed
    Closed,
}

/// What the owner must do after polling the keep-alive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    None,
    SendPing,
    PeerDead,
}

// ============================================================================
// Connection
// ============================================================================

/// Shared endpoint state machine
#[derive(Debug)]
pub struct Connection {
    /// Name used in log lines ("relay" / "direct")
    label: &'static str,
    /// Current state
    state: ConnectionState,
    /// Keep-alive timer
    keepalive: KeepAlive,
    /// Pending events for the owner
    events: VecDeque<ConnectionEvent>,
}

impl Connection {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            state: ConnectionState::Disconnected,
            keepalive: KeepAlive::new(),
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Enter Connecting. Returns false (and emits AlreadyConnected) when
    /// already connected, in which case the caller must do nothing.
    pub fn begin_connect(&mut self) -> bool {
        if self.is_connected() {
            log::warn!("[{}] connect called while already connected", self.label);
            self.events.push_back(ConnectionEvent::AlreadyConnected);
            return false;
        }
        self.keepalive.stop();
        self.state = ConnectionState::Connecting;
        true
    }

    /// Connect succeeded: mark connected and (re)start the keep-alive
    pub fn handle_connected(&mut self, now: Instant) {
        log::info!("[{}] connected", self.label);
        self.state = ConnectionState::Connected;
        self.keepalive.start(now);
        self.events.push_back(ConnectionEvent::Established);
    }

    /// Connect was rejected before reaching Connected
    pub fn handle_connect_failed(&mut self, error: EndpointError) {
        log::warn!("[{}] connect failed: {}", self.label, error);
        self.keepalive.stop();
        self.state = ConnectionState::Closed;
        self.events.push_back(ConnectionEvent::ConnectFailed(error));
    }

    /// Close from either side. Emits Closed once; later calls are no-ops.
    /// Returns true if this call performed the transition.
    pub fn handle_close(&mut self) -> bool {
        self.keepalive.stop();
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                log::info!("[{}] closed", self.label);
                self.state = ConnectionState::Closed;
                self.events.push_back(ConnectionEvent::Closed);
                true
            }
            _ => false,
        }
    }

    /// Transport errors are reported and then treated as a close
    pub fn handle_error(&mut self, error: EndpointError) {
        if self.state == ConnectionState::Closed {
            log::debug!("[{}] error after close ignored: {}", self.label, error);
            return;
        }
        log::warn!("[{}] error: {}", self.label, error);
        self.events.push_back(ConnectionEvent::Error(error));
        self.handle_close();
    }

    /// Demultiplex one inbound payload.
    ///
    /// Application data goes to `handler`; control messages become internal
    /// events (queued and returned so the endpoint can react). Keep-alive
    /// pings only refresh liveness. Malformed or unknown control messages
    /// are logged and dropped, never handed to the data handler.
    pub fn handle_incoming(
        &mut self,
        payload: Payload,
        now: Instant,
        handler: &mut dyn DataHandler,
    ) -> Option<InternalEvent> {
        self.keepalive.record_activity(now);

        let text = match payload {
            Payload::Binary(data) => {
                handler.on_binary_data(&data);
                return None;
            }
            Payload::Text(text) if !is_control(&text) => {
                handler.on_string_data(&text);
                return None;
            }
            Payload::Text(text) => text,
        };

        let Some(msg) = decode_control(&text) else {
            log::debug!("[{}] malformed control message dropped", self.label);
            return None;
        };

        match InternalEvent::from_message(&msg) {
            Some(InternalEvent::Ping) => {
                log::trace!("[{}] ping", self.label);
                None
            }
            Some(event) => {
                log::debug!("[{}] internal event: {}", self.label, msg.name);
                self.events.push_back(ConnectionEvent::Internal(event.clone()));
                Some(event)
            }
            None => {
                log::debug!("[{}] ignoring control message '{}'", self.label, msg.name);
                None
            }
        }
    }

    /// Start watching for peer silence (the peer is known to exist)
    pub fn monitor_peer(&mut self, now: Instant) {
        self.keepalive.monitor(now);
    }

    /// Drive the keep-alive timer
    pub fn poll_keepalive(&mut self, now: Instant) -> KeepAliveAction {
        if !self.is_connected() {
            return KeepAliveAction::None;
        }
        if self.keepalive.is_peer_dead(now) {
            return KeepAliveAction::PeerDead;
        }
        if self.keepalive.poll_send(now) {
            return KeepAliveAction::SendPing;
        }
        KeepAliveAction::None
    }

    pub fn keepalive_deadline(&self) -> Option<Instant> {
        self.keepalive.next_deadline()
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }
}
