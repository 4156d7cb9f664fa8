//! Direct-channel endpoint
//!
//! Wraps a `NegotiationEngine` and maps its events onto the shared
//! `Connection` state machine:
//!
//! | Engine event | Endpoint reaction                                   |
//! |--------------|-----------------------------------------------------|
//! | Connect      | connected, keep-alive started, peer monitored       |
//! | Signal       | queued for the relayed endpoint (`poll_signal`)     |
//! | Data         | demultiplexed (internal events vs. data handler)    |
//! | Close        | closed                                              |
//! | Error        | connect failure, or error + close once connected    |
//!
//! The endpoint never talks to the broker. Negotiation payloads leave via
//! `poll_signal` and arrive via `signal`, carried by the relayed endpoint.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::connection::{
    Connection, ConnectionEvent, ConnectionState, DataHandler, KeepAliveAction,
};
use crate::control::{is_control, InternalEvent};
use crate::error::EndpointError;
use crate::framing::Payload;
use crate::p2p::{DirectConfig, EngineEvent, EngineFactory, EngineOptions, NegotiationEngine};

/// Direct-channel endpoint
pub struct DirectEndpoint {
    /// Shared state machine
    conn: Connection,
    /// Builds the engine on connect
    factory: Box<dyn EngineFactory>,
    /// Live engine (None before connect and after close)
    engine: Option<Box<dyn NegotiationEngine>>,
    /// Seed for new engines
    config: DirectConfig,
    /// QAD address of the relay transport
    observed_addr: Option<SocketAddr>,
    /// Outbound negotiation payloads for the relay
    signals: VecDeque<Value>,
}

impl std::fmt::Debug for DirectEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectEndpoint")
            .field("state", &self.conn.state())
            .field("engine", &self.engine.is_some())
            .field("pending_signals", &self.signals.len())
            .finish()
    }
}

impl DirectEndpoint {
    pub fn new(factory: Box<dyn EngineFactory>, config: DirectConfig) -> Self {
        Self {
            conn: Connection::new("direct"),
            factory,
            engine: None,
            config,
            observed_addr: None,
            signals: VecDeque::new(),
        }
    }

    pub fn set_config(&mut self, config: DirectConfig) {
        self.config = config;
    }

    pub fn set_observed_addr(&mut self, addr: Option<SocketAddr>) {
        self.observed_addr = addr;
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Negotiation in progress or channel live
    pub fn is_active(&self) -> bool {
        self.engine.is_some()
    }

    /// Start negotiating with the given role. A no-op (with an
    /// `AlreadyConnected` event) while connected.
    pub fn connect(&mut self, is_initiator: bool) -> Result<(), EndpointError> {
        if !self.conn.begin_connect() {
            return Ok(());
        }
        self.teardown_engine();

        let options = EngineOptions {
            initiator: is_initiator,
            config: self.config.clone(),
            observed_addr: self.observed_addr,
        };
        match self.factory.create(options) {
            Ok(engine) => {
                log::info!(
                    "Starting direct channel negotiation as {}",
                    if is_initiator { "initiator" } else { "joiner" }
                );
                self.engine = Some(engine);
                Ok(())
            }
            Err(e) => {
                let error = EndpointError::Engine(e.to_string());
                self.conn.handle_connect_failed(error.clone());
                Err(error)
            }
        }
    }

    /// Feed a negotiation payload received through the relay
    pub fn signal(&mut self, payload: Value) {
        match self.engine.as_mut() {
            Some(engine) => engine.signal(payload),
            None => log::debug!("Signal received without an active direct channel, dropped"),
        }
    }

    /// Next negotiation payload to carry to the peer
    pub fn poll_signal(&mut self) -> Option<Value> {
        self.signals.pop_front()
    }

    /// Send application data on the direct channel
    pub fn send(&mut self, payload: Payload) -> Result<(), EndpointError> {
        if !self.is_connected() {
            return Err(EndpointError::NotConnected);
        }
        if payload.as_text().map(is_control).unwrap_or(false) {
            return Err(EndpointError::ReservedPrefix);
        }
        self.send_raw(&payload)
    }

    fn send_raw(&mut self, payload: &Payload) -> Result<(), EndpointError> {
        let engine = self.engine.as_mut().ok_or(EndpointError::NotConnected)?;
        engine
            .send(payload)
            .map_err(|e| EndpointError::Engine(e.to_string()))
    }

    /// Drive the engine and keep-alive, dispatching whatever happened
    pub fn drive(&mut self, now: Instant, handler: &mut dyn DataHandler) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        engine.drive(now);

        let mut events = Vec::new();
        while let Some(event) = engine.poll_event() {
            events.push(event);
        }
        for event in events {
            self.handle_engine_event(event, now, handler);
        }

        if self.engine.is_none() {
            return;
        }
        match self.conn.poll_keepalive(now) {
            KeepAliveAction::SendPing => {
                if let Err(e) = self.send_raw(&InternalEvent::Ping.into_payload()) {
                    log::debug!("Direct keep-alive not sent: {}", e);
                }
            }
            KeepAliveAction::PeerDead => {
                self.teardown_engine();
                self.conn.handle_error(EndpointError::PeerTimedOut);
            }
            KeepAliveAction::None => {}
        }
    }

    fn handle_engine_event(&mut self, event: EngineEvent, now: Instant, handler: &mut dyn DataHandler) {
        match event {
            EngineEvent::Connect => {
                self.conn.handle_connected(now);
                self.conn.monitor_peer(now);
            }
            EngineEvent::Signal(signal) => self.signals.push_back(signal),
            EngineEvent::Data(payload) => {
                self.conn.handle_incoming(payload, now, handler);
            }
            EngineEvent::Close => {
                self.teardown_engine();
                self.conn.handle_close();
            }
            EngineEvent::Error(e) => {
                self.teardown_engine();
                let error = EndpointError::Engine(e.to_string());
                if self.conn.state() == ConnectionState::Connecting {
                    self.conn.handle_connect_failed(error);
                } else {
                    self.conn.handle_error(error);
                }
            }
        }
    }

    fn teardown_engine(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.destroy();
        }
        self.signals.clear();
    }

    /// Close the direct channel. Idempotent.
    pub fn close(&mut self) {
        self.teardown_engine();
        self.conn.handle_close();
    }

    /// Time until `drive` has work to do
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        let engine = self.engine.as_ref()?.timeout(now);
        let keepalive = self
            .conn
            .keepalive_deadline()
            .map(|at| at.saturating_duration_since(now));
        match (engine, keepalive) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.conn.poll_event()
    }
}
