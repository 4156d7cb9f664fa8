//! Negotiation engine contract
//!
//! The direct channel is produced by a negotiation engine. Endpoints only
//! see its capability surface:
//!
//! - constructed with `{initiator, config, observed_addr}`
//! - emits `Connect`, `Signal(payload)`, `Data(payload)`, `Close`, `Error`
//! - accepts `signal(payload)` (inbound, via the relay), `send`, `destroy`
//!
//! Engines are polled: `drive` performs pending I/O and timer work, then
//! `poll_event` drains what happened.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::DirectConfig;
use crate::framing::Payload;

// ============================================================================
// Options / Events
// ============================================================================

/// Construction options for an engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Role assigned by the broker
    pub initiator: bool,
    /// Parameters from the server's config blob
    pub config: DirectConfig,
    /// Our address as observed by the relay server (QAD)
    pub observed_addr: Option<SocketAddr>,
}

/// Engine lifecycle and data events
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Direct channel is live
    Connect,
    /// Negotiation payload to carry to the peer through the relay
    Signal(Value),
    /// Payload received on the direct channel
    Data(Payload),
    /// Peer closed the direct channel
    Close,
    /// Negotiation or I/O failure
    Error(EngineError),
}

// ============================================================================
// Errors
// ============================================================================

/// Engine failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Socket error
    Io(String),
    /// Negotiation did not complete in time
    Timeout,
    /// send() before Connect
    NotConnected,
    /// Payload does not fit in one datagram
    TooLarge(usize),
    /// Datagram could not be encoded
    Encode(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Io(msg) => write!(f, "I/O error: {}", msg),
            EngineError::Timeout => write!(f, "negotiation timed out"),
            EngineError::NotConnected => write!(f, "direct channel not connected"),
            EngineError::TooLarge(n) => write!(f, "payload too large for datagram: {} bytes", n),
            EngineError::Encode(msg) => write!(f, "encode error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Capability surface of a point-to-point negotiation engine
pub trait NegotiationEngine {
    /// Feed a negotiation payload received from the peer
    fn signal(&mut self, payload: Value);

    /// Send application data on the direct channel
    fn send(&mut self, payload: &Payload) -> Result<(), EngineError>;

    /// Tear down the engine. Emits no further events.
    fn destroy(&mut self);

    /// Perform pending I/O and timer work
    fn drive(&mut self, now: Instant);

    fn poll_event(&mut self) -> Option<EngineEvent>;

    /// How long until `drive` has work to do
    fn timeout(&self, now: Instant) -> Option<Duration>;
}

/// Builds engines for the direct endpoint
pub trait EngineFactory {
    fn create(&self, options: EngineOptions) -> Result<Box<dyn NegotiationEngine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn(EngineOptions) -> Result<Box<dyn NegotiationEngine>, EngineError>,
{
    fn create(&self, options: EngineOptions) -> Result<Box<dyn NegotiationEngine>, EngineError> {
        self(options)
    }
}
