//! Errors surfaced by endpoints and the pairing client

use std::fmt;

/// Endpoint failures, delivered through the event channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// Broker rejected the pairing (HANDSHAKE_FAILED)
    InvalidPairing,
    /// Transport closed or sent garbage before the handshake resolved
    ConnectionFailed,
    /// Handshake did not resolve within the connect timeout
    TimedOut,
    /// Operation requires a connected endpoint
    NotConnected,
    /// initiate/join while already connected
    AlreadyConnected,
    /// Code is malformed, unknown or already claimed
    InvalidCode,
    /// Stored pairing is no longer valid
    PairingUnavailable(String),
    /// Peer went silent past the keep-alive timeout
    PeerTimedOut,
    /// Text payload starts with the control prefix
    ReservedPrefix,
    /// Relay transport failure
    Transport(String),
    /// Negotiation engine failure
    Engine(String),
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointError::InvalidPairing => write!(f, "invalid pairing"),
            EndpointError::ConnectionFailed => write!(f, "connection failed"),
            EndpointError::TimedOut => write!(f, "connection timed out"),
            EndpointError::NotConnected => write!(f, "not connected"),
            EndpointError::AlreadyConnected => write!(f, "already connected"),
            EndpointError::InvalidCode => write!(f, "invalid or expired code"),
            EndpointError::PairingUnavailable(msg) => write!(f, "pairing unavailable: {}", msg),
            EndpointError::PeerTimedOut => write!(f, "peer timed out"),
            EndpointError::ReservedPrefix => {
                write!(f, "text payload must not start with the control prefix")
            }
            EndpointError::Transport(msg) => write!(f, "transport error: {}", msg),
            EndpointError::Engine(msg) => write!(f, "negotiation engine error: {}", msg),
        }
    }
}

impl std::error::Error for EndpointError {}
