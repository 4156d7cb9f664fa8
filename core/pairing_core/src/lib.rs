//! Pairing Protocol Core
//!
//! This crate provides the shared core for pairing two remote endpoints
//! through a rendezvous server:
//! - Pairing credentials and their format checks
//! - Two-lane framing (reserved-prefix control messages vs. opaque data)
//! - Endpoint state machines (relayed handshake, direct channel, keep-alive)
//! - QUIC relay transport via quiche and the `PairingClient` orchestrator
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        PairingClient                          │
//! │   ┌────────────────────┐            ┌─────────────────────┐   │
//! │   │  RelayedEndpoint   │◄─ signal ─►│   DirectEndpoint    │   │
//! │   └─────────┬──────────┘            └──────────┬──────────┘   │
//! │             │ Connection (state, keep-alive, demux)│            │
//! │   ┌─────────▼──────────┐            ┌──────────▼──────────┐   │
//! │   │  RelayTransport    │            │ NegotiationEngine   │   │
//! │   │  (QUIC stream 0)   │            │ (UdpEngine)         │   │
//! │   └────────────────────┘            └─────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod client;
pub mod connection;
pub mod control;
pub mod direct;
pub mod error;
pub mod framing;
pub mod keepalive;
pub mod pairing;
pub mod qad;
pub mod relayed;
pub mod transport;

/// Direct-channel negotiation (engine contract, UDP engine)
pub mod p2p;

pub use client::{ClientEvent, ClientOptions, PairingClient};
pub use connection::{ConnectionEvent, ConnectionState, DataHandler, LoggingHandler};
pub use control::{ControlMessage, InternalEvent};
pub use error::EndpointError;
pub use framing::Payload;
pub use pairing::{Pairing, Validation};

// ============================================================================
// Constants (MUST match between server and clients)
// ============================================================================

/// Maximum UDP payload size for QUIC packets
pub const MAX_DATAGRAM_SIZE: usize = 1350;

/// QUIC idle timeout in milliseconds
pub const IDLE_TIMEOUT_MS: u64 = 30_000;

/// ALPN protocol identifier
pub const ALPN_PROTOCOL: &[u8] = b"pairing-v1";

/// Client-initiated bidirectional stream carrying relayed frames
pub const RELAY_STREAM_ID: u64 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpn_protocol() {
        assert_eq!(ALPN_PROTOCOL, b"pairing-v1");
    }

    #[test]
    fn test_relay_stream_is_client_bidi() {
        // Lowest two bits 00 = client-initiated bidirectional
        assert_eq!(RELAY_STREAM_ID & 0x3, 0);
    }
}
