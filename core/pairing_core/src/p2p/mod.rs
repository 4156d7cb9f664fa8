//! Direct-channel negotiation
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     Direct Channel Modules                     │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  engine.rs     - NegotiationEngine contract + factory          │
//! │  candidate.rs  - Candidate gathering (host, srflx, configured) │
//! │  udp.rs        - UDP reference engine (probe / ack / data)     │
//! │                                                                │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! `DirectConfig` is seeded from the rendezvous server's `config` blob.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod candidate;
pub mod engine;
pub mod udp;

pub use candidate::{enumerate_local_addresses, gather_candidates, Candidate, CandidateType};
pub use engine::{EngineError, EngineEvent, EngineFactory, EngineOptions, NegotiationEngine};
pub use udp::{UdpEngine, UdpEngineFactory};

// ============================================================================
// Direct Config
// ============================================================================

/// Direct-channel parameters distributed by the rendezvous server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DirectConfig {
    /// Interval between probe rounds
    pub probe_interval_ms: u64,
    /// Give up on the direct channel after this long
    pub negotiation_timeout_ms: u64,
    /// Extra candidate addresses to advertise (e.g. a port forward)
    pub candidates: Vec<SocketAddr>,
    /// Advertise 127.0.0.1 (peers on the same host)
    pub include_loopback: bool,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 200,
            negotiation_timeout_ms: 10_000,
            candidates: Vec::new(),
            include_loopback: true,
        }
    }
}

impl DirectConfig {
    /// Read a config blob. Unknown keys are ignored; a blob that does not
    /// parse falls back to the defaults.
    pub fn from_value(value: &Value) -> Self {
        match serde_json::from_value(value.clone()) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Invalid direct config ({}), using defaults", e);
                Self::default()
            }
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_config_from_blob() {
        let blob = json!({
            "probeIntervalMs": 50,
            "candidates": ["198.51.100.7:9000"],
            "iceServers": [{ "urls": "stun:example.org" }]
        });
        let config = DirectConfig::from_value(&blob);
        assert_eq!(config.probe_interval(), Duration::from_millis(50));
        assert_eq!(config.negotiation_timeout(), Duration::from_secs(10));
        assert_eq!(config.candidates, vec!["198.51.100.7:9000".parse().unwrap()]);
        assert!(config.include_loopback);
    }

    #[test]
    fn test_direct_config_fallback() {
        assert_eq!(DirectConfig::from_value(&json!("nope")), DirectConfig::default());
        assert_eq!(DirectConfig::from_value(&json!({})), DirectConfig::default());
    }
}
