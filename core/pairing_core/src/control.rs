//! Control messages
//!
//! Control messages share the relayed transport with opaque payload. They
//! are text frames starting with the reserved prefix `§`, followed by a
//! JSON envelope `{"name": ..., "data": ...}`:
//!
//! ```text
//! §{"name":"client.register","data":{"code":"123456","hash":"9f86..."}}
//! ```
//!
//! The handshake replies are the only protocol strings sent without the
//! prefix (`HANDSHAKE_SUCCESS` / `HANDSHAKE_FAILED`).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::framing::Payload;
use crate::pairing::Pairing;

// ============================================================================
// Constants
// ============================================================================

/// Reserved first character of every control message
pub const CONTROL_PREFIX: char = '§';

/// Raw reply to a successful `client.register`
pub const HANDSHAKE_SUCCESS: &str = "HANDSHAKE_SUCCESS";

/// Raw reply to a rejected `client.register`
pub const HANDSHAKE_FAILED: &str = "HANDSHAKE_FAILED";

pub const CLIENT_REGISTER: &str = "client.register";
pub const PEER_CONNECTED: &str = "peer.connected";
pub const PEER_SIGNAL: &str = "peer.signal";
pub const PEER_PING: &str = "peer.ping";
pub const CODE_GET: &str = "code.get";
pub const CODE_ISSUED: &str = "code.issued";
pub const CODE_ERROR: &str = "code.error";
pub const CODE_VALIDATE: &str = "code.validate";
pub const CODE_CLAIMED: &str = "code.claimed";
pub const PAIRING_VALIDATE: &str = "pairing.validate";
pub const PAIRING_VALIDATED: &str = "pairing.validated";
pub const CONFIG_GET: &str = "config.get";
pub const CONFIG: &str = "config";

// ============================================================================
// Envelope
// ============================================================================

/// The JSON envelope of a control message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

impl ControlMessage {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Prefix + JSON
    pub fn encode(&self) -> String {
        // Serializing a String and a Value cannot fail
        let body = serde_json::to_string(self).unwrap_or_default();
        format!("{}{}", CONTROL_PREFIX, body)
    }

    pub fn into_payload(self) -> Payload {
        Payload::Text(self.encode())
    }
}

/// Whether a text payload belongs to the control lane
pub fn is_control(text: &str) -> bool {
    text.starts_with(CONTROL_PREFIX)
}

/// Decode a control message. Returns None when `text` is not prefixed or
/// the envelope is not valid JSON.
pub fn decode_control(text: &str) -> Option<ControlMessage> {
    let body = text.strip_prefix(CONTROL_PREFIX)?;
    serde_json::from_str(body).ok()
}

// ============================================================================
// Internal Events
// ============================================================================

/// A decoded control message, dispatched with `match` instead of by name
#[derive(Debug, Clone, PartialEq)]
pub enum InternalEvent {
    /// Client asks to join the lobby with a pairing
    Register {
        pairing: Option<Pairing>,
        origin: Option<String>,
    },
    /// Broker announces the peer and this side's role
    PeerConnected { is_initiator: bool, pairing: Pairing },
    /// Direct-channel negotiation payload for the peer
    PeerSignal(Value),
    /// Keep-alive
    Ping,
    CodeGet,
    CodeIssued(Pairing),
    CodeError(String),
    CodeValidate(Option<String>),
    CodeClaimed(Option<Pairing>),
    PairingValidate(Option<Pairing>),
    PairingValidated(bool),
    ConfigGet,
    Config(Value),
}

impl InternalEvent {
    /// Interpret a control message.
    ///
    /// Returns None for unknown names and for known names whose data does
    /// not have the expected shape. Callers ignore those.
    pub fn from_message(msg: &ControlMessage) -> Option<Self> {
        let data = &msg.data;
        let event = match msg.name.as_str() {
            CLIENT_REGISTER => InternalEvent::Register {
                pairing: Pairing::from_value(data),
                origin: data.get("origin").and_then(Value::as_str).map(String::from),
            },
            PEER_CONNECTED => InternalEvent::PeerConnected {
                is_initiator: data.get("isInitiator")?.as_bool()?,
                pairing: Pairing::from_value(data.get("pairing")?)?,
            },
            PEER_SIGNAL => InternalEvent::PeerSignal(data.clone()),
            PEER_PING => InternalEvent::Ping,
            CODE_GET => InternalEvent::CodeGet,
            CODE_ISSUED => InternalEvent::CodeIssued(Pairing::from_value(data)?),
            CODE_ERROR => InternalEvent::CodeError(
                data.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("pairing could not be generated")
                    .to_string(),
            ),
            CODE_VALIDATE => InternalEvent::CodeValidate(
                data.get("code").and_then(Value::as_str).map(String::from),
            ),
            CODE_CLAIMED => InternalEvent::CodeClaimed(Pairing::from_value(data)),
            PAIRING_VALIDATE => InternalEvent::PairingValidate(Pairing::from_value(data)),
            PAIRING_VALIDATED => {
                InternalEvent::PairingValidated(data.get("isValid")?.as_bool()?)
            }
            CONFIG_GET => InternalEvent::ConfigGet,
            CONFIG => InternalEvent::Config(data.clone()),
            _ => return None,
        };
        Some(event)
    }

    /// Build the wire envelope for this event
    pub fn to_message(&self) -> ControlMessage {
        match self {
            InternalEvent::Register { pairing, origin } => {
                let mut data = pairing.as_ref().map(Pairing::to_value).unwrap_or_else(|| json!({}));
                if let (Some(origin), Some(obj)) = (origin, data.as_object_mut()) {
                    obj.insert("origin".to_string(), Value::String(origin.clone()));
                }
                ControlMessage::new(CLIENT_REGISTER, data)
            }
            InternalEvent::PeerConnected {
                is_initiator,
                pairing,
            } => ControlMessage::new(
                PEER_CONNECTED,
                json!({ "isInitiator": is_initiator, "pairing": pairing.to_value() }),
            ),
            InternalEvent::PeerSignal(signal) => ControlMessage::new(PEER_SIGNAL, signal.clone()),
            InternalEvent::Ping => ControlMessage::new(PEER_PING, json!({})),
            InternalEvent::CodeGet => ControlMessage::new(CODE_GET, json!({})),
            InternalEvent::CodeIssued(pairing) => ControlMessage::new(CODE_ISSUED, pairing.to_value()),
            InternalEvent::CodeError(message) => {
                ControlMessage::new(CODE_ERROR, json!({ "message": message }))
            }
            InternalEvent::CodeValidate(code) => {
                ControlMessage::new(CODE_VALIDATE, json!({ "code": code }))
            }
            InternalEvent::CodeClaimed(pairing) => ControlMessage::new(
                CODE_CLAIMED,
                pairing.as_ref().map(Pairing::to_value).unwrap_or_else(|| json!({})),
            ),
            InternalEvent::PairingValidate(pairing) => ControlMessage::new(
                PAIRING_VALIDATE,
                pairing.as_ref().map(Pairing::to_value).unwrap_or_else(|| json!({})),
            ),
            InternalEvent::PairingValidated(is_valid) => {
                ControlMessage::new(PAIRING_VALIDATED, json!({ "isValid": is_valid }))
            }
            InternalEvent::ConfigGet => ControlMessage::new(CONFIG_GET, json!({})),
            InternalEvent::Config(config) => ControlMessage::new(CONFIG, config.clone()),
        }
    }

    pub fn into_payload(self) -> Payload {
        self.to_message().into_payload()
    }

    /// Messages a client may send that the broker hands to the paired peer
    pub fn is_peer_bound(&self) -> bool {
        matches!(self, InternalEvent::PeerSignal(_) | InternalEvent::Ping)
    }
}
