//! Rendezvous broker
//!
//! Matches two connections that register the same pairing hash and relays
//! frames between them. The broker owns every table; the server loop feeds
//! it connection events and applies the `BrokerAction`s it returns, so the
//! broker itself never touches a socket.
//!
//! ```text
//!   register(A, h) ──► lobby[h] = A
//!   register(B, h) ──► lobby.remove(h) ─► sessions[h] = (A, B)
//!                                          A ◄─ peer.connected{initiator}
//!                                          B ◄─ peer.connected{joiner}
//!   close(A)       ──► sessions[h] = null, close(B)
//!   gc             ──► drop null entries
//! ```

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use pairing_core::control::{decode_control, is_control, HANDSHAKE_FAILED, HANDSHAKE_SUCCESS};
use pairing_core::{InternalEvent, Pairing, Payload};
use serde_json::Value;

use crate::auth::OriginPolicy;
use crate::credentials::CredentialStore;
use crate::metrics::Metrics;
use crate::store::TtlStore;

// ============================================================================
// Types
// ============================================================================

/// Why the broker asks for a connection to be closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Registration rejected; HANDSHAKE_FAILED was queued first
    HandshakeFailed,
    /// The paired peer went away
    PeerClosed,
}

/// Side effect for the server loop to apply
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerAction<K> {
    /// Write one frame to a connection's relay stream
    Send { to: K, payload: Payload },
    /// Close a connection
    Close { conn: K, reason: CloseReason },
}

/// Two paired connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session<K> {
    pub initiator: K,
    pub joiner: K,
}

impl<K: PartialEq> Session<K> {
    fn contains(&self, conn: &K) -> bool {
        self.initiator == *conn || self.joiner == *conn
    }
}

/// Per-connection routing state.
///
/// `peer` is a lookup key, not ownership: closing one side never waits on
/// the other.
#[derive(Debug)]
struct Link<K> {
    /// Hash this connection registered with
    hash: Option<String>,
    peer: Option<K>,
    /// Registration was refused; the connection is closing and every
    /// further frame from it is dropped
    rejected: bool,
}

impl<K> Default for Link<K> {
    fn default() -> Self {
        Self {
            hash: None,
            peer: None,
            rejected: false,
        }
    }
}

// ============================================================================
// Broker
// ============================================================================

pub struct Broker<K, S: TtlStore> {
    credentials: CredentialStore<S>,
    policy: OriginPolicy,
    /// Blob answered to `config.get`
    direct_config: Value,
    metrics: Arc<Metrics>,
    /// Connections waiting for a peer, by hash. None once closed.
    lobby: HashMap<String, Option<K>>,
    /// Paired connections, by hash. None once either side closed.
    sessions: HashMap<String, Option<Session<K>>>,
    links: HashMap<K, Link<K>>,
}

impl<K, S> Broker<K, S>
where
    K: Clone + Eq + Hash + Debug,
    S: TtlStore,
{
    pub fn new(
        credentials: CredentialStore<S>,
        policy: OriginPolicy,
        direct_config: Value,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            credentials,
            policy,
            direct_config,
            metrics,
            lobby: HashMap::new(),
            sessions: HashMap::new(),
            links: HashMap::new(),
        }
    }

    pub fn credentials_mut(&mut self) -> &mut CredentialStore<S> {
        &mut self.credentials
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Connection currently waiting in the lobby under `hash`
    pub fn lobby_entry(&self, hash: &str) -> Option<&K> {
        self.lobby.get(hash).and_then(Option::as_ref)
    }

    pub fn session(&self, hash: &str) -> Option<&Session<K>> {
        self.sessions.get(hash).and_then(Option::as_ref)
    }

    /// Table sizes including nulled entries: (lobby, sessions)
    pub fn table_sizes(&self) -> (usize, usize) {
        (self.lobby.len(), self.sessions.len())
    }

    pub fn peer_of(&self, conn: &K) -> Option<&K> {
        self.links.get(conn).and_then(|l| l.peer.as_ref())
    }

    pub fn is_registered(&self, conn: &K) -> bool {
        self.links.get(conn).map_or(false, |l| l.hash.is_some())
    }

    // ========================================================================
    // Connection events
    // ========================================================================

    /// A transport was accepted; its identity is not known yet
    pub fn on_connect(&mut self, conn: K) {
        log::debug!("Broker: connection {:?} attached", conn);
        if self.links.insert(conn, Link::default()).is_none() {
            Metrics::inc(&self.metrics.active_connections);
        }
    }

    /// One frame arrived on a connection's relay stream
    pub fn on_payload(&mut self, conn: &K, payload: Payload) -> Vec<BrokerAction<K>> {
        match self.links.get(conn) {
            Some(link) if link.rejected => {
                log::trace!("Broker: dropping frame from rejected {:?}", conn);
                return Vec::new();
            }
            Some(_) => {}
            None => {
                log::debug!("Broker: payload from unknown connection {:?}", conn);
                return Vec::new();
            }
        }

        let text = payload.as_text().unwrap_or_default();
        if !is_control(text) {
            return self.forward(conn, payload);
        }

        let msg = match decode_control(text) {
            Some(msg) => msg,
            None => {
                log::debug!("Broker: dropping malformed control message from {:?}", conn);
                return Vec::new();
            }
        };

        match InternalEvent::from_message(&msg) {
            Some(InternalEvent::Register { pairing, origin }) => {
                self.on_register(conn, pairing, origin.as_deref())
            }
            Some(InternalEvent::CodeGet) => {
                let reply = match self.credentials.generate() {
                    Ok(pairing) => {
                        Metrics::inc(&self.metrics.credentials_issued_total);
                        InternalEvent::CodeIssued(pairing)
                    }
                    Err(e) => {
                        log::warn!("Pairing generation failed for {:?}: {}", conn, e);
                        InternalEvent::CodeError(e.to_string())
                    }
                };
                vec![reply_to(conn, reply)]
            }
            Some(InternalEvent::CodeValidate(code)) => {
                let claimed = match code {
                    Some(code) => self.credentials.consume_by_code(&code).unwrap_or_else(|e| {
                        log::warn!("Code claim failed: {}", e);
                        None
                    }),
                    None => None,
                };
                vec![reply_to(conn, InternalEvent::CodeClaimed(claimed))]
            }
            Some(InternalEvent::PairingValidate(pairing)) => {
                let is_valid = pairing.map_or(false, |p| self.validate(&p));
                vec![reply_to(conn, InternalEvent::PairingValidated(is_valid))]
            }
            Some(InternalEvent::ConfigGet) => {
                vec![reply_to(conn, InternalEvent::Config(self.direct_config.clone()))]
            }
            Some(event) if event.is_peer_bound() => self.forward(conn, payload),
            Some(event) => {
                log::debug!("Broker: ignoring broker-issued event {:?} sent by {:?}", event, conn);
                Vec::new()
            }
            // Unknown names belong to the endpoints
            None => self.forward(conn, payload),
        }
    }

    /// Handle `client.register`
    pub fn on_register(
        &mut self,
        conn: &K,
        pairing: Option<Pairing>,
        origin: Option<&str>,
    ) -> Vec<BrokerAction<K>> {
        match self.links.get(conn) {
            Some(link) if link.hash.is_some() => {
                log::debug!("Broker: {:?} is already registered, ignoring", conn);
                return Vec::new();
            }
            Some(link) if link.rejected => return Vec::new(),
            Some(_) => {}
            None => return Vec::new(),
        }

        let pairing = match self.admit(conn, pairing, origin) {
            Some(pairing) => pairing,
            None => {
                Metrics::inc(&self.metrics.registration_rejections_total);
                if let Some(link) = self.links.get_mut(conn) {
                    link.rejected = true;
                }
                return vec![
                    BrokerAction::Send {
                        to: conn.clone(),
                        payload: Payload::from(HANDSHAKE_FAILED),
                    },
                    BrokerAction::Close {
                        conn: conn.clone(),
                        reason: CloseReason::HandshakeFailed,
                    },
                ];
            }
        };

        Metrics::inc(&self.metrics.registrations_total);
        let hash = pairing.hash.clone();
        if let Some(link) = self.links.get_mut(conn) {
            link.hash = Some(hash.clone());
        }

        let mut actions = vec![BrokerAction::Send {
            to: conn.clone(),
            payload: Payload::from(HANDSHAKE_SUCCESS),
        }];

        // Check-and-consume of the lobby entry is a single remove
        match self.lobby.remove(&hash).flatten() {
            Some(waiting) => {
                Metrics::dec(&self.metrics.lobby_waiting);
                Metrics::inc(&self.metrics.sessions_total);
                log::info!(
                    "Paired {:?} (initiator) with {:?} (joiner) on code {}",
                    waiting,
                    conn,
                    pairing.code
                );

                if let Some(link) = self.links.get_mut(&waiting) {
                    link.peer = Some(conn.clone());
                }
                if let Some(link) = self.links.get_mut(conn) {
                    link.peer = Some(waiting.clone());
                }
                self.sessions.insert(
                    hash,
                    Some(Session {
                        initiator: waiting.clone(),
                        joiner: conn.clone(),
                    }),
                );

                actions.push(reply_to(
                    &waiting,
                    InternalEvent::PeerConnected {
                        is_initiator: true,
                        pairing: pairing.clone(),
                    },
                ));
                actions.push(reply_to(
                    conn,
                    InternalEvent::PeerConnected {
                        is_initiator: false,
                        pairing,
                    },
                ));
            }
            None => {
                log::info!("{:?} waiting in lobby for code {}", conn, pairing.code);
                Metrics::inc(&self.metrics.lobby_waiting);
                self.lobby.insert(hash, Some(conn.clone()));
            }
        }

        actions
    }

    /// A transport closed. Safe to call any number of times.
    pub fn on_close(&mut self, conn: &K) -> Vec<BrokerAction<K>> {
        let link = match self.links.remove(conn) {
            Some(link) => link,
            None => return Vec::new(),
        };
        Metrics::dec(&self.metrics.active_connections);

        let hash = link.hash.clone().or_else(|| {
            link.peer
                .as_ref()
                .and_then(|peer| self.links.get(peer))
                .and_then(|l| l.hash.clone())
        });

        if let Some(hash) = hash {
            if let Some(entry) = self.lobby.get_mut(&hash) {
                if entry.as_ref() == Some(conn) {
                    *entry = None;
                    Metrics::dec(&self.metrics.lobby_waiting);
                    log::debug!("Broker: {:?} left the lobby", conn);
                }
            }
            if let Some(entry) = self.sessions.get_mut(&hash) {
                if entry.as_ref().map_or(false, |s| s.contains(conn)) {
                    *entry = None;
                    log::debug!("Broker: session for {:?} ended", conn);
                }
            }
        }

        let mut actions = Vec::new();
        if let Some(peer) = link.peer {
            if let Some(peer_link) = self.links.get_mut(&peer) {
                peer_link.peer = None;
                log::info!("Closing {:?}: peer {:?} disconnected", peer, conn);
                actions.push(BrokerAction::Close {
                    conn: peer,
                    reason: CloseReason::PeerClosed,
                });
            }
        }
        actions
    }

    /// Drop lobby and session entries nulled by earlier closes.
    /// Returns the number of entries removed.
    pub fn collect_garbage(&mut self) -> usize {
        let before = self.lobby.len() + self.sessions.len();
        self.lobby.retain(|_, v| v.is_some());
        self.sessions.retain(|_, v| v.is_some());
        Metrics::inc(&self.metrics.gc_sweeps_total);
        before - (self.lobby.len() + self.sessions.len())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn validate(&mut self, pairing: &Pairing) -> bool {
        self.credentials.validate(pairing).unwrap_or_else(|e| {
            log::warn!("Pairing validation failed: {}", e);
            false
        })
    }

    /// Registration checks. Returns the pairing to register under, or None
    /// to reject.
    fn admit(&mut self, conn: &K, pairing: Option<Pairing>, origin: Option<&str>) -> Option<Pairing> {
        let pairing = match pairing {
            Some(p) => p,
            None => {
                log::info!("Rejecting {:?}: registration without a pairing", conn);
                return None;
            }
        };
        if !self.policy.is_allowed(origin) {
            log::info!("Rejecting {:?}: origin {:?} not allowed", conn, origin);
            return None;
        }
        if !self.validate(&pairing) {
            log::info!("Rejecting {:?}: invalid pairing", conn);
            return None;
        }
        if self.session(&pairing.hash).is_some() {
            log::info!("Rejecting {:?}: pairing already has two peers", conn);
            return None;
        }
        Some(pairing)
    }

    /// Relay a frame verbatim to the paired peer, or drop it
    fn forward(&mut self, conn: &K, payload: Payload) -> Vec<BrokerAction<K>> {
        match self.peer_of(conn).cloned() {
            Some(peer) => {
                Metrics::inc(&self.metrics.relay_frames_total);
                self.metrics
                    .relay_bytes_total
                    .fetch_add(payload.len() as u64, std::sync::atomic::Ordering::Relaxed);
                log::trace!("Relaying {} bytes {:?} -> {:?}", payload.len(), conn, peer);
                vec![BrokerAction::Send { to: peer, payload }]
            }
            None => {
                log::trace!("Dropping {} bytes from unpaired {:?}", payload.len(), conn);
                Vec::new()
            }
        }
    }
}

fn reply_to<K: Clone>(conn: &K, event: InternalEvent) -> BrokerAction<K> {
    BrokerAction::Send {
        to: conn.clone(),
        payload: event.into_payload(),
    }
}
