//! Keep-alive for endpoint connections
//!
//! Once connected, an endpoint sends a `peer.ping` control message every
//! `KEEPALIVE_INTERVAL`. When peer monitoring is on (the peer is known to
//! exist), failing to observe any inbound traffic from it for
//! `MISSED_KEEPALIVES_THRESHOLD` intervals marks the peer dead.
//!
//! The timer is owned by one endpoint instance and is reset on every
//! start/stop, so a stale deadline can never fire against a newer
//! connection.

use std::time::{Duration, Instant};

// ============================================================================
// Constants
// ============================================================================

/// Keep-alive interval (10 seconds)
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Number of silent intervals before the peer is considered dead
pub const MISSED_KEEPALIVES_THRESHOLD: u32 = 3;

/// Silence after which the peer is dead
pub const PEER_TIMEOUT: Duration =
    Duration::from_secs(10 * MISSED_KEEPALIVES_THRESHOLD as u64);

// ============================================================================
// Keep-alive Timer
// ============================================================================

/// Keep-alive timer for one endpoint instance
#[derive(Debug, Default)]
pub struct KeepAlive {
    /// Running (set on connect, cleared on close)
    running: bool,
    /// Next time a ping is due
    next_ping: Option<Instant>,
    /// Last time anything arrived from the peer (None = not monitoring)
    last_seen: Option<Instant>,
}

impl KeepAlive {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)start the timer. The first ping is due one interval from now.
    pub fn start(&mut self, now: Instant) {
        self.running = true;
        self.next_ping = Some(now + KEEPALIVE_INTERVAL);
        self.last_seen = None;
    }

    /// Stop the timer and forget all deadlines
    pub fn stop(&mut self) {
        self.running = false;
        self.next_ping = None;
        self.last_seen = None;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Begin watching for peer silence
    pub fn monitor(&mut self, now: Instant) {
        if self.running {
            self.last_seen = Some(now);
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.last_seen.is_some()
    }

    /// Any inbound traffic from the peer counts as proof of life
    pub fn record_activity(&mut self, now: Instant) {
        if self.last_seen.is_some() {
            self.last_seen = Some(now);
        }
    }

    /// Returns true when a ping is due, and schedules the next one
    pub fn poll_send(&mut self, now: Instant) -> bool {
        match self.next_ping {
            Some(due) if self.running && now >= due => {
                self.next_ping = Some(now + KEEPALIVE_INTERVAL);
                true
            }
            _ => false,
        }
    }

    /// Peer has been silent for longer than PEER_TIMEOUT
    pub fn is_peer_dead(&self, now: Instant) -> bool {
        match self.last_seen {
            Some(seen) if self.running => now.saturating_duration_since(seen) >= PEER_TIMEOUT,
            _ => false,
        }
    }

    /// Earliest instant at which `poll_send` or `is_peer_dead` may change
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.running {
            return None;
        }
        let dead_at = self.last_seen.map(|seen| seen + PEER_TIMEOUT);
        match (self.next_ping, dead_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
