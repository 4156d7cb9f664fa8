//! Lightweight Prometheus-compatible metrics for the rendezvous server.
//!
//! Uses atomic counters for lock-free instrumentation. Rendered in
//! Prometheus text exposition format and logged at every GC sweep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    /// Current QUIC connections (gauge)
    pub active_connections: AtomicU64,
    /// Connections waiting in the lobby (gauge)
    pub lobby_waiting: AtomicU64,
    /// Successful `client.register` handshakes (counter)
    pub registrations_total: AtomicU64,
    /// Registrations answered with HANDSHAKE_FAILED (counter)
    pub registration_rejections_total: AtomicU64,
    /// Paired sessions formed (counter)
    pub sessions_total: AtomicU64,
    /// Pairings issued via `code.get` (counter)
    pub credentials_issued_total: AtomicU64,
    /// Payload bytes forwarded between peers (counter)
    pub relay_bytes_total: AtomicU64,
    /// Frames forwarded between peers (counter)
    pub relay_frames_total: AtomicU64,
    /// Garbage-collection sweeps run (counter)
    pub gc_sweeps_total: AtomicU64,
    pub start_time: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            active_connections: AtomicU64::new(0),
            lobby_waiting: AtomicU64::new(0),
            registrations_total: AtomicU64::new(0),
            registration_rejections_total: AtomicU64::new(0),
            sessions_total: AtomicU64::new(0),
            credentials_issued_total: AtomicU64::new(0),
            relay_bytes_total: AtomicU64::new(0),
            relay_frames_total: AtomicU64::new(0),
            gc_sweeps_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Increment a counter by one
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement a gauge, saturating at zero
    pub fn dec(gauge: &AtomicU64) {
        let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP pairing_active_connections Current number of QUIC connections\n\
             # TYPE pairing_active_connections gauge\n\
             pairing_active_connections {}\n\
             # HELP pairing_lobby_waiting Connections waiting for a peer\n\
             # TYPE pairing_lobby_waiting gauge\n\
             pairing_lobby_waiting {}\n\
             # HELP pairing_registrations_total Total successful registrations\n\
             # TYPE pairing_registrations_total counter\n\
             pairing_registrations_total {}\n\
             # HELP pairing_registration_rejections_total Total rejected registrations\n\
             # TYPE pairing_registration_rejections_total counter\n\
             pairing_registration_rejections_total {}\n\
             # HELP pairing_sessions_total Total paired sessions formed\n\
             # TYPE pairing_sessions_total counter\n\
             pairing_sessions_total {}\n\
             # HELP pairing_credentials_issued_total Total pairing credentials issued\n\
             # TYPE pairing_credentials_issued_total counter\n\
             pairing_credentials_issued_total {}\n\
             # HELP pairing_relay_bytes_total Total payload bytes relayed between peers\n\
             # TYPE pairing_relay_bytes_total counter\n\
             pairing_relay_bytes_total {}\n\
             # HELP pairing_relay_frames_total Total frames relayed between peers\n\
             # TYPE pairing_relay_frames_total counter\n\
             pairing_relay_frames_total {}\n\
             # HELP pairing_gc_sweeps_total Total garbage-collection sweeps\n\
             # TYPE pairing_gc_sweeps_total counter\n\
             pairing_gc_sweeps_total {}\n\
             # HELP pairing_uptime_seconds Server uptime in seconds\n\
             # TYPE pairing_uptime_seconds gauge\n\
             pairing_uptime_seconds {}\n",
            self.active_connections.load(Ordering::Relaxed),
            self.lobby_waiting.load(Ordering::Relaxed),
            self.registrations_total.load(Ordering::Relaxed),
            self.registration_rejections_total.load(Ordering::Relaxed),
            self.sessions_total.load(Ordering::Relaxed),
            self.credentials_issued_total.load(Ordering::Relaxed),
            self.relay_bytes_total.load(Ordering::Relaxed),
            self.relay_frames_total.load(Ordering::Relaxed),
            self.gc_sweeps_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}
