//! Session counters for the pairing client.
//!
//! Atomic so the data handler and the main loop can share one instance.
//! Rendered in Prometheus text format and logged when the client exits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    /// Payloads handed to the client for sending (counter)
    pub messages_sent_total: AtomicU64,
    pub bytes_sent_total: AtomicU64,
    /// Application payloads delivered by either channel (counter)
    pub messages_received_total: AtomicU64,
    pub bytes_received_total: AtomicU64,
    /// Direct channels established (counter)
    pub direct_upgrades_total: AtomicU64,
    /// Direct channels that failed to come up (counter)
    pub direct_failures_total: AtomicU64,
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
            messages_sent_total: AtomicU64::new(0),
            bytes_sent_total: AtomicU64::new(0),
            messages_received_total: AtomicU64::new(0),
            bytes_received_total: AtomicU64::new(0),
            direct_upgrades_total: AtomicU64::new(0),
            direct_failures_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent_total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_received_total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP pairing_client_messages_sent_total Payloads sent to the peer\n\
             # TYPE pairing_client_messages_sent_total counter\n\
             pairing_client_messages_sent_total {}\n\
             # HELP pairing_client_bytes_sent_total Payload bytes sent to the peer\n\
             # TYPE pairing_client_bytes_sent_total counter\n\
             pairing_client_bytes_sent_total {}\n\
             # HELP pairing_client_messages_received_total Payloads received from the peer\n\
             # TYPE pairing_client_messages_received_total counter\n\
             pairing_client_messages_received_total {}\n\
             # HELP pairing_client_bytes_received_total Payload bytes received from the peer\n\
             # TYPE pairing_client_bytes_received_total counter\n\
             pairing_client_bytes_received_total {}\n\
             # HELP pairing_client_direct_upgrades_total Direct channels established\n\
             # TYPE pairing_client_direct_upgrades_total counter\n\
             pairing_client_direct_upgrades_total {}\n\
             # HELP pairing_client_direct_failures_total Direct channels that failed\n\
             # TYPE pairing_client_direct_failures_total counter\n\
             pairing_client_direct_failures_total {}\n\
             # HELP pairing_client_uptime_seconds Client uptime in seconds\n\
             # TYPE pairing_client_uptime_seconds gauge\n\
             pairing_client_uptime_seconds {}\n",
            self.messages_sent_total.load(Ordering::Relaxed),
            self.bytes_sent_total.load(Ordering::Relaxed),
            self.messages_received_total.load(Ordering::Relaxed),
            self.bytes_received_total.load(Ordering::Relaxed),
            self.direct_upgrades_total.load(Ordering::Relaxed),
            self.direct_failures_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}
