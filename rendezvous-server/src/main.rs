//! Pairing Rendezvous Server
//!
//! A QUIC server that:
//! - Issues and validates pairing credentials (`code.get`, `code.validate`,
//!   `pairing.validate`) and serves the direct-channel config
//! - Matches two clients that register the same pairing hash
//! - Relays frames on stream 0 between matched pairs
//! - Implements QAD (QUIC Address Discovery)

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use pairing_core::qad;
use pairing_core::{ALPN_PROTOCOL, IDLE_TIMEOUT_MS, MAX_DATAGRAM_SIZE};
use ring::hmac;
use ring::rand::SystemRandom;

mod auth;
mod broker;
mod client;
mod config;
mod credentials;
mod metrics;
mod store;

use auth::OriginPolicy;
use broker::{Broker, BrokerAction, CloseReason};
use client::{Client, PEER_CLOSED_CODE, PROTOCOL_ERROR_CODE};
use config::ServerConfig;
use credentials::CredentialStore;
use metrics::Metrics;
use store::MemoryStore;

// ============================================================================
// Constants
// ============================================================================

/// mio token for the UDP socket
const SOCKET_TOKEN: Token = Token(0);

/// Time a rejected client gets to read HANDSHAKE_FAILED before the close
const HANDSHAKE_FAILED_LINGER: Duration = Duration::from_millis(500);

/// Upper bound on one poll, so the shutdown flag is seen promptly
const MAX_POLL_WAIT: Duration = Duration::from_secs(1);

type ConnId = quiche::ConnectionId<'static>;

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let args: Vec<String> = std::env::args().collect();
    let config = ServerConfig::from_args(&args)?;

    log::info!("Pairing Rendezvous Server starting...");
    log::info!("  Port: {}", config.port);
    log::info!("  Cert: {}", config.cert_path);
    log::info!("  Key:  {}", config.key_path);
    log::info!("  ALPN: {:?}", std::str::from_utf8(ALPN_PROTOCOL));
    if config.allowed_origins.is_empty() {
        log::info!("  Origins: any");
    } else {
        log::info!("  Origins: {}", config.allowed_origins.join(", "));
    }

    // SIGINT/SIGTERM set the flag; the loop exits cleanly
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let mut server = Server::new(&config, shutdown)?;
    server.run()
}

// ============================================================================
// Server Structure
// ============================================================================

struct Server {
    /// mio poll instance
    poll: Poll,
    /// UDP socket
    socket: UdpSocket,
    local_addr: SocketAddr,
    /// quiche configuration
    config: quiche::Config,
    /// Connected clients (by connection ID)
    clients: HashMap<ConnId, Client>,
    /// Pairing, lobby and relay routing
    broker: Broker<ConnId, MemoryStore>,
    metrics: Arc<Metrics>,
    /// Derives our connection ID from the client's original DCID, so
    /// retransmitted Initials land on the same connection
    conn_id_seed: hmac::Key,
    /// Stream read buffer
    stream_buf: Vec<u8>,
    /// Send buffer
    send_buf: Vec<u8>,
    gc_interval: Duration,
    next_gc: Instant,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    fn new(
        server_config: &ServerConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        // Create quiche configuration
        let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)?;

        // Load TLS certificates
        config.load_cert_chain_from_pem_file(&server_config.cert_path)?;
        config.load_priv_key_from_pem_file(&server_config.key_path)?;

        // CRITICAL: ALPN must match the client
        config.set_application_protos(&[ALPN_PROTOCOL])?;

        // DATAGRAM carries QAD
        config.enable_dgram(true, 1000, 1000);

        config.set_max_idle_timeout(IDLE_TIMEOUT_MS);
        config.set_max_recv_udp_payload_size(MAX_DATAGRAM_SIZE);
        config.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);
        config.set_initial_max_data(10_000_000);
        config.set_initial_max_stream_data_bidi_local(2_000_000);
        config.set_initial_max_stream_data_bidi_remote(2_000_000);
        config.set_initial_max_streams_bidi(10);
        config.set_initial_max_streams_uni(10);
        config.verify_peer(false);

        // Create mio poll and UDP socket
        let poll = Poll::new()?;
        let addr: SocketAddr = format!("0.0.0.0:{}", server_config.port).parse()?;
        let mut socket = UdpSocket::bind(addr)?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
        let local_addr = socket.local_addr()?;

        log::info!("Server listening on {}", local_addr);

        let rng = SystemRandom::new();
        let conn_id_seed = hmac::Key::generate(hmac::HMAC_SHA256, &rng)
            .map_err(|_| "Failed to generate connection ID seed")?;

        let metrics = Arc::new(Metrics::new());
        let broker = Broker::new(
            CredentialStore::new(MemoryStore::new()),
            OriginPolicy::new(server_config.allowed_origins.iter().cloned()),
            server_config.direct_config.clone(),
            Arc::clone(&metrics),
        );

        Ok(Server {
            poll,
            socket,
            local_addr,
            config,
            clients: HashMap::new(),
            broker,
            metrics,
            conn_id_seed,
            stream_buf: vec![0u8; 65535],
            send_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            gc_interval: server_config.gc_interval,
            next_gc: Instant::now() + server_config.gc_interval,
            shutdown,
        })
    }

    fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut events = Events::with_capacity(1024);

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                log::info!("Shutdown requested, closing {} connections", self.clients.len());
                self.close_all();
                return Ok(());
            }

            let timeout = self.poll_timeout(Instant::now());
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            for event in events.iter() {
                if event.token() == SOCKET_TOKEN {
                    self.process_socket()?;
                }
            }

            let now = Instant::now();
            self.process_timeouts(now);
            self.maybe_collect_garbage(now);
            self.send_pending()?;
            self.cleanup_closed();
        }
    }

    /// Earliest of: QUIC timers, lingering closes, the next GC
    fn poll_timeout(&self, now: Instant) -> Duration {
        let quic = self.clients.values().filter_map(|c| c.conn.timeout()).min();
        let linger = self
            .clients
            .values()
            .filter_map(|c| c.close_at)
            .map(|at| at.saturating_duration_since(now))
            .min();
        let gc = self.next_gc.saturating_duration_since(now);

        [quic, linger, Some(gc)]
            .into_iter()
            .flatten()
            .fold(MAX_POLL_WAIT, Duration::min)
    }

    fn process_socket(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut pkt_buf = vec![0u8; 65535];

        loop {
            let (len, from) = match self.socket.recv_from(&mut pkt_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };
            let pkt = &mut pkt_buf[..len];

            let hdr = match quiche::Header::from_slice(pkt, quiche::MAX_CONN_ID_LEN) {
                Ok(v) => v,
                Err(e) => {
                    log::debug!("Failed to parse QUIC header: {:?}", e);
                    continue;
                }
            };

            log::trace!("Received {} bytes from {} dcid={:?}", len, from, hdr.dcid);

            let dcid: ConnId = hdr.dcid.clone().into_owned();
            let derived = self.derive_conn_id(&hdr.dcid);

            let conn_id = if self.clients.contains_key(&dcid) {
                dcid
            } else if self.clients.contains_key(&derived) {
                derived
            } else if hdr.ty == quiche::Type::Initial {
                match self.handle_new_connection(&hdr, from, derived) {
                    Ok(Some(id)) => id,
                    Ok(None) => continue,
                    Err(e) => {
                        log::debug!("Failed to handle new connection: {:?}", e);
                        continue;
                    }
                }
            } else {
                log::debug!("Non-Initial packet for unknown connection");
                continue;
            };

            self.process_packet(&conn_id, pkt, from);
        }

        Ok(())
    }

    fn derive_conn_id(&self, dcid: &[u8]) -> ConnId {
        let tag = hmac::sign(&self.conn_id_seed, dcid);
        quiche::ConnectionId::from_vec(tag.as_ref()[..quiche::MAX_CONN_ID_LEN].to_vec())
    }

    /// Accept a new connection. Returns None when only a version
    /// negotiation packet was sent.
    fn handle_new_connection(
        &mut self,
        hdr: &quiche::Header,
        from: SocketAddr,
        scid: ConnId,
    ) -> Result<Option<ConnId>, Box<dyn std::error::Error>> {
        if !quiche::version_is_supported(hdr.version) {
            log::debug!("Version negotiation needed for {:?}", hdr.version);
            let len = quiche::negotiate_version(&hdr.scid, &hdr.dcid, &mut self.send_buf)?;
            self.socket.send_to(&self.send_buf[..len], from)?;
            return Ok(None);
        }

        let conn = quiche::accept(&scid, None, self.local_addr, from, &mut self.config)?;
        log::info!("New connection from {} (scid={:?})", from, scid);

        self.clients.insert(scid.clone(), Client::new(conn, from));
        Ok(Some(scid))
    }

    fn process_packet(&mut self, conn_id: &ConnId, pkt: &mut [u8], from: SocketAddr) {
        let recv_info = quiche::RecvInfo {
            from,
            to: self.local_addr,
        };

        let client = match self.clients.get_mut(conn_id) {
            Some(c) => c,
            None => return,
        };
        if let Err(e) = client.conn.recv(pkt, recv_info) {
            log::debug!("Connection recv error: {:?}", e);
            return;
        }

        // Update observed address (for QAD)
        if client.observed_addr != from {
            log::debug!("Address change detected: {} -> {}", client.observed_addr, from);
            client.observed_addr = from;
            client.qad_sent = false;
        }

        if !client.conn.is_established() {
            return;
        }

        // Clients send no DATAGRAMs of their own
        while client.conn.dgram_recv(&mut self.stream_buf).is_ok() {}

        let newly_attached = !client.attached;
        client.attached = true;
        let send_qad = !client.qad_sent;

        let mut payloads = Vec::new();
        let frames = client.read_frames(&mut self.stream_buf, &mut payloads);

        if newly_attached {
            self.broker.on_connect(conn_id.clone());
        }
        if send_qad {
            self.send_qad(conn_id);
        }

        for payload in payloads {
            let actions = self.broker.on_payload(conn_id, payload);
            self.apply_actions(actions);
        }
        if let Err(e) = frames {
            log::warn!("Protocol error from {:?}: {}", conn_id, e);
            if let Some(client) = self.clients.get_mut(conn_id) {
                client.close(PROTOCOL_ERROR_CODE, b"bad frame");
            }
        }
    }

    fn send_qad(&mut self, conn_id: &ConnId) {
        if let Some(client) = self.clients.get_mut(conn_id) {
            let qad_msg = qad::build_observed_address(client.observed_addr);
            match client.conn.dgram_send(&qad_msg) {
                Ok(_) => {
                    log::info!("Sent QAD to {:?} (observed: {})", conn_id, client.observed_addr);
                    client.qad_sent = true;
                }
                Err(e) => {
                    log::debug!("Failed to send QAD: {:?}", e);
                }
            }
        }
    }

    fn apply_actions(&mut self, actions: Vec<BrokerAction<ConnId>>) {
        for action in actions {
            match action {
                BrokerAction::Send { to, payload } => {
                    if let Some(client) = self.clients.get_mut(&to) {
                        if let Err(e) = client.queue_frame(&payload) {
                            log::warn!("Dropping frame for {:?}: {}", to, e);
                        }
                    }
                }
                BrokerAction::Close { conn, reason } => {
                    if let Some(client) = self.clients.get_mut(&conn) {
                        match reason {
                            CloseReason::HandshakeFailed => {
                                client.close_after(Instant::now() + HANDSHAKE_FAILED_LINGER);
                            }
                            CloseReason::PeerClosed => {
                                client.flush_stream();
                                client.close(PEER_CLOSED_CODE, b"peer closed");
                            }
                        }
                    }
                }
            }
        }
    }

    fn process_timeouts(&mut self, now: Instant) {
        for client in self.clients.values_mut() {
            client.conn.on_timeout();
            if client.close_due(now) {
                client.close_at = None;
                client.close(0, b"handshake failed");
            }
        }
    }

    fn maybe_collect_garbage(&mut self, now: Instant) {
        if now < self.next_gc {
            return;
        }
        self.next_gc = now + self.gc_interval;

        let swept = self.broker.collect_garbage();
        let expired = self.broker.credentials_mut().store_mut().purge_expired();
        let (lobby, sessions) = self.broker.table_sizes();
        log::info!(
            "GC: swept {} entries, purged {} expired keys (lobby={}, sessions={})",
            swept,
            expired,
            lobby,
            sessions
        );
        log::info!("Metrics:\n{}", self.metrics.render());
    }

    fn send_pending(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        for client in self.clients.values_mut() {
            client.flush_stream();
            loop {
                match client.conn.send(&mut self.send_buf) {
                    Ok((len, send_info)) => {
                        log::trace!("Sending {} bytes to {:?}", len, send_info.to);
                        match self.socket.send_to(&self.send_buf[..len], send_info.to) {
                            Ok(_) => {}
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                log::debug!("Socket busy, deferring send");
                                break;
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                    Err(quiche::Error::Done) => break,
                    Err(e) => {
                        log::debug!("Send error: {:?}", e);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn cleanup_closed(&mut self) {
        let closed: Vec<_> = self
            .clients
            .iter()
            .filter(|(_, c)| c.conn.is_closed())
            .map(|(id, _)| id.clone())
            .collect();

        for conn_id in closed {
            if let Some(client) = self.clients.remove(&conn_id) {
                match client.conn.peer_error() {
                    Some(e) => log::info!(
                        "Connection closed: {:?} (peer code {}, {})",
                        conn_id,
                        e.error_code,
                        String::from_utf8_lossy(&e.reason)
                    ),
                    None => log::info!("Connection closed: {:?}", conn_id),
                }
                if client.attached {
                    let actions = self.broker.on_close(&conn_id);
                    self.apply_actions(actions);
                }
            }
        }
    }

    fn close_all(&mut self) {
        for client in self.clients.values_mut() {
            client.close(0, b"server shutdown");
        }
        if let Err(e) = self.send_pending() {
            log::debug!("Flush on shutdown failed: {}", e);
        }
    }
}
