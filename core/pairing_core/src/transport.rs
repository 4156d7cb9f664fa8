//! QUIC relay transport (client side)
//!
//! One QUIC connection to the rendezvous server, driven by a mio poll:
//! - stream 0 carries relayed frames (see `framing`)
//! - DATAGRAMs carry QAD observed-address messages
//!
//! Writes that do not fit the stream's flow-control window are buffered
//! and retried on every flush.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use ring::rand::{SecureRandom, SystemRandom};

use crate::framing::{decode_frames, encode_frame, FrameError, Payload};
use crate::qad::parse_observed_address;
use crate::{ALPN_PROTOCOL, IDLE_TIMEOUT_MS, MAX_DATAGRAM_SIZE, RELAY_STREAM_ID};

/// mio token for the relay socket
const RELAY_SOCKET_TOKEN: Token = Token(0);

/// Application error code for a protocol violation (bad frame)
const PROTOCOL_ERROR_CODE: u64 = 2;

// ============================================================================
// Errors
// ============================================================================

/// Relay transport failures
#[derive(Debug)]
pub enum TransportError {
    Io(io::Error),
    Quic(quiche::Error),
    Frame(FrameError),
    /// Connection already closed
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "socket error: {}", e),
            TransportError::Quic(e) => write!(f, "QUIC error: {:?}", e),
            TransportError::Frame(e) => write!(f, "frame error: {}", e),
            TransportError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<quiche::Error> for TransportError {
    fn from(e: quiche::Error) -> Self {
        TransportError::Quic(e)
    }
}

impl From<FrameError> for TransportError {
    fn from(e: FrameError) -> Self {
        TransportError::Frame(e)
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// quiche client configuration (must match the rendezvous server)
pub fn client_config() -> Result<quiche::Config, quiche::Error> {
    let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)?;
    config.set_application_protos(&[ALPN_PROTOCOL])?;
    config.enable_dgram(true, 1000, 1000);
    config.set_max_idle_timeout(IDLE_TIMEOUT_MS);
    config.set_max_recv_udp_payload_size(MAX_DATAGRAM_SIZE);
    config.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);
    config.set_initial_max_data(10_000_000);
    config.set_initial_max_stream_data_bidi_local(2_000_000);
    config.set_initial_max_stream_data_bidi_remote(2_000_000);
    config.set_initial_max_streams_bidi(10);
    config.set_initial_max_streams_uni(10);
    // Self-signed server certificates are the norm for rendezvous servers
    config.verify_peer(false);
    Ok(config)
}

// ============================================================================
// Relay Transport
// ============================================================================

/// Client connection to the rendezvous server
pub struct RelayTransport {
    poll: Poll,
    events: Events,
    socket: UdpSocket,
    conn: quiche::Connection,
    server_addr: SocketAddr,
    local_addr: SocketAddr,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    /// Stream bytes not yet decoded into frames
    inbound: Vec<u8>,
    /// Frame bytes not yet accepted by the stream
    outbound: Vec<u8>,
    /// Decoded inbound payloads
    payloads: VecDeque<Payload>,
    /// Address the server observed for us (QAD)
    observed_addr: Option<SocketAddr>,
    /// close() was called or a protocol error closed the connection
    closing: bool,
}

impl fmt::Debug for RelayTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayTransport")
            .field("server_addr", &self.server_addr)
            .field("local_addr", &self.local_addr)
            .field("established", &self.conn.is_established())
            .field("observed_addr", &self.observed_addr)
            .finish()
    }
}

impl RelayTransport {
    /// Start a QUIC handshake with the rendezvous server
    pub fn connect(server_addr: SocketAddr) -> Result<Self, TransportError> {
        let mut config = client_config()?;

        let poll = Poll::new()?;
        let bind_ip = if server_addr.is_ipv6() {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        let mut socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0))?;
        poll.registry()
            .register(&mut socket, RELAY_SOCKET_TOKEN, Interest::READABLE)?;
        let local_addr = socket.local_addr()?;

        let mut scid = [0u8; quiche::MAX_CONN_ID_LEN];
        SystemRandom::new()
            .fill(&mut scid)
            .map_err(|_| TransportError::Io(io::Error::new(io::ErrorKind::Other, "rng failure")))?;
        let scid = quiche::ConnectionId::from_ref(&scid);

        let conn = quiche::connect(None, &scid, local_addr, server_addr, &mut config)?;
        log::info!("Connecting to rendezvous server at {} from {}", server_addr, local_addr);

        let mut transport = Self {
            poll,
            events: Events::with_capacity(64),
            socket,
            conn,
            server_addr,
            local_addr,
            recv_buf: vec![0u8; 65535],
            send_buf: vec![0u8; MAX_DATAGRAM_SIZE],
            inbound: Vec::new(),
            outbound: Vec::new(),
            payloads: VecDeque::new(),
            observed_addr: None,
            closing: false,
        };
        transport.flush()?;
        Ok(transport)
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn observed_addr(&self) -> Option<SocketAddr> {
        self.observed_addr
    }

    pub fn is_established(&self) -> bool {
        self.conn.is_established()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Closed, or on its way there (locally closed, draining). A closing
    /// transport must not be reused for a new pairing.
    pub fn is_closing(&self) -> bool {
        self.closing || self.conn.is_draining() || self.conn.is_closed()
    }

    /// Close reason sent by the server, if any
    pub fn peer_error(&self) -> Option<String> {
        self.conn.peer_error().map(|e| {
            format!(
                "code {} ({})",
                e.error_code,
                String::from_utf8_lossy(&e.reason)
            )
        })
    }

    /// QUIC timer deadline
    pub fn timeout(&self) -> Option<Duration> {
        self.conn.timeout()
    }

    /// Wait up to `max_wait` for socket activity, then process whatever
    /// arrived, fire QUIC timers and flush.
    pub fn wait(&mut self, max_wait: Duration) -> Result<(), TransportError> {
        let timeout = self
            .conn
            .timeout()
            .map(|t| t.min(max_wait))
            .unwrap_or(max_wait);

        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(e.into());
            }
        }

        self.process_socket()?;
        self.conn.on_timeout();
        self.read_streams()?;
        self.read_datagrams();
        self.flush()
    }

    fn process_socket(&mut self) -> Result<(), TransportError> {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            };

            let recv_info = quiche::RecvInfo {
                from,
                to: self.local_addr,
            };
            if let Err(e) = self.conn.recv(&mut self.recv_buf[..len], recv_info) {
                log::debug!("Relay recv error: {:?}", e);
            }
        }
        Ok(())
    }

    fn read_streams(&mut self) -> Result<(), TransportError> {
        for stream_id in self.conn.readable() {
            loop {
                match self.conn.stream_recv(stream_id, &mut self.recv_buf) {
                    Ok((len, fin)) => {
                        if stream_id == RELAY_STREAM_ID {
                            self.inbound.extend_from_slice(&self.recv_buf[..len]);
                        }
                        if fin {
                            break;
                        }
                    }
                    Err(quiche::Error::Done) => break,
                    Err(e) => {
                        log::debug!("stream_recv({}) error: {:?}", stream_id, e);
                        break;
                    }
                }
            }
        }

        let mut decoded = Vec::new();
        let result = decode_frames(&mut self.inbound, &mut decoded);
        self.payloads.extend(decoded);
        if let Err(e) = result {
            log::warn!("Protocol error from server: {}", e);
            self.closing = true;
            match self.conn.close(true, PROTOCOL_ERROR_CODE, b"bad frame") {
                Ok(()) | Err(quiche::Error::Done) => {}
                Err(close_err) => log::debug!("Relay close error: {:?}", close_err),
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn read_datagrams(&mut self) {
        while let Ok(len) = self.conn.dgram_recv(&mut self.recv_buf) {
            match parse_observed_address(&self.recv_buf[..len]) {
                Some(addr) => {
                    if self.observed_addr != Some(addr) {
                        log::info!("Observed address (QAD): {}", addr);
                    }
                    self.observed_addr = Some(addr);
                }
                None => log::debug!("Ignoring {} byte datagram", len),
            }
        }
    }

    /// Queue one frame on the relay stream
    pub fn send_payload(&mut self, payload: &Payload) -> Result<(), TransportError> {
        if self.conn.is_closed() {
            return Err(TransportError::Closed);
        }
        let frame = encode_frame(payload)?;
        self.outbound.extend_from_slice(&frame);
        self.flush_stream()
    }

    fn flush_stream(&mut self) -> Result<(), TransportError> {
        if self.outbound.is_empty() || !self.conn.is_established() {
            return Ok(());
        }
        match self.conn.stream_send(RELAY_STREAM_ID, &self.outbound, false) {
            Ok(written) => {
                self.outbound.drain(..written);
                Ok(())
            }
            Err(quiche::Error::Done) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Next decoded payload from the server
    pub fn recv_payload(&mut self) -> Option<Payload> {
        self.payloads.pop_front()
    }

    /// Push buffered stream data and all pending QUIC packets
    pub fn flush(&mut self) -> Result<(), TransportError> {
        self.flush_stream()?;
        loop {
            match self.conn.send(&mut self.send_buf) {
                Ok((len, send_info)) => {
                    match self.socket.send_to(&self.send_buf[..len], send_info.to) {
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            log::debug!("Relay socket busy");
                            break;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(quiche::Error::Done) => break,
                Err(e) => {
                    log::debug!("Relay send error: {:?}", e);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Close the QUIC connection (application close, code 0)
    pub fn close(&mut self, reason: &str) {
        self.closing = true;
        match self.conn.close(true, 0, reason.as_bytes()) {
            Ok(()) | Err(quiche::Error::Done) => {}
            Err(e) => log::debug!("Relay close error: {:?}", e),
        }
        if let Err(e) = self.flush() {
            log::debug!("Flush on close failed: {}", e);
        }
    }
}
