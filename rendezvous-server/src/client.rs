//! Per-connection state for the rendezvous server

use std::net::SocketAddr;
use std::time::Instant;

use pairing_core::framing::{decode_frames, encode_frame, FrameError};
use pairing_core::{Payload, RELAY_STREAM_ID};

/// Application error code: peer went away
pub const PEER_CLOSED_CODE: u64 = 1;

/// Application error code: protocol violation (bad frame)
pub const PROTOCOL_ERROR_CODE: u64 = 2;

/// Represents a connected QUIC client
pub struct Client {
    /// The QUIC connection
    pub conn: quiche::Connection,
    /// Observed source address (for QAD)
    pub observed_addr: SocketAddr,
    /// Whether QAD has been sent for the current address
    pub qad_sent: bool,
    /// Relay-stream bytes not yet decoded into frames
    pub inbound: Vec<u8>,
    /// Encoded frames not yet accepted by the stream
    pub outbound: Vec<u8>,
    /// Close the connection once this instant passes
    pub close_at: Option<Instant>,
    /// Broker has been told about this connection
    pub attached: bool,
}

impl Client {
    pub fn new(conn: quiche::Connection, observed_addr: SocketAddr) -> Self {
        Client {
            conn,
            observed_addr,
            qad_sent: false,
            inbound: Vec::new(),
            outbound: Vec::new(),
            close_at: None,
            attached: false,
        }
    }

    /// Drain readable streams and decode complete frames from stream 0 into
    /// `out`. Data on other streams is discarded. Frames decoded before a
    /// malformed one are still delivered.
    pub fn read_frames(&mut self, buf: &mut [u8], out: &mut Vec<Payload>) -> Result<(), FrameError> {
        for stream_id in self.conn.readable() {
            loop {
                match self.conn.stream_recv(stream_id, buf) {
                    Ok((len, fin)) => {
                        if stream_id == RELAY_STREAM_ID {
                            self.inbound.extend_from_slice(&buf[..len]);
                        } else {
                            log::trace!("Discarding {} bytes on stream {}", len, stream_id);
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
        decode_frames(&mut self.inbound, out)
    }

    /// Queue one frame on the relay stream and push what flow control allows
    pub fn queue_frame(&mut self, payload: &Payload) -> Result<(), FrameError> {
        let frame = encode_frame(payload)?;
        self.outbound.extend_from_slice(&frame);
        self.flush_stream();
        Ok(())
    }

    /// Write buffered frame bytes to the relay stream
    pub fn flush_stream(&mut self) {
        if self.outbound.is_empty() || !self.conn.is_established() {
            return;
        }
        match self.conn.stream_send(RELAY_STREAM_ID, &self.outbound, false) {
            Ok(written) => {
                self.outbound.drain(..written);
            }
            Err(quiche::Error::Done) => {}
            Err(e) => log::debug!("stream_send error: {:?}", e),
        }
    }

    /// Application close; a no-op if already closing
    pub fn close(&mut self, code: u64, reason: &[u8]) {
        match self.conn.close(true, code, reason) {
            Ok(()) | Err(quiche::Error::Done) => {}
            Err(e) => log::debug!("close error: {:?}", e),
        }
    }

    /// Schedule a close after buffered frames had time to drain
    pub fn close_after(&mut self, deadline: Instant) {
        if self.close_at.is_none() {
            self.close_at = Some(deadline);
        }
    }

    pub fn close_due(&self, now: Instant) -> bool {
        self.close_at.map_or(false, |at| now >= at)
    }
}
