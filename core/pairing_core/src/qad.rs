//! QUIC Address Discovery (QAD)
//!
//! The rendezvous server tells each client the source address it observed,
//! in a QUIC DATAGRAM. The client uses it as a server-reflexive candidate
//! for the direct channel.
//!
//! ```text
//! IPv4: | 0x01 | address (4 bytes)  | port (2 bytes, BE) |   7 bytes
//! IPv6: | 0x02 | address (16 bytes) | port (2 bytes, BE) |  19 bytes
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// OBSERVED_ADDRESS carrying an IPv4 address
pub const QAD_OBSERVED_V4: u8 = 0x01;

/// OBSERVED_ADDRESS carrying an IPv6 address
pub const QAD_OBSERVED_V6: u8 = 0x02;

/// Build an OBSERVED_ADDRESS message
pub fn build_observed_address(addr: SocketAddr) -> Vec<u8> {
    let mut msg = Vec::with_capacity(19);
    match addr.ip() {
        IpAddr::V4(ip) => {
            msg.push(QAD_OBSERVED_V4);
            msg.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            msg.push(QAD_OBSERVED_V6);
            msg.extend_from_slice(&ip.octets());
        }
    }
    msg.extend_from_slice(&addr.port().to_be_bytes());
    msg
}

/// Parse an OBSERVED_ADDRESS message
pub fn parse_observed_address(data: &[u8]) -> Option<SocketAddr> {
    let (&kind, rest) = data.split_first()?;
    let (ip, port_bytes) = match kind {
        QAD_OBSERVED_V4 if rest.len() >= 6 => {
            let octets: [u8; 4] = rest[..4].try_into().ok()?;
            (IpAddr::V4(Ipv4Addr::from(octets)), &rest[4..6])
        }
        QAD_OBSERVED_V6 if rest.len() >= 18 => {
            let octets: [u8; 16] = rest[..16].try_into().ok()?;
            (IpAddr::V6(Ipv6Addr::from(octets)), &rest[16..18])
        }
        _ => return None,
    };
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
    Some(SocketAddr::new(ip, port))
}
