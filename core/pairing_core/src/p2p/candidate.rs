//! Candidate gathering for the UDP engine
//!
//! A candidate is an address the peer may be able to reach us on:
//! - host: local interface addresses (libc `getifaddrs`)
//! - server reflexive: the address the relay server observed (QAD)
//! - configured: extra addresses from the server's config blob
//!
//! Candidates are probed in priority order (host first).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::DirectConfig;

// ============================================================================
// Candidate Types
// ============================================================================

/// Where a candidate address came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CandidateType {
    /// Local network interface address
    Host,
    /// Public address observed by the relay server
    ServerReflexive,
    /// Extra address from configuration
    Configured,
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateType::Host => write!(f, "host"),
            CandidateType::ServerReflexive => write!(f, "srflx"),
            CandidateType::Configured => write!(f, "configured"),
        }
    }
}

/// A candidate address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub candidate_type: CandidateType,
    pub address: SocketAddr,
}

impl Candidate {
    pub fn host(address: SocketAddr) -> Self {
        Self {
            candidate_type: CandidateType::Host,
            address,
        }
    }

    pub fn server_reflexive(address: SocketAddr) -> Self {
        Self {
            candidate_type: CandidateType::ServerReflexive,
            address,
        }
    }

    pub fn configured(address: SocketAddr) -> Self {
        Self {
            candidate_type: CandidateType::Configured,
            address,
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.address.ip().is_loopback()
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.candidate_type, self.address)
    }
}

// ============================================================================
// Gathering
// ============================================================================

/// Gather candidates for a socket bound to `local_port`.
///
/// The reflexive candidate keeps the observed IP but uses the engine's own
/// port, since QAD observed the relay socket, not this one. Duplicates are
/// removed and the result is ordered host → srflx → configured.
pub fn gather_candidates(
    local_port: u16,
    observed_addr: Option<SocketAddr>,
    config: &DirectConfig,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = enumerate_local_addresses(local_port)
        .into_iter()
        .map(Candidate::host)
        .collect();

    if config.include_loopback {
        candidates.push(Candidate::host(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_port,
        )));
    }

    if let Some(observed) = observed_addr {
        candidates.push(Candidate::server_reflexive(SocketAddr::new(
            observed.ip(),
            local_port,
        )));
    }

    candidates.extend(config.candidates.iter().copied().map(Candidate::configured));

    dedup_candidates(candidates)
}

/// Order by type and drop repeated addresses (first occurrence wins)
pub fn dedup_candidates(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by_key(|c| c.candidate_type);
    let mut seen = Vec::with_capacity(candidates.len());
    candidates.retain(|c| {
        if seen.contains(&c.address) {
            false
        } else {
            seen.push(c.address);
            true
        }
    });
    candidates
}

// ============================================================================
// Platform-specific Interface Enumeration
// ============================================================================

/// Enumerate non-loopback IPv4 interface addresses using libc
#[cfg(unix)]
pub fn enumerate_local_addresses(port: u16) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();

    // SAFETY: getifaddrs allocates a linked list that we only read and then
    // release with freeifaddrs. Each node's ifa_addr is checked for null
    // and for AF_INET before the sockaddr_in cast.
    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return addrs;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;

            if !ifa.ifa_addr.is_null() && (*ifa.ifa_addr).sa_family as i32 == libc::AF_INET {
                let sockaddr_in = ifa.ifa_addr as *const libc::sockaddr_in;
                let ip = Ipv4Addr::from((*sockaddr_in).sin_addr.s_addr.to_ne_bytes());
                if !ip.is_loopback() {
                    addrs.push(SocketAddr::new(IpAddr::V4(ip), port));
                }
            }

            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }

    addrs
}

#[cfg(not(unix))]
pub fn enumerate_local_addresses(_port: u16) -> Vec<SocketAddr> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_loopback_and_reflexive() {
        let config = DirectConfig {
            candidates: vec!["198.51.100.7:9000".parse().unwrap()],
            ..DirectConfig::default()
        };
        let observed: SocketAddr = "203.0.113.50:61000".parse().unwrap();

        let candidates = gather_candidates(40000, Some(observed), &config);

        assert!(candidates
            .iter()
            .any(|c| c.address == "127.0.0.1:40000".parse().unwrap()));
        // Reflexive candidate uses the engine port, not the relay port
        assert!(candidates.contains(&Candidate::server_reflexive(
            "203.0.113.50:40000".parse().unwrap()
        )));
        assert_eq!(
            candidates.last(),
            Some(&Candidate::configured("198.51.100.7:9000".parse().unwrap()))
        );
    }

    #[test]
    fn test_gather_without_loopback() {
        let config = DirectConfig {
            include_loopback: false,
            ..DirectConfig::default()
        };
        let candidates = gather_candidates(40000, None, &config);
        assert!(candidates.iter().all(|c| !c.is_loopback()));
    }

    #[test]
    fn test_dedup_keeps_highest_type() {
        let addr: SocketAddr = "192.168.1.10:5000".parse().unwrap();
        let candidates = dedup_candidates(vec![
            Candidate::configured(addr),
            Candidate::server_reflexive(addr),
            Candidate::host("10.0.0.2:5000".parse().unwrap()),
        ]);

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].candidate_type, CandidateType::Host);
        assert_eq!(candidates[1], Candidate::server_reflexive(addr));
    }

    #[test]
    fn test_enumerate_local_addresses() {
        // May be empty on some systems
        for addr in enumerate_local_addresses(50000) {
            assert!(!addr.ip().is_loopback());
            assert_eq!(addr.port(), 50000);
        }
    }

    #[test]
    fn test_candidate_display() {
        let candidate = Candidate::host("192.168.1.100:50000".parse().unwrap());
        assert_eq!(candidate.to_string(), "host 192.168.1.100:50000");
    }
}
