//! Registration authorization
//!
//! A `client.register` message may carry the caller's origin. The server
//! holds an allow-list of origins:
//!   (empty list)          → every origin is allowed, including none
//!   (non-empty list)      → the origin must be present and listed

use std::collections::HashSet;

/// Origin allow-list for relay registrations
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: HashSet<String>,
}

impl OriginPolicy {
    /// Policy that admits every origin
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: origins
                .into_iter()
                .map(|o| normalize(&o.into()))
                .filter(|o| !o.is_empty())
                .collect(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    /// Check the origin a registration carried
    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        match origin {
            Some(origin) => self.allowed.contains(&normalize(origin)),
            None => false,
        }
    }
}

/// Origins compare case-insensitively and without a trailing slash
fn normalize(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}
