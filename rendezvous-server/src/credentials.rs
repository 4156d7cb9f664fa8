//! Credential store
//!
//! Issues `{code, hash}` pairings and claims/validates them against a
//! `TtlStore`. Both directions are stored (`hash -> code`, `code -> hash`):
//! - a fresh pairing lives for 130 seconds
//! - claiming the code deletes it and re-arms the hash for 7 days
//! - validation checks that `hash` still maps to `code`

use std::fmt;

use pairing_core::pairing::{code_is_valid, CODE_LEN};
use pairing_core::Pairing;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};

use crate::store::{StoreError, TtlStore};

/// Lifetime of an unclaimed pairing, in seconds
pub const EXPIRE_CODE_SECS: u64 = 130;

/// Lifetime of a claimed pairing hash, in seconds (7 days)
pub const EXPIRE_PAIRED_SECS: u64 = 60 * 60 * 24 * 7;

/// Random bytes digested into one hash
const HASH_SEED_LEN: usize = 64;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum CredentialError {
    /// A store write during generation was not confirmed
    PairingGenerateFailed,
    /// The system random source failed
    Random,
    Store(StoreError),
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::PairingGenerateFailed => write!(f, "PairingGenerateFailed"),
            CredentialError::Random => write!(f, "random source failure"),
            CredentialError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CredentialError {}

impl From<StoreError> for CredentialError {
    fn from(e: StoreError) -> Self {
        CredentialError::Store(e)
    }
}

// ============================================================================
// Code Derivation
// ============================================================================

/// djb2-xor string hash, walking the input from the end
pub fn string_hash(s: &str) -> u32 {
    s.bytes()
        .rev()
        .fold(5381u32, |hash, b| hash.wrapping_mul(33) ^ u32::from(b))
}

/// Derive a numeric code from a hash's numeric value and a random factor.
///
/// Returns the first six decimal digits of the product, or None when the
/// product has fewer than six digits. Callers re-roll; codes are never
/// zero-padded.
pub fn derive_code(numeric_hash: u32, factor: u32) -> Option<String> {
    let product = (u64::from(numeric_hash) + 1) * u64::from(factor);
    let digits = product.to_string();
    if digits.len() < CODE_LEN {
        return None;
    }
    Some(digits[..CODE_LEN].to_string())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ============================================================================
// Credential Store
// ============================================================================

/// Issues and checks pairing credentials
pub struct CredentialStore<S: TtlStore> {
    store: S,
    rng: SystemRandom,
}

impl<S: TtlStore> CredentialStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            rng: SystemRandom::new(),
        }
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// 64 random bytes, hex-encoded, digested with SHA-256 to 64 hex chars
    fn random_hash(&self) -> Result<String, CredentialError> {
        let mut seed = [0u8; HASH_SEED_LEN];
        self.rng
            .fill(&mut seed)
            .map_err(|_| CredentialError::Random)?;
        let digest = digest::digest(&digest::SHA256, to_hex(&seed).as_bytes());
        Ok(to_hex(digest.as_ref()))
    }

    fn random_factor(&self) -> Result<u32, CredentialError> {
        let mut bytes = [0u8; 4];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| CredentialError::Random)?;
        Ok(u32::from_be_bytes(bytes))
    }

    fn generate_hash(&mut self) -> Result<String, CredentialError> {
        loop {
            let hash = self.random_hash()?;
            if !self.store.exists(&hash)? {
                return Ok(hash);
            }
            log::debug!("Hash collision, re-rolling");
        }
    }

    fn generate_code(&mut self, hash: &str) -> Result<String, CredentialError> {
        let numeric = string_hash(hash);
        loop {
            let code = match derive_code(numeric, self.random_factor()?) {
                Some(code) => code,
                None => {
                    log::trace!("Derived code too short, re-rolling");
                    continue;
                }
            };
            if !self.store.exists(&code)? {
                return Ok(code);
            }
            log::debug!("Code collision, re-rolling");
        }
    }

    /// Issue a fresh pairing, stored in both directions for 130 seconds
    pub fn generate(&mut self) -> Result<Pairing, CredentialError> {
        let hash = self.generate_hash()?;
        let code = self.generate_code(&hash)?;

        let hash_is_set = self.store.set(&hash, &code, EXPIRE_CODE_SECS)?;
        let code_is_set = self.store.set(&code, &hash, EXPIRE_CODE_SECS)?;
        if !(hash_is_set && code_is_set) {
            log::warn!("Store did not confirm pairing writes");
            return Err(CredentialError::PairingGenerateFailed);
        }

        log::info!("Issued pairing code {}", code);
        Ok(Pairing::new(code, hash))
    }

    /// Claim a pairing by its code.
    ///
    /// The code is single-use: it is deleted and the hash re-armed for
    /// 7 days. Returns None for malformed, unknown or consumed codes.
    pub fn consume_by_code(&mut self, code: &str) -> Result<Option<Pairing>, CredentialError> {
        if !code_is_valid(code) || !self.store.exists(code)? {
            return Ok(None);
        }
        let hash = match self.store.get(code)? {
            Some(hash) => hash,
            None => return Ok(None),
        };
        self.store.delete(code)?;
        self.store.expire(&hash, EXPIRE_PAIRED_SECS)?;

        log::info!("Pairing code {} claimed", code);
        Ok(Some(Pairing::new(code, hash)))
    }

    /// Check that `pairing.hash` is live and still maps to `pairing.code`
    pub fn validate(&mut self, pairing: &Pairing) -> Result<bool, CredentialError> {
        if !pairing.is_well_formed() || !self.store.exists(&pairing.hash)? {
            return Ok(false);
        }
        Ok(self.store.get(&pairing.hash)?.as_deref() == Some(pairing.code.as_str()))
    }
}
