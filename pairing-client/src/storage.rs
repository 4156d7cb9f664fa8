//! Stored pairing
//!
//! The last pairing is kept as JSON (`{"code": "...", "hash": "..."}`) so
//! `resume` can reconnect to the same peer later.

use std::fmt;
use std::io;
use std::path::Path;

use pairing_core::Pairing;

#[derive(Debug)]
pub enum StorageError {
    Io(io::Error),
    Json(serde_json::Error),
    /// File parsed but the pairing is not well-formed
    Malformed,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "pairing file: {}", e),
            StorageError::Json(e) => write!(f, "pairing file is not valid JSON: {}", e),
            StorageError::Malformed => write!(f, "pairing file holds a malformed pairing"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Json(e)
    }
}

/// Read the stored pairing. A missing file is `Ok(None)`.
pub fn load_pairing(path: &Path) -> Result<Option<Pairing>, StorageError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let pairing: Pairing = serde_json::from_str(&text)?;
    if !pairing.is_well_formed() {
        return Err(StorageError::Malformed);
    }
    Ok(Some(pairing))
}

pub fn save_pairing(path: &Path, pairing: &Pairing) -> Result<(), StorageError> {
    let text = serde_json::to_string_pretty(pairing)?;
    std::fs::write(path, text)?;
    log::debug!("Saved pairing to {}", path.display());
    Ok(())
}

/// Forget the stored pairing; a missing file is fine
pub fn clear_pairing(path: &Path) -> Result<(), StorageError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_file(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pairing-client-{}-{}", std::process::id(), name))
    }

    fn sample() -> Pairing {
        Pairing::new("482913", "c".repeat(64))
    }

    #[test]
    fn test_missing_file_is_none() {
        let path = temp_file("missing.json");
        assert!(load_pairing(&path).unwrap().is_none());
        clear_pairing(&path).unwrap();
    }

    #[test]
    fn test_save_load_clear() {
        let path = temp_file("roundtrip.json");
        save_pairing(&path, &sample()).unwrap();
        assert_eq!(load_pairing(&path).unwrap(), Some(sample()));
        clear_pairing(&path).unwrap();
        assert!(load_pairing(&path).unwrap().is_none());
    }

    #[test]
    fn test_malformed_contents() {
        let path = temp_file("bad.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(load_pairing(&path), Err(StorageError::Json(_))));

        std::fs::write(&path, r#"{"code":"12","hash":"zz"}"#).unwrap();
        assert!(matches!(load_pairing(&path), Err(StorageError::Malformed)));
        clear_pairing(&path).unwrap();
    }
}
