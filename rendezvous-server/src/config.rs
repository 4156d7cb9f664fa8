//! Server configuration from command-line flags
//!
//! ```text
//! rendezvous-server [--port 4433] [--cert certs/cert.pem] [--key certs/key.pem]
//!                   [--allow-origin <origin>]... [--direct-config <file.json>]
//!                   [--gc-interval-secs 60]
//! ```

use std::fmt;
use std::time::Duration;

use pairing_core::p2p::DirectConfig;
use serde_json::Value;

/// Default server port
pub const DEFAULT_PORT: u16 = 4433;

/// Default interval between lobby/session sweeps
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 60;

#[derive(Debug)]
pub enum ConfigError {
    InvalidValue { flag: &'static str, value: String },
    /// Direct-config file could not be read
    Io(String, std::io::Error),
    /// Direct-config file is not a JSON object
    Json(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue { flag, value } => {
                write!(f, "invalid value for {}: {:?}", flag, value)
            }
            ConfigError::Io(path, e) => write!(f, "cannot read {}: {}", path, e),
            ConfigError::Json(msg) => write!(f, "invalid direct config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub cert_path: String,
    pub key_path: String,
    /// Empty allows every origin
    pub allowed_origins: Vec<String>,
    /// Blob answered to `config.get`
    pub direct_config: Value,
    pub gc_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            cert_path: "certs/cert.pem".to_string(),
            key_path: "certs/key.pem".to_string(),
            allowed_origins: Vec::new(),
            direct_config: default_direct_config(),
            gc_interval: Duration::from_secs(DEFAULT_GC_INTERVAL_SECS),
        }
    }
}

impl ServerConfig {
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(port) = parse_arg(args, "--port") {
            config.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                flag: "--port",
                value: port.clone(),
            })?;
        }
        if let Some(cert) = parse_arg(args, "--cert") {
            config.cert_path = cert;
        }
        if let Some(key) = parse_arg(args, "--key") {
            config.key_path = key;
        }
        config.allowed_origins = parse_all(args, "--allow-origin");

        if let Some(path) = parse_arg(args, "--direct-config") {
            let text =
                std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(path.clone(), e))?;
            config.direct_config = parse_direct_config(&text)?;
        }
        if let Some(secs) = parse_arg(args, "--gc-interval-secs") {
            let secs: u64 = secs
                .parse()
                .ok()
                .filter(|s| *s > 0)
                .ok_or(ConfigError::InvalidValue {
                    flag: "--gc-interval-secs",
                    value: secs.clone(),
                })?;
            config.gc_interval = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

/// The blob served when no file is given
pub fn default_direct_config() -> Value {
    serde_json::to_value(DirectConfig::default()).unwrap_or_else(|_| Value::Object(Default::default()))
}

/// Parse a direct-config file; it must be a JSON object
pub fn parse_direct_config(text: &str) -> Result<Value, ConfigError> {
    let value: Value = serde_json::from_str(text).map_err(|e| ConfigError::Json(e.to_string()))?;
    if !value.is_object() {
        return Err(ConfigError::Json("expected a JSON object".to_string()));
    }
    Ok(value)
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Every value of a repeatable flag
fn parse_all(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|w| w[0] == flag)
        .map(|w| w[1].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("rendezvous-server")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_args(&args(&[])).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.cert_path, "certs/cert.pem");
        assert!(config.allowed_origins.is_empty());
        assert_eq!(config.gc_interval, Duration::from_secs(60));
        assert_eq!(config.direct_config["probeIntervalMs"], 200);
    }

    #[test]
    fn test_flags() {
        let config = ServerConfig::from_args(&args(&[
            "--port",
            "5000",
            "--cert",
            "/tmp/c.pem",
            "--key",
            "/tmp/k.pem",
            "--allow-origin",
            "https://a.example",
            "--allow-origin",
            "https://b.example",
            "--gc-interval-secs",
            "5",
        ]))
        .unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.cert_path, "/tmp/c.pem");
        assert_eq!(config.key_path, "/tmp/k.pem");
        assert_eq!(
            config.allowed_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        assert_eq!(config.gc_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_values() {
        assert!(ServerConfig::from_args(&args(&["--port", "http"])).is_err());
        assert!(ServerConfig::from_args(&args(&["--gc-interval-secs", "0"])).is_err());
        assert!(ServerConfig::from_args(&args(&["--direct-config", "/nonexistent/x.json"])).is_err());
    }

    #[test]
    fn test_parse_direct_config() {
        let value = parse_direct_config(r#"{"probeIntervalMs": 50, "iceServers": []}"#).unwrap();
        assert_eq!(value["probeIntervalMs"], 50);
        assert!(parse_direct_config("[1, 2]").is_err());
        assert!(parse_direct_config("not json").is_err());
    }
}
