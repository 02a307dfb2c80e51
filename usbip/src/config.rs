//! Flat, JSON-persisted daemon configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("port must be between 1 and 65535")]
    InvalidPort,
    #[error("maxConnections must be at least 1")]
    InvalidMaxConnections,
    #[error("connectionTimeout must be greater than 0")]
    InvalidConnectionTimeout,
    #[error("I/O error reading or writing config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub log_level: LogLevel,
    pub debug_mode: bool,
    pub max_connections: u32,
    pub connection_timeout: u32,
    pub allowed_devices: Vec<String>,
    pub auto_bind_devices: bool,
    pub log_file_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3240,
            log_level: LogLevel::Info,
            debug_mode: false,
            max_connections: 10,
            connection_timeout: 30,
            allowed_devices: Vec::new(),
            auto_bind_devices: false,
            log_file_path: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self.max_connections < 1 {
            return Err(ConfigError::InvalidMaxConnections);
        }

        if self.connection_timeout == 0 {
            return Err(ConfigError::InvalidConnectionTimeout);
        }

        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

/// Accepts `0.0.0.0`–`255.255.255.255`; rejects out-of-range octets, wrong
/// arity, and negative components.
pub fn validate_ipv4(addr: &str) -> bool {
    let parts: Vec<&str> = addr.split('.').collect();
    if parts.len() != 4 {
        return false;
    }

    parts.iter().all(|p| {
        !p.is_empty()
            && p.chars().all(|c| c.is_ascii_digit())
            && p.parse::<u16>().is_ok_and(|v| v <= 255)
            && (p.len() == 1 || !p.starts_with('0'))
    })
}

/// Accepts standard IPv6 forms and `::ffff:IPv4`; rejects double `::`
/// elisions and other garbage. `std`'s parser already enforces the grammar
/// (including the embedded-IPv4 suffix), so this is a thin named wrapper.
pub fn validate_ipv6(addr: &str) -> bool {
    addr.parse::<std::net::Ipv6Addr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut config = Config::default();
        config.port = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPort)));
    }

    #[test]
    fn zero_max_connections_is_rejected() {
        let mut config = Config::default();
        config.max_connections = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMaxConnections)
        ));
    }

    #[test]
    fn zero_connection_timeout_is_rejected() {
        let mut config = Config::default();
        config.connection_timeout = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConnectionTimeout)
        ));
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut config = Config::default();
        config.allowed_devices = vec!["1-1".into()];

        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(config, parsed);
    }

    #[test]
    fn ipv4_validator_accepts_documented_range() {
        assert!(validate_ipv4("0.0.0.0"));
        assert!(validate_ipv4("255.255.255.255"));
        assert!(validate_ipv4("192.168.1.1"));
    }

    #[test]
    fn ipv4_validator_rejects_malformed_forms() {
        assert!(!validate_ipv4("256.1.1.1"));
        assert!(!validate_ipv4("1.1.1"));
        assert!(!validate_ipv4("1.1.1.1.1"));
        assert!(!validate_ipv4("-1.1.1.1"));
        assert!(!validate_ipv4("01.1.1.1"));
    }

    #[test]
    fn ipv6_validator_accepts_standard_and_mapped_ipv4_forms() {
        assert!(validate_ipv6("::1"));
        assert!(validate_ipv6("2001:db8::1"));
        assert!(validate_ipv6("::ffff:192.168.1.1"));
    }

    #[test]
    fn ipv6_validator_rejects_double_elision_and_garbage() {
        assert!(!validate_ipv6(":::1"));
        assert!(!validate_ipv6("2001::db8::1"));
        assert!(!validate_ipv6("not-an-address"));
    }
}
