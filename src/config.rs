//! Server configuration
//!
//! All tunable parameters for the RPC server.
//! Values come from defaults, an optional JSON file, then CLI overrides.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::rpc::codec::DEFAULT_MAX_FRAME_SIZE;

/// Per-client request rate limit (token bucket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Tokens refilled per second
    pub per_second: u64,
    /// Bucket capacity
    pub burst: u64,
}

/// Core server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    // --- Network ---
    /// Listen address for both ports
    pub address: IpAddr,
    /// RPC listener port (0 = pick a free port)
    pub rpc_port: u16,
    /// Stream listener port (0 = pick a free port)
    pub stream_port: u16,

    // --- Timing ---
    /// Execution tick interval (milliseconds)
    pub tick_interval_ms: u64,
    /// Time allowed for a connection's first frame (milliseconds)
    pub handshake_timeout_ms: u64,
    /// How long unsent output may make no progress before the peer is
    /// dropped (milliseconds)
    pub write_stall_timeout_ms: u64,

    // --- Limits ---
    /// Largest accepted frame payload (bytes)
    pub max_frame_size: usize,
    /// Requests queued per RPC connection before `Overloaded`
    pub max_pending_requests: usize,
    /// Optional per-client request rate limit
    pub rate_limit: Option<RateLimit>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // Network
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            rpc_port: 50000,
            stream_port: 50001,

            // Timing
            tick_interval_ms: 20, // 50 Hz
            handshake_timeout_ms: 5000,
            write_stall_timeout_ms: 5000,

            // Limits
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_pending_requests: 256,
            rate_limit: None,
        }
    }
}

impl ServerConfig {
    /// Read and validate a JSON config file. Missing keys keep defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be non-zero"));
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid("max_frame_size must be non-zero"));
        }
        if self.max_pending_requests == 0 {
            return Err(ConfigError::Invalid("max_pending_requests must be non-zero"));
        }
        if self.rpc_port != 0 && self.rpc_port == self.stream_port {
            return Err(ConfigError::Invalid("rpc_port and stream_port must differ"));
        }
        if let Some(limit) = self.rate_limit {
            if limit.burst == 0 {
                return Err(ConfigError::Invalid("rate_limit.burst must be at least 1"));
            }
        }
        Ok(())
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.rpc_port)
    }

    pub fn stream_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.stream_port)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.write_stall_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let c = ServerConfig::default();
        assert!(c.validate().is_ok());
        assert_ne!(c.rpc_port, c.stream_port);
        assert!(c.tick_interval_ms > 0);
        assert!(c.handshake_timeout() > c.tick_interval());
        assert!(c.rate_limit.is_none());
    }

    #[test]
    fn serde_roundtrip() {
        let c = ServerConfig {
            rate_limit: Some(RateLimit {
                per_second: 10,
                burst: 5,
            }),
            ..ServerConfig::default()
        };
        let json = serde_json::to_string(&c).unwrap();
        let c2: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(c, c2);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let c = ServerConfig::from_json_str(r#"{ "rpc_port": 6000, "address": "0.0.0.0" }"#)
            .unwrap();
        assert_eq!(c.rpc_port, 6000);
        assert_eq!(c.address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(c.stream_port, 50001);
        assert_eq!(c.max_pending_requests, 256);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cases = [
            r#"{ "tick_interval_ms": 0 }"#,
            r#"{ "max_frame_size": 0 }"#,
            r#"{ "max_pending_requests": 0 }"#,
            r#"{ "rpc_port": 7000, "stream_port": 7000 }"#,
            r#"{ "rate_limit": { "per_second": 5, "burst": 0 } }"#,
        ];
        for json in cases {
            assert!(
                matches!(ServerConfig::from_json_str(json), Err(ConfigError::Invalid(_))),
                "accepted {json}"
            );
        }
    }

    #[test]
    fn both_ports_zero_is_allowed() {
        let c = ServerConfig {
            rpc_port: 0,
            stream_port: 0,
            ..ServerConfig::default()
        };
        assert!(c.validate().is_ok());
    }

    #[test]
    fn unparsable_json_is_a_parse_error() {
        assert!(matches!(
            ServerConfig::from_json_str("{ nope"),
            Err(ConfigError::Parse(_))
        ));
    }
}
