//! Configuration for the sync engine and the rendezvous server.
//!
//! Every section has sensible defaults, so a config file only needs the
//! values it overrides:
//!
//! ```toml
//! signaling_url = "ws://rendezvous.example:4444/ws"
//!
//! [signaling]
//! max_attempts = 8
//!
//! [awareness]
//! timeout_ms = 15000
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration of one collaborating process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Websocket URL of the rendezvous service
    pub signaling_url: String,
    pub signaling: SignalingConfig,
    pub mesh: MeshConfig,
    pub awareness: AwarenessConfig,
    pub tcp: TcpConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:4444/ws".to_string(),
            signaling: SignalingConfig::default(),
            mesh: MeshConfig::default(),
            awareness: AwarenessConfig::default(),
            tcp: TcpConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.signaling_url.is_empty() {
            return Err(ConfigError::Invalid("signaling_url is empty".into()));
        }
        if self.signaling.max_attempts == 0 {
            return Err(ConfigError::Invalid("signaling.max_attempts must be at least 1".into()));
        }
        if self.signaling.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "signaling.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if self.awareness.timeout_ms == 0 || self.awareness.check_interval_ms == 0 {
            return Err(ConfigError::Invalid("awareness intervals must be non-zero".into()));
        }
        if self.mesh.outbound_capacity == 0 || self.mesh.max_frame_len == 0 {
            return Err(ConfigError::Invalid("mesh capacities must be non-zero".into()));
        }
        Ok(())
    }
}

/// Retry policy and timeouts of the signaling client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Consecutive failed connection attempts before giving up
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Time allowed for one offer/answer exchange
    pub negotiation_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            negotiation_timeout_ms: 10_000,
        }
    }
}

impl SignalingConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Frames buffered per peer before broadcasts to it are dropped
    pub outbound_capacity: usize,
    pub max_frame_len: usize,
    /// Consecutive undecodable frames before a channel is failed
    pub max_decode_failures: u32,
    pub event_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            max_frame_len: 16 * 1024 * 1024,
            max_decode_failures: 3,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwarenessConfig {
    /// Remote entries not refreshed within this window are removed
    pub timeout_ms: u64,
    pub check_interval_ms: u64,
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            check_interval_ms: 3_000,
        }
    }
}

impl AwarenessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// Listener settings of the built-in TCP connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub bind: SocketAddr,
    /// Address advertised in offers; defaults to the bound address
    pub advertise: Option<SocketAddr>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            advertise: None,
        }
    }
}

/// Configuration of the rendezvous server binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    pub bind: SocketAddr,
    /// Members allowed per room; 0 means unlimited
    pub max_room_size: usize,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 4444)),
            max_room_size: 0,
        }
    }
}

impl RendezvousConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&source)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            signaling_url = "ws://example:1/ws"

            [signaling]
            max_attempts = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.signaling_url, "ws://example:1/ws");
        assert_eq!(config.signaling.max_attempts, 8);
        assert_eq!(config.signaling.base_delay_ms, 250);
        assert_eq!(config.awareness, AwarenessConfig::default());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = SyncConfig::from_toml_str("[signaling]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = SyncConfig::from_toml_str("signaling_url = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = SyncConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
