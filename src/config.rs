//! Router configuration
//!
//! All knobs of the onion router live here. Every section implements
//! `Default`, and missing JSON fields fall back to those defaults, so a
//! collaborator can ship a partial configuration document.

use crate::error::{OnionError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest path the circuit engine will build (guard + one more hop)
pub const MIN_PATH_LENGTH: usize = 2;

/// Top-level configuration for an [`OnionRouter`](crate::OnionRouter)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Identifier reported in stats (random if unset)
    pub node_id: Option<String>,

    /// Circuit building and lifetime
    pub circuit: CircuitConfig,

    /// Directory fetching
    pub directory: DirectoryConfig,

    /// Guard failure tracking
    pub guards: GuardConfig,

    /// Hidden service publication
    pub hidden_service: HiddenServiceConfig,
}

/// Circuit engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Path length used when the caller does not ask for one
    pub default_path_length: usize,

    /// Longest path the engine agrees to build
    pub max_path_length: usize,

    /// Age after which `rotate_circuits` closes a circuit (seconds)
    pub lifetime_secs: u64,

    /// Maximum number of circuits registered at once
    pub max_circuits: usize,

    /// Path selections tried before a build is reported as failed
    pub max_build_attempts: u32,

    /// Upper bound on a single hop's key agreement (milliseconds)
    pub handshake_timeout_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            default_path_length: 3,
            max_path_length: 8,
            lifetime_secs: 10 * 60, // 10 minutes
            max_circuits: 256,
            max_build_attempts: 3,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl CircuitConfig {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Directory fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Upper bound on one snapshot fetch (milliseconds)
    pub fetch_timeout_ms: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 30_000,
        }
    }
}

impl DirectoryConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Guard failure tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Consecutive handshake failures before a guard is benched
    pub max_failures_before_bad: u32,

    /// How long a benched guard stays out of selection (seconds)
    pub bad_guard_timeout_secs: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_failures_before_bad: 5,
            bad_guard_timeout_secs: 60 * 60, // 1 hour
        }
    }
}

/// Hidden service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HiddenServiceConfig {
    /// Number of introduction points published per service
    pub intro_points: usize,
}

impl Default for HiddenServiceConfig {
    fn default() -> Self {
        Self { intro_points: 3 }
    }
}

impl RouterConfig {
    /// Short-lived, longer circuits
    pub fn paranoid() -> Self {
        Self {
            circuit: CircuitConfig {
                default_path_length: 4,
                lifetime_secs: 2 * 60,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Long-lived two-hop circuits
    /// WARNING: a two-hop path lets the guard see the exit
    pub fn relaxed() -> Self {
        Self {
            circuit: CircuitConfig {
                default_path_length: 2,
                lifetime_secs: 30 * 60,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Set the node id reported in stats
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Reject configurations the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        let circuit = &self.circuit;

        if circuit.default_path_length < MIN_PATH_LENGTH {
            return Err(OnionError::Config(format!(
                "default_path_length must be at least {}",
                MIN_PATH_LENGTH
            )));
        }
        if circuit.max_path_length < circuit.default_path_length {
            return Err(OnionError::Config(format!(
                "max_path_length ({}) is below default_path_length ({})",
                circuit.max_path_length, circuit.default_path_length
            )));
        }
        if circuit.max_circuits == 0 {
            return Err(OnionError::Config("max_circuits must be non-zero".into()));
        }
        if circuit.max_build_attempts == 0 {
            return Err(OnionError::Config(
                "max_build_attempts must be non-zero".into(),
            ));
        }
        if circuit.handshake_timeout_ms == 0 || self.directory.fetch_timeout_ms == 0 {
            return Err(OnionError::Config("timeouts must be non-zero".into()));
        }
        if self.hidden_service.intro_points == 0 {
            return Err(OnionError::Config("intro_points must be non-zero".into()));
        }
        if self.guards.max_failures_before_bad == 0 {
            return Err(OnionError::Config(
                "max_failures_before_bad must be non-zero".into(),
            ));
        }

        Ok(())
    }

    /// Serialize configuration to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| OnionError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Deserialize and validate configuration from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| OnionError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RouterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.circuit.default_path_length, 3);
        assert_eq!(config.circuit.lifetime(), Duration::from_secs(600));
    }

    #[test]
    fn test_presets() {
        assert!(RouterConfig::paranoid().validate().is_ok());
        assert!(RouterConfig::relaxed().validate().is_ok());
        assert!(RouterConfig::paranoid().circuit.lifetime_secs < RouterConfig::default().circuit.lifetime_secs);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = RouterConfig::from_json(r#"{"node_id":"relay-a","circuit":{"lifetime_secs":5}}"#)
            .unwrap();
        assert_eq!(config.node_id.as_deref(), Some("relay-a"));
        assert_eq!(config.circuit.lifetime_secs, 5);
        assert_eq!(config.circuit.max_path_length, 8);
        assert_eq!(config.hidden_service.intro_points, 3);
    }

    #[test]
    fn test_json_roundtrip() {
        let config = RouterConfig::paranoid().with_node_id("n1");
        let restored = RouterConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(restored.node_id, config.node_id);
        assert_eq!(restored.circuit.default_path_length, 4);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = RouterConfig::default();
        config.circuit.default_path_length = 1;
        assert!(config.validate().is_err());

        let mut config = RouterConfig::default();
        config.circuit.max_path_length = 2;
        assert!(config.validate().is_err());

        assert!(RouterConfig::from_json(r#"{"hidden_service":{"intro_points":0}}"#).is_err());
        assert!(RouterConfig::from_json("not json").is_err());
    }
}
