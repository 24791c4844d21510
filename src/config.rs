//! Configuration loading from TOML
//!
//! # Configuration File Format
//!
//! ```toml
//! [ucs]
//! local_listening_address = "0.0.0.0"
//! local_listening_port = 5556
//! keep_alive_timeout = 10   # seconds, 0 disables idle timeout and pings
//!
//! [vsm]
//! peer_id = 101
//! name = "Setu VSM"
//!
//! # Simulated vehicles registered at startup
//! [[device]]
//! session_id = 42
//! name = "sim-quad-1"
//! model = "SimQuad"
//! ```
//!
//! See `setu-vsm.toml` for a complete example.

use crate::error::{Error, Result};
use crate::wire::DEFAULT_MAX_MESSAGE_LEN;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// UCS server link configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UcsConfig {
    /// Keep the entire UCS core dormant.
    ///
    /// **Default**: false
    #[serde(default)]
    pub disable: bool,

    /// Address the UCS listener binds to.
    ///
    /// **Format**: IPv4/IPv6 address (e.g., "0.0.0.0", "127.0.0.1")
    /// **Default**: "0.0.0.0"
    #[serde(default = "default_listening_address")]
    pub local_listening_address: String,

    /// Port the UCS listener binds to. 0 asks the OS for an ephemeral port.
    ///
    /// **Default**: 5556
    #[serde(default = "default_listening_port")]
    pub local_listening_port: u16,

    /// Idle timeout for peered servers, in seconds.
    ///
    /// Nonzero arms the per-second keepalive ping and the idle-timeout close.
    /// Zero disables both.
    ///
    /// **Default**: 10
    #[serde(default = "default_keep_alive_timeout")]
    pub keep_alive_timeout: u64,

    /// Leave the transport detector active while no server is connected.
    ///
    /// Key spelling matches the deployed property name.
    ///
    /// **Default**: false
    #[serde(default)]
    pub transport_detector_on_when_diconnected: bool,

    /// Upper bound on a single frame payload, in bytes.
    ///
    /// A header decoding past this bound closes the connection.
    ///
    /// **Default**: 1 MiB
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
}

fn default_listening_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listening_port() -> u16 {
    5556
}

fn default_keep_alive_timeout() -> u64 {
    10
}

fn default_max_message_len() -> usize {
    DEFAULT_MAX_MESSAGE_LEN
}

impl Default for UcsConfig {
    fn default() -> Self {
        UcsConfig {
            disable: false,
            local_listening_address: default_listening_address(),
            local_listening_port: default_listening_port(),
            keep_alive_timeout: default_keep_alive_timeout(),
            transport_detector_on_when_diconnected: false,
            max_message_len: default_max_message_len(),
        }
    }
}

/// Identity this VSM presents in its `register_peer`.
#[derive(Debug, Clone, Deserialize)]
pub struct VsmConfig {
    /// Peer id, must be nonzero.
    pub peer_id: u32,

    /// Human-readable name shown in server UIs.
    #[serde(default = "default_vsm_name")]
    pub name: String,
}

fn default_vsm_name() -> String {
    "Setu VSM".to_string()
}

impl Default for VsmConfig {
    fn default() -> Self {
        VsmConfig {
            peer_id: 1,
            name: default_vsm_name(),
        }
    }
}

/// One simulated vehicle registered at daemon startup.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Session id, must be nonzero and unique.
    pub session_id: u32,

    /// Device name reported in the registration message.
    pub name: String,

    /// Model string reported in the registration message.
    #[serde(default)]
    pub model: Option<String>,

    /// Telemetry emission period.
    ///
    /// **Units**: Milliseconds
    /// **Default**: 1000
    #[serde(default = "default_telemetry_period_ms")]
    pub telemetry_period_ms: u64,
}

fn default_telemetry_period_ms() -> u64 {
    1000
}

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ucs: UcsConfig,

    #[serde(default)]
    pub vsm: VsmConfig,

    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConfig>,
}

/// Frames below this bound cannot hold even a bare handshake message.
const MIN_MAX_MESSAGE_LEN: usize = 64;

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Validation
    ///
    /// - `vsm.peer_id` must be nonzero
    /// - `ucs.max_message_len` must be at least 64 bytes
    /// - device session ids must be nonzero and unique
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = basic_toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.vsm.peer_id == 0 {
            return Err(Error::Config("vsm.peer_id must be nonzero".to_string()));
        }

        if self.ucs.max_message_len < MIN_MAX_MESSAGE_LEN {
            return Err(Error::Config(format!(
                "ucs.max_message_len must be at least {} bytes (got {})",
                MIN_MAX_MESSAGE_LEN, self.ucs.max_message_len
            )));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.session_id == 0 {
                return Err(Error::Config(format!(
                    "device \"{}\" has session_id 0; session ids must be nonzero",
                    device.name
                )));
            }
            if !seen.insert(device.session_id) {
                return Err(Error::Config(format!(
                    "duplicate device session_id {}",
                    device.session_id
                )));
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ucs: UcsConfig::default(),
            vsm: VsmConfig::default(),
            devices: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [ucs]
            local_listening_address = "127.0.0.1"
            local_listening_port = 7777
            keep_alive_timeout = 3
            transport_detector_on_when_diconnected = true

            [vsm]
            peer_id = 101
            name = "Test VSM"

            [[device]]
            session_id = 42
            name = "sim-quad-1"
            model = "SimQuad"
        "#;
        let config: Config = basic_toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.ucs.local_listening_port, 7777);
        assert_eq!(config.ucs.keep_alive_timeout, 3);
        assert!(config.ucs.transport_detector_on_when_diconnected);
        assert_eq!(config.ucs.max_message_len, DEFAULT_MAX_MESSAGE_LEN);
        assert_eq!(config.vsm.peer_id, 101);
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].session_id, 42);
        assert_eq!(config.devices[0].telemetry_period_ms, 1000);
    }

    #[test]
    fn test_duplicate_session_id_rejected() {
        let toml = r#"
            [vsm]
            peer_id = 1

            [[device]]
            session_id = 42
            name = "a"

            [[device]]
            session_id = 42
            name = "b"
        "#;
        let config: Config = basic_toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_peer_id_rejected() {
        let toml = "[vsm]\npeer_id = 0\n";
        let config: Config = basic_toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }
}
