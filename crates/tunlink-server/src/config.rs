// ============================================
// File: crates/tunlink-server/src/config.rs
// ============================================
//! # Server Configuration
//!
//! ## Creation Reason
//! One TOML file describes the TUN interface, the protocol engine tuning,
//! the direct outbound and logging.
//!
//! ## Main Functionality
//! - `ServerConfig`: main configuration structure
//! - TOML file loading and parsing
//! - Validation before anything is created
//! - Conversion into `TunConfig` and `StackConfig`
//!
//! ## Configuration Sections
//! - `tun`: interface name, MTU, IPv4 prefix, auto-route
//! - `stack`: TCP buffers, half-open limit, keep-alive, UDP queue depth
//! - `outbound`: direct dispatcher settings
//! - `logging`: log level
//!
//! ## Example Configuration
//! ```toml
//! [tun]
//! name = "tunlink0"
//! mtu = 9000
//! inet4_address = "10.255.0.1/24"
//! auto_route = false
//!
//! [stack]
//! tcp_buffer_size = 20480
//! tcp_max_in_flight = 1024
//!
//! [outbound]
//! bind_interface = "eth0"
//! connect_timeout_secs = 10
//!
//! [logging]
//! level = "info"
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - All config changes require restart
//! - `mtu = 0` (or absent) selects 9000
//! - With `auto_route`, set `outbound.bind_interface` or the direct
//!   outbound loops back into the interface
//!
//! ## Last Modified
//! v0.1.0 - Initial configuration implementation

use std::path::Path;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::info;

use tunlink_core::netstack::{StackConfig, DEFAULT_MAX_IN_FLIGHT, DEFAULT_TCP_BUFFER_SIZE};
use tunlink_transport::traits::TunConfig;

use crate::error::{Result, ServerError};

// ============================================
// ServerConfig
// ============================================

/// Main server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TUN interface.
    #[serde(default)]
    pub tun: TunSection,

    /// Protocol engine tuning.
    #[serde(default)]
    pub stack: StackSection,

    /// Direct outbound.
    #[serde(default)]
    pub outbound: OutboundSection,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ServerConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    /// Returns error if file cannot be read, parsed or validated.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.display().to_string();

        info!("Loading configuration from: {}", path_str);

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ServerError::config_load(&path_str, e.to_string()))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ServerError::config_load(&path_str, e.to_string()))?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Parses and validates configuration from a string.
    ///
    /// # Errors
    /// Parse or validation failure.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ServerError::config_load("<string>", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// `ConfigInvalid` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        self.tun_config()?
            .validate()
            .map_err(|e| ServerError::config_invalid("tun", e.to_string()))?;
        self.stack.validate()?;
        self.outbound.validate()?;
        Ok(())
    }

    /// Serializes configuration to a TOML string.
    #[must_use]
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Device session parameters.
    ///
    /// # Errors
    /// `ConfigInvalid` if the IPv4 prefix does not parse.
    pub fn tun_config(&self) -> Result<TunConfig> {
        let inet4: Ipv4Net = self.tun.inet4_address.parse().map_err(|_| {
            ServerError::config_invalid(
                "tun.inet4_address",
                format!("'{}' is not an IPv4 prefix", self.tun.inet4_address),
            )
        })?;

        Ok(TunConfig::new(&self.tun.name)
            .with_inet4(inet4)
            .with_mtu(self.tun.mtu)
            .with_auto_route(self.tun.auto_route))
    }

    /// Protocol engine tuning.
    #[must_use]
    pub fn stack_config(&self) -> StackConfig {
        StackConfig {
            tcp_buffer_size: self.stack.tcp_buffer_size,
            tcp_max_in_flight: self.stack.tcp_max_in_flight,
            sack: self.stack.sack,
            moderate_receive_buffer: self.stack.moderate_receive_buffer,
            keep_alive_interval: Duration::from_secs(self.stack.keep_alive_interval_secs),
            udp_queue_depth: self.stack.udp_queue_depth,
        }
    }
}

// ============================================
// TunSection
// ============================================

/// TUN interface section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunSection {
    /// Interface name.
    #[serde(default = "default_tun_name")]
    pub name: String,

    /// MTU, 0 for the default.
    #[serde(default)]
    pub mtu: u32,

    /// IPv4 address and prefix of the interface.
    #[serde(default = "default_inet4_address")]
    pub inet4_address: String,

    /// Install a default route through the interface.
    #[serde(default)]
    pub auto_route: bool,
}

fn default_tun_name() -> String {
    "tunlink0".to_string()
}

fn default_inet4_address() -> String {
    "10.255.0.1/24".to_string()
}

impl Default for TunSection {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            mtu: 0,
            inet4_address: default_inet4_address(),
            auto_route: false,
        }
    }
}

// ============================================
// StackSection
// ============================================

/// Protocol engine section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackSection {
    /// TCP send and receive buffer size in bytes.
    #[serde(default = "default_tcp_buffer_size")]
    pub tcp_buffer_size: usize,

    /// Half-open connection limit.
    #[serde(default = "default_tcp_max_in_flight")]
    pub tcp_max_in_flight: usize,

    /// Selective acknowledgment.
    #[serde(default = "default_true")]
    pub sack: bool,

    /// Receive buffer auto-moderation.
    #[serde(default = "default_true")]
    pub moderate_receive_buffer: bool,

    /// Keep-alive probe interval in seconds.
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_secs: u64,

    /// Datagrams queued per UDP flow.
    #[serde(default = "default_udp_queue_depth")]
    pub udp_queue_depth: usize,
}

const fn default_tcp_buffer_size() -> usize {
    DEFAULT_TCP_BUFFER_SIZE
}

const fn default_tcp_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

const fn default_true() -> bool {
    true
}

const fn default_keep_alive_interval() -> u64 {
    75
}

const fn default_udp_queue_depth() -> usize {
    64
}

impl StackSection {
    fn validate(&self) -> Result<()> {
        if self.tcp_buffer_size == 0 {
            return Err(ServerError::config_invalid(
                "stack.tcp_buffer_size",
                "must be greater than 0",
            ));
        }
        if self.tcp_max_in_flight == 0 {
            return Err(ServerError::config_invalid(
                "stack.tcp_max_in_flight",
                "must be greater than 0",
            ));
        }
        if self.keep_alive_interval_secs == 0 {
            return Err(ServerError::config_invalid(
                "stack.keep_alive_interval_secs",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for StackSection {
    fn default() -> Self {
        Self {
            tcp_buffer_size: default_tcp_buffer_size(),
            tcp_max_in_flight: default_tcp_max_in_flight(),
            sack: true,
            moderate_receive_buffer: true,
            keep_alive_interval_secs: default_keep_alive_interval(),
            udp_queue_depth: default_udp_queue_depth(),
        }
    }
}

// ============================================
// OutboundSection
// ============================================

/// Direct outbound section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundSection {
    /// Interface outbound sockets are bound to.
    #[serde(default)]
    pub bind_interface: Option<String>,

    /// TCP connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle time after which a UDP flow is dropped, in seconds.
    #[serde(default = "default_udp_idle_timeout")]
    pub udp_idle_timeout_secs: u64,
}

const fn default_connect_timeout() -> u64 {
    10
}

const fn default_udp_idle_timeout() -> u64 {
    60
}

impl OutboundSection {
    fn validate(&self) -> Result<()> {
        if let Some(name) = &self.bind_interface {
            if name.is_empty() || name.len() > 15 {
                return Err(ServerError::config_invalid(
                    "outbound.bind_interface",
                    "must be 1 to 15 characters",
                ));
            }
        }
        if self.connect_timeout_secs == 0 {
            return Err(ServerError::config_invalid(
                "outbound.connect_timeout_secs",
                "must be greater than 0",
            ));
        }
        if self.udp_idle_timeout_secs == 0 {
            return Err(ServerError::config_invalid(
                "outbound.udp_idle_timeout_secs",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// TCP connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// UDP idle timeout.
    #[must_use]
    pub const fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }
}

impl Default for OutboundSection {
    fn default() -> Self {
        Self {
            bind_interface: None,
            connect_timeout_secs: default_connect_timeout(),
            udp_idle_timeout_secs: default_udp_idle_timeout(),
        }
    }
}

// ============================================
// LoggingConfig
// ============================================

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());

        let tun = config.tun_config().unwrap();
        assert_eq!(tun.name, "tunlink0");
        assert_eq!(tun.effective_mtu(), 9000);
        assert!(!tun.auto_route);

        let stack = config.stack_config();
        assert_eq!(stack, StackConfig::default());
    }

    #[test]
    fn test_full_config_format() {
        let toml = r#"
            [tun]
            name = "tl0"
            mtu = 1500
            inet4_address = "172.19.0.1/30"
            auto_route = true

            [stack]
            tcp_buffer_size = 65536
            tcp_max_in_flight = 256
            sack = false

            [outbound]
            bind_interface = "eth0"
            connect_timeout_secs = 5

            [logging]
            level = "debug"
        "#;

        let config = ServerConfig::from_toml(toml).unwrap();
        let tun = config.tun_config().unwrap();
        assert_eq!(tun.name, "tl0");
        assert_eq!(tun.mtu, 1500);
        assert_eq!(tun.inet4.to_string(), "172.19.0.1/30");
        assert!(tun.auto_route);

        let stack = config.stack_config();
        assert_eq!(stack.tcp_buffer_size, 65536);
        assert_eq!(stack.tcp_max_in_flight, 256);
        assert!(!stack.sack);
        assert!(stack.moderate_receive_buffer);

        assert_eq!(config.outbound.bind_interface.as_deref(), Some("eth0"));
        assert_eq!(config.outbound.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.outbound.udp_idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases = [
            "[tun]\ninet4_address = \"10.0.0.1\"",
            "[tun]\nname = \"\"",
            "[tun]\nmtu = 100",
            "[stack]\ntcp_buffer_size = 0",
            "[outbound]\nbind_interface = \"an-interface-name-too-long\"",
            "[outbound]\nconnect_timeout_secs = 0",
        ];
        for case in cases {
            let err = ServerConfig::from_toml(case).unwrap_err();
            assert!(err.is_config_error(), "{case}: {err}");
        }
    }

    #[test]
    fn test_toml_roundtrip_keeps_values() {
        let mut config = ServerConfig::default();
        config.tun.auto_route = true;
        config.outbound.bind_interface = Some("wlan0".into());

        let parsed = ServerConfig::from_toml(&config.to_toml()).unwrap();
        assert!(parsed.tun.auto_route);
        assert_eq!(parsed.outbound.bind_interface.as_deref(), Some("wlan0"));
    }
}
