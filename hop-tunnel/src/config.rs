//! Configuration types for the tunnel

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use hop_channel::{PoolConfig, TransportKind};
use hop_nat::{KeyingMode, RelayConfig};

use crate::error::{Error, Result};
use crate::factory::ChannelSettings;
use crate::tunnel::TunnelConfig;

/// Main configuration structure
///
/// Every section is optional; missing sections and keys take their
/// defaults.
///
/// # Example Configuration
///
/// ```toml
/// [tunnel]
/// max_channel_count = 8
/// channel_protocol = "stream"
/// stream_channel_lifespan_ms = 30000
///
/// [relay]
/// mode = "basic"
/// idle_timeout_ms = 120000
///
/// [pool]
/// max_free_connections = 16
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Channel set sizing and pacing
    #[serde(default)]
    pub tunnel: TunnelSection,

    /// Relay side UDP forwarding
    #[serde(default)]
    pub relay: RelaySection,

    /// Stream connection reuse
    #[serde(default)]
    pub pool: PoolSection,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.tunnel.validate()?;
        self.relay.validate()?;
        self.pool.validate()
    }

    /// Runtime settings for [`Tunnel`](crate::Tunnel)
    pub fn tunnel_config(&self) -> TunnelConfig {
        let tunnel = &self.tunnel;
        TunnelConfig {
            max_channel_count: tunnel.max_channel_count,
            min_channel_count: tunnel.min_channel_count,
            protocol: tunnel.channel_protocol.into(),
            min_spawn_interval: Duration::from_millis(tunnel.min_spawn_interval_ms),
            max_spawn_interval: Duration::from_millis(tunnel.max_spawn_interval_ms),
            maintenance_interval: Duration::from_millis(tunnel.maintenance_interval_ms),
            retire_idle: Duration::from_millis(tunnel.retire_idle_ms),
            close_timeout: Duration::from_millis(tunnel.close_timeout_ms),
            packet_queue_capacity: tunnel.packet_queue_capacity,
        }
    }

    /// Per-channel settings for a [`ChannelFactory`](crate::ChannelFactory)
    pub fn channel_settings(&self) -> ChannelSettings {
        let tunnel = &self.tunnel;
        ChannelSettings {
            stream_lifespan: tunnel.stream_channel_lifespan_ms.map(Duration::from_millis),
            datagram_lifespan: tunnel.datagram_channel_lifespan_ms.map(Duration::from_millis),
            close_timeout: Duration::from_millis(tunnel.close_timeout_ms),
            datagram_queue_capacity: tunnel.packet_queue_capacity,
        }
    }

    /// Runtime settings for [`hop_nat::RelayPool`]
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            mode: self.relay.mode.into(),
            idle_timeout: Duration::from_millis(self.relay.idle_timeout_ms),
            sweep_interval: Duration::from_millis(self.relay.sweep_interval_ms),
            max_workers: self.relay.max_workers,
            ..RelayConfig::default()
        }
    }

    /// Runtime settings for [`hop_channel::ConnectionPool`]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_free_connections: self.pool.max_free_connections,
            free_idle_timeout: Duration::from_millis(self.pool.free_idle_timeout_ms),
            ..PoolConfig::default()
        }
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# Hop tunnel configuration

[tunnel]
# Upper bound on parallel channels. The effective cap is the smaller of this
# and the count advertised by the peer. (default: 8)
max_channel_count = 8

# Channels of the active protocol kept open even when idle (default: 1)
min_channel_count = 1

# Protocol for new channels: "stream" or "datagram" (default: "stream")
channel_protocol = "stream"

# Close channels idle for longer than this, in milliseconds (optional)
# stream_channel_lifespan_ms = 30000
# datagram_channel_lifespan_ms = 30000

# Spacing between channel openings, in milliseconds.
# The minimum applies while sends are waiting on busy channels.
min_spawn_interval_ms = 200
max_spawn_interval_ms = 2000

# How often the channel set is checked, in milliseconds (default: 500)
maintenance_interval_ms = 500

# Idle time before a channel of the inactive protocol is retired (default: 5000)
retire_idle_ms = 5000

# Bound on a graceful channel close (default: 3000)
close_timeout_ms = 3000

# Inbound packets buffered for the consumer (default: 1024)
packet_queue_capacity = 1024

[relay]
# "basic": one socket per source endpoint
# "extended": one socket per source and destination pair
mode = "basic"

# Retire relay sockets idle for this long, in milliseconds (default: 120000)
idle_timeout_ms = 120000

# How often idle relay sockets are swept (default: 10000)
sweep_interval_ms = 10000

# Sources beyond this count are refused (default: 2048)
max_workers = 2048

[pool]
# Idle stream connections kept for reuse (default: 16)
max_free_connections = 16

# Discard pooled connections idle for this long, in milliseconds (default: 60000)
free_idle_timeout_ms = 60000
"#
        .to_string()
    }
}

/// Protocol used for new channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelProtocol {
    #[default]
    Stream,
    Datagram,
}

impl From<ChannelProtocol> for TransportKind {
    fn from(protocol: ChannelProtocol) -> Self {
        match protocol {
            ChannelProtocol::Stream => TransportKind::Stream,
            ChannelProtocol::Datagram => TransportKind::Datagram,
        }
    }
}

impl From<TransportKind> for ChannelProtocol {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Stream => ChannelProtocol::Stream,
            TransportKind::Datagram => ChannelProtocol::Datagram,
        }
    }
}

/// Channel set settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSection {
    #[serde(default = "default_max_channel_count")]
    pub max_channel_count: usize,

    #[serde(default = "default_min_channel_count")]
    pub min_channel_count: usize,

    #[serde(default)]
    pub channel_protocol: ChannelProtocol,

    /// Idle lifespan of stream channels
    #[serde(default)]
    pub stream_channel_lifespan_ms: Option<u64>,

    /// Idle lifespan of datagram channels
    #[serde(default)]
    pub datagram_channel_lifespan_ms: Option<u64>,

    #[serde(default = "default_min_spawn_interval")]
    pub min_spawn_interval_ms: u64,

    #[serde(default = "default_max_spawn_interval")]
    pub max_spawn_interval_ms: u64,

    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_ms: u64,

    #[serde(default = "default_retire_idle")]
    pub retire_idle_ms: u64,

    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,

    #[serde(default = "default_packet_queue_capacity")]
    pub packet_queue_capacity: usize,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            max_channel_count: default_max_channel_count(),
            min_channel_count: default_min_channel_count(),
            channel_protocol: ChannelProtocol::default(),
            stream_channel_lifespan_ms: None,
            datagram_channel_lifespan_ms: None,
            min_spawn_interval_ms: default_min_spawn_interval(),
            max_spawn_interval_ms: default_max_spawn_interval(),
            maintenance_interval_ms: default_maintenance_interval(),
            retire_idle_ms: default_retire_idle(),
            close_timeout_ms: default_close_timeout(),
            packet_queue_capacity: default_packet_queue_capacity(),
        }
    }
}

impl TunnelSection {
    fn validate(&self) -> Result<()> {
        if self.max_channel_count == 0 {
            return Err(Error::Config("max_channel_count must be at least 1".into()));
        }

        if self.min_channel_count > self.max_channel_count {
            return Err(Error::Config(format!(
                "min_channel_count {} exceeds max_channel_count {}",
                self.min_channel_count, self.max_channel_count
            )));
        }

        if self.min_spawn_interval_ms > self.max_spawn_interval_ms {
            return Err(Error::Config(format!(
                "min_spawn_interval_ms {} exceeds max_spawn_interval_ms {}",
                self.min_spawn_interval_ms, self.max_spawn_interval_ms
            )));
        }

        if self.maintenance_interval_ms == 0 {
            return Err(Error::Config("maintenance_interval_ms must be non-zero".into()));
        }

        if self.packet_queue_capacity == 0 {
            return Err(Error::Config("packet_queue_capacity must be non-zero".into()));
        }

        Ok(())
    }
}

/// Relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    #[serde(default)]
    pub mode: RelayMode,

    #[serde(default = "default_relay_idle_timeout")]
    pub idle_timeout_ms: u64,

    #[serde(default = "default_relay_sweep_interval")]
    pub sweep_interval_ms: u64,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            mode: RelayMode::default(),
            idle_timeout_ms: default_relay_idle_timeout(),
            sweep_interval_ms: default_relay_sweep_interval(),
            max_workers: default_max_workers(),
        }
    }
}

impl RelaySection {
    fn validate(&self) -> Result<()> {
        if self.sweep_interval_ms == 0 {
            return Err(Error::Config("relay sweep_interval_ms must be non-zero".into()));
        }
        if self.max_workers == 0 {
            return Err(Error::Config("relay max_workers must be at least 1".into()));
        }
        Ok(())
    }
}

/// How relay sockets are keyed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    #[default]
    Basic,
    Extended,
}

impl From<RelayMode> for KeyingMode {
    fn from(mode: RelayMode) -> Self {
        match mode {
            RelayMode::Basic => KeyingMode::Basic,
            RelayMode::Extended => KeyingMode::Extended,
        }
    }
}

/// Connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_max_free_connections")]
    pub max_free_connections: usize,

    #[serde(default = "default_free_idle_timeout")]
    pub free_idle_timeout_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_free_connections: default_max_free_connections(),
            free_idle_timeout_ms: default_free_idle_timeout(),
        }
    }
}

impl PoolSection {
    fn validate(&self) -> Result<()> {
        if self.free_idle_timeout_ms == 0 && self.max_free_connections > 0 {
            return Err(Error::Config(
                "pool free_idle_timeout_ms must be non-zero when pooling is enabled".into(),
            ));
        }
        Ok(())
    }
}

// Default value functions

fn default_max_channel_count() -> usize {
    8
}

fn default_min_channel_count() -> usize {
    1
}

fn default_min_spawn_interval() -> u64 {
    200
}

fn default_max_spawn_interval() -> u64 {
    2000
}

fn default_maintenance_interval() -> u64 {
    500
}

fn default_retire_idle() -> u64 {
    5000
}

fn default_close_timeout() -> u64 {
    3000
}

fn default_packet_queue_capacity() -> usize {
    1024
}

fn default_relay_idle_timeout() -> u64 {
    120_000
}

fn default_relay_sweep_interval() -> u64 {
    10_000
}

fn default_max_workers() -> usize {
    2048
}

fn default_max_free_connections() -> usize {
    16
}

fn default_free_idle_timeout() -> u64 {
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.tunnel.max_channel_count, 8);
        assert_eq!(config.tunnel.min_channel_count, 1);
        assert_eq!(config.tunnel.channel_protocol, ChannelProtocol::Stream);
        assert!(config.tunnel.stream_channel_lifespan_ms.is_none());
        assert_eq!(config.relay.mode, RelayMode::Basic);
        assert_eq!(config.pool.max_free_connections, 16);
    }

    #[test]
    fn test_parse_sections() {
        let toml = r#"
[tunnel]
max_channel_count = 6
min_channel_count = 0
channel_protocol = "datagram"
datagram_channel_lifespan_ms = 1000

[relay]
mode = "extended"
idle_timeout_ms = 500

[pool]
max_free_connections = 2
"#;

        let config = Config::from_toml(toml).unwrap();

        let tunnel = config.tunnel_config();
        assert_eq!(tunnel.max_channel_count, 6);
        assert_eq!(tunnel.min_channel_count, 0);
        assert_eq!(tunnel.protocol, TransportKind::Datagram);

        let settings = config.channel_settings();
        assert_eq!(settings.datagram_lifespan, Some(Duration::from_millis(1000)));
        assert_eq!(settings.stream_lifespan, None);

        let relay = config.relay_config();
        assert_eq!(relay.mode, KeyingMode::Extended);
        assert_eq!(relay.idle_timeout, Duration::from_millis(500));
        assert_eq!(relay.max_workers, 2048);

        assert_eq!(config.pool_config().max_free_connections, 2);
    }

    #[test]
    fn test_reject_min_above_max() {
        let toml = r#"
[tunnel]
max_channel_count = 2
min_channel_count = 3
"#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_reject_zero_channels() {
        let toml = r#"
[tunnel]
max_channel_count = 0
min_channel_count = 0
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_reject_inverted_spawn_interval() {
        let toml = r#"
[tunnel]
min_spawn_interval_ms = 3000
max_spawn_interval_ms = 1000
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_reject_zero_relay_workers() {
        let toml = r#"
[relay]
max_workers = 0
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_protocol() {
        let toml = r#"
[tunnel]
channel_protocol = "carrier-pigeon"
"#;
        let err = Config::from_toml(toml).unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_sample_config_parses() {
        let config = Config::from_toml(&Config::sample()).unwrap();
        assert_eq!(config.tunnel.max_channel_count, 8);
        assert_eq!(config.relay.max_workers, 2048);
    }
}
