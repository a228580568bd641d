//! sdwan Configuration
//!
//! One TOML file configures every role: the control server reads `[server]`,
//! clients read `[client]`, the relay reads `[nat]`, and all of them share
//! `[network]`, `[security]` and `[logging]`.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::crypto::Algorithm;
use crate::directory::NO_ROUTE;

/// Main sdwan configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SdwanConfig {
    /// Control server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Client (edge node) settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Liveness and routing settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Relay settings
    #[serde(default)]
    pub nat: NatConfig,

    /// Transport encryption
    #[serde(default)]
    pub security: SecurityConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Control server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Control server to join
    #[serde(default = "default_server_address")]
    pub server_address: String,

    /// Stable node identifier. Generated at startup when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    /// TUN interface name
    #[serde(default = "default_device_name")]
    pub device_name: String,

    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// This node's address inside the overlay
    #[serde(default = "default_overlay_address")]
    pub address: Ipv4Addr,

    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,

    /// Public address to report; the server uses the observed one when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,

    /// Routes advertised with this node as next hop
    #[serde(default)]
    pub advertise: Vec<AdvertisedRoute>,
}

/// A route a client advertises after its handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisedRoute {
    pub destination: String,
    #[serde(default = "default_metric")]
    pub metric: u8,
}

/// Liveness and routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Keepalive period
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Peers silent for this many keepalive periods are evicted
    #[serde(default = "default_peer_timeout_multiplier")]
    pub peer_timeout_multiplier: u32,

    /// Prefix used to map a packet's destination IP to a subnet destination
    #[serde(default = "default_route_prefix_len")]
    pub route_prefix_len: u8,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatConfig {
    #[serde(default = "default_relay_server")]
    pub relay_server: String,

    #[serde(default = "default_relay_port")]
    pub relay_port: u16,

    #[serde(default = "default_relay_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_relay_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_reclaim_interval_secs")]
    pub reclaim_interval_secs: u64,
}

/// Transport encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub encryption: bool,

    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Shared key: base64 (see `sdwan genkey`) or a passphrase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Size in bytes of keys produced by `sdwan genkey`
    #[serde(default = "default_key_size")]
    pub key_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    7000
}

fn default_server_address() -> String {
    "127.0.0.1:7000".to_string()
}

fn default_device_name() -> String {
    "sdwan0".to_string()
}

fn default_mtu() -> u16 {
    1400
}

fn default_overlay_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 2)
}

fn default_prefix_len() -> u8 {
    24
}

fn default_metric() -> u8 {
    1
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_peer_timeout_multiplier() -> u32 {
    3
}

fn default_route_prefix_len() -> u8 {
    24
}

fn default_relay_server() -> String {
    "127.0.0.1".to_string()
}

fn default_relay_port() -> u16 {
    7001
}

fn default_relay_timeout_ms() -> u64 {
    5000
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_reclaim_interval_secs() -> u64 {
    60
}

fn default_algorithm() -> String {
    Algorithm::ChaCha20Poly1305.to_string()
}

fn default_key_size() -> usize {
    32
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            node_id: None,
            device_name: default_device_name(),
            mtu: default_mtu(),
            address: default_overlay_address(),
            prefix_len: default_prefix_len(),
            public_address: None,
            advertise: Vec::new(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: default_keep_alive_secs(),
            peer_timeout_multiplier: default_peer_timeout_multiplier(),
            route_prefix_len: default_route_prefix_len(),
        }
    }
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            relay_server: default_relay_server(),
            relay_port: default_relay_port(),
            handshake_timeout_ms: default_relay_timeout_ms(),
            read_timeout_ms: default_relay_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reclaim_interval_secs: default_reclaim_interval_secs(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            encryption: false,
            algorithm: default_algorithm(),
            key: None,
            key_size: default_key_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SdwanConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: SdwanConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.server.host.is_empty() {
            return Err(crate::Error::Config("server.host cannot be empty".into()));
        }

        if self.client.server_address.is_empty() {
            return Err(crate::Error::Config("client.server_address cannot be empty".into()));
        }

        if let Some(id) = &self.client.node_id {
            if id.is_empty() || id.contains(':') {
                return Err(crate::Error::Config(format!(
                    "client.node_id {:?} must be non-empty and contain no ':'",
                    id
                )));
            }
        }

        if self.client.mtu < 576 {
            return Err(crate::Error::Config(format!("client.mtu {} is below 576", self.client.mtu)));
        }

        if self.client.prefix_len > 32 || self.network.route_prefix_len > 32 {
            return Err(crate::Error::Config("prefix lengths must be at most 32".into()));
        }

        if let Some(route) = self.client.advertise.iter().find(|r| r.metric == NO_ROUTE) {
            return Err(crate::Error::Config(format!(
                "client.advertise route {} uses reserved metric {}",
                route.destination, NO_ROUTE
            )));
        }

        if self.network.keep_alive_secs == 0 {
            return Err(crate::Error::Config("network.keep_alive_secs must be positive".into()));
        }

        if self.network.peer_timeout_multiplier == 0 {
            return Err(crate::Error::Config(
                "network.peer_timeout_multiplier must be positive".into(),
            ));
        }

        if self.nat.handshake_timeout_ms == 0 || self.nat.read_timeout_ms == 0 {
            return Err(crate::Error::Config("nat timeouts must be positive".into()));
        }

        if self.nat.reclaim_interval_secs == 0 {
            return Err(crate::Error::Config("nat.reclaim_interval_secs must be positive".into()));
        }

        self.security.algorithm.parse::<Algorithm>()?;

        if !(16..=64).contains(&self.security.key_size) {
            return Err(crate::Error::Config(format!(
                "security.key_size {} must be between 16 and 64",
                self.security.key_size
            )));
        }

        if self.security.encryption
            && self.security.key.as_deref().map_or(true, |k| k.trim().is_empty())
        {
            return Err(crate::Error::Config(
                "security.key is required when encryption is enabled".into(),
            ));
        }

        Ok(())
    }

    /// Address the control server binds
    pub fn server_bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Address the relay server binds and the relay managers dial
    pub fn relay_address(&self) -> String {
        format!("{}:{}", self.nat.relay_server, self.nat.relay_port)
    }

    /// Fill in a node id if none is configured, returning the effective id
    pub fn ensure_node_id(&mut self) -> String {
        self.client
            .node_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }

    /// Get keepalive interval as Duration
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.network.keep_alive_secs)
    }

    /// Silence after which a peer is evicted
    pub fn peer_timeout(&self) -> Duration {
        self.keep_alive_interval() * self.network.peer_timeout_multiplier
    }

    pub fn relay_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.nat.handshake_timeout_ms)
    }

    pub fn relay_read_timeout(&self) -> Duration {
        Duration::from_millis(self.nat.read_timeout_ms)
    }

    pub fn relay_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.nat.idle_timeout_secs)
    }

    pub fn relay_reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.nat.reclaim_interval_secs)
    }
}

/// Resolve a `host:port` string to its first socket address
pub async fn resolve_address(address: &str) -> crate::Result<SocketAddr> {
    tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| crate::Error::Config(format!("{} did not resolve to any address", address)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 7100

[client]
server_address = "203.0.113.1:7100"
node_id = "node-1"
address = "10.0.0.2"

[[client.advertise]]
destination = "10.0.1.0"
metric = 2

[network]
keep_alive_secs = 10

[security]
encryption = true
algorithm = "xchacha20-poly1305"
key = "correct horse battery staple"
"#;

        let config = SdwanConfig::from_str(toml).unwrap();
        assert_eq!(config.server_bind_address(), "0.0.0.0:7100");
        assert_eq!(config.client.node_id.as_deref(), Some("node-1"));
        assert_eq!(config.client.address, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(config.client.advertise, vec![AdvertisedRoute { destination: "10.0.1.0".into(), metric: 2 }]);
        assert_eq!(config.peer_timeout(), Duration::from_secs(30)); // 3 keepalives
        assert_eq!(config.relay_address(), "127.0.0.1:7001");
        assert_eq!(config.relay_handshake_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_defaults() {
        let config = SdwanConfig::from_str("").unwrap();
        assert_eq!(config.server_bind_address(), "0.0.0.0:7000");
        assert_eq!(config.client.device_name, "sdwan0");
        assert_eq!(config.client.mtu, 1400);
        assert_eq!(config.keep_alive_interval(), Duration::from_secs(30));
        assert_eq!(config.relay_idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.relay_reclaim_interval(), Duration::from_secs(60));
        assert!(!config.security.encryption);
        assert_eq!(config.security.algorithm, "chacha20-poly1305");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_aes_gcm_accepted() {
        let config = SdwanConfig::from_str("[security]\nalgorithm = \"aes-256-gcm\"").unwrap();
        assert_eq!(config.security.algorithm, "aes-256-gcm");
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            "[security]\nencryption = true",
            "[security]\nalgorithm = \"aes-128-cbc\"",
            "[security]\nkey_size = 8",
            "[client]\nnode_id = \"a:b\"",
            "[client]\nmtu = 100",
            "[network]\nkeep_alive_secs = 0",
            "[network]\nroute_prefix_len = 40",
            "[[client.advertise]]\ndestination = \"10.0.1.0\"\nmetric = 255",
        ];
        for case in cases {
            assert!(SdwanConfig::from_str(case).is_err(), "accepted: {}", case);
        }
    }

    #[test]
    fn test_ensure_node_id_is_stable() {
        let mut config = SdwanConfig::default();
        let id = config.ensure_node_id();
        assert!(!id.is_empty());
        assert_eq!(config.ensure_node_id(), id);
    }

    #[test]
    fn test_to_toml_round_trip() {
        let mut config = SdwanConfig::default();
        config.client.advertise.push(AdvertisedRoute {
            destination: "10.0.1.0".into(),
            metric: 3,
        });
        config.security.key = Some("secret".into());

        let rendered = config.to_toml().unwrap();
        let parsed = SdwanConfig::from_str(&rendered).unwrap();
        assert_eq!(parsed.client.advertise, config.client.advertise);
        assert_eq!(parsed.security.key.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_resolve_address() {
        let addr = resolve_address("127.0.0.1:7001").await.unwrap();
        assert_eq!(addr, "127.0.0.1:7001".parse::<SocketAddr>().unwrap());
        assert!(resolve_address("not an address").await.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nhost = \"127.0.0.1\"\nport = 7200").unwrap();

        let config = SdwanConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server_bind_address(), "127.0.0.1:7200");
        assert!(SdwanConfig::from_file(Path::new("/nonexistent/sdwan.toml")).is_err());
    }
}
