//! Configuration system for the NATTRA CLI.
//!
//! Addresses of remote nodes are written `ip:port@node-id`, with the node id
//! in hexadecimal, the same form they are logged in.

use anyhow::Context as _;
use nattra_core::{Address, NodeId};
use nattra_stun::{ServerPair, StunClientConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// NATTRA configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Local node
    #[serde(default)]
    pub node: NodeConfig,
    /// NAT classifier
    #[serde(default)]
    pub stun: StunConfig,
    /// STUN server role
    #[serde(default)]
    pub stun_server: StunServerConfig,
    /// Rendezvous parent role
    #[serde(default)]
    pub parent: ParentConfig,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node id in hex; a random id is used when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The two local addresses used for classification
    #[serde(default = "default_node_addresses")]
    pub addresses: Vec<String>,
}

/// NAT classifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StunConfig {
    /// Echo timeout in milliseconds
    #[serde(default = "default_echo_timeout_ms")]
    pub echo_timeout_ms: u64,
    /// Primary and secondary address of server A, then of server B
    #[serde(default)]
    pub servers: Vec<String>,
}

/// STUN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StunServerConfig {
    /// Address the server is probed on first
    #[serde(default = "default_stun_primary")]
    pub primary: String,
    /// Same IP, other port
    #[serde(default = "default_stun_secondary")]
    pub secondary: String,
    /// Partner server addresses used for other-IP replies
    #[serde(default)]
    pub partner: Vec<String>,
}

/// Rendezvous parent configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ParentConfig {
    /// Address the parent listens on; defaults to the first node address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    /// Public addresses of registered children
    #[serde(default)]
    pub children: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_node_addresses() -> Vec<String> {
    vec!["0.0.0.0:40000".to_string(), "0.0.0.0:40001".to_string()]
}

fn default_echo_timeout_ms() -> u64 {
    2000
}

fn default_stun_primary() -> String {
    "0.0.0.0:3478".to_string()
}

fn default_stun_secondary() -> String {
    "0.0.0.0:3479".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: None,
            addresses: default_node_addresses(),
        }
    }
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            echo_timeout_ms: default_echo_timeout_ms(),
            servers: Vec::new(),
        }
    }
}

impl Default for StunServerConfig {
    fn default() -> Self {
        Self {
            primary: default_stun_primary(),
            secondary: default_stun_secondary(),
            partner: Vec::new(),
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

/// Parse `ip:port@hex-id`
///
/// # Errors
///
/// Returns an error if either part is malformed.
pub fn parse_address(s: &str) -> anyhow::Result<Address> {
    let (socket, id) = s
        .rsplit_once('@')
        .ok_or_else(|| anyhow::anyhow!("address '{}' missing node id (expected ip:port@id)", s))?;
    let socket: SocketAddr = socket
        .parse()
        .with_context(|| format!("address '{s}' has an invalid socket"))?;
    Ok(Address::new(socket, parse_node_id(id)?))
}

/// Parse a hexadecimal node id
///
/// # Errors
///
/// Returns an error if `s` is not hexadecimal.
pub fn parse_node_id(s: &str) -> anyhow::Result<NodeId> {
    let id = u64::from_str_radix(s, 16).with_context(|| format!("invalid node id '{s}'"))?;
    Ok(NodeId(id))
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load `path`, or the defaults when it does not exist
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathBuf::from("nattra.toml")
    }

    /// Local node id, random when not configured
    ///
    /// # Errors
    ///
    /// Returns an error if the configured id is malformed.
    pub fn node_id(&self) -> anyhow::Result<NodeId> {
        match &self.node.id {
            Some(id) => parse_node_id(id),
            None => Ok(NodeId::random()),
        }
    }

    /// Local classification address pair
    ///
    /// # Errors
    ///
    /// Returns an error unless exactly two socket addresses are configured.
    pub fn local_pair(&self, id: NodeId) -> anyhow::Result<[Address; 2]> {
        let [first, second] = self.node.addresses.as_slice() else {
            anyhow::bail!(
                "node.addresses must hold exactly 2 addresses, got {}",
                self.node.addresses.len()
            );
        };
        Ok([
            Address::new(first.parse()?, id),
            Address::new(second.parse()?, id),
        ])
    }

    /// The two STUN servers probed by the classifier
    ///
    /// # Errors
    ///
    /// Returns an error unless exactly four addresses are configured.
    pub fn stun_servers(&self) -> anyhow::Result<[ServerPair; 2]> {
        let addresses = self
            .stun
            .servers
            .iter()
            .map(|s| parse_address(s))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let [a_primary, a_secondary, b_primary, b_secondary] = addresses.as_slice() else {
            anyhow::bail!(
                "stun.servers must hold 4 addresses (A primary, A secondary, B primary, B secondary), got {}",
                addresses.len()
            );
        };
        Ok([
            ServerPair::new(*a_primary, *a_secondary),
            ServerPair::new(*b_primary, *b_secondary),
        ])
    }

    /// Classifier configuration
    #[must_use]
    pub fn stun_client(&self) -> StunClientConfig {
        StunClientConfig {
            echo_timeout: Duration::from_millis(self.stun.echo_timeout_ms),
            ..StunClientConfig::default()
        }
    }

    /// STUN server addresses and optional partner
    ///
    /// # Errors
    ///
    /// Returns an error if an address is malformed or the partner is not a
    /// pair.
    pub fn stun_server(&self, id: NodeId) -> anyhow::Result<([Address; 2], Option<[Address; 2]>)> {
        let primary = Address::new(self.stun_server.primary.parse()?, id);
        let secondary = Address::new(self.stun_server.secondary.parse()?, id);

        let partner = match self.stun_server.partner.as_slice() {
            [] => None,
            [p, s] => Some([parse_address(p)?, parse_address(s)?]),
            other => anyhow::bail!("stun_server.partner must hold 0 or 2 addresses, got {}", other.len()),
        };
        Ok(([primary, secondary], partner))
    }

    /// Parent listen address and registered children
    ///
    /// # Errors
    ///
    /// Returns an error if an address is malformed.
    pub fn parent(&self, id: NodeId) -> anyhow::Result<(Address, Vec<Address>)> {
        let listen = match &self.parent.listen {
            Some(listen) => listen.parse()?,
            None => self
                .node
                .addresses
                .first()
                .ok_or_else(|| anyhow::anyhow!("no parent.listen and no node address"))?
                .parse()?,
        };
        let children = self
            .parent
            .children
            .iter()
            .map(|s| parse_address(s))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok((Address::new(listen, id), children))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let id = self.node_id()?;
        self.local_pair(id)?;

        if self.stun.echo_timeout_ms == 0 || self.stun.echo_timeout_ms > 60_000 {
            anyhow::bail!("stun.echo_timeout_ms must be between 1 and 60000");
        }
        if !self.stun.servers.is_empty() {
            self.stun_servers()?;
        }

        let ([primary, secondary], _) = self.stun_server(id)?;
        if primary.ip() != secondary.ip() || primary.port() == secondary.port() {
            anyhow::bail!("stun_server.primary and secondary must share an IP and differ in port");
        }

        self.parent(id)?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.addresses.len(), 2);
        assert_eq!(config.stun.echo_timeout_ms, 2000);
        assert_eq!(config.stun_server.primary, "0.0.0.0:3478");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_address() {
        let a = parse_address("1.0.0.1:3478@00000000000000ff").unwrap();
        assert_eq!(a.socket, "1.0.0.1:3478".parse().unwrap());
        assert_eq!(a.id, NodeId(0xff));
        assert_eq!(parse_address(&a.to_string()).unwrap(), a);

        assert!(parse_address("1.0.0.1:3478").is_err());
        assert!(parse_address("nonsense@ff").is_err());
        assert!(parse_address("1.0.0.1:3478@zz").is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.node.addresses.pop();
        assert!(config.validate().is_err());

        config = Config::default();
        config.stun.servers = vec!["1.0.0.1:3478@1".to_string()];
        assert!(config.validate().is_err());

        config = Config::default();
        config.stun_server.secondary = "0.0.0.0:3478".to_string();
        assert!(config.validate().is_err());

        config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_sections() {
        let toml_str = r#"
            [node]
            id = "2a"
            addresses = ["192.168.1.10:4000", "192.168.1.10:4001"]

            [stun]
            echo_timeout_ms = 500
            servers = ["1.0.0.1:3478@a", "1.0.0.1:3479@a", "2.0.0.1:3478@b", "2.0.0.1:3479@b"]

            [stun_server]
            primary = "1.0.0.1:3478"
            secondary = "1.0.0.1:3479"
            partner = ["2.0.0.1:3478@b", "2.0.0.1:3479@b"]

            [logging]
            level = "debug"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());

        let id = config.node_id().unwrap();
        assert_eq!(id, NodeId(0x2a));
        let servers = config.stun_servers().unwrap();
        assert_eq!(servers[1].primary.id, NodeId(0xb));
        assert_eq!(config.stun_client().echo_timeout, Duration::from_millis(500));

        let (_, partner) = config.stun_server(id).unwrap();
        assert_eq!(partner.unwrap()[0].socket, "2.0.0.1:3478".parse().unwrap());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nattra.toml");
        fs::write(&path, "[logging]\nlevel = \"warn\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.stun.echo_timeout_ms, 2000);

        let missing = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(missing.logging.level, "info");
    }
}
