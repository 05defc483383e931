//! Burrow configuration

use crate::session::DEFAULT_TLD;
use crate::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

fn default_tld() -> String {
    DEFAULT_TLD.to_string()
}

/// Main Burrow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BurrowConfig {
    /// Mode of operation
    pub mode: TunnelMode,

    /// Client settings (client mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientConfig>,

    /// Server settings (server mode)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    /// Trailing label appended to every query name
    #[serde(default = "default_tld")]
    pub tld: String,

    /// Enable verbose tracing
    #[serde(default)]
    pub debug: bool,
}

impl Default for BurrowConfig {
    fn default() -> Self {
        Self {
            mode: TunnelMode::Client,
            client: Some(ClientConfig::default()),
            server: None,
            tld: default_tld(),
            debug: false,
        }
    }
}

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    Client,
    Server,
}

/// Client-mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local TCP listen address
    pub listen_addr: SocketAddr,

    /// DNS resolver to tunnel through (`host:port`)
    pub dns_server: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:2222".parse().unwrap(),
            dns_server: "8.8.8.8:53".to_string(),
        }
    }
}

/// Server-mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// UDP DNS listen address
    pub listen_addr: SocketAddr,

    /// Backend TCP destination (`host:port`)
    pub tcp_dest: String,
}

impl BurrowConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate mode/section coherence and the query-name suffix.
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            TunnelMode::Client if self.client.is_none() => {
                return Err(TunnelError::InvalidConfig(
                    "client mode requires a [client] section".to_string(),
                ));
            }
            TunnelMode::Server if self.server.is_none() => {
                return Err(TunnelError::InvalidConfig(
                    "server mode requires a [server] section".to_string(),
                ));
            }
            _ => {}
        }

        if self.tld.is_empty() || self.tld.contains('.') {
            return Err(TunnelError::InvalidConfig(format!(
                "tld must be a single nonempty label, got {:?}",
                self.tld
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BurrowConfig::default();
        assert_eq!(config.mode, TunnelMode::Client);
        assert_eq!(config.tld, "edu");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_mode_requires_client_section() {
        let mut config = BurrowConfig::default();
        config.client = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_mode_requires_server_section() {
        let mut config = BurrowConfig::default();
        config.mode = TunnelMode::Server;
        assert!(config.validate().is_err());

        config.server = Some(ServerConfig {
            listen_addr: "0.0.0.0:53".parse().unwrap(),
            tcp_dest: "10.0.0.1:22".to_string(),
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tld_must_be_single_label() {
        let mut config = BurrowConfig::default();
        config.tld = "example.com".to_string();
        assert!(config.validate().is_err());

        config.tld = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = BurrowConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: BurrowConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.mode, config.mode);
        assert_eq!(parsed.tld, config.tld);
    }
}
