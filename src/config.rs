//! Configuration file support
//!
//! The YAML file carries the same settings as the command line; values given
//! on the command line win.
//!
//! ```yaml
//! log_level: info
//! relay:
//!   listen: [":8080", "127.0.0.1:9090"]
//!   requester_header: forwarded
//! agent:
//!   relays: ["https://relay.example.com"]
//!   insecure: false
//!   connect_timeout_secs: 10
//!   dial_timeout_secs: 5
//!   reconnect: true
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Configuration file format
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(default)]
    pub relay: RelayFileConfig,

    #[serde(default)]
    pub agent: AgentFileConfig,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RelayFileConfig {
    /// Addresses to listen on
    #[serde(default)]
    pub listen: Vec<String>,

    /// `forwarded` or `client`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_header: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AgentFileConfig {
    /// Relay URLs to connect to
    #[serde(default)]
    pub relays: Vec<String>,

    #[serde(default)]
    pub insecure: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dial_timeout_secs: Option<u64>,

    #[serde(default)]
    pub reconnect: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect_delay_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_reconnect_delay_secs: Option<u64>,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<FileConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

pub fn parse_config(contents: &str) -> Result<FileConfig> {
    Ok(serde_yaml::from_str(contents)?)
}

/// Resolve a listen address; a bare `:port` listens on all interfaces
pub async fn resolve_listen_addr(raw: &str) -> Result<SocketAddr> {
    let addr = if raw.starts_with(':') {
        format!("0.0.0.0{}", raw)
    } else {
        raw.to_string()
    };

    if let Ok(addr) = addr.parse() {
        return Ok(addr);
    }

    let resolved = tokio::net::lookup_host(&addr)
        .await
        .with_context(|| format!("Invalid listen address: {}", raw))?
        .next()
        .with_context(|| format!("Listen address did not resolve: {}", raw));
    resolved
}
