//! Agent configuration

use std::time::Duration;
use url::Url;

use crate::error::AgentError;

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay URL (http, https, ws or wss)
    pub relay_url: String,

    /// Upper bound for dialing the relay and completing the upgrade
    pub connect_timeout: Option<Duration>,

    /// Upper bound for dialing a destination
    pub dial_timeout: Option<Duration>,

    /// Whether to skip certificate verification (insecure, for development only)
    pub insecure: bool,
}

impl AgentConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            connect_timeout: None,
            dial_timeout: None,
            insecure: false,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }

    /// Disable server certificate verification (INSECURE)
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }
}

/// Parse a relay URL and map it onto the WebSocket scheme family.
///
/// `http` becomes `ws` and `https` becomes `wss`; anything else that is not
/// already `ws`/`wss` is rejected.
pub fn normalize_relay_url(raw: &str) -> Result<Url, AgentError> {
    let mut url = Url::parse(raw).map_err(|e| AgentError::InvalidUrl(format!("{}: {}", raw, e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(AgentError::UnsupportedScheme(other.to_string())),
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(AgentError::InvalidUrl(raw.to_string()));
    }

    if url.host_str().is_none() {
        return Err(AgentError::InvalidUrl(format!("{}: missing host", raw)));
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_schemes_are_mapped() {
        let url = normalize_relay_url("http://relay.example.com:8080/tunnel").unwrap();
        assert_eq!(url.as_str(), "ws://relay.example.com:8080/tunnel");

        let url = normalize_relay_url("https://relay.example.com").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.port_or_known_default(), Some(443));
    }

    #[test]
    fn test_websocket_schemes_pass_through() {
        let url = normalize_relay_url("ws://127.0.0.1:9000").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/");

        let url = normalize_relay_url("wss://relay.example.com/").unwrap();
        assert_eq!(url.scheme(), "wss");
    }

    #[test]
    fn test_unknown_scheme_is_rejected() {
        let err = normalize_relay_url("ftp://relay.example.com").unwrap_err();
        assert!(matches!(err, AgentError::UnsupportedScheme(ref s) if s == "ftp"));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_malformed_url_is_rejected() {
        let err = normalize_relay_url("not a url").unwrap_err();
        assert!(matches!(err, AgentError::InvalidUrl(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_builder() {
        let config = AgentConfig::new("http://relay")
            .with_connect_timeout(Duration::from_secs(5))
            .with_dial_timeout(Duration::from_secs(2))
            .with_insecure(true);

        assert_eq!(config.connect_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.dial_timeout, Some(Duration::from_secs(2)));
        assert!(config.insecure);
    }
}
