//! Configuration for the HTTP transport

use std::time::Duration;

/// How the client opens its event stream
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bearer token sent with the connect request, if any
    pub token: Option<String>,

    /// Limit on waiting for the server to answer the connect request
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authenticate the stream so the server links it to a user
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::new();
        assert!(config.token.is_none());
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_config_builder_chain() {
        let config = ClientConfig::new()
            .token("secret")
            .connect_timeout(Duration::from_secs(3));

        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
    }
}
