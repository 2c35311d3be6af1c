//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Default request body limit.
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// How often idle peer sessions are reaped.
    pub reap_interval: Duration,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            reap_interval: Duration::from_secs(60),
        }
    }

    /// Sets the request body limit.
    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    /// Sets the reap interval.
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new("0.0.0.0:9000".parse().unwrap())
            .with_max_body_bytes(1024)
            .with_reap_interval(Duration::from_secs(5));

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.max_body_bytes, 1024);
        assert_eq!(config.reap_interval, Duration::from_secs(5));
    }
}
