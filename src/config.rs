//! Broker configuration.

use crate::endpoint::TransportEndpoint;
use crate::error::{BrokerError, Result};
use std::time::Duration;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for an embedded broker instance.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Endpoints to bind, one listener each, in supply order.
    pub endpoints: Vec<TransportEndpoint>,
    /// Capacity of each connection's bounded outbound queue. A full queue
    /// blocks delivery to that connection only.
    pub channel_capacity: usize,
    /// Upper bound on a single wire frame, enforced by every protocol
    /// family's framing layer.
    pub max_frame_size: usize,
    /// How long `stop_embedded_broker` waits for listener and connection
    /// tasks before giving up on them.
    pub shutdown_timeout: Duration,
}

impl BrokerConfig {
    /// Builds a config from transport URLs.
    ///
    /// # Errors
    ///
    /// Returns `InvalidUrl` / `UnsupportedScheme` if any URL does not parse.
    pub fn new<I, S>(urls: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let endpoints = urls
            .into_iter()
            .map(|url| TransportEndpoint::parse(url.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            endpoints,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// # Errors
    ///
    /// Returns `InvalidState` if a capacity knob is zero.
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(BrokerError::InvalidState(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_frame_size == 0 {
            return Err(BrokerError::InvalidState(
                "max_frame_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Scheme;

    #[test]
    fn test_config_from_urls() {
        let config = BrokerConfig::new([
            "stomp://127.0.0.1:1701",
            "tcp://127.0.0.1:1864",
            "ws://127.0.0.1:8472",
            "mqtt://127.0.0.1:2000",
        ])
        .unwrap();

        assert_eq!(config.endpoints.len(), 4);
        assert_eq!(config.endpoints[0].scheme, Scheme::Stomp);
        assert_eq!(config.endpoints[3].scheme, Scheme::Mqtt);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_rejects_bad_url() {
        assert!(BrokerConfig::new(["nats://127.0.0.1:4222"]).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = BrokerConfig::new(["tcp://127.0.0.1:0"])
            .unwrap()
            .with_channel_capacity(0);
        assert!(config.validate().is_err());
    }
}
