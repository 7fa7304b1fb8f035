//! Transport endpoint addressing.
//!
//! Endpoints are written as `scheme://host:port`, e.g.
//! `stomp://127.0.0.1:1701`. The scheme selects the wire protocol; the
//! host/port pair is where the listener binds (or where a client connects).

use crate::error::{BrokerError, Result};
use std::fmt;
use std::str::FromStr;

/// Wire protocol family of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Stomp,
    /// Length-prefixed binary frames over raw TCP.
    Tcp,
    Ws,
    Mqtt,
}

impl Scheme {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Stomp => "stomp",
            Scheme::Tcp => "tcp",
            Scheme::Ws => "ws",
            Scheme::Mqtt => "mqtt",
        }
    }
}

impl FromStr for Scheme {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stomp" => Ok(Scheme::Stomp),
            "tcp" => Ok(Scheme::Tcp),
            "ws" => Ok(Scheme::Ws),
            "mqtt" => Ok(Scheme::Mqtt),
            other => Err(BrokerError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `scheme://host:port` endpoint, owned by exactly one listener
/// for the lifetime of the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportEndpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl TransportEndpoint {
    /// Parses an endpoint URL. The port is required; port 0 is accepted and
    /// resolves to an OS-assigned port at bind time.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedScheme` for an unknown scheme and `InvalidUrl`
    /// for anything else that does not look like `scheme://host:port`.
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| BrokerError::InvalidUrl(url.to_string()))?;
        let scheme: Scheme = scheme.parse()?;

        if rest.is_empty() || rest.contains('/') {
            return Err(BrokerError::InvalidUrl(url.to_string()));
        }

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| BrokerError::InvalidUrl(url.to_string()))?;
        if host.is_empty() {
            return Err(BrokerError::InvalidUrl(url.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| BrokerError::InvalidUrl(url.to_string()))?;

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }

    /// The `host:port` part, as passed to socket APIs.
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub(crate) fn with_port(&self, port: u16) -> Self {
        Self {
            scheme: self.scheme,
            host: self.host.clone(),
            port,
        }
    }
}

impl fmt::Display for TransportEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl FromStr for TransportEndpoint {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        let ep = TransportEndpoint::parse("stomp://127.0.0.1:1701").unwrap();
        assert_eq!(ep.scheme, Scheme::Stomp);
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.port, 1701);

        let ep = TransportEndpoint::parse("tcp://127.0.0.1:1864").unwrap();
        assert_eq!(ep.scheme, Scheme::Tcp);
        assert_eq!(ep.port, 1864);

        let ep = TransportEndpoint::parse("ws://localhost:8472").unwrap();
        assert_eq!(ep.scheme, Scheme::Ws);
        assert_eq!(ep.host, "localhost");

        let ep = TransportEndpoint::parse("mqtt://0.0.0.0:2000").unwrap();
        assert_eq!(ep.scheme, Scheme::Mqtt);
        assert_eq!(ep.authority(), "0.0.0.0:2000");
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        let err = TransportEndpoint::parse("amqp://127.0.0.1:5672").unwrap_err();
        match err {
            BrokerError::UnsupportedScheme(s) => assert_eq!(s, "amqp"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for url in [
            "127.0.0.1:1701",
            "stomp://",
            "stomp://:1701",
            "stomp://127.0.0.1",
            "stomp://127.0.0.1:notaport",
            "stomp://127.0.0.1:70000",
            "ws://127.0.0.1:8080/path",
        ] {
            assert!(
                matches!(TransportEndpoint::parse(url), Err(BrokerError::InvalidUrl(_))),
                "expected InvalidUrl for {url}"
            );
        }
    }

    #[test]
    fn test_display_round_trip() {
        let ep = TransportEndpoint::parse("mqtt://127.0.0.1:2000").unwrap();
        assert_eq!(ep.to_string(), "mqtt://127.0.0.1:2000");
        assert_eq!(ep.to_string().parse::<TransportEndpoint>().unwrap(), ep);
    }

    #[test]
    fn test_port_zero_accepted() {
        let ep = TransportEndpoint::parse("tcp://127.0.0.1:0").unwrap();
        assert_eq!(ep.port, 0);
        assert_eq!(ep.with_port(4242).port, 4242);
    }
}
