//! Endpoint binding for the broker controller.
//!
//! Any bind failure is fatal at startup: the controller unwinds everything
//! bound so far, so this module reports one endpoint at a time instead of
//! collecting partial successes.

use crate::endpoint::TransportEndpoint;
use crate::error::{BrokerError, Result};
use tokio::net::TcpListener;
use tracing::info;

/// Binds one endpoint, resolving port 0 to the OS-assigned port.
///
/// # Errors
///
/// Returns `EndpointUnavailable` when the address cannot be bound.
pub(crate) async fn bind_endpoint(
    endpoint: &TransportEndpoint,
) -> Result<(TcpListener, TransportEndpoint)> {
    let listener = TcpListener::bind(endpoint.authority())
        .await
        .map_err(|e| BrokerError::EndpointUnavailable {
            endpoint: endpoint.to_string(),
            reason: format!("{e} ({})", error_kind_to_hint(&e)),
        })?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| BrokerError::EndpointUnavailable {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
    let bound = endpoint.with_port(local_addr.port());
    info!(%bound, "listener bound");
    Ok((listener, bound))
}

fn error_kind_to_hint(error: &std::io::Error) -> &'static str {
    match error.kind() {
        std::io::ErrorKind::AddrInUse => "address already in use",
        std::io::ErrorKind::PermissionDenied => "permission denied",
        std::io::ErrorKind::AddrNotAvailable => "address not available",
        _ => "see error above",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_resolves_port_zero() {
        let endpoint = TransportEndpoint::parse("tcp://127.0.0.1:0").unwrap();
        let (_listener, bound) = bind_endpoint(&endpoint).await.unwrap();
        assert_ne!(bound.port, 0);
        assert_eq!(bound.scheme, endpoint.scheme);
        assert_eq!(bound.host, endpoint.host);
    }

    #[tokio::test]
    async fn test_bind_occupied_port_fails() {
        let endpoint = TransportEndpoint::parse("tcp://127.0.0.1:0").unwrap();
        let (_listener, bound) = bind_endpoint(&endpoint).await.unwrap();

        let err = bind_endpoint(&bound).await.unwrap_err();
        match err {
            BrokerError::EndpointUnavailable { endpoint, reason } => {
                assert_eq!(endpoint, bound.to_string());
                assert!(reason.contains("address already in use"), "reason: {reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
