//! Broker controller: owns the Topic Bus and the bound listeners.

use super::{binding, listener};
use crate::bus::TopicBus;
use crate::config::BrokerConfig;
use crate::consumer::JsonConsumer;
use crate::endpoint::TransportEndpoint;
use crate::error::Result;
use crate::producer::JsonProducer;
use crate::value::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Lifecycle state of an embedded broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Created,
    Running,
    Stopped,
}

/// Owns the Topic Bus and transport listeners of one embedded broker.
///
/// Created stopped; `start_embedded_broker` and `stop_embedded_broker` are
/// idempotent and intended to be paired.
pub struct BrokerController {
    config: Arc<BrokerConfig>,
    state: BrokerState,
    bus: Option<Arc<TopicBus>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    accept_tasks: Vec<JoinHandle<()>>,
    bound: Vec<TransportEndpoint>,
}

impl BrokerController {
    /// Builds a controller for the given transport URLs. URLs are parsed
    /// eagerly; nothing is bound until start.
    ///
    /// # Errors
    ///
    /// Returns `InvalidUrl` / `UnsupportedScheme` if a URL does not parse.
    pub fn new<I, S>(transport_urls: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self::with_config(BrokerConfig::new(transport_urls)?))
    }

    #[must_use]
    pub fn with_config(config: BrokerConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: BrokerState::Created,
            bus: None,
            shutdown_tx: None,
            accept_tasks: Vec::new(),
            bound: Vec::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> BrokerState {
        self.state
    }

    /// The endpoints actually bound, with port 0 resolved. Empty unless
    /// running.
    #[must_use]
    pub fn bound_endpoints(&self) -> &[TransportEndpoint] {
        &self.bound
    }

    /// Starts the embedded broker: constructs the Topic Bus and binds every
    /// configured endpoint in supply order. A no-op when already running.
    ///
    /// # Errors
    ///
    /// Returns `EndpointUnavailable` if any endpoint cannot be bound; in
    /// that case every listener bound so far is released and the controller
    /// stays stopped.
    pub async fn start_embedded_broker(&mut self) -> Result<()> {
        if self.state == BrokerState::Running {
            debug!("start requested while already running");
            return Ok(());
        }
        self.config.validate()?;

        // Bind everything before accepting anything, so a late failure
        // unwinds by simply dropping the earlier listeners.
        let mut listeners = Vec::with_capacity(self.config.endpoints.len());
        for endpoint in &self.config.endpoints {
            match binding::bind_endpoint(endpoint).await {
                Ok((listener, bound)) => listeners.push((listener, bound)),
                Err(e) => {
                    warn!(%endpoint, error = %e, "bind failed, unwinding");
                    drop(listeners);
                    self.state = BrokerState::Stopped;
                    return Err(e);
                }
            }
        }

        let bus = Arc::new(TopicBus::new());
        let (shutdown_tx, _) = broadcast::channel(1);

        for (listener, bound) in listeners {
            self.accept_tasks.push(listener::spawn_accept_loop(
                listener,
                bound.clone(),
                Arc::clone(&bus),
                Arc::clone(&self.config),
                shutdown_tx.clone(),
            ));
            self.bound.push(bound);
        }

        self.bus = Some(bus);
        self.shutdown_tx = Some(shutdown_tx);
        self.state = BrokerState::Running;
        info!(endpoints = self.bound.len(), "embedded broker running");
        Ok(())
    }

    /// Stops the embedded broker: unbinds every listener and discards the
    /// Topic Bus, invalidating all outstanding subscriptions. Individual
    /// teardown failures are logged, never raised, so teardown always
    /// completes. A no-op when not running.
    pub async fn stop_embedded_broker(&mut self) {
        if self.state != BrokerState::Running {
            debug!("stop requested while not running");
            self.state = BrokerState::Stopped;
            return;
        }

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            // No receivers just means every task already exited.
            let _ = shutdown_tx.send(());
        }

        let mut failures = 0usize;
        for task in self.accept_tasks.drain(..) {
            match timeout(self.config.shutdown_timeout, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(error = %e, "listener task failed during shutdown");
                }
                Err(_) => {
                    failures += 1;
                    warn!("listener task did not stop within timeout");
                }
            }
        }
        if failures > 0 {
            warn!(failures, "broker stopped with teardown failures");
        }

        if let Some(bus) = self.bus.take() {
            debug!(topics = bus.topic_count().await, "discarding topic bus");
        }
        self.bound.clear();
        self.state = BrokerState::Stopped;
        info!("embedded broker stopped");
    }

    /// Creates a producer connected to `url` that JSON-encodes every value
    /// sent to `topic`. `concurrency_hint` caps concurrent `send` callers.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse or the connection or
    /// protocol handshake fails.
    pub async fn create_json_producer(
        url: &str,
        topic: &str,
        concurrency_hint: usize,
    ) -> Result<JsonProducer> {
        let endpoint = TransportEndpoint::parse(url)?;
        JsonProducer::connect(endpoint, topic, concurrency_hint).await
    }

    /// Creates a consumer connected to `url` whose `callback` is invoked
    /// once per value received on `topic`, from a worker pool of
    /// `concurrency_hint` tasks. Resolves only after the broker has
    /// acknowledged the subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse or the connection,
    /// handshake, or subscription fails.
    pub async fn create_json_consumer<F>(
        url: &str,
        topic: &str,
        callback: F,
        concurrency_hint: usize,
    ) -> Result<JsonConsumer>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let endpoint = TransportEndpoint::parse(url)?;
        JsonConsumer::connect(endpoint, topic, callback, concurrency_hint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle_states() {
        let mut controller = BrokerController::new(["tcp://127.0.0.1:0"]).unwrap();
        assert_eq!(controller.state(), BrokerState::Created);
        assert!(controller.bound_endpoints().is_empty());

        controller.start_embedded_broker().await.unwrap();
        assert_eq!(controller.state(), BrokerState::Running);
        assert_eq!(controller.bound_endpoints().len(), 1);
        assert_ne!(controller.bound_endpoints()[0].port, 0);

        controller.stop_embedded_broker().await;
        assert_eq!(controller.state(), BrokerState::Stopped);
        assert!(controller.bound_endpoints().is_empty());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let mut controller = BrokerController::new(["tcp://127.0.0.1:0"]).unwrap();
        controller.start_embedded_broker().await.unwrap();
        let bound = controller.bound_endpoints().to_vec();

        controller.start_embedded_broker().await.unwrap();
        assert_eq!(controller.bound_endpoints(), &bound[..]);

        controller.stop_embedded_broker().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut controller = BrokerController::new(["tcp://127.0.0.1:0"]).unwrap();
        controller.start_embedded_broker().await.unwrap();

        controller.stop_embedded_broker().await;
        controller.stop_embedded_broker().await;
        assert_eq!(controller.state(), BrokerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let mut controller = BrokerController::new(["tcp://127.0.0.1:0"]).unwrap();
        controller.stop_embedded_broker().await;
        assert_eq!(controller.state(), BrokerState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let mut controller =
            BrokerController::new(["tcp://127.0.0.1:0", "stomp://127.0.0.1:0"]).unwrap();
        controller.start_embedded_broker().await.unwrap();
        controller.stop_embedded_broker().await;

        controller.start_embedded_broker().await.unwrap();
        assert_eq!(controller.bound_endpoints().len(), 2);
        controller.stop_embedded_broker().await;
    }

    #[tokio::test]
    async fn test_bind_failure_unwinds_all_listeners() {
        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let mut controller = BrokerController::new([
            "stomp://127.0.0.1:0".to_string(),
            format!("tcp://127.0.0.1:{port}"),
        ])
        .unwrap();

        let err = controller.start_embedded_broker().await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::BrokerError::EndpointUnavailable { .. }
        ));
        assert_ne!(controller.state(), BrokerState::Running);
        assert!(controller.bound_endpoints().is_empty());

        // The port the first endpoint grabbed must be free again.
        drop(occupied);
        controller.start_embedded_broker().await.unwrap();
        controller.stop_embedded_broker().await;
    }
}
