//! # polybus
//!
//! An embeddable message broker that exposes the same logical topics over
//! several wire protocols at once — STOMP, a length-prefixed raw TCP binary
//! protocol, WebSocket and MQTT — with a typed producer/consumer API that
//! serializes values to JSON on the wire. A value published through any
//! transport is observable, semantically equal, by consumers attached
//! through any other transport.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use polybus::{BrokerController, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut broker = BrokerController::new([
//!         "stomp://127.0.0.1:1701",
//!         "tcp://127.0.0.1:1864",
//!         "ws://127.0.0.1:8472",
//!         "mqtt://127.0.0.1:2000",
//!     ])?;
//!     broker.start_embedded_broker().await?;
//!
//!     let consumer = BrokerController::create_json_consumer(
//!         "mqtt://127.0.0.1:2000",
//!         "/topic/test.topic.foo",
//!         |value| println!("received: {value:?}"),
//!         1,
//!     )
//!     .await?;
//!
//!     let producer = BrokerController::create_json_producer(
//!         "stomp://127.0.0.1:1701",
//!         "/topic/test.topic.foo",
//!         1,
//!     )
//!     .await?;
//!     producer.send(&Value::from("Test String")).await?;
//!
//!     producer.close().await;
//!     consumer.close().await;
//!     broker.stop_embedded_broker().await;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod bus;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod endpoint;
pub mod error;
pub mod producer;
mod proto;
pub mod value;

pub use broker::{BrokerController, BrokerState};
pub use bus::{SubscriptionHandle, TopicBus, TopicMessage};
pub use config::BrokerConfig;
pub use consumer::{ConsumerCallback, JsonConsumer};
pub use endpoint::{Scheme, TransportEndpoint};
pub use error::{BrokerError, Result};
pub use producer::JsonProducer;
pub use value::Value;
