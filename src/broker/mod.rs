//! Embedded broker lifecycle.
//!
//! A [`BrokerController`] owns one Topic Bus and the set of transport
//! listeners for its configured endpoints. It is instance-scoped: multiple
//! independent brokers can run in one process.

mod binding;
mod controller;
mod listener;

pub use controller::{BrokerController, BrokerState};
