//! # outbox-sender
//!
//! Durable outbox for broker delivery.
//!
//! Messages are written to a local JSON queue before any network attempt,
//! published oldest first through a [`broker::BrokerPort`], and deleted only
//! once the broker acknowledges them. Undelivered messages survive restarts.

pub mod address;
pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod storage;
pub mod telemetry;

pub use broker::{BrokerPort, InMemoryBroker};
pub use config::OutboxConfig;
pub use engine::{Outbox, Redeliverer};
pub use error::{Error, Result};
