//! Broker publish port.
//!
//! The engine never talks to a broker library directly. Anything that can
//! open a connection, publish one message with confirmation and close the
//! connection again can drive delivery.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Confirmation, Destination};

pub use memory::InMemoryBroker;

/// Content type advertised for published payloads.
pub const CONTENT_TYPE: &str = "application/json";

/// Capability interface over a concrete broker client.
///
/// Implementations report an unreachable broker as `Error::Connect` and a
/// failed publish as `Error::Publish`. A broker that answers but refuses
/// the message returns `Ok(Confirmation::Nack { .. })`.
#[async_trait]
pub trait BrokerPort: Send + Sync {
    type Connection: Send;

    /// Open a connection (and confirm-mode channel) to `address`.
    async fn connect(&self, address: &str) -> Result<Self::Connection>;

    /// Publish `content` to `destination`, tagged with `content_type`, and
    /// wait for the broker's answer.
    async fn publish(
        &self,
        conn: &mut Self::Connection,
        destination: &Destination,
        content_type: &str,
        content: &str,
    ) -> Result<Confirmation>;

    /// Close the connection. Never fails from the engine's point of view.
    async fn close(&self, conn: Self::Connection);
}
