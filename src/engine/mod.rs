//! Delivery engine. The public API for handing messages to the outbox.
//!
//! The engine owns the queue store and the broker port. Every message is
//! persisted before any network attempt and removed only after the broker
//! acknowledged it. Delivery is at-least-once: a crash between the ack and
//! the removal redelivers the entry on the next drain.

pub mod redeliver;

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use secrecy::SecretString;
use serde::Serialize;
use tracing::{Instrument, info, warn};

use crate::address::redact_url;
use crate::broker::{BrokerPort, CONTENT_TYPE};
use crate::config::OutboxConfig;
use crate::config::secrets::expose;
use crate::error::{Error, Result, Stage};
use crate::model::*;
use crate::storage::QueueStore;
use crate::telemetry::delivery::{record_stage, start_deliver_span, start_drain_span};
use crate::telemetry::metrics;

pub use redeliver::Redeliverer;

/// The outbox. Share it behind an `Arc` to send from several tasks.
///
/// Store mutations (`send`, and each removal inside `drain`) write and
/// fsync the queue file synchronously on the calling task, under the store
/// lock. That blocks an executor thread for the length of one small file
/// rewrite, which suits a low message rate. Callers pushing bursts from
/// many tasks should run the engine on a multi-threaded runtime.
pub struct Outbox<P: BrokerPort> {
    /// Never held across an await.
    store: Mutex<QueueStore>,
    /// Held for the whole of a drain, so at most one drain talks to the
    /// broker at a time.
    drain_lock: tokio::sync::Mutex<()>,
    port: P,
    destination: Destination,
    address: SecretString,
}

impl<P: BrokerPort> Outbox<P> {
    /// Open the queue store named by `config` and wire it to `port`.
    ///
    /// Entries left over from a previous run are kept and will go out
    /// with the next drain.
    pub fn open(config: &OutboxConfig, port: P) -> Result<Self> {
        let store = QueueStore::open(&config.store_path)?;
        Ok(Self::with_store(
            store,
            config.destination(),
            config.resolved_address(),
            port,
        ))
    }

    /// Build an engine around an already opened store.
    pub fn with_store(
        store: QueueStore,
        destination: Destination,
        address: SecretString,
        port: P,
    ) -> Self {
        Self {
            store: Mutex::new(store),
            drain_lock: tokio::sync::Mutex::new(()),
            port,
            destination,
            address,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Serialize `payload` as JSON and send it. See [`Outbox::send_raw`].
    pub async fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<SendReport> {
        let content = serde_json::to_string(payload)?;
        self.send_raw(content).await
    }

    /// Persist `content`, then drain the whole queue.
    ///
    /// Resolves once every queued entry, this one included, has been
    /// acknowledged. An `Err` from the drain does not lose the message: it
    /// stays queued for a later drain. Only a `Stage::Storage` error means
    /// the message was never persisted.
    pub async fn send_raw(&self, content: String) -> Result<SendReport> {
        let id = self.store()?.push_raw(content)?;
        metrics::entries_enqueued().add(1, &[]);
        info!(id = %id, "new message added to outbox");

        let drained = self.drain().await?;
        Ok(SendReport { id, drained })
    }

    /// Deliver every queued entry, oldest first, stopping at the first
    /// failure.
    ///
    /// Concurrent callers are serialized: a second caller waits for the
    /// running drain to settle, then drains whatever is left. A drain cannot
    /// be cancelled while a publish is in progress; dropping the future
    /// mid-publish may leave an acknowledged entry queued, which is then
    /// delivered again.
    pub async fn drain(&self) -> Result<DrainReport> {
        let _guard = self.drain_lock.lock().await;

        let span = start_drain_span(&self.destination, self.pending()?);
        let started = Instant::now();
        let result = self.drain_locked().instrument(span.clone()).await;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let outcome = match &result {
            Ok(report) => {
                span.record("outbox.delivered", report.delivered);
                "drained"
            }
            Err(_) => "stopped",
        };
        metrics::drain_duration_ms().record(elapsed_ms, &metrics::result_label(outcome));
        result
    }

    /// Number of entries waiting for acknowledgement.
    pub fn pending(&self) -> Result<usize> {
        Ok(self.store()?.len())
    }

    /// Copy of the queued entries, oldest first.
    pub fn entries(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.store()?.entries().to_vec())
    }

    // -----------------------------------------------------------------------
    // Drain loop
    // -----------------------------------------------------------------------

    async fn drain_locked(&self) -> Result<DrainReport> {
        let mut delivered = 0;

        loop {
            let next = self.store()?.peek_oldest().cloned();
            let Some(entry) = next else {
                if delivered == 0 {
                    info!("there are no messages left in the outbox");
                }
                break;
            };

            if let Err(e) = self.deliver(&entry).await {
                warn!(
                    id = %entry.id,
                    delivered,
                    error = %e,
                    "drain stopped, entry stays queued"
                );
                return Err(e);
            }

            self.store()?.remove(&entry.id)?;
            metrics::entries_removed().add(1, &[]);
            info!(id = %entry.id, "message deleted from outbox");
            delivered += 1;
        }

        Ok(DrainReport { delivered })
    }

    /// One connect → publish → confirm → close cycle for `entry`.
    async fn deliver(&self, entry: &QueueEntry) -> Result<()> {
        let span = start_deliver_span(&entry.id);

        async {
            record_stage(&span, "connect");
            let address = expose(&self.address);
            info!(address = %redact_url(address), "connecting to broker");

            let mut conn = match self.port.connect(address).await {
                Ok(conn) => conn,
                Err(e) => {
                    metrics::deliveries().add(1, &metrics::result_label(failure_label(&e)));
                    return Err(e);
                }
            };

            record_stage(&span, "publish");
            let answer = self
                .port
                .publish(&mut conn, &self.destination, CONTENT_TYPE, &entry.content)
                .await;
            self.port.close(conn).await;

            match answer {
                Ok(Confirmation::Ack) => {
                    record_stage(&span, "ack");
                    metrics::deliveries().add(1, &metrics::result_label("ack"));
                    info!("message acknowledged");
                    Ok(())
                }
                Ok(Confirmation::Nack { reason }) => {
                    metrics::deliveries().add(1, &metrics::result_label("nack"));
                    Err(Error::Nack(reason))
                }
                Err(e) => {
                    metrics::deliveries().add(1, &metrics::result_label(failure_label(&e)));
                    Err(e)
                }
            }
        }
        .instrument(span.clone())
        .await
    }

    fn store(&self) -> Result<MutexGuard<'_, QueueStore>> {
        self.store
            .lock()
            .map_err(|_| Error::Other("queue store lock poisoned".to_string()))
    }
}

fn failure_label(err: &Error) -> &'static str {
    match err.stage() {
        Stage::Connect => "connect_error",
        _ => "publish_error",
    }
}
