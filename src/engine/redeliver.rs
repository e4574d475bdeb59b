//! Background redelivery: drains the outbox on a fixed interval until shut down.
//!
//! The engine itself never retries. Run this loop when undelivered entries
//! should go out without waiting for the next `send`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::Outbox;
use crate::broker::BrokerPort;
use crate::error::Result;

pub struct Redeliverer<P: BrokerPort> {
    outbox: Arc<Outbox<P>>,
    interval: Duration,
    /// Flips to `true` once; every clone's `run` watches it.
    shutdown: Arc<watch::Sender<bool>>,
}

impl<P: BrokerPort> Clone for Redeliverer<P> {
    fn clone(&self) -> Self {
        Self {
            outbox: Arc::clone(&self.outbox),
            interval: self.interval,
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<P: BrokerPort> Redeliverer<P> {
    pub fn new(outbox: Arc<Outbox<P>>, interval: Duration) -> Self {
        Self {
            outbox,
            interval,
            shutdown: Arc::new(watch::Sender::new(false)),
        }
    }

    /// Stop every running clone of this loop. Takes effect even if `run`
    /// has not started yet.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Drain every `interval` until shutdown.
    ///
    /// Drain failures are logged and retried on the next tick; only a
    /// storage failure ends the loop.
    pub async fn run(&self) -> Result<()> {
        info!(interval_ms = self.interval.as_millis() as u64, "redelivery loop started");
        let mut stop = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => {
                    info!("redelivery loop shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            if self.outbox.pending()? == 0 {
                continue;
            }

            match self.outbox.drain().await {
                Ok(report) => debug!(delivered = report.delivered, "redelivery drain finished"),
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "redelivery attempt failed, will retry");
                }
                Err(e) => return Err(e),
            }
        }
    }
}
