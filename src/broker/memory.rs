//! In-process broker.
//!
//! Records everything it is asked to publish and can be scripted to fail,
//! which makes the delivery engine observable without a network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::BrokerPort;
use crate::error::{Error, Result};
use crate::model::{Confirmation, Destination};

/// A scripted failure, consumed by the next attempt that reaches its stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The next connect is refused.
    RefuseConnect,
    /// The next publish is answered with a nack.
    Nack,
    /// The next publish fails before any answer.
    PublishError,
}

/// A message the broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub destination: Destination,
    pub content_type: String,
    pub content: String,
}

/// Connection handle handed out by [`InMemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    pub id: u64,
}

#[derive(Default)]
struct Inner {
    published: Mutex<Vec<Published>>,
    faults: Mutex<VecDeque<Fault>>,
    delay: Mutex<Option<Duration>>,
    offline: AtomicBool,
    next_conn: AtomicU64,
    connects: AtomicUsize,
    closes: AtomicUsize,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Cloneable handle; clones share the same broker state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a failure for an upcoming attempt.
    pub fn push_fault(&self, fault: Fault) {
        lock(&self.inner.faults).push_back(fault);
    }

    /// Refuse every connection while `offline` is set.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Hold every publish for `delay` before answering.
    pub fn set_publish_delay(&self, delay: Duration) {
        *lock(&self.inner.delay) = Some(delay);
    }

    /// Messages acknowledged so far, in acknowledgement order.
    pub fn published(&self) -> Vec<Published> {
        lock(&self.inner.published).clone()
    }

    /// Contents acknowledged so far, in acknowledgement order.
    pub fn published_contents(&self) -> Vec<String> {
        lock(&self.inner.published)
            .iter()
            .map(|p| p.content.clone())
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Publish calls made, whatever their outcome.
    pub fn publish_attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Highest number of publishes that were ever in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    fn take_fault(&self, stage: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let mut faults = lock(&self.inner.faults);
        if faults.front().is_some_and(stage) {
            faults.pop_front()
        } else {
            None
        }
    }
}

#[async_trait]
impl BrokerPort for InMemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self, address: &str) -> Result<MemoryConnection> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(Error::Connect(format!("ECONNREFUSED {address}")));
        }
        if self
            .take_fault(|f| *f == Fault::RefuseConnect)
            .is_some()
        {
            return Err(Error::Connect(format!("ECONNREFUSED {address}")));
        }

        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let id = self.inner.next_conn.fetch_add(1, Ordering::SeqCst);
        debug!(conn = id, "memory broker connection opened");
        Ok(MemoryConnection { id })
    }

    async fn publish(
        &self,
        _conn: &mut MemoryConnection,
        destination: &Destination,
        content_type: &str,
        content: &str,
    ) -> Result<Confirmation> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *lock(&self.inner.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fault = self.take_fault(|f| matches!(f, Fault::Nack | Fault::PublishError));
        let result = match fault {
            Some(Fault::Nack) => Ok(Confirmation::Nack {
                reason: "rejected by memory broker".to_string(),
            }),
            Some(Fault::PublishError) => Err(Error::Publish("channel closed".to_string())),
            _ => {
                lock(&self.inner.published).push(Published {
                    destination: destination.clone(),
                    content_type: content_type.to_string(),
                    content: content.to_string(),
                });
                Ok(Confirmation::Ack)
            }
        };

        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn close(&self, conn: MemoryConnection) {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        debug!(conn = conn.id, "memory broker connection closed");
    }
}

// Test double state stays usable after a panicking test thread.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
