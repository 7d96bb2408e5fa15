use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::BrokerError;

/// Capacity of a subscription's delivery queue. A subscriber that falls this
/// far behind misses frames (at-most-once, never blocking the publisher).
pub const SUBSCRIPTION_BUFFER: usize = 256;

/// Cross-process fan-out capability consumed by the bus.
///
/// One topic per room. The bus does not care which transport implements
/// this; it only publishes opaque payloads and drains subscriptions.
#[async_trait]
pub trait RoomBroker: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BrokerError>;

    /// Open a subscription to a topic. Dropping the receiver ends it.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>, BrokerError>;
}

/// In-process loopback broker for single-process deployments and tests.
///
/// Payloads published to a topic are forwarded to every open subscription of
/// that topic, including ones held by the publishing process — the bus
/// de-duplicates by origin.
#[derive(Default)]
pub struct LocalBroker {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomBroker for LocalBroker {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), BrokerError> {
        let mut topics = self
            .topics
            .lock()
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|tx| match tx.try_send(payload.clone()) {
                Ok(()) => true,
                // Lagging subscriber: drop this payload for it, keep the
                // subscription alive.
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<String>, BrokerError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.topics
            .lock()
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
