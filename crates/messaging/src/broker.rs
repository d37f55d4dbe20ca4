//! Broker abstraction.
//!
//! The broker is modeled purely as an external, at-least-once transport:
//! this crate never assumes a shared in-memory queue, only that messages
//! published with the same routing key reach bound consumers in publish
//! order.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::MessagingError;

/// A message as received from the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
}

impl Delivery {
    /// Creates a delivery.
    pub fn new(routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
        }
    }
}

/// Publish side of the broker.
///
/// The routing key is the event type's wire name; one durable queue per
/// consuming service binds the keys it needs.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publishes a message. An error means the message was not accepted and
    /// the caller must retry.
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<(), MessagingError>;
}

#[derive(Default)]
struct Subscriber {
    routing_keys: Vec<String>,
    tx: Option<mpsc::UnboundedSender<Delivery>>,
}

#[derive(Default)]
struct Inner {
    published: Vec<(String, Vec<u8>)>,
    subscribers: Vec<Subscriber>,
    fail_remaining: usize,
}

/// In-memory broker for testing.
///
/// Records every accepted publish and fans deliveries out to subscribers in
/// publish order. `set_fail_next_publishes` injects transient broker
/// outages.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryBroker {
    /// Creates a new in-memory broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` publish calls fail.
    pub fn set_fail_next_publishes(&self, n: usize) {
        self.inner.write().unwrap().fail_remaining = n;
    }

    /// Returns the number of accepted publishes.
    pub fn published_count(&self) -> usize {
        self.inner.read().unwrap().published.len()
    }

    /// Returns the accepted publishes for one routing key, in order.
    pub fn published_for(&self, routing_key: &str) -> Vec<Vec<u8>> {
        self.inner
            .read()
            .unwrap()
            .published
            .iter()
            .filter(|(key, _)| key == routing_key)
            .map(|(_, body)| body.clone())
            .collect()
    }

    /// Binds a queue to the given routing keys and returns its delivery
    /// stream.
    pub fn subscribe(&self, routing_keys: &[&str]) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().unwrap().subscribers.push(Subscriber {
            routing_keys: routing_keys.iter().map(|k| k.to_string()).collect(),
            tx: Some(tx),
        });
        rx
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, routing_key: &str, body: Vec<u8>) -> Result<(), MessagingError> {
        let mut inner = self.inner.write().unwrap();

        if inner.fail_remaining > 0 {
            inner.fail_remaining -= 1;
            return Err(MessagingError::Broker("broker unavailable".to_string()));
        }

        inner.published.push((routing_key.to_string(), body.clone()));

        for subscriber in &mut inner.subscribers {
            if subscriber.routing_keys.iter().any(|k| k == routing_key)
                && let Some(tx) = &subscriber.tx
                && tx
                    .send(Delivery::new(routing_key, body.clone()))
                    .is_err()
            {
                subscriber.tx = None;
            }
        }

        Ok(())
    }
}
