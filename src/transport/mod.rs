//! Transport boundary
//!
//! The collection only needs named, ordered channels with explicit
//! completion. Anything that can provide `send`/`subscribe`/`unsubscribe`/
//! `complete` over byte payloads can carry shard output and change messages.

pub mod memory;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use memory::InMemoryTransport;

/// Error type for transport operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Channel '{0}' has completed")]
    ChannelCompleted(String),

    #[error("Subscription {0} not found")]
    SubscriptionNotFound(u64),

    #[error("Subscription lost: {0}")]
    SubscriptionLost(String),

    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),
}

/// A named channel: `(id, namespace)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    pub id: Uuid,
    pub namespace: String,
}

impl ChannelId {
    pub fn new(id: Uuid, namespace: impl Into<String>) -> Self {
        Self {
            id,
            namespace: namespace.into(),
        }
    }

    /// A fresh channel in the given namespace
    pub fn random(namespace: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4(), namespace)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub channel: ChannelId,
    pub id: u64,
}

/// Receives deliveries for one subscription, in channel order
#[async_trait::async_trait]
pub trait ChannelObserver: Send + Sync {
    async fn on_next(&self, payload: Vec<u8>);
    async fn on_completed(&self);
    async fn on_error(&self, error: TransportError);
}

/// Abstract transport layer
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, channel: &ChannelId, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        channel: &ChannelId,
        observer: Arc<dyn ChannelObserver>,
    ) -> Result<SubscriptionHandle, TransportError>;

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), TransportError>;

    /// Signal completion to every subscriber; later sends are rejected
    async fn complete(&self, channel: &ChannelId) -> Result<(), TransportError>;
}
