//! In-process transport
//!
//! Each subscription owns an unbounded queue drained by a dedicated tokio
//! task, so deliveries to one subscriber keep channel order and a slow
//! observer never blocks senders.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{ChannelId, ChannelObserver, SubscriptionHandle, Transport, TransportError};

enum Delivery {
    Item(Vec<u8>),
    Completed,
    Failed(TransportError),
}

struct Subscriber {
    id: u64,
    queue: mpsc::UnboundedSender<Delivery>,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct ChannelState {
    subscribers: Vec<Subscriber>,
    completed: bool,
}

/// Transport keeping every channel in memory
#[derive(Default)]
pub struct InMemoryTransport {
    channels: Mutex<HashMap<ChannelId, ChannelState>>,
    next_subscription: AtomicU64,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on a channel
    pub fn subscriber_count(&self, channel: &ChannelId) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|state| state.subscribers.len())
            .unwrap_or(0)
    }

    pub fn is_completed(&self, channel: &ChannelId) -> bool {
        self.channels
            .lock()
            .get(channel)
            .map(|state| state.completed)
            .unwrap_or(false)
    }

    /// Push a transport failure to every subscriber of a channel and drop them
    pub fn fail(&self, channel: &ChannelId, error: TransportError) {
        let mut channels = self.channels.lock();
        if let Some(state) = channels.get_mut(channel) {
            for subscriber in state.subscribers.drain(..) {
                let _ = subscriber.queue.send(Delivery::Failed(error.clone()));
            }
        }
        debug!("InMemoryTransport: Failed channel {}: {}", channel, error);
    }

    fn spawn_delivery(
        observer: Arc<dyn ChannelObserver>,
        mut rx: mpsc::UnboundedReceiver<Delivery>,
        active: Arc<AtomicBool>,
    ) {
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                if !active.load(Ordering::Acquire) {
                    break;
                }
                match delivery {
                    Delivery::Item(payload) => observer.on_next(payload).await,
                    Delivery::Completed => {
                        observer.on_completed().await;
                        break;
                    }
                    Delivery::Failed(error) => {
                        observer.on_error(error).await;
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, channel: &ChannelId, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut channels = self.channels.lock();
        let state = channels.entry(channel.clone()).or_default();
        if state.completed {
            return Err(TransportError::ChannelCompleted(channel.to_string()));
        }
        if state.subscribers.is_empty() {
            trace!("InMemoryTransport: No subscribers on {}, dropping payload", channel);
            return Ok(());
        }
        // Subscribers whose delivery task has exited are pruned here
        state
            .subscribers
            .retain(|s| s.queue.send(Delivery::Item(payload.clone())).is_ok());
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &ChannelId,
        observer: Arc<dyn ChannelObserver>,
    ) -> Result<SubscriptionHandle, TransportError> {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));

        {
            let mut channels = self.channels.lock();
            let state = channels.entry(channel.clone()).or_default();
            if state.completed {
                let _ = tx.send(Delivery::Completed);
            } else {
                state.subscribers.push(Subscriber {
                    id,
                    queue: tx,
                    active: active.clone(),
                });
            }
        }

        Self::spawn_delivery(observer, rx, active);
        debug!("InMemoryTransport: Subscription {} on {}", id, channel);

        Ok(SubscriptionHandle {
            channel: channel.clone(),
            id,
        })
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), TransportError> {
        let mut channels = self.channels.lock();
        let state = channels
            .get_mut(&handle.channel)
            .ok_or(TransportError::SubscriptionNotFound(handle.id))?;
        let position = state
            .subscribers
            .iter()
            .position(|s| s.id == handle.id)
            .ok_or(TransportError::SubscriptionNotFound(handle.id))?;
        let subscriber = state.subscribers.remove(position);
        subscriber.active.store(false, Ordering::Release);
        debug!(
            "InMemoryTransport: Unsubscribed {} from {}",
            handle.id, handle.channel
        );
        Ok(())
    }

    async fn complete(&self, channel: &ChannelId) -> Result<(), TransportError> {
        let mut channels = self.channels.lock();
        let state = channels.entry(channel.clone()).or_default();
        if state.completed {
            return Ok(());
        }
        state.completed = true;
        for subscriber in state.subscribers.drain(..) {
            let _ = subscriber.queue.send(Delivery::Completed);
        }
        debug!("InMemoryTransport: Completed channel {}", channel);
        Ok(())
    }
}
