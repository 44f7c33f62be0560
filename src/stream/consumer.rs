//! Transport-backed batch consumer

use parking_lot::Mutex;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::protocol::{StreamMessage, TransactionId};
use super::transaction::TransactionTracker;
use super::{BatchConsumer, ItemSink, StreamItem, TearDownCallback};
use crate::error::{ShardError, ShardResult};
use crate::transport::{ChannelId, ChannelObserver, SubscriptionHandle, Transport, TransportError};

/// Per-subscription state shared with the transport delivery task
struct ConsumerShared<T> {
    channel: ChannelId,
    sink: Arc<dyn ItemSink<T>>,
    tracker: Arc<TransactionTracker>,
    /// Transactions started on this channel whose End has not arrived
    open: Mutex<HashSet<TransactionId>>,
    completed: AtomicBool,
    _marker: PhantomData<fn(T)>,
}

impl<T: StreamItem> ConsumerShared<T> {
    fn fail_open(&self, error: ShardError) {
        let open: Vec<TransactionId> = self.open.lock().drain().collect();
        for id in open {
            self.tracker.fail(id, error.clone());
        }
    }

    async fn handle(&self, message: StreamMessage<T>) {
        match message {
            StreamMessage::ItemBatch { items } => {
                if let Err(e) = self.sink.on_items(items).await {
                    warn!("ChannelConsumer: Sink rejected batch on {}: {}", self.channel, e);
                    self.fail_open(e);
                }
            }
            StreamMessage::TransactionStart { id } => {
                self.open.lock().insert(id);
                self.tracker.record_start(id);
            }
            StreamMessage::TransactionEnd { id } => {
                self.open.lock().remove(&id);
                self.tracker.record_end(id);
            }
            StreamMessage::Flush => {
                if let Err(e) = self.sink.on_flush().await {
                    warn!("ChannelConsumer: Sink rejected flush on {}: {}", self.channel, e);
                    self.fail_open(e);
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl<T: StreamItem> ChannelObserver for ConsumerShared<T> {
    async fn on_next(&self, payload: Vec<u8>) {
        match StreamMessage::<T>::decode(&payload) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                error!("ChannelConsumer: Undecodable frame on {}: {}", self.channel, e);
                self.fail_open(e);
            }
        }
    }

    async fn on_completed(&self) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("ChannelConsumer: Channel {} completed", self.channel);
        let error = ShardError::ChannelClosed(self.channel.to_string());
        self.fail_open(error.clone());
        self.tracker.channel_completed(error);
    }

    async fn on_error(&self, error: TransportError) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("ChannelConsumer: Subscription on {} failed: {}", self.channel, error);
        let error = ShardError::Transport(error);
        self.fail_open(error.clone());
        self.tracker.channel_completed(error);
    }
}

/// Consumes one channel, feeding items to a sink and tracking transactions
pub struct ChannelConsumer<T> {
    shared: Arc<ConsumerShared<T>>,
    transport: Arc<dyn Transport>,
    handle: SubscriptionHandle,
    torn_down: AtomicBool,
    on_tear_down: Mutex<Option<TearDownCallback>>,
}

impl<T: StreamItem> ChannelConsumer<T> {
    /// Subscribe to a channel fed by a single producer
    pub async fn subscribe(
        transport: Arc<dyn Transport>,
        channel: ChannelId,
        sink: Arc<dyn ItemSink<T>>,
    ) -> ShardResult<Self> {
        Self::subscribe_expecting(transport, channel, sink, 1).await
    }

    /// Subscribe to a channel that `producers` senders share
    ///
    /// Every transaction then needs `producers` Start and End markers.
    pub async fn subscribe_expecting(
        transport: Arc<dyn Transport>,
        channel: ChannelId,
        sink: Arc<dyn ItemSink<T>>,
        producers: usize,
    ) -> ShardResult<Self> {
        if producers == 0 {
            return Err(ShardError::Config(format!(
                "channel '{}' needs at least one producer",
                channel
            )));
        }
        let tracker = Arc::new(TransactionTracker::new(producers));
        Self::with_tracker(transport, channel, sink, tracker).await
    }

    pub(crate) async fn with_tracker(
        transport: Arc<dyn Transport>,
        channel: ChannelId,
        sink: Arc<dyn ItemSink<T>>,
        tracker: Arc<TransactionTracker>,
    ) -> ShardResult<Self> {
        let shared = Arc::new(ConsumerShared {
            channel: channel.clone(),
            sink,
            tracker,
            open: Mutex::new(HashSet::new()),
            completed: AtomicBool::new(false),
            _marker: PhantomData,
        });
        let observer: Arc<dyn ChannelObserver> = shared.clone();
        let handle = transport.subscribe(&channel, observer).await?;
        debug!("ChannelConsumer: Subscribed to {}", channel);

        Ok(Self {
            shared,
            transport,
            handle,
            torn_down: AtomicBool::new(false),
            on_tear_down: Mutex::new(None),
        })
    }

    /// Register the callback run on the first teardown
    pub fn on_tear_down(self, callback: impl FnOnce() + Send + 'static) -> Self {
        *self.on_tear_down.lock() = Some(Box::new(callback));
        self
    }

    pub fn channel(&self) -> &ChannelId {
        &self.shared.channel
    }

    pub fn tracker(&self) -> &Arc<TransactionTracker> {
        &self.shared.tracker
    }

    /// Whether the producer side completed the channel
    pub fn is_completed(&self) -> bool {
        self.shared.completed.load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl<T: StreamItem> BatchConsumer for ChannelConsumer<T> {
    async fn await_transaction(&self, id: TransactionId) -> ShardResult<()> {
        self.shared.tracker.wait(id).await
    }

    async fn tear_down(&self) -> ShardResult<()> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let unsubscribed = match self.transport.unsubscribe(&self.handle).await {
            // Completed channels drop their subscribers on their own
            Err(TransportError::SubscriptionNotFound(_)) => Ok(()),
            other => other,
        };

        let error = ShardError::TornDown(self.shared.channel.to_string());
        self.shared.fail_open(error.clone());
        self.shared.tracker.close(error);

        let callback = self.on_tear_down.lock().take();
        if let Some(callback) = callback {
            callback();
        }
        debug!("ChannelConsumer: Torn down {}", self.shared.channel);

        unsubscribed.map_err(ShardError::from)
    }

    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}
