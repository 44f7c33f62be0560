//! Fan-out and fan-in composites
//!
//! `SenderComposite` spreads one logical stream over several child senders,
//! bracketing every child with the same transaction id. `ConsumerAggregate`
//! merges several channels into one sink and only resolves a transaction
//! once every channel has delivered its End.

use futures::future::{join_all, try_join_all};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::consumer::ChannelConsumer;
use super::protocol::TransactionId;
use super::transaction::TransactionTracker;
use super::{BatchConsumer, BatchSender, ItemSink, StreamItem, TearDownCallback};
use crate::error::{ShardError, ShardResult};
use crate::transport::{ChannelId, Transport};

/// Split `items` into at most `parts` contiguous chunks of near-equal size
pub fn contiguous_chunks<T>(items: Vec<T>, parts: usize) -> Vec<Vec<T>> {
    if items.is_empty() || parts == 0 {
        return Vec::new();
    }
    let chunk_size = items.len().div_ceil(parts);
    let mut chunks = Vec::with_capacity(parts);
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        chunks.push(items.by_ref().take(chunk_size).collect());
    }
    chunks
}

/// Fans one stream out to several senders
pub struct SenderComposite<T: StreamItem> {
    children: Vec<Arc<dyn BatchSender<T>>>,
    next: AtomicUsize,
    torn_down: AtomicBool,
    on_tear_down: Mutex<Option<TearDownCallback>>,
}

impl<T: StreamItem> SenderComposite<T> {
    pub fn new(children: Vec<Arc<dyn BatchSender<T>>>) -> ShardResult<Self> {
        if children.is_empty() {
            return Err(ShardError::Config(
                "a sender composite needs at least one child".to_string(),
            ));
        }
        Ok(Self {
            children,
            next: AtomicUsize::new(0),
            torn_down: AtomicBool::new(false),
            on_tear_down: Mutex::new(None),
        })
    }

    /// Register the callback run on the first teardown
    pub fn on_tear_down(self, callback: impl FnOnce() + Send + 'static) -> Self {
        *self.on_tear_down.lock() = Some(Box::new(callback));
        self
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    fn ensure_open(&self) -> ShardResult<()> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(ShardError::TornDown("sender composite".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<T: StreamItem> BatchSender<T> for SenderComposite<T> {
    async fn start_transaction(&self, id: TransactionId) -> ShardResult<()> {
        self.ensure_open()?;
        try_join_all(self.children.iter().map(|c| c.start_transaction(id))).await?;
        Ok(())
    }

    async fn end_transaction(&self, id: TransactionId) -> ShardResult<()> {
        self.ensure_open()?;
        try_join_all(self.children.iter().map(|c| c.end_transaction(id))).await?;
        Ok(())
    }

    async fn send_batch(&self, items: Vec<T>) -> ShardResult<()> {
        self.ensure_open()?;
        let chunks = contiguous_chunks(items, self.children.len());
        try_join_all(
            self.children
                .iter()
                .zip(chunks)
                .map(|(child, chunk)| child.send_batch(chunk)),
        )
        .await?;
        Ok(())
    }

    async fn enqueue(&self, item: T) -> ShardResult<()> {
        self.ensure_open()?;
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.children.len();
        self.children[index].enqueue(item).await
    }

    async fn flush(&self) -> ShardResult<()> {
        self.ensure_open()?;
        try_join_all(self.children.iter().map(|c| c.flush())).await?;
        Ok(())
    }

    async fn tear_down(&self) -> ShardResult<()> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let results = join_all(self.children.iter().map(|c| c.tear_down())).await;

        let callback = self.on_tear_down.lock().take();
        if let Some(callback) = callback {
            callback();
        }
        debug!("SenderComposite: Torn down {} children", self.children.len());

        results.into_iter().collect::<ShardResult<Vec<()>>>()?;
        Ok(())
    }

    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}

/// Fans several channels in to one sink with counted transaction completion
pub struct ConsumerAggregate<T: StreamItem> {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn ItemSink<T>>,
    tracker: Arc<TransactionTracker>,
    consumers: Mutex<Vec<Arc<ChannelConsumer<T>>>>,
    torn_down: AtomicBool,
    on_tear_down: Mutex<Option<TearDownCallback>>,
}

impl<T: StreamItem> ConsumerAggregate<T> {
    /// Subscribe to every channel; transactions need one Start/End per channel
    pub async fn subscribe(
        transport: Arc<dyn Transport>,
        channels: Vec<ChannelId>,
        sink: Arc<dyn ItemSink<T>>,
    ) -> ShardResult<Self> {
        let tracker = Arc::new(TransactionTracker::new(channels.len()));
        let consumers = try_join_all(channels.into_iter().map(|channel| {
            ChannelConsumer::with_tracker(transport.clone(), channel, sink.clone(), tracker.clone())
        }))
        .await?;
        debug!("ConsumerAggregate: Subscribed to {} channels", consumers.len());

        Ok(Self {
            transport,
            sink,
            tracker,
            consumers: Mutex::new(consumers.into_iter().map(Arc::new).collect()),
            torn_down: AtomicBool::new(false),
            on_tear_down: Mutex::new(None),
        })
    }

    /// Register the callback run on the first teardown
    pub fn on_tear_down(self, callback: impl FnOnce() + Send + 'static) -> Self {
        *self.on_tear_down.lock() = Some(Box::new(callback));
        self
    }

    /// Add a channel; later transactions also wait for its Start/End
    pub async fn attach(&self, channel: ChannelId) -> ShardResult<()> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(ShardError::TornDown(channel.to_string()));
        }
        let consumer = ChannelConsumer::with_tracker(
            self.transport.clone(),
            channel,
            self.sink.clone(),
            self.tracker.clone(),
        )
        .await?;
        let count = {
            let mut consumers = self.consumers.lock();
            consumers.push(Arc::new(consumer));
            consumers.len()
        };
        self.tracker.set_expected(count);
        Ok(())
    }

    pub fn channel_count(&self) -> usize {
        self.consumers.lock().len()
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        self.consumers
            .lock()
            .iter()
            .map(|c| c.channel().clone())
            .collect()
    }

    pub fn tracker(&self) -> &Arc<TransactionTracker> {
        &self.tracker
    }
}

#[async_trait::async_trait]
impl<T: StreamItem> BatchConsumer for ConsumerAggregate<T> {
    async fn await_transaction(&self, id: TransactionId) -> ShardResult<()> {
        self.tracker.wait(id).await
    }

    async fn tear_down(&self) -> ShardResult<()> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let consumers: Vec<Arc<ChannelConsumer<T>>> = self.consumers.lock().clone();
        let results = join_all(consumers.iter().map(|c| c.tear_down())).await;
        self.tracker
            .close(ShardError::TornDown("consumer aggregate".to_string()));

        let callback = self.on_tear_down.lock().take();
        if let Some(callback) = callback {
            callback();
        }
        debug!("ConsumerAggregate: Torn down {} channels", consumers.len());

        results.into_iter().collect::<ShardResult<Vec<()>>>()?;
        Ok(())
    }

    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::sender::ChannelSender;
    use crate::stream::CollectingSink;
    use crate::transport::InMemoryTransport;

    #[test]
    fn test_contiguous_chunks() {
        let chunks = contiguous_chunks((0..10).collect::<Vec<_>>(), 3);
        assert_eq!(chunks, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);

        let chunks = contiguous_chunks(vec![1, 2], 4);
        assert_eq!(chunks, vec![vec![1], vec![2]]);

        assert!(contiguous_chunks(Vec::<u8>::new(), 4).is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_fan_in() {
        let transport = Arc::new(InMemoryTransport::new());
        let channels: Vec<ChannelId> = (0..3).map(|_| ChannelId::random("fan")).collect();
        let sink = Arc::new(CollectingSink::<u32>::new());
        let aggregate = ConsumerAggregate::<u32>::subscribe(transport.clone(), channels.clone(), sink.clone())
            .await
            .unwrap();

        let children: Vec<Arc<dyn BatchSender<u32>>> = channels
            .iter()
            .map(|c| {
                Arc::new(ChannelSender::<u32>::new(transport.clone(), c.clone(), 8))
                    as Arc<dyn BatchSender<u32>>
            })
            .collect();
        let composite = SenderComposite::new(children).unwrap();

        let tx = TransactionId::new();
        composite.start_transaction(tx).await.unwrap();
        composite.send_batch((0..100).collect()).await.unwrap();
        composite.end_transaction(tx).await.unwrap();

        aggregate.await_transaction(tx).await.unwrap();
        let mut items = sink.items();
        items.sort_unstable();
        assert_eq!(items, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_aggregate_waits_for_every_channel() {
        let transport = Arc::new(InMemoryTransport::new());
        let channels: Vec<ChannelId> = (0..2).map(|_| ChannelId::random("fan")).collect();
        let sink = Arc::new(CollectingSink::<u32>::new());
        let aggregate = ConsumerAggregate::<u32>::subscribe(transport.clone(), channels.clone(), sink)
            .await
            .unwrap();
        let first = ChannelSender::<u32>::new(transport.clone(), channels[0].clone(), 8);
        let second = ChannelSender::<u32>::new(transport.clone(), channels[1].clone(), 8);

        let tx = TransactionId::new();
        first.start_transaction(tx).await.unwrap();
        first.end_transaction(tx).await.unwrap();

        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            aggregate.await_transaction(tx),
        )
        .await;
        assert!(pending.is_err(), "resolved after one of two channels");

        second.start_transaction(tx).await.unwrap();
        second.end_transaction(tx).await.unwrap();
        aggregate.await_transaction(tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_raises_expected_count() {
        let transport = Arc::new(InMemoryTransport::new());
        let first_channel = ChannelId::random("fan");
        let sink = Arc::new(CollectingSink::<u32>::new());
        let aggregate =
            ConsumerAggregate::<u32>::subscribe(transport.clone(), vec![first_channel.clone()], sink)
                .await
                .unwrap();
        let second_channel = ChannelId::random("fan");
        aggregate.attach(second_channel.clone()).await.unwrap();
        assert_eq!(aggregate.channel_count(), 2);
        assert_eq!(aggregate.tracker().expected(), 2);

        let children: Vec<Arc<dyn BatchSender<u32>>> = vec![
            Arc::new(ChannelSender::<u32>::new(transport.clone(), first_channel, 8)),
            Arc::new(ChannelSender::<u32>::new(transport.clone(), second_channel, 8)),
        ];
        let composite = SenderComposite::new(children).unwrap();
        let tx = TransactionId::new();
        composite.start_transaction(tx).await.unwrap();
        composite.end_transaction(tx).await.unwrap();
        aggregate.await_transaction(tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_aggregate_without_channels_resolves() {
        let transport = Arc::new(InMemoryTransport::new());
        let sink = Arc::new(CollectingSink::<u32>::new());
        let aggregate = ConsumerAggregate::<u32>::subscribe(transport, Vec::new(), sink)
            .await
            .unwrap();
        assert_eq!(aggregate.channel_count(), 0);

        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            aggregate.await_transaction(TransactionId::new()),
        )
        .await
        .expect("transaction over no channels should resolve at once")
        .unwrap();
    }

    #[tokio::test]
    async fn test_composite_tear_down_once() {
        let transport = Arc::new(InMemoryTransport::new());
        let channel = ChannelId::random("fan");
        let children: Vec<Arc<dyn BatchSender<u32>>> = vec![Arc::new(ChannelSender::<u32>::new(
            transport.clone(),
            channel.clone(),
            8,
        ))];
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let composite = SenderComposite::new(children).unwrap().on_tear_down(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        composite.tear_down().await.unwrap();
        composite.tear_down().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(transport.is_completed(&channel));
        assert!(matches!(
            composite.send_batch(vec![1]).await,
            Err(ShardError::TornDown(_))
        ));
    }

    #[test]
    fn test_empty_composite_is_rejected() {
        assert!(SenderComposite::<u32>::new(Vec::new()).is_err());
    }
}
