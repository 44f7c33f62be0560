//! Transport-backed batch sender

use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::protocol::{StreamMessage, TransactionId};
use super::{BatchSender, StreamItem, TearDownCallback};
use crate::error::{ShardError, ShardResult};
use crate::transport::{ChannelId, Transport};

/// Sends batches and transaction markers on one channel
pub struct ChannelSender<T> {
    channel: ChannelId,
    transport: Arc<dyn Transport>,
    batch_size: usize,
    buffer: tokio::sync::Mutex<Vec<T>>,
    torn_down: AtomicBool,
    on_tear_down: Mutex<Option<TearDownCallback>>,
    _marker: PhantomData<fn(T)>,
}

impl<T: StreamItem> ChannelSender<T> {
    pub fn new(transport: Arc<dyn Transport>, channel: ChannelId, batch_size: usize) -> Self {
        Self {
            channel,
            transport,
            batch_size: batch_size.max(1),
            buffer: tokio::sync::Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
            on_tear_down: Mutex::new(None),
            _marker: PhantomData,
        }
    }

    /// Register the callback run on the first teardown
    pub fn on_tear_down(self, callback: impl FnOnce() + Send + 'static) -> Self {
        *self.on_tear_down.lock() = Some(Box::new(callback));
        self
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn ensure_open(&self) -> ShardResult<()> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(ShardError::TornDown(self.channel.to_string()));
        }
        Ok(())
    }

    async fn send_message(&self, message: &StreamMessage<T>) -> ShardResult<()> {
        let frame = message.encode()?;
        self.transport.send(&self.channel, frame).await?;
        Ok(())
    }

    async fn send_items(&self, items: Vec<T>) -> ShardResult<()> {
        let mut items = items.into_iter().peekable();
        while items.peek().is_some() {
            let chunk: Vec<T> = items.by_ref().take(self.batch_size).collect();
            self.send_message(&StreamMessage::ItemBatch { items: chunk })
                .await?;
        }
        Ok(())
    }

    /// Send whatever `enqueue` has buffered so far
    async fn drain_buffer(&self) -> ShardResult<()> {
        let mut buffer = self.buffer.lock().await;
        if buffer.is_empty() {
            return Ok(());
        }
        let items = std::mem::take(&mut *buffer);
        self.send_items(items).await
    }
}

#[async_trait::async_trait]
impl<T: StreamItem> BatchSender<T> for ChannelSender<T> {
    async fn start_transaction(&self, id: TransactionId) -> ShardResult<()> {
        self.ensure_open()?;
        self.drain_buffer().await?;
        debug!("ChannelSender: Start transaction {} on {}", id, self.channel);
        self.send_message(&StreamMessage::TransactionStart { id })
            .await
    }

    async fn end_transaction(&self, id: TransactionId) -> ShardResult<()> {
        self.ensure_open()?;
        self.drain_buffer().await?;
        debug!("ChannelSender: End transaction {} on {}", id, self.channel);
        self.send_message(&StreamMessage::TransactionEnd { id })
            .await
    }

    async fn send_batch(&self, items: Vec<T>) -> ShardResult<()> {
        self.ensure_open()?;
        self.drain_buffer().await?;
        self.send_items(items).await
    }

    async fn enqueue(&self, item: T) -> ShardResult<()> {
        self.ensure_open()?;
        let mut buffer = self.buffer.lock().await;
        buffer.push(item);
        if buffer.len() >= self.batch_size {
            let items = std::mem::take(&mut *buffer);
            self.send_items(items).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> ShardResult<()> {
        self.ensure_open()?;
        self.drain_buffer().await?;
        self.send_message(&StreamMessage::Flush).await
    }

    async fn tear_down(&self) -> ShardResult<()> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let drained = self.drain_buffer().await;
        if let Err(e) = &drained {
            warn!(
                "ChannelSender: Dropping buffered items on {} during teardown: {}",
                self.channel, e
            );
        }
        let completed = self.transport.complete(&self.channel).await;

        let callback = self.on_tear_down.lock().take();
        if let Some(callback) = callback {
            callback();
        }
        debug!("ChannelSender: Torn down {}", self.channel);

        completed?;
        drained
    }

    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}
