//! Batched, transactional streaming over transport channels
//!
//! This module provides:
//! - A wire protocol of item batches framed by transaction Start/End markers
//! - Channel-backed senders with buffered enqueue/flush
//! - Channel-backed consumers that resolve `await_transaction` once End is seen
//! - Fan-out (`SenderComposite`) and fan-in (`ConsumerAggregate`) composites
//!
//! Teardown is the only cancellation primitive: it is idempotent, runs the
//! registered callback once, and resolves or fails every pending waiter.

pub mod composite;
pub mod consumer;
pub mod protocol;
pub mod sender;
pub mod transaction;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::ShardResult;

pub use composite::{ConsumerAggregate, SenderComposite};
pub use consumer::ChannelConsumer;
pub use protocol::{StreamMessage, Transaction, TransactionId, TransactionState};
pub use sender::ChannelSender;
pub use transaction::TransactionTracker;

/// Anything that can travel in an item batch
pub trait StreamItem: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> StreamItem for T {}

/// Callback run once when a sender or consumer is torn down
pub type TearDownCallback = Box<dyn FnOnce() + Send>;

/// Sending half of a transactional batch stream
#[async_trait::async_trait]
pub trait BatchSender<T: StreamItem>: Send + Sync {
    async fn start_transaction(&self, id: TransactionId) -> ShardResult<()>;

    async fn end_transaction(&self, id: TransactionId) -> ShardResult<()>;

    async fn send_batch(&self, items: Vec<T>) -> ShardResult<()>;

    /// Buffer one item; the buffer is sent once it reaches the batch size
    async fn enqueue(&self, item: T) -> ShardResult<()>;

    /// Send buffered items followed by a flush marker
    async fn flush(&self) -> ShardResult<()>;

    async fn tear_down(&self) -> ShardResult<()>;

    fn is_torn_down(&self) -> bool;
}

/// Receiving half of a transactional batch stream
#[async_trait::async_trait]
pub trait BatchConsumer: Send + Sync {
    /// Resolves once End for `id` has been observed on every constituent channel
    async fn await_transaction(&self, id: TransactionId) -> ShardResult<()>;

    async fn tear_down(&self) -> ShardResult<()>;

    fn is_torn_down(&self) -> bool;
}

/// Destination for decoded item batches
#[async_trait::async_trait]
pub trait ItemSink<T>: Send + Sync {
    async fn on_items(&self, items: Vec<T>) -> ShardResult<()>;

    async fn on_flush(&self) -> ShardResult<()> {
        Ok(())
    }
}

/// Sink that keeps everything it receives
pub struct CollectingSink<T> {
    items: Mutex<Vec<T>>,
    flushes: AtomicUsize,
}

impl<T> Default for CollectingSink<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
        }
    }
}

impl<T: Clone> CollectingSink<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<T> {
        self.items.lock().clone()
    }

    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock())
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl<T: Send + Sync> ItemSink<T> for CollectingSink<T> {
    async fn on_items(&self, items: Vec<T>) -> ShardResult<()> {
        self.items.lock().extend(items);
        Ok(())
    }

    async fn on_flush(&self) -> ShardResult<()> {
        self.flushes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
