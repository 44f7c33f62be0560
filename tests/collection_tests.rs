//! Sharded collection tests
//!
//! Growth, batch add, enumeration through aggregated output channels,
//! removal tombstones and teardown.

mod common;

use common::{create_collection, eventually};
use parking_lot::Mutex;
use shardlist::sharding::ShardNode;
use shardlist::{
    BatchConsumer, BatchSender, ChannelId, CollectingSink, CollectionConfig,
    CollectionCoordinator, ConsumerAggregate, Element, ExecuteOutcome, InMemoryTransport,
    ItemSink, NodeFactory, ShardError, ShardHandle, ShardId, ShardResult, TransactionId,
    Transport,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Output that takes a while to accept each published batch
struct SlowOutput;

#[async_trait::async_trait]
impl BatchSender<Element<i64>> for SlowOutput {
    async fn start_transaction(&self, _id: TransactionId) -> ShardResult<()> {
        Ok(())
    }

    async fn end_transaction(&self, _id: TransactionId) -> ShardResult<()> {
        Ok(())
    }

    async fn send_batch(&self, _items: Vec<Element<i64>>) -> ShardResult<()> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(())
    }

    async fn enqueue(&self, _item: Element<i64>) -> ShardResult<()> {
        Ok(())
    }

    async fn flush(&self) -> ShardResult<()> {
        Ok(())
    }

    async fn tear_down(&self) -> ShardResult<()> {
        Ok(())
    }

    fn is_torn_down(&self) -> bool {
        false
    }
}

/// Makes the first shard it creates slow to accept additions
struct SkewedFactory {
    transport: Arc<dyn Transport>,
    created: AtomicUsize,
    slow: Mutex<Option<ShardId>>,
}

#[async_trait::async_trait]
impl NodeFactory<i64> for SkewedFactory {
    async fn create_shard_node(&self) -> ShardResult<ShardHandle<i64>> {
        let id = ShardId::new();
        let mut node = ShardNode::new(id, self.transport.clone(), 64);
        if self.created.fetch_add(1, Ordering::SeqCst) == 0 {
            *self.slow.lock() = Some(id);
            node = node.with_output(ChannelId::random("slow"), Arc::new(SlowOutput), true);
        }
        Ok(ShardHandle::spawn(node))
    }
}

async fn aggregate_outputs(
    transport: Arc<dyn Transport>,
    coordinator: &CollectionCoordinator<i64>,
) -> (ConsumerAggregate<Element<i64>>, Arc<CollectingSink<Element<i64>>>) {
    let sink = Arc::new(CollectingSink::<Element<i64>>::new());
    let aggregate = ConsumerAggregate::subscribe(
        transport,
        coordinator.output_channels(),
        sink.clone() as Arc<dyn ItemSink<Element<i64>>>,
    )
    .await
    .expect("Failed to subscribe to shard outputs");
    (aggregate, sink)
}

#[tokio::test]
async fn test_growth_only() {
    let (_transport, coordinator) = create_collection(100);

    coordinator.set_shard_count(1).await.unwrap();
    coordinator.set_shard_count(3).await.unwrap();
    assert_eq!(coordinator.shard_count(), 3);

    let err = coordinator.set_shard_count(2).await.unwrap_err();
    assert!(matches!(err, ShardError::OperationNotSupported(_)));
    assert_eq!(coordinator.shard_count(), 3);

    coordinator.set_shard_count(3).await.unwrap();
    coordinator.set_shard_count(6).await.unwrap();
    assert_eq!(coordinator.shard_count(), 6);
    assert_eq!(coordinator.output_channels().len(), 6);
}

#[tokio::test]
async fn test_batch_add_then_enumerate_everything() {
    let (transport, coordinator) = create_collection(250);
    coordinator.set_shard_count(4).await.unwrap();

    let items: Vec<i64> = (0..10_000).collect();
    let references = coordinator.batch_add(items.clone()).await.unwrap();
    assert_eq!(references.len(), items.len());
    assert!(references.iter().all(|r| r.exists));

    let mut total = 0;
    for shard_id in coordinator.shard_ids() {
        total += coordinator.count_in(shard_id).await.unwrap();
    }
    assert_eq!(total, 10_000);

    let (aggregate, sink) = aggregate_outputs(transport, &coordinator).await;
    let transaction = coordinator.enumerate_to_subscribers(None).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        aggregate.await_transaction(transaction),
    )
    .await
    .expect("Enumeration did not complete")
    .unwrap();

    let mut received: Vec<i64> = sink.items().into_iter().map(|e| e.value).collect();
    received.sort_unstable();
    assert_eq!(received, items);

    coordinator.tear_down().await.unwrap();
}

#[tokio::test]
async fn test_slow_shard_takes_fewer_chunks() {
    let factory = Arc::new(SkewedFactory {
        transport: Arc::new(InMemoryTransport::new()),
        created: AtomicUsize::new(0),
        slow: Mutex::new(None),
    });
    let config = CollectionConfig {
        add_chunk_size: 5,
        ..CollectionConfig::default()
    };
    let coordinator = CollectionCoordinator::new(factory.clone(), config);
    coordinator.set_shard_count(4).await.unwrap();

    let references = coordinator.batch_add((0..200).collect()).await.unwrap();
    assert_eq!(references.len(), 200);

    let slow = factory.slow.lock().expect("No shard was created");
    let slow_count = coordinator.count_in(slow).await.unwrap();
    let mut total = slow_count;
    for shard_id in coordinator.shard_ids() {
        if shard_id == slow {
            continue;
        }
        let count = coordinator.count_in(shard_id).await.unwrap();
        assert!(
            slow_count < count,
            "slow shard took {} items, shard {} took {}",
            slow_count,
            shard_id,
            count
        );
        total += count;
    }
    assert_eq!(total, 200);

    coordinator.tear_down().await.unwrap();
}

#[tokio::test]
async fn test_enumerate_to_one_stream() {
    let (transport, coordinator) = create_collection(10);
    coordinator.set_shard_count(3).await.unwrap();
    coordinator.batch_add((0..95).collect()).await.unwrap();

    let channel = ChannelId::random("snapshot");
    let sink = Arc::new(CollectingSink::<Element<i64>>::new());
    let consumer = shardlist::ChannelConsumer::<Element<i64>>::subscribe_expecting(
        transport,
        channel.clone(),
        sink.clone() as Arc<dyn ItemSink<Element<i64>>>,
        coordinator.shard_count(),
    )
    .await
    .unwrap();

    let transaction = coordinator
        .enumerate_to_stream(channel, None)
        .await
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        consumer.await_transaction(transaction),
    )
    .await
    .expect("Enumeration did not complete")
    .unwrap();
    assert_eq!(sink.len(), 95);
}

#[tokio::test]
async fn test_enumerate_without_shards_completes() {
    let (transport, coordinator) = create_collection(100);
    assert_eq!(coordinator.shard_count(), 0);

    let (aggregate, sink) = aggregate_outputs(transport, &coordinator).await;
    let transaction = coordinator.enumerate_to_subscribers(None).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(1),
        aggregate.await_transaction(transaction),
    )
    .await
    .expect("Enumeration over no shards did not complete")
    .unwrap();
    assert_eq!(sink.len(), 0);
}

#[tokio::test]
async fn test_remove_streams_tombstone() {
    let (transport, coordinator) = create_collection(100);
    coordinator.set_shard_count(2).await.unwrap();
    let references = coordinator.batch_add((0..10).collect()).await.unwrap();
    let (_aggregate, sink) = aggregate_outputs(transport, &coordinator).await;

    assert!(coordinator.remove(references[9]).await.unwrap());
    assert!(!coordinator.contains(&9).await.unwrap());
    assert!(!coordinator.contains_reference(references[9]).await.unwrap());
    assert!(coordinator.contains(&8).await.unwrap());

    assert!(eventually(|| sink.len() == 1).await);
    let delivered = sink.items();
    assert_eq!(delivered.len(), 1);
    assert!(!delivered[0].exists());
    assert_eq!(delivered[0].value, 9);
    assert_eq!(delivered[0].reference, references[9].tombstone());

    // Removing through a stale reference is a not-found, not an error
    assert!(!coordinator.remove(references[9]).await.unwrap());
}

#[tokio::test]
async fn test_execute_over_every_element() {
    let (_transport, coordinator) = create_collection(4);
    coordinator.set_shard_count(2).await.unwrap();
    let references = coordinator.batch_add((1..=8).collect()).await.unwrap();

    let outcome = coordinator
        .execute_sync(
            |item: &mut i64, factor: Option<&i64>| {
                *item *= factor.copied().unwrap_or(1);
                *item
            },
            Some(10),
            None,
        )
        .await
        .unwrap();
    let mut results = outcome.into_vec();
    results.sort_unstable();
    assert_eq!(results, (1..=8).map(|i| i * 10).collect::<Vec<i64>>());

    let single = coordinator
        .execute_async(
            |item: i64, _state: Option<Arc<()>>| async move { (item + 1, item) },
            None,
            Some(references[0]),
        )
        .await
        .unwrap();
    assert_eq!(single, ExecuteOutcome::Single(10));
    let element = coordinator.get(references[0]).await.unwrap().unwrap();
    assert_eq!(element.value, 11);
}

#[tokio::test]
async fn test_tear_down_twice() {
    let (transport, coordinator) = create_collection(100);
    coordinator.set_shard_count(2).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let (aggregate, _sink) = aggregate_outputs(transport, &coordinator).await;
    let aggregate = aggregate.on_tear_down({
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
        }
    });

    aggregate.tear_down().await.unwrap();
    aggregate.tear_down().await.unwrap();
    assert!(aggregate.is_torn_down());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    coordinator.tear_down().await.unwrap();
    coordinator.tear_down().await.unwrap();
}
