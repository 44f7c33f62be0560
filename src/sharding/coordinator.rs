//! Collection coordinator fronting a set of shard nodes

use futures::future::{join_all, try_join_all};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::batch::{chunk_items, dispatch_greedy};
use super::factory::NodeFactory;
use super::handle::ShardHandle;
use super::node::{ElementValue, ExecuteOutcome};
use super::reference::{Element, ElementReference, ShardId};
use crate::config::CollectionConfig;
use crate::error::{ShardError, ShardResult};
use crate::stream::TransactionId;
use crate::transport::ChannelId;

/// Lifecycle state of a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorState {
    /// Shard count is being grown
    Initializing,
    Ready,
}

/// One logical collection spread over shard nodes
pub struct CollectionCoordinator<T: ElementValue> {
    factory: Arc<dyn NodeFactory<T>>,
    config: CollectionConfig,
    shards: RwLock<Vec<ShardHandle<T>>>,
    state: Mutex<CoordinatorState>,
}

impl<T: ElementValue> CollectionCoordinator<T> {
    /// A coordinator with no shards yet; call `set_shard_count` to grow it
    pub fn new(factory: Arc<dyn NodeFactory<T>>, config: CollectionConfig) -> Self {
        Self {
            factory,
            config,
            shards: RwLock::new(Vec::new()),
            state: Mutex::new(CoordinatorState::Ready),
        }
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.lock()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.shards.read().iter().map(|s| s.id()).collect()
    }

    /// Output channel of every shard, in shard order
    pub fn output_channels(&self) -> Vec<ChannelId> {
        self.shards
            .read()
            .iter()
            .filter_map(|s| s.output_channel().cloned())
            .collect()
    }

    fn snapshot(&self) -> Vec<ShardHandle<T>> {
        self.shards.read().clone()
    }

    fn ensure_ready(&self, operation: &str) -> ShardResult<()> {
        match self.state() {
            CoordinatorState::Ready => Ok(()),
            CoordinatorState::Initializing => Err(ShardError::Initializing(format!(
                "{} rejected while shard count grows",
                operation
            ))),
        }
    }

    fn shard(&self, id: ShardId) -> ShardResult<ShardHandle<T>> {
        self.shards
            .read()
            .iter()
            .find(|s| s.id() == id)
            .cloned()
            .ok_or(ShardError::UnknownShard(id))
    }

    /// Grow the collection to `count` shards
    ///
    /// Shrinking is rejected without touching any shard. New nodes are
    /// created in parallel and only added once all of them exist.
    pub async fn set_shard_count(&self, count: usize) -> ShardResult<()> {
        let current = {
            let mut state = self.state.lock();
            if *state == CoordinatorState::Initializing {
                return Err(ShardError::Initializing(
                    "shard count is already growing".to_string(),
                ));
            }
            let current = self.shards.read().len();
            if count < current {
                return Err(ShardError::OperationNotSupported(format!(
                    "shrinking from {} to {} shards",
                    current, count
                )));
            }
            if count == current {
                return Ok(());
            }
            *state = CoordinatorState::Initializing;
            current
        };

        info!("Growing collection from {} to {} shards", current, count);
        let created =
            try_join_all((current..count).map(|_| self.factory.create_shard_node())).await;

        let outcome = match created {
            Ok(handles) => {
                self.shards.write().extend(handles);
                info!("Collection now has {} shards", count);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to grow collection to {} shards: {}", count, e);
                Err(e)
            }
        };
        *self.state.lock() = CoordinatorState::Ready;
        outcome
    }

    /// Add items across shards; references come back in item order
    ///
    /// The first failing chunk aborts the call. Chunks other shards already
    /// accepted stay added.
    pub async fn batch_add(&self, items: Vec<T>) -> ShardResult<Vec<ElementReference>> {
        self.ensure_ready("batch add")?;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let shards = self.snapshot();
        let total = items.len();
        let chunks = chunk_items(items, self.config.add_chunk_size);
        debug!(
            "Dispatching {} items in {} chunks over {} shards",
            total,
            chunks.len(),
            shards.len()
        );

        let per_chunk = dispatch_greedy(shards, chunks, |shard, chunk| async move {
            let result = shard.add_range(chunk).await;
            (shard, result)
        })
        .await?;

        Ok(per_chunk.into_iter().flatten().collect())
    }

    /// Remove the referenced element from its shard
    pub async fn remove(&self, reference: ElementReference) -> ShardResult<bool> {
        self.ensure_ready("remove")?;
        self.shard(reference.shard_id)?.remove(reference).await
    }

    pub async fn get(&self, reference: ElementReference) -> ShardResult<Option<Element<T>>> {
        self.shard(reference.shard_id)?.get(reference).await
    }

    pub async fn contains_reference(&self, reference: ElementReference) -> ShardResult<bool> {
        match self.shard(reference.shard_id) {
            Ok(shard) => shard.contains_reference(reference).await,
            Err(ShardError::UnknownShard(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether any shard holds `value`
    pub async fn contains(&self, value: &T) -> ShardResult<bool> {
        let found = try_join_all(
            self.snapshot()
                .into_iter()
                .map(|shard| {
                    let value = value.clone();
                    async move { shard.contains(value).await }
                }),
        )
        .await?;
        Ok(found.into_iter().any(|f| f))
    }

    /// Total element count over all shards
    pub async fn count(&self) -> ShardResult<usize> {
        let counts = try_join_all(self.snapshot().iter().map(|s| s.count())).await?;
        Ok(counts.into_iter().sum())
    }

    pub async fn count_in(&self, shard_id: ShardId) -> ShardResult<usize> {
        self.shard(shard_id)?.count().await
    }

    /// Fan `call` out to every shard and flatten the per-element results
    async fn fan_out_execute<R, Fut>(
        &self,
        call: impl Fn(ShardHandle<T>) -> Fut,
    ) -> ShardResult<ExecuteOutcome<R>>
    where
        Fut: Future<Output = ShardResult<ExecuteOutcome<R>>>,
    {
        let outcomes = try_join_all(self.snapshot().into_iter().map(call)).await?;
        Ok(ExecuteOutcome::PerElement(
            outcomes.into_iter().flat_map(ExecuteOutcome::into_vec).collect(),
        ))
    }

    /// Run `f` on the referenced element, or on every element of every shard
    pub async fn execute_sync<S, R, F>(
        &self,
        f: F,
        state: Option<S>,
        reference: Option<ElementReference>,
    ) -> ShardResult<ExecuteOutcome<R>>
    where
        S: Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(&mut T, Option<&S>) -> R + Send + Sync + 'static,
    {
        self.ensure_ready("execute")?;
        let state = state.map(Arc::new);
        if let Some(reference) = reference {
            return self
                .shard(reference.shard_id)?
                .execute_sync(f, state, Some(reference))
                .await;
        }

        let f = Arc::new(f);
        self.fan_out_execute(|shard| {
            let f = f.clone();
            let state = state.clone();
            async move {
                shard
                    .execute_sync(move |item: &mut T, s: Option<&S>| f(item, s), state, None)
                    .await
            }
        })
        .await
    }

    /// Async variant of `execute_sync`; elements are moved through `f`
    pub async fn execute_async<S, R, F, Fut>(
        &self,
        f: F,
        state: Option<S>,
        reference: Option<ElementReference>,
    ) -> ShardResult<ExecuteOutcome<R>>
    where
        S: Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(T, Option<Arc<S>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = (T, R)> + Send + 'static,
    {
        self.ensure_ready("execute")?;
        let state = state.map(Arc::new);
        if let Some(reference) = reference {
            return self
                .shard(reference.shard_id)?
                .execute_async(f, state, Some(reference))
                .await;
        }

        let f = Arc::new(f);
        self.fan_out_execute(|shard| {
            let f = f.clone();
            let state = state.clone();
            async move {
                shard
                    .execute_async(move |item: T, s: Option<Arc<S>>| f(item, s), state, None)
                    .await
            }
        })
        .await
    }

    /// Have every shard stream a snapshot to its output channel
    ///
    /// All shards use the same transaction id, so a consumer aggregating the
    /// output channels resolves it once every shard has sent its End.
    pub async fn enumerate_to_subscribers(
        &self,
        transaction: Option<TransactionId>,
    ) -> ShardResult<TransactionId> {
        self.ensure_ready("enumerate")?;
        let transaction = transaction.unwrap_or_default();
        let shards = self.snapshot();
        debug!(
            "Enumerating {} shards to subscribers in transaction {}",
            shards.len(),
            transaction
        );
        try_join_all(
            shards
                .iter()
                .map(|s| s.enumerate_to_subscribers(Some(transaction))),
        )
        .await?;
        Ok(transaction)
    }

    /// Have every shard stream a snapshot to one shared channel
    ///
    /// The channel carries one Start/End pair per shard for the transaction;
    /// consume it with a consumer expecting `shard_count()` producers.
    pub async fn enumerate_to_stream(
        &self,
        channel: ChannelId,
        transaction: Option<TransactionId>,
    ) -> ShardResult<TransactionId> {
        self.ensure_ready("enumerate")?;
        let transaction = transaction.unwrap_or_default();
        try_join_all(
            self.snapshot()
                .iter()
                .map(|s| s.enumerate_to_stream(channel.clone(), transaction)),
        )
        .await?;
        Ok(transaction)
    }

    /// Tear down every shard; safe to call more than once
    pub async fn tear_down(&self) -> ShardResult<()> {
        let shards = self.snapshot();
        info!("Tearing down {} shards", shards.len());
        let results = join_all(shards.iter().map(|s| s.tear_down())).await;
        results.into_iter().collect::<ShardResult<Vec<()>>>()?;
        Ok(())
    }
}
