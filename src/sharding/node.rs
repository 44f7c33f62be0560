//! Shard node state
//!
//! A `ShardNode` owns one partition of the collection as a plain `Vec<T>`.
//! It is never shared: the actor task spawned by `ShardHandle::spawn` is its
//! only owner, so every mutation is serialized through the mailbox.

use futures::future::join_all;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::reference::{Element, ElementReference, ShardId};
use crate::error::{ShardError, ShardResult};
use crate::stream::{BatchSender, ChannelSender, StreamItem, TransactionId};
use crate::transport::{ChannelId, Transport};

/// Bound for values stored in a sharded collection
pub trait ElementValue: StreamItem + Clone + PartialEq + fmt::Debug {}

impl<T: StreamItem + Clone + PartialEq + fmt::Debug> ElementValue for T {}

/// Result of an execute call
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteOutcome<R> {
    /// The function ran on the referenced element only
    Single(R),
    /// The function ran on every element, results in element order
    PerElement(Vec<R>),
}

impl<R> ExecuteOutcome<R> {
    pub fn into_vec(self) -> Vec<R> {
        match self {
            ExecuteOutcome::Single(r) => vec![r],
            ExecuteOutcome::PerElement(rs) => rs,
        }
    }

    pub fn single(self) -> Option<R> {
        match self {
            ExecuteOutcome::Single(r) => Some(r),
            ExecuteOutcome::PerElement(_) => None,
        }
    }
}

/// The output a node streams its elements to
struct Output<T: ElementValue> {
    channel: ChannelId,
    sender: Arc<dyn BatchSender<Element<T>>>,
}

pub struct ShardNode<T: ElementValue> {
    id: ShardId,
    items: Vec<T>,
    transport: Arc<dyn Transport>,
    send_batch_size: usize,
    output: Option<Output<T>>,
    stream_additions: bool,
    torn_down: bool,
}

impl<T: ElementValue> ShardNode<T> {
    pub fn new(id: ShardId, transport: Arc<dyn Transport>, send_batch_size: usize) -> Self {
        Self {
            id,
            items: Vec::new(),
            transport,
            send_batch_size,
            output: None,
            stream_additions: false,
            torn_down: false,
        }
    }

    /// Register the output channel subscribers listen on
    pub fn with_output(
        mut self,
        channel: ChannelId,
        sender: Arc<dyn BatchSender<Element<T>>>,
        stream_additions: bool,
    ) -> Self {
        self.output = Some(Output { channel, sender });
        self.stream_additions = stream_additions;
        self
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn output_channel(&self) -> Option<&ChannelId> {
        self.output.as_ref().map(|o| &o.channel)
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    fn reference(&self, offset: usize) -> ElementReference {
        ElementReference::new(self.id, offset)
    }

    /// Index of the element a reference points to, if it is live and ours
    fn locate(&self, reference: &ElementReference) -> Option<usize> {
        (reference.exists && reference.shard_id == self.id && reference.offset < self.items.len())
            .then_some(reference.offset)
    }

    fn check_owner(&self, reference: &ElementReference) -> ShardResult<usize> {
        if reference.shard_id != self.id {
            return Err(ShardError::ShardMismatch {
                expected: self.id,
                actual: reference.shard_id,
            });
        }
        self.locate(reference)
            .ok_or(ShardError::ElementNotFound(*reference))
    }

    pub fn get(&self, reference: &ElementReference) -> Option<Element<T>> {
        self.locate(reference)
            .map(|offset| Element::new(self.reference(offset), self.items[offset].clone()))
    }

    pub fn contains(&self, value: &T) -> bool {
        self.items.contains(value)
    }

    pub fn contains_reference(&self, reference: &ElementReference) -> bool {
        self.locate(reference).is_some()
    }

    /// Current elements paired with their references
    pub fn snapshot(&self) -> Vec<Element<T>> {
        self.items
            .iter()
            .enumerate()
            .map(|(offset, value)| Element::new(self.reference(offset), value.clone()))
            .collect()
    }

    /// Stream elements outside any transaction; failures are logged only
    async fn publish(&self, elements: Vec<Element<T>>) {
        let Some(output) = &self.output else {
            return;
        };
        if let Err(e) = output.sender.send_batch(elements).await {
            warn!("ShardNode {}: Failed to publish on {}: {}", self.id, output.channel, e);
        }
    }

    /// Append items; references are contiguous from the previous length
    pub async fn add_range(&mut self, items: Vec<T>) -> ShardResult<Vec<ElementReference>> {
        let start = self.items.len();
        let references: Vec<ElementReference> =
            (start..start + items.len()).map(|o| self.reference(o)).collect();

        if self.stream_additions && self.output.is_some() {
            let added = references
                .iter()
                .zip(items.iter())
                .map(|(r, v)| Element::new(*r, v.clone()))
                .collect();
            self.items.extend(items);
            self.publish(added).await;
        } else {
            self.items.extend(items);
        }

        debug!("ShardNode {}: Added {} elements", self.id, references.len());
        Ok(references)
    }

    /// Remove the referenced element and stream its tombstone
    ///
    /// Returns false when the reference belongs to another shard, is out of
    /// range, or is already a tombstone.
    pub async fn remove(&mut self, reference: &ElementReference) -> bool {
        if reference.shard_id != self.id {
            warn!(
                "ShardNode {}: Remove for reference owned by shard {}",
                self.id, reference.shard_id
            );
            return false;
        }
        let Some(offset) = self.locate(reference) else {
            return false;
        };

        let value = self.items.remove(offset);
        self.publish(vec![Element::new(self.reference(offset).tombstone(), value)])
            .await;
        true
    }

    /// Run `f` on the referenced element, or on every element in order
    pub fn execute_sync<S, R, F>(
        &mut self,
        f: F,
        state: Option<&S>,
        reference: Option<ElementReference>,
    ) -> ShardResult<ExecuteOutcome<R>>
    where
        F: Fn(&mut T, Option<&S>) -> R,
    {
        match reference {
            Some(reference) => {
                let offset = self.check_owner(&reference)?;
                Ok(ExecuteOutcome::Single(f(&mut self.items[offset], state)))
            }
            None => Ok(ExecuteOutcome::PerElement(
                self.items.iter_mut().map(|item| f(item, state)).collect(),
            )),
        }
    }

    /// Run an async `f` that takes each element by value and hands it back
    ///
    /// Without a reference, every element's future runs concurrently and the
    /// returned values replace the originals in order.
    pub async fn execute_async<S, R, F, Fut>(
        &mut self,
        f: F,
        state: Option<Arc<S>>,
        reference: Option<ElementReference>,
    ) -> ShardResult<ExecuteOutcome<R>>
    where
        F: Fn(T, Option<Arc<S>>) -> Fut,
        Fut: Future<Output = (T, R)>,
    {
        match reference {
            Some(reference) => {
                let offset = self.check_owner(&reference)?;
                let value = self.items.remove(offset);
                let (value, result) = f(value, state).await;
                self.items.insert(offset, value);
                Ok(ExecuteOutcome::Single(result))
            }
            None => {
                let items = std::mem::take(&mut self.items);
                let outcomes = join_all(items.into_iter().map(|v| f(v, state.clone()))).await;
                let (items, results): (Vec<T>, Vec<R>) = outcomes.into_iter().unzip();
                self.items = items;
                Ok(ExecuteOutcome::PerElement(results))
            }
        }
    }

    async fn stream_snapshot(
        &self,
        sender: &dyn BatchSender<Element<T>>,
        transaction: TransactionId,
    ) -> ShardResult<()> {
        let snapshot = self.snapshot();
        debug!(
            "ShardNode {}: Enumerating {} elements in transaction {}",
            self.id,
            snapshot.len(),
            transaction
        );
        sender.start_transaction(transaction).await?;
        if !snapshot.is_empty() {
            sender.send_batch(snapshot).await?;
        }
        sender.end_transaction(transaction).await
    }

    /// Stream a snapshot as one transaction on the node's output channel
    pub async fn enumerate_to_subscribers(
        &self,
        transaction: Option<TransactionId>,
    ) -> ShardResult<TransactionId> {
        let output = self.output.as_ref().ok_or_else(|| {
            ShardError::OperationNotSupported(format!("shard {} has no output channel", self.id))
        })?;
        let transaction = transaction.unwrap_or_default();
        self.stream_snapshot(output.sender.as_ref(), transaction)
            .await?;
        Ok(transaction)
    }

    /// Stream a snapshot as one transaction on an explicit channel
    ///
    /// The channel stays open afterwards; other shards may share it.
    pub async fn enumerate_to_stream(
        &self,
        channel: ChannelId,
        transaction: TransactionId,
    ) -> ShardResult<()> {
        let sender =
            ChannelSender::<Element<T>>::new(self.transport.clone(), channel, self.send_batch_size);
        self.stream_snapshot(&sender, transaction).await
    }

    /// Tear down the output channel; the actor stops afterwards
    pub async fn tear_down(&mut self) -> ShardResult<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        debug!("ShardNode {}: Tearing down", self.id);
        match &self.output {
            Some(output) => output.sender.tear_down().await,
            None => Ok(()),
        }
    }
}
