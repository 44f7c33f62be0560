//! Shard actor and its client handle

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::node::{ElementValue, ExecuteOutcome, ShardNode};
use super::reference::{Element, ElementReference, ShardId};
use crate::error::{ShardError, ShardResult};
use crate::stream::TransactionId;
use crate::transport::ChannelId;

/// A unit of work run against the node inside its actor task
type ShardCommand<T> =
    Box<dyn for<'a> FnOnce(&'a mut ShardNode<T>) -> BoxFuture<'a, ()> + Send>;

fn command<T, F>(f: F) -> ShardCommand<T>
where
    T: ElementValue,
    F: for<'a> FnOnce(&'a mut ShardNode<T>) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(f)
}

/// Cloneable client for one shard actor
///
/// Commands are queued on the actor's mailbox and run one at a time, so the
/// node's list has a single writer. Once the actor has stopped every call
/// fails with `NodeUnavailable`.
pub struct ShardHandle<T: ElementValue> {
    id: ShardId,
    output: Option<ChannelId>,
    mailbox: mpsc::UnboundedSender<ShardCommand<T>>,
}

impl<T: ElementValue> Clone for ShardHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            output: self.output.clone(),
            mailbox: self.mailbox.clone(),
        }
    }
}

impl<T: ElementValue> ShardHandle<T> {
    /// Move the node into its own actor task
    pub fn spawn(node: ShardNode<T>) -> Self {
        let id = node.id();
        let output = node.output_channel().cloned();
        let (mailbox, mut inbox) = mpsc::unbounded_channel::<ShardCommand<T>>();

        tokio::spawn(async move {
            let mut node = node;
            while let Some(command) = inbox.recv().await {
                command(&mut node).await;
                if node.is_torn_down() {
                    break;
                }
            }
            debug!("ShardNode {}: Actor stopped", id);
        });

        Self {
            id,
            output,
            mailbox,
        }
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn output_channel(&self) -> Option<&ChannelId> {
        self.output.as_ref()
    }

    async fn call<R, F>(&self, f: F) -> ShardResult<R>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut ShardNode<T>) -> BoxFuture<'a, R> + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let queued = command(move |node| {
            async move {
                let _ = reply.send(f(node).await);
            }
            .boxed()
        });
        self.mailbox
            .send(queued)
            .map_err(|_| ShardError::NodeUnavailable(self.id))?;
        response
            .await
            .map_err(|_| ShardError::NodeUnavailable(self.id))
    }

    async fn query<R, F>(&self, f: F) -> ShardResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut ShardNode<T>) -> R + Send + 'static,
    {
        self.call(move |node| future::ready(f(node)).boxed()).await
    }

    pub async fn add_range(&self, items: Vec<T>) -> ShardResult<Vec<ElementReference>> {
        self.call(move |node| node.add_range(items).boxed())
            .await?
    }

    pub async fn remove(&self, reference: ElementReference) -> ShardResult<bool> {
        self.call(move |node| async move { node.remove(&reference).await }.boxed())
            .await
    }

    pub async fn get(&self, reference: ElementReference) -> ShardResult<Option<Element<T>>> {
        self.query(move |node| node.get(&reference)).await
    }

    pub async fn contains(&self, value: T) -> ShardResult<bool> {
        self.query(move |node| node.contains(&value)).await
    }

    pub async fn contains_reference(&self, reference: ElementReference) -> ShardResult<bool> {
        self.query(move |node| node.contains_reference(&reference))
            .await
    }

    pub async fn count(&self) -> ShardResult<usize> {
        self.query(|node| node.count()).await
    }

    pub async fn execute_sync<S, R, F>(
        &self,
        f: F,
        state: Option<Arc<S>>,
        reference: Option<ElementReference>,
    ) -> ShardResult<ExecuteOutcome<R>>
    where
        S: Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(&mut T, Option<&S>) -> R + Send + 'static,
    {
        self.query(move |node| node.execute_sync(f, state.as_deref(), reference))
            .await?
    }

    pub async fn execute_async<S, R, F, Fut>(
        &self,
        f: F,
        state: Option<Arc<S>>,
        reference: Option<ElementReference>,
    ) -> ShardResult<ExecuteOutcome<R>>
    where
        S: Send + Sync + 'static,
        R: Send + 'static,
        F: Fn(T, Option<Arc<S>>) -> Fut + Send + 'static,
        Fut: Future<Output = (T, R)> + Send + 'static,
    {
        self.call(move |node| node.execute_async(f, state, reference).boxed())
            .await?
    }

    pub async fn enumerate_to_subscribers(
        &self,
        transaction: Option<TransactionId>,
    ) -> ShardResult<TransactionId> {
        self.call(move |node| async move { node.enumerate_to_subscribers(transaction).await }.boxed())
            .await?
    }

    pub async fn enumerate_to_stream(
        &self,
        channel: ChannelId,
        transaction: TransactionId,
    ) -> ShardResult<()> {
        self.call(move |node| async move { node.enumerate_to_stream(channel, transaction).await }.boxed())
            .await?
    }

    /// Tear down the output channel and stop the actor; repeat calls are no-ops
    pub async fn tear_down(&self) -> ShardResult<()> {
        match self.call(|node| node.tear_down().boxed()).await {
            Ok(result) => result,
            Err(ShardError::NodeUnavailable(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Whether the actor has stopped
    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}
