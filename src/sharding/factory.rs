//! Shard node creation

use std::sync::Arc;
use tracing::info;

use super::handle::ShardHandle;
use super::node::{ElementValue, ShardNode};
use super::reference::{Element, ShardId};
use crate::config::CollectionConfig;
use crate::error::ShardResult;
use crate::stream::{BatchSender, ChannelSender};
use crate::transport::{ChannelId, Transport};

/// Creates shard nodes on demand for a growing collection
#[async_trait::async_trait]
pub trait NodeFactory<T: ElementValue>: Send + Sync {
    async fn create_shard_node(&self) -> ShardResult<ShardHandle<T>>;
}

/// Runs every shard as a tokio task in this process
///
/// Each node gets an output channel named after its shard id in the
/// configured namespace.
pub struct LocalNodeFactory {
    transport: Arc<dyn Transport>,
    config: CollectionConfig,
}

impl LocalNodeFactory {
    pub fn new(transport: Arc<dyn Transport>, config: CollectionConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl<T: ElementValue> NodeFactory<T> for LocalNodeFactory {
    async fn create_shard_node(&self) -> ShardResult<ShardHandle<T>> {
        let id = ShardId::new();
        let channel = ChannelId::new(id.as_uuid(), self.config.output_namespace.clone());
        let output: Arc<dyn BatchSender<Element<T>>> = Arc::new(ChannelSender::new(
            self.transport.clone(),
            channel.clone(),
            self.config.send_batch_size,
        ));

        let node = ShardNode::new(id, self.transport.clone(), self.config.send_batch_size)
            .with_output(channel.clone(), output, self.config.stream_additions);
        info!("Created shard {} with output channel {}", id, channel);

        Ok(ShardHandle::spawn(node))
    }
}
