//! Shared helpers for integration tests

use shardlist::{
    CollectionConfig, CollectionCoordinator, InMemoryTransport, LocalNodeFactory, Transport,
};
use std::sync::Arc;
use std::time::Duration;

pub fn create_collection(
    add_chunk_size: usize,
) -> (Arc<dyn Transport>, CollectionCoordinator<i64>) {
    let config = CollectionConfig {
        add_chunk_size,
        ..CollectionConfig::default()
    };
    let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::new());
    let factory = Arc::new(LocalNodeFactory::new(transport.clone(), config.clone()));
    (transport, CollectionCoordinator::new(factory, config))
}

/// Poll `condition` until it holds or two seconds pass
#[allow(dead_code)]
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
