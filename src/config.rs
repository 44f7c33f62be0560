//! Collection configuration
//!
//! Passed explicitly to the node factory and coordinator. Can be loaded
//! from a TOML file; every field has a default.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ShardError, ShardResult};

/// Configuration for a sharded collection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionConfig {
    /// Shard count the collection is grown to at startup
    #[serde(default = "default_initial_shards")]
    pub initial_shards: usize,

    /// Number of items per chunk dispatched by BatchAdd
    #[serde(default = "default_add_chunk_size")]
    pub add_chunk_size: usize,

    /// Max items per ItemBatch frame; also the enqueue auto-flush threshold
    #[serde(default = "default_send_batch_size")]
    pub send_batch_size: usize,

    /// Namespace of each shard's output channel
    #[serde(default = "default_output_namespace")]
    pub output_namespace: String,

    /// Stream added elements continuously (removals are always streamed)
    #[serde(default)]
    pub stream_additions: bool,
}

fn default_initial_shards() -> usize {
    4
}

fn default_add_chunk_size() -> usize {
    1000
}

fn default_send_batch_size() -> usize {
    500
}

fn default_output_namespace() -> String {
    "shard-output".to_string()
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            initial_shards: default_initial_shards(),
            add_chunk_size: default_add_chunk_size(),
            send_batch_size: default_send_batch_size(),
            output_namespace: default_output_namespace(),
            stream_additions: false,
        }
    }
}

impl CollectionConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> ShardResult<Self> {
        let config: CollectionConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> ShardResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ShardError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        tracing::debug!("Loaded collection config from {}", path.display());
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> ShardResult<()> {
        if self.add_chunk_size == 0 {
            return Err(ShardError::Config(
                "add_chunk_size must be positive".to_string(),
            ));
        }
        if self.send_batch_size == 0 {
            return Err(ShardError::Config(
                "send_batch_size must be positive".to_string(),
            ));
        }
        if self.output_namespace.trim().is_empty() {
            return Err(ShardError::Config(
                "output_namespace must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
