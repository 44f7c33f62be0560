use thiserror::Error;

use crate::sharding::{ElementReference, ShardId};
use crate::sync::ObjectIdentifier;
use crate::transport::TransportError;

#[derive(Error, Debug, Clone)]
pub enum ShardError {
    // Addressing errors
    #[error("Reference addresses shard '{actual}' but was presented to shard '{expected}'")]
    ShardMismatch { expected: ShardId, actual: ShardId },

    #[error("Shard '{0}' is not part of this collection")]
    UnknownShard(ShardId),

    #[error("No element at {0}")]
    ElementNotFound(ElementReference),

    #[error("Shard '{0}' is no longer running")]
    NodeUnavailable(ShardId),

    // Coordinator errors
    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),

    #[error("Collection is initializing: {0}")]
    Initializing(String),

    // Stream errors
    #[error("Channel '{0}' has been torn down")]
    TornDown(String),

    #[error("Channel '{0}' closed before the transaction completed")]
    ChannelClosed(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(String),

    // Change propagation errors
    #[error("Object '{0}' is not known on this endpoint")]
    UnknownObject(ObjectIdentifier),

    #[error("Object '{0}' is referenced but missing from the identity lookup")]
    MissingIdentity(ObjectIdentifier),

    #[error("Type '{0}' is not registered")]
    UnknownType(String),

    #[error("Type '{type_name}' has no property '{property}'")]
    UnknownProperty { type_name: String, property: String },

    #[error("Invalid change: {0}")]
    InvalidChange(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ShardResult<T> = Result<T, ShardError>;

impl From<bincode::Error> for ShardError {
    fn from(err: bincode::Error) -> Self {
        ShardError::Codec(err.to_string())
    }
}

impl From<lz4_flex::block::DecompressError> for ShardError {
    fn from(err: lz4_flex::block::DecompressError) -> Self {
        ShardError::Codec(err.to_string())
    }
}

impl From<toml::de::Error> for ShardError {
    fn from(err: toml::de::Error) -> Self {
        ShardError::Config(err.to_string())
    }
}

impl serde::Serialize for ShardError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl ShardError {
    /// Addressing errors are caller bugs and must never be retried
    pub fn is_addressing(&self) -> bool {
        matches!(
            self,
            ShardError::ShardMismatch { .. } | ShardError::UnknownShard(_)
        )
    }
}
