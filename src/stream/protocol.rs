//! Wire protocol for batched, transactional streams
//!
//! Frames are bincode-encoded. Frames larger than the compression threshold
//! are LZ4-compressed; the first byte of every frame says which.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{ShardError, ShardResult};

/// Compression threshold (64 KB)
const COMPRESSION_THRESHOLD: usize = 64 * 1024;

/// Largest payload a frame may carry once decompressed (64 MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const FRAME_RAW: u8 = 0;
const FRAME_LZ4: u8 = 1;

/// Identifies one logical transaction, possibly spanning several channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    Start,
    End,
}

/// A transaction boundary observed on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub state: TransactionState,
}

/// Messages carried on a batch stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamMessage<T> {
    ItemBatch { items: Vec<T> },
    TransactionStart { id: TransactionId },
    TransactionEnd { id: TransactionId },
    Flush,
}

impl<T> StreamMessage<T> {
    /// The transaction boundary this message marks, if any
    pub fn transaction(&self) -> Option<Transaction> {
        match self {
            StreamMessage::TransactionStart { id } => Some(Transaction {
                id: *id,
                state: TransactionState::Start,
            }),
            StreamMessage::TransactionEnd { id } => Some(Transaction {
                id: *id,
                state: TransactionState::End,
            }),
            _ => None,
        }
    }
}

impl<T: Serialize + DeserializeOwned> StreamMessage<T> {
    /// Encode message into a frame
    pub fn encode(&self) -> ShardResult<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(ShardError::Codec(format!(
                "frame of {} bytes exceeds {} bytes",
                payload.len(),
                MAX_FRAME_SIZE
            )));
        }
        let mut frame = Vec::with_capacity(1 + payload.len());
        if payload.len() > COMPRESSION_THRESHOLD {
            frame.push(FRAME_LZ4);
            frame.extend(lz4_flex::compress_prepend_size(&payload));
        } else {
            frame.push(FRAME_RAW);
            frame.extend(payload);
        }
        Ok(frame)
    }

    /// Decode message from a frame produced by `encode`
    pub fn decode(frame: &[u8]) -> ShardResult<Self> {
        let (flag, body) = frame
            .split_first()
            .ok_or_else(|| ShardError::Codec("empty frame".to_string()))?;
        match *flag {
            FRAME_RAW => Ok(bincode::deserialize(body)?),
            FRAME_LZ4 => {
                // Size prefix comes off the wire; check it before allocating
                let prefix: [u8; 4] = body
                    .get(..4)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| ShardError::Codec("truncated size prefix".to_string()))?;
                let size = u32::from_le_bytes(prefix) as usize;
                if size > MAX_FRAME_SIZE {
                    return Err(ShardError::Codec(format!(
                        "frame declares {} bytes, limit is {}",
                        size, MAX_FRAME_SIZE
                    )));
                }
                let payload = lz4_flex::decompress_size_prepended(body)?;
                Ok(bincode::deserialize(&payload)?)
            }
            other => Err(ShardError::Codec(format!("unknown frame flag {}", other))),
        }
    }
}
