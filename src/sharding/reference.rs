//! Shard identifiers and element references

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(Uuid);

impl ShardId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ShardId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stable handle to one element: the owning shard and its offset there
///
/// Offsets are list positions. Removing an element shifts every higher
/// offset in the same shard down by one, so references must not be cached
/// across removals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementReference {
    pub shard_id: ShardId,
    pub offset: usize,
    /// False for a reference to a removed element
    pub exists: bool,
}

impl ElementReference {
    pub fn new(shard_id: ShardId, offset: usize) -> Self {
        Self {
            shard_id,
            offset,
            exists: true,
        }
    }

    /// The same address, marked as removed
    pub fn tombstone(self) -> Self {
        Self {
            exists: false,
            ..self
        }
    }
}

impl fmt::Display for ElementReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.shard_id, self.offset)?;
        if !self.exists {
            write!(f, " (removed)")?;
        }
        Ok(())
    }
}

/// An element paired with its reference, as produced by reads and enumeration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element<T> {
    pub reference: ElementReference,
    pub value: T,
}

impl<T> Element<T> {
    pub fn new(reference: ElementReference, value: T) -> Self {
        Self { reference, value }
    }

    pub fn exists(&self) -> bool {
        self.reference.exists
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstone_keeps_address() {
        let shard = ShardId::new();
        let reference = ElementReference::new(shard, 7);
        let removed = reference.tombstone();

        assert!(reference.exists);
        assert!(!removed.exists);
        assert_eq!(removed.shard_id, shard);
        assert_eq!(removed.offset, 7);
        assert_ne!(reference, removed);
    }

    #[test]
    fn test_display() {
        let shard = ShardId::from_uuid(Uuid::nil());
        let reference = ElementReference::new(shard, 3);
        assert_eq!(
            reference.to_string(),
            "00000000-0000-0000-0000-000000000000#3"
        );
        assert!(reference.tombstone().to_string().ends_with("(removed)"));
    }
}
