//! Object identities
//!
//! Every observable object carries its own `OnceCell<ObjectIdentifier>`,
//! so the generator never holds the object and never extends its lifetime.

use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Global identity of an observable object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectIdentifier {
    /// Generator that issued the id
    pub scope_id: Uuid,
    pub object_id: u64,
}

impl ObjectIdentifier {
    pub fn new(scope_id: Uuid, object_id: u64) -> Self {
        Self {
            scope_id,
            object_id,
        }
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope_id, self.object_id)
    }
}

static GLOBAL: Lazy<ObjectIdentityGenerator> = Lazy::new(ObjectIdentityGenerator::new);

/// Issues identifiers unique within its scope
pub struct ObjectIdentityGenerator {
    scope_id: Uuid,
    next: AtomicU64,
}

impl Default for ObjectIdentityGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectIdentityGenerator {
    pub fn new() -> Self {
        Self {
            scope_id: Uuid::new_v4(),
            next: AtomicU64::new(1),
        }
    }

    /// The process-wide generator
    pub fn global() -> &'static ObjectIdentityGenerator {
        &GLOBAL
    }

    pub fn scope_id(&self) -> Uuid {
        self.scope_id
    }

    pub fn next_identifier(&self) -> ObjectIdentifier {
        ObjectIdentifier::new(self.scope_id, self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// The identifier stored in `slot`, assigning one on first use
    pub fn identify(&self, slot: &OnceCell<ObjectIdentifier>) -> ObjectIdentifier {
        *slot.get_or_init(|| self.next_identifier())
    }
}
