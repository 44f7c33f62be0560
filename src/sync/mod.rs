//! Fine-grained change propagation between object graph replicas
//!
//! This module provides:
//! - Object identities carried by each observable object
//! - A type registry answering capability queries
//! - Observable objects and lists with change notification
//! - Reference-counted known-object tables
//! - Outgoing and incoming change processors and the wire messages between them
//!
//! Each endpoint owns its own known-object table. An object reachable
//! through several tracked paths keeps a count equal to the number of
//! paths, and leaves the table only when the last one is released.

pub mod identity;
pub mod incoming;
pub mod known;
pub mod message;
pub mod model;
pub mod outgoing;
pub mod pump;
pub mod registry;

pub use identity::{ObjectIdentifier, ObjectIdentityGenerator};
pub use incoming::IncomingChangeProcessor;
pub use known::{KnownObjectTable, ObjectReferenceCounter};
pub use message::{ChangeMessage, IdentityLookup, WireNode, WireValue};
pub use model::{
    CollectionAction, CollectionEvent, CollectionListener, ListenerId, ObservableList,
    ObservableObject, PropertyListener, Value,
};
pub use outgoing::OutgoingChangeProcessor;
pub use pump::ChangePump;
pub use registry::{PropertyDescriptor, PropertyKind, TypeDescriptor, TypeRegistry};
