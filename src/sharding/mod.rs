//! Sharded collection
//!
//! A logical list is spread over shard nodes. Each node is an actor owning
//! its local `Vec<T>`; the `CollectionCoordinator` routes reference-bearing
//! operations to the owning shard and fans everything else out.

pub mod batch;
pub mod coordinator;
pub mod factory;
pub mod handle;
pub mod node;
pub mod reference;

pub use batch::{chunk_items, dispatch_greedy};
pub use coordinator::{CollectionCoordinator, CoordinatorState};
pub use factory::{LocalNodeFactory, NodeFactory};
pub use handle::ShardHandle;
pub use node::{ElementValue, ExecuteOutcome, ShardNode};
pub use reference::{Element, ElementReference, ShardId};
