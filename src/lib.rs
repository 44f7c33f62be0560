pub mod config;
pub mod error;
pub mod sharding;
pub mod stream;
pub mod sync;
pub mod transport;

pub use config::CollectionConfig;
pub use error::{ShardError, ShardResult};
pub use sharding::{
    CollectionCoordinator, CoordinatorState, Element, ElementReference, ExecuteOutcome,
    LocalNodeFactory, NodeFactory, ShardHandle, ShardId,
};
pub use stream::{
    BatchConsumer, BatchSender, ChannelConsumer, ChannelSender, CollectingSink, ConsumerAggregate,
    ItemSink, SenderComposite, StreamMessage, TransactionId,
};
pub use sync::{
    ChangeMessage, ChangePump, IncomingChangeProcessor, ObjectIdentifier, ObjectIdentityGenerator,
    ObservableList, ObservableObject, OutgoingChangeProcessor, TypeDescriptor, TypeRegistry, Value,
};
pub use transport::{ChannelId, ChannelObserver, InMemoryTransport, Transport, TransportError};
