//! End-to-end change propagation between two endpoints
//!
//! Endpoint A owns the object graphs and an outgoing processor; endpoint B
//! mirrors them through a channel consumer feeding an incoming processor.

use shardlist::{
    BatchConsumer, ChangeMessage, ChangePump, ChannelConsumer, ChannelId, ChannelSender,
    IncomingChangeProcessor, InMemoryTransport, ItemSink, ObservableList, ObservableObject,
    OutgoingChangeProcessor, Transport, TypeDescriptor, TypeRegistry, Value,
};
use std::sync::Arc;
use std::time::Duration;

struct Endpoints {
    registry: Arc<TypeRegistry>,
    source: OutgoingChangeProcessor,
    pump: ChangePump,
    mirror: Arc<IncomingChangeProcessor>,
    consumer: ChannelConsumer<ChangeMessage>,
}

impl Endpoints {
    async fn connect() -> Self {
        let registry = TypeRegistry::new();
        registry.register(
            TypeDescriptor::notifying("Order")
                .value("Value")
                .object("Customer")
                .object("Billing")
                .collection("Lines"),
        );
        registry.register(TypeDescriptor::notifying("Customer").value("Name"));
        let registry = Arc::new(registry);

        let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::new());
        let channel = ChannelId::random("changes");
        let mirror = Arc::new(IncomingChangeProcessor::new(registry.clone()));
        let consumer = ChannelConsumer::subscribe(
            transport.clone(),
            channel.clone(),
            mirror.clone() as Arc<dyn ItemSink<ChangeMessage>>,
        )
        .await
        .expect("Failed to subscribe mirror");

        let source = OutgoingChangeProcessor::new();
        let sender = Arc::new(ChannelSender::<ChangeMessage>::new(transport, channel, 64));
        let pump = ChangePump::new(&source, sender);

        Self {
            registry,
            source,
            pump,
            mirror,
            consumer,
        }
    }

    fn create(&self, type_name: &str) -> Arc<ObservableObject> {
        self.registry.create(type_name).unwrap()
    }

    /// Ship everything emitted so far and wait until the mirror applied it
    async fn sync(&self) {
        let id = self.pump.forward_in_transaction(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), self.consumer.await_transaction(id))
            .await
            .expect("Change transaction did not complete")
            .unwrap();
    }
}

#[tokio::test]
async fn test_nested_property_change_patches_mirror() {
    let endpoints = Endpoints::connect().await;
    let customer = endpoints.create("Customer");
    customer.set("Name", "Ada").unwrap();
    let order = endpoints.create("Order");
    order.set("Customer", customer.clone()).unwrap();
    order.set("Value", 1).unwrap();

    endpoints.source.add_item(order.clone()).unwrap();
    endpoints.sync().await;

    let mirrored_order = endpoints.mirror.get_object(order.identifier()).unwrap();
    let mirrored_customer = endpoints.mirror.get_object(customer.identifier()).unwrap();
    assert_eq!(mirrored_customer.get("Name"), Some(Value::from("Ada")));

    order.set("Value", 123).unwrap();
    customer.set("Name", "Grace").unwrap();
    endpoints.sync().await;

    // Same instances, patched in place
    let patched = endpoints.mirror.get_object(order.identifier()).unwrap();
    assert!(Arc::ptr_eq(&patched, &mirrored_order));
    assert_eq!(patched.get("Value"), Some(Value::Int(123)));
    assert_eq!(mirrored_customer.get("Name"), Some(Value::from("Grace")));
    assert_eq!(
        patched.get("Customer"),
        Some(Value::Object(mirrored_customer.clone()))
    );
    assert_eq!(endpoints.mirror.items().len(), 1);
}

#[tokio::test]
async fn test_shared_object_survives_until_last_path() {
    let endpoints = Endpoints::connect().await;
    let customer = endpoints.create("Customer");
    let order = endpoints.create("Order");
    order.set("Customer", customer.clone()).unwrap();
    order.set("Billing", customer.clone()).unwrap();

    endpoints.source.add_item(order.clone()).unwrap();
    endpoints.sync().await;
    assert_eq!(endpoints.mirror.ref_count(customer.identifier()), 2);
    assert_eq!(endpoints.source.ref_count(customer.identifier()), 2);

    order.set("Billing", Value::Null).unwrap();
    endpoints.sync().await;
    assert!(endpoints.mirror.is_known_object(customer.identifier()));
    assert!(endpoints.source.is_known_object(customer.identifier()));

    order.set("Customer", Value::Null).unwrap();
    endpoints.sync().await;
    assert!(!endpoints.mirror.is_known_object(customer.identifier()));
    assert!(!endpoints.source.is_known_object(customer.identifier()));
}

#[tokio::test]
async fn test_collection_changes_reach_mirror() {
    let endpoints = Endpoints::connect().await;
    let lines = ObservableList::new();
    let order = endpoints.create("Order");
    order.set("Lines", lines.clone()).unwrap();
    endpoints.source.add_item(order.clone()).unwrap();
    endpoints.sync().await;

    let first = endpoints.create("Customer");
    let second = endpoints.create("Customer");
    lines.push(first.clone());
    lines.push(second.clone());
    lines.remove_at(0).unwrap();
    endpoints.sync().await;

    let mirrored = endpoints.mirror.get(lines.identifier()).unwrap();
    let mirrored = mirrored.as_list().unwrap();
    assert_eq!(mirrored.len(), 1);
    assert_eq!(
        mirrored.get(0).and_then(|v| v.identifier()),
        Some(second.identifier())
    );
    assert!(!endpoints.mirror.is_known_object(first.identifier()));

    assert!(endpoints.source.remove_item(&Value::Object(order)).unwrap());
    endpoints.sync().await;
    assert_eq!(endpoints.mirror.known_count(), 0);
    assert!(endpoints.mirror.items().is_empty());
}
