//! Incoming change processor
//!
//! Rebuilds and patches a local mirror of the remote object graphs. Every
//! `Ref` is merge-resolved: an identity already known locally is reused
//! and its count incremented, an unknown one is materialized from the
//! message's identity lookup with the remote identifier.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error};

use super::identity::ObjectIdentifier;
use super::known::KnownObjectTable;
use super::message::{matches_wire, ChangeMessage, IdentityLookup, WireNode, WireValue, MAX_DEPTH};
use super::model::{CollectionAction, ObservableList, ObservableObject, Value};
use super::registry::{PropertyKind, TypeDescriptor, TypeRegistry};
use crate::error::{ShardError, ShardResult};
use crate::stream::ItemSink;

#[derive(Default)]
struct IncomingState {
    table: KnownObjectTable,
    roots: Vec<Value>,
}

fn no_eviction(_: ObjectIdentifier, _: &Value) {}

fn property_kind(descriptor: &TypeDescriptor, property: &str) -> ShardResult<PropertyKind> {
    descriptor
        .property(property)
        .map(|p| p.kind)
        .ok_or_else(|| ShardError::UnknownProperty {
            type_name: descriptor.name().to_string(),
            property: property.to_string(),
        })
}

fn is_tracked_slot(descriptor: &TypeDescriptor, property: &str) -> ShardResult<bool> {
    Ok(property_kind(descriptor, property)? != PropertyKind::Value)
}

fn too_deep(depth: usize) -> ShardResult<()> {
    if depth > MAX_DEPTH {
        return Err(ShardError::InvalidChange(format!(
            "value nested deeper than {} levels",
            MAX_DEPTH
        )));
    }
    Ok(())
}

/// What a wire value resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Null,
    Scalar,
    Object,
    List,
}

/// Same rule as the model's property validation
fn check_fits(kind: Option<PropertyKind>, shape: Shape) -> ShardResult<()> {
    let fits = match kind {
        None => true,
        Some(PropertyKind::Value) => shape != Shape::List,
        Some(PropertyKind::Object) => matches!(shape, Shape::Null | Shape::Object),
        Some(PropertyKind::Collection) => matches!(shape, Shape::Null | Shape::List),
    };
    if !fits {
        return Err(ShardError::InvalidChange(format!(
            "{:?} slot cannot hold {:?}",
            kind, shape
        )));
    }
    Ok(())
}

/// Tracked values materialized by this message whose contents are still pending
type Unfilled = Vec<(ObjectIdentifier, Value)>;

/// Applies change messages to a local mirror
pub struct IncomingChangeProcessor {
    registry: Arc<TypeRegistry>,
    state: Mutex<IncomingState>,
}

impl IncomingChangeProcessor {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            state: Mutex::new(IncomingState::default()),
        }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Mirrored root elements
    pub fn items(&self) -> Vec<Value> {
        self.state.lock().roots.clone()
    }

    pub fn get(&self, id: ObjectIdentifier) -> Option<Value> {
        self.state.lock().table.get(id)
    }

    pub fn get_object(&self, id: ObjectIdentifier) -> Option<Arc<ObservableObject>> {
        self.get(id).and_then(|v| v.as_object().cloned())
    }

    pub fn is_known_object(&self, id: ObjectIdentifier) -> bool {
        self.state.lock().table.is_known(id)
    }

    pub fn ref_count(&self, id: ObjectIdentifier) -> usize {
        self.state.lock().table.ref_count(id)
    }

    pub fn known_count(&self) -> usize {
        self.state.lock().table.len()
    }

    /// Apply one change message
    pub fn apply(&self, message: ChangeMessage) -> ShardResult<()> {
        let mut state = self.state.lock();
        match message {
            ChangeMessage::ItemAdded {
                item,
                identity_lookup,
            } => {
                self.check_message(&state.table, &identity_lookup, [(&item, None)])?;
                let value = self.resolve_slot(&mut state.table, &item, &identity_lookup)?;
                state.roots.push(value);
                Ok(())
            }
            ChangeMessage::ItemRemoved { item } => {
                let position = state
                    .roots
                    .iter()
                    .position(|root| matches_wire(root, &item))
                    .ok_or_else(|| {
                        ShardError::InvalidChange(format!("no root element matches {:?}", item))
                    })?;
                let root = state.roots.remove(position);
                state.table.untrack(&root, &mut no_eviction);
                Ok(())
            }
            ChangeMessage::PropertyChanged {
                identifier,
                property_name,
                value,
                identity_lookup,
            } => {
                let object = state
                    .table
                    .get(identifier)
                    .ok_or(ShardError::UnknownObject(identifier))?
                    .as_object()
                    .cloned()
                    .ok_or_else(|| {
                        ShardError::InvalidChange(format!("{} is not an object", identifier))
                    })?;
                let kind = property_kind(object.descriptor(), &property_name)?;
                let tracked = kind != PropertyKind::Value;
                self.check_message(&state.table, &identity_lookup, [(&value, Some(kind))])?;

                let new = if tracked {
                    self.resolve_slot(&mut state.table, &value, &identity_lookup)?
                } else {
                    self.resolve_inline(&value, 0)?
                };
                match object.set_quiet(&property_name, new.clone()) {
                    Ok(old) => {
                        if tracked {
                            state.table.untrack(&old, &mut no_eviction);
                        }
                        Ok(())
                    }
                    Err(e) => {
                        if tracked {
                            state.table.untrack(&new, &mut no_eviction);
                        }
                        Err(e)
                    }
                }
            }
            ChangeMessage::CollectionChanged {
                identifier,
                action,
                index,
                items,
                identity_lookup,
            } => {
                let list = state
                    .table
                    .get(identifier)
                    .ok_or(ShardError::UnknownObject(identifier))?
                    .as_list()
                    .cloned()
                    .ok_or_else(|| {
                        ShardError::InvalidChange(format!("{} is not a list", identifier))
                    })?;
                match action {
                    CollectionAction::Add => {
                        if let Some(position) = index.filter(|&i| i > list.len()) {
                            return Err(ShardError::InvalidChange(format!(
                                "insert at {} into list of {}",
                                position,
                                list.len()
                            )));
                        }
                        self.check_message(
                            &state.table,
                            &identity_lookup,
                            items.iter().map(|item| (item, None)),
                        )?;
                        let mut resolved = Vec::with_capacity(items.len());
                        for item in &items {
                            resolved.push(self.resolve_slot(
                                &mut state.table,
                                item,
                                &identity_lookup,
                            )?);
                        }
                        if let Err(e) = list.insert_quiet(index, resolved.clone()) {
                            for value in &resolved {
                                state.table.untrack(value, &mut no_eviction);
                            }
                            return Err(e);
                        }
                        Ok(())
                    }
                    CollectionAction::Remove => {
                        for (offset, item) in items.iter().enumerate() {
                            let removed = remove_matching(&list, index.map(|i| i + offset), item)?;
                            state.table.untrack(&removed, &mut no_eviction);
                        }
                        Ok(())
                    }
                    CollectionAction::Reset => {
                        for removed in list.clear_quiet() {
                            state.table.untrack(&removed, &mut no_eviction);
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    /// Reject a message that could fail halfway through resolution
    ///
    /// Runs before any count changes: every identity resolves, every type is
    /// registered, every field exists and holds a value of its kind. Each
    /// value is paired with the kind of the slot it lands in; `None` marks a
    /// root or list slot.
    fn check_message<'w>(
        &self,
        table: &KnownObjectTable,
        lookup: &IdentityLookup,
        values: impl IntoIterator<Item = (&'w WireValue, Option<PropertyKind>)>,
    ) -> ShardResult<()> {
        for node in lookup.values() {
            match node {
                WireNode::Object { type_name, fields } => {
                    let descriptor = self.registry.get(type_name)?;
                    if !descriptor.supports_property_change() {
                        return Err(ShardError::InvalidChange(format!(
                            "type '{}' cannot be referenced by identity",
                            type_name
                        )));
                    }
                    for (name, field) in fields {
                        let kind = property_kind(&descriptor, name)?;
                        self.check_slot(table, lookup, field, Some(kind))?;
                    }
                }
                WireNode::List { items } => {
                    for item in items {
                        self.check_slot(table, lookup, item, None)?;
                    }
                }
            }
        }
        for (value, kind) in values {
            self.check_slot(table, lookup, value, kind)?;
        }
        Ok(())
    }

    fn check_slot(
        &self,
        table: &KnownObjectTable,
        lookup: &IdentityLookup,
        wire: &WireValue,
        kind: Option<PropertyKind>,
    ) -> ShardResult<()> {
        if kind == Some(PropertyKind::Value) {
            return self.check_inline(wire, kind, 0).map(|_| ());
        }
        let shape = match wire {
            WireValue::Ref(id) => match (table.get(*id), lookup.get(id)) {
                (Some(Value::List(_)), _) | (None, Some(WireNode::List { .. })) => Shape::List,
                (Some(_), _) | (None, Some(WireNode::Object { .. })) => Shape::Object,
                (None, None) => return Err(ShardError::MissingIdentity(*id)),
            },
            WireValue::Record { type_name, .. } => {
                if self.registry.get(type_name)?.supports_property_change() {
                    return Err(ShardError::InvalidChange(format!(
                        "notifying type '{}' copied into a tracked slot",
                        type_name
                    )));
                }
                self.check_inline(wire, None, 0)?
            }
            _ => self.check_inline(wire, None, 0)?,
        };
        check_fits(kind, shape)
    }

    fn check_inline(
        &self,
        wire: &WireValue,
        kind: Option<PropertyKind>,
        depth: usize,
    ) -> ShardResult<Shape> {
        too_deep(depth)?;
        let shape = match wire {
            WireValue::Null => Shape::Null,
            WireValue::Bool(_) | WireValue::Int(_) | WireValue::Float(_) | WireValue::Text(_) => {
                Shape::Scalar
            }
            WireValue::Ref(id) => {
                return Err(ShardError::InvalidChange(format!(
                    "reference to {} in a plain slot",
                    id
                )))
            }
            WireValue::Record { type_name, fields } => {
                let descriptor = self.registry.get(type_name)?;
                for (name, field) in fields {
                    let field_kind = property_kind(&descriptor, name)?;
                    self.check_inline(field, Some(field_kind), depth + 1)?;
                }
                Shape::Object
            }
            WireValue::Items(items) => {
                for item in items {
                    self.check_inline(item, None, depth + 1)?;
                }
                Shape::List
            }
        };
        check_fits(kind, shape)?;
        Ok(shape)
    }

    /// Resolve a value landing in a tracked slot
    ///
    /// Objects new to this endpoint are registered as soon as they are
    /// reached, so later paths and cycles acquire the same instance; their
    /// contents are filled from a worklist.
    fn resolve_slot(
        &self,
        table: &mut KnownObjectTable,
        wire: &WireValue,
        lookup: &IdentityLookup,
    ) -> ShardResult<Value> {
        let mut unfilled = Unfilled::new();
        let value = self.resolve_element(table, wire, lookup, &mut unfilled)?;
        while let Some((id, target)) = unfilled.pop() {
            match (lookup.get(&id), &target) {
                (Some(WireNode::Object { fields, .. }), Value::Object(object)) => {
                    for (name, field) in fields {
                        let value = if is_tracked_slot(object.descriptor(), name)? {
                            self.resolve_element(table, field, lookup, &mut unfilled)?
                        } else {
                            self.resolve_inline(field, 0)?
                        };
                        object.set_quiet(name, value)?;
                    }
                }
                (Some(WireNode::List { items }), Value::List(list)) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.resolve_element(table, item, lookup, &mut unfilled)?);
                    }
                    list.insert_quiet(None, values)?;
                }
                _ => return Err(ShardError::MissingIdentity(id)),
            }
        }
        Ok(value)
    }

    fn resolve_element(
        &self,
        table: &mut KnownObjectTable,
        wire: &WireValue,
        lookup: &IdentityLookup,
        unfilled: &mut Unfilled,
    ) -> ShardResult<Value> {
        let WireValue::Ref(id) = wire else {
            return self.resolve_inline(wire, 0);
        };
        if let Some(known) = table.acquire(*id) {
            return Ok(known);
        }
        let value = match lookup.get(id).ok_or(ShardError::MissingIdentity(*id))? {
            WireNode::Object { type_name, .. } => {
                let descriptor = self.registry.get(type_name)?;
                debug!("Materializing {} {}", type_name, id);
                Value::Object(ObservableObject::with_identity(descriptor, *id))
            }
            WireNode::List { .. } => Value::List(ObservableList::with_identity(*id)),
        };
        table.register(*id, value.clone());
        unfilled.push((*id, value.clone()));
        Ok(value)
    }

    fn resolve_inline(&self, wire: &WireValue, depth: usize) -> ShardResult<Value> {
        too_deep(depth)?;
        Ok(match wire {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(*b),
            WireValue::Int(i) => Value::Int(*i),
            WireValue::Float(x) => Value::Float(*x),
            WireValue::Text(s) => Value::Text(s.clone()),
            WireValue::Record { type_name, fields } => {
                let object = ObservableObject::new(self.registry.get(type_name)?);
                for (name, field) in fields {
                    object.set_quiet(name, self.resolve_inline(field, depth + 1)?)?;
                }
                Value::Object(object)
            }
            WireValue::Items(items) => Value::List(ObservableList::from_items(
                items
                    .iter()
                    .map(|item| self.resolve_inline(item, depth + 1))
                    .collect::<ShardResult<Vec<_>>>()?,
            )),
            WireValue::Ref(id) => {
                return Err(ShardError::InvalidChange(format!(
                    "reference to {} in a plain slot",
                    id
                )))
            }
        })
    }
}

/// Remove the item described by `wire`, preferring the reported position
fn remove_matching(
    list: &ObservableList,
    hint: Option<usize>,
    wire: &WireValue,
) -> ShardResult<Value> {
    let items = list.items();
    let position = hint
        .filter(|&i| items.get(i).is_some_and(|v| matches_wire(v, wire)))
        .or_else(|| items.iter().position(|v| matches_wire(v, wire)))
        .ok_or_else(|| {
            ShardError::InvalidChange(format!(
                "list {} has no item matching {:?}",
                list.identifier(),
                wire
            ))
        })?;
    list.remove_quiet_at(position)
}

#[async_trait::async_trait]
impl ItemSink<ChangeMessage> for IncomingChangeProcessor {
    async fn on_items(&self, items: Vec<ChangeMessage>) -> ShardResult<()> {
        for message in items {
            let target = message.target();
            if let Err(e) = self.apply(message) {
                match target {
                    Some(id) => error!("Rejected change for {}: {}", id, e),
                    None => error!("Rejected change: {}", e),
                }
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::outgoing::OutgoingChangeProcessor;
    use crate::sync::registry::TypeDescriptor;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn registry() -> Arc<TypeRegistry> {
        let registry = TypeRegistry::new();
        registry.register(
            TypeDescriptor::notifying("Node")
                .value("Value")
                .value("Point")
                .object("Left")
                .object("Right")
                .collection("Children"),
        );
        registry.register(TypeDescriptor::plain("Point").value("x").value("y"));
        Arc::new(registry)
    }

    fn relay(rx: &mut UnboundedReceiver<ChangeMessage>, mirror: &IncomingChangeProcessor) {
        while let Ok(message) = rx.try_recv() {
            mirror.apply(message).unwrap();
        }
    }

    #[test]
    fn test_mirror_follows_source() {
        let registry = registry();
        let node = registry.get("Node").unwrap();
        let source = OutgoingChangeProcessor::new();
        let mirror = IncomingChangeProcessor::new(registry.clone());
        let mut rx = source.subscribe();

        let leaf = ObservableObject::new(node.clone());
        leaf.set("Value", 1).unwrap();
        let root = ObservableObject::new(node.clone());
        root.set("Left", leaf.clone()).unwrap();
        root.set(
            "Point",
            ObservableObject::build(registry.get("Point").unwrap(), [("x", 3)]).unwrap(),
        )
        .unwrap();
        source.add_item(root.clone()).unwrap();
        relay(&mut rx, &mirror);

        let mirrored_root = mirror.get_object(root.identifier()).unwrap();
        let mirrored_leaf = mirror.get_object(leaf.identifier()).unwrap();
        assert_eq!(mirrored_leaf.get("Value"), Some(Value::Int(1)));
        let point = mirrored_root.get("Point").unwrap();
        assert_eq!(point.as_object().unwrap().get("x"), Some(Value::Int(3)));

        leaf.set("Value", 123).unwrap();
        relay(&mut rx, &mirror);

        // Patched in place
        let patched = mirror.get_object(leaf.identifier()).unwrap();
        assert!(Arc::ptr_eq(&patched, &mirrored_leaf));
        assert_eq!(patched.get("Value"), Some(Value::Int(123)));
        assert_eq!(
            mirrored_root.get("Left"),
            Some(Value::Object(mirrored_leaf.clone()))
        );
    }

    #[test]
    fn test_refcounts_match_on_both_ends() {
        let registry = registry();
        let node = registry.get("Node").unwrap();
        let source = OutgoingChangeProcessor::new();
        let mirror = IncomingChangeProcessor::new(registry);
        let mut rx = source.subscribe();

        let shared = ObservableObject::new(node.clone());
        let root = ObservableObject::new(node);
        root.set("Left", shared.clone()).unwrap();
        root.set("Right", shared.clone()).unwrap();
        source.add_item(root.clone()).unwrap();
        relay(&mut rx, &mirror);
        assert_eq!(mirror.ref_count(shared.identifier()), 2);

        root.set("Left", Value::Null).unwrap();
        relay(&mut rx, &mirror);
        assert!(mirror.is_known_object(shared.identifier()));

        root.set("Right", Value::Null).unwrap();
        relay(&mut rx, &mirror);
        assert!(!mirror.is_known_object(shared.identifier()));
        assert!(!source.is_known_object(shared.identifier()));
    }

    #[test]
    fn test_collection_mirroring() {
        let registry = registry();
        let node = registry.get("Node").unwrap();
        let source = OutgoingChangeProcessor::new();
        let mirror = IncomingChangeProcessor::new(registry);
        let mut rx = source.subscribe();

        let children = ObservableList::new();
        let root = ObservableObject::new(node.clone());
        root.set("Children", children.clone()).unwrap();
        source.add_item(root.clone()).unwrap();

        let child = ObservableObject::new(node);
        children.push(child.clone());
        children.push("tag");
        children.insert(0, 7).unwrap();
        children.remove(&Value::from("tag"));
        relay(&mut rx, &mirror);

        let mirrored = mirror.get(children.identifier()).unwrap();
        let mirrored = mirrored.as_list().unwrap();
        assert_eq!(mirrored.len(), 2);
        assert_eq!(mirrored.get(0), Some(Value::Int(7)));
        assert_eq!(
            mirrored.get(1).and_then(|v| v.identifier()),
            Some(child.identifier())
        );

        children.clear();
        relay(&mut rx, &mirror);
        assert!(mirrored.is_empty());
        assert!(!mirror.is_known_object(child.identifier()));
    }

    #[test]
    fn test_remove_item_releases_graph() {
        let registry = registry();
        let node = registry.get("Node").unwrap();
        let source = OutgoingChangeProcessor::new();
        let mirror = IncomingChangeProcessor::new(registry);
        let mut rx = source.subscribe();

        let root = ObservableObject::new(node.clone());
        root.set("Left", ObservableObject::new(node)).unwrap();
        source.add_item(root.clone()).unwrap();
        relay(&mut rx, &mirror);
        assert_eq!(mirror.known_count(), 2);

        source.remove_item(&Value::Object(root)).unwrap();
        relay(&mut rx, &mirror);
        assert_eq!(mirror.known_count(), 0);
        assert!(mirror.items().is_empty());
    }

    #[test]
    fn test_unknown_target_is_rejected() {
        let mirror = IncomingChangeProcessor::new(registry());
        let id = ObjectIdentifier::new(uuid::Uuid::new_v4(), 1);
        let result = mirror.apply(ChangeMessage::PropertyChanged {
            identifier: id,
            property_name: "Value".to_string(),
            value: WireValue::Int(1),
            identity_lookup: IdentityLookup::new(),
        });
        assert!(matches!(result, Err(ShardError::UnknownObject(_))));
    }

    #[test]
    fn test_missing_identity_changes_nothing() {
        let mirror = IncomingChangeProcessor::new(registry());
        let present = ObjectIdentifier::new(uuid::Uuid::new_v4(), 1);
        let missing = ObjectIdentifier::new(uuid::Uuid::new_v4(), 2);
        let mut lookup = IdentityLookup::new();
        lookup.insert(
            present,
            WireNode::Object {
                type_name: "Node".to_string(),
                fields: vec![("Left".to_string(), WireValue::Ref(missing))],
            },
        );

        let result = mirror.apply(ChangeMessage::ItemAdded {
            item: WireValue::Ref(present),
            identity_lookup: lookup,
        });
        assert!(matches!(result, Err(ShardError::MissingIdentity(id)) if id == missing));
        assert_eq!(mirror.known_count(), 0);
    }

    #[test]
    fn test_rejected_item_leaves_no_partial_graph() {
        let mirror = IncomingChangeProcessor::new(registry());
        let root = ObjectIdentifier::new(uuid::Uuid::new_v4(), 1);
        let leaf = ObjectIdentifier::new(uuid::Uuid::new_v4(), 2);
        let mut lookup = IdentityLookup::new();
        lookup.insert(
            root,
            WireNode::Object {
                type_name: "Node".to_string(),
                fields: vec![
                    ("Left".to_string(), WireValue::Ref(leaf)),
                    ("Bogus".to_string(), WireValue::Int(1)),
                ],
            },
        );
        lookup.insert(
            leaf,
            WireNode::Object {
                type_name: "Node".to_string(),
                fields: vec![("Value".to_string(), WireValue::Text("Ada".into()))],
            },
        );

        let result = mirror.apply(ChangeMessage::ItemAdded {
            item: WireValue::Ref(root),
            identity_lookup: lookup,
        });
        assert!(matches!(result, Err(ShardError::UnknownProperty { .. })));
        assert_eq!(mirror.known_count(), 0);
        assert!(mirror.items().is_empty());
        assert!(!mirror.is_known_object(root));
        assert_eq!(mirror.ref_count(leaf), 0);
    }

    #[test]
    fn test_wrong_kind_is_rejected_up_front() {
        let mirror = IncomingChangeProcessor::new(registry());
        let root = ObjectIdentifier::new(uuid::Uuid::new_v4(), 1);
        let list = ObjectIdentifier::new(uuid::Uuid::new_v4(), 2);
        let mut lookup = IdentityLookup::new();
        lookup.insert(
            root,
            WireNode::Object {
                type_name: "Node".to_string(),
                fields: vec![
                    ("Children".to_string(), WireValue::Ref(list)),
                    ("Left".to_string(), WireValue::Ref(list)),
                ],
            },
        );
        lookup.insert(list, WireNode::List { items: Vec::new() });

        let result = mirror.apply(ChangeMessage::ItemAdded {
            item: WireValue::Ref(root),
            identity_lookup: lookup,
        });
        assert!(matches!(result, Err(ShardError::InvalidChange(_))));
        assert_eq!(mirror.known_count(), 0);
    }

    #[test]
    fn test_long_chain_mirrors() {
        let registry = registry();
        let node = registry.get("Node").unwrap();
        let source = OutgoingChangeProcessor::new();
        let mirror = IncomingChangeProcessor::new(registry);
        let mut rx = source.subscribe();

        let head = ObservableObject::new(node.clone());
        let mut tail = head.clone();
        for _ in 0..MAX_DEPTH * 3 {
            let next = ObservableObject::new(node.clone());
            tail.set("Left", next.clone()).unwrap();
            tail = next;
        }
        source.add_item(head.clone()).unwrap();
        relay(&mut rx, &mirror);
        assert_eq!(mirror.known_count(), MAX_DEPTH * 3 + 1);

        tail.set("Value", 5).unwrap();
        relay(&mut rx, &mirror);
        let mirrored_tail = mirror.get_object(tail.identifier()).unwrap();
        assert_eq!(mirrored_tail.get("Value"), Some(Value::Int(5)));

        source.remove_item(&Value::Object(head)).unwrap();
        relay(&mut rx, &mirror);
        assert_eq!(mirror.known_count(), 0);
    }

    #[tokio::test]
    async fn test_sink_rejects_bad_batch() {
        let mirror = IncomingChangeProcessor::new(registry());
        let bad = ChangeMessage::ItemRemoved {
            item: WireValue::Int(9),
        };
        assert!(mirror.on_items(vec![bad]).await.is_err());
    }
}
