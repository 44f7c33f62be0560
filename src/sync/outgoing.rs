//! Outgoing change processor
//!
//! Owns the sending endpoint's known-object table. Root elements enter
//! through `add_item`; from then on every notifying object and list
//! reachable through tracked slots is hooked, and each local mutation is
//! turned into a `ChangeMessage` for every subscriber.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use super::identity::ObjectIdentifier;
use super::known::KnownObjectTable;
use super::message::{encode_inline, encode_reference, encode_slot, ChangeMessage, IdentityLookup};
use super::model::{
    CollectionAction, CollectionEvent, CollectionListener, ListenerId, ObservableList,
    ObservableObject, PropertyListener, Value,
};
use super::registry::PropertyKind;
use crate::error::ShardResult;

#[derive(Default)]
struct OutgoingState {
    table: KnownObjectTable,
    hooks: HashMap<ObjectIdentifier, (Value, ListenerId)>,
    roots: Vec<Value>,
}

struct Inner {
    hook: Arc<ChangeHook>,
    state: Mutex<OutgoingState>,
    subscribers: Mutex<Vec<UnboundedSender<ChangeMessage>>>,
}

/// Listener installed on every tracked object and list
struct ChangeHook {
    inner: Weak<Inner>,
}

impl PropertyListener for ChangeHook {
    fn property_changed(
        &self,
        source: &Arc<ObservableObject>,
        property: &str,
        old: &Value,
        new: &Value,
    ) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_property_changed(source, property, old, new);
        }
    }
}

impl CollectionListener for ChangeHook {
    fn collection_changed(&self, source: &Arc<ObservableList>, event: &CollectionEvent) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_collection_changed(source, event);
        }
    }
}

fn hook_into<'a>(
    hook: &Arc<ChangeHook>,
    hooks: &'a mut HashMap<ObjectIdentifier, (Value, ListenerId)>,
) -> impl FnMut(ObjectIdentifier, &Value) + 'a {
    let hook = hook.clone();
    move |id, value| {
        let listener = match value {
            Value::Object(object) => object.subscribe(hook.clone()),
            Value::List(list) => list.subscribe(hook.clone()),
            _ => return,
        };
        hooks.insert(id, (value.clone(), listener));
    }
}

fn unhook_from(
    hooks: &mut HashMap<ObjectIdentifier, (Value, ListenerId)>,
) -> impl FnMut(ObjectIdentifier, &Value) + '_ {
    move |id, _| {
        if let Some((value, listener)) = hooks.remove(&id) {
            unhook(&value, listener);
        }
    }
}

fn unhook(value: &Value, listener: ListenerId) {
    match value {
        Value::Object(object) => {
            object.unsubscribe(listener);
        }
        Value::List(list) => {
            list.unsubscribe(listener);
        }
        _ => {}
    }
}

impl Inner {
    fn emit(&self, message: ChangeMessage) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(message.clone()).is_ok());
    }

    fn track(&self, state: &mut OutgoingState, value: &Value) {
        let OutgoingState { table, hooks, .. } = state;
        table.track(value, &mut hook_into(&self.hook, hooks));
    }

    fn untrack(&self, state: &mut OutgoingState, value: &Value) {
        let OutgoingState { table, hooks, .. } = state;
        table.untrack(value, &mut unhook_from(hooks));
    }

    fn on_property_changed(
        &self,
        source: &Arc<ObservableObject>,
        property: &str,
        old: &Value,
        new: &Value,
    ) {
        let identifier = source.identifier();
        let mut state = self.state.lock();
        if !state.table.is_known(identifier) {
            debug!("Ignoring change on untracked object {}", identifier);
            return;
        }

        let tracked = matches!(
            source.descriptor().property(property).map(|p| p.kind),
            Some(PropertyKind::Object | PropertyKind::Collection)
        );
        let mut identity_lookup = IdentityLookup::new();
        let encoded = if tracked {
            encode_slot(new, &mut identity_lookup)
        } else {
            encode_inline(new)
        };
        let value = match encoded {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "Dropped change of {}.{} on {}: {}",
                    source.type_name(),
                    property,
                    identifier,
                    e
                );
                return;
            }
        };

        // The table only follows changes the receiver will see
        if tracked {
            self.track(&mut state, new);
            self.untrack(&mut state, old);
        }
        self.emit(ChangeMessage::PropertyChanged {
            identifier,
            property_name: property.to_string(),
            value,
            identity_lookup,
        });
    }

    fn on_collection_changed(&self, source: &Arc<ObservableList>, event: &CollectionEvent) {
        let identifier = source.identifier();
        let mut state = self.state.lock();
        if !state.table.is_known(identifier) {
            debug!("Ignoring change on untracked list {}", identifier);
            return;
        }

        let mut identity_lookup = IdentityLookup::new();
        let encoded: ShardResult<Vec<_>> = match event.action {
            CollectionAction::Add => event
                .items
                .iter()
                .map(|item| encode_slot(item, &mut identity_lookup))
                .collect(),
            CollectionAction::Remove | CollectionAction::Reset => {
                event.items.iter().map(encode_reference).collect()
            }
        };
        let items = match encoded {
            Ok(items) => items,
            Err(e) => {
                warn!("Dropped {:?} on list {}: {}", event.action, identifier, e);
                return;
            }
        };

        for item in &event.items {
            match event.action {
                CollectionAction::Add => self.track(&mut state, item),
                CollectionAction::Remove | CollectionAction::Reset => {
                    self.untrack(&mut state, item)
                }
            }
        }
        self.emit(ChangeMessage::CollectionChanged {
            identifier,
            action: event.action,
            index: event.index,
            items,
            identity_lookup,
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, (value, listener)) in self.state.get_mut().hooks.drain() {
            unhook(&value, listener);
        }
    }
}

/// Turns local mutations of tracked object graphs into change messages
pub struct OutgoingChangeProcessor {
    inner: Arc<Inner>,
}

impl Default for OutgoingChangeProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl OutgoingChangeProcessor {
    pub fn new() -> Self {
        let inner = Arc::new_cyclic(|weak| Inner {
            hook: Arc::new(ChangeHook {
                inner: weak.clone(),
            }),
            state: Mutex::new(OutgoingState::default()),
            subscribers: Mutex::new(Vec::new()),
        });
        Self { inner }
    }

    /// Receive every change message emitted from now on
    pub fn subscribe(&self) -> UnboundedReceiver<ChangeMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Add a root element and start tracking everything reachable from it
    pub fn add_item(&self, item: impl Into<Value>) -> ShardResult<()> {
        let item = item.into();
        let mut identity_lookup = IdentityLookup::new();
        let mut state = self.inner.state.lock();
        let encoded = encode_slot(&item, &mut identity_lookup)?;
        self.inner.track(&mut state, &item);
        state.roots.push(item);
        debug!(
            "Added root element with {} tracked objects",
            identity_lookup.len()
        );
        self.inner.emit(ChangeMessage::ItemAdded {
            item: encoded,
            identity_lookup,
        });
        Ok(())
    }

    /// Remove one occurrence of a root element; false if it is not a root
    pub fn remove_item(&self, item: &Value) -> ShardResult<bool> {
        let mut state = self.inner.state.lock();
        let Some(position) = state.roots.iter().position(|root| root == item) else {
            return Ok(false);
        };
        let encoded = encode_reference(item)?;
        let root = state.roots.remove(position);
        self.inner.untrack(&mut state, &root);
        self.inner.emit(ChangeMessage::ItemRemoved { item: encoded });
        Ok(true)
    }

    pub fn items(&self) -> Vec<Value> {
        self.inner.state.lock().roots.clone()
    }

    pub fn is_known_object(&self, id: ObjectIdentifier) -> bool {
        self.inner.state.lock().table.is_known(id)
    }

    pub fn ref_count(&self, id: ObjectIdentifier) -> usize {
        self.inner.state.lock().table.ref_count(id)
    }

    pub fn known_count(&self) -> usize {
        self.inner.state.lock().table.len()
    }
}
