//! Observable object model
//!
//! `ObservableObject` and `ObservableList` raise notifications when mutated.
//! The outgoing change processor hooks those notifications; the incoming
//! processor applies remote changes through the quiet setters so a mirror
//! never echoes a change back.
//!
//! Notifying mutations of one object or list are serialized: listeners see
//! events in the order the values were stored, even with several writers.
//! A listener may mutate the same instance again from its callback.

use once_cell::sync::OnceCell;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::identity::{ObjectIdentifier, ObjectIdentityGenerator};
use super::registry::{PropertyKind, TypeDescriptor};
use crate::error::{ShardError, ShardResult};

pub type ListenerId = u64;

/// Value held by a property or list slot
#[derive(Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Object(Arc<ObservableObject>),
    List(Arc<ObservableList>),
}

impl Value {
    pub fn as_object(&self) -> Option<&Arc<ObservableObject>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Arc<ObservableList>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether the value is tracked by identity when it sits in a tracked slot
    pub fn is_trackable(&self) -> bool {
        match self {
            Value::Object(o) => o.descriptor().supports_property_change(),
            Value::List(_) => true,
            _ => false,
        }
    }

    /// Identifier of a trackable value, assigning one if needed
    pub fn identifier(&self) -> Option<ObjectIdentifier> {
        match self {
            Value::Object(o) if o.descriptor().supports_property_change() => Some(o.identifier()),
            Value::List(l) => Some(l.identifier()),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::Text(s) => write!(f, "Text({:?})", s),
            Value::Object(o) => write!(f, "Object({})", o.type_name()),
            Value::List(l) => write!(f, "List(len={})", l.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Arc<ObservableObject>> for Value {
    fn from(v: Arc<ObservableObject>) -> Self {
        Value::Object(v)
    }
}

impl From<Arc<ObservableList>> for Value {
    fn from(v: Arc<ObservableList>) -> Self {
        Value::List(v)
    }
}

/// Kind of collection mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionAction {
    Add,
    Remove,
    Reset,
}

/// A collection mutation as seen by listeners
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionEvent {
    pub action: CollectionAction,
    /// Position of the first affected item; `None` for Reset
    pub index: Option<usize>,
    /// Added items for Add, removed items for Remove and Reset
    pub items: Vec<Value>,
}

pub trait PropertyListener: Send + Sync {
    fn property_changed(
        &self,
        source: &Arc<ObservableObject>,
        property: &str,
        old: &Value,
        new: &Value,
    );
}

pub trait CollectionListener: Send + Sync {
    fn collection_changed(&self, source: &Arc<ObservableList>, event: &CollectionEvent);
}

struct Listeners<L: ?Sized> {
    next: AtomicU64,
    entries: RwLock<Vec<(ListenerId, Arc<L>)>>,
    writes: ReentrantMutex<()>,
}

impl<L: ?Sized> Listeners<L> {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
            writes: ReentrantMutex::new(()),
        }
    }

    /// Held from storing a value until its listeners have been told
    fn ordered(&self) -> ReentrantMutexGuard<'_, ()> {
        self.writes.lock()
    }

    fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push((id, listener));
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries.read().iter().map(|(_, l)| l.clone()).collect()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// An object with named properties that notifies on change
pub struct ObservableObject {
    descriptor: Arc<TypeDescriptor>,
    identity: OnceCell<ObjectIdentifier>,
    fields: RwLock<BTreeMap<String, Value>>,
    listeners: Listeners<dyn PropertyListener>,
}

impl ObservableObject {
    pub fn new(descriptor: Arc<TypeDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            identity: OnceCell::new(),
            fields: RwLock::new(BTreeMap::new()),
            listeners: Listeners::new(),
        })
    }

    /// A mirror of a remote object that keeps the remote identifier
    pub(crate) fn with_identity(
        descriptor: Arc<TypeDescriptor>,
        identifier: ObjectIdentifier,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            identity: OnceCell::with_value(identifier),
            fields: RwLock::new(BTreeMap::new()),
            listeners: Listeners::new(),
        })
    }

    /// Build an instance with initial field values, without notifying
    pub fn build<N, V>(
        descriptor: Arc<TypeDescriptor>,
        fields: impl IntoIterator<Item = (N, V)>,
    ) -> ShardResult<Arc<Self>>
    where
        N: Into<String>,
        V: Into<Value>,
    {
        let object = Self::new(descriptor);
        for (name, value) in fields {
            let name: String = name.into();
            object.set_quiet(&name, value.into())?;
        }
        Ok(object)
    }

    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    pub fn type_name(&self) -> &str {
        self.descriptor.name()
    }

    /// This object's identifier, assigned from the global generator on first use
    pub fn identifier(&self) -> ObjectIdentifier {
        ObjectIdentityGenerator::global().identify(&self.identity)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.fields.read().get(name).cloned()
    }

    /// Current field values in property-name order
    pub fn fields(&self) -> Vec<(String, Value)> {
        self.fields
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn validate(&self, name: &str, value: &Value) -> ShardResult<()> {
        let property =
            self.descriptor
                .property(name)
                .ok_or_else(|| ShardError::UnknownProperty {
                    type_name: self.type_name().to_string(),
                    property: name.to_string(),
                })?;
        let fits = match property.kind {
            PropertyKind::Value => !matches!(value, Value::List(_)),
            PropertyKind::Object => matches!(value, Value::Object(_) | Value::Null),
            PropertyKind::Collection => matches!(value, Value::List(_) | Value::Null),
        };
        if !fits {
            return Err(ShardError::InvalidChange(format!(
                "{}.{} cannot hold {:?}",
                self.type_name(),
                name,
                value
            )));
        }
        Ok(())
    }

    /// Replace a property value without notifying; returns the old value
    pub(crate) fn set_quiet(&self, name: &str, value: Value) -> ShardResult<Value> {
        self.validate(name, &value)?;
        Ok(self
            .fields
            .write()
            .insert(name.to_string(), value)
            .unwrap_or(Value::Null))
    }

    /// Replace a property value and notify listeners if it changed
    pub fn set(self: &Arc<Self>, name: &str, value: impl Into<Value>) -> ShardResult<Value> {
        let new = value.into();
        let _ordered = self.listeners.ordered();
        let old = self.set_quiet(name, new.clone())?;
        if old != new {
            for listener in self.listeners.snapshot() {
                listener.property_changed(self, name, &old, &new);
            }
        }
        Ok(old)
    }

    pub fn subscribe(&self, listener: Arc<dyn PropertyListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl fmt::Debug for ObservableObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableObject")
            .field("type", &self.type_name())
            .field("identity", &self.identity.get())
            .field("fields", &self.fields())
            .finish()
    }
}

/// A list that notifies on structural change
pub struct ObservableList {
    identity: OnceCell<ObjectIdentifier>,
    items: RwLock<Vec<Value>>,
    listeners: Listeners<dyn CollectionListener>,
}

impl ObservableList {
    pub fn new() -> Arc<Self> {
        Self::from_items(Vec::new())
    }

    pub fn from_items(items: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            identity: OnceCell::new(),
            items: RwLock::new(items),
            listeners: Listeners::new(),
        })
    }

    pub(crate) fn with_identity(identifier: ObjectIdentifier) -> Arc<Self> {
        Arc::new(Self {
            identity: OnceCell::with_value(identifier),
            items: RwLock::new(Vec::new()),
            listeners: Listeners::new(),
        })
    }

    pub fn identifier(&self) -> ObjectIdentifier {
        ObjectIdentityGenerator::global().identify(&self.identity)
    }

    pub fn items(&self) -> Vec<Value> {
        self.items.read().clone()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.items.read().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    fn notify(self: &Arc<Self>, event: CollectionEvent) {
        for listener in self.listeners.snapshot() {
            listener.collection_changed(self, &event);
        }
    }

    pub fn push(self: &Arc<Self>, value: impl Into<Value>) {
        let value = value.into();
        let _ordered = self.listeners.ordered();
        let index = {
            let mut items = self.items.write();
            items.push(value.clone());
            items.len() - 1
        };
        self.notify(CollectionEvent {
            action: CollectionAction::Add,
            index: Some(index),
            items: vec![value],
        });
    }

    pub fn insert(self: &Arc<Self>, index: usize, value: impl Into<Value>) -> ShardResult<()> {
        let value = value.into();
        let _ordered = self.listeners.ordered();
        self.insert_quiet(Some(index), vec![value.clone()])?;
        self.notify(CollectionEvent {
            action: CollectionAction::Add,
            index: Some(index),
            items: vec![value],
        });
        Ok(())
    }

    pub fn remove_at(self: &Arc<Self>, index: usize) -> ShardResult<Value> {
        let _ordered = self.listeners.ordered();
        let removed = self.remove_quiet_at(index)?;
        self.notify(CollectionEvent {
            action: CollectionAction::Remove,
            index: Some(index),
            items: vec![removed.clone()],
        });
        Ok(removed)
    }

    /// Remove the first item equal to `value`
    pub fn remove(self: &Arc<Self>, value: &Value) -> bool {
        let _ordered = self.listeners.ordered();
        let position = self.items.read().iter().position(|v| v == value);
        match position {
            Some(index) => self.remove_at(index).is_ok(),
            None => false,
        }
    }

    pub fn clear(self: &Arc<Self>) {
        let _ordered = self.listeners.ordered();
        let removed = self.clear_quiet();
        self.notify(CollectionEvent {
            action: CollectionAction::Reset,
            index: None,
            items: removed,
        });
    }

    /// Insert at `index`, or append when `None`
    pub(crate) fn insert_quiet(&self, index: Option<usize>, values: Vec<Value>) -> ShardResult<()> {
        let mut items = self.items.write();
        let index = index.unwrap_or(items.len());
        if index > items.len() {
            return Err(ShardError::InvalidChange(format!(
                "insert at {} into list of {}",
                index,
                items.len()
            )));
        }
        items.splice(index..index, values);
        Ok(())
    }

    pub(crate) fn remove_quiet_at(&self, index: usize) -> ShardResult<Value> {
        let mut items = self.items.write();
        if index >= items.len() {
            return Err(ShardError::InvalidChange(format!(
                "remove at {} from list of {}",
                index,
                items.len()
            )));
        }
        Ok(items.remove(index))
    }

    pub(crate) fn clear_quiet(&self) -> Vec<Value> {
        std::mem::take(&mut *self.items.write())
    }

    pub fn subscribe(&self, listener: Arc<dyn CollectionListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl fmt::Debug for ObservableList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableList")
            .field("identity", &self.identity.get())
            .field("items", &self.items())
            .finish()
    }
}
