//! Known-object bookkeeping
//!
//! Each endpoint keeps a `KnownObjectTable`: identifier to object plus a
//! reference count. The count is the number of structural paths (root
//! membership, object properties, list slots) that currently reach the
//! object. An entry exists iff its count is at least one; reaching zero
//! evicts it and releases everything it references in turn.

use std::collections::HashMap;
use tracing::warn;

use super::identity::ObjectIdentifier;
use super::model::Value;
use super::registry::PropertyKind;

/// Reference counts per identifier
#[derive(Debug, Default)]
pub struct ObjectReferenceCounter {
    counts: HashMap<ObjectIdentifier, usize>,
}

impl ObjectReferenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and return the new count
    pub fn increment(&mut self, id: ObjectIdentifier) -> usize {
        let count = self.counts.entry(id).or_insert(0);
        *count += 1;
        *count
    }

    /// Decrement and return the new count; `None` if the id is not counted
    ///
    /// An id whose count reaches zero is forgotten.
    pub fn decrement(&mut self, id: ObjectIdentifier) -> Option<usize> {
        let count = self.counts.get_mut(&id)?;
        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            self.counts.remove(&id);
        }
        Some(remaining)
    }

    pub fn count(&self, id: ObjectIdentifier) -> usize {
        self.counts.get(&id).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Trackable values directly referenced from a tracked value's tracked slots
pub fn tracked_children(value: &Value) -> Vec<Value> {
    match value {
        Value::Object(object) if object.descriptor().supports_property_change() => {
            let descriptor = object.descriptor().clone();
            descriptor
                .properties()
                .iter()
                .filter(|p| matches!(p.kind, PropertyKind::Object | PropertyKind::Collection))
                .filter_map(|p| object.get(&p.name))
                .filter(Value::is_trackable)
                .collect()
        }
        Value::List(list) => list
            .items()
            .into_iter()
            .filter(Value::is_trackable)
            .collect(),
        _ => Vec::new(),
    }
}

/// Identifier to object table with reference counts
#[derive(Default)]
pub struct KnownObjectTable {
    objects: HashMap<ObjectIdentifier, Value>,
    counter: ObjectReferenceCounter,
}

impl KnownObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ObjectIdentifier) -> Option<Value> {
        self.objects.get(&id).cloned()
    }

    pub fn is_known(&self, id: ObjectIdentifier) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn ref_count(&self, id: ObjectIdentifier) -> usize {
        self.counter.count(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Count one more path to a known object and return it
    pub fn acquire(&mut self, id: ObjectIdentifier) -> Option<Value> {
        let value = self.objects.get(&id)?.clone();
        self.counter.increment(id);
        Some(value)
    }

    /// Add an object reached for the first time, with a count of one
    pub fn register(&mut self, id: ObjectIdentifier, value: Value) {
        if self.counter.increment(id) == 1 {
            self.objects.insert(id, value);
        }
    }

    /// Count a new path to `value` and everything newly reachable from it
    ///
    /// Children are only visited when an object is registered for the first
    /// time; an object that was already known already counts its children.
    pub fn track(&mut self, value: &Value, on_registered: &mut dyn FnMut(ObjectIdentifier, &Value)) {
        let mut pending = vec![value.clone()];
        while let Some(current) = pending.pop() {
            let Some(id) = current.identifier() else {
                continue;
            };
            if self.counter.increment(id) == 1 {
                self.objects.insert(id, current.clone());
                on_registered(id, &current);
                pending.extend(tracked_children(&current));
            }
        }
    }

    /// Release one path to `value`, evicting and cascading at zero
    pub fn untrack(&mut self, value: &Value, on_evicted: &mut dyn FnMut(ObjectIdentifier, &Value)) {
        let mut pending = vec![value.clone()];
        while let Some(current) = pending.pop() {
            let Some(id) = current.identifier() else {
                continue;
            };
            match self.counter.decrement(id) {
                Some(0) => {
                    if let Some(evicted) = self.objects.remove(&id) {
                        on_evicted(id, &evicted);
                        pending.extend(tracked_children(&evicted));
                    }
                }
                Some(_) => {}
                None => warn!("Released object {} that is not known", id),
            }
        }
    }

    /// Drop every entry, reporting each as evicted
    pub fn clear(&mut self, on_evicted: &mut dyn FnMut(ObjectIdentifier, &Value)) {
        for (id, value) in self.objects.drain() {
            on_evicted(id, &value);
        }
        self.counter = ObjectReferenceCounter::new();
    }
}
