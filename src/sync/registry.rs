//! Type registry
//!
//! Replaces runtime reflection: each observable type is registered once with
//! its properties and their kinds, and the change processors query the
//! registry instead of inspecting instances.

use dashmap::DashMap;
use std::sync::Arc;

use super::model::ObservableObject;
use crate::error::{ShardError, ShardResult};

/// How a property participates in change propagation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    /// Plain data, copied inline
    Value,
    /// Holds an observable object that is tracked by identity
    Object,
    /// Holds an observable list that is tracked by identity
    Collection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub kind: PropertyKind,
}

/// Capabilities of one observable type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    name: String,
    notifies: bool,
    properties: Vec<PropertyDescriptor>,
}

impl TypeDescriptor {
    /// A type whose instances raise property-changed notifications
    pub fn notifying(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            notifies: true,
            properties: Vec::new(),
        }
    }

    /// A type whose instances are plain records
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            notifies: false,
            properties: Vec::new(),
        }
    }

    fn with(mut self, name: impl Into<String>, kind: PropertyKind) -> Self {
        self.properties.push(PropertyDescriptor {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn value(self, name: impl Into<String>) -> Self {
        self.with(name, PropertyKind::Value)
    }

    pub fn object(self, name: impl Into<String>) -> Self {
        self.with(name, PropertyKind::Object)
    }

    pub fn collection(self, name: impl Into<String>) -> Self {
        self.with(name, PropertyKind::Collection)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn supports_property_change(&self) -> bool {
        self.notifies
    }

    pub fn properties(&self) -> &[PropertyDescriptor] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Properties holding observable objects
    pub fn notifying_properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties
            .iter()
            .filter(|p| p.kind == PropertyKind::Object)
    }

    /// Properties holding observable lists
    pub fn notifying_collections(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties
            .iter()
            .filter(|p| p.kind == PropertyKind::Collection)
    }
}

/// Registered types, shared by both ends of a change stream
#[derive(Default)]
pub struct TypeRegistry {
    types: DashMap<String, Arc<TypeDescriptor>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: TypeDescriptor) -> Arc<TypeDescriptor> {
        let descriptor = Arc::new(descriptor);
        tracing::debug!("Registered type {}", descriptor.name());
        self.types
            .insert(descriptor.name().to_string(), descriptor.clone());
        descriptor
    }

    pub fn get(&self, name: &str) -> ShardResult<Arc<TypeDescriptor>> {
        self.types
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ShardError::UnknownType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// A fresh, empty instance of a registered type
    pub fn create(&self, name: &str) -> ShardResult<Arc<ObservableObject>> {
        Ok(ObservableObject::new(self.get(name)?))
    }
}
