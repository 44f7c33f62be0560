//! Change messages and their wire values
//!
//! Trackable values in tracked slots (roots, object and collection
//! properties of notifying types, list items) travel as `WireValue::Ref`
//! with their structure in the message's `IdentityLookup`. Everything else
//! is copied inline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::identity::ObjectIdentifier;
use super::model::{CollectionAction, ObservableObject, Value};
use super::registry::PropertyKind;
use crate::error::{ShardError, ShardResult};

/// Deepest inline nesting accepted in either direction
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// A tracked object or list, resolved by identity
    Ref(ObjectIdentifier),
    /// An untracked object copied inline
    Record {
        type_name: String,
        fields: Vec<(String, WireValue)>,
    },
    /// An untracked list copied inline
    Items(Vec<WireValue>),
}

/// Structure of one tracked object or list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireNode {
    Object {
        type_name: String,
        fields: Vec<(String, WireValue)>,
    },
    List {
        items: Vec<WireValue>,
    },
}

pub type IdentityLookup = BTreeMap<ObjectIdentifier, WireNode>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeMessage {
    /// A root element joined the synchronized collection
    ItemAdded {
        item: WireValue,
        identity_lookup: IdentityLookup,
    },
    /// A root element left the synchronized collection
    ItemRemoved { item: WireValue },
    PropertyChanged {
        identifier: ObjectIdentifier,
        property_name: String,
        value: WireValue,
        identity_lookup: IdentityLookup,
    },
    CollectionChanged {
        identifier: ObjectIdentifier,
        action: CollectionAction,
        index: Option<usize>,
        items: Vec<WireValue>,
        identity_lookup: IdentityLookup,
    },
}

impl ChangeMessage {
    /// Object or list the message patches, if any
    pub fn target(&self) -> Option<ObjectIdentifier> {
        match self {
            ChangeMessage::PropertyChanged { identifier, .. }
            | ChangeMessage::CollectionChanged { identifier, .. } => Some(*identifier),
            _ => None,
        }
    }
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

fn scalar(value: &Value) -> Option<WireValue> {
    match value {
        Value::Null => Some(WireValue::Null),
        Value::Bool(b) => Some(WireValue::Bool(*b)),
        Value::Int(i) => Some(WireValue::Int(*i)),
        Value::Float(x) => Some(WireValue::Float(*x)),
        Value::Text(s) => Some(WireValue::Text(s.clone())),
        Value::Object(_) | Value::List(_) => None,
    }
}

/// Encode a value sitting in a tracked slot
///
/// Tracked objects and lists reachable from `value` are flattened into
/// `lookup` with a worklist, so only inline copies count towards
/// `MAX_DEPTH`.
pub fn encode_slot(value: &Value, lookup: &mut IdentityLookup) -> ShardResult<WireValue> {
    let mut pending = Vec::new();
    let wire = encode_element(value, lookup, &mut pending)?;
    while let Some((id, current)) = pending.pop() {
        let node = match &current {
            Value::Object(object) => WireNode::Object {
                type_name: object.type_name().to_string(),
                fields: encode_fields(object, lookup, &mut pending)?,
            },
            Value::List(list) => WireNode::List {
                items: list
                    .items()
                    .iter()
                    .map(|item| encode_element(item, lookup, &mut pending))
                    .collect::<ShardResult<Vec<_>>>()?,
            },
            _ => continue,
        };
        lookup.insert(id, node);
    }
    Ok(wire)
}

/// Encode a value sitting in a plain slot
pub fn encode_inline(value: &Value) -> ShardResult<WireValue> {
    encode_inline_at(value, 0)
}

/// Identity only, for values the receiver already holds
pub fn encode_reference(value: &Value) -> ShardResult<WireValue> {
    match value.identifier() {
        Some(id) => Ok(WireValue::Ref(id)),
        None => encode_inline(value),
    }
}

/// A reference for trackable values, queued the first time they are seen
fn encode_element(
    value: &Value,
    lookup: &mut IdentityLookup,
    pending: &mut Vec<(ObjectIdentifier, Value)>,
) -> ShardResult<WireValue> {
    let Some(id) = value.identifier() else {
        return encode_inline_at(value, 0);
    };
    if !lookup.contains_key(&id) {
        // Placeholder until the worklist reaches it; cycles end here
        lookup.insert(id, WireNode::List { items: Vec::new() });
        pending.push((id, value.clone()));
    }
    Ok(WireValue::Ref(id))
}

fn encode_fields(
    object: &ObservableObject,
    lookup: &mut IdentityLookup,
    pending: &mut Vec<(ObjectIdentifier, Value)>,
) -> ShardResult<Vec<(String, WireValue)>> {
    let descriptor = object.descriptor().clone();
    object
        .fields()
        .into_iter()
        .map(|(name, value)| {
            let tracked = matches!(
                descriptor.property(&name).map(|p| p.kind),
                Some(PropertyKind::Object | PropertyKind::Collection)
            );
            let wire = if tracked {
                encode_element(&value, lookup, pending)?
            } else {
                encode_inline_at(&value, 0)?
            };
            Ok((name, wire))
        })
        .collect()
}

fn encode_inline_at(value: &Value, depth: usize) -> ShardResult<WireValue> {
    too_deep(depth)?;
    if let Some(wire) = scalar(value) {
        return Ok(wire);
    }
    match value {
        Value::Object(object) => Ok(WireValue::Record {
            type_name: object.type_name().to_string(),
            fields: object
                .fields()
                .into_iter()
                .map(|(name, v)| Ok((name, encode_inline_at(&v, depth + 1)?)))
                .collect::<ShardResult<Vec<_>>>()?,
        }),
        Value::List(list) => Ok(WireValue::Items(
            list.items()
                .iter()
                .map(|v| encode_inline_at(v, depth + 1))
                .collect::<ShardResult<Vec<_>>>()?,
        )),
        _ => Err(ShardError::Internal(format!("unencodable value {:?}", value))),
    }
}

/// Whether a local value is the one a wire value describes
///
/// Tracked values match by identity, scalars by equality and inline
/// records structurally.
pub fn matches_wire(value: &Value, wire: &WireValue) -> bool {
    match (value, wire) {
        (_, WireValue::Ref(id)) => value.identifier() == Some(*id),
        (Value::Object(object), WireValue::Record { type_name, fields }) => {
            !object.descriptor().supports_property_change()
                && object.type_name() == type_name
                && object.fields().len() == fields.len()
                && object
                    .fields()
                    .iter()
                    .zip(fields)
                    .all(|((n, v), (wn, wv))| n == wn && matches_wire(v, wv))
        }
        (Value::List(list), WireValue::Items(items)) => {
            let local = list.items();
            local.len() == items.len() && local.iter().zip(items).all(|(v, w)| matches_wire(v, w))
        }
        _ => scalar(value).as_ref() == Some(wire),
    }
}
