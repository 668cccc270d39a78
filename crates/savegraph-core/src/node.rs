//! Input graph nodes.
//!
//! A [`Node`] is a partially populated entity instance. Only properties
//! present in the node are "loaded"; an absent property means "do not
//! touch", which is different from a property explicitly set to NULL.

use crate::value::Value;
use serde::Serialize;
use std::collections::BTreeMap;

/// The loaded state of one property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Slot {
    /// A scalar column value (possibly NULL).
    Scalar(Value),
    /// A to-one association; `None` means "explicitly no target".
    One(Option<Box<Node>>),
    /// A to-many association.
    Many(Vec<Node>),
}

/// An entity instance in an input or echo graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    entity: &'static str,
    slots: BTreeMap<&'static str, Slot>,
}

impl Node {
    /// An empty node of the given entity type.
    pub fn new(entity: &'static str) -> Self {
        Self {
            entity,
            slots: BTreeMap::new(),
        }
    }

    /// An id-only node used to link to an existing row.
    pub fn reference(entity: &'static str, id_prop: &'static str, id: impl Into<Value>) -> Self {
        Self::new(entity).set(id_prop, id)
    }

    /// Load a scalar property.
    #[must_use]
    pub fn set(mut self, prop: &'static str, value: impl Into<Value>) -> Self {
        self.slots.insert(prop, Slot::Scalar(value.into()));
        self
    }

    /// Load a to-one association.
    #[must_use]
    pub fn set_one(mut self, prop: &'static str, target: Option<Node>) -> Self {
        self.slots.insert(prop, Slot::One(target.map(Box::new)));
        self
    }

    /// Load a to-many association.
    #[must_use]
    pub fn set_many(mut self, prop: &'static str, targets: Vec<Node>) -> Self {
        self.slots.insert(prop, Slot::Many(targets));
        self
    }

    /// The entity type this node is tagged with.
    pub fn entity(&self) -> &'static str {
        self.entity
    }

    /// Load or overwrite a scalar property in place.
    pub fn assign(&mut self, prop: &'static str, value: Value) {
        self.slots.insert(prop, Slot::Scalar(value));
    }

    /// Unload a property.
    pub fn unset(&mut self, prop: &str) -> Option<Slot> {
        self.slots.remove(prop)
    }

    /// The slot for a property, if loaded.
    pub fn get(&self, prop: &str) -> Option<&Slot> {
        self.slots.get(prop)
    }

    /// Mutable access to a loaded slot.
    pub fn get_mut(&mut self, prop: &str) -> Option<&mut Slot> {
        self.slots.get_mut(prop)
    }

    /// Whether a property is loaded.
    pub fn is_loaded(&self, prop: &str) -> bool {
        self.slots.contains_key(prop)
    }

    /// The value of a loaded scalar property.
    pub fn scalar(&self, prop: &str) -> Option<&Value> {
        match self.slots.get(prop) {
            Some(Slot::Scalar(value)) => Some(value),
            _ => None,
        }
    }

    /// The non-null value of a scalar property.
    pub fn non_null(&self, prop: &str) -> Option<&Value> {
        self.scalar(prop).filter(|v| !v.is_null())
    }

    /// Loaded properties in name order.
    pub fn slots(&self) -> impl Iterator<Item = (&'static str, &Slot)> {
        self.slots.iter().map(|(name, slot)| (*name, slot))
    }

    /// Whether the only loaded property is a non-null `id_prop`.
    pub fn is_reference(&self, id_prop: &str) -> bool {
        self.slots.len() == 1 && self.non_null(id_prop).is_some()
    }

    /// Child nodes loaded under an association, mutably.
    pub fn children_mut(&mut self, prop: &str) -> Vec<&mut Node> {
        match self.slots.get_mut(prop) {
            Some(Slot::One(Some(child))) => vec![child.as_mut()],
            Some(Slot::Many(children)) => children.iter_mut().collect(),
            _ => Vec::new(),
        }
    }

    /// Child nodes loaded under an association.
    pub fn children(&self, prop: &str) -> Vec<&Node> {
        match self.slots.get(prop) {
            Some(Slot::One(Some(child))) => vec![child.as_ref()],
            Some(Slot::Many(children)) => children.iter().collect(),
            _ => Vec::new(),
        }
    }
}
