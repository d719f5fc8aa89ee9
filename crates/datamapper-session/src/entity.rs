//! Dynamic entity representation held in a session arena.
//!
//! Fields are a tagged union of scalar values and relation handles so the
//! change-set computer can match on them exhaustively. Relations never hold
//! pointers: a reference is an [`EntityRef`] into the owning session or an
//! [`IdentityKey`] not yet loaded.

use datamapper_core::{EntityRef, IdentityKey, Value};
use serde::Serialize;
use std::collections::BTreeMap;

/// Lifecycle state of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EntityState {
    /// Created in this session, not yet inserted
    New,
    /// Loaded or flushed; backed by a row
    Managed,
    /// Scheduled for deletion at the next flush
    Removed,
    /// No longer tracked by the session
    Detached,
}

/// Handle to a single related entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Reference {
    Null,
    /// Target known by key only
    Unloaded(IdentityKey),
    /// Target present in the session
    Loaded(EntityRef),
}

impl Reference {
    pub fn is_null(&self) -> bool {
        matches!(self, Reference::Null)
    }

    pub fn loaded(&self) -> Option<EntityRef> {
        match self {
            Reference::Loaded(r) => Some(*r),
            _ => None,
        }
    }
}

/// Load state of a collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CollectionState {
    Unloaded,
    Loading,
    Loaded(Vec<EntityRef>),
}

/// A to-many relation with its own add/remove tracking.
///
/// Deltas are recorded whether or not the members are loaded; loading
/// merges them into the fetched membership.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Collection {
    state: CollectionState,
    added: Vec<EntityRef>,
    removed: Vec<EntityRef>,
}

impl Default for Collection {
    fn default() -> Self {
        Self::unloaded()
    }
}

impl Collection {
    pub fn unloaded() -> Self {
        Self {
            state: CollectionState::Unloaded,
            added: Vec::new(),
            removed: Vec::new(),
        }
    }

    /// An initialized collection with no members.
    pub fn empty() -> Self {
        Self::loaded(Vec::new())
    }

    pub fn loaded(members: Vec<EntityRef>) -> Self {
        Self {
            state: CollectionState::Loaded(members),
            added: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn state(&self) -> &CollectionState {
        &self.state
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, CollectionState::Loaded(_))
    }

    /// Current members, when loaded.
    pub fn members(&self) -> Option<&[EntityRef]> {
        match &self.state {
            CollectionState::Loaded(m) => Some(m),
            _ => None,
        }
    }

    pub fn added(&self) -> &[EntityRef] {
        &self.added
    }

    pub fn removed(&self) -> &[EntityRef] {
        &self.removed
    }

    pub fn is_dirty(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Is `member` known to belong to the collection?
    pub fn contains(&self, member: EntityRef) -> bool {
        match &self.state {
            CollectionState::Loaded(m) => m.contains(&member),
            _ => self.added.contains(&member),
        }
    }

    pub fn add(&mut self, member: EntityRef) {
        if let Some(pos) = self.removed.iter().position(|r| *r == member) {
            self.removed.remove(pos);
        } else if !self.added.contains(&member) {
            self.added.push(member);
        }
        if let CollectionState::Loaded(m) = &mut self.state {
            if !m.contains(&member) {
                m.push(member);
            }
        }
    }

    pub fn remove(&mut self, member: EntityRef) {
        if let Some(pos) = self.added.iter().position(|r| *r == member) {
            self.added.remove(pos);
        } else if !self.removed.contains(&member) {
            self.removed.push(member);
        }
        if let CollectionState::Loaded(m) = &mut self.state {
            m.retain(|r| *r != member);
        }
    }

    pub(crate) fn mark_loading(&mut self) {
        if !self.is_loaded() {
            self.state = CollectionState::Loading;
        }
    }

    /// Install fetched members, applying pending deltas on top.
    pub(crate) fn finish_loading(&mut self, fetched: Vec<EntityRef>) {
        let mut members: Vec<EntityRef> = fetched
            .into_iter()
            .filter(|r| !self.removed.contains(r))
            .collect();
        for r in &self.added {
            if !members.contains(r) {
                members.push(*r);
            }
        }
        self.state = CollectionState::Loaded(members);
    }

    /// Abandon a load that did not complete.
    pub(crate) fn cancel_loading(&mut self) {
        if matches!(self.state, CollectionState::Loading) {
            self.state = CollectionState::Unloaded;
        }
    }

    pub(crate) fn clear_deltas(&mut self) {
        self.added.clear();
        self.removed.clear();
    }

    /// Rewrite every member handle.
    pub(crate) fn map_refs(&mut self, f: impl Fn(EntityRef) -> EntityRef) {
        if let CollectionState::Loaded(m) = &mut self.state {
            for r in m.iter_mut() {
                *r = f(*r);
            }
        }
        for r in self.added.iter_mut().chain(self.removed.iter_mut()) {
            *r = f(*r);
        }
    }

    /// Drop `member` everywhere without recording a delta.
    pub(crate) fn forget(&mut self, member: EntityRef) {
        self.added.retain(|r| *r != member);
        self.removed.retain(|r| *r != member);
        if let CollectionState::Loaded(m) = &mut self.state {
            m.retain(|r| *r != member);
        }
    }
}

/// A field slot of an [`Entity`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FieldValue {
    Scalar(Value),
    Reference(Reference),
    Collection(Collection),
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        FieldValue::Scalar(v)
    }
}

impl From<Reference> for FieldValue {
    fn from(r: Reference) -> Self {
        FieldValue::Reference(r)
    }
}

impl From<Collection> for FieldValue {
    fn from(c: Collection) -> Self {
        FieldValue::Collection(c)
    }
}

/// An entity instance: a type name plus named field slots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    name: String,
    fields: BTreeMap<String, FieldValue>,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Set a scalar field (builder pattern).
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields
            .insert(field.into(), FieldValue::Scalar(value.into()));
        self
    }

    /// Point a reference field at a session entity (builder pattern).
    #[must_use]
    pub fn with_ref(mut self, relation: impl Into<String>, target: EntityRef) -> Self {
        self.fields.insert(
            relation.into(),
            FieldValue::Reference(Reference::Loaded(target)),
        );
        self
    }

    /// Set a reference field to a key that is not loaded (builder pattern).
    #[must_use]
    pub fn with_key(mut self, relation: impl Into<String>, key: IdentityKey) -> Self {
        self.fields.insert(
            relation.into(),
            FieldValue::Reference(Reference::Unloaded(key)),
        );
        self
    }

    /// Set a collection field (builder pattern).
    #[must_use]
    pub fn with_collection(mut self, relation: impl Into<String>, members: Vec<EntityRef>) -> Self {
        let mut collection = Collection::empty();
        for m in members {
            collection.add(m);
        }
        self.fields
            .insert(relation.into(), FieldValue::Collection(collection));
        self
    }

    /// Entity type name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Scalar value of `field`; `None` when absent or not a scalar.
    pub fn scalar(&self, field: &str) -> Option<&Value> {
        match self.fields.get(field) {
            Some(FieldValue::Scalar(v)) => Some(v),
            _ => None,
        }
    }

    pub fn reference(&self, relation: &str) -> Option<&Reference> {
        match self.fields.get(relation) {
            Some(FieldValue::Reference(r)) => Some(r),
            _ => None,
        }
    }

    pub fn collection(&self, relation: &str) -> Option<&Collection> {
        match self.fields.get(relation) {
            Some(FieldValue::Collection(c)) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn collection_mut(&mut self, relation: &str) -> Option<&mut Collection> {
        match self.fields.get_mut(relation) {
            Some(FieldValue::Collection(c)) => Some(c),
            _ => None,
        }
    }

    /// Overwrite a scalar field in place.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields
            .insert(field.into(), FieldValue::Scalar(value.into()));
    }

    pub(crate) fn set_field(&mut self, field: &str, value: FieldValue) {
        self.fields.insert(field.to_string(), value);
    }

    /// Rewrite every entity handle held by reference or collection fields.
    pub(crate) fn map_refs(&mut self, f: impl Fn(EntityRef) -> EntityRef) {
        for value in self.fields.values_mut() {
            match value {
                FieldValue::Reference(Reference::Loaded(r)) => *r = f(*r),
                FieldValue::Collection(c) => c.map_refs(&f),
                FieldValue::Scalar(_) | FieldValue::Reference(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(slot: u32) -> EntityRef {
        EntityRef::new(1, slot)
    }

    #[test]
    fn test_entity_builder() {
        let e = Entity::new("Book")
            .with("title", "Dune")
            .with_ref("author", r(0))
            .with_collection("tags", vec![r(2)]);
        assert_eq!(e.name(), "Book");
        assert_eq!(e.scalar("title"), Some(&Value::Text("Dune".into())));
        assert_eq!(e.reference("author"), Some(&Reference::Loaded(r(0))));
        assert!(e.collection("tags").unwrap().contains(r(2)));
        assert!(e.scalar("author").is_none());
    }

    #[test]
    fn test_collection_deltas_cancel_out() {
        let mut c = Collection::empty();
        c.add(r(1));
        c.remove(r(1));
        assert!(!c.is_dirty());
        assert_eq!(c.members(), Some(&[][..]));

        let mut c = Collection::loaded(vec![r(1)]);
        c.remove(r(1));
        c.add(r(1));
        assert!(!c.is_dirty());
        assert_eq!(c.members(), Some(&[r(1)][..]));
    }

    #[test]
    fn test_unloaded_collection_merges_deltas_on_load() {
        let mut c = Collection::unloaded();
        c.add(r(3));
        c.remove(r(1));
        assert!(c.members().is_none());
        assert!(c.contains(r(3)));

        c.mark_loading();
        assert_eq!(c.state(), &CollectionState::Loading);
        c.finish_loading(vec![r(1), r(2)]);
        assert_eq!(c.members(), Some(&[r(2), r(3)][..]));
        assert_eq!(c.added(), &[r(3)]);
        assert_eq!(c.removed(), &[r(1)]);
    }
}
