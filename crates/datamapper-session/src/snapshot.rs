//! Snapshot Store: last-known-persisted state per managed entity.
//!
//! A snapshot is captured when an entity is hydrated and replaced wholesale
//! after each successful flush that touched it. Snapshots are never mutated
//! in place; a new `Arc<Snapshot>` takes the old one's slot.

use datamapper_core::{EntityRef, Value};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Immutable baseline for change detection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Normalized scalar values by field name
    pub scalars: BTreeMap<String, Value>,
    /// Foreign-key tuple per owning relation; `None` is a NULL reference
    pub references: BTreeMap<String, Option<Vec<Value>>>,
    /// Membership of collections that were loaded when the snapshot was taken
    pub collections: BTreeMap<String, Vec<EntityRef>>,
    /// Microseconds since the Unix epoch
    pub taken_at: u64,
}

impl Snapshot {
    pub fn new(
        scalars: BTreeMap<String, Value>,
        references: BTreeMap<String, Option<Vec<Value>>>,
        collections: BTreeMap<String, Vec<EntityRef>>,
    ) -> Self {
        let taken_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX));
        Self {
            scalars,
            references,
            collections,
            taken_at,
        }
    }

    pub fn scalar(&self, field: &str) -> Option<&Value> {
        self.scalars.get(field)
    }

    /// Foreign-key tuple of `relation`; outer `None` when never captured.
    pub fn reference(&self, relation: &str) -> Option<Option<&[Value]>> {
        self.references.get(relation).map(Option::as_deref)
    }

    pub fn collection(&self, relation: &str) -> Option<&[EntityRef]> {
        self.collections.get(relation).map(Vec::as_slice)
    }

    /// Copy with one collection's baseline membership replaced.
    #[must_use]
    pub fn with_collection(&self, relation: &str, members: Vec<EntityRef>) -> Self {
        let mut next = self.clone();
        next.collections.insert(relation.to_string(), members);
        next
    }
}

/// Snapshots keyed by session entity.
#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
    entries: HashMap<EntityRef, Arc<Snapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the first snapshot of `entity`.
    pub fn capture(&mut self, entity: EntityRef, snapshot: Snapshot) {
        self.entries.insert(entity, Arc::new(snapshot));
    }

    /// Swap in a new baseline, returning the previous one.
    pub fn replace(&mut self, entity: EntityRef, snapshot: Snapshot) -> Option<Arc<Snapshot>> {
        self.entries.insert(entity, Arc::new(snapshot))
    }

    pub(crate) fn map_refs(&mut self, f: impl Fn(EntityRef) -> EntityRef) {
        self.entries = std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(r, snapshot)| {
                let mut snapshot = Arc::unwrap_or_clone(snapshot);
                for members in snapshot.collections.values_mut() {
                    for m in members.iter_mut() {
                        *m = f(*m);
                    }
                }
                (f(r), Arc::new(snapshot))
            })
            .collect();
    }

    pub fn get(&self, entity: EntityRef) -> Option<&Arc<Snapshot>> {
        self.entries.get(&entity)
    }

    pub fn forget(&mut self, entity: EntityRef) -> Option<Arc<Snapshot>> {
        self.entries.remove(&entity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(title: &str) -> Snapshot {
        let mut scalars = BTreeMap::new();
        scalars.insert("title".to_string(), Value::from(title));
        let mut references = BTreeMap::new();
        references.insert("author".to_string(), Some(vec![Value::BigInt(7)]));
        references.insert("editor".to_string(), None);
        Snapshot::new(scalars, references, BTreeMap::new())
    }

    #[test]
    fn test_snapshot_accessors() {
        let s = snap("Dune");
        assert_eq!(s.scalar("title"), Some(&Value::from("Dune")));
        assert_eq!(s.reference("author"), Some(Some(&[Value::BigInt(7)][..])));
        assert_eq!(s.reference("editor"), Some(None));
        assert_eq!(s.reference("missing"), None);
        assert!(s.taken_at > 0);
    }

    #[test]
    fn test_replace_keeps_old_snapshot_alive() {
        let mut store = SnapshotStore::new();
        let e = EntityRef::new(1, 0);
        store.capture(e, snap("old"));
        let held = Arc::clone(store.get(e).unwrap());

        let previous = store.replace(e, snap("new")).unwrap();
        assert!(Arc::ptr_eq(&held, &previous));
        assert_eq!(held.scalar("title"), Some(&Value::from("old")));
        assert_eq!(store.get(e).unwrap().scalar("title"), Some(&Value::from("new")));
    }

    #[test]
    fn test_with_collection_copies() {
        let s = snap("x");
        let e = EntityRef::new(1, 3);
        let next = s.with_collection("tags", vec![e]);
        assert!(s.collection("tags").is_none());
        assert_eq!(next.collection("tags"), Some(&[e][..]));
    }
}
