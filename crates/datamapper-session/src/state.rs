//! Session arena: tracked entities plus the identity map and snapshots.
//!
//! `UnitState` is cloneable so transaction scopes can checkpoint it and a
//! rolled-back scope can put the session back exactly as it was.

use crate::entity::{Entity, EntityState, FieldValue, Reference};
use crate::identity_map::IdentityMap;
use crate::snapshot::{Snapshot, SnapshotStore};
use datamapper_core::{
    EntityMeta, EntityRef, Error, IdentityKey, RelationMeta, Result, SessionErrorKind, Value,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Bookkeeping for one entity in the arena.
#[derive(Debug, Clone)]
pub(crate) struct Tracked {
    pub entity: Entity,
    pub meta: Arc<EntityMeta>,
    pub state: EntityState,
    /// Identity key once the row exists
    pub key: Option<IdentityKey>,
    /// `persist` was called (or reached by a persist cascade)
    pub scheduled: bool,
    /// Order in which the entity entered the session
    pub seq: u64,
}

/// Resolved value of a foreign key.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ForeignKey {
    Null,
    Known(Vec<Value>),
    /// Target is inserted by the same flush; its key is not known yet
    Pending(EntityRef),
}

/// The arena.
///
/// Handles index `slots` directly, so a slot is never reused or compacted
/// away: detached and deleted entities keep theirs, and every flush walks
/// them. A long-lived session should call `Session::clear` between units
/// of work.
#[derive(Debug, Clone)]
pub(crate) struct UnitState {
    pub generation: u64,
    pub schema: Option<String>,
    pub slots: Vec<Tracked>,
    pub identity: IdentityMap,
    pub snapshots: SnapshotStore,
    pub next_seq: u64,
}

impl UnitState {
    pub fn new(generation: u64, schema: Option<String>) -> Self {
        Self {
            generation,
            schema,
            slots: Vec::new(),
            identity: IdentityMap::new(),
            snapshots: SnapshotStore::new(),
            next_seq: 0,
        }
    }

    /// Copy of the arena with every handle moved to `generation`.
    pub fn rebase(&self, generation: u64) -> Self {
        let remap = |r: EntityRef| EntityRef::new(generation, r.slot());
        let mut next = self.clone();
        next.generation = generation;
        for t in &mut next.slots {
            t.entity.map_refs(remap);
        }
        next.identity.map_refs(remap);
        next.snapshots.map_refs(remap);
        next
    }

    /// Take over what `from` wrote durably for `written`.
    ///
    /// Used on checkpoints of enclosing scopes once an independent
    /// transaction commits, so rolling them back does not resurrect the
    /// old state. Slots created after this copy was taken come along as
    /// detached unless they were written themselves.
    pub fn adopt(&mut self, from: &UnitState, written: &HashSet<EntityRef>) {
        if from.generation != self.generation {
            return;
        }
        let mut refs: Vec<EntityRef> = written.iter().copied().collect();
        refs.sort_by_key(|r| r.slot());
        for r in refs {
            let slot = r.slot() as usize;
            let Some(current) = from.slots.get(slot) else {
                continue;
            };
            while self.slots.len() < slot {
                let Some(filler) = from.slots.get(self.slots.len()) else {
                    break;
                };
                let mut filler = filler.clone();
                filler.state = EntityState::Detached;
                filler.scheduled = false;
                filler.key = None;
                self.slots.push(filler);
            }
            match self.slots.get_mut(slot) {
                Some(previous) => {
                    if let Some(key) = previous.key.take() {
                        if self.identity.lookup(&key) == Some(r) {
                            self.identity.forget(&key);
                        }
                    }
                    *previous = current.clone();
                }
                None => self.slots.push(current.clone()),
            }

            if current.state == EntityState::Detached {
                self.snapshots.forget(r);
                for t in &mut self.slots {
                    for rel in t.meta.relations.iter().filter(|rel| rel.is_collection()) {
                        if let Some(c) = t.entity.collection_mut(&rel.name) {
                            c.forget(r);
                        }
                    }
                }
                continue;
            }
            if let Some(key) = &current.key {
                if let Err(e) = self.identity.register(key.clone(), r) {
                    tracing::warn!(error = %e, entity = %r, "Checkpoint keeps its own identity");
                }
            }
            match from.snapshots.get(r) {
                Some(snapshot) => {
                    self.snapshots.replace(r, Snapshot::clone(snapshot));
                }
                None => {
                    self.snapshots.forget(r);
                }
            }
        }
        self.next_seq = self.next_seq.max(from.next_seq);
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    fn slot_of(&self, r: EntityRef) -> Result<usize> {
        let slot = r.slot() as usize;
        if r.session() != self.generation || slot >= self.slots.len() {
            return Err(Error::session(
                SessionErrorKind::ForeignEntity,
                format!("{r} does not belong to this session"),
            ));
        }
        Ok(slot)
    }

    pub fn tracked(&self, r: EntityRef) -> Result<&Tracked> {
        let slot = self.slot_of(r)?;
        Ok(&self.slots[slot])
    }

    pub fn tracked_mut(&mut self, r: EntityRef) -> Result<&mut Tracked> {
        let slot = self.slot_of(r)?;
        Ok(&mut self.slots[slot])
    }

    pub fn insert(&mut self, entity: Entity, meta: Arc<EntityMeta>, state: EntityState) -> EntityRef {
        let slot = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.push(Tracked {
            entity,
            meta,
            state,
            key: None,
            scheduled: false,
            seq,
        });
        EntityRef::new(self.generation, slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityRef, &Tracked)> {
        let generation = self.generation;
        self.slots
            .iter()
            .enumerate()
            .map(move |(i, t)| (EntityRef::new(generation, u32::try_from(i).unwrap_or(u32::MAX)), t))
    }

    pub fn refs(&self) -> Vec<EntityRef> {
        self.iter().map(|(r, _)| r).collect()
    }

    /// Identity key for `pk` of `meta` in this session's schema.
    pub fn key_for(&self, meta: &EntityMeta, pk: Vec<Value>) -> IdentityKey {
        let pk = meta
            .primary_key()
            .zip(pk)
            .map(|(f, v)| f.kind.normalize(v))
            .collect();
        IdentityKey::new(meta.qualified_name(self.schema()), pk)
    }

    /// Primary key of an entity: its identity key, or assigned key fields.
    pub fn pk_of(&self, r: EntityRef) -> Option<Vec<Value>> {
        let t = self.tracked(r).ok()?;
        if let Some(key) = &t.key {
            return Some(key.pk().to_vec());
        }
        assigned_pk(t)
    }

    /// Key an entity will have once inserted, if its primary key is assigned.
    pub fn assigned_key(&self, r: EntityRef) -> Option<IdentityKey> {
        let t = self.tracked(r).ok()?;
        assigned_pk(t).map(|pk| self.key_for(&t.meta, pk))
    }

    /// Resolve an owning relation's foreign key as currently set.
    pub fn foreign_key(&self, t: &Tracked, rel: &RelationMeta) -> ForeignKey {
        match t.entity.reference(&rel.name) {
            None | Some(Reference::Null) => ForeignKey::Null,
            Some(Reference::Unloaded(key)) => ForeignKey::Known(key.pk().to_vec()),
            Some(Reference::Loaded(target)) => match self.tracked(*target) {
                Ok(tt) if tt.state == EntityState::New => ForeignKey::Pending(*target),
                Ok(tt) => tt
                    .key
                    .as_ref()
                    .map_or(ForeignKey::Pending(*target), |k| ForeignKey::Known(k.pk().to_vec())),
                Err(_) => ForeignKey::Null,
            },
        }
    }

    /// Session entity the reference points at, resolving unloaded keys
    /// through the identity map.
    pub fn referenced(&self, t: &Tracked, relation: &str) -> Option<EntityRef> {
        match t.entity.reference(relation)? {
            Reference::Null => None,
            Reference::Loaded(r) => Some(*r),
            Reference::Unloaded(key) => self.identity.lookup(key),
        }
    }

    /// Does `t`'s `relation` point at `parent`?
    pub fn points_at(&self, t: &Tracked, relation: &str, parent: EntityRef) -> bool {
        self.referenced(t, relation) == Some(parent)
    }

    /// Snapshot of the entity's current state.
    ///
    /// Pending references are recorded as NULL; callers snapshot only
    /// after keys are resolved.
    pub fn snapshot_of(&self, r: EntityRef) -> Result<Snapshot> {
        let t = self.tracked(r)?;
        let mut scalars = BTreeMap::new();
        for field in &t.meta.fields {
            let value = t.entity.scalar(&field.name).cloned().unwrap_or(Value::Null);
            scalars.insert(field.name.clone(), field.kind.normalize(value));
        }
        let mut references = BTreeMap::new();
        for rel in t.meta.owning_relations() {
            let fk = match self.foreign_key(t, rel) {
                ForeignKey::Known(pk) => Some(pk),
                ForeignKey::Null | ForeignKey::Pending(_) => None,
            };
            references.insert(rel.name.clone(), fk);
        }
        let mut collections = BTreeMap::new();
        for (name, value) in t.entity.fields() {
            if let FieldValue::Collection(c) = value {
                if let Some(members) = c.members() {
                    collections.insert(name.to_string(), members.to_vec());
                }
            }
        }
        Ok(Snapshot::new(scalars, references, collections))
    }

    /// Fill missing field slots with their empty value.
    pub fn complete_fields(entity: &mut Entity, meta: &EntityMeta, fresh: bool) {
        for field in &meta.fields {
            if entity.get(&field.name).is_none() {
                entity.set_field(&field.name, FieldValue::Scalar(Value::Null));
            }
        }
        for rel in &meta.relations {
            if entity.get(&rel.name).is_some() {
                continue;
            }
            let value = if rel.is_collection() {
                // A new entity has no rows pointing at it yet.
                FieldValue::Collection(if fresh {
                    crate::entity::Collection::empty()
                } else {
                    crate::entity::Collection::unloaded()
                })
            } else {
                FieldValue::Reference(Reference::Null)
            };
            entity.set_field(&rel.name, value);
        }
    }
}

fn assigned_pk(t: &Tracked) -> Option<Vec<Value>> {
    t.meta
        .primary_key()
        .map(|f| {
            t.entity
                .scalar(&f.name)
                .filter(|v| !v.is_null())
                .map(|v| f.kind.normalize(v.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use datamapper_core::{ColumnKind, FieldMeta};

    fn book_meta() -> Arc<EntityMeta> {
        Arc::new(
            EntityMeta::new("Book")
                .field(FieldMeta::new("id", ColumnKind::BigInt).primary_key(true))
                .field(FieldMeta::new("title", ColumnKind::Text)),
        )
    }

    #[test]
    fn test_foreign_entities_are_rejected() {
        let mut state = UnitState::new(1, None);
        let r = state.insert(Entity::new("Book"), book_meta(), EntityState::New);
        assert!(state.tracked(r).is_ok());

        let other = EntityRef::new(2, r.slot());
        assert!(matches!(state.tracked(other), Err(Error::Session(_))));
        assert!(state.tracked(EntityRef::new(1, 9)).is_err());
    }

    #[test]
    fn test_assigned_key_is_normalized_and_qualified() {
        let mut state = UnitState::new(1, Some("tenant_a".into()));
        let r = state.insert(Entity::new("Book").with("id", 5_i32), book_meta(), EntityState::New);
        let key = state.assigned_key(r).unwrap();
        assert_eq!(key.to_string(), "tenant_a.Book(5)");
        assert_eq!(key.pk(), &[Value::BigInt(5)]);

        let unkeyed = state.insert(Entity::new("Book"), book_meta(), EntityState::New);
        assert!(state.assigned_key(unkeyed).is_none());
    }

    #[test]
    fn test_rebase_moves_every_handle() {
        let mut state = UnitState::new(1, None);
        let meta = book_meta();
        let a = state.insert(Entity::new("Book").with("id", 1_i64), Arc::clone(&meta), EntityState::Managed);
        let b = state.insert(
            Entity::new("Book").with("id", 2_i64).with_ref("sequel", a),
            meta,
            EntityState::Managed,
        );
        let key = state.key_for(&book_meta(), vec![Value::BigInt(1)]);
        state.identity.register(key.clone(), a).unwrap();

        let copy = state.rebase(7);
        let a7 = EntityRef::new(7, a.slot());
        assert_eq!(copy.identity.lookup(&key), Some(a7));
        let t = copy.tracked(EntityRef::new(7, b.slot())).unwrap();
        assert_eq!(t.entity.reference("sequel"), Some(&Reference::Loaded(a7)));
        assert!(copy.tracked(a).is_err());
    }

    #[test]
    fn test_adopt_carries_written_entities_into_a_checkpoint() {
        let meta = book_meta();
        let mut state = UnitState::new(1, None);
        let kept = state.insert(Entity::new("Book").with("id", 1_i64), Arc::clone(&meta), EntityState::Managed);
        let mut checkpoint = state.clone();

        let scratch = state.insert(Entity::new("Book"), Arc::clone(&meta), EntityState::New);
        let written = state.insert(Entity::new("Book").with("id", 2_i64), Arc::clone(&meta), EntityState::Managed);
        let key = state.key_for(&meta, vec![Value::BigInt(2)]);
        state.tracked_mut(written).unwrap().key = Some(key.clone());
        state.identity.register(key.clone(), written).unwrap();
        let snapshot = state.snapshot_of(written).unwrap();
        state.snapshots.capture(written, snapshot);
        state.tracked_mut(kept).unwrap().entity.set("title", "changed later");

        checkpoint.adopt(&state, &HashSet::from([written]));
        assert_eq!(checkpoint.tracked(written).unwrap().state, EntityState::Managed);
        assert_eq!(checkpoint.identity.lookup(&key), Some(written));
        assert!(checkpoint.snapshots.get(written).is_some());
        // Slots in between come along detached; untouched entities keep their state.
        assert_eq!(checkpoint.tracked(scratch).unwrap().state, EntityState::Detached);
        assert_eq!(checkpoint.tracked(kept).unwrap().entity.scalar("title"), None);

        let mut other = UnitState::new(2, None);
        other.adopt(&state, &HashSet::from([written]));
        assert!(other.slots.is_empty());
    }

    #[test]
    fn test_snapshot_normalizes_scalars() {
        let mut state = UnitState::new(1, None);
        let meta = book_meta();
        let mut entity = Entity::new("Book").with("id", 1_i32);
        UnitState::complete_fields(&mut entity, &meta, true);
        let r = state.insert(entity, meta, EntityState::Managed);
        let snap = state.snapshot_of(r).unwrap();
        assert_eq!(snap.scalar("id"), Some(&Value::BigInt(1)));
        assert_eq!(snap.scalar("title"), Some(&Value::Null));
    }
}
