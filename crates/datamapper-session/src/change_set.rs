//! Change-Set Computer.
//!
//! Change sets are built fresh on every flush and thrown away when it ends.
//! Scalars are compared after normalization by their declared column kind;
//! references compare the foreign-key tuple they resolve to, never the
//! instance, so swapping in another instance with the same key is not a
//! change.

use crate::cascade::{WorkingSet, tuple_eq};
use crate::entity::EntityState;
use crate::lock;
use crate::state::{ForeignKey, Tracked, UnitState};
use datamapper_core::{
    EntityMeta, EntityRef, Error, FieldDefault, FieldMeta, IdentityKey, RelationMeta, Result,
    SessionErrorKind, TableRef, Value,
};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// A column value, possibly waiting on a key generated in the same flush.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Value(Value),
    /// Component `component` of `entity`'s primary key
    KeyOf { entity: EntityRef, component: usize },
}

impl ColumnValue {
    pub fn pending(&self) -> Option<EntityRef> {
        match self {
            ColumnValue::KeyOf { entity, .. } => Some(*entity),
            ColumnValue::Value(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Scalar,
    /// Join column of an owning relation; `field` is the relation name
    ForeignKey,
}

#[derive(Debug, Clone)]
pub struct FieldChange {
    pub field: String,
    pub column: String,
    pub kind: ChangeKind,
    /// Snapshot value; `None` for creates
    pub old: Option<Value>,
    pub new: ColumnValue,
}

/// Pivot rows to add or remove for one owning many-to-many relation.
#[derive(Debug, Clone)]
pub struct CollectionChange {
    pub relation: String,
    pub pivot: TableRef,
    pub owner_columns: Vec<String>,
    pub target_columns: Vec<String>,
    pub added: Vec<EntityRef>,
    pub removed: Vec<EntityRef>,
}

#[derive(Debug, Clone)]
pub struct ChangeSet {
    pub entity: EntityRef,
    pub meta: Arc<EntityMeta>,
    pub operation: Operation,
    pub changes: Vec<FieldChange>,
    pub collections: Vec<CollectionChange>,
    /// Identity key; for creates, only when the key is assigned
    pub key: Option<IdentityKey>,
    /// Version the row must still carry (updates and deletes)
    pub expected_version: Option<Value>,
    /// Version written by this change
    pub next_version: Option<Value>,
    /// Persist sequence of the entity
    pub seq: u64,
}

impl ChangeSet {
    /// Names of changed fields and relations, without duplicates.
    pub fn changed_fields(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let fields = self.changes.iter().map(|c| &c.field);
        let relations = self.collections.iter().map(|c| &c.relation);
        for name in fields.chain(relations) {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Does the row itself change (as opposed to only pivot rows)?
    pub fn touches_row(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Compute the change sets of a flush from its working set.
pub(crate) fn compute(state: &UnitState, ws: &WorkingSet) -> Result<Vec<ChangeSet>> {
    let mut sets = Vec::new();
    for r in &ws.inserts {
        sets.push(create_set(state, *r)?);
    }
    for (r, t) in state.iter() {
        if t.state != EntityState::Managed || ws.is_gone(r) {
            continue;
        }
        if let Some(set) = update_set(state, r)? {
            sets.push(set);
        }
    }
    for r in &ws.removals {
        sets.push(delete_set(state, *r)?);
    }
    tracing::debug!(change_sets = sets.len(), "Computed change sets");
    Ok(sets)
}

fn scalar_of(t: &Tracked, field: &FieldMeta) -> Value {
    field
        .kind
        .normalize(t.entity.scalar(&field.name).cloned().unwrap_or(Value::Null))
}

fn fk_values(state: &UnitState, t: &Tracked, rel: &RelationMeta) -> (ForeignKey, Vec<ColumnValue>) {
    let fk = state.foreign_key(t, rel);
    let values = match &fk {
        ForeignKey::Null => vec![ColumnValue::Value(Value::Null); rel.join_columns.len()],
        ForeignKey::Known(pk) => pk.iter().cloned().map(ColumnValue::Value).collect(),
        ForeignKey::Pending(target) => (0..rel.join_columns.len())
            .map(|component| ColumnValue::KeyOf {
                entity: *target,
                component,
            })
            .collect(),
    };
    (fk, values)
}

fn fk_changes(
    rel: &RelationMeta,
    old: Option<&[Value]>,
    values: Vec<ColumnValue>,
    changes: &mut Vec<FieldChange>,
    creating: bool,
) {
    for (i, (column, new)) in rel.join_columns.iter().zip(values).enumerate() {
        changes.push(FieldChange {
            field: rel.name.clone(),
            column: column.clone(),
            kind: ChangeKind::ForeignKey,
            old: if creating {
                None
            } else {
                Some(old.and_then(|o| o.get(i)).cloned().unwrap_or(Value::Null))
            },
            new,
        });
    }
}

fn pivot_change(
    state: &UnitState,
    t: &Tracked,
    rel: &RelationMeta,
    added: Vec<EntityRef>,
    removed: Vec<EntityRef>,
) -> Option<CollectionChange> {
    let pivot = rel.pivot.as_ref()?;
    if added.is_empty() && removed.is_empty() {
        return None;
    }
    Some(CollectionChange {
        relation: rel.name.clone(),
        pivot: TableRef::new(t.meta.effective_schema(state.schema()), &pivot.table),
        owner_columns: pivot.owner_columns.clone(),
        target_columns: pivot.target_columns.clone(),
        added,
        removed,
    })
}

fn create_set(state: &UnitState, r: EntityRef) -> Result<ChangeSet> {
    let t = state.tracked(r)?;
    let mut changes = Vec::new();
    let mut next_version = None;
    for field in &t.meta.fields {
        let mut value = scalar_of(t, field);
        if value.is_null() {
            if let Some(FieldDefault::Value(default)) = &field.default {
                value = field.kind.normalize(default.clone());
            } else if field.version {
                value = lock::initial_version(field.kind);
            } else if field.is_database_generated() {
                continue;
            }
        }
        if field.version {
            next_version = Some(value.clone());
        }
        changes.push(FieldChange {
            field: field.name.clone(),
            column: field.column.clone(),
            kind: ChangeKind::Scalar,
            old: None,
            new: ColumnValue::Value(value),
        });
    }
    for rel in t.meta.owning_relations() {
        let (_, values) = fk_values(state, t, rel);
        fk_changes(rel, None, values, &mut changes, true);
    }
    let mut collections = Vec::new();
    for rel in t.meta.relations.iter().filter(|r| r.owns_pivot()) {
        let added = t
            .entity
            .collection(&rel.name)
            .map(|c| c.added().to_vec())
            .unwrap_or_default();
        collections.extend(pivot_change(state, t, rel, added, Vec::new()));
    }
    Ok(ChangeSet {
        entity: r,
        meta: Arc::clone(&t.meta),
        operation: Operation::Create,
        changes,
        collections,
        key: state.assigned_key(r),
        expected_version: None,
        next_version,
        seq: t.seq,
    })
}

/// Diff a managed entity against its snapshot.
///
/// Returns `None` when nothing differs.
pub(crate) fn update_set(state: &UnitState, r: EntityRef) -> Result<Option<ChangeSet>> {
    let t = state.tracked(r)?;
    let Some(snapshot) = state.snapshots.get(r) else {
        return Ok(None);
    };
    let mut changes = Vec::new();
    for field in t.meta.fields.iter().filter(|f| !f.version) {
        let current = scalar_of(t, field);
        let old = snapshot.scalar(&field.name).cloned().unwrap_or(Value::Null);
        if current.key_eq(&old) {
            continue;
        }
        if field.primary_key {
            return Err(Error::session(
                SessionErrorKind::InvalidState,
                format!(
                    "primary key field '{}' of {} cannot change (was {}, now {})",
                    field.name, t.meta.name, old, current
                ),
            ));
        }
        changes.push(FieldChange {
            field: field.name.clone(),
            column: field.column.clone(),
            kind: ChangeKind::Scalar,
            old: Some(old),
            new: ColumnValue::Value(current),
        });
    }
    for rel in t.meta.owning_relations() {
        let old = snapshot.reference(&rel.name).flatten();
        let (fk, values) = fk_values(state, t, rel);
        let unchanged = match (&fk, old) {
            (ForeignKey::Known(pk), Some(old)) => tuple_eq(pk, old),
            (ForeignKey::Null, None) => true,
            _ => false,
        };
        if !unchanged {
            fk_changes(rel, old, values, &mut changes, false);
        }
    }

    let mut collections = Vec::new();
    for rel in t.meta.relations.iter().filter(|r| r.owns_pivot()) {
        let Some(c) = t.entity.collection(&rel.name) else {
            continue;
        };
        let baseline = snapshot.collection(&rel.name);
        let added = c
            .added()
            .iter()
            .filter(|a| baseline.is_none_or(|b| !b.contains(a)))
            .copied()
            .collect();
        let removed = c
            .removed()
            .iter()
            .filter(|x| baseline.is_none_or(|b| b.contains(x)))
            .copied()
            .collect();
        collections.extend(pivot_change(state, t, rel, added, removed));
    }

    if changes.is_empty() && collections.is_empty() {
        return Ok(None);
    }
    let (expected_version, next_version) = match t.meta.version_field() {
        // Pivot rows alone do not bump the version.
        Some(field) if !changes.is_empty() => {
            let expected = snapshot.scalar(&field.name).cloned().unwrap_or(Value::Null);
            let next = lock::next_version(field.kind, &expected);
            (Some(expected), Some(next))
        }
        _ => (None, None),
    };
    Ok(Some(ChangeSet {
        entity: r,
        meta: Arc::clone(&t.meta),
        operation: Operation::Update,
        changes,
        collections,
        key: t.key.clone(),
        expected_version,
        next_version,
        seq: t.seq,
    }))
}

fn delete_set(state: &UnitState, r: EntityRef) -> Result<ChangeSet> {
    let t = state.tracked(r)?;
    let expected_version = t.meta.version_field().and_then(|field| {
        state
            .snapshots
            .get(r)
            .and_then(|s| s.scalar(&field.name).cloned())
    });
    Ok(ChangeSet {
        entity: r,
        meta: Arc::clone(&t.meta),
        operation: Operation::Delete,
        changes: Vec::new(),
        collections: Vec::new(),
        key: t.key.clone(),
        expected_version,
        next_version: None,
        seq: t.seq,
    })
}
