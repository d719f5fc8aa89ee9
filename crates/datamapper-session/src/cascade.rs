//! Cascade Resolver.
//!
//! Walks relations breadth-first from a set of roots, following only the
//! relations whose policy includes the operation being cascaded. Visited
//! sets are keyed by [`EntityRef`], so cyclic graphs terminate.
//!
//! The resolver runs twice per entity lifecycle: once when `persist` or
//! `remove` is called (marking what is reachable at that moment) and again
//! at flush time, when entities attached after the call are discovered and
//! orphans are detected. The flush-time pass only *describes* the work in a
//! [`WorkingSet`]; nothing in the session changes until the flush commits.

use crate::entity::{EntityState, Reference};
use crate::state::{Tracked, UnitState};
use datamapper_core::{
    Cascade, EntityRef, Error, MetadataProvider, MetadataRegistry, RelationKind, RelationMeta,
    Result, SessionErrorKind, TableRef, Value,
};
use std::collections::{HashSet, VecDeque};

/// Rows deleted by a predicate rather than by key.
///
/// Used for children of a removed parent whose collection was never loaded,
/// and for orphans known only by key.
#[derive(Debug, Clone)]
pub(crate) struct BulkDelete {
    /// Entity type owning `table`
    pub entity_type: String,
    pub table: TableRef,
    pub columns: Vec<String>,
    pub values: Vec<Value>,
    /// Entity whose removal caused the delete
    pub parent: EntityRef,
}

/// Everything a flush must insert or delete, after cascades.
#[derive(Debug, Default)]
pub(crate) struct WorkingSet {
    /// New entities to insert, in persist order
    pub inserts: Vec<EntityRef>,
    /// Entities deleted by key, in discovery order
    pub removals: Vec<EntityRef>,
    /// Entities whose rows go away with a [`BulkDelete`]
    pub covered: HashSet<EntityRef>,
    /// New entities removed before they were ever inserted
    pub dropped: Vec<EntityRef>,
    pub bulk: Vec<BulkDelete>,
    gone: HashSet<EntityRef>,
}

impl WorkingSet {
    /// Does the flush end this entity's life in the session?
    pub fn is_gone(&self, r: EntityRef) -> bool {
        self.gone.contains(&r)
    }

    /// Leave out work on `held` entities.
    ///
    /// Predicate deletes caused by a held parent go with it.
    pub fn exclude(&mut self, held: &HashSet<EntityRef>) {
        self.inserts.retain(|r| !held.contains(r));
        self.removals.retain(|r| !held.contains(r));
        self.covered.retain(|r| !held.contains(r));
        self.dropped.retain(|r| !held.contains(r));
        self.bulk.retain(|b| !held.contains(&b.parent));
        self.gone.retain(|r| !held.contains(r));
    }

    /// Entities that leave the session on success.
    pub fn gone(&self) -> impl Iterator<Item = EntityRef> + '_ {
        self.gone.iter().copied()
    }
}

/// Entities reachable from `t` through `rel`, loaded or pending.
fn targets(state: &UnitState, t: &Tracked, rel: &RelationMeta) -> Vec<EntityRef> {
    if !rel.is_collection() {
        return state.referenced(t, &rel.name).into_iter().collect();
    }
    let Some(c) = t.entity.collection(&rel.name) else {
        return Vec::new();
    };
    let mut out: Vec<EntityRef> = c.members().map(<[EntityRef]>::to_vec).unwrap_or_default();
    for added in c.added() {
        if !out.contains(added) {
            out.push(*added);
        }
    }
    out
}

/// Breadth-first closure of `roots` along `cascade` relations.
///
/// `accept` decides whether a reached entity joins the closure (and is
/// expanded further). Roots are always part of the result.
fn closure(
    state: &UnitState,
    roots: &[EntityRef],
    cascade: Cascade,
    accept: impl Fn(&Tracked) -> bool,
) -> Result<Vec<EntityRef>> {
    let mut visited: HashSet<EntityRef> = HashSet::new();
    let mut order = Vec::new();
    let mut queue: VecDeque<EntityRef> = VecDeque::new();
    for root in roots {
        if visited.insert(*root) {
            queue.push_back(*root);
        }
    }
    while let Some(current) = queue.pop_front() {
        let t = state.tracked(current)?;
        order.push(current);
        for rel in t.meta.relations.iter().filter(|r| r.cascades(cascade)) {
            for target in targets(state, t, rel) {
                let Ok(tt) = state.tracked(target) else {
                    continue;
                };
                if accept(tt) && visited.insert(target) {
                    queue.push_back(target);
                }
            }
        }
    }
    Ok(order)
}

/// Entities reached by a persist cascade from `roots`.
pub(crate) fn persist_closure(state: &UnitState, roots: &[EntityRef]) -> Result<Vec<EntityRef>> {
    closure(state, roots, Cascade::Persist, |t| {
        t.state != EntityState::Detached
    })
}

/// Detached entities reached by a merge cascade from `root`.
pub(crate) fn merge_closure(state: &UnitState, root: EntityRef) -> Result<Vec<EntityRef>> {
    closure(state, &[root], Cascade::Merge, |t| {
        t.state == EntityState::Detached
    })
}

/// Outcome of a remove cascade.
#[derive(Debug, Default)]
pub(crate) struct RemoveClosure {
    pub reached: Vec<EntityRef>,
    pub covered: HashSet<EntityRef>,
    pub bulk: Vec<BulkDelete>,
}

/// Remove cascade from `roots`.
///
/// Unloaded `OneToMany` collections (and unloaded inverse one-to-one
/// references) cannot be walked; their rows are deleted by foreign key in
/// one statement, and children already in the session that point at the
/// parent are covered by that statement.
pub(crate) fn remove_closure(
    state: &UnitState,
    registry: &MetadataRegistry,
    roots: &[EntityRef],
) -> Result<RemoveClosure> {
    let mut out = RemoveClosure::default();
    let mut visited: HashSet<EntityRef> = roots.iter().copied().collect();
    let mut queue: VecDeque<EntityRef> = roots.iter().copied().collect();

    while let Some(current) = queue.pop_front() {
        let t = state.tracked(current)?;
        out.reached.push(current);

        for rel in t.meta.relations.iter().filter(|r| r.cascades(Cascade::Remove)) {
            let mut reached = targets(state, t, rel);
            let walkable = match rel.kind {
                RelationKind::OneToMany => t
                    .entity
                    .collection(&rel.name)
                    .is_some_and(crate::entity::Collection::is_loaded),
                RelationKind::OneToOne { owner: false } => {
                    matches!(t.entity.reference(&rel.name), Some(Reference::Loaded(_)))
                }
                RelationKind::ManyToOne | RelationKind::OneToOne { owner: true } => {
                    if let (None, Some(Reference::Unloaded(key))) =
                        (reached.first(), t.entity.reference(&rel.name))
                    {
                        let target = registry.require(&rel.target)?;
                        out.bulk.push(BulkDelete {
                            entity_type: target.name.clone(),
                            table: target.table_ref(state.schema()),
                            columns: target.pk_columns(),
                            values: key.pk().to_vec(),
                            parent: current,
                        });
                    }
                    true
                }
                RelationKind::ManyToMany { .. } => true,
            };

            if !walkable {
                if let Some(key) = &t.key {
                    if let Some((target, owning)) = registry.inverse_of(&t.meta, rel) {
                        out.bulk.push(BulkDelete {
                            entity_type: target.name.clone(),
                            table: target.table_ref(state.schema()),
                            columns: owning.join_columns.clone(),
                            values: key.pk().to_vec(),
                            parent: current,
                        });
                        for (child, ct) in state.iter() {
                            if ct.meta.name == target.name
                                && ct.key.is_some()
                                && state.points_at(ct, &owning.name, current)
                            {
                                out.covered.insert(child);
                                reached.push(child);
                            }
                        }
                    }
                }
            }

            for target in reached {
                let Ok(tt) = state.tracked(target) else {
                    continue;
                };
                if tt.state != EntityState::Detached && visited.insert(target) {
                    queue.push_back(target);
                }
            }
        }
    }
    Ok(out)
}

/// Managed entities that became orphans since their last snapshot.
fn orphans(
    state: &UnitState,
    registry: &MetadataRegistry,
    bulk: &mut Vec<BulkDelete>,
) -> Result<Vec<EntityRef>> {
    let mut found = Vec::new();
    for (parent, t) in state.iter() {
        if t.state != EntityState::Managed {
            continue;
        }
        for rel in t.meta.relations.iter().filter(|r| r.orphan_removal) {
            match rel.kind {
                RelationKind::OneToMany => {
                    let Some(c) = t.entity.collection(&rel.name) else {
                        continue;
                    };
                    let Some(mapped_by) = rel.mapped_by.as_deref() else {
                        continue;
                    };
                    let mut candidates: Vec<EntityRef> = c.removed().to_vec();
                    if let (Some(current), Some(previous)) = (
                        c.members(),
                        state.snapshots.get(parent).and_then(|s| s.collection(&rel.name)),
                    ) {
                        for member in previous {
                            if !current.contains(member) && !candidates.contains(member) {
                                candidates.push(*member);
                            }
                        }
                    }
                    for child in candidates {
                        let Ok(ct) = state.tracked(child) else {
                            continue;
                        };
                        if ct.state != EntityState::Managed {
                            continue;
                        }
                        let reattached = match ct.entity.reference(mapped_by) {
                            Some(Reference::Loaded(p)) => *p != parent,
                            Some(Reference::Unloaded(k)) => Some(k) != t.key.as_ref(),
                            _ => false,
                        };
                        if !reattached {
                            tracing::debug!(parent = %parent, child = %child, relation = %rel.name, "Orphan detected");
                            found.push(child);
                        }
                    }
                }
                RelationKind::OneToOne { owner: true } => {
                    let Some(Some(old)) = state
                        .snapshots
                        .get(parent)
                        .and_then(|s| s.reference(&rel.name))
                    else {
                        continue;
                    };
                    let current = match state.foreign_key(t, rel) {
                        crate::state::ForeignKey::Known(pk) => Some(pk),
                        _ => None,
                    };
                    if current.as_deref().is_some_and(|pk| tuple_eq(pk, old)) {
                        continue;
                    }
                    let target = registry.require(&rel.target)?;
                    let key = state.key_for(target, old.to_vec());
                    match state.identity.lookup(&key) {
                        Some(o) => {
                            let live = state.tracked(o).is_ok_and(|ot| ot.state == EntityState::Managed);
                            if live && state.referenced(t, &rel.name) != Some(o) {
                                found.push(o);
                            }
                        }
                        None => bulk.push(BulkDelete {
                            entity_type: target.name.clone(),
                            table: target.table_ref(state.schema()),
                            columns: target.pk_columns(),
                            values: key.pk().to_vec(),
                            parent,
                        }),
                    }
                }
                _ => {}
            }
        }
    }
    Ok(found)
}

pub(crate) fn tuple_eq(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.key_eq(y))
}

/// Flush-time resolution of inserts and deletes.
pub(crate) fn resolve(state: &UnitState, registry: &MetadataRegistry) -> Result<WorkingSet> {
    let mut ws = WorkingSet::default();

    let persist_roots: Vec<EntityRef> = state
        .iter()
        .filter(|(_, t)| {
            (t.state == EntityState::New && t.scheduled) || t.state == EntityState::Managed
        })
        .map(|(r, _)| r)
        .collect();
    let mut inserts: Vec<EntityRef> = persist_closure(state, &persist_roots)?
        .into_iter()
        .filter(|r| state.tracked(*r).is_ok_and(|t| t.state == EntityState::New))
        .collect();

    let mut remove_roots: Vec<EntityRef> = state
        .iter()
        .filter(|(_, t)| t.state == EntityState::Removed)
        .map(|(r, _)| r)
        .collect();
    for orphan in orphans(state, registry, &mut ws.bulk)? {
        if !remove_roots.contains(&orphan) {
            remove_roots.push(orphan);
        }
    }
    let removed = remove_closure(state, registry, &remove_roots)?;
    ws.bulk.extend(removed.bulk);
    for r in removed.reached {
        let t = state.tracked(r)?;
        ws.gone.insert(r);
        if t.key.is_none() {
            ws.dropped.push(r);
        } else if removed.covered.contains(&r) {
            ws.covered.insert(r);
        } else {
            ws.removals.push(r);
        }
    }
    inserts.retain(|r| !ws.gone.contains(r));
    inserts.sort_by_key(|r| state.tracked(*r).map_or(u64::MAX, |t| t.seq));
    ws.inserts = inserts;

    check_unpersisted(state, &ws)?;
    Ok(ws)
}

/// Every New entity a written row points at must be inserted by this flush.
fn check_unpersisted(state: &UnitState, ws: &WorkingSet) -> Result<()> {
    let inserted: HashSet<EntityRef> = ws.inserts.iter().copied().collect();
    for (r, t) in state.iter() {
        let written = inserted.contains(&r) || (t.state == EntityState::Managed && !ws.is_gone(r));
        if !written {
            continue;
        }
        for rel in &t.meta.relations {
            let pending: Vec<EntityRef> = if rel.is_collection() {
                t.entity
                    .collection(&rel.name)
                    .map(|c| c.added().to_vec())
                    .unwrap_or_default()
            } else {
                t.entity.reference(&rel.name).and_then(Reference::loaded).into_iter().collect()
            };
            for target in pending {
                let Ok(tt) = state.tracked(target) else {
                    continue;
                };
                if tt.key.is_none() && tt.state != EntityState::Detached && !inserted.contains(&target)
                {
                    return Err(Error::session(
                        SessionErrorKind::UnpersistedReference,
                        format!(
                            "{} {} references new {} {} through '{}' which was never persisted",
                            t.meta.name, r, tt.meta.name, target, rel.name
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}
