//! Commit-Order Calculator.
//!
//! Builds a graph over the entity types present in a flush, with one edge
//! per foreign-key-owning relation pointing at the referenced type. Inserts
//! run in topological order (referenced types first) and deletes in the
//! reverse. Cycles are broken by deferring nullable edges: the foreign key
//! is inserted as NULL and filled in by an update once every insert has
//! run, and before deletes it is nulled out so either row can go first.
//!
//! Self-referencing types are ordered row by row with the same rules.

use crate::cascade::WorkingSet;
use crate::change_set::{ChangeKind, ChangeSet, ColumnValue, Operation};
use crate::state::UnitState;
use datamapper_core::{
    CascadeCycleError, EntityMeta, EntityRef, Error, FieldDefault, MetadataProvider, MetadataRegistry,
    RelationKind, Result, TableRef, Value,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Why an update is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePurpose {
    /// Field changes of a managed entity
    Change,
    /// Fill a foreign key inserted as NULL to break a cycle
    CycleFix,
    /// Clear a foreign key so a cycle of rows can be deleted
    Nullify,
}

/// Version predicate of an update or delete.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionCheck {
    pub column: String,
    pub expected: Value,
}

/// A pending database operation, before batching.
#[derive(Debug, Clone)]
pub enum PendingOp {
    /// Insert one row.
    Insert {
        entity: EntityRef,
        table: TableRef,
        columns: Vec<String>,
        values: Vec<ColumnValue>,
        /// Columns whose values the database produces
        returning: Vec<String>,
        /// Must run in a statement of its own
        per_row: bool,
    },
    /// Update one row by key.
    Update {
        entity: EntityRef,
        table: TableRef,
        key_columns: Vec<String>,
        key: Vec<ColumnValue>,
        columns: Vec<String>,
        values: Vec<ColumnValue>,
        version: Option<VersionCheck>,
        purpose: UpdatePurpose,
    },
    /// Delete one row by key.
    Delete {
        entity: EntityRef,
        table: TableRef,
        key_columns: Vec<String>,
        key: Vec<Value>,
        version: Option<VersionCheck>,
    },
    /// Delete rows matching one tuple, on behalf of `entity`.
    DeleteWhere {
        entity: EntityRef,
        table: TableRef,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    /// Insert one pivot row.
    Link {
        entity: EntityRef,
        table: TableRef,
        columns: Vec<String>,
        values: Vec<ColumnValue>,
    },
    /// Delete one pivot row.
    Unlink {
        entity: EntityRef,
        table: TableRef,
        columns: Vec<String>,
        values: Vec<ColumnValue>,
    },
}

impl PendingOp {
    pub fn table(&self) -> &TableRef {
        match self {
            PendingOp::Insert { table, .. }
            | PendingOp::Update { table, .. }
            | PendingOp::Delete { table, .. }
            | PendingOp::DeleteWhere { table, .. }
            | PendingOp::Link { table, .. }
            | PendingOp::Unlink { table, .. } => table,
        }
    }

    /// Entity the operation is attributed to.
    pub fn entity(&self) -> EntityRef {
        match self {
            PendingOp::Insert { entity, .. }
            | PendingOp::Update { entity, .. }
            | PendingOp::Delete { entity, .. }
            | PendingOp::DeleteWhere { entity, .. }
            | PendingOp::Link { entity, .. }
            | PendingOp::Unlink { entity, .. } => *entity,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, PendingOp::Insert { .. })
    }

    pub fn is_update(&self) -> bool {
        matches!(self, PendingOp::Update { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, PendingOp::Delete { .. } | PendingOp::DeleteWhere { .. })
    }
}

// ============================================================================
// Type graph
// ============================================================================

#[derive(Debug, Clone)]
struct Edge {
    /// Owning type (holds the foreign key)
    from: usize,
    /// Referenced type
    to: usize,
    relation: String,
    nullable: bool,
    deferred: bool,
}

struct TypeGraph {
    types: Vec<Arc<EntityMeta>>,
    edges: Vec<Edge>,
}

impl TypeGraph {
    fn build(types: Vec<Arc<EntityMeta>>) -> Self {
        let index: HashMap<&str, usize> = types
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name.as_str(), i))
            .collect();
        let mut edges = Vec::new();
        for (from, meta) in types.iter().enumerate() {
            for rel in meta.owning_relations() {
                let Some(&to) = index.get(rel.target.as_str()) else {
                    continue;
                };
                if to != from {
                    edges.push(Edge {
                        from,
                        to,
                        relation: rel.name.clone(),
                        nullable: rel.nullable,
                        deferred: false,
                    });
                }
            }
        }
        Self { types, edges }
    }

    fn adjacency(&self) -> Vec<Vec<usize>> {
        let mut adj = vec![Vec::new(); self.types.len()];
        for e in self.edges.iter().filter(|e| !e.deferred) {
            adj[e.from].push(e.to);
        }
        adj
    }

    /// Defer nullable edges until the graph is acyclic.
    ///
    /// Within each cyclic component the first nullable edge in declaration
    /// order goes first; components are re-examined until none is left.
    fn break_cycles(&mut self) -> Result<()> {
        loop {
            let components = strongly_connected(&self.adjacency());
            let mut changed = false;
            for component in components.iter().filter(|c| c.len() > 1) {
                let candidate = self.edges.iter_mut().find(|e| {
                    !e.deferred
                        && e.nullable
                        && component.contains(&e.from)
                        && component.contains(&e.to)
                });
                match candidate {
                    Some(edge) => {
                        tracing::debug!(
                            entity = %self.types[edge.from].name,
                            relation = %edge.relation,
                            "Deferring foreign key to break cycle"
                        );
                        edge.deferred = true;
                        changed = true;
                    }
                    None => {
                        let mut members: Vec<usize> = component.clone();
                        members.sort_unstable();
                        return Err(Error::CascadeCycle(CascadeCycleError {
                            types: members.iter().map(|i| self.types[*i].name.clone()).collect(),
                        }));
                    }
                }
            }
            if !changed {
                return Ok(());
            }
        }
    }

    /// Referenced types first; ties go to declaration order.
    fn insert_order(&self) -> Vec<usize> {
        let n = self.types.len();
        let mut pending = vec![0_usize; n];
        for e in self.edges.iter().filter(|e| !e.deferred) {
            pending[e.from] += 1;
        }
        let mut placed = vec![false; n];
        let mut order = Vec::with_capacity(n);
        while order.len() < n {
            // Types are indexed in declaration order.
            let Some(next) = (0..n).find(|&i| !placed[i] && pending[i] == 0) else {
                break;
            };
            placed[next] = true;
            order.push(next);
            for e in self.edges.iter().filter(|e| !e.deferred && e.to == next) {
                pending[e.from] -= 1;
            }
        }
        order
    }

    fn is_deferred(&self, from: usize, relation: &str) -> bool {
        self.edges
            .iter()
            .any(|e| e.from == from && e.relation == relation && e.deferred)
    }
}

/// Tarjan's strongly connected components.
fn strongly_connected(adj: &[Vec<usize>]) -> Vec<Vec<usize>> {
    struct Tarjan<'a> {
        adj: &'a [Vec<usize>],
        index: Vec<Option<usize>>,
        low: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        next: usize,
        out: Vec<Vec<usize>>,
    }

    impl Tarjan<'_> {
        fn visit(&mut self, v: usize) {
            self.index[v] = Some(self.next);
            self.low[v] = self.next;
            self.next += 1;
            self.stack.push(v);
            self.on_stack[v] = true;
            for i in 0..self.adj[v].len() {
                let w = self.adj[v][i];
                match self.index[w] {
                    None => {
                        self.visit(w);
                        self.low[v] = self.low[v].min(self.low[w]);
                    }
                    Some(iw) if self.on_stack[w] => self.low[v] = self.low[v].min(iw),
                    Some(_) => {}
                }
            }
            if Some(self.low[v]) == self.index[v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                self.out.push(component);
            }
        }
    }

    let n = adj.len();
    let mut t = Tarjan {
        adj,
        index: vec![None; n],
        low: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        next: 0,
        out: Vec::new(),
    };
    for v in 0..n {
        if t.index[v].is_none() {
            t.visit(v);
        }
    }
    t.out
}

// ============================================================================
// Row-level ordering for self-referencing types
// ============================================================================

/// `row` must come after `before` because `owner`'s foreign key through
/// `relation` links them.
#[derive(Debug, Clone)]
struct RowDep {
    row: usize,
    before: usize,
    owner: usize,
    relation: String,
    nullable: bool,
}

/// Order rows (indexed by persist sequence) so each follows its deps.
///
/// Returns the order and the deps that had to be broken; a dep is broken
/// by clearing the owner's foreign key.
fn order_rows(count: usize, deps: &[RowDep], entity: &str) -> Result<(Vec<usize>, Vec<usize>)> {
    let mut by_row: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (i, dep) in deps.iter().enumerate() {
        by_row[dep.row].push(i);
    }
    let mut broken = vec![false; deps.len()];
    let mut placed = vec![false; count];
    let mut order = Vec::with_capacity(count);

    let blocking = |row: usize, placed: &[bool], broken: &[bool]| -> Vec<usize> {
        by_row[row]
            .iter()
            .copied()
            .filter(|&d| !broken[d] && !placed[deps[d].before])
            .collect()
    };

    while order.len() < count {
        let ready = (0..count).find(|&i| !placed[i] && blocking(i, &placed, &broken).is_empty());
        if let Some(i) = ready {
            placed[i] = true;
            order.push(i);
            continue;
        }
        let candidate = (0..count).filter(|&i| !placed[i]).find_map(|i| {
            let blocked = blocking(i, &placed, &broken);
            blocked.iter().all(|&d| deps[d].nullable).then_some(blocked)
        });
        let Some(blocked) = candidate else {
            return Err(Error::CascadeCycle(CascadeCycleError {
                types: vec![entity.to_string()],
            }));
        };
        for d in blocked {
            broken[d] = true;
        }
    }
    let broken = (0..deps.len()).filter(|&d| broken[d]).collect();
    Ok((order, broken))
}

// ============================================================================
// Plan
// ============================================================================

fn key_values(state: &UnitState, r: EntityRef, width: usize) -> Vec<ColumnValue> {
    match state.pk_of(r) {
        Some(pk) => pk.into_iter().map(ColumnValue::Value).collect(),
        None => (0..width)
            .map(|component| ColumnValue::KeyOf {
                entity: r,
                component,
            })
            .collect(),
    }
}

fn version_check(set: &ChangeSet) -> Option<VersionCheck> {
    let field = set.meta.version_field()?;
    let expected = set.expected_version.clone()?;
    Some(VersionCheck {
        column: field.column.clone(),
        expected,
    })
}

struct Planner<'a> {
    state: &'a UnitState,
    registry: &'a MetadataRegistry,
    ws: &'a WorkingSet,
    graph: TypeGraph,
    /// Position of each type in insert order
    position: Vec<usize>,
    order: Vec<usize>,
}

/// Order the change sets of a flush into executable operations.
pub(crate) fn plan(
    state: &UnitState,
    registry: &MetadataRegistry,
    ws: &WorkingSet,
    sets: &[ChangeSet],
) -> Result<Vec<PendingOp>> {
    let mut present: HashSet<&str> = HashSet::new();
    for set in sets.iter().filter(|s| s.operation != Operation::Update) {
        present.insert(set.meta.name.as_str());
    }
    for bulk in &ws.bulk {
        present.insert(bulk.entity_type.as_str());
    }
    let types: Vec<Arc<EntityMeta>> = registry
        .entities()
        .iter()
        .filter(|m| present.contains(m.name.as_str()))
        .cloned()
        .collect();

    let mut graph = TypeGraph::build(types);
    graph.break_cycles()?;
    let order = graph.insert_order();
    let mut position = vec![0; graph.types.len()];
    for (pos, t) in order.iter().enumerate() {
        position[*t] = pos;
    }

    let planner = Planner {
        state,
        registry,
        ws,
        graph,
        position,
        order,
    };
    planner.run(sets)
}

impl Planner<'_> {
    fn type_index(&self, name: &str) -> Option<usize> {
        self.graph.types.iter().position(|m| m.name == name)
    }

    fn run(&self, sets: &[ChangeSet]) -> Result<Vec<PendingOp>> {
        let mut ops = Vec::new();
        let mut fixes = Vec::new();
        for &t in &self.order {
            self.inserts(t, sets, &mut ops, &mut fixes)?;
        }
        ops.extend(fixes);
        self.updates(sets, &mut ops);
        self.links(sets, &mut ops);
        self.pivot_cleanup(&mut ops)?;

        let mut nullify = Vec::new();
        let mut deletes = Vec::new();
        for &t in self.order.iter().rev() {
            self.deletes(t, sets, &mut nullify, &mut deletes)?;
        }
        ops.extend(nullify);
        ops.extend(deletes);
        Ok(ops)
    }

    fn inserts(
        &self,
        t: usize,
        sets: &[ChangeSet],
        ops: &mut Vec<PendingOp>,
        fixes: &mut Vec<PendingOp>,
    ) -> Result<()> {
        let meta = &self.graph.types[t];
        let mut rows: Vec<&ChangeSet> = sets
            .iter()
            .filter(|s| s.operation == Operation::Create && s.meta.name == meta.name)
            .collect();
        if rows.is_empty() {
            return Ok(());
        }
        rows.sort_by_key(|s| s.seq);

        // Self references between rows of this flush.
        let index: HashMap<EntityRef, usize> =
            rows.iter().enumerate().map(|(i, s)| (s.entity, i)).collect();
        let mut deps = Vec::new();
        for (i, set) in rows.iter().enumerate() {
            for change in &set.changes {
                let Some(rel) = meta.relation_named(&change.field) else {
                    continue;
                };
                if change.kind != ChangeKind::ForeignKey
                    || rel.target != meta.name
                    || rel.join_columns.first() != Some(&change.column)
                {
                    continue;
                }
                if let Some(&j) = change.new.pending().and_then(|p| index.get(&p)) {
                    deps.push(RowDep {
                        row: i,
                        before: j,
                        owner: i,
                        relation: rel.name.clone(),
                        nullable: rel.nullable,
                    });
                }
            }
        }
        let (row_order, broken) = order_rows(rows.len(), &deps, &meta.name)?;
        let broken: HashSet<(usize, &str)> = broken
            .into_iter()
            .map(|d| (deps[d].owner, deps[d].relation.as_str()))
            .collect();

        let table = meta.table_ref(self.state.schema());
        let pk_columns = meta.pk_columns();
        for i in row_order {
            let set = rows[i];
            let mut columns = Vec::new();
            let mut values = Vec::new();
            let mut deferred: BTreeMap<&str, (Vec<String>, Vec<ColumnValue>)> = BTreeMap::new();
            for change in &set.changes {
                let defer = change.kind == ChangeKind::ForeignKey
                    && change.new.pending().is_some()
                    && (broken.contains(&(i, change.field.as_str()))
                        || self.defers_insert(t, &change.field));
                columns.push(change.column.clone());
                if defer {
                    let entry = deferred.entry(change.field.as_str()).or_default();
                    entry.0.push(change.column.clone());
                    entry.1.push(change.new.clone());
                    values.push(ColumnValue::Value(Value::Null));
                } else {
                    values.push(change.new.clone());
                }
            }
            let returning: Vec<String> = meta
                .fields
                .iter()
                .filter(|f| f.is_database_generated() && !columns.contains(&f.column))
                .map(|f| f.column.clone())
                .collect();
            let per_row = meta.fields.iter().any(|f| {
                matches!(f.default, Some(FieldDefault::Formula(_)))
                    && returning.contains(&f.column)
            });
            ops.push(PendingOp::Insert {
                entity: set.entity,
                table: table.clone(),
                columns,
                values,
                returning,
                per_row,
            });
            for (_, (columns, values)) in deferred {
                fixes.push(PendingOp::Update {
                    entity: set.entity,
                    table: table.clone(),
                    key_columns: pk_columns.clone(),
                    key: key_values(self.state, set.entity, pk_columns.len()),
                    columns,
                    values,
                    version: None,
                    purpose: UpdatePurpose::CycleFix,
                });
            }
        }
        Ok(())
    }

    /// Must `relation` of type `t` be inserted as NULL because its target
    /// type is inserted later?
    fn defers_insert(&self, t: usize, relation: &str) -> bool {
        let Some(rel) = self.graph.types[t].relation_named(relation) else {
            return false;
        };
        let Some(target) = self.type_index(&rel.target) else {
            return false;
        };
        self.graph.is_deferred(t, relation) && self.position[target] > self.position[t]
    }

    fn updates(&self, sets: &[ChangeSet], ops: &mut Vec<PendingOp>) {
        let mut updates: Vec<&ChangeSet> = sets
            .iter()
            .filter(|s| s.operation == Operation::Update && s.touches_row())
            .collect();
        updates.sort_by_key(|s| (s.meta.order, s.seq));
        for set in updates {
            let Some(key) = &set.key else {
                continue;
            };
            let mut columns: Vec<String> = set.changes.iter().map(|c| c.column.clone()).collect();
            let mut values: Vec<ColumnValue> = set.changes.iter().map(|c| c.new.clone()).collect();
            let version = version_check(set);
            if let (Some(field), Some(next)) = (set.meta.version_field(), &set.next_version) {
                columns.push(field.column.clone());
                values.push(ColumnValue::Value(next.clone()));
            }
            ops.push(PendingOp::Update {
                entity: set.entity,
                table: set.meta.table_ref(self.state.schema()),
                key_columns: set.meta.pk_columns(),
                key: key.pk().iter().cloned().map(ColumnValue::Value).collect(),
                columns,
                values,
                version,
                purpose: UpdatePurpose::Change,
            });
        }
    }

    fn links(&self, sets: &[ChangeSet], ops: &mut Vec<PendingOp>) {
        let mut unlinks = Vec::new();
        for set in sets {
            for change in &set.collections {
                let Some(rel) = set.meta.relation_named(&change.relation) else {
                    continue;
                };
                let Ok(target_meta) = self.registry.require(&rel.target) else {
                    continue;
                };
                let width = target_meta.pk_columns().len();
                let columns: Vec<String> = change
                    .owner_columns
                    .iter()
                    .chain(&change.target_columns)
                    .cloned()
                    .collect();
                let owner = key_values(self.state, set.entity, set.meta.pk_columns().len());
                for target in change.added.iter().filter(|t| !self.ws.is_gone(**t)) {
                    let mut values = owner.clone();
                    values.extend(key_values(self.state, *target, width));
                    ops.push(PendingOp::Link {
                        entity: set.entity,
                        table: change.pivot.clone(),
                        columns: columns.clone(),
                        values,
                    });
                }
                for target in change.removed.iter().filter(|t| !self.ws.is_gone(**t)) {
                    let Some(pk) = self.state.pk_of(*target) else {
                        continue;
                    };
                    let mut values = owner.clone();
                    values.extend(pk.into_iter().map(ColumnValue::Value));
                    unlinks.push(PendingOp::Unlink {
                        entity: set.entity,
                        table: change.pivot.clone(),
                        columns: columns.clone(),
                        values,
                    });
                }
            }
        }
        ops.extend(unlinks);
    }

    /// Pivot rows of deleted entities go before the entities themselves.
    fn pivot_cleanup(&self, ops: &mut Vec<PendingOp>) -> Result<()> {
        let mut grouped: BTreeMap<(TableRef, Vec<String>), Vec<(EntityRef, Vec<Value>)>> =
            BTreeMap::new();
        let deleted = self.ws.removals.iter().chain(self.ws.covered.iter());
        let mut seen = HashSet::new();
        for r in deleted {
            if !seen.insert(*r) {
                continue;
            }
            let t = self.state.tracked(*r)?;
            let Some(key) = &t.key else {
                continue;
            };
            for rel in &t.meta.relations {
                let (pivot_owner, pivot, columns) = match rel.kind {
                    RelationKind::ManyToMany { owner: true } => {
                        let Some(pivot) = &rel.pivot else { continue };
                        (&t.meta, pivot, pivot.owner_columns.clone())
                    }
                    RelationKind::ManyToMany { owner: false } => {
                        let Some((owner, owning)) = self.registry.inverse_of(&t.meta, rel) else {
                            continue;
                        };
                        let Some(pivot) = &owning.pivot else { continue };
                        (owner, pivot, pivot.target_columns.clone())
                    }
                    _ => continue,
                };
                let table =
                    TableRef::new(pivot_owner.effective_schema(self.state.schema()), &pivot.table);
                grouped
                    .entry((table, columns))
                    .or_default()
                    .push((*r, key.pk().to_vec()));
            }
        }
        for ((table, columns), rows) in grouped {
            for (entity, values) in rows {
                ops.push(PendingOp::DeleteWhere {
                    entity,
                    table: table.clone(),
                    columns: columns.clone(),
                    values,
                });
            }
        }
        Ok(())
    }

    /// Target of `rel` as recorded in `r`'s snapshot, if it is being deleted.
    fn deleted_target(&self, r: EntityRef, relation: &str, target: &EntityMeta) -> Option<EntityRef> {
        let snapshot = self.state.snapshots.get(r)?;
        let fk = snapshot.reference(relation).flatten()?;
        let key = self.state.key_for(target, fk.to_vec());
        let found = self.state.identity.lookup(&key)?;
        self.ws.is_gone(found).then_some(found)
    }

    fn deletes(
        &self,
        t: usize,
        sets: &[ChangeSet],
        nullify: &mut Vec<PendingOp>,
        deletes: &mut Vec<PendingOp>,
    ) -> Result<()> {
        let meta = &self.graph.types[t];
        let table = meta.table_ref(self.state.schema());
        let pk_columns = meta.pk_columns();

        for bulk in self.ws.bulk.iter().filter(|b| b.entity_type == meta.name) {
            deletes.push(PendingOp::DeleteWhere {
                entity: bulk.parent,
                table: bulk.table.clone(),
                columns: bulk.columns.clone(),
                values: bulk.values.clone(),
            });
        }

        let mut rows: Vec<&ChangeSet> = sets
            .iter()
            .filter(|s| s.operation == Operation::Delete && s.meta.name == meta.name)
            .collect();
        if rows.is_empty() {
            return Ok(());
        }
        rows.sort_by_key(|s| s.seq);
        let index: HashMap<EntityRef, usize> =
            rows.iter().enumerate().map(|(i, s)| (s.entity, i)).collect();

        let mut deps = Vec::new();
        let mut cleared: Vec<(usize, &str)> = Vec::new();
        for (i, set) in rows.iter().enumerate() {
            for rel in meta.owning_relations() {
                let Some(target_index) = self.type_index(&rel.target) else {
                    continue;
                };
                let target_meta = &self.graph.types[target_index];
                let Some(target) = self.deleted_target(set.entity, &rel.name, target_meta) else {
                    continue;
                };
                if target_index == t {
                    // Children go first: the referenced row waits for this one.
                    if let Some(&j) = index.get(&target) {
                        if j != i {
                            deps.push(RowDep {
                                row: j,
                                before: i,
                                owner: i,
                                relation: rel.name.clone(),
                                nullable: rel.nullable,
                            });
                        }
                    }
                } else if self.graph.is_deferred(t, &rel.name)
                    && self.position[target_index] > self.position[t]
                {
                    cleared.push((i, rel.name.as_str()));
                }
            }
        }
        let (row_order, broken) = order_rows(rows.len(), &deps, &meta.name)?;
        for d in broken {
            cleared.push((deps[d].owner, deps[d].relation.as_str()));
        }
        cleared.sort_unstable();
        cleared.dedup();

        for (i, relation) in cleared {
            let set = rows[i];
            let Some(rel) = meta.relation_named(relation) else {
                continue;
            };
            let Some(key) = &set.key else {
                continue;
            };
            nullify.push(PendingOp::Update {
                entity: set.entity,
                table: table.clone(),
                key_columns: pk_columns.clone(),
                key: key.pk().iter().cloned().map(ColumnValue::Value).collect(),
                columns: rel.join_columns.clone(),
                values: vec![ColumnValue::Value(Value::Null); rel.join_columns.len()],
                version: None,
                purpose: UpdatePurpose::Nullify,
            });
        }

        for i in row_order {
            let set = rows[i];
            let Some(key) = &set.key else {
                continue;
            };
            deletes.push(PendingOp::Delete {
                entity: set.entity,
                table: table.clone(),
                key_columns: pk_columns.clone(),
                key: key.pk().to_vec(),
                version: version_check(set),
            });
        }
        Ok(())
    }
}
