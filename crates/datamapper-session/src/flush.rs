//! Flush Executor.
//!
//! A flush moves through `Idle -> Computing -> Ordering -> Executing ->
//! Committing -> Idle`, or `RollingBack -> Idle` when anything fails. The
//! session is only touched after every statement succeeded: until then the
//! plan works on generated keys collected in a side table.
//!
//! Inside a transaction a flush is fenced by a savepoint that is recorded
//! on the transaction until released, so a flush abandoned mid-way is
//! rolled back by whatever touches the transaction next.

use crate::batch::{self, Batch, KeyMap};
use crate::cascade::{self, WorkingSet};
use crate::change_set::{self, ChangeKind, ChangeSet, ColumnValue, Operation};
use crate::commit_order::{self, PendingOp, UpdatePurpose};
use crate::entity::{EntityState, FieldValue};
use crate::lock;
use crate::state::UnitState;
use crate::{Session, SessionEvent};
use asupersync::{Cx, Outcome};
use datamapper_core::{
    Connection, ConstraintViolationError, Driver, EntityRef, Error, ExecResult,
    IdentityConflictError, QueryErrorKind, Result, SessionErrorKind, Statement, Value,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// Where a flush currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FlushPhase {
    #[default]
    Idle,
    Computing,
    Ordering,
    Executing,
    Committing,
    RollingBack,
}

/// Result of a flush operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of entities updated (cycle fixes not counted).
    pub updated: usize,
    /// Number of rows deleted, including predicate deletes.
    pub deleted: usize,
    /// Number of pivot rows inserted.
    pub linked: usize,
    /// Number of pivot rows deleted.
    pub unlinked: usize,
    /// Number of statements sent to the driver.
    pub statements: usize,
}

impl FlushResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of rows written.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.linked + self.unlinked
    }
}

/// What executing the plan produced, applied to the session on success.
#[derive(Debug, Default)]
struct Executed {
    keys: KeyMap,
    /// Database-produced field values per inserted entity
    generated: HashMap<EntityRef, Vec<(String, Value)>>,
    result: FlushResult,
}

/// Plan computed before any I/O.
struct FlushPlan {
    ws: WorkingSet,
    sets: Vec<ChangeSet>,
    batches: Vec<Batch>,
    /// Entities left to a suspended transaction
    held: HashSet<EntityRef>,
}

impl<D: Driver> Session<D> {
    /// Flush pending changes to the database.
    ///
    /// Runs in its own transaction, or inside a savepoint of the active
    /// transaction scope. Calling it with nothing pending sends no statement.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = self.state.generation))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        self.discard_open_flush(cx).await;
        if self.phase != FlushPhase::Idle {
            tracing::warn!(phase = ?self.phase, "Resetting phase left by an abandoned flush");
            self.phase = FlushPhase::Idle;
        }
        if let Err(e) = self.events.fire(SessionEvent::BeforeFlush) {
            return Outcome::Err(e);
        }
        let start = Instant::now();

        let plan = match self.plan_flush() {
            Ok(plan) => plan,
            Err(e) => {
                self.phase = FlushPhase::Idle;
                return Outcome::Err(e);
            }
        };

        let executed = if plan.batches.is_empty() {
            Executed::default()
        } else {
            self.phase = FlushPhase::Executing;
            let keys = prefill_keys(&self.state, &plan.ws);
            let outcome = if self.tx.is_some() {
                self.execute_in_transaction(cx, &plan, keys).await
            } else {
                self.execute_standalone(cx, &plan, keys).await
            };
            match outcome {
                Outcome::Ok(executed) => executed,
                Outcome::Err(e) => {
                    self.phase = FlushPhase::Idle;
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.phase = FlushPhase::Idle;
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.phase = FlushPhase::Idle;
                    return Outcome::Panicked(p);
                }
            }
        };

        let result = executed.result;
        let applied = self.apply(&plan, executed);
        self.phase = FlushPhase::Idle;
        match applied {
            Ok(written) => self.record_written(written),
            Err(e) => return Outcome::Err(e),
        }
        if let Err(e) = self.events.fire(SessionEvent::AfterFlush) {
            return Outcome::Err(e);
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            statements = result.statements,
            "Flush complete"
        );
        Outcome::Ok(result)
    }

    fn plan_flush(&mut self) -> Result<FlushPlan> {
        self.phase = FlushPhase::Computing;
        let held = self.held().cloned().unwrap_or_default();
        let mut ws = cascade::resolve(&self.state, &self.registry)?;
        ws.exclude(&held);
        let mut sets = change_set::compute(&self.state, &ws)?;
        if !held.is_empty() {
            sets.retain(|set| !held.contains(&set.entity));
            check_held_targets(&self.state, &sets, &held)?;
            tracing::debug!(held = held.len(), "Leaving work to the suspended transaction");
        }

        self.phase = FlushPhase::Ordering;
        let ops = commit_order::plan(&self.state, &self.registry, &ws, &sets)?;
        let batches = batch::plan(ops, self.config.batch_size);
        tracing::debug!(
            inserts = ws.inserts.len(),
            removals = ws.removals.len(),
            change_sets = sets.len(),
            batches = batches.len(),
            "Flush planned"
        );
        Ok(FlushPlan {
            ws,
            sets,
            batches,
            held,
        })
    }

    /// Execute inside the active transaction, fenced by a savepoint.
    async fn execute_in_transaction(
        &mut self,
        cx: &Cx,
        plan: &FlushPlan,
        keys: KeyMap,
    ) -> Outcome<Executed, Error> {
        self.flushes += 1;
        let name = format!("flush_{}", self.flushes);
        let Some(tx) = self.tx.as_mut() else {
            return Outcome::Err(Error::transaction(
                datamapper_core::TransactionErrorKind::NoActiveTransaction,
                "transaction ended before flush",
            ));
        };

        match tx.conn.savepoint(cx, &name).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        tx.open_flush = Some(name.clone());
        let conn = &*tx.conn;

        let mut outcome = execute_batches(cx, conn, &self.state, &plan.batches, keys).await;
        let verified = match &outcome {
            Outcome::Ok(executed) => verify_identities(&self.state, &plan.ws, &executed.keys),
            _ => Ok(()),
        };
        if let Err(e) = verified {
            outcome = Outcome::Err(e);
        }

        if matches!(outcome, Outcome::Ok(_)) {
            match conn.release_savepoint(cx, &name).await {
                Outcome::Ok(()) => {
                    tx.open_flush = None;
                    return outcome;
                }
                Outcome::Err(e) => outcome = Outcome::Err(e),
                Outcome::Cancelled(r) => outcome = Outcome::Cancelled(r),
                Outcome::Panicked(p) => outcome = Outcome::Panicked(p),
            }
        }

        self.phase = FlushPhase::RollingBack;
        tracing::debug!(savepoint = %name, "Rolling back flush savepoint");
        if let Outcome::Err(e) = conn.rollback_to_savepoint(cx, &name).await {
            tracing::warn!(error = %e, savepoint = %name, "Rollback to savepoint failed");
        }
        if let Outcome::Err(e) = conn.release_savepoint(cx, &name).await {
            tracing::debug!(error = %e, savepoint = %name, "Release after rollback failed");
        }
        tx.open_flush = None;
        outcome
    }

    /// Execute in a transaction of its own on a pooled connection.
    async fn execute_standalone(
        &mut self,
        cx: &Cx,
        plan: &FlushPlan,
        keys: KeyMap,
    ) -> Outcome<Executed, Error> {
        let conn = match self.pool.acquire(cx).await {
            Outcome::Ok(conn) => conn,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match conn.begin(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let mut outcome = execute_batches(cx, &*conn, &self.state, &plan.batches, keys).await;
        let verified = match &outcome {
            Outcome::Ok(executed) => verify_identities(&self.state, &plan.ws, &executed.keys),
            _ => Ok(()),
        };
        if let Err(e) = verified {
            outcome = Outcome::Err(e);
        }

        if matches!(outcome, Outcome::Ok(_)) {
            self.phase = FlushPhase::Committing;
            match conn.commit(cx).await {
                Outcome::Ok(()) => return outcome,
                Outcome::Err(e) => outcome = Outcome::Err(e),
                Outcome::Cancelled(r) => outcome = Outcome::Cancelled(r),
                Outcome::Panicked(p) => outcome = Outcome::Panicked(p),
            }
        }

        self.phase = FlushPhase::RollingBack;
        if conn.in_transaction() {
            if let Outcome::Err(e) = conn.rollback(cx).await {
                tracing::warn!(error = %e, "Flush rollback failed");
            }
        }
        if let Err(e) = self.events.fire(SessionEvent::AfterRollback) {
            tracing::warn!(error = %e, "after_rollback callback failed");
        }
        outcome
    }

    /// Make the session reflect a successful flush.
    ///
    /// Returns the entities whose rows the flush wrote.
    fn apply(&mut self, plan: &FlushPlan, executed: Executed) -> Result<HashSet<EntityRef>> {
        let FlushPlan { ws, sets, held, .. } = plan;
        let state = &mut self.state;
        let mut written: HashSet<EntityRef> = ws.inserts.iter().copied().collect();

        for r in &ws.inserts {
            let Some(pk) = executed.keys.get(r).cloned() else {
                continue;
            };
            let meta = Arc::clone(&state.tracked(*r)?.meta);
            let key = state.key_for(&meta, pk.clone());
            let t = state.tracked_mut(*r)?;
            for (field, value) in meta.primary_key().zip(pk) {
                t.entity.set_field(&field.name, FieldValue::Scalar(value));
            }
            for (field, value) in executed.generated.get(r).into_iter().flatten() {
                t.entity.set_field(field, FieldValue::Scalar(value.clone()));
            }
            t.state = EntityState::Managed;
            t.scheduled = false;
            t.key = Some(key.clone());
            state.identity.register(key, *r)?;
        }

        for set in sets {
            let t = state.tracked_mut(set.entity)?;
            match set.operation {
                Operation::Create => {
                    // Session-side defaults and initial versions.
                    for change in set.changes.iter().filter(|c| c.kind == ChangeKind::Scalar) {
                        if let ColumnValue::Value(v) = &change.new {
                            if t.entity.scalar(&change.field).is_none_or(Value::is_null) {
                                t.entity.set_field(&change.field, FieldValue::Scalar(v.clone()));
                            }
                        }
                    }
                }
                Operation::Update => {
                    if let (Some(field), Some(next)) = (set.meta.version_field(), &set.next_version)
                    {
                        t.entity.set_field(&field.name, FieldValue::Scalar(next.clone()));
                    }
                }
                Operation::Delete => {}
            }
        }

        let gone: Vec<EntityRef> = ws.gone().collect();
        written.extend(&gone);
        for r in &gone {
            let t = state.tracked_mut(*r)?;
            t.state = EntityState::Detached;
            t.scheduled = false;
            let key = t.key.clone();
            if let Some(key) = key {
                state.identity.forget(&key);
            }
            state.snapshots.forget(*r);
        }
        if !gone.is_empty() {
            for t in &mut state.slots {
                for rel in t.meta.relations.iter().filter(|r| r.is_collection()) {
                    if let Some(c) = t.entity.collection_mut(&rel.name) {
                        for r in &gone {
                            c.forget(*r);
                        }
                    }
                }
            }
        }

        let touched: HashSet<EntityRef> = sets.iter().map(|s| s.entity).collect();
        written.extend(&touched);
        for r in state.refs() {
            let t = state.tracked(r)?;
            if t.state != EntityState::Managed || held.contains(&r) {
                continue;
            }
            let dirty = t
                .meta
                .relations
                .iter()
                .filter_map(|rel| t.entity.collection(&rel.name))
                .any(|c| c.is_dirty());
            if !touched.contains(&r) && !dirty {
                continue;
            }
            let snapshot = state.snapshot_of(r)?;
            state.snapshots.replace(r, snapshot);
            let t = state.tracked_mut(r)?;
            let meta = Arc::clone(&t.meta);
            for rel in meta.relations.iter().filter(|r| r.is_collection()) {
                if let Some(c) = t.entity.collection_mut(&rel.name) {
                    c.clear_deltas();
                }
            }
            written.insert(r);
        }
        Ok(written)
    }
}

/// A write must not depend on an entity left to a suspended transaction.
fn check_held_targets(state: &UnitState, sets: &[ChangeSet], held: &HashSet<EntityRef>) -> Result<()> {
    for set in sets {
        let reference = set.changes.iter().filter_map(|c| c.new.pending());
        let members = set.collections.iter().flat_map(|c| c.added.iter().copied());
        for target in reference.chain(members) {
            if !held.contains(&target) {
                continue;
            }
            if state.tracked(target)?.state == EntityState::New {
                return Err(Error::session(
                    SessionErrorKind::InvalidState,
                    format!(
                        "{} {} refers to {target}, which is pending in the suspended transaction",
                        set.meta.name, set.entity
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// Keys already known before execution: assigned primary keys.
fn prefill_keys(state: &UnitState, ws: &WorkingSet) -> KeyMap {
    ws.inserts
        .iter()
        .filter_map(|r| state.assigned_key(*r).map(|k| (*r, k.into_pk())))
        .collect()
}

/// Newly keyed entities must not collide with the identity map or each other.
fn verify_identities(state: &UnitState, ws: &WorkingSet, keys: &KeyMap) -> Result<()> {
    let mut seen = HashMap::new();
    for r in &ws.inserts {
        let t = state.tracked(*r)?;
        let Some(pk) = keys.get(r) else {
            return Err(Error::session(
                SessionErrorKind::MissingPrimaryKey,
                format!("no primary key was produced for {} {r}", t.meta.name),
            ));
        };
        let key = state.key_for(&t.meta, pk.clone());
        state.identity.check(&key, *r)?;
        if let Some(existing) = seen.insert(key.clone(), *r) {
            return Err(Error::IdentityConflict(IdentityConflictError {
                key,
                existing,
                incoming: *r,
            }));
        }
    }
    Ok(())
}

/// Run every batch in order on `conn`.
async fn execute_batches<C: Connection>(
    cx: &Cx,
    conn: &C,
    state: &UnitState,
    batches: &[Batch],
    mut keys: KeyMap,
) -> Outcome<Executed, Error> {
    let mut executed = Executed::default();
    for (index, batch) in batches.iter().enumerate() {
        if let Some(reason) = cx.cancel_reason() {
            tracing::debug!(batch = index, "Flush cancelled between batches");
            return Outcome::Cancelled(reason);
        }
        let statement = match batch.statement(&keys) {
            Ok(statement) => statement,
            Err(e) => return Outcome::Err(e),
        };
        tracing::debug!(batch = index, rows = statement.row_count(), statement = %statement, "Executing batch");
        let result = match conn.execute(cx, &statement).await {
            Outcome::Ok(result) => result,
            Outcome::Err(e) => return Outcome::Err(attribute(state, batch, &statement, e)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if let Err(e) = record(state, batch, &statement, &result, &mut keys, &mut executed) {
            return Outcome::Err(e);
        }
    }
    executed.keys = keys;
    Outcome::Ok(executed)
}

/// Account for one executed batch and collect generated keys.
fn record(
    state: &UnitState,
    batch: &Batch,
    statement: &Statement,
    result: &ExecResult,
    keys: &mut KeyMap,
    executed: &mut Executed,
) -> Result<()> {
    let affected = usize::try_from(result.affected).unwrap_or(usize::MAX);
    executed.result.statements += 1;

    if batch.versioned() && affected < batch.len() {
        for op in &batch.ops {
            let (PendingOp::Update { version: Some(v), .. } | PendingOp::Delete { version: Some(v), .. }) = op
            else {
                continue;
            };
            let entity = op.entity();
            let t = state.tracked(entity)?;
            let Some(key) = t.key.clone() else {
                continue;
            };
            return Err(lock::lock_failed(entity, key, v.expected.clone(), None));
        }
    }

    match statement {
        Statement::Insert(s) => {
            for (row, op) in batch.ops.iter().enumerate() {
                let PendingOp::Insert { entity, .. } = op else {
                    continue;
                };
                let t = state.tracked(*entity)?;
                let returned = result.returned.get(row);
                let column_value = |column: &str| -> Option<Value> {
                    let written = s.columns.iter().position(|c| c == column);
                    if let Some(v) = written.and_then(|i| s.rows.get(row)?.get(i)) {
                        if !v.is_null() {
                            return Some(v.clone());
                        }
                    }
                    let i = s.returning.iter().position(|c| c == column)?;
                    returned?.get(i).cloned()
                };
                let pk: Option<Vec<Value>> = t
                    .meta
                    .primary_key()
                    .map(|f| column_value(&f.column).map(|v| f.kind.normalize(v)))
                    .collect();
                if let Some(pk) = pk {
                    keys.insert(*entity, pk);
                }
                let generated: Vec<(String, Value)> = s
                    .returning
                    .iter()
                    .filter_map(|column| {
                        let field = t.meta.field_by_column(column)?;
                        let value = column_value(column)?;
                        Some((field.name.clone(), field.kind.normalize(value)))
                    })
                    .collect();
                executed.generated.insert(*entity, generated);
            }
            executed.result.inserted += batch.len();
        }
        Statement::Update(_) => {
            executed.result.updated += batch
                .ops
                .iter()
                .filter(|op| matches!(op, PendingOp::Update { purpose: UpdatePurpose::Change, .. }))
                .count();
        }
        Statement::Delete(_) | Statement::DeleteWhere(_) => executed.result.deleted += affected,
        Statement::Link(_) => executed.result.linked += batch.len(),
        Statement::Unlink(_) => executed.result.unlinked += affected,
    }
    Ok(())
}

/// Turn a driver constraint error into one naming the entity behind the row.
fn attribute(state: &UnitState, batch: &Batch, statement: &Statement, error: Error) -> Error {
    let Error::Query(q) = error else {
        return error;
    };
    let Some(kind) = q.constraint.filter(|_| q.kind == QueryErrorKind::Constraint) else {
        return Error::Query(q);
    };
    let op = match q.row {
        Some(row) => batch.ops.get(row),
        None if batch.len() == 1 => batch.ops.first(),
        None => None,
    };
    let entity = op.map(PendingOp::entity);
    let tracked = entity.and_then(|r| state.tracked(r).ok());
    let key = entity.and_then(|r| {
        let t = state.tracked(r).ok()?;
        t.key.clone().or_else(|| state.assigned_key(r))
    });
    tracing::warn!(
        table = %statement.table(),
        entity = ?entity,
        constraint = ?kind,
        "Constraint violation during flush"
    );
    Error::ConstraintViolation(ConstraintViolationError {
        kind,
        entity,
        entity_type: tracked.map(|t| t.meta.name.clone()),
        key,
        table: statement.table().to_string(),
        message: q.message.clone(),
        source: Some(Box::new(q)),
    })
}
