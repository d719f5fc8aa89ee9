//! Transaction propagation and scopes.
//!
//! A session holds at most one active transaction. Scopes are opened with a
//! [`Propagation`] and closed strictly LIFO; each records a checkpoint of the
//! session so a rolled-back scope puts entities, the identity map and
//! snapshots back where they were when it started.
//!
//! A scope that suspends the active transaction (`RequiresNew`,
//! `NotSupported`) holds back the work pending when it opened: its flushes
//! leave those entities to the suspended transaction. What it writes
//! durably is carried into the checkpoints of the scopes around it.

use crate::entity::EntityState;
use crate::state::UnitState;
use crate::{Session, SessionEvent};
use asupersync::{Cx, Outcome};
use datamapper_core::{Connection, Driver, EntityRef, Error, TransactionErrorKind};
use datamapper_pool::PooledConnection;
use serde::Serialize;
use std::collections::HashSet;

/// How a scope relates to a transaction that may already be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Propagation {
    /// Join the active transaction or start one
    #[default]
    Required,
    /// Suspend the active transaction and start a fresh one
    RequiresNew,
    /// Join the active transaction; fail without one
    Mandatory,
    /// Run without a transaction; fail if one is active
    Never,
    /// Join the active transaction or run without one
    Supports,
    /// Suspend the active transaction and run without one
    NotSupported,
    /// Savepoint inside the active transaction, or start one
    Nested,
}

/// What a scope did when it started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ScopeKind {
    /// Began the transaction and owns its outcome
    Root,
    /// Participates in a transaction started by an outer scope
    Joined,
    /// Fenced by the named savepoint
    Savepoint(String),
    /// Runs outside any transaction
    NonTransactional,
}

impl ScopeKind {
    pub fn is_transactional(&self) -> bool {
        !matches!(self, ScopeKind::NonTransactional)
    }
}

/// Transaction bound to a pooled connection.
pub(crate) struct ActiveTransaction<D: Driver> {
    pub conn: PooledConnection<D>,
    pub rollback_only: bool,
    /// Savepoints opened so far, used to name the next one
    pub savepoints: u64,
    /// Savepoint of a flush that has not released or rolled it back yet
    pub open_flush: Option<String>,
}

impl<D: Driver> ActiveTransaction<D> {
    fn new(conn: PooledConnection<D>) -> Self {
        Self {
            conn,
            rollback_only: false,
            savepoints: 0,
            open_flush: None,
        }
    }
}

/// A transaction taken off the session by [`Session::suspend`].
///
/// Dropping it without resuming rolls the transaction back when the
/// connection is discarded.
pub struct SuspendedTransaction<D: Driver> {
    tx: ActiveTransaction<D>,
}

impl<D: Driver> std::fmt::Debug for SuspendedTransaction<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspendedTransaction")
            .field("rollback_only", &self.tx.rollback_only)
            .field("savepoints", &self.tx.savepoints)
            .finish()
    }
}

pub(crate) struct Scope<D: Driver> {
    id: u64,
    kind: ScopeKind,
    checkpoint: UnitState,
    /// Transaction set aside by `RequiresNew` or `NotSupported`
    suspended: Option<ActiveTransaction<D>>,
    /// Entities left to the suspended transaction
    held: Option<HashSet<EntityRef>>,
    /// Entities flushed in this scope's transaction, durable on its commit
    flushed: HashSet<EntityRef>,
}

/// Handle to an open scope; pass it back to commit or roll back.
#[must_use = "a scope must be committed or rolled back"]
#[derive(Debug)]
pub struct ScopeGuard {
    id: u64,
    propagation: Propagation,
    kind: ScopeKind,
}

impl ScopeGuard {
    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    pub fn kind(&self) -> &ScopeKind {
        &self.kind
    }
}

fn tx_error(kind: TransactionErrorKind, message: impl Into<String>) -> Error {
    Error::transaction(kind, message)
}

impl<D: Driver> Session<D> {
    // ========================================================================
    // Transaction state
    // ========================================================================

    /// Is a transaction active on this session?
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Has a joined scope doomed the active transaction?
    pub fn is_rollback_only(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.rollback_only)
    }

    /// Number of open scopes.
    pub fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    /// Entities a suspending scope leaves to the suspended transaction.
    pub(crate) fn held(&self) -> Option<&HashSet<EntityRef>> {
        self.scopes.iter().rev().find_map(|s| s.held.as_ref())
    }

    fn pending_entities(&self) -> HashSet<EntityRef> {
        self.state
            .iter()
            .filter(|(r, t)| t.state != EntityState::Detached && self.is_dirty(*r).unwrap_or(true))
            .map(|(r, _)| r)
            .collect()
    }

    /// Note what a flush wrote.
    ///
    /// Without a transaction it is durable already; inside one it becomes
    /// durable when the transaction commits.
    pub(crate) fn record_written(&mut self, written: HashSet<EntityRef>) {
        if self.tx.is_none() {
            self.settle(&written);
        } else if let Some(scope) = self.scopes.last_mut() {
            scope.flushed.extend(written);
        }
    }

    /// Carry durable writes into every open scope's checkpoint.
    fn settle(&mut self, written: &HashSet<EntityRef>) {
        if written.is_empty() {
            return;
        }
        for scope in &mut self.scopes {
            scope.checkpoint.adopt(&self.state, written);
        }
        tracing::debug!(entities = written.len(), scopes = self.scopes.len(), "Durable writes settled");
    }

    /// Roll back a flush savepoint that a cancelled or dropped flush left open.
    pub(crate) async fn discard_open_flush(&mut self, cx: &Cx) {
        let Some(tx) = self.tx.as_mut() else {
            return;
        };
        let Some(name) = tx.open_flush.take() else {
            return;
        };
        tracing::warn!(savepoint = %name, "Rolling back savepoint of an abandoned flush");
        if let Outcome::Err(e) = tx.conn.rollback_to_savepoint(cx, &name).await {
            tracing::warn!(error = %e, savepoint = %name, "Rollback to savepoint failed");
        }
        if let Outcome::Err(e) = tx.conn.release_savepoint(cx, &name).await {
            tracing::debug!(error = %e, savepoint = %name, "Release after rollback failed");
        }
    }

    async fn open_transaction(&self, cx: &Cx) -> Outcome<ActiveTransaction<D>, Error> {
        let conn = match self.pool.acquire(cx).await {
            Outcome::Ok(conn) => conn,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match conn.begin(cx).await {
            Outcome::Ok(()) => Outcome::Ok(ActiveTransaction::new(conn)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    // ========================================================================
    // Scopes
    // ========================================================================

    /// Open a scope with the given propagation.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn begin_scope(
        &mut self,
        cx: &Cx,
        propagation: Propagation,
    ) -> Outcome<ScopeGuard, Error> {
        let checkpoint = self.state.clone();
        let mut suspended = None;
        let mut held = None;
        let kind = match (propagation, self.tx.is_some()) {
            (Propagation::Required | Propagation::Mandatory | Propagation::Supports, true) => {
                ScopeKind::Joined
            }
            (Propagation::Required | Propagation::RequiresNew | Propagation::Nested, false) => {
                match self.open_transaction(cx).await {
                    Outcome::Ok(tx) => self.tx = Some(tx),
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                ScopeKind::Root
            }
            (Propagation::RequiresNew, true) => {
                let tx = match self.open_transaction(cx).await {
                    Outcome::Ok(tx) => tx,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                held = Some(self.pending_entities());
                suspended = self.tx.replace(tx);
                ScopeKind::Root
            }
            (Propagation::Mandatory, false) => {
                return Outcome::Err(tx_error(
                    TransactionErrorKind::NoActiveTransaction,
                    "a transaction is required but none is active",
                ));
            }
            (Propagation::Never, true) => {
                return Outcome::Err(tx_error(
                    TransactionErrorKind::ExistingTransaction,
                    "a transaction is active but the scope must run without one",
                ));
            }
            (Propagation::Never | Propagation::Supports | Propagation::NotSupported, false) => {
                ScopeKind::NonTransactional
            }
            (Propagation::NotSupported, true) => {
                held = Some(self.pending_entities());
                suspended = self.tx.take();
                ScopeKind::NonTransactional
            }
            (Propagation::Nested, true) => {
                let Some(tx) = self.tx.as_mut() else {
                    return Outcome::Err(tx_error(
                        TransactionErrorKind::NoActiveTransaction,
                        "transaction ended while opening a savepoint",
                    ));
                };
                tx.savepoints += 1;
                let name = format!("sp_{}", tx.savepoints);
                match tx.conn.savepoint(cx, &name).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                ScopeKind::Savepoint(name)
            }
        };

        self.next_scope += 1;
        let id = self.next_scope;
        tracing::debug!(scope = id, kind = ?kind, depth = self.scopes.len() + 1, "Scope started");
        self.scopes.push(Scope {
            id,
            kind: kind.clone(),
            checkpoint,
            suspended,
            held,
            flushed: HashSet::new(),
        });
        Outcome::Ok(ScopeGuard {
            id,
            propagation,
            kind,
        })
    }

    fn check_innermost(&self, guard: &ScopeGuard) -> Result<(), Error> {
        match self.scopes.last() {
            Some(scope) if scope.id == guard.id => Ok(()),
            Some(scope) => Err(tx_error(
                TransactionErrorKind::ScopeMismatch,
                format!(
                    "scope {} closed while scope {} is innermost",
                    guard.id, scope.id
                ),
            )),
            None => Err(tx_error(
                TransactionErrorKind::ScopeMismatch,
                format!("scope {} is not open", guard.id),
            )),
        }
    }

    fn take_scope(&mut self, guard: &ScopeGuard) -> Result<Scope<D>, Error> {
        self.check_innermost(guard)?;
        self.scopes.pop().ok_or_else(|| {
            tx_error(TransactionErrorKind::ScopeMismatch, "no open scope")
        })
    }

    /// Close the innermost scope, flushing pending changes first.
    ///
    /// A root scope commits; a savepoint scope releases its savepoint. If the
    /// flush or the commit fails the scope is rolled back instead.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(scope = guard.id))]
    pub async fn commit_scope(&mut self, cx: &Cx, guard: ScopeGuard) -> Outcome<(), Error> {
        if let Err(e) = self.check_innermost(&guard) {
            return Outcome::Err(e);
        }

        // Flush while the scope is still open so its held entities stay out.
        let flushed = if guard.kind.is_transactional() {
            self.flush(cx).await
        } else {
            Outcome::Ok(crate::FlushResult::default())
        };
        let scope = match self.take_scope(&guard) {
            Ok(scope) => scope,
            Err(e) => return Outcome::Err(e),
        };
        match flushed {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => {
                self.abort_scope(cx, scope).await;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.abort_scope(cx, scope).await;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.abort_scope(cx, scope).await;
                return Outcome::Panicked(p);
            }
        }

        match scope.kind.clone() {
            ScopeKind::Root => {
                if self.is_rollback_only() {
                    self.abort_scope(cx, scope).await;
                    return Outcome::Err(tx_error(
                        TransactionErrorKind::RollbackOnly,
                        "transaction was marked rollback-only by an inner scope",
                    ));
                }
                if let Err(e) = self.events.fire(SessionEvent::BeforeCommit) {
                    self.abort_scope(cx, scope).await;
                    return Outcome::Err(e);
                }
                let Some(tx) = self.tx.take() else {
                    return Outcome::Err(tx_error(
                        TransactionErrorKind::NoActiveTransaction,
                        "transaction ended before commit",
                    ));
                };
                let committed = tx.conn.commit(cx).await;
                if !matches!(committed, Outcome::Ok(())) {
                    self.tx = Some(tx);
                    self.abort_scope(cx, scope).await;
                    return committed;
                }
                drop(tx);
                self.tx = scope.suspended;
                self.settle(&scope.flushed);
                tracing::debug!(scope = scope.id, "Transaction committed");
                if let Err(e) = self.events.fire(SessionEvent::AfterCommit) {
                    return Outcome::Err(e);
                }
            }
            ScopeKind::Savepoint(name) => {
                let released = match self.tx.as_ref() {
                    Some(tx) => tx.conn.release_savepoint(cx, &name).await,
                    None => Outcome::Err(tx_error(
                        TransactionErrorKind::SavepointNotFound,
                        format!("savepoint {name} has no transaction"),
                    )),
                };
                match released {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => {
                        self.abort_scope(cx, scope).await;
                        return Outcome::Err(e);
                    }
                    Outcome::Cancelled(r) => {
                        self.abort_scope(cx, scope).await;
                        return Outcome::Cancelled(r);
                    }
                    Outcome::Panicked(p) => {
                        self.abort_scope(cx, scope).await;
                        return Outcome::Panicked(p);
                    }
                }
                self.hand_up(scope.flushed);
            }
            ScopeKind::Joined => self.hand_up(scope.flushed),
            ScopeKind::NonTransactional => {
                if scope.suspended.is_some() {
                    self.tx = scope.suspended;
                }
            }
        }
        Outcome::Ok(())
    }

    /// Pass a closed scope's flushed entities to the scope around it.
    fn hand_up(&mut self, flushed: HashSet<EntityRef>) {
        if let Some(parent) = self.scopes.last_mut() {
            parent.flushed.extend(flushed);
        }
    }

    /// Roll back the innermost scope and restore its checkpoint.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(scope = guard.id))]
    pub async fn rollback_scope(&mut self, cx: &Cx, guard: ScopeGuard) -> Outcome<(), Error> {
        let scope = match self.take_scope(&guard) {
            Ok(scope) => scope,
            Err(e) => return Outcome::Err(e),
        };
        self.abort_scope(cx, scope).await;
        Outcome::Ok(())
    }

    /// Undo a scope that has already been popped. Driver failures are logged;
    /// the connection is discarded if its transaction could not be ended.
    async fn abort_scope(&mut self, cx: &Cx, scope: Scope<D>) {
        self.discard_open_flush(cx).await;
        match scope.kind.clone() {
            ScopeKind::Root => {
                if let Some(tx) = self.tx.take() {
                    if let Outcome::Err(e) = tx.conn.rollback(cx).await {
                        tracing::warn!(error = %e, scope = scope.id, "Transaction rollback failed");
                    }
                }
                self.tx = scope.suspended;
            }
            ScopeKind::Joined => {
                if let Some(tx) = self.tx.as_mut() {
                    tx.rollback_only = true;
                }
            }
            ScopeKind::Savepoint(name) => {
                if let Some(tx) = self.tx.as_ref() {
                    if let Outcome::Err(e) = tx.conn.rollback_to_savepoint(cx, &name).await {
                        tracing::warn!(error = %e, savepoint = %name, "Rollback to savepoint failed");
                    }
                    if let Outcome::Err(e) = tx.conn.release_savepoint(cx, &name).await {
                        tracing::debug!(error = %e, savepoint = %name, "Release after rollback failed");
                    }
                }
            }
            ScopeKind::NonTransactional => {
                if scope.suspended.is_some() {
                    self.tx = scope.suspended;
                }
                tracing::debug!(scope = scope.id, "Non-transactional scope closed without rollback");
                return;
            }
        }
        self.state = scope.checkpoint;
        tracing::debug!(scope = scope.id, kind = ?scope.kind, "Scope rolled back");
        if let Err(e) = self.events.fire(SessionEvent::AfterRollback) {
            tracing::warn!(error = %e, "after_rollback callback failed");
        }
    }

    /// Run `f` inside a scope: commit when it returns `Ok`, roll back otherwise.
    ///
    /// Scopes `f` opened and left open are rolled back first.
    pub async fn transactional<T, F>(
        &mut self,
        cx: &Cx,
        propagation: Propagation,
        f: F,
    ) -> Outcome<T, Error>
    where
        F: AsyncFnOnce(&mut Self) -> Outcome<T, Error>,
    {
        let guard = match self.begin_scope(cx, propagation).await {
            Outcome::Ok(guard) => guard,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let depth = self.scopes.len();
        let outcome = f(self).await;

        while self.scopes.len() > depth {
            tracing::warn!(depth = self.scopes.len(), "Rolling back scope left open");
            if let Some(scope) = self.scopes.pop() {
                self.abort_scope(cx, scope).await;
            }
        }

        match outcome {
            Outcome::Ok(value) => match self.commit_scope(cx, guard).await {
                Outcome::Ok(()) => Outcome::Ok(value),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            },
            failed => {
                if let Outcome::Err(e) = self.rollback_scope(cx, guard).await {
                    tracing::warn!(error = %e, "Scope rollback failed");
                }
                failed
            }
        }
    }

    /// Roll back every open scope, innermost first.
    ///
    /// Recovers a session whose guards were lost or closed out of order.
    pub async fn rollback_all(&mut self, cx: &Cx) {
        while let Some(scope) = self.scopes.pop() {
            self.abort_scope(cx, scope).await;
        }
    }

    // ========================================================================
    // Suspend / resume
    // ========================================================================

    /// Detach the active transaction so work can run outside it.
    pub fn suspend(&mut self) -> Result<SuspendedTransaction<D>, Error> {
        match self.tx.take() {
            Some(tx) => {
                tracing::debug!("Transaction suspended");
                Ok(SuspendedTransaction { tx })
            }
            None => Err(tx_error(
                TransactionErrorKind::NoActiveTransaction,
                "no transaction to suspend",
            )),
        }
    }

    /// Reinstate a suspended transaction.
    ///
    /// Fails with `AlreadyActive` if another transaction was started in the
    /// meantime; the suspended one is then dropped and rolled back.
    pub fn resume(&mut self, suspended: SuspendedTransaction<D>) -> Result<(), Error> {
        if self.tx.is_some() {
            return Err(tx_error(
                TransactionErrorKind::AlreadyActive,
                "cannot resume while another transaction is active",
            ));
        }
        self.tx = Some(suspended.tx);
        tracing::debug!("Transaction resumed");
        Ok(())
    }
}
