//! Unit-of-Work session for datamapper.
//!
//! `datamapper-session` tracks entity instances between the moment they are
//! loaded or created and the moment their changes reach the database.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one instance per row and schema within a session.
//! - **Change tracking**: snapshots taken at load time are diffed at flush.
//! - **Commit ordering**: inserts parents first, deletes children first, and
//!   breaks foreign-key cycles with a null-then-update pass.
//! - **Transactional safety**: a flush is all-or-nothing; scopes nest via
//!   savepoints and roll the session back together with the database.
//!
//! Entities live in an arena owned by the [`Session`]; callers hold
//! [`EntityRef`] handles instead of references, so relations never form
//! pointer cycles and a handle from another session is rejected.
//!
//! # Example
//!
//! ```ignore
//! let mut session = manager.fork(ForkOptions::default());
//!
//! let author = session.create(Entity::new("Author").with("name", "Le Guin"))?;
//! let book = session.create(
//!     Entity::new("Book")
//!         .with("title", "The Dispossessed")
//!         .with_ref("author", author),
//! )?;
//!
//! // Parents are inserted before children, in as few statements as possible.
//! session.flush(&cx).await;
//! ```

pub mod batch;
pub mod change_set;
pub mod commit_order;
pub mod entity;
pub mod flush;
pub mod identity_map;
pub mod lock;
pub mod snapshot;
pub mod transaction;

mod cascade;
mod state;

pub use batch::Batch;
pub use change_set::{ChangeKind, ChangeSet, CollectionChange, ColumnValue, FieldChange, Operation};
pub use commit_order::{PendingOp, UpdatePurpose, VersionCheck};
pub use entity::{Collection, CollectionState, Entity, EntityState, FieldValue, Reference};
pub use flush::{FlushPhase, FlushResult};
pub use identity_map::IdentityMap;
pub use snapshot::{Snapshot, SnapshotStore};
pub use transaction::{Propagation, ScopeGuard, ScopeKind, SuspendedTransaction};

use crate::state::UnitState;
use crate::transaction::{ActiveTransaction, Scope};
use asupersync::{Cx, Outcome};
use datamapper_core::{
    Cascade, Connection, Driver, EntityMeta, EntityRef, Error, FetchRequest, Filter,
    IdentityConflictError, IdentityKey, MetadataError, MetadataErrorKind, MetadataProvider,
    MetadataRegistry, RelationKind, RelationMeta, Row, SessionErrorKind, TableRef, Value,
};
use datamapper_pool::Pool;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments and return `Result<(), Error>`.
/// Returning `Err` aborts the operation (e.g., prevents commit).
type SessionEventFn = Box<dyn FnMut() -> Result<(), Error> + Send>;

/// Holds registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    #[allow(clippy::result_large_err)]
    fn fire(&mut self, event: SessionEvent) -> Result<(), Error> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush computes pending changes.
    BeforeFlush,
    /// Fired after flush applied its results to the session.
    AfterFlush,
    /// Fired before a root scope commits (after its flush).
    BeforeCommit,
    /// Fired after a root scope committed.
    AfterCommit,
    /// Fired after a flush or a scope was rolled back.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum number of rows in one batched statement.
    pub batch_size: usize,
    /// Whether `create` also schedules the entity for insertion.
    pub persist_on_create: bool,
    /// Whether to flush before `find_by` queries.
    pub auto_flush: bool,
    /// Schema for entities that do not declare their own.
    pub default_schema: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batch_size: 300,
            persist_on_create: true,
            auto_flush: false,
            default_schema: None,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    #[must_use]
    pub fn persist_on_create(mut self, value: bool) -> Self {
        self.persist_on_create = value;
        self
    }

    #[must_use]
    pub fn auto_flush(mut self, value: bool) -> Self {
        self.auto_flush = value;
        self
    }

    #[must_use]
    pub fn default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = Some(schema.into());
        self
    }
}

/// Options for [`Session::fork`].
#[derive(Debug, Clone)]
pub struct ForkOptions {
    /// Start with an empty session instead of a copy of the parent's state.
    pub clear: bool,
    /// Schema for the fork; only honored together with `clear`.
    pub schema: Option<String>,
}

impl Default for ForkOptions {
    fn default() -> Self {
        Self {
            clear: true,
            schema: None,
        }
    }
}

impl ForkOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn clear(mut self, value: bool) -> Self {
        self.clear = value;
        self
    }

    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }
}

/// Work a flush would do right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    /// Entities that would be inserted.
    pub new: usize,
    /// Managed entities with changes.
    pub dirty: usize,
    /// Entities that would be deleted.
    pub deleted: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }
}

/// Debug information about session state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDebugInfo {
    /// Generation stamped into every handle of this session.
    pub generation: u64,
    /// Entities in the arena that are not detached.
    pub tracked: usize,
    /// Arena slots, detached entities included. Only `clear` frees them.
    pub slots: usize,
    /// Managed entities.
    pub managed: usize,
    /// Entries in the identity map.
    pub identities: usize,
    /// Stored snapshots.
    pub snapshots: usize,
    /// Pending work.
    pub pending: PendingCounts,
    /// Whether in a transaction.
    pub in_transaction: bool,
    /// Open transaction scopes.
    pub scope_depth: usize,
    pub phase: FlushPhase,
}

impl SessionDebugInfo {
    /// Render as JSON for logs and diagnostics.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

fn invalid_state(message: impl Into<String>) -> Error {
    Error::session(SessionErrorKind::InvalidState, message)
}

fn unknown_member(kind: MetadataErrorKind, meta: &EntityMeta, name: &str) -> Error {
    Error::Metadata(MetadataError {
        kind,
        entity: Some(meta.name.clone()),
        message: format!("'{name}' is not declared on {}", meta.name),
    })
}

/// Apply one membership change without recording a no-op delta.
fn step(collection: &mut Collection, member: EntityRef, add: bool) {
    match (add, collection.contains(member)) {
        (true, false) => collection.add(member),
        (false, true) => collection.remove(member),
        // Unloaded: the member may still be in the database.
        (false, false) if !collection.is_loaded() => collection.remove(member),
        _ => {}
    }
}

// ============================================================================
// Session
// ============================================================================

/// A Unit-of-Work session.
///
/// Sessions are single-task: entities, the identity map and snapshots are
/// owned exclusively. Use [`Session::fork`] for concurrent work sharing the
/// same registry and pool.
pub struct Session<D: Driver> {
    registry: Arc<MetadataRegistry>,
    pool: Pool<D>,
    config: SessionConfig,
    state: UnitState,
    phase: FlushPhase,
    /// Flushes run inside a transaction, used to name their savepoints
    flushes: u64,
    events: SessionEventCallbacks,
    tx: Option<ActiveTransaction<D>>,
    scopes: Vec<Scope<D>>,
    next_scope: u64,
}

impl<D: Driver> std::fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("generation", &self.state.generation)
            .field("schema", &self.state.schema)
            .field("entities", &self.state.slots.len())
            .field("in_transaction", &self.tx.is_some())
            .field("scopes", &self.scopes.len())
            .field("phase", &self.phase)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl<D: Driver> Session<D> {
    /// Create an empty session.
    pub fn new(registry: Arc<MetadataRegistry>, pool: Pool<D>, config: SessionConfig) -> Self {
        let state = UnitState::new(next_generation(), config.default_schema.clone());
        Self::with_state(registry, pool, config, state)
    }

    fn with_state(
        registry: Arc<MetadataRegistry>,
        pool: Pool<D>,
        config: SessionConfig,
        state: UnitState,
    ) -> Self {
        tracing::debug!(session = state.generation, schema = ?state.schema, "Session opened");
        Self {
            registry,
            pool,
            config,
            state,
            phase: FlushPhase::Idle,
            flushes: 0,
            events: SessionEventCallbacks::default(),
            tx: None,
            scopes: Vec::new(),
            next_scope: 0,
        }
    }

    /// Generation stamped into this session's handles.
    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Pool<D> {
        &self.pool
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Default schema of this session.
    pub fn schema(&self) -> Option<&str> {
        self.state.schema()
    }

    pub fn flush_phase(&self) -> FlushPhase {
        self.phase
    }

    // ========================================================================
    // Event Callbacks
    // ========================================================================

    /// Register a callback to run before each flush.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.events.before_flush.push(Box::new(f));
    }

    /// Register a callback to run after each successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.events.after_flush.push(Box::new(f));
    }

    /// Register a callback to run before a root scope commits.
    ///
    /// Returning `Err` rolls the scope back instead.
    pub fn on_before_commit(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.events.before_commit.push(Box::new(f));
    }

    pub fn on_after_commit(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.events.after_commit.push(Box::new(f));
    }

    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.events.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    fn meta_of(&self, entity: &str) -> Result<Arc<EntityMeta>, Error> {
        self.registry.require(entity).map(Arc::clone)
    }

    fn relation_of(&self, r: EntityRef, relation: &str) -> Result<RelationMeta, Error> {
        let t = self.state.tracked(r)?;
        t.meta
            .relation_named(relation)
            .cloned()
            .ok_or_else(|| unknown_member(MetadataErrorKind::UnknownRelation, &t.meta, relation))
    }

    /// Fail unless the entity may still be modified.
    fn check_writable(&self, r: EntityRef) -> Result<(), Error> {
        let t = self.state.tracked(r)?;
        match t.state {
            EntityState::New | EntityState::Managed => Ok(()),
            state => Err(invalid_state(format!(
                "{} {r} is {state:?} and cannot be modified",
                t.meta.name
            ))),
        }
    }

    /// Every field must be declared and hold the matching kind of slot, and
    /// every handle must belong to this session.
    fn validate(&self, meta: &EntityMeta, entity: &Entity) -> Result<(), Error> {
        for (name, value) in entity.fields() {
            let matches = match value {
                FieldValue::Scalar(_) => meta.field_named(name).is_some(),
                FieldValue::Reference(_) => {
                    meta.relation_named(name).is_some_and(|r| !r.is_collection())
                }
                FieldValue::Collection(_) => meta
                    .relation_named(name)
                    .is_some_and(RelationMeta::is_collection),
            };
            if !matches {
                if meta.field_named(name).is_none() && meta.relation_named(name).is_none() {
                    return Err(unknown_member(MetadataErrorKind::UnknownField, meta, name));
                }
                return Err(invalid_state(format!(
                    "field '{name}' of {} holds the wrong kind of value",
                    meta.name
                )));
            }
            let handles: Vec<EntityRef> = match value {
                FieldValue::Reference(Reference::Loaded(r)) => vec![*r],
                FieldValue::Collection(c) => c
                    .members()
                    .unwrap_or_default()
                    .iter()
                    .chain(c.added())
                    .copied()
                    .collect(),
                _ => Vec::new(),
            };
            for h in handles {
                self.state.tracked(h)?;
            }
        }
        Ok(())
    }

    /// Relation targets held by `r`, loaded ones only.
    fn related(&self, r: EntityRef) -> Result<Vec<(RelationMeta, EntityRef)>, Error> {
        let t = self.state.tracked(r)?;
        let mut out = Vec::new();
        for rel in &t.meta.relations {
            if rel.is_collection() {
                if let Some(c) = t.entity.collection(&rel.name) {
                    for m in c.members().unwrap_or_default().iter().chain(c.added()) {
                        if !out.iter().any(|(n, x): &(RelationMeta, EntityRef)| n.name == rel.name && x == m) {
                            out.push((rel.clone(), *m));
                        }
                    }
                }
            } else if let Some(Reference::Loaded(x)) = t.entity.reference(&rel.name) {
                out.push((rel.clone(), *x));
            }
        }
        Ok(out)
    }

    fn pending_with_key(&self, key: &IdentityKey, except: EntityRef) -> Option<EntityRef> {
        self.state
            .iter()
            .filter(|(o, t)| *o != except && t.state == EntityState::New)
            .find(|(o, _)| self.state.assigned_key(*o).as_ref() == Some(key))
            .map(|(o, _)| o)
    }

    /// Start tracking a new entity.
    ///
    /// The entity is scheduled for insertion unless `persist_on_create` is
    /// off. An assigned primary key already claimed by another instance of
    /// this session fails with `IdentityConflict`.
    pub fn create(&mut self, entity: Entity) -> Result<EntityRef, Error> {
        let meta = self.meta_of(entity.name())?;
        self.validate(&meta, &entity)?;
        let mut entity = entity;
        UnitState::complete_fields(&mut entity, &meta, true);
        let r = self.state.insert(entity, Arc::clone(&meta), EntityState::New);

        if let Some(key) = self.state.assigned_key(r) {
            let existing = self
                .state
                .identity
                .lookup(&key)
                .or_else(|| self.pending_with_key(&key, r));
            if let Some(existing) = existing {
                self.state.tracked_mut(r)?.state = EntityState::Detached;
                tracing::warn!(key = %key, existing = %existing, incoming = %r, "Identity conflict on create");
                return Err(Error::IdentityConflict(IdentityConflictError {
                    key,
                    existing,
                    incoming: r,
                }));
            }
        }

        for (rel, target) in self.related(r)? {
            self.link_inverse(r, &rel, target, true)?;
        }
        if self.config.persist_on_create {
            self.persist(r)?;
        }
        tracing::debug!(entity = %meta.name, handle = %r, "Entity created");
        Ok(r)
    }

    /// Schedule an entity (and its persist cascade) for insertion.
    ///
    /// A removed entity becomes managed again.
    #[tracing::instrument(level = "debug", skip(self), fields(session = self.state.generation))]
    pub fn persist(&mut self, r: EntityRef) -> Result<(), Error> {
        let t = self.state.tracked(r)?;
        if t.state == EntityState::Detached {
            return Err(invalid_state(format!(
                "{} {r} is detached; merge it instead",
                t.meta.name
            )));
        }
        for reached in cascade::persist_closure(&self.state, &[r])? {
            let t = self.state.tracked_mut(reached)?;
            match t.state {
                EntityState::New => t.scheduled = true,
                EntityState::Removed if t.key.is_some() => t.state = EntityState::Managed,
                EntityState::Removed => {
                    t.state = EntityState::New;
                    t.scheduled = true;
                }
                EntityState::Managed | EntityState::Detached => {}
            }
        }
        tracing::trace!(handle = %r, "Entity persisted");
        Ok(())
    }

    /// Schedule an entity (and its remove cascade) for deletion.
    #[tracing::instrument(level = "debug", skip(self), fields(session = self.state.generation))]
    pub fn remove(&mut self, r: EntityRef) -> Result<(), Error> {
        let t = self.state.tracked(r)?;
        if t.state == EntityState::Detached {
            return Err(invalid_state(format!(
                "{} {r} is detached and cannot be removed",
                t.meta.name
            )));
        }
        let closure = cascade::remove_closure(&self.state, &self.registry, &[r])?;
        for reached in closure.reached {
            let t = self.state.tracked_mut(reached)?;
            if t.state != EntityState::Detached {
                t.state = EntityState::Removed;
                t.scheduled = false;
            }
        }
        tracing::trace!(handle = %r, "Entity removed");
        Ok(())
    }

    /// Stop tracking an entity. Its pending changes are discarded.
    pub fn detach(&mut self, r: EntityRef) -> Result<(), Error> {
        let t = self.state.tracked_mut(r)?;
        if t.state == EntityState::Detached {
            return Ok(());
        }
        t.state = EntityState::Detached;
        t.scheduled = false;
        let key = t.key.clone();
        if let Some(key) = key {
            if self.state.identity.lookup(&key) == Some(r) {
                self.state.identity.forget(&key);
            }
        }
        self.state.snapshots.forget(r);
        Ok(())
    }

    /// Drop every tracked entity. Existing handles become foreign.
    ///
    /// Detached and deleted entities keep their arena slot until this is
    /// called, and flushes walk every slot; reuse a long-lived session
    /// across units of work only with a `clear` in between.
    pub fn clear(&mut self) {
        let schema = self.state.schema.clone();
        self.state = UnitState::new(next_generation(), schema);
        tracing::debug!(session = self.state.generation, "Session cleared");
    }

    /// A new session sharing this one's registry and pool.
    ///
    /// With `clear` the fork starts empty, in `schema` when given. Otherwise
    /// it starts with a copy of this session's entities, keeping this
    /// session's schema; handles are reissued under the fork's generation
    /// with the same slots.
    pub fn fork(&self, options: ForkOptions) -> Session<D> {
        let ForkOptions { clear, schema } = options;
        let generation = next_generation();
        let state = if clear {
            UnitState::new(generation, schema.or_else(|| self.state.schema.clone()))
        } else {
            if schema.is_some() && schema != self.state.schema {
                tracing::warn!(
                    requested = ?schema,
                    schema = ?self.state.schema,
                    "Copied fork keeps the parent schema"
                );
            }
            self.state.rebase(generation)
        };
        let mut config = self.config.clone();
        config.default_schema = state.schema.clone();
        Session::with_state(Arc::clone(&self.registry), self.pool.clone(), config, state)
    }

    // ========================================================================
    // Field Access
    // ========================================================================

    pub fn get(&self, r: EntityRef) -> Result<&Entity, Error> {
        Ok(&self.state.tracked(r)?.entity)
    }

    /// Mutable access to a new or managed entity.
    ///
    /// Scalar edits made here are picked up by the next flush. Relations
    /// should go through [`Session::set_reference`] and the collection
    /// methods so both sides stay in step.
    pub fn get_mut(&mut self, r: EntityRef) -> Result<&mut Entity, Error> {
        self.check_writable(r)?;
        Ok(&mut self.state.tracked_mut(r)?.entity)
    }

    /// Set a scalar field.
    pub fn set(&mut self, r: EntityRef, field: &str, value: impl Into<Value>) -> Result<(), Error> {
        self.check_writable(r)?;
        let t = self.state.tracked_mut(r)?;
        let Some(meta_field) = t.meta.field_named(field) else {
            return Err(unknown_member(MetadataErrorKind::UnknownField, &t.meta, field));
        };
        if meta_field.primary_key && t.key.is_some() {
            return Err(invalid_state(format!(
                "primary key field '{field}' of a persisted {} cannot change",
                t.meta.name
            )));
        }
        t.entity.set_field(field, FieldValue::Scalar(value.into()));
        Ok(())
    }

    /// Point a to-one relation at `target`, or clear it with `None`.
    pub fn set_reference(
        &mut self,
        r: EntityRef,
        relation: &str,
        target: Option<EntityRef>,
    ) -> Result<(), Error> {
        self.check_writable(r)?;
        let rel = self.relation_of(r, relation)?;
        if rel.is_collection() {
            return Err(invalid_state(format!("'{relation}' is a collection")));
        }
        if let Some(x) = target {
            self.check_target(&rel, x)?;
        }
        let previous = {
            let t = self.state.tracked(r)?;
            self.state.referenced(t, relation)
        };
        if previous == target {
            if let Some(x) = target {
                self.state
                    .tracked_mut(r)?
                    .entity
                    .set_field(relation, FieldValue::Reference(Reference::Loaded(x)));
            }
            return Ok(());
        }
        if let Some(p) = previous {
            self.link_inverse(r, &rel, p, false)?;
        }
        let value = target.map_or(Reference::Null, Reference::Loaded);
        self.state
            .tracked_mut(r)?
            .entity
            .set_field(relation, FieldValue::Reference(value));
        if let Some(x) = target {
            self.link_inverse(r, &rel, x, true)?;
        }
        Ok(())
    }

    /// Add `member` to a collection, keeping the inverse side in step.
    pub fn add_to_collection(
        &mut self,
        r: EntityRef,
        relation: &str,
        member: EntityRef,
    ) -> Result<(), Error> {
        self.change_collection(r, relation, member, true)
    }

    /// Remove `member` from a collection, keeping the inverse side in step.
    pub fn remove_from_collection(
        &mut self,
        r: EntityRef,
        relation: &str,
        member: EntityRef,
    ) -> Result<(), Error> {
        self.change_collection(r, relation, member, false)
    }

    fn change_collection(
        &mut self,
        r: EntityRef,
        relation: &str,
        member: EntityRef,
        add: bool,
    ) -> Result<(), Error> {
        self.check_writable(r)?;
        let rel = self.relation_of(r, relation)?;
        if !rel.is_collection() {
            return Err(invalid_state(format!("'{relation}' is not a collection")));
        }
        self.check_target(&rel, member)?;
        let t = self.state.tracked_mut(r)?;
        let Some(c) = t.entity.collection_mut(relation) else {
            return Err(invalid_state(format!("collection '{relation}' is missing")));
        };
        if c.contains(member) == add && c.is_loaded() {
            return Ok(());
        }
        step(c, member, add);
        self.link_inverse(r, &rel, member, add)
    }

    fn check_target(&self, rel: &RelationMeta, target: EntityRef) -> Result<(), Error> {
        let tt = self.state.tracked(target)?;
        if tt.meta.name != rel.target {
            return Err(invalid_state(format!(
                "'{}' expects {} but {target} is {}",
                rel.name, rel.target, tt.meta.name
            )));
        }
        if tt.state == EntityState::Detached {
            return Err(invalid_state(format!(
                "{target} is detached; merge it before relating to it"
            )));
        }
        Ok(())
    }

    /// Mirror a change of `owner.rel` on the other side of the relation.
    fn link_inverse(
        &mut self,
        owner: EntityRef,
        rel: &RelationMeta,
        target: EntityRef,
        add: bool,
    ) -> Result<(), Error> {
        let meta = Arc::clone(&self.state.tracked(owner)?.meta);
        let Some((_, inverse)) = self.registry.inverse_of(&meta, rel) else {
            return Ok(());
        };
        let inverse = inverse.clone();
        match rel.kind {
            // The other side is a collection that does not own the rows;
            // only a loaded one is kept in step.
            RelationKind::ManyToOne | RelationKind::ManyToMany { owner: true } => {
                let t = self.state.tracked_mut(target)?;
                if let Some(c) = t.entity.collection_mut(&inverse.name) {
                    if c.is_loaded() {
                        step(c, owner, add);
                    }
                }
            }
            // Owning side records the pivot delta.
            RelationKind::ManyToMany { owner: false } => {
                let t = self.state.tracked_mut(target)?;
                if let Some(c) = t.entity.collection_mut(&inverse.name) {
                    step(c, owner, add);
                }
            }
            RelationKind::OneToOne { owner: true } => {
                let t = self.state.tracked_mut(target)?;
                let current = t.entity.reference(&inverse.name).and_then(Reference::loaded);
                if add {
                    t.entity
                        .set_field(&inverse.name, FieldValue::Reference(Reference::Loaded(owner)));
                } else if current == Some(owner) {
                    t.entity
                        .set_field(&inverse.name, FieldValue::Reference(Reference::Null));
                }
            }
            // The target holds the foreign key.
            RelationKind::OneToMany | RelationKind::OneToOne { owner: false } => {
                let previous = {
                    let t = self.state.tracked(target)?;
                    self.state.referenced(t, &inverse.name)
                };
                if add {
                    if let Some(prev) = previous.filter(|p| *p != owner) {
                        if let Ok(pt) = self.state.tracked_mut(prev) {
                            if rel.is_collection() {
                                if let Some(c) = pt.entity.collection_mut(&rel.name) {
                                    if c.is_loaded() {
                                        step(c, target, false);
                                    }
                                }
                            } else if pt.entity.reference(&rel.name).and_then(Reference::loaded)
                                == Some(target)
                            {
                                pt.entity
                                    .set_field(&rel.name, FieldValue::Reference(Reference::Null));
                            }
                        }
                    }
                    self.state
                        .tracked_mut(target)?
                        .entity
                        .set_field(&inverse.name, FieldValue::Reference(Reference::Loaded(owner)));
                } else if previous == Some(owner) && inverse.nullable && !rel.orphan_removal {
                    self.state
                        .tracked_mut(target)?
                        .entity
                        .set_field(&inverse.name, FieldValue::Reference(Reference::Null));
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Read rows on the transaction's connection, or a pooled one.
    async fn fetch(&self, cx: &Cx, request: &FetchRequest) -> Outcome<Vec<Row>, Error> {
        tracing::trace!(request = %request, "Fetching rows");
        if let Some(tx) = &self.tx {
            return tx.conn.fetch(cx, request).await;
        }
        let conn = match self.pool.acquire(cx).await {
            Outcome::Ok(conn) => conn,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        conn.fetch(cx, request).await
    }

    fn by_key(&self, meta: &EntityMeta, pk: Vec<Value>) -> FetchRequest {
        FetchRequest {
            table: meta.table_ref(self.schema()),
            filter: Filter::eq(meta.pk_columns(), pk),
        }
    }

    /// Find an entity by primary key.
    ///
    /// Answers from the identity map without touching the database when the
    /// row is already loaded. Removed entities are not found.
    #[tracing::instrument(level = "debug", skip(self, cx, pk), fields(session = self.state.generation))]
    pub async fn find(
        &mut self,
        cx: &Cx,
        entity: &str,
        pk: Vec<Value>,
    ) -> Outcome<Option<EntityRef>, Error> {
        let meta = match self.meta_of(entity) {
            Ok(meta) => meta,
            Err(e) => return Outcome::Err(e),
        };
        let width = meta.primary_key().count();
        if pk.len() != width {
            return Outcome::Err(Error::session(
                SessionErrorKind::MissingPrimaryKey,
                format!("{} has a {width}-column key but {} values were given", meta.name, pk.len()),
            ));
        }
        let key = self.state.key_for(&meta, pk);
        if let Some(r) = self.state.identity.lookup(&key) {
            tracing::trace!(key = %key, "Identity map hit");
            let removed = self
                .state
                .tracked(r)
                .is_ok_and(|t| t.state == EntityState::Removed);
            return Outcome::Ok((!removed).then_some(r));
        }

        let request = self.by_key(&meta, key.into_pk());
        let rows = match self.fetch(cx, &request).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match rows.first() {
            None => Outcome::Ok(None),
            Some(row) => match self.hydrate_with(&meta, row) {
                Ok(r) => Outcome::Ok(Some(r)),
                Err(e) => Outcome::Err(e),
            },
        }
    }

    /// Load every row of `entity` matching `filter`.
    ///
    /// Rows already in the identity map resolve to the existing instance,
    /// unchanged. Flushes first when `auto_flush` is on.
    pub async fn find_by(
        &mut self,
        cx: &Cx,
        entity: &str,
        filter: Filter,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let meta = match self.meta_of(entity) {
            Ok(meta) => meta,
            Err(e) => return Outcome::Err(e),
        };
        if self.config.auto_flush && self.pending_counts().total() > 0 {
            match self.flush(cx).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        let request = FetchRequest {
            table: meta.table_ref(self.schema()),
            filter,
        };
        let rows = match self.fetch(cx, &request).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let mut found = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = match self.hydrate_with(&meta, row) {
                Ok(r) => r,
                Err(e) => return Outcome::Err(e),
            };
            let live = self
                .state
                .tracked(r)
                .is_ok_and(|t| t.state != EntityState::Removed);
            if live && !found.contains(&r) {
                found.push(r);
            }
        }
        Outcome::Ok(found)
    }

    /// Turn a fetched row into a managed entity.
    ///
    /// If the row's identity is already tracked the existing instance is
    /// returned untouched.
    pub fn hydrate(&mut self, entity: &str, row: &Row) -> Result<EntityRef, Error> {
        let meta = self.meta_of(entity)?;
        self.hydrate_with(&meta, row)
    }

    fn hydrate_with(&mut self, meta: &Arc<EntityMeta>, row: &Row) -> Result<EntityRef, Error> {
        let pk = meta
            .primary_key()
            .map(|f| row.require(&f.column).cloned())
            .collect::<Result<Vec<Value>, Error>>()?;
        if pk.iter().any(Value::is_null) {
            return Err(Error::session(
                SessionErrorKind::MissingPrimaryKey,
                format!("row of {} has a NULL primary key", meta.name),
            ));
        }
        let key = self.state.key_for(meta, pk);
        if let Some(r) = self.state.identity.lookup(&key) {
            return Ok(r);
        }
        let entity = self.entity_from_row(meta, row)?;
        let r = self.state.insert(entity, Arc::clone(meta), EntityState::Managed);
        self.state.tracked_mut(r)?.key = Some(key.clone());
        self.state.identity.register(key, r)?;
        let snapshot = self.state.snapshot_of(r)?;
        self.state.snapshots.capture(r, snapshot);
        Ok(r)
    }

    /// Build an entity from a row: foreign keys become unloaded references
    /// and collections start unloaded.
    fn entity_from_row(&self, meta: &EntityMeta, row: &Row) -> Result<Entity, Error> {
        let mut entity = Entity::new(meta.name.clone());
        for f in &meta.fields {
            let value = row.get_by_name(&f.column).cloned().unwrap_or(Value::Null);
            entity.set_field(&f.name, FieldValue::Scalar(f.kind.normalize(value)));
        }
        for rel in &meta.relations {
            let value = if rel.is_collection() {
                FieldValue::Collection(Collection::unloaded())
            } else if rel.owns_foreign_key() {
                let values: Vec<Value> = rel
                    .join_columns
                    .iter()
                    .map(|c| row.get_by_name(c).cloned().unwrap_or(Value::Null))
                    .collect();
                if values.is_empty() || values.iter().any(Value::is_null) {
                    FieldValue::Reference(Reference::Null)
                } else {
                    let target = self.meta_of(&rel.target)?;
                    FieldValue::Reference(Reference::Unloaded(self.state.key_for(&target, values)))
                }
            } else {
                FieldValue::Reference(Reference::Null)
            };
            entity.set_field(&rel.name, value);
        }
        Ok(entity)
    }

    /// Resolve a to-one relation to a session entity, loading it if needed.
    pub async fn load_reference(
        &mut self,
        cx: &Cx,
        r: EntityRef,
        relation: &str,
    ) -> Outcome<Option<EntityRef>, Error> {
        let rel = match self.relation_of(r, relation) {
            Ok(rel) => rel,
            Err(e) => return Outcome::Err(e),
        };
        if rel.is_collection() {
            return Outcome::Err(invalid_state(format!("'{relation}' is a collection")));
        }
        let (meta, current, own_key) = match self.state.tracked(r) {
            Ok(t) => (
                Arc::clone(&t.meta),
                t.entity.reference(relation).cloned().unwrap_or(Reference::Null),
                t.key.clone(),
            ),
            Err(e) => return Outcome::Err(e),
        };

        let loaded = match current {
            Reference::Loaded(x) => return Outcome::Ok(Some(x)),
            Reference::Unloaded(key) => match self.state.identity.lookup(&key) {
                Some(x) => Some(x),
                None => {
                    let target = match self.meta_of(&rel.target) {
                        Ok(target) => target,
                        Err(e) => return Outcome::Err(e),
                    };
                    let request = self.by_key(&target, key.into_pk());
                    let rows = match self.fetch(cx, &request).await {
                        Outcome::Ok(rows) => rows,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    };
                    match rows.first().map(|row| self.hydrate_with(&target, row)) {
                        Some(Ok(x)) => Some(x),
                        Some(Err(e)) => return Outcome::Err(e),
                        None => None,
                    }
                }
            },
            Reference::Null if rel.owns_foreign_key() => return Outcome::Ok(None),
            Reference::Null => {
                // Inverse one-to-one: the other side holds the foreign key.
                let Some(own_key) = own_key else {
                    return Outcome::Ok(None);
                };
                let Some((target, owning)) = self
                    .registry
                    .inverse_of(&meta, &rel)
                    .map(|(t, o)| (Arc::clone(t), o.clone()))
                else {
                    return Outcome::Err(unknown_member(
                        MetadataErrorKind::InvalidRelation,
                        &meta,
                        relation,
                    ));
                };
                let in_session = self
                    .state
                    .iter()
                    .find(|(_, t)| {
                        t.meta.name == target.name
                            && matches!(t.state, EntityState::New | EntityState::Managed)
                            && self.state.points_at(t, &owning.name, r)
                    })
                    .map(|(x, _)| x);
                match in_session {
                    Some(x) => Some(x),
                    None => {
                        let request = FetchRequest {
                            table: target.table_ref(self.schema()),
                            filter: Filter::eq(owning.join_columns.clone(), own_key.into_pk()),
                        };
                        let rows = match self.fetch(cx, &request).await {
                            Outcome::Ok(rows) => rows,
                            Outcome::Err(e) => return Outcome::Err(e),
                            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                            Outcome::Panicked(p) => return Outcome::Panicked(p),
                        };
                        let mut found = None;
                        for row in &rows {
                            let x = match self.hydrate_with(&target, row) {
                                Ok(x) => x,
                                Err(e) => return Outcome::Err(e),
                            };
                            let points = self.state.tracked(x).is_ok_and(|t| {
                                t.state == EntityState::Managed
                                    && self.state.points_at(t, &owning.name, r)
                            });
                            if points {
                                found = Some(x);
                                break;
                            }
                        }
                        found
                    }
                }
            }
        };

        if let Some(x) = loaded {
            match self.state.tracked_mut(r) {
                Ok(t) => t
                    .entity
                    .set_field(relation, FieldValue::Reference(Reference::Loaded(x))),
                Err(e) => return Outcome::Err(e),
            }
        }
        Outcome::Ok(loaded)
    }

    /// Load a collection's members.
    ///
    /// Membership changes made while the collection was unloaded are applied
    /// on top of what the database returns; the snapshot records the
    /// database membership.
    pub async fn load_collection(
        &mut self,
        cx: &Cx,
        r: EntityRef,
        relation: &str,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let rel = match self.relation_of(r, relation) {
            Ok(rel) => rel,
            Err(e) => return Outcome::Err(e),
        };
        if !rel.is_collection() {
            return Outcome::Err(invalid_state(format!("'{relation}' is not a collection")));
        }
        let (meta, key, members) = match self.state.tracked(r) {
            Ok(t) => (
                Arc::clone(&t.meta),
                t.key.clone(),
                t.entity
                    .collection(relation)
                    .and_then(Collection::members)
                    .map(<[EntityRef]>::to_vec),
            ),
            Err(e) => return Outcome::Err(e),
        };
        if let Some(members) = members {
            return Outcome::Ok(members);
        }

        let Some(key) = key else {
            // Never written: nothing in the database points at it.
            return match self.finish_collection(r, relation, Vec::new(), None) {
                Ok(members) => Outcome::Ok(members),
                Err(e) => Outcome::Err(e),
            };
        };

        if let Some(c) = self
            .state
            .tracked_mut(r)
            .ok()
            .and_then(|t| t.entity.collection_mut(relation))
        {
            c.mark_loading();
        }
        let fetched = self.fetch_members(cx, r, &meta, &rel, key).await;
        let (stored, live) = match fetched {
            Outcome::Ok(found) => found,
            other => {
                if let Some(c) = self
                    .state
                    .tracked_mut(r)
                    .ok()
                    .and_then(|t| t.entity.collection_mut(relation))
                {
                    c.cancel_loading();
                }
                return match other {
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(reason) => Outcome::Cancelled(reason),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                    Outcome::Ok(_) => Outcome::Ok(Vec::new()),
                };
            }
        };
        tracing::trace!(handle = %r, relation, members = live.len(), "Collection loaded");
        match self.finish_collection(r, relation, live, Some(stored)) {
            Ok(members) => Outcome::Ok(members),
            Err(e) => Outcome::Err(e),
        }
    }

    fn finish_collection(
        &mut self,
        r: EntityRef,
        relation: &str,
        live: Vec<EntityRef>,
        stored: Option<Vec<EntityRef>>,
    ) -> Result<Vec<EntityRef>, Error> {
        let t = self.state.tracked_mut(r)?;
        let Some(c) = t.entity.collection_mut(relation) else {
            return Err(invalid_state(format!("collection '{relation}' is missing")));
        };
        c.finish_loading(live);
        let members = c.members().map(<[EntityRef]>::to_vec).unwrap_or_default();
        if let Some(stored) = stored {
            if let Some(snapshot) = self.state.snapshots.get(r) {
                let next = snapshot.with_collection(relation, stored);
                self.state.snapshots.replace(r, next);
            }
        }
        Ok(members)
    }

    /// Members as stored in the database, and as the session sees them.
    async fn fetch_members(
        &mut self,
        cx: &Cx,
        r: EntityRef,
        meta: &Arc<EntityMeta>,
        rel: &RelationMeta,
        key: IdentityKey,
    ) -> Outcome<(Vec<EntityRef>, Vec<EntityRef>), Error> {
        let schema = self.state.schema.clone();
        let schema = schema.as_deref();
        let Some((other, inverse)) = self
            .registry
            .inverse_of(meta, rel)
            .map(|(t, o)| (Arc::clone(t), o.clone()))
            .or_else(|| {
                // Owning many-to-many without a declared inverse.
                let target = self.registry.entity(&rel.target)?;
                Some((Arc::clone(target), rel.clone()))
            })
        else {
            return Outcome::Err(unknown_member(MetadataErrorKind::InvalidRelation, meta, &rel.name));
        };

        let (request, pivot_columns) = match rel.kind {
            RelationKind::OneToMany => (
                FetchRequest {
                    table: other.table_ref(schema),
                    filter: Filter::eq(inverse.join_columns.clone(), key.into_pk()),
                },
                None,
            ),
            RelationKind::ManyToMany { owner } => {
                let (pivot_owner, pivot) = if owner {
                    (meta, rel.pivot.as_ref())
                } else {
                    (&other, inverse.pivot.as_ref())
                };
                let Some(pivot) = pivot else {
                    return Outcome::Err(unknown_member(
                        MetadataErrorKind::InvalidRelation,
                        meta,
                        &rel.name,
                    ));
                };
                let (mine, theirs) = if owner {
                    (&pivot.owner_columns, &pivot.target_columns)
                } else {
                    (&pivot.target_columns, &pivot.owner_columns)
                };
                (
                    FetchRequest {
                        table: TableRef::new(pivot_owner.effective_schema(schema), &pivot.table),
                        filter: Filter::eq(mine.clone(), key.into_pk()),
                    },
                    Some(theirs.clone()),
                )
            }
            RelationKind::ManyToOne | RelationKind::OneToOne { .. } => {
                return Outcome::Err(invalid_state(format!("'{}' is not a collection", rel.name)));
            }
        };

        let mut rows = match self.fetch(cx, &request).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        if let Some(columns) = pivot_columns {
            let keys = match rows
                .iter()
                .map(|row| row.project(&columns))
                .collect::<Result<Vec<_>, Error>>()
            {
                Ok(keys) => keys,
                Err(e) => return Outcome::Err(e),
            };
            rows = if keys.is_empty() {
                Vec::new()
            } else {
                let request = FetchRequest {
                    table: other.table_ref(schema),
                    filter: Filter::any_of(other.pk_columns(), keys),
                };
                match self.fetch(cx, &request).await {
                    Outcome::Ok(rows) => rows,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            };
        }

        let mut stored = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.hydrate_with(&other, row) {
                Ok(x) => stored.push(x),
                Err(e) => return Outcome::Err(e),
            }
        }

        let live: Vec<EntityRef> = if rel.kind == RelationKind::OneToMany {
            // The children's own references decide membership.
            self.state
                .iter()
                .filter(|(_, t)| {
                    t.meta.name == other.name
                        && matches!(t.state, EntityState::New | EntityState::Managed)
                        && self.state.points_at(t, &inverse.name, r)
                })
                .map(|(x, _)| x)
                .collect()
        } else {
            stored
                .iter()
                .copied()
                .filter(|x| {
                    self.state
                        .tracked(*x)
                        .is_ok_and(|t| t.state != EntityState::Removed)
                })
                .collect()
        };
        Outcome::Ok((stored, live))
    }

    /// Reload an entity's fields from its row, discarding local changes.
    ///
    /// Collections go back to unloaded.
    pub async fn refresh(&mut self, cx: &Cx, r: EntityRef) -> Outcome<(), Error> {
        let (meta, key) = match self.state.tracked(r) {
            Ok(t) if t.state == EntityState::Managed => match &t.key {
                Some(key) => (Arc::clone(&t.meta), key.clone()),
                None => {
                    return Outcome::Err(Error::session(
                        SessionErrorKind::MissingPrimaryKey,
                        format!("{} {r} has no key", t.meta.name),
                    ));
                }
            },
            Ok(t) => {
                return Outcome::Err(invalid_state(format!(
                    "only managed entities can be refreshed; {} {r} is {:?}",
                    t.meta.name, t.state
                )));
            }
            Err(e) => return Outcome::Err(e),
        };
        let request = self.by_key(&meta, key.pk().to_vec());
        let rows = match self.fetch(cx, &request).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let Some(row) = rows.first() else {
            return Outcome::Err(invalid_state(format!("row of {key} no longer exists")));
        };
        let refreshed = self.entity_from_row(&meta, row).and_then(|entity| {
            self.state.tracked_mut(r)?.entity = entity;
            let snapshot = self.state.snapshot_of(r)?;
            self.state.snapshots.replace(r, snapshot);
            Ok(())
        });
        match refreshed {
            Ok(()) => {
                tracing::debug!(key = %key, "Entity refreshed");
                Outcome::Ok(())
            }
            Err(e) => Outcome::Err(e),
        }
    }

    /// Compare the stored version of a versioned entity with the one this
    /// session last saw.
    pub async fn check_version(&mut self, cx: &Cx, r: EntityRef) -> Outcome<(), Error> {
        let (meta, key, expected) = match self.state.tracked(r) {
            Ok(t) => {
                let (Some(field), Some(key)) = (t.meta.version_field(), t.key.clone()) else {
                    return Outcome::Ok(());
                };
                let expected = self
                    .state
                    .snapshots
                    .get(r)
                    .and_then(|s| s.scalar(&field.name).cloned())
                    .or_else(|| t.entity.scalar(&field.name).cloned())
                    .unwrap_or(Value::Null);
                (Arc::clone(&t.meta), key, expected)
            }
            Err(e) => return Outcome::Err(e),
        };
        let request = self.by_key(&meta, key.pk().to_vec());
        let rows = match self.fetch(cx, &request).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match lock::verify(&meta, r, &key, &expected, rows.first()) {
            Ok(()) => Outcome::Ok(()),
            Err(e) => Outcome::Err(e),
        }
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// Copy a detached entity's state onto the managed instance of its row.
    ///
    /// The managed instance is found in the identity map or loaded; when the
    /// row does not exist a new instance is scheduled for insertion. Merge
    /// cascades to detached entities reachable through `Merge` relations.
    /// Returns the managed instance.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = self.state.generation))]
    pub async fn merge(&mut self, cx: &Cx, r: EntityRef) -> Outcome<EntityRef, Error> {
        match self.state.tracked(r) {
            Ok(t) if matches!(t.state, EntityState::New | EntityState::Managed) => {
                return Outcome::Ok(r);
            }
            Ok(t) if t.state == EntityState::Removed => {
                return Outcome::Err(invalid_state(format!(
                    "{} {r} is removed and cannot be merged",
                    t.meta.name
                )));
            }
            Ok(_) => {}
            Err(e) => return Outcome::Err(e),
        }
        let closure = match cascade::merge_closure(&self.state, r) {
            Ok(closure) => closure,
            Err(e) => return Outcome::Err(e),
        };

        let mut mapping: HashMap<EntityRef, EntityRef> = HashMap::new();
        for d in &closure {
            let meta = match self.state.tracked(*d) {
                Ok(t) => Arc::clone(&t.meta),
                Err(e) => return Outcome::Err(e),
            };
            let managed = match self.state.pk_of(*d) {
                None => None,
                Some(pk) => {
                    let key = self.state.key_for(&meta, pk);
                    match self.state.identity.lookup(&key) {
                        Some(m) => Some(m),
                        None => {
                            let request = self.by_key(&meta, key.into_pk());
                            let rows = match self.fetch(cx, &request).await {
                                Outcome::Ok(rows) => rows,
                                Outcome::Err(e) => return Outcome::Err(e),
                                Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
                                Outcome::Panicked(p) => return Outcome::Panicked(p),
                            };
                            match rows.first().map(|row| self.hydrate_with(&meta, row)) {
                                Some(Ok(m)) => Some(m),
                                Some(Err(e)) => return Outcome::Err(e),
                                None => None,
                            }
                        }
                    }
                }
            };
            let target = match managed {
                Some(m) => {
                    if self.state.tracked(m).is_ok_and(|t| t.state == EntityState::Removed) {
                        return Outcome::Err(invalid_state(format!(
                            "{} {m} is removed and cannot be merged into",
                            meta.name
                        )));
                    }
                    m
                }
                None => {
                    let mut entity = Entity::new(meta.name.clone());
                    UnitState::complete_fields(&mut entity, &meta, true);
                    let n = self.state.insert(entity, Arc::clone(&meta), EntityState::New);
                    if let Ok(t) = self.state.tracked_mut(n) {
                        t.scheduled = true;
                    }
                    n
                }
            };
            mapping.insert(*d, target);
        }

        for d in &closure {
            let Some(target) = mapping.get(d).copied() else {
                continue;
            };
            if let Err(e) = self.copy_state(*d, target, &mapping) {
                return Outcome::Err(e);
            }
        }
        match mapping.get(&r) {
            Some(m) => {
                tracing::debug!(detached = %r, managed = %m, cascaded = closure.len(), "Entity merged");
                Outcome::Ok(*m)
            }
            None => Outcome::Err(invalid_state(format!("{r} was not merged"))),
        }
    }

    /// Merge an entity built outside the session.
    pub async fn merge_entity(&mut self, cx: &Cx, entity: Entity) -> Outcome<EntityRef, Error> {
        let meta = match self.meta_of(entity.name()) {
            Ok(meta) => meta,
            Err(e) => return Outcome::Err(e),
        };
        if let Err(e) = self.validate(&meta, &entity) {
            return Outcome::Err(e);
        }
        let mut entity = entity;
        UnitState::complete_fields(&mut entity, &meta, false);
        let r = self.state.insert(entity, meta, EntityState::Detached);
        self.merge(cx, r).await
    }

    /// A handle usable by a managed entity: detached targets are referred to
    /// by key.
    fn attachable(&self, x: EntityRef) -> Option<Reference> {
        match self.state.tracked(x) {
            Ok(t) if t.state == EntityState::Detached => t.key.clone().map(Reference::Unloaded),
            Ok(_) => Some(Reference::Loaded(x)),
            Err(_) => None,
        }
    }

    fn copy_state(
        &mut self,
        from: EntityRef,
        to: EntityRef,
        mapping: &HashMap<EntityRef, EntityRef>,
    ) -> Result<(), Error> {
        let source = self.state.tracked(from)?.entity.clone();
        let t = self.state.tracked(to)?;
        let meta = Arc::clone(&t.meta);
        let fresh = t.state == EntityState::New;

        if !fresh {
            if let (Some(field), Some(key)) = (meta.version_field(), t.key.clone()) {
                let incoming = source.scalar(&field.name).cloned().unwrap_or(Value::Null);
                let current = t.entity.scalar(&field.name).cloned().unwrap_or(Value::Null);
                if !incoming.is_null() && !field.kind.normalize(incoming.clone()).key_eq(&current) {
                    return Err(lock::lock_failed(to, key, incoming, Some(current)));
                }
            }
        }

        let remap = |x: EntityRef| mapping.get(&x).copied().unwrap_or(x);
        let mut updates: Vec<(String, FieldValue)> = Vec::new();
        for field in &meta.fields {
            if !fresh && (field.primary_key || field.version) {
                continue;
            }
            if let Some(v) = source.scalar(&field.name) {
                updates.push((field.name.clone(), FieldValue::Scalar(v.clone())));
            }
        }
        for rel in meta.owning_relations() {
            let value = match source.reference(&rel.name) {
                Some(Reference::Loaded(x)) => match self.attachable(remap(*x)) {
                    Some(value) => value,
                    None => continue,
                },
                Some(other) => other.clone(),
                None => continue,
            };
            updates.push((rel.name.clone(), FieldValue::Reference(value)));
        }
        let mut additions: Vec<(String, EntityRef)> = Vec::new();
        for rel in meta
            .relations
            .iter()
            .filter(|r| r.is_collection() && (r.owns_pivot() || r.cascades(Cascade::Merge)))
        {
            let Some(c) = source.collection(&rel.name) else {
                continue;
            };
            for m in c.members().unwrap_or_default().iter().chain(c.added()) {
                let m = remap(*m);
                if matches!(self.attachable(m), Some(Reference::Loaded(_))) {
                    additions.push((rel.name.clone(), m));
                }
            }
        }

        let t = self.state.tracked_mut(to)?;
        for (name, value) in updates {
            t.entity.set_field(&name, value);
        }
        for (name, m) in additions {
            if let Some(c) = t.entity.collection_mut(&name) {
                step(c, m, true);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn state(&self, r: EntityRef) -> Result<EntityState, Error> {
        Ok(self.state.tracked(r)?.state)
    }

    /// Identity key of an entity, or the key it will get once inserted.
    pub fn key_of(&self, r: EntityRef) -> Result<Option<IdentityKey>, Error> {
        let t = self.state.tracked(r)?;
        Ok(t.key.clone().or_else(|| self.state.assigned_key(r)))
    }

    /// Would a flush write anything for this entity?
    pub fn is_dirty(&self, r: EntityRef) -> Result<bool, Error> {
        let t = self.state.tracked(r)?;
        Ok(match t.state {
            EntityState::New | EntityState::Removed => true,
            EntityState::Detached => false,
            EntityState::Managed => {
                change_set::update_set(&self.state, r)?.is_some()
                    || t.meta
                        .relations
                        .iter()
                        .filter_map(|rel| t.entity.collection(&rel.name))
                        .any(Collection::is_dirty)
            }
        })
    }

    /// Fields of a managed entity that differ from its snapshot.
    pub fn changed_fields(&self, r: EntityRef) -> Result<Vec<String>, Error> {
        let t = self.state.tracked(r)?;
        if t.state != EntityState::Managed {
            return Ok(Vec::new());
        }
        Ok(change_set::update_set(&self.state, r)?
            .map(|set| set.changed_fields())
            .unwrap_or_default())
    }

    /// What a flush would do right now.
    pub fn pending_counts(&self) -> PendingCounts {
        let (new, deleted) = match cascade::resolve(&self.state, &self.registry) {
            Ok(ws) => (ws.inserts.len(), ws.removals.len() + ws.covered.len()),
            Err(_) => {
                let new = self
                    .state
                    .iter()
                    .filter(|(_, t)| t.state == EntityState::New && t.scheduled)
                    .count();
                let deleted = self
                    .state
                    .iter()
                    .filter(|(_, t)| t.state == EntityState::Removed && t.key.is_some())
                    .count();
                (new, deleted)
            }
        };
        let dirty = self
            .state
            .iter()
            .filter(|(r, t)| t.state == EntityState::Managed && self.is_dirty(*r).unwrap_or(true))
            .count();
        PendingCounts {
            new,
            dirty,
            deleted,
        }
    }

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        let count = |state: Option<EntityState>| {
            self.state
                .iter()
                .filter(|(_, t)| match state {
                    Some(s) => t.state == s,
                    None => t.state != EntityState::Detached,
                })
                .count()
        };
        SessionDebugInfo {
            generation: self.state.generation,
            tracked: count(None),
            slots: self.state.slots.len(),
            managed: count(Some(EntityState::Managed)),
            identities: self.state.identity.len(),
            snapshots: self.state.snapshots.len(),
            pending: self.pending_counts(),
            in_transaction: self.tx.is_some(),
            scope_depth: self.scopes.len(),
            phase: self.phase,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use datamapper_core::{
        ColumnKind, FieldMeta, InsertStatement, SessionError, Statement, TransactionError,
        TransactionErrorKind,
    };
    use datamapper_memory::MemoryDriver;
    use datamapper_pool::PoolConfig;

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
        match outcome {
            Outcome::Err(e) => e,
            Outcome::Ok(_) => panic!("expected an error"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn registry() -> Arc<MetadataRegistry> {
        let registry = MetadataRegistry::builder()
            .entity(
                EntityMeta::new("Author")
                    .field(
                        FieldMeta::new("id", ColumnKind::BigInt)
                            .primary_key(true)
                            .auto_increment(true),
                    )
                    .field(FieldMeta::new("name", ColumnKind::Text))
                    .relation(
                        RelationMeta::one_to_many("books", "Book", "author").cascade(&[Cascade::All]),
                    ),
            )
            .entity(
                EntityMeta::new("Book")
                    .field(
                        FieldMeta::new("id", ColumnKind::BigInt)
                            .primary_key(true)
                            .auto_increment(true),
                    )
                    .field(FieldMeta::new("title", ColumnKind::Text))
                    .relation(RelationMeta::many_to_one("author", "Author")),
            )
            .build();
        Arc::new(registry.expect("registry"))
    }

    fn session() -> (Session<MemoryDriver>, MemoryDriver) {
        let registry = registry();
        let driver = MemoryDriver::new();
        driver.install(&registry, None).expect("install");
        let pool = Pool::new(driver.clone(), PoolConfig::default()).expect("pool");
        (Session::new(registry, pool, SessionConfig::default()), driver)
    }

    fn author(session: &mut Session<MemoryDriver>, name: &str) -> EntityRef {
        session
            .create(Entity::new("Author").with("name", name))
            .expect("create author")
    }

    fn book(session: &mut Session<MemoryDriver>, title: &str, author: EntityRef) -> EntityRef {
        session
            .create(Entity::new("Book").with("title", title).with_ref("author", author))
            .expect("create book")
    }

    fn tx_kind(err: &Error) -> Option<TransactionErrorKind> {
        match err {
            Error::Transaction(TransactionError { kind, .. }) => Some(*kind),
            _ => None,
        }
    }

    fn run(f: impl AsyncFnOnce(&Cx)) {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            f(&cx).await;
        });
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.batch_size, 300);
        assert!(config.persist_on_create);
        assert!(!config.auto_flush);
        assert!(config.default_schema.is_none());

        let config = SessionConfig::new().batch_size(10).default_schema("tenant_a");
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.default_schema.as_deref(), Some("tenant_a"));

        let options = ForkOptions::default();
        assert!(options.clear);
        assert!(options.schema.is_none());
    }

    #[test]
    fn test_flushed_entity_is_found_without_a_query() {
        run(async |cx| {
            let (mut session, driver) = session();
            let a = author(&mut session, "Le Guin");
            assert_eq!(session.pending_counts().new, 1);

            let result = unwrap_outcome(session.flush(cx).await);
            assert_eq!(result.inserted, 1);
            assert_eq!(session.state(a).unwrap(), EntityState::Managed);
            let key = session.key_of(a).unwrap().expect("key");
            assert_eq!(key.pk()[0].as_i64(), Some(1));

            driver.clear_log();
            let found = unwrap_outcome(session.find(cx, "Author", vec![Value::BigInt(1)]).await);
            assert_eq!(found, Some(a));
            assert!(driver.transcript().iter().all(|line| !line.starts_with("SELECT")));

            let again = unwrap_outcome(session.flush(cx).await);
            assert_eq!(again.statements, 0);
            assert!(driver.statements().is_empty());
        });
    }

    #[test]
    fn test_failed_flush_leaves_session_untouched() {
        run(async |cx| {
            let (mut session, driver) = session();
            let a = author(&mut session, "Herbert");
            let b = book(&mut session, "Dune", a);

            driver.fail_on("INSERT book");
            let _ = expect_err(session.flush(cx).await);
            assert_eq!(session.state(a).unwrap(), EntityState::New);
            assert_eq!(session.state(b).unwrap(), EntityState::New);
            assert_eq!(session.flush_phase(), FlushPhase::Idle);
            assert_eq!(driver.row_count("author"), 0);

            let retry = unwrap_outcome(session.flush(cx).await);
            assert_eq!(retry.inserted, 2);
            assert_eq!(driver.row_count("author"), 1);
            assert_eq!(driver.row_count("book"), 1);
        });
    }

    #[test]
    fn test_nested_rollback_keeps_outer_work() {
        run(async |cx| {
            let (mut session, driver) = session();
            let outer = unwrap_outcome(session.begin_scope(cx, Propagation::Required).await);
            assert_eq!(outer.kind(), &ScopeKind::Root);
            let a = author(&mut session, "Outer");
            unwrap_outcome(session.flush(cx).await);

            let inner = unwrap_outcome(session.begin_scope(cx, Propagation::Nested).await);
            assert_eq!(inner.kind(), &ScopeKind::Savepoint("sp_1".into()));
            let b = author(&mut session, "Inner");
            unwrap_outcome(session.flush(cx).await);
            assert_eq!(driver.row_count("author"), 2);

            unwrap_outcome(session.rollback_scope(cx, inner).await);
            assert_eq!(session.state(a).unwrap(), EntityState::Managed);
            assert!(session.state(b).is_err());
            assert_eq!(driver.row_count("author"), 1);

            unwrap_outcome(session.commit_scope(cx, outer).await);
            assert!(!session.in_transaction());
            assert_eq!(driver.row_count("author"), 1);
        });
    }

    #[test]
    fn test_mandatory_requires_a_transaction() {
        run(async |cx| {
            let (mut session, _driver) = session();
            let err = expect_err(session.begin_scope(cx, Propagation::Mandatory).await);
            assert_eq!(tx_kind(&err), Some(TransactionErrorKind::NoActiveTransaction));

            let outer = unwrap_outcome(session.begin_scope(cx, Propagation::Required).await);
            let err = expect_err(session.begin_scope(cx, Propagation::Never).await);
            assert_eq!(tx_kind(&err), Some(TransactionErrorKind::ExistingTransaction));
            let joined = unwrap_outcome(session.begin_scope(cx, Propagation::Mandatory).await);
            assert_eq!(joined.kind(), &ScopeKind::Joined);
            unwrap_outcome(session.commit_scope(cx, joined).await);
            unwrap_outcome(session.commit_scope(cx, outer).await);
        });
    }

    #[test]
    fn test_out_of_order_close_is_rejected() {
        run(async |cx| {
            let (mut session, _driver) = session();
            let outer = unwrap_outcome(session.begin_scope(cx, Propagation::Required).await);
            let _inner = unwrap_outcome(session.begin_scope(cx, Propagation::Nested).await);

            let err = expect_err(session.commit_scope(cx, outer).await);
            assert_eq!(tx_kind(&err), Some(TransactionErrorKind::ScopeMismatch));
            assert_eq!(session.scope_depth(), 2);

            session.rollback_all(cx).await;
            assert_eq!(session.scope_depth(), 0);
            assert!(!session.in_transaction());
        });
    }

    #[test]
    fn test_suspend_and_resume() {
        run(async |cx| {
            let (mut session, _driver) = session();
            assert!(session.suspend().is_err());

            let guard = unwrap_outcome(session.begin_scope(cx, Propagation::Required).await);
            let suspended = session.suspend().expect("suspend");
            assert!(!session.in_transaction());
            session.resume(suspended).expect("resume");
            assert!(session.in_transaction());
            unwrap_outcome(session.commit_scope(cx, guard).await);
        });
    }

    #[test]
    fn test_copied_fork_reissues_handles() {
        run(async |cx| {
            let (mut session, _driver) = session();
            let a = author(&mut session, "Butler");
            unwrap_outcome(session.flush(cx).await);

            let mut fork = session.fork(ForkOptions::new().clear(false));
            assert_ne!(fork.generation(), session.generation());
            assert!(fork.get(a).is_err());

            let key = session.key_of(a).unwrap().expect("key");
            let found = unwrap_outcome(fork.find(cx, "Author", key.pk().to_vec()).await)
                .expect("copied entity");
            assert_eq!(found.session(), fork.generation());
            assert_eq!(found.slot(), a.slot());

            let tenant = session.fork(ForkOptions::new().schema("tenant_a"));
            assert_eq!(tenant.schema(), Some("tenant_a"));
            assert_eq!(tenant.debug_state().tracked, 0);
        });
    }

    #[test]
    fn test_load_collection_merges_session_members() {
        run(async |cx| {
            let (mut session, _driver) = session();
            let a = author(&mut session, "Tolkien");
            book(&mut session, "The Hobbit", a);
            book(&mut session, "Silmarillion", a);
            unwrap_outcome(session.flush(cx).await);

            let mut fresh = session.fork(ForkOptions::default());
            let a = unwrap_outcome(fresh.find(cx, "Author", vec![Value::BigInt(1)]).await)
                .expect("author");
            assert!(!fresh.get(a).unwrap().collection("books").unwrap().is_loaded());

            let members = unwrap_outcome(fresh.load_collection(cx, a, "books").await);
            assert_eq!(members.len(), 2);

            let added = book(&mut fresh, "Unfinished Tales", a);
            let books = fresh.get(a).unwrap().collection("books").unwrap();
            assert_eq!(books.members().map(<[EntityRef]>::len), Some(3));
            assert!(books.contains(added));

            let parent = unwrap_outcome(fresh.load_reference(cx, members[0], "author").await);
            assert_eq!(parent, Some(a));
        });
    }

    #[test]
    fn test_set_reference_keeps_inverse_in_step() {
        let (mut session, _driver) = session();
        let first = author(&mut session, "First");
        let second = author(&mut session, "Second");
        let b = book(&mut session, "Moved", first);
        assert!(session.get(first).unwrap().collection("books").unwrap().contains(b));

        session.set_reference(b, "author", Some(second)).unwrap();
        assert!(!session.get(first).unwrap().collection("books").unwrap().contains(b));
        assert!(session.get(second).unwrap().collection("books").unwrap().contains(b));

        session.remove_from_collection(second, "books", b).unwrap();
        assert_eq!(session.get(b).unwrap().reference("author"), Some(&Reference::Null));
    }

    #[test]
    fn test_handles_from_other_sessions_are_rejected() {
        let (mut session, _driver) = session();
        let (mut other, _) = self::session();
        let a = author(&mut other, "Elsewhere");

        let err = session
            .create(Entity::new("Book").with("title", "Lost").with_ref("author", a))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Session(SessionError {
                kind: SessionErrorKind::ForeignEntity,
                ..
            })
        ));
    }

    #[test]
    fn test_remove_cascades_children_first() {
        run(async |cx| {
            let (mut session, driver) = session();
            let a = author(&mut session, "Lem");
            let b = book(&mut session, "Solaris", a);
            unwrap_outcome(session.flush(cx).await);

            driver.clear_log();
            session.remove(a).unwrap();
            assert_eq!(session.state(b).unwrap(), EntityState::Removed);
            assert!(session.pending_counts().deleted >= 1);

            let result = unwrap_outcome(session.flush(cx).await);
            assert_eq!(result.deleted, 2);
            let statements = driver.statements();
            let book_at = statements.iter().position(|s| s.starts_with("DELETE book"));
            let author_at = statements.iter().position(|s| s.starts_with("DELETE author"));
            assert!(book_at.expect("book delete") < author_at.expect("author delete"));
            assert_eq!(session.state(a).unwrap(), EntityState::Detached);
            assert_eq!(driver.row_count("author"), 0);
        });
    }

    #[test]
    fn test_merge_copies_onto_managed_instance() {
        run(async |cx| {
            let (mut session, _driver) = session();
            let a = author(&mut session, "Ursula");
            unwrap_outcome(session.flush(cx).await);
            assert!(!session.is_dirty(a).unwrap());

            let incoming = Entity::new("Author").with("id", 1_i64).with("name", "Ursula K.");
            let merged = unwrap_outcome(session.merge_entity(cx, incoming).await);
            assert_eq!(merged, a);
            assert_eq!(
                session.get(a).unwrap().scalar("name"),
                Some(&Value::Text("Ursula K.".into()))
            );
            assert_eq!(session.changed_fields(a).unwrap(), vec!["name".to_string()]);

            let unknown = Entity::new("Author").with("id", 99_i64).with("name", "Nobody");
            let created = unwrap_outcome(session.merge_entity(cx, unknown).await);
            assert_eq!(session.state(created).unwrap(), EntityState::New);
        });
    }

    #[test]
    fn test_abandoned_flush_savepoint_is_rolled_back() {
        run(async |cx| {
            let (mut session, driver) = session();
            let guard = unwrap_outcome(session.begin_scope(cx, Propagation::Required).await);
            let a = author(&mut session, "Le Guin");

            // A flush dropped after its first statement: savepoint open, row written.
            let partial = Statement::Insert(InsertStatement {
                table: TableRef::new(None, "author"),
                columns: vec!["name".into()],
                rows: vec![vec![Value::from("Le Guin")]],
                returning: vec!["id".into()],
            });
            {
                let tx = session.tx.as_mut().expect("transaction");
                unwrap_outcome(tx.conn.savepoint(cx, "flush_9").await);
                unwrap_outcome(tx.conn.execute(cx, &partial).await);
                tx.open_flush = Some("flush_9".to_string());
            }
            session.phase = FlushPhase::Executing;
            assert_eq!(driver.row_count("author"), 1);

            unwrap_outcome(session.commit_scope(cx, guard).await);
            assert_eq!(driver.row_count("author"), 1);
            assert_eq!(session.state(a).unwrap(), EntityState::Managed);
            assert_eq!(session.flush_phase(), FlushPhase::Idle);

            // The partial row is undone before the real flush writes it again.
            let transcript = driver.transcript();
            let inserts: Vec<usize> = transcript
                .iter()
                .enumerate()
                .filter(|(_, t)| t.starts_with("INSERT author"))
                .map(|(i, _)| i)
                .collect();
            let undone = transcript
                .iter()
                .position(|t| t == "ROLLBACK TO flush_9")
                .expect("savepoint rolled back");
            assert_eq!(inserts.len(), 2);
            assert!(inserts[0] < undone && undone < inserts[1]);
        });
    }

    #[test]
    fn test_abandoned_flush_savepoint_is_rolled_back_with_its_scope() {
        run(async |cx| {
            let (mut session, driver) = session();
            let outer = unwrap_outcome(session.begin_scope(cx, Propagation::Required).await);
            author(&mut session, "Kept");
            unwrap_outcome(session.flush(cx).await);

            let inner = unwrap_outcome(session.begin_scope(cx, Propagation::Required).await);
            {
                let tx = session.tx.as_mut().expect("transaction");
                unwrap_outcome(tx.conn.savepoint(cx, "flush_7").await);
                tx.open_flush = Some("flush_7".to_string());
            }
            unwrap_outcome(session.rollback_scope(cx, inner).await);
            assert!(session.tx.as_ref().is_some_and(|tx| tx.open_flush.is_none()));
            assert!(driver.transcript().contains(&"ROLLBACK TO flush_7".to_string()));
            assert!(session.is_rollback_only());
            unwrap_outcome(session.rollback_scope(cx, outer).await);
            assert_eq!(driver.row_count("author"), 0);
        });
    }

    #[test]
    fn test_requires_new_rejects_references_to_held_entities() {
        run(async |cx| {
            let (mut session, driver) = session();
            let outer = unwrap_outcome(session.begin_scope(cx, Propagation::Required).await);
            let a = author(&mut session, "Held back");

            let inner = unwrap_outcome(session.begin_scope(cx, Propagation::RequiresNew).await);
            book(&mut session, "Orphan", a);
            let err = expect_err(session.commit_scope(cx, inner).await);
            assert!(matches!(
                err,
                Error::Session(SessionError {
                    kind: SessionErrorKind::InvalidState,
                    ..
                })
            ));
            assert_eq!(driver.row_count("book"), 0);
            assert_eq!(driver.row_count("author"), 0);

            // The held author still belongs to the outer transaction.
            assert!(session.in_transaction());
            assert_eq!(session.pending_counts().new, 1);
            unwrap_outcome(session.commit_scope(cx, outer).await);
            assert_eq!(driver.row_count("author"), 1);
        });
    }

    #[test]
    fn test_detached_entities_keep_their_slot_until_clear() {
        run(async |cx| {
            let (mut session, _driver) = session();
            let a = author(&mut session, "Gone");
            unwrap_outcome(session.flush(cx).await);
            session.remove(a).unwrap();
            unwrap_outcome(session.flush(cx).await);

            let info = session.debug_state();
            assert_eq!(info.tracked, 0);
            assert_eq!(info.slots, 1);

            session.clear();
            assert_eq!(session.debug_state().slots, 0);
        });
    }

    #[test]
    fn test_debug_state_reports_pending_work() {
        let (mut session, _driver) = session();
        let a = author(&mut session, "Pending");
        book(&mut session, "Draft", a);

        let info = session.debug_state();
        assert_eq!(info.tracked, 2);
        assert_eq!(info.pending.new, 2);
        assert!(!info.in_transaction);
        let json = info.to_json();
        assert_eq!(json["pending"]["new"], 2);
        assert_eq!(json["phase"], "Idle");
    }
}
