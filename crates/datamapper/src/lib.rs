//! datamapper - a Unit-of-Work data mapper for Rust.
//!
//! datamapper tracks entity instances in a session and writes their changes
//! back in one ordered, batched, transactional flush:
//!
//! - One managed instance per row and schema (identity map)
//! - Snapshot diffing, so only changed columns are written
//! - Persist, remove and merge cascades with orphan removal
//! - Foreign-key aware commit ordering, including null-then-update cycle breaking
//! - Optimistic locking on version columns
//! - Transaction propagation with savepoint-backed nested scopes
//!
//! # Quick Start
//!
//! ```ignore
//! use datamapper::prelude::*;
//!
//! let registry = MetadataRegistry::builder()
//!     .entity(
//!         EntityMeta::new("Author")
//!             .field(FieldMeta::new("id", ColumnKind::BigInt).primary_key(true).auto_increment(true))
//!             .field(FieldMeta::new("name", ColumnKind::Text))
//!             .relation(RelationMeta::one_to_many("books", "Book", "author").cascade(&[Cascade::All])),
//!     )
//!     .entity(
//!         EntityMeta::new("Book")
//!             .field(FieldMeta::new("id", ColumnKind::BigInt).primary_key(true).auto_increment(true))
//!             .field(FieldMeta::new("title", ColumnKind::Text))
//!             .relation(RelationMeta::many_to_one("author", "Author").nullable(false)),
//!     )
//!     .build()?;
//!
//! let manager = EntityManager::builder().registry(registry).build(driver)?;
//!
//! async fn example(cx: &Cx, manager: &EntityManager<MyDriver>) {
//!     let mut session = manager.fork(ForkOptions::default());
//!     let author = session.create(Entity::new("Author").with("name", "Le Guin")).unwrap();
//!     session
//!         .create(Entity::new("Book").with("title", "Lathe of Heaven").with_ref("author", author))
//!         .unwrap();
//!
//!     // INSERT author, then INSERT book with the generated author id.
//!     session.flush(cx).await;
//! }
//! ```

// Re-export all public types from sub-crates
pub use datamapper_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Core types
    Cascade,
    CascadeSet,
    ColumnKind,
    Connection,
    Driver,
    EntityMeta,
    EntityRef,
    Error,
    FetchRequest,
    FieldDefault,
    FieldMeta,
    Filter,
    IdentityKey,
    MetadataProvider,
    MetadataRegistry,
    MetadataRegistryBuilder,
    PivotTable,
    RelationKind,
    RelationMeta,
    Result,
    Row,
    Statement,
    TableRef,
    Value,
};

// Errors
pub use datamapper_core::{
    CascadeCycleError, ConstraintKind, ConstraintViolationError, IdentityConflictError,
    OptimisticLockError, SessionError, SessionErrorKind, TransactionError, TransactionErrorKind,
};

pub use datamapper_session::{
    Collection, CollectionState, Entity, EntityState, FieldValue, FlushPhase, FlushResult,
    ForkOptions, PendingCounts, Propagation, Reference, ScopeGuard, ScopeKind, Session,
    SessionConfig, SessionDebugInfo, SessionEvent, SuspendedTransaction,
};

pub use datamapper_pool::{Pool, PoolConfig, PoolStats, PooledConnection};

pub mod manager;
pub use manager::{EntityManager, EntityManagerBuilder};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{
        Cascade, ColumnKind, Connection, Cx, Driver, EntityManager, EntityMeta, EntityRef,
        EntityState, Entity, Error, FieldMeta, Filter, FlushResult, ForkOptions,
        MetadataRegistry, Outcome, PivotTable, PoolConfig, Propagation, Reference,
        RelationMeta, Row, Session, SessionConfig, Value,
    };
}
