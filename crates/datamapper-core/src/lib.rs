//! Core types and traits for datamapper.
//!
//! `datamapper-core` holds the vocabulary every other crate speaks:
//!
//! - [`Value`] and [`ColumnKind`] for scalar data and its normalization
//! - [`IdentityKey`] and [`EntityRef`] for naming entities
//! - [`MetadataRegistry`] and [`MetadataProvider`] for entity descriptions
//! - [`Statement`] and [`FetchRequest`] for the driver contract
//! - [`Connection`] and [`Driver`] for storage backends
//! - [`Error`] for everything that can go wrong

pub mod connection;
pub mod error;
pub mod identifiers;
pub mod key;
pub mod metadata;
pub mod row;
pub mod statement;
pub mod value;

pub use connection::{Connection, Driver};
pub use error::{
    CascadeCycleError, ConnectionError, ConnectionErrorKind, ConstraintKind,
    ConstraintViolationError, Error, IdentityConflictError, MetadataError, MetadataErrorKind,
    OptimisticLockError, PoolError, PoolErrorKind, QueryError, QueryErrorKind, Result,
    SessionError, SessionErrorKind, TransactionError, TransactionErrorKind, TypeError,
};
pub use identifiers::{is_valid_identifier, qualify, quote_ident};
pub use key::{EntityRef, IdentityKey};
pub use metadata::{
    Cascade, CascadeSet, ColumnKind, EntityMeta, FieldDefault, FieldMeta, MetadataProvider,
    MetadataRegistry, MetadataRegistryBuilder, PivotTable, RelationKind, RelationMeta,
};
pub use row::{ColumnInfo, Row};
pub use statement::{
    DeleteStatement, DeleteWhereStatement, ExecResult, FetchRequest, Filter, InsertStatement,
    LinkStatement, Statement, TableRef, UpdateRow, UpdateStatement,
};
pub use value::Value;

// Re-export asupersync types for convenience
pub use asupersync::{Cx, Outcome};
