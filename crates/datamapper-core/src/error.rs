//! Error types for datamapper operations.

use crate::key::{EntityRef, IdentityKey};
use crate::value::Value;
use std::fmt;

/// The primary error type for all datamapper operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect)
    Connection(ConnectionError),
    /// Statement execution errors reported by a driver
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction and scope errors
    Transaction(TransactionError),
    /// Pool errors
    Pool(PoolError),
    /// Metadata registry errors
    Metadata(MetadataError),
    /// Misuse of the session API
    Session(SessionError),
    /// Two distinct instances claim one identity key
    IdentityConflict(IdentityConflictError),
    /// Version check failed on update or delete
    OptimisticLock(OptimisticLockError),
    /// Driver-reported constraint failure, attributed to an entity
    ConstraintViolation(ConstraintViolationError),
    /// Foreign-key cycle with no nullable member
    CascadeCycle(CascadeCycleError),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost or closed during operation
    Disconnected,
    /// Connection pool exhausted
    PoolExhausted,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// Dialect-neutral rendering of the failing statement
    pub statement: Option<String>,
    pub message: String,
    /// Constraint family for `QueryErrorKind::Constraint`
    pub constraint: Option<ConstraintKind>,
    /// Index of the failing row inside a multi-row statement
    pub row: Option<usize>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Other database error
    Database,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    ForeignKey,
    NotNull,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// `Mandatory` propagation without an open transaction
    NoActiveTransaction,
    /// `Never` propagation inside an open transaction
    ExistingTransaction,
    /// A joined scope rolled back; the owning transaction can only roll back
    RollbackOnly,
    /// Savepoint not found
    SavepointNotFound,
    /// Scopes must be completed innermost-first
    ScopeMismatch,
    /// A transaction is already open on this connection
    AlreadyActive,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Pool exhausted (no available connections)
    Exhausted,
    /// Pool is closed
    Closed,
    /// Configuration error
    Config,
}

#[derive(Debug)]
pub struct MetadataError {
    pub kind: MetadataErrorKind,
    /// Entity the problem was found on, if any
    pub entity: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataErrorKind {
    UnknownEntity,
    UnknownField,
    UnknownRelation,
    DuplicateEntity,
    InvalidIdentifier,
    MissingPrimaryKey,
    InvalidVersionField,
    InvalidRelation,
}

#[derive(Debug)]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// The handle does not name a live entity of this session
    UnknownEntity,
    /// The handle belongs to a different session
    ForeignEntity,
    /// The operation is not valid in the entity's lifecycle state
    InvalidState,
    /// A new entity is referenced but was never persisted
    UnpersistedReference,
    /// A primary key could not be determined
    MissingPrimaryKey,
    /// A flush is already running on this session
    FlushInProgress,
}

#[derive(Debug, Clone)]
pub struct IdentityConflictError {
    pub key: IdentityKey,
    /// Instance already registered under `key`
    pub existing: EntityRef,
    /// Instance that attempted to claim `key`
    pub incoming: EntityRef,
}

#[derive(Debug, Clone)]
pub struct OptimisticLockError {
    pub entity: EntityRef,
    pub key: IdentityKey,
    /// Version the session expected to find
    pub expected: Value,
    /// Version found, when known
    pub actual: Option<Value>,
}

#[derive(Debug)]
pub struct ConstraintViolationError {
    pub kind: ConstraintKind,
    /// Entity behind the failing row, when it could be attributed
    pub entity: Option<EntityRef>,
    pub entity_type: Option<String>,
    pub key: Option<IdentityKey>,
    pub table: String,
    pub message: String,
    pub source: Option<Box<QueryError>>,
}

#[derive(Debug, Clone)]
pub struct CascadeCycleError {
    /// Entity types forming the unbreakable cycle
    pub types: Vec<String>,
}

impl Error {
    /// Is this a retryable error (deadlock, serialization, pool exhausted, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization
            ),
            Error::Pool(p) => matches!(p.kind, PoolErrorKind::Exhausted),
            Error::Connection(c) => matches!(c.kind, ConnectionErrorKind::PoolExhausted),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Will a retry succeed only after the affected entities are reloaded?
    pub fn requires_reload(&self) -> bool {
        matches!(self, Error::OptimisticLock(_))
    }

    /// Is this a constraint failure, attributed or raw?
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Error::ConstraintViolation(_) => true,
            Error::Query(q) => q.kind == QueryErrorKind::Constraint,
            _ => false,
        }
    }

    /// The entity this error is about, if there is one.
    pub fn conflicting_entity(&self) -> Option<EntityRef> {
        match self {
            Error::IdentityConflict(e) => Some(e.incoming),
            Error::OptimisticLock(e) => Some(e.entity),
            Error::ConstraintViolation(e) => e.entity,
            _ => None,
        }
    }

    pub(crate) fn metadata(
        kind: MetadataErrorKind,
        entity: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Error::Metadata(MetadataError {
            kind,
            entity: entity.map(str::to_string),
            message: message.into(),
        })
    }

    /// Shorthand for a session misuse error.
    pub fn session(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Error::Session(SessionError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for a transaction error.
    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }
}

impl QueryError {
    /// A constraint failure raised by a driver.
    pub fn constraint(kind: ConstraintKind, message: impl Into<String>, row: Option<usize>) -> Self {
        Self {
            kind: QueryErrorKind::Constraint,
            statement: None,
            message: message.into(),
            constraint: Some(kind),
            row,
            source: None,
        }
    }

    /// Is this a unique or primary-key violation?
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self.constraint,
            Some(ConstraintKind::Unique | ConstraintKind::PrimaryKey)
        )
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.constraint == Some(ConstraintKind::ForeignKey)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Metadata(e) => write!(f, "Metadata error: {}", e),
            Error::Session(e) => write!(f, "Session error: {}", e.message),
            Error::IdentityConflict(e) => write!(f, "{}", e),
            Error::OptimisticLock(e) => write!(f, "{}", e),
            Error::ConstraintViolation(e) => write!(f, "{}", e),
            Error::CascadeCycle(e) => write!(f, "{}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Pool(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::ConstraintViolation(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(row) = self.row {
            write!(f, " (row {})", row)?;
        }
        if let Some(stmt) = &self.statement {
            write!(f, " in `{}`", stmt)?;
        }
        Ok(())
    }
}

impl std::error::Error for QueryError {}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(entity) => write!(f, "{}: {}", entity, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for IdentityConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Identity conflict: {} is already managed by {}, cannot register {}",
            self.key, self.existing, self.incoming
        )
    }
}

impl fmt::Display for OptimisticLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Optimistic lock failed for {}: expected version {}",
            self.key, self.expected
        )?;
        if let Some(actual) = &self.actual {
            write!(f, ", found {}", actual)?;
        }
        Ok(())
    }
}

impl fmt::Display for ConstraintViolationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Constraint violation ({:?}) on {}", self.kind, self.table)?;
        match (&self.key, &self.entity_type) {
            (Some(key), _) => write!(f, " for {}", key)?,
            (None, Some(ty)) => write!(f, " for new {}", ty)?,
            (None, None) => {}
        }
        write!(f, ": {}", self.message)
    }
}

impl fmt::Display for CascadeCycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Unresolvable foreign-key cycle between [{}]: no member has a nullable reference",
            self.types.join(", ")
        )
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::Metadata(err)
    }
}

impl From<SessionError> for Error {
    fn from(err: SessionError) -> Self {
        Error::Session(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for datamapper operations.
pub type Result<T> = std::result::Result<T, Error>;
