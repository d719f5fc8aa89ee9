//! In-memory reference driver for datamapper.
//!
//! `datamapper-memory` interprets abstract [`Statement`]s directly against
//! tables held in process memory. It enforces primary-key, unique, not-null
//! and foreign-key constraints (reporting the failing row index), honors
//! version predicates, and supports transactions with savepoints through an
//! undo log.
//!
//! All connections of one [`MemoryDriver`] share the same tables and see
//! each other's uncommitted writes (read-uncommitted isolation). Rolling
//! back a transaction undoes exactly the writes made on that connection.
//!
//! # Example
//!
//! ```rust,ignore
//! let driver = MemoryDriver::new();
//! driver.install(&registry, Some("tenant_a"))?;
//! let pool = Pool::new(driver.clone(), PoolConfig::default())?;
//! ```

mod database;
pub mod schema;
pub mod table;

pub use database::{EntryKind, LogEntry};
pub use schema::{parse_default, table_defs};
pub use table::{ColumnDef, DefaultExpr, ForeignKeyDef, TableDef};

use database::{Change, Database};
use datamapper_core::{
    Connection, ConnectionError, ConnectionErrorKind, Cx, Driver, Error, ExecResult, FetchRequest,
    MetadataRegistry, Outcome, Result, Row, Statement, TransactionErrorKind, Value,
};
use asupersync::CancelKind;
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: "memory database lock poisoned".to_string(),
            source: None,
        })
    })
}

// ============================================================================
// Driver
// ============================================================================

/// Driver handing out connections to one shared in-memory database.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    db: Arc<Mutex<Database>>,
}

impl MemoryDriver {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create tables for every entity in `registry`, in `schema` unless an
    /// entity declares its own. Existing tables of the same name are replaced.
    pub fn install(&self, registry: &MetadataRegistry, schema: Option<&str>) -> Result<()> {
        let defs = table_defs(registry, schema)?;
        let mut db = lock(&self.db)?;
        for def in defs {
            db.create_table(def);
        }
        Ok(())
    }

    /// Create (or replace) a single table.
    pub fn create_table(&self, def: TableDef) -> Result<()> {
        lock(&self.db)?.create_table(def);
        Ok(())
    }

    /// Names of all tables.
    pub fn tables(&self) -> Vec<String> {
        lock(&self.db).map_or_else(|_| Vec::new(), |db| db.tables.keys().cloned().collect())
    }

    /// Current rows of `table` as seen by every connection.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        let (schema, name) = match table.split_once('.') {
            Some((s, n)) => (Some(s), n),
            None => (None, table),
        };
        lock(&self.db)?.fetch(&FetchRequest {
            table: datamapper_core::TableRef::new(schema, name),
            filter: datamapper_core::Filter::all(),
        })
    }

    /// Number of rows in `table`, zero when it does not exist.
    pub fn row_count(&self, table: &str) -> usize {
        self.rows(table).map_or(0, |rows| rows.len())
    }

    /// Write statements executed so far, in order, including failed ones.
    pub fn statements(&self) -> Vec<String> {
        self.entries(Some(EntryKind::Statement))
    }

    /// Every logged operation: writes, reads and transaction control.
    pub fn transcript(&self) -> Vec<String> {
        self.entries(None)
    }

    /// Full log entries with their connection ids.
    pub fn log(&self) -> Vec<LogEntry> {
        lock(&self.db).map_or_else(|_| Vec::new(), |db| db.log.clone())
    }

    fn entries(&self, kind: Option<EntryKind>) -> Vec<String> {
        lock(&self.db).map_or_else(
            |_| Vec::new(),
            |db| {
                db.log
                    .iter()
                    .filter(|e| kind.is_none_or(|k| e.kind == k))
                    .map(|e| e.text.clone())
                    .collect()
            },
        )
    }

    /// Forget the statement log.
    pub fn clear_log(&self) {
        if let Ok(mut db) = lock(&self.db) {
            db.log.clear();
        }
    }

    /// Make the next write statement whose rendering contains `pattern` fail.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        if let Ok(mut db) = lock(&self.db) {
            db.faults.push(pattern.into());
        }
    }

    /// Cancel the caller's context right after the next write statement
    /// whose rendering contains `pattern` succeeds.
    pub fn cancel_after(&self, pattern: impl Into<String>) {
        if let Ok(mut db) = lock(&self.db) {
            db.cancels.push(pattern.into());
        }
    }

    fn open(&self) -> Result<MemoryConnection> {
        let mut db = lock(&self.db)?;
        db.next_connection += 1;
        let id = db.next_connection;
        db.record(id, EntryKind::Control, "CONNECT".to_string());
        Ok(MemoryConnection {
            id,
            db: Arc::clone(&self.db),
            tx: Mutex::new(None),
        })
    }
}

impl Driver for MemoryDriver {
    type Conn = MemoryConnection;

    fn connect(&self, _cx: &Cx) -> impl Future<Output = Outcome<Self::Conn, Error>> + Send {
        let result = self.open();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// Connection
// ============================================================================

#[derive(Debug, Default)]
struct TxState {
    undo: Vec<Change>,
    /// Savepoint names with the undo-log length at creation
    savepoints: Vec<(String, usize)>,
}

/// A connection to a [`MemoryDriver`] database.
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    db: Arc<Mutex<Database>>,
    tx: Mutex<Option<TxState>>,
}

impl MemoryConnection {
    /// Connection id as it appears in [`LogEntry::connection`].
    pub fn id(&self) -> u64 {
        self.id
    }

    fn execute_sync(&self, cx: &Cx, statement: &Statement) -> Result<ExecResult> {
        let text = statement.to_string();
        let mut db = lock(&self.db)?;
        db.record(self.id, EntryKind::Statement, text.clone());

        let mut changes = Vec::new();
        let result = db
            .take_fault(&text)
            .and_then(|()| db.execute(statement, &mut changes));
        match result {
            Ok(res) => {
                if let Some(tx) = lock(&self.tx)?.as_mut() {
                    tx.undo.extend(changes);
                }
                if db.take_cancel(&text) {
                    tracing::debug!(connection = self.id, statement = %text, "Cancelling caller");
                    cx.cancel_with(CancelKind::User, Some("cancelled by the memory driver"));
                }
                Ok(res)
            }
            Err(mut e) => {
                // Statements are atomic: drop the rows written before the failure.
                db.undo(changes);
                if let Error::Query(q) = &mut e {
                    q.statement.get_or_insert(text);
                }
                tracing::debug!(connection = self.id, error = %e, "Statement failed");
                Err(e)
            }
        }
    }

    fn fetch_sync(&self, request: &FetchRequest) -> Result<Vec<Row>> {
        let mut db = lock(&self.db)?;
        db.record(self.id, EntryKind::Fetch, request.to_string());
        db.fetch(request)
    }

    fn control(&self, text: String) -> Result<()> {
        lock(&self.db)?.record(self.id, EntryKind::Control, text);
        Ok(())
    }

    fn begin_sync(&self) -> Result<()> {
        let mut tx = lock(&self.tx)?;
        if tx.is_some() {
            return Err(Error::transaction(
                TransactionErrorKind::AlreadyActive,
                "transaction already active on this connection",
            ));
        }
        *tx = Some(TxState::default());
        drop(tx);
        self.control("BEGIN".to_string())
    }

    fn take_tx(&self) -> Result<TxState> {
        lock(&self.tx)?.take().ok_or_else(|| {
            Error::transaction(
                TransactionErrorKind::NoActiveTransaction,
                "no transaction is active on this connection",
            )
        })
    }

    fn commit_sync(&self) -> Result<()> {
        self.take_tx()?;
        self.control("COMMIT".to_string())
    }

    fn rollback_sync(&self) -> Result<()> {
        let state = self.take_tx()?;
        let mut db = lock(&self.db)?;
        db.undo(state.undo);
        db.record(self.id, EntryKind::Control, "ROLLBACK".to_string());
        Ok(())
    }

    fn with_tx<T>(&self, f: impl FnOnce(&mut TxState) -> Result<T>) -> Result<T> {
        let mut guard = lock(&self.tx)?;
        let state = guard.as_mut().ok_or_else(|| {
            Error::transaction(
                TransactionErrorKind::NoActiveTransaction,
                "savepoints require an active transaction",
            )
        })?;
        f(state)
    }

    fn savepoint_position(state: &TxState, name: &str) -> Result<usize> {
        state
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| {
                Error::transaction(
                    TransactionErrorKind::SavepointNotFound,
                    format!("savepoint '{name}' does not exist"),
                )
            })
    }

    fn savepoint_sync(&self, name: &str) -> Result<()> {
        self.with_tx(|state| {
            let mark = state.undo.len();
            state.savepoints.push((name.to_string(), mark));
            Ok(())
        })?;
        self.control(format!("SAVEPOINT {name}"))
    }

    fn release_sync(&self, name: &str) -> Result<()> {
        self.with_tx(|state| {
            let pos = Self::savepoint_position(state, name)?;
            state.savepoints.truncate(pos);
            Ok(())
        })?;
        self.control(format!("RELEASE {name}"))
    }

    fn rollback_to_sync(&self, name: &str) -> Result<()> {
        // The savepoint itself survives; later ones are discarded.
        let undone = self.with_tx(|state| {
            let pos = Self::savepoint_position(state, name)?;
            let mark = state.savepoints[pos].1;
            state.savepoints.truncate(pos + 1);
            Ok(state.undo.split_off(mark))
        })?;
        let mut db = lock(&self.db)?;
        db.undo(undone);
        db.record(self.id, EntryKind::Control, format!("ROLLBACK TO {name}"));
        Ok(())
    }
}

impl Connection for MemoryConnection {
    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<ExecResult, Error>> + Send {
        let result = self.execute_sync(cx, statement);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn fetch(
        &self,
        _cx: &Cx,
        request: &FetchRequest,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.fetch_sync(request);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.begin_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.commit_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.rollback_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn savepoint(&self, _cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.savepoint_sync(name);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn release_savepoint(
        &self,
        _cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.release_sync(name);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn rollback_to_savepoint(
        &self,
        _cx: &Cx,
        name: &str,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.rollback_to_sync(name);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = lock(&self.db).map(|_| ());
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn in_transaction(&self) -> bool {
        lock(&self.tx).is_ok_and(|tx| tx.is_some())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let open = self.tx.get_mut().ok().and_then(Option::take);
        if let Some(state) = open {
            tracing::warn!(connection = self.id, "Connection dropped inside a transaction; rolling back");
            if let Ok(mut db) = lock(&self.db) {
                db.undo(state.undo);
                db.record(self.id, EntryKind::Control, "ROLLBACK".to_string());
            }
        }
    }
}

/// Collect the values of `column` from `rows`.
pub fn column_values(rows: &[Row], column: &str) -> Vec<Value> {
    rows.iter()
        .filter_map(|r| r.get_by_name(column).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use datamapper_core::{
        ConstraintKind, DeleteStatement, Filter, InsertStatement, TableRef, UpdateRow,
        UpdateStatement,
    };

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

    fn driver() -> MemoryDriver {
        let driver = MemoryDriver::new();
        driver
            .create_table(
                TableDef::new("author")
                    .column(ColumnDef::new("id").auto_increment())
                    .column(ColumnDef::new("name").not_null())
                    .primary_key(["id"]),
            )
            .unwrap();
        driver
            .create_table(
                TableDef::new("book")
                    .column(ColumnDef::new("id").auto_increment())
                    .column(ColumnDef::new("author_id").not_null())
                    .column(ColumnDef::new("version").default(DefaultExpr::Literal(Value::BigInt(1))))
                    .primary_key(["id"])
                    .foreign_key(["author_id"], "author", ["id"]),
            )
            .unwrap();
        driver
    }

    fn insert_author(name: &str) -> Statement {
        Statement::Insert(InsertStatement {
            table: TableRef::new(None, "author"),
            columns: vec!["name".into()],
            rows: vec![vec![name.into()]],
            returning: vec!["id".into()],
        })
    }

    fn insert_books(author_ids: &[i64]) -> Statement {
        Statement::Insert(InsertStatement {
            table: TableRef::new(None, "book"),
            columns: vec!["author_id".into()],
            rows: author_ids.iter().map(|&a| vec![Value::BigInt(a)]).collect(),
            returning: vec!["id".into(), "version".into()],
        })
    }

    #[test]
    fn test_insert_returns_generated_values() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let driver = driver();
            let conn = unwrap_outcome(driver.connect(&cx).await);

            let res = unwrap_outcome(conn.execute(&cx, &insert_author("Le Guin")).await);
            assert_eq!(res.returned, vec![vec![Value::BigInt(1)]]);

            let res = unwrap_outcome(conn.execute(&cx, &insert_books(&[1, 1])).await);
            assert_eq!(res.affected, 2);
            assert_eq!(
                res.returned,
                vec![
                    vec![Value::BigInt(1), Value::BigInt(1)],
                    vec![Value::BigInt(2), Value::BigInt(1)]
                ]
            );
            assert_eq!(driver.statements().len(), 2);
        });
    }

    #[test]
    fn test_failed_statement_is_atomic_and_reports_row() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let driver = driver();
            let conn = unwrap_outcome(driver.connect(&cx).await);
            unwrap_outcome(conn.execute(&cx, &insert_author("A")).await);

            let err = expect_err(conn.execute(&cx, &insert_books(&[1, 1, 99])).await);
            match err {
                Error::Query(q) => {
                    assert_eq!(q.constraint, Some(ConstraintKind::ForeignKey));
                    assert_eq!(q.row, Some(2));
                    assert!(q.statement.is_some());
                }
                other => panic!("unexpected: {other}"),
            }
            assert_eq!(driver.row_count("book"), 0);
        });
    }

    #[test]
    fn test_versioned_update_and_delete() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let driver = driver();
            let conn = unwrap_outcome(driver.connect(&cx).await);
            unwrap_outcome(conn.execute(&cx, &insert_author("A")).await);
            unwrap_outcome(conn.execute(&cx, &insert_books(&[1])).await);

            let bump = |expected: i64| {
                Statement::Update(UpdateStatement {
                    table: TableRef::new(None, "book"),
                    key_columns: vec!["id".into()],
                    set_columns: vec!["version".into()],
                    rows: vec![UpdateRow {
                        key: vec![Value::BigInt(1)],
                        values: vec![Value::BigInt(expected + 1)],
                        expected_version: Some(Value::BigInt(expected)),
                    }],
                    version_column: Some("version".into()),
                })
            };
            assert_eq!(unwrap_outcome(conn.execute(&cx, &bump(1)).await).affected, 1);
            assert_eq!(unwrap_outcome(conn.execute(&cx, &bump(1)).await).affected, 0);

            let delete = Statement::Delete(DeleteStatement {
                table: TableRef::new(None, "book"),
                key_columns: vec!["id".into()],
                keys: vec![vec![Value::BigInt(1)]],
                version_column: Some("version".into()),
                expected_versions: vec![Value::BigInt(1)],
            });
            assert_eq!(unwrap_outcome(conn.execute(&cx, &delete).await).affected, 0);
            assert_eq!(driver.row_count("book"), 1);
        });
    }

    #[test]
    fn test_delete_of_referenced_row_fails() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let driver = driver();
            let conn = unwrap_outcome(driver.connect(&cx).await);
            unwrap_outcome(conn.execute(&cx, &insert_author("A")).await);
            unwrap_outcome(conn.execute(&cx, &insert_books(&[1])).await);

            let delete = Statement::Delete(DeleteStatement {
                table: TableRef::new(None, "author"),
                key_columns: vec!["id".into()],
                keys: vec![vec![Value::BigInt(1)]],
                version_column: None,
                expected_versions: Vec::new(),
            });
            let err = expect_err(conn.execute(&cx, &delete).await);
            assert!(matches!(err, Error::Query(ref q) if q.is_foreign_key_violation()));
            assert_eq!(driver.row_count("author"), 1);
        });
    }

    #[test]
    fn test_transaction_rollback_and_savepoints() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let driver = driver();
            let conn = unwrap_outcome(driver.connect(&cx).await);

            unwrap_outcome(conn.begin(&cx).await);
            assert!(conn.in_transaction());
            unwrap_outcome(conn.execute(&cx, &insert_author("kept")).await);
            unwrap_outcome(conn.savepoint(&cx, "sp_1").await);
            unwrap_outcome(conn.execute(&cx, &insert_author("undone")).await);
            assert_eq!(driver.row_count("author"), 2);

            unwrap_outcome(conn.rollback_to_savepoint(&cx, "sp_1").await);
            assert_eq!(driver.row_count("author"), 1);
            unwrap_outcome(conn.release_savepoint(&cx, "sp_1").await);
            assert!(matches!(
                expect_err(conn.release_savepoint(&cx, "sp_1").await),
                Error::Transaction(_)
            ));

            unwrap_outcome(conn.rollback(&cx).await);
            assert!(!conn.in_transaction());
            assert_eq!(driver.row_count("author"), 0);

            let transcript = driver.transcript();
            assert!(transcript.contains(&"SAVEPOINT sp_1".to_string()));
            assert!(transcript.contains(&"ROLLBACK".to_string()));
        });
    }

    #[test]
    fn test_dropped_connection_rolls_back() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let driver = driver();
            {
                let conn = unwrap_outcome(driver.connect(&cx).await);
                unwrap_outcome(conn.begin(&cx).await);
                unwrap_outcome(conn.execute(&cx, &insert_author("lost")).await);
            }
            assert_eq!(driver.row_count("author"), 0);
        });
    }

    #[test]
    fn test_fault_injection_and_fetch() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let driver = driver();
            let conn = unwrap_outcome(driver.connect(&cx).await);
            driver.fail_on("INSERT author");
            assert!(matches!(
                expect_err(conn.execute(&cx, &insert_author("x")).await),
                Error::Query(_)
            ));
            unwrap_outcome(conn.execute(&cx, &insert_author("y")).await);

            let rows = unwrap_outcome(
                conn.fetch(
                    &cx,
                    &FetchRequest {
                        table: TableRef::new(None, "author"),
                        filter: Filter::eq(["name"], vec!["y".into()]),
                    },
                )
                .await,
            );
            assert_eq!(column_values(&rows, "name"), vec![Value::from("y")]);

            driver.clear_log();
            assert!(driver.statements().is_empty());
        });
    }

    #[test]
    fn test_cancel_after_matching_write() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let driver = driver();
            let conn = unwrap_outcome(driver.connect(&cx).await);
            driver.cancel_after("INSERT author");

            // The write itself goes through; the caller sees the request after it.
            unwrap_outcome(conn.execute(&cx, &insert_author("x")).await);
            assert_eq!(driver.row_count("author"), 1);
            assert!(cx.is_cancel_requested());
            assert_eq!(cx.cancel_reason().map(|r| r.kind), Some(CancelKind::User));

            let other = Cx::for_testing();
            unwrap_outcome(conn.execute(&other, &insert_author("y")).await);
            assert!(!other.is_cancel_requested());
        });
    }
}
