//! Shared in-memory store: statement interpretation and the undo log.

use crate::table::{Table, TableDef, check_not_referenced, check_references};
use datamapper_core::{
    ColumnInfo, DeleteStatement, Error, ExecResult, FetchRequest,
    InsertStatement, QueryError, QueryErrorKind, Result, Row, Statement, UpdateStatement, Value,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One reversible change to table data.
///
/// Undoing a sequence of changes in reverse order restores the exact row
/// positions, so each change only records what it needs to reverse itself.
/// Inserted rows are found by value, since another connection may have
/// appended rows after them.
#[derive(Debug, Clone)]
pub(crate) enum Change {
    /// A row was appended
    Insert { table: String, row: Vec<Value> },
    /// The row at `index` was overwritten
    Update {
        table: String,
        index: usize,
        old: Vec<Value>,
    },
    /// The row at `index` was removed
    Delete {
        table: String,
        index: usize,
        row: Vec<Value>,
    },
}

/// Category of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Write statement
    Statement,
    /// Read request
    Fetch,
    /// Transaction control (begin, commit, savepoints)
    Control,
}

/// One line of the driver transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub connection: u64,
    pub kind: EntryKind,
    pub text: String,
}

#[derive(Debug, Default)]
pub(crate) struct Database {
    pub tables: BTreeMap<String, Table>,
    pub log: Vec<LogEntry>,
    /// Substrings of statements that must fail once
    pub faults: Vec<String>,
    /// Substrings of statements after which the caller is cancelled once
    pub cancels: Vec<String>,
    pub next_connection: u64,
}

fn not_found(message: String) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::NotFound,
        statement: None,
        message,
        constraint: None,
        row: None,
        source: None,
    })
}

impl Database {
    pub fn create_table(&mut self, def: TableDef) {
        tracing::debug!(table = %def.name, columns = def.columns.len(), "Creating memory table");
        self.tables.insert(def.name.clone(), Table::new(def));
    }

    pub fn record(&mut self, connection: u64, kind: EntryKind, text: String) {
        tracing::trace!(connection, ?kind, %text, "memory driver");
        self.log.push(LogEntry {
            connection,
            kind,
            text,
        });
    }

    /// Fail if an injected fault matches `text`, consuming the fault.
    pub fn take_fault(&mut self, text: &str) -> Result<()> {
        if let Some(pos) = self.faults.iter().position(|f| text.contains(f.as_str())) {
            let fault = self.faults.remove(pos);
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Database,
                statement: None,
                message: format!("injected failure matching '{fault}'"),
                constraint: None,
                row: None,
                source: None,
            }));
        }
        Ok(())
    }

    /// Does a pending cancellation match `text`? Consumes it.
    pub fn take_cancel(&mut self, text: &str) -> bool {
        match self.cancels.iter().position(|c| text.contains(c.as_str())) {
            Some(pos) => {
                self.cancels.remove(pos);
                true
            }
            None => false,
        }
    }

    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| not_found(format!("no such table: {name}")))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| not_found(format!("no such table: {name}")))
    }

    /// Reverse `changes`, newest first.
    pub fn undo(&mut self, changes: Vec<Change>) {
        for change in changes.into_iter().rev() {
            match change {
                Change::Insert { table, row } => {
                    if let Some(t) = self.tables.get_mut(&table) {
                        if let Some(pos) = t.rows.iter().rposition(|r| *r == row) {
                            t.rows.remove(pos);
                        }
                    }
                }
                Change::Update { table, index, old } => {
                    if let Some(row) = self.tables.get_mut(&table).and_then(|t| t.rows.get_mut(index)) {
                        *row = old;
                    }
                }
                Change::Delete { table, index, row } => {
                    if let Some(t) = self.tables.get_mut(&table) {
                        let index = index.min(t.rows.len());
                        t.rows.insert(index, row);
                    }
                }
            }
        }
    }

    /// Apply one statement, appending its changes to `changes`.
    ///
    /// On error the caller is responsible for undoing the changes made so far.
    pub fn execute(&mut self, statement: &Statement, changes: &mut Vec<Change>) -> Result<ExecResult> {
        let table = statement.table().to_string();
        match statement {
            Statement::Insert(s) => self.insert(&table, s, changes),
            Statement::Update(s) => self.update(&table, s, changes),
            Statement::Delete(s) => self.delete(&table, s, changes),
            Statement::DeleteWhere(s) => self.delete_where(&table, &s.columns, &s.values, changes),
            Statement::Link(s) => self.insert(
                &table,
                &InsertStatement {
                    table: s.table.clone(),
                    columns: s.columns.clone(),
                    rows: s.rows.clone(),
                    returning: Vec::new(),
                },
                changes,
            ),
            Statement::Unlink(s) => self.delete_where(&table, &s.columns, &s.rows, changes),
        }
    }

    fn insert(
        &mut self,
        name: &str,
        stmt: &InsertStatement,
        changes: &mut Vec<Change>,
    ) -> Result<ExecResult> {
        let mut returned = Vec::with_capacity(stmt.rows.len());
        for (row_no, values) in stmt.rows.iter().enumerate() {
            let table = self.table(name)?;
            let idx = table.def.indexes_of(&stmt.columns)?;
            let width = table.def.columns.len();
            let mut row = vec![Value::Null; width];
            let mut provided = vec![false; width];
            for (&i, v) in idx.iter().zip(values) {
                row[i] = v.clone();
                provided[i] = true;
            }

            let mut next_id = table.next_id;
            for (i, col) in table.def.columns.iter().enumerate() {
                if col.auto_increment {
                    match row[i].as_i64() {
                        Some(v) => next_id = next_id.max(v + 1),
                        None => {
                            row[i] = Value::BigInt(next_id);
                            next_id += 1;
                        }
                    }
                } else if let (false, Some(default)) = (provided[i], &col.default) {
                    row[i] = default.evaluate();
                }
            }

            table.check_row(&row, None, row_no)?;
            check_references(&self.tables, table, &row, row_no)?;
            let returning = table.def.indexes_of(&stmt.returning)?;
            returned.push(Table::project(&row, &returning));

            let table = self.table_mut(name)?;
            table.next_id = next_id;
            table.rows.push(row.clone());
            changes.push(Change::Insert {
                table: name.to_string(),
                row,
            });
        }
        Ok(ExecResult {
            affected: returned.len() as u64,
            returned,
        })
    }

    fn update(
        &mut self,
        name: &str,
        stmt: &UpdateStatement,
        changes: &mut Vec<Change>,
    ) -> Result<ExecResult> {
        let mut affected = 0;
        for (row_no, upd) in stmt.rows.iter().enumerate() {
            let table = self.table(name)?;
            let key_idx = table.def.indexes_of(&stmt.key_columns)?;
            let set_idx = table.def.indexes_of(&stmt.set_columns)?;
            let Some(pos) = table.find(&key_idx, &upd.key) else {
                continue;
            };
            if let (Some(column), Some(expected)) = (&stmt.version_column, &upd.expected_version) {
                let vi = table.def.indexes_of(std::slice::from_ref(column))?[0];
                if !table.rows[pos][vi].key_eq(expected) {
                    continue;
                }
            }

            let mut row = table.rows[pos].clone();
            for (&i, v) in set_idx.iter().zip(&upd.values) {
                row[i] = v.clone();
            }
            table.check_row(&row, Some(pos), row_no)?;
            check_references(&self.tables, table, &row, row_no)?;

            let old = std::mem::replace(&mut self.table_mut(name)?.rows[pos], row);
            changes.push(Change::Update {
                table: name.to_string(),
                index: pos,
                old,
            });
            affected += 1;
        }
        Ok(ExecResult::affected(affected))
    }

    fn delete(
        &mut self,
        name: &str,
        stmt: &DeleteStatement,
        changes: &mut Vec<Change>,
    ) -> Result<ExecResult> {
        let mut removed = Vec::new();
        for (row_no, key) in stmt.keys.iter().enumerate() {
            let table = self.table(name)?;
            let key_idx = table.def.indexes_of(&stmt.key_columns)?;
            let Some(pos) = table.find(&key_idx, key) else {
                continue;
            };
            if let (Some(column), Some(expected)) =
                (&stmt.version_column, stmt.expected_versions.get(row_no))
            {
                let vi = table.def.indexes_of(std::slice::from_ref(column))?[0];
                if !table.rows[pos][vi].key_eq(expected) {
                    continue;
                }
            }
            let row = self.table_mut(name)?.rows.remove(pos);
            changes.push(Change::Delete {
                table: name.to_string(),
                index: pos,
                row: row.clone(),
            });
            removed.push((row_no, row));
        }
        check_not_referenced(&self.tables, name, &removed)?;
        Ok(ExecResult::affected(removed.len() as u64))
    }

    fn delete_where(
        &mut self,
        name: &str,
        columns: &[String],
        values: &[Vec<Value>],
        changes: &mut Vec<Change>,
    ) -> Result<ExecResult> {
        let idx = self.table(name)?.def.indexes_of(columns)?;
        let mut removed = Vec::new();
        for (row_no, tuple) in values.iter().enumerate() {
            loop {
                let found = self.table(name)?.find(&idx, tuple);
                let Some(pos) = found else {
                    break;
                };
                let row = self.table_mut(name)?.rows.remove(pos);
                changes.push(Change::Delete {
                    table: name.to_string(),
                    index: pos,
                    row: row.clone(),
                });
                removed.push((row_no, row));
            }
        }
        check_not_referenced(&self.tables, name, &removed)?;
        Ok(ExecResult::affected(removed.len() as u64))
    }

    pub fn fetch(&self, request: &FetchRequest) -> Result<Vec<Row>> {
        let table = self.table(&request.table.to_string())?;
        let idx = table.def.indexes_of(&request.filter.columns)?;
        let info = Arc::new(ColumnInfo::new(table.def.column_names()));
        Ok(table
            .rows
            .iter()
            .filter(|row| {
                idx.is_empty()
                    || request
                        .filter
                        .values
                        .iter()
                        .any(|v| Table::tuple_eq(&Table::project(row, &idx), v))
            })
            .map(|row| Row::with_columns(Arc::clone(&info), row.clone()))
            .collect())
    }
}
