//! Table definitions and row storage with constraint checking.

use datamapper_core::{ConstraintKind, Error, QueryError, Value};
use std::collections::BTreeMap;

/// One column of a memory table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub nullable: bool,
    pub auto_increment: bool,
    /// Expression evaluated when an insert omits the column
    pub default: Option<DefaultExpr>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nullable: true,
            auto_increment: false,
            default: None,
        }
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn default(mut self, expr: DefaultExpr) -> Self {
        self.default = Some(expr);
        self
    }
}

/// A parsed column default.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultExpr {
    Literal(Value),
    CurrentTimestamp,
}

impl DefaultExpr {
    pub fn evaluate(&self) -> Value {
        match self {
            DefaultExpr::Literal(v) => v.clone(),
            DefaultExpr::CurrentTimestamp => Value::Timestamp(now_micros()),
        }
    }
}

fn now_micros() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
}

/// Foreign key from `columns` to `ref_columns` of the table named `references`.
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeyDef {
    pub columns: Vec<String>,
    pub references: String,
    pub ref_columns: Vec<String>,
}

/// Schema of a memory table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    /// Qualified name, e.g. `tenant_a.book`
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
    pub unique: Vec<Vec<String>>,
    pub foreign_keys: Vec<ForeignKeyDef>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            unique: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    #[must_use]
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    #[must_use]
    pub fn primary_key<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn unique<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.unique.push(columns.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn foreign_key<S: Into<String>>(
        mut self,
        columns: impl IntoIterator<Item = S>,
        references: impl Into<String>,
        ref_columns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.foreign_keys.push(ForeignKeyDef {
            columns: columns.into_iter().map(Into::into).collect(),
            references: references.into(),
            ref_columns: ref_columns.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }

    pub(crate) fn indexes_of(&self, columns: &[String]) -> Result<Vec<usize>, Error> {
        columns
            .iter()
            .map(|c| {
                self.index_of(c).ok_or_else(|| {
                    Error::Query(QueryError {
                        kind: datamapper_core::QueryErrorKind::NotFound,
                        statement: None,
                        message: format!("table {} has no column '{}'", self.name, c),
                        constraint: None,
                        row: None,
                        source: None,
                    })
                })
            })
            .collect()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Rows of one table plus its auto-increment counter.
#[derive(Debug, Clone)]
pub(crate) struct Table {
    pub def: TableDef,
    pub rows: Vec<Vec<Value>>,
    pub next_id: i64,
}

impl Table {
    pub fn new(def: TableDef) -> Self {
        Self {
            def,
            rows: Vec::new(),
            next_id: 1,
        }
    }

    pub fn project(row: &[Value], idx: &[usize]) -> Vec<Value> {
        idx.iter().map(|&i| row[i].clone()).collect()
    }

    pub fn tuple_eq(a: &[Value], b: &[Value]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.key_eq(y))
    }

    /// Position of the row whose `idx` columns equal `key`.
    pub fn find(&self, idx: &[usize], key: &[Value]) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| Self::tuple_eq(&Self::project(row, idx), key))
    }

    /// Check not-null, primary-key and unique constraints for `row`,
    /// ignoring the row at `skip` (the row being replaced).
    pub fn check_row(&self, row: &[Value], skip: Option<usize>, row_no: usize) -> Result<(), Error> {
        for (col, value) in self.def.columns.iter().zip(row) {
            if !col.nullable && value.is_null() {
                return Err(constraint(
                    ConstraintKind::NotNull,
                    format!("{}.{} may not be NULL", self.def.name, col.name),
                    row_no,
                ));
            }
        }

        let pk_idx = self.def.indexes_of(&self.def.primary_key)?;
        let pk = Self::project(row, &pk_idx);
        if self.conflicts(&pk_idx, &pk, skip) {
            return Err(constraint(
                ConstraintKind::PrimaryKey,
                format!("duplicate primary key in {}", self.def.name),
                row_no,
            ));
        }

        for unique in &self.def.unique {
            let idx = self.def.indexes_of(unique)?;
            let tuple = Self::project(row, &idx);
            if tuple.iter().any(Value::is_null) {
                continue;
            }
            if self.conflicts(&idx, &tuple, skip) {
                return Err(constraint(
                    ConstraintKind::Unique,
                    format!("duplicate ({}) in {}", unique.join(", "), self.def.name),
                    row_no,
                ));
            }
        }
        Ok(())
    }

    fn conflicts(&self, idx: &[usize], tuple: &[Value], skip: Option<usize>) -> bool {
        self.rows
            .iter()
            .enumerate()
            .any(|(i, r)| Some(i) != skip && Self::tuple_eq(&Self::project(r, idx), tuple))
    }
}

pub(crate) fn constraint(kind: ConstraintKind, message: String, row: usize) -> Error {
    Error::Query(QueryError::constraint(kind, message, Some(row)))
}

/// Check that every non-null foreign key of `row` in `table` points at an existing row.
pub(crate) fn check_references(
    tables: &BTreeMap<String, Table>,
    table: &Table,
    row: &[Value],
    row_no: usize,
) -> Result<(), Error> {
    for fk in &table.def.foreign_keys {
        let idx = table.def.indexes_of(&fk.columns)?;
        let tuple = Table::project(row, &idx);
        if tuple.iter().any(Value::is_null) {
            continue;
        }
        // A self-referencing row may point at itself.
        let target = if fk.references == table.def.name {
            table
        } else {
            tables.get(&fk.references).ok_or_else(|| {
                Error::Custom(format!("table {} references missing {}", table.def.name, fk.references))
            })?
        };
        let ref_idx = target.def.indexes_of(&fk.ref_columns)?;
        let self_match = fk.references == table.def.name
            && Table::tuple_eq(&Table::project(row, &ref_idx), &tuple);
        if !self_match && target.find(&ref_idx, &tuple).is_none() {
            return Err(constraint(
                ConstraintKind::ForeignKey,
                format!(
                    "{} ({}) references missing {} row",
                    table.def.name,
                    fk.columns.join(", "),
                    fk.references
                ),
                row_no,
            ));
        }
    }
    Ok(())
}

/// Check that no row anywhere still references `removed` (rows just deleted from `table_name`).
pub(crate) fn check_not_referenced(
    tables: &BTreeMap<String, Table>,
    table_name: &str,
    removed: &[(usize, Vec<Value>)],
) -> Result<(), Error> {
    let Some(parent) = tables.get(table_name) else {
        return Ok(());
    };
    for child in tables.values() {
        for fk in child.def.foreign_keys.iter().filter(|fk| fk.references == table_name) {
            let idx = child.def.indexes_of(&fk.columns)?;
            let ref_idx = parent.def.indexes_of(&fk.ref_columns)?;
            for (row_no, old) in removed {
                let key = Table::project(old, &ref_idx);
                let referenced = child
                    .rows
                    .iter()
                    .any(|r| Table::tuple_eq(&Table::project(r, &idx), &key));
                if referenced {
                    return Err(constraint(
                        ConstraintKind::ForeignKey,
                        format!(
                            "{} row is still referenced by {} ({})",
                            table_name,
                            child.def.name,
                            fk.columns.join(", ")
                        ),
                        *row_no,
                    ));
                }
            }
        }
    }
    Ok(())
}
