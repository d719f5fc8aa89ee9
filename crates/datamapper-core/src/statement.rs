//! Abstract operation descriptors handed to drivers.
//!
//! The Unit-of-Work never renders SQL. It produces these descriptors and the
//! driver compiles them for its dialect (or, for the in-memory driver,
//! interprets them directly).

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A possibly schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: Option<&str>, name: &str) -> Self {
        Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Multi-row insert. Every row carries values for exactly `columns`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertStatement {
    pub table: TableRef,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Columns whose database-produced values must be returned per row
    pub returning: Vec<String>,
}

/// One row of an [`UpdateStatement`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRow {
    pub key: Vec<Value>,
    pub values: Vec<Value>,
    /// When set, the row is only updated if its version column still holds this value
    pub expected_version: Option<Value>,
}

/// Update of one or more rows sharing the same set of assigned columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatement {
    pub table: TableRef,
    pub key_columns: Vec<String>,
    pub set_columns: Vec<String>,
    pub rows: Vec<UpdateRow>,
    pub version_column: Option<String>,
}

/// Delete rows by primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteStatement {
    pub table: TableRef,
    pub key_columns: Vec<String>,
    pub keys: Vec<Vec<Value>>,
    pub version_column: Option<String>,
    /// Parallel to `keys` when `version_column` is set
    pub expected_versions: Vec<Value>,
}

/// Delete every row whose `columns` tuple is in `values`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteWhereStatement {
    pub table: TableRef,
    pub columns: Vec<String>,
    pub values: Vec<Vec<Value>>,
}

/// Insert or delete pivot rows of a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStatement {
    pub table: TableRef,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// A write operation descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    DeleteWhere(DeleteWhereStatement),
    Link(LinkStatement),
    Unlink(LinkStatement),
}

impl Statement {
    pub fn table(&self) -> &TableRef {
        match self {
            Statement::Insert(s) => &s.table,
            Statement::Update(s) => &s.table,
            Statement::Delete(s) => &s.table,
            Statement::DeleteWhere(s) => &s.table,
            Statement::Link(s) | Statement::Unlink(s) => &s.table,
        }
    }

    /// Number of rows the statement addresses.
    pub fn row_count(&self) -> usize {
        match self {
            Statement::Insert(s) => s.rows.len(),
            Statement::Update(s) => s.rows.len(),
            Statement::Delete(s) => s.keys.len(),
            Statement::DeleteWhere(s) => s.values.len(),
            Statement::Link(s) | Statement::Unlink(s) => s.rows.len(),
        }
    }

    pub const fn verb(&self) -> &'static str {
        match self {
            Statement::Insert(_) => "INSERT",
            Statement::Update(_) => "UPDATE",
            Statement::Delete(_) | Statement::DeleteWhere(_) => "DELETE",
            Statement::Link(_) => "LINK",
            Statement::Unlink(_) => "UNLINK",
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Insert(s) => write!(
                f,
                "INSERT {} ({}) x{}",
                s.table,
                s.columns.join(", "),
                s.rows.len()
            ),
            Statement::Update(s) => {
                write!(
                    f,
                    "UPDATE {} SET ({}) BY ({}) x{}",
                    s.table,
                    s.set_columns.join(", "),
                    s.key_columns.join(", "),
                    s.rows.len()
                )?;
                if let Some(v) = &s.version_column {
                    write!(f, " CHECK {}", v)?;
                }
                Ok(())
            }
            Statement::Delete(s) => {
                write!(
                    f,
                    "DELETE {} BY ({}) x{}",
                    s.table,
                    s.key_columns.join(", "),
                    s.keys.len()
                )?;
                if let Some(v) = &s.version_column {
                    write!(f, " CHECK {}", v)?;
                }
                Ok(())
            }
            Statement::DeleteWhere(s) => write!(
                f,
                "DELETE {} WHERE ({}) IN x{}",
                s.table,
                s.columns.join(", "),
                s.values.len()
            ),
            Statement::Link(s) => write!(
                f,
                "LINK {} ({}) x{}",
                s.table,
                s.columns.join(", "),
                s.rows.len()
            ),
            Statement::Unlink(s) => write!(
                f,
                "UNLINK {} ({}) x{}",
                s.table,
                s.columns.join(", "),
                s.rows.len()
            ),
        }
    }
}

/// Tuple-IN predicate: rows whose `columns` tuple equals one of `values`.
///
/// An empty column list matches every row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Filter {
    pub columns: Vec<String>,
    pub values: Vec<Vec<Value>>,
}

impl Filter {
    /// Match every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match rows where `columns` equal `values`.
    pub fn eq<S: Into<String>>(columns: impl IntoIterator<Item = S>, values: Vec<Value>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            values: vec![values],
        }
    }

    /// Match rows whose `columns` tuple is one of `values`.
    pub fn any_of<S: Into<String>>(
        columns: impl IntoIterator<Item = S>,
        values: Vec<Vec<Value>>,
    ) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            values,
        }
    }
}

/// Read request: every column of the matching rows of `table`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub table: TableRef,
    pub filter: Filter,
}

impl fmt::Display for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.filter.columns.is_empty() {
            write!(f, "SELECT {}", self.table)
        } else {
            write!(
                f,
                "SELECT {} WHERE ({}) IN x{}",
                self.table,
                self.filter.columns.join(", "),
                self.filter.values.len()
            )
        }
    }
}

/// Outcome of executing one [`Statement`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecResult {
    /// Rows inserted, updated or deleted
    pub affected: u64,
    /// For inserts: one entry per row, values of the `returning` columns
    pub returned: Vec<Vec<Value>>,
}

impl ExecResult {
    pub fn affected(affected: u64) -> Self {
        Self {
            affected,
            returned: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_display_is_dialect_neutral() {
        let stmt = Statement::Insert(InsertStatement {
            table: TableRef::new(Some("app"), "book"),
            columns: vec!["title".into(), "author_id".into()],
            rows: vec![vec![Value::from("a"), Value::BigInt(1)]; 2],
            returning: vec!["id".into()],
        });
        assert_eq!(stmt.to_string(), "INSERT app.book (title, author_id) x2");
        assert_eq!(stmt.row_count(), 2);
        assert_eq!(stmt.verb(), "INSERT");

        let del = Statement::Delete(DeleteStatement {
            table: TableRef::new(None, "book"),
            key_columns: vec!["id".into()],
            keys: vec![vec![Value::BigInt(1)]],
            version_column: Some("version".into()),
            expected_versions: vec![Value::Int(2)],
        });
        assert_eq!(del.to_string(), "DELETE book BY (id) x1 CHECK version");
    }

    #[test]
    fn test_filter_builders() {
        let f = Filter::eq(["author_id"], vec![Value::BigInt(3)]);
        assert_eq!(f.columns, vec!["author_id".to_string()]);
        assert_eq!(f.values.len(), 1);
        assert!(Filter::all().columns.is_empty());
    }
}
