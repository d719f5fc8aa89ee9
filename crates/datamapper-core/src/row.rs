//! Fetched row representation.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column names shared across all rows of one fetch.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    names: Vec<String>,
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            names,
            name_to_index,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row returned by [`Connection::fetch`](crate::Connection::fetch).
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a row owning its own column metadata.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        Self {
            values,
            columns: Arc::new(ColumnInfo::new(column_names)),
        }
    }

    /// Create a row sharing column metadata with its siblings.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Get a column by name, failing when it is absent.
    pub fn require(&self, name: &str) -> Result<&Value> {
        self.get_by_name(name).ok_or_else(|| {
            Error::Type(TypeError {
                expected: "column",
                actual: format!("row has no column '{}'", name),
                column: Some(name.to_string()),
            })
        })
    }

    /// Values of several columns, in the order requested.
    pub fn project(&self, names: &[String]) -> Result<Vec<Value>> {
        names.iter().map(|n| self.require(n).cloned()).collect()
    }

    pub fn columns(&self) -> &[String] {
        self.columns.names()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_access_by_name_and_projection() {
        let info = Arc::new(ColumnInfo::new(vec!["id".into(), "title".into()]));
        let row = Row::with_columns(Arc::clone(&info), vec![Value::BigInt(1), "Dune".into()]);

        assert_eq!(row.get_by_name("title"), Some(&Value::Text("Dune".into())));
        assert_eq!(row.get(0), Some(&Value::BigInt(1)));
        assert!(row.get_by_name("missing").is_none());
        assert_eq!(
            row.project(&["title".into(), "id".into()]).unwrap(),
            vec![Value::Text("Dune".into()), Value::BigInt(1)]
        );
        assert!(row.require("missing").is_err());
        assert_eq!(info.len(), 2);
    }
}
