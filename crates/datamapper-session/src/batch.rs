//! Batch Planner.
//!
//! Consecutive operations with the same statement shape are folded into one
//! multi-row statement, up to the configured batch size. Batching never
//! reorders: only neighbours in commit order are merged.

use crate::change_set::ColumnValue;
use crate::commit_order::{PendingOp, UpdatePurpose};
use datamapper_core::{
    DeleteStatement, DeleteWhereStatement, EntityRef, Error, InsertStatement, LinkStatement,
    Result, SessionErrorKind, Statement, TableRef, UpdateRow, UpdateStatement, Value,
};
use std::collections::HashMap;

/// Primary keys generated (or assigned) so far in the flush.
pub(crate) type KeyMap = HashMap<EntityRef, Vec<Value>>;

/// Operations that run as one statement.
#[derive(Debug, Clone)]
pub struct Batch {
    pub ops: Vec<PendingOp>,
}

#[derive(Debug, PartialEq)]
enum Shape<'a> {
    Insert {
        table: &'a TableRef,
        columns: &'a [String],
        returning: &'a [String],
    },
    Update {
        table: &'a TableRef,
        key_columns: &'a [String],
        columns: &'a [String],
        purpose: UpdatePurpose,
    },
    Delete {
        table: &'a TableRef,
        key_columns: &'a [String],
    },
    DeleteWhere {
        table: &'a TableRef,
        columns: &'a [String],
    },
    Link {
        table: &'a TableRef,
        columns: &'a [String],
    },
    Unlink {
        table: &'a TableRef,
        columns: &'a [String],
    },
}

/// Shape of an op, or `None` if it must run alone.
fn shape(op: &PendingOp) -> Option<Shape<'_>> {
    match op {
        PendingOp::Insert {
            table,
            columns,
            returning,
            per_row,
            ..
        } => (!per_row).then_some(Shape::Insert {
            table,
            columns,
            returning,
        }),
        // Versioned writes run alone so a zero row count names its entity.
        PendingOp::Update {
            table,
            key_columns,
            columns,
            version,
            purpose,
            ..
        } => version.is_none().then_some(Shape::Update {
            table,
            key_columns,
            columns,
            purpose: *purpose,
        }),
        PendingOp::Delete {
            table,
            key_columns,
            version,
            ..
        } => version.is_none().then_some(Shape::Delete { table, key_columns }),
        PendingOp::DeleteWhere { table, columns, .. } => Some(Shape::DeleteWhere { table, columns }),
        PendingOp::Link { table, columns, .. } => Some(Shape::Link { table, columns }),
        PendingOp::Unlink { table, columns, .. } => Some(Shape::Unlink { table, columns }),
    }
}

/// Does `op` write a key that an insert already in `batch` generates?
fn needs_key_from(op: &PendingOp, batch: &Batch) -> bool {
    let PendingOp::Insert { values, .. } = op else {
        return false;
    };
    values.iter().filter_map(ColumnValue::pending).any(|parent| {
        batch
            .ops
            .iter()
            .any(|o| matches!(o, PendingOp::Insert { entity, .. } if *entity == parent))
    })
}

/// Group ops into batches of at most `batch_size`.
///
/// A row whose foreign key points at a row inserted by the current batch
/// starts a new one, so a tree of one type goes out one level at a time.
pub fn plan(ops: Vec<PendingOp>, batch_size: usize) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    let mut batches: Vec<Batch> = Vec::new();
    for op in ops {
        let joins = batches.last().is_some_and(|last| {
            last.ops.len() < batch_size
                && shape(&op).is_some()
                && shape(&last.ops[0]) == shape(&op)
                && !needs_key_from(&op, last)
        });
        match batches.last_mut() {
            Some(last) if joins => last.ops.push(op),
            _ => batches.push(Batch { ops: vec![op] }),
        }
    }
    batches
}

fn resolve(values: &[ColumnValue], keys: &KeyMap) -> Result<Vec<Value>> {
    values
        .iter()
        .map(|v| match v {
            ColumnValue::Value(v) => Ok(v.clone()),
            ColumnValue::KeyOf { entity, component } => keys
                .get(entity)
                .and_then(|pk| pk.get(*component))
                .cloned()
                .ok_or_else(|| {
                    Error::session(
                        SessionErrorKind::InvalidState,
                        format!("key of {entity} is not known yet"),
                    )
                }),
        })
        .collect()
}

impl Batch {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Is the affected row count checked against the batch size?
    pub fn versioned(&self) -> bool {
        self.ops.iter().any(|op| match op {
            PendingOp::Update { version, .. } | PendingOp::Delete { version, .. } => {
                version.is_some()
            }
            _ => false,
        })
    }

    /// Build the statement, substituting keys generated earlier in the flush.
    pub(crate) fn statement(&self, keys: &KeyMap) -> Result<Statement> {
        let Some(first) = self.ops.first() else {
            return Err(Error::session(SessionErrorKind::InvalidState, "empty batch"));
        };
        let statement = match first {
            PendingOp::Insert {
                table,
                columns,
                returning,
                ..
            } => {
                let mut rows = Vec::with_capacity(self.ops.len());
                for op in &self.ops {
                    if let PendingOp::Insert { values, .. } = op {
                        rows.push(resolve(values, keys)?);
                    }
                }
                Statement::Insert(InsertStatement {
                    table: table.clone(),
                    columns: columns.clone(),
                    rows,
                    returning: returning.clone(),
                })
            }
            PendingOp::Update {
                table,
                key_columns,
                columns,
                version,
                ..
            } => {
                let mut rows = Vec::with_capacity(self.ops.len());
                for op in &self.ops {
                    if let PendingOp::Update {
                        key,
                        values,
                        version,
                        ..
                    } = op
                    {
                        rows.push(UpdateRow {
                            key: resolve(key, keys)?,
                            values: resolve(values, keys)?,
                            expected_version: version.as_ref().map(|v| v.expected.clone()),
                        });
                    }
                }
                Statement::Update(UpdateStatement {
                    table: table.clone(),
                    key_columns: key_columns.clone(),
                    set_columns: columns.clone(),
                    rows,
                    version_column: version.as_ref().map(|v| v.column.clone()),
                })
            }
            PendingOp::Delete {
                table,
                key_columns,
                version,
                ..
            } => {
                let mut rows = Vec::with_capacity(self.ops.len());
                let mut expected_versions = Vec::new();
                for op in &self.ops {
                    if let PendingOp::Delete { key, version, .. } = op {
                        rows.push(key.clone());
                        if let Some(v) = version {
                            expected_versions.push(v.expected.clone());
                        }
                    }
                }
                Statement::Delete(DeleteStatement {
                    table: table.clone(),
                    key_columns: key_columns.clone(),
                    keys: rows,
                    version_column: version.as_ref().map(|v| v.column.clone()),
                    expected_versions,
                })
            }
            PendingOp::DeleteWhere { table, columns, .. } => {
                let values = self
                    .ops
                    .iter()
                    .filter_map(|op| match op {
                        PendingOp::DeleteWhere { values, .. } => Some(values.clone()),
                        _ => None,
                    })
                    .collect();
                Statement::DeleteWhere(DeleteWhereStatement {
                    table: table.clone(),
                    columns: columns.clone(),
                    values,
                })
            }
            PendingOp::Link { table, columns, .. } | PendingOp::Unlink { table, columns, .. } => {
                let mut rows = Vec::with_capacity(self.ops.len());
                for op in &self.ops {
                    if let PendingOp::Link { values, .. } | PendingOp::Unlink { values, .. } = op {
                        rows.push(resolve(values, keys)?);
                    }
                }
                let link = LinkStatement {
                    table: table.clone(),
                    columns: columns.clone(),
                    rows,
                };
                if matches!(first, PendingOp::Link { .. }) {
                    Statement::Link(link)
                } else {
                    Statement::Unlink(link)
                }
            }
        };
        Ok(statement)
    }
}
