//! Optimistic-Lock Guard.
//!
//! Versioned entities carry an integer counter or a timestamp column. Every
//! update and delete of such an entity is predicated on the version the
//! session last saw; a statement that matches no row means another writer
//! got there first.

use datamapper_core::{
    ColumnKind, EntityMeta, EntityRef, Error, IdentityKey, OptimisticLockError, Row, Value,
};
use std::time::{SystemTime, UNIX_EPOCH};

/// Version assigned to a freshly inserted row.
pub fn initial_version(kind: ColumnKind) -> Value {
    match kind {
        ColumnKind::SmallInt => Value::SmallInt(1),
        ColumnKind::Int => Value::Int(1),
        ColumnKind::Timestamp { .. } => kind.normalize(Value::Timestamp(now_micros())),
        _ => Value::BigInt(1),
    }
}

/// Version that replaces `current` on update.
///
/// Timestamps always move forward by at least one unit of the column's
/// precision, even when the clock has not.
pub fn next_version(kind: ColumnKind, current: &Value) -> Value {
    match kind {
        ColumnKind::Timestamp { precision } => {
            let step = 10_i64.pow(u32::from(6 - precision.min(6)));
            let now = kind.normalize(Value::Timestamp(now_micros()));
            match (now, current) {
                (Value::Timestamp(now), Value::Timestamp(prev)) => {
                    Value::Timestamp(now.max(prev.saturating_add(step)))
                }
                (now, _) => now,
            }
        }
        _ => match current.as_i64() {
            Some(v) => kind.normalize(Value::BigInt(v.saturating_add(1))),
            None => initial_version(kind),
        },
    }
}

/// Compare a freshly fetched row against the expected version.
pub fn verify(
    meta: &EntityMeta,
    entity: EntityRef,
    key: &IdentityKey,
    expected: &Value,
    row: Option<&Row>,
) -> Result<(), Error> {
    let Some(field) = meta.version_field() else {
        return Ok(());
    };
    let actual = match row {
        Some(row) => Some(field.kind.normalize(row.require(&field.column)?.clone())),
        None => None,
    };
    match &actual {
        Some(v) if v.key_eq(expected) => Ok(()),
        _ => Err(lock_failed(entity, key.clone(), expected.clone(), actual)),
    }
}

pub(crate) fn lock_failed(
    entity: EntityRef,
    key: IdentityKey,
    expected: Value,
    actual: Option<Value>,
) -> Error {
    tracing::warn!(entity = %entity, key = %key, expected = %expected, "Optimistic lock failed");
    Error::OptimisticLock(OptimisticLockError {
        entity,
        key,
        expected,
        actual,
    })
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use datamapper_core::FieldMeta;

    #[test]
    fn test_integer_versions_increment() {
        assert_eq!(initial_version(ColumnKind::Int), Value::Int(1));
        assert_eq!(next_version(ColumnKind::Int, &Value::Int(4)), Value::Int(5));
        assert_eq!(
            next_version(ColumnKind::BigInt, &Value::BigInt(9)),
            Value::BigInt(10)
        );
        assert_eq!(next_version(ColumnKind::Int, &Value::Null), Value::Int(1));
    }

    #[test]
    fn test_timestamp_versions_always_advance() {
        let kind = ColumnKind::Timestamp { precision: 0 };
        let far_future = Value::Timestamp(i64::MAX / 2);
        match next_version(kind, &far_future) {
            Value::Timestamp(t) => assert_eq!(t, i64::MAX / 2 + 1_000_000),
            other => panic!("unexpected version {other:?}"),
        }
        match initial_version(kind) {
            Value::Timestamp(t) => assert_eq!(t % 1_000_000, 0),
            other => panic!("unexpected version {other:?}"),
        }
    }

    #[test]
    fn test_verify_compares_fetched_version() {
        let meta = EntityMeta::new("Doc")
            .field(FieldMeta::new("id", ColumnKind::BigInt).primary_key(true))
            .field(FieldMeta::new("rev", ColumnKind::Int).version(true));
        let key = IdentityKey::new("Doc", vec![Value::BigInt(1)]);
        let e = EntityRef::new(1, 0);
        let row = Row::new(vec!["id".into(), "rev".into()], vec![Value::BigInt(1), Value::BigInt(2)]);

        assert!(verify(&meta, e, &key, &Value::Int(2), Some(&row)).is_ok());
        match verify(&meta, e, &key, &Value::Int(1), Some(&row)) {
            Err(Error::OptimisticLock(err)) => {
                assert_eq!(err.actual, Some(Value::Int(2)));
                assert_eq!(err.entity, e);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(matches!(
            verify(&meta, e, &key, &Value::Int(1), None),
            Err(Error::OptimisticLock(_))
        ));
    }
}
