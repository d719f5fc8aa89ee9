//! Identity keys and entity handles.

use crate::value::Value;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// `(schema-qualified entity name, primary-key tuple)`.
///
/// Composite keys compare component-wise. The schema is part of the
/// qualified name, so one entity type placed in two schemas yields
/// disjoint keys.
#[derive(Debug, Clone)]
pub struct IdentityKey {
    entity: Arc<str>,
    pk: Vec<Value>,
}

impl IdentityKey {
    pub fn new(entity: impl Into<Arc<str>>, pk: Vec<Value>) -> Self {
        Self {
            entity: entity.into(),
            pk,
        }
    }

    /// Qualified entity name, e.g. `tenant_a.Book`.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Primary-key components in declaration order.
    pub fn pk(&self) -> &[Value] {
        &self.pk
    }

    pub fn into_pk(self) -> Vec<Value> {
        self.pk
    }
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
            && self.pk.len() == other.pk.len()
            && self.pk.iter().zip(&other.pk).all(|(a, b)| a.key_eq(b))
    }
}

impl Eq for IdentityKey {}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.pk.len().hash(state);
        for component in &self.pk {
            component.hash_key(state);
        }
    }
}

impl Serialize for IdentityKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("IdentityKey", 2)?;
        st.serialize_field("entity", &*self.entity)?;
        st.serialize_field("pk", &self.pk)?;
        st.end()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.entity)?;
        for (i, v) in self.pk.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

/// Handle to an entity living in one session's arena.
///
/// Relations between entities are expressed through handles and identity
/// keys, never through pointers, so cyclic graphs need no shared ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    session: u64,
    slot: u32,
}

impl EntityRef {
    pub const fn new(session: u64, slot: u32) -> Self {
        Self { session, slot }
    }

    /// Id of the owning session generation.
    pub const fn session(&self) -> u64 {
        self.session
    }

    pub const fn slot(&self) -> u32 {
        self.slot
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.session, self.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_composite_keys_compare_componentwise() {
        let a = IdentityKey::new("Seat", vec![Value::Int(1), Value::Text("A".into())]);
        let b = IdentityKey::new("Seat", vec![Value::BigInt(1), Value::Text("A".into())]);
        let c = IdentityKey::new("Seat", vec![Value::Int(1), Value::Text("B".into())]);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
    }

    #[test]
    fn test_schema_is_part_of_identity() {
        let a = IdentityKey::new("tenant_a.Book", vec![Value::Int(1)]);
        let b = IdentityKey::new("tenant_b.Book", vec![Value::Int(1)]);
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "tenant_a.Book(1)");
    }
}
