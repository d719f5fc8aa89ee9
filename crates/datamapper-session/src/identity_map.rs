//! Identity Map: one live instance per identity key.
//!
//! The map is consulted whenever rows are hydrated (so a second load
//! returns the existing instance) and whenever cascades or references need
//! to resolve a key to a session entity.

use datamapper_core::{EntityRef, Error, IdentityConflictError, IdentityKey, Result};
use std::collections::HashMap;

/// Maps identity keys to session entities.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    entries: HashMap<IdentityKey, EntityRef>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entity` under `key`.
    ///
    /// Registering the same instance twice is a no-op; a different instance
    /// under an equal key fails with `IdentityConflict`.
    pub fn register(&mut self, key: IdentityKey, entity: EntityRef) -> Result<()> {
        match self.entries.get(&key) {
            Some(existing) if *existing == entity => Ok(()),
            Some(existing) => Err(Error::IdentityConflict(IdentityConflictError {
                key,
                existing: *existing,
                incoming: entity,
            })),
            None => {
                tracing::trace!(key = %key, entity = %entity, "Registered identity");
                self.entries.insert(key, entity);
                Ok(())
            }
        }
    }

    /// Would registering `entity` under `key` conflict?
    pub fn check(&self, key: &IdentityKey, entity: EntityRef) -> Result<()> {
        match self.entries.get(key) {
            Some(existing) if *existing != entity => {
                Err(Error::IdentityConflict(IdentityConflictError {
                    key: key.clone(),
                    existing: *existing,
                    incoming: entity,
                }))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn map_refs(&mut self, f: impl Fn(EntityRef) -> EntityRef) {
        for r in self.entries.values_mut() {
            *r = f(*r);
        }
    }

    pub fn lookup(&self, key: &IdentityKey) -> Option<EntityRef> {
        self.entries.get(key).copied()
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn forget(&mut self, key: &IdentityKey) -> Option<EntityRef> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &IdentityKey> {
        self.entries.keys()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datamapper_core::Value;

    fn key(pk: i64) -> IdentityKey {
        IdentityKey::new("Book", vec![Value::BigInt(pk)])
    }

    #[test]
    fn test_identity_map_register_and_lookup() {
        let mut map = IdentityMap::new();
        let a = EntityRef::new(1, 0);
        map.register(key(1), a).unwrap();
        assert_eq!(map.lookup(&key(1)), Some(a));
        assert_eq!(map.lookup(&IdentityKey::new("Book", vec![Value::Int(1)])), Some(a));
        assert!(map.lookup(&key(2)).is_none());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_identity_map_register_same_instance_is_idempotent() {
        let mut map = IdentityMap::new();
        let a = EntityRef::new(1, 0);
        map.register(key(1), a).unwrap();
        map.register(key(1), a).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_identity_map_conflict() {
        let mut map = IdentityMap::new();
        let a = EntityRef::new(1, 0);
        let b = EntityRef::new(1, 1);
        map.register(key(1), a).unwrap();
        let err = map.register(key(1), b).unwrap_err();
        match err {
            Error::IdentityConflict(c) => {
                assert_eq!(c.existing, a);
                assert_eq!(c.incoming, b);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(map.check(&key(1), b).is_err());
        assert!(map.check(&key(2), b).is_ok());
    }

    #[test]
    fn test_identity_map_forget() {
        let mut map = IdentityMap::new();
        let a = EntityRef::new(1, 0);
        map.register(key(1), a).unwrap();
        assert_eq!(map.forget(&key(1)), Some(a));
        assert!(map.is_empty());
        map.register(key(1), EntityRef::new(1, 5)).unwrap();
    }
}
