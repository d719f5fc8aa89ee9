//! Entity manager: the shared, long-lived half of datamapper.
//!
//! An [`EntityManager`] owns the validated metadata registry, the connection
//! pool and the default session configuration. It holds no entities; every
//! unit of work runs in a [`Session`] forked from it, and any number of
//! sessions may run concurrently.
//!
//! # Example
//!
//! ```rust,ignore
//! use datamapper::prelude::*;
//!
//! let manager = EntityManager::builder()
//!     .registry(registry)
//!     .pool_config(PoolConfig::new(4))
//!     .session_config(SessionConfig::new().batch_size(100))
//!     .build(driver)?;
//!
//! // One session per request, in the tenant's schema
//! let session = manager.fork(ForkOptions::new().schema("tenant_a"));
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use datamapper_core::{Driver, Error, MetadataProvider, MetadataRegistry, SessionErrorKind};
use datamapper_pool::{Pool, PoolConfig};
use datamapper_session::{ForkOptions, Session, SessionConfig};

/// Shared registry, pool and configuration from which sessions are forked.
#[derive(Debug)]
pub struct EntityManager<D: Driver> {
    registry: Arc<MetadataRegistry>,
    pool: Pool<D>,
    config: SessionConfig,
}

impl<D: Driver> Clone for EntityManager<D> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            pool: self.pool.clone(),
            config: self.config.clone(),
        }
    }
}

impl<D: Driver> EntityManager<D> {
    /// Create a manager over an existing pool.
    pub fn new(registry: Arc<MetadataRegistry>, pool: Pool<D>, config: SessionConfig) -> Self {
        Self {
            registry,
            pool,
            config,
        }
    }

    /// Create a manager builder.
    #[must_use]
    pub fn builder() -> EntityManagerBuilder<D> {
        EntityManagerBuilder::new()
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Pool<D> {
        &self.pool
    }

    /// Configuration every forked session starts from.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start an empty session.
    ///
    /// The manager tracks no entities, so `options.clear` has nothing to
    /// copy; `options.schema` overrides the configured default schema.
    pub fn fork(&self, options: ForkOptions) -> Session<D> {
        let mut config = self.config.clone();
        if let Some(schema) = options.schema {
            config.default_schema = Some(schema);
        }
        tracing::debug!(schema = ?config.default_schema, "Forking session");
        Session::new(Arc::clone(&self.registry), self.pool.clone(), config)
    }

    /// Start an empty session in the default schema.
    pub fn session(&self) -> Session<D> {
        self.fork(ForkOptions::default())
    }
}

/// Builder for [`EntityManager`].
#[derive(Debug)]
pub struct EntityManagerBuilder<D: Driver> {
    registry: Option<Arc<MetadataRegistry>>,
    pool_config: PoolConfig,
    session_config: SessionConfig,
    _marker: PhantomData<D>,
}

impl<D: Driver> Default for EntityManagerBuilder<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Driver> EntityManagerBuilder<D> {
    /// Create a new builder with default pool and session configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: None,
            pool_config: PoolConfig::default(),
            session_config: SessionConfig::default(),
            _marker: PhantomData,
        }
    }

    /// Set the metadata registry.
    #[must_use]
    pub fn registry(mut self, registry: MetadataRegistry) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    /// Set a registry shared with other managers.
    #[must_use]
    pub fn shared_registry(mut self, registry: Arc<MetadataRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    #[must_use]
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Build the manager, creating a pool over `driver`.
    ///
    /// Fails if no registry was set or the pool configuration is invalid.
    pub fn build(self, driver: D) -> Result<EntityManager<D>, Error> {
        let Some(registry) = self.registry else {
            return Err(Error::session(
                SessionErrorKind::InvalidState,
                "entity manager needs a metadata registry",
            ));
        };
        let pool = Pool::new(driver, self.pool_config)?;
        tracing::info!(
            entities = registry.entities().len(),
            max_connections = pool.config().max_connections,
            "Entity manager ready"
        );
        Ok(EntityManager::new(registry, pool, self.session_config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datamapper_core::{ColumnKind, EntityMeta, FieldMeta};
    use datamapper_memory::MemoryDriver;

    fn registry() -> MetadataRegistry {
        MetadataRegistry::builder()
            .entity(
                EntityMeta::new("Note")
                    .field(FieldMeta::new("id", ColumnKind::BigInt).primary_key(true))
                    .field(FieldMeta::new("body", ColumnKind::Text)),
            )
            .build()
            .expect("registry")
    }

    #[test]
    fn test_builder_requires_registry() {
        let err = EntityManager::builder().build(MemoryDriver::new()).unwrap_err();
        assert!(matches!(err, Error::Session(_)));
    }

    #[test]
    fn test_builder_rejects_invalid_pool_config() {
        let err = EntityManager::builder()
            .registry(registry())
            .pool_config(PoolConfig::new(0))
            .build(MemoryDriver::new())
            .unwrap_err();
        assert!(matches!(err, Error::Pool(_)));
    }

    #[test]
    fn test_forks_are_independent_sessions() {
        let manager = EntityManager::builder()
            .registry(registry())
            .session_config(SessionConfig::new().default_schema("main"))
            .build(MemoryDriver::new())
            .expect("manager");

        let a = manager.session();
        let b = manager.fork(ForkOptions::new().schema("tenant_b"));
        assert_ne!(a.generation(), b.generation());
        assert_eq!(a.schema(), Some("main"));
        assert_eq!(b.schema(), Some("tenant_b"));
        assert!(Arc::ptr_eq(a.registry(), b.registry()));
    }
}
