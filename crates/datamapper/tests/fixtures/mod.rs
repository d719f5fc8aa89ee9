#![allow(dead_code)]

use std::sync::Arc;

use asupersync::runtime::RuntimeBuilder;
use datamapper::prelude::*;
use datamapper_memory::MemoryDriver;

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn block_on<F: Future<Output = ()>>(future: F) {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(future);
}

pub fn id() -> FieldMeta {
    FieldMeta::new("id", ColumnKind::BigInt)
        .primary_key(true)
        .auto_increment(true)
}

pub fn text(name: &str) -> FieldMeta {
    FieldMeta::new(name, ColumnKind::Text)
}

/// Authors, books and tags, versioned documents, posts owning their
/// comments, and employees and departments referencing each other.
pub fn library() -> MetadataRegistry {
    MetadataRegistry::builder()
        .entity(
            EntityMeta::new("Author")
                .field(id())
                .field(text("name"))
                .relation(
                    RelationMeta::one_to_many("books", "Book", "author")
                        .cascade(&[Cascade::Persist, Cascade::Remove]),
                ),
        )
        .entity(
            EntityMeta::new("Book")
                .field(id())
                .field(text("title"))
                .relation(RelationMeta::many_to_one("author", "Author").nullable(false))
                .relation(RelationMeta::many_to_many("tags", "Tag", PivotTable::new("book_tag"))),
        )
        .entity(
            EntityMeta::new("Tag")
                .field(id())
                .field(text("label").unique(true))
                .relation(RelationMeta::many_to_many_inverse("books", "Book", "tags")),
        )
        .entity(
            EntityMeta::new("Document")
                .field(id())
                .field(text("title"))
                .field(FieldMeta::new("rev", ColumnKind::Int).version(true)),
        )
        .entity(
            EntityMeta::new("Post")
                .field(id())
                .field(text("title"))
                .relation(
                    RelationMeta::one_to_many("comments", "Comment", "post")
                        .cascade(&[Cascade::All])
                        .orphan_removal(true),
                ),
        )
        .entity(
            EntityMeta::new("Comment")
                .field(id())
                .field(text("body"))
                .relation(RelationMeta::many_to_one("post", "Post").nullable(false)),
        )
        .entity(
            EntityMeta::new("Employee")
                .field(id())
                .field(text("name"))
                .relation(RelationMeta::many_to_one("department", "Department").cascade(&[])),
        )
        .entity(
            EntityMeta::new("Department")
                .field(id())
                .field(text("name"))
                .relation(RelationMeta::many_to_one("manager", "Employee").nullable(false)),
        )
        .build()
        .expect("library registry")
}

/// A manager over a fresh in-memory database with tables for `registry`
/// created in each of `schemas`.
pub fn manager_with(
    registry: MetadataRegistry,
    config: SessionConfig,
    schemas: &[Option<&str>],
) -> (EntityManager<MemoryDriver>, MemoryDriver) {
    let registry = Arc::new(registry);
    let driver = MemoryDriver::new();
    for schema in schemas {
        driver.install(&registry, *schema).expect("install tables");
    }
    let manager = EntityManager::builder()
        .shared_registry(registry)
        .session_config(config)
        .build(driver.clone())
        .expect("entity manager");
    (manager, driver)
}

pub fn library_manager() -> (EntityManager<MemoryDriver>, MemoryDriver) {
    manager_with(library(), SessionConfig::default(), &[None])
}

pub fn count(statements: &[String], prefix: &str) -> usize {
    statements.iter().filter(|s| s.starts_with(prefix)).count()
}

pub fn position(statements: &[String], prefix: &str) -> usize {
    statements
        .iter()
        .position(|s| s.starts_with(prefix))
        .unwrap_or_else(|| panic!("no statement starting with {prefix:?} in {statements:?}"))
}

pub fn int_column(row: &Row, column: &str) -> Option<i64> {
    row.get_by_name(column).and_then(Value::as_i64)
}

pub fn key_value(session: &Session<MemoryDriver>, entity: EntityRef) -> i64 {
    session
        .key_of(entity)
        .expect("tracked entity")
        .and_then(|key| key.pk()[0].as_i64())
        .expect("entity has a key")
}
