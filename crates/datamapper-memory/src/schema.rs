//! Deriving memory tables from entity metadata.

use crate::table::{ColumnDef, DefaultExpr, TableDef};
use datamapper_core::{
    EntityMeta, Error, FieldDefault, MetadataProvider, MetadataRegistry, Result, Value,
};
use regex::Regex;
use std::sync::OnceLock;

fn literal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:(?P<int>-?\d+)|(?P<float>-?\d+\.\d+)|'(?P<text>(?:[^']|'')*)'|(?P<kw>[A-Za-z_]+))\s*$")
            .unwrap_or_else(|e| panic!("invalid default expression pattern: {e}"))
    })
}

/// Parse a column default expression.
///
/// Supported: integer and decimal literals, single-quoted strings,
/// `NULL`, `TRUE`, `FALSE` and `CURRENT_TIMESTAMP`.
pub fn parse_default(expr: &str) -> Result<DefaultExpr> {
    let unsupported = || Error::Custom(format!("unsupported default expression: {expr}"));
    let caps = literal_re().captures(expr).ok_or_else(unsupported)?;

    if let Some(m) = caps.name("int") {
        let v: i64 = m.as_str().parse().map_err(|_| unsupported())?;
        return Ok(DefaultExpr::Literal(Value::BigInt(v)));
    }
    if let Some(m) = caps.name("float") {
        let v: f64 = m.as_str().parse().map_err(|_| unsupported())?;
        return Ok(DefaultExpr::Literal(Value::Double(v)));
    }
    if let Some(m) = caps.name("text") {
        return Ok(DefaultExpr::Literal(Value::Text(m.as_str().replace("''", "'"))));
    }
    match caps.name("kw").map(|m| m.as_str().to_ascii_uppercase()).as_deref() {
        Some("NULL") => Ok(DefaultExpr::Literal(Value::Null)),
        Some("TRUE") => Ok(DefaultExpr::Literal(Value::Bool(true))),
        Some("FALSE") => Ok(DefaultExpr::Literal(Value::Bool(false))),
        Some("CURRENT_TIMESTAMP" | "NOW") => Ok(DefaultExpr::CurrentTimestamp),
        _ => Err(unsupported()),
    }
}

/// Table definitions for every entity and owning pivot in `registry`,
/// placed in `schema` unless an entity declares its own.
pub fn table_defs(registry: &MetadataRegistry, schema: Option<&str>) -> Result<Vec<TableDef>> {
    let mut defs = Vec::new();
    for meta in registry.entities() {
        defs.push(entity_table(registry, meta, schema)?);
        for rel in &meta.relations {
            let Some(pivot) = rel.pivot.as_ref().filter(|_| rel.owns_pivot()) else {
                continue;
            };
            let target = registry.require(&rel.target)?;
            let name = qualified(meta.effective_schema(schema), &pivot.table);
            let mut def = TableDef::new(name);
            for c in pivot.owner_columns.iter().chain(&pivot.target_columns) {
                def = def.column(ColumnDef::new(c.clone()).not_null());
            }
            def = def
                .primary_key(pivot.owner_columns.iter().chain(&pivot.target_columns).cloned())
                .foreign_key(
                    pivot.owner_columns.clone(),
                    meta.table_ref(schema).to_string(),
                    meta.pk_columns(),
                )
                .foreign_key(
                    pivot.target_columns.clone(),
                    target.table_ref(schema).to_string(),
                    target.pk_columns(),
                );
            defs.push(def);
        }
    }
    Ok(defs)
}

fn qualified(schema: Option<&str>, table: &str) -> String {
    datamapper_core::TableRef::new(schema, table).to_string()
}

fn entity_table(
    registry: &MetadataRegistry,
    meta: &EntityMeta,
    schema: Option<&str>,
) -> Result<TableDef> {
    let mut def = TableDef::new(meta.table_ref(schema).to_string());
    for field in &meta.fields {
        let mut col = ColumnDef::new(field.column.clone());
        if !field.nullable {
            col = col.not_null();
        }
        if field.auto_increment {
            col = col.auto_increment();
        }
        match &field.default {
            Some(FieldDefault::Database(expr) | FieldDefault::Formula(expr)) => {
                col = col.default(parse_default(expr)?);
            }
            Some(FieldDefault::Value(_)) | None => {}
        }
        def = def.column(col);
        if field.unique {
            def = def.unique([field.column.clone()]);
        }
    }
    def = def.primary_key(meta.pk_columns());

    for rel in meta.owning_relations() {
        let target = registry.require(&rel.target)?;
        for c in &rel.join_columns {
            let mut col = ColumnDef::new(c.clone());
            if !rel.nullable {
                col = col.not_null();
            }
            def = def.column(col);
        }
        if matches!(rel.kind, datamapper_core::RelationKind::OneToOne { owner: true }) {
            def = def.unique(rel.join_columns.clone());
        }
        def = def.foreign_key(
            rel.join_columns.clone(),
            target.table_ref(schema).to_string(),
            target.pk_columns(),
        );
    }
    Ok(def)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datamapper_core::{ColumnKind, FieldMeta, PivotTable, RelationMeta};

    #[test]
    fn test_parse_default_literals() {
        assert_eq!(parse_default("0").unwrap(), DefaultExpr::Literal(Value::BigInt(0)));
        assert_eq!(parse_default("-2.5").unwrap(), DefaultExpr::Literal(Value::Double(-2.5)));
        assert_eq!(
            parse_default("'it''s'").unwrap(),
            DefaultExpr::Literal(Value::Text("it's".into()))
        );
        assert_eq!(parse_default("current_timestamp").unwrap(), DefaultExpr::CurrentTimestamp);
        assert_eq!(parse_default("NULL").unwrap(), DefaultExpr::Literal(Value::Null));
        assert!(parse_default("nextval('seq')").is_err());
    }

    #[test]
    fn test_table_defs_from_registry() {
        let registry = MetadataRegistry::builder()
            .entity(
                EntityMeta::new("Author")
                    .field(FieldMeta::new("id", ColumnKind::BigInt).primary_key(true).auto_increment(true))
                    .field(FieldMeta::new("email", ColumnKind::Text).unique(true)),
            )
            .entity(
                EntityMeta::new("Book")
                    .field(FieldMeta::new("id", ColumnKind::BigInt).primary_key(true))
                    .field(
                        FieldMeta::new("created", ColumnKind::Timestamp { precision: 6 })
                            .default(FieldDefault::Database("CURRENT_TIMESTAMP".into())),
                    )
                    .relation(RelationMeta::many_to_one("author", "Author").nullable(false))
                    .relation(RelationMeta::many_to_many("tags", "Tag", PivotTable::new("book_tag"))),
            )
            .entity(EntityMeta::new("Tag").field(FieldMeta::new("id", ColumnKind::BigInt).primary_key(true)))
            .build()
            .unwrap();

        let defs = table_defs(&registry, Some("app")).unwrap();
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["app.author", "app.book", "app.book_tag", "app.tag"]);

        let book = &defs[1];
        assert_eq!(book.column_names(), ["id", "created", "author_id"]);
        assert!(!book.columns[2].nullable);
        assert_eq!(book.columns[1].default, Some(DefaultExpr::CurrentTimestamp));
        assert_eq!(book.foreign_keys[0].references, "app.author");

        let pivot = &defs[2];
        assert_eq!(pivot.primary_key, ["book_id", "tag_id"]);
        assert_eq!(pivot.foreign_keys.len(), 2);
        assert_eq!(defs[0].unique, vec![vec!["email".to_string()]]);
    }
}
