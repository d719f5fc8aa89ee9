//! Entity metadata: fields, relations and the validated registry.
//!
//! Metadata is described explicitly with builders, validated once by
//! [`MetadataRegistryBuilder::build`], and then shared read-only (behind
//! `Arc`) by every session forked from it.

use crate::error::{Error, MetadataErrorKind, Result};
use crate::identifiers::{is_valid_identifier, qualify};
use crate::statement::TableRef;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

// ============================================================================
// Column kinds
// ============================================================================

/// Declared storage kind of a scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Bool,
    SmallInt,
    Int,
    BigInt,
    Double,
    /// Fixed-point decimal with `scale` fractional digits
    Decimal {
        scale: u8,
    },
    Text,
    Bytes,
    Date,
    Time,
    /// Timestamp keeping `precision` fractional second digits (0..=6)
    Timestamp {
        precision: u8,
    },
    Uuid,
    Json,
}

const MICROS_PER_DAY: i64 = 86_400_000_000;

impl ColumnKind {
    /// Coerce a value to this kind's canonical representation.
    ///
    /// Values that cannot be coerced are returned unchanged so the driver
    /// reports the mismatch.
    pub fn normalize(&self, value: Value) -> Value {
        if value.is_null() {
            return value;
        }
        match self {
            ColumnKind::Bool => value.as_bool().map_or(value, Value::Bool),
            ColumnKind::SmallInt => match value.as_i64().map(i16::try_from) {
                Some(Ok(v)) => Value::SmallInt(v),
                _ => value,
            },
            ColumnKind::Int => match value.as_i64().map(i32::try_from) {
                Some(Ok(v)) => Value::Int(v),
                _ => value,
            },
            ColumnKind::BigInt => value.as_i64().map_or(value, Value::BigInt),
            ColumnKind::Double => value.as_f64().map_or(value, Value::Double),
            ColumnKind::Decimal { scale } => match decimal_text(&value) {
                Some(text) => Value::Decimal(rescale_decimal(&text, *scale)),
                None => value,
            },
            ColumnKind::Timestamp { precision } => {
                let micros = match value {
                    Value::Timestamp(t) => t,
                    Value::Date(d) => i64::from(d) * MICROS_PER_DAY,
                    other => return other,
                };
                let step = 10_i64.pow(u32::from(6 - (*precision).min(6)));
                Value::Timestamp(micros - micros.rem_euclid(step))
            }
            ColumnKind::Date => match value {
                Value::Timestamp(t) => {
                    Value::Date(i32::try_from(t.div_euclid(MICROS_PER_DAY)).unwrap_or(i32::MAX))
                }
                other => other,
            },
            ColumnKind::Text => match value {
                Value::Decimal(s) => Value::Text(s),
                other => other,
            },
            ColumnKind::Bytes
            | ColumnKind::Time
            | ColumnKind::Uuid
            | ColumnKind::Json => value,
        }
    }

    /// Can this kind carry an optimistic-lock version?
    pub const fn is_versionable(&self) -> bool {
        matches!(
            self,
            ColumnKind::SmallInt | ColumnKind::Int | ColumnKind::BigInt | ColumnKind::Timestamp { .. }
        )
    }
}

fn decimal_text(value: &Value) -> Option<String> {
    match value {
        Value::Decimal(s) | Value::Text(s) => Some(s.clone()),
        Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {
            value.as_i64().map(|i| i.to_string())
        }
        _ => None,
    }
}

fn rescale_decimal(text: &str, scale: u8) -> String {
    let text = text.trim();
    let (int_part, frac_part) = text.split_once('.').unwrap_or((text, ""));
    let int_part = if int_part.is_empty() || int_part == "-" {
        format!("{int_part}0")
    } else {
        int_part.to_string()
    };
    if scale == 0 {
        return int_part;
    }
    let mut frac: String = frac_part.chars().take(usize::from(scale)).collect();
    while frac.len() < usize::from(scale) {
        frac.push('0');
    }
    format!("{int_part}.{frac}")
}

// ============================================================================
// Fields
// ============================================================================

/// Where a field's value comes from when the application leaves it unset.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDefault {
    /// Filled in by the session when the entity is created
    Value(Value),
    /// Supplied by the database column default (SQL expression)
    Database(String),
    /// Computed by the database per row (SQL expression)
    Formula(String),
}

/// Metadata about one scalar field.
#[derive(Debug, Clone)]
pub struct FieldMeta {
    pub name: String,
    /// Column name (defaults to the field name)
    pub column: String,
    pub kind: ColumnKind,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    /// Optimistic-lock version column
    pub version: bool,
    pub unique: bool,
    pub default: Option<FieldDefault>,
}

impl FieldMeta {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            kind,
            nullable: false,
            primary_key: false,
            auto_increment: false,
            version: false,
            unique: false,
            default: None,
        }
    }

    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    #[must_use]
    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    #[must_use]
    pub fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    #[must_use]
    pub fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }

    #[must_use]
    pub fn version(mut self, value: bool) -> Self {
        self.version = value;
        self
    }

    #[must_use]
    pub fn unique(mut self, value: bool) -> Self {
        self.unique = value;
        self
    }

    #[must_use]
    pub fn default(mut self, default: FieldDefault) -> Self {
        self.default = Some(default);
        self
    }

    /// Does the database produce this column's value on insert?
    pub fn is_database_generated(&self) -> bool {
        self.auto_increment
            || matches!(
                self.default,
                Some(FieldDefault::Database(_) | FieldDefault::Formula(_))
            )
    }
}

// ============================================================================
// Relations
// ============================================================================

/// A cascade policy member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cascade {
    Persist,
    Remove,
    Merge,
    /// Every policy above
    All,
}

/// Set of cascade policies on one relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CascadeSet(u8);

impl CascadeSet {
    pub const NONE: Self = Self(0);
    pub const PERSIST: Self = Self(1);
    pub const REMOVE: Self = Self(1 << 1);
    pub const MERGE: Self = Self(1 << 2);
    pub const ALL: Self = Self(0b111);

    const fn bit(cascade: Cascade) -> u8 {
        match cascade {
            Cascade::Persist => Self::PERSIST.0,
            Cascade::Remove => Self::REMOVE.0,
            Cascade::Merge => Self::MERGE.0,
            Cascade::All => Self::ALL.0,
        }
    }

    pub const fn contains(self, cascade: Cascade) -> bool {
        let bit = Self::bit(cascade);
        self.0 & bit == bit
    }

    #[must_use]
    pub const fn with(self, cascade: Cascade) -> Self {
        Self(self.0 | Self::bit(cascade))
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<Cascade> for CascadeSet {
    fn from_iter<I: IntoIterator<Item = Cascade>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, CascadeSet::with)
    }
}

/// Relation cardinality and side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    ManyToOne,
    OneToOne { owner: bool },
    OneToMany,
    ManyToMany { owner: bool },
}

/// Pivot table backing an owning many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotTable {
    pub table: String,
    /// Columns referencing the owning entity's key
    pub owner_columns: Vec<String>,
    /// Columns referencing the target entity's key
    pub target_columns: Vec<String>,
}

impl PivotTable {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            owner_columns: Vec::new(),
            target_columns: Vec::new(),
        }
    }

    #[must_use]
    pub fn owner_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.owner_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn target_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_columns = columns.into_iter().map(Into::into).collect();
        self
    }
}

/// Metadata about one relation field.
#[derive(Debug, Clone)]
pub struct RelationMeta {
    pub name: String,
    pub kind: RelationKind,
    /// Target entity name
    pub target: String,
    /// Foreign-key columns on the owning side, in target key order
    pub join_columns: Vec<String>,
    /// Owning relation on the target (inverse sides only)
    pub mapped_by: Option<String>,
    pub pivot: Option<PivotTable>,
    /// Whether the foreign key may be NULL
    pub nullable: bool,
    pub cascade: CascadeSet,
    pub orphan_removal: bool,
}

impl RelationMeta {
    fn base(name: impl Into<String>, kind: RelationKind, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            target: target.into(),
            join_columns: Vec::new(),
            mapped_by: None,
            pivot: None,
            nullable: true,
            cascade: CascadeSet::PERSIST,
            orphan_removal: false,
        }
    }

    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::base(name, RelationKind::ManyToOne, target)
    }

    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::base(name, RelationKind::OneToOne { owner: true }, target)
    }

    pub fn one_to_one_inverse(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        let mut rel = Self::base(name, RelationKind::OneToOne { owner: false }, target);
        rel.mapped_by = Some(mapped_by.into());
        rel
    }

    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        let mut rel = Self::base(name, RelationKind::OneToMany, target);
        rel.mapped_by = Some(mapped_by.into());
        rel
    }

    pub fn many_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        pivot: PivotTable,
    ) -> Self {
        let mut rel = Self::base(name, RelationKind::ManyToMany { owner: true }, target);
        rel.pivot = Some(pivot);
        rel
    }

    pub fn many_to_many_inverse(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        let mut rel = Self::base(name, RelationKind::ManyToMany { owner: false }, target);
        rel.mapped_by = Some(mapped_by.into());
        rel
    }

    #[must_use]
    pub fn join_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.join_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    #[must_use]
    pub fn cascade(mut self, policies: &[Cascade]) -> Self {
        self.cascade = policies.iter().copied().collect();
        self
    }

    #[must_use]
    pub fn orphan_removal(mut self, value: bool) -> Self {
        self.orphan_removal = value;
        self
    }

    /// Is the foreign key stored on this side (ManyToOne or owning OneToOne)?
    pub const fn owns_foreign_key(&self) -> bool {
        matches!(
            self.kind,
            RelationKind::ManyToOne | RelationKind::OneToOne { owner: true }
        )
    }

    /// Is this side a collection?
    pub const fn is_collection(&self) -> bool {
        matches!(
            self.kind,
            RelationKind::OneToMany | RelationKind::ManyToMany { .. }
        )
    }

    /// Does this side own a pivot table?
    pub const fn owns_pivot(&self) -> bool {
        matches!(self.kind, RelationKind::ManyToMany { owner: true })
    }

    /// Does this relation's policy include `cascade`? Orphan removal implies `Remove`.
    pub fn cascades(&self, cascade: Cascade) -> bool {
        self.cascade.contains(cascade) || (cascade == Cascade::Remove && self.orphan_removal)
    }
}

// ============================================================================
// Entities
// ============================================================================

/// Metadata about one entity type.
#[derive(Debug, Clone)]
pub struct EntityMeta {
    pub name: String,
    /// Explicit schema; sessions fall back to their default schema
    pub schema: Option<String>,
    pub table: String,
    pub fields: Vec<FieldMeta>,
    pub relations: Vec<RelationMeta>,
    /// Declaration order inside the registry
    pub order: usize,
}

impl EntityMeta {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.to_lowercase(),
            name,
            schema: None,
            fields: Vec::new(),
            relations: Vec::new(),
            order: 0,
        }
    }

    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    #[must_use]
    pub fn field(mut self, field: FieldMeta) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn relation(mut self, relation: RelationMeta) -> Self {
        self.relations.push(relation);
        self
    }

    /// Primary-key fields in declaration order.
    pub fn primary_key(&self) -> impl Iterator<Item = &FieldMeta> {
        self.fields.iter().filter(|f| f.primary_key)
    }

    pub fn pk_columns(&self) -> Vec<String> {
        self.primary_key().map(|f| f.column.clone()).collect()
    }

    pub fn version_field(&self) -> Option<&FieldMeta> {
        self.fields.iter().find(|f| f.version)
    }

    pub fn field_named(&self, name: &str) -> Option<&FieldMeta> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_column(&self, column: &str) -> Option<&FieldMeta> {
        self.fields.iter().find(|f| f.column == column)
    }

    pub fn relation_named(&self, name: &str) -> Option<&RelationMeta> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Relations that store a foreign key on this entity's table.
    pub fn owning_relations(&self) -> impl Iterator<Item = &RelationMeta> {
        self.relations.iter().filter(|r| r.owns_foreign_key())
    }

    /// Effective schema given a session default.
    pub fn effective_schema<'a>(&'a self, default_schema: Option<&'a str>) -> Option<&'a str> {
        self.schema.as_deref().or(default_schema)
    }

    /// Schema-qualified entity name used in identity keys.
    pub fn qualified_name(&self, default_schema: Option<&str>) -> String {
        qualify(self.effective_schema(default_schema), &self.name)
    }

    pub fn table_ref(&self, default_schema: Option<&str>) -> TableRef {
        TableRef::new(self.effective_schema(default_schema), &self.table)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Read-only source of entity metadata consumed by sessions.
pub trait MetadataProvider: Send + Sync {
    /// Look up an entity by name.
    fn entity(&self, name: &str) -> Option<&Arc<EntityMeta>>;

    /// All entities in declaration order.
    fn entities(&self) -> &[Arc<EntityMeta>];

    /// Look up an entity, failing with `UnknownEntity`.
    fn require(&self, name: &str) -> Result<&Arc<EntityMeta>> {
        self.entity(name).ok_or_else(|| {
            Error::metadata(
                MetadataErrorKind::UnknownEntity,
                Some(name),
                "entity is not registered",
            )
        })
    }
}

/// Validated, immutable set of entity metadata.
#[derive(Debug, Clone)]
pub struct MetadataRegistry {
    entities: Vec<Arc<EntityMeta>>,
    by_name: HashMap<String, usize>,
}

impl MetadataRegistry {
    #[must_use]
    pub fn builder() -> MetadataRegistryBuilder {
        MetadataRegistryBuilder::default()
    }

    /// The relation on the other side of `relation`, if it is declared.
    pub fn inverse_of(
        &self,
        owner: &EntityMeta,
        relation: &RelationMeta,
    ) -> Option<(&Arc<EntityMeta>, &RelationMeta)> {
        let target = self.entity(&relation.target)?;
        let inverse = match &relation.mapped_by {
            Some(mapped_by) => target.relation_named(mapped_by),
            None => target.relations.iter().find(|r| {
                r.target == owner.name && r.mapped_by.as_deref() == Some(relation.name.as_str())
            }),
        }?;
        Some((target, inverse))
    }
}

impl MetadataProvider for MetadataRegistry {
    fn entity(&self, name: &str) -> Option<&Arc<EntityMeta>> {
        self.by_name.get(name).map(|&i| &self.entities[i])
    }

    fn entities(&self) -> &[Arc<EntityMeta>] {
        &self.entities
    }
}

/// Collects entity declarations and validates them as a whole.
#[derive(Debug, Default)]
pub struct MetadataRegistryBuilder {
    entities: Vec<EntityMeta>,
}

impl MetadataRegistryBuilder {
    #[must_use]
    pub fn entity(mut self, meta: EntityMeta) -> Self {
        self.entities.push(meta);
        self
    }

    /// Validate every declaration and freeze the registry.
    pub fn build(mut self) -> Result<MetadataRegistry> {
        let mut by_name = HashMap::new();
        for (i, meta) in self.entities.iter_mut().enumerate() {
            meta.order = i;
            if by_name.insert(meta.name.clone(), i).is_some() {
                return Err(Error::metadata(
                    MetadataErrorKind::DuplicateEntity,
                    Some(&meta.name),
                    "entity declared twice",
                ));
            }
            validate_entity(meta)?;
        }

        // Derive default join and pivot columns now that every key is known.
        let key_columns: Vec<(String, String, Vec<String>)> = self
            .entities
            .iter()
            .map(|m| (m.name.clone(), m.table.clone(), m.pk_columns()))
            .collect();
        let lookup = |name: &str| key_columns.iter().find(|(n, _, _)| n == name);

        for meta in &mut self.entities {
            let own_table = meta.table.clone();
            let own_pk = meta.pk_columns();
            for rel in &mut meta.relations {
                let Some((_, target_table, target_pk)) = lookup(&rel.target) else {
                    return Err(Error::metadata(
                        MetadataErrorKind::UnknownEntity,
                        Some(&meta.name),
                        format!("relation '{}' targets unknown entity '{}'", rel.name, rel.target),
                    ));
                };
                if rel.owns_foreign_key() {
                    if rel.join_columns.is_empty() {
                        rel.join_columns =
                            target_pk.iter().map(|c| format!("{}_{}", rel.name, c)).collect();
                    }
                    if rel.join_columns.len() != target_pk.len() {
                        return Err(Error::metadata(
                            MetadataErrorKind::InvalidRelation,
                            Some(&meta.name),
                            format!(
                                "relation '{}' has {} join columns but '{}' has a {}-column key",
                                rel.name,
                                rel.join_columns.len(),
                                rel.target,
                                target_pk.len()
                            ),
                        ));
                    }
                }
                if let Some(pivot) = rel.pivot.as_mut() {
                    if pivot.owner_columns.is_empty() {
                        pivot.owner_columns =
                            own_pk.iter().map(|c| format!("{own_table}_{c}")).collect();
                    }
                    if pivot.target_columns.is_empty() {
                        pivot.target_columns =
                            target_pk.iter().map(|c| format!("{target_table}_{c}")).collect();
                    }
                    if pivot.owner_columns.len() != own_pk.len()
                        || pivot.target_columns.len() != target_pk.len()
                    {
                        return Err(Error::metadata(
                            MetadataErrorKind::InvalidRelation,
                            Some(&meta.name),
                            format!("pivot of '{}' does not match the key widths", rel.name),
                        ));
                    }
                }
            }
        }

        let registry = MetadataRegistry {
            entities: self.entities.into_iter().map(Arc::new).collect(),
            by_name,
        };
        for meta in &registry.entities {
            for rel in &meta.relations {
                validate_relation_pair(&registry, meta, rel)?;
            }
        }

        tracing::debug!(entities = registry.entities.len(), "Metadata registry built");
        Ok(registry)
    }
}

fn validate_entity(meta: &EntityMeta) -> Result<()> {
    let name = meta.name.as_str();
    let mut idents = vec![meta.name.as_str(), meta.table.as_str()];
    idents.extend(meta.schema.as_deref());
    idents.extend(meta.fields.iter().map(|f| f.column.as_str()));
    for rel in &meta.relations {
        idents.extend(rel.join_columns.iter().map(String::as_str));
        if let Some(pivot) = &rel.pivot {
            idents.push(pivot.table.as_str());
            idents.extend(pivot.owner_columns.iter().map(String::as_str));
            idents.extend(pivot.target_columns.iter().map(String::as_str));
        }
    }
    if let Some(bad) = idents.iter().find(|i| !is_valid_identifier(i)) {
        return Err(Error::metadata(
            MetadataErrorKind::InvalidIdentifier,
            Some(name),
            format!("'{bad}' is not a valid identifier"),
        ));
    }

    if meta.primary_key().next().is_none() {
        return Err(Error::metadata(
            MetadataErrorKind::MissingPrimaryKey,
            Some(name),
            "entity declares no primary key",
        ));
    }
    if meta.primary_key().any(|f| f.nullable) {
        return Err(Error::metadata(
            MetadataErrorKind::MissingPrimaryKey,
            Some(name),
            "primary key fields cannot be nullable",
        ));
    }

    let versions: Vec<_> = meta.fields.iter().filter(|f| f.version).collect();
    if versions.len() > 1 {
        return Err(Error::metadata(
            MetadataErrorKind::InvalidVersionField,
            Some(name),
            "at most one version field is allowed",
        ));
    }
    if let Some(v) = versions.first() {
        if !v.kind.is_versionable() || v.primary_key {
            return Err(Error::metadata(
                MetadataErrorKind::InvalidVersionField,
                Some(name),
                format!("field '{}' cannot carry a version", v.name),
            ));
        }
    }

    let mut seen = std::collections::HashSet::new();
    for n in meta
        .fields
        .iter()
        .map(|f| &f.name)
        .chain(meta.relations.iter().map(|r| &r.name))
    {
        if !seen.insert(n.as_str()) {
            return Err(Error::metadata(
                MetadataErrorKind::InvalidRelation,
                Some(name),
                format!("member '{n}' declared twice"),
            ));
        }
    }

    for rel in &meta.relations {
        let needs_mapped_by = matches!(
            rel.kind,
            RelationKind::OneToMany
                | RelationKind::OneToOne { owner: false }
                | RelationKind::ManyToMany { owner: false }
        );
        if needs_mapped_by && rel.mapped_by.is_none() {
            return Err(Error::metadata(
                MetadataErrorKind::InvalidRelation,
                Some(name),
                format!("inverse relation '{}' needs mapped_by", rel.name),
            ));
        }
        if rel.owns_pivot() && rel.pivot.is_none() {
            return Err(Error::metadata(
                MetadataErrorKind::InvalidRelation,
                Some(name),
                format!("many-to-many '{}' needs a pivot table", rel.name),
            ));
        }
        if rel.orphan_removal
            && !matches!(
                rel.kind,
                RelationKind::OneToMany | RelationKind::OneToOne { owner: true }
            )
        {
            return Err(Error::metadata(
                MetadataErrorKind::InvalidRelation,
                Some(name),
                format!("orphan removal is not supported on '{}'", rel.name),
            ));
        }
    }
    Ok(())
}

fn validate_relation_pair(
    registry: &MetadataRegistry,
    meta: &EntityMeta,
    rel: &RelationMeta,
) -> Result<()> {
    let Some(mapped_by) = &rel.mapped_by else {
        return Ok(());
    };
    let target = registry.require(&rel.target)?;
    let Some(owning) = target.relation_named(mapped_by) else {
        return Err(Error::metadata(
            MetadataErrorKind::UnknownRelation,
            Some(&meta.name),
            format!("'{}' is mapped by unknown '{}.{}'", rel.name, target.name, mapped_by),
        ));
    };
    let compatible = match rel.kind {
        RelationKind::OneToMany => owning.kind == RelationKind::ManyToOne,
        RelationKind::OneToOne { owner: false } => {
            owning.kind == RelationKind::OneToOne { owner: true }
        }
        RelationKind::ManyToMany { owner: false } => {
            owning.kind == RelationKind::ManyToMany { owner: true }
        }
        _ => false,
    };
    if !compatible || owning.target != meta.name {
        return Err(Error::metadata(
            MetadataErrorKind::InvalidRelation,
            Some(&meta.name),
            format!(
                "'{}' is not a valid inverse of '{}.{}'",
                rel.name, target.name, mapped_by
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author() -> EntityMeta {
        EntityMeta::new("Author")
            .field(FieldMeta::new("id", ColumnKind::BigInt).primary_key(true).auto_increment(true))
            .field(FieldMeta::new("name", ColumnKind::Text))
            .relation(RelationMeta::one_to_many("books", "Book", "author"))
    }

    fn book() -> EntityMeta {
        EntityMeta::new("Book")
            .field(FieldMeta::new("id", ColumnKind::BigInt).primary_key(true).auto_increment(true))
            .field(FieldMeta::new("version", ColumnKind::Int).version(true))
            .relation(RelationMeta::many_to_one("author", "Author").nullable(false))
    }

    #[test]
    fn test_build_derives_join_columns() {
        let registry = MetadataRegistry::builder()
            .entity(author())
            .entity(book())
            .build()
            .unwrap();
        let book = registry.entity("Book").unwrap();
        assert_eq!(book.relation_named("author").unwrap().join_columns, vec!["author_id"]);
        assert_eq!(book.order, 1);
        assert_eq!(book.version_field().unwrap().name, "version");

        let author = registry.entity("Author").unwrap();
        let (target, inverse) = registry
            .inverse_of(author, author.relation_named("books").unwrap())
            .unwrap();
        assert_eq!(target.name, "Book");
        assert_eq!(inverse.name, "author");
    }

    #[test]
    fn test_rejects_unknown_target() {
        let err = MetadataRegistry::builder().entity(book()).build().unwrap_err();
        assert!(matches!(
            err,
            Error::Metadata(ref e) if e.kind == MetadataErrorKind::UnknownEntity
        ));
    }

    #[test]
    fn test_rejects_bad_identifier_and_missing_key() {
        let err = MetadataRegistry::builder()
            .entity(author().table("au thor"))
            .entity(book())
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Metadata(ref e) if e.kind == MetadataErrorKind::InvalidIdentifier
        ));

        let keyless = EntityMeta::new("Note").field(FieldMeta::new("body", ColumnKind::Text));
        let err = MetadataRegistry::builder().entity(keyless).build().unwrap_err();
        assert!(matches!(
            err,
            Error::Metadata(ref e) if e.kind == MetadataErrorKind::MissingPrimaryKey
        ));
    }

    #[test]
    fn test_rejects_mismatched_inverse() {
        let author = EntityMeta::new("Author")
            .field(FieldMeta::new("id", ColumnKind::BigInt).primary_key(true))
            .relation(RelationMeta::one_to_many("books", "Book", "title"));
        let book = EntityMeta::new("Book")
            .field(FieldMeta::new("id", ColumnKind::BigInt).primary_key(true))
            .field(FieldMeta::new("title", ColumnKind::Text));
        let err = MetadataRegistry::builder()
            .entity(author)
            .entity(book)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Metadata(ref e) if e.kind == MetadataErrorKind::UnknownRelation
        ));
    }

    #[test]
    fn test_cascade_set() {
        let set: CascadeSet = [Cascade::Persist, Cascade::Remove].into_iter().collect();
        assert!(set.contains(Cascade::Remove));
        assert!(!set.contains(Cascade::Merge));
        assert!(!set.contains(Cascade::All));
        assert!(CascadeSet::ALL.contains(Cascade::Merge));

        let rel = RelationMeta::one_to_many("items", "Item", "order").orphan_removal(true);
        assert!(rel.cascades(Cascade::Remove));
    }

    #[test]
    fn test_normalize_timestamp_and_integers() {
        let kind = ColumnKind::Timestamp { precision: 3 };
        assert_eq!(kind.normalize(Value::Timestamp(1_234_567)), Value::Timestamp(1_234_000));
        assert_eq!(ColumnKind::BigInt.normalize(Value::Int(4)), Value::BigInt(4));
        assert_eq!(ColumnKind::Int.normalize(Value::BigInt(4)), Value::Int(4));
        assert_eq!(
            ColumnKind::Int.normalize(Value::BigInt(i64::MAX)),
            Value::BigInt(i64::MAX)
        );
        assert_eq!(ColumnKind::Date.normalize(Value::Timestamp(86_400_000_001)), Value::Date(1));
    }

    #[test]
    fn test_normalize_decimal_scale() {
        let kind = ColumnKind::Decimal { scale: 2 };
        assert_eq!(kind.normalize(Value::Text("1.5".into())), Value::Decimal("1.50".into()));
        assert_eq!(kind.normalize(Value::Decimal("2.999".into())), Value::Decimal("2.99".into()));
        assert_eq!(kind.normalize(Value::Int(3)), Value::Decimal("3.00".into()));
    }
}
