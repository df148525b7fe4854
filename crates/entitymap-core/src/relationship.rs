//! Relationship metadata.
//!
//! A [`ReferencePath`] describes one navigable step from an entity to a
//! related entity. Eager loading walks these steps level by level.

use crate::schema::EntitySchema;
use std::fmt;

/// The shape of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Many-to-one: the source row holds the foreign key to the target's primary key.
    ManyToOne,
    /// One-to-many: target rows hold a foreign key to the source's primary key.
    OneToMany,
    /// One-to-one seen from the referenced side: at most one target row points back.
    OneToOneBackRef,
    /// Many-to-many through a join table.
    ManyToManyViaJoin,
}

impl RelationKind {
    /// Whether navigation yields at most one record.
    pub const fn is_single(self) -> bool {
        matches!(self, RelationKind::ManyToOne | RelationKind::OneToOneBackRef)
    }
}

/// Join table linking two entities for `ManyToManyViaJoin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinTable {
    /// Join table name
    pub table: &'static str,
    /// Columns referencing the source primary key, in its declared order
    pub source_columns: &'static [&'static str],
    /// Columns referencing the target primary key, in its declared order
    pub target_columns: &'static [&'static str],
}

impl JoinTable {
    #[must_use]
    pub const fn new(
        table: &'static str,
        source_columns: &'static [&'static str],
        target_columns: &'static [&'static str],
    ) -> Self {
        Self {
            table,
            source_columns,
            target_columns,
        }
    }
}

/// Sort direction for relationship ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// One ordering term applied to a relationship's result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    /// Column on the target entity
    pub column: &'static str,
    pub direction: SortDirection,
}

impl OrderBy {
    #[must_use]
    pub const fn asc(column: &'static str) -> Self {
        Self {
            column,
            direction: SortDirection::Asc,
        }
    }

    #[must_use]
    pub const fn desc(column: &'static str) -> Self {
        Self {
            column,
            direction: SortDirection::Desc,
        }
    }
}

/// Declarative description of one eager-load step.
///
/// `foreign_key_columns` live on the source entity for `ManyToOne` and on
/// the target entity for `OneToMany` / `OneToOneBackRef`; in both cases they
/// line up with the referenced primary key in declared order. Many-to-many
/// steps use the join table instead.
#[derive(Clone, Copy)]
pub struct ReferencePath {
    /// Relationship name, unique on the source entity
    pub name: &'static str,
    /// Entity type the step starts from
    pub from_entity: &'static str,
    pub kind: RelationKind,
    /// Entity the step arrives at
    pub target: &'static EntitySchema,
    pub foreign_key_columns: &'static [&'static str],
    pub join_table: Option<JoinTable>,
    /// Ordering applied when the result set is cached
    pub order_by: &'static [OrderBy],
}

impl ReferencePath {
    #[must_use]
    pub const fn new(
        name: &'static str,
        from_entity: &'static str,
        kind: RelationKind,
        target: &'static EntitySchema,
    ) -> Self {
        Self {
            name,
            from_entity,
            kind,
            target,
            foreign_key_columns: &[],
            join_table: None,
            order_by: &[],
        }
    }

    #[must_use]
    pub const fn foreign_key(mut self, columns: &'static [&'static str]) -> Self {
        self.foreign_key_columns = columns;
        self
    }

    #[must_use]
    pub const fn join_table(mut self, join: JoinTable) -> Self {
        self.join_table = Some(join);
        self
    }

    #[must_use]
    pub const fn order_by(mut self, order: &'static [OrderBy]) -> Self {
        self.order_by = order;
        self
    }
}

// Schemas reference each other through relationships, so only the target's
// name is printed.
impl fmt::Debug for ReferencePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferencePath")
            .field("name", &self.name)
            .field("from_entity", &self.from_entity)
            .field("kind", &self.kind)
            .field("target", &self.target.name)
            .field("foreign_key_columns", &self.foreign_key_columns)
            .field("join_table", &self.join_table)
            .field("order_by", &self.order_by)
            .finish()
    }
}
