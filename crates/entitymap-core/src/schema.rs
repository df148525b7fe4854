//! Static entity metadata.
//!
//! Every entity type is described by one `static` [`EntitySchema`]. Schemas
//! are built with `const fn` builders so they can reference each other
//! through relationships:
//!
//! ```
//! use entitymap_core::{ColumnDef, EntitySchema, ReferencePath, RelationKind};
//!
//! static PARENT: EntitySchema = EntitySchema::new(
//!     "parent",
//!     "parents",
//!     &[ColumnDef::new("id").primary_key(true), ColumnDef::new("name")],
//! )
//! .relations(&[ReferencePath::new("children", "parent", RelationKind::OneToMany, &CHILD)
//!     .foreign_key(&["parent_id"])]);
//!
//! static CHILD: EntitySchema = EntitySchema::new(
//!     "child",
//!     "children",
//!     &[
//!         ColumnDef::new("id").primary_key(true),
//!         ColumnDef::new("parent_id").nullable(true),
//!     ],
//! );
//!
//! assert!(PARENT.validate().is_ok());
//! assert_eq!(PARENT.relation("children").unwrap().target.name, "child");
//! ```

use crate::error::{ConfigError, Error, Result};
use crate::relationship::{ReferencePath, RelationKind};
use crate::value::Value;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Client-side generator for a column default.
pub type ValueGenerator = fn() -> Value;

/// Metadata for one column.
#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    /// Column name
    pub name: &'static str,
    /// Whether NULL is a legal value
    pub nullable: bool,
    /// Part of the primary key
    pub primary_key: bool,
    /// Value assigned by the store on insert
    pub auto_increment: bool,
    /// Value generated on the client when none is supplied
    pub generator: Option<ValueGenerator>,
}

impl ColumnDef {
    /// A plain, non-nullable column.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            nullable: false,
            primary_key: false,
            auto_increment: false,
            generator: None,
        }
    }

    #[must_use]
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    #[must_use]
    pub const fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    #[must_use]
    pub const fn auto_increment(mut self, value: bool) -> Self {
        self.auto_increment = value;
        self
    }

    /// Generate a value on the client when the caller does not supply one.
    #[must_use]
    pub const fn generated_by(mut self, generator: ValueGenerator) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Whether a missing value can be produced without the caller.
    pub const fn has_generation_strategy(&self) -> bool {
        self.auto_increment || self.generator.is_some()
    }
}

/// Static description of an entity type.
#[derive(Debug)]
pub struct EntitySchema {
    /// Entity type tag. Unique per entity type, used in identity keys.
    pub name: &'static str,
    /// Backing table. Several entity types may share a table.
    pub table: &'static str,
    /// Declared columns, in storage order
    pub columns: &'static [ColumnDef],
    /// Relationships leaving this entity
    pub relations: &'static [ReferencePath],
}

impl EntitySchema {
    #[must_use]
    pub const fn new(
        name: &'static str,
        table: &'static str,
        columns: &'static [ColumnDef],
    ) -> Self {
        Self {
            name,
            table,
            columns,
            relations: &[],
        }
    }

    #[must_use]
    pub const fn relations(mut self, relations: &'static [ReferencePath]) -> Self {
        self.relations = relations;
        self
    }

    /// Index of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&'static ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Primary key columns with their storage index, in declared order.
    pub fn primary_key(&self) -> impl Iterator<Item = (usize, &'static ColumnDef)> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
    }

    /// Names of the primary key columns, in declared order.
    pub fn primary_key_names(&self) -> Vec<&'static str> {
        self.primary_key().map(|(_, c)| c.name).collect()
    }

    /// Look up a relationship by name.
    pub fn relation(&self, name: &str) -> Option<&'static ReferencePath> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Check the schema for structural mistakes.
    ///
    /// Verifies identifiers, the presence of a primary key, unique column
    /// names and that every relationship's key columns exist where they are
    /// declared.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        check_identifier(self.name)?;
        check_identifier(self.table)?;

        if !self.columns.iter().any(|c| c.primary_key) {
            return Err(invalid(format!(
                "entity '{}' declares no primary key column",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for col in self.columns {
            check_identifier(col.name)?;
            if !seen.insert(col.name) {
                return Err(invalid(format!(
                    "entity '{}' declares column '{}' twice",
                    self.name, col.name
                )));
            }
        }

        for rel in self.relations {
            self.validate_relation(rel)?;
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn validate_relation(&self, rel: &ReferencePath) -> Result<()> {
        check_identifier(rel.name)?;
        if rel.from_entity != self.name {
            return Err(invalid(format!(
                "relationship '{}' is declared on '{}' but says it starts at '{}'",
                rel.name, self.name, rel.from_entity
            )));
        }

        let source_pk = self.primary_key().count();
        let target_pk = rel.target.primary_key().count();
        let (owner, expected): (&EntitySchema, usize) = match rel.kind {
            RelationKind::ManyToOne => (self, target_pk),
            RelationKind::OneToMany | RelationKind::OneToOneBackRef => (rel.target, source_pk),
            RelationKind::ManyToManyViaJoin => {
                let Some(join) = &rel.join_table else {
                    return Err(invalid(format!(
                        "many-to-many relationship '{}.{}' has no join table",
                        self.name, rel.name
                    )));
                };
                check_identifier(join.table)?;
                if join.source_columns.len() != source_pk
                    || join.target_columns.len() != target_pk
                {
                    return Err(invalid(format!(
                        "join table '{}' columns do not match the primary keys of '{}' and '{}'",
                        join.table, self.name, rel.target.name
                    )));
                }
                return Ok(());
            }
        };

        if rel.foreign_key_columns.len() != expected {
            return Err(invalid(format!(
                "relationship '{}.{}' needs {} foreign key column(s), found {}",
                self.name,
                rel.name,
                expected,
                rel.foreign_key_columns.len()
            )));
        }
        for fk in rel.foreign_key_columns {
            if owner.column_index(fk).is_none() {
                return Err(invalid(format!(
                    "relationship '{}.{}' references missing column '{}.{}'",
                    self.name, rel.name, owner.name, fk
                )));
            }
        }
        for order in rel.order_by {
            if rel.target.column_index(order.column).is_none() {
                return Err(invalid(format!(
                    "relationship '{}.{}' orders by missing column '{}.{}'",
                    self.name, rel.name, rel.target.name, order.column
                )));
            }
        }
        Ok(())
    }
}

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]{0,62}$";

fn identifier_regex() -> Option<&'static Regex> {
    static IDENT: OnceLock<Option<Regex>> = OnceLock::new();
    IDENT
        .get_or_init(|| match Regex::new(IDENTIFIER_PATTERN) {
            Ok(regex) => Some(regex),
            Err(e) => {
                tracing::warn!(
                    pattern = IDENTIFIER_PATTERN,
                    error = %e,
                    "Identifier pattern failed to compile, rejecting all identifiers"
                );
                None
            }
        })
        .as_ref()
}

/// Whether `name` is usable as an entity, table, column or savepoint name.
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_regex().is_some_and(|re| re.is_match(name))
}

#[allow(clippy::result_large_err)]
fn check_identifier(name: &str) -> Result<()> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(invalid(format!("'{}' is not a valid identifier", name)))
    }
}

fn invalid(message: String) -> Error {
    Error::Config(ConfigError {
        message,
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relationship::{JoinTable, OrderBy};

    static AUTHOR: EntitySchema = EntitySchema::new(
        "author",
        "authors",
        &[
            ColumnDef::new("id").primary_key(true).auto_increment(true),
            ColumnDef::new("name"),
        ],
    )
    .relations(&[
        ReferencePath::new("books", "author", RelationKind::OneToMany, &BOOK)
            .foreign_key(&["author_id"])
            .order_by(&[OrderBy::asc("title")]),
        ReferencePath::new("tags", "author", RelationKind::ManyToManyViaJoin, &TAG)
            .join_table(JoinTable::new("author_tags", &["author_id"], &["tag_id"])),
    ]);

    static BOOK: EntitySchema = EntitySchema::new(
        "book",
        "books",
        &[
            ColumnDef::new("id").primary_key(true),
            ColumnDef::new("author_id").nullable(true),
            ColumnDef::new("title"),
        ],
    )
    .relations(&[
        ReferencePath::new("author", "book", RelationKind::ManyToOne, &AUTHOR)
            .foreign_key(&["author_id"]),
    ]);

    static TAG: EntitySchema =
        EntitySchema::new("tag", "tags", &[ColumnDef::new("label").primary_key(true)]);

    static BROKEN_FK: EntitySchema = EntitySchema::new(
        "broken",
        "broken",
        &[ColumnDef::new("id").primary_key(true)],
    )
    .relations(&[
        ReferencePath::new("author", "broken", RelationKind::ManyToOne, &AUTHOR)
            .foreign_key(&["author_id"]),
    ]);

    static NO_PK: EntitySchema = EntitySchema::new("loose", "loose", &[ColumnDef::new("x")]);

    static DUPLICATE: EntitySchema = EntitySchema::new(
        "dup",
        "dup",
        &[ColumnDef::new("id").primary_key(true), ColumnDef::new("id")],
    );

    #[test]
    fn valid_schemas_pass() {
        AUTHOR.validate().unwrap();
        BOOK.validate().unwrap();
        TAG.validate().unwrap();
    }

    #[test]
    fn lookups() {
        assert_eq!(BOOK.column_index("title"), Some(2));
        assert!(BOOK.column("missing").is_none());
        assert_eq!(AUTHOR.primary_key_names(), vec!["id"]);
        assert_eq!(AUTHOR.relation("books").unwrap().target.name, "book");
        assert!(AUTHOR.relation("nope").is_none());
    }

    #[test]
    fn structural_errors() {
        let err = BROKEN_FK.validate().unwrap_err();
        assert!(err.to_string().contains("missing column 'broken.author_id'"));

        let err = NO_PK.validate().unwrap_err();
        assert!(err.to_string().contains("no primary key"));

        let err = DUPLICATE.validate().unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn identifiers() {
        assert!(is_valid_identifier("author_tags"));
        assert!(is_valid_identifier("_x1"));
        assert!(!is_valid_identifier("1abc"));
        assert!(!is_valid_identifier("drop table"));
        assert!(!is_valid_identifier(""));
    }
}
