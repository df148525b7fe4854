//! Identity keys.
//!
//! An [`IdentityKey`] names one row of one entity type: the entity tag plus
//! the primary key components in declared column order. Two keys are equal
//! when the tag matches and every component compares equal by value, which
//! makes them usable as `HashMap`/`BTreeMap` keys for the identity map.

use crate::error::{ColumnError, Error, KeyError, Result};
use crate::schema::EntitySchema;
use crate::value::Value;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Unique identity of one row within an entity type.
///
/// The key remembers the schema it was built from; equality, ordering and
/// hashing only look at the entity tag and the components.
#[derive(Clone, Serialize)]
pub struct IdentityKey {
    #[serde(skip)]
    schema: &'static EntitySchema,
    entity: &'static str,
    components: Vec<(&'static str, Value)>,
}

impl IdentityKey {
    /// Build a key from named components.
    ///
    /// Components may be given in any order; they are stored in declared
    /// primary-key order. A missing (or NULL) component is filled by the
    /// column's client generator, left pending for auto-increment columns,
    /// and rejected with `InvalidKey` otherwise. Naming a component twice is
    /// an `InvalidKey` error.
    #[allow(clippy::result_large_err)]
    pub fn new<'a>(
        schema: &'static EntitySchema,
        components: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<Self> {
        let mut supplied: Vec<(&'static str, Value)> = Vec::new();
        for (name, value) in components {
            let Some(col) = schema.column(name) else {
                return Err(Error::UnknownColumn(ColumnError {
                    entity: schema.name,
                    column: name.to_string(),
                }));
            };
            if !col.primary_key {
                return Err(Error::InvalidKey(KeyError {
                    entity: schema.name,
                    column: Some(col.name),
                    message: "column is not part of the primary key".to_string(),
                }));
            }
            if supplied.iter().any(|(seen, _)| *seen == col.name) {
                return Err(Error::InvalidKey(KeyError {
                    entity: schema.name,
                    column: Some(col.name),
                    message: "component supplied more than once".to_string(),
                }));
            }
            supplied.push((col.name, value));
        }

        let mut ordered = Vec::with_capacity(supplied.len());
        for (_, col) in schema.primary_key() {
            let value = supplied
                .iter()
                .position(|(name, _)| *name == col.name)
                .map(|idx| supplied.swap_remove(idx).1)
                .filter(|v| !v.is_null());
            let value = match value {
                Some(v) => v.canonical(),
                None => match col.generator {
                    Some(generate) => generate().canonical(),
                    None if col.auto_increment => Value::Default,
                    None => {
                        return Err(Error::InvalidKey(KeyError {
                            entity: schema.name,
                            column: Some(col.name),
                            message: "missing identity value and no generation strategy"
                                .to_string(),
                        }));
                    }
                },
            };
            ordered.push((col.name, value));
        }

        Ok(Self {
            schema,
            entity: schema.name,
            components: ordered,
        })
    }

    /// Key for an entity with a single-column primary key.
    #[allow(clippy::result_large_err)]
    pub fn single(schema: &'static EntitySchema, value: impl Into<Value>) -> Result<Self> {
        let mut pk = schema.primary_key();
        match (pk.next(), pk.next()) {
            (Some((_, col)), None) => Self::new(schema, [(col.name, value.into())]),
            _ => Err(Error::InvalidKey(KeyError {
                entity: schema.name,
                column: None,
                message: format!(
                    "expected a single-column primary key, found {} columns",
                    schema.primary_key().count()
                ),
            })),
        }
    }

    /// Extract the key from a full row of values in storage order.
    #[allow(clippy::result_large_err)]
    pub fn from_values(schema: &'static EntitySchema, values: &[Value]) -> Result<Self> {
        Self::new(
            schema,
            schema
                .primary_key()
                .map(|(idx, col)| (col.name, values.get(idx).cloned().unwrap_or(Value::Null))),
        )
    }

    /// The entity type tag.
    pub fn entity(&self) -> &'static str {
        self.entity
    }

    /// Schema of the entity type this key belongs to.
    pub fn schema(&self) -> &'static EntitySchema {
        self.schema
    }

    /// Components in declared primary-key order.
    pub fn components(&self) -> &[(&'static str, Value)] {
        &self.components
    }

    /// Component values in declared primary-key order.
    pub fn values(&self) -> Vec<Value> {
        self.components.iter().map(|(_, v)| v.clone()).collect()
    }

    /// Value of one component.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.components
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, v)| v)
    }

    /// Whether a component still waits for a store-generated value.
    pub fn is_pending(&self) -> bool {
        self.components.iter().any(|(_, v)| v.is_default())
    }

    /// Whether this key belongs to `schema`.
    pub fn is_of(&self, schema: &EntitySchema) -> bool {
        self.entity == schema.name
    }
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IdentityKey {}

impl PartialOrd for IdentityKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IdentityKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.entity.cmp(other.entity).then_with(|| {
            let mut lhs = self.components.iter();
            let mut rhs = other.components.iter();
            loop {
                match (lhs.next(), rhs.next()) {
                    (None, None) => return Ordering::Equal,
                    (None, Some(_)) => return Ordering::Less,
                    (Some(_), None) => return Ordering::Greater,
                    (Some((ln, lv)), Some((rn, rv))) => {
                        let ord = ln.cmp(rn).then_with(|| lv.total_cmp(rv));
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                }
            }
        })
    }
}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.components.len().hash(state);
        for (name, value) in &self.components {
            name.hash(state);
            value.hash_into(state);
        }
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKey")
            .field("entity", &self.entity)
            .field("components", &self.components)
            .finish()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.entity)?;
        for (i, (name, value)) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        write!(f, ")")
    }
}
