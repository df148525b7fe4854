//! Typed views over entity records.
//!
//! Records are dynamically typed. The [`Entity`] trait maps a Rust struct to
//! and from a record of one entity type, and [`Column`] constants give
//! typed access to single columns without a full conversion.

use crate::error::{EntityMismatchError, Error, Result};
use crate::record::EntityRecord;
use crate::row::FromValue;
use crate::schema::EntitySchema;
use crate::value::Value;
use std::marker::PhantomData;

/// A Rust type backed by one entity schema.
///
/// # Example
///
/// ```
/// use entitymap_core::{ColumnDef, Entity, EntityRecord, EntitySchema, Result, Value};
///
/// static HERO: EntitySchema = EntitySchema::new(
///     "hero",
///     "heroes",
///     &[ColumnDef::new("id").primary_key(true), ColumnDef::new("name")],
/// );
///
/// struct Hero {
///     id: i64,
///     name: String,
/// }
///
/// impl Entity for Hero {
///     fn schema() -> &'static EntitySchema {
///         &HERO
///     }
///
///     fn from_record(record: &EntityRecord) -> Result<Self> {
///         Ok(Self {
///             id: record.get_as("id")?,
///             name: record.get_as("name")?,
///         })
///     }
///
///     fn to_values(&self) -> Vec<(&'static str, Value)> {
///         vec![("id", self.id.into()), ("name", self.name.clone().into())]
///     }
/// }
///
/// let record = Hero { id: 1, name: "Deadpond".into() }.to_record().unwrap();
/// let hero = Hero::decode(&record).unwrap();
/// assert_eq!(hero.name, "Deadpond");
/// ```
pub trait Entity: Sized + Send + Sync {
    /// The schema this type maps to.
    fn schema() -> &'static EntitySchema;

    /// Build the value from a record of this entity type.
    ///
    /// Callers should go through [`Entity::decode`], which checks the
    /// record's entity tag first.
    #[allow(clippy::result_large_err)]
    fn from_record(record: &EntityRecord) -> Result<Self>;

    /// Column assignments for this value.
    fn to_values(&self) -> Vec<(&'static str, Value)>;

    /// Decode a record, failing with `EntityMismatch` when it belongs to
    /// another entity type (even one sharing the same table).
    #[allow(clippy::result_large_err)]
    fn decode(record: &EntityRecord) -> Result<Self> {
        ensure_entity(Self::schema(), record)?;
        Self::from_record(record)
    }

    /// Build a new (unpersisted) record holding this value.
    #[allow(clippy::result_large_err)]
    fn to_record(&self) -> Result<EntityRecord> {
        EntityRecord::new(Self::schema(), self.to_values())
    }
}

/// Fail with `EntityMismatch` unless `record` is tagged with `schema`.
#[allow(clippy::result_large_err)]
pub fn ensure_entity(schema: &'static EntitySchema, record: &EntityRecord) -> Result<()> {
    if record.entity() == schema.name {
        Ok(())
    } else {
        Err(Error::EntityMismatch(EntityMismatchError {
            expected: schema.name,
            actual: record.entity(),
        }))
    }
}

/// Typed accessor for one column of one entity type.
///
/// ```
/// use entitymap_core::{Column, ColumnDef, EntityRecord, EntitySchema, Value};
///
/// static PET: EntitySchema = EntitySchema::new(
///     "pet",
///     "pets",
///     &[ColumnDef::new("id").primary_key(true), ColumnDef::new("age")],
/// );
/// const AGE: Column<i64> = Column::new(&PET, "age");
///
/// let mut rec = EntityRecord::new(&PET, [("id", Value::from(1_i64))]).unwrap();
/// AGE.set(&mut rec, 4).unwrap();
/// assert_eq!(AGE.get(&rec).unwrap(), 4);
/// ```
pub struct Column<T> {
    schema: &'static EntitySchema,
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Column<T> {
    #[must_use]
    pub const fn new(schema: &'static EntitySchema, name: &'static str) -> Self {
        Self {
            schema,
            name,
            _marker: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn schema(&self) -> &'static EntitySchema {
        self.schema
    }
}

impl<T: FromValue> Column<T> {
    #[allow(clippy::result_large_err)]
    pub fn get(&self, record: &EntityRecord) -> Result<T> {
        ensure_entity(self.schema, record)?;
        record.get_as(self.name)
    }
}

impl<T: Into<Value>> Column<T> {
    #[allow(clippy::result_large_err)]
    pub fn set(&self, record: &mut EntityRecord, value: T) -> Result<()> {
        ensure_entity(self.schema, record)?;
        record.set(self.name, value)
    }
}

impl<T> Clone for Column<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Column<T> {}

impl<T> std::fmt::Debug for Column<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Column({}.{})", self.schema.name, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDef;

    // Two entity types over the same table.
    static ACCOUNT: EntitySchema = EntitySchema::new(
        "account",
        "parties",
        &[ColumnDef::new("id").primary_key(true), ColumnDef::new("name")],
    );

    static VENDOR: EntitySchema = EntitySchema::new(
        "vendor",
        "parties",
        &[ColumnDef::new("id").primary_key(true), ColumnDef::new("name")],
    );

    const ACCOUNT_NAME: Column<String> = Column::new(&ACCOUNT, "name");

    #[derive(Debug)]
    struct Account {
        id: i64,
        name: String,
    }

    impl Entity for Account {
        fn schema() -> &'static EntitySchema {
            &ACCOUNT
        }

        fn from_record(record: &EntityRecord) -> Result<Self> {
            Ok(Self {
                id: record.get_as("id")?,
                name: record.get_as("name")?,
            })
        }

        fn to_values(&self) -> Vec<(&'static str, Value)> {
            vec![("id", self.id.into()), ("name", self.name.clone().into())]
        }
    }

    #[test]
    fn round_trip_through_record() {
        let rec = Account {
            id: 3,
            name: "acme".into(),
        }
        .to_record()
        .unwrap();
        assert_eq!(rec.entity(), "account");
        let back = Account::decode(&rec).unwrap();
        assert_eq!(back.id, 3);
        assert_eq!(ACCOUNT_NAME.get(&rec).unwrap(), "acme");
    }

    #[test]
    fn same_table_other_entity_fails_fast() {
        let vendor = EntityRecord::new(
            &VENDOR,
            [("id", Value::BigInt(3)), ("name", Value::from("acme"))],
        )
        .unwrap();

        let err = Account::decode(&vendor).unwrap_err();
        match err {
            Error::EntityMismatch(e) => {
                assert_eq!(e.expected, "account");
                assert_eq!(e.actual, "vendor");
            }
            other => panic!("expected EntityMismatch, got {other:?}"),
        }

        let mut vendor = vendor;
        assert!(matches!(
            ACCOUNT_NAME.set(&mut vendor, "x".to_string()),
            Err(Error::EntityMismatch(_))
        ));
    }
}
